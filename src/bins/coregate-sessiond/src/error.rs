//! Engine error types

use thiserror::Error;

/// Errors surfaced by the enforcement engine
#[derive(Error, Debug)]
pub enum SessionError {
    /// No session exists for the given subscriber
    #[error("no session found for {imsi}")]
    SessionNotFound {
        /// Subscriber identity
        imsi: String,
    },

    /// A journal could not be merged into the stored session
    #[error("update criteria merge failed for session {session_id}")]
    MergeFailed {
        /// Session the journal targeted
        session_id: String,
    },
}
