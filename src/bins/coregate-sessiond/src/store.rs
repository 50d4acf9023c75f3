//! Session store
//!
//! Sole owner of all session objects. The enforcer works on read-out
//! copies and journals its mutations; `update_sessions` commits each
//! journal atomically onto the authoritative copy via
//! `apply_update_criteria`, discarding journals whose merge
//! preconditions fail.

use std::collections::{HashMap, HashSet};
use std::sync::RwLock;

use crate::session::SessionState;
use crate::stored::{SessionStateUpdateCriteria, StoredSessionState};

/// All sessions, keyed by IMSI; one subscriber may hold several sessions
pub type SessionMap = HashMap<String, Vec<SessionState>>;

/// Journals per IMSI and session id for one enforcement pass
pub type SessionUpdate = HashMap<String, HashMap<String, SessionStateUpdateCriteria>>;

/// Set of IMSIs to read
pub type SessionRead = HashSet<String>;

/// One empty journal per session in the map
pub fn default_session_update(session_map: &SessionMap) -> SessionUpdate {
    let mut update = SessionUpdate::new();
    for (imsi, sessions) in session_map {
        let per_imsi = update.entry(imsi.clone()).or_default();
        for session in sessions {
            per_imsi.insert(
                session.session_id().to_string(),
                SessionStateUpdateCriteria::default(),
            );
        }
    }
    update
}

/// Fetch (or create) the journal for one session
pub fn session_uc<'a>(
    update: &'a mut SessionUpdate,
    imsi: &str,
    session_id: &str,
) -> &'a mut SessionStateUpdateCriteria {
    update
        .entry(imsi.to_string())
        .or_default()
        .entry(session_id.to_string())
        .or_default()
}

/// Owner of all session state
#[derive(Debug, Default)]
pub struct SessionStore {
    sessions: RwLock<SessionMap>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a freshly created session
    pub fn create_session(&self, imsi: &str, session: SessionState) {
        if let Ok(mut sessions) = self.sessions.write() {
            sessions
                .entry(imsi.to_string())
                .or_default()
                .push(session);
        }
    }

    /// Copies of the sessions for the requested IMSIs
    pub fn read_sessions(&self, req: &SessionRead) -> SessionMap {
        let mut out = SessionMap::new();
        if let Ok(sessions) = self.sessions.read() {
            for imsi in req {
                if let Some(list) = sessions.get(imsi) {
                    out.insert(imsi.clone(), list.clone());
                }
            }
        }
        out
    }

    /// Copies of every session
    pub fn read_all_sessions(&self) -> SessionMap {
        self.sessions
            .read()
            .map(|sessions| sessions.clone())
            .unwrap_or_default()
    }

    /// Read sessions that are about to be deleted; same view as
    /// `read_sessions`, deletion happens at commit
    pub fn read_sessions_for_deletion(&self, req: &SessionRead) -> SessionMap {
        self.read_sessions(req)
    }

    /// Copy of one session
    pub fn get_session(&self, imsi: &str, session_id: &str) -> Option<SessionState> {
        self.sessions.read().ok().and_then(|sessions| {
            sessions
                .get(imsi)?
                .iter()
                .find(|session| session.session_id() == session_id)
                .cloned()
        })
    }

    pub fn session_count(&self) -> usize {
        self.sessions
            .read()
            .map(|sessions| sessions.values().map(Vec::len).sum())
            .unwrap_or(0)
    }

    /// Marshalled snapshot of every session, for persistence
    pub fn snapshot(&self) -> Vec<StoredSessionState> {
        self.sessions
            .read()
            .map(|sessions| {
                sessions
                    .values()
                    .flat_map(|list| list.iter().map(SessionState::marshal))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Commit one pass of journals. Each journal is applied atomically
    /// to its authoritative session; a merge precondition violation
    /// discards that journal. `is_session_ended` removes the session.
    /// Returns false if any journal could not be applied.
    pub fn update_sessions(&self, update: SessionUpdate) -> bool {
        let mut all_ok = true;
        let mut sessions = match self.sessions.write() {
            Ok(sessions) => sessions,
            Err(_) => return false,
        };
        for (imsi, per_session) in update {
            for (session_id, uc) in per_session {
                let list = match sessions.get_mut(&imsi) {
                    Some(list) => list,
                    None => {
                        log::debug!("No session for {imsi} while committing updates");
                        continue;
                    }
                };
                if uc.is_session_ended {
                    list.retain(|session| session.session_id() != session_id);
                    log::debug!("Session {session_id} removed for {imsi}");
                    continue;
                }
                match list
                    .iter_mut()
                    .find(|session| session.session_id() == session_id)
                {
                    Some(session) => {
                        if !session.apply_update_criteria(&uc) {
                            log::error!(
                                "Failed to commit journal for session {session_id}, discarding"
                            );
                            all_ok = false;
                        }
                    }
                    None => log::debug!("Session {session_id} not found while committing"),
                }
            }
        }
        // drop IMSIs whose last session ended
        sessions.retain(|_, list| !list.is_empty());
        all_ok
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use cg_proto::SessionConfig;

    use crate::rules::StaticRuleStore;
    use crate::stored::SessionFsmState;

    fn session(imsi: &str, session_id: &str) -> SessionState {
        SessionState::new(
            imsi,
            session_id,
            SessionConfig::default(),
            Arc::new(StaticRuleStore::new()),
            0,
        )
    }

    #[test]
    fn test_create_and_read() {
        let store = SessionStore::new();
        store.create_session("IMSI001", session("IMSI001", "s1"));
        store.create_session("IMSI002", session("IMSI002", "s2"));

        assert_eq!(store.session_count(), 2);
        let map = store.read_sessions(&SessionRead::from(["IMSI001".to_string()]));
        assert_eq!(map.len(), 1);
        assert!(store.get_session("IMSI001", "s1").is_some());
        assert!(store.get_session("IMSI001", "nope").is_none());
    }

    #[test]
    fn test_commit_fsm_update() {
        let store = SessionStore::new();
        store.create_session("IMSI001", session("IMSI001", "s1"));

        let map = store.read_all_sessions();
        let mut update = default_session_update(&map);
        let uc = session_uc(&mut update, "IMSI001", "s1");
        uc.is_fsm_updated = true;
        uc.updated_fsm_state = SessionFsmState::Released;
        assert!(store.update_sessions(update));

        let stored = store.get_session("IMSI001", "s1").unwrap();
        assert_eq!(stored.get_state(), SessionFsmState::Released);
    }

    #[test]
    fn test_commit_session_end_removes() {
        let store = SessionStore::new();
        store.create_session("IMSI001", session("IMSI001", "s1"));

        let mut update = SessionUpdate::new();
        session_uc(&mut update, "IMSI001", "s1").is_session_ended = true;
        assert!(store.update_sessions(update));
        assert_eq!(store.session_count(), 0);
        assert!(store.read_all_sessions().is_empty());
    }

    #[test]
    fn test_failed_merge_reports_failure() {
        let store = SessionStore::new();
        store.create_session("IMSI001", session("IMSI001", "s1"));

        let mut update = SessionUpdate::new();
        // journal uninstalls a rule that was never installed
        session_uc(&mut update, "IMSI001", "s1")
            .static_rules_to_uninstall
            .insert("ghost".to_string());
        assert!(!store.update_sessions(update));
    }

    #[test]
    fn test_request_number_strictly_increases_across_commits() {
        let store = SessionStore::new();
        store.create_session("IMSI001", session("IMSI001", "s1"));

        for expected in 2..5u32 {
            let mut update = SessionUpdate::new();
            session_uc(&mut update, "IMSI001", "s1").request_number_increment = 1;
            assert!(store.update_sessions(update));
            let stored = store.get_session("IMSI001", "s1").unwrap();
            assert_eq!(stored.get_request_number(), expected);
        }
    }
}
