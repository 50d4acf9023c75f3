//! CoreGate shared protocol types
//!
//! Plain-struct renditions of the messages exchanged between the session
//! enforcement engine and its collaborators: the policy/charging cloud,
//! the data-plane service, the directory service and the access network
//! (MME / AAA). The structs are serde-serializable so that the session
//! store can persist them; no wire-level encoding is defined here.

pub mod messages;
pub mod policy;
pub mod types;

pub use messages::*;
pub use policy::*;
pub use types::*;
