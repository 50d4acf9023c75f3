//! CoreGate sessiond
//!
//! Per-subscriber session enforcement engine for the CoreGate LTE/WiFi
//! packet-core gateway. For every attached subscriber the engine tracks a
//! live packet-data session: the policy rules installed in the data plane,
//! the credit grants authorising traffic against those rules, the usage
//! reported back to the policy/charging cloud, and the session lifecycle
//! from activation through termination.
//!
//! # Architecture
//!
//! - Credit accounting primitives (`credit`, `grant`, `monitor`)
//! - Rule stores with lifetime windows (`rules`)
//! - The per-session aggregate and its durable form (`session`, `stored`)
//! - The session store with atomic journal commits (`store`)
//! - The enforcer orchestrating usage aggregation, credit refill,
//!   termination, reauth and bearer binding (`enforcer`)
//! - Capability traits for the external collaborators (`clients`)

pub mod actions;
pub mod clients;
pub mod config;
pub mod credit;
pub mod enforcer;
pub mod error;
pub mod grant;
pub mod metrics;
pub mod monitor;
pub mod rules;
pub mod session;
pub mod store;
pub mod stored;
pub mod timer;
