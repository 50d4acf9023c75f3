//! Service actions
//!
//! A `ServiceAction` tells the enforcer what to do with a subscriber's
//! service for one charging key: keep going, activate, terminate,
//! redirect or restrict. Actions are produced while collecting updates
//! and applied to the data plane independently of the cloud round-trip.

use cg_proto::{AggregatedMaximumBitrate, CreditKey, PolicyRule, RedirectServer};

/// What to do with the service of one charging key
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceActionType {
    ContinueService,
    TerminateService,
    ActivateService,
    Redirect,
    RestrictAccess,
}

/// One action to take on a subscriber's service, with everything the
/// data plane needs to enforce it
#[derive(Debug, Clone)]
pub struct ServiceAction {
    pub action_type: ServiceActionType,
    pub imsi: String,
    pub session_id: String,
    pub ip_addr: String,
    pub credit_key: Option<CreditKey>,
    pub ambr: Option<AggregatedMaximumBitrate>,
    /// Static rules attached to the charging key
    pub rule_ids: Vec<String>,
    /// Dynamic rules attached to the charging key
    pub rule_definitions: Vec<PolicyRule>,
    /// Redirect target, for REDIRECT actions
    pub redirect_server: Option<RedirectServer>,
    /// Restrict rule ids, for RESTRICT_ACCESS actions
    pub restrict_rule_ids: Vec<String>,
}

impl ServiceAction {
    pub fn new(action_type: ServiceActionType) -> Self {
        Self {
            action_type,
            imsi: String::new(),
            session_id: String::new(),
            ip_addr: String::new(),
            credit_key: None,
            ambr: None,
            rule_ids: Vec::new(),
            rule_definitions: Vec::new(),
            redirect_server: None,
            restrict_rule_ids: Vec::new(),
        }
    }
}
