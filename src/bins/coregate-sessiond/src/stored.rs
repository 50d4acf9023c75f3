//! Stored session forms and the update-criteria journal
//!
//! The session store owns sessions in their stored form; the enforcer
//! works on mutable copies and records every intended mutation in a
//! `SessionStateUpdateCriteria` journal. On success the journal is
//! committed back to the store as one atomic merge; on failure it is
//! discarded, which gives multi-field updates without in-place rollback.

use std::collections::{HashMap, HashSet};

use cg_proto::{
    CreditKey, CreditLimitType, EventTrigger, GrantedUnits, PolicyRule, SessionConfig,
    SubscriberQuotaState,
};
use serde::{Deserialize, Serialize};

use crate::credit::{GrantTrackingType, BUCKET_COUNT};
use crate::grant::{FinalActionInfo, ReAuthState, ServiceState};
use crate::rules::RuleLifetime;

// ============================================================================
// Session FSM
// ============================================================================

/// Lifecycle state of a session.
///
/// ACTIVE goes to TERMINATION_SCHEDULED when teardown is deferred, and to
/// RELEASED once the data-plane rules are removed. RELEASED becomes
/// TERMINATED when the final report is sent (or the forced-termination
/// timer fires). TERMINATED is absorbing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionFsmState {
    Active,
    TerminationScheduled,
    Released,
    Terminated,
}

impl Default for SessionFsmState {
    fn default() -> Self {
        SessionFsmState::Active
    }
}

/// State of a pending event trigger
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventTriggerState {
    /// Trigger installed
    Pending,
    /// Ready to be reported on
    Ready,
    /// Successfully reported
    Cleared,
}

/// Whether a rule id refers to the static registry or a pushed rule
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PolicyType {
    Static,
    Dynamic,
}

/// Identity of a policy for the bearer map
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PolicyId {
    pub policy_type: PolicyType,
    pub rule_id: String,
}

impl PolicyId {
    pub fn new(policy_type: PolicyType, rule_id: &str) -> Self {
        Self {
            policy_type,
            rule_id: rule_id.to_string(),
        }
    }
}

// ============================================================================
// Stored forms
// ============================================================================

/// Durable form of a `SessionCredit`
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct StoredSessionCredit {
    pub reporting: bool,
    pub credit_limit_type: CreditLimitType,
    pub buckets: [u64; BUCKET_COUNT],
    pub grant_tracking_type: GrantTrackingType,
    pub received_granted_units: GrantedUnits,
}

/// Durable form of a `ChargingGrant`
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct StoredChargingGrant {
    pub credit: StoredSessionCredit,
    pub is_final: bool,
    pub final_action_info: FinalActionInfo,
    pub reauth_state: ReAuthState,
    pub service_state: ServiceState,
    pub expiry_time: u64,
}

/// Durable form of a `Monitor`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredMonitor {
    pub credit: StoredSessionCredit,
    pub level: cg_proto::MonitoringLevel,
}

/// Durable form of a whole session. Maps with non-string keys are stored
/// as pair lists so the JSON encoding stays plain.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoredSessionState {
    pub fsm_state: SessionFsmState,
    pub config: SessionConfig,
    pub imsi: String,
    pub session_id: String,
    pub request_number: u32,
    pub pdp_start_time: u64,
    pub pdp_end_time: u64,
    pub subscriber_quota_state: SubscriberQuotaState,
    pub credit_map: Vec<(CreditKey, StoredChargingGrant)>,
    pub monitor_map: HashMap<String, StoredMonitor>,
    pub session_level_key: String,
    pub static_rule_ids: Vec<String>,
    pub dynamic_rules: Vec<PolicyRule>,
    pub gy_dynamic_rules: Vec<PolicyRule>,
    pub scheduled_static_rules: Vec<String>,
    pub scheduled_dynamic_rules: Vec<PolicyRule>,
    pub restrict_rules: Vec<String>,
    pub rule_lifetimes: HashMap<String, RuleLifetime>,
    pub pending_event_triggers: Vec<(EventTrigger, EventTriggerState)>,
    pub revalidation_time: u64,
    pub bearer_id_by_policy: Vec<(PolicyId, u32)>,
}

// ============================================================================
// Update criteria
// ============================================================================

/// Per-credit diff of one enforcement pass. The reporting buckets are
/// never journalled as deltas; the reporting flag is carried instead.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionCreditUpdateCriteria {
    // maintained by the charging grant
    pub is_final: bool,
    pub final_action_info: FinalActionInfo,
    pub reauth_state: ReAuthState,
    pub service_state: ServiceState,
    pub expiry_time: u64,

    // maintained by the credit
    pub reporting: bool,
    pub grant_tracking_type: GrantTrackingType,
    pub received_granted_units: GrantedUnits,
    pub bucket_deltas: [u64; BUCKET_COUNT],

    /// The credit was deleted during this pass
    pub deleted: bool,
}

impl Default for SessionCreditUpdateCriteria {
    fn default() -> Self {
        Self {
            is_final: false,
            final_action_info: FinalActionInfo::default(),
            reauth_state: ReAuthState::NotNeeded,
            service_state: ServiceState::Enabled,
            expiry_time: 0,
            reporting: false,
            grant_tracking_type: GrantTrackingType::TrackingUnset,
            received_granted_units: GrantedUnits::default(),
            bucket_deltas: [0; BUCKET_COUNT],
            deleted: false,
        }
    }
}

/// Journal of every intended mutation to one session during one
/// enforcement pass, committed all-or-nothing into the session store.
#[derive(Debug, Clone, Default)]
pub struct SessionStateUpdateCriteria {
    pub is_session_ended: bool,

    pub is_config_updated: bool,
    pub updated_config: SessionConfig,

    pub is_fsm_updated: bool,
    pub updated_fsm_state: SessionFsmState,

    pub is_pending_event_triggers_updated: bool,
    pub pending_event_triggers: HashMap<EventTrigger, EventTriggerState>,
    /// Only meaningful when the revalidation trigger is among the updates
    pub revalidation_time: u64,

    pub request_number_increment: u32,
    pub updated_pdp_end_time: u64,

    pub static_rules_to_install: HashSet<String>,
    pub static_rules_to_uninstall: HashSet<String>,
    pub new_scheduled_static_rules: HashSet<String>,
    pub dynamic_rules_to_install: Vec<PolicyRule>,
    pub dynamic_rules_to_uninstall: HashSet<String>,
    pub new_scheduled_dynamic_rules: Vec<PolicyRule>,
    pub gy_dynamic_rules_to_install: Vec<PolicyRule>,
    pub gy_dynamic_rules_to_uninstall: HashSet<String>,
    pub restrict_rules_to_install: HashSet<String>,
    pub restrict_rules_to_uninstall: HashSet<String>,
    pub new_rule_lifetimes: HashMap<String, RuleLifetime>,

    pub charging_credit_to_install: HashMap<CreditKey, StoredChargingGrant>,
    pub charging_credit_map: HashMap<CreditKey, SessionCreditUpdateCriteria>,

    pub is_session_level_key_updated: bool,
    pub updated_session_level_key: String,
    pub monitor_credit_to_install: HashMap<String, StoredMonitor>,
    pub monitor_credit_map: HashMap<String, SessionCreditUpdateCriteria>,

    pub updated_subscriber_quota_state: Option<SubscriberQuotaState>,

    pub is_bearer_mapping_updated: bool,
    /// Only valid when `is_bearer_mapping_updated` is set
    pub bearer_id_by_policy: HashMap<PolicyId, u32>,
}

/// Fresh, empty journal
pub fn default_update_criteria() -> SessionStateUpdateCriteria {
    SessionStateUpdateCriteria::default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_journal_is_empty() {
        let uc = default_update_criteria();
        assert!(!uc.is_session_ended);
        assert!(!uc.is_fsm_updated);
        assert_eq!(uc.request_number_increment, 0);
        assert!(uc.static_rules_to_install.is_empty());
        assert!(uc.charging_credit_map.is_empty());
    }

    #[test]
    fn test_stored_session_json_round_trip() {
        let stored = StoredSessionState {
            imsi: "IMSI001".to_string(),
            session_id: "s1".to_string(),
            request_number: 4,
            fsm_state: SessionFsmState::Released,
            credit_map: vec![(CreditKey::new(10), StoredChargingGrant::default())],
            bearer_id_by_policy: vec![(PolicyId::new(PolicyType::Dynamic, "r1"), 7)],
            pending_event_triggers: vec![(
                cg_proto::EventTrigger::RevalidationTimeout,
                EventTriggerState::Pending,
            )],
            ..Default::default()
        };
        let encoded = serde_json::to_string(&stored).unwrap();
        let decoded: StoredSessionState = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded.imsi, "IMSI001");
        assert_eq!(decoded.fsm_state, SessionFsmState::Released);
        assert_eq!(decoded.credit_map.len(), 1);
        assert_eq!(decoded.bearer_id_by_policy[0].1, 7);
    }
}
