//! Request and response messages
//!
//! Messages exchanged with the policy/charging cloud (session create /
//! update / terminate, reauth), with the data-plane service (rule records,
//! flow setup) and with the SPGW for dedicated-bearer management.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::policy::{PolicyRule, RedirectServer};
use crate::types::{EventTrigger, RatType, SubscriberQuotaState};

// ============================================================================
// Granted units
// ============================================================================

/// One volume grant in a single dimension
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CreditUnit {
    /// Whether this dimension was granted at all
    pub is_valid: bool,
    /// Granted volume in bytes
    pub volume: u64,
}

impl CreditUnit {
    /// A valid unit carrying `volume` bytes
    pub fn valid(volume: u64) -> Self {
        Self {
            is_valid: true,
            volume,
        }
    }
}

/// Volume grant across total/tx/rx dimensions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct GrantedUnits {
    pub total: CreditUnit,
    pub tx: CreditUnit,
    pub rx: CreditUnit,
}

impl GrantedUnits {
    /// A total-only grant
    pub fn total_only(volume: u64) -> Self {
        Self {
            total: CreditUnit::valid(volume),
            ..Default::default()
        }
    }

    /// True if any valid dimension carries a non-zero volume
    pub fn contains_credit(&self) -> bool {
        (self.total.is_valid && self.total.volume > 0)
            || (self.tx.is_valid && self.tx.volume > 0)
            || (self.rx.is_valid && self.rx.volume > 0)
    }
}

// ============================================================================
// Charging
// ============================================================================

/// Final-unit action carried with the last grant for a key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FinalAction {
    /// Tear the service down on exhaustion
    Terminate,
    /// Redirect traffic to a captive portal
    Redirect,
    /// Restrict traffic to an enumerated rule set
    RestrictAccess,
}

impl Default for FinalAction {
    fn default() -> Self {
        FinalAction::Terminate
    }
}

/// Credit limit type of a rating group
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CreditLimitType {
    /// Ordinary metered credit
    Finite,
    /// Unlimited, usage still reported
    InfiniteMetered,
    /// Unlimited, usage not reported
    InfiniteUnmetered,
}

impl Default for CreditLimitType {
    fn default() -> Self {
        CreditLimitType::Finite
    }
}

/// A charging grant from the cloud
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ChargingCredit {
    /// Granted volumes
    pub granted_units: GrantedUnits,
    /// Seconds the grant stays valid; 0 means no validity bound
    pub validity_time: u64,
    /// Final-unit indication
    pub is_final: bool,
    /// Action on exhaustion of a final grant
    pub final_action: FinalAction,
    /// Redirect target, meaningful for `FinalAction::Redirect`
    pub redirect_server: Option<RedirectServer>,
    /// Restrict rule ids, meaningful for `FinalAction::RestrictAccess`
    pub restrict_rules: Vec<String>,
}

/// Per-key charging response inside a create/update session response
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CreditUpdateResponse {
    /// Whether the key-level request succeeded
    pub success: bool,
    /// Subscriber identity
    pub sid: String,
    /// Session this response targets
    pub session_id: String,
    /// Rating group of the key
    pub charging_key: u32,
    /// Optional service identifier of the key
    pub service_identifier: Option<u32>,
    /// The grant itself
    pub credit: ChargingCredit,
    /// Credit limit type of the key
    pub limit_type: CreditLimitType,
    /// Result code on failure (vendor/diameter code)
    pub result_code: u32,
}

impl CreditUpdateResponse {
    /// The charging key this response addresses
    pub fn credit_key(&self) -> crate::types::CreditKey {
        crate::types::CreditKey {
            rating_group: self.charging_key,
            service_identifier: self.service_identifier,
        }
    }

    /// True for the infinite credit limit types
    pub fn is_infinite_credit(&self) -> bool {
        matches!(
            self.limit_type,
            CreditLimitType::InfiniteMetered | CreditLimitType::InfiniteUnmetered
        )
    }
}

/// Why a credit usage report is being sent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CreditUsageType {
    QuotaExhausted,
    ValidityTimerExpired,
    ReauthRequired,
    Terminated,
}

/// Usage reported against one charging key
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreditUsage {
    /// Rating group
    pub charging_key: u32,
    /// Optional service identifier
    pub service_identifier: Option<u32>,
    /// Transmitted bytes
    pub bytes_tx: u64,
    /// Received bytes
    pub bytes_rx: u64,
    /// Trigger of this report
    pub update_type: CreditUsageType,
}

/// One credit usage report plus the session identity fields
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreditUsageUpdate {
    pub sid: String,
    pub session_id: String,
    pub request_number: u32,
    pub msisdn: String,
    pub ue_ipv4: String,
    pub apn: String,
    pub rat_type: Option<RatType>,
    pub spgw_ipv4: String,
    pub imei: String,
    pub plmn_id: String,
    pub imsi_plmn_id: String,
    pub user_location: String,
    pub hardware_addr: String,
    pub usage: CreditUsage,
}

// ============================================================================
// Monitoring
// ============================================================================

/// Scope of a usage monitor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MonitoringLevel {
    /// Tracks the whole session
    SessionLevel,
    /// Tracks the rules carrying the monitoring key
    RuleLevel,
}

/// Cloud instruction on a monitor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MonitorAction {
    /// Keep monitoring
    Continue,
    /// Stop monitoring this key
    Disable,
}

/// A usage-monitoring grant from the cloud
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageMonitoringCredit {
    pub action: MonitorAction,
    pub monitoring_key: String,
    pub level: MonitoringLevel,
    pub granted_units: GrantedUnits,
}

/// Per-key monitoring response inside a create/update session response
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageMonitoringUpdateResponse {
    pub success: bool,
    pub sid: String,
    pub session_id: String,
    /// Absent when the response only carries event triggers / rule changes
    pub credit: Option<UsageMonitoringCredit>,
    pub result_code: u32,
    /// Rule ids to remove from the session
    pub rules_to_remove: Vec<String>,
    pub static_rules_to_install: Vec<StaticRuleInstall>,
    pub dynamic_rules_to_install: Vec<DynamicRuleInstall>,
    pub event_triggers: Vec<EventTrigger>,
    /// Epoch seconds; meaningful when RevalidationTimeout is armed
    pub revalidation_time: u64,
}

impl Default for UsageMonitoringUpdateResponse {
    fn default() -> Self {
        Self {
            success: true,
            sid: String::new(),
            session_id: String::new(),
            credit: None,
            result_code: 0,
            rules_to_remove: Vec::new(),
            static_rules_to_install: Vec::new(),
            dynamic_rules_to_install: Vec::new(),
            event_triggers: Vec::new(),
            revalidation_time: 0,
        }
    }
}

/// Usage reported against one monitoring key
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageMonitorUpdate {
    pub monitoring_key: String,
    pub level: MonitoringLevel,
    pub bytes_tx: u64,
    pub bytes_rx: u64,
}

/// One usage-monitor report plus the session identity fields
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageMonitoringUpdateRequest {
    pub sid: String,
    pub session_id: String,
    pub request_number: u32,
    pub ue_ipv4: String,
    pub rat_type: Option<RatType>,
    pub hardware_addr: String,
    /// Absent for pure event-trigger reports
    pub update: Option<UsageMonitorUpdate>,
    pub event_trigger: Option<EventTrigger>,
}

// ============================================================================
// Session-level requests / responses
// ============================================================================

/// Batched update request sent each enforcement cycle
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateSessionRequest {
    pub updates: Vec<CreditUsageUpdate>,
    pub usage_monitors: Vec<UsageMonitoringUpdateRequest>,
}

impl UpdateSessionRequest {
    /// True when nothing needs reporting this cycle
    pub fn is_empty(&self) -> bool {
        self.updates.is_empty() && self.usage_monitors.is_empty()
    }
}

/// Batched update response from the cloud
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpdateSessionResponse {
    pub responses: Vec<CreditUpdateResponse>,
    pub usage_monitor_responses: Vec<UsageMonitoringUpdateResponse>,
}

/// Static rule install instruction with a lifetime window
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct StaticRuleInstall {
    pub rule_id: String,
    /// Epoch seconds; 0 = immediately
    pub activation_time: u64,
    /// Epoch seconds; 0 = never
    pub deactivation_time: u64,
}

/// Dynamic rule install instruction with a lifetime window
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DynamicRuleInstall {
    pub policy_rule: PolicyRule,
    /// Epoch seconds; 0 = immediately
    pub activation_time: u64,
    /// Epoch seconds; 0 = never
    pub deactivation_time: u64,
}

/// Session creation request sent towards the policy/charging cloud
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CreateSessionRequest {
    pub sid: String,
    pub session_id: String,
    pub request_number: u32,
    pub cfg: crate::types::SessionConfig,
}

/// Response to session creation
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CreateSessionResponse {
    pub credits: Vec<CreditUpdateResponse>,
    pub usage_monitors: Vec<UsageMonitoringUpdateResponse>,
    pub static_rules: Vec<StaticRuleInstall>,
    pub dynamic_rules: Vec<DynamicRuleInstall>,
    pub event_triggers: Vec<EventTrigger>,
    pub revalidation_time: u64,
}

/// Final report for a terminating session
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionTerminateRequest {
    pub sid: String,
    pub session_id: String,
    pub request_number: u32,
    pub ue_ipv4: String,
    pub msisdn: String,
    pub apn: String,
    pub rat_type: Option<RatType>,
    pub spgw_ipv4: String,
    pub imei: String,
    pub plmn_id: String,
    pub imsi_plmn_id: String,
    pub user_location: String,
    pub hardware_addr: String,
    pub monitor_usages: Vec<UsageMonitorUpdate>,
    pub credit_usages: Vec<CreditUsage>,
}

// ============================================================================
// Reauth
// ============================================================================

/// Outcome of a reauth attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReAuthResult {
    UpdateInitiated,
    UpdateNotNeeded,
    SessionNotFound,
    Other,
}

/// Scope of a charging reauth
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChargingReAuthType {
    /// One charging key
    SingleService,
    /// Every charging key of the session
    EntireSession,
}

/// Cloud-initiated charging reauth
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChargingReAuthRequest {
    pub sid: String,
    pub session_id: String,
    pub reauth_type: ChargingReAuthType,
    pub charging_key: u32,
    pub service_identifier: Option<u32>,
}

/// Rule failure codes reported back in a policy reauth answer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PolicyReAuthFailureCode {
    GwPcefMalfunction,
    RuleEventFailure,
}

/// QoS information carried in a policy reauth
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ReAuthQosInformation {
    pub qci: u32,
}

/// Cloud-initiated policy reauth (rule install/remove, bearer QoS)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PolicyReAuthRequest {
    pub imsi: String,
    /// Empty string targets every session of the IMSI
    pub session_id: String,
    pub rules_to_remove: Vec<String>,
    pub rules_to_install: Vec<StaticRuleInstall>,
    pub dynamic_rules_to_install: Vec<DynamicRuleInstall>,
    pub event_triggers: Vec<EventTrigger>,
    pub revalidation_time: u64,
    pub usage_monitoring_credits: Vec<UsageMonitoringCredit>,
    pub qos_info: Option<ReAuthQosInformation>,
}

/// Answer to a policy reauth
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PolicyReAuthAnswer {
    pub result: Option<ReAuthResult>,
    pub failed_rules: HashMap<String, PolicyReAuthFailureCode>,
}

// ============================================================================
// Data-plane reporting
// ============================================================================

/// Usage counters for one rule of one subscriber, cumulative per report
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleRecord {
    pub sid: String,
    pub rule_id: String,
    pub bytes_tx: u64,
    pub bytes_rx: u64,
}

/// One full data-plane usage report
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuleRecordTable {
    pub records: Vec<RuleRecord>,
}

/// Which interface a flow request originates from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RequestOriginType {
    /// Policy (monitoring) interface
    Gx,
    /// Charging interface
    Gy,
}

/// Result of pushing all session flows to a restarted data plane
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SetupFlowsResult {
    Success,
    Failure,
    OutdatedEpoch,
}

/// Subscriber wallet state update pushed to the data plane
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriberQuotaUpdate {
    pub sid: String,
    pub mac_addr: String,
    pub update_type: SubscriberQuotaState,
}

// ============================================================================
// Bearer management
// ============================================================================

/// Ask the SPGW to create a dedicated bearer for QoS-bearing rules
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CreateBearerRequest {
    pub sid: String,
    pub ip_addr: String,
    pub link_bearer_id: u32,
    pub policy_rules: Vec<PolicyRule>,
}

/// Ask the SPGW to delete dedicated bearers
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeleteBearerRequest {
    pub sid: String,
    pub ip_addr: String,
    pub link_bearer_id: u32,
    pub eps_bearer_ids: Vec<u32>,
}

/// SGW acknowledgement binding a policy rule to a dedicated bearer.
/// A zero `bearer_id` means bearer creation failed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyBearerBindingRequest {
    pub sid: String,
    pub linked_bearer_id: u32,
    pub policy_rule_id: String,
    pub bearer_id: u32,
}

// ============================================================================
// Desired-state rule sets
// ============================================================================

/// Desired rule state for one APN (or subscriber-wide)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuleSet {
    /// Apply to every APN of the subscriber
    pub apply_subscriber_wide: bool,
    pub apn: String,
    pub static_rules: Vec<StaticRuleInstall>,
    pub dynamic_rules: Vec<DynamicRuleInstall>,
}

/// Desired rule state for one subscriber
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RulesPerSubscriber {
    pub imsi: String,
    pub rule_set: Vec<RuleSet>,
}

/// Desired rule state across subscribers
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionRules {
    pub rules_per_subscriber: Vec<RulesPerSubscriber>,
}
