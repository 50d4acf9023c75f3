//! Session state
//!
//! The per-subscriber aggregate: configuration, lifecycle FSM, installed
//! and scheduled rules, charging grants, usage monitors, dedicated-bearer
//! bindings and pending event triggers. Every mutation is mirrored into a
//! `SessionStateUpdateCriteria` journal so the session store can commit
//! or discard it atomically.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use cg_proto::{
    AggregatedMaximumBitrate, CreateBearerRequest, CreditKey, CreditUpdateResponse, CreditUsage,
    CreditUsageType, CreditUsageUpdate, DeleteBearerRequest, DynamicRuleInstall, EventTrigger,
    MonitorAction, MonitoringLevel, PolicyRule, RatSpecificContext, RuleSet, RulesPerSubscriber,
    SessionConfig, SessionTerminateRequest, StaticRuleInstall, SubscriberQuotaState,
    UpdateSessionRequest, UsageMonitorUpdate, UsageMonitoringCredit,
    UsageMonitoringUpdateRequest, UsageMonitoringUpdateResponse,
};

use crate::actions::{ServiceAction, ServiceActionType};
use crate::clients::SessionReporter;
use crate::credit::{Bucket, ALL_BUCKETS, USAGE_REPORTING_THRESHOLD};
use crate::grant::{ChargingGrant, ReAuthState, ServiceState};
use crate::metrics;
use crate::monitor::Monitor;
use crate::rules::{PolicyRuleBiMap, RuleLifetime, StaticRuleStore};
use crate::stored::{
    EventTriggerState, PolicyId, PolicyType, SessionCreditUpdateCriteria, SessionFsmState,
    SessionStateUpdateCriteria, StoredSessionState,
};

pub use cg_proto::ReAuthResult;

// ============================================================================
// Helper aggregates
// ============================================================================

/// Rules to push to or pull from the data plane in one batch
#[derive(Debug, Clone, Default)]
pub struct RulesToProcess {
    pub static_rules: Vec<String>,
    pub dynamic_rules: Vec<PolicyRule>,
}

impl RulesToProcess {
    pub fn is_empty(&self) -> bool {
        self.static_rules.is_empty() && self.dynamic_rules.is_empty()
    }
}

/// Desired rule state distilled from a `RuleSet` message
#[derive(Debug, Clone, Default)]
pub struct RuleSetToApply {
    pub static_rules: HashSet<String>,
    pub dynamic_rules: HashMap<String, PolicyRule>,
}

impl RuleSetToApply {
    pub fn from_rule_set(rule_set: &RuleSet) -> Self {
        let mut out = Self::default();
        for install in &rule_set.static_rules {
            out.static_rules.insert(install.rule_id.clone());
        }
        for install in &rule_set.dynamic_rules {
            out.dynamic_rules
                .insert(install.policy_rule.id.clone(), install.policy_rule.clone());
        }
        out
    }

    pub fn combine(&mut self, other: &RuleSetToApply) {
        for rule_id in &other.static_rules {
            self.static_rules.insert(rule_id.clone());
        }
        for (rule_id, rule) in &other.dynamic_rules {
            self.dynamic_rules.insert(rule_id.clone(), rule.clone());
        }
    }
}

/// Desired rule state for one subscriber, per APN or subscriber-wide
#[derive(Debug, Clone, Default)]
pub struct RuleSetBySubscriber {
    pub imsi: String,
    pub rule_set_by_apn: HashMap<String, RuleSetToApply>,
    pub subscriber_wide_rule_set: Option<RuleSetToApply>,
}

impl RuleSetBySubscriber {
    pub fn from_rules_per_subscriber(rules: &RulesPerSubscriber) -> Self {
        let mut out = Self {
            imsi: rules.imsi.clone(),
            ..Default::default()
        };
        for rule_set in &rules.rule_set {
            if rule_set.apply_subscriber_wide {
                out.subscriber_wide_rule_set = Some(RuleSetToApply::from_rule_set(rule_set));
            } else {
                out.subscriber_wide_rule_set = None;
                out.rule_set_by_apn
                    .insert(rule_set.apn.clone(), RuleSetToApply::from_rule_set(rule_set));
            }
        }
        out
    }

    /// The rule set that applies to `apn`, combining per-APN and
    /// subscriber-wide sets when both exist
    pub fn combined_rule_set_for_apn(&self, apn: &str) -> Option<RuleSetToApply> {
        match (self.rule_set_by_apn.get(apn), &self.subscriber_wide_rule_set) {
            (Some(apn_set), Some(wide)) => {
                let mut combined = apn_set.clone();
                combined.combine(wide);
                Some(combined)
            }
            (None, Some(wide)) => Some(wide.clone()),
            (Some(apn_set), None) => Some(apn_set.clone()),
            (None, None) => None,
        }
    }
}

/// Dedicated-bearer changes derived from one rule change batch
#[derive(Debug, Clone, Default)]
pub struct BearerUpdate {
    pub create_req: Option<CreateBearerRequest>,
    pub delete_req: Option<DeleteBearerRequest>,
}

/// Snapshot of a session's installed rules for the data plane
#[derive(Debug, Clone, Default)]
pub struct SessionInfo {
    pub imsi: String,
    pub ip_addr: String,
    pub static_rules: Vec<String>,
    pub dynamic_rules: Vec<PolicyRule>,
    pub gy_dynamic_rules: Vec<PolicyRule>,
    pub restrict_rules: Vec<String>,
    pub ambr: Option<AggregatedMaximumBitrate>,
}

/// Session-wide usage totals across all unique keys
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TotalCreditUsage {
    pub monitoring_tx: u64,
    pub monitoring_rx: u64,
    pub charging_tx: u64,
    pub charging_rx: u64,
}

// ============================================================================
// SessionState
// ============================================================================

/// One subscriber's live packet-data session
#[derive(Debug, Clone)]
pub struct SessionState {
    imsi: String,
    session_id: String,
    request_number: u32,
    state: SessionFsmState,
    config: SessionConfig,
    pdp_start_time: u64,
    pdp_end_time: u64,
    subscriber_quota_state: SubscriberQuotaState,

    /// Shared static rule registry
    static_rules: Arc<StaticRuleStore>,
    /// Static rules currently installed for the session
    active_static_rules: Vec<String>,
    /// Dynamic policy rules currently installed
    dynamic_rules: PolicyRuleBiMap,
    /// Dynamic rules created for charging final-unit actions
    gy_dynamic_rules: PolicyRuleBiMap,
    /// Static rules installed while service is restricted
    active_restrict_rules: Vec<String>,
    /// Static rules scheduled for future activation
    scheduled_static_rules: HashSet<String>,
    /// Dynamic rules scheduled for future activation
    scheduled_dynamic_rules: PolicyRuleBiMap,
    /// Lifetime windows of installed and scheduled rules
    rule_lifetimes: HashMap<String, RuleLifetime>,

    pending_event_triggers: HashMap<EventTrigger, EventTriggerState>,
    revalidation_time: u64,

    credit_map: HashMap<CreditKey, ChargingGrant>,
    monitor_map: HashMap<String, Monitor>,
    session_level_key: String,

    /// Dedicated-bearer id per QoS-bearing policy
    bearer_id_by_policy: HashMap<PolicyId, u32>,
}

impl SessionState {
    /// Fresh session in ACTIVE state. The request number starts at 1:
    /// request 0 is the create-session call itself.
    pub fn new(
        imsi: &str,
        session_id: &str,
        cfg: SessionConfig,
        static_rules: Arc<StaticRuleStore>,
        pdp_start_time: u64,
    ) -> Self {
        Self {
            imsi: imsi.to_string(),
            session_id: session_id.to_string(),
            request_number: 1,
            state: SessionFsmState::Active,
            config: cfg,
            pdp_start_time,
            pdp_end_time: 0,
            subscriber_quota_state: SubscriberQuotaState::ValidQuota,
            static_rules,
            active_static_rules: Vec::new(),
            dynamic_rules: PolicyRuleBiMap::new(),
            gy_dynamic_rules: PolicyRuleBiMap::new(),
            active_restrict_rules: Vec::new(),
            scheduled_static_rules: HashSet::new(),
            scheduled_dynamic_rules: PolicyRuleBiMap::new(),
            rule_lifetimes: HashMap::new(),
            pending_event_triggers: HashMap::new(),
            revalidation_time: 0,
            credit_map: HashMap::new(),
            monitor_map: HashMap::new(),
            session_level_key: String::new(),
            bearer_id_by_policy: HashMap::new(),
        }
    }

    /// Rebuild a session from its stored form
    pub fn unmarshal(stored: &StoredSessionState, static_rules: Arc<StaticRuleStore>) -> Self {
        let mut session = Self::new(
            &stored.imsi,
            &stored.session_id,
            stored.config.clone(),
            static_rules,
            stored.pdp_start_time,
        );
        session.request_number = stored.request_number;
        session.state = stored.fsm_state;
        session.pdp_end_time = stored.pdp_end_time;
        session.subscriber_quota_state = stored.subscriber_quota_state;
        session.session_level_key = stored.session_level_key.clone();
        session.revalidation_time = stored.revalidation_time;
        for (key, stored_grant) in &stored.credit_map {
            session
                .credit_map
                .insert(*key, ChargingGrant::from_stored(stored_grant));
        }
        for (mkey, stored_monitor) in &stored.monitor_map {
            session
                .monitor_map
                .insert(mkey.clone(), Monitor::from_stored(stored_monitor));
        }
        session.active_static_rules = stored.static_rule_ids.clone();
        for rule in &stored.dynamic_rules {
            session.dynamic_rules.insert_rule(rule.clone());
        }
        for rule in &stored.gy_dynamic_rules {
            session.gy_dynamic_rules.insert_rule(rule.clone());
        }
        session.scheduled_static_rules = stored.scheduled_static_rules.iter().cloned().collect();
        for rule in &stored.scheduled_dynamic_rules {
            session.scheduled_dynamic_rules.insert_rule(rule.clone());
        }
        session.active_restrict_rules = stored.restrict_rules.clone();
        session.rule_lifetimes = stored.rule_lifetimes.clone();
        session.pending_event_triggers = stored.pending_event_triggers.iter().cloned().collect();
        session.bearer_id_by_policy = stored.bearer_id_by_policy.iter().cloned().collect();
        session
    }

    /// Stored form of the session
    pub fn marshal(&self) -> StoredSessionState {
        StoredSessionState {
            fsm_state: self.state,
            config: self.config.clone(),
            imsi: self.imsi.clone(),
            session_id: self.session_id.clone(),
            request_number: self.request_number,
            pdp_start_time: self.pdp_start_time,
            pdp_end_time: self.pdp_end_time,
            subscriber_quota_state: self.subscriber_quota_state,
            credit_map: self
                .credit_map
                .iter()
                .map(|(key, grant)| (*key, grant.marshal()))
                .collect(),
            monitor_map: self
                .monitor_map
                .iter()
                .map(|(mkey, monitor)| (mkey.clone(), monitor.marshal()))
                .collect(),
            session_level_key: self.session_level_key.clone(),
            static_rule_ids: self.active_static_rules.clone(),
            dynamic_rules: self.dynamic_rules.rules(),
            gy_dynamic_rules: self.gy_dynamic_rules.rules(),
            scheduled_static_rules: self.scheduled_static_rules.iter().cloned().collect(),
            scheduled_dynamic_rules: self.scheduled_dynamic_rules.rules(),
            restrict_rules: self.active_restrict_rules.clone(),
            rule_lifetimes: self.rule_lifetimes.clone(),
            pending_event_triggers: self
                .pending_event_triggers
                .iter()
                .map(|(trigger, state)| (*trigger, *state))
                .collect(),
            revalidation_time: self.revalidation_time,
            bearer_id_by_policy: self
                .bearer_id_by_policy
                .iter()
                .map(|(policy, bearer)| (policy.clone(), *bearer))
                .collect(),
        }
    }

    // ------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------

    pub fn imsi(&self) -> &str {
        &self.imsi
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn get_request_number(&self) -> u32 {
        self.request_number
    }

    pub fn increment_request_number(&mut self, incr: u32) {
        self.request_number += incr;
    }

    pub fn get_config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn set_config(&mut self, config: SessionConfig) {
        self.config = config;
    }

    pub fn get_state(&self) -> SessionFsmState {
        self.state
    }

    pub fn is_active(&self) -> bool {
        self.state == SessionFsmState::Active
    }

    pub fn is_terminating(&self) -> bool {
        matches!(
            self.state,
            SessionFsmState::Released | SessionFsmState::Terminated
        )
    }

    pub fn is_wlan_session(&self) -> bool {
        self.config.is_wlan()
    }

    pub fn get_pdp_start_time(&self) -> u64 {
        self.pdp_start_time
    }

    pub fn get_pdp_end_time(&self) -> u64 {
        self.pdp_end_time
    }

    pub fn set_pdp_end_time(&mut self, epoch: u64) {
        self.pdp_end_time = epoch;
    }

    pub fn get_subscriber_quota_state(&self) -> SubscriberQuotaState {
        self.subscriber_quota_state
    }

    pub fn set_subscriber_quota_state(
        &mut self,
        state: SubscriberQuotaState,
        uc: &mut SessionStateUpdateCriteria,
    ) {
        self.subscriber_quota_state = state;
        uc.updated_subscriber_quota_state = Some(state);
    }

    pub fn get_session_level_key(&self) -> &str {
        &self.session_level_key
    }

    pub fn set_session_level_key(&mut self, new_key: &str) {
        self.session_level_key = new_key.to_string();
    }

    pub fn get_revalidation_time(&self) -> u64 {
        self.revalidation_time
    }

    pub fn get_event_triggers(&self) -> &HashMap<EventTrigger, EventTriggerState> {
        &self.pending_event_triggers
    }

    /// FSM transition with the absorbing-TERMINATED guard. Invalid
    /// transitions are logged and ignored.
    pub fn set_fsm_state(&mut self, new_state: SessionFsmState, uc: &mut SessionStateUpdateCriteria) {
        if self.state == new_state {
            return;
        }
        if self.state == SessionFsmState::Terminated {
            log::error!(
                "Session {} is TERMINATED, ignoring transition to {:?}",
                self.session_id,
                new_state
            );
            return;
        }
        log::debug!(
            "Session {} FSM state change from {:?} to {:?}",
            self.session_id,
            self.state,
            new_state
        );
        self.state = new_state;
        uc.is_fsm_updated = true;
        uc.updated_fsm_state = new_state;
    }

    // ------------------------------------------------------------------
    // Journal entry helpers
    // ------------------------------------------------------------------

    fn get_credit_uc<'a>(
        credit_map: &HashMap<CreditKey, ChargingGrant>,
        key: CreditKey,
        uc: &'a mut SessionStateUpdateCriteria,
    ) -> &'a mut SessionCreditUpdateCriteria {
        uc.charging_credit_map
            .entry(key)
            .or_insert_with(|| credit_map[&key].get_update_criteria())
    }

    fn get_monitor_uc<'a>(
        monitor_map: &HashMap<String, Monitor>,
        mkey: &str,
        uc: &'a mut SessionStateUpdateCriteria,
    ) -> &'a mut SessionCreditUpdateCriteria {
        uc.monitor_credit_map
            .entry(mkey.to_string())
            .or_insert_with(|| monitor_map[mkey].credit.get_update_criteria())
    }

    // ------------------------------------------------------------------
    // Usage accounting
    // ------------------------------------------------------------------

    /// Apply used TX/RX bytes reported for one rule: resolve the rule's
    /// charging key and monitoring key (plus the session-level key when
    /// distinct) and increment the corresponding credits.
    pub fn add_rule_usage(
        &mut self,
        rule_id: &str,
        used_tx: u64,
        used_rx: u64,
        uc: &mut SessionStateUpdateCriteria,
    ) {
        let charging_key = self
            .dynamic_rules
            .charging_key_for_rule_id(rule_id)
            .or_else(|| self.static_rules.charging_key_for_rule_id(rule_id));
        if let Some(key) = charging_key {
            if self.credit_map.contains_key(&key) {
                log::info!("Updating used charging credit for rule={rule_id} {key}");
                let credit_uc = Self::get_credit_uc(&self.credit_map, key, uc);
                let grant = self.credit_map.get_mut(&key).unwrap();
                grant.credit.add_used_credit(used_tx, used_rx, credit_uc);
                if grant.should_deactivate_service() {
                    grant.set_service_state(ServiceState::NeedsDeactivation, credit_uc);
                }
            } else {
                log::debug!("Charging key {key} not found, not adding the usage");
            }
        }

        let monitoring_key = self
            .dynamic_rules
            .monitoring_key_for_rule_id(rule_id)
            .or_else(|| self.static_rules.monitoring_key_for_rule_id(rule_id));
        if let Some(mkey) = &monitoring_key {
            log::info!("Updating used monitoring credit for rule={rule_id} mkey={mkey}");
            self.add_to_monitor(mkey, used_tx, used_rx, uc);
        }
        if !self.session_level_key.is_empty()
            && monitoring_key.as_deref() != Some(self.session_level_key.as_str())
        {
            let session_key = self.session_level_key.clone();
            self.add_to_monitor(&session_key, used_tx, used_rx, uc);
        }

        if self.is_dynamic_rule_installed(rule_id) || self.is_static_rule_installed(rule_id) {
            metrics::report_ue_usage(
                &self.imsi,
                &self.config.common_context.apn,
                &self.config.common_context.msisdn,
                used_tx,
                used_rx,
            );
        }
    }

    /// Add usage to one monitor, deleting it when the cloud stopped
    /// topping it up and the quota is gone
    pub fn add_to_monitor(
        &mut self,
        mkey: &str,
        used_tx: u64,
        used_rx: u64,
        uc: &mut SessionStateUpdateCriteria,
    ) -> bool {
        if !self.monitor_map.contains_key(mkey) {
            log::debug!("Monitoring key {mkey} not found, not adding the usage");
            return false;
        }
        if self.monitor_map[mkey].should_delete() {
            log::info!("Erasing monitor {mkey} due to quota exhausted");
            let is_session_level = self.monitor_map[mkey].level == MonitoringLevel::SessionLevel;
            {
                let monitor_uc = Self::get_monitor_uc(&self.monitor_map, mkey, uc);
                monitor_uc.deleted = true;
            }
            if is_session_level {
                uc.is_session_level_key_updated = true;
                uc.updated_session_level_key = String::new();
                self.session_level_key.clear();
            }
            self.monitor_map.remove(mkey);
        } else {
            let monitor_uc = Self::get_monitor_uc(&self.monitor_map, mkey, uc);
            let monitor = self.monitor_map.get_mut(mkey).unwrap();
            monitor.credit.add_used_credit(used_tx, used_rx, monitor_uc);
        }
        true
    }

    // ------------------------------------------------------------------
    // Charging credit
    // ------------------------------------------------------------------

    /// Initialise or refresh the grant for one charging key. Returns
    /// true if usage against the key remains allowed.
    pub fn receive_charging_credit(
        &mut self,
        update: &CreditUpdateResponse,
        now: u64,
        uc: &mut SessionStateUpdateCriteria,
    ) -> bool {
        let key = update.credit_key();
        if !self.credit_map.contains_key(&key) {
            return self.init_charging_credit(update, now, uc);
        }
        let credit_uc = Self::get_credit_uc(&self.credit_map, key, uc);
        let grant = self.credit_map.get_mut(&key).unwrap();
        if !update.success {
            log::debug!(
                "{} received an unsuccessful update for {key}",
                self.session_id
            );
            grant.credit.mark_failure(update.result_code, credit_uc);
            if grant.should_deactivate_service() {
                grant.set_service_state(ServiceState::NeedsDeactivation, credit_uc);
            }
            return false;
        }
        log::info!("{} received a charging credit for {key}", self.session_id);
        grant.receive_charging_grant(&update.credit, now, credit_uc);

        if grant.reauth_state == ReAuthState::Processing {
            grant.set_reauth_state(ReAuthState::NotNeeded, credit_uc);
        }
        if !grant.credit.is_quota_exhausted(1.0) && grant.service_state != ServiceState::Enabled {
            log::info!("Quota available, activating service");
            grant.set_service_state(ServiceState::NeedsActivation, credit_uc);
        }
        update.credit.granted_units.contains_credit() || update.is_infinite_credit()
    }

    fn init_charging_credit(
        &mut self,
        update: &CreditUpdateResponse,
        now: u64,
        uc: &mut SessionStateUpdateCriteria,
    ) -> bool {
        let key = update.credit_key();
        if !update.success {
            log::error!("Credit init failed for {} and {key}", self.imsi);
            return false;
        }
        log::info!("{} initialized a charging credit for {key}", self.session_id);
        let mut grant = ChargingGrant::new(update.limit_type);
        let mut scratch = SessionCreditUpdateCriteria::default();
        grant.receive_charging_grant(&update.credit, now, &mut scratch);
        uc.charging_credit_to_install.insert(key, grant.marshal());
        self.credit_map.insert(key, grant);
        update.credit.granted_units.contains_credit() || update.is_infinite_credit()
    }

    pub fn get_charging_credit(&self, key: &CreditKey, bucket: Bucket) -> u64 {
        self.credit_map
            .get(key)
            .map(|grant| grant.credit.get_credit(bucket))
            .unwrap_or(0)
    }

    /// True when the key's final-unit action is already being enforced
    pub fn is_credit_in_final_unit_state(&self, key: &CreditKey) -> bool {
        self.credit_map
            .get(key)
            .map(|grant| {
                matches!(
                    grant.service_state,
                    ServiceState::Redirected | ServiceState::Restricted
                )
            })
            .unwrap_or(false)
    }

    /// Drop the in-flight report for one charging key
    pub fn reset_reporting_charging_credit(
        &mut self,
        key: &CreditKey,
        uc: &mut SessionStateUpdateCriteria,
    ) -> bool {
        if !self.credit_map.contains_key(key) {
            log::error!(
                "Could not reset credit for {} and {key}: not found",
                self.imsi
            );
            return false;
        }
        let credit_uc = Self::get_credit_uc(&self.credit_map, *key, uc);
        let grant = self.credit_map.get_mut(key).unwrap();
        grant.credit.reset_reporting_credit(credit_uc);
        true
    }

    /// Drop the in-flight report for one monitoring key
    pub fn reset_reporting_monitor(
        &mut self,
        mkey: &str,
        uc: &mut SessionStateUpdateCriteria,
    ) -> bool {
        if !self.monitor_map.contains_key(mkey) {
            log::error!(
                "Could not reset credit for {} and monitoring key {mkey}: not found",
                self.imsi
            );
            return false;
        }
        let monitor_uc = Self::get_monitor_uc(&self.monitor_map, mkey, uc);
        let monitor = self.monitor_map.get_mut(mkey).unwrap();
        monitor.credit.reset_reporting_credit(monitor_uc);
        true
    }

    /// Mark one charging key for reauthorisation
    pub fn reauth_key(&mut self, key: CreditKey, uc: &mut SessionStateUpdateCriteria) -> ReAuthResult {
        if self.credit_map.contains_key(&key) {
            // a key already reporting will refresh on its own response
            if self.credit_map[&key].credit.is_reporting() {
                return ReAuthResult::UpdateNotNeeded;
            }
            let credit_uc = Self::get_credit_uc(&self.credit_map, key, uc);
            let grant = self.credit_map.get_mut(&key).unwrap();
            grant.set_reauth_state(ReAuthState::Required, credit_uc);
            return ReAuthResult::UpdateInitiated;
        }
        // unknown key: install a fresh disabled grant and engage reauth
        let mut grant = ChargingGrant::default();
        grant.reauth_state = ReAuthState::Required;
        grant.service_state = ServiceState::Disabled;
        uc.charging_credit_to_install.insert(key, grant.marshal());
        self.credit_map.insert(key, grant);
        ReAuthResult::UpdateInitiated
    }

    /// Mark every charging key not currently reporting for reauthorisation
    pub fn reauth_all(&mut self, uc: &mut SessionStateUpdateCriteria) -> ReAuthResult {
        let mut result = ReAuthResult::UpdateNotNeeded;
        let keys: Vec<CreditKey> = self.credit_map.keys().copied().collect();
        for key in keys {
            if self.credit_map[&key].credit.is_reporting() {
                continue;
            }
            let credit_uc = Self::get_credit_uc(&self.credit_map, key, uc);
            let grant = self.credit_map.get_mut(&key).unwrap();
            grant.set_reauth_state(ReAuthState::Required, credit_uc);
            result = ReAuthResult::UpdateInitiated;
        }
        result
    }

    // ------------------------------------------------------------------
    // Monitors
    // ------------------------------------------------------------------

    /// Initialise or refresh one usage monitor from a cloud response
    pub fn receive_monitor(
        &mut self,
        update: &UsageMonitoringUpdateResponse,
        uc: &mut SessionStateUpdateCriteria,
    ) -> bool {
        let credit = match &update.credit {
            Some(credit) => credit,
            None => {
                // event-trigger-only responses carry no monitor
                log::info!("Received a monitoring response without a monitor, ignoring");
                return true;
            }
        };
        if update.success && credit.level == MonitoringLevel::SessionLevel {
            self.update_session_level_key(credit, uc);
        }
        let mkey = credit.monitoring_key.clone();
        if uc
            .monitor_credit_map
            .get(&mkey)
            .map(|entry| entry.deleted)
            .unwrap_or(false)
        {
            // the cloud responded after the monitor was already slated
            // for deletion in this pass
            log::debug!("Ignoring monitor update {mkey}: it has been set for deletion");
            return false;
        }
        if !self.monitor_map.contains_key(&mkey) {
            return self.init_new_monitor(update, uc);
        }
        let monitor_uc = Self::get_monitor_uc(&self.monitor_map, &mkey, uc);
        let monitor = self.monitor_map.get_mut(&mkey).unwrap();
        if !update.success {
            monitor.credit.mark_failure(update.result_code, monitor_uc);
            return false;
        }
        log::info!("{} received monitor credit for {mkey}", self.session_id);
        monitor.credit.receive_credit(&credit.granted_units, monitor_uc);
        true
    }

    fn init_new_monitor(
        &mut self,
        update: &UsageMonitoringUpdateResponse,
        uc: &mut SessionStateUpdateCriteria,
    ) -> bool {
        let credit = update.credit.as_ref().unwrap();
        if !update.success {
            log::error!(
                "Monitoring init failed for {} and monitoring key {}",
                self.imsi,
                credit.monitoring_key
            );
            return false;
        }
        if credit.action == MonitorAction::Disable {
            log::warn!(
                "Monitoring init has action disabled for {} and monitoring key {}",
                self.imsi,
                credit.monitoring_key
            );
            return false;
        }
        log::debug!(
            "{} initialized a monitoring credit for mkey {}",
            self.session_id,
            credit.monitoring_key
        );
        let mut monitor = Monitor::new(credit.level);
        let mut scratch = SessionCreditUpdateCriteria::default();
        monitor.credit.receive_credit(&credit.granted_units, &mut scratch);
        uc.monitor_credit_to_install
            .insert(credit.monitoring_key.clone(), monitor.marshal());
        self.monitor_map.insert(credit.monitoring_key.clone(), monitor);
        true
    }

    fn update_session_level_key(
        &mut self,
        credit: &UsageMonitoringCredit,
        uc: &mut SessionStateUpdateCriteria,
    ) {
        let new_key = &credit.monitoring_key;
        if !self.session_level_key.is_empty() && &self.session_level_key != new_key {
            log::info!(
                "Session level monitoring key is updated from {} to {new_key}",
                self.session_level_key
            );
        }
        if credit.action == MonitorAction::Disable {
            self.session_level_key.clear();
        } else {
            self.session_level_key = new_key.clone();
        }
        uc.is_session_level_key_updated = true;
        uc.updated_session_level_key = self.session_level_key.clone();
    }

    pub fn get_monitor(&self, mkey: &str, bucket: Bucket) -> u64 {
        self.monitor_map
            .get(mkey)
            .map(|monitor| monitor.credit.get_credit(bucket))
            .unwrap_or(0)
    }

    /// Count of installed rules carrying a monitoring key
    pub fn total_monitored_rules_count(&self) -> usize {
        let monitored_static = self
            .active_static_rules
            .iter()
            .filter(|rule_id| self.static_rules.monitoring_key_for_rule_id(rule_id).is_some())
            .count();
        self.dynamic_rules.monitored_rules_count() + monitored_static
    }

    pub fn active_monitored_rules_exist(&self) -> bool {
        self.total_monitored_rules_count() > 0
    }

    // ------------------------------------------------------------------
    // Update collection
    // ------------------------------------------------------------------

    /// Collect credit, monitor and event-trigger updates into the batched
    /// request, and service actions to apply immediately. Only ACTIVE
    /// sessions produce updates.
    pub fn get_updates(
        &mut self,
        out: &mut UpdateSessionRequest,
        actions_out: &mut Vec<ServiceAction>,
        uc: &mut SessionStateUpdateCriteria,
        now: u64,
    ) {
        if self.state != SessionFsmState::Active {
            return;
        }
        self.get_charging_updates(out, actions_out, uc, now);
        self.get_monitor_updates(out, uc);
        self.get_event_trigger_updates(out, uc);
    }

    fn get_charging_updates(
        &mut self,
        out: &mut UpdateSessionRequest,
        actions_out: &mut Vec<ServiceAction>,
        uc: &mut SessionStateUpdateCriteria,
        now: u64,
    ) {
        let keys: Vec<CreditKey> = self.credit_map.keys().copied().collect();
        for key in keys {
            let action_type = {
                let credit_uc = Self::get_credit_uc(&self.credit_map, key, uc);
                let grant = self.credit_map.get_mut(&key).unwrap();
                grant.get_action(credit_uc)
            };
            match action_type {
                ServiceActionType::ContinueService => {
                    let maybe_usage = {
                        let credit_uc = Self::get_credit_uc(&self.credit_map, key, uc);
                        let grant = self.credit_map.get_mut(&key).unwrap();
                        match grant.get_update_type(now) {
                            None => None,
                            Some(update_type) => {
                                log::debug!(
                                    "Subscriber {} {key} updating due to {update_type:?} \
                                     with request number {}",
                                    self.imsi,
                                    self.request_number
                                );
                                if update_type == CreditUsageType::ReauthRequired {
                                    grant.set_reauth_state(ReAuthState::Processing, credit_uc);
                                }
                                Some(grant.get_credit_usage(&key, update_type, credit_uc, false))
                            }
                        }
                    };
                    if let Some(usage) = maybe_usage {
                        let req = self.make_credit_usage_update_req(usage);
                        out.updates.push(req);
                        self.request_number += 1;
                        uc.request_number_increment += 1;
                    }
                }
                ServiceActionType::Redirect => {
                    let redirect_server = {
                        let credit_uc = Self::get_credit_uc(&self.credit_map, key, uc);
                        let grant = self.credit_map.get_mut(&key).unwrap();
                        if grant.service_state == ServiceState::Redirected {
                            log::debug!("Redirection already activated");
                            continue;
                        }
                        grant.set_service_state(ServiceState::Redirected, credit_uc);
                        grant.final_action_info.redirect_server.clone()
                    };
                    let mut action = self.make_service_action(ServiceActionType::Redirect, key);
                    action.redirect_server = redirect_server;
                    actions_out.push(action);
                }
                ServiceActionType::RestrictAccess => {
                    let restrict_rules = {
                        let credit_uc = Self::get_credit_uc(&self.credit_map, key, uc);
                        let grant = self.credit_map.get_mut(&key).unwrap();
                        if grant.service_state == ServiceState::Restricted {
                            log::debug!("Service restriction already activated");
                            continue;
                        }
                        grant.set_service_state(ServiceState::Restricted, credit_uc);
                        grant.final_action_info.restrict_rules.clone()
                    };
                    let mut action =
                        self.make_service_action(ServiceActionType::RestrictAccess, key);
                    action.restrict_rule_ids = restrict_rules;
                    actions_out.push(action);
                }
                ServiceActionType::ActivateService => {
                    let mut action =
                        self.make_service_action(ServiceActionType::ActivateService, key);
                    action.ambr = self.config.apn_ambr();
                    actions_out.push(action);
                }
                ServiceActionType::TerminateService => {
                    let action =
                        self.make_service_action(ServiceActionType::TerminateService, key);
                    actions_out.push(action);
                }
            }
        }
    }

    fn make_service_action(&self, action_type: ServiceActionType, key: CreditKey) -> ServiceAction {
        let mut action = ServiceAction::new(action_type);
        action.credit_key = Some(key);
        action.imsi = self.imsi.clone();
        action.session_id = self.session_id.clone();
        action.ip_addr = self.config.common_context.ue_ipv4.clone();
        action.rule_ids = self.static_rules.rule_ids_for_charging_key(&key);
        action.rule_definitions = self.dynamic_rules.rule_definitions_for_charging_key(&key);
        action
    }

    fn get_monitor_updates(
        &mut self,
        out: &mut UpdateSessionRequest,
        uc: &mut SessionStateUpdateCriteria,
    ) {
        let mkeys: Vec<String> = self.monitor_map.keys().cloned().collect();
        for mkey in mkeys {
            let (partially_exhausted, totally_exhausted, zero_grant) = {
                let credit = &self.monitor_map[&mkey].credit;
                (
                    credit.is_quota_exhausted(USAGE_REPORTING_THRESHOLD),
                    credit.is_quota_exhausted(1.0),
                    credit.current_grant_contains_zero(),
                )
            };
            // Skip when not enough quota has been used yet; a zero
            // top-up defers its last report until total consumption.
            if !partially_exhausted || (!totally_exhausted && zero_grant) {
                continue;
            }
            log::debug!(
                "Session {} monitoring key {mkey} updating due to quota exhaustion \
                 with request number {}",
                self.session_id,
                self.request_number
            );
            let (usage, level) = {
                let monitor_uc = Self::get_monitor_uc(&self.monitor_map, &mkey, uc);
                let monitor = self.monitor_map.get_mut(&mkey).unwrap();
                (monitor.credit.get_usage_for_reporting(monitor_uc), monitor.level)
            };
            let mut req = self.make_usage_monitor_request();
            req.update = Some(UsageMonitorUpdate {
                monitoring_key: mkey.clone(),
                level,
                bytes_tx: usage.bytes_tx,
                bytes_rx: usage.bytes_rx,
            });
            req.event_trigger = Some(EventTrigger::UsageReport);
            out.usage_monitors.push(req);
            self.request_number += 1;
            uc.request_number_increment += 1;
        }
    }

    fn get_event_trigger_updates(
        &mut self,
        out: &mut UpdateSessionRequest,
        uc: &mut SessionStateUpdateCriteria,
    ) {
        let ready = self
            .pending_event_triggers
            .get(&EventTrigger::RevalidationTimeout)
            == Some(&EventTriggerState::Ready);
        if !ready {
            return;
        }
        log::debug!(
            "Session {} updating due to event trigger REVALIDATION_TIMEOUT \
             with request number {}",
            self.session_id,
            self.request_number
        );
        let mut req = self.make_usage_monitor_request();
        req.event_trigger = Some(EventTrigger::RevalidationTimeout);
        out.usage_monitors.push(req);
        self.request_number += 1;
        uc.request_number_increment += 1;
        self.remove_event_trigger(EventTrigger::RevalidationTimeout, uc);
    }

    fn make_usage_monitor_request(&self) -> UsageMonitoringUpdateRequest {
        UsageMonitoringUpdateRequest {
            sid: self.imsi.clone(),
            session_id: self.session_id.clone(),
            request_number: self.request_number,
            ue_ipv4: self.config.common_context.ue_ipv4.clone(),
            rat_type: self.config.common_context.rat_type,
            hardware_addr: self
                .config
                .wlan_context()
                .map(|wlan| wlan.mac_addr.clone())
                .unwrap_or_default(),
            update: None,
            event_trigger: None,
        }
    }

    fn make_credit_usage_update_req(&self, usage: CreditUsage) -> CreditUsageUpdate {
        let common = &self.config.common_context;
        let mut req = CreditUsageUpdate {
            sid: self.imsi.clone(),
            session_id: self.session_id.clone(),
            request_number: self.request_number,
            msisdn: common.msisdn.clone(),
            ue_ipv4: common.ue_ipv4.clone(),
            apn: common.apn.clone(),
            rat_type: common.rat_type,
            spgw_ipv4: String::new(),
            imei: String::new(),
            plmn_id: String::new(),
            imsi_plmn_id: String::new(),
            user_location: String::new(),
            hardware_addr: String::new(),
            usage,
        };
        match &self.config.rat_specific_context {
            RatSpecificContext::Lte(lte) => {
                req.spgw_ipv4 = lte.spgw_ipv4.clone();
                req.imei = lte.imei.clone();
                req.plmn_id = lte.plmn_id.clone();
                req.imsi_plmn_id = lte.imsi_plmn_id.clone();
                req.user_location = lte.user_location.clone();
            }
            RatSpecificContext::Wlan(wlan) => {
                req.hardware_addr = wlan.mac_addr.clone();
            }
        }
        req
    }

    // ------------------------------------------------------------------
    // Termination
    // ------------------------------------------------------------------

    /// Defer teardown: ACTIVE -> TERMINATION_SCHEDULED
    pub fn mark_as_awaiting_termination(&mut self, uc: &mut SessionStateUpdateCriteria) {
        self.set_fsm_state(SessionFsmState::TerminationScheduled, uc);
    }

    /// Transition to RELEASED once the data-plane report no longer
    /// carries the session's flows
    pub fn mark_as_released(&mut self, uc: &mut SessionStateUpdateCriteria) {
        self.set_fsm_state(SessionFsmState::Released, uc);
    }

    /// Finish teardown: snapshot all unreported usage into one terminate
    /// request and report it. Idempotent once TERMINATED; terminating an
    /// ACTIVE session (forced timer with no usage arriving) is allowed
    /// with a warning. Returns true when the session reached TERMINATED.
    pub fn complete_termination(
        &mut self,
        reporter: &dyn SessionReporter,
        uc: &mut SessionStateUpdateCriteria,
    ) -> bool {
        match self.state {
            SessionFsmState::Active => {
                log::warn!(
                    "{} force-terminating from ACTIVE, no usage ever arrived",
                    self.session_id
                );
            }
            SessionFsmState::Terminated => return false,
            SessionFsmState::Released => {
                log::info!(
                    "{} forcefully terminating session since it did not receive usage \
                     from the data plane in time",
                    self.session_id
                );
            }
            SessionFsmState::TerminationScheduled => {}
        }
        self.set_fsm_state(SessionFsmState::Terminated, uc);
        let termination_req = self.make_termination_request(uc);
        if let Err(e) = reporter.report_terminate_session(&termination_req) {
            log::error!(
                "Failed to report session termination for {}: {e}",
                self.session_id
            );
        }
        true
    }

    /// Snapshot all monitors' unreported usage and all charging grants'
    /// terminal usage into one terminate request
    pub fn make_termination_request(
        &mut self,
        uc: &mut SessionStateUpdateCriteria,
    ) -> SessionTerminateRequest {
        let common = &self.config.common_context;
        let mut req = SessionTerminateRequest {
            sid: self.imsi.clone(),
            session_id: self.session_id.clone(),
            request_number: self.request_number,
            ue_ipv4: common.ue_ipv4.clone(),
            msisdn: common.msisdn.clone(),
            apn: common.apn.clone(),
            rat_type: common.rat_type,
            ..Default::default()
        };
        match &self.config.rat_specific_context {
            RatSpecificContext::Lte(lte) => {
                req.spgw_ipv4 = lte.spgw_ipv4.clone();
                req.imei = lte.imei.clone();
                req.plmn_id = lte.plmn_id.clone();
                req.imsi_plmn_id = lte.imsi_plmn_id.clone();
                req.user_location = lte.user_location.clone();
            }
            RatSpecificContext::Wlan(wlan) => {
                req.hardware_addr = wlan.mac_addr.clone();
            }
        }

        let mkeys: Vec<String> = self.monitor_map.keys().cloned().collect();
        for mkey in mkeys {
            let monitor_uc = Self::get_monitor_uc(&self.monitor_map, &mkey, uc);
            let monitor = self.monitor_map.get_mut(&mkey).unwrap();
            let usage = monitor.credit.get_all_unreported_usage_for_reporting(monitor_uc);
            req.monitor_usages.push(UsageMonitorUpdate {
                monitoring_key: mkey.clone(),
                level: monitor.level,
                bytes_tx: usage.bytes_tx,
                bytes_rx: usage.bytes_rx,
            });
        }
        let keys: Vec<CreditKey> = self.credit_map.keys().copied().collect();
        for key in keys {
            let credit_uc = Self::get_credit_uc(&self.credit_map, key, uc);
            let grant = self.credit_map.get_mut(&key).unwrap();
            let usage = grant.get_credit_usage(&key, CreditUsageType::Terminated, credit_uc, true);
            req.credit_usages.push(usage);
        }
        self.request_number += 1;
        uc.request_number_increment += 1;
        req
    }

    /// Session-wide usage totals across all unique charging and
    /// monitoring keys used by installed rules
    pub fn get_total_credit_usage(&self) -> TotalCreditUsage {
        let mut used_charging_keys: HashSet<CreditKey> = HashSet::new();
        let mut used_monitoring_keys: HashSet<String> = HashSet::new();

        for rule_id in &self.active_static_rules {
            if let Some(key) = self.static_rules.charging_key_for_rule_id(rule_id) {
                used_charging_keys.insert(key);
            }
            if let Some(mkey) = self.static_rules.monitoring_key_for_rule_id(rule_id) {
                used_monitoring_keys.insert(mkey);
            }
        }
        for rule_id in self.dynamic_rules.rule_ids() {
            if let Some(key) = self.dynamic_rules.charging_key_for_rule_id(&rule_id) {
                used_charging_keys.insert(key);
            }
            if let Some(mkey) = self.dynamic_rules.monitoring_key_for_rule_id(&rule_id) {
                used_monitoring_keys.insert(mkey);
            }
        }

        let mut usage = TotalCreditUsage::default();
        for mkey in used_monitoring_keys {
            usage.monitoring_tx += self.get_monitor(&mkey, Bucket::UsedTx);
            usage.monitoring_rx += self.get_monitor(&mkey, Bucket::UsedRx);
        }
        for key in used_charging_keys {
            usage.charging_tx += self.get_charging_credit(&key, Bucket::UsedTx);
            usage.charging_rx += self.get_charging_credit(&key, Bucket::UsedRx);
        }
        usage
    }

    // ------------------------------------------------------------------
    // Rule management
    // ------------------------------------------------------------------

    pub fn is_static_rule_installed(&self, rule_id: &str) -> bool {
        self.active_static_rules.iter().any(|id| id == rule_id)
    }

    pub fn is_dynamic_rule_installed(&self, rule_id: &str) -> bool {
        self.dynamic_rules.has_rule(rule_id)
    }

    pub fn is_gy_dynamic_rule_installed(&self, rule_id: &str) -> bool {
        self.gy_dynamic_rules.has_rule(rule_id)
    }

    pub fn is_restrict_rule_installed(&self, rule_id: &str) -> bool {
        self.active_restrict_rules.iter().any(|id| id == rule_id)
    }

    pub fn is_static_rule_scheduled(&self, rule_id: &str) -> bool {
        self.scheduled_static_rules.contains(rule_id)
    }

    pub fn is_dynamic_rule_scheduled(&self, rule_id: &str) -> bool {
        self.scheduled_dynamic_rules.has_rule(rule_id)
    }

    /// STATIC or DYNAMIC, for installed rules only
    pub fn get_policy_type(&self, rule_id: &str) -> Option<PolicyType> {
        if self.is_static_rule_installed(rule_id) {
            Some(PolicyType::Static)
        } else if self.is_dynamic_rule_installed(rule_id) {
            Some(PolicyType::Dynamic)
        } else {
            None
        }
    }

    pub fn get_rule_lifetime(&self, rule_id: &str) -> Option<RuleLifetime> {
        self.rule_lifetimes.get(rule_id).copied()
    }

    pub fn get_static_rules(&self) -> &[String] {
        &self.active_static_rules
    }

    pub fn get_scheduled_static_rules(&self) -> &HashSet<String> {
        &self.scheduled_static_rules
    }

    pub fn get_restrict_rules(&self) -> &[String] {
        &self.active_restrict_rules
    }

    pub fn get_dynamic_rules(&self) -> &PolicyRuleBiMap {
        &self.dynamic_rules
    }

    pub fn get_scheduled_dynamic_rules(&self) -> &PolicyRuleBiMap {
        &self.scheduled_dynamic_rules
    }

    pub fn get_gy_dynamic_rules(&self) -> &PolicyRuleBiMap {
        &self.gy_dynamic_rules
    }

    pub fn get_credit_key_count(&self) -> usize {
        self.credit_map.len() + self.monitor_map.len()
    }

    /// Install a dynamic rule as currently active
    pub fn insert_dynamic_rule(
        &mut self,
        rule: PolicyRule,
        lifetime: RuleLifetime,
        uc: &mut SessionStateUpdateCriteria,
    ) {
        if self.is_dynamic_rule_installed(&rule.id) {
            return;
        }
        self.rule_lifetimes.insert(rule.id.clone(), lifetime);
        uc.new_rule_lifetimes.insert(rule.id.clone(), lifetime);
        uc.dynamic_rules_to_install.push(rule.clone());
        self.dynamic_rules.insert_rule(rule);
    }

    /// Install a gy-dynamic rule created for a final-unit action
    pub fn insert_gy_dynamic_rule(
        &mut self,
        rule: PolicyRule,
        lifetime: RuleLifetime,
        uc: &mut SessionStateUpdateCriteria,
    ) {
        if self.is_gy_dynamic_rule_installed(&rule.id) {
            log::debug!("Tried to insert gy dynamic rule {} but it already existed", rule.id);
            return;
        }
        self.rule_lifetimes.insert(rule.id.clone(), lifetime);
        uc.new_rule_lifetimes.insert(rule.id.clone(), lifetime);
        uc.gy_dynamic_rules_to_install.push(rule.clone());
        self.gy_dynamic_rules.insert_rule(rule);
    }

    /// Install a static rule as currently active
    pub fn activate_static_rule(
        &mut self,
        rule_id: &str,
        lifetime: RuleLifetime,
        uc: &mut SessionStateUpdateCriteria,
    ) {
        self.rule_lifetimes.insert(rule_id.to_string(), lifetime);
        self.active_static_rules.push(rule_id.to_string());
        uc.static_rules_to_install.insert(rule_id.to_string());
        uc.new_rule_lifetimes.insert(rule_id.to_string(), lifetime);
    }

    /// Install a restrict rule while service is restricted
    pub fn activate_restrict_rule(
        &mut self,
        rule_id: &str,
        lifetime: RuleLifetime,
        uc: &mut SessionStateUpdateCriteria,
    ) {
        self.rule_lifetimes.insert(rule_id.to_string(), lifetime);
        self.active_restrict_rules.push(rule_id.to_string());
        uc.restrict_rules_to_install.insert(rule_id.to_string());
        uc.new_rule_lifetimes.insert(rule_id.to_string(), lifetime);
    }

    /// Remove an active dynamic rule, returning it when present
    pub fn remove_dynamic_rule(
        &mut self,
        rule_id: &str,
        uc: &mut SessionStateUpdateCriteria,
    ) -> Option<PolicyRule> {
        let removed = self.dynamic_rules.remove_rule(rule_id);
        if removed.is_some() {
            uc.dynamic_rules_to_uninstall.insert(rule_id.to_string());
        }
        removed
    }

    /// Remove a scheduled dynamic rule before it activates
    pub fn remove_scheduled_dynamic_rule(
        &mut self,
        rule_id: &str,
        uc: &mut SessionStateUpdateCriteria,
    ) -> Option<PolicyRule> {
        let removed = self.scheduled_dynamic_rules.remove_rule(rule_id);
        if removed.is_some() {
            uc.dynamic_rules_to_uninstall.insert(rule_id.to_string());
        }
        removed
    }

    /// Remove a gy-dynamic rule, returning it when present
    pub fn remove_gy_dynamic_rule(
        &mut self,
        rule_id: &str,
        uc: &mut SessionStateUpdateCriteria,
    ) -> Option<PolicyRule> {
        let removed = self.gy_dynamic_rules.remove_rule(rule_id);
        if removed.is_some() {
            uc.gy_dynamic_rules_to_uninstall.insert(rule_id.to_string());
        }
        removed
    }

    /// Deactivate an active static rule
    pub fn deactivate_static_rule(
        &mut self,
        rule_id: &str,
        uc: &mut SessionStateUpdateCriteria,
    ) -> bool {
        let position = self.active_static_rules.iter().position(|id| id == rule_id);
        match position {
            Some(idx) => {
                self.active_static_rules.remove(idx);
                uc.static_rules_to_uninstall.insert(rule_id.to_string());
                true
            }
            None => false,
        }
    }

    /// Drop a scheduled static rule before it activates
    pub fn deactivate_scheduled_static_rule(
        &mut self,
        rule_id: &str,
        uc: &mut SessionStateUpdateCriteria,
    ) -> bool {
        if !self.scheduled_static_rules.remove(rule_id) {
            return false;
        }
        uc.static_rules_to_uninstall.insert(rule_id.to_string());
        true
    }

    /// Deactivate an active restrict rule
    pub fn deactivate_restrict_rule(
        &mut self,
        rule_id: &str,
        uc: &mut SessionStateUpdateCriteria,
    ) -> bool {
        let position = self
            .active_restrict_rules
            .iter()
            .position(|id| id == rule_id);
        match position {
            Some(idx) => {
                self.active_restrict_rules.remove(idx);
                uc.restrict_rules_to_uninstall.insert(rule_id.to_string());
                true
            }
            None => false,
        }
    }

    /// Schedule a dynamic rule for future activation
    pub fn schedule_dynamic_rule(
        &mut self,
        rule: PolicyRule,
        lifetime: RuleLifetime,
        uc: &mut SessionStateUpdateCriteria,
    ) {
        uc.new_rule_lifetimes.insert(rule.id.clone(), lifetime);
        uc.new_scheduled_dynamic_rules.push(rule.clone());
        self.rule_lifetimes.insert(rule.id.clone(), lifetime);
        self.scheduled_dynamic_rules.insert_rule(rule);
    }

    /// Schedule a static rule for future activation
    pub fn schedule_static_rule(
        &mut self,
        rule_id: &str,
        lifetime: RuleLifetime,
        uc: &mut SessionStateUpdateCriteria,
    ) {
        uc.new_rule_lifetimes.insert(rule_id.to_string(), lifetime);
        uc.new_scheduled_static_rules.insert(rule_id.to_string());
        self.rule_lifetimes.insert(rule_id.to_string(), lifetime);
        self.scheduled_static_rules.insert(rule_id.to_string());
    }

    /// Promote a scheduled dynamic rule into the active set
    pub fn install_scheduled_dynamic_rule(
        &mut self,
        rule_id: &str,
        uc: &mut SessionStateUpdateCriteria,
    ) {
        let rule = match self.scheduled_dynamic_rules.remove_rule(rule_id) {
            Some(rule) => rule,
            None => {
                log::error!(
                    "Failed to mark a scheduled dynamic rule as installed: {rule_id}"
                );
                return;
            }
        };
        uc.dynamic_rules_to_install.push(rule.clone());
        self.dynamic_rules.insert_rule(rule);
    }

    /// Promote a scheduled static rule into the active set
    pub fn install_scheduled_static_rule(
        &mut self,
        rule_id: &str,
        uc: &mut SessionStateUpdateCriteria,
    ) {
        if !self.scheduled_static_rules.remove(rule_id) {
            log::error!("Failed to mark a scheduled static rule as installed: {rule_id}");
            return;
        }
        uc.static_rules_to_install.insert(rule_id.to_string());
        self.active_static_rules.push(rule_id.to_string());
    }

    fn should_rule_be_active(&self, rule_id: &str, t: u64) -> bool {
        self.rule_lifetimes
            .get(rule_id)
            .copied()
            .unwrap_or_default()
            .should_be_active(t)
    }

    fn should_rule_be_deactivated(&self, rule_id: &str, t: u64) -> bool {
        self.rule_lifetimes
            .get(rule_id)
            .copied()
            .unwrap_or_default()
            .should_be_deactivated(t)
    }

    /// Bring the rule sets in line with the clock: deactivate rules past
    /// their window, promote scheduled rules whose window opened, drop
    /// scheduled rules already past their window.
    pub fn sync_rules_to_time(&mut self, now: u64, uc: &mut SessionStateUpdateCriteria) {
        for rule_id in self.active_static_rules.clone() {
            if self.should_rule_be_deactivated(&rule_id, now) {
                self.deactivate_static_rule(&rule_id, uc);
            }
        }
        for rule_id in self.scheduled_static_rules.clone() {
            if self.should_rule_be_active(&rule_id, now) {
                self.install_scheduled_static_rule(&rule_id, uc);
            } else if self.should_rule_be_deactivated(&rule_id, now) {
                self.deactivate_scheduled_static_rule(&rule_id, uc);
            }
        }
        for rule_id in self.dynamic_rules.rule_ids() {
            if self.should_rule_be_deactivated(&rule_id, now) {
                self.remove_dynamic_rule(&rule_id, uc);
            }
        }
        for rule_id in self.scheduled_dynamic_rules.rule_ids() {
            if self.should_rule_be_active(&rule_id, now) {
                self.install_scheduled_dynamic_rule(&rule_id, uc);
            } else if self.should_rule_be_deactivated(&rule_id, now) {
                self.remove_scheduled_dynamic_rule(&rule_id, uc);
            }
        }
    }

    /// Install instruction for a static rule
    pub fn get_static_rule_install(&self, rule_id: &str, lifetime: RuleLifetime) -> StaticRuleInstall {
        StaticRuleInstall {
            rule_id: rule_id.to_string(),
            activation_time: lifetime.activation_time,
            deactivation_time: lifetime.deactivation_time,
        }
    }

    /// Install instruction for a dynamic rule, active or scheduled
    pub fn get_dynamic_rule_install(
        &self,
        rule_id: &str,
        lifetime: RuleLifetime,
    ) -> Option<DynamicRuleInstall> {
        let rule = self
            .dynamic_rules
            .get_rule(rule_id)
            .or_else(|| self.scheduled_dynamic_rules.get_rule(rule_id))?;
        Some(DynamicRuleInstall {
            policy_rule: rule.clone(),
            activation_time: lifetime.activation_time,
            deactivation_time: lifetime.deactivation_time,
        })
    }

    // ------------------------------------------------------------------
    // Declarative rule sets
    // ------------------------------------------------------------------

    /// Replace the session's rule sets to match the desired state,
    /// producing install/uninstall deltas. Lifetimes are immediate.
    pub fn apply_session_rule_set(
        &mut self,
        rule_set: &RuleSetToApply,
        rules_to_activate: &mut RulesToProcess,
        rules_to_deactivate: &mut RulesToProcess,
        uc: &mut SessionStateUpdateCriteria,
    ) {
        self.apply_session_static_rule_set(
            &rule_set.static_rules,
            rules_to_activate,
            rules_to_deactivate,
            uc,
        );
        self.apply_session_dynamic_rule_set(
            &rule_set.dynamic_rules,
            rules_to_activate,
            rules_to_deactivate,
            uc,
        );
    }

    fn apply_session_static_rule_set(
        &mut self,
        static_rules: &HashSet<String>,
        rules_to_activate: &mut RulesToProcess,
        rules_to_deactivate: &mut RulesToProcess,
        uc: &mut SessionStateUpdateCriteria,
    ) {
        let lifetime = RuleLifetime::unbounded();
        for rule_id in static_rules {
            if !self.is_static_rule_installed(rule_id) {
                log::info!("Installing static rule {rule_id} for {}", self.session_id);
                self.activate_static_rule(rule_id, lifetime, uc);
                rules_to_activate.static_rules.push(rule_id.clone());
            }
        }
        let to_remove: Vec<String> = self
            .active_static_rules
            .iter()
            .filter(|rule_id| !static_rules.contains(*rule_id))
            .cloned()
            .collect();
        for rule_id in to_remove {
            log::info!("Removing static rule {rule_id} for {}", self.session_id);
            self.deactivate_static_rule(&rule_id, uc);
            rules_to_deactivate.static_rules.push(rule_id);
        }
    }

    fn apply_session_dynamic_rule_set(
        &mut self,
        dynamic_rules: &HashMap<String, PolicyRule>,
        rules_to_activate: &mut RulesToProcess,
        rules_to_deactivate: &mut RulesToProcess,
        uc: &mut SessionStateUpdateCriteria,
    ) {
        let lifetime = RuleLifetime::unbounded();
        for (rule_id, rule) in dynamic_rules {
            if !self.is_dynamic_rule_installed(rule_id) {
                log::info!("Installing dynamic rule {rule_id} for {}", self.session_id);
                self.insert_dynamic_rule(rule.clone(), lifetime, uc);
                rules_to_activate.dynamic_rules.push(rule.clone());
            }
        }
        for rule in self.dynamic_rules.rules() {
            if !dynamic_rules.contains_key(&rule.id) {
                log::info!("Removing dynamic rule {} for {}", rule.id, self.session_id);
                self.remove_dynamic_rule(&rule.id, uc);
                rules_to_deactivate.dynamic_rules.push(rule);
            }
        }
    }

    // ------------------------------------------------------------------
    // Event triggers
    // ------------------------------------------------------------------

    pub fn add_new_event_trigger(
        &mut self,
        trigger: EventTrigger,
        uc: &mut SessionStateUpdateCriteria,
    ) {
        log::info!("Event trigger {trigger:?} is pending for {}", self.session_id);
        self.set_event_trigger(trigger, EventTriggerState::Pending, uc);
    }

    pub fn mark_event_trigger_as_triggered(
        &mut self,
        trigger: EventTrigger,
        uc: &mut SessionStateUpdateCriteria,
    ) {
        if self.pending_event_triggers.get(&trigger) != Some(&EventTriggerState::Pending) {
            log::warn!(
                "Event trigger {trigger:?} requested to be triggered is not pending for {}",
                self.session_id
            );
        }
        log::info!("Event trigger {trigger:?} is ready to update for {}", self.session_id);
        self.set_event_trigger(trigger, EventTriggerState::Ready, uc);
    }

    pub fn remove_event_trigger(
        &mut self,
        trigger: EventTrigger,
        uc: &mut SessionStateUpdateCriteria,
    ) {
        log::info!("Event trigger {trigger:?} is removed for {}", self.session_id);
        self.pending_event_triggers.remove(&trigger);
        self.set_event_trigger(trigger, EventTriggerState::Cleared, uc);
    }

    pub fn set_event_trigger(
        &mut self,
        trigger: EventTrigger,
        state: EventTriggerState,
        uc: &mut SessionStateUpdateCriteria,
    ) {
        self.pending_event_triggers.insert(trigger, state);
        uc.is_pending_event_triggers_updated = true;
        uc.pending_event_triggers.insert(trigger, state);
    }

    pub fn set_revalidation_time(&mut self, time: u64, uc: &mut SessionStateUpdateCriteria) {
        self.revalidation_time = time;
        uc.revalidation_time = time;
    }

    // ------------------------------------------------------------------
    // QoS / bearer management
    // ------------------------------------------------------------------

    /// Derive the dedicated-bearer changes required by one rule change
    /// batch: new bearers for installed QoS-bearing rules, deletions for
    /// removed ones.
    pub fn get_dedicated_bearer_updates(
        &mut self,
        rules_to_activate: &RulesToProcess,
        rules_to_deactivate: &RulesToProcess,
        uc: &mut SessionStateUpdateCriteria,
    ) -> BearerUpdate {
        let mut update = BearerUpdate::default();
        for rule_id in &rules_to_activate.static_rules {
            self.update_bearer_creation_req(PolicyType::Static, rule_id, &mut update);
        }
        for rule in &rules_to_activate.dynamic_rules {
            self.update_bearer_creation_req(PolicyType::Dynamic, &rule.id, &mut update);
        }
        for rule_id in &rules_to_deactivate.static_rules {
            self.update_bearer_deletion_req(PolicyType::Static, rule_id, &mut update, uc);
        }
        for rule in &rules_to_deactivate.dynamic_rules {
            self.update_bearer_deletion_req(PolicyType::Dynamic, &rule.id, &mut update, uc);
        }
        update
    }

    fn policy_has_qos(&self, policy_type: PolicyType, rule_id: &str) -> Option<PolicyRule> {
        let rule = match policy_type {
            PolicyType::Static => self.static_rules.get_rule(rule_id),
            PolicyType::Dynamic => self.dynamic_rules.get_rule(rule_id).cloned(),
        }?;
        if rule.has_qos() {
            Some(rule)
        } else {
            None
        }
    }

    fn update_bearer_creation_req(
        &mut self,
        policy_type: PolicyType,
        rule_id: &str,
        update: &mut BearerUpdate,
    ) {
        let lte = match self.config.lte_context() {
            Some(lte) => lte.clone(),
            None => return,
        };
        if self
            .bearer_id_by_policy
            .contains_key(&PolicyId::new(policy_type, rule_id))
        {
            return;
        }
        let rule = match self.policy_has_qos(policy_type, rule_id) {
            Some(rule) => rule,
            None => return,
        };
        let default_qci = lte.qos.map(|q| q.qos_class_id).unwrap_or(0);
        if rule.qos.map(|q| q.qci) == Some(default_qci) {
            // the default bearer already covers this QCI
            return;
        }
        let create_req = update.create_req.get_or_insert_with(|| CreateBearerRequest {
            sid: self.imsi.clone(),
            ip_addr: self.config.common_context.ue_ipv4.clone(),
            link_bearer_id: lte.bearer_id,
            policy_rules: Vec::new(),
        });
        create_req.policy_rules.push(rule);
        // The policy-to-bearer binding lands once the SGW acknowledges.
    }

    fn update_bearer_deletion_req(
        &mut self,
        policy_type: PolicyType,
        rule_id: &str,
        update: &mut BearerUpdate,
        uc: &mut SessionStateUpdateCriteria,
    ) {
        let lte = match self.config.lte_context() {
            Some(lte) => lte.clone(),
            None => return,
        };
        let policy_id = PolicyId::new(policy_type, rule_id);
        let bearer_id = match self.bearer_id_by_policy.remove(&policy_id) {
            Some(bearer_id) => bearer_id,
            None => return,
        };
        uc.is_bearer_mapping_updated = true;
        uc.bearer_id_by_policy = self.bearer_id_by_policy.clone();

        let delete_req = update.delete_req.get_or_insert_with(|| DeleteBearerRequest {
            sid: self.imsi.clone(),
            ip_addr: self.config.common_context.ue_ipv4.clone(),
            link_bearer_id: lte.bearer_id,
            eps_bearer_ids: Vec::new(),
        });
        delete_req.eps_bearer_ids.push(bearer_id);
    }

    /// Record the SGW-assigned bearer id for a QoS-bearing policy.
    /// Assumes the bearer id is non-zero.
    pub fn bind_policy_to_bearer(
        &mut self,
        rule_id: &str,
        bearer_id: u32,
        uc: &mut SessionStateUpdateCriteria,
    ) {
        let policy_type = match self.get_policy_type(rule_id) {
            Some(policy_type) => policy_type,
            None => {
                log::debug!("Policy {rule_id} not found when trying to bind to bearer {bearer_id}");
                return;
            }
        };
        log::info!(
            "{} now has policy {rule_id} tied to bearer {bearer_id}",
            self.session_id
        );
        self.bearer_id_by_policy
            .insert(PolicyId::new(policy_type, rule_id), bearer_id);
        uc.is_bearer_mapping_updated = true;
        uc.bearer_id_by_policy = self.bearer_id_by_policy.clone();
    }

    pub fn get_bearer_id_for_policy(&self, policy_id: &PolicyId) -> Option<u32> {
        self.bearer_id_by_policy.get(policy_id).copied()
    }

    // ------------------------------------------------------------------
    // Session info
    // ------------------------------------------------------------------

    /// Snapshot the installed rules for the data plane
    pub fn get_session_info(&self) -> SessionInfo {
        SessionInfo {
            imsi: self.imsi.clone(),
            ip_addr: self.config.common_context.ue_ipv4.clone(),
            static_rules: self.active_static_rules.clone(),
            dynamic_rules: self.dynamic_rules.rules(),
            gy_dynamic_rules: self.gy_dynamic_rules.rules(),
            restrict_rules: self.active_restrict_rules.clone(),
            ambr: self.config.apn_ambr(),
        }
    }

    // ------------------------------------------------------------------
    // Journal merge
    // ------------------------------------------------------------------

    fn apply_charging_credit_update(
        &mut self,
        key: CreditKey,
        credit_update: &SessionCreditUpdateCriteria,
    ) {
        if credit_update.deleted {
            self.credit_map.remove(&key);
            return;
        }
        let grant = match self.credit_map.get_mut(&key) {
            Some(grant) => grant,
            None => return,
        };
        grant
            .credit
            .set_grant_tracking_type(credit_update.grant_tracking_type);
        grant
            .credit
            .set_received_granted_units(credit_update.received_granted_units);
        grant.credit.set_reporting(credit_update.reporting);
        for bucket in ALL_BUCKETS {
            grant
                .credit
                .add_credit(credit_update.bucket_deltas[bucket as usize], bucket);
        }
        grant.is_final = credit_update.is_final;
        grant.final_action_info = credit_update.final_action_info.clone();
        grant.expiry_time = credit_update.expiry_time;
        grant.reauth_state = credit_update.reauth_state;
        grant.service_state = credit_update.service_state;
    }

    fn apply_monitor_update(&mut self, mkey: &str, credit_update: &SessionCreditUpdateCriteria) {
        if credit_update.deleted {
            self.monitor_map.remove(mkey);
            return;
        }
        let monitor = match self.monitor_map.get_mut(mkey) {
            Some(monitor) => monitor,
            None => return,
        };
        monitor
            .credit
            .set_grant_tracking_type(credit_update.grant_tracking_type);
        monitor
            .credit
            .set_received_granted_units(credit_update.received_granted_units);
        monitor.credit.set_reporting(credit_update.reporting);
        for bucket in ALL_BUCKETS {
            monitor
                .credit
                .add_credit(credit_update.bucket_deltas[bucket as usize], bucket);
        }
    }

    /// Replay a journal onto this session instance. Returns false on a
    /// merge precondition violation; the caller then discards the
    /// journal and re-reads authoritative state.
    pub fn apply_update_criteria(&mut self, uc: &SessionStateUpdateCriteria) -> bool {
        let mut scratch = SessionStateUpdateCriteria::default();

        if uc.is_fsm_updated {
            self.state = uc.updated_fsm_state;
        }
        if uc.is_pending_event_triggers_updated {
            for (trigger, state) in &uc.pending_event_triggers {
                self.pending_event_triggers.insert(*trigger, *state);
                if *trigger == EventTrigger::RevalidationTimeout {
                    self.revalidation_time = uc.revalidation_time;
                }
            }
        }
        if uc.is_bearer_mapping_updated {
            self.bearer_id_by_policy = uc.bearer_id_by_policy.clone();
        }
        if uc.is_config_updated {
            self.config = uc.updated_config.clone();
        }
        self.request_number += uc.request_number_increment;
        if let Some(state) = uc.updated_subscriber_quota_state {
            self.subscriber_quota_state = state;
        }

        // static rules
        for rule_id in &uc.static_rules_to_install {
            if self.is_static_rule_installed(rule_id) {
                log::error!(
                    "Failed to merge {}: static rule already installed: {rule_id}",
                    self.session_id
                );
                return false;
            }
            if let Some(lifetime) = uc.new_rule_lifetimes.get(rule_id) {
                self.activate_static_rule(rule_id, *lifetime, &mut scratch);
            } else if self.is_static_rule_scheduled(rule_id) {
                self.install_scheduled_static_rule(rule_id, &mut scratch);
            } else {
                log::error!(
                    "Failed to merge {}: rule lifetime is unspecified: {rule_id}",
                    self.session_id
                );
                return false;
            }
        }
        for rule_id in &uc.static_rules_to_uninstall {
            if self.is_static_rule_installed(rule_id) {
                self.deactivate_static_rule(rule_id, &mut scratch);
            } else if self.is_static_rule_scheduled(rule_id) {
                self.install_scheduled_static_rule(rule_id, &mut scratch);
                self.deactivate_static_rule(rule_id, &mut scratch);
            } else {
                log::error!(
                    "Failed to merge {}: static rule already uninstalled: {rule_id}",
                    self.session_id
                );
                return false;
            }
        }
        for rule_id in &uc.new_scheduled_static_rules {
            if self.is_static_rule_scheduled(rule_id) {
                log::error!(
                    "Failed to merge {}: static rule already scheduled: {rule_id}",
                    self.session_id
                );
                return false;
            }
            let lifetime = uc.new_rule_lifetimes.get(rule_id).copied().unwrap_or_default();
            self.schedule_static_rule(rule_id, lifetime, &mut scratch);
        }

        // dynamic rules
        for rule in &uc.dynamic_rules_to_install {
            if self.is_dynamic_rule_installed(&rule.id) {
                log::error!(
                    "Failed to merge {}: dynamic rule already installed: {}",
                    self.session_id,
                    rule.id
                );
                return false;
            }
            if let Some(lifetime) = uc.new_rule_lifetimes.get(&rule.id) {
                self.insert_dynamic_rule(rule.clone(), *lifetime, &mut scratch);
            } else if self.is_dynamic_rule_scheduled(&rule.id) {
                self.install_scheduled_dynamic_rule(&rule.id, &mut scratch);
            } else {
                log::error!(
                    "Failed to merge {}: rule lifetime is unspecified: {}",
                    self.session_id,
                    rule.id
                );
                return false;
            }
        }
        for rule_id in &uc.dynamic_rules_to_uninstall {
            if self.is_dynamic_rule_installed(rule_id) {
                self.dynamic_rules.remove_rule(rule_id);
            } else if self.is_dynamic_rule_scheduled(rule_id) {
                self.install_scheduled_dynamic_rule(rule_id, &mut scratch);
                self.dynamic_rules.remove_rule(rule_id);
            } else {
                log::error!(
                    "Failed to merge {}: dynamic rule already uninstalled: {rule_id}",
                    self.session_id
                );
                return false;
            }
        }
        for rule in &uc.new_scheduled_dynamic_rules {
            if self.is_dynamic_rule_scheduled(&rule.id) {
                log::error!(
                    "Failed to merge {}: dynamic rule already scheduled: {}",
                    self.session_id,
                    rule.id
                );
                return false;
            }
            let lifetime = uc
                .new_rule_lifetimes
                .get(&rule.id)
                .copied()
                .unwrap_or_default();
            self.schedule_dynamic_rule(rule.clone(), lifetime, &mut scratch);
        }

        // gy dynamic rules
        for rule in &uc.gy_dynamic_rules_to_install {
            if self.is_gy_dynamic_rule_installed(&rule.id) {
                log::error!(
                    "Failed to merge {}: gy dynamic rule already installed: {}",
                    self.session_id,
                    rule.id
                );
                return false;
            }
            match uc.new_rule_lifetimes.get(&rule.id) {
                Some(lifetime) => {
                    self.insert_gy_dynamic_rule(rule.clone(), *lifetime, &mut scratch);
                }
                None => {
                    log::error!(
                        "Failed to merge {}: gy dynamic rule lifetime is not found",
                        self.session_id
                    );
                    return false;
                }
            }
        }
        for rule_id in &uc.gy_dynamic_rules_to_uninstall {
            if self.is_gy_dynamic_rule_installed(rule_id) {
                self.gy_dynamic_rules.remove_rule(rule_id);
            } else {
                log::error!(
                    "Failed to merge {}: gy dynamic rule already uninstalled: {rule_id}",
                    self.session_id
                );
                return false;
            }
        }

        // restrict rules
        for rule_id in &uc.restrict_rules_to_install {
            if self.is_restrict_rule_installed(rule_id) {
                log::error!(
                    "Failed to merge {}: restrict rule already installed: {rule_id}",
                    self.session_id
                );
                return false;
            }
            match uc.new_rule_lifetimes.get(rule_id) {
                Some(lifetime) => self.activate_restrict_rule(rule_id, *lifetime, &mut scratch),
                None => {
                    log::error!(
                        "Failed to merge {}: rule lifetime is unspecified: {rule_id}",
                        self.session_id
                    );
                    return false;
                }
            }
        }
        for rule_id in &uc.restrict_rules_to_uninstall {
            if self.is_restrict_rule_installed(rule_id) {
                self.deactivate_restrict_rule(rule_id, &mut scratch);
            } else {
                log::error!(
                    "Failed to merge {}: restrict rule already uninstalled: {rule_id}",
                    self.session_id
                );
                return false;
            }
        }

        // charging credit: installs land first so that per-key diffs
        // recorded after an install in the same journal still apply
        for (key, stored_grant) in &uc.charging_credit_to_install {
            self.credit_map
                .insert(*key, ChargingGrant::from_stored(stored_grant));
        }
        for (key, credit_update) in &uc.charging_credit_map {
            self.apply_charging_credit_update(*key, credit_update);
        }

        // monitoring credit
        if uc.is_session_level_key_updated {
            self.session_level_key = uc.updated_session_level_key.clone();
        }
        for (mkey, stored_monitor) in &uc.monitor_credit_to_install {
            self.monitor_map
                .insert(mkey.clone(), Monitor::from_stored(stored_monitor));
        }
        for (mkey, credit_update) in &uc.monitor_credit_map {
            self.apply_monitor_update(mkey, credit_update);
        }

        if uc.updated_pdp_end_time > 0 {
            self.pdp_end_time = uc.updated_pdp_end_time;
        }

        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cg_proto::{
        ChargingCredit, CreditUnit, FinalAction, GrantedUnits, RedirectAddressType,
        RedirectServer, TrackingType,
    };
    use crate::stored::default_update_criteria;

    fn lte_config() -> SessionConfig {
        SessionConfig {
            common_context: cg_proto::CommonSessionContext {
                imsi: "IMSI001".to_string(),
                msisdn: "5551234".to_string(),
                apn: "magma.ipv4".to_string(),
                rat_type: Some(cg_proto::RatType::Lte),
                ue_ipv4: "192.168.128.11".to_string(),
            },
            rat_specific_context: RatSpecificContext::Lte(cg_proto::LteSessionContext {
                bearer_id: 5,
                qos: Some(cg_proto::QosInformation {
                    qos_class_id: 9,
                    ambr: None,
                }),
                ..Default::default()
            }),
        }
    }

    fn charged_rule(id: &str, rg: u32) -> PolicyRule {
        let mut rule = PolicyRule::new(id, 10);
        rule.rating_group = rg;
        rule.tracking_type = TrackingType::OnlyOcs;
        rule
    }

    fn new_session() -> SessionState {
        let store = Arc::new(StaticRuleStore::new());
        store.insert_rule(charged_rule("r-rg10", 10));
        SessionState::new("IMSI001", "s1", lte_config(), store, 1000)
    }

    fn grant_response(rg: u32, total: u64) -> CreditUpdateResponse {
        CreditUpdateResponse {
            success: true,
            sid: "IMSI001".to_string(),
            session_id: "s1".to_string(),
            charging_key: rg,
            credit: ChargingCredit {
                granted_units: GrantedUnits::total_only(total),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn test_request_number_starts_at_one() {
        let session = new_session();
        assert_eq!(session.get_request_number(), 1);
        assert!(session.is_active());
    }

    #[test]
    fn test_usage_flows_into_grant_and_update() {
        let mut session = new_session();
        let mut uc = default_update_criteria();
        assert!(session.receive_charging_credit(&grant_response(10, 1000), 0, &mut uc));

        session.activate_static_rule("r-rg10", RuleLifetime::unbounded(), &mut uc);
        session.add_rule_usage("r-rg10", 800, 0, &mut uc);
        assert_eq!(
            session.get_charging_credit(&CreditKey::new(10), Bucket::UsedTx),
            800
        );

        let mut request = UpdateSessionRequest::default();
        let mut actions = Vec::new();
        session.get_updates(&mut request, &mut actions, &mut uc, 0);
        assert_eq!(request.updates.len(), 1);
        assert_eq!(request.updates[0].usage.bytes_tx, 800);
        assert_eq!(request.updates[0].request_number, 1);
        assert_eq!(session.get_request_number(), 2);
        assert!(actions.is_empty());

        // coalescing: while the report is in flight no new update is made
        let mut request2 = UpdateSessionRequest::default();
        session.get_updates(&mut request2, &mut actions, &mut uc, 0);
        assert!(request2.updates.is_empty());

        // refill response
        assert!(session.receive_charging_credit(&grant_response(10, 2000), 0, &mut uc));
        let key = CreditKey::new(10);
        assert_eq!(session.get_charging_credit(&key, Bucket::UsedTx), 800);
        assert_eq!(session.get_charging_credit(&key, Bucket::AllowedTotal), 3000);
        assert_eq!(session.get_charging_credit(&key, Bucket::ReportingTx), 0);
        assert_eq!(session.get_charging_credit(&key, Bucket::ReportedTx), 800);
    }

    #[test]
    fn test_usage_for_unknown_charging_key_is_discarded() {
        let mut session = new_session();
        let mut uc = default_update_criteria();
        // no credit received for rg 10
        session.add_rule_usage("r-rg10", 100, 100, &mut uc);
        assert_eq!(
            session.get_charging_credit(&CreditKey::new(10), Bucket::UsedTx),
            0
        );
        assert!(uc.charging_credit_map.is_empty());
    }

    #[test]
    fn test_redirect_action_emitted_once() {
        let mut session = new_session();
        let mut uc = default_update_criteria();
        let mut response = grant_response(10, 1000);
        response.credit.is_final = true;
        response.credit.final_action = FinalAction::Redirect;
        response.credit.redirect_server = Some(RedirectServer {
            address_type: RedirectAddressType::Url,
            server_address: "http://portal.example.net".to_string(),
        });
        assert!(session.receive_charging_credit(&response, 0, &mut uc));

        session.activate_static_rule("r-rg10", RuleLifetime::unbounded(), &mut uc);
        session.add_rule_usage("r-rg10", 1000, 0, &mut uc);

        let mut request = UpdateSessionRequest::default();
        let mut actions = Vec::new();
        session.get_updates(&mut request, &mut actions, &mut uc, 0);
        // no credit usage update for the exhausted final grant
        assert!(request.updates.is_empty());
        assert_eq!(actions.len(), 1);
        assert_eq!(actions[0].action_type, ServiceActionType::Redirect);
        assert!(actions[0].redirect_server.is_some());
        assert!(actions[0].rule_ids.contains(&"r-rg10".to_string()));

        // the action is one-shot
        let mut actions2 = Vec::new();
        session.get_updates(&mut request, &mut actions2, &mut uc, 0);
        assert!(actions2.is_empty());
    }

    #[test]
    fn test_no_updates_when_not_active() {
        let mut session = new_session();
        let mut uc = default_update_criteria();
        assert!(session.receive_charging_credit(&grant_response(10, 100), 0, &mut uc));
        session.activate_static_rule("r-rg10", RuleLifetime::unbounded(), &mut uc);
        session.add_rule_usage("r-rg10", 100, 0, &mut uc);

        session.set_fsm_state(SessionFsmState::Released, &mut uc);
        let mut request = UpdateSessionRequest::default();
        let mut actions = Vec::new();
        session.get_updates(&mut request, &mut actions, &mut uc, 0);
        assert!(request.is_empty());
    }

    #[test]
    fn test_fsm_terminated_is_absorbing() {
        let mut session = new_session();
        let mut uc = default_update_criteria();
        session.set_fsm_state(SessionFsmState::Released, &mut uc);
        session.set_fsm_state(SessionFsmState::Terminated, &mut uc);
        session.set_fsm_state(SessionFsmState::Active, &mut uc);
        assert_eq!(session.get_state(), SessionFsmState::Terminated);
    }

    #[test]
    fn test_reauth_key_and_cycle() {
        let mut session = new_session();
        let mut uc = default_update_criteria();
        assert!(session.receive_charging_credit(&grant_response(10, 1000), 0, &mut uc));

        let key = CreditKey::new(10);
        assert_eq!(session.reauth_key(key, &mut uc), ReAuthResult::UpdateInitiated);

        let mut request = UpdateSessionRequest::default();
        let mut actions = Vec::new();
        session.get_updates(&mut request, &mut actions, &mut uc, 0);
        assert_eq!(request.updates.len(), 1);
        assert_eq!(
            request.updates[0].usage.update_type,
            CreditUsageType::ReauthRequired
        );

        // the response resets the reauth cycle
        assert!(session.receive_charging_credit(&grant_response(10, 500), 0, &mut uc));
        let mut request2 = UpdateSessionRequest::default();
        session.get_updates(&mut request2, &mut actions, &mut uc, 0);
        assert!(request2.updates.is_empty());
    }

    #[test]
    fn test_reauth_unknown_key_installs_grant() {
        let mut session = new_session();
        let mut uc = default_update_criteria();
        let key = CreditKey::new(99);
        assert_eq!(session.reauth_key(key, &mut uc), ReAuthResult::UpdateInitiated);
        assert!(uc.charging_credit_to_install.contains_key(&key));
    }

    #[test]
    fn test_monitor_update_and_zero_grant_deferral() {
        let mut session = new_session();
        let mut uc = default_update_criteria();
        let response = UsageMonitoringUpdateResponse {
            success: true,
            sid: "IMSI001".to_string(),
            session_id: "s1".to_string(),
            credit: Some(UsageMonitoringCredit {
                action: MonitorAction::Continue,
                monitoring_key: "m1".to_string(),
                level: MonitoringLevel::RuleLevel,
                granted_units: GrantedUnits::total_only(1000),
            }),
            ..Default::default()
        };
        assert!(session.receive_monitor(&response, &mut uc));

        session.add_to_monitor("m1", 800, 0, &mut uc);
        let mut request = UpdateSessionRequest::default();
        let mut actions = Vec::new();
        session.get_updates(&mut request, &mut actions, &mut uc, 0);
        assert_eq!(request.usage_monitors.len(), 1);
        let update = request.usage_monitors[0].update.as_ref().unwrap();
        assert_eq!(update.bytes_tx, 800);

        // zero top-up: partially consumed usage defers the final report
        let mut zero = response.clone();
        zero.credit.as_mut().unwrap().granted_units = GrantedUnits::total_only(0);
        assert!(session.receive_monitor(&zero, &mut uc));
        session.add_to_monitor("m1", 100, 0, &mut uc);
        let mut request2 = UpdateSessionRequest::default();
        session.get_updates(&mut request2, &mut actions, &mut uc, 0);
        assert!(request2.usage_monitors.is_empty());

        // total consumption emits the last report
        session.add_to_monitor("m1", 100, 0, &mut uc);
        let mut request3 = UpdateSessionRequest::default();
        session.get_updates(&mut request3, &mut actions, &mut uc, 0);
        assert_eq!(request3.usage_monitors.len(), 1);
    }

    #[test]
    fn test_session_level_key_cleared_on_disable() {
        let mut session = new_session();
        let mut uc = default_update_criteria();
        let mut response = UsageMonitoringUpdateResponse {
            success: true,
            credit: Some(UsageMonitoringCredit {
                action: MonitorAction::Continue,
                monitoring_key: "mk-session".to_string(),
                level: MonitoringLevel::SessionLevel,
                granted_units: GrantedUnits::total_only(1000),
            }),
            ..Default::default()
        };
        session.receive_monitor(&response, &mut uc);
        assert_eq!(session.get_session_level_key(), "mk-session");

        response.credit.as_mut().unwrap().action = MonitorAction::Disable;
        session.receive_monitor(&response, &mut uc);
        assert_eq!(session.get_session_level_key(), "");
        assert!(uc.is_session_level_key_updated);
    }

    #[test]
    fn test_rule_scheduling_and_sync() {
        let mut session = new_session();
        let mut uc = default_update_criteria();
        let now = 10_000;

        session.schedule_static_rule(
            "r-sched",
            RuleLifetime {
                activation_time: now - 60,
                deactivation_time: now + 120,
            },
            &mut uc,
        );
        session.schedule_static_rule(
            "r-expired",
            RuleLifetime {
                activation_time: now - 100,
                deactivation_time: now - 10,
            },
            &mut uc,
        );
        session.activate_static_rule(
            "r-past",
            RuleLifetime {
                activation_time: now - 100,
                deactivation_time: now - 10,
            },
            &mut uc,
        );

        session.sync_rules_to_time(now, &mut uc);
        assert!(session.is_static_rule_installed("r-sched"));
        assert!(!session.is_static_rule_scheduled("r-sched"));
        assert!(!session.is_static_rule_scheduled("r-expired"));
        assert!(!session.is_static_rule_installed("r-expired"));
        assert!(!session.is_static_rule_installed("r-past"));
        assert!(uc.static_rules_to_uninstall.contains("r-past"));
        assert!(uc.static_rules_to_uninstall.contains("r-expired"));
    }

    #[test]
    fn test_rule_id_never_in_both_active_and_scheduled() {
        let mut session = new_session();
        let mut uc = default_update_criteria();
        session.schedule_static_rule("r1", RuleLifetime::unbounded(), &mut uc);
        session.install_scheduled_static_rule("r1", &mut uc);
        assert!(session.is_static_rule_installed("r1"));
        assert!(!session.is_static_rule_scheduled("r1"));

        let mut rule = charged_rule("d1", 11);
        rule.priority = 3;
        session.schedule_dynamic_rule(rule, RuleLifetime::unbounded(), &mut uc);
        session.install_scheduled_dynamic_rule("d1", &mut uc);
        assert!(session.is_dynamic_rule_installed("d1"));
        assert!(!session.is_dynamic_rule_scheduled("d1"));
    }

    #[test]
    fn test_apply_rule_set_produces_deltas() {
        let mut session = new_session();
        let mut uc = default_update_criteria();
        session.activate_static_rule("old-static", RuleLifetime::unbounded(), &mut uc);
        session.insert_dynamic_rule(
            charged_rule("old-dyn", 12),
            RuleLifetime::unbounded(),
            &mut uc,
        );

        let mut desired = RuleSetToApply::default();
        desired.static_rules.insert("new-static".to_string());
        desired
            .dynamic_rules
            .insert("new-dyn".to_string(), charged_rule("new-dyn", 13));

        let mut to_activate = RulesToProcess::default();
        let mut to_deactivate = RulesToProcess::default();
        session.apply_session_rule_set(&desired, &mut to_activate, &mut to_deactivate, &mut uc);

        assert_eq!(to_activate.static_rules, vec!["new-static"]);
        assert_eq!(to_activate.dynamic_rules.len(), 1);
        assert_eq!(to_deactivate.static_rules, vec!["old-static"]);
        assert_eq!(to_deactivate.dynamic_rules[0].id, "old-dyn");
        assert!(session.is_static_rule_installed("new-static"));
        assert!(!session.is_static_rule_installed("old-static"));
    }

    #[test]
    fn test_bearer_creation_for_differing_qci() {
        let mut session = new_session();
        let mut uc = default_update_criteria();
        let mut rule = charged_rule("qos-rule", 14);
        rule.qos = Some(cg_proto::FlowQos {
            qci: 5,
            max_req_bw_ul: 0,
            max_req_bw_dl: 0,
        });
        session.insert_dynamic_rule(rule.clone(), RuleLifetime::unbounded(), &mut uc);

        let mut to_activate = RulesToProcess::default();
        to_activate.dynamic_rules.push(rule);
        let update = session.get_dedicated_bearer_updates(
            &to_activate,
            &RulesToProcess::default(),
            &mut uc,
        );
        let create_req = update.create_req.unwrap();
        assert_eq!(create_req.link_bearer_id, 5);
        assert_eq!(create_req.policy_rules.len(), 1);

        // SGW ack binds the bearer
        session.bind_policy_to_bearer("qos-rule", 7, &mut uc);
        assert_eq!(
            session.get_bearer_id_for_policy(&PolicyId::new(PolicyType::Dynamic, "qos-rule")),
            Some(7)
        );

        // removal produces the deletion request
        let mut to_deactivate = RulesToProcess::default();
        to_deactivate
            .dynamic_rules
            .push(session.get_dynamic_rules().get_rule("qos-rule").unwrap().clone());
        let update = session.get_dedicated_bearer_updates(
            &RulesToProcess::default(),
            &to_deactivate,
            &mut uc,
        );
        assert_eq!(update.delete_req.unwrap().eps_bearer_ids, vec![7]);
    }

    #[test]
    fn test_no_bearer_for_default_qci() {
        let mut session = new_session();
        let mut uc = default_update_criteria();
        let mut rule = charged_rule("default-qci", 14);
        rule.qos = Some(cg_proto::FlowQos {
            qci: 9,
            max_req_bw_ul: 0,
            max_req_bw_dl: 0,
        });
        session.insert_dynamic_rule(rule.clone(), RuleLifetime::unbounded(), &mut uc);

        let mut to_activate = RulesToProcess::default();
        to_activate.dynamic_rules.push(rule);
        let update = session.get_dedicated_bearer_updates(
            &to_activate,
            &RulesToProcess::default(),
            &mut uc,
        );
        assert!(update.create_req.is_none());
    }

    #[test]
    fn test_termination_request_collects_all_usage() {
        let mut session = new_session();
        let mut uc = default_update_criteria();
        session.receive_charging_credit(&grant_response(10, 1000), 0, &mut uc);
        session.activate_static_rule("r-rg10", RuleLifetime::unbounded(), &mut uc);
        session.add_rule_usage("r-rg10", 300, 50, &mut uc);

        let request_number_before = session.get_request_number();
        let req = session.make_termination_request(&mut uc);
        assert_eq!(req.sid, "IMSI001");
        assert_eq!(req.credit_usages.len(), 1);
        assert_eq!(req.credit_usages[0].bytes_tx, 300);
        assert_eq!(req.credit_usages[0].update_type, CreditUsageType::Terminated);
        assert_eq!(session.get_request_number(), request_number_before + 1);
    }

    #[test]
    fn test_apply_update_criteria_matches_in_place_mutation() {
        let mut session = new_session();
        let clone_base = session.clone();
        let mut uc = default_update_criteria();

        session.receive_charging_credit(&grant_response(10, 1000), 0, &mut uc);
        session.activate_static_rule("r-rg10", RuleLifetime::unbounded(), &mut uc);
        session.add_rule_usage("r-rg10", 800, 10, &mut uc);
        session.set_fsm_state(SessionFsmState::Released, &mut uc);
        session.bind_policy_to_bearer("r-rg10", 9, &mut uc);

        let mut replayed = clone_base;
        assert!(replayed.apply_update_criteria(&uc));

        let marshaled = session.marshal();
        let replayed_marshaled = replayed.marshal();
        assert_eq!(marshaled.fsm_state, replayed_marshaled.fsm_state);
        assert_eq!(marshaled.static_rule_ids, replayed_marshaled.static_rule_ids);
        assert_eq!(marshaled.bearer_id_by_policy.len(), 1);
        let mut lhs = marshaled.credit_map.clone();
        let mut rhs = replayed_marshaled.credit_map.clone();
        lhs.sort_by_key(|(key, _)| key.rating_group);
        rhs.sort_by_key(|(key, _)| key.rating_group);
        assert_eq!(lhs, rhs);
    }

    #[test]
    fn test_apply_update_criteria_rejects_duplicate_install() {
        let mut session = new_session();
        let mut uc = default_update_criteria();
        session.activate_static_rule("dup", RuleLifetime::unbounded(), &mut uc);

        let mut journal = default_update_criteria();
        journal.static_rules_to_install.insert("dup".to_string());
        journal
            .new_rule_lifetimes
            .insert("dup".to_string(), RuleLifetime::unbounded());
        assert!(!session.apply_update_criteria(&journal));
    }

    #[test]
    fn test_marshal_unmarshal_round_trip() {
        let mut session = new_session();
        let mut uc = default_update_criteria();
        session.receive_charging_credit(&grant_response(10, 1000), 0, &mut uc);
        session.activate_static_rule("r-rg10", RuleLifetime::unbounded(), &mut uc);
        session.add_rule_usage("r-rg10", 10, 20, &mut uc);
        session.insert_dynamic_rule(charged_rule("d1", 11), RuleLifetime::unbounded(), &mut uc);
        session.add_new_event_trigger(EventTrigger::RevalidationTimeout, &mut uc);
        session.set_revalidation_time(12345, &mut uc);

        let stored = session.marshal();
        let restored = SessionState::unmarshal(
            &stored,
            Arc::new(StaticRuleStore::new()),
        );
        assert_eq!(restored.imsi(), session.imsi());
        assert_eq!(restored.get_request_number(), session.get_request_number());
        assert_eq!(restored.get_state(), session.get_state());
        assert_eq!(restored.get_revalidation_time(), 12345);
        assert!(restored.is_dynamic_rule_installed("d1"));
        assert_eq!(
            restored.get_charging_credit(&CreditKey::new(10), Bucket::UsedTx),
            10
        );
        // the restored marshalled form observably matches
        let restored_stored = restored.marshal();
        assert_eq!(stored.static_rule_ids, restored_stored.static_rule_ids);
        assert_eq!(stored.request_number, restored_stored.request_number);
    }

    #[test]
    fn test_total_credit_usage() {
        let mut session = new_session();
        let mut uc = default_update_criteria();
        session.receive_charging_credit(&grant_response(10, 1000), 0, &mut uc);
        session.activate_static_rule("r-rg10", RuleLifetime::unbounded(), &mut uc);
        session.add_rule_usage("r-rg10", 111, 222, &mut uc);

        let usage = session.get_total_credit_usage();
        assert_eq!(usage.charging_tx, 111);
        assert_eq!(usage.charging_rx, 222);
        assert_eq!(usage.monitoring_tx, 0);
    }

    #[test]
    fn test_grant_tracking_mixed_units() {
        let mut session = new_session();
        let mut uc = default_update_criteria();
        let mut response = grant_response(10, 0);
        response.credit.granted_units = GrantedUnits {
            total: CreditUnit::valid(100),
            tx: CreditUnit::valid(60),
            rx: CreditUnit::valid(40),
        };
        assert!(session.receive_charging_credit(&response, 0, &mut uc));
        assert_eq!(
            session.get_charging_credit(&CreditKey::new(10), Bucket::AllowedTx),
            60
        );
    }
}
