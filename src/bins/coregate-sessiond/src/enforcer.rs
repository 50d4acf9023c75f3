//! Local enforcer
//!
//! The orchestrator of the engine: aggregates data-plane usage into
//! sessions, collects and reports credit updates, applies cloud
//! responses, executes service actions, drives session termination,
//! handles charging and policy reauth, schedules rule activations and
//! deactivations, and manages dedicated bearers.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use anyhow::Result;

use cg_proto::{
    ChargingReAuthRequest, ChargingReAuthType, CreateSessionResponse, CreditKey, DynamicRuleInstall,
    EventTrigger, PolicyBearerBindingRequest, PolicyReAuthAnswer, PolicyReAuthFailureCode,
    PolicyReAuthRequest, PolicyRule, RatSpecificContext, ReAuthResult,
    RedirectInformation, RedirectServer, RequestOriginType, RuleRecordTable, SessionConfig,
    SessionRules, SetupFlowsResult, StaticRuleInstall, SubscriberQuotaState, SubscriberQuotaUpdate,
    TrackingType, UpdateSessionRequest, UpdateSessionResponse,
    UsageMonitoringUpdateResponse,
};

use crate::actions::{ServiceAction, ServiceActionType};
use crate::clients::{AaaClient, DataPlaneClient, DirectoryClient, SessionReporter, SpgwClient};
use crate::config::SessionDConfig;
use crate::credit::Bucket;
use crate::error::SessionError;
use crate::rules::{RuleLifetime, StaticRuleStore};
use crate::session::{RuleSetBySubscriber, RulesToProcess, SessionState};
use crate::stored::{
    default_update_criteria, EventTriggerState, PolicyType, SessionFsmState,
    SessionStateUpdateCriteria,
};
use crate::store::{
    default_session_update, session_uc, SessionMap, SessionRead, SessionStore, SessionUpdate,
};
use crate::timer::{duration_until, SessionTimerId, TimerContext, TimerEntry, TimerMgr};

/// Data-plane priority of the synthesised redirect rule
pub const REDIRECT_FLOW_PRIORITY: u32 = 2000;

/// Current time as epoch seconds
pub fn epoch_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Everything needed to install a final-unit action's flows
#[derive(Debug, Clone)]
struct FinalActionInstallInfo {
    imsi: String,
    session_id: String,
    action_type: ServiceActionType,
    restrict_rule_ids: Vec<String>,
    redirect_server: Option<RedirectServer>,
}

/// The session enforcement orchestrator
pub struct LocalEnforcer {
    reporter: Arc<dyn SessionReporter>,
    rule_store: Arc<StaticRuleStore>,
    session_store: Arc<SessionStore>,
    data_plane: Arc<dyn DataPlaneClient>,
    directory: Arc<dyn DirectoryClient>,
    spgw: Arc<dyn SpgwClient>,
    aaa: Arc<dyn AaaClient>,
    timers: TimerMgr,
    config: SessionDConfig,
}

impl LocalEnforcer {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        reporter: Arc<dyn SessionReporter>,
        rule_store: Arc<StaticRuleStore>,
        session_store: Arc<SessionStore>,
        data_plane: Arc<dyn DataPlaneClient>,
        directory: Arc<dyn DirectoryClient>,
        spgw: Arc<dyn SpgwClient>,
        aaa: Arc<dyn AaaClient>,
        config: SessionDConfig,
    ) -> Self {
        crate::credit::set_terminate_service_when_quota_exhausted(
            config.terminate_service_when_quota_exhausted,
        );
        Self {
            reporter,
            rule_store,
            session_store,
            data_plane,
            directory,
            spgw,
            aaa,
            timers: TimerMgr::new(),
            config,
        }
    }

    pub fn session_store(&self) -> &Arc<SessionStore> {
        &self.session_store
    }

    pub fn timers(&self) -> &TimerMgr {
        &self.timers
    }

    // ------------------------------------------------------------------
    // Data-plane restart recovery
    // ------------------------------------------------------------------

    /// Push all current session rules to the data plane, e.g. after a
    /// data-plane restart. Installs are idempotent under the same epoch.
    pub fn setup(&self, epoch: u64) -> Result<SetupFlowsResult> {
        let session_map = self.session_store.read_all_sessions();
        let mut session_infos = Vec::new();
        let mut quota_updates = Vec::new();
        for sessions in session_map.values() {
            for session in sessions {
                session_infos.push(session.get_session_info());
                if let Some(wlan) = session.get_config().wlan_context() {
                    quota_updates.push(SubscriberQuotaUpdate {
                        sid: session.imsi().to_string(),
                        mac_addr: wlan.mac_addr.clone(),
                        update_type: session.get_subscriber_quota_state(),
                    });
                }
            }
        }
        if !quota_updates.is_empty() {
            if let Err(e) = self.data_plane.update_subscriber_quota_state(&quota_updates) {
                log::error!("Failed to push subscriber quota states on setup: {e}");
            }
        }
        self.data_plane.setup_flows(&session_infos, epoch)
    }

    /// Re-evaluate rule lifetime windows after a restart and re-arm the
    /// corresponding timers. Pending terminations and revalidations are
    /// also re-armed.
    pub fn sync_sessions_on_restart(&self, now: u64) {
        let mut imsis_to_terminate = HashSet::new();
        let session_map = self.session_store.read_all_sessions();
        let mut session_update = default_session_update(&session_map);
        let mut working_map = session_map;

        for (imsi, sessions) in working_map.iter_mut() {
            for session in sessions.iter_mut() {
                let session_id = session.session_id().to_string();
                if session.get_state() == SessionFsmState::TerminationScheduled {
                    imsis_to_terminate.insert(imsi.clone());
                }
                if session.get_event_triggers().get(&EventTrigger::RevalidationTimeout)
                    == Some(&EventTriggerState::Pending)
                {
                    let revalidation_time = session.get_revalidation_time();
                    let uc = session_uc(&mut session_update, imsi, &session_id);
                    self.schedule_revalidation(imsi, session, revalidation_time, uc, now);
                }

                {
                    let uc = session_uc(&mut session_update, imsi, &session_id);
                    session.sync_rules_to_time(now, uc);
                }

                for rule_id in session.get_static_rules().to_vec() {
                    let lifetime = session.get_rule_lifetime(&rule_id).unwrap_or_default();
                    if lifetime.deactivation_time > now {
                        self.schedule_static_rule_deactivation(imsi, &rule_id, lifetime, now);
                    }
                }
                for rule_id in session.get_scheduled_static_rules().clone() {
                    let lifetime = session.get_rule_lifetime(&rule_id).unwrap_or_default();
                    self.schedule_static_rule_activation(imsi, &rule_id, lifetime, now);
                    if lifetime.deactivation_time > now {
                        self.schedule_static_rule_deactivation(imsi, &rule_id, lifetime, now);
                    }
                }
                for rule_id in session.get_dynamic_rules().rule_ids() {
                    let lifetime = session.get_rule_lifetime(&rule_id).unwrap_or_default();
                    if lifetime.deactivation_time > now {
                        self.schedule_dynamic_rule_deactivation(imsi, &rule_id, lifetime, now);
                    }
                }
                for rule_id in session.get_scheduled_dynamic_rules().rule_ids() {
                    let lifetime = session.get_rule_lifetime(&rule_id).unwrap_or_default();
                    self.schedule_dynamic_rule_activation(imsi, &rule_id, lifetime, now);
                    if lifetime.deactivation_time > now {
                        self.schedule_dynamic_rule_deactivation(imsi, &rule_id, lifetime, now);
                    }
                }
            }
        }
        if !imsis_to_terminate.is_empty() {
            log::debug!("Scheduling termination for one or more IMSIs");
            self.schedule_termination(imsis_to_terminate);
        }
        if self.session_store.update_sessions(session_update) {
            log::debug!("Successfully synced sessions after restart");
        } else {
            log::error!("Failed to sync sessions after restart");
        }
    }

    // ------------------------------------------------------------------
    // Usage aggregation
    // ------------------------------------------------------------------

    /// Apply the per-rule usage counters of one data-plane report to the
    /// sessions, then complete termination for sessions whose flows no
    /// longer appear.
    pub fn aggregate_records(
        &self,
        session_map: &mut SessionMap,
        records: &RuleRecordTable,
        session_update: &mut SessionUpdate,
    ) {
        let mut sessions_with_active_flows: HashSet<String> = HashSet::new();
        for record in &records.records {
            let sessions = match session_map.get_mut(&record.sid) {
                Some(sessions) => sessions,
                None => {
                    log::error!(
                        "Could not find session for {} during record aggregation",
                        record.sid
                    );
                    continue;
                }
            };
            sessions_with_active_flows.insert(record.sid.clone());
            if record.bytes_tx > 0 || record.bytes_rx > 0 {
                log::info!(
                    "{} used {} tx bytes and {} rx bytes for rule {}",
                    record.sid,
                    record.bytes_tx,
                    record.bytes_rx,
                    record.rule_id
                );
            }
            for session in sessions.iter_mut() {
                let session_id = session.session_id().to_string();
                let uc = session_uc(session_update, &record.sid, &session_id);
                session.add_rule_usage(&record.rule_id, record.bytes_tx, record.bytes_rx, uc);
            }
        }
        self.complete_termination_for_released_sessions(
            session_map,
            sessions_with_active_flows,
            session_update,
        );
    }

    /// The data plane reports every flow it still carries; a terminating
    /// session absent from the report has fully drained. It is released
    /// and its termination completed.
    fn complete_termination_for_released_sessions(
        &self,
        session_map: &mut SessionMap,
        sessions_with_active_flows: HashSet<String>,
        session_update: &mut SessionUpdate,
    ) {
        let mut to_terminate = Vec::new();
        for (imsi, sessions) in session_map.iter() {
            for session in sessions {
                let draining = matches!(
                    session.get_state(),
                    SessionFsmState::TerminationScheduled | SessionFsmState::Released
                );
                if draining && !sessions_with_active_flows.contains(imsi) {
                    to_terminate.push((imsi.clone(), session.session_id().to_string()));
                }
            }
        }
        for (imsi, session_id) in to_terminate {
            if let Some(session) = session_map
                .get_mut(&imsi)
                .and_then(|sessions| {
                    sessions
                        .iter_mut()
                        .find(|session| session.session_id() == session_id)
                })
            {
                let uc = session_uc(session_update, &imsi, &session_id);
                session.mark_as_released(uc);
            }
            self.complete_termination(session_map, &imsi, &session_id, session_update);
        }
    }

    // ------------------------------------------------------------------
    // Update collection & application
    // ------------------------------------------------------------------

    /// Build the batched update request across all sessions and gather
    /// the service actions to apply immediately.
    pub fn collect_updates(
        &self,
        session_map: &mut SessionMap,
        actions: &mut Vec<ServiceAction>,
        session_update: &mut SessionUpdate,
        now: u64,
    ) -> UpdateSessionRequest {
        let mut request = UpdateSessionRequest::default();
        for (imsi, sessions) in session_map.iter_mut() {
            for session in sessions.iter_mut() {
                let session_id = session.session_id().to_string();
                let uc = session_uc(session_update, imsi, &session_id);
                session.get_updates(&mut request, actions, uc, now);
            }
        }
        request
    }

    /// Reset the reporting buckets of every key that participated in a
    /// request whose entire round-trip failed, so the next cycle
    /// retries them.
    pub fn reset_updates(
        &self,
        session_map: &mut SessionMap,
        failed_request: &UpdateSessionRequest,
        session_update: &mut SessionUpdate,
    ) {
        for update in &failed_request.updates {
            let sessions = match session_map.get_mut(&update.sid) {
                Some(sessions) => sessions,
                None => {
                    log::error!("Could not reset credit for {}: not found", update.sid);
                    continue;
                }
            };
            let key = CreditKey {
                rating_group: update.usage.charging_key,
                service_identifier: update.usage.service_identifier,
            };
            for session in sessions.iter_mut() {
                let session_id = session.session_id().to_string();
                let uc = session_uc(session_update, &update.sid, &session_id);
                session.reset_reporting_charging_credit(&key, uc);
            }
        }
        for monitor in &failed_request.usage_monitors {
            let mkey = match &monitor.update {
                Some(update) => update.monitoring_key.clone(),
                None => continue,
            };
            let sessions = match session_map.get_mut(&monitor.sid) {
                Some(sessions) => sessions,
                None => {
                    log::error!("Could not reset credit for {}: not found", monitor.sid);
                    continue;
                }
            };
            for session in sessions.iter_mut() {
                let session_id = session.session_id().to_string();
                let uc = session_uc(session_update, &monitor.sid, &session_id);
                session.reset_reporting_monitor(&mkey, uc);
            }
        }
    }

    /// Apply a full update response: charging first, then monitoring and
    /// the rule changes it carries. Subscribers with permanent failures
    /// or an exhausted wallet are terminated at the end.
    pub fn update_session_credits_and_rules(
        &self,
        session_map: &mut SessionMap,
        response: &UpdateSessionResponse,
        session_update: &mut SessionUpdate,
        now: u64,
    ) {
        let mut subscribers_to_terminate = HashSet::new();
        self.update_charging_credits(
            session_map,
            response,
            &mut subscribers_to_terminate,
            session_update,
            now,
        );
        self.update_monitoring_credits_and_rules(
            session_map,
            response,
            &mut subscribers_to_terminate,
            session_update,
            now,
        );
        self.terminate_multiple_services(session_map, &subscribers_to_terminate, session_update);
    }

    fn update_charging_credits(
        &self,
        session_map: &mut SessionMap,
        response: &UpdateSessionResponse,
        subscribers_to_terminate: &mut HashSet<String>,
        session_update: &mut SessionUpdate,
        now: u64,
    ) {
        for credit_resp in &response.responses {
            let imsi = &credit_resp.sid;
            if !credit_resp.success {
                handle_command_level_result_code(
                    imsi,
                    credit_resp.result_code,
                    subscribers_to_terminate,
                );
                continue;
            }
            let sessions = match session_map.get_mut(imsi) {
                Some(sessions) => sessions,
                None => {
                    log::error!("Could not find session for {imsi} during update");
                    continue;
                }
            };
            for session in sessions.iter_mut() {
                let session_id = session.session_id().to_string();
                let key = credit_resp.credit_key();
                let was_final_action_state = session.is_credit_in_final_unit_state(&key);
                {
                    let uc = session_uc(session_update, imsi, &session_id);
                    session.receive_charging_credit(credit_resp, now, uc);
                }
                if was_final_action_state {
                    // fresh quota arrived for a key in final-unit
                    // enforcement: withdraw the gy/restrict flows
                    let info = session.get_session_info();
                    let mut gy_rules_to_deactivate = Vec::new();
                    let mut restrict_to_deactivate = Vec::new();
                    for rule in info.gy_dynamic_rules {
                        let uc = session_uc(session_update, imsi, &session_id);
                        if let Some(removed) = session.remove_gy_dynamic_rule(&rule.id, uc) {
                            gy_rules_to_deactivate.push(removed);
                        }
                    }
                    for rule_id in info.restrict_rules {
                        let uc = session_uc(session_update, imsi, &session_id);
                        if session.deactivate_restrict_rule(&rule_id, uc) {
                            restrict_to_deactivate.push(rule_id);
                        }
                    }
                    if !gy_rules_to_deactivate.is_empty() || !restrict_to_deactivate.is_empty() {
                        if let Err(e) = self.data_plane.deactivate_flows_for_rules(
                            imsi,
                            &restrict_to_deactivate,
                            &gy_rules_to_deactivate,
                            RequestOriginType::Gy,
                        ) {
                            log::error!("Failed to deactivate final-unit flows for {imsi}: {e}");
                        }
                    }
                }
            }
        }
    }

    fn update_monitoring_credits_and_rules(
        &self,
        session_map: &mut SessionMap,
        response: &UpdateSessionResponse,
        subscribers_to_terminate: &mut HashSet<String>,
        session_update: &mut SessionUpdate,
        now: u64,
    ) {
        // revalidation is session wide: only one timer per IMSI
        let mut imsis_with_revalidation: HashSet<String> = HashSet::new();
        for monitor_resp in &response.usage_monitor_responses {
            let imsi = &monitor_resp.sid;
            if !monitor_resp.success {
                handle_command_level_result_code(
                    imsi,
                    monitor_resp.result_code,
                    subscribers_to_terminate,
                );
                continue;
            }
            let sessions = match session_map.get_mut(imsi) {
                Some(sessions) => sessions,
                None => {
                    log::error!("Could not find session for {imsi} during update");
                    continue;
                }
            };
            for session in sessions.iter_mut() {
                let session_id = session.session_id().to_string();
                let config = session.get_config().clone();
                let mut rules_to_activate = RulesToProcess::default();
                let mut rules_to_deactivate = RulesToProcess::default();
                {
                    let uc = session_uc(session_update, imsi, &session_id);
                    session.receive_monitor(monitor_resp, uc);
                    self.process_rules_to_remove(
                        imsi,
                        session,
                        &monitor_resp.rules_to_remove,
                        &mut rules_to_deactivate,
                        uc,
                    );
                    self.process_rules_to_install(
                        session,
                        imsi,
                        monitor_resp.static_rules_to_install.clone(),
                        monitor_resp.dynamic_rules_to_install.clone(),
                        &mut rules_to_activate,
                        &mut rules_to_deactivate,
                        uc,
                        now,
                    );
                }
                self.propagate_rule_updates_to_data_plane(
                    imsi,
                    &config,
                    &rules_to_activate,
                    &rules_to_deactivate,
                    false,
                );

                if self.terminate_on_wallet_exhaust() && self.is_wallet_exhausted(session) {
                    subscribers_to_terminate.insert(imsi.clone());
                }

                if revalidation_required(&monitor_resp.event_triggers)
                    && !imsis_with_revalidation.contains(imsi)
                {
                    imsis_with_revalidation.insert(imsi.clone());
                    let uc = session_uc(session_update, imsi, &session_id);
                    self.schedule_revalidation(
                        imsi,
                        session,
                        monitor_resp.revalidation_time,
                        uc,
                        now,
                    );
                }

                if config.lte_context().is_some() {
                    let uc = session_uc(session_update, imsi, &session_id);
                    let update = session.get_dedicated_bearer_updates(
                        &rules_to_activate,
                        &rules_to_deactivate,
                        uc,
                    );
                    self.propagate_bearer_updates_to_mme(update);
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Service actions
    // ------------------------------------------------------------------

    /// Apply the service actions produced while collecting updates
    pub fn execute_actions(
        &self,
        session_map: &mut SessionMap,
        actions: &[ServiceAction],
        session_update: &mut SessionUpdate,
    ) {
        for action in actions {
            match action.action_type {
                ServiceActionType::ActivateService => {
                    if let Err(e) = self.data_plane.activate_flows_for_rules(
                        &action.imsi,
                        &action.ip_addr,
                        action.ambr,
                        &action.rule_ids,
                        &action.rule_definitions,
                    ) {
                        log::error!("Could not activate rules for {}: {e}", action.imsi);
                    }
                }
                ServiceActionType::Redirect | ServiceActionType::RestrictAccess => {
                    let info = FinalActionInstallInfo {
                        imsi: action.imsi.clone(),
                        session_id: action.session_id.clone(),
                        action_type: action.action_type,
                        restrict_rule_ids: action.restrict_rule_ids.clone(),
                        redirect_server: action.redirect_server.clone(),
                    };
                    self.install_final_unit_action_flows(session_map, info, session_update);
                }
                ServiceActionType::TerminateService => {
                    let terminated = self.find_and_terminate_session(
                        session_map,
                        &action.imsi,
                        &action.session_id,
                        session_update,
                    );
                    if !terminated {
                        log::error!(
                            "Cannot act on TERMINATE action since session {} does not exist",
                            action.session_id
                        );
                    }
                }
                ServiceActionType::ContinueService => {}
            }
        }
    }

    /// Synthetic dynamic rule steering traffic to the redirect server
    fn create_redirect_rule(info: &FinalActionInstallInfo) -> PolicyRule {
        let mut rule = PolicyRule::new("redirect", REDIRECT_FLOW_PRIORITY);
        let server = info.redirect_server.clone().unwrap_or_default();
        rule.redirect = Some(RedirectInformation {
            enabled: true,
            address_type: server.address_type,
            server_address: server.server_address,
        });
        rule
    }

    fn install_final_unit_action_flows(
        &self,
        session_map: &mut SessionMap,
        info: FinalActionInstallInfo,
        session_update: &mut SessionUpdate,
    ) {
        log::debug!(
            "Fetching subscriber IP address from the directory for {}",
            info.session_id
        );
        let ip = match self.directory.get_subscriber_ip(&info.imsi) {
            Ok(ip) => ip,
            Err(e) => {
                log::error!(
                    "Could not fetch IP info for {}, failing final-action install: {e}",
                    info.session_id
                );
                return;
            }
        };
        let sessions = match session_map.get_mut(&info.imsi) {
            Some(sessions) => sessions,
            None => {
                log::debug!("Session for {} not found", info.imsi);
                return;
            }
        };
        for session in sessions.iter_mut() {
            if session.session_id() != info.session_id {
                continue;
            }
            let lifetime = RuleLifetime::unbounded();
            match info.action_type {
                ServiceActionType::Redirect => {
                    let rule = Self::create_redirect_rule(&info);
                    if session.is_gy_dynamic_rule_installed(&rule.id) {
                        continue;
                    }
                    log::debug!("Installing redirect flow in the data plane for {}", info.session_id);
                    if let Err(e) = self.data_plane.add_final_action_flow(
                        &info.imsi,
                        &ip,
                        &[],
                        std::slice::from_ref(&rule),
                    ) {
                        log::error!("Failed to install redirect flow for {}: {e}", info.imsi);
                        continue;
                    }
                    let uc = session_uc(session_update, &info.imsi, &info.session_id);
                    session.insert_gy_dynamic_rule(rule, lifetime, uc);
                }
                ServiceActionType::RestrictAccess => {
                    log::debug!(
                        "Installing restricted flows in the data plane for {}",
                        info.session_id
                    );
                    if let Err(e) = self.data_plane.add_final_action_flow(
                        &info.imsi,
                        &ip,
                        &info.restrict_rule_ids,
                        &[],
                    ) {
                        log::error!("Failed to install restrict flows for {}: {e}", info.imsi);
                        continue;
                    }
                    let uc = session_uc(session_update, &info.imsi, &info.session_id);
                    for rule_id in &info.restrict_rule_ids {
                        session.activate_restrict_rule(rule_id, lifetime, uc);
                    }
                }
                _ => {}
            }
        }
    }

    // ------------------------------------------------------------------
    // Session creation
    // ------------------------------------------------------------------

    /// Create a session from a create-session response: install grants
    /// and monitors, then the rules the response carries, and push the
    /// initial flows to the data plane.
    pub fn init_session_credit(
        &self,
        imsi: &str,
        session_id: &str,
        cfg: &SessionConfig,
        response: &CreateSessionResponse,
        now: u64,
    ) -> bool {
        let mut session = SessionState::new(
            imsi,
            session_id,
            cfg.clone(),
            Arc::clone(&self.rule_store),
            now,
        );
        let mut charging_credits_received: HashSet<u32> = HashSet::new();
        for credit in &response.credits {
            let mut uc = default_update_criteria();
            if session.receive_charging_credit(credit, now, &mut uc) {
                charging_credits_received.insert(credit.charging_key);
            }
        }
        // command-level monitor errors are handled by the session proxy
        // for the init exchange
        for monitor in &response.usage_monitors {
            let mut uc = default_update_criteria();
            session.receive_monitor(monitor, &mut uc);
        }

        let rule_update_success = self.handle_session_init_rule_updates(
            imsi,
            &mut session,
            response,
            &charging_credits_received,
            now,
        );

        self.update_ipfix_flow(imsi, cfg, now);

        if session.is_wlan_session() && self.terminate_on_wallet_exhaust() {
            self.handle_session_init_subscriber_quota_state(imsi, &mut session);
        }

        if revalidation_required(&response.event_triggers) {
            let mut uc = default_update_criteria();
            self.schedule_revalidation(imsi, &mut session, response.revalidation_time, &mut uc, now);
        }

        log::debug!("Creating session {session_id} for {imsi}");
        self.session_store.create_session(imsi, session);
        rule_update_success
    }

    fn handle_session_init_rule_updates(
        &self,
        imsi: &str,
        session: &mut SessionState,
        response: &CreateSessionResponse,
        charging_credits_received: &HashSet<u32>,
        now: u64,
    ) -> bool {
        let mut static_installs = response.static_rules.clone();
        let mut dynamic_installs = response.dynamic_rules.clone();
        self.filter_rule_installs(
            &mut static_installs,
            &mut dynamic_installs,
            charging_credits_received,
        );

        let mut rules_to_activate = RulesToProcess::default();
        let mut rules_to_deactivate = RulesToProcess::default();
        let mut uc = default_update_criteria();
        self.process_rules_to_install(
            session,
            imsi,
            static_installs,
            dynamic_installs,
            &mut rules_to_activate,
            &mut rules_to_deactivate,
            &mut uc,
            now,
        );

        let config = session.get_config().clone();
        // the activate call goes out even with no rules: the data plane
        // installs a drop-all rule when given an empty set
        let (activate_ok, _) = self.propagate_rule_updates_to_data_plane(
            imsi,
            &config,
            &rules_to_activate,
            &rules_to_deactivate,
            true,
        );

        if config.lte_context().is_some() {
            let update =
                session.get_dedicated_bearer_updates(&rules_to_activate, &rules_to_deactivate, &mut uc);
            self.propagate_bearer_updates_to_mme(update);
        }
        activate_ok
    }

    /// Rules charged against a key that received no credit are neither
    /// installed nor scheduled. Monitored-only rules need no quota.
    fn filter_rule_installs(
        &self,
        static_installs: &mut Vec<StaticRuleInstall>,
        dynamic_installs: &mut Vec<DynamicRuleInstall>,
        successful_credits: &HashSet<u32>,
    ) {
        static_installs.retain(|install| match self.rule_store.get_rule(&install.rule_id) {
            Some(rule) => should_activate(&rule, successful_credits),
            None => {
                log::error!(
                    "Not activating rule {} because it could not be found",
                    install.rule_id
                );
                false
            }
        });
        dynamic_installs.retain(|install| should_activate(&install.policy_rule, successful_credits));
    }

    // ------------------------------------------------------------------
    // Termination
    // ------------------------------------------------------------------

    /// Externally triggered teardown of the sessions on one APN. The
    /// access side initiated it, so the access network is not notified.
    pub fn terminate_session(
        &self,
        session_map: &mut SessionMap,
        imsi: &str,
        apn: &str,
        session_update: &mut SessionUpdate,
        now: u64,
    ) -> Result<(), SessionError> {
        let sessions = session_map.get_mut(imsi).ok_or_else(|| {
            log::error!("Could not find session for {imsi} during termination");
            SessionError::SessionNotFound {
                imsi: imsi.to_string(),
            }
        })?;
        for session in sessions.iter_mut() {
            if session.get_config().common_context.apn != apn {
                continue;
            }
            let session_id = session.session_id().to_string();
            log::info!("Starting externally triggered termination for {session_id}");
            let uc = session_uc(session_update, imsi, &session_id);
            self.start_session_termination(imsi, session, false, uc, now);
        }
        Ok(())
    }

    fn find_and_terminate_session(
        &self,
        session_map: &mut SessionMap,
        imsi: &str,
        session_id: &str,
        session_update: &mut SessionUpdate,
    ) -> bool {
        let now = epoch_now();
        let sessions = match session_map.get_mut(imsi) {
            Some(sessions) => sessions,
            None => return false,
        };
        for session in sessions.iter_mut() {
            if session.session_id() == session_id {
                let uc = session_uc(session_update, imsi, session_id);
                self.start_session_termination(imsi, session, true, uc, now);
                return true;
            }
        }
        false
    }

    /// Begin teardown: journal the end time, pull every rule out of the
    /// data plane, notify the access network if asked, and arm the
    /// forced-termination timer.
    pub fn start_session_termination(
        &self,
        imsi: &str,
        session: &mut SessionState,
        notify_access: bool,
        uc: &mut SessionStateUpdateCriteria,
        now: u64,
    ) {
        let session_id = session.session_id().to_string();
        // a session that already has an end time stamped is draining
        let already_terminating = session.is_terminating()
            || (session.get_state() == SessionFsmState::TerminationScheduled
                && session.get_pdp_end_time() != 0);
        if already_terminating {
            log::info!("Session {session_id} is already terminating, ignoring termination request");
            return;
        }
        log::info!("Initiating session termination for {session_id}");
        session.set_pdp_end_time(now);
        uc.updated_pdp_end_time = now;

        self.remove_all_rules_for_termination(imsi, session, uc);
        session.mark_as_awaiting_termination(uc);

        let config = session.get_config().clone();
        if notify_access {
            self.notify_termination_to_access_service(imsi, &session_id, &config);
        }
        if let Some(wlan) = config.wlan_context() {
            log::debug!("Deleting UE MAC flow for subscriber {imsi}");
            if let Err(e) = self.data_plane.delete_ue_mac_flow(imsi, &wlan.mac_addr) {
                log::error!("Failed to delete UE MAC flow for {imsi}: {e}");
            }
        }
        if self.terminate_on_wallet_exhaust() {
            self.handle_subscriber_quota_state_change(
                imsi,
                session,
                SubscriberQuotaState::Terminate,
                uc,
            );
        }
        // Termination completes when the usage report no longer carries
        // the session; the timer forces it if that never happens.
        self.timers.schedule_in(
            SessionTimerId::ForceTermination,
            Duration::from_millis(self.config.session_force_termination_timeout_ms),
            TimerContext::for_session(imsi, &session_id),
        );
    }

    fn remove_all_rules_for_termination(
        &self,
        imsi: &str,
        session: &mut SessionState,
        uc: &mut SessionStateUpdateCriteria,
    ) {
        let info = session.get_session_info();
        let mut rules = RulesToProcess {
            static_rules: info.static_rules,
            dynamic_rules: info.dynamic_rules,
        };
        for rule_id in &rules.static_rules {
            uc.static_rules_to_uninstall.insert(rule_id.clone());
            session.deactivate_static_rule(rule_id, &mut default_update_criteria());
        }
        let dynamic_ids: Vec<String> = rules.dynamic_rules.iter().map(|r| r.id.clone()).collect();
        for rule_id in &dynamic_ids {
            uc.dynamic_rules_to_uninstall.insert(rule_id.clone());
            session.remove_dynamic_rule(rule_id, &mut default_update_criteria());
        }
        rules.static_rules.sort();
        if let Err(e) = self.data_plane.deactivate_flows_for_rules(
            imsi,
            &rules.static_rules,
            &rules.dynamic_rules,
            RequestOriginType::Gx,
        ) {
            log::error!("Failed to deactivate flows for {imsi} during termination: {e}");
        }
    }

    /// LTE tears down the PDN session through the SPGW; WLAN asks the
    /// AAA service to end the RADIUS session.
    fn notify_termination_to_access_service(
        &self,
        imsi: &str,
        session_id: &str,
        config: &SessionConfig,
    ) {
        match &config.rat_specific_context {
            RatSpecificContext::Wlan(wlan) => {
                log::debug!(
                    "Asking AAA service to terminate session with radius id {}, imsi {imsi}",
                    wlan.radius_session_id
                );
                if let Err(e) = self.aaa.terminate_session(&wlan.radius_session_id, imsi) {
                    log::error!("Failed to notify AAA of termination for {imsi}: {e}");
                }
            }
            RatSpecificContext::Lte(lte) => {
                if let Err(e) = self.spgw.delete_default_bearer(
                    imsi,
                    &config.common_context.ue_ipv4,
                    lte.bearer_id,
                ) {
                    log::error!("Failed to delete default bearer for {session_id}: {e}");
                }
            }
        }
    }

    /// Finish teardown for one session and drop it from the store copy.
    /// Does nothing if the session is gone or a new one replaced it.
    pub fn complete_termination(
        &self,
        session_map: &mut SessionMap,
        imsi: &str,
        session_id: &str,
        session_update: &mut SessionUpdate,
    ) {
        let sessions = match session_map.get_mut(imsi) {
            Some(sessions) => sessions,
            None => {
                log::debug!(
                    "Could not find session for {imsi} and session id {session_id}, \
                     skipping termination"
                );
                return;
            }
        };
        let mut terminated = false;
        for session in sessions.iter_mut() {
            if session.session_id() != session_id {
                continue;
            }
            let uc = session_uc(session_update, imsi, session_id);
            if session.complete_termination(self.reporter.as_ref(), uc) {
                uc.is_session_ended = true;
                terminated = true;
                log::debug!("Successfully terminated session {session_id} for {imsi}");
            }
            break;
        }
        if terminated {
            sessions.retain(|session| session.session_id() != session_id);
            if sessions.is_empty() {
                session_map.remove(imsi);
                log::debug!("All sessions terminated for {imsi}");
            }
        }
    }

    fn handle_force_termination_timeout(&self, imsi: &str, session_id: &str) {
        log::debug!("Checking if termination has to be forced for {session_id}");
        let read = SessionRead::from([imsi.to_string()]);
        let mut session_map = self.session_store.read_sessions_for_deletion(&read);
        let exists = session_map
            .get(imsi)
            .map(|sessions| sessions.iter().any(|s| s.session_id() == session_id))
            .unwrap_or(false);
        if !exists {
            log::debug!(
                "Not forcing termination for session {imsi}/{session_id}, \
                 it has already terminated"
            );
            return;
        }
        let mut session_update = default_session_update(&session_map);
        self.complete_termination(&mut session_map, imsi, session_id, &mut session_update);
        if self.session_store.update_sessions(session_update) {
            log::debug!("Ended session {imsi} with session id {session_id}");
        } else {
            log::error!(
                "Failed to update the session store with ended session {imsi}/{session_id}"
            );
        }
    }

    /// Tear down every session of the given subscribers
    pub fn terminate_multiple_services(
        &self,
        session_map: &mut SessionMap,
        imsis: &HashSet<String>,
        session_update: &mut SessionUpdate,
    ) {
        let now = epoch_now();
        for imsi in imsis {
            let sessions = match session_map.get_mut(imsi) {
                Some(sessions) => sessions,
                None => continue,
            };
            for session in sessions.iter_mut() {
                let session_id = session.session_id().to_string();
                let uc = session_uc(session_update, imsi, &session_id);
                self.start_session_termination(imsi, session, true, uc, now);
            }
        }
    }

    // ------------------------------------------------------------------
    // Wallet state (WLAN)
    // ------------------------------------------------------------------

    fn terminate_on_wallet_exhaust(&self) -> bool {
        self.config.terminate_on_wallet_exhaust
    }

    /// The wallet is exhausted once no monitored rules remain installed
    fn is_wallet_exhausted(&self, session: &SessionState) -> bool {
        !session.active_monitored_rules_exist()
    }

    fn handle_subscriber_quota_state_change(
        &self,
        imsi: &str,
        session: &mut SessionState,
        new_state: SubscriberQuotaState,
        uc: &mut SessionStateUpdateCriteria,
    ) {
        log::info!(
            "{} now has subscriber wallet status {new_state:?}",
            session.session_id()
        );
        session.set_subscriber_quota_state(new_state, uc);
        let ue_mac_addr = session
            .get_config()
            .wlan_context()
            .map(|wlan| wlan.mac_addr.clone())
            .unwrap_or_default();
        self.report_subscriber_state_to_data_plane(imsi, &ue_mac_addr, new_state);
    }

    fn handle_session_init_subscriber_quota_state(&self, imsi: &str, session: &mut SessionState) {
        let mut scratch = default_update_criteria();
        if self.is_wallet_exhausted(session) {
            self.handle_subscriber_quota_state_change(
                imsi,
                session,
                SubscriberQuotaState::NoQuota,
                &mut scratch,
            );
            session.mark_as_awaiting_termination(&mut scratch);
            log::info!(
                "{imsi} scheduling session to be terminated in {} ms",
                self.config.quota_exhaustion_termination_on_init_ms
            );
            self.schedule_termination(HashSet::from([imsi.to_string()]));
            return;
        }
        self.handle_subscriber_quota_state_change(
            imsi,
            session,
            SubscriberQuotaState::ValidQuota,
            &mut scratch,
        );
    }

    fn schedule_termination(&self, imsis: HashSet<String>) {
        for imsi in imsis {
            self.timers.schedule_in(
                SessionTimerId::QuotaExhaustionInit,
                Duration::from_millis(self.config.quota_exhaustion_termination_on_init_ms),
                TimerContext {
                    imsi,
                    ..Default::default()
                },
            );
        }
    }

    fn report_subscriber_state_to_data_plane(
        &self,
        imsi: &str,
        ue_mac_addr: &str,
        state: SubscriberQuotaState,
    ) {
        let update = SubscriberQuotaUpdate {
            sid: imsi.to_string(),
            mac_addr: ue_mac_addr.to_string(),
            update_type: state,
        };
        if let Err(e) = self.data_plane.update_subscriber_quota_state(&[update]) {
            log::error!("Failed to update subscriber quota state to {state:?} for {imsi}: {e}");
        }
    }

    // ------------------------------------------------------------------
    // Read-only credit queries
    // ------------------------------------------------------------------

    pub fn get_charging_credit(
        &self,
        session_map: &SessionMap,
        imsi: &str,
        key: &CreditKey,
        bucket: Bucket,
    ) -> u64 {
        session_map
            .get(imsi)
            .into_iter()
            .flatten()
            .map(|session| session.get_charging_credit(key, bucket))
            .find(|credit| *credit > 0)
            .unwrap_or(0)
    }

    pub fn get_monitor_credit(
        &self,
        session_map: &SessionMap,
        imsi: &str,
        mkey: &str,
        bucket: Bucket,
    ) -> u64 {
        session_map
            .get(imsi)
            .into_iter()
            .flatten()
            .map(|session| session.get_monitor(mkey, bucket))
            .find(|credit| *credit > 0)
            .unwrap_or(0)
    }

    // ------------------------------------------------------------------
    // Reauth
    // ------------------------------------------------------------------

    /// Cloud-initiated charging reauth for one key or the whole session
    pub fn init_charging_reauth(
        &self,
        session_map: &mut SessionMap,
        request: &ChargingReAuthRequest,
        session_update: &mut SessionUpdate,
    ) -> ReAuthResult {
        let sessions = match session_map.get_mut(&request.sid) {
            Some(sessions) => sessions,
            None => {
                log::error!("Could not find session for {} during reauth", request.sid);
                return ReAuthResult::SessionNotFound;
            }
        };
        for session in sessions.iter_mut() {
            if session.session_id() != request.session_id {
                continue;
            }
            let uc = session_uc(session_update, &request.sid, &request.session_id);
            return match request.reauth_type {
                ChargingReAuthType::SingleService => {
                    log::debug!(
                        "Initiating reauth of key {} for {}",
                        request.charging_key,
                        request.sid
                    );
                    session.reauth_key(
                        CreditKey {
                            rating_group: request.charging_key,
                            service_identifier: request.service_identifier,
                        },
                        uc,
                    )
                }
                ChargingReAuthType::EntireSession => {
                    log::debug!("Initiating reauth of all keys for {}", request.sid);
                    session.reauth_all(uc)
                }
            };
        }
        log::error!("Could not find session for {} during reauth", request.sid);
        ReAuthResult::SessionNotFound
    }

    /// Policy reauth (RAR): rule installs/removals and bearer changes
    /// for one session, or all sessions of the IMSI when the session id
    /// is empty.
    pub fn init_policy_reauth(
        &self,
        session_map: &mut SessionMap,
        request: &PolicyReAuthRequest,
        answer_out: &mut PolicyReAuthAnswer,
        session_update: &mut SessionUpdate,
        now: u64,
    ) {
        let sessions = match session_map.get_mut(&request.imsi) {
            Some(sessions) => sessions,
            None => {
                log::error!(
                    "Could not find session for {} during policy reauth",
                    request.imsi
                );
                answer_out.result = Some(ReAuthResult::SessionNotFound);
                return;
            }
        };
        if request.session_id.is_empty() {
            // changes apply best-effort to every session of the IMSI
            let mut all_activated = true;
            let mut all_deactivated = true;
            for session in sessions.iter_mut() {
                let (activated, deactivated) =
                    self.init_policy_reauth_for_session(request, session, session_update, now);
                all_activated &= activated;
                all_deactivated &= deactivated;
            }
            mark_rule_failures(all_activated, all_deactivated, request, answer_out);
        } else {
            let mut session_id_valid = false;
            let mut activated = true;
            let mut deactivated = true;
            for session in sessions.iter_mut() {
                if session.session_id() == request.session_id {
                    session_id_valid = true;
                    let (a, d) =
                        self.init_policy_reauth_for_session(request, session, session_update, now);
                    activated = a;
                    deactivated = d;
                }
            }
            if !session_id_valid {
                log::error!(
                    "Found a matching IMSI {} but no matching session id {} during policy reauth",
                    request.imsi,
                    request.session_id
                );
                answer_out.result = Some(ReAuthResult::SessionNotFound);
                return;
            }
            mark_rule_failures(activated, deactivated, request, answer_out);
        }
        answer_out.result = Some(ReAuthResult::UpdateInitiated);
    }

    fn init_policy_reauth_for_session(
        &self,
        request: &PolicyReAuthRequest,
        session: &mut SessionState,
        session_update: &mut SessionUpdate,
        now: u64,
    ) -> (bool, bool) {
        let imsi = &request.imsi;
        let session_id = session.session_id().to_string();
        log::debug!("Processing policy reauth for subscriber {imsi}");

        let mut rules_to_activate = RulesToProcess::default();
        let mut rules_to_deactivate = RulesToProcess::default();
        {
            let uc = session_uc(session_update, imsi, &session_id);
            self.receive_monitoring_credit_from_rar(request, session, uc);

            if revalidation_required(&request.event_triggers) {
                self.schedule_revalidation(imsi, session, request.revalidation_time, uc, now);
            }

            self.process_rules_to_remove(
                imsi,
                session,
                &request.rules_to_remove,
                &mut rules_to_deactivate,
                uc,
            );
            self.process_rules_to_install(
                session,
                imsi,
                request.rules_to_install.clone(),
                request.dynamic_rules_to_install.clone(),
                &mut rules_to_activate,
                &mut rules_to_deactivate,
                uc,
                now,
            );
        }

        let config = session.get_config().clone();
        let (activate_success, deactivate_success) = self.propagate_rule_updates_to_data_plane(
            imsi,
            &config,
            &rules_to_activate,
            &rules_to_deactivate,
            false,
        );

        if self.terminate_on_wallet_exhaust() && self.is_wallet_exhausted(session) {
            let uc = session_uc(session_update, imsi, &session_id);
            self.start_session_termination(imsi, session, true, uc, now);
            return (activate_success, deactivate_success);
        }
        if config.lte_context().is_some() {
            self.create_bearer(activate_success, session, request, &rules_to_activate.dynamic_rules);
        }
        (activate_success, deactivate_success)
    }

    /// Monitoring credits carried in a RAR are applied as if the cloud
    /// had answered a monitoring update
    fn receive_monitoring_credit_from_rar(
        &self,
        request: &PolicyReAuthRequest,
        session: &mut SessionState,
        uc: &mut SessionStateUpdateCriteria,
    ) {
        for credit in &request.usage_monitoring_credits {
            let response = UsageMonitoringUpdateResponse {
                success: true,
                sid: request.imsi.clone(),
                session_id: request.session_id.clone(),
                credit: Some(credit.clone()),
                ..Default::default()
            };
            session.receive_monitor(&response, uc);
        }
    }

    /// Queue a dedicated-bearer creation when the RAR carries a QCI
    /// differing from the default bearer's
    fn create_bearer(
        &self,
        activate_success: bool,
        session: &SessionState,
        request: &PolicyReAuthRequest,
        dynamic_rules: &[PolicyRule],
    ) {
        let config = session.get_config();
        let lte = match config.lte_context() {
            Some(lte) => lte,
            None => {
                log::warn!("No LTE session context is specified for session");
                return;
            }
        };
        let (default_qci, qos_info) = match (lte.qos, request.qos_info) {
            (Some(qos), Some(info)) => (qos.qos_class_id, info),
            _ => {
                log::debug!("Not creating bearer");
                return;
            }
        };
        if !activate_success {
            log::debug!("Not creating bearer");
            return;
        }
        if qos_info.qci != default_qci {
            log::debug!("QCI sent in RAR is different from the default QCI");
            let req = cg_proto::CreateBearerRequest {
                sid: session.imsi().to_string(),
                ip_addr: config.common_context.ue_ipv4.clone(),
                link_bearer_id: lte.bearer_id,
                policy_rules: dynamic_rules.to_vec(),
            };
            if let Err(e) = self.spgw.create_dedicated_bearer(&req) {
                log::error!("Failed to request dedicated bearer for {}: {e}", session.imsi());
            }
        }
    }

    // ------------------------------------------------------------------
    // Rule processing
    // ------------------------------------------------------------------

    fn process_rules_to_remove(
        &self,
        imsi: &str,
        session: &mut SessionState,
        rules_to_remove: &[String],
        rules_to_deactivate: &mut RulesToProcess,
        uc: &mut SessionStateUpdateCriteria,
    ) {
        for rule_id in rules_to_remove {
            // dynamic first, static otherwise
            if let Some(rule) = session.remove_dynamic_rule(rule_id, uc) {
                rules_to_deactivate.dynamic_rules.push(rule);
            } else {
                if !session.deactivate_static_rule(rule_id, uc) {
                    log::warn!("Could not find rule {rule_id} for {imsi} during static rule removal");
                }
                rules_to_deactivate.static_rules.push(rule_id.clone());
            }
        }
    }

    /// Install (or schedule) the given rules on the session, honouring
    /// their activation and deactivation windows
    #[allow(clippy::too_many_arguments)]
    fn process_rules_to_install(
        &self,
        session: &mut SessionState,
        imsi: &str,
        static_installs: Vec<StaticRuleInstall>,
        dynamic_installs: Vec<DynamicRuleInstall>,
        rules_to_activate: &mut RulesToProcess,
        rules_to_deactivate: &mut RulesToProcess,
        uc: &mut SessionStateUpdateCriteria,
        now: u64,
    ) {
        for install in static_installs {
            let rule_id = install.rule_id.clone();
            if session.is_static_rule_installed(&rule_id) {
                // duplicate installs may arrive; ignore them
                continue;
            }
            let lifetime = RuleLifetime {
                activation_time: install.activation_time,
                deactivation_time: install.deactivation_time,
            };
            if lifetime.activation_time > now {
                session.schedule_static_rule(&rule_id, lifetime, uc);
                self.schedule_static_rule_activation(imsi, &rule_id, lifetime, now);
            } else {
                session.activate_static_rule(&rule_id, lifetime, uc);
                rules_to_activate.static_rules.push(rule_id.clone());
            }
            if lifetime.deactivation_time > now {
                self.schedule_static_rule_deactivation(imsi, &rule_id, lifetime, now);
            } else if lifetime.deactivation_time > 0 {
                if !session.deactivate_static_rule(&rule_id, uc) {
                    log::warn!("Could not find rule {rule_id} for {imsi} during static rule removal");
                }
                rules_to_deactivate.static_rules.push(rule_id);
            }
        }

        for install in dynamic_installs {
            let rule = install.policy_rule.clone();
            let rule_id = rule.id.clone();
            let lifetime = RuleLifetime {
                activation_time: install.activation_time,
                deactivation_time: install.deactivation_time,
            };
            if lifetime.activation_time > now {
                session.schedule_dynamic_rule(rule, lifetime, uc);
                self.schedule_dynamic_rule_activation(imsi, &rule_id, lifetime, now);
            } else {
                session.insert_dynamic_rule(rule.clone(), lifetime, uc);
                rules_to_activate.dynamic_rules.push(rule.clone());
            }
            if lifetime.deactivation_time > now {
                self.schedule_dynamic_rule_deactivation(imsi, &rule_id, lifetime, now);
            } else if lifetime.deactivation_time > 0 {
                if let Some(removed) = session.remove_dynamic_rule(&rule_id, uc) {
                    rules_to_deactivate.dynamic_rules.push(removed);
                }
            }
        }
    }

    fn propagate_rule_updates_to_data_plane(
        &self,
        imsi: &str,
        config: &SessionConfig,
        rules_to_activate: &RulesToProcess,
        rules_to_deactivate: &RulesToProcess,
        always_send_activate: bool,
    ) -> (bool, bool) {
        let mut activate_ok = true;
        let mut deactivate_ok = true;
        if always_send_activate || !rules_to_activate.is_empty() {
            let ip_addr = &config.common_context.ue_ipv4;
            if let Err(e) = self.data_plane.activate_flows_for_rules(
                imsi,
                ip_addr,
                config.apn_ambr(),
                &rules_to_activate.static_rules,
                &rules_to_activate.dynamic_rules,
            ) {
                log::error!("Could not activate rules for {imsi}: {e}");
                activate_ok = false;
            }
        }
        // never send an empty deactivate: the data plane treats an empty
        // rule set as "deactivate everything"
        if !rules_to_deactivate.is_empty() {
            if let Err(e) = self.data_plane.deactivate_flows_for_rules(
                imsi,
                &rules_to_deactivate.static_rules,
                &rules_to_deactivate.dynamic_rules,
                RequestOriginType::Gx,
            ) {
                log::error!("Could not deactivate rules for {imsi}: {e}");
                deactivate_ok = false;
            }
        }
        (activate_ok, deactivate_ok)
    }

    fn propagate_bearer_updates_to_mme(&self, updates: crate::session::BearerUpdate) {
        // deletions go first so the final state is the desired one
        if let Some(delete_req) = updates.delete_req {
            if let Err(e) = self.spgw.delete_dedicated_bearer(&delete_req) {
                log::error!("Failed to delete dedicated bearer for {}: {e}", delete_req.sid);
            }
        }
        if let Some(create_req) = updates.create_req {
            if let Err(e) = self.spgw.create_dedicated_bearer(&create_req) {
                log::error!("Failed to create dedicated bearer for {}: {e}", create_req.sid);
            }
        }
    }

    // ------------------------------------------------------------------
    // Desired-state rule sets
    // ------------------------------------------------------------------

    /// Apply a declarative rule-state message across subscribers and
    /// propagate the deltas to the data plane and the MME
    pub fn handle_set_session_rules(
        &self,
        session_map: &mut SessionMap,
        rules: &SessionRules,
        session_update: &mut SessionUpdate,
    ) {
        for rules_per_sub in &rules.rules_per_subscriber {
            let imsi = &rules_per_sub.imsi;
            let sessions = match session_map.get_mut(imsi) {
                Some(sessions) => sessions,
                None => {
                    log::error!(
                        "Could not find session for subscriber {imsi} during set session rules"
                    );
                    continue;
                }
            };
            let rule_set_by_sub = RuleSetBySubscriber::from_rules_per_subscriber(rules_per_sub);
            for session in sessions.iter_mut() {
                let config = session.get_config().clone();
                let apn = &config.common_context.apn;
                let rule_set = match rule_set_by_sub.combined_rule_set_for_apn(apn) {
                    Some(rule_set) => rule_set,
                    None => continue,
                };
                let session_id = session.session_id().to_string();
                let mut rules_to_activate = RulesToProcess::default();
                let mut rules_to_deactivate = RulesToProcess::default();
                {
                    let uc = session_uc(session_update, imsi, &session_id);
                    session.apply_session_rule_set(
                        &rule_set,
                        &mut rules_to_activate,
                        &mut rules_to_deactivate,
                        uc,
                    );
                }
                self.propagate_rule_updates_to_data_plane(
                    imsi,
                    &config,
                    &rules_to_activate,
                    &rules_to_deactivate,
                    false,
                );
                if config.lte_context().is_some() {
                    let uc = session_uc(session_update, imsi, &session_id);
                    let update = session.get_dedicated_bearer_updates(
                        &rules_to_activate,
                        &rules_to_deactivate,
                        uc,
                    );
                    self.propagate_bearer_updates_to_mme(update);
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // WLAN roaming
    // ------------------------------------------------------------------

    /// Replace the session config of every session under the IMSI
    /// (WLAN roaming between APs)
    pub fn handle_cwf_roaming(
        &self,
        session_map: &mut SessionMap,
        imsi: &str,
        config: &SessionConfig,
        session_update: &mut SessionUpdate,
    ) {
        let sessions = match session_map.get_mut(imsi) {
            Some(sessions) => sessions,
            None => return,
        };
        for session in sessions.iter_mut() {
            let session_id = session.session_id().to_string();
            session.set_config(config.clone());
            let uc = session_uc(session_update, imsi, &session_id);
            uc.is_config_updated = true;
            uc.updated_config = config.clone();
            self.update_ipfix_flow(imsi, config, session.get_pdp_start_time());
        }
    }

    fn update_ipfix_flow(&self, imsi: &str, config: &SessionConfig, pdp_start_time: u64) {
        log::debug!("Updating IPFIX flow for subscriber {imsi}");
        let apn = &config.common_context.apn;
        let (apn_mac_addr, apn_name) = match parse_apn(apn) {
            Some(parsed) => parsed,
            None => {
                log::warn!("Failed mac/name parsing for apn {apn}");
                (String::new(), apn.clone())
            }
        };
        // MAC is only meaningful for WLAN
        let ue_mac_addr = config
            .wlan_context()
            .map(|wlan| wlan.mac_addr.clone())
            .unwrap_or_else(|| "11:11:11:11:11:11".to_string());
        if let Err(e) = self.data_plane.update_ipfix_flow(
            imsi,
            &ue_mac_addr,
            &config.common_context.msisdn,
            &apn_mac_addr,
            &apn_name,
            pdp_start_time,
        ) {
            log::error!("Failed to update IPFIX flow for subscriber {imsi}: {e}");
        }
    }

    // ------------------------------------------------------------------
    // Bearer binding
    // ------------------------------------------------------------------

    /// Record a policy-to-bearer binding acknowledged by the SGW, or
    /// remove the rule when the bearer could not be created.
    pub fn bind_policy_to_bearer(
        &self,
        session_map: &mut SessionMap,
        request: &PolicyBearerBindingRequest,
        session_update: &mut SessionUpdate,
    ) -> bool {
        let imsi = &request.sid;
        let sessions = match session_map.get_mut(imsi) {
            Some(sessions) => sessions,
            None => {
                log::error!("Could not bind policy to bearer: session for {imsi} is not found");
                return false;
            }
        };
        for session in sessions.iter_mut() {
            let lte_bearer = match session.get_config().lte_context() {
                Some(lte) => lte.bearer_id,
                None => continue,
            };
            if lte_bearer != request.linked_bearer_id {
                continue;
            }
            let session_id = session.session_id().to_string();
            let uc = session_uc(session_update, imsi, &session_id);
            if request.bearer_id != 0 {
                session.bind_policy_to_bearer(&request.policy_rule_id, request.bearer_id, uc);
                return true;
            }
            // bearer id 0: the QoS request cannot be honoured, drop the rule
            self.remove_rule_due_to_bearer_creation_failure(
                imsi,
                session,
                &request.policy_rule_id,
                uc,
            );
        }
        false
    }

    fn remove_rule_due_to_bearer_creation_failure(
        &self,
        imsi: &str,
        session: &mut SessionState,
        rule_id: &str,
        uc: &mut SessionStateUpdateCriteria,
    ) {
        log::info!("Removing {rule_id} since we failed to create a dedicated bearer for it");
        let policy_type = match session.get_policy_type(rule_id) {
            Some(policy_type) => policy_type,
            None => {
                log::error!("Unable to remove rule {rule_id} since it is not found");
                return;
            }
        };
        let mut static_to_remove = Vec::new();
        let mut dynamic_to_remove = Vec::new();
        match policy_type {
            PolicyType::Static => {
                session.deactivate_static_rule(rule_id, uc);
                static_to_remove.push(rule_id.to_string());
            }
            PolicyType::Dynamic => {
                if let Some(rule) = session.remove_dynamic_rule(rule_id, uc) {
                    dynamic_to_remove.push(rule);
                }
            }
        }
        if let Err(e) = self.data_plane.deactivate_flows_for_rules(
            imsi,
            &static_to_remove,
            &dynamic_to_remove,
            RequestOriginType::Gx,
        ) {
            log::error!("Failed to deactivate flows for {imsi}: {e}");
        }
    }

    // ------------------------------------------------------------------
    // Scheduling
    // ------------------------------------------------------------------

    fn schedule_static_rule_activation(
        &self,
        imsi: &str,
        rule_id: &str,
        lifetime: RuleLifetime,
        now: u64,
    ) {
        let delay = duration_until(lifetime.activation_time, now);
        log::debug!(
            "Scheduling subscriber {imsi} static rule {rule_id} activation in {}s",
            delay.as_secs()
        );
        self.timers.schedule_in(
            SessionTimerId::RuleActivation,
            delay,
            TimerContext::for_rule(imsi, rule_id, PolicyType::Static),
        );
    }

    fn schedule_static_rule_deactivation(
        &self,
        imsi: &str,
        rule_id: &str,
        lifetime: RuleLifetime,
        now: u64,
    ) {
        let delay = duration_until(lifetime.deactivation_time, now);
        log::debug!(
            "Scheduling subscriber {imsi} static rule {rule_id} deactivation in {}s",
            delay.as_secs()
        );
        self.timers.schedule_in(
            SessionTimerId::RuleDeactivation,
            delay,
            TimerContext::for_rule(imsi, rule_id, PolicyType::Static),
        );
    }

    fn schedule_dynamic_rule_activation(
        &self,
        imsi: &str,
        rule_id: &str,
        lifetime: RuleLifetime,
        now: u64,
    ) {
        let delay = duration_until(lifetime.activation_time, now);
        log::debug!(
            "Scheduling subscriber {imsi} dynamic rule {rule_id} activation in {}s",
            delay.as_secs()
        );
        self.timers.schedule_in(
            SessionTimerId::RuleActivation,
            delay,
            TimerContext::for_rule(imsi, rule_id, PolicyType::Dynamic),
        );
    }

    fn schedule_dynamic_rule_deactivation(
        &self,
        imsi: &str,
        rule_id: &str,
        lifetime: RuleLifetime,
        now: u64,
    ) {
        let delay = duration_until(lifetime.deactivation_time, now);
        log::debug!(
            "Scheduling subscriber {imsi} dynamic rule {rule_id} deactivation in {}s",
            delay.as_secs()
        );
        self.timers.schedule_in(
            SessionTimerId::RuleDeactivation,
            delay,
            TimerContext::for_rule(imsi, rule_id, PolicyType::Dynamic),
        );
    }

    /// Arm the revalidation trigger and its timer
    fn schedule_revalidation(
        &self,
        imsi: &str,
        session: &mut SessionState,
        revalidation_time: u64,
        uc: &mut SessionStateUpdateCriteria,
        now: u64,
    ) {
        session.add_new_event_trigger(EventTrigger::RevalidationTimeout, uc);
        session.set_revalidation_time(revalidation_time, uc);
        let delay = duration_until(revalidation_time, now);
        log::info!(
            "Scheduling revalidation in {}s for {}",
            delay.as_secs(),
            session.session_id()
        );
        self.timers.schedule_in(
            SessionTimerId::Revalidation,
            delay,
            TimerContext::for_session(imsi, session.session_id()),
        );
    }

    // ------------------------------------------------------------------
    // Timer dispatch
    // ------------------------------------------------------------------

    /// Dispatch one expired timer
    pub fn handle_timer(&self, entry: TimerEntry) {
        match entry.timer_id {
            SessionTimerId::ForceTermination => {
                self.handle_force_termination_timeout(&entry.ctx.imsi, &entry.ctx.session_id);
            }
            SessionTimerId::RuleActivation => self.handle_rule_activation_timer(&entry.ctx),
            SessionTimerId::RuleDeactivation => self.handle_rule_deactivation_timer(&entry.ctx),
            SessionTimerId::Revalidation => {
                self.handle_revalidation_timer(&entry.ctx.imsi, &entry.ctx.session_id);
            }
            SessionTimerId::QuotaExhaustionInit => {
                let read = SessionRead::from([entry.ctx.imsi.clone()]);
                let mut session_map = self.session_store.read_sessions_for_deletion(&read);
                let mut session_update = default_session_update(&session_map);
                let imsis = HashSet::from([entry.ctx.imsi.clone()]);
                self.terminate_multiple_services(&mut session_map, &imsis, &mut session_update);
                if !self.session_store.update_sessions(session_update) {
                    log::error!("Failed to update session store with termination initialization");
                }
            }
        }
    }

    fn handle_rule_activation_timer(&self, ctx: &TimerContext) {
        let (imsi, rule_id) = (&ctx.imsi, ctx.rule_id.as_deref().unwrap_or_default());
        let read = SessionRead::from([imsi.clone()]);
        let mut session_map = self.session_store.read_sessions(&read);
        let mut session_update = default_session_update(&session_map);
        let sessions = match session_map.get_mut(imsi) {
            Some(sessions) => sessions,
            None => {
                log::warn!("Could not find session for {imsi} during installation of rule {rule_id}");
                return;
            }
        };
        for session in sessions.iter_mut() {
            let session_id = session.session_id().to_string();
            let config = session.get_config().clone();
            let mut static_rules = Vec::new();
            let mut dynamic_rules = Vec::new();
            {
                let uc = session_uc(&mut session_update, imsi, &session_id);
                match ctx.policy_type {
                    Some(PolicyType::Static) => {
                        if !session.is_static_rule_scheduled(rule_id) {
                            continue;
                        }
                        session.install_scheduled_static_rule(rule_id, uc);
                        static_rules.push(rule_id.to_string());
                    }
                    Some(PolicyType::Dynamic) => {
                        if !session.is_dynamic_rule_scheduled(rule_id) {
                            continue;
                        }
                        session.install_scheduled_dynamic_rule(rule_id, uc);
                        if let Some(rule) = session.get_dynamic_rules().get_rule(rule_id) {
                            dynamic_rules.push(rule.clone());
                        }
                    }
                    None => continue,
                }
            }
            if let Err(e) = self.data_plane.activate_flows_for_rules(
                imsi,
                &config.common_context.ue_ipv4,
                config.apn_ambr(),
                &static_rules,
                &dynamic_rules,
            ) {
                log::error!("Could not activate scheduled rule {rule_id} for {imsi}: {e}");
            }
        }
        self.session_store.update_sessions(session_update);
    }

    fn handle_rule_deactivation_timer(&self, ctx: &TimerContext) {
        let (imsi, rule_id) = (&ctx.imsi, ctx.rule_id.as_deref().unwrap_or_default());
        let read = SessionRead::from([imsi.clone()]);
        let mut session_map = self.session_store.read_sessions(&read);
        let mut session_update = default_session_update(&session_map);
        let sessions = match session_map.get_mut(imsi) {
            Some(sessions) => sessions,
            None => {
                log::warn!("Could not find session for {imsi} during removal of rule {rule_id}");
                return;
            }
        };
        for session in sessions.iter_mut() {
            let session_id = session.session_id().to_string();
            let mut static_rules = Vec::new();
            let mut dynamic_rules = Vec::new();
            {
                let uc = session_uc(&mut session_update, imsi, &session_id);
                match ctx.policy_type {
                    Some(PolicyType::Static) => {
                        if !session.deactivate_static_rule(rule_id, uc) {
                            log::warn!(
                                "Could not find rule {rule_id} for {imsi} during static rule removal"
                            );
                        }
                        static_rules.push(rule_id.to_string());
                    }
                    Some(PolicyType::Dynamic) => {
                        if let Some(rule) = session.remove_dynamic_rule(rule_id, uc) {
                            dynamic_rules.push(rule);
                        }
                    }
                    None => continue,
                }
            }
            if let Err(e) = self.data_plane.deactivate_flows_for_rules(
                imsi,
                &static_rules,
                &dynamic_rules,
                RequestOriginType::Gx,
            ) {
                log::error!("Could not deactivate scheduled rule {rule_id} for {imsi}: {e}");
            }
        }
        self.session_store.update_sessions(session_update);
    }

    fn handle_revalidation_timer(&self, imsi: &str, session_id: &str) {
        log::info!("Revalidation timeout for {session_id}");
        let read = SessionRead::from([imsi.to_string()]);
        let mut session_map = self.session_store.read_sessions(&read);
        let mut session_update = default_session_update(&session_map);
        if let Some(sessions) = session_map.get_mut(imsi) {
            for session in sessions.iter_mut() {
                if session.session_id() == session_id {
                    let uc = session_uc(&mut session_update, imsi, session_id);
                    session.mark_event_trigger_as_triggered(EventTrigger::RevalidationTimeout, uc);
                }
            }
        }
        self.session_store.update_sessions(session_update);
    }

    // ------------------------------------------------------------------
    // Main loop
    // ------------------------------------------------------------------

    /// One enforcement cycle: collect updates across all sessions, apply
    /// the immediate service actions, report to the cloud and apply the
    /// response. A failed round-trip resets the reporting buckets and
    /// surfaces the error so the loop backs off.
    pub fn run_update_cycle(&self, now: u64) -> Result<()> {
        // One working copy and one journal span the whole cycle: the
        // response application folds the in-flight reporting volumes
        // marked during collection.
        let mut session_map = self.session_store.read_all_sessions();
        let mut session_update = default_session_update(&session_map);
        let mut actions = Vec::new();
        let request = self.collect_updates(&mut session_map, &mut actions, &mut session_update, now);
        self.execute_actions(&mut session_map, &actions, &mut session_update);

        if request.is_empty() {
            self.session_store.update_sessions(session_update);
            return Ok(());
        }
        let outcome = match self.reporter.report_update_session(&request) {
            Ok(response) => {
                self.update_session_credits_and_rules(
                    &mut session_map,
                    &response,
                    &mut session_update,
                    now,
                );
                Ok(())
            }
            Err(e) => {
                log::error!("Update session round-trip failed, resetting reported updates: {e}");
                self.reset_updates(&mut session_map, &request, &mut session_update);
                Err(e)
            }
        };
        self.session_store.update_sessions(session_update);
        outcome
    }

    /// Drive the enforcement loop until shutdown: expired timers are
    /// dispatched every poll, update cycles run on the configured tick
    /// and back off after a failed round-trip.
    pub async fn run(&self, shutdown: Arc<AtomicBool>) {
        let tick = Duration::from_secs(self.config.update_interval_secs);
        let back_off = Duration::from_secs(self.config.back_off_interval_secs);
        let mut poll = tokio::time::interval(Duration::from_millis(100));
        let mut next_cycle = Instant::now() + tick;
        loop {
            poll.tick().await;
            if shutdown.load(Ordering::SeqCst) {
                break;
            }
            for entry in self.timers.process_expired() {
                self.handle_timer(entry);
            }
            if Instant::now() >= next_cycle {
                next_cycle = match self.run_update_cycle(epoch_now()) {
                    Ok(()) => Instant::now() + tick,
                    Err(_) => Instant::now() + back_off,
                };
            }
        }
        log::info!("Enforcement loop stopped");
    }
}

// ============================================================================
// Free helpers
// ============================================================================

/// A charging-tracked rule needs credit to be activated; monitored-only
/// rules do not need a monitor with quota.
fn should_activate(rule: &PolicyRule, successful_credits: &HashSet<u32>) -> bool {
    if matches!(
        rule.tracking_type,
        TrackingType::OnlyOcs | TrackingType::OcsAndPcrf
    ) && !successful_credits.contains(&rule.rating_group)
    {
        log::error!(
            "Not activating charging-tracked {} because credit with rating group {} does not exist",
            rule.id,
            rule.rating_group
        );
        return false;
    }
    match rule.tracking_type {
        TrackingType::OnlyPcrf => {
            log::info!(
                "Activating monitor-tracked rule {} with monitoring key {:?}",
                rule.id,
                rule.monitoring_key
            );
        }
        TrackingType::OnlyOcs => {
            log::info!(
                "Activating charging-tracked rule {} with rating group {}",
                rule.id,
                rule.rating_group
            );
        }
        TrackingType::OcsAndPcrf => {
            log::info!(
                "Activating fully tracked rule {} with monitoring key {:?} and rating group {}",
                rule.id,
                rule.monitoring_key,
                rule.rating_group
            );
        }
        TrackingType::NoTracking => {
            log::info!("Activating untracked rule {}", rule.id);
        }
    }
    true
}

fn revalidation_required(event_triggers: &[EventTrigger]) -> bool {
    event_triggers.contains(&EventTrigger::RevalidationTimeout)
}

/// Permanent command-level failures terminate the subscriber; transient
/// ones are only logged.
fn handle_command_level_result_code(
    imsi: &str,
    result_code: u32,
    subscribers_to_terminate: &mut HashSet<String>,
) {
    if is_permanent_failure(result_code) {
        log::error!(
            "{imsi} received permanent failure result code {result_code} during update, \
             terminating subscriber"
        );
        subscribers_to_terminate.insert(imsi.to_string());
    } else {
        log::error!("Received result code {result_code} for {imsi} during update");
    }
}

/// Diameter permanent failures live in the 5xxx range
fn is_permanent_failure(result_code: u32) -> bool {
    (5000..6000).contains(&result_code)
}

fn mark_rule_failures(
    activate_success: bool,
    deactivate_success: bool,
    request: &PolicyReAuthRequest,
    answer_out: &mut PolicyReAuthAnswer,
) {
    if !deactivate_success {
        for rule_id in &request.rules_to_remove {
            answer_out
                .failed_rules
                .insert(rule_id.clone(), PolicyReAuthFailureCode::GwPcefMalfunction);
        }
    }
    if !activate_success {
        for install in &request.rules_to_install {
            answer_out.failed_rules.insert(
                install.rule_id.clone(),
                PolicyReAuthFailureCode::GwPcefMalfunction,
            );
        }
        for install in &request.dynamic_rules_to_install {
            answer_out.failed_rules.insert(
                install.policy_rule.id.clone(),
                PolicyReAuthFailureCode::GwPcefMalfunction,
            );
        }
    }
}

fn is_valid_mac_address(mac: &str) -> bool {
    let mut digits = 0;
    let mut separators = 0;
    for c in mac.chars() {
        if c.is_ascii_hexdigit() {
            digits += 1;
        } else if c == '-' {
            if digits == 0 || digits / 2 - 1 != separators {
                return false;
            }
            separators += 1;
        } else {
            return false;
        }
    }
    digits == 12 && separators == 5
}

/// WLAN APNs are formatted "AP-MAC:AP-name", e.g.
/// "1C-B9-C4-36-04-F0:Wifi-Offload-hotspot20"
fn parse_apn(apn: &str) -> Option<(String, String)> {
    if apn.is_empty() {
        return None;
    }
    let split = apn.find(':')?;
    if split == 0 {
        return None;
    }
    let mac = &apn[..split];
    if !is_valid_mac_address(mac) {
        return None;
    }
    // an empty AP name is allowed
    Some((mac.to_string(), apn[split + 1..].to_string()))
}
