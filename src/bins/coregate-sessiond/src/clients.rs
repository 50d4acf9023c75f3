//! External collaborator interfaces
//!
//! Capability traits for everything the engine talks to: the data-plane
//! service, the policy/charging reporter, the directory service, the
//! SPGW and the AAA service. Concrete transports are injected; tests
//! substitute in-memory fakes. Rule installs must be idempotent since
//! the enforcer may re-send them after a data-plane restart.

use anyhow::Result;

use cg_proto::{
    AggregatedMaximumBitrate, CreateBearerRequest, CreateSessionRequest, CreateSessionResponse,
    DeleteBearerRequest, PolicyRule, RequestOriginType, SessionTerminateRequest,
    SetupFlowsResult, SubscriberQuotaUpdate, UpdateSessionRequest, UpdateSessionResponse,
};

use crate::session::SessionInfo;

/// Client towards the data-plane enforcement service
pub trait DataPlaneClient: Send + Sync {
    /// Install rules for a subscriber
    fn activate_flows_for_rules(
        &self,
        imsi: &str,
        ip_addr: &str,
        ambr: Option<AggregatedMaximumBitrate>,
        static_rules: &[String],
        dynamic_rules: &[PolicyRule],
    ) -> Result<()>;

    /// Remove rules for a subscriber
    fn deactivate_flows_for_rules(
        &self,
        imsi: &str,
        static_rules: &[String],
        dynamic_rules: &[PolicyRule],
        origin: RequestOriginType,
    ) -> Result<()>;

    /// Install charging final-unit flows (redirect / restrict)
    fn add_final_action_flow(
        &self,
        imsi: &str,
        ip_addr: &str,
        restrict_rule_ids: &[String],
        dynamic_rules: &[PolicyRule],
    ) -> Result<()>;

    /// Push all current sessions after a data-plane restart
    fn setup_flows(&self, sessions: &[SessionInfo], epoch: u64) -> Result<SetupFlowsResult>;

    /// Refresh the IPFIX export flow for a subscriber
    fn update_ipfix_flow(
        &self,
        imsi: &str,
        ue_mac_addr: &str,
        msisdn: &str,
        apn_mac_addr: &str,
        apn_name: &str,
        pdp_start_time: u64,
    ) -> Result<()>;

    /// Propagate subscriber wallet state (WLAN)
    fn update_subscriber_quota_state(&self, updates: &[SubscriberQuotaUpdate]) -> Result<()>;

    /// Remove the UE MAC flow of a WLAN subscriber
    fn delete_ue_mac_flow(&self, imsi: &str, mac_addr: &str) -> Result<()>;
}

/// Client towards the policy/charging cloud
pub trait SessionReporter: Send + Sync {
    fn report_create_session(&self, req: &CreateSessionRequest) -> Result<CreateSessionResponse>;

    fn report_update_session(&self, req: &UpdateSessionRequest) -> Result<UpdateSessionResponse>;

    fn report_terminate_session(&self, req: &SessionTerminateRequest) -> Result<()>;
}

/// Client towards the directory service
pub trait DirectoryClient: Send + Sync {
    /// Resolve the current IP address of a subscriber
    fn get_subscriber_ip(&self, imsi: &str) -> Result<String>;
}

/// Client towards the SPGW for bearer management
pub trait SpgwClient: Send + Sync {
    fn create_dedicated_bearer(&self, req: &CreateBearerRequest) -> Result<()>;

    fn delete_dedicated_bearer(&self, req: &DeleteBearerRequest) -> Result<()>;

    /// Tear down the PDN session by deactivating the default bearer
    fn delete_default_bearer(&self, imsi: &str, ue_ipv4: &str, bearer_id: u32) -> Result<()>;
}

/// Client towards the AAA service (WLAN access)
pub trait AaaClient: Send + Sync {
    fn terminate_session(&self, radius_session_id: &str, imsi: &str) -> Result<()>;
}

// ============================================================================
// Log-only implementations
// ============================================================================

/// Data-plane client used when no transport is wired; logs every call
/// and reports success. Useful for standalone and bench runs.
#[derive(Debug, Default)]
pub struct LoggingDataPlaneClient;

impl DataPlaneClient for LoggingDataPlaneClient {
    fn activate_flows_for_rules(
        &self,
        imsi: &str,
        ip_addr: &str,
        _ambr: Option<AggregatedMaximumBitrate>,
        static_rules: &[String],
        dynamic_rules: &[PolicyRule],
    ) -> Result<()> {
        log::info!(
            "activate_flows_for_rules imsi={imsi} ip={ip_addr} static={} dynamic={}",
            static_rules.len(),
            dynamic_rules.len()
        );
        Ok(())
    }

    fn deactivate_flows_for_rules(
        &self,
        imsi: &str,
        static_rules: &[String],
        dynamic_rules: &[PolicyRule],
        origin: RequestOriginType,
    ) -> Result<()> {
        log::info!(
            "deactivate_flows_for_rules imsi={imsi} static={} dynamic={} origin={origin:?}",
            static_rules.len(),
            dynamic_rules.len()
        );
        Ok(())
    }

    fn add_final_action_flow(
        &self,
        imsi: &str,
        ip_addr: &str,
        restrict_rule_ids: &[String],
        dynamic_rules: &[PolicyRule],
    ) -> Result<()> {
        log::info!(
            "add_final_action_flow imsi={imsi} ip={ip_addr} restrict={} dynamic={}",
            restrict_rule_ids.len(),
            dynamic_rules.len()
        );
        Ok(())
    }

    fn setup_flows(&self, sessions: &[SessionInfo], epoch: u64) -> Result<SetupFlowsResult> {
        log::info!("setup_flows sessions={} epoch={epoch}", sessions.len());
        Ok(SetupFlowsResult::Success)
    }

    fn update_ipfix_flow(
        &self,
        imsi: &str,
        _ue_mac_addr: &str,
        _msisdn: &str,
        _apn_mac_addr: &str,
        _apn_name: &str,
        _pdp_start_time: u64,
    ) -> Result<()> {
        log::debug!("update_ipfix_flow imsi={imsi}");
        Ok(())
    }

    fn update_subscriber_quota_state(&self, updates: &[SubscriberQuotaUpdate]) -> Result<()> {
        log::debug!("update_subscriber_quota_state count={}", updates.len());
        Ok(())
    }

    fn delete_ue_mac_flow(&self, imsi: &str, mac_addr: &str) -> Result<()> {
        log::debug!("delete_ue_mac_flow imsi={imsi} mac={mac_addr}");
        Ok(())
    }
}

/// Reporter used when no cloud connection is wired; answers every
/// request with an empty success.
#[derive(Debug, Default)]
pub struct LoggingSessionReporter;

impl SessionReporter for LoggingSessionReporter {
    fn report_create_session(&self, req: &CreateSessionRequest) -> Result<CreateSessionResponse> {
        log::info!("report_create_session sid={} session={}", req.sid, req.session_id);
        Ok(CreateSessionResponse::default())
    }

    fn report_update_session(&self, req: &UpdateSessionRequest) -> Result<UpdateSessionResponse> {
        log::info!(
            "report_update_session updates={} monitors={}",
            req.updates.len(),
            req.usage_monitors.len()
        );
        Ok(UpdateSessionResponse::default())
    }

    fn report_terminate_session(&self, req: &SessionTerminateRequest) -> Result<()> {
        log::info!("report_terminate_session sid={} session={}", req.sid, req.session_id);
        Ok(())
    }
}

/// Directory client used when no transport is wired; resolves nothing.
#[derive(Debug, Default)]
pub struct LoggingDirectoryClient;

impl DirectoryClient for LoggingDirectoryClient {
    fn get_subscriber_ip(&self, imsi: &str) -> Result<String> {
        anyhow::bail!("no directory backend configured, cannot resolve {imsi}")
    }
}

/// SPGW client used when no transport is wired
#[derive(Debug, Default)]
pub struct LoggingSpgwClient;

impl SpgwClient for LoggingSpgwClient {
    fn create_dedicated_bearer(&self, req: &CreateBearerRequest) -> Result<()> {
        log::info!(
            "create_dedicated_bearer sid={} link_bearer={} rules={}",
            req.sid,
            req.link_bearer_id,
            req.policy_rules.len()
        );
        Ok(())
    }

    fn delete_dedicated_bearer(&self, req: &DeleteBearerRequest) -> Result<()> {
        log::info!(
            "delete_dedicated_bearer sid={} bearers={:?}",
            req.sid,
            req.eps_bearer_ids
        );
        Ok(())
    }

    fn delete_default_bearer(&self, imsi: &str, ue_ipv4: &str, bearer_id: u32) -> Result<()> {
        log::info!("delete_default_bearer imsi={imsi} ip={ue_ipv4} bearer={bearer_id}");
        Ok(())
    }
}

/// AAA client used when no transport is wired
#[derive(Debug, Default)]
pub struct LoggingAaaClient;

impl AaaClient for LoggingAaaClient {
    fn terminate_session(&self, radius_session_id: &str, imsi: &str) -> Result<()> {
        log::info!("aaa terminate_session radius={radius_session_id} imsi={imsi}");
        Ok(())
    }
}
