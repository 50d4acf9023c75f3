//! In-memory fakes for the external collaborators

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::Result;

use cg_proto::{
    AggregatedMaximumBitrate, ChargingCredit, CommonSessionContext, CreateBearerRequest,
    CreateSessionRequest, CreateSessionResponse, CreditUpdateResponse, DeleteBearerRequest,
    GrantedUnits, LteSessionContext, PolicyRule, QosInformation, RatSpecificContext, RatType,
    RequestOriginType, SessionConfig, SessionTerminateRequest, SetupFlowsResult,
    SubscriberQuotaUpdate, UpdateSessionRequest, UpdateSessionResponse,
};
use coregate_sessiond::clients::{
    AaaClient, DataPlaneClient, DirectoryClient, SessionReporter, SpgwClient,
};
use coregate_sessiond::config::SessionDConfig;
use coregate_sessiond::enforcer::LocalEnforcer;
use coregate_sessiond::rules::StaticRuleStore;
use coregate_sessiond::session::SessionInfo;
use coregate_sessiond::store::SessionStore;

// ============================================================================
// Fake data plane
// ============================================================================

#[derive(Default)]
pub struct FakeDataPlane {
    pub activate_calls: Mutex<Vec<(String, Vec<String>, Vec<PolicyRule>)>>,
    pub deactivate_calls: Mutex<Vec<(String, Vec<String>, Vec<PolicyRule>, RequestOriginType)>>,
    pub final_action_calls: Mutex<Vec<(String, String, Vec<String>, Vec<PolicyRule>)>>,
    pub setup_calls: Mutex<Vec<u64>>,
}

impl DataPlaneClient for FakeDataPlane {
    fn activate_flows_for_rules(
        &self,
        imsi: &str,
        _ip_addr: &str,
        _ambr: Option<AggregatedMaximumBitrate>,
        static_rules: &[String],
        dynamic_rules: &[PolicyRule],
    ) -> Result<()> {
        self.activate_calls.lock().unwrap().push((
            imsi.to_string(),
            static_rules.to_vec(),
            dynamic_rules.to_vec(),
        ));
        Ok(())
    }

    fn deactivate_flows_for_rules(
        &self,
        imsi: &str,
        static_rules: &[String],
        dynamic_rules: &[PolicyRule],
        origin: RequestOriginType,
    ) -> Result<()> {
        self.deactivate_calls.lock().unwrap().push((
            imsi.to_string(),
            static_rules.to_vec(),
            dynamic_rules.to_vec(),
            origin,
        ));
        Ok(())
    }

    fn add_final_action_flow(
        &self,
        imsi: &str,
        ip_addr: &str,
        restrict_rule_ids: &[String],
        dynamic_rules: &[PolicyRule],
    ) -> Result<()> {
        self.final_action_calls.lock().unwrap().push((
            imsi.to_string(),
            ip_addr.to_string(),
            restrict_rule_ids.to_vec(),
            dynamic_rules.to_vec(),
        ));
        Ok(())
    }

    fn setup_flows(&self, _sessions: &[SessionInfo], epoch: u64) -> Result<SetupFlowsResult> {
        self.setup_calls.lock().unwrap().push(epoch);
        Ok(SetupFlowsResult::Success)
    }

    fn update_ipfix_flow(
        &self,
        _imsi: &str,
        _ue_mac_addr: &str,
        _msisdn: &str,
        _apn_mac_addr: &str,
        _apn_name: &str,
        _pdp_start_time: u64,
    ) -> Result<()> {
        Ok(())
    }

    fn update_subscriber_quota_state(&self, _updates: &[SubscriberQuotaUpdate]) -> Result<()> {
        Ok(())
    }

    fn delete_ue_mac_flow(&self, _imsi: &str, _mac_addr: &str) -> Result<()> {
        Ok(())
    }
}

// ============================================================================
// Fake reporter
// ============================================================================

#[derive(Default)]
pub struct FakeReporter {
    pub update_response: Mutex<UpdateSessionResponse>,
    pub fail_updates: AtomicBool,
    pub update_requests: Mutex<Vec<UpdateSessionRequest>>,
    pub terminate_requests: Mutex<Vec<SessionTerminateRequest>>,
}

impl SessionReporter for FakeReporter {
    fn report_create_session(&self, _req: &CreateSessionRequest) -> Result<CreateSessionResponse> {
        Ok(CreateSessionResponse::default())
    }

    fn report_update_session(&self, req: &UpdateSessionRequest) -> Result<UpdateSessionResponse> {
        self.update_requests.lock().unwrap().push(req.clone());
        if self.fail_updates.load(Ordering::SeqCst) {
            anyhow::bail!("transport failure");
        }
        Ok(self.update_response.lock().unwrap().clone())
    }

    fn report_terminate_session(&self, req: &SessionTerminateRequest) -> Result<()> {
        self.terminate_requests.lock().unwrap().push(req.clone());
        Ok(())
    }
}

// ============================================================================
// Fake directory / SPGW / AAA
// ============================================================================

pub struct FakeDirectory {
    pub ip: String,
}

impl Default for FakeDirectory {
    fn default() -> Self {
        Self {
            ip: "192.168.128.11".to_string(),
        }
    }
}

impl DirectoryClient for FakeDirectory {
    fn get_subscriber_ip(&self, _imsi: &str) -> Result<String> {
        Ok(self.ip.clone())
    }
}

#[derive(Default)]
pub struct FakeSpgw {
    pub create_requests: Mutex<Vec<CreateBearerRequest>>,
    pub delete_requests: Mutex<Vec<DeleteBearerRequest>>,
    pub default_bearer_deletes: Mutex<Vec<(String, u32)>>,
}

impl SpgwClient for FakeSpgw {
    fn create_dedicated_bearer(&self, req: &CreateBearerRequest) -> Result<()> {
        self.create_requests.lock().unwrap().push(req.clone());
        Ok(())
    }

    fn delete_dedicated_bearer(&self, req: &DeleteBearerRequest) -> Result<()> {
        self.delete_requests.lock().unwrap().push(req.clone());
        Ok(())
    }

    fn delete_default_bearer(&self, imsi: &str, _ue_ipv4: &str, bearer_id: u32) -> Result<()> {
        self.default_bearer_deletes
            .lock()
            .unwrap()
            .push((imsi.to_string(), bearer_id));
        Ok(())
    }
}

#[derive(Default)]
pub struct FakeAaa {
    pub terminated: Mutex<Vec<(String, String)>>,
}

impl AaaClient for FakeAaa {
    fn terminate_session(&self, radius_session_id: &str, imsi: &str) -> Result<()> {
        self.terminated
            .lock()
            .unwrap()
            .push((radius_session_id.to_string(), imsi.to_string()));
        Ok(())
    }
}

// ============================================================================
// Test harness
// ============================================================================

pub struct Harness {
    pub enforcer: LocalEnforcer,
    pub data_plane: Arc<FakeDataPlane>,
    pub reporter: Arc<FakeReporter>,
    pub spgw: Arc<FakeSpgw>,
    pub aaa: Arc<FakeAaa>,
    pub rule_store: Arc<StaticRuleStore>,
}

impl Harness {
    pub fn new(config: SessionDConfig) -> Self {
        let data_plane = Arc::new(FakeDataPlane::default());
        let reporter = Arc::new(FakeReporter::default());
        let spgw = Arc::new(FakeSpgw::default());
        let aaa = Arc::new(FakeAaa::default());
        let rule_store = Arc::new(StaticRuleStore::new());
        let session_store = Arc::new(SessionStore::new());
        let enforcer = LocalEnforcer::new(
            Arc::clone(&reporter) as Arc<dyn SessionReporter>,
            Arc::clone(&rule_store),
            session_store,
            Arc::clone(&data_plane) as Arc<dyn DataPlaneClient>,
            Arc::new(FakeDirectory::default()) as Arc<dyn DirectoryClient>,
            Arc::clone(&spgw) as Arc<dyn SpgwClient>,
            Arc::clone(&aaa) as Arc<dyn AaaClient>,
            config,
        );
        Self {
            enforcer,
            data_plane,
            reporter,
            spgw,
            aaa,
            rule_store,
        }
    }
}

// ============================================================================
// Message builders
// ============================================================================

pub fn lte_config(imsi: &str, apn: &str) -> SessionConfig {
    SessionConfig {
        common_context: CommonSessionContext {
            imsi: imsi.to_string(),
            msisdn: "5551234".to_string(),
            apn: apn.to_string(),
            rat_type: Some(RatType::Lte),
            ue_ipv4: "192.168.128.11".to_string(),
        },
        rat_specific_context: RatSpecificContext::Lte(LteSessionContext {
            bearer_id: 5,
            imei: "356938035643809".to_string(),
            plmn_id: "00101".to_string(),
            imsi_plmn_id: "00101".to_string(),
            spgw_ipv4: "10.0.2.1".to_string(),
            user_location: String::new(),
            qos: Some(QosInformation {
                qos_class_id: 9,
                ambr: None,
            }),
        }),
    }
}

pub fn credit_response(imsi: &str, session_id: &str, rg: u32, total: u64) -> CreditUpdateResponse {
    CreditUpdateResponse {
        success: true,
        sid: imsi.to_string(),
        session_id: session_id.to_string(),
        charging_key: rg,
        credit: ChargingCredit {
            granted_units: GrantedUnits::total_only(total),
            ..Default::default()
        },
        ..Default::default()
    }
}
