//! End-to-end enforcement scenarios against in-memory fakes

mod common;

use std::collections::HashSet;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use cg_proto::{
    ChargingReAuthRequest, ChargingReAuthType, CreateSessionResponse, CreditKey, CreditUsageType,
    DynamicRuleInstall, FinalAction, FlowQos, PolicyBearerBindingRequest, PolicyReAuthAnswer,
    PolicyReAuthRequest, PolicyRule, ReAuthQosInformation, ReAuthResult, RedirectAddressType,
    RedirectServer, RuleRecord, RuleRecordTable, StaticRuleInstall, TrackingType,
    UpdateSessionResponse,
};
use coregate_sessiond::config::SessionDConfig;
use coregate_sessiond::credit::Bucket;
use coregate_sessiond::enforcer::REDIRECT_FLOW_PRIORITY;
use coregate_sessiond::rules::RuleLifetime;
use coregate_sessiond::session::SessionState;
use coregate_sessiond::stored::{default_update_criteria, PolicyId, PolicyType, SessionFsmState};
use coregate_sessiond::store::default_session_update;

use common::{credit_response, lte_config, Harness};

const NOW: u64 = 1_600_000_000;

fn charged_static_rule(id: &str, rg: u32) -> PolicyRule {
    let mut rule = PolicyRule::new(id, 10);
    rule.rating_group = rg;
    rule.tracking_type = TrackingType::OnlyOcs;
    rule
}

fn init_session_with_rule(harness: &Harness, imsi: &str, session_id: &str) {
    harness.rule_store.insert_rule(charged_static_rule("r-rg10", 10));
    let response = CreateSessionResponse {
        credits: vec![credit_response(imsi, session_id, 10, 1000)],
        static_rules: vec![StaticRuleInstall {
            rule_id: "r-rg10".to_string(),
            ..Default::default()
        }],
        ..Default::default()
    };
    assert!(harness.enforcer.init_session_credit(
        imsi,
        session_id,
        &lte_config(imsi, "magma.ipv4"),
        &response,
        NOW,
    ));
}

#[test]
fn test_init_usage_and_refill() {
    let harness = Harness::new(SessionDConfig::default());
    init_session_with_rule(&harness, "IMSI001", "s1");

    // session creation pushed the initial rules to the data plane
    let activations = harness.data_plane.activate_calls.lock().unwrap().clone();
    assert_eq!(activations.len(), 1);
    assert!(activations[0].1.contains(&"r-rg10".to_string()));

    let store = harness.enforcer.session_store();
    let mut session_map = store.read_all_sessions();
    let mut session_update = default_session_update(&session_map);

    // one data-plane report with 800 tx bytes against the rule
    let records = RuleRecordTable {
        records: vec![RuleRecord {
            sid: "IMSI001".to_string(),
            rule_id: "r-rg10".to_string(),
            bytes_tx: 800,
            bytes_rx: 0,
        }],
    };
    harness
        .enforcer
        .aggregate_records(&mut session_map, &records, &mut session_update);

    let mut actions = Vec::new();
    let request =
        harness
            .enforcer
            .collect_updates(&mut session_map, &mut actions, &mut session_update, NOW);
    assert_eq!(request.updates.len(), 1);
    let update = &request.updates[0];
    assert_eq!(update.usage.charging_key, 10);
    assert_eq!(update.usage.bytes_tx, 800);
    assert_eq!(update.usage.bytes_rx, 0);
    assert_eq!(update.usage.update_type, CreditUsageType::QuotaExhausted);
    assert_eq!(update.request_number, 1);
    assert!(actions.is_empty());

    // the refill response grants another 2000 total
    let response = UpdateSessionResponse {
        responses: vec![credit_response("IMSI001", "s1", 10, 2000)],
        ..Default::default()
    };
    harness.enforcer.update_session_credits_and_rules(
        &mut session_map,
        &response,
        &mut session_update,
        NOW,
    );
    assert!(store.update_sessions(session_update));

    let session = store.get_session("IMSI001", "s1").unwrap();
    let key = CreditKey::new(10);
    assert_eq!(session.get_request_number(), 2);
    assert_eq!(session.get_charging_credit(&key, Bucket::UsedTx), 800);
    assert_eq!(session.get_charging_credit(&key, Bucket::AllowedTotal), 3000);
    assert_eq!(session.get_charging_credit(&key, Bucket::ReportingTx), 0);
    assert_eq!(session.get_charging_credit(&key, Bucket::ReportedTx), 800);
}

#[test]
fn test_final_unit_redirect() {
    let harness = Harness::new(SessionDConfig::default());
    harness.rule_store.insert_rule(charged_static_rule("r-rg10", 10));

    let mut credit = credit_response("IMSI001", "s1", 10, 1000);
    credit.credit.is_final = true;
    credit.credit.final_action = FinalAction::Redirect;
    credit.credit.redirect_server = Some(RedirectServer {
        address_type: RedirectAddressType::Url,
        server_address: "http://portal.example.net".to_string(),
    });
    let response = CreateSessionResponse {
        credits: vec![credit],
        static_rules: vec![StaticRuleInstall {
            rule_id: "r-rg10".to_string(),
            ..Default::default()
        }],
        ..Default::default()
    };
    assert!(harness.enforcer.init_session_credit(
        "IMSI001",
        "s1",
        &lte_config("IMSI001", "magma.ipv4"),
        &response,
        NOW,
    ));

    let store = harness.enforcer.session_store();
    let mut session_map = store.read_all_sessions();
    let mut session_update = default_session_update(&session_map);

    // usage reaches 100% of the final grant
    let records = RuleRecordTable {
        records: vec![RuleRecord {
            sid: "IMSI001".to_string(),
            rule_id: "r-rg10".to_string(),
            bytes_tx: 1000,
            bytes_rx: 0,
        }],
    };
    harness
        .enforcer
        .aggregate_records(&mut session_map, &records, &mut session_update);

    let mut actions = Vec::new();
    let request =
        harness
            .enforcer
            .collect_updates(&mut session_map, &mut actions, &mut session_update, NOW);
    // the exhausted final grant emits no usage update, only the action
    assert!(request.updates.is_empty());
    assert_eq!(actions.len(), 1);

    harness
        .enforcer
        .execute_actions(&mut session_map, &actions, &mut session_update);
    assert!(store.update_sessions(session_update));

    // the synthetic redirect rule reached the data plane
    let final_calls = harness.data_plane.final_action_calls.lock().unwrap().clone();
    assert_eq!(final_calls.len(), 1);
    assert_eq!(final_calls[0].3.len(), 1);
    let redirect_rule = &final_calls[0].3[0];
    assert_eq!(redirect_rule.id, "redirect");
    assert_eq!(redirect_rule.priority, REDIRECT_FLOW_PRIORITY);
    assert_eq!(
        redirect_rule.redirect.as_ref().unwrap().server_address,
        "http://portal.example.net"
    );

    let session = store.get_session("IMSI001", "s1").unwrap();
    assert!(session.is_gy_dynamic_rule_installed("redirect"));

    // no further credit usage update for the redirected key
    let mut session_map = store.read_all_sessions();
    let mut session_update = default_session_update(&session_map);
    let mut actions = Vec::new();
    let request =
        harness
            .enforcer
            .collect_updates(&mut session_map, &mut actions, &mut session_update, NOW);
    assert!(request.updates.is_empty());
    assert!(actions.is_empty());
}

#[test]
fn test_policy_rar_install_and_bearer_binding() {
    let harness = Harness::new(SessionDConfig::default());
    let response = CreateSessionResponse::default();
    assert!(harness.enforcer.init_session_credit(
        "IMSI001",
        "s1",
        &lte_config("IMSI001", "magma.ipv4"),
        &response,
        NOW,
    ));

    let mut qos_rule = PolicyRule::new("qos-rule", 20);
    qos_rule.qos = Some(FlowQos {
        qci: 5,
        max_req_bw_ul: 1_000_000,
        max_req_bw_dl: 1_000_000,
    });

    let rar = PolicyReAuthRequest {
        imsi: "IMSI001".to_string(),
        session_id: "s1".to_string(),
        dynamic_rules_to_install: vec![DynamicRuleInstall {
            policy_rule: qos_rule.clone(),
            activation_time: 0,
            deactivation_time: 0,
        }],
        qos_info: Some(ReAuthQosInformation { qci: 5 }),
        ..Default::default()
    };

    let store = harness.enforcer.session_store();
    let mut session_map = store.read_all_sessions();
    let mut session_update = default_session_update(&session_map);
    let mut answer = PolicyReAuthAnswer::default();
    harness
        .enforcer
        .init_policy_reauth(&mut session_map, &rar, &mut answer, &mut session_update, NOW);
    assert_eq!(answer.result, Some(ReAuthResult::UpdateInitiated));
    assert!(answer.failed_rules.is_empty());
    assert!(store.update_sessions(session_update));

    // the rule was activated in the data plane
    let activations = harness.data_plane.activate_calls.lock().unwrap().clone();
    assert!(activations
        .iter()
        .any(|(_, _, dynamic)| dynamic.iter().any(|r| r.id == "qos-rule")));

    // a bearer creation was queued against the default bearer (5)
    let creates = harness.spgw.create_requests.lock().unwrap().clone();
    assert_eq!(creates.len(), 1);
    assert_eq!(creates[0].link_bearer_id, 5);
    assert!(creates[0].policy_rules.iter().any(|r| r.id == "qos-rule"));

    // SGW acknowledges with bearer id 7
    let binding = PolicyBearerBindingRequest {
        sid: "IMSI001".to_string(),
        linked_bearer_id: 5,
        policy_rule_id: "qos-rule".to_string(),
        bearer_id: 7,
    };
    let mut session_map = store.read_all_sessions();
    let mut session_update = default_session_update(&session_map);
    assert!(harness
        .enforcer
        .bind_policy_to_bearer(&mut session_map, &binding, &mut session_update));
    assert!(store.update_sessions(session_update));

    let session = store.get_session("IMSI001", "s1").unwrap();
    assert_eq!(
        session.get_bearer_id_for_policy(&PolicyId::new(PolicyType::Dynamic, "qos-rule")),
        Some(7)
    );

    // a second QoS rule whose bearer creation fails is removed
    let mut failed_rule = PolicyRule::new("qos-rule-b", 21);
    failed_rule.qos = Some(FlowQos {
        qci: 7,
        max_req_bw_ul: 0,
        max_req_bw_dl: 0,
    });
    let rar_b = PolicyReAuthRequest {
        imsi: "IMSI001".to_string(),
        session_id: "s1".to_string(),
        dynamic_rules_to_install: vec![DynamicRuleInstall {
            policy_rule: failed_rule,
            activation_time: 0,
            deactivation_time: 0,
        }],
        qos_info: Some(ReAuthQosInformation { qci: 7 }),
        ..Default::default()
    };
    let mut session_map = store.read_all_sessions();
    let mut session_update = default_session_update(&session_map);
    let mut answer = PolicyReAuthAnswer::default();
    harness
        .enforcer
        .init_policy_reauth(&mut session_map, &rar_b, &mut answer, &mut session_update, NOW);
    store.update_sessions(session_update);

    let failed_binding = PolicyBearerBindingRequest {
        sid: "IMSI001".to_string(),
        linked_bearer_id: 5,
        policy_rule_id: "qos-rule-b".to_string(),
        bearer_id: 0,
    };
    let mut session_map = store.read_all_sessions();
    let mut session_update = default_session_update(&session_map);
    assert!(!harness.enforcer.bind_policy_to_bearer(
        &mut session_map,
        &failed_binding,
        &mut session_update
    ));
    assert!(store.update_sessions(session_update));

    let session = store.get_session("IMSI001", "s1").unwrap();
    assert!(!session.is_dynamic_rule_installed("qos-rule-b"));
    let deactivations = harness.data_plane.deactivate_calls.lock().unwrap().clone();
    assert!(deactivations
        .iter()
        .any(|(_, _, dynamic, _)| dynamic.iter().any(|r| r.id == "qos-rule-b")));
}

#[test]
fn test_forced_termination() {
    let config = SessionDConfig {
        session_force_termination_timeout_ms: 50,
        ..Default::default()
    };
    let harness = Harness::new(config);
    init_session_with_rule(&harness, "IMSI001", "s1");

    let store = harness.enforcer.session_store();
    let mut session_map = store.read_all_sessions();
    let mut session_update = default_session_update(&session_map);
    harness
        .enforcer
        .terminate_session(&mut session_map, "IMSI001", "magma.ipv4", &mut session_update, NOW)
        .unwrap();
    assert!(store.update_sessions(session_update));

    let session = store.get_session("IMSI001", "s1").unwrap();
    assert_eq!(session.get_state(), SessionFsmState::TerminationScheduled);
    assert_eq!(session.get_pdp_end_time(), NOW);

    // all rules were pulled from the data plane
    let deactivations = harness.data_plane.deactivate_calls.lock().unwrap().clone();
    assert!(deactivations
        .iter()
        .any(|(imsi, static_rules, _, _)| imsi == "IMSI001"
            && static_rules.contains(&"r-rg10".to_string())));

    // no usage report ever arrives; the forced timer fires
    assert!(harness.enforcer.timers().active_count() >= 1);
    thread::sleep(Duration::from_millis(60));
    let expired = harness.enforcer.timers().process_expired();
    assert_eq!(expired.len(), 1);
    for entry in expired {
        harness.enforcer.handle_timer(entry);
    }

    // terminate RPC went out and the session is gone
    let terminations = harness.reporter.terminate_requests.lock().unwrap().clone();
    assert_eq!(terminations.len(), 1);
    assert_eq!(terminations[0].sid, "IMSI001");
    assert_eq!(terminations[0].session_id, "s1");
    assert!(store.get_session("IMSI001", "s1").is_none());
}

#[test]
fn test_reauth_of_unknown_session() {
    let harness = Harness::new(SessionDConfig::default());
    init_session_with_rule(&harness, "IMSI001", "s1");

    let request = ChargingReAuthRequest {
        sid: "IMSI001".to_string(),
        session_id: "doesNotExist".to_string(),
        reauth_type: ChargingReAuthType::SingleService,
        charging_key: 10,
        service_identifier: None,
    };
    let store = harness.enforcer.session_store();
    let mut session_map = store.read_all_sessions();
    let mut session_update = default_session_update(&session_map);
    let result =
        harness
            .enforcer
            .init_charging_reauth(&mut session_map, &request, &mut session_update);
    assert_eq!(result, ReAuthResult::SessionNotFound);
    assert!(store.update_sessions(session_update));

    // no mutation happened
    let session = store.get_session("IMSI001", "s1").unwrap();
    assert_eq!(session.get_request_number(), 1);
    let mut session_map = store.read_all_sessions();
    let mut session_update = default_session_update(&session_map);
    let mut actions = Vec::new();
    let request =
        harness
            .enforcer
            .collect_updates(&mut session_map, &mut actions, &mut session_update, NOW);
    assert!(request.updates.is_empty());
}

#[test]
fn test_rule_lifetime_sync_across_restart() {
    let harness = Harness::new(SessionDConfig::default());
    let store = harness.enforcer.session_store();

    // rebuild the pre-restart state directly in the store
    let mut session = SessionState::new(
        "IMSI001",
        "s1",
        lte_config("IMSI001", "magma.ipv4"),
        Arc::clone(&harness.rule_store),
        NOW - 600,
    );
    let mut uc = default_update_criteria();
    session.activate_static_rule(
        "r-keep",
        RuleLifetime {
            activation_time: NOW - 60,
            deactivation_time: NOW + 120,
        },
        &mut uc,
    );
    session.activate_static_rule(
        "r-stale",
        RuleLifetime {
            activation_time: NOW - 300,
            deactivation_time: NOW - 10,
        },
        &mut uc,
    );
    store.create_session("IMSI001", session);

    harness.enforcer.sync_sessions_on_restart(NOW);

    let session = store.get_session("IMSI001", "s1").unwrap();
    assert!(session.is_static_rule_installed("r-keep"));
    assert!(!session.is_static_rule_installed("r-stale"));

    // the surviving rule has a deactivation timer re-armed at +120s
    assert_eq!(harness.enforcer.timers().active_count(), 1);
    let next = harness.enforcer.timers().next_expiration().unwrap();
    assert!(next > Duration::from_secs(100) && next <= Duration::from_secs(120));
}

#[test]
fn test_failed_round_trip_resets_reporting() {
    let harness = Harness::new(SessionDConfig::default());
    init_session_with_rule(&harness, "IMSI001", "s1");

    let store = harness.enforcer.session_store();
    {
        let mut session_map = store.read_all_sessions();
        let mut session_update = default_session_update(&session_map);
        let records = RuleRecordTable {
            records: vec![RuleRecord {
                sid: "IMSI001".to_string(),
                rule_id: "r-rg10".to_string(),
                bytes_tx: 900,
                bytes_rx: 0,
            }],
        };
        harness
            .enforcer
            .aggregate_records(&mut session_map, &records, &mut session_update);
        assert!(store.update_sessions(session_update));
    }

    harness.reporter.fail_updates.store(true, Ordering::SeqCst);
    assert!(harness.enforcer.run_update_cycle(NOW).is_err());

    // reporting was reset; the next successful cycle retries the usage
    harness.reporter.fail_updates.store(false, Ordering::SeqCst);
    assert!(harness.enforcer.run_update_cycle(NOW).is_ok());
    let requests = harness.reporter.update_requests.lock().unwrap().clone();
    assert_eq!(requests.len(), 2);
    assert_eq!(requests[1].updates.len(), 1);
    assert_eq!(requests[1].updates[0].usage.bytes_tx, 900);

    // request numbers are strictly increasing across the retries
    assert!(requests[1].updates[0].request_number > requests[0].updates[0].request_number);
}

#[test]
fn test_termination_emits_no_further_updates() {
    let harness = Harness::new(SessionDConfig::default());
    init_session_with_rule(&harness, "IMSI001", "s1");

    let store = harness.enforcer.session_store();
    let mut session_map = store.read_all_sessions();
    let mut session_update = default_session_update(&session_map);
    let records = RuleRecordTable {
        records: vec![RuleRecord {
            sid: "IMSI001".to_string(),
            rule_id: "r-rg10".to_string(),
            bytes_tx: 900,
            bytes_rx: 0,
        }],
    };
    harness
        .enforcer
        .aggregate_records(&mut session_map, &records, &mut session_update);
    harness
        .enforcer
        .terminate_session(&mut session_map, "IMSI001", "magma.ipv4", &mut session_update, NOW)
        .unwrap();

    let mut actions = Vec::new();
    let request =
        harness
            .enforcer
            .collect_updates(&mut session_map, &mut actions, &mut session_update, NOW);
    assert!(request.updates.is_empty());
    assert!(store.update_sessions(session_update));

    // the empty data-plane report completes the termination
    let mut session_map = store.read_all_sessions();
    let mut session_update = default_session_update(&session_map);
    harness.enforcer.aggregate_records(
        &mut session_map,
        &RuleRecordTable::default(),
        &mut session_update,
    );
    assert!(store.update_sessions(session_update));
    assert!(store.get_session("IMSI001", "s1").is_none());

    // the final report carried the unreported usage
    let terminations = harness.reporter.terminate_requests.lock().unwrap().clone();
    assert_eq!(terminations.len(), 1);
    assert!(terminations[0]
        .credit_usages
        .iter()
        .any(|usage| usage.charging_key == 10 && usage.bytes_tx == 900));
}

#[test]
fn test_terminate_unknown_imsi_is_an_error() {
    let harness = Harness::new(SessionDConfig::default());
    let store = harness.enforcer.session_store();
    let mut session_map = store.read_all_sessions();
    let mut session_update = default_session_update(&session_map);
    let result = harness.enforcer.terminate_session(
        &mut session_map,
        "IMSI404",
        "magma.ipv4",
        &mut session_update,
        NOW,
    );
    assert!(result.is_err());
}

#[test]
fn test_reauth_all_keys() {
    let harness = Harness::new(SessionDConfig::default());
    init_session_with_rule(&harness, "IMSI001", "s1");

    let request = ChargingReAuthRequest {
        sid: "IMSI001".to_string(),
        session_id: "s1".to_string(),
        reauth_type: ChargingReAuthType::EntireSession,
        charging_key: 0,
        service_identifier: None,
    };
    let store = harness.enforcer.session_store();
    let mut session_map = store.read_all_sessions();
    let mut session_update = default_session_update(&session_map);
    let result =
        harness
            .enforcer
            .init_charging_reauth(&mut session_map, &request, &mut session_update);
    assert_eq!(result, ReAuthResult::UpdateInitiated);

    let mut actions = Vec::new();
    let update_request =
        harness
            .enforcer
            .collect_updates(&mut session_map, &mut actions, &mut session_update, NOW);
    assert_eq!(update_request.updates.len(), 1);
    assert_eq!(
        update_request.updates[0].usage.update_type,
        CreditUsageType::ReauthRequired
    );
    assert!(store.update_sessions(session_update));
}

#[test]
fn test_setup_pushes_all_sessions() {
    let harness = Harness::new(SessionDConfig::default());
    init_session_with_rule(&harness, "IMSI001", "s1");
    init_session_with_rule(&harness, "IMSI002", "s2");

    let result = harness.enforcer.setup(42).unwrap();
    assert_eq!(result, cg_proto::SetupFlowsResult::Success);
    let setups = harness.data_plane.setup_calls.lock().unwrap().clone();
    assert_eq!(setups, vec![42]);

    let imsis: HashSet<String> = harness
        .enforcer
        .session_store()
        .read_all_sessions()
        .keys()
        .cloned()
        .collect();
    assert_eq!(imsis.len(), 2);
}
