//! Policy rule model
//!
//! A policy rule describes a set of flows together with the charging,
//! monitoring and QoS treatment they receive in the data plane. Static
//! rules live in the central rule registry and are referenced by id;
//! dynamic rules are pushed into a session by the policy cloud.

use serde::{Deserialize, Serialize};

use crate::types::CreditKey;

/// Which accounting backends track a rule's traffic
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TrackingType {
    /// Charging only (rating group)
    OnlyOcs,
    /// Monitoring only (monitoring key)
    OnlyPcrf,
    /// Both charging and monitoring
    OcsAndPcrf,
    /// No usage tracking
    NoTracking,
}

impl Default for TrackingType {
    fn default() -> Self {
        TrackingType::NoTracking
    }
}

/// Direction a flow match applies to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FlowDirection {
    /// UE to network
    Uplink,
    /// Network to UE
    Downlink,
}

/// Permit or deny matched traffic
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FlowAction {
    /// Allow matched packets
    Permit,
    /// Drop matched packets
    Deny,
}

/// A single flow match descriptor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowDescription {
    /// Match direction
    pub direction: FlowDirection,
    /// Permit / deny
    pub action: FlowAction,
    /// IP filter expression, e.g. "ip from any to any"
    pub match_expr: String,
}

/// Per-rule QoS parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct FlowQos {
    /// QoS class identifier
    pub qci: u32,
    /// Maximum requested uplink bandwidth in bps
    pub max_req_bw_ul: u64,
    /// Maximum requested downlink bandwidth in bps
    pub max_req_bw_dl: u64,
}

/// Address form of a redirect target
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RedirectAddressType {
    Ipv4,
    Ipv6,
    Url,
    SipUri,
}

/// Redirect target handed down with a final-unit grant
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RedirectServer {
    /// Address form of `server_address`
    pub address_type: RedirectAddressType,
    /// Where to send redirected traffic
    pub server_address: String,
}

impl Default for RedirectServer {
    fn default() -> Self {
        Self {
            address_type: RedirectAddressType::Ipv4,
            server_address: String::new(),
        }
    }
}

/// Redirect treatment carried inside a policy rule
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RedirectInformation {
    /// Whether redirection is enabled for this rule
    pub enabled: bool,
    /// Address form of `server_address`
    pub address_type: RedirectAddressType,
    /// Redirect target
    pub server_address: String,
}

/// A policy and charging control rule
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyRule {
    /// Rule identifier, unique within the gateway
    pub id: String,
    /// Enforcement priority in the data plane
    pub priority: u32,
    /// Rating group for charging, meaningful per `tracking_type`
    pub rating_group: u32,
    /// Optional service identifier refining the charging key
    pub service_identifier: Option<u32>,
    /// Monitoring key, when the rule is monitored
    pub monitoring_key: Option<String>,
    /// Which backends meter this rule
    pub tracking_type: TrackingType,
    /// Per-rule QoS; rules carrying a QCI differing from the default
    /// bearer get a dedicated bearer
    pub qos: Option<FlowQos>,
    /// Flow match descriptors
    pub flow_list: Vec<FlowDescription>,
    /// Redirect treatment, for synthesised redirect rules
    pub redirect: Option<RedirectInformation>,
}

impl PolicyRule {
    /// Minimal rule with an id and priority
    pub fn new(id: &str, priority: u32) -> Self {
        Self {
            id: id.to_string(),
            priority,
            rating_group: 0,
            service_identifier: None,
            monitoring_key: None,
            tracking_type: TrackingType::NoTracking,
            qos: None,
            flow_list: Vec::new(),
            redirect: None,
        }
    }

    /// Charging key of the rule, if it is charging-tracked
    pub fn charging_key(&self) -> Option<CreditKey> {
        match self.tracking_type {
            TrackingType::OnlyOcs | TrackingType::OcsAndPcrf => Some(CreditKey {
                rating_group: self.rating_group,
                service_identifier: self.service_identifier,
            }),
            _ => None,
        }
    }

    /// Monitoring key of the rule, if it is monitor-tracked
    pub fn monitoring_key(&self) -> Option<&str> {
        match self.tracking_type {
            TrackingType::OnlyPcrf | TrackingType::OcsAndPcrf => {
                self.monitoring_key.as_deref().filter(|k| !k.is_empty())
            }
            _ => None,
        }
    }

    /// True if the rule carries a QoS field
    pub fn has_qos(&self) -> bool {
        self.qos.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn charged_rule(id: &str, rg: u32) -> PolicyRule {
        let mut rule = PolicyRule::new(id, 10);
        rule.rating_group = rg;
        rule.tracking_type = TrackingType::OnlyOcs;
        rule
    }

    #[test]
    fn test_charging_key_by_tracking_type() {
        let rule = charged_rule("r1", 5);
        assert_eq!(rule.charging_key(), Some(CreditKey::new(5)));

        let mut untracked = PolicyRule::new("r2", 10);
        untracked.rating_group = 5;
        assert!(untracked.charging_key().is_none());
    }

    #[test]
    fn test_monitoring_key_requires_pcrf_tracking() {
        let mut rule = PolicyRule::new("r1", 10);
        rule.monitoring_key = Some("m1".to_string());
        assert!(rule.monitoring_key().is_none());

        rule.tracking_type = TrackingType::OnlyPcrf;
        assert_eq!(rule.monitoring_key(), Some("m1"));

        rule.monitoring_key = Some(String::new());
        assert!(rule.monitoring_key().is_none());
    }

    #[test]
    fn test_has_qos() {
        let mut rule = PolicyRule::new("r1", 10);
        assert!(!rule.has_qos());
        rule.qos = Some(FlowQos {
            qci: 5,
            max_req_bw_ul: 0,
            max_req_bw_dl: 0,
        });
        assert!(rule.has_qos());
    }
}
