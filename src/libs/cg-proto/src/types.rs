//! Subscriber and session context types
//!
//! The per-session configuration carried by the enforcement engine: the
//! common subscriber context plus the RAT-specific (LTE or WLAN) context,
//! and the small identifier types shared across the protocol surface.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Charging key: a billing bucket identified by rating group and an
/// optional service identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CreditKey {
    /// Rating group
    pub rating_group: u32,
    /// Service identifier, if the key is service-scoped
    pub service_identifier: Option<u32>,
}

impl CreditKey {
    /// Create a key scoped to a rating group only
    pub fn new(rating_group: u32) -> Self {
        Self {
            rating_group,
            service_identifier: None,
        }
    }

    /// Create a key scoped to rating group + service identifier
    pub fn with_service_identifier(rating_group: u32, service_identifier: u32) -> Self {
        Self {
            rating_group,
            service_identifier: Some(service_identifier),
        }
    }
}

impl fmt::Display for CreditKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.service_identifier {
            Some(si) => write!(f, "rg={}/si={}", self.rating_group, si),
            None => write!(f, "rg={}", self.rating_group),
        }
    }
}

/// Radio access technology of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RatType {
    /// 3GPP LTE access
    Lte,
    /// Trusted/untrusted WLAN access (carrier WiFi)
    Wlan,
}

/// Aggregated maximum bitrate for an APN
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct AggregatedMaximumBitrate {
    /// Uplink cap in bps
    pub max_bandwidth_ul: u64,
    /// Downlink cap in bps
    pub max_bandwidth_dl: u64,
}

/// QoS information attached to the default bearer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct QosInformation {
    /// QoS class identifier of the default bearer
    pub qos_class_id: u32,
    /// APN-AMBR, if provisioned
    pub ambr: Option<AggregatedMaximumBitrate>,
}

/// Context shared by all RAT types
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CommonSessionContext {
    /// Subscriber identity
    pub imsi: String,
    /// MSISDN of the subscriber
    pub msisdn: String,
    /// Access point name
    pub apn: String,
    /// Radio access technology
    pub rat_type: Option<RatType>,
    /// UE IPv4 address as a dotted string
    pub ue_ipv4: String,
}

/// LTE-specific session context
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct LteSessionContext {
    /// Default (link) bearer id
    pub bearer_id: u32,
    /// IMEI of the device
    pub imei: String,
    /// Serving PLMN id
    pub plmn_id: String,
    /// PLMN id derived from the IMSI
    pub imsi_plmn_id: String,
    /// SPGW IPv4 address
    pub spgw_ipv4: String,
    /// User location information blob
    pub user_location: String,
    /// Default-bearer QoS
    pub qos: Option<QosInformation>,
}

/// WLAN-specific session context
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct WlanSessionContext {
    /// UE MAC address
    pub mac_addr: String,
    /// RADIUS session id assigned by the AAA service
    pub radius_session_id: String,
}

/// RAT-specific half of the session configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RatSpecificContext {
    /// LTE access context
    Lte(LteSessionContext),
    /// WLAN access context
    Wlan(WlanSessionContext),
}

impl Default for RatSpecificContext {
    fn default() -> Self {
        RatSpecificContext::Lte(LteSessionContext::default())
    }
}

/// Full per-session configuration
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Context common to all RATs
    pub common_context: CommonSessionContext,
    /// RAT-specific context
    pub rat_specific_context: RatSpecificContext,
}

impl SessionConfig {
    /// APN-AMBR of the default bearer, when the session carries one
    pub fn apn_ambr(&self) -> Option<AggregatedMaximumBitrate> {
        match &self.rat_specific_context {
            RatSpecificContext::Lte(lte) => lte.qos.and_then(|q| q.ambr),
            RatSpecificContext::Wlan(_) => None,
        }
    }

    /// LTE context accessor
    pub fn lte_context(&self) -> Option<&LteSessionContext> {
        match &self.rat_specific_context {
            RatSpecificContext::Lte(lte) => Some(lte),
            RatSpecificContext::Wlan(_) => None,
        }
    }

    /// WLAN context accessor
    pub fn wlan_context(&self) -> Option<&WlanSessionContext> {
        match &self.rat_specific_context {
            RatSpecificContext::Lte(_) => None,
            RatSpecificContext::Wlan(wlan) => Some(wlan),
        }
    }

    /// True if the session attached over carrier WiFi
    pub fn is_wlan(&self) -> bool {
        matches!(self.rat_specific_context, RatSpecificContext::Wlan(_))
    }
}

/// Subscriber wallet state propagated to the data plane (WLAN only)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SubscriberQuotaState {
    /// Subscriber has monitoring quota
    ValidQuota,
    /// Subscriber has no monitoring quota
    NoQuota,
    /// Subscriber should be cut off
    Terminate,
}

impl Default for SubscriberQuotaState {
    fn default() -> Self {
        SubscriberQuotaState::ValidQuota
    }
}

/// Policy event triggers the cloud can arm on a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventTrigger {
    /// Re-validate the session's policy at a given time
    RevalidationTimeout,
    /// Usage report requested
    UsageReport,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_credit_key_display() {
        assert_eq!(CreditKey::new(10).to_string(), "rg=10");
        assert_eq!(
            CreditKey::with_service_identifier(10, 3).to_string(),
            "rg=10/si=3"
        );
    }

    #[test]
    fn test_credit_key_eq() {
        assert_eq!(CreditKey::new(7), CreditKey::new(7));
        assert_ne!(CreditKey::new(7), CreditKey::with_service_identifier(7, 1));
    }

    #[test]
    fn test_apn_ambr_lte_only() {
        let mut config = SessionConfig::default();
        assert!(config.apn_ambr().is_none());

        config.rat_specific_context = RatSpecificContext::Lte(LteSessionContext {
            qos: Some(QosInformation {
                qos_class_id: 9,
                ambr: Some(AggregatedMaximumBitrate {
                    max_bandwidth_ul: 1_000_000,
                    max_bandwidth_dl: 10_000_000,
                }),
            }),
            ..Default::default()
        });
        let ambr = config.apn_ambr().unwrap();
        assert_eq!(ambr.max_bandwidth_dl, 10_000_000);

        config.rat_specific_context = RatSpecificContext::Wlan(WlanSessionContext::default());
        assert!(config.apn_ambr().is_none());
        assert!(config.is_wlan());
    }
}
