//! Credit accounting primitive
//!
//! A `SessionCredit` is a bundle of direction-tagged byte counters tracking
//! how much a subscriber has used, been allowed, is currently reporting and
//! has already reported against one charging or monitoring key.
//!
//! Invariants: `reported <= used`; the reporting buckets are non-zero only
//! while a report is in flight; a successful grant folds reporting into
//! reported; `allowed` only grows through `receive_credit`.

use std::sync::atomic::{AtomicBool, Ordering};

use cg_proto::{CreditLimitType, GrantedUnits};
use serde::{Deserialize, Serialize};

use crate::stored::{SessionCreditUpdateCriteria, StoredSessionCredit};

/// Fraction of the current allowance at which a usage update is generated
pub const USAGE_REPORTING_THRESHOLD: f64 = 0.8;

/// Whether an exhausted TERMINATE final grant deactivates service.
/// Set from the daemon configuration at startup.
static TERMINATE_SERVICE_WHEN_QUOTA_EXHAUSTED: AtomicBool = AtomicBool::new(true);

/// Configure the terminate-on-exhaust behaviour
pub fn set_terminate_service_when_quota_exhausted(value: bool) {
    TERMINATE_SERVICE_WHEN_QUOTA_EXHAUSTED.store(value, Ordering::SeqCst);
}

/// Read the terminate-on-exhaust behaviour
pub fn terminate_service_when_quota_exhausted() -> bool {
    TERMINATE_SERVICE_WHEN_QUOTA_EXHAUSTED.load(Ordering::SeqCst)
}

// ============================================================================
// Buckets
// ============================================================================

/// A bucket is one independently tracked volume counter.
/// USED = REPORTED + REPORTING + (not yet reported).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(usize)]
pub enum Bucket {
    /// Bytes the UE actually used, transmit direction
    UsedTx = 0,
    /// Bytes the UE actually used, receive direction
    UsedRx = 1,
    /// Granted volume, undirected
    AllowedTotal = 2,
    /// Granted volume, transmit direction
    AllowedTx = 3,
    /// Granted volume, receive direction
    AllowedRx = 4,
    /// Volume in transit to the cloud, transmit direction
    ReportingTx = 5,
    /// Volume in transit to the cloud, receive direction
    ReportingRx = 6,
    /// Volume acknowledged by the cloud, transmit direction
    ReportedTx = 7,
    /// Volume acknowledged by the cloud, receive direction
    ReportedRx = 8,
    /// ALLOWED_TOTAL before the current grant was received
    AllowedFloorTotal = 9,
    /// ALLOWED_TX before the current grant was received
    AllowedFloorTx = 10,
    /// ALLOWED_RX before the current grant was received
    AllowedFloorRx = 11,
}

/// Number of buckets in a credit
pub const BUCKET_COUNT: usize = 12;

/// All buckets, in journal-merge order
pub const ALL_BUCKETS: [Bucket; BUCKET_COUNT] = [
    Bucket::UsedTx,
    Bucket::UsedRx,
    Bucket::AllowedTotal,
    Bucket::AllowedTx,
    Bucket::AllowedRx,
    Bucket::ReportingTx,
    Bucket::ReportingRx,
    Bucket::ReportedTx,
    Bucket::ReportedRx,
    Bucket::AllowedFloorTotal,
    Bucket::AllowedFloorTx,
    Bucket::AllowedFloorRx,
];

/// Which directions of a grant are metered against `allowed`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GrantTrackingType {
    /// No grant received yet
    TrackingUnset,
    /// Undirected total volume only
    TotalOnly,
    /// Transmit direction only
    TxOnly,
    /// Receive direction only
    RxOnly,
    /// Both directions, independently
    TxAndRx,
    /// Total plus per-direction volumes
    AllTotalTxRx,
}

impl Default for GrantTrackingType {
    fn default() -> Self {
        GrantTrackingType::TrackingUnset
    }
}

/// Usage delta in both directions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Usage {
    pub bytes_tx: u64,
    pub bytes_rx: u64,
}

// ============================================================================
// SessionCredit
// ============================================================================

/// Volume counters for one charging or monitoring key
#[derive(Debug, Clone, PartialEq)]
pub struct SessionCredit {
    buckets: [u64; BUCKET_COUNT],
    reporting: bool,
    credit_limit_type: CreditLimitType,
    grant_tracking_type: GrantTrackingType,
    received_granted_units: GrantedUnits,
}

impl Default for SessionCredit {
    fn default() -> Self {
        Self::new(CreditLimitType::Finite)
    }
}

impl SessionCredit {
    /// Fresh credit with no grant received
    pub fn new(credit_limit_type: CreditLimitType) -> Self {
        Self {
            buckets: [0; BUCKET_COUNT],
            reporting: false,
            credit_limit_type,
            grant_tracking_type: GrantTrackingType::TrackingUnset,
            received_granted_units: GrantedUnits::default(),
        }
    }

    /// Rebuild a credit from its stored form
    pub fn from_stored(stored: &StoredSessionCredit) -> Self {
        Self {
            buckets: stored.buckets,
            reporting: stored.reporting,
            credit_limit_type: stored.credit_limit_type,
            grant_tracking_type: stored.grant_tracking_type,
            received_granted_units: stored.received_granted_units,
        }
    }

    /// Stored form of the credit
    pub fn marshal(&self) -> StoredSessionCredit {
        StoredSessionCredit {
            buckets: self.buckets,
            reporting: self.reporting,
            credit_limit_type: self.credit_limit_type,
            grant_tracking_type: self.grant_tracking_type,
            received_granted_units: self.received_granted_units,
        }
    }

    /// Read a bucket value
    pub fn get_credit(&self, bucket: Bucket) -> u64 {
        self.buckets[bucket as usize]
    }

    /// True while a report is in flight for this key
    pub fn is_reporting(&self) -> bool {
        self.reporting
    }

    /// Tracking type of the current grant
    pub fn grant_tracking_type(&self) -> GrantTrackingType {
        self.grant_tracking_type
    }

    /// Credit limit type of the key
    pub fn credit_limit_type(&self) -> CreditLimitType {
        self.credit_limit_type
    }

    /// Add usage reported by the data plane
    pub fn add_used_credit(&mut self, used_tx: u64, used_rx: u64, uc: &mut SessionCreditUpdateCriteria) {
        self.buckets[Bucket::UsedTx as usize] += used_tx;
        self.buckets[Bucket::UsedRx as usize] += used_rx;
        uc.bucket_deltas[Bucket::UsedTx as usize] += used_tx;
        uc.bucket_deltas[Bucket::UsedRx as usize] += used_rx;
    }

    /// Receive a grant from the cloud. Folds any in-flight reporting into
    /// the reported buckets, snapshots the allowance floors, then adds the
    /// granted volumes. The only path that updates `allowed`.
    pub fn receive_credit(&mut self, gsu: &GrantedUnits, uc: &mut SessionCreditUpdateCriteria) {
        // ack the in-flight report
        let reporting_tx = self.buckets[Bucket::ReportingTx as usize];
        let reporting_rx = self.buckets[Bucket::ReportingRx as usize];
        self.buckets[Bucket::ReportedTx as usize] += reporting_tx;
        self.buckets[Bucket::ReportedRx as usize] += reporting_rx;
        uc.bucket_deltas[Bucket::ReportedTx as usize] += reporting_tx;
        uc.bucket_deltas[Bucket::ReportedRx as usize] += reporting_rx;
        self.buckets[Bucket::ReportingTx as usize] = 0;
        self.buckets[Bucket::ReportingRx as usize] = 0;
        self.reporting = false;
        uc.reporting = false;

        self.grant_tracking_type = determine_tracking_type(gsu);
        self.received_granted_units = *gsu;
        uc.grant_tracking_type = self.grant_tracking_type;
        uc.received_granted_units = *gsu;

        self.record_grant(
            gsu.total.is_valid,
            gsu.total.volume,
            Bucket::AllowedTotal,
            Bucket::AllowedFloorTotal,
            uc,
        );
        self.record_grant(
            gsu.tx.is_valid,
            gsu.tx.volume,
            Bucket::AllowedTx,
            Bucket::AllowedFloorTx,
            uc,
        );
        self.record_grant(
            gsu.rx.is_valid,
            gsu.rx.volume,
            Bucket::AllowedRx,
            Bucket::AllowedFloorRx,
            uc,
        );
    }

    fn record_grant(
        &mut self,
        is_valid: bool,
        volume: u64,
        allowed: Bucket,
        floor: Bucket,
        uc: &mut SessionCreditUpdateCriteria,
    ) {
        if !is_valid {
            return;
        }
        // the floor marks where the current grant starts
        let floor_delta = self.buckets[allowed as usize] - self.buckets[floor as usize];
        self.buckets[floor as usize] += floor_delta;
        uc.bucket_deltas[floor as usize] += floor_delta;

        self.buckets[allowed as usize] += volume;
        uc.bucket_deltas[allowed as usize] += volume;
    }

    /// Usage since the last report, moved into the reporting buckets
    pub fn get_usage_for_reporting(&mut self, uc: &mut SessionCreditUpdateCriteria) -> Usage {
        let tx = self.buckets[Bucket::UsedTx as usize]
            .saturating_sub(self.buckets[Bucket::ReportedTx as usize])
            .saturating_sub(self.buckets[Bucket::ReportingTx as usize]);
        let rx = self.buckets[Bucket::UsedRx as usize]
            .saturating_sub(self.buckets[Bucket::ReportedRx as usize])
            .saturating_sub(self.buckets[Bucket::ReportingRx as usize]);
        self.buckets[Bucket::ReportingTx as usize] += tx;
        self.buckets[Bucket::ReportingRx as usize] += rx;
        self.reporting = true;
        uc.reporting = true;
        Usage {
            bytes_tx: tx,
            bytes_rx: rx,
        }
    }

    /// All usage the cloud has not acknowledged, for a terminal report
    pub fn get_all_unreported_usage_for_reporting(
        &mut self,
        uc: &mut SessionCreditUpdateCriteria,
    ) -> Usage {
        let tx = self.buckets[Bucket::UsedTx as usize]
            .saturating_sub(self.buckets[Bucket::ReportedTx as usize]);
        let rx = self.buckets[Bucket::UsedRx as usize]
            .saturating_sub(self.buckets[Bucket::ReportedRx as usize]);
        self.buckets[Bucket::ReportingTx as usize] = tx;
        self.buckets[Bucket::ReportingRx as usize] = rx;
        self.reporting = true;
        uc.reporting = true;
        Usage {
            bytes_tx: tx,
            bytes_rx: rx,
        }
    }

    /// Drop the in-flight reporting volumes so the next cycle retries them
    pub fn reset_reporting_credit(&mut self, uc: &mut SessionCreditUpdateCriteria) {
        self.buckets[Bucket::ReportingTx as usize] = 0;
        self.buckets[Bucket::ReportingRx as usize] = 0;
        self.reporting = false;
        uc.reporting = false;
    }

    /// A per-key negative acknowledgement from the cloud
    pub fn mark_failure(&mut self, result_code: u32, uc: &mut SessionCreditUpdateCriteria) {
        log::warn!("Credit update failed with result code {result_code}, dropping in-flight report");
        self.reset_reporting_credit(uc);
    }

    /// Quota-exhaustion predicate: usage has reached `threshold` of the
    /// allowance under the active tracking type.
    pub fn is_quota_exhausted(&self, threshold: f64) -> bool {
        let used_tx = self.buckets[Bucket::UsedTx as usize];
        let used_rx = self.buckets[Bucket::UsedRx as usize];
        let exhausted = |used: u64, allowed: Bucket| -> bool {
            used as f64 >= threshold * self.buckets[allowed as usize] as f64
        };
        match self.grant_tracking_type {
            GrantTrackingType::TrackingUnset => false,
            GrantTrackingType::TotalOnly => exhausted(used_tx + used_rx, Bucket::AllowedTotal),
            GrantTrackingType::TxOnly => exhausted(used_tx, Bucket::AllowedTx),
            GrantTrackingType::RxOnly => exhausted(used_rx, Bucket::AllowedRx),
            GrantTrackingType::TxAndRx => {
                exhausted(used_tx, Bucket::AllowedTx) || exhausted(used_rx, Bucket::AllowedRx)
            }
            GrantTrackingType::AllTotalTxRx => {
                exhausted(used_tx + used_rx, Bucket::AllowedTotal)
                    || exhausted(used_tx, Bucket::AllowedTx)
                    || exhausted(used_rx, Bucket::AllowedRx)
            }
        }
    }

    /// True when the most recent grant carried no volume in any valid
    /// dimension (a zero top-up), or no grant was ever received.
    pub fn current_grant_contains_zero(&self) -> bool {
        let gsu = &self.received_granted_units;
        if !gsu.total.is_valid && !gsu.tx.is_valid && !gsu.rx.is_valid {
            return true;
        }
        (!gsu.total.is_valid || gsu.total.volume == 0)
            && (!gsu.tx.is_valid || gsu.tx.volume == 0)
            && (!gsu.rx.is_valid || gsu.rx.volume == 0)
    }

    /// Snapshot the credit-side fields of a fresh journal entry
    pub fn get_update_criteria(&self) -> SessionCreditUpdateCriteria {
        SessionCreditUpdateCriteria {
            reporting: self.reporting,
            grant_tracking_type: self.grant_tracking_type,
            received_granted_units: self.received_granted_units,
            ..Default::default()
        }
    }

    // Journal-merge primitives, used when replaying a journal onto a
    // stored session instance.

    /// Add a merge delta to a bucket
    pub fn add_credit(&mut self, delta: u64, bucket: Bucket) {
        self.buckets[bucket as usize] += delta;
    }

    /// Overwrite the tracking type during a merge
    pub fn set_grant_tracking_type(&mut self, tracking: GrantTrackingType) {
        self.grant_tracking_type = tracking;
    }

    /// Overwrite the received grant during a merge
    pub fn set_received_granted_units(&mut self, gsu: GrantedUnits) {
        self.received_granted_units = gsu;
    }

    /// Overwrite the reporting flag during a merge
    pub fn set_reporting(&mut self, reporting: bool) {
        self.reporting = reporting;
    }
}

fn determine_tracking_type(gsu: &GrantedUnits) -> GrantTrackingType {
    match (gsu.total.is_valid, gsu.tx.is_valid, gsu.rx.is_valid) {
        (true, false, false) => GrantTrackingType::TotalOnly,
        (true, _, _) => GrantTrackingType::AllTotalTxRx,
        (false, true, true) => GrantTrackingType::TxAndRx,
        (false, true, false) => GrantTrackingType::TxOnly,
        (false, false, true) => GrantTrackingType::RxOnly,
        (false, false, false) => {
            log::error!("Received a grant with no valid units, tracking left unset");
            GrantTrackingType::TrackingUnset
        }
    }
}
