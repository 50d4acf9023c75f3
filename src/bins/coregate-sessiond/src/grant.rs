//! Charging grant
//!
//! Wraps a `SessionCredit` with the final-unit metadata, reauth state and
//! service state of one charging key, and derives the next service action
//! the data plane must take for it.

use cg_proto::{
    ChargingCredit, CreditKey, CreditLimitType, CreditUsage, CreditUsageType, FinalAction,
    RedirectServer,
};
use serde::{Deserialize, Serialize};

use crate::actions::ServiceActionType;
use crate::credit::{self, SessionCredit, USAGE_REPORTING_THRESHOLD};
use crate::stored::{SessionCreditUpdateCriteria, StoredChargingGrant};

/// Reauth progress for one charging key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReAuthState {
    NotNeeded,
    Required,
    Processing,
}

impl Default for ReAuthState {
    fn default() -> Self {
        ReAuthState::NotNeeded
    }
}

/// Data-plane service state for one charging key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServiceState {
    Enabled,
    NeedsDeactivation,
    Disabled,
    NeedsActivation,
    Redirected,
    Restricted,
}

impl Default for ServiceState {
    fn default() -> Self {
        ServiceState::Enabled
    }
}

/// Action metadata carried with a final grant
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct FinalActionInfo {
    pub final_action: FinalAction,
    pub redirect_server: Option<RedirectServer>,
    pub restrict_rules: Vec<String>,
}

/// Expiry sentinel for grants without a validity bound
pub const NO_EXPIRY: u64 = u64::MAX;

/// A charging allowance for one key, with its enforcement state
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ChargingGrant {
    pub credit: SessionCredit,
    pub is_final: bool,
    pub final_action_info: FinalActionInfo,
    pub reauth_state: ReAuthState,
    pub service_state: ServiceState,
    /// Epoch seconds after which the grant must be refreshed
    pub expiry_time: u64,
}

impl ChargingGrant {
    /// Grant for a key that just received its first response
    pub fn new(limit_type: CreditLimitType) -> Self {
        Self {
            credit: SessionCredit::new(limit_type),
            expiry_time: NO_EXPIRY,
            ..Default::default()
        }
    }

    /// Rebuild a grant from its stored form
    pub fn from_stored(stored: &StoredChargingGrant) -> Self {
        Self {
            credit: SessionCredit::from_stored(&stored.credit),
            is_final: stored.is_final,
            final_action_info: stored.final_action_info.clone(),
            reauth_state: stored.reauth_state,
            service_state: stored.service_state,
            expiry_time: stored.expiry_time,
        }
    }

    /// Stored form of the grant
    pub fn marshal(&self) -> StoredChargingGrant {
        StoredChargingGrant {
            credit: self.credit.marshal(),
            is_final: self.is_final,
            final_action_info: self.final_action_info.clone(),
            reauth_state: self.reauth_state,
            service_state: self.service_state,
            expiry_time: self.expiry_time,
        }
    }

    /// Apply a successful charging response: volumes, final-unit metadata
    /// and the validity window.
    pub fn receive_charging_grant(
        &mut self,
        p_credit: &ChargingCredit,
        now: u64,
        uc: &mut SessionCreditUpdateCriteria,
    ) {
        self.credit.receive_credit(&p_credit.granted_units, uc);

        self.is_final = p_credit.is_final;
        if self.is_final {
            self.final_action_info.final_action = p_credit.final_action;
            match p_credit.final_action {
                FinalAction::Redirect => {
                    self.final_action_info.redirect_server = p_credit.redirect_server.clone();
                }
                FinalAction::RestrictAccess => {
                    self.final_action_info.restrict_rules = p_credit.restrict_rules.clone();
                }
                FinalAction::Terminate => {}
            }
            log::info!(
                "Received a final grant, action {:?}",
                self.final_action_info.final_action
            );
        }

        self.expiry_time = if p_credit.validity_time == 0 {
            NO_EXPIRY
        } else {
            now + p_credit.validity_time
        };

        uc.is_final = self.is_final;
        uc.final_action_info = self.final_action_info.clone();
        uc.expiry_time = self.expiry_time;
    }

    /// Snapshot of the grant for a fresh journal entry
    pub fn get_update_criteria(&self) -> SessionCreditUpdateCriteria {
        let mut uc = self.credit.get_update_criteria();
        uc.is_final = self.is_final;
        uc.final_action_info = self.final_action_info.clone();
        uc.expiry_time = self.expiry_time;
        uc.reauth_state = self.reauth_state;
        uc.service_state = self.service_state;
        uc
    }

    /// Why a usage update should be sent for this key, if at all
    pub fn get_update_type(&self, now: u64) -> Option<CreditUsageType> {
        if self.credit.is_reporting() {
            // an update for this key is already in flight
            return None;
        }
        if self.reauth_state == ReAuthState::Required {
            return Some(CreditUsageType::ReauthRequired);
        }
        if self.is_final && self.credit.is_quota_exhausted(1.0) {
            // no refill is coming for an exhausted final grant
            return None;
        }
        if self.credit.is_quota_exhausted(USAGE_REPORTING_THRESHOLD) {
            return Some(CreditUsageType::QuotaExhausted);
        }
        if now >= self.expiry_time {
            return Some(CreditUsageType::ValidityTimerExpired);
        }
        None
    }

    /// Build the usage report for this key
    pub fn get_credit_usage(
        &mut self,
        key: &CreditKey,
        update_type: CreditUsageType,
        uc: &mut SessionCreditUpdateCriteria,
        is_terminate: bool,
    ) -> CreditUsage {
        let usage = if self.is_final || is_terminate {
            self.credit.get_all_unreported_usage_for_reporting(uc)
        } else {
            self.credit.get_usage_for_reporting(uc)
        };
        CreditUsage {
            charging_key: key.rating_group,
            service_identifier: key.service_identifier,
            bytes_tx: usage.bytes_tx,
            bytes_rx: usage.bytes_rx,
            update_type,
        }
    }

    /// True when the exhausted final grant requires taking the service down
    pub fn should_deactivate_service(&self) -> bool {
        if self.final_action_info.final_action == FinalAction::Terminate
            && !credit::terminate_service_when_quota_exhausted()
        {
            return false;
        }
        if self.service_state != ServiceState::Enabled {
            return false;
        }
        if self.is_final && self.credit.is_quota_exhausted(1.0) {
            log::info!(
                "Deactivating service on exhausted final grant, action {:?}",
                self.final_action_info.final_action
            );
            return true;
        }
        false
    }

    /// Derive the next service action for this key. Each action is
    /// handled independently by the caller; no action implies another.
    pub fn get_action(&mut self, uc: &mut SessionCreditUpdateCriteria) -> ServiceActionType {
        match self.service_state {
            ServiceState::NeedsDeactivation => {
                self.set_service_state(ServiceState::Disabled, uc);
                if !self.is_final {
                    return ServiceActionType::TerminateService;
                }
                final_action_to_action(self.final_action_info.final_action)
            }
            ServiceState::NeedsActivation => {
                self.set_service_state(ServiceState::Enabled, uc);
                ServiceActionType::ActivateService
            }
            _ => ServiceActionType::ContinueService,
        }
    }

    /// Update the reauth state and journal it
    pub fn set_reauth_state(&mut self, new_state: ReAuthState, uc: &mut SessionCreditUpdateCriteria) {
        if self.reauth_state != new_state {
            log::debug!(
                "ReAuth state change from {:?} to {:?}",
                self.reauth_state,
                new_state
            );
        }
        self.reauth_state = new_state;
        uc.reauth_state = new_state;
    }

    /// Update the service state and journal it
    pub fn set_service_state(
        &mut self,
        new_state: ServiceState,
        uc: &mut SessionCreditUpdateCriteria,
    ) {
        if self.service_state != new_state {
            log::debug!(
                "Service state change from {:?} to {:?}",
                self.service_state,
                new_state
            );
        }
        self.service_state = new_state;
        uc.service_state = new_state;
    }
}

fn final_action_to_action(action: FinalAction) -> ServiceActionType {
    match action {
        FinalAction::Redirect => ServiceActionType::Redirect,
        FinalAction::RestrictAccess => ServiceActionType::RestrictAccess,
        FinalAction::Terminate => ServiceActionType::TerminateService,
    }
}
