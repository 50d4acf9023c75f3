//! Usage monitor
//!
//! Wraps a `SessionCredit` with the monitoring level of one monitoring
//! key. A monitor is deleted once the cloud stops topping it up and the
//! remaining quota is fully consumed.

use cg_proto::MonitoringLevel;

use crate::credit::SessionCredit;
use crate::stored::StoredMonitor;

/// Usage-monitoring bucket for one monitoring key
#[derive(Debug, Clone, PartialEq)]
pub struct Monitor {
    pub credit: SessionCredit,
    pub level: MonitoringLevel,
}

impl Monitor {
    /// Fresh monitor at the given level
    pub fn new(level: MonitoringLevel) -> Self {
        Self {
            credit: SessionCredit::default(),
            level,
        }
    }

    /// Rebuild a monitor from its stored form
    pub fn from_stored(stored: &StoredMonitor) -> Self {
        Self {
            credit: SessionCredit::from_stored(&stored.credit),
            level: stored.level,
        }
    }

    /// Stored form of the monitor
    pub fn marshal(&self) -> StoredMonitor {
        StoredMonitor {
            credit: self.credit.marshal(),
            level: self.level,
        }
    }

    /// True when the monitor received a zero top-up and all of its quota
    /// has been consumed
    pub fn should_delete(&self) -> bool {
        self.credit.current_grant_contains_zero() && self.credit.is_quota_exhausted(1.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cg_proto::GrantedUnits;
    use crate::stored::SessionCreditUpdateCriteria;

    #[test]
    fn test_should_delete_on_exhausted_zero_grant() {
        let mut monitor = Monitor::new(MonitoringLevel::RuleLevel);
        let mut uc = SessionCreditUpdateCriteria::default();

        monitor.credit.receive_credit(&GrantedUnits::total_only(100), &mut uc);
        assert!(!monitor.should_delete());

        monitor.credit.add_used_credit(100, 0, &mut uc);
        // exhausted, but the last grant was non-zero
        assert!(!monitor.should_delete());

        monitor.credit.receive_credit(&GrantedUnits::total_only(0), &mut uc);
        assert!(monitor.should_delete());
    }

    #[test]
    fn test_fresh_monitor_not_deleted() {
        let monitor = Monitor::new(MonitoringLevel::SessionLevel);
        // no grant yet: tracking unset, quota not exhausted
        assert!(!monitor.should_delete());
    }

    #[test]
    fn test_marshal_round_trip() {
        let mut monitor = Monitor::new(MonitoringLevel::SessionLevel);
        let mut uc = SessionCreditUpdateCriteria::default();
        monitor.credit.receive_credit(&GrantedUnits::total_only(512), &mut uc);
        monitor.credit.add_used_credit(10, 20, &mut uc);

        let restored = Monitor::from_stored(&monitor.marshal());
        assert_eq!(monitor, restored);
    }
}
