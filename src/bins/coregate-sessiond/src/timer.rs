//! Session timers
//!
//! A polled timer manager for the enforcement loop: one-shot timers with
//! typed ids, per-session context and cancellable handles. The loop
//! sleeps no longer than the next expiration and dispatches whatever
//! `process_expired` returns.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;
use std::time::{Duration, Instant};

use crate::stored::PolicyType;

/// Timers the enforcer arms
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionTimerId {
    /// A scheduled rule's activation time arrived
    RuleActivation,
    /// A scheduled rule's deactivation time arrived
    RuleDeactivation,
    /// Session did not drain in time, force the termination
    ForceTermination,
    /// Policy revalidation time arrived
    Revalidation,
    /// WLAN session created without monitoring quota
    QuotaExhaustionInit,
}

impl SessionTimerId {
    pub fn name(&self) -> &'static str {
        match self {
            Self::RuleActivation => "SESSIOND_TIMER_RULE_ACTIVATION",
            Self::RuleDeactivation => "SESSIOND_TIMER_RULE_DEACTIVATION",
            Self::ForceTermination => "SESSIOND_TIMER_FORCE_TERMINATION",
            Self::Revalidation => "SESSIOND_TIMER_REVALIDATION",
            Self::QuotaExhaustionInit => "SESSIOND_TIMER_QUOTA_EXHAUSTION_INIT",
        }
    }
}

/// What a timer refers to when it fires
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TimerContext {
    pub imsi: String,
    pub session_id: String,
    pub rule_id: Option<String>,
    pub policy_type: Option<PolicyType>,
}

impl TimerContext {
    pub fn for_session(imsi: &str, session_id: &str) -> Self {
        Self {
            imsi: imsi.to_string(),
            session_id: session_id.to_string(),
            ..Default::default()
        }
    }

    pub fn for_rule(imsi: &str, rule_id: &str, policy_type: PolicyType) -> Self {
        Self {
            imsi: imsi.to_string(),
            rule_id: Some(rule_id.to_string()),
            policy_type: Some(policy_type),
            ..Default::default()
        }
    }
}

/// One armed timer
#[derive(Debug, Clone)]
pub struct TimerEntry {
    pub id: u64,
    pub timer_id: SessionTimerId,
    pub fires_at: Instant,
    pub ctx: TimerContext,
    active: bool,
}

/// One-shot timer manager polled from the enforcement loop
#[derive(Debug, Default)]
pub struct TimerMgr {
    timers: RwLock<HashMap<u64, TimerEntry>>,
    next_id: AtomicU64,
}

impl TimerMgr {
    pub fn new() -> Self {
        Self {
            timers: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Arm a one-shot timer, returning its cancellable handle
    pub fn schedule_in(&self, timer_id: SessionTimerId, delay: Duration, ctx: TimerContext) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let entry = TimerEntry {
            id,
            timer_id,
            fires_at: Instant::now() + delay,
            ctx,
            active: true,
        };
        if let Ok(mut timers) = self.timers.write() {
            timers.insert(id, entry);
        }
        log::debug!("Timer {} armed, id={id}, delay={delay:?}", timer_id.name());
        id
    }

    /// Cancel a timer; true when it was still armed
    pub fn cancel(&self, id: u64) -> bool {
        if let Ok(mut timers) = self.timers.write() {
            if let Some(entry) = timers.get_mut(&id) {
                entry.active = false;
                log::debug!("Timer {} cancelled, id={id}", entry.timer_id.name());
                return true;
            }
        }
        false
    }

    /// Cancel every timer referring to a session
    pub fn cancel_for_session(&self, imsi: &str, session_id: &str) -> usize {
        let mut cancelled = 0;
        if let Ok(mut timers) = self.timers.write() {
            for entry in timers.values_mut() {
                if entry.active && entry.ctx.imsi == imsi && entry.ctx.session_id == session_id {
                    entry.active = false;
                    cancelled += 1;
                }
            }
        }
        cancelled
    }

    /// Remove and return every expired timer; cancelled entries are
    /// dropped silently
    pub fn process_expired(&self) -> Vec<TimerEntry> {
        let now = Instant::now();
        let mut expired = Vec::new();
        if let Ok(mut timers) = self.timers.write() {
            let fired: Vec<u64> = timers
                .values()
                .filter(|entry| now >= entry.fires_at)
                .map(|entry| entry.id)
                .collect();
            for id in fired {
                if let Some(entry) = timers.remove(&id) {
                    if entry.active {
                        expired.push(entry);
                    }
                }
            }
        }
        expired.sort_by_key(|entry| entry.fires_at);
        expired
    }

    /// Delay until the next armed timer fires
    pub fn next_expiration(&self) -> Option<Duration> {
        let now = Instant::now();
        self.timers.read().ok().and_then(|timers| {
            timers
                .values()
                .filter(|entry| entry.active)
                .map(|entry| entry.fires_at.saturating_duration_since(now))
                .min()
        })
    }

    pub fn active_count(&self) -> usize {
        self.timers
            .read()
            .map(|timers| timers.values().filter(|entry| entry.active).count())
            .unwrap_or(0)
    }
}

/// Delay from `now` until an absolute epoch second; zero when past
pub fn duration_until(epoch_secs: u64, now: u64) -> Duration {
    Duration::from_secs(epoch_secs.saturating_sub(now))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_schedule_and_expire() {
        let mgr = TimerMgr::new();
        mgr.schedule_in(
            SessionTimerId::ForceTermination,
            Duration::from_millis(10),
            TimerContext::for_session("IMSI001", "s1"),
        );
        assert_eq!(mgr.active_count(), 1);
        assert!(mgr.process_expired().is_empty());

        thread::sleep(Duration::from_millis(20));
        let expired = mgr.process_expired();
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].timer_id, SessionTimerId::ForceTermination);
        assert_eq!(expired[0].ctx.imsi, "IMSI001");
        assert_eq!(mgr.active_count(), 0);
    }

    #[test]
    fn test_cancel_suppresses_fire() {
        let mgr = TimerMgr::new();
        let id = mgr.schedule_in(
            SessionTimerId::RuleDeactivation,
            Duration::from_millis(10),
            TimerContext::for_rule("IMSI001", "r1", PolicyType::Static),
        );
        assert!(mgr.cancel(id));
        thread::sleep(Duration::from_millis(20));
        assert!(mgr.process_expired().is_empty());
    }

    #[test]
    fn test_cancel_for_session() {
        let mgr = TimerMgr::new();
        mgr.schedule_in(
            SessionTimerId::ForceTermination,
            Duration::from_secs(100),
            TimerContext::for_session("IMSI001", "s1"),
        );
        mgr.schedule_in(
            SessionTimerId::Revalidation,
            Duration::from_secs(100),
            TimerContext::for_session("IMSI001", "s1"),
        );
        mgr.schedule_in(
            SessionTimerId::ForceTermination,
            Duration::from_secs(100),
            TimerContext::for_session("IMSI002", "s2"),
        );
        assert_eq!(mgr.cancel_for_session("IMSI001", "s1"), 2);
        assert_eq!(mgr.active_count(), 1);
    }

    #[test]
    fn test_next_expiration_picks_minimum() {
        let mgr = TimerMgr::new();
        assert!(mgr.next_expiration().is_none());
        mgr.schedule_in(
            SessionTimerId::RuleActivation,
            Duration::from_secs(100),
            TimerContext::default(),
        );
        mgr.schedule_in(
            SessionTimerId::RuleActivation,
            Duration::from_secs(2),
            TimerContext::default(),
        );
        let next = mgr.next_expiration().unwrap();
        assert!(next <= Duration::from_secs(2));
    }

    #[test]
    fn test_duration_until() {
        assert_eq!(duration_until(110, 100), Duration::from_secs(10));
        assert_eq!(duration_until(90, 100), Duration::ZERO);
    }
}
