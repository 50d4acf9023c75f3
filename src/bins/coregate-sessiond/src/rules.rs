//! Rule stores
//!
//! A `PolicyRuleBiMap` indexes policy rules by id and, in reverse, by
//! charging and monitoring key. Sessions hold separate instances for
//! active, scheduled and gy-dynamic rules; the shared static registry is
//! wrapped in `StaticRuleStore` and hot-reloaded atomically.

use std::collections::{HashMap, HashSet};
use std::sync::RwLock;

use cg_proto::{CreditKey, PolicyRule};
use serde::{Deserialize, Serialize};

// ============================================================================
// Rule lifetime
// ============================================================================

/// Activation window of a rule, epoch seconds; 0 means unbounded
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RuleLifetime {
    pub activation_time: u64,
    pub deactivation_time: u64,
}

impl RuleLifetime {
    /// Immediate activation, no deactivation
    pub fn unbounded() -> Self {
        Self::default()
    }

    /// A rule is active at `t` once past its activation time and before
    /// its deactivation time
    pub fn should_be_active(&self, t: u64) -> bool {
        let deactivated = self.deactivation_time > 0 && self.deactivation_time < t;
        self.activation_time < t && !deactivated
    }

    /// A rule is past its window at `t`
    pub fn should_be_deactivated(&self, t: u64) -> bool {
        self.deactivation_time > 0 && self.deactivation_time < t
    }
}

// ============================================================================
// Bi-directional rule map
// ============================================================================

/// Rules indexed by id with reverse charging/monitoring-key indexes,
/// rebuilt on every insert and remove
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PolicyRuleBiMap {
    rules: HashMap<String, PolicyRule>,
    by_charging_key: HashMap<CreditKey, HashSet<String>>,
    by_monitoring_key: HashMap<String, HashSet<String>>,
}

impl PolicyRuleBiMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a rule
    pub fn insert_rule(&mut self, rule: PolicyRule) {
        self.remove_rule(&rule.id);
        if let Some(key) = rule.charging_key() {
            self.by_charging_key
                .entry(key)
                .or_default()
                .insert(rule.id.clone());
        }
        if let Some(mkey) = rule.monitoring_key() {
            self.by_monitoring_key
                .entry(mkey.to_string())
                .or_default()
                .insert(rule.id.clone());
        }
        self.rules.insert(rule.id.clone(), rule);
    }

    /// Remove a rule, returning it if present
    pub fn remove_rule(&mut self, rule_id: &str) -> Option<PolicyRule> {
        let rule = self.rules.remove(rule_id)?;
        if let Some(key) = rule.charging_key() {
            if let Some(ids) = self.by_charging_key.get_mut(&key) {
                ids.remove(rule_id);
                if ids.is_empty() {
                    self.by_charging_key.remove(&key);
                }
            }
        }
        if let Some(mkey) = rule.monitoring_key() {
            if let Some(ids) = self.by_monitoring_key.get_mut(mkey) {
                ids.remove(rule_id);
                if ids.is_empty() {
                    self.by_monitoring_key.remove(mkey);
                }
            }
        }
        Some(rule)
    }

    pub fn get_rule(&self, rule_id: &str) -> Option<&PolicyRule> {
        self.rules.get(rule_id)
    }

    pub fn has_rule(&self, rule_id: &str) -> bool {
        self.rules.contains_key(rule_id)
    }

    pub fn rule_ids(&self) -> Vec<String> {
        self.rules.keys().cloned().collect()
    }

    pub fn rules(&self) -> Vec<PolicyRule> {
        self.rules.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Charging key of a rule, if it is charging-tracked
    pub fn charging_key_for_rule_id(&self, rule_id: &str) -> Option<CreditKey> {
        self.rules.get(rule_id).and_then(|r| r.charging_key())
    }

    /// Monitoring key of a rule, if it is monitor-tracked
    pub fn monitoring_key_for_rule_id(&self, rule_id: &str) -> Option<String> {
        self.rules
            .get(rule_id)
            .and_then(|r| r.monitoring_key().map(str::to_string))
    }

    /// Ids of the rules charged against `key`
    pub fn rule_ids_for_charging_key(&self, key: &CreditKey) -> Vec<String> {
        self.by_charging_key
            .get(key)
            .map(|ids| ids.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Definitions of the rules charged against `key`
    pub fn rule_definitions_for_charging_key(&self, key: &CreditKey) -> Vec<PolicyRule> {
        self.rule_ids_for_charging_key(key)
            .into_iter()
            .filter_map(|id| self.rules.get(&id).cloned())
            .collect()
    }

    /// Ids of the rules monitored under `mkey`
    pub fn rule_ids_for_monitoring_key(&self, mkey: &str) -> Vec<String> {
        self.by_monitoring_key
            .get(mkey)
            .map(|ids| ids.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Number of rules carrying a monitoring key
    pub fn monitored_rules_count(&self) -> usize {
        self.rules
            .values()
            .filter(|r| r.monitoring_key().is_some())
            .count()
    }
}

// ============================================================================
// Static rule registry
// ============================================================================

/// The shared static rule registry. Readers see a consistent snapshot;
/// a hot reload replaces the whole inner map atomically.
#[derive(Debug, Default)]
pub struct StaticRuleStore {
    inner: RwLock<PolicyRuleBiMap>,
}

impl StaticRuleStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the registry contents
    pub fn reload(&self, rules: Vec<PolicyRule>) {
        let mut bimap = PolicyRuleBiMap::new();
        for rule in rules {
            bimap.insert_rule(rule);
        }
        if let Ok(mut inner) = self.inner.write() {
            *inner = bimap;
        }
        log::info!("Static rule registry reloaded");
    }

    /// Insert a single rule
    pub fn insert_rule(&self, rule: PolicyRule) {
        if let Ok(mut inner) = self.inner.write() {
            inner.insert_rule(rule);
        }
    }

    pub fn get_rule(&self, rule_id: &str) -> Option<PolicyRule> {
        self.inner
            .read()
            .ok()
            .and_then(|inner| inner.get_rule(rule_id).cloned())
    }

    pub fn has_rule(&self, rule_id: &str) -> bool {
        self.inner
            .read()
            .map(|inner| inner.has_rule(rule_id))
            .unwrap_or(false)
    }

    pub fn charging_key_for_rule_id(&self, rule_id: &str) -> Option<CreditKey> {
        self.inner
            .read()
            .ok()
            .and_then(|inner| inner.charging_key_for_rule_id(rule_id))
    }

    pub fn monitoring_key_for_rule_id(&self, rule_id: &str) -> Option<String> {
        self.inner
            .read()
            .ok()
            .and_then(|inner| inner.monitoring_key_for_rule_id(rule_id))
    }

    pub fn rule_ids_for_charging_key(&self, key: &CreditKey) -> Vec<String> {
        self.inner
            .read()
            .map(|inner| inner.rule_ids_for_charging_key(key))
            .unwrap_or_default()
    }

    pub fn rule_ids_for_monitoring_key(&self, mkey: &str) -> Vec<String> {
        self.inner
            .read()
            .map(|inner| inner.rule_ids_for_monitoring_key(mkey))
            .unwrap_or_default()
    }

    pub fn rule_definitions_for_charging_key(&self, key: &CreditKey) -> Vec<PolicyRule> {
        self.inner
            .read()
            .map(|inner| inner.rule_definitions_for_charging_key(key))
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cg_proto::TrackingType;

    fn rule(id: &str, rg: u32, mkey: Option<&str>) -> PolicyRule {
        let mut rule = PolicyRule::new(id, 10);
        rule.rating_group = rg;
        rule.tracking_type = match mkey {
            Some(_) => TrackingType::OcsAndPcrf,
            None => TrackingType::OnlyOcs,
        };
        rule.monitoring_key = mkey.map(str::to_string);
        rule
    }

    #[test]
    fn test_lifetime_window() {
        let lifetime = RuleLifetime {
            activation_time: 100,
            deactivation_time: 200,
        };
        assert!(!lifetime.should_be_active(100));
        assert!(lifetime.should_be_active(101));
        assert!(lifetime.should_be_active(200));
        assert!(!lifetime.should_be_active(201));
        assert!(!lifetime.should_be_deactivated(150));
        assert!(lifetime.should_be_deactivated(201));

        let unbounded = RuleLifetime::unbounded();
        assert!(unbounded.should_be_active(1));
        assert!(!unbounded.should_be_deactivated(u64::MAX));
    }

    #[test]
    fn test_bimap_insert_remove() {
        let mut bimap = PolicyRuleBiMap::new();
        bimap.insert_rule(rule("r1", 10, Some("m1")));
        bimap.insert_rule(rule("r2", 10, None));

        assert_eq!(bimap.len(), 2);
        assert!(bimap.has_rule("r1"));
        let mut ids = bimap.rule_ids_for_charging_key(&CreditKey::new(10));
        ids.sort();
        assert_eq!(ids, vec!["r1", "r2"]);
        assert_eq!(bimap.rule_ids_for_monitoring_key("m1"), vec!["r1"]);
        assert_eq!(bimap.monitored_rules_count(), 1);

        let removed = bimap.remove_rule("r1").unwrap();
        assert_eq!(removed.id, "r1");
        assert_eq!(bimap.rule_ids_for_charging_key(&CreditKey::new(10)), vec!["r2"]);
        assert!(bimap.rule_ids_for_monitoring_key("m1").is_empty());
        assert!(bimap.remove_rule("r1").is_none());
    }

    #[test]
    fn test_bimap_key_lookups() {
        let mut bimap = PolicyRuleBiMap::new();
        bimap.insert_rule(rule("r1", 10, Some("m1")));

        assert_eq!(
            bimap.charging_key_for_rule_id("r1"),
            Some(CreditKey::new(10))
        );
        assert_eq!(bimap.monitoring_key_for_rule_id("r1"), Some("m1".to_string()));
        assert!(bimap.charging_key_for_rule_id("missing").is_none());
    }

    #[test]
    fn test_reinsert_replaces_indexes() {
        let mut bimap = PolicyRuleBiMap::new();
        bimap.insert_rule(rule("r1", 10, None));
        bimap.insert_rule(rule("r1", 20, None));

        assert!(bimap.rule_ids_for_charging_key(&CreditKey::new(10)).is_empty());
        assert_eq!(bimap.rule_ids_for_charging_key(&CreditKey::new(20)), vec!["r1"]);
    }

    #[test]
    fn test_static_store_reload() {
        let store = StaticRuleStore::new();
        store.insert_rule(rule("old", 1, None));
        assert!(store.has_rule("old"));

        store.reload(vec![rule("new", 2, None)]);
        assert!(!store.has_rule("old"));
        assert!(store.has_rule("new"));
        assert_eq!(
            store.charging_key_for_rule_id("new"),
            Some(CreditKey::new(2))
        );
    }

    #[test]
    fn test_rule_definitions_for_charging_key() {
        let store = StaticRuleStore::new();
        store.insert_rule(rule("r1", 10, None));
        let defs = store.rule_definitions_for_charging_key(&CreditKey::new(10));
        assert_eq!(defs.len(), 1);
        assert_eq!(defs[0].id, "r1");
    }
}
