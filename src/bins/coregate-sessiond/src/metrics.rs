//! In-process usage counters
//!
//! A small labelled counter registry. The engine only emits the
//! `ue_reported_usage` counter family (bytes reported by the data plane
//! for rules that are actually installed); there is no scrape endpoint.

use std::collections::HashMap;
use std::sync::{OnceLock, RwLock};

/// Counter registry keyed by metric name plus rendered label pairs
struct CounterRegistry {
    counters: RwLock<HashMap<String, u64>>,
}

static REGISTRY: OnceLock<CounterRegistry> = OnceLock::new();

fn registry() -> &'static CounterRegistry {
    REGISTRY.get_or_init(|| CounterRegistry {
        counters: RwLock::new(HashMap::new()),
    })
}

fn counter_key(name: &str, labels: &[(&str, &str)]) -> String {
    let mut key = String::from(name);
    for (label, value) in labels {
        key.push_str(&format!("{{{label}={value}}}"));
    }
    key
}

/// Increment a labelled counter by `value`
pub fn increment_counter(name: &str, value: u64, labels: &[(&str, &str)]) {
    let key = counter_key(name, labels);
    if let Ok(mut counters) = registry().counters.write() {
        *counters.entry(key).or_insert(0) += value;
    }
}

/// Read a labelled counter; 0 if it was never incremented
pub fn get_counter(name: &str, labels: &[(&str, &str)]) -> u64 {
    let key = counter_key(name, labels);
    registry()
        .counters
        .read()
        .map(|c| c.get(&key).copied().unwrap_or(0))
        .unwrap_or(0)
}

/// Record usage reported by the data plane for an installed rule
pub fn report_ue_usage(imsi: &str, apn: &str, msisdn: &str, bytes_tx: u64, bytes_rx: u64) {
    increment_counter(
        "ue_reported_usage",
        bytes_tx,
        &[
            ("imsi", imsi),
            ("apn", apn),
            ("msisdn", msisdn),
            ("direction", "up"),
        ],
    );
    increment_counter(
        "ue_reported_usage",
        bytes_rx,
        &[
            ("imsi", imsi),
            ("apn", apn),
            ("msisdn", msisdn),
            ("direction", "down"),
        ],
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_increment_and_read() {
        increment_counter("test_metric", 5, &[("k", "v")]);
        increment_counter("test_metric", 7, &[("k", "v")]);
        assert_eq!(get_counter("test_metric", &[("k", "v")]), 12);
        assert_eq!(get_counter("test_metric", &[("k", "other")]), 0);
    }

    #[test]
    fn test_ue_usage_directions() {
        report_ue_usage("IMSI900", "inet", "555", 100, 200);
        let labels_up = [
            ("imsi", "IMSI900"),
            ("apn", "inet"),
            ("msisdn", "555"),
            ("direction", "up"),
        ];
        let labels_down = [
            ("imsi", "IMSI900"),
            ("apn", "inet"),
            ("msisdn", "555"),
            ("direction", "down"),
        ];
        assert_eq!(get_counter("ue_reported_usage", &labels_up), 100);
        assert_eq!(get_counter("ue_reported_usage", &labels_down), 200);
    }
}
