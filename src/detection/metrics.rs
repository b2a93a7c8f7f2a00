use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::Duration;

use crate::core::RuleType;

/// Per-rule counters. A check is every completed run, with or without a match.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RuleMetrics {
    pub checks: u64,
    pub errors: u64,
    pub timeouts: u64,
    pub avg_latency_ms: f64,
}

/// Snapshot of engine counters.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EngineMetrics {
    pub events_evaluated: u64,
    pub alerts_generated: u64,
    pub alerts_by_rule: BTreeMap<RuleType, u64>,
    pub rule_errors: u64,
    pub rule_timeouts: u64,
    pub persistence_failures: u64,
    pub avg_latency_ms: f64,
    pub last_evaluated_at: Option<DateTime<Utc>>,
    pub by_rule: BTreeMap<RuleType, RuleMetrics>,
}

#[derive(Debug, Default)]
struct RuleCounters {
    checks: AtomicU64,
    errors: AtomicU64,
    timeouts: AtomicU64,
    latency_us: AtomicU64,
}

impl RuleCounters {
    fn snapshot(&self) -> RuleMetrics {
        let checks = self.checks.load(Ordering::Relaxed);
        RuleMetrics {
            checks,
            errors: self.errors.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            avg_latency_ms: average_ms(self.latency_us.load(Ordering::Relaxed), checks),
        }
    }
}

fn micros(latency: Duration) -> u64 {
    u64::try_from(latency.as_micros()).unwrap_or(u64::MAX)
}

fn average_ms(total_us: u64, count: u64) -> f64 {
    if count == 0 {
        0.0
    } else {
        total_us as f64 / count as f64 / 1000.0
    }
}

/// Lock-free counters updated by concurrent evaluations.
///
/// Each counter is individually atomic; a snapshot may mix values from
/// evaluations that are still in flight.
#[derive(Debug, Default)]
pub struct MetricsRecorder {
    events_evaluated: AtomicU64,
    alerts_generated: AtomicU64,
    alerts_by_rule: [AtomicU64; RuleType::ALL.len()],
    rules: [RuleCounters; RuleType::ALL.len()],
    rule_errors: AtomicU64,
    rule_timeouts: AtomicU64,
    persistence_failures: AtomicU64,
    total_latency_us: AtomicU64,
    last_evaluated_ms: AtomicI64,
}

impl MetricsRecorder {
    pub fn record_alert(&self, rule_type: RuleType) {
        self.alerts_generated.fetch_add(1, Ordering::Relaxed);
        self.alerts_by_rule[rule_type.index()].fetch_add(1, Ordering::Relaxed);
    }

    /// A rule ran to completion, whether or not it matched.
    pub fn record_rule_check(&self, rule_type: RuleType, latency: Duration) {
        let counters = &self.rules[rule_type.index()];
        counters.latency_us.fetch_add(micros(latency), Ordering::Relaxed);
        counters.checks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rule_error(&self, rule_type: RuleType) {
        self.rules[rule_type.index()].errors.fetch_add(1, Ordering::Relaxed);
        self.rule_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rule_timeout(&self, rule_type: RuleType) {
        self.rules[rule_type.index()].timeouts.fetch_add(1, Ordering::Relaxed);
        self.rule_timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_persistence_failure(&self) {
        self.persistence_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_evaluation(&self, latency: Duration, at: DateTime<Utc>) {
        self.total_latency_us.fetch_add(micros(latency), Ordering::Relaxed);
        self.last_evaluated_ms.fetch_max(at.timestamp_millis(), Ordering::Relaxed);
        self.events_evaluated.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> EngineMetrics {
        let events = self.events_evaluated.load(Ordering::Relaxed);
        let avg_latency_ms = average_ms(self.total_latency_us.load(Ordering::Relaxed), events);
        let last_ms = self.last_evaluated_ms.load(Ordering::Relaxed);

        EngineMetrics {
            events_evaluated: events,
            alerts_generated: self.alerts_generated.load(Ordering::Relaxed),
            alerts_by_rule: RuleType::ALL
                .into_iter()
                .map(|rt| (rt, self.alerts_by_rule[rt.index()].load(Ordering::Relaxed)))
                .collect(),
            rule_errors: self.rule_errors.load(Ordering::Relaxed),
            rule_timeouts: self.rule_timeouts.load(Ordering::Relaxed),
            persistence_failures: self.persistence_failures.load(Ordering::Relaxed),
            avg_latency_ms,
            last_evaluated_at: if last_ms == 0 {
                None
            } else {
                DateTime::from_timestamp_millis(last_ms)
            },
            by_rule: RuleType::ALL
                .into_iter()
                .map(|rt| (rt, self.rules[rt.index()].snapshot()))
                .collect(),
        }
    }
}
