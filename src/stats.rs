//! Routing counters and the read-only snapshot exposed to monitoring.
//!
//! Per-node counters are updated under that node's map entry lock and the
//! totals are atomics, so concurrent attempts never lose an increment.
//! Counters only ever grow for the lifetime of a [`Stats`] value.
use dashmap::DashMap;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

#[derive(Debug, Default)]
struct NodeCounters {
    requests: u64,
    failures: u64,
    interrupted: u64,
    successes: u64,
    success_latency: Duration,
}

#[derive(Debug, Default)]
struct StatsInner {
    per_node: DashMap<String, NodeCounters>,
    requests: AtomicU64,
    failures: AtomicU64,
    interrupted: AtomicU64,
    exhausted: AtomicU64,
}

#[derive(Debug, Clone, Default)]
pub struct Stats {
    inner: Arc<StatsInner>,
}

/// Counters for one node. `requests` counts attempts against the node.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NodeStats {
    pub requests: u64,
    pub failures: u64,
    pub interrupted: u64,
    /// Mean latency of successful attempts in milliseconds.
    pub avg_latency: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Totals {
    pub requests: u64,
    pub failures: u64,
    pub interrupted: u64,
    /// `generate` calls that ended without any node succeeding.
    pub exhausted: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatsSnapshot {
    pub per_node: BTreeMap<String, NodeStats>,
    pub totals: Totals,
}

impl Stats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_success(&self, node_id: &str, latency: Duration) {
        {
            let mut counters = self.inner.per_node.entry(node_id.to_string()).or_default();
            counters.requests += 1;
            counters.successes += 1;
            counters.success_latency += latency;
        }
        self.inner.requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failure(&self, node_id: &str) {
        {
            let mut counters = self.inner.per_node.entry(node_id.to_string()).or_default();
            counters.requests += 1;
            counters.failures += 1;
        }
        self.inner.requests.fetch_add(1, Ordering::Relaxed);
        self.inner.failures.fetch_add(1, Ordering::Relaxed);
    }

    /// A streamed reply that broke after its first chunk. The attempt was
    /// already counted as a success.
    pub fn record_interrupted(&self, node_id: &str) {
        self.inner
            .per_node
            .entry(node_id.to_string())
            .or_default()
            .interrupted += 1;
        self.inner.interrupted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_exhausted(&self) {
        self.inner.exhausted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let per_node = self
            .inner
            .per_node
            .iter()
            .map(|entry| {
                let c = entry.value();
                let avg_latency = (c.successes > 0)
                    .then(|| c.success_latency.as_secs_f64() * 1000.0 / c.successes as f64);
                (
                    entry.key().clone(),
                    NodeStats {
                        requests: c.requests,
                        failures: c.failures,
                        interrupted: c.interrupted,
                        avg_latency,
                    },
                )
            })
            .collect();

        StatsSnapshot {
            per_node,
            totals: Totals {
                requests: self.inner.requests.load(Ordering::Relaxed),
                failures: self.inner.failures.load(Ordering::Relaxed),
                interrupted: self.inner.interrupted.load(Ordering::Relaxed),
                exhausted: self.inner.exhausted.load(Ordering::Relaxed),
            },
        }
    }
}
