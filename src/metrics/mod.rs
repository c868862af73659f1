//! Metrics and introspection.
//!
//! Lock-free counters for the invocation surface: per-function invocation,
//! cache hit/miss, error and timeout tallies, plus the in-use guest gauge.
//! Snapshots serialize straight onto the `/metrics` endpoint.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use serde::Serialize;

/// Per-function counters.
#[derive(Default)]
pub struct FunctionCounters {
    pub invocations: AtomicU64,
    pub cache_hits: AtomicU64,
    pub cache_misses: AtomicU64,
    pub errors: AtomicU64,
    pub timeouts: AtomicU64,
    pub total_duration_ms: AtomicU64,
}

/// Serialized view of one function's counters.
#[derive(Debug, Clone, Serialize)]
pub struct FunctionSnapshot {
    pub function_id: String,
    pub invocations: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub errors: u64,
    pub timeouts: u64,
    pub avg_duration_ms: u64,
}

/// Serialized view of the whole engine.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub invocations_total: u64,
    pub guests_in_use: usize,
    pub functions: Vec<FunctionSnapshot>,
}

/// Engine-wide metrics registry.
#[derive(Default)]
pub struct Metrics {
    per_function: DashMap<String, Arc<FunctionCounters>>,
    invocations_total: AtomicU64,
    guests_in_use: AtomicUsize,
}

impl Metrics {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Counters for one function, created on first touch.
    pub fn function(&self, function_id: &str) -> Arc<FunctionCounters> {
        self.per_function
            .entry(function_id.to_string())
            .or_default()
            .clone()
    }

    /// Record the start of an invocation.
    pub fn record_invocation(&self, function_id: &str) {
        self.invocations_total.fetch_add(1, Ordering::Relaxed);
        self.function(function_id)
            .invocations
            .fetch_add(1, Ordering::Relaxed);
    }

    /// Record a cache lookup result for a function.
    pub fn record_cache_lookup(&self, function_id: &str, hit: bool) {
        let counters = self.function(function_id);
        if hit {
            counters.cache_hits.fetch_add(1, Ordering::Relaxed);
        } else {
            counters.cache_misses.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Record a finished invocation.
    pub fn record_result(&self, function_id: &str, duration_ms: u64, error: bool, timeout: bool) {
        let counters = self.function(function_id);
        counters
            .total_duration_ms
            .fetch_add(duration_ms, Ordering::Relaxed);
        if timeout {
            counters.timeouts.fetch_add(1, Ordering::Relaxed);
        }
        if error {
            counters.errors.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// RAII gauge for one running guest.
    pub fn guest_started(self: &Arc<Self>) -> GuestGuard {
        self.guests_in_use.fetch_add(1, Ordering::Relaxed);
        GuestGuard {
            metrics: self.clone(),
        }
    }

    /// Currently executing guests.
    pub fn guests_in_use(&self) -> usize {
        self.guests_in_use.load(Ordering::Relaxed)
    }

    /// Point-in-time snapshot, functions sorted by id.
    pub fn snapshot(&self) -> MetricsSnapshot {
        let mut functions: Vec<FunctionSnapshot> = self
            .per_function
            .iter()
            .map(|entry| {
                let counters = entry.value();
                let invocations = counters.invocations.load(Ordering::Relaxed);
                let total = counters.total_duration_ms.load(Ordering::Relaxed);
                FunctionSnapshot {
                    function_id: entry.key().clone(),
                    invocations,
                    cache_hits: counters.cache_hits.load(Ordering::Relaxed),
                    cache_misses: counters.cache_misses.load(Ordering::Relaxed),
                    errors: counters.errors.load(Ordering::Relaxed),
                    timeouts: counters.timeouts.load(Ordering::Relaxed),
                    avg_duration_ms: if invocations == 0 { 0 } else { total / invocations },
                }
            })
            .collect();
        functions.sort_by(|a, b| a.function_id.cmp(&b.function_id));
        MetricsSnapshot {
            invocations_total: self.invocations_total.load(Ordering::Relaxed),
            guests_in_use: self.guests_in_use(),
            functions,
        }
    }
}

/// Decrements the in-use gauge when the guest finishes.
pub struct GuestGuard {
    metrics: Arc<Metrics>,
}

impl Drop for GuestGuard {
    fn drop(&mut self) {
        self.metrics.guests_in_use.fetch_sub(1, Ordering::Relaxed);
    }
}
