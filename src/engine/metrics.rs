//! Engine counters
//!
//! Lightweight atomic counters for the hot path; a snapshot struct serves
//! tests and diagnostic tooling.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

#[derive(Default)]
pub struct MetricsCollector {
    decisions: AtomicU64,
    allowed: AtomicU64,
    denied: AtomicU64,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    timeouts: AtomicU64,
    sod_blocks: AtomicU64,
    latency_micros_total: AtomicU64,
    latency_micros_max: AtomicU64,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_decision(&self, allowed: bool) {
        self.decisions.fetch_add(1, Ordering::Relaxed);
        if allowed {
            self.allowed.fetch_add(1, Ordering::Relaxed);
        } else {
            self.denied.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_cache_hit(&self) {
        self.cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cache_miss(&self) {
        self.cache_misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_timeout(&self) {
        self.timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_sod_block(&self) {
        self.sod_blocks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_latency(&self, latency: Duration) {
        let micros = latency.as_micros() as u64;
        self.latency_micros_total.fetch_add(micros, Ordering::Relaxed);
        self.latency_micros_max.fetch_max(micros, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> EngineMetrics {
        let decisions = self.decisions.load(Ordering::Relaxed);
        let total = self.latency_micros_total.load(Ordering::Relaxed);
        EngineMetrics {
            decisions,
            allowed: self.allowed.load(Ordering::Relaxed),
            denied: self.denied.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            cache_misses: self.cache_misses.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            sod_blocks: self.sod_blocks.load(Ordering::Relaxed),
            avg_latency_micros: if decisions == 0 { 0 } else { total / decisions },
            max_latency_micros: self.latency_micros_max.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time metrics snapshot
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineMetrics {
    pub decisions: u64,
    pub allowed: u64,
    pub denied: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub timeouts: u64,
    pub sod_blocks: u64,
    pub avg_latency_micros: u64,
    pub max_latency_micros: u64,
}
