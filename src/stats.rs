//! Health counters for operational tuning.
//!
//! Counters are plain atomics updated from the matching path; a bounded
//! latency window backs the percentile figures. Nothing here affects matching
//! results.

use serde::Serialize;
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use crate::error::EvaluationError;

const LATENCY_WINDOW: usize = 1024;

/// Shared counters for one engine instance.
#[derive(Debug)]
pub struct EngineStats {
    events_processed: AtomicU64,
    matches_processed: AtomicU64,
    duplicates_suppressed: AtomicU64,
    candidates_evaluated: AtomicU64,
    evaluation_errors: AtomicU64,
    evaluation_timeouts: AtomicU64,
    worker_panics: AtomicU64,
    latency_total_us: AtomicU64,
    latency_max_us: AtomicU64,
    latency_overruns: AtomicU64,
    cache_write_errors: AtomicU64,
    compile_rejections: AtomicU64,
    sync_applied: AtomicU64,
    sync_retries: AtomicU64,
    sync_failures: AtomicU64,
    pool_restarts: AtomicU64,
    dispatch_failures: AtomicU64,
    sync_pending: AtomicU64,
    latency_window: Mutex<VecDeque<Duration>>,
}

impl Default for EngineStats {
    fn default() -> Self {
        Self::new()
    }
}

impl EngineStats {
    pub fn new() -> Self {
        Self {
            events_processed: AtomicU64::new(0),
            matches_processed: AtomicU64::new(0),
            duplicates_suppressed: AtomicU64::new(0),
            candidates_evaluated: AtomicU64::new(0),
            evaluation_errors: AtomicU64::new(0),
            evaluation_timeouts: AtomicU64::new(0),
            worker_panics: AtomicU64::new(0),
            latency_total_us: AtomicU64::new(0),
            latency_max_us: AtomicU64::new(0),
            latency_overruns: AtomicU64::new(0),
            cache_write_errors: AtomicU64::new(0),
            compile_rejections: AtomicU64::new(0),
            sync_applied: AtomicU64::new(0),
            sync_retries: AtomicU64::new(0),
            sync_failures: AtomicU64::new(0),
            pool_restarts: AtomicU64::new(0),
            dispatch_failures: AtomicU64::new(0),
            sync_pending: AtomicU64::new(0),
            latency_window: Mutex::new(VecDeque::with_capacity(LATENCY_WINDOW)),
        }
    }

    /// Record one completed evaluation cycle.
    pub fn record_event(&self, latency: Duration, candidates: usize, over_budget: bool) {
        let micros = latency.as_micros() as u64;
        self.events_processed.fetch_add(1, Ordering::Relaxed);
        self.candidates_evaluated
            .fetch_add(candidates as u64, Ordering::Relaxed);
        self.latency_total_us.fetch_add(micros, Ordering::Relaxed);
        self.latency_max_us.fetch_max(micros, Ordering::Relaxed);
        if over_budget {
            self.latency_overruns.fetch_add(1, Ordering::Relaxed);
        }
        // Skip the sample rather than wait on a contended window.
        if let Ok(mut window) = self.latency_window.try_lock() {
            if window.len() == LATENCY_WINDOW {
                window.pop_front();
            }
            window.push_back(latency);
        }
    }

    pub fn record_match(&self) {
        self.matches_processed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_duplicate(&self) {
        self.duplicates_suppressed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_evaluation_error(&self, error: &EvaluationError) {
        self.evaluation_errors.fetch_add(1, Ordering::Relaxed);
        match error {
            EvaluationError::Timeout(_) => {
                self.evaluation_timeouts.fetch_add(1, Ordering::Relaxed);
            }
            EvaluationError::Panicked(_) => {
                self.worker_panics.fetch_add(1, Ordering::Relaxed);
            }
            _ => {}
        }
    }

    pub fn record_worker_panic(&self) {
        self.worker_panics.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cache_write_error(&self) {
        self.cache_write_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_compile_rejection(&self) {
        self.compile_rejections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_sync_applied(&self) {
        self.sync_applied.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_sync_retry(&self) {
        self.sync_retries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_sync_failure(&self) {
        self.sync_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_pool_restart(&self) {
        self.pool_restarts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dispatch_failure(&self) {
        self.dispatch_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Gauge of profile changes not yet applied to the engine.
    pub fn set_sync_pending(&self, pending: usize) {
        self.sync_pending.store(pending as u64, Ordering::Relaxed);
    }

    pub fn sync_pending(&self) -> usize {
        self.sync_pending.load(Ordering::Relaxed) as usize
    }

    pub fn average_latency(&self) -> Duration {
        let events = self.events_processed.load(Ordering::Relaxed);
        if events == 0 {
            return Duration::ZERO;
        }
        Duration::from_micros(self.latency_total_us.load(Ordering::Relaxed) / events)
    }

    /// Latency at quantile `q` (0.0..=1.0) over the recent window.
    pub fn latency_percentile(&self, q: f64) -> Duration {
        let mut samples: Vec<Duration> = match self.latency_window.lock() {
            Ok(window) => window.iter().copied().collect(),
            Err(_) => return Duration::ZERO,
        };
        if samples.is_empty() {
            return Duration::ZERO;
        }
        samples.sort_unstable();
        let index = ((samples.len() as f64 * q) as usize).min(samples.len() - 1);
        samples[index]
    }

    pub fn counters(&self) -> Counters {
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        Counters {
            events_processed: load(&self.events_processed),
            matches_processed: load(&self.matches_processed),
            duplicates_suppressed: load(&self.duplicates_suppressed),
            candidates_evaluated: load(&self.candidates_evaluated),
            evaluation_errors: load(&self.evaluation_errors),
            evaluation_timeouts: load(&self.evaluation_timeouts),
            worker_panics: load(&self.worker_panics),
            latency_overruns: load(&self.latency_overruns),
            cache_write_errors: load(&self.cache_write_errors),
            compile_rejections: load(&self.compile_rejections),
            sync_applied: load(&self.sync_applied),
            sync_retries: load(&self.sync_retries),
            sync_failures: load(&self.sync_failures),
            pool_restarts: load(&self.pool_restarts),
            dispatch_failures: load(&self.dispatch_failures),
            avg_eval_latency_us: self.average_latency().as_micros() as u64,
            max_eval_latency_us: load(&self.latency_max_us),
            p95_eval_latency_us: self.latency_percentile(0.95).as_micros() as u64,
        }
    }
}

/// Point-in-time copy of the engine counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Counters {
    pub events_processed: u64,
    pub matches_processed: u64,
    pub duplicates_suppressed: u64,
    pub candidates_evaluated: u64,
    pub evaluation_errors: u64,
    pub evaluation_timeouts: u64,
    pub worker_panics: u64,
    pub latency_overruns: u64,
    pub cache_write_errors: u64,
    pub compile_rejections: u64,
    pub sync_applied: u64,
    pub sync_retries: u64,
    pub sync_failures: u64,
    pub pool_restarts: u64,
    pub dispatch_failures: u64,
    pub avg_eval_latency_us: u64,
    pub max_eval_latency_us: u64,
    pub p95_eval_latency_us: u64,
}

/// Result of the operational `get_stats` query.
#[derive(Debug, Clone, Serialize)]
pub struct StatsSnapshot {
    pub profiles_loaded: usize,
    pub matches_processed: u64,
    pub cache_size: usize,
    pub cache_hit_rate: f64,
    /// Distinct posting values per indexed field.
    pub index_sizes: BTreeMap<String, usize>,
    /// Profiles evaluated for every event because they cannot be indexed.
    pub unindexed_profiles: usize,
    pub sync_pending: usize,
    pub sync_degraded: bool,
    #[serde(flatten)]
    pub counters: Counters,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_average_latency() {
        let stats = EngineStats::new();
        assert_eq!(stats.average_latency(), Duration::ZERO);
        stats.record_event(Duration::from_micros(100), 3, false);
        stats.record_event(Duration::from_micros(300), 5, true);

        let counters = stats.counters();
        assert_eq!(counters.events_processed, 2);
        assert_eq!(counters.candidates_evaluated, 8);
        assert_eq!(counters.latency_overruns, 1);
        assert_eq!(counters.avg_eval_latency_us, 200);
        assert_eq!(counters.max_eval_latency_us, 300);
    }

    #[test]
    fn test_percentile_uses_recent_window() {
        let stats = EngineStats::new();
        for micros in 1..=100 {
            stats.record_event(Duration::from_micros(micros), 0, false);
        }
        assert_eq!(stats.latency_percentile(0.5), Duration::from_micros(51));
        assert_eq!(stats.latency_percentile(1.0), Duration::from_micros(100));
    }

    #[test]
    fn test_error_classification() {
        let stats = EngineStats::new();
        stats.record_evaluation_error(&EvaluationError::Timeout(Duration::from_millis(1)));
        stats.record_evaluation_error(&EvaluationError::Panicked("boom".into()));
        stats.record_evaluation_error(&EvaluationError::Malformed("x".into()));
        let counters = stats.counters();
        assert_eq!(counters.evaluation_errors, 3);
        assert_eq!(counters.evaluation_timeouts, 1);
        assert_eq!(counters.worker_panics, 1);
    }
}
