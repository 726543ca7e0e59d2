//! The matching engine.
//!
//! [`MatchingEngine`] holds the compiled profile set and evaluates incoming
//! killmails against it:
//!
//! 1. the inverted index narrows the profile set to the candidates that could
//!    match the event;
//! 2. candidates are evaluated on the shared [`WorkerPool`], each under its
//!    own [`Budget`] and panic isolation, so one faulty profile never affects
//!    the others;
//! 3. true results pass through the [`DedupCache`] and become [`Match`]es.
//!
//! Evaluation reads only the event and immutable compiled predicates, so the
//! same (event, profile set) always produces the same matches regardless of
//! thread count or scheduling.
//!
//! # Examples
//!
//! ```rust
//! use std::sync::Arc;
//! use killwatch::compiler::Criterion;
//! use killwatch::engine::MatchingEngine;
//! use killwatch::event::{KillmailEvent, Participant};
//! use killwatch::profile::{OwnerId, Profile, ProfileTarget};
//! use killwatch::EngineConfig;
//!
//! let engine = MatchingEngine::new(EngineConfig::development())?;
//! let profile = Profile::new(
//!     OwnerId::from("fc"),
//!     "jita",
//!     Criterion::leaf("solar_system_id", "eq", 30000142),
//! );
//! engine.upsert(Arc::new(engine.compiler().compile_profile(&profile)?))?;
//!
//! let event = KillmailEvent::new(1, 30000142, 1.0e6, Participant::new(1, 2, 3));
//! let outcome = engine.process(&event);
//! assert_eq!(outcome.matches.len(), 1);
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod index;
pub mod pool;
pub mod table;

pub use index::ProfileIndex;
pub use pool::WorkerPool;
pub use table::ProfileTable;

use chrono::Utc;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::compiler::{CompiledProfile, Compiler};
use crate::config::EngineConfig;
use crate::dedup::{DedupCache, DedupStatus};
use crate::dispatch::Match;
use crate::error::{panic_message, EvaluationError, Result, SyncError};
use crate::event::KillmailEvent;
use crate::matcher::{Budget, EvalContext, SharedHook};
use crate::profile::{ProfileId, ProfileTarget};
use crate::stats::{EngineStats, StatsSnapshot};

/// Raw evaluation result for one event, before dedup.
#[derive(Debug, Clone)]
pub struct Evaluation {
    /// Profiles whose predicate was true, in profile id order.
    pub matched: Vec<Arc<CompiledProfile>>,
    /// Profiles that failed to evaluate. They count as not matched.
    pub errors: Vec<(ProfileId, EvaluationError)>,
    pub candidates: usize,
    pub elapsed: Duration,
}

/// Result of fully processing one event.
#[derive(Debug, Clone, Default)]
pub struct EventOutcome {
    /// Deduplicated matches ready for dispatch.
    pub matches: Vec<Match>,
    pub duplicates: usize,
    pub errors: Vec<(ProfileId, EvaluationError)>,
    pub candidates: usize,
    pub elapsed: Duration,
}

pub struct MatchingEngine {
    config: EngineConfig,
    compiler: Compiler,
    table: ProfileTable,
    pool: WorkerPool,
    dedup: DedupCache,
    stats: Arc<EngineStats>,
    hook: Option<SharedHook>,
}

impl MatchingEngine {
    /// Validate `config` and start the evaluation pool.
    pub fn new(config: EngineConfig) -> Result<Self> {
        config.validate()?;
        let stats = Arc::new(EngineStats::new());
        let pool = WorkerPool::new(config.pool.clone(), Arc::clone(&stats));
        pool.start()?;
        Ok(Self {
            compiler: Compiler::with_config(config.compiler.clone()),
            table: ProfileTable::new(config.max_profiles),
            dedup: DedupCache::new(&config.dedup),
            pool,
            stats,
            hook: None,
            config,
        })
    }

    /// Attach an instrumentation hook called for every evaluated leaf.
    pub fn with_hook(mut self, hook: SharedHook) -> Self {
        self.hook = Some(hook);
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn compiler(&self) -> &Compiler {
        &self.compiler
    }

    pub fn stats(&self) -> Arc<EngineStats> {
        Arc::clone(&self.stats)
    }

    pub fn profiles(&self) -> &ProfileTable {
        &self.table
    }

    pub fn dedup(&self) -> &DedupCache {
        &self.dedup
    }

    pub fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    /// Evaluate `event` against every candidate profile.
    ///
    /// Per-profile failures are collected in [`Evaluation::errors`] and never
    /// abort the remaining evaluations.
    pub fn evaluate(&self, event: &KillmailEvent) -> Evaluation {
        let started = Instant::now();
        let candidates = if self.config.index_enabled {
            self.table.candidates(event)
        } else {
            self.table.all()
        };

        let budget = Budget::new(self.config.pool.profile_timeout, self.config.compiler.max_depth);
        let results = self
            .pool
            .map(&candidates, |profile| self.evaluate_profile(profile, event, budget));

        let mut matched = Vec::new();
        let mut errors = Vec::new();
        for (profile, result) in candidates.iter().zip(results) {
            match result {
                Ok(true) => matched.push(Arc::clone(profile)),
                Ok(false) => {}
                Err(err) => {
                    self.stats.record_evaluation_error(&err);
                    warn!(
                        profile_id = %profile.profile_id,
                        killmail_id = event.killmail_id,
                        error = %err,
                        "profile evaluation failed"
                    );
                    errors.push((profile.profile_id, err));
                }
            }
        }

        let elapsed = started.elapsed();
        let over_budget = elapsed > self.config.latency_budget;
        if over_budget {
            warn!(
                killmail_id = event.killmail_id,
                candidates = candidates.len(),
                elapsed_ms = elapsed.as_millis() as u64,
                budget_ms = self.config.latency_budget.as_millis() as u64,
                "event evaluation exceeded latency budget"
            );
        }
        self.stats.record_event(elapsed, candidates.len(), over_budget);

        Evaluation {
            matched,
            errors,
            candidates: candidates.len(),
            elapsed,
        }
    }

    fn evaluate_profile(
        &self,
        profile: &CompiledProfile,
        event: &KillmailEvent,
        budget: Budget,
    ) -> std::result::Result<bool, EvaluationError> {
        panic::catch_unwind(AssertUnwindSafe(|| {
            let mut ctx = EvalContext::new(budget);
            if let Some(hook) = &self.hook {
                ctx = ctx.with_hook(hook.as_ref());
            }
            profile.predicate.evaluate(event, &mut ctx)
        }))
        .unwrap_or_else(|payload| Err(EvaluationError::Panicked(panic_message(payload.as_ref()))))
    }

    /// Evaluate `event` and turn fresh hits into [`Match`]es.
    ///
    /// A pair already dispatched within the dedup window is suppressed. If
    /// the dedup cache cannot record a pair the match is still emitted.
    pub fn process(&self, event: &KillmailEvent) -> EventOutcome {
        let evaluation = self.evaluate(event);
        let matched_at = Utc::now();
        let mut outcome = EventOutcome {
            matches: Vec::with_capacity(evaluation.matched.len()),
            duplicates: 0,
            errors: evaluation.errors,
            candidates: evaluation.candidates,
            elapsed: evaluation.elapsed,
        };

        for profile in &evaluation.matched {
            match self.dedup.record_and_check(profile.profile_id, event.killmail_id) {
                Ok(DedupStatus::Fresh) => {}
                Ok(DedupStatus::Duplicate) => {
                    self.stats.record_duplicate();
                    outcome.duplicates += 1;
                    continue;
                }
                Err(err) => {
                    self.stats.record_cache_write_error();
                    warn!(
                        profile_id = %profile.profile_id,
                        killmail_id = event.killmail_id,
                        error = %err,
                        "dedup cache write failed, emitting possible duplicate"
                    );
                }
            }
            self.stats.record_match();
            outcome.matches.push(Match::new(profile, event, matched_at));
        }

        debug!(
            killmail_id = event.killmail_id,
            candidates = outcome.candidates,
            matches = outcome.matches.len(),
            duplicates = outcome.duplicates,
            "event processed"
        );
        outcome
    }

    /// Drop expired dedup entries.
    pub fn purge_expired(&self) -> usize {
        self.dedup.purge_expired()
    }

    pub fn get_stats(&self) -> StatsSnapshot {
        let sync_pending = self.stats.sync_pending();
        StatsSnapshot {
            profiles_loaded: self.table.len(),
            matches_processed: self.stats.counters().matches_processed,
            cache_size: self.dedup.len(),
            cache_hit_rate: self.dedup.hit_rate(),
            index_sizes: self.table.index_sizes(),
            unindexed_profiles: self.table.unindexed_len(),
            sync_pending,
            sync_degraded: sync_pending > 0,
            counters: self.stats.counters(),
        }
    }

    /// Stop the evaluation pool for good. Later evaluations still complete,
    /// on the calling thread, and are not counted as pool restarts.
    pub fn shutdown(&self) {
        self.pool.shutdown();
    }
}

impl ProfileTarget for MatchingEngine {
    fn upsert(&self, profile: Arc<CompiledProfile>) -> std::result::Result<(), SyncError> {
        let id = profile.profile_id;
        let replaced = self.table.upsert(profile)?.is_some();
        debug!(profile_id = %id, replaced, "profile applied");
        Ok(())
    }

    fn remove(&self, id: ProfileId) -> std::result::Result<bool, SyncError> {
        let removed = self.table.remove(id).is_some();
        debug!(profile_id = %id, removed, "profile removed");
        Ok(removed)
    }
}
