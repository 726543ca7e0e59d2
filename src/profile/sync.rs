//! Propagation of profile CRUD changes into the engine.
//!
//! Hooks compile synchronously so owners get compilation errors back at save
//! time; accepted changes go through a bounded queue to a dedicated worker
//! that applies them to a [`ProfileTarget`]. Failed applications are retried
//! with exponential backoff and, once the immediate attempts are spent,
//! parked and retried periodically. A change is never dropped silently: while
//! anything is parked the sync reports [`SyncHealth::Degraded`].
//!
//! Changes for one profile are applied in the order the hooks were called.
//! A newer change for a profile supersedes a parked older one.

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, SendTimeoutError, Sender};
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Instant;
use tracing::{debug, info, warn};

use crate::compiler::{CompiledProfile, Compiler};
use crate::config::SyncConfig;
use crate::engine::MatchingEngine;
use crate::error::{panic_message, CompilationError, SyncError};
use crate::stats::EngineStats;

use super::{Profile, ProfileId, ProfileSource};

/// The engine-side store that compiled profiles are applied to.
pub trait ProfileTarget: Send + Sync {
    /// Insert or atomically replace a compiled profile.
    fn upsert(&self, profile: Arc<CompiledProfile>) -> Result<(), SyncError>;

    /// Remove a profile. Returns whether it was present.
    fn remove(&self, id: ProfileId) -> Result<bool, SyncError>;
}

#[derive(Debug, Clone, PartialEq)]
pub enum SyncHealth {
    Healthy,
    /// Some changes could not be applied yet and are being retried.
    Degraded { pending: usize, last_error: String },
}

impl SyncHealth {
    pub fn is_healthy(&self) -> bool {
        matches!(self, SyncHealth::Healthy)
    }
}

/// Outcome of loading the active profile set at startup.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SyncReport {
    pub loaded: usize,
    pub rejected: Vec<(ProfileId, CompilationError)>,
}

#[derive(Debug, Clone)]
enum Change {
    Upsert(Arc<CompiledProfile>),
    Remove(ProfileId),
}

impl Change {
    fn profile_id(&self) -> ProfileId {
        match self {
            Change::Upsert(profile) => profile.profile_id,
            Change::Remove(id) => *id,
        }
    }
}

enum Command {
    Apply(Change),
    Flush(Sender<()>),
    Shutdown,
}

/// Keeps the engine's compiled working set consistent with the profile store.
pub struct ProfileSync {
    compiler: Compiler,
    config: SyncConfig,
    stats: Arc<EngineStats>,
    tx: Sender<Command>,
    health: Arc<Mutex<SyncHealth>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl ProfileSync {
    pub fn new(
        compiler: Compiler,
        target: Arc<dyn ProfileTarget>,
        config: SyncConfig,
        stats: Arc<EngineStats>,
    ) -> Result<Self, SyncError> {
        let (tx, rx) = bounded::<Command>(config.queue_capacity.max(1));
        let health = Arc::new(Mutex::new(SyncHealth::Healthy));

        let worker = SyncWorker {
            target,
            config: config.clone(),
            stats: Arc::clone(&stats),
            health: Arc::clone(&health),
            deferred: HashMap::new(),
            last_error: None,
        };
        let handle = thread::Builder::new()
            .name("killwatch-sync".to_string())
            .spawn(move || worker.run(rx))
            .map_err(|e| SyncError::Spawn(e.to_string()))?;

        Ok(Self {
            compiler,
            config,
            stats,
            tx,
            health,
            worker: Mutex::new(Some(handle)),
        })
    }

    /// Sync wired to an engine, sharing its compiler limits and statistics.
    pub fn for_engine(engine: &Arc<MatchingEngine>) -> Result<Self, SyncError> {
        let target: Arc<dyn ProfileTarget> = Arc::clone(engine) as Arc<dyn ProfileTarget>;
        Self::new(
            engine.compiler().clone(),
            target,
            engine.config().sync.clone(),
            engine.stats(),
        )
    }

    /// Load and apply every active profile from `source`.
    ///
    /// Returns once all accepted profiles have been handed to the target.
    /// Profiles that fail to compile are reported and skipped.
    pub fn bootstrap(&self, source: &dyn ProfileSource) -> Result<SyncReport, SyncError> {
        let started = Instant::now();
        let profiles = source.load_active_profiles()?;
        let mut report = SyncReport::default();

        for profile in &profiles {
            match self.compiler.compile_profile(profile) {
                Ok(compiled) => {
                    self.tx
                        .send(Command::Apply(Change::Upsert(Arc::new(compiled))))
                        .map_err(|_| SyncError::Disconnected)?;
                    report.loaded += 1;
                }
                Err(err) => {
                    self.stats.record_compile_rejection();
                    warn!(profile_id = %profile.id, error = %err, "skipping profile that failed to compile");
                    report.rejected.push((profile.id, err));
                }
            }
        }
        self.flush()?;

        info!(
            loaded = report.loaded,
            rejected = report.rejected.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "profile bootstrap complete"
        );
        Ok(report)
    }

    /// Hook for a newly saved profile.
    ///
    /// # Errors
    /// [`SyncError::Rejected`] when the filter tree does not compile; nothing
    /// is enqueued in that case.
    pub fn on_created(&self, profile: &Profile) -> Result<(), SyncError> {
        self.on_saved(profile)
    }

    /// Hook for an edited profile. A rejected edit leaves the previously
    /// compiled version in effect. Deactivation removes the profile.
    pub fn on_updated(&self, profile: &Profile) -> Result<(), SyncError> {
        self.on_saved(profile)
    }

    pub fn on_deleted(&self, id: ProfileId) -> Result<(), SyncError> {
        self.enqueue(Change::Remove(id))
    }

    fn on_saved(&self, profile: &Profile) -> Result<(), SyncError> {
        if !profile.active {
            return self.enqueue(Change::Remove(profile.id));
        }
        let compiled = self.compiler.compile_profile(profile).map_err(|err| {
            self.stats.record_compile_rejection();
            debug!(profile_id = %profile.id, error = %err, "profile rejected");
            err
        })?;
        self.enqueue(Change::Upsert(Arc::new(compiled)))
    }

    fn enqueue(&self, change: Change) -> Result<(), SyncError> {
        self.tx
            .send_timeout(Command::Apply(change), self.config.enqueue_timeout)
            .map_err(|err| match err {
                SendTimeoutError::Timeout(_) => SyncError::QueueFull,
                SendTimeoutError::Disconnected(_) => SyncError::Disconnected,
            })
    }

    /// Block until every change enqueued before this call has been attempted.
    /// Parked changes stay parked.
    pub fn flush(&self) -> Result<(), SyncError> {
        let (done_tx, done_rx) = bounded(1);
        self.tx
            .send(Command::Flush(done_tx))
            .map_err(|_| SyncError::Disconnected)?;
        done_rx.recv().map_err(|_| SyncError::Disconnected)
    }

    pub fn health(&self) -> SyncHealth {
        match self.health.lock() {
            Ok(health) => health.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Number of parked changes.
    pub fn pending(&self) -> usize {
        match self.health() {
            SyncHealth::Healthy => 0,
            SyncHealth::Degraded { pending, .. } => pending,
        }
    }

    /// Stop the worker after it drains the queue. Idempotent.
    pub fn shutdown(&self) {
        let handle = match self.worker.lock() {
            Ok(mut worker) => worker.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(handle) = handle {
            let _ = self.tx.send(Command::Shutdown);
            if handle.join().is_err() {
                warn!("sync worker panicked during shutdown");
            }
        }
    }
}

impl Drop for ProfileSync {
    fn drop(&mut self) {
        self.shutdown();
    }
}

struct SyncWorker {
    target: Arc<dyn ProfileTarget>,
    config: SyncConfig,
    stats: Arc<EngineStats>,
    health: Arc<Mutex<SyncHealth>>,
    deferred: HashMap<ProfileId, Change>,
    last_error: Option<String>,
}

impl SyncWorker {
    fn run(mut self, rx: Receiver<Command>) {
        let mut next_retry = Instant::now() + self.config.deferred_retry;
        loop {
            let was_idle = self.deferred.is_empty();
            let received = if was_idle {
                rx.recv().map_err(|_| RecvTimeoutError::Disconnected)
            } else {
                rx.recv_deadline(next_retry)
            };

            match received {
                Ok(Command::Apply(change)) => self.apply(change),
                Ok(Command::Flush(done)) => {
                    let _ = done.send(());
                }
                Ok(Command::Shutdown) | Err(RecvTimeoutError::Disconnected) => break,
                Err(RecvTimeoutError::Timeout) => {}
            }

            if was_idle && !self.deferred.is_empty() {
                next_retry = Instant::now() + self.config.deferred_retry;
            } else if !self.deferred.is_empty() && Instant::now() >= next_retry {
                self.retry_deferred();
                next_retry = Instant::now() + self.config.deferred_retry;
            }
        }

        if !self.deferred.is_empty() {
            warn!(
                pending = self.deferred.len(),
                "sync worker stopped with unapplied profile changes"
            );
        }
    }

    fn apply(&mut self, change: Change) {
        let id = change.profile_id();
        self.deferred.remove(&id);

        let mut attempt = 1;
        loop {
            match self.apply_once(&change) {
                Ok(()) => {
                    self.stats.record_sync_applied();
                    break;
                }
                Err(err) if attempt < self.config.max_attempts => {
                    self.stats.record_sync_retry();
                    debug!(profile_id = %id, attempt, error = %err, "retrying profile change");
                    thread::sleep(self.config.backoff(attempt));
                    attempt += 1;
                }
                Err(err) => {
                    self.stats.record_sync_failure();
                    warn!(
                        profile_id = %id,
                        attempts = attempt,
                        error = %err,
                        "deferring profile change"
                    );
                    self.last_error = Some(err.to_string());
                    self.deferred.insert(id, change);
                    break;
                }
            }
        }
        self.publish_health();
    }

    fn retry_deferred(&mut self) {
        let parked: Vec<Change> = self.deferred.drain().map(|(_, change)| change).collect();
        for change in parked {
            match self.apply_once(&change) {
                Ok(()) => {
                    self.stats.record_sync_applied();
                    info!(profile_id = %change.profile_id(), "deferred profile change applied");
                }
                Err(err) => {
                    self.stats.record_sync_retry();
                    self.last_error = Some(err.to_string());
                    self.deferred.insert(change.profile_id(), change);
                }
            }
        }
        self.publish_health();
    }

    fn apply_once(&self, change: &Change) -> Result<(), SyncError> {
        let target = &self.target;
        panic::catch_unwind(AssertUnwindSafe(|| match change {
            Change::Upsert(profile) => target.upsert(Arc::clone(profile)),
            Change::Remove(id) => target.remove(*id).map(|_| ()),
        }))
        .unwrap_or_else(|payload| {
            Err(SyncError::Source(format!(
                "profile target panicked: {}",
                panic_message(payload.as_ref())
            )))
        })
    }

    fn publish_health(&mut self) {
        let pending = self.deferred.len();
        self.stats.set_sync_pending(pending);
        let health = if pending == 0 {
            self.last_error = None;
            SyncHealth::Healthy
        } else {
            SyncHealth::Degraded {
                pending,
                last_error: self.last_error.clone().unwrap_or_default(),
            }
        };
        match self.health.lock() {
            Ok(mut slot) => *slot = health,
            Err(poisoned) => *poisoned.into_inner() = health,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::Criterion;
    use crate::profile::{InMemoryProfileSource, OwnerId};
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;

    #[derive(Default)]
    struct RecordingTarget {
        profiles: Mutex<HashMap<ProfileId, Arc<CompiledProfile>>>,
        failures_left: AtomicUsize,
        broken: AtomicBool,
        calls: AtomicUsize,
    }

    impl RecordingTarget {
        fn get(&self, id: ProfileId) -> Option<Arc<CompiledProfile>> {
            self.profiles.lock().unwrap().get(&id).cloned()
        }

        fn fail(&self) -> Result<(), SyncError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.broken.load(Ordering::SeqCst) {
                return Err(SyncError::Source("store offline".into()));
            }
            let left = self.failures_left.load(Ordering::SeqCst);
            if left > 0 {
                self.failures_left.store(left - 1, Ordering::SeqCst);
                return Err(SyncError::Source("transient".into()));
            }
            Ok(())
        }
    }

    impl ProfileTarget for RecordingTarget {
        fn upsert(&self, profile: Arc<CompiledProfile>) -> Result<(), SyncError> {
            self.fail()?;
            self.profiles
                .lock()
                .unwrap()
                .insert(profile.profile_id, profile);
            Ok(())
        }

        fn remove(&self, id: ProfileId) -> Result<bool, SyncError> {
            self.fail()?;
            Ok(self.profiles.lock().unwrap().remove(&id).is_some())
        }
    }

    struct PanickingTarget;

    impl ProfileTarget for PanickingTarget {
        fn upsert(&self, _profile: Arc<CompiledProfile>) -> Result<(), SyncError> {
            panic!("index corrupted")
        }

        fn remove(&self, _id: ProfileId) -> Result<bool, SyncError> {
            Ok(false)
        }
    }

    fn fast_config() -> SyncConfig {
        SyncConfig {
            queue_capacity: 16,
            enqueue_timeout: Duration::from_millis(100),
            max_attempts: 3,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(4),
            deferred_retry: Duration::from_millis(20),
        }
    }

    fn setup(target: Arc<RecordingTarget>) -> (ProfileSync, Arc<EngineStats>) {
        let stats = Arc::new(EngineStats::new());
        let sync = ProfileSync::new(
            Compiler::new(),
            target as Arc<dyn ProfileTarget>,
            fast_config(),
            Arc::clone(&stats),
        )
        .unwrap();
        (sync, stats)
    }

    fn profile(system: u64) -> Profile {
        Profile::new(
            OwnerId::from("owner"),
            "watch",
            Criterion::leaf("solar_system_id", "eq", system),
        )
    }

    fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        false
    }

    #[test]
    fn test_create_update_delete() {
        let target = Arc::new(RecordingTarget::default());
        let (sync, stats) = setup(Arc::clone(&target));
        let original = profile(30000142);

        sync.on_created(&original).unwrap();
        sync.flush().unwrap();
        assert_eq!(target.get(original.id).unwrap().name, "watch");

        let edited = original
            .clone()
            .with_criteria(Criterion::leaf("solar_system_id", "eq", 30002187));
        sync.on_updated(&edited).unwrap();
        sync.flush().unwrap();
        assert_eq!(
            target.get(original.id).unwrap().predicate.to_criterion(),
            Criterion::leaf("solar_system_id", "eq", 30002187)
        );

        sync.on_deleted(original.id).unwrap();
        sync.flush().unwrap();
        assert!(target.get(original.id).is_none());
        assert_eq!(stats.counters().sync_applied, 3);
        assert!(sync.health().is_healthy());
    }

    #[test]
    fn test_rejected_update_keeps_previous_version() {
        let target = Arc::new(RecordingTarget::default());
        let (sync, stats) = setup(Arc::clone(&target));
        let original = profile(30000142);
        sync.on_created(&original).unwrap();

        let broken = original
            .clone()
            .with_criteria(Criterion::leaf("shield_type", "eq", 1));
        let err = sync.on_updated(&broken).unwrap_err();
        assert!(matches!(err, SyncError::Rejected(_)));

        sync.flush().unwrap();
        assert_eq!(
            target.get(original.id).unwrap().predicate.to_criterion(),
            original.criteria
        );
        assert_eq!(stats.counters().compile_rejections, 1);
    }

    #[test]
    fn test_deactivation_removes() {
        let target = Arc::new(RecordingTarget::default());
        let (sync, _) = setup(Arc::clone(&target));
        let original = profile(1);
        sync.on_created(&original).unwrap();
        sync.on_updated(&original.clone().deactivated()).unwrap();
        sync.flush().unwrap();
        assert!(target.get(original.id).is_none());
    }

    #[test]
    fn test_transient_failures_are_retried() {
        let target = Arc::new(RecordingTarget::default());
        target.failures_left.store(2, Ordering::SeqCst);
        let (sync, stats) = setup(Arc::clone(&target));

        let p = profile(7);
        sync.on_created(&p).unwrap();
        sync.flush().unwrap();

        assert!(target.get(p.id).is_some());
        assert_eq!(target.calls.load(Ordering::SeqCst), 3);
        assert_eq!(stats.counters().sync_retries, 2);
        assert!(sync.health().is_healthy());
    }

    #[test]
    fn test_exhausted_retries_defer_then_recover() {
        let target = Arc::new(RecordingTarget::default());
        target.broken.store(true, Ordering::SeqCst);
        let (sync, stats) = setup(Arc::clone(&target));

        let p = profile(7);
        sync.on_created(&p).unwrap();
        sync.flush().unwrap();

        match sync.health() {
            SyncHealth::Degraded {
                pending,
                last_error,
            } => {
                assert_eq!(pending, 1);
                assert!(last_error.contains("store offline"));
            }
            SyncHealth::Healthy => panic!("expected degraded sync"),
        }
        assert_eq!(stats.sync_pending(), 1);
        assert_eq!(stats.counters().sync_failures, 1);

        target.broken.store(false, Ordering::SeqCst);
        assert!(wait_until(|| sync.health().is_healthy()));
        assert!(target.get(p.id).is_some());
        assert_eq!(stats.sync_pending(), 0);
    }

    #[test]
    fn test_first_deferral_waits_a_full_retry_interval() {
        let target = Arc::new(RecordingTarget::default());
        target.broken.store(true, Ordering::SeqCst);
        let stats = Arc::new(EngineStats::new());
        let sync = ProfileSync::new(
            Compiler::new(),
            Arc::clone(&target) as Arc<dyn ProfileTarget>,
            SyncConfig {
                max_attempts: 1,
                deferred_retry: Duration::from_millis(200),
                ..fast_config()
            },
            stats,
        )
        .unwrap();

        // Let the worker's startup deadline pass while nothing is parked.
        thread::sleep(Duration::from_millis(300));
        sync.on_created(&profile(7)).unwrap();
        sync.flush().unwrap();
        assert_eq!(sync.pending(), 1);
        assert_eq!(target.calls.load(Ordering::SeqCst), 1);

        thread::sleep(Duration::from_millis(50));
        assert_eq!(target.calls.load(Ordering::SeqCst), 1);
        assert!(wait_until(|| target.calls.load(Ordering::SeqCst) >= 2));
    }

    #[test]
    fn test_newer_change_supersedes_deferred() {
        let target = Arc::new(RecordingTarget::default());
        target.broken.store(true, Ordering::SeqCst);
        let (sync, _) = setup(Arc::clone(&target));

        let p = profile(7);
        sync.on_created(&p).unwrap();
        sync.flush().unwrap();
        assert_eq!(sync.pending(), 1);

        target.broken.store(false, Ordering::SeqCst);
        sync.on_deleted(p.id).unwrap();
        sync.flush().unwrap();
        assert_eq!(sync.pending(), 0);

        // The parked upsert must not resurrect the profile.
        thread::sleep(Duration::from_millis(60));
        assert!(target.get(p.id).is_none());
    }

    #[test]
    fn test_target_panic_is_contained() {
        let stats = Arc::new(EngineStats::new());
        let sync = ProfileSync::new(
            Compiler::new(),
            Arc::new(PanickingTarget),
            fast_config(),
            Arc::clone(&stats),
        )
        .unwrap();

        sync.on_created(&profile(1)).unwrap();
        sync.flush().unwrap();
        assert_eq!(sync.pending(), 1);

        // Worker is still alive.
        sync.on_deleted(ProfileId::new()).unwrap();
        sync.flush().unwrap();
    }

    #[test]
    fn test_bootstrap_reports_rejections() {
        let target = Arc::new(RecordingTarget::default());
        let (sync, _) = setup(Arc::clone(&target));

        let good = profile(1);
        let bad = Profile::new(
            OwnerId::from("owner"),
            "bad",
            Criterion::leaf("total_value", "in", 5),
        );
        let inactive = profile(2).deactivated();
        let source = InMemoryProfileSource::new(vec![good.clone(), bad.clone(), inactive.clone()]);

        let report = sync.bootstrap(&source).unwrap();
        assert_eq!(report.loaded, 1);
        assert_eq!(report.rejected.len(), 1);
        assert_eq!(report.rejected[0].0, bad.id);
        assert!(target.get(good.id).is_some());
        assert!(target.get(inactive.id).is_none());
    }

    #[test]
    fn test_shutdown_disconnects_hooks() {
        let target = Arc::new(RecordingTarget::default());
        let (sync, _) = setup(target);
        sync.shutdown();
        sync.shutdown();
        assert_eq!(sync.on_deleted(ProfileId::new()), Err(SyncError::Disconnected));
    }
}
