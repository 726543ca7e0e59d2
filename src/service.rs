//! The running surveillance service.
//!
//! Wires the pieces together: bootstraps the profile set through
//! [`ProfileSync`], accepts killmails on a bounded intake queue, processes
//! them on `event_workers` threads through the [`MatchingEngine`] and hands
//! every fresh match to the [`NotificationSink`]. One worker also sweeps
//! expired dedup entries on the configured interval.

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Instant;
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::dispatch::NotificationSink;
use crate::engine::MatchingEngine;
use crate::error::{IntakeError, KillwatchError, Result};
use crate::event::KillmailEvent;
use crate::profile::{ProfileSource, ProfileSync, SyncReport};
use crate::stats::StatsSnapshot;

pub struct SurveillanceService {
    engine: Arc<MatchingEngine>,
    sync: ProfileSync,
    intake: Mutex<Option<Sender<KillmailEvent>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    bootstrap: SyncReport,
}

impl SurveillanceService {
    /// Build the engine, load the active profiles and start the workers.
    pub fn start(
        config: EngineConfig,
        source: &dyn ProfileSource,
        sink: Arc<dyn NotificationSink>,
    ) -> Result<Self> {
        let engine = Arc::new(MatchingEngine::new(config)?);
        Self::with_engine(engine, source, sink)
    }

    /// Start around an already-built engine, e.g. one carrying a hook.
    pub fn with_engine(
        engine: Arc<MatchingEngine>,
        source: &dyn ProfileSource,
        sink: Arc<dyn NotificationSink>,
    ) -> Result<Self> {
        let sync = ProfileSync::for_engine(&engine)?;
        let bootstrap = sync.bootstrap(source)?;

        let service_config = engine.config().service.clone();
        let (tx, rx) = bounded::<KillmailEvent>(service_config.event_queue_capacity);

        let mut workers = Vec::with_capacity(service_config.event_workers);
        for worker_id in 0..service_config.event_workers {
            let worker = EventWorker {
                engine: Arc::clone(&engine),
                sink: Arc::clone(&sink),
                sweeps_dedup: worker_id == 0,
            };
            let rx = rx.clone();
            let handle = thread::Builder::new()
                .name(format!("killwatch-events-{worker_id}"))
                .spawn(move || worker.run(rx))
                .map_err(|e| KillwatchError::Pool(format!("failed to spawn event worker: {e}")))?;
            workers.push(handle);
        }

        info!(
            profiles = engine.profiles().len(),
            rejected = bootstrap.rejected.len(),
            workers = workers.len(),
            "surveillance service started"
        );

        Ok(Self {
            engine,
            sync,
            intake: Mutex::new(Some(tx)),
            workers: Mutex::new(workers),
            bootstrap,
        })
    }

    fn sender(&self) -> std::result::Result<Sender<KillmailEvent>, IntakeError> {
        self.intake
            .lock()
            .ok()
            .and_then(|tx| tx.clone())
            .ok_or(IntakeError::Stopped)
    }

    /// Enqueue a killmail, waiting for queue space.
    pub fn submit(&self, event: KillmailEvent) -> std::result::Result<(), IntakeError> {
        self.sender()?
            .send(event)
            .map_err(|_| IntakeError::Stopped)
    }

    /// Enqueue a killmail without waiting.
    pub fn try_submit(&self, event: KillmailEvent) -> std::result::Result<(), IntakeError> {
        self.sender()?.try_send(event).map_err(|err| match err {
            TrySendError::Full(_) => IntakeError::Full,
            TrySendError::Disconnected(_) => IntakeError::Stopped,
        })
    }

    pub fn engine(&self) -> &Arc<MatchingEngine> {
        &self.engine
    }

    /// Profile CRUD hooks.
    pub fn sync(&self) -> &ProfileSync {
        &self.sync
    }

    pub fn bootstrap_report(&self) -> &SyncReport {
        &self.bootstrap
    }

    pub fn get_stats(&self) -> StatsSnapshot {
        self.engine.get_stats()
    }

    /// Close intake, drain queued events, then stop sync and the pool.
    /// Idempotent.
    pub fn stop(&self) {
        let was_running = match self.intake.lock() {
            Ok(mut tx) => tx.take().is_some(),
            Err(poisoned) => poisoned.into_inner().take().is_some(),
        };

        let workers = match self.workers.lock() {
            Ok(mut workers) => std::mem::take(&mut *workers),
            Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()),
        };
        for handle in workers {
            if handle.join().is_err() {
                warn!("event worker panicked");
            }
        }

        self.sync.shutdown();
        self.engine.shutdown();
        if was_running {
            info!("surveillance service stopped");
        }
    }
}

impl Drop for SurveillanceService {
    fn drop(&mut self) {
        self.stop();
    }
}

struct EventWorker {
    engine: Arc<MatchingEngine>,
    sink: Arc<dyn NotificationSink>,
    sweeps_dedup: bool,
}

impl EventWorker {
    fn run(self, rx: Receiver<KillmailEvent>) {
        let interval = self.engine.config().service.purge_interval;
        let mut next_sweep = Instant::now() + interval;
        loop {
            let received = if self.sweeps_dedup {
                rx.recv_deadline(next_sweep)
            } else {
                rx.recv().map_err(|_| RecvTimeoutError::Disconnected)
            };

            match received {
                Ok(event) => self.handle(&event),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }

            if self.sweeps_dedup && Instant::now() >= next_sweep {
                let purged = self.engine.purge_expired();
                if purged > 0 {
                    debug!(purged, "expired dedup entries swept");
                }
                next_sweep = Instant::now() + interval;
            }
        }
    }

    fn handle(&self, event: &KillmailEvent) {
        let outcome = self.engine.process(event);
        for notification in &outcome.matches {
            if let Err(err) = self.sink.dispatch(notification) {
                self.engine.stats().record_dispatch_failure();
                warn!(
                    profile_id = %notification.profile_id,
                    killmail_id = notification.killmail_id,
                    error = %err,
                    "notification dispatch failed"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::Criterion;
    use crate::dispatch::{ChannelSink, CollectingSink};
    use crate::event::Participant;
    use crate::profile::{InMemoryProfileSource, OwnerId, Profile};
    use std::time::Duration;

    fn source() -> InMemoryProfileSource {
        InMemoryProfileSource::new(vec![
            Profile::new(
                OwnerId::from("fc"),
                "jita",
                Criterion::leaf("solar_system_id", "eq", 30000142),
            ),
            Profile::new(
                OwnerId::from("fc"),
                "broken",
                Criterion::leaf("warp_speed", "gt", 3),
            ),
        ])
    }

    fn event(id: u64, system: u64) -> KillmailEvent {
        KillmailEvent::new(id, system, 1.0e7, Participant::new(1, 2, 3))
    }

    #[test]
    fn test_end_to_end_dispatch() {
        let (sink, rx) = ChannelSink::new();
        let service =
            SurveillanceService::start(EngineConfig::development(), &source(), Arc::new(sink))
                .unwrap();
        assert_eq!(service.bootstrap_report().loaded, 1);
        assert_eq!(service.bootstrap_report().rejected.len(), 1);

        service.submit(event(1, 30000142)).unwrap();
        service.submit(event(2, 30002187)).unwrap();
        service.submit(event(1, 30000142)).unwrap();

        let first = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(first.killmail_id, 1);

        service.stop();
        assert!(rx.try_recv().is_err());
        let stats = service.get_stats();
        assert_eq!(stats.counters.events_processed, 3);
        assert_eq!(stats.matches_processed, 1);
        assert_eq!(stats.counters.duplicates_suppressed, 1);
    }

    #[test]
    fn test_submit_after_stop_is_rejected() {
        let service = SurveillanceService::start(
            EngineConfig::development(),
            &source(),
            Arc::new(CollectingSink::new()),
        )
        .unwrap();
        service.stop();
        service.stop();
        assert_eq!(service.submit(event(1, 1)), Err(IntakeError::Stopped));
        assert_eq!(service.try_submit(event(1, 1)), Err(IntakeError::Stopped));
    }

    #[test]
    fn test_dispatch_failures_are_counted() {
        let (sink, rx) = ChannelSink::new();
        drop(rx);
        let service =
            SurveillanceService::start(EngineConfig::development(), &source(), Arc::new(sink))
                .unwrap();
        service.submit(event(9, 30000142)).unwrap();
        service.stop();
        assert_eq!(service.get_stats().counters.dispatch_failures, 1);
    }
}
