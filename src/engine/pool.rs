//! Bounded worker pool for evaluating one event's candidate profiles.
//!
//! All events share one rayon pool, so the total number of evaluation
//! threads stays at `num_threads` however many events are in flight. Small
//! candidate sets are evaluated inline on the calling thread.
//!
//! A pool that disappears while the engine is live is rebuilt on the next
//! evaluation and counted as a restart. After [`WorkerPool::shutdown`] the
//! pool stays down and evaluation runs inline.

use rayon::prelude::*;
use rayon::{ThreadPool, ThreadPoolBuilder};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use tracing::{error, info, warn};

use crate::config::PoolConfig;
use crate::error::{KillwatchError, Result};
use crate::stats::EngineStats;

pub struct WorkerPool {
    config: PoolConfig,
    pool: RwLock<Option<Arc<ThreadPool>>>,
    closed: AtomicBool,
    stats: Arc<EngineStats>,
}

impl WorkerPool {
    /// A stopped pool; call [`WorkerPool::start`] before use.
    pub fn new(config: PoolConfig, stats: Arc<EngineStats>) -> Self {
        Self {
            config,
            pool: RwLock::new(None),
            closed: AtomicBool::new(false),
            stats,
        }
    }

    fn build(&self) -> Result<ThreadPool> {
        let stats = Arc::clone(&self.stats);
        ThreadPoolBuilder::new()
            .num_threads(self.config.num_threads)
            .thread_name(|i| format!("killwatch-eval-{i}"))
            .panic_handler(move |_| {
                stats.record_worker_panic();
                error!("evaluation worker panicked outside profile isolation");
            })
            .build()
            .map_err(|e| KillwatchError::Pool(e.to_string()))
    }

    pub fn start(&self) -> Result<()> {
        let pool = self.build()?;
        let mut slot = self
            .pool
            .write()
            .map_err(|_| KillwatchError::Pool("pool lock poisoned".into()))?;
        *slot = Some(Arc::new(pool));
        self.closed.store(false, Ordering::Release);
        info!(threads = self.config.num_threads, "evaluation pool started");
        Ok(())
    }

    /// Release the pool. In-flight evaluations finish on their own handle.
    pub fn stop(&self) {
        if let Ok(mut slot) = self.pool.write() {
            if slot.take().is_some() {
                info!("evaluation pool stopped");
            }
        }
    }

    /// Stop the pool and keep it down until the next explicit [`start`].
    ///
    /// [`start`]: WorkerPool::start
    pub fn shutdown(&self) {
        self.closed.store(true, Ordering::Release);
        self.stop();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn is_running(&self) -> bool {
        self.handle().is_some()
    }

    fn handle(&self) -> Option<Arc<ThreadPool>> {
        self.pool.read().ok().and_then(|slot| slot.clone())
    }

    /// The live pool, rebuilding it if it was stopped or never started.
    /// `None` means evaluation must fall back to the calling thread.
    pub fn ensure_running(&self) -> Option<Arc<ThreadPool>> {
        if let Some(pool) = self.handle() {
            return Some(pool);
        }
        if self.is_closed() {
            return None;
        }
        match self.start() {
            Ok(()) => {
                self.stats.record_pool_restart();
                warn!("evaluation pool was not running and has been restarted");
                self.handle()
            }
            Err(err) => {
                error!(error = %err, "evaluation pool unavailable, evaluating inline");
                None
            }
        }
    }

    /// Map `f` over `items`, in parallel when the set is large enough.
    /// Output order matches input order.
    pub fn map<T, R, F>(&self, items: &[T], f: F) -> Vec<R>
    where
        T: Sync,
        R: Send,
        F: Fn(&T) -> R + Sync,
    {
        let chunk = self.config.min_candidates_per_task.max(1);
        if items.len() < chunk * 2 {
            return items.iter().map(&f).collect();
        }
        match self.ensure_running() {
            Some(pool) => pool.install(|| {
                items
                    .par_chunks(chunk)
                    .flat_map_iter(|part| part.iter().map(&f))
                    .collect()
            }),
            None => items.iter().map(&f).collect(),
        }
    }

    pub fn num_threads(&self) -> usize {
        self.config.num_threads
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Mutex;

    fn pool(threads: usize, per_task: usize) -> WorkerPool {
        WorkerPool::new(
            PoolConfig {
                num_threads: threads,
                min_candidates_per_task: per_task,
                profile_timeout: None,
            },
            Arc::new(EngineStats::new()),
        )
    }

    #[test]
    fn test_small_sets_run_inline() {
        let pool = pool(2, 8);
        let caller = std::thread::current().id();
        let threads: Vec<_> = pool.map(&[1, 2, 3], |_| std::thread::current().id());
        assert!(threads.iter().all(|t| *t == caller));
        assert!(!pool.is_running());
    }

    #[test]
    fn test_large_sets_preserve_order_and_cap_threads() {
        let pool = pool(3, 4);
        pool.start().unwrap();
        let items: Vec<u32> = (0..400).collect();
        let seen = Mutex::new(HashSet::new());

        let doubled = pool.map(&items, |x| {
            seen.lock().unwrap().insert(std::thread::current().id());
            x * 2
        });

        assert_eq!(doubled, items.iter().map(|x| x * 2).collect::<Vec<_>>());
        assert!(seen.lock().unwrap().len() <= 3);
    }

    #[test]
    fn test_stopped_pool_restarts_on_demand() {
        let stats = Arc::new(EngineStats::new());
        let pool = WorkerPool::new(
            PoolConfig {
                num_threads: 2,
                min_candidates_per_task: 1,
                profile_timeout: None,
            },
            Arc::clone(&stats),
        );
        pool.start().unwrap();
        pool.stop();
        assert!(!pool.is_running());

        let out = pool.map(&[1, 2, 3, 4], |x| x + 1);
        assert_eq!(out, vec![2, 3, 4, 5]);
        assert!(pool.is_running());
        assert_eq!(stats.counters().pool_restarts, 1);
    }

    #[test]
    fn test_shutdown_pool_stays_down() {
        let stats = Arc::new(EngineStats::new());
        let pool = WorkerPool::new(
            PoolConfig {
                num_threads: 2,
                min_candidates_per_task: 1,
                profile_timeout: None,
            },
            Arc::clone(&stats),
        );
        pool.start().unwrap();
        pool.shutdown();

        let caller = std::thread::current().id();
        let threads = pool.map(&[1, 2, 3, 4], |_| std::thread::current().id());
        assert!(threads.iter().all(|t| *t == caller));
        assert!(!pool.is_running());
        assert!(pool.is_closed());
        assert_eq!(stats.counters().pool_restarts, 0);

        pool.start().unwrap();
        assert!(!pool.is_closed());
        assert!(pool.is_running());
    }
}
