//! Unified configuration for the killwatch engine.
//!
//! Every component reads its settings from one [`EngineConfig`]. Configs can
//! be built in code with the `with_*` methods, taken from a preset, or loaded
//! from YAML/JSON documents where durations are written as `*_ms` integers:
//!
//! ```yaml
//! latency_budget_ms: 200
//! pool:
//!   num_threads: 4
//!   profile_timeout_ms: 50
//! dedup:
//!   ttl_ms: 3600000
//!   capacity: 100000
//! ```
//!
//! Missing keys fall back to [`Default`].

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::{ConfigError, DefinitionError};

/// Filter compiler limits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompilerConfig {
    /// Maximum filter tree depth; a lone leaf has depth 1.
    pub max_depth: usize,
    /// Maximum number of ids in an `in`/`not_in` list.
    pub max_list_len: usize,
}

impl Default for CompilerConfig {
    fn default() -> Self {
        Self {
            max_depth: 10,
            max_list_len: 10_000,
        }
    }
}

/// Worker pool used to evaluate the candidate profiles of one event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Hard cap on evaluation threads.
    pub num_threads: usize,
    /// Candidates per parallel task; smaller candidate sets run inline.
    pub min_candidates_per_task: usize,
    /// Per-profile evaluation timeout. Exceeding it is an evaluation error
    /// for that profile only.
    #[serde(rename = "profile_timeout_ms", with = "option_duration_ms")]
    pub profile_timeout: Option<Duration>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        let cores = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4);
        Self {
            num_threads: cores.min(8),
            min_candidates_per_task: 32,
            profile_timeout: Some(Duration::from_millis(50)),
        }
    }
}

/// Match dedup cache retention.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DedupConfig {
    #[serde(rename = "ttl_ms", with = "duration_ms")]
    pub ttl: Duration,
    /// Total entries retained across all shards.
    pub capacity: usize,
    pub shards: usize,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(3600),
            capacity: 100_000,
            shards: 16,
        }
    }
}

/// Profile propagation from CRUD hooks into the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub queue_capacity: usize,
    /// How long a hook waits for queue space before reporting `QueueFull`.
    #[serde(rename = "enqueue_timeout_ms", with = "duration_ms")]
    pub enqueue_timeout: Duration,
    /// Immediate attempts before a change is deferred.
    pub max_attempts: u32,
    #[serde(rename = "initial_backoff_ms", with = "duration_ms")]
    pub initial_backoff: Duration,
    #[serde(rename = "max_backoff_ms", with = "duration_ms")]
    pub max_backoff: Duration,
    /// Interval between retries of deferred changes.
    #[serde(rename = "deferred_retry_ms", with = "duration_ms")]
    pub deferred_retry: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 1024,
            enqueue_timeout: Duration::from_millis(500),
            max_attempts: 5,
            initial_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_secs(1),
            deferred_retry: Duration::from_secs(5),
        }
    }
}

impl SyncConfig {
    /// Backoff before retry number `attempt` (1-based), doubling up to the cap.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.initial_backoff
            .checked_mul(factor)
            .unwrap_or(self.max_backoff)
            .min(self.max_backoff)
    }
}

/// Event intake for the surveillance service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    pub event_queue_capacity: usize,
    /// Threads pulling events off the intake queue. Events handled by
    /// different workers may complete out of arrival order.
    pub event_workers: usize,
    /// How often expired dedup entries are swept.
    #[serde(rename = "purge_interval_ms", with = "duration_ms")]
    pub purge_interval: Duration,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            event_queue_capacity: 4096,
            event_workers: 2,
            purge_interval: Duration::from_secs(60),
        }
    }
}

/// Top-level engine configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub compiler: CompilerConfig,
    pub pool: PoolConfig,
    pub dedup: DedupConfig,
    pub sync: SyncConfig,
    pub service: ServiceConfig,
    /// Per-event latency target. Overruns are counted and logged, never enforced.
    #[serde(rename = "latency_budget_ms", with = "duration_ms")]
    pub latency_budget: Duration,
    /// Upper bound on compiled profiles held by the engine.
    pub max_profiles: usize,
    /// Prune candidates through the inverted index. When off, every profile
    /// is evaluated for every event.
    pub index_enabled: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            compiler: CompilerConfig::default(),
            pool: PoolConfig::default(),
            dedup: DedupConfig::default(),
            sync: SyncConfig::default(),
            service: ServiceConfig::default(),
            latency_budget: Duration::from_millis(200),
            max_profiles: 100_000,
            index_enabled: true,
        }
    }
}

impl EngineConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Small pool, short retention and fast sync retries for local runs and tests.
    pub fn development() -> Self {
        Self {
            pool: PoolConfig {
                num_threads: 2,
                min_candidates_per_task: 8,
                profile_timeout: Some(Duration::from_millis(250)),
            },
            dedup: DedupConfig {
                ttl: Duration::from_secs(60),
                capacity: 10_000,
                shards: 4,
            },
            sync: SyncConfig {
                queue_capacity: 256,
                enqueue_timeout: Duration::from_millis(100),
                max_attempts: 3,
                initial_backoff: Duration::from_millis(1),
                max_backoff: Duration::from_millis(20),
                deferred_retry: Duration::from_millis(50),
            },
            service: ServiceConfig {
                event_queue_capacity: 256,
                event_workers: 1,
                purge_interval: Duration::from_secs(1),
            },
            ..Default::default()
        }
    }

    /// Large profile sets under bursty load.
    pub fn high_throughput() -> Self {
        let cores = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(8);
        Self {
            pool: PoolConfig {
                num_threads: cores.min(32),
                min_candidates_per_task: 64,
                profile_timeout: Some(Duration::from_millis(20)),
            },
            dedup: DedupConfig {
                ttl: Duration::from_secs(6 * 3600),
                capacity: 1_000_000,
                shards: 64,
            },
            service: ServiceConfig {
                event_queue_capacity: 65_536,
                event_workers: 4,
                ..Default::default()
            },
            max_profiles: 1_000_000,
            ..Default::default()
        }
    }

    pub fn with_max_depth(mut self, max_depth: usize) -> Self {
        self.compiler.max_depth = max_depth;
        self
    }

    pub fn with_threads(mut self, num_threads: usize) -> Self {
        self.pool.num_threads = num_threads;
        self
    }

    pub fn with_min_candidates_per_task(mut self, min: usize) -> Self {
        self.pool.min_candidates_per_task = min;
        self
    }

    pub fn with_profile_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.pool.profile_timeout = timeout;
        self
    }

    pub fn with_dedup_ttl(mut self, ttl: Duration) -> Self {
        self.dedup.ttl = ttl;
        self
    }

    pub fn with_dedup_capacity(mut self, capacity: usize) -> Self {
        self.dedup.capacity = capacity;
        self
    }

    pub fn with_latency_budget(mut self, budget: Duration) -> Self {
        self.latency_budget = budget;
        self
    }

    pub fn with_max_profiles(mut self, max_profiles: usize) -> Self {
        self.max_profiles = max_profiles;
        self
    }

    pub fn with_sync(mut self, sync: SyncConfig) -> Self {
        self.sync = sync;
        self
    }

    pub fn with_event_workers(mut self, workers: usize) -> Self {
        self.service.event_workers = workers;
        self
    }

    pub fn with_index(mut self, enabled: bool) -> Self {
        self.index_enabled = enabled;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.compiler.max_depth == 0 {
            return Err(ConfigError("compiler.max_depth must be at least 1".into()));
        }
        if self.compiler.max_list_len == 0 {
            return Err(ConfigError("compiler.max_list_len must be at least 1".into()));
        }
        if self.pool.num_threads == 0 {
            return Err(ConfigError("pool.num_threads must be at least 1".into()));
        }
        if self.pool.min_candidates_per_task == 0 {
            return Err(ConfigError(
                "pool.min_candidates_per_task must be at least 1".into(),
            ));
        }
        if self.dedup.shards == 0 || self.dedup.capacity < self.dedup.shards {
            return Err(ConfigError(format!(
                "dedup.capacity ({}) must be at least dedup.shards ({}) and shards non-zero",
                self.dedup.capacity, self.dedup.shards
            )));
        }
        if self.dedup.ttl.is_zero() {
            return Err(ConfigError("dedup.ttl_ms must be positive".into()));
        }
        if self.sync.queue_capacity == 0 || self.sync.max_attempts == 0 {
            return Err(ConfigError(
                "sync.queue_capacity and sync.max_attempts must be positive".into(),
            ));
        }
        if self.sync.initial_backoff > self.sync.max_backoff {
            return Err(ConfigError(
                "sync.initial_backoff_ms exceeds sync.max_backoff_ms".into(),
            ));
        }
        if self.service.event_workers == 0 || self.service.event_queue_capacity == 0 {
            return Err(ConfigError(
                "service.event_workers and service.event_queue_capacity must be positive".into(),
            ));
        }
        if self.service.purge_interval.is_zero() {
            return Err(ConfigError("service.purge_interval_ms must be positive".into()));
        }
        if self.max_profiles == 0 {
            return Err(ConfigError("max_profiles must be positive".into()));
        }
        Ok(())
    }

    pub fn from_yaml_str(input: &str) -> Result<Self, DefinitionError> {
        Ok(serde_yaml::from_str(input)?)
    }

    pub fn from_json_str(input: &str) -> Result<Self, DefinitionError> {
        Ok(serde_json::from_str(input)?)
    }

    /// Load from a `.json` file, or YAML for any other extension.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, DefinitionError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)?;
        match path.extension().and_then(|e| e.to_str()) {
            Some("json") => Self::from_json_str(&contents),
            _ => Self::from_yaml_str(&contents),
        }
    }
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}

mod option_duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(
        value: &Option<Duration>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => serializer.serialize_some(&(d.as_millis() as u64)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(deserializer)?.map(Duration::from_millis))
    }
}
