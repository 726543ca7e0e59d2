//! # Killwatch
//!
//! A real-time killmail surveillance engine. Users save *profiles*: named
//! boolean filter trees over killmail fields such as the participating
//! characters, corporations, alliances, ship types, the solar system and the
//! ISK value. Every incoming killmail is evaluated against the active
//! profiles and each (profile, killmail) hit is emitted once to a
//! notification sink.
//!
//! ## Quick Start
//!
//! ```rust
//! use std::sync::Arc;
//! use killwatch::{
//!     CollectingSink, Criterion, EngineConfig, InMemoryProfileSource, KillmailEvent, OwnerId,
//!     Participant, Profile, SurveillanceService,
//! };
//!
//! let profiles = InMemoryProfileSource::new(vec![Profile::new(
//!     OwnerId::from("fc-42"),
//!     "capitals in Jita",
//!     Criterion::and(vec![
//!         Criterion::leaf("solar_system_id", "eq", 30000142),
//!         Criterion::leaf("ship_type_id", "in", vec![19720, 19722, 19724, 19726]),
//!     ]),
//! )]);
//!
//! let sink = Arc::new(CollectingSink::new());
//! let service = SurveillanceService::start(EngineConfig::development(), &profiles, sink.clone())?;
//!
//! let killmail = KillmailEvent::new(1, 30000142, 2.4e9, Participant::new(90000001, 98000001, 19720));
//! service.submit(killmail)?;
//! service.stop();
//!
//! assert_eq!(sink.len(), 1);
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! ## Architecture
//!
//! - [`compiler`] validates declarative [`Criterion`] trees and produces
//!   [`CompiledPredicate`]s. Invalid trees are rejected at save time and
//!   never reach the matching path.
//! - [`matcher`] evaluates compiled predicates under a per-profile [`Budget`].
//! - [`engine`] owns the compiled profile set, the inverted candidate index
//!   and the bounded evaluation pool.
//! - [`profile`] defines profiles and the sync worker that propagates CRUD
//!   changes into the engine with retries.
//! - [`dedup`] suppresses repeat notifications within a retention window.
//! - [`service`] runs intake workers and hands matches to a [`dispatch`] sink.
//!
//! Logging goes through `tracing`; install a subscriber to see it.

pub mod compiler;
pub mod config;
pub mod dedup;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod event;
pub mod matcher;
pub mod profile;
pub mod service;
pub mod stats;

pub use compiler::{CompiledProfile, Compiler, Condition, Criterion, Field, Operator};
pub use config::{
    CompilerConfig, DedupConfig, EngineConfig, PoolConfig, ServiceConfig, SyncConfig,
};
pub use dedup::{DedupCache, DedupStatus};
pub use dispatch::{ChannelSink, CollectingSink, JsonLinesSink, Match, MatchContext, NotificationSink};
pub use engine::{Evaluation, EventOutcome, MatchingEngine};
pub use error::{
    CacheWriteError, CompilationError, CompileErrorKind, DispatchError, EvaluationError,
    IntakeError, KillwatchError, Result, SyncError,
};
pub use event::{KillmailEvent, KillmailId, Participant};
pub use matcher::{Budget, CompiledPredicate, CountingHook, EvalContext, EvalHook};
pub use profile::{
    FileProfileSource, InMemoryProfileSource, OwnerId, Profile, ProfileId, ProfileSource,
    ProfileSync, ProfileTarget, SyncHealth, SyncReport,
};
pub use service::SurveillanceService;
pub use stats::{EngineStats, StatsSnapshot};
