//! Error types for the killwatch engine.
//!
//! Each component owns its failure domain: compilation errors are rejected at
//! profile save time, while evaluation, sync and cache errors degrade
//! gracefully and are surfaced through statistics.

use std::fmt;
use std::time::Duration;

pub type Result<T> = std::result::Result<T, KillwatchError>;

/// The reason a filter tree failed to compile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CompileErrorKind {
    UnknownField,
    UnknownOperator,
    InvalidOperatorForField,
    InvalidValueForField,
    MaxDepthExceeded,
    EmptyComposite,
}

impl CompileErrorKind {
    /// Wire name reported back to profile owners.
    pub fn as_str(&self) -> &'static str {
        match self {
            CompileErrorKind::UnknownField => "unknown_field",
            CompileErrorKind::UnknownOperator => "unknown_operator",
            CompileErrorKind::InvalidOperatorForField => "invalid_operator_for_field",
            CompileErrorKind::InvalidValueForField => "invalid_value_for_field",
            CompileErrorKind::MaxDepthExceeded => "max_depth_exceeded",
            CompileErrorKind::EmptyComposite => "empty_composite",
        }
    }
}

impl fmt::Display for CompileErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A filter tree was rejected by the compiler.
///
/// `path` points at the offending node using the declarative layout, e.g.
/// `rules[1].rules[0]`; the root node is `$`.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("compilation error ({kind}) at {path}: {message}")]
pub struct CompilationError {
    pub kind: CompileErrorKind,
    pub path: String,
    pub message: String,
}

impl CompilationError {
    pub fn new(kind: CompileErrorKind, path: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind,
            path: path.into(),
            message: message.into(),
        }
    }
}

/// A runtime fault while evaluating one profile against one event.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum EvaluationError {
    #[error("evaluation exceeded the per-profile timeout of {0:?}")]
    Timeout(Duration),
    #[error("evaluation exceeded the maximum depth of {0}")]
    DepthLimit(usize),
    #[error("evaluation panicked: {0}")]
    Panicked(String),
    #[error("malformed predicate: {0}")]
    Malformed(String),
}

/// A profile change could not be propagated into the engine.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SyncError {
    #[error("sync queue is full")]
    QueueFull,
    #[error("sync worker is not running")]
    Disconnected,
    #[error("failed to start sync worker: {0}")]
    Spawn(String),
    #[error("profile table is at capacity ({0} profiles)")]
    CapacityExceeded(usize),
    #[error("profile source error: {0}")]
    Source(String),
    #[error("profile rejected: {0}")]
    Rejected(#[from] CompilationError),
}

/// The dedup cache could not record a pair.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CacheWriteError {
    #[error("dedup shard {0} lock poisoned")]
    Poisoned(usize),
}

/// A profile or event document could not be parsed.
#[derive(Debug, thiserror::Error)]
pub enum DefinitionError {
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// The event intake queue refused an event.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum IntakeError {
    #[error("event queue is full")]
    Full,
    #[error("surveillance service is stopped")]
    Stopped,
}

/// A notification sink failed to accept a match. Not retried by the engine.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("dispatch failed: {0}")]
pub struct DispatchError(pub String);

/// Invalid engine configuration.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("invalid configuration: {0}")]
pub struct ConfigError(pub String);

/// Top-level error for fallible engine entry points.
#[derive(Debug, thiserror::Error)]
pub enum KillwatchError {
    #[error(transparent)]
    Compilation(#[from] CompilationError),
    #[error(transparent)]
    Evaluation(#[from] EvaluationError),
    #[error(transparent)]
    Sync(#[from] SyncError),
    #[error(transparent)]
    Cache(#[from] CacheWriteError),
    #[error(transparent)]
    Definition(#[from] DefinitionError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Intake(#[from] IntakeError),
    #[error("worker pool error: {0}")]
    Pool(String),
}

impl From<std::io::Error> for KillwatchError {
    fn from(err: std::io::Error) -> Self {
        KillwatchError::Definition(DefinitionError::Io(err))
    }
}

/// Render a caught panic payload for logs and error values.
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
