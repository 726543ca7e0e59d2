//! Predicate evaluation.
//!
//! Compiled predicates are evaluated against a [`KillmailEvent`](crate::event::KillmailEvent)
//! inside an [`EvalContext`] that enforces a per-profile [`Budget`] and feeds
//! an optional [`EvalHook`]. AND nodes stop at the first false child, OR nodes
//! at the first true child.

pub mod context;
pub mod hooks;
pub mod predicate;

pub use context::{Budget, EvalContext};
pub use hooks::{CountingHook, EvalHook, SharedHook};
pub use predicate::{
    CompiledLeaf, CompiledPredicate, Comparison, IndexKey, LeafTest, PredicateNode,
};
