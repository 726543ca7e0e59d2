//! Evaluation instrumentation hooks.
//!
//! Hooks observe leaf evaluations without influencing results. They are used
//! to verify short-circuit behaviour and to collect per-field evaluation
//! counts for tuning.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::compiler::Field;

use super::predicate::CompiledLeaf;

/// Observer invoked after every leaf evaluation.
///
/// Hooks run on pool worker threads and must not block.
pub trait EvalHook: Send + Sync {
    fn on_leaf(&self, leaf: &CompiledLeaf, result: bool);
}

pub type SharedHook = Arc<dyn EvalHook>;

/// Counts leaf evaluations and remembers the order fields were visited in.
#[derive(Debug, Default)]
pub struct CountingHook {
    leaves: AtomicUsize,
    visited: Mutex<Vec<Field>>,
}

impl CountingHook {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn count(&self) -> usize {
        self.leaves.load(Ordering::Relaxed)
    }

    /// Fields in evaluation order.
    pub fn visited(&self) -> Vec<Field> {
        self.visited.lock().map(|v| v.clone()).unwrap_or_default()
    }

    /// Evaluations per field.
    pub fn per_field(&self) -> HashMap<Field, usize> {
        let mut counts = HashMap::new();
        for field in self.visited() {
            *counts.entry(field).or_insert(0) += 1;
        }
        counts
    }

    pub fn reset(&self) {
        self.leaves.store(0, Ordering::Relaxed);
        if let Ok(mut visited) = self.visited.lock() {
            visited.clear();
        }
    }
}

impl EvalHook for CountingHook {
    fn on_leaf(&self, leaf: &CompiledLeaf, _result: bool) {
        self.leaves.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut visited) = self.visited.lock() {
            visited.push(leaf.field);
        }
    }
}
