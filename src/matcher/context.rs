//! Per-evaluation context: instrumentation hook plus a resource budget.

use std::time::{Duration, Instant};

use crate::error::EvaluationError;

use super::hooks::EvalHook;
use super::predicate::CompiledLeaf;

/// Limits applied to a single (profile, event) evaluation.
#[derive(Debug, Clone, Copy)]
pub struct Budget {
    /// Wall-clock limit; `None` disables the deadline.
    pub timeout: Option<Duration>,
    /// Maximum node depth the evaluator will descend to.
    pub max_depth: usize,
}

impl Budget {
    pub fn new(timeout: Option<Duration>, max_depth: usize) -> Self {
        Self { timeout, max_depth }
    }

    pub fn unlimited() -> Self {
        Self {
            timeout: None,
            max_depth: usize::MAX,
        }
    }
}

impl Default for Budget {
    fn default() -> Self {
        Self::new(Some(Duration::from_millis(50)), 10)
    }
}

/// Mutable state threaded through one predicate evaluation.
pub struct EvalContext<'h> {
    hook: Option<&'h dyn EvalHook>,
    deadline: Option<(Instant, Duration)>,
    max_depth: usize,
    nodes_visited: usize,
}

impl<'h> EvalContext<'h> {
    pub fn new(budget: Budget) -> Self {
        Self {
            hook: None,
            deadline: budget.timeout.map(|t| (Instant::now() + t, t)),
            max_depth: budget.max_depth,
            nodes_visited: 0,
        }
    }

    pub fn with_hook(mut self, hook: &'h dyn EvalHook) -> Self {
        self.hook = Some(hook);
        self
    }

    pub fn nodes_visited(&self) -> usize {
        self.nodes_visited
    }

    /// Called before evaluating a node at `depth` (root = 1).
    pub(crate) fn enter(&mut self, depth: usize) -> Result<(), EvaluationError> {
        if depth > self.max_depth {
            return Err(EvaluationError::DepthLimit(self.max_depth));
        }
        if let Some((deadline, timeout)) = self.deadline {
            if Instant::now() >= deadline {
                return Err(EvaluationError::Timeout(timeout));
            }
        }
        self.nodes_visited += 1;
        Ok(())
    }

    pub(crate) fn leaf_evaluated(&self, leaf: &CompiledLeaf, result: bool) {
        if let Some(hook) = self.hook {
            hook.on_leaf(leaf, result);
        }
    }
}
