//! Filter compiler.
//!
//! Turns a declarative [`Criterion`] tree into a validated
//! [`CompiledPredicate`]. Every leaf is checked against the field table in
//! [`fields`]: the field must exist, the operator must suit the field's kind,
//! and the value must have the shape the operator expects. Trees deeper than
//! the configured maximum and composites without children are rejected.
//! Nothing that fails here ever reaches the matching path.
//!
//! # Examples
//!
//! ```rust
//! use killwatch::compiler::{Compiler, Criterion};
//!
//! let compiler = Compiler::new();
//! let tree = Criterion::from_json(
//!     r#"{"field": "total_value", "operator": "gt", "value": 100000000}"#,
//! )?;
//! let predicate = compiler.compile(&tree)?;
//! assert_eq!(predicate.depth(), 1);
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod criterion;
pub mod fields;

pub use criterion::{Condition, Criterion};
pub use fields::{Field, FieldSpec, Operator, ValueKind, FIELD_TABLE};

use serde_json::Value;
use std::collections::{BTreeSet, HashSet};

use crate::config::CompilerConfig;
use crate::error::{CompilationError, CompileErrorKind};
use crate::matcher::{
    CompiledLeaf, CompiledPredicate, Comparison, IndexKey, LeafTest, PredicateNode,
};
use crate::profile::{OwnerId, Profile, ProfileId};

/// A profile in the engine's executable form.
#[derive(Debug, Clone)]
pub struct CompiledProfile {
    pub profile_id: ProfileId,
    pub owner: OwnerId,
    pub name: String,
    pub predicate: CompiledPredicate,
    pub referenced_fields: BTreeSet<Field>,
    /// Postings for the inverted index; `None` keeps the profile on the scan path.
    pub index_keys: Option<BTreeSet<IndexKey>>,
    /// Source profile's `updated_at`, in milliseconds.
    pub version: i64,
}

/// The filter compiler.
///
/// Compilation is stateless apart from the configured limits, so one
/// compiler can be shared by the sync path and save-time validation.
#[derive(Debug, Clone, Default)]
pub struct Compiler {
    config: CompilerConfig,
}

impl Compiler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(config: CompilerConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &CompilerConfig {
        &self.config
    }

    /// Validate and compile a filter tree.
    ///
    /// # Errors
    /// Returns a [`CompilationError`] whose kind is one of `unknown_field`,
    /// `unknown_operator`, `invalid_operator_for_field`,
    /// `invalid_value_for_field`, `max_depth_exceeded` or `empty_composite`.
    pub fn compile(&self, criterion: &Criterion) -> Result<CompiledPredicate, CompilationError> {
        let root = self.compile_node(criterion, 1, "$")?;
        Ok(CompiledPredicate::from_node(root))
    }

    /// Parse a JSON filter tree and compile it.
    pub fn compile_json(&self, input: &str) -> crate::error::Result<CompiledPredicate> {
        let criterion = Criterion::from_json(input)?;
        Ok(self.compile(&criterion)?)
    }

    /// Compile a profile into the engine's working form.
    pub fn compile_profile(&self, profile: &Profile) -> Result<CompiledProfile, CompilationError> {
        let predicate = self.compile(&profile.criteria)?;
        Ok(CompiledProfile {
            profile_id: profile.id,
            owner: profile.owner.clone(),
            name: profile.name.clone(),
            referenced_fields: predicate.referenced_fields(),
            index_keys: predicate.index_keys(),
            predicate,
            version: profile.updated_at.timestamp_millis(),
        })
    }

    fn compile_node(
        &self,
        criterion: &Criterion,
        depth: usize,
        path: &str,
    ) -> Result<PredicateNode, CompilationError> {
        if depth > self.config.max_depth {
            return Err(CompilationError::new(
                CompileErrorKind::MaxDepthExceeded,
                path,
                format!("tree exceeds the maximum depth of {}", self.config.max_depth),
            ));
        }

        match criterion {
            Criterion::Leaf {
                field,
                operator,
                value,
            } => self.compile_leaf(field, operator, value, path).map(PredicateNode::Leaf),
            Criterion::Composite { condition, rules } => {
                if rules.is_empty() {
                    return Err(CompilationError::new(
                        CompileErrorKind::EmptyComposite,
                        path,
                        "composite node has no rules",
                    ));
                }
                let children = rules
                    .iter()
                    .enumerate()
                    .map(|(i, rule)| {
                        let child_path = if path == "$" {
                            format!("rules[{i}]")
                        } else {
                            format!("{path}.rules[{i}]")
                        };
                        self.compile_node(rule, depth + 1, &child_path)
                    })
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(match condition {
                    Condition::And => PredicateNode::All(children),
                    Condition::Or => PredicateNode::Any(children),
                })
            }
        }
    }

    fn compile_leaf(
        &self,
        field_name: &str,
        operator_name: &str,
        value: &Value,
        path: &str,
    ) -> Result<CompiledLeaf, CompilationError> {
        let field = Field::parse(field_name).ok_or_else(|| {
            CompilationError::new(
                CompileErrorKind::UnknownField,
                path,
                format!("unknown field '{field_name}'"),
            )
        })?;
        let operator = Operator::parse(operator_name).ok_or_else(|| {
            CompilationError::new(
                CompileErrorKind::UnknownOperator,
                path,
                format!("unknown operator '{operator_name}'"),
            )
        })?;

        let kind = field.kind();
        if !kind.allows(operator) {
            return Err(CompilationError::new(
                CompileErrorKind::InvalidOperatorForField,
                path,
                format!(
                    "operator '{operator}' is not valid for {} field '{field}'",
                    kind.as_str()
                ),
            ));
        }

        let invalid_value = |expected: &str| {
            CompilationError::new(
                CompileErrorKind::InvalidValueForField,
                path,
                format!("field '{field}' with '{operator}' expects {expected}, got {value}"),
            )
        };

        let test = match kind {
            ValueKind::Numeric => {
                let number = value
                    .as_f64()
                    .filter(|n| n.is_finite())
                    .ok_or_else(|| invalid_value("a finite number"))?;
                let comparison = Comparison::from_operator(operator)
                    .ok_or_else(|| invalid_value("a scalar comparison"))?;
                LeafTest::Numeric {
                    comparison,
                    value: number,
                }
            }
            ValueKind::Id | ValueKind::IdSet => {
                if operator.takes_list() {
                    let items = value
                        .as_array()
                        .filter(|items| !items.is_empty())
                        .ok_or_else(|| invalid_value("a non-empty list of ids"))?;
                    if items.len() > self.config.max_list_len {
                        return Err(invalid_value(&format!(
                            "at most {} ids",
                            self.config.max_list_len
                        )));
                    }
                    let ids = items
                        .iter()
                        .map(|item| item.as_u64().ok_or_else(|| invalid_value("a list of ids")))
                        .collect::<Result<HashSet<u64>, _>>()?;
                    if operator == Operator::In {
                        LeafTest::In(ids)
                    } else {
                        LeafTest::NotIn(ids)
                    }
                } else {
                    let id = value.as_u64().ok_or_else(|| invalid_value("an id"))?;
                    if operator == Operator::Eq {
                        LeafTest::Equals(id)
                    } else {
                        LeafTest::NotEquals(id)
                    }
                }
            }
        };

        Ok(CompiledLeaf::new(field, test))
    }
}
