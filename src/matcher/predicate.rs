//! Executable predicate trees produced by the compiler.

use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeSet, HashSet};

use crate::compiler::{Criterion, Field, Operator};
use crate::error::EvaluationError;
use crate::event::KillmailEvent;

use super::context::{Budget, EvalContext};

/// Ordering comparison against a numeric field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Comparison {
    Eq,
    Neq,
    Gt,
    Gte,
    Lt,
    Lte,
}

impl Comparison {
    pub fn from_operator(operator: Operator) -> Option<Self> {
        let comparison = match operator {
            Operator::Eq => Comparison::Eq,
            Operator::Neq => Comparison::Neq,
            Operator::Gt => Comparison::Gt,
            Operator::Gte => Comparison::Gte,
            Operator::Lt => Comparison::Lt,
            Operator::Lte => Comparison::Lte,
            Operator::In | Operator::NotIn => return None,
        };
        Some(comparison)
    }

    fn apply(&self, actual: f64, expected: f64) -> bool {
        match self {
            Comparison::Eq => actual == expected,
            Comparison::Neq => actual != expected,
            Comparison::Gt => actual > expected,
            Comparison::Gte => actual >= expected,
            Comparison::Lt => actual < expected,
            Comparison::Lte => actual <= expected,
        }
    }

    fn operator(&self) -> Operator {
        match self {
            Comparison::Eq => Operator::Eq,
            Comparison::Neq => Operator::Neq,
            Comparison::Gt => Operator::Gt,
            Comparison::Gte => Operator::Gte,
            Comparison::Lt => Operator::Lt,
            Comparison::Lte => Operator::Lte,
        }
    }
}

/// The test a leaf applies to its field.
///
/// For multi-valued fields, positive tests hold when any participant
/// satisfies them and negative tests hold when none does.
#[derive(Debug, Clone, PartialEq)]
pub enum LeafTest {
    Numeric { comparison: Comparison, value: f64 },
    Equals(u64),
    NotEquals(u64),
    In(HashSet<u64>),
    NotIn(HashSet<u64>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct CompiledLeaf {
    pub field: Field,
    pub test: LeafTest,
}

impl CompiledLeaf {
    pub fn new(field: Field, test: LeafTest) -> Self {
        Self { field, test }
    }

    fn evaluate(&self, event: &KillmailEvent) -> Result<bool, EvaluationError> {
        match &self.test {
            LeafTest::Numeric { comparison, value } => {
                let actual = self.field.numeric(event).ok_or_else(|| {
                    EvaluationError::Malformed(format!("numeric test on id field {}", self.field))
                })?;
                Ok(comparison.apply(actual, *value))
            }
            LeafTest::Equals(expected) => Ok(self.field.any_id(event, |id| id == *expected)),
            LeafTest::NotEquals(expected) => Ok(!self.field.any_id(event, |id| id == *expected)),
            LeafTest::In(set) => Ok(self.field.any_id(event, |id| set.contains(&id))),
            LeafTest::NotIn(set) => Ok(!self.field.any_id(event, |id| set.contains(&id))),
        }
    }

    fn to_criterion(&self) -> Criterion {
        let (operator, value) = match &self.test {
            LeafTest::Numeric { comparison, value } => (comparison.operator(), number(*value)),
            LeafTest::Equals(id) => (Operator::Eq, Value::from(*id)),
            LeafTest::NotEquals(id) => (Operator::Neq, Value::from(*id)),
            LeafTest::In(set) => (Operator::In, sorted_list(set)),
            LeafTest::NotIn(set) => (Operator::NotIn, sorted_list(set)),
        };
        Criterion::leaf(self.field.name(), operator.as_str(), value)
    }

    fn index_keys(&self) -> Option<BTreeSet<IndexKey>> {
        if !self.field.is_indexable() {
            return None;
        }
        let keys = match &self.test {
            LeafTest::Equals(id) => std::iter::once(IndexKey::new(self.field, *id)).collect(),
            LeafTest::In(set) => set.iter().map(|id| IndexKey::new(self.field, *id)).collect(),
            _ => return None,
        };
        Some(keys)
    }
}

fn number(value: f64) -> Value {
    if value.fract() == 0.0 && value.abs() < i64::MAX as f64 {
        Value::from(value as i64)
    } else {
        Value::from(value)
    }
}

fn sorted_list(set: &HashSet<u64>) -> Value {
    let mut ids: Vec<u64> = set.iter().copied().collect();
    ids.sort_unstable();
    Value::from(ids)
}

/// A (field, id) posting in the inverted profile index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct IndexKey {
    pub field: Field,
    pub value: u64,
}

impl IndexKey {
    pub fn new(field: Field, value: u64) -> Self {
        Self { field, value }
    }
}

/// A node of an executable predicate tree.
#[derive(Debug, Clone, PartialEq)]
pub enum PredicateNode {
    Leaf(CompiledLeaf),
    All(Vec<PredicateNode>),
    Any(Vec<PredicateNode>),
}

impl PredicateNode {
    fn evaluate(
        &self,
        event: &KillmailEvent,
        ctx: &mut EvalContext<'_>,
        depth: usize,
    ) -> Result<bool, EvaluationError> {
        ctx.enter(depth)?;
        match self {
            PredicateNode::Leaf(leaf) => {
                let result = leaf.evaluate(event)?;
                ctx.leaf_evaluated(leaf, result);
                Ok(result)
            }
            PredicateNode::All(children) => {
                if children.is_empty() {
                    return Err(EvaluationError::Malformed("empty AND node".to_string()));
                }
                for child in children {
                    if !child.evaluate(event, ctx, depth + 1)? {
                        return Ok(false);
                    }
                }
                Ok(true)
            }
            PredicateNode::Any(children) => {
                if children.is_empty() {
                    return Err(EvaluationError::Malformed("empty OR node".to_string()));
                }
                for child in children {
                    if child.evaluate(event, ctx, depth + 1)? {
                        return Ok(true);
                    }
                }
                Ok(false)
            }
        }
    }

    fn to_criterion(&self) -> Criterion {
        match self {
            PredicateNode::Leaf(leaf) => leaf.to_criterion(),
            PredicateNode::All(children) => {
                Criterion::and(children.iter().map(PredicateNode::to_criterion).collect())
            }
            PredicateNode::Any(children) => {
                Criterion::or(children.iter().map(PredicateNode::to_criterion).collect())
            }
        }
    }

    /// Postings such that any matching event hits at least one of them.
    /// `None` means the node cannot be narrowed by the index.
    fn index_keys(&self) -> Option<BTreeSet<IndexKey>> {
        match self {
            PredicateNode::Leaf(leaf) => leaf.index_keys(),
            // Any indexable conjunct is a necessary condition; take the narrowest.
            PredicateNode::All(children) => children
                .iter()
                .filter_map(PredicateNode::index_keys)
                .min_by_key(BTreeSet::len),
            PredicateNode::Any(children) => {
                let mut union = BTreeSet::new();
                for child in children {
                    union.extend(child.index_keys()?);
                }
                if union.is_empty() {
                    None
                } else {
                    Some(union)
                }
            }
        }
    }

    fn collect_fields(&self, fields: &mut BTreeSet<Field>) {
        match self {
            PredicateNode::Leaf(leaf) => {
                fields.insert(leaf.field);
            }
            PredicateNode::All(children) | PredicateNode::Any(children) => {
                for child in children {
                    child.collect_fields(fields);
                }
            }
        }
    }

    fn depth(&self) -> usize {
        match self {
            PredicateNode::Leaf(_) => 1,
            PredicateNode::All(children) | PredicateNode::Any(children) => {
                1 + children.iter().map(PredicateNode::depth).max().unwrap_or(0)
            }
        }
    }
}

/// A validated, executable filter tree.
///
/// Evaluation is pure: it reads the event and never mutates engine state.
#[derive(Debug, Clone, PartialEq)]
pub struct CompiledPredicate {
    root: PredicateNode,
    depth: usize,
}

impl CompiledPredicate {
    /// Wrap a node without validation. Structural faults surface as
    /// [`EvaluationError::Malformed`] at evaluation time.
    pub fn from_node(root: PredicateNode) -> Self {
        let depth = root.depth();
        Self { root, depth }
    }

    pub fn root(&self) -> &PredicateNode {
        &self.root
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    /// Evaluate against `event` within `ctx`'s budget.
    pub fn evaluate(
        &self,
        event: &KillmailEvent,
        ctx: &mut EvalContext<'_>,
    ) -> Result<bool, EvaluationError> {
        self.root.evaluate(event, ctx, 1)
    }

    /// Unbudgeted evaluation; faults count as a non-match.
    pub fn matches(&self, event: &KillmailEvent) -> bool {
        let mut ctx = EvalContext::new(Budget::unlimited());
        self.evaluate(event, &mut ctx).unwrap_or(false)
    }

    /// Serialise back to the declarative form.
    pub fn to_criterion(&self) -> Criterion {
        self.root.to_criterion()
    }

    pub fn referenced_fields(&self) -> BTreeSet<Field> {
        let mut fields = BTreeSet::new();
        self.root.collect_fields(&mut fields);
        fields
    }

    pub fn index_keys(&self) -> Option<BTreeSet<IndexKey>> {
        self.root.index_keys()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::Participant;
    use crate::matcher::CountingHook;

    fn leaf(field: Field, test: LeafTest) -> PredicateNode {
        PredicateNode::Leaf(CompiledLeaf::new(field, test))
    }

    fn event() -> KillmailEvent {
        KillmailEvent::new(7, 30000142, 150_000_000.0, Participant::new(1, 100, 587))
            .with_attacker(Participant::new(2, 200, 670).with_alliance(99))
    }

    #[test]
    fn test_multi_valued_semantics() {
        let e = event();
        assert!(CompiledPredicate::from_node(leaf(Field::ShipTypeId, LeafTest::Equals(670))).matches(&e));
        assert!(!CompiledPredicate::from_node(leaf(Field::ShipTypeId, LeafTest::NotEquals(670))).matches(&e));
        assert!(CompiledPredicate::from_node(leaf(Field::ShipTypeId, LeafTest::NotEquals(11))).matches(&e));
        assert!(!CompiledPredicate::from_node(leaf(Field::VictimShipTypeId, LeafTest::Equals(670))).matches(&e));

        let set: HashSet<u64> = [5, 99].into_iter().collect();
        assert!(CompiledPredicate::from_node(leaf(Field::AllianceId, LeafTest::In(set.clone()))).matches(&e));
        assert!(!CompiledPredicate::from_node(leaf(Field::AllianceId, LeafTest::NotIn(set))).matches(&e));
    }

    #[test]
    fn test_absent_victim_id_never_equal() {
        let e = event();
        let node = leaf(Field::VictimAllianceId, LeafTest::Equals(0));
        assert!(!CompiledPredicate::from_node(node).matches(&e));
        let node = leaf(Field::VictimAllianceId, LeafTest::NotEquals(0));
        assert!(CompiledPredicate::from_node(node).matches(&e));
    }

    #[test]
    fn test_and_short_circuits() {
        let hook = CountingHook::new();
        let predicate = CompiledPredicate::from_node(PredicateNode::All(vec![
            leaf(Field::SolarSystemId, LeafTest::Equals(1)),
            leaf(Field::ShipTypeId, LeafTest::Equals(670)),
            leaf(Field::TotalValue, LeafTest::Numeric { comparison: Comparison::Gt, value: 0.0 }),
        ]));
        let mut ctx = EvalContext::new(Budget::unlimited()).with_hook(&hook);
        assert!(!predicate.evaluate(&event(), &mut ctx).unwrap());
        assert_eq!(hook.visited(), vec![Field::SolarSystemId]);
    }

    #[test]
    fn test_or_short_circuits() {
        let hook = CountingHook::new();
        let predicate = CompiledPredicate::from_node(PredicateNode::Any(vec![
            leaf(Field::ParticipantCount, LeafTest::Numeric { comparison: Comparison::Lt, value: 10.0 }),
            leaf(Field::ShipTypeId, LeafTest::Equals(670)),
        ]));
        let mut ctx = EvalContext::new(Budget::unlimited()).with_hook(&hook);
        assert!(predicate.evaluate(&event(), &mut ctx).unwrap());
        assert_eq!(hook.count(), 1);
    }

    #[test]
    fn test_malformed_structures_error() {
        let predicate = CompiledPredicate::from_node(PredicateNode::All(vec![]));
        let mut ctx = EvalContext::new(Budget::unlimited());
        assert!(matches!(
            predicate.evaluate(&event(), &mut ctx),
            Err(EvaluationError::Malformed(_))
        ));

        let predicate = CompiledPredicate::from_node(leaf(
            Field::CharacterId,
            LeafTest::Numeric { comparison: Comparison::Gt, value: 1.0 },
        ));
        assert!(!predicate.matches(&event()));
    }

    #[test]
    fn test_depth_limit() {
        let mut node = leaf(Field::SolarSystemId, LeafTest::Equals(30000142));
        for _ in 0..5 {
            node = PredicateNode::All(vec![node]);
        }
        let predicate = CompiledPredicate::from_node(node);
        assert_eq!(predicate.depth(), 6);
        let mut ctx = EvalContext::new(Budget::new(None, 3));
        assert_eq!(
            predicate.evaluate(&event(), &mut ctx),
            Err(EvaluationError::DepthLimit(3))
        );
    }

    #[test]
    fn test_index_keys_derivation() {
        let and = CompiledPredicate::from_node(PredicateNode::All(vec![
            leaf(Field::SolarSystemId, LeafTest::Equals(30000142)),
            leaf(Field::ShipTypeId, LeafTest::In([670, 588].into_iter().collect())),
        ]));
        let keys = and.index_keys().unwrap();
        assert_eq!(keys.len(), 1);
        assert!(keys.contains(&IndexKey::new(Field::SolarSystemId, 30000142)));

        let or = CompiledPredicate::from_node(PredicateNode::Any(vec![
            leaf(Field::CharacterId, LeafTest::Equals(1)),
            leaf(Field::TotalValue, LeafTest::Numeric { comparison: Comparison::Gt, value: 1.0 }),
        ]));
        assert!(or.index_keys().is_none());

        let negative = CompiledPredicate::from_node(leaf(Field::CharacterId, LeafTest::NotEquals(1)));
        assert!(negative.index_keys().is_none());
    }

    #[test]
    fn test_to_criterion_sorts_lists_and_keeps_integers() {
        let predicate = CompiledPredicate::from_node(PredicateNode::All(vec![
            leaf(Field::ShipTypeId, LeafTest::In([670, 588].into_iter().collect())),
            leaf(Field::TotalValue, LeafTest::Numeric { comparison: Comparison::Gte, value: 5.0 }),
        ]));
        assert_eq!(
            predicate.to_criterion(),
            Criterion::and(vec![
                Criterion::leaf("ship_type_id", "in", vec![588u64, 670]),
                Criterion::leaf("total_value", "gte", 5i64),
            ])
        );
    }
}
