//! Declarative filter trees as authored by profile owners.
//!
//! ```json
//! {"condition": "and",
//!  "rules": [
//!    {"field": "solar_system_id", "operator": "eq", "value": 30000142},
//!    {"field": "ship_type_id", "operator": "in", "value": [670, 588]}
//!  ]}
//! ```
//!
//! Field and operator names stay as raw strings here; the compiler resolves
//! them so unknown names are reported as compilation errors rather than
//! parse failures.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::DefinitionError;

/// Boolean connective of a composite node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Condition {
    And,
    Or,
}

/// A node of a filter tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Criterion {
    Composite {
        condition: Condition,
        rules: Vec<Criterion>,
    },
    Leaf {
        field: String,
        operator: String,
        value: Value,
    },
}

impl Criterion {
    pub fn leaf(field: &str, operator: &str, value: impl Into<Value>) -> Self {
        Criterion::Leaf {
            field: field.to_string(),
            operator: operator.to_string(),
            value: value.into(),
        }
    }

    pub fn and(rules: Vec<Criterion>) -> Self {
        Criterion::Composite {
            condition: Condition::And,
            rules,
        }
    }

    pub fn or(rules: Vec<Criterion>) -> Self {
        Criterion::Composite {
            condition: Condition::Or,
            rules,
        }
    }

    pub fn from_json(input: &str) -> Result<Self, DefinitionError> {
        Ok(serde_json::from_str(input)?)
    }

    pub fn to_json(&self) -> Value {
        // Criterion only holds strings, enums and JSON values.
        serde_json::to_value(self).unwrap_or(Value::Null)
    }

    /// Nesting depth; a lone leaf has depth 1.
    pub fn depth(&self) -> usize {
        match self {
            Criterion::Leaf { .. } => 1,
            Criterion::Composite { rules, .. } => {
                1 + rules.iter().map(Criterion::depth).max().unwrap_or(0)
            }
        }
    }
}
