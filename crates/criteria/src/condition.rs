//! Condition-tree shape and load-time validation.
//!
//! Trees are stored as data alongside the rule (JSON in practice), so
//! the enum is serde-tagged and [`parse_condition`] turns raw JSON into
//! a validated tree in one step. Everything structurally wrong is
//! reported as a [`RuleValidationError`] here; evaluation never has to
//! deal with malformed input.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::RuleValidationError;

/// Maximum nesting depth accepted by [`validate`].
pub const MAX_CONDITION_DEPTH: usize = 32;

/// Comparison operator of a leaf condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompareOp {
    #[serde(rename = "=")]
    Eq,
    #[serde(rename = "!=")]
    Ne,
    #[serde(rename = "in")]
    In,
    #[serde(rename = ">")]
    Gt,
    #[serde(rename = ">=")]
    Gte,
    #[serde(rename = "<")]
    Lt,
    #[serde(rename = "<=")]
    Lte,
    #[serde(rename = "prefix_match")]
    PrefixMatch,
}

impl CompareOp {
    /// Operator symbol as it appears in stored rules.
    pub fn symbol(&self) -> &'static str {
        match self {
            CompareOp::Eq => "=",
            CompareOp::Ne => "!=",
            CompareOp::In => "in",
            CompareOp::Gt => ">",
            CompareOp::Gte => ">=",
            CompareOp::Lt => "<",
            CompareOp::Lte => "<=",
            CompareOp::PrefixMatch => "prefix_match",
        }
    }
}

/// One node of a rule's condition tree.
///
/// The tagged representation keeps stored rules readable:
///
/// ```json
/// {
///   "type": "and",
///   "children": [
///     { "type": "comparison", "field": "regime", "op": "=", "value": "FORFETTARIO" },
///     { "type": "comparison", "field": "employees", "op": "<", "value": 10 }
///   ]
/// }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ConditionNode {
    Comparison {
        field: String,
        op: CompareOp,
        value: Value,
    },
    And {
        children: Vec<ConditionNode>,
    },
    Or {
        children: Vec<ConditionNode>,
    },
    Not {
        child: Box<ConditionNode>,
    },
}

impl ConditionNode {
    /// Leaf constructor, mostly for tests and rule builders.
    pub fn comparison(field: impl Into<String>, op: CompareOp, value: Value) -> Self {
        ConditionNode::Comparison {
            field: field.into(),
            op,
            value,
        }
    }
}

/// Decodes a raw JSON value into a validated condition tree.
///
/// Unknown node types and unknown operators fail serde decoding and are
/// reported as [`RuleValidationError::Malformed`]; structural problems
/// go through [`validate`].
pub fn parse_condition(raw: &Value) -> Result<ConditionNode, RuleValidationError> {
    let node: ConditionNode = serde_json::from_value(raw.clone())
        .map_err(|e| RuleValidationError::Malformed {
            reason: e.to_string(),
        })?;
    validate(&node)?;
    Ok(node)
}

/// Structural validation of a condition tree.
///
/// Checks field names, operand types per operator, branch arity, and
/// nesting depth. A tree that passes here evaluates without errors for
/// any attribute map.
pub fn validate(node: &ConditionNode) -> Result<(), RuleValidationError> {
    validate_at(node, 0)
}

fn validate_at(node: &ConditionNode, depth: usize) -> Result<(), RuleValidationError> {
    if depth > MAX_CONDITION_DEPTH {
        return Err(RuleValidationError::TooDeep {
            max: MAX_CONDITION_DEPTH,
        });
    }
    match node {
        ConditionNode::Comparison { field, op, value } => validate_comparison(field, *op, value),
        ConditionNode::And { children } => {
            if children.is_empty() {
                return Err(RuleValidationError::EmptyBranch { node: "and" });
            }
            children
                .iter()
                .try_for_each(|child| validate_at(child, depth + 1))
        }
        ConditionNode::Or { children } => {
            if children.is_empty() {
                return Err(RuleValidationError::EmptyBranch { node: "or" });
            }
            children
                .iter()
                .try_for_each(|child| validate_at(child, depth + 1))
        }
        ConditionNode::Not { child } => validate_at(child, depth + 1),
    }
}

fn validate_comparison(
    field: &str,
    op: CompareOp,
    value: &Value,
) -> Result<(), RuleValidationError> {
    if field.trim().is_empty() {
        return Err(RuleValidationError::EmptyField);
    }
    if value.is_null() {
        return Err(RuleValidationError::NullOperand {
            field: field.to_string(),
        });
    }
    match op {
        CompareOp::In => {
            if !value.is_array() {
                return Err(operand_type(op, field, "an array", value));
            }
        }
        CompareOp::Gt | CompareOp::Gte | CompareOp::Lt | CompareOp::Lte => {
            if !value.is_number() {
                return Err(operand_type(op, field, "a number", value));
            }
        }
        CompareOp::PrefixMatch => {
            if !value.is_string() {
                return Err(operand_type(op, field, "a string", value));
            }
        }
        CompareOp::Eq | CompareOp::Ne => {}
    }
    Ok(())
}

fn operand_type(op: CompareOp, field: &str, expected: &'static str, got: &Value) -> RuleValidationError {
    RuleValidationError::OperandType {
        op: op.symbol(),
        field: field.to_string(),
        expected,
        got: json_kind(got),
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
