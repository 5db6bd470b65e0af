//! Pure evaluation of condition trees against attribute maps.
//!
//! Evaluation is deterministic and total: the same tree and the same
//! attribute map always produce the same boolean, and nothing here can
//! fail at runtime. A missing or null attribute makes its comparison
//! false; whether that sinks the whole rule depends on the surrounding
//! boolean structure, exactly like any other false leaf.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};

use serde_json::Value;

use crate::condition::{CompareOp, ConditionNode};

/// Attribute map of a subject, keyed by attribute name.
///
/// `BTreeMap` keeps iteration order stable, which matters downstream
/// for reproducible profile text and ranked output.
pub type AttributeMap = BTreeMap<String, Value>;

/// Outcome of evaluating one condition tree against one subject.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Evaluation {
    /// Whether the tree as a whole matched.
    pub matched: bool,
    /// Fields with a present value whose comparison contributed truth.
    /// Absence-satisfied leaves (a missing field under `not`) are not
    /// listed: nothing on the subject actually satisfied them.
    pub matched_fields: BTreeSet<String>,
    /// Referenced fields that were absent or null on the subject.
    pub missing_fields: BTreeSet<String>,
    /// Every field the tree references.
    pub referenced_fields: BTreeSet<String>,
}

impl Evaluation {
    /// True when the subject had no usable value for any field the
    /// tree references. Such subjects are candidates for the semantic
    /// pass rather than a definitive structural non-match.
    pub fn all_fields_missing(&self) -> bool {
        !self.referenced_fields.is_empty()
            && self.missing_fields.len() == self.referenced_fields.len()
    }
}

/// Evaluates a condition tree against a subject's attributes.
pub fn evaluate(node: &ConditionNode, attributes: &AttributeMap) -> bool {
    evaluate_detailed(node, attributes).matched
}

/// Evaluates a condition tree and reports which fields were involved.
///
/// The walk visits every node even when the boolean outcome is already
/// decided, so `matched_fields` / `missing_fields` always describe the
/// whole tree, not a short-circuited prefix of it.
pub fn evaluate_detailed(node: &ConditionNode, attributes: &AttributeMap) -> Evaluation {
    let mut eval = Evaluation::default();
    eval.matched = walk(node, attributes, true, &mut eval);
    eval
}

/// `polarity` tracks enclosing `not` nodes: under an odd number of
/// negations a leaf contributes truth by evaluating false.
fn walk(node: &ConditionNode, attributes: &AttributeMap, polarity: bool, out: &mut Evaluation) -> bool {
    match node {
        ConditionNode::Comparison { field, op, value } => {
            out.referenced_fields.insert(field.clone());
            let attr = attributes.get(field).filter(|v| !v.is_null());
            if attr.is_none() {
                out.missing_fields.insert(field.clone());
            }
            let result = compare(attr, *op, value);
            let effective = if polarity { result } else { !result };
            if effective && attr.is_some() {
                out.matched_fields.insert(field.clone());
            }
            result
        }
        ConditionNode::And { children } => {
            let mut all = true;
            for child in children {
                all &= walk(child, attributes, polarity, out);
            }
            all
        }
        ConditionNode::Or { children } => {
            let mut any = false;
            for child in children {
                any |= walk(child, attributes, polarity, out);
            }
            any
        }
        ConditionNode::Not { child } => !walk(child, attributes, !polarity, out),
    }
}

fn compare(attr: Option<&Value>, op: CompareOp, operand: &Value) -> bool {
    let value = match attr {
        Some(v) => v,
        None => return false,
    };
    match op {
        CompareOp::Eq => values_equal(value, operand),
        CompareOp::Ne => !values_equal(value, operand),
        CompareOp::In => match operand.as_array() {
            Some(set) => match value {
                // Array-valued attributes match on any overlap, so
                // `properties in ["CAPANNONE"]` holds for a subject
                // owning several property kinds.
                Value::Array(items) => items
                    .iter()
                    .any(|item| set.iter().any(|candidate| values_equal(item, candidate))),
                other => set.iter().any(|candidate| values_equal(other, candidate)),
            },
            None => false,
        },
        CompareOp::Gt => matches!(numeric_cmp(value, operand), Some(Ordering::Greater)),
        CompareOp::Gte => matches!(
            numeric_cmp(value, operand),
            Some(Ordering::Greater | Ordering::Equal)
        ),
        CompareOp::Lt => matches!(numeric_cmp(value, operand), Some(Ordering::Less)),
        CompareOp::Lte => matches!(
            numeric_cmp(value, operand),
            Some(Ordering::Less | Ordering::Equal)
        ),
        CompareOp::PrefixMatch => match (value, operand) {
            (Value::String(s), Value::String(prefix)) => s.starts_with(prefix.as_str()),
            _ => false,
        },
    }
}

/// Equality with numeric unification (`1` equals `1.0`) and
/// order-insensitive comparison for arrays.
fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(_), Value::Number(_)) => match (a.as_f64(), b.as_f64()) {
            (Some(x), Some(y)) => x == y,
            _ => false,
        },
        (Value::Array(xs), Value::Array(ys)) => {
            xs.iter().all(|x| ys.iter().any(|y| values_equal(x, y)))
                && ys.iter().all(|y| xs.iter().any(|x| values_equal(x, y)))
        }
        _ => a == b,
    }
}

fn numeric_cmp(a: &Value, b: &Value) -> Option<Ordering> {
    let a = a.as_f64()?;
    let b = b.as_f64()?;
    a.partial_cmp(&b)
}
