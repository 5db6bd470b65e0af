//! Deterministic rule-condition evaluation.
//!
//! A rule's applicability criteria are written as a small boolean tree
//! (`and` / `or` / `not` over field comparisons) stored as data next to
//! the rule. This crate owns the tree's shape, its load-time
//! validation, and its evaluation against a subject's attribute map.
//!
//! Evaluation is pure and total: missing or null attributes make the
//! containing comparison false, they never raise. Anything structurally
//! wrong with a tree is caught by [`validate`] (or [`parse_condition`])
//! when the rule is loaded, so a live matching pass only ever sees
//! well-formed trees.
//!
//! ## Example
//!
//! ```
//! use criteria::{evaluate, parse_condition};
//! use serde_json::json;
//!
//! let tree = parse_condition(&json!({
//!     "type": "comparison",
//!     "field": "regime",
//!     "op": "=",
//!     "value": "FORFETTARIO"
//! }))
//! .unwrap();
//!
//! let mut attrs = criteria::AttributeMap::new();
//! attrs.insert("regime".into(), json!("FORFETTARIO"));
//! assert!(evaluate(&tree, &attrs));
//! ```

pub mod condition;
pub mod error;
pub mod evaluate;

pub use condition::{parse_condition, validate, CompareOp, ConditionNode, MAX_CONDITION_DEPTH};
pub use error::RuleValidationError;
pub use evaluate::{evaluate, evaluate_detailed, AttributeMap, Evaluation};
