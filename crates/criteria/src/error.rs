use thiserror::Error;

/// Rejection reasons for a malformed condition tree.
///
/// These surface when a rule is loaded, never while a pass is
/// evaluating: a rule that fails validation is excluded up front, so a
/// bad tree cannot silently match nothing in the middle of a batch.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum RuleValidationError {
    /// A comparison leaf names no field.
    #[error("comparison field name is empty")]
    EmptyField,

    /// An `and` / `or` branch carries no children.
    #[error("`{node}` node has no children")]
    EmptyBranch { node: &'static str },

    /// Operand type is incompatible with the operator.
    #[error("operator `{op}` on field `{field}` requires {expected}, got {got}")]
    OperandType {
        op: &'static str,
        field: String,
        expected: &'static str,
        got: &'static str,
    },

    /// Comparison operand is JSON null.
    #[error("comparison operand for field `{field}` is null")]
    NullOperand { field: String },

    /// Nesting beyond the accepted depth, usually a sign of generated
    /// or corrupted rule data.
    #[error("condition tree exceeds maximum depth {max}")]
    TooDeep { max: usize },

    /// The raw JSON did not decode into a known node shape. Covers
    /// unknown operators and unknown node types.
    #[error("condition tree is malformed: {reason}")]
    Malformed { reason: String },
}
