use thiserror::Error;

/// Errors surfaced by vector index implementations.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum IndexError {
    /// Backend unreachable or unusable. The orchestrator reacts by
    /// degrading to structured-only matching, never by failing the
    /// whole pass.
    #[error("vector index unavailable: {0}")]
    Unavailable(String),

    #[error("dimension mismatch: expected {expected}, got {got}")]
    DimensionMismatch { expected: usize, got: usize },

    #[error("graph construction failed: {0}")]
    Graph(String),
}

impl IndexError {
    pub(crate) fn poisoned() -> Self {
        IndexError::Unavailable("index lock poisoned".into())
    }
}
