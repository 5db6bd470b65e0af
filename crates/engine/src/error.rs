use criteria::RuleValidationError;
use embedding::EmbeddingError;
use index::IndexError;
use thiserror::Error;

/// Failure reported by one of the narrow store interfaces.
///
/// Stores are external collaborators; everything they can go wrong
/// with collapses to a backend message, except the optimistic version
/// check on checkpoints, which callers need to recognize.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("store backend error: {0}")]
    Backend(String),
    /// Checkpoint compare-and-set lost against another writer.
    #[error("version conflict: expected {expected}, found {found}")]
    VersionConflict { expected: u64, found: u64 },
}

impl StoreError {
    pub fn backend<E: std::fmt::Display>(err: E) -> Self {
        Self::Backend(err.to_string())
    }

    pub(crate) fn poisoned() -> Self {
        Self::Backend("store lock poisoned".into())
    }
}

/// Errors produced by the matching engine.
///
/// Pair-local failures (`MatchComputation`) are contained by callers:
/// the affected subject/rule pair is skipped and logged, the batch
/// continues. Systemic failures fail the batch with its cursor intact
/// so a restart resumes instead of recomputing.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid engine config: {0}")]
    InvalidConfig(String),

    /// Malformed condition tree, rejected before any evaluation runs.
    #[error("rule rejected: {0}")]
    Rule(#[from] RuleValidationError),

    #[error(transparent)]
    Store(#[from] StoreError),

    /// Another worker advanced or took over this batch's checkpoint.
    #[error("checkpoint conflict for batch {batch_id}: expected version {expected}, found {found}")]
    CheckpointConflict {
        batch_id: String,
        expected: u64,
        found: u64,
    },

    /// The running worker noticed its own checkpoint had not advanced
    /// within the stall timeout; it must stop and let a supervisor
    /// reclaim the batch.
    #[error("batch {batch_id} stalled: no checkpoint update for {idle_secs}s")]
    BatchStalled { batch_id: String, idle_secs: u64 },

    /// A batch is actively owned by another worker and not stalled.
    #[error("batch {batch_id} is owned by worker {owner}")]
    BatchOwned { batch_id: String, owner: String },

    /// Embedding provider and vector index both unavailable. Nothing
    /// semantic can be computed; the batch is failed with its cursor
    /// intact so any worker can resume it.
    #[error("systemic outage: {0}")]
    SystemicOutage(String),

    /// Catch-all for an unexpected evaluator/scoring failure on one
    /// subject/rule pair.
    #[error("match computation failed for subject {subject_id}, rule {rule_id}: {reason}")]
    MatchComputation {
        subject_id: String,
        rule_id: String,
        reason: String,
    },

    #[error("embedding error: {0}")]
    Embedding(#[from] EmbeddingError),

    #[error("index error: {0}")]
    Index(#[from] IndexError),
}
