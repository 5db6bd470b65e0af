use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::EngineError;

/// Tuning knobs for the matching orchestrator.
///
/// Serde-friendly so deployments can ship it as part of a larger
/// config file; every field has a safe default.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EngineConfig {
    /// Minimum similarity for a semantic hit to become a match.
    #[serde(default = "EngineConfig::default_min_similarity")]
    pub min_similarity: f32,
    /// How many neighbors to pull from the vector index per rule.
    #[serde(default = "EngineConfig::default_top_k")]
    pub top_k: usize,
    /// Score deducted per referenced attribute the subject was missing
    /// while still matching structurally.
    #[serde(default = "EngineConfig::default_missing_attribute_decay")]
    pub missing_attribute_decay: f32,
    /// Lowest score a structured match can decay to.
    #[serde(default = "EngineConfig::default_structured_floor")]
    pub structured_floor: f32,
    /// Ceiling for semantic-only scores. Must stay below
    /// `structured_floor` so structured evidence always outranks
    /// semantic-only evidence.
    #[serde(default = "EngineConfig::default_semantic_cap")]
    pub semantic_cap: f32,
    /// Units of work (rules or subjects) per checkpointed chunk.
    #[serde(default = "EngineConfig::default_scan_chunk_size")]
    pub scan_chunk_size: usize,
    /// Subjects per chunk during vector refresh; each chunk's vectors
    /// are committed before the next starts.
    #[serde(default = "EngineConfig::default_refresh_chunk_size")]
    pub refresh_chunk_size: usize,
    /// Hard per-call budget for embedding requests.
    #[serde(
        with = "crate::serde_millis",
        default = "EngineConfig::default_embed_timeout"
    )]
    pub embed_timeout: Duration,
    /// Hard per-call budget for index queries.
    #[serde(
        with = "crate::serde_millis",
        default = "EngineConfig::default_index_timeout"
    )]
    pub index_timeout: Duration,
    /// A `RUNNING` batch whose checkpoint has not moved for this long
    /// is considered abandoned and may be reclaimed.
    #[serde(
        with = "crate::serde_millis",
        default = "EngineConfig::default_stall_timeout"
    )]
    pub stall_timeout: Duration,
    /// Identity written into checkpoints this worker owns.
    #[serde(default = "EngineConfig::default_worker_id")]
    pub worker_id: String,
    /// Capacity of the per-rule descriptive-vector cache.
    #[serde(default = "EngineConfig::default_rule_vector_cache_size")]
    pub rule_vector_cache_size: usize,
}

impl EngineConfig {
    pub(crate) fn default_min_similarity() -> f32 {
        0.75
    }

    pub(crate) fn default_top_k() -> usize {
        50
    }

    pub(crate) fn default_missing_attribute_decay() -> f32 {
        0.02
    }

    pub(crate) fn default_structured_floor() -> f32 {
        0.90
    }

    pub(crate) fn default_semantic_cap() -> f32 {
        0.89
    }

    pub(crate) fn default_scan_chunk_size() -> usize {
        100
    }

    pub(crate) fn default_refresh_chunk_size() -> usize {
        64
    }

    pub(crate) fn default_embed_timeout() -> Duration {
        Duration::from_secs(10)
    }

    pub(crate) fn default_index_timeout() -> Duration {
        Duration::from_secs(2)
    }

    pub(crate) fn default_stall_timeout() -> Duration {
        Duration::from_secs(600)
    }

    pub(crate) fn default_worker_id() -> String {
        "worker-0".to_string()
    }

    pub(crate) fn default_rule_vector_cache_size() -> usize {
        256
    }

    pub fn with_min_similarity(mut self, min_similarity: f32) -> Self {
        self.min_similarity = min_similarity;
        self
    }

    pub fn with_top_k(mut self, top_k: usize) -> Self {
        self.top_k = top_k;
        self
    }

    pub fn with_scan_chunk_size(mut self, size: usize) -> Self {
        self.scan_chunk_size = size;
        self
    }

    pub fn with_refresh_chunk_size(mut self, size: usize) -> Self {
        self.refresh_chunk_size = size;
        self
    }

    pub fn with_stall_timeout(mut self, timeout: Duration) -> Self {
        self.stall_timeout = timeout;
        self
    }

    pub fn with_worker_id(mut self, worker_id: impl Into<String>) -> Self {
        self.worker_id = worker_id.into();
        self
    }

    /// Validate invariants between the knobs.
    pub fn validate(&self) -> Result<(), EngineError> {
        if !(self.min_similarity > 0.0 && self.min_similarity <= 1.0) {
            return Err(EngineError::InvalidConfig(
                "min_similarity must be in (0.0, 1.0]".into(),
            ));
        }
        if self.top_k == 0 {
            return Err(EngineError::InvalidConfig(
                "top_k must be greater than zero".into(),
            ));
        }
        if self.missing_attribute_decay < 0.0 {
            return Err(EngineError::InvalidConfig(
                "missing_attribute_decay must be >= 0.0".into(),
            ));
        }
        if !(self.structured_floor > 0.0 && self.structured_floor <= 1.0) {
            return Err(EngineError::InvalidConfig(
                "structured_floor must be in (0.0, 1.0]".into(),
            ));
        }
        if self.semantic_cap >= self.structured_floor {
            return Err(EngineError::InvalidConfig(
                "semantic_cap must be below structured_floor".into(),
            ));
        }
        if self.semantic_cap <= 0.0 {
            return Err(EngineError::InvalidConfig(
                "semantic_cap must be positive".into(),
            ));
        }
        if self.scan_chunk_size == 0 || self.refresh_chunk_size == 0 {
            return Err(EngineError::InvalidConfig(
                "chunk sizes must be greater than zero".into(),
            ));
        }
        if self.embed_timeout.is_zero() || self.index_timeout.is_zero() {
            return Err(EngineError::InvalidConfig(
                "per-call timeouts must be greater than zero".into(),
            ));
        }
        if self.stall_timeout.is_zero() {
            return Err(EngineError::InvalidConfig(
                "stall_timeout must be greater than zero".into(),
            ));
        }
        if self.worker_id.trim().is_empty() {
            return Err(EngineError::InvalidConfig(
                "worker_id must not be empty".into(),
            ));
        }
        if self.rule_vector_cache_size == 0 {
            return Err(EngineError::InvalidConfig(
                "rule_vector_cache_size must be greater than zero".into(),
            ));
        }
        Ok(())
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            min_similarity: Self::default_min_similarity(),
            top_k: Self::default_top_k(),
            missing_attribute_decay: Self::default_missing_attribute_decay(),
            structured_floor: Self::default_structured_floor(),
            semantic_cap: Self::default_semantic_cap(),
            scan_chunk_size: Self::default_scan_chunk_size(),
            refresh_chunk_size: Self::default_refresh_chunk_size(),
            embed_timeout: Self::default_embed_timeout(),
            index_timeout: Self::default_index_timeout(),
            stall_timeout: Self::default_stall_timeout(),
            worker_id: Self::default_worker_id(),
            rule_vector_cache_size: Self::default_rule_vector_cache_size(),
        }
    }
}
