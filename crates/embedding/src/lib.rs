//! Embedding generation for the matching engine.
//!
//! Turns a subject's textual profile into a fixed-length vector via an
//! external provider, with the operational reality wrapped around the
//! call: bounded retry with exponential backoff, `Retry-After`-aware
//! rate-limit handling, a client-side token bucket, and per-call cost
//! accounting with a soft daily budget.
//!
//! The [`TextEmbedder`] trait is the seam the engine depends on; the
//! HTTP client and the deterministic stub both implement it, so tests
//! and offline runs swap providers without touching the orchestration.
//!
//! ## Example
//!
//! ```
//! use embedding::{build_embedder, EmbeddingConfig};
//!
//! # let rt = tokio::runtime::Runtime::new().unwrap();
//! # rt.block_on(async {
//! let embedder = build_embedder(&EmbeddingConfig::default()).unwrap();
//! let vector = embedder.embed("subject-1", "fiscal regime: FORFETTARIO").await.unwrap();
//! assert_eq!(vector.len(), embedder.dimension());
//! # });
//! ```

pub mod config;
pub mod cost;
pub mod error;
pub mod normalize;
pub mod provider;
pub mod rate_limit;
pub mod retry;
mod serde_millis;
pub mod stub;

use std::sync::Arc;

pub use config::{EmbeddingConfig, ProviderKind};
pub use cost::{CostConfig, CostStats, CostTracker};
pub use error::{EmbeddingError, ProviderFailure};
pub use provider::{HttpEmbeddingClient, TextEmbedder};
pub use rate_limit::{RateLimitConfig, RateLimitError, RateLimitStats, TokenBucket};
pub use retry::{retry_with_backoff, RetryConfig};
pub use stub::{stub_vector, StubEmbedder};

/// Builds the embedder the config asks for.
pub fn build_embedder(config: &EmbeddingConfig) -> Result<Arc<dyn TextEmbedder>, EmbeddingError> {
    config.validate()?;
    match config.mode.as_str() {
        "stub" => Ok(Arc::new(StubEmbedder::new(
            config.dimension,
            config.normalize,
        ))),
        "api" => Ok(Arc::new(HttpEmbeddingClient::new(config.clone())?)),
        other => Err(EmbeddingError::InvalidConfig(format!(
            "unknown embedding mode `{other}`"
        ))),
    }
}
