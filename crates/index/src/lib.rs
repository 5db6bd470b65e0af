//! # Rulescope Index
//!
//! In-process approximate-nearest-neighbor index over subject profile
//! vectors, used by the matching engine for the semantic pass.
//!
//! ## Core Features
//!
//! - **Pluggable Access**: Callers depend on the [`VectorIndex`] trait,
//!   so tests can substitute fakes that fail or return canned
//!   neighbors without touching the engine.
//! - **Upsert Semantics**: Re-inserting a subject id replaces its
//!   vector. The index never holds two entries for the same subject.
//! - **Adaptive Search**: Small populations are scanned exactly; once
//!   the population crosses [`IndexConfig::min_vectors_for_graph`] an
//!   HNSW graph is built lazily on the next query.
//! - **Deterministic Results**: Query output is ordered by similarity
//!   descending with subject-id ascending tie-breaks, so equal inputs
//!   always produce equal output.
//!
//! ## Distance Metrics
//!
//! [`SimilarityMetric::Cosine`] (default) maps distances into `[0, 1]`
//! where higher means more similar. [`SimilarityMetric::InnerProduct`]
//! reports raw dot products, which preserve ranking but are unbounded
//! for unnormalized vectors.
//!
//! ## Example Usage
//!
//! ```
//! use index::{HnswIndex, IndexConfig, VectorIndex};
//!
//! let rt = tokio::runtime::Runtime::new().unwrap();
//! rt.block_on(async {
//!     let index = HnswIndex::new(IndexConfig::new(3)).unwrap();
//!     index.upsert("subject-1", &[1.0, 0.0, 0.0]).await.unwrap();
//!     index.upsert("subject-2", &[0.0, 1.0, 0.0]).await.unwrap();
//!
//!     let hits = index.query(&[0.9, 0.1, 0.0], 1).await.unwrap();
//!     assert_eq!(hits[0].subject_id, "subject-1");
//! });
//! ```

mod config;
mod error;
mod hnsw;

use async_trait::async_trait;

pub use config::{IndexConfig, SimilarityMetric};
pub use error::IndexError;
pub use hnsw::HnswIndex;

/// A single query hit: the subject the vector belongs to and its
/// similarity to the query vector under the index's metric.
#[derive(Debug, Clone, PartialEq)]
pub struct Neighbor {
    pub subject_id: String,
    pub similarity: f32,
}

/// Storage-agnostic vector index surface.
///
/// Implementations must keep similarity monotonic: a neighbor that is
/// closer to the query never reports a lower similarity than one that
/// is farther away.
#[async_trait]
pub trait VectorIndex: Send + Sync {
    /// Insert or replace the vector for `subject_id`.
    async fn upsert(&self, subject_id: &str, vector: &[f32]) -> Result<(), IndexError>;

    /// Return up to `top_k` nearest neighbors, most similar first.
    async fn query(&self, vector: &[f32], top_k: usize) -> Result<Vec<Neighbor>, IndexError>;

    /// Number of subjects currently indexed.
    async fn len(&self) -> Result<usize, IndexError>;
}
