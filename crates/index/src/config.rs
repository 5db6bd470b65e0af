use serde::{Deserialize, Serialize};

use crate::error::IndexError;

/// Distance family the index ranks by. Whatever the choice, query
/// results come back as similarity where higher means more similar.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SimilarityMetric {
    #[default]
    Cosine,
    InnerProduct,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct IndexConfig {
    /// Vector length; every upsert and query must match it.
    pub dimension: usize,

    #[serde(default)]
    pub metric: SimilarityMetric,

    /// Neighbors per graph node (higher = better recall, slower build).
    #[serde(default = "default_m")]
    pub m: usize,

    /// Candidate-list size during construction.
    #[serde(default = "default_ef_construction")]
    pub ef_construction: usize,

    /// Candidate-list size during search.
    #[serde(default = "default_ef_search")]
    pub ef_search: usize,

    /// Below this population an exact linear scan is used instead of
    /// the graph; building HNSW over a handful of vectors buys
    /// nothing.
    #[serde(default = "default_min_vectors_for_graph")]
    pub min_vectors_for_graph: usize,
}

fn default_m() -> usize {
    16
}

fn default_ef_construction() -> usize {
    200
}

fn default_ef_search() -> usize {
    50
}

fn default_min_vectors_for_graph() -> usize {
    1000
}

impl IndexConfig {
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension,
            metric: SimilarityMetric::default(),
            m: default_m(),
            ef_construction: default_ef_construction(),
            ef_search: default_ef_search(),
            min_vectors_for_graph: default_min_vectors_for_graph(),
        }
    }

    pub fn with_metric(mut self, metric: SimilarityMetric) -> Self {
        self.metric = metric;
        self
    }

    pub fn with_m(mut self, m: usize) -> Self {
        self.m = m;
        self
    }

    pub fn with_ef_search(mut self, ef_search: usize) -> Self {
        self.ef_search = ef_search;
        self
    }

    pub fn with_min_vectors_for_graph(mut self, min: usize) -> Self {
        self.min_vectors_for_graph = min;
        self
    }

    pub fn validate(&self) -> Result<(), IndexError> {
        if self.dimension == 0 {
            return Err(IndexError::Graph("dimension must be positive".into()));
        }
        if self.m == 0 || self.ef_construction == 0 || self.ef_search == 0 {
            return Err(IndexError::Graph(
                "m, ef_construction and ef_search must be positive".into(),
            ));
        }
        Ok(())
    }

    /// Whether the graph is worth using at the given population.
    pub fn use_graph(&self, num_vectors: usize) -> bool {
        num_vectors >= self.min_vectors_for_graph
    }
}
