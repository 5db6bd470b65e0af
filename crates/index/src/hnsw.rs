//! In-process HNSW index with an exact-scan fallback.
//!
//! Inserts buffer vectors and mark the graph dirty; the next query
//! rebuilds it on demand. Below `min_vectors_for_graph` the graph is
//! skipped entirely and queries run an exact linear scan, which at
//! small populations is both faster and recall-perfect.
//!
//! Upserting an existing id replaces its vector in place; slots are
//! stable, so a rebuilt graph keeps mapping origin ids to the same
//! subjects.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use hnsw_rs::prelude::*;

use crate::config::{IndexConfig, SimilarityMetric};
use crate::error::IndexError;
use crate::{Neighbor, VectorIndex};

enum Graph {
    Cosine(Hnsw<'static, f32, DistCosine>),
    Dot(Hnsw<'static, f32, DistDot>),
}

struct Inner {
    slots: Vec<Vec<f32>>,
    ids: Vec<String>,
    by_id: HashMap<String, usize>,
    graph: Option<Graph>,
    dirty: bool,
}

pub struct HnswIndex {
    config: IndexConfig,
    inner: RwLock<Inner>,
}

impl HnswIndex {
    pub fn new(config: IndexConfig) -> Result<Self, IndexError> {
        config.validate()?;
        Ok(Self {
            config,
            inner: RwLock::new(Inner {
                slots: Vec::new(),
                ids: Vec::new(),
                by_id: HashMap::new(),
                graph: None,
                dirty: false,
            }),
        })
    }

    pub fn config(&self) -> &IndexConfig {
        &self.config
    }

    fn rebuild(&self, inner: &mut Inner) {
        let nb_elem = inner.slots.len();
        // HNSW needs a real population to form layers; below that the
        // linear scan serves queries.
        if nb_elem < 10 || !self.config.use_graph(nb_elem) {
            inner.graph = None;
            inner.dirty = false;
            return;
        }

        let nb_layer = 16.min((nb_elem as f32).ln().trunc() as usize).max(1);
        let data: Vec<(&Vec<f32>, usize)> = inner
            .slots
            .iter()
            .enumerate()
            .map(|(slot, vector)| (vector, slot))
            .collect();

        let graph = match self.config.metric {
            SimilarityMetric::Cosine => {
                let hnsw = Hnsw::<f32, DistCosine>::new(
                    self.config.m,
                    nb_elem,
                    nb_layer,
                    self.config.ef_construction,
                    DistCosine {},
                );
                hnsw.parallel_insert(&data);
                Graph::Cosine(hnsw)
            }
            SimilarityMetric::InnerProduct => {
                let hnsw = Hnsw::<f32, DistDot>::new(
                    self.config.m,
                    nb_elem,
                    nb_layer,
                    self.config.ef_construction,
                    DistDot {},
                );
                hnsw.parallel_insert(&data);
                Graph::Dot(hnsw)
            }
        };
        inner.graph = Some(graph);
        inner.dirty = false;
        tracing::debug!(vectors = nb_elem, "vector graph rebuilt");
    }

    fn search_inner(&self, inner: &Inner, query: &[f32], top_k: usize) -> Vec<Neighbor> {
        let mut hits = match &inner.graph {
            Some(graph) => {
                let ef = self.config.ef_search.max(top_k);
                let neighbours = match graph {
                    Graph::Cosine(hnsw) => hnsw.search(query, top_k, ef),
                    Graph::Dot(hnsw) => hnsw.search(query, top_k, ef),
                };
                neighbours
                    .into_iter()
                    .filter_map(|neighbour| {
                        let slot = neighbour.get_origin_id();
                        inner.ids.get(slot).map(|id| Neighbor {
                            subject_id: id.clone(),
                            similarity: self.distance_to_similarity(neighbour.distance),
                        })
                    })
                    .collect::<Vec<_>>()
            }
            None => inner
                .slots
                .iter()
                .zip(inner.ids.iter())
                .map(|(vector, id)| Neighbor {
                    subject_id: id.clone(),
                    similarity: self.pair_similarity(query, vector),
                })
                .collect(),
        };

        // Deterministic output: similarity descending, id ascending on
        // ties, regardless of insertion order or graph traversal.
        hits.sort_by(|a, b| {
            b.similarity
                .partial_cmp(&a.similarity)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.subject_id.cmp(&b.subject_id))
        });
        hits.truncate(top_k);
        hits
    }

    fn distance_to_similarity(&self, distance: f32) -> f32 {
        match self.config.metric {
            SimilarityMetric::Cosine => (1.0 - distance).clamp(0.0, 1.0),
            // DistDot reports 1 - dot; undo it. Unnormalized vectors
            // may exceed 1.0, which is fine: ranking only needs
            // monotonicity.
            SimilarityMetric::InnerProduct => 1.0 - distance,
        }
    }

    fn pair_similarity(&self, a: &[f32], b: &[f32]) -> f32 {
        let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
        match self.config.metric {
            SimilarityMetric::Cosine => {
                let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
                let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
                if norm_a == 0.0 || norm_b == 0.0 {
                    return 0.0;
                }
                (dot / (norm_a * norm_b)).clamp(0.0, 1.0)
            }
            SimilarityMetric::InnerProduct => dot,
        }
    }
}

#[async_trait]
impl VectorIndex for HnswIndex {
    async fn upsert(&self, subject_id: &str, vector: &[f32]) -> Result<(), IndexError> {
        if vector.len() != self.config.dimension {
            return Err(IndexError::DimensionMismatch {
                expected: self.config.dimension,
                got: vector.len(),
            });
        }
        let mut inner = self.inner.write().map_err(|_| IndexError::poisoned())?;
        match inner.by_id.get(subject_id).copied() {
            Some(slot) => {
                inner.slots[slot] = vector.to_vec();
            }
            None => {
                let slot = inner.slots.len();
                inner.slots.push(vector.to_vec());
                inner.ids.push(subject_id.to_string());
                inner.by_id.insert(subject_id.to_string(), slot);
            }
        }
        inner.dirty = true;
        Ok(())
    }

    async fn query(&self, vector: &[f32], top_k: usize) -> Result<Vec<Neighbor>, IndexError> {
        if vector.len() != self.config.dimension {
            return Err(IndexError::DimensionMismatch {
                expected: self.config.dimension,
                got: vector.len(),
            });
        }
        if top_k == 0 {
            return Ok(Vec::new());
        }
        {
            let inner = self.inner.read().map_err(|_| IndexError::poisoned())?;
            if !inner.dirty {
                return Ok(self.search_inner(&inner, vector, top_k));
            }
        }
        let mut inner = self.inner.write().map_err(|_| IndexError::poisoned())?;
        if inner.dirty {
            self.rebuild(&mut inner);
        }
        Ok(self.search_inner(&inner, vector, top_k))
    }

    async fn len(&self) -> Result<usize, IndexError> {
        let inner = self.inner.read().map_err(|_| IndexError::poisoned())?;
        Ok(inner.slots.len())
    }
}
