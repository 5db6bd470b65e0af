//! Deterministic offline embedder.
//!
//! Hash-seeded sinusoid vectors: reproducible, cheap, and spread out
//! enough that distinct texts land on distinct directions. Used by
//! tests and by deployments that want the pipeline wired up before a
//! provider account exists.

use async_trait::async_trait;
use fxhash::hash64;

use crate::error::EmbeddingError;
use crate::normalize::l2_normalize_in_place;
use crate::provider::TextEmbedder;

#[derive(Debug, Clone)]
pub struct StubEmbedder {
    dimension: usize,
    normalize: bool,
}

impl StubEmbedder {
    pub fn new(dimension: usize, normalize: bool) -> Self {
        Self {
            dimension,
            normalize,
        }
    }
}

#[async_trait]
impl TextEmbedder for StubEmbedder {
    async fn embed(&self, _subject_id: &str, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        Ok(stub_vector(text, self.dimension, self.normalize))
    }

    fn dimension(&self) -> usize {
        self.dimension
    }
}

/// The generator itself, exposed for tests that want raw vectors.
pub fn stub_vector(text: &str, dimension: usize, normalize: bool) -> Vec<f32> {
    let seed = hash64(text.as_bytes());
    let mut v: Vec<f32> = (0..dimension)
        .map(|i| {
            let mixed = seed.wrapping_add((i as u64).wrapping_mul(0x9E37_79B9));
            ((mixed % 100_000) as f32 * 1e-4).sin()
        })
        .collect();
    if normalize {
        l2_normalize_in_place(&mut v);
    }
    v
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn same_text_same_vector() {
        let stub = StubEmbedder::new(64, true);
        let a = stub.embed("s-1", "forfettario regime, no employees").await.unwrap();
        let b = stub.embed("s-2", "forfettario regime, no employees").await.unwrap();
        assert_eq!(a, b);
    }

    #[tokio::test]
    async fn different_texts_differ() {
        let stub = StubEmbedder::new(64, false);
        let a = stub.embed("s", "alpha").await.unwrap();
        let b = stub.embed("s", "bravo").await.unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn respects_dimension_and_normalization() {
        let v = stub_vector("hello", 384, true);
        assert_eq!(v.len(), 384);
        let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-4);
    }
}
