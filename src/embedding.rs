//! The single capability boundary between the core and a concrete embedding
//! model. Nothing outside this module knows about `model2vec_rs`; the rest
//! of the crate only ever sees [`Embedder`].

use model2vec_rs::model::StaticModel;

/// Embeds query and passage text into the same unit-norm vector space.
///
/// Queries and passages are asymmetric for some embedding families (e5-style
/// prefixing), so the two operations stay distinct even though a given
/// implementation may treat them identically.
pub trait Embedder: Send + Sync {
    fn embed_query(&self, text: &str) -> Vec<f32>;
    fn embed_passage(&self, text: &str) -> Vec<f32>;
    fn dimensions(&self) -> usize;
}

/// Default `Embedder`: a static (non-contextual) model loaded from the
/// HuggingFace Hub via `model2vec-rs`, no ONNX runtime required.
pub struct StaticEmbedder {
    model: StaticModel,
    dimensions: usize,
}

impl StaticEmbedder {
    pub fn load(model_id: &str) -> anyhow::Result<Self> {
        let model = StaticModel::from_pretrained(model_id, None, None, None)?;
        let dimensions = model.encode_single("dimension probe").len();
        Ok(Self { model, dimensions })
    }
}

impl Embedder for StaticEmbedder {
    fn embed_query(&self, text: &str) -> Vec<f32> {
        self.model.encode_single(&format!("query: {text}"))
    }

    fn embed_passage(&self, text: &str) -> Vec<f32> {
        self.model.encode_single(&format!("passage: {text}"))
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }
}

/// Dot product of two unit-norm vectors, i.e. cosine similarity. Returns 0.0
/// for empty or mismatched-length input rather than panicking, since a
/// malformed on-disk `.emb` file shouldn't take down a whole retrieval pass.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}

/// L2 norm, used only by tests to assert the unit-norm invariant — the core
/// never renormalizes a vector it loads from disk.
pub fn l2_norm(v: &[f32]) -> f32 {
    v.iter().map(|x| x * x).sum::<f32>().sqrt()
}

#[cfg(test)]
pub mod test_support {
    use super::Embedder;
    use std::collections::hash_map::DefaultHasher;
    use std::hash::{Hash, Hasher};

    /// Deterministic stub embedder for tests: hashes the text into a
    /// reproducible pseudo-random unit vector. No model weights, no network.
    pub struct StubEmbedder {
        pub dimensions: usize,
    }

    impl StubEmbedder {
        pub fn new(dimensions: usize) -> Self {
            Self { dimensions }
        }

        fn vector_for(&self, seed_text: &str) -> Vec<f32> {
            let mut v = Vec::with_capacity(self.dimensions);
            for i in 0..self.dimensions {
                let mut hasher = DefaultHasher::new();
                seed_text.hash(&mut hasher);
                i.hash(&mut hasher);
                let bits = hasher.finish();
                v.push(((bits % 2000) as f32 / 1000.0) - 1.0);
            }
            let norm = super::l2_norm(&v);
            if norm > 0.0 {
                for x in v.iter_mut() {
                    *x /= norm;
                }
            }
            v
        }
    }

    impl Embedder for StubEmbedder {
        fn embed_query(&self, text: &str) -> Vec<f32> {
            self.vector_for(&format!("query:{text}"))
        }

        fn embed_passage(&self, text: &str) -> Vec<f32> {
            self.vector_for(&format!("passage:{text}"))
        }

        fn dimensions(&self) -> usize {
            self.dimensions
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::StubEmbedder;
    use super::*;

    #[test]
    fn stub_embedder_produces_unit_norm_vectors() {
        let embedder = StubEmbedder::new(32);
        let v = embedder.embed_passage("hello world");
        assert!((l2_norm(&v) - 1.0).abs() < 1e-4);
    }

    #[test]
    fn cosine_similarity_of_identical_vectors_is_one() {
        let embedder = StubEmbedder::new(16);
        let v = embedder.embed_passage("same text");
        let sim = cosine_similarity(&v, &v);
        assert!((sim - 1.0).abs() < 1e-4);
    }

    #[test]
    fn cosine_similarity_mismatched_lengths_is_zero() {
        assert_eq!(cosine_similarity(&[1.0, 0.0], &[1.0]), 0.0);
    }
}
