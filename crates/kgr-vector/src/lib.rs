//! KGR Vector - Vector math and embedding clients
//!
//! Provides cosine similarity for resolution and k-NN, and HTTP clients
//! implementing the embedding service contract.

pub mod embedding;

pub use embedding::{create_embedding_service, OllamaEmbedding, OpenAiEmbedding};

/// Cosine similarity between two vectors
///
/// Returns `None` when the vectors differ in length, are empty, or either
/// has zero magnitude.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> Option<f32> {
    if a.len() != b.len() || a.is_empty() {
        return None;
    }

    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (x, y) in a.iter().zip(b) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    if norm_a == 0.0 || norm_b == 0.0 {
        return None;
    }

    let similarity = dot / (norm_a.sqrt() * norm_b.sqrt());
    similarity.is_finite().then_some(similarity)
}
