//! Vector records, their byte codec, and the keyed record store

pub mod codec;
pub mod record;
pub mod store;

pub use codec::{VectorCodec, VectorEncoding};
pub use record::{
    record_key, Chunk, ChunkEmbedding, RecordMeta, VectorRecord, VECTOR_FIELD,
};
pub use store::{
    DeleteReport, PurgeReport, RecordFailure, RecordScan, UpsertReport, VectorStore,
};

/// Cosine similarity in [-1, 1], 0.0 when either vector has zero magnitude
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() {
        return 0.0;
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
        return 0.0;
    }

    let cos = dot / (norm_a.sqrt() * norm_b.sqrt());
    if cos.is_finite() {
        cos.clamp(-1.0, 1.0)
    } else {
        0.0
    }
}

/// Similarity score reported to callers: cosine clamped into [0, 1]
pub fn similarity_score(cosine: f32) -> f32 {
    if cosine.is_finite() {
        cosine.clamp(0.0, 1.0)
    } else {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cosine_similarity() {
        assert!((cosine_similarity(&[1.0, 0.0], &[1.0, 0.0]) - 1.0).abs() < 1e-6);
        assert!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]).abs() < 1e-6);
        assert!((cosine_similarity(&[1.0, 0.0], &[-1.0, 0.0]) + 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_zero_vector_scores_zero() {
        let score = cosine_similarity(&[0.0, 0.0, 0.0], &[0.3, 0.1, 0.9]);
        assert_eq!(score, 0.0);
        assert!(!score.is_nan());
    }

    #[test]
    fn test_similarity_score_clamps() {
        assert_eq!(similarity_score(-0.4), 0.0);
        assert_eq!(similarity_score(0.42), 0.42);
        assert_eq!(similarity_score(f32::NAN), 0.0);
    }
}
