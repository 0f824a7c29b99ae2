//! Duplicate detection against the most recent stored screenshot.

use crate::db::{StoreError, VectorStore};

/// Cosine similarity in `[-1, 1]`. Zero-norm inputs and vectors of different
/// lengths compare as `0.0`.
///
/// Accumulates in `f64` so long vectors do not drift.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() {
        return 0.0;
    }
    let mut dot = 0.0f64;
    let mut norm_a = 0.0f64;
    let mut norm_b = 0.0f64;
    for (&x, &y) in a.iter().zip(b.iter()) {
        let (x, y) = (x as f64, y as f64);
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    (dot / (norm_a.sqrt() * norm_b.sqrt())).clamp(-1.0, 1.0) as f32
}

/// Result of comparing a fresh embedding with the last stored one.
#[derive(Debug, Clone, PartialEq)]
pub struct GateOutcome {
    /// `similarity > threshold`.
    pub is_duplicate: bool,
    /// `None` when the store was empty.
    pub similarity: Option<f32>,
    /// The embedding of the entry compared against.
    pub comparison: Option<Vec<f32>>,
}

#[derive(Debug, Clone, Copy)]
pub struct SimilarityGate {
    threshold: f32,
}

impl SimilarityGate {
    pub fn new(threshold: f32) -> Self {
        Self { threshold }
    }

    pub fn threshold(&self) -> f32 {
        self.threshold
    }

    /// Compare `candidate` with the store's last entry. An empty store is
    /// never a duplicate. Read-only.
    pub async fn evaluate(
        &self,
        store: &VectorStore,
        candidate: &[f32],
    ) -> Result<GateOutcome, StoreError> {
        let Some(last) = store.last_entry().await? else {
            return Ok(GateOutcome {
                is_duplicate: false,
                similarity: None,
                comparison: None,
            });
        };

        let similarity = cosine_similarity(candidate, &last.embedding);
        tracing::debug!(
            last_id = last.entry.id,
            similarity,
            threshold = self.threshold,
            "Compared capture with last entry"
        );

        Ok(GateOutcome {
            is_duplicate: similarity > self.threshold,
            similarity: Some(similarity),
            comparison: Some(last.embedding),
        })
    }
}

impl Default for SimilarityGate {
    fn default() -> Self {
        Self::new(0.95)
    }
}
