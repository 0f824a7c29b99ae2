//! Retrieval subsystem — text search over stored screenshots
//!
//! - Embeds the query with the same backend that embedded the images
//! - Asks the store for the nearest entries by cosine distance
//! - Returns hits ordered by distance (lowest first)

use smarn_core::config::RetrievalConfig;
use smarn_core::db::{StoreError, VectorStore};
use smarn_core::embeddings::{EmbeddingBackend, EmbeddingError};
use smarn_core::models::SearchHit;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SearchError {
    #[error("Query embedding failed: {0}")]
    Embedding(#[from] EmbeddingError),

    #[error("Store query failed: {0}")]
    Store(#[from] StoreError),
}

/// Requested `k`, or the configured default when missing or zero, capped at
/// `max_k`.
pub fn effective_k(k: Option<usize>, config: &RetrievalConfig) -> usize {
    k.filter(|&k| k > 0)
        .unwrap_or(config.default_k)
        .min(config.max_k)
}

/// Search screenshots whose content matches `query`.
///
/// A blank query yields no results and never reaches the embedding backend.
pub async fn search_screenshots(
    query: &str,
    k: Option<usize>,
    store: &VectorStore,
    backend: &dyn EmbeddingBackend,
    config: &RetrievalConfig,
) -> Result<Vec<SearchHit>, SearchError> {
    let query = query.trim();
    if query.is_empty() {
        tracing::debug!("Empty search query, returning no results");
        return Ok(Vec::new());
    }

    let k = effective_k(k, config);
    let embedding = backend.embed_text(query).await?;
    let rows = store.top_k(&embedding, k).await?;

    tracing::info!(
        query_len = query.len(),
        k,
        results = rows.len(),
        backend = backend.name(),
        "Search complete"
    );

    Ok(rows.into_iter().map(SearchHit::from).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_effective_k_defaults_and_caps() {
        let config = RetrievalConfig::default();
        assert_eq!(effective_k(None, &config), 9);
        assert_eq!(effective_k(Some(0), &config), 9);
        assert_eq!(effective_k(Some(3), &config), 3);
        assert_eq!(effective_k(Some(10_000), &config), 100);
    }
}
