//! Semantic search: embed the query, then ask the vector index.
//!
//! Fails as a unit. Any embedding or index error is returned to the caller
//! unchanged (no partial results, no retry); the router treats it as
//! "method unavailable now".

use anyhow::{Context, Result};
use std::sync::Arc;

use crate::embedding::{embed_query, Embedder};
use crate::models::{RetrievalMethod, RetrievalResult};
use crate::store::VectorIndex;

#[derive(Clone)]
pub struct SemanticSearch {
    embedder: Arc<dyn Embedder>,
    index: Arc<dyn VectorIndex>,
}

impl SemanticSearch {
    pub fn new(embedder: Arc<dyn Embedder>, index: Arc<dyn VectorIndex>) -> Self {
        Self { embedder, index }
    }

    pub fn index(&self) -> &Arc<dyn VectorIndex> {
        &self.index
    }

    pub fn embedder(&self) -> &Arc<dyn Embedder> {
        &self.embedder
    }

    /// A blank query returns an empty result without calling the embedder.
    pub async fn search(&self, repository: &str, query: &str, k: usize) -> Result<RetrievalResult> {
        if query.trim().is_empty() {
            return Ok(RetrievalResult::empty(query, RetrievalMethod::Semantic));
        }
        let vector = embed_query(self.embedder.as_ref(), query)
            .await
            .context("query embedding failed")?;
        let hits = self
            .index
            .query(repository, &vector, k)
            .await
            .context("vector index query failed")?;
        Ok(RetrievalResult::new(query, RetrievalMethod::Semantic, hits))
    }
}
