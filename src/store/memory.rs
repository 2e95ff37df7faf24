//! In-memory [`VectorIndex`] implementation.
//!
//! Uses a `HashMap` per repository behind a `parking_lot::RwLock`.
//! Queries are brute-force cosine similarity over the repository's vectors.

use std::collections::HashMap;

use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;

use super::VectorIndex;
use crate::embedding::cosine_similarity;
use crate::models::{rank_order, CodeUnit, ScoredUnit, UnitEmbedding};

struct StoredVector {
    embedding: UnitEmbedding,
    unit: CodeUnit,
}

#[derive(Default)]
struct RepoVectors {
    entries: HashMap<String, StoredVector>,
    last_updated: Option<DateTime<Utc>>,
}

/// In-memory vector index for tests and single-process use.
#[derive(Default)]
pub struct InMemoryVectorIndex {
    repos: RwLock<HashMap<String, RepoVectors>>,
}

impl InMemoryVectorIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self, repository: &str) -> usize {
        self.repos
            .read()
            .get(repository)
            .map_or(0, |r| r.entries.len())
    }
}

#[async_trait]
impl VectorIndex for InMemoryVectorIndex {
    async fn upsert(&self, embedding: UnitEmbedding, unit: CodeUnit) -> Result<()> {
        if embedding.id != unit.id {
            bail!("embedding id {} does not match unit id {}", embedding.id, unit.id);
        }
        let mut repos = self.repos.write();
        let repo = repos.entry(embedding.repository.clone()).or_default();
        let touched = embedding.indexed_at;
        repo.entries
            .insert(embedding.id.clone(), StoredVector { embedding, unit });
        repo.last_updated = Some(repo.last_updated.map_or(touched, |t| t.max(touched)));
        Ok(())
    }

    async fn remove(&self, repository: &str, ids: &[String]) -> Result<usize> {
        let mut repos = self.repos.write();
        let Some(repo) = repos.get_mut(repository) else {
            return Ok(0);
        };
        let removed = ids
            .iter()
            .filter(|id| repo.entries.remove(id.as_str()).is_some())
            .count();
        if removed > 0 {
            repo.last_updated = Some(Utc::now());
        }
        Ok(removed)
    }

    async fn query(&self, repository: &str, vector: &[f32], k: usize) -> Result<Vec<ScoredUnit>> {
        let repos = self.repos.read();
        let Some(repo) = repos.get(repository) else {
            return Ok(Vec::new());
        };
        let mut scored: Vec<ScoredUnit> = repo
            .entries
            .values()
            .map(|sv| ScoredUnit {
                unit: sv.unit.clone(),
                score: cosine_similarity(vector, &sv.embedding.vector) as f64,
            })
            .collect();
        scored.sort_by(rank_order);
        scored.truncate(k);
        Ok(scored)
    }

    async fn content_hash(&self, repository: &str, id: &str) -> Result<Option<String>> {
        Ok(self
            .repos
            .read()
            .get(repository)
            .and_then(|r| r.entries.get(id))
            .map(|sv| sv.embedding.content_hash.clone()))
    }

    async fn ids(&self, repository: &str) -> Result<Vec<String>> {
        let mut ids: Vec<String> = self
            .repos
            .read()
            .get(repository)
            .map(|r| r.entries.keys().cloned().collect())
            .unwrap_or_default();
        ids.sort();
        Ok(ids)
    }

    fn last_updated(&self, repository: &str) -> Option<DateTime<Utc>> {
        self.repos.read().get(repository).and_then(|r| r.last_updated)
    }
}
