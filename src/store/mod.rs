//! Vector index abstraction.
//!
//! The [`VectorIndex`] trait is the logical contract the harness needs from a
//! vector store: supersede-by-id upserts, removal, nearest-neighbor queries
//! scoped to one repository, and a per-repository last-update timestamp that
//! the router uses to invalidate cached results.
//!
//! Implementations must be `Send + Sync` to work with async runtimes.

pub mod memory;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::models::{CodeUnit, ScoredUnit, UnitEmbedding};

/// Abstract vector store.
///
/// | Method | Purpose |
/// |--------|---------|
/// | [`upsert`](VectorIndex::upsert) | Store a unit's vector, superseding any prior vector for the same id |
/// | [`remove`](VectorIndex::remove) | Drop vectors by id |
/// | [`query`](VectorIndex::query) | Top-k nearest units within one repository |
/// | [`content_hash`](VectorIndex::content_hash) | Hash of the indexed version of a unit |
/// | [`last_updated`](VectorIndex::last_updated) | When the repository's index last changed |
#[async_trait]
pub trait VectorIndex: Send + Sync {
    /// Store `embedding` for `unit`. Exactly one vector is kept per id.
    async fn upsert(&self, embedding: UnitEmbedding, unit: CodeUnit) -> Result<()>;

    /// Remove the given ids from `repository`; returns how many existed.
    async fn remove(&self, repository: &str, ids: &[String]) -> Result<usize>;

    /// Top-`k` units by cosine similarity, ranked.
    async fn query(&self, repository: &str, vector: &[f32], k: usize) -> Result<Vec<ScoredUnit>>;

    /// Content hash recorded for `id`, if indexed.
    async fn content_hash(&self, repository: &str, id: &str) -> Result<Option<String>>;

    /// All indexed ids of `repository`.
    async fn ids(&self, repository: &str) -> Result<Vec<String>>;

    /// Timestamp of the most recent change to `repository`'s vectors.
    fn last_updated(&self, repository: &str) -> Option<DateTime<Utc>>;
}
