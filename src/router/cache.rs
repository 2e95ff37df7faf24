//! Single-flight result cache.
//!
//! Keys are `(repository, normalized query, serialized options)`. Each key
//! maps to an `Arc<OnceCell>`: the first caller to reach an empty cell runs
//! the computation while concurrent callers for the same key wait on that
//! cell instead of repeating the search. Failed computations leave the cell
//! empty, so errors are never cached.
//!
//! An entry is stale once its TTL has elapsed or once the repository's
//! vector index has been updated after the entry was created. A stale cell
//! is swapped for a fresh one under the repository's lock, so at most one
//! recomputation starts per key.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::OnceCell;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub repository: String,
    pub query: String,
    pub options: String,
}

impl CacheKey {
    pub fn new(repository: &str, query: &str, options: String) -> Self {
        Self {
            repository: repository.to_string(),
            query: normalize_query(query),
            options,
        }
    }
}

/// Collapse runs of whitespace and trim.
pub fn normalize_query(query: &str) -> String {
    query.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[derive(Debug, Clone)]
pub struct CacheEntry<T> {
    pub value: T,
    pub created_at: DateTime<Utc>,
    born: Instant,
    ttl: Duration,
}

impl<T> CacheEntry<T> {
    fn new(value: T, ttl: Duration) -> Self {
        Self {
            value,
            created_at: Utc::now(),
            born: Instant::now(),
            ttl,
        }
    }

    pub fn is_expired(&self) -> bool {
        self.born.elapsed() > self.ttl
    }

    /// Whether the index changed after this entry was computed.
    pub fn is_invalidated(&self, index_updated: Option<DateTime<Utc>>) -> bool {
        index_updated.is_some_and(|t| t > self.created_at)
    }
}

/// Whether a lookup was served from the cache or computed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheOutcome {
    Hit,
    Miss,
}

type Slot<T> = Arc<OnceCell<CacheEntry<T>>>;

struct RepoCache<T> {
    slots: Mutex<HashMap<CacheKey, Slot<T>>>,
}

impl<T> Default for RepoCache<T> {
    fn default() -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
        }
    }
}

pub struct ResultCache<T> {
    repos: DashMap<String, Arc<RepoCache<T>>>,
}

impl<T> Default for ResultCache<T> {
    fn default() -> Self {
        Self {
            repos: DashMap::new(),
        }
    }
}

impl<T: Clone + Send + Sync> ResultCache<T> {
    pub fn new() -> Self {
        Self::default()
    }

    fn repo(&self, repository: &str) -> Arc<RepoCache<T>> {
        self.repos
            .entry(repository.to_string())
            .or_default()
            .value()
            .clone()
    }

    /// Return the cached value for `key`, or run `compute` exactly once
    /// across all concurrent callers of the same key.
    ///
    /// The caller whose `compute` ran gets [`CacheOutcome::Miss`]; every
    /// other caller that receives the value gets [`CacheOutcome::Hit`].
    pub async fn get_or_compute<F, Fut, E>(
        &self,
        key: CacheKey,
        ttl: Duration,
        index_updated: Option<DateTime<Utc>>,
        compute: F,
    ) -> Result<(T, CacheOutcome), E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let repo = self.repo(&key.repository);
        let cell = {
            let mut slots = repo.slots.lock();
            let slot = slots
                .entry(key)
                .or_insert_with(|| Arc::new(OnceCell::new()));
            let stale = slot
                .get()
                .is_some_and(|entry| entry.is_expired() || entry.is_invalidated(index_updated));
            if stale {
                *slot = Arc::new(OnceCell::new());
            }
            slot.clone()
        };

        let mut computed = false;
        let flag = &mut computed;
        let entry = cell
            .get_or_try_init(|| async move {
                *flag = true;
                compute().await.map(|value| CacheEntry::new(value, ttl))
            })
            .await?;

        let outcome = if computed {
            CacheOutcome::Miss
        } else {
            CacheOutcome::Hit
        };
        Ok((entry.value.clone(), outcome))
    }

    /// Drop every entry of `repository`.
    pub fn invalidate(&self, repository: &str) {
        self.repos.remove(repository);
    }

    /// Remove expired entries; returns how many were dropped.
    pub fn purge_expired(&self, repository: &str) -> usize {
        let Some(repo) = self.repos.get(repository).map(|r| r.value().clone()) else {
            return 0;
        };
        let mut slots = repo.slots.lock();
        let before = slots.len();
        slots.retain(|_, slot| slot.get().map_or(true, |e| !e.is_expired()));
        before - slots.len()
    }

    pub fn len(&self, repository: &str) -> usize {
        self.repos
            .get(repository)
            .map_or(0, |r| r.slots.lock().values().filter(|s| s.initialized()).count())
    }
}
