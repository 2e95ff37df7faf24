//! Query strategy router.
//!
//! Picks semantic search, direct search, or both for each call according to
//! the repository's [`QueryPolicy`], merges or falls back as the strategy
//! dictates, and keeps per-repository statistics and a single-flight result
//! cache.
//!
//! | Strategy | Behavior |
//! |----------|----------|
//! | `vector_only` | Semantic only; a failure fails the call |
//! | `direct_only` | Direct only |
//! | `hybrid` | Both concurrently; normalized scores merged, overlaps removed |
//! | `direct_fallback` | Semantic first under a latency ceiling, direct on failure |
//!
//! The strategy is fixed per call. [`QueryStats::preferred_strategy`] may
//! recommend a different one, but the router never switches on its own.

pub mod cache;
pub mod stats;

use anyhow::anyhow;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

use crate::config::{QueryPolicy, QueryStrategy};
use crate::direct::{DirectSearch, SearchOptions};
use crate::error::{Result, ReviewError};
use crate::models::{rank_order, RetrievalMethod, RetrievalResult, ScoredUnit};
use crate::semantic::SemanticSearch;
use crate::tokenize::Tokenizer;

use cache::{CacheKey, CacheOutcome, ResultCache};
pub use stats::{QueryStats, StatsRegistry, StrategyAdvice};

/// The repository a query runs against.
#[derive(Debug, Clone)]
pub struct RepoScope {
    pub repository: String,
    /// Working tree scanned by direct search.
    pub root: PathBuf,
}

impl RepoScope {
    pub fn new(repository: impl Into<String>, root: impl Into<PathBuf>) -> Self {
        Self {
            repository: repository.into(),
            root: root.into(),
        }
    }
}

/// A retrieval result plus how it was obtained.
#[derive(Debug, Clone, Serialize)]
pub struct RoutedResult {
    pub result: RetrievalResult,
    pub served_by: RetrievalMethod,
    pub fallback_used: bool,
    pub fallback_reason: Option<String>,
    pub cache_hit: bool,
}

impl RoutedResult {
    fn served(result: RetrievalResult, served_by: RetrievalMethod) -> Self {
        Self {
            result,
            served_by,
            fallback_used: false,
            fallback_reason: None,
            cache_hit: false,
        }
    }
}

#[derive(Serialize)]
struct OptionsKey<'a> {
    strategy: QueryStrategy,
    direct_enabled: bool,
    vector_enabled: bool,
    latency_ceiling_ms: u64,
    options: &'a SearchOptions,
}

pub struct QueryRouter {
    semantic: Option<SemanticSearch>,
    tokenizer: Arc<dyn Tokenizer>,
    cache: ResultCache<RoutedResult>,
    stats: StatsRegistry,
}

impl QueryRouter {
    /// `semantic` is `None` when no embedding backend is configured; any
    /// strategy that needs it then sees a semantic failure.
    pub fn new(semantic: Option<SemanticSearch>, tokenizer: Arc<dyn Tokenizer>) -> Self {
        Self {
            semantic,
            tokenizer,
            cache: ResultCache::new(),
            stats: StatsRegistry::new(),
        }
    }

    pub fn semantic(&self) -> Option<&SemanticSearch> {
        self.semantic.as_ref()
    }

    pub fn stats(&self, repository: &str) -> QueryStats {
        self.stats.snapshot(repository)
    }

    pub fn advice(&self, repository: &str, policy: &QueryPolicy) -> Option<StrategyAdvice> {
        self.stats.snapshot(repository).preferred_strategy(policy)
    }

    /// Drop cached results for `repository`.
    pub fn invalidate(&self, repository: &str) {
        self.cache.invalidate(repository);
    }

    /// Run one retrieval call.
    ///
    /// Identical concurrent calls share one computation. A cancelled call
    /// returns [`ReviewError::Cancelled`]; a computation it was leading is
    /// handed to the next waiter.
    pub async fn retrieve(
        &self,
        scope: &RepoScope,
        query: &str,
        policy: &QueryPolicy,
        options: &SearchOptions,
        cancel: &CancellationToken,
    ) -> Result<RoutedResult> {
        policy.validate()?;
        let repository = scope.repository.as_str();

        let options_key = serde_json::to_string(&OptionsKey {
            strategy: policy.strategy,
            direct_enabled: policy.direct_enabled,
            vector_enabled: policy.vector_enabled,
            latency_ceiling_ms: policy.latency_ceiling_ms,
            options,
        })?;
        let key = CacheKey::new(repository, query, options_key);
        let index_updated = self
            .semantic
            .as_ref()
            .and_then(|s| s.index().last_updated(repository));

        self.stats.update(repository, |s| s.total_calls += 1);

        let lookup = self.cache.get_or_compute(key, policy.cache_ttl(), index_updated, || {
            self.execute(scope, query, policy, options)
        });
        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(ReviewError::Cancelled),
            r = lookup => r,
        };

        match outcome {
            Ok((mut routed, cache_outcome)) => {
                routed.cache_hit = cache_outcome == CacheOutcome::Hit;
                self.stats.update(repository, |s| {
                    match cache_outcome {
                        CacheOutcome::Hit => s.cache_hits += 1,
                        CacheOutcome::Miss => s.cache_misses += 1,
                    }
                    s.record_served(routed.served_by);
                });
                tracing::debug!(
                    repository,
                    served_by = %routed.served_by,
                    items = routed.result.len(),
                    cache_hit = routed.cache_hit,
                    "retrieval served"
                );
                Ok(routed)
            }
            Err(ReviewError::Cancelled) => Err(ReviewError::Cancelled),
            Err(e) => {
                self.stats.update(repository, |s| {
                    s.cache_misses += 1;
                    s.failed_calls += 1;
                });
                Err(e)
            }
        }
    }

    async fn execute(
        &self,
        scope: &RepoScope,
        query: &str,
        policy: &QueryPolicy,
        options: &SearchOptions,
    ) -> Result<RoutedResult> {
        let k = options.max_results;
        match policy.strategy {
            QueryStrategy::VectorOnly => {
                let result = self
                    .attempt_semantic(&scope.repository, query, k, None)
                    .await
                    .map_err(|e| unavailable(RetrievalMethod::Semantic, &e))?;
                Ok(RoutedResult::served(result, RetrievalMethod::Semantic))
            }
            QueryStrategy::DirectOnly => {
                let result = self
                    .attempt_direct(scope, query, options)
                    .await
                    .map_err(|e| unavailable(RetrievalMethod::Direct, &e))?;
                Ok(RoutedResult::served(result, RetrievalMethod::Direct))
            }
            QueryStrategy::Hybrid => self.execute_hybrid(scope, query, policy, options).await,
            QueryStrategy::DirectFallback => self.execute_fallback(scope, query, policy, options).await,
        }
    }

    async fn execute_hybrid(
        &self,
        scope: &RepoScope,
        query: &str,
        policy: &QueryPolicy,
        options: &SearchOptions,
    ) -> Result<RoutedResult> {
        let k = options.max_results;
        if !policy.vector_enabled {
            let result = self
                .attempt_direct(scope, query, options)
                .await
                .map_err(|e| unavailable(RetrievalMethod::Direct, &e))?;
            return Ok(RoutedResult::served(result, RetrievalMethod::Direct));
        }
        if !policy.direct_enabled {
            let result = self
                .attempt_semantic(&scope.repository, query, k, None)
                .await
                .map_err(|e| unavailable(RetrievalMethod::Semantic, &e))?;
            return Ok(RoutedResult::served(result, RetrievalMethod::Semantic));
        }

        let (semantic, direct) = tokio::join!(
            self.attempt_semantic(&scope.repository, query, k, None),
            self.attempt_direct(scope, query, options),
        );

        match (semantic, direct) {
            (Ok(s), Ok(d)) => Ok(RoutedResult::served(
                merge_hybrid(query, s, d, k),
                RetrievalMethod::Hybrid,
            )),
            (Ok(s), Err(e)) => {
                let reason = format!("direct search failed: {e:#}");
                tracing::warn!(repository = %scope.repository, %reason, "hybrid served by semantic only");
                Ok(RoutedResult {
                    fallback_reason: Some(reason),
                    ..RoutedResult::served(s, RetrievalMethod::Semantic)
                })
            }
            (Err(e), Ok(d)) => {
                let reason = format!("semantic search failed: {e:#}");
                tracing::warn!(repository = %scope.repository, %reason, "hybrid served by direct only");
                Ok(RoutedResult {
                    fallback_reason: Some(reason),
                    ..RoutedResult::served(d, RetrievalMethod::Direct)
                })
            }
            (Err(se), Err(de)) => Err(ReviewError::MethodUnavailable {
                method: RetrievalMethod::Hybrid,
                reason: format!("semantic: {se:#}; direct: {de:#}"),
            }),
        }
    }

    async fn execute_fallback(
        &self,
        scope: &RepoScope,
        query: &str,
        policy: &QueryPolicy,
        options: &SearchOptions,
    ) -> Result<RoutedResult> {
        if !policy.vector_enabled {
            let result = self
                .attempt_direct(scope, query, options)
                .await
                .map_err(|e| unavailable(RetrievalMethod::Direct, &e))?;
            return Ok(RoutedResult::served(result, RetrievalMethod::Direct));
        }

        let semantic = self
            .attempt_semantic(
                &scope.repository,
                query,
                options.max_results,
                Some(policy.latency_ceiling()),
            )
            .await;
        let error = match semantic {
            Ok(result) => return Ok(RoutedResult::served(result, RetrievalMethod::Semantic)),
            Err(e) => e,
        };

        if !policy.direct_enabled {
            return Err(unavailable(RetrievalMethod::Semantic, &error));
        }

        let reason = format!("{error:#}");
        tracing::warn!(repository = %scope.repository, %reason, "falling back to direct search");
        self.stats.update(&scope.repository, |s| s.fallback_count += 1);

        let result = self
            .attempt_direct(scope, query, options)
            .await
            .map_err(|e| unavailable(RetrievalMethod::Direct, &e))?;
        Ok(RoutedResult {
            result,
            served_by: RetrievalMethod::Direct,
            fallback_used: true,
            fallback_reason: Some(reason),
            cache_hit: false,
        })
    }

    /// One semantic attempt, timed and recorded. A missing backend and an
    /// exceeded ceiling both count as failures.
    async fn attempt_semantic(
        &self,
        repository: &str,
        query: &str,
        k: usize,
        ceiling: Option<Duration>,
    ) -> anyhow::Result<RetrievalResult> {
        let started = Instant::now();
        let outcome = match &self.semantic {
            None => Err(anyhow!("no semantic backend configured")),
            Some(semantic) => match ceiling {
                Some(limit) => match tokio::time::timeout(limit, semantic.search(repository, query, k)).await {
                    Ok(result) => result,
                    Err(_) => Err(anyhow!(
                        "semantic search exceeded latency ceiling of {}ms",
                        limit.as_millis()
                    )),
                },
                None => semantic.search(repository, query, k).await,
            },
        };
        let elapsed = started.elapsed();
        self.stats.update(repository, |s| {
            s.record_attempt(RetrievalMethod::Semantic, elapsed, outcome.is_ok())
        });
        if let Err(e) = &outcome {
            tracing::warn!(repository, error = %format!("{e:#}"), "semantic search failed");
        }
        outcome
    }

    async fn attempt_direct(
        &self,
        scope: &RepoScope,
        query: &str,
        options: &SearchOptions,
    ) -> anyhow::Result<RetrievalResult> {
        let started = Instant::now();
        let direct = DirectSearch::new(scope.repository.clone(), scope.root.clone(), self.tokenizer.clone());
        let outcome = direct.search(query, options).await;
        let elapsed = started.elapsed();
        self.stats.update(&scope.repository, |s| {
            s.record_attempt(RetrievalMethod::Direct, elapsed, outcome.is_ok())
        });
        outcome
    }
}

fn unavailable(method: RetrievalMethod, error: &anyhow::Error) -> ReviewError {
    ReviewError::MethodUnavailable {
        method,
        reason: format!("{error:#}"),
    }
}

/// Min-max normalize scores into `[0, 1]`; a flat list maps to all 1.0.
fn normalize(items: Vec<ScoredUnit>) -> Vec<ScoredUnit> {
    if items.is_empty() {
        return items;
    }
    let min = items.iter().map(|s| s.score).fold(f64::INFINITY, f64::min);
    let max = items.iter().map(|s| s.score).fold(f64::NEG_INFINITY, f64::max);
    items
        .into_iter()
        .map(|mut s| {
            s.score = if (max - min).abs() < f64::EPSILON {
                1.0
            } else {
                (s.score - min) / (max - min)
            };
            s
        })
        .collect()
}

/// Merge semantic and direct results.
///
/// Each list is normalized independently, then the union is walked in rank
/// order and any unit overlapping an already-kept unit of the same file is
/// dropped, so the higher-scored copy wins.
pub fn merge_hybrid(
    query: &str,
    semantic: RetrievalResult,
    direct: RetrievalResult,
    limit: usize,
) -> RetrievalResult {
    let skipped_files = semantic.skipped_files + direct.skipped_files;
    let inherited_truncation = semantic
        .truncation_reason
        .clone()
        .or_else(|| direct.truncation_reason.clone());

    let mut candidates = normalize(semantic.items);
    candidates.extend(normalize(direct.items));
    candidates.sort_by(rank_order);

    let mut kept: Vec<ScoredUnit> = Vec::with_capacity(candidates.len());
    for candidate in candidates {
        if !kept.iter().any(|k| k.unit.overlaps(&candidate.unit)) {
            kept.push(candidate);
        }
    }

    let mut merged = RetrievalResult::new(query, RetrievalMethod::Hybrid, kept);
    merged.skipped_files = skipped_files;
    if let Some(reason) = inherited_truncation {
        merged.truncated = true;
        merged.truncation_reason = Some(reason);
    }
    merged.truncate(limit);
    merged
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::{DisabledEmbedder, Embedder};
    use crate::models::{content_hash, CodeUnit, UnitEmbedding, UnitKind};
    use crate::store::memory::InMemoryVectorIndex;
    use crate::store::VectorIndex;
    use crate::tokenize::ApproxTokenizer;
    use async_trait::async_trait;
    use chrono::Utc;

    fn unit(path: &str, start: usize, end: usize) -> CodeUnit {
        let text = format!("{path}:{start}-{end}");
        CodeUnit {
            id: CodeUnit::make_id("repo", path, start, end, 0),
            repository: "repo".into(),
            file_path: path.into(),
            start_line: start,
            end_line: end,
            kind: UnitKind::Function,
            language: "rust".into(),
            hash: content_hash(&text),
            text,
            token_count: 5,
            symbols: vec![],
            references: vec![],
            relevance: 0.0,
            dependencies: vec![],
        }
    }

    fn scored(path: &str, start: usize, end: usize, score: f64) -> ScoredUnit {
        ScoredUnit {
            unit: unit(path, start, end),
            score,
        }
    }

    /// Maps every text to the same direction so any indexed unit matches.
    struct ConstantEmbedder;

    #[async_trait]
    impl Embedder for ConstantEmbedder {
        fn model_name(&self) -> &str {
            "constant"
        }
        fn dims(&self) -> usize {
            2
        }
        async fn embed(&self, texts: &[String]) -> anyhow::Result<Vec<Vec<f32>>> {
            Ok(texts.iter().map(|_| vec![1.0, 0.0]).collect())
        }
    }

    fn scratch_repo() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("config.rs"),
            "pub fn load_config() {}\n\nfn unrelated() {}\n",
        )
        .unwrap();
        dir
    }

    async fn indexed_semantic() -> SemanticSearch {
        let index = Arc::new(InMemoryVectorIndex::new());
        let u = unit("config.rs", 1, 1);
        index
            .upsert(
                UnitEmbedding {
                    id: u.id.clone(),
                    repository: "repo".into(),
                    vector: vec![1.0, 0.0],
                    indexed_at: Utc::now(),
                    content_hash: u.hash.clone(),
                    model: "constant".into(),
                },
                u,
            )
            .await
            .unwrap();
        SemanticSearch::new(Arc::new(ConstantEmbedder), index)
    }

    fn failing_semantic() -> SemanticSearch {
        SemanticSearch::new(Arc::new(DisabledEmbedder), Arc::new(InMemoryVectorIndex::new()))
    }

    fn policy(strategy: QueryStrategy) -> QueryPolicy {
        QueryPolicy {
            strategy,
            cache_ttl_secs: 60,
            ..QueryPolicy::default()
        }
    }

    fn router(semantic: Option<SemanticSearch>) -> QueryRouter {
        QueryRouter::new(semantic, Arc::new(ApproxTokenizer::default()))
    }

    #[test]
    fn test_merge_drops_overlaps_keeping_higher_score() {
        let semantic = RetrievalResult::new(
            "q",
            RetrievalMethod::Semantic,
            vec![scored("a.rs", 1, 10, 0.9), scored("b.rs", 1, 5, 0.1)],
        );
        let direct = RetrievalResult::new(
            "q",
            RetrievalMethod::Direct,
            vec![scored("a.rs", 5, 8, 0.5), scored("c.rs", 1, 3, 0.2)],
        );
        let merged = merge_hybrid("q", semantic, direct, 10);
        assert_eq!(merged.method, RetrievalMethod::Hybrid);
        for (i, a) in merged.items.iter().enumerate() {
            for b in &merged.items[i + 1..] {
                assert!(!a.unit.overlaps(&b.unit));
            }
        }
        let a = merged.items.iter().find(|s| s.unit.file_path == "a.rs").unwrap();
        assert_eq!((a.unit.start_line, a.unit.end_line), (1, 10));
        assert_eq!(merged.len(), 3);
    }

    #[test]
    fn test_merge_truncates_to_limit() {
        let semantic = RetrievalResult::new(
            "q",
            RetrievalMethod::Semantic,
            vec![scored("a.rs", 1, 1, 0.9), scored("b.rs", 1, 1, 0.8)],
        );
        let direct = RetrievalResult::new("q", RetrievalMethod::Direct, vec![scored("c.rs", 1, 1, 1.0)]);
        let merged = merge_hybrid("q", semantic, direct, 2);
        assert_eq!(merged.len(), 2);
        assert!(merged.truncated);
    }

    #[tokio::test]
    async fn test_vector_only_failure_is_not_substituted() {
        let repo = scratch_repo();
        let router = router(Some(failing_semantic()));
        let scope = RepoScope::new("repo", repo.path());
        let policy = policy(QueryStrategy::VectorOnly);
        let err = router
            .retrieve(&scope, "load_config", &policy, &SearchOptions::from_policy(&policy), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ReviewError::MethodUnavailable {
                method: RetrievalMethod::Semantic,
                ..
            }
        ));
        let stats = router.stats("repo");
        assert_eq!(stats.failed_calls, 1);
        assert_eq!(stats.direct.calls, 0);
    }

    #[tokio::test]
    async fn test_fallback_serves_direct() {
        let repo = scratch_repo();
        let router = router(Some(failing_semantic()));
        let scope = RepoScope::new("repo", repo.path());
        let policy = policy(QueryStrategy::DirectFallback);
        let opts = SearchOptions::from_policy(&policy);

        for (n, query) in ["load_config", "unrelated", "config"].iter().enumerate() {
            let routed = router
                .retrieve(&scope, query, &policy, &opts, &CancellationToken::new())
                .await
                .unwrap();
            assert_eq!(routed.served_by, RetrievalMethod::Direct);
            assert!(routed.fallback_used);
            assert_eq!(router.stats("repo").fallback_count, n as u64 + 1);
        }
        let stats = router.stats("repo");
        assert_eq!(stats.served_direct, 3);
        assert_eq!(stats.semantic.failures, 3);
    }

    #[tokio::test]
    async fn test_fallback_without_backend_counts_as_failure() {
        let repo = scratch_repo();
        let router = router(None);
        let scope = RepoScope::new("repo", repo.path());
        let policy = policy(QueryStrategy::DirectFallback);
        let routed = router
            .retrieve(&scope, "load_config", &policy, &SearchOptions::from_policy(&policy), &CancellationToken::new())
            .await
            .unwrap();
        assert!(routed.fallback_used);
        assert!(routed.fallback_reason.unwrap().contains("no semantic backend"));
    }

    #[tokio::test]
    async fn test_fallback_not_needed_when_semantic_works() {
        let repo = scratch_repo();
        let router = router(Some(indexed_semantic().await));
        let scope = RepoScope::new("repo", repo.path());
        let policy = policy(QueryStrategy::DirectFallback);
        let routed = router
            .retrieve(&scope, "load_config", &policy, &SearchOptions::from_policy(&policy), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(routed.served_by, RetrievalMethod::Semantic);
        assert!(!routed.fallback_used);
        assert_eq!(router.stats("repo").fallback_count, 0);
    }

    #[tokio::test]
    async fn test_hybrid_merges_both_methods() {
        let repo = scratch_repo();
        let router = router(Some(indexed_semantic().await));
        let scope = RepoScope::new("repo", repo.path());
        let policy = policy(QueryStrategy::Hybrid);
        let routed = router
            .retrieve(&scope, "load_config", &policy, &SearchOptions::from_policy(&policy), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(routed.served_by, RetrievalMethod::Hybrid);
        // Semantic unit (line 1) and the direct snippet around line 1 overlap.
        let in_config: Vec<_> = routed
            .result
            .items
            .iter()
            .filter(|s| s.unit.file_path == "config.rs")
            .collect();
        assert_eq!(in_config.len(), 1);
    }

    #[tokio::test]
    async fn test_hybrid_survives_one_failed_method() {
        let repo = scratch_repo();
        let router = router(Some(failing_semantic()));
        let scope = RepoScope::new("repo", repo.path());
        let policy = policy(QueryStrategy::Hybrid);
        let routed = router
            .retrieve(&scope, "load_config", &policy, &SearchOptions::from_policy(&policy), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(routed.served_by, RetrievalMethod::Direct);
        assert!(routed.fallback_reason.is_some());
    }

    #[tokio::test]
    async fn test_repeated_query_hits_cache() {
        let repo = scratch_repo();
        let router = router(None);
        let scope = RepoScope::new("repo", repo.path());
        let policy = policy(QueryStrategy::DirectOnly);
        let opts = SearchOptions::from_policy(&policy);
        let cancel = CancellationToken::new();

        let first = router.retrieve(&scope, "load_config", &policy, &opts, &cancel).await.unwrap();
        let second = router.retrieve(&scope, "  load_config ", &policy, &opts, &cancel).await.unwrap();
        assert!(!first.cache_hit);
        assert!(second.cache_hit);
        let stats = router.stats("repo");
        assert_eq!((stats.cache_hits, stats.cache_misses), (1, 1));
        assert_eq!(stats.direct.calls, 1);
        assert!((stats.cache_hit_ratio() - 0.5).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_cancelled_call() {
        let repo = scratch_repo();
        let router = router(None);
        let scope = RepoScope::new("repo", repo.path());
        let policy = policy(QueryStrategy::DirectOnly);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = router
            .retrieve(&scope, "load_config", &policy, &SearchOptions::from_policy(&policy), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, ReviewError::Cancelled));
    }

    #[tokio::test]
    async fn test_invalid_policy_rejected_before_search() {
        let repo = scratch_repo();
        let router = router(None);
        let scope = RepoScope::new("repo", repo.path());
        let policy = QueryPolicy {
            direct_enabled: false,
            vector_enabled: false,
            ..QueryPolicy::default()
        };
        let err = router
            .retrieve(&scope, "x", &policy, &SearchOptions::from_policy(&policy), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ReviewError::InvalidConfig(_)));
        assert_eq!(router.stats("repo").total_calls, 0);
    }
}
