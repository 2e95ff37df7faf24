//! Query router behavior over a scratch repository: fallback accounting,
//! single-flight caching, hybrid merging, and policy validation.

use anyhow::Result;
use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use review_harness::config::{QueryPolicy, QueryStrategy};
use review_harness::direct::SearchOptions;
use review_harness::embedding::Embedder;
use review_harness::error::ReviewError;
use review_harness::models::{content_hash, CodeUnit, RetrievalMethod, RetrievalResult, ScoredUnit, UnitKind};
use review_harness::router::{merge_hybrid, QueryRouter, RepoScope};
use review_harness::semantic::SemanticSearch;
use review_harness::store::memory::InMemoryVectorIndex;
use review_harness::tokenize::ApproxTokenizer;

struct FailingEmbedder;

#[async_trait]
impl Embedder for FailingEmbedder {
    fn model_name(&self) -> &str {
        "failing"
    }
    fn dims(&self) -> usize {
        2
    }
    async fn embed(&self, _texts: &[String]) -> Result<Vec<Vec<f32>>> {
        anyhow::bail!("index unavailable")
    }
}

/// Slow embedder that counts how often it is called.
struct SlowEmbedder {
    calls: AtomicUsize,
}

#[async_trait]
impl Embedder for SlowEmbedder {
    fn model_name(&self) -> &str {
        "slow"
    }
    fn dims(&self) -> usize {
        2
    }
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(150)).await;
        Ok(texts.iter().map(|_| vec![1.0, 0.0]).collect())
    }
}

fn scratch_repo() -> tempfile::TempDir {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(
        dir.path().join("config.rs"),
        "pub fn load_config() {}\n\npub fn parse_config() {}\n\npub fn save_config() {}\n",
    )
    .unwrap();
    dir
}

fn router(embedder: Arc<dyn Embedder>) -> QueryRouter {
    QueryRouter::new(
        Some(SemanticSearch::new(embedder, Arc::new(InMemoryVectorIndex::new()))),
        Arc::new(ApproxTokenizer::default()),
    )
}

fn policy(strategy: QueryStrategy) -> QueryPolicy {
    QueryPolicy {
        strategy,
        ..QueryPolicy::default()
    }
}

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
        token_count: 4,
        symbols: vec![],
        references: vec![],
        relevance: 0.0,
        dependencies: vec![],
    }
}

#[tokio::test]
async fn test_each_semantic_failure_counts_one_fallback() {
    let repo = scratch_repo();
    let router = router(Arc::new(FailingEmbedder));
    let scope = RepoScope::new("repo", repo.path());
    let policy = policy(QueryStrategy::DirectFallback);
    let options = SearchOptions::from_policy(&policy);
    let cancel = CancellationToken::new();

    let queries = ["load_config", "parse_config", "save_config"];
    for q in queries {
        let routed = router.retrieve(&scope, q, &policy, &options, &cancel).await.unwrap();
        assert_eq!(routed.served_by, RetrievalMethod::Direct);
        assert!(routed.fallback_used);
        assert!(!routed.result.is_empty());
    }

    let stats = router.stats("repo");
    assert_eq!(stats.fallback_count, queries.len() as u64);
    assert_eq!(stats.served_direct, queries.len() as u64);
    assert_eq!(stats.semantic.failures, queries.len() as u64);
}

#[tokio::test]
async fn test_slow_semantic_search_falls_back_at_latency_ceiling() {
    let repo = scratch_repo();
    let embedder = Arc::new(SlowEmbedder {
        calls: AtomicUsize::new(0),
    });
    let router = router(embedder.clone());
    let scope = RepoScope::new("repo", repo.path());
    let policy = QueryPolicy {
        strategy: QueryStrategy::DirectFallback,
        latency_ceiling_ms: 20,
        ..QueryPolicy::default()
    };
    let options = SearchOptions::from_policy(&policy);

    let routed = router
        .retrieve(&scope, "load_config", &policy, &options, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(routed.served_by, RetrievalMethod::Direct);
    assert!(routed.fallback_used);
    assert!(!routed.result.is_empty());
    let reason = routed.fallback_reason.unwrap();
    assert!(reason.contains("latency ceiling"), "{reason}");
    assert_eq!(embedder.calls.load(Ordering::SeqCst), 1);

    let stats = router.stats("repo");
    assert_eq!(stats.fallback_count, 1);
    assert_eq!(stats.served_direct, 1);
    assert_eq!(stats.semantic.failures, 1);
}

#[tokio::test]
async fn test_concurrent_identical_queries_share_one_computation() {
    let repo = scratch_repo();
    let embedder = Arc::new(SlowEmbedder {
        calls: AtomicUsize::new(0),
    });
    let router = router(embedder.clone());
    let scope = RepoScope::new("repo", repo.path());
    let policy = policy(QueryStrategy::VectorOnly);
    let options = SearchOptions::from_policy(&policy);
    let cancel = CancellationToken::new();

    let (a, b) = tokio::join!(
        router.retrieve(&scope, "load config", &policy, &options, &cancel),
        router.retrieve(&scope, "load   config", &policy, &options, &cancel),
    );
    a.unwrap();
    b.unwrap();
    let third = router
        .retrieve(&scope, "load config", &policy, &options, &cancel)
        .await
        .unwrap();
    assert!(third.cache_hit);

    assert_eq!(embedder.calls.load(Ordering::SeqCst), 1);
    let stats = router.stats("repo");
    assert_eq!(stats.cache_misses, 1);
    assert_eq!(stats.cache_hits, 2);
    assert!((stats.cache_hit_ratio() - 2.0 / 3.0).abs() < 1e-9);
}

#[tokio::test]
async fn test_cache_hit_ratio_is_zero_before_lookups() {
    let router = router(Arc::new(FailingEmbedder));
    assert_eq!(router.stats("unseen").cache_hit_ratio(), 0.0);
}

#[tokio::test]
async fn test_vector_only_failure_is_not_substituted() {
    let repo = scratch_repo();
    let router = router(Arc::new(FailingEmbedder));
    let policy = policy(QueryStrategy::VectorOnly);
    let err = router
        .retrieve(
            &RepoScope::new("repo", repo.path()),
            "load_config",
            &policy,
            &SearchOptions::from_policy(&policy),
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        ReviewError::MethodUnavailable {
            method: RetrievalMethod::Semantic,
            ..
        }
    ));
    assert_eq!(router.stats("repo").fallback_count, 0);
}

#[tokio::test]
async fn test_policy_without_methods_is_rejected() {
    let repo = scratch_repo();
    let router = router(Arc::new(FailingEmbedder));
    let policy = QueryPolicy {
        direct_enabled: false,
        vector_enabled: false,
        ..QueryPolicy::default()
    };
    let err = router
        .retrieve(
            &RepoScope::new("repo", repo.path()),
            "x",
            &policy,
            &SearchOptions::from_policy(&policy),
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, ReviewError::InvalidConfig(_)));
    assert_eq!(router.stats("repo").total_calls, 0);
}

#[test]
fn test_hybrid_merge_keeps_higher_scored_overlap() {
    let semantic = RetrievalResult::new(
        "q",
        RetrievalMethod::Semantic,
        vec![
            ScoredUnit {
                unit: unit("a.rs", 1, 10),
                score: 0.9,
            },
            ScoredUnit {
                unit: unit("b.rs", 1, 5),
                score: 0.2,
            },
        ],
    );
    let direct = RetrievalResult::new(
        "q",
        RetrievalMethod::Direct,
        vec![
            ScoredUnit {
                unit: unit("a.rs", 5, 12),
                score: 0.4,
            },
            ScoredUnit {
                unit: unit("b.rs", 3, 8),
                score: 0.8,
            },
            ScoredUnit {
                unit: unit("c.rs", 1, 2),
                score: 0.1,
            },
        ],
    );

    let merged = merge_hybrid("q", semantic, direct, 10);

    for (i, a) in merged.items.iter().enumerate() {
        for b in merged.items.iter().skip(i + 1) {
            assert!(!a.unit.overlaps(&b.unit), "{} overlaps {}", a.unit.file_path, b.unit.file_path);
        }
    }
    let spans: Vec<(&str, usize)> = merged
        .items
        .iter()
        .map(|s| (s.unit.file_path.as_str(), s.unit.start_line))
        .collect();
    assert!(spans.contains(&("a.rs", 1)));
    assert!(spans.contains(&("b.rs", 3)));
    assert!(spans.contains(&("c.rs", 1)));
    assert_eq!(merged.len(), 3);
    for w in merged.items.windows(2) {
        assert!(w[0].score >= w[1].score);
    }
}
