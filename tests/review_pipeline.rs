//! End-to-end review runs over a scratch repository with in-memory
//! collaborators: a failing embedder, a scripted completion client, and an
//! in-memory comment host.

use anyhow::Result;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use review_harness::config::{parse_config, Config, PolicySource, QueryStrategy};
use review_harness::embedding::Embedder;
use review_harness::error::ReviewError;
use review_harness::host::{InMemoryCommentHost, LocalSourceHost, SourceHost};
use review_harness::models::{
    ChangeSet, Finding, MetaValue, RetrievalMethod, Severity, TriggerContext, TriggerEvent,
};
use review_harness::pipeline::ReviewHarness;
use review_harness::review::{CompletionClient, CompletionResponse, PromptPayload};
use review_harness::semantic::SemanticSearch;
use review_harness::store::memory::InMemoryVectorIndex;
use review_harness::tokenize::ApproxTokenizer;

// ── Fakes ──────────────────────────────────────────────────────────────

struct FailingEmbedder;

#[async_trait]
impl Embedder for FailingEmbedder {
    fn model_name(&self) -> &str {
        "failing"
    }
    fn dims(&self) -> usize {
        4
    }
    async fn embed(&self, _texts: &[String]) -> Result<Vec<Vec<f32>>> {
        anyhow::bail!("vector backend unavailable")
    }
}

/// Returns the findings queued for the current run, then a fixed summary.
struct ScriptedClient {
    findings: Mutex<Vec<Finding>>,
    fail: bool,
    calls: AtomicUsize,
    prompts: Mutex<Vec<String>>,
}

impl ScriptedClient {
    fn new(findings: Vec<Finding>) -> Self {
        Self {
            findings: Mutex::new(findings),
            fail: false,
            calls: AtomicUsize::new(0),
            prompts: Mutex::new(Vec::new()),
        }
    }

    fn failing() -> Self {
        Self {
            fail: true,
            ..Self::new(Vec::new())
        }
    }

    fn queue(&self, findings: Vec<Finding>) {
        *self.findings.lock() = findings;
    }
}

#[async_trait]
impl CompletionClient for ScriptedClient {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn complete(&self, payload: &PromptPayload, _timeout: Duration) -> Result<CompletionResponse> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.prompts.lock().push(payload.render());
        if self.fail {
            anyhow::bail!("completion API returned 503");
        }
        Ok(CompletionResponse {
            summary: Some("Reviewed.".into()),
            findings: self.findings.lock().clone(),
            prompt_tokens: payload.token_count,
            completion_tokens: 40,
        })
    }
}

/// Counts change-set lookups so tests can prove a run never started.
struct CountingSource {
    inner: LocalSourceHost,
    calls: AtomicUsize,
}

#[async_trait]
impl SourceHost for CountingSource {
    async fn change_set(&self, ctx: &TriggerContext) -> Result<ChangeSet> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.inner.change_set(ctx).await
    }
    async fn read_file(&self, ctx: &TriggerContext, path: &str) -> Result<Option<String>> {
        self.inner.read_file(ctx, path).await
    }
}

struct FixedPolicy(Config);

impl PolicySource for FixedPolicy {
    fn effective(&self, _repository: &str) -> Result<Config> {
        Ok(self.0.clone())
    }
}

// ── Fixtures ───────────────────────────────────────────────────────────

const DIFF: &str = "\
diff --git a/src/big.py b/src/big.py
--- a/src/big.py
+++ b/src/big.py
@@ -22,2 +22,2 @@
 def compute_07(x):
-    return x + 7
+    return x + 70
";

/// `src/big.py` with 50 small functions, `compute_07` already edited,
/// plus a caller in another file.
fn scratch_repo() -> tempfile::TempDir {
    let dir = tempfile::tempdir().unwrap();
    std::fs::create_dir_all(dir.path().join("src")).unwrap();
    let mut big = String::new();
    for i in 0..50 {
        let add = if i == 7 { 70 } else { i };
        big.push_str(&format!("def compute_{i:02}(x):\n    return x + {add}\n\n"));
    }
    std::fs::write(dir.path().join("src/big.py"), big).unwrap();
    std::fs::write(
        dir.path().join("src/caller.py"),
        "from big import compute_07\n\n\ndef use_it():\n    return compute_07(1)\n",
    )
    .unwrap();
    dir
}

fn config(extra: &str) -> Config {
    parse_config(&format!(
        r#"
[retrieval]
strategy = "direct_fallback"

[linker]
hop_limit = 0
whole_file_max_tokens = 0

{extra}
"#
    ))
    .unwrap()
}

fn trigger(repo: &tempfile::TempDir) -> TriggerContext {
    TriggerContext {
        event: TriggerEvent::PullRequest {
            repository: "acme/calc".into(),
            number: 7,
            action: "synchronize".into(),
            head_sha: "abc123".into(),
        },
        repo_path: repo.path().to_path_buf(),
    }
}

fn finding(line: usize, severity: Severity, message: &str) -> Finding {
    Finding {
        file_path: Some("src/big.py".into()),
        line: Some(line),
        severity,
        category: "bug".into(),
        message: message.into(),
        confidence: Some(0.9),
    }
}

fn harness(cfg: Config, client: Arc<ScriptedClient>, comments: Arc<InMemoryCommentHost>) -> ReviewHarness {
    let semantic = SemanticSearch::new(Arc::new(FailingEmbedder), Arc::new(InMemoryVectorIndex::new()));
    ReviewHarness::new(
        Arc::new(cfg),
        Arc::new(ApproxTokenizer::default()),
        Some(semantic),
        client,
        Arc::new(LocalSourceHost::from_diff_text(DIFF)),
        comments,
    )
}

// ── Tests ──────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_direct_fallback_end_to_end() {
    let repo = scratch_repo();
    let client = Arc::new(ScriptedClient::new(vec![finding(23, Severity::Medium, "Magic number 70")]));
    let h = harness(config(""), client.clone(), Arc::new(InMemoryCommentHost::new()));

    let outcome = h.run_review(&trigger(&repo), &CancellationToken::new()).await.unwrap();

    assert!(outcome.success, "{:?}", outcome.error);
    assert_eq!(outcome.metadata.retrieval_method, Some(RetrievalMethod::Direct));
    assert!(outcome.metadata.fallback_used);
    assert!(matches!(
        outcome.metadata.extra.get("indexed_units"),
        Some(MetaValue::Number(n)) if *n >= 50.0
    ));
    assert!(matches!(
        outcome.metadata.extra.get("retrieved_units"),
        Some(MetaValue::Number(n)) if *n >= 1.0
    ));

    let stats = h.router().stats("acme/calc");
    assert_eq!(stats.fallback_count, 1);
    assert_eq!(stats.served_direct, 1);
    assert_eq!(stats.served_semantic, 0);

    // The caller in the other file reached the prompt through direct search.
    let prompts = client.prompts.lock();
    assert!(prompts.iter().any(|p| p.contains("src/caller.py") && p.contains("direct search")));
    assert!(!prompts.iter().any(|p| p.contains("semantic search")));
}

#[tokio::test]
async fn test_rerun_leaves_only_second_annotation_set() {
    let repo = scratch_repo();
    let client = Arc::new(ScriptedClient::new(vec![
        finding(23, Severity::High, "first run finding a"),
        finding(22, Severity::Low, "first run finding b"),
    ]));
    let comments = Arc::new(InMemoryCommentHost::new());
    let h = harness(config(""), client.clone(), comments.clone());
    let ctx = trigger(&repo);

    let first = h.run_review(&ctx, &CancellationToken::new()).await.unwrap();
    h.reconcile(&first).await.unwrap();
    let after_first = comments.active().len();
    assert!(after_first >= 2);

    client.queue(vec![finding(23, Severity::Medium, "second run finding")]);
    let second = h.run_review(&ctx, &CancellationToken::new()).await.unwrap();
    assert_ne!(first.request_id, second.request_id);
    let summary = h.reconcile(&second).await.unwrap();

    assert_eq!(summary.deleted, after_first);
    let active = comments.active();
    assert_eq!(active.len(), summary.posted);
    assert!(active.iter().all(|p| p.comment.tag.request_id == second.request_id));
    assert!(active.iter().all(|p| !p.comment.body.contains("first run")));
}

#[tokio::test]
async fn test_overlapping_reconciles_keep_newest_set() {
    let repo = scratch_repo();
    let client = Arc::new(ScriptedClient::new(vec![finding(23, Severity::High, "older finding")]));
    let comments = Arc::new(InMemoryCommentHost::new());
    let h = harness(config(""), client.clone(), comments.clone());
    let ctx = trigger(&repo);

    let older = h.run_review(&ctx, &CancellationToken::new()).await.unwrap();
    client.queue(vec![finding(23, Severity::Medium, "newer finding")]);
    let mut newer = h.run_review(&ctx, &CancellationToken::new()).await.unwrap();
    newer.completed_at = older.completed_at + chrono::Duration::seconds(1);

    let (a, b) = tokio::join!(h.reconcile(&newer), h.reconcile(&older));
    a.unwrap();
    let late = b.unwrap();

    let active = comments.active();
    assert!(!active.is_empty());
    assert!(active.iter().all(|p| p.comment.tag.request_id == newer.request_id));
    assert!(late.skipped.is_some());
    assert_eq!(late.posted, 0);
}

#[tokio::test]
async fn test_per_file_cap_through_pipeline() {
    let repo = scratch_repo();
    let client = Arc::new(ScriptedClient::new(vec![
        finding(1, Severity::Low, "low"),
        finding(2, Severity::Critical, "critical"),
        finding(3, Severity::Info, "info"),
        finding(4, Severity::High, "high"),
        finding(5, Severity::Medium, "medium"),
    ]));
    let comments = Arc::new(InMemoryCommentHost::new());
    let cfg = config("[comments]\nmax_comments_per_file = 2\nsummary_comment = false\n");
    let h = harness(cfg, client, comments.clone());

    let outcome = h.run_review(&trigger(&repo), &CancellationToken::new()).await.unwrap();
    let summary = h.reconcile(&outcome).await.unwrap();

    assert_eq!(summary.posted, 2);
    let mut severities: Vec<Severity> = comments
        .active()
        .iter()
        .filter_map(|p| p.comment.severity)
        .collect();
    severities.sort();
    assert_eq!(severities, vec![Severity::High, Severity::Critical]);
}

#[tokio::test]
async fn test_total_failure_posts_nothing() {
    let repo = scratch_repo();
    let comments = Arc::new(InMemoryCommentHost::new());
    let h = harness(config(""), Arc::new(ScriptedClient::failing()), comments.clone());

    let outcome = h.run_review(&trigger(&repo), &CancellationToken::new()).await.unwrap();
    assert!(!outcome.success);
    assert!(outcome.error.as_deref().unwrap_or_default().contains("503"));
    assert!(outcome.findings.is_empty());

    let summary = h.reconcile(&outcome).await.unwrap();
    assert!(summary.skipped.is_some());
    assert_eq!(comments.post_count(), 0);
}

#[tokio::test]
async fn test_vector_only_with_failing_backend_is_total_failure() {
    let repo = scratch_repo();
    let mut cfg = config("");
    cfg.retrieval.strategy = QueryStrategy::VectorOnly;
    let client = Arc::new(ScriptedClient::new(Vec::new()));
    let h = harness(cfg, client.clone(), Arc::new(InMemoryCommentHost::new()));

    let outcome = h.run_review(&trigger(&repo), &CancellationToken::new()).await.unwrap();
    assert!(!outcome.success);
    assert!(outcome.error.is_some());
    assert_eq!(client.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_invalid_config_rejected_before_run() {
    let repo = scratch_repo();
    let mut cfg = config("");
    cfg.retrieval.direct_enabled = false;
    cfg.retrieval.vector_enabled = false;

    let source = Arc::new(CountingSource {
        inner: LocalSourceHost::from_diff_text(DIFF),
        calls: AtomicUsize::new(0),
    });
    let h = ReviewHarness::new(
        Arc::new(FixedPolicy(cfg)),
        Arc::new(ApproxTokenizer::default()),
        None,
        Arc::new(ScriptedClient::new(Vec::new())),
        source.clone(),
        Arc::new(InMemoryCommentHost::new()),
    );

    let err = h.run_review(&trigger(&repo), &CancellationToken::new()).await.unwrap_err();
    assert!(matches!(err, ReviewError::InvalidConfig(_)));
    assert_eq!(source.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_cancelled_run_returns_cancelled() {
    let repo = scratch_repo();
    let client = Arc::new(ScriptedClient::new(Vec::new()));
    let h = harness(config(""), client.clone(), Arc::new(InMemoryCommentHost::new()));
    let cancel = CancellationToken::new();
    cancel.cancel();

    let err = h.run_review(&trigger(&repo), &cancel).await.unwrap_err();
    assert!(matches!(err, ReviewError::Cancelled));
    assert_eq!(client.calls.load(Ordering::SeqCst), 0);
}
