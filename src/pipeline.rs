//! Review orchestration: the two operations exposed to the trigger layer.
//!
//! ```text
//! TriggerContext
//!   │ PolicySource::effective        (rejected here if invalid)
//!   │ SourceHost::change_set
//!   ▼
//! Indexer ── chunk + link (+ embed) ──▶ DependencyGraph
//!   │ whole files ≤ whole_file_max_tokens
//!   │ expand(diff units, hop_limit, token_budget)
//!   │ QueryRouter::retrieve(changed symbols) fills the remaining budget
//!   ▼
//! ContextBundle ── plan_requests ── dispatch ── merge_results ──▶ AnalysisOutcome
//!                                                                    │
//!                                               reconcile ◀──────────┘
//! ```
//!
//! `run_review` only returns `Err` for an invalid configuration or a
//! cancelled run. Everything else, including a total failure, is reported
//! as an [`AnalysisOutcome`] with `success = false`.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::chunk::Chunker;
use crate::config::{Config, PolicySource, SplitStrategy};
use crate::direct::SearchOptions;
use crate::embedding::create_embedder;
use crate::error::{ReviewError, Result};
use crate::host::{CommentHost, SourceHost};
use crate::indexer::{IndexReport, Indexer};
use crate::linker::DependencyGraph;
use crate::models::{
    AnalysisOutcome, ChangeSet, ContextBundle, ContextSource, FileContext, FileStatus, MetaValue, PostingSummary,
    TriggerContext,
};
use crate::reconcile::Reconciler;
use crate::review::{
    context_pieces, create_completion_client, diff_pieces, dispatch, merge_results, plan_requests, prompt_overhead,
    CompletionClient, MergedReview,
};
use crate::router::{QueryRouter, RepoScope, RoutedResult};
use crate::semantic::SemanticSearch;
use crate::store::memory::InMemoryVectorIndex;
use crate::symbols::declared_symbols;
use crate::tokenize::{create_tokenizer, Tokenizer};

/// Most symbols placed in the retrieval query built from a change-set.
const MAX_QUERY_TERMS: usize = 8;

/// Context assembled for one run.
struct Assembled {
    bundle: ContextBundle,
    routed: Option<RoutedResult>,
    index: IndexReport,
}

/// Owns the long-lived pieces of the review core.
///
/// The router (and with it the result cache and query statistics) and the
/// reconciler's per-trigger locks live as long as the harness; everything
/// else is per run.
pub struct ReviewHarness {
    policies: Arc<dyn PolicySource>,
    tokenizer: Arc<dyn Tokenizer>,
    router: QueryRouter,
    completion: Arc<dyn CompletionClient>,
    source: Arc<dyn SourceHost>,
    reconciler: Reconciler,
}

impl ReviewHarness {
    pub fn new(
        policies: Arc<dyn PolicySource>,
        tokenizer: Arc<dyn Tokenizer>,
        semantic: Option<SemanticSearch>,
        completion: Arc<dyn CompletionClient>,
        source: Arc<dyn SourceHost>,
        comments: Arc<dyn CommentHost>,
    ) -> Self {
        Self {
            router: QueryRouter::new(semantic, tokenizer.clone()),
            policies,
            tokenizer,
            completion,
            source,
            reconciler: Reconciler::new(comments),
        }
    }

    /// Build the harness from a loaded config, with an in-process vector index.
    pub fn from_config(config: Config, source: Arc<dyn SourceHost>, comments: Arc<dyn CommentHost>) -> anyhow::Result<Self> {
        let tokenizer = create_tokenizer(&config.tokenizer)?;
        let semantic = if config.embedding.is_enabled() {
            Some(SemanticSearch::new(
                create_embedder(&config.embedding)?,
                Arc::new(InMemoryVectorIndex::new()),
            ))
        } else {
            None
        };
        let completion = create_completion_client(&config.completion)?;
        Ok(Self::new(Arc::new(config), tokenizer, semantic, completion, source, comments))
    }

    pub fn router(&self) -> &QueryRouter {
        &self.router
    }

    pub fn tokenizer(&self) -> &Arc<dyn Tokenizer> {
        &self.tokenizer
    }

    fn effective_config(&self, repository: &str) -> Result<Config> {
        let config = self
            .policies
            .effective(repository)
            .map_err(|e| ReviewError::InvalidConfig(format!("{e:#}")))?;
        config
            .validate()
            .map_err(|e| ReviewError::InvalidConfig(format!("{e:#}")))?;
        Ok(config)
    }

    /// Analyze one trigger end to end and return its outcome.
    ///
    /// Every call gets a fresh request id, also when the trigger was
    /// analyzed before.
    pub async fn run_review(&self, ctx: &TriggerContext, cancel: &CancellationToken) -> Result<AnalysisOutcome> {
        let started = Instant::now();
        let request_id = Uuid::new_v4();
        let trigger = ctx.event.key();
        let repository = ctx.event.repository().to_string();

        let config = self.effective_config(&repository)?;

        tracing::info!(
            %request_id,
            %trigger,
            repo_path = %ctx.repo_path.display(),
            retrieval = %config.retrieval.strategy,
            split = %config.review.strategy,
            "review run started"
        );

        let merged = match self.analyze(ctx, &repository, &config, cancel).await {
            Ok(merged) => merged,
            Err(ReviewError::Cancelled) => {
                tracing::info!(%request_id, %trigger, "review run cancelled");
                return Err(ReviewError::Cancelled);
            }
            Err(e) => MergedReview {
                success: false,
                error: Some(e.to_string()),
                findings: Vec::new(),
                summary: None,
                metadata: Default::default(),
            },
        };

        let mut metadata = merged.metadata;
        metadata.elapsed_ms = started.elapsed().as_millis() as u64;

        let outcome = AnalysisOutcome {
            request_id,
            trigger,
            success: merged.success,
            error: merged.error,
            findings: merged.findings,
            summary: merged.summary,
            metadata,
            completed_at: Utc::now(),
        };

        if outcome.success {
            tracing::info!(
                request_id = %outcome.request_id,
                trigger = %outcome.trigger,
                findings = outcome.findings.len(),
                requests = outcome.metadata.requests_issued,
                failed_requests = outcome.metadata.requests_failed,
                elapsed_ms = outcome.metadata.elapsed_ms,
                "review run finished"
            );
        } else {
            tracing::warn!(
                request_id = %outcome.request_id,
                trigger = %outcome.trigger,
                error = outcome.error.as_deref().unwrap_or("unknown"),
                elapsed_ms = outcome.metadata.elapsed_ms,
                "review run failed"
            );
        }
        Ok(outcome)
    }

    /// Publish an outcome, replacing the trigger's previous annotation set.
    pub async fn reconcile(&self, outcome: &AnalysisOutcome) -> Result<PostingSummary> {
        let config = self.effective_config(&outcome.trigger.repository)?;
        self.reconciler
            .reconcile(outcome, &config.comments)
            .await
            .map_err(|e| ReviewError::Host(format!("{e:#}")))
    }

    async fn analyze(
        &self,
        ctx: &TriggerContext,
        repository: &str,
        config: &Config,
        cancel: &CancellationToken,
    ) -> Result<MergedReview> {
        let changes = self
            .source
            .change_set(ctx)
            .await
            .map_err(|e| ReviewError::Host(format!("{e:#}")))?;

        let reserved = prompt_overhead(self.tokenizer.as_ref(), self.completion.system_prompt());
        let diff = diff_pieces(
            &changes,
            self.tokenizer.as_ref(),
            config.review.max_tokens_per_file.saturating_sub(reserved),
        );
        if diff.is_empty() {
            return Ok(MergedReview {
                success: true,
                error: None,
                findings: Vec::new(),
                summary: Some("No reviewable changes.".to_string()),
                metadata: Default::default(),
            });
        }
        ensure_live(cancel)?;

        let assembled = self.assemble_context(ctx, repository, &changes, config, cancel).await?;
        ensure_live(cancel)?;

        let context = context_pieces(&assembled.bundle, self.tokenizer.as_ref());
        let plan = plan_requests(diff, context, &config.review, reserved);
        let strategy = plan.strategy;
        let outcomes = dispatch(self.completion.clone(), plan.requests, &config.review, cancel).await;
        ensure_live(cancel)?;

        let mut merged = merge_results(&outcomes, &config.review);
        record_context(&mut merged, &assembled, strategy);
        Ok(merged)
    }

    async fn assemble_context(
        &self,
        ctx: &TriggerContext,
        repository: &str,
        changes: &ChangeSet,
        config: &Config,
        cancel: &CancellationToken,
    ) -> Result<Assembled> {
        let chunker = Chunker::new(self.tokenizer.clone(), config.chunking.clone(), config.linker.min_symbol_len);
        let indexer = Indexer::new(chunker, &config.chunking, config.retrieval.max_file_bytes)?;
        let mut index = IndexReport::default();
        let graph = indexer.build_graph(repository, &ctx.repo_path, &mut index)?;

        if config.retrieval.vector_enabled {
            if let Some(semantic) = self.router.semantic() {
                let synced = indexer
                    .sync_embeddings(repository, graph.units(), semantic, config.embedding.batch_size, &mut index)
                    .await;
                if let Err(e) = synced {
                    tracing::warn!(repository, error = %format!("{e:#}"), "vector index sync failed");
                }
            }
        }
        ensure_live(cancel)?;

        let mut bundle = ContextBundle::new(config.linker.token_budget);

        for file in changes.files.iter().filter(|f| f.status != FileStatus::Deleted) {
            match self.source.read_file(ctx, &file.path).await {
                Ok(Some(content)) => {
                    let token_count = self.tokenizer.count(&content);
                    if token_count <= config.linker.whole_file_max_tokens {
                        bundle.try_add_file(FileContext {
                            path: file.path.clone(),
                            content,
                            token_count,
                        });
                    }
                }
                Ok(None) => {}
                Err(e) => tracing::debug!(path = %file.path, error = %format!("{e:#}"), "changed file unreadable"),
            }
        }

        let seeds = seed_units(&graph, changes);
        graph.expand_into(&mut bundle, &seeds, config.linker.hop_limit);

        let query = retrieval_query(&graph, &seeds, changes);
        let routed = if query.is_empty() {
            tracing::debug!(repository, "no symbols in change-set; retrieval skipped");
            None
        } else {
            let scope = RepoScope::new(repository, &ctx.repo_path);
            let options = SearchOptions::from_policy(&config.retrieval).with_unit_ceiling(config.chunking.max_tokens);
            let routed = self
                .router
                .retrieve(&scope, &query, &config.retrieval, &options, cancel)
                .await?;
            for item in &routed.result.items {
                if bundle.contains_unit(&item.unit.id) || bundle.covers(&item.unit) {
                    continue;
                }
                let mut unit = item.unit.clone();
                unit.relevance = item.score;
                bundle.try_add_unit(
                    unit,
                    ContextSource::Retrieved {
                        method: routed.served_by,
                    },
                );
            }
            Some(routed)
        };

        tracing::debug!(
            repository,
            units = bundle.units.len(),
            files = bundle.files.len(),
            tokens = bundle.total_tokens,
            budget = bundle.budget,
            truncated = bundle.truncated,
            "context assembled"
        );

        Ok(Assembled { bundle, routed, index })
    }
}

fn ensure_live(cancel: &CancellationToken) -> Result<()> {
    if cancel.is_cancelled() {
        Err(ReviewError::Cancelled)
    } else {
        Ok(())
    }
}

/// Units overlapping any changed hunk, in change-set order.
fn seed_units(graph: &DependencyGraph, changes: &ChangeSet) -> Vec<String> {
    let mut seen = BTreeSet::new();
    let mut seeds = Vec::new();
    for file in changes.files.iter().filter(|f| f.status != FileStatus::Deleted) {
        for hunk in &file.hunks {
            let (start, end) = hunk.new_range();
            for unit in graph.units_touching(&file.path, start, end) {
                if seen.insert(unit.id.clone()) {
                    seeds.push(unit.id.clone());
                }
            }
        }
    }
    seeds
}

/// Symbols declared by the changed units, then by the added lines.
fn retrieval_query(graph: &DependencyGraph, seeds: &[String], changes: &ChangeSet) -> String {
    let mut seen = BTreeSet::new();
    let mut terms = Vec::new();
    let mut push = |symbol: &str| {
        if terms.len() < MAX_QUERY_TERMS && seen.insert(symbol.to_string()) {
            terms.push(symbol.to_string());
        }
    };

    for id in seeds {
        if let Some(unit) = graph.unit(id) {
            unit.symbols.iter().for_each(|s| push(s));
        }
    }
    for file in &changes.files {
        for hunk in &file.hunks {
            let added: String = hunk
                .lines
                .iter()
                .filter_map(|l| l.strip_prefix('+'))
                .collect::<Vec<_>>()
                .join("\n");
            declared_symbols(&added).iter().for_each(|s| push(s));
        }
    }
    terms.join(" ")
}

fn record_context(merged: &mut MergedReview, assembled: &Assembled, strategy: SplitStrategy) {
    let bundle = &assembled.bundle;
    let meta = &mut merged.metadata;
    meta.context_truncated = bundle.truncated;
    if let Some(routed) = &assembled.routed {
        meta.retrieval_method = Some(routed.served_by);
        meta.fallback_used = routed.fallback_used;
        meta.extra.insert("cache_hit".into(), MetaValue::Flag(routed.cache_hit));
        if let Some(reason) = &routed.fallback_reason {
            meta.extra.insert("fallback_reason".into(), MetaValue::Text(reason.clone()));
        }
    }
    if let Some(reason) = &bundle.truncation_reason {
        meta.extra.insert("truncation_reason".into(), MetaValue::Text(reason.clone()));
    }

    let retrieved = bundle
        .units
        .iter()
        .filter(|b| matches!(b.source, ContextSource::Retrieved { .. }))
        .count();
    let extra = &mut meta.extra;
    extra.insert("split_strategy".into(), MetaValue::Text(strategy.to_string()));
    extra.insert("context_tokens".into(), MetaValue::Number(bundle.total_tokens as f64));
    extra.insert("context_units".into(), MetaValue::Number(bundle.units.len() as f64));
    extra.insert("retrieved_units".into(), MetaValue::Number(retrieved as f64));
    extra.insert(
        "whole_files".into(),
        MetaValue::List(bundle.files.iter().map(|f| f.path.clone()).collect()),
    );
    extra.insert("indexed_units".into(), MetaValue::Number(assembled.index.units as f64));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diff::parse_unified_diff;

    #[test]
    fn test_query_prefers_changed_unit_symbols() {
        let tokenizer: Arc<dyn Tokenizer> = Arc::new(crate::tokenize::ApproxTokenizer::default());
        let chunker = Chunker::new(tokenizer, Default::default(), 3);
        let units = chunker.chunk_file(
            "r",
            "src/lib.rs",
            "pub fn parse_header() {}\n\npub fn render_body() {}\n",
        );
        let graph = DependencyGraph::build(units);
        let changes = parse_unified_diff(
            "--- a/src/lib.rs\n+++ b/src/lib.rs\n@@ -3,1 +3,2 @@\n pub fn render_body() {}\n+fn helper_added() {}\n",
        )
        .unwrap();

        let seeds = seed_units(&graph, &changes);
        assert!(!seeds.is_empty());
        let query = retrieval_query(&graph, &seeds, &changes);
        assert!(query.contains("render_body"));
        assert!(query.contains("helper_added"));
        assert!(!query.contains("parse_header"));
    }
}
