//! Implementations behind the `rvw` subcommands.
//!
//! Each `run_*` function loads nothing itself; it receives the parsed
//! [`Config`] from `main` and prints human-readable output (or JSON where
//! noted) to stdout.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::chunk::Chunker;
use crate::config::{Config, QueryStrategy};
use crate::direct::{DirectSearch, FileListing, MatchMode, SearchOptions};
use crate::embedding::create_embedder;
use crate::host::{JsonFileCommentHost, LocalSourceHost};
use crate::indexer::{IndexReport, Indexer};
use crate::models::{RetrievalResult, TriggerContext, TriggerEvent};
use crate::pipeline::ReviewHarness;
use crate::router::{QueryRouter, RepoScope};
use crate::semantic::SemanticSearch;
use crate::store::memory::InMemoryVectorIndex;
use crate::tokenize::create_tokenizer;

/// Repository name used when none is given: the directory name of `root`.
pub fn repository_name(root: &Path, explicit: Option<&str>) -> String {
    if let Some(name) = explicit {
        return name.to_string();
    }
    root.canonicalize()
        .ok()
        .and_then(|p| p.file_name().map(|n| n.to_string_lossy().into_owned()))
        .unwrap_or_else(|| "local".to_string())
}

pub fn run_chunk(config: &Config, file: &Path, repository: &str) -> Result<()> {
    let content =
        std::fs::read_to_string(file).with_context(|| format!("Failed to read {}", file.display()))?;
    let tokenizer = create_tokenizer(&config.tokenizer)?;
    let chunker = Chunker::new(tokenizer, config.chunking.clone(), config.linker.min_symbol_len);
    let path = file.to_string_lossy().replace('\\', "/");
    let units = chunker.chunk_file(repository, &path, &content);

    if units.is_empty() {
        println!("No units.");
        return Ok(());
    }
    for unit in &units {
        println!(
            "{}:{}-{}  {}  {} tokens  [{}]",
            unit.file_path,
            unit.start_line,
            unit.end_line,
            unit.kind,
            unit.token_count,
            unit.symbols.join(", ")
        );
    }
    println!("\n{} unit(s), ceiling {} tokens", units.len(), chunker.max_tokens());
    Ok(())
}

/// Build a router over `root`, indexing it first when vector search is on.
async fn prepared_router(config: &Config, repository: &str, root: &Path) -> Result<(QueryRouter, IndexReport)> {
    let tokenizer = create_tokenizer(&config.tokenizer)?;
    let chunker = Chunker::new(tokenizer.clone(), config.chunking.clone(), config.linker.min_symbol_len);
    let indexer = Indexer::new(chunker, &config.chunking, config.retrieval.max_file_bytes)?;
    let mut report = IndexReport::default();

    let semantic = if config.embedding.is_enabled() && config.retrieval.vector_enabled {
        let semantic = SemanticSearch::new(
            create_embedder(&config.embedding)?,
            Arc::new(InMemoryVectorIndex::new()),
        );
        let units = indexer.chunk_repository(repository, root, &mut report)?;
        indexer
            .sync_embeddings(repository, &units, &semantic, config.embedding.batch_size, &mut report)
            .await?;
        Some(semantic)
    } else {
        None
    };
    Ok((QueryRouter::new(semantic, tokenizer), report))
}

pub async fn run_index(config: &Config, repository: &str, root: &Path) -> Result<()> {
    let tokenizer = create_tokenizer(&config.tokenizer)?;
    let chunker = Chunker::new(tokenizer, config.chunking.clone(), config.linker.min_symbol_len);
    let indexer = Indexer::new(chunker, &config.chunking, config.retrieval.max_file_bytes)?;
    let mut report = IndexReport::default();
    let units = indexer.chunk_repository(repository, root, &mut report)?;

    if config.embedding.is_enabled() {
        let semantic = SemanticSearch::new(
            create_embedder(&config.embedding)?,
            Arc::new(InMemoryVectorIndex::new()),
        );
        indexer
            .sync_embeddings(repository, &units, &semantic, config.embedding.batch_size, &mut report)
            .await?;
    }
    let graph = crate::linker::DependencyGraph::build(units);
    let edges: usize = graph.units().iter().map(|u| graph.neighbors(&u.id).len()).sum();

    println!("Indexed {} ({})", repository, root.display());
    println!("  files scanned:   {}", report.files_scanned);
    println!("  files skipped:   {}", report.files_skipped);
    println!("  units:           {}", report.units);
    println!("  links:           {}", edges / 2);
    if config.embedding.is_enabled() {
        println!("  embedded:        {}", report.embedded);
        println!("  unchanged:       {}", report.unchanged);
        println!("  embed failures:  {}", report.embed_failures);
    }
    Ok(())
}

pub async fn run_search(
    config: &Config,
    repository: &str,
    root: &Path,
    query: &str,
    strategy: Option<QueryStrategy>,
    limit: Option<usize>,
) -> Result<()> {
    let mut policy = config.retrieval.clone();
    if let Some(s) = strategy {
        policy.strategy = s;
    }
    let mut options = SearchOptions::from_policy(&policy).with_unit_ceiling(config.chunking.max_tokens);
    if let Some(limit) = limit {
        options.max_results = limit;
    }

    let (router, _) = prepared_router(config, repository, root).await?;
    let routed = router
        .retrieve(
            &RepoScope::new(repository, root),
            query,
            &policy,
            &options,
            &CancellationToken::new(),
        )
        .await?;

    print_result(&routed.result);
    println!("served by: {}", routed.served_by);
    if let Some(reason) = &routed.fallback_reason {
        println!("fallback: {}", reason);
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
pub async fn run_grep(
    config: &Config,
    repository: &str,
    root: &Path,
    pattern: &str,
    regex: bool,
    case_insensitive: bool,
    context: Option<usize>,
    extensions: Vec<String>,
    limit: Option<usize>,
) -> Result<()> {
    let tokenizer = create_tokenizer(&config.tokenizer)?;
    let search = DirectSearch::new(repository, root, tokenizer);
    let mut options = SearchOptions::from_policy(&config.retrieval).with_unit_ceiling(config.chunking.max_tokens);
    options.mode = if regex { MatchMode::Regex } else { MatchMode::Literal };
    options.case_insensitive = case_insensitive;
    if let Some(c) = context {
        options.context_lines = c;
    }
    if !extensions.is_empty() {
        options.extensions = extensions;
    }
    if let Some(limit) = limit {
        options.max_results = limit;
    }

    let result = search.search(pattern, &options).await?;
    print_result(&result);
    Ok(())
}

pub fn run_files(config: &Config, repository: &str, root: &Path, pattern: &str) -> Result<()> {
    let tokenizer = create_tokenizer(&config.tokenizer)?;
    let search = DirectSearch::new(repository, root, tokenizer);
    let listing = search.find_files(pattern, &SearchOptions::from_policy(&config.retrieval))?;
    print_listing(&listing);
    Ok(())
}

pub fn run_tree(config: &Config, repository: &str, root: &Path, subdir: Option<&str>, depth: usize) -> Result<()> {
    let tokenizer = create_tokenizer(&config.tokenizer)?;
    let search = DirectSearch::new(repository, root, tokenizer);
    let listing = search.list_tree(subdir, depth, config.retrieval.max_results.max(200))?;
    print_listing(&listing);
    Ok(())
}

pub struct ReviewArgs {
    pub repository: String,
    pub root: PathBuf,
    pub diff: PathBuf,
    pub comments: PathBuf,
    pub pull_request: u64,
    pub post: bool,
}

pub async fn run_review(config: Config, args: ReviewArgs) -> Result<()> {
    let comments = Arc::new(JsonFileCommentHost::new(&args.comments));
    let harness = ReviewHarness::from_config(config, Arc::new(LocalSourceHost::from_diff_file(&args.diff)), comments)?;

    let ctx = TriggerContext {
        event: TriggerEvent::PullRequest {
            repository: args.repository.clone(),
            number: args.pull_request,
            action: "synchronize".to_string(),
            head_sha: String::new(),
        },
        repo_path: args.root.clone(),
    };

    let cancel = CancellationToken::new();
    let ctrl_c = cancel.clone();
    let outcome = tokio::select! {
        r = harness.run_review(&ctx, &cancel) => r?,
        _ = tokio::signal::ctrl_c() => {
            ctrl_c.cancel();
            anyhow::bail!("Interrupted");
        }
    };

    println!("{}", serde_json::to_string_pretty(&outcome)?);

    if args.post {
        let summary = harness.reconcile(&outcome).await?;
        eprintln!(
            "comments: {} deleted, {} posted, {} suppressed, {} failure(s)",
            summary.deleted,
            summary.posted,
            summary.suppressed,
            summary.delete_failures + summary.post_failures
        );
    }
    Ok(())
}

/// Run `query` `repeat` times through one router and print its statistics.
pub async fn run_stats(config: &Config, repository: &str, root: &Path, query: &str, repeat: usize) -> Result<()> {
    let (router, _) = prepared_router(config, repository, root).await?;
    let scope = RepoScope::new(repository, root);
    let options = SearchOptions::from_policy(&config.retrieval).with_unit_ceiling(config.chunking.max_tokens);
    let cancel = CancellationToken::new();

    for _ in 0..repeat.max(1) {
        if let Err(e) = router
            .retrieve(&scope, query, &config.retrieval, &options, &cancel)
            .await
        {
            eprintln!("query failed: {}", e);
        }
    }

    let stats = router.stats(repository);
    println!("{}", serde_json::to_string_pretty(&stats)?);
    println!("cache hit ratio: {:.2}", stats.cache_hit_ratio());
    if let Some(advice) = router.advice(repository, &config.retrieval) {
        println!(
            "advice: switch {} -> {} ({})",
            advice.current, advice.recommended, advice.reason
        );
    }
    Ok(())
}

fn print_result(result: &RetrievalResult) {
    if result.is_empty() {
        println!("No results.");
    }
    for (i, item) in result.items.iter().enumerate() {
        println!(
            "{}. [{:.2}] {}:{}-{}",
            i + 1,
            item.score,
            item.unit.file_path,
            item.unit.start_line,
            item.unit.end_line
        );
        for line in item.unit.text.lines().take(6) {
            println!("    {}", line);
        }
        println!();
    }
    if result.skipped_files > 0 {
        println!("skipped files: {}", result.skipped_files);
    }
    if let Some(reason) = &result.truncation_reason {
        println!("truncated: {}", reason);
    }
}

fn print_listing(listing: &FileListing) {
    if listing.entries.is_empty() {
        println!("No entries.");
    }
    for entry in &listing.entries {
        println!("{}", entry);
    }
    if let Some(reason) = &listing.truncation_reason {
        println!("truncated: {}", reason);
    }
}
