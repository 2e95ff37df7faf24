//! Configuration parsing, validation, and per-repository policy resolution.
//!
//! The harness is configured from a single TOML file (default
//! `./config/rvw.toml`). Global sections supply defaults; a
//! `[repos."<repository>"]` table overrides any subset of them for one
//! repository. [`Config::effective_for`] deep-merges the two.
//!
//! # Example
//!
//! ```toml
//! [chunking]
//! max_tokens = 512
//!
//! [retrieval]
//! strategy = "direct_fallback"
//! vector_enabled = true
//! direct_enabled = true
//!
//! [review]
//! strategy = "hybrid"
//! max_tokens_per_request = 12000
//!
//! [repos."acme/api".comments]
//! max_comments_per_file = 2
//! ```

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::ReviewError;
use crate::models::Severity;

#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub tokenizer: TokenizerConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub linker: LinkerConfig,
    #[serde(default)]
    pub retrieval: QueryPolicy,
    #[serde(default)]
    pub review: ReviewSplitPolicy,
    #[serde(default)]
    pub comments: CommentPolicy,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub completion: CompletionConfig,
    /// Per-repository override tables, keyed by repository name.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub repos: BTreeMap<String, toml::Table>,
}

// ── Tokenizer ──────────────────────────────────────────────────────────

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct TokenizerConfig {
    /// `approx` or `hf`.
    #[serde(default = "default_tokenizer_profile")]
    pub profile: String,
    #[serde(default = "default_chars_per_token")]
    pub chars_per_token: usize,
    /// Path to a HuggingFace `tokenizer.json` (profile `hf`).
    #[serde(default)]
    pub path: Option<PathBuf>,
}

impl Default for TokenizerConfig {
    fn default() -> Self {
        Self {
            profile: default_tokenizer_profile(),
            chars_per_token: default_chars_per_token(),
            path: None,
        }
    }
}

fn default_tokenizer_profile() -> String {
    "approx".to_string()
}
fn default_chars_per_token() -> usize {
    4
}

// ── Chunking ───────────────────────────────────────────────────────────

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ChunkingConfig {
    /// Per-chunk token ceiling.
    #[serde(default = "default_chunk_max_tokens")]
    pub max_tokens: usize,
    /// Line-window height used when no syntax tree is available.
    #[serde(default = "default_window_lines")]
    pub window_lines: usize,
    #[serde(default = "default_overlap_lines")]
    pub overlap_lines: usize,
    /// Files above this size are not parsed (line windows only).
    #[serde(default = "default_ast_max_bytes")]
    pub ast_max_bytes: usize,
    #[serde(default = "default_include_globs")]
    pub include_globs: Vec<String>,
    #[serde(default = "default_index_excludes")]
    pub exclude_globs: Vec<String>,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            max_tokens: default_chunk_max_tokens(),
            window_lines: default_window_lines(),
            overlap_lines: default_overlap_lines(),
            ast_max_bytes: default_ast_max_bytes(),
            include_globs: default_include_globs(),
            exclude_globs: default_index_excludes(),
        }
    }
}

fn default_chunk_max_tokens() -> usize {
    512
}
fn default_window_lines() -> usize {
    40
}
fn default_overlap_lines() -> usize {
    5
}
fn default_ast_max_bytes() -> usize {
    500 * 1024
}
fn default_include_globs() -> Vec<String> {
    vec!["**/*".to_string()]
}
fn default_index_excludes() -> Vec<String> {
    vec![
        "**/.git/**".to_string(),
        "**/target/**".to_string(),
        "**/node_modules/**".to_string(),
    ]
}

// ── Linker ─────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct LinkerConfig {
    #[serde(default = "default_hop_limit")]
    pub hop_limit: usize,
    /// Token budget of the assembled context bundle.
    #[serde(default = "default_context_budget")]
    pub token_budget: usize,
    /// Changed files whose full text fits this many tokens are bundled whole.
    #[serde(default = "default_whole_file_max_tokens")]
    pub whole_file_max_tokens: usize,
    #[serde(default = "default_min_symbol_len")]
    pub min_symbol_len: usize,
}

impl Default for LinkerConfig {
    fn default() -> Self {
        Self {
            hop_limit: default_hop_limit(),
            token_budget: default_context_budget(),
            whole_file_max_tokens: default_whole_file_max_tokens(),
            min_symbol_len: default_min_symbol_len(),
        }
    }
}

fn default_hop_limit() -> usize {
    2
}
fn default_context_budget() -> usize {
    8000
}
fn default_whole_file_max_tokens() -> usize {
    1500
}
fn default_min_symbol_len() -> usize {
    3
}

// ── Retrieval (QueryPolicy) ────────────────────────────────────────────

/// How the router combines semantic and direct search.
#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum QueryStrategy {
    VectorOnly,
    DirectOnly,
    Hybrid,
    DirectFallback,
}

impl std::fmt::Display for QueryStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            QueryStrategy::VectorOnly => "vector_only",
            QueryStrategy::DirectOnly => "direct_only",
            QueryStrategy::Hybrid => "hybrid",
            QueryStrategy::DirectFallback => "direct_fallback",
        };
        f.write_str(s)
    }
}

/// Per-repository retrieval behavior.
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct QueryPolicy {
    #[serde(default = "default_query_strategy")]
    pub strategy: QueryStrategy,
    #[serde(default = "default_true")]
    pub direct_enabled: bool,
    #[serde(default = "default_true")]
    pub vector_enabled: bool,
    #[serde(default = "default_max_results")]
    pub max_results: usize,
    /// Files larger than this are not scanned by direct search.
    #[serde(default = "default_max_file_bytes")]
    pub max_file_bytes: u64,
    #[serde(default = "default_context_lines")]
    pub context_lines: usize,
    #[serde(default = "default_cache_ttl_secs")]
    pub cache_ttl_secs: u64,
    /// Semantic attempts slower than this count as failures under `direct_fallback`.
    #[serde(default = "default_latency_ceiling_ms")]
    pub latency_ceiling_ms: u64,
    #[serde(default = "default_index_excludes")]
    pub exclude_patterns: Vec<String>,
    #[serde(default)]
    pub include_patterns: Vec<String>,
    /// Restrict direct search to these extensions (empty = all).
    #[serde(default)]
    pub extensions: Vec<String>,
}

impl Default for QueryPolicy {
    fn default() -> Self {
        Self {
            strategy: default_query_strategy(),
            direct_enabled: true,
            vector_enabled: true,
            max_results: default_max_results(),
            max_file_bytes: default_max_file_bytes(),
            context_lines: default_context_lines(),
            cache_ttl_secs: default_cache_ttl_secs(),
            latency_ceiling_ms: default_latency_ceiling_ms(),
            exclude_patterns: default_index_excludes(),
            include_patterns: Vec::new(),
            extensions: Vec::new(),
        }
    }
}

impl QueryPolicy {
    /// Check the enable-flag invariants for the configured strategy.
    pub fn validate(&self) -> std::result::Result<(), ReviewError> {
        if !self.direct_enabled && !self.vector_enabled {
            return Err(ReviewError::InvalidConfig(
                "retrieval: at least one of direct_enabled / vector_enabled must be true".into(),
            ));
        }
        match self.strategy {
            QueryStrategy::VectorOnly if !self.vector_enabled => Err(ReviewError::InvalidConfig(
                "retrieval.strategy = vector_only requires vector_enabled = true".into(),
            )),
            QueryStrategy::DirectOnly if !self.direct_enabled => Err(ReviewError::InvalidConfig(
                "retrieval.strategy = direct_only requires direct_enabled = true".into(),
            )),
            _ => {
                if self.max_results == 0 {
                    return Err(ReviewError::InvalidConfig(
                        "retrieval.max_results must be > 0".into(),
                    ));
                }
                Ok(())
            }
        }
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }

    pub fn latency_ceiling(&self) -> Duration {
        Duration::from_millis(self.latency_ceiling_ms)
    }
}

fn default_query_strategy() -> QueryStrategy {
    QueryStrategy::DirectFallback
}
fn default_true() -> bool {
    true
}
fn default_max_results() -> usize {
    20
}
fn default_max_file_bytes() -> u64 {
    1024 * 1024
}
fn default_context_lines() -> usize {
    3
}
fn default_cache_ttl_secs() -> u64 {
    300
}
fn default_latency_ceiling_ms() -> u64 {
    5000
}

// ── Review (ReviewSplitPolicy) ─────────────────────────────────────────

#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SplitStrategy {
    Single,
    PerFile,
    ByTokenSize,
    Hybrid,
}

impl std::fmt::Display for SplitStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SplitStrategy::Single => "single",
            SplitStrategy::PerFile => "per_file",
            SplitStrategy::ByTokenSize => "by_token_size",
            SplitStrategy::Hybrid => "hybrid",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ReviewSplitPolicy {
    #[serde(default = "default_split_strategy")]
    pub strategy: SplitStrategy,
    #[serde(default = "default_max_files_per_request")]
    pub max_files_per_request: usize,
    #[serde(default = "default_max_tokens_per_request")]
    pub max_tokens_per_request: usize,
    #[serde(default = "default_max_tokens_per_file")]
    pub max_tokens_per_file: usize,
    #[serde(default = "default_max_concurrent_requests")]
    pub max_concurrent_requests: usize,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_true")]
    pub include_summary_when_split: bool,
}

impl Default for ReviewSplitPolicy {
    fn default() -> Self {
        Self {
            strategy: default_split_strategy(),
            max_files_per_request: default_max_files_per_request(),
            max_tokens_per_request: default_max_tokens_per_request(),
            max_tokens_per_file: default_max_tokens_per_file(),
            max_concurrent_requests: default_max_concurrent_requests(),
            request_timeout_secs: default_request_timeout_secs(),
            include_summary_when_split: true,
        }
    }
}

impl ReviewSplitPolicy {
    pub fn validate(&self) -> std::result::Result<(), ReviewError> {
        if self.max_tokens_per_request == 0 {
            return Err(ReviewError::InvalidConfig(
                "review.max_tokens_per_request must be > 0".into(),
            ));
        }
        if self.max_tokens_per_file > self.max_tokens_per_request {
            return Err(ReviewError::InvalidConfig(format!(
                "review.max_tokens_per_file ({}) must be <= max_tokens_per_request ({})",
                self.max_tokens_per_file, self.max_tokens_per_request
            )));
        }
        if self.max_files_per_request == 0 || self.max_concurrent_requests == 0 {
            return Err(ReviewError::InvalidConfig(
                "review.max_files_per_request and max_concurrent_requests must be > 0".into(),
            ));
        }
        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

fn default_split_strategy() -> SplitStrategy {
    SplitStrategy::Hybrid
}
fn default_max_files_per_request() -> usize {
    10
}
fn default_max_tokens_per_request() -> usize {
    12000
}
fn default_max_tokens_per_file() -> usize {
    4000
}
fn default_max_concurrent_requests() -> usize {
    4
}
fn default_request_timeout_secs() -> u64 {
    120
}

// ── Comments ───────────────────────────────────────────────────────────

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct CommentPolicy {
    #[serde(default = "default_true")]
    pub line_comments: bool,
    #[serde(default = "default_true")]
    pub summary_comment: bool,
    #[serde(default = "default_max_comments_per_file")]
    pub max_comments_per_file: usize,
    #[serde(default)]
    pub prefix: String,
    #[serde(default)]
    pub include_confidence: bool,
    #[serde(default = "default_min_severity")]
    pub min_severity: Severity,
    /// Identity the comments are posted under; part of the reconciliation key.
    #[serde(default = "default_bot_name")]
    pub bot_name: String,
}

impl Default for CommentPolicy {
    fn default() -> Self {
        Self {
            line_comments: true,
            summary_comment: true,
            max_comments_per_file: default_max_comments_per_file(),
            prefix: String::new(),
            include_confidence: false,
            min_severity: default_min_severity(),
            bot_name: default_bot_name(),
        }
    }
}

fn default_max_comments_per_file() -> usize {
    5
}
fn default_min_severity() -> Severity {
    Severity::Info
}
fn default_bot_name() -> String {
    "rvw-bot".to_string()
}

// ── External clients ───────────────────────────────────────────────────

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: None,
            dims: None,
            base_url: None,
            batch_size: default_batch_size(),
            max_retries: default_max_retries(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct CompletionConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default = "default_max_output_tokens")]
    pub max_output_tokens: usize,
    #[serde(default)]
    pub temperature: f32,
}

impl Default for CompletionConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: None,
            base_url: None,
            max_output_tokens: default_max_output_tokens(),
            temperature: 0.0,
        }
    }
}

impl CompletionConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

fn default_provider() -> String {
    "disabled".to_string()
}
fn default_batch_size() -> usize {
    64
}
fn default_max_retries() -> u32 {
    5
}
fn default_timeout_secs() -> u64 {
    30
}
fn default_max_output_tokens() -> usize {
    2048
}

// ── Loading and resolution ─────────────────────────────────────────────

impl Config {
    /// Check every section's invariants.
    pub fn validate(&self) -> Result<()> {
        if self.chunking.max_tokens == 0 {
            anyhow::bail!("chunking.max_tokens must be > 0");
        }
        if self.chunking.window_lines == 0 {
            anyhow::bail!("chunking.window_lines must be > 0");
        }
        if self.chunking.overlap_lines >= self.chunking.window_lines {
            anyhow::bail!("chunking.overlap_lines must be < chunking.window_lines");
        }
        if self.tokenizer.chars_per_token == 0 {
            anyhow::bail!("tokenizer.chars_per_token must be > 0");
        }
        match self.tokenizer.profile.as_str() {
            "approx" => {}
            "hf" => {
                if self.tokenizer.path.is_none() {
                    anyhow::bail!("tokenizer.path must be set when profile is 'hf'");
                }
            }
            other => anyhow::bail!("Unknown tokenizer profile: '{}'. Must be approx or hf.", other),
        }

        self.retrieval.validate()?;
        self.review.validate()?;

        if self.embedding.is_enabled() {
            if self.embedding.dims.is_none() || self.embedding.dims == Some(0) {
                anyhow::bail!(
                    "embedding.dims must be > 0 when provider is '{}'",
                    self.embedding.provider
                );
            }
            if self.embedding.model.is_none() {
                anyhow::bail!(
                    "embedding.model must be specified when provider is '{}'",
                    self.embedding.provider
                );
            }
        }
        match self.embedding.provider.as_str() {
            "disabled" | "openai" => {}
            other => anyhow::bail!(
                "Unknown embedding provider: '{}'. Must be disabled or openai.",
                other
            ),
        }
        match self.completion.provider.as_str() {
            "disabled" => {}
            "openai" => {
                if self.completion.model.is_none() {
                    anyhow::bail!("completion.model must be specified when provider is 'openai'");
                }
            }
            other => anyhow::bail!(
                "Unknown completion provider: '{}'. Must be disabled or openai.",
                other
            ),
        }
        Ok(())
    }

    /// Effective configuration for one repository: the global sections
    /// deep-merged with `[repos."<repository>"]`, then validated.
    pub fn effective_for(&self, repository: &str) -> Result<Config> {
        let Some(overrides) = self.repos.get(repository) else {
            let mut cfg = self.clone();
            cfg.repos.clear();
            return Ok(cfg);
        };

        let mut base = self.clone();
        base.repos.clear();
        let mut merged = toml::Value::try_from(&base).context("Failed to serialize base config")?;
        merge_toml(&mut merged, &toml::Value::Table(overrides.clone()));

        let cfg: Config = merged
            .try_into()
            .with_context(|| format!("Invalid override table for repository '{}'", repository))?;
        cfg.validate()
            .with_context(|| format!("Effective config for '{}' is invalid", repository))?;
        Ok(cfg)
    }
}

/// Recursively overlay `overlay` onto `base`; tables merge, everything else replaces.
fn merge_toml(base: &mut toml::Value, overlay: &toml::Value) {
    match (base, overlay) {
        (toml::Value::Table(base_table), toml::Value::Table(overlay_table)) => {
            for (key, value) in overlay_table {
                match base_table.get_mut(key) {
                    Some(existing) => merge_toml(existing, value),
                    None => {
                        base_table.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        (slot, value) => *slot = value.clone(),
    }
}

/// Source of effective per-repository policies.
///
/// Narrow scopes fall back to broader ones; [`Config`] implements this with
/// its `[repos]` override tables.
pub trait PolicySource: Send + Sync {
    fn effective(&self, repository: &str) -> Result<Config>;
}

impl PolicySource for Config {
    fn effective(&self, repository: &str) -> Result<Config> {
        self.effective_for(repository)
    }
}

pub fn parse_config(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content).with_context(|| "Failed to parse config file")?;
    config.validate()?;
    for repo in config.repos.keys() {
        config.effective_for(repo)?;
    }
    Ok(config)
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    parse_config(&content)
}
