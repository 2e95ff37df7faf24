//! Direct search: filesystem pattern matching with no embeddings.
//!
//! Walks a repository working tree (walkdir + globset filters), matches a
//! literal, regular-expression, or any-term pattern line by line, and turns
//! each match (plus a symmetric context window) into a snippet
//! [`CodeUnit`]. Overlapping windows in one file are merged while the merged
//! snippet stays under `max_unit_tokens`; larger windows are cut the way the
//! chunker cuts an oversized span.
//!
//! Failure model:
//! - no matches is an empty, successful result
//! - an unreadable file is skipped and counted in `skipped_files`
//! - only an invalid pattern or a missing root fails the whole call

use anyhow::{bail, Context, Result};
use globset::{Glob, GlobSet, GlobSetBuilder};
use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};
use std::io::Read;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use walkdir::WalkDir;

use crate::chunk::{fit_lines, Language};
use crate::config::{ChunkingConfig, QueryPolicy};
use crate::models::{content_hash, CodeUnit, RetrievalMethod, RetrievalResult, ScoredUnit, UnitKind};
use crate::symbols;
use crate::tokenize::Tokenizer;

/// Bytes inspected for NUL when deciding whether a file is binary.
const BINARY_SNIFF_BYTES: usize = 8000;

/// How the search pattern is interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchMode {
    /// Exact substring.
    Literal,
    /// Regular expression (`regex` crate syntax).
    Regex,
    /// Whitespace-separated terms; a line matches if it contains any term as a word.
    AnyTerm,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SearchOptions {
    pub mode: MatchMode,
    #[serde(default)]
    pub case_insensitive: bool,
    /// Relative-path globs a file must match (empty = all files).
    #[serde(default)]
    pub include: Vec<String>,
    #[serde(default)]
    pub exclude: Vec<String>,
    /// Allowed extensions without the dot (empty = all).
    #[serde(default)]
    pub extensions: Vec<String>,
    pub max_results: usize,
    pub max_file_bytes: u64,
    pub context_lines: usize,
    #[serde(default)]
    pub include_binary: bool,
    /// Token ceiling for one snippet unit, the same ceiling the chunker uses.
    #[serde(default = "default_max_unit_tokens")]
    pub max_unit_tokens: usize,
}

fn default_max_unit_tokens() -> usize {
    ChunkingConfig::default().max_tokens
}

impl Default for SearchOptions {
    fn default() -> Self {
        Self::from_policy(&QueryPolicy::default())
    }
}

impl SearchOptions {
    pub fn from_policy(policy: &QueryPolicy) -> Self {
        Self {
            mode: MatchMode::AnyTerm,
            case_insensitive: false,
            include: policy.include_patterns.clone(),
            exclude: policy.exclude_patterns.clone(),
            extensions: policy.extensions.clone(),
            max_results: policy.max_results,
            max_file_bytes: policy.max_file_bytes,
            context_lines: policy.context_lines,
            include_binary: false,
            max_unit_tokens: default_max_unit_tokens(),
        }
    }

    /// Cap every snippet at `max_tokens` (normally `chunking.max_tokens`).
    pub fn with_unit_ceiling(mut self, max_tokens: usize) -> Self {
        self.max_unit_tokens = max_tokens.max(1);
        self
    }

    fn build_matcher(&self, pattern: &str) -> Result<Option<Regex>> {
        let source = match self.mode {
            MatchMode::Literal => {
                if pattern.is_empty() {
                    return Ok(None);
                }
                regex::escape(pattern)
            }
            MatchMode::Regex => {
                if pattern.is_empty() {
                    return Ok(None);
                }
                pattern.to_string()
            }
            MatchMode::AnyTerm => {
                let terms: Vec<String> = pattern
                    .split(|c: char| c.is_whitespace() || c == '|' || c == ',')
                    .filter(|t| !t.is_empty())
                    .map(regex::escape)
                    .collect();
                if terms.is_empty() {
                    return Ok(None);
                }
                format!(r"\b(?:{})\b", terms.join("|"))
            }
        };
        let regex = RegexBuilder::new(&source)
            .case_insensitive(self.case_insensitive)
            .build()
            .with_context(|| format!("Invalid search pattern: {}", pattern))?;
        Ok(Some(regex))
    }
}

/// A file or directory listing from [`DirectSearch::find_files`] / [`DirectSearch::list_tree`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FileListing {
    pub entries: Vec<String>,
    pub truncated: bool,
    pub truncation_reason: Option<String>,
}

impl FileListing {
    fn mark_truncated(&mut self, reason: String) {
        if !self.truncated {
            self.truncated = true;
            self.truncation_reason = Some(reason);
        }
    }
}

/// Direct search over one repository working tree.
#[derive(Clone)]
pub struct DirectSearch {
    repository: String,
    root: PathBuf,
    tokenizer: Arc<dyn Tokenizer>,
}

impl DirectSearch {
    pub fn new(repository: impl Into<String>, root: impl Into<PathBuf>, tokenizer: Arc<dyn Tokenizer>) -> Self {
        Self {
            repository: repository.into(),
            root: root.into(),
            tokenizer,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Run [`search_blocking`](Self::search_blocking) on the blocking pool.
    pub async fn search(&self, pattern: &str, options: &SearchOptions) -> Result<RetrievalResult> {
        let this = self.clone();
        let pattern = pattern.to_string();
        let options = options.clone();
        tokio::task::spawn_blocking(move || this.search_blocking(&pattern, &options))
            .await
            .context("direct search task panicked")?
    }

    pub fn search_blocking(&self, pattern: &str, options: &SearchOptions) -> Result<RetrievalResult> {
        if !self.root.is_dir() {
            bail!("Repository root does not exist: {}", self.root.display());
        }
        let Some(matcher) = options.build_matcher(pattern)? else {
            return Ok(RetrievalResult::empty(pattern, RetrievalMethod::Direct));
        };
        let filter = PathFilter::new(options)?;

        let mut hits: Vec<(CodeUnit, usize)> = Vec::new();
        let mut skipped = 0usize;
        // Stop scanning once far more windows than needed have been collected.
        let scan_cap = options.max_results.saturating_mul(20).max(options.max_results);
        let mut scan_stopped = false;

        for entry in self.walk(&filter) {
            let entry = match entry {
                Ok(e) => e,
                Err(e) => {
                    tracing::debug!(error = %e, "skipping unreadable path");
                    skipped += 1;
                    continue;
                }
            };
            if !entry.file_type().is_file() {
                continue;
            }
            let rel = relative(&self.root, entry.path());
            if !filter.accepts_file(&rel) {
                continue;
            }

            let content = match read_text(entry.path(), options) {
                Ok(Some(text)) => text,
                Ok(None) => continue,
                Err(e) => {
                    tracing::debug!(path = %rel, error = %e, "skipping file");
                    skipped += 1;
                    continue;
                }
            };

            hits.extend(self.match_file(&rel, &content, &matcher, options));
            if hits.len() >= scan_cap {
                scan_stopped = true;
                break;
            }
        }

        let max_count = hits.iter().map(|(_, n)| *n).max().unwrap_or(1).max(1) as f64;
        let items: Vec<ScoredUnit> = hits
            .into_iter()
            .map(|(mut unit, count)| {
                let score = count as f64 / max_count;
                unit.relevance = score;
                ScoredUnit { unit, score }
            })
            .collect();

        let mut result = RetrievalResult::new(pattern, RetrievalMethod::Direct, items);
        result.skipped_files = skipped;
        if scan_stopped {
            result.truncated = true;
            result.truncation_reason = Some(format!("scan stopped after {} match windows", scan_cap));
        }
        result.truncate(options.max_results);
        Ok(result)
    }

    /// Files whose name (or relative path) matches `name_pattern`, a glob.
    pub fn find_files(&self, name_pattern: &str, options: &SearchOptions) -> Result<FileListing> {
        if !self.root.is_dir() {
            bail!("Repository root does not exist: {}", self.root.display());
        }
        let glob = Glob::new(name_pattern)
            .with_context(|| format!("Invalid file pattern: {}", name_pattern))?
            .compile_matcher();
        let filter = PathFilter::new(options)?;

        let mut listing = FileListing::default();
        for entry in self.walk(&filter).filter_map(|e| e.ok()) {
            if !entry.file_type().is_file() {
                continue;
            }
            let rel = relative(&self.root, entry.path());
            if !filter.accepts_file(&rel) {
                continue;
            }
            let name = entry.file_name().to_string_lossy();
            if glob.is_match(name.as_ref()) || glob.is_match(&rel) {
                if listing.entries.len() >= options.max_results {
                    listing.mark_truncated(format!(
                        "more than {} files match '{}'",
                        options.max_results, name_pattern
                    ));
                    break;
                }
                listing.entries.push(rel);
            }
        }
        Ok(listing)
    }

    /// Depth-bounded listing of the tree under `subdir` (directories end in `/`).
    pub fn list_tree(&self, subdir: Option<&str>, depth: usize, max_entries: usize) -> Result<FileListing> {
        let base = match subdir {
            Some(sub) => self.resolve(sub)?,
            None => self.root.clone(),
        };
        if !base.is_dir() {
            bail!("Not a directory: {}", base.display());
        }
        let filter = PathFilter::new(&SearchOptions::default())?;

        let mut listing = FileListing::default();
        let walker = WalkDir::new(&base)
            .min_depth(1)
            .max_depth(depth.max(1))
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|e| !filter.excludes(&relative(&self.root, e.path())));

        for entry in walker.filter_map(|e| e.ok()) {
            if listing.entries.len() >= max_entries {
                listing.mark_truncated(format!("listing capped at {} entries", max_entries));
                break;
            }
            let rel = relative(&self.root, entry.path());
            if entry.file_type().is_dir() {
                if entry.depth() == depth.max(1) && dir_has_children(entry.path()) {
                    listing.mark_truncated(format!("depth limit {} reached", depth.max(1)));
                }
                listing.entries.push(format!("{rel}/"));
            } else {
                listing.entries.push(rel);
            }
        }
        Ok(listing)
    }

    /// Read a file relative to the root, capped at `max_bytes`.
    ///
    /// Returns the text and whether it was cut short.
    pub fn read_file(&self, rel_path: &str, max_bytes: u64) -> Result<(String, bool)> {
        let path = self.resolve(rel_path)?;
        let file = std::fs::File::open(&path)
            .with_context(|| format!("Failed to open {}", path.display()))?;
        let mut buf = Vec::new();
        file.take(max_bytes.saturating_add(1)).read_to_end(&mut buf)?;
        let truncated = buf.len() as u64 > max_bytes;
        buf.truncate(max_bytes as usize);
        let mut text = String::from_utf8_lossy(&buf).into_owned();
        if truncated {
            // Drop a partial trailing line.
            if let Some(pos) = text.rfind('\n') {
                text.truncate(pos + 1);
            }
        }
        Ok((text, truncated))
    }

    fn resolve(&self, rel_path: &str) -> Result<PathBuf> {
        let rel = Path::new(rel_path);
        if rel.is_absolute() || rel.components().any(|c| matches!(c, Component::ParentDir)) {
            bail!("Path escapes repository root: {}", rel_path);
        }
        Ok(self.root.join(rel))
    }

    fn walk<'a>(
        &'a self,
        filter: &'a PathFilter,
    ) -> impl Iterator<Item = walkdir::Result<walkdir::DirEntry>> + 'a {
        WalkDir::new(&self.root)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(move |e| e.depth() == 0 || !filter.excludes(&relative(&self.root, e.path())))
    }

    fn match_file(
        &self,
        rel: &str,
        content: &str,
        matcher: &Regex,
        options: &SearchOptions,
    ) -> Vec<(CodeUnit, usize)> {
        let lines: Vec<&str> = content.lines().collect();
        let counts: Vec<usize> = lines.iter().map(|line| matcher.find_iter(line).count()).collect();
        if counts.iter().all(|&n| n == 0) {
            return Vec::new();
        }
        let max = options.max_unit_tokens.max(1);
        let tokenizer = self.tokenizer.as_ref();
        let last_row = lines.len() - 1;

        // Merge overlapping or touching windows while the merge fits the ceiling.
        let mut windows: Vec<(usize, usize)> = Vec::new();
        for row in (0..lines.len()).filter(|&i| counts[i] > 0) {
            let mut start = row.saturating_sub(options.context_lines);
            let end = (row + options.context_lines).min(last_row);
            if let Some(last) = windows.last_mut() {
                if start <= last.1 + 1 {
                    let merged_end = last.1.max(end);
                    if tokenizer.count(&lines[last.0..=merged_end].join("\n")) <= max {
                        last.1 = merged_end;
                        continue;
                    }
                    // Keep windows disjoint.
                    start = last.1 + 1;
                    if start > end {
                        continue;
                    }
                }
            }
            windows.push((start, end));
        }

        let language = Language::from_path(rel).name();
        windows
            .into_iter()
            .flat_map(|(start, end)| fit_lines(tokenizer, &lines, start, end, max))
            .filter_map(|piece| {
                let count: usize = counts[piece.start..=piece.end].iter().sum();
                if count == 0 {
                    return None;
                }
                let unit = CodeUnit {
                    id: CodeUnit::make_id(&self.repository, rel, piece.start + 1, piece.end + 1, piece.part),
                    repository: self.repository.clone(),
                    file_path: rel.to_string(),
                    start_line: piece.start + 1,
                    end_line: piece.end + 1,
                    kind: UnitKind::Snippet,
                    language: language.to_string(),
                    token_count: tokenizer.count(&piece.text),
                    hash: content_hash(&piece.text),
                    symbols: symbols::declared_symbols(&piece.text),
                    references: Vec::new(),
                    relevance: 0.0,
                    dependencies: Vec::new(),
                    text: piece.text,
                };
                Some((unit, count))
            })
            .collect()
    }
}

struct PathFilter {
    include: Option<GlobSet>,
    exclude: GlobSet,
    extensions: Vec<String>,
}

impl PathFilter {
    fn new(options: &SearchOptions) -> Result<Self> {
        let include = if options.include.is_empty() {
            None
        } else {
            Some(build_globset(&options.include)?)
        };
        let mut excludes = vec!["**/.git/**".to_string(), ".git/**".to_string()];
        excludes.extend(options.exclude.iter().cloned());
        Ok(Self {
            include,
            exclude: build_globset(&excludes)?,
            extensions: options
                .extensions
                .iter()
                .map(|e| e.trim_start_matches('.').to_lowercase())
                .collect(),
        })
    }

    fn excludes(&self, rel: &str) -> bool {
        self.exclude.is_match(rel) || self.exclude.is_match(format!("{rel}/"))
    }

    fn accepts_file(&self, rel: &str) -> bool {
        if self.excludes(rel) {
            return false;
        }
        if let Some(include) = &self.include {
            if !include.is_match(rel) {
                return false;
            }
        }
        if !self.extensions.is_empty() {
            let ext = Path::new(rel)
                .extension()
                .and_then(|e| e.to_str())
                .map(str::to_lowercase)
                .unwrap_or_default();
            return self.extensions.contains(&ext);
        }
        true
    }
}

/// Read a file as text. `Ok(None)` means "skip silently" (binary).
fn read_text(path: &Path, options: &SearchOptions) -> Result<Option<String>> {
    let meta = std::fs::metadata(path)?;
    if meta.len() > options.max_file_bytes {
        bail!("file exceeds {} bytes", options.max_file_bytes);
    }
    let bytes = std::fs::read(path)?;
    let sniff = &bytes[..bytes.len().min(BINARY_SNIFF_BYTES)];
    if !options.include_binary && sniff.contains(&0) {
        return Ok(None);
    }
    Ok(Some(String::from_utf8_lossy(&bytes).into_owned()))
}

fn dir_has_children(path: &Path) -> bool {
    std::fs::read_dir(path)
        .map(|mut d| d.next().is_some())
        .unwrap_or(false)
}

fn relative(root: &Path, path: &Path) -> String {
    path.strip_prefix(root)
        .unwrap_or(path)
        .to_string_lossy()
        .replace('\\', "/")
}

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern)?);
    }
    Ok(builder.build()?)
}
