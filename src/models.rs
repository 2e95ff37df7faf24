//! Core data models used throughout the review harness.
//!
//! These types represent the code units, retrieval results, context bundles,
//! change-sets, findings, and annotations that flow through the retrieval,
//! review, and reconciliation pipeline.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use uuid::Uuid;

// ═══════════════════════════════════════════════════════════════════════
// Code units
// ═══════════════════════════════════════════════════════════════════════

/// Syntactic category of a [`CodeUnit`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitKind {
    /// Type-level declaration: class, struct, enum, trait, interface, impl.
    Type,
    /// Free function.
    Function,
    /// Member function nested inside a type.
    Method,
    /// Import / use / include statements.
    Import,
    /// Any other syntactic block (statements, comments, module-level code).
    Block,
    /// Fixed-size line window produced when no syntax tree is available.
    Window,
    /// Match window produced by direct search.
    Snippet,
}

impl fmt::Display for UnitKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            UnitKind::Type => "type",
            UnitKind::Function => "function",
            UnitKind::Method => "method",
            UnitKind::Import => "import",
            UnitKind::Block => "block",
            UnitKind::Window => "window",
            UnitKind::Snippet => "snippet",
        };
        f.write_str(s)
    }
}

/// A contiguous, addressable span of one file.
///
/// Line numbers are 1-based and inclusive; `end_line >= start_line` always.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CodeUnit {
    /// Deterministic id derived from repository, path, span, and part.
    pub id: String,
    pub repository: String,
    pub file_path: String,
    pub start_line: usize,
    pub end_line: usize,
    pub kind: UnitKind,
    pub language: String,
    pub text: String,
    pub token_count: usize,
    /// SHA-256 of `text`, used for embedding staleness detection.
    pub hash: String,
    /// Symbols declared inside this unit.
    #[serde(default)]
    pub symbols: Vec<String>,
    /// Symbols imported or referenced by this unit.
    #[serde(default)]
    pub references: Vec<String>,
    /// Relevance score assigned by whichever stage selected this unit.
    #[serde(default)]
    pub relevance: f64,
    /// Ids of units this one is linked to (filled by the dependency linker).
    #[serde(default)]
    pub dependencies: Vec<String>,
}

impl CodeUnit {
    /// Build the deterministic id for a unit span.
    ///
    /// Re-chunking an unchanged span yields the same id, so a re-index
    /// supersedes the previous vector instead of adding a second one.
    pub fn make_id(
        repository: &str,
        file_path: &str,
        start_line: usize,
        end_line: usize,
        part: usize,
    ) -> String {
        let name = format!("{repository}/{file_path}#L{start_line}-L{end_line}.{part}");
        Uuid::new_v5(&Uuid::NAMESPACE_URL, name.as_bytes()).to_string()
    }

    /// Whether this unit and `other` are in the same file with overlapping lines.
    pub fn overlaps(&self, other: &CodeUnit) -> bool {
        self.file_path == other.file_path && self.overlaps_lines(other.start_line, other.end_line)
    }

    /// Whether this unit's span intersects `[start, end]`.
    pub fn overlaps_lines(&self, start: usize, end: usize) -> bool {
        self.start_line <= end && start <= self.end_line
    }

    pub fn line_count(&self) -> usize {
        self.end_line - self.start_line + 1
    }
}

/// SHA-256 hex digest of a text span.
pub fn content_hash(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Vector representation of a [`CodeUnit`], as held by the vector index.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnitEmbedding {
    pub id: String,
    pub repository: String,
    pub vector: Vec<f32>,
    pub indexed_at: DateTime<Utc>,
    pub content_hash: String,
    pub model: String,
}

// ═══════════════════════════════════════════════════════════════════════
// Retrieval
// ═══════════════════════════════════════════════════════════════════════

/// Which search method produced (or ultimately served) a result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetrievalMethod {
    Semantic,
    Direct,
    Hybrid,
}

impl fmt::Display for RetrievalMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RetrievalMethod::Semantic => "semantic",
            RetrievalMethod::Direct => "direct",
            RetrievalMethod::Hybrid => "hybrid",
        };
        f.write_str(s)
    }
}

/// A unit paired with the score a search method gave it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoredUnit {
    pub unit: CodeUnit,
    pub score: f64,
}

/// Deterministic result ordering: score desc, then file path, then start line.
pub fn rank_order(a: &ScoredUnit, b: &ScoredUnit) -> Ordering {
    b.score
        .partial_cmp(&a.score)
        .unwrap_or(Ordering::Equal)
        .then_with(|| a.unit.file_path.cmp(&b.unit.file_path))
        .then_with(|| a.unit.start_line.cmp(&b.unit.start_line))
        .then_with(|| a.unit.id.cmp(&b.unit.id))
}

/// Output of one search method (or a merge of several).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalResult {
    pub query: String,
    /// The method that actually served this result.
    pub method: RetrievalMethod,
    pub items: Vec<ScoredUnit>,
    pub min_score: f64,
    pub max_score: f64,
    /// Files skipped during a direct scan (I/O errors, size caps, binary).
    #[serde(default)]
    pub skipped_files: usize,
    #[serde(default)]
    pub truncated: bool,
    #[serde(default)]
    pub truncation_reason: Option<String>,
}

impl RetrievalResult {
    /// Build a result, sorting `items` into rank order and computing the score range.
    pub fn new(query: impl Into<String>, method: RetrievalMethod, mut items: Vec<ScoredUnit>) -> Self {
        items.sort_by(rank_order);
        let (min_score, max_score) = score_range(&items);
        Self {
            query: query.into(),
            method,
            items,
            min_score,
            max_score,
            skipped_files: 0,
            truncated: false,
            truncation_reason: None,
        }
    }

    pub fn empty(query: impl Into<String>, method: RetrievalMethod) -> Self {
        Self::new(query, method, Vec::new())
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Keep only the first `limit` items, recording why if anything was cut.
    pub fn truncate(&mut self, limit: usize) {
        if self.items.len() > limit {
            let dropped = self.items.len() - limit;
            self.items.truncate(limit);
            self.truncated = true;
            self.truncation_reason
                .get_or_insert_with(|| format!("{dropped} result(s) beyond the limit of {limit} dropped"));
            let (min, max) = score_range(&self.items);
            self.min_score = min;
            self.max_score = max;
        }
    }
}

fn score_range(items: &[ScoredUnit]) -> (f64, f64) {
    if items.is_empty() {
        return (0.0, 0.0);
    }
    let min = items.iter().map(|s| s.score).fold(f64::INFINITY, f64::min);
    let max = items.iter().map(|s| s.score).fold(f64::NEG_INFINITY, f64::max);
    (min, max)
}

// ═══════════════════════════════════════════════════════════════════════
// Context bundle
// ═══════════════════════════════════════════════════════════════════════

/// Why a unit was placed in a [`ContextBundle`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContextSource {
    /// Overlaps a changed hunk.
    Diff,
    /// Reached through the dependency graph (`hop` edges from a diff unit).
    Graph { hop: usize },
    /// Returned by the query router.
    Retrieved { method: RetrievalMethod },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BundledUnit {
    pub unit: CodeUnit,
    pub source: ContextSource,
}

/// A whole file included verbatim.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileContext {
    pub path: String,
    pub content: String,
    pub token_count: usize,
}

/// Final assembled context for one analysis.
///
/// `total_tokens <= budget` unless `truncated` is set with a reason.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextBundle {
    pub units: Vec<BundledUnit>,
    pub files: Vec<FileContext>,
    pub total_tokens: usize,
    pub budget: usize,
    pub truncated: bool,
    pub truncation_reason: Option<String>,
}

impl ContextBundle {
    pub fn new(budget: usize) -> Self {
        Self {
            units: Vec::new(),
            files: Vec::new(),
            total_tokens: 0,
            budget,
            truncated: false,
            truncation_reason: None,
        }
    }

    pub fn remaining(&self) -> usize {
        self.budget.saturating_sub(self.total_tokens)
    }

    pub fn contains_unit(&self, id: &str) -> bool {
        self.units.iter().any(|b| b.unit.id == id)
    }

    /// Whether a unit's span is already covered by a bundled unit or whole file.
    pub fn covers(&self, unit: &CodeUnit) -> bool {
        self.files.iter().any(|f| f.path == unit.file_path)
            || self.units.iter().any(|b| b.unit.overlaps(unit))
    }

    /// Add a unit if it fits the remaining budget; otherwise flag truncation.
    pub fn try_add_unit(&mut self, unit: CodeUnit, source: ContextSource) -> bool {
        if self.total_tokens + unit.token_count > self.budget {
            self.mark_truncated(format!(
                "{}:{}-{} ({} tokens) skipped: only {} of {} budget tokens remain",
                unit.file_path,
                unit.start_line,
                unit.end_line,
                unit.token_count,
                self.remaining(),
                self.budget
            ));
            return false;
        }
        self.total_tokens += unit.token_count;
        self.units.push(BundledUnit { unit, source });
        true
    }

    /// Add a whole file if it fits the remaining budget; otherwise flag truncation.
    pub fn try_add_file(&mut self, file: FileContext) -> bool {
        if self.total_tokens + file.token_count > self.budget {
            self.mark_truncated(format!(
                "file {} ({} tokens) skipped: only {} of {} budget tokens remain",
                file.path,
                file.token_count,
                self.remaining(),
                self.budget
            ));
            return false;
        }
        self.total_tokens += file.token_count;
        self.files.push(file);
        true
    }

    /// Record the first truncation reason; later ones are ignored.
    pub fn mark_truncated(&mut self, reason: String) {
        if !self.truncated {
            self.truncated = true;
            self.truncation_reason = Some(reason);
        }
    }

    pub fn within_budget(&self) -> bool {
        self.total_tokens <= self.budget
            || (self.truncated
                && self
                    .truncation_reason
                    .as_deref()
                    .is_some_and(|r| !r.is_empty()))
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Change-sets
// ═══════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileStatus {
    Added,
    Modified,
    Deleted,
    Renamed { from: String },
}

/// One `@@ -a,b +c,d @@` hunk of a unified diff.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffHunk {
    pub old_start: usize,
    pub old_count: usize,
    pub new_start: usize,
    pub new_count: usize,
    /// Body lines including their ` `, `+`, or `-` prefix.
    pub lines: Vec<String>,
}

impl DiffHunk {
    /// Render the hunk back into unified-diff text.
    pub fn text(&self) -> String {
        let mut out = format!(
            "@@ -{},{} +{},{} @@\n",
            self.old_start, self.old_count, self.new_start, self.new_count
        );
        for line in &self.lines {
            out.push_str(line);
            out.push('\n');
        }
        out
    }

    /// New-side line numbers of added lines.
    pub fn added_lines(&self) -> Vec<usize> {
        let mut line_no = self.new_start;
        let mut added = Vec::new();
        for line in &self.lines {
            if line.starts_with('+') {
                added.push(line_no);
                line_no += 1;
            } else if line.starts_with('-') {
                // removed lines don't advance the new-side counter
            } else {
                line_no += 1;
            }
        }
        added
    }

    /// New-side span touched by this hunk (at least one line).
    pub fn new_range(&self) -> (usize, usize) {
        let start = self.new_start.max(1);
        (start, start + self.new_count.saturating_sub(1))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangedFile {
    pub path: String,
    pub status: FileStatus,
    pub hunks: Vec<DiffHunk>,
}

impl ChangedFile {
    /// Unified-diff text for this file (header plus all hunks).
    pub fn diff_text(&self) -> String {
        let mut out = format!("--- a/{}\n+++ b/{}\n", self.path, self.path);
        for hunk in &self.hunks {
            out.push_str(&hunk.text());
        }
        out
    }

    pub fn added_line_count(&self) -> usize {
        self.hunks.iter().map(|h| h.added_lines().len()).sum()
    }
}

/// The set of files changed by a pull request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeSet {
    pub files: Vec<ChangedFile>,
}

impl ChangeSet {
    pub fn file(&self, path: &str) -> Option<&ChangedFile> {
        self.files.iter().find(|f| f.path == path)
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Triggers
// ═══════════════════════════════════════════════════════════════════════

/// The external event that starts a review run.
///
/// Webhook payloads are resolved into this closed union at the boundary
/// and never passed onward as untyped JSON.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TriggerEvent {
    PullRequest {
        repository: String,
        number: u64,
        action: String,
        head_sha: String,
    },
    Comment {
        repository: String,
        number: u64,
        comment_id: u64,
        author: String,
        body: String,
    },
}

impl TriggerEvent {
    pub fn repository(&self) -> &str {
        match self {
            TriggerEvent::PullRequest { repository, .. } => repository,
            TriggerEvent::Comment { repository, .. } => repository,
        }
    }

    pub fn number(&self) -> u64 {
        match self {
            TriggerEvent::PullRequest { number, .. } => *number,
            TriggerEvent::Comment { number, .. } => *number,
        }
    }

    /// Logical identity of this trigger, used as the reconciliation key.
    ///
    /// All pull-request events on the same PR share one identity; comment
    /// events share one identity per slash command, so a re-delivered or
    /// repeated `/review` replaces the previous run's annotations.
    pub fn key(&self) -> TriggerKey {
        let trigger = match self {
            TriggerEvent::PullRequest { .. } => "pull_request".to_string(),
            TriggerEvent::Comment { body, .. } => body
                .split_whitespace()
                .next()
                .filter(|w| w.starts_with('/'))
                .map(|cmd| format!("comment:{}", cmd.to_lowercase()))
                .unwrap_or_else(|| "comment".to_string()),
        };
        TriggerKey {
            repository: self.repository().to_string(),
            pull_request: self.number(),
            trigger,
        }
    }
}

/// Stable identity of a trigger: (repository, PR, trigger kind).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TriggerKey {
    pub repository: String,
    pub pull_request: u64,
    pub trigger: String,
}

impl fmt::Display for TriggerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}/{}", self.repository, self.pull_request, self.trigger)
    }
}

/// Everything the pipeline needs to start a run.
#[derive(Debug, Clone)]
pub struct TriggerContext {
    pub event: TriggerEvent,
    /// Checked-out working tree of the repository at the head revision.
    pub repo_path: PathBuf,
}

// ═══════════════════════════════════════════════════════════════════════
// Findings and outcomes
// ═══════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    /// Lenient parse used for model output; unknown labels map to `Medium`.
    pub fn parse(label: &str) -> Self {
        match label.trim().to_lowercase().as_str() {
            "critical" | "blocker" => Severity::Critical,
            "high" | "major" | "error" => Severity::High,
            "medium" | "moderate" | "warning" => Severity::Medium,
            "low" | "minor" => Severity::Low,
            "info" | "nit" | "note" | "suggestion" => Severity::Info,
            _ => Severity::Medium,
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Severity::Info => "info",
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        };
        f.write_str(s)
    }
}

/// One issue reported by the completion API.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Finding {
    #[serde(default)]
    pub file_path: Option<String>,
    #[serde(default)]
    pub line: Option<usize>,
    pub severity: Severity,
    #[serde(default)]
    pub category: String,
    pub message: String,
    #[serde(default)]
    pub confidence: Option<f32>,
}

impl Finding {
    /// Summary findings name no file. A file with no line is a file-level
    /// finding, not a summary.
    pub fn is_summary(&self) -> bool {
        self.file_path.is_none()
    }
}

/// Closed value union for metadata maps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetaValue {
    Flag(bool),
    Number(f64),
    Text(String),
    List(Vec<String>),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OutcomeMetadata {
    pub files_analyzed: usize,
    pub lines_analyzed: usize,
    pub prompt_tokens: usize,
    pub completion_tokens: usize,
    pub requests_issued: usize,
    pub requests_failed: usize,
    pub elapsed_ms: u64,
    pub retrieval_method: Option<RetrievalMethod>,
    pub fallback_used: bool,
    pub context_truncated: bool,
    #[serde(default)]
    pub extra: BTreeMap<String, MetaValue>,
}

/// Merged result of one review run.
///
/// Every run gets a fresh `request_id`; outcomes are superseded, never mutated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisOutcome {
    pub request_id: Uuid,
    pub trigger: TriggerKey,
    pub success: bool,
    pub error: Option<String>,
    pub findings: Vec<Finding>,
    pub summary: Option<String>,
    pub metadata: OutcomeMetadata,
    pub completed_at: DateTime<Utc>,
}

// ═══════════════════════════════════════════════════════════════════════
// Annotations
// ═══════════════════════════════════════════════════════════════════════

/// Ownership tag attached to every posted comment.
///
/// Reconciliation matches on `(trigger, bot)`; `request_id` only records
/// which run produced the comment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnnotationTag {
    pub trigger: TriggerKey,
    pub bot: String,
    pub request_id: Uuid,
}

impl AnnotationTag {
    pub fn matches(&self, trigger: &TriggerKey, bot: &str) -> bool {
        &self.trigger == trigger && self.bot == bot
    }
}

/// A comment ready to be posted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FormattedComment {
    pub body: String,
    pub file_path: Option<String>,
    pub line: Option<usize>,
    pub severity: Option<Severity>,
    pub category: Option<String>,
    pub tag: AnnotationTag,
}

/// A comment as published to the host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PostedAnnotation {
    pub id: String,
    pub comment: FormattedComment,
}

/// Per-item result counts of one reconciliation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PostingSummary {
    pub request_id: Option<Uuid>,
    pub deleted: usize,
    pub delete_failures: usize,
    pub posted: usize,
    pub post_failures: usize,
    pub suppressed: usize,
    /// Set when nothing was touched (e.g. the outcome was a total failure).
    pub skipped: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unit(path: &str, start: usize, end: usize) -> CodeUnit {
        CodeUnit {
            id: CodeUnit::make_id("repo", path, start, end, 0),
            repository: "repo".into(),
            file_path: path.into(),
            start_line: start,
            end_line: end,
            kind: UnitKind::Block,
            language: "rust".into(),
            text: "x".into(),
            token_count: 10,
            hash: content_hash("x"),
            symbols: vec![],
            references: vec![],
            relevance: 0.0,
            dependencies: vec![],
        }
    }

    #[test]
    fn test_unit_ids_are_deterministic() {
        let a = CodeUnit::make_id("r", "src/a.rs", 1, 10, 0);
        let b = CodeUnit::make_id("r", "src/a.rs", 1, 10, 0);
        let c = CodeUnit::make_id("r", "src/a.rs", 1, 10, 1);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_overlap_requires_same_file() {
        assert!(unit("a.rs", 1, 10).overlaps(&unit("a.rs", 10, 20)));
        assert!(!unit("a.rs", 1, 10).overlaps(&unit("a.rs", 11, 20)));
        assert!(!unit("a.rs", 1, 10).overlaps(&unit("b.rs", 1, 10)));
    }

    #[test]
    fn test_rank_order_breaks_ties_by_path_then_line() {
        let items = vec![
            ScoredUnit { unit: unit("b.rs", 1, 2), score: 0.5 },
            ScoredUnit { unit: unit("a.rs", 9, 9), score: 0.5 },
            ScoredUnit { unit: unit("a.rs", 3, 4), score: 0.5 },
            ScoredUnit { unit: unit("z.rs", 1, 1), score: 0.9 },
        ];
        let result = RetrievalResult::new("q", RetrievalMethod::Direct, items);
        let order: Vec<(&str, usize)> = result
            .items
            .iter()
            .map(|s| (s.unit.file_path.as_str(), s.unit.start_line))
            .collect();
        assert_eq!(order, vec![("z.rs", 1), ("a.rs", 3), ("a.rs", 9), ("b.rs", 1)]);
        assert!((result.max_score - 0.9).abs() < 1e-9);
        assert!((result.min_score - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_bundle_flags_first_truncation_only() {
        let mut bundle = ContextBundle::new(15);
        assert!(bundle.try_add_unit(unit("a.rs", 1, 2), ContextSource::Diff));
        assert!(!bundle.try_add_unit(unit("b.rs", 1, 2), ContextSource::Diff));
        let first = bundle.truncation_reason.clone();
        assert!(!bundle.try_add_unit(unit("c.rs", 1, 2), ContextSource::Diff));
        assert_eq!(bundle.truncation_reason, first);
        assert!(first.unwrap().contains("b.rs"));
        assert!(bundle.within_budget());
        assert_eq!(bundle.total_tokens, 10);
    }

    #[test]
    fn test_hunk_added_lines() {
        let hunk = DiffHunk {
            old_start: 10,
            old_count: 3,
            new_start: 10,
            new_count: 4,
            lines: vec![
                " ctx".into(),
                "-old".into(),
                "+new1".into(),
                "+new2".into(),
                " ctx".into(),
            ],
        };
        assert_eq!(hunk.added_lines(), vec![11, 12]);
        assert_eq!(hunk.new_range(), (10, 13));
    }

    #[test]
    fn test_trigger_identity_ignores_comment_id() {
        let first = TriggerEvent::Comment {
            repository: "acme/api".into(),
            number: 7,
            comment_id: 1,
            author: "dev".into(),
            body: "/review please".into(),
        };
        let second = TriggerEvent::Comment {
            repository: "acme/api".into(),
            number: 7,
            comment_id: 2,
            author: "other".into(),
            body: "/REVIEW".into(),
        };
        assert_eq!(first.key(), second.key());
        assert_eq!(first.key().trigger, "comment:/review");
    }

    #[test]
    fn test_severity_parse_is_lenient() {
        assert_eq!(Severity::parse("Critical"), Severity::Critical);
        assert_eq!(Severity::parse("nit"), Severity::Info);
        assert_eq!(Severity::parse("???"), Severity::Medium);
        assert!(Severity::Critical > Severity::High);
    }
}
