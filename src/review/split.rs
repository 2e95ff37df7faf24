//! Review splitter: packs a change-set and its context into bounded requests.
//!
//! The change-set is first cut into [`DiffPiece`]s (one per file, or one per
//! hunk group when a file's diff exceeds `max_tokens_per_file`) and the
//! context bundle into [`ContextPiece`]s. [`plan_requests`] then packs the
//! pieces according to the [`SplitStrategy`]:
//!
//! | Strategy | Requests |
//! |----------|----------|
//! | `single` | One; context dropped lowest-relevance first |
//! | `per_file` | One per changed file, capped at `max_tokens_per_file` |
//! | `by_token_size` | Greedy first-fit over pieces sorted by file |
//! | `hybrid` | `single` when everything fits, else `by_token_size` |
//!
//! Every token figure is taken over the rendered prompt: a piece costs its
//! fenced block (and heading), and each request starts at the `reserved`
//! overhead from [`prompt_overhead`], which covers the section headings and the
//! client's system prompt. A request's `token_count` is therefore an upper
//! bound on what is sent.

use serde::Serialize;
use std::collections::BTreeSet;

use crate::config::{ReviewSplitPolicy, SplitStrategy};
use crate::models::{ChangeSet, ContextBundle, ContextSource, FileStatus};
use crate::tokenize::{truncate_to_tokens, Tokenizer};

const CHANGES_HEADING: &str = "## Changes\n\n";
const CONTEXT_HEADING: &str = "## Related code\n\n";

/// A unit of diff text that is never split across requests.
#[derive(Debug, Clone, Serialize)]
pub struct DiffPiece {
    pub path: String,
    /// 0 for a whole-file diff; 1.. for hunk groups of a large diff.
    pub part: usize,
    pub text: String,
    /// Tokens of the rendered block, fences included.
    pub tokens: usize,
    /// Added lines covered by this piece.
    pub lines: usize,
}

/// One context entry offered to the completion API.
#[derive(Debug, Clone, Serialize)]
pub struct ContextPiece {
    /// File the context comes from.
    pub path: String,
    /// Human-readable heading, e.g. `src/a.rs:10-42 (graph hop 1)`.
    pub label: String,
    pub text: String,
    /// Tokens of the rendered block, heading and fences included.
    pub tokens: usize,
    pub relevance: f64,
}

/// Payload of one completion request.
#[derive(Debug, Clone, Serialize)]
pub struct PromptPayload {
    pub index: usize,
    pub diff: Vec<DiffPiece>,
    pub context: Vec<ContextPiece>,
    /// Reserved overhead plus every rendered piece.
    pub token_count: usize,
    /// Context pieces that did not fit this request.
    pub dropped_context: usize,
}

impl PromptPayload {
    fn new(index: usize, reserved: usize) -> Self {
        Self {
            index,
            diff: Vec::new(),
            context: Vec::new(),
            token_count: reserved,
            dropped_context: 0,
        }
    }

    /// Distinct changed files in this request, sorted.
    pub fn files(&self) -> Vec<String> {
        self.diff
            .iter()
            .map(|d| d.path.clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    pub fn lines(&self) -> usize {
        self.diff.iter().map(|d| d.lines).sum()
    }

    fn push_diff(&mut self, piece: DiffPiece) {
        self.token_count += piece.tokens;
        self.diff.push(piece);
    }

    /// Markdown rendering sent as the user message.
    pub fn render(&self) -> String {
        let mut out = String::from(CHANGES_HEADING);
        for piece in &self.diff {
            out.push_str(&diff_block(&piece.text));
        }
        if !self.context.is_empty() {
            out.push_str(CONTEXT_HEADING);
            for piece in &self.context {
                out.push_str(&context_block(&piece.label, &piece.text));
            }
        }
        out
    }
}

fn diff_block(text: &str) -> String {
    let newline = if text.ends_with('\n') { "" } else { "\n" };
    format!("```diff\n{text}{newline}```\n\n")
}

fn context_block(label: &str, text: &str) -> String {
    let newline = if text.ends_with('\n') { "" } else { "\n" };
    format!("### {label}\n```\n{text}{newline}```\n\n")
}

/// Tokens every request spends outside its pieces: both section headings
/// plus the system prompt sent alongside.
pub fn prompt_overhead(tokenizer: &dyn Tokenizer, system_prompt: &str) -> usize {
    tokenizer.count(CHANGES_HEADING) + tokenizer.count(CONTEXT_HEADING) + tokenizer.count(system_prompt)
}

/// Requests produced for one review plus the strategy that produced them.
#[derive(Debug, Clone, Serialize)]
pub struct ReviewPlan {
    pub strategy: SplitStrategy,
    pub requests: Vec<PromptPayload>,
}

impl ReviewPlan {
    pub fn total_tokens(&self) -> usize {
        self.requests.iter().map(|r| r.token_count).sum()
    }
}

/// Cut every changed file's diff into pieces whose rendered block is at
/// most `max_tokens_per_file`.
///
/// Deleted files and files without hunks produce nothing. A single hunk
/// that alone exceeds the cap is truncated line-aligned.
pub fn diff_pieces(changes: &ChangeSet, tokenizer: &dyn Tokenizer, max_tokens_per_file: usize) -> Vec<DiffPiece> {
    // Fences plus a possible closing newline.
    let fence = tokenizer.count(&diff_block("")) + 1;
    let max_text = max_tokens_per_file.saturating_sub(fence);
    let rendered = |text: &str| tokenizer.count(&diff_block(text));

    let mut pieces = Vec::new();
    for file in &changes.files {
        if file.status == FileStatus::Deleted || file.hunks.is_empty() {
            continue;
        }
        let whole = file.diff_text();
        if tokenizer.count(&whole) <= max_text {
            pieces.push(DiffPiece {
                path: file.path.clone(),
                part: 0,
                tokens: rendered(&whole),
                text: whole,
                lines: file.added_line_count(),
            });
            continue;
        }

        let header = format!("--- a/{}\n+++ b/{}\n", file.path, file.path);
        let mut text = header.clone();
        let mut lines = 0;
        let mut part = 1;
        for hunk in &file.hunks {
            let hunk_text = hunk.text();
            let candidate = format!("{text}{hunk_text}");
            if tokenizer.count(&candidate) <= max_text {
                text = candidate;
                lines += hunk.added_lines().len();
                continue;
            }
            if text != header {
                pieces.push(DiffPiece {
                    path: file.path.clone(),
                    part,
                    tokens: rendered(&text),
                    text: std::mem::replace(&mut text, header.clone()),
                    lines,
                });
                part += 1;
                lines = 0;
            }
            let candidate = format!("{header}{hunk_text}");
            if tokenizer.count(&candidate) <= max_text {
                text = candidate;
                lines = hunk.added_lines().len();
            } else {
                let cut = truncate_to_tokens(tokenizer, &candidate, max_text);
                tracing::debug!(path = %file.path, part, "hunk truncated to the per-file token cap");
                pieces.push(DiffPiece {
                    path: file.path.clone(),
                    part,
                    tokens: rendered(&cut),
                    text: cut,
                    lines: hunk.added_lines().len(),
                });
                part += 1;
            }
        }
        if text != header {
            pieces.push(DiffPiece {
                path: file.path.clone(),
                part,
                tokens: rendered(&text),
                text,
                lines,
            });
        }
    }
    pieces
}

/// Turn bundled units and whole files into context pieces.
pub fn context_pieces(bundle: &ContextBundle, tokenizer: &dyn Tokenizer) -> Vec<ContextPiece> {
    let piece = |path: &str, label: String, text: &str, relevance: f64| ContextPiece {
        path: path.to_string(),
        tokens: tokenizer.count(&context_block(&label, text)),
        label,
        text: text.to_string(),
        relevance,
    };

    let mut pieces: Vec<ContextPiece> = bundle
        .files
        .iter()
        .map(|f| piece(&f.path, format!("{} (whole file)", f.path), &f.content, 1.0))
        .collect();

    for b in &bundle.units {
        let origin = match b.source {
            ContextSource::Diff => "changed".to_string(),
            ContextSource::Graph { hop } => format!("graph hop {hop}"),
            ContextSource::Retrieved { method } => format!("{method} search"),
        };
        let label = format!("{}:{}-{} ({})", b.unit.file_path, b.unit.start_line, b.unit.end_line, origin);
        pieces.push(piece(&b.unit.file_path, label, &b.unit.text, b.unit.relevance));
    }
    pieces
}

/// Pack diff and context pieces into requests.
///
/// `reserved` is charged to every request before any piece (see
/// [`prompt_overhead`]); pass 0 when the pieces' costs already cover it.
pub fn plan_requests(
    diff: Vec<DiffPiece>,
    context: Vec<ContextPiece>,
    policy: &ReviewSplitPolicy,
    reserved: usize,
) -> ReviewPlan {
    let mut diff = diff;
    diff.sort_by(|a, b| a.path.cmp(&b.path).then(a.part.cmp(&b.part)));
    let mut context = context;
    context.sort_by(|a, b| {
        b.relevance
            .partial_cmp(&a.relevance)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.label.cmp(&b.label))
    });

    let strategy = match policy.strategy {
        SplitStrategy::Hybrid => {
            let total: usize = reserved
                + diff.iter().map(|d| d.tokens).sum::<usize>()
                + context.iter().map(|c| c.tokens).sum::<usize>();
            if total <= policy.max_tokens_per_request {
                SplitStrategy::Single
            } else {
                SplitStrategy::ByTokenSize
            }
        }
        other => other,
    };

    let diff_tokens: usize = diff.iter().map(|d| d.tokens).sum();
    let requests = match strategy {
        SplitStrategy::Single if reserved + diff_tokens <= policy.max_tokens_per_request => {
            let mut request = PromptPayload::new(0, reserved);
            for piece in diff {
                request.push_diff(piece);
            }
            fill_context(&mut request, &context, policy.max_tokens_per_request);
            vec![request]
        }
        SplitStrategy::Single => {
            tracing::warn!(
                diff_tokens,
                cap = policy.max_tokens_per_request,
                "diff does not fit one request; packing by token size"
            );
            pack_by_tokens(diff, &context, policy, reserved)
        }
        SplitStrategy::PerFile => per_file(diff, &context, policy, reserved),
        SplitStrategy::ByTokenSize | SplitStrategy::Hybrid => pack_by_tokens(diff, &context, policy, reserved),
    };

    let strategy = match (policy.strategy, strategy) {
        (SplitStrategy::Single, _) if requests.len() > 1 => SplitStrategy::ByTokenSize,
        (_, s) => s,
    };
    ReviewPlan { strategy, requests }
}

/// Greedy first-fit: a new request starts when the next piece would push
/// the current one past `max_tokens_per_request` or past
/// `max_files_per_request` distinct files.
fn pack_by_tokens(
    diff: Vec<DiffPiece>,
    context: &[ContextPiece],
    policy: &ReviewSplitPolicy,
    reserved: usize,
) -> Vec<PromptPayload> {
    let mut requests: Vec<PromptPayload> = Vec::new();
    let mut current = PromptPayload::new(0, reserved);
    let mut files: BTreeSet<String> = BTreeSet::new();

    for piece in diff {
        let new_file = !files.contains(&piece.path);
        let over_tokens = current.token_count + piece.tokens > policy.max_tokens_per_request;
        let over_files = new_file && files.len() >= policy.max_files_per_request;
        if !current.diff.is_empty() && (over_tokens || over_files) {
            let next = PromptPayload::new(requests.len() + 1, reserved);
            requests.push(std::mem::replace(&mut current, next));
            files.clear();
        }
        files.insert(piece.path.clone());
        current.push_diff(piece);
    }
    if !current.diff.is_empty() {
        requests.push(current);
    }

    for request in &mut requests {
        fill_context(request, context, policy.max_tokens_per_request);
    }
    requests
}

fn per_file(
    diff: Vec<DiffPiece>,
    context: &[ContextPiece],
    policy: &ReviewSplitPolicy,
    reserved: usize,
) -> Vec<PromptPayload> {
    let mut requests: Vec<PromptPayload> = Vec::new();
    for piece in diff {
        let mut request = PromptPayload::new(requests.len(), reserved);
        request.push_diff(piece);
        fill_context(&mut request, context, policy.max_tokens_per_file);
        requests.push(request);
    }
    requests
}

/// Add context to `request` until `cap`: pieces from the request's own
/// files first, then everything else, each group by descending relevance.
/// Pieces that do not fit are skipped and counted.
fn fill_context(request: &mut PromptPayload, context: &[ContextPiece], cap: usize) {
    let files = request.files();
    let (own, other): (Vec<&ContextPiece>, Vec<&ContextPiece>) =
        context.iter().partition(|c| files.binary_search(&c.path).is_ok());
    for piece in own.into_iter().chain(other) {
        if request.token_count + piece.tokens > cap {
            request.dropped_context += 1;
            continue;
        }
        request.token_count += piece.tokens;
        request.context.push(piece.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{content_hash, ChangedFile, CodeUnit, DiffHunk, FileContext, UnitKind};
    use crate::tokenize::ApproxTokenizer;

    fn piece(path: &str, tokens: usize) -> DiffPiece {
        DiffPiece {
            path: path.into(),
            part: 0,
            text: format!("diff of {path}"),
            tokens,
            lines: 3,
        }
    }

    fn ctx(path: &str, tokens: usize, relevance: f64) -> ContextPiece {
        ContextPiece {
            path: path.into(),
            label: format!("{path}:1-2"),
            text: "ctx".into(),
            tokens,
            relevance,
        }
    }

    fn policy(strategy: SplitStrategy, max_request: usize) -> ReviewSplitPolicy {
        ReviewSplitPolicy {
            strategy,
            max_tokens_per_request: max_request,
            max_tokens_per_file: max_request,
            ..ReviewSplitPolicy::default()
        }
    }

    fn five_files() -> Vec<DiffPiece> {
        ["e.rs", "a.rs", "c.rs", "b.rs", "d.rs"]
            .iter()
            .map(|p| piece(p, 300))
            .collect()
    }

    #[test]
    fn test_by_token_size_five_files_into_two_requests() {
        let plan = plan_requests(five_files(), vec![], &policy(SplitStrategy::ByTokenSize, 1000), 0);
        assert_eq!(plan.requests.len(), 2);
        assert_eq!(plan.requests[0].files(), vec!["a.rs", "b.rs", "c.rs"]);
        assert_eq!(plan.requests[1].files(), vec!["d.rs", "e.rs"]);
        assert!(plan.requests.iter().all(|r| r.token_count <= 1000));
    }

    #[test]
    fn test_max_files_per_request_starts_new_request() {
        let mut p = policy(SplitStrategy::ByTokenSize, 10_000);
        p.max_files_per_request = 2;
        let plan = plan_requests(five_files(), vec![], &p, 0);
        assert_eq!(plan.requests.len(), 3);
    }

    #[test]
    fn test_hybrid_picks_single_when_everything_fits() {
        let plan = plan_requests(
            vec![piece("a.rs", 100), piece("b.rs", 100)],
            vec![ctx("z.rs", 50, 0.5)],
            &policy(SplitStrategy::Hybrid, 1000),
            0,
        );
        assert_eq!(plan.strategy, SplitStrategy::Single);
        assert_eq!(plan.requests.len(), 1);
        assert_eq!(plan.requests[0].context.len(), 1);

        let plan = plan_requests(five_files(), vec![], &policy(SplitStrategy::Hybrid, 1000), 0);
        assert_eq!(plan.strategy, SplitStrategy::ByTokenSize);
        assert_eq!(plan.requests.len(), 2);
    }

    #[test]
    fn test_single_drops_lowest_relevance_context() {
        let plan = plan_requests(
            vec![piece("a.rs", 500)],
            vec![ctx("x.rs", 300, 0.2), ctx("y.rs", 300, 0.9), ctx("z.rs", 300, 0.5)],
            &policy(SplitStrategy::Single, 1200),
            0,
        );
        let request = &plan.requests[0];
        let kept: Vec<&str> = request.context.iter().map(|c| c.path.as_str()).collect();
        assert_eq!(kept, vec!["y.rs", "z.rs"]);
        assert_eq!(request.dropped_context, 1);
        assert_eq!(request.token_count, 1100);
    }

    #[test]
    fn test_per_file_caps_each_request() {
        let mut p = policy(SplitStrategy::PerFile, 2000);
        p.max_tokens_per_file = 400;
        let plan = plan_requests(
            vec![piece("a.rs", 300), piece("b.rs", 300)],
            vec![ctx("b.rs", 80, 0.1), ctx("q.rs", 80, 0.9)],
            &p,
            0,
        );
        assert_eq!(plan.requests.len(), 2);
        for r in &plan.requests {
            assert!(r.token_count <= 400);
        }
        // Own-file context is preferred over higher-relevance foreign context.
        assert_eq!(plan.requests[1].context[0].path, "b.rs");
    }

    #[test]
    fn test_large_file_diff_split_by_hunks() {
        let hunk = |start: usize| DiffHunk {
            old_start: start,
            old_count: 0,
            new_start: start,
            new_count: 20,
            lines: (0..20).map(|i| format!("+let value_{i} = compute({i});")).collect(),
        };
        let changes = ChangeSet {
            files: vec![ChangedFile {
                path: "big.rs".into(),
                status: FileStatus::Modified,
                hunks: vec![hunk(1), hunk(100), hunk(200)],
            }],
        };
        let t = ApproxTokenizer::default();
        let whole = t.count(&changes.files[0].diff_text());
        let cap = whole / 2;
        let pieces = diff_pieces(&changes, &t, cap);
        assert!(pieces.len() >= 2);
        assert!(pieces.iter().all(|p| p.tokens <= cap));
        assert_eq!(pieces.iter().map(|p| p.lines).sum::<usize>(), 60);
    }

    fn small_unit(i: usize) -> CodeUnit {
        let text = format!("x{i}");
        CodeUnit {
            id: CodeUnit::make_id("repo", "ctx.rs", i + 1, i + 1, 0),
            repository: "repo".into(),
            file_path: "ctx.rs".into(),
            start_line: i + 1,
            end_line: i + 1,
            kind: UnitKind::Snippet,
            language: "rust".into(),
            hash: content_hash(&text),
            token_count: 1,
            text,
            symbols: vec![],
            references: vec![],
            relevance: 0.5,
            dependencies: vec![],
        }
    }

    #[test]
    fn test_rendered_request_stays_under_cap() {
        let t = ApproxTokenizer::default();
        let changes = ChangeSet {
            files: ["a.rs", "b.rs", "c.rs"]
                .iter()
                .map(|path| ChangedFile {
                    path: path.to_string(),
                    status: FileStatus::Modified,
                    hunks: vec![DiffHunk {
                        old_start: 1,
                        old_count: 0,
                        new_start: 1,
                        new_count: 8,
                        lines: (0..8).map(|i| format!("+let v{i} = f({i});")).collect(),
                    }],
                })
                .collect(),
        };
        let mut bundle = ContextBundle::new(100_000);
        for i in 0..40 {
            bundle.try_add_unit(small_unit(i), ContextSource::Graph { hop: 1 });
        }
        let system = "You review code. Reply with JSON findings only.";
        let reserved = prompt_overhead(&t, system);

        for strategy in [SplitStrategy::Single, SplitStrategy::ByTokenSize, SplitStrategy::PerFile] {
            let p = ReviewSplitPolicy {
                strategy,
                max_tokens_per_request: 400,
                max_tokens_per_file: 200,
                ..ReviewSplitPolicy::default()
            };
            let diff = diff_pieces(&changes, &t, p.max_tokens_per_file.saturating_sub(reserved));
            let plan = plan_requests(diff, context_pieces(&bundle, &t), &p, reserved);
            let cap = match strategy {
                SplitStrategy::PerFile => p.max_tokens_per_file,
                _ => p.max_tokens_per_request,
            };
            assert!(!plan.requests.is_empty());
            for request in &plan.requests {
                let sent = t.count(system) + t.count(&request.render());
                assert!(sent <= request.token_count, "{strategy}: {sent} > {}", request.token_count);
                assert!(request.token_count <= cap, "{strategy}: {} > {cap}", request.token_count);
            }
            assert!(plan.requests.iter().any(|r| r.dropped_context > 0));
        }
    }

    #[test]
    fn test_context_pieces_labels() {
        let mut bundle = ContextBundle::new(1000);
        bundle.try_add_file(FileContext {
            path: "a.rs".into(),
            content: "fn a() {}".into(),
            token_count: 5,
        });
        let pieces = context_pieces(&bundle, &ApproxTokenizer::default());
        assert_eq!(pieces[0].label, "a.rs (whole file)");
    }
}
