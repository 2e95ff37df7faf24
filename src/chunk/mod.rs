//! Code chunker: splits one file into token-bounded [`CodeUnit`]s.
//!
//! Languages with a tree-sitter grammar are split on syntactic boundaries
//! (see [`ast`]); everything else, and any file the parser cannot handle,
//! degrades to overlapping line windows (see [`window`]). Either way every
//! span then goes through a final fitting pass that guarantees
//! `token_count <= max_tokens`: spans that are too large are cut into
//! line-greedy pieces, and single lines that are still too large are cut by
//! characters into numbered parts.
//!
//! Chunking never fails; it is a pure transformation of `(path, text)`.

pub mod ast;
pub mod window;

use std::path::Path;
use std::sync::Arc;

use crate::config::ChunkingConfig;
use crate::models::{content_hash, CodeUnit, UnitKind};
use crate::symbols;
use crate::tokenize::{split_to_budget, Tokenizer};

/// Languages with tree-sitter support.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Language {
    Rust,
    Python,
    JavaScript,
    TypeScript,
    Tsx,
    Other,
}

impl Language {
    pub fn from_path(path: &str) -> Self {
        let ext = Path::new(path)
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("")
            .to_lowercase();
        match ext.as_str() {
            "rs" => Language::Rust,
            "py" | "pyi" => Language::Python,
            "js" | "jsx" | "mjs" | "cjs" => Language::JavaScript,
            "ts" | "mts" | "cts" => Language::TypeScript,
            "tsx" => Language::Tsx,
            _ => Language::Other,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Language::Rust => "rust",
            Language::Python => "python",
            Language::JavaScript => "javascript",
            Language::TypeScript => "typescript",
            Language::Tsx => "tsx",
            Language::Other => "text",
        }
    }

    /// Return the tree-sitter grammar for this language, if any.
    pub fn tree_sitter_language(&self) -> Option<tree_sitter::Language> {
        match self {
            Language::Rust => Some(tree_sitter_rust::LANGUAGE.into()),
            Language::Python => Some(tree_sitter_python::LANGUAGE.into()),
            Language::JavaScript => Some(tree_sitter_javascript::LANGUAGE.into()),
            Language::TypeScript => Some(tree_sitter_typescript::LANGUAGE_TYPESCRIPT.into()),
            Language::Tsx => Some(tree_sitter_typescript::LANGUAGE_TSX.into()),
            Language::Other => None,
        }
    }
}

/// A 0-based inclusive row range with its syntactic kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Span {
    pub start: usize,
    pub end: usize,
    pub kind: UnitKind,
}

pub struct Chunker {
    tokenizer: Arc<dyn Tokenizer>,
    config: ChunkingConfig,
    min_symbol_len: usize,
}

impl Chunker {
    pub fn new(tokenizer: Arc<dyn Tokenizer>, config: ChunkingConfig, min_symbol_len: usize) -> Self {
        Self {
            tokenizer,
            config,
            min_symbol_len,
        }
    }

    pub fn tokenizer(&self) -> &Arc<dyn Tokenizer> {
        &self.tokenizer
    }

    pub fn max_tokens(&self) -> usize {
        self.config.max_tokens
    }

    /// Split one file into code units, each within the token ceiling.
    pub fn chunk_file(&self, repository: &str, path: &str, content: &str) -> Vec<CodeUnit> {
        if content.trim().is_empty() {
            return Vec::new();
        }

        let lines: Vec<&str> = content.lines().collect();
        let language = Language::from_path(path);
        let max_tokens = self.config.max_tokens;

        let spans = if content.len() <= self.config.ast_max_bytes {
            ast::ast_spans(content, &lines, language, self.tokenizer.as_ref(), max_tokens)
        } else {
            tracing::debug!(path, bytes = content.len(), "file too large for syntax parsing");
            None
        };
        let spans = spans.unwrap_or_else(|| {
            window::line_windows(&lines, self.config.window_lines, self.config.overlap_lines)
        });

        let mut units = Vec::new();
        for span in spans {
            for piece in self.fit(&lines, span) {
                units.push(self.make_unit(repository, path, language, span.kind, piece));
            }
        }
        units
    }

    fn fit(&self, lines: &[&str], span: Span) -> Vec<Piece> {
        fit_lines(self.tokenizer.as_ref(), lines, span.start, span.end, self.config.max_tokens)
    }

    fn make_unit(
        &self,
        repository: &str,
        path: &str,
        language: Language,
        kind: UnitKind,
        piece: Piece,
    ) -> CodeUnit {
        let start_line = piece.start + 1;
        let end_line = piece.end + 1;
        CodeUnit {
            id: CodeUnit::make_id(repository, path, start_line, end_line, piece.part),
            repository: repository.to_string(),
            file_path: path.to_string(),
            start_line,
            end_line,
            kind,
            language: language.name().to_string(),
            token_count: self.tokenizer.count(&piece.text),
            hash: content_hash(&piece.text),
            symbols: symbols::declared_symbols(&piece.text),
            references: symbols::referenced_symbols(&piece.text, self.min_symbol_len),
            relevance: 0.0,
            dependencies: Vec::new(),
            text: piece.text,
        }
    }
}

pub(crate) struct Piece {
    pub(crate) start: usize,
    pub(crate) end: usize,
    pub(crate) part: usize,
    pub(crate) text: String,
}

/// Cut `lines[start..=end]` into pieces of at most `max` tokens.
///
/// Lines are packed greedily; a single line over the ceiling is cut by
/// characters into numbered parts.
pub(crate) fn fit_lines(
    tokenizer: &dyn Tokenizer,
    lines: &[&str],
    start: usize,
    end: usize,
    max: usize,
) -> Vec<Piece> {
    let end = end.min(lines.len().saturating_sub(1));
    if lines.is_empty() || start > end {
        return Vec::new();
    }
    let text = lines[start..=end].join("\n");
    if tokenizer.count(&text) <= max {
        if text.trim().is_empty() {
            return Vec::new();
        }
        return vec![Piece {
            start,
            end,
            part: 0,
            text,
        }];
    }

    let mut pieces = Vec::new();
    let mut current: Option<Piece> = None;
    for (row, line) in lines.iter().enumerate().take(end + 1).skip(start) {
        if tokenizer.count(line) > max {
            if let Some(done) = current.take() {
                pieces.push(done);
            }
            for (part, segment) in split_to_budget(tokenizer, line, max).into_iter().enumerate() {
                pieces.push(Piece {
                    start: row,
                    end: row,
                    part,
                    text: segment,
                });
            }
            continue;
        }

        let candidate = current
            .as_ref()
            .map(|piece| format!("{}\n{}", piece.text, line));
        match candidate {
            Some(joined) if tokenizer.count(&joined) <= max => {
                if let Some(piece) = current.as_mut() {
                    piece.text = joined;
                    piece.end = row;
                }
            }
            _ => {
                let next = Piece {
                    start: row,
                    end: row,
                    part: 0,
                    text: line.to_string(),
                };
                if let Some(done) = current.replace(next) {
                    pieces.push(done);
                }
            }
        }
    }
    if let Some(done) = current.take() {
        pieces.push(done);
    }
    pieces.retain(|p| !p.text.trim().is_empty());
    pieces
}
