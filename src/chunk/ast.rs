//! Syntax-aware span selection using tree-sitter.
//!
//! Declarations (types, functions, methods) each become their own span.
//! Adjacent imports merge into one import span and other small top-level
//! nodes merge into block spans up to the token ceiling. A node larger than
//! the ceiling is split by recursing into its children, so the members of
//! an oversized class or impl become individual method spans. Comments
//! directly above a declaration are attached to it when they fit.
//!
//! Returns `None` (caller falls back to line windows) when:
//! - the language has no grammar
//! - parsing fails
//! - more than 30% of the syntax nodes are errors

use super::{Language, Span};
use crate::models::UnitKind;
use crate::tokenize::Tokenizer;

/// If more than this fraction of nodes are error nodes, fall back.
const ERROR_THRESHOLD: f64 = 0.30;

struct Walker<'a> {
    lines: &'a [&'a str],
    tokenizer: &'a dyn Tokenizer,
    max_tokens: usize,
    language: Language,
    spans: Vec<Span>,
}

/// Pending run of mergeable nodes.
struct Accumulator {
    start: usize,
    end: usize,
    kind: UnitKind,
    tokens: usize,
    comments_only: bool,
}

pub fn ast_spans(
    content: &str,
    lines: &[&str],
    language: Language,
    tokenizer: &dyn Tokenizer,
    max_tokens: usize,
) -> Option<Vec<Span>> {
    let ts_language = language.tree_sitter_language()?;
    let mut parser = tree_sitter::Parser::new();
    parser.set_language(&ts_language).ok()?;
    let tree = parser.parse(content, None)?;
    let root = tree.root_node();

    let (total, errors) = count_nodes(root);
    if total > 0 && (errors as f64 / total as f64) > ERROR_THRESHOLD {
        tracing::warn!(
            language = language.name(),
            error_rate = format!("{:.0}%", (errors as f64 / total as f64) * 100.0),
            "syntax error rate exceeds threshold, falling back to line windows"
        );
        return None;
    }

    let mut walker = Walker {
        lines,
        tokenizer,
        max_tokens,
        language,
        spans: Vec::new(),
    };
    walker.walk_children(root, false);

    if walker.spans.is_empty() {
        return None;
    }

    // Nodes sharing a row can produce identical spans; keep the first.
    let mut seen = std::collections::HashSet::new();
    let mut spans: Vec<Span> = walker
        .spans
        .into_iter()
        .filter(|s| seen.insert((s.start, s.end)))
        .collect();
    spans.sort_by_key(|s| (s.start, s.end));
    Some(spans)
}

impl Walker<'_> {
    fn walk_children(&mut self, node: tree_sitter::Node, in_type: bool) {
        let mut cursor = node.walk();
        let children: Vec<tree_sitter::Node> = node
            .children(&mut cursor)
            .filter(|c| c.is_named())
            .collect();

        let mut acc: Option<Accumulator> = None;

        for child in children {
            let (start, end) = node_rows(child);
            let tokens = self.tokens_in(start, end);
            let kind = classify(self.language, child, in_type);

            match kind {
                Some(kind @ (UnitKind::Type | UnitKind::Function | UnitKind::Method)) => {
                    let mut start = start;
                    if let Some(pending) = acc.take() {
                        let adjacent = pending.end + 1 >= start;
                        if pending.comments_only
                            && adjacent
                            && self.tokens_in(pending.start, end) <= self.max_tokens
                        {
                            start = pending.start;
                        } else {
                            self.flush(pending);
                        }
                    }
                    let tokens = self.tokens_in(start, end);
                    if tokens <= self.max_tokens {
                        self.spans.push(Span { start, end, kind });
                    } else if child.named_child_count() > 0 {
                        self.walk_children(child, in_type || kind == UnitKind::Type);
                    } else {
                        self.spans.push(Span { start, end, kind });
                    }
                }
                other => {
                    let kind = other.unwrap_or(UnitKind::Block);
                    let is_comment = is_comment(child.kind());

                    if tokens > self.max_tokens {
                        if let Some(pending) = acc.take() {
                            self.flush(pending);
                        }
                        if child.named_child_count() > 0 {
                            self.walk_children(child, in_type);
                        } else {
                            self.spans.push(Span { start, end, kind });
                        }
                        continue;
                    }

                    let merge = acc.as_ref().is_some_and(|pending| {
                        pending.kind == kind
                            && self.tokens_in(pending.start, end.max(pending.end)) <= self.max_tokens
                    });
                    if merge {
                        if let Some(pending) = acc.as_mut() {
                            pending.end = pending.end.max(end);
                            pending.tokens = self.tokens_in(pending.start, pending.end);
                            pending.comments_only &= is_comment;
                        }
                    } else {
                        if let Some(pending) = acc.take() {
                            self.flush(pending);
                        }
                        acc = Some(Accumulator {
                            start,
                            end,
                            kind,
                            tokens,
                            comments_only: is_comment,
                        });
                    }
                }
            }
        }

        if let Some(pending) = acc.take() {
            self.flush(pending);
        }
    }

    fn flush(&mut self, acc: Accumulator) {
        if acc.tokens == 0 {
            return;
        }
        self.spans.push(Span {
            start: acc.start,
            end: acc.end,
            kind: acc.kind,
        });
    }

    fn tokens_in(&self, start: usize, end: usize) -> usize {
        let end = end.min(self.lines.len().saturating_sub(1));
        if start > end {
            return 0;
        }
        self.tokenizer.count(&self.lines[start..=end].join("\n"))
    }
}

/// 0-based inclusive rows of a node. A node ending at column 0 (trailing
/// newline included in the token) does not own that last row.
fn node_rows(node: tree_sitter::Node) -> (usize, usize) {
    let start = node.start_position().row;
    let end_pos = node.end_position();
    let end = if end_pos.column == 0 && end_pos.row > start {
        end_pos.row - 1
    } else {
        end_pos.row
    };
    (start, end.max(start))
}

fn is_comment(kind: &str) -> bool {
    matches!(kind, "comment" | "line_comment" | "block_comment")
}

/// Map a node to a unit kind; `None` means "ordinary block".
fn classify(language: Language, node: tree_sitter::Node, in_type: bool) -> Option<UnitKind> {
    let callable = if in_type {
        UnitKind::Method
    } else {
        UnitKind::Function
    };
    match language {
        Language::Rust => match node.kind() {
            "struct_item" | "enum_item" | "trait_item" | "impl_item" | "type_item"
            | "union_item" => Some(UnitKind::Type),
            "function_item" | "function_signature_item" => Some(callable),
            "use_declaration" | "extern_crate_declaration" => Some(UnitKind::Import),
            _ => None,
        },
        Language::Python => match node.kind() {
            "class_definition" => Some(UnitKind::Type),
            "function_definition" => Some(callable),
            "decorated_definition" => node
                .child_by_field_name("definition")
                .and_then(|def| classify(language, def, in_type)),
            "import_statement" | "import_from_statement" | "future_import_statement" => {
                Some(UnitKind::Import)
            }
            _ => None,
        },
        Language::JavaScript | Language::TypeScript | Language::Tsx => match node.kind() {
            "class_declaration" | "abstract_class_declaration" | "interface_declaration"
            | "type_alias_declaration" | "enum_declaration" => Some(UnitKind::Type),
            "function_declaration" | "generator_function_declaration" => Some(callable),
            "method_definition" | "method_signature" | "abstract_method_signature" => {
                Some(UnitKind::Method)
            }
            "import_statement" => Some(UnitKind::Import),
            "export_statement" => node
                .child_by_field_name("declaration")
                .and_then(|decl| classify(language, decl, in_type)),
            _ => None,
        },
        Language::Other => None,
    }
}

/// Count total nodes and error nodes in a tree.
fn count_nodes(node: tree_sitter::Node) -> (usize, usize) {
    let mut total = 1usize;
    let mut errors = usize::from(node.is_error() || node.is_missing());

    let mut cursor = node.walk();
    for child in node.children(&mut cursor) {
        let (t, e) = count_nodes(child);
        total += t;
        errors += e;
    }

    (total, errors)
}
