//! Language-agnostic symbol extraction.
//!
//! The chunker records which symbols each unit declares and which it
//! references; the dependency linker joins the two to infer cross-file edges.
//! Extraction is regex-based so it works for any language, including the
//! ones chunked by line windows.

use regex::Regex;
use std::collections::BTreeSet;
use std::sync::LazyLock;

static DECLARATION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"\b(?:fn|struct|enum|trait|type|union|mod|class|interface|def|func|function|const|static|impl)\s+(?:mut\s+)?([A-Za-z_][A-Za-z0-9_]*)",
    )
    .expect("valid declaration regex")
});

static LOCAL_BINDING: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b(?:let|var)\s+(?:mut\s+)?([A-Za-z_][A-Za-z0-9_]*)")
        .expect("valid local binding regex")
});

static IMPORT_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*(?:pub\s+)?(?:use|import|from|using|#include|require|extern\s+crate)\b")
        .expect("valid import regex")
});

static IDENTIFIER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"[A-Za-z_][A-Za-z0-9_]*").expect("valid identifier regex")
});

const KEYWORDS: &[&str] = &[
    "abstract", "and", "as", "async", "await", "break", "case", "catch", "class", "const",
    "continue", "crate", "def", "default", "defer", "del", "do", "elif", "else", "enum",
    "export", "extends", "extern", "false", "final", "finally", "fn", "for", "from", "func",
    "function", "go", "if", "impl", "implements", "import", "in", "interface", "is", "lambda",
    "let", "loop", "match", "mod", "move", "mut", "new", "nil", "none", "not", "null", "or",
    "package", "pass", "private", "protected", "pub", "public", "raise", "ref", "require",
    "return", "self", "static", "struct", "super", "switch", "this", "throw", "throws", "trait",
    "true", "try", "type", "typeof", "union", "unsafe", "use", "using", "var", "void", "where",
    "while", "with", "yield", "None", "Self", "True", "False", "String", "str", "bool", "int",
    "usize", "isize", "u8", "u16", "u32", "u64", "i32", "i64", "f32", "f64", "Vec", "Option",
    "Result", "Some", "Ok", "Err",
];

/// Names declared in `text`, in first-seen order.
pub fn declared_symbols(text: &str) -> Vec<String> {
    let mut seen = BTreeSet::new();
    let mut out = Vec::new();
    for cap in DECLARATION.captures_iter(text) {
        if let Some(name) = cap.get(1) {
            let name = name.as_str();
            if !KEYWORDS.contains(&name) && seen.insert(name.to_string()) {
                out.push(name.to_string());
            }
        }
    }
    out
}

/// Identifiers referenced by `text`, excluding its own declarations and local bindings.
///
/// Import lines contribute every identifier they name; other lines
/// contribute identifiers of at least `min_len` characters.
pub fn referenced_symbols(text: &str, min_len: usize) -> Vec<String> {
    let mut declared: BTreeSet<String> = declared_symbols(text).into_iter().collect();
    for cap in LOCAL_BINDING.captures_iter(text) {
        if let Some(name) = cap.get(1) {
            declared.insert(name.as_str().to_string());
        }
    }
    let mut refs = BTreeSet::new();
    for line in text.lines() {
        let is_import = IMPORT_LINE.is_match(line);
        for m in IDENTIFIER.find_iter(line) {
            let ident = m.as_str();
            if KEYWORDS.contains(&ident) || declared.contains(ident) {
                continue;
            }
            if is_import || ident.len() >= min_len {
                refs.insert(ident.to_string());
            }
        }
    }
    refs.into_iter().collect()
}

pub fn is_import_line(line: &str) -> bool {
    IMPORT_LINE.is_match(line)
}
