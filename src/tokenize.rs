//! Deterministic model-token counting.
//!
//! Every budget in the harness (chunk ceiling, context bundle, request
//! packing) is enforced through a [`Tokenizer`]. The default `approx`
//! profile is a pure heuristic that needs no model files: identifier runs
//! cost `ceil(len / chars_per_token)`, every other non-whitespace character
//! costs one token, and every newline costs one token. The `hf` profile
//! (cargo feature `hf-tokenizer`) loads a HuggingFace `tokenizer.json`.

use anyhow::Result;
use std::sync::Arc;

use crate::config::TokenizerConfig;

/// Counts model tokens for a text span. Implementations must be pure.
pub trait Tokenizer: Send + Sync {
    fn name(&self) -> &str;

    /// Number of tokens in `text`; the empty string is 0.
    fn count(&self, text: &str) -> usize;
}

/// Heuristic tokenizer that approximates BPE-style segmentation.
#[derive(Debug, Clone)]
pub struct ApproxTokenizer {
    chars_per_token: usize,
}

impl ApproxTokenizer {
    pub fn new(chars_per_token: usize) -> Self {
        Self {
            chars_per_token: chars_per_token.max(1),
        }
    }
}

impl Default for ApproxTokenizer {
    fn default() -> Self {
        Self::new(4)
    }
}

impl Tokenizer for ApproxTokenizer {
    fn name(&self) -> &str {
        "approx"
    }

    fn count(&self, text: &str) -> usize {
        let mut tokens = 0;
        let mut run = 0usize;
        for c in text.chars() {
            if c.is_alphanumeric() || c == '_' {
                run += 1;
                continue;
            }
            if run > 0 {
                tokens += run.div_ceil(self.chars_per_token);
                run = 0;
            }
            if c == '\n' || !c.is_whitespace() {
                tokens += 1;
            }
        }
        if run > 0 {
            tokens += run.div_ceil(self.chars_per_token);
        }
        tokens
    }
}

#[cfg(feature = "hf-tokenizer")]
pub struct HfTokenizer {
    inner: tokenizers::Tokenizer,
}

#[cfg(feature = "hf-tokenizer")]
impl HfTokenizer {
    pub fn from_file(path: &std::path::Path) -> Result<Self> {
        let inner = tokenizers::Tokenizer::from_file(path)
            .map_err(|e| anyhow::anyhow!("Failed to load tokenizer {}: {}", path.display(), e))?;
        Ok(Self { inner })
    }
}

#[cfg(feature = "hf-tokenizer")]
impl Tokenizer for HfTokenizer {
    fn name(&self) -> &str {
        "hf"
    }

    fn count(&self, text: &str) -> usize {
        if text.is_empty() {
            return 0;
        }
        match self.inner.encode(text, false) {
            Ok(enc) => enc.len(),
            // Encoding only fails on pathological input; fall back to the heuristic.
            Err(_) => ApproxTokenizer::default().count(text),
        }
    }
}

/// Build the tokenizer selected by `[tokenizer] profile`.
pub fn create_tokenizer(config: &TokenizerConfig) -> Result<Arc<dyn Tokenizer>> {
    match config.profile.as_str() {
        "approx" => Ok(Arc::new(ApproxTokenizer::new(config.chars_per_token))),
        #[cfg(feature = "hf-tokenizer")]
        "hf" => {
            let path = config
                .path
                .as_deref()
                .ok_or_else(|| anyhow::anyhow!("tokenizer.path is required for profile 'hf'"))?;
            Ok(Arc::new(HfTokenizer::from_file(path)?))
        }
        #[cfg(not(feature = "hf-tokenizer"))]
        "hf" => anyhow::bail!("Tokenizer profile 'hf' requires the 'hf-tokenizer' feature"),
        other => anyhow::bail!("Unknown tokenizer profile: '{}'", other),
    }
}

/// Longest line-aligned prefix of `text` that fits `max_tokens`.
pub fn truncate_to_tokens(tokenizer: &dyn Tokenizer, text: &str, max_tokens: usize) -> String {
    if tokenizer.count(text) <= max_tokens {
        return text.to_string();
    }
    let mut out = String::new();
    for line in text.split_inclusive('\n') {
        let candidate = format!("{out}{line}");
        if tokenizer.count(&candidate) > max_tokens {
            break;
        }
        out = candidate;
    }
    out
}

/// Split a single over-long line into character pieces that each fit `max_tokens`.
///
/// Pieces are cut greedily at character boundaries; the result concatenates
/// back to `line`.
pub fn split_to_budget(tokenizer: &dyn Tokenizer, line: &str, max_tokens: usize) -> Vec<String> {
    let max_tokens = max_tokens.max(1);
    let mut pieces = Vec::new();
    let mut current = String::new();
    for c in line.chars() {
        current.push(c);
        if tokenizer.count(&current) > max_tokens {
            current.pop();
            if current.is_empty() {
                // A single char above budget cannot be split further.
                pieces.push(c.to_string());
            } else {
                pieces.push(std::mem::take(&mut current));
                current.push(c);
            }
        }
    }
    if !current.is_empty() {
        pieces.push(current);
    }
    pieces
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_is_zero() {
        assert_eq!(ApproxTokenizer::default().count(""), 0);
        assert_eq!(ApproxTokenizer::default().count("   \t "), 0);
    }

    #[test]
    fn test_approx_counts() {
        let t = ApproxTokenizer::new(4);
        // "fn"=1, "main"=1, "(" ")" "{" "}" = 4
        assert_eq!(t.count("fn main() {}"), 6);
        // 9-char identifier -> 3 tokens, plus newline
        assert_eq!(t.count("some_name\n"), 4);
    }

    #[test]
    fn test_deterministic() {
        let t = ApproxTokenizer::default();
        let text = "pub struct Foo { bar: Vec<String> }\n";
        assert_eq!(t.count(text), t.count(text));
    }

    #[test]
    fn test_truncate_keeps_whole_lines() {
        let t = ApproxTokenizer::default();
        let text = "aaaa\nbbbb\ncccc\n";
        let out = truncate_to_tokens(&t, text, 4);
        assert_eq!(out, "aaaa\nbbbb\n");
        assert!(t.count(&out) <= 4);
    }

    #[test]
    fn test_split_to_budget_rejoins() {
        let t = ApproxTokenizer::default();
        let line = "x, ".repeat(200);
        let pieces = split_to_budget(&t, &line, 10);
        assert!(pieces.len() > 1);
        assert!(pieces.iter().all(|p| t.count(p) <= 10));
        assert_eq!(pieces.concat(), line);
    }

    #[test]
    fn test_unknown_profile_rejected() {
        let cfg = TokenizerConfig {
            profile: "nope".into(),
            ..TokenizerConfig::default()
        };
        assert!(create_tokenizer(&cfg).is_err());
    }
}
