//! Source host over a local checkout and a unified diff.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use std::path::{Component, Path, PathBuf};

use super::SourceHost;
use crate::diff::parse_unified_diff;
use crate::models::{ChangeSet, TriggerContext};

enum DiffSource {
    File(PathBuf),
    Text(String),
}

/// Reads files from `TriggerContext::repo_path` and the change-set from a
/// pre-computed diff.
pub struct LocalSourceHost {
    diff: DiffSource,
}

impl LocalSourceHost {
    pub fn from_diff_file(path: impl Into<PathBuf>) -> Self {
        Self {
            diff: DiffSource::File(path.into()),
        }
    }

    pub fn from_diff_text(text: impl Into<String>) -> Self {
        Self {
            diff: DiffSource::Text(text.into()),
        }
    }
}

#[async_trait]
impl SourceHost for LocalSourceHost {
    async fn change_set(&self, _ctx: &TriggerContext) -> Result<ChangeSet> {
        match &self.diff {
            DiffSource::Text(text) => parse_unified_diff(text),
            DiffSource::File(path) => {
                let text = tokio::fs::read_to_string(path)
                    .await
                    .with_context(|| format!("Failed to read diff: {}", path.display()))?;
                parse_unified_diff(&text).with_context(|| format!("Failed to parse diff: {}", path.display()))
            }
        }
    }

    async fn read_file(&self, ctx: &TriggerContext, path: &str) -> Result<Option<String>> {
        let full = resolve(&ctx.repo_path, path)?;
        match tokio::fs::read(&full).await {
            Ok(bytes) => Ok(Some(String::from_utf8_lossy(&bytes).into_owned())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).with_context(|| format!("Failed to read {}", full.display())),
        }
    }
}

fn resolve(root: &Path, rel: &str) -> Result<PathBuf> {
    let rel = Path::new(rel);
    if rel.is_absolute() || rel.components().any(|c| matches!(c, Component::ParentDir)) {
        bail!("Path escapes the repository: {}", rel.display());
    }
    Ok(root.join(rel))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::TriggerEvent;

    fn ctx(root: &Path) -> TriggerContext {
        TriggerContext {
            event: TriggerEvent::PullRequest {
                repository: "acme/api".into(),
                number: 1,
                action: "opened".into(),
                head_sha: "abc".into(),
            },
            repo_path: root.to_path_buf(),
        }
    }

    #[tokio::test]
    async fn test_reads_checkout_and_diff() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.rs"), "fn a() {}\n").unwrap();
        let host = LocalSourceHost::from_diff_text("--- a/a.rs\n+++ b/a.rs\n@@ -0,0 +1 @@\n+fn a() {}\n");
        let ctx = ctx(dir.path());

        let cs = host.change_set(&ctx).await.unwrap();
        assert_eq!(cs.files[0].path, "a.rs");
        assert_eq!(host.read_file(&ctx, "a.rs").await.unwrap().as_deref(), Some("fn a() {}\n"));
        assert!(host.read_file(&ctx, "missing.rs").await.unwrap().is_none());
        assert!(host.read_file(&ctx, "../etc/passwd").await.is_err());
    }
}
