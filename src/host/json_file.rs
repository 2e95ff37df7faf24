//! Comment host backed by a JSON file.
//!
//! Lets the CLI run review/reconcile cycles locally: the file holds the
//! array of currently published annotations and is rewritten on every
//! change.

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::path::PathBuf;
use tokio::sync::Mutex;
use uuid::Uuid;

use super::CommentHost;
use crate::models::{FormattedComment, PostedAnnotation, TriggerKey};

pub struct JsonFileCommentHost {
    path: PathBuf,
    lock: Mutex<()>,
}

impl JsonFileCommentHost {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    /// Read all annotations (empty when the file does not exist yet).
    pub async fn load(&self) -> Result<Vec<PostedAnnotation>> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(text) if text.trim().is_empty() => Ok(Vec::new()),
            Ok(text) => serde_json::from_str(&text)
                .with_context(|| format!("Failed to parse comments file: {}", self.path.display())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(e).with_context(|| format!("Failed to read comments file: {}", self.path.display())),
        }
    }

    async fn save(&self, all: &[PostedAnnotation]) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let text = serde_json::to_string_pretty(all)?;
        tokio::fs::write(&self.path, text)
            .await
            .with_context(|| format!("Failed to write comments file: {}", self.path.display()))
    }
}

#[async_trait]
impl CommentHost for JsonFileCommentHost {
    async fn list_existing(&self, trigger: &TriggerKey, bot: &str) -> Result<Vec<String>> {
        let _guard = self.lock.lock().await;
        Ok(self
            .load()
            .await?
            .into_iter()
            .filter(|p| p.comment.tag.matches(trigger, bot))
            .map(|p| p.id)
            .collect())
    }

    async fn delete(&self, id: &str) -> Result<()> {
        let _guard = self.lock.lock().await;
        let mut all = self.load().await?;
        let before = all.len();
        all.retain(|p| p.id != id);
        if all.len() == before {
            anyhow::bail!("comment {} not found", id);
        }
        self.save(&all).await
    }

    async fn post(&self, comment: &FormattedComment) -> Result<String> {
        let _guard = self.lock.lock().await;
        let mut all = self.load().await?;
        let id = Uuid::new_v4().to_string();
        all.push(PostedAnnotation {
            id: id.clone(),
            comment: comment.clone(),
        });
        self.save(&all).await?;
        Ok(id)
    }
}
