//! Collaborator traits for the source host and the comment host.
//!
//! The pipeline only sees these traits. Webhook transport, authentication,
//! and the host's REST API live outside the crate; adapters here cover a
//! local checkout, an in-memory host for tests, and a JSON file host for
//! the CLI.
//!
//! ```text
//! ┌──────────────┐   change_set / read_file   ┌──────────────┐
//! │ SourceHost   │ ─────────────────────────▶ │  pipeline    │
//! └──────────────┘                            │  run_review  │
//! ┌──────────────┐  list_existing/delete/post │  reconcile   │
//! │ CommentHost  │ ◀───────────────────────── │              │
//! └──────────────┘                            └──────────────┘
//! ```

pub mod json_file;
pub mod local;
pub mod memory;

use anyhow::Result;
use async_trait::async_trait;

use crate::models::{ChangeSet, FormattedComment, TriggerContext, TriggerKey};

pub use json_file::JsonFileCommentHost;
pub use local::LocalSourceHost;
pub use memory::InMemoryCommentHost;

/// Supplies the change-set and raw file content for a trigger.
#[async_trait]
pub trait SourceHost: Send + Sync {
    /// Files and hunks changed by the pull request.
    async fn change_set(&self, ctx: &TriggerContext) -> Result<ChangeSet>;

    /// Head-revision content of `path`, or `None` if it does not exist.
    async fn read_file(&self, ctx: &TriggerContext, path: &str) -> Result<Option<String>>;
}

/// Lists, deletes, and posts review comments.
#[async_trait]
pub trait CommentHost: Send + Sync {
    /// Ids of comments previously posted by `bot` for `trigger`.
    async fn list_existing(&self, trigger: &TriggerKey, bot: &str) -> Result<Vec<String>>;

    async fn delete(&self, id: &str) -> Result<()>;

    /// Publish a comment; returns the host's id for it.
    async fn post(&self, comment: &FormattedComment) -> Result<String>;
}
