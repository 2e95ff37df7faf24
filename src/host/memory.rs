//! In-memory comment host.

use anyhow::{bail, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashSet};

use super::CommentHost;
use crate::models::{FormattedComment, PostedAnnotation, TriggerKey};

#[derive(Default)]
struct State {
    next_id: u64,
    comments: BTreeMap<String, PostedAnnotation>,
    fail_deletes: HashSet<String>,
    fail_posts_containing: Option<String>,
    posts: usize,
    deletes: usize,
}

/// Comment host that keeps annotations in a map.
///
/// Failures can be injected per id (deletes) or by body substring (posts).
#[derive(Default)]
pub struct InMemoryCommentHost {
    state: Mutex<State>,
}

impl InMemoryCommentHost {
    pub fn new() -> Self {
        Self::default()
    }

    /// Currently published annotations, in id order.
    pub fn active(&self) -> Vec<PostedAnnotation> {
        self.state.lock().comments.values().cloned().collect()
    }

    /// Total successful posts since creation.
    pub fn post_count(&self) -> usize {
        self.state.lock().posts
    }

    pub fn delete_count(&self) -> usize {
        self.state.lock().deletes
    }

    /// Make every delete of `id` fail.
    pub fn fail_delete_of(&self, id: &str) {
        self.state.lock().fail_deletes.insert(id.to_string());
    }

    /// Make posts whose body contains `needle` fail.
    pub fn fail_posts_containing(&self, needle: &str) {
        self.state.lock().fail_posts_containing = Some(needle.to_string());
    }
}

#[async_trait]
impl CommentHost for InMemoryCommentHost {
    async fn list_existing(&self, trigger: &TriggerKey, bot: &str) -> Result<Vec<String>> {
        Ok(self
            .state
            .lock()
            .comments
            .values()
            .filter(|p| p.comment.tag.matches(trigger, bot))
            .map(|p| p.id.clone())
            .collect())
    }

    async fn delete(&self, id: &str) -> Result<()> {
        let mut state = self.state.lock();
        if state.fail_deletes.contains(id) {
            bail!("delete of comment {} rejected", id);
        }
        if state.comments.remove(id).is_none() {
            bail!("comment {} not found", id);
        }
        state.deletes += 1;
        Ok(())
    }

    async fn post(&self, comment: &FormattedComment) -> Result<String> {
        let mut state = self.state.lock();
        if let Some(needle) = &state.fail_posts_containing {
            if comment.body.contains(needle.as_str()) {
                bail!("post rejected by host");
            }
        }
        state.next_id += 1;
        let id = format!("c{:05}", state.next_id);
        state.comments.insert(
            id.clone(),
            PostedAnnotation {
                id: id.clone(),
                comment: comment.clone(),
            },
        );
        state.posts += 1;
        Ok(id)
    }
}
