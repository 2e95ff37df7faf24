//! Comment reconciliation.
//!
//! Publishing an outcome replaces whatever the same bot posted earlier for
//! the same trigger. The match key is `(trigger identity, bot name)`, not
//! the request id, so every run of a trigger converges on exactly one
//! active annotation set.
//!
//! [`Reconciler`] holds one async lock per key across list, delete and
//! post, so overlapping reconciles of one trigger (webhook redeliveries)
//! run one after the other. It also remembers the newest outcome it
//! published per key and skips anything older.
//!
//! Steps:
//! 1. skip when the outcome is older than the last one published
//! 2. skip when the outcome is unsuccessful (old comments stay)
//! 3. delete prior comments for the key, continuing past failures
//! 4. filter and order findings by [`CommentPolicy`]
//! 5. post, counting per-item successes and failures

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::sync::Mutex;

use crate::config::CommentPolicy;
use crate::host::CommentHost;
use crate::models::{AnalysisOutcome, AnnotationTag, Finding, FormattedComment, PostingSummary, TriggerKey};

/// Completion time of the newest outcome published for one key.
type KeyState = Arc<Mutex<Option<DateTime<Utc>>>>;

/// Serializes reconciliation per `(trigger, bot)` over one comment host.
pub struct Reconciler {
    host: Arc<dyn CommentHost>,
    keys: DashMap<(TriggerKey, String), KeyState>,
}

impl Reconciler {
    pub fn new(host: Arc<dyn CommentHost>) -> Self {
        Self {
            host,
            keys: DashMap::new(),
        }
    }

    /// Replace the previous annotation set for the outcome's trigger.
    pub async fn reconcile(&self, outcome: &AnalysisOutcome, policy: &CommentPolicy) -> anyhow::Result<PostingSummary> {
        let state = self
            .keys
            .entry((outcome.trigger.clone(), policy.bot_name.clone()))
            .or_default()
            .clone();
        let mut published = state.lock().await;

        if let Some(newest) = *published {
            if outcome.completed_at < newest {
                tracing::info!(
                    request_id = %outcome.request_id,
                    trigger = %outcome.trigger,
                    completed_at = %outcome.completed_at,
                    newest = %newest,
                    "skipping stale outcome"
                );
                return Ok(PostingSummary {
                    request_id: Some(outcome.request_id),
                    skipped: Some(format!("superseded by an outcome completed at {newest}")),
                    ..PostingSummary::default()
                });
            }
        }

        let summary = replace_annotations(self.host.as_ref(), outcome, policy).await?;
        if outcome.success {
            *published = Some(outcome.completed_at);
        }
        Ok(summary)
    }
}

/// Apply the comment policy to an outcome's findings.
///
/// Returns the comments to post and how many findings were suppressed.
/// Line comments come first, grouped per file by descending severity with
/// at most `max_comments_per_file` each; the summary comment (if any) last.
pub fn format_comments(outcome: &AnalysisOutcome, policy: &CommentPolicy) -> (Vec<FormattedComment>, usize) {
    let tag = AnnotationTag {
        trigger: outcome.trigger.clone(),
        bot: policy.bot_name.clone(),
        request_id: outcome.request_id,
    };
    let mut suppressed = 0;

    let mut line_findings: Vec<&Finding> = Vec::new();
    let mut summary_findings: Vec<&Finding> = Vec::new();
    for finding in &outcome.findings {
        if finding.severity < policy.min_severity {
            suppressed += 1;
        } else if finding.is_summary() {
            summary_findings.push(finding);
        } else {
            line_findings.push(finding);
        }
    }

    let mut comments = Vec::new();

    if policy.line_comments {
        line_findings.sort_by(|a, b| {
            a.file_path
                .cmp(&b.file_path)
                .then_with(|| b.severity.cmp(&a.severity))
                .then_with(|| a.line.cmp(&b.line))
        });
        let mut per_file: HashMap<&str, usize> = HashMap::new();
        for finding in line_findings {
            let path = finding.file_path.as_deref().unwrap_or_default();
            let count = per_file.entry(path).or_default();
            if *count >= policy.max_comments_per_file {
                suppressed += 1;
                continue;
            }
            *count += 1;
            comments.push(FormattedComment {
                body: render_body(finding, policy),
                file_path: finding.file_path.clone(),
                line: finding.line,
                severity: Some(finding.severity),
                category: Some(finding.category.clone()),
                tag: tag.clone(),
            });
        }
    } else {
        suppressed += line_findings.len();
    }

    let summary_text = summary_body(outcome, &summary_findings);
    if policy.summary_comment {
        if let Some(text) = summary_text {
            comments.push(FormattedComment {
                body: with_prefix(&policy.prefix, &text),
                file_path: None,
                line: None,
                severity: summary_findings.iter().map(|f| f.severity).max(),
                category: Some("summary".to_string()),
                tag,
            });
        }
    } else {
        suppressed += summary_findings.len();
    }

    (comments, suppressed)
}

fn render_body(finding: &Finding, policy: &CommentPolicy) -> String {
    let mut body = format!("**[{}] {}**: {}", finding.severity, finding.category, finding.message);
    if policy.include_confidence {
        if let Some(c) = finding.confidence {
            body.push_str(&format!("\n\n_Confidence: {:.0}%_", c * 100.0));
        }
    }
    with_prefix(&policy.prefix, &body)
}

fn summary_body(outcome: &AnalysisOutcome, summary_findings: &[&Finding]) -> Option<String> {
    let mut parts: Vec<String> = summary_findings.iter().map(|f| f.message.clone()).collect();
    if parts.is_empty() {
        if let Some(s) = &outcome.summary {
            parts.push(s.clone());
        }
    }
    if parts.is_empty() {
        None
    } else {
        Some(parts.join("\n\n"))
    }
}

fn with_prefix(prefix: &str, body: &str) -> String {
    if prefix.is_empty() {
        body.to_string()
    } else {
        format!("{prefix} {body}")
    }
}

/// List, delete and post for one outcome. Callers hold the key's lock.
async fn replace_annotations(
    host: &dyn CommentHost,
    outcome: &AnalysisOutcome,
    policy: &CommentPolicy,
) -> anyhow::Result<PostingSummary> {
    let mut summary = PostingSummary {
        request_id: Some(outcome.request_id),
        ..PostingSummary::default()
    };

    if !outcome.success {
        let reason = outcome
            .error
            .clone()
            .unwrap_or_else(|| "analysis was not successful".to_string());
        tracing::info!(
            request_id = %outcome.request_id,
            trigger = %outcome.trigger,
            %reason,
            "skipping comment reconciliation"
        );
        summary.skipped = Some(reason);
        return Ok(summary);
    }

    let existing = host.list_existing(&outcome.trigger, &policy.bot_name).await?;
    for id in existing {
        match host.delete(&id).await {
            Ok(()) => summary.deleted += 1,
            Err(e) => {
                summary.delete_failures += 1;
                tracing::warn!(comment_id = %id, error = %format!("{e:#}"), "failed to delete previous comment");
            }
        }
    }

    let (comments, suppressed) = format_comments(outcome, policy);
    summary.suppressed = suppressed;
    for comment in &comments {
        match host.post(comment).await {
            Ok(_) => summary.posted += 1,
            Err(e) => {
                summary.post_failures += 1;
                tracing::warn!(
                    file = comment.file_path.as_deref().unwrap_or("-"),
                    line = comment.line.unwrap_or(0),
                    error = %format!("{e:#}"),
                    "failed to post comment"
                );
            }
        }
    }

    tracing::info!(
        request_id = %outcome.request_id,
        trigger = %outcome.trigger,
        deleted = summary.deleted,
        posted = summary.posted,
        suppressed = summary.suppressed,
        failures = summary.delete_failures + summary.post_failures,
        "comments reconciled"
    );
    Ok(summary)
}
