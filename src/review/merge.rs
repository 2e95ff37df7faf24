//! Merge per-request results into one review.

use std::collections::BTreeSet;

use super::dispatch::RequestOutcome;
use crate::config::ReviewSplitPolicy;
use crate::models::{Finding, OutcomeMetadata, Severity};

/// Two findings on the same file and line whose normalized messages share
/// at least this fraction of tokens are duplicates.
const DUPLICATE_SIMILARITY: f64 = 0.8;

#[derive(Debug, Clone)]
pub struct MergedReview {
    pub success: bool,
    pub error: Option<String>,
    pub findings: Vec<Finding>,
    pub summary: Option<String>,
    pub metadata: OutcomeMetadata,
}

pub fn merge_results(outcomes: &[RequestOutcome], policy: &ReviewSplitPolicy) -> MergedReview {
    let mut metadata = OutcomeMetadata {
        requests_issued: outcomes.len(),
        ..OutcomeMetadata::default()
    };
    let mut findings: Vec<Finding> = Vec::new();
    let mut summaries: Vec<String> = Vec::new();
    let mut files: BTreeSet<String> = BTreeSet::new();
    let mut errors: Vec<String> = Vec::new();

    for outcome in outcomes {
        match &outcome.result {
            Ok(response) => {
                files.extend(outcome.payload.files());
                metadata.lines_analyzed += outcome.payload.lines();
                metadata.prompt_tokens += if response.prompt_tokens > 0 {
                    response.prompt_tokens
                } else {
                    outcome.payload.token_count
                };
                metadata.completion_tokens += response.completion_tokens;
                if let Some(s) = &response.summary {
                    summaries.push(s.clone());
                }
                for finding in &response.findings {
                    absorb(&mut findings, finding.clone());
                }
            }
            Err(failure) => {
                metadata.requests_failed += 1;
                errors.push(format!("request {}: {}", outcome.payload.index, failure));
            }
        }
    }
    metadata.files_analyzed = files.len();

    let succeeded = outcomes.len() - metadata.requests_failed;
    let success = succeeded > 0;
    let error = if success {
        None
    } else if outcomes.is_empty() {
        Some("no completion requests were issued".to_string())
    } else {
        Some(format!("all {} completion request(s) failed: {}", outcomes.len(), errors.join("; ")))
    };

    let summary = match summaries.len() {
        0 => None,
        1 => summaries.pop(),
        _ => Some(summaries.join("\n\n")),
    };

    if success && policy.include_summary_when_split && outcomes.len() > 1 {
        findings.push(overall_summary(&findings, &metadata, summary.as_deref()));
    }

    findings.sort_by(|a, b| {
        b.severity
            .cmp(&a.severity)
            .then_with(|| a.file_path.cmp(&b.file_path))
            .then_with(|| a.line.cmp(&b.line))
    });

    MergedReview {
        success,
        error,
        findings,
        summary,
        metadata,
    }
}

/// Add `finding` unless it duplicates one already kept; a duplicate with a
/// higher severity replaces the kept copy.
fn absorb(kept: &mut Vec<Finding>, finding: Finding) {
    let tokens = normalized_tokens(&finding.message);
    for existing in kept.iter_mut() {
        if existing.file_path != finding.file_path || existing.line != finding.line {
            continue;
        }
        if jaccard(&normalized_tokens(&existing.message), &tokens) >= DUPLICATE_SIMILARITY {
            if finding.severity > existing.severity {
                *existing = finding;
            }
            return;
        }
    }
    kept.push(finding);
}

fn normalized_tokens(text: &str) -> BTreeSet<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(str::to_lowercase)
        .collect()
}

fn jaccard(a: &BTreeSet<String>, b: &BTreeSet<String>) -> f64 {
    if a.is_empty() && b.is_empty() {
        return 1.0;
    }
    let inter = a.intersection(b).count() as f64;
    let union = a.union(b).count() as f64;
    inter / union
}

fn overall_summary(findings: &[Finding], metadata: &OutcomeMetadata, summary: Option<&str>) -> Finding {
    let count = |s: Severity| findings.iter().filter(|f| f.severity == s).count();
    let mut message = format!(
        "Reviewed {} file(s) in {} request(s)",
        metadata.files_analyzed, metadata.requests_issued
    );
    if metadata.requests_failed > 0 {
        message.push_str(&format!(" ({} failed)", metadata.requests_failed));
    }
    message.push_str(&format!(
        ": {} finding(s) ({} critical, {} high, {} medium, {} low, {} info).",
        findings.len(),
        count(Severity::Critical),
        count(Severity::High),
        count(Severity::Medium),
        count(Severity::Low),
        count(Severity::Info)
    ));
    if let Some(s) = summary {
        message.push_str("\n\n");
        message.push_str(s);
    }
    Finding {
        file_path: None,
        line: None,
        severity: findings.iter().map(|f| f.severity).max().unwrap_or(Severity::Info),
        category: "summary".to_string(),
        message,
        confidence: None,
    }
}
