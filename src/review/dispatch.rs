//! Bounded-concurrency dispatch of completion requests.

use futures::stream::{self, StreamExt};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

use super::completion::{CompletionClient, CompletionResponse};
use super::split::PromptPayload;
use crate::config::ReviewSplitPolicy;

/// Why a request produced no response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestFailure {
    Error(String),
    TimedOut(Duration),
    Cancelled,
}

impl std::fmt::Display for RequestFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RequestFailure::Error(e) => write!(f, "{e}"),
            RequestFailure::TimedOut(d) => write!(f, "timed out after {}s", d.as_secs_f64()),
            RequestFailure::Cancelled => f.write_str("cancelled"),
        }
    }
}

/// One request and what came back.
#[derive(Debug, Clone)]
pub struct RequestOutcome {
    pub payload: PromptPayload,
    pub result: Result<CompletionResponse, RequestFailure>,
    pub elapsed: Duration,
}

impl RequestOutcome {
    pub fn succeeded(&self) -> bool {
        self.result.is_ok()
    }
}

/// Run every request, at most `max_concurrent_requests` at a time.
///
/// Each request gets its own timeout and a single attempt. A failure is
/// recorded on that request only; siblings keep running. Outcomes are
/// returned in request order.
pub async fn dispatch(
    client: Arc<dyn CompletionClient>,
    requests: Vec<PromptPayload>,
    policy: &ReviewSplitPolicy,
    cancel: &CancellationToken,
) -> Vec<RequestOutcome> {
    let timeout = policy.request_timeout();
    let concurrency = policy.max_concurrent_requests.max(1);

    let mut outcomes: Vec<RequestOutcome> = stream::iter(requests)
        .map(|payload| {
            let client = client.clone();
            let cancel = cancel.clone();
            async move {
                let started = Instant::now();
                let result = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => Err(RequestFailure::Cancelled),
                    r = tokio::time::timeout(timeout, client.complete(&payload, timeout)) => match r {
                        Ok(Ok(response)) => Ok(response),
                        Ok(Err(e)) => Err(RequestFailure::Error(format!("{e:#}"))),
                        Err(_) => Err(RequestFailure::TimedOut(timeout)),
                    },
                };
                let elapsed = started.elapsed();
                match &result {
                    Ok(response) => tracing::debug!(
                        request = payload.index,
                        findings = response.findings.len(),
                        elapsed_ms = elapsed.as_millis() as u64,
                        "completion request finished"
                    ),
                    Err(failure) => tracing::warn!(
                        request = payload.index,
                        files = ?payload.files(),
                        error = %failure,
                        "completion request failed"
                    ),
                }
                RequestOutcome {
                    payload,
                    result,
                    elapsed,
                }
            }
        })
        .buffer_unordered(concurrency)
        .collect()
        .await;

    outcomes.sort_by_key(|o| o.payload.index);
    outcomes
}
