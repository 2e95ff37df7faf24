//! Review splitting, dispatch, and merging.
//!
//! ```text
//! ChangeSet + ContextBundle
//!        │ split::plan_requests
//!        ▼
//! PromptPayload × N ── dispatch::dispatch ──▶ CompletionClient (bounded, timed)
//!        │
//!        ▼ merge::merge_results
//! findings + summary + metadata
//! ```

pub mod completion;
pub mod dispatch;
pub mod merge;
pub mod split;

pub use completion::{create_completion_client, CompletionClient, CompletionResponse};
pub use dispatch::{dispatch, RequestFailure, RequestOutcome};
pub use merge::{merge_results, MergedReview};
pub use split::{
    context_pieces, diff_pieces, plan_requests, prompt_overhead, ContextPiece, DiffPiece, PromptPayload, ReviewPlan,
};
