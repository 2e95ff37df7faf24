//! # Review Harness
//!
//! Context retrieval and review orchestration for AI-assisted code review.
//!
//! Given a change-set and a checked-out repository, the harness chunks the
//! code into token-bounded units, links them into a dependency graph,
//! retrieves related context through semantic and direct search under a
//! configurable routing policy, splits the diff plus context into bounded
//! completion requests, and reconciles the resulting findings into one
//! active comment set per trigger.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────┐   ┌──────────────┐   ┌──────────────┐   ┌─────────────┐
//! │ SourceHost │──▶│ Chunk + Link │──▶│ QueryRouter  │──▶│  Splitter/  │
//! │ (diff)     │   │ (+ embed)    │   │ sem/direct   │   │  Dispatcher │
//! └────────────┘   └──────────────┘   └──────────────┘   └──────┬──────┘
//!                                                               │
//!                                     ┌──────────────┐          ▼
//!                                     │ CommentHost  │◀── reconcile
//!                                     └──────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! rvw index --repo .                         # chunk, link, embed
//! rvw search "load_config" --repo .          # routed retrieval
//! rvw grep "fn main" --repo .                # direct search only
//! rvw review --diff pr.diff --repo . --post  # full run + comments.json
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`tokenize`] | Deterministic token counting |
//! | [`chunk`] | Syntax-aware chunking with line-window fallback |
//! | [`symbols`] | Declared and referenced identifiers |
//! | [`linker`] | Dependency graph and budgeted expansion |
//! | [`embedding`] | Embedding providers |
//! | [`store`] | Vector index trait and in-memory index |
//! | [`semantic`] | Embedding + index query |
//! | [`direct`] | Filesystem search, file finding, tree listing |
//! | [`router`] | Strategy routing, result cache, query statistics |
//! | [`review`] | Request splitting, dispatch, result merging |
//! | [`reconcile`] | Comment policy and idempotent posting |
//! | [`host`] | Source and comment host traits and adapters |
//! | [`diff`] | Unified-diff parsing |
//! | [`indexer`] | Walk, chunk, link, and embed a repository |
//! | [`pipeline`] | `run_review` and `reconcile` |
//! | [`config`] | TOML configuration |
//! | [`models`] | Core data types |
//! | [`error`] | Outward error type |

pub mod chunk;
pub mod commands;
pub mod config;
pub mod diff;
pub mod direct;
pub mod embedding;
pub mod error;
pub mod host;
pub mod indexer;
pub mod linker;
pub mod models;
pub mod pipeline;
pub mod reconcile;
pub mod review;
pub mod router;
pub mod semantic;
pub mod store;
pub mod symbols;
pub mod tokenize;
