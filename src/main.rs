//! # Review Harness CLI (`rvw`)
//!
//! Runs the review core against a local checkout: chunking, indexing,
//! routed and direct search, and full review runs from a diff file.
//!
//! ## Usage
//!
//! ```bash
//! rvw --config ./config/rvw.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `rvw chunk <file>` | Show the units a file is chunked into |
//! | `rvw index` | Chunk, link, and embed a repository |
//! | `rvw search "<query>"` | Retrieve through the query router |
//! | `rvw grep "<pattern>"` | Direct search only |
//! | `rvw files "<glob>"` | Find files by name |
//! | `rvw tree [dir]` | Depth-bounded directory listing |
//! | `rvw review --diff <file>` | Review a diff; optionally post comments |
//! | `rvw stats "<query>"` | Router statistics after repeated queries |
//! | `rvw completions <shell>` | Shell completion script |

use clap::{CommandFactory, Parser, Subcommand, ValueEnum};
use clap_complete::{generate, Shell};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use review_harness::commands::{self, ReviewArgs};
use review_harness::config::{self, QueryStrategy};

/// Review Harness CLI: context retrieval and review orchestration.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/rvw.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "rvw",
    about = "Review Harness: context retrieval and review orchestration for AI code review",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/rvw.toml")]
    config: PathBuf,

    /// Debug-level logging (overridden by RUST_LOG).
    #[arg(long, short, global = true)]
    verbose: bool,

    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

/// Options shared by commands that operate on a repository checkout.
#[derive(clap::Args)]
struct RepoArgs {
    /// Repository working tree.
    #[arg(long, default_value = ".")]
    repo: PathBuf,

    /// Repository name used for per-repository config and cache scoping.
    /// Defaults to the working tree's directory name.
    #[arg(long)]
    name: Option<String>,
}

impl RepoArgs {
    fn repository(&self) -> String {
        commands::repository_name(&self.repo, self.name.as_deref())
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Chunk one file and print its units.
    Chunk {
        file: PathBuf,
        #[arg(long, default_value = "local")]
        name: String,
    },

    /// Chunk, link, and (if configured) embed a repository.
    Index {
        #[command(flatten)]
        repo: RepoArgs,
    },

    /// Retrieve context through the query router.
    Search {
        query: String,
        #[command(flatten)]
        repo: RepoArgs,
        /// Override `[retrieval].strategy`.
        #[arg(long, value_enum)]
        strategy: Option<StrategyArg>,
        #[arg(long)]
        limit: Option<usize>,
    },

    /// Search file contents directly (no embeddings).
    Grep {
        pattern: String,
        #[command(flatten)]
        repo: RepoArgs,
        /// Treat the pattern as a regular expression.
        #[arg(long)]
        regex: bool,
        #[arg(long, short = 'i')]
        ignore_case: bool,
        /// Lines of context around each match.
        #[arg(long, short = 'C')]
        context: Option<usize>,
        /// Restrict to these extensions (repeatable, no dot).
        #[arg(long = "ext")]
        extensions: Vec<String>,
        #[arg(long)]
        limit: Option<usize>,
    },

    /// Find files whose name or path matches a glob.
    Files {
        pattern: String,
        #[command(flatten)]
        repo: RepoArgs,
    },

    /// List the directory tree.
    Tree {
        subdir: Option<String>,
        #[command(flatten)]
        repo: RepoArgs,
        #[arg(long, default_value_t = 2)]
        depth: usize,
    },

    /// Review a unified diff against the working tree.
    Review {
        /// Unified diff of the change-set.
        #[arg(long)]
        diff: PathBuf,
        #[command(flatten)]
        repo: RepoArgs,
        /// JSON file acting as the comment host.
        #[arg(long, default_value = "./comments.json")]
        comments: PathBuf,
        /// Pull request number used as the trigger identity.
        #[arg(long, default_value_t = 1)]
        pr: u64,
        /// Reconcile comments after the run.
        #[arg(long)]
        post: bool,
    },

    /// Run a query repeatedly and print router statistics.
    Stats {
        query: String,
        #[command(flatten)]
        repo: RepoArgs,
        #[arg(long, default_value_t = 3)]
        repeat: usize,
    },

    /// Generate a shell completion script.
    Completions {
        #[arg(value_enum)]
        shell: Shell,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum StrategyArg {
    VectorOnly,
    DirectOnly,
    Hybrid,
    DirectFallback,
}

impl From<StrategyArg> for QueryStrategy {
    fn from(s: StrategyArg) -> Self {
        match s {
            StrategyArg::VectorOnly => QueryStrategy::VectorOnly,
            StrategyArg::DirectOnly => QueryStrategy::DirectOnly,
            StrategyArg::Hybrid => QueryStrategy::Hybrid,
            StrategyArg::DirectFallback => QueryStrategy::DirectFallback,
        }
    }
}

fn init_tracing(verbose: bool, json: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.log_json);

    if let Commands::Completions { shell } = cli.command {
        let mut cmd = Cli::command();
        generate(shell, &mut cmd, "rvw", &mut std::io::stdout());
        return Ok(());
    }

    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Chunk { file, name } => {
            commands::run_chunk(&cfg, &file, &name)?;
        }
        Commands::Index { repo } => {
            let cfg = cfg.effective_for(&repo.repository())?;
            commands::run_index(&cfg, &repo.repository(), &repo.repo).await?;
        }
        Commands::Search {
            query,
            repo,
            strategy,
            limit,
        } => {
            let cfg = cfg.effective_for(&repo.repository())?;
            commands::run_search(
                &cfg,
                &repo.repository(),
                &repo.repo,
                &query,
                strategy.map(Into::into),
                limit,
            )
            .await?;
        }
        Commands::Grep {
            pattern,
            repo,
            regex,
            ignore_case,
            context,
            extensions,
            limit,
        } => {
            let cfg = cfg.effective_for(&repo.repository())?;
            commands::run_grep(
                &cfg,
                &repo.repository(),
                &repo.repo,
                &pattern,
                regex,
                ignore_case,
                context,
                extensions,
                limit,
            )
            .await?;
        }
        Commands::Files { pattern, repo } => {
            let cfg = cfg.effective_for(&repo.repository())?;
            commands::run_files(&cfg, &repo.repository(), &repo.repo, &pattern)?;
        }
        Commands::Tree { subdir, repo, depth } => {
            let cfg = cfg.effective_for(&repo.repository())?;
            commands::run_tree(&cfg, &repo.repository(), &repo.repo, subdir.as_deref(), depth)?;
        }
        Commands::Review {
            diff,
            repo,
            comments,
            pr,
            post,
        } => {
            let args = ReviewArgs {
                repository: repo.repository(),
                root: repo.repo.clone(),
                diff,
                comments,
                pull_request: pr,
                post,
            };
            commands::run_review(cfg, args).await?;
        }
        Commands::Stats { query, repo, repeat } => {
            let cfg = cfg.effective_for(&repo.repository())?;
            commands::run_stats(&cfg, &repo.repository(), &repo.repo, &query, repeat).await?;
        }
        Commands::Completions { .. } => unreachable!(),
    }

    Ok(())
}
