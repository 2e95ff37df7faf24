//! Indexing pass: walk → chunk → link → embed.
//!
//! Walks a working tree with the `[chunking]` include/exclude globs, chunks
//! every text file, links the units into a [`DependencyGraph`], and brings
//! the vector index up to date:
//!
//! - units whose content hash matches the indexed one are skipped
//! - new or changed units are embedded in batches and upserted (superseding
//!   the previous vector for the same id)
//! - ids no longer produced by the walk are removed
//!
//! Embedding failures are non-fatal: the batch is counted as failed and the
//! run continues, since retrieval can still fall back to direct search.

use anyhow::{bail, Result};
use chrono::Utc;
use globset::{Glob, GlobSet, GlobSetBuilder};
use serde::Serialize;
use std::collections::HashSet;
use std::path::Path;
use walkdir::WalkDir;

use crate::chunk::Chunker;
use crate::config::ChunkingConfig;
use crate::linker::DependencyGraph;
use crate::models::{CodeUnit, UnitEmbedding};
use crate::semantic::SemanticSearch;

/// Bytes inspected for NUL when deciding whether a file is binary.
const BINARY_SNIFF_BYTES: usize = 8000;

#[derive(Debug, Clone, Default, Serialize)]
pub struct IndexReport {
    pub files_scanned: usize,
    pub files_skipped: usize,
    pub units: usize,
    pub embedded: usize,
    pub unchanged: usize,
    pub removed: usize,
    pub embed_failures: usize,
}

pub struct Indexer {
    chunker: Chunker,
    include: GlobSet,
    exclude: GlobSet,
    max_file_bytes: u64,
}

impl Indexer {
    pub fn new(chunker: Chunker, config: &ChunkingConfig, max_file_bytes: u64) -> Result<Self> {
        let mut excludes = vec!["**/.git/**".to_string()];
        excludes.extend(config.exclude_globs.iter().cloned());
        Ok(Self {
            chunker,
            include: build_globset(&config.include_globs)?,
            exclude: build_globset(&excludes)?,
            max_file_bytes,
        })
    }

    pub fn chunker(&self) -> &Chunker {
        &self.chunker
    }

    /// Chunk every eligible file under `root`.
    pub fn chunk_repository(&self, repository: &str, root: &Path, report: &mut IndexReport) -> Result<Vec<CodeUnit>> {
        if !root.is_dir() {
            bail!("Repository root does not exist: {}", root.display());
        }

        let mut units = Vec::new();
        let walker = WalkDir::new(root).sort_by_file_name().into_iter().filter_entry(|e| {
            let rel = relative(root, e.path());
            e.depth() == 0 || !(self.exclude.is_match(&rel) || self.exclude.is_match(format!("{rel}/")))
        });

        for entry in walker {
            let entry = match entry {
                Ok(e) => e,
                Err(e) => {
                    tracing::debug!(error = %e, "walk error; entry skipped");
                    report.files_skipped += 1;
                    continue;
                }
            };
            if !entry.file_type().is_file() {
                continue;
            }
            let rel = relative(root, entry.path());
            if !self.include.is_match(&rel) {
                continue;
            }

            match self.read_text(entry.path()) {
                Ok(Some(content)) => {
                    report.files_scanned += 1;
                    units.extend(self.chunker.chunk_file(repository, &rel, &content));
                }
                Ok(None) => report.files_skipped += 1,
                Err(e) => {
                    tracing::debug!(path = %rel, error = %e, "file skipped during indexing");
                    report.files_skipped += 1;
                }
            }
        }
        report.units = units.len();
        Ok(units)
    }

    /// Chunk and link a working tree.
    pub fn build_graph(&self, repository: &str, root: &Path, report: &mut IndexReport) -> Result<DependencyGraph> {
        let units = self.chunk_repository(repository, root, report)?;
        Ok(DependencyGraph::build(units))
    }

    /// Bring the vector index in line with `units`.
    pub async fn sync_embeddings(
        &self,
        repository: &str,
        units: &[CodeUnit],
        semantic: &SemanticSearch,
        batch_size: usize,
        report: &mut IndexReport,
    ) -> Result<()> {
        let index = semantic.index();
        let embedder = semantic.embedder();

        let mut pending: Vec<&CodeUnit> = Vec::new();
        for unit in units {
            if index.content_hash(repository, &unit.id).await?.as_deref() == Some(unit.hash.as_str()) {
                report.unchanged += 1;
            } else {
                pending.push(unit);
            }
        }

        for batch in pending.chunks(batch_size.max(1)) {
            let texts: Vec<String> = batch.iter().map(|u| u.text.clone()).collect();
            match embedder.embed(&texts).await {
                Ok(vectors) => {
                    for (unit, vector) in batch.iter().zip(vectors) {
                        index
                            .upsert(
                                UnitEmbedding {
                                    id: unit.id.clone(),
                                    repository: repository.to_string(),
                                    vector,
                                    indexed_at: Utc::now(),
                                    content_hash: unit.hash.clone(),
                                    model: embedder.model_name().to_string(),
                                },
                                (*unit).clone(),
                            )
                            .await?;
                        report.embedded += 1;
                    }
                }
                Err(e) => {
                    tracing::warn!(repository, units = batch.len(), error = %format!("{e:#}"), "embedding batch failed");
                    report.embed_failures += batch.len();
                }
            }
        }

        let live: HashSet<&str> = units.iter().map(|u| u.id.as_str()).collect();
        let stale: Vec<String> = index
            .ids(repository)
            .await?
            .into_iter()
            .filter(|id| !live.contains(id.as_str()))
            .collect();
        if !stale.is_empty() {
            report.removed += index.remove(repository, &stale).await?;
        }

        tracing::info!(
            repository,
            embedded = report.embedded,
            unchanged = report.unchanged,
            removed = report.removed,
            failures = report.embed_failures,
            "vector index synced"
        );
        Ok(())
    }

    /// Read a file as text. `Ok(None)` means "skip" (binary or too large).
    fn read_text(&self, path: &Path) -> Result<Option<String>> {
        let meta = std::fs::metadata(path)?;
        if meta.len() > self.max_file_bytes {
            return Ok(None);
        }
        let bytes = std::fs::read(path)?;
        if bytes[..bytes.len().min(BINARY_SNIFF_BYTES)].contains(&0) {
            return Ok(None);
        }
        Ok(Some(String::from_utf8_lossy(&bytes).into_owned()))
    }
}

fn relative(root: &Path, path: &Path) -> String {
    path.strip_prefix(root)
        .unwrap_or(path)
        .to_string_lossy()
        .replace('\\', "/")
}

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern)?);
    }
    Ok(builder.build()?)
}
