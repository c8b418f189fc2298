use anyhow::{bail, Context, Result};
use rayon::prelude::*;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::config::{BuildConfig, Codecs};
use crate::diff;
use crate::index::{IndexShard, Operation, PatchIndex};
use crate::patch_format::{BuildSummary, ARCHIVE_FILE, INDEX_FILE, PAYLOAD_DIR, SCRATCH_DIR};
use crate::util::{self, ScratchDir};

/// Result of a successful build.
#[derive(Debug)]
pub struct BuiltPatch {
    /// The bundled patch archive.
    pub archive: PathBuf,
    pub index: PatchIndex,
    pub summary: BuildSummary,
}

/// Builds a patch archive from two directory trees.
///
/// The old-tree pass (existence check, byte comparison, delta) runs on a
/// dedicated Rayon pool of `workers` threads. Rayon folds each split of the
/// work into a shard tagged with the thread that ran it; those are combined
/// into one `IndexShard` per worker and merged once every worker is done.
/// The new-tree pass only copies files and runs on one thread.
pub struct PatchBuilder {
    config: BuildConfig,
    codecs: Codecs,
}

impl PatchBuilder {
    pub fn new(config: BuildConfig, codecs: Codecs) -> Self {
        Self { config, codecs }
    }

    /// Diff `old_dir` against `new_dir` and write `<out_dir>/patch_temp.bundle`.
    ///
    /// `<out_dir>/patch_temp` is used as scratch and must be absent or empty.
    /// On failure no archive is left behind.
    pub async fn build(&self, old_dir: &Path, new_dir: &Path, out_dir: &Path) -> Result<BuiltPatch> {
        self.codecs.delta.ensure_available()?;
        self.codecs.archive.ensure_available()?;

        for dir in [old_dir, new_dir] {
            if !dir.is_dir() {
                bail!("Not a directory: {}", dir.display());
            }
        }
        std::fs::create_dir_all(out_dir)
            .with_context(|| format!("Failed to create directory: {}", out_dir.display()))?;

        let scratch = ScratchDir::claim(out_dir.join(SCRATCH_DIR))?;
        let payload = scratch.path().join(PAYLOAD_DIR);
        std::fs::create_dir_all(&payload)
            .with_context(|| format!("Failed to create directory: {}", payload.display()))?;

        // Stage 1: walk both trees concurrently.
        let old_root = old_dir.to_path_buf();
        let new_root = new_dir.to_path_buf();
        let (old_files, new_files) = {
            let (o, n) = (old_root.clone(), new_root.clone());
            tokio::try_join!(
                tokio::task::spawn_blocking(move || util::walk_files(&o)),
                tokio::task::spawn_blocking(move || util::walk_files(&n)),
            )?
        };
        let old_files = old_files?;
        let new_files = new_files?;

        // Stage 2: old tree across the worker pool.
        log::info!("Checking old files in {}", old_root.display());
        let workers = self.config.workers.get();
        let shards = {
            let codec = Arc::clone(&self.codecs.delta);
            let (new_root, payload) = (new_root.clone(), payload.clone());
            tokio::task::spawn_blocking(move || -> Result<Vec<IndexShard>> {
                let pool = rayon::ThreadPoolBuilder::new()
                    .num_threads(workers)
                    .thread_name(|i| format!("dirpatch-diff-{i}"))
                    .build()
                    .context("Failed to start diff worker pool")?;
                let splits: Vec<IndexShard> = pool.install(|| {
                    old_files
                        .par_iter()
                        .try_fold(
                            || IndexShard::for_worker(rayon::current_thread_index().unwrap_or(0)),
                            |mut shard, entry| -> Result<IndexShard> {
                                if let Some(change) =
                                    diff::visit_old_file(codec.as_ref(), entry, &new_root, &payload)?
                                {
                                    shard.push(change);
                                }
                                Ok(shard)
                            },
                        )
                        .collect::<Result<_>>()
                })?;
                Ok(IndexShard::by_worker(splits))
            })
            .await??
        };

        // Stage 3: additions, single-threaded.
        let added = {
            let (old_root, payload) = (old_root.clone(), payload.clone());
            tokio::task::spawn_blocking(move || diff::scan_new_tree(&new_files, &old_root, &payload))
                .await??
        };

        // Stage 4: merge and write the index.
        let mut index = PatchIndex::new();
        index.merge(shards);
        index.extend(added);
        index.ensure_disjoint()?;
        index.write_to(&scratch.path().join(INDEX_FILE))?;

        // Stage 5: bundle.
        let archive = out_dir.join(ARCHIVE_FILE);
        {
            let codec = Arc::clone(&self.codecs.archive);
            let (src, dst) = (scratch.path().to_path_buf(), archive.clone());
            let packed = tokio::task::spawn_blocking(move || codec.pack(&src, &dst)).await?;
            if let Err(e) = packed {
                let _ = std::fs::remove_file(&archive);
                return Err(e.context("Failed to bundle patch"));
            }
        }

        let summary = BuildSummary {
            files_added: index.count(Operation::Added),
            files_modified: index.count(Operation::Modified),
            files_deleted: index.count(Operation::Deleted),
            workers,
        };
        log::info!(
            "Patch ready at {} ({} added, {} modified, {} deleted)",
            archive.display(),
            summary.files_added,
            summary.files_modified,
            summary.files_deleted
        );

        Ok(BuiltPatch {
            archive,
            index,
            summary,
        })
    }
}
