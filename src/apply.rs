use anyhow::{bail, Context, Result};
use std::path::{Path, PathBuf};

use crate::checksum;
use crate::config::Codecs;
use crate::delta::DeltaCodec;
use crate::error::PatchError;
use crate::index::{FileChangeEntry, Operation, PatchIndex};
use crate::patch_format::{ApplyReport, CorruptFile, INDEX_FILE, PAYLOAD_DIR, SCRATCH_DIR};
use crate::util::{self, ScratchDir};

/// Applies patch archives to an install tree.
///
/// Strictly sequential: verify every touched file against its old checksum,
/// then mutate, then verify results. A failed pre-check aborts before the
/// target is touched. A failed post-check is reported in the `ApplyReport`
/// but nothing is rolled back.
pub struct PatchApplier {
    codecs: Codecs,
}

impl PatchApplier {
    pub fn new(codecs: Codecs) -> Self {
        Self { codecs }
    }

    /// Apply `patch_file` to `target_dir`, extracting into
    /// `<patch dir>/patch_temp`, which must be absent or empty.
    pub async fn apply(&self, patch_file: &Path, target_dir: &Path) -> Result<ApplyReport> {
        let codecs = self.codecs.clone();
        let patch_file = patch_file.to_path_buf();
        let target_dir = target_dir.to_path_buf();
        tokio::task::spawn_blocking(move || apply_blocking(&codecs, &patch_file, &target_dir)).await?
    }
}

fn apply_blocking(codecs: &Codecs, patch_file: &Path, target_dir: &Path) -> Result<ApplyReport> {
    codecs.delta.ensure_available()?;
    codecs.archive.ensure_available()?;

    let target = target_dir
        .canonicalize()
        .with_context(|| format!("Failed to canonicalize target: {}", target_dir.display()))?;
    let base_dir = patch_file
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));

    // Dropped on every exit path, removing the extraction.
    let scratch = ScratchDir::claim(base_dir.join(SCRATCH_DIR))?;
    codecs
        .archive
        .unpack(patch_file, scratch.path())
        .with_context(|| format!("Failed to extract patch: {}", patch_file.display()))?;
    let index = PatchIndex::read_from(&scratch.path().join(INDEX_FILE))?;
    let payload = scratch.path().join(PAYLOAD_DIR);

    log::info!("Checking for correct version of files...");
    pre_validate(&index, &target)?;

    log::info!("Applying patch...");
    let mut report = ApplyReport::default();
    for entry in index.entries() {
        log::debug!("{} {}", entry.operation.code(), entry.relative_path);
        apply_entry(codecs.delta.as_ref(), entry, &payload, &target)?;
        match entry.operation {
            Operation::Added => report.files_added += 1,
            Operation::Modified => report.files_modified += 1,
            Operation::Deleted => report.files_deleted += 1,
        }
    }

    log::info!("Validating result...");
    report.corrupt = post_validate(&index, &target)?;
    for bad in &report.corrupt {
        log::warn!(
            "File {} is corrupted (checksum {} instead of {})! Please reinstall the full release.",
            bad.path,
            bad.actual,
            bad.expected
        );
    }

    Ok(report)
}

/// Every file the patch modifies or deletes must match its recorded old
/// checksum. Runs before any mutation.
fn pre_validate(index: &PatchIndex, target: &Path) -> Result<()> {
    for entry in index.entries() {
        let Some(expected) = entry.checksum_old else {
            continue;
        };
        let path = util::join_relative(target, &entry.relative_path)?;
        log::trace!("{}", path.display());
        // A missing file cannot be at the expected version either.
        let actual = if path.is_file() {
            checksum::checksum_file(&path)?
        } else {
            0
        };
        if actual != expected {
            bail!(PatchError::ChecksumMismatchPre {
                path,
                expected,
                actual,
            });
        }
    }
    Ok(())
}

fn post_validate(index: &PatchIndex, target: &Path) -> Result<Vec<CorruptFile>> {
    let mut corrupt = Vec::new();
    for entry in index.entries() {
        let Some(expected) = entry.checksum_new else {
            continue;
        };
        let path = util::join_relative(target, &entry.relative_path)?;
        log::trace!("{}", path.display());
        // An unreadable result counts as corrupt rather than aborting.
        let actual = checksum::checksum_file(&path).unwrap_or(0);
        if actual != expected {
            corrupt.push(CorruptFile {
                path: entry.relative_path.clone(),
                expected,
                actual,
            });
        }
    }
    Ok(corrupt)
}

fn apply_entry(codec: &dyn DeltaCodec, entry: &FileChangeEntry, payload: &Path, target: &Path) -> Result<()> {
    let dst = util::join_relative(target, &entry.relative_path)?;
    match entry.operation {
        Operation::Added => {
            let src = util::join_relative(payload, &entry.relative_path)?;
            if let Some(parent) = dst.parent() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
            }
            move_file(&src, &dst)
        }
        Operation::Modified => {
            let delta = util::join_relative(payload, &entry.relative_path)?;
            let mut tmp = dst.as_os_str().to_owned();
            tmp.push(".patch_tmp");
            let tmp = PathBuf::from(tmp);
            if let Err(e) = codec.apply_delta(&dst, &delta, &tmp) {
                let _ = std::fs::remove_file(&tmp);
                return Err(e.context(format!("Failed to patch {}", dst.display())));
            }
            std::fs::rename(&tmp, &dst)
                .with_context(|| format!("Failed to replace patched file: {}", dst.display()))
        }
        Operation::Deleted => {
            match std::fs::remove_file(&dst) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    return Err(anyhow::Error::from(e))
                        .with_context(|| format!("Failed to delete file: {}", dst.display()))
                }
            }
            util::prune_empty_parents(target, &dst);
            Ok(())
        }
    }
}

/// Rename, falling back to copy + remove when the payload sits on another
/// filesystem.
fn move_file(src: &Path, dst: &Path) -> Result<()> {
    if std::fs::rename(src, dst).is_ok() {
        return Ok(());
    }
    std::fs::copy(src, dst)
        .with_context(|| format!("Failed to copy {} to {}", src.display(), dst.display()))?;
    if let Err(e) = std::fs::remove_file(src) {
        log::warn!("Failed to remove {}: {}", src.display(), e);
    }
    Ok(())
}
