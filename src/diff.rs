//! Directory diff: classifies every file of two trees as added, modified,
//! deleted or unchanged and writes the payload for the first two.
//!
//! Change detection is a byte-for-byte comparison. Checksums are only
//! recorded for later verification, never used to decide whether a file
//! changed.

use anyhow::{Context, Result};
use std::path::Path;

use crate::checksum;
use crate::delta::DeltaCodec;
use crate::index::{FileChangeEntry, PatchIndex};
use crate::util::{self, DirEntry};

/// Classify one file of the old tree against the new tree.
///
/// Writes a delta blob to `payload/<rel>` for a modified file. Returns `None`
/// when the file is unchanged.
pub fn visit_old_file(
    codec: &dyn DeltaCodec,
    entry: &DirEntry,
    new_root: &Path,
    payload: &Path,
) -> Result<Option<FileChangeEntry>> {
    log::trace!("    {}", entry.full_path.display());
    let rel = entry.relative_path.as_str();
    FileChangeEntry::check_path(rel)?;
    let new_path = util::join_relative(new_root, rel)?;

    if !new_path.is_file() {
        let old_sum = checksum::checksum_file(&entry.full_path)?;
        return Ok(Some(FileChangeEntry::deleted(rel, old_sum)));
    }

    if util::files_identical(&entry.full_path, &new_path)? {
        return Ok(None);
    }

    let delta_path = util::join_relative(payload, rel)?;
    if let Some(parent) = delta_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
    }
    codec
        .make_delta(&entry.full_path, &new_path, &delta_path)
        .with_context(|| format!("Failed to compute delta for {rel}"))?;

    let old_sum = checksum::checksum_file(&entry.full_path)?;
    let new_sum = checksum::checksum_file(&new_path)?;
    Ok(Some(FileChangeEntry::modified(rel, old_sum, new_sum)))
}

/// Classify one file of the new tree: anything without a regular-file
/// counterpart in the old tree is copied whole into the payload.
pub fn visit_new_file(
    entry: &DirEntry,
    old_root: &Path,
    payload: &Path,
) -> Result<Option<FileChangeEntry>> {
    log::trace!("    {}", entry.relative_path);
    let rel = entry.relative_path.as_str();
    FileChangeEntry::check_path(rel)?;
    if util::join_relative(old_root, rel)?.is_file() {
        return Ok(None);
    }

    let dest = util::join_relative(payload, rel)?;
    if let Some(parent) = dest.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
    }
    std::fs::copy(&entry.full_path, &dest).with_context(|| {
        format!(
            "Failed to copy {} to {}",
            entry.full_path.display(),
            dest.display()
        )
    })?;

    let new_sum = checksum::checksum_file(&entry.full_path)?;
    Ok(Some(FileChangeEntry::added(rel, new_sum)))
}

/// Sequential scan of the new tree for additions.
pub fn scan_new_tree(
    new_files: &[DirEntry],
    old_root: &Path,
    payload: &Path,
) -> Result<Vec<FileChangeEntry>> {
    log::info!("Checking for new files...");
    let mut added = Vec::new();
    for entry in new_files {
        if let Some(change) = visit_new_file(entry, old_root, payload)? {
            log::debug!("{change}");
            added.push(change);
        }
    }
    Ok(added)
}

/// Single-threaded diff of `old_root` against `new_root`, payload written
/// under `payload`. The parallel builder splits the old-tree half of this
/// across workers.
pub fn diff_trees(
    codec: &dyn DeltaCodec,
    old_root: &Path,
    new_root: &Path,
    payload: &Path,
) -> Result<PatchIndex> {
    log::info!("Checking old files in {}", old_root.display());
    let mut index = PatchIndex::new();
    for entry in util::walk_files(old_root)? {
        if let Some(change) = visit_old_file(codec, &entry, new_root, payload)? {
            index.push(change);
        }
    }

    index.extend(scan_new_tree(&util::walk_files(new_root)?, old_root, payload)?);
    Ok(index)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checksum::checksum_bytes;
    use crate::delta::BlockDeltaCodec;
    use crate::index::Operation;

    fn write(root: &Path, rel: &str, data: &[u8]) {
        let full = root.join(rel);
        std::fs::create_dir_all(full.parent().unwrap()).unwrap();
        std::fs::write(full, data).unwrap();
    }

    struct Trees {
        _tmp: tempfile::TempDir,
        old: std::path::PathBuf,
        new: std::path::PathBuf,
        payload: std::path::PathBuf,
    }

    fn trees() -> Trees {
        let tmp = tempfile::tempdir().unwrap();
        let old = tmp.path().join("old");
        let new = tmp.path().join("new");
        let payload = tmp.path().join("payload");
        for d in [&old, &new, &payload] {
            std::fs::create_dir_all(d).unwrap();
        }
        Trees {
            _tmp: tmp,
            old,
            new,
            payload,
        }
    }

    #[test]
    fn classifies_added_modified_deleted() {
        let t = trees();
        write(&t.old, "same.txt", b"unchanged");
        write(&t.new, "same.txt", b"unchanged");
        write(&t.old, "cfg/app.ini", b"level=1");
        write(&t.new, "cfg/app.ini", b"level=2");
        write(&t.old, "gone.dat", b"old only");
        write(&t.new, "fresh/new.dat", b"new only");

        let index = diff_trees(&BlockDeltaCodec, &t.old, &t.new, &t.payload).unwrap();
        let mut entries = index.entries().to_vec();
        entries.sort();

        assert_eq!(
            entries,
            vec![
                FileChangeEntry::added("fresh/new.dat", checksum_bytes(b"new only")),
                FileChangeEntry::modified(
                    "cfg/app.ini",
                    checksum_bytes(b"level=1"),
                    checksum_bytes(b"level=2")
                ),
                FileChangeEntry::deleted("gone.dat", checksum_bytes(b"old only")),
            ]
        );
        assert_eq!(
            std::fs::read(t.payload.join("fresh/new.dat")).unwrap(),
            b"new only"
        );
        assert!(t.payload.join("cfg/app.ini").is_file());
        assert!(!t.payload.join("gone.dat").exists());
        assert!(!t.payload.join("same.txt").exists());
    }

    #[test]
    fn identical_trees_give_empty_index() {
        let t = trees();
        for root in [&t.old, &t.new] {
            write(root, "a", b"1");
            write(root, "d/b", b"2");
        }
        let index = diff_trees(&BlockDeltaCodec, &t.old, &t.new, &t.payload).unwrap();
        assert!(index.is_empty());
    }

    #[test]
    fn empty_old_tree_adds_everything() {
        let t = trees();
        write(&t.new, "x", b"1");
        write(&t.new, "y/z", b"2");
        let index = diff_trees(&BlockDeltaCodec, &t.old, &t.new, &t.payload).unwrap();
        assert_eq!(index.count(Operation::Added), 2);
        assert_eq!(index.len(), 2);
    }

    #[test]
    fn empty_new_tree_deletes_everything() {
        let t = trees();
        write(&t.old, "x", b"1");
        write(&t.old, "y/z", b"2");
        let index = diff_trees(&BlockDeltaCodec, &t.old, &t.new, &t.payload).unwrap();
        assert_eq!(index.count(Operation::Deleted), 2);
        assert_eq!(index.len(), 2);
    }

    #[test]
    fn file_replaced_by_directory_stays_disjoint() {
        let t = trees();
        write(&t.old, "thing", b"was a file");
        write(&t.new, "thing/inside", b"now a dir");
        let index = diff_trees(&BlockDeltaCodec, &t.old, &t.new, &t.payload).unwrap();
        index.ensure_disjoint().unwrap();
        assert_eq!(index.count(Operation::Deleted), 1);
        assert_eq!(index.count(Operation::Added), 1);
    }

    #[test]
    fn same_size_change_is_detected() {
        let t = trees();
        write(&t.old, "f", b"abcd");
        write(&t.new, "f", b"abce");
        let index = diff_trees(&BlockDeltaCodec, &t.old, &t.new, &t.payload).unwrap();
        assert_eq!(index.count(Operation::Modified), 1);
    }

    #[cfg(unix)]
    #[test]
    fn backslash_in_file_name_is_not_a_separator() {
        let t = trees();
        for root in [&t.old, &t.new] {
            write(root, "a\\b.txt", b"same");
        }
        write(&t.old, "dir/x\\y", b"before");
        write(&t.new, "dir/x\\y", b"after");

        let index = diff_trees(&BlockDeltaCodec, &t.old, &t.new, &t.payload).unwrap();
        assert_eq!(index.len(), 1);
        assert_eq!(index.entries()[0].operation, Operation::Modified);
        assert_eq!(index.entries()[0].relative_path, "dir/x\\y");
    }

    #[cfg(unix)]
    #[test]
    fn line_breaks_in_file_names_are_refused() {
        use crate::error::PatchError;

        for name in ["line1\nline2", "trailing\r"] {
            let t = trees();
            write(&t.new, name, b"x");
            let err = diff_trees(&BlockDeltaCodec, &t.old, &t.new, &t.payload).unwrap_err();
            assert!(
                matches!(err.downcast_ref::<PatchError>(), Some(PatchError::UnsafePath(_))),
                "{name:?}: {err:#}"
            );

            let t = trees();
            write(&t.old, name, b"x");
            assert!(diff_trees(&BlockDeltaCodec, &t.old, &t.new, &t.payload).is_err());
        }
    }
}
