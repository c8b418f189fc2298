use anyhow::{bail, Context, Result};
use memmap2::Mmap;
use std::ops::Deref;
use std::path::{Component, Path, PathBuf};
use walkdir::WalkDir;

use crate::error::PatchError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryKind {
    File,
    Dir,
}

#[derive(Debug, Clone)]
pub struct DirEntry {
    pub relative_path: String,
    pub kind: EntryKind,
    pub full_path: PathBuf,
    /// File size in bytes (0 for directories). Free from the OS directory scan.
    pub size: u64,
}

/// Walk a directory tree and collect all entries with relative paths.
/// Paths are joined with forward slashes for the patch format.
pub fn walk_directory(root: &Path) -> Result<Vec<DirEntry>> {
    let root = root
        .canonicalize()
        .with_context(|| format!("Failed to canonicalize path: {}", root.display()))?;

    let mut entries = Vec::new();

    for entry in WalkDir::new(&root).min_depth(1).sort_by_file_name() {
        let entry = entry
            .with_context(|| format!("Failed to read directory entry in {}", root.display()))?;

        let full_path = entry.path().to_path_buf();
        let relative = full_path
            .strip_prefix(&root)
            .with_context(|| "Failed to compute relative path")?;

        let relative_str = posix_relative(relative)?;

        let kind = if entry.file_type().is_dir() {
            EntryKind::Dir
        } else {
            EntryKind::File
        };

        let meta = entry
            .metadata()
            .with_context(|| format!("Failed to read metadata: {}", full_path.display()))?;
        let size = if kind == EntryKind::File { meta.len() } else { 0 };

        entries.push(DirEntry {
            relative_path: relative_str,
            kind,
            full_path,
            size,
        });
    }

    Ok(entries)
}

/// Join the components of a relative path with `/`. Only the platform
/// separator splits components, so a `\` inside a Unix file name survives.
fn posix_relative(relative: &Path) -> Result<String> {
    let mut parts = Vec::new();
    for component in relative.components() {
        match component {
            Component::Normal(part) => parts.push(
                part.to_str()
                    .with_context(|| format!("Non-UTF8 path: {}", relative.display()))?,
            ),
            _ => bail!(PatchError::UnsafePath(relative.display().to_string())),
        }
    }
    Ok(parts.join("/"))
}

/// Walk a tree and keep only regular files.
pub fn walk_files(root: &Path) -> Result<Vec<DirEntry>> {
    Ok(walk_directory(root)?
        .into_iter()
        .filter(|e| e.kind == EntryKind::File)
        .collect())
}

/// Read-only file contents. Empty files are not mapped, since a zero-length
/// mapping is rejected on some platforms.
pub enum FileData {
    Mapped(Mmap),
    Empty,
}

impl Deref for FileData {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        match self {
            FileData::Mapped(m) => m,
            FileData::Empty => &[],
        }
    }
}

/// Memory-map a file for read-only access.
///
/// # Safety
/// The mapping is read-only. Callers must not concurrently truncate or replace
/// the underlying file while the `Mmap` is live.
pub fn mmap_file(path: &Path) -> Result<FileData> {
    let file = std::fs::File::open(path)
        .with_context(|| format!("Failed to open file: {}", path.display()))?;
    let len = file
        .metadata()
        .with_context(|| format!("Failed to read metadata: {}", path.display()))?
        .len();
    if len == 0 {
        return Ok(FileData::Empty);
    }
    // SAFETY: We only read from this mapping; no concurrent modification of these files.
    let map = unsafe {
        Mmap::map(&file)
            .with_context(|| format!("Failed to memory-map file: {}", path.display()))?
    };
    Ok(FileData::Mapped(map))
}

/// Byte-for-byte comparison of two files.
pub fn files_identical(a: &Path, b: &Path) -> Result<bool> {
    let len_a = std::fs::metadata(a)
        .with_context(|| format!("Failed to read metadata: {}", a.display()))?
        .len();
    let len_b = std::fs::metadata(b)
        .with_context(|| format!("Failed to read metadata: {}", b.display()))?
        .len();
    if len_a != len_b {
        return Ok(false);
    }
    let data_a = mmap_file(a)?;
    let data_b = mmap_file(b)?;
    Ok(*data_a == *data_b)
}

/// Join a POSIX relative path from a patch onto `root`, refusing anything
/// that could land outside it.
pub fn join_relative(root: &Path, relative: &str) -> Result<PathBuf> {
    if relative.is_empty() {
        bail!(PatchError::UnsafePath(relative.to_string()));
    }
    let mut out = root.to_path_buf();
    for part in relative.split('/') {
        match Path::new(part).components().next() {
            Some(Component::Normal(_)) if Path::new(part).components().count() == 1 => {
                out.push(part)
            }
            _ => bail!(PatchError::UnsafePath(relative.to_string())),
        }
    }
    Ok(out)
}

/// True if `path` is missing or an empty directory.
pub fn is_missing_or_empty(path: &Path) -> Result<bool> {
    if !path.exists() {
        return Ok(true);
    }
    if !path.is_dir() {
        return Ok(false);
    }
    let mut entries = std::fs::read_dir(path)
        .with_context(|| format!("Failed to list directory: {}", path.display()))?;
    Ok(entries.next().is_none())
}

/// Rename `dir` to `<dir>_deleteme`, clearing any stale one first, and
/// return the new name.
pub fn move_aside(dir: &Path) -> Result<PathBuf> {
    let mut doomed = dir.as_os_str().to_owned();
    doomed.push("_deleteme");
    let doomed = PathBuf::from(doomed);
    if doomed.exists() {
        std::fs::remove_dir_all(&doomed)
            .with_context(|| format!("Failed to remove directory: {}", doomed.display()))?;
    }
    std::fs::rename(dir, &doomed)
        .with_context(|| format!("Failed to move aside directory: {}", dir.display()))?;
    Ok(doomed)
}

/// Remove `dir` (if present) and recreate it empty. The old tree is renamed
/// aside first so a half-finished removal never leaves `dir` itself dirty.
pub fn reset_dir(dir: &Path) -> Result<()> {
    if dir.exists() {
        let doomed = move_aside(dir)?;
        std::fs::remove_dir_all(&doomed)
            .with_context(|| format!("Failed to remove directory: {}", doomed.display()))?;
    }
    std::fs::create_dir_all(dir)
        .with_context(|| format!("Failed to create directory: {}", dir.display()))
}

/// Move a directory tree to `dst`, which must not exist. Falls back to a
/// recursive copy when `rename` fails, e.g. across filesystems.
pub fn move_dir(src: &Path, dst: &Path) -> Result<()> {
    if let Err(e) = std::fs::rename(src, dst) {
        log::debug!(
            "Rename of {} failed ({e}), copying instead",
            src.display()
        );
        copy_tree(src, dst)?;
        if let Err(e) = std::fs::remove_dir_all(src) {
            log::warn!("Failed to remove {}: {}", src.display(), e);
        }
    }
    Ok(())
}

/// Recreate the tree under `src` at `dst`.
pub fn copy_tree(src: &Path, dst: &Path) -> Result<()> {
    std::fs::create_dir_all(dst)
        .with_context(|| format!("Failed to create directory: {}", dst.display()))?;
    for entry in walk_directory(src)? {
        let target = join_relative(dst, &entry.relative_path)?;
        match entry.kind {
            EntryKind::Dir => std::fs::create_dir_all(&target)
                .with_context(|| format!("Failed to create directory: {}", target.display()))?,
            EntryKind::File => {
                std::fs::copy(&entry.full_path, &target).with_context(|| {
                    format!(
                        "Failed to copy {} to {}",
                        entry.full_path.display(),
                        target.display()
                    )
                })?;
            }
        }
    }
    Ok(())
}

/// Remove now-empty parent directories of `path`, stopping at `root`.
pub fn prune_empty_parents(root: &Path, path: &Path) {
    let mut cur = path.parent();
    while let Some(dir) = cur {
        if dir == root || !dir.starts_with(root) {
            break;
        }
        if std::fs::remove_dir(dir).is_err() {
            break;
        }
        cur = dir.parent();
    }
}

/// A scratch directory owned by one build or apply run. Claiming it fails
/// with `ScratchNotEmpty` if it already holds anything; dropping the guard
/// removes it, best-effort.
pub struct ScratchDir {
    path: PathBuf,
}

impl ScratchDir {
    pub fn claim(path: PathBuf) -> Result<Self> {
        if !is_missing_or_empty(&path)? {
            bail!(PatchError::ScratchNotEmpty(path));
        }
        std::fs::create_dir_all(&path)
            .with_context(|| format!("Failed to create scratch directory: {}", path.display()))?;
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for ScratchDir {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_dir_all(&self.path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                log::warn!("Failed to clean up {}: {}", self.path.display(), e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn walk_uses_forward_slashes_and_sizes() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("a/b")).unwrap();
        std::fs::write(dir.path().join("a/b/c.txt"), b"12345").unwrap();

        let files = walk_files(dir.path()).unwrap();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].relative_path, "a/b/c.txt");
        assert_eq!(files[0].size, 5);
    }

    #[cfg(unix)]
    #[test]
    fn walk_keeps_backslash_inside_file_names() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("d")).unwrap();
        std::fs::write(dir.path().join("d/a\\b.txt"), b"x").unwrap();

        let files = walk_files(dir.path()).unwrap();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].relative_path, "d/a\\b.txt");
        assert_eq!(
            join_relative(dir.path(), &files[0].relative_path).unwrap(),
            files[0].full_path
        );
    }

    #[test]
    fn walk_missing_root_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(walk_directory(&dir.path().join("absent")).is_err());
    }

    #[test]
    fn identical_detects_same_length_difference() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a");
        let b = dir.path().join("b");
        std::fs::write(&a, b"abcd").unwrap();
        std::fs::write(&b, b"abce").unwrap();
        assert!(!files_identical(&a, &b).unwrap());
        std::fs::write(&b, b"abcd").unwrap();
        assert!(files_identical(&a, &b).unwrap());
    }

    #[test]
    fn empty_files_compare_equal() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a");
        let b = dir.path().join("b");
        std::fs::write(&a, b"").unwrap();
        std::fs::write(&b, b"").unwrap();
        assert!(files_identical(&a, &b).unwrap());
    }

    #[test]
    fn join_relative_rejects_escapes() {
        let root = Path::new("/srv/app");
        assert_eq!(
            join_relative(root, "data/x.bin").unwrap(),
            PathBuf::from("/srv/app/data/x.bin")
        );
        for bad in ["../etc/passwd", "/etc/passwd", "a/../../b", "a//b", ""] {
            let err = join_relative(root, bad).unwrap_err();
            assert!(
                matches!(err.downcast_ref::<PatchError>(), Some(PatchError::UnsafePath(_))),
                "{bad} should be rejected"
            );
        }
    }

    #[test]
    fn scratch_refuses_dirty_directory() {
        let dir = tempfile::tempdir().unwrap();
        let scratch = dir.path().join("patch_temp");
        std::fs::create_dir_all(&scratch).unwrap();
        std::fs::write(scratch.join("leftover"), b"x").unwrap();

        let err = ScratchDir::claim(scratch.clone()).err().unwrap();
        assert!(matches!(
            err.downcast_ref::<PatchError>(),
            Some(PatchError::ScratchNotEmpty(_))
        ));
        assert!(scratch.join("leftover").exists());
    }

    #[test]
    fn scratch_is_removed_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        let scratch = dir.path().join("patch_temp");
        {
            let guard = ScratchDir::claim(scratch.clone()).unwrap();
            std::fs::write(guard.path().join("f"), b"x").unwrap();
        }
        assert!(!scratch.exists());
    }

    #[test]
    fn reset_dir_empties_existing_tree() {
        let dir = tempfile::tempdir().unwrap();
        let temp = dir.path().join("temp");
        std::fs::create_dir_all(temp.join("sub")).unwrap();
        std::fs::write(temp.join("sub/f"), b"x").unwrap();
        reset_dir(&temp).unwrap();
        assert!(is_missing_or_empty(&temp).unwrap());
        assert!(temp.is_dir());
    }

    #[test]
    fn copy_tree_reproduces_files_and_empty_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src");
        std::fs::create_dir_all(src.join("empty")).unwrap();
        std::fs::create_dir_all(src.join("a/b")).unwrap();
        std::fs::write(src.join("a/b/f"), b"data").unwrap();
        std::fs::write(src.join("top"), b"").unwrap();

        let dst = dir.path().join("dst");
        copy_tree(&src, &dst).unwrap();
        assert_eq!(std::fs::read(dst.join("a/b/f")).unwrap(), b"data");
        assert!(std::fs::read(dst.join("top")).unwrap().is_empty());
        assert!(dst.join("empty").is_dir());
        assert!(src.join("a/b/f").exists());
    }

    #[test]
    fn move_dir_and_move_aside() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("pkg");
        std::fs::create_dir_all(src.join("x")).unwrap();
        std::fs::write(src.join("x/f"), b"1").unwrap();

        let dst = dir.path().join("install");
        move_dir(&src, &dst).unwrap();
        assert!(!src.exists());
        assert_eq!(std::fs::read(dst.join("x/f")).unwrap(), b"1");

        std::fs::create_dir_all(dir.path().join("install_deleteme/stale")).unwrap();
        let aside = move_aside(&dst).unwrap();
        assert_eq!(aside, dir.path().join("install_deleteme"));
        assert!(!dst.exists());
        assert!(aside.join("x/f").exists());
        assert!(!aside.join("stale").exists());
    }

    #[test]
    fn prune_stops_at_root_and_non_empty_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        std::fs::create_dir_all(root.join("a/b/c")).unwrap();
        std::fs::write(root.join("a/keep"), b"x").unwrap();
        prune_empty_parents(root, &root.join("a/b/c/gone.txt"));
        assert!(!root.join("a/b").exists());
        assert!(root.join("a").exists());
    }
}
