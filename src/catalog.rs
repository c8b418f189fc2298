//! The update server as seen by the planner, updater and deployer.
//!
//! Layout:
//!
//! ```text
//! <root>/latest          full package of the newest version
//! <root>/patches/v2      patch from v1 to v2
//! <root>/patches/v3      patch from v2 to v3
//! ```
//!
//! Transfers are blocking and sequential, one object at a time, with a
//! progress callback per received or sent chunk.

use anyhow::{bail, Context, Result};
use std::fmt;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use crate::error::PatchError;

const CHUNK: usize = 100 * 1024;
pub const PATCHES_DIR: &str = "patches";
pub const LATEST: &str = "latest";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RemoteObject {
    /// The full current package.
    Latest,
    /// The patch producing this version from its predecessor.
    Patch(u32),
}

impl RemoteObject {
    pub fn patch_name(version: u32) -> String {
        format!("v{version}")
    }

    /// Parse a `patches/` listing entry; anything but `v<digits>` is ignored.
    pub fn parse_patch_name(name: &str) -> Option<u32> {
        let digits = name.strip_prefix('v')?;
        if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        digits.parse().ok()
    }

    fn relative_path(&self) -> PathBuf {
        match self {
            RemoteObject::Latest => PathBuf::from(LATEST),
            RemoteObject::Patch(v) => Path::new(PATCHES_DIR).join(Self::patch_name(*v)),
        }
    }
}

impl fmt::Display for RemoteObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RemoteObject::Latest => f.write_str(LATEST),
            RemoteObject::Patch(v) => write!(f, "{PATCHES_DIR}/v{v}"),
        }
    }
}

pub trait RemoteCatalog: Send + Sync {
    /// Names of the entries under `patches/`, unfiltered.
    fn list_patches(&self) -> Result<Vec<String>>;

    /// Transfer size of an object in bytes.
    fn size(&self, object: RemoteObject) -> Result<u64>;

    /// Download `object` to `dest`, calling `progress` with each chunk's
    /// length. Returns the number of bytes received; [`download`] checks it
    /// against [`RemoteCatalog::size`].
    fn fetch(&self, object: RemoteObject, dest: &Path, progress: &mut dyn FnMut(u64)) -> Result<u64>;

    /// Upload `source` as `object`, calling `progress` per chunk sent.
    fn store(&self, source: &Path, object: RemoteObject, progress: &mut dyn FnMut(u64)) -> Result<()>;
}

/// Fetch `object` into `dest` and fail with `TransferIncomplete` unless the
/// byte count matches the advertised size.
pub fn download(
    catalog: &dyn RemoteCatalog,
    object: RemoteObject,
    dest: &Path,
    progress: &mut dyn FnMut(u64),
) -> Result<u64> {
    let expected = catalog.size(object)?;
    let received = catalog.fetch(object, dest, progress)?;
    if received != expected {
        bail!(PatchError::TransferIncomplete {
            object: object.to_string(),
            expected,
            received,
        });
    }
    Ok(received)
}

/// A catalog served from a local or mounted directory.
#[derive(Debug, Clone)]
pub struct DirectoryCatalog {
    root: PathBuf,
}

impl DirectoryCatalog {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path_of(&self, object: RemoteObject) -> PathBuf {
        self.root.join(object.relative_path())
    }
}

/// Stream `src` into `dst` in fixed chunks, reporting each one.
fn copy_chunked(src: &mut dyn Read, dst: &mut dyn Write, progress: &mut dyn FnMut(u64)) -> std::io::Result<u64> {
    let mut buf = vec![0u8; CHUNK];
    let mut total = 0u64;
    loop {
        let n = match src.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };
        dst.write_all(&buf[..n])?;
        total += n as u64;
        progress(n as u64);
    }
    dst.flush()?;
    Ok(total)
}

impl RemoteCatalog for DirectoryCatalog {
    fn list_patches(&self) -> Result<Vec<String>> {
        let dir = self.root.join(PATCHES_DIR);
        if !dir.is_dir() {
            return Ok(Vec::new());
        }
        let mut names = Vec::new();
        for entry in std::fs::read_dir(&dir)
            .with_context(|| format!("Failed to list patches in {}", dir.display()))?
        {
            let entry = entry?;
            if entry.file_type()?.is_file() {
                if let Some(name) = entry.file_name().to_str() {
                    names.push(name.to_string());
                }
            }
        }
        Ok(names)
    }

    fn size(&self, object: RemoteObject) -> Result<u64> {
        let path = self.path_of(object);
        Ok(std::fs::metadata(&path)
            .with_context(|| format!("Failed to query size of {object} at {}", path.display()))?
            .len())
    }

    fn fetch(&self, object: RemoteObject, dest: &Path, progress: &mut dyn FnMut(u64)) -> Result<u64> {
        let src_path = self.path_of(object);
        let mut src = std::fs::File::open(&src_path)
            .with_context(|| format!("Failed to open {object} at {}", src_path.display()))?;
        let mut dst = std::io::BufWriter::new(
            std::fs::File::create(dest)
                .with_context(|| format!("Failed to create file: {}", dest.display()))?,
        );
        copy_chunked(&mut src, &mut dst, progress).with_context(|| format!("Failed to download {object}"))
    }

    fn store(&self, source: &Path, object: RemoteObject, progress: &mut dyn FnMut(u64)) -> Result<()> {
        let dest = self.path_of(object);
        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
        }
        // Written aside and renamed so readers never see a partial object.
        let mut partial = dest.as_os_str().to_owned();
        partial.push(".partial");
        let partial = PathBuf::from(partial);

        let expected = std::fs::metadata(source)
            .with_context(|| format!("Failed to read metadata: {}", source.display()))?
            .len();
        let mut src = std::fs::File::open(source)
            .with_context(|| format!("Failed to open file: {}", source.display()))?;
        let sent = {
            let mut dst = std::io::BufWriter::new(
                std::fs::File::create(&partial)
                    .with_context(|| format!("Failed to create file: {}", partial.display()))?,
            );
            copy_chunked(&mut src, &mut dst, progress)
                .with_context(|| format!("Failed to upload {object}"))?
        };
        if sent != expected {
            let _ = std::fs::remove_file(&partial);
            bail!(PatchError::TransferIncomplete {
                object: object.to_string(),
                expected,
                received: sent,
            });
        }
        std::fs::rename(&partial, &dest)
            .with_context(|| format!("Failed to publish {object} at {}", dest.display()))
    }
}

/// Byte counter for a multi-object transfer, logging every 10 %.
pub struct TransferProgress {
    total: u64,
    done: u64,
    last_decile: u64,
}

impl TransferProgress {
    pub fn new(total: u64) -> Self {
        Self {
            total,
            done: 0,
            last_decile: 0,
        }
    }

    pub fn add(&mut self, bytes: u64) {
        self.done += bytes;
        if self.total == 0 {
            return;
        }
        let decile = (self.done.min(self.total) * 10) / self.total;
        if decile > self.last_decile {
            self.last_decile = decile;
            log::info!("{:>3}% ({} / {} bytes)", decile * 10, self.done, self.total);
        }
    }

    pub fn done(&self) -> u64 {
        self.done
    }
}
