use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::checksum::Checksum;

/// Failure kinds a caller may need to tell apart.
///
/// Operations return `anyhow::Result`; these values sit at the root of the
/// error chain and are recovered with `err.downcast_ref::<PatchError>()`.
#[derive(Debug, Error)]
pub enum PatchError {
    /// A required external codec tool is not installed, or no path was
    /// given for it (`path` empty).
    #[error("required tool not found: {tool}{}", looked_at(path))]
    MissingDependency { tool: &'static str, path: PathBuf },

    /// The scratch directory holds leftovers from an earlier run.
    #[error("scratch directory is not empty: {}", .0.display())]
    ScratchNotEmpty(PathBuf),

    /// The install tree has no usable VERSION marker.
    #[error("could not read installed version from {}", .0.display())]
    UnreadableVersion(PathBuf),

    /// A target file does not match the state the patch was built against.
    /// Raised before anything in the target tree has been touched.
    #[error(
        "cannot apply patch: {} has checksum {actual} instead of {expected}; please reinstall the full release",
        path.display()
    )]
    ChecksumMismatchPre {
        path: PathBuf,
        expected: Checksum,
        actual: Checksum,
    },

    /// A transfer ended before the advertised number of bytes arrived.
    #[error("transfer of {object} incomplete: received {received} of {expected} bytes")]
    TransferIncomplete {
        object: String,
        expected: u64,
        received: u64,
    },

    #[error("invalid patch index at line {line}: {reason}")]
    InvalidIndex { line: usize, reason: String },

    #[error("invalid archive: {0}")]
    InvalidArchive(String),

    #[error("invalid delta: {0}")]
    InvalidDelta(String),

    /// A relative path would escape the directory it is joined onto.
    #[error("unsafe relative path in patch: {0}")]
    UnsafePath(String),

    #[error("invalid version marker in {}: {content:?}", path.display())]
    InvalidVersion { path: PathBuf, content: String },
}

fn looked_at(path: &Path) -> String {
    if path.as_os_str().is_empty() {
        " (no path given)".to_string()
    } else {
        format!(" (looked at {})", path.display())
    }
}
