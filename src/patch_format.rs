use serde::{Deserialize, Serialize};

use crate::checksum::Checksum;

/// Magic prefix of a built-in delta blob.
pub const DELTA_MAGIC: &[u8; 8] = b"DPDELT01";
/// Magic prefix of a bundled archive.
pub const ARCHIVE_MAGIC: &[u8; 8] = b"DPARCH01";
pub const FORMAT_VERSION: u32 = 1;

/// Name of the merged index file at the root of a patch archive.
pub const INDEX_FILE: &str = "index";
/// Directory inside a patch archive that mirrors the target tree.
pub const PAYLOAD_DIR: &str = "files";
/// Scratch directory used while building or applying.
pub const SCRATCH_DIR: &str = "patch_temp";
/// File name of a freshly built patch archive inside the output directory.
pub const ARCHIVE_FILE: &str = "patch_temp.bundle";

#[derive(Debug, Serialize, Deserialize)]
pub struct DeltaBlob {
    pub version: u32,
    /// Length of the base the delta was computed against.
    pub base_len: u64,
    pub chunks: Vec<DiffChunk>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum DiffChunk {
    Copy { offset: u64, length: u64 },
    Insert { data: Vec<u8> },
}

/// First record of an archive stream.
#[derive(Debug, Serialize, Deserialize)]
pub struct ArchiveHeader {
    pub version: u32,
}

/// One record of an archive stream. The stream ends with `None`; a `File`
/// record is followed by exactly `len` raw content bytes.
#[derive(Debug, Serialize, Deserialize)]
pub enum ArchiveEntry {
    Dir { path: String },
    File { path: String, len: u64 },
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct BuildSummary {
    pub files_added: usize,
    pub files_modified: usize,
    pub files_deleted: usize,
    pub workers: usize,
}

/// A file whose content did not match the patch after it was applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CorruptFile {
    pub path: String,
    pub expected: Checksum,
    pub actual: Checksum,
}

#[derive(Debug, Default)]
pub struct ApplyReport {
    pub files_added: usize,
    pub files_modified: usize,
    pub files_deleted: usize,
    /// Post-validation failures. The tree is patched but these files are
    /// suspect; a full reinstall is the remedy.
    pub corrupt: Vec<CorruptFile>,
}

impl ApplyReport {
    pub fn is_clean(&self) -> bool {
        self.corrupt.is_empty()
    }
}
