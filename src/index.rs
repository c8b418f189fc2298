//! The patch index: one text line per changed file.
//!
//! ```text
//! <op> <old-checksum> <new-checksum> <relative/path>
//! ```
//!
//! `op` is `A`, `M` or `D`. A checksum that does not apply is written as `0`.
//! Only the first three spaces delimit fields, so paths may contain spaces.

use anyhow::{bail, Context, Result};
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::io::Write;
use std::path::Path;

use crate::checksum::Checksum;
use crate::error::PatchError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Operation {
    Added,
    Modified,
    Deleted,
}

impl Operation {
    pub fn code(self) -> char {
        match self {
            Operation::Added => 'A',
            Operation::Modified => 'M',
            Operation::Deleted => 'D',
        }
    }

    fn from_code(code: &str) -> Option<Self> {
        match code {
            "A" => Some(Operation::Added),
            "M" => Some(Operation::Modified),
            "D" => Some(Operation::Deleted),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FileChangeEntry {
    pub operation: Operation,
    /// POSIX-style path relative to the tree root.
    pub relative_path: String,
    /// Absent for `Added`.
    pub checksum_old: Option<Checksum>,
    /// Absent for `Deleted`.
    pub checksum_new: Option<Checksum>,
}

impl FileChangeEntry {
    /// Fail with `UnsafePath` for a path one index line cannot hold: line
    /// breaks would split the entry and a trailing `\r` is trimmed on read.
    pub fn check_path(path: &str) -> Result<()> {
        if path.contains(['\n', '\r']) {
            bail!(PatchError::UnsafePath(path.escape_debug().to_string()));
        }
        Ok(())
    }

    pub fn added(path: impl Into<String>, checksum_new: Checksum) -> Self {
        Self {
            operation: Operation::Added,
            relative_path: path.into(),
            checksum_old: None,
            checksum_new: Some(checksum_new),
        }
    }

    pub fn modified(path: impl Into<String>, checksum_old: Checksum, checksum_new: Checksum) -> Self {
        Self {
            operation: Operation::Modified,
            relative_path: path.into(),
            checksum_old: Some(checksum_old),
            checksum_new: Some(checksum_new),
        }
    }

    pub fn deleted(path: impl Into<String>, checksum_old: Checksum) -> Self {
        Self {
            operation: Operation::Deleted,
            relative_path: path.into(),
            checksum_old: Some(checksum_old),
            checksum_new: None,
        }
    }

    /// Parse one index line (without its trailing newline).
    pub fn parse_line(line: &str, line_no: usize) -> Result<Self> {
        let invalid = |reason: &str| PatchError::InvalidIndex {
            line: line_no,
            reason: reason.to_string(),
        };

        let mut parts = line.splitn(4, ' ');
        let op = parts.next().unwrap_or_default();
        let operation = Operation::from_code(op)
            .ok_or_else(|| invalid(&format!("unknown operation {op:?}")))?;
        let checksum_old: Checksum = parts
            .next()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| invalid("bad old checksum"))?;
        let checksum_new: Checksum = parts
            .next()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| invalid("bad new checksum"))?;
        let relative_path = parts
            .next()
            .filter(|p| !p.is_empty())
            .ok_or_else(|| invalid("missing path"))?;

        Ok(Self {
            operation,
            relative_path: relative_path.to_string(),
            checksum_old: (operation != Operation::Added).then_some(checksum_old),
            checksum_new: (operation != Operation::Deleted).then_some(checksum_new),
        })
    }
}

impl fmt::Display for FileChangeEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} {} {}",
            self.operation.code(),
            self.checksum_old.unwrap_or(0),
            self.checksum_new.unwrap_or(0),
            self.relative_path
        )
    }
}

/// Index fragment produced by one worker during a parallel build.
#[derive(Debug, Default)]
pub struct IndexShard {
    pub worker: usize,
    pub entries: Vec<FileChangeEntry>,
}

impl IndexShard {
    pub fn for_worker(worker: usize) -> Self {
        Self {
            worker,
            entries: Vec::new(),
        }
    }

    pub fn push(&mut self, entry: FileChangeEntry) {
        log::debug!("{entry}");
        self.entries.push(entry);
    }

    /// Combine shards produced by the same worker, ordered by worker.
    pub fn by_worker<I>(shards: I) -> Vec<IndexShard>
    where
        I: IntoIterator<Item = IndexShard>,
    {
        let mut grouped: BTreeMap<usize, IndexShard> = BTreeMap::new();
        for shard in shards {
            grouped
                .entry(shard.worker)
                .or_insert_with(|| IndexShard::for_worker(shard.worker))
                .entries
                .extend(shard.entries);
        }
        grouped.into_values().collect()
    }
}

/// The merged change set of one patch. Entry order has no meaning.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PatchIndex {
    entries: Vec<FileChangeEntry>,
}

impl PatchIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> &[FileChangeEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn push(&mut self, entry: FileChangeEntry) {
        log::debug!("{entry}");
        self.entries.push(entry);
    }

    pub fn extend<I>(&mut self, entries: I)
    where
        I: IntoIterator<Item = FileChangeEntry>,
    {
        self.entries.extend(entries);
    }

    /// Fold worker shards into the index, consuming them. With no shards left
    /// this is a no-op, so re-running a merge is harmless.
    pub fn merge<I>(&mut self, shards: I)
    where
        I: IntoIterator<Item = IndexShard>,
    {
        for shard in shards {
            log::trace!(
                "Merging {} entries from worker {}",
                shard.entries.len(),
                shard.worker
            );
            self.entries.extend(shard.entries);
        }
    }

    /// Fail if any relative path occurs more than once.
    pub fn ensure_disjoint(&self) -> Result<()> {
        let mut seen = HashSet::with_capacity(self.entries.len());
        for (i, entry) in self.entries.iter().enumerate() {
            if !seen.insert(entry.relative_path.as_str()) {
                bail!(PatchError::InvalidIndex {
                    line: i + 1,
                    reason: format!("duplicate path {}", entry.relative_path),
                });
            }
        }
        Ok(())
    }

    pub fn count(&self, op: Operation) -> usize {
        self.entries.iter().filter(|e| e.operation == op).count()
    }

    pub fn to_text(&self) -> String {
        let mut text = String::new();
        for entry in &self.entries {
            text.push_str(&entry.to_string());
            text.push('\n');
        }
        text
    }

    pub fn parse(text: &str) -> Result<Self> {
        let mut entries = Vec::new();
        for (i, line) in text.lines().enumerate() {
            let line = line.trim_end_matches('\r');
            if line.is_empty() {
                continue;
            }
            entries.push(FileChangeEntry::parse_line(line, i + 1)?);
        }
        let index = Self { entries };
        index.ensure_disjoint()?;
        Ok(index)
    }

    pub fn write_to(&self, path: &Path) -> Result<()> {
        let mut file = std::fs::File::create(path)
            .with_context(|| format!("Failed to create index: {}", path.display()))?;
        file.write_all(self.to_text().as_bytes())
            .with_context(|| format!("Failed to write index: {}", path.display()))?;
        file.flush()?;
        Ok(())
    }

    pub fn read_from(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read index: {}", path.display()))?;
        Self::parse(&text).with_context(|| format!("Failed to parse index: {}", path.display()))
    }
}
