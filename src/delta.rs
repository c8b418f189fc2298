//! Single-file binary delta codecs.
//!
//! The directory engine only needs `make_delta` / `apply_delta` between files
//! on disk; which algorithm produces the blob is pluggable. The built-in
//! [`BlockDeltaCodec`] needs nothing installed. [`ExternalToolCodec`] drives
//! `bsdiff`/`bspatch` binaries for patch stores that were built with them.

use anyhow::{bail, Context, Result};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::Command;

use crate::binary_diff;
use crate::binary_patch;
use crate::error::PatchError;
use crate::patch_format::{DeltaBlob, DELTA_MAGIC, FORMAT_VERSION};
use crate::util;

pub trait DeltaCodec: Send + Sync {
    /// Fail with `MissingDependency` if the codec cannot run here.
    fn ensure_available(&self) -> Result<()> {
        Ok(())
    }

    /// Write a delta turning `old` into `new` to `delta_out`.
    fn make_delta(&self, old: &Path, new: &Path, delta_out: &Path) -> Result<()>;

    /// Write `base` with `delta` applied to `out`.
    ///
    /// `apply_delta(old, make_delta(old, new))` must reproduce `new` exactly.
    fn apply_delta(&self, base: &Path, delta: &Path, out: &Path) -> Result<()>;
}

/// Block-matching codec; blobs are zstd-compressed bincode with a magic prefix.
#[derive(Debug, Default, Clone, Copy)]
pub struct BlockDeltaCodec;

impl BlockDeltaCodec {
    pub fn encode(&self, old: &[u8], new: &[u8]) -> Result<Vec<u8>> {
        let blob = DeltaBlob {
            version: FORMAT_VERSION,
            base_len: old.len() as u64,
            chunks: binary_diff::compute_diff(old, new),
        };
        let encoded = bincode::serialize(&blob).context("Failed to serialize delta")?;
        let compressed = zstd::bulk::compress(&encoded, 3).context("Failed to compress delta")?;

        let mut out = Vec::with_capacity(DELTA_MAGIC.len() + compressed.len());
        out.extend_from_slice(DELTA_MAGIC);
        out.extend_from_slice(&compressed);
        Ok(out)
    }

    pub fn decode(&self, base: &[u8], delta: &[u8]) -> Result<Vec<u8>> {
        if delta.len() < DELTA_MAGIC.len() || &delta[..DELTA_MAGIC.len()] != DELTA_MAGIC {
            bail!(PatchError::InvalidDelta("missing magic header".to_string()));
        }
        let decoder = zstd::Decoder::new(&delta[DELTA_MAGIC.len()..])
            .context("Failed to create zstd decoder")?;
        let blob: DeltaBlob = bincode::deserialize_from(decoder)
            .map_err(|e| PatchError::InvalidDelta(format!("undecodable body: {e}")))?;

        if blob.version != FORMAT_VERSION {
            bail!(PatchError::InvalidDelta(format!(
                "unsupported delta version {} (expected {})",
                blob.version, FORMAT_VERSION
            )));
        }
        if blob.base_len != base.len() as u64 {
            bail!(PatchError::InvalidDelta(format!(
                "delta expects a {} byte base, got {}",
                blob.base_len,
                base.len()
            )));
        }
        binary_patch::apply_diff(base, &blob.chunks)
    }
}

impl DeltaCodec for BlockDeltaCodec {
    fn make_delta(&self, old: &Path, new: &Path, delta_out: &Path) -> Result<()> {
        let blob = {
            let old_data = util::mmap_file(old)?;
            let new_data = util::mmap_file(new)?;
            self.encode(&old_data, &new_data)?
        };
        write_file(delta_out, &blob)
    }

    fn apply_delta(&self, base: &Path, delta: &Path, out: &Path) -> Result<()> {
        // Mappings are dropped before writing, in case `out` aliases `base`.
        let rebuilt = {
            let base_data = util::mmap_file(base)?;
            let delta_data = util::mmap_file(delta)?;
            self.decode(&base_data, &delta_data)
                .with_context(|| format!("Failed to apply delta to {}", base.display()))?
        };
        write_file(out, &rebuilt)
    }
}

fn write_file(path: &Path, data: &[u8]) -> Result<()> {
    let mut file = std::fs::File::create(path)
        .with_context(|| format!("Failed to create file: {}", path.display()))?;
    file.write_all(data)
        .with_context(|| format!("Failed to write file: {}", path.display()))?;
    file.flush()?;
    Ok(())
}

/// Runs `bsdiff <old> <new> <patch>` and `bspatch <old> <new> <patch>`.
#[derive(Debug, Clone)]
pub struct ExternalToolCodec {
    pub diff_tool: PathBuf,
    pub patch_tool: PathBuf,
}

impl ExternalToolCodec {
    pub fn new(diff_tool: impl Into<PathBuf>, patch_tool: impl Into<PathBuf>) -> Self {
        Self {
            diff_tool: diff_tool.into(),
            patch_tool: patch_tool.into(),
        }
    }

    fn run(&self, tool: &Path, args: [&Path; 3]) -> Result<()> {
        let status = Command::new(tool)
            .args(args)
            .status()
            .with_context(|| format!("Failed to run {}", tool.display()))?;
        if !status.success() {
            bail!(
                "{} {} {} {} exited with {}",
                tool.display(),
                args[0].display(),
                args[1].display(),
                args[2].display(),
                status
            );
        }
        Ok(())
    }
}

impl DeltaCodec for ExternalToolCodec {
    fn ensure_available(&self) -> Result<()> {
        for (tool, path) in [("bsdiff", &self.diff_tool), ("bspatch", &self.patch_tool)] {
            if !path.is_file() {
                bail!(PatchError::MissingDependency {
                    tool,
                    path: path.clone(),
                });
            }
        }
        Ok(())
    }

    fn make_delta(&self, old: &Path, new: &Path, delta_out: &Path) -> Result<()> {
        self.run(&self.diff_tool, [old, new, delta_out])
    }

    fn apply_delta(&self, base: &Path, delta: &Path, out: &Path) -> Result<()> {
        self.run(&self.patch_tool, [base, out, delta])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_codec_round_trips_through_files() {
        let dir = tempfile::tempdir().unwrap();
        let old = dir.path().join("old.bin");
        let new = dir.path().join("new.bin");
        let delta = dir.path().join("delta");
        let out = dir.path().join("out.bin");

        let old_data: Vec<u8> = (0..20_000u32).map(|i| (i % 253) as u8).collect();
        let mut new_data = old_data.clone();
        new_data.splice(9000..9000, b"inserted bytes".iter().copied());
        new_data.truncate(18_000);
        std::fs::write(&old, &old_data).unwrap();
        std::fs::write(&new, &new_data).unwrap();

        let codec = BlockDeltaCodec;
        codec.make_delta(&old, &new, &delta).unwrap();
        assert!(std::fs::metadata(&delta).unwrap().len() < new_data.len() as u64);
        codec.apply_delta(&old, &delta, &out).unwrap();
        assert_eq!(std::fs::read(&out).unwrap(), new_data);
    }

    #[test]
    fn block_codec_handles_empty_files() {
        let codec = BlockDeltaCodec;
        let blob = codec.encode(b"", b"").unwrap();
        assert!(codec.decode(b"", &blob).unwrap().is_empty());
        let blob = codec.encode(b"", b"grown").unwrap();
        assert_eq!(codec.decode(b"", &blob).unwrap(), b"grown");
    }

    #[test]
    fn wrong_base_is_rejected() {
        let codec = BlockDeltaCodec;
        let blob = codec.encode(b"version one", b"version two").unwrap();
        let err = codec.decode(b"a different base", &blob).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<PatchError>(),
            Some(PatchError::InvalidDelta(_))
        ));
    }

    #[test]
    fn garbage_blob_is_rejected() {
        let codec = BlockDeltaCodec;
        assert!(codec.decode(b"base", b"not a delta").is_err());
        let mut blob = DELTA_MAGIC.to_vec();
        blob.extend_from_slice(b"junk after magic");
        assert!(codec.decode(b"base", &blob).is_err());
    }

    #[test]
    fn missing_external_tool_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let codec = ExternalToolCodec::new(dir.path().join("bsdiff"), dir.path().join("bspatch"));
        let err = codec.ensure_available().unwrap_err();
        match err.downcast_ref::<PatchError>() {
            Some(PatchError::MissingDependency { tool, .. }) => assert_eq!(*tool, "bsdiff"),
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
