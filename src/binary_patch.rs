use anyhow::{bail, Result};

use crate::error::PatchError;
use crate::patch_format::DiffChunk;

/// Rebuild the target from `base` and a chunk list.
///
/// All copies are bounds-checked before anything is allocated, so a corrupt
/// chunk list fails with `InvalidDelta` instead of panicking.
pub fn apply_diff(base: &[u8], chunks: &[DiffChunk]) -> Result<Vec<u8>> {
    let mut out_len = 0usize;
    for chunk in chunks {
        out_len = out_len.saturating_add(match chunk {
            DiffChunk::Copy { offset, length } => copy_range(base.len(), *offset, *length)?.len(),
            DiffChunk::Insert { data } => data.len(),
        });
    }

    let mut result = Vec::with_capacity(out_len);
    for chunk in chunks {
        match chunk {
            DiffChunk::Copy { offset, length } => {
                result.extend_from_slice(&base[copy_range(base.len(), *offset, *length)?]);
            }
            DiffChunk::Insert { data } => result.extend_from_slice(data),
        }
    }
    Ok(result)
}

fn copy_range(base_len: usize, offset: u64, length: u64) -> Result<std::ops::Range<usize>> {
    match offset.checked_add(length) {
        Some(end) if end <= base_len as u64 => Ok(offset as usize..end as usize),
        _ => bail!(PatchError::InvalidDelta(format!(
            "copy of {length} bytes at offset {offset} exceeds base of {base_len} bytes"
        ))),
    }
}
