use std::collections::HashMap;

use crate::patch_format::DiffChunk;
use crate::rolling_hash::RollingHash;

pub const BLOCK_SIZE: usize = 4096;

struct Block {
    strong: blake3::Hash,
    offset: usize,
}

/// Index of the base's full-size blocks keyed by weak hash.
struct BlockIndex {
    by_weak: HashMap<u32, Vec<Block>>,
}

impl BlockIndex {
    fn build(base: &[u8]) -> Self {
        let mut by_weak: HashMap<u32, Vec<Block>> = HashMap::new();
        for (i, block) in base.chunks_exact(BLOCK_SIZE).enumerate() {
            by_weak
                .entry(RollingHash::over(block).digest())
                .or_default()
                .push(Block {
                    strong: blake3::hash(block),
                    offset: i * BLOCK_SIZE,
                });
        }
        Self { by_weak }
    }

    fn lookup(&self, weak: u32, window: &[u8]) -> Option<usize> {
        let candidates = self.by_weak.get(&weak)?;
        let strong = blake3::hash(window);
        candidates
            .iter()
            .find(|b| b.strong == strong)
            .map(|b| b.offset)
    }
}

/// Encode `target` as copies from `base` plus literal inserts.
///
/// rsync-style: the base is cut into fixed blocks, a rolling hash slides over
/// the target, and weak hits are confirmed with BLAKE3 before a copy is
/// emitted. Adjacent copies of consecutive base blocks are merged.
pub fn compute_diff(base: &[u8], target: &[u8]) -> Vec<DiffChunk> {
    let mut out = ChunkWriter::default();

    if base.len() < BLOCK_SIZE || target.len() < BLOCK_SIZE {
        out.insert(target);
        return out.finish();
    }

    let index = BlockIndex::build(base);
    let mut pos = 0usize;
    let mut rolling = RollingHash::over(&target[..BLOCK_SIZE]);

    while pos + BLOCK_SIZE <= target.len() {
        let window = &target[pos..pos + BLOCK_SIZE];
        if let Some(offset) = index.lookup(rolling.digest(), window) {
            out.copy(offset as u64, BLOCK_SIZE as u64);
            pos += BLOCK_SIZE;
            if pos + BLOCK_SIZE <= target.len() {
                rolling = RollingHash::over(&target[pos..pos + BLOCK_SIZE]);
            }
        } else {
            out.insert(&target[pos..pos + 1]);
            pos += 1;
            if pos + BLOCK_SIZE <= target.len() {
                rolling.roll(target[pos - 1], target[pos + BLOCK_SIZE - 1]);
            }
        }
    }

    out.insert(&target[pos..]);
    out.finish()
}

#[derive(Default)]
struct ChunkWriter {
    chunks: Vec<DiffChunk>,
    pending: Vec<u8>,
}

impl ChunkWriter {
    fn insert(&mut self, data: &[u8]) {
        self.pending.extend_from_slice(data);
    }

    fn copy(&mut self, offset: u64, length: u64) {
        self.flush_insert();
        if let Some(DiffChunk::Copy {
            offset: prev_off,
            length: prev_len,
        }) = self.chunks.last_mut()
        {
            if *prev_off + *prev_len == offset {
                *prev_len += length;
                return;
            }
        }
        self.chunks.push(DiffChunk::Copy { offset, length });
    }

    fn flush_insert(&mut self) {
        if !self.pending.is_empty() {
            self.chunks.push(DiffChunk::Insert {
                data: std::mem::take(&mut self.pending),
            });
        }
    }

    fn finish(mut self) -> Vec<DiffChunk> {
        self.flush_insert();
        self.chunks
    }
}
