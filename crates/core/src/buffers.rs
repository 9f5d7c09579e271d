// SPDX-FileCopyrightText: © 2025 Patchbay Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Buffer descriptions shared between ports over a link.
//!
//! Buffers never carry media inline: each data chunk points into a pool
//! memory block by offset, and the `Shared` meta entry identifies the block
//! for the peer process by `{fd, offset, size}`.

use crate::mempool::{MemBlockId, MemPool};

/// Position of one buffer inside the pool's memory block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SharedRange {
    pub block: MemBlockId,
    pub offset: u32,
    pub size: u32,
}

/// Metadata attached to a buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Meta {
    /// Identifies the buffer's memory for the receiving side. Every pool
    /// buffer carries one.
    Shared(SharedRange),
    /// Frame header (timestamps, flags); filled by the producer.
    Header,
    /// Single-buffer streaming ring; size and stride as negotiated.
    Ringbuffer { size: u32, stride: u32 },
}

/// Which metadata a port asks for, matched during allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetaKind {
    Shared,
    Header,
    Ringbuffer,
}

impl Meta {
    pub const fn kind(&self) -> MetaKind {
        match self {
            Self::Shared(_) => MetaKind::Shared,
            Self::Header => MetaKind::Header,
            Self::Ringbuffer { .. } => MetaKind::Ringbuffer,
        }
    }
}

/// One region of media data inside a buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataChunk {
    pub block: MemBlockId,
    pub offset: u32,
    pub maxsize: u32,
    pub stride: u32,
}

/// A buffer in a negotiated pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Buffer {
    pub id: u32,
    pub metas: Vec<Meta>,
    pub datas: Vec<DataChunk>,
}

impl Buffer {
    pub fn shared(&self) -> Option<&SharedRange> {
        self.metas.iter().find_map(|meta| match meta {
            Meta::Shared(range) => Some(range),
            _ => None,
        })
    }
}

/// A pool of buffers backed by one memory block.
///
/// Dropping the pool releases the block from the memory pool; outstanding
/// maps keep the underlying memory alive until they are gone.
#[derive(Debug)]
pub struct BufferPool {
    mempool: MemPool,
    pub block: MemBlockId,
    pub buffers: Vec<Buffer>,
}

impl BufferPool {
    pub fn new(mempool: MemPool, block: MemBlockId, buffers: Vec<Buffer>) -> Self {
        Self { mempool, block, buffers }
    }

    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }

    pub const fn mempool(&self) -> &MemPool {
        &self.mempool
    }
}

impl Drop for BufferPool {
    fn drop(&mut self) {
        self.mempool.free(self.block);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mempool::MemFlags;

    #[test]
    fn shared_meta_lookup() {
        let range = SharedRange { block: MemBlockId(0), offset: 128, size: 64 };
        let buffer =
            Buffer { id: 0, metas: vec![Meta::Header, Meta::Shared(range)], datas: vec![] };
        assert_eq!(buffer.shared(), Some(&range));
    }

    #[test]
    fn dropping_the_pool_frees_the_block() {
        let mempool = MemPool::new();
        let block = mempool
            .alloc(MemFlags::WITH_FD | MemFlags::MAP_READWRITE | MemFlags::SEAL, 4096)
            .unwrap();
        let pool = BufferPool::new(mempool.clone(), block, Vec::new());
        assert_eq!(mempool.len(), 1);
        drop(pool);
        assert!(mempool.is_empty());
    }
}
