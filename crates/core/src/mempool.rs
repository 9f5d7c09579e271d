// SPDX-FileCopyrightText: © 2025 Patchbay Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Shareable memory blocks backed by sealed memfds.
//!
//! The pool allocates blocks whose file descriptors can cross the socket, and
//! hands out mapped sub-ranges. A block is mapped at most once; every
//! [`MemMap`] into it shares that cached mapping, so two maps at different
//! offsets see pointers that differ by exactly the offset delta. Blocks stay
//! alive (fd open, mapping intact) for as long as any map references them.

use crate::error::{Error, Result};
use crate::id_map::IdMap;
use std::ffi::CStr;
use std::ops::BitOr;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd};
use std::ptr::NonNull;
use std::sync::{Arc, Mutex, OnceLock};

/// Allocation flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MemFlags(pub u32);

impl MemFlags {
    pub const NONE: Self = Self(0);
    /// The block must be backed by a passable file descriptor.
    pub const WITH_FD: Self = Self(1 << 0);
    /// Map the block read-write in this process.
    pub const MAP_READWRITE: Self = Self(1 << 1);
    /// Seal the memfd against resizing before handing it out.
    pub const SEAL: Self = Self(1 << 2);

    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for MemFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// Id of a block inside one pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MemBlockId(pub u32);

/// What backs a block's descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemKind {
    /// Sealed memfd allocated by this pool.
    MemFd,
    /// Device buffer imported from a peer.
    DmaBuf,
    /// Some other descriptor-backed region imported from a peer.
    External,
}

/// One whole-block mapping, unmapped on drop.
#[derive(Debug)]
struct Mapping {
    base: NonNull<u8>,
    len: usize,
}

// The mapping is plain shared memory; all access goes through raw pointers
// with explicit bounds checks.
#[allow(unsafe_code)]
unsafe impl Send for Mapping {}
#[allow(unsafe_code)]
unsafe impl Sync for Mapping {}

impl Mapping {
    #[allow(unsafe_code)]
    fn new(fd: BorrowedFd<'_>, len: usize) -> Result<Self> {
        use nix::sys::mman::{mmap, MapFlags, ProtFlags};

        let length = std::num::NonZeroUsize::new(len)
            .ok_or_else(|| Error::InvalidArgument("cannot map an empty block".into()))?;
        // SAFETY: mapping a sealed memfd we own; the kernel guarantees the
        // file cannot shrink underneath the mapping.
        let base = unsafe {
            mmap(None, length, ProtFlags::PROT_READ | ProtFlags::PROT_WRITE, MapFlags::MAP_SHARED, fd, 0)
        }?;
        Ok(Self { base: base.cast(), len })
    }
}

impl Drop for Mapping {
    #[allow(unsafe_code)]
    fn drop(&mut self) {
        // SAFETY: base/len came from a successful mmap and are unmapped once.
        unsafe {
            let _ = nix::sys::mman::munmap(self.base.cast(), self.len);
        }
    }
}

#[derive(Debug)]
struct BlockShared {
    fd: OwnedFd,
    kind: MemKind,
    size: usize,
    flags: MemFlags,
    mapping: OnceLock<Arc<Mapping>>,
}

impl BlockShared {
    fn mapping(&self) -> Result<Arc<Mapping>> {
        if let Some(mapping) = self.mapping.get() {
            return Ok(mapping.clone());
        }
        let mapping = Arc::new(Mapping::new(self.fd.as_fd(), self.size)?);
        // A racing creator just drops its duplicate mapping.
        let _ = self.mapping.set(mapping.clone());
        Ok(self.mapping.get().cloned().unwrap_or(mapping))
    }
}

/// A mapped sub-range of one block.
#[derive(Debug, Clone)]
pub struct MemMap {
    block: Arc<BlockShared>,
    mapping: Arc<Mapping>,
    offset: usize,
    len: usize,
}

impl MemMap {
    /// Address of the first byte of this map.
    pub fn ptr(&self) -> NonNull<u8> {
        // Bounds were checked at map time; the whole-block mapping covers
        // offset..offset+len.
        #[allow(unsafe_code)]
        // SAFETY: offset + len <= mapping.len, verified in `MemPool::map`.
        unsafe {
            NonNull::new_unchecked(self.mapping.base.as_ptr().add(self.offset))
        }
    }

    pub const fn len(&self) -> usize {
        self.len
    }

    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub const fn offset(&self) -> usize {
        self.offset
    }

    /// Copies `src` into the map at `offset`.
    #[allow(unsafe_code)]
    pub fn write_at(&self, offset: usize, src: &[u8]) -> Result<()> {
        if offset + src.len() > self.len {
            return Err(Error::InvalidArgument("write outside mapped range".into()));
        }
        // SAFETY: range checked above; shared memory accessed bytewise
        // through raw pointers, no Rust references are formed.
        unsafe {
            std::ptr::copy_nonoverlapping(src.as_ptr(), self.ptr().as_ptr().add(offset), src.len());
        }
        Ok(())
    }

    /// Copies `dst.len()` bytes out of the map at `offset`.
    #[allow(unsafe_code)]
    pub fn read_at(&self, offset: usize, dst: &mut [u8]) -> Result<()> {
        if offset + dst.len() > self.len {
            return Err(Error::InvalidArgument("read outside mapped range".into()));
        }
        // SAFETY: as in `write_at`.
        unsafe {
            std::ptr::copy_nonoverlapping(self.ptr().as_ptr().add(offset), dst.as_mut_ptr(), dst.len());
        }
        Ok(())
    }

    pub fn block_fd(&self) -> BorrowedFd<'_> {
        self.block.fd.as_fd()
    }
}

#[derive(Debug, Default)]
struct PoolInner {
    blocks: IdMap<Arc<BlockShared>>,
}

/// The memory pool. Clones share the same block table.
#[derive(Debug, Clone, Default)]
pub struct MemPool {
    inner: Arc<Mutex<PoolInner>>,
}

const MEMFD_NAME: &CStr = c"patchbay-mem";

impl MemPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocates a block of `size` bytes.
    ///
    /// With `WITH_FD | SEAL` the backing memfd is sealed against resizing, so
    /// consumers can map it without fearing SIGBUS.
    pub fn alloc(&self, flags: MemFlags, size: usize) -> Result<MemBlockId> {
        use nix::fcntl::{fcntl, FcntlArg, SealFlag};
        use nix::sys::memfd::{memfd_create, MemFdCreateFlag};

        if size == 0 {
            return Err(Error::InvalidArgument("zero-sized memory block".into()));
        }
        if !flags.contains(MemFlags::WITH_FD) {
            return Err(Error::InvalidArgument("only fd-backed blocks are supported".into()));
        }

        let mut mfd_flags = MemFdCreateFlag::MFD_CLOEXEC;
        if flags.contains(MemFlags::SEAL) {
            mfd_flags |= MemFdCreateFlag::MFD_ALLOW_SEALING;
        }
        let fd = memfd_create(MEMFD_NAME, mfd_flags)?;
        nix::unistd::ftruncate(&fd, i64::try_from(size).unwrap_or(i64::MAX))?;

        if flags.contains(MemFlags::SEAL) {
            fcntl(
                fd.as_raw_fd(),
                FcntlArg::F_ADD_SEALS(
                    SealFlag::F_SEAL_GROW | SealFlag::F_SEAL_SHRINK | SealFlag::F_SEAL_SEAL,
                ),
            )?;
        }

        let shared = Arc::new(BlockShared {
            fd,
            kind: MemKind::MemFd,
            size,
            flags,
            mapping: OnceLock::new(),
        });
        let mut inner = self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let id = inner.blocks.insert(shared);
        tracing::debug!(block = id, size, "allocated memory block");
        Ok(MemBlockId(id))
    }

    /// Adopts a descriptor received from a peer.
    pub fn import(&self, fd: OwnedFd, size: usize, flags: MemFlags) -> MemBlockId {
        self.import_kind(fd, MemKind::External, size, flags)
    }

    pub fn import_kind(
        &self,
        fd: OwnedFd,
        kind: MemKind,
        size: usize,
        flags: MemFlags,
    ) -> MemBlockId {
        let shared = Arc::new(BlockShared { fd, kind, size, flags, mapping: OnceLock::new() });
        let mut inner = self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        MemBlockId(inner.blocks.insert(shared))
    }

    pub fn kind_of(&self, id: MemBlockId) -> Result<MemKind> {
        Ok(self.shared(id)?.kind)
    }

    /// Maps `size` bytes at `offset` into the block.
    ///
    /// Repeated maps of one block share a single underlying whole-block
    /// mapping: the pointers of two maps differ by exactly their offset
    /// difference.
    pub fn map(&self, id: MemBlockId, offset: usize, size: usize) -> Result<MemMap> {
        let block = self.shared(id)?;
        if offset + size > block.size {
            return Err(Error::InvalidArgument(format!(
                "map of {size}@{offset} exceeds block size {}",
                block.size
            )));
        }
        if !block.flags.contains(MemFlags::MAP_READWRITE) {
            return Err(Error::InvalidArgument("block was not allocated mappable".into()));
        }
        let mapping = block.mapping()?;
        Ok(MemMap { block, mapping, offset, len: size })
    }

    /// Duplicates the block's descriptor for sending to a peer.
    pub fn dup_fd(&self, id: MemBlockId) -> Result<OwnedFd> {
        let block = self.shared(id)?;
        block.fd.try_clone().map_err(Error::from)
    }

    pub fn size_of(&self, id: MemBlockId) -> Result<usize> {
        Ok(self.shared(id)?.size)
    }

    /// Drops the pool's reference. Outstanding maps keep the block alive.
    pub fn free(&self, id: MemBlockId) {
        let mut inner = self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        if inner.blocks.remove(id.0).is_some() {
            tracing::debug!(block = id.0, "freed memory block");
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner).blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn shared(&self, id: MemBlockId) -> Result<Arc<BlockShared>> {
        let inner = self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        inner.blocks.get(id.0).cloned().ok_or(Error::UnknownObject(id.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn page_size() -> usize {
        nix::unistd::sysconf(nix::unistd::SysconfVar::PAGE_SIZE)
            .ok()
            .flatten()
            .map_or(4096, |v| usize::try_from(v).unwrap_or(4096))
    }

    fn pool_flags() -> MemFlags {
        MemFlags::WITH_FD | MemFlags::MAP_READWRITE | MemFlags::SEAL
    }

    #[test]
    fn roundtrip_through_the_mapping() {
        let pool = MemPool::new();
        let id = pool.alloc(pool_flags(), 4096).unwrap();
        assert_eq!(pool.kind_of(id).unwrap(), MemKind::MemFd);
        let map = pool.map(id, 0, 4096).unwrap();
        map.write_at(100, b"patchbay").unwrap();
        let mut back = [0u8; 8];
        map.read_at(100, &mut back).unwrap();
        assert_eq!(&back, b"patchbay");
    }

    #[test]
    fn offset_reuse_shares_one_mapping() {
        let p = page_size();
        let pool = MemPool::new();
        let id = pool.alloc(pool_flags(), 2 * p).unwrap();

        let a = pool.map(id, p / 2, p).unwrap();
        let b = pool.map(id, p / 2 + p, p / 2).unwrap();

        let delta = b.ptr().as_ptr() as usize - a.ptr().as_ptr() as usize;
        assert_eq!(delta, p);
    }

    #[test]
    fn maps_outlive_the_pool_entry() {
        let pool = MemPool::new();
        let id = pool.alloc(pool_flags(), 1024).unwrap();
        let map = pool.map(id, 0, 1024).unwrap();
        pool.free(id);
        assert!(pool.map(id, 0, 16).is_err());
        // The old map still works against the retained block.
        map.write_at(0, &[1, 2, 3]).unwrap();
    }

    #[test]
    fn out_of_range_map_is_rejected() {
        let pool = MemPool::new();
        let id = pool.alloc(pool_flags(), 512).unwrap();
        assert!(pool.map(id, 256, 512).is_err());
    }

    #[test]
    fn unsealed_alloc_needs_fd_flag() {
        let pool = MemPool::new();
        assert!(pool.alloc(MemFlags::MAP_READWRITE, 64).is_err());
        assert!(pool.alloc(pool_flags(), 0).is_err());
    }
}
