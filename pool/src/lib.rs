//! Pinned block pool backing vectored socket I/O.
//!
//! A [`BlockPool`] owns one page-aligned, `mmap`-backed arena carved into
//! fixed-size blocks. [`BlockPool::rent`] hands out [`Block`] handles;
//! a block's address is stable for as long as any handle to it exists,
//! which makes it safe to place in an `iovec` that the kernel fills or
//! drains. Handles are reference-counted: cloning shares the block, and
//! the last drop returns it to the free list.
//!
//! Each event loop owns its own pool instance. The free list is
//! internally synchronized because handles are released from whichever
//! thread happens to drop the last reference (typically the consumer
//! side of a byte pipe).

use std::io;
use std::sync::Arc;

use parking_lot::Mutex;

/// Default block size. One page; sized so a 32-entry iovec covers 128 KiB.
pub const DEFAULT_BLOCK_SIZE: usize = 4096;

/// Page-aligned anonymous mapping. Address is fixed for the lifetime of
/// the mapping.
#[derive(Debug)]
struct Arena {
    ptr: *mut u8,
    len: usize,
}

unsafe impl Send for Arena {}
unsafe impl Sync for Arena {}

impl Arena {
    fn map(len: usize) -> io::Result<Arena> {
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }
        Ok(Arena {
            ptr: ptr.cast(),
            len,
        })
    }
}

impl Drop for Arena {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.ptr.cast(), self.len);
        }
    }
}

#[derive(Debug)]
struct PoolShared {
    arena: Arena,
    block_size: usize,
    block_count: usize,
    free: Mutex<Vec<u32>>,
}

impl PoolShared {
    fn block_ptr(&self, index: u32) -> *mut u8 {
        debug_assert!((index as usize) < self.block_count);
        unsafe { self.arena.ptr.add(index as usize * self.block_size) }
    }
}

/// A pool of fixed-size pinned blocks.
#[derive(Clone)]
pub struct BlockPool {
    shared: Arc<PoolShared>,
}

impl BlockPool {
    /// Create a pool of `block_count` blocks of `block_size` bytes each.
    ///
    /// `block_size` must be non-zero. The arena is rounded up to a whole
    /// number of pages; the pool never grows.
    pub fn new(block_size: usize, block_count: usize) -> io::Result<BlockPool> {
        assert!(block_size > 0, "block_size must be positive");
        assert!(block_count > 0, "block_count must be positive");
        assert!(block_count <= u32::MAX as usize, "block_count must fit in u32");

        let page = page_size();
        let total = (block_size * block_count).div_ceil(page) * page;
        let arena = Arena::map(total)?;

        let free: Vec<u32> = (0..block_count as u32).rev().collect();

        Ok(BlockPool {
            shared: Arc::new(PoolShared {
                arena,
                block_size,
                block_count,
                free: Mutex::new(free),
            }),
        })
    }

    /// Create a pool with the default block size.
    pub fn with_block_count(block_count: usize) -> io::Result<BlockPool> {
        BlockPool::new(DEFAULT_BLOCK_SIZE, block_count)
    }

    /// Rent one block. Fails with `OutOfMemory` when the pool is empty;
    /// the pool does not resize.
    pub fn rent(&self) -> io::Result<Block> {
        let index = self.shared.free.lock().pop().ok_or_else(|| {
            io::Error::new(io::ErrorKind::OutOfMemory, "block pool exhausted")
        })?;
        Ok(Block {
            inner: Arc::new(BlockInner {
                shared: self.shared.clone(),
                index,
            }),
        })
    }

    /// Size of each block in bytes.
    pub fn block_size(&self) -> usize {
        self.shared.block_size
    }

    /// Total number of blocks in the pool.
    pub fn block_count(&self) -> usize {
        self.shared.block_count
    }

    /// Number of blocks currently available.
    pub fn free_blocks(&self) -> usize {
        self.shared.free.lock().len()
    }
}

#[derive(Debug)]
struct BlockInner {
    shared: Arc<PoolShared>,
    index: u32,
}

impl Drop for BlockInner {
    fn drop(&mut self) {
        self.shared.free.lock().push(self.index);
    }
}

/// A reference-counted handle to one pool block.
///
/// The block's memory is exclusively writable only while the handle is
/// unique; once a block has been shared (cloned), its committed contents
/// must be treated as read-only.
#[derive(Clone, Debug)]
pub struct Block {
    inner: Arc<BlockInner>,
}

impl Block {
    /// Stable pointer to the start of the block.
    pub fn as_ptr(&self) -> *mut u8 {
        self.inner.shared.block_ptr(self.inner.index)
    }

    /// Block capacity in bytes.
    #[allow(clippy::len_without_is_empty)]
    pub fn len(&self) -> usize {
        self.inner.shared.block_size
    }

    /// Copy `data` into the block at `offset`. The handle must still be
    /// unique (the block has not been published to a reader yet).
    pub fn write(&mut self, offset: usize, data: &[u8]) {
        assert!(offset + data.len() <= self.len(), "write outside block");
        debug_assert_eq!(Arc::strong_count(&self.inner), 1);
        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), self.as_ptr().add(offset), data.len());
        }
    }

    /// View a committed byte range of the block.
    pub fn slice(&self, start: usize, end: usize) -> &[u8] {
        assert!(start <= end && end <= self.len(), "slice outside block");
        unsafe { std::slice::from_raw_parts(self.as_ptr().add(start), end - start) }
    }
}

fn page_size() -> usize {
    let ret = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if ret < 1 { 4096 } else { ret as usize }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rent_and_return() {
        let pool = BlockPool::new(4096, 4).unwrap();
        assert_eq!(pool.free_blocks(), 4);

        let a = pool.rent().unwrap();
        let b = pool.rent().unwrap();
        assert_eq!(pool.free_blocks(), 2);

        drop(a);
        assert_eq!(pool.free_blocks(), 3);
        drop(b);
        assert_eq!(pool.free_blocks(), 4);
    }

    #[test]
    fn exhaustion() {
        let pool = BlockPool::new(4096, 2).unwrap();
        let _a = pool.rent().unwrap();
        let _b = pool.rent().unwrap();
        let err = pool.rent().unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::OutOfMemory);
    }

    #[test]
    fn clone_keeps_block_checked_out() {
        let pool = BlockPool::new(4096, 1).unwrap();
        let a = pool.rent().unwrap();
        let b = a.clone();
        drop(a);
        assert_eq!(pool.free_blocks(), 0);
        drop(b);
        assert_eq!(pool.free_blocks(), 1);
    }

    #[test]
    fn write_then_read() {
        let pool = BlockPool::new(4096, 1).unwrap();
        let mut block = pool.rent().unwrap();
        block.write(0, b"hello");
        block.write(5, b" world");
        assert_eq!(block.slice(0, 11), b"hello world");
    }

    #[test]
    fn blocks_are_aligned() {
        let pool = BlockPool::new(4096, 8).unwrap();
        let block = pool.rent().unwrap();
        assert_eq!(block.as_ptr() as usize % 4096, 0);
        assert_eq!(block.len(), 4096);
    }

    #[test]
    fn addresses_are_stable_and_distinct() {
        let pool = BlockPool::new(4096, 4).unwrap();
        let blocks: Vec<Block> = (0..4).map(|_| pool.rent().unwrap()).collect();
        let first = blocks[0].as_ptr();
        let mut ptrs: Vec<usize> = blocks.iter().map(|b| b.as_ptr() as usize).collect();
        ptrs.sort_unstable();
        ptrs.dedup();
        assert_eq!(ptrs.len(), 4);
        assert_eq!(blocks[0].as_ptr(), first);
    }
}
