#![forbid(unsafe_code)]
//! VRAM block pool.
//!
//! All device buffers are allocated once at mount time and cycle between
//! the pool free list and live [`Block`]s; nothing is allocated or freed
//! on the device afterwards. A `Block` couples one buffer with the async
//! write discipline: a dirty flag covering never-written buffers and a
//! "last write" event for sync.

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, trace};
use vramfs_device::{ComputeDevice, WriteEvent};
use vramfs_error::Result;
use vramfs_types::{blocks_spanning, BufferId, BLOCK_SIZE, BLOCK_SIZE_U64};

// ── Pool ────────────────────────────────────────────────────────────────────

struct PoolInner {
    device: Arc<dyn ComputeDevice>,
    free: Mutex<Vec<BufferId>>,
    total: Mutex<usize>,
}

/// Fixed set of device buffers, sized at mount.
#[derive(Clone)]
pub struct BlockPool {
    inner: Arc<PoolInner>,
}

impl BlockPool {
    #[must_use]
    pub fn new(device: Arc<dyn ComputeDevice>) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                device,
                free: Mutex::new(Vec::new()),
                total: Mutex::new(0),
            }),
        }
    }

    /// Allocate and zero-fill enough buffers to cover `bytes`, stopping at
    /// the first allocation failure. Returns the number of bytes actually
    /// added; the caller decides whether a short pool is acceptable.
    pub fn grow(&self, bytes: u64) -> u64 {
        let block_count = blocks_spanning(bytes);
        let mut added: u64 = 0;

        for _ in 0..block_count {
            let Ok(buf) = self.inner.device.allocate(BLOCK_SIZE) else {
                break;
            };
            if self.inner.device.fill_zero(buf).is_err() {
                break;
            }
            self.inner.free.lock().push(buf);
            *self.inner.total.lock() += 1;
            added += 1;
        }

        debug!(
            target: "vramfs::pool",
            requested_blocks = block_count,
            added_blocks = added,
            "pool grown"
        );
        added * BLOCK_SIZE_U64
    }

    /// Total blocks ever created.
    #[must_use]
    pub fn pool_size(&self) -> usize {
        *self.inner.total.lock()
    }

    /// Blocks currently on the free list.
    #[must_use]
    pub fn pool_available(&self) -> usize {
        self.inner.free.lock().len()
    }

    /// Pop a buffer off the free list and wrap it in a fresh block.
    ///
    /// The block starts dirty: its buffer may hold leftover bytes from a
    /// previous use, which the dirty discipline hides. Returns `None`
    /// when the pool is exhausted, a normal condition.
    #[must_use]
    pub fn acquire(&self) -> Option<BlockHandle> {
        let buffer = self.inner.free.lock().pop()?;
        trace!(target: "vramfs::pool", buf = %buffer, "block acquired");
        Some(Arc::new(Block {
            pool: Arc::clone(&self.inner),
            buffer,
            state: Mutex::new(BlockState {
                dirty: true,
                last_write: None,
            }),
        }))
    }

    /// The device this pool draws from.
    #[must_use]
    pub fn device(&self) -> &Arc<dyn ComputeDevice> {
        &self.inner.device
    }
}

// ── Block ───────────────────────────────────────────────────────────────────

struct BlockState {
    /// True until the first write; reads of a dirty block return zeros
    /// without touching the device.
    dirty: bool,
    last_write: Option<WriteEvent>,
}

/// One device buffer plus its outstanding-write summary.
///
/// Shared by every file offset and session that references it; the final
/// drop returns the buffer to the pool free list, not to the device.
pub struct Block {
    pool: Arc<PoolInner>,
    buffer: BufferId,
    state: Mutex<BlockState>,
}

/// Shared reference to a [`Block`].
pub type BlockHandle = Arc<Block>;

impl Block {
    /// Synchronous read of `out.len()` bytes at `offset`.
    ///
    /// A dirty block reads as zeros. Otherwise the in-order device queue
    /// implicitly waits for all outstanding writes to this buffer.
    pub fn read(&self, offset: usize, out: &mut [u8]) -> Result<()> {
        let dirty = self.state.lock().dirty;
        if dirty {
            out.fill(0);
            return Ok(());
        }
        self.pool.device.read_at(self.buffer, offset, out)
    }

    /// Write `data` at `offset`.
    ///
    /// The first write to a block zero-fills the buffer beforehand unless
    /// it covers the whole block, so later reads of untouched regions
    /// return zero. Async writes copy the bytes and record the submission
    /// event; sync writes block until the transfer lands.
    pub fn write(&self, offset: usize, data: &[u8], async_write: bool) -> Result<()> {
        let mut state = self.state.lock();

        if state.dirty && data.len() != BLOCK_SIZE {
            self.pool.device.fill_zero(self.buffer)?;
        }

        let event = if async_write {
            self.pool
                .device
                .write_async(self.buffer, offset, data.to_vec())?
        } else {
            self.pool.device.write_at(self.buffer, offset, data)?;
            WriteEvent::completed()
        };

        state.last_write = Some(event);
        state.dirty = false;
        Ok(())
    }

    /// Wait for the most recent write to this block to complete.
    ///
    /// The in-order queue retires earlier writes first, so this is a
    /// barrier for everything submitted to the block. No-op when the
    /// block was never written.
    pub fn sync(&self) -> Result<()> {
        let event = self.state.lock().last_write.clone();
        match event {
            Some(event) => event.wait(),
            None => Ok(()),
        }
    }
}

impl Drop for Block {
    fn drop(&mut self) {
        trace!(target: "vramfs::pool", buf = %self.buffer, "block released");
        self.pool.free.lock().push(self.buffer);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vramfs_device::HostDevice;

    fn pool_with_blocks(count: usize) -> BlockPool {
        let device: Arc<dyn ComputeDevice> = Arc::new(HostDevice::new());
        let pool = BlockPool::new(device);
        let added = pool.grow(count as u64 * BLOCK_SIZE_U64);
        assert_eq!(added, count as u64 * BLOCK_SIZE_U64);
        pool
    }

    #[test]
    fn grow_rounds_up_to_whole_blocks() {
        let device: Arc<dyn ComputeDevice> = Arc::new(HostDevice::new());
        let pool = BlockPool::new(device);
        let added = pool.grow(BLOCK_SIZE_U64 + 1);
        assert_eq!(added, 2 * BLOCK_SIZE_U64);
        assert_eq!(pool.pool_size(), 2);
        assert_eq!(pool.pool_available(), 2);
    }

    #[test]
    fn grow_stops_at_device_capacity() {
        let device: Arc<dyn ComputeDevice> = Arc::new(HostDevice::with_capacity(3));
        let pool = BlockPool::new(device);
        let added = pool.grow(8 * BLOCK_SIZE_U64);
        assert_eq!(added, 3 * BLOCK_SIZE_U64);
        assert_eq!(pool.pool_size(), 3);
    }

    #[test]
    fn acquire_and_drop_cycle_the_free_list() {
        let pool = pool_with_blocks(2);
        let a = pool.acquire().expect("first");
        let b = pool.acquire().expect("second");
        assert_eq!(pool.pool_available(), 0);
        assert!(pool.acquire().is_none());
        drop(a);
        assert_eq!(pool.pool_available(), 1);
        drop(b);
        assert_eq!(pool.pool_available(), 2);
        assert_eq!(pool.pool_size(), 2);
    }

    #[test]
    fn shared_handles_release_once() {
        let pool = pool_with_blocks(1);
        let block = pool.acquire().expect("acquire");
        let clone = Arc::clone(&block);
        drop(block);
        assert_eq!(pool.pool_available(), 0);
        drop(clone);
        assert_eq!(pool.pool_available(), 1);
    }

    #[test]
    fn dirty_block_reads_as_zeros_without_device_io() {
        let pool = pool_with_blocks(1);
        let block = pool.acquire().expect("acquire");
        let mut out = [0xAA_u8; 64];
        block.read(0, &mut out).expect("read");
        assert_eq!(out, [0_u8; 64]);
    }

    #[test]
    fn partial_first_write_zero_fills_reused_buffer() {
        let device = Arc::new(HostDevice::new());
        let pool = BlockPool::new(Arc::clone(&device) as Arc<dyn ComputeDevice>);
        assert_eq!(pool.grow(BLOCK_SIZE_U64), BLOCK_SIZE_U64);
        let fills_after_init = device.fill_count();

        // Dirty the buffer with a full-block write, then return it.
        let first = pool.acquire().expect("first");
        first
            .write(0, &vec![0xFF_u8; BLOCK_SIZE], false)
            .expect("write");
        drop(first);

        // Reacquire the same buffer; a partial write must zero it first.
        let second = pool.acquire().expect("second");
        second.write(10, b"x", true).expect("write");
        let mut out = vec![0xAA_u8; 32];
        second.read(0, &mut out).expect("read");
        let mut expected = vec![0_u8; 32];
        expected[10] = b'x';
        assert_eq!(out, expected);
        assert!(device.fill_count() > fills_after_init);
    }

    #[test]
    fn full_block_first_write_skips_the_fill() {
        let device = Arc::new(HostDevice::new());
        let pool = BlockPool::new(Arc::clone(&device) as Arc<dyn ComputeDevice>);
        pool.grow(BLOCK_SIZE_U64);
        let fills_after_init = device.fill_count();

        let block = pool.acquire().expect("acquire");
        block
            .write(0, &vec![0x42_u8; BLOCK_SIZE], true)
            .expect("write");
        assert_eq!(device.fill_count(), fills_after_init);

        let mut out = vec![0_u8; 16];
        block.read(BLOCK_SIZE - 16, &mut out).expect("read");
        assert_eq!(out, vec![0x42_u8; 16]);
    }

    #[test]
    fn sync_waits_for_the_last_write() {
        let pool = pool_with_blocks(1);
        let block = pool.acquire().expect("acquire");
        block.sync().expect("sync of unwritten block is a no-op");
        block.write(0, b"abc", true).expect("write");
        block.sync().expect("sync");
        let mut out = [0_u8; 3];
        block.read(0, &mut out).expect("read");
        assert_eq!(&out, b"abc");
    }

    #[test]
    fn read_after_async_write_sees_the_write() {
        let pool = pool_with_blocks(1);
        let block = pool.acquire().expect("acquire");
        block.write(100, b"ordered", true).expect("write");
        let mut out = [0_u8; 7];
        block.read(100, &mut out).expect("read");
        assert_eq!(&out, b"ordered");
    }
}
