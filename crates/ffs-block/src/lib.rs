#![forbid(unsafe_code)]
//! Block I/O layer for node metadata.
//!
//! Provides the `BlockDevice` trait, a file-backed device, and
//! [`WritebackCache`]: a page cache with dirty tracking, in-flight
//! writeback state and memory-pressure reporting. The node manager only
//! talks to the [`PageCache`] trait, so tests can swap in their own
//! implementation.

use ffs_error::{FfsError, Result};
use ffs_types::{BLOCK_SIZE, BlockAddr};
use parking_lot::{Condvar, Mutex};
use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::Path;
use tracing::{debug, trace, warn};

/// Owned block buffer.
///
/// Invariant: length == device block size for the originating device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockBuf {
    bytes: Vec<u8>,
}

impl BlockBuf {
    #[must_use]
    pub fn new(bytes: Vec<u8>) -> Self {
        Self { bytes }
    }

    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        &self.bytes
    }

    #[must_use]
    pub fn into_inner(self) -> Vec<u8> {
        self.bytes
    }
}

/// Block-addressed I/O interface.
pub trait BlockDevice: Send + Sync {
    /// Read a block by address.
    fn read_block(&self, block: BlockAddr) -> Result<BlockBuf>;

    /// Write a block by address. `data.len()` MUST equal `block_size()`.
    fn write_block(&self, block: BlockAddr, data: &[u8]) -> Result<()>;

    /// Device block size in bytes.
    fn block_size(&self) -> u32;

    /// Total number of blocks.
    fn block_count(&self) -> u64;

    /// Flush pending writes to stable storage.
    fn sync(&self) -> Result<()>;
}

/// Filesystem image stored in a regular file, addressed in `BLOCK_SIZE` units.
///
/// Opened read-write when permitted; otherwise every write fails with
/// [`FfsError::ReadOnly`].
#[derive(Debug)]
pub struct FileBlockDevice {
    file: File,
    block_count: u64,
    read_only: bool,
}

impl FileBlockDevice {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let (file, read_only) = match OpenOptions::new().read(true).write(true).open(path) {
            Ok(file) => (file, false),
            Err(_) => (File::open(path)?, true),
        };
        let len = file.metadata()?.len();
        if len % BLOCK_SIZE as u64 != 0 {
            return Err(FfsError::Format(format!(
                "image length {len} is not a multiple of {BLOCK_SIZE}"
            )));
        }
        debug!(
            target: "ffs::block",
            event = "image_opened",
            path = %path.display(),
            blocks = len / BLOCK_SIZE as u64,
            read_only
        );
        Ok(Self {
            file,
            block_count: len / BLOCK_SIZE as u64,
            read_only,
        })
    }

    #[must_use]
    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    fn offset_of(&self, block: BlockAddr) -> Result<u64> {
        if u64::from(block.0) >= self.block_count {
            return Err(FfsError::Format(format!(
                "block {block} beyond image end ({} blocks)",
                self.block_count
            )));
        }
        Ok(block.byte_offset())
    }
}

impl BlockDevice for FileBlockDevice {
    fn read_block(&self, block: BlockAddr) -> Result<BlockBuf> {
        let offset = self.offset_of(block)?;
        let mut buf = vec![0_u8; BLOCK_SIZE];
        self.file.read_exact_at(&mut buf, offset)?;
        Ok(BlockBuf::new(buf))
    }

    fn write_block(&self, block: BlockAddr, data: &[u8]) -> Result<()> {
        if self.read_only {
            return Err(FfsError::ReadOnly);
        }
        if data.len() != BLOCK_SIZE {
            return Err(FfsError::Format(format!(
                "block {block}: write of {} bytes, expected {BLOCK_SIZE}",
                data.len()
            )));
        }
        let offset = self.offset_of(block)?;
        self.file.write_all_at(data, offset)?;
        Ok(())
    }

    fn block_size(&self) -> u32 {
        BLOCK_SIZE as u32
    }

    fn block_count(&self) -> u64 {
        self.block_count
    }

    fn sync(&self) -> Result<()> {
        self.file.sync_all()?;
        Ok(())
    }
}

/// Sparse in-memory block device; unwritten blocks read back as zeroes.
#[derive(Debug)]
pub struct MemBlockDevice {
    block_count: u64,
    blocks: Mutex<HashMap<BlockAddr, Vec<u8>>>,
}

impl MemBlockDevice {
    #[must_use]
    pub fn new(block_count: u64) -> Self {
        Self {
            block_count,
            blocks: Mutex::new(HashMap::new()),
        }
    }

    /// Number of blocks that have been written at least once.
    #[must_use]
    pub fn written_blocks(&self) -> usize {
        self.blocks.lock().len()
    }
}

impl BlockDevice for MemBlockDevice {
    fn read_block(&self, block: BlockAddr) -> Result<BlockBuf> {
        if u64::from(block.0) >= self.block_count {
            return Err(FfsError::Format(format!("block out of range: {block}")));
        }
        let blocks = self.blocks.lock();
        Ok(BlockBuf::new(
            blocks
                .get(&block)
                .cloned()
                .unwrap_or_else(|| vec![0_u8; BLOCK_SIZE]),
        ))
    }

    fn write_block(&self, block: BlockAddr, data: &[u8]) -> Result<()> {
        if u64::from(block.0) >= self.block_count || data.len() != BLOCK_SIZE {
            return Err(FfsError::Format(format!(
                "bad write: block={block} len={}",
                data.len()
            )));
        }
        self.blocks.lock().insert(block, data.to_vec());
        Ok(())
    }

    fn block_size(&self) -> u32 {
        BLOCK_SIZE as u32
    }

    fn block_count(&self) -> u64 {
        self.block_count
    }

    fn sync(&self) -> Result<()> {
        Ok(())
    }
}

// ── Page cache collaborator ─────────────────────────────────────────────────

/// Page-cache operations the node manager needs from the block layer.
///
/// All methods are fallible with the block layer's error kinds; retries
/// belong to the implementation, never to callers.
pub trait PageCache: Send + Sync {
    /// Read a block, from cache when resident.
    fn read_block(&self, addr: BlockAddr) -> Result<BlockBuf>;

    /// Write a block durably before returning.
    fn write_block(&self, addr: BlockAddr, data: &[u8]) -> Result<()>;

    /// Stage new contents for `addr`; written later by writeback.
    fn mark_dirty(&self, addr: BlockAddr, data: &[u8]) -> Result<()>;

    /// Block until no writeback of `addr` is in flight.
    fn wait_for_writeback(&self, addr: BlockAddr) -> Result<()>;

    /// Total number of addressable blocks.
    fn block_count(&self) -> u64;

    /// Whether metadata caches above this layer should shed clean entries.
    fn under_memory_pressure(&self) -> bool;
}

#[derive(Debug, Default)]
struct CacheState {
    pages: HashMap<BlockAddr, Vec<u8>>,
    /// Residency order for clean-page eviction (oldest first).
    order: VecDeque<BlockAddr>,
    dirty: BTreeSet<BlockAddr>,
    in_flight: HashSet<BlockAddr>,
}

impl CacheState {
    fn insert_page(&mut self, addr: BlockAddr, data: Vec<u8>) {
        if self.pages.insert(addr, data).is_none() {
            self.order.push_back(addr);
        }
    }

    fn evict_clean(&mut self, capacity: usize) {
        let mut scanned = 0;
        while self.pages.len() > capacity && scanned < self.order.len() {
            let Some(addr) = self.order.pop_front() else {
                break;
            };
            if self.dirty.contains(&addr) || self.in_flight.contains(&addr) {
                self.order.push_back(addr);
                scanned += 1;
                continue;
            }
            let _ = self.pages.remove(&addr);
        }
    }
}

/// Write-back page cache over a [`BlockDevice`].
///
/// - reads are cached up to `capacity_pages` clean pages
/// - `write_block` is write-through and durable on return
/// - `mark_dirty` buffers; [`WritebackCache::writeback`] flushes in
///   ascending address order, tracking each page as in flight so
///   `wait_for_writeback` can block writers on it
#[derive(Debug)]
pub struct WritebackCache<D: BlockDevice> {
    inner: D,
    capacity_pages: usize,
    state: Mutex<CacheState>,
    writeback_done: Condvar,
}

impl<D: BlockDevice> WritebackCache<D> {
    pub fn new(inner: D, capacity_pages: usize) -> Result<Self> {
        if capacity_pages == 0 {
            return Err(FfsError::Format(
                "WritebackCache capacity_pages must be > 0".to_owned(),
            ));
        }
        Ok(Self {
            inner,
            capacity_pages,
            state: Mutex::new(CacheState::default()),
            writeback_done: Condvar::new(),
        })
    }

    #[must_use]
    pub fn inner(&self) -> &D {
        &self.inner
    }

    #[must_use]
    pub fn dirty_count(&self) -> usize {
        self.state.lock().dirty.len()
    }

    #[must_use]
    pub fn resident_count(&self) -> usize {
        self.state.lock().pages.len()
    }

    #[must_use]
    pub fn is_under_writeback(&self, addr: BlockAddr) -> bool {
        self.state.lock().in_flight.contains(&addr)
    }

    /// Write every dirty page to the device. Returns the number written.
    ///
    /// On a device error the failed page and every page not yet attempted
    /// stay dirty, and the first error is returned.
    pub fn writeback(&self) -> Result<usize> {
        let batch: Vec<(BlockAddr, Vec<u8>)> = {
            let mut guard = self.state.lock();
            let dirty = std::mem::take(&mut guard.dirty);
            let mut batch = Vec::with_capacity(dirty.len());
            for addr in dirty {
                if let Some(data) = guard.pages.get(&addr).cloned() {
                    guard.in_flight.insert(addr);
                    batch.push((addr, data));
                }
            }
            batch
        };

        let mut written = 0_usize;
        let mut first_err = None;
        for (addr, data) in batch {
            let outcome = if first_err.is_none() {
                self.inner.write_block(addr, &data)
            } else {
                Ok(())
            };
            let mut guard = self.state.lock();
            guard.in_flight.remove(&addr);
            match outcome {
                Ok(()) if first_err.is_none() => written += 1,
                Ok(()) => {
                    guard.dirty.insert(addr);
                }
                Err(err) => {
                    warn!(target: "ffs::block", event = "writeback_failed", block = addr.0, error = %err);
                    guard.dirty.insert(addr);
                    first_err = Some(err);
                }
            }
            drop(guard);
            self.writeback_done.notify_all();
        }

        debug!(target: "ffs::block", event = "writeback", written);
        match first_err {
            Some(err) => Err(err),
            None => Ok(written),
        }
    }
}

impl<D: BlockDevice> PageCache for WritebackCache<D> {
    fn read_block(&self, addr: BlockAddr) -> Result<BlockBuf> {
        if let Some(bytes) = self.state.lock().pages.get(&addr).cloned() {
            return Ok(BlockBuf::new(bytes));
        }

        let buf = self.inner.read_block(addr)?;
        let mut guard = self.state.lock();
        // A concurrent mark_dirty may have raced us; never clobber it.
        if !guard.pages.contains_key(&addr) {
            guard.insert_page(addr, buf.as_slice().to_vec());
            guard.evict_clean(self.capacity_pages);
        }
        drop(guard);
        Ok(buf)
    }

    fn write_block(&self, addr: BlockAddr, data: &[u8]) -> Result<()> {
        self.wait_for_writeback(addr)?;
        self.inner.write_block(addr, data)?;
        let mut guard = self.state.lock();
        guard.dirty.remove(&addr);
        guard.insert_page(addr, data.to_vec());
        guard.evict_clean(self.capacity_pages);
        drop(guard);
        trace!(target: "ffs::block", event = "write_through", block = addr.0);
        Ok(())
    }

    fn mark_dirty(&self, addr: BlockAddr, data: &[u8]) -> Result<()> {
        if data.len() != BLOCK_SIZE {
            return Err(FfsError::Format(format!(
                "mark_dirty data size mismatch: got={} expected={BLOCK_SIZE}",
                data.len()
            )));
        }
        if u64::from(addr.0) >= self.inner.block_count() {
            return Err(FfsError::Format(format!("mark_dirty block out of range: {addr}")));
        }
        let mut guard = self.state.lock();
        while guard.in_flight.contains(&addr) {
            self.writeback_done.wait(&mut guard);
        }
        guard.insert_page(addr, data.to_vec());
        guard.dirty.insert(addr);
        drop(guard);
        trace!(target: "ffs::block", event = "mark_dirty", block = addr.0);
        Ok(())
    }

    fn wait_for_writeback(&self, addr: BlockAddr) -> Result<()> {
        let mut guard = self.state.lock();
        while guard.in_flight.contains(&addr) {
            self.writeback_done.wait(&mut guard);
        }
        Ok(())
    }

    fn block_count(&self) -> u64 {
        self.inner.block_count()
    }

    fn under_memory_pressure(&self) -> bool {
        self.state.lock().pages.len() >= self.capacity_pages
    }
}
