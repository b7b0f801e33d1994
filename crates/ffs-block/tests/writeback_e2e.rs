#![forbid(unsafe_code)]

use ffs_block::{
    BlockBuf, BlockDevice, FileBlockDevice, MemBlockDevice, PageCache,
    WritebackCache,
};
use ffs_error::Result;
use ffs_types::{BLOCK_SIZE, BlockAddr};
use parking_lot::Mutex;
use std::sync::Arc;
use std::thread;

const BLOCKS: u64 = 64;

fn block_payload(block: u32, salt: u8) -> Vec<u8> {
    let mut out = vec![0_u8; BLOCK_SIZE];
    for (i, byte) in out.iter_mut().enumerate() {
        *byte = (block as u8).wrapping_mul(31) ^ salt ^ (i as u8);
    }
    out
}

/// Records the order in which blocks reach the device.
#[derive(Debug)]
struct CountingBlockDevice {
    inner: MemBlockDevice,
    writes: Mutex<Vec<BlockAddr>>,
}

impl CountingBlockDevice {
    fn new(blocks: u64) -> Self {
        Self {
            inner: MemBlockDevice::new(blocks),
            writes: Mutex::new(Vec::new()),
        }
    }
}

impl BlockDevice for CountingBlockDevice {
    fn read_block(&self, block: BlockAddr) -> Result<BlockBuf> {
        self.inner.read_block(block)
    }

    fn write_block(&self, block: BlockAddr, data: &[u8]) -> Result<()> {
        self.writes.lock().push(block);
        self.inner.write_block(block, data)
    }

    fn block_size(&self) -> u32 {
        self.inner.block_size()
    }

    fn block_count(&self) -> u64 {
        self.inner.block_count()
    }

    fn sync(&self) -> Result<()> {
        self.inner.sync()
    }
}

#[test]
fn writeback_is_ascending_and_coalesces_rewrites() {
    let cache = WritebackCache::new(CountingBlockDevice::new(BLOCKS), 32).expect("cache");
    for block in [9_u32, 3, 17, 3, 9] {
        cache
            .mark_dirty(BlockAddr(block), &block_payload(block, 1))
            .expect("dirty");
    }
    assert_eq!(cache.dirty_count(), 3);
    assert_eq!(cache.writeback().expect("writeback"), 3);
    assert_eq!(
        *cache.inner().writes.lock(),
        vec![BlockAddr(3), BlockAddr(9), BlockAddr(17)]
    );
    assert_eq!(cache.writeback().expect("idle"), 0);
}

#[test]
fn write_through_replaces_staged_page() {
    let cache = WritebackCache::new(CountingBlockDevice::new(BLOCKS), 8).expect("cache");
    cache
        .mark_dirty(BlockAddr(5), &block_payload(5, 1))
        .expect("dirty");
    cache
        .write_block(BlockAddr(5), &block_payload(5, 2))
        .expect("write");
    assert_eq!(cache.dirty_count(), 0);
    assert_eq!(cache.writeback().expect("writeback"), 0);
    assert_eq!(
        cache.inner().read_block(BlockAddr(5)).expect("dev").as_slice(),
        block_payload(5, 2).as_slice()
    );
}

#[test]
fn mark_dirty_rejects_bad_input() {
    let cache = WritebackCache::new(MemBlockDevice::new(BLOCKS), 8).expect("cache");
    assert!(cache.mark_dirty(BlockAddr(1), &[0_u8; 16]).is_err());
    assert!(
        cache
            .mark_dirty(BlockAddr(BLOCKS as u32), &[0_u8; BLOCK_SIZE])
            .is_err()
    );
    assert!(WritebackCache::new(MemBlockDevice::new(BLOCKS), 0).is_err());
}

#[test]
fn concurrent_writers_and_flusher_converge_on_file() {
    let file = tempfile::NamedTempFile::new().expect("tempfile");
    file.as_file()
        .set_len(BLOCKS * BLOCK_SIZE as u64)
        .expect("set_len");
    let dev = FileBlockDevice::open(file.path()).expect("open");
    let cache = Arc::new(WritebackCache::new(dev, 16).expect("cache"));

    thread::scope(|scope| {
        for writer in 0..4_u32 {
            let cache = Arc::clone(&cache);
            scope.spawn(move || {
                for round in 0..8_u8 {
                    for block in (writer * 16)..(writer * 16 + 16) {
                        cache
                            .mark_dirty(BlockAddr(block), &block_payload(block, round))
                            .expect("dirty");
                    }
                }
            });
        }
        let cache = Arc::clone(&cache);
        scope.spawn(move || {
            for _ in 0..16 {
                cache.writeback().expect("background writeback");
                thread::yield_now();
            }
        });
    });

    cache.writeback().expect("final writeback");
    assert_eq!(cache.dirty_count(), 0);
    cache.inner().sync().expect("sync");

    let reopened = FileBlockDevice::open(file.path()).expect("reopen");
    for block in 0..BLOCKS as u32 {
        assert_eq!(
            reopened.read_block(BlockAddr(block)).expect("read").as_slice(),
            block_payload(block, 7).as_slice(),
            "block {block}"
        );
    }
}
