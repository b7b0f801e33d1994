#![forbid(unsafe_code)]
//! Node manager end-to-end: file-backed remount and flush failure recovery.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use ffs_block::{
    BlockBuf, BlockDevice, FileBlockDevice, MemBlockDevice, PageCache,
    WritebackCache,
};
use ffs_error::{FfsError, Result};
use ffs_node::{NatCheckpoint, NatGeometry, NatJournal, NodeManager, NodeManagerOptions};
use ffs_types::{BLOCK_SIZE, BlockAddr, CheckpointVersion, NAT_ENTRY_PER_BLOCK, Nid};

const IMAGE_BLOCKS: u64 = 512;

fn geometry() -> NatGeometry {
    NatGeometry {
        nat_blkaddr: BlockAddr(32),
        log_blocks_per_seg: 3,
        nat_segments: 2,
    }
}

fn scratch_image() -> tempfile::NamedTempFile {
    let file = tempfile::NamedTempFile::new().expect("tempfile");
    file.as_file()
        .set_len(IMAGE_BLOCKS * BLOCK_SIZE as u64)
        .expect("set_len");
    file
}

fn open(path: &std::path::Path) -> WritebackCache<FileBlockDevice> {
    let dev = FileBlockDevice::open(path).expect("open");
    WritebackCache::new(dev, 64).expect("cache")
}

/// Create an inode node and `children` direct nodes under it, each written
/// to its own block starting at `first_block`.
fn create_file<C: PageCache>(nm: &NodeManager<C>, first_block: u32, children: u32) -> (Nid, Vec<Nid>) {
    let ino = nm.allocate_nid().expect("ino");
    let mut inode = nm.new_node_page(ino, ino, 0, false).expect("inode page");
    let mut kids = Vec::new();
    for i in 0..children {
        let nid = nm.allocate_nid().expect("child");
        let mut page = nm.new_node_page(nid, ino, 1 + i, false).expect("child page");
        let addr = BlockAddr(first_block + 1 + i);
        nm.write_node_page(&mut page, addr, BlockAddr(addr.0 + 1))
            .expect("write child");
        nm.commit_nid(nid);
        kids.push(nid);
    }
    for (slot, nid) in kids.iter().enumerate() {
        inode
            .set_nid(
                nm.page_cache(),
                ffs_types::NODE_DIR1_BLOCK + slot as u32,
                *nid,
                true,
            )
            .expect("link child");
    }
    nm.write_node_page(&mut inode, BlockAddr(first_block), BlockAddr(first_block + 1))
        .expect("write inode");
    nm.commit_nid(ino);
    (ino, kids)
}

#[test]
fn file_backed_remount_sees_journaled_and_block_flushed_nodes() {
    let image_file = scratch_image();
    let path = image_file.path().to_path_buf();

    let fresh = NatCheckpoint::fresh(&geometry()).expect("fresh");
    let nm = NodeManager::mount(open(&path), geometry(), &fresh, NodeManagerOptions::default())
        .expect("mount");
    let (ino, kids) = create_file(&nm, 100, 3);
    nm.set_checkpoint_version(CheckpointVersion(2));
    nm.page_cache().writeback().expect("node writeback");
    let image = nm.unmount().expect("unmount");
    assert_eq!(image.version, CheckpointVersion(2));

    // The checkpoint image travels as JSON through the checkpoint manager.
    let json = serde_json::to_string(&image).expect("serialize");
    let image: NatCheckpoint = serde_json::from_str(&json).expect("deserialize");

    let nm = NodeManager::mount(
        open(&path),
        geometry(),
        &image,
        NodeManagerOptions {
            use_nat_journal: false,
            ..NodeManagerOptions::default()
        },
    )
    .expect("remount");
    assert!(nm.journal_len() > 0);
    let inode = nm.read_node_page(ino).expect("inode");
    assert_eq!(inode.addr(), BlockAddr(100));
    for (slot, kid) in kids.iter().enumerate() {
        let linked = inode
            .get_nid(ffs_types::NODE_DIR1_BLOCK + slot as u32, true)
            .expect("slot");
        assert_eq!(linked, *kid);
        let page = nm.read_node_page(*kid).expect("child");
        assert_eq!(page.ino_of_node().expect("ino"), ino);
    }
    // Allocation continues past the nids already in use.
    let next = nm.allocate_nid().expect("alloc");
    assert!(next != ino && !kids.contains(&next));
    nm.abort_nid(next);

    // Move one child; without the journal this merges it into NAT blocks.
    nm.relocate(kids[0], BlockAddr(300), ino).expect("relocate");
    let stats = nm.flush_nat_entries().expect("flush");
    assert_eq!(stats.journaled, 0);
    assert_eq!(stats.nat_blocks_written, 1);
    assert_eq!(nm.journal_len(), 0);
    let image = nm.unmount().expect("unmount");
    assert_eq!(image.nat_bitmap[0] & 0x80, 0x80);

    let nm = NodeManager::mount(open(&path), geometry(), &image, NodeManagerOptions::default())
        .expect("third mount");
    let moved = nm.lookup_node_info(kids[0]).expect("lookup");
    assert_eq!(moved.blk_addr, BlockAddr(300));
    assert_eq!(moved.version, 1);
    assert_eq!(nm.lookup_node_info(ino).expect("lookup").blk_addr, BlockAddr(100));
}

// ── Failure injection ───────────────────────────────────────────────────────

/// In-memory image shared across mounts that accepts a limited number of
/// further writes.
#[derive(Clone)]
struct BudgetedDevice {
    inner: Arc<MemBlockDevice>,
    writes_left: Arc<AtomicUsize>,
}

impl BudgetedDevice {
    fn new() -> Self {
        Self {
            inner: Arc::new(MemBlockDevice::new(IMAGE_BLOCKS)),
            writes_left: Arc::new(AtomicUsize::new(usize::MAX)),
        }
    }

    fn allow_writes(&self, count: usize) {
        self.writes_left.store(count, Ordering::SeqCst);
    }
}

impl BlockDevice for BudgetedDevice {
    fn read_block(&self, block: BlockAddr) -> Result<BlockBuf> {
        self.inner.read_block(block)
    }

    fn write_block(&self, block: BlockAddr, data: &[u8]) -> Result<()> {
        if self
            .writes_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_err()
        {
            return Err(FfsError::Io(std::io::Error::other("injected write failure")));
        }
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

fn mount_on(
    dev: &BudgetedDevice,
    image: &NatCheckpoint,
    options: NodeManagerOptions,
) -> NodeManager<WritebackCache<BudgetedDevice>> {
    NodeManager::mount(
        WritebackCache::new(dev.clone(), 64).expect("cache"),
        geometry(),
        image,
        options,
    )
    .expect("mount")
}

#[test]
fn failed_block_flush_keeps_entries_dirty_and_bitmap_unflipped() {
    let dev = BudgetedDevice::new();
    let fresh = NatCheckpoint::fresh(&geometry()).expect("fresh");
    let nm = mount_on(
        &dev,
        &fresh,
        NodeManagerOptions {
            use_nat_journal: false,
            ..NodeManagerOptions::default()
        },
    );

    let a = Nid(5);
    let b = Nid(NAT_ENTRY_PER_BLOCK + 5);
    nm.relocate(a, BlockAddr(200), a).expect("relocate");
    nm.relocate(b, BlockAddr(201), b).expect("relocate");

    dev.allow_writes(0);
    let err = nm.flush_nat_entries().expect_err("injected");
    assert!(matches!(err, FfsError::Io(_)));
    assert!(!err.is_corruption());
    assert_eq!(nm.dirty_count(), 2);
    assert_eq!(nm.checkpoint_image().expect("image").nat_bitmap[0], 0);
    assert!(nm.lookup_node_info(a).expect("lookup").is_dirty());

    dev.allow_writes(usize::MAX);
    let stats = nm.flush_nat_entries().expect("retry");
    assert_eq!(stats.nat_blocks_written, 2);
    assert_eq!(nm.dirty_count(), 0);
    assert_eq!(nm.checkpoint_image().expect("image").nat_bitmap[0], 0b1100_0000);
}

#[test]
fn partial_block_flush_keeps_journal_from_shadowing_written_blocks() {
    let dev = BudgetedDevice::new();
    let fresh = NatCheckpoint::fresh(&geometry()).expect("fresh");
    let nm = mount_on(&dev, &fresh, NodeManagerOptions::default());

    // Both land in the journal: one nid per NAT block.
    let early = Nid(5);
    let late = Nid(NAT_ENTRY_PER_BLOCK + 100);
    nm.relocate(early, BlockAddr(200), early).expect("relocate");
    nm.relocate(late, BlockAddr(201), late).expect("relocate");
    assert_eq!(nm.flush_nat_entries().expect("journal flush").journaled, 2);
    assert_eq!(nm.journal_len(), 2);

    // Too many updates for the journal: it is merged into NAT blocks 0 and 1,
    // and only the write of block 0 succeeds.
    nm.relocate(early, BlockAddr(300), early).expect("move");
    for i in 0..40 {
        let nid = Nid(NAT_ENTRY_PER_BLOCK + i);
        nm.relocate(nid, BlockAddr(400 + i), nid).expect("relocate");
    }
    dev.allow_writes(1);
    let err = nm.flush_nat_entries().expect_err("second NAT block write fails");
    assert!(matches!(err, FfsError::Io(_)));
    assert_eq!(nm.dirty_count(), 41);

    let image = nm.checkpoint_image().expect("image");
    assert_eq!(image.nat_bitmap[0], 0b1000_0000);
    let journal = NatJournal::from_bytes(&image.nat_journal).expect("journal");
    assert_eq!(journal.lookup(early), None);
    assert_eq!(
        journal.lookup(late).map(|raw| raw.block_addr),
        Some(BlockAddr(201))
    );

    // A cold cache over the same image resolves through the flipped block.
    let cold = mount_on(&dev, &image, NodeManagerOptions::default());
    let moved = cold.lookup_node_info(early).expect("lookup");
    assert_eq!(moved.blk_addr, BlockAddr(300));
    assert_eq!(moved.version, 1);
    assert_eq!(cold.lookup_node_info(late).expect("lookup").blk_addr, BlockAddr(201));

    dev.allow_writes(usize::MAX);
    let stats = nm.flush_nat_entries().expect("retry");
    assert_eq!(stats.nat_blocks_written, 1);
    assert_eq!(nm.journal_len(), 0);
    assert_eq!(nm.dirty_count(), 0);
    assert_eq!(nm.lookup_node_info(early).expect("lookup").blk_addr, BlockAddr(300));
    assert_eq!(nm.lookup_node_info(late).expect("lookup").blk_addr, BlockAddr(201));
}
