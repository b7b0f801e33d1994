#![forbid(unsafe_code)]
//! Node address table management.
//!
//! Maps node ids to the physical blocks holding them, caches that mapping
//! with write-back dirty tracking, hands out unused node ids, and persists
//! changes at checkpoint time through a double-buffered NAT area.
//!
//! ## Design
//!
//! One [`NodeManager`] exists per mount and owns:
//!
//! 1. **NatCache**: `NodeInfo` records keyed by nid, with dirty sets.
//! 2. **FreeNidPool**: New / Allocated nids refilled by NAT scans.
//! 3. **NatBitmap**: which copy of each NAT block is current.
//! 4. **NatJournal**: small NAT updates kept in the checkpoint.
//!
//! ## Locking
//!
//! The cache (with its dirty sets) and the free-nid pool each sit behind
//! their own mutex. Bitmap and journal share a reader/writer lock that a
//! flush holds for writing. Flushes are serialized by a dedicated mutex.
//! Allowed nesting: pool → cache, pool → meta, meta → cache. The cache lock
//! is never held while taking another lock.

pub mod bitmap;
pub mod cache;
pub mod dirty;
pub mod free_nid;
pub mod info;
pub mod journal;
pub mod options;
pub mod page;

use std::fmt::Display;
use std::sync::atomic::{AtomicU64, Ordering};

use ffs_block::PageCache;
use ffs_error::{FfsError, Result};
use ffs_ondisk::NatBlock;
use ffs_types::{BlockAddr, CheckpointVersion, NatBlockIndex, Nid};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, trace};

pub use bitmap::NatBitmap;
pub use cache::{FlushSet, NatCache};
pub use dirty::{DirtySets, NatEntrySet};
pub use free_nid::{FreeNidPool, NatScanSource, NidState};
pub use info::{NatFlags, NodeInfo};
pub use journal::NatJournal;
pub use options::{NatGeometry, NodeManagerOptions};
pub use page::NodePage;

/// Wrap a decode failure at a known block as corruption.
pub(crate) fn corrupt(block: BlockAddr, err: impl Display) -> FfsError {
    FfsError::Corruption {
        block: u64::from(block.0),
        detail: err.to_string(),
    }
}

// ── Checkpoint image ────────────────────────────────────────────────────────

/// NAT state persisted in a checkpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NatCheckpoint {
    pub version: CheckpointVersion,
    /// Double-buffer bitmap, `bitmap_size` bytes.
    pub nat_bitmap: Vec<u8>,
    /// Encoded NAT journal region; empty means no journal.
    pub nat_journal: Vec<u8>,
    /// Where the next free-nid scan starts.
    pub next_scan_nid: Nid,
}

impl NatCheckpoint {
    /// Image of a freshly formatted NAT: every block on its primary copy.
    pub fn fresh(geometry: &NatGeometry) -> Result<Self> {
        geometry.validate()?;
        Ok(Self {
            version: CheckpointVersion(1),
            nat_bitmap: vec![0; geometry.bitmap_size()],
            nat_journal: NatJournal::new().to_bytes()?,
            next_scan_nid: Nid(0),
        })
    }
}

/// Outcome of one NAT flush.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlushStats {
    pub sets: usize,
    pub entries: usize,
    pub nat_blocks_written: usize,
    /// Entries recorded in the NAT journal instead of NAT blocks.
    pub journaled: usize,
    /// Nids freed by this checkpoint and returned to the pool.
    pub freed_nids: usize,
}

#[derive(Debug)]
struct NatMeta {
    bitmap: NatBitmap,
    journal: NatJournal,
}

// ── Node manager ────────────────────────────────────────────────────────────

/// Per-mount node metadata context.
pub struct NodeManager<C: PageCache> {
    pages: C,
    options: NodeManagerOptions,
    geometry: NatGeometry,
    max_nid: u32,
    nat: Mutex<NatCache>,
    free_nids: Mutex<FreeNidPool>,
    meta: RwLock<NatMeta>,
    flush_lock: Mutex<()>,
    cp_ver: AtomicU64,
}

impl<C: PageCache> std::fmt::Debug for NodeManager<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeManager")
            .field("geometry", &self.geometry)
            .field("options", &self.options)
            .field("max_nid", &self.max_nid)
            .finish_non_exhaustive()
    }
}

impl<C: PageCache> NodeManager<C> {
    /// Bring up the node manager from a checkpoint image and fill the free
    /// nid pool.
    pub fn mount(
        pages: C,
        geometry: NatGeometry,
        image: &NatCheckpoint,
        options: NodeManagerOptions,
    ) -> Result<Self> {
        options.validate()?;
        geometry.validate()?;
        if geometry.end_blkaddr() > pages.block_count() {
            return Err(FfsError::InvalidGeometry(format!(
                "NAT area ends at block {} but device has {} blocks",
                geometry.end_blkaddr(),
                pages.block_count()
            )));
        }
        let bitmap = NatBitmap::new(geometry, image.nat_bitmap.clone())?;
        let max_nid = geometry.max_nid();
        let journal = if image.nat_journal.is_empty() {
            NatJournal::new()
        } else {
            NatJournal::from_bytes(&image.nat_journal)?
        };
        journal.check_nid_range(max_nid)?;
        let pool = FreeNidPool::new(max_nid, &options).with_cursor(image.next_scan_nid);

        let manager = Self {
            pages,
            options,
            geometry,
            max_nid,
            nat: Mutex::new(NatCache::new()),
            free_nids: Mutex::new(pool),
            meta: RwLock::new(NatMeta { bitmap, journal }),
            flush_lock: Mutex::new(()),
            cp_ver: AtomicU64::new(image.version.0),
        };
        let found = manager.build_free_nids()?;
        debug!(
            target: "ffs::nat",
            event = "mount",
            max_nid,
            nat_blocks = geometry.nat_blocks(),
            journal_entries = manager.meta.read().journal.len(),
            free_nids = found
        );
        Ok(manager)
    }

    #[must_use]
    pub fn options(&self) -> &NodeManagerOptions {
        &self.options
    }

    #[must_use]
    pub fn geometry(&self) -> &NatGeometry {
        &self.geometry
    }

    #[must_use]
    pub fn max_nid(&self) -> u32 {
        self.max_nid
    }

    #[must_use]
    pub fn page_cache(&self) -> &C {
        &self.pages
    }

    #[must_use]
    pub fn checkpoint_version(&self) -> CheckpointVersion {
        CheckpointVersion(self.cp_ver.load(Ordering::Acquire))
    }

    /// Set by the checkpoint manager; stamped into node footers.
    pub fn set_checkpoint_version(&self, version: CheckpointVersion) {
        self.cp_ver.store(version.0, Ordering::Release);
    }

    #[must_use]
    pub fn cached_count(&self) -> usize {
        self.nat.lock().len()
    }

    #[must_use]
    pub fn dirty_count(&self) -> usize {
        self.nat.lock().dirty_count()
    }

    #[must_use]
    pub fn free_nid_count(&self) -> usize {
        self.free_nids.lock().new_count()
    }

    #[must_use]
    pub fn journal_len(&self) -> usize {
        self.meta.read().journal.len()
    }

    fn check_nid(&self, nid: Nid) -> Result<()> {
        if nid.0 >= self.max_nid {
            return Err(FfsError::InvalidNid {
                nid: nid.0,
                max_nid: self.max_nid,
            });
        }
        Ok(())
    }

    fn check_target(&self, addr: BlockAddr) -> Result<()> {
        if addr.is_valid() && u64::from(addr.0) >= self.pages.block_count() {
            return Err(FfsError::Format(format!(
                "block {addr} is beyond the device ({} blocks)",
                self.pages.block_count()
            )));
        }
        Ok(())
    }

    // ── Lookup ──────────────────────────────────────────────────────────────

    fn read_nat_block_at(&self, addr: BlockAddr) -> Result<NatBlock> {
        let buf = self.pages.read_block(addr)?;
        NatBlock::parse_from_bytes(buf.into_inner()).map_err(|err| corrupt(addr, err))
    }

    /// Current mapping of `nid`: cache, then NAT journal, then the current
    /// NAT block. Misses are cached.
    pub fn lookup_node_info(&self, nid: Nid) -> Result<NodeInfo> {
        self.check_nid(nid)?;
        if let Some(info) = self.nat.lock().lookup(nid) {
            return Ok(info);
        }

        let (raw, source) = {
            let meta = self.meta.read();
            if let Some(raw) = meta.journal.lookup(nid) {
                (raw, meta.bitmap.resolve(nid)?)
            } else {
                let addr = meta.bitmap.resolve(nid)?;
                let block = self.read_nat_block_at(addr)?;
                let raw = block
                    .entry(nid.slot_in_block())
                    .map_err(|err| corrupt(addr, err))?;
                (raw, addr)
            }
        };
        if raw.block_addr.is_valid() && u64::from(raw.block_addr.0) >= self.pages.block_count() {
            error!(
                target: "ffs::nat",
                event = "nat_entry_out_of_range",
                nid = nid.0,
                blk_addr = raw.block_addr.0,
                nat_block = source.0
            );
            return Err(FfsError::Corruption {
                block: u64::from(source.0),
                detail: format!("nid {nid} maps to block {} beyond the device", raw.block_addr),
            });
        }

        let mut cache = self.nat.lock();
        cache.insert(NodeInfo::from_raw(nid, &raw));
        let info = cache.lookup(nid).unwrap_or(NodeInfo::from_raw(nid, &raw));
        cache.shrink_if_needed(
            self.pages.under_memory_pressure(),
            self.options.nat_cache_soft_limit,
        );
        Ok(info)
    }

    // ── Allocation ──────────────────────────────────────────────────────────

    /// Scan more NAT blocks into the free nid pool, then apply the journal.
    pub fn build_free_nids(&self) -> Result<usize> {
        let mut pool = self.free_nids.lock();
        let mut added = pool.scan_more(self, self.options.free_nid_pages)?;
        let journal: Vec<_> = self.meta.read().journal.iter().collect();
        for (nid, raw) in journal {
            if raw.block_addr == BlockAddr::NULL {
                if !self.nat.lock().lookup(nid).is_some_and(|info| {
                    !info.is_checkpointed() || info.blk_addr != BlockAddr::NULL
                }) && pool.add_free(nid)
                {
                    added += 1;
                }
            } else {
                pool.remove_new(nid);
            }
        }
        Ok(added)
    }

    /// Claim an unused nid. Scans once if the pool is empty.
    pub fn allocate_nid(&self) -> Result<Nid> {
        for attempt in 0..2 {
            if let Some(nid) = self.free_nids.lock().next_free()? {
                return Ok(nid);
            }
            if attempt == 0 {
                self.build_free_nids()?;
            }
        }
        debug!(target: "ffs::free_nid", event = "pool_exhausted");
        Err(FfsError::PoolExhausted)
    }

    /// The node for `nid` is persistent; it leaves the pool for good.
    pub fn commit_nid(&self, nid: Nid) {
        self.free_nids.lock().commit(nid);
    }

    /// Creation of the node for `nid` failed; make it allocatable again.
    pub fn abort_nid(&self, nid: Nid) {
        self.free_nids.lock().release(nid);
    }

    // ── Relocation ──────────────────────────────────────────────────────────

    /// Record that `nid` now lives at `new_addr`.
    pub fn relocate(&self, nid: Nid, new_addr: BlockAddr, owner_ino: Nid) -> Result<NodeInfo> {
        self.check_target(new_addr)?;
        let current = self.lookup_node_info(nid)?;
        let mut cache = self.nat.lock();
        if cache.lookup(nid).is_none() {
            cache.insert(current);
        }
        Ok(cache.update_blkaddr(nid, new_addr, owner_ino))
    }

    /// Relocation from the node write path, recording fsync completion on
    /// the owning inode's entry.
    pub fn relocate_after_fsync(
        &self,
        nid: Nid,
        new_addr: BlockAddr,
        owner_ino: Nid,
        fsync_done: bool,
    ) -> Result<NodeInfo> {
        let info = self.relocate(nid, new_addr, owner_ino)?;
        self.nat.lock().record_fsync(nid, owner_ino, fsync_done);
        Ok(info)
    }

    #[must_use]
    pub fn is_checkpointed_node(&self, nid: Nid) -> bool {
        self.nat.lock().is_checkpointed_node(nid)
    }

    #[must_use]
    pub fn need_dentry_mark(&self, nid: Nid) -> bool {
        self.nat.lock().need_dentry_mark(nid)
    }

    #[must_use]
    pub fn need_inode_block_update(&self, ino: Nid) -> bool {
        self.nat.lock().need_inode_block_update(ino)
    }

    // ── Node pages ──────────────────────────────────────────────────────────

    /// Read the node block of `nid` and check its footer identity.
    pub fn read_node_page(&self, nid: Nid) -> Result<NodePage> {
        let info = self.lookup_node_info(nid)?;
        if !info.blk_addr.is_valid() {
            return Err(FfsError::NotFound(format!(
                "nid {nid} has no node block ({})",
                info.blk_addr
            )));
        }
        let buf = self.pages.read_block(info.blk_addr)?;
        let page = NodePage::from_block(nid, info.blk_addr, buf.into_inner())?;
        let footer_nid = page.nid_of_node()?;
        if footer_nid != nid {
            error!(
                target: "ffs::nat",
                event = "footer_nid_mismatch",
                nid = nid.0,
                footer_nid = footer_nid.0,
                blk_addr = info.blk_addr.0
            );
            return Err(FfsError::Corruption {
                block: u64::from(info.blk_addr.0),
                detail: format!("footer names nid {footer_nid}, expected {nid}"),
            });
        }
        Ok(page)
    }

    /// Start a node for a freshly allocated `nid` at tree `offset` of `ino`.
    /// The nid is mapped to `NEW_ADDR` until the page is written.
    pub fn new_node_page(&self, nid: Nid, ino: Nid, offset: u32, is_dir: bool) -> Result<NodePage> {
        let current = self.lookup_node_info(nid)?;
        if current.blk_addr != BlockAddr::NULL {
            error!(
                target: "ffs::nat",
                event = "new_node_in_use",
                nid = nid.0,
                blk_addr = current.blk_addr.0
            );
            return Err(FfsError::DoubleAllocation { nid: nid.0 });
        }
        self.relocate(nid, BlockAddr::NEW, ino)?;
        let mut page = NodePage::blank(nid);
        page.fill_node_footer(nid, ino, offset, true)?;
        page.set_cold_node(is_dir)?;
        Ok(page)
    }

    /// Stamp the footer, stage the block at `new_addr` in the page cache
    /// and move the nid there.
    pub fn write_node_page(
        &self,
        page: &mut NodePage,
        new_addr: BlockAddr,
        next_blkaddr: BlockAddr,
    ) -> Result<NodeInfo> {
        if !new_addr.is_valid() {
            return Err(FfsError::Format(format!(
                "node block cannot be written to {new_addr}"
            )));
        }
        self.check_target(new_addr)?;
        page.fill_node_footer_blkaddr(self.checkpoint_version(), next_blkaddr)?;
        let footer = page.footer()?;
        let fsync_done = page.is_fsync_dnode()?;
        self.pages.mark_dirty(new_addr, page.as_bytes())?;
        page.set_addr(new_addr);
        trace!(
            target: "ffs::nat",
            event = "node_write",
            nid = footer.nid.0,
            ino = footer.ino.0,
            blk_addr = new_addr.0
        );
        self.relocate_after_fsync(page.nid(), new_addr, footer.ino, fsync_done)
    }

    // ── Flush ───────────────────────────────────────────────────────────────

    /// Persist every dirty NAT entry.
    ///
    /// Small batches go to the NAT journal. Otherwise the journal is merged
    /// into the dirty sets and each set is written to the other copy of its
    /// NAT block, ascending set id, flipping the bitmap bit after each
    /// durable write.
    pub fn flush_nat_entries(&self) -> Result<FlushStats> {
        let _serial = self.flush_lock.lock();
        let mut meta = self.meta.write();

        let (sets, merged, to_journal) = {
            let mut cache = self.nat.lock();
            let dirty: Vec<Nid> = cache.dirty_sets().iter_nids().collect();
            if dirty.is_empty() {
                return Ok(FlushStats::default());
            }
            let to_journal = self.options.use_nat_journal && meta.journal.has_space_for(&dirty);
            let merged = if to_journal {
                Vec::new()
            } else {
                meta.journal.drain()
            };
            for (nid, raw) in &merged {
                cache.adopt_journal_entry(*nid, raw);
            }
            (cache.take_dirty_sets(), merged, to_journal)
        };

        let mut stats = FlushStats {
            sets: sets.len(),
            entries: sets.iter().map(|s| s.entries.len()).sum(),
            ..FlushStats::default()
        };
        let mut freed = Vec::new();
        let outcome = if to_journal {
            self.flush_to_journal(&mut meta, &sets, &mut stats, &mut freed)
        } else {
            self.flush_to_blocks(&mut meta, &sets, &mut stats, &mut freed)
        };
        if let Err(err) = outcome {
            // Sets are written in order; records for sets already on disk
            // must not shadow them again.
            let unwritten = &sets[stats.nat_blocks_written..];
            for (nid, raw) in merged {
                if unwritten.iter().any(|set| set.set == nid.nat_block()) {
                    meta.journal.upsert(nid, raw)?;
                }
            }
            return Err(err);
        }
        drop(meta);

        if !freed.is_empty() {
            let mut pool = self.free_nids.lock();
            for nid in &freed {
                if pool.add_free(*nid) {
                    stats.freed_nids += 1;
                }
            }
        }
        self.nat.lock().shrink_if_needed(
            self.pages.under_memory_pressure(),
            self.options.nat_cache_soft_limit,
        );
        debug!(
            target: "ffs::nat",
            event = "flush",
            sets = stats.sets,
            entries = stats.entries,
            nat_blocks = stats.nat_blocks_written,
            journaled = stats.journaled,
            freed = stats.freed_nids
        );
        Ok(stats)
    }

    fn settle(&self, set: &FlushSet, freed: &mut Vec<Nid>) {
        let mut cache = self.nat.lock();
        for info in &set.entries {
            if cache.settle_flushed(info) && info.blk_addr == BlockAddr::NULL {
                freed.push(info.nid());
            }
        }
    }

    fn restore_from(&self, sets: &[FlushSet]) {
        self.nat
            .lock()
            .restore_dirty(sets.iter().flat_map(|s| s.entries.iter().map(NodeInfo::nid)));
    }

    fn flush_to_journal(
        &self,
        meta: &mut NatMeta,
        sets: &[FlushSet],
        stats: &mut FlushStats,
        freed: &mut Vec<Nid>,
    ) -> Result<()> {
        for set in sets {
            for info in &set.entries {
                if let Err(err) = meta.journal.upsert(info.nid(), info.to_raw()) {
                    self.restore_from(sets);
                    return Err(err);
                }
                stats.journaled += 1;
            }
        }
        for set in sets {
            self.settle(set, freed);
        }
        Ok(())
    }

    fn flush_to_blocks(
        &self,
        meta: &mut NatMeta,
        sets: &[FlushSet],
        stats: &mut FlushStats,
        freed: &mut Vec<Nid>,
    ) -> Result<()> {
        for (idx, set) in sets.iter().enumerate() {
            if let Err(err) = self.write_nat_set(meta, set) {
                error!(
                    target: "ffs::nat",
                    event = "nat_block_write_failed",
                    set = set.set.0,
                    error = %err
                );
                self.restore_from(&sets[idx..]);
                return Err(err);
            }
            stats.nat_blocks_written += 1;
            self.settle(set, freed);
        }
        Ok(())
    }

    fn write_nat_set(&self, meta: &mut NatMeta, set: &FlushSet) -> Result<()> {
        let current = meta.bitmap.resolve_block(set.set)?;
        let mut block = self.read_nat_block_at(current)?;
        for info in &set.entries {
            block
                .set_entry(info.nid().slot_in_block(), &info.to_raw())
                .map_err(|err| corrupt(current, err))?;
        }
        let target = meta.bitmap.mirror_address(current)?;
        self.pages.write_block(target, block.as_bytes())?;
        meta.bitmap.flip_block(set.set)?;
        trace!(
            target: "ffs::nat",
            event = "nat_block_write",
            set = set.set.0,
            from = current.0,
            to = target.0,
            entries = set.entries.len()
        );
        Ok(())
    }

    // ── Checkpoint image / unmount ──────────────────────────────────────────

    /// Snapshot of the persisted NAT state: bitmap, journal, scan cursor.
    pub fn checkpoint_image(&self) -> Result<NatCheckpoint> {
        let (nat_bitmap, nat_journal) = {
            let meta = self.meta.read();
            (meta.bitmap.copy_out(), meta.journal.to_bytes()?)
        };
        Ok(NatCheckpoint {
            version: self.checkpoint_version(),
            nat_bitmap,
            nat_journal,
            next_scan_nid: self.free_nids.lock().next_scan_nid(),
        })
    }

    /// Flush everything dirty and return the final checkpoint image.
    pub fn unmount(self) -> Result<NatCheckpoint> {
        let stats = self.flush_nat_entries()?;
        let image = self.checkpoint_image()?;
        debug!(
            target: "ffs::nat",
            event = "unmount",
            flushed = stats.entries,
            version = image.version.0
        );
        Ok(image)
    }
}

impl<C: PageCache> NatScanSource for NodeManager<C> {
    fn read_nat_block(&self, index: NatBlockIndex) -> Result<NatBlock> {
        let addr = self.meta.read().bitmap.resolve_block(index)?;
        self.read_nat_block_at(addr)
    }

    fn in_use_override(&self, nid: Nid) -> Option<bool> {
        if let Some(info) = self.nat.lock().lookup(nid) {
            return Some(!info.is_checkpointed() || info.blk_addr != BlockAddr::NULL);
        }
        self.meta
            .read()
            .journal
            .lookup(nid)
            .map(|raw| raw.block_addr != BlockAddr::NULL)
    }
}
