//! In-memory NAT cache with write-back dirty tracking.
//!
//! Entries are kept in an insertion-ordered map: eviction walks from the
//! oldest entry and only ever removes clean ones. Every dirty entry is also
//! registered in [`DirtySets`] until a checkpoint flush drains it.

use ffs_ondisk::RawNatEntry;
use ffs_types::{BlockAddr, NatBlockIndex, Nid};
use indexmap::IndexMap;
use tracing::{debug, trace};

use crate::dirty::{DirtySets, NatEntrySet};
use crate::info::{NatFlags, NodeInfo};

/// One drained dirty set with a snapshot of each entry at drain time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlushSet {
    pub set: NatBlockIndex,
    pub entries: Vec<NodeInfo>,
}

#[derive(Debug, Default)]
pub struct NatCache {
    entries: IndexMap<Nid, NodeInfo>,
    dirty: DirtySets,
    dirty_entries: usize,
}

impl NatCache {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries with `IS_DIRTY` set, including ones drained but not yet settled.
    #[must_use]
    pub fn dirty_count(&self) -> usize {
        self.dirty_entries
    }

    #[must_use]
    pub fn clean_count(&self) -> usize {
        self.entries.len() - self.dirty_entries
    }

    /// Nids currently registered in a dirty set.
    #[must_use]
    pub fn dirty_sets(&self) -> &DirtySets {
        &self.dirty
    }

    /// Cached info for `nid`, or `None` on a miss.
    #[must_use]
    pub fn lookup(&self, nid: Nid) -> Option<NodeInfo> {
        self.entries.get(&nid).copied()
    }

    /// Cache a mapping read from disk or the journal.
    ///
    /// A clean entry is refreshed; a dirty entry is left untouched because
    /// it holds a relocation that has not been flushed yet. Returns whether
    /// the cache changed.
    pub fn insert(&mut self, mut info: NodeInfo) -> bool {
        info.set_flag(NatFlags::IS_DIRTY, false);
        let nid = info.nid();
        match self.entries.get_mut(&nid) {
            Some(existing) if existing.is_dirty() => {
                trace!(target: "ffs::nat", event = "insert_skip_dirty", nid = nid.0);
                false
            }
            Some(existing) => {
                *existing = info;
                true
            }
            None => {
                self.entries.insert(nid, info);
                trace!(
                    target: "ffs::nat",
                    event = "insert",
                    nid = nid.0,
                    blk_addr = info.blk_addr.0
                );
                true
            }
        }
    }

    fn set_dirty(&mut self, nid: Nid) {
        if let Some(info) = self.entries.get_mut(&nid) {
            if !info.is_dirty() {
                info.set_flag(NatFlags::IS_DIRTY, true);
                self.dirty_entries += 1;
            }
            self.dirty.register_dirty(nid);
        }
    }

    /// Record an out-of-place move of `nid` to `new_addr`.
    ///
    /// The version advances only when the old address was a real block and
    /// the address actually changes. Moving to `NULL_ADDR` (node freed) drops
    /// `IS_CHECKPOINTED`. An uncached nid starts from an unwritten mapping.
    pub fn update_blkaddr(&mut self, nid: Nid, new_addr: BlockAddr, new_ino: Nid) -> NodeInfo {
        let info = self.entries.entry(nid).or_insert_with(|| {
            let mut fresh = NodeInfo::new(nid, new_ino, BlockAddr::NULL, 0);
            fresh.flags = NatFlags::empty();
            fresh
        });
        let old_addr = info.blk_addr;
        if old_addr.is_valid() && old_addr != new_addr {
            info.bump_version();
        }
        info.blk_addr = new_addr;
        info.ino = new_ino;
        if new_addr == BlockAddr::NULL {
            info.set_flag(NatFlags::IS_CHECKPOINTED, false);
        }
        let version = info.version;
        self.set_dirty(nid);
        trace!(
            target: "ffs::nat",
            event = "relocate",
            nid = nid.0,
            old_addr = old_addr.0,
            new_addr = new_addr.0,
            version
        );
        self.lookup(nid).unwrap_or(NodeInfo::new(nid, new_ino, new_addr, version))
    }

    /// Record whether the write of `nid` completed an fsync. The marks live
    /// on the owning inode's entry.
    pub fn record_fsync(&mut self, nid: Nid, ino: Nid, fsync_done: bool) {
        if let Some(inode) = self.entries.get_mut(&ino) {
            if fsync_done && nid == ino {
                inode.set_flag(NatFlags::HAS_FSYNCED_INODE, true);
            }
            inode.set_flag(NatFlags::HAS_LAST_FSYNC, fsync_done);
        }
    }

    /// Uncached nids are treated as checkpointed.
    #[must_use]
    pub fn is_checkpointed_node(&self, nid: Nid) -> bool {
        self.entries.get(&nid).is_none_or(NodeInfo::is_checkpointed)
    }

    /// A dentry mark is needed while the node has not reached a checkpoint.
    #[must_use]
    pub fn need_dentry_mark(&self, nid: Nid) -> bool {
        self.entries.get(&nid).is_some_and(|info| !info.is_checkpointed())
    }

    /// Whether the inode block itself must be rewritten on the next fsync.
    #[must_use]
    pub fn need_inode_block_update(&self, ino: Nid) -> bool {
        self.entries.get(&ino).is_none_or(|info| {
            !(info.flags.contains(NatFlags::HAS_LAST_FSYNC)
                && (info.is_checkpointed() || info.flags.contains(NatFlags::HAS_FSYNCED_INODE)))
        })
    }

    /// Reset `nid` to the checkpointed state and move it to the tail of the
    /// eviction order.
    pub fn mark_checkpointed(&mut self, nid: Nid) -> bool {
        let Some(idx) = self.entries.get_index_of(&nid) else {
            return false;
        };
        if let Some((_, info)) = self.entries.get_index_mut(idx) {
            if info.is_dirty() {
                self.dirty_entries -= 1;
            }
            info.flags = NatFlags::checkpointed();
        }
        self.dirty.unregister(nid);
        let last = self.entries.len() - 1;
        self.entries.move_index(idx, last);
        true
    }

    /// Settle an entry written by a flush. The entry is marked checkpointed
    /// only if its mapping still equals the flushed snapshot; otherwise it
    /// was relocated meanwhile and stays dirty for the next flush.
    pub fn settle_flushed(&mut self, flushed: &NodeInfo) -> bool {
        match self.entries.get(&flushed.nid()) {
            Some(current) if current.same_mapping(flushed) => {
                self.mark_checkpointed(flushed.nid())
            }
            _ => false,
        }
    }

    /// Put still-dirty entries from an aborted flush back into their sets.
    pub fn restore_dirty(&mut self, nids: impl IntoIterator<Item = Nid>) {
        for nid in nids {
            if self.entries.get(&nid).is_some_and(NodeInfo::is_dirty) {
                self.dirty.register_dirty(nid);
            }
        }
    }

    /// Merge a journal record into the dirty sets so it is written to its
    /// NAT block. A cached entry is newer than the journal and wins.
    pub fn adopt_journal_entry(&mut self, nid: Nid, raw: &RawNatEntry) {
        self.entries
            .entry(nid)
            .or_insert_with(|| NodeInfo::from_raw(nid, raw));
        self.set_dirty(nid);
    }

    /// Drain every dirty set, ascending set id, with entry snapshots.
    pub fn take_dirty_sets(&mut self) -> Vec<FlushSet> {
        let sets: Vec<NatEntrySet> = self.dirty.drain_for_flush();
        sets.into_iter()
            .map(|set| FlushSet {
                set: set.set,
                entries: set
                    .nids
                    .iter()
                    .filter_map(|nid| self.entries.get(nid).copied())
                    .collect(),
            })
            .collect()
    }

    /// Remove up to `target` clean entries, oldest first. Dirty entries are
    /// never removed.
    pub fn evict_clean(&mut self, target: usize) -> usize {
        let mut evicted = 0_usize;
        self.entries.retain(|_, info| {
            if evicted < target && !info.is_dirty() {
                evicted += 1;
                false
            } else {
                true
            }
        });
        if evicted > 0 {
            debug!(
                target: "ffs::nat",
                event = "evict_clean",
                evicted,
                remaining = self.entries.len()
            );
        }
        evicted
    }

    /// Under memory pressure, evict clean entries above `soft_limit`.
    pub fn shrink_if_needed(&mut self, under_pressure: bool, soft_limit: usize) -> usize {
        if !under_pressure {
            return 0;
        }
        let excess = self.clean_count().saturating_sub(soft_limit);
        if excess == 0 {
            return 0;
        }
        self.evict_clean(excess)
    }

    /// Cached entries, eviction order.
    pub fn iter(&self) -> impl Iterator<Item = &NodeInfo> {
        self.entries.values()
    }
}
