//! Pool of unused node ids, refilled by scanning NAT blocks.
//!
//! Each pooled nid is `New` (known free) or `Allocated` (handed out, not yet
//! committed). New nids are served FIFO so allocation follows scan order.

use std::collections::{HashMap, VecDeque};

use ffs_error::{FfsError, Result};
use ffs_ondisk::NatBlock;
use ffs_types::{BlockAddr, NAT_ENTRY_PER_BLOCK, NatBlockIndex, Nid};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, trace, warn};

use crate::options::NodeManagerOptions;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NidState {
    New,
    Allocated,
}

/// What a scan reads: NAT blocks plus fresher in-memory state.
pub trait NatScanSource {
    /// Current copy of NAT block `index`.
    fn read_nat_block(&self, index: NatBlockIndex) -> Result<NatBlock>;

    /// `Some(in_use)` when a newer source than the NAT block (cache,
    /// journal) knows the nid's state; `None` to trust the block.
    fn in_use_override(&self, nid: Nid) -> Option<bool>;
}

#[derive(Debug)]
pub struct FreeNidPool {
    states: HashMap<Nid, NidState>,
    new_list: VecDeque<Nid>,
    allocated: usize,
    next_scan_nid: Nid,
    max_nid: u32,
    low_water: usize,
    high_water: usize,
}

impl FreeNidPool {
    #[must_use]
    pub fn new(max_nid: u32, options: &NodeManagerOptions) -> Self {
        Self {
            states: HashMap::new(),
            new_list: VecDeque::new(),
            allocated: 0,
            next_scan_nid: Nid(0),
            max_nid,
            low_water: options.free_nid_low_water,
            high_water: options.free_nid_high_water,
        }
    }

    /// Resume scanning at a persisted cursor (block-aligned, wrapped).
    #[must_use]
    pub fn with_cursor(mut self, next_scan_nid: Nid) -> Self {
        self.next_scan_nid = if next_scan_nid.0 >= self.max_nid {
            Nid(0)
        } else {
            next_scan_nid.start_of_block()
        };
        self
    }

    #[must_use]
    pub fn next_scan_nid(&self) -> Nid {
        self.next_scan_nid
    }

    #[must_use]
    pub fn new_count(&self) -> usize {
        self.new_list.len()
    }

    #[must_use]
    pub fn allocated_count(&self) -> usize {
        self.allocated
    }

    #[must_use]
    pub fn state_of(&self, nid: Nid) -> Option<NidState> {
        self.states.get(&nid).copied()
    }

    /// Hand out the oldest New nid and mark it Allocated. `Ok(None)` means
    /// the pool is empty and a scan is needed.
    pub fn next_free(&mut self) -> Result<Option<Nid>> {
        let Some(nid) = self.new_list.pop_front() else {
            return Ok(None);
        };
        match self.states.get_mut(&nid) {
            Some(state @ NidState::New) => {
                *state = NidState::Allocated;
                self.allocated += 1;
                trace!(target: "ffs::free_nid", event = "alloc", nid = nid.0);
                Ok(Some(nid))
            }
            _ => {
                error!(
                    target: "ffs::free_nid",
                    event = "double_allocation",
                    nid = nid.0
                );
                Err(FfsError::DoubleAllocation { nid: nid.0 })
            }
        }
    }

    /// Return an aborted allocation to the New list. Unknown or New nids
    /// are left alone.
    pub fn release(&mut self, nid: Nid) -> bool {
        match self.states.get_mut(&nid) {
            Some(state @ NidState::Allocated) => {
                *state = NidState::New;
                self.allocated -= 1;
                self.new_list.push_back(nid);
                trace!(target: "ffs::free_nid", event = "release", nid = nid.0);
                true
            }
            _ => false,
        }
    }

    /// The allocation of `nid` is persistent; forget it.
    pub fn commit(&mut self, nid: Nid) -> bool {
        if self.states.get(&nid) == Some(&NidState::Allocated) {
            self.states.remove(&nid);
            self.allocated -= 1;
            trace!(target: "ffs::free_nid", event = "commit", nid = nid.0);
            true
        } else {
            warn!(
                target: "ffs::free_nid",
                event = "commit_untracked",
                nid = nid.0,
                state = ?self.states.get(&nid)
            );
            false
        }
    }

    /// Track `nid` as New unless it is reserved, out of range, or already
    /// tracked in any state.
    pub fn add_free(&mut self, nid: Nid) -> bool {
        if nid == Nid::RESERVED || nid.0 >= self.max_nid || self.states.contains_key(&nid) {
            return false;
        }
        self.states.insert(nid, NidState::New);
        self.new_list.push_back(nid);
        true
    }

    /// Drop a New nid that turned out to be in use. Allocated nids stay.
    pub fn remove_new(&mut self, nid: Nid) -> bool {
        if self.states.get(&nid) != Some(&NidState::New) {
            return false;
        }
        self.states.remove(&nid);
        self.new_list.retain(|n| *n != nid);
        true
    }

    /// Forget every tracked nid. The scan cursor is kept.
    pub fn reset(&mut self) {
        self.states.clear();
        self.new_list.clear();
        self.allocated = 0;
    }

    /// Scan up to `max_pages` NAT blocks from the cursor and pool every free
    /// nid found. Skipped while the pool is above low water; stops early at
    /// high water. Returns the number of nids added.
    pub fn scan_more(&mut self, source: &dyn NatScanSource, max_pages: u32) -> Result<usize> {
        if self.new_count() > self.low_water {
            trace!(
                target: "ffs::free_nid",
                event = "scan_skip",
                new_count = self.new_count()
            );
            return Ok(0);
        }
        if self.max_nid == 0 {
            return Ok(0);
        }
        let start = self.next_scan_nid;
        let mut added = 0_usize;
        let mut pages = 0_u32;
        while pages < max_pages && self.new_count() < self.high_water {
            let index = self.next_scan_nid.nat_block();
            let block = source.read_nat_block(index)?;
            let first = index.first_nid();
            for (slot, raw) in block.entries().enumerate() {
                let nid = Nid(first.0 + slot as u32);
                if nid.0 >= self.max_nid {
                    break;
                }
                if nid == Nid::RESERVED {
                    continue;
                }
                let in_use = source
                    .in_use_override(nid)
                    .unwrap_or(raw.block_addr != BlockAddr::NULL);
                if in_use {
                    self.remove_new(nid);
                } else if self.new_count() < self.high_water && self.add_free(nid) {
                    added += 1;
                }
            }
            pages += 1;
            let next = first.0.saturating_add(NAT_ENTRY_PER_BLOCK);
            self.next_scan_nid = if next >= self.max_nid { Nid(0) } else { Nid(next) };
            if self.next_scan_nid == start.start_of_block() {
                break;
            }
        }
        debug!(
            target: "ffs::free_nid",
            event = "scan",
            start_nid = start.0,
            next_scan_nid = self.next_scan_nid.0,
            pages,
            added,
            new_count = self.new_count()
        );
        Ok(added)
    }
}
