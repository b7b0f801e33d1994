//! Dirty NAT entries grouped by the NAT block that stores them.

use std::collections::{BTreeMap, HashMap};

use ffs_types::{NatBlockIndex, Nid};

/// Dirty nids whose on-disk entries share one NAT block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NatEntrySet {
    pub set: NatBlockIndex,
    /// Registration order.
    pub nids: Vec<Nid>,
}

impl NatEntrySet {
    #[must_use]
    pub fn count(&self) -> usize {
        self.nids.len()
    }
}

/// Aggregates dirty entries into [`NatEntrySet`]s keyed by NAT block.
#[derive(Debug, Default)]
pub struct DirtySets {
    sets: BTreeMap<NatBlockIndex, NatEntrySet>,
    membership: HashMap<Nid, NatBlockIndex>,
}

impl DirtySets {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `nid` to its set, creating the set on first use. Re-registering a
    /// nid that is already dirty is a no-op.
    pub fn register_dirty(&mut self, nid: Nid) {
        if self.membership.contains_key(&nid) {
            return;
        }
        let set = nid.nat_block();
        self.membership.insert(nid, set);
        self.sets
            .entry(set)
            .or_insert_with(|| NatEntrySet {
                set,
                nids: Vec::new(),
            })
            .nids
            .push(nid);
    }

    /// Drop `nid` from its set, removing the set once it is empty.
    pub fn unregister(&mut self, nid: Nid) -> bool {
        let Some(set) = self.membership.remove(&nid) else {
            return false;
        };
        if let Some(entry_set) = self.sets.get_mut(&set) {
            entry_set.nids.retain(|n| *n != nid);
            if entry_set.nids.is_empty() {
                self.sets.remove(&set);
            }
        }
        true
    }

    #[must_use]
    pub fn contains(&self, nid: Nid) -> bool {
        self.membership.contains_key(&nid)
    }

    /// Total dirty nids across all sets.
    #[must_use]
    pub fn dirty_count(&self) -> usize {
        self.membership.len()
    }

    #[must_use]
    pub fn set_count(&self) -> usize {
        self.sets.len()
    }

    /// Borrow the set for one NAT block.
    #[must_use]
    pub fn set(&self, set: NatBlockIndex) -> Option<&NatEntrySet> {
        self.sets.get(&set)
    }

    /// All dirty nids, ascending set id then registration order.
    pub fn iter_nids(&self) -> impl Iterator<Item = Nid> + '_ {
        self.sets.values().flat_map(|s| s.nids.iter().copied())
    }

    /// Take every non-empty set, ascending set id. The aggregator is empty
    /// afterwards.
    pub fn drain_for_flush(&mut self) -> Vec<NatEntrySet> {
        self.membership.clear();
        std::mem::take(&mut self.sets).into_values().collect()
    }
}
