//! NAT journal: a small set of NAT updates persisted in the checkpoint
//! summary area instead of in NAT blocks.
//!
//! Entries here take precedence over the on-disk NAT block for the same nid.

use std::collections::BTreeMap;

use ffs_error::{FfsError, Result};
use ffs_ondisk::{RawNatEntry, encode_nat_journal, parse_nat_journal};
use ffs_types::{NAT_JOURNAL_ENTRIES, Nid};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NatJournal {
    entries: BTreeMap<Nid, RawNatEntry>,
}

impl NatJournal {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode the journal region of a checkpoint image.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let records =
            parse_nat_journal(bytes).map_err(|err| FfsError::Parse(format!("NAT journal: {err}")))?;
        let mut entries = BTreeMap::new();
        for (nid, entry) in records {
            if entries.insert(nid, entry).is_some() {
                return Err(FfsError::Format(format!(
                    "NAT journal lists nid {nid} twice"
                )));
            }
        }
        Ok(Self { entries })
    }

    /// Reject records whose nid cannot exist on a NAT of `max_nid` entries.
    ///
    /// nid 0 is reserved and never journaled.
    pub fn check_nid_range(&self, max_nid: u32) -> Result<()> {
        match self
            .entries
            .keys()
            .find(|nid| **nid == Nid::RESERVED || nid.0 >= max_nid)
        {
            Some(nid) => Err(FfsError::Format(format!(
                "NAT journal records nid {nid} outside 1..{max_nid}"
            ))),
            None => Ok(()),
        }
    }

    /// Encode into a fixed-size journal region, ascending nid order.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let records: Vec<_> = self.entries.iter().map(|(nid, e)| (*nid, *e)).collect();
        encode_nat_journal(&records).map_err(|err| FfsError::Parse(format!("NAT journal: {err}")))
    }

    #[must_use]
    pub fn lookup(&self, nid: Nid) -> Option<RawNatEntry> {
        self.entries.get(&nid).copied()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Whether `nids` can all be recorded without exceeding capacity.
    ///
    /// nids already present overwrite their slot and need no extra room.
    pub fn has_space_for<'a>(&self, nids: impl IntoIterator<Item = &'a Nid>) -> bool {
        let added = nids
            .into_iter()
            .filter(|nid| !self.entries.contains_key(*nid))
            .count();
        self.entries.len() + added <= NAT_JOURNAL_ENTRIES
    }

    /// Record `entry` for `nid`. Fails if the journal is full.
    pub fn upsert(&mut self, nid: Nid, entry: RawNatEntry) -> Result<()> {
        if !self.entries.contains_key(&nid) && self.entries.len() >= NAT_JOURNAL_ENTRIES {
            return Err(FfsError::Format(format!(
                "NAT journal full ({NAT_JOURNAL_ENTRIES} entries), cannot add nid {nid}"
            )));
        }
        self.entries.insert(nid, entry);
        Ok(())
    }

    /// Remove and return every entry, ascending nid order.
    pub fn drain(&mut self) -> Vec<(Nid, RawNatEntry)> {
        std::mem::take(&mut self.entries).into_iter().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (Nid, RawNatEntry)> + '_ {
        self.entries.iter().map(|(nid, entry)| (*nid, *entry))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ffs_types::{BlockAddr, NAT_JOURNAL_SIZE};

    fn entry(addr: u32) -> RawNatEntry {
        RawNatEntry {
            ino: Nid(3),
            block_addr: BlockAddr(addr),
            version: 1,
        }
    }

    #[test]
    fn upsert_overwrites_and_respects_capacity() {
        let mut journal = NatJournal::new();
        for nid in 0..NAT_JOURNAL_ENTRIES as u32 {
            journal.upsert(Nid(nid), entry(nid + 100)).expect("room");
        }
        assert_eq!(journal.len(), NAT_JOURNAL_ENTRIES);
        journal.upsert(Nid(0), entry(7)).expect("overwrite needs no room");
        assert_eq!(journal.lookup(Nid(0)), Some(entry(7)));
        assert!(journal.upsert(Nid(999), entry(1)).is_err());
        assert!(journal.has_space_for(&[Nid(1), Nid(2)]));
        assert!(!journal.has_space_for(&[Nid(1), Nid(999)]));
    }

    #[test]
    fn bytes_round_trip_in_nid_order() {
        let mut journal = NatJournal::new();
        journal.upsert(Nid(40), entry(400)).expect("upsert");
        journal.upsert(Nid(4), entry(44)).expect("upsert");
        let bytes = journal.to_bytes().expect("encode");
        assert_eq!(bytes.len(), NAT_JOURNAL_SIZE);
        assert_eq!(u32::from_le_bytes([bytes[2], bytes[3], bytes[4], bytes[5]]), 4);

        let decoded = NatJournal::from_bytes(&bytes).expect("decode");
        assert_eq!(decoded, journal);
    }

    #[test]
    fn duplicate_nids_are_rejected() {
        let records = vec![(Nid(4), entry(1)), (Nid(4), entry(2))];
        let bytes = encode_nat_journal(&records).expect("encode");
        assert!(matches!(
            NatJournal::from_bytes(&bytes),
            Err(FfsError::Format(_))
        ));
    }

    #[test]
    fn malformed_region_is_a_parse_error() {
        let mut bytes = vec![0_u8; NAT_JOURNAL_SIZE];
        bytes[..2].copy_from_slice(&(NAT_JOURNAL_ENTRIES as u16 + 1).to_le_bytes());
        assert!(matches!(
            NatJournal::from_bytes(&bytes),
            Err(FfsError::Parse(_))
        ));
        assert!(matches!(
            NatJournal::from_bytes(&bytes[..1]),
            Err(FfsError::Parse(_))
        ));
    }

    #[test]
    fn nid_range_check_rejects_reserved_and_past_end() {
        let mut journal = NatJournal::new();
        journal.upsert(Nid(1), entry(10)).expect("upsert");
        journal.upsert(Nid(99), entry(11)).expect("upsert");
        journal.check_nid_range(100).expect("in range");
        assert!(matches!(
            journal.check_nid_range(99),
            Err(FfsError::Format(_))
        ));

        let mut reserved = NatJournal::new();
        reserved.upsert(Nid::RESERVED, entry(12)).expect("upsert");
        assert!(matches!(
            reserved.check_nid_range(100),
            Err(FfsError::Format(_))
        ));
    }

    #[test]
    fn drain_empties_in_order() {
        let mut journal = NatJournal::new();
        journal.upsert(Nid(9), entry(9)).expect("upsert");
        journal.upsert(Nid(2), entry(2)).expect("upsert");
        let drained: Vec<Nid> = journal.drain().into_iter().map(|(nid, _)| nid).collect();
        assert_eq!(drained, vec![Nid(2), Nid(9)]);
        assert!(journal.is_empty());
    }
}
