//! One node block held in memory, with footer and child-slot accessors.

use ffs_block::PageCache;
use ffs_error::{FfsError, Result};
use ffs_ondisk::{
    NodeFooter, NodeKind, NodeMarks, classify_node, is_direct_node, read_nid_slot, write_nid_slot,
};
use ffs_types::{BLOCK_SIZE, BlockAddr, CheckpointVersion, Nid};

use crate::corrupt;

/// A node block buffer. `addr` is where the block was read from, or
/// `NEW_ADDR` until it is first written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodePage {
    nid: Nid,
    addr: BlockAddr,
    data: Vec<u8>,
}

impl NodePage {
    pub fn from_block(nid: Nid, addr: BlockAddr, data: Vec<u8>) -> Result<Self> {
        if data.len() != BLOCK_SIZE {
            return Err(FfsError::Format(format!(
                "node block for nid {nid} is {} bytes, expected {BLOCK_SIZE}",
                data.len()
            )));
        }
        Ok(Self { nid, addr, data })
    }

    /// Zeroed page for a node that has no block yet.
    #[must_use]
    pub fn blank(nid: Nid) -> Self {
        Self {
            nid,
            addr: BlockAddr::NEW,
            data: vec![0; BLOCK_SIZE],
        }
    }

    #[must_use]
    pub fn nid(&self) -> Nid {
        self.nid
    }

    #[must_use]
    pub fn addr(&self) -> BlockAddr {
        self.addr
    }

    pub(crate) fn set_addr(&mut self, addr: BlockAddr) {
        self.addr = addr;
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    #[must_use]
    pub fn into_bytes(self) -> Vec<u8> {
        self.data
    }

    // ── Footer ──────────────────────────────────────────────────────────────

    pub fn footer(&self) -> Result<NodeFooter> {
        NodeFooter::parse_from_block(&self.data).map_err(|err| corrupt(self.addr, err))
    }

    fn store_footer(&mut self, footer: &NodeFooter) -> Result<()> {
        let addr = self.addr;
        footer
            .write_to_block(&mut self.data)
            .map_err(|err| corrupt(addr, err))
    }

    pub fn nid_of_node(&self) -> Result<Nid> {
        Ok(self.footer()?.nid)
    }

    pub fn ino_of_node(&self) -> Result<Nid> {
        Ok(self.footer()?.ino)
    }

    pub fn ofs_of_node(&self) -> Result<u32> {
        Ok(self.footer()?.offset())
    }

    pub fn cpver_of_node(&self) -> Result<CheckpointVersion> {
        Ok(self.footer()?.cp_ver)
    }

    pub fn next_blkaddr_of_node(&self) -> Result<BlockAddr> {
        Ok(self.footer()?.next_blkaddr)
    }

    /// Whether this node holds data block addresses.
    pub fn is_dnode(&self) -> Result<bool> {
        Ok(is_direct_node(self.ofs_of_node()?))
    }

    pub fn kind(&self) -> Result<NodeKind> {
        Ok(classify_node(self.ofs_of_node()?))
    }

    /// Stamp identity and tree offset into the footer.
    ///
    /// `reset` zeroes the whole block first. Otherwise the marker bits of
    /// the flag word and the rest of the footer are kept.
    pub fn fill_node_footer(&mut self, nid: Nid, ino: Nid, offset: u32, reset: bool) -> Result<()> {
        if reset {
            self.data.fill(0);
        }
        let mut footer = self.footer()?;
        footer.nid = nid;
        footer.ino = ino;
        footer.flag = footer.flag.with_offset(offset, reset);
        self.store_footer(&footer)
    }

    /// Stamp the checkpoint version and the next block of the fsync chain.
    pub fn fill_node_footer_blkaddr(
        &mut self,
        cp_ver: CheckpointVersion,
        next_blkaddr: BlockAddr,
    ) -> Result<()> {
        let mut footer = self.footer()?;
        footer.cp_ver = cp_ver;
        footer.next_blkaddr = next_blkaddr;
        self.store_footer(&footer)
    }

    pub fn copy_node_footer(&mut self, src: &NodePage) -> Result<()> {
        let footer = src.footer()?;
        self.store_footer(&footer)
    }

    // ── Marks ───────────────────────────────────────────────────────────────

    fn set_mark(&mut self, mark: NodeMarks, on: bool) -> Result<()> {
        let mut footer = self.footer()?;
        footer.flag = footer.flag.with_mark(mark, on);
        self.store_footer(&footer)
    }

    fn has_mark(&self, mark: NodeMarks) -> Result<bool> {
        Ok(self.footer()?.flag.has(mark))
    }

    /// Nodes of anything but a directory are cold.
    pub fn set_cold_node(&mut self, is_dir: bool) -> Result<()> {
        self.set_mark(NodeMarks::COLD, !is_dir)
    }

    pub fn set_fsync_mark(&mut self, on: bool) -> Result<()> {
        self.set_mark(NodeMarks::FSYNC, on)
    }

    pub fn set_dentry_mark(&mut self, on: bool) -> Result<()> {
        self.set_mark(NodeMarks::DENTRY, on)
    }

    pub fn is_cold_node(&self) -> Result<bool> {
        self.has_mark(NodeMarks::COLD)
    }

    pub fn is_fsync_dnode(&self) -> Result<bool> {
        self.has_mark(NodeMarks::FSYNC)
    }

    pub fn is_dent_dnode(&self) -> Result<bool> {
        self.has_mark(NodeMarks::DENTRY)
    }

    // ── Child slots ─────────────────────────────────────────────────────────

    /// Child nid at `slot`. For an inode, `slot` is a node-tree offset
    /// starting at `NODE_DIR1_BLOCK`.
    pub fn get_nid(&self, slot: u32, in_inode: bool) -> Result<Nid> {
        read_nid_slot(&self.data, slot, in_inode).map_err(|err| corrupt(self.addr, err))
    }

    /// Store a child nid in place.
    ///
    /// Waits for any in-flight writeback of this block first, then hands the
    /// updated block to the page cache as dirty. A page without a block yet
    /// is only edited in memory.
    pub fn set_nid(
        &mut self,
        cache: &dyn PageCache,
        slot: u32,
        nid: Nid,
        in_inode: bool,
    ) -> Result<()> {
        let on_disk = self.addr.is_valid();
        if on_disk {
            cache.wait_for_writeback(self.addr)?;
        }
        let addr = self.addr;
        write_nid_slot(&mut self.data, slot, in_inode, nid).map_err(|err| corrupt(addr, err))?;
        if on_disk {
            cache.mark_dirty(self.addr, &self.data)?;
        }
        Ok(())
    }
}
