#![forbid(unsafe_code)]
//! On-disk formats for node metadata.
//!
//! Pure parsing crate: no I/O and no side effects. Decodes and encodes node
//! block footers (with the packed offset/marker flag word), classifies
//! node-tree offsets, reads child-nid slots, and handles NAT entries, NAT
//! blocks and the NAT journal region of the checkpoint summary.

pub mod nat;
pub mod node;

pub use nat::{NatBlock, RawNatEntry, encode_nat_journal, parse_nat_journal};
pub use node::{
    FooterFlag, NodeFooter, NodeKind, NodeMarks, classify_node, encode_offset, is_direct_node,
    is_xattr_offset, nid_slot_offset, read_nid_slot, write_nid_slot,
};
