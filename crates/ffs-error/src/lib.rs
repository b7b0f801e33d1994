#![forbid(unsafe_code)]
//! Error types for the node address table core.
//!
//! # Error Taxonomy
//!
//! Two layers, same as the rest of the workspace:
//!
//! | Layer | Type | Crate | Purpose |
//! |-------|------|-------|---------|
//! | Parsing | `ParseError` | `ffs-types` | Byte-level violations while decoding footers, NAT entries, journal records |
//! | Runtime | `FfsError` | `ffs-error` (this crate) | Errors returned by the node manager, block layer and facade |
//!
//! ## Mapping Policy: ParseError → FfsError
//!
//! `ffs-error` does not depend on `ffs-types`. The conversion lives in
//! `ffs-node`, which knows which block was being decoded:
//!
//! | Situation | FfsError Variant |
//! |-----------|------------------|
//! | NAT block / node block decode failure at a known address | `Corruption { block, detail }` |
//! | NAT journal region bytes undecodable (no block address) | `Parse(detail)` |
//! | Checkpoint image rejected at mount (bitmap size, journal nids) | `Format(detail)` |
//! | Footer nid does not match the nid it was looked up by | `Corruption { block, detail }` |
//!
//! ## Recovery classes
//!
//! | Variant | Local recovery |
//! |---------|----------------|
//! | `Io` | none; escalated to the caller (may remount read-only above us) |
//! | `Corruption` | none; never silently repaired |
//! | `PoolExhausted` | scan more NAT blocks, retry the allocation once |
//! | `DoubleAllocation` | none; internal invariant violation |
//!
//! ## FUSE errno Mapping
//!
//! | Variant | errno |
//! |---------|-------|
//! | `Io` | raw OS error or `EIO` |
//! | `Corruption` | `EIO` |
//! | `Format` | `EINVAL` |
//! | `Parse` | `EINVAL` |
//! | `InvalidGeometry` | `EINVAL` |
//! | `InvalidNid` | `EINVAL` |
//! | `PoolExhausted` | `EAGAIN` |
//! | `DoubleAllocation` | `EIO` |
//! | `NotFound` | `ENOENT` |
//! | `ReadOnly` | `EROFS` |

use thiserror::Error;

/// Unified error type for node-metadata operations.
#[derive(Debug, Error)]
pub enum FfsError {
    /// Operating system I/O error (wraps `std::io::Error`).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// On-disk metadata failed a sanity check at a known block.
    ///
    /// Raised for undecodable NAT blocks, footer/nid mismatches and block
    /// addresses that point outside the device.
    #[error("corrupt metadata at block {block}: {detail}")]
    Corruption { block: u64, detail: String },

    /// Structurally invalid input handed to the core (bad checkpoint image,
    /// wrong buffer sizes, out-of-range device access).
    #[error("invalid on-disk format: {0}")]
    Format(String),

    /// Parse-layer error surfaced without block context, e.g. a malformed
    /// NAT journal region in the checkpoint image.
    #[error("parse error: {0}")]
    Parse(String),

    /// NAT geometry or tuning options are out of range.
    #[error("invalid geometry: {0}")]
    InvalidGeometry(String),

    /// A node id outside the NAT was requested.
    #[error("nid {nid} out of range (max_nid {max_nid})")]
    InvalidNid { nid: u32, max_nid: u32 },

    /// The free nid pool is empty and a scan did not find any.
    ///
    /// Callers may retry after more NAT blocks have been scanned or after
    /// the next checkpoint returns freed nids to the pool.
    #[error("free nid pool exhausted; retry after scan")]
    PoolExhausted,

    /// A nid was about to be handed out while already allocated.
    ///
    /// This is a programming error; it is reported instead of panicking so
    /// the caller can stop the mount cleanly.
    #[error("nid {nid} allocated twice")]
    DoubleAllocation { nid: u32 },

    /// Named object (node block, cache entry) does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// Device is read-only and a write was attempted.
    #[error("read-only device")]
    ReadOnly,
}

impl FfsError {
    /// Convert this error into a POSIX errno suitable for FUSE replies.
    ///
    /// The match is exhaustive so a new variant cannot ship without an errno.
    #[must_use]
    pub fn to_errno(&self) -> libc::c_int {
        match self {
            Self::Io(err) => err.raw_os_error().unwrap_or(libc::EIO),
            Self::Corruption { .. } | Self::DoubleAllocation { .. } => libc::EIO,
            Self::Format(_)
            | Self::Parse(_)
            | Self::InvalidGeometry(_)
            | Self::InvalidNid { .. } => libc::EINVAL,
            Self::PoolExhausted => libc::EAGAIN,
            Self::NotFound(_) => libc::ENOENT,
            Self::ReadOnly => libc::EROFS,
        }
    }

    /// Whether the error reports inconsistent on-disk metadata rather than
    /// a failed device operation.
    #[must_use]
    pub fn is_corruption(&self) -> bool {
        matches!(self, Self::Corruption { .. })
    }

    /// Whether the caller has a defined local recovery path.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::PoolExhausted)
    }
}

/// Result alias using `FfsError`.
pub type Result<T> = std::result::Result<T, FfsError>;
