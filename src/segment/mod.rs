//! # Segment Index
//!
//! Records are grouped into fixed-size segments of [`SEGMENT_SIZE`] (4096)
//! consecutive records. Each segment carries one 64-bit bitmask: the
//! bitwise OR of every contained record's tag bits. Queries consult the
//! mask first and skip a whole segment when it cannot satisfy the query
//! mask - the mask is a superset filter (false positives allowed, false
//! negatives forbidden).
//!
//! ## Lock-Step Layout
//!
//! The data file and the index file are written in lock-step per segment:
//! segment `s` in the index always corresponds exactly to byte range
//! `[s * 4096 * record_size, (s+1) * 4096 * record_size)` in the data
//! file. That correspondence is the invariant that makes pruned scans
//! valid.
//!
//! ## Mask Monotonicity
//!
//! Updates recompute a changed record's tag bits and OR them back into the
//! stored mask. Masks never shrink during normal updates: a record that
//! stops matching a tag leaves the segment mask set until
//! [`SegmentScanner::rebuild_masks`] recomputes every mask from scratch.
//! This is a deliberate conservative-superset policy - pruning stays
//! correct, it just prunes a little less until a rebuild.

mod scanner;
mod writer;

pub use scanner::SegmentScanner;
pub use writer::SegmentWriter;

use std::path::{Path, PathBuf};

use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

pub use crate::config::{SEGMENT_HEADER_SIZE, SEGMENT_SIZE};

/// One 8-byte header per segment: the OR-reduced tag bits of its records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct SegmentHeader {
    pub bitmask: u64,
}

/// Index file path for a data file: same stem, `idx` extension.
pub(crate) fn index_path(data_path: &Path) -> PathBuf {
    let mut path = data_path.to_path_buf();
    path.set_extension("idx");
    path
}
