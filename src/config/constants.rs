//! # Stratum Configuration Constants
//!
//! All sizing and format constants live here. Several values depend on each
//! other; check the notes below before changing one in isolation.
//!
//! ```text
//! SHEET_ALIGNMENT (64 KiB)
//!       │
//!       └─> Every Sheet capacity is rounded up to this unit, so a bitset
//!           word (8 bytes) never spans a sheet boundary.
//!
//! SEGMENT_SIZE (4096 records)
//!       │
//!       └─> SEGMENT_HEADER_SIZE (8 bytes per segment)
//!             Index file length / 8 == segment count; data file length /
//!             record_size == record count. The writer keeps both files in
//!             lock-step per segment.
//!
//! BLOCK_HEADER_SIZE (64 bytes)
//!       │
//!       └─> BLOCK_COUNT_OFFSET (16) must stay 8-byte aligned: the record
//!           count is read and written atomically through the mapping.
//!
//! WAL_HEADER_SIZE (20 bytes, packed)
//!       │
//!       └─> magic(4) + tx_id(8) + payload_len(4) + crc32(4)
//! ```

// ============================================================================
// SHEET SIZING
// ============================================================================

/// Alignment unit for Sheet capacities. Every backing file is sized to a
/// multiple of this, which keeps 8-byte bitset words inside one mapping.
pub const SHEET_ALIGNMENT: u64 = 64 * 1024;

/// Default capacity for a fixed-width column sheet.
pub const DEFAULT_COLUMN_CAPACITY: u64 = 1024 * 1024;

/// Default capacity for a symbol heap sheet. Symbol heaps grow fastest, so
/// they start larger than plain columns.
pub const DEFAULT_HEAP_CAPACITY: u64 = 4 * 1024 * 1024;

/// Default capacity for a bloom filter sheet (512 KiB = 4M bits).
pub const DEFAULT_BLOOM_CAPACITY: u64 = 512 * 1024;

/// Default capacity for a store's record block.
pub const DEFAULT_BLOCK_CAPACITY: u64 = 10 * 1024 * 1024;

// ============================================================================
// SEGMENT INDEX
// ============================================================================

/// Records per segment. One 64-bit bitmask header covers this many
/// consecutive records.
pub const SEGMENT_SIZE: usize = 4096;

/// Bytes per segment header in the index file.
pub const SEGMENT_HEADER_SIZE: usize = 8;

// ============================================================================
// RECORD BLOCK
// ============================================================================

/// Size of the block file header preceding the record array.
pub const BLOCK_HEADER_SIZE: usize = 64;

/// Byte offset of the embedded record count inside the block header.
/// Must be 8-byte aligned for atomic access through the mapping.
pub const BLOCK_COUNT_OFFSET: usize = 16;

/// Magic for record block files ("STRBLK01").
pub const BLOCK_MAGIC: u64 = 0x5354_5242_4c4b_3031;

// ============================================================================
// DURABILITY LOG
// ============================================================================

/// Magic prefix of every log entry: "ICEW".
pub const WAL_MAGIC: u32 = 0x4943_4557;

/// Size of the packed entry header.
pub const WAL_HEADER_SIZE: usize = 20;

// ============================================================================
// META SIDECARS
// ============================================================================

/// Magic for symbol table meta sidecars ("STRSYM01").
pub const SYMBOL_META_MAGIC: u64 = 0x5354_5253_594d_3031;

/// Magic for store meta sidecars ("STRSTO01").
pub const STORE_META_MAGIC: u64 = 0x5354_5253_544f_3031;

/// On-disk format version written into every meta sidecar.
pub const FORMAT_VERSION: u32 = 1;

// Compile-time invariants. A misaligned count word or an alignment unit that
// is not a multiple of the OS page size would corrupt data silently.
const _: () = assert!(SHEET_ALIGNMENT % 4096 == 0);
const _: () = assert!(BLOCK_COUNT_OFFSET % 8 == 0);
const _: () = assert!(BLOCK_COUNT_OFFSET + 8 <= BLOCK_HEADER_SIZE);
const _: () = assert!(SEGMENT_SIZE.is_power_of_two());
