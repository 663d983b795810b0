//! # Stratum - Embedded Memory-Mapped Columnar Store
//!
//! Stratum is an embedded, file-backed columnar data store. Fixed-width
//! columns live in memory-mapped regions on disk, rows are "shredded" into
//! per-column values at ingestion time, and queries prune large record
//! ranges using per-segment bitmasks before touching individual records.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────┐
//! │      Store façade (scan/update/sum)      │
//! ├──────────────────────────────────────────┤
//! │  Shredder (row → column dispatch)        │
//! ├───────────────┬──────────────────────────┤
//! │ Segment Index │  Symbol Tables + Bloom   │
//! ├───────────────┴──────────────────────────┤
//! │  Column / Bitset / Heap views            │
//! ├──────────────────────────────────────────┤
//! │  Sheet (memory-mapped file) + WAL        │
//! └──────────────────────────────────────────┘
//! ```
//!
//! ## File Layout
//!
//! Each logical table is a directory of flat files:
//!
//! ```text
//! table_dir/
//! ├── records.blk          # Row-major record block (64-byte header)
//! ├── aux.heap             # Variable-length auxiliary text
//! ├── store.meta           # Store meta sidecar (aux heap tail)
//! ├── wal.log              # Append-only durability log
//! ├── city.heap            # Concatenated symbol bytes
//! ├── city.offsets         # i64 heap offset per symbol id
//! ├── city.bloom           # Raw bitset bloom filter
//! └── city.meta            # Symbol count + heap tail
//! ```
//!
//! Columnar ingestion via [`shred::Shredder`] adds one file per registered
//! column (`<name>.col`, `<name>.flags`, `<name>.ids`), and segmented data
//! written through [`segment::SegmentWriter`] pairs each data file with a
//! `.idx` file of 8-byte segment bitmasks.
//!
//! ## Safety Model
//!
//! Memory-mapped regions become invalid when remapped during `grow()`.
//! Stratum pushes that hazard to the borrow checker: all views
//! ([`storage::Column`], [`storage::BitsetColumn`]) borrow their
//! [`storage::Sheet`] immutably and are re-derived per operation, while
//! `Sheet::grow` takes `&mut self`. Holding a view across a grow is a
//! compile error, not a runtime bug.
//!
//! ## Concurrency
//!
//! Two [`store::Store`] handles opened on the same path coordinate through
//! a process-wide [`store::LockRegistry`] keyed by canonical path: writers
//! serialize behind the write half of a `parking_lot::RwLock`, readers run
//! concurrently with each other but never with a writer. Word-sized column
//! and bitset writes are atomic and need no broader lock; anything that
//! reads-then-writes a record holds the write lock.
//!
//! ## Module Overview
//!
//! - [`storage`]: Sheet, Column, BitsetColumn, ByteHeap primitives
//! - [`symbols`]: string-interning symbol table with bloom-filter dedup
//! - [`segment`]: segment bitmask index, segmented writer and scanner
//! - [`shred`]: row-to-column ingestion dispatcher
//! - [`wal`]: append-only checksummed durability log
//! - [`store`]: table façade binding block, heap, symbols and locking
//! - [`simd`]: fixed-width byte equality fast path (AVX2 with scalar fallback)

pub mod config;
pub mod segment;
pub mod shred;
pub mod simd;
pub mod storage;
pub mod store;
pub mod symbols;
pub mod wal;

pub use segment::{SegmentScanner, SegmentWriter};
pub use shred::{FieldDef, FieldKind, Shredder};
pub use storage::{BitsetColumn, ByteHeap, Column, Sheet};
pub use store::{Block, LockRegistry, Store};
pub use symbols::SymbolTable;
pub use wal::{Replay, Wal, WalEntry};
