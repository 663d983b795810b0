//! # Storage Primitives
//!
//! The foundational memory-mapped storage layer. Everything else in the
//! crate is a view over these primitives.
//!
//! ## Components
//!
//! - [`Sheet`]: a capacity-aligned, growable memory-mapped byte region
//!   backing one file. The only type that owns a mapping.
//! - [`Column`]: typed fixed-width array view over a Sheet, with an atomic
//!   write path for 4- and 8-byte elements.
//! - [`BitsetColumn`]: 1-bit-per-index view with atomic set/clear.
//! - [`ByteHeap`]: append-only byte heap with a monotonically growing tail.
//!
//! ## Safety Model
//!
//! A mapped address is only valid until the next `grow()`, which remaps the
//! file. Rather than hazard pointers or epoch tracking, the hazard is pushed
//! to the borrow checker:
//!
//! ```text
//! Column::new(&sheet)        // immutable borrow of the sheet
//! Sheet::grow(&mut self)     // exclusive borrow
//! ```
//!
//! Views are cheap and re-derived per operation; holding one across a grow
//! is a compile error. Callers that need raw addresses obtain them fresh
//! from the owning Sheet and never store them.
//!
//! ## Concurrency
//!
//! `Sheet` is `Send + Sync`: word-sized writes go through atomics
//! ([`Column::freeze`], [`BitsetColumn::make`]), and everything wider is
//! guarded by the store's reader/writer lock. Growth requires `&mut Sheet`,
//! so it can never race a concurrent view.

mod bitset;
mod column;
mod heap;
mod sheet;

pub use bitset::BitsetColumn;
pub use column::Column;
pub use heap::ByteHeap;
pub use sheet::Sheet;
