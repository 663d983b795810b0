//! # BitsetColumn - One Bit Per Index
//!
//! A 1-bit-per-index view over a [`Sheet`]. Bit `i` lives in the 64-bit word
//! at byte offset `(i >> 6) * 8`, position `i & 63`. Because sheet
//! capacities are multiples of the 64 KiB alignment unit, a word never
//! spans a sheet boundary.
//!
//! `make`/`brk` are atomic or/and-not on the containing word and are safe
//! without the store lock. `is_active` is an unsynchronized read with
//! "probably set" semantics: the bloom filter built on top of it tolerates
//! false positives, and `make` happens-before any dependent read, so there
//! are never false negatives.

use std::sync::atomic::{AtomicU64, Ordering};

use eyre::{ensure, Result};

use super::Sheet;

pub struct BitsetColumn<'a> {
    sheet: &'a Sheet,
}

impl<'a> BitsetColumn<'a> {
    pub fn new(sheet: &'a Sheet) -> Self {
        Self { sheet }
    }

    /// Total addressable bits: one per mapped byte times eight.
    pub fn capacity_in_bits(&self) -> u64 {
        self.sheet.capacity() * 8
    }

    #[inline]
    fn word_ptr(&self, index: u64) -> Result<*mut u8> {
        let offset = (index >> 6) << 3;
        ensure!(
            offset + 8 <= self.sheet.capacity(),
            "bit index {} exceeds bitset capacity {}",
            index,
            self.capacity_in_bits()
        );
        self.sheet.handle(offset)
    }

    /// Atomically sets bit `index`.
    #[inline]
    pub fn make(&self, index: u64) -> Result<()> {
        let ptr = self.word_ptr(index)?;
        let mask = 1u64 << (index & 63);
        // SAFETY: word_ptr bounds-checked an 8-byte, 8-aligned word inside
        // the mapping (word offsets are multiples of 8 from a page-aligned
        // base).
        unsafe { (*(ptr as *const AtomicU64)).fetch_or(mask, Ordering::AcqRel) };
        Ok(())
    }

    /// Atomically clears bit `index`.
    #[inline]
    pub fn brk(&self, index: u64) -> Result<()> {
        let ptr = self.word_ptr(index)?;
        let mask = !(1u64 << (index & 63));
        // SAFETY: as in make().
        unsafe { (*(ptr as *const AtomicU64)).fetch_and(mask, Ordering::AcqRel) };
        Ok(())
    }

    /// Unsynchronized test of bit `index`. Race-tolerant: a concurrent
    /// `make` may or may not be visible, but a completed `make` always is.
    #[inline]
    pub fn is_active(&self, index: u64) -> Result<bool> {
        let ptr = self.word_ptr(index)?;
        // SAFETY: as in make(); a relaxed atomic load avoids torn reads
        // without imposing ordering.
        let word = unsafe { (*(ptr as *const AtomicU64)).load(Ordering::Relaxed) };
        Ok(word & (1u64 << (index & 63)) != 0)
    }
}
