//! # Column - Typed Fixed-Width View
//!
//! A `Column<T>` owns no memory. It borrows a [`Sheet`] and interprets it as
//! a dense array of fixed-width elements starting at a base offset.
//!
//! ## Write Semantics
//!
//! `freeze()` performs an atomic exchange for 4- and 8-byte element sizes
//! (last-writer-wins under concurrent freezes, safe without the store lock).
//! Any other element size is a plain unaligned store, and the caller must
//! hold the store's write lock for it.
//!
//! `peek()` is an unsynchronized read. For word-sized elements that is
//! race-tolerant (you observe some previously frozen value); for wider
//! elements the caller must hold the lock to avoid torn reads.
//!
//! ## Bounds
//!
//! `base + index * size + size` must not exceed the sheet capacity. A
//! violation is a capacity error the caller resolves by growing the sheet
//! first, then re-deriving the view.

use std::marker::PhantomData;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use eyre::{ensure, eyre, Result};
use zerocopy::{FromBytes, Immutable, IntoBytes};

use super::Sheet;

pub struct Column<'a, T> {
    sheet: &'a Sheet,
    base: u64,
    _marker: PhantomData<T>,
}

impl<'a, T> Column<'a, T>
where
    T: FromBytes + IntoBytes + Immutable + Copy,
{
    /// View over the whole sheet, element 0 at offset 0.
    pub fn new(sheet: &'a Sheet) -> Self {
        Self::at(sheet, 0)
    }

    /// View starting at `base` bytes into the sheet.
    pub fn at(sheet: &'a Sheet, base: u64) -> Self {
        Self {
            sheet,
            base,
            _marker: PhantomData,
        }
    }

    #[inline]
    fn offset_of(&self, index: u64) -> Result<u64> {
        let size = size_of::<T>() as u64;
        let end = index
            .checked_mul(size)
            .and_then(|at| at.checked_add(self.base))
            .and_then(|at| at.checked_add(size))
            .ok_or_else(|| eyre!("column index {} overflows the address space", index))?;
        ensure!(
            end <= self.sheet.capacity(),
            "column index {} (element size {}) exceeds sheet capacity {}; grow the sheet first",
            index,
            size,
            self.sheet.capacity()
        );
        Ok(end - size)
    }

    /// Unsynchronized read of the element at `index`.
    #[inline]
    pub fn peek(&self, index: u64) -> Result<T> {
        let offset = self.offset_of(index)?;
        let ptr = self.sheet.handle(offset)?;
        // SAFETY: offset_of verified that `size_of::<T>()` bytes starting at
        // `ptr` lie inside the mapping, and T: FromBytes makes any bit
        // pattern a valid value. read_unaligned has no alignment requirement.
        Ok(unsafe { std::ptr::read_unaligned(ptr as *const T) })
    }

    /// Writes the element at `index`. Atomic exchange for 4/8-byte element
    /// sizes; plain store otherwise (caller holds the write lock).
    #[inline]
    pub fn freeze(&self, index: u64, value: T) -> Result<()> {
        let offset = self.offset_of(index)?;
        let ptr = self.sheet.handle(offset)?;

        match size_of::<T>() {
            8 => {
                // SAFETY: the destination is 8 bytes inside the mapping and
                // 8-aligned (page-aligned base, base offsets are multiples
                // of 8 for 8-byte elements). The source reinterpret is a
                // same-size unaligned read of a T that is IntoBytes.
                unsafe {
                    let word = std::ptr::read_unaligned(&value as *const T as *const u64);
                    (*(ptr as *const AtomicU64)).swap(word, Ordering::AcqRel);
                }
            }
            4 => {
                // SAFETY: as above, with a 4-byte word and 4-byte alignment.
                unsafe {
                    let word = std::ptr::read_unaligned(&value as *const T as *const u32);
                    (*(ptr as *const AtomicU32)).swap(word, Ordering::AcqRel);
                }
            }
            _ => {
                // SAFETY: bounds were checked by offset_of; non-word writes
                // are serialized by the caller's write lock.
                unsafe { std::ptr::write_unaligned(ptr as *mut T, value) }
            }
        }

        Ok(())
    }

    pub fn element_size(&self) -> usize {
        size_of::<T>()
    }
}
