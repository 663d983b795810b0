//! # ByteHeap - Append-Only Byte Storage
//!
//! A growable heap of raw bytes over a [`Sheet`], with a monotonically
//! growing tail pointer. Appends return the old tail as a stable offset;
//! bytes are never freed individually (reclamation is a whole-table
//! compaction concern, outside this type).
//!
//! The tail itself is in-memory state: owners that need it across reopen
//! (symbol tables, the store's aux heap) persist it in their meta sidecars
//! and pass it back through [`ByteHeap::open`].

use std::path::Path;

use eyre::{ensure, Result, WrapErr};

use super::Sheet;

pub struct ByteHeap {
    sheet: Sheet,
    tail: u64,
}

impl ByteHeap {
    /// Opens the heap file with at least `capacity` bytes mapped, resuming
    /// at `tail` (0 for a fresh heap).
    pub fn open<P: AsRef<Path>>(path: P, capacity: u64, tail: u64) -> Result<Self> {
        let sheet = Sheet::open(&path, capacity.max(tail.max(1)))
            .wrap_err_with(|| format!("failed to open heap '{}'", path.as_ref().display()))?;
        Ok(Self { sheet, tail })
    }

    /// Appends `bytes` at the tail and returns their start offset. Grows
    /// the underlying sheet transparently on capacity shortfall.
    pub fn append(&mut self, bytes: &[u8]) -> Result<u64> {
        let start = self.tail;
        let needed = start + bytes.len() as u64;
        if needed > self.sheet.capacity() {
            self.sheet.grow(needed.max(self.sheet.capacity() * 2))?;
        }

        if !bytes.is_empty() {
            let ptr = self.sheet.handle(start)?;
            // SAFETY: the sheet was grown to hold `needed` bytes, so the
            // destination range is inside the mapping; append holds &mut
            // self, serializing all tail writes.
            unsafe { std::ptr::copy_nonoverlapping(bytes.as_ptr(), ptr, bytes.len()) };
        }

        self.tail = needed;
        Ok(start)
    }

    /// Bounds-checked read of `len` bytes at `offset`. Only bytes below the
    /// tail are meaningful.
    pub fn read(&self, offset: u64, len: usize) -> Result<&[u8]> {
        ensure!(
            offset + len as u64 <= self.tail,
            "heap read {}..{} beyond tail {}",
            offset,
            offset + len as u64,
            self.tail
        );
        self.sheet.slice(offset, len)
    }

    pub fn tail(&self) -> u64 {
        self.tail
    }

    pub fn flush(&self) -> Result<()> {
        self.sheet.flush()
    }
}
