//! Record block: a typed, append-only array of fixed-size records on a
//! [`Sheet`], fronted by a 64-byte header.
//!
//! ## Header Layout
//!
//! ```text
//! offset  size  field
//!      0     8  magic
//!      8     4  format version
//!     12     4  record size
//!     16     8  record count   <- the commit point
//!     24    40  reserved
//! ```
//!
//! The count word is the publication protocol: an appender writes the
//! record bytes first, then stores the incremented count with `Release`.
//! Readers load the count with `Acquire` and only touch records below it,
//! so a record is visible to other handles only after its bytes are.

use std::marker::PhantomData;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

use eyre::{ensure, Result};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::config::{BLOCK_COUNT_OFFSET, BLOCK_HEADER_SIZE, BLOCK_MAGIC, FORMAT_VERSION};
use crate::storage::{Column, Sheet};

#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
struct BlockHeader {
    magic: u64,
    version: u32,
    record_size: u32,
    count: u64,
    _reserved: [u8; 40],
}

const _: () = assert!(std::mem::size_of::<BlockHeader>() == BLOCK_HEADER_SIZE);

/// Typed record array over a sheet. `&mut self` appends, `&self` reads;
/// cross-handle visibility rides on the atomic count word.
pub struct Block<R> {
    sheet: Sheet,
    _marker: PhantomData<R>,
}

impl<R> Block<R>
where
    R: FromBytes + IntoBytes + Immutable + Copy,
{
    /// Opens (or creates) the block at `path`. A fresh file gets a header
    /// stamped; an existing file must carry the right magic, version and
    /// record size.
    pub fn open<P: AsRef<Path>>(path: P, capacity: u64) -> Result<Self> {
        let record_size = std::mem::size_of::<R>();
        ensure!(record_size > 0, "zero-sized record types are not supported");

        let fresh = !path.as_ref().exists();
        let sheet = Sheet::open(path, capacity.max(BLOCK_HEADER_SIZE as u64))?;
        let block = Self {
            sheet,
            _marker: PhantomData,
        };

        if fresh {
            let header = BlockHeader {
                magic: BLOCK_MAGIC,
                version: FORMAT_VERSION,
                record_size: record_size as u32,
                count: 0,
                _reserved: [0; 40],
            };
            let dst = block.sheet.handle(0)?;
            // SAFETY: Sheet::open guarantees at least BLOCK_HEADER_SIZE
            // bytes, and no other handle exists before create returns.
            unsafe {
                std::ptr::copy_nonoverlapping(
                    header.as_bytes().as_ptr(),
                    dst,
                    BLOCK_HEADER_SIZE,
                );
            }
            block.sheet.flush()?;
        } else {
            let bytes = block.sheet.slice(0, BLOCK_HEADER_SIZE)?;
            let header = BlockHeader::read_from_bytes(bytes)
                .map_err(|_| eyre::eyre!("block header is malformed"))?;
            ensure!(
                header.magic == BLOCK_MAGIC,
                "not a record block (magic {:#x})",
                header.magic
            );
            ensure!(
                header.version == FORMAT_VERSION,
                "unsupported block format version {}",
                header.version
            );
            ensure!(
                header.record_size as usize == record_size,
                "block holds {}-byte records but a {}-byte type was requested",
                header.record_size,
                record_size
            );
        }

        Ok(block)
    }

    fn count_word(&self) -> Result<&AtomicU64> {
        let ptr = self.sheet.handle(BLOCK_COUNT_OFFSET as u64)?;
        // SAFETY: the header starts at offset 0 of a page-aligned mapping
        // and BLOCK_COUNT_OFFSET is 8-aligned, so the cast pointer is a
        // valid aligned AtomicU64 for the mapping's lifetime.
        Ok(unsafe { &*(ptr as *const AtomicU64) })
    }

    /// Number of published records. `Acquire` pairs with the `Release`
    /// store in [`append`](Self::append).
    pub fn len(&self) -> Result<u64> {
        Ok(self.count_word()?.load(Ordering::Acquire))
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Remaps when the published count names records beyond this handle's
    /// mapping: another handle grew the file, and the count word travels
    /// through the shared first page ahead of the mapping itself.
    fn ensure_visible(&mut self) -> Result<()> {
        let needed = BLOCK_HEADER_SIZE as u64
            + self.len()?.saturating_mul(std::mem::size_of::<R>() as u64);
        if needed > self.sheet.capacity() {
            self.sheet.refresh()?;
        }
        Ok(())
    }

    /// Appends one record and publishes it. Requires `&mut self`: a single
    /// writer per block, enforced by the store's write lock across handles.
    pub fn append(&mut self, record: R) -> Result<u64> {
        let index = self.count_word()?.load(Ordering::Acquire);
        let record_size = std::mem::size_of::<R>() as u64;
        let needed = BLOCK_HEADER_SIZE as u64 + (index + 1) * record_size;
        if needed > self.sheet.capacity() {
            self.sheet.grow(needed.max(self.sheet.capacity() * 2))?;
        }

        Column::<R>::at(&self.sheet, BLOCK_HEADER_SIZE as u64).freeze(index, record)?;
        // Publish: record bytes are in place before the count moves.
        self.count_word()?.store(index + 1, Ordering::Release);
        Ok(index)
    }

    /// Reads the record at `index`. Fails past the published count.
    pub fn get(&mut self, index: u64) -> Result<R> {
        self.ensure_visible()?;
        let count = self.len()?;
        ensure!(index < count, "record {} out of range ({} held)", index, count);
        Column::<R>::at(&self.sheet, BLOCK_HEADER_SIZE as u64).peek(index)
    }

    /// Overwrites the record at `index` in place.
    pub fn set(&mut self, index: u64, record: R) -> Result<()> {
        self.ensure_visible()?;
        let count = self.len()?;
        ensure!(index < count, "record {} out of range ({} held)", index, count);
        Column::<R>::at(&self.sheet, BLOCK_HEADER_SIZE as u64).freeze(index, record)
    }

    /// The published records as one contiguous byte span.
    pub fn bytes(&mut self) -> Result<&[u8]> {
        self.ensure_visible()?;
        let count = self.len()?;
        self.sheet
            .slice(BLOCK_HEADER_SIZE as u64, count as usize * std::mem::size_of::<R>())
    }

    pub fn flush(&self) -> Result<()> {
        self.sheet.flush()
    }
}
