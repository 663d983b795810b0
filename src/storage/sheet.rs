//! # Sheet - Memory-Mapped Byte Region
//!
//! A `Sheet` owns one file mapping: it creates or reuses a backing file,
//! rounds the requested capacity up to [`SHEET_ALIGNMENT`], and maps the
//! whole file read-write. All higher storage types (columns, bitsets, heaps)
//! are views over a Sheet.
//!
//! ## Growth
//!
//! `grow()` flushes, extends the backing file, and remaps. Capacity only
//! ever grows; a smaller request is a no-op. Because `grow` takes
//! `&mut self`, the borrow checker guarantees no live view references the
//! old mapping - re-deriving addresses per operation instead of caching
//! them is what makes this safe, and it is the contract every caller
//! follows.
//!
//! ## Durability
//!
//! `flush()` forces mapped pages to storage with msync. The OS may write
//! dirty pages back at any time before that; crash safety for logical
//! records is the WAL's job, not the Sheet's.

use std::fs::OpenOptions;
use std::path::{Path, PathBuf};

use eyre::{ensure, Result, WrapErr};
use memmap2::MmapMut;

use crate::config::SHEET_ALIGNMENT;

pub struct Sheet {
    path: PathBuf,
    file: std::fs::File,
    mmap: MmapMut,
    base: *mut u8,
    capacity: u64,
}

// SAFETY: Sheet hands out raw pointers into its mapping, but every mutation
// through a shared reference is either a word-sized atomic (Column/Bitset)
// or serialized by the store's write lock. grow() takes &mut self, so the
// base pointer can never be invalidated while another thread holds a view.
unsafe impl Send for Sheet {}
unsafe impl Sync for Sheet {}

impl Sheet {
    /// Creates or reuses the backing file at `path`, rounds `requested_capacity`
    /// up to the alignment unit, and maps it read-write. An existing larger
    /// file is never shrunk.
    pub fn open<P: AsRef<Path>>(path: P, requested_capacity: u64) -> Result<Self> {
        let path = path.as_ref();

        ensure!(requested_capacity > 0, "sheet capacity must be non-zero");

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .wrap_err_with(|| format!("failed to open sheet file '{}'", path.display()))?;

        let aligned = align_up(requested_capacity);
        let existing = file
            .metadata()
            .wrap_err_with(|| format!("failed to stat sheet file '{}'", path.display()))?
            .len();

        // Never shrink: a reopened sheet keeps whatever it grew to.
        let capacity = aligned.max(align_up(existing.max(1)));
        if existing < capacity {
            file.set_len(capacity)
                .wrap_err_with(|| format!("failed to size sheet to {} bytes", capacity))?;
        }

        // SAFETY: MmapMut::map_mut is unsafe because externally modified
        // files lead to undefined behavior. This is safe because:
        // 1. Sheet files belong to this store and are not shared with
        //    external writers.
        // 2. The file was just sized to `capacity`, so the mapping covers
        //    only valid file bytes.
        // 3. The mapping's lifetime is tied to the Sheet; `base` is
        //    re-derived after every remap.
        let mut mmap = unsafe {
            MmapMut::map_mut(&file)
                .wrap_err_with(|| format!("failed to memory-map '{}'", path.display()))?
        };
        let base = mmap.as_mut_ptr();

        Ok(Self {
            path: path.to_path_buf(),
            file,
            mmap,
            base,
            capacity,
        })
    }

    /// Raw pointer to `offset`. Valid only until the next `grow()`; callers
    /// must re-derive it per operation and never store it.
    #[inline]
    pub fn handle(&self, offset: u64) -> Result<*mut u8> {
        ensure!(
            offset < self.capacity,
            "offset {} out of bounds for sheet '{}' (capacity {})",
            offset,
            self.path.display(),
            self.capacity
        );
        // SAFETY: offset was bounds-checked against the mapped capacity.
        Ok(unsafe { self.base.add(offset as usize) })
    }

    /// Bounds-checked immutable slice of the mapping.
    #[inline]
    pub fn slice(&self, offset: u64, len: usize) -> Result<&[u8]> {
        ensure!(
            offset + len as u64 <= self.capacity,
            "range {}..{} out of bounds for sheet '{}' (capacity {})",
            offset,
            offset + len as u64,
            self.path.display(),
            self.capacity
        );
        // SAFETY: the range was bounds-checked and the returned lifetime is
        // tied to &self, so it cannot outlive the mapping or span a grow.
        Ok(unsafe { std::slice::from_raw_parts(self.base.add(offset as usize), len) })
    }

    /// Flushes, extends the backing file, and remaps. Existing handles are
    /// invalidated, which the `&mut self` receiver enforces at compile time.
    ///
    /// The backing file is re-stated first: another handle on the same path
    /// may already have extended it, and the file is never shrunk below
    /// that length.
    pub fn grow(&mut self, new_capacity: u64) -> Result<()> {
        let actual = self
            .file
            .metadata()
            .wrap_err_with(|| format!("failed to stat sheet file '{}'", self.path.display()))?
            .len();
        let target = align_up(new_capacity).max(align_up(actual.max(1)));
        if target <= self.capacity {
            return Ok(());
        }

        self.mmap
            .flush()
            .wrap_err("failed to flush sheet before grow")?;

        if target > actual {
            self.file
                .set_len(target)
                .wrap_err_with(|| format!("failed to extend sheet to {} bytes", target))?;
        }

        // SAFETY: the old mapping is dropped on assignment; no view can be
        // live across this call because grow() holds &mut self. The file
        // now spans at least `target` bytes.
        self.mmap = unsafe {
            MmapMut::map_mut(&self.file)
                .wrap_err_with(|| format!("failed to remap '{}' after grow", self.path.display()))?
        };
        self.base = self.mmap.as_mut_ptr();
        self.capacity = target;

        Ok(())
    }

    /// Remaps if another handle on the same path extended the backing file
    /// past this handle's mapping.
    pub fn refresh(&mut self) -> Result<()> {
        self.grow(self.capacity)
    }

    /// Forces mapped pages to durable storage.
    pub fn flush(&self) -> Result<()> {
        self.mmap
            .flush()
            .wrap_err_with(|| format!("failed to flush sheet '{}'", self.path.display()))
    }

    /// Hints the kernel that `offset..offset+len` will be read soon.
    pub fn prefetch(&self, offset: u64, len: u64) {
        if offset >= self.capacity {
            return;
        }
        let len = len.min(self.capacity - offset);

        #[cfg(unix)]
        // SAFETY: madvise with MADV_WILLNEED is a kernel hint; the range was
        // clamped to the mapped capacity above, so it lies inside the mapping.
        unsafe {
            libc::madvise(
                self.base.add(offset as usize) as *mut libc::c_void,
                len as usize,
                libc::MADV_WILLNEED,
            );
        }
        #[cfg(not(unix))]
        let _ = len;
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[inline]
fn align_up(bytes: u64) -> u64 {
    (bytes + SHEET_ALIGNMENT - 1) & !(SHEET_ALIGNMENT - 1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn open_rounds_capacity_to_alignment() {
        let dir = tempdir().unwrap();
        let sheet = Sheet::open(dir.path().join("a.col"), 1).unwrap();

        assert_eq!(sheet.capacity(), SHEET_ALIGNMENT);
    }

    #[test]
    fn open_fails_for_missing_directory() {
        let dir = tempdir().unwrap();
        let result = Sheet::open(dir.path().join("missing").join("a.col"), 1024);

        assert!(result.is_err());
    }

    #[test]
    fn handle_rejects_out_of_bounds_offset() {
        let dir = tempdir().unwrap();
        let sheet = Sheet::open(dir.path().join("a.col"), 1024).unwrap();

        assert!(sheet.handle(0).is_ok());
        assert!(sheet.handle(sheet.capacity() - 1).is_ok());
        assert!(sheet.handle(sheet.capacity()).is_err());
    }

    #[test]
    fn grow_extends_and_preserves_data() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("a.col");
        let mut sheet = Sheet::open(&path, 1024).unwrap();

        // SAFETY: test-only raw write inside the mapped capacity.
        unsafe {
            *sheet.handle(0).unwrap() = 0xAB;
            *sheet.handle(100).unwrap() = 0xCD;
        }

        sheet.grow(SHEET_ALIGNMENT * 3).unwrap();

        assert_eq!(sheet.capacity(), SHEET_ALIGNMENT * 3);
        assert_eq!(sheet.slice(0, 1).unwrap()[0], 0xAB);
        assert_eq!(sheet.slice(100, 1).unwrap()[0], 0xCD);
    }

    #[test]
    fn grow_with_smaller_capacity_is_noop() {
        let dir = tempdir().unwrap();
        let mut sheet = Sheet::open(dir.path().join("a.col"), SHEET_ALIGNMENT * 2).unwrap();

        sheet.grow(1).unwrap();

        assert_eq!(sheet.capacity(), SHEET_ALIGNMENT * 2);
    }

    #[test]
    fn stale_handle_grow_never_shrinks_the_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("a.col");

        let mut fresh = Sheet::open(&path, 1024).unwrap();
        let mut stale = Sheet::open(&path, 1024).unwrap();

        fresh.grow(SHEET_ALIGNMENT * 4).unwrap();

        // The stale handle asks for less than the file already holds; it
        // must follow the file, not truncate it.
        stale.grow(SHEET_ALIGNMENT * 2).unwrap();
        assert_eq!(stale.capacity(), SHEET_ALIGNMENT * 4);
        assert_eq!(
            std::fs::metadata(&path).unwrap().len(),
            SHEET_ALIGNMENT * 4
        );
    }

    #[test]
    fn refresh_follows_growth_by_another_handle() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("a.col");

        let mut writer = Sheet::open(&path, 1024).unwrap();
        let mut reader = Sheet::open(&path, 1024).unwrap();

        writer.grow(SHEET_ALIGNMENT * 3).unwrap();
        // SAFETY: test-only raw write inside the mapped capacity.
        unsafe {
            *writer.handle(SHEET_ALIGNMENT * 2).unwrap() = 0x7E;
        }

        assert!(reader.slice(SHEET_ALIGNMENT * 2, 1).is_err());
        reader.refresh().unwrap();
        assert_eq!(reader.capacity(), SHEET_ALIGNMENT * 3);
        assert_eq!(reader.slice(SHEET_ALIGNMENT * 2, 1).unwrap()[0], 0x7E);
    }

    #[test]
    fn reopen_keeps_grown_capacity_and_bytes() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("a.col");

        {
            let mut sheet = Sheet::open(&path, 1024).unwrap();
            sheet.grow(SHEET_ALIGNMENT * 2).unwrap();
            // SAFETY: test-only raw write inside the mapped capacity.
            unsafe {
                *sheet.handle(SHEET_ALIGNMENT).unwrap() = 0x42;
            }
            sheet.flush().unwrap();
        }

        let sheet = Sheet::open(&path, 1024).unwrap();
        assert_eq!(sheet.capacity(), SHEET_ALIGNMENT * 2);
        assert_eq!(sheet.slice(SHEET_ALIGNMENT, 1).unwrap()[0], 0x42);
    }
}
