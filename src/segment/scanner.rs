//! # Segmented Scanner
//!
//! Memory-maps a data file and its sibling index file and serves pruned
//! scans and in-place updates. For each segment the stored bitmask is
//! checked against the query mask first; only surviving segments are
//! scanned record-by-record. A zero query mask means "match everything,
//! verify everything" - no segment may be skipped.
//!
//! Segment ranges are independent, so [`SegmentScanner::par_search`] scans
//! them concurrently with rayon and returns exactly the same record set as
//! the serial path, in the same segment order.

use std::fs::OpenOptions;
use std::path::Path;

use eyre::{ensure, Result, WrapErr};
use memmap2::MmapMut;
use rayon::prelude::*;
use zerocopy::{FromBytes, Immutable, IntoBytes};

use super::{index_path, SegmentHeader, SEGMENT_HEADER_SIZE, SEGMENT_SIZE};

pub struct SegmentScanner<R, F>
where
    R: FromBytes + IntoBytes + Immutable + Copy,
    F: Fn(&R) -> u64,
{
    data: MmapMut,
    index: MmapMut,
    record_count: usize,
    segment_count: usize,
    mask_fn: F,
    _marker: std::marker::PhantomData<R>,
}

impl<R, F> SegmentScanner<R, F>
where
    R: FromBytes + IntoBytes + Immutable + Copy,
    F: Fn(&R) -> u64,
{
    /// Opens a data file written by a `SegmentWriter` together with its
    /// index file. `mask_fn` must be the same tag function the writer used;
    /// updates use it to recompute changed records' bits.
    pub fn open<P: AsRef<Path>>(data_path: P, mask_fn: F) -> Result<Self> {
        let data_path = data_path.as_ref();
        let idx_path = index_path(data_path);
        let record_size = size_of::<R>();

        let data_file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(data_path)
            .wrap_err_with(|| format!("failed to open data file '{}'", data_path.display()))?;
        let idx_file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&idx_path)
            .wrap_err_with(|| format!("failed to open index file '{}'", idx_path.display()))?;

        let data_len = data_file.metadata()?.len() as usize;
        let idx_len = idx_file.metadata()?.len() as usize;

        ensure!(record_size > 0, "zero-sized record types are not supported");
        ensure!(
            data_len % record_size == 0,
            "data file '{}' length {} is not a multiple of record size {}",
            data_path.display(),
            data_len,
            record_size
        );
        let record_count = data_len / record_size;
        let segment_count = idx_len / SEGMENT_HEADER_SIZE;
        ensure!(
            segment_count == record_count.div_ceil(SEGMENT_SIZE),
            "index file '{}' has {} headers but the data file holds {} records; \
             the files are out of lock-step",
            idx_path.display(),
            segment_count,
            record_count
        );

        // An empty writer legitimately produces zero-length files; a file
        // mapping needs at least one byte, so those get a placeholder
        // anonymous page that the zero counts keep unreachable.
        // SAFETY: both files belong to this store, were just sized by the
        // writer, and all access below is bounds-derived from the lengths
        // captured here. The mappings live as long as the scanner.
        let data = if data_len == 0 {
            MmapMut::map_anon(1).wrap_err("failed to map placeholder page")?
        } else {
            unsafe {
                MmapMut::map_mut(&data_file)
                    .wrap_err_with(|| format!("failed to map '{}'", data_path.display()))?
            }
        };
        let index = if idx_len == 0 {
            MmapMut::map_anon(1).wrap_err("failed to map placeholder page")?
        } else {
            unsafe {
                MmapMut::map_mut(&idx_file)
                    .wrap_err_with(|| format!("failed to map '{}'", idx_path.display()))?
            }
        };

        Ok(Self {
            data,
            index,
            record_count,
            segment_count,
            mask_fn,
            _marker: std::marker::PhantomData,
        })
    }

    #[inline]
    fn record(&self, idx: usize) -> R {
        let size = size_of::<R>();
        // SAFETY: callers iterate idx < record_count, and open() verified
        // record_count * size == data length. read_unaligned imposes no
        // alignment requirement and R: FromBytes accepts any bit pattern.
        unsafe { std::ptr::read_unaligned(self.data.as_ptr().add(idx * size) as *const R) }
    }

    #[inline]
    fn segment_bounds(&self, segment: usize) -> (usize, usize) {
        let start = segment * SEGMENT_SIZE;
        (start, (start + SEGMENT_SIZE).min(self.record_count))
    }

    /// Stored bitmask of segment `s`.
    pub fn segment_mask(&self, segment: usize) -> Result<u64> {
        ensure!(
            segment < self.segment_count,
            "segment {} out of bounds (count {})",
            segment,
            self.segment_count
        );
        let at = segment * SEGMENT_HEADER_SIZE;
        let header = SegmentHeader::read_from_bytes(&self.index[at..at + SEGMENT_HEADER_SIZE])
            .map_err(|_| eyre::eyre!("malformed segment header {}", segment))?;
        Ok(header.bitmask)
    }

    fn store_mask(&mut self, segment: usize, mask: u64) {
        let at = segment * SEGMENT_HEADER_SIZE;
        let header = SegmentHeader { bitmask: mask };
        self.index[at..at + SEGMENT_HEADER_SIZE].copy_from_slice(header.as_bytes());
    }

    #[inline]
    fn prune(&self, segment: usize, query_mask: u64) -> Result<bool> {
        Ok(query_mask != 0 && self.segment_mask(segment)? & query_mask == 0)
    }

    /// Collects every record in a surviving segment that satisfies
    /// `predicate`. Segments whose mask shares no bit with a nonzero
    /// `query_mask` are skipped whole.
    pub fn search<P>(&self, query_mask: u64, predicate: P) -> Result<Vec<R>>
    where
        P: Fn(&R) -> bool,
    {
        let mut results = Vec::new();
        for segment in 0..self.segment_count {
            if self.prune(segment, query_mask)? {
                continue;
            }
            let (start, end) = self.segment_bounds(segment);
            for idx in start..end {
                let record = self.record(idx);
                if predicate(&record) {
                    results.push(record);
                }
            }
        }
        Ok(results)
    }

    /// Parallel variant of [`search`](Self::search): segments are scanned
    /// concurrently, results keep segment order.
    pub fn par_search<P>(&self, query_mask: u64, predicate: P) -> Result<Vec<R>>
    where
        P: Fn(&R) -> bool + Sync,
        R: Send + Sync,
        F: Sync,
    {
        let per_segment: Vec<Result<Vec<R>>> = (0..self.segment_count)
            .into_par_iter()
            .map(|segment| {
                if self.prune(segment, query_mask)? {
                    return Ok(Vec::new());
                }
                let (start, end) = self.segment_bounds(segment);
                let mut hits = Vec::new();
                for idx in start..end {
                    let record = self.record(idx);
                    if predicate(&record) {
                        hits.push(record);
                    }
                }
                Ok(hits)
            })
            .collect();

        let mut results = Vec::new();
        for hits in per_segment {
            results.extend(hits?);
        }
        Ok(results)
    }

    /// Applies `mutate` in place to every record matching `predicate` in
    /// surviving segments, then ORs the changed records' recomputed tag
    /// bits back into the segment mask. Masks never shrink here; a full
    /// [`rebuild_masks`](Self::rebuild_masks) is the explicit compaction
    /// pass that makes them exact again.
    pub fn apply_update<P, M>(&mut self, query_mask: u64, predicate: P, mutate: M) -> Result<u64>
    where
        P: Fn(&R) -> bool,
        M: Fn(&mut R),
    {
        let size = size_of::<R>();
        let mut updated = 0u64;

        for segment in 0..self.segment_count {
            if self.prune(segment, query_mask)? {
                continue;
            }
            let (start, end) = self.segment_bounds(segment);
            let mut new_bits = 0u64;
            let mut touched = false;

            for idx in start..end {
                let mut record = self.record(idx);
                if predicate(&record) {
                    mutate(&mut record);
                    self.data[idx * size..(idx + 1) * size].copy_from_slice(record.as_bytes());
                    new_bits |= (self.mask_fn)(&record);
                    touched = true;
                    updated += 1;
                }
            }

            if touched {
                let mask = self.segment_mask(segment)?;
                self.store_mask(segment, mask | new_bits);
            }
        }

        Ok(updated)
    }

    /// Recomputes every segment mask from its records, discarding bits left
    /// over from updates. The only operation allowed to tighten a mask.
    pub fn rebuild_masks(&mut self) -> Result<()> {
        for segment in 0..self.segment_count {
            let (start, end) = self.segment_bounds(segment);
            let mut mask = 0u64;
            for idx in start..end {
                mask |= (self.mask_fn)(&self.record(idx));
            }
            self.store_mask(segment, mask);
        }
        Ok(())
    }

    /// Flushes both mappings to storage.
    pub fn flush(&self) -> Result<()> {
        // Placeholder pages of an empty scanner back no file.
        if self.record_count == 0 {
            return Ok(());
        }
        self.data.flush().wrap_err("failed to flush segment data")?;
        self.index.flush().wrap_err("failed to flush segment index")
    }

    pub fn record_count(&self) -> usize {
        self.record_count
    }

    pub fn segment_count(&self) -> usize {
        self.segment_count
    }
}
