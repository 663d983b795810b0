//! # Segmented Writer
//!
//! Accepts records one at a time into an in-memory buffer of
//! [`SEGMENT_SIZE`] records. When the buffer fills (or on `close`), the
//! segment's bitmask is computed as the OR of the caller-supplied tag
//! function over all buffered records, the 8-byte header is appended to the
//! index file, and the raw record bytes are appended to the data file -
//! always in that lock-step order, so the index never describes a segment
//! whose data is missing its predecessors.
//!
//! A writer has exclusive ownership of its two files; no segment is ever
//! visited by two writer threads.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use eyre::{Result, WrapErr};
use zerocopy::{Immutable, IntoBytes};

use super::{index_path, SegmentHeader, SEGMENT_SIZE};

pub struct SegmentWriter<R, F>
where
    R: IntoBytes + Immutable + Copy,
    F: Fn(&R) -> u64,
{
    data: BufWriter<File>,
    index: BufWriter<File>,
    buf: Vec<R>,
    mask_fn: F,
    segments: u64,
    records: u64,
}

impl<R, F> SegmentWriter<R, F>
where
    R: IntoBytes + Immutable + Copy,
    F: Fn(&R) -> u64,
{
    /// Creates (truncating) the data file and its sibling index file.
    /// `mask_fn` produces the tag bits of one record.
    pub fn create<P: AsRef<Path>>(data_path: P, mask_fn: F) -> Result<Self> {
        let data_path = data_path.as_ref();
        let idx_path = index_path(data_path);

        let data = File::create(data_path)
            .wrap_err_with(|| format!("failed to create data file '{}'", data_path.display()))?;
        let index = File::create(&idx_path)
            .wrap_err_with(|| format!("failed to create index file '{}'", idx_path.display()))?;

        Ok(Self {
            data: BufWriter::new(data),
            index: BufWriter::new(index),
            buf: Vec::with_capacity(SEGMENT_SIZE),
            mask_fn,
            segments: 0,
            records: 0,
        })
    }

    /// Buffers one record, flushing a full segment when the buffer fills.
    pub fn append(&mut self, record: R) -> Result<()> {
        self.buf.push(record);
        self.records += 1;
        if self.buf.len() >= SEGMENT_SIZE {
            self.flush_segment()?;
        }
        Ok(())
    }

    fn flush_segment(&mut self) -> Result<()> {
        if self.buf.is_empty() {
            return Ok(());
        }

        let mask = self
            .buf
            .iter()
            .fold(0u64, |mask, record| mask | (self.mask_fn)(record));

        let header = SegmentHeader { bitmask: mask };
        self.index
            .write_all(header.as_bytes())
            .wrap_err("failed to append segment header")?;
        self.data
            .write_all(self.buf.as_slice().as_bytes())
            .wrap_err("failed to append segment data")?;

        self.buf.clear();
        self.segments += 1;
        Ok(())
    }

    /// Flushes any partial final segment and syncs both files to storage.
    pub fn close(mut self) -> Result<()> {
        self.flush_segment()?;

        self.data.flush().wrap_err("failed to flush data file")?;
        self.index.flush().wrap_err("failed to flush index file")?;
        self.data
            .get_ref()
            .sync_all()
            .wrap_err("failed to sync data file")?;
        self.index
            .get_ref()
            .sync_all()
            .wrap_err("failed to sync index file")?;
        Ok(())
    }

    pub fn record_count(&self) -> u64 {
        self.records
    }

    pub fn segment_count(&self) -> u64 {
        self.segments
    }
}
