//! # Symbol Table - String Interning with Bloom-Accelerated Dedup
//!
//! Deduplicates variable-length byte strings into dense u32 IDs assigned in
//! first-seen order. Three mapped files back each table:
//!
//! ```text
//! <name>.heap      concatenated symbol bytes, no delimiters
//! <name>.offsets   one i64 heap start offset per symbol id
//! <name>.bloom     raw bitset bloom filter
//! <name>.meta      32-byte sidecar: symbol count + heap tail
//! ```
//!
//! Heap bytes for symbol `i` run from `offsets[i]` to `offsets[i+1]` (or the
//! heap tail for the last symbol): no two symbols overlap and none are ever
//! freed individually. Reclamation would be a whole-table compaction that
//! rewrites heap and offsets together; it is deliberately not part of this
//! type.
//!
//! ## Dedup Protocol
//!
//! `get_or_add` hashes the bytes (FNV-1a) and tests one bloom bit:
//!
//! - bit clear → the value was never inserted, so it is definitely new:
//!   append and set the bit, no scan.
//! - bit set → the value *might* exist: linear scan of all assigned IDs
//!   comparing length, then bytes; return the match or fall through to the
//!   append path.
//!
//! The filter only ever yields false positives, so correctness never
//! depends on it - only the cost of the scan does. The scan is O(n) per
//! bloom hit; that is acceptable while tables stay within a bounded
//! working set. Larger tables should shard by a cheap key prefix rather
//! than flat-scan, which is a design note, not core behavior.

use std::path::{Path, PathBuf};

use eyre::{bail, ensure, Result, WrapErr};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::config::{
    DEFAULT_BLOOM_CAPACITY, DEFAULT_COLUMN_CAPACITY, DEFAULT_HEAP_CAPACITY, FORMAT_VERSION,
    SYMBOL_META_MAGIC,
};
use crate::storage::{BitsetColumn, ByteHeap, Column, Sheet};

const FNV_SEED: u32 = 2_166_136_261;
const FNV_PRIME: u32 = 16_777_619;

/// 32-bit FNV-1a over a byte string.
#[inline]
pub fn fnv1a(bytes: &[u8]) -> u32 {
    let mut hash = FNV_SEED;
    for &b in bytes {
        hash = (hash ^ b as u32).wrapping_mul(FNV_PRIME);
    }
    hash
}

#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
struct SymbolMeta {
    magic: u64,
    version: u32,
    symbol_count: u32,
    heap_tail: u64,
    _reserved: [u8; 8],
}

pub struct SymbolTable {
    heap: ByteHeap,
    offsets: Sheet,
    bloom: Sheet,
    meta_path: PathBuf,
    next_id: u32,
}

impl SymbolTable {
    /// Opens (or creates) the table named `name` under `dir`, restoring
    /// symbol count and heap tail from the meta sidecar when present.
    pub fn open<P: AsRef<Path>>(dir: P, name: &str) -> Result<Self> {
        let dir = dir.as_ref();
        let meta_path = dir.join(format!("{name}.meta"));
        let (next_id, heap_tail) = read_meta(&meta_path)?;

        let heap = ByteHeap::open(dir.join(format!("{name}.heap")), DEFAULT_HEAP_CAPACITY, heap_tail)?;
        let offsets = Sheet::open(dir.join(format!("{name}.offsets")), DEFAULT_COLUMN_CAPACITY)?;
        let bloom = Sheet::open(dir.join(format!("{name}.bloom")), DEFAULT_BLOOM_CAPACITY)?;

        Ok(Self {
            heap,
            offsets,
            bloom,
            meta_path,
            next_id,
        })
    }

    /// Returns the dense ID for `bytes`, interning them on first sight.
    /// The empty string is a valid, distinct symbol.
    pub fn get_or_add(&mut self, bytes: &[u8]) -> Result<u32> {
        let hash = fnv1a(bytes);
        let bloom = BitsetColumn::new(&self.bloom);
        let bit = hash as u64 % bloom.capacity_in_bits();

        if bloom.is_active(bit)? {
            // Maybe present: the scan decides.
            for id in 0..self.next_id {
                if self.matches(id, bytes)? {
                    return Ok(id);
                }
            }
        }

        self.add(bytes, bit)
    }

    fn add(&mut self, bytes: &[u8], bloom_bit: u64) -> Result<u32> {
        let id = self.next_id;
        let needed = (id as u64 + 1) * 8;
        if needed > self.offsets.capacity() {
            self.offsets.grow(self.offsets.capacity() * 2)?;
        }

        let start = self.heap.tail();
        Column::<i64>::new(&self.offsets).freeze(id as u64, start as i64)?;
        self.heap.append(bytes)?;
        BitsetColumn::new(&self.bloom).make(bloom_bit)?;

        self.next_id += 1;
        Ok(id)
    }

    fn matches(&self, id: u32, bytes: &[u8]) -> Result<bool> {
        let (start, len) = self.extent(id)?;
        if len != bytes.len() {
            return Ok(false);
        }
        Ok(self.heap.read(start, len)? == bytes)
    }

    /// Resolves an ID back to its bytes.
    pub fn symbol(&self, id: u32) -> Result<&[u8]> {
        ensure!(id < self.next_id, "symbol id {} out of range (count {})", id, self.next_id);
        let (start, len) = self.extent(id)?;
        self.heap.read(start, len)
    }

    fn extent(&self, id: u32) -> Result<(u64, usize)> {
        let offsets = Column::<i64>::new(&self.offsets);
        let start = offsets.peek(id as u64)? as u64;
        let end = if id + 1 < self.next_id {
            offsets.peek(id as u64 + 1)? as u64
        } else {
            self.heap.tail()
        };
        ensure!(end >= start, "corrupt offsets for symbol id {}", id);
        Ok((start, (end - start) as usize))
    }

    pub fn len(&self) -> u32 {
        self.next_id
    }

    pub fn is_empty(&self) -> bool {
        self.next_id == 0
    }

    /// Flushes heap, offsets, bloom and the meta sidecar.
    pub fn flush(&self) -> Result<()> {
        self.heap.flush()?;
        self.offsets.flush()?;
        self.bloom.flush()?;

        let meta = SymbolMeta {
            magic: SYMBOL_META_MAGIC,
            version: FORMAT_VERSION,
            symbol_count: self.next_id,
            heap_tail: self.heap.tail(),
            _reserved: [0; 8],
        };
        std::fs::write(&self.meta_path, meta.as_bytes())
            .wrap_err_with(|| format!("failed to write '{}'", self.meta_path.display()))
    }
}

fn read_meta(path: &Path) -> Result<(u32, u64)> {
    if !path.exists() {
        return Ok((0, 0));
    }
    let bytes = std::fs::read(path)
        .wrap_err_with(|| format!("failed to read '{}'", path.display()))?;
    let meta = SymbolMeta::read_from_bytes(&bytes)
        .map_err(|_| eyre::eyre!("malformed symbol meta '{}'", path.display()))?;
    if meta.magic != SYMBOL_META_MAGIC {
        bail!("bad magic in symbol meta '{}'", path.display());
    }
    ensure!(
        meta.version == FORMAT_VERSION,
        "unsupported symbol meta version {} in '{}'",
        meta.version,
        path.display()
    );
    Ok((meta.symbol_count, meta.heap_tail))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn meta_sidecar_is_32_bytes() {
        assert_eq!(std::mem::size_of::<SymbolMeta>(), 32);
    }

    #[test]
    fn fnv1a_distinguishes_close_inputs() {
        assert_ne!(fnv1a(b"alpha"), fnv1a(b"alphb"));
        assert_eq!(fnv1a(b""), FNV_SEED);
    }

    #[test]
    fn get_or_add_is_idempotent() {
        let dir = tempdir().unwrap();
        let mut table = SymbolTable::open(dir.path(), "city").unwrap();

        let a = table.get_or_add(b"amsterdam").unwrap();
        let b = table.get_or_add(b"berlin").unwrap();

        assert_eq!(a, 0);
        assert_eq!(b, 1);
        assert_eq!(table.get_or_add(b"amsterdam").unwrap(), a);
        assert_eq!(table.get_or_add(b"berlin").unwrap(), b);
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn empty_string_is_a_distinct_symbol() {
        let dir = tempdir().unwrap();
        let mut table = SymbolTable::open(dir.path(), "city").unwrap();

        let full = table.get_or_add(b"x").unwrap();
        let empty = table.get_or_add(b"").unwrap();

        assert_ne!(full, empty);
        assert_eq!(table.get_or_add(b"").unwrap(), empty);
        assert_eq!(table.symbol(empty).unwrap(), b"");
    }

    #[test]
    fn symbol_resolves_interned_bytes() {
        let dir = tempdir().unwrap();
        let mut table = SymbolTable::open(dir.path(), "city").unwrap();

        let id = table.get_or_add(b"reykjavik").unwrap();

        assert_eq!(table.symbol(id).unwrap(), b"reykjavik");
        assert!(table.symbol(id + 1).is_err());
    }

    #[test]
    fn prefixes_do_not_collide() {
        // Same heap bytes, different lengths: the length check must separate
        // "ab" from "abc" even when the bloom bit matches.
        let dir = tempdir().unwrap();
        let mut table = SymbolTable::open(dir.path(), "city").unwrap();

        let ab = table.get_or_add(b"ab").unwrap();
        let abc = table.get_or_add(b"abc").unwrap();

        assert_ne!(ab, abc);
        assert_eq!(table.get_or_add(b"ab").unwrap(), ab);
        assert_eq!(table.get_or_add(b"abc").unwrap(), abc);
    }

    #[test]
    fn reopen_restores_dedup_state() {
        let dir = tempdir().unwrap();
        let (a, b) = {
            let mut table = SymbolTable::open(dir.path(), "city").unwrap();
            let a = table.get_or_add(b"oslo").unwrap();
            let b = table.get_or_add(b"bergen").unwrap();
            table.flush().unwrap();
            (a, b)
        };

        let mut table = SymbolTable::open(dir.path(), "city").unwrap();
        assert_eq!(table.len(), 2);
        assert_eq!(table.get_or_add(b"oslo").unwrap(), a);
        assert_eq!(table.get_or_add(b"bergen").unwrap(), b);
        assert_eq!(table.symbol(a).unwrap(), b"oslo");
    }
}
