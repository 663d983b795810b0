//! # Store - Typed Record Store with Durability
//!
//! [`Store`] ties the lower layers together: a record [`Block`] for the
//! fixed-size rows, a write-ahead [`Wal`](crate::wal::Wal) for crash
//! safety, named [`SymbolTable`]s for interned strings, and an auxiliary
//! [`ByteHeap`] for variable-length blobs. One store occupies one
//! directory:
//!
//! ```text
//! <root>/<name>/
//!   records.blk    typed record block
//!   aux.heap       auxiliary blob heap
//!   store.meta     aux heap tail sidecar
//!   wal.log        write-ahead log
//!   <table>.*      symbol table files, per named table
//! ```
//!
//! ## Concurrency
//!
//! Handles on the same directory must share a [`LockRegistry`]. Inserts
//! and updates take the shared write lock; scans, sums and point reads
//! take the read lock. Across handles a freshly inserted record becomes
//! visible through the block's atomic count word, so readers never see a
//! half-written row. Read operations still take `&mut self`: a handle
//! whose files were grown by another handle remaps its own view to reach
//! the newly published records.
//!
//! ## Recovery
//!
//! An insert is logged and fsynced before it touches the block, and the
//! log entry's transaction id equals the record's index. On open, every
//! logged entry is re-applied at its index (overwriting below the
//! published count, appending at it),
//! then the log is truncated. [`flush`](Store::flush) does the same
//! truncation after forcing the primary files down.

mod block;
mod registry;

pub use block::Block;
pub use registry::LockRegistry;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use eyre::{ensure, eyre, Result, WrapErr};
use hashbrown::HashMap;
use parking_lot::RwLock;
use rayon::prelude::*;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::config::{
    DEFAULT_BLOCK_CAPACITY, DEFAULT_HEAP_CAPACITY, FORMAT_VERSION, STORE_META_MAGIC,
};
use crate::simd;
use crate::storage::ByteHeap;
use crate::symbols::SymbolTable;
use crate::wal::{self, Wal};

#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
struct StoreMeta {
    magic: u64,
    version: u32,
    _reserved: u32,
    aux_tail: u64,
}

pub struct Store<R> {
    dir: PathBuf,
    block: Block<R>,
    heap: ByteHeap,
    tables: HashMap<String, SymbolTable>,
    wal: Wal,
    lock: Arc<RwLock<()>>,
    meta_path: PathBuf,
}

impl<R> Store<R>
where
    R: FromBytes + IntoBytes + Immutable + Copy,
{
    /// Opens (or creates) the store named `name` under `root`, running
    /// log recovery before the handle is returned. All handles on the
    /// same directory must come through the same `registry`.
    pub fn open<P: AsRef<Path>>(root: P, name: &str, registry: &LockRegistry) -> Result<Self> {
        let dir = root.as_ref().join(name);
        std::fs::create_dir_all(&dir)
            .wrap_err_with(|| format!("failed to create store directory '{}'", dir.display()))?;
        let lock = registry.lock_for(&dir)?;
        let _guard = lock.write();

        let meta_path = dir.join("store.meta");
        let aux_tail = read_meta(&meta_path)?;

        let mut block = Block::<R>::open(dir.join("records.blk"), DEFAULT_BLOCK_CAPACITY)?;
        let heap = ByteHeap::open(dir.join("aux.heap"), DEFAULT_HEAP_CAPACITY, aux_tail)?;

        // Re-apply every confirmed log entry. Entries below the published
        // count are overwritten in place, not skipped: mmap writeback order
        // is arbitrary, so a crash can persist the count word before the
        // record bytes, and only the fsynced log holds the true payload.
        let wal_path = dir.join("wal.log");
        let replay = wal::replay(&wal_path)?;
        let mut count = block.len()?;
        for entry in &replay.entries {
            let record = R::read_from_bytes(&entry.payload).map_err(|_| {
                eyre!(
                    "wal entry {} holds {} bytes, expected a {}-byte record",
                    entry.tx_id,
                    entry.payload.len(),
                    std::mem::size_of::<R>()
                )
            })?;
            if entry.tx_id < count {
                block.set(entry.tx_id, record)?;
            } else {
                ensure!(
                    entry.tx_id == count,
                    "wal entry {} skips past record {}",
                    entry.tx_id,
                    count
                );
                block.append(record)?;
                count += 1;
            }
        }
        if !replay.entries.is_empty() {
            block.flush()?;
        }

        let mut wal = Wal::open(&wal_path, count)?;
        wal.truncate()?;

        drop(_guard);
        Ok(Self {
            dir,
            block,
            heap,
            tables: HashMap::new(),
            wal,
            lock,
            meta_path,
        })
    }

    /// Number of published records.
    pub fn len(&self) -> Result<u64> {
        self.block.len()
    }

    pub fn is_empty(&self) -> Result<bool> {
        self.block.is_empty()
    }

    /// Logs `record`, waits for it to be durable, then appends and
    /// publishes it. Returns the record's index.
    pub fn insert(&mut self, record: R) -> Result<u64> {
        let _guard = self.lock.write();
        let tx_id = self.wal.log(record.as_bytes())?;
        let index = self.block.append(record)?;
        debug_assert_eq!(tx_id, index);
        Ok(index)
    }

    /// Reads one record by index.
    pub fn get(&mut self, index: u64) -> Result<R> {
        let _guard = self.lock.read();
        self.block.get(index)
    }

    /// Collects every record matching `predicate`, in insertion order.
    pub fn scan<P>(&mut self, predicate: P) -> Result<Vec<R>>
    where
        P: Fn(&R) -> bool,
    {
        let _guard = self.lock.read();
        let count = self.block.len()?;
        let mut hits = Vec::new();
        for i in 0..count {
            let record = self.block.get(i)?;
            if predicate(&record) {
                hits.push(record);
            }
        }
        Ok(hits)
    }

    /// Projects every record matching `predicate` through `projector`.
    /// The projector also receives the store so it can resolve interned
    /// symbols.
    pub fn select<T, P, F>(&mut self, predicate: P, projector: F) -> Result<Vec<T>>
    where
        P: Fn(&R) -> bool,
        F: Fn(&R, &Self) -> Result<T>,
    {
        let _guard = self.lock.read();
        let count = self.block.len()?;
        let mut out = Vec::new();
        for i in 0..count {
            let record = self.block.get(i)?;
            if predicate(&record) {
                out.push(projector(&record, self)?);
            }
        }
        Ok(out)
    }

    /// Applies `mutate` in place to every record matching `predicate`,
    /// under the write lock. Returns the number of records touched.
    pub fn update<P, M>(&mut self, predicate: P, mutate: M) -> Result<u64>
    where
        P: Fn(&R) -> bool,
        M: Fn(&mut R),
    {
        let _guard = self.lock.write();
        let count = self.block.len()?;
        let mut touched = 0;
        for i in 0..count {
            let mut record = self.block.get(i)?;
            if predicate(&record) {
                mutate(&mut record);
                self.block.set(i, record)?;
                touched += 1;
            }
        }
        Ok(touched)
    }

    /// Indices of records whose bytes at `field_offset..field_offset +
    /// target.len()` equal `target`, found by a vectorized scan over the
    /// raw record bytes.
    pub fn find_fixed(&mut self, field_offset: usize, target: &[u8]) -> Result<Vec<u64>> {
        let record_size = std::mem::size_of::<R>();
        ensure!(
            field_offset + target.len() <= record_size,
            "field {}..{} lies outside a {}-byte record",
            field_offset,
            field_offset + target.len(),
            record_size
        );
        let _guard = self.lock.read();
        Ok(simd::scan_fixed(
            self.block.bytes()?,
            record_size,
            field_offset,
            target,
        ))
    }

    /// Interns `bytes` into the named symbol table, creating the table's
    /// files on first use.
    pub fn intern(&mut self, table: &str, bytes: &[u8]) -> Result<u32> {
        let lock = Arc::clone(&self.lock);
        let _guard = lock.write();
        self.table_mut(table)?.get_or_add(bytes)
    }

    /// Looks up a previously interned symbol.
    pub fn resolve(&mut self, table: &str, id: u32) -> Result<Vec<u8>> {
        let lock = Arc::clone(&self.lock);
        let _guard = lock.read();
        let bytes = self.table_mut(table)?.symbol(id)?;
        Ok(bytes.to_vec())
    }

    fn table_mut(&mut self, name: &str) -> Result<&mut SymbolTable> {
        if !self.tables.contains_key(name) {
            let table = SymbolTable::open(&self.dir, name)?;
            self.tables.insert(name.to_string(), table);
        }
        // Present: inserted above if it was absent.
        self.tables
            .get_mut(name)
            .ok_or_else(|| eyre!("symbol table '{}' vanished", name))
    }

    /// Appends a variable-length blob to the auxiliary heap and returns
    /// its offset. The offset stays valid for the life of the store.
    pub fn write_aux(&mut self, bytes: &[u8]) -> Result<u64> {
        let _guard = self.lock.write();
        self.heap.append(bytes)
    }

    /// Reads a blob previously written with [`write_aux`](Self::write_aux).
    pub fn read_aux(&self, offset: u64, len: usize) -> Result<Vec<u8>> {
        let _guard = self.lock.read();
        Ok(self.heap.read(offset, len)?.to_vec())
    }

    /// Forces every file down to disk, persists the aux tail sidecar and
    /// truncates the log: everything it held is now in the primary files.
    pub fn flush(&mut self) -> Result<()> {
        let _guard = self.lock.write();
        self.block.flush()?;
        self.heap.flush()?;
        for table in self.tables.values() {
            table.flush()?;
        }

        let meta = StoreMeta {
            magic: STORE_META_MAGIC,
            version: FORMAT_VERSION,
            _reserved: 0,
            aux_tail: self.heap.tail(),
        };
        std::fs::write(&self.meta_path, meta.as_bytes())
            .wrap_err_with(|| format!("failed to write '{}'", self.meta_path.display()))?;

        self.wal.truncate()
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

impl<R> Store<R>
where
    R: FromBytes + IntoBytes + Immutable + Copy + Send + Sync,
{
    /// Sums `value` over every published record matching `predicate`, in
    /// parallel. Each worker accumulates a local subtotal over its span of
    /// records and the subtotals are combined once at the end.
    pub fn sum<P, F>(&mut self, predicate: P, value: F) -> Result<f64>
    where
        P: Fn(&R) -> bool + Send + Sync,
        F: Fn(&R) -> f64 + Send + Sync,
    {
        let _guard = self.lock.read();
        let record_size = std::mem::size_of::<R>();
        let bytes = self.block.bytes()?;

        let total = bytes
            .par_chunks_exact(record_size)
            .fold(
                || 0.0f64,
                |acc, chunk| {
                    // SAFETY: par_chunks_exact yields exactly record_size
                    // bytes per chunk; R is FromBytes so any bit pattern is
                    // valid, and read_unaligned has no alignment demand.
                    let record = unsafe {
                        std::ptr::read_unaligned(chunk.as_ptr() as *const R)
                    };
                    if predicate(&record) {
                        acc + value(&record)
                    } else {
                        acc
                    }
                },
            )
            .sum::<f64>();
        Ok(total)
    }
}

fn read_meta(path: &Path) -> Result<u64> {
    let raw = match std::fs::read(path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(e) => {
            return Err(e).wrap_err_with(|| format!("failed to read '{}'", path.display()))
        }
    };
    let meta = StoreMeta::read_from_bytes(&raw)
        .map_err(|_| eyre!("store meta '{}' is malformed", path.display()))?;
    ensure!(
        meta.magic == STORE_META_MAGIC,
        "'{}' is not a store meta file",
        path.display()
    );
    ensure!(
        meta.version == FORMAT_VERSION,
        "unsupported store meta version {}",
        meta.version
    );
    Ok(meta.aux_tail)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BLOCK_HEADER_SIZE;
    use tempfile::tempdir;
    use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

    #[derive(Debug, Clone, Copy, PartialEq, FromBytes, IntoBytes, KnownLayout, Immutable)]
    #[repr(C)]
    struct Trade {
        instrument: u32,
        qty: u32,
        price: f64,
    }

    fn trade(instrument: u32, qty: u32, price: f64) -> Trade {
        Trade { instrument, qty, price }
    }

    #[test]
    fn insert_scan_update_cycle() {
        let dir = tempdir().unwrap();
        let registry = LockRegistry::new();
        let mut store = Store::<Trade>::open(dir.path(), "trades", &registry).unwrap();

        store.insert(trade(1, 10, 99.5)).unwrap();
        store.insert(trade(2, 5, 50.0)).unwrap();
        store.insert(trade(1, 3, 101.0)).unwrap();

        let ones = store.scan(|t| t.instrument == 1).unwrap();
        assert_eq!(ones.len(), 2);

        let touched = store
            .update(|t| t.instrument == 1, |t| t.qty += 1)
            .unwrap();
        assert_eq!(touched, 2);
        assert_eq!(store.get(0).unwrap().qty, 11);
        assert_eq!(store.get(1).unwrap().qty, 5);
    }

    #[test]
    fn records_survive_reopen_after_flush() {
        let dir = tempdir().unwrap();
        let registry = LockRegistry::new();

        let mut store = Store::<Trade>::open(dir.path(), "trades", &registry).unwrap();
        for i in 0..500 {
            store.insert(trade(i, i, i as f64)).unwrap();
        }
        store.flush().unwrap();
        drop(store);

        let mut store = Store::<Trade>::open(dir.path(), "trades", &registry).unwrap();
        assert_eq!(store.len().unwrap(), 500);
        assert_eq!(store.get(499).unwrap().instrument, 499);
    }

    #[test]
    fn sum_matches_serial_total() {
        let dir = tempdir().unwrap();
        let registry = LockRegistry::new();
        let mut store = Store::<Trade>::open(dir.path(), "trades", &registry).unwrap();

        let mut expected = 0.0;
        let mut expected_even = 0.0;
        for i in 0..10_000u32 {
            let price = (i % 97) as f64 * 0.25;
            store.insert(trade(i, 1, price)).unwrap();
            expected += price;
            if i % 2 == 0 {
                expected_even += price;
            }
        }
        assert_eq!(store.sum(|_| true, |t| t.price).unwrap(), expected);
        assert_eq!(
            store.sum(|t| t.instrument % 2 == 0, |t| t.price).unwrap(),
            expected_even
        );
    }

    #[test]
    fn select_projects_matching_records() {
        let dir = tempdir().unwrap();
        let registry = LockRegistry::new();
        let mut store = Store::<Trade>::open(dir.path(), "trades", &registry).unwrap();

        store.insert(trade(1, 10, 99.5)).unwrap();
        store.insert(trade(2, 5, 50.0)).unwrap();
        store.insert(trade(1, 3, 101.0)).unwrap();

        let notionals = store
            .select(|t| t.instrument == 1, |t, _| Ok(t.qty as f64 * t.price))
            .unwrap();
        assert_eq!(notionals, vec![995.0, 303.0]);
    }

    #[test]
    fn find_fixed_locates_field_matches() {
        let dir = tempdir().unwrap();
        let registry = LockRegistry::new();
        let mut store = Store::<Trade>::open(dir.path(), "trades", &registry).unwrap();

        store.insert(trade(7, 1, 0.0)).unwrap();
        store.insert(trade(8, 1, 0.0)).unwrap();
        store.insert(trade(7, 2, 0.0)).unwrap();

        let hits = store.find_fixed(0, &7u32.to_le_bytes()).unwrap();
        assert_eq!(hits, vec![0, 2]);
        assert!(store.find_fixed(13, &0u64.to_le_bytes()).is_err());
    }

    #[test]
    fn intern_and_resolve_round_trip() {
        let dir = tempdir().unwrap();
        let registry = LockRegistry::new();
        let mut store = Store::<Trade>::open(dir.path(), "trades", &registry).unwrap();

        let a = store.intern("venue", b"XNYS").unwrap();
        let b = store.intern("venue", b"XLON").unwrap();
        assert_eq!(store.intern("venue", b"XNYS").unwrap(), a);
        assert_ne!(a, b);
        assert_eq!(store.resolve("venue", b).unwrap(), b"XLON");
    }

    #[test]
    fn aux_blobs_persist_across_reopen() {
        let dir = tempdir().unwrap();
        let registry = LockRegistry::new();

        let mut store = Store::<Trade>::open(dir.path(), "trades", &registry).unwrap();
        let at = store.write_aux(b"free-form note").unwrap();
        store.flush().unwrap();
        drop(store);

        let store = Store::<Trade>::open(dir.path(), "trades", &registry).unwrap();
        assert_eq!(store.read_aux(at, 14).unwrap(), b"free-form note");
    }

    #[test]
    fn unflushed_inserts_recover_from_the_log() {
        let dir = tempdir().unwrap();
        let registry = LockRegistry::new();
        let store_dir = dir.path().join("trades");

        {
            let mut store = Store::<Trade>::open(dir.path(), "trades", &registry).unwrap();
            store.insert(trade(1, 1, 1.0)).unwrap();
            store.insert(trade(2, 2, 2.0)).unwrap();
            store.flush().unwrap();
            store.insert(trade(3, 3, 3.0)).unwrap();
        }

        // Roll the block back to the flushed state; the third insert now
        // exists only in the log, as after a crash before writeback.
        let blk = store_dir.join("records.blk");
        let mut raw = std::fs::read(&blk).unwrap();
        raw[16..24].copy_from_slice(&2u64.to_le_bytes());
        std::fs::write(&blk, &raw).unwrap();

        // And resurrect the pre-truncation log.
        let mut wal = Wal::open(store_dir.join("wal.log"), 2).unwrap();
        wal.log(trade(3, 3, 3.0).as_bytes()).unwrap();
        drop(wal);

        let mut store = Store::<Trade>::open(dir.path(), "trades", &registry).unwrap();
        assert_eq!(store.len().unwrap(), 3);
        assert_eq!(store.get(2).unwrap().instrument, 3);
    }

    #[test]
    fn recovery_repairs_scribbled_records_below_the_count() {
        let dir = tempdir().unwrap();
        let registry = LockRegistry::new();
        let store_dir = dir.path().join("trades");

        {
            let mut store = Store::<Trade>::open(dir.path(), "trades", &registry).unwrap();
            store.insert(trade(1, 1, 1.0)).unwrap();
            store.insert(trade(2, 2, 2.0)).unwrap();
            store.insert(trade(3, 3, 3.0)).unwrap();
        }

        // The count word can reach the file ahead of the record bytes it
        // covers. Simulate that torn state for the middle record; the log
        // still holds its payload.
        let blk = store_dir.join("records.blk");
        let mut raw = std::fs::read(&blk).unwrap();
        let at = BLOCK_HEADER_SIZE + size_of::<Trade>();
        raw[at..at + size_of::<Trade>()].fill(0xEE);
        std::fs::write(&blk, &raw).unwrap();

        let mut store = Store::<Trade>::open(dir.path(), "trades", &registry).unwrap();
        assert_eq!(store.len().unwrap(), 3);
        assert_eq!(store.get(1).unwrap(), trade(2, 2, 2.0));
    }
}
