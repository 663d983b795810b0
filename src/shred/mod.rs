//! # Shredding - Row-to-Column Ingestion Dispatch
//!
//! "Shredding" decomposes one row-major byte span into per-column writes.
//! Columns are registered up front as an ordered field table - plain
//! metadata of `{name, byte offset, kind}` built once per record layout,
//! the compile-time substitute for reflection-driven mapping. Ingestion
//! then calls [`Shredder::dispatch`] once per input row.
//!
//! ## Actions
//!
//! - **Numeric**: reinterpret `width` bytes at the field offset and freeze
//!   them into a fixed-width column (atomic for widths 4 and 8).
//! - **Flag**: branch on one byte zero/nonzero and set/clear the row's bit
//!   in a bitset column. Flags may carry a tag bit that feeds the segment
//!   index: `dispatch` returns the OR of tag bits observed in the row.
//! - **Symbol**: read a 2-byte little-endian length header plus that many
//!   bytes, intern them through a [`SymbolTable`], and freeze the u32 id
//!   into an id column.
//!
//! ## Ordering and Failure
//!
//! Actions run in registration order against the same row. Rows may be
//! dispatched out of order as long as row indices are never reused.
//! Capacity shortfalls are recovered by growing the destination sheet and
//! never surface. An offset/length that reads past the row end is a fatal
//! layout error: registration and the producer's row format disagree.

use std::path::{Path, PathBuf};

use eyre::{bail, ensure, eyre, Result, WrapErr};
use hashbrown::HashMap;
use smallvec::SmallVec;

use crate::config::DEFAULT_COLUMN_CAPACITY;
use crate::storage::{BitsetColumn, Column, Sheet};
use crate::symbols::SymbolTable;

/// What a registered field writes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    /// Fixed-width value copied verbatim into a column.
    Numeric { width: usize },
    /// Single byte mapped to one bit, optionally tagged for the segment index.
    Flag { tag_bit: Option<u8> },
    /// Length-prefixed bytes interned into a symbol table.
    Symbol,
}

/// One entry of the ordered field table describing the source row layout.
#[derive(Debug, Clone)]
pub struct FieldDef {
    pub name: String,
    pub offset: usize,
    pub kind: FieldKind,
}

#[derive(Clone, Copy)]
enum Action {
    Numeric { offset: usize, width: usize, sheet: usize },
    Flag { offset: usize, sheet: usize, tag_bit: Option<u8> },
    Symbol { offset: usize, table: usize, ids: usize },
}

pub struct Shredder {
    dir: PathBuf,
    sheets: Vec<Sheet>,
    tables: Vec<SymbolTable>,
    actions: SmallVec<[Action; 8]>,
    fields: Vec<FieldDef>,
    sheet_names: HashMap<String, usize>,
    table_names: HashMap<String, usize>,
}

impl Shredder {
    /// Creates a shredder writing column files under `dir`.
    pub fn open<P: AsRef<Path>>(dir: P) -> Result<Self> {
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir)
            .wrap_err_with(|| format!("failed to create column directory '{}'", dir.display()))?;

        Ok(Self {
            dir: dir.to_path_buf(),
            sheets: Vec::new(),
            tables: Vec::new(),
            actions: SmallVec::new(),
            fields: Vec::new(),
            sheet_names: HashMap::new(),
            table_names: HashMap::new(),
        })
    }

    fn add_sheet(&mut self, name: &str, file: String) -> Result<usize> {
        ensure!(
            !self.sheet_names.contains_key(name),
            "column '{}' is already registered",
            name
        );
        let sheet = Sheet::open(self.dir.join(file), DEFAULT_COLUMN_CAPACITY)?;
        let idx = self.sheets.len();
        self.sheets.push(sheet);
        self.sheet_names.insert(name.to_string(), idx);
        Ok(idx)
    }

    /// Registers a fixed-width numeric field of `width` bytes at `offset`
    /// in the source row, backed by `<name>.col`.
    pub fn register_numeric(&mut self, name: &str, offset: usize, width: usize) -> Result<()> {
        ensure!(
            (1..=16).contains(&width),
            "unsupported numeric width {} for column '{}'",
            width,
            name
        );
        let sheet = self.add_sheet(name, format!("{name}.col"))?;
        self.actions.push(Action::Numeric { offset, width, sheet });
        self.fields.push(FieldDef {
            name: name.to_string(),
            offset,
            kind: FieldKind::Numeric { width },
        });
        Ok(())
    }

    /// Registers a boolean field: one source byte at `offset`, backed by
    /// the bitset `<name>.flags`. When `tag_bit` is given, a nonzero byte
    /// contributes `1 << tag_bit` to the row's tag mask.
    pub fn register_flag(&mut self, name: &str, offset: usize, tag_bit: Option<u8>) -> Result<()> {
        if let Some(bit) = tag_bit {
            ensure!(bit < 64, "tag bit {} out of range for flag '{}'", bit, name);
        }
        let sheet = self.add_sheet(name, format!("{name}.flags"))?;
        self.actions.push(Action::Flag { offset, sheet, tag_bit });
        self.fields.push(FieldDef {
            name: name.to_string(),
            offset,
            kind: FieldKind::Flag { tag_bit },
        });
        Ok(())
    }

    /// Registers a string field: a 2-byte LE length header at `offset`
    /// followed by that many bytes. Values are interned into the symbol
    /// table `<name>.*` and the resulting id lands in `<name>.ids`.
    pub fn register_symbol(&mut self, name: &str, offset: usize) -> Result<()> {
        ensure!(
            !self.table_names.contains_key(name),
            "symbol table '{}' is already registered",
            name
        );
        let ids = self.add_sheet(name, format!("{name}.ids"))?;
        let table = SymbolTable::open(&self.dir, name)?;
        let table_idx = self.tables.len();
        self.tables.push(table);
        self.table_names.insert(name.to_string(), table_idx);

        self.actions.push(Action::Symbol { offset, table: table_idx, ids });
        self.fields.push(FieldDef {
            name: name.to_string(),
            offset,
            kind: FieldKind::Symbol,
        });
        Ok(())
    }

    /// Runs every registered action once against `row`, in registration
    /// order, and returns the row's accumulated tag mask. Must be called
    /// at most once per `row_index`.
    pub fn dispatch(&mut self, row_index: u64, row: &[u8]) -> Result<u64> {
        let mut tags = 0u64;

        for i in 0..self.actions.len() {
            match self.actions[i] {
                Action::Numeric { offset, width, sheet } => {
                    ensure!(
                        offset + width <= row.len(),
                        "row of {} bytes too short for numeric field '{}' at {}..{}",
                        row.len(),
                        self.fields[i].name,
                        offset,
                        offset + width
                    );
                    self.write_numeric(sheet, row_index, &row[offset..offset + width])?;
                }
                Action::Flag { offset, sheet, tag_bit } => {
                    ensure!(
                        offset < row.len(),
                        "row of {} bytes too short for flag field '{}' at {}",
                        row.len(),
                        self.fields[i].name,
                        offset
                    );
                    let set = row[offset] != 0;
                    self.write_flag(sheet, row_index, set)?;
                    if set {
                        if let Some(bit) = tag_bit {
                            tags |= 1 << bit;
                        }
                    }
                }
                Action::Symbol { offset, table, ids } => {
                    ensure!(
                        offset + 2 <= row.len(),
                        "row of {} bytes too short for length header of '{}' at {}",
                        row.len(),
                        self.fields[i].name,
                        offset
                    );
                    let len = u16::from_le_bytes([row[offset], row[offset + 1]]) as usize;
                    if offset + 2 + len > row.len() {
                        bail!(
                            "string field '{}' declares {} bytes at {} but the row holds {}",
                            self.fields[i].name,
                            len,
                            offset + 2,
                            row.len()
                        );
                    }
                    let id = self.tables[table].get_or_add(&row[offset + 2..offset + 2 + len])?;
                    self.write_id(ids, row_index, id)?;
                }
            }
        }

        Ok(tags)
    }

    /// Bytes a column must hold through element `index` of `width` bytes.
    /// An index whose offset exceeds u64 must fail here, not wrap and land
    /// the write on a low element.
    #[inline]
    fn bytes_through(index: u64, width: u64) -> Result<u64> {
        index
            .checked_add(1)
            .and_then(|count| count.checked_mul(width))
            .ok_or_else(|| eyre!("row index {} out of addressable range", index))
    }

    fn write_numeric(&mut self, sheet: usize, row_index: u64, bytes: &[u8]) -> Result<()> {
        let width = bytes.len();
        let needed = Self::bytes_through(row_index, width as u64)?;
        let sheet = &mut self.sheets[sheet];
        if needed > sheet.capacity() {
            sheet.grow(needed.max(sheet.capacity() * 2))?;
        }

        match width {
            8 => {
                // SAFETY: bytes.len() == 8 was established by the caller's
                // slice; read_unaligned has no alignment requirement.
                let word = unsafe { std::ptr::read_unaligned(bytes.as_ptr() as *const u64) };
                Column::<u64>::new(sheet).freeze(row_index, word)
            }
            4 => {
                // SAFETY: as above with 4 bytes.
                let word = unsafe { std::ptr::read_unaligned(bytes.as_ptr() as *const u32) };
                Column::<u32>::new(sheet).freeze(row_index, word)
            }
            _ => {
                let ptr = sheet.handle(needed - width as u64)?;
                // SAFETY: the sheet was grown to hold `needed` bytes, so the
                // destination range is in bounds; non-word widths are
                // serialized by the single `&mut self` dispatcher.
                unsafe { std::ptr::copy_nonoverlapping(bytes.as_ptr(), ptr, width) };
                Ok(())
            }
        }
    }

    fn write_flag(&mut self, sheet: usize, row_index: u64, set: bool) -> Result<()> {
        let needed = Self::bytes_through(row_index >> 6, 8)?;
        let sheet = &mut self.sheets[sheet];
        if needed > sheet.capacity() {
            sheet.grow(needed.max(sheet.capacity() * 2))?;
        }

        let bits = BitsetColumn::new(sheet);
        if set {
            bits.make(row_index)
        } else {
            bits.brk(row_index)
        }
    }

    fn write_id(&mut self, sheet: usize, row_index: u64, id: u32) -> Result<()> {
        let needed = Self::bytes_through(row_index, 4)?;
        let sheet = &mut self.sheets[sheet];
        if needed > sheet.capacity() {
            sheet.grow(needed.max(sheet.capacity() * 2))?;
        }
        Column::<u32>::new(sheet).freeze(row_index, id)
    }

    /// The backing sheet of a registered field (`.col`, `.flags` or `.ids`).
    pub fn sheet(&self, name: &str) -> Option<&Sheet> {
        self.sheet_names.get(name).map(|&i| &self.sheets[i])
    }

    /// The symbol table behind a registered string field.
    pub fn symbols(&self, name: &str) -> Option<&SymbolTable> {
        self.table_names.get(name).map(|&i| &self.tables[i])
    }

    pub fn symbols_mut(&mut self, name: &str) -> Option<&mut SymbolTable> {
        self.table_names.get(name).map(|&i| &mut self.tables[i])
    }

    /// The ordered field table, in registration order.
    pub fn fields(&self) -> &[FieldDef] {
        &self.fields
    }

    /// Flushes every column sheet and symbol table.
    pub fn flush(&self) -> Result<()> {
        for sheet in &self.sheets {
            sheet.flush()?;
        }
        for table in &self.tables {
            table.flush()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    // Row layout used by most tests:
    //   0..8   f64 price
    //   8      u8  active flag
    //   9..    2-byte LE length + city name
    fn row(price: f64, active: bool, city: &[u8]) -> Vec<u8> {
        let mut row = Vec::new();
        row.extend_from_slice(&price.to_le_bytes());
        row.push(active as u8);
        row.extend_from_slice(&(city.len() as u16).to_le_bytes());
        row.extend_from_slice(city);
        row
    }

    fn shredder(dir: &Path) -> Shredder {
        let mut s = Shredder::open(dir).unwrap();
        s.register_numeric("price", 0, 8).unwrap();
        s.register_flag("active", 8, Some(3)).unwrap();
        s.register_symbol("city", 9).unwrap();
        s
    }

    #[test]
    fn dispatch_writes_every_registered_column() {
        let dir = tempdir().unwrap();
        let mut s = shredder(dir.path());

        s.dispatch(0, &row(12.5, true, b"oslo")).unwrap();
        s.dispatch(1, &row(-3.0, false, b"bergen")).unwrap();
        s.dispatch(2, &row(7.0, true, b"oslo")).unwrap();

        let prices = s.sheet("price").unwrap();
        let col = Column::<f64>::new(prices);
        assert_eq!(col.peek(0).unwrap(), 12.5);
        assert_eq!(col.peek(1).unwrap(), -3.0);

        let flags = BitsetColumn::new(s.sheet("active").unwrap());
        assert!(flags.is_active(0).unwrap());
        assert!(!flags.is_active(1).unwrap());

        let ids = Column::<u32>::new(s.sheet("city").unwrap());
        assert_eq!(ids.peek(0).unwrap(), ids.peek(2).unwrap());
        assert_ne!(ids.peek(0).unwrap(), ids.peek(1).unwrap());
        assert_eq!(s.symbols("city").unwrap().len(), 2);
    }

    #[test]
    fn dispatch_returns_accumulated_tag_mask() {
        let dir = tempdir().unwrap();
        let mut s = shredder(dir.path());

        assert_eq!(s.dispatch(0, &row(1.0, true, b"x")).unwrap(), 1 << 3);
        assert_eq!(s.dispatch(1, &row(1.0, false, b"x")).unwrap(), 0);
    }

    #[test]
    fn short_row_is_a_fatal_layout_error() {
        let dir = tempdir().unwrap();
        let mut s = shredder(dir.path());

        // Too short for the numeric field.
        assert!(s.dispatch(0, &[0u8; 4]).is_err());

        // Length header declares more bytes than the row holds.
        let mut bad = row(1.0, true, b"oslo");
        let at = bad.len() - 6;
        bad[at..at + 2].copy_from_slice(&500u16.to_le_bytes());
        assert!(s.dispatch(0, &bad).is_err());
    }

    #[test]
    fn rows_may_arrive_out_of_order() {
        let dir = tempdir().unwrap();
        let mut s = shredder(dir.path());

        s.dispatch(5, &row(5.0, true, b"later")).unwrap();
        s.dispatch(0, &row(0.5, false, b"first")).unwrap();

        let col = Column::<f64>::new(s.sheet("price").unwrap());
        assert_eq!(col.peek(5).unwrap(), 5.0);
        assert_eq!(col.peek(0).unwrap(), 0.5);
    }

    #[test]
    fn high_row_index_grows_the_destination() {
        let dir = tempdir().unwrap();
        let mut s = shredder(dir.path());
        let far = DEFAULT_COLUMN_CAPACITY / 8 + 10;

        s.dispatch(far, &row(9.0, true, b"far")).unwrap();
        s.dispatch(0, &row(1.0, true, b"near")).unwrap();

        let col = Column::<f64>::new(s.sheet("price").unwrap());
        assert_eq!(col.peek(far).unwrap(), 9.0);
        assert_eq!(col.peek(0).unwrap(), 1.0);
    }

    #[test]
    fn astronomical_row_index_errors_without_touching_low_rows() {
        let dir = tempdir().unwrap();
        let mut s = shredder(dir.path());

        s.dispatch(0, &row(111.0, true, b"oslo")).unwrap();

        // A row index whose byte offset exceeds u64 must be rejected, not
        // wrap around onto row 0.
        assert!(s.dispatch(1 << 61, &row(666.0, false, b"mars")).is_err());

        let col = Column::<f64>::new(s.sheet("price").unwrap());
        assert_eq!(col.peek(0).unwrap(), 111.0);
        let flags = BitsetColumn::new(s.sheet("active").unwrap());
        assert!(flags.is_active(0).unwrap());
    }

    #[test]
    fn narrow_numeric_widths_use_raw_copy() {
        let dir = tempdir().unwrap();
        let mut s = Shredder::open(dir.path()).unwrap();
        s.register_numeric("kind", 0, 2).unwrap();

        s.dispatch(0, &0xBEEFu16.to_le_bytes()).unwrap();
        s.dispatch(3, &0x1234u16.to_le_bytes()).unwrap();

        let col = Column::<u16>::new(s.sheet("kind").unwrap());
        assert_eq!(col.peek(0).unwrap(), 0xBEEF);
        assert_eq!(col.peek(3).unwrap(), 0x1234);
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let dir = tempdir().unwrap();
        let mut s = Shredder::open(dir.path()).unwrap();
        s.register_numeric("price", 0, 8).unwrap();

        assert!(s.register_flag("price", 8, None).is_err());
    }
}
