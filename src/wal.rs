//! # Write-Ahead Log
//!
//! Append-only durability log. Every mutation is written here and fsynced
//! before it is acknowledged, so a crash can lose at most work that was
//! never confirmed.
//!
//! ## Wire Format
//!
//! Each entry is a packed 20-byte header followed by the payload:
//!
//! ```text
//! +-------------+-------------+----------------+--------------+---------+
//! | magic (u32) | tx_id (u64) | payload_len    | checksum     | payload |
//! | "ICEW"      |             | (i32)          | (u32, CRC32) |         |
//! +-------------+-------------+----------------+--------------+---------+
//! ```
//!
//! All integers are little-endian. The checksum is CRC-32/ISO-HDLC over
//! the payload bytes only.
//!
//! ## Recovery
//!
//! [`replay`] walks the log from the start and stops at the first entry
//! that fails validation: bad magic, checksum mismatch, negative or
//! truncated length. Everything before the stop point is a confirmed
//! prefix; everything after is discarded as a torn tail. Replay never
//! fails on corruption, it only reports a shorter prefix.

use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use crc::{Crc, CRC_32_ISO_HDLC};
use eyre::{ensure, Result, WrapErr};
use zerocopy::byteorder::little_endian::{I32, U32, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::config::{WAL_HEADER_SIZE, WAL_MAGIC};

const WAL_CRC: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

/// On-disk entry header. Packed: 20 bytes, no padding.
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C, packed)]
struct WalEntryHeader {
    magic: U32,
    tx_id: U64,
    payload_len: I32,
    checksum: U32,
}

const _: () = assert!(std::mem::size_of::<WalEntryHeader>() == WAL_HEADER_SIZE);

/// Appender half of the log. One writer per store; serialization is the
/// caller's responsibility.
pub struct Wal {
    file: File,
    path: PathBuf,
    next_tx_id: u64,
}

impl Wal {
    /// Opens (or creates) the log at `path` for appending. New entries are
    /// numbered from `starting_tx_id`.
    pub fn open<P: AsRef<Path>>(path: P, starting_tx_id: u64) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .wrap_err_with(|| format!("failed to open wal '{}'", path.display()))?;

        Ok(Self {
            file,
            path,
            next_tx_id: starting_tx_id,
        })
    }

    /// Appends `payload` as one entry, fsyncs, and returns the assigned
    /// transaction id. The id is only handed out once the bytes are
    /// durable.
    pub fn log(&mut self, payload: &[u8]) -> Result<u64> {
        ensure!(
            payload.len() <= i32::MAX as usize,
            "wal payload of {} bytes exceeds the entry limit",
            payload.len()
        );

        let tx_id = self.next_tx_id;
        let header = WalEntryHeader {
            magic: U32::new(WAL_MAGIC),
            tx_id: U64::new(tx_id),
            payload_len: I32::new(payload.len() as i32),
            checksum: U32::new(WAL_CRC.checksum(payload)),
        };

        self.file
            .write_all(header.as_bytes())
            .and_then(|_| self.file.write_all(payload))
            .and_then(|_| self.file.sync_all())
            .wrap_err_with(|| format!("failed to append to wal '{}'", self.path.display()))?;

        self.next_tx_id += 1;
        Ok(tx_id)
    }

    /// Discards the log's contents. Used after its entries have been
    /// re-applied and flushed to the primary files.
    pub fn truncate(&mut self) -> Result<()> {
        self.file
            .set_len(0)
            .and_then(|_| self.file.sync_all())
            .wrap_err_with(|| format!("failed to truncate wal '{}'", self.path.display()))?;
        Ok(())
    }

    pub fn next_tx_id(&self) -> u64 {
        self.next_tx_id
    }
}

/// One validated entry recovered from the log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WalEntry {
    pub tx_id: u64,
    pub payload: Vec<u8>,
}

/// Result of walking a log: the confirmed prefix plus where it ended.
#[derive(Debug)]
pub struct Replay {
    /// Entries that passed validation, in log order.
    pub entries: Vec<WalEntry>,
    /// Byte length of the confirmed prefix.
    pub durable_bytes: u64,
    /// True when the walk stopped before end-of-file (torn tail present).
    pub truncated: bool,
}

/// Reads every validated entry from the log at `path`. A missing file
/// yields an empty replay.
pub fn replay<P: AsRef<Path>>(path: P) -> Result<Replay> {
    let path = path.as_ref();
    let mut raw = Vec::new();
    match File::open(path) {
        Ok(mut file) => {
            file.read_to_end(&mut raw)
                .wrap_err_with(|| format!("failed to read wal '{}'", path.display()))?;
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => {
            return Err(e).wrap_err_with(|| format!("failed to open wal '{}'", path.display()))
        }
    }

    let mut entries = Vec::new();
    let mut pos = 0usize;

    loop {
        let Some(header_bytes) = raw.get(pos..pos + WAL_HEADER_SIZE) else {
            // Short header (or clean EOF when pos == raw.len()).
            break;
        };
        // Unaligned derive: parses from any offset.
        let Ok(header) = WalEntryHeader::read_from_bytes(header_bytes) else {
            break;
        };
        if header.magic.get() != WAL_MAGIC {
            break;
        }
        let len = header.payload_len.get();
        if len < 0 {
            break;
        }
        let body_start = pos + WAL_HEADER_SIZE;
        let Some(payload) = raw.get(body_start..body_start + len as usize) else {
            break;
        };
        if WAL_CRC.checksum(payload) != header.checksum.get() {
            break;
        }

        entries.push(WalEntry {
            tx_id: header.tx_id.get(),
            payload: payload.to_vec(),
        });
        pos = body_start + len as usize;
    }

    Ok(Replay {
        entries,
        durable_bytes: pos as u64,
        truncated: pos < raw.len(),
    })
}
