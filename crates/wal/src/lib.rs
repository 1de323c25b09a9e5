//! # Write-Ahead Log
//!
//! Append-only durability log for the Breakwater storage engine.
//!
//! Every mutation is serialized and fsynced here before it is applied to the
//! in-memory memtable. On restart the log is replayed into a fresh memtable,
//! and after a successful flush to an SSTable the log is truncated back to
//! zero length.
//!
//! ## Record layout
//!
//! ```text
//! timestamp(u64) | key_len(u32) | value_len(u32) | key | value | crc32(u32)
//! ```
//!
//! All integers are little-endian. `value_len == 0xFFFF_FFFF` marks a
//! tombstone and is followed by zero value bytes. The CRC covers every byte
//! of the record before the CRC field itself.
//!
//! A partially written record at the end of the file is the expected crash
//! signature: iteration stops cleanly in front of it and reports the
//! boundary via [`WalIter::valid_len`]. A bad record *followed by more
//! bytes* is real corruption and surfaces as an error.

use byteorder::{LittleEndian, WriteBytesExt};
use codec::{MAX_KEY_LEN, MAX_VALUE_LEN, TOMBSTONE_MARKER};
use crc32fast::Hasher as Crc32;
use std::fs::{File, OpenOptions};
use std::io::{self, BufReader, Read, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;

/// Fixed prefix of every record: timestamp + key_len + value_len.
pub const RECORD_HEADER_LEN: usize = 16;

/// Width of the trailing CRC field.
const CRC_LEN: usize = 4;

/// A single decoded mutation.
///
/// `value == None` is a tombstone: the key was deleted at `timestamp_micros`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WalRecord {
    /// Microsecond timestamp assigned at append time, nondecreasing within
    /// one writer.
    pub timestamp_micros: u64,
    pub key: Vec<u8>,
    pub value: Option<Vec<u8>>,
}

impl WalRecord {
    pub fn is_tombstone(&self) -> bool {
        self.value.is_none()
    }
}

#[derive(Debug, Error)]
pub enum WalError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("corrupt wal record at offset {offset}: {reason}")]
    Corruption { offset: u64, reason: &'static str },
    #[error("invariant violated: {0}")]
    Invariant(&'static str),
}

/// Append-only log file with exclusive ownership of its handle.
///
/// Appends are durable by default: each [`append`](Wal::append) flushes and
/// fsyncs before returning. Construct with
/// [`open_with_sync`](Wal::open_with_sync) to trade durability for
/// throughput (benchmarks do; the engine does not).
pub struct Wal {
    path: PathBuf,
    file: File,
    sync_on_append: bool,
    last_timestamp: u64,
}

impl Wal {
    /// Opens (creating if absent) the log at `path` with per-append fsync.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, WalError> {
        Self::open_with_sync(path, true)
    }

    /// Opens the log, choosing whether `append` fsyncs before returning.
    pub fn open_with_sync<P: AsRef<Path>>(path: P, sync_on_append: bool) -> Result<Self, WalError> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .read(true)
            .open(&path)?;
        Ok(Self {
            path,
            file,
            sync_on_append,
            last_timestamp: 0,
        })
    }

    /// Appends one mutation and returns its assigned timestamp.
    ///
    /// `value == None` records a tombstone. On success the record and all
    /// prior successful appends are on stable storage (when syncing is on).
    /// On failure the record may or may not have reached disk; recovery
    /// reconciles via the truncated-tail rule.
    pub fn append(&mut self, key: &[u8], value: Option<&[u8]>) -> Result<u64, WalError> {
        if key.is_empty() || key.len() > MAX_KEY_LEN {
            return Err(WalError::Invariant("key must be 1..=1024 bytes"));
        }
        if value.map_or(false, |v| v.len() > MAX_VALUE_LEN) {
            return Err(WalError::Invariant("value exceeds 1 MiB cap"));
        }

        let timestamp = self.next_timestamp();
        let value_len_field = value.map_or(TOMBSTONE_MARKER, |v| v.len() as u32);

        let body_len = RECORD_HEADER_LEN + key.len() + value.map_or(0, |v| v.len());
        let mut buf = Vec::with_capacity(body_len + CRC_LEN);
        buf.write_u64::<LittleEndian>(timestamp)?;
        buf.write_u32::<LittleEndian>(key.len() as u32)?;
        buf.write_u32::<LittleEndian>(value_len_field)?;
        buf.extend_from_slice(key);
        if let Some(v) = value {
            buf.extend_from_slice(v);
        }
        let crc = codec::crc32(&buf);
        buf.write_u32::<LittleEndian>(crc)?;

        self.file.write_all(&buf)?;
        self.file.flush()?;
        if self.sync_on_append {
            self.file.sync_all()?;
        }
        Ok(timestamp)
    }

    /// Wall clock clamped so equal or regressing clocks never break the
    /// append order.
    fn next_timestamp(&mut self) -> u64 {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_micros() as u64)
            .unwrap_or(0);
        let ts = now.max(self.last_timestamp + 1);
        self.last_timestamp = ts;
        ts
    }

    /// Lazy decoded iteration over the log from its beginning.
    ///
    /// The iterator reads through its own handle; the writer side is
    /// untouched. Records appended after this call are not observed.
    pub fn iter(&self) -> Result<WalIter, WalError> {
        let file = File::open(&self.path)?;
        let len = file.metadata()?.len();
        Ok(WalIter {
            reader: BufReader::new(file),
            len,
            pos: 0,
            valid_len: 0,
            truncated: false,
            done: false,
        })
    }

    /// Sets the file length to zero and fsyncs. A no-op on an empty log.
    ///
    /// Called by the engine only after a flushed SSTable is durably in
    /// place.
    pub fn truncate(&mut self) -> Result<(), WalError> {
        self.file.set_len(0)?;
        self.file.sync_all()?;
        Ok(())
    }

    /// Explicit flush + fsync, for writers opened with syncing off.
    pub fn sync(&mut self) -> Result<(), WalError> {
        self.file.flush()?;
        self.file.sync_all()?;
        Ok(())
    }

    /// Current on-disk length in bytes.
    pub fn size_bytes(&self) -> Result<u64, WalError> {
        Ok(self.file.metadata()?.len())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Closes the log and unlinks its file.
    pub fn remove(self) -> Result<(), WalError> {
        let Wal { path, file, .. } = self;
        drop(file);
        std::fs::remove_file(&path)?;
        Ok(())
    }
}

/// Iterator over decoded [`WalRecord`]s.
///
/// Ends cleanly at a partial trailing record (see [`truncated`]); yields
/// `Err(WalError::Corruption)` and stops if a bad record has bytes after it.
///
/// [`truncated`]: WalIter::truncated
pub struct WalIter {
    reader: BufReader<File>,
    /// File length captured at creation.
    len: u64,
    /// Offset of the next undecoded byte.
    pos: u64,
    /// Offset one past the last fully valid record.
    valid_len: u64,
    truncated: bool,
    done: bool,
}

impl WalIter {
    /// True once iteration stopped in front of a partial trailing record.
    pub fn truncated(&self) -> bool {
        self.truncated
    }

    /// Byte offset of the truncation boundary: everything before it decoded
    /// cleanly, everything at and after it is discardable tail.
    pub fn valid_len(&self) -> u64 {
        self.valid_len
    }

    /// Decodes the next record; `Ok(None)` on clean end or truncated tail.
    fn read_record(&mut self) -> Result<Option<WalRecord>, WalError> {
        if self.pos >= self.len {
            return Ok(None);
        }

        let mut header = [0u8; RECORD_HEADER_LEN];
        match self.reader.read_exact(&mut header) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                self.truncated = true;
                return Ok(None);
            }
            Err(e) => return Err(WalError::Io(e)),
        }

        let timestamp = codec::get_u64(&header, 0);
        let key_len = codec::get_u32(&header, 8) as usize;
        let value_len_field = codec::get_u32(&header, 12);

        if key_len == 0 || key_len > MAX_KEY_LEN {
            return Err(WalError::Corruption {
                offset: self.pos,
                reason: "key length out of range",
            });
        }
        let is_tombstone = value_len_field == TOMBSTONE_MARKER;
        if !is_tombstone && value_len_field as usize > MAX_VALUE_LEN {
            return Err(WalError::Corruption {
                offset: self.pos,
                reason: "value length out of range",
            });
        }
        let value_len = if is_tombstone {
            0
        } else {
            value_len_field as usize
        };

        let mut key = vec![0u8; key_len];
        let mut value = vec![0u8; value_len];
        let mut crc_buf = [0u8; CRC_LEN];
        for part in [key.as_mut_slice(), value.as_mut_slice(), &mut crc_buf[..]] {
            match self.reader.read_exact(part) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                    self.truncated = true;
                    return Ok(None);
                }
                Err(e) => return Err(WalError::Io(e)),
            }
        }

        let mut hasher = Crc32::new();
        hasher.update(&header);
        hasher.update(&key);
        hasher.update(&value);
        let computed = hasher.finalize();
        let stored = codec::get_u32(&crc_buf, 0);

        let record_end = self.pos + (RECORD_HEADER_LEN + key_len + value_len + CRC_LEN) as u64;
        if computed != stored {
            if record_end == self.len {
                // Torn write of the final record.
                self.truncated = true;
                return Ok(None);
            }
            return Err(WalError::Corruption {
                offset: self.pos,
                reason: "checksum mismatch",
            });
        }

        self.pos = record_end;
        self.valid_len = record_end;
        Ok(Some(WalRecord {
            timestamp_micros: timestamp,
            key,
            value: if is_tombstone { None } else { Some(value) },
        }))
    }
}

impl Iterator for WalIter {
    type Item = Result<WalRecord, WalError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.read_record() {
            Ok(Some(rec)) => Some(Ok(rec)),
            Ok(None) => {
                self.done = true;
                if self.truncated {
                    log::warn!(
                        "wal tail truncated: {} valid bytes of {}",
                        self.valid_len,
                        self.len
                    );
                }
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn collect(wal: &Wal) -> (Vec<WalRecord>, bool, u64) {
        let mut iter = wal.iter().unwrap();
        let mut recs = Vec::new();
        for item in &mut iter {
            recs.push(item.unwrap());
        }
        (recs, iter.truncated(), iter.valid_len())
    }

    #[test]
    fn append_and_iterate_in_order() {
        let dir = tempdir().unwrap();
        let mut wal = Wal::open(dir.path().join("wal.log")).unwrap();

        wal.append(b"a", Some(b"1")).unwrap();
        wal.append(b"b", Some(b"2")).unwrap();
        wal.append(b"a", None).unwrap();

        let (recs, truncated, _) = collect(&wal);
        assert!(!truncated);
        assert_eq!(recs.len(), 3);
        assert_eq!(recs[0].key, b"a");
        assert_eq!(recs[0].value.as_deref(), Some(b"1".as_slice()));
        assert_eq!(recs[1].key, b"b");
        assert_eq!(recs[1].value.as_deref(), Some(b"2".as_slice()));
        assert_eq!(recs[2].key, b"a");
        assert!(recs[2].is_tombstone());
    }

    #[test]
    fn timestamps_strictly_increase() {
        let dir = tempdir().unwrap();
        let mut wal = Wal::open(dir.path().join("wal.log")).unwrap();

        let mut last = 0u64;
        for i in 0..100u32 {
            let ts = wal.append(format!("k{i}").as_bytes(), Some(b"v")).unwrap();
            assert!(ts > last);
            last = ts;
        }

        let (recs, _, _) = collect(&wal);
        for pair in recs.windows(2) {
            assert!(pair[0].timestamp_micros < pair[1].timestamp_micros);
        }
    }

    #[test]
    fn tombstone_record_has_no_value_bytes() {
        let dir = tempdir().unwrap();
        let mut wal = Wal::open(dir.path().join("wal.log")).unwrap();
        wal.append(b"gone", None).unwrap();

        // header + key + crc only
        assert_eq!(wal.size_bytes().unwrap(), (16 + 4 + 4) as u64);

        let (recs, _, _) = collect(&wal);
        assert_eq!(recs.len(), 1);
        assert!(recs[0].is_tombstone());
    }

    #[test]
    fn empty_value_is_not_a_tombstone() {
        let dir = tempdir().unwrap();
        let mut wal = Wal::open(dir.path().join("wal.log")).unwrap();
        wal.append(b"k", Some(b"")).unwrap();

        let (recs, _, _) = collect(&wal);
        assert_eq!(recs[0].value.as_deref(), Some(b"".as_slice()));
    }

    #[test]
    fn empty_log_iterates_nothing() {
        let dir = tempdir().unwrap();
        let wal = Wal::open(dir.path().join("wal.log")).unwrap();
        let (recs, truncated, valid) = collect(&wal);
        assert!(recs.is_empty());
        assert!(!truncated);
        assert_eq!(valid, 0);
    }

    #[test]
    fn iteration_is_restartable() {
        let dir = tempdir().unwrap();
        let mut wal = Wal::open(dir.path().join("wal.log")).unwrap();
        wal.append(b"k", Some(b"v")).unwrap();

        let (first, _, _) = collect(&wal);
        let (second, _, _) = collect(&wal);
        assert_eq!(first, second);
    }

    #[test]
    fn truncate_resets_length_and_is_idempotent() {
        let dir = tempdir().unwrap();
        let mut wal = Wal::open(dir.path().join("wal.log")).unwrap();
        wal.append(b"k", Some(b"v")).unwrap();
        assert!(wal.size_bytes().unwrap() > 0);

        wal.truncate().unwrap();
        assert_eq!(wal.size_bytes().unwrap(), 0);

        // Truncating an already-empty log is a no-op.
        wal.truncate().unwrap();
        assert_eq!(wal.size_bytes().unwrap(), 0);

        let (recs, _, _) = collect(&wal);
        assert!(recs.is_empty());
    }

    #[test]
    fn append_after_truncate() {
        let dir = tempdir().unwrap();
        let mut wal = Wal::open(dir.path().join("wal.log")).unwrap();
        wal.append(b"old", Some(b"1")).unwrap();
        wal.truncate().unwrap();
        wal.append(b"new", Some(b"2")).unwrap();

        let (recs, _, _) = collect(&wal);
        assert_eq!(recs.len(), 1);
        assert_eq!(recs[0].key, b"new");
    }

    #[test]
    fn reopen_preserves_records() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("wal.log");
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(b"a", Some(b"1")).unwrap();
        }
        let mut wal = Wal::open(&path).unwrap();
        wal.append(b"b", Some(b"2")).unwrap();

        let (recs, _, _) = collect(&wal);
        assert_eq!(recs.len(), 2);
        assert_eq!(recs[0].key, b"a");
        assert_eq!(recs[1].key, b"b");
    }

    #[test]
    fn nosync_records_still_readable() {
        let dir = tempdir().unwrap();
        let mut wal = Wal::open_with_sync(dir.path().join("wal.log"), false).unwrap();
        wal.append(b"k", Some(b"v")).unwrap();
        wal.sync().unwrap();

        let (recs, _, _) = collect(&wal);
        assert_eq!(recs.len(), 1);
    }

    #[test]
    fn key_and_value_caps_enforced() {
        let dir = tempdir().unwrap();
        let mut wal = Wal::open(dir.path().join("wal.log")).unwrap();

        assert!(matches!(
            wal.append(b"", Some(b"v")),
            Err(WalError::Invariant(_))
        ));
        assert!(matches!(
            wal.append(&vec![b'k'; MAX_KEY_LEN + 1], Some(b"v")),
            Err(WalError::Invariant(_))
        ));
        assert!(matches!(
            wal.append(b"k", Some(&vec![b'v'; MAX_VALUE_LEN + 1])),
            Err(WalError::Invariant(_))
        ));

        // At-cap sizes are fine.
        wal.append(&vec![b'k'; MAX_KEY_LEN], Some(&vec![b'v'; MAX_VALUE_LEN]))
            .unwrap();
        let (recs, _, _) = collect(&wal);
        assert_eq!(recs.len(), 1);
    }

    // Each record below is 16 + 1 + 1 + 4 = 22 bytes.
    fn three_tiny_records(path: &Path) -> Wal {
        let mut wal = Wal::open(path).unwrap();
        wal.append(b"a", Some(b"1")).unwrap();
        wal.append(b"b", Some(b"2")).unwrap();
        wal.append(b"c", Some(b"3")).unwrap();
        wal
    }

    #[test]
    fn tail_truncation_stops_cleanly() {
        let dir = tempdir().unwrap();

        for cut in 1..=15u64 {
            let path = dir.path().join(format!("wal-{cut}.log"));
            let wal = three_tiny_records(&path);
            assert_eq!(wal.size_bytes().unwrap(), 66);
            drop(wal);

            let f = OpenOptions::new().write(true).open(&path).unwrap();
            f.set_len(66 - cut).unwrap();
            drop(f);

            let wal = Wal::open(&path).unwrap();
            let (recs, truncated, valid) = collect(&wal);
            assert_eq!(recs.len(), 2, "cut={cut}");
            assert!(truncated, "cut={cut}");
            assert_eq!(valid, 44, "cut={cut}");
        }
    }

    #[test]
    fn corrupt_final_record_crc_is_treated_as_tail() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("wal.log");
        drop(three_tiny_records(&path));

        let mut data = std::fs::read(&path).unwrap();
        let last = data.len() - 1;
        data[last] ^= 0xFF;
        std::fs::write(&path, &data).unwrap();

        let wal = Wal::open(&path).unwrap();
        let (recs, truncated, valid) = collect(&wal);
        assert_eq!(recs.len(), 2);
        assert!(truncated);
        assert_eq!(valid, 44);
    }

    #[test]
    fn mid_log_corruption_surfaces() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("wal.log");
        drop(three_tiny_records(&path));

        // Flip a key byte of the first record; two intact records follow.
        let mut data = std::fs::read(&path).unwrap();
        data[16] ^= 0xFF;
        std::fs::write(&path, &data).unwrap();

        let wal = Wal::open(&path).unwrap();
        let mut iter = wal.iter().unwrap();
        match iter.next() {
            Some(Err(WalError::Corruption { offset, .. })) => assert_eq!(offset, 0),
            other => panic!("expected corruption, got {other:?}"),
        }
        assert!(iter.next().is_none());
    }

    #[test]
    fn remove_unlinks_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("wal.log");
        let mut wal = Wal::open(&path).unwrap();
        wal.append(b"k", Some(b"v")).unwrap();
        wal.remove().unwrap();
        assert!(!path.exists());
    }
}
