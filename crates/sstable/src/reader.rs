use codec::{MAX_KEY_LEN, MAX_VALUE_LEN, TOMBSTONE_MARKER};
use crc32fast::Hasher as Crc32;
use memtable::Lookup;
use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};

use crate::format::{decode_footer, decode_header, FOOTER_LEN, HEADER_LEN};
use crate::SstableError;

/// Reads `buf.len()` bytes at `offset` without touching the file cursor.
///
/// `pread(2)` takes `&File`, so lookups need no locking and any number of
/// readers can share one finalized file.
#[cfg(unix)]
fn read_exact_at(file: &File, buf: &mut [u8], offset: u64) -> io::Result<()> {
    use std::os::unix::fs::FileExt;
    file.read_exact_at(buf, offset)
}

/// Windows fallback: `seek_read` moves the cursor, so concurrent readers
/// must each open their own [`SstableReader`].
#[cfg(windows)]
fn read_exact_at(file: &File, buf: &mut [u8], offset: u64) -> io::Result<()> {
    use std::os::windows::fs::FileExt;
    let mut pos = 0;
    while pos < buf.len() {
        let n = file.seek_read(&mut buf[pos..], offset + pos as u64)?;
        if n == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "unexpected end of file during seek_read",
            ));
        }
        pos += n;
    }
    Ok(())
}

/// A data record's metadata, with the value left on disk until wanted.
struct RawRecord {
    key: Vec<u8>,
    /// `None` for tombstones.
    value_len: Option<u32>,
    value_offset: u64,
    /// Offset of the record that follows.
    next: u64,
}

/// Validated read-only view of a finalized SSTable.
///
/// [`open`](SstableReader::open) verifies the footer checksum over the whole
/// file body, checks magic and version, and loads the sparse index into
/// memory. Queries then cost one index binary search plus a bounded forward
/// scan of at most one index block.
#[derive(Debug)]
pub struct SstableReader {
    file: File,
    path: PathBuf,
    num_entries: u64,
    /// First byte past the data region (the index offset from the footer).
    data_end: u64,
    /// Sparse `(key, data_offset)` pairs in ascending key order.
    index: Vec<(Vec<u8>, u64)>,
}

impl SstableReader {
    /// Opens and validates an SSTable.
    ///
    /// # Errors
    ///
    /// [`SstableError::Corruption`] on checksum mismatch, bad magic, unknown
    /// version, or any region bound violated by the footer or index;
    /// [`SstableError::Io`] on underlying read failures.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, SstableError> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path)?;
        let len = file.metadata()?.len();
        if len < HEADER_LEN + FOOTER_LEN {
            return Err(SstableError::Corruption(format!(
                "file too small: {len} bytes"
            )));
        }

        let mut footer = [0u8; FOOTER_LEN as usize];
        read_exact_at(&file, &mut footer, len - FOOTER_LEN)?;
        let (index_offset, stored_crc) = decode_footer(&footer);
        if index_offset < HEADER_LEN || index_offset > len - FOOTER_LEN {
            return Err(SstableError::Corruption(
                "index offset out of bounds".into(),
            ));
        }

        let body_end = len - FOOTER_LEN;
        let mut hasher = Crc32::new();
        let mut chunk = vec![0u8; 64 * 1024];
        let mut off = 0u64;
        while off < body_end {
            let n = chunk.len().min((body_end - off) as usize);
            read_exact_at(&file, &mut chunk[..n], off)?;
            hasher.update(&chunk[..n]);
            off += n as u64;
        }
        let computed = hasher.finalize() as u64;
        if stored_crc != computed {
            return Err(SstableError::Corruption(format!(
                "checksum mismatch: stored {stored_crc:#010x}, computed {computed:#010x}"
            )));
        }

        let mut header = [0u8; HEADER_LEN as usize];
        read_exact_at(&file, &mut header, 0)?;
        let num_entries = decode_header(&header)?;

        let index = Self::load_index(&file, index_offset, body_end)?;

        Ok(Self {
            file,
            path,
            num_entries,
            data_end: index_offset,
            index,
        })
    }

    fn load_index(
        file: &File,
        index_offset: u64,
        index_end: u64,
    ) -> Result<Vec<(Vec<u8>, u64)>, SstableError> {
        let mut raw = vec![0u8; (index_end - index_offset) as usize];
        read_exact_at(file, &mut raw, index_offset)?;

        let mut index: Vec<(Vec<u8>, u64)> = Vec::new();
        let mut pos = 0usize;
        while pos < raw.len() {
            if pos + 4 > raw.len() {
                return Err(SstableError::Corruption("truncated index entry".into()));
            }
            let key_len = codec::get_u32(&raw, pos) as usize;
            pos += 4;
            if key_len == 0 || key_len > MAX_KEY_LEN {
                return Err(SstableError::Corruption(
                    "index key length out of range".into(),
                ));
            }
            if pos + key_len + 8 > raw.len() {
                return Err(SstableError::Corruption("truncated index entry".into()));
            }
            let key = raw[pos..pos + key_len].to_vec();
            pos += key_len;
            let data_offset = codec::get_u64(&raw, pos);
            pos += 8;
            if data_offset < HEADER_LEN || data_offset >= index_offset {
                return Err(SstableError::Corruption(
                    "index data offset out of bounds".into(),
                ));
            }
            if index.last().map_or(false, |(prev, _)| key <= *prev) {
                return Err(SstableError::Corruption("index keys out of order".into()));
            }
            index.push((key, data_offset));
        }
        Ok(index)
    }

    /// Greatest indexed offset whose key is `<=` the target, or the start
    /// of the data region when the target sorts before every indexed key.
    fn scan_start(&self, key: &[u8]) -> u64 {
        let i = self.index.partition_point(|(k, _)| k.as_slice() <= key);
        if i == 0 {
            HEADER_LEN
        } else {
            self.index[i - 1].1
        }
    }

    /// Reads a record's header and key; the value stays on disk.
    fn read_record_header(&self, offset: u64) -> Result<RawRecord, SstableError> {
        if offset + 8 > self.data_end {
            return Err(SstableError::Corruption(
                "record header overruns data region".into(),
            ));
        }
        let mut hdr = [0u8; 8];
        read_exact_at(&self.file, &mut hdr, offset)?;
        let key_len = codec::get_u32(&hdr, 0) as usize;
        let value_len_field = codec::get_u32(&hdr, 4);

        if key_len == 0 || key_len > MAX_KEY_LEN {
            return Err(SstableError::Corruption(
                "record key length out of range".into(),
            ));
        }
        let is_tombstone = value_len_field == TOMBSTONE_MARKER;
        if !is_tombstone && value_len_field as usize > MAX_VALUE_LEN {
            return Err(SstableError::Corruption(
                "record value length out of range".into(),
            ));
        }

        let value_offset = offset + 8 + key_len as u64;
        let next = value_offset + if is_tombstone { 0 } else { value_len_field as u64 };
        if next > self.data_end {
            return Err(SstableError::Corruption(
                "record overruns data region".into(),
            ));
        }

        let mut key = vec![0u8; key_len];
        read_exact_at(&self.file, &mut key, offset + 8)?;
        Ok(RawRecord {
            key,
            value_len: if is_tombstone {
                None
            } else {
                Some(value_len_field)
            },
            value_offset,
            next,
        })
    }

    fn read_value(&self, rec: &RawRecord) -> Result<Option<Vec<u8>>, SstableError> {
        match rec.value_len {
            None => Ok(None),
            Some(n) => {
                let mut value = vec![0u8; n as usize];
                read_exact_at(&self.file, &mut value, rec.value_offset)?;
                Ok(Some(value))
            }
        }
    }

    /// Three-valued point lookup.
    ///
    /// The scan is bounded: the next index entry's key is strictly greater
    /// than the target's block, so at most one index block is visited.
    pub fn get(&self, key: &[u8]) -> Result<Lookup, SstableError> {
        let mut cursor = self.scan_start(key);
        while cursor < self.data_end {
            let rec = self.read_record_header(cursor)?;
            if rec.key.as_slice() == key {
                return Ok(match self.read_value(&rec)? {
                    Some(v) => Lookup::Present(v),
                    None => Lookup::Deleted,
                });
            }
            if rec.key.as_slice() > key {
                return Ok(Lookup::Absent);
            }
            cursor = rec.next;
        }
        Ok(Lookup::Absent)
    }

    /// Lazy scan over `[lo, hi)`; either bound may be open.
    ///
    /// Tombstones are yielded as `None` values so callers can reconcile
    /// with younger layers.
    pub fn range(&self, lo: Option<&[u8]>, hi: Option<&[u8]>) -> SstableRange<'_> {
        let cursor = lo.map_or(HEADER_LEN, |lo| self.scan_start(lo));
        SstableRange {
            reader: self,
            cursor,
            lo: lo.map(<[u8]>::to_vec),
            hi: hi.map(<[u8]>::to_vec),
            done: false,
        }
    }

    /// Lazy iteration over every record in key order.
    pub fn iter_all(&self) -> SstableRange<'_> {
        self.range(None, None)
    }

    /// Entry count from the header, tombstones included.
    pub fn num_entries(&self) -> u64 {
        self.num_entries
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Releases the file handle. Dropping the reader does the same; this
    /// spelling just makes the intent explicit at call sites.
    pub fn close(self) {}
}

/// Iterator returned by [`SstableReader::range`] and
/// [`SstableReader::iter_all`].
pub struct SstableRange<'a> {
    reader: &'a SstableReader,
    cursor: u64,
    lo: Option<Vec<u8>>,
    hi: Option<Vec<u8>>,
    done: bool,
}

impl Iterator for SstableRange<'_> {
    type Item = Result<(Vec<u8>, Option<Vec<u8>>), SstableError>;

    fn next(&mut self) -> Option<Self::Item> {
        while !self.done && self.cursor < self.reader.data_end {
            let rec = match self.reader.read_record_header(self.cursor) {
                Ok(rec) => rec,
                Err(e) => {
                    self.done = true;
                    return Some(Err(e));
                }
            };
            self.cursor = rec.next;

            // Records before `lo` can only appear inside the first block.
            if self.lo.as_deref().map_or(false, |lo| rec.key.as_slice() < lo) {
                continue;
            }
            if self.hi.as_deref().map_or(false, |hi| rec.key.as_slice() >= hi) {
                break;
            }
            let value = match self.reader.read_value(&rec) {
                Ok(v) => v,
                Err(e) => {
                    self.done = true;
                    return Some(Err(e));
                }
            };
            return Some(Ok((rec.key, value)));
        }
        self.done = true;
        None
    }
}
