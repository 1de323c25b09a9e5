use byteorder::{LittleEndian, WriteBytesExt};
use codec::{MAX_KEY_LEN, MAX_VALUE_LEN, TOMBSTONE_MARKER};
use crc32fast::Hasher as Crc32;
use std::fs::{rename, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::format::{encode_footer, encode_header, DEFAULT_INDEX_INTERVAL};
use crate::SstableError;

/// Streaming producer of an immutable SSTable file.
///
/// Keys must arrive in strictly ascending order. The writer owns its file
/// handle until [`finalize`](SstableWriter::finalize) completes.
///
/// # Crash safety
///
/// All bytes go to `<path>.tmp`; only `finalize` fsyncs and atomically
/// renames the file into place. A crash mid-write leaves the temp file
/// behind and nothing at the canonical name, and dropping an unfinalized
/// writer removes the temp file.
pub struct SstableWriter {
    path: PathBuf,
    tmp_path: PathBuf,
    file: Option<File>,
    num_entries: u64,
    index: Vec<(Vec<u8>, u64)>,
    index_interval: usize,
    last_key: Option<Vec<u8>>,
    finalized: bool,
}

impl SstableWriter {
    /// Creates a writer targeting `path`, with the default sparse-index
    /// interval of one entry per 16 records.
    pub fn create<P: AsRef<Path>>(path: P) -> Result<Self, SstableError> {
        Self::create_with_index_interval(path, DEFAULT_INDEX_INTERVAL)
    }

    /// Creates a writer with a custom sparse-index interval. The interval
    /// is baked into the file through the index it produces; readers never
    /// need to know it.
    pub fn create_with_index_interval<P: AsRef<Path>>(
        path: P,
        index_interval: usize,
    ) -> Result<Self, SstableError> {
        if index_interval == 0 {
            return Err(SstableError::Invariant("index interval must be at least 1"));
        }
        let path = path.as_ref().to_path_buf();
        let tmp_path = path.with_extension("sst.tmp");
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(true)
            .open(&tmp_path)?;

        // Placeholder entry count, rewritten at finalize.
        file.write_all(&encode_header(0))?;

        Ok(Self {
            path,
            tmp_path,
            file: Some(file),
            num_entries: 0,
            index: Vec::new(),
            index_interval,
            last_key: None,
            finalized: false,
        })
    }

    /// Appends one data record. `value == None` writes a tombstone.
    ///
    /// Fails with [`SstableError::Invariant`] on out-of-order or duplicate
    /// keys, oversize keys/values, or a finalized writer.
    pub fn add(&mut self, key: &[u8], value: Option<&[u8]>) -> Result<(), SstableError> {
        if self.finalized {
            return Err(SstableError::Invariant("add on finalized writer"));
        }
        if key.is_empty() || key.len() > MAX_KEY_LEN {
            return Err(SstableError::Invariant("key must be 1..=1024 bytes"));
        }
        if value.map_or(false, |v| v.len() > MAX_VALUE_LEN) {
            return Err(SstableError::Invariant("value exceeds 1 MiB cap"));
        }
        if self.last_key.as_deref().map_or(false, |last| key <= last) {
            return Err(SstableError::Invariant(
                "keys must be added in strictly ascending order",
            ));
        }

        let file = self
            .file
            .as_mut()
            .ok_or(SstableError::Invariant("writer is no longer usable"))?;
        let offset = file.stream_position()?;
        if self.num_entries % self.index_interval as u64 == 0 {
            self.index.push((key.to_vec(), offset));
        }

        file.write_u32::<LittleEndian>(key.len() as u32)?;
        file.write_u32::<LittleEndian>(value.map_or(TOMBSTONE_MARKER, |v| v.len() as u32))?;
        file.write_all(key)?;
        if let Some(v) = value {
            file.write_all(v)?;
        }

        self.num_entries += 1;
        self.last_key = Some(key.to_vec());
        Ok(())
    }

    /// Writes the sparse index and footer, rewrites the header with the
    /// final entry count, fsyncs, and atomically renames the temp file to
    /// its final path.
    ///
    /// A writer with zero [`add`](SstableWriter::add) calls still produces
    /// a valid, empty table. On any error the temp file is not renamed.
    pub fn finalize(&mut self) -> Result<(), SstableError> {
        if self.finalized {
            return Err(SstableError::Invariant("finalize on finalized writer"));
        }
        let mut file = self
            .file
            .take()
            .ok_or(SstableError::Invariant("writer is no longer usable"))?;

        let index_offset = file.stream_position()?;
        for (key, data_offset) in &self.index {
            file.write_u32::<LittleEndian>(key.len() as u32)?;
            file.write_all(key)?;
            file.write_u64::<LittleEndian>(*data_offset)?;
        }
        let index_end = file.stream_position()?;

        file.seek(SeekFrom::Start(0))?;
        file.write_all(&encode_header(self.num_entries))?;
        file.flush()?;

        // Stream the finished prefix back through the hasher; the header
        // rewrite above means a running checksum cannot be kept during
        // `add`.
        file.seek(SeekFrom::Start(0))?;
        let mut hasher = Crc32::new();
        let mut remaining = index_end;
        let mut chunk = vec![0u8; 64 * 1024];
        while remaining > 0 {
            let n = chunk.len().min(remaining as usize);
            file.read_exact(&mut chunk[..n])?;
            hasher.update(&chunk[..n]);
            remaining -= n as u64;
        }

        file.seek(SeekFrom::Start(index_end))?;
        file.write_all(&encode_footer(index_offset, hasher.finalize()))?;
        file.flush()?;
        file.sync_all()?;
        drop(file);

        rename(&self.tmp_path, &self.path)?;
        self.finalized = true;
        log::debug!(
            "finalized sstable {} ({} entries, {} index entries)",
            self.path.display(),
            self.num_entries,
            self.index.len()
        );
        Ok(())
    }

    /// Number of records added so far.
    pub fn num_entries(&self) -> u64 {
        self.num_entries
    }

    /// Final path this writer publishes to.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for SstableWriter {
    fn drop(&mut self) {
        if !self.finalized {
            self.file.take();
            let _ = std::fs::remove_file(&self.tmp_path);
        }
    }
}
