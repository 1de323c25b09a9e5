//! Recovery and flush glue between the write-ahead log, the memtable, and
//! SSTables.
//!
//! The enclosing store owns the composition (one WAL, one active memtable,
//! many SSTables consulted newest-first); this crate provides the two data
//! flows the core fixes: replaying the log into a fresh memtable on open,
//! and streaming a full memtable into a new SSTable before truncating the
//! log.

use anyhow::{Context, Result};
use memtable::Memtable;
use sstable::SstableWriter;
use std::path::Path;
use wal::Wal;

/// Replays the log into a fresh memtable.
///
/// Each record is applied as a put or delete in log order, so the last
/// write per key wins. A partial record at the tail is the expected crash
/// signature and is discarded; corruption anywhere before the tail is an
/// error.
pub fn recover(wal: &Wal) -> Result<Memtable> {
    let mut mem = Memtable::new();
    let mut iter = wal.iter()?;
    for record in &mut iter {
        let record = record.context("wal replay failed")?;
        match record.value {
            Some(value) => mem.put(record.key, value),
            None => mem.delete(record.key),
        }
    }
    if iter.truncated() {
        log::warn!(
            "discarding partial wal tail after {} valid bytes",
            iter.valid_len()
        );
    }
    Ok(mem)
}

/// Streams the memtable's sorted entries into a new SSTable at `sst_path`,
/// then truncates the log and clears the memtable.
///
/// The log is only truncated after the table is durably renamed into
/// place; any earlier failure leaves both the log and the memtable
/// untouched, so the caller can retry or keep serving from memory. If
/// truncation itself fails, replaying the stale log is benign: identical
/// puts and deletes are idempotent against the flushed table.
pub fn flush(mem: &mut Memtable, sst_path: &Path, wal: &mut Wal) -> Result<()> {
    let mut writer = SstableWriter::create(sst_path)
        .with_context(|| format!("creating sstable at {}", sst_path.display()))?;
    for (key, value) in mem.iter() {
        writer.add(key, value)?;
    }
    writer.finalize()?;

    wal.truncate().context("truncating wal after flush")?;
    mem.clear();
    log::info!("flushed memtable to {}", sst_path.display());
    Ok(())
}
