//! # SSTable — Sorted String Table
//!
//! Immutable, on-disk storage files for the Breakwater storage engine.
//!
//! When the in-memory [`memtable::Memtable`] crosses its flush threshold the
//! engine streams it into an SSTable. SSTables are **write-once, read-many**:
//! once finalized they are never modified, and any modification invalidates
//! the footer checksum.
//!
//! ## File layout (v1)
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │ HEADER (24 B)                                            │
//! │ magic (u64) | version (u32) | num_entries (u64) |        │
//! │ reserved (u32)                                           │
//! ├──────────────────────────────────────────────────────────┤
//! │ DATA SECTION (records in strictly ascending key order)   │
//! │ key_len (u32) | value_len (u32) | key | value            │
//! │ ... repeated for each entry ...                          │
//! ├──────────────────────────────────────────────────────────┤
//! │ SPARSE INDEX (one entry per INDEX_INTERVAL records)      │
//! │ key_len (u32) | key | data_offset (u64)                  │
//! ├──────────────────────────────────────────────────────────┤
//! │ FOOTER (16 B)                                            │
//! │ index_offset (u64) | crc32 (u64, zero-extended)          │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! All integers are little-endian. `value_len == 0xFFFF_FFFF` marks a
//! tombstone with no value bytes, the same sentinel the write-ahead log
//! uses. The footer CRC covers every byte before the footer itself.

mod format;
mod reader;
mod writer;

use std::io;
use thiserror::Error;

pub use format::{
    DEFAULT_INDEX_INTERVAL, FOOTER_LEN, HEADER_LEN, SSTABLE_MAGIC, SSTABLE_VERSION,
};
pub use reader::{SstableRange, SstableReader};
pub use writer::SstableWriter;

#[derive(Debug, Error)]
pub enum SstableError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("corrupt sstable: {0}")]
    Corruption(String),
    #[error("invariant violated: {0}")]
    Invariant(&'static str),
}
