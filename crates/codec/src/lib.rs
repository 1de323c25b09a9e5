//! # Codec
//!
//! Fixed-width little-endian integer pack/unpack and CRC-32 helpers shared
//! by the WAL and SSTable file formats of the Breakwater storage engine.
//!
//! Everything here operates on caller-provided buffers and slices; nothing
//! allocates. The format-level constants live here so that the tombstone
//! sentinel and the key/value size caps are defined once and appear
//! identically in both on-disk formats.

use byteorder::{ByteOrder, LittleEndian};

/// Reserved `value_len` marking a deletion. A real value can never be this
/// long because [`MAX_VALUE_LEN`] is far below `u32::MAX`.
pub const TOMBSTONE_MARKER: u32 = 0xFFFF_FFFF;

/// Maximum key length in bytes. Keys must also be nonempty.
pub const MAX_KEY_LEN: usize = 1024;

/// Maximum value length in bytes (1 MiB).
pub const MAX_VALUE_LEN: usize = 1 << 20;

/// Writes `v` little-endian into `buf[offset..offset + 4]`.
///
/// Panics if the range is out of bounds; header buffers are fixed-size
/// arrays sized by the caller.
pub fn put_u32(buf: &mut [u8], offset: usize, v: u32) {
    LittleEndian::write_u32(&mut buf[offset..offset + 4], v);
}

/// Writes `v` little-endian into `buf[offset..offset + 8]`.
pub fn put_u64(buf: &mut [u8], offset: usize, v: u64) {
    LittleEndian::write_u64(&mut buf[offset..offset + 8], v);
}

/// Reads a little-endian `u32` from `buf[offset..offset + 4]`.
pub fn get_u32(buf: &[u8], offset: usize) -> u32 {
    LittleEndian::read_u32(&buf[offset..offset + 4])
}

/// Reads a little-endian `u64` from `buf[offset..offset + 8]`.
pub fn get_u64(buf: &[u8], offset: usize) -> u64 {
    LittleEndian::read_u64(&buf[offset..offset + 8])
}

/// CRC-32 (IEEE 802.3, reflected) over `bytes`.
pub fn crc32(bytes: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(bytes);
    hasher.finalize()
}
