//! SSTable binary format constants and header/footer helpers.
//!
//! The header is the first 24 bytes, the footer the last 16:
//!
//! ```text
//! header: magic(u64) | version(u32) | num_entries(u64) | reserved(u32)
//! footer: index_offset(u64) | crc32(u64, low 32 bits CRC, high 32 zero)
//! ```

use crate::SstableError;

/// Magic number identifying SSTable files (ASCII "SSTABBLE").
pub const SSTABLE_MAGIC: u64 = 0x5353_5441_4242_4C45;

/// Current file format version.
pub const SSTABLE_VERSION: u32 = 1;

/// Size of the header in bytes: 8 (magic) + 4 (version) + 8 (num_entries)
/// + 4 (reserved).
pub const HEADER_LEN: u64 = 24;

/// Size of the footer in bytes: 8 (index_offset) + 8 (crc).
pub const FOOTER_LEN: u64 = 16;

/// One sparse-index entry per this many data records. A per-file property:
/// the reader infers block boundaries from the index it loads, never from
/// configuration.
pub const DEFAULT_INDEX_INTERVAL: usize = 16;

/// Encodes the header with the given entry count. The reserved word is
/// zero.
pub fn encode_header(num_entries: u64) -> [u8; HEADER_LEN as usize] {
    let mut buf = [0u8; HEADER_LEN as usize];
    codec::put_u64(&mut buf, 0, SSTABLE_MAGIC);
    codec::put_u32(&mut buf, 8, SSTABLE_VERSION);
    codec::put_u64(&mut buf, 12, num_entries);
    buf
}

/// Validates magic and version, returning `num_entries`.
pub fn decode_header(buf: &[u8; HEADER_LEN as usize]) -> Result<u64, SstableError> {
    let magic = codec::get_u64(buf, 0);
    if magic != SSTABLE_MAGIC {
        return Err(SstableError::Corruption(format!(
            "bad magic {magic:#018x}"
        )));
    }
    let version = codec::get_u32(buf, 8);
    if version != SSTABLE_VERSION {
        return Err(SstableError::Corruption(format!(
            "unsupported version {version}"
        )));
    }
    Ok(codec::get_u64(buf, 12))
}

/// Encodes the footer. The CRC-32 is zero-extended into the 64-bit field.
pub fn encode_footer(index_offset: u64, crc: u32) -> [u8; FOOTER_LEN as usize] {
    let mut buf = [0u8; FOOTER_LEN as usize];
    codec::put_u64(&mut buf, 0, index_offset);
    codec::put_u64(&mut buf, 8, crc as u64);
    buf
}

/// Decodes the footer, returning `(index_offset, stored_crc_word)`. The
/// stored word is the full 64 bits; a well-formed file has zeros in the
/// high half.
pub fn decode_footer(buf: &[u8; FOOTER_LEN as usize]) -> (u64, u64) {
    (codec::get_u64(buf, 0), codec::get_u64(buf, 8))
}
