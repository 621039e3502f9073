//! Counter file format.
//!
//! A counter file is a fixed header, a hash table of bucket heads, and a
//! grow-only area of variable-length records:
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │ magic "# telemetry/counter file v1\n"   (28 bytes)               │
//! │ header length, u32                      (4 bytes)                │
//! │ metadata "Key: value\n" block           (≤ 512 bytes)            │
//! │ zero padding to a 32-byte boundary      → header length hdr_len  │
//! ├──────────────────────────────────────────────────────────────────┤
//! │ hdr_len + 0:  allocation limit, u32, advanced by CAS             │
//! │ hdr_len + 4:  512 bucket heads, u32 each, 0 = empty              │
//! ├──────────────────────────────────────────────────────────────────┤
//! │ records, 32-byte aligned, never crossing a 4096-byte page:       │
//! │   +0   value, u64, atomic add                                    │
//! │   +8   name length | 0xff << 24 once committed, u32              │
//! │   +12  next record in this bucket's chain, u32                   │
//! │          0 = end of chain, 0xffffffff = tombstoned duplicate     │
//! │   +16  name bytes, not NUL-terminated                            │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Multi-byte fields are in native byte order: they are read and written as
//! atomics on the mapped bytes, and every process sharing a file shares an
//! architecture (the metadata block pins OS and arch).

use crate::error::CounterError;
use crate::hash::{round_u32, round_usize};

/// Format version. Changing anything about the layout means changing this,
/// which changes the magic and the filename suffix.
pub(crate) const FILE_VERSION: &str = "v1";

/// Magic banner at offset 0. 28 bytes, already a multiple of 4.
pub(crate) const HDR_PREFIX: &[u8] = b"# telemetry/counter file v1\n";

/// Records are aligned to and sized in multiples of this.
pub(crate) const RECORD_UNIT: u32 = 32;

/// Metadata block budget.
pub(crate) const MAX_META_LEN: usize = 512;

/// Number of hash buckets; 2kB of heads.
pub(crate) const NUM_BUCKETS: u32 = 512;

/// Counter name budget.
pub(crate) const MAX_NAME_LEN: usize = 256;

/// Offset of the allocation limit, relative to the header length.
pub(crate) const LIMIT_OFF: u32 = 0;

/// Offset of the bucket head table, relative to the header length.
pub(crate) const HASH_OFF: u32 = 4;

/// Records never straddle a page of this size, and the file grows in
/// multiples of it.
pub(crate) const PAGE_SIZE: u32 = 4096;

/// Minimum file length; new files are extended to this before mapping.
pub(crate) const MIN_FILE_LEN: u64 = 4096;

/// `next` value marking a record as a tombstoned duplicate.
pub(crate) const TOMBSTONE: u32 = u32::MAX;

const _: () = assert!(HDR_PREFIX.len() == 28);
const _: () = assert!(HDR_PREFIX.len() % 4 == 0);
// Worst-case header plus limit word, bucket table, and one max-size record
// must fit in the minimum file length.
const _: () = assert!(
    544 + 4 + 4 * NUM_BUCKETS as u64 + (16 + MAX_NAME_LEN as u64 + 31) / 32 * 32 < MIN_FILE_LEN
);

/// Build the header block for a new file: magic, header length, metadata,
/// zero-padded to a 32-byte boundary. Existing files must start with exactly
/// these bytes to be usable (same program, version, OS, arch, time window).
pub(crate) fn header_bytes(meta: &str) -> Result<Vec<u8>, CounterError> {
    if meta.len() > MAX_META_LEN {
        return Err(CounterError::MetadataTooLong(meta.len()));
    }
    let np = round_usize(HDR_PREFIX.len(), 4);
    let n = round_usize(np + 4 + meta.len(), RECORD_UNIT as usize);
    let mut hdr = vec![0u8; n];
    hdr[..HDR_PREFIX.len()].copy_from_slice(HDR_PREFIX);
    hdr[np..np + 4].copy_from_slice(&(n as u32).to_ne_bytes());
    hdr[np + 4..np + 4 + meta.len()].copy_from_slice(meta.as_bytes());
    Ok(hdr)
}

/// Size of a record for a name of `name_len` bytes.
pub(crate) fn record_size(name_len: u32) -> u32 {
    round_u32(16 + name_len, RECORD_UNIT)
}

/// Choose `[start, end)` for a new record given the current allocation
/// limit. A limit of zero means the file has no records yet; the first
/// record goes right after the bucket head table. A record that would cross
/// a page boundary is bumped to the start of the next page.
pub(crate) fn place(hdr_len: u32, limit: u32, name_len: u32) -> (u32, u32) {
    let limit = if limit == 0 {
        hdr_len + HASH_OFF + 4 * NUM_BUCKETS
    } else {
        limit
    };
    let n = record_size(name_len);
    let mut start = round_u32(limit, RECORD_UNIT);
    if start / PAGE_SIZE != (start + n) / PAGE_SIZE {
        start = round_u32(limit, PAGE_SIZE);
    }
    (start, start + n)
}
