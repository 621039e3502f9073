//! Reading counter files.
//!
//! The uploader, and anything else that wants to inspect a `.count` file,
//! reads with the same discipline the writers use: validate the magic and
//! header, then walk every bucket chain, skipping tombstoned duplicates.
//! A file that is still being written parses fine; records are only
//! reachable once committed.

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

use crate::hash::round_usize;
use crate::layout::{HASH_OFF, HDR_PREFIX, MAX_NAME_LEN, NUM_BUCKETS, RECORD_UNIT, TOMBSTONE};

/// Decoded contents of a counter file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CounterData {
    /// The metadata block: program identity and time window.
    pub meta: BTreeMap<String, String>,
    /// Live counters by name.
    pub counts: BTreeMap<String, u64>,
}

/// Errors from decoding a counter file.
#[derive(Debug)]
pub enum ParseError {
    /// The file does not start with the counter-file magic.
    BadMagic,
    /// The header is structurally invalid.
    BadHeader(&'static str),
    /// A chain referenced bytes outside the file.
    Truncated { off: u32 },
    /// A record failed validation.
    BadRecord { off: u32, reason: &'static str },
    /// The same name appeared twice in a chain.
    DuplicateName { name: String },
    /// A chain does not terminate.
    ChainLoop { bucket: u32 },
    /// Reading the file failed.
    Io(std::io::Error),
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BadMagic => write!(f, "not a counter file"),
            Self::BadHeader(why) => write!(f, "bad counter file header: {why}"),
            Self::Truncated { off } => write!(f, "counter file truncated at {off:#x}"),
            Self::BadRecord { off, reason } => {
                write!(f, "bad record at {off:#x}: {reason}")
            }
            Self::DuplicateName { name } => {
                write!(f, "duplicate live counter {name:?}")
            }
            Self::ChainLoop { bucket } => write!(f, "unterminated chain in bucket {bucket}"),
            Self::Io(e) => write!(f, "reading counter file: {e}"),
        }
    }
}

impl std::error::Error for ParseError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for ParseError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

/// Read and decode the counter file at `path`.
pub fn parse_file(path: impl AsRef<Path>) -> Result<CounterData, ParseError> {
    parse(&std::fs::read(path)?)
}

/// Decode a counter file image.
pub fn parse(data: &[u8]) -> Result<CounterData, ParseError> {
    if !data.starts_with(HDR_PREFIX) {
        return Err(ParseError::BadMagic);
    }
    let np = round_usize(HDR_PREFIX.len(), 4);
    let hdr_len = read_u32(data, np as u32).ok_or(ParseError::BadHeader("missing length"))? as usize;
    if hdr_len < np + 4 || hdr_len % RECORD_UNIT as usize != 0 || hdr_len > data.len() {
        return Err(ParseError::BadHeader("implausible length"));
    }

    let meta = parse_meta(&data[np + 4..hdr_len]);

    let hdr_len = hdr_len as u32;
    let mut counts = BTreeMap::new();
    // An upper bound on chain length: every record costs at least one
    // record unit.
    let max_chain = data.len() / RECORD_UNIT as usize + 1;

    for bucket in 0..NUM_BUCKETS {
        let head_off = hdr_len + HASH_OFF + 4 * bucket;
        let mut off =
            read_u32(data, head_off).ok_or(ParseError::Truncated { off: head_off })?;
        let mut steps = 0;
        while off != 0 && off != TOMBSTONE {
            steps += 1;
            if steps > max_chain {
                return Err(ParseError::ChainLoop { bucket });
            }
            let (name, value, next) = record_at(data, off, hdr_len)?;
            if counts.insert(name.clone(), value).is_some() {
                return Err(ParseError::DuplicateName { name });
            }
            off = next;
        }
    }

    Ok(CounterData { meta, counts })
}

fn record_at(data: &[u8], off: u32, hdr_len: u32) -> Result<(String, u64, u32), ParseError> {
    if off < hdr_len + HASH_OFF + 4 * NUM_BUCKETS || off % RECORD_UNIT != 0 {
        return Err(ParseError::BadRecord {
            off,
            reason: "offset outside record area",
        });
    }
    let tag = read_u32(data, off + 8).ok_or(ParseError::Truncated { off })?;
    if tag >> 24 != 0xff {
        return Err(ParseError::BadRecord {
            off,
            reason: "reachable record not committed",
        });
    }
    let name_len = tag & 0x00ff_ffff;
    if name_len == 0 || name_len as usize > MAX_NAME_LEN {
        return Err(ParseError::BadRecord {
            off,
            reason: "implausible name length",
        });
    }
    let name_start = off as usize + 16;
    let name_end = name_start + name_len as usize;
    if name_end > data.len() {
        return Err(ParseError::Truncated { off });
    }
    let name = String::from_utf8_lossy(&data[name_start..name_end]).into_owned();

    let value = read_u64(data, off).ok_or(ParseError::Truncated { off })?;
    let next = read_u32(data, off + 12).ok_or(ParseError::Truncated { off })?;
    Ok((name, value, next))
}

/// Decode the `Key: value` lines of the metadata block. The block is
/// NUL-padded to the header length and terminated by a blank line.
fn parse_meta(block: &[u8]) -> BTreeMap<String, String> {
    let text = match block.iter().position(|&b| b == 0) {
        Some(end) => &block[..end],
        None => block,
    };
    let text = String::from_utf8_lossy(text);
    let mut meta = BTreeMap::new();
    for line in text.lines() {
        if line.is_empty() {
            break;
        }
        if let Some((key, value)) = line.split_once(": ") {
            meta.insert(key.to_owned(), value.to_owned());
        }
    }
    meta
}

// Counter files are written through atomics in native byte order, so they
// are read back the same way; a file never travels between architectures
// (the metadata pins arch).
fn read_u32(data: &[u8], off: u32) -> Option<u32> {
    let off = off as usize;
    Some(u32::from_ne_bytes(data.get(off..off + 4)?.try_into().ok()?))
}

fn read_u64(data: &[u8], off: u32) -> Option<u64> {
    let off = off as usize;
    Some(u64::from_ne_bytes(data.get(off..off + 8)?.try_into().ok()?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mapped::MappedFile;
    use std::sync::atomic::Ordering;

    const META: &str = "Program: p\nVersion: v1\n\n";

    fn build_file(names: &[(&str, u64)]) -> (tempfile::TempDir, std::path::PathBuf) {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("p.v1.count");
        let mut m = MappedFile::open(&path, META, None).unwrap();
        for &(name, n) in names {
            let (m2, off) = MappedFile::new_counter(&m, name).unwrap();
            m2.value_at(off).fetch_add(n, Ordering::Relaxed);
            m = m2;
        }
        (dir, path)
    }

    #[test]
    fn round_trip() {
        let (_dir, path) = build_file(&[("a", 1), ("b", 2), ("dir/op:variant", 40)]);
        let parsed = parse_file(&path).unwrap();
        assert_eq!(parsed.counts.len(), 3);
        assert_eq!(parsed.counts["a"], 1);
        assert_eq!(parsed.counts["b"], 2);
        assert_eq!(parsed.counts["dir/op:variant"], 40);
        assert_eq!(parsed.meta["Program"], "p");
        assert_eq!(parsed.meta["Version"], "v1");
    }

    #[test]
    fn empty_file_parses() {
        let (_dir, path) = build_file(&[]);
        let parsed = parse_file(&path).unwrap();
        assert!(parsed.counts.is_empty());
        assert_eq!(parsed.meta["Program"], "p");
    }

    #[test]
    fn many_names_round_trip() {
        let names: Vec<(String, u64)> = (0..300)
            .map(|i| (format!("counter/{i:03}"), i as u64 + 1))
            .collect();
        let pairs: Vec<(&str, u64)> = names.iter().map(|(n, v)| (n.as_str(), *v)).collect();
        let (_dir, path) = build_file(&pairs);
        let parsed = parse_file(&path).unwrap();
        assert_eq!(parsed.counts.len(), 300);
        for (n, v) in &names {
            assert_eq!(parsed.counts.get(n.as_str()), Some(v), "counter {n}");
        }
    }

    #[test]
    fn wrong_magic_rejected() {
        let mut data = vec![0u8; 4096];
        data[..28].copy_from_slice(b"# telemetry/counter file v0\n");
        assert!(matches!(parse(&data), Err(ParseError::BadMagic)));
    }

    #[test]
    fn truncated_header_rejected() {
        assert!(matches!(
            parse(HDR_PREFIX),
            Err(ParseError::BadHeader(_))
        ));
    }

    #[test]
    fn implausible_header_length_rejected() {
        let mut data = vec![0u8; 4096];
        data[..28].copy_from_slice(HDR_PREFIX);
        data[28..32].copy_from_slice(&u32::MAX.to_ne_bytes());
        assert!(matches!(parse(&data), Err(ParseError::BadHeader(_))));
    }

    #[test]
    fn dangling_chain_rejected() {
        let (_dir, path) = build_file(&[("a", 1)]);
        let mut data = std::fs::read(&path).unwrap();
        // Point a bucket head into the void.
        let hdr_len = u32::from_ne_bytes(data[28..32].try_into().unwrap());
        let head_off = (hdr_len + HASH_OFF) as usize;
        data[head_off..head_off + 4].copy_from_slice(&0x10000u32.to_ne_bytes());
        assert!(parse(&data).is_err());
    }
}
