//! A counter file mapped into memory.
//!
//! All cross-process coordination happens through atomic loads and
//! compare-and-swaps on the mapped bytes. Space for new records is reserved
//! by a CAS on the allocation limit in the header; records are published by
//! a release store of their length tag and a CAS on their bucket head. Any
//! interleaving of writers yields a correct hash table, at worst with a few
//! tombstoned duplicate records that lost a linking race.

use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::ptr;
use std::slice;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use tally_mmap::Mapping;

use crate::error::CounterError;
use crate::hash::{bucket, round_u32};
use crate::layout::{
    self, HASH_OFF, LIMIT_OFF, MAX_NAME_LEN, MIN_FILE_LEN, PAGE_SIZE, TOMBSTONE,
};

/// One mapping of one counter file.
///
/// A `MappedFile` is superseded (never mutated) when the file grows or
/// rotates; resolved slots keep their `Arc` so a superseded mapping stays
/// valid until the last slot referencing it is refreshed. The file handle is
/// dropped as soon as a replacement mapping exists; the mapping itself is
/// unmapped by `Mapping`'s `Drop`.
pub(crate) struct MappedFile {
    path: PathBuf,
    meta: String,
    hdr_len: u32,
    file: Mutex<Option<File>>,
    mapping: Mapping,
}

/// Result of a bucket chain walk that stayed inside the mapping.
pub(crate) struct Lookup {
    /// Offset of the record whose name matched, if any.
    pub value_off: Option<u32>,
    /// Offset of this name's bucket head.
    pub head_off: u32,
    /// Head value observed at the start of the walk.
    pub head: u32,
}

impl MappedFile {
    /// Open or create the counter file at `path` and map it.
    ///
    /// A new (or shorter-than-minimum) file gets the header and metadata
    /// written and is extended to the minimum length first. An existing file
    /// that does not start with the exact expected header is refused:
    /// processes sharing a file must agree on program identity and time
    /// window.
    ///
    /// `previous` is the superseded mapping when remapping after growth,
    /// passed to the platform layer as a placement hint.
    pub(crate) fn open(
        path: &Path,
        meta: &str,
        previous: Option<&MappedFile>,
    ) -> Result<Arc<MappedFile>, CounterError> {
        let hdr = layout::header_bytes(meta)?;

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)?;

        let mut size = file.metadata()?.len();
        if size < MIN_FILE_LEN {
            file.write_all_at(&hdr, 0)?;
            // A short trailing write extends the file to the minimum length;
            // the gap reads back as zeros.
            file.write_all_at(&[0u8; 4], MIN_FILE_LEN - 4)?;
            size = file.metadata()?.len();
            if size < MIN_FILE_LEN {
                return Err(CounterError::Io(io::Error::other(
                    "writing the header did not extend the file",
                )));
            }
        }

        let mapping = Mapping::map(&file, size as usize, previous.map(|p| &p.mapping))?;

        // SAFETY: the header region is written before any process starts
        // allocating records and is immutable afterwards.
        let data = unsafe { mapping.as_slice() };
        if data.len() < hdr.len() || data[..hdr.len()] != hdr[..] {
            return Err(CounterError::HeaderMismatch);
        }

        Ok(Arc::new(MappedFile {
            path: path.to_path_buf(),
            meta: meta.to_owned(),
            hdr_len: hdr.len() as u32,
            file: Mutex::new(Some(file)),
            mapping,
        }))
    }

    pub(crate) fn path(&self) -> &Path {
        &self.path
    }

    fn len(&self) -> u32 {
        self.mapping.len() as u32
    }

    /// Drop the file handle. The mapping stays valid; extension after this
    /// point reopens the file by path.
    pub(crate) fn close_file(&self) {
        *self.file.lock() = None;
    }

    fn file_len(&self) -> io::Result<u64> {
        match &*self.file.lock() {
            Some(f) => f.metadata().map(|m| m.len()),
            None => std::fs::metadata(&self.path).map(|m| m.len()),
        }
    }

    fn write_zeros_at(&self, off: u64) -> io::Result<()> {
        match &*self.file.lock() {
            Some(f) => f.write_all_at(&[0u8; 4], off),
            None => OpenOptions::new()
                .write(true)
                .open(&self.path)?
                .write_all_at(&[0u8; 4], off),
        }
    }

    /// Atomic u32 view of the 4 bytes at `off`.
    fn atomic_u32(&self, off: u32) -> &AtomicU32 {
        assert!(off % 4 == 0 && off + 4 <= self.len(), "bad u32 offset {off:#x}");
        // SAFETY: in bounds and 4-aligned (the mapping base is
        // page-aligned), and all concurrent access to these bytes is
        // atomic in every sharing process.
        unsafe { &*(self.mapping.as_ptr().add(off as usize) as *const AtomicU32) }
    }

    /// Atomic u64 view of a record's value word.
    pub(crate) fn value_at(&self, off: u32) -> &AtomicU64 {
        assert!(off % 8 == 0 && off + 8 <= self.len(), "bad u64 offset {off:#x}");
        // SAFETY: as `atomic_u32`; record starts are 32-byte aligned.
        unsafe { &*(self.mapping.as_ptr().add(off as usize) as *const AtomicU64) }
    }

    /// Load the u32 at `off`, or 0 when `off` is outside the mapping.
    fn load32(&self, off: u32) -> u32 {
        if off % 4 != 0 || off.saturating_add(4) > self.len() {
            return 0;
        }
        self.atomic_u32(off).load(Ordering::Acquire)
    }

    fn cas32(&self, off: u32, old: u32, new: u32) -> bool {
        // An out-of-range CAS means the caller's bookkeeping is broken;
        // returning false would spin forever. atomic_u32 asserts.
        self.atomic_u32(off)
            .compare_exchange(old, new, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Decode the record at `off`: `(name bytes, next offset)`.
    ///
    /// `None` means the offset or record does not validate against this
    /// mapping; the caller decides whether that is staleness (the file grew
    /// past the mapping) or corruption.
    fn entry_at(&self, off: u32) -> Option<(&[u8], u32)> {
        if off < self.hdr_len + HASH_OFF
            || off % layout::RECORD_UNIT != 0
            || off as u64 + 16 > self.len() as u64
        {
            return None;
        }
        let name_len = self.load32(off + 8) & 0x00ff_ffff;
        if name_len == 0
            || name_len as usize > MAX_NAME_LEN
            || off as u64 + 16 + name_len as u64 > self.len() as u64
        {
            return None;
        }
        // SAFETY: in bounds per the checks above. Name bytes are written
        // before the length tag's release store, and the tag was observed by
        // an acquire load, so the bytes are immutable from here on.
        let name = unsafe {
            slice::from_raw_parts(
                self.mapping.as_ptr().add(off as usize + 16),
                name_len as usize,
            )
        };
        let next = self.load32(off + 12);
        Some((name, next))
    }

    /// Copy the name into the reserved record at `off` and commit it by
    /// storing the length tag. The record is not yet reachable.
    fn write_entry_at(&self, off: u32, name: &[u8]) -> bool {
        if off < self.hdr_len + HASH_OFF
            || off as u64 + 16 + name.len() as u64 > self.len() as u64
        {
            return false;
        }
        // SAFETY: [off+16, off+16+len) was reserved for this record by the
        // allocation-limit CAS; no other writer touches it.
        unsafe {
            ptr::copy_nonoverlapping(
                name.as_ptr(),
                self.mapping.as_ptr().add(off as usize + 16),
                name.len(),
            );
        }
        // Release-publish the name bytes; chain walkers load the tag with
        // acquire ordering.
        self.atomic_u32(off + 8)
            .store(name.len() as u32 | 0xff00_0000, Ordering::Release);
        true
    }

    /// Walk the bucket chain for `name`.
    ///
    /// `None` signals that the walk referenced an offset past this mapping,
    /// usually because another process grew the file; the caller must remap
    /// and retry.
    pub(crate) fn lookup(&self, name: &[u8]) -> Option<Lookup> {
        let head_off = self.hdr_len + HASH_OFF + 4 * bucket(name);
        let head = self.load32(head_off);
        let mut off = head;
        while off != 0 {
            let (ename, next) = self.entry_at(off)?;
            if ename == name {
                return Some(Lookup {
                    value_off: Some(off),
                    head_off,
                    head,
                });
            }
            off = next;
        }
        Some(Lookup {
            value_off: None,
            head_off,
            head,
        })
    }

    /// Find or create the record for `name`.
    ///
    /// Returns the mapping the record lives in and the record offset. The
    /// returned mapping is `this` unless the file had to be remapped or
    /// extended; the caller must then install the replacement as the active
    /// mapping and invalidate handles.
    pub(crate) fn new_counter(
        this: &Arc<MappedFile>,
        name: &str,
    ) -> Result<(Arc<MappedFile>, u32), CounterError> {
        if name.len() > MAX_NAME_LEN {
            return Err(CounterError::NameTooLong(name.len()));
        }
        let name = name.as_bytes();
        let mut m = Arc::clone(this);

        // Look the name up, remapping as long as the chain escapes the
        // current mapping.
        let (head_off, mut head) = loop {
            match m.lookup(name) {
                Some(l) => {
                    if let Some(off) = l.value_off {
                        return Ok((m, off));
                    }
                    break (l.head_off, l.head);
                }
                None => {
                    let limit = m.load32(m.hdr_len + LIMIT_OFF);
                    if limit as u64 <= m.mapping.len() as u64 {
                        // The mapping covers the allocation limit, so the
                        // walk found actual corruption rather than growth.
                        debug!(limit, len = m.mapping.len(), "chain walk failed inside mapping");
                        return Err(CounterError::Corrupt);
                    }
                    let new_m = MappedFile::open(&m.path, &m.meta, Some(&*m))?;
                    if new_m.mapping.len() <= m.mapping.len() {
                        // The limit claims space past the file itself; a
                        // remap that cannot grow would retry forever.
                        debug!(limit, len = m.mapping.len(), "allocation limit past end of file");
                        return Err(CounterError::Corrupt);
                    }
                    m.close_file();
                    m = new_m;
                }
            }
        };

        // Reserve space for the record. Writers in every process compete on
        // the allocation limit with a CAS; winning the CAS is the sole claim
        // to [start, end).
        let start;
        loop {
            let limit = m.load32(m.hdr_len + LIMIT_OFF);
            let (s, e) = layout::place(m.hdr_len, limit, name.len() as u32);
            debug!(name = %String::from_utf8_lossy(name), start = s, end = e, "place");
            if e as u64 > m.mapping.len() as u64 {
                let new_m = MappedFile::extend(&m, e)?;
                m = new_m;
                continue;
            }
            if m.cas32(m.hdr_len + LIMIT_OFF, limit, e) {
                start = s;
                break;
            }
        }

        if !m.write_entry_at(start, name) {
            // More likely our placement math is wrong than the file is bad.
            debug!(start, len = m.mapping.len(), "reserved record does not fit mapping");
            return Err(CounterError::Corrupt);
        }

        // Link the record into its bucket chain, making sure not to
        // introduce a duplicate. `name` is known not to appear in the chain
        // starting at `head`.
        loop {
            m.atomic_u32(start + 12).store(head, Ordering::Release);
            if m.cas32(head_off, head, start) {
                return Ok((m, start));
            }

            // Another writer got in first. Check only the new prefix of the
            // chain for our name; everything from `old` on was checked
            // before.
            let old = head;
            head = m.load32(head_off);
            let mut off = head;
            while off != old {
                let Some((ename, enext)) = m.entry_at(off) else {
                    return Err(CounterError::Corrupt);
                };
                if ename == name {
                    // Lost the race to an identical name: tombstone our
                    // record and use the winner's. The reserved space is
                    // never reclaimed.
                    m.atomic_u32(start + 12).store(TOMBSTONE, Ordering::Release);
                    return Ok((m, off));
                }
                off = enext;
            }
        }
    }

    /// Grow the file so that a record ending at `end` fits, and remap.
    ///
    /// The old mapping stays valid for already-resolved slots; its file
    /// handle is dropped once the replacement exists.
    fn extend(this: &Arc<MappedFile>, end: u32) -> Result<Arc<MappedFile>, CounterError> {
        let end = round_u32(end, PAGE_SIZE);
        if this.file_len()? < end as u64 {
            this.write_zeros_at(end as u64 - 4)?;
        }
        let new_m = MappedFile::open(&this.path, &this.meta, Some(&**this))?;
        this.close_file();
        Ok(new_m)
    }
}

impl std::fmt::Debug for MappedFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MappedFile")
            .field("path", &self.path)
            .field("len", &self.mapping.len())
            .field("hdr_len", &self.hdr_len)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::Ordering;

    const META: &str = "Program: t\nVersion: devel\n\n";

    fn open_temp() -> (tempfile::TempDir, Arc<MappedFile>) {
        let dir = tempfile::TempDir::new().unwrap();
        let m = MappedFile::open(&dir.path().join("t.v1.count"), META, None).unwrap();
        (dir, m)
    }

    #[test]
    fn creates_minimum_length_file() {
        let (dir, m) = open_temp();
        let len = std::fs::metadata(dir.path().join("t.v1.count"))
            .unwrap()
            .len();
        assert_eq!(len, MIN_FILE_LEN);
        assert_eq!(m.len() as u64, MIN_FILE_LEN);
    }

    #[test]
    fn allocates_and_finds_counters() {
        let (_dir, m) = open_temp();

        let (m1, a) = MappedFile::new_counter(&m, "a").unwrap();
        assert!(Arc::ptr_eq(&m1, &m));
        m.value_at(a).fetch_add(1, Ordering::Relaxed);

        let (_, b) = MappedFile::new_counter(&m, "b").unwrap();
        m.value_at(b).fetch_add(2, Ordering::Relaxed);
        assert_ne!(a, b);

        // Finding an existing record returns the same offset.
        let (_, a2) = MappedFile::new_counter(&m, "a").unwrap();
        assert_eq!(a, a2);
        assert_eq!(m.value_at(a).load(Ordering::Relaxed), 1);
        assert_eq!(m.value_at(b).load(Ordering::Relaxed), 2);
    }

    #[test]
    fn values_survive_reopen() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("t.v1.count");
        {
            let m = MappedFile::open(&path, META, None).unwrap();
            let (_, off) = MappedFile::new_counter(&m, "persisted").unwrap();
            m.value_at(off).fetch_add(7, Ordering::Relaxed);
        }
        let m = MappedFile::open(&path, META, None).unwrap();
        let (_, off) = MappedFile::new_counter(&m, "persisted").unwrap();
        assert_eq!(m.value_at(off).load(Ordering::Relaxed), 7);
    }

    #[test]
    fn differing_metadata_refused() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("t.v1.count");
        MappedFile::open(&path, META, None).unwrap();
        let err = MappedFile::open(&path, "Program: other\n\n", None).unwrap_err();
        assert!(matches!(err, CounterError::HeaderMismatch));
    }

    #[test]
    fn wrong_magic_refused() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("t.v1.count");
        let mut data = vec![0u8; MIN_FILE_LEN as usize];
        data[..28].copy_from_slice(b"# telemetry/counter file v0\n");
        std::fs::write(&path, &data).unwrap();
        let err = MappedFile::open(&path, META, None).unwrap_err();
        assert!(matches!(err, CounterError::HeaderMismatch));
    }

    #[test]
    fn name_length_budget() {
        let (_dir, m) = open_temp();
        let max = "n".repeat(MAX_NAME_LEN);
        let (_, off) = MappedFile::new_counter(&m, &max).unwrap();
        assert!(off > 0);

        let over = "n".repeat(MAX_NAME_LEN + 1);
        assert!(matches!(
            MappedFile::new_counter(&m, &over),
            Err(CounterError::NameTooLong(_))
        ));
    }

    #[test]
    fn extension_grows_file_and_keeps_values() {
        let (dir, m) = open_temp();
        let mut m = m;

        let (m0, first) = MappedFile::new_counter(&m, "first").unwrap();
        m0.value_at(first).fetch_add(5, Ordering::Relaxed);
        m = m0;

        // Fill the first page; 200-byte names take 224 bytes per record.
        for i in 0..20 {
            let name = format!("{i:0>200}");
            let (next, off) = MappedFile::new_counter(&m, &name).unwrap();
            next.value_at(off).fetch_add(1, Ordering::Relaxed);
            m = next;
        }

        let len = std::fs::metadata(dir.path().join("t.v1.count"))
            .unwrap()
            .len();
        assert!(len > MIN_FILE_LEN, "file did not grow: {len}");
        assert_eq!(len % PAGE_SIZE as u64, 0);

        // The original name still resolves, in the newest mapping, with its
        // value intact.
        let (m2, first2) = MappedFile::new_counter(&m, "first").unwrap();
        assert_eq!(m2.value_at(first2).load(Ordering::Relaxed), 5);
    }

    #[test]
    fn stale_mapping_catches_up_after_external_growth() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("t.v1.count");
        let stale = MappedFile::open(&path, META, None).unwrap();

        // Another "process" grows the file past the stale mapping.
        let mut fresh = Arc::clone(&stale);
        for i in 0..20 {
            let name = format!("{i:0>200}");
            let (next, _) = MappedFile::new_counter(&fresh, &name).unwrap();
            fresh = next;
        }
        assert!(fresh.len() > stale.len());

        // Resolving a fresh name through the stale mapping forces a remap:
        // either the chain walk or the placement escapes its bounds.
        let (m2, off) = MappedFile::new_counter(&stale, "straggler").unwrap();
        assert!(!Arc::ptr_eq(&m2, &stale));
        assert_eq!(m2.value_at(off).load(Ordering::Relaxed), 0);
        assert!(m2.len() >= fresh.len());
    }

    #[test]
    fn concurrent_allocation_single_live_entry() {
        use std::thread;

        let (_dir, m) = open_temp();
        let threads = 8;
        let per_thread = 100u64;

        let mut joins = Vec::new();
        for _ in 0..threads {
            let m = Arc::clone(&m);
            joins.push(thread::spawn(move || {
                for _ in 0..per_thread {
                    let (m2, off) = MappedFile::new_counter(&m, "shared").unwrap();
                    m2.value_at(off).fetch_add(1, Ordering::Relaxed);
                }
            }));
        }
        for j in joins {
            j.join().unwrap();
        }

        let (m2, off) = MappedFile::new_counter(&m, "shared").unwrap();
        assert_eq!(
            m2.value_at(off).load(Ordering::Relaxed),
            threads as u64 * per_thread
        );
    }

    #[test]
    fn allocation_limit_is_monotonic() {
        let (_dir, m) = open_temp();
        let mut last = 0;
        for i in 0..50 {
            let (m2, _) = MappedFile::new_counter(&m, &format!("name-{i}")).unwrap();
            let limit = m2.load32(m2.hdr_len + LIMIT_OFF);
            assert!(limit >= last, "limit went backwards: {limit} < {last}");
            last = limit;
        }
    }
}
