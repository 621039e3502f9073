//! File-backed shared memory mappings.
//!
//! This crate is the thin platform layer under the tally counter store: it
//! maps a counter file read-write and shared, so that every process mapping
//! the same file sees the same bytes and can coordinate through atomic
//! operations on them. The mapping is unmapped when the [`Mapping`] value is
//! dropped; callers that need the region to outlive a handoff keep the value
//! alive instead of copying pointers around.

#![forbid(unsafe_op_in_unsafe_fn)]

#[cfg(not(unix))]
compile_error!("tally-mmap supports Unix platforms only");

use std::fs::File;
use std::io;
use std::os::fd::AsRawFd;
use std::ptr::NonNull;

/// A shared, read-write memory mapping of the leading `len` bytes of a file.
pub struct Mapping {
    ptr: NonNull<u8>,
    len: usize,
}

// SAFETY: the mapping is plain shared memory; all concurrent access goes
// through atomic operations or caller-synchronized raw pointers.
unsafe impl Send for Mapping {}
unsafe impl Sync for Mapping {}

impl Mapping {
    /// Map the first `len` bytes of `file` shared and read-write.
    ///
    /// `previous` is a hint carried over from a superseded mapping of the
    /// same file. The Unix implementation lets the kernel pick the placement
    /// and ignores it; platforms that must reuse an address range may not.
    pub fn map(file: &File, len: usize, previous: Option<&Mapping>) -> io::Result<Mapping> {
        let _ = previous;
        if len == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "cannot map an empty file",
            ));
        }

        // SAFETY: the fd is valid for the duration of the call and the
        // region is MAP_SHARED, so the mapping stays valid even after the
        // file descriptor is closed.
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                file.as_raw_fd(),
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }

        Ok(Mapping {
            // mmap never returns null on success
            ptr: NonNull::new(ptr as *mut u8).expect("mmap returned null"),
            len,
        })
    }

    /// Base address of the mapping. Page-aligned.
    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    /// Length of the mapping in bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the mapping is empty. Never true for a successfully created
    /// mapping.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// View the mapping as a byte slice.
    ///
    /// # Safety
    ///
    /// Other processes write the region concurrently. The caller must only
    /// draw conclusions from bytes it knows are quiescent (for example,
    /// record contents published by an atomic store with release ordering).
    pub unsafe fn as_slice(&self) -> &[u8] {
        // SAFETY: ptr/len describe a live mapping; aliasing is the caller's
        // contract per above.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }
}

impl Drop for Mapping {
    fn drop(&mut self) {
        // SAFETY: ptr/len came from a successful mmap and are unmapped
        // exactly once.
        unsafe {
            libc::munmap(self.ptr.as_ptr() as *mut libc::c_void, self.len);
        }
    }
}
