//! Raw access to watched memory.
//!
//! Watched bytes are shared with threads the core does not control, so all
//! access goes through volatile reads and writes on raw pointers.

#![allow(unsafe_code)]

use crate::error::Error;
use nix::sys::mman::{MapFlags, ProtFlags, mmap_anonymous, munmap};
use nix::unistd::{SysconfVar, sysconf};
use std::num::NonZeroUsize;
use std::ptr::NonNull;
use std::sync::OnceLock;

const FALLBACK_PAGE_SIZE: usize = 4096;

/// Page size of the running system.
pub fn page_size() -> usize {
    static PAGE_SIZE: OnceLock<usize> = OnceLock::new();
    *PAGE_SIZE.get_or_init(|| match sysconf(SysconfVar::PAGE_SIZE) {
        Ok(Some(size)) if size > 0 => size as usize,
        _ => FALLBACK_PAGE_SIZE,
    })
}

pub fn page_base(address: usize) -> usize {
    address & !(page_size() - 1)
}

pub fn is_page_aligned(address: usize) -> bool {
    address % page_size() == 0
}

/// Copy `len` bytes starting at `base`.
///
/// # Safety
///
/// `base..base + len` must be mapped and readable for the duration of the
/// call.
pub unsafe fn read_bytes(base: usize, len: usize) -> Vec<u8> {
    let ptr = base as *const u8;
    let mut out = Vec::with_capacity(len);
    for i in 0..len {
        // SAFETY: caller guarantees the range is readable.
        out.push(unsafe { std::ptr::read_volatile(ptr.add(i)) });
    }
    out
}

/// Page-aligned anonymous memory suitable for registration.
///
/// The mapping is released on drop; unregister it from the watcher before
/// dropping.
#[derive(Debug)]
pub struct PageBuffer {
    ptr: NonNull<u8>,
    len: usize,
}

// SAFETY: the buffer owns its mapping and only hands out copies; every access
// is a volatile read or write of a single byte.
unsafe impl Send for PageBuffer {}
unsafe impl Sync for PageBuffer {}

impl PageBuffer {
    /// Map `pages` zero-filled pages.
    pub fn new(pages: usize) -> Result<Self, Error> {
        let len = pages
            .checked_mul(page_size())
            .and_then(NonZeroUsize::new)
            .ok_or_else(|| Error::Allocation(format!("invalid page count {pages}")))?;

        // SAFETY: anonymous private mapping at a kernel-chosen address does
        // not alias any existing Rust object.
        let ptr = unsafe {
            mmap_anonymous(
                None,
                len,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_PRIVATE,
            )
        }
        .map_err(|err| Error::Allocation(format!("mmap of {len} bytes failed: {err}")))?;

        let buffer = Self {
            ptr: ptr.cast(),
            len: len.get(),
        };
        // Touch every page so it is resident before write protection is armed.
        for page in 0..pages {
            buffer.write(page * page_size(), &[0]);
        }
        Ok(buffer)
    }

    pub fn base_address(&self) -> usize {
        self.ptr.as_ptr() as usize
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// # Panics
    ///
    /// Panics if the write would run past the end of the buffer.
    pub fn write(&self, offset: usize, bytes: &[u8]) {
        assert!(
            offset.checked_add(bytes.len()).is_some_and(|end| end <= self.len),
            "write of {} bytes at {offset} overflows {}-byte buffer",
            bytes.len(),
            self.len
        );
        let ptr = self.ptr.as_ptr();
        for (i, byte) in bytes.iter().enumerate() {
            // SAFETY: bounds checked above; the mapping lives as long as self.
            unsafe { std::ptr::write_volatile(ptr.add(offset + i), *byte) };
        }
    }

    /// # Panics
    ///
    /// Panics if `offset` is out of bounds.
    pub fn read(&self, offset: usize) -> u8 {
        assert!(offset < self.len, "read at {offset} outside {}-byte buffer", self.len);
        // SAFETY: bounds checked above.
        unsafe { std::ptr::read_volatile(self.ptr.as_ptr().add(offset)) }
    }

    pub fn to_vec(&self) -> Vec<u8> {
        // SAFETY: the whole mapping is readable while self is alive.
        unsafe { read_bytes(self.base_address(), self.len) }
    }
}

impl Drop for PageBuffer {
    fn drop(&mut self) {
        // SAFETY: ptr/len describe the mapping created in `new`.
        if let Err(err) = unsafe { munmap(self.ptr.cast(), self.len) } {
            tracing::warn!(%err, "munmap failed");
        }
    }
}
