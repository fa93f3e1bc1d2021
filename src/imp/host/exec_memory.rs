// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0
//! Page-granular memory whose protection can be changed after it was written.
//!
//! Loaded code is written while the pages are read-write and switched to read+execute
//! afterwards; pages are never writable and executable at the same time.

use std::ops::Range;
use std::ptr::NonNull;

use super::elf::ElfError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Protection {
    ReadWrite,
    ReadOnly,
    ReadExecute,
}

/// An anonymous private mapping.
#[derive(Debug)]
pub(crate) struct ExecMemory {
    ptr: NonNull<u8>,
    len: usize,
}

// SAFETY: the mapping is owned by this value; access is synchronized by its owner.
unsafe impl Send for ExecMemory {}
unsafe impl Sync for ExecMemory {}

pub(crate) fn page_size() -> usize {
    #[cfg(unix)]
    {
        // SAFETY: sysconf has no preconditions
        let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        if size > 0 {
            return size as usize;
        }
    }
    4096
}

impl ExecMemory {
    /// Maps at least `len` zeroed, read-write bytes.
    #[cfg(unix)]
    pub(crate) fn new(len: usize) -> Result<Self, ElfError> {
        let len = len.max(1).next_multiple_of(page_size());
        // SAFETY: anonymous mapping without a fixed address
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(ElfError::Map(std::io::Error::last_os_error().to_string()));
        }
        NonNull::new(ptr.cast::<u8>())
            .map(|ptr| ExecMemory { ptr, len })
            .ok_or_else(|| ElfError::Map("mmap returned null".to_string()))
    }

    #[cfg(not(unix))]
    pub(crate) fn new(_len: usize) -> Result<Self, ElfError> {
        Err(ElfError::Map("executable memory is only implemented for unix hosts".to_string()))
    }

    pub(crate) fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    pub(crate) fn len(&self) -> usize {
        self.len
    }

    /// # Safety
    /// The pages must currently be writable and nothing may execute from them meanwhile.
    pub(crate) unsafe fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: the mapping is `len` bytes long and owned by self
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }

    /// Changes the protection of the pages covering `range`.
    #[cfg(unix)]
    pub(crate) fn protect_range(&self, range: Range<usize>, protection: Protection) -> Result<(), ElfError> {
        let page = page_size();
        let start = range.start - range.start % page;
        let end = range.end.next_multiple_of(page).min(self.len);
        if start >= end {
            return Ok(());
        }
        let prot = match protection {
            Protection::ReadWrite => libc::PROT_READ | libc::PROT_WRITE,
            Protection::ReadOnly => libc::PROT_READ,
            Protection::ReadExecute => libc::PROT_READ | libc::PROT_EXEC,
        };
        // SAFETY: the page-aligned range lies within our own mapping
        let result = unsafe { libc::mprotect(self.ptr.as_ptr().add(start).cast(), end - start, prot) };
        if result != 0 {
            return Err(ElfError::Map(std::io::Error::last_os_error().to_string()));
        }
        Ok(())
    }

    #[cfg(not(unix))]
    pub(crate) fn protect_range(&self, _range: Range<usize>, _protection: Protection) -> Result<(), ElfError> {
        Err(ElfError::Map("executable memory is only implemented for unix hosts".to_string()))
    }
}

impl Drop for ExecMemory {
    fn drop(&mut self) {
        #[cfg(unix)]
        // SAFETY: we own the mapping and nothing refers to it any more
        unsafe {
            libc::munmap(self.ptr.as_ptr().cast(), self.len);
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[test]
    fn mappings_are_page_sized_and_zeroed() {
        let mut memory = ExecMemory::new(10).unwrap();
        assert_eq!(memory.len() % page_size(), 0);
        let bytes = unsafe { memory.as_mut_slice() };
        assert!(bytes.iter().all(|b| *b == 0));
        bytes[0] = 0xc3;
        memory.protect_range(0..1, Protection::ReadOnly).unwrap();
        assert_eq!(unsafe { *memory.as_ptr() }, 0xc3);
    }
}
