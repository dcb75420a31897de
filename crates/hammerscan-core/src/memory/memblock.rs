use std::ops::Range;
use std::ptr::null_mut;

use super::BytePointer;
use crate::util::{PAGE_MASK, PAGE_SIZE};
use libc::{MAP_ANONYMOUS, MAP_POPULATE, MAP_PRIVATE};
use log::{debug, trace};

/// An anonymous memory mapping owned by this process.
///
/// The mapping is unmapped when the value is dropped.
#[derive(Debug)]
pub struct Memory {
    /// Block pointer
    pub ptr: *mut u8,
    /// Block length in bytes
    pub len: usize,
}

unsafe impl Send for Memory {}

impl Memory {
    /// Maps `size` bytes of anonymous memory and faults every page in.
    ///
    /// The first word of every page is set to the page index so that no two
    /// pages share contents and the kernel cannot merge them.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if mmap fails.
    pub fn mmap(size: usize) -> std::result::Result<Self, std::io::Error> {
        let size = size.next_multiple_of(PAGE_SIZE);
        let p = unsafe {
            libc::mmap(
                null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                MAP_PRIVATE | MAP_ANONYMOUS | MAP_POPULATE,
                -1,
                0,
            )
        };
        if p == libc::MAP_FAILED {
            return Err(std::io::Error::last_os_error());
        }
        let memory = Memory {
            ptr: p as *mut u8,
            len: size,
        };
        for (i, page) in (0..size).step_by(PAGE_SIZE).enumerate() {
            unsafe { (memory.ptr.add(page) as *mut u64).write_volatile(i as u64) };
        }
        debug!("Mapped {} bytes at {:p}", size, memory.ptr);
        Ok(memory)
    }

    /// Number of pages in this mapping.
    pub fn pages(&self) -> usize {
        self.len / PAGE_SIZE
    }

    /// Whether `addr` points into this mapping.
    pub fn contains(&self, addr: *const u8) -> bool {
        let addr = addr as usize;
        addr >= self.ptr as usize && addr < self.ptr as usize + self.len
    }

    /// Deallocates the memory block.
    ///
    /// Unmaps the memory region using munmap. Consumes self.
    pub fn dealloc(self) {
        drop(self)
    }

    /// Gives up ownership of the mapping without unmapping it.
    pub(crate) fn into_raw(self) -> (*mut u8, usize) {
        let this = std::mem::ManuallyDrop::new(self);
        (this.ptr, this.len)
    }
}

impl Drop for Memory {
    fn drop(&mut self) {
        if let Err(e) = unmap(self.ptr, self.len) {
            log::error!("Failed to unmap {:p} (+{} bytes): {}", self.ptr, self.len, e);
        }
    }
}

impl BytePointer for Memory {
    fn addr(&self, offset: usize) -> *mut u8 {
        assert!(
            offset < self.len,
            "Memory::addr failed. Offset {} >= {}",
            offset,
            self.len
        );
        unsafe { self.ptr.byte_add(offset) }
    }

    fn ptr(&self) -> *mut u8 {
        self.ptr
    }

    fn len(&self) -> usize {
        self.len
    }
}

/// Unmaps `len` bytes starting at `ptr`.
///
/// # Errors
///
/// Returns the OS error if munmap fails.
pub(crate) fn unmap(ptr: *mut u8, len: usize) -> std::io::Result<()> {
    trace!("munmap {:p} (+{} bytes)", ptr, len);
    if unsafe { libc::munmap(ptr as *mut libc::c_void, len) } != 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

/// Computes the byte ranges of `base..base + len` that are not covered by a page in `keep`.
///
/// Adjacent released pages are coalesced into a single range. Addresses in
/// `keep` are rounded down to their page, duplicates and addresses outside the
/// mapping are ignored.
pub(crate) fn release_ranges(base: usize, len: usize, keep: &[usize]) -> Vec<Range<usize>> {
    let end = base + len;
    let mut keep = keep
        .iter()
        .map(|addr| addr & !PAGE_MASK)
        .filter(|page| *page >= base && *page < end)
        .collect::<Vec<_>>();
    keep.sort_unstable();
    keep.dedup();
    let mut ranges = vec![];
    let mut cursor = base;
    for page in keep {
        if page > cursor {
            ranges.push(cursor..page);
        }
        cursor = page + PAGE_SIZE;
    }
    if cursor < end {
        ranges.push(cursor..end);
    }
    ranges
}
