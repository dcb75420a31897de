use std::fmt::{Debug, Formatter};
use std::ops::{Add, Sub};

use crate::util::{PAGE_MASK, PAGE_SHIFT, PAGE_SIZE};
use log::{trace, warn};
use pagemap2::{PageMapError, VirtualMemoryArea};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[repr(transparent)]
#[derive(Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
/// Physical memory address.
///
/// A newtype wrapper around a physical address value. The low [`PAGE_SHIFT`]
/// bits always equal the page offset of the virtual address it was resolved from.
pub struct PhysAddr(usize);

impl Debug for PhysAddr {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_fmt(format_args!("PhysAddr(0x{:02x})", self.0))
    }
}

impl std::fmt::LowerHex for PhysAddr {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        std::fmt::LowerHex::fmt(&self.0, f)
    }
}

impl PhysAddr {
    /// Creates a new physical address.
    pub fn new(addr: usize) -> Self {
        PhysAddr(addr)
    }

    /// Builds the physical address of `virt` from the frame number backing its page.
    pub fn from_pfn(pfn: u64, virt: u64) -> Self {
        PhysAddr(((pfn << PAGE_SHIFT) | (virt & PAGE_MASK as u64)) as usize)
    }

    /// Returns the address as a usize.
    pub fn as_usize(&self) -> usize {
        self.0
    }

    /// Physical frame number of this address.
    pub fn pfn(&self) -> usize {
        self.0 >> PAGE_SHIFT
    }

    /// Address of the first byte of the frame.
    pub fn page_base(&self) -> PhysAddr {
        PhysAddr(self.0 & !PAGE_MASK)
    }

    /// Offset of this address within its frame.
    pub fn page_offset(&self) -> usize {
        self.0 & PAGE_MASK
    }
}

/// Errors of the virtual to physical translation channel.
#[derive(Debug, Error)]
pub enum TranslationError {
    /// The page backing the address is not resident.
    #[error("page of virtual address 0x{virt:x} is not present")]
    NotPresent {
        /// Address that was looked up
        virt: u64,
    },
    /// The kernel reported frame number 0, which it does for unprivileged readers.
    #[error("frame number of virtual address 0x{virt:x} is hidden. Are we root?")]
    FrameHidden {
        /// Address that was looked up
        virt: u64,
    },
    /// The channel returned fewer entries than pages were requested.
    #[error("expected {expected} pagemap entries starting at 0x{virt:x}, got {actual}")]
    ShortRead {
        /// First address of the requested range
        virt: u64,
        /// Requested number of pages
        expected: usize,
        /// Received number of entries
        actual: usize,
    },
    /// Opening or reading the pagemap failed.
    #[error(transparent)]
    PageMap(#[from] PageMapError),
}

/// Trait for resolving virtual addresses to physical addresses.
///
/// Implementors provide methods to translate virtual memory addresses
/// to physical addresses using system interfaces like `/proc/{pid}/pagemap`.
/// Pages must have been touched before translation, the entry of a page that
/// was never faulted in is undefined.
pub trait VirtToPhysResolver {
    /// Translates a virtual address to a physical address.
    ///
    /// # Errors
    ///
    /// Returns an error if the page is not resident, its frame is hidden, or
    /// the translation channel cannot be read.
    fn get_phys(&mut self, virt: u64) -> Result<PhysAddr, TranslationError>;

    /// Translates `pages` consecutive pages starting at the page containing `virt`.
    ///
    /// Returns the physical address of each page base, or `None` for pages
    /// that are not resident or whose frame is hidden.
    ///
    /// # Errors
    ///
    /// Returns an error if the translation channel cannot be read.
    fn get_phys_range(
        &mut self,
        virt: u64,
        pages: usize,
    ) -> Result<Vec<Option<PhysAddr>>, TranslationError>;
}

/// Virtual to physical address translator using Linux pagemap.
///
/// Uses `/proc/{pid}/pagemap` to translate virtual to physical addresses.
/// Requires root privileges to see frame numbers, otherwise every lookup fails
/// with [`TranslationError::FrameHidden`].
pub struct LinuxPageMap {
    pagemap_wrapper: pagemap2::PageMap,
}

impl LinuxPageMap {
    /// Creates a new pagemap for the current process.
    ///
    /// # Errors
    ///
    /// Returns an error if opening `/proc/self/pagemap` fails.
    pub fn new() -> Result<LinuxPageMap, TranslationError> {
        Self::for_process(std::process::id())
    }

    /// Creates a new pagemap for a specific process.
    ///
    /// # Arguments
    ///
    /// * `pid` - Process ID to open pagemap for
    ///
    /// # Errors
    ///
    /// Returns an error if opening the process pagemap fails.
    pub fn for_process(pid: u32) -> Result<LinuxPageMap, TranslationError> {
        let res = LinuxPageMap {
            pagemap_wrapper: pagemap2::PageMap::new(pid as u64)?,
        };
        Ok(res)
    }
}

impl VirtToPhysResolver for LinuxPageMap {
    fn get_phys(&mut self, virt: u64) -> Result<PhysAddr, TranslationError> {
        let vaddr_start_page = virt & !(PAGE_MASK as u64);
        let vaddr_end_page = vaddr_start_page + PAGE_MASK as u64;

        let memory_region = VirtualMemoryArea::from((vaddr_start_page, vaddr_end_page));
        let entries = self.pagemap_wrapper.pagemap_vma(&memory_region)?;
        let entry = entries.first().ok_or(TranslationError::ShortRead {
            virt,
            expected: 1,
            actual: 0,
        })?;
        let pfn = match entry.pfn() {
            Ok(pfn) => pfn,
            Err(PageMapError::PageNotPresent) => return Err(TranslationError::NotPresent { virt }),
            Err(e) => return Err(e.into()),
        };
        if pfn == 0 {
            return Err(TranslationError::FrameHidden { virt });
        }
        let phys = PhysAddr::from_pfn(pfn, virt);
        trace!("0x{:x} -> {:?}", virt, phys);
        Ok(phys)
    }

    fn get_phys_range(
        &mut self,
        virt: u64,
        pages: usize,
    ) -> Result<Vec<Option<PhysAddr>>, TranslationError> {
        let start = virt & !(PAGE_MASK as u64);
        let end = start + (pages * PAGE_SIZE) as u64;
        let entries = self
            .pagemap_wrapper
            .pagemap_vma(&VirtualMemoryArea::from((start, end)))?;
        if entries.len() < pages {
            return Err(TranslationError::ShortRead {
                virt: start,
                expected: pages,
                actual: entries.len(),
            });
        }
        let mut hidden = 0;
        let mut out = Vec::with_capacity(pages);
        for (i, entry) in entries.into_iter().take(pages).enumerate() {
            let page = start + (i * PAGE_SIZE) as u64;
            match entry.pfn() {
                Ok(0) => {
                    hidden += 1;
                    out.push(None);
                }
                Ok(pfn) => out.push(Some(PhysAddr::from_pfn(pfn, page))),
                Err(PageMapError::PageNotPresent) => out.push(None),
                Err(e) => return Err(e.into()),
            }
        }
        if hidden > 0 {
            warn!(
                "{} of {} pages starting at 0x{:x} have a hidden frame number. Are we root?",
                hidden, pages, start
            );
        }
        Ok(out)
    }
}

impl From<PhysAddr> for usize {
    fn from(addr: PhysAddr) -> usize {
        addr.0
    }
}

impl From<usize> for PhysAddr {
    fn from(addr: usize) -> PhysAddr {
        PhysAddr(addr)
    }
}

impl std::fmt::Pointer for PhysAddr {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        write!(f, "{:p}", self.0 as *const u8)
    }
}

impl Add<usize> for PhysAddr {
    type Output = PhysAddr;

    fn add(self, rhs: usize) -> Self::Output {
        PhysAddr(self.0 + rhs)
    }
}

impl Sub<usize> for PhysAddr {
    type Output = PhysAddr;

    fn sub(self, rhs: usize) -> Self::Output {
        assert!(self.0 >= rhs);
        PhysAddr(self.0 - rhs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{BytePointer, Memory};

    #[test]
    fn test_phys_addr_from_pfn_keeps_offset() {
        let p = PhysAddr::from_pfn(0x1234, 0x7fff_0000_0abc);
        assert_eq!(p.as_usize(), 0x1234abc);
        assert_eq!(p.pfn(), 0x1234);
        assert_eq!(p.page_offset(), 0xabc);
        assert_eq!(p.page_base(), PhysAddr::new(0x1234000));
        assert_eq!(format!("{:x}", p), "1234abc");
    }

    #[test]
    fn test_translate_twice_is_stable() -> anyhow::Result<()> {
        let memory = Memory::mmap(PAGE_SIZE * 4)?;
        let mut pagemap = LinuxPageMap::new()?;
        let virt = memory.addr(PAGE_SIZE + 0x10) as u64;
        let first = pagemap.get_phys(virt);
        let second = pagemap.get_phys(virt);
        match (first, second) {
            (Ok(a), Ok(b)) => {
                assert_eq!(a, b);
                assert_eq!(a.page_offset(), 0x10);
            }
            (
                Err(TranslationError::FrameHidden { .. }),
                Err(TranslationError::FrameHidden { .. }),
            ) => {}
            (a, b) => panic!("unstable translation: {:?} vs {:?}", a, b),
        }
        Ok(())
    }
}
