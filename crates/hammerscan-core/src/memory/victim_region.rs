use crate::memory::{BytePointer, Memory, VictimMemory};
use crate::util::PAGE_SIZE;

/// A victim made of (not necessarily adjacent) pages.
///
/// Can cover a single page, the pages of one DRAM row or a whole mapping.
/// The region borrows nothing: the pages must stay mapped while it is used.
#[derive(Clone, Debug)]
pub struct VictimRegion {
    pages: Vec<*mut u8>,
}

unsafe impl Send for VictimRegion {}

impl VictimRegion {
    /// Creates a region from page-aligned page pointers.
    ///
    /// # Panics
    ///
    /// Panics if `pages` is empty or a pointer is not page-aligned.
    pub fn from_pages(pages: Vec<*mut u8>) -> Self {
        assert!(!pages.is_empty(), "victim region needs at least one page");
        for page in &pages {
            assert!(
                (*page as usize).is_multiple_of(PAGE_SIZE),
                "victim page {:p} is not page-aligned",
                page
            );
        }
        VictimRegion { pages }
    }

    /// Creates a region covering every page of `memory`.
    pub fn from_memory(memory: &Memory) -> Self {
        Self::from_pages((0..memory.len).step_by(PAGE_SIZE).map(|o| memory.addr(o)).collect())
    }

    /// The pages of this region.
    pub fn pages(&self) -> &[*mut u8] {
        &self.pages
    }
}

impl VictimMemory for VictimRegion {}

impl BytePointer for VictimRegion {
    fn addr(&self, offset: usize) -> *mut u8 {
        assert!(offset < self.len(), "Offset {} >= {}", offset, self.len());
        unsafe { self.pages[offset / PAGE_SIZE].byte_add(offset % PAGE_SIZE) }
    }

    fn ptr(&self) -> *mut u8 {
        self.pages[0]
    }

    fn len(&self) -> usize {
        self.pages.len() * PAGE_SIZE
    }
}
