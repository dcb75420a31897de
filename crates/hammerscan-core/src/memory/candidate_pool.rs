//! Candidate pages for aggressor and victim selection.
//!
//! A [`CandidatePool`] owns one large mapping, resolves the physical frame of
//! every page once, and buckets the pages by presumed DRAM row and by cache
//! set. All later queries are answered from these tables without touching the
//! translation channel again.

use std::collections::{BTreeMap, HashMap};

use super::memblock::{release_ranges, unmap};
use crate::memory::{
    AggressorPtr, CacheCoordinate, CacheMapping, Memory, PhysAddr, RowGeometry, TranslationError,
    VirtToPhysResolver,
};
use crate::util::{GroupBy, NamedProgress, PAGE_MASK, PAGE_SIZE};
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use log::{debug, info, warn};
use rand::Rng as _;
use rand::seq::SliceRandom;
use thiserror::Error;

/// Pages resolved per translation request.
const RESOLVE_CHUNK: usize = 512;

/// A page of the pool with its physical placement.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PageEntry {
    /// Virtual address of the page
    pub virt: *mut u8,
    /// Physical address of the page
    pub phys: PhysAddr,
    /// Presumed DRAM row of the page
    pub row: usize,
    /// Cache coordinate of the first byte of the page, if the pool has a cache model
    pub coordinate: Option<CacheCoordinate>,
}

/// Order in which pages of a row or cache set are handed out.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Traversal {
    /// Ascending virtual address
    #[default]
    Ordered,
    /// Shuffled once per pool with an OS-seeded generator
    Shuffled,
}

/// Configuration of a [`CandidatePool`].
#[derive(Clone, Copy, Debug, Default)]
pub struct PoolConfig {
    /// Row size used to bucket pages into rows
    pub rows: RowGeometry,
    /// Order of pages within a bucket
    pub traversal: Traversal,
}

/// Errors of candidate pool construction and queries.
#[derive(Debug, Error)]
pub enum PoolError {
    /// The pool cannot satisfy a count or row constraint.
    #[error("insufficient candidates for {context}: wanted {wanted}, found {found}")]
    InsufficientCandidates {
        /// What was asked for
        context: String,
        /// Requested number of pages
        wanted: usize,
        /// Available number of pages
        found: usize,
    },
    /// The queried address is not a page of the pool.
    #[error("address 0x{0:x} is not part of the candidate pool")]
    UnknownAddress(usize),
    /// The pool was built without a cache model.
    #[error("candidate pool has no cache model")]
    NoCacheModel,
    /// No page of the mapping could be resolved.
    #[error("no page of the mapping has a usable physical frame")]
    Empty,
    #[error(transparent)]
    #[allow(missing_docs)]
    Translation(#[from] TranslationError),
    #[error(transparent)]
    #[allow(missing_docs)]
    Io(#[from] std::io::Error),
}

/// Pages of one mapping, bucketed by DRAM row and cache set.
pub struct CandidatePool {
    memory: Memory,
    pages: Vec<PageEntry>,
    by_virt: HashMap<usize, usize>,
    by_frame: HashMap<usize, usize>,
    rows: BTreeMap<usize, Vec<usize>>,
    sets: HashMap<CacheCoordinate, Vec<usize>>,
    geometry: RowGeometry,
    cache: Option<Box<dyn CacheMapping>>,
}

impl CandidatePool {
    /// Resolves every page of `memory` and builds the row and cache set tables.
    ///
    /// Pages that are not resident, whose frame is hidden, or whose frame was
    /// already seen are skipped.
    ///
    /// # Arguments
    ///
    /// * `memory` - The mapping to draw candidates from. The pool takes ownership.
    /// * `resolver` - Translation channel, only used during construction
    /// * `cache` - Cache model, required for [`find_same_cache_set`](Self::find_same_cache_set)
    /// * `config` - Row size and traversal order
    /// * `progress` - Optional progress display
    ///
    /// # Errors
    ///
    /// Returns an error if the translation channel fails or no page is usable.
    pub fn build(
        memory: Memory,
        resolver: &mut dyn VirtToPhysResolver,
        cache: Option<Box<dyn CacheMapping>>,
        config: PoolConfig,
        progress: Option<&MultiProgress>,
    ) -> Result<Self, PoolError> {
        let total = memory.pages();
        let bar = progress.map(|p| {
            let bar = p.add(ProgressBar::new(total as u64));
            bar.set_style(ProgressStyle::named_bar("Resolving frames"));
            bar
        });
        let mut pages = Vec::with_capacity(total);
        let mut by_frame = HashMap::with_capacity(total);
        let (mut absent, mut duplicate) = (0, 0);
        for first in (0..total).step_by(RESOLVE_CHUNK) {
            let count = RESOLVE_CHUNK.min(total - first);
            let virt = memory.ptr as usize + first * PAGE_SIZE;
            let frames = resolver.get_phys_range(virt as u64, count)?;
            for (i, phys) in frames.into_iter().enumerate() {
                let Some(phys) = phys else {
                    absent += 1;
                    continue;
                };
                if by_frame.contains_key(&phys.pfn()) {
                    duplicate += 1;
                    continue;
                }
                by_frame.insert(phys.pfn(), pages.len());
                pages.push(PageEntry {
                    virt: (virt + i * PAGE_SIZE) as *mut u8,
                    phys,
                    row: config.rows.row_index(phys),
                    coordinate: cache.as_ref().map(|c| c.coordinate(phys)),
                });
            }
            if let Some(bar) = &bar {
                bar.inc(count as u64);
            }
        }
        if let Some(bar) = bar {
            bar.finish_and_clear();
        }
        if absent > 0 || duplicate > 0 {
            warn!(
                "Skipped {} pages without a usable frame and {} pages with a duplicate frame",
                absent, duplicate
            );
        }
        if pages.is_empty() {
            return Err(PoolError::Empty);
        }

        let indices = (0..pages.len()).collect::<Vec<_>>();
        let mut rows: BTreeMap<usize, Vec<usize>> =
            indices.clone().group_by(|&i| pages[i].row).into_iter().collect();
        let mut sets = if cache.is_some() {
            indices.group_by(|&i| {
                pages[i]
                    .coordinate
                    .unwrap_or(CacheCoordinate { slice: 0, set: 0 })
            })
        } else {
            HashMap::new()
        };
        if config.traversal == Traversal::Shuffled {
            let mut rng = rand::rng();
            rows.values_mut().for_each(|row| row.shuffle(&mut rng));
            sets.values_mut().for_each(|set| set.shuffle(&mut rng));
        }
        let by_virt = pages
            .iter()
            .enumerate()
            .map(|(i, page)| (page.virt as usize, i))
            .collect();
        info!(
            "Candidate pool: {} pages in {} rows and {} cache sets",
            pages.len(),
            rows.len(),
            sets.len()
        );
        Ok(CandidatePool {
            memory,
            pages,
            by_virt,
            by_frame,
            rows,
            sets,
            geometry: config.rows,
            cache,
        })
    }

    /// The mapping backing this pool.
    pub fn memory(&self) -> &Memory {
        &self.memory
    }

    /// All usable pages in ascending virtual order.
    pub fn entries(&self) -> &[PageEntry] {
        &self.pages
    }

    /// Number of usable pages.
    pub fn len(&self) -> usize {
        self.pages.len()
    }

    /// Whether the pool has no usable pages.
    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }

    /// The row geometry the pool was bucketed with.
    pub fn geometry(&self) -> RowGeometry {
        self.geometry
    }

    /// Indices of all rows with at least one page, ascending.
    pub fn row_indices(&self) -> impl Iterator<Item = usize> + '_ {
        self.rows.keys().copied()
    }

    fn entry_of(&self, addr: AggressorPtr) -> Option<(usize, &PageEntry)> {
        let i = *self.by_virt.get(&(addr as usize & !PAGE_MASK))?;
        Some((i, &self.pages[i]))
    }

    /// Physical address of `addr`, if it lies in a usable page of the pool.
    pub fn phys_of(&self, addr: AggressorPtr) -> Option<PhysAddr> {
        self.entry_of(addr)
            .map(|(_, entry)| entry.phys + (addr as usize & PAGE_MASK))
    }

    /// Virtual address backed by `phys`, if its frame is part of the pool.
    pub fn find_page(&self, phys: PhysAddr) -> Option<*mut u8> {
        let i = self.by_frame.get(&phys.pfn())?;
        Some(unsafe { self.pages[*i].virt.byte_add(phys.page_offset()) })
    }

    /// A page of the pool chosen uniformly at random.
    pub fn random_page<R: rand::Rng>(&self, rng: &mut R) -> *mut u8 {
        self.pages[rng.random_range(0..self.pages.len())].virt
    }

    /// Pages of `row`.
    ///
    /// # Errors
    ///
    /// Returns [`PoolError::InsufficientCandidates`] if the row holds fewer than `min_count` pages.
    pub fn pages_in_row(&self, row: usize, min_count: usize) -> Result<Vec<*mut u8>, PoolError> {
        let pages = self
            .rows
            .get(&row)
            .map(|row| row.iter().map(|&i| self.pages[i].virt).collect::<Vec<_>>())
            .unwrap_or_default();
        if pages.len() < min_count {
            return Err(PoolError::InsufficientCandidates {
                context: format!("row {}", row),
                wanted: min_count,
                found: pages.len(),
            });
        }
        Ok(pages)
    }

    /// Pages of the rows `row - distance` and `row + distance`, lower row first.
    ///
    /// # Errors
    ///
    /// Returns [`PoolError::InsufficientCandidates`] if a neighbour row does
    /// not exist, e.g. below row 0, or holds fewer than `min_count` pages.
    pub fn find_pages_in_same_row_at_distance(
        &self,
        row: usize,
        distance: usize,
        min_count: usize,
    ) -> Result<Vec<*mut u8>, PoolError> {
        if distance == 0 {
            return self.pages_in_row(row, min_count);
        }
        let mut pages = vec![];
        for neighbour in [row.checked_sub(distance), row.checked_add(distance)] {
            let Some(neighbour) = neighbour else {
                return Err(PoolError::InsufficientCandidates {
                    context: format!("neighbour of row {} at distance {}", row, distance),
                    wanted: min_count,
                    found: 0,
                });
            };
            pages.extend(self.pages_in_row(neighbour, min_count)?);
        }
        Ok(pages)
    }

    /// Finds `count` addresses that share the cache set of `addr`.
    ///
    /// The returned addresses have the page offset of `addr`, exclude `addr`
    /// itself and lie in pairwise distinct physical frames.
    ///
    /// # Errors
    ///
    /// * [`PoolError::NoCacheModel`] if the pool was built without a cache model
    /// * [`PoolError::UnknownAddress`] if `addr` is not in the pool
    /// * [`PoolError::InsufficientCandidates`] if fewer than `count` addresses share the set
    pub fn find_same_cache_set(
        &self,
        addr: AggressorPtr,
        count: usize,
    ) -> Result<Vec<*mut u8>, PoolError> {
        if self.cache.is_none() {
            return Err(PoolError::NoCacheModel);
        }
        let (own, entry) = self
            .entry_of(addr)
            .ok_or(PoolError::UnknownAddress(addr as usize))?;
        let offset = addr as usize & PAGE_MASK;
        let coordinate = entry.coordinate.ok_or(PoolError::NoCacheModel)?;
        let found = self
            .sets
            .get(&coordinate)
            .map(Vec::as_slice)
            .unwrap_or_default()
            .iter()
            .filter(|&&i| i != own)
            .map(|&i| unsafe { self.pages[i].virt.byte_add(offset) })
            .take(count)
            .collect::<Vec<_>>();
        if found.len() < count {
            return Err(PoolError::InsufficientCandidates {
                context: format!("cache set {:?} of 0x{:x}", coordinate, addr as usize),
                wanted: count,
                found: found.len(),
            });
        }
        debug!("{} addresses share the cache set of {:p}", found.len(), addr);
        Ok(found)
    }

    /// Unmaps every page of the pool that does not contain an address of `keep`.
    ///
    /// Consumes the pool, since its tables refer to released pages. Adjacent
    /// released pages are unmapped with a single call.
    ///
    /// # Errors
    ///
    /// Returns an error if munmap fails. Pages not yet released stay mapped
    /// and are leaked.
    pub fn unmap_except(self, keep: &[AggressorPtr]) -> Result<KeptPages, PoolError> {
        let (base, len) = self.memory.into_raw();
        let keep = keep.iter().map(|&p| p as usize).collect::<Vec<_>>();
        let ranges = release_ranges(base as usize, len, &keep);
        for range in &ranges {
            if let Err(e) = unmap(range.start as *mut u8, range.len()) {
                warn!("Failed to release 0x{:x}..0x{:x}", range.start, range.end);
                return Err(e.into());
            }
        }
        let mut pages = keep
            .iter()
            .map(|addr| addr & !PAGE_MASK)
            .filter(|page| *page >= base as usize && *page < base as usize + len)
            .collect::<Vec<_>>();
        pages.sort_unstable();
        pages.dedup();
        info!(
            "Released {} ranges, keeping {} pages mapped",
            ranges.len(),
            pages.len()
        );
        Ok(KeptPages {
            pages: pages.into_iter().map(|p| p as *mut u8).collect(),
        })
    }
}

/// The pages left mapped by [`CandidatePool::unmap_except`].
///
/// Every page is unmapped when this value is dropped.
#[derive(Debug)]
pub struct KeptPages {
    pages: Vec<*mut u8>,
}

impl KeptPages {
    /// The kept pages in ascending order.
    pub fn pages(&self) -> &[*mut u8] {
        &self.pages
    }

    /// Whether `addr` lies in a kept page.
    pub fn contains(&self, addr: AggressorPtr) -> bool {
        self.pages
            .binary_search(&((addr as usize & !PAGE_MASK) as *mut u8))
            .is_ok()
    }
}

impl Drop for KeptPages {
    fn drop(&mut self) {
        for &page in &self.pages {
            if let Err(e) = unmap(page, PAGE_SIZE) {
                log::error!("Failed to unmap kept page {:p}: {}", page, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{BytePointer, XorSliceHash};
    use crate::test_util::TableResolver;
    use std::collections::HashSet;

    const PAGES: usize = 16;

    /// 16 pages, two per 256 KiB row, all in one cache set of a single-slice cache.
    /// Page 13 is not resident and page 15 aliases the frame of page 14.
    fn fixture(traversal: Traversal) -> anyhow::Result<CandidatePool> {
        let memory = Memory::mmap(PAGES * PAGE_SIZE)?;
        let mut frames = (0..PAGES)
            .map(|i| Some(PhysAddr::new(0x100000 + i * 0x20000)))
            .collect::<Vec<_>>();
        frames[13] = None;
        frames[15] = frames[14];
        let mut resolver = TableResolver::new(memory.ptr as usize, frames);
        let pool = CandidatePool::build(
            memory,
            &mut resolver,
            Some(Box::new(XorSliceHash::sandy_bridge(1)?)),
            PoolConfig {
                traversal,
                ..Default::default()
            },
            None,
        )?;
        Ok(pool)
    }

    #[test]
    fn test_build_skips_absent_and_duplicate_frames() -> anyhow::Result<()> {
        let pool = fixture(Traversal::Ordered)?;
        assert_eq!(pool.len(), PAGES - 2);
        let rows = pool.row_indices().collect::<Vec<_>>();
        // 0x100000 is row 4, every row holds two pages
        assert_eq!(rows, (4..12).collect::<Vec<_>>());
        assert_eq!(pool.pages_in_row(11, 1)?.len(), 1);
        Ok(())
    }

    #[test]
    fn test_find_same_cache_set() -> anyhow::Result<()> {
        let pool = fixture(Traversal::Ordered)?;
        let query = pool.memory().addr(0x40) as AggressorPtr;
        let found = pool.find_same_cache_set(query, 10)?;
        assert_eq!(found.len(), 10);
        let distinct = found.iter().collect::<HashSet<_>>();
        assert_eq!(distinct.len(), 10);
        assert!(found.iter().all(|&p| p as AggressorPtr != query));
        assert!(found.iter().all(|&p| p as usize & PAGE_MASK == 0x40));
        let frames = found
            .iter()
            .map(|&p| pool.phys_of(p).map(|phys| phys.pfn()))
            .collect::<Option<HashSet<_>>>()
            .ok_or(anyhow::anyhow!("unresolved candidate"))?;
        assert_eq!(frames.len(), 10);
        assert!(!frames.contains(&pool.phys_of(query).map(|p| p.pfn()).unwrap_or_default()));
        Ok(())
    }

    #[test]
    fn test_find_same_cache_set_insufficient() -> anyhow::Result<()> {
        let pool = fixture(Traversal::Ordered)?;
        let query = pool.memory().addr(0) as AggressorPtr;
        assert_eq!(pool.find_same_cache_set(query, 13)?.len(), 13);
        assert!(matches!(
            pool.find_same_cache_set(query, 14),
            Err(PoolError::InsufficientCandidates {
                wanted: 14,
                found: 13,
                ..
            })
        ));
        assert!(matches!(
            pool.find_same_cache_set(0x10 as AggressorPtr, 1),
            Err(PoolError::UnknownAddress(0x10))
        ));
        Ok(())
    }

    #[test]
    fn test_shuffled_traversal_is_a_permutation() -> anyhow::Result<()> {
        let ordered = fixture(Traversal::Ordered)?;
        let shuffled = fixture(Traversal::Shuffled)?;
        let frames = |pool: &CandidatePool| -> anyhow::Result<HashSet<usize>> {
            let query = pool.memory().addr(0) as AggressorPtr;
            Ok(pool
                .find_same_cache_set(query, 13)?
                .into_iter()
                .filter_map(|p| pool.phys_of(p))
                .map(|p| p.pfn())
                .collect())
        };
        assert_eq!(frames(&ordered)?, frames(&shuffled)?);
        Ok(())
    }

    #[test]
    fn test_rows_at_distance() -> anyhow::Result<()> {
        let pool = fixture(Traversal::Ordered)?;
        assert_eq!(pool.find_pages_in_same_row_at_distance(6, 1, 2)?.len(), 4);
        assert_eq!(pool.find_pages_in_same_row_at_distance(6, 0, 2)?.len(), 2);
        // row 11 has a single usable page
        assert!(matches!(
            pool.find_pages_in_same_row_at_distance(10, 1, 2),
            Err(PoolError::InsufficientCandidates { found: 1, .. })
        ));
        // rows 2 and 6, but row 2 is empty
        assert!(pool.find_pages_in_same_row_at_distance(4, 2, 1).is_err());
        // row 4 holds pages but row 0 has no lower neighbour
        assert!(matches!(
            pool.find_pages_in_same_row_at_distance(0, 4, 2),
            Err(PoolError::InsufficientCandidates { found: 0, .. })
        ));
        assert!(matches!(
            pool.find_pages_in_same_row_at_distance(usize::MAX, 1, 0),
            Err(PoolError::InsufficientCandidates { found: 0, .. })
        ));
        Ok(())
    }

    #[test]
    fn test_find_page_by_phys() -> anyhow::Result<()> {
        let pool = fixture(Traversal::Ordered)?;
        let virt = pool
            .find_page(PhysAddr::new(0x100000 + 3 * 0x20000 + 0x18))
            .ok_or(anyhow::anyhow!("frame not found"))?;
        assert_eq!(virt, pool.memory().addr(3 * PAGE_SIZE + 0x18));
        assert!(pool.find_page(PhysAddr::new(0x1000)).is_none());
        Ok(())
    }

    #[test]
    fn test_unmap_except_keeps_pages() -> anyhow::Result<()> {
        let pool = fixture(Traversal::Ordered)?;
        let a = pool.memory().addr(2 * PAGE_SIZE + 0x10) as AggressorPtr;
        let b = pool.memory().addr(5 * PAGE_SIZE) as AggressorPtr;
        let kept = pool.unmap_except(&[b, a, b])?;
        assert_eq!(kept.pages().len(), 2);
        assert!(kept.contains(a));
        assert!(kept.contains(b));
        unsafe {
            (a as *mut u8).write_volatile(0x42);
            assert_eq!(a.read_volatile(), 0x42);
        }
        Ok(())
    }
}
