//! The `memory` module provides abstractions for memory management, address
//! translation, geometry modelling and bit flip detection.
//!
//! The `memory` module provides the following abstractions:
//! - `Memory`: An anonymous mapping that is unmapped on drop.
//! - `VictimRegion`: A set of pages that is initialized and checked for bit flips.
//! - `BytePointer`: A trait for accessing memory as a byte pointer.
//! - `Initializable`: A trait for filling memory with a [`FillPattern`].
//! - `Checkable`: A trait for checking memory for bit flips.
//! - `VirtToPhysResolver`: A trait for resolving the physical address of a virtual address.
//! - `LinuxPageMap`: A resolver backed by `/proc/{pid}/pagemap`.
//! - `CacheMapping`: A trait mapping physical addresses to cache slices and sets.
//! - `CandidatePool`: Pages of a mapping bucketed by DRAM row and cache set.
//! - `BitFlipDetector`: Word-wise comparison of memory against a [`FillPattern`].
//!
//! The `memory` module also provides the following helper functions:
//! - `time_access`, `eviction_latency`: Latency measurements used to validate
//!   the cache geometry.
mod bitflip;
mod cache_geometry;
mod candidate_pool;
mod dram_addr;
mod memblock;
mod timer;
mod victim_region;
mod virt_to_phys;

pub use self::bitflip::{BitFlipDetector, BitFlipRecord, FlipDirection, MultiBitPolicy};
pub use self::cache_geometry::{
    BitDef, CacheCoordinate, CacheGeometryConfig, CacheMapping, GeometryError, XorSliceHash,
};
pub use self::candidate_pool::{
    CandidatePool, KeptPages, PageEntry, PoolConfig, PoolError, Traversal,
};
pub use self::dram_addr::{BitField, DramAddr, DramMapping, RowGeometry};
pub use self::memblock::Memory;
pub use self::timer::{eviction_latency, time_access};
pub use self::victim_region::VictimRegion;
pub use self::virt_to_phys::{LinuxPageMap, PhysAddr, TranslationError, VirtToPhysResolver};

use crate::util::{CL_SIZE, PAGE_SIZE, clflush, mfence};
use log::debug;
use serde::{Deserialize, Serialize};

/// Pointer type for aggressor addresses.
///
/// Used to identify memory locations that are hammered to induce bit flips
/// in adjacent victim rows.
pub type AggressorPtr = *const u8;

/// Combined trait for victim memory regions.
///
/// This trait combines [`BytePointer`], [`Initializable`], and [`Checkable`] to provide
/// a complete interface for managing victim memory.
pub trait VictimMemory: BytePointer + Initializable + Checkable {}

/// Trait for accessing memory as a byte pointer.
///
/// Provides low-level access to memory regions with byte-level addressing.
/// Every page-aligned offset must start a run of contiguous bytes that lasts
/// until the next page boundary or the end of the region.
#[allow(clippy::len_without_is_empty)]
pub trait BytePointer {
    /// Returns a mutable pointer to the byte at the given offset.
    ///
    /// # Safety
    ///
    /// The returned pointer is valid only while the memory region exists.
    /// Dereferencing requires unsafe code.
    fn addr(&self, offset: usize) -> *mut u8;

    /// Returns a mutable pointer to the start of the memory region.
    fn ptr(&self) -> *mut u8;

    /// Returns the total length of the memory region in bytes.
    fn len(&self) -> usize;
}

/// Bit pattern a victim region is filled with before hammering.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FillPattern {
    /// All zeros (0x00)
    Zero,
    /// All ones (0xFF)
    One,
}

impl FillPattern {
    /// The 64-bit word this pattern repeats.
    pub fn word(&self) -> u64 {
        match self {
            FillPattern::Zero => 0,
            FillPattern::One => !0,
        }
    }

    /// The pattern with every bit inverted.
    pub fn inverse(&self) -> FillPattern {
        match self {
            FillPattern::Zero => FillPattern::One,
            FillPattern::One => FillPattern::Zero,
        }
    }

    /// The pattern that can reproduce a flip towards `flips_to`.
    pub fn for_flip_to(flips_to: u8) -> FillPattern {
        if flips_to == 0 {
            FillPattern::One
        } else {
            FillPattern::Zero
        }
    }
}

/// Trait for initializing memory with specific patterns.
pub trait Initializable {
    /// Fills the whole region with `pattern` and flushes it out of the cache.
    fn initialize(&self, pattern: FillPattern);
}

/// Trait for checking memory regions for bit flips.
///
/// Implementors compare memory contents against the pattern they were
/// initialized with and report every location that diverged.
pub trait Checkable {
    /// Checks memory against `pattern` and returns the detected bit flips.
    fn check(&self, pattern: FillPattern, detector: &BitFlipDetector) -> Vec<BitFlipRecord>;
}

/// Calls `f(offset, chunk_start, chunk_len)` for every page-sized chunk of `region`.
fn for_each_chunk<R: BytePointer + ?Sized>(region: &R, mut f: impl FnMut(usize, *mut u8, usize)) {
    let len = region.len();
    let mut offset = 0;
    while offset < len {
        let chunk = PAGE_SIZE.min(len - offset);
        f(offset, region.addr(offset), chunk);
        offset += chunk;
    }
}

/// Flushes every cache line of `region`.
pub(crate) fn flush_region<R: BytePointer + ?Sized>(region: &R) {
    for_each_chunk(region, |_, base, len| {
        for line in (0..len).step_by(CL_SIZE) {
            unsafe { clflush(base.add(line)) };
        }
    });
    mfence();
}

/// Blanket implementations for Initializable trait for VictimMemory
impl<T> Initializable for T
where
    T: VictimMemory,
{
    fn initialize(&self, pattern: FillPattern) {
        let len = self.len();
        if !len.is_multiple_of(8) {
            panic!("memory len must be divisible by 8");
        }
        debug!("initialize {} bytes with pattern {:?}", len, pattern);
        let word = pattern.word();
        for_each_chunk(self, |_, base, len| {
            for offset in (0..len).step_by(8) {
                unsafe { (base.add(offset) as *mut u64).write_volatile(word) };
            }
        });
        flush_region(self);
    }
}

/// Blanket implementations for Checkable trait for VictimMemory
impl<T> Checkable for T
where
    T: VictimMemory,
{
    fn check(&self, pattern: FillPattern, detector: &BitFlipDetector) -> Vec<BitFlipRecord> {
        detector.scan(self, pattern)
    }
}
