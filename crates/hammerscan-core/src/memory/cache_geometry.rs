//! Last-level cache geometry.
//!
//! The slice an address lands in is the XOR (parity) of a hardware-specific
//! set of physical-address bits, one function per slice-selection bit. The set
//! index within a slice is taken from the bits directly above the cache line
//! offset. Both are calibration data under test, so the mapping is expressed as
//! the [`CacheMapping`] trait and can be swapped without touching callers.

use crate::memory::PhysAddr;
use crate::util::{CL_SHIFT, PAGE_SHIFT};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::Read;
use std::path::Path;
use thiserror::Error;

/// Slice and set an address maps to in the last-level cache.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct CacheCoordinate {
    /// Cache slice in `[0, 2^S)`
    pub slice: usize,
    /// Set index within the slice in `[0, 2^C)`
    pub set: usize,
}

/// A model of the physical address to cache set mapping.
pub trait CacheMapping {
    /// Computes the cache coordinate of `phys`.
    ///
    /// Must be a pure function of `phys`.
    fn coordinate(&self, phys: PhysAddr) -> CacheCoordinate;

    /// Whether `a` and `b` compete for the same cache set.
    fn in_same_cache_set(&self, a: PhysAddr, b: PhysAddr) -> bool {
        self.coordinate(a) == self.coordinate(b)
    }
}

/// Defines which physical address bits feed a slice function.
///
/// Can specify a single bit or the XOR of multiple bits.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(untagged)]
pub enum BitDef {
    /// Single bit function
    Single(u64),
    /// XOR of multiple bits
    Multi(Vec<u64>),
}

impl BitDef {
    /// Converts bit definition to a bitmask.
    ///
    /// # Returns
    ///
    /// Bitmask with bits set at the specified positions
    pub fn to_bitstr(&self) -> usize {
        match self {
            BitDef::Single(bit) => 1 << bit,
            BitDef::Multi(bits) => bits.iter().fold(0, |mask, bit| mask | (1 << bit)),
        }
    }
}

/// Errors of the cache geometry configuration.
#[derive(Debug, Error)]
pub enum GeometryError {
    /// No slice table is known for this many cores.
    #[error("no slice hash known for {0} cores (supported: 1, 2, 4)")]
    UnsupportedCoreCount(usize),
    /// A slice function uses a bit inside the page offset.
    #[error("slice bit {0} lies inside the page offset")]
    SliceBitBelowPage(u32),
    /// Line and set bits do not fit into an address.
    #[error("{line_bits} line bits and {set_bits} set bits exceed the address width")]
    TooManyBits {
        /// Cache line offset bits
        line_bits: u32,
        /// Set index bits
        set_bits: u32,
    },
    #[error(transparent)]
    #[allow(missing_docs)]
    IoError(#[from] std::io::Error),
    #[error(transparent)]
    #[allow(missing_docs)]
    JsonError(#[from] serde_json::Error),
}

/// Serializable description of a slice hash, as found in calibration files.
///
/// ```json
/// { "line_bits": 6, "set_bits": 11, "slice_functions": [[17, 18, 20, 22]] }
/// ```
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct CacheGeometryConfig {
    /// Cache line offset bits
    #[serde(default = "default_line_bits")]
    pub line_bits: u32,
    /// Set index bits per slice
    pub set_bits: u32,
    /// One function per slice-selection bit, lowest bit first
    pub slice_functions: Vec<BitDef>,
}

fn default_line_bits() -> u32 {
    CL_SHIFT as u32
}

impl CacheGeometryConfig {
    /// Loads a slice hash from a JSON file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or is not valid JSON.
    pub fn from_jsonfile<P: AsRef<Path>>(filepath: P) -> Result<Self, GeometryError> {
        let mut file = File::open(filepath)?;
        let mut config = String::new();
        file.read_to_string(&mut config)?;
        Ok(serde_json::from_str(&config)?)
    }
}

const SNB_SET_BITS: u32 = 11;
const SNB_2CORE: [u64; 11] = [17, 18, 20, 22, 24, 25, 26, 27, 28, 30, 32];
const SNB_4CORE_H1: [u64; 9] = [18, 19, 21, 23, 25, 27, 29, 30, 31];
const SNB_4CORE_H2: [u64; 11] = [17, 19, 20, 21, 22, 23, 24, 26, 28, 29, 31];

/// Slice hash built from XOR functions over physical address bits.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct XorSliceHash {
    line_bits: u32,
    set_bits: u32,
    slice_masks: Vec<usize>,
}

impl XorSliceHash {
    /// Creates a slice hash from its configuration.
    ///
    /// # Errors
    ///
    /// Fails if a slice function uses a bit below [`PAGE_SHIFT`], since pages
    /// are bucketed by cache set, or if line and set bits exceed the address width.
    pub fn new(config: &CacheGeometryConfig) -> Result<Self, GeometryError> {
        if config.line_bits + config.set_bits >= usize::BITS {
            return Err(GeometryError::TooManyBits {
                line_bits: config.line_bits,
                set_bits: config.set_bits,
            });
        }
        let slice_masks = config
            .slice_functions
            .iter()
            .map(BitDef::to_bitstr)
            .collect::<Vec<_>>();
        for mask in &slice_masks {
            let lowest = mask.trailing_zeros();
            if (lowest as usize) < PAGE_SHIFT {
                return Err(GeometryError::SliceBitBelowPage(lowest));
            }
        }
        Ok(XorSliceHash {
            line_bits: config.line_bits,
            set_bits: config.set_bits,
            slice_masks,
        })
    }

    /// Slice hash of a Sandy Bridge part with `cores` cores (one LLC slice per core).
    ///
    /// # Errors
    ///
    /// Fails for core counts other than 1, 2 and 4.
    pub fn sandy_bridge(cores: usize) -> Result<Self, GeometryError> {
        let slice_functions = match cores {
            1 => vec![],
            2 => vec![BitDef::Multi(SNB_2CORE.to_vec())],
            4 => vec![
                BitDef::Multi(SNB_4CORE_H1.to_vec()),
                BitDef::Multi(SNB_4CORE_H2.to_vec()),
            ],
            n => return Err(GeometryError::UnsupportedCoreCount(n)),
        };
        Self::new(&CacheGeometryConfig {
            line_bits: CL_SHIFT as u32,
            set_bits: SNB_SET_BITS,
            slice_functions,
        })
    }

    /// Number of slices this hash distinguishes.
    pub fn slice_count(&self) -> usize {
        1 << self.slice_masks.len()
    }

    /// Number of sets per slice.
    pub fn set_count(&self) -> usize {
        1 << self.set_bits
    }
}

impl CacheMapping for XorSliceHash {
    fn coordinate(&self, phys: PhysAddr) -> CacheCoordinate {
        let p = phys.as_usize();
        let slice = self
            .slice_masks
            .iter()
            .enumerate()
            .fold(0, |slice, (i, mask)| {
                slice | (((p & mask).count_ones() as usize & 1) << i)
            });
        let set = (p >> self.line_bits) & ((1 << self.set_bits) - 1);
        CacheCoordinate { slice, set }
    }
}

impl<T: CacheMapping + ?Sized> CacheMapping for Box<T> {
    fn coordinate(&self, phys: PhysAddr) -> CacheCoordinate {
        (**self).coordinate(phys)
    }
}
