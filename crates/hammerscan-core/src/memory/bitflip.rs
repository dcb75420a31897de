use crate::memory::{BytePointer, FillPattern, flush_region};
use crate::util::{PAGE_SIZE, PFN_BITS};
use log::info;
use serde::Serialize;
use std::ops::Range;

/// Direction of bit flip transitions.
#[derive(Clone, Copy, Debug, Serialize, Eq, PartialEq, Hash)]
pub enum FlipDirection {
    /// Bit flipped from 0 to 1
    ZeroToOne,
    /// Bit flipped from 1 to 0
    OneToZero,
}

impl FlipDirection {
    /// Value the bit flipped to.
    pub fn flips_to(&self) -> u8 {
        match self {
            FlipDirection::ZeroToOne => 1,
            FlipDirection::OneToZero => 0,
        }
    }
}

/// How to report a word in which more than one bit diverged.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub enum MultiBitPolicy {
    /// Keep only the highest differing bit of the word.
    ///
    /// Best effort: multi-bit flips are undercounted, the record is marked
    /// [`BitFlipRecord::multi_bit`] instead.
    #[default]
    LastBitOnly,
    /// Report every differing bit as its own record.
    AllBits,
}

/// A single diverged bit found by a [`BitFlipDetector`].
#[derive(Clone, Copy, Serialize, PartialEq, Eq, Hash)]
pub struct BitFlipRecord {
    /// Byte offset of the containing word within the scanned region
    pub offset: usize,
    /// Virtual address of the containing word
    pub addr: usize,
    /// Bit number within the 64-bit word
    pub bit: u32,
    /// Direction of the flip
    pub direction: FlipDirection,
    /// Word the region was initialized with
    pub expected: u64,
    /// Word read back after hammering
    pub observed: u64,
    /// More than one bit of the word diverged
    pub multi_bit: bool,
    /// The bit lies in the detector's useful range
    pub useful: bool,
}

impl core::fmt::Debug for BitFlipRecord {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("BitFlipRecord")
            .field("offset", &format_args!("{:#x}", self.offset))
            .field("addr", &format_args!("{:#x}", self.addr))
            .field("bit", &self.bit)
            .field("direction", &self.direction)
            .field("observed", &format_args!("{:#018x}", self.observed))
            .field("multi_bit", &self.multi_bit)
            .field("useful", &self.useful)
            .finish()
    }
}

impl BitFlipRecord {
    /// Value the bit flipped to.
    pub fn flips_to(&self) -> u8 {
        self.direction.flips_to()
    }

    /// Address of the page containing the flipped word.
    pub fn page(&self) -> usize {
        self.addr & !(PAGE_SIZE - 1)
    }
}

/// Compares memory word by word against the pattern it was initialized with.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BitFlipDetector {
    /// Reporting policy for multi-bit words
    pub policy: MultiBitPolicy,
    /// Bits that make a flip actionable
    pub useful_bits: Range<u32>,
}

impl Default for BitFlipDetector {
    fn default() -> Self {
        BitFlipDetector {
            policy: MultiBitPolicy::default(),
            useful_bits: 0..u64::BITS,
        }
    }
}

impl BitFlipDetector {
    /// A detector that marks only flips able to change a page frame number as useful.
    pub fn pfn_bits() -> Self {
        BitFlipDetector {
            useful_bits: PFN_BITS,
            ..Default::default()
        }
    }

    /// Scans `region` against `expected` and returns every diverged bit.
    ///
    /// The region is flushed from the cache first so that the words are read
    /// from DRAM. The region must be 8-byte aligned.
    pub fn scan<R: BytePointer + ?Sized>(
        &self,
        region: &R,
        expected: FillPattern,
    ) -> Vec<BitFlipRecord> {
        let expected = expected.word();
        flush_region(region);
        let mut flips = vec![];
        super::for_each_chunk(region, |offset, base, len| {
            for word in (0..len).step_by(8) {
                let observed = unsafe { (base.add(word) as *const u64).read_volatile() };
                if observed != expected {
                    let addr = base as usize + word;
                    info!(
                        "Found bitflip at 0x{:x}: expected 0x{:016x}, got 0x{:016x}",
                        addr, expected, observed
                    );
                    flips.extend(self.diff_word(offset + word, addr, expected, observed));
                }
            }
        });
        flips
    }

    /// Builds the flip records for one diverged word.
    pub fn diff_word(
        &self,
        offset: usize,
        addr: usize,
        expected: u64,
        observed: u64,
    ) -> Vec<BitFlipRecord> {
        let diff = expected ^ observed;
        let multi_bit = diff.count_ones() > 1;
        let record = |bit: u32| BitFlipRecord {
            offset,
            addr,
            bit,
            direction: if (observed >> bit) & 1 == 1 {
                FlipDirection::ZeroToOne
            } else {
                FlipDirection::OneToZero
            },
            expected,
            observed,
            multi_bit,
            useful: self.useful_bits.contains(&bit),
        };
        if diff == 0 {
            return vec![];
        }
        match self.policy {
            MultiBitPolicy::LastBitOnly => vec![record(u64::BITS - 1 - diff.leading_zeros())],
            MultiBitPolicy::AllBits => (0..u64::BITS)
                .filter(|bit| (diff >> bit) & 1 == 1)
                .map(record)
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{Initializable, Memory, VictimRegion};

    fn flip_bit(memory: &Memory, offset: usize, bit: u32) {
        let p = memory.addr(offset) as *mut u64;
        unsafe { p.write_volatile(p.read_volatile() ^ (1 << bit)) };
    }

    #[test]
    fn test_clean_region_has_no_flips() -> anyhow::Result<()> {
        let memory = Memory::mmap(PAGE_SIZE * 2)?;
        let region = VictimRegion::from_memory(&memory);
        region.initialize(FillPattern::Zero);
        assert!(BitFlipDetector::default().scan(&region, FillPattern::Zero).is_empty());
        Ok(())
    }

    #[test]
    fn test_single_flip_zero_to_one() -> anyhow::Result<()> {
        let memory = Memory::mmap(PAGE_SIZE * 2)?;
        let region = VictimRegion::from_memory(&memory);
        region.initialize(FillPattern::Zero);
        let offset = PAGE_SIZE + 0x48;
        flip_bit(&memory, offset, 5);
        let flips = BitFlipDetector::default().scan(&region, FillPattern::Zero);
        assert_eq!(flips.len(), 1);
        let flip = flips[0];
        assert_eq!(flip.offset, offset);
        assert_eq!(flip.bit, 5);
        assert_eq!(flip.direction, FlipDirection::ZeroToOne);
        assert_eq!(flip.flips_to(), 1);
        assert_eq!(flip.addr, memory.addr(offset) as usize);
        assert!(!flip.multi_bit);
        Ok(())
    }

    #[test]
    fn test_single_flip_one_to_zero() -> anyhow::Result<()> {
        let memory = Memory::mmap(PAGE_SIZE)?;
        let region = VictimRegion::from_memory(&memory);
        region.initialize(FillPattern::One);
        flip_bit(&memory, 0x100, 40);
        let flips = BitFlipDetector::default().scan(&region, FillPattern::One);
        assert_eq!(flips.len(), 1);
        assert_eq!(flips[0].bit, 40);
        assert_eq!(flips[0].direction, FlipDirection::OneToZero);
        assert_eq!(flips[0].flips_to(), 0);
        Ok(())
    }

    #[test]
    fn test_multi_bit_last_bit_only() {
        let detector = BitFlipDetector::default();
        let flips = detector.diff_word(0x10, 0x1010, 0, (1 << 3) | (1 << 17));
        assert_eq!(flips.len(), 1);
        assert_eq!(flips[0].bit, 17);
        assert!(flips[0].multi_bit);
    }

    #[test]
    fn test_multi_bit_all_bits() {
        let detector = BitFlipDetector {
            policy: MultiBitPolicy::AllBits,
            ..Default::default()
        };
        let flips = detector.diff_word(0x10, 0x1010, !0, !((1 << 3) | (1 << 17)));
        assert_eq!(flips.iter().map(|f| f.bit).collect::<Vec<_>>(), vec![3, 17]);
        assert!(flips.iter().all(|f| f.direction == FlipDirection::OneToZero));
    }

    #[test]
    fn test_useful_range() {
        let detector = BitFlipDetector::pfn_bits();
        assert!(detector.diff_word(0, 0, 0, 1 << 12)[0].useful);
        assert!(detector.diff_word(0, 0, 0, 1 << 31)[0].useful);
        assert!(!detector.diff_word(0, 0, 0, 1 << 11)[0].useful);
        assert!(!detector.diff_word(0, 0, 0, 1 << 32)[0].useful);
        assert!(detector.diff_word(0, 0, 7, 7).is_empty());
    }
}
