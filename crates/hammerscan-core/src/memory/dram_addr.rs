use crate::memory::PhysAddr;
use crate::util::{DEFAULT_ROW_SIZE, PAGE_SIZE};
use serde::{Deserialize, Serialize};
use std::fmt::{self, Display, Formatter};

/// Buckets physical addresses into DRAM rows of a presumed size.
///
/// Rows are contiguous and non-overlapping: row `r` covers
/// `r * row_size..(r + 1) * row_size`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RowGeometry {
    /// Presumed row size in bytes
    pub row_size: usize,
}

impl Default for RowGeometry {
    fn default() -> Self {
        RowGeometry {
            row_size: DEFAULT_ROW_SIZE,
        }
    }
}

impl RowGeometry {
    /// Creates a row geometry.
    ///
    /// # Panics
    ///
    /// Panics if `row_size` is not a non-zero multiple of the page size.
    pub fn new(row_size: usize) -> Self {
        assert!(
            row_size > 0 && row_size.is_multiple_of(PAGE_SIZE),
            "row size {} is not a multiple of the page size",
            row_size
        );
        RowGeometry { row_size }
    }

    /// Row index of `phys`.
    pub fn row_index(&self, phys: PhysAddr) -> usize {
        phys.as_usize() / self.row_size
    }

    /// Number of pages in a fully populated row.
    pub fn pages_per_row(&self) -> usize {
        self.row_size / PAGE_SIZE
    }
}

/// A contiguous bit field of a physical address.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BitField {
    /// Lowest bit of the field
    pub shift: u32,
    /// Width of the field in bits
    pub width: u32,
}

impl BitField {
    const fn new(shift: u32, width: u32) -> Self {
        BitField { shift, width }
    }

    fn get(&self, p: usize) -> usize {
        (p >> self.shift) & ((1 << self.width) - 1)
    }
}

/// Physical address layout of the modeled memory controller.
///
/// The bank index is additionally XORed with the low `bank_xor_row_bits`
/// bits of the row index.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DramMapping {
    /// Low column bits
    pub col_lo: BitField,
    /// Channel select
    pub channel: BitField,
    /// High column bits
    pub col_hi: BitField,
    /// Bank select (before the row XOR)
    pub bank: BitField,
    /// Rank select
    pub rank: BitField,
    /// Row index
    pub row: BitField,
    /// Number of low row bits folded into the bank index
    pub bank_xor_row_bits: u32,
}

impl DramMapping {
    /// Sandy Bridge with two 4 GiB DIMMs, one per channel.
    pub const fn sandy_bridge_2x4g() -> Self {
        DramMapping {
            col_lo: BitField::new(0, 6),
            channel: BitField::new(6, 1),
            col_hi: BitField::new(7, 7),
            bank: BitField::new(14, 3),
            rank: BitField::new(17, 1),
            row: BitField::new(18, 14),
            bank_xor_row_bits: 3,
        }
    }

    /// Decodes `phys` into its DRAM coordinates.
    pub fn decode(&self, phys: PhysAddr) -> DramAddr {
        let p = phys.as_usize();
        let row = self.row.get(p);
        let bank = self.bank.get(p) ^ (row & ((1 << self.bank_xor_row_bits) - 1));
        DramAddr {
            channel: self.channel.get(p),
            rank: self.rank.get(p),
            bank,
            row,
            col: self.col_lo.get(p) | (self.col_hi.get(p) << self.col_lo.width),
        }
    }

    /// Whether a flip in `victim` is explained by hammering `agg1` and `agg2`.
    ///
    /// Both aggressors must share channel, rank and bank with the victim, and
    /// the aggressor closest to the victim must sit in a directly adjacent row.
    pub fn fits_adjacent(&self, agg1: PhysAddr, agg2: PhysAddr, victim: PhysAddr) -> bool {
        let v = self.decode(victim);
        let aggs = [self.decode(agg1), self.decode(agg2)];
        if !aggs.iter().all(|a| a.same_bank(&v)) {
            return false;
        }
        aggs.iter()
            .map(|a| a.row.abs_diff(v.row))
            .min()
            .is_some_and(|distance| distance == 1)
    }
}

impl Default for DramMapping {
    fn default() -> Self {
        Self::sandy_bridge_2x4g()
    }
}

/// DRAM address with channel, rank, bank, row, and column components.
#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct DramAddr {
    /// Channel number
    pub channel: usize,
    /// Rank number
    pub rank: usize,
    /// Bank number
    pub bank: usize,
    /// Row number
    pub row: usize,
    /// Column number
    pub col: usize,
}

impl DramAddr {
    /// Whether both addresses are served by the same bank.
    pub fn same_bank(&self, other: &DramAddr) -> bool {
        self.channel == other.channel && self.rank == other.rank && self.bank == other.bank
    }
}

impl Display for DramAddr {
    fn fmt(&self, fmt: &mut Formatter) -> fmt::Result {
        write!(
            fmt,
            "(ch {}, rank {}, bank {}, row {}, col {})",
            self.channel, self.rank, self.bank, self.row, self.col
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_row_index() {
        let rows = RowGeometry::default();
        assert_eq!(rows.pages_per_row(), 64);
        assert_eq!(rows.row_index(PhysAddr::new(0x3ffff)), 0);
        assert_eq!(rows.row_index(PhysAddr::new(0x40000)), 1);
        assert_eq!(rows.row_index(PhysAddr::new(5 * DEFAULT_ROW_SIZE + 0x123)), 5);
    }

    #[test]
    #[should_panic]
    fn test_row_size_must_be_page_multiple() {
        RowGeometry::new(PAGE_SIZE + 1);
    }

    #[test]
    fn test_decode() {
        let mapping = DramMapping::sandy_bridge_2x4g();
        // row 5, bank bits 0b010, rank 1, channel 1, column 0x81
        let p = (5 << 18) | (1 << 17) | (0b010 << 14) | (0x2 << 7) | (1 << 6) | 0x01;
        let addr = mapping.decode(PhysAddr::new(p));
        assert_eq!(addr.row, 5);
        assert_eq!(addr.rank, 1);
        assert_eq!(addr.channel, 1);
        assert_eq!(addr.bank, 0b010 ^ 0b101);
        assert_eq!(addr.col, 0x01 | (0x2 << 6));
    }

    #[test]
    fn test_fits_adjacent() {
        let mapping = DramMapping::sandy_bridge_2x4g();
        // keep the decoded bank equal to 0 in every row
        let at_row = |row: usize| PhysAddr::new((row << 18) | ((row & 7) << 14));
        assert!(mapping.fits_adjacent(at_row(9), at_row(11), at_row(10)));
        assert!(mapping.fits_adjacent(at_row(9), at_row(20), at_row(10)));
        assert!(!mapping.fits_adjacent(at_row(8), at_row(12), at_row(10)));
        // different bank
        let other_bank = PhysAddr::new(at_row(11).as_usize() ^ (1 << 14));
        assert!(!mapping.fits_adjacent(at_row(9), other_bank, at_row(10)));
    }
}
