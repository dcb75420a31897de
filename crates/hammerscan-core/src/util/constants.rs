use std::time::Duration;

/// Page shift value (12 bits) for 4KB pages
pub const PAGE_SHIFT: usize = 12;
/// Standard page size (4096 bytes)
pub const PAGE_SIZE: usize = 1 << PAGE_SHIFT;
/// Mask for extracting page offset
pub const PAGE_MASK: usize = PAGE_SIZE - 1;

/// Cache line shift value (6 bits) for x86_64
pub const CL_SHIFT: usize = 6;
/// Cache line size (64 bytes) for x86_64
pub const CL_SIZE: usize = 1 << CL_SHIFT;

/// Presumed DRAM row size used to bucket physical pages into rows (256 KiB).
///
/// This is a calibration constant spanning all banks of one row index, not the
/// size of a single bank row.
pub const DEFAULT_ROW_SIZE: usize = 256 << 10;

/// DRAM refresh period. Every row is refreshed at least once per period.
pub const REFRESH_PERIOD: Duration = Duration::from_millis(64);
/// Number of refresh commands issued per [`REFRESH_PERIOD`]
pub const REFRESH_COMMANDS: u64 = 8192;
/// Nominal time between two refresh commands in nanoseconds (64 ms / 8192)
pub const REFRESH_INTERVAL_NS: u64 = 7812;

/// Bit range of a word that can change the frame number of a page table entry
pub const PFN_BITS: std::ops::Range<u32> = 12..32;
