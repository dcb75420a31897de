use crate::hammerer::{HammerReport, Hammering};
use crate::memory::AggressorPtr;
use crate::util::{clflush, mfence};
use log::trace;
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::hint::black_box;
use std::time::Instant;

/// How the hammer loop forces its reads to reach DRAM.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum HammerMode {
    /// Read every address, then flush every address from the cache.
    #[default]
    ExplicitFlush,
    /// Read every address without flushing. The set must be large enough to
    /// evict itself from its cache set, so it should hold one aggressor plus
    /// its same-set evictors.
    CacheEviction,
}

/// Reads a fixed address set for a fixed number of rounds.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HammerEngine {
    /// Access loop to use
    pub mode: HammerMode,
    /// Rounds over the whole address set
    pub iterations: u64,
}

impl HammerEngine {
    /// Creates an engine.
    pub fn new(mode: HammerMode, iterations: u64) -> Self {
        HammerEngine { mode, iterations }
    }

    /// Runs the access loop over `addrs` for `iterations` rounds.
    ///
    /// # Safety
    ///
    /// Every address must point into mapped, readable memory.
    pub unsafe fn run(addrs: &[AggressorPtr], iterations: u64, mode: HammerMode) -> HammerReport {
        let mut sum = 0u64;
        mfence();
        let start = Instant::now();
        match mode {
            HammerMode::ExplicitFlush => {
                for _ in 0..iterations {
                    for &addr in addrs {
                        sum = sum.wrapping_add(unsafe { addr.read_volatile() } as u64);
                    }
                    for &addr in addrs {
                        unsafe { clflush(addr) };
                    }
                }
            }
            HammerMode::CacheEviction => {
                for _ in 0..iterations {
                    for &addr in addrs {
                        sum = sum.wrapping_add(unsafe { addr.read_volatile() } as u64);
                    }
                }
            }
        }
        mfence();
        let elapsed = start.elapsed();
        let report = HammerReport {
            elapsed,
            accesses: access_count(iterations, addrs.len()),
            checksum: black_box(sum),
        };
        trace!(
            "{} rounds over {} addresses ({:?}): {:?}, {:.1} ns/access",
            iterations,
            addrs.len(),
            mode,
            elapsed,
            report.ns_per_access()
        );
        report
    }
}

/// Total reads of `iterations` rounds, saturating at `u64::MAX`.
fn access_count(iterations: u64, addrs: usize) -> u64 {
    iterations.saturating_mul(addrs as u64)
}

impl Hammering for HammerEngine {
    type Error = Infallible;

    fn hammer(&self, aggressors: &[AggressorPtr]) -> Result<HammerReport, Self::Error> {
        Ok(unsafe { Self::run(aggressors, self.iterations, self.mode) })
    }
}
