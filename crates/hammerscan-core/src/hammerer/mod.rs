//! Hammering traits and the built-in access loops.
//!
//! This module defines the [`Hammering`] trait that all hammering implementations must implement
//! to perform memory access patterns that induce bit flips through the Rowhammer effect,
//! together with the two access loops shipped with the core:
//!
//! - [`HammerEngine`] reads a set of addresses and either flushes them after every
//!   round ([`HammerMode::ExplicitFlush`]) or relies on the set evicting itself
//!   ([`HammerMode::CacheEviction`]).
//! - [`EvictionPlan`] and [`PoolEviction`] build a same-cache-set group for every
//!   aggressor and hammer the groups in eviction mode, without flush instructions.

mod engine;
mod eviction;

pub use self::engine::{HammerEngine, HammerMode};
pub use self::eviction::{DEFAULT_EVICTORS, EvictionPlan, PoolEviction};

use crate::memory::AggressorPtr;
use crate::util::REFRESH_PERIOD;
use serde::Serialize;
use std::time::Duration;

/// Trait for implementing Rowhammer hammering techniques.
///
/// Implementors of this trait define different strategies for performing memory
/// hammering operations that attempt to induce bit flips in adjacent DRAM rows.
/// The hammering pattern, timing, and access strategy are implementation-specific.
///
/// # Associated Types
///
/// * `Error` - The error type returned by hammering operations. Must implement
///   [`std::error::Error`].
///
/// # Safety
///
/// `hammer` is a safe function over raw pointers. Implementations read or
/// flush every aggressor and must never write through them. Callers must
/// only pass addresses inside a mapping that outlives the call, such as
/// pages of a [`Memory`](crate::memory::Memory) block or a candidate pool.
/// A dangling or unmapped aggressor is a host fault that terminates the
/// process and cannot be reported as `Self::Error`.
///
/// # Examples
///
/// See [`HammerEngine`], [`EvictionPlan`] or the `hammerscan-dummy` crate for
/// concrete implementations.
///
/// ```
/// use hammerscan_core::hammerer::{HammerEngine, HammerMode, Hammering};
/// use hammerscan_core::memory::{AggressorPtr, BytePointer, Memory};
/// use hammerscan_core::util::PAGE_SIZE;
///
/// let memory = Memory::mmap(2 * PAGE_SIZE)?;
/// let aggressors = [
///     memory.addr(0) as AggressorPtr,
///     memory.addr(PAGE_SIZE) as AggressorPtr,
/// ];
/// let report = HammerEngine::new(HammerMode::ExplicitFlush, 10).hammer(&aggressors)?;
/// assert_eq!(report.accesses, 20);
/// # Ok::<(), Box<dyn std::error::Error>>(())
/// ```
pub trait Hammering {
    /// The error type returned by hammering operations.
    type Error: std::error::Error;

    /// Hammers `aggressors`.
    ///
    /// The number of rounds and the access pattern are determined by the
    /// implementation. Every aggressor must point into mapped memory, see the
    /// trait's safety contract.
    ///
    /// # Returns
    ///
    /// Returns the timing of the run, or an error if the operation could not be started.
    ///
    /// # Errors
    ///
    /// Returns an error if the implementation cannot hammer the given set, for
    /// instance because no eviction group can be built for an aggressor.
    fn hammer(&self, aggressors: &[AggressorPtr]) -> Result<HammerReport, Self::Error>;
}

/// Timing of one hammering run.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct HammerReport {
    /// Wall-clock duration of the access loop
    pub elapsed: Duration,
    /// Number of memory reads issued
    pub accesses: u64,
    /// Sum of all values read, kept so the reads cannot be optimized away
    pub checksum: u64,
}

impl HammerReport {
    /// Combines the reports of two consecutive runs.
    pub fn merge(self, other: HammerReport) -> HammerReport {
        HammerReport {
            elapsed: self.elapsed + other.elapsed,
            accesses: self.accesses + other.accesses,
            checksum: self.checksum.wrapping_add(other.checksum),
        }
    }

    /// Average time of one access in nanoseconds.
    pub fn ns_per_access(&self) -> f64 {
        if self.accesses == 0 {
            return 0.0;
        }
        self.elapsed.as_nanos() as f64 / self.accesses as f64
    }

    /// Accesses achieved within one DRAM refresh period at the measured rate.
    pub fn accesses_per_refresh(&self) -> f64 {
        if self.elapsed.is_zero() {
            return 0.0;
        }
        REFRESH_PERIOD.as_secs_f64() * self.accesses as f64 / self.elapsed.as_secs_f64()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_report_rates() {
        let report = HammerReport {
            elapsed: Duration::from_millis(128),
            accesses: 1_000_000,
            checksum: 0,
        };
        assert!((report.accesses_per_refresh() - 500_000.0).abs() < 1e-6);
        assert!((report.ns_per_access() - 128.0).abs() < 1e-9);
        assert_eq!(HammerReport::default().accesses_per_refresh(), 0.0);
    }

    #[test]
    fn test_report_merge() {
        let a = HammerReport {
            elapsed: Duration::from_millis(1),
            accesses: 10,
            checksum: u64::MAX,
        };
        let merged = a.merge(a);
        assert_eq!(merged.elapsed, Duration::from_millis(2));
        assert_eq!(merged.accesses, 20);
        assert_eq!(merged.checksum, u64::MAX - 1);
    }
}
