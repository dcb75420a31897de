//! Victim orchestration for hammering trials.
//!
//! A victim is the memory that is checked for bit flips after hammering. The
//! [`VictimOrchestrator`] trait defines the two steps every trial performs on
//! it: fill it with a known pattern, then scan it for divergence. The scan is
//! destructive in the sense that a flipped region must be re-initialized
//! before the next trial.

use crate::memory::{
    BitFlipDetector, BitFlipRecord, Checkable, FillPattern, Initializable, VictimMemory,
};
use log::debug;
use serde::Serialize;

/// Trait for orchestrating the memory checked by a hammering trial.
///
/// # Lifecycle
///
/// 1. [`init()`](VictimOrchestrator::init) - Write a known pattern
/// 2. Hammering occurs (external to victim)
/// 3. [`check()`](VictimOrchestrator::check) - Report every flip since the last init
///
/// Steps 1-3 are repeated for every trial.
pub trait VictimOrchestrator {
    /// Fills the victim with `pattern` and flushes it from the cache.
    fn init(&mut self, pattern: FillPattern);

    /// Scans the victim against the pattern of the last [`init`](VictimOrchestrator::init).
    ///
    /// An empty list means no flip was detected. A victim that was never
    /// initialized reports no flips.
    fn check(&mut self) -> Vec<BitFlipRecord>;
}

/// Memory-checking victim.
///
/// Checks a memory region for bit flips by comparing it against the
/// pattern it was last initialized with.
#[derive(Serialize)]
pub struct MemCheck<R> {
    #[serde(skip_serializing)]
    region: R,
    #[serde(skip_serializing)]
    detector: BitFlipDetector,
    /// The pattern the region currently holds
    pub pattern: Option<FillPattern>,
}

impl<R: VictimMemory> MemCheck<R> {
    /// Creates a memory-checking victim.
    ///
    /// # Arguments
    ///
    /// * `region` - The memory region to monitor
    /// * `detector` - Detector used for every scan
    pub fn new(region: R, detector: BitFlipDetector) -> Self {
        MemCheck {
            region,
            detector,
            pattern: None,
        }
    }

    /// The monitored region.
    pub fn region(&self) -> &R {
        &self.region
    }
}

impl<R: VictimMemory> VictimOrchestrator for MemCheck<R> {
    fn init(&mut self, pattern: FillPattern) {
        debug!("initialize victim with {:?}", pattern);
        self.region.initialize(pattern);
        self.pattern = Some(pattern);
    }

    fn check(&mut self) -> Vec<BitFlipRecord> {
        let Some(pattern) = self.pattern else {
            return vec![];
        };
        let flips = self.region.check(pattern, &self.detector);
        debug!("check victim: {} flips", flips.len());
        flips
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{BytePointer, Memory, VictimRegion};
    use crate::util::PAGE_SIZE;

    #[test]
    fn test_memcheck_reports_flip_until_reinit() -> anyhow::Result<()> {
        let memory = Memory::mmap(PAGE_SIZE * 2)?;
        let mut victim = MemCheck::new(
            VictimRegion::from_memory(&memory),
            BitFlipDetector::default(),
        );
        assert!(victim.check().is_empty());
        victim.init(FillPattern::Zero);
        assert!(victim.check().is_empty());
        unsafe { (memory.addr(PAGE_SIZE + 8) as *mut u64).write_volatile(1 << 9) };
        let flips = victim.check();
        assert_eq!(flips.len(), 1);
        assert_eq!(flips[0].offset, PAGE_SIZE + 8);
        assert_eq!(flips[0].bit, 9);
        assert_eq!(flips[0].flips_to(), 1);
        victim.init(FillPattern::Zero);
        assert!(victim.check().is_empty());
        Ok(())
    }
}
