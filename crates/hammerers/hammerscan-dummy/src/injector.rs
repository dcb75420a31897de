use std::cell::Cell;

use hammerscan_core::hammerer::{HammerReport, Hammering};
use hammerscan_core::memory::AggressorPtr;
use hammerscan_core::util::clflush;
use log::debug;
use thiserror::Error;

/// A 64-bit word to flip a bit in.
#[derive(Clone, Copy, Debug)]
pub struct FlipAddr(*mut u64);

impl From<*mut u8> for FlipAddr {
    fn from(value: *mut u8) -> Self {
        FlipAddr((value as usize & !7) as *mut u64)
    }
}

/// Error type that can never occur.
#[derive(Debug, Error)]
pub enum Never {}

/// Dummy hammerer that flips a bit whenever a chosen pair is hammered together.
///
/// Used to simulate a reproducible Rowhammer pair without touching DRAM. The
/// flip toggles the bit, so a freshly initialized victim always sees it.
pub struct FaultInjector {
    triggers: (AggressorPtr, AggressorPtr),
    flip_addr: FlipAddr,
    bit: u32,
    fired: Cell<usize>,
    limit: Option<usize>,
}

impl FaultInjector {
    /// Creates an injector flipping `bit` of the word at `flip_addr` when both
    /// `triggers` are part of the hammered set.
    pub fn new(triggers: (AggressorPtr, AggressorPtr), flip_addr: FlipAddr, bit: u32) -> Self {
        assert!(bit < u64::BITS, "bit {} out of range", bit);
        FaultInjector {
            triggers,
            flip_addr,
            bit,
            fired: Cell::new(0),
            limit: None,
        }
    }

    /// Stops injecting after `limit` flips, to simulate a transient fault.
    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Number of flips injected so far.
    pub fn fired(&self) -> usize {
        self.fired.get()
    }
}

impl Hammering for FaultInjector {
    type Error = Never;

    fn hammer(&self, aggressors: &[AggressorPtr]) -> Result<HammerReport, Self::Error> {
        let triggered =
            aggressors.contains(&self.triggers.0) && aggressors.contains(&self.triggers.1);
        if !triggered || self.limit.is_some_and(|limit| self.fired() >= limit) {
            return Ok(HammerReport::default());
        }
        unsafe {
            let word = self.flip_addr.0.read_volatile();
            debug!(
                "Flip bit {} of {:p}: 0x{:016x} -> 0x{:016x}",
                self.bit,
                self.flip_addr.0,
                word,
                word ^ (1 << self.bit)
            );
            self.flip_addr.0.write_volatile(word ^ (1 << self.bit));
            clflush(self.flip_addr.0 as *const u8);
        }
        self.fired.set(self.fired() + 1);
        Ok(HammerReport {
            accesses: aggressors.len() as u64,
            ..Default::default()
        })
    }
}
