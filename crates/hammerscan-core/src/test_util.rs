//! Translation and hammering doubles for unit tests.

use std::cell::Cell;
use std::convert::Infallible;

use crate::hammerer::{HammerReport, Hammering};
use crate::memory::{AggressorPtr, PhysAddr, TranslationError, VirtToPhysResolver};
use crate::util::{PAGE_MASK, PAGE_SIZE};

/// Resolves page `i` of a mapping to `frames[i]`.
pub(crate) struct TableResolver {
    base: usize,
    frames: Vec<Option<PhysAddr>>,
}

impl TableResolver {
    pub(crate) fn new(base: usize, frames: Vec<Option<PhysAddr>>) -> Self {
        TableResolver { base, frames }
    }

    fn frame(&self, page: usize) -> Option<PhysAddr> {
        let index = page.checked_sub(self.base)? / PAGE_SIZE;
        self.frames.get(index).copied().flatten()
    }
}

impl VirtToPhysResolver for TableResolver {
    fn get_phys(&mut self, virt: u64) -> Result<PhysAddr, TranslationError> {
        let page = virt as usize & !PAGE_MASK;
        self.frame(page)
            .map(|phys| phys + (virt as usize & PAGE_MASK))
            .ok_or(TranslationError::NotPresent { virt })
    }

    fn get_phys_range(
        &mut self,
        virt: u64,
        pages: usize,
    ) -> Result<Vec<Option<PhysAddr>>, TranslationError> {
        let start = virt as usize & !PAGE_MASK;
        Ok((0..pages).map(|i| self.frame(start + i * PAGE_SIZE)).collect())
    }
}

/// Pretends every virtual address is its own physical address.
pub(crate) struct IdentityResolver;

impl VirtToPhysResolver for IdentityResolver {
    fn get_phys(&mut self, virt: u64) -> Result<PhysAddr, TranslationError> {
        Ok(PhysAddr::new(virt as usize))
    }

    fn get_phys_range(
        &mut self,
        virt: u64,
        pages: usize,
    ) -> Result<Vec<Option<PhysAddr>>, TranslationError> {
        let start = virt as usize & !PAGE_MASK;
        Ok((0..pages)
            .map(|i| Some(PhysAddr::new(start + i * PAGE_SIZE)))
            .collect())
    }
}

/// Flips `bit` of the word at `target` whenever both triggers are hammered together.
///
/// With `remaining` set, only that many hammer calls flip.
pub(crate) struct PairInjector {
    triggers: (AggressorPtr, AggressorPtr),
    target: *mut u64,
    bit: u32,
    remaining: Cell<Option<usize>>,
}

impl PairInjector {
    pub(crate) fn new(
        triggers: (AggressorPtr, AggressorPtr),
        target: *mut u64,
        bit: u32,
        remaining: Option<usize>,
    ) -> Self {
        PairInjector {
            triggers,
            target,
            bit,
            remaining: Cell::new(remaining),
        }
    }
}

impl Hammering for PairInjector {
    type Error = Infallible;

    fn hammer(&self, aggressors: &[AggressorPtr]) -> Result<HammerReport, Self::Error> {
        let fires = aggressors.contains(&self.triggers.0) && aggressors.contains(&self.triggers.1);
        let budget = self.remaining.get();
        if fires && budget != Some(0) {
            self.remaining.set(budget.map(|n| n - 1));
            unsafe {
                let word = self.target.read_volatile();
                self.target.write_volatile(word ^ (1 << self.bit));
            }
        }
        Ok(HammerReport {
            accesses: aggressors.len() as u64,
            ..Default::default()
        })
    }
}
