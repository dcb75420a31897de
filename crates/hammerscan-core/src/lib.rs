//! # Hammerscan Core
//!
//! `hammerscan-core` is the fault-induction and detection engine of the
//! hammerscan Rowhammer test suite. It maps a large chunk of memory, resolves
//! the physical placement of every page, hammers chosen aggressor sets and
//! narrows flipping sets down to reproducible aggressor pairs.
//!
//! ## Architecture Overview
//!
//! The engine is built around two traits that define the seams between its
//! components:
//!
//! - [`hammerer::Hammering`] - Defines the interface for hammering implementations
//!   that perform the memory access patterns triggering bit flips. The core ships
//!   [`HammerEngine`] (explicit flush or self-eviction) and [`EvictionPlan`]
//!   (same-cache-set eviction groups).
//!
//! - [`victim::VictimOrchestrator`] - Defines the interface for memory that is
//!   initialized before and checked after hammering. [`MemCheck`] checks a memory
//!   region against a fill pattern.
//!
//! ## Main Components
//!
//! - [`memory`] module - Address translation ([`memory::LinuxPageMap`]), cache
//!   and DRAM geometry models, the [`memory::CandidatePool`] of resolved pages and
//!   the [`memory::BitFlipDetector`].
//!
//! - [`Narrowing`] - The protocol reducing a flipping candidate set to a
//!   confirmed aggressor pair.
//!
//! - [`DoubleSidedSweep`], [`replay()`], [`refresh`] and [`probe`] - Row-pair-row
//!   sweeps, cached replay of recorded pairs, refresh interval measurement and
//!   cache eviction probing.
//!
//! - [`report`] module - The `RESULT` lines every run emits on stdout.
//!
//! ## Platform Support
//!
//! The engine targets x86_64 Linux. Physical addresses are read from
//! `/proc/self/pagemap`, which requires `CAP_SYS_ADMIN` to reveal frame numbers.

#![warn(missing_docs)]

pub mod hammerer;
pub mod memory;
mod narrowing;
pub mod probe;
pub mod refresh;
mod replay;
pub mod report;
mod sweep;
pub mod util;
pub mod victim;

#[cfg(test)]
mod test_util;

pub use crate::hammerer::{EvictionPlan, HammerEngine, HammerMode, HammerReport, Hammering};
pub use crate::narrowing::{
    CandidateSource, ConfirmedPair, Narrowing, NarrowingBuilder, NarrowingConfig, NarrowingError,
    NarrowingReport, NarrowingState, RandomPages, RowPairs, SetOutcome,
};
pub use crate::replay::{
    DEFAULT_REPLAY_ITERATIONS, ReplayConfig, ReplayError, ReplayOutcome, replay,
};
pub use crate::sweep::{
    DEFAULT_SWEEP_READS, DoubleSidedSweep, SweepConfig, SweepFinding, SweepReport,
};
pub use crate::victim::{MemCheck, VictimOrchestrator};

/// Rounds over a candidate set per narrowing trial.
pub const DEFAULT_NARROWING_ITERATIONS: u64 = 540_000;
