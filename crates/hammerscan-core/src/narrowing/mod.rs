//! Narrowing a flipping candidate set down to a reproducible aggressor pair.
//!
//! A [`Narrowing`] run draws candidate sets from a [`CandidateSource`] and
//! drives every set through the following state machine:
//!
//! ```text
//! Start -> HammerFullSet -> NarrowToPair -> VerifyReproducible -> Confirmed
//!              |   ^             |                   |
//!              |   +-------------+                   +----------> Abandoned
//!              +-- no flip: next set
//! ```
//!
//! - `HammerFullSet` hammers the whole set against a freshly initialized victim.
//!   Without a flip, the run continues with the next set. Without a flip on a
//!   revisit, the earlier flip was transient and the set is abandoned.
//! - `NarrowToPair` hammers every unordered pair of the set in enumeration
//!   order, for up to `pair_retries` passes. The first pair that flips wins.
//!   If no pair flips, the full set is hammered again, up to `full_set_retries`
//!   times, before the set is abandoned.
//! - `VerifyReproducible` hammers the winning pair `verify_rounds` times and
//!   confirms it if the same bit flipped in at least `min_confirmations` rounds.
//!
//! The run reports `RESULT START_TIME`, `RESULT PAIR` (on discovery) and
//! `RESULT STAT` lines to a [`ResultLog`].

mod source;

pub use self::source::{CandidateSource, RandomPages, RowPairs};

use std::time::{Duration, Instant};

use crate::hammerer::Hammering;
use crate::memory::{AggressorPtr, BitFlipRecord, FillPattern, VirtToPhysResolver};
use crate::report::{PairResult, ResultLine, ResultLog, StatLine};
use crate::util::NamedProgress;
use crate::victim::VictimOrchestrator;
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use itertools::Itertools;
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Configuration of a [`Narrowing`] run.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NarrowingConfig {
    /// Revisits of `HammerFullSet` before a set is abandoned
    pub full_set_retries: usize,
    /// Passes over all pairs per `NarrowToPair` visit
    pub pair_retries: usize,
    /// Hammer rounds on a discovered pair
    pub verify_rounds: usize,
    /// Rounds that must reproduce the flip to confirm a pair
    pub min_confirmations: usize,
    /// Sets between two `RESULT STAT` lines
    pub stat_interval: usize,
    /// Victim patterns tried in order per trial
    pub patterns: Vec<FillPattern>,
    /// Stop drawing new sets after this time
    pub time_budget: Option<Duration>,
    /// Stop after this many sets
    pub max_sets: Option<usize>,
    /// Stop after this many confirmed pairs (None = never)
    pub max_pairs: Option<usize>,
}

impl Default for NarrowingConfig {
    fn default() -> Self {
        NarrowingConfig {
            full_set_retries: 10,
            pair_retries: 10,
            verify_rounds: 10,
            min_confirmations: 1,
            stat_interval: 100,
            patterns: vec![FillPattern::One],
            time_budget: Some(Duration::from_secs(60 * 60)),
            max_sets: None,
            max_pairs: Some(1),
        }
    }
}

impl NarrowingConfig {
    fn validate(&self) -> Result<(), String> {
        if self.time_budget.is_none() && self.max_sets.is_none() {
            return Err("at least one of time_budget or max_sets must be set".into());
        }
        if self.patterns.is_empty() {
            return Err("no victim pattern given".into());
        }
        if self.full_set_retries == 0 || self.pair_retries == 0 || self.stat_interval == 0 {
            return Err("retry counts and stat interval must be positive".into());
        }
        if self.min_confirmations == 0 || self.min_confirmations > self.verify_rounds {
            return Err(format!(
                "min_confirmations must be in 1..={}, got {}",
                self.verify_rounds, self.min_confirmations
            ));
        }
        Ok(())
    }
}

/// Errors of a narrowing run.
#[derive(Debug, Error)]
pub enum NarrowingError<HE: std::error::Error> {
    /// The hammerer failed. Terminates the run.
    #[error("hammering failed: {0}")]
    HammerFault(HE),
    /// The configuration cannot drive a run.
    #[error("invalid narrowing config: {0}")]
    InvalidConfig(String),
}

/// Where a set currently is in the narrowing protocol.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NarrowingState {
    /// A new set was drawn
    Start,
    /// Hammering the whole set, `attempt` counts revisits
    HammerFullSet {
        /// Revisits of this state for the current set
        attempt: usize,
    },
    /// Searching the first flipping pair
    NarrowToPair {
        /// Revisits of `HammerFullSet` so far
        attempt: usize,
    },
    /// Re-hammering a discovered pair
    VerifyReproducible {
        /// Index of the first aggressor in the set
        first: usize,
        /// Index of the second aggressor in the set
        second: usize,
        /// Flip observed at discovery
        flip: BitFlipRecord,
        /// Physical pair logged at discovery
        pair: PairResult,
    },
    /// The pair reproduced its flip
    Confirmed,
    /// The set was given up
    Abandoned,
}

/// A pair that reproduced its flip.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct ConfirmedPair {
    /// Physical report of the pair
    pub pair: PairResult,
    /// Virtual address of the first aggressor
    pub agg1: usize,
    /// Virtual address of the second aggressor
    pub agg2: usize,
    /// Flip observed at discovery
    pub flip: BitFlipRecord,
    /// Verification rounds that reproduced the flip
    pub confirmations: usize,
    /// Verification rounds run
    pub rounds: usize,
}

/// Result of narrowing a single set.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SetOutcome {
    /// The full set did not flip
    NoFlip,
    /// A pair was confirmed
    Confirmed(ConfirmedPair),
    /// The set flipped once but no reproducible pair was found
    Abandoned,
}

/// Summary of a narrowing run.
#[derive(Clone, Debug, Serialize)]
pub struct NarrowingReport {
    /// Unix time the run started
    pub start_time: i64,
    /// Duration of the run
    pub elapsed: Duration,
    /// Candidate sets drawn
    pub sets_tried: usize,
    /// Flips detected across all trials
    pub errors: usize,
    /// Sets that flipped but were abandoned
    pub abandoned: usize,
    /// Confirmed pairs in discovery order
    pub confirmed: Vec<ConfirmedPair>,
}

/// The narrowing protocol over a hammerer and a victim.
///
/// Use [`Narrowing::builder()`] to construct an instance.
pub struct Narrowing<H, V> {
    hammerer: H,
    victim: V,
    config: NarrowingConfig,
    progress: Option<MultiProgress>,
    errors: usize,
}

impl<H: Hammering, V: VictimOrchestrator> Narrowing<H, V> {
    /// Creates a builder around `hammerer` and `victim`.
    ///
    /// The victim must cover every address a flip can appear at, typically
    /// the whole mapping the candidate sets are drawn from.
    pub fn builder(hammerer: H, victim: V) -> NarrowingBuilder<H, V> {
        NarrowingBuilder {
            hammerer,
            victim,
            config: NarrowingConfig::default(),
            progress: None,
        }
    }

    /// The configuration of this run.
    pub fn config(&self) -> &NarrowingConfig {
        &self.config
    }

    /// Consumes the protocol and returns its hammerer and victim.
    pub fn into_parts(self) -> (H, V) {
        (self.hammerer, self.victim)
    }

    /// Runs the protocol until the source is exhausted, a budget is used up
    /// or `max_pairs` pairs are confirmed.
    ///
    /// # Errors
    ///
    /// Returns [`NarrowingError::HammerFault`] if the hammerer fails. Translation
    /// failures only abandon the current set.
    pub fn run<S: CandidateSource, L: ResultLog>(
        &mut self,
        mut source: S,
        resolver: &mut dyn VirtToPhysResolver,
        mut log: L,
    ) -> Result<NarrowingReport, NarrowingError<H::Error>> {
        let start = Instant::now();
        let start_time = unix_now();
        log.record(ResultLine::StartTime(start_time));
        self.errors = 0;
        let mut report = NarrowingReport {
            start_time,
            elapsed: Duration::ZERO,
            sets_tried: 0,
            errors: 0,
            abandoned: 0,
            confirmed: vec![],
        };
        let progress = self.progress.as_ref().map(|p| {
            let p = p.add(ProgressBar::no_length());
            p.set_style(ProgressStyle::named_spinner("Candidate sets"));
            p.enable_steady_tick(Duration::from_secs(1));
            p
        });
        loop {
            if check_timeout(self.config.time_budget, start.elapsed()) {
                info!("Time budget reached. Stopping.");
                break;
            }
            if self.config.max_sets.is_some_and(|max| report.sets_tried >= max) {
                info!("Tried {} sets. Stopping.", report.sets_tried);
                break;
            }
            let Some(set) = source.next_set() else {
                info!("Candidate source exhausted. Stopping.");
                break;
            };
            if set.len() < 2 {
                warn!("Skipping candidate set of {} addresses", set.len());
                continue;
            }
            report.sets_tried += 1;
            let errors_before = self.errors;
            let outcome = self.narrow_set(&set, resolver, &mut log)?;
            let flipped = self.errors > errors_before;
            if flipped || report.sets_tried.is_multiple_of(self.config.stat_interval) {
                log.record(ResultLine::Stat(StatLine {
                    elapsed: start.elapsed(),
                    unix_time: unix_now(),
                    sets_tried: report.sets_tried,
                    errors: self.errors,
                }));
            }
            match outcome {
                SetOutcome::NoFlip => {}
                SetOutcome::Abandoned => report.abandoned += 1,
                SetOutcome::Confirmed(pair) => report.confirmed.push(pair),
            }
            if let Some(p) = &progress {
                p.set_position(report.sets_tried as u64);
                p.set_message(format!(
                    "{} flips, {} pairs",
                    self.errors,
                    report.confirmed.len()
                ));
            }
            if self
                .config
                .max_pairs
                .is_some_and(|max| report.confirmed.len() >= max)
            {
                info!("Confirmed {} pairs. Stopping.", report.confirmed.len());
                break;
            }
        }
        if let Some(p) = progress {
            p.finish();
        }
        report.elapsed = start.elapsed();
        report.errors = self.errors;
        info!(
            "Narrowing done after {:?}: {} sets, {} flips, {} confirmed, {} abandoned",
            report.elapsed,
            report.sets_tried,
            report.errors,
            report.confirmed.len(),
            report.abandoned
        );
        Ok(report)
    }

    /// Drives a single set through the state machine.
    ///
    /// # Errors
    ///
    /// Returns [`NarrowingError::HammerFault`] if the hammerer fails.
    pub fn narrow_set<L: ResultLog + ?Sized>(
        &mut self,
        set: &[AggressorPtr],
        resolver: &mut dyn VirtToPhysResolver,
        log: &mut L,
    ) -> Result<SetOutcome, NarrowingError<H::Error>> {
        let mut state = NarrowingState::Start;
        let mut confirmed = None;
        loop {
            debug!("Narrowing state: {:?}", state);
            state = match state {
                NarrowingState::Start => NarrowingState::HammerFullSet { attempt: 0 },
                NarrowingState::HammerFullSet { attempt } => {
                    let flips = self.trial(set)?;
                    match (flips.is_empty(), attempt) {
                        (true, 0) => return Ok(SetOutcome::NoFlip),
                        (true, _) => {
                            info!("Full set stopped flipping on attempt {}, transient", attempt);
                            NarrowingState::Abandoned
                        }
                        (false, _) => {
                            info!(
                                "Set of {} addresses flipped: {:?}",
                                set.len(),
                                flips.first()
                            );
                            NarrowingState::NarrowToPair { attempt }
                        }
                    }
                }
                NarrowingState::NarrowToPair { attempt } => match self.find_pair(set)? {
                    Some((first, second, flip)) => {
                        match self.report_pair(set[first], set[second], &flip, resolver) {
                            Some(pair) => {
                                log.record(ResultLine::Pair(pair));
                                NarrowingState::VerifyReproducible {
                                    first,
                                    second,
                                    flip,
                                    pair,
                                }
                            }
                            None => NarrowingState::Abandoned,
                        }
                    }
                    None if attempt + 1 < self.config.full_set_retries => {
                        info!("No pair reproduced, hammering the full set again");
                        NarrowingState::HammerFullSet {
                            attempt: attempt + 1,
                        }
                    }
                    None => {
                        info!("Giving up on set after {} attempts", attempt + 1);
                        NarrowingState::Abandoned
                    }
                },
                NarrowingState::VerifyReproducible {
                    first,
                    second,
                    flip,
                    pair,
                } => {
                    let aggressors = [set[first], set[second]];
                    let mut confirmations = 0;
                    for round in 0..self.config.verify_rounds {
                        let flips = self.trial(&aggressors)?;
                        let reproduced = flips
                            .iter()
                            .any(|f| f.addr == flip.addr && f.bit == flip.bit);
                        debug!("Verify round {}: reproduced={}", round, reproduced);
                        confirmations += reproduced as usize;
                    }
                    info!(
                        "Pair {:?} reproduced {}/{} times",
                        aggressors, confirmations, self.config.verify_rounds
                    );
                    if confirmations >= self.config.min_confirmations {
                        confirmed = Some(ConfirmedPair {
                            pair,
                            agg1: set[first] as usize,
                            agg2: set[second] as usize,
                            flip,
                            confirmations,
                            rounds: self.config.verify_rounds,
                        });
                        NarrowingState::Confirmed
                    } else {
                        NarrowingState::Abandoned
                    }
                }
                NarrowingState::Confirmed => {
                    return Ok(confirmed.map_or(SetOutcome::Abandoned, SetOutcome::Confirmed));
                }
                NarrowingState::Abandoned => return Ok(SetOutcome::Abandoned),
            };
        }
    }

    /// First flipping pair of `set` in enumeration order, with its index pair.
    fn find_pair(
        &mut self,
        set: &[AggressorPtr],
    ) -> Result<Option<(usize, usize, BitFlipRecord)>, NarrowingError<H::Error>> {
        for pass in 0..self.config.pair_retries {
            for (first, second) in (0..set.len()).tuple_combinations() {
                let flips = self.trial(&[set[first], set[second]])?;
                if let Some(flip) = flips.into_iter().next() {
                    info!(
                        "Pair ({:p}, {:p}) flipped in pass {}",
                        set[first], set[second], pass
                    );
                    return Ok(Some((first, second, flip)));
                }
            }
            debug!("Pass {} over {} addresses found no pair", pass, set.len());
        }
        Ok(None)
    }

    /// Initializes the victim, hammers `aggressors` and checks, once per pattern.
    ///
    /// Returns the flips of the first pattern that flipped.
    fn trial(
        &mut self,
        aggressors: &[AggressorPtr],
    ) -> Result<Vec<BitFlipRecord>, NarrowingError<H::Error>> {
        for &pattern in &self.config.patterns {
            self.victim.init(pattern);
            let report = self.hammerer.hammer(aggressors).map_err(|e| {
                error!("Hammering {:?} failed: {}", aggressors, e);
                NarrowingError::HammerFault(e)
            })?;
            debug!("Hammered {} addresses: {:?}", aggressors.len(), report);
            let flips = self.victim.check();
            if !flips.is_empty() {
                self.errors += flips.len();
                return Ok(flips);
            }
        }
        Ok(vec![])
    }

    fn report_pair(
        &self,
        agg1: AggressorPtr,
        agg2: AggressorPtr,
        flip: &BitFlipRecord,
        resolver: &mut dyn VirtToPhysResolver,
    ) -> Option<PairResult> {
        let mut translate = |virt: usize| match resolver.get_phys(virt as u64) {
            Ok(phys) => Some(phys),
            Err(e) => {
                warn!("Failed to translate 0x{:x}: {}", virt, e);
                None
            }
        };
        Some(PairResult::new(
            translate(agg1 as usize)?,
            translate(agg2 as usize)?,
            translate(flip.addr)?,
            flip,
        ))
    }
}

/// Builder for [`Narrowing`].
pub struct NarrowingBuilder<H, V> {
    hammerer: H,
    victim: V,
    config: NarrowingConfig,
    progress: Option<MultiProgress>,
}

impl<H: Hammering, V: VictimOrchestrator> NarrowingBuilder<H, V> {
    /// Sets the configuration.
    pub fn config(mut self, config: NarrowingConfig) -> Self {
        self.config = config;
        self
    }

    /// Reports progress to `progress`.
    pub fn progress(mut self, progress: MultiProgress) -> Self {
        self.progress = Some(progress);
        self
    }

    /// Validates the configuration and builds the protocol.
    ///
    /// # Errors
    ///
    /// Returns [`NarrowingError::InvalidConfig`] if neither `time_budget` nor
    /// `max_sets` is set, no pattern is given, or the retry counts are zero.
    pub fn build(self) -> Result<Narrowing<H, V>, NarrowingError<H::Error>> {
        self.config.validate().map_err(NarrowingError::InvalidConfig)?;
        Ok(Narrowing {
            hammerer: self.hammerer,
            victim: self.victim,
            config: self.config,
            progress: self.progress,
            errors: 0,
        })
    }
}

fn check_timeout(timeout: Option<Duration>, duration: Duration) -> bool {
    timeout.is_some_and(|timeout| duration > timeout)
}

fn unix_now() -> i64 {
    chrono::Utc::now().timestamp()
}
