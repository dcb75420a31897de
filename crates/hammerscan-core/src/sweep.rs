//! Double-sided sweep over every reachable row.
//!
//! For every row whose two neighbours are covered by the pool, each page of
//! the row above is hammered together with each page of the row below, and
//! the sandwiched row is checked for flips.

use std::time::Duration;

use crate::hammerer::Hammering;
use crate::memory::{
    AggressorPtr, BitFlipDetector, BitFlipRecord, CandidatePool, Checkable, FillPattern,
    Initializable, PoolError, VictimRegion,
};
use crate::report::{PairResult, ResultLine, ResultLog};
use crate::util::NamedProgress;
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

/// Reads per aggressor and sweep step.
pub const DEFAULT_SWEEP_READS: u64 = 1024 * 1000;

/// Configuration of a [`DoubleSidedSweep`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweepConfig {
    /// Pages an aggressor row must hold, `None` for every page of a row
    pub min_row_pages: Option<usize>,
    /// Pattern the victim row is filled with
    pub pattern: FillPattern,
    /// Stop after this many rows were hammered
    pub max_rows: Option<usize>,
}

impl Default for SweepConfig {
    fn default() -> Self {
        SweepConfig {
            min_row_pages: None,
            pattern: FillPattern::One,
            max_rows: None,
        }
    }
}

/// Flips found in a victim row for one aggressor pair.
#[derive(Clone, Debug, Serialize)]
pub struct SweepFinding {
    /// Index of the victim row
    pub row: usize,
    /// Virtual address of the aggressor in the row above
    pub agg1: usize,
    /// Virtual address of the aggressor in the row below
    pub agg2: usize,
    /// Detected flips
    pub flips: Vec<BitFlipRecord>,
}

/// Summary of a sweep.
#[derive(Clone, Debug, Default, Serialize)]
pub struct SweepReport {
    /// Rows that were hammered
    pub rows_hammered: usize,
    /// Rows skipped for missing neighbour pages
    pub rows_skipped: usize,
    /// Hammer time summed over all pairs
    pub hammer_time: Duration,
    /// Every pair that flipped a bit
    pub findings: Vec<SweepFinding>,
}

impl SweepReport {
    /// Number of flipped bits over all findings.
    pub fn total_flips(&self) -> usize {
        self.findings.iter().map(|f| f.flips.len()).sum()
    }
}

/// Row-pair-row sweep over a [`CandidatePool`].
pub struct DoubleSidedSweep {
    config: SweepConfig,
    detector: BitFlipDetector,
    progress: Option<MultiProgress>,
}

impl DoubleSidedSweep {
    /// Creates a sweep.
    pub fn new(config: SweepConfig, detector: BitFlipDetector) -> Self {
        DoubleSidedSweep {
            config,
            detector,
            progress: None,
        }
    }

    /// Reports progress to `progress`.
    pub fn with_progress(mut self, progress: MultiProgress) -> Self {
        self.progress = Some(progress);
        self
    }

    /// Sweeps all rows of `pool` with `hammerer` and reports flips to `log`.
    ///
    /// Every flip is reported as a `RESULT PAIR` line so it can be replayed.
    ///
    /// # Errors
    ///
    /// Returns the hammerer's error, which ends the sweep.
    pub fn run<H: Hammering, L: ResultLog>(
        &self,
        pool: &CandidatePool,
        hammerer: &H,
        mut log: L,
    ) -> Result<SweepReport, H::Error> {
        let mut report = SweepReport::default();
        let Some((first, last)) = pool.row_indices().next().zip(pool.row_indices().last()) else {
            warn!("Pool holds no rows");
            return Ok(report);
        };
        let min_pages = self
            .config
            .min_row_pages
            .unwrap_or(pool.geometry().pages_per_row());
        let bar = self.progress.as_ref().map(|p| {
            let bar = p.add(ProgressBar::new((last - first + 1) as u64));
            bar.set_style(ProgressStyle::named_bar("Sweeping rows"));
            bar
        });
        for row in first + 1..last {
            if let Some(bar) = &bar {
                bar.set_position((row - first) as u64);
            }
            if self
                .config
                .max_rows
                .is_some_and(|max| report.rows_hammered >= max)
            {
                info!("Hammered {} rows. Stopping.", report.rows_hammered);
                break;
            }
            let (above, victims, below) = match self.rows(pool, row, min_pages) {
                Ok(rows) => rows,
                Err(e) => {
                    debug!("Can't hammer row {}: {}", row, e);
                    report.rows_skipped += 1;
                    continue;
                }
            };
            info!(
                "Hammering rows {}/{}/{} (got {}/{}/{} pages)",
                row - 1,
                row,
                row + 1,
                above.len(),
                victims.len(),
                below.len()
            );
            let victim = VictimRegion::from_pages(victims);
            for &agg1 in &above {
                for &agg2 in &below {
                    victim.initialize(self.config.pattern);
                    let pair = [agg1 as AggressorPtr, agg2 as AggressorPtr];
                    report.hammer_time += hammerer.hammer(&pair)?.elapsed;
                    let flips = victim.check(self.config.pattern, &self.detector);
                    if flips.is_empty() {
                        continue;
                    }
                    info!(
                        "Found {} flips in row {} when hammering {:?} and {:?}",
                        flips.len(),
                        row,
                        pool.phys_of(pair[0]),
                        pool.phys_of(pair[1])
                    );
                    for flip in &flips {
                        let phys = (
                            pool.phys_of(pair[0]),
                            pool.phys_of(pair[1]),
                            pool.phys_of(flip.addr as AggressorPtr),
                        );
                        if let (Some(a1), Some(a2), Some(v)) = phys {
                            log.record(ResultLine::Pair(PairResult::new(a1, a2, v, flip)));
                        }
                    }
                    report.findings.push(SweepFinding {
                        row,
                        agg1: agg1 as usize,
                        agg2: agg2 as usize,
                        flips,
                    });
                }
            }
            report.rows_hammered += 1;
        }
        if let Some(bar) = bar {
            bar.finish();
        }
        info!(
            "Sweep done: {} rows hammered, {} skipped, {} flips",
            report.rows_hammered,
            report.rows_skipped,
            report.total_flips()
        );
        Ok(report)
    }

    #[allow(clippy::type_complexity)]
    fn rows(
        &self,
        pool: &CandidatePool,
        row: usize,
        min_pages: usize,
    ) -> Result<(Vec<*mut u8>, Vec<*mut u8>, Vec<*mut u8>), PoolError> {
        let above = pool.pages_in_row(row - 1, min_pages)?;
        let below = pool.pages_in_row(row + 1, min_pages)?;
        let victims = pool.pages_in_row(row, 1)?;
        Ok((above, victims, below))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{BytePointer, Memory, PhysAddr, PoolConfig, RowGeometry};
    use crate::test_util::{PairInjector, TableResolver};
    use crate::util::PAGE_SIZE;

    /// Rows of two pages: rows 0, 1, 2 complete, row 4 complete, row 3 missing.
    fn pool() -> anyhow::Result<CandidatePool> {
        let memory = Memory::mmap(8 * PAGE_SIZE)?;
        let frames = [0usize, 1, 2, 3, 4, 5, 8, 9]
            .iter()
            .map(|pfn| Some(PhysAddr::new(pfn * PAGE_SIZE)))
            .collect();
        let mut resolver = TableResolver::new(memory.ptr as usize, frames);
        Ok(CandidatePool::build(
            memory,
            &mut resolver,
            None,
            PoolConfig {
                rows: RowGeometry::new(2 * PAGE_SIZE),
                ..Default::default()
            },
            None,
        )?)
    }

    #[test]
    fn test_sweep_finds_injected_pair() -> anyhow::Result<()> {
        let pool = pool()?;
        let page = |i: usize| pool.memory().addr(i * PAGE_SIZE);
        let injector = PairInjector::new(
            (page(1) as AggressorPtr, page(4) as AggressorPtr),
            page(3).wrapping_add(0x100) as *mut u64,
            40,
            None,
        );
        let mut lines: Vec<ResultLine> = vec![];
        let report = DoubleSidedSweep::new(SweepConfig::default(), BitFlipDetector::default())
            .run(&pool, &injector, &mut lines)?;
        // row 1 is sandwiched by rows 0 and 2, rows 2 and 3 lack a neighbour
        assert_eq!(report.rows_hammered, 1);
        assert_eq!(report.rows_skipped, 2);
        assert_eq!(report.findings.len(), 1);
        let finding = &report.findings[0];
        assert_eq!(finding.row, 1);
        assert_eq!((finding.agg1, finding.agg2), (page(1) as usize, page(4) as usize));
        assert_eq!(finding.flips[0].bit, 40);
        assert_eq!(finding.flips[0].offset, PAGE_SIZE + 0x100);
        assert_eq!(
            lines,
            vec![ResultLine::Pair(PairResult {
                agg1: PhysAddr::new(PAGE_SIZE),
                agg2: PhysAddr::new(4 * PAGE_SIZE),
                victim: PhysAddr::new(3 * PAGE_SIZE + 0x100),
                bit: 40,
                flips_to: 0,
            })]
        );
        Ok(())
    }

    #[test]
    fn test_sweep_max_rows() -> anyhow::Result<()> {
        let pool = pool()?;
        let page = pool.memory().addr(0);
        let injector = PairInjector::new(
            (page as AggressorPtr, page as AggressorPtr),
            page as *mut u64,
            0,
            Some(0),
        );
        let report = DoubleSidedSweep::new(
            SweepConfig {
                max_rows: Some(0),
                ..Default::default()
            },
            BitFlipDetector::default(),
        )
        .run(&pool, &injector, Vec::<ResultLine>::new())?;
        assert_eq!(report.rows_hammered, 0);
        assert!(report.findings.is_empty());
        Ok(())
    }
}
