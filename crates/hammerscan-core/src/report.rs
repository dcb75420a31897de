//! Stable result lines.
//!
//! Every run reports its findings as `RESULT` lines on stdout, separate from
//! the log output, so that downstream scripts can grep for them:
//!
//! ```text
//! RESULT START_TIME,1700000000
//! RESULT PAIR,0x1a2b3000,0x1a2f3040,0x1a2d3008,17,1
//! RESULT STAT,12.34,1700000012,100,1
//! ```
//!
//! Field positions are stable. Addresses are physical, lowercase hex with a
//! `0x` prefix. `PAIR` lines can be parsed back into a [`PairResult`] to
//! replay a flip.

use std::fmt::Display;
use std::io::{BufRead, Write};
use std::num::ParseIntError;
use std::str::FromStr;
use std::time::Duration;

use crate::memory::{BitFlipRecord, DramMapping, PhysAddr};
use log::{error, warn};
use serde::Serialize;
use thiserror::Error;

const PREFIX: &str = "RESULT ";

/// A reproducible flip: two aggressors and the victim word they disturb.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
pub struct PairResult {
    /// Physical address of the first aggressor
    pub agg1: PhysAddr,
    /// Physical address of the second aggressor
    pub agg2: PhysAddr,
    /// Physical address of the flipped word
    pub victim: PhysAddr,
    /// Bit number within the flipped word
    pub bit: u32,
    /// Value the bit flipped to
    pub flips_to: u8,
}

impl PairResult {
    /// Builds a pair result from a flip record and the victim's physical address.
    pub fn new(agg1: PhysAddr, agg2: PhysAddr, victim: PhysAddr, flip: &BitFlipRecord) -> Self {
        PairResult {
            agg1,
            agg2,
            victim,
            bit: flip.bit,
            flips_to: flip.flips_to(),
        }
    }

    /// Whether the pair is explained by double-sided hammering under `mapping`.
    pub fn fits(&self, mapping: &DramMapping) -> bool {
        mapping.fits_adjacent(self.agg1, self.agg2, self.victim)
    }
}

/// Progress counters of a narrowing run.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct StatLine {
    /// Time since the run started
    pub elapsed: Duration,
    /// Wall-clock unix time of the report
    pub unix_time: i64,
    /// Candidate sets hammered so far
    pub sets_tried: usize,
    /// Flips detected so far
    pub errors: usize,
}

/// One `RESULT` line.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum ResultLine {
    /// Unix time the run started
    StartTime(i64),
    /// A discovered aggressor pair
    Pair(PairResult),
    /// Periodic progress
    Stat(StatLine),
}

impl Display for ResultLine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResultLine::StartTime(unix) => write!(f, "{}START_TIME,{}", PREFIX, unix),
            ResultLine::Pair(pair) => write!(
                f,
                "{}PAIR,0x{:x},0x{:x},0x{:x},{},{}",
                PREFIX, pair.agg1, pair.agg2, pair.victim, pair.bit, pair.flips_to
            ),
            ResultLine::Stat(stat) => write!(
                f,
                "{}STAT,{:.2},{},{},{}",
                PREFIX,
                stat.elapsed.as_secs_f64(),
                stat.unix_time,
                stat.sets_tried,
                stat.errors
            ),
        }
    }
}

/// Errors of parsing a `RESULT PAIR` line.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ReportParseError {
    /// The line is not a `RESULT PAIR` line.
    #[error("not a RESULT PAIR line")]
    NotAPair,
    /// The line has the wrong number of fields.
    #[error("expected 5 fields, found {0}")]
    FieldCount(usize),
    /// An address field is not `0x`-prefixed hex.
    #[error("field {field}: expected 0x-prefixed hex, got {value:?}")]
    MissingHexPrefix {
        /// Field position
        field: usize,
        /// Raw field content
        value: String,
    },
    /// A field is not a number.
    #[error("field {field}: {source}")]
    Number {
        /// Field position
        field: usize,
        /// Parse failure
        source: ParseIntError,
    },
    /// The flip direction is neither 0 nor 1.
    #[error("flip direction must be 0 or 1, got {0}")]
    Direction(u8),
}

impl FromStr for PairResult {
    type Err = ReportParseError;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let fields = line
            .trim()
            .strip_prefix(PREFIX)
            .and_then(|rest| rest.strip_prefix("PAIR,"))
            .ok_or(ReportParseError::NotAPair)?
            .split(',')
            .map(str::trim)
            .collect::<Vec<_>>();
        if fields.len() != 5 {
            return Err(ReportParseError::FieldCount(fields.len()));
        }
        let hex = |field: usize| -> Result<PhysAddr, ReportParseError> {
            let value = fields[field];
            let digits = value
                .strip_prefix("0x")
                .ok_or_else(|| ReportParseError::MissingHexPrefix {
                    field,
                    value: value.to_string(),
                })?;
            usize::from_str_radix(digits, 16)
                .map(PhysAddr::new)
                .map_err(|source| ReportParseError::Number { field, source })
        };
        let bit = fields[3]
            .parse::<u32>()
            .map_err(|source| ReportParseError::Number { field: 3, source })?;
        let flips_to = fields[4]
            .parse::<u8>()
            .map_err(|source| ReportParseError::Number { field: 4, source })?;
        if flips_to > 1 {
            return Err(ReportParseError::Direction(flips_to));
        }
        Ok(PairResult {
            agg1: hex(0)?,
            agg2: hex(1)?,
            victim: hex(2)?,
            bit,
            flips_to,
        })
    }
}

/// Collects every `RESULT PAIR` line of `reader`.
///
/// Other lines are ignored. Malformed `PAIR` lines are logged and skipped.
pub fn parse_pairs<R: BufRead>(reader: R) -> std::io::Result<Vec<PairResult>> {
    let mut pairs = vec![];
    for (lineno, line) in reader.lines().enumerate() {
        let line = line?;
        match line.parse::<PairResult>() {
            Ok(pair) => pairs.push(pair),
            Err(ReportParseError::NotAPair) => {}
            Err(e) => warn!("line {}: skipping malformed pair: {}", lineno + 1, e),
        }
    }
    Ok(pairs)
}

/// Sink for result lines.
pub trait ResultLog {
    /// Emits `line`.
    fn record(&mut self, line: ResultLine);
}

impl ResultLog for Vec<ResultLine> {
    fn record(&mut self, line: ResultLine) {
        self.push(line);
    }
}

/// Writes result lines to a writer, flushing after each line.
pub struct WriterLog<W> {
    writer: W,
}

impl<W: Write> WriterLog<W> {
    /// Creates a log writing to `writer`.
    pub fn new(writer: W) -> Self {
        WriterLog { writer }
    }
}

impl WriterLog<std::io::Stdout> {
    /// Creates a log writing to stdout.
    pub fn stdout() -> Self {
        WriterLog::new(std::io::stdout())
    }
}

impl<W: Write> ResultLog for WriterLog<W> {
    fn record(&mut self, line: ResultLine) {
        if let Err(e) = writeln!(self.writer, "{}", line).and_then(|_| self.writer.flush()) {
            error!("Failed to write result line {:?}: {}", line, e);
        }
    }
}

impl<L: ResultLog + ?Sized> ResultLog for &mut L {
    fn record(&mut self, line: ResultLine) {
        (**self).record(line)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pair() -> PairResult {
        PairResult {
            agg1: PhysAddr::new(0x1a2b3000),
            agg2: PhysAddr::new(0x1a2f3040),
            victim: PhysAddr::new(0x1a2d3008),
            bit: 17,
            flips_to: 1,
        }
    }

    #[test]
    fn test_line_formats() {
        assert_eq!(
            ResultLine::StartTime(1700000000).to_string(),
            "RESULT START_TIME,1700000000"
        );
        assert_eq!(
            ResultLine::Pair(pair()).to_string(),
            "RESULT PAIR,0x1a2b3000,0x1a2f3040,0x1a2d3008,17,1"
        );
        let stat = StatLine {
            elapsed: Duration::from_millis(12_346),
            unix_time: 1700000012,
            sets_tried: 100,
            errors: 1,
        };
        assert_eq!(
            ResultLine::Stat(stat).to_string(),
            "RESULT STAT,12.35,1700000012,100,1"
        );
    }

    #[test]
    fn test_parse_pair() {
        assert_eq!(ResultLine::Pair(pair()).to_string().parse(), Ok(pair()));
        assert_eq!(
            "RESULT STAT,1.00,0,0,0".parse::<PairResult>(),
            Err(ReportParseError::NotAPair)
        );
        assert_eq!(
            "RESULT PAIR,0x1,0x2,0x3,4".parse::<PairResult>(),
            Err(ReportParseError::FieldCount(4))
        );
        assert!(matches!(
            "RESULT PAIR,0x1,2,0x3,4,0".parse::<PairResult>(),
            Err(ReportParseError::MissingHexPrefix { field: 1, .. })
        ));
        assert_eq!(
            "RESULT PAIR,0x1,0x2,0x3,4,2".parse::<PairResult>(),
            Err(ReportParseError::Direction(2))
        );
    }

    #[test]
    fn test_parse_pairs_skips_other_lines() -> anyhow::Result<()> {
        let input = format!(
            "RESULT START_TIME,1\n[INFO] hammering\n{}\nRESULT PAIR,0xzz,0x2,0x3,4,0\n",
            ResultLine::Pair(pair())
        );
        let pairs = parse_pairs(input.as_bytes())?;
        assert_eq!(pairs, vec![pair()]);
        Ok(())
    }

    #[test]
    fn test_writer_log() {
        let mut out = vec![];
        {
            let mut log = WriterLog::new(&mut out);
            log.record(ResultLine::StartTime(5));
            log.record(ResultLine::StartTime(6));
        }
        assert_eq!(
            String::from_utf8_lossy(&out),
            "RESULT START_TIME,5\nRESULT START_TIME,6\n"
        );
    }

    #[test]
    fn test_fits_adjacent_rows() {
        let mapping = DramMapping::sandy_bridge_2x4g();
        // rows 0x101 and 0x103 sandwich row 0x102, bank bits are xored with the row
        let at_row = |row: usize| PhysAddr::new((row << 18) | (((row & 7) ^ 2) << 14));
        let pair = PairResult {
            agg1: at_row(0x101),
            agg2: at_row(0x103),
            victim: at_row(0x102) + 0x8,
            bit: 3,
            flips_to: 0,
        };
        assert!(pair.fits(&mapping));
        let far = PairResult {
            victim: at_row(0x110),
            ..pair
        };
        assert!(!far.fits(&mapping));
    }
}
