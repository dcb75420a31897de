//! DRAM refresh interval measurement.
//!
//! [`gather`] repeatedly reads a flushed cache line and records the time
//! between consecutive reads. Reads that collide with a refresh command take
//! noticeably longer. [`analyse`] keeps the slow reads and sweeps candidate
//! periods with a direct Fourier sum to find the period at which the slow
//! reads line up, which should be close to [`REFRESH_INTERVAL_NS`].

use std::f64::consts::PI;
use std::io::{BufRead, Write};
use std::time::Instant;

use crate::memory::{BytePointer, Memory};
use crate::util::{PAGE_SIZE, REFRESH_COMMANDS, REFRESH_INTERVAL_NS, clflush};
use log::{debug, info};
use serde::Serialize;

/// Reads at least this slow are counted as refresh collisions.
pub const DEFAULT_CUTOFF_NS: u64 = 150;

/// Records access intervals on a flushed line for `intervals` refresh intervals.
///
/// Returns the time in nanoseconds between consecutive reads, starting with
/// the time from the start of sampling to the first read.
///
/// # Errors
///
/// Returns an error if the probe page cannot be mapped.
pub fn gather(intervals: u64) -> std::io::Result<Vec<u64>> {
    let memory = Memory::mmap(PAGE_SIZE)?;
    let line = memory.ptr() as *const u8;
    let max_time = REFRESH_INTERVAL_NS * intervals;
    let mut times = Vec::with_capacity((max_time / 100) as usize);
    let start = Instant::now();
    loop {
        unsafe {
            line.read_volatile();
            clflush(line);
        }
        let offset = start.elapsed().as_nanos() as u64;
        times.push(offset);
        if offset >= max_time {
            break;
        }
    }
    debug!("Gathered {} samples over {} ns", times.len(), max_time);
    let mut prev = 0;
    Ok(times
        .into_iter()
        .map(|t| {
            let delta = t - prev;
            prev = t;
            delta
        })
        .collect())
}

/// Writes one sample per line.
pub fn save_samples<W: Write>(mut writer: W, samples: &[u64]) -> std::io::Result<()> {
    for sample in samples {
        writeln!(writer, "{}", sample)?;
    }
    writer.flush()
}

/// Reads samples written by [`save_samples`]. Blank lines are skipped.
pub fn load_samples<R: BufRead>(reader: R) -> std::io::Result<Vec<u64>> {
    let mut samples = vec![];
    for line in reader.lines() {
        let line = line?;
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        samples.push(
            line.parse()
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?,
        );
    }
    Ok(samples)
}

/// Magnitude of the Fourier sum at one candidate period.
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct SpectrumPoint {
    /// Candidate period in nanoseconds
    pub period: u64,
    /// Magnitude of the sum over all slow samples
    pub magnitude: f64,
    /// Change of magnitude relative to the previous period
    pub derivative: f64,
    /// Magnitude divided by the number of periods in the sampling window
    pub scaled: f64,
}

/// A local maximum of the spectrum whose slow reads line up with most periods.
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct Spike {
    /// Period in nanoseconds
    pub period: u64,
    /// Frequency as a multiple of the nominal refresh frequency
    pub freq_multiple: f64,
    /// Fraction of periods that showed a slow read
    pub scaled: f64,
}

impl Spike {
    /// Length of a full refresh cycle implied by this period.
    pub fn refresh_period_ms(&self) -> f64 {
        self.period as f64 * REFRESH_COMMANDS as f64 / 1e6
    }
}

/// Result of [`analyse`].
#[derive(Clone, Debug, Serialize)]
pub struct RefreshAnalysis {
    /// Number of samples
    pub samples: usize,
    /// Samples at or above the cutoff
    pub slow_samples: usize,
    /// Sampling window in nanoseconds
    pub total_time: u64,
    /// Magnitude per candidate period
    #[serde(skip_serializing)]
    pub spectrum: Vec<SpectrumPoint>,
    /// Detected spikes in ascending period order
    pub spikes: Vec<Spike>,
}

impl RefreshAnalysis {
    /// The spike with the largest scaled magnitude.
    pub fn strongest(&self) -> Option<&Spike> {
        self.spikes
            .iter()
            .max_by(|a, b| a.scaled.total_cmp(&b.scaled))
    }
}

/// Sweeps periods from 1/8 to 4 refresh intervals over the samples slower than `cutoff_ns`.
///
/// A period is reported as a spike where the magnitude stops rising and the
/// scaled magnitude is within `[0.8, 1.1)`, i.e. nearly every period saw one
/// slow read.
pub fn analyse(deltas: &[u64], cutoff_ns: u64) -> RefreshAnalysis {
    let mut time = 0u64;
    let mut slow = vec![];
    for &delta in deltas {
        if delta >= cutoff_ns {
            slow.push(time as f64);
        }
        time += delta;
    }
    let total_time = time;
    info!(
        "Have {} time points, with {} longer than {} ns",
        deltas.len(),
        slow.len(),
        cutoff_ns
    );

    let mut spectrum = vec![];
    let mut spikes = vec![];
    let mut mag_prev = 0.0;
    let mut deriv_prev = 0.0;
    for period in REFRESH_INTERVAL_NS / 8..REFRESH_INTERVAL_NS * 4 {
        let multiplier = 2.0 * PI / period as f64;
        let (sin, cos) = slow.iter().fold((0.0, 0.0), |(s, c), &t| {
            let angle = multiplier * t;
            (s + angle.sin(), c + angle.cos())
        });
        let magnitude = sin.hypot(cos);
        let derivative = magnitude - mag_prev;
        let scaled = magnitude / (total_time as f64 / period as f64);
        if deriv_prev > 0.0 && derivative <= 0.0 && (0.8..1.1).contains(&scaled) {
            let spike = Spike {
                period,
                freq_multiple: REFRESH_INTERVAL_NS as f64 / period as f64,
                scaled,
            };
            info!(
                "Spike at freq {:.1} -> {:.2} us -> {:.1} ms: saw {:.3} of refreshes",
                spike.freq_multiple,
                period as f64 / 1e3,
                spike.refresh_period_ms(),
                scaled
            );
            spikes.push(spike);
        }
        spectrum.push(SpectrumPoint {
            period,
            magnitude,
            derivative,
            scaled,
        });
        mag_prev = magnitude;
        deriv_prev = derivative;
    }
    RefreshAnalysis {
        samples: deltas.len(),
        slow_samples: slow.len(),
        total_time,
        spectrum,
        spikes,
    }
}
