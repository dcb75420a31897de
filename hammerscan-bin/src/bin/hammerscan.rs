use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use hammerscan_bin::{
    init_logging_with_progress, is_init, mapping_size, park_forever, physical_memory, set_alarm,
    supervise,
};
use hammerscan_core::hammerer::{DEFAULT_EVICTORS, PoolEviction};
use hammerscan_core::memory::{
    AggressorPtr, BitFlipDetector, CacheGeometryConfig, CacheMapping, CandidatePool, DramMapping,
    LinuxPageMap, Memory, MultiBitPolicy, PoolConfig, RowGeometry, Traversal, VictimRegion,
    XorSliceHash,
};
use hammerscan_core::probe::{EvictionProbe, ProbePoint};
use hammerscan_core::refresh::{self, DEFAULT_CUTOFF_NS};
use hammerscan_core::report::{WriterLog, parse_pairs};
use hammerscan_core::util::{DEFAULT_ROW_SIZE, Rng};
use hammerscan_core::{
    DEFAULT_NARROWING_ITERATIONS, DEFAULT_REPLAY_ITERATIONS, DEFAULT_SWEEP_READS,
    DoubleSidedSweep, HammerEngine, HammerMode, Hammering, MemCheck, Narrowing, NarrowingConfig,
    RandomPages, ReplayConfig, RowPairs, SweepConfig, replay,
};
use indicatif::MultiProgress;
use log::{info, warn};
use rand::Rng as _;
use serde::Serialize;

/// CLI arguments for the `hammerscan` binary.
#[derive(Debug, Parser, Serialize)]
#[command(version, about = "Row-hammer fault induction and detection")]
struct CliArgs {
    /// Fraction of physical memory to map as candidate pool.
    #[clap(long = "fraction", global = true, default_value = "0.25")]
    fraction: f64,
    /// Number of CPU cores, selects the LLC slice hash.
    #[clap(long = "cores", global = true, default_value = "2")]
    cores: usize,
    /// JSON cache geometry file, overrides `--cores`.
    #[clap(long = "cache-config", global = true)]
    cache_config: Option<PathBuf>,
    /// DRAM row size in bytes.
    #[clap(long = "row-size", global = true, default_value_t = DEFAULT_ROW_SIZE)]
    row_size: usize,
    /// Kill the run after this many minutes.
    #[clap(long = "timeout", global = true)]
    timeout: Option<u64>,
    /// Run in a forked child and report its exit status.
    #[clap(long = "supervise", global = true)]
    supervise: bool,
    /// Hand out pages of a row or cache set in random order.
    #[clap(long = "shuffle", global = true)]
    shuffle: bool,
    /// Output file for results (JSON format).
    #[clap(long = "output", global = true)]
    output: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand, Serialize)]
enum Command {
    /// Narrow flipping candidate sets down to reproducible aggressor pairs.
    Narrow {
        /// Pages per random candidate set.
        #[clap(long = "addrs", default_value = "8")]
        addrs: usize,
        /// Draw sets from the rows around each victim row instead of random pages.
        #[clap(long = "row-pairs")]
        row_pairs: bool,
        /// Rounds over a candidate set per trial.
        #[clap(long = "iterations", default_value_t = DEFAULT_NARROWING_ITERATIONS)]
        iterations: u64,
        /// Seed of the random candidate picker.
        #[clap(long = "seed")]
        seed: Option<u64>,
        /// Stop narrowing after this many minutes.
        #[clap(long = "budget", default_value = "60")]
        budget: u64,
        /// Stop after this many confirmed pairs, 0 for no limit.
        #[clap(long = "max-pairs", default_value = "1")]
        max_pairs: usize,
        /// Report every flipped bit of a word instead of the last one.
        #[clap(long = "all-bits")]
        all_bits: bool,
        /// Hammer through same-set eviction groups instead of clflush.
        #[clap(long = "evict")]
        evict: bool,
    },
    /// Hammer every row between two fully mapped neighbour rows.
    Sweep {
        /// Reads per aggressor and pair.
        #[clap(long = "reads", default_value_t = DEFAULT_SWEEP_READS)]
        reads: u64,
        /// Stop after this many rows.
        #[clap(long = "max-rows")]
        max_rows: Option<usize>,
        /// Hammer through same-set eviction groups instead of clflush.
        #[clap(long = "evict")]
        evict: bool,
    },
    /// Replay recorded `RESULT PAIR` lines in cache-eviction mode.
    Replay {
        /// File with `RESULT PAIR` lines.
        #[clap(long = "input")]
        input: PathBuf,
        /// Rounds over each eviction group.
        #[clap(long = "iterations", default_value_t = DEFAULT_REPLAY_ITERATIONS)]
        iterations: u64,
        /// Same-set addresses per eviction group.
        #[clap(long = "evictors", default_value_t = DEFAULT_EVICTORS)]
        evictors: usize,
        /// Passes over all recorded pairs.
        #[clap(long = "passes", default_value = "1")]
        passes: usize,
    },
    /// Measure the DRAM refresh interval.
    Refresh {
        /// Refresh intervals to sample.
        #[clap(long = "intervals", default_value = "8192")]
        intervals: u64,
        /// Reads at least this slow count as refresh collisions.
        #[clap(long = "cutoff", default_value_t = DEFAULT_CUTOFF_NS)]
        cutoff: u64,
        /// Analyse samples from this file instead of measuring.
        #[clap(long = "load")]
        load: Option<PathBuf>,
        /// Store the measured samples in this file.
        #[clap(long = "save")]
        save: Option<PathBuf>,
    },
    /// Measure re-read latency over growing same-set groups.
    Probe {
        /// Random pages to probe.
        #[clap(long = "targets", default_value = "4")]
        targets: usize,
        /// Largest group size.
        #[clap(long = "max-addrs", default_value = "52")]
        max_addrs: usize,
        /// Measurements per group size.
        #[clap(long = "runs", default_value = "10")]
        runs: usize,
    },
}

#[derive(Serialize)]
struct RunResults<'a, T: Serialize> {
    date: String,
    args: &'a CliArgs,
    result: T,
}

#[derive(Serialize)]
struct ProbeResult {
    target: usize,
    points: Vec<ProbePoint>,
}

fn main() -> Result<()> {
    let progress = init_logging_with_progress()?;
    let args = CliArgs::parse();
    info!("CLI args: {:?}", args);

    if args.supervise {
        if let Some(code) = supervise()? {
            if is_init() {
                park_forever();
            }
            std::process::exit(code);
        }
    }
    if let Some(timeout) = args.timeout {
        set_alarm(Duration::from_secs(timeout * 60));
    }

    match &args.command {
        Command::Narrow {
            addrs,
            row_pairs,
            iterations,
            seed,
            budget,
            max_pairs,
            all_bits,
            evict,
        } => {
            let pool = build_pool(&args, &progress)?;
            let detector = BitFlipDetector {
                policy: if *all_bits {
                    MultiBitPolicy::AllBits
                } else {
                    MultiBitPolicy::LastBitOnly
                },
                ..BitFlipDetector::pfn_bits()
            };
            let config = NarrowingConfig {
                time_budget: Some(Duration::from_secs(budget * 60)),
                max_pairs: (*max_pairs > 0).then_some(*max_pairs),
                ..Default::default()
            };
            let source: Box<dyn Iterator<Item = Vec<AggressorPtr>> + '_> = if *row_pairs {
                Box::new(RowPairs::new(&pool, addrs.div_ceil(2)))
            } else {
                let rng = seed.map(Rng::from_seed).unwrap_or_else(Rng::from_entropy);
                Box::new(RandomPages::new(&pool, *addrs, rng))
            };
            let report = if *evict {
                let hammerer = PoolEviction::new(&pool, DEFAULT_EVICTORS, *iterations);
                narrow(&pool, hammerer, detector, config, source, &progress)?
            } else {
                let hammerer = HammerEngine::new(HammerMode::ExplicitFlush, *iterations);
                narrow(&pool, hammerer, detector, config, source, &progress)?
            };
            info!(
                "Narrowing done: {} sets, {} errors, {} abandoned, {} confirmed",
                report.sets_tried,
                report.errors,
                report.abandoned,
                report.confirmed.len()
            );
            save_results(&args, &report)?;
        }
        Command::Sweep {
            reads,
            max_rows,
            evict,
        } => {
            let pool = build_pool(&args, &progress)?;
            let sweep = DoubleSidedSweep::new(
                SweepConfig {
                    max_rows: *max_rows,
                    ..Default::default()
                },
                BitFlipDetector::pfn_bits(),
            )
            .with_progress(progress.clone());
            let report = if *evict {
                let hammerer = PoolEviction::new(&pool, DEFAULT_EVICTORS, *reads);
                sweep.run(&pool, &hammerer, WriterLog::stdout())?
            } else {
                let hammerer = HammerEngine::new(HammerMode::ExplicitFlush, *reads);
                sweep.run(&pool, &hammerer, WriterLog::stdout())?
            };
            save_results(&args, &report)?;
        }
        Command::Replay {
            input,
            iterations,
            evictors,
            passes,
        } => {
            let file = File::open(input).with_context(|| format!("opening {}", input.display()))?;
            let targets = parse_pairs(BufReader::new(file))?;
            if targets.is_empty() {
                bail!("no RESULT PAIR lines in {}", input.display());
            }
            let mapping = DramMapping::default();
            for target in &targets {
                info!(
                    "0x{:x} {} / 0x{:x} {} -> 0x{:x} {}: {}",
                    target.agg1,
                    mapping.decode(target.agg1),
                    target.agg2,
                    mapping.decode(target.agg2),
                    target.victim,
                    mapping.decode(target.victim),
                    if target.fits(&mapping) {
                        "adjacent"
                    } else {
                        "not explained by adjacent rows"
                    }
                );
            }
            let pool = build_pool(&args, &progress)?;
            let config = ReplayConfig {
                iterations: *iterations,
                evictors: *evictors,
                passes: *passes,
                ..Default::default()
            };
            let outcome = replay(pool, &targets, &config, |plan| plan.clone())?;
            info!(
                "Pair 0x{:x}/0x{:x} flips bit {} in {} of {} rounds",
                outcome.target.agg1,
                outcome.target.agg2,
                outcome.flip.bit,
                outcome.hits,
                outcome.rounds
            );
            save_results(&args, &outcome)?;
        }
        Command::Refresh {
            intervals,
            cutoff,
            load,
            save,
        } => {
            let deltas = match load {
                Some(path) => {
                    let file = File::open(path)
                        .with_context(|| format!("opening {}", path.display()))?;
                    refresh::load_samples(BufReader::new(file))?
                }
                None => refresh::gather(*intervals)?,
            };
            if let Some(path) = save {
                refresh::save_samples(BufWriter::new(File::create(path)?), &deltas)?;
                info!("Samples saved to {}", path.display());
            }
            let analysis = refresh::analyse(&deltas, *cutoff);
            match analysis.strongest() {
                Some(spike) => info!(
                    "Refresh interval {} ns, refresh period {:.1} ms",
                    spike.period,
                    spike.refresh_period_ms()
                ),
                None => warn!("No refresh spike found"),
            }
            save_results(&args, &analysis)?;
        }
        Command::Probe {
            targets,
            max_addrs,
            runs,
        } => {
            let pool = build_pool(&args, &progress)?;
            let probe = EvictionProbe {
                max_addrs: *max_addrs,
                runs: *runs,
            };
            let mut rng = rand::rng();
            let mut results = Vec::with_capacity(*targets);
            for _ in 0..*targets {
                let target = pool.random_page(&mut rng).wrapping_add(rng.random_range(0..64) * 64);
                let points = probe.run(&pool, target as AggressorPtr)?;
                for point in &points {
                    info!("{:p}: {} addrs -> {} ns", target, point.addr_count, point.latency_ns);
                }
                results.push(ProbeResult {
                    target: target as usize,
                    points,
                });
            }
            save_results(&args, &results)?;
        }
    }
    Ok(())
}

fn cache_model(args: &CliArgs) -> Result<Box<dyn CacheMapping>> {
    let hash = match &args.cache_config {
        Some(path) => {
            let config = CacheGeometryConfig::from_jsonfile(path)
                .with_context(|| format!("loading {}", path.display()))?;
            XorSliceHash::new(&config)?
        }
        None => XorSliceHash::sandy_bridge(args.cores)?,
    };
    Ok(Box::new(hash))
}

fn build_pool(args: &CliArgs, progress: &MultiProgress) -> Result<CandidatePool> {
    let size = mapping_size(physical_memory()?, args.fraction)?;
    info!("Mapping {} MB", size >> 20);
    let memory = Memory::mmap(size).context("mapping candidate memory")?;
    let mut pagemap = LinuxPageMap::new()?;
    let config = PoolConfig {
        rows: RowGeometry::new(args.row_size),
        traversal: if args.shuffle {
            Traversal::Shuffled
        } else {
            Traversal::Ordered
        },
    };
    let pool = CandidatePool::build(
        memory,
        &mut pagemap,
        Some(cache_model(args)?),
        config,
        Some(progress),
    )?;
    info!("Candidate pool holds {} pages", pool.len());
    Ok(pool)
}

fn narrow<'p, H>(
    pool: &'p CandidatePool,
    hammerer: H,
    detector: BitFlipDetector,
    config: NarrowingConfig,
    source: Box<dyn Iterator<Item = Vec<AggressorPtr>> + 'p>,
    progress: &MultiProgress,
) -> Result<hammerscan_core::NarrowingReport>
where
    H: Hammering,
    H::Error: Send + Sync + 'static,
{
    let victim = MemCheck::new(VictimRegion::from_memory(pool.memory()), detector);
    let mut narrowing = Narrowing::builder(hammerer, victim)
        .config(config)
        .progress(progress.clone())
        .build()?;
    let mut pagemap = LinuxPageMap::new()?;
    Ok(narrowing.run(source, &mut pagemap, WriterLog::stdout())?)
}

fn save_results<T: Serialize>(args: &CliArgs, result: &T) -> Result<()> {
    let Some(path) = &args.output else {
        return Ok(());
    };
    write_json(path, &RunResults {
        date: chrono::Local::now().to_rfc3339(),
        args,
        result,
    })
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
    let mut writer = BufWriter::new(file);
    serde_json::to_writer_pretty(&mut writer, value)?;
    writer.flush()?;
    info!("Results saved to {}", path.display());
    Ok(())
}
