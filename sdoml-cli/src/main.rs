//! SDOML-lite CLI: plan, fetch, freeze statistics, package and inspect.
//!
//! Commands:
//! - `plan`: show the chunks this node would fetch
//! - `fetch`: fetch this node's block of raw files and write its ledger
//! - `stats`: freeze normalization statistics over the merged raw set (phase 1)
//! - `package`: normalize, align and write this node's day shards (phase 2)
//! - `build`: all three phases on a single node
//! - `status`: ledger counts and phase progress
//! - `inspect`: list truncated raw files
//! - `verify`: index the written shards like a training-side reader
//! - `synthesize`: write deterministic synthetic raw data

use anyhow::{bail, Result};
use clap::{Args, Parser, Subcommand};
use sdoml_core::data::{FetchProgress, LogProgress};
use sdoml_core::domain::Instrument;
use sdoml_runner::pipeline::{self, transport_for};
use sdoml_runner::report::{write_alignment_csv, BuildReport, BUILD_REPORT};
use sdoml_runner::synthetic::{parse_omission, synthesize, SyntheticOptions, SyntheticTarget};
use sdoml_runner::{inspect, logging, BuildConfig};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "sdoml", about = "SDOML-lite dataset builder")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

/// Where the build config comes from, plus per-field overrides.
#[derive(Args, Debug, Clone)]
struct BuildArgs {
    /// Path to a TOML build config.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Range start (ISO-8601, minute precision). Required without --config.
    #[arg(long)]
    start: Option<String>,

    /// Range end, exclusive.
    #[arg(long)]
    end: Option<String>,

    #[arg(long)]
    raw_dir: Option<PathBuf>,

    #[arg(long)]
    out_dir: Option<PathBuf>,

    #[arg(long)]
    total_nodes: Option<usize>,

    #[arg(long)]
    node_index: Option<usize>,

    #[arg(long)]
    max_workers: Option<usize>,

    #[arg(long)]
    worker_chunk_size: Option<usize>,

    /// Output edge length in pixels.
    #[arg(long)]
    resolution: Option<usize>,

    /// Fast-cadence wavelengths, comma separated (e.g. 131,171,193).
    #[arg(long, value_delimiter = ',')]
    wavelengths: Option<Vec<u16>>,

    /// Fetch from a local archive mirror instead of HTTP.
    #[arg(long)]
    mirror: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Show the chunks this node would fetch.
    Plan {
        #[command(flatten)]
        args: BuildArgs,

        /// Print the full plan as JSON.
        #[arg(long, default_value_t = false)]
        json: bool,
    },
    /// Fetch this node's block of raw files.
    Fetch {
        #[command(flatten)]
        args: BuildArgs,
    },
    /// Phase 1: freeze statistics over the merged raw directory.
    Stats {
        #[command(flatten)]
        args: BuildArgs,
    },
    /// Phase 2: normalize, align and package this node's days.
    Package {
        #[command(flatten)]
        args: BuildArgs,
    },
    /// Fetch, stats and package on a single node.
    Build {
        #[command(flatten)]
        args: BuildArgs,
    },
    /// Ledger counts and phase progress.
    Status {
        #[command(flatten)]
        args: BuildArgs,
    },
    /// List raw files below a byte threshold.
    Inspect {
        #[command(flatten)]
        args: BuildArgs,

        /// Files smaller than this are reported.
        #[arg(long, default_value_t = 1024)]
        min_bytes: u64,
    },
    /// Index written shards and report per-channel counts.
    Verify {
        #[command(flatten)]
        args: BuildArgs,
    },
    /// Write deterministic synthetic raw data for the range.
    Synthesize {
        #[command(flatten)]
        args: BuildArgs,

        #[arg(long, default_value_t = 0)]
        seed: u64,

        /// Frame edge length. Defaults to the native resolution.
        #[arg(long)]
        size: Option<usize>,

        /// Files to leave out, as CHANNEL@TIMESTAMP (e.g. HMI_M@2024-01-01T01:00).
        #[arg(long)]
        omit: Vec<String>,

        /// Write an archive-shaped mirror here instead of the raw directory.
        #[arg(long)]
        mirror_out: Option<PathBuf>,
    },
}

fn main() -> Result<()> {
    logging::init_tracing();
    let cli = Cli::parse();

    match cli.command {
        Commands::Plan { args, json } => run_plan(&load_config(&args)?, json),
        Commands::Fetch { args } => run_fetch_cmd(&load_config(&args)?),
        Commands::Stats { args } => run_stats_cmd(&load_config(&args)?),
        Commands::Package { args } => run_package_cmd(&load_config(&args)?),
        Commands::Build { args } => run_build_cmd(&load_config(&args)?),
        Commands::Status { args } => run_status(&load_config(&args)?),
        Commands::Inspect { args, min_bytes } => run_inspect(&load_config(&args)?, min_bytes),
        Commands::Verify { args } => run_verify(&load_config(&args)?),
        Commands::Synthesize {
            args,
            seed,
            size,
            omit,
            mirror_out,
        } => run_synthesize(&load_config(&args)?, seed, size, &omit, mirror_out),
    }
}

fn load_config(args: &BuildArgs) -> Result<BuildConfig> {
    let mut config = match (&args.config, &args.start, &args.end) {
        (Some(path), _, _) => BuildConfig::from_file(path)?,
        (None, Some(start), Some(end)) => BuildConfig::for_range(start, end),
        _ => bail!("either --config or both --start and --end are required"),
    };
    if args.config.is_some() {
        if let Some(start) = &args.start {
            config.date_start = start.clone();
        }
        if let Some(end) = &args.end {
            config.date_end = end.clone();
        }
    }
    if let Some(v) = &args.raw_dir {
        config.raw_dir = v.clone();
    }
    if let Some(v) = &args.out_dir {
        config.out_dir = v.clone();
    }
    if let Some(v) = args.total_nodes {
        config.total_nodes = v;
    }
    if let Some(v) = args.node_index {
        config.node_index = v;
    }
    if let Some(v) = args.max_workers {
        config.max_workers = v;
    }
    if let Some(v) = args.worker_chunk_size {
        config.worker_chunk_size = v;
    }
    if let Some(v) = args.resolution {
        config.resolution = v;
    }
    if let Some(v) = &args.wavelengths {
        config.wavelengths = v.clone();
    }
    if let Some(v) = &args.mirror {
        config.remote.mirror_dir = Some(v.clone());
    }
    config.validate()?;
    Ok(config)
}

/// Merge one phase's result into `_reports/build.json`.
fn update_report(config: &BuildConfig, apply: impl FnOnce(&mut BuildReport)) -> Result<()> {
    let dir = config.reports_dir();
    let existing = dir.join(BUILD_REPORT);
    let mut report = match BuildReport::load(&existing) {
        Ok(r) if r.config_fingerprint == config.fingerprint()? => r,
        _ => BuildReport::new(config)?,
    };
    apply(&mut report);
    report.generated_at = chrono::Utc::now().naive_utc();
    report.collect_warnings();
    for w in &report.warnings {
        eprintln!("warning: {w}");
    }
    let path = report.write(&dir)?;
    println!("Report: {}", path.display());
    Ok(())
}

fn run_plan(config: &BuildConfig, json: bool) -> Result<()> {
    let planner = config.planner()?;
    for instrument in [Instrument::Slow, Instrument::Fast] {
        let plan = planner.plan(instrument, config.node_index)?;
        if json {
            println!("{}", serde_json::to_string_pretty(&plan)?);
            continue;
        }
        let first = plan.timestamps.first().map(|t| t.to_string()).unwrap_or_default();
        let last = plan.timestamps.last().map(|t| t.to_string()).unwrap_or_default();
        println!(
            "{instrument}: node {}/{} -> {} timestamps ({first} .. {last}), {} chunks, {} records",
            plan.node_index + 1,
            plan.total_nodes,
            plan.timestamps.len(),
            plan.chunks.len(),
            plan.record_count(),
        );
    }
    Ok(())
}

fn run_fetch_cmd(config: &BuildConfig) -> Result<()> {
    let progress: &dyn FetchProgress = &LogProgress;
    let report = pipeline::run_fetch(config, transport_for(config)?, progress)?;
    println!(
        "Fetched node {}: {} records, {} transferred, {} already present, {} failed, {} corrupt",
        report.node_index,
        report.total.records,
        report.total.transferred,
        report.total.skipped,
        report.total.failed,
        report.total.corrupt,
    );
    println!("Ledger: {}", report.ledger.display());
    update_report(config, |r| r.fetch = Some(report))
}

fn run_stats_cmd(config: &BuildConfig) -> Result<()> {
    let frozen = pipeline::run_statistics(config)?;
    for (channel, s) in &frozen.statistics {
        let cov = &frozen.coverage[channel];
        println!(
            "{channel}: {}/{} files, max {:.3}, mean {:.3}, std {:.3}",
            cov.decoded,
            cov.expected,
            s.max,
            s.mean,
            s.std_dev()
        );
    }
    if !frozen.complete {
        eprintln!("warning: statistics were computed on an incomplete file set");
    }
    update_report(config, |r| r.statistics = Some(frozen))
}

fn run_package_cmd(config: &BuildConfig) -> Result<()> {
    let report = pipeline::run_package(config)?;
    for shard in &report.shards {
        println!(
            "{} {}: {} samples ({} incomplete), {} entries",
            shard.day,
            shard.path.display(),
            shard.samples,
            shard.incomplete,
            shard.entries
        );
    }
    let alignment = pipeline::align(config)?;
    let csv = write_alignment_csv(&config.reports_dir(), &alignment, &config.channels()?.all())?;
    println!("Alignment: {}", csv.display());
    update_report(config, |r| r.package = Some(report))
}

fn run_build_cmd(config: &BuildConfig) -> Result<()> {
    let outcome = pipeline::run_build(config, transport_for(config)?, &LogProgress)?;
    println!(
        "Built {} shards, {} samples ({} incomplete)",
        outcome.package.shards.len(),
        outcome.package.samples,
        outcome.package.incomplete
    );
    let alignment = pipeline::align(config)?;
    write_alignment_csv(&config.reports_dir(), &alignment, &config.channels()?.all())?;
    update_report(config, |r| {
        r.fetch = Some(outcome.fetch);
        r.statistics = Some(outcome.statistics);
        r.package = Some(outcome.package);
    })
}

fn run_status(config: &BuildConfig) -> Result<()> {
    let status = inspect::status(config)?;
    println!("Raw files on disk: {}", status.raw_files);
    if status.ledger.nodes.is_empty() {
        println!("No fetch ledgers yet.");
    } else {
        println!("Ledgers from nodes: {:?}", status.ledger.nodes);
        println!(
            "{:<10} {:>10} {:>10} {:>8} {:>8}",
            "channel", "downloaded", "pending", "failed", "corrupt"
        );
        for (channel, c) in &status.ledger.channels {
            println!(
                "{:<10} {:>10} {:>10} {:>8} {:>8}",
                channel.tag(),
                c.downloaded,
                c.pending,
                c.failed,
                c.corrupt
            );
        }
    }
    match (&status.statistics_marker, status.statistics_complete) {
        (Some(path), Some(complete)) => println!(
            "Statistics: frozen at {} ({})",
            path.display(),
            if complete { "complete" } else { "incomplete" }
        ),
        _ => println!("Statistics: not computed (phase 1 pending)"),
    }
    println!("Shards: {}", status.shards);
    Ok(())
}

fn run_inspect(config: &BuildConfig, min_bytes: u64) -> Result<()> {
    let files = inspect::undersized(config, min_bytes)?;
    if files.is_empty() {
        println!("No raw files below {min_bytes} bytes.");
        return Ok(());
    }
    for f in &files {
        println!("{:>8}  {}  {}", f.bytes, f.channel.tag(), f.path.display());
    }
    println!("{} files below {min_bytes} bytes", files.len());
    Ok(())
}

fn run_verify(config: &BuildConfig) -> Result<()> {
    let checks = inspect::verify(config)?;
    let mut bad = 0;
    for c in &checks {
        let counts: Vec<String> = c.channel_counts.iter().map(|(t, n)| format!("{t}={n}")).collect();
        println!(
            "{}: {} entries in {} groups [{}]",
            c.path.display(),
            c.entries,
            c.groups,
            counts.join(", ")
        );
        if c.day.is_none() {
            println!("  name does not match any day of the range");
        }
        for d in &c.duplicates {
            println!("  duplicate entry: {d}");
        }
        for f in &c.foreign {
            println!("  group from another day: {f}");
        }
        if !c.is_ok() {
            bad += 1;
        }
    }
    if bad > 0 {
        bail!("{bad} of {} shards failed verification", checks.len());
    }
    println!("{} shards verified", checks.len());
    Ok(())
}

fn run_synthesize(
    config: &BuildConfig,
    seed: u64,
    size: Option<usize>,
    omit: &[String],
    mirror_out: Option<PathBuf>,
) -> Result<()> {
    let options = SyntheticOptions {
        seed,
        size,
        omit: omit.iter().map(|s| parse_omission(s)).collect::<Result<_>>()?,
    };
    let target = match mirror_out {
        Some(dir) => SyntheticTarget::Mirror(dir),
        None => SyntheticTarget::RawDir,
    };
    let summary = synthesize(config, &options, &target)?;
    println!(
        "Wrote {} synthetic files ({} bytes), omitted {}",
        summary.written, summary.bytes, summary.omitted
    );
    Ok(())
}
