//! Phase orchestration.
//!
//! ```text
//! fetch (per node) --merge--> statistics (full range) --marker--> package
//! ```
//!
//! `run_fetch` only touches this node's block of the plan. `run_statistics`
//! is the barrier: it runs once over the merged raw directory and freezes the
//! normalization parameters. `run_package` refuses to start without a marker
//! that matches the current range, channels and raw files.
//!
//! Per-file work in every phase runs on a private rayon pool sized by
//! `max_workers`. Per-file failures are counted, never fatal.

use crate::config::BuildConfig;
use anyhow::{bail, Context, Result};
use chrono::NaiveDate;
use rayon::prelude::*;
use sdoml_core::align::{Aligner, Alignment, RawIndex};
use sdoml_core::data::{
    ChunkSummary, CircuitBreaker, FetchLedger, FetchProgress, Fetcher, HttpTransport,
    MirrorTransport, NpyDecoder, RawDecoder, Transport,
};
use sdoml_core::domain::{AlignedSample, Channel, Instrument, RawFileRecord};
use sdoml_core::normalize::{check_statistics, BuildIdentity, NormalizationError, Normalizer};
use sdoml_core::package::{Packager, ResolvedSample, ShardSummary};
use sdoml_core::stats::{input_fingerprint, FrozenStatistics, Observation, StatsAccumulator};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

pub fn worker_pool(max_workers: usize) -> Result<rayon::ThreadPool> {
    rayon::ThreadPoolBuilder::new()
        .num_threads(max_workers.max(1))
        .build()
        .context("failed to build worker pool")
}

/// Mirror copy when `remote.mirror_dir` is set, HTTP otherwise.
pub fn transport_for(config: &BuildConfig) -> Result<Arc<dyn Transport>> {
    if let Some(dir) = &config.remote.mirror_dir {
        return Ok(Arc::new(MirrorTransport::under(dir)));
    }
    let transport = HttpTransport::new(
        config.archive_roots(),
        Arc::new(CircuitBreaker::for_archive()),
        Duration::from_secs(config.remote.timeout_secs),
    )
    .context("failed to build HTTP client")?;
    Ok(Arc::new(transport))
}

pub fn decoder_for(config: &BuildConfig) -> NpyDecoder {
    NpyDecoder::new(Some(config.native_resolution))
}

// ── Phase 0: fetch ───────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchReport {
    pub node_index: usize,
    pub total_nodes: usize,
    pub transport: String,
    pub chunks: usize,
    pub by_instrument: BTreeMap<Instrument, ChunkSummary>,
    pub total: ChunkSummary,
    pub ledger: PathBuf,
    pub elapsed_ms: u64,
}

/// Fetch this node's block of both instruments and write its ledger.
pub fn run_fetch(
    config: &BuildConfig,
    transport: Arc<dyn Transport>,
    progress: &dyn FetchProgress,
) -> Result<FetchReport> {
    let start = Instant::now();
    let planner = config.planner()?;
    let mut fetcher = Fetcher::new(transport, config.retry_policy()).with_min_bytes(config.min_file_bytes);
    if config.validate_transfers {
        fetcher = fetcher.with_validator(Arc::new(decoder_for(config)));
    }
    let pool = worker_pool(config.max_workers)?;

    let mut report = FetchReport {
        node_index: config.node_index,
        total_nodes: config.total_nodes,
        transport: fetcher.transport_name().to_string(),
        total: ChunkSummary {
            node_index: config.node_index,
            ..ChunkSummary::default()
        },
        ..FetchReport::default()
    };
    let mut records: Vec<RawFileRecord> = Vec::new();

    for instrument in [Instrument::Slow, Instrument::Fast] {
        let mut plan = planner.plan(instrument, config.node_index)?;
        info!(
            node_index = config.node_index,
            %instrument,
            chunks = plan.chunks.len(),
            records = plan.record_count(),
            "fetching"
        );
        let summaries: Vec<ChunkSummary> = pool.install(|| {
            plan.chunks
                .par_iter_mut()
                .map(|chunk| fetcher.fetch_chunk(chunk, progress))
                .collect()
        });

        let mut merged = ChunkSummary {
            node_index: config.node_index,
            ..ChunkSummary::default()
        };
        for s in &summaries {
            merged.merge(s);
        }
        report.chunks += summaries.len();
        report.total.merge(&merged);
        report.by_instrument.insert(instrument, merged);
        records.extend(plan.into_records());
    }

    report.ledger = FetchLedger::new(&config.raw_dir)
        .write(config.node_index, &records)
        .context("failed to write fetch ledger")?;
    report.elapsed_ms = start.elapsed().as_millis() as u64;
    info!(
        node_index = report.node_index,
        records = report.total.records,
        transferred = report.total.transferred,
        failed = report.total.failed,
        corrupt = report.total.corrupt,
        "fetch finished"
    );
    Ok(report)
}

// ── Phase 1: statistics ──────────────────────────────────────────────

/// Decode every fast-cadence file of the full range and freeze the result.
///
/// Decoding runs in parallel; observations are folded in plan order so the
/// result does not depend on scheduling.
pub fn run_statistics(config: &BuildConfig) -> Result<FrozenStatistics> {
    let planner = config.planner()?;
    let records = planner.full_range_records(Instrument::Fast);
    let decoder = decoder_for(config);
    let pool = worker_pool(config.max_workers)?;
    info!(files = records.len(), range = %planner.range(), "computing statistics");

    let observations: Vec<Observation> = pool.install(|| {
        records
            .par_iter()
            .map(|r| Observation::of_file(&decoder, r))
            .collect()
    });

    let mut acc = StatsAccumulator::for_full_range(
        *planner.range(),
        config.cadence_minutes,
        config.channels()?,
        &records,
    );
    for (record, observation) in records.iter().zip(observations) {
        acc.observe(record, observation)?;
    }
    let mut frozen = acc.finalize(input_fingerprint(&records))?;
    frozen.config_fingerprint = Some(config.fingerprint()?);

    let path = frozen.write_marker(&config.raw_dir)?;
    for (channel, s) in &frozen.statistics {
        info!(%channel, files = s.files, max = s.max, mean = s.mean, "frozen");
    }
    info!(marker = %path.display(), complete = frozen.complete, "statistics frozen");
    Ok(frozen)
}

/// Load the marker and check it against the current config and raw files.
pub fn load_statistics(config: &BuildConfig, fast_records: &[RawFileRecord]) -> Result<FrozenStatistics> {
    let range = config.range()?;
    let channels = config.channels()?;
    let fingerprint = input_fingerprint(fast_records);
    let identity = BuildIdentity {
        range: &range,
        cadence_minutes: config.cadence_minutes,
        channels: &channels,
        input_fingerprint: &fingerprint,
    };
    let marker = FrozenStatistics::load_marker(&config.raw_dir)?;
    let frozen = check_statistics(marker, FrozenStatistics::marker_path(&config.raw_dir), &identity)?;
    if let Some(recorded) = &frozen.config_fingerprint {
        if *recorded != config.fingerprint()? {
            return Err(NormalizationError::StaleStatistics(
                "statistics-relevant config changed since phase 1".into(),
            )
            .into());
        }
    }
    Ok(frozen)
}

// ── Phase 2: normalize, align, package ───────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageReport {
    pub node_index: usize,
    pub resolution: usize,
    pub shards: Vec<ShardSummary>,
    pub samples: usize,
    pub complete: usize,
    pub incomplete: usize,
    /// Files on disk that failed to decode at packaging time.
    pub undecodable: usize,
    pub missing_by_channel: BTreeMap<Channel, usize>,
    pub elapsed_ms: u64,
}

/// Days this node packages: the same contiguous-block split as fetching.
pub fn node_days(days: &[NaiveDate], node_index: usize, total_nodes: usize) -> &[NaiveDate] {
    let n = total_nodes.max(1);
    let lo = node_index * days.len() / n;
    let hi = ((node_index + 1) * days.len() / n).min(days.len());
    &days[lo.min(hi)..hi]
}

/// Align every sample key of the range against the files on disk.
pub fn align(config: &BuildConfig) -> Result<Alignment> {
    let planner = config.planner()?;
    let records: Vec<RawFileRecord> = [Instrument::Slow, Instrument::Fast]
        .into_iter()
        .flat_map(|i| planner.full_range_records(i))
        .collect();
    let index = RawIndex::from_present(&records);
    Ok(Aligner::new(config.clock()?, config.channels()?).align(planner.range(), &index))
}

struct Resolved {
    sample: ResolvedSample,
    undecodable: usize,
}

fn resolve(
    sample: &AlignedSample,
    decoder: &dyn RawDecoder,
    normalizer: &Normalizer<'_>,
) -> Result<Resolved, NormalizationError> {
    let mut frames = BTreeMap::new();
    let mut undecodable = 0;
    for (channel, path) in sample.present() {
        match decoder.decode(path, channel) {
            Ok(frame) => {
                frames.insert(channel, normalizer.normalize(channel, &frame)?);
            }
            Err(e) => {
                undecodable += 1;
                warn!(%channel, key = %sample.key, error = %e, "undecodable file left out of sample");
            }
        }
    }
    Ok(Resolved {
        sample: ResolvedSample {
            key: sample.key,
            frames,
            complete: sample.is_complete() && undecodable == 0,
        },
        undecodable,
    })
}

/// Normalize and package this node's days. Requires the phase-1 marker.
pub fn run_package(config: &BuildConfig) -> Result<PackageReport> {
    let start = Instant::now();
    let planner = config.planner()?;
    let fast_records = planner.full_range_records(Instrument::Fast);
    let frozen = load_statistics(config, &fast_records)?;
    let normalizer = Normalizer::new(Some(&frozen), config.native_resolution, config.resolution)?;
    let decoder = decoder_for(config);
    let pool = worker_pool(config.max_workers)?;

    let alignment = align(config)?;
    let range = *planner.range();
    let packager = Packager::new(&config.out_dir, &config.shard_prefix, range);
    let days = range.days();
    let mine = node_days(&days, config.node_index, config.total_nodes);
    let by_day = alignment.by_day();
    let batch = config.max_workers.max(1) * config.worker_chunk_size.max(1);

    let mut report = PackageReport {
        node_index: config.node_index,
        resolution: config.resolution,
        ..PackageReport::default()
    };

    for day in mine {
        let samples = by_day.get(day).map(Vec::as_slice).unwrap_or_default();
        let mut writer = packager.begin_day(*day)?;
        for group in samples.chunks(batch) {
            let resolved: Vec<Result<Resolved, NormalizationError>> = pool.install(|| {
                group
                    .par_iter()
                    .map(|s| resolve(s, &decoder, &normalizer))
                    .collect()
            });
            for r in resolved {
                let r = r?;
                report.undecodable += r.undecodable;
                writer.add_sample(&r.sample)?;
            }
        }
        let shard = writer.finish()?;
        if shard.incomplete > 0 {
            info!(
                shard = %shard.path.display(),
                %day,
                samples = shard.samples,
                incomplete = shard.incomplete,
                "shard has incomplete samples"
            );
        } else {
            info!(shard = %shard.path.display(), %day, samples = shard.samples, "shard written");
        }
        report.samples += shard.samples;
        report.incomplete += shard.incomplete;
        report.shards.push(shard);
    }

    report.complete = report.samples - report.incomplete;
    report.missing_by_channel = alignment.missing_by_channel();
    report.elapsed_ms = start.elapsed().as_millis() as u64;
    Ok(report)
}

// ── Whole build ──────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildOutcome {
    pub fetch: FetchReport,
    pub statistics: FrozenStatistics,
    pub package: PackageReport,
}

/// Fetch, freeze statistics and package on a single node.
pub fn run_build(
    config: &BuildConfig,
    transport: Arc<dyn Transport>,
    progress: &dyn FetchProgress,
) -> Result<BuildOutcome> {
    if config.total_nodes > 1 {
        bail!(
            "build runs every phase on one node; with {} nodes run `fetch` on each, \
             merge the raw directories, then run `stats` and `package`",
            config.total_nodes
        );
    }
    let fetch = run_fetch(config, transport, progress)?;
    let statistics = run_statistics(config)?;
    let package = run_package(config)?;
    Ok(BuildOutcome {
        fetch,
        statistics,
        package,
    })
}
