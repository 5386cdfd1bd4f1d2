//! Phase 1: full-range statistics for the fast-cadence channels.
//!
//! The accumulator is created from the planner's full-range record set and
//! refuses to finalize until every one of those records has been observed
//! (present, missing or corrupt). A pass over one chunk therefore cannot
//! produce statistics. Finalized statistics are frozen into
//! `_stats/statistics.json` under the raw root; phase 2 only runs against a
//! marker whose range, channels and input fingerprint match the current raw
//! set.
//!
//! Normalization formula, per fast channel:
//!
//! ```text
//! c    = max of all finite decoded pixels over the full range
//! f(x) = min(sqrt(max(x, 0)), sqrt(c)) / sqrt(c)     (0 if c <= 0 or x is not finite)
//! ```
//!
//! Count, min, mean and variance are recorded alongside for reporting.

use crate::data::RawDecoder;
use crate::domain::{Channel, ChannelSet, DateRange, Frame, RawFileRecord};
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::warn;

pub const STATS_DIR: &str = "_stats";
pub const MARKER_FILE: &str = "statistics.json";

#[derive(Debug, Error)]
pub enum StatsError {
    #[error("{channel} at {timestamp} is outside the full-range record set")]
    OutsideRange {
        channel: Channel,
        timestamp: NaiveDateTime,
    },

    #[error("{channel} at {timestamp} was observed twice")]
    Duplicate {
        channel: Channel,
        timestamp: NaiveDateTime,
    },

    #[error("statistics pass saw {observed} of {expected} planned records; it must cover the full range in one pass")]
    PartialPass { observed: usize, expected: usize },

    #[error("statistics marker I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("statistics marker {path} is malformed: {source}")]
    Malformed {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Streaming moments of one channel. Mergeable, so per-file accumulators can
/// be built in parallel and folded in plan order.
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelAccumulator {
    files: usize,
    pixels: u64,
    non_finite: u64,
    min: f64,
    max: f64,
    mean: f64,
    m2: f64,
}

impl Default for ChannelAccumulator {
    fn default() -> Self {
        Self {
            files: 0,
            pixels: 0,
            non_finite: 0,
            min: f64::INFINITY,
            max: f64::NEG_INFINITY,
            mean: 0.0,
            m2: 0.0,
        }
    }
}

impl ChannelAccumulator {
    /// Welford over the finite pixels of one frame.
    pub fn from_frame(frame: &Frame) -> Self {
        let mut acc = Self {
            files: 1,
            ..Self::default()
        };
        for &v in frame.iter() {
            if !v.is_finite() {
                acc.non_finite += 1;
                continue;
            }
            let x = f64::from(v);
            acc.pixels += 1;
            let delta = x - acc.mean;
            acc.mean += delta / acc.pixels as f64;
            acc.m2 += delta * (x - acc.mean);
            acc.min = acc.min.min(x);
            acc.max = acc.max.max(x);
        }
        acc
    }

    /// Chan et al. pairwise combination.
    pub fn merge(&mut self, other: &ChannelAccumulator) {
        self.files += other.files;
        self.non_finite += other.non_finite;
        if other.pixels == 0 {
            return;
        }
        if self.pixels == 0 {
            self.pixels = other.pixels;
            self.mean = other.mean;
            self.m2 = other.m2;
            self.min = other.min;
            self.max = other.max;
            return;
        }
        let na = self.pixels as f64;
        let nb = other.pixels as f64;
        let n = na + nb;
        let delta = other.mean - self.mean;
        self.mean += delta * nb / n;
        self.m2 += other.m2 + delta * delta * na * nb / n;
        self.pixels += other.pixels;
        self.min = self.min.min(other.min);
        self.max = self.max.max(other.max);
    }

    pub fn finalize(&self) -> ChannelStatistics {
        if self.pixels == 0 {
            return ChannelStatistics {
                files: self.files,
                non_finite: self.non_finite,
                ..ChannelStatistics::default()
            };
        }
        ChannelStatistics {
            files: self.files,
            pixels: self.pixels,
            non_finite: self.non_finite,
            min: self.min,
            max: self.max,
            mean: self.mean,
            variance: self.m2 / self.pixels as f64,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChannelStatistics {
    pub files: usize,
    pub pixels: u64,
    pub non_finite: u64,
    pub min: f64,
    pub max: f64,
    pub mean: f64,
    pub variance: f64,
}

impl ChannelStatistics {
    /// Upper clip of the square-root stretch.
    pub fn cutoff(&self) -> f64 {
        self.max.max(0.0)
    }

    pub fn std_dev(&self) -> f64 {
        self.variance.sqrt()
    }
}

/// How much of the planned input a channel's statistics actually saw.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelCoverage {
    pub expected: usize,
    pub decoded: usize,
    pub missing: usize,
    pub corrupt: usize,
}

impl ChannelCoverage {
    pub fn is_complete(&self) -> bool {
        self.decoded == self.expected
    }
}

/// Phase-1 view of one planned file.
#[derive(Debug, Clone, PartialEq)]
pub enum Observation {
    Missing,
    Corrupt(String),
    Decoded(ChannelAccumulator),
}

impl Observation {
    /// Decode the record's local file, if there is one.
    pub fn of_file(decoder: &dyn RawDecoder, record: &RawFileRecord) -> Self {
        if !record.local_path().is_file() {
            return Observation::Missing;
        }
        match decoder.decode(record.local_path(), record.channel) {
            Ok(frame) => Observation::Decoded(ChannelAccumulator::from_frame(&frame)),
            Err(e) => Observation::Corrupt(e.to_string()),
        }
    }
}

#[derive(Debug)]
pub struct StatsAccumulator {
    range: DateRange,
    cadence_minutes: u32,
    channels: ChannelSet,
    expected: HashSet<(Channel, NaiveDateTime)>,
    seen: HashSet<(Channel, NaiveDateTime)>,
    moments: BTreeMap<Channel, ChannelAccumulator>,
    coverage: BTreeMap<Channel, ChannelCoverage>,
}

impl StatsAccumulator {
    /// `records` must be the planner's full-range fast-cadence set.
    pub fn for_full_range(
        range: DateRange,
        cadence_minutes: u32,
        channels: ChannelSet,
        records: &[RawFileRecord],
    ) -> Self {
        let mut coverage: BTreeMap<Channel, ChannelCoverage> =
            channels.fast().map(|c| (c, ChannelCoverage::default())).collect();
        let mut expected = HashSet::with_capacity(records.len());
        for r in records.iter().filter(|r| r.channel.is_fast()) {
            if expected.insert((r.channel, r.timestamp)) {
                coverage.entry(r.channel).or_default().expected += 1;
            }
        }
        Self {
            range,
            cadence_minutes,
            moments: channels.fast().map(|c| (c, ChannelAccumulator::default())).collect(),
            channels,
            expected,
            seen: HashSet::new(),
            coverage,
        }
    }

    pub fn expected(&self) -> usize {
        self.expected.len()
    }

    pub fn observed(&self) -> usize {
        self.seen.len()
    }

    pub fn observe(&mut self, record: &RawFileRecord, observation: Observation) -> Result<(), StatsError> {
        let key = (record.channel, record.timestamp);
        if !self.expected.contains(&key) {
            return Err(StatsError::OutsideRange {
                channel: record.channel,
                timestamp: record.timestamp,
            });
        }
        if !self.seen.insert(key) {
            return Err(StatsError::Duplicate {
                channel: record.channel,
                timestamp: record.timestamp,
            });
        }
        let coverage = self.coverage.entry(record.channel).or_default();
        match observation {
            Observation::Missing => coverage.missing += 1,
            Observation::Corrupt(reason) => {
                coverage.corrupt += 1;
                warn!(file = %record.local_path().display(), %reason, "undecodable raw file skipped");
            }
            Observation::Decoded(acc) => {
                coverage.decoded += 1;
                self.moments.entry(record.channel).or_default().merge(&acc);
            }
        }
        Ok(())
    }

    /// Freeze the statistics. Fails unless every planned record was observed.
    pub fn finalize(self, input_fingerprint: String) -> Result<FrozenStatistics, StatsError> {
        if self.seen.len() != self.expected.len() {
            return Err(StatsError::PartialPass {
                observed: self.seen.len(),
                expected: self.expected.len(),
            });
        }
        let complete = self.coverage.values().all(ChannelCoverage::is_complete);
        if !complete {
            for (channel, cov) in self.coverage.iter().filter(|(_, c)| !c.is_complete()) {
                warn!(
                    %channel,
                    expected = cov.expected,
                    missing = cov.missing,
                    corrupt = cov.corrupt,
                    "normalization parameters computed on an incomplete set"
                );
            }
        }
        Ok(FrozenStatistics {
            range: self.range,
            cadence_minutes: self.cadence_minutes,
            channels: self.channels.fast().collect(),
            statistics: self
                .moments
                .iter()
                .map(|(c, acc)| (*c, acc.finalize()))
                .collect(),
            coverage: self.coverage,
            complete,
            input_fingerprint,
            config_fingerprint: None,
            computed_at: chrono::Utc::now().naive_utc(),
        })
    }
}

/// Immutable result of phase 1.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrozenStatistics {
    pub range: DateRange,
    pub cadence_minutes: u32,
    pub channels: Vec<Channel>,
    pub statistics: BTreeMap<Channel, ChannelStatistics>,
    pub coverage: BTreeMap<Channel, ChannelCoverage>,
    /// False when any channel's parameters came from an incomplete set.
    pub complete: bool,
    pub input_fingerprint: String,
    pub config_fingerprint: Option<String>,
    pub computed_at: NaiveDateTime,
}

impl FrozenStatistics {
    pub fn marker_path(raw_root: &Path) -> PathBuf {
        raw_root.join(STATS_DIR).join(MARKER_FILE)
    }

    pub fn get(&self, channel: Channel) -> Option<&ChannelStatistics> {
        self.statistics.get(&channel)
    }

    /// Atomically write the phase-completion marker.
    pub fn write_marker(&self, raw_root: &Path) -> Result<PathBuf, StatsError> {
        let path = Self::marker_path(raw_root);
        let io_err = |path: &Path, source| StatsError::Io {
            path: path.to_path_buf(),
            source,
        };
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir).map_err(|e| io_err(dir, e))?;
        }
        let json = serde_json::to_string_pretty(self).map_err(|source| StatsError::Malformed {
            path: path.clone(),
            source,
        })?;
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, json).map_err(|e| io_err(&tmp, e))?;
        fs::rename(&tmp, &path).map_err(|e| {
            let _ = fs::remove_file(&tmp);
            io_err(&path, e)
        })?;
        Ok(path)
    }

    /// `Ok(None)` when phase 1 has not completed.
    pub fn load_marker(raw_root: &Path) -> Result<Option<Self>, StatsError> {
        let path = Self::marker_path(raw_root);
        let text = match fs::read_to_string(&path) {
            Ok(t) => t,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(source) => return Err(StatsError::Io { path, source }),
        };
        serde_json::from_str(&text)
            .map(Some)
            .map_err(|source| StatsError::Malformed { path, source })
    }
}

/// BLAKE3 over (channel, timestamp, size) of every planned file on disk, in
/// plan order. Changes whenever files are added, removed or replaced.
pub fn input_fingerprint(records: &[RawFileRecord]) -> String {
    let mut hasher = blake3::Hasher::new();
    for r in records {
        if let Ok(meta) = fs::metadata(r.local_path()) {
            if meta.is_file() {
                hasher.update(r.channel.tag().as_bytes());
                hasher.update(&r.timestamp.and_utc().timestamp().to_le_bytes());
                hasher.update(&meta.len().to_le_bytes());
            }
        }
    }
    hasher.finalize().to_hex().to_string()
}

/// Sequential phase-1 pass: observe every record, then freeze.
pub fn compute_statistics(
    range: DateRange,
    cadence_minutes: u32,
    channels: ChannelSet,
    records: &[RawFileRecord],
    decoder: &dyn RawDecoder,
) -> Result<FrozenStatistics, StatsError> {
    let mut acc = StatsAccumulator::for_full_range(range, cadence_minutes, channels, records);
    for r in records {
        acc.observe(r, Observation::of_file(decoder, r))?;
    }
    acc.finalize(input_fingerprint(records))
}
