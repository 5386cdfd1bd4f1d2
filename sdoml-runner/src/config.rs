//! Build configuration, loaded from TOML.
//!
//! Every field except the range has a default, so the smallest useful file is
//!
//! ```toml
//! date_start = "2024-01-01T00:00"
//! date_end = "2024-01-03T00:00"
//! ```

use chrono::NaiveDateTime;
use sdoml_core::data::{ArchiveRoots, RawLayout, RetryPolicy};
use sdoml_core::domain::{parse_timestamp, ChannelSet, DateRange, SampleClock, DEFAULT_AIA_WAVELENGTHS, DEFAULT_CADENCE_MINUTES};
use sdoml_core::normalize::{DEFAULT_RESOLUTION, NATIVE_RESOLUTION};
use sdoml_core::package::DEFAULT_SHARD_PREFIX;
use sdoml_core::plan::ChunkPlanner;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

/// Where raw files come from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteConfig {
    #[serde(default = "default_fast_root")]
    pub fast_root: String,
    #[serde(default = "default_slow_root")]
    pub slow_root: String,
    /// Copy from a local directory laid out like the archive instead of HTTP.
    #[serde(default)]
    pub mirror_dir: Option<PathBuf>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        let roots = ArchiveRoots::default();
        Self {
            fast_root: roots.fast,
            slow_root: roots.slow,
            mirror_dir: None,
            timeout_secs: default_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildConfig {
    /// Inclusive start, ISO-8601 at minute precision.
    pub date_start: String,
    /// Exclusive end.
    pub date_end: String,

    #[serde(default = "default_one")]
    pub total_nodes: usize,
    #[serde(default)]
    pub node_index: usize,
    #[serde(default = "default_one")]
    pub max_workers: usize,
    #[serde(default = "default_one")]
    pub worker_chunk_size: usize,

    /// Output edge length in pixels.
    #[serde(default = "default_resolution")]
    pub resolution: usize,
    /// Edge length of decoded raw frames.
    #[serde(default = "default_native_resolution")]
    pub native_resolution: usize,
    #[serde(default = "default_cadence")]
    pub cadence_minutes: u32,
    #[serde(default = "default_wavelengths")]
    pub wavelengths: Vec<u16>,

    #[serde(default = "default_raw_dir")]
    pub raw_dir: PathBuf,
    #[serde(default = "default_out_dir")]
    pub out_dir: PathBuf,
    #[serde(default = "default_shard_prefix")]
    pub shard_prefix: String,
    #[serde(default = "default_fast_ext")]
    pub fast_ext: String,
    #[serde(default = "default_slow_ext")]
    pub slow_ext: String,
    #[serde(default = "default_min_file_bytes")]
    pub min_file_bytes: u64,
    /// Decode every transfer before accepting it.
    #[serde(default)]
    pub validate_transfers: bool,

    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub remote: RemoteConfig,
}

fn default_one() -> usize {
    1
}
fn default_resolution() -> usize {
    DEFAULT_RESOLUTION
}
fn default_native_resolution() -> usize {
    NATIVE_RESOLUTION
}
fn default_cadence() -> u32 {
    DEFAULT_CADENCE_MINUTES
}
fn default_wavelengths() -> Vec<u16> {
    DEFAULT_AIA_WAVELENGTHS.to_vec()
}
fn default_raw_dir() -> PathBuf {
    PathBuf::from("data/raw")
}
fn default_out_dir() -> PathBuf {
    PathBuf::from("data/shards")
}
fn default_shard_prefix() -> String {
    DEFAULT_SHARD_PREFIX.to_string()
}
fn default_fast_ext() -> String {
    sdoml_core::data::layout::DEFAULT_FAST_EXT.to_string()
}
fn default_slow_ext() -> String {
    sdoml_core::data::layout::DEFAULT_SLOW_EXT.to_string()
}
fn default_min_file_bytes() -> u64 {
    1
}
fn default_max_attempts() -> u32 {
    5
}
fn default_base_delay_ms() -> u64 {
    500
}
fn default_max_delay_ms() -> u64 {
    8_000
}
fn default_fast_root() -> String {
    ArchiveRoots::default().fast
}
fn default_slow_root() -> String {
    ArchiveRoots::default().slow
}
fn default_timeout_secs() -> u64 {
    5
}

/// The fields that change phase-1 statistics. Hashed into the marker.
#[derive(Serialize)]
struct StatisticsIdentity<'a> {
    start: NaiveDateTime,
    end: NaiveDateTime,
    cadence_minutes: u32,
    wavelengths: Vec<u16>,
    native_resolution: usize,
    fast_ext: &'a str,
}

impl BuildConfig {
    /// A config for `[start, end)` with every other field at its default.
    pub fn for_range(start: &str, end: &str) -> Self {
        Self {
            date_start: start.to_string(),
            date_end: end.to_string(),
            total_nodes: 1,
            node_index: 0,
            max_workers: 1,
            worker_chunk_size: 1,
            resolution: default_resolution(),
            native_resolution: default_native_resolution(),
            cadence_minutes: default_cadence(),
            wavelengths: default_wavelengths(),
            raw_dir: default_raw_dir(),
            out_dir: default_out_dir(),
            shard_prefix: default_shard_prefix(),
            fast_ext: default_fast_ext(),
            slow_ext: default_slow_ext(),
            min_file_bytes: default_min_file_bytes(),
            validate_transfers: false,
            retry: RetryConfig::default(),
            remote: RemoteConfig::default(),
        }
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&content)
    }

    /// Parse and validate.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::Invalid(e.to_string()))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| Err(ConfigError::Invalid(msg));
        self.range()?;
        self.clock()?;
        self.channels()?;
        if self.total_nodes == 0 {
            return invalid("total_nodes must be at least 1".into());
        }
        if self.node_index >= self.total_nodes {
            return invalid(format!(
                "node_index {} must be below total_nodes {}",
                self.node_index, self.total_nodes
            ));
        }
        if self.max_workers == 0 {
            return invalid("max_workers must be at least 1".into());
        }
        if self.worker_chunk_size == 0 {
            return invalid("worker_chunk_size must be at least 1".into());
        }
        if self.native_resolution == 0 || self.native_resolution > NATIVE_RESOLUTION {
            return invalid(format!(
                "native_resolution must be in 1..={NATIVE_RESOLUTION}, got {}",
                self.native_resolution
            ));
        }
        if self.resolution == 0
            || self.resolution > self.native_resolution
            || self.native_resolution % self.resolution != 0
        {
            return invalid(format!(
                "resolution {} must divide the native resolution {}",
                self.resolution, self.native_resolution
            ));
        }
        if self.retry.max_attempts == 0 {
            return invalid("retry.max_attempts must be at least 1".into());
        }
        if self.shard_prefix.is_empty() || self.shard_prefix.contains('/') {
            return invalid(format!("bad shard_prefix '{}'", self.shard_prefix));
        }
        Ok(())
    }

    pub fn range(&self) -> Result<DateRange, ConfigError> {
        let start = parse_timestamp(&self.date_start).map_err(|e| ConfigError::Invalid(e.to_string()))?;
        let end = parse_timestamp(&self.date_end).map_err(|e| ConfigError::Invalid(e.to_string()))?;
        DateRange::new(start, end).map_err(|e| ConfigError::Invalid(e.to_string()))
    }

    pub fn clock(&self) -> Result<SampleClock, ConfigError> {
        SampleClock::new(self.cadence_minutes).map_err(|e| ConfigError::Invalid(e.to_string()))
    }

    pub fn channels(&self) -> Result<ChannelSet, ConfigError> {
        ChannelSet::new(&self.wavelengths).map_err(|e| ConfigError::Invalid(e.to_string()))
    }

    pub fn layout(&self) -> RawLayout {
        RawLayout::new(&self.raw_dir).with_extensions(&self.fast_ext, &self.slow_ext)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.retry.max_attempts,
            Duration::from_millis(self.retry.base_delay_ms),
            Duration::from_millis(self.retry.max_delay_ms),
        )
    }

    pub fn archive_roots(&self) -> ArchiveRoots {
        ArchiveRoots {
            fast: self.remote.fast_root.clone(),
            slow: self.remote.slow_root.clone(),
        }
    }

    pub fn planner(&self) -> Result<ChunkPlanner, ConfigError> {
        ChunkPlanner::new(
            self.range()?,
            self.clock()?,
            self.channels()?,
            self.layout(),
            self.total_nodes,
            self.worker_chunk_size,
        )
        .map_err(|e| ConfigError::Invalid(e.to_string()))
    }

    pub fn reports_dir(&self) -> PathBuf {
        self.out_dir.join("_reports")
    }

    /// BLAKE3 of the canonical JSON of the statistics-relevant fields.
    ///
    /// Node topology, worker counts and output settings do not change the
    /// statistics and are left out.
    pub fn fingerprint(&self) -> Result<String, ConfigError> {
        let range = self.range()?;
        let mut wavelengths = self.wavelengths.clone();
        wavelengths.sort_unstable();
        wavelengths.dedup();
        let identity = StatisticsIdentity {
            start: range.start(),
            end: range.end(),
            cadence_minutes: self.cadence_minutes,
            wavelengths,
            native_resolution: self.native_resolution,
            fast_ext: &self.fast_ext,
        };
        let json = serde_json::to_string(&identity).map_err(|e| ConfigError::Invalid(e.to_string()))?;
        Ok(blake3::hash(json.as_bytes()).to_hex().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_toml_takes_defaults() {
        let config = BuildConfig::from_toml(
            r#"
            date_start = "2024-01-01T00:00"
            date_end = "2024-01-03T00:00"
            "#,
        )
        .unwrap();
        assert_eq!(config, BuildConfig::for_range("2024-01-01T00:00", "2024-01-03T00:00"));
        assert_eq!(config.resolution, 512);
        assert_eq!(config.cadence_minutes, 15);
        assert_eq!(config.wavelengths, vec![131, 171, 193, 211, 1600]);
        assert_eq!(config.retry.max_attempts, 5);
        assert_eq!(config.range().unwrap().days().len(), 2);
    }

    #[test]
    fn nested_tables_override_defaults() {
        let config = BuildConfig::from_toml(
            r#"
            date_start = "2024-01-01"
            date_end = "2024-01-02"
            total_nodes = 4
            node_index = 3
            wavelengths = [94, 171]
            resolution = 256

            [retry]
            max_attempts = 2

            [remote]
            mirror_dir = "/mnt/mirror"
            "#,
        )
        .unwrap();
        assert_eq!(config.retry.max_attempts, 2);
        assert_eq!(config.retry.base_delay_ms, 500);
        assert_eq!(config.remote.mirror_dir, Some(PathBuf::from("/mnt/mirror")));
        assert_eq!(config.channels().unwrap().len(), 3);
    }

    #[test]
    fn validation_rejects_bad_values() {
        let base = BuildConfig::for_range("2024-01-01", "2024-01-02");
        let cases: Vec<(&str, BuildConfig)> = vec![
            ("reversed range", BuildConfig { date_end: "2023-12-31".into(), ..base.clone() }),
            ("node index", BuildConfig { node_index: 1, ..base.clone() }),
            ("zero workers", BuildConfig { max_workers: 0, ..base.clone() }),
            ("resolution", BuildConfig { resolution: 300, ..base.clone() }),
            ("too large", BuildConfig { resolution: 2048, ..base.clone() }),
            ("cadence", BuildConfig { cadence_minutes: 10, ..base.clone() }),
            ("wavelength", BuildConfig { wavelengths: vec![195], ..base.clone() }),
            ("no wavelengths", BuildConfig { wavelengths: vec![], ..base.clone() }),
        ];
        for (name, config) in cases {
            assert!(config.validate().is_err(), "{name} should be rejected");
        }
        assert!(base.validate().is_ok());
    }

    #[test]
    fn fingerprint_tracks_statistics_fields_only() {
        let a = BuildConfig::for_range("2024-01-01", "2024-01-02");
        let moved = BuildConfig {
            out_dir: "elsewhere".into(),
            max_workers: 8,
            resolution: 256,
            ..a.clone()
        };
        assert_eq!(a.fingerprint().unwrap(), moved.fingerprint().unwrap());

        let reordered = BuildConfig {
            wavelengths: vec![1600, 211, 193, 171, 131],
            ..a.clone()
        };
        assert_eq!(a.fingerprint().unwrap(), reordered.fingerprint().unwrap());

        let longer = BuildConfig {
            date_end: "2024-01-03".into(),
            ..a.clone()
        };
        assert_ne!(a.fingerprint().unwrap(), longer.fingerprint().unwrap());
    }

    #[test]
    fn toml_round_trip() {
        let config = BuildConfig::for_range("2024-01-01T00:00", "2024-01-02T00:00");
        let text = config.to_toml().unwrap();
        assert_eq!(BuildConfig::from_toml(&text).unwrap(), config);
    }
}
