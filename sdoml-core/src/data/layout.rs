//! Raw file layout: where each (channel, timestamp) lives locally and upstream.
//!
//! Local: `{root}/YYYY/MM/DD/{file}`
//! - fast: `AIAYYYYMMDD_HHMM_WWWW.{ext}`
//! - slow: `YYYYMMDD_HHMM00_M_1k.{ext}`
//!
//! Upstream locators are relative to the instrument's archive root:
//! - fast: `YYYY/MM/DD/HHH00/{file}`
//! - slow: `YYYY/MM/DD/{file}`
//!
//! Paths are a pure function of (channel, timestamp), which is what makes
//! resume checks and multi-node directory merges work.

use crate::domain::{Channel, RawFileRecord};
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use std::io;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

pub const DEFAULT_FAST_EXT: &str = "fits";
pub const DEFAULT_SLOW_EXT: &str = "jpg";

/// Directory names under the raw root that hold bookkeeping, not raw files.
pub const RESERVED_PREFIX: char = '_';

/// Suffix of an in-flight transfer.
pub const PART_SUFFIX: &str = ".part";

/// Suffix of a transferred file the decoder rejected.
pub const QUARANTINE_SUFFIX: &str = ".corrupt";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawLayout {
    root: PathBuf,
    fast_ext: String,
    slow_ext: String,
}

/// A raw file found on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScannedFile {
    pub channel: Channel,
    pub timestamp: NaiveDateTime,
    pub path: PathBuf,
    pub bytes: u64,
}

impl RawLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            fast_ext: DEFAULT_FAST_EXT.to_string(),
            slow_ext: DEFAULT_SLOW_EXT.to_string(),
        }
    }

    pub fn with_extensions(mut self, fast_ext: &str, slow_ext: &str) -> Self {
        self.fast_ext = fast_ext.trim_start_matches('.').to_string();
        self.slow_ext = slow_ext.trim_start_matches('.').to_string();
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn file_name(&self, channel: Channel, t: NaiveDateTime) -> String {
        match channel {
            Channel::Aia(w) => format!("AIA{}_{w:04}.{}", t.format("%Y%m%d_%H%M"), self.fast_ext),
            Channel::HmiMagnetogram => {
                format!("{}00_M_1k.{}", t.format("%Y%m%d_%H%M"), self.slow_ext)
            }
        }
    }

    pub fn local_path(&self, channel: Channel, t: NaiveDateTime) -> PathBuf {
        self.root
            .join(t.format("%Y/%m/%d").to_string())
            .join(self.file_name(channel, t))
    }

    pub fn locator(&self, channel: Channel, t: NaiveDateTime) -> String {
        let name = self.file_name(channel, t);
        match channel {
            Channel::Aia(_) => format!("{}/{name}", t.format("%Y/%m/%d/H%H00")),
            Channel::HmiMagnetogram => format!("{}/{name}", t.format("%Y/%m/%d")),
        }
    }

    pub fn record(&self, channel: Channel, t: NaiveDateTime) -> RawFileRecord {
        RawFileRecord::pending(channel, t, self.locator(channel, t), self.local_path(channel, t))
    }

    /// Inverse of [`Self::file_name`]. Ignores the extension.
    pub fn parse_file_name(name: &str) -> Option<(Channel, NaiveDateTime)> {
        let stem = name.split('.').next()?;
        if let Some(rest) = stem.strip_prefix("AIA") {
            // YYYYMMDD_HHMM_WWWW
            let (stamp, wavelength) = rest.rsplit_once('_')?;
            let t = NaiveDateTime::parse_from_str(stamp, "%Y%m%d_%H%M").ok()?;
            let channel = Channel::aia(wavelength.parse().ok()?).ok()?;
            return Some((channel, t));
        }
        // YYYYMMDD_HHMMSS_M_1k
        let stamp = stem.strip_suffix("_M_1k")?;
        let t = NaiveDateTime::parse_from_str(stamp, "%Y%m%d_%H%M%S").ok()?;
        Some((Channel::HmiMagnetogram, t))
    }

    /// Every parseable raw file under the root, sorted by path.
    ///
    /// Bookkeeping directories (`_ledger`, `_stats`, ...), in-flight
    /// transfers and quarantined files are skipped.
    pub fn scan(&self) -> io::Result<Vec<ScannedFile>> {
        let mut out = Vec::new();
        if !self.root.is_dir() {
            return Ok(out);
        }
        let walker = WalkDir::new(&self.root)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|e| e.depth() == 0 || !is_bookkeeping(&e.file_name().to_string_lossy()));
        for entry in walker {
            let entry = entry?;
            if !entry.file_type().is_file() {
                continue;
            }
            let Some((channel, timestamp)) = entry.file_name().to_str().and_then(Self::parse_file_name)
            else {
                continue;
            };
            out.push(ScannedFile {
                channel,
                timestamp,
                bytes: entry.metadata()?.len(),
                path: entry.into_path(),
            });
        }
        Ok(out)
    }

    /// Raw files smaller than `min_bytes` (truncated or placeholder transfers).
    pub fn undersized(&self, min_bytes: u64) -> io::Result<Vec<ScannedFile>> {
        Ok(self
            .scan()?
            .into_iter()
            .filter(|f| f.bytes < min_bytes)
            .collect())
    }
}

fn is_bookkeeping(name: &str) -> bool {
    name.starts_with(RESERVED_PREFIX) || name.ends_with(PART_SUFFIX) || name.ends_with(QUARANTINE_SUFFIX)
}
