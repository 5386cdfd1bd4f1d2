//! Read-only views over a build directory: fetch status, truncated raw
//! files, and shard verification.

use crate::config::BuildConfig;
use anyhow::{Context, Result};
use chrono::NaiveDate;
use sdoml_core::data::{FetchLedger, LedgerSummary, ScannedFile};
use sdoml_core::package::{list_shards, Packager, ShardIndex};
use sdoml_core::stats::FrozenStatistics;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusReport {
    pub ledger: LedgerSummary,
    pub raw_files: usize,
    pub statistics_marker: Option<PathBuf>,
    pub statistics_complete: Option<bool>,
    pub shards: usize,
}

/// Summarize every node ledger plus what phase the build has reached.
pub fn status(config: &BuildConfig) -> Result<StatusReport> {
    let entries = FetchLedger::new(&config.raw_dir)
        .load_all()
        .context("failed to load fetch ledgers")?;
    let raw_files = config
        .layout()
        .scan()
        .with_context(|| format!("scan {}", config.raw_dir.display()))?
        .len();
    let marker = FrozenStatistics::load_marker(&config.raw_dir)?;
    let shards = if config.out_dir.is_dir() {
        list_shards(&config.out_dir)?.len()
    } else {
        0
    };
    Ok(StatusReport {
        ledger: LedgerSummary::from_entries(&entries),
        raw_files,
        statistics_marker: marker
            .as_ref()
            .map(|_| FrozenStatistics::marker_path(&config.raw_dir)),
        statistics_complete: marker.map(|m| m.complete),
        shards,
    })
}

/// Raw files smaller than `min_bytes`.
pub fn undersized(config: &BuildConfig, min_bytes: u64) -> Result<Vec<ScannedFile>> {
    config
        .layout()
        .undersized(min_bytes)
        .with_context(|| format!("scan {}", config.raw_dir.display()))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardCheck {
    pub path: PathBuf,
    /// Day of the range this shard's name belongs to, if any.
    pub day: Option<NaiveDate>,
    pub entries: usize,
    pub groups: usize,
    pub channel_counts: BTreeMap<String, usize>,
    pub duplicates: Vec<String>,
    /// Groups whose prefix does not belong to the shard's day.
    pub foreign: Vec<String>,
}

impl ShardCheck {
    pub fn is_ok(&self) -> bool {
        self.day.is_some() && self.duplicates.is_empty() && self.foreign.is_empty()
    }
}

/// Index every shard in `out_dir` the way a training-side reader would.
///
/// A shard's day comes from its position in the range, so a shard holding
/// only another day's groups is still caught.
pub fn verify(config: &BuildConfig) -> Result<Vec<ShardCheck>> {
    let range = config.range()?;
    let packager = Packager::new(&config.out_dir, &config.shard_prefix, range);
    let mut days = BTreeMap::new();
    for day in range.days() {
        let (_, path) = packager.shard_path(day)?;
        days.insert(path, day);
    }

    let mut checks = Vec::new();
    for path in list_shards(&config.out_dir)? {
        let index = ShardIndex::read(&path)?;
        let day = days.get(&path).copied();
        let day_prefix = day.map(|d| d.format("%Y/%m/%d/").to_string());
        checks.push(ShardCheck {
            day,
            entries: index.entries,
            groups: index.groups.len(),
            channel_counts: index.channel_counts(),
            foreign: index
                .prefixes()
                .filter(|p| !day_prefix.as_deref().is_some_and(|d| p.starts_with(d)))
                .map(str::to_string)
                .collect(),
            duplicates: index.duplicates,
            path,
        });
    }
    Ok(checks)
}

#[cfg(test)]
mod tests {
    use super::*;
    use sdoml_core::package::TarWriter;
    use std::fs::{self, File};
    use tempfile::TempDir;

    fn shard_with(path: &std::path::Path, names: &[&str]) {
        let mut w = TarWriter::new(File::create(path).unwrap());
        for name in names {
            w.append(name, b"x").unwrap();
        }
        w.finish().unwrap();
    }

    #[test]
    fn shard_holding_only_another_days_groups_is_flagged() {
        let tmp = TempDir::new().unwrap();
        let mut config = BuildConfig::for_range("2024-01-01T00:00", "2024-01-03T00:00");
        config.out_dir = tmp.path().to_path_buf();
        fs::create_dir_all(&config.out_dir).unwrap();

        shard_with(&config.out_dir.join("sdoml-lite-001.tar"), &["2024/01/02/0000.HMI_M.npy"]);
        shard_with(&config.out_dir.join("sdoml-lite-002.tar"), &["2024/01/02/0015.HMI_M.npy"]);
        shard_with(&config.out_dir.join("stray.tar"), &["2024/01/01/0000.HMI_M.npy"]);

        let checks = verify(&config).unwrap();
        assert_eq!(checks.len(), 3);
        let first = &checks[0];
        assert_eq!(first.day, NaiveDate::from_ymd_opt(2024, 1, 1));
        assert_eq!(first.foreign, vec!["2024/01/02/0000".to_string()]);
        assert!(!first.is_ok());
        assert!(checks[1].is_ok());
        assert_eq!(checks[2].day, None);
        assert!(!checks[2].is_ok());
    }
}
