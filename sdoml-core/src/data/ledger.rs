//! Per-node fetch ledger in Parquet.
//!
//! Each node writes the terminal status of every record it handled to
//! `{raw_root}/_ledger/node=NNN.parquet`. Ledgers travel with the raw
//! directory, so after node outputs are merged the whole build can be
//! summarized from one place.
//!
//! Writes are atomic: `.tmp` then rename.

use crate::domain::{Channel, FileStatus, RawFileRecord};
use chrono::DateTime;
use polars::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const LEDGER_DIR: &str = "_ledger";

const COLUMNS: [&str; 7] = [
    "node_index",
    "channel",
    "timestamp",
    "locator",
    "local_path",
    "status",
    "attempts",
];

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("ledger I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("parquet error in {path}: {reason}")]
    Parquet { path: PathBuf, reason: String },

    #[error("invalid ledger row {row} in {path}: {reason}")]
    InvalidRow {
        path: PathBuf,
        row: usize,
        reason: String,
    },
}

/// One ledger row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerEntry {
    pub node_index: usize,
    pub record: RawFileRecord,
}

/// Status counts for one channel.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusCounts {
    pub pending: usize,
    pub downloaded: usize,
    pub failed: usize,
    pub corrupt: usize,
}

impl StatusCounts {
    fn add(&mut self, status: FileStatus) {
        match status {
            FileStatus::Pending => self.pending += 1,
            FileStatus::Downloaded => self.downloaded += 1,
            FileStatus::Failed => self.failed += 1,
            FileStatus::Corrupt => self.corrupt += 1,
        }
    }

    pub fn total(&self) -> usize {
        self.pending + self.downloaded + self.failed + self.corrupt
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerSummary {
    pub nodes: Vec<usize>,
    pub channels: BTreeMap<Channel, StatusCounts>,
}

impl LedgerSummary {
    pub fn from_entries(entries: &[LedgerEntry]) -> Self {
        let mut summary = LedgerSummary::default();
        for e in entries {
            if !summary.nodes.contains(&e.node_index) {
                summary.nodes.push(e.node_index);
            }
            summary
                .channels
                .entry(e.record.channel)
                .or_default()
                .add(e.record.status());
        }
        summary.nodes.sort_unstable();
        summary
    }
}

pub struct FetchLedger {
    dir: PathBuf,
}

impl FetchLedger {
    pub fn new(raw_root: &Path) -> Self {
        Self {
            dir: raw_root.join(LEDGER_DIR),
        }
    }

    pub fn node_path(&self, node_index: usize) -> PathBuf {
        self.dir.join(format!("node={node_index:03}.parquet"))
    }

    /// Replace this node's ledger with `records`.
    pub fn write(&self, node_index: usize, records: &[RawFileRecord]) -> Result<PathBuf, LedgerError> {
        fs::create_dir_all(&self.dir).map_err(|source| LedgerError::Io {
            path: self.dir.clone(),
            source,
        })?;
        let path = self.node_path(node_index);
        let tmp_path = path.with_extension("parquet.tmp");

        let mut df = records_to_dataframe(node_index, records).map_err(|e| LedgerError::Parquet {
            path: path.clone(),
            reason: format!("dataframe creation: {e}"),
        })?;
        let file = fs::File::create(&tmp_path).map_err(|source| LedgerError::Io {
            path: tmp_path.clone(),
            source,
        })?;
        ParquetWriter::new(file)
            .finish(&mut df)
            .map_err(|e| LedgerError::Parquet {
                path: tmp_path.clone(),
                reason: format!("write: {e}"),
            })?;
        fs::rename(&tmp_path, &path).map_err(|source| {
            let _ = fs::remove_file(&tmp_path);
            LedgerError::Io {
                path: path.clone(),
                source,
            }
        })?;
        Ok(path)
    }

    pub fn load_node(&self, node_index: usize) -> Result<Vec<LedgerEntry>, LedgerError> {
        load_parquet(&self.node_path(node_index))
    }

    /// Every node ledger present, in node order.
    pub fn load_all(&self) -> Result<Vec<LedgerEntry>, LedgerError> {
        if !self.dir.is_dir() {
            return Ok(Vec::new());
        }
        let read = fs::read_dir(&self.dir).map_err(|source| LedgerError::Io {
            path: self.dir.clone(),
            source,
        })?;
        let mut paths: Vec<PathBuf> = read
            .filter_map(|e| e.ok().map(|e| e.path()))
            .filter(|p| {
                p.file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|n| n.starts_with("node=") && n.ends_with(".parquet"))
            })
            .collect();
        paths.sort();

        let mut entries = Vec::new();
        for path in paths {
            entries.extend(load_parquet(&path)?);
        }
        Ok(entries)
    }
}

// ── Parquet I/O helpers ─────────────────────────────────────────────

fn records_to_dataframe(node_index: usize, records: &[RawFileRecord]) -> PolarsResult<DataFrame> {
    let nodes: Vec<u32> = vec![node_index as u32; records.len()];
    let channels: Vec<String> = records.iter().map(|r| r.channel.tag()).collect();
    let timestamps: Vec<i64> = records
        .iter()
        .map(|r| r.timestamp.and_utc().timestamp())
        .collect();
    let locators: Vec<String> = records.iter().map(|r| r.locator.clone()).collect();
    let paths: Vec<String> = records
        .iter()
        .map(|r| r.local_path.to_string_lossy().to_string())
        .collect();
    let statuses: Vec<String> = records.iter().map(|r| r.status().to_string()).collect();
    let attempts: Vec<u32> = records.iter().map(|r| r.attempts()).collect();

    DataFrame::new(vec![
        Column::new("node_index".into(), nodes),
        Column::new("channel".into(), channels),
        Column::new("timestamp".into(), timestamps),
        Column::new("locator".into(), locators),
        Column::new("local_path".into(), paths),
        Column::new("status".into(), statuses),
        Column::new("attempts".into(), attempts),
    ])
}

fn load_parquet(path: &Path) -> Result<Vec<LedgerEntry>, LedgerError> {
    let parquet_err = |reason: String| LedgerError::Parquet {
        path: path.to_path_buf(),
        reason,
    };
    let file = fs::File::open(path).map_err(|source| LedgerError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let df = ParquetReader::new(file)
        .finish()
        .map_err(|e| parquet_err(format!("read: {e}")))?;
    for name in COLUMNS {
        if df.column(name).is_err() {
            return Err(parquet_err(format!("missing column '{name}'")));
        }
    }

    let col = |name: &str| df.column(name).map_err(|e| parquet_err(format!("column read: {e}")));
    let type_err = |name: &str, e: PolarsError| parquet_err(format!("{name} column type: {e}"));

    let node_col = col("node_index")?;
    let nodes = node_col.u32().map_err(|e| type_err("node_index", e))?;
    let channel_col = col("channel")?;
    let channels = channel_col.str().map_err(|e| type_err("channel", e))?;
    let ts_col = col("timestamp")?;
    let timestamps = ts_col.i64().map_err(|e| type_err("timestamp", e))?;
    let locator_col = col("locator")?;
    let locators = locator_col.str().map_err(|e| type_err("locator", e))?;
    let path_col = col("local_path")?;
    let paths = path_col.str().map_err(|e| type_err("local_path", e))?;
    let status_col = col("status")?;
    let statuses = status_col.str().map_err(|e| type_err("status", e))?;
    let attempt_col = col("attempts")?;
    let attempts = attempt_col.u32().map_err(|e| type_err("attempts", e))?;

    let mut out = Vec::with_capacity(df.height());
    for row in 0..df.height() {
        let invalid = |reason: &str| LedgerError::InvalidRow {
            path: path.to_path_buf(),
            row,
            reason: reason.to_string(),
        };
        let channel: Channel = channels
            .get(row)
            .ok_or_else(|| invalid("null channel"))?
            .parse()
            .map_err(|_| invalid("unknown channel"))?;
        let timestamp = timestamps
            .get(row)
            .and_then(|s| DateTime::from_timestamp(s, 0))
            .map(|d| d.naive_utc())
            .ok_or_else(|| invalid("bad timestamp"))?;
        let status = statuses
            .get(row)
            .and_then(FileStatus::parse)
            .ok_or_else(|| invalid("bad status"))?;

        out.push(LedgerEntry {
            node_index: nodes.get(row).unwrap_or(0) as usize,
            record: RawFileRecord::restored(
                channel,
                timestamp,
                locators.get(row).unwrap_or_default().to_string(),
                PathBuf::from(paths.get(row).unwrap_or_default()),
                status,
                attempts.get(row).unwrap_or(0),
            ),
        });
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::layout::RawLayout;
    use chrono::NaiveDateTime;
    use std::sync::atomic::{AtomicU64, Ordering};

    static TEST_COUNTER: AtomicU64 = AtomicU64::new(0);

    fn temp_dir() -> PathBuf {
        let id = TEST_COUNTER.fetch_add(1, Ordering::Relaxed);
        let dir = std::env::temp_dir().join(format!(
            "sdoml_ledger_test_{}_{id}",
            std::process::id()
        ));
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn records(layout: &RawLayout) -> Vec<RawFileRecord> {
        let t = NaiveDateTime::parse_from_str("2024-01-01T00:14", "%Y-%m-%dT%H:%M").unwrap();
        let mut ok = layout.record(Channel::Aia(171), t);
        ok.count_attempt();
        ok.transition(FileStatus::Downloaded);
        let mut bad = layout.record(Channel::HmiMagnetogram, t);
        bad.count_attempt();
        bad.count_attempt();
        bad.transition(FileStatus::Failed);
        vec![ok, bad]
    }

    #[test]
    fn node_ledgers_load_back_and_summarize() {
        let dir = temp_dir();
        let layout = RawLayout::new(&dir);
        let ledger = FetchLedger::new(&dir);
        let recs = records(&layout);

        let path = ledger.write(2, &recs).unwrap();
        assert!(path.ends_with("_ledger/node=002.parquet"));
        ledger.write(0, &recs[..1]).unwrap();

        let node2 = ledger.load_node(2).unwrap();
        assert_eq!(node2.len(), 2);
        assert_eq!(node2[0].record, recs[0]);
        assert_eq!(node2[1].record.attempts(), 2);

        let all = ledger.load_all().unwrap();
        let summary = LedgerSummary::from_entries(&all);
        assert_eq!(summary.nodes, vec![0, 2]);
        assert_eq!(summary.channels[&Channel::Aia(171)].downloaded, 2);
        assert_eq!(summary.channels[&Channel::HmiMagnetogram].failed, 1);
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn missing_ledger_dir_is_empty() {
        let ledger = FetchLedger::new(Path::new("/nonexistent/sdoml/raw"));
        assert!(ledger.load_all().unwrap().is_empty());
    }

    #[test]
    fn ledger_columns_match_the_documented_schema() {
        let dir = temp_dir();
        let path = FetchLedger::new(&dir)
            .write(1, &records(&RawLayout::new(&dir)))
            .unwrap();
        let df = ParquetReader::new(fs::File::open(&path).unwrap()).finish().unwrap();
        let names: Vec<String> = df.get_column_names().iter().map(|c| c.to_string()).collect();
        assert_eq!(names, COLUMNS.map(String::from).to_vec());
        assert_eq!(df.height(), 2);
        let _ = fs::remove_dir_all(&dir);
    }
}
