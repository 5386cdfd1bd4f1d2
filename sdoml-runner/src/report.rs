//! Build reports under `{out_dir}/_reports/`.
//!
//! - `build.json`: phase summaries, warnings, config fingerprint
//! - `alignment.csv`: one row per sample key with per-channel presence

use crate::config::BuildConfig;
use crate::pipeline::{FetchReport, PackageReport};
use anyhow::{bail, Context, Result};
use chrono::NaiveDateTime;
use sdoml_core::align::Alignment;
use sdoml_core::domain::Channel;
use sdoml_core::stats::FrozenStatistics;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

pub const SCHEMA_VERSION: u32 = 1;
pub const BUILD_REPORT: &str = "build.json";
pub const ALIGNMENT_REPORT: &str = "alignment.csv";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildReport {
    pub schema_version: u32,
    pub range: String,
    pub config_fingerprint: String,
    pub generated_at: NaiveDateTime,
    pub fetch: Option<FetchReport>,
    pub statistics: Option<FrozenStatistics>,
    pub package: Option<PackageReport>,
    pub warnings: Vec<String>,
}

impl BuildReport {
    pub fn new(config: &BuildConfig) -> Result<Self> {
        Ok(Self {
            schema_version: SCHEMA_VERSION,
            range: config.range()?.to_string(),
            config_fingerprint: config.fingerprint()?,
            generated_at: chrono::Utc::now().naive_utc(),
            fetch: None,
            statistics: None,
            package: None,
            warnings: Vec::new(),
        })
    }

    /// Derive operator-facing warnings from the phase results.
    pub fn collect_warnings(&mut self) {
        self.warnings.clear();
        if let Some(f) = &self.fetch {
            if f.total.failed + f.total.corrupt > 0 {
                self.warnings.push(format!(
                    "{} files failed and {} were corrupt on node {}",
                    f.total.failed, f.total.corrupt, f.node_index
                ));
            }
        }
        if let Some(s) = &self.statistics {
            if !s.complete {
                for (channel, cov) in s.coverage.iter().filter(|(_, c)| !c.is_complete()) {
                    self.warnings.push(format!(
                        "statistics for {channel} computed on {} of {} files",
                        cov.decoded, cov.expected
                    ));
                }
            }
        }
        if let Some(p) = &self.package {
            if p.incomplete > 0 {
                self.warnings.push(format!(
                    "{} of {} samples are incomplete",
                    p.incomplete, p.samples
                ));
            }
        }
    }

    pub fn write(&self, reports_dir: &Path) -> Result<PathBuf> {
        fs::create_dir_all(reports_dir)
            .with_context(|| format!("create {}", reports_dir.display()))?;
        let path = reports_dir.join(BUILD_REPORT);
        let json = serde_json::to_string_pretty(self).context("failed to serialize build report")?;
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, json).with_context(|| format!("write {}", tmp.display()))?;
        fs::rename(&tmp, &path).with_context(|| format!("rename to {}", path.display()))?;
        Ok(path)
    }

    /// Load a report, rejecting newer schema versions.
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
        let report: Self = serde_json::from_str(&text).context("failed to parse build report")?;
        if report.schema_version > SCHEMA_VERSION {
            bail!(
                "unsupported schema version {} (max supported: {})",
                report.schema_version,
                SCHEMA_VERSION
            );
        }
        Ok(report)
    }
}

// ── Alignment CSV ────────────────────────────────────────────────────

/// Columns: key, complete, then one 0/1 column per channel tag.
pub fn alignment_csv(alignment: &Alignment, channels: &[Channel]) -> Result<String> {
    let mut wtr = csv::Writer::from_writer(vec![]);

    let mut header = vec!["key".to_string(), "complete".to_string()];
    header.extend(channels.iter().map(Channel::tag));
    wtr.write_record(&header)?;

    for s in alignment.samples() {
        let mut row = vec![
            s.key.time().format("%Y-%m-%dT%H:%M").to_string(),
            u8::from(s.is_complete()).to_string(),
        ];
        row.extend(channels.iter().map(|c| {
            let present = s.slots.get(c).is_some_and(|slot| slot.file.is_some());
            u8::from(present).to_string()
        }));
        wtr.write_record(&row)?;
    }

    let bytes = wtr.into_inner().context("failed to flush CSV writer")?;
    String::from_utf8(bytes).context("CSV output is not valid UTF-8")
}

pub fn write_alignment_csv(reports_dir: &Path, alignment: &Alignment, channels: &[Channel]) -> Result<PathBuf> {
    fs::create_dir_all(reports_dir)
        .with_context(|| format!("create {}", reports_dir.display()))?;
    let path = reports_dir.join(ALIGNMENT_REPORT);
    fs::write(&path, alignment_csv(alignment, channels)?)
        .with_context(|| format!("write {}", path.display()))?;
    Ok(path)
}
