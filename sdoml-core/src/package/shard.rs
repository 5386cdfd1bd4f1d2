//! Day shards: one tar archive per calendar day of the range.
//!
//! Shards are named `{prefix}-{index}.tar` where `index` is the 1-based
//! position of the day in the range, zero-padded to at least three digits.
//! Each present channel of a sample becomes one entry named
//! `YYYY/MM/DD/HHMM.<CHANNEL_TAG>.npy`; readers group entries by the text
//! before the first `.`. Incomplete samples keep their present channels.
//! A shard is written to `.tmp` and renamed into place when finished.

use super::tar::{read_archive, TarWriter};
use crate::data::npy;
use crate::domain::{Channel, DateRange, Frame, SampleKey};
use chrono::NaiveDate;
use ndarray_npy::WriteNpyError;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fs::{self, File};
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const DEFAULT_SHARD_PREFIX: &str = "sdoml-lite";
pub const ENTRY_EXT: &str = "npy";

#[derive(Debug, Error)]
pub enum ShardError {
    #[error("shard I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{0} is not a day of the build range")]
    DayOutsideRange(NaiveDate),

    #[error("sample {key} does not belong to the {day} shard")]
    ForeignSample { key: SampleKey, day: NaiveDate },

    #[error("sample prefix {0} written twice")]
    DuplicatePrefix(String),

    #[error("cannot encode {entry}: {source}")]
    Encode {
        entry: String,
        #[source]
        source: WriteNpyError,
    },
}

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> ShardError + '_ {
    move |source| ShardError::Io {
        path: path.to_path_buf(),
        source,
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardNaming {
    prefix: String,
    width: usize,
}

impl ShardNaming {
    pub fn new(prefix: &str, total_days: usize) -> Self {
        let digits = total_days.max(1).to_string().len();
        Self {
            prefix: prefix.to_string(),
            width: digits.max(3),
        }
    }

    pub fn file_name(&self, index: usize) -> String {
        format!("{}-{:0width$}.tar", self.prefix, index, width = self.width)
    }
}

pub fn entry_name(key: SampleKey, channel: Channel) -> String {
    format!("{}.{}.{ENTRY_EXT}", key.prefix(), channel.tag())
}

/// Grouping key of an entry: everything before the first `.`.
pub fn entry_prefix(name: &str) -> &str {
    name.split_once('.').map(|(p, _)| p).unwrap_or(name)
}

/// Channel tag of an entry: between the first and the last `.`.
pub fn entry_tag(name: &str) -> Option<&str> {
    let (_, rest) = name.split_once('.')?;
    Some(rest.rsplit_once('.').map(|(t, _)| t).unwrap_or(rest))
}

/// A sample with its normalized frames, ready to be packed.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedSample {
    pub key: SampleKey,
    pub frames: BTreeMap<Channel, Frame>,
    /// Whether every configured channel was present at alignment.
    pub complete: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardSummary {
    pub day: NaiveDate,
    pub index: usize,
    pub path: PathBuf,
    pub samples: usize,
    pub incomplete: usize,
    /// Samples with no present channel, hence no entries.
    pub empty: usize,
    pub entries: usize,
    pub bytes: u64,
}

#[derive(Debug, Clone)]
pub struct Packager {
    out_dir: PathBuf,
    naming: ShardNaming,
    range: DateRange,
}

impl Packager {
    pub fn new(out_dir: impl Into<PathBuf>, prefix: &str, range: DateRange) -> Self {
        Self {
            out_dir: out_dir.into(),
            naming: ShardNaming::new(prefix, range.days().len()),
            range,
        }
    }

    pub fn shard_path(&self, day: NaiveDate) -> Result<(usize, PathBuf), ShardError> {
        let index = self
            .range
            .day_index(day)
            .ok_or(ShardError::DayOutsideRange(day))?;
        Ok((index, self.out_dir.join(self.naming.file_name(index))))
    }

    pub fn begin_day(&self, day: NaiveDate) -> Result<ShardWriter, ShardError> {
        let (index, path) = self.shard_path(day)?;
        fs::create_dir_all(&self.out_dir).map_err(io_err(&self.out_dir))?;
        let tmp_path = path.with_extension("tar.tmp");
        let file = File::create(&tmp_path).map_err(io_err(&tmp_path))?;
        Ok(ShardWriter {
            tar: Some(TarWriter::new(BufWriter::new(file))),
            seen: HashSet::new(),
            tmp_path,
            summary: ShardSummary {
                day,
                index,
                path,
                samples: 0,
                incomplete: 0,
                empty: 0,
                entries: 0,
                bytes: 0,
            },
        })
    }

    /// Write a whole day at once.
    pub fn write_day(&self, day: NaiveDate, samples: &[ResolvedSample]) -> Result<ShardSummary, ShardError> {
        let mut writer = self.begin_day(day)?;
        for s in samples {
            writer.add_sample(s)?;
        }
        writer.finish()
    }
}

/// An open day shard. Dropping it unfinished removes the temporary file.
pub struct ShardWriter {
    tar: Option<TarWriter<BufWriter<File>>>,
    seen: HashSet<String>,
    tmp_path: PathBuf,
    summary: ShardSummary,
}

impl ShardWriter {
    pub fn day(&self) -> NaiveDate {
        self.summary.day
    }

    pub fn add_sample(&mut self, sample: &ResolvedSample) -> Result<(), ShardError> {
        let day = self.summary.day;
        if sample.key.day() != day {
            return Err(ShardError::ForeignSample {
                key: sample.key,
                day,
            });
        }
        let prefix = sample.key.prefix();
        if !self.seen.insert(prefix.clone()) {
            return Err(ShardError::DuplicatePrefix(prefix));
        }
        self.summary.samples += 1;
        if !sample.complete {
            self.summary.incomplete += 1;
        }
        if sample.frames.is_empty() {
            self.summary.empty += 1;
            return Ok(());
        }

        let Some(tar) = self.tar.as_mut() else {
            return Ok(());
        };
        for (channel, frame) in &sample.frames {
            let entry = entry_name(sample.key, *channel);
            let bytes = npy::encode(frame).map_err(|source| ShardError::Encode {
                entry: entry.clone(),
                source,
            })?;
            tar.append(&entry, &bytes).map_err(io_err(&self.tmp_path))?;
        }
        self.summary.entries = tar.entries();
        self.summary.bytes = tar.bytes();
        Ok(())
    }

    pub fn finish(mut self) -> Result<ShardSummary, ShardError> {
        if let Some(tar) = self.tar.take() {
            let buffered = tar.finish().map_err(io_err(&self.tmp_path))?;
            let file = buffered
                .into_inner()
                .map_err(|e| io_err(&self.tmp_path)(e.into_error()))?;
            file.sync_all().map_err(io_err(&self.tmp_path))?;
        }
        fs::rename(&self.tmp_path, &self.summary.path).map_err(io_err(&self.summary.path))?;
        Ok(self.summary.clone())
    }
}

impl Drop for ShardWriter {
    fn drop(&mut self) {
        if self.tar.is_some() {
            let _ = fs::remove_file(&self.tmp_path);
        }
    }
}

/// Reader-side view of a shard: entries grouped by sample prefix.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardIndex {
    pub entries: usize,
    /// Prefix -> channel tags, in archive order.
    pub groups: BTreeMap<String, Vec<String>>,
    /// Entry names that occur more than once.
    pub duplicates: Vec<String>,
}

impl ShardIndex {
    pub fn read(path: &Path) -> Result<Self, ShardError> {
        let file = File::open(path).map_err(io_err(path))?;
        let entries = read_archive(BufReader::new(file)).map_err(io_err(path))?;
        let mut index = ShardIndex {
            entries: entries.len(),
            ..Self::default()
        };
        let mut names = HashSet::new();
        for e in &entries {
            if !names.insert(e.name.as_str()) {
                index.duplicates.push(e.name.clone());
            }
            index
                .groups
                .entry(entry_prefix(&e.name).to_string())
                .or_default()
                .push(entry_tag(&e.name).unwrap_or_default().to_string());
        }
        Ok(index)
    }

    pub fn prefixes(&self) -> impl Iterator<Item = &str> {
        self.groups.keys().map(String::as_str)
    }

    /// Number of groups carrying each channel tag.
    pub fn channel_counts(&self) -> BTreeMap<String, usize> {
        let mut out = BTreeMap::new();
        for tags in self.groups.values() {
            for t in tags {
                *out.entry(t.clone()).or_insert(0) += 1;
            }
        }
        out
    }

    /// Entries packed per sample group.
    pub fn group_sizes(&self) -> BTreeMap<usize, usize> {
        let mut out = BTreeMap::new();
        for tags in self.groups.values() {
            *out.entry(tags.len()).or_insert(0) += 1;
        }
        out
    }
}

/// Every `*.tar` shard in a directory, sorted by name.
pub fn list_shards(dir: &Path) -> Result<Vec<PathBuf>, ShardError> {
    let mut out: Vec<PathBuf> = fs::read_dir(dir)
        .map_err(io_err(dir))?
        .filter_map(|e| e.ok().map(|e| e.path()))
        .filter(|p| p.extension().is_some_and(|x| x == "tar"))
        .collect();
    out.sort();
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDateTime;

    fn key(s: &str) -> SampleKey {
        SampleKey(NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M").unwrap())
    }

    #[test]
    fn shard_names_are_padded_to_the_day_count() {
        assert_eq!(ShardNaming::new("sdoml-lite", 2).file_name(1), "sdoml-lite-001.tar");
        assert_eq!(ShardNaming::new("sdoml-lite", 1200).file_name(7), "sdoml-lite-0007.tar");
    }

    #[test]
    fn entry_names_group_by_prefix() {
        let name = entry_name(key("2024-01-01T14:15"), Channel::Aia(131));
        assert_eq!(name, "2024/01/01/1415.AIA_0131.npy");
        assert_eq!(entry_prefix(&name), "2024/01/01/1415");
        assert_eq!(entry_tag(&name), Some("AIA_0131"));
    }
}
