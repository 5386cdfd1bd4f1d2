//! Raw file records and the download chunks that group them.

use super::channel::{Channel, Instrument};
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileStatus {
    Pending,
    Downloaded,
    Failed,
    /// Transferred, but the decoder rejected it.
    Corrupt,
}

impl FileStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, FileStatus::Pending)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FileStatus::Pending => "pending",
            FileStatus::Downloaded => "downloaded",
            FileStatus::Failed => "failed",
            FileStatus::Corrupt => "corrupt",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(FileStatus::Pending),
            "downloaded" => Some(FileStatus::Downloaded),
            "failed" => Some(FileStatus::Failed),
            "corrupt" => Some(FileStatus::Corrupt),
            _ => None,
        }
    }
}

impl fmt::Display for FileStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One expected raw file: a (channel, native timestamp) pair.
///
/// Records are created pending by the planner. Only the fetcher moves them
/// forward, and a terminal status is never changed again.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawFileRecord {
    pub channel: Channel,
    pub timestamp: NaiveDateTime,
    /// Path relative to the instrument's archive root.
    pub locator: String,
    pub local_path: PathBuf,
    status: FileStatus,
    attempts: u32,
}

impl RawFileRecord {
    pub fn pending(
        channel: Channel,
        timestamp: NaiveDateTime,
        locator: String,
        local_path: PathBuf,
    ) -> Self {
        Self {
            channel,
            timestamp,
            locator,
            local_path,
            status: FileStatus::Pending,
            attempts: 0,
        }
    }

    pub(crate) fn restored(
        channel: Channel,
        timestamp: NaiveDateTime,
        locator: String,
        local_path: PathBuf,
        status: FileStatus,
        attempts: u32,
    ) -> Self {
        Self {
            channel,
            timestamp,
            locator,
            local_path,
            status,
            attempts,
        }
    }

    pub fn status(&self) -> FileStatus {
        self.status
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn instrument(&self) -> Instrument {
        self.channel.instrument()
    }

    pub fn local_path(&self) -> &Path {
        &self.local_path
    }

    /// Returns false (and leaves the record alone) if it is already terminal.
    pub(crate) fn transition(&mut self, to: FileStatus) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        self.status = to;
        true
    }

    pub(crate) fn count_attempt(&mut self) {
        self.attempts += 1;
    }
}

/// The records one worker of one node handles as a batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadChunk {
    pub node_index: usize,
    pub worker_index: usize,
    pub records: Vec<RawFileRecord>,
}

impl DownloadChunk {
    pub fn timestamps(&self) -> Vec<NaiveDateTime> {
        let mut ts: Vec<NaiveDateTime> = self.records.iter().map(|r| r.timestamp).collect();
        ts.dedup();
        ts
    }

    pub fn count(&self, status: FileStatus) -> usize {
        self.records.iter().filter(|r| r.status() == status).count()
    }
}
