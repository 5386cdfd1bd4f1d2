//! Chunk fetcher: resumable, retrying materialization of raw files.
//!
//! Each record runs through a bounded state machine:
//!
//! ```text
//! pending -> downloading -> downloaded
//!                        -> corrupt
//!                        -> retrying -> downloading
//!                        -> failed
//! ```
//!
//! A file already present at `local_path` is never transferred again, so a
//! rerun over a finished chunk performs zero transfers and node outputs can
//! be merged by copying directories together. Transfers land in a `.part`
//! file and are renamed into place only after validation.

use super::decode::RawDecoder;
use super::layout::{PART_SUFFIX, QUARANTINE_SUFFIX};
use super::transport::{FetchError, Transport};
use crate::domain::{DownloadChunk, FileStatus, RawFileRecord};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            max_delay,
        }
    }

    /// No waiting between attempts.
    pub fn immediate(max_attempts: u32) -> Self {
        Self::new(max_attempts, Duration::ZERO, Duration::ZERO)
    }

    /// Delay before attempt `attempt + 1`: `base * 2^(attempt-1)`, capped.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        self.base_delay
            .saturating_mul(1u32 << exp)
            .min(self.max_delay)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(5, Duration::from_millis(500), Duration::from_secs(8))
    }
}

/// What one transfer attempt produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptResult {
    Transferred,
    Undecodable,
    Transient,
    Terminal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchState {
    Pending,
    Downloading { attempt: u32 },
    Retrying { attempt: u32, delay: Duration },
    Downloaded,
    Failed,
    Corrupt,
}

impl FetchState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            FetchState::Downloaded | FetchState::Failed | FetchState::Corrupt
        )
    }

    /// State after attempt number `attempt` finished with `result`.
    pub fn after_attempt(attempt: u32, result: AttemptResult, policy: &RetryPolicy) -> Self {
        match result {
            AttemptResult::Transferred => FetchState::Downloaded,
            AttemptResult::Undecodable => FetchState::Corrupt,
            AttemptResult::Terminal => FetchState::Failed,
            AttemptResult::Transient if attempt >= policy.max_attempts => FetchState::Failed,
            AttemptResult::Transient => FetchState::Retrying {
                attempt,
                delay: policy.delay_for(attempt),
            },
        }
    }

    fn status(&self) -> Option<FileStatus> {
        match self {
            FetchState::Downloaded => Some(FileStatus::Downloaded),
            FetchState::Failed => Some(FileStatus::Failed),
            FetchState::Corrupt => Some(FileStatus::Corrupt),
            _ => None,
        }
    }
}

#[derive(Debug)]
pub enum FetchOutcome {
    /// Already terminal, or the file was already on disk. No transfer.
    Skipped,
    Downloaded { bytes: u64, attempts: u32 },
    Failed(FetchError),
    Corrupt(FetchError),
}

impl FetchOutcome {
    pub fn transferred(&self) -> bool {
        matches!(self, FetchOutcome::Downloaded { .. } | FetchOutcome::Corrupt(_))
    }
}

/// Per-record and per-chunk progress hooks.
pub trait FetchProgress: Send + Sync {
    fn on_record(&self, record: &RawFileRecord, outcome: &FetchOutcome);

    fn on_chunk_complete(&self, summary: &ChunkSummary);
}

/// Reports through `tracing`.
pub struct LogProgress;

impl FetchProgress for LogProgress {
    fn on_record(&self, record: &RawFileRecord, outcome: &FetchOutcome) {
        match outcome {
            FetchOutcome::Skipped => debug!(file = %record.locator, "already present"),
            FetchOutcome::Downloaded { bytes, attempts } => {
                debug!(file = %record.locator, bytes, attempts, "downloaded")
            }
            FetchOutcome::Failed(e) => warn!(file = %record.locator, error = %e, "fetch failed"),
            FetchOutcome::Corrupt(e) => {
                warn!(file = %record.locator, error = %e, "quarantined corrupt file")
            }
        }
    }

    fn on_chunk_complete(&self, s: &ChunkSummary) {
        info!(
            node_index = s.node_index,
            worker_index = s.worker_index,
            records = s.records,
            transferred = s.transferred,
            failed = s.failed,
            corrupt = s.corrupt,
            "chunk complete"
        );
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkSummary {
    pub node_index: usize,
    pub worker_index: usize,
    pub records: usize,
    pub transferred: usize,
    pub skipped: usize,
    pub downloaded: usize,
    pub failed: usize,
    pub corrupt: usize,
    pub errors: Vec<String>,
}

impl ChunkSummary {
    pub fn merge(&mut self, other: &ChunkSummary) {
        self.records += other.records;
        self.transferred += other.transferred;
        self.skipped += other.skipped;
        self.downloaded += other.downloaded;
        self.failed += other.failed;
        self.corrupt += other.corrupt;
        self.errors.extend(other.errors.iter().cloned());
    }
}

pub struct Fetcher {
    transport: Arc<dyn Transport>,
    validator: Option<Arc<dyn RawDecoder>>,
    retry: RetryPolicy,
    min_bytes: u64,
}

impl Fetcher {
    pub fn new(transport: Arc<dyn Transport>, retry: RetryPolicy) -> Self {
        Self {
            transport,
            validator: None,
            retry,
            min_bytes: 1,
        }
    }

    /// Decode every transfer before accepting it.
    pub fn with_validator(mut self, decoder: Arc<dyn RawDecoder>) -> Self {
        self.validator = Some(decoder);
        self
    }

    /// Transfers smaller than this are treated as corrupt.
    pub fn with_min_bytes(mut self, min_bytes: u64) -> Self {
        self.min_bytes = min_bytes;
        self
    }

    pub fn transport_name(&self) -> &str {
        self.transport.name()
    }

    /// Drive one record to a terminal status.
    pub fn fetch_record(&self, record: &mut RawFileRecord) -> FetchOutcome {
        if record.status().is_terminal() {
            return FetchOutcome::Skipped;
        }
        if self.is_present(record.local_path()) {
            record.transition(FileStatus::Downloaded);
            return FetchOutcome::Skipped;
        }

        let mut state = FetchState::Pending;
        let mut outcome = FetchOutcome::Skipped;
        while !state.is_terminal() {
            state = match state {
                FetchState::Pending => FetchState::Downloading { attempt: 1 },
                FetchState::Retrying { attempt, delay } => {
                    debug!(file = %record.locator, attempt, ?delay, "retrying");
                    std::thread::sleep(delay);
                    FetchState::Downloading {
                        attempt: attempt + 1,
                    }
                }
                FetchState::Downloading { attempt } => {
                    if !self.transport.is_available() {
                        outcome = FetchOutcome::Failed(FetchError::CircuitBreakerTripped);
                        FetchState::Failed
                    } else {
                        record.count_attempt();
                        let (result, o) = self.attempt(record, attempt);
                        outcome = o;
                        FetchState::after_attempt(attempt, result, &self.retry)
                    }
                }
                terminal => terminal,
            };
        }
        if let Some(status) = state.status() {
            record.transition(status);
        }
        outcome
    }

    /// Fetch every record of a chunk. Per-record failures never abort the chunk.
    pub fn fetch_chunk(&self, chunk: &mut DownloadChunk, progress: &dyn FetchProgress) -> ChunkSummary {
        let mut summary = ChunkSummary {
            node_index: chunk.node_index,
            worker_index: chunk.worker_index,
            records: chunk.records.len(),
            ..ChunkSummary::default()
        };
        for record in chunk.records.iter_mut() {
            let outcome = self.fetch_record(record);
            progress.on_record(record, &outcome);
            if outcome.transferred() {
                summary.transferred += 1;
            }
            match &outcome {
                FetchOutcome::Skipped => summary.skipped += 1,
                FetchOutcome::Downloaded { .. } => summary.downloaded += 1,
                FetchOutcome::Failed(e) => {
                    summary.failed += 1;
                    summary.errors.push(e.to_string());
                }
                FetchOutcome::Corrupt(e) => {
                    summary.corrupt += 1;
                    summary.errors.push(e.to_string());
                }
            }
        }
        progress.on_chunk_complete(&summary);
        summary
    }

    fn is_present(&self, path: &Path) -> bool {
        fs::metadata(path)
            .map(|m| m.is_file() && m.len() >= self.min_bytes)
            .unwrap_or(false)
    }

    /// One transfer into `<local_path>.part`, validated, then renamed into place.
    fn attempt(&self, record: &RawFileRecord, attempt: u32) -> (AttemptResult, FetchOutcome) {
        let dest = record.local_path();
        if let Some(parent) = dest.parent() {
            if let Err(e) = fs::create_dir_all(parent) {
                return (AttemptResult::Terminal, FetchOutcome::Failed(FetchError::io(parent, e)));
            }
        }
        let part = sibling(dest, PART_SUFFIX);

        let bytes = match self.transport.fetch(record, &part) {
            Ok(bytes) => bytes,
            Err(e) => {
                let _ = fs::remove_file(&part);
                let result = if e.is_transient() {
                    AttemptResult::Transient
                } else {
                    AttemptResult::Terminal
                };
                return (result, FetchOutcome::Failed(e));
            }
        };

        if let Some(err) = self.validate(record, &part, bytes) {
            let quarantine = sibling(dest, QUARANTINE_SUFFIX);
            if fs::rename(&part, &quarantine).is_err() {
                let _ = fs::remove_file(&part);
            }
            return (AttemptResult::Undecodable, FetchOutcome::Corrupt(err));
        }

        if let Err(e) = fs::rename(&part, dest) {
            let _ = fs::remove_file(&part);
            return (AttemptResult::Terminal, FetchOutcome::Failed(FetchError::io(dest, e)));
        }
        (AttemptResult::Transferred, FetchOutcome::Downloaded { bytes, attempts: attempt })
    }

    fn validate(&self, record: &RawFileRecord, part: &Path, bytes: u64) -> Option<FetchError> {
        if bytes < self.min_bytes {
            return Some(FetchError::Corrupt {
                path: record.local_path.clone(),
                source: super::decode::DecodeError::Format(format!(
                    "transfer of {bytes} bytes is below the {} byte minimum",
                    self.min_bytes
                )),
            });
        }
        let decoder = self.validator.as_ref()?;
        decoder
            .decode(part, record.channel)
            .err()
            .map(|source| FetchError::Corrupt {
                path: record.local_path.clone(),
                source,
            })
    }
}

fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(suffix);
    PathBuf::from(name)
}
