//! Transport abstraction and fetch error taxonomy.
//!
//! A transport materializes one record's bytes at a destination path. It knows
//! nothing about resume checks, retries or record status: the [`Fetcher`]
//! sits above it.
//!
//! [`Fetcher`]: super::fetch::Fetcher

use super::decode::DecodeError;
use crate::domain::{Instrument, RawFileRecord};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const DEFAULT_FAST_ROOT: &str = "http://jsoc.stanford.edu/data/aia/synoptic/";
pub const DEFAULT_SLOW_ROOT: &str = "http://jsoc.stanford.edu/data/hmi/images/";

#[derive(Debug, Error)]
pub enum FetchError {
    /// Worth retrying: timeouts, resets, throttling, 5xx.
    #[error("transient failure fetching {locator}: {reason}")]
    Transient { locator: String, reason: String },

    /// Will not succeed on retry: missing upstream file, 4xx.
    #[error("terminal failure fetching {locator}: {reason}")]
    Terminal { locator: String, reason: String },

    #[error("{path} was transferred but is undecodable: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: DecodeError,
    },

    #[error("hard stop: upstream archive is refusing requests (circuit breaker tripped)")]
    CircuitBreakerTripped,

    #[error("local I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl FetchError {
    pub fn is_transient(&self) -> bool {
        matches!(self, FetchError::Transient { .. })
    }

    pub(crate) fn io(path: &Path, source: io::Error) -> Self {
        FetchError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Archive roots per instrument (URLs or directories).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchiveRoots {
    pub fast: String,
    pub slow: String,
}

impl ArchiveRoots {
    pub fn root_for(&self, instrument: Instrument) -> &str {
        match instrument {
            Instrument::Fast => &self.fast,
            Instrument::Slow => &self.slow,
        }
    }

    /// Join a record's locator onto its instrument root.
    pub fn resolve(&self, record: &RawFileRecord) -> String {
        let root = self.root_for(record.instrument()).trim_end_matches('/');
        format!("{root}/{}", record.locator)
    }
}

impl Default for ArchiveRoots {
    fn default() -> Self {
        Self {
            fast: DEFAULT_FAST_ROOT.to_string(),
            slow: DEFAULT_SLOW_ROOT.to_string(),
        }
    }
}

pub trait Transport: Send + Sync {
    fn name(&self) -> &str;

    /// Write the record's bytes to `dest`, returning the byte count.
    fn fetch(&self, record: &RawFileRecord, dest: &Path) -> Result<u64, FetchError>;

    /// False while the upstream is refusing requests.
    fn is_available(&self) -> bool;
}

/// Copies from a local directory tree laid out like the upstream archive.
#[derive(Debug, Clone)]
pub struct MirrorTransport {
    roots: ArchiveRoots,
}

impl MirrorTransport {
    pub fn new(roots: ArchiveRoots) -> Self {
        Self { roots }
    }

    /// Both instruments under one directory: `<root>/aia` and `<root>/hmi`.
    pub fn under(root: &Path) -> Self {
        Self::new(ArchiveRoots {
            fast: root.join("aia").to_string_lossy().to_string(),
            slow: root.join("hmi").to_string_lossy().to_string(),
        })
    }

    pub fn source_path(&self, record: &RawFileRecord) -> PathBuf {
        PathBuf::from(self.roots.resolve(record))
    }
}

impl Transport for MirrorTransport {
    fn name(&self) -> &str {
        "mirror"
    }

    fn fetch(&self, record: &RawFileRecord, dest: &Path) -> Result<u64, FetchError> {
        let src = self.source_path(record);
        fs::copy(&src, dest).map_err(|e| {
            let reason = format!("{}: {e}", src.display());
            match e.kind() {
                io::ErrorKind::NotFound => FetchError::Terminal {
                    locator: record.locator.clone(),
                    reason,
                },
                _ => FetchError::Transient {
                    locator: record.locator.clone(),
                    reason,
                },
            }
        })
    }

    fn is_available(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Channel;
    use chrono::NaiveDateTime;

    fn record(channel: Channel) -> RawFileRecord {
        RawFileRecord::pending(
            channel,
            NaiveDateTime::parse_from_str("2024-01-02T01:00", "%Y-%m-%dT%H:%M").unwrap(),
            "2024/01/02/H0100/AIA20240102_0100_0094.fits".into(),
            PathBuf::from("unused"),
        )
    }

    #[test]
    fn resolves_against_instrument_root() {
        let roots = ArchiveRoots::default();
        assert_eq!(
            roots.resolve(&record(Channel::Aia(94))),
            "http://jsoc.stanford.edu/data/aia/synoptic/2024/01/02/H0100/AIA20240102_0100_0094.fits"
        );
        assert!(roots
            .resolve(&record(Channel::HmiMagnetogram))
            .starts_with(DEFAULT_SLOW_ROOT));
    }

    #[test]
    fn missing_mirror_file_is_terminal() {
        let mirror = MirrorTransport::under(Path::new("/nonexistent/sdoml/mirror"));
        let err = mirror
            .fetch(&record(Channel::Aia(94)), Path::new("/nonexistent/out"))
            .unwrap_err();
        assert!(matches!(err, FetchError::Terminal { .. }));
        assert!(!err.is_transient());
    }
}
