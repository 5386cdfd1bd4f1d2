//! Decode collaborator: raw file path + channel -> 2-D array.
//!
//! FITS and JPEG readers live outside this crate and plug in through
//! [`RawDecoder`]. [`NpyDecoder`] handles `.npy` raw files (mirrors that
//! pre-convert, synthetic data, tests).

use super::npy;
use crate::domain::{Channel, Frame, FrameShapeError};
use ndarray_npy::ReadNpyError;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("cannot read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed array: {0}")]
    Format(String),

    #[error(transparent)]
    Npy(#[from] ReadNpyError),

    #[error(transparent)]
    Shape(#[from] FrameShapeError),

    #[error("{channel} frame is {rows}x{cols}, expected {expected}x{expected}")]
    UnexpectedSize {
        channel: Channel,
        rows: usize,
        cols: usize,
        expected: usize,
    },
}

/// Anything that can turn a raw file into a frame at native resolution.
pub trait RawDecoder: Send + Sync {
    fn decode(&self, path: &Path, channel: Channel) -> Result<Frame, DecodeError>;
}

/// `.npy` decoder, optionally pinned to a square native size.
#[derive(Debug, Clone, Copy, Default)]
pub struct NpyDecoder {
    expected_size: Option<usize>,
}

impl NpyDecoder {
    pub fn new(expected_size: Option<usize>) -> Self {
        Self { expected_size }
    }
}

impl RawDecoder for NpyDecoder {
    fn decode(&self, path: &Path, channel: Channel) -> Result<Frame, DecodeError> {
        let bytes = std::fs::read(path).map_err(|source| DecodeError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let frame = npy::decode(&bytes)?;
        if let Some(expected) = self.expected_size {
            if frame.rows() != expected || frame.cols() != expected {
                return Err(DecodeError::UnexpectedSize {
                    channel,
                    rows: frame.rows(),
                    cols: frame.cols(),
                    expected,
                });
            }
        }
        Ok(frame)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};

    static TEST_COUNTER: AtomicU64 = AtomicU64::new(0);

    fn temp_file(name: &str) -> PathBuf {
        let id = TEST_COUNTER.fetch_add(1, Ordering::Relaxed);
        let dir = std::env::temp_dir().join(format!(
            "sdoml_decode_test_{}_{id}",
            std::process::id()
        ));
        std::fs::create_dir_all(&dir).unwrap();
        dir.join(name)
    }

    #[test]
    fn enforces_expected_size() {
        let path = temp_file("a.npy");
        std::fs::write(&path, npy::encode(&Frame::filled(4, 4, 2.0)).unwrap()).unwrap();

        let frame = NpyDecoder::new(Some(4)).decode(&path, Channel::Aia(171)).unwrap();
        assert_eq!(frame.rows(), 4);

        let err = NpyDecoder::new(Some(8))
            .decode(&path, Channel::Aia(171))
            .unwrap_err();
        assert!(matches!(err, DecodeError::UnexpectedSize { expected: 8, .. }));
        let _ = std::fs::remove_dir_all(path.parent().unwrap());
    }

    #[test]
    fn missing_file_is_io_error() {
        let path = temp_file("missing.npy");
        let err = NpyDecoder::default()
            .decode(&path, Channel::HmiMagnetogram)
            .unwrap_err();
        assert!(matches!(err, DecodeError::Io { .. }));
    }
}
