//! Phase 2: map decoded frames into [0,1] at the output resolution.
//!
//! Fast channels use the frozen phase-1 statistics (square-root stretch
//! clipped at the full-range maximum). The slow channel is already scaled to
//! [0,1] by its source and is only clamped. Each pixel is mapped at native
//! resolution, then the frame is block-mean downscaled by the integer factor
//! `native / resolution`.

use crate::domain::{Channel, ChannelSet, DateRange, Frame};
use crate::stats::FrozenStatistics;
use ndarray::Zip;
use std::collections::BTreeMap;
use std::path::PathBuf;
use thiserror::Error;

pub const NATIVE_RESOLUTION: usize = 1024;
pub const DEFAULT_RESOLUTION: usize = 512;

#[derive(Debug, Error)]
pub enum NormalizationError {
    #[error("phase 1 has not completed: no statistics marker at {0} (run `sdoml stats` over the full range first)")]
    PrematurePhase(PathBuf),

    #[error("no frozen statistics for {0}")]
    MissingStatistics(Channel),

    #[error("statistics marker is stale: {0}")]
    StaleStatistics(String),

    #[error("resolution {resolution} must be positive and divide the native size {native}")]
    InvalidResolution { resolution: usize, native: usize },

    #[error("{channel} frame is {rows}x{cols}, expected {native}x{native}")]
    ShapeMismatch {
        channel: Channel,
        rows: usize,
        cols: usize,
        native: usize,
    },
}

/// What the current build expects the phase-1 marker to describe.
#[derive(Debug, Clone)]
pub struct BuildIdentity<'a> {
    pub range: &'a DateRange,
    pub cadence_minutes: u32,
    pub channels: &'a ChannelSet,
    pub input_fingerprint: &'a str,
}

/// Refuse to enter phase 2 without a matching phase-1 marker.
pub fn check_statistics(
    marker: Option<FrozenStatistics>,
    marker_path: PathBuf,
    build: &BuildIdentity<'_>,
) -> Result<FrozenStatistics, NormalizationError> {
    let frozen = marker.ok_or(NormalizationError::PrematurePhase(marker_path))?;
    if frozen.range != *build.range {
        return Err(NormalizationError::StaleStatistics(format!(
            "computed for {}, building {}",
            frozen.range, build.range
        )));
    }
    if frozen.cadence_minutes != build.cadence_minutes {
        return Err(NormalizationError::StaleStatistics(format!(
            "computed at a {}-minute cadence, building at {}",
            frozen.cadence_minutes, build.cadence_minutes
        )));
    }
    let wanted: Vec<Channel> = build.channels.fast().collect();
    if frozen.channels != wanted {
        return Err(NormalizationError::StaleStatistics(format!(
            "computed for channels {:?}, building {:?}",
            frozen.channels, wanted
        )));
    }
    if frozen.input_fingerprint != build.input_fingerprint {
        return Err(NormalizationError::StaleStatistics(
            "raw files changed since statistics were computed".into(),
        ));
    }
    Ok(frozen)
}

#[derive(Debug)]
pub struct Normalizer<'a> {
    stats: Option<&'a FrozenStatistics>,
    native: usize,
    resolution: usize,
    /// sqrt(cutoff) per fast channel.
    roots: BTreeMap<Channel, f64>,
}

impl<'a> Normalizer<'a> {
    pub fn new(
        stats: Option<&'a FrozenStatistics>,
        native: usize,
        resolution: usize,
    ) -> Result<Self, NormalizationError> {
        if resolution == 0 || resolution > native || native % resolution != 0 {
            return Err(NormalizationError::InvalidResolution { resolution, native });
        }
        let roots = stats
            .map(|s| {
                s.statistics
                    .iter()
                    .map(|(c, st)| (*c, st.cutoff().sqrt()))
                    .collect()
            })
            .unwrap_or_default();
        Ok(Self {
            stats,
            native,
            resolution,
            roots,
        })
    }

    pub fn resolution(&self) -> usize {
        self.resolution
    }

    pub fn factor(&self) -> usize {
        self.native / self.resolution
    }

    pub fn normalize(&self, channel: Channel, frame: &Frame) -> Result<Frame, NormalizationError> {
        if frame.rows() != self.native || frame.cols() != self.native {
            return Err(NormalizationError::ShapeMismatch {
                channel,
                rows: frame.rows(),
                cols: frame.cols(),
                native: self.native,
            });
        }
        let mapped = if channel.is_fast() {
            if self.stats.is_none() {
                return Err(NormalizationError::PrematurePhase(PathBuf::new()));
            }
            let root = *self
                .roots
                .get(&channel)
                .ok_or(NormalizationError::MissingStatistics(channel))?;
            frame.map(|x| sqrt_stretch(x, root))
        } else {
            frame.map(clamp_unit)
        };
        Ok(downscale_mean(&mapped, self.factor()))
    }
}

/// `min(sqrt(max(x,0)), root) / root`, 0 for non-finite input or `root <= 0`.
pub fn sqrt_stretch(x: f32, root: f64) -> f32 {
    if !x.is_finite() || root.is_nan() || root <= 0.0 {
        return 0.0;
    }
    let v = f64::from(x).max(0.0).sqrt().min(root) / root;
    (v as f32).clamp(0.0, 1.0)
}

fn clamp_unit(x: f32) -> f32 {
    if x.is_finite() {
        x.clamp(0.0, 1.0)
    } else {
        0.0
    }
}

/// Mean over non-overlapping `factor` x `factor` blocks.
pub fn downscale_mean(frame: &Frame, factor: usize) -> Frame {
    if factor <= 1 || frame.rows() < factor || frame.cols() < factor {
        return frame.clone();
    }
    let area = (factor * factor) as f64;
    let pixels = Zip::from(frame.view().exact_chunks((factor, factor)))
        .map_collect(|block| (block.iter().map(|v| f64::from(*v)).sum::<f64>() / area) as f32);
    Frame::from_array(pixels).unwrap_or_else(|_| frame.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stats::{ChannelAccumulator, ChannelCoverage};
    use chrono::NaiveDateTime;
    use ndarray::{array, Array2};
    use proptest::prelude::*;

    fn frozen(max: f32) -> FrozenStatistics {
        let channels = ChannelSet::new(&[171]).unwrap();
        let acc = ChannelAccumulator::from_frame(&Frame::new(1, 2, vec![0.0, max]).unwrap());
        FrozenStatistics {
            range: DateRange::parse("2024-01-01", "2024-01-02").unwrap(),
            cadence_minutes: 15,
            channels: channels.fast().collect(),
            statistics: [(Channel::Aia(171), acc.finalize())].into_iter().collect(),
            coverage: [(Channel::Aia(171), ChannelCoverage::default())].into_iter().collect(),
            complete: true,
            input_fingerprint: "abc".into(),
            config_fingerprint: None,
            computed_at: NaiveDateTime::default(),
        }
    }

    #[test]
    fn stretch_matches_formula() {
        let root = 100.0f64.sqrt();
        assert_eq!(sqrt_stretch(25.0, root), 0.5);
        assert_eq!(sqrt_stretch(400.0, root), 1.0);
        assert_eq!(sqrt_stretch(-3.0, root), 0.0);
        assert_eq!(sqrt_stretch(f32::NAN, root), 0.0);
        assert_eq!(sqrt_stretch(5.0, 0.0), 0.0);
    }

    #[test]
    fn downscale_averages_blocks() {
        let f = Frame::new(2, 4, vec![1.0, 3.0, 0.0, 0.0, 1.0, 3.0, 4.0, 4.0]).unwrap();
        let d = downscale_mean(&f, 2);
        assert_eq!((d.rows(), d.cols()), (1, 2));
        assert_eq!(d.as_array(), &array![[2.0f32, 2.0]]);
    }

    #[test]
    fn fast_channel_needs_statistics() {
        let n = Normalizer::new(None, 4, 2).unwrap();
        assert!(matches!(
            n.normalize(Channel::Aia(171), &Frame::filled(4, 4, 1.0)),
            Err(NormalizationError::PrematurePhase(_))
        ));
        // The slow channel passes through without statistics.
        let slow = n
            .normalize(Channel::HmiMagnetogram, &Frame::filled(4, 4, 0.25))
            .unwrap();
        assert_eq!(slow.as_array(), &Array2::from_elem((2, 2), 0.25f32));

        let stats = frozen(100.0);
        let n = Normalizer::new(Some(&stats), 4, 4).unwrap();
        assert!(matches!(
            n.normalize(Channel::Aia(193), &Frame::filled(4, 4, 1.0)),
            Err(NormalizationError::MissingStatistics(Channel::Aia(193)))
        ));
    }

    #[test]
    fn rejects_bad_resolution_and_shape() {
        assert!(Normalizer::new(None, 1024, 0).is_err());
        assert!(Normalizer::new(None, 1024, 300).is_err());
        assert!(Normalizer::new(None, 1024, 2048).is_err());
        let n = Normalizer::new(None, 1024, 512).unwrap();
        assert!(matches!(
            n.normalize(Channel::HmiMagnetogram, &Frame::filled(4, 4, 0.0)),
            Err(NormalizationError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn phase_guard_detects_stale_markers() {
        let channels = ChannelSet::new(&[171]).unwrap();
        let range = DateRange::parse("2024-01-01", "2024-01-02").unwrap();
        let build = BuildIdentity {
            range: &range,
            cadence_minutes: 15,
            channels: &channels,
            input_fingerprint: "abc",
        };
        assert!(matches!(
            check_statistics(None, PathBuf::from("m"), &build),
            Err(NormalizationError::PrematurePhase(_))
        ));
        assert!(check_statistics(Some(frozen(1.0)), PathBuf::from("m"), &build).is_ok());

        let changed = BuildIdentity {
            input_fingerprint: "def",
            ..build.clone()
        };
        assert!(matches!(
            check_statistics(Some(frozen(1.0)), PathBuf::from("m"), &changed),
            Err(NormalizationError::StaleStatistics(_))
        ));

        let wider = ChannelSet::new(&[171, 193]).unwrap();
        let other_channels = BuildIdentity {
            channels: &wider,
            ..build
        };
        assert!(matches!(
            check_statistics(Some(frozen(1.0)), PathBuf::from("m"), &other_channels),
            Err(NormalizationError::StaleStatistics(_))
        ));
    }

    proptest! {
        #[test]
        fn output_stays_in_unit_interval(
            pixels in proptest::collection::vec(
                prop_oneof![
                    -1.0e6f32..1.0e6f32,
                    Just(f32::NAN),
                    Just(f32::INFINITY),
                    Just(f32::NEG_INFINITY),
                ],
                16,
            ),
            max in -10.0f32..1.0e5f32,
        ) {
            let stats = frozen(max);
            let n = Normalizer::new(Some(&stats), 4, 2).unwrap();
            let frame = Frame::new(4, 4, pixels).unwrap();
            for channel in [Channel::Aia(171), Channel::HmiMagnetogram] {
                let out = n.normalize(channel, &frame).unwrap();
                prop_assert_eq!(out.as_array().len(), 4);
                for v in out.iter() {
                    prop_assert!((0.0..=1.0).contains(v), "{} out of range", v);
                }
            }
        }
    }
}
