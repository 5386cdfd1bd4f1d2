//! Deterministic synthetic raw data for demos and end-to-end tests.
//!
//! Writes one `.npy` frame per planned (channel, native timestamp) of the
//! configured range, either straight into the raw directory or into a mirror
//! tree that [`MirrorTransport`] can fetch from. Each frame is seeded from
//! BLAKE3 of (seed, channel, timestamp), so reruns produce identical bytes.
//!
//! Fast channels get a limb-brightened disk plus noise with occasional
//! negative pixels; the slow channel stays in [0,1] like the real
//! magnetogram previews.

use crate::config::BuildConfig;
use anyhow::{Context, Result};
use chrono::NaiveDateTime;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
use sdoml_core::data::{npy, MirrorTransport};
use sdoml_core::domain::{parse_timestamp, Channel, Frame, Instrument, RawFileRecord};
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;

/// Where the generated files go.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyntheticTarget {
    /// The configured raw directory, as if already fetched.
    RawDir,
    /// An archive-shaped tree (`<root>/aia/...`, `<root>/hmi/...`).
    Mirror(PathBuf),
}

#[derive(Debug, Clone, Default)]
pub struct SyntheticOptions {
    pub seed: u64,
    /// Edge length of generated frames; the config's native resolution if unset.
    pub size: Option<usize>,
    /// Files to leave out.
    pub omit: BTreeSet<(Channel, NaiveDateTime)>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyntheticSummary {
    pub written: usize,
    pub omitted: usize,
    pub bytes: u64,
}

/// Parse `TAG@TIMESTAMP`, e.g. `HMI_M@2024-01-01T01:00`.
pub fn parse_omission(s: &str) -> Result<(Channel, NaiveDateTime)> {
    let (tag, ts) = s
        .split_once('@')
        .with_context(|| format!("omission '{s}' must look like CHANNEL@TIMESTAMP"))?;
    let channel: Channel = tag.parse().with_context(|| format!("bad channel in '{s}'"))?;
    let t = parse_timestamp(ts).with_context(|| format!("bad timestamp in '{s}'"))?;
    Ok((channel, t))
}

fn frame_rng(seed: u64, channel: Channel, t: NaiveDateTime) -> StdRng {
    let mut hasher = blake3::Hasher::new();
    hasher.update(&seed.to_le_bytes());
    hasher.update(channel.tag().as_bytes());
    hasher.update(&t.and_utc().timestamp().to_le_bytes());
    StdRng::from_seed(*hasher.finalize().as_bytes())
}

/// One synthetic frame. Pure in its arguments.
pub fn synthetic_frame(seed: u64, channel: Channel, t: NaiveDateTime, size: usize) -> Frame {
    let mut rng = frame_rng(seed, channel, t);
    let centre = (size as f32 - 1.0) / 2.0;
    let radius = (size as f32 * 0.4).max(1.0);

    let data = match channel {
        Channel::HmiMagnetogram => (0..size * size)
            .map(|_| rng.gen_range(0.0f32..=1.0))
            .collect(),
        Channel::Aia(wavelength) => {
            let brightness = rng.gen_range(0.5f32..2.0) * f32::from(wavelength).sqrt() * 10.0;
            (0..size * size)
                .map(|i| {
                    let (r, c) = ((i / size) as f32, (i % size) as f32);
                    let d = ((r - centre).powi(2) + (c - centre).powi(2)).sqrt() / radius;
                    let disk = if d <= 1.0 { 1.0 + 0.5 * d * d } else { 0.05 };
                    disk * brightness + rng.gen_range(-2.0f32..8.0)
                })
                .collect()
        }
    };
    Frame::new(size, size, data).unwrap_or_else(|_| Frame::filled(size, size, 0.0))
}

fn destination(target: &SyntheticTarget, mirror: Option<&MirrorTransport>, record: &RawFileRecord) -> PathBuf {
    match (target, mirror) {
        (SyntheticTarget::Mirror(_), Some(m)) => m.source_path(record),
        _ => record.local_path().to_path_buf(),
    }
}

fn write_frame(path: &Path, frame: &Frame) -> Result<u64> {
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir).with_context(|| format!("create {}", dir.display()))?;
    }
    let bytes = npy::encode(frame).with_context(|| format!("encode {}", path.display()))?;
    fs::write(path, &bytes).with_context(|| format!("write {}", path.display()))?;
    Ok(bytes.len() as u64)
}

/// Generate every planned raw file of the configured range.
pub fn synthesize(
    config: &BuildConfig,
    options: &SyntheticOptions,
    target: &SyntheticTarget,
) -> Result<SyntheticSummary> {
    let planner = config.planner()?;
    let size = options.size.unwrap_or(config.native_resolution);
    let mirror = match target {
        SyntheticTarget::Mirror(root) => Some(MirrorTransport::under(root)),
        SyntheticTarget::RawDir => None,
    };

    let records: Vec<RawFileRecord> = [Instrument::Slow, Instrument::Fast]
        .into_iter()
        .flat_map(|i| planner.full_range_records(i))
        .collect();
    let (kept, omitted): (Vec<_>, Vec<_>) = records
        .into_iter()
        .partition(|r| !options.omit.contains(&(r.channel, r.timestamp)));

    let pool = crate::pipeline::worker_pool(config.max_workers)?;
    let sizes: Vec<u64> = pool.install(|| {
        kept.par_iter()
            .map(|r| {
                let frame = synthetic_frame(options.seed, r.channel, r.timestamp, size);
                write_frame(&destination(target, mirror.as_ref(), r), &frame)
            })
            .collect::<Result<Vec<u64>>>()
    })?;

    let summary = SyntheticSummary {
        written: sizes.len(),
        omitted: omitted.len(),
        bytes: sizes.iter().sum(),
    };
    info!(
        written = summary.written,
        omitted = summary.omitted,
        bytes = summary.bytes,
        size,
        "synthetic raw data written"
    );
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t(s: &str) -> NaiveDateTime {
        parse_timestamp(s).unwrap()
    }

    #[test]
    fn frames_are_deterministic_per_key() {
        let a = synthetic_frame(7, Channel::Aia(171), t("2024-01-01T00:14"), 8);
        let b = synthetic_frame(7, Channel::Aia(171), t("2024-01-01T00:14"), 8);
        let c = synthetic_frame(7, Channel::Aia(171), t("2024-01-01T00:30"), 8);
        let d = synthetic_frame(8, Channel::Aia(171), t("2024-01-01T00:14"), 8);
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_ne!(a, d);
    }

    #[test]
    fn slow_frames_stay_in_unit_interval() {
        let f = synthetic_frame(1, Channel::HmiMagnetogram, t("2024-01-01T00:15"), 16);
        assert!(f.iter().all(|v| (0.0..=1.0).contains(v)));
    }

    #[test]
    fn parses_omissions() {
        assert_eq!(
            parse_omission("HMI_M@2024-01-01T01:00").unwrap(),
            (Channel::HmiMagnetogram, t("2024-01-01T01:00"))
        );
        assert_eq!(
            parse_omission("AIA_0171@2024-01-01T05:14").unwrap().0,
            Channel::Aia(171)
        );
        assert!(parse_omission("HMI_M").is_err());
        assert!(parse_omission("XRT@2024-01-01T00:00").is_err());
    }
}
