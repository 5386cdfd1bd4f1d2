//! Phase ordering: statistics over the full merged set, then normalization.

use sdoml_core::data::{npy, NpyDecoder, RawLayout};
use sdoml_core::domain::{Channel, ChannelSet, DateRange, Frame, Instrument, SampleClock};
use sdoml_core::normalize::{check_statistics, BuildIdentity, NormalizationError, Normalizer};
use sdoml_core::stats::{compute_statistics, input_fingerprint, FrozenStatistics, StatsError};
use sdoml_core::ChunkPlanner;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

static TEST_COUNTER: AtomicU64 = AtomicU64::new(0);

fn temp_dir() -> PathBuf {
    let id = TEST_COUNTER.fetch_add(1, Ordering::Relaxed);
    let dir = std::env::temp_dir().join(format!(
        "sdoml_two_phase_test_{}_{id}",
        std::process::id()
    ));
    let _ = fs::remove_dir_all(&dir);
    fs::create_dir_all(&dir).unwrap();
    dir
}

const SIZE: usize = 4;

fn planner(root: &Path, start: &str, end: &str) -> ChunkPlanner {
    ChunkPlanner::new(
        DateRange::parse(start, end).unwrap(),
        SampleClock::default(),
        ChannelSet::new(&[171]).unwrap(),
        RawLayout::new(root).with_extensions("npy", "npy"),
        1,
        8,
    )
    .unwrap()
}

/// Fast files whose brightness grows with the hour, so later hours
/// dominate the full-range maximum.
fn write_raw(planner: &ChunkPlanner) {
    for r in planner.full_range_records(Instrument::Fast) {
        let value = 10.0 * (1 + chrono::Timelike::hour(&r.timestamp)) as f32;
        fs::create_dir_all(r.local_path().parent().unwrap()).unwrap();
        fs::write(r.local_path(), npy::encode(&Frame::filled(SIZE, SIZE, value)).unwrap()).unwrap();
    }
}

fn stats_for(planner: &ChunkPlanner) -> Result<FrozenStatistics, StatsError> {
    compute_statistics(
        *planner.range(),
        15,
        ChannelSet::new(&[171]).unwrap(),
        &planner.full_range_records(Instrument::Fast),
        &NpyDecoder::new(Some(SIZE)),
    )
}

#[test]
fn statistics_are_deterministic_over_the_same_set() {
    let dir = temp_dir();
    let full = planner(&dir, "2024-01-01T00:00", "2024-01-01T04:00");
    write_raw(&full);

    let a = stats_for(&full).unwrap();
    let b = stats_for(&full).unwrap();
    assert_eq!(a.statistics, b.statistics);
    assert_eq!(a.input_fingerprint, b.input_fingerprint);
    assert!(a.complete);
    assert_eq!(a.get(Channel::Aia(171)).unwrap().max, 40.0);
    let _ = fs::remove_dir_all(&dir);
}

#[test]
fn subset_statistics_differ_from_full_range() {
    let dir = temp_dir();
    let full = planner(&dir, "2024-01-01T00:00", "2024-01-01T04:00");
    write_raw(&full);
    let subset = planner(&dir, "2024-01-01T00:00", "2024-01-01T02:00");

    let whole = stats_for(&full).unwrap();
    let part = stats_for(&subset).unwrap();
    assert_ne!(whole.statistics, part.statistics);
    assert_ne!(whole.range, part.range);

    // Statistics for the subset cannot be used to normalize the full build.
    let channels = ChannelSet::new(&[171]).unwrap();
    let fp = input_fingerprint(&full.full_range_records(Instrument::Fast));
    let build = BuildIdentity {
        range: full.range(),
        cadence_minutes: 15,
        channels: &channels,
        input_fingerprint: &fp,
    };
    assert!(matches!(
        check_statistics(Some(part), PathBuf::from("m"), &build),
        Err(NormalizationError::StaleStatistics(_))
    ));
    assert!(check_statistics(Some(whole), PathBuf::from("m"), &build).is_ok());
    let _ = fs::remove_dir_all(&dir);
}

#[test]
fn marker_round_trip_and_change_detection() {
    let dir = temp_dir();
    let full = planner(&dir, "2024-01-01T00:00", "2024-01-01T02:00");
    write_raw(&full);
    let records = full.full_range_records(Instrument::Fast);

    assert!(FrozenStatistics::load_marker(&dir).unwrap().is_none());
    let frozen = stats_for(&full).unwrap();
    let path = frozen.write_marker(&dir).unwrap();
    assert!(path.ends_with("_stats/statistics.json"));
    let loaded = FrozenStatistics::load_marker(&dir).unwrap().unwrap();
    assert_eq!(loaded, frozen);

    // Removing a raw file after phase 1 makes the marker stale.
    fs::remove_file(records[0].local_path()).unwrap();
    let channels = ChannelSet::new(&[171]).unwrap();
    let fp = input_fingerprint(&records);
    let build = BuildIdentity {
        range: full.range(),
        cadence_minutes: 15,
        channels: &channels,
        input_fingerprint: &fp,
    };
    assert!(matches!(
        check_statistics(Some(loaded), path, &build),
        Err(NormalizationError::StaleStatistics(_))
    ));
    let _ = fs::remove_dir_all(&dir);
}

#[test]
fn normalized_frames_use_full_range_cutoff() {
    let dir = temp_dir();
    let full = planner(&dir, "2024-01-01T00:00", "2024-01-01T04:00");
    write_raw(&full);
    let frozen = stats_for(&full).unwrap();

    let normalizer = Normalizer::new(Some(&frozen), SIZE, SIZE / 2).unwrap();
    let out = normalizer
        .normalize(Channel::Aia(171), &Frame::filled(SIZE, SIZE, 10.0))
        .unwrap();
    assert_eq!((out.rows(), out.cols()), (2, 2));
    let expected = (10.0f64.sqrt() / 40.0f64.sqrt()) as f32;
    assert!(out.iter().all(|v| (v - expected).abs() < 1e-6));
    let _ = fs::remove_dir_all(&dir);
}
