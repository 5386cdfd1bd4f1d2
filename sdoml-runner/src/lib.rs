//! SDOML-lite runner: configuration, phase orchestration, reports.
//!
//! This crate builds on `sdoml-core` to provide:
//! - TOML build configuration with defaults and a statistics fingerprint
//! - Fetch / statistics / package phases over a private worker pool
//! - Deterministic synthetic raw data
//! - JSON and CSV build reports
//! - Status, truncated-file and shard verification views

pub mod config;
pub mod inspect;
pub mod logging;
pub mod pipeline;
pub mod report;
pub mod synthetic;

pub use config::{BuildConfig, ConfigError};
pub use inspect::{status, verify, ShardCheck, StatusReport};
pub use pipeline::{run_build, run_fetch, run_package, run_statistics, BuildOutcome, FetchReport, PackageReport};
pub use report::BuildReport;
pub use synthetic::{synthesize, SyntheticOptions, SyntheticSummary, SyntheticTarget};

#[cfg(test)]
mod send_sync_checks {
    use super::*;

    fn assert_send<T: Send>() {}
    fn assert_sync<T: Sync>() {}

    #[test]
    fn reports_are_send_sync() {
        assert_send::<BuildReport>();
        assert_sync::<BuildReport>();
        assert_send::<BuildConfig>();
        assert_sync::<BuildConfig>();
    }
}
