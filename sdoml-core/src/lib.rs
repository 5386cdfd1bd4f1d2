//! SDOML-lite core: everything between the raw archive and the day shards.
//!
//! - Domain types (channels, ranges, records, samples, frames)
//! - Chunk planning across nodes and workers
//! - Fetch coordination over pluggable transports, with a Parquet ledger
//! - Phase 1 statistics and the phase-completion marker
//! - Phase 2 normalization and resampling
//! - Alignment of the two instrument cadences
//! - Day-shard packaging

pub mod align;
pub mod data;
pub mod domain;
pub mod normalize;
pub mod package;
pub mod plan;
pub mod stats;

pub use align::{Aligner, Alignment, RawIndex};
pub use normalize::{NormalizationError, Normalizer};
pub use package::{Packager, ShardError};
pub use plan::{ChunkPlanner, NodePlan};
pub use stats::{FrozenStatistics, StatsAccumulator, StatsError};
