//! Shard packaging.

pub mod shard;
pub mod tar;

pub use shard::{
    entry_name, entry_prefix, entry_tag, list_shards, Packager, ResolvedSample, ShardError,
    ShardIndex, ShardNaming, ShardSummary, ShardWriter, DEFAULT_SHARD_PREFIX,
};
pub use tar::{read_archive, TarEntry, TarWriter};
