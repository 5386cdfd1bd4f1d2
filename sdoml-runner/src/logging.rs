use tracing_subscriber::EnvFilter;

/// Installs a `tracing_subscriber` formatter filtered by `SDOML_LOG`, then
/// `RUST_LOG`, then `info`.
///
/// Field conventions:
/// - `node_index` and `worker_index` on fetch events
/// - `channel` on anything per channel
/// - `shard` and `day` on packaging events
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter())
        .with_target(false)
        .try_init();
}

pub fn env_filter() -> EnvFilter {
    EnvFilter::try_from_env("SDOML_LOG")
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new("info"))
}
