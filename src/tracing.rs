use tracing_subscriber::{fmt::SubscriberBuilder, EnvFilter};

/// Filter used by the binaries when `RUST_LOG` is unset: progress and summaries, no per-chunk
/// chatter.
pub const DEFAULT_FILTER: &str = "info,bulk_import=info,resolver=info,upsert=info";

/// Installs the global fmt subscriber. `RUST_LOG` wins over `default_filter`.
///
/// Targets are printed so `resolver`, `upsert`, `import`, `progress` and `db` lines can be
/// told apart and filtered (`RUST_LOG=upsert=debug`).
pub fn init_tracing(default_filter: &str) -> Result<(), anyhow::Error> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    SubscriberBuilder::default()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|e| anyhow::anyhow!("failed to initialize tracing: {}", e))
}
