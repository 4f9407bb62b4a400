//! Environment helpers: centralized dotenv loading and ergonomic getters.
//! Call `init_env()` once early in each binary (or rely on lazy Once).
use std::str::FromStr;
use std::sync::Once;

use tracing::debug;

use crate::database_ops::upsert::DEFAULT_LIMIT;

static INIT: Once = Once::new();

pub const DEFAULT_PROGRESS_INTERVAL: usize = 500;

/// Load .env exactly once. Safe to call many times.
pub fn init_env() {
    INIT.call_once(|| {
        if let Ok(path) = dotenv::dotenv() {
            debug!(target: "env", path = %path.display(), "loaded .env");
        }
    });
}

/// Get required env var; error if missing.
pub fn env_req(key: &str) -> anyhow::Result<String> {
    init_env();
    std::env::var(key).map_err(|_| anyhow::anyhow!("missing env var {key}"))
}

/// Get parsed value with default fallback.
pub fn env_parse<T>(key: &str, default: T) -> T
where
    T: FromStr,
{
    init_env();
    match std::env::var(key) {
        Ok(raw) => raw.trim().parse::<T>().unwrap_or(default),
        Err(_) => default,
    }
}

/// Rows per upsert statement when a mapping does not set one (`IMPORT_FLUSH_LIMIT`).
pub fn flush_limit() -> usize {
    match env_parse("IMPORT_FLUSH_LIMIT", DEFAULT_LIMIT) {
        0 => DEFAULT_LIMIT,
        n => n,
    }
}

/// Records between progress lines (`PROGRESS_INTERVAL`).
pub fn progress_interval() -> usize {
    env_parse("PROGRESS_INTERVAL", DEFAULT_PROGRESS_INTERVAL).max(1)
}
