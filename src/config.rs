//! Environment-driven configuration knobs (spec.md §6).
//!
//! Follows the teacher's GUC-table convention (one documented static per
//! knob) but expressed as a plain struct, since this crate is a library
//! rather than a Postgres extension and cannot register GUCs. Everything
//! here has a sane default so the engine runs unconfigured in dev.

use std::env;
use std::time::Duration;

/// Global bounded concurrency for heavy queries (`limit >= 5000 || includeTotal`).
const DEFAULT_HEAVY_QUERY_CONCURRENCY: usize = 8;
/// Per-actor bounded concurrency for all other queries.
const DEFAULT_USER_QUERY_CONCURRENCY: usize = 2;
/// Pagination ceiling; caller-supplied limits above this are clamped.
const DEFAULT_QUERY_MAX_LIMIT: u64 = 10_000;
/// Token-bucket refill rate, tokens/sec, per actor.
const DEFAULT_QUERY_RATE_PER_SEC: f64 = 10.0;
/// Token-bucket burst capacity, per actor.
const DEFAULT_QUERY_BURST: f64 = 20.0;
/// Result cache TTL.
const DEFAULT_RESULT_CACHE_TTL_SECS: u64 = 5;
/// Statement timeout for ordinary data queries.
const DEFAULT_DATA_QUERY_TIMEOUT_SECS: u64 = 120;
/// Statement timeout for `SELECT COUNT(*)` style queries.
const DEFAULT_COUNT_QUERY_TIMEOUT_SECS: u64 = 30;
/// A SyncLock older than this with no SyncState heartbeat is orphaned.
const DEFAULT_SYNC_LOCK_STALE_SECS: u64 = 30 * 60;

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub heavy_query_concurrency: usize,
    pub user_query_concurrency: usize,
    pub query_max_limit: u64,
    pub query_rate_per_sec: f64,
    pub query_burst: f64,
    pub result_cache_ttl: Duration,
    /// Optional shared cache back-end URL (e.g. a redis-compatible endpoint).
    /// When unset, the cache is process-local only.
    pub shared_cache_url: Option<String>,
    pub shared_cache_prefix: String,
    pub embedded_store_path: String,
    pub embedded_store_memory_limit_mb: Option<u64>,
    pub embedded_store_threads: Option<u32>,
    pub embedded_store_temp_dir: Option<String>,
    /// Whether sync destinations get a per-user-scoped table variant.
    pub user_scoped_tables: bool,
    pub data_query_timeout: Duration,
    pub count_query_timeout: Duration,
    pub sync_lock_stale_after: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            heavy_query_concurrency: DEFAULT_HEAVY_QUERY_CONCURRENCY,
            user_query_concurrency: DEFAULT_USER_QUERY_CONCURRENCY,
            query_max_limit: DEFAULT_QUERY_MAX_LIMIT,
            query_rate_per_sec: DEFAULT_QUERY_RATE_PER_SEC,
            query_burst: DEFAULT_QUERY_BURST,
            result_cache_ttl: Duration::from_secs(DEFAULT_RESULT_CACHE_TTL_SECS),
            shared_cache_url: None,
            shared_cache_prefix: "qh".to_string(),
            embedded_store_path: "./data/embedded.duckdb".to_string(),
            embedded_store_memory_limit_mb: None,
            embedded_store_threads: None,
            embedded_store_temp_dir: None,
            user_scoped_tables: false,
            data_query_timeout: Duration::from_secs(DEFAULT_DATA_QUERY_TIMEOUT_SECS),
            count_query_timeout: Duration::from_secs(DEFAULT_COUNT_QUERY_TIMEOUT_SECS),
            sync_lock_stale_after: Duration::from_secs(DEFAULT_SYNC_LOCK_STALE_SECS),
        }
    }
}

impl EngineConfig {
    /// Build configuration from environment variables, falling back to
    /// defaults for anything unset or unparseable.
    pub fn from_env() -> Self {
        let defaults = EngineConfig::default();
        EngineConfig {
            heavy_query_concurrency: env_usize(
                "HEAVY_QUERY_CONCURRENCY",
                defaults.heavy_query_concurrency,
            ),
            user_query_concurrency: env_usize(
                "USER_QUERY_CONCURRENCY",
                defaults.user_query_concurrency,
            ),
            query_max_limit: env_u64("QUERY_MAX_LIMIT", defaults.query_max_limit),
            query_rate_per_sec: env_f64("QUERY_RATE_PER_SEC", defaults.query_rate_per_sec),
            query_burst: env_f64("QUERY_BURST", defaults.query_burst),
            result_cache_ttl: Duration::from_secs(env_u64(
                "RESULT_CACHE_TTL",
                DEFAULT_RESULT_CACHE_TTL_SECS,
            )),
            shared_cache_url: env::var("SHARED_CACHE_URL").ok().filter(|s| !s.is_empty()),
            shared_cache_prefix: env::var("SHARED_CACHE_PREFIX")
                .unwrap_or(defaults.shared_cache_prefix),
            embedded_store_path: env::var("EMBEDDED_STORE_PATH")
                .unwrap_or(defaults.embedded_store_path),
            embedded_store_memory_limit_mb: env::var("EMBEDDED_STORE_MEMORY_LIMIT_MB")
                .ok()
                .and_then(|s| s.parse().ok()),
            embedded_store_threads: env::var("EMBEDDED_STORE_THREADS")
                .ok()
                .and_then(|s| s.parse().ok()),
            embedded_store_temp_dir: env::var("EMBEDDED_STORE_TEMP_DIR").ok(),
            user_scoped_tables: env::var("USER_SCOPED_TABLES")
                .map(|s| s == "1" || s.eq_ignore_ascii_case("true"))
                .unwrap_or(defaults.user_scoped_tables),
            data_query_timeout: Duration::from_secs(env_u64(
                "DATA_QUERY_TIMEOUT_SECS",
                DEFAULT_DATA_QUERY_TIMEOUT_SECS,
            )),
            count_query_timeout: Duration::from_secs(env_u64(
                "COUNT_QUERY_TIMEOUT_SECS",
                DEFAULT_COUNT_QUERY_TIMEOUT_SECS,
            )),
            sync_lock_stale_after: Duration::from_secs(env_u64(
                "SYNC_LOCK_STALE_AFTER_SECS",
                DEFAULT_SYNC_LOCK_STALE_SECS,
            )),
        }
    }
}

fn env_usize(key: &str, default: usize) -> usize {
    env::var(key).ok().and_then(|s| s.parse().ok()).unwrap_or(default)
}

fn env_u64(key: &str, default: u64) -> u64 {
    env::var(key).ok().and_then(|s| s.parse().ok()).unwrap_or(default)
}

fn env_f64(key: &str, default: f64) -> f64 {
    env::var(key).ok().and_then(|s| s.parse().ok()).unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let cfg = EngineConfig::default();
        assert_eq!(cfg.heavy_query_concurrency, 8);
        assert_eq!(cfg.query_max_limit, 10_000);
        assert!(cfg.shared_cache_url.is_none());
    }
}
