//! Configuration module for the sync core.
//!
//! All configuration is loaded from environment variables with sensible defaults.

use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Application configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Path to SQLite database file
    pub db_path: PathBuf,
    /// Base URL of the backend API used by the HTTP gateway
    pub api_base_url: String,
    /// Bearer token handed over by the auth collaborator
    pub api_token: Option<String>,
    /// Tile URL template with `{z}`, `{x}`, `{y}` and `{layer}` placeholders
    pub tile_url_template: String,
    /// How long a downloaded tile stays fresh
    pub tile_ttl: Duration,
    /// Upper bound for the summed size of all cached tiles
    pub cache_budget_bytes: u64,
    /// Run cache maintenance after this many tile writes
    pub maintenance_every_writes: u64,
    /// Replay attempts per queue entry before it is parked
    pub max_retries: i64,
    /// Exhaust retries immediately when the backend reports a permanent error
    pub fast_fail_permanent: bool,
    /// Parallel tile fetches during an area download
    pub download_concurrency: usize,
    /// Largest number of tiles a single area download may cover
    pub max_area_tiles: u64,
    /// Timeout for gateway calls and tile fetches
    pub http_timeout: Duration,
    /// First delay before the worker retries a cycle that had failures
    pub sync_backoff_base: Duration,
    /// Cap for the worker retry delay
    pub sync_backoff_max: Duration,
    /// Log level (trace, debug, info, warn, error)
    pub log_level: String,
    /// Emit logs as JSON lines
    pub log_json: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("./data/field_sync.sqlite"),
            api_base_url: "http://127.0.0.1:8080/api".to_string(),
            api_token: None,
            tile_url_template: "https://tile.openstreetmap.org/{z}/{x}/{y}.png".to_string(),
            tile_ttl: Duration::from_secs(7 * 24 * 60 * 60),
            cache_budget_bytes: 100 * 1024 * 1024,
            maintenance_every_writes: 50,
            max_retries: 3,
            fast_fail_permanent: false,
            download_concurrency: 4,
            max_area_tiles: 50_000,
            http_timeout: Duration::from_secs(30),
            sync_backoff_base: Duration::from_secs(5),
            sync_backoff_max: Duration::from_secs(300),
            log_level: "info".to_string(),
            log_json: false,
        }
    }
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Self {
        dotenvy::dotenv().ok();

        let defaults = Self::default();

        let db_path = env::var("FIELDSYNC_DB_PATH")
            .map(PathBuf::from)
            .unwrap_or(defaults.db_path);

        let api_base_url = env::var("FIELDSYNC_API_BASE_URL").unwrap_or(defaults.api_base_url);
        let api_token = env::var("FIELDSYNC_API_TOKEN").ok();

        let tile_url_template =
            env::var("FIELDSYNC_TILE_URL_TEMPLATE").unwrap_or(defaults.tile_url_template);

        let tile_ttl = env_parse::<u64>("FIELDSYNC_TILE_TTL_SECS")
            .map(Duration::from_secs)
            .unwrap_or(defaults.tile_ttl);

        let cache_budget_bytes =
            env_parse("FIELDSYNC_CACHE_BUDGET_BYTES").unwrap_or(defaults.cache_budget_bytes);

        let maintenance_every_writes = env_parse("FIELDSYNC_MAINTENANCE_EVERY_WRITES")
            .unwrap_or(defaults.maintenance_every_writes)
            .max(1);

        let max_retries = env_parse("FIELDSYNC_MAX_RETRIES")
            .unwrap_or(defaults.max_retries)
            .max(1);

        let fast_fail_permanent =
            env_parse("FIELDSYNC_FAST_FAIL_PERMANENT").unwrap_or(defaults.fast_fail_permanent);

        let download_concurrency = env_parse("FIELDSYNC_DOWNLOAD_CONCURRENCY")
            .unwrap_or(defaults.download_concurrency)
            .max(1);
        let max_area_tiles = env_parse("FIELDSYNC_MAX_AREA_TILES")
            .unwrap_or(defaults.max_area_tiles)
            .max(1);

        let http_timeout = env_parse::<u64>("FIELDSYNC_HTTP_TIMEOUT_SECS")
            .map(Duration::from_secs)
            .unwrap_or(defaults.http_timeout);

        let sync_backoff_base = env_parse::<u64>("FIELDSYNC_SYNC_BACKOFF_BASE_SECS")
            .map(Duration::from_secs)
            .unwrap_or(defaults.sync_backoff_base);

        let sync_backoff_max = env_parse::<u64>("FIELDSYNC_SYNC_BACKOFF_MAX_SECS")
            .map(Duration::from_secs)
            .unwrap_or(defaults.sync_backoff_max);

        let log_level = env::var("FIELDSYNC_LOG_LEVEL").unwrap_or(defaults.log_level);
        let log_json = env_parse("FIELDSYNC_LOG_JSON").unwrap_or(defaults.log_json);

        Self {
            db_path,
            api_base_url,
            api_token,
            tile_url_template,
            tile_ttl,
            cache_budget_bytes,
            maintenance_every_writes,
            max_retries,
            fast_fail_permanent,
            download_concurrency,
            max_area_tiles,
            http_timeout,
            sync_backoff_base,
            sync_backoff_max,
            log_level,
            log_json,
        }
    }
}

/// Read and parse an environment variable, warning when the value is unusable.
fn env_parse<T: FromStr>(key: &str) -> Option<T> {
    let raw = env::var(key).ok()?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!("Ignoring invalid value {:?} for {}", raw, key);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEYS: &[&str] = &[
        "FIELDSYNC_DB_PATH",
        "FIELDSYNC_API_BASE_URL",
        "FIELDSYNC_API_TOKEN",
        "FIELDSYNC_TILE_URL_TEMPLATE",
        "FIELDSYNC_TILE_TTL_SECS",
        "FIELDSYNC_CACHE_BUDGET_BYTES",
        "FIELDSYNC_MAINTENANCE_EVERY_WRITES",
        "FIELDSYNC_MAX_RETRIES",
        "FIELDSYNC_FAST_FAIL_PERMANENT",
        "FIELDSYNC_DOWNLOAD_CONCURRENCY",
        "FIELDSYNC_MAX_AREA_TILES",
        "FIELDSYNC_HTTP_TIMEOUT_SECS",
        "FIELDSYNC_SYNC_BACKOFF_BASE_SECS",
        "FIELDSYNC_SYNC_BACKOFF_MAX_SECS",
        "FIELDSYNC_LOG_LEVEL",
        "FIELDSYNC_LOG_JSON",
    ];

    // Both scenarios live in one test because they mutate process-wide env vars.
    #[test]
    fn test_config_from_env() {
        for key in KEYS {
            env::remove_var(key);
        }

        let config = Config::from_env();

        assert!(config.api_token.is_none());
        assert_eq!(config.db_path, PathBuf::from("./data/field_sync.sqlite"));
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.cache_budget_bytes, 100 * 1024 * 1024);
        assert_eq!(config.tile_ttl, Duration::from_secs(604_800));
        assert!(!config.fast_fail_permanent);
        assert_eq!(config.log_level, "info");
        assert_eq!(config.max_area_tiles, 50_000);

        env::set_var("FIELDSYNC_MAX_RETRIES", "5");
        env::set_var("FIELDSYNC_CACHE_BUDGET_BYTES", "not-a-number");
        env::set_var("FIELDSYNC_FAST_FAIL_PERMANENT", "true");
        env::set_var("FIELDSYNC_DOWNLOAD_CONCURRENCY", "0");
        env::set_var("FIELDSYNC_MAX_AREA_TILES", "2000");

        let config = Config::from_env();

        assert_eq!(config.max_retries, 5);
        assert_eq!(config.cache_budget_bytes, 100 * 1024 * 1024);
        assert!(config.fast_fail_permanent);
        assert_eq!(config.download_concurrency, 1);
        assert_eq!(config.max_area_tiles, 2_000);

        for key in KEYS {
            env::remove_var(key);
        }
    }
}
