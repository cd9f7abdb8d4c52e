use std::{env, path::PathBuf, time::Duration};

use serde::Deserialize;

// Top level configuration, every section falls back to its Default
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub upstream: UpstreamConfig,
    pub cache: CacheConfig,
    pub quota: QuotaConfig,
    pub search: SearchConfig,
    pub airports: AirportsConfig,
}

impl AppConfig {
    // Layers `config/default`, `config/{RUN_MODE}`, `config/local` and
    // `LAYOVER__*` environment variables. All files are optional.
    pub fn load() -> Result<Self, config::ConfigError> {
        let run_mode = env::var("RUN_MODE").unwrap_or_else(|_| "development".into());

        let s = config::Config::builder()
            .add_source(config::File::with_name("config/default").required(false))
            .add_source(config::File::with_name(&format!("config/{}", run_mode)).required(false))
            .add_source(config::File::with_name("config/local").required(false))
            .add_source(config::Environment::with_prefix("LAYOVER").separator("__"))
            .build()?;

        s.try_deserialize()
    }
}

// Flight search provider
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct UpstreamConfig {
    pub base_url: String,
    pub search_path: String,
    pub detail_path: String,
    pub api_key: Option<String>,
    pub api_host: Option<String>,
    pub timeout_ms: u64,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            base_url: "https://sky-scrapper.p.rapidapi.com/api/v1".to_string(),
            search_path: "/flights/search".to_string(),
            detail_path: "/flights/detail".to_string(),
            api_key: None,
            api_host: Some("sky-scrapper.p.rapidapi.com".to_string()),
            timeout_ms: 15_000,
        }
    }
}

impl UpstreamConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

// Response cache options
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub default_ttl_seconds: u64,
    pub search_ttl_seconds: u64,
    pub detail_ttl_seconds: u64,
    pub snapshot_path: Option<PathBuf>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            default_ttl_seconds: 60 * 60 * 24,
            search_ttl_seconds: 60 * 60 * 24,
            detail_ttl_seconds: 60 * 60 * 24 * 14,
            snapshot_path: None,
        }
    }
}

impl CacheConfig {
    pub fn default_ttl(&self) -> Duration {
        Duration::from_secs(self.default_ttl_seconds)
    }

    pub fn search_ttl(&self) -> Duration {
        Duration::from_secs(self.search_ttl_seconds)
    }

    pub fn detail_ttl(&self) -> Duration {
        Duration::from_secs(self.detail_ttl_seconds)
    }
}

// One bucket: at most `max_requests` admissions in any `window_ms` span
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct RateLimit {
    pub max_requests: u32,
    pub window_ms: u64,
}

impl RateLimit {
    pub const fn per_second(max_requests: u32) -> Self {
        Self {
            max_requests,
            window_ms: 1_000,
        }
    }

    pub const fn per_minute(max_requests: u32) -> Self {
        Self {
            max_requests,
            window_ms: 60_000,
        }
    }

    pub const fn per_days(max_requests: u32, days: u64) -> Self {
        Self {
            max_requests,
            window_ms: days * 24 * 60 * 60 * 1_000,
        }
    }

    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }
}

// Backoff used by the blocking admission mode
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub backoff_multiplier: f64,
    pub jitter_factor: f64,
    pub max_wait_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,
            initial_backoff_ms: 100,
            max_backoff_ms: 10_000,
            backoff_multiplier: 2.0,
            jitter_factor: 0.1,
            max_wait_ms: 30_000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct QuotaConfig {
    pub monthly: RateLimit,
    pub per_second: RateLimit,
    pub search_per_user: RateLimit,
    pub detail_per_user: RateLimit,
    pub upload_per_user: RateLimit,
    pub retry: RetryConfig,
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            monthly: RateLimit::per_days(10_000, 30),
            per_second: RateLimit::per_second(5),
            search_per_user: RateLimit::per_minute(10),
            detail_per_user: RateLimit::per_minute(50),
            upload_per_user: RateLimit::per_minute(5),
            retry: RetryConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SearchConfig {
    pub page_size: usize,
    pub default_wait_ms: u32,
    pub max_wait_ms: u32,
    pub detail_concurrency: usize,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            page_size: 5,
            default_wait_ms: 500,
            max_wait_ms: 5_000,
            detail_concurrency: 5,
        }
    }
}

// Where the bulk airport file comes from
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AirportsConfig {
    pub path: Option<PathBuf>,
    pub url: String,
}

impl Default for AirportsConfig {
    fn default() -> Self {
        Self {
            path: None,
            url: "https://gist.githubusercontent.com/tdreyno/4278655/raw/7b0762c09b519f40397e4c3e100b097d861f5588/airports.json".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = AppConfig::default();
        assert_eq!(config.search.page_size, 5);
        assert_eq!(config.search.max_wait_ms, 5_000);
        assert_eq!(config.quota.per_second.window(), Duration::from_secs(1));
        assert_eq!(config.quota.upload_per_user, RateLimit::per_minute(5));
        assert!(config.cache.detail_ttl() > config.cache.search_ttl());
    }

    #[test]
    fn test_partial_sections_fill_from_default() {
        let raw = r#"{
            "search": { "page_size": 10 },
            "quota": { "per_second": { "max_requests": 2, "window_ms": 1000 } }
        }"#;
        let config: AppConfig = serde_json::from_str(raw).unwrap();
        assert_eq!(config.search.page_size, 10);
        assert_eq!(config.search.default_wait_ms, 500);
        assert_eq!(config.quota.per_second.max_requests, 2);
        assert_eq!(config.quota.monthly, RateLimit::per_days(10_000, 30));
    }
}
