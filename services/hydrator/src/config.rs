//! Configuration types and loading
//!
//! Config precedence: CLI args > env vars > config file > defaults.
//! Credentials live only in the TOML file and are held as `Secret`s from the
//! moment they are parsed.

use serde::Deserialize;
use std::fmt;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use twitter_auth::{AccountCredentials, DEFAULT_BASE_URL, MAX_PAGE_SIZE};

/// Environment override for the aggregation mode.
const AGGREGATION_ENV: &str = "HYDRATOR_AGGREGATION";

/// Root configuration
#[derive(Debug, Deserialize)]
pub struct Config {
    pub input_file: PathBuf,
    pub output_path: PathBuf,
    pub aggregation: Aggregation,
    /// File name of the compact output inside `output_path`.
    #[serde(default = "default_compact_file")]
    pub compact_file: String,
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub limits: LimitsConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub accounts: Vec<AccountCredentials>,
}

/// Output shape for successful fetches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Aggregation {
    /// Full profile per line in `users.ndjson`, one timeline file per entity.
    Complete,
    /// One reduced record per entity in a single file.
    Compact,
}

impl FromStr for Aggregation {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "complete" => Ok(Aggregation::Complete),
            "compact" => Ok(Aggregation::Compact),
            other => Err(format!(
                "unknown aggregation mode {other:?}, expected \"complete\" or \"compact\""
            )),
        }
    }
}

impl fmt::Display for Aggregation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Aggregation::Complete => "complete",
            Aggregation::Compact => "compact",
        })
    }
}

/// Remote API settings
#[derive(Debug, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_page_size")]
    pub page_size: u32,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            timeout_secs: default_timeout(),
            page_size: default_page_size(),
        }
    }
}

/// Retry and wait bounds
#[derive(Debug, Deserialize)]
pub struct LimitsConfig {
    #[serde(default = "default_max_rate_limit_retries")]
    pub max_rate_limit_retries: u32,
    #[serde(default = "default_max_quota_waits")]
    pub max_quota_waits: u32,
    #[serde(default = "default_reset_secs")]
    pub default_reset_secs: u64,
    /// Seconds between rate-limit syncs; 0 disables the periodic task.
    #[serde(default = "default_sync_interval")]
    pub sync_interval_secs: u64,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_rate_limit_retries: default_max_rate_limit_retries(),
            max_quota_waits: default_max_quota_waits(),
            default_reset_secs: default_reset_secs(),
            sync_interval_secs: default_sync_interval(),
        }
    }
}

impl LimitsConfig {
    pub fn default_reset(&self) -> Duration {
        Duration::from_secs(self.default_reset_secs)
    }

    pub fn sync_interval(&self) -> Option<Duration> {
        (self.sync_interval_secs > 0).then(|| Duration::from_secs(self.sync_interval_secs))
    }
}

/// Prometheus exporter settings
#[derive(Debug, Default, Deserialize)]
pub struct MetricsConfig {
    /// Scrape endpoint address; no exporter is installed when absent.
    #[serde(default)]
    pub listen_addr: Option<SocketAddr>,
}

fn default_compact_file() -> String {
    "hydrated.ndjson".into()
}

fn default_base_url() -> String {
    DEFAULT_BASE_URL.into()
}

fn default_timeout() -> u64 {
    30
}

fn default_page_size() -> u32 {
    MAX_PAGE_SIZE
}

fn default_max_rate_limit_retries() -> u32 {
    15
}

fn default_max_quota_waits() -> u32 {
    8
}

fn default_reset_secs() -> u64 {
    900
}

fn default_sync_interval() -> u64 {
    300
}

impl Config {
    /// Load configuration from a TOML file, then overlay environment variables.
    pub fn load(path: &Path) -> common::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let mut config: Config = toml::from_str(&contents)?;

        if let Ok(mode) = std::env::var(AGGREGATION_ENV) {
            config.aggregation = mode
                .parse()
                .map_err(|e| common::Error::Config(format!("{AGGREGATION_ENV}: {e}")))?;
        }

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> common::Result<()> {
        if !self.api.base_url.starts_with("http://") && !self.api.base_url.starts_with("https://")
        {
            return Err(common::Error::Config(format!(
                "base_url must start with http:// or https://, got: {}",
                self.api.base_url
            )));
        }

        if self.api.timeout_secs == 0 {
            return Err(common::Error::Config(
                "timeout_secs must be greater than 0".into(),
            ));
        }

        if self.api.page_size == 0 || self.api.page_size > MAX_PAGE_SIZE {
            return Err(common::Error::Config(format!(
                "page_size must be between 1 and {MAX_PAGE_SIZE}, got: {}",
                self.api.page_size
            )));
        }

        if self.compact_file.trim().is_empty()
            || self.compact_file.contains(['/', '\\'])
            || self.compact_file == "log.txt"
            || self.compact_file == "users.ndjson"
        {
            return Err(common::Error::Config(format!(
                "compact_file must be a plain file name distinct from the other outputs, got: {:?}",
                self.compact_file
            )));
        }

        if self.accounts.is_empty() {
            return Err(common::Error::Config(
                "at least one [[accounts]] entry is required".into(),
            ));
        }
        for (i, account) in self.accounts.iter().enumerate() {
            account
                .validate()
                .map_err(|e| common::Error::Config(format!("accounts[{i}]: {e}")))?;
        }

        Ok(())
    }

    /// Resolve config file path from CLI arg or CONFIG_PATH env var.
    pub fn resolve_path(cli_path: Option<&str>) -> PathBuf {
        if let Some(p) = cli_path {
            return PathBuf::from(p);
        }
        if let Ok(p) = std::env::var("CONFIG_PATH") {
            return PathBuf::from(p);
        }
        PathBuf::from("hydrator.toml")
    }
}
