//! Application configuration for hackcrawl.
//!
//! User config lives at `~/.hackcrawl/hackcrawl.toml`.
//! CLI flags override config file values, which override defaults.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::{HackCrawlError, Result};

/// Default configuration file name.
const CONFIG_FILE_NAME: &str = "hackcrawl.toml";

/// Default config directory name under the user's home.
const CONFIG_DIR_NAME: &str = ".hackcrawl";

/// Default database file name inside the config directory.
const DB_FILE_NAME: &str = "hackcrawl.db";

// ---------------------------------------------------------------------------
// Config structs (matching hackcrawl.toml schema)
// ---------------------------------------------------------------------------

/// Top-level application config, deserialized from TOML.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Where records are persisted.
    #[serde(default)]
    pub storage: StorageConfig,

    /// Upstream source endpoints.
    #[serde(default)]
    pub source: SourceConfig,

    /// Traversal and concurrency policy.
    #[serde(default)]
    pub crawl: CrawlPoliciesConfig,

    /// Retry and timeout policy for source calls.
    #[serde(default)]
    pub retry: RetryConfig,
}

/// `[storage]` section.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Database path. Defaults to `~/.hackcrawl/hackcrawl.db`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub db_path: Option<String>,
}

/// `[source]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    /// GraphQL endpoint used for listings.
    #[serde(default = "default_api_url")]
    pub api_url: String,

    /// Public site root used to build detail page URLs.
    #[serde(default = "default_site_url")]
    pub site_url: String,

    /// Name of the env var holding the session cookie (never store the cookie itself).
    #[serde(default = "default_cookie_env")]
    pub cookie_env: String,

    /// User-Agent header sent with every request.
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            api_url: default_api_url(),
            site_url: default_site_url(),
            cookie_env: default_cookie_env(),
            user_agent: default_user_agent(),
        }
    }
}

fn default_api_url() -> String {
    "https://api.taikai.network/api/graphql".into()
}
fn default_site_url() -> String {
    "https://taikai.network".into()
}
fn default_cookie_env() -> String {
    "HACKCRAWL_COOKIE".into()
}
fn default_user_agent() -> String {
    concat!("hackcrawl/", env!("CARGO_PKG_VERSION")).into()
}

/// `[crawl]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrawlPoliciesConfig {
    /// Parents processed concurrently.
    #[serde(default = "default_parent_concurrency")]
    pub parent_concurrency: u32,

    /// Children of one parent fetched concurrently.
    #[serde(default = "default_child_concurrency")]
    pub child_concurrency: u32,

    /// Consecutive empty pages tolerated before a listing counts as exhausted.
    #[serde(default = "default_empty_page_tolerance")]
    pub empty_page_tolerance: u32,

    /// Hard cap on listing pages per run.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_pages: Option<u32>,

    /// Consecutive failed listing pages after which the run is aborted.
    #[serde(default = "default_max_consecutive_page_failures")]
    pub max_consecutive_page_failures: u32,

    /// Runs in which a child may fail before it is recorded as permanently failed.
    #[serde(default = "default_child_failure_limit")]
    pub child_failure_limit: u32,
}

impl Default for CrawlPoliciesConfig {
    fn default() -> Self {
        Self {
            parent_concurrency: default_parent_concurrency(),
            child_concurrency: default_child_concurrency(),
            empty_page_tolerance: default_empty_page_tolerance(),
            max_pages: None,
            max_consecutive_page_failures: default_max_consecutive_page_failures(),
            child_failure_limit: default_child_failure_limit(),
        }
    }
}

fn default_parent_concurrency() -> u32 {
    1
}
fn default_child_concurrency() -> u32 {
    4
}
fn default_empty_page_tolerance() -> u32 {
    1
}
fn default_max_consecutive_page_failures() -> u32 {
    3
}
fn default_child_failure_limit() -> u32 {
    3
}

/// `[retry]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Attempts per call, including the first.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Delay before the first retry; doubles each attempt.
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    /// Upper bound for the backoff delay.
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    /// Timeout applied to each individual call.
    #[serde(default = "default_call_timeout_secs")]
    pub call_timeout_secs: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            call_timeout_secs: default_call_timeout_secs(),
        }
    }
}

fn default_max_attempts() -> u32 {
    3
}
fn default_base_delay_ms() -> u64 {
    500
}
fn default_max_delay_ms() -> u64 {
    8_000
}
fn default_call_timeout_secs() -> u64 {
    30
}

// ---------------------------------------------------------------------------
// Runtime config (merged from config + CLI flags)
// ---------------------------------------------------------------------------

/// Runtime crawl configuration, merged from config file + CLI flags.
#[derive(Debug, Clone)]
pub struct CrawlConfig {
    /// First listing page to request.
    pub start_page: u32,
    /// Maximum listing pages per run (`None` = until exhaustion).
    pub max_pages: Option<u32>,
    pub parent_concurrency: usize,
    pub child_concurrency: usize,
    pub empty_page_tolerance: u32,
    pub max_consecutive_page_failures: u32,
    pub child_failure_limit: u32,
    pub retry: RetryPolicy,
}

impl From<&AppConfig> for CrawlConfig {
    fn from(config: &AppConfig) -> Self {
        Self {
            start_page: 0,
            max_pages: config.crawl.max_pages,
            parent_concurrency: config.crawl.parent_concurrency as usize,
            child_concurrency: config.crawl.child_concurrency as usize,
            empty_page_tolerance: config.crawl.empty_page_tolerance,
            max_consecutive_page_failures: config.crawl.max_consecutive_page_failures,
            child_failure_limit: config.crawl.child_failure_limit,
            retry: RetryPolicy::from(&config.retry),
        }
    }
}

impl Default for CrawlConfig {
    fn default() -> Self {
        Self::from(&AppConfig::default())
    }
}

impl CrawlConfig {
    /// Reject settings the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.parent_concurrency == 0 || self.child_concurrency == 0 {
            return Err(HackCrawlError::config("concurrency must be at least 1"));
        }
        if self.retry.max_attempts == 0 {
            return Err(HackCrawlError::config("retry.max_attempts must be at least 1"));
        }
        if self.max_consecutive_page_failures == 0 {
            return Err(HackCrawlError::config(
                "crawl.max_consecutive_page_failures must be at least 1",
            ));
        }
        if self.child_failure_limit == 0 {
            return Err(HackCrawlError::config("crawl.child_failure_limit must be at least 1"));
        }
        Ok(())
    }
}

/// Bounded retry with exponential backoff for a single source call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub call_timeout: Duration,
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            base_delay: Duration::from_millis(config.base_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
            call_timeout: Duration::from_secs(config.call_timeout_secs),
        }
    }
}

impl RetryPolicy {
    /// Delay to wait after failed attempt number `attempt` (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

// ---------------------------------------------------------------------------
// Config loading
// ---------------------------------------------------------------------------

/// Get the path to the config directory (`~/.hackcrawl/`).
pub fn config_dir() -> Result<PathBuf> {
    let home = dirs::home_dir()
        .ok_or_else(|| HackCrawlError::config("could not determine home directory"))?;
    Ok(home.join(CONFIG_DIR_NAME))
}

/// Get the path to the config file (`~/.hackcrawl/hackcrawl.toml`).
pub fn config_file_path() -> Result<PathBuf> {
    Ok(config_dir()?.join(CONFIG_FILE_NAME))
}

/// Resolve the database path: configured value, else `~/.hackcrawl/hackcrawl.db`.
pub fn resolve_db_path(config: &AppConfig) -> Result<PathBuf> {
    match &config.storage.db_path {
        Some(path) => Ok(PathBuf::from(path)),
        None => Ok(config_dir()?.join(DB_FILE_NAME)),
    }
}

/// Load the application config from disk. Returns defaults if the file does not exist.
pub fn load_config() -> Result<AppConfig> {
    let path = config_file_path()?;

    if !path.exists() {
        tracing::debug!(?path, "config file not found, using defaults");
        return Ok(AppConfig::default());
    }

    load_config_from(&path)
}

/// Load the application config from a specific file path.
pub fn load_config_from(path: &Path) -> Result<AppConfig> {
    let content = std::fs::read_to_string(path).map_err(|e| HackCrawlError::io(path, e))?;

    let config: AppConfig = toml::from_str(&content).map_err(|e| {
        HackCrawlError::config(format!("failed to parse {}: {e}", path.display()))
    })?;
    validate_source(&config.source)?;
    Ok(config)
}

/// Create the config directory and write a default config file.
/// Returns the path to the created file.
pub fn init_config() -> Result<PathBuf> {
    let dir = config_dir()?;
    std::fs::create_dir_all(&dir).map_err(|e| HackCrawlError::io(&dir, e))?;

    let path = dir.join(CONFIG_FILE_NAME);
    let config = AppConfig::default();
    let content =
        toml::to_string_pretty(&config).map_err(|e| HackCrawlError::config(e.to_string()))?;

    std::fs::write(&path, content).map_err(|e| HackCrawlError::io(&path, e))?;
    tracing::info!(?path, "created default config file");

    Ok(path)
}

/// Check that source endpoints are absolute http(s) URLs.
pub fn validate_source(source: &SourceConfig) -> Result<()> {
    for (field, value) in [("api_url", &source.api_url), ("site_url", &source.site_url)] {
        let url = Url::parse(value)
            .map_err(|e| HackCrawlError::config(format!("source.{field} '{value}': {e}")))?;
        if url.scheme() != "http" && url.scheme() != "https" {
            return Err(HackCrawlError::config(format!(
                "source.{field} must be http or https, got '{value}'"
            )));
        }
    }
    Ok(())
}

/// Read the session cookie from the configured env var, if set.
pub fn session_cookie(source: &SourceConfig) -> Option<String> {
    std::env::var(&source.cookie_env)
        .ok()
        .filter(|v| !v.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_serializes() {
        let config = AppConfig::default();
        let toml_str = toml::to_string_pretty(&config).expect("serialize default config");
        assert!(toml_str.contains("api_url"));
        assert!(toml_str.contains("HACKCRAWL_COOKIE"));
    }

    #[test]
    fn config_roundtrip() {
        let config = AppConfig::default();
        let toml_str = toml::to_string_pretty(&config).expect("serialize");
        let parsed: AppConfig = toml::from_str(&toml_str).expect("deserialize");
        assert_eq!(parsed.crawl.empty_page_tolerance, 1);
        assert_eq!(parsed.retry.max_attempts, 3);
        assert_eq!(parsed.source.cookie_env, "HACKCRAWL_COOKIE");
    }

    #[test]
    fn partial_config_fills_defaults() {
        let toml_str = r#"
[storage]
db_path = "/tmp/hc.db"

[crawl]
empty_page_tolerance = 3
max_pages = 20
"#;
        let config: AppConfig = toml::from_str(toml_str).expect("parse");
        assert_eq!(config.storage.db_path.as_deref(), Some("/tmp/hc.db"));
        assert_eq!(config.crawl.empty_page_tolerance, 3);
        assert_eq!(config.crawl.max_pages, Some(20));
        assert_eq!(config.crawl.child_concurrency, 4);
        assert_eq!(resolve_db_path(&config).unwrap(), PathBuf::from("/tmp/hc.db"));
    }

    #[test]
    fn crawl_config_from_app_config() {
        let crawl = CrawlConfig::from(&AppConfig::default());
        assert_eq!(crawl.start_page, 0);
        assert_eq!(crawl.parent_concurrency, 1);
        assert_eq!(crawl.retry.call_timeout, Duration::from_secs(30));
        assert!(crawl.validate().is_ok());
    }

    #[test]
    fn zero_concurrency_rejected() {
        let mut crawl = CrawlConfig::default();
        crawl.child_concurrency = 0;
        let err = crawl.validate().unwrap_err();
        assert!(err.to_string().contains("concurrency"));
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = RetryPolicy {
            max_attempts: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(300),
            call_timeout: Duration::from_secs(1),
        };
        assert_eq!(policy.backoff(1), Duration::from_millis(100));
        assert_eq!(policy.backoff(2), Duration::from_millis(200));
        assert_eq!(policy.backoff(3), Duration::from_millis(300));
        assert_eq!(policy.backoff(40), Duration::from_millis(300));
    }

    #[test]
    fn non_http_source_rejected() {
        let source = SourceConfig {
            api_url: "ftp://example.com/graphql".into(),
            ..SourceConfig::default()
        };
        assert!(validate_source(&source).is_err());
        assert!(validate_source(&SourceConfig::default()).is_ok());
    }
}
