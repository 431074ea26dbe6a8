//! Configuration management for vulnsync components

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use vulnsync_core::{Error, Result};

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Database settings
    #[serde(default)]
    pub database: DatabaseConfig,

    /// HTTP fetch settings shared by both feeds
    #[serde(default)]
    pub fetch: FetchConfig,

    /// NVD CVE feed settings
    #[serde(default)]
    pub nvd: NvdFeedConfig,

    /// OSV feed settings
    #[serde(default)]
    pub osv: OsvFeedConfig,

    /// Logging settings
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Configuration(format!("Failed to read config file {:?}: {}", path, e))
        })?;
        Self::from_toml(&content)
    }

    /// Parse configuration from TOML string
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)
            .map_err(|e| Error::Configuration(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Create a configuration builder
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::new()
    }

    /// Merge with environment variables (VULNSYNC_ prefix)
    pub fn merge_env(self) -> Self {
        self.merge_vars(|key| std::env::var(key).ok())
    }

    fn merge_vars(mut self, var: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(val) = var("VULNSYNC_DATABASE_PATH") {
            self.database.path = PathBuf::from(val);
        }
        if let Some(n) = var("VULNSYNC_UPSERT_PAGE_SIZE").and_then(|v| v.parse().ok()) {
            self.database.upsert_page_size = n;
        }
        if let Some(n) = var("VULNSYNC_FETCH_MAX_CALLS").and_then(|v| v.parse().ok()) {
            self.fetch.max_calls = n;
        }
        if let Some(n) = var("VULNSYNC_FETCH_PERIOD_SECS").and_then(|v| v.parse().ok()) {
            self.fetch.period_secs = n;
        }
        if let Some(n) = var("VULNSYNC_FETCH_MAX_ATTEMPTS").and_then(|v| v.parse().ok()) {
            self.fetch.max_attempts = n;
        }
        if let Some(val) = var("VULNSYNC_NVD_FEED_URL") {
            self.nvd.feed_base_url = val;
        }
        if let Some(val) = var("VULNSYNC_OSV_BUCKET_URL") {
            self.osv.bucket_url = val;
        }

        // Logging
        if let Some(val) = var("VULNSYNC_LOG_LEVEL") {
            self.logging.level = val;
        }
        if let Some(val) = var("VULNSYNC_LOG_FORMAT") {
            self.logging.format = val;
        }

        self
    }

    /// Reject values that would make a component unusable
    pub fn validate(&self) -> Result<()> {
        fn positive(key: &str, value: u64) -> Result<()> {
            if value == 0 {
                return Err(Error::InvalidConfig {
                    key: key.to_string(),
                    message: String::from("must be greater than zero"),
                });
            }
            Ok(())
        }

        positive("database.upsert_page_size", self.database.upsert_page_size as u64)?;
        positive("database.read_pool_size", self.database.read_pool_size as u64)?;
        positive("database.statement_timeout_secs", self.database.statement_timeout_secs)?;
        positive("fetch.max_calls", self.fetch.max_calls as u64)?;
        positive("fetch.period_secs", self.fetch.period_secs)?;
        positive("fetch.max_attempts", self.fetch.max_attempts as u64)?;
        positive("osv.batch_records", self.osv.batch_records as u64)?;

        if self.nvd.first_year < 2002 {
            return Err(Error::InvalidConfig {
                key: String::from("nvd.first_year"),
                message: format!(
                    "{} predates the first NVD yearly feed (2002)",
                    self.nvd.first_year
                ),
            });
        }
        Ok(())
    }
}

/// SQLite database configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Path to the SQLite database file
    #[serde(default = "default_db_path")]
    pub path: PathBuf,

    /// Number of read-only connections shared by readers
    #[serde(default = "default_read_pool")]
    pub read_pool_size: usize,

    /// SQLite busy timeout in milliseconds
    #[serde(default = "default_busy_timeout")]
    pub busy_timeout_ms: u64,

    /// Rows per multi-row INSERT
    #[serde(default = "default_page_size")]
    pub upsert_page_size: usize,

    /// Deadline for one bulk upsert call
    #[serde(default = "default_statement_timeout")]
    pub statement_timeout_secs: u64,
}

fn default_db_path() -> PathBuf {
    PathBuf::from("/var/lib/vulnsync/vulnsync.db")
}

fn default_read_pool() -> usize {
    4
}

fn default_busy_timeout() -> u64 {
    5000
}

fn default_page_size() -> usize {
    1000
}

fn default_statement_timeout() -> u64 {
    600
}

impl DatabaseConfig {
    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }

    pub fn statement_timeout(&self) -> Duration {
        Duration::from_secs(self.statement_timeout_secs)
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
            read_pool_size: default_read_pool(),
            busy_timeout_ms: default_busy_timeout(),
            upsert_page_size: default_page_size(),
            statement_timeout_secs: default_statement_timeout(),
        }
    }
}

/// Rate limit, retry and timeout settings for feed downloads
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchConfig {
    /// Calls allowed per period
    #[serde(default = "default_max_calls")]
    pub max_calls: u32,

    /// Rate limit period in seconds
    #[serde(default = "default_period")]
    pub period_secs: u64,

    /// Attempts per fetch before giving up
    #[serde(default = "default_attempts")]
    pub max_attempts: u32,

    /// Whole-request timeout in seconds
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Connect timeout in seconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// First retry backoff in milliseconds, doubled per attempt
    #[serde(default = "default_backoff_base")]
    pub backoff_base_ms: u64,

    /// Upper bound for a single backoff
    #[serde(default = "default_backoff_max")]
    pub backoff_max_ms: u64,

    /// Also retry 4xx and other terminal statuses
    #[serde(default)]
    pub retry_terminal_statuses: bool,

    /// User-Agent header sent with every request
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

fn default_max_calls() -> u32 {
    5
}

fn default_period() -> u64 {
    30
}

fn default_attempts() -> u32 {
    3
}

fn default_request_timeout() -> u64 {
    300
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_backoff_base() -> u64 {
    1000
}

fn default_backoff_max() -> u64 {
    30_000
}

fn default_user_agent() -> String {
    format!("vulnsync/{}", env!("CARGO_PKG_VERSION"))
}

impl FetchConfig {
    pub fn period(&self) -> Duration {
        Duration::from_secs(self.period_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            max_calls: default_max_calls(),
            period_secs: default_period(),
            max_attempts: default_attempts(),
            request_timeout_secs: default_request_timeout(),
            connect_timeout_secs: default_connect_timeout(),
            backoff_base_ms: default_backoff_base(),
            backoff_max_ms: default_backoff_max(),
            retry_terminal_statuses: false,
            user_agent: default_user_agent(),
        }
    }
}

/// NVD CVE JSON 2.0 feed configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NvdFeedConfig {
    /// Directory URL holding the `nvdcve-2.0-*` files
    #[serde(default = "default_nvd_url")]
    pub feed_base_url: String,

    /// Oldest yearly partition tracked on a full rescan
    #[serde(default = "default_first_year")]
    pub first_year: u16,

    /// Gap of the "recent" feed beyond which every year is rescanned
    #[serde(default = "default_rescan_days")]
    pub full_rescan_after_days: u32,

    /// Download directory for bundles
    #[serde(default = "default_nvd_work_dir")]
    pub work_dir: PathBuf,
}

fn default_nvd_url() -> String {
    String::from("https://nvd.nist.gov/feeds/json/cve/2.0")
}

fn default_first_year() -> u16 {
    2002
}

fn default_rescan_days() -> u32 {
    7
}

fn default_nvd_work_dir() -> PathBuf {
    std::env::temp_dir().join("vulnsync").join("nvd")
}

impl NvdFeedConfig {
    pub fn meta_url(&self, partition_key: &str) -> String {
        format!("{}/nvdcve-2.0-{}.meta", self.feed_base_url.trim_end_matches('/'), partition_key)
    }

    pub fn bundle_url(&self, partition_key: &str) -> String {
        format!("{}/nvdcve-2.0-{}.json.gz", self.feed_base_url.trim_end_matches('/'), partition_key)
    }
}

impl Default for NvdFeedConfig {
    fn default() -> Self {
        Self {
            feed_base_url: default_nvd_url(),
            first_year: default_first_year(),
            full_rescan_after_days: default_rescan_days(),
            work_dir: default_nvd_work_dir(),
        }
    }
}

/// OSV bucket configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OsvFeedConfig {
    /// Bucket URL serving the archive, change index and single objects
    #[serde(default = "default_osv_url")]
    pub bucket_url: String,

    /// Full archive object name
    #[serde(default = "default_archive")]
    pub archive_name: String,

    /// Change index object name
    #[serde(default = "default_index")]
    pub index_name: String,

    /// OSV records persisted per upsert batch during a full sync
    #[serde(default = "default_batch_records")]
    pub batch_records: usize,

    /// Working directory, removed after every run
    #[serde(default = "default_osv_work_dir")]
    pub work_dir: PathBuf,
}

fn default_osv_url() -> String {
    String::from("https://osv-vulnerabilities.storage.googleapis.com")
}

fn default_archive() -> String {
    String::from("all.zip")
}

fn default_index() -> String {
    String::from("modified_id.csv")
}

fn default_batch_records() -> usize {
    1000
}

fn default_osv_work_dir() -> PathBuf {
    std::env::temp_dir().join("vulnsync").join("osv")
}

impl OsvFeedConfig {
    fn object(&self, name: &str) -> String {
        format!("{}/{}", self.bucket_url.trim_end_matches('/'), name.trim_start_matches('/'))
    }

    pub fn archive_url(&self) -> String {
        self.object(&self.archive_name)
    }

    pub fn index_url(&self) -> String {
        self.object(&self.index_name)
    }

    /// URL of a single advisory; `id` may carry an `ecosystem/` prefix
    pub fn object_url(&self, id: &str) -> String {
        self.object(&format!("{}.json", id))
    }
}

impl Default for OsvFeedConfig {
    fn default() -> Self {
        Self {
            bucket_url: default_osv_url(),
            archive_name: default_archive(),
            index_name: default_index(),
            batch_records: default_batch_records(),
            work_dir: default_osv_work_dir(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format (pretty, json, compact)
    #[serde(default = "default_log_format")]
    pub format: String,
}

fn default_log_level() -> String {
    String::from("info")
}

fn default_log_format() -> String {
    String::from("pretty")
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

/// Builder for constructing Config
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: Config::default(),
        }
    }

    pub fn database_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.database.path = path.into();
        self
    }

    pub fn upsert_page_size(mut self, size: usize) -> Self {
        self.config.database.upsert_page_size = size;
        self
    }

    pub fn rate_limit(mut self, max_calls: u32, period_secs: u64) -> Self {
        self.config.fetch.max_calls = max_calls;
        self.config.fetch.period_secs = period_secs;
        self
    }

    pub fn max_attempts(mut self, attempts: u32) -> Self {
        self.config.fetch.max_attempts = attempts;
        self
    }

    pub fn nvd_feed_url(mut self, url: impl Into<String>) -> Self {
        self.config.nvd.feed_base_url = url.into();
        self
    }

    pub fn osv_bucket_url(mut self, url: impl Into<String>) -> Self {
        self.config.osv.bucket_url = url.into();
        self
    }

    pub fn work_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.config.nvd.work_dir = dir.as_ref().join("nvd");
        self.config.osv.work_dir = dir.as_ref().join("osv");
        self
    }

    pub fn log_level(mut self, level: impl Into<String>) -> Self {
        self.config.logging.level = level.into();
        self
    }

    pub fn build(self) -> Config {
        self.config
    }
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}
