//! # Deployment Live Stats
//!
//! Offline batch job that scans compressed access logs for deployments of
//! tracked products, folds every observation into a per-deployment lifespan
//! and publishes the derived counts as Prometheus gauges.
//!
//! ## Pipeline
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────────────┐
//! │                          DEPLOYMENT LIVE STATS                               │
//! ├──────────────────────────────────────────────────────────────────────────────┤
//! │  GLOB SOURCES → LINE CACHE / GZIP SCAN → AGGREGATOR → CLASSIFIER → GAUGES    │
//! └──────────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! - **Scanner**: decompresses each log once and keeps a filtered side cache
//! - **Aggregator**: one record per environment UUID, widened by every sighting
//! - **Classifier**: lifespan, active flag and 30/90/180 day windows
//! - **Registrar**: per-product, per-cloud, per-window gauges in one registry
//!
//! The run is strictly sequential. Any I/O failure aborts it before anything
//! is pushed.

// ============================================================================
// SECTION 1: IMPORTS & DEPENDENCIES
// ============================================================================

#![allow(dead_code)]
#![warn(rust_2018_idioms)]
#![warn(missing_debug_implementations)]

// ----------------------------------------------------------------------------
// Standard Library Imports
// ----------------------------------------------------------------------------
use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, HashSet};
use std::fmt::{self, Debug, Display, Formatter};
use std::fs::{self, File};
use std::io::{self, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Instant;

// ----------------------------------------------------------------------------
// Serialization
// ----------------------------------------------------------------------------
use serde::{Deserialize, Deserializer, Serialize, Serializer};

// ----------------------------------------------------------------------------
// Error Handling
// ----------------------------------------------------------------------------
use anyhow::{Context as AnyhowContext, Result as AnyhowResult};
use thiserror::Error;

// ----------------------------------------------------------------------------
// Logging & Tracing
// ----------------------------------------------------------------------------
use tracing::level_filters::LevelFilter;
use tracing::{debug, info, trace, warn};
use tracing_subscriber::{
    fmt as tracing_fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter,
};

// ----------------------------------------------------------------------------
// Time
// ----------------------------------------------------------------------------
use chrono::{Local, NaiveDate};

// ----------------------------------------------------------------------------
// Compression & Cache Files
// ----------------------------------------------------------------------------
use flate2::read::MultiGzDecoder;
use tempfile::NamedTempFile;

// ----------------------------------------------------------------------------
// Regex & Pattern Matching
// ----------------------------------------------------------------------------
use memchr::memmem;
use regex::{Regex, RegexSet};

// ----------------------------------------------------------------------------
// Configuration
// ----------------------------------------------------------------------------
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};

// ----------------------------------------------------------------------------
// CLI
// ----------------------------------------------------------------------------
use clap::{Parser, Subcommand};

// ----------------------------------------------------------------------------
// Prometheus
// ----------------------------------------------------------------------------
use prometheus::{Encoder, IntGauge, IntGaugeVec, Opts, Registry as PrometheusRegistry, TextEncoder};

// ============================================================================
// SECTION 2: CONSTANTS & VERSION INFORMATION
// ============================================================================

/// Crate version - follows semantic versioning
pub const STATS_VERSION: &str = env!("CARGO_PKG_VERSION");
pub const STATS_NAME: &str = "deployment-live-stats";

/// Default configuration file, resolved against the working directory
pub const DEFAULT_CONFIG_PATH: &str = "live-stats.toml";

/// Prefix for environment overrides (`LIVE_STATS_PUSH__GATEWAY`, ...)
pub const ENV_PREFIX: &str = "LIVE_STATS_";

// ----------------------------------------------------------------------------
// Log Line Fields
// ----------------------------------------------------------------------------

/// Placeholder for fields missing from logs that predate instrumentation v2
pub const PRE_INSTRUMENTATION: &str = "pre-2";

pub const UUID_KEY: &str = "environment_uuid=";
pub const APP_KEY: &str = "meta/any?id=";
pub const CLOUD_KEY: &str = "provider=";
pub const REGION_KEY: &str = "cloud_region=";
pub const VERSION_KEY: &str = "controller_version=";

/// Length of a dashed hex UUID (8-4-4-4-12)
pub const UUID_LEN: usize = 36;

/// Bytes that end a metadata value
pub const METADATA_TERMINATORS: &[u8] = b",\"";

/// Byte that ends the application identifier (next query parameter)
pub const APP_TERMINATORS: &[u8] = b"&";

/// Date token format embedded in log file names
pub const LOG_DATE_FORMAT: &str = "%Y%m%d";

// ----------------------------------------------------------------------------
// Classification
// ----------------------------------------------------------------------------

/// Deployments living longer than this many days are "long-lasting"
pub const LONG_LASTING_MIN_DAYS: i64 = 14;

/// Largest gap between last sighting and newest log that still counts as active
pub const ACTIVE_MAX_GAP_DAYS: i64 = 1;

// ----------------------------------------------------------------------------
// Defaults
// ----------------------------------------------------------------------------

pub const DEFAULT_LOG_NAME_PREFIX: &str = "api.jujucharms.com.log-";
pub const DEFAULT_CACHE_PREFIX: &str = "prep-bigdata-";
pub const DEFAULT_CACHE_EXTENSION: &str = "data";
pub const DEFAULT_METRIC_NAMESPACE: &str = "live_big_deployments";
pub const DEFAULT_PUSH_PACKAGE: &str = "bigdata-kpi-scripts";
pub const DEFAULT_PUSH_JOB: &str = "bigdata-live-stats";

/// Label attached to the active-deployment gauges
pub const ACTIVE_LABEL: &str = "active";
pub const ACTIVE_LABEL_VALUE: &str = "True";

// ============================================================================
// SECTION 3: CORE TYPE SYSTEM
// ============================================================================
// The records that flow from the scanner to the registrar. Everything here is
// plain owned data; each pipeline stage consumes the previous stage's output.
// ============================================================================

// ----------------------------------------------------------------------------
// 3.1 Log Date
// ----------------------------------------------------------------------------

/// A calendar day as embedded in log file names (`YYYYMMDD`).
///
/// Ordering is identical to the lexicographic order of the fixed-width text
/// form, so min/max over dates and over their tokens always agree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct LogDate(NaiveDate);

impl LogDate {
    /// Parse an 8-digit `YYYYMMDD` token
    pub fn parse(token: &str) -> Option<Self> {
        if token.len() != 8 || !token.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        NaiveDate::parse_from_str(token, LOG_DATE_FORMAT).ok().map(LogDate)
    }

    pub fn from_naive(date: NaiveDate) -> Self {
        LogDate(date)
    }

    pub fn as_naive(&self) -> NaiveDate {
        self.0
    }

    /// Whole days from `self` to `later`; negative when `later` is earlier
    pub fn days_until(&self, later: LogDate) -> i64 {
        later.0.signed_duration_since(self.0).num_days()
    }
}

impl Display for LogDate {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.format(LOG_DATE_FORMAT))
    }
}

impl Serialize for LogDate {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

// ----------------------------------------------------------------------------
// 3.2 Log Record
// ----------------------------------------------------------------------------

/// One filtered log line and the day it was logged on
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    pub line: String,
    pub date: LogDate,
}

impl LogRecord {
    pub fn new(line: impl Into<String>, date: LogDate) -> Self {
        Self {
            line: line.into(),
            date,
        }
    }
}

// ----------------------------------------------------------------------------
// 3.3 Product Tracking Spec
// ----------------------------------------------------------------------------

/// A tracked product and the pattern recognising it in the raw (still
/// percent-encoded) application identifier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProductSpec {
    /// Product name, used in gauge names
    pub name: String,
    /// Regex searched (not anchored) in the application identifier
    pub pattern: String,
}

impl ProductSpec {
    pub fn new(name: impl Into<String>, pattern: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            pattern: pattern.into(),
        }
    }
}

// ============================================================================
// SECTION 4: ERROR HANDLING FRAMEWORK
// ============================================================================
// Parse misses are never errors: lines are skipped or fields defaulted. What
// remains here is fatal for the run (bad configuration, I/O, registry misuse)
// and surfaces in `main` through anyhow.
// ============================================================================

// ----------------------------------------------------------------------------
// 4.1 Top-Level Error
// ----------------------------------------------------------------------------

/// The main error type for a stats run.
#[derive(Error, Debug)]
pub enum StatsError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Scan error: {0}")]
    Scan(#[from] ScanError),

    #[error("Metrics error: {0}")]
    Metrics(#[from] MetricsError),

    #[error("Push error: {0}")]
    Push(#[from] PushError),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl StatsError {
    /// Get the error category for logging
    pub fn category(&self) -> &'static str {
        match self {
            StatsError::Config(_) => "config",
            StatsError::Scan(_) => "scan",
            StatsError::Metrics(_) => "metrics",
            StatsError::Push(_) => "push",
            StatsError::Io(_) => "io",
            StatsError::Internal(_) => "internal",
        }
    }
}

// ----------------------------------------------------------------------------
// 4.2 Configuration Errors
// ----------------------------------------------------------------------------

/// Errors related to configuration loading and validation
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Configuration file not found: {}", .path.display())]
    FileNotFound { path: PathBuf },

    #[error("Failed to parse configuration: {message}")]
    ParseError { message: String },

    #[error("Failed to render configuration: {message}")]
    RenderError { message: String },

    #[error("Invalid configuration value for '{field}': {message}")]
    InvalidValue { field: String, message: String },

    #[error("Invalid pattern for product '{product}': {source}")]
    InvalidPattern { product: String, source: regex::Error },
}

impl ConfigError {
    pub fn invalid_value(field: impl Into<String>, message: impl Into<String>) -> Self {
        ConfigError::InvalidValue {
            field: field.into(),
            message: message.into(),
        }
    }
}

// ----------------------------------------------------------------------------
// 4.3 Scan Errors
// ----------------------------------------------------------------------------

/// Errors from log discovery, decompression and the line cache
#[derive(Error, Debug)]
pub enum ScanError {
    #[error("Invalid log source pattern '{pattern}': {source}")]
    InvalidPattern {
        pattern: String,
        source: glob::PatternError,
    },

    #[error("Failed to enumerate log source '{pattern}': {source}")]
    Discovery {
        pattern: String,
        source: glob::GlobError,
    },

    #[error("Cannot derive a log date from '{}'", .path.display())]
    InvalidLogName { path: PathBuf },

    #[error("Failed to decompress '{}': {source}", .path.display())]
    Decompress { path: PathBuf, source: io::Error },

    #[error("Failed to read cache file '{}': {source}", .path.display())]
    CacheRead { path: PathBuf, source: io::Error },

    #[error("Failed to write cache file '{}': {source}", .path.display())]
    CacheWrite { path: PathBuf, source: io::Error },
}

// ----------------------------------------------------------------------------
// 4.4 Metrics & Push Errors
// ----------------------------------------------------------------------------

/// Errors from gauge registration and exposition
#[derive(Error, Debug)]
pub enum MetricsError {
    #[error("Gauge registration failed: {0}")]
    Registration(#[from] prometheus::Error),

    #[error("Deployment collection mixes products '{expected}' and '{found}'")]
    MixedProducts { expected: String, found: String },

    #[error("Failed to encode registry: {message}")]
    Encoding { message: String },
}

/// Errors handing the registry to the push gateway
#[derive(Error, Debug)]
pub enum PushError {
    #[error("No push gateway configured (set LIVE_STATS_PUSH__GATEWAY)")]
    MissingGateway,

    #[error("Push to '{gateway}' failed: {source}")]
    Gateway {
        gateway: String,
        source: prometheus::Error,
    },

    #[error("Push support not compiled in (enable the `push` feature)")]
    Disabled,
}

// ----------------------------------------------------------------------------
// 4.5 Result Type Aliases
// ----------------------------------------------------------------------------

/// Standard result type for stats operations
pub type StatsResult<T> = Result<T, StatsError>;

/// Result type for scanner operations
pub type ScanResult<T> = Result<T, ScanError>;

/// Result type for registrar operations
pub type MetricsResult<T> = Result<T, MetricsError>;

// ============================================================================
// SECTION 5: CONFIGURATION SYSTEM
// ============================================================================
// TOML file layered over built-in defaults, then `LIVE_STATS_` environment
// overrides (`__` separates nested keys). Defaults reproduce the production
// job, so running with no file and no environment is a valid configuration.
// ============================================================================

// ----------------------------------------------------------------------------
// 5.1 Main Configuration Structure
// ----------------------------------------------------------------------------

/// Root configuration for a stats run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatsConfig {
    /// Cloud providers that get their own gauges
    #[serde(default = "default_clouds")]
    pub clouds: Vec<String>,

    /// Tracked products
    #[serde(default = "default_products")]
    pub products: Vec<ProductSpec>,

    /// Log sources and file naming
    #[serde(default)]
    pub sources: SourcesConfig,

    /// Filtered-line side cache
    #[serde(default)]
    pub cache: CacheConfig,

    /// Gauge naming
    #[serde(default)]
    pub metrics: MetricsConfig,

    /// Push gateway
    #[serde(default)]
    pub push: PushConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Default for StatsConfig {
    fn default() -> Self {
        Self {
            clouds: default_clouds(),
            products: default_products(),
            sources: SourcesConfig::default(),
            cache: CacheConfig::default(),
            metrics: MetricsConfig::default(),
            push: PushConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl StatsConfig {
    /// Load configuration from file with environment overrides
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(ConfigError::FileNotFound {
                path: path.to_path_buf(),
            });
        }

        Self::extract(Figment::from(Serialized::defaults(Self::default())).merge(Toml::file(path)))
    }

    /// Defaults plus environment overrides, no file
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::extract(Figment::from(Serialized::defaults(Self::default())))
    }

    fn extract(figment: Figment) -> Result<Self, ConfigError> {
        let config: Self = figment
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()
            .map_err(|e| ConfigError::ParseError {
                message: e.to_string(),
            })?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        let namespace = &self.metrics.namespace;
        if !is_metric_token(namespace) || namespace.starts_with(|c: char| c.is_ascii_digit()) {
            return Err(ConfigError::invalid_value(
                "metrics.namespace",
                format!("'{}' is not a valid metric name prefix", namespace),
            ));
        }

        // Product names end up inside gauge names, so they must be unique too
        let mut seen = HashSet::new();
        for product in &self.products {
            if !is_metric_token(&product.name) {
                return Err(ConfigError::invalid_value(
                    "products.name",
                    format!("'{}' may only contain [A-Za-z0-9_]", product.name),
                ));
            }
            if !seen.insert(product.name.as_str()) {
                return Err(ConfigError::invalid_value(
                    "products.name",
                    format!("product '{}' is defined twice", product.name),
                ));
            }
            Regex::new(&product.pattern).map_err(|source| ConfigError::InvalidPattern {
                product: product.name.clone(),
                source,
            })?;
        }

        for cloud in &self.clouds {
            if !is_metric_token(cloud) {
                return Err(ConfigError::invalid_value(
                    "clouds",
                    format!("'{}' may only contain [A-Za-z0-9_]", cloud),
                ));
            }
        }

        if self.cache.extension.is_empty() {
            return Err(ConfigError::invalid_value("cache.extension", "must not be empty"));
        }

        Ok(())
    }

    /// Render the defaults as a TOML document
    pub fn generate_default_config() -> Result<String, ConfigError> {
        toml::to_string_pretty(&Self::default()).map_err(|e| ConfigError::RenderError {
            message: e.to_string(),
        })
    }
}

/// Parse a TOML document directly, without defaults layering or environment
impl FromStr for StatsConfig {
    type Err = ConfigError;

    fn from_str(toml_str: &str) -> Result<Self, Self::Err> {
        let config: Self = toml::from_str(toml_str).map_err(|e| ConfigError::ParseError {
            message: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }
}

/// True for non-empty strings usable inside a Prometheus metric name
fn is_metric_token(s: &str) -> bool {
    !s.is_empty() && s.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'_')
}

/// Any scalar a provider may hand over for a text field. The environment
/// provider infers types, so `LIVE_STATS_PUSH__PASSWORD=123456` arrives as an
/// integer.
#[derive(Deserialize)]
#[serde(untagged)]
enum ScalarText {
    Text(String),
    Signed(i64),
    Unsigned(u64),
    Float(f64),
    Flag(bool),
}

impl From<ScalarText> for String {
    fn from(value: ScalarText) -> Self {
        match value {
            ScalarText::Text(s) => s,
            ScalarText::Signed(n) => n.to_string(),
            ScalarText::Unsigned(n) => n.to_string(),
            ScalarText::Float(n) => n.to_string(),
            ScalarText::Flag(b) => b.to_string(),
        }
    }
}

fn scalar_string<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    ScalarText::deserialize(deserializer).map(String::from)
}

fn optional_scalar_string<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<Option<String>, D::Error> {
    Ok(Option::<ScalarText>::deserialize(deserializer)?.map(String::from))
}

fn default_clouds() -> Vec<String> {
    ["maas", "ec2", "azure", "gce", "lxd", "openstack", "manual"]
        .iter()
        .map(|c| c.to_string())
        .collect()
}

fn default_products() -> Vec<ProductSpec> {
    vec![
        ProductSpec::new("spark", ".*cs%3A(xenial|trusty)%2Fspark.*"),
        ProductSpec::new("hadoop", ".*cs%3A(xenial|trusty)%2Fhadoop-resourcemanager.*"),
        ProductSpec::new("kafka", ".*cs%3A(xenial|trusty)%2Fkafka.*"),
        ProductSpec::new("apache_spark", ".*cs%3A(xenial|trusty)%2Fapache-spark.*"),
        ProductSpec::new(
            "apache_hadoop",
            ".*cs%3A(xenial|trusty)%2Fapache-hadoop-resourcemanager.*",
        ),
        ProductSpec::new("apache_kafka", ".*cs%3A(xenial|trusty)%2Fapache-kafka.*"),
    ]
}

// ----------------------------------------------------------------------------
// 5.2 Log Sources
// ----------------------------------------------------------------------------

/// Where the compressed logs live and how their names embed the date
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourcesConfig {
    /// Glob patterns, scanned in order
    #[serde(default = "default_source_patterns")]
    pub patterns: Vec<String>,

    /// Stripped from the front of a file name
    #[serde(default = "default_log_name_prefix", deserialize_with = "scalar_string")]
    pub log_name_prefix: String,

    /// Stripped from the end of a file name, repeatedly, in any order
    #[serde(default = "default_log_name_suffixes")]
    pub log_name_suffixes: Vec<String>,
}

impl Default for SourcesConfig {
    fn default() -> Self {
        Self {
            patterns: default_source_patterns(),
            log_name_prefix: default_log_name_prefix(),
            log_name_suffixes: default_log_name_suffixes(),
        }
    }
}

fn default_source_patterns() -> Vec<String> {
    vec![
        "/var/tmp/logs/api/1/api.jujucharms.com.log-201*".into(),
        "/var/tmp/logs/api/2/api.jujucharms.com.log-201*".into(),
    ]
}

fn default_log_name_prefix() -> String {
    DEFAULT_LOG_NAME_PREFIX.into()
}

fn default_log_name_suffixes() -> Vec<String> {
    vec![".anon".into(), ".gz".into()]
}

// ----------------------------------------------------------------------------
// 5.3 Cache, Metrics & Push
// ----------------------------------------------------------------------------

/// Naming of the filtered-line cache written next to each log
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_cache_prefix", deserialize_with = "scalar_string")]
    pub prefix: String,

    #[serde(default = "default_cache_extension", deserialize_with = "scalar_string")]
    pub extension: String,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            prefix: default_cache_prefix(),
            extension: default_cache_extension(),
        }
    }
}

fn default_cache_prefix() -> String {
    DEFAULT_CACHE_PREFIX.into()
}

fn default_cache_extension() -> String {
    DEFAULT_CACHE_EXTENSION.into()
}

/// Gauge naming
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Prefix of every gauge name
    #[serde(default = "default_namespace")]
    pub namespace: String,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            namespace: default_namespace(),
        }
    }
}

fn default_namespace() -> String {
    DEFAULT_METRIC_NAMESPACE.into()
}

/// Push gateway configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PushConfig {
    /// Package the job belongs to, sent as the `package` grouping label
    #[serde(default = "default_push_package", deserialize_with = "scalar_string")]
    pub package: String,

    /// Job name on the gateway
    #[serde(default = "default_push_job", deserialize_with = "scalar_string")]
    pub job: String,

    /// Gateway address, usually from `LIVE_STATS_PUSH__GATEWAY`
    #[serde(
        default,
        deserialize_with = "optional_scalar_string",
        skip_serializing_if = "Option::is_none"
    )]
    pub gateway: Option<String>,

    #[serde(
        default,
        deserialize_with = "optional_scalar_string",
        skip_serializing_if = "Option::is_none"
    )]
    pub username: Option<String>,

    #[serde(
        default,
        deserialize_with = "optional_scalar_string",
        skip_serializing_if = "Option::is_none"
    )]
    pub password: Option<String>,
}

impl Default for PushConfig {
    fn default() -> Self {
        Self {
            package: default_push_package(),
            job: default_push_job(),
            gateway: None,
            username: None,
            password: None,
        }
    }
}

fn default_push_package() -> String {
    DEFAULT_PUSH_PACKAGE.into()
}

fn default_push_job() -> String {
    DEFAULT_PUSH_JOB.into()
}

// ----------------------------------------------------------------------------
// 5.4 Logging Configuration
// ----------------------------------------------------------------------------

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output format (json, pretty, compact)
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Enable ANSI colors
    #[serde(default = "default_true")]
    pub colors: bool,

    /// Include source location
    #[serde(default)]
    pub source_location: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            colors: true,
            source_location: false,
        }
    }
}

fn default_log_level() -> String {
    "info".into()
}

fn default_log_format() -> String {
    "compact".into()
}

fn default_true() -> bool {
    true
}

// ============================================================================
// SECTION 6: LOGGING & TRACING INFRASTRUCTURE
// ============================================================================

// ----------------------------------------------------------------------------
// 6.1 Log Level Management
// ----------------------------------------------------------------------------

/// Log levels accepted in configuration and on the command line
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    /// Parse from string, falling back to `Info`
    pub fn parse(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "trace" => LogLevel::Trace,
            "debug" => LogLevel::Debug,
            "info" => LogLevel::Info,
            "warn" | "warning" => LogLevel::Warn,
            "error" => LogLevel::Error,
            _ => LogLevel::Info,
        }
    }

    pub fn to_level_filter(self) -> LevelFilter {
        match self {
            LogLevel::Trace => LevelFilter::TRACE,
            LogLevel::Debug => LevelFilter::DEBUG,
            LogLevel::Info => LevelFilter::INFO,
            LogLevel::Warn => LevelFilter::WARN,
            LogLevel::Error => LevelFilter::ERROR,
        }
    }
}

impl Display for LogLevel {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            LogLevel::Trace => write!(f, "trace"),
            LogLevel::Debug => write!(f, "debug"),
            LogLevel::Info => write!(f, "info"),
            LogLevel::Warn => write!(f, "warn"),
            LogLevel::Error => write!(f, "error"),
        }
    }
}

// ----------------------------------------------------------------------------
// 6.2 Logger Initialization
// ----------------------------------------------------------------------------

/// Initialize the logging system based on configuration.
///
/// `RUST_LOG` takes precedence over the configured level. Output goes to
/// stderr so a dry run can print the exposition on stdout.
pub fn init_logging(config: &LoggingConfig) -> StatsResult<()> {
    let level = LogLevel::parse(&config.level);

    let env_filter = EnvFilter::builder()
        .with_default_directive(level.to_level_filter().into())
        .from_env_lossy();

    let registry = tracing_subscriber::registry().with(env_filter);

    let installed = match config.format.as_str() {
        "json" => registry
            .with(
                tracing_fmt::layer()
                    .json()
                    .with_writer(io::stderr)
                    .with_target(true)
                    .with_file(config.source_location)
                    .with_line_number(config.source_location),
            )
            .try_init(),
        "pretty" => registry
            .with(
                tracing_fmt::layer()
                    .pretty()
                    .with_writer(io::stderr)
                    .with_ansi(config.colors)
                    .with_target(true)
                    .with_file(config.source_location)
                    .with_line_number(config.source_location),
            )
            .try_init(),
        _ => registry
            .with(
                tracing_fmt::layer()
                    .compact()
                    .with_writer(io::stderr)
                    .with_ansi(config.colors)
                    .with_target(true),
            )
            .try_init(),
    };

    installed.map_err(|e| StatsError::Internal(format!("Failed to set logger: {}", e)))?;

    info!(
        target: "live_stats::init",
        level = %level,
        format = %config.format,
        "Logging initialized"
    );

    Ok(())
}

// ----------------------------------------------------------------------------
// 6.3 Stage Timer
// ----------------------------------------------------------------------------

/// Wall-clock timer for one pipeline stage
#[derive(Debug)]
pub struct StageTimer {
    name: &'static str,
    start: Instant,
}

impl StageTimer {
    /// Start a new timer
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            start: Instant::now(),
        }
    }

    /// Get elapsed time in milliseconds
    pub fn elapsed_ms(&self) -> u64 {
        self.start.elapsed().as_millis() as u64
    }

    /// Stop the timer and log the stage duration
    pub fn stop(self) -> u64 {
        let elapsed = self.elapsed_ms();
        debug!(
            target: "live_stats::perf",
            stage = self.name,
            elapsed_ms = elapsed,
            "Stage completed"
        );
        elapsed
    }
}

// ============================================================================
// SECTION 7: FIELD EXTRACTION
// ============================================================================
// Access log lines carry `key=value` fields at no fixed position. A field is
// found by searching for its key and reading the value that follows under a
// per-field delimiting rule. The first occurrence whose value satisfies the
// rule wins; matching is case-sensitive and nothing is percent-decoded.
// ============================================================================

// ----------------------------------------------------------------------------
// 7.1 Value Rules
// ----------------------------------------------------------------------------

/// How the value following a field key is delimited
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueRule {
    /// Runs up to the first terminator byte or the end of the line
    Until(&'static [u8]),
    /// Like `Until`, but the value must start with a word character
    WordLed(&'static [u8]),
    /// Exactly a dashed hex UUID; whatever follows it is ignored
    DashedUuid,
}

impl ValueRule {
    fn take<'l>(&self, rest: &'l str) -> Option<&'l str> {
        match *self {
            ValueRule::Until(terminators) => Some(until_any(rest, terminators)),
            ValueRule::WordLed(terminators) => {
                let first = *rest.as_bytes().first()?;
                if first.is_ascii_alphanumeric() || first == b'_' {
                    Some(until_any(rest, terminators))
                } else {
                    None
                }
            }
            ValueRule::DashedUuid => {
                let candidate = rest.as_bytes().get(..UUID_LEN)?;
                let well_formed = candidate.iter().enumerate().all(|(i, b)| match i {
                    8 | 13 | 18 | 23 => *b == b'-',
                    _ => b.is_ascii_hexdigit(),
                });
                // all ASCII, so UUID_LEN is a char boundary
                well_formed.then(|| &rest[..UUID_LEN])
            }
        }
    }
}

fn until_any<'l>(rest: &'l str, terminators: &[u8]) -> &'l str {
    let end = rest
        .bytes()
        .position(|b| terminators.contains(&b))
        .unwrap_or(rest.len());
    &rest[..end]
}

// ----------------------------------------------------------------------------
// 7.2 Field Extractor
// ----------------------------------------------------------------------------

/// Extracts one field by key from semi-structured text.
///
/// Keys must be ASCII so the byte right after a match is a char boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldExtractor {
    key: &'static str,
    rule: ValueRule,
}

impl FieldExtractor {
    pub const fn new(key: &'static str, rule: ValueRule) -> Self {
        Self { key, rule }
    }

    pub fn key(&self) -> &'static str {
        self.key
    }

    /// Value of the first occurrence of the key that satisfies the rule
    pub fn extract<'l>(&self, line: &'l str) -> Option<&'l str> {
        memmem::find_iter(line.as_bytes(), self.key.as_bytes())
            .find_map(|at| self.rule.take(&line[at + self.key.len()..]))
    }
}

pub const UUID_FIELD: FieldExtractor = FieldExtractor::new(UUID_KEY, ValueRule::DashedUuid);
pub const APP_FIELD: FieldExtractor = FieldExtractor::new(APP_KEY, ValueRule::WordLed(APP_TERMINATORS));
pub const CLOUD_FIELD: FieldExtractor =
    FieldExtractor::new(CLOUD_KEY, ValueRule::Until(METADATA_TERMINATORS));
pub const REGION_FIELD: FieldExtractor =
    FieldExtractor::new(REGION_KEY, ValueRule::Until(METADATA_TERMINATORS));
pub const VERSION_FIELD: FieldExtractor =
    FieldExtractor::new(VERSION_KEY, ValueRule::Until(METADATA_TERMINATORS));

/// The deployment's environment UUID, exactly 36 characters
pub fn find_uuid(line: &str) -> Option<&str> {
    UUID_FIELD.extract(line)
}

/// The raw application identifier (`meta/any?id=<value>&...`)
pub fn find_app(line: &str) -> Option<&str> {
    APP_FIELD.extract(line)
}

// ============================================================================
// SECTION 8: METADATA EXTRACTION & PRODUCT MATCHING
// ============================================================================

// ----------------------------------------------------------------------------
// 8.1 Deployment Metadata
// ----------------------------------------------------------------------------

/// What one deployment reported, and the span of days it was seen on.
///
/// `first_seen <= last_seen` holds from construction on; `observe` only ever
/// widens the span.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeploymentMetadata {
    /// Raw application identifier
    pub app: String,
    /// Cloud provider, or `pre-2`
    pub cloud: String,
    /// Cloud region, or `pre-2`
    pub region: String,
    /// Controller version, or `pre-2`
    pub version: String,
    pub first_seen: LogDate,
    pub last_seen: LogDate,
}

impl DeploymentMetadata {
    /// Widen the observed span to include `date`
    pub fn observe(&mut self, date: LogDate) {
        if date < self.first_seen {
            self.first_seen = date;
        }
        if date > self.last_seen {
            self.last_seen = date;
        }
    }

    /// Days between first and last sighting, both ends included
    pub fn lifespan_days(&self) -> i64 {
        self.first_seen.days_until(self.last_seen) + 1
    }
}

/// Metadata of a line observed on `date`.
///
/// Returns `None` when the line has no application identifier. Cloud, region
/// and version are optional and fall back to [`PRE_INSTRUMENTATION`].
pub fn extract_metadata(line: &str, date: LogDate) -> Option<DeploymentMetadata> {
    let app = find_app(line)?;
    let field_or_sentinel =
        |field: FieldExtractor| field.extract(line).unwrap_or(PRE_INSTRUMENTATION).to_string();

    Some(DeploymentMetadata {
        app: app.to_string(),
        cloud: field_or_sentinel(CLOUD_FIELD),
        region: field_or_sentinel(REGION_FIELD),
        version: field_or_sentinel(VERSION_FIELD),
        first_seen: date,
        last_seen: date,
    })
}

// ----------------------------------------------------------------------------
// 8.2 Product Matching
// ----------------------------------------------------------------------------

/// A product spec with its pattern compiled
#[derive(Debug, Clone)]
pub struct CompiledProduct {
    name: String,
    pattern: Regex,
}

impl CompiledProduct {
    pub fn compile(spec: &ProductSpec) -> Result<Self, ConfigError> {
        let pattern = Regex::new(&spec.pattern).map_err(|source| ConfigError::InvalidPattern {
            product: spec.name.clone(),
            source,
        })?;
        Ok(Self {
            name: spec.name.clone(),
            pattern,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Unanchored search of the pattern in a raw application identifier
    pub fn matches_app(&self, app: &str) -> bool {
        self.pattern.is_match(app)
    }
}

/// All tracked products, plus a single-pass "any product" test for the scanner
#[derive(Debug, Clone)]
pub struct ProductMatcher {
    any: RegexSet,
    products: Vec<CompiledProduct>,
}

impl ProductMatcher {
    pub fn new(specs: &[ProductSpec]) -> Result<Self, ConfigError> {
        let products = specs
            .iter()
            .map(CompiledProduct::compile)
            .collect::<Result<Vec<_>, _>>()?;
        // every pattern compiled on its own above, so this only fails on size limits
        let any = RegexSet::new(specs.iter().map(|s| s.pattern.as_str())).map_err(|source| {
            ConfigError::InvalidPattern {
                product: "<all>".into(),
                source,
            }
        })?;
        Ok(Self { any, products })
    }

    pub fn products(&self) -> &[CompiledProduct] {
        &self.products
    }

    pub fn matches_any(&self, app: &str) -> bool {
        self.any.is_match(app)
    }

    /// Whether a raw line carries a UUID and the identifier of a tracked product
    pub fn is_tracked_line(&self, line: &str) -> bool {
        match find_app(line) {
            Some(app) => find_uuid(line).is_some() && self.matches_any(app),
            None => false,
        }
    }
}

// ============================================================================
// SECTION 9: EXTRACTION TESTS
// ============================================================================


#[cfg(test)]
mod extraction_tests {
    use super::fixtures::*;
    use super::*;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;
    use rstest::rstest;

    #[test]
    fn test_find_uuid_returns_dashed_value() {
        let line = access_line(UUID_A, SPARK_APP, "ec2");
        assert_eq!(find_uuid(&line), Some(UUID_A));

        let glued = format!("x environment_uuid={}deadbeef trailing", UUID_B);
        assert_eq!(find_uuid(&glued), Some(UUID_B));
    }

    #[test]
    fn test_find_uuid_skips_malformed_occurrence() {
        let line = format!("environment_uuid=not-a-uuid environment_uuid={}", UUID_A);
        assert_eq!(find_uuid(&line), Some(UUID_A));
        assert_eq!(find_uuid("environment_uuid=0a1b2c3d-4e5f"), None);
        assert_eq!(find_uuid("GET /v5/meta/any?id=cs%3Axenial%2Fspark"), None);
    }

    #[test]
    fn test_find_app_reads_raw_identifier() {
        let line = access_line(UUID_A, SPARK_APP, "ec2");
        assert_eq!(find_app(&line), Some(SPARK_APP));

        // runs to end of line when no further parameter follows
        assert_eq!(find_app("GET /meta/any?id=cs%3Axenial%2Fkafka"), Some("cs%3Axenial%2Fkafka"));
    }

    #[test]
    fn test_find_app_requires_word_character_first() {
        assert_eq!(find_app("meta/any?id=%2Fbroken&x=1"), None);
        assert_eq!(
            find_app("meta/any?id=&x meta/any?id=cs%3Atrusty%2Fspark&y"),
            Some("cs%3Atrusty%2Fspark")
        );
    }

    #[test]
    fn test_field_extractor_stops_at_terminators() {
        let extractor = FieldExtractor::new("cloud_region=", ValueRule::Until(METADATA_TERMINATORS));
        assert_eq!(extractor.extract("cloud_region=us-east-1,provider=ec2"), Some("us-east-1"));
        assert_eq!(extractor.extract("\"cloud_region=eu-west-2\""), Some("eu-west-2"));
        assert_eq!(extractor.extract("cloud_region=,x"), Some(""));
        assert_eq!(extractor.extract("region=us-east-1"), None);
        assert_eq!(extractor.key(), "cloud_region=");
    }

    #[test]
    fn test_extract_metadata_instrumented_line() {
        let line = access_line(UUID_A, SPARK_APP, "maas");
        let metadata = extract_metadata(&line, date("20190105")).unwrap();

        assert_eq!(
            metadata,
            DeploymentMetadata {
                app: SPARK_APP.into(),
                cloud: "maas".into(),
                region: "us-east-1".into(),
                version: "2.5.0".into(),
                first_seen: date("20190105"),
                last_seen: date("20190105"),
            }
        );
    }

    #[test]
    fn test_extract_metadata_defaults_to_sentinel() {
        let line = legacy_line(UUID_A, SPARK_APP);
        let metadata = extract_metadata(&line, date("20160601")).unwrap();

        assert_eq!(metadata.app, SPARK_APP);
        assert_eq!(metadata.cloud, PRE_INSTRUMENTATION);
        assert_eq!(metadata.region, PRE_INSTRUMENTATION);
        assert_eq!(metadata.version, PRE_INSTRUMENTATION);
        assert_eq!(metadata.lifespan_days(), 1);
    }

    #[rstest]
    #[case("")]
    #[case("GET /v5/charmstore/stats provider=ec2,cloud_region=us-east-1")]
    #[case("environment_uuid=0a1b2c3d-4e5f-4a6b-8c7d-9e0f1a2b3c4d controller_version=2.5.0")]
    #[case("GET /v5/meta/any?include=id-revision HTTP/1.1")]
    fn test_extract_metadata_without_app_field(#[case] line: &str) {
        assert_eq!(extract_metadata(line, date("20190101")), None);
    }

    #[rstest]
    #[case("20190101", true)]
    #[case("20161231", true)]
    #[case("20160229", true)]
    #[case("20190229", false)]
    #[case("20191301", false)]
    #[case("2019011", false)]
    #[case("2019-01-01", false)]
    #[case("+2019010", false)]
    fn test_log_date_parse(#[case] token: &str, #[case] valid: bool) {
        assert_eq!(LogDate::parse(token).is_some(), valid);
    }

    #[test]
    fn test_log_date_round_trips_token() {
        assert_eq!(date("20190110").to_string(), "20190110");
        assert_eq!(date("20190101").days_until(date("20190110")), 9);
        assert_eq!(date("20190110").days_until(date("20190101")), -9);
    }

    #[test]
    fn test_product_matcher_tracked_lines() {
        let matcher = ProductMatcher::new(&[
            ProductSpec::new("spark", ".*cs%3A(xenial|trusty)%2Fspark.*"),
            ProductSpec::new("apache_kafka", ".*cs%3A(xenial|trusty)%2Fapache-kafka.*"),
        ])
        .unwrap();

        assert!(matcher.is_tracked_line(&access_line(UUID_A, SPARK_APP, "ec2")));
        assert!(matcher.is_tracked_line(&legacy_line(UUID_B, APACHE_KAFKA_APP)));
        assert!(!matcher.is_tracked_line(&access_line(UUID_A, MYSQL_APP, "ec2")));

        // tracked identifier but no UUID
        assert!(!matcher.is_tracked_line("GET /v5/meta/any?id=cs%3Axenial%2Fspark-12&include=id"));

        // percent-decoded form is not recognised
        assert!(!matcher.is_tracked_line(&access_line(UUID_A, "cs:xenial/spark-12", "ec2")));

        assert_eq!(matcher.products().len(), 2);
        assert_eq!(matcher.products()[1].name(), "apache_kafka");
    }

    #[test]
    fn test_product_matching_is_case_sensitive() {
        let product = spark();
        assert!(product.matches_app("cs%3Atrusty%2Fspark-3"));
        assert!(!product.matches_app("cs%3ATRUSTY%2FSPARK-3"));
        assert!(!product.matches_app("cs%3Axenial%2Fapache-spark-1"));
    }

    #[test]
    fn test_empty_product_list_tracks_nothing() {
        let matcher = ProductMatcher::new(&[]).unwrap();
        assert!(!matcher.is_tracked_line(&access_line(UUID_A, SPARK_APP, "ec2")));
    }

    #[test]
    fn test_config_defaults_are_valid() {
        let config = StatsConfig::default();
        config.validate().unwrap();

        assert_eq!(config.products.len(), 6);
        assert_eq!(config.clouds.len(), 7);
        assert_eq!(config.metrics.namespace, DEFAULT_METRIC_NAMESPACE);
        assert_eq!(config.push.job, DEFAULT_PUSH_JOB);
        assert_eq!(config.push.gateway, None);
    }

    #[test]
    fn test_config_from_toml_overrides() {
        let config = StatsConfig::from_str(
            r#"
            clouds = ["maas", "ec2"]

            [[products]]
            name = "spark"
            pattern = "spark"

            [sources]
            patterns = ["/srv/logs/api.jujucharms.com.log-2019*"]

            [push]
            gateway = "pushgateway.internal:9091"
            "#,
        )
        .unwrap();

        assert_eq!(config.clouds, vec!["maas".to_string(), "ec2".to_string()]);
        assert_eq!(config.products, vec![ProductSpec::new("spark", "spark")]);
        assert_eq!(config.sources.log_name_prefix, DEFAULT_LOG_NAME_PREFIX);
        assert_eq!(config.cache.prefix, DEFAULT_CACHE_PREFIX);
        assert_eq!(config.push.gateway.as_deref(), Some("pushgateway.internal:9091"));
        assert_eq!(config.push.package, DEFAULT_PUSH_PACKAGE);
    }

    #[test]
    fn test_environment_overrides_defaults() {
        figment::Jail::expect_with(|jail| {
            jail.set_env("LIVE_STATS_PUSH__GATEWAY", "pushgw:9091");
            jail.set_env("LIVE_STATS_PUSH__USERNAME", "kpi");
            jail.set_env("LIVE_STATS_PUSH__PASSWORD", "123456");

            let config = StatsConfig::from_env().map_err(|e| e.to_string())?;
            assert_eq!(config.push.gateway.as_deref(), Some("pushgw:9091"));
            assert_eq!(config.push.username.as_deref(), Some("kpi"));
            assert_eq!(config.push.password.as_deref(), Some("123456"));
            assert_eq!(config.push.job, DEFAULT_PUSH_JOB);
            assert_eq!(config.products, StatsConfig::default().products);
            Ok(())
        });
    }

    #[test]
    fn test_environment_overrides_config_file() {
        figment::Jail::expect_with(|jail| {
            jail.create_file(
                "live-stats.toml",
                r#"
                clouds = ["maas"]

                [push]
                package = "kpi-scripts"
                gateway = "file-gateway:9091"

                [cache]
                prefix = "prep-"
                "#,
            )?;
            jail.set_env("LIVE_STATS_PUSH__GATEWAY", "env-gateway:9091");
            jail.set_env("LIVE_STATS_CACHE__EXTENSION", "2019");

            let config = StatsConfig::load("live-stats.toml").map_err(|e| e.to_string())?;
            assert_eq!(config.clouds, vec!["maas".to_string()]);
            assert_eq!(config.push.package, "kpi-scripts");
            assert_eq!(config.push.gateway.as_deref(), Some("env-gateway:9091"));
            assert_eq!(config.cache.prefix, "prep-");
            assert_eq!(config.cache.extension, "2019");
            assert_eq!(config.sources.log_name_prefix, DEFAULT_LOG_NAME_PREFIX);

            let missing = StatsConfig::load("absent.toml");
            assert!(matches!(missing, Err(ConfigError::FileNotFound { .. })));
            Ok(())
        });
    }

    #[test]
    fn test_config_rejects_bad_values() {
        let bad_pattern = StatsConfig::from_str(
            r#"
            [[products]]
            name = "spark"
            pattern = "cs%3A(xenial"
            "#,
        );
        assert!(matches!(bad_pattern, Err(ConfigError::InvalidPattern { ref product, .. }) if product == "spark"));

        let duplicate = StatsConfig::from_str(
            r#"
            [[products]]
            name = "spark"
            pattern = "a"

            [[products]]
            name = "spark"
            pattern = "b"
            "#,
        );
        assert!(matches!(duplicate, Err(ConfigError::InvalidValue { .. })));

        let mut config = StatsConfig::default();
        config.metrics.namespace = "9lives".into();
        assert!(config.validate().is_err());

        let mut config = StatsConfig::default();
        config.clouds.push("open-stack".into());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_generated_config_parses_back() {
        let rendered = StatsConfig::generate_default_config().unwrap();
        let parsed = StatsConfig::from_str(&rendered).unwrap();
        assert_eq!(parsed.products, StatsConfig::default().products);
        assert_eq!(parsed.clouds, StatsConfig::default().clouds);
    }

    #[test]
    fn test_log_level_parsing() {
        assert_eq!(LogLevel::parse("DEBUG"), LogLevel::Debug);
        assert_eq!(LogLevel::parse("warning"), LogLevel::Warn);
        assert_eq!(LogLevel::parse("chatty"), LogLevel::Info);
        assert_eq!(LogLevel::Error.to_level_filter(), LevelFilter::ERROR);
    }

    proptest! {
        #[test]
        fn prop_find_uuid_ignores_surrounding_text(
            prefix in "[ -~]{0,40}",
            suffix in "[ -~]{0,40}",
            uuid in "[0-9a-f]{8}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{12}",
        ) {
            prop_assume!(!prefix.contains(UUID_KEY));
            let line = format!("{}{}{}{}", prefix, UUID_KEY, uuid, suffix);
            prop_assert_eq!(find_uuid(&line), Some(uuid.as_str()));
        }

        #[test]
        fn prop_log_date_order_matches_token_order(a in 0i64..30_000, b in 0i64..30_000) {
            let base = NaiveDate::from_ymd_opt(1970, 1, 1).unwrap();
            let first = LogDate::from_naive(base + chrono::Duration::days(a));
            let second = LogDate::from_naive(base + chrono::Duration::days(b));
            prop_assert_eq!(first.cmp(&second), first.to_string().cmp(&second.to_string()));
        }
    }
}

// ============================================================================
// SECTION 10: LOG CACHE & SCANNER
// ============================================================================
// Each compressed log is decompressed at most once. Its tracked lines are
// written next to it as `<prefix><YYYYMMDD>.<ext>` and every later run reads
// that file instead. A cache file is trusted indefinitely: nothing here
// checks it against the log it came from or ever deletes it.
// ============================================================================

// ----------------------------------------------------------------------------
// 10.1 Log Names
// ----------------------------------------------------------------------------

/// Derives the log date from a file name such as
/// `api.jujucharms.com.log-20190101.anon.gz`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogNameRules {
    prefix: String,
    suffixes: Vec<String>,
}

impl LogNameRules {
    pub fn new(prefix: impl Into<String>, suffixes: Vec<String>) -> Self {
        Self {
            prefix: prefix.into(),
            suffixes,
        }
    }

    pub fn from_config(config: &SourcesConfig) -> Self {
        Self::new(config.log_name_prefix.clone(), config.log_name_suffixes.clone())
    }

    /// File name with the prefix and every trailing suffix token removed
    pub fn date_token<'n>(&self, file_name: &'n str) -> &'n str {
        let mut token = file_name.strip_prefix(self.prefix.as_str()).unwrap_or(file_name);
        loop {
            let stripped = self
                .suffixes
                .iter()
                .filter(|s| !s.is_empty())
                .find_map(|s| token.strip_suffix(s.as_str()));
            match stripped {
                Some(rest) => token = rest,
                None => return token,
            }
        }
    }

    pub fn log_date(&self, path: &Path) -> ScanResult<LogDate> {
        path.file_name()
            .and_then(|name| name.to_str())
            .and_then(|name| LogDate::parse(self.date_token(name)))
            .ok_or_else(|| ScanError::InvalidLogName {
                path: path.to_path_buf(),
            })
    }
}

// ----------------------------------------------------------------------------
// 10.2 Line Cache
// ----------------------------------------------------------------------------

/// Whether a log's lines came from its cache file or from decompression
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheStatus {
    Hit,
    Miss,
}

/// Side cache of filtered lines, keyed by log directory and log date
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LineCache {
    prefix: String,
    extension: String,
}

impl LineCache {
    pub fn new(prefix: impl Into<String>, extension: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            extension: extension.into(),
        }
    }

    pub fn from_config(config: &CacheConfig) -> Self {
        Self::new(config.prefix.clone(), config.extension.clone())
    }

    /// Cache file for the log at `log_path` dated `date`
    pub fn path_for(&self, log_path: &Path, date: LogDate) -> PathBuf {
        parent_dir(log_path).join(format!("{}{}.{}", self.prefix, date, self.extension))
    }

    /// Cached lines, or `None` when no cache file exists yet
    pub fn load(&self, path: &Path) -> ScanResult<Option<Vec<String>>> {
        if !path.exists() {
            return Ok(None);
        }
        let bytes = fs::read(path).map_err(|source| ScanError::CacheRead {
            path: path.to_path_buf(),
            source,
        })?;
        // decoded like a fresh log, so raw bytes from older caches read the same
        Ok(Some(String::from_utf8_lossy(&bytes).lines().map(str::to_owned).collect()))
    }

    /// Write `lines` one per line. The file only appears under its final name
    /// once fully written.
    pub fn store(&self, path: &Path, lines: &[String]) -> ScanResult<()> {
        let write_err = |source: io::Error| ScanError::CacheWrite {
            path: path.to_path_buf(),
            source,
        };

        let mut staged = NamedTempFile::new_in(parent_dir(path)).map_err(write_err)?;
        {
            let mut writer = BufWriter::new(staged.as_file_mut());
            for line in lines {
                writeln!(writer, "{}", line).map_err(write_err)?;
            }
            writer.flush().map_err(write_err)?;
        }
        staged.persist(path).map_err(|e| write_err(e.error))?;
        Ok(())
    }
}

fn parent_dir(path: &Path) -> &Path {
    match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    }
}

/// Decompress a whole gzip log into memory.
///
/// Concatenated gzip members are read as one stream. A truncated or corrupt
/// file is an error, never a partial result.
pub fn decompress(path: &Path) -> ScanResult<String> {
    let err = |source: io::Error| ScanError::Decompress {
        path: path.to_path_buf(),
        source,
    };
    let file = File::open(path).map_err(err)?;
    let mut bytes = Vec::new();
    MultiGzDecoder::new(file).read_to_end(&mut bytes).map_err(err)?;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

// ----------------------------------------------------------------------------
// 10.3 Scanner
// ----------------------------------------------------------------------------

/// Lines kept from one log file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScannedFile {
    pub date: LogDate,
    pub lines: Vec<String>,
    pub cache: CacheStatus,
}

/// Walks the configured log sources, one file at a time.
#[derive(Debug)]
pub struct LogScanner<'a> {
    patterns: &'a [String],
    names: LogNameRules,
    cache: LineCache,
    matcher: &'a ProductMatcher,
}

impl<'a> LogScanner<'a> {
    pub fn new(config: &'a StatsConfig, matcher: &'a ProductMatcher) -> Self {
        Self {
            patterns: &config.sources.patterns,
            names: LogNameRules::from_config(&config.sources),
            cache: LineCache::from_config(&config.cache),
            matcher,
        }
    }

    /// Files matching one source pattern, in glob (alphabetical) order
    pub fn discover(&self, pattern: &str) -> ScanResult<Vec<PathBuf>> {
        let paths = glob::glob(pattern).map_err(|source| ScanError::InvalidPattern {
            pattern: pattern.to_string(),
            source,
        })?;
        paths
            .map(|entry| {
                entry.map_err(|source| ScanError::Discovery {
                    pattern: pattern.to_string(),
                    source,
                })
            })
            .collect()
    }

    /// Every tracked line of every source, paired with its log date
    pub fn scan(&self) -> ScanResult<Vec<LogRecord>> {
        let timer = StageTimer::new("scan");
        info!(target: "live_stats::scan", sources = self.patterns.len(), "Start scanning logs");

        let mut records = Vec::new();
        let mut files_scanned = 0usize;
        let mut cache_hits = 0usize;

        for pattern in self.patterns {
            let files = self.discover(pattern)?;
            info!(target: "live_stats::scan", pattern = %pattern, files = files.len(), "Found logs");

            for (index, path) in files.iter().enumerate() {
                let scanned = self.scan_file(path)?;
                files_scanned += 1;
                if scanned.cache == CacheStatus::Hit {
                    cache_hits += 1;
                }
                debug!(
                    target: "live_stats::scan",
                    file = index + 1,
                    of = files.len(),
                    date = %scanned.date,
                    cache = ?scanned.cache,
                    kept = scanned.lines.len(),
                    lines_so_far = records.len(),
                    "Scanned log"
                );
                let date = scanned.date;
                records.extend(scanned.lines.into_iter().map(|line| LogRecord::new(line, date)));
            }
        }

        info!(
            target: "live_stats::scan",
            files = files_scanned,
            cache_hits,
            lines = records.len(),
            elapsed_ms = timer.stop(),
            "Log scan complete"
        );
        Ok(records)
    }

    /// Tracked lines of one log, from its cache file when present
    pub fn scan_file(&self, path: &Path) -> ScanResult<ScannedFile> {
        let date = self.names.log_date(path)?;
        let cache_path = self.cache.path_for(path, date);

        if let Some(lines) = self.cache.load(&cache_path)? {
            return Ok(ScannedFile {
                date,
                lines,
                cache: CacheStatus::Hit,
            });
        }

        let text = decompress(path)?;
        let lines = self.filter_lines(&text);
        self.cache.store(&cache_path, &lines)?;
        trace!(
            target: "live_stats::scan",
            cache = %cache_path.display(),
            kept = lines.len(),
            "Cache file written"
        );

        Ok(ScannedFile {
            date,
            lines,
            cache: CacheStatus::Miss,
        })
    }

    pub fn filter_lines(&self, text: &str) -> Vec<String> {
        text.lines()
            .filter(|line| self.matcher.is_tracked_line(line))
            .map(str::to_owned)
            .collect()
    }
}

// ============================================================================
// SECTION 11: DEPLOYMENT AGGREGATION
// ============================================================================

/// One deployment of one product
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Deployment {
    pub uuid: String,
    pub product: String,
    #[serde(flatten)]
    pub metadata: DeploymentMetadata,
}

/// Result of folding the scanned records for one product
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProductAggregation {
    pub product: String,
    /// Exactly one entry per UUID
    pub deployments: BTreeMap<String, Deployment>,
    /// Newest log date among every record examined, matched or not
    pub latest_log_date: Option<LogDate>,
}

/// Fold scanned records into one deployment per UUID for `product`.
///
/// Lines may have been kept by the scanner for a different product, so the
/// identifier is checked against this product's pattern again. First/last
/// seen dates come out the same whatever order `records` is in.
pub fn aggregate_deployments(records: &[LogRecord], product: &CompiledProduct) -> ProductAggregation {
    let timer = StageTimer::new("aggregate");
    let mut deployments: BTreeMap<String, Deployment> = BTreeMap::new();
    let mut latest_log_date: Option<LogDate> = None;
    let mut skipped = 0usize;
    let mut kept = 0usize;

    for record in records {
        latest_log_date = latest_log_date.max(Some(record.date));

        let Some(uuid) = find_uuid(&record.line) else {
            skipped += 1;
            continue;
        };

        let metadata = match extract_metadata(&record.line, record.date) {
            Some(metadata) if product.matches_app(&metadata.app) => metadata,
            _ => {
                skipped += 1;
                continue;
            }
        };

        kept += 1;
        match deployments.entry(uuid.to_owned()) {
            Entry::Vacant(slot) => {
                slot.insert(Deployment {
                    uuid: uuid.to_owned(),
                    product: product.name().to_owned(),
                    metadata,
                });
            }
            Entry::Occupied(mut slot) => slot.get_mut().metadata.observe(record.date),
        }
    }

    info!(
        target: "live_stats::aggregate",
        product = product.name(),
        uuids = deployments.len(),
        kept,
        skipped,
        elapsed_ms = timer.stop(),
        "Found UUIDs"
    );

    ProductAggregation {
        product: product.name().to_owned(),
        deployments,
        latest_log_date,
    }
}

// ============================================================================
// SECTION 12: ACTIVITY CLASSIFICATION
// ============================================================================

// ----------------------------------------------------------------------------
// 12.1 Classified Deployment
// ----------------------------------------------------------------------------

/// A deployment with its derived activity fields
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClassifiedDeployment {
    #[serde(flatten)]
    pub deployment: Deployment,
    pub active: bool,
    pub lifespan_days: i64,
}

impl ClassifiedDeployment {
    /// Derive lifespan and activity. Active means last seen at most
    /// [`ACTIVE_MAX_GAP_DAYS`] before `latest_log_date`.
    pub fn classify(deployment: Deployment, latest_log_date: LogDate) -> Self {
        let lifespan_days = deployment.metadata.lifespan_days();
        let active = deployment.metadata.last_seen.days_until(latest_log_date) <= ACTIVE_MAX_GAP_DAYS;
        Self {
            deployment,
            active,
            lifespan_days,
        }
    }

    pub fn product(&self) -> &str {
        &self.deployment.product
    }

    pub fn cloud(&self) -> &str {
        &self.deployment.metadata.cloud
    }

    pub fn first_seen(&self) -> LogDate {
        self.deployment.metadata.first_seen
    }

    pub fn is_long_lasting(&self) -> bool {
        self.lifespan_days > LONG_LASTING_MIN_DAYS
    }
}

// ----------------------------------------------------------------------------
// 12.2 Time Windows
// ----------------------------------------------------------------------------

/// Trailing windows over the first-seen date. They nest, so a deployment
/// in the one-month window is also in the wider two.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TimeWindow {
    SixMonths,
    ThreeMonths,
    OneMonth,
}

impl TimeWindow {
    /// Registration order, widest first
    pub const ALL: [TimeWindow; 3] = [TimeWindow::SixMonths, TimeWindow::ThreeMonths, TimeWindow::OneMonth];

    pub fn days(&self) -> i64 {
        match self {
            TimeWindow::SixMonths => 180,
            TimeWindow::ThreeMonths => 90,
            TimeWindow::OneMonth => 30,
        }
    }

    /// Suffix used in gauge names
    pub fn label(&self) -> &'static str {
        match self {
            TimeWindow::SixMonths => "six_months",
            TimeWindow::ThreeMonths => "three_months",
            TimeWindow::OneMonth => "one_month",
        }
    }

    pub fn contains(&self, first_seen: LogDate, today: NaiveDate) -> bool {
        today.signed_duration_since(first_seen.as_naive()).num_days() <= self.days()
    }
}

impl Display for TimeWindow {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Deployments per window; a deployment may sit in several
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WindowBuckets {
    buckets: BTreeMap<TimeWindow, Vec<ClassifiedDeployment>>,
}

impl WindowBuckets {
    pub fn assign(deployments: &[ClassifiedDeployment], today: NaiveDate) -> Self {
        let buckets: BTreeMap<_, _> = TimeWindow::ALL
            .into_iter()
            .map(|window| {
                let members: Vec<_> = deployments
                    .iter()
                    .filter(|d| window.contains(d.first_seen(), today))
                    .cloned()
                    .collect();
                (window, members)
            })
            .collect();
        Self { buckets }
    }

    pub fn get(&self, window: TimeWindow) -> &[ClassifiedDeployment] {
        self.buckets.get(&window).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Windows in registration order with their members
    pub fn iter(&self) -> impl Iterator<Item = (TimeWindow, &[ClassifiedDeployment])> + '_ {
        TimeWindow::ALL.into_iter().map(move |window| (window, self.get(window)))
    }
}

// ----------------------------------------------------------------------------
// 12.3 Product Classification
// ----------------------------------------------------------------------------

/// Everything the registrar needs for one product
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassifiedProduct {
    pub product: String,
    pub deployments: Vec<ClassifiedDeployment>,
    pub windows: WindowBuckets,
}

impl ClassifiedProduct {
    pub fn active_count(&self) -> usize {
        self.deployments.iter().filter(|d| d.active).count()
    }
}

impl ProductAggregation {
    /// Finalize every deployment against the newest log date and bucket it by
    /// first sighting relative to `today`.
    pub fn classify(self, today: NaiveDate) -> ClassifiedProduct {
        let deployments: Vec<ClassifiedDeployment> = match self.latest_log_date {
            Some(latest) => self
                .deployments
                .into_values()
                .map(|d| ClassifiedDeployment::classify(d, latest))
                .collect(),
            None => Vec::new(),
        };

        for deployment in &deployments {
            if let Ok(record) = serde_json::to_string(deployment) {
                trace!(target: "live_stats::aggregate", record = %record, "Deployment classified");
            }
        }

        let windows = WindowBuckets::assign(&deployments, today);
        ClassifiedProduct {
            product: self.product,
            deployments,
            windows,
        }
    }
}

// ============================================================================
// SECTION 13: SCAN & AGGREGATION TESTS
// ============================================================================


// ============================================================================
// SECTION 14: METRIC REGISTRATION
// ============================================================================
// Gauge names:
//   <ns>_<product>_active{active="True"}            <ns>_<product>_active_<cloud>{...}
//   <ns>_<product>_<window>                         <ns>_<product>_<cloud>_<window>
//   <ns>_longlasting_<product>_<window>             <ns>_longlasting_<product>_<cloud>_<window>
// Every call registers fresh gauges; registering a name twice in the same
// registry is an error from the registry itself.
// ============================================================================

/// Registers per-product gauges into a shared registry
#[derive(Clone, Copy)]
pub struct MetricRegistrar<'a> {
    registry: &'a PrometheusRegistry,
    namespace: &'a str,
    clouds: &'a [String],
}

impl<'a> MetricRegistrar<'a> {
    pub fn new(registry: &'a PrometheusRegistry, namespace: &'a str, clouds: &'a [String]) -> Self {
        Self {
            registry,
            namespace,
            clouds,
        }
    }

    /// Active deployment counts, overall and per cloud.
    ///
    /// Registers nothing for an empty collection. Returns the number of
    /// gauges registered.
    pub fn register_active_data(&self, data: &[ClassifiedDeployment]) -> MetricsResult<usize> {
        let Some(product) = homogeneous_product(data)? else {
            return Ok(0);
        };
        let ns = self.namespace;

        let all = self.flag_gauge(
            format!("{}_{}_active", ns, product),
            format!("Active deployment in all clouds of {}", product),
        )?;
        all.with_label_values(&[ACTIVE_LABEL_VALUE])
            .set(count_where(data, |d| d.active));
        let mut registered = 1;

        for cloud in self.clouds {
            let in_cloud = self.flag_gauge(
                format!("{}_{}_active_{}", ns, product, cloud),
                format!("Active deployments in {} of {}", cloud, product),
            )?;
            in_cloud
                .with_label_values(&[ACTIVE_LABEL_VALUE])
                .set(count_where(data, |d| d.active && d.cloud() == cloud.as_str()));
            registered += 1;
        }

        debug!(target: "live_stats::metrics", product, gauges = registered, "Registered active gauges");
        Ok(registered)
    }

    /// Deployment and long-lasting deployment counts for one window, overall
    /// and per cloud. Registers nothing for an empty collection.
    pub fn register_period(&self, data: &[ClassifiedDeployment], window: TimeWindow) -> MetricsResult<usize> {
        let Some(product) = homogeneous_product(data)? else {
            return Ok(0);
        };
        let ns = self.namespace;
        let label = window.label();

        let all = self.int_gauge(
            format!("{}_{}_{}", ns, product, label),
            format!("Deployment in all clouds of {}", product),
        )?;
        all.set(data.len() as i64);

        let long_lasting = self.int_gauge(
            format!("{}_longlasting_{}_{}", ns, product, label),
            format!("Deployment in all clouds with lifespan greater than 2 weeks of {}", product),
        )?;
        long_lasting.set(count_where(data, ClassifiedDeployment::is_long_lasting));
        let mut registered = 2;

        for cloud in self.clouds {
            let in_cloud = self.int_gauge(
                format!("{}_{}_{}_{}", ns, product, cloud, label),
                format!("Deployments in {} for {}", cloud, label),
            )?;
            in_cloud.set(count_where(data, |d| d.cloud() == cloud.as_str()));

            let long_in_cloud = self.int_gauge(
                format!("{}_longlasting_{}_{}_{}", ns, product, cloud, label),
                format!("Deployments in {} for {} with lifespan greater than 2 weeks", cloud, label),
            )?;
            long_in_cloud.set(count_where(data, |d| d.is_long_lasting() && d.cloud() == cloud.as_str()));
            registered += 2;
        }

        debug!(target: "live_stats::metrics", product, window = label, gauges = registered, "Registered period gauges");
        Ok(registered)
    }

    /// Active gauges, then every window widest first
    pub fn register_product(&self, product: &ClassifiedProduct) -> MetricsResult<usize> {
        let mut registered = self.register_active_data(&product.deployments)?;
        for (window, members) in product.windows.iter() {
            registered += self.register_period(members, window)?;
        }
        Ok(registered)
    }

    fn int_gauge(&self, name: String, help: String) -> MetricsResult<IntGauge> {
        let gauge = IntGauge::with_opts(Opts::new(name, help))?;
        self.registry.register(Box::new(gauge.clone()))?;
        Ok(gauge)
    }

    fn flag_gauge(&self, name: String, help: String) -> MetricsResult<IntGaugeVec> {
        let gauge = IntGaugeVec::new(Opts::new(name, help), &[ACTIVE_LABEL])?;
        self.registry.register(Box::new(gauge.clone()))?;
        Ok(gauge)
    }
}

impl Debug for MetricRegistrar<'_> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("MetricRegistrar")
            .field("namespace", &self.namespace)
            .field("clouds", &self.clouds)
            .finish()
    }
}

/// The single product of `data`, `None` when empty
fn homogeneous_product(data: &[ClassifiedDeployment]) -> MetricsResult<Option<&str>> {
    let Some(first) = data.first() else {
        return Ok(None);
    };
    if let Some(other) = data.iter().find(|d| d.product() != first.product()) {
        return Err(MetricsError::MixedProducts {
            expected: first.product().to_string(),
            found: other.product().to_string(),
        });
    }
    Ok(Some(first.product()))
}

fn count_where<F>(data: &[ClassifiedDeployment], predicate: F) -> i64
where
    F: Fn(&ClassifiedDeployment) -> bool,
{
    data.iter().filter(|d| predicate(d)).count() as i64
}

// ============================================================================
// SECTION 15: EXPORT & PUSH
// ============================================================================

/// Render the registry in the Prometheus text exposition format
pub fn encode_text(registry: &PrometheusRegistry) -> MetricsResult<String> {
    let mut buffer = Vec::new();
    TextEncoder::new()
        .encode(&registry.gather(), &mut buffer)
        .map_err(|e| MetricsError::Encoding { message: e.to_string() })?;
    String::from_utf8(buffer).map_err(|e| MetricsError::Encoding { message: e.to_string() })
}

/// Push the whole registry to the configured gateway in one request
#[cfg(feature = "push")]
pub fn push_registry(registry: &PrometheusRegistry, config: &PushConfig) -> Result<(), PushError> {
    let gateway = config
        .gateway
        .as_deref()
        .filter(|g| !g.trim().is_empty())
        .ok_or(PushError::MissingGateway)?;

    let mut grouping = std::collections::HashMap::new();
    grouping.insert("package".to_string(), config.package.clone());

    let auth = match (&config.username, &config.password) {
        (Some(username), Some(password)) => Some(prometheus::BasicAuthentication {
            username: username.clone(),
            password: password.clone(),
        }),
        _ => None,
    };

    let families = registry.gather();
    let count = families.len();
    prometheus::push_metrics(&config.job, grouping, gateway, families, auth).map_err(|source| {
        PushError::Gateway {
            gateway: gateway.to_string(),
            source,
        }
    })?;

    info!(
        target: "live_stats::push",
        gateway,
        job = %config.job,
        package = %config.package,
        families = count,
        "Registry pushed"
    );
    Ok(())
}

#[cfg(not(feature = "push"))]
pub fn push_registry(_registry: &PrometheusRegistry, _config: &PushConfig) -> Result<(), PushError> {
    Err(PushError::Disabled)
}

// ============================================================================
// SECTION 16: BATCH PIPELINE
// ============================================================================

/// Per-product outcome of a run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProductReport {
    pub product: String,
    pub deployments: usize,
    pub active: usize,
    pub gauges: usize,
}

/// Outcome of a run: the populated registry plus counts for logging
pub struct BatchReport {
    pub registry: PrometheusRegistry,
    pub records: usize,
    pub products: Vec<ProductReport>,
}

impl Debug for BatchReport {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("BatchReport")
            .field("records", &self.records)
            .field("products", &self.products)
            .finish()
    }
}

/// The batch job: one scan, then aggregate/classify/register per product
#[derive(Debug)]
pub struct LiveStats {
    config: StatsConfig,
    matcher: ProductMatcher,
}

impl LiveStats {
    pub fn new(config: StatsConfig) -> StatsResult<Self> {
        config.validate()?;
        let matcher = ProductMatcher::new(&config.products)?;
        Ok(Self { config, matcher })
    }

    pub fn config(&self) -> &StatsConfig {
        &self.config
    }

    /// Run the whole batch into a fresh registry. Windows are measured back
    /// from `today`. Nothing is returned unless every log was read.
    pub fn run(&self, today: NaiveDate) -> StatsResult<BatchReport> {
        let timer = StageTimer::new("batch");
        let records = LogScanner::new(&self.config, &self.matcher).scan()?;

        let registry = PrometheusRegistry::new();
        let registrar = MetricRegistrar::new(&registry, &self.config.metrics.namespace, &self.config.clouds);

        let mut products = Vec::with_capacity(self.matcher.products().len());
        for product in self.matcher.products() {
            let classified = aggregate_deployments(&records, product).classify(today);
            let gauges = registrar.register_product(&classified)?;

            if gauges == 0 {
                info!(target: "live_stats::metrics", product = product.name(), "No deployments, nothing registered");
            } else {
                info!(
                    target: "live_stats::metrics",
                    product = product.name(),
                    deployments = classified.deployments.len(),
                    gauges,
                    "Done with registering"
                );
            }

            products.push(ProductReport {
                product: classified.product.clone(),
                deployments: classified.deployments.len(),
                active: classified.active_count(),
                gauges,
            });
        }

        info!(
            target: "live_stats::metrics",
            records = records.len(),
            products = products.len(),
            elapsed_ms = timer.stop(),
            "Batch complete"
        );

        Ok(BatchReport {
            registry,
            records: records.len(),
            products,
        })
    }

    /// Hand the run's registry to the push gateway
    pub fn publish(&self, report: &BatchReport) -> StatsResult<()> {
        push_registry(&report.registry, &self.config.push)?;
        Ok(())
    }
}

// ============================================================================
// SECTION 17: CLI & COMMAND LINE INTERFACE
// ============================================================================

// ----------------------------------------------------------------------------
// 17.1 CLI Argument Parser
// ----------------------------------------------------------------------------

/// Deployment live stats CLI
#[derive(Parser, Debug)]
#[command(
    name = "live-stats",
    author = "AIOps Team",
    version,
    about = "Scan access logs for tracked deployments and push lifespan gauges"
)]
pub struct Cli {
    /// Configuration file path (defaults plus environment when missing)
    #[arg(short, long, default_value = DEFAULT_CONFIG_PATH, env = "LIVE_STATS_CONFIG")]
    pub config: PathBuf,

    /// Log level override
    #[arg(short, long, env = "LIVE_STATS_LOG_LEVEL")]
    pub log_level: Option<String>,

    /// Print gauges in text exposition format instead of pushing them
    #[arg(long)]
    pub dry_run: bool,

    /// Subcommand to run
    #[command(subcommand)]
    pub command: Option<Commands>,
}

/// Available subcommands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Scan, aggregate and publish (the default)
    Run,

    /// Validate configuration file
    Validate {
        /// Show full parsed configuration
        #[arg(short, long)]
        verbose: bool,
    },

    /// Generate default configuration file
    GenerateConfig {
        /// Output path (default: stdout)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

// ----------------------------------------------------------------------------
// 17.2 CLI Handler Functions
// ----------------------------------------------------------------------------

/// Configuration from `path`, or defaults plus environment when it is absent.
/// The flag tells whether the file was used.
fn load_config(path: &Path) -> StatsResult<(StatsConfig, bool)> {
    if path.exists() {
        Ok((StatsConfig::load(path)?, true))
    } else {
        Ok((StatsConfig::from_env()?, false))
    }
}

/// Handle the validate subcommand
fn handle_validate(config_path: &Path, verbose: bool) -> StatsResult<()> {
    println!("Validating configuration file: {}", config_path.display());

    match load_config(config_path) {
        Ok((config, from_file)) => {
            println!("✅ Configuration is valid!");
            if !from_file {
                println!("   (file not found, defaults and environment only)");
            }

            if verbose {
                println!("\n📋 Parsed configuration:");
                println!("{}", "=".repeat(60));
                match toml::to_string_pretty(&config) {
                    Ok(s) => println!("{}", s),
                    Err(e) => println!("Failed to serialize: {}", e),
                }
            }

            println!("\n📊 Configuration Summary:");
            println!("  • Log sources: {}", config.sources.patterns.len());
            println!("  • Products tracked: {}", config.products.len());
            println!("  • Clouds: {}", config.clouds.join(", "));
            println!("  • Gauge namespace: {}", config.metrics.namespace);
            println!(
                "  • Push gateway: {}",
                config.push.gateway.as_deref().unwrap_or("<not set>")
            );
            Ok(())
        }
        Err(e) => {
            println!("❌ Configuration validation failed!");
            println!("Error: {}", e);
            Err(e)
        }
    }
}

/// Handle the generate-config subcommand
fn handle_generate_config(output: Option<&Path>) -> StatsResult<()> {
    let config_str = StatsConfig::generate_default_config()?;

    match output {
        Some(path) => {
            fs::write(path, &config_str)?;
            println!("✅ Default configuration written to: {}", path.display());
        }
        None => {
            println!("{}", config_str);
        }
    }

    Ok(())
}

// ============================================================================
// SECTION 18: MAIN ENTRY POINT
// ============================================================================

/// Main entry point: one blocking batch run
fn main() -> AnyhowResult<()> {
    let cli = Cli::parse();

    match &cli.command {
        Some(Commands::GenerateConfig { output }) => {
            handle_generate_config(output.as_deref())?;
            return Ok(());
        }
        Some(Commands::Validate { verbose }) => {
            handle_validate(&cli.config, *verbose)?;
            return Ok(());
        }
        Some(Commands::Run) | None => {}
    }

    let (config, from_file) = load_config(&cli.config)
        .with_context(|| format!("Failed to load config from {}", cli.config.display()))?;

    let mut logging_config = config.logging.clone();
    if let Some(level) = &cli.log_level {
        logging_config.level = level.clone();
    }
    init_logging(&logging_config)?;

    info!("{} v{}", STATS_NAME, STATS_VERSION);
    if !from_file {
        warn!("Config file not found at {}, using defaults", cli.config.display());
    }

    let stats = LiveStats::new(config)?;
    let today = Local::now().date_naive();
    let report = stats.run(today).context("Stats run aborted, nothing pushed")?;

    for product in &report.products {
        info!(
            product = %product.product,
            deployments = product.deployments,
            active = product.active,
            gauges = product.gauges,
            "Product summary"
        );
    }

    if cli.dry_run {
        print!("{}", encode_text(&report.registry)?);
    } else {
        stats.publish(&report).context("Failed to push metrics")?;
    }

    Ok(())
}

// ============================================================================
// SECTION 19: REGISTRATION & PIPELINE TESTS
// ============================================================================

#[cfg(test)]
mod pipeline_tests {
    use super::fixtures::*;
    use super::*;
    use pretty_assertions::assert_eq;

    fn clouds() -> Vec<String> {
        vec!["maas".to_string(), "ec2".to_string()]
    }

    fn deployment(uuid: &str, cloud: &str, first: &str, last: &str, latest: &str) -> ClassifiedDeployment {
        let mut metadata = extract_metadata(&access_line(uuid, SPARK_APP, cloud), date(first)).unwrap();
        metadata.observe(date(last));
        ClassifiedDeployment::classify(
            Deployment {
                uuid: uuid.into(),
                product: "spark".into(),
                metadata,
            },
            date(latest),
        )
    }

    fn gauge_value(registry: &PrometheusRegistry, name: &str) -> Option<f64> {
        registry
            .gather()
            .into_iter()
            .find(|family| family.get_name() == name)
            .map(|family| family.get_metric()[0].get_gauge().get_value())
    }

    #[test]
    fn test_empty_collection_registers_nothing() {
        let registry = PrometheusRegistry::new();
        let clouds = clouds();
        let registrar = MetricRegistrar::new(&registry, DEFAULT_METRIC_NAMESPACE, &clouds);

        assert_eq!(registrar.register_active_data(&[]).unwrap(), 0);
        assert_eq!(registrar.register_period(&[], TimeWindow::OneMonth).unwrap(), 0);
        assert!(registry.gather().is_empty());
    }

    #[test]
    fn test_per_cloud_counts_sum_to_overall() {
        let registry = PrometheusRegistry::new();
        let clouds = clouds();
        let registrar = MetricRegistrar::new(&registry, DEFAULT_METRIC_NAMESPACE, &clouds);
        let data = vec![
            deployment(UUID_A, "maas", "20190101", "20190120", "20190120"),
            deployment(UUID_B, "ec2", "20190110", "20190110", "20190120"),
        ];

        assert_eq!(registrar.register_active_data(&data).unwrap(), 3);
        assert_eq!(registrar.register_period(&data, TimeWindow::OneMonth).unwrap(), 6);

        let active_maas = gauge_value(&registry, "live_big_deployments_spark_active_maas").unwrap();
        let active_ec2 = gauge_value(&registry, "live_big_deployments_spark_active_ec2").unwrap();
        assert_eq!(active_maas, 1.0);
        assert_eq!(active_ec2, 0.0);
        assert_eq!(gauge_value(&registry, "live_big_deployments_spark_active"), Some(1.0));

        let maas = gauge_value(&registry, "live_big_deployments_spark_maas_one_month").unwrap();
        let ec2 = gauge_value(&registry, "live_big_deployments_spark_ec2_one_month").unwrap();
        let all = gauge_value(&registry, "live_big_deployments_spark_one_month").unwrap();
        assert_eq!(maas + ec2, all);
        assert_eq!(all, 2.0);

        // 20 day lifespan on maas, 1 day on ec2
        assert_eq!(gauge_value(&registry, "live_big_deployments_longlasting_spark_one_month"), Some(1.0));
        assert_eq!(gauge_value(&registry, "live_big_deployments_longlasting_spark_maas_one_month"), Some(1.0));
        assert_eq!(gauge_value(&registry, "live_big_deployments_longlasting_spark_ec2_one_month"), Some(0.0));
    }

    #[test]
    fn test_active_gauge_carries_label() {
        let registry = PrometheusRegistry::new();
        let clouds = clouds();
        MetricRegistrar::new(&registry, "kpi", &clouds)
            .register_active_data(&[deployment(UUID_A, "ec2", "20190101", "20190101", "20190101")])
            .unwrap();

        let family = registry
            .gather()
            .into_iter()
            .find(|f| f.get_name() == "kpi_spark_active")
            .unwrap();
        let label = &family.get_metric()[0].get_label()[0];
        assert_eq!(label.get_name(), ACTIVE_LABEL);
        assert_eq!(label.get_value(), ACTIVE_LABEL_VALUE);
    }

    #[test]
    fn test_gauge_names_are_never_reused() {
        let registry = PrometheusRegistry::new();
        let clouds = clouds();
        let registrar = MetricRegistrar::new(&registry, DEFAULT_METRIC_NAMESPACE, &clouds);
        let data = vec![deployment(UUID_A, "maas", "20190101", "20190101", "20190101")];

        registrar.register_period(&data, TimeWindow::SixMonths).unwrap();
        let again = registrar.register_period(&data, TimeWindow::SixMonths);
        assert!(matches!(again, Err(MetricsError::Registration(_))));

        // a different window is a different set of names
        registrar.register_period(&data, TimeWindow::ThreeMonths).unwrap();
    }

    #[test]
    fn test_mixed_products_are_rejected() {
        let registry = PrometheusRegistry::new();
        let clouds = clouds();
        let registrar = MetricRegistrar::new(&registry, DEFAULT_METRIC_NAMESPACE, &clouds);
        let mut other = deployment(UUID_B, "ec2", "20190101", "20190101", "20190101");
        other.deployment.product = "kafka".into();
        let data = vec![deployment(UUID_A, "maas", "20190101", "20190101", "20190101"), other];

        let err = registrar.register_active_data(&data).unwrap_err();
        assert!(matches!(err, MetricsError::MixedProducts { .. }));
        assert!(registry.gather().is_empty());
    }

    #[test]
    fn test_batch_run_end_to_end() {
        let dir = tempfile::tempdir().unwrap();
        write_gz(
            dir.path(),
            "api.jujucharms.com.log-20190101.anon.gz",
            &[
                access_line(UUID_A, SPARK_APP, "ec2"),
                access_line(UUID_B, MYSQL_APP, "maas"),
                "GET /v5/meta/any?id=cs%3Axenial%2Fspark-12&include=id".to_string(),
            ],
        );
        write_gz(
            dir.path(),
            "api.jujucharms.com.log-20190110.anon.gz",
            &[access_line(UUID_A, SPARK_APP, "ec2"), access_line(UUID_B, SPARK_APP, "maas")],
        );

        let stats = LiveStats::new(config_for(dir.path(), &["spark", "kafka"])).unwrap();
        let today = NaiveDate::from_ymd_opt(2019, 1, 20).unwrap();
        let report = stats.run(today).unwrap();

        assert_eq!(report.records, 3);
        assert_eq!(
            report.products,
            vec![
                ProductReport { product: "spark".into(), deployments: 2, active: 2, gauges: 56 },
                ProductReport { product: "kafka".into(), deployments: 0, active: 0, gauges: 0 },
            ]
        );

        let registry = &report.registry;
        assert_eq!(gauge_value(registry, "live_big_deployments_spark_active"), Some(2.0));
        assert_eq!(gauge_value(registry, "live_big_deployments_spark_active_ec2"), Some(1.0));
        assert_eq!(gauge_value(registry, "live_big_deployments_spark_active_maas"), Some(1.0));
        assert_eq!(gauge_value(registry, "live_big_deployments_spark_six_months"), Some(2.0));
        assert_eq!(gauge_value(registry, "live_big_deployments_spark_ec2_one_month"), Some(1.0));
        assert_eq!(gauge_value(registry, "live_big_deployments_longlasting_spark_one_month"), Some(0.0));
        assert!(registry
            .gather()
            .iter()
            .all(|family| !family.get_name().contains("kafka")));

        let exposition = encode_text(registry).unwrap();
        assert!(exposition.contains("live_big_deployments_spark_active{active=\"True\"} 2"));

        // second run is served entirely from the cache files
        let rerun = stats.run(today).unwrap();
        assert_eq!(rerun.products, report.products);
        assert_eq!(encode_text(&rerun.registry).unwrap(), exposition);
    }

    #[test]
    fn test_batch_run_aborts_on_corrupt_log() {
        let dir = tempfile::tempdir().unwrap();
        write_gz(
            dir.path(),
            "api.jujucharms.com.log-20190101.gz",
            &[access_line(UUID_A, SPARK_APP, "ec2")],
        );
        fs::write(dir.path().join("api.jujucharms.com.log-20190102.gz"), b"truncated").unwrap();

        let stats = LiveStats::new(config_for(dir.path(), &["spark"])).unwrap();
        let err = stats.run(NaiveDate::from_ymd_opt(2019, 1, 20).unwrap()).unwrap_err();
        assert!(matches!(err, StatsError::Scan(ScanError::Decompress { .. })));
        assert_eq!(err.category(), "scan");
    }

    #[test]
    fn test_invalid_config_is_rejected_up_front() {
        let mut config = StatsConfig::default();
        config.products.push(ProductSpec::new("broken", "(unclosed"));
        assert!(matches!(LiveStats::new(config), Err(StatsError::Config(_))));
    }

    #[cfg(feature = "push")]
    #[test]
    fn test_push_requires_gateway() {
        let registry = PrometheusRegistry::new();
        let err = push_registry(&registry, &PushConfig::default()).unwrap_err();
        assert!(matches!(err, PushError::MissingGateway));
    }
}
