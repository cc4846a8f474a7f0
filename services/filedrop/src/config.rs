use serde::Deserialize;
use std::time::Duration;
use thiserror::Error;

/// Smallest part S3 accepts for every part of a multipart upload except the last.
pub const MIN_S3_PART_SIZE: usize = 5 * 1024 * 1024;

/// Errors raised while validating configuration
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Missing required configuration: {0}")]
    MissingRequired(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Main configuration for the filedrop service
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Service configuration
    #[serde(default)]
    pub service: ServiceConfig,
    /// TCP ingestion configuration
    #[serde(default)]
    pub ingest: IngestConfig,
    /// HTTP gateway configuration
    #[serde(default)]
    pub http: HttpConfig,
    /// Object store configuration
    #[serde(default)]
    pub storage: StorageConfig,
    /// Shutdown behaviour
    #[serde(default)]
    pub shutdown: ShutdownConfig,
}

/// Service-level configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    /// Service name for logging/metrics
    #[serde(default = "default_service_name")]
    pub name: String,
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Log output format (json or pretty)
    #[serde(default = "default_log_format")]
    pub log_format: String,
    /// Prometheus exporter port (0 disables the exporter)
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,
}

/// Layout of the upload header sent by clients.
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum FrameLayout {
    /// `nameLen | name | clientIdLen | clientId | content`
    #[default]
    NameAndClientId,
    /// Legacy senders: `nameLen | name | content`
    NameOnly,
}

/// TCP ingestion listener configuration
#[derive(Debug, Clone, Deserialize)]
pub struct IngestConfig {
    /// Listen address
    #[serde(default = "default_ingest_host")]
    pub host: String,
    /// Listen port
    #[serde(default = "default_ingest_port")]
    pub port: u16,
    /// Header layout expected from clients
    #[serde(default)]
    pub frame_layout: FrameLayout,
    /// Upper bound for the client identifier length field
    #[serde(default = "default_max_client_id_len")]
    pub max_client_id_len: u32,
    /// Size of the reusable buffer used to stream content into storage
    #[serde(default = "default_copy_buffer_bytes")]
    pub copy_buffer_bytes: usize,
    /// Maximum sessions running at once (0 = unlimited)
    #[serde(default)]
    pub max_concurrent_sessions: usize,
    /// Longest a connection may go without sending data, in seconds (0 = wait forever)
    #[serde(default, alias = "read_timeout_secs")]
    pub idle_timeout_secs: u64,
    /// Upper bound on a whole session, header through close, in seconds (0 = unbounded)
    #[serde(default)]
    pub session_timeout_secs: u64,
}

/// HTTP gateway configuration
#[derive(Debug, Clone, Deserialize)]
pub struct HttpConfig {
    /// Listen address
    #[serde(default = "default_http_host")]
    pub host: String,
    /// Listen port
    #[serde(default = "default_http_port")]
    pub port: u16,
    /// Login username
    #[serde(default = "default_credential")]
    pub username: String,
    /// Login password
    #[serde(default = "default_credential")]
    pub password: String,
    /// Lifetime of a login session in seconds
    #[serde(default = "default_session_ttl_secs")]
    pub session_ttl_secs: u64,
}

/// Which object store implementation backs the gateway
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum StorageBackend {
    #[default]
    S3,
    Memory,
}

/// Object store configuration
#[derive(Debug, Clone, Deserialize, Default)]
pub struct StorageConfig {
    /// Backend selection
    #[serde(default)]
    pub backend: StorageBackend,
    /// S3 settings, required when `backend = "s3"`
    #[serde(default)]
    pub s3: S3Config,
}

/// S3 storage configuration
#[derive(Debug, Clone, Deserialize)]
pub struct S3Config {
    /// S3 bucket name for uploaded files
    #[serde(default)]
    pub bucket: String,
    /// AWS region
    #[serde(default = "default_region")]
    pub region: String,
    /// Custom endpoint URL (for MinIO, LocalStack, etc.)
    pub endpoint_url: Option<String>,
    /// Force path-style access (required for MinIO)
    #[serde(default)]
    pub force_path_style: bool,
    /// Key prefix under which uploads are stored
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
    /// Part size for multipart uploads in bytes (5MB minimum)
    #[serde(default = "default_part_size")]
    pub part_size_bytes: usize,
}

/// Shutdown configuration
#[derive(Debug, Clone, Deserialize, Default)]
pub struct ShutdownConfig {
    /// How long to wait for in-flight work after the listeners stop (0 = don't wait)
    #[serde(default)]
    pub drain_timeout_secs: u64,
}

// Default value functions
fn default_service_name() -> String {
    "filedrop".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "json".to_string()
}

fn default_metrics_port() -> u16 {
    9090
}

fn default_ingest_host() -> String {
    "0.0.0.0".to_string()
}

fn default_ingest_port() -> u16 {
    55000
}

fn default_max_client_id_len() -> u32 {
    4096
}

fn default_copy_buffer_bytes() -> usize {
    32 * 1024
}

fn default_http_host() -> String {
    "0.0.0.0".to_string()
}

fn default_http_port() -> u16 {
    5000
}

fn default_credential() -> String {
    "root".to_string()
}

fn default_session_ttl_secs() -> u64 {
    24 * 60 * 60
}

fn default_region() -> String {
    "us-east-1".to_string()
}

fn default_key_prefix() -> String {
    "uploads/".to_string()
}

fn default_part_size() -> usize {
    MIN_S3_PART_SIZE
}

impl Config {
    /// Load configuration from environment and config files
    pub fn load() -> anyhow::Result<Self> {
        let config = config::Config::builder()
            // Add config file if present
            .add_source(config::File::with_name("config/filedrop").required(false))
            .add_source(config::File::with_name("/etc/filedrop/filedrop").required(false))
            // Override with environment variables
            // FILEDROP__STORAGE__S3__BUCKET -> storage.s3.bucket
            .add_source(
                config::Environment::with_prefix("FILEDROP")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: Self = config.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.ingest.copy_buffer_bytes == 0 {
            return Err(ConfigError::InvalidValue {
                key: "ingest.copy_buffer_bytes".to_string(),
                message: "must be greater than zero".to_string(),
            });
        }

        if self.http.username.is_empty() || self.http.password.is_empty() {
            return Err(ConfigError::MissingRequired(
                "http.username and http.password".to_string(),
            ));
        }

        if self.http.session_ttl_secs == 0 {
            return Err(ConfigError::InvalidValue {
                key: "http.session_ttl_secs".to_string(),
                message: "must be greater than zero".to_string(),
            });
        }

        if self.storage.backend == StorageBackend::S3 {
            if self.storage.s3.bucket.is_empty() {
                return Err(ConfigError::MissingRequired(
                    "storage.s3.bucket (required for the s3 backend)".to_string(),
                ));
            }
            if self.storage.s3.part_size_bytes < MIN_S3_PART_SIZE {
                return Err(ConfigError::InvalidValue {
                    key: "storage.s3.part_size_bytes".to_string(),
                    message: format!("must be at least {} bytes", MIN_S3_PART_SIZE),
                });
            }
        }

        Ok(())
    }

    /// Whether the login credentials are still the built-in defaults
    pub fn uses_default_credentials(&self) -> bool {
        self.http.username == default_credential() && self.http.password == default_credential()
    }

    /// Ingestion listen address
    pub fn ingest_addr(&self) -> String {
        self.ingest.listen_addr()
    }

    /// HTTP listen address
    pub fn http_addr(&self) -> String {
        self.http.listen_addr()
    }

    /// Get session lifetime as Duration
    pub fn session_ttl(&self) -> Duration {
        Duration::from_secs(self.http.session_ttl_secs)
    }

    /// Get the drain timeout as Duration, `None` when shutdown should not wait
    pub fn drain_timeout(&self) -> Option<Duration> {
        secs_to_duration(self.shutdown.drain_timeout_secs)
    }
}

impl IngestConfig {
    /// `host:port` the ingest listener binds to
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Get the idle timeout, `None` when reads may block indefinitely
    pub fn idle_timeout(&self) -> Option<Duration> {
        secs_to_duration(self.idle_timeout_secs)
    }

    /// Get the whole-session deadline, `None` when sessions are unbounded
    pub fn session_timeout(&self) -> Option<Duration> {
        secs_to_duration(self.session_timeout_secs)
    }
}

impl HttpConfig {
    /// `host:port` the HTTP gateway binds to
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Zero means "disabled" for every timeout setting
fn secs_to_duration(secs: u64) -> Option<Duration> {
    match secs {
        0 => None,
        secs => Some(Duration::from_secs(secs)),
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: default_service_name(),
            log_level: default_log_level(),
            log_format: default_log_format(),
            metrics_port: default_metrics_port(),
        }
    }
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            host: default_ingest_host(),
            port: default_ingest_port(),
            frame_layout: FrameLayout::default(),
            max_client_id_len: default_max_client_id_len(),
            copy_buffer_bytes: default_copy_buffer_bytes(),
            max_concurrent_sessions: 0,
            idle_timeout_secs: 0,
            session_timeout_secs: 0,
        }
    }
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            host: default_http_host(),
            port: default_http_port(),
            username: default_credential(),
            password: default_credential(),
            session_ttl_secs: default_session_ttl_secs(),
        }
    }
}

impl Default for S3Config {
    fn default() -> Self {
        Self {
            bucket: String::new(),
            region: default_region(),
            endpoint_url: None,
            force_path_style: false,
            key_prefix: default_key_prefix(),
            part_size_bytes: default_part_size(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            service: ServiceConfig::default(),
            ingest: IngestConfig::default(),
            http: HttpConfig::default(),
            storage: StorageConfig::default(),
            shutdown: ShutdownConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn memory_config() -> Config {
        let mut config = Config::default();
        config.storage.backend = StorageBackend::Memory;
        config
    }

    #[test]
    fn test_default_values() {
        let config = Config::default();
        assert_eq!(config.ingest.port, 55000);
        assert_eq!(config.http.port, 5000);
        assert_eq!(config.http.session_ttl_secs, 86400);
        assert_eq!(config.ingest.frame_layout, FrameLayout::NameAndClientId);
        assert!(config.drain_timeout().is_none());
        assert!(config.ingest.idle_timeout().is_none());
        assert!(config.ingest.session_timeout().is_none());
        assert!(config.uses_default_credentials());
    }

    #[test]
    fn test_s3_backend_requires_bucket() {
        let config = Config::default();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::MissingRequired(_))
        ));

        let mut config = Config::default();
        config.storage.s3.bucket = "uploads".to_string();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_part_size_lower_bound() {
        let mut config = Config::default();
        config.storage.s3.bucket = "uploads".to_string();
        config.storage.s3.part_size_bytes = 1024;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue { .. })
        ));
    }

    #[test]
    fn test_rejects_zero_copy_buffer() {
        let mut config = memory_config();
        config.ingest.copy_buffer_bytes = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_empty_credentials() {
        let mut config = memory_config();
        config.http.password = String::new();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::MissingRequired(_))
        ));
    }

    #[test]
    fn test_deserialize_layout_names() {
        let layout: FrameLayout = serde_json::from_str("\"name_only\"").unwrap();
        assert_eq!(layout, FrameLayout::NameOnly);
        let backend: StorageBackend = serde_json::from_str("\"memory\"").unwrap();
        assert_eq!(backend, StorageBackend::Memory);
    }

    #[test]
    fn test_listen_addrs() {
        let mut config = Config::default();
        config.ingest.host = "127.0.0.1".to_string();
        config.ingest.port = 7000;
        assert_eq!(config.ingest.listen_addr(), "127.0.0.1:7000");
        assert_eq!(config.ingest_addr(), config.ingest.listen_addr());
        assert_eq!(config.http_addr(), "0.0.0.0:5000");
    }

    #[test]
    fn test_ingest_timeouts() {
        let ingest: IngestConfig =
            serde_json::from_str(r#"{"read_timeout_secs": 30, "session_timeout_secs": 600}"#)
                .unwrap();
        assert_eq!(ingest.idle_timeout(), Some(Duration::from_secs(30)));
        assert_eq!(ingest.session_timeout(), Some(Duration::from_secs(600)));
    }
}
