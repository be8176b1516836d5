//! Layered service configuration.
//!
//! Values are resolved in this order, later layers winning:
//!
//! 1. built-in defaults,
//! 2. the TOML file named by `CERTMGR_CONFIG`, or `./certmgr.toml` when present,
//! 3. `CERTMGR_*` environment variables for scalar settings.
//!
//! ```toml
//! [server]
//! http_listen_address = "0.0.0.0:8080"
//!
//! [ca]
//! certificate_file = "/etc/certmgr/ca.pem"
//! key_file = "/etc/certmgr/ca-key.pem"
//! authorized_creators = ["deployer"]
//!
//! [auth]
//! endpoint = "http://auth.internal:50051"
//!
//! [auth.breaker]
//! timeout_ms = 500
//! ```

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::authority::{CaPolicy, DEFAULT_CA_NAME};
use crate::circuit_breaker::{self, BreakerConfigError, CircuitBreakerConfig};
use crate::token_cache;

/// Environment variable naming an explicit configuration file.
pub const CONFIG_FILE_ENV: &str = "CERTMGR_CONFIG";

const LOCAL_CONFIG_FILE: &str = "./certmgr.toml";

/// Upper bound for `ca.max_duration_days`, one hundred years.
pub const MAX_DURATION_DAYS_LIMIT: u32 = 36_500;

#[derive(Debug, Error)]
pub enum AppConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("failed to serialize configuration: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("failed to write config file {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid configuration for {key}: '{value}' ({reason})")]
    InvalidValue {
        key: String,
        value: String,
        reason: String,
    },

    #[error("invalid circuit breaker settings: {0}")]
    Breaker(#[from] BreakerConfigError),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub ca: CaConfig,
    pub auth: AuthConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub http_listen_address: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_listen_address: "0.0.0.0:8080".to_string(),
        }
    }
}

/// The signing CA and its issuance policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CaConfig {
    pub name: String,
    pub certificate_file: PathBuf,
    pub key_file: PathBuf,
    /// Chain of intermediates handed out alongside issued certificates.
    pub bundle_file: Option<PathBuf>,
    pub max_duration_days: u32,
    pub organization: String,
    pub require_name_constraints: bool,
    /// Users allowed to create certificates. Empty lets any authenticated user.
    pub authorized_creators: Vec<String>,
}

impl Default for CaConfig {
    fn default() -> Self {
        Self {
            name: DEFAULT_CA_NAME.to_string(),
            certificate_file: PathBuf::from("ca.pem"),
            key_file: PathBuf::from("ca-key.pem"),
            bundle_file: None,
            max_duration_days: 365,
            organization: "certmgr".to_string(),
            require_name_constraints: false,
            authorized_creators: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// gRPC endpoint of the auth verifier.
    pub endpoint: String,
    /// Accept every token as its own user. Development only.
    pub dev_mode: bool,
    pub connect_timeout_ms: u64,
    pub cache_capacity: u64,
    pub cache_sweep_interval_secs: u64,
    pub breaker: BreakerSettings,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://127.0.0.1:50051".to_string(),
            dev_mode: false,
            connect_timeout_ms: 5_000,
            cache_capacity: token_cache::DEFAULT_CAPACITY,
            cache_sweep_interval_secs: token_cache::DEFAULT_SWEEP_INTERVAL.as_secs(),
            breaker: BreakerSettings::default(),
        }
    }
}

/// Serialized form of [`CircuitBreakerConfig`]; durations are in milliseconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerSettings {
    pub max_concurrent_requests: usize,
    pub timeout_ms: u64,
    pub error_threshold_percentage: u8,
    pub request_volume_threshold: u32,
    pub sleep_window_ms: u64,
    pub rolling_window_ms: u64,
    pub half_open_max_probes: u32,
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self {
            max_concurrent_requests: circuit_breaker::DEFAULT_MAX_CONCURRENT_REQUESTS,
            timeout_ms: duration_millis(circuit_breaker::DEFAULT_TIMEOUT),
            error_threshold_percentage: circuit_breaker::DEFAULT_ERROR_THRESHOLD_PERCENTAGE,
            request_volume_threshold: circuit_breaker::DEFAULT_REQUEST_VOLUME_THRESHOLD,
            sleep_window_ms: duration_millis(circuit_breaker::DEFAULT_SLEEP_WINDOW),
            rolling_window_ms: duration_millis(circuit_breaker::DEFAULT_ROLLING_WINDOW),
            half_open_max_probes: circuit_breaker::DEFAULT_HALF_OPEN_MAX_PROBES,
        }
    }
}

fn duration_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Json,
    Text,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter directive; `RUST_LOG` takes precedence when set.
    pub level: String,
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Json,
        }
    }
}

impl AppConfig {
    /// Loads defaults, the config file and environment overrides, then
    /// validates the result.
    pub fn load_with_layers() -> Result<Self, AppConfigError> {
        let mut config = Self::load_toml_with_fallbacks()?;
        config.apply_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    fn load_toml_with_fallbacks() -> Result<Self, AppConfigError> {
        if let Ok(config_path) = std::env::var(CONFIG_FILE_ENV) {
            // An explicit path that does not exist is an operator error.
            return Self::from_toml_file(config_path);
        }

        let local_config = Path::new(LOCAL_CONFIG_FILE);
        if local_config.exists() {
            tracing::info!(path = LOCAL_CONFIG_FILE, "loading configuration");
            return Self::from_toml_file(local_config);
        }

        tracing::info!("no configuration file found, using defaults");
        Ok(Self::default())
    }

    pub fn from_toml_file(path: impl AsRef<Path>) -> Result<Self, AppConfigError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|source| AppConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&contents).map_err(|source| AppConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn from_toml_str(contents: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(contents)
    }

    pub fn save_to_file(&self, path: impl AsRef<Path>) -> Result<(), AppConfigError> {
        let path = path.as_ref();
        let contents = toml::to_string_pretty(self)?;
        std::fs::write(path, contents).map_err(|source| AppConfigError::Write {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Applies `CERTMGR_*` overrides, reading variables through `lookup`.
    pub fn apply_overrides(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(), AppConfigError> {
        if let Some(val) = lookup("CERTMGR_HTTP_LISTEN_ADDRESS") {
            self.server.http_listen_address = val;
        }

        if let Some(val) = lookup("CERTMGR_CA_NAME") {
            self.ca.name = val;
        }
        if let Some(val) = lookup("CERTMGR_CA_CERTIFICATE_FILE") {
            self.ca.certificate_file = PathBuf::from(val);
        }
        if let Some(val) = lookup("CERTMGR_CA_KEY_FILE") {
            self.ca.key_file = PathBuf::from(val);
        }
        if let Some(val) = lookup("CERTMGR_CA_BUNDLE_FILE") {
            self.ca.bundle_file = (!val.is_empty()).then(|| PathBuf::from(val));
        }
        if let Some(val) = lookup("CERTMGR_CA_MAX_DURATION_DAYS") {
            self.ca.max_duration_days = parse_env("CERTMGR_CA_MAX_DURATION_DAYS", &val)?;
        }
        if let Some(val) = lookup("CERTMGR_CA_ORGANIZATION") {
            self.ca.organization = val;
        }
        if let Some(val) = lookup("CERTMGR_CA_REQUIRE_NAME_CONSTRAINTS") {
            self.ca.require_name_constraints =
                parse_env("CERTMGR_CA_REQUIRE_NAME_CONSTRAINTS", &val)?;
        }
        if let Some(val) = lookup("CERTMGR_CA_AUTHORIZED_CREATORS") {
            self.ca.authorized_creators = val
                .split(',')
                .map(str::trim)
                .filter(|user| !user.is_empty())
                .map(String::from)
                .collect();
        }

        if let Some(val) = lookup("CERTMGR_AUTH_ENDPOINT") {
            self.auth.endpoint = val;
        }
        if let Some(val) = lookup("CERTMGR_AUTH_DEV_MODE") {
            self.auth.dev_mode = parse_env("CERTMGR_AUTH_DEV_MODE", &val)?;
        }
        if let Some(val) = lookup("CERTMGR_AUTH_CACHE_CAPACITY") {
            self.auth.cache_capacity = parse_env("CERTMGR_AUTH_CACHE_CAPACITY", &val)?;
        }

        if let Some(val) = lookup("CERTMGR_LOG_LEVEL") {
            self.logging.level = val;
        }
        if let Some(val) = lookup("CERTMGR_LOG_FORMAT") {
            self.logging.format = match val.to_ascii_lowercase().as_str() {
                "json" => LogFormat::Json,
                "text" => LogFormat::Text,
                _ => {
                    return Err(AppConfigError::InvalidValue {
                        key: "CERTMGR_LOG_FORMAT".to_string(),
                        value: val,
                        reason: "must be 'json' or 'text'".to_string(),
                    });
                }
            };
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), AppConfigError> {
        self.listen_address()?;
        if self.ca.max_duration_days == 0 {
            return Err(invalid("ca.max_duration_days", "0", "must be positive"));
        }
        if self.ca.max_duration_days > MAX_DURATION_DAYS_LIMIT {
            return Err(invalid(
                "ca.max_duration_days",
                &self.ca.max_duration_days.to_string(),
                &format!("must be at most {MAX_DURATION_DAYS_LIMIT}"),
            ));
        }
        if self.auth.cache_capacity == 0 {
            return Err(invalid("auth.cache_capacity", "0", "must be positive"));
        }
        if self.auth.cache_sweep_interval_secs == 0 {
            return Err(invalid("auth.cache_sweep_interval_secs", "0", "must be positive"));
        }
        if self.auth.connect_timeout_ms == 0 {
            return Err(invalid("auth.connect_timeout_ms", "0", "must be positive"));
        }
        if !self.auth.dev_mode && self.auth.endpoint.trim().is_empty() {
            return Err(invalid(
                "auth.endpoint",
                "",
                "required unless dev_mode is enabled",
            ));
        }
        self.breaker_config()?;
        Ok(())
    }

    pub fn listen_address(&self) -> Result<SocketAddr, AppConfigError> {
        self.server
            .http_listen_address
            .parse()
            .map_err(|e: std::net::AddrParseError| {
                invalid(
                    "server.http_listen_address",
                    &self.server.http_listen_address,
                    &e.to_string(),
                )
            })
    }

    pub fn breaker_config(&self) -> Result<CircuitBreakerConfig, BreakerConfigError> {
        let settings = &self.auth.breaker;
        CircuitBreakerConfig::builder()
            .max_concurrent_requests(settings.max_concurrent_requests)
            .timeout(Duration::from_millis(settings.timeout_ms))
            .error_threshold_percentage(settings.error_threshold_percentage)
            .request_volume_threshold(settings.request_volume_threshold)
            .sleep_window(Duration::from_millis(settings.sleep_window_ms))
            .rolling_window(Duration::from_millis(settings.rolling_window_ms))
            .half_open_max_probes(settings.half_open_max_probes)
            .build()
    }

    pub fn ca_policy(&self) -> CaPolicy {
        CaPolicy {
            max_duration: time::Duration::days(i64::from(self.ca.max_duration_days)),
            organization: self.ca.organization.clone(),
            require_name_constraints: self.ca.require_name_constraints,
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.auth.connect_timeout_ms)
    }

    pub fn cache_sweep_interval(&self) -> Duration {
        Duration::from_secs(self.auth.cache_sweep_interval_secs)
    }
}

fn invalid(key: &str, value: &str, reason: &str) -> AppConfigError {
    AppConfigError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
        reason: reason.to_string(),
    }
}

fn parse_env<T>(key: &str, value: &str) -> Result<T, AppConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e: T::Err| invalid(key, value, &e.to_string()))
}
