//! Application configuration loading, validation, and management.
//!
//! This module provides the top-level `Config` structure that aggregates
//! logging, bridge, HTTP server, transport and provider settings. It is
//! loaded once from a TOML file, validated, and passed by reference to each
//! component at construction; nothing mutates it afterwards.

use std::{
    fs,
    net::SocketAddr,
    path::{Path, PathBuf},
    time::Duration,
};

use serde::{Deserialize, Serialize};
use validator::{Validate, ValidationError};

use self::{logger::LoggerConfig, providers::ProvidersConfig};

pub mod logger;
pub mod providers;

/// Environment variable naming the configuration file.
pub const CONFIG_ENV: &str = "HASS_BRIDGE_CONFIG";

/// Used when `HASS_BRIDGE_CONFIG` is unset.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/hass-bridge/config.toml";

#[doc(hidden)]
pub fn now_rfc3339() -> String {
    time::OffsetDateTime::now_utc()
        .format(&time::format_description::well_known::Rfc3339)
        .unwrap_or_default()
}

/// Simple macros for printing timestamped messages before the tracing subscriber
/// is initialized. These are used during early configuration loading.
#[macro_export]
macro_rules! print_info {
    ($($arg:tt)*) => {
        println!("{}  {} {}",
            console::style($crate::config::now_rfc3339()).dim(),
            console::style("INFO").green(),
            format_args!($($arg)*)
        );
    };
}

#[macro_export]
macro_rules! print_warn {
    ($($arg:tt)*) => {
        println!("{}  {} {}",
            console::style($crate::config::now_rfc3339()).dim(),
            console::style("WARN").yellow(),
            format_args!($($arg)*)
        );
    };
}

#[macro_export]
macro_rules! print_error {
    ($($arg:tt)*) => {
        eprintln!("{}  {} {}",
            console::style($crate::config::now_rfc3339()).dim(),
            console::style("ERROR").red(),
            format_args!($($arg)*)
        );
    };
}

/// Errors that can occur during configuration loading, parsing or validation.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Generic configuration-related error with a descriptive message.
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error while accessing configuration files.
    #[error("IO error while reading configuration: {0}")]
    IoError(#[from] std::io::Error),

    /// Failure to parse the TOML configuration file.
    #[error("Parse error while reading configuration: {0}")]
    ParseError(String),

    /// Validation failure after successful parsing.
    #[error("Validation error: {0}")]
    ValidationError(String),
}

/// Top-level application configuration.
#[derive(Serialize, Deserialize, Debug, Validate, Clone, Default)]
#[serde(default)]
pub struct Config {
    #[validate(nested)]
    pub logger: LoggerConfig,

    #[validate(nested)]
    pub bridge: BridgeConfig,

    #[validate(nested)]
    pub server: ServerConfig,

    #[validate(nested)]
    pub transport: TransportConfig,

    #[validate(nested)]
    pub providers: ProvidersConfig,
}

pub type TransportConfig = hass_bridge_mqtt::Config;

/// Process-wide behavior of the bridge itself.
#[derive(Serialize, Deserialize, Debug, Validate, Clone)]
#[serde(default)]
pub struct BridgeConfig {
    /// Tag embedded in the broker client id.
    #[validate(length(min = 1, max = 9, message = "Client purpose must be 1 to 9 characters"))]
    pub client_purpose: String,

    /// Seconds the graceful shutdown may take before the process is forced down.
    #[validate(range(min = 1, max = 120, message = "Shutdown grace must be between 1 and 120 seconds"))]
    pub shutdown_grace: u64,

    /// Seconds the final broker disconnect may take.
    #[validate(range(min = 1, max = 60, message = "Disconnect timeout must be between 1 and 60 seconds"))]
    pub disconnect_timeout: u64,

    /// Discovery publishes in flight at once during announce.
    #[validate(range(min = 1, max = 256, message = "Announce concurrency must be between 1 and 256"))]
    pub announce_concurrency: usize,

    /// Re-announce discovery when Home Assistant publishes its birth message.
    pub rediscover_on_birth: bool,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            client_purpose: "bridge".into(),
            shutdown_grace: 5,
            disconnect_timeout: 1,
            announce_concurrency: 16,
            rediscover_on_birth: true,
        }
    }
}

impl BridgeConfig {
    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace)
    }

    pub fn disconnect_timeout(&self) -> Duration {
        Duration::from_secs(self.disconnect_timeout)
    }
}

/// HTTP status policy of the readiness endpoint.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ReadinessPolicy {
    /// 503 when any target is unhealthy.
    #[default]
    FailOnUnhealthy,
    /// Always 200; unhealthy targets only show in the body.
    AlwaysOk,
}

#[derive(Serialize, Deserialize, Debug, Validate, Clone)]
#[serde(default)]
pub struct ServerConfig {
    #[validate(custom(function = "validate_listen_address"))]
    pub listen: String,

    /// Seconds a readiness request waits for all probes.
    #[validate(range(min = 1, max = 60, message = "Probe timeout must be between 1 and 60 seconds"))]
    pub probe_timeout: u64,

    pub readiness_policy: ReadinessPolicy,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:8080".into(),
            probe_timeout: 5,
            readiness_policy: ReadinessPolicy::default(),
        }
    }
}

impl ServerConfig {
    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout)
    }

    pub fn listen_address(&self) -> Result<SocketAddr, ConfigError> {
        self.listen
            .parse()
            .map_err(|e| ConfigError::Config(format!("Invalid listen address {}: {e}", self.listen)))
    }
}

fn validate_listen_address(listen: &str) -> Result<(), ValidationError> {
    listen.parse::<SocketAddr>().map(|_| ()).map_err(|_| {
        let mut err = ValidationError::new("invalid_listen_address");
        err.message = Some(format!("Listen address must be ip:port, got {listen}").into());
        err
    })
}

impl Config {
    /// Constructs a new configuration by locating and loading the config file.
    ///
    /// # Errors
    ///
    /// Returns a `ConfigError` if the configuration file cannot be found,
    /// read, parsed, or validated.
    pub fn new() -> Result<Self, ConfigError> {
        let config_path = Self::get_config_path()?;
        Self::load(&config_path)
    }

    /// Determines the configuration file path.
    ///
    /// Priority:
    /// 1. `HASS_BRIDGE_CONFIG` environment variable
    /// 2. `/etc/hass-bridge/config.toml`
    fn get_config_path() -> Result<PathBuf, ConfigError> {
        if let Ok(config_path) = std::env::var(CONFIG_ENV) {
            let path = PathBuf::from(config_path);
            print_info!("Using config from {}: {}", CONFIG_ENV, path.display());
            return Ok(path);
        }

        let fallback = Path::new(DEFAULT_CONFIG_PATH);
        if fallback.exists() {
            print_info!("Using default config path: {}", fallback.display());
            return Ok(fallback.to_path_buf());
        }

        Err(ConfigError::Config(format!(
            "No configuration file found, set {CONFIG_ENV} or create {DEFAULT_CONFIG_PATH}"
        )))
    }

    /// Loads and validates configuration from the specified path.
    pub fn load(path: &Path) -> Result<Config, ConfigError> {
        print_info!("Loading configuration from: {}", path.display());

        if !path.exists() {
            return Err(ConfigError::Config(format!(
                "Configuration file does not exist: {}",
                path.display()
            )));
        }

        let config_str = fs::read_to_string(path)?;
        Self::parse(&config_str)
    }

    /// Parses and validates configuration from TOML text.
    pub fn parse(config_str: &str) -> Result<Config, ConfigError> {
        let config: Config =
            toml::from_str(config_str).map_err(|e| ConfigError::ParseError(e.to_string()))?;

        config
            .validate()
            .map_err(|e| ConfigError::ValidationError(e.to_string()))?;

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    const SAMPLE: &str = r#"
[logger]
level = "debug"

[bridge]
client_purpose = "home"
shutdown_grace = 10

[server]
listen = "127.0.0.1:9090"
readiness_policy = "always_ok"

[transport]
host = "mqtt.local"
port = 1883
username = "bridge"
password = "secret"

[providers.zever_solar_tlc5000]
enabled = true
address = "192.168.1.50"

[providers.huawei_hg659]
enabled = false
"#;

    #[test]
    fn test_parse_sample() {
        let config = Config::parse(SAMPLE).unwrap();

        assert_eq!(config.logger.level, "debug");
        assert_eq!(config.bridge.client_purpose, "home");
        assert_eq!(config.bridge.shutdown_grace(), Duration::from_secs(10));
        assert_eq!(config.server.readiness_policy, ReadinessPolicy::AlwaysOk);
        assert_eq!(
            config.server.listen_address().unwrap(),
            "127.0.0.1:9090".parse::<SocketAddr>().unwrap()
        );
        assert_eq!(config.transport.host, "mqtt.local");
        assert_eq!(config.transport.username.as_deref(), Some("bridge"));

        let solar = config.providers.zever_solar_tlc5000.unwrap();
        assert!(solar.enabled);
        assert_eq!(solar.interval, 30);
        assert!(!config.providers.huawei_hg659.unwrap().enabled);
        assert!(config.providers.advantage_air_hub.is_none());
    }

    #[test]
    fn test_empty_file_uses_defaults() {
        let config = Config::parse("").unwrap();
        assert_eq!(config.server.readiness_policy, ReadinessPolicy::FailOnUnhealthy);
        assert_eq!(config.bridge.shutdown_grace, 5);
        assert_eq!(config.transport.port, 1883);
    }

    #[test]
    fn test_invalid_listen_address() {
        let err = Config::parse("[server]\nlisten = \"localhost\"\n").unwrap_err();
        assert!(matches!(err, ConfigError::ValidationError(_)));
    }

    #[test]
    fn test_nested_provider_validation() {
        let err = Config::parse(
            "[providers.advantage_air_hub]\nenabled = true\naddress = \"10.0.0.2\"\ninterval = 2\ntimeout = 3\n",
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::ValidationError(_)));
    }

    #[test]
    fn test_parse_error() {
        let err = Config::parse("[bridge\n").unwrap_err();
        assert!(matches!(err, ConfigError::ParseError(_)));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(SAMPLE.as_bytes()).unwrap();

        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.transport.host, "mqtt.local");
    }

    #[test]
    fn test_load_missing_file() {
        let err = Config::load(Path::new("/nonexistent/hass-bridge.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Config(_)));
    }
}
