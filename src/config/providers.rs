//! Per-device provider settings.
//!
//! Every provider table is optional and disabled by default. An enabled
//! provider must name its device address, and its request timeout must be
//! shorter than its poll interval so a slow device delays the next tick
//! instead of stacking polls.
//!
//! ```toml
//! [providers.zever_solar_tlc5000]
//! enabled = true
//! address = "192.168.1.50"
//! interval = 30
//! timeout = 10
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};
use validator::{Validate, ValidationError};

#[derive(Debug, Clone, Default, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct ProvidersConfig {
    #[validate(nested)]
    pub zever_solar_tlc5000: Option<ZeverSolarConfig>,

    #[validate(nested)]
    pub huawei_hg659: Option<HuaweiHg659Config>,

    #[validate(nested)]
    pub advantage_air_hub: Option<AdvantageAirConfig>,
}

/// Solar inverter polled over its `home.cgi` status page.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
#[validate(schema(function = "validate_zever_solar"))]
pub struct ZeverSolarConfig {
    pub enabled: bool,

    /// Host or `host:port` of the inverter's web interface.
    pub address: String,

    /// Seconds between polls.
    #[validate(range(min = 1, max = 86_400, message = "Interval must be between 1s and 1 day"))]
    pub interval: u64,

    /// Seconds a single device request may take.
    #[validate(range(min = 1, message = "Timeout must be at least 1 second"))]
    pub timeout: u64,

    #[validate(custom(function = "validate_entity_name"))]
    pub entity_name: String,
}

impl Default for ZeverSolarConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            address: String::new(),
            interval: 30,
            timeout: 10,
            entity_name: "zever_solar_tlc5000".into(),
        }
    }
}

/// Home router with the HG659 JSON API.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
#[validate(schema(function = "validate_huawei_hg659"))]
pub struct HuaweiHg659Config {
    pub enabled: bool,

    /// Base URL of the router, e.g. `http://192.168.1.1`.
    pub address: String,

    #[validate(range(min = 1, max = 86_400, message = "Interval must be between 1s and 1 day"))]
    pub interval: u64,

    #[validate(range(min = 1, message = "Timeout must be at least 1 second"))]
    pub timeout: u64,

    #[validate(custom(function = "validate_entity_name"))]
    pub entity_name: String,

    /// Host resolved on each poll to decide whether the internet is reachable.
    #[validate(length(min = 1, message = "Self-test host must not be empty"))]
    pub self_test_host: String,
}

impl Default for HuaweiHg659Config {
    fn default() -> Self {
        Self {
            enabled: false,
            address: String::new(),
            interval: 60,
            timeout: 10,
            entity_name: "huawei_hg659".into(),
            self_test_host: "www.tpg.com.au".into(),
        }
    }
}

/// HVAC controller exposing the MyPlace local API.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
#[validate(schema(function = "validate_advantage_air"))]
pub struct AdvantageAirConfig {
    pub enabled: bool,

    /// Hostname or IP of the hub.
    pub address: String,

    #[validate(range(min = 1, message = "Port must be between 1 and 65535"))]
    pub port: u16,

    #[validate(range(min = 1, max = 86_400, message = "Interval must be between 1s and 1 day"))]
    pub interval: u64,

    #[validate(range(min = 1, message = "Timeout must be at least 1 second"))]
    pub timeout: u64,

    #[validate(custom(function = "validate_entity_name"))]
    pub entity_name: String,
}

impl Default for AdvantageAirConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            address: String::new(),
            port: 2025,
            interval: 30,
            timeout: 3,
            entity_name: "advantage_air_hub".into(),
        }
    }
}

macro_rules! schedule_accessors {
    ($($config:ty),*) => {$(
        impl $config {
            pub fn interval(&self) -> Duration {
                Duration::from_secs(self.interval)
            }

            pub fn timeout(&self) -> Duration {
                Duration::from_secs(self.timeout)
            }
        }
    )*};
}

schedule_accessors!(ZeverSolarConfig, HuaweiHg659Config, AdvantageAirConfig);

fn validate_zever_solar(config: &ZeverSolarConfig) -> Result<(), ValidationError> {
    validate_schedule(config.enabled, &config.address, config.interval, config.timeout)
}

fn validate_huawei_hg659(config: &HuaweiHg659Config) -> Result<(), ValidationError> {
    validate_schedule(config.enabled, &config.address, config.interval, config.timeout)?;
    if config.enabled && !config.address.starts_with("http") {
        return Err(ValidationError::new("invalid_address")
            .with_message("Router address must be a http:// or https:// URL".into()));
    }
    Ok(())
}

fn validate_advantage_air(config: &AdvantageAirConfig) -> Result<(), ValidationError> {
    validate_schedule(config.enabled, &config.address, config.interval, config.timeout)
}

fn validate_schedule(
    enabled: bool,
    address: &str,
    interval: u64,
    timeout: u64,
) -> Result<(), ValidationError> {
    if !enabled {
        return Ok(());
    }

    if address.trim().is_empty() {
        return Err(ValidationError::new("missing_address")
            .with_message("Address is required when the provider is enabled".into()));
    }

    if timeout >= interval {
        return Err(ValidationError::new("timeout_not_below_interval").with_message(
            format!("Timeout ({timeout}s) must be shorter than the interval ({interval}s)").into(),
        ));
    }

    Ok(())
}

/// Entity names end up in MQTT topics, so they are restricted to `[a-z0-9_]`.
fn validate_entity_name(name: &str) -> Result<(), ValidationError> {
    if name.is_empty()
        || !name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
    {
        return Err(ValidationError::new("invalid_entity_name")
            .with_message(format!("Entity name must match [a-z0-9_]+: {name:?}").into()));
    }
    Ok(())
}
