//! Connection and publish configuration.
//!
//! `Config` is deserialized from the `[transport]` table of the bridge
//! configuration file and validated with the `validator` crate before a
//! connection is attempted, so a bad port or an unreadable CA file fails at
//! startup instead of inside the reconnect loop.
//!
//! ```toml
//! [transport]
//! host = "mqtt.local"
//! port = 1883
//! username = "bridge"
//! password = "secret"
//! ack_timeout = 5
//! ```

use std::{path::Path, time::Duration};

use rumqttc::QoS;
use serde::{Deserialize, Serialize};
use validator::{Validate, ValidationError};

use super::error::TransferError;

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct Config {
    #[validate(length(
        min = 1,
        max = 255,
        message = "Host must be between 1 and 255 characters"
    ))]
    pub host: String,

    #[validate(range(min = 1, message = "Port must be between 1 and 65535"))]
    pub port: u16,

    pub username: Option<String>,

    pub password: Option<String>,

    /// Seconds of silence before the broker considers the client gone and fires its last will.
    #[validate(range(
        min = 5,
        max = 3600,
        message = "Keep alive must be between 5 and 3600 seconds"
    ))]
    pub keep_alive: u64,

    pub clean_session: bool,

    #[validate(range(
        min = 1,
        max = 1000,
        message = "Max inflight must be between 1 and 1000"
    ))]
    pub max_inflight: u16,

    #[validate(range(
        min = 64,
        max = 268_435_455,
        message = "Max packet size must be between 64 bytes and 256MB"
    ))]
    pub max_packet_size: usize,

    #[validate(range(
        min = 1,
        max = 1024,
        message = "Request channel capacity must be between 1 and 1024"
    ))]
    pub request_channel_capacity: usize,

    /// Seconds to wait for CONNACK when connecting.
    #[validate(range(
        min = 1,
        max = 300,
        message = "Connection timeout must be between 1 and 300 seconds"
    ))]
    pub connection_timeout: u64,

    /// Seconds a publish waits for the broker acknowledgment.
    #[validate(range(
        min = 1,
        max = 60,
        message = "Ack timeout must be between 1 and 60 seconds"
    ))]
    pub ack_timeout: u64,

    /// First reconnect delay in milliseconds.
    #[validate(range(
        min = 10,
        max = 60_000,
        message = "Reconnect delay must be between 10ms and 60s"
    ))]
    pub reconnect_delay_ms: u64,

    #[validate(range(
        min = 1,
        max = 3600,
        message = "Max reconnect delay must be between 1 and 3600 seconds"
    ))]
    pub max_reconnect_delay: u64,

    #[validate(range(
        min = 1.0,
        max = 10.0,
        message = "Reconnect multiplier must be between 1.0 and 10.0"
    ))]
    pub reconnect_multiplier: f64,

    /// Consecutive failed reconnects before giving up; `0` retries forever.
    pub max_reconnect_attempts: u32,

    #[validate(nested)]
    pub tls: Option<TlsConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            host: "localhost".to_string(),
            port: 1883,
            username: None,
            password: None,
            keep_alive: 30,
            clean_session: true,
            max_inflight: 100,
            max_packet_size: 256 * 1024,
            request_channel_capacity: 64,
            connection_timeout: 10,
            ack_timeout: 5,
            reconnect_delay_ms: 1_000,
            max_reconnect_delay: 60,
            reconnect_multiplier: 1.5,
            max_reconnect_attempts: 0,
            tls: None,
        }
    }
}

impl Config {
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn ack_timeout(&self) -> Duration {
        Duration::from_secs(self.ack_timeout)
    }

    pub fn connection_timeout(&self) -> Duration {
        Duration::from_secs(self.connection_timeout)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct TlsConfig {
    #[validate(custom(
        function = "validate_file_path",
        message = "CA certificate file does not exist"
    ))]
    pub ca_cert_path: Option<String>,

    #[validate(custom(
        function = "validate_file_path",
        message = "Client certificate file does not exist"
    ))]
    pub client_cert_path: Option<String>,

    #[validate(custom(
        function = "validate_file_path",
        message = "Client key file does not exist"
    ))]
    pub client_key_path: Option<String>,
}

impl TlsConfig {
    pub fn with_ca_only(ca_cert_path: impl Into<String>) -> Self {
        TlsConfig {
            ca_cert_path: Some(ca_cert_path.into()),
            client_cert_path: None,
            client_key_path: None,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.ca_cert_path.is_some()
    }

    /// Client certificate and key, if both are configured.
    pub fn client_auth(&self) -> Option<(&str, &str)> {
        match (&self.client_cert_path, &self.client_key_path) {
            (Some(cert), Some(key)) => Some((cert, key)),
            _ => None,
        }
    }

    /// Rejects half-configured client authentication.
    pub fn check_client_auth(&self) -> Result<(), ValidationError> {
        if self.client_auth().is_none()
            && (self.client_cert_path.is_some() || self.client_key_path.is_some())
        {
            return Err(ValidationError::new("incomplete_client_auth").with_message(
                "Both client certificate and key must be provided or neither".into(),
            ));
        }
        Ok(())
    }
}

fn validate_file_path(path: &str) -> Result<(), ValidationError> {
    if path.is_empty() {
        return Err(
            ValidationError::new("empty_path").with_message("File path cannot be empty".into())
        );
    }

    if !Path::new(path).is_file() {
        return Err(ValidationError::new("file_not_found")
            .with_message(format!("File does not exist: {path}").into()));
    }

    Ok(())
}

/// Delivery options for a single publish.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct PublishOptions {
    #[validate(range(max = 2, message = "Invalid QoS value, must be 0, 1, or 2"))]
    pub qos: u8,

    pub retain: bool,
}

impl Default for PublishOptions {
    /// At least once, not retained.
    fn default() -> Self {
        Self {
            qos: QoS::AtLeastOnce as u8,
            retain: false,
        }
    }
}

impl PublishOptions {
    pub fn retained() -> Self {
        Self {
            retain: true,
            ..Self::default()
        }
    }

    pub fn with_qos(mut self, qos: u8) -> Self {
        self.qos = qos;
        self
    }

    pub fn qos(&self) -> Result<QoS, TransferError> {
        qos_from_u8(self.qos)
    }
}

pub fn qos_from_u8(qos: u8) -> Result<QoS, TransferError> {
    match qos {
        0 => Ok(QoS::AtMostOnce),
        1 => Ok(QoS::AtLeastOnce),
        2 => Ok(QoS::ExactlyOnce),
        other => Err(TransferError::InvalidOptions(format!(
            "Invalid QoS value {other}, must be 0, 1, or 2"
        ))),
    }
}
