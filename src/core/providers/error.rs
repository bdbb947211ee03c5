use std::time::Duration;

use thiserror::Error;

/// Failure talking to a physical device.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DeviceError {
    /// The device did not answer (connect refused, host down, timed out).
    ///
    /// Expected while a device is switched off; reported as `offline` only.
    #[error("Device unreachable: {0}")]
    Unreachable(String),

    #[error("Request failed: {0}")]
    Request(String),

    #[error("Unexpected HTTP status {0}")]
    Status(u16),

    #[error("Malformed response: {0}")]
    Parse(String),
}

impl DeviceError {
    pub fn is_transient(&self) -> bool {
        matches!(self, DeviceError::Unreachable(_))
    }
}

impl From<reqwest::Error> for DeviceError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() || e.is_connect() {
            DeviceError::Unreachable(e.to_string())
        } else if let Some(status) = e.status() {
            DeviceError::Status(status.as_u16())
        } else if e.is_decode() {
            DeviceError::Parse(e.to_string())
        } else {
            DeviceError::Request(e.to_string())
        }
    }
}

impl From<serde_json::Error> for DeviceError {
    fn from(e: serde_json::Error) -> Self {
        DeviceError::Parse(e.to_string())
    }
}

#[derive(Debug, Error)]
pub enum ProviderError {
    /// Startup cannot continue with this provider's settings.
    #[error("Provider '{provider}' configuration error: {reason}")]
    Configuration { provider: String, reason: String },

    #[error("Provider '{provider}' requires option '{option}'")]
    MissingOption {
        provider: String,
        option: &'static str,
    },

    #[error("Provider '{provider}' option '{option}' is invalid: {reason}")]
    InvalidOption {
        provider: String,
        option: &'static str,
        reason: String,
    },

    #[error("Provider '{0}' is not configured")]
    NotConfigured(String),

    #[error(transparent)]
    Device(#[from] DeviceError),

    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    #[error("Health check failed: {0}")]
    Health(String),
}

impl ProviderError {
    /// Errors that must abort startup.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            ProviderError::Configuration { .. }
                | ProviderError::MissingOption { .. }
                | ProviderError::InvalidOption { .. }
        )
    }
}
