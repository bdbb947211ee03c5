//! Error type for every fallible operation of the MQTT transport.
//!
//! `TransferError` folds configuration, connection, acknowledgment and
//! retry-policy failures into one enum so callers can match on the kind of
//! failure rather than on the library that produced it.
//!
//! # Error Categories
//!
//! **Startup** (fail fast, the bridge cannot run):
//! - `ClientSetup`: TLS material or client options are unusable
//! - `ConfigError`: validation of `Config` failed
//! - `ConnectFailed`: no CONNACK within the connect deadline
//!
//! **Runtime** (reported, the connection kernel keeps going):
//! - `AckTimeout`: the broker did not acknowledge a publish in time
//! - `AckDropped`: the connection dropped while a publish waited for its ack
//! - `ClientTransfer`: the request could not be queued on the client
//!
//! **Terminal**:
//! - `ClientConnection`: unrecoverable network or protocol failure
//! - `RetriesPolicy`: reconnect backoff exhausted
//! - `ShutdownTimeout`: graceful disconnect overran its deadline
//! - `Closed`: the connection was already torn down

use std::time::Duration;

use thiserror::Error;

/// The unified error type for MQTT transfer operations.
#[derive(Debug, Error)]
pub enum TransferError {
    /// Publish or subscribe options are invalid (QoS outside 0..=2, empty topic).
    #[error("Invalid options: {0}")]
    InvalidOptions(String),

    /// The client could not be built from the given configuration.
    ///
    /// Usually unreadable TLS material. Caught at startup.
    #[error("Client setup error: {0}")]
    ClientSetup(String),

    /// Configuration validation failed.
    #[error("Configuration error: {0}")]
    ConfigError(#[from] validator::ValidationErrors),

    /// The broker did not accept the connection within the connect deadline.
    #[error("Failed to connect to {address}: {reason}")]
    ConnectFailed { address: String, reason: String },

    /// A publish was not acknowledged within the acknowledgment bound.
    #[error("Publish to '{topic}' was not acknowledged within {after:?}")]
    AckTimeout { topic: String, after: Duration },

    /// The connection was lost while a publish was waiting for acknowledgment.
    #[error("Publish to '{topic}' lost its acknowledgment: {reason}")]
    AckDropped { topic: String, reason: String },

    /// The local client could not queue the request (event loop gone or channel closed).
    #[error("Client transfer error: {0}")]
    ClientTransfer(#[from] rumqttc::ClientError),

    /// Network or protocol failure the kernel does not recover from.
    ///
    /// Boxed to keep the enum small.
    #[error("Client connection error: {0}")]
    ClientConnection(#[from] Box<rumqttc::ConnectionError>),

    /// Reconnect attempts were exhausted.
    #[error("Retry policy error: {0}")]
    RetriesPolicy(#[from] super::backoff::BackoffError),

    /// File I/O failed, e.g. while loading TLS material.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Graceful disconnect did not finish in time; the connection was dropped.
    #[error("Disconnect did not complete within {0:?}")]
    ShutdownTimeout(Duration),

    /// The connection has been closed and accepts no more requests.
    #[error("Connection closed")]
    Closed,
}

impl From<rumqttc::ConnectionError> for TransferError {
    fn from(err: rumqttc::ConnectionError) -> Self {
        TransferError::ClientConnection(Box::new(err))
    }
}

impl TransferError {
    /// True for errors caused by a missing or late broker acknowledgment.
    pub fn is_timeout(&self) -> bool {
        matches!(self, TransferError::AckTimeout { .. })
    }
}
