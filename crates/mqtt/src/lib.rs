//! # hass-bridge-mqtt: one owned MQTT connection for the bridge
//!
//! Built on `rumqttc`, this crate adds what the bridge needs from a broker
//! connection and nothing else:
//!
//! - **Bounded client ids** derived from a purpose tag plus a random suffix
//! - **Last will and birth message** for bridge-wide availability
//! - **Automatic reconnection** with exponential backoff
//! - **Acknowledged publishing** with an independent deadline per call
//! - **Subscriptions** that are renewed after every reconnect
//! - **State monitoring** through a `watch` channel
//!
//! # Quick Start
//!
//! ```ignore
//! use hass_bridge_mqtt::{BirthMessage, Config, ConnectOptions, LastWill, MqttBroker, PublishOptions};
//!
//! let broker = MqttBroker::connect(
//!     &Config::default(),
//!     ConnectOptions::new("bridge")
//!         .last_will(LastWill::retained("bridge/availability", "offline"))
//!         .birth(BirthMessage::new("bridge/availability", "online")),
//! )
//! .await?;
//!
//! broker.publish("bridge/state", r#"{"on":true}"#, PublishOptions::default()).await?;
//! broker.disconnect(std::time::Duration::from_secs(5)).await?;
//! ```
//!
//! ## Reconnection
//!
//! ```text
//! Attempt 1: wait 1.0s
//! Attempt 2: wait 1.5s
//! Attempt 3: wait 2.25s
//! ...
//! Attempt 11+: wait 60s (capped)
//! ```
//!
//! `max_reconnect_attempts = 0` (the default) retries forever; any other
//! value stops the kernel and surfaces [`TransferError::RetriesPolicy`].

pub mod ack;
pub mod backoff;
pub mod broker;
pub mod client;
pub mod config;
pub mod connection;
pub mod error;
pub mod publisher;
pub mod state;
pub mod subscription;
pub mod supervisor;

pub use broker::{ConnectOptions, MqttBroker};
pub use client::{generate_client_id, LastWill, CLIENT_ID_MAX_LENGTH};
pub use config::{Config, PublishOptions, TlsConfig};
pub use error::TransferError;
pub use state::ConnectionState;
pub use subscription::{topic_matches, MessageHandler};
pub use supervisor::BirthMessage;

/// Result type for MQTT operations.
pub type Result<T> = std::result::Result<T, TransferError>;
