//! Transport-agnostic broker contract.
//!
//! Providers, the polling executor and the orchestrator talk to the bus only
//! through [`Broker`]. `MqttBroker` is the production implementation;
//! the in-process `MemoryBroker` (`test-util` feature) backs the tests.

use std::time::Duration;

use async_trait::async_trait;
use hass_bridge_mqtt::{MqttBroker, TransferError};
use serde::Serialize;
use thiserror::Error;

pub use hass_bridge_mqtt::{MessageHandler, PublishOptions};

/// Availability payloads understood by Home Assistant.
pub const ONLINE: &str = "online";
pub const OFFLINE: &str = "offline";

#[derive(Debug, Error)]
pub enum BrokerError {
    /// The bus did not acknowledge in time.
    #[error("Timed out after {after:?}: {context}")]
    Timeout { context: String, after: Duration },

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Publish to '{topic}' failed: {reason}")]
    Publish { topic: String, reason: String },

    #[error("Subscribe to '{filter}' failed: {reason}")]
    Subscribe { filter: String, reason: String },

    #[error("Broker connection is closed")]
    Closed,
}

impl BrokerError {
    fn from_transfer(topic: &str, error: TransferError) -> Self {
        match error {
            TransferError::AckTimeout { topic, after } => BrokerError::Timeout {
                context: format!("publish to '{topic}'"),
                after,
            },
            TransferError::Closed => BrokerError::Closed,
            e @ (TransferError::ConnectFailed { .. }
            | TransferError::ClientConnection(_)
            | TransferError::RetriesPolicy(_)
            | TransferError::ShutdownTimeout(_)) => BrokerError::Connection(e.to_string()),
            e => BrokerError::Publish {
                topic: topic.to_string(),
                reason: e.to_string(),
            },
        }
    }
}

/// Body of an outbound message.
#[derive(Debug, Clone, PartialEq)]
pub enum PayloadData {
    /// Sent as-is.
    Raw(String),
    /// Serialized to JSON on publish.
    Structured(serde_json::Value),
}

impl PayloadData {
    pub fn structured<T: Serialize + ?Sized>(value: &T) -> Result<Self, BrokerError> {
        Ok(PayloadData::Structured(serde_json::to_value(value)?))
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, BrokerError> {
        match self {
            PayloadData::Raw(text) => Ok(text.as_bytes().to_vec()),
            PayloadData::Structured(value) => Ok(serde_json::to_vec(value)?),
        }
    }
}

impl From<&str> for PayloadData {
    fn from(text: &str) -> Self {
        PayloadData::Raw(text.to_string())
    }
}

impl From<String> for PayloadData {
    fn from(text: String) -> Self {
        PayloadData::Raw(text)
    }
}

impl From<serde_json::Value> for PayloadData {
    fn from(value: serde_json::Value) -> Self {
        PayloadData::Structured(value)
    }
}

/// An outbound message: where it goes, what it carries and how.
#[derive(Debug, Clone, PartialEq)]
pub struct Payload {
    pub topic: String,
    pub data: PayloadData,
    pub options: PublishOptions,
}

impl Payload {
    pub fn new(topic: impl Into<String>, data: impl Into<PayloadData>) -> Self {
        Self {
            topic: topic.into(),
            data: data.into(),
            options: PublishOptions::default(),
        }
    }

    pub fn retained(mut self) -> Self {
        self.options.retain = true;
        self
    }
}

/// One connection to a publish-subscribe bus.
///
/// Implementations must accept concurrent `publish` calls; each call waits
/// for its own acknowledgment independently.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Identifier used in logs and readiness output.
    fn name(&self) -> String;

    async fn publish(
        &self,
        topic: &str,
        data: &PayloadData,
        options: PublishOptions,
    ) -> Result<(), BrokerError>;

    /// Registers `handler` for every inbound message matching `filter`.
    ///
    /// The handler runs on the bus's own task and must not block.
    async fn subscribe(&self, filter: &str, handler: MessageHandler) -> Result<(), BrokerError>;

    async fn health(&self) -> Result<serde_json::Value, BrokerError>;

    /// Graceful teardown bounded by `deadline`.
    async fn disconnect(&self, deadline: Duration) -> Result<(), BrokerError>;

    /// Resolves with a reason once the connection is gone for good.
    async fn closed(&self) -> String {
        std::future::pending().await
    }

    async fn send(&self, payload: &Payload) -> Result<(), BrokerError> {
        self.publish(&payload.topic, &payload.data, payload.options)
            .await
    }
}

#[async_trait]
impl Broker for MqttBroker {
    fn name(&self) -> String {
        MqttBroker::name(self)
    }

    async fn publish(
        &self,
        topic: &str,
        data: &PayloadData,
        options: PublishOptions,
    ) -> Result<(), BrokerError> {
        let bytes = data.to_bytes()?;
        MqttBroker::publish(self, topic, bytes, options)
            .await
            .map_err(|e| BrokerError::from_transfer(topic, e))
    }

    async fn subscribe(&self, filter: &str, handler: MessageHandler) -> Result<(), BrokerError> {
        MqttBroker::subscribe(self, filter, PublishOptions::default().qos, handler)
            .await
            .map_err(|e| match e {
                TransferError::Closed => BrokerError::Closed,
                e => BrokerError::Subscribe {
                    filter: filter.to_string(),
                    reason: e.to_string(),
                },
            })
    }

    async fn health(&self) -> Result<serde_json::Value, BrokerError> {
        let state = self.state();
        if !state.is_connected() {
            return Err(BrokerError::Connection(state.to_string()));
        }
        Ok(serde_json::json!({
            "client_id": self.client_id(),
            "address": self.address(),
            "state": state.as_str(),
        }))
    }

    async fn disconnect(&self, deadline: Duration) -> Result<(), BrokerError> {
        MqttBroker::disconnect(self, deadline)
            .await
            .map_err(|e| match e {
                TransferError::ShutdownTimeout(after) => BrokerError::Timeout {
                    context: "disconnect".into(),
                    after,
                },
                e => BrokerError::Connection(e.to_string()),
            })
    }

    async fn closed(&self) -> String {
        MqttBroker::closed(self).await.to_string()
    }
}
