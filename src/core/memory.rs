//! In-process bus implementing [`Broker`].
//!
//! Behaves like a broker for the parts the bridge relies on: retained
//! messages are replayed to new subscribers, wildcard filters match, and a
//! client that drops uncleanly has its last will delivered. Every delivered
//! message is also appended to a log that tests can inspect.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Mutex, MutexGuard,
    },
    time::Duration,
};

use async_trait::async_trait;
use hass_bridge_mqtt::topic_matches;
use tokio::sync::watch;
use tracing::debug;

use super::broker::{Broker, BrokerError, MessageHandler, PayloadData, PublishOptions};

/// A message as seen by the bus.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub topic: String,
    pub payload: Vec<u8>,
    pub retain: bool,
}

impl Message {
    pub fn new(topic: impl Into<String>, payload: impl Into<Vec<u8>>, retain: bool) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            retain,
        }
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.payload).into_owned()
    }
}

struct Subscription {
    client: u64,
    filter: String,
    handler: MessageHandler,
}

#[derive(Default)]
struct BusState {
    retained: HashMap<String, Vec<u8>>,
    subscriptions: Vec<Subscription>,
    log: Vec<Message>,
}

#[derive(Clone, Default)]
pub struct MemoryBus {
    state: Arc<Mutex<BusState>>,
    next_client: Arc<AtomicU64>,
}

impl MemoryBus {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BusState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Opens a client on this bus with an optional last will.
    pub fn connect(&self, name: impl Into<String>, last_will: Option<Message>) -> MemoryBroker {
        let (closed_tx, _) = watch::channel(None);
        MemoryBroker {
            bus: self.clone(),
            client: self.next_client.fetch_add(1, Ordering::Relaxed),
            name: name.into(),
            last_will,
            closed_tx,
            failing: AtomicBool::new(false),
            stalled: AtomicBool::new(false),
        }
    }

    /// Delivers a message to matching subscribers. Retained payloads replace
    /// the topic's retained value; an empty retained payload clears it.
    pub fn deliver(&self, message: Message) {
        let handlers: Vec<MessageHandler> = {
            let mut state = self.lock();
            if message.retain {
                if message.payload.is_empty() {
                    state.retained.remove(&message.topic);
                } else {
                    state
                        .retained
                        .insert(message.topic.clone(), message.payload.clone());
                }
            }
            state.log.push(message.clone());
            state
                .subscriptions
                .iter()
                .filter(|s| topic_matches(&s.filter, &message.topic))
                .map(|s| s.handler.clone())
                .collect()
        };

        for handler in handlers {
            handler(&message.topic, &message.payload);
        }
    }

    /// Every message delivered so far, in order.
    pub fn published(&self) -> Vec<Message> {
        self.lock().log.clone()
    }

    /// Payloads delivered to `topic`, in order, as text.
    pub fn payloads(&self, topic: &str) -> Vec<String> {
        self.lock()
            .log
            .iter()
            .filter(|m| m.topic == topic)
            .map(Message::text)
            .collect()
    }

    pub fn retained(&self, topic: &str) -> Option<String> {
        self.lock()
            .retained
            .get(topic)
            .map(|payload| String::from_utf8_lossy(payload).into_owned())
    }

    fn subscribe(&self, client: u64, filter: &str, handler: MessageHandler) {
        let replay: Vec<(String, Vec<u8>)> = {
            let mut state = self.lock();
            state.subscriptions.push(Subscription {
                client,
                filter: filter.to_string(),
                handler: handler.clone(),
            });
            state
                .retained
                .iter()
                .filter(|(topic, _)| topic_matches(filter, topic))
                .map(|(topic, payload)| (topic.clone(), payload.clone()))
                .collect()
        };

        for (topic, payload) in replay {
            handler(&topic, &payload);
        }
    }

    fn unsubscribe_all(&self, client: u64) {
        self.lock().subscriptions.retain(|s| s.client != client);
    }
}

pub struct MemoryBroker {
    bus: MemoryBus,
    client: u64,
    name: String,
    last_will: Option<Message>,
    closed_tx: watch::Sender<Option<String>>,
    failing: AtomicBool,
    stalled: AtomicBool,
}

impl MemoryBroker {
    pub fn bus(&self) -> &MemoryBus {
        &self.bus
    }

    pub fn is_closed(&self) -> bool {
        self.closed_tx.borrow().is_some()
    }

    /// Makes every following publish fail until reset.
    pub fn fail_publishes(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Makes every following publish hang, like a broker that stopped
    /// acknowledging.
    pub fn stall_publishes(&self) {
        self.stalled.store(true, Ordering::SeqCst);
    }

    /// Simulates a lost connection: the bus delivers the last will.
    pub fn drop_unclean(&self) {
        if self.close("connection lost") {
            if let Some(will) = self.last_will.clone() {
                debug!(topic = %will.topic, "Delivering last will");
                self.bus.deliver(will);
            }
        }
    }

    fn close(&self, reason: &str) -> bool {
        let first = self.closed_tx.send_if_modified(|closed| {
            if closed.is_some() {
                return false;
            }
            *closed = Some(reason.to_string());
            true
        });
        if first {
            self.bus.unsubscribe_all(self.client);
        }
        first
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    fn name(&self) -> String {
        format!("broker:memory:{}", self.name)
    }

    async fn publish(
        &self,
        topic: &str,
        data: &PayloadData,
        options: PublishOptions,
    ) -> Result<(), BrokerError> {
        if self.is_closed() {
            return Err(BrokerError::Closed);
        }
        if self.stalled.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        if self.failing.load(Ordering::SeqCst) {
            return Err(BrokerError::Publish {
                topic: topic.to_string(),
                reason: "rejected by test bus".into(),
            });
        }
        let payload = data.to_bytes()?;
        self.bus
            .deliver(Message::new(topic, payload, options.retain));
        Ok(())
    }

    async fn subscribe(&self, filter: &str, handler: MessageHandler) -> Result<(), BrokerError> {
        if self.is_closed() {
            return Err(BrokerError::Closed);
        }
        self.bus.subscribe(self.client, filter, handler);
        Ok(())
    }

    async fn health(&self) -> Result<serde_json::Value, BrokerError> {
        if self.is_closed() {
            return Err(BrokerError::Closed);
        }
        Ok(serde_json::json!({ "client": self.name }))
    }

    async fn disconnect(&self, _deadline: Duration) -> Result<(), BrokerError> {
        self.close("disconnected");
        Ok(())
    }

    async fn closed(&self) -> String {
        let mut closed_rx = self.closed_tx.subscribe();
        // The sender lives as long as the broker, so the wait cannot fail.
        let _ = closed_rx.wait_for(Option::is_some).await;
        self.closed_tx.borrow().clone().unwrap_or_default()
    }
}
