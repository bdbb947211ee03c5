//! Subscription registry and inbound message dispatch.
//!
//! Every filter is remembered together with its handler so the kernel can
//! resubscribe after a reconnect (clean sessions lose broker-side state) and
//! route inbound publishes without a round trip through the caller.

use std::{
    fmt,
    sync::{Arc, RwLock},
};

use rumqttc::{QoS, SubscribeFilter};
use tracing::{debug, trace};

/// Callback run on the connection kernel task for each matching message.
///
/// It must return quickly: the kernel does not poll the network while a
/// handler runs.
pub type MessageHandler = Arc<dyn Fn(&str, &[u8]) + Send + Sync>;

struct Entry {
    filter: String,
    qos: QoS,
    handler: MessageHandler,
}

#[derive(Clone, Default)]
pub struct Subscriptions {
    entries: Arc<RwLock<Vec<Entry>>>,
}

impl fmt::Debug for Subscriptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscriptions")
            .field("filters", &self.filters().len())
            .finish()
    }
}

impl Subscriptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, filter: impl Into<String>, qos: QoS, handler: MessageHandler) {
        let filter = filter.into();
        debug!(filter = %filter, "Registered subscription");
        self.write().push(Entry {
            filter,
            qos,
            handler,
        });
    }

    /// Filters to send in a SUBSCRIBE after (re)connecting.
    pub fn filters(&self) -> Vec<SubscribeFilter> {
        self.read()
            .iter()
            .map(|entry| SubscribeFilter::new(entry.filter.clone(), entry.qos))
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// Runs every handler whose filter matches `topic`. Returns how many ran.
    pub fn dispatch(&self, topic: &str, payload: &[u8]) -> usize {
        // Handlers run outside the lock so one may register another subscription.
        let handlers: Vec<MessageHandler> = self
            .read()
            .iter()
            .filter(|entry| topic_matches(&entry.filter, topic))
            .map(|entry| entry.handler.clone())
            .collect();

        if handlers.is_empty() {
            trace!(topic, "No handler for inbound message");
        }
        for handler in &handlers {
            handler(topic, payload);
        }
        handlers.len()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Vec<Entry>> {
        self.entries.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Vec<Entry>> {
        self.entries.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// MQTT topic filter matching with `+` (one level) and `#` (remaining levels).
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    let mut filter_levels = filter.split('/');
    let mut topic_levels = topic.split('/');

    loop {
        match (filter_levels.next(), topic_levels.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => continue,
            (Some(f), Some(t)) if f == t => continue,
            (None, None) => return true,
            _ => return false,
        }
    }
}
