//! Acknowledged publishing.
//!
//! `Publisher` is cheap to clone and safe to use from many tasks at once.
//! Each call waits for its own acknowledgment under its own deadline; calls
//! only share the short critical section that hands the request to the
//! client, which keeps the acknowledgment queue in request order.

use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use rumqttc::AsyncClient;
use tokio::sync::{Mutex, Notify};
use tracing::{debug, trace, warn};

use super::{ack::AckTracker, config::PublishOptions, error::TransferError};

/// Counts publishes that have not resolved yet, so a disconnect can wait for them.
#[derive(Debug, Default)]
pub struct PublishDrain {
    inflight: AtomicUsize,
    notify: Notify,
}

impl PublishDrain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enter(self: &Arc<Self>) -> PublishGuard {
        self.inflight.fetch_add(1, Ordering::AcqRel);
        PublishGuard {
            drain: self.clone(),
        }
    }

    pub fn inflight(&self) -> usize {
        self.inflight.load(Ordering::Acquire)
    }

    pub async fn wait_idle(&self) {
        loop {
            let notified = self.notify.notified();
            if self.inflight() == 0 {
                return;
            }
            notified.await;
        }
    }
}

pub struct PublishGuard {
    drain: Arc<PublishDrain>,
}

impl Drop for PublishGuard {
    fn drop(&mut self) {
        if self.drain.inflight.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.drain.notify.notify_waiters();
        }
    }
}

#[derive(Clone)]
pub struct Publisher {
    client: AsyncClient,
    acks: Arc<AckTracker>,
    order: Arc<Mutex<()>>,
    drain: Arc<PublishDrain>,
    ack_timeout: Duration,
}

impl Publisher {
    pub fn new(client: AsyncClient, acks: Arc<AckTracker>, ack_timeout: Duration) -> Self {
        Self {
            client,
            acks,
            order: Arc::new(Mutex::new(())),
            drain: Arc::new(PublishDrain::new()),
            ack_timeout,
        }
    }

    pub fn drain(&self) -> Arc<PublishDrain> {
        self.drain.clone()
    }

    pub fn ack_timeout(&self) -> Duration {
        self.ack_timeout
    }

    /// Publishes `payload` and waits for the broker acknowledgment.
    ///
    /// QoS 0 resolves once the packet is written. Fails with
    /// [`TransferError::AckTimeout`] when the acknowledgment does not arrive
    /// within the configured bound, or at once when the client request queue
    /// is full.
    pub async fn publish(
        &self,
        topic: &str,
        payload: impl Into<Vec<u8>>,
        options: PublishOptions,
    ) -> Result<(), TransferError> {
        validate_topic(topic)?;
        let qos = options.qos()?;
        let _guard = self.drain.enter();

        let ack = {
            let _order = self.order.lock().await;
            let ack = self.acks.enqueue(qos);
            // Never wait on the request channel: the event loop stops draining
            // it while reconnecting, and a full channel must not outlive the bound.
            match self
                .client
                .try_publish(topic, qos, options.retain, payload.into())
            {
                Ok(()) => ack,
                Err(rumqttc::ClientError::TryRequest(_)) => {
                    self.acks.cancel_last();
                    warn!(topic, "Request queue full, publish dropped");
                    return Err(TransferError::AckTimeout {
                        topic: topic.to_string(),
                        after: self.ack_timeout,
                    });
                }
                Err(e) => {
                    self.acks.cancel_last();
                    return Err(e.into());
                }
            }
        };
        trace!(topic, ?qos, retain = options.retain, "Publish queued");

        match tokio::time::timeout(self.ack_timeout, ack).await {
            Ok(Ok(Ok(()))) => {
                debug!(topic, "Publish acknowledged");
                Ok(())
            }
            Ok(Ok(Err(reason))) => Err(TransferError::AckDropped {
                topic: topic.to_string(),
                reason,
            }),
            Ok(Err(_)) => Err(TransferError::Closed),
            Err(_) => Err(TransferError::AckTimeout {
                topic: topic.to_string(),
                after: self.ack_timeout,
            }),
        }
    }
}

fn validate_topic(topic: &str) -> Result<(), TransferError> {
    if topic.is_empty() {
        return Err(TransferError::InvalidOptions("Topic cannot be empty".into()));
    }
    if topic.contains(['+', '#']) {
        return Err(TransferError::InvalidOptions(format!(
            "Wildcards are not allowed in a publish topic: {topic}"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use rumqttc::MqttOptions;

    use super::*;

    fn publisher(ack_timeout: Duration) -> (Publisher, Arc<AckTracker>, rumqttc::EventLoop) {
        let (client, event_loop) = AsyncClient::new(MqttOptions::new("hass_pub_test", "127.0.0.1", 1), 10);
        let acks = Arc::new(AckTracker::new());
        (Publisher::new(client, acks.clone(), ack_timeout), acks, event_loop)
    }

    #[tokio::test]
    async fn test_publish_times_out_without_ack() {
        let (publisher, acks, _event_loop) = publisher(Duration::from_millis(50));

        let result = publisher
            .publish("bridge/state", "on", PublishOptions::default())
            .await;

        assert!(matches!(result, Err(TransferError::AckTimeout { .. })));
        // the request is still queued on the client, its waiter stays registered
        assert_eq!(acks.len(), 1);
        assert_eq!(publisher.drain().inflight(), 0);
    }

    #[tokio::test]
    async fn test_full_request_queue_fails_within_bound() {
        // The event loop is never polled, as while it sleeps in reconnect backoff.
        let (client, _event_loop) =
            AsyncClient::new(MqttOptions::new("hass_pub_test", "127.0.0.1", 1), 2);
        let acks = Arc::new(AckTracker::new());
        let publisher = Publisher::new(client, acks.clone(), Duration::from_millis(50));

        for _ in 0..4 {
            let result = tokio::time::timeout(
                Duration::from_secs(1),
                publisher.publish("bridge/state", "on", PublishOptions::default()),
            )
            .await
            .expect("publish must resolve within its bound");
            assert!(matches!(result, Err(TransferError::AckTimeout { .. })));
        }

        // only the two requests that reached the channel keep a waiter
        assert_eq!(acks.len(), 2);
        assert_eq!(publisher.drain().inflight(), 0);
    }

    #[tokio::test]
    async fn test_publish_resolves_on_ack() {
        let (publisher, acks, _event_loop) = publisher(Duration::from_secs(5));

        let task = {
            let publisher = publisher.clone();
            tokio::spawn(async move {
                publisher
                    .publish("bridge/state", "on", PublishOptions::default())
                    .await
            })
        };

        while acks.is_empty() {
            tokio::task::yield_now().await;
        }
        acks.on_outgoing(1);
        acks.on_ack(1);

        assert!(task.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_publish_reports_dropped_ack() {
        let (publisher, acks, _event_loop) = publisher(Duration::from_secs(5));

        let task = {
            let publisher = publisher.clone();
            tokio::spawn(async move {
                publisher
                    .publish("bridge/state", "on", PublishOptions::default())
                    .await
            })
        };

        while acks.is_empty() {
            tokio::task::yield_now().await;
        }
        acks.fail_all("connection closed");

        assert!(matches!(
            task.await.unwrap(),
            Err(TransferError::AckDropped { .. })
        ));
    }

    #[tokio::test]
    async fn test_rejects_invalid_topics() {
        let (publisher, _, _event_loop) = publisher(Duration::from_secs(1));

        for topic in ["", "bridge/+/state", "bridge/#"] {
            let result = publisher.publish(topic, "x", PublishOptions::default()).await;
            assert!(matches!(result, Err(TransferError::InvalidOptions(_))));
        }
    }

    #[tokio::test]
    async fn test_drain_waits_for_guards() {
        let drain = Arc::new(PublishDrain::new());
        let guard = drain.enter();

        let waiter = {
            let drain = drain.clone();
            tokio::spawn(async move { drain.wait_idle().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        drop(guard);
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
    }
}
