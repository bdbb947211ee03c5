//! Per-provider polling loop.
//!
//! Each enabled provider gets one `Executor` task. The task polls on the
//! provider's interval and hands the resulting messages to a bounded queue;
//! a companion task drains the queue into the broker, so publishes for one
//! provider are strictly ordered. A full queue blocks the poller.
//!
//! On cancellation the poller stops, enqueues a single `offline` for the
//! provider's availability topic and waits for the queue to drain. Updates
//! still queued at that point are dropped, so no state is published after
//! cancellation.

use std::{sync::Arc, time::Duration};

use tokio::{
    sync::mpsc,
    task::JoinHandle,
    time::MissedTickBehavior,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, trace, warn, Instrument};

use super::{
    broker::{Broker, Payload, PayloadData, OFFLINE, ONLINE},
    providers::{Observations, Provider},
};

/// Capacity of the queue between a poller and its publisher.
pub const QUEUE_CAPACITY: usize = 16;

#[derive(Debug)]
enum Publication {
    /// Result of a tick; skipped once cancelled.
    Update(Payload),
    /// Last message of the task; always published.
    Final(Payload),
}

pub struct Executor {
    provider: Arc<dyn Provider>,
    broker: Arc<dyn Broker>,
    cancel: CancellationToken,
    interval: Duration,
}

impl Executor {
    /// Returns `None` for a provider without a poll interval (disabled).
    pub fn new(
        provider: Arc<dyn Provider>,
        broker: Arc<dyn Broker>,
        cancel: CancellationToken,
    ) -> Option<Self> {
        let interval = provider.interval()?;
        Some(Self {
            provider,
            broker,
            cancel,
            interval,
        })
    }

    pub fn spawn(self) -> JoinHandle<()> {
        let span = info_span!("provider", provider = %self.provider.name());
        tokio::spawn(self.run().instrument(span))
    }

    pub async fn run(self) {
        let (tx, rx) = mpsc::channel(QUEUE_CAPACITY);
        let publisher = tokio::spawn(
            drain_queue(self.broker.clone(), rx, self.cancel.clone()).in_current_span(),
        );

        self.poll_until_cancelled(&tx).await;

        let offline = Payload::new(self.provider.availability_topic(), OFFLINE);
        if tx.send(Publication::Final(offline)).await.is_err() {
            warn!("Publish queue closed before the final availability update");
        }
        drop(tx);

        if let Err(e) = publisher.await {
            error!(error = %e, "Publish task failed");
        }
        info!("Polling stopped");
    }

    async fn poll_until_cancelled(&self, tx: &mpsc::Sender<Publication>) {
        let state_topic = self.provider.state_topic();
        let availability_topic = self.provider.availability_topic();
        let mut last_state: Option<Observations> = None;

        // The first tick completes immediately.
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(interval = ?self.interval, "Polling started");

        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return,
                _ = ticker.tick() => {}
            }

            let outcome = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return,
                outcome = self.provider.poll() => outcome,
            };

            let updates = match outcome {
                Ok(Some(state)) => {
                    if last_state.as_ref() == Some(&state) {
                        trace!("State unchanged");
                    } else {
                        debug!("State changed");
                    }
                    let data = PayloadData::Structured(state.clone());
                    last_state = Some(state);
                    vec![
                        Payload::new(&state_topic, data),
                        Payload::new(&availability_topic, ONLINE),
                    ]
                }
                Ok(None) => {
                    debug!("Device unavailable");
                    vec![Payload::new(&availability_topic, OFFLINE)]
                }
                Err(e) => {
                    error!(error = %e, "Poll failed");
                    vec![Payload::new(&availability_topic, OFFLINE)]
                }
            };

            for payload in updates {
                tokio::select! {
                    biased;
                    _ = self.cancel.cancelled() => return,
                    sent = tx.send(Publication::Update(payload)) => {
                        if sent.is_err() {
                            return;
                        }
                    }
                }
            }
        }
    }
}

async fn drain_queue(
    broker: Arc<dyn Broker>,
    mut rx: mpsc::Receiver<Publication>,
    cancel: CancellationToken,
) {
    while let Some(publication) = rx.recv().await {
        let (payload, last) = match publication {
            Publication::Update(payload) if cancel.is_cancelled() => {
                trace!(topic = %payload.topic, "Dropping update queued before cancellation");
                continue;
            }
            Publication::Update(payload) => (payload, false),
            Publication::Final(payload) => (payload, true),
        };

        if let Err(e) = broker.send(&payload).await {
            error!(topic = %payload.topic, error = %e, "Publish failed");
        }
        if last {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use tracing_test::traced_test;

    use super::*;
    use crate::core::{memory::MemoryBus, providers::testing::StubProvider};

    const STATE: &str = "homeassistant_integrations/router/state";
    const AVAILABILITY: &str = "homeassistant_integrations/router/availability";

    async fn wait_until(mut done: impl FnMut() -> bool) {
        for _ in 0..200 {
            if done() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached in time");
    }

    fn start(provider: StubProvider, bus: &MemoryBus) -> (JoinHandle<()>, CancellationToken) {
        let mut provider = provider;
        provider.configure().unwrap();
        let cancel = CancellationToken::new();
        let executor = Executor::new(
            Arc::new(provider),
            Arc::new(bus.connect("bridge", None)),
            cancel.clone(),
        )
        .unwrap();
        (executor.spawn(), cancel)
    }

    #[tokio::test]
    async fn test_disabled_provider_has_no_executor() {
        let bus = MemoryBus::new();
        let provider = StubProvider::new("router");
        assert!(Executor::new(
            Arc::new(provider),
            Arc::new(bus.connect("bridge", None)),
            CancellationToken::new()
        )
        .is_none());
    }

    #[tokio::test]
    #[traced_test]
    async fn test_success_publishes_state_then_online() {
        let bus = MemoryBus::new();
        let (task, cancel) = start(StubProvider::new("router"), &bus);

        wait_until(|| !bus.payloads(AVAILABILITY).is_empty()).await;
        cancel.cancel();
        task.await.unwrap();

        let topics: Vec<_> = bus.published().into_iter().map(|m| m.topic).collect();
        assert_eq!(topics[..2], [STATE, AVAILABILITY]);
        assert_eq!(bus.payloads(STATE)[0], json!({"count": 1}).to_string());
        assert_eq!(bus.payloads(AVAILABILITY)[0], ONLINE);
        assert!(!logs_contain("Poll failed"));
    }

    #[tokio::test]
    #[traced_test]
    async fn test_unavailable_device_goes_offline_without_error() {
        let bus = MemoryBus::new();
        let (task, cancel) = start(StubProvider::new("router").unavailable(), &bus);

        wait_until(|| !bus.payloads(AVAILABILITY).is_empty()).await;
        cancel.cancel();
        task.await.unwrap();

        assert_eq!(bus.payloads(AVAILABILITY)[0], OFFLINE);
        assert!(bus.payloads(STATE).is_empty());
        assert!(logs_contain("Device unavailable"));
        assert!(!logs_contain("Poll failed"));
    }

    #[tokio::test]
    #[traced_test]
    async fn test_poll_error_goes_offline_and_logs() {
        let bus = MemoryBus::new();
        let (task, cancel) = start(StubProvider::new("router").failing(), &bus);

        wait_until(|| !bus.payloads(AVAILABILITY).is_empty()).await;
        cancel.cancel();
        task.await.unwrap();

        assert_eq!(bus.payloads(AVAILABILITY)[0], OFFLINE);
        assert!(bus.payloads(STATE).is_empty());
        assert!(logs_contain("Poll failed"));
    }

    #[tokio::test]
    async fn test_polling_continues_after_failure() {
        let bus = MemoryBus::new();
        let provider = StubProvider::new("router").outcome(|n| {
            if n == 1 {
                Err(crate::core::providers::DeviceError::Status(503).into())
            } else {
                Ok(Some(json!({ "count": n })))
            }
        });
        let (task, cancel) = start(provider, &bus);

        wait_until(|| bus.payloads(AVAILABILITY).contains(&ONLINE.to_string())).await;
        cancel.cancel();
        task.await.unwrap();

        let availability = bus.payloads(AVAILABILITY);
        assert_eq!(availability[..2], [OFFLINE, ONLINE]);
    }

    #[tokio::test]
    async fn test_cancellation_publishes_single_offline_last() {
        let bus = MemoryBus::new();
        let (task, cancel) = start(StubProvider::new("router"), &bus);

        wait_until(|| bus.payloads(AVAILABILITY).len() >= 3).await;
        cancel.cancel();
        task.await.unwrap();
        let published = bus.published();

        let last = published.last().unwrap();
        assert_eq!((last.topic.as_str(), last.text().as_str()), (AVAILABILITY, OFFLINE));
        assert_eq!(
            bus.payloads(AVAILABILITY)
                .iter()
                .filter(|p| p.as_str() == OFFLINE)
                .count(),
            1
        );

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(bus.published().len(), published.len());
    }

    #[tokio::test]
    async fn test_cancellation_interrupts_slow_poll() {
        let bus = MemoryBus::new();
        let provider = StubProvider::new("router").poll_delay(Duration::from_secs(30));
        let (task, cancel) = start(provider, &bus);

        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();

        assert!(bus.payloads(STATE).is_empty());
        assert_eq!(bus.payloads(AVAILABILITY), vec![OFFLINE]);
    }
}
