//! Birth message on every (re)connect.
//!
//! The last will registered at connect time announces `offline` when the
//! connection dies. The supervisor is its counterpart: each time the kernel
//! reports `Connected` it publishes the birth payload, retained, so the topic
//! flips back after a broker restart or network outage.

use tokio::{sync::watch, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn, Instrument};

use super::{
    config::PublishOptions, error::TransferError, publisher::Publisher, state::ConnectionState,
};

/// A retained message published after each successful connect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BirthMessage {
    pub topic: String,
    pub payload: Vec<u8>,
}

impl BirthMessage {
    pub fn new(topic: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
        }
    }
}

#[derive(Clone)]
pub struct Supervisor {
    state_rx: watch::Receiver<ConnectionState>,
    publisher: Publisher,
    birth: BirthMessage,
    cancel_token: CancellationToken,
}

impl Supervisor {
    pub fn new(
        birth: BirthMessage,
        state_rx: watch::Receiver<ConnectionState>,
        publisher: Publisher,
        cancel_token: CancellationToken,
    ) -> Self {
        Self {
            state_rx,
            publisher,
            birth,
            cancel_token,
        }
    }

    async fn on_connect(&self) -> Result<(), TransferError> {
        self.publisher
            .publish(
                &self.birth.topic,
                self.birth.payload.clone(),
                PublishOptions::retained(),
            )
            .await?;
        info!(topic = %self.birth.topic, "Published birth message");
        Ok(())
    }

    /// Spawns the monitoring task. It ends on cancellation or when the connection closes.
    pub fn monitor(self) -> JoinHandle<()> {
        tokio::spawn(self.run_monitor_loop().in_current_span())
    }

    async fn run_monitor_loop(mut self) {
        debug!("Supervisor monitoring started");

        // The kernel may have connected, or closed, before this task was scheduled.
        let initial = self.state_rx.borrow_and_update().clone();
        if initial.is_terminal() {
            debug!("Connection already closed, supervisor exiting");
            return;
        }
        let mut connected = initial.is_connected();
        if connected {
            self.announce().await;
        }

        loop {
            tokio::select! {
                _ = self.cancel_token.cancelled() => break,

                changed = self.state_rx.changed() => {
                    if changed.is_err() {
                        debug!("State channel closed, supervisor exiting");
                        break;
                    }

                    let state = self.state_rx.borrow_and_update().clone();
                    match state {
                        ConnectionState::Connected if !connected => {
                            connected = true;
                            self.announce().await;
                        }
                        ConnectionState::Connected => {}
                        ConnectionState::Closed => break,
                        _ => connected = false,
                    }
                }
            }
        }

        debug!("Supervisor monitoring stopped");
    }

    async fn announce(&self) {
        // An ack timeout here is not fatal; the next connect publishes again.
        if let Err(e) = self.on_connect().await {
            warn!(error = %e, "Failed to publish birth message");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, time::Duration};

    use rumqttc::{AsyncClient, MqttOptions};

    use super::*;
    use crate::ack::AckTracker;

    #[tokio::test]
    async fn test_publishes_birth_on_each_connect() {
        let (client, _event_loop) =
            AsyncClient::new(MqttOptions::new("hass_sup_test", "127.0.0.1", 1), 10);
        let acks = Arc::new(AckTracker::new());
        let publisher = Publisher::new(client, acks.clone(), Duration::from_secs(5));
        let (state_tx, state_rx) = watch::channel(ConnectionState::Connecting);
        let cancel = CancellationToken::new();

        let handle = Supervisor::new(
            BirthMessage::new("bridge/availability", "online"),
            state_rx,
            publisher,
            cancel.clone(),
        )
        .monitor();

        for pkid in 1..=2u16 {
            state_tx.send(ConnectionState::Connected).unwrap();
            tokio::time::timeout(Duration::from_secs(1), async {
                while acks.is_empty() {
                    tokio::time::sleep(Duration::from_millis(5)).await;
                }
            })
            .await
            .unwrap();
            acks.on_outgoing(pkid);
            acks.on_ack(pkid);

            state_tx
                .send(ConnectionState::Disconnected("network".into()))
                .unwrap();
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        cancel.cancel();
        handle.await.unwrap();
        assert!(acks.is_empty());
    }

    #[tokio::test]
    async fn test_stops_when_connection_closes() {
        let (client, _event_loop) =
            AsyncClient::new(MqttOptions::new("hass_sup_test", "127.0.0.1", 1), 10);
        let publisher = Publisher::new(client, Arc::new(AckTracker::new()), Duration::from_secs(1));
        let (state_tx, state_rx) = watch::channel(ConnectionState::Connecting);

        let handle = Supervisor::new(
            BirthMessage::new("bridge/availability", "online"),
            state_rx,
            publisher,
            CancellationToken::new(),
        )
        .monitor();

        state_tx.send(ConnectionState::Closed).unwrap();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_exits_when_started_after_close() {
        let (client, _event_loop) =
            AsyncClient::new(MqttOptions::new("hass_sup_test", "127.0.0.1", 1), 10);
        let publisher = Publisher::new(client, Arc::new(AckTracker::new()), Duration::from_secs(1));
        let (_state_tx, state_rx) = watch::channel(ConnectionState::Closed);

        let handle = Supervisor::new(
            BirthMessage::new("bridge/availability", "online"),
            state_rx,
            publisher,
            CancellationToken::new(),
        )
        .monitor();

        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
