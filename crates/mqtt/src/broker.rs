//! `MqttBroker`: one owned broker connection.
//!
//! `connect` builds the client, starts the connection kernel and waits for
//! the first CONNACK. After that the handle publishes with acknowledgment,
//! registers subscriptions that survive reconnects and tears the connection
//! down within a deadline.
//!
//! ```ignore
//! let broker = MqttBroker::connect(&config, ConnectOptions::new("bridge")
//!     .last_will(LastWill::retained(AVAILABILITY, "offline"))
//!     .birth(BirthMessage::new(AVAILABILITY, "online"))).await?;
//! broker.publish("bridge/state", payload, PublishOptions::default()).await?;
//! broker.disconnect(Duration::from_secs(5)).await?;
//! ```

use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use rumqttc::{AsyncClient, NetworkOptions};
use tokio::{sync::watch, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn, Instrument};

use super::{
    ack::AckTracker,
    backoff::{AttemptLimit, Backoff},
    client::{ClientBuilder, LastWill},
    config::{qos_from_u8, Config, PublishOptions},
    connection::ConnectionKernel,
    error::TransferError,
    publisher::Publisher,
    state::ConnectionState,
    subscription::{MessageHandler, Subscriptions},
    supervisor::{BirthMessage, Supervisor},
};

/// Per-connection options that are not part of the file configuration.
#[derive(Debug, Clone, Default)]
pub struct ConnectOptions {
    /// Short tag embedded in the generated client id.
    pub purpose: String,
    pub last_will: Option<LastWill>,
    pub birth: Option<BirthMessage>,
}

impl ConnectOptions {
    pub fn new(purpose: impl Into<String>) -> Self {
        Self {
            purpose: purpose.into(),
            ..Default::default()
        }
    }

    pub fn last_will(mut self, will: LastWill) -> Self {
        self.last_will = Some(will);
        self
    }

    pub fn birth(mut self, birth: BirthMessage) -> Self {
        self.birth = Some(birth);
        self
    }
}

type Task<T> = Mutex<Option<JoinHandle<T>>>;

pub struct MqttBroker {
    client_id: String,
    address: String,
    client: AsyncClient,
    publisher: Publisher,
    subscriptions: Subscriptions,
    state_rx: watch::Receiver<ConnectionState>,
    cancel: CancellationToken,
    kernel: Task<Result<(), TransferError>>,
    supervisor: Task<()>,
}

impl MqttBroker {
    /// Connects and waits for the broker to accept the session.
    ///
    /// Fails with [`TransferError::ConnectFailed`] when no CONNACK arrives
    /// within `connection_timeout`, or with the kernel's own error when the
    /// failure is fatal (bad credentials, TLS).
    pub async fn connect(config: &Config, options: ConnectOptions) -> Result<Self, TransferError> {
        let mut builder = ClientBuilder::from_config(config, &options.purpose)?;
        let client_id = builder.client_id().to_string();
        if let Some(will) = options.last_will {
            builder = builder.set_last_will(will);
        }
        let (client, mut event_loop) = builder.build()?;

        let mut network = NetworkOptions::new();
        network.set_connection_timeout(config.connection_timeout);
        event_loop.set_network_options(network);

        let cancel = CancellationToken::new();
        let acks = Arc::new(AckTracker::new());
        let subscriptions = Subscriptions::new();
        let backoff = Backoff::new(
            Duration::from_millis(config.reconnect_delay_ms),
            Duration::from_secs(config.max_reconnect_delay),
            config.reconnect_multiplier,
        )
        .with_limit(AttemptLimit::from_config(config.max_reconnect_attempts));

        let kernel = ConnectionKernel::new(client.clone(), event_loop, cancel.child_token())
            .with_backoff(backoff)
            .with_acks(acks.clone())
            .with_subscriptions(subscriptions.clone());
        let mut state_rx = kernel.subscribe_state();
        let kernel = tokio::spawn(kernel.run().in_current_span());

        let address = config.address();
        info!(client_id = %client_id, address = %address, "Connecting to MQTT broker");

        let connected = tokio::time::timeout(config.connection_timeout(), async {
            state_rx
                .wait_for(|state| state.is_connected() || state.is_terminal())
                .await
                .map(|state| state.clone())
        })
        .await;

        let failure = match connected {
            Ok(Ok(state)) if state.is_connected() => None,
            Ok(Ok(state)) => Some(state.to_string()),
            // The kernel stopped before connecting; its result says why.
            Ok(Err(_)) => {
                return match kernel.await {
                    Ok(Err(e)) => Err(e),
                    _ => Err(TransferError::ConnectFailed {
                        address,
                        reason: "connection kernel stopped".into(),
                    }),
                };
            }
            Err(_) => Some(format!(
                "no CONNACK within {}s ({})",
                config.connection_timeout,
                *state_rx.borrow()
            )),
        };

        if let Some(reason) = failure {
            cancel.cancel();
            return Err(TransferError::ConnectFailed { address, reason });
        }

        let publisher = Publisher::new(client.clone(), acks, config.ack_timeout());

        let supervisor = options.birth.map(|birth| {
            Supervisor::new(
                birth,
                state_rx.clone(),
                publisher.clone(),
                cancel.child_token(),
            )
            .monitor()
        });

        info!(client_id = %client_id, "Connected to MQTT broker");
        Ok(Self {
            client_id,
            address,
            client,
            publisher,
            subscriptions,
            state_rx,
            cancel,
            kernel: Mutex::new(Some(kernel)),
            supervisor: Mutex::new(supervisor),
        })
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    /// Identifier used in logs and health output.
    pub fn name(&self) -> String {
        format!("broker:mqtt:{}", self.client_id)
    }

    pub fn state(&self) -> ConnectionState {
        self.state_rx.borrow().clone()
    }

    pub fn is_connected(&self) -> bool {
        self.state_rx.borrow().is_connected()
    }

    pub fn state_receiver(&self) -> watch::Receiver<ConnectionState> {
        self.state_rx.clone()
    }

    pub async fn publish(
        &self,
        topic: &str,
        payload: impl Into<Vec<u8>>,
        options: PublishOptions,
    ) -> Result<(), TransferError> {
        if self.state_rx.borrow().is_terminal() || self.cancel.is_cancelled() {
            return Err(TransferError::Closed);
        }
        self.publisher.publish(topic, payload, options).await
    }

    /// Registers `handler` for `filter`. The subscription is renewed after every reconnect.
    pub async fn subscribe(
        &self,
        filter: &str,
        qos: u8,
        handler: MessageHandler,
    ) -> Result<(), TransferError> {
        if filter.is_empty() {
            return Err(TransferError::InvalidOptions("Topic filter cannot be empty".into()));
        }
        if self.state_rx.borrow().is_terminal() {
            return Err(TransferError::Closed);
        }
        let qos = qos_from_u8(qos)?;

        self.subscriptions.insert(filter, qos, handler);
        if self.is_connected() {
            self.client.subscribe(filter, qos).await?;
        }
        info!(filter, "Subscribed");
        Ok(())
    }

    /// Resolves once the connection has stopped for good and returns its last state.
    pub async fn closed(&self) -> ConnectionState {
        let mut state_rx = self.state_rx.clone();
        // An error means the kernel dropped its sender; the last value stands.
        let _ = state_rx.wait_for(ConnectionState::is_terminal).await;
        self.state_rx.borrow().clone()
    }

    /// Waits for outstanding publishes, sends DISCONNECT and stops the kernel.
    ///
    /// Past `deadline` the connection is dropped without DISCONNECT, which
    /// makes the broker deliver the last will.
    pub async fn disconnect(&self, deadline: Duration) -> Result<(), TransferError> {
        let kernel = take(&self.kernel);
        let supervisor = take(&self.supervisor);

        let graceful = tokio::time::timeout(deadline, async {
            self.publisher.drain().wait_idle().await;
            if let Err(e) = self.client.disconnect().await {
                debug!(error = %e, "Connection already gone, nothing to disconnect");
            }
            match kernel {
                Some(handle) => match handle.await {
                    Ok(result) => result,
                    Err(e) => {
                        warn!(error = %e, "Connection kernel task failed");
                        Ok(())
                    }
                },
                None => Ok(()),
            }
        })
        .await;

        self.cancel.cancel();
        if let Some(handle) = supervisor {
            let _ = handle.await;
        }

        match graceful {
            Ok(result) => {
                debug!(client_id = %self.client_id, "Disconnected from MQTT broker");
                result
            }
            Err(_) => {
                warn!(client_id = %self.client_id, ?deadline, "Disconnect timed out, dropping connection");
                Err(TransferError::ShutdownTimeout(deadline))
            }
        }
    }
}

impl Drop for MqttBroker {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

fn take<T>(slot: &Task<T>) -> Option<JoinHandle<T>> {
    slot.lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
        .take()
}
