//! Connection kernel: drives the rumqttc event loop, reconnects with
//! backoff and feeds acknowledgments and inbound messages to their owners.
//!
//! ```text
//! MqttBroker (publish / subscribe / disconnect)
//!     |  AsyncClient requests
//!     v
//! ConnectionKernel ---- state watch ----> supervisor, readiness
//!     |  EventLoop::poll
//!     |-- Outgoing::Publish / PubAck / PubComp --> AckTracker
//!     '-- Incoming Publish -------------------> Subscriptions
//! ```
//!
//! The kernel runs on one task until the client disconnects, the token is
//! cancelled, a fatal error occurs or the backoff limit is exhausted.

use std::sync::Arc;

use rumqttc::{
    AsyncClient, ConnectReturnCode, ConnectionError, Event, EventLoop, Outgoing, Packet,
};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use super::{
    ack::AckTracker, backoff::Backoff, error::TransferError, state::ConnectionState,
    subscription::Subscriptions,
};

pub struct ConnectionKernel {
    client: AsyncClient,
    event_loop: EventLoop,
    backoff: Backoff,
    cancel: CancellationToken,
    state_tx: watch::Sender<ConnectionState>,
    acks: Arc<AckTracker>,
    subscriptions: Subscriptions,
}

impl ConnectionKernel {
    pub fn new(client: AsyncClient, event_loop: EventLoop, cancel: CancellationToken) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Connecting);
        Self {
            client,
            event_loop,
            backoff: Backoff::default(),
            cancel,
            state_tx,
            acks: Arc::new(AckTracker::new()),
            subscriptions: Subscriptions::new(),
        }
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_acks(mut self, acks: Arc<AckTracker>) -> Self {
        self.acks = acks;
        self
    }

    pub fn with_subscriptions(mut self, subscriptions: Subscriptions) -> Self {
        self.subscriptions = subscriptions;
        self
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    fn update_state(&self, state: ConnectionState) {
        let changed = self.state_tx.send_if_modified(|current| {
            if *current == state {
                false
            } else {
                *current = state.clone();
                true
            }
        });

        if changed {
            info!(state = %state, "Connection state changed");
        }
    }

    /// Runs until the connection is closed for good.
    ///
    /// Publishes still waiting for acknowledgment are failed on the way out.
    pub async fn run(mut self) -> Result<(), TransferError> {
        info!("Starting connection event loop");
        let result = self.drive().await;

        let reason = match &result {
            Ok(()) => "connection closed".to_string(),
            Err(e) => e.to_string(),
        };
        self.acks.fail_all(&reason);

        if let Err(e) = &result {
            self.update_state(ConnectionState::Disconnected(e.to_string()));
        }
        info!("Connection event loop stopped");
        result
    }

    async fn drive(&mut self) -> Result<(), TransferError> {
        loop {
            tokio::select! {
                biased;

                _ = self.cancel.cancelled() => {
                    info!("Connection kernel cancelled");
                    self.update_state(ConnectionState::Closed);
                    return Ok(());
                }

                event = self.event_loop.poll() => match event {
                    Ok(event) => {
                        if self.handle_event(event) == Flow::Stop {
                            return Ok(());
                        }
                    }
                    Err(ConnectionError::RequestsDone) => {
                        debug!("All client handles dropped");
                        self.update_state(ConnectionState::Closed);
                        return Ok(());
                    }
                    Err(e) => self.handle_error(e).await?,
                }
            }
        }
    }

    fn handle_event(&mut self, event: Event) -> Flow {
        match event {
            Event::Incoming(Packet::ConnAck(conn_ack)) => {
                if conn_ack.code == ConnectReturnCode::Success {
                    info!("Connection established");
                    self.backoff.reset();
                    self.resubscribe();
                    self.update_state(ConnectionState::Connected);
                }
            }
            Event::Incoming(Packet::PubAck(ack)) => self.acks.on_ack(ack.pkid),
            Event::Incoming(Packet::PubComp(comp)) => self.acks.on_ack(comp.pkid),
            Event::Incoming(Packet::Publish(publish)) => {
                trace!(topic = %publish.topic, "Received publish");
                self.subscriptions.dispatch(&publish.topic, &publish.payload);
            }
            Event::Incoming(Packet::Disconnect) => {
                warn!("Disconnected by broker");
                self.update_state(ConnectionState::Disconnected(
                    "Disconnected by broker".into(),
                ));
            }
            Event::Outgoing(Outgoing::Publish(pkid)) => self.acks.on_outgoing(pkid),
            Event::Outgoing(Outgoing::Disconnect) => {
                info!("Disconnect sent, closing connection");
                self.update_state(ConnectionState::Closed);
                return Flow::Stop;
            }
            other => trace!(event = ?other, "Connection event"),
        }
        Flow::Continue
    }

    /// Subscriptions are requested without waiting: the kernel is the
    /// consumer of the request channel and must not block on it.
    fn resubscribe(&self) {
        if self.subscriptions.is_empty() {
            return;
        }

        let filters = self.subscriptions.filters();
        let count = filters.len();
        match self.client.try_subscribe_many(filters) {
            Ok(()) => debug!(count, "Resubscribed"),
            Err(e) => warn!(error = %e, "Failed to resubscribe"),
        }
    }

    async fn handle_error(&mut self, err: ConnectionError) -> Result<(), TransferError> {
        let reason = get_error_message(&err);

        if is_fatal_error(&err) {
            error!(error = %reason, "Fatal connection error, giving up");
            return Err(TransferError::from(err));
        }

        self.update_state(ConnectionState::Disconnected(reason.clone()));

        let sleep = self.backoff.next_sleep().map_err(|e| {
            error!(error = %e, "Reconnect attempts exhausted");
            TransferError::RetriesPolicy(e)
        })?;

        warn!(
            "Reconnecting in {:.2} seconds due to error: {}",
            sleep.as_secs_f64(),
            reason
        );
        self.update_state(ConnectionState::Reconnecting(sleep.as_secs_f64()));

        tokio::select! {
            _ = self.cancel.cancelled() => {}
            _ = tokio::time::sleep(sleep) => {}
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    Stop,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Disposition {
    Fatal,
    Reconnect,
}

fn classify_connection_error(err: &ConnectionError) -> Disposition {
    use Disposition::*;

    match err {
        // Certificates or crypto setup are wrong; retrying cannot fix that.
        ConnectionError::Tls(_) => Fatal,

        // Broker answered CONNECT with something other than CONNACK.
        ConnectionError::NotConnAck(_) => Fatal,

        // Ping timeouts and unexpected packets surface here.
        ConnectionError::MqttState(_) => Reconnect,

        ConnectionError::Io(e) => match e.kind() {
            std::io::ErrorKind::AddrInUse
            | std::io::ErrorKind::PermissionDenied
            | std::io::ErrorKind::InvalidInput => Fatal,
            _ => Reconnect,
        },

        ConnectionError::NetworkTimeout | ConnectionError::FlushTimeout => Reconnect,

        ConnectionError::ConnectionRefused(code) => match code {
            ConnectReturnCode::RefusedProtocolVersion
            | ConnectReturnCode::BadClientId
            | ConnectReturnCode::BadUserNamePassword
            | ConnectReturnCode::NotAuthorized => Fatal,
            _ => Reconnect,
        },

        #[allow(unreachable_patterns)]
        _ => Reconnect,
    }
}

fn is_fatal_error(err: &ConnectionError) -> bool {
    matches!(classify_connection_error(err), Disposition::Fatal)
}

/// Innermost message of an error chain, without surrounding quotes.
fn get_error_message(e: &dyn std::error::Error) -> String {
    let mut current = e;
    while let Some(source) = current.source() {
        current = source;
    }
    current.to_string().trim_matches('"').to_string()
}

#[cfg(test)]
mod tests {
    use std::{io, time::Duration};

    use super::*;
    use crate::{
        backoff::AttemptLimit,
        client::ClientBuilder,
    };

    fn unreachable_kernel(cancel: CancellationToken) -> ConnectionKernel {
        // Port 1 on loopback refuses connections immediately.
        let (client, event_loop) = ClientBuilder::new("hass_kernel_test", "127.0.0.1", 1, 10)
            .unwrap()
            .build()
            .unwrap();
        ConnectionKernel::new(client, event_loop, cancel).with_backoff(Backoff::new(
            Duration::from_millis(10),
            Duration::from_millis(20),
            2.0,
        ))
    }

    #[test]
    fn test_error_classification() {
        let refused = ConnectionError::Io(io::Error::new(
            io::ErrorKind::ConnectionRefused,
            "connection refused",
        ));
        assert!(!is_fatal_error(&refused));

        let denied = ConnectionError::Io(io::Error::new(
            io::ErrorKind::PermissionDenied,
            "permission denied",
        ));
        assert!(is_fatal_error(&denied));

        assert!(is_fatal_error(&ConnectionError::ConnectionRefused(
            ConnectReturnCode::BadUserNamePassword
        )));
        assert!(!is_fatal_error(&ConnectionError::ConnectionRefused(
            ConnectReturnCode::ServiceUnavailable
        )));
        assert!(!is_fatal_error(&ConnectionError::NetworkTimeout));
    }

    #[test]
    fn test_error_message_is_unquoted_root_cause() {
        let err = io::Error::new(io::ErrorKind::Other, "\"host is down\"");
        assert_eq!(get_error_message(&err), "host is down");
    }

    #[tokio::test]
    async fn test_kernel_gives_up_after_attempt_limit() {
        let kernel = unreachable_kernel(CancellationToken::new());
        let kernel = kernel.with_backoff(
            Backoff::new(Duration::from_millis(10), Duration::from_millis(20), 2.0)
                .with_limit(AttemptLimit::Fixed(2)),
        );
        let state = kernel.subscribe_state();

        let result = tokio::time::timeout(Duration::from_secs(5), kernel.run())
            .await
            .expect("kernel should stop on its own");

        assert!(matches!(result, Err(TransferError::RetriesPolicy(_))));
        assert!(matches!(
            *state.borrow(),
            ConnectionState::Disconnected(_)
        ));
    }

    #[tokio::test]
    async fn test_kernel_stops_on_cancel() {
        let cancel = CancellationToken::new();
        let kernel = unreachable_kernel(cancel.clone());
        let state = kernel.subscribe_state();
        let handle = tokio::spawn(kernel.run());

        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();

        let result = tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
        assert!(result.is_ok());
        assert_eq!(*state.borrow(), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn test_pending_acks_fail_when_kernel_stops() {
        let cancel = CancellationToken::new();
        let acks = Arc::new(AckTracker::new());
        let kernel = unreachable_kernel(cancel.clone()).with_acks(acks.clone());
        let waiter = acks.enqueue(rumqttc::QoS::AtLeastOnce);

        cancel.cancel();
        kernel.run().await.unwrap();

        assert!(waiter.await.unwrap().is_err());
    }
}
