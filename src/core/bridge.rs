//! Startup and shutdown sequencing.
//!
//! Startup: connect the broker, configure the providers, announce discovery
//! and launch polling, then serve the HTTP endpoints. The bridge then runs
//! until a termination signal arrives, the HTTP listener dies or the broker
//! connection is gone for good.
//!
//! Shutdown publishes the bridge-wide `offline`, cancels polling, and waits
//! for the listener and the polling tasks. All of it runs within the
//! configured grace period, and a second signal during that wait forces the
//! exit.

use std::sync::Arc;

use hass_bridge_mqtt::{BirthMessage, ConnectOptions, LastWill, MqttBroker, TransferError};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{
    broker::{Broker, BrokerError, Payload, OFFLINE, ONLINE},
    homeassistant::BRIDGE_AVAILABILITY_TOPIC,
    providers::{ProviderError, ProviderManager},
    readiness::{BrokerProbe, HealthAggregator, ProviderProbe},
};
use crate::{
    config::{Config, ConfigError},
    server::{self, HttpServer},
};

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("Broker error: {0}")]
    Broker(#[from] BrokerError),

    #[error("MQTT transport error: {0}")]
    Transport(#[from] TransferError),

    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error("HTTP server error: {0}")]
    Server(#[from] std::io::Error),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// How the shutdown sequence ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownOutcome {
    Graceful,
    /// The grace period ran out before polling and the listener stopped.
    TimedOut,
    /// A second termination signal arrived during shutdown.
    Forced,
}

impl ShutdownOutcome {
    pub fn exit_code(self) -> u8 {
        match self {
            ShutdownOutcome::Graceful => 0,
            ShutdownOutcome::TimedOut | ShutdownOutcome::Forced => 1,
        }
    }
}

pub struct Bridge {
    config: Arc<Config>,
    broker: Arc<dyn Broker>,
    manager: ProviderManager,
}

impl Bridge {
    /// Connects to MQTT with the bridge-wide availability as last will and
    /// birth message, and registers the configured providers.
    pub async fn connect(config: Arc<Config>) -> Result<Self, BridgeError> {
        let manager = ProviderManager::from_config(&config)?;

        let options = ConnectOptions::new(config.bridge.client_purpose.as_str())
            .last_will(LastWill::retained(BRIDGE_AVAILABILITY_TOPIC, OFFLINE))
            .birth(BirthMessage::new(BRIDGE_AVAILABILITY_TOPIC, ONLINE));
        let broker = MqttBroker::connect(&config.transport, options).await?;
        info!(broker = %broker.name(), client_id = broker.client_id(), "Connected to broker");

        Ok(Self::new(config, Arc::new(broker), manager))
    }

    pub fn new(config: Arc<Config>, broker: Arc<dyn Broker>, manager: ProviderManager) -> Self {
        Self {
            config,
            broker,
            manager,
        }
    }

    /// Runs until shut down. `signals` yields the name of each termination
    /// signal received.
    pub async fn run(
        mut self,
        mut signals: mpsc::Receiver<&'static str>,
    ) -> Result<ShutdownOutcome, BridgeError> {
        let cancel = CancellationToken::new();

        let mut server = match self.start(&cancel).await {
            Ok(server) => server,
            Err(e) => {
                error!(error = %e, "Startup failed");
                let grace = self.config.bridge.shutdown_grace();
                let broker = self.broker.clone();
                let manager = &mut self.manager;
                let unwind = async {
                    publish_offline(broker.as_ref()).await;
                    cancel.cancel();
                    manager.shutdown().await;
                };
                if tokio::time::timeout(grace, unwind).await.is_err() {
                    error!(?grace, "Shutdown grace period elapsed");
                    cancel.cancel();
                }
                self.disconnect().await;
                return Err(e);
            }
        };
        info!("Bridge running");

        let reason = tokio::select! {
            Some(signal) = signals.recv() => format!("received {signal}"),
            reason = server.stopped() => {
                error!(%reason, "HTTP server stopped unexpectedly");
                reason
            }
            reason = self.broker.closed() => {
                error!(%reason, "Broker connection closed");
                reason
            }
        };
        info!(%reason, "Shutting down");

        Ok(self.shutdown(server, cancel, &mut signals).await)
    }

    async fn start(&mut self, cancel: &CancellationToken) -> Result<HttpServer, BridgeError> {
        let listen = self.config.server.listen_address()?;

        self.manager.configure()?;
        self.manager.start(self.broker.clone(), cancel.clone()).await?;

        let aggregator = HealthAggregator::new(self.config.server.probe_timeout());
        aggregator
            .register(Arc::new(BrokerProbe(self.broker.clone())))
            .await;
        for provider in self.manager.active() {
            aggregator
                .register(Arc::new(ProviderProbe(provider.clone())))
                .await;
        }

        let router = server::router(aggregator, self.config.server.readiness_policy);
        Ok(HttpServer::bind(listen, router).await?)
    }

    async fn shutdown(
        mut self,
        mut server: HttpServer,
        cancel: CancellationToken,
        signals: &mut mpsc::Receiver<&'static str>,
    ) -> ShutdownOutcome {
        let grace = self.config.bridge.shutdown_grace();
        let broker = self.broker.clone();
        let manager = &mut self.manager;
        let token = cancel.clone();
        let drain = async move {
            publish_offline(broker.as_ref()).await;
            token.cancel();
            tokio::join!(server.shutdown(), manager.shutdown());
        };

        let outcome = tokio::select! {
            biased;
            Some(signal) = signals.recv() => {
                warn!(signal, "Second termination signal, forcing shutdown");
                ShutdownOutcome::Forced
            }
            drained = tokio::time::timeout(grace, drain) => match drained {
                Ok(()) => ShutdownOutcome::Graceful,
                Err(_) => {
                    error!(?grace, "Shutdown grace period elapsed");
                    ShutdownOutcome::TimedOut
                }
            },
        };

        // A stalled offline publish never reached the cancel.
        cancel.cancel();
        if outcome == ShutdownOutcome::Graceful {
            self.disconnect().await;
            info!("Shutdown complete");
        }
        outcome
    }

    async fn disconnect(&self) {
        match self
            .broker
            .disconnect(self.config.bridge.disconnect_timeout())
            .await
        {
            Ok(()) => debug!("Broker disconnected"),
            Err(e) => warn!(error = %e, "Broker disconnect was not clean"),
        }
    }
}

async fn publish_offline(broker: &dyn Broker) {
    let offline = Payload::new(BRIDGE_AVAILABILITY_TOPIC, OFFLINE).retained();
    if let Err(e) = broker.send(&offline).await {
        warn!(error = %e, "Failed to publish bridge availability");
    }
}

/// Forwards SIGINT and, on unix, SIGTERM as they arrive.
pub fn termination_signals() -> mpsc::Receiver<&'static str> {
    let (tx, rx) = mpsc::channel(4);

    let interrupt = tx.clone();
    tokio::spawn(async move {
        while tokio::signal::ctrl_c().await.is_ok() {
            if interrupt.send("SIGINT").await.is_err() {
                break;
            }
        }
    });

    #[cfg(unix)]
    tokio::spawn(async move {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut terminate) => {
                while terminate.recv().await.is_some() {
                    if tx.send("SIGTERM").await.is_err() {
                        break;
                    }
                }
            }
            Err(e) => warn!(error = %e, "SIGTERM handler unavailable"),
        }
    });
    #[cfg(not(unix))]
    drop(tx);

    rx
}
