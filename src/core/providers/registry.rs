//! Provider lifecycle: configure, announce, poll, close.
//!
//! The manager is built explicitly at startup from the loaded configuration
//! and owned by the bridge. Providers are registered in a fixed order, each
//! configured once; the ones that come out enabled form the active set. Their
//! discovery schemas are built right after configuration and re-published
//! verbatim whenever an announce is needed.

use std::sync::Arc;

use futures_util::{stream, TryStreamExt};
use tokio::{sync::mpsc, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Instrument};

use super::{
    advantage_air::AdvantageAirProvider,
    error::ProviderError,
    huawei::HuaweiHg659Provider,
    traits::Provider,
    zeversolar::ZeverSolarProvider,
};
use crate::{
    config::Config,
    core::{
        broker::{Broker, BrokerError, MessageHandler, Payload, PayloadData, PublishOptions, ONLINE},
        executor::Executor,
        homeassistant::{EntityConfigurationSet, HOMEASSISTANT_STATUS_TOPIC},
    },
};

pub struct ProviderManager {
    available: Vec<Box<dyn Provider>>,
    active: Vec<Arc<dyn Provider>>,
    schemas: Arc<Vec<EntityConfigurationSet>>,
    announce_concurrency: usize,
    rediscover_on_birth: bool,
    tasks: Vec<JoinHandle<()>>,
}

impl ProviderManager {
    pub fn new(announce_concurrency: usize, rediscover_on_birth: bool) -> Self {
        Self {
            available: Vec::new(),
            active: Vec::new(),
            schemas: Arc::default(),
            announce_concurrency: announce_concurrency.max(1),
            rediscover_on_birth,
            tasks: Vec::new(),
        }
    }

    /// Registers every supported device with its settings from `config`.
    pub fn from_config(config: &Config) -> Result<Self, ProviderError> {
        let providers = &config.providers;
        let mut manager = Self::new(
            config.bridge.announce_concurrency,
            config.bridge.rediscover_on_birth,
        );
        manager.register(Box::new(HuaweiHg659Provider::new(
            providers.huawei_hg659.clone(),
        )))?;
        manager.register(Box::new(ZeverSolarProvider::new(
            providers.zever_solar_tlc5000.clone(),
        )))?;
        manager.register(Box::new(AdvantageAirProvider::new(
            providers.advantage_air_hub.clone(),
        )))?;
        Ok(manager)
    }

    pub fn register(&mut self, provider: Box<dyn Provider>) -> Result<(), ProviderError> {
        if self.available.iter().any(|p| p.name() == provider.name()) {
            return Err(ProviderError::Configuration {
                provider: provider.name().to_string(),
                reason: "another provider is already registered under this name".into(),
            });
        }
        self.available.push(provider);
        Ok(())
    }

    /// Configures every registered provider in registration order.
    ///
    /// The first configuration error aborts; providers that end up disabled
    /// are left out of the active set.
    pub fn configure(&mut self) -> Result<(), ProviderError> {
        let mut statuses = Vec::with_capacity(self.available.len());
        let mut schemas = Vec::new();

        for mut provider in self.available.drain(..) {
            provider.configure()?;

            match provider.entity_configuration_set() {
                Some(schema) => {
                    debug!(
                        provider = provider.name(),
                        entities = schema.len(),
                        "Provider configured"
                    );
                    statuses.push((provider.id(), provider.name().to_string(), true));
                    schemas.push(schema);
                    self.active.push(Arc::from(provider));
                }
                None => {
                    info!(provider = provider.name(), "Provider disabled, skipping");
                    statuses.push((provider.id(), provider.name().to_string(), false));
                }
            }
        }

        self.schemas = Arc::new(schemas);
        log_providers_table(&statuses);
        Ok(())
    }

    pub fn active(&self) -> &[Arc<dyn Provider>] {
        &self.active
    }

    /// Announces every discovery schema, then launches one polling task per
    /// active provider. Returns once the tasks are running.
    pub async fn start(
        &mut self,
        broker: Arc<dyn Broker>,
        cancel: CancellationToken,
    ) -> Result<(), BrokerError> {
        let announced = announce(&self.schemas, broker.as_ref(), self.announce_concurrency).await?;
        info!(entities = announced, "Discovery announced");

        if self.rediscover_on_birth {
            if let Err(e) = self.watch_homeassistant_status(broker.clone(), cancel.clone()).await {
                warn!(error = %e, "Home Assistant restarts will not trigger a re-announce");
            }
        }

        for provider in &self.active {
            if let Some(executor) = Executor::new(provider.clone(), broker.clone(), cancel.clone()) {
                self.tasks.push(executor.spawn());
            }
        }
        info!(providers = self.active.len(), "Polling started");
        Ok(())
    }

    /// Re-announces discovery whenever Home Assistant reports `online`.
    ///
    /// The subscription handler runs on the bus task, so it only queues the
    /// request; the announce itself happens on a separate task.
    async fn watch_homeassistant_status(
        &mut self,
        broker: Arc<dyn Broker>,
        cancel: CancellationToken,
    ) -> Result<(), BrokerError> {
        let (requests_tx, mut requests) = mpsc::channel::<()>(1);
        let handler: MessageHandler = Arc::new(move |_topic: &str, payload: &[u8]| {
            if payload == ONLINE.as_bytes() {
                // A pending request already covers this one.
                let _ = requests_tx.try_send(());
            }
        });
        broker
            .subscribe(HOMEASSISTANT_STATUS_TOPIC, handler)
            .await?;

        let schemas = self.schemas.clone();
        let concurrency = self.announce_concurrency;
        let task = tokio::spawn(
            async move {
                loop {
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => break,
                        request = requests.recv() => {
                            if request.is_none() {
                                break;
                            }
                            info!("Home Assistant is online, re-announcing discovery");
                            if let Err(e) = announce(&schemas, broker.as_ref(), concurrency).await {
                                warn!(error = %e, "Re-announce failed");
                            }
                        }
                    }
                }
                debug!("Stopped watching Home Assistant status");
            }
            .in_current_span(),
        );
        self.tasks.push(task);
        Ok(())
    }

    /// Waits for every task started by [`ProviderManager::start`] to finish,
    /// then closes each active provider once.
    pub async fn shutdown(&mut self) {
        for task in self.tasks.drain(..) {
            if let Err(e) = task.await {
                error!(error = %e, "Provider task failed");
            }
        }

        for provider in self.active.drain(..) {
            if let Err(e) = provider.close().await {
                warn!(provider = provider.name(), error = %e, "Failed to close provider");
            }
        }
    }
}

/// Publishes every entity of every schema as a retained message, at most
/// `concurrency` at a time. The first failed publish aborts the announce.
pub async fn announce(
    schemas: &[EntityConfigurationSet],
    broker: &dyn Broker,
    concurrency: usize,
) -> Result<usize, BrokerError> {
    let mut jobs = Vec::new();
    for schema in schemas {
        for (topic, entity) in schema.iter() {
            jobs.push(Payload {
                topic: topic.clone(),
                data: PayloadData::structured(entity)?,
                options: PublishOptions::retained(),
            });
        }
    }

    let count = jobs.len();
    stream::iter(jobs.into_iter().map(Ok::<_, BrokerError>))
        .try_for_each_concurrent(concurrency.max(1), |payload| async move {
            broker.send(&payload).await
        })
        .await?;
    Ok(count)
}

fn log_providers_table(statuses: &[(&'static str, String, bool)]) {
    let name_width = statuses
        .iter()
        .map(|(_, name, _)| name.len())
        .max()
        .unwrap_or(0)
        .max("Provider".len());
    let id_width = statuses
        .iter()
        .map(|(id, _, _)| id.len())
        .max()
        .unwrap_or(0)
        .max("Device".len());

    info!(
        "{:<name_width$} | {:<id_width$} | Status",
        "Provider", "Device"
    );
    info!("{}-+-{}-+-{}", "-".repeat(name_width), "-".repeat(id_width), "-".repeat(8));
    for (id, name, enabled) in statuses {
        let status = if *enabled { "ENABLED" } else { "DISABLED" };
        info!("{name:<name_width$} | {id:<id_width$} | {status}");
    }
}
