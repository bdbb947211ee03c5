//! Scriptable provider double shared by the manager, executor and bridge tests.

use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use serde_json::json;

use super::{
    error::{DeviceError, ProviderError},
    traits::{Observations, Provider},
};
use crate::core::homeassistant::{DeviceInformation, EntityConfiguration, EntityConfigurationSet};

type PollFn = Arc<dyn Fn(usize) -> Result<Option<Observations>, ProviderError> + Send + Sync>;

#[derive(Clone, Copy, PartialEq, Eq)]
pub(crate) enum Setup {
    Enabled,
    Disabled,
    Broken,
}

pub(crate) struct StubProvider {
    name: String,
    setup: Setup,
    enabled: bool,
    interval: Duration,
    poll_delay: Duration,
    close_delay: Duration,
    outcome: PollFn,
    healthy: bool,
    polls: Arc<AtomicUsize>,
    closes: Arc<AtomicUsize>,
}

impl StubProvider {
    /// Succeeds on every poll with `{"count": n}`.
    pub(crate) fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            setup: Setup::Enabled,
            enabled: false,
            interval: Duration::from_millis(20),
            poll_delay: Duration::ZERO,
            close_delay: Duration::ZERO,
            outcome: Arc::new(|n| Ok(Some(json!({ "count": n })))),
            healthy: true,
            polls: Arc::default(),
            closes: Arc::default(),
        }
    }

    pub(crate) fn setup(mut self, setup: Setup) -> Self {
        self.setup = setup;
        self
    }

    pub(crate) fn interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub(crate) fn poll_delay(mut self, delay: Duration) -> Self {
        self.poll_delay = delay;
        self
    }

    pub(crate) fn close_delay(mut self, delay: Duration) -> Self {
        self.close_delay = delay;
        self
    }

    pub(crate) fn outcome(
        mut self,
        outcome: impl Fn(usize) -> Result<Option<Observations>, ProviderError> + Send + Sync + 'static,
    ) -> Self {
        self.outcome = Arc::new(outcome);
        self
    }

    pub(crate) fn unavailable(self) -> Self {
        self.outcome(|_| Ok(None))
    }

    pub(crate) fn failing(self) -> Self {
        self.outcome(|_| Err(DeviceError::Status(500).into()))
    }

    pub(crate) fn unhealthy(mut self) -> Self {
        self.healthy = false;
        self
    }

    pub(crate) fn polls(&self) -> Arc<AtomicUsize> {
        self.polls.clone()
    }

    pub(crate) fn closes(&self) -> Arc<AtomicUsize> {
        self.closes.clone()
    }
}

#[async_trait]
impl Provider for StubProvider {
    fn id(&self) -> &'static str {
        "stub"
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn configure(&mut self) -> Result<(), ProviderError> {
        match self.setup {
            Setup::Enabled => self.enabled = true,
            Setup::Disabled => self.enabled = false,
            Setup::Broken => {
                return Err(ProviderError::MissingOption {
                    provider: self.name.clone(),
                    option: "address",
                })
            }
        }
        Ok(())
    }

    fn is_enabled(&self) -> bool {
        self.enabled
    }

    fn interval(&self) -> Option<Duration> {
        self.enabled.then_some(self.interval)
    }

    fn device_metadata(&self) -> DeviceInformation {
        DeviceInformation {
            name: self.name.clone(),
            identifiers: vec![self.name.clone()],
            manufacturer: "Test".into(),
            model: "Stub".into(),
        }
    }

    fn entity_configuration_set(&self) -> Option<EntityConfigurationSet> {
        if !self.enabled {
            return None;
        }
        let mut set = EntityConfigurationSet::new(
            self.state_topic(),
            self.availability_topic(),
            self.device_metadata(),
        );
        set.add("sensor", &self.name, "count", EntityConfiguration::named("Count"))
            .add(
                "binary_sensor",
                &self.name,
                "running",
                EntityConfiguration::named("Running"),
            );
        Some(set)
    }

    async fn poll(&self) -> Result<Option<Observations>, ProviderError> {
        let n = self.polls.fetch_add(1, Ordering::SeqCst) + 1;
        if !self.poll_delay.is_zero() {
            tokio::time::sleep(self.poll_delay).await;
        }
        (self.outcome)(n)
    }

    async fn health(&self) -> Result<serde_json::Value, ProviderError> {
        if self.healthy {
            Ok(json!({ "polls": self.polls.load(Ordering::SeqCst) }))
        } else {
            Err(ProviderError::Health("device did not answer".into()))
        }
    }

    async fn close(&self) -> Result<(), ProviderError> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.close_delay).await;
        Ok(())
    }
}
