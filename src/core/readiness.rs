//! Readiness aggregation.
//!
//! Targets (the broker and every active provider) are registered once at
//! startup. Each readiness request probes all of them concurrently, each
//! probe on its own task and bounded by the aggregator's timeout, so a slow
//! or panicking target only affects its own record.

use std::{collections::BTreeMap, fmt, sync::Arc, time::Duration};

use async_trait::async_trait;
use futures_util::future::join_all;
use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::RwLock;
use tracing::{debug, warn, Instrument};

use super::{broker::Broker, providers::Provider};

/// Something that can report its own health.
#[async_trait]
pub trait ProbeTarget: Send + Sync {
    fn name(&self) -> String;

    async fn health(&self) -> Result<Value, String>;
}

pub struct ProviderProbe(pub Arc<dyn Provider>);

#[async_trait]
impl ProbeTarget for ProviderProbe {
    fn name(&self) -> String {
        self.0.name().to_string()
    }

    async fn health(&self) -> Result<Value, String> {
        self.0.health().await.map_err(|e| e.to_string())
    }
}

pub struct BrokerProbe(pub Arc<dyn Broker>);

#[async_trait]
impl ProbeTarget for BrokerProbe {
    fn name(&self) -> String {
        self.0.name()
    }

    async fn health(&self) -> Result<Value, String> {
        self.0.health().await.map_err(|e| e.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthRecord {
    pub healthy: bool,
    pub data: Value,
}

impl HealthRecord {
    fn from_probe(result: Result<Value, String>) -> Self {
        match result {
            Ok(data) => Self {
                healthy: true,
                data,
            },
            Err(error) => Self {
                healthy: false,
                data: json!({ "error": error }),
            },
        }
    }
}

/// One readiness answer: target name to record.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct HealthReport {
    pub records: BTreeMap<String, HealthRecord>,
}

impl HealthReport {
    pub fn is_healthy(&self) -> bool {
        self.records.values().all(|r| r.healthy)
    }
}

impl fmt::Display for HealthReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let unhealthy = self.records.values().filter(|r| !r.healthy).count();
        write!(f, "{}/{} healthy", self.records.len() - unhealthy, self.records.len())
    }
}

#[derive(Clone)]
pub struct HealthAggregator {
    targets: Arc<RwLock<Vec<Arc<dyn ProbeTarget>>>>,
    timeout: Duration,
}

impl HealthAggregator {
    pub fn new(timeout: Duration) -> Self {
        Self {
            targets: Arc::default(),
            timeout,
        }
    }

    pub async fn register(&self, target: Arc<dyn ProbeTarget>) {
        debug!(probe = %target.name(), "Registered readiness target");
        self.targets.write().await.push(target);
    }

    pub async fn len(&self) -> usize {
        self.targets.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Probes every target concurrently and collects one record each.
    pub async fn probe(&self) -> HealthReport {
        let targets = self.targets.read().await.clone();
        let limit = self.timeout;

        let probes = targets.into_iter().map(|target| {
            let name = target.name();
            let task = tokio::spawn(
                async move {
                    tokio::time::timeout(limit, target.health())
                        .await
                        .unwrap_or_else(|_| Err(format!("no answer within {limit:?}")))
                }
                .in_current_span(),
            );
            async move {
                let result = task.await.unwrap_or_else(|e| Err(format!("probe failed: {e}")));
                if let Err(error) = &result {
                    warn!(probe = %name, %error, "Readiness probe failed");
                }
                (name, HealthRecord::from_probe(result))
            }
        });

        HealthReport {
            records: join_all(probes).await.into_iter().collect(),
        }
    }
}
