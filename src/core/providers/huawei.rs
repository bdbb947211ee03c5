//! Huawei HG659 home router.
//!
//! The router's JSON API wraps every body in `while(1); /*...*/`. Internet
//! connectivity is judged from the WAN diagnosis plus a DNS lookup of a
//! well-known host, since the router happily reports `Connected` while the
//! upstream is broken.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use super::{
    error::{DeviceError, ProviderError},
    traits::{bounded, poll_outcome, Observations, Provider, HEALTH_TIMEOUT},
};
use crate::{
    config::providers::HuaweiHg659Config,
    core::{
        broker::{OFFLINE, ONLINE},
        homeassistant::{Availability, DeviceInformation, EntityConfiguration, EntityConfigurationSet},
    },
};

pub const PROVIDER_ID: &str = "huawei_hg659";

const LOOKUP_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct DeviceInfo {
    #[serde(rename = "UpTime", default)]
    pub up_time: u64,
    #[serde(rename = "DeviceName", default)]
    pub device_name: String,
    #[serde(rename = "SoftwareVersion", default)]
    pub software_version: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct InternetDiagnosis {
    #[serde(rename = "ConnectionStatus", default)]
    pub connection_status: String,
    #[serde(rename = "ErrReason", default)]
    pub err_reason: String,
    #[serde(rename = "Uptime", default)]
    pub uptime: u64,
}

/// Strips the `while(1); /* ... */` guard and decodes the JSON inside.
pub fn decode_guarded<T: DeserializeOwned>(body: &str) -> Result<T, DeviceError> {
    let trimmed = body.trim();
    let inner = trimmed
        .strip_prefix("while(1);")
        .map(str::trim_start)
        .and_then(|rest| rest.strip_prefix("/*"))
        .and_then(|rest| rest.strip_suffix("*/"))
        .unwrap_or(trimmed);
    Ok(serde_json::from_str(inner)?)
}

#[async_trait]
pub trait RouterClient: Send + Sync {
    async fn device_info(&self) -> Result<DeviceInfo, DeviceError>;
    async fn internet_diagnosis(&self) -> Result<InternetDiagnosis, DeviceError>;
}

/// Resolves the self-test host; `Err` carries the resolver's message.
#[async_trait]
pub trait HostResolver: Send + Sync {
    async fn lookup(&self, host: &str) -> Result<(), String>;
}

pub struct HttpRouterClient {
    http: reqwest::Client,
    base: String,
}

impl HttpRouterClient {
    pub fn new(address: &str, timeout: Duration) -> Result<Self, DeviceError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| DeviceError::Request(e.to_string()))?;
        Ok(Self {
            http,
            base: address.trim_end_matches('/').to_string(),
        })
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T, DeviceError> {
        let body = self
            .http
            .get(format!("{}{path}", self.base))
            .send()
            .await?
            .error_for_status()?
            .text()
            .await?;
        decode_guarded(&body)
    }
}

#[async_trait]
impl RouterClient for HttpRouterClient {
    async fn device_info(&self) -> Result<DeviceInfo, DeviceError> {
        self.get("/api/system/deviceinfo").await
    }

    async fn internet_diagnosis(&self) -> Result<InternetDiagnosis, DeviceError> {
        self.get("/api/system/diagnose_internet").await
    }
}

pub struct DnsResolver;

#[async_trait]
impl HostResolver for DnsResolver {
    async fn lookup(&self, host: &str) -> Result<(), String> {
        let lookup = tokio::net::lookup_host((host, 80));
        match tokio::time::timeout(LOOKUP_TIMEOUT, lookup).await {
            Ok(Ok(mut addrs)) => match addrs.next() {
                Some(_) => Ok(()),
                None => Err(format!("lookup {host}: no addresses")),
            },
            Ok(Err(e)) => Err(format!("lookup {host}: {e}")),
            Err(_) => Err(format!("lookup {host}: timed out")),
        }
    }
}

#[derive(Debug, Serialize)]
struct RouterState {
    internet_connected: &'static str,
    self_test_message: String,
    internet_connection_status: String,
    internet_err_reason: String,
    internet_uptime: u64,
    device_uptime: u64,
}

impl RouterState {
    fn new(info: DeviceInfo, diagnosis: InternetDiagnosis, self_test: Result<(), String>) -> Self {
        let connected =
            info.up_time > 0 && diagnosis.connection_status == "Connected" && self_test.is_ok();
        Self {
            internet_connected: if connected { "ON" } else { "OFF" },
            self_test_message: self_test.err().unwrap_or_else(|| "None".into()),
            internet_connection_status: diagnosis.connection_status,
            internet_err_reason: diagnosis.err_reason,
            internet_uptime: diagnosis.uptime,
            device_uptime: info.up_time,
        }
    }
}

pub struct HuaweiHg659Provider {
    name: String,
    settings: Option<HuaweiHg659Config>,
    client: Option<Arc<dyn RouterClient>>,
    resolver: Arc<dyn HostResolver>,
    enabled: bool,
}

impl HuaweiHg659Provider {
    pub fn new(settings: Option<HuaweiHg659Config>) -> Self {
        let name = settings
            .as_ref()
            .map_or_else(|| PROVIDER_ID.to_string(), |s| s.entity_name.clone());
        Self {
            name,
            settings,
            client: None,
            resolver: Arc::new(DnsResolver),
            enabled: false,
        }
    }

    pub fn with_client(mut self, client: Arc<dyn RouterClient>) -> Self {
        self.client = Some(client);
        self
    }

    pub fn with_resolver(mut self, resolver: Arc<dyn HostResolver>) -> Self {
        self.resolver = resolver;
        self
    }

    fn client(&self) -> Result<&Arc<dyn RouterClient>, ProviderError> {
        self.client
            .as_ref()
            .filter(|_| self.enabled)
            .ok_or_else(|| ProviderError::NotConfigured(self.name.clone()))
    }

    fn timeout(&self) -> Duration {
        self.settings
            .as_ref()
            .map_or(HEALTH_TIMEOUT, HuaweiHg659Config::timeout)
    }

    async fn read(&self, client: &dyn RouterClient) -> Result<RouterState, DeviceError> {
        let info = client.device_info().await?;
        let diagnosis = client.internet_diagnosis().await?;
        let host = self
            .settings
            .as_ref()
            .map_or("www.tpg.com.au", |s| s.self_test_host.as_str());
        let self_test = self.resolver.lookup(host).await;
        Ok(RouterState::new(info, diagnosis, self_test))
    }
}

#[async_trait]
impl Provider for HuaweiHg659Provider {
    fn id(&self) -> &'static str {
        PROVIDER_ID
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn configure(&mut self) -> Result<(), ProviderError> {
        let Some(settings) = self.settings.as_ref().filter(|s| s.enabled) else {
            self.enabled = false;
            return Ok(());
        };

        if settings.address.trim().is_empty() {
            return Err(ProviderError::MissingOption {
                provider: self.name.clone(),
                option: "address",
            });
        }
        if !settings.address.starts_with("http") {
            return Err(ProviderError::InvalidOption {
                provider: self.name.clone(),
                option: "address",
                reason: "must be a http:// or https:// URL".into(),
            });
        }

        if self.client.is_none() {
            let client = HttpRouterClient::new(&settings.address, settings.timeout()).map_err(
                |e| ProviderError::Configuration {
                    provider: self.name.clone(),
                    reason: e.to_string(),
                },
            )?;
            self.client = Some(Arc::new(client));
        }
        self.enabled = true;
        Ok(())
    }

    fn is_enabled(&self) -> bool {
        self.enabled
    }

    fn interval(&self) -> Option<Duration> {
        self.settings
            .as_ref()
            .filter(|_| self.enabled)
            .map(HuaweiHg659Config::interval)
    }

    fn device_metadata(&self) -> DeviceInformation {
        DeviceInformation {
            name: "Huawei HG659".into(),
            identifiers: vec!["huawei_router_hg659".into()],
            manufacturer: "Huawei".into(),
            model: "HG659".into(),
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
        let name = self.name.as_str();
        // Router entities follow the router topic alone.
        let availability = vec![Availability {
            payload_available: Some(ONLINE.into()),
            payload_not_available: Some(OFFLINE.into()),
            ..Availability::topic(self.availability_topic())
        }];
        let entity = |display: &str, id: &str, value: &str| {
            EntityConfiguration::named(display)
                .unique_id(id)
                .value_template(format!("{{{{ value_json.{value} }}}}"))
                .availability(availability.clone())
        };

        set.add(
            "binary_sensor",
            name,
            "router_internet_connected",
            entity("Internet Connected", "router_internet_connected", "internet_connected")
                .device_class("power"),
        )
        .add(
            "sensor",
            name,
            "router_internet_self_test_message",
            entity(
                "Self-test Message",
                "router_internet_self_test_message",
                "self_test_message",
            )
            .diagnostic(),
        )
        .add(
            "sensor",
            name,
            "router_internet_connection_status",
            entity(
                "Internet Connection Status",
                "router_internet_connection_status",
                "internet_connection_status",
            ),
        )
        .add(
            "sensor",
            name,
            "router_internet_err_reason",
            entity(
                "Internet Err Reason",
                "router_internet_err_reason",
                "internet_err_reason",
            )
            .diagnostic(),
        )
        .add(
            "sensor",
            name,
            "router_internet_uptime",
            entity("Internet Uptime", "router_internet_uptime", "internet_uptime")
                .state_class("total_increasing")
                .device_class("duration")
                .unit("ms"),
        )
        .add(
            "sensor",
            name,
            "router_device_uptime",
            entity("Device Uptime", "router_device_uptime", "device_uptime")
                .state_class("total_increasing")
                .device_class("duration")
                .unit("ms"),
        );

        Some(set)
    }

    async fn poll(&self) -> Result<Option<Observations>, ProviderError> {
        let client = self.client()?;
        poll_outcome(
            bounded(self.timeout(), self.read(client.as_ref())).await,
            |state| Ok(serde_json::to_value(state).map_err(DeviceError::from)?),
        )
    }

    async fn health(&self) -> Result<serde_json::Value, ProviderError> {
        let client = self.client()?;
        let info = bounded(HEALTH_TIMEOUT, client.device_info())
            .await
            .map_err(|e| ProviderError::Health(e.to_string()))?;
        Ok(serde_json::json!({ "up_time": info.up_time }))
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    struct FakeRouter {
        info: Result<DeviceInfo, DeviceError>,
        diagnosis: InternetDiagnosis,
    }

    #[async_trait]
    impl RouterClient for FakeRouter {
        async fn device_info(&self) -> Result<DeviceInfo, DeviceError> {
            self.info.clone()
        }

        async fn internet_diagnosis(&self) -> Result<InternetDiagnosis, DeviceError> {
            Ok(self.diagnosis.clone())
        }
    }

    struct FakeResolver(Result<(), String>);

    #[async_trait]
    impl HostResolver for FakeResolver {
        async fn lookup(&self, _host: &str) -> Result<(), String> {
            self.0.clone()
        }
    }

    fn connected() -> InternetDiagnosis {
        InternetDiagnosis {
            connection_status: "Connected".into(),
            err_reason: "Success".into(),
            uptime: 65,
        }
    }

    fn provider(router: FakeRouter, resolver: Result<(), String>) -> HuaweiHg659Provider {
        let mut provider = HuaweiHg659Provider::new(Some(HuaweiHg659Config {
            enabled: true,
            address: "http://192.168.1.1".into(),
            ..Default::default()
        }))
        .with_client(Arc::new(router))
        .with_resolver(Arc::new(FakeResolver(resolver)));
        provider.configure().unwrap();
        provider
    }

    #[test]
    fn test_decode_guarded_body() {
        let body = r#"while(1); /*{"UpTime":1234,"DeviceName":"HG659","SoftwareVersion":"V100R001"}*/"#;
        let info: DeviceInfo = decode_guarded(body).unwrap();
        assert_eq!(info.up_time, 1234);
        assert_eq!(info.device_name, "HG659");

        let plain: InternetDiagnosis = decode_guarded(r#"{"ConnectionStatus":"Connected"}"#).unwrap();
        assert_eq!(plain.connection_status, "Connected");

        assert!(decode_guarded::<DeviceInfo>("while(1); /*<html>*/").is_err());
    }

    #[tokio::test]
    async fn test_connected_when_all_checks_pass() {
        let provider = provider(
            FakeRouter {
                info: Ok(DeviceInfo {
                    up_time: 5000,
                    ..Default::default()
                }),
                diagnosis: connected(),
            },
            Ok(()),
        );

        assert_eq!(
            provider.poll().await.unwrap(),
            Some(json!({
                "internet_connected": "ON",
                "self_test_message": "None",
                "internet_connection_status": "Connected",
                "internet_err_reason": "Success",
                "internet_uptime": 65,
                "device_uptime": 5000,
            }))
        );
    }

    #[tokio::test]
    async fn test_failed_lookup_marks_disconnected() {
        let provider = provider(
            FakeRouter {
                info: Ok(DeviceInfo {
                    up_time: 5000,
                    ..Default::default()
                }),
                diagnosis: connected(),
            },
            Err("lookup www.tpg.com.au: no such host".into()),
        );

        let state = provider.poll().await.unwrap().unwrap();
        assert_eq!(state["internet_connected"], "OFF");
        assert_eq!(state["self_test_message"], "lookup www.tpg.com.au: no such host");
    }

    #[tokio::test]
    async fn test_unreachable_router_is_transient() {
        let provider = provider(
            FakeRouter {
                info: Err(DeviceError::Unreachable("i/o timeout".into())),
                diagnosis: connected(),
            },
            Ok(()),
        );
        assert!(provider.poll().await.unwrap().is_none());
        assert!(matches!(provider.health().await, Err(ProviderError::Health(_))));
    }

    #[test]
    fn test_schema_uses_router_availability_only() {
        let provider = provider(
            FakeRouter {
                info: Ok(DeviceInfo::default()),
                diagnosis: connected(),
            },
            Ok(()),
        );
        let set = provider.entity_configuration_set().unwrap();
        assert_eq!(set.len(), 6);

        let connected = &set.entities()
            ["homeassistant/binary_sensor/huawei_hg659/router_internet_connected/config"];
        assert_eq!(
            connected.value_template.as_deref(),
            Some("{{ value_json.internet_connected }}")
        );
        let availability = connected.availability.as_ref().unwrap();
        assert_eq!(availability.len(), 1);
        assert_eq!(availability[0].payload_available.as_deref(), Some("online"));
    }

    #[test]
    fn test_plain_address_rejected() {
        let mut provider = HuaweiHg659Provider::new(Some(HuaweiHg659Config {
            enabled: true,
            address: "192.168.1.1".into(),
            ..Default::default()
        }));
        assert!(matches!(
            provider.configure(),
            Err(ProviderError::InvalidOption { option: "address", .. })
        ));
    }
}
