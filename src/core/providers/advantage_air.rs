//! Advantage Air MyPlace/e-zone HVAC hub.
//!
//! The hub's local API answers `GET /getSystemData` with the whole system
//! as JSON. The first air conditioner unit is reported.

use std::{collections::BTreeMap, sync::Arc, time::Duration};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::{
    error::{DeviceError, ProviderError},
    traits::{bounded, poll_outcome, Observations, Provider, HEALTH_TIMEOUT},
};
use crate::{
    config::providers::AdvantageAirConfig,
    core::homeassistant::{DeviceInformation, EntityConfiguration, EntityConfigurationSet},
};

pub const PROVIDER_ID: &str = "advantage_air_hub";

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemInfo {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub my_app_rev: String,
    #[serde(default)]
    pub sys_type: String,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AirconInfo {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub state: String,
    #[serde(default)]
    pub mode: String,
    #[serde(default)]
    pub set_temp: f64,
    #[serde(default)]
    pub fan: String,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct Aircon {
    pub info: AirconInfo,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct SystemData {
    #[serde(default)]
    pub aircons: BTreeMap<String, Aircon>,
    #[serde(default)]
    pub system: SystemInfo,
}

impl SystemData {
    fn into_state(self) -> Result<Observations, ProviderError> {
        let aircon = self
            .aircons
            .into_values()
            .next()
            .ok_or_else(|| DeviceError::Parse("hub reports no aircon units".into()))?
            .info;

        let state = HubState {
            system_name: self.system.name,
            aircon_state: if aircon.state == "on" { "ON" } else { "OFF" },
            aircon_mode: aircon.mode,
            aircon_set_temp: aircon.set_temp,
            aircon_fan: aircon.fan,
        };
        Ok(serde_json::to_value(state).map_err(DeviceError::from)?)
    }
}

#[derive(Serialize)]
struct HubState {
    system_name: String,
    aircon_state: &'static str,
    aircon_mode: String,
    aircon_set_temp: f64,
    aircon_fan: String,
}

#[async_trait]
pub trait HubClient: Send + Sync {
    async fn system_data(&self) -> Result<SystemData, DeviceError>;
}

pub struct HttpHubClient {
    http: reqwest::Client,
    url: String,
}

impl HttpHubClient {
    pub fn new(address: &str, port: u16, timeout: Duration) -> Result<Self, DeviceError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| DeviceError::Request(e.to_string()))?;
        Ok(Self {
            http,
            url: format!("http://{address}:{port}/getSystemData"),
        })
    }
}

#[async_trait]
impl HubClient for HttpHubClient {
    async fn system_data(&self) -> Result<SystemData, DeviceError> {
        Ok(self
            .http
            .get(&self.url)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?)
    }
}

pub struct AdvantageAirProvider {
    name: String,
    settings: Option<AdvantageAirConfig>,
    client: Option<Arc<dyn HubClient>>,
    enabled: bool,
}

impl AdvantageAirProvider {
    pub fn new(settings: Option<AdvantageAirConfig>) -> Self {
        let name = settings
            .as_ref()
            .map_or_else(|| PROVIDER_ID.to_string(), |s| s.entity_name.clone());
        Self {
            name,
            settings,
            client: None,
            enabled: false,
        }
    }

    pub fn with_client(mut self, client: Arc<dyn HubClient>) -> Self {
        self.client = Some(client);
        self
    }

    fn client(&self) -> Result<&Arc<dyn HubClient>, ProviderError> {
        self.client
            .as_ref()
            .filter(|_| self.enabled)
            .ok_or_else(|| ProviderError::NotConfigured(self.name.clone()))
    }
}

#[async_trait]
impl Provider for AdvantageAirProvider {
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

        if self.client.is_none() {
            let client = HttpHubClient::new(&settings.address, settings.port, settings.timeout())
                .map_err(|e| ProviderError::Configuration {
                    provider: self.name.clone(),
                    reason: e.to_string(),
                })?;
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
            .map(AdvantageAirConfig::interval)
    }

    fn device_metadata(&self) -> DeviceInformation {
        DeviceInformation {
            name: "Air Conditioner".into(),
            identifiers: vec!["advantage_air_hub".into()],
            manufacturer: "Advantage Air".into(),
            model: "MyPlace".into(),
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

        set.add(
            "binary_sensor",
            name,
            "aircon_state",
            EntityConfiguration::named("Aircon Power").device_class("power"),
        )
        .add("sensor", name, "aircon_mode", EntityConfiguration::named("Aircon Mode"))
        .add(
            "sensor",
            name,
            "aircon_set_temp",
            EntityConfiguration::named("Aircon Set Temperature")
                .device_class("temperature")
                .unit("°C"),
        )
        .add("sensor", name, "aircon_fan", EntityConfiguration::named("Aircon Fan"))
        .add(
            "sensor",
            name,
            "system_name",
            EntityConfiguration::named("System Name").diagnostic(),
        );

        Some(set)
    }

    async fn poll(&self) -> Result<Option<Observations>, ProviderError> {
        let client = self.client()?;
        let timeout = self
            .settings
            .as_ref()
            .map_or(HEALTH_TIMEOUT, AdvantageAirConfig::timeout);
        poll_outcome(
            bounded(timeout, client.system_data()).await,
            SystemData::into_state,
        )
    }

    async fn health(&self) -> Result<serde_json::Value, ProviderError> {
        let client = self.client()?;
        let data = bounded(HEALTH_TIMEOUT, client.system_data())
            .await
            .map_err(|e| ProviderError::Health(e.to_string()))?;
        Ok(serde_json::json!({
            "name": data.system.name,
            "version": data.system.my_app_rev,
        }))
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    const SYSTEM_DATA: &str = r#"{
        "aircons": {
            "ac1": {
                "info": {"name": "AC", "state": "on", "mode": "cool", "setTemp": 23.0, "fan": "auto"},
                "zones": {}
            }
        },
        "system": {"name": "Home", "myAppRev": "15.1054", "sysType": "MyAir5"}
    }"#;

    struct FakeHub(Result<SystemData, DeviceError>);

    #[async_trait]
    impl HubClient for FakeHub {
        async fn system_data(&self) -> Result<SystemData, DeviceError> {
            self.0.clone()
        }
    }

    fn provider(response: Result<SystemData, DeviceError>) -> AdvantageAirProvider {
        let mut provider = AdvantageAirProvider::new(Some(AdvantageAirConfig {
            enabled: true,
            address: "10.0.0.20".into(),
            ..Default::default()
        }))
        .with_client(Arc::new(FakeHub(response)));
        provider.configure().unwrap();
        provider
    }

    fn system_data() -> SystemData {
        serde_json::from_str(SYSTEM_DATA).unwrap()
    }

    #[tokio::test]
    async fn test_poll_reports_first_unit() {
        let provider = provider(Ok(system_data()));
        assert_eq!(
            provider.poll().await.unwrap(),
            Some(json!({
                "system_name": "Home",
                "aircon_state": "ON",
                "aircon_mode": "cool",
                "aircon_set_temp": 23.0,
                "aircon_fan": "auto",
            }))
        );
    }

    #[tokio::test]
    async fn test_hub_without_units_is_an_error() {
        let provider = provider(Ok(SystemData::default()));
        assert!(matches!(
            provider.poll().await,
            Err(ProviderError::Device(DeviceError::Parse(_)))
        ));
    }

    #[tokio::test]
    async fn test_health_reports_system() {
        let provider = provider(Ok(system_data()));
        assert_eq!(
            provider.health().await.unwrap(),
            json!({"name": "Home", "version": "15.1054"})
        );
    }

    #[test]
    fn test_schema() {
        let provider = provider(Ok(system_data()));
        let set = provider.entity_configuration_set().unwrap();
        assert_eq!(set.len(), 5);
        assert!(set
            .entities()
            .contains_key("homeassistant/binary_sensor/advantage_air_hub/aircon_state/config"));
        assert_eq!(
            provider.state_topic(),
            "homeassistant_integrations/advantage_air_hub/state"
        );
    }
}
