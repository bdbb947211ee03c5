//! Zeversolar TLC5000 solar inverter.
//!
//! The inverter serves a plain-text status page at `/home.cgi`, one value
//! per line. The lines used here:
//!
//! ```text
//! 6   10:38 13/09/2023   local time of the reading
//! 10  1324               AC power, W
//! 11  5.3                energy today, kWh (fraction not zero-padded: 5.3 means 5.03)
//! 12  OK                 inverter status
//! ```

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use serde::Serialize;
use time::{
    format_description::well_known::Rfc3339, macros::format_description, OffsetDateTime,
    PrimitiveDateTime,
};

use super::{
    error::{DeviceError, ProviderError},
    traits::{bounded, poll_outcome, Observations, Provider, HEALTH_TIMEOUT},
};
use crate::{
    config::providers::ZeverSolarConfig,
    core::homeassistant::{DeviceInformation, EntityConfiguration, EntityConfigurationSet},
};

pub const PROVIDER_ID: &str = "zever_solar_tlc5000";

const TIMESTAMP_LINE: usize = 6;
const POWER_LINE: usize = 10;
const ENERGY_LINE: usize = 11;
const STATUS_LINE: usize = 12;

#[derive(Debug, Clone, PartialEq)]
pub struct InverterReading {
    pub timestamp: OffsetDateTime,
    pub power_ac_w: u32,
    pub energy_today_kwh: f64,
    pub status: String,
}

impl InverterReading {
    pub fn parse(body: &str) -> Result<Self, DeviceError> {
        let lines: Vec<&str> = body.lines().map(str::trim).collect();
        let line = |index: usize| {
            lines.get(index).copied().ok_or_else(|| {
                DeviceError::Parse(format!("expected at least {} lines, got {}", index + 1, lines.len()))
            })
        };

        Ok(Self {
            timestamp: parse_timestamp(line(TIMESTAMP_LINE)?)?,
            power_ac_w: line(POWER_LINE)?
                .parse()
                .map_err(|e| DeviceError::Parse(format!("power: {e}")))?,
            energy_today_kwh: parse_energy(line(ENERGY_LINE)?)?,
            status: line(STATUS_LINE)?.to_string(),
        })
    }

    fn into_state(self) -> Result<Observations, ProviderError> {
        let state = SolarState {
            solar_last_updated: self
                .timestamp
                .format(&Rfc3339)
                .map_err(|e| DeviceError::Parse(e.to_string()))?,
            solar_power_ac_w: self.power_ac_w,
            solar_energy_today_kwh: self.energy_today_kwh,
            solar_status: if self.status == "OK" { "ON" } else { "OFF" },
        };
        Ok(serde_json::to_value(state).map_err(DeviceError::from)?)
    }
}

#[derive(Serialize)]
struct SolarState {
    solar_last_updated: String,
    solar_power_ac_w: u32,
    solar_energy_today_kwh: f64,
    solar_status: &'static str,
}

/// `HH:MM DD/MM/YYYY`, taken as UTC.
fn parse_timestamp(raw: &str) -> Result<OffsetDateTime, DeviceError> {
    let format = format_description!(
        "[hour padding:none]:[minute] [day padding:none]/[month padding:none]/[year]"
    );
    PrimitiveDateTime::parse(raw, format)
        .map(PrimitiveDateTime::assume_utc)
        .map_err(|e| DeviceError::Parse(format!("timestamp {raw:?}: {e}")))
}

fn parse_energy(raw: &str) -> Result<f64, DeviceError> {
    let normalized = match raw.split_once('.') {
        Some((whole, fraction)) if fraction.len() == 1 => format!("{whole}.0{fraction}"),
        _ => raw.to_string(),
    };
    normalized
        .parse()
        .map_err(|e| DeviceError::Parse(format!("energy {raw:?}: {e}")))
}

#[async_trait]
pub trait InverterClient: Send + Sync {
    async fn fetch(&self) -> Result<InverterReading, DeviceError>;
}

pub struct HttpInverterClient {
    http: reqwest::Client,
    url: String,
}

impl HttpInverterClient {
    pub fn new(address: &str, timeout: Duration) -> Result<Self, DeviceError> {
        let base = if address.starts_with("http") {
            address.trim_end_matches('/').to_string()
        } else {
            format!("http://{address}")
        };
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| DeviceError::Request(e.to_string()))?;
        Ok(Self {
            http,
            url: format!("{base}/home.cgi"),
        })
    }
}

#[async_trait]
impl InverterClient for HttpInverterClient {
    async fn fetch(&self) -> Result<InverterReading, DeviceError> {
        let body = self
            .http
            .get(&self.url)
            .send()
            .await?
            .error_for_status()?
            .text()
            .await?;
        InverterReading::parse(&body)
    }
}

pub struct ZeverSolarProvider {
    name: String,
    settings: Option<ZeverSolarConfig>,
    client: Option<Arc<dyn InverterClient>>,
    enabled: bool,
}

impl ZeverSolarProvider {
    pub fn new(settings: Option<ZeverSolarConfig>) -> Self {
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

    pub fn with_client(mut self, client: Arc<dyn InverterClient>) -> Self {
        self.client = Some(client);
        self
    }

    fn client(&self) -> Result<&Arc<dyn InverterClient>, ProviderError> {
        self.client
            .as_ref()
            .filter(|_| self.enabled)
            .ok_or_else(|| ProviderError::NotConfigured(self.name.clone()))
    }

    fn timeout(&self) -> Duration {
        self.settings
            .as_ref()
            .map_or(HEALTH_TIMEOUT, ZeverSolarConfig::timeout)
    }
}

/// Midnight UTC today, the reset point of the daily energy counter.
fn midnight() -> Option<String> {
    OffsetDateTime::now_utc()
        .replace_time(time::Time::MIDNIGHT)
        .format(&Rfc3339)
        .ok()
}

#[async_trait]
impl Provider for ZeverSolarProvider {
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
        if settings.timeout() >= settings.interval() {
            return Err(ProviderError::InvalidOption {
                provider: self.name.clone(),
                option: "timeout",
                reason: "must be shorter than the interval".into(),
            });
        }

        if self.client.is_none() {
            let client = HttpInverterClient::new(&settings.address, settings.timeout()).map_err(
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
            .map(ZeverSolarConfig::interval)
    }

    fn device_metadata(&self) -> DeviceInformation {
        DeviceInformation {
            name: "Solar Inverter".into(),
            identifiers: vec!["zeversolar_inverter_tlc5000".into()],
            manufacturer: "Zeversolar".into(),
            model: "TLC5000".into(),
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
            "sensor",
            name,
            "solar_last_updated",
            EntityConfiguration::named("Solar Last Updated")
                .device_class("timestamp")
                .diagnostic(),
        )
        .add(
            "sensor",
            name,
            "solar_power_ac_w",
            EntityConfiguration::named("Solar Power AC (W)")
                .state_class("measurement")
                .device_class("power")
                .unit("W"),
        );

        let mut energy = EntityConfiguration::named("Solar Energy Today (kWh)")
            .state_class("total_increasing")
            .device_class("energy")
            .unit("kWh");
        if let Some(at) = midnight() {
            energy = energy.last_reset(at);
        }
        set.add("sensor", name, "solar_energy_today_kwh", energy).add(
            "sensor",
            name,
            "solar_status",
            EntityConfiguration::named("Solar Status").device_class("power"),
        );

        Some(set)
    }

    async fn poll(&self) -> Result<Option<Observations>, ProviderError> {
        let client = self.client()?;
        poll_outcome(
            bounded(self.timeout(), client.fetch()).await,
            InverterReading::into_state,
        )
    }

    async fn health(&self) -> Result<serde_json::Value, ProviderError> {
        let client = self.client()?;
        let reading = bounded(HEALTH_TIMEOUT, client.fetch())
            .await
            .map_err(|e| ProviderError::Health(e.to_string()))?;
        Ok(serde_json::json!({ "energy_today": reading.energy_today_kwh }))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use serde_json::json;
    use time::macros::datetime;

    use super::*;

    const HOME_CGI: &str = "1\n1\nEAB961234567\nXXXXXXXXXXXX\nM11\n16B21-663R+16B21-658R\n10:38 13/09/2023\n1\n1\nBS1234567890\n1324\n5.3\nOK\nError\n";

    struct FakeInverter {
        responses: Mutex<Vec<Result<InverterReading, DeviceError>>>,
    }

    impl FakeInverter {
        fn new(responses: Vec<Result<InverterReading, DeviceError>>) -> Arc<Self> {
            Arc::new(Self {
                responses: Mutex::new(responses),
            })
        }
    }

    #[async_trait]
    impl InverterClient for FakeInverter {
        async fn fetch(&self) -> Result<InverterReading, DeviceError> {
            self.responses.lock().unwrap().remove(0)
        }
    }

    fn enabled() -> ZeverSolarConfig {
        ZeverSolarConfig {
            enabled: true,
            address: "192.168.1.50".into(),
            ..Default::default()
        }
    }

    fn reading() -> InverterReading {
        InverterReading::parse(HOME_CGI).unwrap()
    }

    #[test]
    fn test_parse_home_cgi() {
        let reading = reading();
        assert_eq!(reading.timestamp, datetime!(2023-09-13 10:38 UTC));
        assert_eq!(reading.power_ac_w, 1324);
        assert_eq!(reading.energy_today_kwh, 5.03);
        assert_eq!(reading.status, "OK");
    }

    #[test]
    fn test_energy_fraction_padding() {
        assert_eq!(parse_energy("5.3").unwrap(), 5.03);
        assert_eq!(parse_energy("12.45").unwrap(), 12.45);
        assert_eq!(parse_energy("7").unwrap(), 7.0);
        assert!(parse_energy("n/a").is_err());
    }

    #[test]
    fn test_truncated_body_rejected() {
        assert!(matches!(
            InverterReading::parse("1\n1\n"),
            Err(DeviceError::Parse(_))
        ));
    }

    #[test]
    fn test_disabled_provider_has_no_schema() {
        let mut provider = ZeverSolarProvider::new(None);
        provider.configure().unwrap();
        assert!(!provider.is_enabled());
        assert!(provider.entity_configuration_set().is_none());
        assert!(provider.interval().is_none());
    }

    #[test]
    fn test_missing_address_is_configuration_error() {
        let mut provider = ZeverSolarProvider::new(Some(ZeverSolarConfig {
            enabled: true,
            ..Default::default()
        }));
        let err = provider.configure().unwrap_err();
        assert!(err.is_configuration());
    }

    #[test]
    fn test_schema_entities() {
        let mut provider = ZeverSolarProvider::new(Some(enabled()));
        provider.configure().unwrap();
        let set = provider.entity_configuration_set().unwrap();

        let topics: Vec<&str> = set.iter().map(|(topic, _)| topic.as_str()).collect();
        assert_eq!(
            topics,
            vec![
                "homeassistant/sensor/zever_solar_tlc5000/solar_energy_today_kwh/config",
                "homeassistant/sensor/zever_solar_tlc5000/solar_last_updated/config",
                "homeassistant/sensor/zever_solar_tlc5000/solar_power_ac_w/config",
                "homeassistant/sensor/zever_solar_tlc5000/solar_status/config",
            ]
        );

        let energy =
            &set.entities()["homeassistant/sensor/zever_solar_tlc5000/solar_energy_today_kwh/config"];
        assert_eq!(energy.state_class.as_deref(), Some("total_increasing"));
        assert!(energy.last_reset.as_deref().unwrap().ends_with("T00:00:00Z"));
    }

    #[tokio::test]
    async fn test_poll_outcomes() {
        let inverter = FakeInverter::new(vec![
            Ok(reading()),
            Err(DeviceError::Unreachable("host is down".into())),
            Err(DeviceError::Status(500)),
        ]);
        let mut provider = ZeverSolarProvider::new(Some(enabled())).with_client(inverter);
        provider.configure().unwrap();

        assert_eq!(
            provider.poll().await.unwrap(),
            Some(json!({
                "solar_last_updated": "2023-09-13T10:38:00Z",
                "solar_power_ac_w": 1324,
                "solar_energy_today_kwh": 5.03,
                "solar_status": "ON",
            }))
        );
        assert!(provider.poll().await.unwrap().is_none());
        assert!(provider.poll().await.is_err());
    }

    #[tokio::test]
    async fn test_poll_before_configure_fails() {
        let provider = ZeverSolarProvider::new(Some(enabled()))
            .with_client(FakeInverter::new(vec![Ok(reading())]));
        assert!(matches!(
            provider.poll().await,
            Err(ProviderError::NotConfigured(_))
        ));
    }

    #[tokio::test]
    async fn test_health_reports_energy() {
        let mut provider = ZeverSolarProvider::new(Some(enabled()))
            .with_client(FakeInverter::new(vec![Ok(reading())]));
        provider.configure().unwrap();
        assert_eq!(
            provider.health().await.unwrap(),
            json!({"energy_today": 5.03})
        );
    }
}
