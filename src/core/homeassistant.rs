//! Home Assistant MQTT discovery model.
//!
//! Each provider describes its entities once through an
//! [`EntityConfigurationSet`]. Entries are keyed by their discovery topic,
//! `homeassistant/{kind}/{provider}/{entity}/config`, and carry a JSON body
//! that Home Assistant uses to register the entity.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Bridge-wide availability; the last will and the shutdown path publish `offline` here.
pub const BRIDGE_AVAILABILITY_TOPIC: &str = "homeassistant_integrations/bridge/availability";
pub const BRIDGE_NAME: &str = "Home Assistant Integrations";
pub const BRIDGE_SUPPORT_URL: &str = "https://github.com/axatol/home-assistant-integrations/issues";

/// Prefix of every provider state and availability topic.
pub const TOPIC_PREFIX: &str = "homeassistant_integrations";

/// Home Assistant publishes its own birth/will here.
pub const HOMEASSISTANT_STATUS_TOPIC: &str = "homeassistant/status";

pub const DEFAULT_AVAILABILITY_MODE: &str = "latest";
pub const DEFAULT_STATE_CLASS: &str = "measurement";

pub fn discovery_topic(kind: &str, provider: &str, entity_id: &str) -> String {
    format!("homeassistant/{kind}/{provider}/{entity_id}/config")
}

pub fn state_topic(provider: &str) -> String {
    format!("{TOPIC_PREFIX}/{provider}/state")
}

pub fn availability_topic(provider: &str) -> String {
    format!("{TOPIC_PREFIX}/{provider}/availability")
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInformation {
    pub name: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub identifiers: Vec<String>,
    pub manufacturer: String,
    pub model: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Availability {
    pub topic: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value_template: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload_available: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload_not_available: Option<String>,
}

impl Availability {
    pub fn topic(topic: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            ..Default::default()
        }
    }
}

/// Software identity of the bridge, shown on every entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityOrigin {
    pub name: String,
    #[serde(rename = "sw_version")]
    pub software_version: String,
    pub support_url: String,
}

impl Default for EntityOrigin {
    fn default() -> Self {
        Self {
            name: BRIDGE_NAME.into(),
            software_version: env!("CARGO_PKG_VERSION").into(),
            support_url: BRIDGE_SUPPORT_URL.into(),
        }
    }
}

/// Discovery body of one entity.
///
/// Fields left `None` (or empty) are filled in by [`EntityConfigurationSet::add`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityConfiguration {
    pub name: String,
    #[serde(default)]
    pub unique_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value_template: Option<String>,
    #[serde(default)]
    pub state_topic: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state_class: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_reset: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_class: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit_of_measurement: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity_category: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin: Option<EntityOrigin>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device: Option<DeviceInformation>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub availability_mode: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub availability: Option<Vec<Availability>>,
}

impl EntityConfiguration {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn device_class(mut self, class: impl Into<String>) -> Self {
        self.device_class = Some(class.into());
        self
    }

    pub fn state_class(mut self, class: impl Into<String>) -> Self {
        self.state_class = Some(class.into());
        self
    }

    pub fn unit(mut self, unit: impl Into<String>) -> Self {
        self.unit_of_measurement = Some(unit.into());
        self
    }

    pub fn diagnostic(mut self) -> Self {
        self.entity_category = Some("diagnostic".into());
        self
    }

    pub fn last_reset(mut self, at: impl Into<String>) -> Self {
        self.last_reset = Some(at.into());
        self
    }

    pub fn value_template(mut self, template: impl Into<String>) -> Self {
        self.value_template = Some(template.into());
        self
    }

    pub fn unique_id(mut self, id: impl Into<String>) -> Self {
        self.unique_id = id.into();
        self
    }

    pub fn availability(mut self, availability: Vec<Availability>) -> Self {
        self.availability = Some(availability);
        self
    }
}

/// Discovery schema of one provider, keyed by discovery topic.
#[derive(Debug, Clone, PartialEq)]
pub struct EntityConfigurationSet {
    state_topic: String,
    availability_topic: String,
    device: DeviceInformation,
    origin: EntityOrigin,
    entities: BTreeMap<String, EntityConfiguration>,
}

impl EntityConfigurationSet {
    pub fn new(
        state_topic: impl Into<String>,
        availability_topic: impl Into<String>,
        device: DeviceInformation,
    ) -> Self {
        Self {
            state_topic: state_topic.into(),
            availability_topic: availability_topic.into(),
            device,
            origin: EntityOrigin::default(),
            entities: BTreeMap::new(),
        }
    }

    /// Adds an entity, filling every omitted field with the set's default.
    /// Fields already set are left untouched, so adding twice is idempotent.
    pub fn add(
        &mut self,
        kind: &str,
        provider: &str,
        id: &str,
        mut entity: EntityConfiguration,
    ) -> &mut Self {
        if entity.unique_id.is_empty() {
            entity.unique_id = id.to_string();
        }
        if entity.value_template.is_none() {
            entity.value_template = Some(format!("{{{{ value_json.{} }}}}", entity.unique_id));
        }
        if entity.state_topic.is_empty() {
            entity.state_topic = self.state_topic.clone();
        }
        if entity.availability.is_none() {
            entity.availability = Some(vec![
                Availability::topic(&self.availability_topic),
                Availability::topic(BRIDGE_AVAILABILITY_TOPIC),
            ]);
        }
        if entity.availability_mode.is_none() {
            entity.availability_mode = Some(DEFAULT_AVAILABILITY_MODE.into());
        }
        if entity.device.is_none() {
            entity.device = Some(self.device.clone());
        }
        if entity.origin.is_none() {
            entity.origin = Some(self.origin.clone());
        }
        if entity.state_class.is_none() {
            entity.state_class = Some(DEFAULT_STATE_CLASS.into());
        }

        self.entities
            .insert(discovery_topic(kind, provider, id), entity);
        self
    }

    pub fn entities(&self) -> &BTreeMap<String, EntityConfiguration> {
        &self.entities
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &EntityConfiguration)> {
        self.entities.iter()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn device() -> DeviceInformation {
        DeviceInformation {
            name: "Solar Inverter".into(),
            identifiers: vec!["zeversolar_inverter_tlc5000".into()],
            manufacturer: "Zeversolar".into(),
            model: "TLC5000".into(),
        }
    }

    fn set() -> EntityConfigurationSet {
        EntityConfigurationSet::new(
            state_topic("zever_solar_tlc5000"),
            availability_topic("zever_solar_tlc5000"),
            device(),
        )
    }

    #[test]
    fn test_discovery_topic_format() {
        assert_eq!(
            discovery_topic("sensor", "zever_solar_tlc5000", "solar_power_ac_w"),
            "homeassistant/sensor/zever_solar_tlc5000/solar_power_ac_w/config"
        );
        assert_eq!(
            state_topic("huawei_hg659"),
            "homeassistant_integrations/huawei_hg659/state"
        );
    }

    #[test]
    fn test_omitted_fields_get_defaults() {
        let mut set = set();
        set.add(
            "sensor",
            "zever_solar_tlc5000",
            "solar_power_ac_w",
            EntityConfiguration::named("Solar Power AC (W)"),
        );

        let entity = &set.entities()["homeassistant/sensor/zever_solar_tlc5000/solar_power_ac_w/config"];
        assert_eq!(entity.unique_id, "solar_power_ac_w");
        assert_eq!(
            entity.value_template.as_deref(),
            Some("{{ value_json.solar_power_ac_w }}")
        );
        assert_eq!(entity.state_topic, "homeassistant_integrations/zever_solar_tlc5000/state");
        assert_eq!(
            entity.availability,
            Some(vec![
                Availability::topic("homeassistant_integrations/zever_solar_tlc5000/availability"),
                Availability::topic(BRIDGE_AVAILABILITY_TOPIC),
            ])
        );
        assert_eq!(entity.availability_mode.as_deref(), Some("latest"));
        assert_eq!(entity.device, Some(device()));
        assert_eq!(entity.origin, Some(EntityOrigin::default()));
        assert_eq!(entity.state_class.as_deref(), Some("measurement"));
    }

    #[test]
    fn test_supplied_fields_are_kept() {
        let supplied = EntityConfiguration {
            name: "Internet Connected".into(),
            unique_id: "router_internet_connected".into(),
            value_template: Some("{{ value_json.internet_connected }}".into()),
            state_topic: "custom/state".into(),
            state_class: Some("total_increasing".into()),
            availability: Some(vec![Availability::topic("custom/availability")]),
            availability_mode: Some("all".into()),
            device: Some(DeviceInformation::default()),
            origin: Some(EntityOrigin {
                name: "other".into(),
                software_version: "1".into(),
                support_url: "x".into(),
            }),
            ..Default::default()
        };

        let mut set = set();
        set.add("binary_sensor", "huawei_hg659", "connected", supplied.clone());
        let stored = &set.entities()["homeassistant/binary_sensor/huawei_hg659/connected/config"];
        assert_eq!(stored, &supplied);

        // A second pass over an already defaulted entity changes nothing.
        let defaulted = stored.clone();
        set.add("binary_sensor", "huawei_hg659", "connected", defaulted.clone());
        assert_eq!(
            set.entities()["homeassistant/binary_sensor/huawei_hg659/connected/config"],
            defaulted
        );
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn test_unique_id_drives_value_template() {
        let mut set = set();
        set.add(
            "sensor",
            "zever_solar_tlc5000",
            "status",
            EntityConfiguration::named("Status").unique_id("solar_status"),
        );
        let entity = set.iter().next().unwrap().1;
        assert_eq!(
            entity.value_template.as_deref(),
            Some("{{ value_json.solar_status }}")
        );
    }

    #[test]
    fn test_serialized_body_omits_unset_options() {
        let mut set = set();
        set.add(
            "sensor",
            "zever_solar_tlc5000",
            "solar_power_ac_w",
            EntityConfiguration::named("Solar Power AC (W)")
                .device_class("power")
                .unit("W"),
        );
        let body = serde_json::to_value(set.iter().next().unwrap().1).unwrap();

        assert_eq!(body["device_class"], "power");
        assert_eq!(body["unit_of_measurement"], "W");
        assert_eq!(body["origin"]["sw_version"], env!("CARGO_PKG_VERSION"));
        assert_eq!(body["availability"][1], json!({"topic": BRIDGE_AVAILABILITY_TOPIC}));
        assert!(body.get("last_reset").is_none());
        assert!(body.get("entity_category").is_none());
    }
}
