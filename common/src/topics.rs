use crate::{
    config::{DeviceConfig, NetworkConfig},
    types::{DiscoveryDevice, DiscoveryPayload, Entity},
};

pub const PAYLOAD_ONLINE: &str = "online";
pub const PAYLOAD_OFFLINE: &str = "offline";

/// Topic layout for one node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topics {
    discovery_prefix: String,
    state_prefix: String,
    device_id: String,
}

impl Topics {
    pub fn new(network: &NetworkConfig, device: &DeviceConfig) -> Self {
        Self {
            discovery_prefix: network.discovery_prefix.trim_end_matches('/').to_string(),
            state_prefix: network.state_prefix.trim_end_matches('/').to_string(),
            device_id: device.unique_id.clone(),
        }
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn availability(&self) -> String {
        format!("{}/{}/availability", self.state_prefix, self.device_id)
    }

    pub fn state(&self, entity: Entity) -> String {
        format!("{}/{}/{}/state", self.state_prefix, self.device_id, entity)
    }

    pub fn discovery(&self, entity: Entity) -> String {
        format!(
            "{}/sensor/{}/{}/config",
            self.discovery_prefix, self.device_id, entity
        )
    }

    pub fn discovery_payload(&self, entity: Entity, device: &DeviceConfig) -> DiscoveryPayload {
        DiscoveryPayload {
            name: entity.display_name(),
            unique_id: format!("{}_{}", self.device_id, entity),
            state_topic: self.state(entity),
            availability_topic: self.availability(),
            unit: entity.unit(),
            icon: entity.icon(),
            device_class: entity.as_str(),
            device: DiscoveryDevice {
                identifiers: vec![self.device_id.clone()],
                name: device.name.clone(),
                software_version: device.version.clone(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn topics() -> (Topics, DeviceConfig) {
        let network = NetworkConfig::default();
        let device = DeviceConfig {
            unique_id: "a0b1c2d3e4f5".to_string(),
            ..DeviceConfig::default()
        };
        (Topics::new(&network, &device), device)
    }

    #[test]
    fn builds_topic_layout() {
        let (topics, _) = topics();
        assert_eq!(topics.availability(), "envnode/a0b1c2d3e4f5/availability");
        assert_eq!(
            topics.state(Entity::Humidity),
            "envnode/a0b1c2d3e4f5/humidity/state"
        );
        assert_eq!(
            topics.discovery(Entity::Temperature),
            "homeassistant/sensor/a0b1c2d3e4f5/temperature/config"
        );
    }

    #[test]
    fn discovery_document_shape() {
        let (topics, device) = topics();
        let payload = topics.discovery_payload(Entity::Temperature, &device);
        let json = serde_json::to_value(&payload).expect("serializable");

        assert_eq!(
            json,
            serde_json::json!({
                "name": "Temperature",
                "unique_id": "a0b1c2d3e4f5_temperature",
                "state_topic": "envnode/a0b1c2d3e4f5/temperature/state",
                "availability_topic": "envnode/a0b1c2d3e4f5/availability",
                "unit_of_measurement": "°C",
                "icon": "mdi:thermometer",
                "device_class": "temperature",
                "device": {
                    "identifiers": ["a0b1c2d3e4f5"],
                    "name": device.name,
                    "sw_version": device.version,
                }
            })
        );
    }
}
