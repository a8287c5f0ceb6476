use core::fmt;

use serde::{Deserialize, Serialize};

/// Telemetry channel announced to the broker.
///
/// The declaration order is the provisioning order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Entity {
    Temperature,
    Humidity,
}

impl Entity {
    pub const COUNT: usize = 2;
    pub const ALL: [Entity; Self::COUNT] = [Self::Temperature, Self::Humidity];

    pub fn index(self) -> usize {
        match self {
            Self::Temperature => 0,
            Self::Humidity => 1,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Temperature => "temperature",
            Self::Humidity => "humidity",
        }
    }

    pub fn display_name(self) -> &'static str {
        match self {
            Self::Temperature => "Temperature",
            Self::Humidity => "Humidity",
        }
    }

    pub fn icon(self) -> &'static str {
        match self {
            Self::Temperature => "mdi:thermometer",
            Self::Humidity => "mdi:water-percent",
        }
    }

    pub fn unit(self) -> &'static str {
        match self {
            Self::Temperature => "°C",
            Self::Humidity => "%",
        }
    }

    /// Boot step label shown while this entity is provisioned.
    pub fn boot_label(self) -> &'static str {
        match self {
            Self::Temperature => "Add temp",
            Self::Humidity => "Add humid",
        }
    }
}

impl fmt::Display for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Device block shared by every discovery document.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DiscoveryDevice {
    pub identifiers: Vec<String>,
    pub name: String,
    #[serde(rename = "sw_version")]
    pub software_version: String,
}

/// Retained discovery document announcing one entity.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DiscoveryPayload {
    pub name: &'static str,
    pub unique_id: String,
    pub state_topic: String,
    pub availability_topic: String,
    #[serde(rename = "unit_of_measurement")]
    pub unit: &'static str,
    pub icon: &'static str,
    pub device_class: &'static str,
    pub device: DiscoveryDevice,
}

/// State payloads carry one decimal place.
pub fn format_reading(value: f32) -> String {
    format!("{value:.1}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provisioning_order_is_temperature_then_humidity() {
        assert_eq!(Entity::ALL, [Entity::Temperature, Entity::Humidity]);
        for (position, entity) in Entity::ALL.iter().enumerate() {
            assert_eq!(entity.index(), position);
        }
    }

    #[test]
    fn readings_use_one_decimal() {
        assert_eq!(format_reading(21.46), "21.5");
        assert_eq!(format_reading(0.0), "0.0");
    }
}
