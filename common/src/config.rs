use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

pub const MAX_NAME_LENGTH: usize = 14;
/// Placeholder id; replaced by a hardware-derived one where available.
pub const DEFAULT_UNIQUE_ID: &str = "envnode";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    pub link_timeout_ms: u32,
    pub session_timeout_ms: u32,
    pub halt_grace_ms: u32,
    pub reconnect_interval_ms: u32,
    pub link_poll_ms: u32,
    pub signal_refresh_ms: u32,
    pub watchdog_period_ms: u32,
    pub watchdog_feed_interval_ms: u32,
    pub provisioning_settle_ms: u32,
    pub loop_pause_ms: u32,
    pub poll_quantum_us: u32,
    pub telemetry_refresh_ms: u32,
    pub breathe_period_ms: u32,
    pub blink_period_ms: u32,
    pub pwm_cycle_us: u32,
    pub temperature_offset_c: f32,
    pub reset_session_on_link_recovery: bool,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            link_timeout_ms: 60_000,
            session_timeout_ms: 120_000,
            halt_grace_ms: 3_000,
            reconnect_interval_ms: 2_000,
            link_poll_ms: 500,
            signal_refresh_ms: 5_000,
            watchdog_period_ms: 8_000,
            watchdog_feed_interval_ms: 1_000,
            provisioning_settle_ms: 2_000,
            loop_pause_ms: 5,
            poll_quantum_us: 100,
            telemetry_refresh_ms: 2_000,
            breathe_period_ms: 5_000,
            blink_period_ms: 1_000,
            pwm_cycle_us: 1_000,
            temperature_offset_c: 0.0,
            reset_session_on_link_recovery: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    pub wifi_ssid: String,
    pub wifi_pass: String,
    pub mqtt_host: String,
    pub mqtt_port: u16,
    pub mqtt_user: String,
    pub mqtt_pass: String,
    pub discovery_prefix: String,
    pub state_prefix: String,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            wifi_ssid: String::new(),
            wifi_pass: String::new(),
            mqtt_host: "192.168.1.100".to_string(),
            mqtt_port: 1883,
            mqtt_user: String::new(),
            mqtt_pass: String::new(),
            discovery_prefix: "homeassistant".to_string(),
            state_prefix: "envnode".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SensorKind {
    Dht11,
    Dht22,
}

impl SensorKind {
    /// Fastest sampling interval the part supports.
    pub fn min_refresh_ms(self) -> u32 {
        match self {
            Self::Dht11 => 1_000,
            Self::Dht22 => 2_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    pub name: String,
    pub version: String,
    pub unique_id: String,
    pub led_pin: i32,
    pub sensor_pin: i32,
    pub sensor_kind: SensorKind,
    pub led_active_low: bool,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            name: "Env Node".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            unique_id: DEFAULT_UNIQUE_ID.to_string(),
            led_pin: 4,
            sensor_pin: 2,
            sensor_kind: SensorKind::Dht22,
            led_active_low: false,
        }
    }
}

impl DeviceConfig {
    /// Replaces a missing or placeholder unique id with the lowercase hex of
    /// `mac`. Returns whether the id changed; explicit ids are kept.
    pub fn adopt_hardware_id(&mut self, mac: [u8; 6]) -> bool {
        let id = self.unique_id.trim();
        if !id.is_empty() && id != DEFAULT_UNIQUE_ID {
            return false;
        }
        self.unique_id = mac.iter().map(|byte| format!("{byte:02x}")).collect();
        true
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub supervisor: SupervisorConfig,
    pub network: NetworkConfig,
    pub device: DeviceConfig,
}

impl NodeConfig {
    pub fn from_json(document: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(document)?)
    }

    /// Applies `WIFI_*`, `MQTT_*` and `ENVNODE_DEVICE_ID` overrides.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(value) = lookup("WIFI_SSID") {
            self.network.wifi_ssid = value;
        }
        if let Some(value) = lookup("WIFI_PASS") {
            self.network.wifi_pass = value;
        }
        if let Some(value) = lookup("MQTT_HOST") {
            self.network.mqtt_host = value;
        }
        if let Some(value) = lookup("MQTT_PORT") {
            self.network.mqtt_port = value
                .trim()
                .parse::<u16>()
                .map_err(|_| ConfigError::Override {
                    key: "MQTT_PORT",
                    value,
                })?;
        }
        if let Some(value) = lookup("MQTT_USER") {
            self.network.mqtt_user = value;
        }
        if let Some(value) = lookup("MQTT_PASS") {
            self.network.mqtt_pass = value;
        }
        if let Some(value) = lookup("ENVNODE_DEVICE_ID") {
            self.device.unique_id = value;
        }
        Ok(())
    }

    pub fn sanitize(&mut self) {
        let supervisor = &mut self.supervisor;

        supervisor.telemetry_refresh_ms = supervisor
            .telemetry_refresh_ms
            .max(self.device.sensor_kind.min_refresh_ms());
        supervisor.pwm_cycle_us = supervisor.pwm_cycle_us.max(1);
        supervisor.poll_quantum_us = supervisor.poll_quantum_us.clamp(1, supervisor.pwm_cycle_us);
        supervisor.breathe_period_ms = supervisor.breathe_period_ms.max(2);
        supervisor.blink_period_ms = supervisor.blink_period_ms.max(2);
        supervisor.loop_pause_ms = supervisor.loop_pause_ms.max(1);

        if !supervisor.temperature_offset_c.is_finite() {
            supervisor.temperature_offset_c = 0.0;
        }

        let trimmed = self.device.unique_id.trim();
        self.device.unique_id = if trimmed.is_empty() {
            DeviceConfig::default().unique_id
        } else {
            trimmed.replace(|c: char| !(c.is_ascii_alphanumeric() || c == '_' || c == '-'), "_")
        };
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let supervisor = &self.supervisor;

        for (field, value) in [
            ("link_timeout_ms", supervisor.link_timeout_ms),
            ("session_timeout_ms", supervisor.session_timeout_ms),
            ("reconnect_interval_ms", supervisor.reconnect_interval_ms),
            ("watchdog_period_ms", supervisor.watchdog_period_ms),
            ("watchdog_feed_interval_ms", supervisor.watchdog_feed_interval_ms),
        ] {
            if value == 0 {
                return Err(ConfigError::Zero { field });
            }
        }

        if supervisor.watchdog_feed_interval_ms >= supervisor.watchdog_period_ms {
            return Err(ConfigError::WatchdogStarved {
                feed_ms: supervisor.watchdog_feed_interval_ms,
                period_ms: supervisor.watchdog_period_ms,
            });
        }

        if self.device.name.chars().count() > MAX_NAME_LENGTH {
            return Err(ConfigError::NameTooLong {
                name: self.device.name.clone(),
                max: MAX_NAME_LENGTH,
            });
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    #[test]
    fn partial_document_keeps_defaults() {
        let config = NodeConfig::from_json(
            r#"{"network":{"wifi_ssid":"attic"},"supervisor":{"link_timeout_ms":30000}}"#,
        )
        .expect("valid document");

        assert_eq!(config.network.wifi_ssid, "attic");
        assert_eq!(config.network.mqtt_port, 1883);
        assert_eq!(config.supervisor.link_timeout_ms, 30_000);
        assert_eq!(config.supervisor.session_timeout_ms, 120_000);
    }

    #[test]
    fn overrides_replace_network_settings() {
        let env: HashMap<&str, &str> = HashMap::from([
            ("MQTT_HOST", "broker.lan"),
            ("MQTT_PORT", "8883"),
            ("WIFI_SSID", "garage"),
        ]);
        let mut config = NodeConfig::default();
        config
            .apply_overrides(|key| env.get(key).map(|value| value.to_string()))
            .expect("valid overrides");

        assert_eq!(config.network.mqtt_host, "broker.lan");
        assert_eq!(config.network.mqtt_port, 8883);
        assert_eq!(config.network.wifi_ssid, "garage");
    }

    #[test]
    fn rejects_malformed_port_override() {
        let mut config = NodeConfig::default();
        let err = config
            .apply_overrides(|key| (key == "MQTT_PORT").then(|| "http".to_string()))
            .unwrap_err();
        assert!(matches!(err, ConfigError::Override { key: "MQTT_PORT", .. }));
    }

    #[test]
    fn sanitize_respects_sensor_limits() {
        let mut config = NodeConfig::default();
        config.device.sensor_kind = SensorKind::Dht22;
        config.supervisor.telemetry_refresh_ms = 500;
        config.supervisor.poll_quantum_us = 5_000;
        config.device.unique_id = " node 7 ".to_string();
        config.sanitize();

        assert_eq!(config.supervisor.telemetry_refresh_ms, 2_000);
        assert_eq!(config.supervisor.poll_quantum_us, config.supervisor.pwm_cycle_us);
        assert_eq!(config.device.unique_id, "node_7");
    }

    #[test]
    fn placeholder_id_is_derived_from_the_mac() {
        let mut device = DeviceConfig::default();
        assert!(device.adopt_hardware_id([0xA0, 0xB1, 0xC2, 0x03, 0xE4, 0xF5]));
        assert_eq!(device.unique_id, "a0b1c203e4f5");

        let mut blank = DeviceConfig {
            unique_id: "  ".to_string(),
            ..DeviceConfig::default()
        };
        assert!(blank.adopt_hardware_id([0, 0, 0, 0, 0, 1]));
        assert_eq!(blank.unique_id, "000000000001");
    }

    #[test]
    fn explicit_id_is_kept_over_the_mac() {
        let mut config = NodeConfig::default();
        config
            .apply_overrides(|key| (key == "ENVNODE_DEVICE_ID").then(|| "attic".to_string()))
            .expect("valid overrides");

        assert!(!config.device.adopt_hardware_id([0xA0, 0xB1, 0xC2, 0x03, 0xE4, 0xF5]));
        assert_eq!(config.device.unique_id, "attic");
    }

    #[test]
    fn validate_rejects_starved_watchdog() {
        let mut config = NodeConfig::default();
        config.supervisor.watchdog_feed_interval_ms = config.supervisor.watchdog_period_ms;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::WatchdogStarved { .. })
        ));
    }

    #[test]
    fn validate_rejects_long_names() {
        let mut config = NodeConfig::default();
        config.device.name = "Greenhouse North Bench".to_string();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::NameTooLong { .. })
        ));
    }

    #[test]
    fn defaults_validate() {
        assert!(NodeConfig::default().validate().is_ok());
    }
}
