use std::collections::BTreeSet;
use std::error::Error;
use std::str::FromStr;

use crate::integrations::mqtt::discovery::DeviceInfo;
use crate::integrations::mqtt::discovery::DiscoveryMessage;
use crate::pairing::device::Activation;
use crate::pairing::device::Color;
use crate::pairing::device::ColorMode;
use crate::pairing::device::DeviceId;
use crate::pairing::device::DevicePower;
use crate::pairing::device::DeviceState;
use crate::pairing::device::Power;
use crate::pairing::device::SupportedFeatures;
use crate::pairing::device::XyColor;

const DEFAULT_BRIGHTNESS_SCALE: u16 = 255;

/// Discovery components the integration handles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display, strum::EnumString)]
#[strum(serialize_all = "snake_case")]
pub enum Component {
    Light,
    Switch,
}

/// How several availability topics combine into one verdict
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, strum::Display, strum::EnumString)]
#[strum(serialize_all = "snake_case")]
pub enum AvailabilityMode {
    /// Online only while every topic says online
    All,
    /// Online while at least one topic says online
    Any,
    /// The most recent message on any topic decides
    #[default]
    Latest,
}

/// One followed availability topic
#[derive(Debug, Clone)]
pub struct AvailabilityTopic {
    pub topic: String,
    pub payload_available: String,
    pub payload_not_available: String,
    /// Last verdict seen on this topic. Topics count as online until told
    /// otherwise.
    pub online: bool,
}

/// A light or switch discovered over MQTT
#[derive(Debug, Clone)]
pub struct MqttDevice {
    /// Device ID (e.g., "light.0x0017880104e45517")
    pub id: DeviceId,

    pub component: Component,

    /// Human-readable name
    pub name: String,

    /// Unique identifier from Zigbee2MQTT
    #[allow(dead_code)]
    pub unique_id: String,

    /// Last state reported on the state topic
    pub state: DeviceState,

    /// Combined verdict of the availability topics
    pub available: bool,

    /// Device information
    #[allow(dead_code)]
    pub device_info: Option<DeviceInfo>,

    /// Topic to receive state updates
    pub state_topic: String,

    /// Topic to send commands
    pub command_topic: String,

    /// Topics announcing online/offline
    pub availability: Vec<AvailabilityTopic>,

    pub availability_mode: AvailabilityMode,

    /// Payloads for on/off commands
    pub payload_on: String,
    pub payload_off: String,

    /// Whether brightness is supported
    pub supports_brightness: bool,

    /// Device-side maximum brightness
    pub brightness_scale: u16,

    pub supported_color_modes: BTreeSet<ColorMode>,
}

impl MqttDevice {
    /// Create a device from a Zigbee2MQTT discovery message
    pub fn from_discovery(
        discovery: DiscoveryMessage,
        component: Component,
        node_id: &str,
    ) -> Result<Self, Box<dyn Error>> {
        let id = DeviceId::new(format!("{}.{}", component, node_id));
        let payload_available = discovery
            .payload_available
            .clone()
            .unwrap_or_else(|| "online".to_string());
        let payload_not_available = discovery
            .payload_not_available
            .clone()
            .unwrap_or_else(|| "offline".to_string());
        let availability = discovery
            .availability_topics()
            .into_iter()
            .map(|entry| AvailabilityTopic {
                topic: entry.topic,
                payload_available: entry
                    .payload_available
                    .unwrap_or_else(|| payload_available.clone()),
                payload_not_available: entry
                    .payload_not_available
                    .unwrap_or_else(|| payload_not_available.clone()),
                online: true,
            })
            .collect();
        // Unknown modes fall back to the Home Assistant default
        let availability_mode = discovery
            .availability_mode
            .as_deref()
            .and_then(|mode| AvailabilityMode::from_str(mode).ok())
            .unwrap_or_default();

        let unique_id = discovery
            .unique_id
            .unwrap_or_else(|| format!("{}_{}", node_id, component));

        let name = discovery
            .name
            .or_else(|| discovery.device.as_ref().map(|d| d.name.clone()))
            .unwrap_or_else(|| format!("{} {}", component, node_id));

        let state_topic = discovery
            .state_topic
            .ok_or("Missing state_topic in discovery message")?;

        let command_topic = discovery
            .command_topic
            .ok_or("Missing command_topic in discovery message")?;

        let supports_brightness =
            component == Component::Light && discovery.brightness.unwrap_or(false);

        let brightness_scale = match discovery.brightness_scale {
            Some(0) => return Err("brightness_scale must be positive".into()),
            Some(scale) => scale,
            None => DEFAULT_BRIGHTNESS_SCALE,
        };

        // Unknown modes are ignored rather than rejecting the whole device
        let supported_color_modes = discovery
            .supported_color_modes
            .unwrap_or_default()
            .iter()
            .filter_map(|mode| ColorMode::from_str(mode).ok())
            .collect();

        let mut device = Self {
            id,
            component,
            name,
            unique_id,
            state: DeviceState::default(),
            available: true,
            device_info: discovery.device,
            state_topic,
            command_topic,
            availability,
            availability_mode,
            payload_on: discovery.payload_on.unwrap_or_else(|| "ON".to_string()),
            payload_off: discovery.payload_off.unwrap_or_else(|| "OFF".to_string()),
            supports_brightness,
            brightness_scale,
            supported_color_modes,
        };
        device.state.supported_color_modes = device.color_modes();
        device.state.supported_features = device.features();
        Ok(device)
    }

    fn color_modes(&self) -> Option<BTreeSet<ColorMode>> {
        (self.component == Component::Light && !self.supported_color_modes.is_empty())
            .then(|| self.supported_color_modes.clone())
    }

    fn features(&self) -> Option<SupportedFeatures> {
        if self.component != Component::Light {
            return None;
        }
        let mut features = SupportedFeatures(0);
        if self.supports_brightness {
            features = features | SupportedFeatures::BRIGHTNESS;
        }
        if self.supported_color_modes.contains(&ColorMode::ColorTemp) {
            features = features | SupportedFeatures::COLOR_TEMP;
        }
        if self.supported_color_modes.iter().any(|mode| {
            matches!(
                mode,
                ColorMode::Hs | ColorMode::Xy | ColorMode::Rgb | ColorMode::Rgbw | ColorMode::Rgbww
            )
        }) {
            features = features | SupportedFeatures::COLOR;
        }
        Some(features)
    }

    /// State as the engine should see it, folding in availability.
    pub fn current_state(&self) -> DeviceState {
        if self.available {
            self.state.clone()
        } else {
            DeviceState {
                power: DevicePower::Unreachable,
                ..self.state.clone()
            }
        }
    }

    /// Update the device state from an MQTT payload
    ///
    /// Zigbee2MQTT sends state updates as JSON, e.g.:
    /// {"state": "ON", "brightness": 128, "color_mode": "xy", "color": {"x": 0.3, "y": 0.3}}
    ///
    /// Plain `ON`/`OFF` payloads are accepted too.
    pub fn update_state(&mut self, payload: &[u8]) -> Result<(), Box<dyn Error>> {
        let text = std::str::from_utf8(payload)?.trim();
        let state_update: serde_json::Value = match serde_json::from_str(text) {
            Ok(value @ serde_json::Value::Object(_)) => value,
            _ => serde_json::json!({ "state": text }),
        };

        // Update on/off state
        if let Some(state_str) = state_update.get("state").and_then(|v| v.as_str()) {
            self.state.power = if state_str == self.payload_on {
                DevicePower::On
            } else if state_str == self.payload_off {
                DevicePower::Off
            } else {
                return Err(format!("Unexpected state '{}'", state_str).into());
            };
        }

        if self.component != Component::Light {
            return Ok(());
        }

        // Update brightness if present and supported
        if self.supports_brightness {
            if let Some(brightness) = state_update.get("brightness").and_then(|v| v.as_u64()) {
                self.state.brightness = Some(self.from_device_scale(brightness));
            }
        }

        if let Some(mireds) = state_update.get("color_temp").and_then(|v| v.as_u64()) {
            self.state.color_temp = u16::try_from(mireds).ok();
        }

        if let Some(color) = state_update.get("color") {
            let x = color.get("x").and_then(|v| v.as_f64());
            let y = color.get("y").and_then(|v| v.as_f64());
            if let (Some(x), Some(y)) = (x, y) {
                self.state.xy_color = Some(XyColor {
                    x: x as f32,
                    y: y as f32,
                });
            }
        }

        if let Some(mode) = state_update.get("color_mode").and_then(|v| v.as_str()) {
            self.state.color_mode = ColorMode::from_str(mode).ok();
        }

        Ok(())
    }

    /// Topics whose messages feed [`Self::update_availability`]
    pub fn availability_topics(&self) -> impl Iterator<Item = &str> {
        self.availability.iter().map(|a| a.topic.as_str())
    }

    /// Record an availability message received on `topic`.
    ///
    /// Returns whether the combined availability changed. Zigbee2MQTT may
    /// wrap the value as `{"state": "online"}`.
    pub fn update_availability(
        &mut self,
        topic: &str,
        payload: &[u8],
    ) -> Result<bool, Box<dyn Error>> {
        let text = std::str::from_utf8(payload)?.trim();
        let value = match serde_json::from_str::<serde_json::Value>(text) {
            Ok(json) => json
                .get("state")
                .and_then(|v| v.as_str())
                .map(str::to_string)
                .unwrap_or_else(|| text.to_string()),
            Err(_) => text.to_string(),
        };

        let Some(entry) = self.availability.iter_mut().find(|a| a.topic == topic) else {
            return Ok(false);
        };
        entry.online = if value == entry.payload_available {
            true
        } else if value == entry.payload_not_available {
            false
        } else {
            return Err(format!("Unexpected availability '{}' on {}", value, topic).into());
        };
        let latest = entry.online;

        let available = match self.availability_mode {
            AvailabilityMode::All => self.availability.iter().all(|a| a.online),
            AvailabilityMode::Any => self.availability.iter().any(|a| a.online),
            AvailabilityMode::Latest => latest,
        };
        let changed = available != self.available;
        self.available = available;
        Ok(changed)
    }

    /// Generate a command payload to switch the device on or off
    pub fn power_payload(&self, power: Power) -> Result<Vec<u8>, Box<dyn Error>> {
        let payload = serde_json::json!({
            "state": match power {
                Power::On => &self.payload_on,
                Power::Off => &self.payload_off,
            }
        });
        Ok(serde_json::to_vec(&payload)?)
    }

    /// Generate a command payload to switch the device on with attributes
    ///
    /// Attributes the device does not support are dropped.
    pub fn activation_payload(&self, activation: &Activation) -> Result<Vec<u8>, Box<dyn Error>> {
        let mut payload = serde_json::json!({ "state": self.payload_on });

        if self.component == Component::Light {
            if self.supports_brightness {
                if let Some(brightness) = activation.brightness {
                    payload["brightness"] =
                        serde_json::json!(self.to_device_scale(brightness.absolute()));
                }
            }

            match activation.color {
                Some(Color::Temperature(mireds)) => {
                    payload["color_temp"] = serde_json::json!(mireds);
                }
                Some(Color::Xy(xy)) => {
                    payload["color"] = serde_json::json!({ "x": xy.x, "y": xy.y });
                }
                None => {}
            }
        }

        Ok(serde_json::to_vec(&payload)?)
    }

    fn to_device_scale(&self, brightness: u8) -> u64 {
        let scale = u64::from(self.brightness_scale);
        (u64::from(brightness) * scale + 127) / 255
    }

    fn from_device_scale(&self, brightness: u64) -> u8 {
        let scale = u64::from(self.brightness_scale);
        let value = (brightness.min(scale) * 255 + scale / 2) / scale;
        value as u8
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pairing::device::Brightness;

    fn light_discovery() -> DiscoveryMessage {
        DiscoveryMessage {
            name: Some("Hall bulb".to_string()),
            unique_id: Some("hall_bulb".to_string()),
            state_topic: Some("zigbee2mqtt/hall_bulb".to_string()),
            command_topic: Some("zigbee2mqtt/hall_bulb/set".to_string()),
            availability_topic: Some("zigbee2mqtt/hall_bulb/availability".to_string()),
            brightness: Some(true),
            supported_color_modes: Some(vec!["color_temp".to_string(), "xy".to_string()]),
            schema: Some("json".to_string()),
            ..DiscoveryMessage::default()
        }
    }

    fn zigbee2mqtt_discovery(mode: &str) -> DiscoveryMessage {
        serde_json::from_value(serde_json::json!({
            "state_topic": "zigbee2mqtt/hall_bulb",
            "command_topic": "zigbee2mqtt/hall_bulb/set",
            "availability": [
                {"topic": "zigbee2mqtt/bridge/state"},
                {"topic": "zigbee2mqtt/hall_bulb/availability"}
            ],
            "availability_mode": mode
        }))
        .unwrap()
    }

    fn light() -> MqttDevice {
        MqttDevice::from_discovery(light_discovery(), Component::Light, "hall_bulb").unwrap()
    }

    fn payload_json(bytes: Vec<u8>) -> serde_json::Value {
        serde_json::from_slice(&bytes).unwrap()
    }

    #[test]
    fn test_light_from_discovery() {
        let light = light();
        assert_eq!(light.id, DeviceId::from("light.hall_bulb"));
        assert_eq!(
            light.state.supported_color_modes,
            Some(BTreeSet::from([ColorMode::ColorTemp, ColorMode::Xy]))
        );
        assert_eq!(
            light.state.supported_features,
            Some(
                SupportedFeatures::BRIGHTNESS
                    | SupportedFeatures::COLOR_TEMP
                    | SupportedFeatures::COLOR
            )
        );
    }

    #[test]
    fn test_missing_command_topic() {
        let discovery = DiscoveryMessage {
            command_topic: None,
            ..light_discovery()
        };
        assert!(MqttDevice::from_discovery(discovery, Component::Light, "x").is_err());
    }

    #[test]
    fn test_update_state() {
        let mut light = light();
        let payload = br#"{"state": "ON", "brightness": 128, "color_mode": "xy", "color": {"x": 0.3, "y": 0.4}, "color_temp": 250}"#;
        light.update_state(payload).unwrap();

        assert_eq!(light.state.power, DevicePower::On);
        assert_eq!(light.state.brightness, Some(128));
        assert_eq!(light.state.color_mode, Some(ColorMode::Xy));
        assert_eq!(light.state.xy_color, Some(XyColor { x: 0.3, y: 0.4 }));
        assert_eq!(light.state.color_temp, Some(250));
    }

    #[test]
    fn test_plain_switch_payload() {
        let discovery = DiscoveryMessage {
            state_topic: Some("zigbee2mqtt/hall_switch".to_string()),
            command_topic: Some("zigbee2mqtt/hall_switch/set".to_string()),
            brightness: Some(true),
            ..DiscoveryMessage::default()
        };
        let mut switch = MqttDevice::from_discovery(discovery, Component::Switch, "hall").unwrap();
        assert!(!switch.supports_brightness);
        assert_eq!(switch.state.supported_features, None);

        switch.update_state(b"ON").unwrap();
        assert_eq!(switch.state.power, DevicePower::On);
        switch.update_state(br#"{"state": "OFF", "linkquality": 80}"#).unwrap();
        assert_eq!(switch.state.power, DevicePower::Off);
        assert!(switch.update_state(b"TOGGLE").is_err());
    }

    #[test]
    fn test_availability() {
        let mut light = light();
        light.update_state(br#"{"state": "ON"}"#).unwrap();

        let topic = "zigbee2mqtt/hall_bulb/availability";
        assert!(light.update_availability(topic, br#"{"state": "offline"}"#).unwrap());
        assert_eq!(light.current_state().power, DevicePower::Unreachable);
        assert!(!light.update_availability(topic, b"offline").unwrap());

        assert!(light.update_availability(topic, b"online").unwrap());
        assert_eq!(light.current_state().power, DevicePower::On);

        assert!(!light.update_availability("zigbee2mqtt/other", b"offline").unwrap());
        assert!(light.update_availability(topic, b"gone").is_err());
    }

    #[test]
    fn test_availability_mode_all_follows_device_topic() {
        let mut light =
            MqttDevice::from_discovery(zigbee2mqtt_discovery("all"), Component::Light, "hall_bulb")
                .unwrap();
        assert_eq!(light.availability_mode, AvailabilityMode::All);
        assert_eq!(
            light.availability_topics().collect::<Vec<_>>(),
            vec!["zigbee2mqtt/bridge/state", "zigbee2mqtt/hall_bulb/availability"]
        );

        assert!(!light
            .update_availability("zigbee2mqtt/bridge/state", br#"{"state": "online"}"#)
            .unwrap());
        assert!(light
            .update_availability("zigbee2mqtt/hall_bulb/availability", br#"{"state": "offline"}"#)
            .unwrap());
        assert_eq!(light.current_state().power, DevicePower::Unreachable);

        // The bridge coming back does not revive a device that is still offline
        assert!(!light
            .update_availability("zigbee2mqtt/bridge/state", b"online")
            .unwrap());
        assert!(!light.available);
    }

    #[test]
    fn test_availability_modes_any_and_latest() {
        let mut any =
            MqttDevice::from_discovery(zigbee2mqtt_discovery("any"), Component::Light, "hall_bulb")
                .unwrap();
        assert!(!any
            .update_availability("zigbee2mqtt/bridge/state", b"offline")
            .unwrap());
        assert!(any
            .update_availability("zigbee2mqtt/hall_bulb/availability", b"offline")
            .unwrap());
        assert!(!any.available);

        let mut latest =
            MqttDevice::from_discovery(zigbee2mqtt_discovery("bogus"), Component::Light, "hall_bulb")
                .unwrap();
        assert_eq!(latest.availability_mode, AvailabilityMode::Latest);
        latest
            .update_availability("zigbee2mqtt/hall_bulb/availability", b"offline")
            .unwrap();
        latest
            .update_availability("zigbee2mqtt/bridge/state", b"online")
            .unwrap();
        assert!(latest.available);
    }

    #[test]
    fn test_activation_payload() {
        let light = light();
        let payload = light
            .activation_payload(
                &Activation::on()
                    .brightness(Brightness::Percent(80))
                    .color(Color::Temperature(370)),
            )
            .unwrap();
        assert_eq!(
            payload_json(payload),
            serde_json::json!({"state": "ON", "brightness": 204, "color_temp": 370})
        );

        assert_eq!(
            payload_json(light.power_payload(Power::Off).unwrap()),
            serde_json::json!({"state": "OFF"})
        );
    }

    #[test]
    fn test_brightness_scale() {
        let discovery = DiscoveryMessage {
            brightness_scale: Some(254),
            ..light_discovery()
        };
        let mut light = MqttDevice::from_discovery(discovery, Component::Light, "x").unwrap();

        let payload = light
            .activation_payload(&Activation::on().brightness(Brightness::Absolute(255)))
            .unwrap();
        assert_eq!(payload_json(payload)["brightness"], serde_json::json!(254));

        light.update_state(br#"{"brightness": 254}"#).unwrap();
        assert_eq!(light.state.brightness, Some(255));
    }
}
