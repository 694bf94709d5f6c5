use serde::Deserialize;
use serde::Serialize;

/// Deserialize a field that can be either a string or an integer.
///
/// Zigbee2MQTT sends version fields like `hw_version` as integers, but the
/// Home Assistant discovery schema defines them as strings. This helper
/// accepts both types and converts integers to strings.
fn deserialize_string_or_int<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    use serde::de;

    struct StringOrInt;

    impl<'de> de::Visitor<'de> for StringOrInt {
        type Value = Option<String>;

        fn expecting(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
            f.write_str("string, integer, or null")
        }

        fn visit_none<E>(self) -> Result<Self::Value, E> {
            Ok(None)
        }

        fn visit_unit<E>(self) -> Result<Self::Value, E> {
            Ok(None)
        }

        fn visit_str<E>(self, v: &str) -> Result<Self::Value, E> {
            Ok(Some(v.to_string()))
        }

        fn visit_string<E>(self, v: String) -> Result<Self::Value, E> {
            Ok(Some(v))
        }

        fn visit_i64<E>(self, v: i64) -> Result<Self::Value, E> {
            Ok(Some(v.to_string()))
        }

        fn visit_u64<E>(self, v: u64) -> Result<Self::Value, E> {
            Ok(Some(v.to_string()))
        }
    }

    deserializer.deserialize_any(StringOrInt)
}

/// Deserialize a field that can be a string, boolean, or integer.
///
/// Zigbee2MQTT sends `payload_on`/`payload_off` as `"ON"`/`"OFF"` for lights
/// and switches, but some firmwares publish booleans. This helper accepts any
/// scalar type and converts to a string.
fn deserialize_string_or_scalar<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    use serde::de;

    struct StringOrScalar;

    impl<'de> de::Visitor<'de> for StringOrScalar {
        type Value = Option<String>;

        fn expecting(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
            f.write_str("string, boolean, integer, or null")
        }

        fn visit_none<E>(self) -> Result<Self::Value, E> {
            Ok(None)
        }

        fn visit_unit<E>(self) -> Result<Self::Value, E> {
            Ok(None)
        }

        fn visit_bool<E>(self, v: bool) -> Result<Self::Value, E> {
            Ok(Some(v.to_string()))
        }

        fn visit_str<E>(self, v: &str) -> Result<Self::Value, E> {
            Ok(Some(v.to_string()))
        }

        fn visit_string<E>(self, v: String) -> Result<Self::Value, E> {
            Ok(Some(v))
        }

        fn visit_i64<E>(self, v: i64) -> Result<Self::Value, E> {
            Ok(Some(v.to_string()))
        }

        fn visit_u64<E>(self, v: u64) -> Result<Self::Value, E> {
            Ok(Some(v.to_string()))
        }
    }

    deserializer.deserialize_any(StringOrScalar)
}

/// Discovery message for Zigbee2MQTT devices
///
/// This struct represents the JSON payload sent by Zigbee2MQTT on discovery topics.
/// Based on Home Assistant's MQTT discovery protocol.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct DiscoveryMessage {
    /// Human-readable name of the entity
    pub name: Option<String>,

    /// Unique identifier for this entity
    pub unique_id: Option<String>,

    /// Topic to receive state updates
    pub state_topic: Option<String>,

    /// Topic to send commands
    pub command_topic: Option<String>,

    /// Single availability topic (older discovery payloads)
    pub availability_topic: Option<String>,

    /// Availability topics (Zigbee2MQTT publishes a list)
    pub availability: Option<Vec<Availability>>,

    /// Payload marking the device online (default "online")
    pub payload_available: Option<String>,

    /// Payload marking the device offline (default "offline")
    pub payload_not_available: Option<String>,

    /// How several availability topics combine: "all", "any" or "latest"
    pub availability_mode: Option<String>,

    /// Device information
    pub device: Option<DeviceInfo>,

    /// Payload to send when turning on
    #[serde(default, deserialize_with = "deserialize_string_or_scalar")]
    pub payload_on: Option<String>,

    /// Payload to send when turning off
    #[serde(default, deserialize_with = "deserialize_string_or_scalar")]
    pub payload_off: Option<String>,

    /// Whether brightness is supported
    pub brightness: Option<bool>,

    /// Upper bound of the brightness scale (default 255)
    pub brightness_scale: Option<u16>,

    /// Color modes the light supports, e.g. `["color_temp", "xy"]`
    pub supported_color_modes: Option<Vec<String>>,

    /// Schema type ("json" for Zigbee2MQTT lights)
    pub schema: Option<String>,
}

impl DiscoveryMessage {
    /// Every availability topic to follow.
    ///
    /// Falls back to the single legacy `availability_topic` when no list is
    /// given.
    pub fn availability_topics(&self) -> Vec<Availability> {
        match &self.availability {
            Some(list) if !list.is_empty() => list.clone(),
            _ => self
                .availability_topic
                .iter()
                .map(|topic| Availability {
                    topic: topic.clone(),
                    ..Availability::default()
                })
                .collect(),
        }
    }
}

/// One entry of the `availability` list
///
/// Payloads left unset fall back to the message-level ones.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct Availability {
    pub topic: String,
    pub payload_available: Option<String>,
    pub payload_not_available: Option<String>,
}

/// Device information from Zigbee2MQTT discovery
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DeviceInfo {
    /// List of identifiers for this device
    pub identifiers: Vec<String>,

    /// Device name
    pub name: String,

    /// Manufacturer name
    pub manufacturer: Option<String>,

    /// Model name
    pub model: Option<String>,

    /// Software version (can be string or integer in Zigbee2MQTT)
    #[serde(default, deserialize_with = "deserialize_string_or_int")]
    pub sw_version: Option<String>,

    /// Hardware version (can be string or integer in Zigbee2MQTT)
    #[serde(default, deserialize_with = "deserialize_string_or_int")]
    pub hw_version: Option<String>,
}

/// Parse a discovery topic to extract component type, node_id, and object_id
///
/// Topic format: {prefix}/{component}/{node_id}/{object_id}/config
/// Example: homeassistant/light/0x00124b001234abcd/light/config
///
/// Returns: (component, node_id, object_id)
pub fn parse_discovery_topic(topic: &str, prefix: &str) -> Option<(String, String, String)> {
    // Remove the discovery prefix
    let without_prefix = topic.strip_prefix(prefix)?.strip_prefix('/')?;

    // Split the remaining parts
    let parts: Vec<&str> = without_prefix.split('/').collect();

    // We expect at least 4 parts: component/node_id/object_id/config
    if parts.len() < 4 || parts.last() != Some(&"config") {
        return None;
    }

    let component = parts[0].to_string();
    let node_id = parts[1].to_string();
    let object_id = parts[2].to_string();

    Some((component, node_id, object_id))
}
