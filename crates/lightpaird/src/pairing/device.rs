//! Device-level types and the capabilities a host must provide.
//!
//! A pairing never talks to hardware directly. It issues commands through
//! [`DeviceCommand`], reads cached state through [`DeviceStateReader`] and
//! learns about external changes through [`DeviceEvents`].

use std::collections::BTreeSet;
use std::fmt;

use async_trait::async_trait;
use serde::Deserialize;
use serde::Serialize;
use tokio::sync::mpsc;

/// Identifier of a device known to the host, e.g. `switch.lamp1`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceId(String);

impl DeviceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The part before the first `.`, or the whole id if there is none.
    pub fn domain(&self) -> &str {
        self.0.split_once('.').map_or(self.0.as_str(), |(d, _)| d)
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DeviceId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for DeviceId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Power state requested from a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Power {
    On,
    Off,
}

/// Power state as observed by the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum DevicePower {
    On,
    #[default]
    Off,
    Unreachable,
}

impl DevicePower {
    pub fn is_reachable(self) -> bool {
        self != DevicePower::Unreachable
    }
}

/// Color modes a light can report.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ColorMode {
    Onoff,
    Brightness,
    ColorTemp,
    Hs,
    Xy,
    Rgb,
    Rgbw,
    Rgbww,
    White,
}

/// Modes reported when the smart device does not advertise any.
pub fn default_color_modes() -> BTreeSet<ColorMode> {
    BTreeSet::from([ColorMode::ColorTemp, ColorMode::Xy])
}

/// Light feature bitmask, using the host platform's legacy flag values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SupportedFeatures(pub u32);

impl SupportedFeatures {
    pub const BRIGHTNESS: Self = Self(1);
    pub const COLOR_TEMP: Self = Self(2);
    pub const COLOR: Self = Self(16);

    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl std::ops::BitOr for SupportedFeatures {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl Default for SupportedFeatures {
    fn default() -> Self {
        Self::BRIGHTNESS | Self::COLOR_TEMP | Self::COLOR
    }
}

/// CIE 1931 xy chromaticity.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct XyColor {
    pub x: f32,
    pub y: f32,
}

/// Snapshot of a device as the host last saw it.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct DeviceState {
    pub power: DevicePower,
    pub brightness: Option<u8>,
    /// Color temperature in mireds.
    pub color_temp: Option<u16>,
    pub xy_color: Option<XyColor>,
    pub color_mode: Option<ColorMode>,
    pub supported_color_modes: Option<BTreeSet<ColorMode>>,
    pub supported_features: Option<SupportedFeatures>,
}

impl DeviceState {
    pub fn with_power(power: DevicePower) -> Self {
        Self {
            power,
            ..Self::default()
        }
    }
}

/// How bright the smart device should be.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Brightness {
    /// 0..=100
    Percent(u8),
    /// 0..=255
    Absolute(u8),
}

impl Brightness {
    /// Brightness on the 0..=255 scale.
    pub fn absolute(self) -> u8 {
        match self {
            Brightness::Absolute(v) => v,
            Brightness::Percent(p) => {
                let p = u32::from(p.min(100));
                ((p * 255 + 50) / 100) as u8
            }
        }
    }
}

/// Which color the smart device should show.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Color {
    /// Mireds.
    Temperature(u16),
    Xy(XyColor),
}

/// A turn-on request for a light: at most one brightness form and at most
/// one color form.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Activation {
    pub brightness: Option<Brightness>,
    pub color: Option<Color>,
}

impl Activation {
    /// Plain ON, no attributes.
    pub fn on() -> Self {
        Self::default()
    }

    pub fn brightness(mut self, brightness: Brightness) -> Self {
        self.brightness = Some(brightness);
        self
    }

    pub fn color(mut self, color: Color) -> Self {
        self.color = Some(color);
        self
    }

    pub fn is_plain(&self) -> bool {
        self.brightness.is_none() && self.color.is_none()
    }
}

/// A device changed state.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceStateChanged {
    pub device: DeviceId,
    pub state: DeviceState,
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum DeviceError {
    #[error("device {0} is unreachable")]
    Unreachable(DeviceId),

    #[error("unknown device: {0}")]
    UnknownDevice(DeviceId),

    #[error("device {device} rejected the command: {reason}")]
    Rejected { device: DeviceId, reason: String },
}

impl DeviceError {
    pub fn device(&self) -> &DeviceId {
        match self {
            DeviceError::Unreachable(d) | DeviceError::UnknownDevice(d) => d,
            DeviceError::Rejected { device, .. } => device,
        }
    }
}

/// Imperative device control.
///
/// Completion means the host accepted the request, not that the device has
/// already changed state.
#[async_trait]
pub trait DeviceCommand: Send + Sync {
    async fn set_power(&self, device: &DeviceId, power: Power) -> Result<(), DeviceError>;

    async fn activate(&self, device: &DeviceId, activation: Activation)
        -> Result<(), DeviceError>;
}

/// Read access to the host's view of a device.
#[async_trait]
pub trait DeviceStateReader: Send + Sync {
    async fn get(&self, device: &DeviceId) -> Result<DeviceState, DeviceError>;
}

/// Receiving half of a scoped state-change subscription.
pub type DeviceSubscription = mpsc::UnboundedReceiver<DeviceStateChanged>;

/// Push notifications for device state changes.
pub trait DeviceEvents: Send + Sync {
    /// Subscribe to changes of exactly the given devices. The subscription
    /// ends when the receiver is dropped.
    fn subscribe(&self, devices: &[DeviceId]) -> DeviceSubscription;
}

/// Which devices the host knows about.
pub trait DeviceDirectory: Send + Sync {
    fn contains(&self, device: &DeviceId) -> bool;
}

/// Everything a pairing needs from its host.
pub trait DeviceHost:
    DeviceCommand + DeviceStateReader + DeviceEvents + DeviceDirectory + 'static
{
}

impl<T> DeviceHost for T where
    T: DeviceCommand + DeviceStateReader + DeviceEvents + DeviceDirectory + 'static
{
}
