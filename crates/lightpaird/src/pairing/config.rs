use std::fmt;

use serde::Deserialize;
use serde::Serialize;

use super::device::DeviceDirectory;
use super::device::DeviceId;

/// Default for [`PairingForm::brightness_on_switch`].
pub const DEFAULT_BRIGHTNESS_ON_SWITCH: u8 = 100;

/// Stable identifier of a pairing.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PairingId(String);

impl PairingId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PairingId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PairingId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// A validated pairing.
///
/// Values are immutable; reconfiguration builds a new `PairingConfig` and the
/// controller swaps it in atomically.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PairingConfig {
    pub id: PairingId,
    pub name: String,
    pub physical_device: DeviceId,
    pub smart_device: DeviceId,
    /// Percentage applied to the smart device when the caller did not ask
    /// for a brightness. Zero means plain ON.
    pub brightness_on_switch: u8,
    pub turn_off_physical_on_off: bool,
}

impl PairingConfig {
    pub fn tunables(&self) -> Tunables {
        Tunables {
            brightness_on_switch: self.brightness_on_switch,
            turn_off_physical_on_off: self.turn_off_physical_on_off,
        }
    }

    /// Whether `device` is one of the two paired devices.
    pub fn involves(&self, device: &DeviceId) -> bool {
        &self.physical_device == device || &self.smart_device == device
    }
}

/// The settings an operation reads at its start.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tunables {
    pub brightness_on_switch: u8,
    pub turn_off_physical_on_off: bool,
}

/// Fields of the creation / reconfiguration form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum FormField {
    Name,
    PhysicalDevice,
    SmartDevice,
    BrightnessOnSwitch,
}

/// A submitted form was rejected; nothing was persisted.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid {field}: {message}")]
pub struct ConfigurationError {
    pub field: FormField,
    pub message: String,
}

impl ConfigurationError {
    pub fn new(field: FormField, message: impl Into<String>) -> Self {
        Self {
            field,
            message: message.into(),
        }
    }
}

/// User-submitted form data, before validation.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct PairingForm {
    pub name: String,
    pub physical_device: String,
    pub smart_device: String,
    #[serde(default = "default_brightness_on_switch")]
    pub brightness_on_switch: i64,
    #[serde(default)]
    pub turn_off_physical_on_off: bool,
}

fn default_brightness_on_switch() -> i64 {
    i64::from(DEFAULT_BRIGHTNESS_ON_SWITCH)
}

impl PairingForm {
    pub fn new(
        name: impl Into<String>,
        physical_device: impl Into<String>,
        smart_device: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            physical_device: physical_device.into(),
            smart_device: smart_device.into(),
            brightness_on_switch: default_brightness_on_switch(),
            turn_off_physical_on_off: false,
        }
    }

    pub fn brightness_on_switch(mut self, pct: i64) -> Self {
        self.brightness_on_switch = pct;
        self
    }

    pub fn turn_off_physical_on_off(mut self, enabled: bool) -> Self {
        self.turn_off_physical_on_off = enabled;
        self
    }

    /// Form pre-filled from an existing pairing, for reconfiguration.
    pub fn from_config(config: &PairingConfig) -> Self {
        Self {
            name: config.name.clone(),
            physical_device: config.physical_device.to_string(),
            smart_device: config.smart_device.to_string(),
            brightness_on_switch: i64::from(config.brightness_on_switch),
            turn_off_physical_on_off: config.turn_off_physical_on_off,
        }
    }

    /// Check every field and return all problems found.
    ///
    /// Device existence is only checked when a directory is given.
    pub fn check(&self, directory: Option<&dyn DeviceDirectory>) -> Vec<ConfigurationError> {
        let mut errors = Vec::new();

        if self.name.trim().is_empty() {
            errors.push(ConfigurationError::new(
                FormField::Name,
                "name must not be empty",
            ));
        }

        let physical = DeviceId::new(self.physical_device.trim());
        let smart = DeviceId::new(self.smart_device.trim());

        if !matches!(physical.domain(), "switch" | "light") || physical.as_str().ends_with('.') {
            errors.push(ConfigurationError::new(
                FormField::PhysicalDevice,
                format!("'{}' is not a switch or light", physical),
            ));
        } else if directory.is_some_and(|d| !d.contains(&physical)) {
            errors.push(ConfigurationError::new(
                FormField::PhysicalDevice,
                format!("device '{}' not found", physical),
            ));
        }

        if smart.domain() != "light" || smart.as_str().ends_with('.') {
            errors.push(ConfigurationError::new(
                FormField::SmartDevice,
                format!("'{}' is not a light", smart),
            ));
        } else if directory.is_some_and(|d| !d.contains(&smart)) {
            errors.push(ConfigurationError::new(
                FormField::SmartDevice,
                format!("device '{}' not found", smart),
            ));
        }

        if physical == smart {
            errors.push(ConfigurationError::new(
                FormField::SmartDevice,
                "smart device must differ from the physical device",
            ));
        }

        if !(0..=100).contains(&self.brightness_on_switch) {
            errors.push(ConfigurationError::new(
                FormField::BrightnessOnSwitch,
                format!(
                    "{} is outside 0..=100",
                    self.brightness_on_switch
                ),
            ));
        }

        errors
    }

    /// Validate and build a config, reporting the first offending field.
    pub fn validate(
        &self,
        id: PairingId,
        directory: Option<&dyn DeviceDirectory>,
    ) -> Result<PairingConfig, ConfigurationError> {
        if let Some(err) = self.check(directory).into_iter().next() {
            return Err(err);
        }

        Ok(PairingConfig {
            id,
            name: self.name.trim().to_string(),
            physical_device: DeviceId::new(self.physical_device.trim()),
            smart_device: DeviceId::new(self.smart_device.trim()),
            brightness_on_switch: self.brightness_on_switch as u8,
            turn_off_physical_on_off: self.turn_off_physical_on_off,
        })
    }
}
