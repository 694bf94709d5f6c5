//! Pairing of a physical switch with a smart light.
//!
//! A pairing exposes one virtual light. Turning it on powers the physical
//! device, waits for the smart device to come online and then applies the
//! requested (or configured) brightness. Turning it off switches the smart
//! device off and optionally cascades to the physical device.

pub mod config;
pub mod controller;
pub mod device;
pub mod entity;
pub mod registry;

#[cfg(test)]
pub(crate) mod testing;
#[cfg(test)]
mod tests;

pub use config::ConfigurationError;
pub use config::FormField;
pub use config::PairingConfig;
pub use config::PairingForm;
pub use config::PairingId;
pub use controller::PairingController;
pub use controller::PairingError;
pub use controller::PairingSnapshot;
pub use controller::PairingState;
pub use controller::TurnOnOutcome;
pub use controller::WaitPolicy;
pub use device::Activation;
pub use device::DeviceHost;
pub use device::DeviceId;
pub use entity::DeviceInfo;
pub use entity::PairingEntity;
pub use registry::PairingRegistry;
pub use registry::RegistryError;
