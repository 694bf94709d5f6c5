//! Integrations register themselves in the engine's integration registry.

#[cfg(feature = "integration_mqtt")]
pub mod mqtt;
