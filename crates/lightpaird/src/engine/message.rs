//! Type-safe message system for lightpaird
//!
//! Messages are split by direction to enforce correct usage at compile time:
//! - `FromIntegrationMessage`: Events from integrations to the engine
//! - `ToIntegrationMessage`: Commands from the engine to integrations

use tokio::sync::oneshot;

use crate::pairing::device::Activation;
use crate::pairing::device::DeviceError;
use crate::pairing::device::DeviceId;
use crate::pairing::device::DeviceState;
use crate::pairing::device::Power;

/// Reply channel carrying the outcome of a command back to the caller.
pub type CommandReply = oneshot::Sender<Result<(), DeviceError>>;

/// Messages FROM integrations TO the engine (events/state updates)
#[derive(Debug)]
pub enum FromIntegrationMessage {
    /// A device was discovered and can receive commands
    DeviceDiscovered {
        device: DeviceId,
        integration_name: String,
    },

    /// A device was removed (device unpaired, discovery retracted)
    DeviceRemoved { device: DeviceId },

    /// A device's state or availability changed
    DeviceStateChanged { device: DeviceId, state: DeviceState },
}

/// Messages FROM the engine TO integrations (commands)
#[derive(Debug)]
pub enum ToIntegrationMessage {
    /// Switch a device on or off
    SetPower {
        device: DeviceId,
        power: Power,
        reply: CommandReply,
    },

    /// Switch a light on with optional brightness and color
    Activate {
        device: DeviceId,
        activation: Activation,
        reply: CommandReply,
    },
}

impl ToIntegrationMessage {
    pub fn device(&self) -> &DeviceId {
        match self {
            ToIntegrationMessage::SetPower { device, .. }
            | ToIntegrationMessage::Activate { device, .. } => device,
        }
    }
}
