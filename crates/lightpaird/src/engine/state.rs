use std::collections::HashMap;

use serde::Serialize;

use crate::pairing::device::DeviceId;
use crate::pairing::device::DeviceState;

/// Centralized snapshot of every device the integrations reported.
///
/// A device is present from the first state report until it is removed.
/// Discovered devices without a report yet are only in the routing map.
#[derive(Debug, Clone, Default, Serialize)]
pub struct State {
    pub devices: HashMap<DeviceId, DeviceState>,
}

impl State {
    pub fn device(&self, id: &DeviceId) -> Option<&DeviceState> {
        self.devices.get(id)
    }
}
