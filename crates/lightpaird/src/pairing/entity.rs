use std::sync::Arc;
use std::sync::Mutex;
use std::sync::PoisonError;

use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::debug;
use tracing::info;
use tracing::warn;

use super::config::PairingConfig;
use super::config::PairingId;
use super::controller::PairingController;
use super::controller::PairingError;
use super::controller::PairingSnapshot;
use super::controller::PairingState;
use super::controller::TurnOnOutcome;
use super::device::Activation;
use super::device::DeviceHost;
use super::device::DeviceSubscription;

pub const MANUFACTURER: &str = "Virtual Light Manufacturer";
pub const MODEL: &str = "Virtual Light Model";
pub const SW_VERSION: &str = "1.0";

/// Descriptive metadata of the virtual device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceInfo {
    pub identifiers: Vec<String>,
    pub name: String,
    pub manufacturer: String,
    pub model: String,
    pub sw_version: String,
}

/// The virtual light the host exposes for a pairing.
///
/// Intents are forwarded to the [`PairingController`]; state changes of
/// either paired device trigger a refresh once the entity is activated.
pub struct PairingEntity<D> {
    controller: Arc<PairingController<D>>,
    devices: Arc<D>,
    bridge: Mutex<Option<JoinHandle<()>>>,
}

impl<D: DeviceHost> PairingEntity<D> {
    pub fn new(controller: Arc<PairingController<D>>, devices: Arc<D>) -> Self {
        Self {
            controller,
            devices,
            bridge: Mutex::new(None),
        }
    }

    pub fn id(&self) -> PairingId {
        self.controller.config().id.clone()
    }

    pub fn name(&self) -> String {
        self.controller.config().name.clone()
    }

    pub fn config(&self) -> Arc<PairingConfig> {
        self.controller.config()
    }

    pub fn controller(&self) -> &Arc<PairingController<D>> {
        &self.controller
    }

    pub fn state(&self) -> PairingState {
        self.controller.snapshot().state
    }

    pub fn snapshot(&self) -> PairingSnapshot {
        self.controller.snapshot()
    }

    pub fn is_active(&self) -> bool {
        self.bridge().is_some()
    }

    pub fn device_info(&self) -> DeviceInfo {
        let config = self.controller.config();
        DeviceInfo {
            identifiers: vec![config.id.to_string()],
            name: config.name.clone(),
            manufacturer: MANUFACTURER.to_string(),
            model: MODEL.to_string(),
            sw_version: SW_VERSION.to_string(),
        }
    }

    /// Subscribe to the paired devices and load the initial state.
    ///
    /// The subscription is in place before the first refresh, so a change
    /// racing with activation still triggers another refresh.
    pub async fn activate(&self) -> Result<PairingSnapshot, PairingError> {
        let config = self.controller.config();
        let subscription = self.devices.subscribe(&[
            config.physical_device.clone(),
            config.smart_device.clone(),
        ]);

        let task = tokio::spawn(Self::bridge_task(self.controller.clone(), subscription));
        if let Some(previous) = self.bridge().replace(task) {
            previous.abort();
        }
        info!(pairing = %config.id, "activated");

        self.controller.refresh_state().await
    }

    /// Stop reacting to device changes.
    pub fn deactivate(&self) {
        if let Some(task) = self.bridge().take() {
            task.abort();
            info!(pairing = %self.controller.config().id, "deactivated");
        }
    }

    pub async fn turn_on(&self, request: Activation) -> Result<TurnOnOutcome, PairingError> {
        self.controller.turn_on(request).await
    }

    pub async fn turn_off(&self) -> Result<(), PairingError> {
        self.controller.turn_off().await
    }

    pub async fn update(&self) -> Result<PairingSnapshot, PairingError> {
        self.controller.refresh_state().await
    }

    async fn bridge_task(
        controller: Arc<PairingController<D>>,
        mut subscription: DeviceSubscription,
    ) {
        while let Some(event) = subscription.recv().await {
            let config = controller.config();
            if !config.involves(&event.device) {
                continue;
            }

            // A burst of changes only needs one refresh
            while let Ok(next) = subscription.try_recv() {
                debug!(pairing = %config.id, device = %next.device, "coalescing state change");
            }

            debug!(pairing = %config.id, device = %event.device, "paired device changed");
            if let Err(e) = controller.refresh_state().await {
                warn!(pairing = %config.id, "failed to refresh state: {}", e);
            }
        }
        debug!("device subscription closed");
    }

    fn bridge(&self) -> std::sync::MutexGuard<'_, Option<JoinHandle<()>>> {
        self.bridge.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<D> Drop for PairingEntity<D> {
    fn drop(&mut self) {
        let bridge = self
            .bridge
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(task) = bridge.take() {
            task.abort();
        }
    }
}
