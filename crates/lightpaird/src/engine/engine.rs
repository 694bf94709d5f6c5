use std::collections::HashMap;
use std::error::Error;
use std::sync::Arc;
use std::sync::MutexGuard;
use std::sync::PoisonError;
use std::time::Duration;

use arc_swap::ArcSwap;
use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;

use super::event::Subscribers;
use super::integration::FromIntegrationReceiver;
use super::integration::FromIntegrationSender;
use super::integration::Integration;
use super::integration::IntegrationContext;
use super::integration::ToIntegrationSender;
use super::message::CommandReply;
use super::message::FromIntegrationMessage;
use super::message::ToIntegrationMessage;
use super::state::State;
use crate::pairing::device::Activation;
use crate::pairing::device::DeviceCommand;
use crate::pairing::device::DeviceDirectory;
use crate::pairing::device::DeviceError;
use crate::pairing::device::DeviceEvents;
use crate::pairing::device::DeviceId;
use crate::pairing::device::DevicePower;
use crate::pairing::device::DeviceState;
use crate::pairing::device::DeviceStateChanged;
use crate::pairing::device::DeviceStateReader;
use crate::pairing::device::DeviceSubscription;
use crate::pairing::device::Power;

/// lightpaird engine
///
/// This structure handles the flow of events from integrations, routes device commands to the
/// integration owning the device, and maintains a view of the world with State.
pub struct Engine {
    /// Centralized state snapshot (readers load the Arc, writer stores a new one)
    state: ArcSwap<State>,

    /// Map of device id -> integration name for routing commands
    device_integration_map: std::sync::Mutex<HashMap<DeviceId, String>>,

    /// Communication channels to integrations (for commands)
    integration_channels: std::sync::Mutex<HashMap<String, ToIntegrationSender>>,

    /// Receive messages from integrations (events)
    message_rx: Mutex<FromIntegrationReceiver>,

    /// Sender for integrations to report events back to the engine
    message_tx: FromIntegrationSender,

    /// Scoped state-change subscriptions
    subscribers: std::sync::Mutex<Subscribers>,

    /// Bumped whenever a device is discovered or removed
    directory: watch::Sender<u64>,

    /// How long a command may wait for its integration to answer
    command_timeout: Duration,

    /// Handles for integration tasks
    integration_handles: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

/// Capacity for the integration→engine message channel
/// Provides backpressure when integrations send faster than the engine can process
const FROM_INTEGRATION_CHANNEL_SIZE: usize = 1024;

const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(10);

impl Engine {
    /// Create a new Engine instance
    pub fn new() -> Self {
        let (message_tx, message_rx) = mpsc::channel(FROM_INTEGRATION_CHANNEL_SIZE);
        let (directory, _) = watch::channel(0);
        Self {
            state: ArcSwap::new(Arc::default()),
            device_integration_map: std::sync::Mutex::new(HashMap::new()),
            integration_channels: std::sync::Mutex::new(HashMap::new()),
            message_rx: Mutex::new(message_rx),
            message_tx,
            subscribers: std::sync::Mutex::new(Subscribers::default()),
            directory,
            command_timeout: DEFAULT_COMMAND_TIMEOUT,
            integration_handles: std::sync::Mutex::new(Vec::new()),
        }
    }

    pub fn with_command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = timeout;
        self
    }

    /// Register integrations from configuration
    ///
    /// Every factory in the integration registry is offered the config;
    /// factories return `None` when their integration is not configured.
    pub fn register_integrations_from_config(&mut self, cfg: &crate::config::Config) {
        let ctx = IntegrationContext { config: cfg };
        for constr in super::integration::REGISTRY {
            let integration = match constr(&ctx) {
                Ok(Some(i)) => i,
                Err(e) => {
                    error!("failed to setup integration: {:#}", e);
                    continue;
                }
                Ok(None) => continue,
            };
            let name = integration.name().to_string();
            self.register_integration(name, integration);
        }
    }

    /// Register an integration with the engine
    ///
    /// This spawns the integration in a background task, wires up channels,
    /// and starts its setup process.
    pub fn register_integration(&mut self, name: String, mut integration: Box<dyn Integration>) {
        let (to_integration_tx, mut to_integration_rx) = mpsc::unbounded_channel();
        let from_integration_tx = self.message_tx.clone();

        lock(&self.integration_channels).insert(name.clone(), to_integration_tx);

        // Spawn integration task
        let handle = tokio::spawn(async move {
            // Setup integration (gives it the sender for events)
            if let Err(e) = integration.setup(from_integration_tx).await {
                warn!("Integration '{}' setup failed: {}", name, e);
                return;
            }

            // Process commands from engine
            while let Some(msg) = to_integration_rx.recv().await {
                if let Err(e) = integration.handle_message(msg).await {
                    warn!("Integration '{}' failed to handle message: {}", name, e);
                }
            }

            if let Err(e) = integration.shutdown().await {
                warn!("Integration '{}' shutdown failed: {}", name, e);
            }
        });

        lock(&self.integration_handles).push(handle);
    }

    /// Run the engine's main event loop
    ///
    /// Processes incoming events from integrations and updates state.
    pub async fn run(&self) -> Result<(), Box<dyn Error + Send>> {
        info!("Engine starting");

        let mut rx = self.message_rx.lock().await;
        while let Some(msg) = rx.recv().await {
            self.handle_event(msg);
        }

        info!("Engine shutting down");
        Ok(())
    }

    /// Close every integration's command channel and wait for the
    /// integrations to finish their shutdown.
    pub async fn shutdown(&self, grace: Duration) {
        lock(&self.integration_channels).clear();
        let handles: Vec<_> = lock(&self.integration_handles).drain(..).collect();
        for handle in handles {
            let abort = handle.abort_handle();
            if tokio::time::timeout(grace, handle).await.is_err() {
                warn!("Integration did not shut down within {:?}, aborting", grace);
                abort.abort();
            }
        }
    }

    /// Get a snapshot of the current engine state.
    ///
    /// Clones the `Arc` (atomic refcount bump), essentially free.
    pub fn state_snapshot(&self) -> Arc<State> {
        self.state.load_full()
    }

    /// Sender integrations (and tests) use to feed events into the engine.
    pub fn message_sender(&self) -> FromIntegrationSender {
        self.message_tx.clone()
    }

    /// Wait until every device in `devices` has been discovered.
    ///
    /// Returns false if `timeout` elapsed first.
    pub async fn wait_for_devices(&self, devices: &[DeviceId], timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut changes = self.directory.subscribe();
        loop {
            if devices.iter().all(|d| self.contains(d)) {
                return true;
            }
            match tokio::time::timeout_at(deadline, changes.changed()).await {
                Ok(Ok(())) => continue,
                _ => return false,
            }
        }
    }

    /// Handle an event from an integration
    pub(crate) fn handle_event(&self, msg: FromIntegrationMessage) {
        match msg {
            FromIntegrationMessage::DeviceDiscovered {
                device,
                integration_name,
            } => {
                info!("Device discovered: {} (from {})", device, integration_name);

                // Record which integration owns this device for command routing.
                // State is not populated until the first state-change message arrives.
                lock(&self.device_integration_map).insert(device, integration_name);
                self.directory.send_modify(|generation| *generation += 1);
            }
            FromIntegrationMessage::DeviceRemoved { device } => {
                info!("Device removed: {}", device);

                self.state.rcu(|current| {
                    let mut state = State::clone(current);
                    state.devices.remove(&device);
                    state
                });
                lock(&self.device_integration_map).remove(&device);
                self.directory.send_modify(|generation| *generation += 1);

                // Pairings involving the device see it go away
                self.notify(DeviceStateChanged {
                    device,
                    state: DeviceState::with_power(DevicePower::Unreachable),
                });
            }
            FromIntegrationMessage::DeviceStateChanged { device, state } => {
                info!(
                    "Device state changed: {} -> power={}, brightness={:?}",
                    device, state.power, state.brightness
                );

                self.state.rcu(|current| {
                    let mut snapshot = State::clone(current);
                    snapshot.devices.insert(device.clone(), state.clone());
                    snapshot
                });

                self.notify(DeviceStateChanged { device, state });
            }
        }
    }

    fn notify(&self, event: DeviceStateChanged) {
        lock(&self.subscribers).notify(&event);
    }

    /// Route a command to the integration that owns `device` and wait for
    /// its answer.
    async fn dispatch(
        &self,
        device: &DeviceId,
        build: impl FnOnce(CommandReply) -> ToIntegrationMessage,
    ) -> Result<(), DeviceError> {
        if let Some(state) = self.state.load().device(device) {
            if state.power == DevicePower::Unreachable {
                return Err(DeviceError::Unreachable(device.clone()));
            }
        }

        let (reply_tx, reply_rx) = oneshot::channel();
        {
            let map = lock(&self.device_integration_map);
            let integration_name = map
                .get(device)
                .ok_or_else(|| DeviceError::UnknownDevice(device.clone()))?;

            let channels = lock(&self.integration_channels);
            let tx = channels
                .get(integration_name)
                .ok_or_else(|| DeviceError::Rejected {
                    device: device.clone(),
                    reason: format!("integration '{}' is not running", integration_name),
                })?;

            debug!("Routing command for {} to '{}'", device, integration_name);
            tx.send(build(reply_tx)).map_err(|_| DeviceError::Rejected {
                device: device.clone(),
                reason: format!("integration '{}' stopped", integration_name),
            })?;
        }

        match tokio::time::timeout(self.command_timeout, reply_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(DeviceError::Rejected {
                device: device.clone(),
                reason: "integration dropped the command".to_string(),
            }),
            Err(_) => {
                warn!("Command for {} timed out after {:?}", device, self.command_timeout);
                Err(DeviceError::Unreachable(device.clone()))
            }
        }
    }
}

impl Default for Engine {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DeviceCommand for Engine {
    async fn set_power(&self, device: &DeviceId, power: Power) -> Result<(), DeviceError> {
        self.dispatch(device, |reply| ToIntegrationMessage::SetPower {
            device: device.clone(),
            power,
            reply,
        })
        .await
    }

    async fn activate(&self, device: &DeviceId, activation: Activation) -> Result<(), DeviceError> {
        self.dispatch(device, |reply| ToIntegrationMessage::Activate {
            device: device.clone(),
            activation,
            reply,
        })
        .await
    }
}

#[async_trait]
impl DeviceStateReader for Engine {
    async fn get(&self, device: &DeviceId) -> Result<DeviceState, DeviceError> {
        if let Some(state) = self.state.load().device(device) {
            return Ok(state.clone());
        }
        // Discovered but never reported: nothing to command yet
        if lock(&self.device_integration_map).contains_key(device) {
            return Ok(DeviceState::with_power(DevicePower::Unreachable));
        }
        Err(DeviceError::UnknownDevice(device.clone()))
    }
}

impl DeviceEvents for Engine {
    fn subscribe(&self, devices: &[DeviceId]) -> DeviceSubscription {
        lock(&self.subscribers).subscribe(devices)
    }
}

impl DeviceDirectory for Engine {
    fn contains(&self, device: &DeviceId) -> bool {
        lock(&self.device_integration_map).contains_key(device)
            || self.state.load().device(device).is_some()
    }
}

fn lock<T>(mutex: &std::sync::Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
