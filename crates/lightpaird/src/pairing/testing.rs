//! Scripted in-memory host used by the pairing tests.

use std::collections::HashMap;
use std::collections::HashSet;
use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::device::Activation;
use super::device::Color;
use super::device::DeviceCommand;
use super::device::DeviceDirectory;
use super::device::DeviceError;
use super::device::DeviceEvents;
use super::device::DeviceId;
use super::device::DevicePower;
use super::device::DeviceState;
use super::device::DeviceStateChanged;
use super::device::DeviceStateReader;
use super::device::DeviceSubscription;
use super::device::Power;

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Command {
    SetPower(DeviceId, Power),
    Activate(DeviceId, Activation),
}

impl Command {
    fn device(&self) -> &DeviceId {
        match self {
            Command::SetPower(d, _) | Command::Activate(d, _) => d,
        }
    }
}

#[derive(Default)]
struct Inner {
    states: HashMap<DeviceId, DeviceState>,
    /// Reads of these devices return the queued states first.
    scripted: HashMap<DeviceId, VecDeque<DeviceState>>,
    commands: Vec<Command>,
    failing: HashSet<DeviceId>,
    rejecting: HashSet<DeviceId>,
    subscribers: Vec<(Vec<DeviceId>, mpsc::UnboundedSender<DeviceStateChanged>)>,
}

impl Inner {
    fn notify(&mut self, device: &DeviceId) {
        let Some(state) = self.states.get(device).cloned() else {
            return;
        };
        self.subscribers.retain(|(ids, tx)| {
            if !ids.contains(device) {
                return !tx.is_closed();
            }
            tx.send(DeviceStateChanged {
                device: device.clone(),
                state: state.clone(),
            })
            .is_ok()
        });
    }
}

/// Host double. Commands are recorded and applied to the stored state.
/// Like the engine, it refuses commands to devices it sees as unreachable.
#[derive(Default)]
pub(crate) struct FakeHost {
    inner: Mutex<Inner>,
}

impl FakeHost {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn with_device(self, id: &str, power: DevicePower) -> Self {
        self.inner()
            .states
            .insert(DeviceId::from(id), DeviceState::with_power(power));
        self
    }

    /// Replace a device's state as an external change would, notifying
    /// subscribers.
    pub(crate) fn set_state(&self, id: &str, state: DeviceState) {
        let device = DeviceId::from(id);
        let mut inner = self.inner();
        inner.states.insert(device.clone(), state);
        inner.notify(&device);
    }

    pub(crate) fn script(&self, id: &str, reads: impl IntoIterator<Item = DevicePower>) {
        self.inner().scripted.insert(
            DeviceId::from(id),
            reads.into_iter().map(DeviceState::with_power).collect(),
        );
    }

    pub(crate) fn fail_commands_to(&self, id: &str) {
        self.inner().failing.insert(DeviceId::from(id));
    }

    pub(crate) fn reject_commands_to(&self, id: &str) {
        self.inner().rejecting.insert(DeviceId::from(id));
    }

    pub(crate) fn commands(&self) -> Vec<Command> {
        self.inner().commands.clone()
    }

    pub(crate) fn commands_to(&self, id: &str) -> Vec<Command> {
        let device = DeviceId::from(id);
        self.commands()
            .into_iter()
            .filter(|c| c.device() == &device)
            .collect()
    }

    pub(crate) fn subscriber_count(&self) -> usize {
        let mut inner = self.inner();
        inner.subscribers.retain(|(_, tx)| !tx.is_closed());
        inner.subscribers.len()
    }

    fn record(&self, command: Command) -> Result<(), DeviceError> {
        let mut inner = self.inner();
        let device = command.device().clone();
        if inner.failing.contains(&device) {
            return Err(DeviceError::Unreachable(device));
        }
        if inner.rejecting.contains(&device) {
            return Err(DeviceError::Rejected {
                device,
                reason: "rejected by test".to_string(),
            });
        }
        match inner.states.get(&device) {
            None => return Err(DeviceError::UnknownDevice(device)),
            Some(state) if state.power == DevicePower::Unreachable => {
                return Err(DeviceError::Unreachable(device));
            }
            Some(_) => {}
        }
        inner.commands.push(command.clone());

        if let Some(state) = inner.states.get_mut(&device) {
            match command {
                Command::SetPower(_, Power::On) => state.power = DevicePower::On,
                Command::SetPower(_, Power::Off) => state.power = DevicePower::Off,
                Command::Activate(_, activation) => {
                    state.power = DevicePower::On;
                    if let Some(brightness) = activation.brightness {
                        state.brightness = Some(brightness.absolute());
                    }
                    match activation.color {
                        Some(Color::Temperature(mireds)) => state.color_temp = Some(mireds),
                        Some(Color::Xy(xy)) => state.xy_color = Some(xy),
                        None => {}
                    }
                }
            }
        }
        inner.notify(&device);
        Ok(())
    }

    fn inner(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap()
    }
}

#[async_trait]
impl DeviceCommand for FakeHost {
    async fn set_power(&self, device: &DeviceId, power: Power) -> Result<(), DeviceError> {
        self.record(Command::SetPower(device.clone(), power))
    }

    async fn activate(
        &self,
        device: &DeviceId,
        activation: Activation,
    ) -> Result<(), DeviceError> {
        self.record(Command::Activate(device.clone(), activation))
    }
}

#[async_trait]
impl DeviceStateReader for FakeHost {
    async fn get(&self, device: &DeviceId) -> Result<DeviceState, DeviceError> {
        let mut inner = self.inner();
        if let Some(next) = inner.scripted.get_mut(device).and_then(VecDeque::pop_front) {
            // A scripted read is what the host now believes
            if let Some(state) = inner.states.get_mut(device) {
                state.power = next.power;
            }
            return Ok(next);
        }
        inner
            .states
            .get(device)
            .cloned()
            .ok_or_else(|| DeviceError::UnknownDevice(device.clone()))
    }
}

impl DeviceEvents for FakeHost {
    fn subscribe(&self, devices: &[DeviceId]) -> DeviceSubscription {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner().subscribers.push((devices.to_vec(), tx));
        rx
    }
}

impl DeviceDirectory for FakeHost {
    fn contains(&self, device: &DeviceId) -> bool {
        self.inner().states.contains_key(device)
    }
}
