//! Power sequencing for one pairing.
//!
//! Turning on powers the physical device first and then waits, polling the
//! host, until the smart device is reachable before activating it. Turning
//! off cancels any such wait.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::PoisonError;
use std::time::Duration;

use arc_swap::ArcSwap;
use serde::Serialize;
use tokio::sync::Notify;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::debug;
use tracing::info;
use tracing::warn;

use super::config::PairingConfig;
use super::config::Tunables;
use super::device::Activation;
use super::device::Brightness;
use super::device::ColorMode;
use super::device::DeviceCommand;
use super::device::DeviceError;
use super::device::DeviceId;
use super::device::DevicePower;
use super::device::DeviceState;
use super::device::DeviceStateReader;
use super::device::Power;
use super::device::SupportedFeatures;
use super::device::XyColor;
use super::device::default_color_modes;

/// How the controller waits for the smart device after powering the
/// physical one.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WaitPolicy {
    pub poll_interval: Duration,
    pub max_poll_interval: Duration,
    /// Multiplier applied to the interval after each unsuccessful poll.
    /// `1.0` polls at a fixed interval.
    pub backoff: f64,
    pub timeout: Duration,
}

impl Default for WaitPolicy {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            max_poll_interval: Duration::from_secs(5),
            backoff: 2.0,
            timeout: Duration::from_secs(60),
        }
    }
}

impl WaitPolicy {
    fn next_interval(&self, current: Duration) -> Duration {
        let factor = if self.backoff.is_finite() && self.backoff >= 1.0 {
            self.backoff
        } else {
            1.0
        };
        current.mul_f64(factor).min(self.max_poll_interval.max(self.poll_interval))
    }
}

#[derive(Debug, PartialEq, thiserror::Error)]
pub enum PairingError {
    #[error("device {device} is unreachable")]
    DeviceUnreachable {
        device: DeviceId,
        /// Set when the reachability wait ran out of time.
        timed_out: bool,
    },

    #[error(transparent)]
    Device(DeviceError),
}

impl From<DeviceError> for PairingError {
    fn from(e: DeviceError) -> Self {
        match e {
            DeviceError::Unreachable(device) => PairingError::DeviceUnreachable {
                device,
                timed_out: false,
            },
            other => PairingError::Device(other),
        }
    }
}

/// How a successful `turn_on` call ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnOnOutcome {
    /// The smart device was activated and the pairing is on.
    Activated,
    /// The physical device was seen off while waiting; nothing was activated.
    PhysicalSwitchedOff,
    /// A turn-off (or a newer turn-on) superseded this call.
    Cancelled,
}

/// State exposed by the virtual device.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PairingState {
    pub is_on: bool,
    pub brightness: Option<u8>,
    pub xy_color: Option<XyColor>,
    pub color_temp: Option<u16>,
    pub color_mode: Option<ColorMode>,
    pub supported_color_modes: BTreeSet<ColorMode>,
    pub supported_features: SupportedFeatures,
}

/// A published state together with its publication counter.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PairingSnapshot {
    pub revision: u64,
    pub state: PairingState,
}

#[derive(Debug, Default)]
struct PairingRuntimeState {
    power: Option<Power>,
    awaiting_smart_device: bool,
    /// Bumped by every turn-on wait and every turn-off. A waiter only owns
    /// the pairing while the epoch it started with is current.
    wait_epoch: u64,
    brightness: Option<u8>,
    color_temp: Option<u16>,
    xy_color: Option<XyColor>,
    color_mode: Option<ColorMode>,
    supported_color_modes: Option<BTreeSet<ColorMode>>,
    supported_features: Option<SupportedFeatures>,
    revision: u64,
}

impl PairingRuntimeState {
    fn begin_wait(&mut self) -> u64 {
        self.wait_epoch += 1;
        self.awaiting_smart_device = true;
        self.wait_epoch
    }

    fn is_current(&self, epoch: u64) -> bool {
        self.wait_epoch == epoch
    }

    fn is_waiting(&self, epoch: u64) -> bool {
        self.awaiting_smart_device && self.is_current(epoch)
    }

    fn end_wait(&mut self, epoch: u64) {
        if self.is_current(epoch) {
            self.awaiting_smart_device = false;
        }
    }

    fn cancel_wait(&mut self) {
        self.wait_epoch += 1;
        self.awaiting_smart_device = false;
    }

    fn mirror(&mut self, smart: &DeviceState) {
        self.brightness = smart.brightness;
        self.color_temp = smart.color_temp;
        self.xy_color = smart.xy_color;
        self.color_mode = smart.color_mode;
        self.supported_color_modes = smart.supported_color_modes.clone();
        self.supported_features = smart.supported_features;
    }

    fn view(&self) -> PairingState {
        PairingState {
            is_on: self.power == Some(Power::On),
            brightness: self.brightness,
            xy_color: self.xy_color,
            color_temp: self.color_temp,
            color_mode: self.color_mode,
            supported_color_modes: self
                .supported_color_modes
                .clone()
                .filter(|modes| !modes.is_empty())
                .unwrap_or_else(default_color_modes),
            supported_features: self.supported_features.unwrap_or_default(),
        }
    }
}

enum WaitResult {
    Reachable,
    PhysicalOff,
    Cancelled,
}

/// Sequencer and state mirror for one pairing.
pub struct PairingController<D> {
    config: ArcSwap<PairingConfig>,
    devices: Arc<D>,
    policy: WaitPolicy,
    runtime: Mutex<PairingRuntimeState>,
    /// Wakes reachability waiters when their wait is cancelled.
    wake: Notify,
    published: watch::Sender<PairingSnapshot>,
}

impl<D> PairingController<D>
where
    D: DeviceCommand + DeviceStateReader,
{
    pub fn new(config: PairingConfig, devices: Arc<D>, policy: WaitPolicy) -> Self {
        let runtime = PairingRuntimeState::default();
        let (published, _) = watch::channel(PairingSnapshot {
            revision: 0,
            state: runtime.view(),
        });

        Self {
            config: ArcSwap::from_pointee(config),
            devices,
            policy,
            runtime: Mutex::new(runtime),
            wake: Notify::new(),
            published,
        }
    }

    /// Current configuration snapshot.
    pub fn config(&self) -> Arc<PairingConfig> {
        self.config.load_full()
    }

    /// Replace the configuration. Operations already running keep the
    /// snapshot they started with.
    pub fn reconfigure(&self, config: PairingConfig) {
        info!(pairing = %config.id, "reconfigured");
        self.config.store(Arc::new(config));
    }

    pub fn snapshot(&self) -> PairingSnapshot {
        self.published.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<PairingSnapshot> {
        self.published.subscribe()
    }

    pub fn is_on(&self) -> bool {
        self.runtime().power == Some(Power::On)
    }

    pub fn is_awaiting_smart_device(&self) -> bool {
        self.runtime().awaiting_smart_device
    }

    /// Power the pairing on.
    ///
    /// `explicit` carries the brightness/color the caller asked for; when it
    /// is plain, the configured brightness is applied instead.
    pub async fn turn_on(&self, explicit: Activation) -> Result<TurnOnOutcome, PairingError> {
        let config = self.config.load_full();
        let tunables = config.tunables();
        info!(pairing = %config.id, ?explicit, "turning on");

        let physical = self.devices.get(&config.physical_device).await?;
        if physical.power == DevicePower::Off {
            info!(pairing = %config.id, device = %config.physical_device, "powering physical device");
            self.devices
                .set_power(&config.physical_device, Power::On)
                .await?;
        }

        let epoch = self.runtime().begin_wait();
        self.wake.notify_waiters();

        match self.wait_for_smart_device(&config, epoch).await {
            Ok(WaitResult::Reachable) => {}
            Ok(WaitResult::PhysicalOff) => {
                info!(pairing = %config.id, "physical device switched off while waiting, aborting");
                return Ok(TurnOnOutcome::PhysicalSwitchedOff);
            }
            Ok(WaitResult::Cancelled) => {
                debug!(pairing = %config.id, "turn on superseded while waiting");
                return Ok(TurnOnOutcome::Cancelled);
            }
            Err(e) => {
                self.runtime().end_wait(epoch);
                return Err(e);
            }
        }

        let activation = activation_for(explicit, tunables);
        info!(pairing = %config.id, device = %config.smart_device, ?activation, "activating smart device");
        if let Err(e) = self.devices.activate(&config.smart_device, activation).await {
            self.runtime().end_wait(epoch);
            return Err(e.into());
        }

        let mut runtime = self.runtime();
        if !runtime.is_current(epoch) {
            debug!(pairing = %config.id, "turn on superseded during activation");
            return Ok(TurnOnOutcome::Cancelled);
        }
        runtime.awaiting_smart_device = false;
        runtime.power = Some(Power::On);
        self.publish(&mut runtime);
        Ok(TurnOnOutcome::Activated)
    }

    /// Power the pairing off, cascading to the physical device when
    /// configured. Cancels any in-flight reachability wait.
    pub async fn turn_off(&self) -> Result<(), PairingError> {
        let config = self.config.load_full();
        let tunables = config.tunables();
        info!(pairing = %config.id, "turning off");

        // An unreachable smart device is already dark
        match self.devices.set_power(&config.smart_device, Power::Off).await {
            Ok(()) => {}
            Err(DeviceError::Unreachable(device)) => {
                warn!(pairing = %config.id, device = %device, "smart device unreachable, treating it as off");
            }
            Err(e) => return Err(e.into()),
        }

        if tunables.turn_off_physical_on_off {
            info!(pairing = %config.id, device = %config.physical_device, "turning off physical device");
            self.devices
                .set_power(&config.physical_device, Power::Off)
                .await?;
        }

        {
            let mut runtime = self.runtime();
            runtime.cancel_wait();
            runtime.power = Some(Power::Off);
            self.publish(&mut runtime);
        }
        self.wake.notify_waiters();

        Ok(())
    }

    /// Re-derive the pairing state from the smart device and publish it.
    pub async fn refresh_state(&self) -> Result<PairingSnapshot, PairingError> {
        let config = self.config.load_full();
        let smart = self.devices.get(&config.smart_device).await?;

        let mut runtime = self.runtime();
        if smart.power == DevicePower::On {
            runtime.power = Some(Power::On);
            runtime.mirror(&smart);
        } else {
            runtime.power = Some(Power::Off);
        }
        Ok(self.publish(&mut runtime))
    }

    async fn wait_for_smart_device(
        &self,
        config: &PairingConfig,
        epoch: u64,
    ) -> Result<WaitResult, PairingError> {
        let smart = self.devices.get(&config.smart_device).await?;
        if !self.runtime().is_waiting(epoch) {
            return Ok(WaitResult::Cancelled);
        }
        if smart.power.is_reachable() {
            self.runtime().end_wait(epoch);
            return Ok(WaitResult::Reachable);
        }

        debug!(pairing = %config.id, device = %config.smart_device, "waiting for smart device");
        let deadline = Instant::now() + self.policy.timeout;
        let mut interval = self.policy.poll_interval;

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            tokio::select! {
                _ = tokio::time::sleep(interval.min(remaining)) => {}
                _ = self.wake.notified() => {}
            }
            if !self.runtime().is_waiting(epoch) {
                return Ok(WaitResult::Cancelled);
            }

            let smart = self.devices.get(&config.smart_device).await?;
            if !self.runtime().is_waiting(epoch) {
                return Ok(WaitResult::Cancelled);
            }
            if smart.power.is_reachable() {
                self.runtime().end_wait(epoch);
                return Ok(WaitResult::Reachable);
            }

            let physical = self.devices.get(&config.physical_device).await?;
            {
                let mut runtime = self.runtime();
                if !runtime.is_waiting(epoch) {
                    return Ok(WaitResult::Cancelled);
                }
                if physical.power == DevicePower::Off {
                    runtime.end_wait(epoch);
                    return Ok(WaitResult::PhysicalOff);
                }
            }

            if Instant::now() >= deadline {
                warn!(
                    pairing = %config.id,
                    device = %config.smart_device,
                    "smart device still unreachable after {:?}",
                    self.policy.timeout
                );
                return Err(PairingError::DeviceUnreachable {
                    device: config.smart_device.clone(),
                    timed_out: true,
                });
            }

            debug!(pairing = %config.id, ?interval, "smart device still unreachable");
            interval = self.policy.next_interval(interval);
        }
    }

    fn publish(&self, runtime: &mut PairingRuntimeState) -> PairingSnapshot {
        runtime.revision += 1;
        let snapshot = PairingSnapshot {
            revision: runtime.revision,
            state: runtime.view(),
        };
        self.published.send_replace(snapshot.clone());
        snapshot
    }

    fn runtime(&self) -> MutexGuard<'_, PairingRuntimeState> {
        self.runtime.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Pick the smart device activation: explicit attributes win, then the
/// configured brightness, then plain ON.
pub fn activation_for(explicit: Activation, tunables: Tunables) -> Activation {
    if !explicit.is_plain() {
        explicit
    } else if tunables.brightness_on_switch > 0 {
        Activation::on().brightness(Brightness::Percent(tunables.brightness_on_switch))
    } else {
        Activation::on()
    }
}
