use std::collections::HashMap;
use std::error::Error;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::debug;
use tracing::info;
use tracing::warn;

use super::MqttConfig;
use super::client::ClientError;
use super::client::MessageStream;
use super::client::MqttClient;
use super::client::MqttMessage;
use super::device::Component;
use super::device::MqttDevice;
use super::discovery::DiscoveryMessage;
use super::discovery::parse_discovery_topic;
use crate::engine::FromIntegrationMessage;
use crate::engine::FromIntegrationSender;
use crate::engine::Integration;
use crate::engine::ToIntegrationMessage;
use crate::pairing::device::DeviceError;
use crate::pairing::device::DeviceId;
use crate::pairing::device::DeviceState;

/// Type alias for the shared devices map
type DevicesMap = Arc<Mutex<HashMap<DeviceId, Arc<Mutex<MqttDevice>>>>>;

const INTEGRATION_NAME: &str = "mqtt";

/// MQTT Integration for lightpaird
///
/// Handles MQTT communication with Zigbee2MQTT and other devices using Home
/// Assistant style discovery. Lights and switches are supported.
pub struct MqttIntegration<C: MqttClient> {
    client: Arc<Mutex<C>>,
    config: MqttConfig,
    devices: DevicesMap,
    to_engine: Option<FromIntegrationSender>,
    /// Handle to the background message processing task
    message_task: Option<JoinHandle<()>>,
}

impl<C: MqttClient> MqttIntegration<C> {
    /// Create a new MQTT integration
    pub fn new(client: C, config: &MqttConfig) -> Self {
        Self {
            client: Arc::new(Mutex::new(client)),
            config: config.clone(),
            devices: Arc::new(Mutex::new(HashMap::new())) as DevicesMap,
            to_engine: None,
            message_task: None,
        }
    }

    fn discovery_topics(&self) -> Vec<String> {
        [Component::Light, Component::Switch]
            .iter()
            .map(|component| format!("{}/{}/+/+/config", self.config.discovery_prefix, component))
            .collect()
    }

    /// Process incoming MQTT messages in a background task
    ///
    /// This is spawned as a separate tokio task in setup() so that
    /// handle_message() can process commands concurrently.
    async fn process_messages_task(
        mut messages: MessageStream,
        client: Arc<Mutex<C>>,
        config: MqttConfig,
        devices: DevicesMap,
        to_engine: FromIntegrationSender,
    ) {
        while let Some(msg) = messages.recv().await {
            if let Err(e) =
                Self::handle_mqtt_message(&msg, &config, &client, &devices, &to_engine).await
            {
                warn!("Error handling message on '{}': {}", msg.topic, e);
            }
        }
        info!("MQTT message stream closed");
    }

    async fn handle_mqtt_message(
        msg: &MqttMessage,
        config: &MqttConfig,
        client: &Arc<Mutex<C>>,
        devices: &DevicesMap,
        to_engine: &FromIntegrationSender,
    ) -> Result<(), Box<dyn Error + Send>> {
        debug!("Received message on topic: {} (retained={})", msg.topic, msg.retained);

        if msg.topic.ends_with("/config") && msg.topic.starts_with(&config.discovery_prefix) {
            Self::handle_discovery(msg, config, client, devices, to_engine).await
        } else {
            Self::handle_state_update(msg, devices, to_engine).await
        }
    }

    /// Handle a discovery message
    async fn handle_discovery(
        msg: &MqttMessage,
        config: &MqttConfig,
        client: &Arc<Mutex<C>>,
        devices: &DevicesMap,
        to_engine: &FromIntegrationSender,
    ) -> Result<(), Box<dyn Error + Send>> {
        let (component, node_id, object_id) =
            parse_discovery_topic(&msg.topic, &config.discovery_prefix)
                .ok_or_else(|| invalid_data("Failed to parse discovery topic"))?;

        debug!(
            "Discovery: component={}, node_id={}, object_id={}",
            component, node_id, object_id
        );

        let Ok(component) = Component::from_str(&component) else {
            debug!("Ignoring unsupported component: {}", component);
            return Ok(());
        };

        let device_id = DeviceId::new(format!("{}.{}", component, node_id));

        if msg.payload.is_empty() {
            Self::remove_device(&device_id, client, devices, to_engine).await;
            return Ok(());
        }

        let discovery: DiscoveryMessage = serde_json::from_slice(&msg.payload)
            .map_err(|e| -> Box<dyn Error + Send> { Box::new(e) })?;

        let device = MqttDevice::from_discovery(discovery, component, &node_id)
            .map_err(|e| invalid_data(e.to_string()))?;

        let mut topics = vec![device.state_topic.clone()];
        topics.extend(device.availability_topics().map(str::to_string));
        info!("Discovered {} device: {} ({})", component, device.name, device.id);

        {
            let mut devices_guard = devices.lock().await;
            devices_guard.insert(device_id.clone(), Arc::new(Mutex::new(device)));
        }

        // Subscribe after map insert so the retained state message finds the
        // device already in the map, regardless of concurrency model.
        {
            let mut client_guard = client.lock().await;
            for topic in &topics {
                client_guard.subscribe(topic).await.map_err(boxed)?;
            }
        }

        Self::send_to_engine(
            FromIntegrationMessage::DeviceDiscovered {
                device: device_id,
                integration_name: INTEGRATION_NAME.to_string(),
            },
            to_engine,
        )
        .await;

        Ok(())
    }

    /// Forget a device whose discovery was retracted
    async fn remove_device(
        device_id: &DeviceId,
        client: &Arc<Mutex<C>>,
        devices: &DevicesMap,
        to_engine: &FromIntegrationSender,
    ) {
        let (removed, still_used) = {
            let mut devices_guard = devices.lock().await;
            let removed = devices_guard.remove(device_id);
            let mut still_used = Vec::new();
            for other in devices_guard.values() {
                let other = other.lock().await;
                still_used.push(other.state_topic.clone());
                still_used.extend(other.availability_topics().map(str::to_string));
            }
            (removed, still_used)
        };

        let Some(removed) = removed else {
            return;
        };
        info!("Removed device: {}", device_id);

        // A light and a switch on the same node share their topics
        let removed = removed.lock().await;
        let mut topics = vec![removed.state_topic.clone()];
        topics.extend(removed.availability_topics().map(str::to_string));
        drop(removed);

        {
            let mut client_guard = client.lock().await;
            for topic in topics.iter().filter(|t| !still_used.contains(t)) {
                if let Err(e) = client_guard.unsubscribe(topic).await {
                    warn!("Failed to unsubscribe from '{}': {}", topic, e);
                }
            }
        }

        Self::send_to_engine(
            FromIntegrationMessage::DeviceRemoved {
                device: device_id.clone(),
            },
            to_engine,
        )
        .await;
    }

    /// Handle a state or availability message
    ///
    /// Every device listening on the topic is updated. Zigbee2MQTT shares
    /// the bridge state topic between all of its devices.
    async fn handle_state_update(
        msg: &MqttMessage,
        devices: &DevicesMap,
        to_engine: &FromIntegrationSender,
    ) -> Result<(), Box<dyn Error + Send>> {
        let mut updates: Vec<(DeviceId, DeviceState)> = Vec::new();
        let mut failures = Vec::new();

        {
            let devices_guard = devices.lock().await;
            for (device_id, device_arc) in devices_guard.iter() {
                let mut device = device_arc.lock().await;

                if msg.topic == device.state_topic {
                    debug!("State update for device: {}", device_id);
                    match device.update_state(&msg.payload) {
                        Ok(()) => updates.push((device_id.clone(), device.current_state())),
                        Err(e) => failures.push(format!("{}: {}", device_id, e)),
                    }
                }

                if device.availability_topics().any(|t| t == msg.topic) {
                    match device.update_availability(&msg.topic, &msg.payload) {
                        Ok(true) => {
                            info!(
                                "Device {} is now {}",
                                device_id,
                                if device.available { "online" } else { "offline" }
                            );
                            updates.push((device_id.clone(), device.current_state()));
                        }
                        Ok(false) => {}
                        Err(e) => failures.push(format!("{}: {}", device_id, e)),
                    }
                }
            }
        }

        for (device, state) in updates {
            Self::send_to_engine(
                FromIntegrationMessage::DeviceStateChanged { device, state },
                to_engine,
            )
            .await;
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(invalid_data(failures.join("; ")))
        }
    }

    async fn send_to_engine(msg: FromIntegrationMessage, to_engine: &FromIntegrationSender) {
        if let Err(e) = to_engine.send(msg).await {
            warn!("Failed to send message to engine: {}", e);
        }
    }

    /// Publish a command to a device
    ///
    /// `payload` builds the command body from the device's discovery data.
    async fn send_device_command(
        &self,
        device_id: &DeviceId,
        payload: impl FnOnce(&MqttDevice) -> Result<Vec<u8>, Box<dyn Error>>,
    ) -> Result<(), DeviceError> {
        let device_arc = {
            let devices_guard = self.devices.lock().await;
            devices_guard
                .get(device_id)
                .ok_or_else(|| DeviceError::UnknownDevice(device_id.clone()))?
                .clone()
        };

        let (command_topic, body) = {
            let device = device_arc.lock().await;
            if !device.available {
                return Err(DeviceError::Unreachable(device_id.clone()));
            }
            let body = payload(&device).map_err(|e| DeviceError::Rejected {
                device: device_id.clone(),
                reason: e.to_string(),
            })?;
            (device.command_topic.clone(), body)
        };

        {
            let mut client = self.client.lock().await;
            client
                .publish(&command_topic, &body)
                .await
                .map_err(|e| DeviceError::Rejected {
                    device: device_id.clone(),
                    reason: e.to_string(),
                })?;
        }

        info!(
            "Sent command to {}: {}",
            device_id,
            String::from_utf8_lossy(&body)
        );
        Ok(())
    }
}

fn boxed(e: ClientError) -> Box<dyn Error + Send> {
    Box::new(e)
}

fn invalid_data(message: impl Into<String>) -> Box<dyn Error + Send> {
    Box::new(std::io::Error::new(
        std::io::ErrorKind::InvalidData,
        message.into(),
    ))
}

#[async_trait]
impl<C: MqttClient + 'static> Integration for MqttIntegration<C> {
    fn name(&self) -> &str {
        INTEGRATION_NAME
    }

    async fn setup(&mut self, tx: FromIntegrationSender) -> Result<(), Box<dyn Error + Send>> {
        // Store sender for sending events to engine
        self.to_engine = Some(tx.clone());

        // Connect to the MQTT broker
        info!(
            "Connecting to MQTT broker at {}:{}",
            self.config.broker, self.config.port
        );
        let messages = {
            let mut client = self.client.lock().await;
            client.connect().await.map_err(boxed)?
        };
        info!("Connected to MQTT broker");

        let topics = self.discovery_topics();
        info!("Subscribing to discovery topics: {}", topics.join(", "));
        {
            let mut client = self.client.lock().await;
            for topic in &topics {
                client.subscribe(topic).await.map_err(boxed)?;
            }
        }

        // Clone shared state for the background task
        let client = self.client.clone();
        let config = self.config.clone();
        let devices = self.devices.clone();

        // Spawn background task to process incoming MQTT messages
        let task = tokio::spawn(async move {
            Self::process_messages_task(messages, client, config, devices, tx).await;
        });
        self.message_task = Some(task);

        info!("MQTT integration ready to handle commands");
        Ok(())
    }

    async fn handle_message(
        &mut self,
        msg: ToIntegrationMessage,
    ) -> Result<(), Box<dyn Error + Send>> {
        let (device, result, reply) = match msg {
            ToIntegrationMessage::SetPower {
                device,
                power,
                reply,
            } => {
                info!("Handling power command for {}: {}", device, power);
                let result = self
                    .send_device_command(&device, |d| d.power_payload(power))
                    .await;
                (device, result, reply)
            }
            ToIntegrationMessage::Activate {
                device,
                activation,
                reply,
            } => {
                info!("Handling activation for {}: {:?}", device, activation);
                let result = self
                    .send_device_command(&device, |d| d.activation_payload(&activation))
                    .await;
                (device, result, reply)
            }
        };

        if let Err(e) = &result {
            warn!("Command for {} failed: {}", device, e);
        }
        if reply.send(result).is_err() {
            debug!("Caller stopped waiting for the command on {}", device);
        }
        Ok(())
    }

    async fn shutdown(&mut self) -> Result<(), Box<dyn Error + Send>> {
        info!("MQTT integration shutting down");
        if let Some(task) = self.message_task.take() {
            task.abort();
        }
        Ok(())
    }
}
