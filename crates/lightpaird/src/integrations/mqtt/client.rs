//! Broker connection, kept behind a trait so the integration can run
//! against an in-memory client in tests.

use std::time::Duration;

use async_trait::async_trait;
use rumqttc::AsyncClient;
use rumqttc::Event;
use rumqttc::EventLoop;
use rumqttc::MqttOptions;
use rumqttc::Packet;
use rumqttc::QoS;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;
use tracing::info;
use tracing::warn;

use super::MqttConfig;

/// Discovery payloads for multi-endpoint devices can be large
const MAX_PACKET_BYTES: usize = 2 * 1024 * 1024;

/// Requests rumqttc queues before `subscribe`/`publish` start waiting
const REQUEST_CAPACITY: usize = 64;

const RECONNECT_DELAY: Duration = Duration::from_secs(1);

/// Everything received on our subscriptions, in broker order
pub type MessageStream = mpsc::UnboundedReceiver<MqttMessage>;

/// A publish received on one of our subscriptions
#[derive(Debug, Clone)]
pub struct MqttMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    /// Replayed from the broker's retained store
    pub retained: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("not connected to the MQTT broker")]
    NotConnected,

    #[error(transparent)]
    Request(#[from] rumqttc::ClientError),
}

/// Broker operations the integration relies on
#[async_trait]
pub trait MqttClient: Send + Sync {
    /// Open the connection. Messages for every later subscription arrive on
    /// the returned stream.
    async fn connect(&mut self) -> Result<MessageStream, ClientError>;

    async fn subscribe(&mut self, topic: &str) -> Result<(), ClientError>;

    async fn unsubscribe(&mut self, topic: &str) -> Result<(), ClientError>;

    /// Publish a device command. Commands are never retained.
    async fn publish(&mut self, topic: &str, payload: &[u8]) -> Result<(), ClientError>;
}

/// Client backed by a `rumqttc` event loop task
pub struct RumqttcClient {
    options: MqttOptions,
    connection: Option<Connection>,
}

struct Connection {
    client: AsyncClient,
    event_loop: JoinHandle<()>,
}

impl RumqttcClient {
    pub fn new(config: &MqttConfig) -> anyhow::Result<Self> {
        let mut options = MqttOptions::new(&config.client_id, &config.broker, config.port);
        options
            .set_keep_alive(Duration::from_secs(config.keep_alive_s))
            // The broker keeps our subscriptions across reconnects
            .set_clean_session(false)
            .set_max_packet_size(MAX_PACKET_BYTES, MAX_PACKET_BYTES);

        match (&config.username, &config.password) {
            (Some(username), Some(password)) => {
                options.set_credentials(username, password);
            }
            (None, None) => {}
            _ => anyhow::bail!("mqtt.username and mqtt.password must be set together"),
        }

        Ok(Self {
            options,
            connection: None,
        })
    }

    fn client(&self) -> Result<&AsyncClient, ClientError> {
        self.connection
            .as_ref()
            .map(|c| &c.client)
            .ok_or(ClientError::NotConnected)
    }
}

/// Poll the rumqttc event loop, forwarding publishes until the stream's
/// receiver goes away. rumqttc reconnects on the next poll after an error.
async fn forward_publishes(mut event_loop: EventLoop, messages: mpsc::UnboundedSender<MqttMessage>) {
    loop {
        match event_loop.poll().await {
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                let message = MqttMessage {
                    topic: publish.topic,
                    payload: publish.payload.to_vec(),
                    retained: publish.retain,
                };
                if messages.send(message).is_err() {
                    debug!("MQTT message stream dropped, stopping event loop");
                    return;
                }
            }
            Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                info!("MQTT broker accepted connection ({:?})", ack.code);
            }
            Ok(_) => {}
            Err(e) => {
                warn!("MQTT connection error, retrying in {:?}: {}", RECONNECT_DELAY, e);
                tokio::time::sleep(RECONNECT_DELAY).await;
            }
        }
    }
}

#[async_trait]
impl MqttClient for RumqttcClient {
    async fn connect(&mut self) -> Result<MessageStream, ClientError> {
        if let Some(previous) = self.connection.take() {
            previous.event_loop.abort();
        }

        let (client, event_loop) = AsyncClient::new(self.options.clone(), REQUEST_CAPACITY);
        let (tx, rx) = mpsc::unbounded_channel();
        self.connection = Some(Connection {
            client,
            event_loop: tokio::spawn(forward_publishes(event_loop, tx)),
        });
        Ok(rx)
    }

    async fn subscribe(&mut self, topic: &str) -> Result<(), ClientError> {
        self.client()?.subscribe(topic, QoS::AtMostOnce).await?;
        Ok(())
    }

    async fn unsubscribe(&mut self, topic: &str) -> Result<(), ClientError> {
        self.client()?.unsubscribe(topic).await?;
        Ok(())
    }

    async fn publish(&mut self, topic: &str, payload: &[u8]) -> Result<(), ClientError> {
        self.client()?
            .publish(topic, QoS::AtLeastOnce, false, payload.to_vec())
            .await?;
        Ok(())
    }
}

impl Drop for RumqttcClient {
    fn drop(&mut self) {
        if let Some(connection) = self.connection.take() {
            connection.event_loop.abort();
        }
    }
}

/// In-memory client recording subscriptions and publishes
#[cfg(test)]
#[derive(Debug, Default)]
pub struct MockMqttClient {
    pub subscriptions: Vec<String>,
    pub published: Vec<(String, Vec<u8>)>,
    pub is_connected: bool,
    broker: Option<mpsc::UnboundedSender<MqttMessage>>,
}

#[cfg(test)]
impl MockMqttClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deliver a message as the broker would. Returns false before
    /// `connect` or once the stream is gone.
    pub fn inject(&self, topic: &str, payload: &[u8]) -> bool {
        self.broker.as_ref().is_some_and(|broker| {
            broker
                .send(MqttMessage {
                    topic: topic.to_string(),
                    payload: payload.to_vec(),
                    retained: false,
                })
                .is_ok()
        })
    }
}

#[cfg(test)]
#[async_trait]
impl MqttClient for MockMqttClient {
    async fn connect(&mut self) -> Result<MessageStream, ClientError> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.broker = Some(tx);
        self.is_connected = true;
        Ok(rx)
    }

    async fn subscribe(&mut self, topic: &str) -> Result<(), ClientError> {
        if !self.subscriptions.iter().any(|t| t == topic) {
            self.subscriptions.push(topic.to_string());
        }
        Ok(())
    }

    async fn unsubscribe(&mut self, topic: &str) -> Result<(), ClientError> {
        self.subscriptions.retain(|t| t != topic);
        Ok(())
    }

    async fn publish(&mut self, topic: &str, payload: &[u8]) -> Result<(), ClientError> {
        self.published.push((topic.to_string(), payload.to_vec()));
        Ok(())
    }
}
