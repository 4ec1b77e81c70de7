use std::error::Error;

use async_trait::async_trait;
use tokio::sync::mpsc;

/// MQTT message received from a subscription
#[derive(Debug, Clone)]
pub struct MqttMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    #[allow(dead_code)]
    pub retain: bool,
}

/// Trait for MQTT client operations
///
/// This trait allows for mocking the MQTT client for testing purposes
#[async_trait]
pub trait MqttClient: Send + Sync {
    /// Connect to the MQTT broker
    ///
    /// Returns the stream of messages from subscribed topics. The stream ends
    /// when the connection is torn down for good.
    async fn connect(
        &mut self,
    ) -> Result<mpsc::UnboundedReceiver<MqttMessage>, Box<dyn Error + Send>>;

    /// Subscribe to an MQTT topic filter
    async fn subscribe(&mut self, topic: &str) -> Result<(), Box<dyn Error + Send>>;

    /// Publish a message to an MQTT topic
    async fn publish(
        &mut self,
        topic: &str,
        payload: &[u8],
        retain: bool,
    ) -> Result<(), Box<dyn Error + Send>>;
}

fn not_connected() -> Box<dyn Error + Send> {
    Box::new(std::io::Error::new(
        std::io::ErrorKind::NotConnected,
        "MQTT client not connected. Call connect() first.",
    ))
}

/// Mock MQTT client for testing
///
/// Clones share state, so a test can keep one to inspect what the bridge
/// did with the other.
#[cfg(test)]
#[derive(Debug, Clone, Default)]
pub struct MockMqttClient {
    state: std::sync::Arc<std::sync::Mutex<MockState>>,
}

#[cfg(test)]
#[derive(Debug, Default)]
struct MockState {
    queued: Vec<MqttMessage>,
    inbound: Option<mpsc::UnboundedSender<MqttMessage>>,
    subscriptions: Vec<String>,
    published: Vec<(String, Vec<u8>, bool)>,
    is_connected: bool,
}

#[cfg(test)]
#[async_trait]
impl MqttClient for MockMqttClient {
    async fn connect(
        &mut self,
    ) -> Result<mpsc::UnboundedReceiver<MqttMessage>, Box<dyn Error + Send>> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.state.lock().unwrap();
        for msg in state.queued.drain(..) {
            let _ = tx.send(msg);
        }
        state.inbound = Some(tx);
        state.is_connected = true;
        Ok(rx)
    }

    async fn subscribe(&mut self, topic: &str) -> Result<(), Box<dyn Error + Send>> {
        let mut state = self.state.lock().unwrap();
        if !state.is_connected {
            return Err(not_connected());
        }
        state.subscriptions.push(topic.to_string());
        Ok(())
    }

    async fn publish(
        &mut self,
        topic: &str,
        payload: &[u8],
        retain: bool,
    ) -> Result<(), Box<dyn Error + Send>> {
        let mut state = self.state.lock().unwrap();
        if !state.is_connected {
            return Err(not_connected());
        }
        state
            .published
            .push((topic.to_string(), payload.to_vec(), retain));
        Ok(())
    }
}

#[cfg(test)]
impl MockMqttClient {
    /// Create a new mock MQTT client
    pub fn new() -> Self {
        Self::default()
    }

    /// Deliver a message, or queue it until connect() if not yet connected
    pub fn add_message(&self, topic: &str, payload: &[u8]) {
        let msg = MqttMessage {
            topic: topic.to_string(),
            payload: payload.to_vec(),
            retain: false,
        };
        let mut state = self.state.lock().unwrap();
        match &state.inbound {
            Some(tx) => {
                let _ = tx.send(msg);
            }
            None => state.queued.push(msg),
        }
    }

    /// End the inbound stream as a lost connection would
    pub fn disconnect(&self) {
        self.state.lock().unwrap().inbound = None;
    }

    pub fn subscriptions(&self) -> Vec<String> {
        self.state.lock().unwrap().subscriptions.clone()
    }

    pub fn published(&self) -> Vec<(String, Vec<u8>, bool)> {
        self.state.lock().unwrap().published.clone()
    }
}

#[cfg(feature = "mqtt")]
pub use rumqttc_client::RumqttcClient;

#[cfg(feature = "mqtt")]
mod rumqttc_client {
    use std::error::Error;
    use std::time::Duration;

    use async_trait::async_trait;
    use rumqttc::AsyncClient;
    use rumqttc::Event;
    use rumqttc::MqttOptions;
    use rumqttc::Packet;
    use rumqttc::QoS;
    use tokio::sync::mpsc;
    use tokio::task::JoinHandle;
    use tracing::info;
    use tracing::warn;

    use super::MqttClient;
    use super::MqttMessage;
    use super::not_connected;
    use crate::config::MqttConfig;

    /// Real MQTT client implementation using rumqttc
    pub struct RumqttcClient {
        /// MQTT connection options (stored for lazy initialization)
        mqtt_options: MqttOptions,

        /// AsyncClient (created in connect())
        client: Option<AsyncClient>,

        /// Topic filters to replay after a reconnect
        subscribe_tx: Option<mpsc::UnboundedSender<String>>,

        /// Background event loop task handle
        event_loop_task: Option<JoinHandle<()>>,
    }

    impl RumqttcClient {
        /// Create a new RumqttcClient from configuration
        pub fn new(config: &MqttConfig) -> Self {
            let mut mqtt_options =
                MqttOptions::new(config.client_id(), config.broker.clone(), config.port);

            mqtt_options.set_keep_alive(config.keep_alive());

            // Bulk device snapshots of large installations exceed the default
            mqtt_options.set_max_packet_size(2 * 1024 * 1024, 2 * 1024 * 1024);

            if let (Some(username), Some(password)) = (&config.username, &config.password) {
                mqtt_options.set_credentials(username, password);
            }

            Self {
                mqtt_options,
                client: None,
                subscribe_tx: None,
                event_loop_task: None,
            }
        }
    }

    #[async_trait]
    impl MqttClient for RumqttcClient {
        async fn connect(
            &mut self,
        ) -> Result<mpsc::UnboundedReceiver<MqttMessage>, Box<dyn Error + Send>> {
            let (client, mut event_loop) = AsyncClient::new(self.mqtt_options.clone(), 64);
            let (message_tx, message_rx) = mpsc::unbounded_channel();

            // Sessions are clean, so subscriptions are replayed on every ConnAck
            let resubscribe = client.clone();
            let mut subscriptions: Vec<String> = Vec::new();
            let (subscribe_tx, mut subscribe_rx) = mpsc::unbounded_channel::<String>();

            let task = tokio::spawn(async move {
                loop {
                    while let Ok(topic) = subscribe_rx.try_recv() {
                        subscriptions.push(topic);
                    }

                    match event_loop.poll().await {
                        Ok(Event::Incoming(Packet::Publish(publish))) => {
                            let msg = MqttMessage {
                                topic: publish.topic.to_string(),
                                payload: publish.payload.to_vec(),
                                retain: publish.retain,
                            };

                            // Send to channel; if receiver dropped, exit
                            if message_tx.send(msg).is_err() {
                                break;
                            }
                        }
                        Ok(Event::Incoming(Packet::ConnAck(_))) => {
                            info!("Connected to MQTT broker");
                            for topic in &subscriptions {
                                if let Err(e) =
                                    resubscribe.try_subscribe(topic.clone(), QoS::AtLeastOnce)
                                {
                                    warn!("Failed to restore subscription {}: {}", topic, e);
                                }
                            }
                        }
                        Ok(_) => {
                            // Ignore other events (suback, puback, etc.)
                        }
                        Err(e) => {
                            warn!("MQTT event loop error: {}", e);
                            // Sleep briefly before retrying
                            tokio::time::sleep(Duration::from_secs(1)).await;
                        }
                    }
                }
                info!("MQTT event loop task exiting");
            });

            self.client = Some(client);
            self.subscribe_tx = Some(subscribe_tx);
            self.event_loop_task = Some(task);

            Ok(message_rx)
        }

        async fn subscribe(&mut self, topic: &str) -> Result<(), Box<dyn Error + Send>> {
            let client = self.client.as_ref().ok_or_else(not_connected)?;

            client
                .subscribe(topic, QoS::AtLeastOnce)
                .await
                .map_err(|e| Box::new(e) as Box<dyn Error + Send>)?;

            if let Some(tx) = &self.subscribe_tx {
                let _ = tx.send(topic.to_string());
            }

            Ok(())
        }

        async fn publish(
            &mut self,
            topic: &str,
            payload: &[u8],
            retain: bool,
        ) -> Result<(), Box<dyn Error + Send>> {
            let client = self.client.as_ref().ok_or_else(not_connected)?;

            client
                .publish(topic, QoS::AtLeastOnce, retain, payload)
                .await
                .map_err(|e| Box::new(e) as Box<dyn Error + Send>)?;

            Ok(())
        }
    }

    impl Drop for RumqttcClient {
        fn drop(&mut self) {
            if let Some(task) = self.event_loop_task.take() {
                task.abort();
            }
        }
    }
}
