use std::error::Error;
use std::sync::Arc;

use tracing::debug;
use tracing::info;
use tracing::warn;

use super::client::MqttClient;
use crate::engine::Engine;
use crate::engine::InboundMessage;
use crate::engine::OutboundReceiver;

/// Connects an [`Engine`] to the broker.
///
/// Subscribes to the gateway's stream and answer topics, sends the discovery
/// request, then pumps broker messages into the engine and the engine's
/// outbound queue onto the broker.
pub struct MqttBridge<C: MqttClient> {
    client: C,
    engine: Arc<Engine>,
}

impl<C: MqttClient> MqttBridge<C> {
    pub fn new(client: C, engine: Arc<Engine>) -> Self {
        Self { client, engine }
    }

    /// Run until the connection's message stream ends or the engine's
    /// outbound queue is closed.
    pub async fn run(mut self, mut outbound: OutboundReceiver) -> Result<(), Box<dyn Error + Send>> {
        let mut inbound = self.client.connect().await?;

        for topic in self.engine.router().subscriptions() {
            self.client.subscribe(&topic).await?;
            info!("Subscribed to {}", topic);
        }

        if let Err(e) = self.engine.request_discovery() {
            warn!("Failed to queue discovery request: {}", e);
        }

        let to_engine = self.engine.sender();
        loop {
            tokio::select! {
                msg = inbound.recv() => {
                    let Some(msg) = msg else {
                        info!("MQTT message stream closed");
                        break;
                    };
                    debug!("Received message on topic: {}", msg.topic);
                    if to_engine
                        .send(InboundMessage::new(msg.topic, msg.payload))
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
                msg = outbound.recv() => {
                    let Some(msg) = msg else {
                        break;
                    };
                    if let Err(e) = self
                        .client
                        .publish(&msg.topic, &msg.payload_bytes(), false)
                        .await
                    {
                        warn!("Failed to publish to {}: {}", msg.topic, e);
                    }
                }
            }
        }

        Ok(())
    }
}
