//! MQTT transport for the engine.

mod bridge;
mod client;

pub use bridge::MqttBridge;
pub use client::MqttClient;
pub use client::MqttMessage;
#[cfg(feature = "mqtt")]
pub use client::RumqttcClient;
