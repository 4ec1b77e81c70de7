//! Messages crossing the transport boundary.
//!
//! Split by direction:
//! - `InboundMessage`: raw MQTT messages from the transport to the engine
//! - `OutboundMessage`: encoded messages from the engine to the transport

use tokio::sync::mpsc;

/// Capacity for the transport→engine channel. Provides backpressure when the
/// broker delivers faster than the engine normalizes.
pub const INBOUND_CHANNEL_SIZE: usize = 1024;

pub type InboundSender = mpsc::Sender<InboundMessage>;
pub type InboundReceiver = mpsc::Receiver<InboundMessage>;

/// Unbounded: publishing a command must never block the issuer.
pub type OutboundSender = mpsc::UnboundedSender<OutboundMessage>;
pub type OutboundReceiver = mpsc::UnboundedReceiver<OutboundMessage>;

/// A message as received from the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Vec<u8>,
}

impl InboundMessage {
    pub fn new(topic: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
        }
    }
}

/// A message ready for the transport.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundMessage {
    pub topic: String,
    /// JSON body; `Null` is published as an empty payload
    pub payload: serde_json::Value,
}

impl OutboundMessage {
    pub fn payload_bytes(&self) -> Vec<u8> {
        match &self.payload {
            serde_json::Value::Null => Vec::new(),
            payload => payload.to_string().into_bytes(),
        }
    }
}
