use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::PoisonError;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::sync::mpsc;
use tracing::debug;
use tracing::info;
use tracing::warn;

use super::command::Command;
use super::command::CommandEncoder;
use super::device::ChannelId;
use super::device::Device;
use super::error::CommandError;
use super::function::FunctionKey;
use super::function::Value;
use super::message::INBOUND_CHANNEL_SIZE;
use super::message::InboundReceiver;
use super::message::InboundSender;
use super::message::OutboundMessage;
use super::message::OutboundReceiver;
use super::message::OutboundSender;
use super::notifier::DeviceChanged;
use super::notifier::DeviceWatcher;
use super::notifier::Notifier;
use super::payload::Normalizer;
use super::reconciler::Reconciler;
use super::store::DeviceStore;
use super::topic::Route;
use super::topic::TopicRouter;

/// greennet engine
///
/// Wires the reconciliation pipeline: inbound messages are routed,
/// normalized and handed to the reconciler, which merges them into the
/// store and notifies observers. Commands go the other way through the
/// encoder onto the outbound queue drained by the transport.
pub struct Engine {
    router: TopicRouter,
    encoder: CommandEncoder,

    /// Holds flattened halves between messages
    normalizer: Mutex<Normalizer>,

    store: Arc<DeviceStore>,
    notifier: Notifier,
    reconciler: Reconciler,

    /// Encoded commands for the transport
    outbound_tx: OutboundSender,

    /// Receive messages from the transport
    message_rx: tokio::sync::Mutex<InboundReceiver>,

    /// Sender handed to the transport
    message_tx: InboundSender,
}

impl Engine {
    /// Create an engine for one gateway.
    ///
    /// Returns the receiving end of the outbound queue; the transport
    /// publishes whatever arrives on it.
    pub fn new(router: TopicRouter, debounce: Duration) -> (Self, OutboundReceiver) {
        let (message_tx, message_rx) = mpsc::channel(INBOUND_CHANNEL_SIZE);
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let store = Arc::new(DeviceStore::new());
        let notifier = Notifier::new();
        let reconciler = Reconciler::new(Arc::clone(&store), notifier.clone(), debounce);

        let engine = Self {
            encoder: CommandEncoder::new(router.clone()),
            router,
            normalizer: Mutex::new(Normalizer::new()),
            store,
            notifier,
            reconciler,
            outbound_tx,
            message_rx: tokio::sync::Mutex::new(message_rx),
            message_tx,
        };
        (engine, outbound_rx)
    }

    pub fn gateway_id(&self) -> &str {
        self.router.eag_id()
    }

    pub fn router(&self) -> &TopicRouter {
        &self.router
    }

    /// Sender for the transport to deliver inbound messages
    pub fn sender(&self) -> InboundSender {
        self.message_tx.clone()
    }

    /// Run the engine's inbound loop.
    ///
    /// The engine keeps a sender of its own, so this only returns when the
    /// future is dropped or the channel is closed from the receiving side.
    pub async fn run(&self) {
        info!("Engine starting for gateway {}", self.gateway_id());

        let mut rx = self.message_rx.lock().await;
        while let Some(msg) = rx.recv().await {
            self.handle_message(&msg.topic, &msg.payload);
        }

        self.shutdown();
        info!("Engine shutting down");
    }

    /// Route, normalize and enqueue one message.
    ///
    /// Never fails: unknown topics are ignored and malformed payloads are
    /// logged and skipped.
    pub fn handle_message(&self, topic: &str, payload: &[u8]) {
        let Some(route) = self.router.route(topic) else {
            return;
        };

        if let Route::Diagnostics { .. } | Route::Configuration { .. } = route {
            info!("Gateway {} answer on {}", route.kind(), topic);
            debug!("{}", String::from_utf8_lossy(payload));
            return;
        }

        let result = self.normalizer().normalize(&route, payload);
        let batches = match result {
            Ok(batches) => batches,
            Err(e) => {
                warn!("Skipping malformed {} payload on {}: {}", route.kind(), topic, e);
                return;
            }
        };

        for batch in batches {
            self.reconciler.enqueue(batch);
        }
    }

    /// Queue the discovery request for the transport.
    pub fn request_discovery(&self) -> Result<(), CommandError> {
        self.publish(self.encoder.discovery_request())
    }

    /// Encode a command for a device and queue it for the transport.
    ///
    /// `key` may be the friendly id or the hardware id.
    pub fn send_command(
        &self,
        key: &str,
        channel: ChannelId,
        command: &Command,
    ) -> Result<(), CommandError> {
        let device = self.lookup(key)?;
        let msg = self.encoder.encode(&device, channel, command)?;
        self.publish(msg)
    }

    /// Queue already-typed functions for a device.
    pub fn send_functions(
        &self,
        key: &str,
        channel: ChannelId,
        functions: &[(FunctionKey, Value)],
    ) -> Result<(), CommandError> {
        let device = self.lookup(key)?;
        let msg = self.encoder.encode_functions(&device, channel, functions);
        self.publish(msg)
    }

    /// Snapshot of one device
    pub fn device(&self, key: &str) -> Option<Device> {
        self.store.get(key)
    }

    /// Snapshot of all devices
    pub fn devices(&self) -> Vec<Device> {
        self.store.devices()
    }

    /// Devices with at least one known function
    pub fn complete_devices(&self) -> Vec<Device> {
        self.store.complete_devices()
    }

    pub fn store(&self) -> &Arc<DeviceStore> {
        &self.store
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DeviceChanged> {
        self.notifier.subscribe()
    }

    /// Follow one device by hardware id or current key.
    pub fn watch(&self, key: &str) -> DeviceWatcher {
        let device_id = self
            .store
            .hardware_id(key)
            .unwrap_or_else(|| key.to_string());
        self.notifier.watch(device_id)
    }

    /// Remove a device along with its pending updates.
    pub fn remove_device(&self, key: &str) -> Option<Device> {
        let device = self.store.remove(key)?;
        self.reconciler.forget(&device.device_id);

        let mut normalizer = self.normalizer();
        normalizer.forget_device(&device.device_id);
        if let Some(friendly_id) = &device.friendly_id {
            normalizer.forget_device(friendly_id);
        }
        Some(device)
    }

    /// Cancel pending timers and discard unflushed updates.
    pub fn shutdown(&self) {
        self.reconciler.shutdown();
    }

    fn lookup(&self, key: &str) -> Result<Device, CommandError> {
        self.store
            .get(key)
            .ok_or_else(|| CommandError::UnknownDevice(key.to_string()))
    }

    fn publish(&self, msg: OutboundMessage) -> Result<(), CommandError> {
        debug!("Queueing {} {}", msg.topic, msg.payload);
        self.outbound_tx
            .send(msg)
            .map_err(|_| CommandError::TransportUnavailable)
    }

    fn normalizer(&self) -> MutexGuard<'_, Normalizer> {
        self.normalizer.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::engine::message::InboundMessage;
    use crate::engine::topic::DEFAULT_TOPIC_BASE;

    fn engine() -> (Engine, OutboundReceiver) {
        Engine::new(
            TopicRouter::new(DEFAULT_TOPIC_BASE, "EAG1"),
            Duration::from_millis(20),
        )
    }

    fn bytes(value: serde_json::Value) -> Vec<u8> {
        serde_json::to_vec(&value).unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_message_reaches_store() {
        let (engine, _outbound) = engine();
        let mut rx = engine.subscribe();

        engine.handle_message(
            "EnOcean/EAG1/stream/device/01A02F6C",
            &bytes(json!({"friendlyId": "Flur", "states": {"switch": "on"}})),
        );
        let event = rx.recv().await.unwrap();

        assert_eq!(event.key, "Flur");
        assert_eq!(event.device_id, "01A02F6C");
        assert!(event.created);
        assert_eq!(
            engine.device("01A02F6C").unwrap().value(0, &FunctionKey::Switch),
            Some(&Value::Bool(true))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_ignored_and_malformed_messages() {
        let (engine, _outbound) = engine();

        engine.handle_message("EnOcean/OTHER/stream/devices", b"[]");
        engine.handle_message("EnOcean/EAG1/stream/device/A", b"{oops");
        engine.handle_message("EnOcean/EAG1/getAnswer/diagnostics", b"{\"uptime\": 5}");
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(engine.devices().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_command() {
        let (engine, mut outbound) = engine();
        let mut rx = engine.subscribe();

        assert_eq!(
            engine.send_command("Flur", 0, &Command::TurnOff),
            Err(CommandError::UnknownDevice("Flur".to_string()))
        );

        engine.handle_message(
            "EnOcean/EAG1/stream/devices",
            &bytes(json!([{"deviceId": "01A02F6C", "friendlyId": "Flur"}])),
        );
        rx.recv().await.unwrap();

        engine.send_command("Flur", 0, &Command::TurnOff).unwrap();
        let msg = outbound.recv().await.unwrap();
        assert_eq!(msg.topic, "EnOcean/EAG1/put/devices/01A02F6C/state");

        drop(outbound);
        assert_eq!(
            engine.send_command("Flur", 0, &Command::TurnOff),
            Err(CommandError::TransportUnavailable)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_functions() {
        let (engine, mut outbound) = engine();
        let mut rx = engine.subscribe();

        let functions = [
            (FunctionKey::Switch, Value::Bool(true)),
            (FunctionKey::Angle, Value::Percent(45)),
        ];
        assert_eq!(
            engine.send_functions("Flur", 1, &functions),
            Err(CommandError::UnknownDevice("Flur".to_string()))
        );

        engine.handle_message(
            "EnOcean/EAG1/stream/devices",
            &bytes(json!([{
                "deviceId": "01A02F6C",
                "friendlyId": "Flur",
                "eeps": [{"eep": "D2-01-12"}]
            }])),
        );
        rx.recv().await.unwrap();

        engine.send_functions("Flur", 1, &functions).unwrap();
        let msg = outbound.recv().await.unwrap();
        assert_eq!(msg.topic, "EnOcean/EAG1/put/devices/01A02F6C/state");
        assert_eq!(
            msg.payload,
            json!({"state": {"functions": [
                {"channel": 1, "key": "dimValue", "value": 100},
                {"channel": 1, "key": "angle", "value": 45}
            ]}})
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_remove_device_discards_pending() {
        let (engine, _outbound) = engine();
        let mut rx = engine.subscribe();

        engine.handle_message(
            "EnOcean/EAG1/stream/device/A",
            &bytes(json!({"states": {"switch": "on"}})),
        );
        rx.recv().await.unwrap();

        engine.handle_message("EnOcean/EAG1/stream/telegram/A/from/functions/0/key", b"switch");
        engine.handle_message(
            "EnOcean/EAG1/stream/device/A",
            &bytes(json!({"states": {"switch": "off"}})),
        );
        assert!(engine.remove_device("A").is_some());
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(engine.device("A").is_none());
        assert_eq!(engine.normalizer().pending_pairs(), 0);
    }

    #[tokio::test]
    async fn test_run_consumes_sender() {
        let (engine, _outbound) = engine();
        let engine = Arc::new(engine);
        let tx = engine.sender();
        let mut watcher = engine.watch("A");

        let runner = {
            let engine = Arc::clone(&engine);
            tokio::spawn(async move { engine.run().await })
        };

        tx.send(InboundMessage::new(
            "EnOcean/EAG1/stream/device/A",
            bytes(json!({"states": {"switch": "on"}})),
        ))
        .await
        .unwrap();

        assert_eq!(watcher.changed().await, Some("A"));
        runner.abort();
    }
}
