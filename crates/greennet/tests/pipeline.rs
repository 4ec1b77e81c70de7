use std::time::Duration;

use greennet::engine::Command;
use greennet::engine::DEFAULT_DEBOUNCE;
use greennet::engine::DEFAULT_TOPIC_BASE;
use greennet::engine::Engine;
use greennet::engine::FunctionKey;
use greennet::engine::OutboundReceiver;
use greennet::engine::TopicRouter;
use greennet::engine::Value;
use serde_json::json;
use tokio::sync::broadcast::error::TryRecvError;

fn engine() -> (Engine, OutboundReceiver) {
    Engine::new(TopicRouter::new(DEFAULT_TOPIC_BASE, "EAG1"), DEFAULT_DEBOUNCE)
}

fn snapshot() -> Vec<u8> {
    json!([{
        "deviceId": "01A02F6C",
        "friendlyId": "KG_Vorrat-1K-1",
        "eeps": [{"eep": "D2-01-12"}],
        "states": {"switch": "on"}
    }])
    .to_string()
    .into_bytes()
}

#[tokio::test(start_paused = true)]
async fn test_snapshot_then_flattened_telegram_in_one_window() {
    let (engine, _outbound) = engine();
    let mut rx = engine.subscribe();

    engine.handle_message("EnOcean/EAG1/stream/devices", &snapshot());
    tokio::time::sleep(Duration::from_millis(5)).await;
    engine.handle_message(
        "EnOcean/EAG1/stream/telegram/01A02F6C/from/functions/0/key",
        b"dimValue",
    );
    tokio::time::sleep(Duration::from_millis(5)).await;
    engine.handle_message(
        "EnOcean/EAG1/stream/telegram/01A02F6C/from/functions/0/value",
        b"75",
    );

    let event = rx.recv().await.unwrap();
    assert_eq!(event.key, "KG_Vorrat-1K-1");
    assert_eq!(event.device_id, "01A02F6C");

    tokio::time::sleep(DEFAULT_DEBOUNCE * 5).await;
    assert_eq!(rx.try_recv(), Err(TryRecvError::Empty));

    let device = engine.device("KG_Vorrat-1K-1").unwrap();
    assert_eq!(device.value(0, &FunctionKey::Switch), Some(&Value::Bool(true)));
    assert_eq!(
        device.value(0, &FunctionKey::DimValue),
        Some(&Value::Percent(75))
    );
    assert_eq!(engine.devices().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_repeated_state_does_not_notify() {
    let (engine, _outbound) = engine();
    let mut rx = engine.subscribe();

    engine.handle_message("EnOcean/EAG1/stream/devices", &snapshot());
    rx.recv().await.unwrap();

    engine.handle_message("EnOcean/EAG1/stream/devices", &snapshot());
    tokio::time::sleep(DEFAULT_DEBOUNCE * 3).await;
    assert_eq!(rx.try_recv(), Err(TryRecvError::Empty));
}

#[tokio::test(start_paused = true)]
async fn test_hardware_id_then_friendly_id_is_one_device() {
    let (engine, _outbound) = engine();
    let mut rx = engine.subscribe();

    engine.handle_message(
        "EnOcean/EAG1/stream/telegram/01A02F6C",
        json!({"telegram": {"deviceId": "01A02F6C", "functions": [{"key": "switch", "value": "off"}]}})
            .to_string()
            .as_bytes(),
    );
    assert_eq!(rx.recv().await.unwrap().key, "01A02F6C");

    engine.handle_message(
        "EnOcean/EAG1/stream/device/01A02F6C",
        json!({"device": {"deviceId": "01A02F6C", "friendlyId": "KG_Vorrat-1K-1"}})
            .to_string()
            .as_bytes(),
    );
    assert_eq!(rx.recv().await.unwrap().key, "KG_Vorrat-1K-1");

    engine.handle_message(
        "EnOcean/EAG1/stream/telegram/01A02F6C",
        json!({"deviceId": "01A02F6C", "functions": [{"key": "switch", "value": "on"}]})
            .to_string()
            .as_bytes(),
    );
    assert_eq!(rx.recv().await.unwrap().key, "KG_Vorrat-1K-1");

    let devices = engine.devices();
    assert_eq!(devices.len(), 1);
    assert_eq!(devices[0].key(), "KG_Vorrat-1K-1");
    assert!(engine.store().key_of("01A02F6C").is_some());
    assert_eq!(
        devices[0].value(0, &FunctionKey::Switch),
        Some(&Value::Bool(true))
    );
}

#[tokio::test(start_paused = true)]
async fn test_outbound_telegram_never_mutates() {
    let (engine, _outbound) = engine();

    engine.handle_message(
        "EnOcean/EAG1/stream/telegram/01A02F6C/to",
        json!({"functions": [{"key": "switch", "value": "on"}]})
            .to_string()
            .as_bytes(),
    );
    engine.handle_message(
        "EnOcean/EAG1/stream/telegram/01A02F6C/to/functions/0/key",
        b"switch",
    );
    engine.handle_message(
        "EnOcean/EAG1/stream/telegram/01A02F6C/to/functions/0/value",
        b"on",
    );
    tokio::time::sleep(DEFAULT_DEBOUNCE * 3).await;

    assert!(engine.devices().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_commands_target_hardware_id() {
    let (engine, mut outbound) = engine();
    let mut rx = engine.subscribe();

    engine.handle_message("EnOcean/EAG1/stream/devices", &snapshot());
    engine.handle_message(
        "EnOcean/EAG1/stream/devices",
        json!({"devices": [{"deviceId": "0510B2C4", "eeps": [{"eep": "D2-01-00"}]}]})
            .to_string()
            .as_bytes(),
    );
    rx.recv().await.unwrap();
    rx.recv().await.unwrap();

    engine
        .send_command("KG_Vorrat-1K-1", 0, &Command::TurnOn { brightness: None })
        .unwrap();
    engine
        .send_command("0510B2C4", 0, &Command::TurnOn { brightness: None })
        .unwrap();

    let dimmer = outbound.recv().await.unwrap();
    assert_eq!(dimmer.topic, "EnOcean/EAG1/put/devices/01A02F6C/state");
    assert_eq!(
        dimmer.payload,
        json!({"state": {"functions": [{"key": "dimValue", "value": 100}]}})
    );

    let switch = outbound.recv().await.unwrap();
    assert_eq!(switch.topic, "EnOcean/EAG1/put/devices/0510B2C4/state");
    assert_eq!(
        switch.payload,
        json!({"state": {"functions": [{"key": "switch", "value": "on"}]}})
    );
}

#[tokio::test(start_paused = true)]
async fn test_watcher_follows_device_across_rekey() {
    let (engine, _outbound) = engine();

    engine.handle_message(
        "EnOcean/EAG1/stream/device/01A02F6C",
        json!({"states": {"switch": "on"}}).to_string().as_bytes(),
    );
    let mut watcher = engine.watch("01A02F6C");
    assert_eq!(watcher.changed().await, Some("01A02F6C"));

    engine.handle_message(
        "EnOcean/EAG1/getAnswer/devices/01A02F6C",
        json!({"friendlyId": "Flur"}).to_string().as_bytes(),
    );
    assert_eq!(watcher.changed().await, Some("Flur"));
}
