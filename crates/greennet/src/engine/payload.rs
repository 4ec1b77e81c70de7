//! Payload normalization.
//!
//! The gateway describes the same state in several shapes: JSON device
//! documents with a `functions` list (or a single function object), boot-time
//! `states` maps, wrapped `{"telegram": ...}` / `{"device": ...}` envelopes,
//! and flattened topics carrying one scalar per message. [`Normalizer`]
//! resolves each message into a [`Payload`] once and turns it into
//! [`DeviceBatch`]es of `(channel, key, value)` updates. Nothing past this
//! module looks at raw payload shapes.

use std::collections::HashMap;

use serde::Deserialize;
use tracing::debug;
use tracing::warn;

use super::device::ChannelId;
use super::device::DEFAULT_CHANNEL;
use super::device::DeviceInfo;
use super::error::PayloadError;
use super::error::ValueError;
use super::function::FunctionKey;
use super::function::Value;
use super::function::parse_channel;
use super::topic::Direction;
use super::topic::Route;

/// One coerced function update.
#[derive(Debug, Clone, PartialEq)]
pub struct FunctionUpdate {
    pub channel: ChannelId,
    pub key: FunctionKey,
    pub value: Value,
}

/// Everything one message says about one device.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeviceBatch {
    /// Id the message names the device by. Usually the hardware id; may be
    /// the friendly id when the gateway uses it in a topic.
    pub device_id: String,
    pub friendly_id: Option<String>,
    pub info: DeviceInfo,
    pub source_timestamp: Option<String>,
    pub functions: Vec<FunctionUpdate>,
}

impl DeviceBatch {
    fn new(device_id: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.friendly_id.is_none() && self.info.is_empty() && self.functions.is_empty()
    }
}

/// Payload shape, resolved once per message.
#[derive(Debug, Clone, PartialEq)]
enum Payload {
    /// JSON document published at a base topic
    Document(serde_json::Value),
    /// Single scalar published under a flattened path
    Leaf {
        path: Vec<String>,
        value: serde_json::Value,
    },
}

impl Payload {
    fn parse(path: &[String], bytes: &[u8]) -> Result<Self, PayloadError> {
        if path.is_empty() {
            return Ok(Payload::Document(serde_json::from_slice(bytes)?));
        }

        let text = std::str::from_utf8(bytes)?.trim();
        // Leaves are usually bare strings ("on"), sometimes JSON scalars ("75", "\"on\"")
        let value = match serde_json::from_str::<serde_json::Value>(text) {
            Ok(v) if !v.is_object() && !v.is_array() => v,
            _ => serde_json::Value::String(text.to_string()),
        };

        Ok(Payload::Leaf {
            path: path.to_vec(),
            value,
        })
    }
}

#[derive(Debug, Deserialize)]
struct RawFunction {
    key: Option<String>,
    #[serde(default)]
    value: serde_json::Value,
    #[serde(default)]
    channel: Option<serde_json::Value>,
}

/// `functions` is sometimes a list and sometimes a single object.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum FunctionList {
    Many(Vec<RawFunction>),
    One(RawFunction),
}

impl FunctionList {
    fn into_vec(self) -> Vec<RawFunction> {
        match self {
            FunctionList::Many(v) => v,
            FunctionList::One(f) => vec![f],
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct TelegramInfo {
    #[serde(default)]
    dbm: Option<serde_json::Value>,
}

/// A device, delta or telegram document after envelope unwrapping.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Document {
    #[serde(default)]
    device_id: Option<String>,
    #[serde(default)]
    friendly_id: Option<String>,
    #[serde(default)]
    direction: Option<String>,
    #[serde(default)]
    timestamp: Option<serde_json::Value>,
    #[serde(default)]
    telegram_info: Option<TelegramInfo>,
    #[serde(default)]
    functions: Option<FunctionList>,
    #[serde(default)]
    states: Option<serde_json::Map<String, serde_json::Value>>,
    #[serde(flatten)]
    info: DeviceInfo,
}

/// Which stream a flattened leaf arrived on. Function indices are only
/// meaningful within one stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum LeafSource {
    Devices,
    Delta,
    Telegram,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct PairKey {
    device_id: String,
    source: LeafSource,
    index: usize,
}

/// One half-received flattened function.
#[derive(Debug, Default)]
struct PartialFunction {
    key: Option<String>,
    value: Option<serde_json::Value>,
    channel: Option<serde_json::Value>,
}

/// Converts routed payloads into device batches.
///
/// Holds the halves of flattened functions until both the key and the value
/// for an index have been seen. Incomplete halves are kept until the device
/// is forgotten.
#[derive(Debug, Default)]
pub struct Normalizer {
    pending: HashMap<PairKey, PartialFunction>,
    /// Channel selected by the last completed flattened `channel` function
    selected_channel: HashMap<(String, LeafSource), ChannelId>,
}

impl Normalizer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Normalize one message.
    ///
    /// Returns an error only when the message as a whole is unusable. Single
    /// functions with bad values are logged and skipped.
    pub fn normalize(
        &mut self,
        route: &Route,
        payload: &[u8],
    ) -> Result<Vec<DeviceBatch>, PayloadError> {
        match route {
            Route::BulkDevices { path } | Route::DiscoveryAnswer { path } => {
                match path.split_first() {
                    None => Ok(bulk_batches(Payload::parse(path, payload)?)),
                    Some((device_id, leaf)) => {
                        self.device_message(device_id, leaf, payload, LeafSource::Devices)
                    }
                }
            }
            Route::DeviceDelta { device_id, path } => {
                self.device_message(device_id, path, payload, LeafSource::Delta)
            }
            Route::Telegram {
                device_id,
                direction,
                path,
            } => {
                if *direction == Some(Direction::To) {
                    debug!("Discarding command echo telegram for {}", device_id);
                    return Ok(Vec::new());
                }
                self.device_message(device_id, path, payload, LeafSource::Telegram)
            }
            Route::Diagnostics { .. } | Route::Configuration { .. } => Ok(Vec::new()),
        }
    }

    /// Drop incomplete flattened functions for a device.
    pub fn forget_device(&mut self, device_id: &str) {
        self.pending.retain(|k, _| k.device_id != device_id);
        self.selected_channel.retain(|(id, _), _| id != device_id);
    }

    /// Number of flattened functions still waiting for their other half
    pub fn pending_pairs(&self) -> usize {
        self.pending.len()
    }

    fn device_message(
        &mut self,
        device_id: &str,
        path: &[String],
        payload: &[u8],
        source: LeafSource,
    ) -> Result<Vec<DeviceBatch>, PayloadError> {
        let batch = match Payload::parse(path, payload)? {
            Payload::Document(value) => {
                let envelope = if source == LeafSource::Telegram {
                    "telegram"
                } else {
                    "device"
                };
                let document: Document = serde_json::from_value(unwrap_envelope(value, envelope))?;

                if source == LeafSource::Telegram && is_outbound(&document) {
                    debug!("Discarding command echo telegram for {}", device_id);
                    return Ok(Vec::new());
                }
                document_batch(document, Some(device_id)).ok_or(PayloadError::MissingDeviceId)?
            }
            Payload::Leaf { path, value } => self.leaf_batch(device_id, &path, value, source),
        };

        Ok(if batch.is_empty() { Vec::new() } else { vec![batch] })
    }

    fn leaf_batch(
        &mut self,
        device_id: &str,
        path: &[String],
        value: serde_json::Value,
        source: LeafSource,
    ) -> DeviceBatch {
        let mut batch = DeviceBatch::new(device_id);
        let segments: Vec<&str> = path.iter().map(String::as_str).collect();

        match segments.as_slice() {
            ["functions", index, half] => {
                let Ok(index) = index.parse::<usize>() else {
                    debug!("Ignoring leaf with bad function index: {}", path.join("/"));
                    return batch;
                };
                if let Some(update) = self.accept_half(device_id, source, index, half, value) {
                    batch.functions.push(update);
                }
            }
            ["states", key] => {
                let (channel, key) = split_channel_prefix(key);
                push_coerced(&mut batch, device_id, channel.unwrap_or(DEFAULT_CHANNEL), key, &value);
            }
            ["states", channel, key] => match channel.parse::<ChannelId>() {
                Ok(channel) => push_coerced(&mut batch, device_id, channel, key, &value),
                Err(_) => warn!(
                    "Skipping state for {}: {}",
                    device_id,
                    ValueError::Channel(channel.to_string())
                ),
            },
            ["friendlyId"] => batch.friendly_id = value.as_str().and_then(|f| friendly(f, device_id)),
            ["timestamp"] => {
                batch.source_timestamp = scalar_string(&value);
                batch.info.last_seen = batch.source_timestamp.clone();
            }
            ["telegramInfo", "dbm"] => {
                batch.info = info_from_leaf("dbm", value);
            }
            [field] => {
                batch.info = info_from_leaf(field, value);
                if batch.info.is_empty() {
                    debug!("Ignoring leaf {} for {}", field, device_id);
                }
            }
            _ => debug!("Ignoring leaf {} for {}", path.join("/"), device_id),
        }

        batch
    }

    /// Record one half of a flattened function; returns the update once both
    /// the key and the value for this index are known.
    fn accept_half(
        &mut self,
        device_id: &str,
        source: LeafSource,
        index: usize,
        half: &str,
        value: serde_json::Value,
    ) -> Option<FunctionUpdate> {
        let pair_key = PairKey {
            device_id: device_id.to_string(),
            source,
            index,
        };

        let partial = self.pending.entry(pair_key.clone()).or_default();
        match half {
            "key" => partial.key = scalar_string(&value),
            "value" => partial.value = Some(value),
            "channel" => {
                partial.channel = Some(value);
                return None;
            }
            _ => {
                debug!("Ignoring function leaf {} for {}", half, device_id);
                return None;
            }
        }

        if partial.key.is_none() || partial.value.is_none() {
            return None;
        }

        let PartialFunction {
            key,
            value,
            channel,
        } = self.pending.remove(&pair_key)?;
        let key = FunctionKey::parse(&key?);
        let value = value?;
        let selected = (device_id.to_string(), source);

        if key == FunctionKey::Channel {
            match to_channel(&value) {
                Ok(channel) => {
                    self.selected_channel.insert(selected, channel);
                }
                Err(e) => warn!("Skipping channel selector for {}: {}", device_id, e),
            }
            return None;
        }

        let channel = match channel {
            Some(raw) => to_channel(&raw),
            None => Ok(self
                .selected_channel
                .get(&selected)
                .copied()
                .unwrap_or(DEFAULT_CHANNEL)),
        };

        match channel.and_then(|channel| {
            key.coerce(&value).map(|value| FunctionUpdate {
                channel,
                key: key.clone(),
                value,
            })
        }) {
            Ok(update) => Some(update),
            Err(e) => {
                warn!("Skipping function for {}: {}", device_id, e);
                None
            }
        }
    }
}

/// Batches from a bulk snapshot: a list of devices, a `{"devices": [...]}`
/// wrapper, a single device, or a mapping from device id to device.
fn bulk_batches(payload: Payload) -> Vec<DeviceBatch> {
    let Payload::Document(value) = payload else {
        return Vec::new();
    };

    let mut entries: Vec<(Option<String>, serde_json::Value)> = Vec::new();
    collect_bulk_entries(value, None, &mut entries);

    entries
        .into_iter()
        .filter_map(|(hint, value)| {
            let document: Document = match serde_json::from_value(unwrap_envelope(value, "device")) {
                Ok(d) => d,
                Err(e) => {
                    warn!("Skipping malformed device in snapshot: {}", e);
                    return None;
                }
            };
            let batch = document_batch(document, hint.as_deref());
            if batch.is_none() {
                warn!("Skipping device without deviceId in snapshot");
            }
            batch
        })
        .filter(|b| !b.is_empty())
        .collect()
}

fn collect_bulk_entries(
    value: serde_json::Value,
    hint: Option<String>,
    out: &mut Vec<(Option<String>, serde_json::Value)>,
) {
    match value {
        serde_json::Value::Array(items) => {
            for item in items {
                collect_bulk_entries(item, None, out);
            }
        }
        serde_json::Value::Object(mut map) => {
            if let Some(devices) = map.remove("devices") {
                collect_bulk_entries(devices, None, out);
            } else if ["deviceId", "device", "functions", "states"]
                .iter()
                .any(|k| map.contains_key(*k))
            {
                out.push((hint, serde_json::Value::Object(map)));
            } else {
                for (device_id, device) in map {
                    if device.is_object() {
                        out.push((Some(device_id), device));
                    }
                }
            }
        }
        other => debug!("Ignoring unrecognized snapshot entry: {}", other),
    }
}

/// Replace `{"<name>": {...}, ...}` by the inner object, keeping outer keys
/// the inner object does not have.
fn unwrap_envelope(value: serde_json::Value, name: &str) -> serde_json::Value {
    let serde_json::Value::Object(mut outer) = value else {
        return value;
    };
    match outer.remove(name) {
        Some(serde_json::Value::Object(mut inner)) => {
            for (k, v) in outer {
                inner.entry(k).or_insert(v);
            }
            serde_json::Value::Object(inner)
        }
        Some(other) => {
            outer.insert(name.to_string(), other);
            serde_json::Value::Object(outer)
        }
        None => serde_json::Value::Object(outer),
    }
}

fn is_outbound(document: &Document) -> bool {
    document
        .direction
        .as_deref()
        .and_then(|d| d.parse::<Direction>().ok())
        == Some(Direction::To)
}

fn document_batch(document: Document, fallback_id: Option<&str>) -> Option<DeviceBatch> {
    let device_id = document
        .device_id
        .filter(|id| !id.is_empty())
        .or_else(|| fallback_id.map(str::to_string))?;

    let mut batch = DeviceBatch::new(device_id.clone());
    batch.friendly_id = document
        .friendly_id
        .as_deref()
        .and_then(|f| friendly(f, &device_id));
    batch.info = document.info;
    batch.source_timestamp = document.timestamp.as_ref().and_then(scalar_string);
    if batch.source_timestamp.is_some() {
        batch.info.last_seen = batch.source_timestamp.clone();
    }
    if let Some(dbm) = document.telegram_info.and_then(|t| t.dbm) {
        let telegram_info = info_from_leaf("dbm", dbm);
        batch.info.dbm = telegram_info.dbm.or(batch.info.dbm);
    }

    let functions = document.functions.map(FunctionList::into_vec).unwrap_or_default();

    // A `channel` function selects the channel for its siblings
    let mut selected = DEFAULT_CHANNEL;
    for f in &functions {
        if f.key.as_deref().map(FunctionKey::parse) == Some(FunctionKey::Channel) {
            match to_channel(&f.value) {
                Ok(channel) => selected = channel,
                Err(e) => warn!("Ignoring channel selector for {}: {}", device_id, e),
            }
        }
    }

    for f in functions {
        let Some(key) = f.key else {
            debug!("Skipping function without key for {}", device_id);
            continue;
        };
        let key = FunctionKey::parse(&key);
        if key == FunctionKey::Channel {
            continue;
        }
        let channel = match f.channel.as_ref().map(to_channel) {
            Some(Ok(channel)) => channel,
            Some(Err(e)) => {
                warn!("Skipping function {} for {}: {}", key, device_id, e);
                continue;
            }
            None => selected,
        };
        match key.coerce(&f.value) {
            Ok(value) => batch.functions.push(FunctionUpdate {
                channel,
                key,
                value,
            }),
            Err(e) => warn!("Skipping function for {}: {}", device_id, e),
        }
    }

    for (raw_key, value) in document.states.unwrap_or_default() {
        let (channel, key) = split_channel_prefix(&raw_key);
        push_coerced(&mut batch, &device_id, channel.unwrap_or(DEFAULT_CHANNEL), key, &value);
    }

    Some(batch)
}

fn push_coerced(
    batch: &mut DeviceBatch,
    device_id: &str,
    channel: ChannelId,
    key: &str,
    raw: &serde_json::Value,
) {
    let key = FunctionKey::parse(key);
    if key == FunctionKey::Channel {
        return;
    }
    match key.coerce(raw) {
        Ok(value) => batch.functions.push(FunctionUpdate {
            channel,
            key,
            value,
        }),
        Err(e) => warn!("Skipping state for {}: {}", device_id, e),
    }
}

/// `"1/switch"` names channel 1; anything else is channel-less.
fn split_channel_prefix(key: &str) -> (Option<ChannelId>, &str) {
    match key.split_once('/') {
        Some((prefix, rest)) if !rest.is_empty() => match prefix.parse::<ChannelId>() {
            Ok(channel) => (Some(channel), rest),
            Err(_) => (None, key),
        },
        _ => (None, key),
    }
}

fn to_channel(raw: &serde_json::Value) -> Result<ChannelId, ValueError> {
    parse_channel(raw)
        .and_then(|c| ChannelId::try_from(c).ok())
        .ok_or_else(|| ValueError::Channel(raw.to_string()))
}

fn friendly(friendly_id: &str, device_id: &str) -> Option<String> {
    (!friendly_id.is_empty() && friendly_id != device_id).then(|| friendly_id.to_string())
}

fn scalar_string(value: &serde_json::Value) -> Option<String> {
    match value {
        serde_json::Value::String(s) if !s.is_empty() => Some(s.clone()),
        serde_json::Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn info_from_leaf(field: &str, value: serde_json::Value) -> DeviceInfo {
    let mut object = serde_json::Map::new();
    object.insert(field.to_string(), value);
    serde_json::from_value(serde_json::Value::Object(object)).unwrap_or_default()
}
