//! The authoritative in-memory device map.
//!
//! Devices are keyed by their friendly id when one is known, else by their
//! hardware id. A `hardware id -> key` alias table retargets every later
//! write addressed by hardware id, so a device never has a shadow entry.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::PoisonError;

use tracing::debug;
use tracing::info;

use super::device::ChannelId;
use super::device::Device;
use super::device::DeviceInfo;
use super::device::FunctionState;
use super::error::StoreError;
use super::function::FunctionKey;
use super::function::Value;

/// Outcome of a single merge.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeResult {
    /// The device did not exist before this merge
    pub created: bool,
    /// Anything observable changed: value, metadata or identity
    pub changed: bool,
}

impl MergeResult {
    pub fn absorb(&mut self, other: MergeResult) {
        self.created |= other.created;
        self.changed |= other.changed;
    }
}

#[derive(Debug, Default)]
struct Inner {
    /// Canonical key -> device
    devices: HashMap<String, Device>,
    /// Hardware id -> canonical key
    aliases: HashMap<String, String>,
    /// Arrival counter for last-write-wins
    seq: u64,
}

impl Inner {
    /// Canonical key for a hardware id or a friendly id.
    fn resolve(&self, id: &str) -> Option<String> {
        if let Some(key) = self.aliases.get(id) {
            return Some(key.clone());
        }
        self.devices.contains_key(id).then(|| id.to_string())
    }

    fn next_seq(&mut self) -> u64 {
        self.seq += 1;
        self.seq
    }

    /// Find or create the device for `id`, applying a friendly id if given.
    ///
    /// Returns the device and whether it was created and whether it was
    /// re-keyed.
    fn entry(&mut self, id: &str, friendly_id: Option<&str>) -> (&mut Device, bool, bool) {
        let (key, created) = match self.resolve(id) {
            Some(key) => (key, false),
            None => {
                info!("New device: {}", id);
                self.aliases.insert(id.to_string(), id.to_string());
                (id.to_string(), true)
            }
        };

        let Some(friendly_id) = friendly_id.filter(|f| !f.is_empty() && *f != key) else {
            let device = self
                .devices
                .entry(key)
                .or_insert_with(|| Device::new(id));
            return (device, created, false);
        };

        let mut device = self
            .devices
            .remove(&key)
            .unwrap_or_else(|| Device::new(id));
        info!(
            "Device {} is now known as {} (was {})",
            device.device_id, friendly_id, key
        );
        device.friendly_id = Some(friendly_id.to_string());

        // An entry created earlier under the friendly id is folded in
        if let Some(shadow) = self.devices.remove(friendly_id) {
            debug!("Folding entry {} into {}", friendly_id, device.device_id);
            if shadow.device_id != device.device_id {
                self.aliases.remove(&shadow.device_id);
            }
            fold(&mut device, shadow);
        }

        self.aliases
            .insert(device.device_id.clone(), friendly_id.to_string());
        let device = self
            .devices
            .entry(friendly_id.to_string())
            .or_insert(device);
        (device, created, true)
    }
}

/// Merge `shadow` into `device`. For each `(channel, key)` the later write
/// wins; metadata already on `device` wins.
fn fold(device: &mut Device, shadow: Device) {
    for (channel_id, channel) in shadow.channels {
        let target = device.channels.entry(channel_id).or_default();
        for (key, state) in channel.functions {
            match target.functions.get(&key) {
                Some(existing) if existing.seq >= state.seq => {}
                _ => {
                    target.functions.insert(key, state);
                }
            }
        }
    }

    let mut info = shadow.info;
    info.merge(std::mem::take(&mut device.info));
    device.info = info;
}

/// Thread-safe device/channel store.
///
/// One coarse lock guards the whole map; every operation holds it only for
/// the duration of a map update.
#[derive(Debug, Default)]
pub struct DeviceStore {
    inner: Mutex<Inner>,
}

impl DeviceStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Merge one function value.
    ///
    /// Last write wins per `(channel, key)` in call order; `source_timestamp`
    /// is recorded but never compared.
    pub fn merge(
        &self,
        device_id: &str,
        friendly_id: Option<&str>,
        channel: ChannelId,
        key: FunctionKey,
        value: Value,
        source_timestamp: Option<&str>,
    ) -> Result<MergeResult, StoreError> {
        if device_id.is_empty() {
            return Err(StoreError::EmptyDeviceId);
        }

        let mut inner = self.lock();
        let seq = inner.next_seq();
        let (device, created, rekeyed) = inner.entry(device_id, friendly_id);

        let functions = &mut device.channels.entry(channel).or_default().functions;
        let changed = match functions.get_mut(&key) {
            Some(state) => {
                let changed = state.value != value;
                state.value = value;
                state.source_timestamp = source_timestamp.map(str::to_string);
                state.seq = seq;
                changed
            }
            None => {
                functions.insert(
                    key,
                    FunctionState {
                        value,
                        source_timestamp: source_timestamp.map(str::to_string),
                        seq,
                    },
                );
                true
            }
        };

        Ok(MergeResult {
            created,
            changed: created || rekeyed || changed,
        })
    }

    /// Merge identity and metadata. Fields absent from `info` are kept.
    pub fn merge_info(
        &self,
        device_id: &str,
        friendly_id: Option<&str>,
        info: DeviceInfo,
    ) -> Result<MergeResult, StoreError> {
        if device_id.is_empty() {
            return Err(StoreError::EmptyDeviceId);
        }

        let mut inner = self.lock();
        let (device, created, rekeyed) = inner.entry(device_id, friendly_id);
        let changed = device.info.merge(info);

        Ok(MergeResult {
            created,
            changed: created || rekeyed || changed,
        })
    }

    /// Canonical key for a hardware id or friendly id.
    pub fn key_of(&self, id: &str) -> Option<String> {
        self.lock().resolve(id)
    }

    /// Hardware id for a hardware id or friendly id.
    pub fn hardware_id(&self, id: &str) -> Option<String> {
        let inner = self.lock();
        let key = inner.resolve(id)?;
        inner.devices.get(&key).map(|d| d.device_id.clone())
    }

    /// Snapshot of one device, looked up by either id.
    pub fn get(&self, id: &str) -> Option<Device> {
        let inner = self.lock();
        let key = inner.resolve(id)?;
        inner.devices.get(&key).cloned()
    }

    /// Snapshot of all devices, ordered by key.
    pub fn devices(&self) -> Vec<Device> {
        let mut devices: Vec<Device> = self.lock().devices.values().cloned().collect();
        devices.sort_by(|a, b| a.key().cmp(b.key()));
        devices
    }

    /// Devices with at least one function on at least one channel.
    pub fn complete_devices(&self) -> Vec<Device> {
        self.devices()
            .into_iter()
            .filter(Device::is_complete)
            .collect()
    }

    /// Remove a device and its alias.
    pub fn remove(&self, id: &str) -> Option<Device> {
        let mut inner = self.lock();
        let key = inner.resolve(id)?;
        let device = inner.devices.remove(&key)?;
        inner.aliases.remove(&device.device_id);
        info!("Removed device {} ({})", key, device.device_id);
        Some(device)
    }

    pub fn len(&self) -> usize {
        self.lock().devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn on() -> Value {
        Value::Bool(true)
    }

    #[test]
    fn test_merge_creates_and_reports_changes() {
        let store = DeviceStore::new();

        let first = store
            .merge("01A02F6C", None, 0, FunctionKey::Switch, on(), None)
            .unwrap();
        assert_eq!(
            first,
            MergeResult {
                created: true,
                changed: true
            }
        );

        let again = store
            .merge("01A02F6C", None, 0, FunctionKey::Switch, on(), Some("t2"))
            .unwrap();
        assert_eq!(again, MergeResult::default());

        let other = store
            .merge("01A02F6C", None, 0, FunctionKey::Switch, Value::Bool(false), None)
            .unwrap();
        assert!(other.changed);
        assert!(!other.created);
    }

    #[test]
    fn test_equality_is_type_aware() {
        let store = DeviceStore::new();
        store
            .merge("A", None, 0, FunctionKey::parse("mode"), Value::Raw("1".into()), None)
            .unwrap();
        let result = store
            .merge("A", None, 0, FunctionKey::parse("mode"), Value::Raw(1.into()), None)
            .unwrap();
        assert!(result.changed);
    }

    #[test]
    fn test_last_write_wins_by_arrival() {
        let store = DeviceStore::new();
        store
            .merge("A", None, 0, FunctionKey::DimValue, Value::Percent(10), Some("2024-05-02"))
            .unwrap();
        store
            .merge("A", None, 0, FunctionKey::DimValue, Value::Percent(20), Some("2024-05-01"))
            .unwrap();

        let device = store.get("A").unwrap();
        assert_eq!(device.value(0, &FunctionKey::DimValue), Some(&Value::Percent(20)));
        assert_eq!(
            device
                .function(0, &FunctionKey::DimValue)
                .unwrap()
                .source_timestamp
                .as_deref(),
            Some("2024-05-01")
        );
    }

    #[test]
    fn test_rekey_to_friendly_id_leaves_no_shadow() {
        let store = DeviceStore::new();
        store
            .merge("01A02F6C", None, 0, FunctionKey::Switch, on(), None)
            .unwrap();

        let rekey = store
            .merge_info("01A02F6C", Some("KG_Vorrat-1K-1"), DeviceInfo::default())
            .unwrap();
        assert!(rekey.changed);
        assert!(!rekey.created);

        // Later writes by hardware id land on the friendly entry
        store
            .merge("01A02F6C", None, 0, FunctionKey::DimValue, Value::Percent(75), None)
            .unwrap();

        assert_eq!(store.len(), 1);
        assert_eq!(store.key_of("01A02F6C").as_deref(), Some("KG_Vorrat-1K-1"));
        let device = store.get("KG_Vorrat-1K-1").unwrap();
        assert_eq!(device.device_id, "01A02F6C");
        assert_eq!(device.value(0, &FunctionKey::Switch), Some(&on()));
        assert_eq!(device.value(0, &FunctionKey::DimValue), Some(&Value::Percent(75)));
        assert_eq!(store.devices()[0].key(), "KG_Vorrat-1K-1");
    }

    #[test]
    fn test_friendly_id_change_moves_entry() {
        let store = DeviceStore::new();
        store.merge_info("A", Some("Old"), DeviceInfo::default()).unwrap();
        store.merge_info("A", Some("New"), DeviceInfo::default()).unwrap();

        assert_eq!(store.len(), 1);
        assert!(store.get("Old").is_none());
        assert_eq!(store.hardware_id("New").as_deref(), Some("A"));
    }

    #[test]
    fn test_shadow_entry_is_folded_by_arrival() {
        let store = DeviceStore::new();
        // Device first addressed by its friendly id
        store
            .merge("Flur", None, 0, FunctionKey::Switch, on(), None)
            .unwrap();
        store
            .merge("A", None, 0, FunctionKey::Switch, Value::Bool(false), None)
            .unwrap();
        store
            .merge("Flur", None, 1, FunctionKey::Switch, on(), None)
            .unwrap();

        store.merge_info("A", Some("Flur"), DeviceInfo::default()).unwrap();

        assert_eq!(store.len(), 1);
        let device = store.get("A").unwrap();
        assert_eq!(device.key(), "Flur");
        assert_eq!(device.value(0, &FunctionKey::Switch), Some(&Value::Bool(false)));
        assert_eq!(device.value(1, &FunctionKey::Switch), Some(&on()));
    }

    #[test]
    fn test_merge_info_keeps_absent_fields() {
        let store = DeviceStore::new();
        store
            .merge_info(
                "A",
                None,
                DeviceInfo {
                    manufacturer: Some("OPUS".to_string()),
                    ..Default::default()
                },
            )
            .unwrap();
        let result = store
            .merge_info(
                "A",
                None,
                DeviceInfo {
                    manufacturer: Some("OPUS".to_string()),
                    ..Default::default()
                },
            )
            .unwrap();
        assert!(!result.changed);
        assert_eq!(store.get("A").unwrap().info.manufacturer.as_deref(), Some("OPUS"));
    }

    #[test]
    fn test_empty_device_id_is_rejected() {
        let store = DeviceStore::new();
        assert_eq!(
            store.merge("", None, 0, FunctionKey::Switch, on(), None),
            Err(StoreError::EmptyDeviceId)
        );
        assert_eq!(
            store.merge_info("", None, DeviceInfo::default()),
            Err(StoreError::EmptyDeviceId)
        );
        assert!(store.is_empty());
    }

    #[test]
    fn test_complete_devices_and_remove() {
        let store = DeviceStore::new();
        store.merge_info("A", None, DeviceInfo::default()).unwrap();
        store
            .merge("B", Some("Bad"), 0, FunctionKey::Switch, on(), None)
            .unwrap();

        let complete = store.complete_devices();
        assert_eq!(complete.len(), 1);
        assert_eq!(complete[0].key(), "Bad");

        let removed = store.remove("B").unwrap();
        assert_eq!(removed.key(), "Bad");
        assert!(store.key_of("B").is_none());
        assert!(store.remove("B").is_none());
        assert_eq!(store.len(), 1);
    }
}
