use std::collections::BTreeMap;

use serde::Deserialize;
use serde::Serialize;

use super::function::FunctionKey;
use super::function::Value;

/// Channel index within a device
pub type ChannelId = u8;

/// Channel used when a message does not name one
pub const DEFAULT_CHANNEL: ChannelId = 0;

/// Deserialize a field that can be a string or any other JSON scalar.
///
/// The gateway is not consistent about quoting: `physicalDevice` and the
/// timestamps are usually strings but some firmware versions send numbers.
/// Non-scalar values are treated as absent rather than failing the document.
fn deserialize_lenient_string<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(serde_json::Value::String(s)) => Some(s),
        Some(serde_json::Value::Number(n)) => Some(n.to_string()),
        Some(serde_json::Value::Bool(b)) => Some(b.to_string()),
        _ => None,
    })
}

/// Deserialize a signal strength that can be an integer, a float or a string.
fn deserialize_lenient_dbm<'de, D>(deserializer: D) -> Result<Option<i32>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(serde_json::Value::Number(n)) => n.as_f64().map(|f| f.round() as i32),
        Some(serde_json::Value::String(s)) => s.trim().parse::<f64>().ok().map(|f| f.round() as i32),
        _ => None,
    })
}

/// Deserialize the `eeps` list, keeping only entries with a string `eep`.
///
/// A value that is not a list is treated as absent, as is a list in which
/// no entry names a profile.
fn deserialize_lenient_eeps<'de, D>(deserializer: D) -> Result<Option<Vec<Eep>>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    let Some(serde_json::Value::Array(entries)) = value else {
        return Ok(None);
    };
    if entries.is_empty() {
        return Ok(Some(Vec::new()));
    }

    let eeps: Vec<Eep> = entries
        .iter()
        .filter_map(|entry| {
            let eep = entry.get("eep")?.as_str()?;
            Some(Eep {
                eep: eep.to_string(),
                direction: entry
                    .get("direction")
                    .and_then(|d| d.as_str())
                    .map(str::to_string),
            })
        })
        .collect();
    Ok((!eeps.is_empty()).then_some(eeps))
}

/// An EnOcean Equipment Profile entry as listed by the gateway.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct Eep {
    /// Profile identifier, e.g. "D2-01-12"
    pub eep: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub direction: Option<String>,
}

/// Descriptive device metadata.
///
/// Every field is optional so partial documents enrich rather than erase
/// what is already known.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceInfo {
    #[serde(
        default,
        deserialize_with = "deserialize_lenient_eeps",
        skip_serializing_if = "Option::is_none"
    )]
    pub eeps: Option<Vec<Eep>>,

    #[serde(
        default,
        deserialize_with = "deserialize_lenient_string",
        skip_serializing_if = "Option::is_none"
    )]
    pub manufacturer: Option<String>,

    #[serde(
        default,
        deserialize_with = "deserialize_lenient_string",
        skip_serializing_if = "Option::is_none"
    )]
    pub physical_device: Option<String>,

    #[serde(
        default,
        deserialize_with = "deserialize_lenient_string",
        skip_serializing_if = "Option::is_none"
    )]
    pub first_seen: Option<String>,

    #[serde(
        default,
        deserialize_with = "deserialize_lenient_string",
        skip_serializing_if = "Option::is_none"
    )]
    pub last_seen: Option<String>,

    /// Signal strength of the last telegram
    #[serde(
        default,
        deserialize_with = "deserialize_lenient_dbm",
        skip_serializing_if = "Option::is_none"
    )]
    pub dbm: Option<i32>,
}

impl DeviceInfo {
    pub fn is_empty(&self) -> bool {
        *self == DeviceInfo::default()
    }

    /// Overwrite fields present in `update`. Returns whether anything changed.
    pub fn merge(&mut self, update: DeviceInfo) -> bool {
        fn set<T: PartialEq>(slot: &mut Option<T>, new: Option<T>) -> bool {
            match new {
                Some(v) if slot.as_ref() != Some(&v) => {
                    *slot = Some(v);
                    true
                }
                _ => false,
            }
        }

        let mut changed = set(&mut self.eeps, update.eeps);
        changed |= set(&mut self.manufacturer, update.manufacturer);
        changed |= set(&mut self.physical_device, update.physical_device);
        changed |= set(&mut self.first_seen, update.first_seen);
        changed |= set(&mut self.last_seen, update.last_seen);
        changed |= set(&mut self.dbm, update.dbm);
        changed
    }
}

/// What a device can do, derived from its primary EEP.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Capabilities {
    /// On/off must be sent as dimValue 100/0
    pub dimmable: bool,
    pub cover: bool,
    pub tilt: bool,
    pub channel_count: u8,
}

const DIMMABLE_EEPS: &[&str] = &[
    "D2-01-02", "D2-01-03", "D2-01-06", "D2-01-07", "D2-01-0A", "D2-01-0B", "D2-01-0F",
    "D2-01-10", "D2-01-12", "A5-38-08",
];

const TILT_EEPS: &[&str] = &["D2-05-00", "D2-05-02"];

impl Capabilities {
    pub fn from_eep(eep: Option<&str>) -> Self {
        let Some(eep) = eep else {
            return Self::default();
        };

        let channel_count = match eep {
            "D2-01-04" | "D2-01-05" | "D2-01-06" | "D2-01-07" => 2,
            "D2-01-08" | "D2-01-09" | "D2-01-0A" | "D2-01-0B" => 4,
            "D2-01-0D" | "D2-01-0E" | "D2-01-0F" | "D2-01-10" => 8,
            _ => 1,
        };

        Self {
            dimmable: DIMMABLE_EEPS.contains(&eep),
            cover: eep.starts_with("D2-05-"),
            tilt: TILT_EEPS.contains(&eep),
            channel_count,
        }
    }
}

impl Default for Capabilities {
    fn default() -> Self {
        Self {
            dimmable: false,
            cover: false,
            tilt: false,
            channel_count: 1,
        }
    }
}

/// Stored value of one function on one channel.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FunctionState {
    pub value: Value,

    /// Gateway timestamp of the message that carried the value. Recorded,
    /// never used for ordering.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_timestamp: Option<String>,

    /// Store-wide arrival sequence number of the write
    pub seq: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Channel {
    pub functions: BTreeMap<FunctionKey, FunctionState>,
}

/// A device as known to the store.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Device {
    /// Hardware id assigned by the gateway
    pub device_id: String,

    /// User-assigned label, if one has been seen
    #[serde(skip_serializing_if = "Option::is_none")]
    pub friendly_id: Option<String>,

    #[serde(flatten)]
    pub info: DeviceInfo,

    pub channels: BTreeMap<ChannelId, Channel>,
}

impl Device {
    pub fn new(device_id: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            friendly_id: None,
            info: DeviceInfo::default(),
            channels: BTreeMap::new(),
        }
    }

    /// Canonical store key: the friendly id if known, else the hardware id.
    pub fn key(&self) -> &str {
        self.friendly_id.as_deref().unwrap_or(&self.device_id)
    }

    pub fn primary_eep(&self) -> Option<&str> {
        self.info
            .eeps
            .as_ref()
            .and_then(|eeps| eeps.first())
            .map(|e| e.eep.as_str())
    }

    pub fn capabilities(&self) -> Capabilities {
        Capabilities::from_eep(self.primary_eep())
    }

    /// Whether outbound functions must name their channel.
    pub fn is_multi_channel(&self) -> bool {
        self.capabilities().channel_count > 1 || self.channels.keys().any(|c| *c > 0)
    }

    /// At least one channel with at least one function.
    pub fn is_complete(&self) -> bool {
        self.channels.values().any(|c| !c.functions.is_empty())
    }

    pub fn function(&self, channel: ChannelId, key: &FunctionKey) -> Option<&FunctionState> {
        self.channels.get(&channel)?.functions.get(key)
    }

    pub fn value(&self, channel: ChannelId, key: &FunctionKey) -> Option<&Value> {
        self.function(channel, key).map(|f| &f.value)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_capabilities_from_eep() {
        let dimmer = Capabilities::from_eep(Some("D2-01-0A"));
        assert!(dimmer.dimmable);
        assert_eq!(dimmer.channel_count, 4);
        assert!(!dimmer.cover);

        let blind = Capabilities::from_eep(Some("D2-05-00"));
        assert!(blind.cover);
        assert!(blind.tilt);
        assert_eq!(blind.channel_count, 1);

        let switch = Capabilities::from_eep(Some("D2-01-00"));
        assert!(!switch.dimmable);

        assert_eq!(Capabilities::from_eep(None), Capabilities::default());
    }

    #[test]
    fn test_device_info_lenient_fields() {
        let info: DeviceInfo = serde_json::from_value(json!({
            "eeps": [{"eep": "D2-01-12", "direction": "both", "version": 3}],
            "manufacturer": "OPUS",
            "physicalDevice": 42,
            "dbm": "-71",
            "firstSeen": {"unexpected": true}
        }))
        .unwrap();

        assert_eq!(info.eeps.as_ref().unwrap()[0].eep, "D2-01-12");
        assert_eq!(info.physical_device.as_deref(), Some("42"));
        assert_eq!(info.dbm, Some(-71));
        assert_eq!(info.first_seen, None);
    }

    #[test]
    fn test_malformed_eeps_are_dropped() {
        let info: DeviceInfo = serde_json::from_value(json!({
            "eeps": [{"version": 3}, {"eep": "D2-05-00"}, "A5-02-05"]
        }))
        .unwrap();
        assert_eq!(
            info.eeps,
            Some(vec![Eep {
                eep: "D2-05-00".to_string(),
                direction: None
            }])
        );

        let info: DeviceInfo =
            serde_json::from_value(json!({"eeps": "D2-01-00", "manufacturer": "OPUS"})).unwrap();
        assert_eq!(info.eeps, None);
        assert_eq!(info.manufacturer.as_deref(), Some("OPUS"));

        let info: DeviceInfo = serde_json::from_value(json!({"eeps": [{"eep": 7}]})).unwrap();
        assert!(info.is_empty());
    }

    #[test]
    fn test_device_info_merge_keeps_absent_fields() {
        let mut info = DeviceInfo {
            manufacturer: Some("OPUS".to_string()),
            dbm: Some(-70),
            ..Default::default()
        };

        let changed = info.merge(DeviceInfo {
            dbm: Some(-65),
            ..Default::default()
        });
        assert!(changed);
        assert_eq!(info.manufacturer.as_deref(), Some("OPUS"));
        assert_eq!(info.dbm, Some(-65));

        assert!(!info.merge(DeviceInfo {
            dbm: Some(-65),
            ..Default::default()
        }));
    }

    #[test]
    fn test_device_key_and_completeness() {
        let mut device = Device::new("01A02F6C");
        assert_eq!(device.key(), "01A02F6C");
        assert!(!device.is_complete());

        device.friendly_id = Some("KG_Vorrat-1K-1".to_string());
        assert_eq!(device.key(), "KG_Vorrat-1K-1");

        device.channels.insert(0, Channel::default());
        assert!(!device.is_complete());

        device.channels.get_mut(&0).unwrap().functions.insert(
            FunctionKey::Switch,
            FunctionState {
                value: Value::Bool(true),
                source_timestamp: None,
                seq: 1,
            },
        );
        assert!(device.is_complete());
        assert!(!device.is_multi_channel());

        device.channels.insert(1, Channel::default());
        assert!(device.is_multi_channel());
    }
}
