//! Function keys and values.
//!
//! The gateway reports device state as `{key, value}` pairs it calls functions.
//! Keys come from a fixed vocabulary; anything outside it is carried through
//! untouched so newer gateway firmware never breaks reconciliation.

use std::fmt;

use serde::Serialize;
use serde::Serializer;
use strum::EnumString;

use super::error::ValueError;

/// A function key reported by or sent to the gateway.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, EnumString)]
pub enum FunctionKey {
    #[strum(serialize = "switch")]
    Switch,
    #[strum(serialize = "dimValue")]
    DimValue,
    #[strum(serialize = "position")]
    Position,
    #[strum(serialize = "angle")]
    Angle,
    #[strum(serialize = "temperature")]
    Temperature,
    #[strum(serialize = "humidity")]
    Humidity,
    #[strum(serialize = "energy")]
    Energy,
    #[strum(serialize = "power")]
    Power,
    #[strum(serialize = "localControl")]
    LocalControl,
    #[strum(serialize = "error")]
    Error,
    #[strum(serialize = "batteryLow")]
    BatteryLow,
    #[strum(serialize = "circuitInUse")]
    CircuitInUse,
    /// Selects the channel for the other functions of the same telegram.
    #[strum(serialize = "channel")]
    Channel,
    /// A key not yet known to greennet
    #[strum(default)]
    Other(String),
}

/// How a key's raw value is interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueKind {
    /// `"on"`/`"off"`, `true`/`false`, `1`/`0`
    OnOff,
    /// Integer in 0..=100
    Percent,
    /// Floating point measurement
    Decimal,
    /// Channel index
    Selector,
    /// Stored as received
    Raw,
}

impl FunctionKey {
    /// Parse a key as the gateway spells it. Never fails.
    pub fn parse(key: &str) -> Self {
        key.parse()
            .unwrap_or_else(|_| FunctionKey::Other(key.to_string()))
    }

    pub fn as_str(&self) -> &str {
        match self {
            FunctionKey::Switch => "switch",
            FunctionKey::DimValue => "dimValue",
            FunctionKey::Position => "position",
            FunctionKey::Angle => "angle",
            FunctionKey::Temperature => "temperature",
            FunctionKey::Humidity => "humidity",
            FunctionKey::Energy => "energy",
            FunctionKey::Power => "power",
            FunctionKey::LocalControl => "localControl",
            FunctionKey::Error => "error",
            FunctionKey::BatteryLow => "batteryLow",
            FunctionKey::CircuitInUse => "circuitInUse",
            FunctionKey::Channel => "channel",
            FunctionKey::Other(key) => key,
        }
    }

    pub fn kind(&self) -> ValueKind {
        match self {
            FunctionKey::Switch
            | FunctionKey::LocalControl
            | FunctionKey::Error
            | FunctionKey::BatteryLow
            | FunctionKey::CircuitInUse => ValueKind::OnOff,
            FunctionKey::DimValue | FunctionKey::Position | FunctionKey::Angle => {
                ValueKind::Percent
            }
            FunctionKey::Temperature
            | FunctionKey::Humidity
            | FunctionKey::Energy
            | FunctionKey::Power => ValueKind::Decimal,
            FunctionKey::Channel => ValueKind::Selector,
            FunctionKey::Other(_) => ValueKind::Raw,
        }
    }

    /// Coerce a raw JSON value into the type this key expects.
    pub fn coerce(&self, raw: &serde_json::Value) -> Result<Value, ValueError> {
        match self.kind() {
            ValueKind::OnOff => parse_on_off(raw)
                .map(Value::Bool)
                .ok_or_else(|| self.unparseable("on/off", raw)),
            ValueKind::Percent => {
                let n = parse_integer(raw).ok_or_else(|| self.unparseable("integer", raw))?;
                if (0..=100).contains(&n) {
                    Ok(Value::Percent(n as u8))
                } else {
                    Err(ValueError::OutOfRange {
                        key: self.to_string(),
                        value: n,
                    })
                }
            }
            ValueKind::Decimal => parse_decimal(raw)
                .map(Value::Decimal)
                .ok_or_else(|| self.unparseable("number", raw)),
            ValueKind::Selector => parse_channel(raw)
                .map(|c| Value::Raw(c.into()))
                .ok_or_else(|| self.unparseable("channel index", raw)),
            ValueKind::Raw => Ok(Value::Raw(raw.clone())),
        }
    }

    fn unparseable(&self, expected: &'static str, raw: &serde_json::Value) -> ValueError {
        ValueError::Unparseable {
            key: self.to_string(),
            expected,
            raw: raw.to_string(),
        }
    }
}

impl fmt::Display for FunctionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for FunctionKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

/// A coerced function value.
///
/// Equality is type-aware: `Bool(true)` never equals `Raw("on")`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Value {
    Bool(bool),
    Percent(u8),
    Decimal(f64),
    Raw(serde_json::Value),
}

impl Value {
    /// The value as the gateway expects it on the wire for `key`.
    pub fn to_wire(&self, key: &FunctionKey) -> serde_json::Value {
        match (self, key.kind()) {
            (Value::Bool(on), ValueKind::OnOff) => {
                serde_json::Value::from(if *on { "on" } else { "off" })
            }
            (Value::Bool(b), _) => serde_json::Value::from(*b),
            (Value::Percent(n), _) => serde_json::Value::from(*n),
            (Value::Decimal(n), _) => serde_json::Value::from(*n),
            (Value::Raw(v), _) => v.clone(),
        }
    }
}

/// Parse a channel index; negative and fractional values are rejected.
pub fn parse_channel(raw: &serde_json::Value) -> Option<u64> {
    let n = parse_integer(raw)?;
    u64::try_from(n).ok()
}

fn parse_on_off(raw: &serde_json::Value) -> Option<bool> {
    match raw {
        serde_json::Value::Bool(b) => Some(*b),
        serde_json::Value::Number(n) => match n.as_i64() {
            Some(1) => Some(true),
            Some(0) => Some(false),
            _ => None,
        },
        serde_json::Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
            "on" | "true" | "1" => Some(true),
            "off" | "false" | "0" => Some(false),
            _ => None,
        },
        _ => None,
    }
}

fn parse_integer(raw: &serde_json::Value) -> Option<i64> {
    match raw {
        serde_json::Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().filter(|f| f.fract() == 0.0).map(|f| f as i64)),
        serde_json::Value::String(s) => {
            let s = s.trim();
            s.parse::<i64>().ok().or_else(|| {
                s.parse::<f64>()
                    .ok()
                    .filter(|f| f.is_finite() && f.fract() == 0.0)
                    .map(|f| f as i64)
            })
        }
        _ => None,
    }
}

fn parse_decimal(raw: &serde_json::Value) -> Option<f64> {
    let n = match raw {
        serde_json::Value::Number(n) => n.as_f64()?,
        serde_json::Value::String(s) => s.trim().parse::<f64>().ok()?,
        _ => return None,
    };
    n.is_finite().then_some(n)
}
