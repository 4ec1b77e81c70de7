//! Outbound commands.
//!
//! A [`Command`] is lowered to gateway functions and wrapped in the
//! `{"state": {"functions": [...]}}` envelope the gateway expects on
//! `put/devices/{deviceId}/state`.

use serde::Deserialize;
use serde::Serialize;
use serde_json::json;

use super::device::ChannelId;
use super::device::Device;
use super::error::CommandError;
use super::error::ValueError;
use super::function::FunctionKey;
use super::function::Value;
use super::message::OutboundMessage;
use super::topic::TopicRouter;

/// A function as given in a raw command.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct CommandFunction {
    pub key: String,
    pub value: serde_json::Value,
}

/// High-level command issued by an observer.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Command {
    TurnOn {
        /// Dim level in percent; ignored for non-dimmable devices
        #[serde(default)]
        brightness: Option<i64>,
    },
    TurnOff,
    SetPosition {
        position: i64,
    },
    SetAngle {
        angle: i64,
    },
    StopCover,
    /// Functions sent as given, after coercion
    Functions {
        functions: Vec<CommandFunction>,
    },
}

#[derive(Debug, Clone)]
pub struct CommandEncoder {
    router: TopicRouter,
}

impl CommandEncoder {
    pub fn new(router: TopicRouter) -> Self {
        Self { router }
    }

    /// Encode a command for one channel of a device.
    pub fn encode(
        &self,
        device: &Device,
        channel: ChannelId,
        command: &Command,
    ) -> Result<OutboundMessage, CommandError> {
        let functions = lower(device, command)?;
        Ok(self.encode_functions(device, channel, &functions))
    }

    /// Encode already-typed functions.
    ///
    /// The topic always carries the hardware id. On dimmable devices
    /// `switch` becomes `dimValue` 100 or 0.
    pub fn encode_functions(
        &self,
        device: &Device,
        channel: ChannelId,
        functions: &[(FunctionKey, Value)],
    ) -> OutboundMessage {
        let dimmable = device.capabilities().dimmable;
        let with_channel = device.is_multi_channel() || channel > 0;

        let functions: Vec<serde_json::Value> = functions
            .iter()
            .map(|(key, value)| {
                let (key, value) = match (key, value) {
                    (FunctionKey::Switch, Value::Bool(on)) if dimmable => (
                        FunctionKey::DimValue,
                        Value::Percent(if *on { 100 } else { 0 }),
                    ),
                    _ => (key.clone(), value.clone()),
                };

                let mut function = serde_json::Map::new();
                if with_channel {
                    function.insert("channel".to_string(), json!(channel));
                }
                function.insert("key".to_string(), json!(key.as_str()));
                function.insert("value".to_string(), value.to_wire(&key));
                serde_json::Value::Object(function)
            })
            .collect();

        OutboundMessage {
            topic: self.router.put_state(&device.device_id),
            payload: json!({ "state": { "functions": functions } }),
        }
    }

    /// Discovery request sent once at startup.
    pub fn discovery_request(&self) -> OutboundMessage {
        OutboundMessage {
            topic: self.router.get_devices(),
            payload: serde_json::Value::Null,
        }
    }
}

/// Turn a command into typed functions, validating percentages.
fn lower(device: &Device, command: &Command) -> Result<Vec<(FunctionKey, Value)>, ValueError> {
    let percent = |key: FunctionKey, n: i64| -> Result<(FunctionKey, Value), ValueError> {
        let value = key.coerce(&json!(n))?;
        Ok((key, value))
    };

    Ok(match command {
        Command::TurnOn {
            brightness: Some(brightness),
        } if device.capabilities().dimmable => {
            vec![percent(FunctionKey::DimValue, *brightness)?]
        }
        Command::TurnOn { .. } => vec![(FunctionKey::Switch, Value::Bool(true))],
        Command::TurnOff => vec![(FunctionKey::Switch, Value::Bool(false))],
        Command::SetPosition { position } => vec![percent(FunctionKey::Position, *position)?],
        Command::SetAngle { angle } => vec![percent(FunctionKey::Angle, *angle)?],
        Command::StopCover => vec![(FunctionKey::Position, Value::Raw(json!("stop")))],
        Command::Functions { functions } => functions
            .iter()
            .map(|f| -> Result<_, ValueError> {
                let key = FunctionKey::parse(&f.key);
                let value = key.coerce(&f.value)?;
                Ok((key, value))
            })
            .collect::<Result<_, ValueError>>()?,
    })
}
