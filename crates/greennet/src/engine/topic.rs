//! Topic routing for the EnOcean-over-IP MQTT namespace.
//!
//! Every topic the gateway uses has the shape `{base}/{eag_id}/{suffix}`:
//!
//! ```text
//! EnOcean/{G}/stream/devices[/{P...}]              bulk snapshot
//! EnOcean/{G}/stream/device/{D}[/{P...}]           device delta
//! EnOcean/{G}/stream/telegram/{D}[/{dir}][/{P...}] telegram
//! EnOcean/{G}/getAnswer/devices[/{P...}]           discovery answer
//! EnOcean/{G}/getAnswer/diagnostics[/{P...}]       diagnostics answer
//! EnOcean/{G}/getAnswer/configuration[/{P...}]     configuration answer
//! EnOcean/{G}/put/devices/{D}/state                command (outbound)
//! EnOcean/{G}/get/devices                          discovery request (outbound)
//! ```

use strum::Display;
use strum::EnumString;
use tracing::trace;

/// Default first topic segment used by the gateway
pub const DEFAULT_TOPIC_BASE: &str = "EnOcean";

/// Telegram direction as it appears in the topic or payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumString, Display)]
#[strum(serialize_all = "lowercase")]
pub enum Direction {
    /// Device to gateway status
    From,
    /// Gateway to device command echo
    To,
}

/// Message kind, used for logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum RouteKind {
    BulkDevices,
    DeviceDelta,
    Telegram,
    DiscoveryAnswer,
    Diagnostics,
    Configuration,
}

/// A classified inbound topic.
///
/// `path` holds the residual segments after the identifying part. An empty
/// path means the payload is a JSON document; a non-empty path means the
/// payload is a single flattened leaf.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    BulkDevices {
        path: Vec<String>,
    },
    DeviceDelta {
        device_id: String,
        path: Vec<String>,
    },
    Telegram {
        device_id: String,
        direction: Option<Direction>,
        path: Vec<String>,
    },
    DiscoveryAnswer {
        path: Vec<String>,
    },
    Diagnostics {
        path: Vec<String>,
    },
    Configuration {
        path: Vec<String>,
    },
}

impl Route {
    pub fn kind(&self) -> RouteKind {
        match self {
            Route::BulkDevices { .. } => RouteKind::BulkDevices,
            Route::DeviceDelta { .. } => RouteKind::DeviceDelta,
            Route::Telegram { .. } => RouteKind::Telegram,
            Route::DiscoveryAnswer { .. } => RouteKind::DiscoveryAnswer,
            Route::Diagnostics { .. } => RouteKind::Diagnostics,
            Route::Configuration { .. } => RouteKind::Configuration,
        }
    }
}

/// Classifies topics for one gateway and builds outbound topics for it.
#[derive(Debug, Clone)]
pub struct TopicRouter {
    base: String,
    eag_id: String,
}

impl TopicRouter {
    pub fn new(base: impl Into<String>, eag_id: impl Into<String>) -> Self {
        Self {
            base: base.into(),
            eag_id: eag_id.into(),
        }
    }

    pub fn eag_id(&self) -> &str {
        &self.eag_id
    }

    /// Classify a topic.
    ///
    /// Returns `None` for topics of other gateways and for unrecognized
    /// suffixes; neither is an error.
    pub fn route(&self, topic: &str) -> Option<Route> {
        let mut segments = topic.split('/');
        if segments.next() != Some(self.base.as_str())
            || segments.next() != Some(self.eag_id.as_str())
        {
            trace!("Ignoring topic outside gateway namespace: {}", topic);
            return None;
        }

        let rest: Vec<&str> = segments.collect();
        if rest.iter().any(|s| s.is_empty()) {
            trace!("Ignoring topic with empty segment: {}", topic);
            return None;
        }

        let owned = |parts: &[&str]| parts.iter().map(|s| s.to_string()).collect::<Vec<_>>();

        let route = match rest.as_slice() {
            ["stream", "devices", path @ ..] => Route::BulkDevices { path: owned(path) },
            ["stream", "device", device_id, path @ ..] => Route::DeviceDelta {
                device_id: device_id.to_string(),
                path: owned(path),
            },
            ["stream", "telegram", device_id, tail @ ..] => {
                let direction = tail.first().and_then(|s| s.parse::<Direction>().ok());
                let path = if direction.is_some() { &tail[1..] } else { tail };
                Route::Telegram {
                    device_id: device_id.to_string(),
                    direction,
                    path: owned(path),
                }
            }
            ["getAnswer", "devices", path @ ..] => Route::DiscoveryAnswer { path: owned(path) },
            ["getAnswer", "diagnostics", path @ ..] => Route::Diagnostics { path: owned(path) },
            ["getAnswer", "configuration", path @ ..] => {
                Route::Configuration { path: owned(path) }
            }
            _ => {
                trace!("Ignoring unrecognized topic: {}", topic);
                return None;
            }
        };

        Some(route)
    }

    /// Command topic for a device. Always the hardware id.
    pub fn put_state(&self, device_id: &str) -> String {
        format!("{}/{}/put/devices/{}/state", self.base, self.eag_id, device_id)
    }

    /// Discovery request topic
    pub fn get_devices(&self) -> String {
        format!("{}/{}/get/devices", self.base, self.eag_id)
    }

    /// Topic filters the transport must subscribe to.
    pub fn subscriptions(&self) -> Vec<String> {
        vec![
            format!("{}/{}/stream/#", self.base, self.eag_id),
            format!("{}/{}/getAnswer/#", self.base, self.eag_id),
        ]
    }
}
