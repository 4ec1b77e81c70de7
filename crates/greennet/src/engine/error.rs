//! Error taxonomy for the reconciliation core.
//!
//! Nothing here is fatal. Parsing failures are contained to one message
//! (`PayloadError`) or one function (`ValueError`); only commands surface
//! errors back to whoever issued them.

/// A function value that could not be coerced. Skips that one function.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ValueError {
    #[error("invalid value for {key}: expected {expected}, got {raw}")]
    Unparseable {
        key: String,
        expected: &'static str,
        raw: String,
    },

    #[error("invalid value for {key}: {value} is outside 0..=100")]
    OutOfRange { key: String, value: i64 },

    #[error("invalid channel {0}")]
    Channel(String),
}

/// A message payload that could not be decoded. Skips that one message.
#[derive(Debug, thiserror::Error)]
pub enum PayloadError {
    #[error("malformed JSON payload: {0}")]
    Json(#[from] serde_json::Error),

    #[error("payload is not UTF-8: {0}")]
    Utf8(#[from] std::str::Utf8Error),

    #[error("device object without deviceId")]
    MissingDeviceId,
}

/// Caller errors raised by the device store.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("device id must not be empty")]
    EmptyDeviceId,
}

/// A command that could not be queued for the gateway.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CommandError {
    #[error("unknown device: {0}")]
    UnknownDevice(String),

    #[error(transparent)]
    InvalidValue(#[from] ValueError),

    #[error("gateway transport unavailable")]
    TransportUnavailable,
}
