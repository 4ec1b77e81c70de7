//! Configuration file parsing and structures.
//!
//! greennet reads a single TOML file describing the broker, the gateway and
//! the optional HTTP API.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::filter::Targets;

use crate::engine::DEFAULT_TOPIC_BASE;

/// Top-level configuration structure
#[derive(Debug, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub logging: LoggingConfig,
    pub mqtt: MqttConfig,
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub reconciler: ReconcilerConfig,
    #[serde(default)]
    pub api: Option<ApiConfig>,
}

#[derive(Debug, Default, Deserialize, Serialize, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl From<LogLevel> for LevelFilter {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Trace => LevelFilter::TRACE,
            LogLevel::Debug => LevelFilter::DEBUG,
            LogLevel::Info => LevelFilter::INFO,
            LogLevel::Warn => LevelFilter::WARN,
            LogLevel::Error => LevelFilter::ERROR,
        }
    }
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error
    #[serde(default)]
    pub level: LogLevel,

    /// Per-target levels, e.g. `"greennet::engine" = "debug"`
    #[serde(default)]
    pub overrides: HashMap<String, LogLevel>,
}

impl LoggingConfig {
    /// Filter for the tracing subscriber
    pub fn targets(&self) -> Targets {
        self.overrides
            .iter()
            .fold(Targets::new().with_default(self.level), |targets, (target, level)| {
                targets.with_target(target.clone(), *level)
            })
    }
}

fn default_mqtt_port() -> u16 {
    1883
}

fn default_keep_alive_secs() -> u64 {
    30
}

/// MQTT broker connection
#[derive(Debug, Clone, Deserialize)]
pub struct MqttConfig {
    /// Broker hostname or IP address
    pub broker: String,

    #[serde(default = "default_mqtt_port")]
    pub port: u16,

    /// Defaults to `greennet-<hostname>`
    #[serde(default)]
    pub client_id: Option<String>,

    #[serde(default)]
    pub username: Option<String>,

    #[serde(default)]
    pub password: Option<String>,

    #[serde(default = "default_keep_alive_secs")]
    pub keep_alive_secs: u64,
}

impl MqttConfig {
    pub fn client_id(&self) -> String {
        match &self.client_id {
            Some(id) => id.clone(),
            None => {
                let host = hostname::get()
                    .map(|h| h.to_string_lossy().into_owned())
                    .unwrap_or_else(|_| "unknown".to_string());
                format!("greennet-{}", host)
            }
        }
    }

    pub fn keep_alive(&self) -> Duration {
        Duration::from_secs(self.keep_alive_secs)
    }
}

fn default_topic_base() -> String {
    DEFAULT_TOPIC_BASE.to_string()
}

/// The EnOcean-over-IP gateway this instance bridges
#[derive(Debug, Clone, Deserialize)]
pub struct GatewayConfig {
    /// Gateway id as it appears in topics
    pub eag_id: String,

    /// First topic segment
    #[serde(default = "default_topic_base")]
    pub topic_base: String,
}

fn default_debounce_ms() -> u64 {
    20
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReconcilerConfig {
    /// Debounce window per device in milliseconds
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            debounce_ms: default_debounce_ms(),
        }
    }
}

impl ReconcilerConfig {
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }
}

fn default_api_listen() -> String {
    "127.0.0.1".to_string()
}

fn default_api_port() -> u16 {
    8566
}

/// HTTP API, disabled when the section is absent
#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_api_listen")]
    pub listen: String,

    #[serde(default = "default_api_port")]
    pub port: u16,
}

impl ApiConfig {
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.listen, self.port)
    }
}

impl Config {
    /// Load and validate configuration from a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path.as_ref())
            .map_err(|e| ConfigError::Io(path.as_ref().to_path_buf(), e))?;

        contents.parse()
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let invalid_segment = |s: &str| s.is_empty() || s.contains(['/', '+', '#']);

        if invalid_segment(&self.gateway.eag_id) {
            return Err(ConfigError::Invalid(format!(
                "gateway.eag_id {:?} must be a single non-empty topic segment",
                self.gateway.eag_id
            )));
        }
        if invalid_segment(&self.gateway.topic_base) {
            return Err(ConfigError::Invalid(format!(
                "gateway.topic_base {:?} must be a single non-empty topic segment",
                self.gateway.topic_base
            )));
        }
        if self.mqtt.broker.is_empty() {
            return Err(ConfigError::Invalid("mqtt.broker must not be empty".to_string()));
        }
        if self.reconciler.debounce_ms == 0 {
            return Err(ConfigError::Invalid(
                "reconciler.debounce_ms must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}

impl std::str::FromStr for Config {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let config: Config = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {0}: {1}")]
    Io(PathBuf, #[source] std::io::Error),

    #[error("Failed to parse TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    const MINIMAL: &str = r#"
        [mqtt]
        broker = "localhost"

        [gateway]
        eag_id = "EAG1"
    "#;

    #[test]
    fn test_parse_minimal_config() {
        let config: Config = MINIMAL.parse().unwrap();
        assert_eq!(config.logging.level, LogLevel::Info);
        assert_eq!(config.mqtt.port, 1883);
        assert_eq!(config.mqtt.keep_alive(), Duration::from_secs(30));
        assert_eq!(config.gateway.topic_base, "EnOcean");
        assert_eq!(config.reconciler.debounce(), Duration::from_millis(20));
        assert!(config.api.is_none());
        assert!(config.mqtt.client_id().starts_with("greennet-"));
    }

    #[test]
    fn test_parse_full_config() {
        let toml = r#"
            [logging]
            level = "warn"

            [logging.overrides]
            "greennet::engine" = "debug"

            [mqtt]
            broker = "10.0.0.2"
            port = 8883
            client_id = "bridge"
            username = "user"
            password = "secret"
            keep_alive_secs = 10

            [gateway]
            eag_id = "0A1B2C3D"
            topic_base = "GreenNet"

            [reconciler]
            debounce_ms = 100

            [api]
            port = 9000
        "#;

        let config: Config = toml.parse().unwrap();
        assert_eq!(config.logging.level, LogLevel::Warn);
        assert_eq!(
            config.logging.overrides.get("greennet::engine"),
            Some(&LogLevel::Debug)
        );
        assert_eq!(config.mqtt.client_id(), "bridge");
        assert_eq!(config.mqtt.username.as_deref(), Some("user"));
        assert_eq!(config.gateway.topic_base, "GreenNet");
        assert_eq!(config.reconciler.debounce_ms, 100);
        assert_eq!(config.api.unwrap().bind_address(), "127.0.0.1:9000");
    }

    #[test]
    fn test_validation() {
        let bad_gateway = MINIMAL.replace("EAG1", "EAG/1");
        assert!(matches!(
            bad_gateway.parse::<Config>(),
            Err(ConfigError::Invalid(_))
        ));

        let zero_window = format!("{}\n[reconciler]\ndebounce_ms = 0\n", MINIMAL);
        assert!(matches!(
            zero_window.parse::<Config>(),
            Err(ConfigError::Invalid(_))
        ));

        let missing_gateway = "[mqtt]\nbroker = \"localhost\"\n";
        assert!(matches!(
            missing_gateway.parse::<Config>(),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(MINIMAL.as_bytes()).unwrap();

        let config = Config::from_file(file.path()).unwrap();
        assert_eq!(config.gateway.eag_id, "EAG1");

        assert!(matches!(
            Config::from_file("/nonexistent/greennet.toml"),
            Err(ConfigError::Io(_, _))
        ));
    }

    #[test]
    fn test_logging_targets() {
        let logging = LoggingConfig {
            level: LogLevel::Warn,
            overrides: HashMap::from([("greennet::engine".to_string(), LogLevel::Trace)]),
        };
        let targets = logging.targets();
        assert!(targets.would_enable("greennet::engine::store", &tracing::Level::TRACE));
        assert!(!targets.would_enable("greennet::api", &tracing::Level::INFO));
    }
}
