//! Sensor configuration
//!
//! Mirrors the host framework's attribute names (`topic`, `host`, `port`,
//! `qos`, `q_length`, `clientid`, `msg_type`). A configuration is validated
//! as a whole before it is applied anywhere.

use crate::payload::PayloadFormat;
use rumqttc::QoS;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Component configuration snapshot
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SensorConfig {
    /// Topic to subscribe to (required)
    pub topic: String,
    /// Broker host name or address (required)
    pub host: String,
    /// Broker TCP port (> 0)
    pub port: u16,
    /// Subscription quality-of-service level (0..=2)
    #[serde(default)]
    pub qos: u8,
    /// Maximum number of undelivered messages kept for capture reads
    #[serde(default, rename = "q_length")]
    pub queue_length: usize,
    /// MQTT client identifier; a unique one is generated when empty
    #[serde(default, rename = "clientid")]
    pub client_id: String,
    /// Payload format: "", "raw", "json" or "string"
    #[serde(default, rename = "msg_type")]
    pub message_type: String,
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),
    #[error("Failed to parse TOML: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("Failed to parse attributes: {0}")]
    JsonParse(#[from] serde_json::Error),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl SensorConfig {
    /// Load configuration from a TOML file and validate it
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: SensorConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Build configuration from a host framework attribute map and validate it
    pub fn from_json(attributes: serde_json::Value) -> Result<Self, ConfigError> {
        let config: SensorConfig = serde_json::from_value(attributes)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.topic.is_empty() {
            return Err(ConfigError::InvalidConfig("topic is required".to_string()));
        }
        if self.host.is_empty() {
            return Err(ConfigError::InvalidConfig("host is required".to_string()));
        }
        if self.port == 0 {
            return Err(ConfigError::InvalidConfig(
                "invalid port (should be > 0)".to_string(),
            ));
        }
        if self.qos > 2 {
            return Err(ConfigError::InvalidConfig(format!(
                "qos must be between 0 and 2, got {}",
                self.qos
            )));
        }
        if PayloadFormat::parse(&self.message_type).is_none() {
            return Err(ConfigError::InvalidConfig(format!(
                r#"message type must be either "", "json", "string", or "raw", got "{}""#,
                self.message_type
            )));
        }
        Ok(())
    }

    /// Payload format selected by `msg_type`; unknown values fall back to raw
    /// but never survive `validate`.
    pub fn payload_format(&self) -> PayloadFormat {
        PayloadFormat::parse(&self.message_type).unwrap_or_default()
    }

    pub fn qos_level(&self) -> QoS {
        qos_from_level(self.qos)
    }

    /// `host:port` form used in logs
    pub fn broker_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Create a test configuration for unit testing
    #[cfg(test)]
    pub fn test_config() -> Self {
        let toml_content = r#"
topic = "sensors/temperature"
host = "localhost"
port = 1883
qos = 1
q_length = 10
msg_type = "json"
"#;
        toml::from_str(toml_content).expect("Test config should parse")
    }
}

/// Network tunables that are not part of the attribute surface
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionTuning {
    pub keep_alive: Duration,
    /// Upper bound on waiting for the broker's ConnAck
    pub connect_timeout: Duration,
    /// Grace period for a clean disconnect before the event loop is aborted
    pub disconnect_grace: Duration,
}

impl Default for ConnectionTuning {
    fn default() -> Self {
        Self {
            keep_alive: Duration::from_secs(60),
            connect_timeout: Duration::from_secs(10),
            disconnect_grace: Duration::from_millis(250),
        }
    }
}

/// Map a validated numeric level to a QoS; out-of-range values clamp to 2.
pub fn qos_from_level(level: u8) -> QoS {
    match level {
        0 => QoS::AtMostOnce,
        1 => QoS::AtLeastOnce,
        _ => QoS::ExactlyOnce,
    }
}

pub fn qos_to_level(qos: QoS) -> u8 {
    match qos {
        QoS::AtMostOnce => 0,
        QoS::AtLeastOnce => 1,
        QoS::ExactlyOnce => 2,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_toml_config_parses_attribute_names() {
        let config = SensorConfig::test_config();
        assert_eq!(config.topic, "sensors/temperature");
        assert_eq!(config.host, "localhost");
        assert_eq!(config.port, 1883);
        assert_eq!(config.qos, 1);
        assert_eq!(config.queue_length, 10);
        assert_eq!(config.client_id, "");
        assert_eq!(config.payload_format(), PayloadFormat::Json);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_optional_fields_default() {
        let config: SensorConfig =
            toml::from_str("topic = \"a\"\nhost = \"b\"\nport = 1\n").unwrap();
        assert_eq!(config.qos, 0);
        assert_eq!(config.queue_length, 0);
        assert_eq!(config.payload_format(), PayloadFormat::Raw);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_empty_topic_rejected() {
        let mut config = SensorConfig::test_config();
        config.topic = String::new();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("topic is required"));
    }

    #[test]
    fn test_empty_host_rejected() {
        let mut config = SensorConfig::test_config();
        config.host = String::new();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidConfig(msg)) if msg.contains("host")
        ));
    }

    #[test]
    fn test_zero_port_rejected() {
        let mut config = SensorConfig::test_config();
        config.port = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_qos_range() {
        let mut config = SensorConfig::test_config();
        for qos in 0..=2 {
            config.qos = qos;
            assert!(config.validate().is_ok(), "qos {qos} should be valid");
        }
        config.qos = 3;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_message_type_closed_set() {
        let mut config = SensorConfig::test_config();
        for message_type in ["", "raw", "json", "string"] {
            config.message_type = message_type.to_string();
            assert!(config.validate().is_ok(), "{message_type:?} should be valid");
        }
        config.message_type = "protobuf".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_from_json_attributes() {
        let config = SensorConfig::from_json(json!({
            "topic": "plant/line1",
            "host": "10.0.0.5",
            "port": 1884,
            "qos": 2,
            "q_length": 50,
            "clientid": "line1-reader",
            "msg_type": "string"
        }))
        .unwrap();

        assert_eq!(config.client_id, "line1-reader");
        assert_eq!(config.queue_length, 50);
        assert_eq!(config.qos_level(), QoS::ExactlyOnce);
        assert_eq!(config.payload_format(), PayloadFormat::String);
        assert_eq!(config.broker_address(), "10.0.0.5:1884");
    }

    #[test]
    fn test_from_json_rejects_invalid_values() {
        let negative_port = SensorConfig::from_json(json!({
            "topic": "t", "host": "h", "port": -1
        }));
        assert!(matches!(negative_port, Err(ConfigError::JsonParse(_))));

        let bad_type = SensorConfig::from_json(json!({
            "topic": "t", "host": "h", "port": 1883, "msg_type": "xml"
        }));
        assert!(matches!(bad_type, Err(ConfigError::InvalidConfig(_))));
    }

    #[test]
    fn test_qos_level_mapping() {
        assert_eq!(qos_from_level(0), QoS::AtMostOnce);
        assert_eq!(qos_from_level(1), QoS::AtLeastOnce);
        assert_eq!(qos_from_level(2), QoS::ExactlyOnce);
        for level in 0..=2 {
            assert_eq!(qos_to_level(qos_from_level(level)), level);
        }
    }

    #[test]
    fn test_connection_tuning_defaults() {
        let tuning = ConnectionTuning::default();
        assert_eq!(tuning.keep_alive, Duration::from_secs(60));
        assert_eq!(tuning.disconnect_grace, Duration::from_millis(250));
    }
}
