//! Error types for the MQTT sensor
//!
//! Every failure here is recoverable: configuration errors leave the previous
//! configuration running, connection and subscription errors leave the
//! component readable, decode errors drop a single message.

use crate::config::ConfigError;
use crate::payload::DecodeError;
use crate::transport::mqtt::MqttError;
use thiserror::Error;

/// Main error type for sensor operations
#[derive(Debug, Error)]
pub enum SensorError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Connection error: {0}")]
    Connection(#[source] MqttError),

    #[error("Subscription error: {0}")]
    Subscription(#[source] MqttError),

    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),

    #[error("Connection attempt abandoned before it completed")]
    ConnectAbandoned,

    #[error("unimplemented")]
    Unimplemented,
}

impl SensorError {
    /// Classify a transport failure by the phase it happened in
    pub fn from_transport(error: MqttError) -> Self {
        match error {
            MqttError::SubscriptionFailed(_) => SensorError::Subscription(error),
            other => SensorError::Connection(other),
        }
    }

    pub fn is_config(&self) -> bool {
        matches!(self, SensorError::Config(_))
    }
}

/// Result type for sensor operations
pub type SensorResult<T> = Result<T, SensorError>;
