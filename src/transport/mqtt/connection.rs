//! Pure connection state management for the MQTT client
//!
//! This module contains the connection state machine, transport errors and
//! the mapping from sensor configuration to rumqttc options.

use crate::config::{ConnectionTuning, SensorConfig};
use rumqttc::MqttOptions;
use thiserror::Error;
use uuid::Uuid;

/// Connection state of one generation
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionState {
    /// No connection attempt made yet
    Idle,
    /// Waiting for the broker's ConnAck
    Connecting,
    /// ConnAck received, subscription not yet confirmed
    Connected,
    /// Subscription acknowledged; messages flow
    Subscribed,
    /// Connect phase failed; terminal for this generation
    Failed(String),
    /// Connection closed; terminal for this generation
    Disconnected(String),
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected | ConnectionState::Subscribed)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ConnectionState::Failed(_) | ConnectionState::Disconnected(_)
        )
    }
}

/// MQTT transport errors
#[derive(Debug, Error)]
pub enum MqttError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("ConnAck timeout - no connection confirmation received")]
    ConnectTimeout,
    #[error("Subscription failed: {0}")]
    SubscriptionFailed(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("Not connected - current state: {state:?}")]
    NotConnected { state: ConnectionState },
    #[error("Event loop already started")]
    AlreadyStarted,
}

/// Client identifier for a connection. Brokers reject an empty id from a
/// clean-session client, so an empty configured id gets a unique one.
pub fn resolve_client_id(configured: &str) -> String {
    if configured.is_empty() {
        format!("mqttsensor-{}", Uuid::new_v4().simple())
    } else {
        configured.to_string()
    }
}

/// Pure function to build MQTT options from the sensor configuration
pub fn configure_mqtt_options(config: &SensorConfig, tuning: &ConnectionTuning) -> MqttOptions {
    let client_id = resolve_client_id(&config.client_id);
    let mut mqtt_options = MqttOptions::new(client_id, config.host.clone(), config.port);
    mqtt_options.set_keep_alive(tuning.keep_alive);
    mqtt_options.set_clean_session(true);
    mqtt_options
}
