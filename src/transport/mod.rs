//! Broker transport seam
//!
//! The sensor never speaks MQTT itself. It drives a [`BrokerClient`] built by
//! a [`BrokerFactory`], and receives messages through the [`MessageSink`]
//! registered at subscribe time. [`mqtt`] provides the rumqttc-backed
//! implementation; `crate::testing` provides an in-process double.

use crate::config::SensorConfig;
use bytes::Bytes;
use rumqttc::QoS;
use std::sync::Arc;
use std::time::Duration;

pub mod mqtt;

pub use mqtt::{ConnectionState, MqttError};

/// A message delivered by the broker
///
/// Immutable once created; the buffer shares it behind an `Arc`.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub topic: String,
    pub payload: Bytes,
    pub qos: QoS,
}

impl Message {
    pub fn new(topic: impl Into<String>, payload: impl Into<Bytes>, qos: QoS) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            qos,
        }
    }
}

/// Delivery callback invoked on the client's own execution context
pub type MessageSink = Arc<dyn Fn(Message) + Send + Sync>;

/// One broker connection
#[async_trait::async_trait]
pub trait BrokerClient: Send + Sync {
    /// Connect and wait for the broker to acknowledge
    async fn connect(&mut self) -> Result<(), MqttError>;

    /// Subscribe to `topic` and wait for the broker's acknowledgement.
    /// Messages are handed to `sink` from then on.
    async fn subscribe(&mut self, topic: &str, qos: QoS, sink: MessageSink)
        -> Result<(), MqttError>;

    /// Disconnect, waiting at most `grace` for a clean shutdown. No-op when
    /// not connected. No message reaches the sink once this returns.
    async fn disconnect(&mut self, grace: Duration);

    fn is_connected(&self) -> bool;

    fn connection_state(&self) -> ConnectionState;
}

/// Creates a fresh client for each configuration generation
pub trait BrokerFactory: Send + Sync + 'static {
    type Client: BrokerClient + 'static;

    fn create(&self, config: &SensorConfig) -> Result<Self::Client, MqttError>;
}
