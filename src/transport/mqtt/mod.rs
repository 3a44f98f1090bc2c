//! rumqttc-backed broker client
//!
//! The module separates pure functions from I/O:
//!
//! - [`connection`] - connection states, errors and option construction
//! - [`message_handler`] - pure event routing and sink forwarding
//! - [`client`] - the event loop task and the [`BrokerClient`](crate::transport::BrokerClient) impl
//!
//! # Usage
//!
//! ```rust,no_run
//! use mqttsensor::config::{ConnectionTuning, SensorConfig};
//! use mqttsensor::transport::mqtt::MqttClient;
//! use mqttsensor::transport::{BrokerClient, Message};
//! use std::sync::Arc;
//!
//! # tokio_test::block_on(async {
//! let config = SensorConfig {
//!     topic: "sensors/temperature".to_string(),
//!     host: "localhost".to_string(),
//!     port: 1883,
//!     qos: 1,
//!     queue_length: 10,
//!     client_id: String::new(),
//!     message_type: "json".to_string(),
//! };
//!
//! let mut client = MqttClient::new(&config, ConnectionTuning::default());
//! client.connect().await?;
//! client
//!     .subscribe(&config.topic, config.qos_level(), Arc::new(|message: Message| println!("{message:?}")))
//!     .await?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! # });
//! ```

pub mod client;
pub mod connection;
pub mod message_handler;

pub use client::{MqttClient, MqttClientFactory};
pub use connection::{configure_mqtt_options, resolve_client_id, ConnectionState, MqttError};
pub use message_handler::{EventRoute, MessageForwarder, MessageHandler};
