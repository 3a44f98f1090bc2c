//! mqttsensor - single-topic MQTT ingestion sensor
//!
//! Subscribes to one MQTT topic, keeps the most recent messages in a bounded
//! drop-oldest buffer, and exposes them through a read façade with two modes:
//!
//! - **capture** pops the oldest buffered message
//! - **snapshot** returns the latest message without consuming it
//!
//! Every configuration change starts a fresh connection *generation*. The
//! previous generation is fully stopped before the new one connects, and a
//! stopped generation can never push into the buffer again.
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use mqttsensor::{MqttSensor, ReadMode, SensorConfig};
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
//! let (sensor, attempt) = MqttSensor::new("temperature", config).await?;
//! attempt.outcome().await?;
//!
//! if let Some(reading) = sensor.read(ReadMode::Snapshot)?.into_reading() {
//!     println!("{}", serde_json::to_string(&reading)?);
//! }
//! sensor.close().await;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! # });
//! ```

pub mod buffer;
pub mod config;
pub mod error;
pub mod observability;
pub mod payload;
pub mod sensor;
pub mod testing;
pub mod transport;

pub use buffer::MessageBuffer;
pub use config::{ConfigError, ConnectionTuning, SensorConfig};
pub use error::{SensorError, SensorResult};
pub use payload::{Payload, PayloadFormat};
pub use sensor::{ConnectAttempt, MqttSensor, ReadMode, ReadOutcome, Reading};
pub use transport::{ConnectionState, Message};
