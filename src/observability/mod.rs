//! Observability for the sensor
//!
//! Structured logging through `tracing`, with span macros for connection
//! generations and lifecycle events.

pub mod logging;

// Re-export for convenience
pub use logging::{LogFormat, init_default_logging, init_logging};

// Span macros for structured logging
pub use logging::{lifecycle_span, mqtt_span};
