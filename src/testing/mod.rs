//! Testing utilities and mock implementations
//!
//! This module provides a mock broker for testing the sensor without a
//! running MQTT broker.

pub mod mocks;

pub use mocks::*;
