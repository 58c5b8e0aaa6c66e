//! Testing utilities and mock implementations
//!
//! Lets the bridge run end to end without an MQTT broker.

pub mod mocks;

pub use mocks::*;
