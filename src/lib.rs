//! LoRaWAN gateway to network server MQTT bridge
//!
//! Subscribes to gateway events on a source broker, rewrites the gateway
//! identity and topic namespace, filters uplinks by the NetID of their
//! DevAddr, and republishes to the network server broker. The active
//! source/target pair is replaced at runtime through an HTTP endpoint.
//!
//! # Quick Start
//!
//! ```rust
//! use lorawan_bridge::bridge::ActiveConfiguration;
//! use lorawan_bridge::config::ForwardingConfig;
//! use lorawan_bridge::pipeline::{MessagePipeline, PipelineOutcome};
//! use lorawan_bridge::transport::InboundMessage;
//!
//! let config = ActiveConfiguration::new(
//!     1,
//!     ForwardingConfig {
//!         source_broker: "tcp://127.0.0.1:1883".to_string(),
//!         target_broker: "tcp://ns.example.com:1883".to_string(),
//!         gateway_id: "48656c6c6f".to_string(),
//!         topic_namespace: "GW1".to_string(),
//!     },
//! )
//! .unwrap();
//!
//! let message = InboundMessage::new("gateway/OLD/event/stats", br#"{"gatewayID":"old"}"#.to_vec());
//! let outcome = MessagePipeline::default().process(&config, &message).unwrap();
//!
//! let PipelineOutcome::Forward(outbound) = outcome else { panic!("stats are never filtered") };
//! assert_eq!(outbound.topic, "gateway/GW1/event/stats");
//! assert_eq!(outbound.payload, br#"{"gatewayID":"SGVsbG8="}"#);
//! ```

pub mod api;
pub mod bridge;
pub mod config;
pub mod error;
pub mod lorawan;
pub mod observability;
pub mod pipeline;
pub mod testing;
pub mod transport;

pub use bridge::{BridgeController, BridgeState};
pub use config::{BridgeConfig, ConfigError, ForwardingConfig};
pub use error::{BridgeError, BridgeResult};
pub use transport::mqtt::MqttBroker;
