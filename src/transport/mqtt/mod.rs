//! MQTT implementation of the broker capability
//!
//! Built on rumqttc's MQTT v5 async client and split the same way as the
//! rest of the transport code: pure decisions apart from I/O.
//!
//! - [`connection`] - Broker address parsing, client options and connection state
//! - [`message_handler`] - Event routing and per-filter dispatch
//! - [`health_monitor`] - Reconnection decisions and state transitions
//! - [`client`] - Event loop supervision and the [`MessageBroker`](crate::transport::MessageBroker) impl
//!
//! # Usage
//!
//! ```rust,no_run
//! use lorawan_bridge::config::MqttSection;
//! use lorawan_bridge::transport::mqtt::MqttBroker;
//! use lorawan_bridge::transport::{BrokerConnection, ConnectionRole, MessageBroker, QualityOfService};
//!
//! # tokio_test::block_on(async {
//! let broker = MqttBroker::new(MqttSection::default());
//! let connection = broker.connect("tcp://localhost:1883", ConnectionRole::Target).await?;
//! connection
//!     .publish("gateway/0102/event/stats", b"{}".to_vec(), QualityOfService::AtMostOnce, false)
//!     .await?;
//! connection.disconnect().await?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! # });
//! ```

pub mod client;
pub mod connection;
pub mod health_monitor;
pub mod message_handler;

pub use client::{MqttBroker, MqttConnection};
pub use connection::{parse_broker_address, BrokerAddress, ConnectionState, ReconnectConfig};
pub use health_monitor::{ConnectionEvent, HealthMonitor, ReconnectionDecision};
pub use message_handler::{EventRoute, MessageHandler, SubscriptionRouter};
