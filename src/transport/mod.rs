//! Broker capability used by the bridge
//!
//! The bridge core only talks to brokers through [`MessageBroker`] and
//! [`BrokerConnection`], so the controller can be driven by the MQTT
//! implementation in production and by an in-memory mock in tests.

use bytes::Bytes;
use std::fmt;
use thiserror::Error;
use tokio::sync::mpsc;

pub mod mqtt;

/// One broker delivery
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Bytes,
}

impl InboundMessage {
    pub fn new(topic: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
        }
    }
}

/// Delivery guarantee requested on publish/subscribe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QualityOfService {
    #[default]
    AtMostOnce,
    AtLeastOnce,
    ExactlyOnce,
}

/// Which side of the bridge a connection serves
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionRole {
    Source,
    Target,
}

impl fmt::Display for ConnectionRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionRole::Source => f.write_str("source"),
            ConnectionRole::Target => f.write_str("target"),
        }
    }
}

/// Broker transport errors
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("Invalid broker URL: {0}")]
    InvalidBrokerUrl(String),
    #[error("Connection to {address} failed: {reason}")]
    ConnectionFailed { address: String, reason: String },
    #[error("Subscription to {filter} failed: {reason}")]
    SubscriptionFailed { filter: String, reason: String },
    #[error("Publishing to {topic} failed: {reason}")]
    PublishFailed { topic: String, reason: String },
    #[error("Not connected - current state: {state}")]
    NotConnected { state: String },
    #[error("Connection closed")]
    Closed,
}

/// Factory for broker connections
#[async_trait::async_trait]
pub trait MessageBroker: Send + Sync + 'static {
    type Connection: BrokerConnection;

    /// Connect and wait until the broker acknowledges the session
    async fn connect(
        &self,
        address: &str,
        role: ConnectionRole,
    ) -> Result<Self::Connection, BrokerError>;
}

/// A live broker session
#[async_trait::async_trait]
pub trait BrokerConnection: Send + Sync + 'static {
    /// Subscribe to a topic filter; matching deliveries are sent to `handler`
    async fn subscribe(
        &self,
        filter: &str,
        handler: mpsc::Sender<InboundMessage>,
    ) -> Result<(), BrokerError>;

    async fn unsubscribe(&self, filter: &str) -> Result<(), BrokerError>;

    async fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
        qos: QualityOfService,
        retain: bool,
    ) -> Result<(), BrokerError>;

    /// Close the session; dropping all subscription handlers
    async fn disconnect(&self) -> Result<(), BrokerError>;

    fn is_connected(&self) -> bool;
}

/// MQTT topic filter matching with `+` and `#` wildcards
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    let mut filter_levels = filter.split('/');
    let mut topic_levels = topic.split('/');

    // Wildcards at the first level never match `$`-prefixed system topics
    if topic.starts_with('$') && (filter.starts_with('+') || filter.starts_with('#')) {
        return false;
    }

    loop {
        match (filter_levels.next(), topic_levels.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => continue,
            (Some(f), Some(t)) if f == t => continue,
            (None, None) => return true,
            _ => return false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_topic_matches_gateway_filters() {
        assert!(topic_matches("gateway/+/event/up", "gateway/0102/event/up"));
        assert!(topic_matches("gateway/+/state/conn", "gateway/abc/state/conn"));
        assert!(!topic_matches("gateway/+/event/up", "gateway/0102/event/stats"));
        assert!(!topic_matches("gateway/+/event/up", "gateway/a/b/event/up"));
        assert!(!topic_matches("gateway/+/event/up", "gateway/0102/event"));
    }

    #[test]
    fn test_topic_matches_multi_level() {
        assert!(topic_matches("gateway/#", "gateway/a/event/up"));
        assert!(topic_matches("gateway/#", "gateway"));
        assert!(topic_matches("#", "anything/at/all"));
        assert!(!topic_matches("#", "$SYS/broker/uptime"));
        assert!(topic_matches("$SYS/#", "$SYS/broker/uptime"));
    }

    #[test]
    fn test_topic_matches_exact() {
        assert!(topic_matches("a/b", "a/b"));
        assert!(!topic_matches("a/b", "a/b/c"));
        assert!(!topic_matches("a/b/c", "a/b"));
        assert!(topic_matches("+/+", "/x"));
    }

    #[test]
    fn test_inbound_message_from_vec() {
        let message = InboundMessage::new("gateway/x/event/up", b"{}".to_vec());
        assert_eq!(message.topic, "gateway/x/event/up");
        assert_eq!(&message.payload[..], b"{}");
    }

    #[test]
    fn test_broker_error_display() {
        let errors = vec![
            BrokerError::InvalidBrokerUrl("x".to_string()),
            BrokerError::ConnectionFailed {
                address: "tcp://a:1883".to_string(),
                reason: "refused".to_string(),
            },
            BrokerError::SubscriptionFailed {
                filter: "a/+".to_string(),
                reason: "denied".to_string(),
            },
            BrokerError::PublishFailed {
                topic: "a/b".to_string(),
                reason: "closed".to_string(),
            },
            BrokerError::NotConnected {
                state: "Reconnecting(2)".to_string(),
            },
            BrokerError::Closed,
        ];

        for error in errors {
            assert!(!error.to_string().is_empty());
        }
    }
}
