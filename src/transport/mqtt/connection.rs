//! Pure connection state management for MQTT client
//!
//! This module contains pure functions for broker address parsing,
//! connection state tracking and client option construction.

use crate::config::MqttSection;
use crate::transport::{BrokerError, ConnectionRole, QualityOfService};
use rumqttc::v5::{mqttbytes::QoS, MqttOptions};
use rumqttc::Transport as RumqttcTransport;
use std::fmt;
use std::time::Duration;
use url::Url;

/// rumqttc refuses keep-alive intervals below this
const MIN_KEEP_ALIVE_SECS: u64 = 5;

/// Connection state for MQTT client
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionState {
    /// Initial state - attempting to connect
    Connecting,
    /// Successfully connected and ready for operations
    Connected,
    /// Disconnected with reason
    Disconnected(String),
    /// Attempting to reconnect (attempt count)
    Reconnecting(u32),
    /// Permanently disconnected - max reconnection attempts exceeded or closed
    PermanentlyDisconnected(String),
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Connected => write!(f, "connected"),
            ConnectionState::Disconnected(reason) => write!(f, "disconnected ({reason})"),
            ConnectionState::Reconnecting(attempt) => write!(f, "reconnecting (attempt {attempt})"),
            ConnectionState::PermanentlyDisconnected(reason) => {
                write!(f, "permanently disconnected ({reason})")
            }
        }
    }
}

/// Reconnection configuration
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Maximum number of reconnection attempts (None = unlimited)
    pub max_attempts: Option<u32>,
    /// Custom backoff pattern in milliseconds
    pub backoff_pattern: Vec<u64>,
    /// Delay to use after pattern is exhausted
    pub sustained_delay: u64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            max_attempts: None,
            backoff_pattern: vec![25, 50, 100, 250],
            sustained_delay: 250,
        }
    }
}

impl ReconnectConfig {
    pub fn from_section(config: &MqttSection) -> Self {
        Self {
            max_attempts: config.max_reconnect_attempts,
            ..Default::default()
        }
    }

    /// Backoff delay for the given 1-based attempt
    pub fn calculate_backoff_delay(&self, attempt: u32) -> u64 {
        let index = (attempt.saturating_sub(1)) as usize;
        self.backoff_pattern
            .get(index)
            .copied()
            .unwrap_or(self.sustained_delay)
    }
}

/// Parsed broker endpoint
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerAddress {
    pub host: String,
    pub port: u16,
    pub tls: bool,
}

impl fmt::Display for BrokerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let scheme = if self.tls { "mqtts" } else { "tcp" };
        write!(f, "{scheme}://{}:{}", self.host, self.port)
    }
}

/// Parse a broker address as written by gateway operators.
///
/// Accepts `tcp://`, `mqtt://`, `ssl://`, `tls://`, `mqtts://` URLs or a bare
/// `host[:port]`, which is treated as plain TCP.
pub fn parse_broker_address(address: &str) -> Result<BrokerAddress, BrokerError> {
    let trimmed = address.trim();
    let with_scheme = if trimmed.contains("://") {
        trimmed.to_string()
    } else {
        format!("tcp://{trimmed}")
    };

    let url =
        Url::parse(&with_scheme).map_err(|_| BrokerError::InvalidBrokerUrl(address.to_string()))?;

    let tls = match url.scheme() {
        "tcp" | "mqtt" => false,
        "ssl" | "tls" | "mqtts" => true,
        _ => return Err(BrokerError::InvalidBrokerUrl(address.to_string())),
    };

    let host = url
        .host_str()
        .filter(|host| !host.is_empty())
        .ok_or_else(|| BrokerError::InvalidBrokerUrl(address.to_string()))?;
    let port = url.port().unwrap_or(if tls { 8883 } else { 1883 });

    Ok(BrokerAddress {
        host: host.trim_start_matches('[').trim_end_matches(']').to_string(),
        port,
        tls,
    })
}

/// Unique client id so old/new activations and both roles never collide
pub fn generate_client_id(prefix: &str, role: ConnectionRole) -> String {
    format!("{prefix}-{role}-{}", uuid::Uuid::new_v4().simple())
}

/// Build rumqttc options for a parsed broker address
pub fn configure_mqtt_options(
    address: &BrokerAddress,
    client_id: &str,
    config: &MqttSection,
) -> MqttOptions {
    let mut mqtt_options = MqttOptions::new(client_id, address.host.clone(), address.port);

    if address.tls {
        mqtt_options.set_transport(RumqttcTransport::tls_with_default_config());
    }

    if let Some(username) = config.username() {
        let password = config.password().unwrap_or_default();
        mqtt_options.set_credentials(username, password);
    }

    mqtt_options.set_keep_alive(Duration::from_secs(
        config.keep_alive_secs.max(MIN_KEEP_ALIVE_SECS),
    ));
    mqtt_options.set_clean_start(true);
    // Gateway events carry rxInfo arrays; the broker default of 10KB is too tight
    mqtt_options.set_max_packet_size(Some(256 * 1024));

    mqtt_options
}

/// Map the transport-neutral QoS onto rumqttc's
pub fn to_mqtt_qos(qos: QualityOfService) -> QoS {
    match qos {
        QualityOfService::AtMostOnce => QoS::AtMostOnce,
        QualityOfService::AtLeastOnce => QoS::AtLeastOnce,
        QualityOfService::ExactlyOnce => QoS::ExactlyOnce,
    }
}
