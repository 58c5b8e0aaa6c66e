//! Configuration for the LoRaWAN bridge
//!
//! Two layers live here: the process configuration loaded once from TOML
//! (listener ports, MQTT client tuning, optional startup forwarding), and the
//! runtime [`ForwardingConfig`] record that the config endpoint replaces
//! wholesale on every accepted update.

use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

/// Process configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct BridgeConfig {
    #[serde(default)]
    pub api: ApiSection,
    #[serde(default)]
    pub health: HealthSection,
    #[serde(default)]
    pub mqtt: MqttSection,
    #[serde(default)]
    pub bridge: BridgeSection,
    /// Forwarding to activate at startup (optional)
    pub forwarding: Option<ForwardingConfig>,
}

/// Configuration endpoint listener
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ApiSection {
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default = "default_api_port")]
    pub port: u16,
}

impl Default for ApiSection {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            port: default_api_port(),
        }
    }
}

/// Health/metrics listener
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HealthSection {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_health_port")]
    pub port: u16,
}

impl Default for HealthSection {
    fn default() -> Self {
        Self {
            enabled: true,
            port: default_health_port(),
        }
    }
}

/// MQTT client tuning shared by source and target connections
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MqttSection {
    /// Prefix for generated client ids
    #[serde(default = "default_client_id_prefix")]
    pub client_id_prefix: String,
    /// Environment variable containing username
    pub username_env: Option<String>,
    /// Environment variable containing password
    pub password_env: Option<String>,
    #[serde(default = "default_keep_alive")]
    pub keep_alive_secs: u64,
    /// Upper bound for CONNACK after connect
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,
    /// Per-filter delivery queue depth
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
    /// Reconnection attempts before giving up (unlimited when absent)
    pub max_reconnect_attempts: Option<u32>,
}

impl Default for MqttSection {
    fn default() -> Self {
        Self {
            client_id_prefix: default_client_id_prefix(),
            username_env: None,
            password_env: None,
            keep_alive_secs: default_keep_alive(),
            connect_timeout_ms: default_connect_timeout(),
            channel_capacity: default_channel_capacity(),
            max_reconnect_attempts: None,
        }
    }
}

impl MqttSection {
    /// MQTT username from environment variable
    pub fn username(&self) -> Option<String> {
        get_env_var_optional(self.username_env.as_ref())
    }

    /// MQTT password from environment variable
    pub fn password(&self) -> Option<String> {
        get_env_var_optional(self.password_env.as_ref())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct BridgeSection {
    /// Replace exactly topic segment 1 instead of the first textual match
    #[serde(default)]
    pub structural_topic_rewrite: bool,
}

fn default_bind() -> String {
    "0.0.0.0".to_string()
}

fn default_api_port() -> u16 {
    3000
}

fn default_health_port() -> u16 {
    8080
}

fn default_true() -> bool {
    true
}

fn default_client_id_prefix() -> String {
    "lorawan-bridge".to_string()
}

fn default_keep_alive() -> u64 {
    60
}

fn default_connect_timeout() -> u64 {
    5000
}

fn default_channel_capacity() -> usize {
    64
}

/// Active source/target pair and gateway identity
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ForwardingConfig {
    /// Broker the gateway publishes to
    pub source_broker: String,
    /// Network server broker receiving rewritten messages
    pub target_broker: String,
    /// Hex-encoded gateway identity
    pub gateway_id: String,
    /// Topic namespace used on the target broker
    pub topic_namespace: String,
}

impl ForwardingConfig {
    /// Check every field is present and the identity is hex
    pub fn validate(&self) -> Result<(), ConfigError> {
        let fields = [
            ("source_broker", &self.source_broker),
            ("target_broker", &self.target_broker),
            ("gateway_id", &self.gateway_id),
            ("topic_namespace", &self.topic_namespace),
        ];
        for (name, value) in fields {
            if value.trim().is_empty() {
                return Err(ConfigError::MissingField(name));
            }
        }

        hex::decode(&self.gateway_id)
            .map_err(|e| ConfigError::InvalidGatewayId(format!("'{}': {e}", self.gateway_id)))?;
        Ok(())
    }
}

/// Configuration loading and validation errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),
    #[error("Failed to parse TOML: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("Missing required field: {0}")]
    MissingField(&'static str),
    #[error("Invalid gateway identity (expected hex): {0}")]
    InvalidGatewayId(String),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl BridgeConfig {
    /// Load configuration from TOML file
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: BridgeConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.mqtt.channel_capacity == 0 {
            return Err(ConfigError::InvalidConfig(
                "mqtt.channel_capacity must be greater than zero".to_string(),
            ));
        }
        if self.mqtt.connect_timeout_ms == 0 {
            return Err(ConfigError::InvalidConfig(
                "mqtt.connect_timeout_ms must be greater than zero".to_string(),
            ));
        }
        if self.health.enabled && self.health.port == self.api.port {
            return Err(ConfigError::InvalidConfig(format!(
                "health.port and api.port must differ (both {})",
                self.api.port
            )));
        }
        if let Some(forwarding) = &self.forwarding {
            forwarding.validate()?;
        }
        Ok(())
    }
}

fn get_env_var_optional(env_var_name: Option<&String>) -> Option<String> {
    env_var_name.and_then(|name| std::env::var(name).ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn forwarding() -> ForwardingConfig {
        ForwardingConfig {
            source_broker: "tcp://127.0.0.1:1883".to_string(),
            target_broker: "tcp://ns.example.com:1883".to_string(),
            gateway_id: "0102030405060708".to_string(),
            topic_namespace: "0102030405060708".to_string(),
        }
    }

    #[test]
    fn test_full_config() {
        let toml_content = r#"
[api]
bind = "127.0.0.1"
port = 3100

[health]
enabled = false
port = 9000

[mqtt]
client_id_prefix = "bridge-test"
username_env = "MQTT_USERNAME"
password_env = "MQTT_PASSWORD"
keep_alive_secs = 30
connect_timeout_ms = 2500
channel_capacity = 16
max_reconnect_attempts = 5

[bridge]
structural_topic_rewrite = true

[forwarding]
source_broker = "tcp://127.0.0.1:1883"
target_broker = "tcp://ns.example.com:1883"
gateway_id = "0102030405060708"
topic_namespace = "GW1"
"#;

        let config: BridgeConfig = toml::from_str(toml_content).unwrap();
        assert_eq!(config.api.bind, "127.0.0.1");
        assert_eq!(config.api.port, 3100);
        assert!(!config.health.enabled);
        assert_eq!(config.mqtt.client_id_prefix, "bridge-test");
        assert_eq!(config.mqtt.keep_alive_secs, 30);
        assert_eq!(config.mqtt.max_reconnect_attempts, Some(5));
        assert!(config.bridge.structural_topic_rewrite);
        assert_eq!(config.forwarding.unwrap().topic_namespace, "GW1");
    }

    #[test]
    fn test_empty_config_uses_defaults() {
        let config: BridgeConfig = toml::from_str("").unwrap();
        assert_eq!(config, BridgeConfig::default());
        assert_eq!(config.api.port, 3000);
        assert_eq!(config.health.port, 8080);
        assert!(config.health.enabled);
        assert_eq!(config.mqtt.keep_alive_secs, 60);
        assert_eq!(config.mqtt.connect_timeout_ms, 5000);
        assert!(!config.bridge.structural_topic_rewrite);
        assert!(config.forwarding.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_forwarding_validate_ok() {
        assert!(forwarding().validate().is_ok());
    }

    #[test]
    fn test_forwarding_missing_fields() {
        let mut config = forwarding();
        config.source_broker = String::new();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::MissingField("source_broker"))
        ));

        let mut config = forwarding();
        config.target_broker = "  ".to_string();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::MissingField("target_broker"))
        ));

        let mut config = forwarding();
        config.gateway_id = String::new();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::MissingField("gateway_id"))
        ));

        let mut config = forwarding();
        config.topic_namespace = String::new();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::MissingField("topic_namespace"))
        ));
    }

    #[test]
    fn test_forwarding_rejects_non_hex_identity() {
        let mut config = forwarding();
        config.gateway_id = "not-hex".to_string();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidGatewayId(_))
        ));

        config.gateway_id = "abc".to_string();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidGatewayId(_))
        ));
    }

    #[test]
    fn test_port_collision_rejected() {
        let mut config = BridgeConfig::default();
        config.health.port = config.api.port;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidConfig(_))
        ));

        config.health.enabled = false;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_zero_channel_capacity_rejected() {
        let mut config = BridgeConfig::default();
        config.mqtt.channel_capacity = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_credentials_from_env() {
        let section = MqttSection {
            username_env: Some("LORAWAN_BRIDGE_TEST_USER".to_string()),
            password_env: Some("LORAWAN_BRIDGE_TEST_MISSING_PASS".to_string()),
            ..Default::default()
        };
        std::env::set_var("LORAWAN_BRIDGE_TEST_USER", "gateway");
        assert_eq!(section.username(), Some("gateway".to_string()));
        assert_eq!(section.password(), None);
        assert_eq!(MqttSection::default().username(), None);
    }
}
