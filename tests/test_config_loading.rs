//! Configuration loading and validation tests
//!
//! Exercises `BridgeConfig::load_from_file` against files on disk.

use lorawan_bridge::config::{BridgeConfig, ConfigError};
use std::io::Write;
use std::path::Path;
use tempfile::NamedTempFile;

fn write_config(contents: &str) -> NamedTempFile {
    let mut temp_file = NamedTempFile::new().unwrap();
    writeln!(temp_file, "{contents}").unwrap();
    temp_file
}

#[test]
fn test_config_loads_successfully_from_valid_toml() {
    let temp_file = write_config(
        r#"
[api]
bind = "127.0.0.1"
port = 3200

[mqtt]
client_id_prefix = "site-7"
keep_alive_secs = 20

[forwarding]
source_broker = "tcp://127.0.0.1:1883"
target_broker = "tcp://ns.example.com:1883"
gateway_id = "0102030405060708"
topic_namespace = "0102030405060708"
"#,
    );

    let config = BridgeConfig::load_from_file(temp_file.path()).unwrap();

    assert_eq!(config.api.bind, "127.0.0.1");
    assert_eq!(config.api.port, 3200);
    assert_eq!(config.mqtt.client_id_prefix, "site-7");
    assert_eq!(config.mqtt.keep_alive_secs, 20);
    assert!(config.health.enabled);

    let forwarding = config.forwarding.unwrap();
    assert_eq!(forwarding.source_broker, "tcp://127.0.0.1:1883");
    assert_eq!(forwarding.gateway_id, "0102030405060708");
}

#[test]
fn test_config_without_forwarding_waits_for_endpoint() {
    let temp_file = write_config(
        r#"
[health]
port = 9090
"#,
    );

    let config = BridgeConfig::load_from_file(temp_file.path()).unwrap();
    assert!(config.forwarding.is_none());
    assert_eq!(config.health.port, 9090);
    assert_eq!(config.api.port, 3000);
}

#[test]
fn test_config_missing_file_error() {
    let result = BridgeConfig::load_from_file(Path::new("/nonexistent/bridge.toml"));
    assert!(matches!(result, Err(ConfigError::FileRead(_))));
}

#[test]
fn test_config_invalid_toml_syntax() {
    let temp_file = write_config("[api\nport = 3000");
    let result = BridgeConfig::load_from_file(temp_file.path());
    assert!(matches!(result, Err(ConfigError::TomlParse(_))));
}

#[test]
fn test_config_wrong_field_type() {
    let temp_file = write_config(
        r#"
[api]
port = "three thousand"
"#,
    );
    let result = BridgeConfig::load_from_file(temp_file.path());
    assert!(matches!(result, Err(ConfigError::TomlParse(_))));
}

#[test]
fn test_config_rejects_invalid_forwarding() {
    let temp_file = write_config(
        r#"
[forwarding]
source_broker = "tcp://127.0.0.1:1883"
target_broker = "tcp://ns.example.com:1883"
gateway_id = "zz-not-hex"
topic_namespace = "GW"
"#,
    );
    let result = BridgeConfig::load_from_file(temp_file.path());
    assert!(matches!(result, Err(ConfigError::InvalidGatewayId(_))));
}

#[test]
fn test_config_rejects_shared_ports() {
    let temp_file = write_config(
        r#"
[api]
port = 8080

[health]
port = 8080
"#,
    );
    let result = BridgeConfig::load_from_file(temp_file.path());
    assert!(matches!(result, Err(ConfigError::InvalidConfig(_))));
}

#[test]
fn test_config_round_trips_through_show_output() {
    let config = BridgeConfig::default();
    let rendered = toml::to_string_pretty(&config).unwrap();
    let temp_file = write_config(&rendered);

    let reloaded = BridgeConfig::load_from_file(temp_file.path()).unwrap();
    assert_eq!(reloaded, config);
}
