//! Configuration loading and validation tests
//!
//! Tests focus on BEHAVIOR of configuration loading, validation, and error handling.

use homegear_mqtt::config::{ConfigError, MqttSettings};
use homegear_mqtt::protocol::QoS;
use homegear_mqtt::{MqttClient, MqttError};
use std::io::Write;
use std::time::Duration;
use tempfile::NamedTempFile;

fn write_config(content: &str) -> NamedTempFile {
    let mut temp_file = NamedTempFile::new().unwrap();
    writeln!(temp_file, "{content}").unwrap();
    temp_file
}

#[test]
fn test_config_loads_successfully_from_valid_toml() {
    let temp_file = write_config(
        r#"
enabled = true
broker_address = "broker.local"
broker_port = 1884
client_id = "homegear-main"
username = "homegear"
password = "secret"
topic_prefix = "homegear/5678"
qos = 1

[timeouts]
ack_ms = 2500
"#,
    );

    let settings = MqttSettings::load_from_file(temp_file.path()).unwrap();

    assert!(settings.enabled);
    assert_eq!(settings.broker_endpoint(), "broker.local:1884");
    assert_eq!(settings.client_id, "homegear-main");
    assert_eq!(settings.username.as_deref(), Some("homegear"));
    assert_eq!(settings.topic_prefix, "homegear/5678");
    assert_eq!(settings.qos_level(), QoS::AtLeastOnce);
    assert_eq!(settings.timeouts.ack(), Duration::from_millis(2500));
    assert_eq!(settings.timeouts.connect(), Duration::from_millis(5000));
}

#[test]
fn test_empty_file_gives_defaults() {
    let temp_file = write_config("");
    let settings = MqttSettings::load_from_file(temp_file.path()).unwrap();
    assert_eq!(settings, MqttSettings::default());
    assert!(!settings.enabled);
}

#[test]
fn test_missing_file_is_a_read_error() {
    let result = MqttSettings::load_from_file(std::path::Path::new("/nonexistent/mqtt.toml"));
    assert!(matches!(result, Err(ConfigError::FileRead(_))));
}

#[test]
fn test_invalid_toml_is_a_parse_error() {
    let temp_file = write_config("broker_port = \"not a number\"");
    let result = MqttSettings::load_from_file(temp_file.path());
    assert!(matches!(result, Err(ConfigError::TomlParse(_))));
}

#[test]
fn test_invalid_values_are_rejected_on_load() {
    let temp_file = write_config("qos = 2");
    let result = MqttSettings::load_from_file(temp_file.path());
    assert!(matches!(result, Err(ConfigError::InvalidConfig(_))));

    let temp_file = write_config("use_tls = true");
    let result = MqttSettings::load_from_file(temp_file.path());
    assert!(matches!(result, Err(ConfigError::InvalidConfig(_))));
}

#[test]
fn test_client_rejects_invalid_settings() {
    let settings = MqttSettings {
        enabled: true,
        keepalive_seconds: 0,
        ..Default::default()
    };
    let result = MqttClient::new(settings);
    assert!(matches!(
        result,
        Err(MqttError::Config(ConfigError::InvalidConfig(_)))
    ));
}

#[tokio::test]
async fn test_tls_with_missing_ca_fails_at_start() {
    let settings = MqttSettings {
        enabled: true,
        use_tls: true,
        ca_file: Some("/nonexistent/ca.pem".into()),
        ..Default::default()
    };
    let client = MqttClient::new(settings).unwrap();

    let result = client.start().await;
    assert!(matches!(result, Err(MqttError::Tls(_))));
    assert!(!client.is_running());
}

#[test]
fn test_settings_round_trip_through_toml() {
    let settings = MqttSettings {
        enabled: true,
        client_id: "homegear-1".to_string(),
        qos: 0,
        ..Default::default()
    };
    let text = toml::to_string_pretty(&settings).unwrap();
    let temp_file = write_config(&text);

    let loaded = MqttSettings::load_from_file(temp_file.path()).unwrap();
    assert_eq!(loaded, settings);
}
