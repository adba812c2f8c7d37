//! MQTT client settings
//!
//! Settings are loaded once from a TOML file (every key is optional) and
//! handed to [`crate::MqttClient`] by value. A running client never sees its
//! settings change; reloading goes through stop, replace and start.

use crate::protocol::{QoS, MAX_FIELD_LENGTH};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Connection and publishing parameters for one client instance
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct MqttSettings {
    /// Master switch; a disabled client turns every publish into a no-op
    pub enabled: bool,
    pub broker_address: String,
    pub broker_port: u16,
    pub use_tls: bool,
    /// PEM bundle of trusted CA certificates (required with TLS)
    pub ca_file: Option<PathBuf>,
    /// PEM client certificate chain for mutual TLS
    pub cert_file: Option<PathBuf>,
    /// PEM private key matching `cert_file`
    pub key_file: Option<PathBuf>,
    /// Empty means "generate one on load"
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<String>,
    /// Environment variable holding the password; takes precedence over `password`
    pub password_env: Option<String>,
    pub keepalive_seconds: u16,
    /// Namespace every published topic is placed under
    pub topic_prefix: String,
    /// Subscription filter for incoming commands, relative to the prefix
    pub command_topic: String,
    pub retain_default: bool,
    /// 0 or 1
    pub qos: u8,
    /// Messages held before the oldest gets dropped
    pub queue_capacity: usize,
    pub timeouts: TimeoutSettings,
}

impl Default for MqttSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            broker_address: "localhost".to_string(),
            broker_port: 1883,
            use_tls: false,
            ca_file: None,
            cert_file: None,
            key_file: None,
            client_id: String::new(),
            username: None,
            password: None,
            password_env: None,
            keepalive_seconds: 60,
            topic_prefix: "homegear/0000".to_string(),
            command_topic: "set/#".to_string(),
            retain_default: true,
            qos: 1,
            queue_capacity: 1000,
            timeouts: TimeoutSettings::default(),
        }
    }
}

/// Deadlines and delays, in milliseconds
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TimeoutSettings {
    /// Socket open plus CONNACK
    pub connect_ms: u64,
    /// SUBACK, PUBACK and PINGRESP
    pub ack_ms: u64,
    /// Pause before a reconnect attempt
    pub reconnect_delay_ms: u64,
    /// Pause after the broker refused our credentials
    pub auth_failure_delay_ms: u64,
}

impl Default for TimeoutSettings {
    fn default() -> Self {
        Self {
            connect_ms: 5000,
            ack_ms: 5000,
            reconnect_delay_ms: 10_000,
            auth_failure_delay_ms: 60_000,
        }
    }
}

impl TimeoutSettings {
    pub fn connect(&self) -> Duration {
        Duration::from_millis(self.connect_ms)
    }

    pub fn ack(&self) -> Duration {
        Duration::from_millis(self.ack_ms)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    pub fn auth_failure_delay(&self) -> Duration {
        Duration::from_millis(self.auth_failure_delay_ms)
    }
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),
    #[error("Failed to parse TOML: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("Environment variable not found: {0}")]
    EnvVarNotFound(String),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl MqttSettings {
    /// Load settings from a TOML file and validate them
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let settings: MqttSettings = toml::from_str(&content)?;
        settings.validate()?;
        Ok(settings)
    }

    /// Check field combinations a client cannot work with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.broker_address.trim().is_empty() {
            return Err(invalid("broker_address must not be empty"));
        }
        if self.qos > 1 {
            return Err(invalid(format!("qos must be 0 or 1, got {}", self.qos)));
        }
        if self.keepalive_seconds == 0 {
            return Err(invalid("keepalive_seconds must be greater than 0"));
        }
        if self.queue_capacity == 0 {
            return Err(invalid("queue_capacity must be greater than 0"));
        }
        if self.timeouts.connect_ms == 0 || self.timeouts.ack_ms == 0 {
            return Err(invalid("connect and ack timeouts must be greater than 0"));
        }
        if self.use_tls && self.ca_file.is_none() {
            return Err(invalid("use_tls requires ca_file"));
        }
        if self.cert_file.is_some() != self.key_file.is_some() {
            return Err(invalid("cert_file and key_file must be set together"));
        }
        if (self.password.is_some() || self.password_env.is_some()) && self.username.is_none() {
            return Err(invalid("a password requires a username"));
        }
        check_field_length("client_id", Some(&self.client_id))?;
        check_field_length("username", self.username.as_deref())?;
        check_field_length("password", self.password.as_deref())?;
        Ok(())
    }

    /// Validated copy with a concrete client id and the password resolved
    pub fn resolved(mut self) -> Result<Self, ConfigError> {
        self.validate()?;

        if self.client_id.trim().is_empty() {
            self.client_id = format!("homegear-{}", uuid::Uuid::new_v4().simple());
        }
        if let Some(env_name) = &self.password_env {
            let password = std::env::var(env_name)
                .map_err(|_| ConfigError::EnvVarNotFound(env_name.clone()))?;
            check_field_length("password", Some(&password))?;
            self.password = Some(password);
        }

        Ok(self)
    }

    pub fn qos_level(&self) -> QoS {
        if self.qos == 0 {
            QoS::AtMostOnce
        } else {
            QoS::AtLeastOnce
        }
    }

    pub fn keepalive(&self) -> Duration {
        Duration::from_secs(u64::from(self.keepalive_seconds))
    }

    /// Deadline for a PINGRESP; always shorter than the ping interval
    pub fn ping_deadline(&self) -> Duration {
        self.timeouts.ack().min(self.keepalive() / 2)
    }

    /// `host:port` for logging
    pub fn broker_endpoint(&self) -> String {
        format!("{}:{}", self.broker_address, self.broker_port)
    }
}

fn invalid<S: Into<String>>(message: S) -> ConfigError {
    ConfigError::InvalidConfig(message.into())
}

/// CONNECT carries these fields behind a 16-bit length prefix
fn check_field_length(name: &str, value: Option<&str>) -> Result<(), ConfigError> {
    match value {
        Some(value) if value.len() > MAX_FIELD_LENGTH => Err(invalid(format!(
            "{name} is {} bytes, at most {MAX_FIELD_LENGTH} are allowed",
            value.len()
        ))),
        _ => Ok(()),
    }
}
