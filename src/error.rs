//! Error types for the MQTT client
//!
//! Nothing here is fatal to the host process. Transport, protocol and
//! timeout failures are answered with a reconnect; the remaining variants
//! are outcomes reported to a single caller or waiter.

use crate::config::ConfigError;
use crate::protocol::{CodecError, ConnectReturnCode, PacketType};
use thiserror::Error;

pub type MqttResult<T> = Result<T, MqttError>;

/// Main error type for MQTT client operations
#[derive(Debug, Error)]
pub enum MqttError {
    #[error("Transport error: {0}")]
    Transport(#[from] std::io::Error),

    #[error("TLS setup failed: {0}")]
    Tls(String),

    #[error("Connection failed: {0}")]
    ConnectFailed(String),

    #[error("Protocol violation: {0}")]
    Codec(#[from] CodecError),

    #[error("Unexpected {0:?} packet")]
    UnexpectedPacket(PacketType),

    #[error("Connection refused by broker: {0}")]
    ConnectionRefused(ConnectReturnCode),

    #[error("Subscription to {topic} rejected by broker")]
    SubscribeRejected { topic: String },

    #[error("Timed out waiting for {waiting_for:?}")]
    Timeout { waiting_for: PacketType },

    #[error("Publish queue full, dropped {dropped} message(s)")]
    QueueOverflow { dropped: u64 },

    #[error("Packet identifier {0} already has a pending request")]
    PacketIdInUse(u16),

    #[error("A {0:?} request is already pending")]
    RequestTypeInUse(PacketType),

    #[error("No free packet identifier")]
    Congested,

    #[error("Connection lost")]
    ConnectionLost,

    #[error("Client is shutting down")]
    ShuttingDown,

    #[error("Not connected to broker")]
    NotConnected,

    #[error("MQTT is disabled")]
    Disabled,

    #[error("Invalid topic: {0}")]
    InvalidTopic(#[from] crate::protocol::TopicError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

impl MqttError {
    /// Whether the connection must be torn down and rebuilt after this error
    pub fn requires_reconnect(&self) -> bool {
        matches!(
            self,
            MqttError::Transport(_)
                | MqttError::Tls(_)
                | MqttError::ConnectFailed(_)
                | MqttError::Codec(_)
                | MqttError::UnexpectedPacket(_)
                | MqttError::ConnectionRefused(_)
                | MqttError::SubscribeRejected { .. }
                | MqttError::Timeout { .. }
        )
    }

    /// Shutdown and connection loss are delivered to waiters, not caused by them
    pub fn is_cancellation(&self) -> bool {
        matches!(self, MqttError::ConnectionLost | MqttError::ShuttingDown)
    }

    pub fn timeout(waiting_for: PacketType) -> Self {
        Self::Timeout { waiting_for }
    }
}
