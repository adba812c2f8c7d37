//! MQTT 3.1.1 client engine
//!
//! The module separates pure decisions from I/O:
//!
//! - [`connection`] - connection manager (session state machine, handshake, reconnect)
//! - [`correlation`] - matching broker acknowledgements to waiting requests
//! - [`message_handler`] - pure packet routing, forwarding of incoming messages
//! - [`health_monitor`] - pure state transitions and reconnect decisions
//! - [`publish_queue`] - bounded outbound FIFO and its worker
//! - [`client`] - the public [`MqttClient`] facade
//!
//! Per connection, a listener task reads and dispatches frames and a
//! keepalive task pings the broker. Per started client, one worker drains
//! the publish queue and at most one reconnect loop runs.
//!
//! # Usage
//!
//! ```rust,no_run
//! use homegear_mqtt::{MqttClient, MqttSettings};
//!
//! # tokio_test::block_on(async {
//! let settings = MqttSettings {
//!     enabled: true,
//!     broker_address: "localhost".to_string(),
//!     ..Default::default()
//! };
//!
//! let client = MqttClient::new(settings)?;
//! client.start().await?;
//! client.publish("c/d", "1", true);
//! client.stop().await;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! # });
//! ```

use std::sync::{Mutex, MutexGuard};

pub mod client;
pub mod connection;
pub mod correlation;
pub mod health_monitor;
mod keepalive;
mod listener;
pub mod message_handler;
pub mod publish_queue;

pub use client::MqttClient;
pub use connection::{build_connect_packet, ClientEvent, ConnectionState};
pub use correlation::{CorrelationKey, PacketIdAllocator, PendingResponse, RequestTable};
pub use health_monitor::{ConnectionEvent, HealthMetrics, HealthMonitor, ReconnectionDecision};
pub use message_handler::{EventRoute, IncomingMessage, MessageForwarder, MessageHandler};
pub use publish_queue::{OutboundMessage, PublishQueue, PushOutcome};

/// Lock a mutex whose data stays consistent even if a holder panicked
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
