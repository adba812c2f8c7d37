//! Homegear MQTT - MQTT 3.1.1 client engine
//!
//! Publishes device state and events of the Homegear controller to an MQTT
//! broker and receives commands back, without depending on an MQTT library.
//!
//! # Overview
//!
//! - Packet codec for the subset of MQTT 3.1.1 a client needs
//! - Long-lived TCP/TLS session with keepalive and automatic reconnect
//! - Bounded, ordered publish queue drained by a single worker
//! - Correlation of broker acknowledgements with the requests awaiting them
//!
//! # Quick Start
//!
//! ```rust
//! use homegear_mqtt::protocol::{Packet, Publish, QoS};
//! use homegear_mqtt::TopicBuilder;
//! use bytes::Bytes;
//!
//! let topics = TopicBuilder::new("homegear/1234");
//! let publish = Packet::Publish(Publish {
//!     topic: topics.build_plain_topic(12, 1, "STATE"),
//!     payload: Bytes::from_static(b"true"),
//!     qos: QoS::AtLeastOnce,
//!     retain: true,
//!     dup: false,
//!     packet_id: Some(1),
//! });
//!
//! let frame = publish.encode().unwrap();
//! let (decoded, used) = Packet::decode(&frame).unwrap().unwrap();
//! assert_eq!(used, frame.len());
//! assert_eq!(decoded, publish);
//! ```

pub mod config;
pub mod error;
pub mod observability;
pub mod protocol;
pub mod testing;
pub mod transport;

pub use config::{ConfigError, MqttSettings, TimeoutSettings};
pub use error::{MqttError, MqttResult};
pub use observability::{ClientMetrics, MetricsSnapshot};
pub use protocol::{TopicBuilder, TopicError};
pub use transport::mqtt::{ClientEvent, ConnectionState, IncomingMessage, MqttClient};
pub use transport::{Connector, TcpConnector};
