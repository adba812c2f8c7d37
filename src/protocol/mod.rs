//! MQTT 3.1.1 wire protocol and Homegear topic/payload conventions
//!
//! Everything in this module is pure: packet encoding and decoding, topic
//! composition and payload formatting. No I/O happens here.

pub mod codec;
pub mod packets;
pub mod payload;
pub mod topics;

pub use codec::{CodecError, FixedHeader, PacketType, MAX_FIELD_LENGTH};
pub use packets::{
    ConnAck, Connect, ConnectReturnCode, Packet, Publish, QoS, SubAck, Subscribe,
};
pub use topics::{canonicalize_topic, validate_topic_name, TopicBuilder, TopicError};
