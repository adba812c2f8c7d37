//! Pure packet routing and forwarding of incoming command messages
//!
//! The listener decodes packets; this module decides what each one means.
//! Acknowledgements go to the correlation table, PUBLISH packets from the
//! broker go to the domain through [`MessageForwarder`], anything else a
//! broker must never send is a protocol violation.

use super::correlation::CorrelationKey;
use super::lock;
use crate::protocol::{Packet, PacketType, Publish};
use bytes::Bytes;
use std::sync::Mutex;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, warn};

/// Pure routing decisions for packets received from the broker
pub struct MessageHandler;

impl MessageHandler {
    /// Route a decoded packet (pure routing decision)
    pub fn route_packet(packet: Packet) -> EventRoute {
        match packet {
            Packet::ConnAck(_) => EventRoute::Response {
                key: CorrelationKey::PacketType(PacketType::ConnAck),
                packet,
            },
            Packet::PingResp => EventRoute::Response {
                key: CorrelationKey::PacketType(PacketType::PingResp),
                packet,
            },
            Packet::PubAck { packet_id } => EventRoute::Response {
                key: CorrelationKey::PacketId(packet_id),
                packet,
            },
            Packet::SubAck(ack) => EventRoute::Response {
                key: CorrelationKey::PacketId(ack.packet_id),
                packet: Packet::SubAck(ack),
            },
            Packet::Publish(publish) => EventRoute::MessageReceived(publish),
            // Client-to-broker packets
            other => EventRoute::ProtocolViolation(other.packet_type()),
        }
    }
}

/// Routing decisions for received packets
#[derive(Debug, Clone, PartialEq)]
pub enum EventRoute {
    /// Acknowledgement for a pending request
    Response { key: CorrelationKey, packet: Packet },
    /// Message published by the broker on a subscribed topic
    MessageReceived(Publish),
    /// Packet type a broker must not send
    ProtocolViolation(PacketType),
}

/// Message received on the command subscription
#[derive(Debug, Clone, PartialEq)]
pub struct IncomingMessage {
    pub topic: String,
    pub payload: Bytes,
    pub retain: bool,
}

impl IncomingMessage {
    /// Payload as text, if it is valid UTF-8
    pub fn payload_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.payload).ok()
    }
}

impl From<Publish> for IncomingMessage {
    fn from(publish: Publish) -> Self {
        Self {
            topic: publish.topic,
            payload: publish.payload,
            retain: publish.retain,
        }
    }
}

/// Hands incoming messages to the domain without ever blocking the listener
#[derive(Default)]
pub struct MessageForwarder {
    sender: Mutex<Option<mpsc::Sender<IncomingMessage>>>,
}

impl MessageForwarder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_sender(&self, sender: mpsc::Sender<IncomingMessage>) {
        *lock(&self.sender) = Some(sender);
    }

    pub fn clear_sender(&self) {
        *lock(&self.sender) = None;
    }

    /// Try to deliver; a full or missing channel drops the message
    pub fn forward(&self, message: IncomingMessage) -> bool {
        let sender = lock(&self.sender).clone();
        let Some(sender) = sender else {
            debug!("No receiver for incoming messages, dropping {}", message.topic);
            return false;
        };

        match sender.try_send(message) {
            Ok(()) => true,
            Err(TrySendError::Full(message)) => {
                warn!("Incoming message channel full, dropping {}", message.topic);
                false
            }
            Err(TrySendError::Closed(message)) => {
                warn!("Incoming message receiver gone, dropping {}", message.topic);
                false
            }
        }
    }
}
