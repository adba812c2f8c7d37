//! Bounded FIFO of outbound messages and the worker that drains it
//!
//! Producers never block: when the queue is full the oldest message is
//! dropped. The single worker sends messages strictly in order and only
//! while the session is connected. A message whose send or PUBACK fails is
//! put back at the head once; a second failure drops it.

use super::connection::{ClientEvent, Session};
use super::lock;
use crate::error::MqttError;
use crate::protocol::{Publish, QoS};
use bytes::Bytes;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tokio::sync::{broadcast, Notify};
use tracing::{debug, warn};

/// Sends per message before it is given up
pub const MAX_DELIVERY_ATTEMPTS: u8 = 2;

/// A message waiting to be published; `topic` already carries the prefix
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundMessage {
    pub topic: String,
    pub payload: Bytes,
    pub retain: bool,
    pub qos: QoS,
}

impl OutboundMessage {
    pub fn to_packet(&self, packet_id: Option<u16>) -> Publish {
        Publish {
            topic: self.topic.clone(),
            payload: self.payload.clone(),
            qos: self.qos,
            retain: self.retain,
            dup: false,
            packet_id,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct QueuedMessage {
    pub message: OutboundMessage,
    /// Failed sends so far
    pub attempts: u8,
}

/// What happened to the queue on `push`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    Queued,
    /// The queue was full and its oldest message was dropped
    DroppedOldest { burst_started: bool },
    /// Queued normally after an overflow burst of `dropped` messages
    BurstEnded { dropped: u64 },
}

#[derive(Default)]
struct QueueState {
    items: VecDeque<QueuedMessage>,
    burst_dropped: u64,
}

pub struct PublishQueue {
    state: Mutex<QueueState>,
    available: Notify,
    capacity: Mutex<usize>,
}

impl PublishQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            available: Notify::new(),
            capacity: Mutex::new(capacity.max(1)),
        }
    }

    pub fn capacity(&self) -> usize {
        *lock(&self.capacity)
    }

    /// Change the bound, dropping the oldest messages if it shrank
    pub fn set_capacity(&self, capacity: usize) -> usize {
        let capacity = capacity.max(1);
        *lock(&self.capacity) = capacity;

        let mut state = lock(&self.state);
        let excess = state.items.len().saturating_sub(capacity);
        state.items.drain(..excess);
        excess
    }

    pub fn push(&self, message: OutboundMessage) -> PushOutcome {
        let capacity = self.capacity();
        let outcome = {
            let mut state = lock(&self.state);
            let outcome = if state.items.len() >= capacity {
                state.items.pop_front();
                state.burst_dropped += 1;
                PushOutcome::DroppedOldest {
                    burst_started: state.burst_dropped == 1,
                }
            } else if state.burst_dropped > 0 {
                let dropped = std::mem::take(&mut state.burst_dropped);
                PushOutcome::BurstEnded { dropped }
            } else {
                PushOutcome::Queued
            };
            state.items.push_back(QueuedMessage {
                message,
                attempts: 0,
            });
            outcome
        };

        self.available.notify_one();
        outcome
    }

    /// Put a message back at the head; may exceed the bound by one
    pub fn requeue_front(&self, queued: QueuedMessage) {
        lock(&self.state).items.push_front(queued);
        self.available.notify_one();
    }

    /// Wait for and remove the oldest message
    pub async fn pop(&self) -> QueuedMessage {
        loop {
            let next = lock(&self.state).items.pop_front();
            if let Some(queued) = next {
                return queued;
            }
            self.available.notified().await;
        }
    }

    pub fn len(&self) -> usize {
        lock(&self.state).items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Topics in queue order
    pub fn topics(&self) -> Vec<String> {
        lock(&self.state)
            .items
            .iter()
            .map(|queued| queued.message.topic.clone())
            .collect()
    }
}

/// Drain `queue` through `session` until the session shuts down
pub(crate) async fn run_worker(
    queue: Arc<PublishQueue>,
    session: Arc<Session>,
    events: broadcast::Sender<ClientEvent>,
) {
    let shutdown = session.shutdown_token();

    loop {
        if session.wait_until_connected().await.is_err() {
            break;
        }

        let mut queued = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            queued = queue.pop() => queued,
        };

        match session.publish(&queued.message).await {
            Ok(()) => {
                session.metrics().record_published();
                debug!(target: "mqtt_transport", topic = %queued.message.topic, "Published");
            }
            // Never reached the wire
            Err(MqttError::NotConnected | MqttError::ShuttingDown) => {
                queue.requeue_front(queued);
            }
            Err(error) => {
                queued.attempts += 1;
                if queued.attempts < MAX_DELIVERY_ATTEMPTS {
                    warn!(topic = %queued.message.topic, "Publish failed, will retry after reconnect: {}", error);
                    queue.requeue_front(queued);
                } else {
                    warn!(topic = %queued.message.topic, "Publish failed again, dropping message: {}", error);
                    session.metrics().record_failed();
                    let _ = events.send(ClientEvent::DeliveryFailed {
                        topic: queued.message.topic,
                        reason: error.to_string(),
                    });
                }
            }
        }
    }

    debug!(target: "mqtt_transport", queued = queue.len(), "Publish worker stopped");
}
