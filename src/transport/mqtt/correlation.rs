//! Request/response correlation
//!
//! Callers that need a broker acknowledgement register a key, send their
//! packet and then wait on the returned [`PendingResponse`]. The listener
//! task fulfills keys as acknowledgements arrive. Every registration is
//! resolved exactly once: by the matching response, by timeout, or by
//! [`RequestTable::fail_all`] when the connection goes away.
//!
//! Two maps are kept: one keyed by packet identifier (PUBACK, SUBACK) and
//! one keyed by control packet type for responses that carry no
//! identifier (CONNACK, PINGRESP).

use super::lock;
use crate::error::MqttError;
use crate::protocol::{Packet, PacketType};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, warn};

/// Highest packet identifier handed out; 0 is never used
pub const MAX_PACKET_ID: u16 = 32_767;

/// How a response is matched to its request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CorrelationKey {
    PacketId(u16),
    PacketType(PacketType),
}

type Outcome = Result<Packet, MqttError>;

struct Slot {
    token: u64,
    expects: PacketType,
    sender: oneshot::Sender<Outcome>,
}

/// Thread-safe table of in-flight requests
#[derive(Default)]
pub struct RequestTable {
    by_id: Mutex<HashMap<u16, Slot>>,
    by_type: Mutex<HashMap<PacketType, Slot>>,
    next_token: AtomicU64,
    closed: AtomicBool,
}

impl RequestTable {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register interest in a `expects` packet matched by `key`.
    ///
    /// Fails without touching the existing entry if `key` is already live.
    pub fn register(
        self: &Arc<Self>,
        key: CorrelationKey,
        expects: PacketType,
    ) -> Result<PendingResponse, MqttError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(MqttError::ShuttingDown);
        }

        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        let (sender, receiver) = oneshot::channel();
        let slot = Slot {
            token,
            expects,
            sender,
        };

        match key {
            CorrelationKey::PacketId(id) => {
                let mut map = lock(&self.by_id);
                if map.contains_key(&id) {
                    return Err(MqttError::PacketIdInUse(id));
                }
                map.insert(id, slot);
            }
            CorrelationKey::PacketType(packet_type) => {
                let mut map = lock(&self.by_type);
                if map.contains_key(&packet_type) {
                    return Err(MqttError::RequestTypeInUse(packet_type));
                }
                map.insert(packet_type, slot);
            }
        }

        Ok(PendingResponse {
            key,
            expects,
            token,
            receiver,
            table: Arc::clone(self),
        })
    }

    /// Deliver `packet` to whoever waits on `key`.
    ///
    /// Returns false when nobody does (e.g. an ack for a request that timed
    /// out or belonged to a previous connection); the packet is dropped.
    pub fn fulfill(&self, key: CorrelationKey, packet: Packet) -> bool {
        let slot = match key {
            CorrelationKey::PacketId(id) => take_matching(&mut lock(&self.by_id), &id, &packet),
            CorrelationKey::PacketType(packet_type) => {
                take_matching(&mut lock(&self.by_type), &packet_type, &packet)
            }
        };

        match slot {
            Some(slot) => slot.sender.send(Ok(packet)).is_ok(),
            None => {
                debug!(target: "mqtt_transport", "No waiter for {:?}, dropping {:?}", key, packet.packet_type());
                false
            }
        }
    }

    /// Resolve every live entry with an error built by `outcome`
    pub fn fail_all(&self, outcome: impl Fn() -> MqttError) -> usize {
        let by_id: Vec<Slot> = lock(&self.by_id).drain().map(|(_, slot)| slot).collect();
        let by_type: Vec<Slot> = lock(&self.by_type).drain().map(|(_, slot)| slot).collect();

        let count = by_id.len() + by_type.len();
        for slot in by_id.into_iter().chain(by_type) {
            let _ = slot.sender.send(Err(outcome()));
        }
        if count > 0 {
            debug!(target: "mqtt_transport", "Failed {} pending request(s)", count);
        }
        count
    }

    /// Refuse new registrations and wake every waiter with `ShuttingDown`
    pub fn close(&self) -> usize {
        self.closed.store(true, Ordering::SeqCst);
        self.fail_all(|| MqttError::ShuttingDown)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn pending_count(&self) -> usize {
        lock(&self.by_id).len() + lock(&self.by_type).len()
    }

    fn remove(&self, key: CorrelationKey, token: u64) {
        match key {
            CorrelationKey::PacketId(id) => remove_if_owned(&mut lock(&self.by_id), &id, token),
            CorrelationKey::PacketType(packet_type) => {
                remove_if_owned(&mut lock(&self.by_type), &packet_type, token)
            }
        }
    }
}

/// Handle held by the requesting task; dropping it unregisters the key
pub struct PendingResponse {
    key: CorrelationKey,
    expects: PacketType,
    token: u64,
    receiver: oneshot::Receiver<Outcome>,
    table: Arc<RequestTable>,
}

impl PendingResponse {
    pub fn key(&self) -> CorrelationKey {
        self.key
    }

    /// Wait for the response, giving up after `timeout`
    pub async fn wait(mut self, timeout: Duration) -> Result<Packet, MqttError> {
        match tokio::time::timeout(timeout, &mut self.receiver).await {
            Ok(Ok(outcome)) => outcome,
            // Sender dropped without an answer
            Ok(Err(_)) => Err(MqttError::ConnectionLost),
            Err(_) => {
                warn!(target: "mqtt_transport", "Timed out waiting for {:?} ({:?})", self.expects, self.key);
                Err(MqttError::timeout(self.expects))
            }
        }
    }
}

impl Drop for PendingResponse {
    fn drop(&mut self) {
        self.table.remove(self.key, self.token);
    }
}

/// Allocates packet identifiers 1..=MAX_PACKET_ID, wrapping and skipping 0
#[derive(Debug)]
pub struct PacketIdAllocator {
    next: AtomicU16,
}

impl Default for PacketIdAllocator {
    fn default() -> Self {
        Self {
            next: AtomicU16::new(1),
        }
    }
}

impl PacketIdAllocator {
    pub fn next_id(&self) -> u16 {
        self.next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |id| {
                Some(if id >= MAX_PACKET_ID { 1 } else { id + 1 })
            })
            .unwrap_or(1)
    }
}

fn take_matching<K: std::hash::Hash + Eq>(
    map: &mut HashMap<K, Slot>,
    key: &K,
    packet: &Packet,
) -> Option<Slot> {
    match map.get(key) {
        Some(slot) if slot.expects == packet.packet_type() => map.remove(key),
        Some(slot) => {
            warn!(
                target: "mqtt_transport",
                "Got {:?} for a request expecting {:?}, ignoring",
                packet.packet_type(),
                slot.expects
            );
            None
        }
        None => None,
    }
}

fn remove_if_owned<K: std::hash::Hash + Eq>(map: &mut HashMap<K, Slot>, key: &K, token: u64) {
    if map.get(key).is_some_and(|slot| slot.token == token) {
        map.remove(key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{ConnAck, ConnectReturnCode};

    fn puback(packet_id: u16) -> Packet {
        Packet::PubAck { packet_id }
    }

    #[tokio::test]
    async fn test_fulfill_wakes_waiter() {
        let table = RequestTable::new();
        let pending = table
            .register(CorrelationKey::PacketId(5), PacketType::PubAck)
            .unwrap();

        assert!(table.fulfill(CorrelationKey::PacketId(5), puback(5)));
        let response = pending.wait(Duration::from_secs(1)).await.unwrap();
        assert_eq!(response, puback(5));
        assert_eq!(table.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_response_before_wait_is_kept() {
        let table = RequestTable::new();
        let pending = table
            .register(CorrelationKey::PacketType(PacketType::PingResp), PacketType::PingResp)
            .unwrap();
        assert!(table.fulfill(
            CorrelationKey::PacketType(PacketType::PingResp),
            Packet::PingResp
        ));

        assert_eq!(
            pending.wait(Duration::from_millis(10)).await.unwrap(),
            Packet::PingResp
        );
    }

    #[tokio::test]
    async fn test_duplicate_registration_fails_without_corrupting_first() {
        let table = RequestTable::new();
        let first = table
            .register(CorrelationKey::PacketId(9), PacketType::PubAck)
            .unwrap();

        let second = table.register(CorrelationKey::PacketId(9), PacketType::PubAck);
        assert!(matches!(second, Err(MqttError::PacketIdInUse(9))));
        assert_eq!(table.pending_count(), 1);

        assert!(table.fulfill(CorrelationKey::PacketId(9), puback(9)));
        assert_eq!(first.wait(Duration::from_secs(1)).await.unwrap(), puback(9));
    }

    #[tokio::test]
    async fn test_duplicate_type_registration_fails() {
        let table = RequestTable::new();
        let _first = table
            .register(CorrelationKey::PacketType(PacketType::ConnAck), PacketType::ConnAck)
            .unwrap();
        assert!(matches!(
            table.register(CorrelationKey::PacketType(PacketType::ConnAck), PacketType::ConnAck),
            Err(MqttError::RequestTypeInUse(PacketType::ConnAck))
        ));
    }

    #[tokio::test]
    async fn test_timeout_frees_key() {
        let table = RequestTable::new();
        let pending = table
            .register(CorrelationKey::PacketId(1), PacketType::PubAck)
            .unwrap();

        let result = pending.wait(Duration::from_millis(20)).await;
        assert!(matches!(
            result,
            Err(MqttError::Timeout {
                waiting_for: PacketType::PubAck
            })
        ));
        assert_eq!(table.pending_count(), 0);

        // Late ack is dropped, the key is reusable
        assert!(!table.fulfill(CorrelationKey::PacketId(1), puback(1)));
        assert!(table
            .register(CorrelationKey::PacketId(1), PacketType::PubAck)
            .is_ok());
    }

    #[tokio::test]
    async fn test_unknown_key_is_dropped() {
        let table = RequestTable::new();
        assert!(!table.fulfill(CorrelationKey::PacketId(77), puback(77)));
    }

    #[tokio::test]
    async fn test_mismatched_packet_type_is_ignored() {
        let table = RequestTable::new();
        let pending = table
            .register(CorrelationKey::PacketId(3), PacketType::SubAck)
            .unwrap();

        assert!(!table.fulfill(CorrelationKey::PacketId(3), puback(3)));
        assert_eq!(table.pending_count(), 1);
        drop(pending);
        assert_eq!(table.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_fail_all_wakes_every_waiter() {
        let table = RequestTable::new();
        let a = table
            .register(CorrelationKey::PacketId(1), PacketType::PubAck)
            .unwrap();
        let b = table
            .register(CorrelationKey::PacketType(PacketType::PingResp), PacketType::PingResp)
            .unwrap();

        assert_eq!(table.fail_all(|| MqttError::ConnectionLost), 2);
        assert!(matches!(
            a.wait(Duration::from_secs(5)).await,
            Err(MqttError::ConnectionLost)
        ));
        assert!(matches!(
            b.wait(Duration::from_secs(5)).await,
            Err(MqttError::ConnectionLost)
        ));
        assert_eq!(table.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_stale_handle_does_not_remove_new_entry() {
        let table = RequestTable::new();
        let stale = table
            .register(CorrelationKey::PacketId(4), PacketType::PubAck)
            .unwrap();
        table.fail_all(|| MqttError::ConnectionLost);

        let fresh = table
            .register(CorrelationKey::PacketId(4), PacketType::PubAck)
            .unwrap();
        drop(stale);
        assert_eq!(table.pending_count(), 1, "fresh entry must survive");

        assert!(table.fulfill(CorrelationKey::PacketId(4), puback(4)));
        assert_eq!(fresh.wait(Duration::from_secs(1)).await.unwrap(), puback(4));
    }

    #[tokio::test]
    async fn test_close_rejects_new_registrations() {
        let table = RequestTable::new();
        let pending = table
            .register(CorrelationKey::PacketType(PacketType::ConnAck), PacketType::ConnAck)
            .unwrap();

        assert_eq!(table.close(), 1);
        assert!(table.is_closed());
        assert!(matches!(
            pending.wait(Duration::from_secs(5)).await,
            Err(MqttError::ShuttingDown)
        ));
        assert!(matches!(
            table.register(CorrelationKey::PacketId(1), PacketType::PubAck),
            Err(MqttError::ShuttingDown)
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_no_cross_talk_under_interleaved_delivery() {
        let table = RequestTable::new();
        let mut waiters = Vec::new();

        for id in 1..=200u16 {
            let pending = table
                .register(CorrelationKey::PacketId(id), PacketType::PubAck)
                .unwrap();
            waiters.push(tokio::spawn(async move {
                let response = pending.wait(Duration::from_secs(5)).await.unwrap();
                (id, response)
            }));
        }

        // Deliver in reverse, interleaved with unrelated type-keyed traffic
        let deliverer = {
            let table = Arc::clone(&table);
            tokio::spawn(async move {
                for id in (1..=200u16).rev() {
                    assert!(table.fulfill(CorrelationKey::PacketId(id), puback(id)));
                    table.fulfill(
                        CorrelationKey::PacketType(PacketType::ConnAck),
                        Packet::ConnAck(ConnAck {
                            session_present: false,
                            code: ConnectReturnCode::Accepted,
                        }),
                    );
                    tokio::task::yield_now().await;
                }
            })
        };

        for waiter in waiters {
            let (id, response) = waiter.await.unwrap();
            assert_eq!(response, puback(id), "waiter {id} got someone else's ack");
        }
        deliverer.await.unwrap();
        assert_eq!(table.pending_count(), 0);
    }

    #[test]
    fn test_packet_ids_wrap_and_skip_zero() {
        let allocator = PacketIdAllocator::default();
        assert_eq!(allocator.next_id(), 1);
        assert_eq!(allocator.next_id(), 2);

        let allocator = PacketIdAllocator {
            next: AtomicU16::new(MAX_PACKET_ID - 1),
        };
        assert_eq!(allocator.next_id(), MAX_PACKET_ID - 1);
        assert_eq!(allocator.next_id(), MAX_PACKET_ID);
        assert_eq!(allocator.next_id(), 1);
    }

    #[test]
    fn test_packet_ids_stay_in_range() {
        let allocator = PacketIdAllocator::default();
        for _ in 0..70_000 {
            let id = allocator.next_id();
            assert!((1..=MAX_PACKET_ID).contains(&id));
        }
    }
}
