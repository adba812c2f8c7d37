//! Per-client counters
//!
//! Every [`crate::MqttClient`] owns one [`ClientMetrics`]; counters survive
//! stop/start and settings reloads. Reads go through [`MetricsSnapshot`].

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Thread-safe counters using relaxed atomics
#[derive(Debug)]
pub struct ClientMetrics {
    connection_attempts: AtomicU64,
    connections_established: AtomicU64,
    reconnects: AtomicU64,
    messages_queued: AtomicU64,
    messages_published: AtomicU64,
    messages_dropped: AtomicU64,
    messages_failed: AtomicU64,
    messages_received: AtomicU64,
    pings_sent: AtomicU64,
    last_connected: AtomicU64,
    created: u64,
}

impl Default for ClientMetrics {
    fn default() -> Self {
        Self {
            connection_attempts: AtomicU64::new(0),
            connections_established: AtomicU64::new(0),
            reconnects: AtomicU64::new(0),
            messages_queued: AtomicU64::new(0),
            messages_published: AtomicU64::new(0),
            messages_dropped: AtomicU64::new(0),
            messages_failed: AtomicU64::new(0),
            messages_received: AtomicU64::new(0),
            pings_sent: AtomicU64::new(0),
            last_connected: AtomicU64::new(0),
            created: current_timestamp(),
        }
    }
}

impl ClientMetrics {
    pub fn record_connection_attempt(&self) {
        self.connection_attempts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_connection_established(&self) {
        self.connections_established.fetch_add(1, Ordering::Relaxed);
        self.last_connected
            .store(current_timestamp(), Ordering::Relaxed);
    }

    pub fn record_reconnect(&self) {
        self.reconnects.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_queued(&self) {
        self.messages_queued.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_published(&self) {
        self.messages_published.fetch_add(1, Ordering::Relaxed);
    }

    /// Dropped by queue overflow
    pub fn record_dropped(&self) {
        self.messages_dropped.fetch_add(1, Ordering::Relaxed);
    }

    /// Dropped after the retry budget ran out
    pub fn record_failed(&self) {
        self.messages_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_received(&self) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_ping(&self) {
        self.pings_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            connection_attempts: self.connection_attempts.load(Ordering::Relaxed),
            connections_established: self.connections_established.load(Ordering::Relaxed),
            reconnects: self.reconnects.load(Ordering::Relaxed),
            messages_queued: self.messages_queued.load(Ordering::Relaxed),
            messages_published: self.messages_published.load(Ordering::Relaxed),
            messages_dropped: self.messages_dropped.load(Ordering::Relaxed),
            messages_failed: self.messages_failed.load(Ordering::Relaxed),
            messages_received: self.messages_received.load(Ordering::Relaxed),
            pings_sent: self.pings_sent.load(Ordering::Relaxed),
            last_connected: self.last_connected.load(Ordering::Relaxed),
            uptime_seconds: current_timestamp().saturating_sub(self.created),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    pub connection_attempts: u64,
    pub connections_established: u64,
    pub reconnects: u64,
    pub messages_queued: u64,
    pub messages_published: u64,
    pub messages_dropped: u64,
    pub messages_failed: u64,
    pub messages_received: u64,
    pub pings_sent: u64,
    /// Unix seconds of the last successful handshake, 0 if none
    pub last_connected: u64,
    pub uptime_seconds: u64,
}

fn current_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_counters() {
        let metrics = ClientMetrics::default();
        metrics.record_connection_attempt();
        metrics.record_connection_attempt();
        metrics.record_connection_established();
        metrics.record_queued();
        metrics.record_published();
        metrics.record_dropped();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.connection_attempts, 2);
        assert_eq!(snapshot.connections_established, 1);
        assert_eq!(snapshot.messages_queued, 1);
        assert_eq!(snapshot.messages_published, 1);
        assert_eq!(snapshot.messages_dropped, 1);
        assert_eq!(snapshot.messages_failed, 0);
        assert!(snapshot.last_connected > 0);
    }

    #[test]
    fn test_thread_safety() {
        let metrics = Arc::new(ClientMetrics::default());

        let handles: Vec<_> = (0..10)
            .map(|_| {
                let metrics = Arc::clone(&metrics);
                thread::spawn(move || {
                    for _ in 0..100 {
                        metrics.record_queued();
                        metrics.record_published();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.messages_queued, 1000);
        assert_eq!(snapshot.messages_published, 1000);
    }

    #[test]
    fn test_snapshot_serializes() {
        let snapshot = ClientMetrics::default().snapshot();
        let json = serde_json::to_value(&snapshot).unwrap();
        assert_eq!(json["reconnects"], 0);
        assert!(json.get("pings_sent").is_some());
    }
}
