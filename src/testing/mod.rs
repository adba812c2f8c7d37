//! Test support
//!
//! An in-process MQTT broker that speaks just enough of the protocol to
//! drive a client through handshakes, acknowledgements and failures, plus
//! small helpers shared by unit and integration tests.

use crate::config::{MqttSettings, TimeoutSettings};
use std::time::{Duration, Instant};

pub mod broker;

pub use broker::FakeBroker;

/// Settings pointing at a local broker with short timeouts
pub fn test_settings(port: u16) -> MqttSettings {
    MqttSettings {
        enabled: true,
        broker_address: "127.0.0.1".to_string(),
        broker_port: port,
        client_id: "homegear-test".to_string(),
        topic_prefix: "homegear/test".to_string(),
        keepalive_seconds: 30,
        timeouts: TimeoutSettings {
            connect_ms: 1000,
            ack_ms: 500,
            reconnect_delay_ms: 100,
            auth_failure_delay_ms: 300,
        },
        ..Default::default()
    }
}

/// Poll `condition` until it holds or `timeout` passes
pub async fn wait_until(timeout: Duration, condition: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
