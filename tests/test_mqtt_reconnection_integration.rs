//! Integration tests for connection failures and recovery
//!
//! Tests failure handling against the fake broker:
//! - Connection dropped in the middle of a publish
//! - Withheld PUBACK and the single-retry budget
//! - Missing PINGRESP
//! - Failed connections are closed at once, not when the next attempt starts
//! - Broker closing the socket right after SUBACK
//! - CONNACK refusals and the authentication backoff
//! - Garbage from the broker
//! - Stop while a publish waits for its acknowledgement

use bytes::Bytes;
use homegear_mqtt::protocol::{ConnectReturnCode, Publish, QoS};
use homegear_mqtt::testing::{test_settings, wait_until, FakeBroker};
use homegear_mqtt::{ClientEvent, ConnectionState, MqttClient, MqttSettings};
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, mpsc};

const WAIT: Duration = Duration::from_secs(5);

async fn connected_client(settings: MqttSettings) -> MqttClient {
    let client = MqttClient::new(settings).expect("valid settings");
    client.start().await.expect("client starts");
    assert!(
        wait_until(WAIT, || client.is_connected()).await,
        "client should connect to the fake broker"
    );
    client
}

fn count_topic(broker: &FakeBroker, topic: &str) -> usize {
    broker
        .publishes()
        .iter()
        .filter(|publish| publish.topic == topic)
        .count()
}

async fn next_delivery_failure(events: &mut broadcast::Receiver<ClientEvent>) -> (String, String) {
    loop {
        match events.recv().await {
            Ok(ClientEvent::DeliveryFailed { topic, reason }) => return (topic, reason),
            Ok(_) => continue,
            Err(broadcast::error::RecvError::Lagged(_)) => continue,
            Err(broadcast::error::RecvError::Closed) => panic!("event channel closed"),
        }
    }
}

#[tokio::test]
async fn test_reconnects_after_drop_mid_publish() {
    let broker = FakeBroker::start().await.unwrap();
    let client = connected_client(test_settings(broker.port())).await;

    broker.drop_connection_on_next_publish();
    client.publish("c/d", "1", true);

    assert!(broker.wait_for_connects(2, WAIT).await);
    assert!(wait_until(WAIT, || client.metrics().messages_published == 1).await);

    // Resubscribed on the new connection
    assert_eq!(
        broker.subscriptions(),
        vec!["homegear/test/set/#", "homegear/test/set/#"]
    );
    // The broker sees the message at most twice
    assert_eq!(count_topic(&broker, "homegear/test/c/d"), 2);
    assert_eq!(client.metrics().reconnects, 1);
    assert_eq!(client.metrics().messages_failed, 0);
    assert!(broker.publishes().iter().all(|publish| publish.retain));

    client.stop().await;
}

#[tokio::test]
async fn test_withheld_puback_drops_message_after_retry() {
    let broker = FakeBroker::start().await.unwrap();
    broker.set_answer_publishes(false);
    let client = connected_client(test_settings(broker.port())).await;
    let mut events = client.subscribe_events();

    client.publish("c/d", "1", false);

    let (topic, reason) = tokio::time::timeout(WAIT, next_delivery_failure(&mut events))
        .await
        .expect("delivery failure should be reported");
    assert_eq!(topic, "homegear/test/c/d");
    assert!(reason.contains("PubAck"), "unexpected reason: {reason}");

    assert_eq!(count_topic(&broker, "homegear/test/c/d"), 2);
    assert_eq!(client.metrics().messages_failed, 1);
    assert_eq!(client.metrics().messages_published, 0);

    // A timeout is a connection failure, so the client keeps reconnecting
    broker.set_answer_publishes(true);
    assert!(wait_until(WAIT, || client.is_connected()).await);
    client.publish("after", "2", false);
    assert!(wait_until(WAIT, || client.metrics().messages_published == 1).await);
    assert_eq!(count_topic(&broker, "homegear/test/c/d"), 2);

    client.stop().await;
}

#[tokio::test]
async fn test_missing_pingresp_reconnects_once() {
    let broker = FakeBroker::start().await.unwrap();
    broker.set_answer_pings(false);
    let mut settings = test_settings(broker.port());
    settings.keepalive_seconds = 1;
    let client = connected_client(settings).await;

    assert!(broker.wait_for_connects(2, WAIT).await);
    broker.set_answer_pings(true);
    assert!(wait_until(WAIT, || client.is_connected()).await);

    // Two healthy keepalive rounds on the new connection
    tokio::time::sleep(Duration::from_millis(2500)).await;
    assert_eq!(broker.connect_count(), 2);
    assert!(client.is_connected());

    let snapshot = client.metrics();
    assert_eq!(snapshot.reconnects, 1);
    assert!(snapshot.pings_sent >= 3, "pings sent: {}", snapshot.pings_sent);

    client.stop().await;
}

#[tokio::test]
async fn test_failed_connection_is_closed_before_reconnect_delay() {
    let broker = FakeBroker::start().await.unwrap();
    broker.set_answer_pings(false);
    let mut settings = test_settings(broker.port());
    settings.keepalive_seconds = 1;
    settings.timeouts.reconnect_delay_ms = 4000;

    let client = MqttClient::new(settings).unwrap();
    let (tx, mut rx) = mpsc::channel(8);
    client.set_incoming_sender(tx);
    client.start().await.unwrap();
    assert!(wait_until(WAIT, || client.is_connected()).await);

    assert!(
        wait_until(WAIT, || {
            client.connection_state() == ConnectionState::Reconnecting
        })
        .await
    );
    // Closed long before the next attempt is due
    assert!(wait_until(Duration::from_secs(1), || broker.open_connections() == 0).await);

    broker.send_to_client(Publish {
        topic: "homegear/test/set/12/1/STATE".to_string(),
        payload: Bytes::from_static(b"true"),
        qos: QoS::AtLeastOnce,
        retain: false,
        dup: false,
        packet_id: Some(9),
    });
    tokio::time::sleep(Duration::from_millis(300)).await;

    assert!(rx.try_recv().is_err(), "command forwarded from a failed connection");
    assert!(broker.client_acks().is_empty());
    assert_eq!(client.metrics().messages_received, 0);
    assert_eq!(broker.connect_count(), 1);

    client.stop().await;
}

#[tokio::test]
async fn test_close_right_after_suback_leaves_connected_state() {
    let broker = FakeBroker::start().await.unwrap();
    broker.set_close_after_subscribe(true);
    let mut settings = test_settings(broker.port());
    settings.timeouts.reconnect_delay_ms = 2000;
    let client = MqttClient::new(settings).unwrap();
    client.start().await.unwrap();

    assert!(broker.wait_for_subscriptions(1, WAIT).await);
    assert!(
        wait_until(WAIT, || {
            client.connection_state() == ConnectionState::Reconnecting
        })
        .await
    );

    // Waits out the reconnect delay instead of retrying in a loop
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert!(!client.is_connected());
    assert_eq!(client.metrics().connection_attempts, 1);
    assert_eq!(broker.connect_count(), 1);

    broker.set_close_after_subscribe(false);
    assert!(wait_until(WAIT, || client.is_connected()).await);
    assert_eq!(broker.connect_count(), 2);

    client.stop().await;
}

#[tokio::test]
async fn test_auth_refusal_uses_longer_backoff() {
    let broker = FakeBroker::start().await.unwrap();
    broker.set_connack_code(ConnectReturnCode::NotAuthorized);
    let client = MqttClient::new(test_settings(broker.port())).unwrap();
    client.start().await.unwrap();

    assert!(broker.wait_for_connects(1, WAIT).await);
    let first = Instant::now();
    assert!(broker.wait_for_connects(2, WAIT).await);
    let gap = first.elapsed();

    // auth_failure_delay_ms is 300, reconnect_delay_ms only 100
    assert!(gap >= Duration::from_millis(250), "retried after {gap:?}");
    assert!(!client.is_connected());

    broker.set_connack_code(ConnectReturnCode::Accepted);
    assert!(wait_until(WAIT, || client.is_connected()).await);

    client.stop().await;
}

#[tokio::test]
async fn test_server_unavailable_uses_normal_backoff() {
    let broker = FakeBroker::start().await.unwrap();
    broker.set_connack_code(ConnectReturnCode::ServerUnavailable);
    let client = MqttClient::new(test_settings(broker.port())).unwrap();
    client.start().await.unwrap();

    assert!(broker.wait_for_connects(3, WAIT).await);
    assert!(!client.is_connected());

    broker.set_connack_code(ConnectReturnCode::Accepted);
    assert!(wait_until(WAIT, || client.is_connected()).await);

    client.stop().await;
}

#[tokio::test]
async fn test_rejected_subscription_reconnects() {
    let broker = FakeBroker::start().await.unwrap();
    broker.set_reject_subscribe(true);
    let client = MqttClient::new(test_settings(broker.port())).unwrap();
    client.start().await.unwrap();

    assert!(broker.wait_for_connects(2, WAIT).await);
    assert!(!client.is_connected());

    broker.set_reject_subscribe(false);
    assert!(wait_until(WAIT, || client.is_connected()).await);

    client.stop().await;
}

#[tokio::test]
async fn test_invalid_packet_from_broker_reconnects() {
    let broker = FakeBroker::start().await.unwrap();
    let client = connected_client(test_settings(broker.port())).await;

    // Packet type 15 is reserved in MQTT 3.1.1
    broker.send_raw(&[0xF0, 0x00]);

    assert!(broker.wait_for_connects(2, WAIT).await);
    assert!(wait_until(WAIT, || client.is_connected()).await);
    assert_eq!(client.metrics().reconnects, 1);

    client.stop().await;
}

#[tokio::test]
async fn test_broker_disconnect_reconnects_and_keeps_order() {
    let broker = FakeBroker::start().await.unwrap();
    let client = connected_client(test_settings(broker.port())).await;

    broker.disconnect_clients();
    for i in 0..5 {
        client.publish(&format!("during/{i}"), "x", false);
    }

    assert!(broker.wait_for_connects(2, WAIT).await);
    assert!(wait_until(WAIT, || client.metrics().messages_published == 5).await);

    let topics: Vec<String> = broker
        .publishes()
        .into_iter()
        .map(|publish| publish.topic)
        .filter(|topic| topic.starts_with("homegear/test/during/"))
        .collect();
    let mut deduplicated = topics.clone();
    deduplicated.dedup();
    assert_eq!(
        deduplicated,
        (0..5)
            .map(|i| format!("homegear/test/during/{i}"))
            .collect::<Vec<_>>()
    );

    client.stop().await;
}

#[tokio::test]
async fn test_stop_while_waiting_for_puback_returns_promptly() {
    let broker = FakeBroker::start().await.unwrap();
    broker.set_answer_publishes(false);
    let mut settings = test_settings(broker.port());
    settings.timeouts.ack_ms = 5000;
    let client = connected_client(settings).await;

    client.publish("slow", "1", false);
    assert_eq!(broker.wait_for_publishes(1, WAIT).await.len(), 1);
    assert!(wait_until(WAIT, || client.pending_requests() == 1).await);

    let started = Instant::now();
    client.stop().await;
    assert!(
        started.elapsed() < Duration::from_secs(2),
        "stop took {:?}",
        started.elapsed()
    );

    // The interrupted message stays queued for the next start
    assert_eq!(client.queued_messages(), 1);
    assert_eq!(client.pending_requests(), 0);
    assert_eq!(client.metrics().messages_failed, 0);
}
