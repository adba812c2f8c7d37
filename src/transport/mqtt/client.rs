//! Public MQTT client used by the Homegear core
//!
//! Publishing is fire-and-forget: calls validate and enqueue, then return.
//! Delivery, reconnection and keepalive happen on background tasks that
//! live from `start()` to `stop()`.

use super::connection::{ClientEvent, ConnectionState, Session};
use super::health_monitor::HealthMetrics;
use super::message_handler::{IncomingMessage, MessageForwarder};
use super::publish_queue::{self, OutboundMessage, PublishQueue, PushOutcome};
use super::lock;
use crate::config::MqttSettings;
use crate::error::MqttError;
use crate::observability::metrics::{ClientMetrics, MetricsSnapshot};
use crate::protocol::payload::{format_json, format_json_object, format_plain};
use crate::protocol::{validate_topic_name, TopicBuilder};
use crate::transport::{Connector, TcpConnector};
use bytes::Bytes;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

const EVENT_CHANNEL_CAPACITY: usize = 64;

struct Running {
    session: Arc<Session>,
    worker: JoinHandle<()>,
}

/// MQTT client for publishing Homegear state and receiving commands
pub struct MqttClient {
    settings: RwLock<Arc<MqttSettings>>,
    enabled: AtomicBool,
    connector: Option<Arc<dyn Connector>>,
    queue: Arc<PublishQueue>,
    forwarder: Arc<MessageForwarder>,
    events: broadcast::Sender<ClientEvent>,
    metrics: Arc<ClientMetrics>,
    /// Serializes start, stop and reload
    lifecycle: tokio::sync::Mutex<()>,
    running: Mutex<Option<Running>>,
}

impl MqttClient {
    /// Create a client connecting over TCP/TLS as configured
    pub fn new(settings: MqttSettings) -> Result<Self, MqttError> {
        Self::build(settings, None)
    }

    /// Create a client that opens its connections through `connector`
    pub fn with_connector(
        settings: MqttSettings,
        connector: Arc<dyn Connector>,
    ) -> Result<Self, MqttError> {
        Self::build(settings, Some(connector))
    }

    fn build(
        settings: MqttSettings,
        connector: Option<Arc<dyn Connector>>,
    ) -> Result<Self, MqttError> {
        let settings = settings.resolved()?;
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        Ok(Self {
            enabled: AtomicBool::new(settings.enabled),
            queue: Arc::new(PublishQueue::new(settings.queue_capacity)),
            settings: RwLock::new(Arc::new(settings)),
            connector,
            forwarder: Arc::new(MessageForwarder::new()),
            events,
            metrics: Arc::new(ClientMetrics::default()),
            lifecycle: tokio::sync::Mutex::new(()),
            running: Mutex::new(None),
        })
    }

    pub fn enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    /// Allow publishing and starting; does not connect by itself
    pub fn enable(&self) {
        self.enabled.store(true, Ordering::SeqCst);
    }

    /// Stop the client and turn every publish into a no-op
    pub async fn disable(&self) {
        self.enabled.store(false, Ordering::SeqCst);
        self.stop().await;
    }

    pub fn settings(&self) -> Arc<MqttSettings> {
        match self.settings.read() {
            Ok(settings) => Arc::clone(&settings),
            Err(poisoned) => Arc::clone(&poisoned.into_inner()),
        }
    }

    /// Start the background tasks; connecting continues in the background
    pub async fn start(&self) -> Result<(), MqttError> {
        let _lifecycle = self.lifecycle.lock().await;
        if !self.enabled() {
            info!("MQTT is disabled, not starting");
            return Err(MqttError::Disabled);
        }
        if lock(&self.running).is_some() {
            return Ok(());
        }

        let settings = self.settings();
        let connector: Arc<dyn Connector> = match &self.connector {
            Some(connector) => Arc::clone(connector),
            None => Arc::new(TcpConnector::from_settings(&settings)?),
        };
        let endpoint = connector.endpoint();

        let session = Session::new(
            Arc::clone(&settings),
            connector,
            Arc::clone(&self.forwarder),
            self.events.clone(),
            Arc::clone(&self.metrics),
        );
        session.start();
        let worker = tokio::spawn(publish_queue::run_worker(
            Arc::clone(&self.queue),
            Arc::clone(&session),
            self.events.clone(),
        ));

        *lock(&self.running) = Some(Running { session, worker });
        info!(broker = %endpoint, client_id = %settings.client_id, "MQTT client started");
        Ok(())
    }

    /// Disconnect and join every background task; queued messages are kept
    pub async fn stop(&self) {
        let _lifecycle = self.lifecycle.lock().await;
        let running = lock(&self.running).take();
        let Some(running) = running else {
            return;
        };

        running.session.stop().await;
        if let Err(e) = running.worker.await {
            if e.is_panic() {
                error!("Publish worker panicked: {}", e);
            }
        }
        info!(queued = self.queue.len(), "MQTT client stopped");
    }

    /// Stop, replace the settings, and start again if enabled
    pub async fn reload_settings(&self, settings: MqttSettings) -> Result<(), MqttError> {
        let settings = settings.resolved()?;
        self.stop().await;

        let trimmed = self.queue.set_capacity(settings.queue_capacity);
        if trimmed > 0 {
            warn!(dropped = trimmed, "Queue capacity reduced, dropped oldest messages");
        }
        self.enabled.store(settings.enabled, Ordering::SeqCst);
        match self.settings.write() {
            Ok(mut current) => *current = Arc::new(settings),
            Err(poisoned) => *poisoned.into_inner() = Arc::new(settings),
        }
        info!("MQTT settings reloaded");

        if self.enabled() {
            self.start().await
        } else {
            Ok(())
        }
    }

    /// Queue `payload` for `<prefix>/<topic>`
    pub fn publish(&self, topic: &str, payload: impl Into<Bytes>, retain: bool) {
        if !self.enabled() {
            return;
        }
        let settings = self.settings();
        let topic = TopicBuilder::new(&settings.topic_prefix).build(topic);
        self.enqueue(OutboundMessage {
            topic,
            payload: payload.into(),
            retain,
            qos: settings.qos_level(),
        });
    }

    /// Queue a text event using the configured retain flag
    pub fn publish_event(&self, topic: &str, payload: &str) {
        let retain = self.settings().retain_default;
        self.publish(topic, payload.to_string(), retain);
    }

    /// Publish one peer variable on its `plain` and `json` topics
    pub fn publish_value(&self, peer_id: u64, channel: i32, key: &str, value: &Value) {
        if !self.enabled() {
            return;
        }
        let settings = self.settings();
        let topics = TopicBuilder::new(&settings.topic_prefix);

        self.enqueue_value(
            &settings,
            topics.build_plain_topic(peer_id, channel, key),
            format_plain(value),
        );
        self.enqueue_value(
            &settings,
            topics.build_json_topic(peer_id, channel, key),
            format_json(value),
        );
    }

    /// Publish several variables of one channel, plus one `jsonobj` message
    pub fn publish_values(&self, peer_id: u64, channel: i32, keys: &[String], values: &[Value]) {
        if !self.enabled() {
            return;
        }
        if keys.len() != values.len() {
            warn!(
                peer_id,
                channel,
                "Not publishing {} key(s) with {} value(s)",
                keys.len(),
                values.len()
            );
            return;
        }
        if keys.is_empty() {
            return;
        }

        let settings = self.settings();
        let topics = TopicBuilder::new(&settings.topic_prefix);
        for (key, value) in keys.iter().zip(values) {
            self.enqueue_value(
                &settings,
                topics.build_plain_topic(peer_id, channel, key),
                format_plain(value),
            );
            self.enqueue_value(
                &settings,
                topics.build_json_topic(peer_id, channel, key),
                format_json(value),
            );
        }
        self.enqueue_value(
            &settings,
            topics.build_json_object_topic(peer_id, channel),
            format_json_object(keys, values),
        );
    }

    /// Receive messages arriving on the command subscription
    pub fn set_incoming_sender(&self, sender: mpsc::Sender<IncomingMessage>) {
        self.forwarder.set_sender(sender);
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ClientEvent> {
        self.events.subscribe()
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    pub fn connection_state(&self) -> ConnectionState {
        lock(&self.running)
            .as_ref()
            .map(|running| running.session.state())
            .unwrap_or(ConnectionState::Disconnected)
    }

    pub fn is_connected(&self) -> bool {
        self.connection_state() == ConnectionState::Connected
    }

    pub fn is_running(&self) -> bool {
        lock(&self.running).is_some()
    }

    pub fn health_metrics(&self) -> Option<HealthMetrics> {
        lock(&self.running)
            .as_ref()
            .map(|running| running.session.health_metrics())
    }

    /// Messages waiting to be sent
    pub fn queued_messages(&self) -> usize {
        self.queue.len()
    }

    /// Requests waiting for a broker acknowledgement
    pub fn pending_requests(&self) -> usize {
        lock(&self.running)
            .as_ref()
            .map(|running| running.session.pending_requests())
            .unwrap_or(0)
    }

    fn enqueue_value(&self, settings: &MqttSettings, topic: String, payload: String) {
        self.enqueue(OutboundMessage {
            topic,
            payload: Bytes::from(payload),
            retain: settings.retain_default,
            qos: settings.qos_level(),
        });
    }

    fn enqueue(&self, message: OutboundMessage) {
        if let Err(e) = validate_topic_name(&message.topic) {
            warn!(topic = %message.topic, "Not publishing: {}", e);
            return;
        }

        self.metrics.record_queued();
        match self.queue.push(message) {
            PushOutcome::Queued => {}
            PushOutcome::DroppedOldest { burst_started } => {
                self.metrics.record_dropped();
                if burst_started {
                    warn!(
                        capacity = self.queue.capacity(),
                        "Publish queue full, dropping oldest messages"
                    );
                }
            }
            PushOutcome::BurstEnded { dropped } => {
                warn!(dropped, "Publish queue overflow ended");
                let _ = self.events.send(ClientEvent::QueueOverflow { dropped });
            }
        }
    }
}

impl Drop for MqttClient {
    fn drop(&mut self) {
        let running = lock(&self.running).take();
        if let Some(running) = running {
            running.session.abort();
        }
    }
}
