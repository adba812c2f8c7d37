//! Connection manager for one started client
//!
//! A [`Session`] owns the broker connection from `start()` to `stop()`:
//! it runs the connect/reconnect loop, holds the write half of the
//! transport behind the send mutex, and tracks which connection is live so
//! that failure reports from tasks of a replaced connection are ignored.
//!
//! Every established connection gets a fresh epoch and its own
//! cancellation token. Its listener and keepalive tasks report failures
//! with that epoch; the first report for the live epoch marks the
//! connection failed and, unless a reconnect loop is already running,
//! spawns exactly one.

use super::correlation::{CorrelationKey, PacketIdAllocator, PendingResponse, RequestTable};
use super::health_monitor::{ConnectionEvent, HealthMetrics, HealthMonitor, ReconnectionDecision};
use super::message_handler::{EventRoute, IncomingMessage, MessageForwarder, MessageHandler};
use super::publish_queue::OutboundMessage;
use super::{keepalive, listener, lock};
use crate::config::MqttSettings;
use crate::error::MqttError;
use crate::mqtt_span;
use crate::observability::metrics::ClientMetrics;
use crate::protocol::{
    ConnectReturnCode, Connect, Packet, PacketType, QoS, Subscribe, TopicBuilder,
};
use crate::transport::{BoxedStream, Connector};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::io::{AsyncWriteExt, WriteHalf};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Instrument};

/// Connection state as seen by callers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

/// Events broadcast to [`crate::MqttClient::subscribe_events`] receivers
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    StateChanged(ConnectionState),
    /// A message was dropped after its retry budget ran out
    DeliveryFailed { topic: String, reason: String },
    /// An overflow burst ended after dropping `dropped` queued messages
    QueueOverflow { dropped: u64 },
}

/// How often a fresh packet identifier is tried before giving up
const PACKET_ID_ATTEMPTS: usize = 16;

/// CONNECT packet for the configured identity (pure function)
pub fn build_connect_packet(settings: &MqttSettings) -> Connect {
    Connect {
        client_id: settings.client_id.clone(),
        keep_alive: settings.keepalive_seconds,
        clean_session: true,
        username: settings.username.clone(),
        password: settings.password.clone(),
    }
}

/// SUBSCRIBE packet for the command filter (pure function)
pub fn build_subscribe_packet(packet_id: u16, filter: &str) -> Subscribe {
    Subscribe {
        packet_id,
        filters: vec![(filter.to_string(), QoS::AtLeastOnce)],
    }
}

struct LiveConnection {
    epoch: u64,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
    failed: bool,
}

pub(crate) struct Session {
    settings: Arc<MqttSettings>,
    connector: Arc<dyn Connector>,
    topics: TopicBuilder,
    requests: Arc<RequestTable>,
    packet_ids: PacketIdAllocator,
    state_tx: watch::Sender<ConnectionState>,
    /// Send mutex: the only path to the socket's write side
    writer: tokio::sync::Mutex<Option<WriteHalf<BoxedStream>>>,
    /// Serializes connect attempts, teardown and stop
    transition: tokio::sync::Mutex<()>,
    connection: Mutex<Option<LiveConnection>>,
    next_epoch: AtomicU64,
    reconnecting: AtomicBool,
    reconnect_task: Mutex<Option<JoinHandle<()>>>,
    shutdown: CancellationToken,
    forwarder: Arc<MessageForwarder>,
    events: broadcast::Sender<ClientEvent>,
    metrics: Arc<ClientMetrics>,
    connected_at: Mutex<Option<Instant>>,
    last_packet_at: Mutex<Option<Instant>>,
}

impl Session {
    pub(crate) fn new(
        settings: Arc<MqttSettings>,
        connector: Arc<dyn Connector>,
        forwarder: Arc<MessageForwarder>,
        events: broadcast::Sender<ClientEvent>,
        metrics: Arc<ClientMetrics>,
    ) -> Arc<Self> {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        Arc::new(Self {
            topics: TopicBuilder::new(&settings.topic_prefix),
            settings,
            connector,
            requests: RequestTable::new(),
            packet_ids: PacketIdAllocator::default(),
            state_tx,
            writer: tokio::sync::Mutex::new(None),
            transition: tokio::sync::Mutex::new(()),
            connection: Mutex::new(None),
            next_epoch: AtomicU64::new(0),
            reconnecting: AtomicBool::new(false),
            reconnect_task: Mutex::new(None),
            shutdown: CancellationToken::new(),
            forwarder,
            events,
            metrics,
            connected_at: Mutex::new(None),
            last_packet_at: Mutex::new(None),
        })
    }

    /// Begin connecting in the background; returns immediately
    pub(crate) fn start(self: &Arc<Self>) {
        if self
            .reconnecting
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }
        let handle = tokio::spawn(Arc::clone(self).run_connection_loop(Duration::ZERO));
        *lock(&self.reconnect_task) = Some(handle);
    }

    /// Disconnect, wake every waiter and join every task of this session
    pub(crate) async fn stop(self: &Arc<Self>) {
        self.shutdown.cancel();
        let woken = self.requests.close();
        if woken > 0 {
            debug!(target: "mqtt_transport", "Woke {} waiter(s) for shutdown", woken);
        }

        let reconnect_task = lock(&self.reconnect_task).take();
        if let Some(task) = reconnect_task {
            join_task(task, "reconnect").await;
        }

        let _transition = self.transition.lock().await;
        if self.state() == ConnectionState::Connected {
            match self.send(&Packet::Disconnect).await {
                Ok(()) => debug!(target: "mqtt_transport", "DISCONNECT sent"),
                Err(e) => debug!(target: "mqtt_transport", "DISCONNECT not sent: {}", e),
            }
        }
        self.teardown().await;
        self.apply(ConnectionEvent::Stopped);
    }

    /// Cancel everything without waiting; used when the owner is dropped
    pub(crate) fn abort(&self) {
        self.shutdown.cancel();
        self.requests.close();
    }

    pub(crate) fn settings(&self) -> &MqttSettings {
        &self.settings
    }

    pub(crate) fn metrics(&self) -> &ClientMetrics {
        &self.metrics
    }

    pub(crate) fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub(crate) fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    pub(crate) fn pending_requests(&self) -> usize {
        self.requests.pending_count()
    }

    pub(crate) fn health_metrics(&self) -> HealthMetrics {
        HealthMonitor::calculate_health_metrics(
            *lock(&self.connected_at),
            *lock(&self.last_packet_at),
            self.metrics.snapshot().reconnects,
        )
    }

    /// Resolves once connected, or with `ShuttingDown` when the session stops
    pub(crate) async fn wait_until_connected(&self) -> Result<(), MqttError> {
        let mut state = self.state_tx.subscribe();
        tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => Err(MqttError::ShuttingDown),
            result = state.wait_for(|s| *s == ConnectionState::Connected) => {
                result.map(|_| ()).map_err(|_| MqttError::ShuttingDown)
            }
        }
    }

    /// Send one message on the live connection, waiting for PUBACK at QoS 1
    pub(crate) async fn publish(
        self: &Arc<Self>,
        message: &OutboundMessage,
    ) -> Result<(), MqttError> {
        if !HealthMonitor::can_publish(self.state()) {
            return Err(MqttError::NotConnected);
        }
        let epoch = self.live_epoch().ok_or(MqttError::NotConnected)?;

        let result = match message.qos {
            QoS::AtMostOnce => self.send(&Packet::Publish(message.to_packet(None))).await,
            QoS::AtLeastOnce => {
                let (packet_id, pending) = self.register_packet_id(PacketType::PubAck)?;
                match self
                    .send(&Packet::Publish(message.to_packet(Some(packet_id))))
                    .await
                {
                    Ok(()) => pending.wait(self.settings.timeouts.ack()).await.map(|_| ()),
                    Err(e) => Err(e),
                }
            }
        };

        if let Err(error) = &result {
            if error.requires_reconnect() {
                self.connection_failed(epoch, error);
            }
        }
        result
    }

    /// PINGREQ / PINGRESP round trip on connection `epoch`
    pub(crate) async fn ping(self: &Arc<Self>, epoch: u64) -> Result<(), MqttError> {
        self.metrics.record_ping();
        let result = self
            .request(
                Packet::PingReq,
                CorrelationKey::PacketType(PacketType::PingResp),
                PacketType::PingResp,
                self.settings.ping_deadline(),
            )
            .await
            .map(|_| ());

        if let Err(error) = &result {
            if error.requires_reconnect() {
                self.connection_failed(epoch, error);
            }
        }
        result
    }

    /// Handle one packet decoded by the listener
    pub(crate) async fn dispatch(&self, packet: Packet) -> Result<(), MqttError> {
        *lock(&self.last_packet_at) = Some(Instant::now());

        match MessageHandler::route_packet(packet) {
            EventRoute::Response { key, packet } => {
                self.requests.fulfill(key, packet);
                Ok(())
            }
            EventRoute::MessageReceived(publish) => {
                if let Some(packet_id) = publish.packet_id {
                    self.send(&Packet::PubAck { packet_id }).await?;
                }
                self.metrics.record_received();
                self.forwarder.forward(IncomingMessage::from(publish));
                Ok(())
            }
            EventRoute::ProtocolViolation(packet_type) => {
                Err(MqttError::UnexpectedPacket(packet_type))
            }
        }
    }

    /// Report that connection `epoch` is unusable.
    ///
    /// Only the first report for the live connection has any effect.
    pub(crate) fn connection_failed(self: &Arc<Self>, epoch: u64, reason: &MqttError) {
        if self.shutdown.is_cancelled() {
            return;
        }

        let mut connection = lock(&self.connection);
        match connection.as_mut() {
            Some(live) if live.epoch == epoch && !live.failed => {
                live.failed = true;
                // Nothing more is read or acknowledged on a failed connection
                live.cancel.cancel();
            }
            _ => {
                debug!(target: "mqtt_transport", epoch, "Ignoring stale failure report: {}", reason);
                return;
            }
        }

        warn!(epoch, "MQTT connection failed: {}", reason);
        self.requests.fail_all(|| MqttError::ConnectionLost);
        self.apply(ConnectionEvent::ConnectionLost);

        // Checked under the connection lock so a finishing loop cannot miss this failure
        if self
            .reconnecting
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            self.metrics.record_reconnect();
            let delay = self.settings.timeouts.reconnect_delay();
            let handle = tokio::spawn(Arc::clone(self).run_connection_loop(delay));
            *lock(&self.reconnect_task) = Some(handle);
        }
    }

    async fn run_connection_loop(self: Arc<Self>, first_delay: Duration) {
        let endpoint = self.connector.endpoint();
        let mut delay = first_delay;
        let mut attempt = 0u32;

        loop {
            self.close_failed_connection().await;
            if !delay.is_zero() {
                tokio::select! {
                    _ = self.shutdown.cancelled() => break,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
            attempt += 1;

            let result = {
                let _transition = self.transition.lock().await;
                if self.shutdown.is_cancelled() {
                    break;
                }
                let span = mqtt_span!(operation = "connect", broker = %endpoint, attempt);
                let result = self.establish().instrument(span).await;
                if result.is_err() {
                    self.teardown().await;
                    self.apply(ConnectionEvent::AttemptFailed);
                }
                result
            };

            let error = match result {
                Ok(()) if self.finish_connection_loop() => break,
                Ok(()) => {
                    debug!(target: "mqtt_transport", "Connection failed right after handshake");
                    self.metrics.record_reconnect();
                    MqttError::ConnectionLost
                }
                Err(error) => error,
            };

            match &error {
                MqttError::ConnectionRefused(code) => {
                    HealthMonitor::log_connack_refusal(*code, &endpoint)
                }
                MqttError::ShuttingDown => break,
                other => warn!(broker = %endpoint, attempt, "Connection attempt failed: {}", other),
            }

            match HealthMonitor::should_attempt_reconnection(
                attempt,
                Some(&error),
                &self.settings.timeouts,
                self.shutdown.is_cancelled(),
            ) {
                ReconnectionDecision::Proceed { attempt: next, delay: next_delay } => {
                    info!(broker = %endpoint, "Connection attempt {} in {:?}", next, next_delay);
                    self.apply(ConnectionEvent::RetryScheduled);
                    delay = next_delay;
                }
                ReconnectionDecision::AbortShutdownRequested => break,
            }
        }

        self.reconnecting.store(false, Ordering::SeqCst);
    }

    /// Close the socket of a connection that was reported failed
    async fn close_failed_connection(&self) {
        let _transition = self.transition.lock().await;
        let failed = lock(&self.connection)
            .as_ref()
            .is_some_and(|live| live.failed);
        if failed {
            self.teardown().await;
        }
    }

    /// Clear the reconnecting flag unless the new connection already failed
    fn finish_connection_loop(&self) -> bool {
        let connection = lock(&self.connection);
        if connection.as_ref().is_some_and(|live| live.failed) {
            return false;
        }
        self.reconnecting.store(false, Ordering::SeqCst);
        true
    }

    /// Open the transport, CONNECT, SUBSCRIBE, then start keepalive
    async fn establish(self: &Arc<Self>) -> Result<(), MqttError> {
        self.teardown().await;
        self.apply(ConnectionEvent::AttemptStarted);
        self.metrics.record_connection_attempt();

        let timeouts = &self.settings.timeouts;
        let stream = tokio::select! {
            _ = self.shutdown.cancelled() => return Err(MqttError::ShuttingDown),
            result = tokio::time::timeout(timeouts.connect(), self.connector.connect()) => {
                result.map_err(|_| {
                    MqttError::ConnectFailed(format!(
                        "no connection to {} within {:?}",
                        self.connector.endpoint(),
                        timeouts.connect()
                    ))
                })??
            }
        };

        let (reader, writer) = tokio::io::split(stream);
        *self.writer.lock().await = Some(writer);

        let epoch = self.next_epoch.fetch_add(1, Ordering::SeqCst) + 1;
        let cancel = self.shutdown.child_token();
        // The listener must run before CONNECT goes out so it can deliver CONNACK
        let listener = tokio::spawn(listener::run(
            Arc::clone(self),
            reader,
            epoch,
            cancel.clone(),
        ));
        *lock(&self.connection) = Some(LiveConnection {
            epoch,
            cancel: cancel.clone(),
            tasks: vec![listener],
            failed: false,
        });

        let response = self
            .request(
                Packet::Connect(build_connect_packet(&self.settings)),
                CorrelationKey::PacketType(PacketType::ConnAck),
                PacketType::ConnAck,
                timeouts.connect(),
            )
            .await?;
        match response {
            Packet::ConnAck(ack) if ack.code == ConnectReturnCode::Accepted => {
                debug!(target: "mqtt_transport", epoch, session_present = ack.session_present, "CONNACK accepted");
            }
            Packet::ConnAck(ack) => return Err(MqttError::ConnectionRefused(ack.code)),
            other => return Err(MqttError::UnexpectedPacket(other.packet_type())),
        }

        self.subscribe_commands().await?;

        // Checked under the connection lock: a failure reported during the
        // handshake must not be followed by Connected
        let mut connection = lock(&self.connection);
        let live = match connection.as_mut() {
            Some(live) if live.epoch == epoch && !live.failed => live,
            _ => return Err(MqttError::ConnectionLost),
        };
        live.tasks.push(tokio::spawn(keepalive::run(Arc::clone(self), epoch, cancel)));
        *lock(&self.connected_at) = Some(Instant::now());
        self.metrics.record_connection_established();
        self.apply(ConnectionEvent::HandshakeComplete);
        Ok(())
    }

    async fn subscribe_commands(&self) -> Result<(), MqttError> {
        let filter = self.topics.build_command_filter(&self.settings.command_topic);
        let (packet_id, pending) = self.register_packet_id(PacketType::SubAck)?;
        self.send(&Packet::Subscribe(build_subscribe_packet(packet_id, &filter)))
            .await?;

        match pending.wait(self.settings.timeouts.ack()).await? {
            Packet::SubAck(ack) if ack.is_success() => {
                info!(filter = %filter, "Subscribed to command topic");
                Ok(())
            }
            Packet::SubAck(_) => Err(MqttError::SubscribeRejected { topic: filter }),
            other => Err(MqttError::UnexpectedPacket(other.packet_type())),
        }
    }

    /// Close the current connection, join its tasks and fail its waiters
    async fn teardown(&self) {
        let live = lock(&self.connection).take();
        if let Some(live) = &live {
            live.cancel.cancel();
        }
        self.requests.fail_all(|| MqttError::ConnectionLost);

        let writer = self.writer.lock().await.take();
        if let Some(mut writer) = writer {
            let _ = tokio::time::timeout(self.settings.timeouts.ack(), writer.shutdown()).await;
        }

        if let Some(live) = live {
            for task in live.tasks {
                join_task(task, "connection").await;
            }
            debug!(target: "mqtt_transport", epoch = live.epoch, "Connection closed");
        }
        *lock(&self.connected_at) = None;
    }

    /// Register first, then send, then wait; the response cannot be missed
    async fn request(
        &self,
        packet: Packet,
        key: CorrelationKey,
        expects: PacketType,
        timeout: Duration,
    ) -> Result<Packet, MqttError> {
        let pending = self.requests.register(key, expects)?;
        self.send(&packet).await?;
        pending.wait(timeout).await
    }

    fn register_packet_id(
        &self,
        expects: PacketType,
    ) -> Result<(u16, PendingResponse), MqttError> {
        for _ in 0..PACKET_ID_ATTEMPTS {
            let packet_id = self.packet_ids.next_id();
            match self
                .requests
                .register(CorrelationKey::PacketId(packet_id), expects)
            {
                Ok(pending) => return Ok((packet_id, pending)),
                Err(MqttError::PacketIdInUse(_)) => continue,
                Err(e) => return Err(e),
            }
        }
        Err(MqttError::Congested)
    }

    /// Write one whole frame while holding the send mutex
    pub(crate) async fn send(&self, packet: &Packet) -> Result<(), MqttError> {
        let frame = packet.encode()?;
        let mut writer = self.writer.lock().await;
        let stream = writer.as_mut().ok_or(MqttError::NotConnected)?;

        let write = async {
            stream.write_all(&frame).await?;
            stream.flush().await
        };
        match tokio::time::timeout(self.settings.timeouts.ack(), write).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(MqttError::Transport(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    "write to broker timed out",
                )))
            }
        }

        debug!(target: "mqtt_transport", "Sent {:?} ({} bytes)", packet.packet_type(), frame.len());
        Ok(())
    }

    fn live_epoch(&self) -> Option<u64> {
        lock(&self.connection)
            .as_ref()
            .filter(|live| !live.failed)
            .map(|live| live.epoch)
    }

    fn apply(&self, event: ConnectionEvent) {
        let mut transition = None;
        self.state_tx.send_if_modified(|state| {
            let next = HealthMonitor::determine_next_state(*state, event);
            if next == *state {
                return false;
            }
            transition = Some((*state, next));
            *state = next;
            true
        });

        if let Some((from, to)) = transition {
            HealthMonitor::log_state_transition(from, to);
            let _ = self.events.send(ClientEvent::StateChanged(to));
        }
    }
}

async fn join_task(task: JoinHandle<()>, name: &str) {
    if let Err(e) = task.await {
        if e.is_panic() {
            error!("MQTT {} task panicked: {}", name, e);
        }
    }
}
