//! Scriptable in-process MQTT broker
//!
//! Accepts any number of clients on an ephemeral localhost port, records
//! every packet they send and answers according to toggles that tests flip
//! at runtime. Messages can be injected into all open connections.

use crate::protocol::{
    ConnAck, Connect, ConnectReturnCode, Packet, Publish, QoS, SubAck, Subscribe,
};
use crate::transport::mqtt::lock;
use bytes::{Buf, Bytes, BytesMut};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing::debug;

#[derive(Debug, Clone)]
struct Behavior {
    answer_connect: bool,
    connack_code: ConnectReturnCode,
    answer_pings: bool,
    answer_publishes: bool,
    drop_on_next_publish: bool,
    reject_subscribe: bool,
    close_after_subscribe: bool,
}

impl Default for Behavior {
    fn default() -> Self {
        Self {
            answer_connect: true,
            connack_code: ConnectReturnCode::Accepted,
            answer_pings: true,
            answer_publishes: true,
            drop_on_next_publish: false,
            reject_subscribe: false,
            close_after_subscribe: false,
        }
    }
}

#[derive(Debug, Default)]
struct Recorded {
    connects: Vec<Connect>,
    subscriptions: Vec<Subscribe>,
    publishes: Vec<Publish>,
    client_acks: Vec<u16>,
    pings: usize,
    disconnects: usize,
}

struct Shared {
    behavior: Mutex<Behavior>,
    recorded: Mutex<Recorded>,
    injected: broadcast::Sender<Bytes>,
    /// Cancelled to drop every open connection; replaced afterwards
    kill: Mutex<CancellationToken>,
    open_connections: AtomicUsize,
}

enum Reply {
    Nothing,
    Send(Packet),
    SendAndClose(Packet),
    Close,
}

impl Shared {
    fn handle(&self, packet: Packet) -> Reply {
        let behavior = lock(&self.behavior).clone();
        let mut recorded = lock(&self.recorded);

        match packet {
            Packet::Connect(connect) => {
                recorded.connects.push(connect);
                if !behavior.answer_connect {
                    return Reply::Nothing;
                }
                let connack = Packet::ConnAck(ConnAck {
                    session_present: false,
                    code: behavior.connack_code,
                });
                if behavior.connack_code == ConnectReturnCode::Accepted {
                    Reply::Send(connack)
                } else {
                    Reply::SendAndClose(connack)
                }
            }
            Packet::Subscribe(subscribe) => {
                let code = if behavior.reject_subscribe { 0x80 } else { 0x01 };
                let suback = SubAck {
                    packet_id: subscribe.packet_id,
                    return_codes: vec![code; subscribe.filters.len()],
                };
                recorded.subscriptions.push(subscribe);
                if behavior.close_after_subscribe {
                    Reply::SendAndClose(Packet::SubAck(suback))
                } else {
                    Reply::Send(Packet::SubAck(suback))
                }
            }
            Packet::Publish(publish) => {
                let packet_id = publish.packet_id;
                let qos = publish.qos;
                recorded.publishes.push(publish);
                if behavior.drop_on_next_publish {
                    lock(&self.behavior).drop_on_next_publish = false;
                    return Reply::Close;
                }
                match (qos, packet_id) {
                    (QoS::AtLeastOnce, Some(packet_id)) if behavior.answer_publishes => {
                        Reply::Send(Packet::PubAck { packet_id })
                    }
                    _ => Reply::Nothing,
                }
            }
            Packet::PubAck { packet_id } => {
                recorded.client_acks.push(packet_id);
                Reply::Nothing
            }
            Packet::PingReq => {
                recorded.pings += 1;
                if behavior.answer_pings {
                    Reply::Send(Packet::PingResp)
                } else {
                    Reply::Nothing
                }
            }
            Packet::Disconnect => {
                recorded.disconnects += 1;
                Reply::Close
            }
            _ => Reply::Nothing,
        }
    }
}

/// A broker bound to `127.0.0.1` on an ephemeral port; stops when dropped
pub struct FakeBroker {
    port: u16,
    shared: Arc<Shared>,
    shutdown: CancellationToken,
}

impl FakeBroker {
    pub async fn start() -> std::io::Result<Self> {
        Self::start_on(0).await
    }

    /// Bind a specific port, e.g. one a client is already retrying against
    pub async fn start_on(port: u16) -> std::io::Result<Self> {
        let listener = TcpListener::bind(("127.0.0.1", port)).await?;
        let port = listener.local_addr()?.port();
        let (injected, _) = broadcast::channel(64);
        let shared = Arc::new(Shared {
            behavior: Mutex::new(Behavior::default()),
            recorded: Mutex::new(Recorded::default()),
            injected,
            kill: Mutex::new(CancellationToken::new()),
            open_connections: AtomicUsize::new(0),
        });
        let shutdown = CancellationToken::new();

        tokio::spawn(accept_loop(listener, Arc::clone(&shared), shutdown.clone()));

        Ok(Self {
            port,
            shared,
            shutdown,
        })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Whether CONNECT is answered at all
    pub fn set_answer_connect(&self, answer: bool) {
        lock(&self.shared.behavior).answer_connect = answer;
    }

    /// Return code sent in CONNACK; anything but Accepted closes the connection
    pub fn set_connack_code(&self, code: ConnectReturnCode) {
        lock(&self.shared.behavior).connack_code = code;
    }

    pub fn set_answer_pings(&self, answer: bool) {
        lock(&self.shared.behavior).answer_pings = answer;
    }

    /// Whether QoS 1 publishes get a PUBACK
    pub fn set_answer_publishes(&self, answer: bool) {
        lock(&self.shared.behavior).answer_publishes = answer;
    }

    pub fn set_reject_subscribe(&self, reject: bool) {
        lock(&self.shared.behavior).reject_subscribe = reject;
    }

    /// Answer SUBSCRIBE, then close the connection right away
    pub fn set_close_after_subscribe(&self, close: bool) {
        lock(&self.shared.behavior).close_after_subscribe = close;
    }

    /// Record the next PUBLISH, then close its connection without a PUBACK
    pub fn drop_connection_on_next_publish(&self) {
        lock(&self.shared.behavior).drop_on_next_publish = true;
    }

    /// Deliver a PUBLISH to every open connection
    pub fn send_to_client(&self, publish: Publish) {
        if let Ok(frame) = Packet::Publish(publish).encode() {
            let _ = self.shared.injected.send(frame.freeze());
        }
    }

    /// Write raw bytes to every open connection
    pub fn send_raw(&self, bytes: &[u8]) {
        let _ = self.shared.injected.send(Bytes::copy_from_slice(bytes));
    }

    /// Close every open connection; the listener keeps accepting
    pub fn disconnect_clients(&self) {
        let mut kill = lock(&self.shared.kill);
        kill.cancel();
        *kill = CancellationToken::new();
    }

    /// Connections the broker has not yet seen closed
    pub fn open_connections(&self) -> usize {
        self.shared.open_connections.load(Ordering::SeqCst)
    }

    pub fn connects(&self) -> Vec<Connect> {
        lock(&self.shared.recorded).connects.clone()
    }

    pub fn connect_count(&self) -> usize {
        lock(&self.shared.recorded).connects.len()
    }

    /// All subscribed filters, in order
    pub fn subscriptions(&self) -> Vec<String> {
        lock(&self.shared.recorded)
            .subscriptions
            .iter()
            .flat_map(|subscribe| subscribe.filters.iter().map(|(filter, _)| filter.clone()))
            .collect()
    }

    pub fn publishes(&self) -> Vec<Publish> {
        lock(&self.shared.recorded).publishes.clone()
    }

    /// Packet identifiers the client acknowledged
    pub fn client_acks(&self) -> Vec<u16> {
        lock(&self.shared.recorded).client_acks.clone()
    }

    pub fn ping_count(&self) -> usize {
        lock(&self.shared.recorded).pings
    }

    pub fn disconnects(&self) -> usize {
        lock(&self.shared.recorded).disconnects
    }

    pub async fn wait_for_connects(&self, count: usize, timeout: Duration) -> bool {
        self.wait_for(timeout, |recorded| recorded.connects.len() >= count)
            .await
    }

    /// Wait until `count` publishes arrived and return all of them
    pub async fn wait_for_publishes(&self, count: usize, timeout: Duration) -> Vec<Publish> {
        self.wait_for(timeout, |recorded| recorded.publishes.len() >= count)
            .await;
        self.publishes()
    }

    pub async fn wait_for_subscriptions(&self, count: usize, timeout: Duration) -> bool {
        self.wait_for(timeout, |recorded| recorded.subscriptions.len() >= count)
            .await
    }

    async fn wait_for(&self, timeout: Duration, condition: impl Fn(&Recorded) -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if condition(&lock(&self.shared.recorded)) {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

impl Drop for FakeBroker {
    fn drop(&mut self) {
        self.shutdown.cancel();
        lock(&self.shared.kill).cancel();
    }
}

async fn accept_loop(listener: TcpListener, shared: Arc<Shared>, shutdown: CancellationToken) {
    loop {
        let accepted = tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => accepted,
        };
        match accepted {
            Ok((stream, peer)) => {
                debug!(%peer, "Fake broker accepted connection");
                let kill = lock(&shared.kill).clone();
                let injected = shared.injected.subscribe();
                tokio::spawn(serve(Arc::clone(&shared), stream, kill, injected));
            }
            Err(error) => {
                debug!("Fake broker accept failed: {}", error);
                break;
            }
        }
    }
}

async fn serve(
    shared: Arc<Shared>,
    stream: TcpStream,
    kill: CancellationToken,
    injected: broadcast::Receiver<Bytes>,
) {
    shared.open_connections.fetch_add(1, Ordering::SeqCst);
    serve_connection(&shared, stream, kill, injected).await;
    shared.open_connections.fetch_sub(1, Ordering::SeqCst);
}

async fn serve_connection(
    shared: &Shared,
    mut stream: TcpStream,
    kill: CancellationToken,
    mut injected: broadcast::Receiver<Bytes>,
) {
    let mut buffer = BytesMut::with_capacity(4096);

    loop {
        tokio::select! {
            _ = kill.cancelled() => return,
            frame = injected.recv() => match frame {
                Ok(frame) => {
                    if stream.write_all(&frame).await.is_err() {
                        return;
                    }
                }
                Err(RecvError::Lagged(_)) => {}
                Err(RecvError::Closed) => return,
            },
            read = stream.read_buf(&mut buffer) => {
                match read {
                    Ok(0) | Err(_) => return,
                    Ok(_) => {}
                }
                loop {
                    let (packet, used) = match Packet::decode(&buffer) {
                        Ok(Some(decoded)) => decoded,
                        Ok(None) => break,
                        Err(error) => {
                            debug!("Fake broker received garbage: {}", error);
                            return;
                        }
                    };
                    buffer.advance(used);

                    match shared.handle(packet) {
                        Reply::Nothing => {}
                        Reply::Send(reply) => {
                            if write_packet(&mut stream, &reply).await.is_err() {
                                return;
                            }
                        }
                        Reply::SendAndClose(reply) => {
                            let _ = write_packet(&mut stream, &reply).await;
                            return;
                        }
                        Reply::Close => return,
                    }
                }
            }
        }
    }
}

async fn write_packet(stream: &mut TcpStream, packet: &Packet) -> std::io::Result<()> {
    let frame = packet
        .encode()
        .map_err(|error| std::io::Error::new(std::io::ErrorKind::InvalidData, error))?;
    stream.write_all(&frame).await?;
    stream.flush().await
}
