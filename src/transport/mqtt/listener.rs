//! Listener task: reads the socket, decodes frames, dispatches packets
//!
//! One listener runs per connection. It never writes except through the
//! session's send mutex (PUBACK for incoming QoS 1 messages). Any read
//! error, EOF or undecodable frame ends the task and is reported once.

use super::connection::Session;
use crate::error::MqttError;
use crate::protocol::Packet;
use crate::transport::BoxedStream;
use bytes::{Buf, BytesMut};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, ReadHalf};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace};

const READ_BUFFER_SIZE: usize = 4096;

pub(crate) async fn run(
    session: Arc<Session>,
    mut reader: ReadHalf<BoxedStream>,
    epoch: u64,
    cancel: CancellationToken,
) {
    let mut buffer = BytesMut::with_capacity(READ_BUFFER_SIZE);

    loop {
        let read = tokio::select! {
            _ = cancel.cancelled() => {
                debug!(target: "mqtt_transport", epoch, "Listener stopped");
                return;
            }
            read = reader.read_buf(&mut buffer) => read,
        };

        let failure = match read {
            Ok(0) => Some(MqttError::Transport(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "connection closed by broker",
            ))),
            Ok(n) => {
                trace!(target: "mqtt_transport", epoch, "Read {} bytes", n);
                drain(&session, &mut buffer, &cancel).await.err()
            }
            Err(e) => Some(MqttError::Transport(e)),
        };

        if let Some(error) = failure {
            if cancel.is_cancelled() {
                return;
            }
            if matches!(error, MqttError::Codec(_) | MqttError::UnexpectedPacket(_)) {
                error!(epoch, "Protocol violation from broker: {}", error);
            }
            session.connection_failed(epoch, &error);
            return;
        }
    }
}

/// Dispatch every complete frame in `buffer`, keeping a trailing partial one
async fn drain(
    session: &Session,
    buffer: &mut BytesMut,
    cancel: &CancellationToken,
) -> Result<(), MqttError> {
    while let Some((packet, used)) = Packet::decode(buffer)? {
        if cancel.is_cancelled() {
            return Ok(());
        }
        buffer.advance(used);
        debug!(target: "mqtt_transport", "Received {:?}", packet.packet_type());
        session.dispatch(packet).await?;
    }
    Ok(())
}
