//! Byte-stream transport to the broker
//!
//! The connection manager only sees a [`BoxedStream`] produced by a
//! [`Connector`]. Production code uses [`TcpConnector`] (plain TCP or TLS);
//! tests may plug in anything that yields an async byte stream.

use crate::config::MqttSettings;
use crate::error::MqttError;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::TlsConnector;
use tracing::debug;

pub mod mqtt;
pub mod tls;

/// Anything the client can read MQTT frames from and write them to
pub trait ByteStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T> ByteStream for T where T: AsyncRead + AsyncWrite + Unpin + Send {}

pub type BoxedStream = Box<dyn ByteStream>;

/// Opens a fresh stream to the broker for every connection attempt
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self) -> Result<BoxedStream, MqttError>;

    /// Human-readable endpoint for logs
    fn endpoint(&self) -> String;
}

/// TCP connector with optional TLS
pub struct TcpConnector {
    host: String,
    port: u16,
    tls: Option<(TlsConnector, ServerName<'static>)>,
}

impl TcpConnector {
    pub fn plain(host: &str, port: u16) -> Self {
        Self {
            host: host.to_string(),
            port,
            tls: None,
        }
    }

    /// Build from settings, loading TLS trust material up front so bad
    /// paths are reported at start instead of on every reconnect
    pub fn from_settings(settings: &MqttSettings) -> Result<Self, MqttError> {
        let mut connector = Self::plain(&settings.broker_address, settings.broker_port);

        if settings.use_tls {
            let ca_file = settings
                .ca_file
                .as_deref()
                .ok_or_else(|| MqttError::Tls("use_tls requires ca_file".to_string()))?;
            let config = tls::build_client_config(
                ca_file,
                settings.cert_file.as_deref(),
                settings.key_file.as_deref(),
            )?;
            let server_name = tls::server_name(&settings.broker_address)?;
            connector.tls = Some((TlsConnector::from(Arc::new(config)), server_name));
        }

        Ok(connector)
    }

    pub fn is_tls(&self) -> bool {
        self.tls.is_some()
    }
}

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self) -> Result<BoxedStream, MqttError> {
        let stream = TcpStream::connect((self.host.as_str(), self.port)).await?;
        stream.set_nodelay(true)?;
        debug!(target: "mqtt_transport", "TCP connection to {} established", self.endpoint());

        match &self.tls {
            Some((connector, server_name)) => {
                let tls_stream = connector
                    .connect(server_name.clone(), stream)
                    .await
                    .map_err(|e| MqttError::Tls(format!("handshake with {}: {e}", self.host)))?;
                debug!(target: "mqtt_transport", "TLS handshake with {} complete", self.host);
                Ok(Box::new(tls_stream))
            }
            None => Ok(Box::new(stream)),
        }
    }

    fn endpoint(&self) -> String {
        let scheme = if self.is_tls() { "mqtts" } else { "mqtt" };
        format!("{scheme}://{}:{}", self.host, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[test]
    fn test_plain_endpoint() {
        let connector = TcpConnector::plain("broker.local", 1883);
        assert!(!connector.is_tls());
        assert_eq!(connector.endpoint(), "mqtt://broker.local:1883");
    }

    #[test]
    fn test_tls_settings_without_ca_fail() {
        let settings = MqttSettings {
            use_tls: true,
            ..Default::default()
        };
        assert!(matches!(
            TcpConnector::from_settings(&settings),
            Err(MqttError::Tls(_))
        ));
    }

    #[tokio::test]
    async fn test_tcp_connect_round_trip() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 2];
            socket.read_exact(&mut buf).await.unwrap();
            socket.write_all(&buf).await.unwrap();
        });

        let connector = TcpConnector::plain("127.0.0.1", port);
        let mut stream = connector.connect().await.unwrap();
        stream.write_all(&[0xC0, 0x00]).await.unwrap();
        let mut echoed = [0u8; 2];
        stream.read_exact(&mut echoed).await.unwrap();
        assert_eq!(echoed, [0xC0, 0x00]);

        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_connect_refused_is_transport_error() {
        // Bind then drop to get a port nobody listens on
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let connector = TcpConnector::plain("127.0.0.1", port);
        let result = connector.connect().await;
        assert!(matches!(result, Err(MqttError::Transport(_))));
    }
}
