//! Pure health monitoring and reconnection logic for the MQTT client
//!
//! State transitions, reconnect delays and CONNACK classification live here
//! as plain functions so the session code only has to act on decisions.

use super::connection::ConnectionState;
use crate::config::TimeoutSettings;
use crate::error::MqttError;
use crate::protocol::ConnectReturnCode;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

/// Pure health monitoring and reconnection decision logic
pub struct HealthMonitor;

impl HealthMonitor {
    /// Determine next state after a connection event (pure function)
    ///
    /// Events that make no sense in the current state leave it unchanged.
    pub fn determine_next_state(
        current: ConnectionState,
        event: ConnectionEvent,
    ) -> ConnectionState {
        use ConnectionEvent as E;
        use ConnectionState as S;

        match (current, event) {
            (_, E::Stopped) => S::Disconnected,
            (S::Disconnected | S::Reconnecting, E::AttemptStarted) => S::Connecting,
            (S::Connecting, E::HandshakeComplete) => S::Connected,
            (S::Connecting, E::AttemptFailed | E::ConnectionLost) => S::Disconnected,
            (S::Connected, E::ConnectionLost) => S::Reconnecting,
            (S::Disconnected, E::RetryScheduled) => S::Reconnecting,
            (state, _) => state,
        }
    }

    /// Decide whether and when the next connection attempt happens (pure function)
    ///
    /// Retries never stop while the client is started; only shutdown aborts.
    pub fn should_attempt_reconnection(
        attempt: u32,
        last_error: Option<&MqttError>,
        timeouts: &TimeoutSettings,
        shutdown_requested: bool,
    ) -> ReconnectionDecision {
        if shutdown_requested {
            return ReconnectionDecision::AbortShutdownRequested;
        }

        ReconnectionDecision::Proceed {
            attempt: attempt + 1,
            delay: Self::reconnect_delay(last_error, timeouts),
        }
    }

    /// Delay before the next attempt; refused credentials back off longer
    pub fn reconnect_delay(last_error: Option<&MqttError>, timeouts: &TimeoutSettings) -> Duration {
        match last_error {
            Some(MqttError::ConnectionRefused(code)) if Self::is_auth_failure(*code) => {
                timeouts.auth_failure_delay()
            }
            _ => timeouts.reconnect_delay(),
        }
    }

    pub fn is_auth_failure(code: ConnectReturnCode) -> bool {
        matches!(
            code,
            ConnectReturnCode::BadUsernamePassword | ConnectReturnCode::NotAuthorized
        )
    }

    /// Log a refused CONNACK with a message naming the reason
    pub fn log_connack_refusal(code: ConnectReturnCode, broker: &str) {
        match code {
            ConnectReturnCode::Accepted => {}
            ConnectReturnCode::UnacceptableProtocolVersion => {
                error!(broker, "Broker does not support MQTT 3.1.1");
            }
            ConnectReturnCode::IdentifierRejected => {
                error!(broker, "Broker rejected the client identifier");
            }
            ConnectReturnCode::ServerUnavailable => {
                warn!(broker, "Broker reports MQTT service unavailable");
            }
            ConnectReturnCode::BadUsernamePassword => {
                error!(broker, "Broker rejected user name or password");
            }
            ConnectReturnCode::NotAuthorized => {
                error!(broker, "Client is not authorized to connect");
            }
        }
    }

    /// Check if connection state allows publishing (pure function)
    pub fn can_publish(state: ConnectionState) -> bool {
        matches!(state, ConnectionState::Connected)
    }

    /// Calculate health metrics for connection (pure function)
    pub fn calculate_health_metrics(
        connect_time: Option<Instant>,
        last_message_time: Option<Instant>,
        reconnect_count: u64,
    ) -> HealthMetrics {
        let now = Instant::now();

        HealthMetrics {
            uptime: connect_time.map(|t| now.duration_since(t)),
            time_since_last_message: last_message_time.map(|t| now.duration_since(t)),
            reconnect_count,
            is_connected: connect_time.is_some(),
        }
    }

    /// Log connection state transition (pure logging function)
    pub fn log_state_transition(from: ConnectionState, to: ConnectionState) {
        match (from, to) {
            (ConnectionState::Connecting, ConnectionState::Connected) => {
                info!("MQTT connection established");
            }
            (ConnectionState::Connected, ConnectionState::Reconnecting) => {
                warn!("MQTT connection lost, reconnecting");
            }
            (ConnectionState::Connecting, ConnectionState::Disconnected) => {
                warn!("MQTT connection attempt failed");
            }
            (ConnectionState::Connected, ConnectionState::Disconnected) => {
                info!("MQTT connection closed");
            }
            _ => {
                info!("MQTT connection state: {:?} -> {:?}", from, to);
            }
        }
    }
}

/// Decision result for reconnection attempts
#[derive(Debug, PartialEq)]
pub enum ReconnectionDecision {
    /// Wait `delay`, then make attempt number `attempt`
    Proceed { attempt: u32, delay: Duration },
    AbortShutdownRequested,
}

/// Connection events that trigger state transitions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// Opening the transport
    AttemptStarted,
    /// CONNACK accepted and command subscription confirmed
    HandshakeComplete,
    /// Transport, CONNACK or SUBACK failure during an attempt
    AttemptFailed,
    /// Read/write failure, protocol violation or missed ack while connected
    ConnectionLost,
    /// Waiting out the delay before the next attempt
    RetryScheduled,
    Stopped,
}

/// Health metrics for connection monitoring
#[derive(Debug, Clone, PartialEq)]
pub struct HealthMetrics {
    /// Time since the current connection was established
    pub uptime: Option<Duration>,
    /// Time since the last packet arrived from the broker
    pub time_since_last_message: Option<Duration>,
    pub reconnect_count: u64,
    pub is_connected: bool,
}
