//! Keepalive task: one PINGREQ per keepalive interval
//!
//! A missing PINGRESP is reported to the session, which reconnects.

use super::connection::Session;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

pub(crate) async fn run(session: Arc<Session>, epoch: u64, cancel: CancellationToken) {
    let interval = session.settings().keepalive();

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(interval) => {}
        }

        let result = tokio::select! {
            _ = cancel.cancelled() => break,
            result = session.ping(epoch) => result,
        };
        match result {
            Ok(()) => debug!(target: "mqtt_transport", epoch, "PINGRESP received"),
            Err(e) if e.is_cancellation() => break,
            Err(e) => {
                // ping() has already reported the failure
                warn!(epoch, "Keepalive failed: {}", e);
                break;
            }
        }
    }

    debug!(target: "mqtt_transport", epoch, "Keepalive stopped");
}
