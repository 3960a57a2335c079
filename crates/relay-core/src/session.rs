//! Per-connection session handling.
//!
//! A session registers its connection, replays history, then serves the
//! connection from a single task until it ends: live payloads queued by the
//! registry go out, inbound frames come in and are routed through the hub.

use relay_protocol::{decode_inbound_with_limit, encode, Envelope};
use relay_transport::{Connection, ConnectionId, Incoming, MessageSink, TransportError};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, trace, warn};

use crate::hub::Hub;
use crate::metrics;
use crate::registry::ConnectionRegistry;

/// Longest a single frame send or close may take before the connection is
/// treated as dead.
pub const SEND_TIMEOUT: Duration = Duration::from_secs(10);

/// Why a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// The client closed the connection.
    ClientClosed,
    /// Sending or receiving failed.
    TransportError,
    /// The registry dropped the connection after a failed delivery.
    Pruned,
    /// A server-side fault, such as an unencodable history frame.
    Internal,
}

/// What happened during a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSummary {
    /// Connection ID.
    pub id: ConnectionId,
    /// Frames received from the client.
    pub received: u64,
    /// Frames dropped as malformed.
    pub malformed: u64,
    /// Why the session ended.
    pub reason: CloseReason,
}

/// Unregisters the connection however the session ends, including when the
/// session future is dropped.
struct RegistrationGuard {
    registry: Arc<ConnectionRegistry>,
    id: ConnectionId,
}

impl Drop for RegistrationGuard {
    fn drop(&mut self) {
        self.registry.unregister(&self.id);
    }
}

/// Serves client connections.
#[derive(Debug, Clone)]
pub struct SessionHandler {
    hub: Arc<Hub>,
}

impl SessionHandler {
    /// Create a handler routing through `hub`.
    #[must_use]
    pub fn new(hub: Arc<Hub>) -> Self {
        Self { hub }
    }

    /// The hub sessions route through.
    #[must_use]
    pub fn hub(&self) -> &Arc<Hub> {
        &self.hub
    }

    /// Serve a connection until it ends.
    pub async fn run(&self, connection: Box<dyn Connection>) -> SessionSummary {
        let id = connection.id().clone();
        let remote = connection.remote_addr();
        let (mut sink, mut source) = connection.split();

        let registry = self.hub.registry();
        let (tx, mut outbound) = mpsc::channel(self.hub.settings().outbound_queue.max(1));
        registry.register(id.clone(), tx);
        let registration = RegistrationGuard {
            registry: Arc::clone(registry),
            id: id.clone(),
        };
        info!(connection = %id, remote = ?remote, "Session started");

        let mut summary = SessionSummary {
            id: id.clone(),
            received: 0,
            malformed: 0,
            reason: CloseReason::ClientClosed,
        };

        // History goes straight to the socket, ahead of anything queued
        // since registration.
        if let Err(reason) = self.send_history(&id, sink.as_mut()).await {
            summary.reason = reason;
            drop(registration);
            close_bounded(&id, sink.as_mut()).await;
            return summary;
        }

        summary.reason = loop {
            tokio::select! {
                biased;

                queued = outbound.recv() => match queued {
                    Some(payload) => {
                        if let Err(e) = send_bounded(sink.as_mut(), payload.to_string()).await {
                            debug!(connection = %id, error = %e, "Send failed");
                            break CloseReason::TransportError;
                        }
                    }
                    None => {
                        warn!(connection = %id, "Connection dropped by registry");
                        break CloseReason::Pruned;
                    }
                },

                incoming = source.recv() => match incoming {
                    Ok(Some(Incoming::Text(text))) => {
                        summary.received += 1;
                        if !self.handle_text(&id, &text).await {
                            summary.malformed += 1;
                        }
                    }
                    Ok(Some(Incoming::Binary(len))) => {
                        summary.received += 1;
                        summary.malformed += 1;
                        metrics::record_malformed();
                        warn!(connection = %id, len, "Dropping binary frame");
                    }
                    Ok(None) => break CloseReason::ClientClosed,
                    Err(e) => {
                        log_receive_error(&id, &e);
                        break CloseReason::TransportError;
                    }
                },
            }
        };

        drop(registration);
        close_bounded(&id, sink.as_mut()).await;

        info!(
            connection = %id,
            received = summary.received,
            malformed = summary.malformed,
            reason = ?summary.reason,
            "Session ended"
        );
        summary
    }

    async fn send_history(
        &self,
        id: &ConnectionId,
        sink: &mut dyn MessageSink,
    ) -> Result<(), CloseReason> {
        let history = self.hub.history().await;
        let count = history.len();

        let frame = encode(&Envelope::history(history)).map_err(|e| {
            error!(connection = %id, error = %e, "Failed to encode history");
            CloseReason::Internal
        })?;

        metrics::record_message(frame.len(), metrics::OUTBOUND);
        send_bounded(sink, frame).await.map_err(|e| {
            debug!(connection = %id, error = %e, "Failed to send history");
            CloseReason::TransportError
        })?;

        debug!(connection = %id, messages = count, "Sent history");
        Ok(())
    }

    /// Decode and route one text frame. Returns `false` if it was malformed.
    async fn handle_text(&self, id: &ConnectionId, text: &str) -> bool {
        metrics::record_message(text.len(), metrics::INBOUND);

        let inbound = match decode_inbound_with_limit(text, self.hub.settings().max_message_size) {
            Ok(inbound) => inbound,
            Err(e) => {
                metrics::record_malformed();
                warn!(connection = %id, error = %e, "Dropping malformed message");
                return false;
            }
        };

        match self.hub.route(inbound).await {
            Ok(report) => {
                trace!(connection = %id, delivery = ?report.delivery, "Routed message");
            }
            Err(e) => {
                error!(connection = %id, error = %e, "Failed to route message");
                metrics::record_error("route");
            }
        }
        true
    }
}

/// Send one frame, failing if the client stops draining the socket.
async fn send_bounded(sink: &mut dyn MessageSink, frame: String) -> Result<(), TransportError> {
    match tokio::time::timeout(SEND_TIMEOUT, sink.send(frame)).await {
        Ok(result) => result,
        Err(_) => Err(TransportError::SendFailed(format!(
            "timed out after {:?}",
            SEND_TIMEOUT
        ))),
    }
}

async fn close_bounded(id: &ConnectionId, sink: &mut dyn MessageSink) {
    match tokio::time::timeout(SEND_TIMEOUT, sink.close()).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => trace!(connection = %id, error = %e, "Close failed"),
        Err(_) => debug!(connection = %id, "Close timed out"),
    }
}

fn log_receive_error(id: &ConnectionId, error: &TransportError) {
    match error {
        TransportError::ConnectionClosed => debug!(connection = %id, "Connection closed"),
        _ => {
            error!(connection = %id, error = %error, "Receive failed");
            metrics::record_error("transport");
        }
    }
}
