//! Connection manager — live-connection registry, subprotocol negotiation,
//! and the shutdown close broadcast.
//!
//! DESIGN
//! ======
//! The registry is the only process-wide shared mutable state in the
//! transport: `connection id → close-command sender`, inserted when a
//! connection opens and removed when its socket closes, always under the
//! same `RwLock`. Shutdown iterates a snapshot of the registry, asks every
//! connection to close itself, and waits a bounded grace period for the
//! registry to drain — each connection unregisters on its own way out.

use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::{Notify, RwLock, mpsc};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::message::{
    Close, DEPRECATED_GRAPHQL_WS_PROTOCOL, GRAPHQL_TRANSPORT_WS_PROTOCOL,
};

// =============================================================================
// SUBPROTOCOL NEGOTIATION
// =============================================================================

/// Select a subprotocol from the client's offered list (the
/// `Sec-WebSocket-Protocol` header value, comma-separated).
///
/// The current token wins whenever offered, regardless of order; the
/// deprecated legacy token is accepted as a fallback. `None` means the
/// upgrade must be rejected before any connection is created.
#[must_use]
pub fn negotiate_subprotocol(offered: Option<&str>) -> Option<&'static str> {
    let offered = offered?;
    let mut legacy = false;
    for token in offered.split(',').map(str::trim) {
        if token == GRAPHQL_TRANSPORT_WS_PROTOCOL {
            return Some(GRAPHQL_TRANSPORT_WS_PROTOCOL);
        }
        if token == DEPRECATED_GRAPHQL_WS_PROTOCOL {
            legacy = true;
        }
    }
    legacy.then_some(DEPRECATED_GRAPHQL_WS_PROTOCOL)
}

// =============================================================================
// MANAGER
// =============================================================================

/// Process-wide set of live connections.
pub struct ConnectionManager {
    connections: RwLock<HashMap<Uuid, mpsc::Sender<Close>>>,
    /// Signalled on every unregistration so shutdown can observe the drain.
    drained: Notify,
}

impl ConnectionManager {
    #[must_use]
    pub fn new() -> Self {
        Self { connections: RwLock::new(HashMap::new()), drained: Notify::new() }
    }

    /// Register a freshly accepted connection's close channel.
    pub async fn register(&self, id: Uuid, close_tx: mpsc::Sender<Close>) {
        let mut connections = self.connections.write().await;
        connections.insert(id, close_tx);
    }

    /// Remove a connection after its socket closed.
    pub async fn unregister(&self, id: Uuid) {
        let mut connections = self.connections.write().await;
        if connections.remove(&id).is_some() {
            drop(connections);
            self.drained.notify_waiters();
        }
    }

    /// Number of live connections.
    pub async fn connection_count(&self) -> usize {
        self.connections.read().await.len()
    }

    /// Graceful shutdown: close every live connection with 1001.
    pub async fn shutdown(&self, grace: Duration) {
        self.broadcast_close(Close::going_away(), grace).await;
    }

    /// Fatal-fault shutdown: close every live connection with 1011 and the
    /// sanitized fault message.
    pub async fn shutdown_with_fault(&self, message: &str, grace: Duration) {
        self.broadcast_close(Close::internal(message), grace).await;
    }

    async fn broadcast_close(&self, close: Close, grace: Duration) {
        let senders: Vec<(Uuid, mpsc::Sender<Close>)> = {
            let connections = self.connections.read().await;
            connections.iter().map(|(id, tx)| (*id, tx.clone())).collect()
        };
        info!(
            connections = senders.len(),
            code = close.code.code(),
            reason = %close.reason,
            "broadcasting close to live connections"
        );
        for (id, tx) in senders {
            if tx.send(close.clone()).await.is_err() {
                debug!(connection_id = %id, "connection already closing");
            }
        }

        let drain = async {
            loop {
                let notified = self.drained.notified();
                tokio::pin!(notified);
                // Register interest before checking, or a concurrent
                // unregistration could slip between the check and the await.
                notified.as_mut().enable();
                if self.connections.read().await.is_empty() {
                    break;
                }
                notified.await;
            }
        };
        if tokio::time::timeout(grace, drain).await.is_err() {
            let remaining = self.connection_count().await;
            warn!(remaining, "shutdown grace elapsed before all connections drained");
        }
    }
}

impl Default for ConnectionManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
#[path = "manager_test.rs"]
mod tests;
