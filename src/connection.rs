//! Connection — per-socket protocol state machine and operation bridge.
//!
//! ARCHITECTURE
//! ============
//! One task per accepted socket runs a `select!` loop over: the socket
//! reader, the connection's outbound channel, the init timeout, keepalive
//! events, and the manager's close channel. Inbound messages are handled
//! synchronously in arrival order; connection-scoped replies
//! (`connection_ack`, `pong`) are written by the loop itself, while each
//! operation's executor work runs as an independent cancellable task that
//! feeds ordered output back through a bounded outbound channel. The
//! socket still has exactly one writer, and inbound dispatch never waits
//! on the operation queue — a full queue stalls operation tasks, not the
//! loop that drains it.
//!
//! LIFECYCLE
//! =========
//! 1. Upgrade → Uninitialized, init timeout armed
//! 2. `connection_init` → resolve identity → `connection_ack`, keepalive on
//! 3. `subscribe`/`complete` manage the id-keyed operation map
//! 4. Close trigger → abort every operation, close frame (if graceful), gone
//!
//! Operation frames carry a per-registration token; the writer path drops
//! frames whose token no longer matches the registered operation, so a
//! cancelled run can never leak a stale `next` into a reused id.

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::ws::{CloseFrame, Message, WebSocket};
use futures::StreamExt;
use serde_json::{Map, Value};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::keepalive::{KeepAlive, Liveness};
use crate::message::{
    self, ClientMessage, Close, DecodeError, ServerMessage, SubscribePayload,
};
use crate::schema::{
    AuthContext, ExecutionOutcome, ExecutionRequest, IdentityResolver, SchemaExecutor,
};
use crate::state::AppState;

/// Outbound channel depth. Operation tasks block here when the peer reads
/// slowly, which is the backpressure we want.
const OUTBOUND_BUFFER: usize = 64;

// =============================================================================
// TYPES
// =============================================================================

/// Protocol position of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Socket accepted, `connection_init` not yet received.
    Uninitialized,
    /// Handshake complete; operations may run.
    Acknowledged,
    /// Close triggered; teardown in progress.
    Closing,
    /// Terminal.
    Closed,
}

/// One in-flight operation: the cancellable handle to its executor task.
struct Operation {
    /// Fences this registration against stale frames from a prior run.
    token: Uuid,
    handle: JoinHandle<()>,
}

/// Operation-scoped message headed for the socket, tagged with the
/// registration token of the run that produced it.
pub struct Outbound {
    pub token: Uuid,
    pub message: ServerMessage,
}

/// Loop-level effect of handling one inbound message.
#[derive(Debug, Clone, PartialEq)]
pub enum Handled {
    /// Handshake just completed: write `connection_ack`, start keepalive.
    Acknowledged,
    /// Peer answered a liveness probe: clear the pong deadline.
    PongReceived,
    /// Connection-scoped reply to write out immediately.
    Reply(ServerMessage),
    /// Nothing for the loop to do.
    Continue,
}

// =============================================================================
// CONNECTION
// =============================================================================

/// Per-socket state machine. Owns the operation map; mutated only by its
/// own message-handling path.
pub struct Connection {
    id: Uuid,
    state: ConnectionState,
    subprotocol: &'static str,
    auth: AuthContext,
    operations: HashMap<String, Operation>,
    out_tx: mpsc::Sender<Outbound>,
    executor: Arc<dyn SchemaExecutor>,
    resolver: Arc<dyn IdentityResolver>,
}

impl Connection {
    #[must_use]
    pub fn new(
        id: Uuid,
        subprotocol: &'static str,
        out_tx: mpsc::Sender<Outbound>,
        executor: Arc<dyn SchemaExecutor>,
        resolver: Arc<dyn IdentityResolver>,
    ) -> Self {
        Self {
            id,
            state: ConnectionState::Uninitialized,
            subprotocol,
            auth: AuthContext::anonymous(),
            operations: HashMap::new(),
            out_tx,
            executor,
            resolver,
        }
    }

    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    #[must_use]
    pub fn is_acknowledged(&self) -> bool {
        self.state == ConnectionState::Acknowledged
    }

    #[must_use]
    pub fn subprotocol(&self) -> &'static str {
        self.subprotocol
    }

    #[must_use]
    pub fn auth(&self) -> &AuthContext {
        &self.auth
    }

    /// Number of registered operations.
    #[must_use]
    pub fn operation_count(&self) -> usize {
        self.operations.len()
    }

    // -------------------------------------------------------------------------
    // INBOUND DISPATCH
    // -------------------------------------------------------------------------

    /// Decode and handle one inbound text frame.
    ///
    /// # Errors
    ///
    /// Returns the [`Close`] directive that must terminate the connection.
    pub async fn handle_text(&mut self, text: &str) -> Result<Handled, Close> {
        let msg = message::decode(text).map_err(|e| Close::from(&e))?;
        match self.state {
            ConnectionState::Uninitialized => match msg {
                ClientMessage::ConnectionInit { payload } => self.handle_init(payload).await,
                other => Err(Close::protocol_error(format!(
                    "{} before connection_init",
                    client_message_type(&other)
                ))),
            },
            ConnectionState::Acknowledged => match msg {
                ClientMessage::ConnectionInit { .. } => Err(Close::too_many_init_requests()),
                ClientMessage::Ping { .. } => Ok(Handled::Reply(ServerMessage::Pong)),
                ClientMessage::Pong { .. } => Ok(Handled::PongReceived),
                ClientMessage::Subscribe { id, payload } => self.handle_subscribe(id, payload),
                ClientMessage::Complete { id } => {
                    self.handle_complete(&id);
                    Ok(Handled::Continue)
                }
            },
            // The loop stops reading once a close is triggered; anything that
            // races in is dropped.
            ConnectionState::Closing | ConnectionState::Closed => Ok(Handled::Continue),
        }
    }

    /// Handshake: resolve identity, acknowledge. The loop writes the
    /// `connection_ack` itself.
    ///
    /// A resolver failure is recoverable — the connection continues with an
    /// anonymous context, and authorization stays with the executor layer.
    async fn handle_init(&mut self, payload: Option<Map<String, Value>>) -> Result<Handled, Close> {
        self.auth = match self.resolver.resolve(payload.as_ref()).await {
            Ok(identity) => {
                info!(connection_id = %self.id, subject = %identity.subject, "identity resolved");
                AuthContext::authenticated(identity)
            }
            Err(failure) => {
                debug!(connection_id = %self.id, error = %failure, "continuing anonymously");
                AuthContext::anonymous()
            }
        };
        self.state = ConnectionState::Acknowledged;
        Ok(Handled::Acknowledged)
    }

    /// Start one operation. Ids are scoped per connection; reuse while the
    /// prior registration is still present closes the connection with 4409,
    /// and the executor is never invoked for the duplicate. A single-result
    /// operation keeps its registration until its terminal frame passes the
    /// writer path, so the reuse rule covers the whole emission window.
    fn handle_subscribe(&mut self, id: String, payload: SubscribePayload) -> Result<Handled, Close> {
        if self.operations.contains_key(&id) {
            return Err(Close::duplicate_subscriber(&id));
        }
        debug!(connection_id = %self.id, operation_id = %id, "subscribe");

        let token = Uuid::new_v4();
        let handle = tokio::spawn(run_operation(
            Arc::clone(&self.executor),
            ExecutionRequest::from(payload),
            self.auth.clone(),
            self.out_tx.clone(),
            id.clone(),
            token,
        ));
        self.operations.insert(id, Operation { token, handle });
        Ok(Handled::Continue)
    }

    /// Client-initiated completion. Idempotent: an unknown id is ignored.
    /// Aborting the task drops the executor stream, which is the cooperative
    /// cancel signal.
    fn handle_complete(&mut self, id: &str) {
        match self.operations.remove(id) {
            Some(operation) => {
                debug!(connection_id = %self.id, operation_id = %id, "operation cancelled by client");
                operation.handle.abort();
            }
            None => {
                debug!(connection_id = %self.id, operation_id = %id, "complete for unknown operation; ignoring");
            }
        }
    }

    // -------------------------------------------------------------------------
    // OUTBOUND (single writer path)
    // -------------------------------------------------------------------------

    /// Admit one outbound operation frame to the wire. Returns `None` for
    /// anything that must be dropped: sends after close, and frames whose
    /// registration token no longer matches (a cancelled run racing a
    /// reused id). Deregisters an operation as its terminal frame passes.
    pub fn admit(&mut self, outbound: Outbound) -> Option<ServerMessage> {
        if matches!(self.state, ConnectionState::Closing | ConnectionState::Closed) {
            return None;
        }
        let Outbound { token, message } = outbound;
        let id = message.operation_id()?;
        match self.operations.get(id) {
            Some(operation) if operation.token == token => {}
            _ => return None,
        }
        if message.terminated_operation().is_some() {
            self.operations.remove(id);
        }
        Some(message)
    }

    // -------------------------------------------------------------------------
    // TEARDOWN
    // -------------------------------------------------------------------------

    /// Cancel every registered operation and clear the map. Idempotent.
    pub fn teardown(&mut self) {
        if self.state == ConnectionState::Closed {
            return;
        }
        self.state = ConnectionState::Closing;
        let cancelled = self.operations.len();
        for (_, operation) in self.operations.drain() {
            operation.handle.abort();
        }
        if cancelled > 0 {
            debug!(connection_id = %self.id, cancelled, "cancelled operations on teardown");
        }
        self.state = ConnectionState::Closed;
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.teardown();
    }
}

fn client_message_type(msg: &ClientMessage) -> &'static str {
    match msg {
        ClientMessage::ConnectionInit { .. } => "connection_init",
        ClientMessage::Ping { .. } => "ping",
        ClientMessage::Pong { .. } => "pong",
        ClientMessage::Subscribe { .. } => "subscribe",
        ClientMessage::Complete { .. } => "complete",
    }
}

// =============================================================================
// OPERATION EXECUTION
// =============================================================================

/// Bridge one executor outcome to outbound frames, in emission order.
///
/// A single result becomes `next` + `complete`; a stream is forwarded item
/// by item until it ends (`complete`) or fails (`error`). A per-call
/// executor failure becomes a single `error`. The connection itself stays
/// open in every case — deregistration happens in the writer path as the
/// terminal frame goes out.
async fn run_operation(
    executor: Arc<dyn SchemaExecutor>,
    request: ExecutionRequest,
    auth: AuthContext,
    out: mpsc::Sender<Outbound>,
    id: String,
    token: Uuid,
) {
    let emit = |message: ServerMessage| {
        let out = out.clone();
        async move { out.send(Outbound { token, message }).await.is_ok() }
    };

    match executor.execute(request, auth).await {
        Err(err) => {
            let _ = emit(ServerMessage::error(&id, vec![err.to_payload()])).await;
        }
        Ok(ExecutionOutcome::Single(value)) => {
            if emit(ServerMessage::next(&id, value)).await {
                let _ = emit(ServerMessage::complete(&id)).await;
            }
        }
        Ok(ExecutionOutcome::Stream(mut stream)) => {
            while let Some(item) = stream.next().await {
                match item {
                    Ok(value) => {
                        if !emit(ServerMessage::next(&id, value)).await {
                            return;
                        }
                    }
                    Err(err) => {
                        let _ = emit(ServerMessage::error(&id, vec![err.to_payload()])).await;
                        return;
                    }
                }
            }
            let _ = emit(ServerMessage::complete(&id)).await;
        }
    }
}

// =============================================================================
// SOCKET LOOP
// =============================================================================

enum SendFailure {
    /// Our own serialization failed — an internal fault, closed as 1011.
    Serialize,
    /// The transport is gone; nothing left to tell the peer.
    Transport,
}

/// Drive one accepted socket until it closes.
pub async fn run(socket: WebSocket, state: AppState, subprotocol: &'static str) {
    let connection_id = Uuid::new_v4();
    let (close_tx, close_rx) = mpsc::channel::<Close>(1);
    state.manager.register(connection_id, close_tx).await;
    info!(%connection_id, subprotocol, "connection opened");

    let close = connection_loop(socket, &state, subprotocol, connection_id, close_rx).await;

    state.manager.unregister(connection_id).await;
    match &close {
        Some(close) => info!(%connection_id, code = close.code.code(), reason = %close.reason, "connection closed"),
        None => info!(%connection_id, "connection closed"),
    }
}

async fn connection_loop(
    mut socket: WebSocket,
    state: &AppState,
    subprotocol: &'static str,
    connection_id: Uuid,
    mut close_rx: mpsc::Receiver<Close>,
) -> Option<Close> {
    let (out_tx, mut out_rx) = mpsc::channel::<Outbound>(OUTBOUND_BUFFER);
    let mut conn = Connection::new(
        connection_id,
        subprotocol,
        out_tx,
        Arc::clone(&state.executor),
        Arc::clone(&state.resolver),
    );
    let mut keepalive = KeepAlive::disabled();
    let init_timeout = tokio::time::sleep(state.config.connection_init_timeout);
    tokio::pin!(init_timeout);

    let close = loop {
        let acknowledged = conn.is_acknowledged();
        let keepalive_enabled = keepalive.is_enabled();
        tokio::select! {
            // Handshake deadline, armed only while uninitialised.
            () = &mut init_timeout, if !acknowledged => {
                info!(%connection_id, "connection_init not received within timeout");
                break Some(Close::init_timeout());
            }

            event = keepalive.next(), if keepalive_enabled => match event {
                Liveness::SendPing => {
                    match send_message(&mut socket, &ServerMessage::Ping).await {
                        Ok(()) => keepalive.arm_deadline(),
                        Err(SendFailure::Serialize) => break Some(Close::internal("message serialization failed")),
                        Err(SendFailure::Transport) => break None,
                    }
                }
                Liveness::PeerUnresponsive => {
                    // Abrupt termination, not a close handshake: reclaim the
                    // half-open peer's resources.
                    warn!(%connection_id, "pong deadline expired; terminating socket");
                    break None;
                }
            },

            // Server shutdown or fault broadcast from the manager.
            Some(close) = close_rx.recv() => break Some(close),

            // Serialized writer path for operation output.
            Some(outbound) = out_rx.recv() => {
                if let Some(message) = conn.admit(outbound) {
                    match send_message(&mut socket, &message).await {
                        Ok(()) => {}
                        Err(SendFailure::Serialize) => break Some(Close::internal("message serialization failed")),
                        Err(SendFailure::Transport) => break None,
                    }
                }
            }

            incoming = socket.recv() => {
                let Some(Ok(frame)) = incoming else { break None };
                match frame {
                    Message::Text(text) => match conn.handle_text(text.as_str()).await {
                        Ok(Handled::Acknowledged) => {
                            match send_message(&mut socket, &ServerMessage::ConnectionAck).await {
                                Ok(()) => keepalive = KeepAlive::new(state.config.keepalive),
                                Err(SendFailure::Serialize) => break Some(Close::internal("message serialization failed")),
                                Err(SendFailure::Transport) => break None,
                            }
                        }
                        Ok(Handled::Reply(message)) => {
                            match send_message(&mut socket, &message).await {
                                Ok(()) => {}
                                Err(SendFailure::Serialize) => break Some(Close::internal("message serialization failed")),
                                Err(SendFailure::Transport) => break None,
                            }
                        }
                        Ok(Handled::PongReceived) => keepalive.pong(),
                        Ok(Handled::Continue) => {}
                        Err(close) => break Some(close),
                    },
                    Message::Binary(_) => break Some(Close::from(&DecodeError::BinaryFrame)),
                    Message::Close(_) => break None,
                    // Transport-level ping/pong is answered by the websocket
                    // layer itself.
                    Message::Ping(_) | Message::Pong(_) => {}
                }
            }
        }
    };

    conn.teardown();
    if let Some(close) = &close {
        let frame = CloseFrame { code: close.code.code(), reason: close.reason.clone().into() };
        let _ = socket.send(Message::Close(Some(frame))).await;
    }
    close
}

async fn send_message(socket: &mut WebSocket, message: &ServerMessage) -> Result<(), SendFailure> {
    let json = match serde_json::to_string(message) {
        Ok(json) => json,
        Err(e) => {
            warn!(error = %e, "failed to serialize outbound message");
            return Err(SendFailure::Serialize);
        }
    };
    socket
        .send(Message::Text(json.into()))
        .await
        .map_err(|_| SendFailure::Transport)
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
#[path = "connection_test.rs"]
mod tests;
