//! Collaborator seams — schema execution and identity resolution.
//!
//! ARCHITECTURE
//! ============
//! The transport treats the surrounding system as two black boxes: a
//! [`SchemaExecutor`] that evaluates one operation and yields either a
//! single terminal result or an ongoing stream of results, and an
//! [`IdentityResolver`] that turns the `connection_init` payload into an
//! authenticated identity. Schema composition, persistence, and
//! authorization all live behind these traits.
//!
//! ERROR HANDLING
//! ==============
//! An [`ExecutionError`] is scoped to one operation: it becomes an `error`
//! frame and never closes the connection. An [`AuthFailure`] degrades the
//! connection to an anonymous context rather than rejecting it — the
//! protocol layer does not enforce authorization.

use std::fmt;

use futures::stream::BoxStream;
use serde_json::{Map, Value};

// =============================================================================
// AUTH CONTEXT
// =============================================================================

/// An authenticated identity produced by the resolver.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct Identity {
    /// Stable subject identifier (user id, service account, ...).
    pub subject: String,
    /// Opaque claims forwarded to the executor.
    pub claims: Map<String, Value>,
}

/// Per-connection auth context, set once at acknowledgement.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AuthContext {
    identity: Option<Identity>,
}

impl AuthContext {
    #[must_use]
    pub fn anonymous() -> Self {
        Self { identity: None }
    }

    #[must_use]
    pub fn authenticated(identity: Identity) -> Self {
        Self { identity: Some(identity) }
    }

    #[must_use]
    pub fn identity(&self) -> Option<&Identity> {
        self.identity.as_ref()
    }

    #[must_use]
    pub fn is_anonymous(&self) -> bool {
        self.identity.is_none()
    }
}

/// Identity resolution failed (missing or invalid credential).
#[derive(Debug, Clone, thiserror::Error)]
#[error("identity resolution failed: {message}")]
pub struct AuthFailure {
    pub message: String,
}

impl AuthFailure {
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self { message: message.into() }
    }
}

/// Maps the `connection_init` payload to an identity. Called once per
/// connection.
#[async_trait::async_trait]
pub trait IdentityResolver: Send + Sync {
    async fn resolve(&self, payload: Option<&Map<String, Value>>) -> Result<Identity, AuthFailure>;
}

/// Default resolver: every connection is anonymous.
pub struct AnonymousResolver;

#[async_trait::async_trait]
impl IdentityResolver for AnonymousResolver {
    async fn resolve(&self, _payload: Option<&Map<String, Value>>) -> Result<Identity, AuthFailure> {
        Err(AuthFailure::new("no identity resolver configured"))
    }
}

// =============================================================================
// EXECUTION
// =============================================================================

/// One GraphQL operation as received in a `subscribe` payload.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionRequest {
    pub query: String,
    pub operation_name: Option<String>,
    pub variables: Option<Map<String, Value>>,
    pub extensions: Option<Map<String, Value>>,
}

impl From<crate::message::SubscribePayload> for ExecutionRequest {
    fn from(payload: crate::message::SubscribePayload) -> Self {
        Self {
            query: payload.query,
            operation_name: payload.operation_name,
            variables: payload.variables,
            extensions: payload.extensions,
        }
    }
}

/// Structured per-operation failure. Serializes as a GraphQL-style error
/// object; `error` frames carry an array of these.
#[derive(Debug, Clone, PartialEq, serde::Serialize, thiserror::Error)]
pub struct ExecutionError {
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extensions: Option<Map<String, Value>>,
}

impl fmt::Display for ExecutionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl ExecutionError {
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self { message: message.into(), extensions: None }
    }

    /// Wire representation: one entry of an `error` frame payload.
    #[must_use]
    pub fn to_payload(&self) -> Value {
        serde_json::to_value(self).unwrap_or_else(|_| {
            serde_json::json!({ "message": self.message })
        })
    }
}

/// Ongoing sequence of execution results. Dropping the stream is the
/// cooperative cancellation signal to the executor.
pub type ResultStream = BoxStream<'static, Result<Value, ExecutionError>>;

/// Outcome of evaluating one operation.
pub enum ExecutionOutcome {
    /// Query/mutation: one terminal result.
    Single(Value),
    /// Subscription: results until the source ends or fails.
    Stream(ResultStream),
}

/// Evaluates one operation against the data/business layer.
#[async_trait::async_trait]
pub trait SchemaExecutor: Send + Sync {
    /// Evaluate `request` under `auth`.
    ///
    /// # Errors
    ///
    /// A per-call failure becomes a single `error` frame for the operation;
    /// the connection stays open.
    async fn execute(
        &self,
        request: ExecutionRequest,
        auth: AuthContext,
    ) -> Result<ExecutionOutcome, ExecutionError>;
}

/// Default executor for standalone runs: every operation fails until a real
/// schema layer is injected.
pub struct NullExecutor;

#[async_trait::async_trait]
impl SchemaExecutor for NullExecutor {
    async fn execute(
        &self,
        _request: ExecutionRequest,
        _auth: AuthContext,
    ) -> Result<ExecutionOutcome, ExecutionError> {
        Err(ExecutionError::new("no schema executor configured"))
    }
}

// =============================================================================
// TEST DOUBLES
// =============================================================================

#[cfg(test)]
pub mod test_doubles {
    use super::*;
    use futures::StreamExt;
    use serde_json::json;
    use tokio::sync::mpsc;

    /// Adapt an mpsc receiver into a result stream so tests can feed items
    /// by hand.
    fn receiver_stream(rx: mpsc::Receiver<Result<Value, ExecutionError>>) -> ResultStream {
        futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        })
        .boxed()
    }

    /// Scripted executor: behavior is selected by the query text.
    ///
    /// - `"single"` → one terminal result
    /// - `"count:N"` → stream of N items `{"n": 0..N}`
    /// - `"pending"` → stream that never produces (cancellation target)
    /// - `"fail"` → per-call execution error
    /// - `"failing-stream"` → one item, then a stream error
    /// - anything else → echoes the query back as a single result
    pub struct ScriptedExecutor;

    #[async_trait::async_trait]
    impl SchemaExecutor for ScriptedExecutor {
        async fn execute(
            &self,
            request: ExecutionRequest,
            auth: AuthContext,
        ) -> Result<ExecutionOutcome, ExecutionError> {
            match request.query.as_str() {
                "single" => Ok(ExecutionOutcome::Single(json!({"data": {"value": 42}}))),
                "fail" => Err(ExecutionError::new("scripted failure")),
                "pending" => Ok(ExecutionOutcome::Stream(futures::stream::pending().boxed())),
                "failing-stream" => Ok(ExecutionOutcome::Stream(
                    futures::stream::iter(vec![
                        Ok(json!({"data": {"n": 0}})),
                        Err(ExecutionError::new("stream failure")),
                    ])
                    .boxed(),
                )),
                query if query.starts_with("count:") => {
                    let n: usize = query["count:".len()..].parse().unwrap_or(0);
                    Ok(ExecutionOutcome::Stream(
                        futures::stream::iter(
                            (0..n).map(|i| Ok(json!({"data": {"n": i}}))).collect::<Vec<_>>(),
                        )
                        .boxed(),
                    ))
                }
                other => Ok(ExecutionOutcome::Single(json!({
                    "data": { "echo": other, "anonymous": auth.is_anonymous() }
                }))),
            }
        }
    }

    /// Executor whose subscriptions are fed from a channel, for tests that
    /// interleave items across concurrent operations.
    pub struct ChannelExecutor {
        sources: std::sync::Mutex<Vec<mpsc::Receiver<Result<Value, ExecutionError>>>>,
    }

    impl ChannelExecutor {
        /// Each `subscribe` consumes the next receiver, in order.
        #[must_use]
        pub fn new(sources: Vec<mpsc::Receiver<Result<Value, ExecutionError>>>) -> Self {
            Self { sources: std::sync::Mutex::new(sources) }
        }
    }

    #[async_trait::async_trait]
    impl SchemaExecutor for ChannelExecutor {
        async fn execute(
            &self,
            _request: ExecutionRequest,
            _auth: AuthContext,
        ) -> Result<ExecutionOutcome, ExecutionError> {
            let rx = {
                let mut sources = self.sources.lock().expect("sources mutex should lock");
                if sources.is_empty() { None } else { Some(sources.remove(0)) }
            };
            match rx {
                Some(rx) => Ok(ExecutionOutcome::Stream(receiver_stream(rx))),
                None => Err(ExecutionError::new("no scripted source left")),
            }
        }
    }

    /// Resolver that accepts a `token` field equal to `expected` and fails
    /// otherwise.
    pub struct TokenResolver {
        pub expected: String,
    }

    #[async_trait::async_trait]
    impl IdentityResolver for TokenResolver {
        async fn resolve(
            &self,
            payload: Option<&Map<String, Value>>,
        ) -> Result<Identity, AuthFailure> {
            let token = payload
                .and_then(|p| p.get("token"))
                .and_then(Value::as_str)
                .ok_or_else(|| AuthFailure::new("missing token"))?;
            if token == self.expected {
                Ok(Identity { subject: "user-1".into(), claims: Map::new() })
            } else {
                Err(AuthFailure::new("invalid token"))
            }
        }
    }
}

#[cfg(test)]
#[path = "schema_test.rs"]
mod tests;
