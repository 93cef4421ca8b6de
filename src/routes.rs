//! Router assembly and the websocket upgrade endpoint.
//!
//! SYSTEM CONTEXT
//! ==============
//! The transport exposes one upgrade endpoint at `/graphql` plus a
//! liveness probe. Subprotocol negotiation happens before the upgrade is
//! accepted: with no mutually supported token the request is rejected with
//! HTTP 400 and no connection is ever created.

use axum::Router;
use axum::extract::State;
use axum::extract::ws::WebSocketUpgrade;
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use tower_http::cors::{Any, CorsLayer};
use tracing::warn;

use crate::connection;
use crate::manager::negotiate_subprotocol;
use crate::message::DEPRECATED_GRAPHQL_WS_PROTOCOL;
use crate::state::AppState;

#[must_use]
pub fn app(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/graphql", get(handle_upgrade))
        .route("/healthz", get(healthz))
        .layer(cors)
        .with_state(state)
}

async fn healthz() -> StatusCode {
    StatusCode::OK
}

// =============================================================================
// UPGRADE
// =============================================================================

pub async fn handle_upgrade(
    State(state): State<AppState>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let offered = offered_subprotocols(&headers);
    let Some(subprotocol) = negotiate_subprotocol(offered.as_deref()) else {
        return (StatusCode::BAD_REQUEST, "unsupported websocket subprotocol").into_response();
    };

    if subprotocol == DEPRECATED_GRAPHQL_WS_PROTOCOL && !state.config.production {
        warn!(subprotocol, "client negotiated a deprecated subprotocol");
    }

    ws.protocols([subprotocol])
        .on_upgrade(move |socket| connection::run(socket, state, subprotocol))
}

/// Join every `Sec-WebSocket-Protocol` header value into one offered list.
fn offered_subprotocols(headers: &HeaderMap) -> Option<String> {
    let values: Vec<&str> = headers
        .get_all(header::SEC_WEBSOCKET_PROTOCOL)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .collect();
    if values.is_empty() { None } else { Some(values.join(",")) }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
#[path = "routes_test.rs"]
mod tests;
