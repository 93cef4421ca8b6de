mod config;
mod connection;
mod keepalive;
mod manager;
mod message;
mod routes;
mod schema;
mod state;

use std::sync::Arc;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();

    let config = config::Config::from_env();

    // Standalone runs serve the transport in degraded mode until real
    // collaborators are injected at integration time.
    tracing::warn!("no schema executor configured — every operation will error");
    let state = state::AppState::new(
        config,
        Arc::new(schema::NullExecutor),
        Arc::new(schema::AnonymousResolver),
    );

    let app = routes::app(state.clone());
    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", config.port))
        .await
        .expect("failed to bind");

    tracing::info!(port = config.port, "subwire listening");

    let manager = Arc::clone(&state.manager);
    let serve = axum::serve(listener, app).with_graceful_shutdown(async move {
        shutdown_signal().await;
        tracing::info!("shutdown requested; broadcasting going-away");
        manager.shutdown(config.shutdown_grace).await;
    });

    if let Err(e) = serve.await {
        // Listener fault: tell every live connection before giving up.
        tracing::error!(error = %e, "server failed");
        state
            .manager
            .shutdown_with_fault(&e.to_string(), config.shutdown_grace)
            .await;
        std::process::exit(1);
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("ctrl-c handler failed");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("sigterm handler failed")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
}
