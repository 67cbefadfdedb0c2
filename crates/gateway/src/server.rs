use std::net::SocketAddr;

use {
    axum::{
        Router,
        routing::{get, post},
    },
    tower_http::{
        cors::{Any, CorsLayer},
        trace::TraceLayer,
    },
    tracing::info,
};

use crate::{
    routes::{health, session_router},
    state::AppState,
    webhook,
};

/// Build the router with every route mounted.
pub fn build_app(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/health", get(health))
        .route("/api/webhooks/{backend}", post(webhook::receive))
        .merge(session_router())
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Serve until ctrl-c, then stop the relay's background tasks.
pub async fn start_gateway(bind: &str, port: u16, state: AppState) -> anyhow::Result<()> {
    let addr: SocketAddr = format!("{bind}:{port}").parse()?;
    let switchboard = state.switchboard.clone();
    let app = build_app(state);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    let lines = [
        format!("switchboard gateway v{}", env!("CARGO_PKG_VERSION")),
        format!("listening on http://{}", listener.local_addr()?),
        "webhooks: POST /api/webhooks/{assistant|agent}".to_string(),
    ];
    let width = lines.iter().map(|l| l.len()).max().unwrap_or(0) + 4;
    info!("┌{}┐", "─".repeat(width));
    for line in &lines {
        info!("│  {:<w$}│", line, w = width - 2);
    }
    info!("└{}┘", "─".repeat(width));

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::warn!("failed to listen for ctrl-c: {e}");
                std::future::pending::<()>().await;
            }
            info!("shutdown requested");
        })
        .await?;
    switchboard.shutdown();
    Ok(())
}
