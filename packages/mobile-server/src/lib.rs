pub mod broker;
pub mod protocol;
pub mod ws;

use std::path::Path;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{any, get};
use axum::{Json, Router};
use tokio::signal;
use tower_http::cors::{Any, CorsLayer};
use tower_http::services::ServeDir;

pub use broker::Broker;

/// Shared state for all routes.
#[derive(Clone)]
pub struct AppState {
    pub broker: Arc<Broker>,
}

/// Build the full router: config API, the two WebSocket planes, static
/// assets and the SPA fallback.
pub fn build_router(broker: Arc<Broker>) -> Router {
    let assets_dir = Path::new(&broker.config().frontend_dir).join("assets");
    let state = AppState { broker };

    Router::new()
        .route("/api/config", get(config_handler))
        .route("/ws/control", get(ws::control_handler))
        .route("/ws/terminal", get(ws::terminal_handler))
        .route("/ws/{*rest}", any(ws_not_found))
        .nest_service("/assets", ServeDir::new(assets_dir))
        .fallback(spa_fallback)
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state)
}

/// Run the server until a shutdown signal arrives, then stop the broker
/// before the listener closes.
pub async fn serve(broker: Arc<Broker>) -> std::io::Result<()> {
    broker.start();

    let host = broker.config().host.clone();
    let port = broker.config().port;
    let app = build_router(broker.clone());

    let addr = format!("{}:{}", host, port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    println!("tmux-mobile server running at http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(broker))
        .await
}

/// `GET /api/config`: public client bootstrap values. The token and
/// password never appear here.
async fn config_handler(State(state): State<AppState>) -> Json<serde_json::Value> {
    let config = state.broker.config();
    Json(serde_json::json!({
        "passwordRequired": config.password.is_some(),
        "scrollbackLines": config.scrollback_lines,
        "pollIntervalMs": config.poll_interval_ms,
    }))
}

/// Anything under /ws/ that is not one of the two upgrade endpoints.
async fn ws_not_found() -> StatusCode {
    StatusCode::NOT_FOUND
}

/// SPA fallback: every non-API, non-WebSocket path serves the frontend's
/// index.html.
async fn spa_fallback(State(state): State<AppState>) -> Response {
    let index_path = Path::new(&state.broker.config().frontend_dir).join("index.html");
    match tokio::fs::read_to_string(&index_path).await {
        Ok(content) => Response::builder()
            .status(StatusCode::OK)
            .header("Content-Type", "text/html; charset=utf-8")
            .body(Body::from(content))
            .unwrap_or_else(|_| Response::new(Body::empty())),
        Err(_) => (StatusCode::INTERNAL_SERVER_ERROR, "Frontend not built").into_response(),
    }
}

/// Wait for ctrl-c or SIGTERM, then stop the broker.
async fn shutdown_signal(broker: Arc<Broker>) {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    println!("\nShutting down...");
    broker.stop().await;
}
