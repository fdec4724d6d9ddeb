//! HTTP monitoring endpoints using Axum.

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use courier_core::{Bridge, BrokerHandle, ServiceRouter};
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

/// State shared across handlers.
pub struct AppState {
    pub broker: BrokerHandle,
    /// Bridge the router runs on, also used to query the directory.
    pub bridge: Option<Bridge>,
    /// Present when the broker also routes calls for the shared outbound address.
    pub router: Option<ServiceRouter>,
}

async fn handle_health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(json!({"status": "ok", "routing": state.router.is_some()}))
}

async fn handle_stats(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.broker.stats())
}

/// Lists the directory by calling it through the broker.
async fn handle_services(State(state): State<Arc<AppState>>) -> Response {
    let Some(bridge) = &state.bridge else {
        let body = Json(json!({"error": "routing is disabled"}));
        return (StatusCode::NOT_FOUND, body).into_response();
    };
    match bridge.directory().list().await {
        Ok(services) => Json(services).into_response(),
        Err(e) => {
            warn!("Directory listing failed: {}", e);
            (StatusCode::BAD_GATEWAY, Json(json!({"error": e.to_string()}))).into_response()
        }
    }
}

pub fn router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(handle_health))
        .route("/stats", get(handle_stats))
        .route("/services", get(handle_services))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Start the monitoring server.
///
/// Returns the actual address the server is bound to (useful when port=0).
pub async fn start_server(
    state: Arc<AppState>,
    host: &str,
    port: u16,
) -> anyhow::Result<SocketAddr> {
    let addr: SocketAddr = format!("{}:{}", host, port).parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    let actual_addr = listener.local_addr()?;

    info!("Monitoring server listening on {}", actual_addr);

    let app = router(state);
    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            error!("Monitoring server error: {}", e);
        }
    });

    Ok(actual_addr)
}
