use axum::{extract::State, http::Method, routing::get, Json, Router};
use serde::Serialize;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

/// Shared state for the HTTP API.  The graph carries all application
/// traffic; HTTP only exposes what a browser cannot get any other way.
#[derive(Clone)]
pub struct AppState {
    /// base64url VAPID public key clients pass as `applicationServerKey`.
    pub vapid_public_key: String,
}

pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::OPTIONS])
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health_check))
        .route("/vapidPublicKey", get(vapid_public_key))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
}

#[derive(Serialize)]
struct VapidKeyResponse {
    key: String,
}

async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse { status: "OK" })
}

async fn vapid_public_key(State(state): State<AppState>) -> Json<VapidKeyResponse> {
    Json(VapidKeyResponse {
        key: state.vapid_public_key,
    })
}

pub async fn serve(state: AppState, addr: std::net::SocketAddr) -> anyhow::Result<()> {
    let app = build_router(state);

    info!(addr = %addr, "Starting HTTP API server");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app.into_make_service()).await?;

    Ok(())
}
