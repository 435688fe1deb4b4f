//! HTTP/WebSocket server
//!
//! The control plane (start/end/health) plus the two per-call WebSocket
//! endpoints: the client application stream and the carrier media stream.

pub mod calls;
pub mod client_ws;
pub mod media_ws;

use anyhow::{Context, Result};
use axum::{
    routing::{any, get, post},
    Json, Router,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::call_manager::CallManager;
use crate::config::Config;
use crate::db::CallStore;
use crate::stt::FallbackStt;
use crate::telephony::CarrierClient;
use crate::vad::silero;

/// Shared server state
#[derive(Clone)]
pub struct ServerState {
    pub config: Arc<Config>,
    pub call_manager: Arc<CallManager>,
    pub store: Arc<CallStore>,
    pub stt: Arc<FallbackStt>,
    pub carrier: Arc<CarrierClient>,
}

/// Start the relay server.
pub async fn start(mut config: Config) -> Result<()> {
    // The neural VAD model must be on disk before the first call; fall back
    // to server-side VAD when it cannot be fetched.
    if config.local_vad.enabled {
        let model_path = config.vad_model_path()?;
        let client = reqwest::Client::new();
        if let Err(e) = silero::ensure_model(&client, &model_path).await {
            warn!("Silero VAD model unavailable ({e}); falling back to server VAD");
            config.local_vad.enabled = false;
        }
    }

    let config = Arc::new(config);
    let store = Arc::new(
        CallStore::open(config.store_path()?)
            .await
            .context("Failed to open call store")?,
    );
    let carrier = Arc::new(CarrierClient::new(&config));
    let call_manager = CallManager::new(store.clone(), carrier.clone());
    let stt = Arc::new(FallbackStt::new(&config));

    let state = ServerState {
        config: config.clone(),
        call_manager: call_manager.clone(),
        store,
        stt,
        carrier,
    };

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = Router::new()
        .route("/health", get(health))
        .route("/calls/start", post(calls::start_call))
        .route("/calls/end", post(calls::end_call))
        .route("/calls/{call_id}/stream", any(client_ws::ws_handler))
        .route("/calls/{call_id}/media-stream", any(media_ws::ws_handler))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port)
        .parse()
        .context("Invalid listen address")?;
    info!("Relay server listening on {addr}");

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .context("Failed to bind listen address")?;

    let shutdown_manager = call_manager.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutdown signal received");
            shutdown_manager.shutdown_all().await;
        })
        .await
        .context("Server error")?;

    Ok(())
}

async fn health(
    axum::extract::State(state): axum::extract::State<ServerState>,
) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "active_calls": state.call_manager.active_call_count(),
    }))
}
