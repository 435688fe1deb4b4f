//! Call control plane
//!
//! POST /calls/start — create the call, dial out through the carrier, and
//! connect both upstream sessions. The pipeline itself is assembled when the
//! carrier's media stream attaches (see media_ws).
//!
//! POST /calls/end — explicit user end path.

use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use std::sync::Arc;
use tracing::{error, info};

use crate::prompt;
use crate::realtime::dual::DualSessionManager;
use crate::tools;
use crate::types::{Call, CallEndRequest, CallStartRequest, CallStartResponse, CallStatus};

use super::ServerState;

type ApiError = (StatusCode, Json<serde_json::Value>);

fn api_error(status: StatusCode, message: impl Into<String>) -> ApiError {
    (
        status,
        Json(serde_json::json!({"error": message.into()})),
    )
}

pub async fn start_call(
    State(state): State<ServerState>,
    Json(request): Json<CallStartRequest>,
) -> Result<Json<CallStartResponse>, ApiError> {
    request
        .validate()
        .map_err(|e| api_error(StatusCode::BAD_REQUEST, e.to_string()))?;

    let call_id = request.call_id.clone();
    if state.call_manager.get_call(&call_id).is_some() {
        return Err(api_error(StatusCode::CONFLICT, "call already exists"));
    }

    info!(
        "Starting call {call_id}: {:?}/{:?} {}→{}",
        request.mode, request.communication_mode, request.source_language, request.target_language
    );

    let call = Arc::new(tokio::sync::Mutex::new(Call::new(&request)));
    state.call_manager.register_call(&call_id, call.clone());

    // Prompts, honoring the control plane's override for Session A.
    let (prompt_a, prompt_b) = {
        let call = call.lock().await;
        let prompt_a = request
            .system_prompt_override
            .clone()
            .unwrap_or_else(|| prompt::session_a_prompt(&call));
        (prompt_a, prompt::session_b_prompt(&call))
    };
    {
        let mut call = call.lock().await;
        call.status = CallStatus::Dialing;
    }

    // Dial out: the carrier will connect its media stream back to us.
    let stream_url = format!(
        "{}/calls/{call_id}/media-stream",
        state
            .config
            .server
            .public_url
            .replacen("http", "ws", 1)
    );
    let carrier_call_id = match state.carrier.place_call(&request.phone_number, &stream_url).await
    {
        Ok(sid) => sid,
        Err(e) => {
            error!("Dial failed for call {call_id}: {e}");
            state.call_manager.cleanup_call(&call_id, "dial_failed").await;
            return Err(api_error(StatusCode::BAD_GATEWAY, "failed to place the call"));
        }
    };
    call.lock().await.carrier_call_id = carrier_call_id.clone();

    // Connect both upstream sessions concurrently.
    let dual = Arc::new(DualSessionManager::new(
        state.config.clone(),
        request.communication_mode,
        &request.target_language,
        tools::tools_for_mode(request.mode),
    ));
    if let Err(e) = dual.connect(&prompt_a, &prompt_b).await {
        error!("Upstream connect failed for call {call_id}: {e}");
        state
            .call_manager
            .cleanup_call(&call_id, "upstream_connect_failed")
            .await;
        return Err(api_error(
            StatusCode::BAD_GATEWAY,
            "failed to connect translation sessions",
        ));
    }
    state.call_manager.register_session(&call_id, dual.clone());
    {
        let mut call = call.lock().await;
        call.session_a_id = dual.session_a.session_id();
        call.session_b_id = dual.session_b.session_id();
        call.prompt_a = prompt_a;
        call.prompt_b = prompt_b;
    }

    // Run both read loops for the lifetime of the call.
    let listen_dual = dual.clone();
    state.call_manager.register_listen_task(
        &call_id,
        tokio::spawn(async move { listen_dual.listen_all().await }),
    );

    Ok(Json(CallStartResponse {
        call_id: call_id.clone(),
        carrier_call_id,
        stream_ws_path: format!("/calls/{call_id}/stream"),
    }))
}

pub async fn end_call(
    State(state): State<ServerState>,
    Json(request): Json<CallEndRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    if state.call_manager.get_call(&request.call_id).is_none() {
        return Err(api_error(StatusCode::NOT_FOUND, "call not found"));
    }
    info!("End requested for call {} ({})", request.call_id, request.reason);
    state
        .call_manager
        .cleanup_call(&request.call_id, &request.reason)
        .await;
    Ok(Json(serde_json::json!({"status": "ok"})))
}
