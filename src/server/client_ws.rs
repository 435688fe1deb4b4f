//! Client application WebSocket
//!
//! One socket per call. Inbound: user audio chunks, the client-VAD commit
//! signal, text input, typing state, and the explicit end. Outbound:
//! captions, recipient audio, status, recovery and guardrail notifications —
//! all funneled through an mpsc channel so a single sender task owns the
//! socket's write half.

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, State,
    },
    response::Response,
};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::types::{CallStatus, ClientMessage, ServerMessage};

use super::ServerState;

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Path(call_id): Path<String>,
    State(state): State<ServerState>,
) -> Response {
    ws.on_upgrade(move |socket| handle_client_socket(socket, call_id, state))
}

async fn handle_client_socket(ws: WebSocket, call_id: String, state: ServerState) {
    info!("Client WebSocket connected (call={call_id})");
    let (mut ws_tx, mut ws_rx) = ws.split();

    let Some(call) = state.call_manager.get_call(&call_id) else {
        let msg = ServerMessage::Error {
            message: "Call not found".to_string(),
        };
        if let Ok(payload) = serde_json::to_string(&msg) {
            let _ = ws_tx.send(Message::Text(payload.into())).await;
        }
        let _ = ws_tx.close().await;
        return;
    };

    let (tx, mut rx) = mpsc::channel::<String>(64);
    state.call_manager.register_client_sender(&call_id, tx);

    let sender_task = tokio::spawn(async move {
        while let Some(payload) = rx.recv().await {
            if ws_tx.send(Message::Text(payload.into())).await.is_err() {
                break;
            }
        }
        let _ = ws_tx.close().await;
    });

    // The carrier's media stream may not have attached yet.
    if call.lock().await.status != CallStatus::Connected {
        state
            .call_manager
            .send_to_client(
                &call_id,
                ServerMessage::CallStatus {
                    status: "waiting".to_string(),
                    message: Some("Placing the call...".to_string()),
                    result: None,
                    data: None,
                },
            )
            .await;
    }

    let mut end_reason = "app_disconnected";
    while let Some(Ok(msg)) = ws_rx.next().await {
        let text = match msg {
            Message::Text(text) => text,
            Message::Close(_) => break,
            _ => continue,
        };
        let parsed: ClientMessage = match serde_json::from_str(text.as_str()) {
            Ok(parsed) => parsed,
            Err(e) => {
                debug!("Client message parse error (call={call_id}): {e}");
                continue;
            }
        };

        // The pipeline attaches when the media stream does; until then
        // client traffic is dropped.
        let Some(pipeline) = state.call_manager.get_pipeline(&call_id) else {
            continue;
        };

        match parsed {
            ClientMessage::AudioChunk { audio } => {
                pipeline.handle_user_audio(&audio).await;
            }
            ClientMessage::VadState { state: vad_state } => {
                if vad_state == "committed" {
                    pipeline.handle_user_audio_commit().await;
                }
            }
            ClientMessage::TextInput { text } => {
                if !text.is_empty() {
                    pipeline.handle_user_text(&text).await;
                }
            }
            ClientMessage::TypingState => {
                pipeline.handle_typing_started().await;
            }
            ClientMessage::EndCall => {
                info!("User ended call via WebSocket (call={call_id})");
                end_reason = "user_hangup";
                break;
            }
        }
    }

    info!("Client WebSocket closing (call={call_id}, reason={end_reason})");
    state.call_manager.cleanup_call(&call_id, end_reason).await;
    // Cleanup dropped the registered sender, so the send loop drains the
    // final status message and exits on its own.
    let _ = tokio::time::timeout(std::time::Duration::from_secs(1), sender_task).await;
}
