//! Carrier media stream WebSocket
//!
//! The endpoint the carrier connects back to after the outbound dial. The
//! per-call pipeline is assembled here — this socket is the last edge to
//! attach, so by now the call, the session pair, and (usually) the client
//! socket all exist.

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, State,
    },
    response::Response,
};
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::realtime::pipeline::{build_pipeline, PipelineDeps};
use crate::realtime::NotifySink;
use crate::telephony::{MediaInbound, TelephonyMediaHandler};
use crate::types::ServerMessage;
use crate::vad::silero::{SileroModel, SpeechModel};

use super::ServerState;

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Path(call_id): Path<String>,
    State(state): State<ServerState>,
) -> Response {
    ws.on_upgrade(move |socket| handle_media_socket(socket, call_id, state))
}

async fn handle_media_socket(ws: WebSocket, call_id: String, state: ServerState) {
    info!("Telephony media WebSocket connected (call={call_id})");
    let (mut ws_tx, mut ws_rx) = ws.split();

    let (call, dual) = match (
        state.call_manager.get_call(&call_id),
        state.call_manager.get_session(&call_id),
    ) {
        (Some(call), Some(dual)) => (call, dual),
        _ => {
            warn!("Media stream for unknown call {call_id}");
            let _ = ws_tx.close().await;
            return;
        }
    };

    let (tx, mut rx) = mpsc::channel::<String>(256);
    let telephony = TelephonyMediaHandler::new(tx);

    let sender_task = tokio::spawn(async move {
        while let Some(payload) = rx.recv().await {
            if ws_tx.send(Message::Text(payload.into())).await.is_err() {
                break;
            }
        }
        let _ = ws_tx.close().await;
    });

    // Assemble and start the pipeline now that all edges exist.
    let vad_model = load_vad_model(&state).await;
    let (communication_mode, prompt_a, prompt_b) = {
        let call = call.lock().await;
        (
            call.communication_mode,
            call.prompt_a.clone(),
            call.prompt_b.clone(),
        )
    };
    let notify: NotifySink = {
        let manager = state.call_manager.clone();
        let call_id = call_id.clone();
        Arc::new(move |msg: ServerMessage| {
            let manager = manager.clone();
            let call_id = call_id.clone();
            Box::pin(async move { manager.send_to_client(&call_id, msg).await })
        })
    };
    let pipeline = build_pipeline(
        communication_mode,
        PipelineDeps {
            config: state.config.clone(),
            call: call.clone(),
            dual,
            telephony: telephony.clone(),
            notify,
            store: state.store.clone(),
            stt: state.stt.clone(),
            vad_model,
            prompt_a,
            prompt_b,
        },
    );
    state.call_manager.register_pipeline(&call_id, pipeline.clone());
    pipeline.start().await;

    while let Some(Ok(msg)) = ws_rx.next().await {
        let text = match msg {
            Message::Text(text) => text,
            Message::Close(_) => break,
            _ => continue,
        };
        match telephony.handle_message(text.as_str()) {
            MediaInbound::Audio(audio) => {
                pipeline.handle_telephony_audio(&audio).await;
            }
            MediaInbound::Started(stream_sid) => {
                call.lock().await.stream_sid = stream_sid;
            }
            MediaInbound::Stopped => break,
            MediaInbound::Ignored => {}
        }
    }

    info!("Telephony media WebSocket closing (call={call_id})");
    state
        .call_manager
        .cleanup_call(&call_id, "carrier_disconnected")
        .await;
    sender_task.abort();
}

/// Load the Silero model off the async threads. None disables local VAD for
/// this call (server VAD takes over).
async fn load_vad_model(state: &ServerState) -> Option<Box<dyn SpeechModel>> {
    if !state.config.local_vad.enabled {
        return None;
    }
    let path = match state.config.vad_model_path() {
        Ok(path) => path,
        Err(e) => {
            warn!("VAD model path unavailable: {e}");
            return None;
        }
    };
    match tokio::task::spawn_blocking(move || SileroModel::load(&path)).await {
        Ok(Ok(model)) => Some(Box::new(model) as Box<dyn SpeechModel>),
        Ok(Err(e)) => {
            warn!("Failed to load Silero VAD model: {e}");
            None
        }
        Err(e) => {
            warn!("VAD model load task failed: {e}");
            None
        }
    }
}
