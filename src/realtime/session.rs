//! One WebSocket to the upstream bidirectional realtime LLM
//!
//! Owns the socket, exposes the outgoing message primitives, and runs the
//! read loop that dispatches parsed events to registered handlers. The
//! handlers are registered per event type and deduplicated; dispatch happens
//! in upstream order on the session's own read task.

use futures::future::BoxFuture;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::types::{SessionLabel, UpstreamSessionConfig, VadMode};

// Incoming event types consumed downstream.
pub const EV_SESSION_CREATED: &str = "session.created";
pub const EV_SESSION_UPDATED: &str = "session.updated";
pub const EV_RESPONSE_AUDIO_DELTA: &str = "response.audio.delta";
pub const EV_RESPONSE_AUDIO_TRANSCRIPT_DELTA: &str = "response.audio_transcript.delta";
pub const EV_RESPONSE_AUDIO_TRANSCRIPT_DONE: &str = "response.audio_transcript.done";
pub const EV_RESPONSE_TEXT_DELTA: &str = "response.text.delta";
pub const EV_RESPONSE_TEXT_DONE: &str = "response.text.done";
pub const EV_RESPONSE_DONE: &str = "response.done";
pub const EV_SPEECH_STARTED: &str = "input_audio_buffer.speech_started";
pub const EV_SPEECH_STOPPED: &str = "input_audio_buffer.speech_stopped";
pub const EV_AUDIO_COMMITTED: &str = "input_audio_buffer.committed";
pub const EV_INPUT_TRANSCRIPTION_COMPLETED: &str =
    "conversation.item.input_audio_transcription.completed";
pub const EV_FUNCTION_CALL_ARGS_DELTA: &str = "response.function_call_arguments.delta";
pub const EV_FUNCTION_CALL_ARGS_DONE: &str = "response.function_call_arguments.done";
pub const EV_ERROR: &str = "error";

/// Upstream error codes that are timing races, not session faults. Logged at
/// debug and never fed to recovery.
const HARMLESS_ERROR_CODES: [&str; 3] = [
    "response_cancel_not_active",
    "conversation_already_has_active_response",
    "input_audio_buffer_commit_empty",
];

pub fn is_harmless_error_code(code: &str) -> bool {
    HARMLESS_ERROR_CODES.contains(&code)
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("[{0}] websocket connect failed: {1}")]
    Connect(SessionLabel, String),
    #[error("[{0}] websocket send failed: {1}")]
    Send(SessionLabel, String),
}

type WsConn = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsConn, Message>;
type WsSource = SplitStream<WsConn>;

/// Handler invoked with the parsed event payload.
pub type EventHandler = Arc<dyn Fn(Arc<Value>) -> BoxFuture<'static, ()> + Send + Sync>;
/// Invoked once when the read loop observes socket closure.
pub type ConnectionLostHandler = Arc<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;

/// A single upstream realtime session.
pub struct RealtimeSession {
    pub label: SessionLabel,
    session_config: UpstreamSessionConfig,
    config: Arc<Config>,
    writer: tokio::sync::Mutex<Option<WsSink>>,
    reader: tokio::sync::Mutex<Option<WsSource>>,
    session_id: Mutex<String>,
    closed: AtomicBool,
    handlers: Mutex<HashMap<String, Vec<EventHandler>>>,
    on_connection_lost: Mutex<Option<ConnectionLostHandler>>,
}

impl RealtimeSession {
    pub fn new(
        label: SessionLabel,
        session_config: UpstreamSessionConfig,
        config: Arc<Config>,
    ) -> Self {
        Self {
            label,
            session_config,
            config,
            writer: tokio::sync::Mutex::new(None),
            reader: tokio::sync::Mutex::new(None),
            session_id: Mutex::new(String::new()),
            closed: AtomicBool::new(true),
            handlers: Mutex::new(HashMap::new()),
            on_connection_lost: Mutex::new(None),
        }
    }

    pub fn session_config(&self) -> &UpstreamSessionConfig {
        &self.session_config
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn session_id(&self) -> String {
        self.session_id.lock().unwrap().clone()
    }

    /// Register an event handler (deduplicated by identity).
    pub fn on(&self, event_type: &str, handler: EventHandler) {
        let mut handlers = self.handlers.lock().unwrap();
        let entry = handlers.entry(event_type.to_string()).or_default();
        if !entry.iter().any(|h| Arc::ptr_eq(h, &handler)) {
            entry.push(handler);
        }
    }

    pub fn set_on_connection_lost(&self, handler: ConnectionLostHandler) {
        *self.on_connection_lost.lock().unwrap() = Some(handler);
    }

    /// Open the WebSocket and send the session-configuration message.
    pub async fn connect(
        &self,
        system_prompt: &str,
        tools: Option<&[Value]>,
    ) -> Result<(), SessionError> {
        let url = format!(
            "{}?model={}",
            self.config.upstream.realtime_url, self.config.upstream.realtime_model
        );
        let mut request = url
            .into_client_request()
            .map_err(|e| SessionError::Connect(self.label, e.to_string()))?;
        let headers = request.headers_mut();
        headers.insert(
            "Authorization",
            format!("Bearer {}", self.config.upstream.api_key)
                .parse()
                .map_err(|_| {
                    SessionError::Connect(self.label, "invalid api key header".to_string())
                })?,
        );
        headers.insert("OpenAI-Beta", "realtime=v1".parse().expect("static header"));

        info!("[{}] Connecting to upstream realtime service...", self.label);
        let (ws, _) = connect_async(request)
            .await
            .map_err(|e| SessionError::Connect(self.label, e.to_string()))?;
        info!("[{}] Connected", self.label);

        let (sink, source) = ws.split();
        *self.writer.lock().await = Some(sink);
        *self.reader.lock().await = Some(source);
        self.closed.store(false, Ordering::SeqCst);

        self.send(self.build_session_update(system_prompt, tools))
            .await
    }

    fn build_session_update(&self, system_prompt: &str, tools: Option<&[Value]>) -> Value {
        let sc = &self.session_config;
        let turn_detection = match sc.vad_mode {
            VadMode::Server => json!({
                "type": "server_vad",
                "threshold": self.config.session_b.server_vad_threshold,
                "silence_duration_ms": self.config.session_b.server_vad_silence_ms,
                "prefix_padding_ms": self.config.session_b.server_vad_prefix_padding_ms,
            }),
            // Client- or relay-side VAD: the upstream never auto-commits.
            VadMode::Client | VadMode::Local => Value::Null,
        };

        let mut session = json!({
            "modalities": sc.modalities,
            "instructions": system_prompt,
            "input_audio_format": sc.input_audio_format,
            "output_audio_format": sc.output_audio_format,
            "turn_detection": turn_detection,
        });

        if let Some(transcription) = &sc.input_transcription {
            session["input_audio_transcription"] =
                serde_json::to_value(transcription).unwrap_or(Value::Null);
            info!(
                "[{}] input_audio_transcription enabled: {}",
                self.label, transcription.model
            );
        }

        let tools = tools.or(sc.tools.as_deref());
        if let Some(tools) = tools {
            if !tools.is_empty() {
                session["tools"] = Value::Array(tools.to_vec());
                session["tool_choice"] = json!("auto");
                info!(
                    "[{}] Function calling enabled with {} tools",
                    self.label,
                    tools.len()
                );
            }
        }

        json!({ "type": "session.update", "session": session })
    }

    // --- Outgoing primitives ---

    pub async fn send_audio(&self, audio_b64: &str) -> Result<(), SessionError> {
        self.send(json!({
            "type": "input_audio_buffer.append",
            "audio": audio_b64,
        }))
        .await
    }

    /// Add one user text item to the conversation. Always followed by a
    /// separate `create_response` when a reply is wanted.
    pub async fn send_text_item(&self, text: &str) -> Result<(), SessionError> {
        self.send(json!({
            "type": "conversation.item.create",
            "item": {
                "type": "message",
                "role": "user",
                "content": [{"type": "input_text", "text": text}],
            },
        }))
        .await
    }

    pub async fn commit_audio(&self) -> Result<(), SessionError> {
        self.send(json!({"type": "input_audio_buffer.commit"})).await
    }

    pub async fn clear_input_buffer(&self) -> Result<(), SessionError> {
        self.send(json!({"type": "input_audio_buffer.clear"})).await
    }

    pub async fn create_response(&self, instructions: Option<&str>) -> Result<(), SessionError> {
        let msg = match instructions {
            Some(instructions) => json!({
                "type": "response.create",
                "response": {"instructions": instructions},
            }),
            None => json!({"type": "response.create"}),
        };
        self.send(msg).await
    }

    pub async fn cancel_response(&self) -> Result<(), SessionError> {
        self.send(json!({"type": "response.cancel"})).await?;
        info!("[{}] Response cancelled", self.label);
        Ok(())
    }

    pub async fn send_function_call_output(
        &self,
        call_id: &str,
        output: &str,
    ) -> Result<(), SessionError> {
        self.send(json!({
            "type": "conversation.item.create",
            "item": {
                "type": "function_call_output",
                "call_id": call_id,
                "output": output,
            },
        }))
        .await?;
        self.create_response(None).await?;
        info!("[{}] Function call output sent for call_id={}", self.label, call_id);
        Ok(())
    }

    async fn send(&self, value: Value) -> Result<(), SessionError> {
        if self.closed.load(Ordering::SeqCst) {
            return Ok(());
        }
        let mut writer = self.writer.lock().await;
        if let Some(sink) = writer.as_mut() {
            let payload = serde_json::to_string(&value).unwrap_or_default();
            sink.send(Message::text(payload))
                .await
                .map_err(|e| SessionError::Send(self.label, e.to_string()))?;
        }
        Ok(())
    }

    /// Read loop: parse events, record the session id, dispatch handlers in
    /// upstream order. Sets closed and fires the connection-lost callback on
    /// socket closure.
    pub async fn listen(&self) {
        let mut source = match self.reader.lock().await.take() {
            Some(source) => source,
            None => return,
        };

        while let Some(msg) = source.next().await {
            if self.closed.load(Ordering::SeqCst) {
                break;
            }
            let raw = match msg {
                Ok(Message::Text(text)) => text,
                Ok(Message::Close(_)) => break,
                Ok(_) => continue,
                Err(e) => {
                    warn!("[{}] read error: {e}", self.label);
                    break;
                }
            };

            let event: Value = match serde_json::from_str(raw.as_str()) {
                Ok(v) => v,
                Err(_) => continue,
            };
            let event_type = event
                .get("type")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();

            if event_type == EV_SESSION_CREATED {
                let id = event
                    .pointer("/session/id")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                info!("[{}] Session created: {id}", self.label);
                *self.session_id.lock().unwrap() = id;
            }

            if event_type == EV_ERROR {
                let code = event
                    .pointer("/error/code")
                    .and_then(Value::as_str)
                    .unwrap_or_default();
                if is_harmless_error_code(code) {
                    debug!("[{}] Ignoring non-critical error ({code})", self.label);
                } else {
                    error!("[{}] Error event: {event}", self.label);
                }
            }

            let handlers: Vec<EventHandler> = {
                let map = self.handlers.lock().unwrap();
                map.get(&event_type).cloned().unwrap_or_default()
            };
            let payload = Arc::new(event);
            for handler in handlers {
                handler(payload.clone()).await;
            }
        }

        info!("[{}] Connection closed", self.label);
        self.closed.store(true, Ordering::SeqCst);
        let callback = self.on_connection_lost.lock().unwrap().clone();
        if let Some(callback) = callback {
            callback().await;
        }
    }

    pub async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let mut writer = self.writer.lock().await;
        if let Some(mut sink) = writer.take() {
            let _ = sink.send(Message::Close(None)).await;
            info!("[{}] Session closed", self.label);
        }
        self.reader.lock().await.take();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::InputTranscription;

    fn session(vad_mode: VadMode, transcription: bool) -> RealtimeSession {
        RealtimeSession::new(
            SessionLabel::B,
            UpstreamSessionConfig {
                label: SessionLabel::B,
                input_audio_format: "g711_ulaw".to_string(),
                output_audio_format: "pcm16".to_string(),
                modalities: vec!["text".to_string()],
                vad_mode,
                input_transcription: transcription.then(|| InputTranscription {
                    model: "whisper-1".to_string(),
                    language: Some("ko".to_string()),
                }),
                tools: None,
            },
            Arc::new(Config::default()),
        )
    }

    #[test]
    fn test_session_update_server_vad() {
        let s = session(VadMode::Server, false);
        let update = s.build_session_update("prompt", None);
        assert_eq!(update["type"], "session.update");
        assert_eq!(update["session"]["turn_detection"]["type"], "server_vad");
        assert_eq!(update["session"]["input_audio_format"], "g711_ulaw");
    }

    #[test]
    fn test_session_update_null_turn_detection() {
        let s = session(VadMode::Local, true);
        let update = s.build_session_update("prompt", None);
        assert!(update["session"]["turn_detection"].is_null());
        assert_eq!(
            update["session"]["input_audio_transcription"]["model"],
            "whisper-1"
        );
    }

    #[test]
    fn test_session_update_tools() {
        let s = session(VadMode::Local, false);
        let tools = vec![json!({"type": "function", "name": "collect_info"})];
        let update = s.build_session_update("prompt", Some(&tools));
        assert_eq!(update["session"]["tool_choice"], "auto");
        assert_eq!(update["session"]["tools"][0]["name"], "collect_info");
    }

    #[test]
    fn test_harmless_error_codes() {
        assert!(is_harmless_error_code("response_cancel_not_active"));
        assert!(is_harmless_error_code("input_audio_buffer_commit_empty"));
        assert!(!is_harmless_error_code("server_error"));
    }

    #[test]
    fn test_handler_dedup() {
        let s = session(VadMode::Local, false);
        let handler: EventHandler = Arc::new(|_| Box::pin(async {}));
        s.on(EV_RESPONSE_DONE, handler.clone());
        s.on(EV_RESPONSE_DONE, handler.clone());
        assert_eq!(s.handlers.lock().unwrap()[EV_RESPONSE_DONE].len(), 1);
        let other: EventHandler = Arc::new(|_| Box::pin(async {}));
        s.on(EV_RESPONSE_DONE, other);
        assert_eq!(s.handlers.lock().unwrap()[EV_RESPONSE_DONE].len(), 2);
    }
}
