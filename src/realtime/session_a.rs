//! Session A handler — outbound translation (user -> recipient)
//!
//! Accepts user audio or text, drives the upstream session, and emits TTS
//! frames toward the carrier plus caption deltas toward the client. Tracks
//! per-turn latency from the user-input instant to the first TTS chunk and
//! runs the guardrail over the streamed translation text.
//!
//! State machine: IDLE -> GENERATING on the first audio delta of a
//! response; GENERATING -> IDLE on response.done or cancel.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use crate::guardrail::{GuardrailChecker, GuardrailLevel};
use crate::tools;
use crate::types::{Call, TranscriptEntry};

use super::session::{
    RealtimeSession, SessionError, EV_FUNCTION_CALL_ARGS_DELTA, EV_FUNCTION_CALL_ARGS_DONE,
    EV_RESPONSE_AUDIO_DELTA, EV_RESPONSE_AUDIO_TRANSCRIPT_DELTA,
    EV_RESPONSE_AUDIO_TRANSCRIPT_DONE, EV_RESPONSE_DONE, EV_RESPONSE_TEXT_DELTA,
    EV_RESPONSE_TEXT_DONE,
};
use super::{AsyncHook, AudioSink, CaptionSink, TextSink, ValueSink};

/// Sinks the pipeline wires into the handler. Each is optional so pipelines
/// attach only what their mode needs.
#[derive(Default, Clone)]
pub struct SessionACallbacks {
    /// Decoded TTS bytes headed for the carrier.
    pub on_tts_audio: Option<AudioSink>,
    /// (role, delta) caption stream for the client.
    pub on_caption: Option<CaptionSink>,
    pub on_response_done: Option<AsyncHook>,
    /// (role, full text) once a translation completes.
    pub on_turn_complete: Option<CaptionSink>,
    /// Level-3 block: play this filler while correcting.
    pub on_guardrail_filler: Option<TextSink>,
    /// Level-3 block: corrected text to re-synthesize.
    pub on_guardrail_corrected: Option<TextSink>,
    /// Guardrail event payload for the client.
    pub on_guardrail_event: Option<ValueSink>,
    /// Agent mode: end_call_judgment payload.
    pub on_call_judgement: Option<ValueSink>,
}

struct AState {
    is_generating: bool,
    first_delta_seen: bool,
    user_input_at: Option<Instant>,
    transcript_buffer: String,
    fn_args: HashMap<String, String>,
    fn_names: HashMap<String, String>,
}

pub struct SessionAHandler {
    pub session: Arc<RealtimeSession>,
    call: Arc<tokio::sync::Mutex<Call>>,
    guardrail: Option<Arc<GuardrailChecker>>,
    callbacks: SessionACallbacks,
    state: Mutex<AState>,
    done_notify: Notify,
}

impl SessionAHandler {
    pub fn new(
        session: Arc<RealtimeSession>,
        call: Arc<tokio::sync::Mutex<Call>>,
        guardrail: Option<Arc<GuardrailChecker>>,
        callbacks: SessionACallbacks,
    ) -> Arc<Self> {
        Arc::new(Self {
            session,
            call,
            guardrail,
            callbacks,
            state: Mutex::new(AState {
                is_generating: false,
                first_delta_seen: false,
                user_input_at: None,
                transcript_buffer: String::new(),
                fn_args: HashMap::new(),
                fn_names: HashMap::new(),
            }),
            done_notify: Notify::new(),
        })
    }

    /// Install this handler's event hooks on the session.
    pub fn register(self: &Arc<Self>) {
        macro_rules! hook {
            ($event:expr, $method:ident) => {{
                let me = Arc::clone(self);
                self.session.on(
                    $event,
                    Arc::new(move |ev| {
                        let me = me.clone();
                        Box::pin(async move { me.$method(ev).await })
                            as futures::future::BoxFuture<'static, ()>
                    }),
                );
            }};
        }
        hook!(EV_RESPONSE_AUDIO_DELTA, handle_audio_delta);
        hook!(EV_RESPONSE_AUDIO_TRANSCRIPT_DELTA, handle_transcript_delta);
        hook!(EV_RESPONSE_TEXT_DELTA, handle_transcript_delta);
        hook!(EV_RESPONSE_AUDIO_TRANSCRIPT_DONE, handle_transcript_done);
        hook!(EV_RESPONSE_TEXT_DONE, handle_transcript_done);
        hook!(EV_RESPONSE_DONE, handle_response_done);
        hook!(EV_FUNCTION_CALL_ARGS_DELTA, handle_function_call_delta);
        hook!(EV_FUNCTION_CALL_ARGS_DONE, handle_function_call_done);
    }

    pub fn is_generating(&self) -> bool {
        self.state.lock().unwrap().is_generating
    }

    /// Timestamp the user-input instant for the next turn-latency sample.
    pub fn mark_user_input(&self) {
        self.state.lock().unwrap().user_input_at = Some(Instant::now());
    }

    // --- User input ---

    pub async fn send_user_audio(&self, audio_b64: &str) -> Result<(), SessionError> {
        self.session.send_audio(audio_b64).await
    }

    /// Client VAD signalled end-of-utterance: commit and request a response.
    pub async fn commit_user_audio(&self) -> Result<(), SessionError> {
        self.mark_user_input();
        self.session.commit_audio().await?;
        self.session.create_response(None).await
    }

    /// Send user text and request a response. Callers wrap relay-mode
    /// payloads as `[User says in <lang>]: <text>` themselves.
    pub async fn send_user_text(&self, text: &str) -> Result<(), SessionError> {
        self.mark_user_input();
        self.session.send_text_item(text).await?;
        self.session.create_response(None).await
    }

    /// Cancel any in-flight response.
    pub async fn cancel(&self) {
        {
            let mut state = self.state.lock().unwrap();
            state.is_generating = false;
            state.first_delta_seen = false;
        }
        if let Some(guardrail) = &self.guardrail {
            guardrail.reset();
        }
        if let Err(e) = self.session.cancel_response().await {
            warn!("[SessionA] cancel failed: {e}");
        }
        self.done_notify.notify_waiters();
    }

    /// Wait until the current response finishes. Returns false on timeout.
    pub async fn wait_for_done(&self, timeout: Duration) -> bool {
        if !self.is_generating() {
            return true;
        }
        tokio::time::timeout(timeout, self.done_notify.notified())
            .await
            .is_ok()
    }

    // --- Upstream events ---

    async fn handle_audio_delta(&self, event: Arc<Value>) {
        let delta_b64 = event.get("delta").and_then(Value::as_str).unwrap_or("");
        if delta_b64.is_empty() {
            return;
        }

        let latency_from = {
            let mut state = self.state.lock().unwrap();
            state.is_generating = true;
            if !state.first_delta_seen {
                state.first_delta_seen = true;
                state.user_input_at.take()
            } else {
                None
            }
        };

        if let Some(input_at) = latency_from {
            let latency_ms = input_at.elapsed().as_secs_f64() * 1000.0;
            let mut call = self.call.lock().await;
            call.metrics.session_a_latencies_ms.push(latency_ms);
            call.metrics.turn_count += 1;
            debug!("[SessionA] turn latency {latency_ms:.0}ms");
        }

        if let Some(guardrail) = &self.guardrail {
            if guardrail.is_blocking() {
                debug!("[SessionA] TTS delta withheld (guardrail level 3)");
                return;
            }
        }

        let Ok(audio) = BASE64.decode(delta_b64) else {
            return;
        };
        if let Some(sink) = &self.callbacks.on_tts_audio {
            sink(audio).await;
        }
    }

    async fn handle_transcript_delta(&self, event: Arc<Value>) {
        let delta = event.get("delta").and_then(Value::as_str).unwrap_or("");
        if delta.is_empty() {
            return;
        }
        self.state
            .lock()
            .unwrap()
            .transcript_buffer
            .push_str(delta);
        if let Some(guardrail) = &self.guardrail {
            guardrail.check_text_delta(delta);
        }
        if let Some(sink) = &self.callbacks.on_caption {
            sink("user".to_string(), delta.to_string()).await;
        }
    }

    async fn handle_transcript_done(&self, event: Arc<Value>) {
        let transcript = event
            .get("transcript")
            .or_else(|| event.get("text"))
            .and_then(Value::as_str)
            .unwrap_or("")
            .to_string();
        if transcript.is_empty() {
            return;
        }
        info!(
            "[SessionA] Translation complete: {}",
            transcript.chars().take(80).collect::<String>()
        );

        {
            let mut call = self.call.lock().await;
            let language = call.target_language.clone();
            call.transcript.push(TranscriptEntry {
                role: "user".to_string(),
                original_text: String::new(),
                translated_text: transcript.clone(),
                language,
                timestamp: chrono::Utc::now(),
            });
        }

        if let Some(sink) = &self.callbacks.on_turn_complete {
            sink("user".to_string(), transcript.clone()).await;
        }

        self.apply_guardrail(&transcript).await;
    }

    async fn apply_guardrail(&self, transcript: &str) {
        let Some(guardrail) = &self.guardrail else {
            return;
        };

        match guardrail.check_full_text(transcript).level {
            GuardrailLevel::Pass => {}
            GuardrailLevel::Correct => {
                // Audio already went out; correct in the background and log.
                {
                    let mut call = self.call.lock().await;
                    call.metrics.guardrail_triggers += 1;
                }
                let guardrail = guardrail.clone();
                let call = self.call.clone();
                let on_event = self.callbacks.on_guardrail_event.clone();
                let text = transcript.to_string();
                tokio::spawn(async move {
                    let result = guardrail.correct_text(&text).await;
                    let event = json!({
                        "level": result.level.as_u8(),
                        "original": result.original_text,
                        "corrected": result.corrected_text,
                        "correction_time_ms": result.correction_time_ms,
                    });
                    call.lock().await.guardrail_events.push(event.clone());
                    if let Some(sink) = on_event {
                        sink(event).await;
                    }
                });
            }
            GuardrailLevel::Block => {
                {
                    let mut call = self.call.lock().await;
                    call.metrics.guardrail_triggers += 1;
                }
                let blocked = guardrail.check_full_text(transcript);
                if let Some(sink) = &self.callbacks.on_guardrail_filler {
                    sink(blocked.filler_text.clone()).await;
                }
                let result = guardrail.correct_text(transcript).await;
                let event = json!({
                    "level": result.level.as_u8(),
                    "original": result.original_text,
                    "corrected": result.corrected_text,
                    "correction_time_ms": result.correction_time_ms,
                });
                self.call.lock().await.guardrail_events.push(event.clone());
                if let Some(sink) = &self.callbacks.on_guardrail_event {
                    sink(event).await;
                }
                if !result.corrected_text.is_empty() && result.corrected_text != transcript {
                    if let Some(sink) = &self.callbacks.on_guardrail_corrected {
                        sink(result.corrected_text).await;
                    }
                }
            }
        }
    }

    async fn handle_response_done(&self, event: Arc<Value>) {
        let usage = parse_usage(&event);
        {
            let mut call = self.call.lock().await;
            call.tokens.add(&usage);
        }
        {
            let mut state = self.state.lock().unwrap();
            state.is_generating = false;
            state.first_delta_seen = false;
            state.transcript_buffer.clear();
        }
        if let Some(guardrail) = &self.guardrail {
            guardrail.reset();
        }
        self.done_notify.notify_waiters();
        if let Some(hook) = &self.callbacks.on_response_done {
            hook().await;
        }
    }

    async fn handle_function_call_delta(&self, event: Arc<Value>) {
        let call_id = event.get("call_id").and_then(Value::as_str).unwrap_or("");
        if call_id.is_empty() {
            return;
        }
        let mut state = self.state.lock().unwrap();
        if let Some(delta) = event.get("delta").and_then(Value::as_str) {
            state
                .fn_args
                .entry(call_id.to_string())
                .or_default()
                .push_str(delta);
        }
        if let Some(name) = event.get("name").and_then(Value::as_str) {
            state.fn_names.insert(call_id.to_string(), name.to_string());
        }
    }

    async fn handle_function_call_done(&self, event: Arc<Value>) {
        let call_id = event
            .get("call_id")
            .and_then(Value::as_str)
            .unwrap_or("")
            .to_string();
        if call_id.is_empty() {
            return;
        }

        let (name, arguments) = {
            let mut state = self.state.lock().unwrap();
            let accumulated = state.fn_args.remove(&call_id).unwrap_or_default();
            let name = event
                .get("name")
                .and_then(Value::as_str)
                .map(str::to_string)
                .or_else(|| state.fn_names.remove(&call_id))
                .unwrap_or_else(|| "unknown".to_string());
            let arguments = event
                .get("arguments")
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or(accumulated);
            (name, arguments)
        };

        info!("[SessionA] Function call complete: {name}");
        let (result, judgement) = {
            let mut call = self.call.lock().await;
            tools::execute(&mut call, &name, &arguments)
        };

        if let Err(e) = self
            .session
            .send_function_call_output(&call_id, &result)
            .await
        {
            warn!("[SessionA] function output send failed: {e}");
        }

        if let Some(judgement) = judgement {
            if let Some(sink) = &self.callbacks.on_call_judgement {
                sink(json!({"result": judgement.result, "data": judgement.data})).await;
            }
        }
    }
}

/// Pull the token-usage block out of a response.done event. Shared with the
/// Session B handler.
pub(crate) fn parse_usage(event: &Value) -> crate::types::TokenUsage {
    let usage = event.pointer("/response/usage").cloned().unwrap_or(Value::Null);
    crate::types::TokenUsage {
        audio_input: usage
            .pointer("/input_token_details/audio_tokens")
            .and_then(Value::as_u64)
            .unwrap_or(0),
        text_input: usage
            .pointer("/input_token_details/text_tokens")
            .and_then(Value::as_u64)
            .unwrap_or(0),
        audio_output: usage
            .pointer("/output_token_details/audio_tokens")
            .and_then(Value::as_u64)
            .unwrap_or(0),
        text_output: usage
            .pointer("/output_token_details/text_tokens")
            .and_then(Value::as_u64)
            .unwrap_or(0),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::types::{
        CallMode, CallStartRequest, CommunicationMode, SessionLabel, UpstreamSessionConfig,
        VadMode,
    };
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn make_call() -> Arc<tokio::sync::Mutex<Call>> {
        Arc::new(tokio::sync::Mutex::new(Call::new(&CallStartRequest {
            call_id: "c-1".to_string(),
            phone_number: "+14155552671".to_string(),
            mode: CallMode::Agent,
            source_language: "en".to_string(),
            target_language: "ko".to_string(),
            collected_data: None,
            communication_mode: CommunicationMode::VoiceToVoice,
            system_prompt_override: None,
        })))
    }

    fn make_session() -> Arc<RealtimeSession> {
        Arc::new(RealtimeSession::new(
            SessionLabel::A,
            UpstreamSessionConfig {
                label: SessionLabel::A,
                input_audio_format: "pcm16".to_string(),
                output_audio_format: "g711_ulaw".to_string(),
                modalities: vec!["text".to_string(), "audio".to_string()],
                vad_mode: VadMode::Client,
                input_transcription: None,
                tools: None,
            },
            Arc::new(Config::default()),
        ))
    }

    fn audio_delta_event() -> Arc<Value> {
        let payload = BASE64.encode([0xFFu8; 160]);
        Arc::new(json!({"type": "response.audio.delta", "delta": payload}))
    }

    #[tokio::test]
    async fn test_first_delta_records_latency_and_turn() {
        let call = make_call();
        let handler = SessionAHandler::new(
            make_session(),
            call.clone(),
            None,
            SessionACallbacks::default(),
        );

        handler.mark_user_input();
        handler.handle_audio_delta(audio_delta_event()).await;
        handler.handle_audio_delta(audio_delta_event()).await;

        let call = call.lock().await;
        assert_eq!(call.metrics.turn_count, 1);
        assert_eq!(call.metrics.session_a_latencies_ms.len(), 1);
        assert!(call.metrics.session_a_latencies_ms[0] >= 0.0);
    }

    #[tokio::test]
    async fn test_tts_forwarded_to_sink() {
        let forwarded = Arc::new(AtomicUsize::new(0));
        let counter = forwarded.clone();
        let callbacks = SessionACallbacks {
            on_tts_audio: Some(Arc::new(move |bytes| {
                let counter = counter.clone();
                Box::pin(async move {
                    counter.fetch_add(bytes.len(), Ordering::SeqCst);
                })
            })),
            ..Default::default()
        };
        let handler = SessionAHandler::new(make_session(), make_call(), None, callbacks);
        handler.handle_audio_delta(audio_delta_event()).await;
        assert_eq!(forwarded.load(Ordering::SeqCst), 160);
    }

    #[tokio::test]
    async fn test_state_machine_transitions() {
        let handler = SessionAHandler::new(
            make_session(),
            make_call(),
            None,
            SessionACallbacks::default(),
        );
        assert!(!handler.is_generating());
        handler.handle_audio_delta(audio_delta_event()).await;
        assert!(handler.is_generating());
        handler
            .handle_response_done(Arc::new(json!({"type": "response.done"})))
            .await;
        assert!(!handler.is_generating());
    }

    #[tokio::test]
    async fn test_exactly_one_sample_per_response() {
        let call = make_call();
        let handler = SessionAHandler::new(
            make_session(),
            call.clone(),
            None,
            SessionACallbacks::default(),
        );
        for _ in 0..3 {
            handler.mark_user_input();
            handler.handle_audio_delta(audio_delta_event()).await;
            handler.handle_audio_delta(audio_delta_event()).await;
            handler
                .handle_response_done(Arc::new(json!({"type": "response.done"})))
                .await;
        }
        let call = call.lock().await;
        assert_eq!(call.metrics.turn_count, 3);
        assert_eq!(call.metrics.session_a_latencies_ms.len(), 3);
    }

    #[tokio::test]
    async fn test_transcript_done_appends_entry() {
        let call = make_call();
        let handler = SessionAHandler::new(
            make_session(),
            call.clone(),
            None,
            SessionACallbacks::default(),
        );
        handler
            .handle_transcript_done(Arc::new(json!({
                "type": "response.audio_transcript.done",
                "transcript": "예약했습니다."
            })))
            .await;
        let call = call.lock().await;
        assert_eq!(call.transcript.len(), 1);
        assert_eq!(call.transcript[0].role, "user");
        assert_eq!(call.transcript[0].translated_text, "예약했습니다.");
        assert_eq!(call.transcript[0].language, "ko");
    }

    #[tokio::test]
    async fn test_response_done_accumulates_tokens() {
        let call = make_call();
        let handler = SessionAHandler::new(
            make_session(),
            call.clone(),
            None,
            SessionACallbacks::default(),
        );
        handler
            .handle_response_done(Arc::new(json!({
                "type": "response.done",
                "response": {"usage": {
                    "input_token_details": {"audio_tokens": 100, "text_tokens": 20},
                    "output_token_details": {"audio_tokens": 300, "text_tokens": 30},
                }}
            })))
            .await;
        assert_eq!(call.lock().await.tokens.total(), 450);
    }

    #[tokio::test]
    async fn test_function_call_accumulation_and_execution() {
        let call = make_call();
        let handler = SessionAHandler::new(
            make_session(),
            call.clone(),
            None,
            SessionACallbacks::default(),
        );
        handler
            .handle_function_call_delta(Arc::new(json!({
                "call_id": "fc-1", "name": "collect_info",
                "delta": "{\"info_type\":\"price\","
            })))
            .await;
        handler
            .handle_function_call_delta(Arc::new(json!({
                "call_id": "fc-1", "delta": "\"value\":\"45000\"}"
            })))
            .await;
        handler
            .handle_function_call_done(Arc::new(json!({"call_id": "fc-1"})))
            .await;

        let call = call.lock().await;
        assert_eq!(call.collected_data["price"], "45000");
        // Accumulator cleared.
        assert!(handler.state.lock().unwrap().fn_args.is_empty());
    }

    #[tokio::test]
    async fn test_wait_for_done_when_idle() {
        let handler = SessionAHandler::new(
            make_session(),
            make_call(),
            None,
            SessionACallbacks::default(),
        );
        assert!(handler.wait_for_done(Duration::from_millis(10)).await);
    }
}
