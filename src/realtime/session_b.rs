//! Session B handler — inbound translation (recipient -> user)
//!
//! Accepts recipient audio from the carrier, owns the response debouncer and
//! the silence-timeout safety net, and emits translated audio plus two-stage
//! captions (original STT first, translation second).
//!
//! In local-VAD mode the upstream's turn detection is off, so this handler
//! issues `input_audio_buffer.commit` + `response.create` itself: on
//! speech_stopped, utterances shorter than the hallucination floor are
//! discarded, everything else commits after a short debounce that a renewed
//! speech_started cancels. If speech_stopped never arrives, the max-speech
//! timer forces the commit exactly once.
//!
//! Output suppression: while suppressed, emissions queue in order; the queue
//! is drained on flush or discarded outright to erase echo artifacts. The
//! response boundary applies playback pacing so consecutive responses do not
//! overlap on the client's speaker.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::types::{Call, TranscriptEntry};

use super::session::{
    RealtimeSession, EV_INPUT_TRANSCRIPTION_COMPLETED, EV_RESPONSE_AUDIO_DELTA,
    EV_RESPONSE_AUDIO_TRANSCRIPT_DELTA, EV_RESPONSE_AUDIO_TRANSCRIPT_DONE, EV_RESPONSE_DONE,
    EV_RESPONSE_TEXT_DELTA, EV_RESPONSE_TEXT_DONE, EV_SPEECH_STARTED, EV_SPEECH_STOPPED,
};
use super::{AsyncHook, AudioSink, CaptionSink};

/// Client-side playback rate for Session B output: pcm16 @ 24 kHz.
const PCM16_24K_BYTES_PER_SECOND: f64 = 48_000.0;

/// Ignore playback remainders shorter than this.
const MIN_PACING_WAIT_S: f64 = 0.05;

#[derive(Default, Clone)]
pub struct SessionBCallbacks {
    /// Decoded pcm16 audio for the client's speaker.
    pub on_translated_audio: Option<AudioSink>,
    /// Stage-2 (translated) caption deltas.
    pub on_caption: Option<CaptionSink>,
    /// Stage-1 (original STT) captions.
    pub on_original_caption: Option<CaptionSink>,
    /// Response boundary, after the translated caption completes.
    pub on_caption_done: Option<AsyncHook>,
    pub on_recipient_speech_started: Option<AsyncHook>,
    pub on_recipient_speech_stopped: Option<AsyncHook>,
    /// (role, full translated text) per completed turn.
    pub on_turn_complete: Option<CaptionSink>,
}

#[derive(Debug, Clone, Copy)]
pub struct SessionBTuning {
    /// Commits are driven by the relay's LocalVAD rather than server VAD.
    pub local_vad_mode: bool,
    /// Hallucination floor: discard shorter utterances.
    pub min_speech_ms: u64,
    /// Silence-timeout safety net / max utterance length.
    pub max_speech_s: f64,
    pub response_debounce_ms: u64,
    /// Apply playback pacing at response boundaries (modes where B audio is
    /// actually played).
    pub track_playback: bool,
}

enum PendingOutput {
    Audio(Vec<u8>),
    Caption(String, String),
    OriginalCaption(String, String),
    CaptionDone,
}

struct BState {
    speech_started_at: Option<Instant>,
    speech_active: bool,
    timeout_forced: bool,
    e2e_sampled: bool,
    stt_sampled: bool,
    last_original_text: Option<String>,
    output_suppressed: bool,
    pending: VecDeque<PendingOutput>,
    playback_first_emit_at: Option<Instant>,
    playback_total_bytes: u64,
    stopped: bool,
}

pub struct SessionBHandler {
    pub session: Arc<RealtimeSession>,
    call: Arc<tokio::sync::Mutex<Call>>,
    tuning: SessionBTuning,
    callbacks: SessionBCallbacks,
    state: Mutex<BState>,
    debounce_task: Mutex<Option<JoinHandle<()>>>,
    silence_timeout_task: Mutex<Option<JoinHandle<()>>>,
    flush_task: Mutex<Option<JoinHandle<()>>>,
}

impl SessionBHandler {
    pub fn new(
        session: Arc<RealtimeSession>,
        call: Arc<tokio::sync::Mutex<Call>>,
        tuning: SessionBTuning,
        callbacks: SessionBCallbacks,
    ) -> Arc<Self> {
        Arc::new(Self {
            session,
            call,
            tuning,
            callbacks,
            state: Mutex::new(BState {
                speech_started_at: None,
                speech_active: false,
                timeout_forced: false,
                e2e_sampled: false,
                stt_sampled: false,
                last_original_text: None,
                output_suppressed: false,
                pending: VecDeque::new(),
                playback_first_emit_at: None,
                playback_total_bytes: 0,
                stopped: false,
            }),
            debounce_task: Mutex::new(None),
            silence_timeout_task: Mutex::new(None),
            flush_task: Mutex::new(None),
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
        hook!(EV_INPUT_TRANSCRIPTION_COMPLETED, handle_input_transcription);
        hook!(EV_RESPONSE_DONE, handle_response_done);
        hook!(EV_SPEECH_STARTED, handle_upstream_speech_started);
        hook!(EV_SPEECH_STOPPED, handle_upstream_speech_stopped);
    }

    pub async fn send_recipient_audio(&self, audio_b64: &str) {
        if let Err(e) = self.session.send_audio(audio_b64).await {
            warn!("[SessionB] audio send failed: {e}");
        }
    }

    pub async fn clear_input_buffer(&self) {
        let _ = self.session.clear_input_buffer().await;
    }

    pub fn stop(&self) {
        self.state.lock().unwrap().stopped = true;
        abort(&self.debounce_task);
        abort(&self.silence_timeout_task);
        abort(&self.flush_task);
    }

    // --- VAD-driven turn handling ---

    /// Real speech start (LocalVAD or upstream VAD).
    pub async fn notify_speech_started(self: &Arc<Self>) {
        if self.state.lock().unwrap().stopped {
            return;
        }
        // A renewed start within the debounce window cancels the scheduled
        // commit: the utterance continues.
        abort(&self.debounce_task);

        // Discard buffered background noise that would otherwise get
        // transcribed as hallucinated text.
        self.clear_input_buffer().await;

        {
            let mut state = self.state.lock().unwrap();
            state.speech_started_at = Some(Instant::now());
            state.speech_active = true;
            state.timeout_forced = false;
            state.e2e_sampled = false;
            state.stt_sampled = false;
        }

        let me = Arc::clone(self);
        let timeout = Duration::from_secs_f64(self.tuning.max_speech_s);
        *self.silence_timeout_task.lock().unwrap() = Some(tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            me.on_silence_timeout().await;
        }));

        if let Some(hook) = &self.callbacks.on_recipient_speech_started {
            hook().await;
        }
    }

    /// Real speech stop (LocalVAD or upstream VAD).
    pub async fn notify_speech_stopped(self: &Arc<Self>) {
        if self.state.lock().unwrap().stopped {
            return;
        }
        abort(&self.silence_timeout_task);

        let (duration_ms, was_forced) = {
            let mut state = self.state.lock().unwrap();
            state.speech_active = false;
            let duration_ms = state
                .speech_started_at
                .map(|t| t.elapsed().as_millis() as u64)
                .unwrap_or(0);
            let was_forced = state.timeout_forced;
            state.timeout_forced = false;
            (duration_ms, was_forced)
        };

        if was_forced {
            // The timeout already committed this utterance.
            debug!("[SessionB] speech_stopped after forced commit — ignoring");
            if let Some(hook) = &self.callbacks.on_recipient_speech_stopped {
                hook().await;
            }
            return;
        }

        if duration_ms < self.tuning.min_speech_ms {
            info!(
                "[SessionB] utterance {duration_ms}ms below floor ({}ms) — discarded",
                self.tuning.min_speech_ms
            );
            self.call.lock().await.metrics.vad_false_triggers += 1;
            self.clear_input_buffer().await;
            if let Some(hook) = &self.callbacks.on_recipient_speech_stopped {
                hook().await;
            }
            return;
        }

        let me = Arc::clone(self);
        let delay = Duration::from_millis(self.tuning.response_debounce_ms);
        *self.debounce_task.lock().unwrap() = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            me.commit_and_respond().await;
        }));

        if let Some(hook) = &self.callbacks.on_recipient_speech_stopped {
            hook().await;
        }
    }

    /// speech_stopped never arrived: force the commit so the audio is not
    /// lost, and mark the utterance so the eventual real stop stays quiet.
    async fn on_silence_timeout(self: &Arc<Self>) {
        {
            let mut state = self.state.lock().unwrap();
            if !state.speech_active || state.stopped {
                return;
            }
            state.speech_active = false;
            state.timeout_forced = true;
        }
        warn!(
            "[SessionB] silence timeout after {:.0}s — forcing commit",
            self.tuning.max_speech_s
        );
        let _ = self.session.commit_audio().await;
        let _ = self.session.create_response(None).await;
        if let Some(hook) = &self.callbacks.on_recipient_speech_stopped {
            hook().await;
        }
    }

    async fn commit_and_respond(&self) {
        // Server VAD commits on its own; the debounce then only gates the
        // response request.
        if self.tuning.local_vad_mode {
            let _ = self.session.commit_audio().await;
        }
        let _ = self.session.create_response(None).await;
    }

    // --- Output suppression ---

    pub fn set_output_suppressed(&self, suppressed: bool) {
        self.state.lock().unwrap().output_suppressed = suppressed;
    }

    pub fn is_output_suppressed(&self) -> bool {
        self.state.lock().unwrap().output_suppressed
    }

    pub fn pending_len(&self) -> usize {
        self.state.lock().unwrap().pending.len()
    }

    /// Drain queued output in enqueue order. A response boundary inside the
    /// queue may re-suppress (pacing); the rest stays queued for the next
    /// flush.
    pub fn flush_pending_output(self: &Arc<Self>) -> futures::future::BoxFuture<'static, ()> {
        let this = Arc::clone(self);
        Box::pin(async move {
            this.state.lock().unwrap().output_suppressed = false;
            loop {
                let item = {
                    let mut state = this.state.lock().unwrap();
                    if state.output_suppressed {
                        break;
                    }
                    state.pending.pop_front()
                };
                let Some(item) = item else { break };
                match item {
                    PendingOutput::Audio(bytes) => this.emit_audio(bytes).await,
                    PendingOutput::Caption(role, text) => {
                        if let Some(sink) = &this.callbacks.on_caption {
                            sink(role, text).await;
                        }
                    }
                    PendingOutput::OriginalCaption(role, text) => {
                        if let Some(sink) = &this.callbacks.on_original_caption {
                            sink(role, text).await;
                        }
                    }
                    PendingOutput::CaptionDone => this.emit_caption_done().await,
                }
            }
        })
    }

    /// Discard queued output (erasing echo artifacts).
    pub fn clear_pending_output(&self) {
        self.state.lock().unwrap().pending.clear();
    }

    async fn emit_audio(&self, bytes: Vec<u8>) {
        if self.tuning.track_playback {
            let mut state = self.state.lock().unwrap();
            if state.playback_first_emit_at.is_none() {
                state.playback_first_emit_at = Some(Instant::now());
            }
            state.playback_total_bytes += bytes.len() as u64;
        }
        if let Some(sink) = &self.callbacks.on_translated_audio {
            sink(bytes).await;
        }
    }

    /// Response boundary: fire the hook, then pace the next response behind
    /// the estimated playback of this one.
    async fn emit_caption_done(self: &Arc<Self>) {
        if let Some(hook) = &self.callbacks.on_caption_done {
            hook().await;
        }

        let remaining_s = {
            let mut state = self.state.lock().unwrap();
            let remaining = match (state.playback_first_emit_at, state.playback_total_bytes) {
                (Some(first_at), total) if total > 0 => {
                    let duration = total as f64 / PCM16_24K_BYTES_PER_SECOND;
                    (duration - first_at.elapsed().as_secs_f64()).max(0.0)
                }
                _ => 0.0,
            };
            state.playback_first_emit_at = None;
            state.playback_total_bytes = 0;
            remaining
        };

        if self.tuning.track_playback && remaining_s > MIN_PACING_WAIT_S {
            info!("[SessionB] pacing next response behind {remaining_s:.1}s of playback");
            self.set_output_suppressed(true);
            let me = Arc::clone(self);
            *self.flush_task.lock().unwrap() = Some(tokio::spawn(async move {
                tokio::time::sleep(Duration::from_secs_f64(remaining_s)).await;
                me.flush_pending_output().await;
            }));
        }
    }

    // --- Upstream events ---

    async fn handle_audio_delta(self: &Arc<Self>, event: Arc<Value>) {
        let delta_b64 = event.get("delta").and_then(Value::as_str).unwrap_or("");
        if delta_b64.is_empty() {
            return;
        }
        let Ok(bytes) = BASE64.decode(delta_b64) else {
            return;
        };
        let suppressed = {
            let mut state = self.state.lock().unwrap();
            if state.output_suppressed {
                state.pending.push_back(PendingOutput::Audio(bytes.clone()));
                true
            } else {
                false
            }
        };
        if !suppressed {
            self.emit_audio(bytes).await;
        }
    }

    async fn handle_transcript_delta(self: &Arc<Self>, event: Arc<Value>) {
        let delta = event.get("delta").and_then(Value::as_str).unwrap_or("");
        if delta.is_empty() {
            return;
        }
        let queued = {
            let mut state = self.state.lock().unwrap();
            if state.output_suppressed {
                state.pending.push_back(PendingOutput::Caption(
                    "recipient".to_string(),
                    delta.to_string(),
                ));
                true
            } else {
                false
            }
        };
        if !queued {
            if let Some(sink) = &self.callbacks.on_caption {
                sink("recipient".to_string(), delta.to_string()).await;
            }
        }
    }

    async fn handle_transcript_done(self: &Arc<Self>, event: Arc<Value>) {
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
            "[SessionB] Translation complete: {}",
            transcript.chars().take(80).collect::<String>()
        );

        let (e2e_ms, original_text) = {
            let mut state = self.state.lock().unwrap();
            let e2e = if !state.e2e_sampled {
                state.e2e_sampled = true;
                state
                    .speech_started_at
                    .map(|t| t.elapsed().as_secs_f64() * 1000.0)
            } else {
                None
            };
            (e2e, state.last_original_text.take())
        };

        {
            let mut call = self.call.lock().await;
            if let Some(ms) = e2e_ms {
                call.metrics.session_b_e2e_latencies_ms.push(ms);
            }
            let language = call.source_language.clone();
            call.transcript.push(TranscriptEntry {
                role: "recipient".to_string(),
                original_text: original_text.unwrap_or_default(),
                translated_text: transcript.clone(),
                language,
                timestamp: chrono::Utc::now(),
            });
        }

        // Turn completion and transcript append are never suppressed; only
        // client-facing emissions queue.
        if let Some(sink) = &self.callbacks.on_turn_complete {
            sink("recipient".to_string(), transcript.clone()).await;
        }

        let queued = {
            let mut state = self.state.lock().unwrap();
            if state.output_suppressed {
                state.pending.push_back(PendingOutput::CaptionDone);
                true
            } else {
                false
            }
        };
        if !queued {
            self.emit_caption_done().await;
        }
    }

    /// Stage-1 caption: the recipient's original words, straight from input
    /// transcription, independent of the translation.
    async fn handle_input_transcription(self: &Arc<Self>, event: Arc<Value>) {
        let transcript = event
            .get("transcript")
            .and_then(Value::as_str)
            .unwrap_or("")
            .trim()
            .to_string();
        if transcript.is_empty() {
            return;
        }
        info!(
            "[SessionB] Original STT (stage 1): {}",
            transcript.chars().take(80).collect::<String>()
        );

        let stt_ms = {
            let mut state = self.state.lock().unwrap();
            state.last_original_text = Some(transcript.clone());
            if !state.stt_sampled {
                state.stt_sampled = true;
                state
                    .speech_started_at
                    .map(|t| t.elapsed().as_secs_f64() * 1000.0)
            } else {
                None
            }
        };
        if let Some(ms) = stt_ms {
            self.call
                .lock()
                .await
                .metrics
                .session_b_stt_latencies_ms
                .push(ms);
        }

        let queued = {
            let mut state = self.state.lock().unwrap();
            if state.output_suppressed {
                state.pending.push_back(PendingOutput::OriginalCaption(
                    "recipient".to_string(),
                    transcript.clone(),
                ));
                true
            } else {
                false
            }
        };
        if !queued {
            if let Some(sink) = &self.callbacks.on_original_caption {
                sink("recipient".to_string(), transcript).await;
            }
        }
    }

    async fn handle_response_done(self: &Arc<Self>, event: Arc<Value>) {
        let usage = super::session_a::parse_usage(&event);
        self.call.lock().await.tokens.add(&usage);
    }

    // Upstream VAD events only matter in server-VAD mode; with local VAD the
    // upstream's turn detection is off and these never fire.
    async fn handle_upstream_speech_started(self: &Arc<Self>, _event: Arc<Value>) {
        if !self.tuning.local_vad_mode {
            self.notify_speech_started().await;
        }
    }

    async fn handle_upstream_speech_stopped(self: &Arc<Self>, _event: Arc<Value>) {
        if !self.tuning.local_vad_mode {
            self.notify_speech_stopped().await;
        }
    }
}

fn abort(slot: &Mutex<Option<JoinHandle<()>>>) {
    if let Some(task) = slot.lock().unwrap().take() {
        task.abort();
    }
}

impl Drop for SessionBHandler {
    fn drop(&mut self) {
        abort(&self.debounce_task);
        abort(&self.silence_timeout_task);
        abort(&self.flush_task);
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
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn make_call() -> Arc<tokio::sync::Mutex<Call>> {
        Arc::new(tokio::sync::Mutex::new(Call::new(&CallStartRequest {
            call_id: "c-1".to_string(),
            phone_number: "+14155552671".to_string(),
            mode: CallMode::Relay,
            source_language: "en".to_string(),
            target_language: "ko".to_string(),
            collected_data: None,
            communication_mode: CommunicationMode::VoiceToVoice,
            system_prompt_override: None,
        })))
    }

    fn make_session() -> Arc<RealtimeSession> {
        Arc::new(RealtimeSession::new(
            SessionLabel::B,
            UpstreamSessionConfig {
                label: SessionLabel::B,
                input_audio_format: "g711_ulaw".to_string(),
                output_audio_format: "pcm16".to_string(),
                modalities: vec!["text".to_string(), "audio".to_string()],
                vad_mode: VadMode::Local,
                input_transcription: None,
                tools: None,
            },
            Arc::new(Config::default()),
        ))
    }

    fn tuning() -> SessionBTuning {
        SessionBTuning {
            local_vad_mode: true,
            min_speech_ms: 50,
            max_speech_s: 15.0,
            response_debounce_ms: 30,
            track_playback: true,
        }
    }

    struct Recorded {
        audio: Arc<AtomicUsize>,
        captions: Arc<tokio::sync::Mutex<Vec<String>>>,
        stops: Arc<AtomicUsize>,
    }

    fn handler_with_sinks(
        tuning: SessionBTuning,
        call: Arc<tokio::sync::Mutex<Call>>,
    ) -> (Arc<SessionBHandler>, Recorded) {
        let audio = Arc::new(AtomicUsize::new(0));
        let captions = Arc::new(tokio::sync::Mutex::new(Vec::new()));
        let stops = Arc::new(AtomicUsize::new(0));

        let a = audio.clone();
        let c = captions.clone();
        let c2 = captions.clone();
        let s = stops.clone();
        let callbacks = SessionBCallbacks {
            on_translated_audio: Some(Arc::new(move |bytes| {
                let a = a.clone();
                Box::pin(async move {
                    a.fetch_add(bytes.len(), Ordering::SeqCst);
                })
            })),
            on_caption: Some(Arc::new(move |_role, text| {
                let c = c.clone();
                Box::pin(async move {
                    c.lock().await.push(format!("caption:{text}"));
                })
            })),
            on_original_caption: Some(Arc::new(move |_role, text| {
                let c = c2.clone();
                Box::pin(async move {
                    c.lock().await.push(format!("original:{text}"));
                })
            })),
            on_recipient_speech_stopped: Some(Arc::new(move || {
                let s = s.clone();
                Box::pin(async move {
                    s.fetch_add(1, Ordering::SeqCst);
                })
            })),
            ..Default::default()
        };
        let handler = SessionBHandler::new(make_session(), call, tuning, callbacks);
        (
            handler,
            Recorded {
                audio,
                captions,
                stops,
            },
        )
    }

    fn audio_event(len: usize) -> Arc<Value> {
        Arc::new(json!({
            "type": "response.audio.delta",
            "delta": BASE64.encode(vec![0u8; len]),
        }))
    }

    #[tokio::test]
    async fn test_short_utterance_discarded() {
        let call = make_call();
        let (handler, recorded) = handler_with_sinks(tuning(), call.clone());

        handler.notify_speech_started().await;
        // Stop immediately: duration << 50 ms floor.
        handler.notify_speech_stopped().await;

        assert_eq!(call.lock().await.metrics.vad_false_triggers, 1);
        assert!(handler.debounce_task.lock().unwrap().is_none());
        assert_eq!(recorded.stops.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_valid_utterance_schedules_debounce() {
        let call = make_call();
        let (handler, _) = handler_with_sinks(tuning(), call.clone());

        handler.notify_speech_started().await;
        tokio::time::sleep(Duration::from_millis(70)).await;
        handler.notify_speech_stopped().await;

        assert!(handler.debounce_task.lock().unwrap().is_some());
        assert_eq!(call.lock().await.metrics.vad_false_triggers, 0);
    }

    #[tokio::test]
    async fn test_renewed_speech_cancels_debounce() {
        let (handler, _) = handler_with_sinks(tuning(), make_call());

        handler.notify_speech_started().await;
        tokio::time::sleep(Duration::from_millis(70)).await;
        handler.notify_speech_stopped().await;
        // Speaker resumes within the debounce window.
        handler.notify_speech_started().await;
        let task = handler.debounce_task.lock().unwrap();
        assert!(task.is_none());
    }

    #[tokio::test]
    async fn test_silence_timeout_fires_once() {
        let mut t = tuning();
        t.max_speech_s = 0.05;
        let (handler, recorded) = handler_with_sinks(t, make_call());

        handler.notify_speech_started().await;
        tokio::time::sleep(Duration::from_millis(120)).await;
        // Timeout fired: synthetic stop observed.
        assert_eq!(recorded.stops.load(Ordering::SeqCst), 1);

        // The real stop arrives later and must not schedule a second
        // response.
        handler.notify_speech_stopped().await;
        assert!(handler.debounce_task.lock().unwrap().is_none());
        assert_eq!(recorded.stops.load(Ordering::SeqCst), 2);
        assert!(!handler.state.lock().unwrap().timeout_forced);
    }

    #[tokio::test]
    async fn test_suppressed_output_queues_in_order() {
        let (handler, recorded) = handler_with_sinks(tuning(), make_call());

        handler.set_output_suppressed(true);
        handler.handle_audio_delta(audio_event(100)).await;
        handler
            .handle_transcript_delta(Arc::new(json!({
                "type": "response.audio_transcript.delta",
                "delta": "first"
            })))
            .await;
        handler
            .handle_input_transcription(Arc::new(json!({
                "type": "conversation.item.input_audio_transcription.completed",
                "transcript": "second"
            })))
            .await;

        assert_eq!(handler.pending_len(), 3);
        assert_eq!(recorded.audio.load(Ordering::SeqCst), 0);

        handler.flush_pending_output().await;
        assert_eq!(handler.pending_len(), 0);
        assert_eq!(recorded.audio.load(Ordering::SeqCst), 100);
        let captions = recorded.captions.lock().await;
        assert_eq!(captions.as_slice(), ["caption:first", "original:second"]);
    }

    #[tokio::test]
    async fn test_clear_pending_discards() {
        let (handler, recorded) = handler_with_sinks(tuning(), make_call());
        handler.set_output_suppressed(true);
        handler.handle_audio_delta(audio_event(100)).await;
        handler.clear_pending_output();
        handler.flush_pending_output().await;
        assert_eq!(recorded.audio.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_transcript_done_records_turn_and_latency() {
        let call = make_call();
        let (handler, _) = handler_with_sinks(tuning(), call.clone());

        handler.notify_speech_started().await;
        tokio::time::sleep(Duration::from_millis(60)).await;
        handler.notify_speech_stopped().await;
        handler
            .handle_input_transcription(Arc::new(json!({
                "type": "conversation.item.input_audio_transcription.completed",
                "transcript": "여보세요"
            })))
            .await;
        handler
            .handle_transcript_done(Arc::new(json!({
                "type": "response.audio_transcript.done",
                "transcript": "Hello?"
            })))
            .await;

        let call = call.lock().await;
        assert_eq!(call.transcript.len(), 1);
        assert_eq!(call.transcript[0].role, "recipient");
        assert_eq!(call.transcript[0].original_text, "여보세요");
        assert_eq!(call.transcript[0].translated_text, "Hello?");
        assert_eq!(call.metrics.session_b_e2e_latencies_ms.len(), 1);
        assert_eq!(call.metrics.session_b_stt_latencies_ms.len(), 1);
    }

    #[tokio::test]
    async fn test_response_boundary_paces_playback() {
        let (handler, _) = handler_with_sinks(tuning(), make_call());

        // 48000 bytes = 1 s of pcm16 @ 24 kHz; emitted just now, so nearly
        // all of it is still unplayed.
        handler.handle_audio_delta(audio_event(48_000)).await;
        handler
            .handle_transcript_done(Arc::new(json!({
                "type": "response.audio_transcript.done",
                "transcript": "long answer"
            })))
            .await;

        assert!(handler.is_output_suppressed());
        assert!(handler.flush_task.lock().unwrap().is_some());
    }
}
