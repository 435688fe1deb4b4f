//! Shared pipeline plumbing
//!
//! All four mode pipelines compose the same sub-components; this module
//! builds and wires them. The handlers expose callback seams and the
//! builder passes closures into their constructors, so ownership stays a
//! tree: the pipeline owns the handlers, the closures capture only the leaf
//! components they touch.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use chrono::Utc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::audio::ring_buffer::AudioRingBuffer;
use crate::audio::{pcm16_rms, ulaw_rms};
use crate::config::Config;
use crate::db::CallStore;
use crate::guardrail::GuardrailChecker;
use crate::stt::FallbackStt;
use crate::tools;
use crate::types::{Call, CallMode, ServerMessage};
use crate::vad::silero::SpeechModel;
use crate::vad::LocalVad;

use super::super::context::ContextManager;
use super::super::dual::DualSessionManager;
use super::super::echo_gate::{EchoGate, GateDecision};
use super::super::first_message::FirstMessageHandler;
use super::super::interrupt::{InterruptHandler, RecipientSpeechState};
use super::super::recovery::RecoveryManager;
use super::super::session_a::{SessionACallbacks, SessionAHandler};
use super::super::session_b::{SessionBCallbacks, SessionBHandler, SessionBTuning};
use super::super::NotifySink;
use crate::telephony::TelephonyMediaHandler;

/// Per-variant wiring switches.
#[derive(Debug, Clone, Copy)]
pub struct PartsFlags {
    /// Drop Session B audio at the client sink (captions only).
    pub suppress_b_audio: bool,
    /// First message uses the exact-utterance dispatch.
    pub exact_first_message: bool,
    /// Keep sending TTS while the recipient speaks (text-input modes run
    /// full-duplex).
    pub duplex_tts: bool,
    /// Session B audio is actually played by the client, so response
    /// boundaries pace on playback.
    pub track_playback: bool,
}

/// Metrics snapshots, debounced persistence, and the call duration timer —
/// concerns every pipeline variant shares.
pub struct PipelineCore {
    pub call: Arc<tokio::sync::Mutex<Call>>,
    pub notify: NotifySink,
    store: Arc<CallStore>,
    save_debounce: Duration,
    last_save_at: Mutex<Option<Instant>>,
    deferred_save: Mutex<Option<JoinHandle<()>>>,
    timer_task: Mutex<Option<JoinHandle<()>>>,
}

impl PipelineCore {
    pub fn new(
        call: Arc<tokio::sync::Mutex<Call>>,
        notify: NotifySink,
        store: Arc<CallStore>,
        save_debounce_s: f64,
    ) -> Arc<Self> {
        Arc::new(Self {
            call,
            notify,
            store,
            save_debounce: Duration::from_secs_f64(save_debounce_s),
            last_save_at: Mutex::new(None),
            deferred_save: Mutex::new(None),
            timer_task: Mutex::new(None),
        })
    }

    /// Warning at the threshold, timeout status at the ceiling.
    pub fn start_duration_timer(self: &Arc<Self>, warning_ms: u64, max_ms: u64) {
        let core = Arc::clone(self);
        let task = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(warning_ms)).await;
            (core.notify)(ServerMessage::CallStatus {
                status: "warning".to_string(),
                message: Some("The call will end soon.".to_string()),
                result: None,
                data: None,
            })
            .await;

            tokio::time::sleep(Duration::from_millis(max_ms.saturating_sub(warning_ms))).await;
            (core.notify)(ServerMessage::CallStatus {
                status: "timeout".to_string(),
                message: Some("Maximum call duration reached.".to_string()),
                result: None,
                data: None,
            })
            .await;
            info!("Call timed out (max duration reached)");
        });
        *self.timer_task.lock().unwrap() = Some(task);
    }

    /// Push the current metrics to the client and schedule a (debounced)
    /// store update.
    pub async fn send_metrics_snapshot(self: &Arc<Self>) {
        let metrics = self.call.lock().await.metrics.clone();
        (self.notify)(ServerMessage::Metrics(metrics)).await;
        self.maybe_save().await;
    }

    async fn maybe_save(self: &Arc<Self>) {
        let elapsed = self
            .last_save_at
            .lock()
            .unwrap()
            .map(|t| t.elapsed())
            .unwrap_or(Duration::MAX);

        if elapsed >= self.save_debounce {
            *self.last_save_at.lock().unwrap() = Some(Instant::now());
            if let Some(task) = self.deferred_save.lock().unwrap().take() {
                task.abort();
            }
            let core = Arc::clone(self);
            tokio::spawn(async move { core.persist_now().await });
        } else {
            let mut deferred = self.deferred_save.lock().unwrap();
            if deferred.as_ref().map(|t| t.is_finished()).unwrap_or(true) {
                let delay = self.save_debounce - elapsed;
                let core = Arc::clone(self);
                *deferred = Some(tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    *core.last_save_at.lock().unwrap() = Some(Instant::now());
                    core.persist_now().await;
                }));
            }
        }
    }

    /// Store write; failures are logged and isolated.
    pub async fn persist_now(&self) {
        let snapshot = self.call.lock().await.clone();
        if let Err(e) = self.store.save(&snapshot).await {
            warn!("Failed to persist call {}: {e}", snapshot.call_id);
        }
    }

    pub fn stop(&self) {
        if let Some(task) = self.timer_task.lock().unwrap().take() {
            task.abort();
        }
        if let Some(task) = self.deferred_save.lock().unwrap().take() {
            task.abort();
        }
    }
}

/// Everything a mode pipeline composes.
pub struct PipelineParts {
    pub config: Arc<Config>,
    pub core: Arc<PipelineCore>,
    pub dual: Arc<DualSessionManager>,
    pub telephony: Arc<TelephonyMediaHandler>,
    pub guardrail: Option<Arc<GuardrailChecker>>,
    pub context: Arc<tokio::sync::Mutex<ContextManager>>,
    pub echo_gate: Arc<EchoGate>,
    pub speech_state: Arc<RecipientSpeechState>,
    pub session_a: Arc<SessionAHandler>,
    pub session_b: Arc<SessionBHandler>,
    pub interrupt: Arc<InterruptHandler>,
    pub first_message: Arc<FirstMessageHandler>,
    pub ring_buffer_a: Arc<Mutex<AudioRingBuffer>>,
    pub ring_buffer_b: Arc<Mutex<AudioRingBuffer>>,
    pub recovery_a: Arc<RecoveryManager>,
    pub recovery_b: Arc<RecoveryManager>,
    pub local_vad: Option<Arc<tokio::sync::Mutex<LocalVad>>>,
    user_audio_chunks: AtomicU64,
}

#[allow(clippy::too_many_arguments)]
pub fn build_parts(
    config: Arc<Config>,
    call: Arc<tokio::sync::Mutex<Call>>,
    dual: Arc<DualSessionManager>,
    telephony: Arc<TelephonyMediaHandler>,
    notify: NotifySink,
    store: Arc<CallStore>,
    stt: Arc<FallbackStt>,
    vad_model: Option<Box<dyn SpeechModel>>,
    prompt_a: String,
    prompt_b: String,
    flags: PartsFlags,
) -> Arc<PipelineParts> {
    // Immutable call facts, snapshotted once.
    let (call_mode, source_language, target_language) = {
        let call = call.try_lock().expect("call is unshared during pipeline build");
        (
            call.mode,
            call.source_language.clone(),
            call.target_language.clone(),
        )
    };

    let core = PipelineCore::new(
        call.clone(),
        notify.clone(),
        store,
        config.store.save_debounce_s,
    );

    let guardrail = config
        .guardrail
        .enabled
        .then(|| Arc::new(GuardrailChecker::new(&config, &target_language)));

    let context = Arc::new(tokio::sync::Mutex::new(ContextManager::default()));
    let echo_gate = Arc::new(EchoGate::new(
        config.energy.echo_threshold_rms,
        config.energy.echo_round_trip_margin_s,
        config.energy.max_echo_window_s,
    ));
    let speech_state = RecipientSpeechState::new(Duration::from_secs_f64(
        config.session_b.recipient_speech_cooldown_s,
    ));
    let ring_buffer_a = Arc::new(Mutex::new(AudioRingBuffer::new(
        config.recovery.ring_buffer_capacity_slots,
    )));
    let ring_buffer_b = Arc::new(Mutex::new(AudioRingBuffer::new(
        config.recovery.ring_buffer_capacity_slots,
    )));

    // --- Session A wiring ---

    let on_tts_audio = {
        let speech_state = speech_state.clone();
        let echo_gate = echo_gate.clone();
        let telephony = telephony.clone();
        let call = call.clone();
        let duplex = flags.duplex_tts;
        Arc::new(move |bytes: Vec<u8>| {
            let speech_state = speech_state.clone();
            let echo_gate = echo_gate.clone();
            let telephony = telephony.clone();
            let call = call.clone();
            Box::pin(async move {
                if !duplex && speech_state.is_speaking() {
                    return;
                }
                let opened_window = echo_gate.activate(bytes.len());
                {
                    let mut call = call.lock().await;
                    if opened_window {
                        call.metrics.echo_suppressions += 1;
                    }
                    if call.metrics.first_message_latency_ms == 0.0 {
                        if let Some(started) = call.started_at {
                            call.metrics.first_message_latency_ms =
                                (Utc::now() - started).num_milliseconds() as f64;
                        }
                    }
                }
                telephony.send_audio(&bytes).await;
            }) as futures::future::BoxFuture<'static, ()>
        })
    };

    let on_a_caption = {
        let notify = notify.clone();
        Arc::new(move |role: String, text: String| {
            let notify = notify.clone();
            Box::pin(async move {
                notify(ServerMessage::Caption {
                    role,
                    text,
                    direction: "outbound".to_string(),
                })
                .await;
            }) as futures::future::BoxFuture<'static, ()>
        })
    };

    let on_a_done = {
        let echo_gate = echo_gate.clone();
        let notify = notify.clone();
        let core = core.clone();
        Arc::new(move || {
            let echo_gate = echo_gate.clone();
            let notify = notify.clone();
            let core = core.clone();
            Box::pin(async move {
                echo_gate.start_cooldown();
                notify(ServerMessage::TranslationState {
                    state: "done".to_string(),
                    direction: None,
                })
                .await;
                core.send_metrics_snapshot().await;
            }) as futures::future::BoxFuture<'static, ()>
        })
    };

    let on_a_turn_complete = {
        let context = context.clone();
        let core = core.clone();
        Arc::new(move |role: String, text: String| {
            let context = context.clone();
            let core = core.clone();
            Box::pin(async move {
                context.lock().await.add_turn(&role, &text);
                core.send_metrics_snapshot().await;
            }) as futures::future::BoxFuture<'static, ()>
        })
    };

    let on_guardrail_filler = {
        let telephony = telephony.clone();
        Arc::new(move |filler: String| {
            let telephony = telephony.clone();
            Box::pin(async move {
                info!("Guardrail: clearing carrier playback (filler: '{filler}')");
                telephony.send_clear().await;
            }) as futures::future::BoxFuture<'static, ()>
        })
    };

    let on_guardrail_corrected = {
        let session = dual.session_a.clone();
        Arc::new(move |corrected: String| {
            let session = session.clone();
            Box::pin(async move {
                info!(
                    "Guardrail: re-synthesizing corrected text: '{}'",
                    corrected.chars().take(60).collect::<String>()
                );
                let _ = session.send_text_item(&corrected).await;
                let _ = session.create_response(None).await;
            }) as futures::future::BoxFuture<'static, ()>
        })
    };

    let on_guardrail_event = {
        let notify = notify.clone();
        Arc::new(move |event: serde_json::Value| {
            let notify = notify.clone();
            Box::pin(async move {
                let corrected = event
                    .get("corrected")
                    .and_then(serde_json::Value::as_str)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string);
                notify(ServerMessage::GuardrailTriggered {
                    level: event.get("level").and_then(serde_json::Value::as_u64).unwrap_or(1)
                        as u8,
                    original: event
                        .get("original")
                        .and_then(serde_json::Value::as_str)
                        .unwrap_or_default()
                        .to_string(),
                    corrected,
                    correction_time_ms: event
                        .get("correction_time_ms")
                        .and_then(serde_json::Value::as_f64),
                })
                .await;
            }) as futures::future::BoxFuture<'static, ()>
        })
    };

    let on_call_judgement = {
        let notify = notify.clone();
        Arc::new(move |judgement: serde_json::Value| {
            let notify = notify.clone();
            Box::pin(async move {
                notify(ServerMessage::CallStatus {
                    status: "call_result".to_string(),
                    message: None,
                    result: judgement
                        .get("result")
                        .and_then(serde_json::Value::as_str)
                        .map(str::to_string),
                    data: judgement.get("data").cloned(),
                })
                .await;
            }) as futures::future::BoxFuture<'static, ()>
        })
    };

    let session_a = SessionAHandler::new(
        dual.session_a.clone(),
        call.clone(),
        guardrail.clone(),
        SessionACallbacks {
            on_tts_audio: Some(on_tts_audio),
            on_caption: Some(on_a_caption),
            on_response_done: Some(on_a_done),
            on_turn_complete: Some(on_a_turn_complete),
            on_guardrail_filler: Some(on_guardrail_filler),
            on_guardrail_corrected: Some(on_guardrail_corrected),
            on_guardrail_event: Some(on_guardrail_event),
            on_call_judgement: Some(on_call_judgement),
        },
    );
    session_a.register();

    // --- Interrupt & first message ---

    let clear_telephony = {
        let telephony = telephony.clone();
        Arc::new(move || {
            let telephony = telephony.clone();
            Box::pin(async move { telephony.send_clear().await })
                as futures::future::BoxFuture<'static, ()>
        })
    };
    let interrupt = InterruptHandler::new(
        session_a.clone(),
        speech_state.clone(),
        clear_telephony,
        notify.clone(),
    );
    let first_message = FirstMessageHandler::new(
        call.clone(),
        session_a.clone(),
        notify.clone(),
        flags.exact_first_message,
    );

    // --- Session B wiring ---

    let on_b_audio = {
        let notify = notify.clone();
        let suppress = flags.suppress_b_audio;
        Arc::new(move |bytes: Vec<u8>| {
            let notify = notify.clone();
            Box::pin(async move {
                // Caption-only modes drop the audio at this sink.
                if suppress {
                    return;
                }
                notify(ServerMessage::RecipientAudio {
                    audio: BASE64.encode(&bytes),
                })
                .await;
            }) as futures::future::BoxFuture<'static, ()>
        })
    };

    let on_b_caption = {
        let notify = notify.clone();
        let language = source_language.clone();
        Arc::new(move |role: String, text: String| {
            let notify = notify.clone();
            let language = language.clone();
            Box::pin(async move {
                notify(ServerMessage::CaptionTranslated {
                    role,
                    text,
                    stage: 2,
                    language,
                    direction: "inbound".to_string(),
                })
                .await;
            }) as futures::future::BoxFuture<'static, ()>
        })
    };

    let on_b_original_caption = {
        let notify = notify.clone();
        let language = target_language.clone();
        Arc::new(move |role: String, text: String| {
            let notify = notify.clone();
            let language = language.clone();
            Box::pin(async move {
                notify(ServerMessage::CaptionOriginal {
                    role,
                    text,
                    stage: 1,
                    language,
                    direction: "inbound".to_string(),
                })
                .await;
            }) as futures::future::BoxFuture<'static, ()>
        })
    };

    let on_b_caption_done = {
        let notify = notify.clone();
        Arc::new(move || {
            let notify = notify.clone();
            Box::pin(async move {
                notify(ServerMessage::TranslationState {
                    state: "caption_done".to_string(),
                    direction: Some("inbound".to_string()),
                })
                .await;
            }) as futures::future::BoxFuture<'static, ()>
        })
    };

    let on_recipient_started = {
        let echo_gate = echo_gate.clone();
        let first_message = first_message.clone();
        let interrupt = interrupt.clone();
        let call = call.clone();
        Arc::new(move || {
            let echo_gate = echo_gate.clone();
            let first_message = first_message.clone();
            let interrupt = interrupt.clone();
            let call = call.clone();
            Box::pin(async move {
                if echo_gate.is_active() {
                    info!("Recipient speech during echo window — breaking echo gate");
                    echo_gate.deactivate();
                }
                let first_sent = call.lock().await.first_message_sent;
                if !first_sent {
                    first_message.on_recipient_speech_detected().await;
                } else {
                    interrupt.on_recipient_speech_started().await;
                }
            }) as futures::future::BoxFuture<'static, ()>
        })
    };

    let on_recipient_stopped = {
        let context = context.clone();
        let interrupt = interrupt.clone();
        let session = dual.session_b.clone();
        Arc::new(move || {
            let context = context.clone();
            let interrupt = interrupt.clone();
            let session = session.clone();
            Box::pin(async move {
                context.lock().await.inject_context(&session).await;
                interrupt.on_recipient_speech_stopped().await;
            }) as futures::future::BoxFuture<'static, ()>
        })
    };

    let on_b_turn_complete = {
        let context = context.clone();
        let core = core.clone();
        let call = call.clone();
        let session_a = session_a.clone();
        Arc::new(move |role: String, text: String| {
            let context = context.clone();
            let core = core.clone();
            let call = call.clone();
            let session_a = session_a.clone();
            Box::pin(async move {
                context.lock().await.add_turn(&role, &text);
                if role == "recipient" && call_mode == CallMode::Agent {
                    // Agent feedback loop: the translated recipient turn
                    // becomes the agent's next input.
                    call.lock().await.transcript_history.push(
                        crate::types::HistoryEntry {
                            role: "recipient".to_string(),
                            text: text.clone(),
                        },
                    );
                    if session_a.is_generating() {
                        session_a.wait_for_done(Duration::from_secs(5)).await;
                    }
                    info!(
                        "Agent mode: forwarding recipient translation: {}",
                        text.chars().take(80).collect::<String>()
                    );
                    let _ = session_a
                        .send_user_text(&format!("[Recipient says]: {text}"))
                        .await;
                }
                core.send_metrics_snapshot().await;
            }) as futures::future::BoxFuture<'static, ()>
        })
    };

    let session_b = SessionBHandler::new(
        dual.session_b.clone(),
        call.clone(),
        SessionBTuning {
            local_vad_mode: config.local_vad.enabled,
            min_speech_ms: config.session_b.min_speech_ms,
            max_speech_s: config.session_b.max_speech_s,
            response_debounce_ms: config.session_b.response_debounce_ms,
            track_playback: flags.track_playback,
        },
        SessionBCallbacks {
            on_translated_audio: Some(on_b_audio),
            on_caption: Some(on_b_caption),
            on_original_caption: Some(on_b_original_caption),
            on_caption_done: Some(on_b_caption_done),
            on_recipient_speech_started: Some(on_recipient_started),
            on_recipient_speech_stopped: Some(on_recipient_stopped),
            on_turn_complete: Some(on_b_turn_complete),
        },
    );
    session_b.register();

    // --- Local VAD ---

    let local_vad = match (config.local_vad.enabled, vad_model) {
        (true, Some(model)) => {
            let b_start = session_b.clone();
            let b_stop = session_b.clone();
            Some(Arc::new(tokio::sync::Mutex::new(LocalVad::new(
                &config.local_vad,
                model,
                Some(Arc::new(move || {
                    let handler = b_start.clone();
                    Box::pin(async move { handler.notify_speech_started().await })
                        as futures::future::BoxFuture<'static, ()>
                })),
                Some(Arc::new(move || {
                    let handler = b_stop.clone();
                    Box::pin(async move { handler.notify_speech_stopped().await })
                        as futures::future::BoxFuture<'static, ()>
                })),
            ))))
        }
        _ => None,
    };

    // --- Recovery ---

    let recovery_a = RecoveryManager::new(
        dual.session_a.clone(),
        ring_buffer_a.clone(),
        call.clone(),
        config.clone(),
        stt.clone(),
        prompt_a,
        tools::tools_for_mode(call_mode),
        notify.clone(),
        None,
        source_language.clone(),
    );

    let recovered_caption = {
        let notify = notify.clone();
        let language = source_language.clone();
        Arc::new(move |role: String, text: String| {
            let notify = notify.clone();
            let language = language.clone();
            Box::pin(async move {
                notify(ServerMessage::CaptionTranslated {
                    role,
                    text,
                    stage: 2,
                    language,
                    direction: "inbound".to_string(),
                })
                .await;
            }) as futures::future::BoxFuture<'static, ()>
        })
    };
    let recovery_b = RecoveryManager::new(
        dual.session_b.clone(),
        ring_buffer_b.clone(),
        call.clone(),
        config.clone(),
        stt,
        prompt_b,
        None,
        notify.clone(),
        Some(recovered_caption),
        target_language.clone(),
    );

    Arc::new(PipelineParts {
        config,
        core,
        dual,
        telephony,
        guardrail,
        context,
        echo_gate,
        speech_state,
        session_a,
        session_b,
        interrupt,
        first_message,
        ring_buffer_a,
        ring_buffer_b,
        recovery_a,
        recovery_b,
        local_vad,
        user_audio_chunks: AtomicU64::new(0),
    })
}

impl PipelineParts {
    /// Common startup: stamp the call, arm the duration timer, start the
    /// recovery monitors.
    pub async fn start_shared(&self) {
        {
            let mut call = self.core.call.lock().await;
            call.started_at = Some(Utc::now());
        }
        self.core.start_duration_timer(
            self.config.limits.call_warning_ms,
            self.config.limits.max_call_duration_ms,
        );
        self.recovery_a.start_monitoring();
        self.recovery_b.start_monitoring();
    }

    /// Common teardown: stop timers, monitors, handlers and the VAD.
    pub async fn stop_shared(&self) {
        self.core.stop();
        self.echo_gate.deactivate();
        if let Some(vad) = &self.local_vad {
            vad.lock().await.reset();
        }
        self.session_b.stop();
        self.recovery_a.stop().await;
        self.recovery_b.stop().await;
    }

    /// Client microphone audio (pcm16 base64) toward Session A.
    pub async fn ingest_user_audio(&self, audio_b64: &str) {
        let Ok(bytes) = BASE64.decode(audio_b64) else {
            return;
        };
        let seq = self.ring_buffer_a.lock().unwrap().write(&bytes);

        let count = self.user_audio_chunks.fetch_add(1, Ordering::Relaxed) + 1;
        if count % 10 == 0 {
            info!("[SessionA] user audio RMS={:.0}", pcm16_rms(&bytes));
        }

        if self.recovery_a.is_recovering() {
            return;
        }
        if self.recovery_a.is_degraded() {
            if let Some(text) = self.recovery_a.process_degraded_audio(&bytes).await {
                (self.core.notify)(ServerMessage::Caption {
                    role: "user".to_string(),
                    text: format!("[delayed] {text}"),
                    direction: "outbound".to_string(),
                })
                .await;
            }
            return;
        }

        if self.session_a.send_user_audio(audio_b64).await.is_ok() {
            self.ring_buffer_a.lock().unwrap().mark_sent(seq);
        }
    }

    /// Client VAD end-of-utterance signal.
    pub async fn ingest_user_commit(&self) {
        if self.recovery_a.is_recovering() || self.recovery_a.is_degraded() {
            return;
        }
        (self.core.notify)(ServerMessage::TranslationState {
            state: "processing".to_string(),
            direction: None,
        })
        .await;
        self.context
            .lock()
            .await
            .inject_context(&self.dual.session_a)
            .await;
        if let Err(e) = self.session_a.commit_user_audio().await {
            warn!("user audio commit failed: {e}");
        }
    }

    /// One carrier frame toward Session B, through the echo gate and VAD.
    pub async fn ingest_carrier_audio(&self, audio: &[u8]) {
        let seq = self.ring_buffer_b.lock().unwrap().write(audio);

        if self.recovery_b.is_recovering() {
            return;
        }
        if self.recovery_b.is_degraded() {
            if let Some(text) = self.recovery_b.process_degraded_audio(audio).await {
                let language = self.core.call.lock().await.source_language.clone();
                (self.core.notify)(ServerMessage::CaptionTranslated {
                    role: "recipient".to_string(),
                    text: format!("[delayed] {text}"),
                    stage: 2,
                    language,
                    direction: "inbound".to_string(),
                })
                .await;
            }
            return;
        }

        let (effective, silenced) = match self.echo_gate.process_inbound(audio) {
            GateDecision::Pass => (audio.to_vec(), false),
            GateDecision::Breakthrough => {
                self.core.call.lock().await.metrics.echo_gate_breakthroughs += 1;
                (audio.to_vec(), false)
            }
            GateDecision::Silence(frame) => (frame, true),
        };

        if let Some(vad) = &self.local_vad {
            // LocalVAD consumes every frame so upstream commits see the
            // whole segment.
            vad.lock().await.process(&effective).await;
            self.session_b
                .send_recipient_audio(&BASE64.encode(&effective))
                .await;
            self.ring_buffer_b.lock().unwrap().mark_sent(seq);
            return;
        }

        // Server-VAD path: a plain energy gate filters dead air.
        if !silenced
            && self.config.energy.gate_enabled
            && ulaw_rms(audio) < self.config.energy.audio_min_rms
        {
            self.ring_buffer_b.lock().unwrap().mark_sent(seq);
            return;
        }
        self.session_b
            .send_recipient_audio(&BASE64.encode(&effective))
            .await;
        self.ring_buffer_b.lock().unwrap().mark_sent(seq);
    }

    /// Voice-mode text input: hold until the recipient finishes, then relay.
    pub async fn relay_user_text(&self, text: &str) {
        let mode = {
            let mut call = self.core.call.lock().await;
            call.transcript_history.push(crate::types::HistoryEntry {
                role: "user".to_string(),
                text: text.to_string(),
            });
            call.mode
        };
        self.session_a.mark_user_input();

        if self.interrupt.is_recipient_speaking() {
            info!("Recipient is speaking — holding text until they finish");
            self.interrupt
                .wait_for_recipient_done(Duration::from_secs(10))
                .await;
        }
        if self.session_a.is_generating() {
            debug!("Waiting for Session A to finish before sending text");
            self.session_a.wait_for_done(Duration::from_secs(5)).await;
        }

        let result = if mode == CallMode::Relay {
            let source = self.core.call.lock().await.source_language.clone();
            self.session_a
                .send_user_text(&format!("[User says in {source}]: {text}"))
                .await
        } else {
            self.session_a.send_user_text(text).await
        };
        if let Err(e) = result {
            warn!("user text send failed: {e}");
        }
    }
}
