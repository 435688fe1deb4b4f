//! Session recovery — failure detection, reconnect, catch-up, degraded mode
//!
//! One manager per upstream session. A heartbeat timestamp refreshes on
//! every observed event; a monitor task looks for event silence or an
//! unexpectedly closed socket and starts recovery. Recovery reconnects with
//! exponential backoff, rebuilds the system prompt with a recent-transcript
//! footer, then fills the audio gap: whatever the ring buffer holds beyond
//! the sent watermark goes to the fallback batch STT and comes back as a
//! `[recovered]` caption.
//!
//! If recovery exceeds its time or attempt limits the session drops to
//! degraded mode: audio keeps accumulating and gets batch-transcribed every
//! few seconds until a live connection is re-established.
//!
//! Every state change appends a RecoveryEvent to the Call and notifies the
//! client with a session.recovery message.

use serde_json::Value;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::audio::ring_buffer::AudioRingBuffer;
use crate::config::Config;
use crate::stt::FallbackStt;
use crate::types::{
    Call, RecoveryEvent, RecoveryEventType, ServerMessage, SessionLabel, SessionState,
};

use super::session::{
    is_harmless_error_code, RealtimeSession, EV_AUDIO_COMMITTED, EV_ERROR,
    EV_INPUT_TRANSCRIPTION_COMPLETED, EV_RESPONSE_AUDIO_DELTA,
    EV_RESPONSE_AUDIO_TRANSCRIPT_DELTA, EV_RESPONSE_DONE, EV_RESPONSE_TEXT_DELTA,
    EV_SESSION_CREATED, EV_SESSION_UPDATED, EV_SPEECH_STARTED, EV_SPEECH_STOPPED,
};
use super::{CaptionSink, NotifySink};

struct RecoveryState {
    recovering: bool,
    degraded: bool,
    stopped: bool,
    attempt: u32,
    last_heartbeat: Instant,
    degraded_buffer: Vec<u8>,
    degraded_buffer_started: Option<Instant>,
    degraded_retry_at: Option<Instant>,
}

pub struct RecoveryManager {
    session: Arc<RealtimeSession>,
    ring_buffer: Arc<Mutex<AudioRingBuffer>>,
    call: Arc<tokio::sync::Mutex<Call>>,
    config: Arc<Config>,
    stt: Arc<FallbackStt>,
    system_prompt: String,
    tools: Option<Vec<Value>>,
    notify: NotifySink,
    on_recovered_caption: Option<CaptionSink>,
    /// Language hint for batch STT of this direction's audio.
    stt_language: String,
    state: Mutex<RecoveryState>,
    monitor_task: Mutex<Option<JoinHandle<()>>>,
    recovery_task: Mutex<Option<JoinHandle<()>>>,
}

impl RecoveryManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        session: Arc<RealtimeSession>,
        ring_buffer: Arc<Mutex<AudioRingBuffer>>,
        call: Arc<tokio::sync::Mutex<Call>>,
        config: Arc<Config>,
        stt: Arc<FallbackStt>,
        system_prompt: String,
        tools: Option<Vec<Value>>,
        notify: NotifySink,
        on_recovered_caption: Option<CaptionSink>,
        stt_language: String,
    ) -> Arc<Self> {
        Arc::new(Self {
            session,
            ring_buffer,
            call,
            config,
            stt,
            system_prompt,
            tools,
            notify,
            on_recovered_caption,
            stt_language,
            state: Mutex::new(RecoveryState {
                recovering: false,
                degraded: false,
                stopped: false,
                attempt: 0,
                last_heartbeat: Instant::now(),
                degraded_buffer: Vec::new(),
                degraded_buffer_started: None,
                degraded_retry_at: None,
            }),
            monitor_task: Mutex::new(None),
            recovery_task: Mutex::new(None),
        })
    }

    pub fn is_recovering(&self) -> bool {
        self.state.lock().unwrap().recovering
    }

    pub fn is_degraded(&self) -> bool {
        self.state.lock().unwrap().degraded
    }

    /// Refresh the liveness timestamp.
    pub fn touch(&self) {
        self.state.lock().unwrap().last_heartbeat = Instant::now();
    }

    /// Register heartbeat/error hooks on the session and start the monitor.
    pub fn start_monitoring(self: &Arc<Self>) {
        self.touch();

        for event_type in [
            EV_SESSION_CREATED,
            EV_SESSION_UPDATED,
            EV_RESPONSE_DONE,
            EV_RESPONSE_AUDIO_DELTA,
            EV_RESPONSE_AUDIO_TRANSCRIPT_DELTA,
            EV_RESPONSE_TEXT_DELTA,
            EV_SPEECH_STARTED,
            EV_SPEECH_STOPPED,
            EV_AUDIO_COMMITTED,
            EV_INPUT_TRANSCRIPTION_COMPLETED,
        ] {
            let me = Arc::clone(self);
            self.session.on(
                event_type,
                Arc::new(move |_ev| {
                    let me = me.clone();
                    Box::pin(async move { me.touch() })
                        as futures::future::BoxFuture<'static, ()>
                }),
            );
        }

        {
            let me = Arc::clone(self);
            self.session.on(
                EV_ERROR,
                Arc::new(move |ev| {
                    let me = me.clone();
                    Box::pin(async move { me.on_session_error(ev).await })
                        as futures::future::BoxFuture<'static, ()>
                }),
            );
        }

        {
            let me = Arc::clone(self);
            self.session.set_on_connection_lost(Arc::new(move || {
                let me = me.clone();
                Box::pin(async move {
                    me.start_recovery("connection_closed").await;
                }) as futures::future::BoxFuture<'static, ()>
            }));
        }

        let me = Arc::clone(self);
        *self.monitor_task.lock().unwrap() = Some(tokio::spawn(async move {
            me.monitor_loop().await;
        }));
    }

    /// Permanently stop: no further recovery may start (call teardown
    /// closes the sockets, which must not look like a failure).
    pub async fn stop(&self) {
        self.state.lock().unwrap().stopped = true;
        if let Some(task) = self.monitor_task.lock().unwrap().take() {
            task.abort();
        }
        if let Some(task) = self.recovery_task.lock().unwrap().take() {
            task.abort();
        }
    }

    async fn on_session_error(self: &Arc<Self>, event: Arc<Value>) {
        let code = event
            .pointer("/error/code")
            .and_then(Value::as_str)
            .unwrap_or("");
        if is_harmless_error_code(code) {
            return;
        }
        let message = event
            .pointer("/error/message")
            .and_then(Value::as_str)
            .unwrap_or("unknown error");
        error!("[{}] Session error detected: {message}", self.session.label);
        self.start_recovery(&format!("session_error: {message}"))
            .await;
    }

    async fn monitor_loop(self: Arc<Self>) {
        let interval = Duration::from_secs_f64(self.config.recovery.heartbeat_interval_s);
        loop {
            tokio::time::sleep(interval).await;

            if self.is_recovering() {
                continue;
            }
            if self.is_degraded() {
                self.try_degraded_reconnect().await;
                continue;
            }

            let elapsed = self.state.lock().unwrap().last_heartbeat.elapsed();
            if elapsed.as_secs_f64() > self.config.recovery.heartbeat_timeout_s
                && !self.session.is_closed()
            {
                warn!(
                    "[{}] Heartbeat timeout ({:.1}s since last event)",
                    self.session.label,
                    elapsed.as_secs_f64()
                );
                self.start_recovery("heartbeat_timeout").await;
                continue;
            }

            if self.session.is_closed() {
                warn!("[{}] Session closed unexpectedly", self.session.label);
                self.start_recovery("connection_closed").await;
            }
        }
    }

    /// Enter the RECONNECTING state and spawn the reconnect loop.
    pub async fn start_recovery(self: &Arc<Self>, reason: &str) {
        {
            let mut state = self.state.lock().unwrap();
            if state.stopped || state.recovering || state.degraded {
                return;
            }
            state.recovering = true;
            state.attempt = 0;
        }

        self.update_session_state(SessionState::Reconnecting).await;
        self.record_event(RecoveryEventType::SessionDisconnected, 0, reason)
            .await;
        self.notify_recovery("recovering", self.gap_ms(), "Reconnecting the session...")
            .await;

        let me = Arc::clone(self);
        *self.recovery_task.lock().unwrap() = Some(tokio::spawn(async move {
            me.recovery_loop().await;
        }));
    }

    async fn recovery_loop(self: Arc<Self>) {
        let recovery_started = Instant::now();

        loop {
            if !self.is_recovering() {
                return;
            }

            let attempt = {
                let mut state = self.state.lock().unwrap();
                state.attempt += 1;
                state.attempt
            };
            let backoff = self.backoff_for_attempt(attempt);
            info!(
                "[{}] Reconnect attempt #{attempt} (backoff={:.1}s)",
                self.session.label,
                backoff.as_secs_f64()
            );
            self.record_event(RecoveryEventType::ReconnectAttempt, 0, "")
                .await;

            tokio::time::sleep(backoff).await;

            if recovery_started.elapsed().as_secs_f64() > self.config.recovery.recovery_timeout_s {
                warn!(
                    "[{}] Recovery timeout ({:.1}s) — entering degraded mode",
                    self.session.label,
                    recovery_started.elapsed().as_secs_f64()
                );
                self.enter_degraded_mode().await;
                return;
            }

            self.session.close().await;
            let prompt = self.build_recovery_prompt().await;
            match self.session.connect(&prompt, self.tools.as_deref()).await {
                Ok(()) => {
                    self.touch();
                    info!(
                        "[{}] Reconnected successfully (attempt #{attempt})",
                        self.session.label
                    );
                    self.record_event(RecoveryEventType::ReconnectSuccess, 0, "")
                        .await;

                    self.catchup().await;

                    self.state.lock().unwrap().recovering = false;
                    self.update_session_state(SessionState::Connected).await;
                    self.record_event(RecoveryEventType::NormalRestored, 0, "")
                        .await;
                    self.notify_recovery("recovered", 0, "Session restored.").await;

                    let session = self.session.clone();
                    tokio::spawn(async move { session.listen().await });
                    return;
                }
                Err(e) => {
                    error!(
                        "[{}] Reconnect attempt #{attempt} failed: {e}",
                        self.session.label
                    );
                    self.record_event(RecoveryEventType::ReconnectFailed, 0, &e.to_string())
                        .await;
                    if attempt >= self.config.recovery.max_attempts {
                        warn!(
                            "[{}] Max reconnect attempts reached — entering degraded mode",
                            self.session.label
                        );
                        self.enter_degraded_mode().await;
                        return;
                    }
                }
            }
        }
    }

    fn backoff_for_attempt(&self, attempt: u32) -> Duration {
        let r = &self.config.recovery;
        let secs = (r.initial_backoff_s * r.backoff_multiplier.powi(attempt as i32 - 1))
            .min(r.max_backoff_s);
        Duration::from_secs_f64(secs)
    }

    /// Original prompt plus a footer with the recent transcript, so the new
    /// session resumes with context.
    async fn build_recovery_prompt(&self) -> String {
        let call = self.call.lock().await;
        if call.transcript_history.is_empty() {
            return self.system_prompt.clone();
        }
        let context: Vec<String> = call
            .transcript_history
            .iter()
            .rev()
            .take(20)
            .rev()
            .map(|entry| format!("[{}]: {}", entry.role, entry.text))
            .collect();
        format!(
            "{}\n\n--- Previous conversation context (restored after reconnection) ---\n{}\n--- End of context ---\nContinue the conversation naturally.",
            self.system_prompt,
            context.join("\n")
        )
    }

    /// Batch-transcribe the unsent ring-buffer span and surface it as a
    /// recovered caption. The gap is skipped (watermark advanced) whether or
    /// not transcription succeeds — a lost span must not wedge the session.
    async fn catchup(&self) {
        let (gap_ms, unsent) = {
            let rb = self.ring_buffer.lock().unwrap();
            (rb.gap_ms(), rb.unsent_bytes())
        };
        if gap_ms == 0 {
            info!("[{}] No audio gap — skipping catch-up", self.session.label);
            return;
        }

        info!(
            "[{}] Starting catch-up: gap={gap_ms}ms ({} bytes)",
            self.session.label,
            unsent.len()
        );
        self.record_event(RecoveryEventType::CatchupStarted, gap_ms, "")
            .await;

        match self.stt.transcribe_ulaw(&unsent, &self.stt_language).await {
            Ok(Some(text)) => {
                if let Some(sink) = &self.on_recovered_caption {
                    sink("recipient".to_string(), format!("[recovered] {text}")).await;
                }
            }
            Ok(None) => {
                debug!("[{}] Catch-up produced no usable text", self.session.label);
            }
            Err(e) => {
                error!("[{}] Catch-up failed: {e}", self.session.label);
            }
        }

        self.ring_buffer.lock().unwrap().mark_all_sent();
        self.record_event(
            RecoveryEventType::CatchupCompleted,
            gap_ms,
            &format!("transcribed {} bytes", unsent.len()),
        )
        .await;
    }

    async fn enter_degraded_mode(&self) {
        {
            let mut state = self.state.lock().unwrap();
            state.degraded = true;
            state.recovering = false;
            state.degraded_retry_at = None;
        }
        self.update_session_state(SessionState::Degraded).await;
        self.record_event(RecoveryEventType::DegradedModeEntered, 0, "")
            .await;
        self.notify_recovery(
            "degraded",
            self.gap_ms(),
            "Captions are temporarily delayed.",
        )
        .await;
        warn!("[{}] Entered degraded mode", self.session.label);
    }

    /// Back to normal after a live connection is re-established.
    pub async fn exit_degraded_mode(&self) {
        {
            let mut state = self.state.lock().unwrap();
            state.degraded = false;
            state.degraded_buffer.clear();
            state.degraded_buffer_started = None;
        }
        self.update_session_state(SessionState::Connected).await;
        self.record_event(RecoveryEventType::DegradedModeExited, 0, "")
            .await;
        self.notify_recovery("recovered", 0, "Session restored.").await;
    }

    /// While degraded, retry a live reconnect at the max-backoff cadence.
    async fn try_degraded_reconnect(self: &Arc<Self>) {
        let due = {
            let mut state = self.state.lock().unwrap();
            let cadence = Duration::from_secs_f64(self.config.recovery.max_backoff_s);
            match state.degraded_retry_at {
                Some(last) if last.elapsed() < cadence => false,
                _ => {
                    state.degraded_retry_at = Some(Instant::now());
                    true
                }
            }
        };
        if !due {
            return;
        }

        self.session.close().await;
        let prompt = self.build_recovery_prompt().await;
        match self.session.connect(&prompt, self.tools.as_deref()).await {
            Ok(()) => {
                info!("[{}] Live session restored from degraded mode", self.session.label);
                self.touch();
                self.catchup().await;
                self.exit_degraded_mode().await;
                let session = self.session.clone();
                tokio::spawn(async move { session.listen().await });
            }
            Err(e) => {
                debug!("[{}] Degraded-mode reconnect failed: {e}", self.session.label);
            }
        }
    }

    /// Degraded-mode ingest: accumulate and batch-transcribe. Intermediate
    /// calls return None while the batch fills.
    pub async fn process_degraded_audio(&self, audio: &[u8]) -> Option<String> {
        let batch = {
            let mut state = self.state.lock().unwrap();
            if !state.degraded {
                return None;
            }
            if state.degraded_buffer.is_empty() {
                state.degraded_buffer_started = Some(Instant::now());
            }
            state.degraded_buffer.extend_from_slice(audio);

            let elapsed = state
                .degraded_buffer_started
                .map(|t| t.elapsed().as_secs_f64())
                .unwrap_or(0.0);
            if elapsed < self.config.recovery.degraded_batch_s {
                return None;
            }
            state.degraded_buffer_started = None;
            std::mem::take(&mut state.degraded_buffer)
        };

        match self.stt.transcribe_ulaw(&batch, &self.stt_language).await {
            Ok(text) => text,
            Err(e) => {
                error!(
                    "[{}] Degraded mode transcription failed: {e}",
                    self.session.label
                );
                None
            }
        }
    }

    // --- Bookkeeping ---

    fn gap_ms(&self) -> u64 {
        self.ring_buffer.lock().unwrap().gap_ms()
    }

    async fn update_session_state(&self, state: SessionState) {
        let mut call = self.call.lock().await;
        match self.session.label {
            SessionLabel::A => call.session_a_state = state,
            SessionLabel::B => call.session_b_state = state,
        }
    }

    async fn record_event(&self, event_type: RecoveryEventType, gap_ms: u64, detail: &str) {
        let gap_ms = if gap_ms > 0 { gap_ms } else { self.gap_ms() };
        let attempt = self.state.lock().unwrap().attempt;
        let event = RecoveryEvent {
            event_type,
            session_label: self.session.label.to_string(),
            gap_ms,
            attempt,
            detail: detail.to_string(),
            timestamp: chrono::Utc::now(),
        };
        info!(
            "[{}] Recovery event: {:?} (gap={}ms, attempt={}) {}",
            self.session.label, event_type, gap_ms, attempt, detail
        );
        self.call.lock().await.recovery_events.push(event);
    }

    async fn notify_recovery(&self, status: &str, gap_ms: u64, message: &str) {
        (self.notify)(ServerMessage::SessionRecovery {
            status: status.to_string(),
            session: self.session.label.to_string(),
            gap_ms,
            message: message.to_string(),
        })
        .await;
    }
}
