//! Turn overlap / interrupt handling
//!
//! Priority: recipient speech > user speech > AI output. The recipient must
//! never be kept waiting: when they start talking, any in-flight Session A
//! generation is cancelled and the carrier's buffered TTS is flushed.
//!
//! The `is_recipient_speaking` flag keeps reporting true for a grace period
//! after speech stops, covering the micro-pause mid-sentence case; callers
//! suppress outbound TTS while it is set.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::info;

use crate::types::ServerMessage;

use super::session_a::SessionAHandler;
use super::{AsyncHook, NotifySink};

/// Shared recipient-speaking state. Split out from the handler so outbound
/// TTS sinks can consult it without owning the handler.
pub struct RecipientSpeechState {
    speaking: AtomicBool,
    last_stopped_at: Mutex<Option<Instant>>,
    cooldown: Duration,
}

impl RecipientSpeechState {
    pub fn new(cooldown: Duration) -> Arc<Self> {
        Arc::new(Self {
            speaking: AtomicBool::new(false),
            last_stopped_at: Mutex::new(None),
            cooldown,
        })
    }

    /// True while the recipient is speaking or within the post-stop grace
    /// period.
    pub fn is_speaking(&self) -> bool {
        if self.speaking.load(Ordering::SeqCst) {
            return true;
        }
        self.last_stopped_at
            .lock()
            .unwrap()
            .map(|t| t.elapsed() < self.cooldown)
            .unwrap_or(false)
    }

    fn mark_started(&self) {
        self.speaking.store(true, Ordering::SeqCst);
        *self.last_stopped_at.lock().unwrap() = None;
    }

    fn mark_stopped(&self) {
        self.speaking.store(false, Ordering::SeqCst);
        *self.last_stopped_at.lock().unwrap() = Some(Instant::now());
    }
}

pub struct InterruptHandler {
    session_a: Arc<SessionAHandler>,
    speech_state: Arc<RecipientSpeechState>,
    /// Flush the carrier's playback queue (it may hold buffered TTS).
    clear_telephony: AsyncHook,
    notify: NotifySink,
}

impl InterruptHandler {
    pub fn new(
        session_a: Arc<SessionAHandler>,
        speech_state: Arc<RecipientSpeechState>,
        clear_telephony: AsyncHook,
        notify: NotifySink,
    ) -> Arc<Self> {
        Arc::new(Self {
            session_a,
            speech_state,
            clear_telephony,
            notify,
        })
    }

    pub fn is_recipient_speaking(&self) -> bool {
        self.speech_state.is_speaking()
    }

    /// Recipient started talking: cancel AI output, flush the carrier, tell
    /// the client.
    pub async fn on_recipient_speech_started(&self) {
        self.speech_state.mark_started();

        if self.session_a.is_generating() {
            info!("Interrupt: recipient speech while Session A generating — cancelling");
            self.session_a.cancel().await;
        }

        // The carrier may still be playing previously sent TTS.
        (self.clear_telephony)().await;

        (self.notify)(ServerMessage::InterruptAlert {
            speaking: "recipient".to_string(),
        })
        .await;
    }

    /// Records the stop instant; the grace period is applied by
    /// `is_recipient_speaking`, not here.
    pub async fn on_recipient_speech_stopped(&self) {
        self.speech_state.mark_stopped();
    }

    /// Poll until the recipient (including grace period) goes quiet.
    pub async fn wait_for_recipient_done(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while self.is_recipient_speaking() {
            if Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::realtime::session::RealtimeSession;
    use crate::realtime::session_a::SessionACallbacks;
    use crate::types::{
        Call, CallMode, CallStartRequest, CommunicationMode, SessionLabel,
        UpstreamSessionConfig, VadMode,
    };
    use std::sync::atomic::AtomicUsize;

    fn make_handler() -> (Arc<InterruptHandler>, Arc<AtomicUsize>, Arc<AtomicUsize>) {
        let session = Arc::new(RealtimeSession::new(
            SessionLabel::A,
            UpstreamSessionConfig {
                label: SessionLabel::A,
                input_audio_format: "pcm16".to_string(),
                output_audio_format: "g711_ulaw".to_string(),
                modalities: vec!["audio".to_string()],
                vad_mode: VadMode::Client,
                input_transcription: None,
                tools: None,
            },
            Arc::new(Config::default()),
        ));
        let call = Arc::new(tokio::sync::Mutex::new(Call::new(&CallStartRequest {
            call_id: "c-1".to_string(),
            phone_number: "+14155552671".to_string(),
            mode: CallMode::Relay,
            source_language: "en".to_string(),
            target_language: "ko".to_string(),
            collected_data: None,
            communication_mode: CommunicationMode::VoiceToVoice,
            system_prompt_override: None,
        })));
        let session_a = SessionAHandler::new(session, call, None, SessionACallbacks::default());

        let clears = Arc::new(AtomicUsize::new(0));
        let alerts = Arc::new(AtomicUsize::new(0));
        let c = clears.clone();
        let a = alerts.clone();
        let clear_hook: AsyncHook = Arc::new(move || {
            let c = c.clone();
            Box::pin(async move {
                c.fetch_add(1, Ordering::SeqCst);
            })
        });
        let notify: NotifySink = Arc::new(move |_msg| {
            let a = a.clone();
            Box::pin(async move {
                a.fetch_add(1, Ordering::SeqCst);
            })
        });

        let state = RecipientSpeechState::new(Duration::from_millis(100));
        (
            InterruptHandler::new(session_a, state, clear_hook, notify),
            clears,
            alerts,
        )
    }

    #[tokio::test]
    async fn test_interrupt_always_clears_carrier() {
        let (handler, clears, alerts) = make_handler();
        handler.on_recipient_speech_started().await;
        assert_eq!(clears.load(Ordering::SeqCst), 1);
        assert_eq!(alerts.load(Ordering::SeqCst), 1);
        assert!(handler.is_recipient_speaking());
    }

    #[tokio::test]
    async fn test_grace_period_after_stop() {
        let (handler, _, _) = make_handler();
        handler.on_recipient_speech_started().await;
        handler.on_recipient_speech_stopped().await;
        // Still "speaking" within the grace window.
        assert!(handler.is_recipient_speaking());
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(!handler.is_recipient_speaking());
    }

    #[tokio::test]
    async fn test_restart_resets_grace_window() {
        let (handler, _, _) = make_handler();
        handler.on_recipient_speech_started().await;
        handler.on_recipient_speech_stopped().await;
        handler.on_recipient_speech_started().await;
        tokio::time::sleep(Duration::from_millis(150)).await;
        // Speaking flag itself dominates the expired timestamp.
        assert!(handler.is_recipient_speaking());
    }

    #[tokio::test]
    async fn test_wait_for_recipient_done() {
        let (handler, _, _) = make_handler();
        handler.on_recipient_speech_started().await;
        handler.on_recipient_speech_stopped().await;
        assert!(
            handler
                .wait_for_recipient_done(Duration::from_secs(1))
                .await
        );
        assert!(!handler.is_recipient_speaking());
    }
}
