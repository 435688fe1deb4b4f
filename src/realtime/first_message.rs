//! First message strategy — AI identification
//!
//! The call flow: the carrier dials, the recipient answers ("hello?"),
//! Session B detects that first utterance, and the relay speaks an AI
//! identification through Session A before anything else. One-shot per
//! call, guarded by `call.first_message_sent`.
//!
//! Two dispatch modes: normal passes the greeting as user text so the
//! session may adapt its rendering; exact-utterance pins the output with a
//! per-response instruction so text-input modes produce a fixed greeting
//! without conversational expansion.

use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::prompt;
use crate::types::{Call, CallMode, CallStatus, ServerMessage};

use super::session_a::SessionAHandler;
use super::NotifySink;

pub struct FirstMessageHandler {
    call: Arc<tokio::sync::Mutex<Call>>,
    session_a: Arc<SessionAHandler>,
    notify: NotifySink,
    use_exact_utterance: bool,
}

impl FirstMessageHandler {
    pub fn new(
        call: Arc<tokio::sync::Mutex<Call>>,
        session_a: Arc<SessionAHandler>,
        notify: NotifySink,
        use_exact_utterance: bool,
    ) -> Arc<Self> {
        Arc::new(Self {
            call,
            session_a,
            notify,
            use_exact_utterance,
        })
    }

    /// First recipient speech in the call: send the AI identification and
    /// flip the call to connected.
    pub async fn on_recipient_speech_detected(&self) {
        let (mode, source_language, target_language) = {
            let mut call = self.call.lock().await;
            if call.first_message_sent {
                return;
            }
            call.first_message_sent = true;
            call.status = CallStatus::Connected;
            (
                call.mode,
                call.source_language.clone(),
                call.target_language.clone(),
            )
        };

        info!("Recipient answered — sending AI greeting");

        if self.session_a.is_generating() {
            self.session_a.wait_for_done(Duration::from_secs(3)).await;
        }

        let greeting = prompt::first_message_for(&target_language);
        let result = if self.use_exact_utterance {
            let instruction = prompt::exact_utterance_instruction(greeting);
            match self.session_a.session.send_text_item(greeting).await {
                Ok(()) => {
                    self.session_a.mark_user_input();
                    self.session_a
                        .session
                        .create_response(Some(&instruction))
                        .await
                }
                Err(e) => Err(e),
            }
        } else {
            let wrapped = format!("[User says in {source_language}]: {greeting}");
            self.session_a.send_user_text(&wrapped).await
        };
        if let Err(e) = result {
            warn!("First message send failed: {e}");
        }

        let message = match mode {
            CallMode::Relay => "The recipient answered. Go ahead.",
            CallMode::Agent => "The recipient answered. The AI is starting the conversation.",
        };
        (self.notify)(ServerMessage::CallStatus {
            status: "connected".to_string(),
            message: Some(message.to_string()),
            result: None,
            data: None,
        })
        .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::realtime::session::RealtimeSession;
    use crate::realtime::session_a::SessionACallbacks;
    use crate::types::{
        CallStartRequest, CommunicationMode, SessionLabel, UpstreamSessionConfig, VadMode,
    };
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn make(exact: bool) -> (Arc<FirstMessageHandler>, Arc<tokio::sync::Mutex<Call>>, Arc<AtomicUsize>) {
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
        let session_a =
            SessionAHandler::new(session, call.clone(), None, SessionACallbacks::default());

        let notifications = Arc::new(AtomicUsize::new(0));
        let n = notifications.clone();
        let notify: NotifySink = Arc::new(move |msg| {
            let n = n.clone();
            Box::pin(async move {
                if matches!(msg, ServerMessage::CallStatus { ref status, .. } if status == "connected")
                {
                    n.fetch_add(1, Ordering::SeqCst);
                }
            })
        });

        (
            FirstMessageHandler::new(call.clone(), session_a, notify, exact),
            call,
            notifications,
        )
    }

    #[tokio::test]
    async fn test_first_detection_marks_sent_and_connects() {
        let (handler, call, notifications) = make(false);
        handler.on_recipient_speech_detected().await;
        let c = call.lock().await;
        assert!(c.first_message_sent);
        assert_eq!(c.status, CallStatus::Connected);
        assert_eq!(notifications.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_one_shot_guard() {
        let (handler, _, notifications) = make(false);
        handler.on_recipient_speech_detected().await;
        handler.on_recipient_speech_detected().await;
        handler.on_recipient_speech_detected().await;
        assert_eq!(notifications.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_exact_utterance_mode() {
        let (handler, call, _) = make(true);
        handler.on_recipient_speech_detected().await;
        assert!(call.lock().await.first_message_sent);
    }
}
