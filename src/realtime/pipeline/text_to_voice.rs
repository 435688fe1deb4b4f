//! Text-to-voice pipeline
//!
//! The user types; Session A speaks the translation to the recipient. User
//! audio is ignored. Text submissions are serialized through a per-call
//! lock — concurrent sends would race two response.create calls into the
//! same session. In relay mode each send carries a per-response instruction
//! override forcing a bare translation, so the model never answers the
//! recipient's question itself.
//!
//! The outgoing message order on Session A is always two messages:
//! conversation.item.create, then response.create (with the override).

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::prompt;
use crate::types::{CallMode, ServerMessage};

use super::core::{build_parts, PartsFlags, PipelineParts};
use super::{Pipeline, PipelineDeps};

pub struct TextToVoicePipeline {
    parts: Arc<PipelineParts>,
    text_send_lock: tokio::sync::Mutex<()>,
    strict_relay_instruction: String,
    typing_filler_played: AtomicBool,
    target_language: String,
}

impl TextToVoicePipeline {
    pub fn new(deps: PipelineDeps) -> Self {
        let (source_language, target_language) = {
            let call = deps
                .call
                .try_lock()
                .expect("call is unshared during pipeline build");
            (call.source_language.clone(), call.target_language.clone())
        };
        let strict_relay_instruction =
            prompt::strict_relay_instruction(&source_language, &target_language);

        let parts = build_parts(
            deps.config,
            deps.call,
            deps.dual,
            deps.telephony,
            deps.notify,
            deps.store,
            deps.stt,
            deps.vad_model,
            deps.prompt_a,
            deps.prompt_b,
            PartsFlags {
                suppress_b_audio: true,
                exact_first_message: true,
                duplex_tts: true,
                track_playback: false,
            },
        );
        Self {
            parts,
            text_send_lock: tokio::sync::Mutex::new(()),
            strict_relay_instruction,
            typing_filler_played: AtomicBool::new(false),
            target_language,
        }
    }
}

#[async_trait]
impl Pipeline for TextToVoicePipeline {
    async fn start(&self) {
        self.parts.start_shared().await;
        info!("TextToVoice pipeline started");
    }

    async fn stop(&self) {
        self.parts.stop_shared().await;
        info!("TextToVoice pipeline stopped");
    }

    async fn handle_user_audio(&self, _audio_b64: &str) {
        debug!("TextToVoice: ignoring audio input (text-only mode)");
    }

    async fn handle_user_audio_commit(&self) {
        debug!("TextToVoice: ignoring audio commit (text-only mode)");
    }

    async fn handle_user_text(&self, text: &str) {
        let _guard = self.text_send_lock.lock().await;
        let parts = &self.parts;

        let mode = {
            let mut call = parts.core.call.lock().await;
            call.transcript_history.push(crate::types::HistoryEntry {
                role: "user".to_string(),
                text: text.to_string(),
            });
            call.mode
        };

        parts.session_a.mark_user_input();
        if parts.session_a.is_generating() {
            debug!("Waiting for Session A to finish before sending text");
            parts
                .session_a
                .wait_for_done(Duration::from_secs(5))
                .await;
        }

        (parts.core.notify)(ServerMessage::TranslationState {
            state: "processing".to_string(),
            direction: None,
        })
        .await;

        parts
            .context
            .lock()
            .await
            .inject_context(&parts.dual.session_a)
            .await;

        let result = if mode == CallMode::Relay {
            // item.create first, then response.create with the override.
            match parts.dual.session_a.send_text_item(text).await {
                Ok(()) => {
                    parts
                        .dual
                        .session_a
                        .create_response(Some(&self.strict_relay_instruction))
                        .await
                }
                Err(e) => Err(e),
            }
        } else {
            parts.session_a.send_user_text(text).await
        };
        if let Err(e) = result {
            warn!("text send failed: {e}");
        }
    }

    async fn handle_telephony_audio(&self, audio: &[u8]) {
        self.parts.ingest_carrier_audio(audio).await;
    }

    /// One-shot hold-on utterance while the user types a longer reply.
    /// Only after a prior user turn — a filler before any exchange would
    /// confuse the recipient — and at most once per call.
    async fn handle_typing_started(&self) {
        let has_user_turn = {
            let call = self.parts.core.call.lock().await;
            call.transcript_history.iter().any(|e| e.role == "user")
        };
        if !has_user_turn {
            return;
        }
        if self.typing_filler_played.swap(true, Ordering::SeqCst) {
            return;
        }

        let filler = prompt::typing_filler(&self.target_language);
        info!("Playing typing filler: '{filler}'");
        let instruction = prompt::exact_utterance_instruction(filler);
        let session = &self.parts.dual.session_a;
        if session.send_text_item(filler).await.is_ok() {
            let _ = session.create_response(Some(&instruction)).await;
        }
    }
}
