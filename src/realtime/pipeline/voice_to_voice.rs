//! Voice-to-voice pipeline
//!
//! The baseline composition: user audio drives Session A toward the
//! carrier, carrier audio drives Session B toward the client (audio plus
//! two-stage captions), with the echo gate, local VAD, interrupt handling
//! and recovery in between.

use async_trait::async_trait;
use std::sync::Arc;
use tracing::info;

use super::core::{build_parts, PartsFlags, PipelineParts};
use super::{Pipeline, PipelineDeps};

pub struct VoiceToVoicePipeline {
    parts: Arc<PipelineParts>,
}

impl VoiceToVoicePipeline {
    /// `suppress_b_audio` turns this into the caption-only variant.
    pub fn new(deps: PipelineDeps, suppress_b_audio: bool) -> Self {
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
                suppress_b_audio,
                exact_first_message: false,
                duplex_tts: false,
                track_playback: !suppress_b_audio,
            },
        );
        Self { parts }
    }
}

#[async_trait]
impl Pipeline for VoiceToVoicePipeline {
    async fn start(&self) {
        self.parts.start_shared().await;
        info!("VoiceToVoice pipeline started");
    }

    async fn stop(&self) {
        self.parts.stop_shared().await;
        info!("VoiceToVoice pipeline stopped");
    }

    async fn handle_user_audio(&self, audio_b64: &str) {
        self.parts.ingest_user_audio(audio_b64).await;
    }

    async fn handle_user_audio_commit(&self) {
        self.parts.ingest_user_commit().await;
    }

    async fn handle_user_text(&self, text: &str) {
        self.parts.relay_user_text(text).await;
    }

    async fn handle_telephony_audio(&self, audio: &[u8]) {
        self.parts.ingest_carrier_audio(audio).await;
    }
}
