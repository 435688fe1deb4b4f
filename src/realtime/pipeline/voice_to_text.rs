//! Voice-to-text pipeline
//!
//! Identical dataflow to voice-to-voice, but the recipient side comes back
//! as captions only: Session B audio deltas are dropped at the client sink.

use async_trait::async_trait;

use super::voice_to_voice::VoiceToVoicePipeline;
use super::{Pipeline, PipelineDeps};

pub struct VoiceToTextPipeline {
    inner: VoiceToVoicePipeline,
}

impl VoiceToTextPipeline {
    pub fn new(deps: PipelineDeps) -> Self {
        Self {
            inner: VoiceToVoicePipeline::new(deps, true),
        }
    }
}

#[async_trait]
impl Pipeline for VoiceToTextPipeline {
    async fn start(&self) {
        self.inner.start().await;
    }

    async fn stop(&self) {
        self.inner.stop().await;
    }

    async fn handle_user_audio(&self, audio_b64: &str) {
        self.inner.handle_user_audio(audio_b64).await;
    }

    async fn handle_user_audio_commit(&self) {
        self.inner.handle_user_audio_commit().await;
    }

    async fn handle_user_text(&self, text: &str) {
        self.inner.handle_user_text(text).await;
    }

    async fn handle_telephony_audio(&self, audio: &[u8]) {
        self.inner.handle_telephony_audio(audio).await;
    }
}
