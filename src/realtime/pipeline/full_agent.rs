//! Full-agent pipeline
//!
//! Same composition as text-to-voice, with the agent feedback loop active:
//! every completed recipient turn is forwarded back into Session A as
//! `[Recipient says]: <text>` so the agent generates the next utterance
//! without client input, and the function-call tool set is registered with
//! Session A. Both behaviors key off the call's Agent mode inside the
//! shared wiring; this variant fixes the composition for the mode.

use async_trait::async_trait;
use tracing::info;

use super::text_to_voice::TextToVoicePipeline;
use super::{Pipeline, PipelineDeps};

pub struct FullAgentPipeline {
    inner: TextToVoicePipeline,
}

impl FullAgentPipeline {
    pub fn new(deps: PipelineDeps) -> Self {
        info!("FullAgent pipeline created");
        Self {
            inner: TextToVoicePipeline::new(deps),
        }
    }
}

#[async_trait]
impl Pipeline for FullAgentPipeline {
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

    /// Agent mode still accepts user text: the user supplements information
    /// the agent does not have.
    async fn handle_user_text(&self, text: &str) {
        self.inner.handle_user_text(text).await;
    }

    async fn handle_telephony_audio(&self, audio: &[u8]) {
        self.inner.handle_telephony_audio(audio).await;
    }

    async fn handle_typing_started(&self) {
        self.inner.handle_typing_started().await;
    }
}
