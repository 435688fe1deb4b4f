//! Per-mode pipeline composition
//!
//! A closed set of four pipeline variants behind one interface. The factory
//! picks the variant from the call's communication mode at start time; the
//! variant then owns the call's dataflow until cleanup.

pub mod core;
pub mod full_agent;
pub mod text_to_voice;
pub mod voice_to_text;
pub mod voice_to_voice;

use async_trait::async_trait;
use std::sync::Arc;

use crate::config::Config;
use crate::db::CallStore;
use crate::stt::FallbackStt;
use crate::telephony::TelephonyMediaHandler;
use crate::types::{Call, CommunicationMode};
use crate::vad::silero::SpeechModel;

use super::dual::DualSessionManager;
use super::NotifySink;

/// The surface every mode variant exposes to the two WebSocket edges.
#[async_trait]
pub trait Pipeline: Send + Sync {
    async fn start(&self);
    async fn stop(&self);
    /// Client microphone audio (base64 pcm16).
    async fn handle_user_audio(&self, audio_b64: &str);
    /// Client VAD end-of-utterance signal.
    async fn handle_user_audio_commit(&self);
    /// Client text input.
    async fn handle_user_text(&self, text: &str);
    /// One decoded mu-law frame from the carrier.
    async fn handle_telephony_audio(&self, audio: &[u8]);
    /// Client started typing (text modes may play a filler).
    async fn handle_typing_started(&self) {}
}

/// Everything the factory needs to assemble a pipeline.
pub struct PipelineDeps {
    pub config: Arc<Config>,
    pub call: Arc<tokio::sync::Mutex<Call>>,
    pub dual: Arc<DualSessionManager>,
    pub telephony: Arc<TelephonyMediaHandler>,
    pub notify: NotifySink,
    pub store: Arc<CallStore>,
    pub stt: Arc<FallbackStt>,
    pub vad_model: Option<Box<dyn SpeechModel>>,
    pub prompt_a: String,
    pub prompt_b: String,
}

/// Build the variant for the given communication mode.
pub fn build_pipeline(mode: CommunicationMode, deps: PipelineDeps) -> Arc<dyn Pipeline> {
    match mode {
        CommunicationMode::VoiceToVoice => {
            Arc::new(voice_to_voice::VoiceToVoicePipeline::new(deps, false))
        }
        CommunicationMode::VoiceToText => Arc::new(voice_to_text::VoiceToTextPipeline::new(deps)),
        CommunicationMode::TextToVoice => Arc::new(text_to_voice::TextToVoicePipeline::new(deps)),
        CommunicationMode::FullAgent => Arc::new(full_agent::FullAgentPipeline::new(deps)),
    }
}
