//! Dual session manager
//!
//! Owns Session A (outbound translation, user -> recipient) and Session B
//! (inbound translation, recipient -> user) and coordinates their lifecycle.
//! The direction never swaps: A produces target-language TTS, B produces
//! source-language text (and optionally TTS).

use serde_json::Value;
use std::sync::Arc;
use tracing::info;

use crate::config::Config;
use crate::types::{
    CommunicationMode, InputTranscription, SessionLabel, UpstreamSessionConfig, VadMode,
};

use super::session::{RealtimeSession, SessionError};

pub struct DualSessionManager {
    pub session_a: Arc<RealtimeSession>,
    pub session_b: Arc<RealtimeSession>,
}

impl DualSessionManager {
    /// Build both sessions with mode-appropriate configurations.
    pub fn new(
        config: Arc<Config>,
        communication_mode: CommunicationMode,
        target_language: &str,
        tools_a: Option<Vec<Value>>,
    ) -> Self {
        // Session A: input matches the client (pcm16), output matches the
        // carrier (g711_ulaw). Turn detection is null — the client's commit
        // signal (voice modes) or the text path (text modes) drives turns.
        let session_a = RealtimeSession::new(
            SessionLabel::A,
            UpstreamSessionConfig {
                label: SessionLabel::A,
                input_audio_format: "pcm16".to_string(),
                output_audio_format: "g711_ulaw".to_string(),
                modalities: vec!["text".to_string(), "audio".to_string()],
                vad_mode: VadMode::Client,
                input_transcription: None,
                tools: tools_a,
            },
            config.clone(),
        );

        // Session B: carrier audio in. LocalVAD drives commits when enabled,
        // otherwise the upstream's server VAD. Text-only modalities for the
        // modes that need captions only; input transcription is always on so
        // the original recipient utterance arrives as a stage-1 caption
        // independent of the translation.
        let b_modalities = if communication_mode.wants_b_audio()
            || communication_mode == CommunicationMode::VoiceToText
        {
            vec!["text".to_string(), "audio".to_string()]
        } else {
            vec!["text".to_string()]
        };
        let b_vad_mode = if config.local_vad.enabled {
            VadMode::Local
        } else {
            VadMode::Server
        };
        let session_b = RealtimeSession::new(
            SessionLabel::B,
            UpstreamSessionConfig {
                label: SessionLabel::B,
                input_audio_format: "g711_ulaw".to_string(),
                output_audio_format: "pcm16".to_string(),
                modalities: b_modalities,
                vad_mode: b_vad_mode,
                input_transcription: Some(InputTranscription {
                    model: config.upstream.input_transcription_model.clone(),
                    language: Some(target_language.to_string()),
                }),
                tools: None,
            },
            config,
        );

        Self {
            session_a: Arc::new(session_a),
            session_b: Arc::new(session_b),
        }
    }

    /// Connect both sessions concurrently; close both on any failure.
    pub async fn connect(&self, prompt_a: &str, prompt_b: &str) -> Result<(), SessionError> {
        let result = tokio::try_join!(
            self.session_a.connect(prompt_a, None),
            self.session_b.connect(prompt_b, None),
        );
        if let Err(e) = result {
            self.close().await;
            return Err(e);
        }
        info!("Both upstream sessions connected");
        Ok(())
    }

    /// Run both read loops concurrently until both close.
    pub async fn listen_all(&self) {
        tokio::join!(self.session_a.listen(), self.session_b.listen());
    }

    pub async fn close(&self) {
        tokio::join!(self.session_a.close(), self.session_b.close());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager(mode: CommunicationMode) -> DualSessionManager {
        DualSessionManager::new(Arc::new(Config::default()), mode, "ko", None)
    }

    #[test]
    fn test_session_directions_fixed() {
        let m = manager(CommunicationMode::VoiceToVoice);
        assert_eq!(m.session_a.session_config().input_audio_format, "pcm16");
        assert_eq!(m.session_a.session_config().output_audio_format, "g711_ulaw");
        assert_eq!(m.session_b.session_config().input_audio_format, "g711_ulaw");
        assert_eq!(m.session_b.session_config().output_audio_format, "pcm16");
    }

    #[test]
    fn test_b_modalities_per_mode() {
        let audio_modes = [CommunicationMode::VoiceToVoice, CommunicationMode::VoiceToText];
        for mode in audio_modes {
            let m = manager(mode);
            assert!(m
                .session_b
                .session_config()
                .modalities
                .contains(&"audio".to_string()));
        }
        let text_modes = [CommunicationMode::TextToVoice, CommunicationMode::FullAgent];
        for mode in text_modes {
            let m = manager(mode);
            assert_eq!(m.session_b.session_config().modalities, vec!["text"]);
        }
    }

    #[test]
    fn test_b_transcription_language_hint() {
        let m = manager(CommunicationMode::VoiceToVoice);
        let transcription = m
            .session_b
            .session_config()
            .input_transcription
            .as_ref()
            .unwrap();
        assert_eq!(transcription.language.as_deref(), Some("ko"));
    }

    #[test]
    fn test_b_vad_mode_follows_config() {
        let mut config = Config::default();
        config.local_vad.enabled = false;
        let m = DualSessionManager::new(
            Arc::new(config),
            CommunicationMode::VoiceToVoice,
            "ko",
            None,
        );
        assert_eq!(m.session_b.session_config().vad_mode, VadMode::Server);
    }
}
