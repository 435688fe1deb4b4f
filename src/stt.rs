//! Fallback batch STT client
//!
//! Used by the recovery layer: catch-up transcription of ring-buffer gaps
//! and degraded-mode batches. Audio arrives as raw G.711 mu-law, gets
//! decoded to PCM16 and wrapped in a WAV container, and goes to the batch
//! transcription endpoint. The verbose response carries per-segment quality
//! metrics that gate out hallucinated text — batch STT over phone audio
//! happily invents sentences from noise.

use anyhow::{Context, Result};
use serde::Deserialize;
use tracing::{info, warn};

use crate::audio::{pcm16_to_wav, ulaw_to_pcm16, CARRIER_SAMPLE_RATE};
use crate::config::Config;

#[derive(Debug, Deserialize)]
pub struct TranscriptionResponse {
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub segments: Vec<TranscriptionSegment>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct TranscriptionSegment {
    #[serde(default)]
    pub no_speech_prob: f64,
    #[serde(default = "default_compression_ratio")]
    pub compression_ratio: f64,
    #[serde(default)]
    pub avg_logprob: f64,
}

fn default_compression_ratio() -> f64 {
    1.0
}

const MAX_AVG_NO_SPEECH: f64 = 0.7;
const MAX_COMPRESSION_RATIO: f64 = 2.4;
const MIN_AVG_LOGPROB: f64 = -1.0;

/// Discard transcripts whose quality metrics look like hallucination.
/// Returns None when the text should not be surfaced.
pub fn filter_hallucination(
    text: &str,
    segments: &[TranscriptionSegment],
) -> Option<String> {
    let text = text.trim();
    if text.is_empty() {
        return None;
    }
    if segments.is_empty() {
        return Some(text.to_string());
    }

    let n = segments.len() as f64;
    let avg_no_speech: f64 = segments.iter().map(|s| s.no_speech_prob).sum::<f64>() / n;
    let avg_logprob: f64 = segments.iter().map(|s| s.avg_logprob).sum::<f64>() / n;
    let max_compression = segments
        .iter()
        .map(|s| s.compression_ratio)
        .fold(1.0f64, f64::max);

    if avg_no_speech > MAX_AVG_NO_SPEECH {
        warn!("STT hallucination filtered (no_speech={avg_no_speech:.2}): '{text}'");
        return None;
    }
    if max_compression > MAX_COMPRESSION_RATIO {
        warn!("STT hallucination filtered (compression={max_compression:.1}): '{text}'");
        return None;
    }
    if avg_logprob < MIN_AVG_LOGPROB {
        warn!("STT hallucination filtered (logprob={avg_logprob:.2}): '{text}'");
        return None;
    }
    Some(text.to_string())
}

/// HTTP client for the batch transcription endpoint.
pub struct FallbackStt {
    client: reqwest::Client,
    url: String,
    api_key: String,
    model: String,
}

impl FallbackStt {
    pub fn new(config: &Config) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: config.upstream.stt_url.clone(),
            api_key: config.upstream.api_key.clone(),
            model: config.upstream.stt_model.clone(),
        }
    }

    /// Transcribe raw mu-law audio. Returns None for empty input, empty
    /// results, and filtered hallucinations.
    pub async fn transcribe_ulaw(
        &self,
        ulaw_audio: &[u8],
        language: &str,
    ) -> Result<Option<String>> {
        if ulaw_audio.is_empty() {
            return Ok(None);
        }

        let wav = pcm16_to_wav(&ulaw_to_pcm16(ulaw_audio), CARRIER_SAMPLE_RATE);

        let part = reqwest::multipart::Part::bytes(wav)
            .file_name("audio.wav")
            .mime_str("audio/wav")
            .context("wav part")?;
        let form = reqwest::multipart::Form::new()
            .part("file", part)
            .text("model", self.model.clone())
            .text("language", language.to_string())
            .text("response_format", "verbose_json");

        let response = self
            .client
            .post(&self.url)
            .bearer_auth(&self.api_key)
            .multipart(form)
            .send()
            .await
            .context("batch STT request failed")?
            .error_for_status()
            .context("batch STT request rejected")?;

        let parsed: TranscriptionResponse =
            response.json().await.context("batch STT response body")?;

        if !parsed.segments.is_empty() {
            let n = parsed.segments.len() as f64;
            let avg_no_speech: f64 =
                parsed.segments.iter().map(|s| s.no_speech_prob).sum::<f64>() / n;
            info!(
                "STT metrics: no_speech={avg_no_speech:.2}, segments={}, text='{}'",
                parsed.segments.len(),
                parsed.text.chars().take(60).collect::<String>()
            );
        }

        Ok(filter_hallucination(&parsed.text, &parsed.segments))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn segment(no_speech: f64, compression: f64, logprob: f64) -> TranscriptionSegment {
        TranscriptionSegment {
            no_speech_prob: no_speech,
            compression_ratio: compression,
            avg_logprob: logprob,
        }
    }

    #[test]
    fn test_clean_transcript_passes() {
        let segments = vec![segment(0.1, 1.2, -0.3)];
        assert_eq!(
            filter_hallucination("hello there", &segments),
            Some("hello there".to_string())
        );
    }

    #[test]
    fn test_empty_text_filtered() {
        assert_eq!(filter_hallucination("  ", &[]), None);
    }

    #[test]
    fn test_no_segments_passes() {
        assert_eq!(
            filter_hallucination("text", &[]),
            Some("text".to_string())
        );
    }

    #[test]
    fn test_high_no_speech_filtered() {
        let segments = vec![segment(0.9, 1.0, -0.2)];
        assert_eq!(filter_hallucination("thanks for watching", &segments), None);
    }

    #[test]
    fn test_high_compression_filtered() {
        let segments = vec![segment(0.1, 3.0, -0.2)];
        assert_eq!(filter_hallucination("la la la la la", &segments), None);
    }

    #[test]
    fn test_low_logprob_filtered() {
        let segments = vec![segment(0.1, 1.0, -1.5)];
        assert_eq!(filter_hallucination("mumble", &segments), None);
    }

    #[test]
    fn test_averaging_across_segments() {
        // One bad segment averaged with good ones stays under threshold.
        let segments = vec![
            segment(0.9, 1.0, -0.2),
            segment(0.1, 1.0, -0.2),
            segment(0.1, 1.0, -0.2),
        ];
        assert!(filter_hallucination("ok", &segments).is_some());
    }
}
