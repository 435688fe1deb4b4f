//! Silero VAD inference using ONNX Runtime
//!
//! The Silero v5 model consumes 512-sample frames at 16 kHz and returns a
//! speech probability, carrying an internal RNN state between frames. The
//! `SpeechModel` trait is the seam between the state machine and the ONNX
//! runtime so the state machine is testable without a model file.
//!
//! The model (~2MB) is auto-downloaded on first use.

use anyhow::{Context, Result};
use ort::session::Session;
use std::path::{Path, PathBuf};
use tracing::info;

const SILERO_VAD_URL: &str =
    "https://github.com/snakers4/silero-vad/raw/master/src/silero_vad/data/silero_vad.onnx";

pub const SAMPLE_RATE: i64 = 16000;
/// 32 ms at 16 kHz.
pub const WINDOW_SIZE: usize = 512;

/// Frame-level speech probability model with internal state.
pub trait SpeechModel: Send {
    /// Process one 512-sample f32 frame (16 kHz, [-1, 1]) and return the
    /// speech probability in [0, 1].
    fn process(&mut self, frame: &[f32]) -> Result<f32>;

    /// Clear internal recurrent state.
    fn reset(&mut self);
}

/// Silero VAD wrapper using ONNX Runtime
pub struct SileroModel {
    session: Session,
    /// Hidden state tensor (2, 1, 128) - persists across calls
    state: Vec<f32>,
}

impl SileroModel {
    pub fn load(model_path: &Path) -> Result<Self> {
        let session = Session::builder()?
            .with_intra_threads(1)?
            .commit_from_file(model_path)
            .context("Failed to create ONNX session for Silero VAD")?;

        info!("Silero VAD loaded from {}", model_path.display());

        Ok(Self {
            session,
            state: vec![0.0f32; 2 * 1 * 128],
        })
    }
}

impl SpeechModel for SileroModel {
    fn process(&mut self, frame: &[f32]) -> Result<f32> {
        use ort::value::Value;

        let frame_len = frame.len();
        let input = Value::from_array(([1usize, frame_len], frame.to_vec()))?;
        let state = Value::from_array(([2usize, 1usize, 128usize], self.state.clone()))?;
        let sr = Value::from_array(([1usize], vec![SAMPLE_RATE]))?;

        let outputs = self.session.run(ort::inputs![input, state, sr])?;

        // Output 0 is the speech probability, output 1 the new state.
        let (_prob_shape, prob_data) = outputs[0].try_extract_tensor::<f32>()?;
        let prob = if prob_data.is_empty() {
            0.0
        } else {
            prob_data[0]
        };

        let (_state_shape, new_state_data) = outputs[1].try_extract_tensor::<f32>()?;
        if new_state_data.len() == self.state.len() {
            self.state.copy_from_slice(new_state_data);
        }

        Ok(prob)
    }

    fn reset(&mut self) {
        self.state.fill(0.0);
    }
}

/// Ensure the ONNX model file exists, downloading it if needed. Called once
/// at server startup, before any call is accepted.
pub async fn ensure_model(client: &reqwest::Client, model_path: &Path) -> Result<PathBuf> {
    if model_path.exists() {
        return Ok(model_path.to_path_buf());
    }

    if let Some(parent) = model_path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .context("Failed to create models directory")?;
    }

    info!("Downloading Silero VAD model to {}", model_path.display());

    let response = client
        .get(SILERO_VAD_URL)
        .send()
        .await
        .context("Failed to download Silero VAD model")?;

    if !response.status().is_success() {
        anyhow::bail!(
            "Failed to download Silero VAD model: HTTP {}",
            response.status()
        );
    }

    let bytes = response
        .bytes()
        .await
        .context("Failed to read Silero VAD model bytes")?;

    tokio::fs::write(model_path, &bytes)
        .await
        .context("Failed to save Silero VAD model")?;

    info!("Silero VAD model downloaded ({} bytes)", bytes.len());
    Ok(model_path.to_path_buf())
}
