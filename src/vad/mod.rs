//! Local VAD — two-stage speech detection on 20 ms mu-law frames
//!
//! Server-side VAD fails to emit speech_stopped in noisy phone environments:
//! background noise pins it in "speaking" until a timeout fires and the
//! half-captured audio gets transcribed as hallucinated text. The local
//! detector replaces it with two stages:
//!
//!   Stage 1: RMS energy gate — below threshold counts as silence and skips
//!            the neural model entirely.
//!   Stage 2: Silero probability -> hysteresis state machine
//!            (SILENCE -> SPEAKING after min_speech_frames consecutive hits,
//!             SPEAKING -> SILENCE after min_silence_frames).
//!
//! Frame adapter: 20 ms (160 samples @ 8 kHz) is zero-order-hold upsampled
//! to 16 kHz and buffered until 512 samples (32 ms) are available for the
//! model.
//!
//! When the RMS gate has skipped the model for >= 5 consecutive frames
//! (~100 ms) the recurrent state is stale; it is reset on the next active
//! frame. Shorter intra-syllable dips do not reset.

pub mod silero;

use futures::future::BoxFuture;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::audio::{ulaw_rms, ulaw_to_f32};
use crate::config::LocalVadConfig;
use silero::{SpeechModel, WINDOW_SIZE};

/// Fired on state transitions. Callback errors must not halt frame
/// processing, so the callback itself is infallible and logs internally.
pub type VadCallback = Arc<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;

const MIN_RMS_SILENCE_FOR_RESET: u32 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VadState {
    Silence,
    Speaking,
}

/// Two-stage local voice activity detector.
pub struct LocalVad {
    rms_threshold: f32,
    speech_threshold: f32,
    silence_threshold: f32,
    min_speech_frames: u32,
    min_silence_frames: u32,

    state: VadState,
    speech_count: u32,
    silence_count: u32,

    frame_buffer: Vec<f32>,
    rms_silence_frames: u32,

    model: Box<dyn SpeechModel>,
    on_speech_start: Option<VadCallback>,
    on_speech_end: Option<VadCallback>,
}

impl LocalVad {
    pub fn new(
        config: &LocalVadConfig,
        model: Box<dyn SpeechModel>,
        on_speech_start: Option<VadCallback>,
        on_speech_end: Option<VadCallback>,
    ) -> Self {
        Self {
            rms_threshold: config.rms_threshold,
            speech_threshold: config.speech_threshold,
            silence_threshold: config.silence_threshold,
            min_speech_frames: config.min_speech_frames,
            min_silence_frames: config.min_silence_frames,
            state: VadState::Silence,
            speech_count: 0,
            silence_count: 0,
            frame_buffer: Vec::new(),
            rms_silence_frames: 0,
            model,
            on_speech_start,
            on_speech_end,
        }
    }

    pub fn is_speaking(&self) -> bool {
        self.state == VadState::Speaking
    }

    pub fn state(&self) -> VadState {
        self.state
    }

    /// Process one 20 ms mu-law frame (160 bytes @ 8 kHz).
    pub async fn process(&mut self, audio: &[u8]) {
        // Stage 1: RMS energy gate.
        let rms = ulaw_rms(audio);
        if rms < self.rms_threshold {
            self.rms_silence_frames += 1;
            self.speech_count = 0;
            self.silence_count += 1;
            if self.state == VadState::Speaking && self.silence_count >= self.min_silence_frames {
                self.transition_to_silence().await;
            }
            return;
        }

        // Back from RMS silence: reset the model only after a long enough
        // gap, so intra-syllable dips keep the recurrent context.
        if self.rms_silence_frames >= MIN_RMS_SILENCE_FOR_RESET {
            self.frame_buffer.clear();
            self.model.reset();
            debug!(
                "[LocalVAD] model reset after {} RMS silence frames",
                self.rms_silence_frames
            );
        }
        self.rms_silence_frames = 0;

        // 8 kHz -> 16 kHz zero-order-hold upsample.
        let samples = ulaw_to_f32(audio);
        self.frame_buffer.reserve(samples.len() * 2);
        for s in samples {
            self.frame_buffer.push(s);
            self.frame_buffer.push(s);
        }

        // Stage 2: feed complete 512-sample windows to the model.
        while self.frame_buffer.len() >= WINDOW_SIZE {
            let frame: Vec<f32> = self.frame_buffer.drain(..WINDOW_SIZE).collect();
            let prob = match self.model.process(&frame) {
                Ok(p) => p,
                Err(e) => {
                    warn!("[LocalVAD] inference error: {e}");
                    continue;
                }
            };
            debug!(
                "[LocalVAD] prob={prob:.3} rms={rms:.0} state={:?}",
                self.state
            );
            self.update_state(prob).await;
        }
    }

    async fn update_state(&mut self, prob: f32) {
        match self.state {
            VadState::Silence => {
                if prob >= self.speech_threshold {
                    self.speech_count += 1;
                    self.silence_count = 0;
                    if self.speech_count >= self.min_speech_frames {
                        self.transition_to_speaking().await;
                    }
                } else {
                    self.speech_count = 0;
                }
            }
            VadState::Speaking => {
                if prob < self.silence_threshold {
                    self.silence_count += 1;
                    self.speech_count = 0;
                    if self.silence_count >= self.min_silence_frames {
                        self.transition_to_silence().await;
                    }
                } else {
                    self.silence_count = 0;
                }
            }
        }
    }

    async fn transition_to_speaking(&mut self) {
        self.state = VadState::Speaking;
        self.speech_count = 0;
        self.silence_count = 0;
        info!("[LocalVAD] Speech started");
        if let Some(cb) = &self.on_speech_start {
            cb().await;
        }
    }

    async fn transition_to_silence(&mut self) {
        self.state = VadState::Silence;
        self.speech_count = 0;
        self.silence_count = 0;
        info!("[LocalVAD] Speech ended");
        if let Some(cb) = &self.on_speech_end {
            cb().await;
        }
    }

    /// Reset detector and model state (call teardown).
    pub fn reset(&mut self) {
        self.state = VadState::Silence;
        self.speech_count = 0;
        self.silence_count = 0;
        self.frame_buffer.clear();
        self.rms_silence_frames = 0;
        self.model.reset();
        debug!("[LocalVAD] reset");
    }
}
