//! TTS echo suppression
//!
//! TTS played into the phone line echoes back through the carrier's
//! microphone 100-400 ms later, attenuated 20-30 dB. While the gate is
//! active, inbound frames below the breakthrough threshold are replaced with
//! mu-law silence of the same length — silence injection rather than
//! dropping keeps the upstream VAD's timing intact. A frame loud enough to
//! overcome the attenuation is genuine recipient speech and closes the
//! window immediately.
//!
//! The window outlives the last TTS chunk by a dynamic cooldown:
//! remaining playback plus a round-trip margin, clipped to a ceiling so a
//! long TTS cannot block the recipient indefinitely.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::audio::{ulaw_rms, ULAW_SILENCE_BYTE};

/// Carrier audio rate: g711_ulaw @ 8 kHz = 8000 bytes/second.
const ULAW_BYTES_PER_SECOND: f64 = 8000.0;

/// What to do with one inbound carrier frame.
#[derive(Debug, Clone, PartialEq)]
pub enum GateDecision {
    /// Window closed; forward as-is.
    Pass,
    /// Loud frame during the window: recipient speech broke through. The
    /// window is already closed; forward the original frame.
    Breakthrough,
    /// Echo window: forward this silence frame instead.
    Silence(Vec<u8>),
}

struct GateState {
    in_echo_window: bool,
    tts_first_chunk_at: Option<Instant>,
    tts_total_bytes: u64,
}

pub struct EchoGate {
    state: Mutex<GateState>,
    cooldown_task: Mutex<Option<JoinHandle<()>>>,
    breakthrough_rms: f32,
    round_trip_margin_s: f64,
    max_window_s: f64,
}

impl EchoGate {
    pub fn new(breakthrough_rms: f32, round_trip_margin_s: f64, max_window_s: f64) -> Self {
        Self {
            state: Mutex::new(GateState {
                in_echo_window: false,
                tts_first_chunk_at: None,
                tts_total_bytes: 0,
            }),
            cooldown_task: Mutex::new(None),
            breakthrough_rms,
            round_trip_margin_s,
            max_window_s,
        }
    }

    pub fn is_active(&self) -> bool {
        self.state.lock().unwrap().in_echo_window
    }

    /// Called on each outbound TTS chunk. Returns true when this call opened
    /// the window (the caller counts one suppression activation).
    pub fn activate(&self, chunk_len: usize) -> bool {
        self.cancel_cooldown();
        let mut state = self.state.lock().unwrap();
        let opened = !state.in_echo_window;
        state.in_echo_window = true;
        if state.tts_first_chunk_at.is_none() {
            state.tts_first_chunk_at = Some(Instant::now());
            state.tts_total_bytes = 0;
        }
        state.tts_total_bytes += chunk_len as u64;
        if opened {
            info!("Echo window activated — silence injection for inbound audio");
        }
        opened
    }

    /// Called on response completion: keep the window up for the remaining
    /// playback plus the echo round-trip margin, then close it.
    pub fn start_cooldown(self: &std::sync::Arc<Self>) {
        self.cancel_cooldown();

        let (first_chunk_at, total_bytes) = {
            let mut state = self.state.lock().unwrap();
            let snapshot = (state.tts_first_chunk_at.take(), state.tts_total_bytes);
            state.tts_total_bytes = 0;
            snapshot
        };

        let cooldown = self.dynamic_cooldown(first_chunk_at, total_bytes);
        let gate = self.clone();
        let task = tokio::spawn(async move {
            tokio::time::sleep(cooldown).await;
            gate.state.lock().unwrap().in_echo_window = false;
            info!(
                "Echo window closed after {:.1}s cooldown",
                cooldown.as_secs_f64()
            );
        });
        *self.cooldown_task.lock().unwrap() = Some(task);
    }

    /// remaining_playback + margin, clipped to the ceiling.
    fn dynamic_cooldown(&self, first_chunk_at: Option<Instant>, total_bytes: u64) -> Duration {
        let audio_duration_s = total_bytes as f64 / ULAW_BYTES_PER_SECOND;
        let elapsed = first_chunk_at
            .map(|t| t.elapsed().as_secs_f64())
            .unwrap_or(0.0);
        let remaining_playback = (audio_duration_s - elapsed).max(0.0);
        let cooldown = (remaining_playback + self.round_trip_margin_s).min(self.max_window_s);
        debug!(
            "Echo cooldown {:.1}s (audio={:.1}s, remaining={:.1}s)",
            cooldown, audio_duration_s, remaining_playback
        );
        Duration::from_secs_f64(cooldown)
    }

    /// Close the window immediately (recipient speech or breakthrough).
    pub fn deactivate(&self) {
        self.cancel_cooldown();
        let mut state = self.state.lock().unwrap();
        state.in_echo_window = false;
        state.tts_first_chunk_at = None;
        state.tts_total_bytes = 0;
    }

    /// Classify one inbound mu-law frame against the gate.
    pub fn process_inbound(&self, frame: &[u8]) -> GateDecision {
        if !self.is_active() {
            return GateDecision::Pass;
        }
        let rms = ulaw_rms(frame);
        if rms > self.breakthrough_rms {
            info!("High energy (RMS={rms:.0}) during echo window — breaking echo gate");
            self.deactivate();
            return GateDecision::Breakthrough;
        }
        GateDecision::Silence(vec![ULAW_SILENCE_BYTE; frame.len()])
    }

    fn cancel_cooldown(&self) {
        if let Some(task) = self.cooldown_task.lock().unwrap().take() {
            task.abort();
        }
    }
}

impl Drop for EchoGate {
    fn drop(&mut self) {
        if let Some(task) = self.cooldown_task.lock().unwrap().take() {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn gate() -> Arc<EchoGate> {
        Arc::new(EchoGate::new(400.0, 0.5, 2.0))
    }

    #[test]
    fn test_inactive_gate_passes() {
        let g = gate();
        assert_eq!(g.process_inbound(&[0u8; 160]), GateDecision::Pass);
    }

    #[test]
    fn test_activation_counts_once_per_window() {
        let g = gate();
        assert!(g.activate(160));
        assert!(!g.activate(160));
        assert!(!g.activate(160));
        assert!(g.is_active());
    }

    #[test]
    fn test_quiet_frame_replaced_with_silence() {
        let g = gate();
        g.activate(160);
        // 0xFF frames decode to zero RMS, well under the threshold.
        match g.process_inbound(&[ULAW_SILENCE_BYTE; 160]) {
            GateDecision::Silence(frame) => {
                assert_eq!(frame.len(), 160);
                assert!(frame.iter().all(|&b| b == ULAW_SILENCE_BYTE));
            }
            other => panic!("expected silence injection, got {other:?}"),
        }
        assert!(g.is_active());
    }

    #[test]
    fn test_loud_frame_breaks_through() {
        let g = gate();
        g.activate(160);
        // Byte 0x00 is the loudest mu-law code (RMS ~8000).
        assert_eq!(g.process_inbound(&[0u8; 160]), GateDecision::Breakthrough);
        assert!(!g.is_active());
        // Subsequent frames pass untouched.
        assert_eq!(g.process_inbound(&[ULAW_SILENCE_BYTE; 160]), GateDecision::Pass);
    }

    #[test]
    fn test_deactivate_resets_counters() {
        let g = gate();
        g.activate(4000);
        g.deactivate();
        assert!(!g.is_active());
        let state = g.state.lock().unwrap();
        assert_eq!(state.tts_total_bytes, 0);
        assert!(state.tts_first_chunk_at.is_none());
    }

    #[tokio::test]
    async fn test_cooldown_closes_window() {
        // Tiny TTS: cooldown = remaining (~0) + a short margin.
        let g = Arc::new(EchoGate::new(400.0, 0.05, 2.0));
        g.activate(160);
        g.start_cooldown();
        assert!(g.is_active());
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(!g.is_active());
        drop(g);
    }

    #[tokio::test]
    async fn test_reactivation_cancels_cooldown() {
        let g = Arc::new(EchoGate::new(400.0, 0.05, 2.0));
        g.activate(160);
        g.start_cooldown();
        // New TTS before the cooldown fires keeps the window open.
        g.activate(160);
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(g.is_active());
    }

    #[test]
    fn test_cooldown_ceiling() {
        let g = EchoGate::new(400.0, 0.5, 2.0);
        // 10 s of audio, none played yet -> clipped to 2 s.
        let cooldown = g.dynamic_cooldown(Some(Instant::now()), 80_000);
        assert!(cooldown <= Duration::from_secs_f64(2.0));
    }
}
