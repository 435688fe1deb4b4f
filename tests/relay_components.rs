//! Component-level scenarios for the relay core: echo gating, context
//! window bounds, VAD hysteresis, and the recovery event grammar.

use std::sync::Arc;
use std::time::Duration;

use lingua_relay::audio::{ulaw_rms, ULAW_SILENCE_BYTE};
use lingua_relay::config::LocalVadConfig;
use lingua_relay::realtime::context::ContextManager;
use lingua_relay::realtime::echo_gate::{EchoGate, GateDecision};
use lingua_relay::types::RecoveryEventType;
use lingua_relay::vad::silero::{SpeechModel, WINDOW_SIZE};
use lingua_relay::vad::{LocalVad, VadState};

// --- Echo gate scenarios ---

/// A TTS response goes out, the carrier echoes it back quietly: every echoed
/// frame is replaced with silence, and the cooldown closes the window.
#[tokio::test]
async fn echo_window_suppresses_quiet_frames_until_cooldown() {
    let gate = Arc::new(EchoGate::new(400.0, 0.05, 2.0));

    // Stream a short TTS response.
    let mut activations = 0;
    for _ in 0..5 {
        if gate.activate(160) {
            activations += 1;
        }
    }
    assert_eq!(activations, 1);

    // The echo comes back attenuated (silence-level here); every frame is
    // all 0xFF.
    for _ in 0..10 {
        match gate.process_inbound(&[ULAW_SILENCE_BYTE; 160]) {
            GateDecision::Silence(frame) => {
                assert!(frame.iter().all(|&b| b == ULAW_SILENCE_BYTE));
                assert_eq!(ulaw_rms(&frame), 0.0);
            }
            other => panic!("expected silence injection, got {other:?}"),
        }
    }

    gate.start_cooldown();
    tokio::time::sleep(Duration::from_millis(250)).await;
    assert!(!gate.is_active());
    assert_eq!(gate.process_inbound(&[ULAW_SILENCE_BYTE; 160]), GateDecision::Pass);
}

/// The recipient starts talking over the TTS: the loud frame breaks through
/// untouched and the window closes immediately.
#[tokio::test]
async fn echo_breakthrough_passes_loud_frame() {
    let gate = Arc::new(EchoGate::new(400.0, 0.5, 2.0));
    gate.activate(1600);

    // Byte 0x00 decodes to the loudest mu-law sample; RMS far above 400.
    let loud = [0u8; 160];
    assert!(ulaw_rms(&loud) > 400.0);
    assert_eq!(gate.process_inbound(&loud), GateDecision::Breakthrough);
    assert!(!gate.is_active());
}

/// Activate -> cooldown -> re-activate leaves a consistent window with no
/// stale cooldown firing underneath.
#[tokio::test]
async fn reactivation_after_cooldown_is_consistent() {
    let gate = Arc::new(EchoGate::new(400.0, 0.05, 2.0));
    gate.activate(160);
    gate.start_cooldown();
    gate.activate(160);
    tokio::time::sleep(Duration::from_millis(250)).await;
    // The second activation cancelled the pending close.
    assert!(gate.is_active());
    gate.deactivate();
    assert!(!gate.is_active());
}

// --- Context window ---

#[test]
fn context_window_keeps_last_turns_truncated() {
    let mut ctx = ContextManager::new(6, 100);
    let long_text = "x".repeat(300);
    for i in 0..10 {
        ctx.add_turn(if i % 2 == 0 { "user" } else { "recipient" }, &format!("{i} {long_text}"));
    }
    assert_eq!(ctx.turn_count(), 6);
    let formatted = ctx.format_context();
    // Oldest four evicted, newest six present, each capped at 100 chars.
    assert!(!formatted.contains("3 x"));
    assert!(formatted.contains("4 x"));
    assert!(formatted.contains("9 x"));
    for line in formatted.lines() {
        let text = line.split_once(": ").unwrap().1;
        assert!(text.chars().count() <= 100);
    }
}

// --- Local VAD hysteresis ---

struct ConstModel(f32);

impl SpeechModel for ConstModel {
    fn process(&mut self, frame: &[f32]) -> anyhow::Result<f32> {
        assert_eq!(frame.len(), WINDOW_SIZE);
        Ok(self.0)
    }
    fn reset(&mut self) {}
}

#[tokio::test]
async fn vad_state_is_always_binary_and_transitions_need_min_frames() {
    let config = LocalVadConfig {
        min_speech_frames: 2,
        min_silence_frames: 3,
        ..LocalVadConfig::default()
    };
    let mut vad = LocalVad::new(&config, Box::new(ConstModel(0.9)), None, None);

    let loud = vec![0u8; 160];
    let quiet = vec![ULAW_SILENCE_BYTE; 160];

    // One input frame produces at most one model frame; two model frames
    // are required before SPEAKING.
    vad.process(&loud).await;
    assert_eq!(vad.state(), VadState::Silence);
    for _ in 0..3 {
        vad.process(&loud).await;
    }
    assert_eq!(vad.state(), VadState::Speaking);

    // Two silence frames are not enough; the third flips the state.
    vad.process(&quiet).await;
    vad.process(&quiet).await;
    assert_eq!(vad.state(), VadState::Speaking);
    vad.process(&quiet).await;
    assert_eq!(vad.state(), VadState::Silence);
}

#[tokio::test]
async fn vad_reset_returns_to_silence() {
    let config = LocalVadConfig::default();
    let mut vad = LocalVad::new(&config, Box::new(ConstModel(0.95)), None, None);
    for _ in 0..6 {
        vad.process(&vec![0u8; 160]).await;
    }
    assert!(vad.is_speaking());
    vad.reset();
    assert_eq!(vad.state(), VadState::Silence);
}

// --- Recovery event grammar ---

/// One failure-and-recovery cycle must spell a valid word of the recovery
/// state machine.
fn is_valid_cycle(events: &[RecoveryEventType]) -> bool {
    use RecoveryEventType::*;
    let mut i = 0;
    if events.get(i) != Some(&SessionDisconnected) {
        return false;
    }
    i += 1;
    loop {
        match events.get(i) {
            Some(ReconnectAttempt) => {
                i += 1;
                match events.get(i) {
                    Some(ReconnectFailed) => {
                        i += 1;
                        if events.get(i) == Some(&DegradedModeEntered) {
                            return i + 1 == events.len();
                        }
                    }
                    Some(ReconnectSuccess) => {
                        i += 1;
                        // Catch-up is optional (zero gap skips it).
                        if events.get(i) == Some(&CatchupStarted) {
                            i += 1;
                            if events.get(i) != Some(&CatchupCompleted) {
                                return false;
                            }
                            i += 1;
                        }
                        return events.get(i) == Some(&NormalRestored) && i + 1 == events.len();
                    }
                    _ => return false,
                }
            }
            Some(DegradedModeEntered) => return i + 1 == events.len(),
            _ => return false,
        }
    }
}

#[test]
fn recovery_grammar_accepts_expected_cycles() {
    use RecoveryEventType::*;
    assert!(is_valid_cycle(&[
        SessionDisconnected,
        ReconnectAttempt,
        ReconnectSuccess,
        CatchupStarted,
        CatchupCompleted,
        NormalRestored,
    ]));
    assert!(is_valid_cycle(&[
        SessionDisconnected,
        ReconnectAttempt,
        ReconnectFailed,
        ReconnectAttempt,
        ReconnectSuccess,
        NormalRestored,
    ]));
    assert!(is_valid_cycle(&[
        SessionDisconnected,
        ReconnectAttempt,
        ReconnectFailed,
        DegradedModeEntered,
    ]));
    assert!(is_valid_cycle(&[SessionDisconnected, DegradedModeEntered]));
}

#[test]
fn recovery_grammar_rejects_malformed_cycles() {
    use RecoveryEventType::*;
    // Success without an attempt.
    assert!(!is_valid_cycle(&[SessionDisconnected, ReconnectSuccess]));
    // Catch-up must complete before normal restore.
    assert!(!is_valid_cycle(&[
        SessionDisconnected,
        ReconnectAttempt,
        ReconnectSuccess,
        CatchupStarted,
        NormalRestored,
    ]));
    // A cycle cannot begin mid-air.
    assert!(!is_valid_cycle(&[ReconnectAttempt, ReconnectSuccess, NormalRestored]));
}
