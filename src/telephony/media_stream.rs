//! Carrier media stream framing
//!
//! One WebSocket per call carries the recipient's audio inbound and the
//! relay's TTS outbound, as JSON envelopes around base64 G.711 mu-law
//! 20 ms frames. Outgoing frames funnel through an mpsc channel so the
//! socket's sink stays owned by a single sender task.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use serde_json::json;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::types::MediaStreamEvent;

/// What one parsed inbound frame means for the pipeline.
#[derive(Debug, Clone, PartialEq)]
pub enum MediaInbound {
    /// One 20 ms mu-law frame from the recipient.
    Audio(Vec<u8>),
    /// Stream attached; carries the stream sid.
    Started(String),
    /// Carrier closed the stream.
    Stopped,
    /// connected / keepalive / unparseable; nothing to do.
    Ignored,
}

pub struct TelephonyMediaHandler {
    outbound: mpsc::Sender<String>,
    stream_sid: Mutex<String>,
    closed: AtomicBool,
}

impl TelephonyMediaHandler {
    pub fn new(outbound: mpsc::Sender<String>) -> Arc<Self> {
        Arc::new(Self {
            outbound,
            stream_sid: Mutex::new(String::new()),
            closed: AtomicBool::new(false),
        })
    }

    pub fn stream_sid(&self) -> String {
        self.stream_sid.lock().unwrap().clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Parse one raw text frame from the carrier.
    pub fn handle_message(&self, raw: &str) -> MediaInbound {
        let event: MediaStreamEvent = match serde_json::from_str(raw) {
            Ok(event) => event,
            Err(_) => {
                warn!(
                    "Failed to parse media stream event: {}",
                    raw.chars().take(200).collect::<String>()
                );
                return MediaInbound::Ignored;
            }
        };

        match event.event.as_str() {
            "connected" => {
                info!("Telephony media stream connected");
                MediaInbound::Ignored
            }
            "start" => {
                let sid = event.stream_sid.unwrap_or_default();
                *self.stream_sid.lock().unwrap() = sid.clone();
                info!("Telephony media stream started: stream_sid={sid}");
                MediaInbound::Started(sid)
            }
            "media" => match event.media.and_then(|m| BASE64.decode(m.payload).ok()) {
                Some(audio) => MediaInbound::Audio(audio),
                None => MediaInbound::Ignored,
            },
            "stop" => {
                info!("Telephony media stream stopped");
                self.closed.store(true, Ordering::SeqCst);
                MediaInbound::Stopped
            }
            _ => MediaInbound::Ignored,
        }
    }

    /// Play TTS audio to the recipient.
    pub async fn send_audio(&self, audio: &[u8]) {
        if self.is_closed() {
            return;
        }
        let msg = json!({
            "event": "media",
            "streamSid": self.stream_sid(),
            "media": {"payload": BASE64.encode(audio)},
        });
        if self.outbound.send(msg.to_string()).await.is_err() {
            warn!("Failed to send audio to the carrier");
            self.closed.store(true, Ordering::SeqCst);
        }
    }

    /// Flush the carrier's playback queue (interrupt handling).
    pub async fn send_clear(&self) {
        if self.is_closed() {
            return;
        }
        let msg = json!({"event": "clear", "streamSid": self.stream_sid()});
        let _ = self.outbound.send(msg.to_string()).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handler() -> (Arc<TelephonyMediaHandler>, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(16);
        (TelephonyMediaHandler::new(tx), rx)
    }

    #[test]
    fn test_start_event_captures_sid() {
        let (h, _rx) = handler();
        let inbound = h.handle_message(r#"{"event":"start","streamSid":"MZ42"}"#);
        assert_eq!(inbound, MediaInbound::Started("MZ42".to_string()));
        assert_eq!(h.stream_sid(), "MZ42");
    }

    #[test]
    fn test_media_event_decodes_audio() {
        let (h, _rx) = handler();
        let payload = BASE64.encode([0xFFu8; 160]);
        let raw = format!(r#"{{"event":"media","streamSid":"MZ42","media":{{"payload":"{payload}"}}}}"#);
        match h.handle_message(&raw) {
            MediaInbound::Audio(audio) => assert_eq!(audio, vec![0xFF; 160]),
            other => panic!("expected audio, got {other:?}"),
        }
    }

    #[test]
    fn test_stop_event_closes() {
        let (h, _rx) = handler();
        assert_eq!(h.handle_message(r#"{"event":"stop"}"#), MediaInbound::Stopped);
        assert!(h.is_closed());
    }

    #[test]
    fn test_garbage_is_ignored() {
        let (h, _rx) = handler();
        assert_eq!(h.handle_message("not json"), MediaInbound::Ignored);
    }

    #[tokio::test]
    async fn test_send_audio_frames_outbound() {
        let (h, mut rx) = handler();
        h.handle_message(r#"{"event":"start","streamSid":"MZ42"}"#);
        h.send_audio(&[0xFF; 160]).await;
        let frame = rx.recv().await.unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(parsed["event"], "media");
        assert_eq!(parsed["streamSid"], "MZ42");
        assert_eq!(parsed["media"]["payload"], BASE64.encode([0xFFu8; 160]));
    }

    #[tokio::test]
    async fn test_send_clear_frame() {
        let (h, mut rx) = handler();
        h.handle_message(r#"{"event":"start","streamSid":"MZ42"}"#);
        h.send_clear().await;
        let frame = rx.recv().await.unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(parsed["event"], "clear");
    }

    #[tokio::test]
    async fn test_no_sends_after_stop() {
        let (h, mut rx) = handler();
        h.handle_message(r#"{"event":"stop"}"#);
        h.send_audio(&[0xFF; 160]).await;
        assert!(rx.try_recv().is_err());
    }
}
