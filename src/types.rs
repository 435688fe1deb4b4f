//! Shared types used across modules
//!
//! This module contains the per-call data model (Call, transcript, metrics),
//! the client and telephony WebSocket message schemata, and the enums shared
//! by the realtime layer, so that modules do not depend on each other for
//! plain data.

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// Relay places the user's words; Agent speaks autonomously.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CallMode {
    Relay,
    Agent,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CallStatus {
    Pending,
    Dialing,
    Connected,
    Ended,
    Failed,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CommunicationMode {
    VoiceToVoice,
    VoiceToText,
    TextToVoice,
    FullAgent,
}

impl CommunicationMode {
    /// Modes whose Session B emits synthesized audio back to the client.
    pub fn wants_b_audio(self) -> bool {
        matches!(self, CommunicationMode::VoiceToVoice)
    }

    /// Modes driven by typed text rather than user audio.
    pub fn is_text_input(self) -> bool {
        matches!(
            self,
            CommunicationMode::TextToVoice | CommunicationMode::FullAgent
        )
    }
}

/// Who decides end-of-utterance for a session's input audio.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum VadMode {
    /// The client app signals `vad_state: committed`; turn_detection is null.
    Client,
    /// The upstream service runs server VAD and auto-commits.
    Server,
    /// The relay's own LocalVAD drives commits; turn_detection is null.
    Local,
}

/// Upstream session liveness as seen by the recovery layer.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Connected,
    Disconnected,
    Reconnecting,
    Degraded,
}

/// The two upstream realtime sessions of a call.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum SessionLabel {
    A,
    B,
}

impl std::fmt::Display for SessionLabel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionLabel::A => write!(f, "SessionA"),
            SessionLabel::B => write!(f, "SessionB"),
        }
    }
}

// --- Recovery events ---

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryEventType {
    SessionDisconnected,
    ReconnectAttempt,
    ReconnectSuccess,
    ReconnectFailed,
    CatchupStarted,
    CatchupCompleted,
    DegradedModeEntered,
    DegradedModeExited,
    NormalRestored,
}

/// Append-only log entry on the Call for one recovery state change.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoveryEvent {
    #[serde(rename = "type")]
    pub event_type: RecoveryEventType,
    pub session_label: String,
    pub gap_ms: u64,
    pub attempt: u32,
    pub detail: String,
    pub timestamp: DateTime<Utc>,
}

// --- Transcript & cost ---

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscriptEntry {
    /// "user" | "recipient"
    pub role: String,
    pub original_text: String,
    pub translated_text: String,
    pub language: String,
    pub timestamp: DateTime<Utc>,
}

/// Plain role/text history used for recovery prompts and the agent loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub role: String,
    pub text: String,
}

/// Accumulated upstream token usage for one call.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TokenUsage {
    pub audio_input: u64,
    pub audio_output: u64,
    pub text_input: u64,
    pub text_output: u64,
}

impl TokenUsage {
    pub fn add(&mut self, other: &TokenUsage) {
        self.audio_input += other.audio_input;
        self.audio_output += other.audio_output;
        self.text_input += other.text_input;
        self.text_output += other.text_output;
    }

    pub fn total(&self) -> u64 {
        self.audio_input + self.audio_output + self.text_input + self.text_output
    }
}

/// Per-call latency samples and counters, snapshotted to the client and
/// persisted with the call row.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CallMetrics {
    /// Session A turn latency: user input commit -> first TTS chunk.
    pub session_a_latencies_ms: Vec<f64>,
    /// Session B end-to-end: recipient speech start -> translated text done.
    pub session_b_e2e_latencies_ms: Vec<f64>,
    /// Session B stage-1: recipient speech start -> original STT caption.
    pub session_b_stt_latencies_ms: Vec<f64>,
    /// Pipeline start -> first TTS chunk reaching the carrier. Set once.
    pub first_message_latency_ms: f64,
    pub turn_count: u32,
    pub echo_suppressions: u32,
    pub echo_gate_breakthroughs: u32,
    pub guardrail_triggers: u32,
    pub vad_false_triggers: u32,
}

// --- Active call state ---

/// The per-call aggregate. Created by the control plane, mutated by exactly
/// one Pipeline, destroyed when cleanup completes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Call {
    pub call_id: String,
    /// Carrier-side call id, set once the outbound dial is accepted.
    pub carrier_call_id: String,
    pub mode: CallMode,
    pub source_language: String,
    pub target_language: String,
    pub status: CallStatus,
    pub communication_mode: CommunicationMode,
    pub stream_sid: String,
    pub session_a_id: String,
    pub session_b_id: String,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub first_message_sent: bool,
    /// System prompts both sessions were configured with; recovery rebuilds
    /// its reconnect prompt from these.
    pub prompt_a: String,
    pub prompt_b: String,
    pub session_a_state: SessionState,
    pub session_b_state: SessionState,
    pub transcript: Vec<TranscriptEntry>,
    pub transcript_history: Vec<HistoryEntry>,
    pub recovery_events: Vec<RecoveryEvent>,
    pub guardrail_events: Vec<Value>,
    pub tokens: TokenUsage,
    pub metrics: CallMetrics,
    /// Agent mode: data folded in by tool calls.
    pub collected_data: HashMap<String, Value>,
    pub call_result: String,
    pub call_result_data: HashMap<String, Value>,
}

impl Call {
    pub fn new(req: &CallStartRequest) -> Self {
        Self {
            call_id: req.call_id.clone(),
            carrier_call_id: String::new(),
            mode: req.mode,
            source_language: req.source_language.clone(),
            target_language: req.target_language.clone(),
            status: CallStatus::Pending,
            communication_mode: req.communication_mode,
            stream_sid: String::new(),
            session_a_id: String::new(),
            session_b_id: String::new(),
            created_at: Utc::now(),
            started_at: None,
            ended_at: None,
            first_message_sent: false,
            prompt_a: String::new(),
            prompt_b: String::new(),
            session_a_state: SessionState::Connected,
            session_b_state: SessionState::Connected,
            transcript: Vec::new(),
            transcript_history: Vec::new(),
            recovery_events: Vec::new(),
            guardrail_events: Vec::new(),
            tokens: TokenUsage::default(),
            metrics: CallMetrics::default(),
            collected_data: req.collected_data.clone().unwrap_or_default(),
            call_result: String::new(),
            call_result_data: HashMap::new(),
        }
    }

    pub fn duration_s(&self) -> f64 {
        match (self.started_at, self.ended_at) {
            (Some(start), Some(end)) => (end - start).num_milliseconds() as f64 / 1000.0,
            (Some(start), None) => (Utc::now() - start).num_milliseconds() as f64 / 1000.0,
            _ => 0.0,
        }
    }
}

// --- Control-plane request/response ---

static PHONE_NUMBER_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\+[1-9]\d{1,14}$").expect("phone number regex"));

#[derive(Debug, Clone, Deserialize)]
pub struct CallStartRequest {
    pub call_id: String,
    pub phone_number: String,
    #[serde(default = "default_call_mode")]
    pub mode: CallMode,
    #[serde(default = "default_source_language")]
    pub source_language: String,
    #[serde(default = "default_target_language")]
    pub target_language: String,
    #[serde(default)]
    pub collected_data: Option<HashMap<String, Value>>,
    #[serde(default = "default_communication_mode")]
    pub communication_mode: CommunicationMode,
    #[serde(default)]
    pub system_prompt_override: Option<String>,
}

fn default_call_mode() -> CallMode {
    CallMode::Relay
}

fn default_source_language() -> String {
    "en".to_string()
}

fn default_target_language() -> String {
    "ko".to_string()
}

fn default_communication_mode() -> CommunicationMode {
    CommunicationMode::VoiceToVoice
}

impl CallStartRequest {
    /// Phone numbers must be E.164 (e.g. +14155552671).
    pub fn validate(&self) -> anyhow::Result<()> {
        if !PHONE_NUMBER_RE.is_match(&self.phone_number) {
            anyhow::bail!("phone number must be in E.164 format (e.g. +14155552671)");
        }
        if self.call_id.is_empty() {
            anyhow::bail!("call_id must not be empty");
        }
        Ok(())
    }
}

#[derive(Debug, Serialize)]
pub struct CallStartResponse {
    pub call_id: String,
    pub carrier_call_id: String,
    pub stream_ws_path: String,
}

#[derive(Debug, Deserialize)]
pub struct CallEndRequest {
    pub call_id: String,
    #[serde(default = "default_end_reason")]
    pub reason: String,
}

fn default_end_reason() -> String {
    "user_hangup".to_string()
}

// --- Client WebSocket protocol (app <-> relay) ---

/// Inbound messages from the client application.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum ClientMessage {
    #[serde(rename = "audio_chunk")]
    AudioChunk { audio: String },
    #[serde(rename = "vad_state")]
    VadState { state: String },
    #[serde(rename = "text_input")]
    TextInput { text: String },
    #[serde(rename = "typing_state")]
    TypingState,
    #[serde(rename = "end_call")]
    EndCall,
}

/// Outbound messages to the client application.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", content = "data")]
pub enum ServerMessage {
    #[serde(rename = "caption")]
    Caption {
        role: String,
        text: String,
        direction: String,
    },
    #[serde(rename = "caption.original")]
    CaptionOriginal {
        role: String,
        text: String,
        stage: u8,
        language: String,
        direction: String,
    },
    #[serde(rename = "caption.translated")]
    CaptionTranslated {
        role: String,
        text: String,
        stage: u8,
        language: String,
        direction: String,
    },
    #[serde(rename = "recipient_audio")]
    RecipientAudio { audio: String },
    #[serde(rename = "call_status")]
    CallStatus {
        status: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        message: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        result: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        data: Option<Value>,
    },
    #[serde(rename = "interrupt_alert")]
    InterruptAlert { speaking: String },
    #[serde(rename = "session.recovery")]
    SessionRecovery {
        status: String,
        session: String,
        gap_ms: u64,
        message: String,
    },
    #[serde(rename = "guardrail.triggered")]
    GuardrailTriggered {
        level: u8,
        original: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        corrected: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        correction_time_ms: Option<f64>,
    },
    #[serde(rename = "translation.state")]
    TranslationState {
        state: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        direction: Option<String>,
    },
    #[serde(rename = "metrics")]
    Metrics(CallMetrics),
    #[serde(rename = "error")]
    Error { message: String },
}

// --- Telephony media stream protocol ---

/// One incoming frame on the carrier's media WebSocket. The carrier sends
/// camelCase keys (streamSid, sequenceNumber).
#[derive(Debug, Clone, Deserialize)]
pub struct MediaStreamEvent {
    pub event: String,
    #[serde(rename = "streamSid")]
    pub stream_sid: Option<String>,
    #[serde(rename = "sequenceNumber")]
    pub sequence_number: Option<String>,
    pub media: Option<MediaPayload>,
    pub start: Option<Value>,
    pub stop: Option<Value>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MediaPayload {
    /// base64 G.711 mu-law, 8 kHz, one 20 ms frame.
    pub payload: String,
    pub track: Option<String>,
}

// --- Upstream session configuration ---

/// Optional whisper-style input transcription attached to a session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InputTranscription {
    pub model: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
}

/// How one upstream realtime session is configured at connect time.
#[derive(Debug, Clone)]
pub struct UpstreamSessionConfig {
    pub label: SessionLabel,
    pub input_audio_format: String,
    pub output_audio_format: String,
    pub modalities: Vec<String>,
    pub vad_mode: VadMode,
    pub input_transcription: Option<InputTranscription>,
    pub tools: Option<Vec<Value>>,
}
