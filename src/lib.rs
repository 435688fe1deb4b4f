//! Lingua Relay - real-time bilingual voice-translation relay library
//!
//! A user speaks (or types) through a mobile/web client; the relay places a
//! PSTN call through a telephony carrier; utterances are translated both
//! ways through two upstream realtime-LLM sessions:
//! - Session A: user -> recipient (target-language TTS to the phone line)
//! - Session B: recipient -> user (source-language captions and audio)
//!
//! The per-call core is the dual-session streaming relay: echo suppression,
//! local voice-activity detection, interrupt priorities, and session
//! recovery with batch-STT catch-up.

// Core modules (order matters for cross-module dependencies)
pub mod types;
pub mod config;
pub mod audio;
pub mod vad;
pub mod stt;
pub mod guardrail;
pub mod prompt;
pub mod tools;
pub mod telephony;
pub mod realtime;
pub mod db;
pub mod call_manager;
pub mod server;
pub mod cli;

// Re-export commonly used types for convenience
pub use call_manager::CallManager;
pub use config::Config;
pub use types::{Call, CallMode, CallStatus, CommunicationMode};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
