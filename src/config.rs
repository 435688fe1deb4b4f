//! Configuration management
//!
//! Loads the relay configuration from a TOML file in the data directory with
//! environment-variable overrides for secrets (carrier credentials, upstream
//! API key). Every field has a serde default so a missing file yields a
//! usable development configuration.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub carrier: CarrierConfig,
    #[serde(default)]
    pub upstream: UpstreamConfig,
    #[serde(default)]
    pub limits: CallLimitsConfig,
    #[serde(default)]
    pub recovery: RecoveryConfig,
    #[serde(default)]
    pub local_vad: LocalVadConfig,
    #[serde(default)]
    pub energy: EnergyConfig,
    #[serde(default)]
    pub session_b: SessionBConfig,
    #[serde(default)]
    pub guardrail: GuardrailConfig,
    #[serde(default)]
    pub store: StoreConfig,
}

/// HTTP/WebSocket listener settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Public base URL the carrier uses to reach the media-stream WebSocket.
    #[serde(default = "default_public_url")]
    pub public_url: String,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8000
}

fn default_public_url() -> String {
    "http://localhost:8000".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            public_url: default_public_url(),
        }
    }
}

/// Telephony carrier (REST dialing + media streams)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CarrierConfig {
    #[serde(default)]
    pub account_sid: String,
    #[serde(default)]
    pub auth_token: String,
    #[serde(default)]
    pub from_number: String,
    #[serde(default = "default_carrier_api_base")]
    pub api_base: String,
}

fn default_carrier_api_base() -> String {
    "https://api.twilio.com/2010-04-01".to_string()
}

/// Upstream realtime LLM service + fallback batch STT
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamConfig {
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_realtime_url")]
    pub realtime_url: String,
    #[serde(default = "default_realtime_model")]
    pub realtime_model: String,
    #[serde(default = "default_stt_url")]
    pub stt_url: String,
    #[serde(default = "default_stt_model")]
    pub stt_model: String,
    /// Chat-completions endpoint used by the guardrail fallback LLM.
    #[serde(default = "default_chat_url")]
    pub chat_url: String,
    #[serde(default = "default_transcription_model")]
    pub input_transcription_model: String,
}

fn default_realtime_url() -> String {
    "wss://api.openai.com/v1/realtime".to_string()
}

fn default_realtime_model() -> String {
    "gpt-4o-realtime-preview".to_string()
}

fn default_stt_url() -> String {
    "https://api.openai.com/v1/audio/transcriptions".to_string()
}

fn default_stt_model() -> String {
    "whisper-1".to_string()
}

fn default_chat_url() -> String {
    "https://api.openai.com/v1/chat/completions".to_string()
}

fn default_transcription_model() -> String {
    "whisper-1".to_string()
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            realtime_url: default_realtime_url(),
            realtime_model: default_realtime_model(),
            stt_url: default_stt_url(),
            stt_model: default_stt_model(),
            chat_url: default_chat_url(),
            input_transcription_model: default_transcription_model(),
        }
    }
}

/// Call duration limits
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallLimitsConfig {
    #[serde(default = "default_max_call_duration_ms")]
    pub max_call_duration_ms: u64,
    #[serde(default = "default_call_warning_ms")]
    pub call_warning_ms: u64,
}

fn default_max_call_duration_ms() -> u64 {
    600_000
}

fn default_call_warning_ms() -> u64 {
    480_000
}

impl Default for CallLimitsConfig {
    fn default() -> Self {
        Self {
            max_call_duration_ms: default_max_call_duration_ms(),
            call_warning_ms: default_call_warning_ms(),
        }
    }
}

/// Session recovery: heartbeat, reconnect backoff, degraded mode
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoveryConfig {
    #[serde(default = "default_heartbeat_interval_s")]
    pub heartbeat_interval_s: f64,
    #[serde(default = "default_heartbeat_timeout_s")]
    pub heartbeat_timeout_s: f64,
    #[serde(default = "default_recovery_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_initial_backoff_s")]
    pub initial_backoff_s: f64,
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
    #[serde(default = "default_max_backoff_s")]
    pub max_backoff_s: f64,
    #[serde(default = "default_recovery_timeout_s")]
    pub recovery_timeout_s: f64,
    #[serde(default = "default_degraded_batch_s")]
    pub degraded_batch_s: f64,
    #[serde(default = "default_ring_buffer_slots")]
    pub ring_buffer_capacity_slots: usize,
}

fn default_heartbeat_interval_s() -> f64 {
    5.0
}

fn default_heartbeat_timeout_s() -> f64 {
    120.0
}

fn default_recovery_max_attempts() -> u32 {
    5
}

fn default_initial_backoff_s() -> f64 {
    1.0
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_max_backoff_s() -> f64 {
    30.0
}

fn default_recovery_timeout_s() -> f64 {
    10.0
}

fn default_degraded_batch_s() -> f64 {
    3.0
}

fn default_ring_buffer_slots() -> usize {
    1500
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_s: default_heartbeat_interval_s(),
            heartbeat_timeout_s: default_heartbeat_timeout_s(),
            max_attempts: default_recovery_max_attempts(),
            initial_backoff_s: default_initial_backoff_s(),
            backoff_multiplier: default_backoff_multiplier(),
            max_backoff_s: default_max_backoff_s(),
            recovery_timeout_s: default_recovery_timeout_s(),
            degraded_batch_s: default_degraded_batch_s(),
            ring_buffer_capacity_slots: default_ring_buffer_slots(),
        }
    }
}

/// Two-stage local VAD thresholds
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocalVadConfig {
    #[serde(default = "default_local_vad_enabled")]
    pub enabled: bool,
    #[serde(default = "default_rms_threshold")]
    pub rms_threshold: f32,
    #[serde(default = "default_speech_threshold")]
    pub speech_threshold: f32,
    #[serde(default = "default_silence_threshold")]
    pub silence_threshold: f32,
    #[serde(default = "default_min_speech_frames")]
    pub min_speech_frames: u32,
    #[serde(default = "default_min_silence_frames")]
    pub min_silence_frames: u32,
    /// Path to the Silero ONNX model. Empty = data dir default, downloaded
    /// on first use.
    #[serde(default)]
    pub model_path: String,
}

fn default_local_vad_enabled() -> bool {
    true
}

fn default_rms_threshold() -> f32 {
    150.0
}

fn default_speech_threshold() -> f32 {
    0.5
}

fn default_silence_threshold() -> f32 {
    0.35
}

fn default_min_speech_frames() -> u32 {
    2
}

fn default_min_silence_frames() -> u32 {
    15
}

impl Default for LocalVadConfig {
    fn default() -> Self {
        Self {
            enabled: default_local_vad_enabled(),
            rms_threshold: default_rms_threshold(),
            speech_threshold: default_speech_threshold(),
            silence_threshold: default_silence_threshold(),
            min_speech_frames: default_min_speech_frames(),
            min_silence_frames: default_min_silence_frames(),
            model_path: String::new(),
        }
    }
}

/// Energy gates (silence filtering + echo breakthrough)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnergyConfig {
    #[serde(default = "default_energy_gate_enabled")]
    pub gate_enabled: bool,
    #[serde(default = "default_audio_min_rms")]
    pub audio_min_rms: f32,
    #[serde(default = "default_echo_threshold_rms")]
    pub echo_threshold_rms: f32,
    #[serde(default = "default_echo_margin_s")]
    pub echo_round_trip_margin_s: f64,
    #[serde(default = "default_max_echo_window_s")]
    pub max_echo_window_s: f64,
}

fn default_energy_gate_enabled() -> bool {
    true
}

fn default_audio_min_rms() -> f32 {
    50.0
}

fn default_echo_threshold_rms() -> f32 {
    400.0
}

fn default_echo_margin_s() -> f64 {
    0.5
}

fn default_max_echo_window_s() -> f64 {
    2.0
}

impl Default for EnergyConfig {
    fn default() -> Self {
        Self {
            gate_enabled: default_energy_gate_enabled(),
            audio_min_rms: default_audio_min_rms(),
            echo_threshold_rms: default_echo_threshold_rms(),
            echo_round_trip_margin_s: default_echo_margin_s(),
            max_echo_window_s: default_max_echo_window_s(),
        }
    }
}

/// Session B turn handling: server-VAD parameters and local-VAD utterance
/// bounds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionBConfig {
    #[serde(default = "default_server_vad_threshold")]
    pub server_vad_threshold: f32,
    #[serde(default = "default_server_vad_silence_ms")]
    pub server_vad_silence_ms: u64,
    #[serde(default = "default_server_vad_prefix_ms")]
    pub server_vad_prefix_padding_ms: u64,
    /// Utterances shorter than this are discarded (hallucination floor).
    #[serde(default = "default_min_speech_ms")]
    pub min_speech_ms: u64,
    /// Safety net: force a commit if speech_stopped never arrives.
    #[serde(default = "default_max_speech_s")]
    pub max_speech_s: f64,
    #[serde(default = "default_response_debounce_ms")]
    pub response_debounce_ms: u64,
    #[serde(default = "default_recipient_cooldown_s")]
    pub recipient_speech_cooldown_s: f64,
}

fn default_server_vad_threshold() -> f32 {
    0.5
}

fn default_server_vad_silence_ms() -> u64 {
    500
}

fn default_server_vad_prefix_ms() -> u64 {
    300
}

fn default_min_speech_ms() -> u64 {
    400
}

fn default_max_speech_s() -> f64 {
    15.0
}

fn default_response_debounce_ms() -> u64 {
    300
}

fn default_recipient_cooldown_s() -> f64 {
    1.5
}

impl Default for SessionBConfig {
    fn default() -> Self {
        Self {
            server_vad_threshold: default_server_vad_threshold(),
            server_vad_silence_ms: default_server_vad_silence_ms(),
            server_vad_prefix_padding_ms: default_server_vad_prefix_ms(),
            min_speech_ms: default_min_speech_ms(),
            max_speech_s: default_max_speech_s(),
            response_debounce_ms: default_response_debounce_ms(),
            recipient_speech_cooldown_s: default_recipient_cooldown_s(),
        }
    }
}

/// Content guardrail over streamed translation text
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GuardrailConfig {
    #[serde(default = "default_guardrail_enabled")]
    pub enabled: bool,
    #[serde(default = "default_guardrail_model")]
    pub fallback_model: String,
    #[serde(default = "default_guardrail_timeout_ms")]
    pub fallback_timeout_ms: u64,
}

fn default_guardrail_enabled() -> bool {
    true
}

fn default_guardrail_model() -> String {
    "gpt-4o-mini".to_string()
}

fn default_guardrail_timeout_ms() -> u64 {
    2000
}

impl Default for GuardrailConfig {
    fn default() -> Self {
        Self {
            enabled: default_guardrail_enabled(),
            fallback_model: default_guardrail_model(),
            fallback_timeout_ms: default_guardrail_timeout_ms(),
        }
    }
}

/// Persisted call rows
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// SQLite path. Empty = `<data dir>/calls.db`.
    #[serde(default)]
    pub path: String,
    #[serde(default = "default_save_debounce_s")]
    pub save_debounce_s: f64,
}

fn default_save_debounce_s() -> f64 {
    5.0
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: String::new(),
            save_debounce_s: default_save_debounce_s(),
        }
    }
}

/// Get the data directory (~/.lingua-relay)
pub fn data_dir() -> Result<PathBuf> {
    let home = dirs::home_dir().context("Could not determine home directory")?;
    Ok(home.join(".lingua-relay"))
}

impl Config {
    /// Load from `<data dir>/config.toml`, falling back to defaults when the
    /// file is absent, then apply environment overrides for secrets.
    pub fn load() -> Result<Self> {
        let path = data_dir()?.join("config.toml");
        let mut config = if path.exists() {
            let content = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read {}", path.display()))?;
            toml::from_str(&content)
                .with_context(|| format!("Failed to parse {}", path.display()))?
        } else {
            Config::default()
        };
        config.apply_env_overrides();
        Ok(config)
    }

    /// Load from an explicit path (CLI `--config`), with env overrides.
    pub fn load_from(path: &std::path::Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let mut config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse {}", path.display()))?;
        config.apply_env_overrides();
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(key) = std::env::var("UPSTREAM_API_KEY") {
            self.upstream.api_key = key;
        }
        if let Ok(sid) = std::env::var("CARRIER_ACCOUNT_SID") {
            self.carrier.account_sid = sid;
        }
        if let Ok(token) = std::env::var("CARRIER_AUTH_TOKEN") {
            self.carrier.auth_token = token;
        }
        if let Ok(number) = std::env::var("CARRIER_FROM_NUMBER") {
            self.carrier.from_number = number;
        }
        if let Ok(url) = std::env::var("RELAY_PUBLIC_URL") {
            self.server.public_url = url;
        }
    }

    /// Resolved Silero model path.
    pub fn vad_model_path(&self) -> Result<PathBuf> {
        if !self.local_vad.model_path.is_empty() {
            return Ok(PathBuf::from(&self.local_vad.model_path));
        }
        Ok(data_dir()?.join("models").join("silero_vad.onnx"))
    }

    /// Resolved call-store path.
    pub fn store_path(&self) -> Result<PathBuf> {
        if !self.store.path.is_empty() {
            return Ok(PathBuf::from(&self.store.path));
        }
        Ok(data_dir()?.join("calls.db"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.limits.max_call_duration_ms, 600_000);
        assert_eq!(config.recovery.ring_buffer_capacity_slots, 1500);
        assert_eq!(config.session_b.min_speech_ms, 400);
        assert!(config.local_vad.enabled);
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config: Config = toml::from_str(
            r#"
            [server]
            port = 9100

            [local_vad]
            rms_threshold = 200.0
            "#,
        )
        .unwrap();
        assert_eq!(config.server.port, 9100);
        assert_eq!(config.server.host, "0.0.0.0");
        assert_eq!(config.local_vad.rms_threshold, 200.0);
        assert_eq!(config.local_vad.min_silence_frames, 15);
        assert_eq!(config.energy.echo_threshold_rms, 400.0);
    }

    #[test]
    fn test_roundtrip_serialization() {
        let config = Config::default();
        let toml_str = toml::to_string(&config).unwrap();
        let parsed: Config = toml::from_str(&toml_str).unwrap();
        assert_eq!(parsed.recovery.max_attempts, config.recovery.max_attempts);
    }
}
