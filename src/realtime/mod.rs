//! Realtime relay core
//!
//! Everything between the three network edges of a call: the two upstream
//! realtime-LLM sessions, the handlers that interpret their event streams,
//! the echo/interrupt/first-message machinery, recovery, and the per-mode
//! pipelines that compose it all.

pub mod context;
pub mod dual;
pub mod echo_gate;
pub mod first_message;
pub mod interrupt;
pub mod pipeline;
pub mod recovery;
pub mod session;
pub mod session_a;
pub mod session_b;

use futures::future::BoxFuture;
use std::sync::Arc;

/// Async callback taking no arguments.
pub type AsyncHook = Arc<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;

/// Async sink for a chunk of decoded audio bytes.
pub type AudioSink = Arc<dyn Fn(Vec<u8>) -> BoxFuture<'static, ()> + Send + Sync>;

/// Async sink for (role, text) caption deltas and completions.
pub type CaptionSink = Arc<dyn Fn(String, String) -> BoxFuture<'static, ()> + Send + Sync>;

/// Async sink for an outbound client message.
pub type NotifySink = Arc<
    dyn Fn(crate::types::ServerMessage) -> BoxFuture<'static, ()> + Send + Sync,
>;

/// Async sink for a single text payload.
pub type TextSink = Arc<dyn Fn(String) -> BoxFuture<'static, ()> + Send + Sync>;

/// Async sink for a structured JSON payload.
pub type ValueSink = Arc<dyn Fn(serde_json::Value) -> BoxFuture<'static, ()> + Send + Sync>;
