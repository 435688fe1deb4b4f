//! Centralized call lifecycle management
//!
//! One registry holds every per-call resource (call state, upstream session
//! pair, pipeline, client sender, listen task), keyed by call id. Entries
//! are inserted at start time and removed exactly once by `cleanup_call`,
//! which any edge may invoke: client disconnect, carrier disconnect, the
//! explicit end request, or server shutdown. A per-call async lock makes
//! cleanup idempotent under concurrent triggers.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::db::CallStore;
use crate::realtime::dual::DualSessionManager;
use crate::realtime::pipeline::Pipeline;
use crate::telephony::CarrierClient;
use crate::types::{Call, CallStatus, ServerMessage};

#[derive(Default)]
struct Registry {
    calls: HashMap<String, Arc<tokio::sync::Mutex<Call>>>,
    sessions: HashMap<String, Arc<DualSessionManager>>,
    pipelines: HashMap<String, Arc<dyn Pipeline>>,
    client_senders: HashMap<String, mpsc::Sender<String>>,
    listen_tasks: HashMap<String, JoinHandle<()>>,
    cleanup_locks: HashMap<String, Arc<tokio::sync::Mutex<()>>>,
}

pub struct CallManager {
    registry: Mutex<Registry>,
    store: Arc<CallStore>,
    carrier: Arc<CarrierClient>,
}

impl CallManager {
    pub fn new(store: Arc<CallStore>, carrier: Arc<CarrierClient>) -> Arc<Self> {
        Arc::new(Self {
            registry: Mutex::new(Registry::default()),
            store,
            carrier,
        })
    }

    // --- Registration (start time only) ---

    pub fn register_call(&self, call_id: &str, call: Arc<tokio::sync::Mutex<Call>>) {
        self.registry
            .lock()
            .unwrap()
            .calls
            .insert(call_id.to_string(), call);
    }

    pub fn register_session(&self, call_id: &str, session: Arc<DualSessionManager>) {
        self.registry
            .lock()
            .unwrap()
            .sessions
            .insert(call_id.to_string(), session);
    }

    pub fn register_pipeline(&self, call_id: &str, pipeline: Arc<dyn Pipeline>) {
        self.registry
            .lock()
            .unwrap()
            .pipelines
            .insert(call_id.to_string(), pipeline);
    }

    pub fn register_client_sender(&self, call_id: &str, sender: mpsc::Sender<String>) {
        self.registry
            .lock()
            .unwrap()
            .client_senders
            .insert(call_id.to_string(), sender);
    }

    pub fn register_listen_task(&self, call_id: &str, task: JoinHandle<()>) {
        self.registry
            .lock()
            .unwrap()
            .listen_tasks
            .insert(call_id.to_string(), task);
    }

    // --- Lookup ---

    pub fn get_call(&self, call_id: &str) -> Option<Arc<tokio::sync::Mutex<Call>>> {
        self.registry.lock().unwrap().calls.get(call_id).cloned()
    }

    pub fn get_session(&self, call_id: &str) -> Option<Arc<DualSessionManager>> {
        self.registry.lock().unwrap().sessions.get(call_id).cloned()
    }

    pub fn get_pipeline(&self, call_id: &str) -> Option<Arc<dyn Pipeline>> {
        self.registry.lock().unwrap().pipelines.get(call_id).cloned()
    }

    pub fn active_call_count(&self) -> usize {
        self.registry.lock().unwrap().calls.len()
    }

    /// Send a message to the call's client app, if one is attached.
    pub async fn send_to_client(&self, call_id: &str, msg: ServerMessage) {
        let sender = self
            .registry
            .lock()
            .unwrap()
            .client_senders
            .get(call_id)
            .cloned();
        if let Some(sender) = sender {
            let payload = match serde_json::to_string(&msg) {
                Ok(payload) => payload,
                Err(_) => return,
            };
            if sender.send(payload).await.is_err() {
                warn!("Failed to send message to client (call={call_id})");
            }
        }
    }

    // --- Central cleanup ---

    /// Tear down every resource of a call exactly once. Safe to call from
    /// any edge, any number of times, concurrently.
    pub async fn cleanup_call(&self, call_id: &str, reason: &str) {
        let lock = {
            let mut registry = self.registry.lock().unwrap();
            registry
                .cleanup_locks
                .entry(call_id.to_string())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
                .clone()
        };
        let _guard = lock.lock().await;

        // Pop everything under one registry lock; an earlier cleanup left
        // nothing behind and this becomes a no-op.
        let (call, session, pipeline, client_sender, listen_task) = {
            let mut registry = self.registry.lock().unwrap();
            let call = registry.calls.remove(call_id);
            let session = registry.sessions.remove(call_id);
            let pipeline = registry.pipelines.remove(call_id);
            let client_sender = registry.client_senders.remove(call_id);
            let listen_task = registry.listen_tasks.remove(call_id);
            (call, session, pipeline, client_sender, listen_task)
        };
        if call.is_none() && session.is_none() && pipeline.is_none() {
            return;
        }

        info!("Cleaning up call {call_id} (reason: {reason})");

        // Hang up the PSTN leg first so the recipient is not left listening
        // to a dead line.
        if let Some(call) = &call {
            let carrier_call_id = call.lock().await.carrier_call_id.clone();
            if !carrier_call_id.is_empty() {
                if let Err(e) = self.carrier.terminate_call(&carrier_call_id).await {
                    warn!("Failed to terminate carrier call {carrier_call_id}: {e}");
                }
            }
        }

        if let Some(pipeline) = pipeline {
            pipeline.stop().await;
        }

        if let Some(task) = listen_task {
            task.abort();
        }

        if let Some(session) = session {
            session.close().await;
        }

        if let Some(sender) = client_sender {
            let msg = ServerMessage::CallStatus {
                status: "ended".to_string(),
                message: Some(reason.to_string()),
                result: None,
                data: None,
            };
            if let Ok(payload) = serde_json::to_string(&msg) {
                let _ = sender.send(payload).await;
            }
            // Dropping the sender closes the client socket's send loop.
        }

        if let Some(call) = call {
            let snapshot = {
                let mut call = call.lock().await;
                call.status = CallStatus::Ended;
                call.ended_at = Some(chrono::Utc::now());
                call.clone()
            };
            log_call_summary(&snapshot);
            if let Err(e) = self.store.save(&snapshot).await {
                warn!("Failed to persist call {call_id}: {e}");
            }
        }

        self.registry.lock().unwrap().cleanup_locks.remove(call_id);
        info!("Cleanup complete for call {call_id}");
    }

    /// Server shutdown: clean every active call.
    pub async fn shutdown_all(&self) {
        let call_ids: Vec<String> = self.registry.lock().unwrap().calls.keys().cloned().collect();
        info!("Shutting down {} active calls", call_ids.len());
        for call_id in call_ids {
            self.cleanup_call(&call_id, "server_shutdown").await;
        }
    }
}

fn log_call_summary(call: &Call) {
    let m = &call.metrics;
    let avg = |samples: &[f64]| {
        if samples.is_empty() {
            0.0
        } else {
            samples.iter().sum::<f64>() / samples.len() as f64
        }
    };
    info!(
        "=== Call Summary ===\n  call_id={}  mode={:?}  comm={:?}\n  duration={:.1}s  turns={}  tokens={}\n  session_a: avg={:.0}ms  samples={}\n  session_b: avg_e2e={:.0}ms  samples={}\n  first_msg={:.0}ms  echo={}  breakthroughs={}  guardrail={}",
        call.call_id,
        call.mode,
        call.communication_mode,
        call.duration_s(),
        m.turn_count,
        call.tokens.total(),
        avg(&m.session_a_latencies_ms),
        m.session_a_latencies_ms.len(),
        avg(&m.session_b_e2e_latencies_ms),
        m.session_b_e2e_latencies_ms.len(),
        m.first_message_latency_ms,
        m.echo_suppressions,
        m.echo_gate_breakthroughs,
        m.guardrail_triggers,
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::types::{CallMode, CallStartRequest, CommunicationMode};

    fn manager() -> Arc<CallManager> {
        let config = Config::default();
        CallManager::new(
            Arc::new(CallStore::open_in_memory().unwrap()),
            Arc::new(CarrierClient::new(&config)),
        )
    }

    fn sample_call() -> Arc<tokio::sync::Mutex<Call>> {
        Arc::new(tokio::sync::Mutex::new(Call::new(&CallStartRequest {
            call_id: "c-1".to_string(),
            phone_number: "+14155552671".to_string(),
            mode: CallMode::Relay,
            source_language: "en".to_string(),
            target_language: "ko".to_string(),
            collected_data: None,
            communication_mode: CommunicationMode::VoiceToVoice,
            system_prompt_override: None,
        })))
    }

    #[tokio::test]
    async fn test_register_and_lookup() {
        let m = manager();
        m.register_call("c-1", sample_call());
        assert_eq!(m.active_call_count(), 1);
        assert!(m.get_call("c-1").is_some());
        assert!(m.get_call("c-2").is_none());
    }

    #[tokio::test]
    async fn test_cleanup_is_idempotent() {
        let m = manager();
        m.register_call("c-1", sample_call());

        m.cleanup_call("c-1", "user_hangup").await;
        assert_eq!(m.active_call_count(), 0);
        assert!(m.store.load_status("c-1").await.unwrap().is_some());

        // Second and third cleanups are no-ops.
        m.cleanup_call("c-1", "user_hangup").await;
        m.cleanup_call("c-1", "app_disconnected").await;
        assert_eq!(m.active_call_count(), 0);
    }

    #[tokio::test]
    async fn test_concurrent_cleanup_single_teardown() {
        let m = manager();
        m.register_call("c-1", sample_call());

        let m1 = m.clone();
        let m2 = m.clone();
        let (a, b) = tokio::join!(
            m1.cleanup_call("c-1", "user_hangup"),
            m2.cleanup_call("c-1", "app_disconnected"),
        );
        let _ = (a, b);
        assert_eq!(m.active_call_count(), 0);
        // Exactly one persisted row either way.
        assert_eq!(m.store.call_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_cleanup_marks_ended() {
        let m = manager();
        let call = sample_call();
        m.register_call("c-1", call.clone());
        m.cleanup_call("c-1", "carrier_completed").await;
        let call = call.lock().await;
        assert_eq!(call.status, CallStatus::Ended);
        assert!(call.ended_at.is_some());
    }

    #[tokio::test]
    async fn test_client_sender_receives_ended_status() {
        let m = manager();
        m.register_call("c-1", sample_call());
        let (tx, mut rx) = mpsc::channel(4);
        m.register_client_sender("c-1", tx);

        m.cleanup_call("c-1", "user_hangup").await;
        let payload = rx.recv().await.unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&payload).unwrap();
        assert_eq!(parsed["type"], "call_status");
        assert_eq!(parsed["data"]["status"], "ended");
        // Channel closes after cleanup drops the sender.
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_shutdown_all() {
        let m = manager();
        m.register_call("c-1", sample_call());
        let call2 = sample_call();
        call2.try_lock().unwrap().call_id = "c-2".to_string();
        m.register_call("c-2", call2);
        m.shutdown_all().await;
        assert_eq!(m.active_call_count(), 0);
    }
}
