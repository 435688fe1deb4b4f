//! SQLite-based persistent storage for call rows
//!
//! One row per call, upserted incrementally during the call (debounced by
//! the pipeline) and finalized on cleanup. Persistence failures are logged
//! by callers and never affect call behavior.

use anyhow::Result;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::types::Call;

pub struct CallStore {
    conn: Arc<Mutex<Connection>>,
}

impl CallStore {
    /// Open (and initialize) the store at the given path.
    pub async fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let conn = Connection::open(&path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;
        Self::init_schema(&conn)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// In-memory store for tests.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::init_schema(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn init_schema(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS calls (
                call_id TEXT PRIMARY KEY,
                carrier_call_id TEXT NOT NULL DEFAULT '',
                mode TEXT NOT NULL,
                communication_mode TEXT NOT NULL,
                status TEXT NOT NULL,
                source_language TEXT NOT NULL,
                target_language TEXT NOT NULL,
                duration_s REAL NOT NULL DEFAULT 0,
                call_result TEXT NOT NULL DEFAULT '',
                transcript TEXT NOT NULL DEFAULT '[]',
                recovery_events TEXT NOT NULL DEFAULT '[]',
                guardrail_events TEXT NOT NULL DEFAULT '[]',
                tokens TEXT NOT NULL DEFAULT '{}',
                metrics TEXT NOT NULL DEFAULT '{}',
                collected_data TEXT NOT NULL DEFAULT '{}',
                call_result_data TEXT NOT NULL DEFAULT '{}',
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_calls_created ON calls(created_at DESC);
            "#,
        )?;
        Ok(())
    }

    /// Upsert the call row with the current state.
    pub async fn save(&self, call: &Call) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            r#"
            INSERT INTO calls (
                call_id, carrier_call_id, mode, communication_mode, status,
                source_language, target_language, duration_s, call_result,
                transcript, recovery_events, guardrail_events, tokens,
                metrics, collected_data, call_result_data, created_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18)
            ON CONFLICT(call_id) DO UPDATE SET
                carrier_call_id = excluded.carrier_call_id,
                status = excluded.status,
                duration_s = excluded.duration_s,
                call_result = excluded.call_result,
                transcript = excluded.transcript,
                recovery_events = excluded.recovery_events,
                guardrail_events = excluded.guardrail_events,
                tokens = excluded.tokens,
                metrics = excluded.metrics,
                collected_data = excluded.collected_data,
                call_result_data = excluded.call_result_data,
                updated_at = excluded.updated_at
            "#,
            params![
                call.call_id,
                call.carrier_call_id,
                serde_json::to_string(&call.mode)?,
                serde_json::to_string(&call.communication_mode)?,
                serde_json::to_string(&call.status)?,
                call.source_language,
                call.target_language,
                call.duration_s(),
                call.call_result,
                serde_json::to_string(&call.transcript)?,
                serde_json::to_string(&call.recovery_events)?,
                serde_json::to_string(&call.guardrail_events)?,
                serde_json::to_string(&call.tokens)?,
                serde_json::to_string(&call.metrics)?,
                serde_json::to_string(&call.collected_data)?,
                serde_json::to_string(&call.call_result_data)?,
                call.created_at.to_rfc3339(),
                chrono::Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    /// Load a persisted status string (mainly for tests and diagnostics).
    pub async fn load_status(&self, call_id: &str) -> Result<Option<String>> {
        let conn = self.conn.lock().await;
        let status: Option<String> = conn
            .query_row(
                "SELECT status FROM calls WHERE call_id = ?1",
                params![call_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(status)
    }

    pub async fn call_count(&self) -> Result<u64> {
        let conn = self.conn.lock().await;
        let count: u64 = conn.query_row("SELECT COUNT(*) FROM calls", [], |row| row.get(0))?;
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{CallMode, CallStartRequest, CallStatus, CommunicationMode};

    fn sample_call() -> Call {
        Call::new(&CallStartRequest {
            call_id: "c-1".to_string(),
            phone_number: "+14155552671".to_string(),
            mode: CallMode::Relay,
            source_language: "en".to_string(),
            target_language: "ko".to_string(),
            collected_data: None,
            communication_mode: CommunicationMode::VoiceToVoice,
            system_prompt_override: None,
        })
    }

    #[tokio::test]
    async fn test_save_and_load() {
        let store = CallStore::open_in_memory().unwrap();
        let call = sample_call();
        store.save(&call).await.unwrap();
        assert_eq!(
            store.load_status("c-1").await.unwrap(),
            Some("\"pending\"".to_string())
        );
        assert_eq!(store.call_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_upsert_updates_in_place() {
        let store = CallStore::open_in_memory().unwrap();
        let mut call = sample_call();
        store.save(&call).await.unwrap();
        call.status = CallStatus::Ended;
        call.call_result = "success".to_string();
        store.save(&call).await.unwrap();
        assert_eq!(store.call_count().await.unwrap(), 1);
        assert_eq!(
            store.load_status("c-1").await.unwrap(),
            Some("\"ended\"".to_string())
        );
    }

    #[tokio::test]
    async fn test_missing_call_is_none() {
        let store = CallStore::open_in_memory().unwrap();
        assert_eq!(store.load_status("nope").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_open_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let store = CallStore::open(dir.path().join("calls.db")).await.unwrap();
        store.save(&sample_call()).await.unwrap();
        assert_eq!(store.call_count().await.unwrap(), 1);
    }
}
