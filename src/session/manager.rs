//! Session registry.
//!
//! The only component with cross-tenant visibility. Runtimes are built
//! lazily on first use and reused until the session is deleted.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{RwLock, broadcast};
use tracing::{info, warn};

use crate::config::EngineConfig;
use crate::conversation::PromptConfigStore;
use crate::error::SessionError;
use crate::llm::LlmProvider;
use crate::sequence::SequenceHandle;
use crate::session::runtime::{EngineDeps, SessionEvent, SessionRuntime};
use crate::store::{AgendaItem, Database, SessionRecord, SessionStatus};
use crate::transport::TransportFactory;

/// Broadcast channel capacity for lifecycle events.
const EVENT_CAPACITY: usize = 256;

const MAX_SESSION_ID_LEN: usize = 64;

/// Session ids are used in paths and log fields: ASCII letters, digits,
/// `-` and `_` only.
pub fn validate_session_id(id: &str) -> Result<(), SessionError> {
    let valid = !id.is_empty()
        && id.len() <= MAX_SESSION_ID_LEN
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if valid {
        Ok(())
    } else {
        Err(SessionError::InvalidId(id.to_string()))
    }
}

/// Point-in-time view of one session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub id: String,
    pub status: SessionStatus,
    #[serde(default)]
    pub qr_code: Option<String>,
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default)]
    pub connected_at: Option<DateTime<Utc>>,
    /// Whether a runtime is loaded in this process.
    pub loaded: bool,
    #[serde(default)]
    pub active_conversations: usize,
}

fn snapshot(
    id: &str,
    runtime: Option<&SessionRuntime>,
    record: Option<&SessionRecord>,
) -> SessionSnapshot {
    let status = runtime
        .map(SessionRuntime::status)
        .or(record.map(|r| r.status))
        .unwrap_or(SessionStatus::Disconnected);
    SessionSnapshot {
        id: id.to_string(),
        status,
        qr_code: record
            .filter(|_| status == SessionStatus::QrPending)
            .and_then(|r| r.qr_code.clone()),
        phone: runtime
            .and_then(SessionRuntime::phone)
            .or_else(|| record.and_then(|r| r.phone.clone())),
        connected_at: record.and_then(|r| r.connected_at),
        loaded: runtime.is_some(),
        active_conversations: runtime.map_or(0, SessionRuntime::active_conversations),
    }
}

pub struct SessionManager {
    deps: EngineDeps,
    sessions: RwLock<HashMap<String, Arc<SessionRuntime>>>,
}

impl SessionManager {
    pub fn new(
        db: Arc<dyn Database>,
        llm: Arc<dyn LlmProvider>,
        transports: Arc<dyn TransportFactory>,
        config: EngineConfig,
    ) -> Self {
        let (events, _rx) = broadcast::channel(EVENT_CAPACITY);
        let prompts = Arc::new(PromptConfigStore::new(
            Arc::clone(&db),
            config.conversation.prompt_cache_ttl,
        ));
        Self {
            deps: EngineDeps {
                db,
                llm,
                transports,
                prompts,
                config,
                events,
            },
            sessions: RwLock::new(HashMap::new()),
        }
    }

    /// Status and QR events for every session.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.deps.events.subscribe()
    }

    pub fn prompt_config(&self) -> Arc<PromptConfigStore> {
        Arc::clone(&self.deps.prompts)
    }

    async fn loaded(&self, id: &str) -> Option<Arc<SessionRuntime>> {
        self.sessions.read().await.get(id).cloned()
    }

    async fn get_or_create(&self, id: &str) -> Result<Arc<SessionRuntime>, SessionError> {
        validate_session_id(id)?;
        if let Some(runtime) = self.loaded(id).await {
            return Ok(runtime);
        }
        let mut sessions = self.sessions.write().await;
        if let Some(runtime) = sessions.get(id) {
            return Ok(Arc::clone(runtime));
        }
        self.deps.db.upsert_session(id).await?;
        let runtime = SessionRuntime::build(id, &self.deps).await?;
        sessions.insert(id.to_string(), Arc::clone(&runtime));
        Ok(runtime)
    }

    /// The runtime for a session known here or in persistence.
    async fn known(&self, id: &str) -> Result<Arc<SessionRuntime>, SessionError> {
        validate_session_id(id)?;
        if let Some(runtime) = self.loaded(id).await {
            return Ok(runtime);
        }
        if self.deps.db.get_session(id).await?.is_none() {
            return Err(SessionError::NotFound(id.to_string()));
        }
        self.get_or_create(id).await
    }

    /// Start (or resume) a session. Idempotent while connected.
    pub async fn start(&self, id: &str) -> Result<SessionSnapshot, SessionError> {
        let runtime = self.get_or_create(id).await?;
        runtime.start().await?;
        info!(session = %id, "Session started");
        self.get_state(id).await
    }

    /// Disconnect and stop reconnecting. Credentials are kept.
    pub async fn stop(&self, id: &str) -> Result<SessionSnapshot, SessionError> {
        validate_session_id(id)?;
        if let Some(runtime) = self.loaded(id).await {
            runtime.stop().await;
        } else if self.deps.db.get_session(id).await?.is_some() {
            self.deps
                .db
                .update_session_status(id, SessionStatus::Disconnected, None, None)
                .await?;
        } else {
            return Err(SessionError::NotFound(id.to_string()));
        }
        info!(session = %id, "Session stopped");
        self.get_state(id).await
    }

    /// Disconnect and wipe credentials; the next start pairs again.
    pub async fn logout(&self, id: &str) -> Result<SessionSnapshot, SessionError> {
        let runtime = self.known(id).await?;
        runtime.logout().await;
        info!(session = %id, "Session logged out");
        self.get_state(id).await
    }

    /// Log out, drop the runtime and remove every persisted row of the
    /// session.
    pub async fn delete(&self, id: &str) -> Result<(), SessionError> {
        let runtime = self.known(id).await?;
        runtime.logout().await;
        self.sessions.write().await.remove(id);
        self.deps.db.delete_session(id).await?;
        let _ = self.deps.events.send(SessionEvent::Removed {
            session_id: id.to_string(),
        });
        info!(session = %id, "Session deleted");
        Ok(())
    }

    pub async fn get_state(&self, id: &str) -> Result<SessionSnapshot, SessionError> {
        validate_session_id(id)?;
        let runtime = self.loaded(id).await;
        let record = self.deps.db.get_session(id).await?;
        if runtime.is_none() && record.is_none() {
            return Err(SessionError::NotFound(id.to_string()));
        }
        Ok(snapshot(id, runtime.as_deref(), record.as_ref()))
    }

    /// Every persisted session, with live status where a runtime is loaded.
    pub async fn list_all(&self) -> Result<Vec<SessionSnapshot>, SessionError> {
        let records = self.deps.db.list_sessions().await?;
        let sessions = self.sessions.read().await;
        let mut out: Vec<SessionSnapshot> = records
            .iter()
            .map(|r| snapshot(&r.id, sessions.get(&r.id).map(Arc::as_ref), Some(r)))
            .collect();
        for (id, runtime) in sessions.iter() {
            if !records.iter().any(|r| &r.id == id) {
                out.push(snapshot(id, Some(runtime), None));
            }
        }
        out.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(out)
    }

    /// Close every connection for process exit. Persisted statuses are
    /// kept so `restore_sessions` can bring them back.
    pub async fn shutdown_all(&self) {
        let runtimes: Vec<Arc<SessionRuntime>> =
            self.sessions.write().await.drain().map(|(_, r)| r).collect();
        let count = runtimes.len();
        futures::future::join_all(runtimes.iter().map(|r| r.release())).await;
        info!(sessions = count, "All sessions shut down");
    }

    /// Restart every session that was connected (or reconnecting) when the
    /// process last stopped. Returns how many were started.
    pub async fn restore_sessions(&self) -> Result<usize, SessionError> {
        let records = self.deps.db.list_sessions().await?;
        let mut restored = 0;
        for record in records {
            if !matches!(record.status, SessionStatus::Connected | SessionStatus::Connecting) {
                continue;
            }
            match self.start(&record.id).await {
                Ok(_) => restored += 1,
                Err(e) => warn!(session = %record.id, "Failed to restore session: {e}"),
            }
        }
        info!(restored, "Sessions restored");
        Ok(restored)
    }

    /// Drop cached trigger sets in every session. Returns the number of
    /// sessions notified.
    pub async fn reload_triggers(&self) -> usize {
        let sessions = self.sessions.read().await;
        for runtime in sessions.values() {
            runtime.reload_triggers();
        }
        info!(sessions = sessions.len(), "Trigger reload broadcast");
        sessions.len()
    }

    /// Drop the cached prompt configuration; all sessions share it.
    pub async fn reload_prompt_config(&self) {
        self.deps.prompts.invalidate().await;
        info!("Prompt configuration reload broadcast");
    }

    pub async fn start_sequence(
        &self,
        id: &str,
        phone: &str,
        trigger: &str,
    ) -> Result<SequenceHandle, SessionError> {
        let runtime = self.known(id).await?;
        runtime.start_sequence(phone, trigger).await
    }

    pub async fn schedule_message(
        &self,
        id: &str,
        phone: &str,
        text: &str,
        send_at: DateTime<Utc>,
    ) -> Result<AgendaItem, SessionError> {
        let runtime = self.known(id).await?;
        runtime.schedule_message(phone, text, send_at).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sequence::SequenceOutcome;
    use crate::store::LibSqlBackend;
    use crate::testing::{MockFactory, StubLlm};
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    async fn manager() -> (SessionManager, Arc<MockFactory>, Arc<dyn Database>) {
        let db: Arc<dyn Database> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let factory = Arc::new(MockFactory::default());
        let mut config = EngineConfig::default();
        config.outbound.min_send_delay = Duration::ZERO;
        config.sequence.startup_delay = Duration::ZERO;
        let manager = SessionManager::new(
            Arc::clone(&db),
            StubLlm::fixed("{}"),
            factory.clone(),
            config,
        );
        (manager, factory, db)
    }

    async fn wait_connected(manager: &SessionManager, id: &str) {
        for _ in 0..400 {
            if manager.get_state(id).await.unwrap().status == SessionStatus::Connected {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("session {id} never connected");
    }

    #[test]
    fn session_ids_are_validated() {
        assert!(validate_session_id("tenant-1_a").is_ok());
        assert!(validate_session_id("").is_err());
        assert!(validate_session_id("../etc").is_err());
        assert!(validate_session_id(&"x".repeat(65)).is_err());
    }

    #[tokio::test]
    async fn start_reuses_runtime_and_connects_once() {
        let (manager, factory, _) = manager().await;
        let mut events = manager.subscribe();
        manager.start("t1").await.unwrap();
        manager.start("t1").await.unwrap();
        wait_connected(&manager, "t1").await;

        let transport = factory.get("t1").unwrap();
        assert_eq!(transport.connects.load(Ordering::SeqCst), 1);

        let state = manager.get_state("t1").await.unwrap();
        assert!(state.loaded);
        assert_eq!(state.phone.as_deref(), Some("5215559999"));

        let mut statuses = Vec::new();
        while let Ok(SessionEvent::Status { status, .. }) = events.try_recv() {
            statuses.push(status);
        }
        assert!(statuses.contains(&SessionStatus::Connected));
    }

    #[tokio::test]
    async fn unknown_sessions_are_not_found() {
        let (manager, _, _) = manager().await;
        assert!(matches!(manager.get_state("nope").await, Err(SessionError::NotFound(_))));
        assert!(matches!(manager.stop("nope").await, Err(SessionError::NotFound(_))));
        assert!(matches!(manager.logout("nope").await, Err(SessionError::NotFound(_))));
        assert!(matches!(manager.delete("nope").await, Err(SessionError::NotFound(_))));
        assert!(matches!(manager.start("bad id").await, Err(SessionError::InvalidId(_))));
    }

    #[tokio::test]
    async fn stop_logout_and_delete() {
        let (manager, factory, db) = manager().await;
        manager.start("t1").await.unwrap();
        wait_connected(&manager, "t1").await;
        let transport = factory.get("t1").unwrap();

        let state = manager.stop("t1").await.unwrap();
        assert_eq!(state.status, SessionStatus::Disconnected);
        assert_eq!(transport.wipes.load(Ordering::SeqCst), 0);

        manager.logout("t1").await.unwrap();
        assert_eq!(transport.wipes.load(Ordering::SeqCst), 1);

        manager.delete("t1").await.unwrap();
        assert!(db.get_session("t1").await.unwrap().is_none());
        assert!(manager.list_all().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn shutdown_keeps_status_for_restore() {
        let (manager, factory, db) = manager().await;
        manager.start("t1").await.unwrap();
        manager.start("t2").await.unwrap();
        wait_connected(&manager, "t1").await;
        wait_connected(&manager, "t2").await;
        manager.stop("t2").await.unwrap();

        manager.shutdown_all().await;
        assert_eq!(factory.get("t1").unwrap().disconnects.load(Ordering::SeqCst), 1);
        let listed = manager.list_all().await.unwrap();
        assert_eq!(listed.len(), 2);
        assert!(listed.iter().all(|s| !s.loaded));

        // A fresh process over the same database.
        let factory = Arc::new(MockFactory::default());
        let restarted =
            SessionManager::new(db, StubLlm::fixed("{}"), factory.clone(), EngineConfig::default());
        assert_eq!(restarted.restore_sessions().await.unwrap(), 1);
        wait_connected(&restarted, "t1").await;
        assert!(factory.get("t2").is_none());
    }

    #[tokio::test]
    async fn manual_sequence_and_agenda_go_through_the_session() {
        let (manager, factory, db) = manager().await;
        let seq = db.upsert_sequence("promo", true).await.unwrap();
        db.replace_sequence_steps(seq, &["Oferta".to_string()]).await.unwrap();
        manager.start("t1").await.unwrap();
        wait_connected(&manager, "t1").await;

        let handle = manager.start_sequence("t1", "5215550001", "promo").await.unwrap();
        assert_eq!(handle.wait().await, SequenceOutcome::Completed);
        let transport = factory.get("t1").unwrap();
        assert_eq!(
            transport.sent_texts(),
            vec![("5215550001".to_string(), "Oferta".to_string())]
        );

        let item = manager
            .schedule_message(
                "t1",
                "5215550002",
                "Recordatorio",
                Utc::now() + chrono::Duration::hours(1),
            )
            .await
            .unwrap();
        assert_eq!(item.session_id, "t1");

        manager.reload_prompt_config().await;
        assert_eq!(manager.reload_triggers().await, 1);
    }
}
