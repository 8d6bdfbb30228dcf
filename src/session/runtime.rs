//! The component graph of one tenant session.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::activity::ActivityTracker;
use crate::agenda::AgendaRunner;
use crate::config::EngineConfig;
use crate::connection::{ConnectionManager, LinkObserver, MessageCache};
use crate::conversation::{ConversationEngine, PromptConfigStore};
use crate::dedup::DedupStore;
use crate::error::SessionError;
use crate::llm::LlmProvider;
use crate::outbound::OutboundSender;
use crate::outbox::{MessageLogger, OutboxQueue};
use crate::sequence::{NameAndRecencyPolicy, SequenceEngine, SequenceHandle};
use crate::session::pipeline::InboundPipeline;
use crate::store::{AgendaItem, Database, SessionStatus};
use crate::ticker::spawn_ticker;
use crate::transport::{RawEnvelope, TransportFactory, canonical_phone};

/// Period of the conversation sweep.
const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Contacts tracked in memory for silence gating.
const MAX_TRACKED_CONTACTS: usize = 5000;

/// Lifecycle notifications fanned out to subscribers.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionEvent {
    Status {
        session_id: String,
        status: SessionStatus,
        #[serde(skip_serializing_if = "Option::is_none")]
        qr: Option<String>,
    },
    Removed {
        session_id: String,
    },
}

/// Engine-wide dependencies shared by every session.
#[derive(Clone)]
pub struct EngineDeps {
    pub db: Arc<dyn Database>,
    pub llm: Arc<dyn LlmProvider>,
    pub transports: Arc<dyn TransportFactory>,
    pub prompts: Arc<PromptConfigStore>,
    pub config: EngineConfig,
    pub events: broadcast::Sender<SessionEvent>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|p| p.into_inner())
}

/// Connection observer: owns the background loops and routes inbound
/// batches into the pipeline.
struct SessionHooks {
    session_id: String,
    config: EngineConfig,
    outbox: Arc<OutboxQueue>,
    agenda: Arc<AgendaRunner>,
    sequence: Arc<SequenceEngine>,
    conversation: Arc<ConversationEngine>,
    pipeline: InboundPipeline,
    events: broadcast::Sender<SessionEvent>,
    loops: Mutex<Vec<JoinHandle<()>>>,
}

impl SessionHooks {
    fn start_loops(&self) {
        self.stop_loops();
        let id = self.session_id.clone();

        let outbox = Arc::clone(&self.outbox);
        let period = self.config.outbox.flush_interval;
        let flush = spawn_ticker("outbox_flush", id.clone(), period, move || {
            let outbox = Arc::clone(&outbox);
            async move {
                outbox.flush().await;
            }
        });

        let agenda = Arc::clone(&self.agenda);
        let period = self.config.agenda.poll_interval;
        let agenda_loop = spawn_ticker("agenda", id.clone(), period, move || {
            let agenda = Arc::clone(&agenda);
            async move {
                agenda.run_due().await;
            }
        });

        let sequence = Arc::clone(&self.sequence);
        let period = self.config.sequence.poll_interval;
        let poll = spawn_ticker("sequence_poll", id.clone(), period, move || {
            let sequence = Arc::clone(&sequence);
            async move {
                sequence.poll().await;
            }
        });

        let conversation = Arc::clone(&self.conversation);
        let sweep = spawn_ticker("conversation_sweep", id, SWEEP_INTERVAL, move || {
            let conversation = Arc::clone(&conversation);
            async move {
                conversation.sweep().await;
            }
        });

        lock(&self.loops).extend([flush, agenda_loop, poll, sweep]);
    }

    fn stop_loops(&self) {
        for handle in lock(&self.loops).drain(..) {
            handle.abort();
        }
    }

    fn loops_running(&self) -> usize {
        lock(&self.loops).iter().filter(|h| !h.is_finished()).count()
    }
}

#[async_trait]
impl LinkObserver for SessionHooks {
    async fn on_status(&self, status: SessionStatus, qr: Option<String>) {
        // No subscribers is fine.
        let _ = self.events.send(SessionEvent::Status {
            session_id: self.session_id.clone(),
            status,
            qr,
        });
    }

    async fn on_connected(&self) {
        self.start_loops();
        debug!(session = %self.session_id, "Background loops started");
    }

    async fn on_disconnected(&self) {
        self.stop_loops();
        self.sequence.cancel_all();
        self.conversation.cancel_all();
        debug!(session = %self.session_id, "Background work cancelled");
    }

    async fn on_messages(&self, batch: Vec<RawEnvelope>) {
        let routed = self.pipeline.process(batch).await;
        debug!(session = %self.session_id, count = routed.len(), "Inbound batch processed");
    }
}

pub struct SessionRuntime {
    id: String,
    connection: Arc<ConnectionManager>,
    hooks: Arc<SessionHooks>,
    sequence: Arc<SequenceEngine>,
    conversation: Arc<ConversationEngine>,
    agenda: Arc<AgendaRunner>,
}

impl SessionRuntime {
    /// Wire up every component for `id`. Nothing connects until `start`.
    pub async fn build(id: &str, deps: &EngineDeps) -> Result<Arc<Self>, SessionError> {
        let config = &deps.config;
        let db = Arc::clone(&deps.db);
        let transport = deps.transports.create(id);

        let cache = Arc::new(MessageCache::new(config.reconnect.message_cache_size));
        let dedup = Arc::new(DedupStore::load(id, Arc::clone(&db), &config.dedup).await?);
        let outbox = Arc::new(OutboxQueue::new(
            id,
            Arc::clone(&db),
            config.outbox.clone(),
            Arc::new(MessageLogger::new(Arc::clone(&db))),
        ));
        let activity = Arc::new(ActivityTracker::new(MAX_TRACKED_CONTACTS));
        let sender = Arc::new(
            OutboundSender::new(
                id,
                Arc::clone(&transport),
                Arc::clone(&cache),
                Arc::clone(&activity),
                Arc::clone(&outbox),
                config.outbound.clone(),
            )
            .with_dedup(Arc::clone(&dedup)),
        );
        let sequence = Arc::new(SequenceEngine::new(
            id,
            Arc::clone(&db),
            Arc::clone(&sender),
            Arc::clone(&activity),
            Arc::new(NameAndRecencyPolicy::from_config(&config.sequence)),
            config.sequence.clone(),
        ));
        let conversation = Arc::new(ConversationEngine::new(
            id,
            Arc::clone(&db),
            Arc::clone(&deps.llm),
            Arc::clone(&sender),
            Arc::clone(&deps.prompts),
            config.conversation.clone(),
        ));
        let agenda = Arc::new(AgendaRunner::new(
            id,
            Arc::clone(&db),
            sender,
            config.agenda.clone(),
        ));
        let pipeline = InboundPipeline::new(
            id,
            Arc::clone(&db),
            dedup,
            Arc::clone(&outbox),
            activity,
            Arc::clone(&sequence),
            Arc::clone(&conversation),
        );

        let hooks = Arc::new(SessionHooks {
            session_id: id.to_string(),
            config: config.clone(),
            outbox,
            agenda: Arc::clone(&agenda),
            sequence: Arc::clone(&sequence),
            conversation: Arc::clone(&conversation),
            pipeline,
            events: deps.events.clone(),
            loops: Mutex::new(Vec::new()),
        });
        let connection = ConnectionManager::new(
            id,
            transport,
            db,
            config.reconnect.clone(),
            cache,
            Arc::clone(&hooks) as Arc<dyn LinkObserver>,
        );

        info!(session = %id, "Session runtime created");
        Ok(Arc::new(Self {
            id: id.to_string(),
            connection,
            hooks,
            sequence,
            conversation,
            agenda,
        }))
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn status(&self) -> SessionStatus {
        self.connection.status()
    }

    /// Own phone once connected.
    pub fn phone(&self) -> Option<String> {
        self.connection.self_id().and_then(|id| canonical_phone(&id))
    }

    pub fn active_conversations(&self) -> usize {
        self.conversation.active_count()
    }

    pub fn loops_running(&self) -> usize {
        self.hooks.loops_running()
    }

    pub async fn start(&self) -> Result<(), SessionError> {
        self.connection.initialize().await?;
        Ok(())
    }

    pub async fn stop(&self) {
        self.connection.stop().await;
    }

    pub async fn logout(&self) {
        self.connection.logout().await;
    }

    /// Close for process exit, leaving the persisted status untouched.
    pub async fn release(&self) {
        self.connection.release().await;
    }

    pub fn reload_triggers(&self) {
        self.sequence.reload_triggers();
    }

    pub async fn start_sequence(
        &self,
        phone: &str,
        trigger: &str,
    ) -> Result<SequenceHandle, SessionError> {
        let phone = canonical_phone(phone).ok_or_else(|| SessionError::InvalidRecipient {
            phone: phone.to_string(),
        })?;
        self.sequence.start_manual(&phone, trigger).await
    }

    pub async fn schedule_message(
        &self,
        phone: &str,
        text: &str,
        send_at: DateTime<Utc>,
    ) -> Result<AgendaItem, SessionError> {
        self.agenda.schedule(phone, text, send_at).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::LibSqlBackend;
    use crate::testing::{MockFactory, StubLlm, wait_until};
    use crate::transport::{MessageContent, TransportEvent};
    use std::sync::atomic::Ordering;

    async fn deps(factory: Arc<MockFactory>, llm: Arc<StubLlm>) -> EngineDeps {
        let db: Arc<dyn Database> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let mut config = EngineConfig::default();
        config.outbound.min_send_delay = Duration::ZERO;
        config.sequence.startup_delay = Duration::ZERO;
        let (events, _) = broadcast::channel(16);
        EngineDeps {
            prompts: Arc::new(PromptConfigStore::new(Arc::clone(&db), Duration::from_secs(60))),
            db,
            llm,
            transports: factory,
            config,
            events,
        }
    }

    #[tokio::test]
    async fn connect_starts_loops_and_stop_cancels_them() {
        let factory = Arc::new(MockFactory::default());
        let deps = deps(Arc::clone(&factory), StubLlm::fixed("{}")).await;
        let mut events = deps.events.subscribe();
        let runtime = SessionRuntime::build("s1", &deps).await.unwrap();

        runtime.start().await.unwrap();
        wait_until(|| runtime.status() == SessionStatus::Connected).await;
        wait_until(|| runtime.loops_running() == 4).await;
        assert_eq!(runtime.phone().as_deref(), Some("5215559999"));

        let mut seen = Vec::new();
        while let Ok(event) = events.try_recv() {
            seen.push(event);
        }
        assert!(seen.contains(&SessionEvent::Status {
            session_id: "s1".into(),
            status: SessionStatus::Connected,
            qr: None,
        }));

        runtime.stop().await;
        assert_eq!(runtime.loops_running(), 0);
        assert_eq!(runtime.status(), SessionStatus::Disconnected);
        let transport = factory.get("s1").unwrap();
        assert_eq!(transport.disconnects.load(Ordering::SeqCst), 1);
        assert_eq!(transport.wipes.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn inbound_messages_flow_into_the_engines() {
        let factory = Arc::new(MockFactory::default());
        let llm = StubLlm::fixed(r#"{"start": false, "reason": "spam"}"#);
        let deps = deps(Arc::clone(&factory), llm.clone()).await;
        let runtime = SessionRuntime::build("s1", &deps).await.unwrap();
        runtime.start().await.unwrap();
        wait_until(|| runtime.status() == SessionStatus::Connected).await;

        let transport = factory.get("s1").unwrap();
        transport.emit(TransportEvent::Messages(vec![RawEnvelope {
            id: "IN1".into(),
            remote: "5215550001@s.whatsapp.net".into(),
            from_me: false,
            push_name: Some("Ana".into()),
            timestamp: None,
            content: Some(MessageContent::text("me vendes seguros?")),
            raw: serde_json::json!({"id": "IN1"}),
        }]));

        wait_until(|| llm.calls() == 1).await;
        for _ in 0..200 {
            if !deps.db.list_ignored(Utc::now()).await.unwrap().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(deps.db.list_ignored(Utc::now()).await.unwrap().len(), 1);
        runtime.stop().await;
    }

    #[tokio::test]
    async fn manual_sequence_rejects_bad_phone_and_unknown_trigger() {
        let factory = Arc::new(MockFactory::default());
        let deps = deps(factory, StubLlm::fixed("{}")).await;
        let runtime = SessionRuntime::build("s1", &deps).await.unwrap();

        let err = runtime.start_sequence("123", "hola").await.unwrap_err();
        assert!(matches!(err, SessionError::InvalidRecipient { .. }));
        let err = runtime.start_sequence("5215550001", "nada").await.unwrap_err();
        assert!(matches!(err, SessionError::UnknownSequence { .. }));
    }
}
