//! Durable at-least-once queue for message side-effects.
//!
//! Items are keyed by an idempotency key unique per session. Failed items
//! back off exponentially (`base * 2^min(attempts, 6)`) and are dropped
//! once they reach the attempt cap.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, warn};

use crate::config::OutboxConfig;
use crate::error::{DatabaseError, Error};
use crate::store::{Database, NewMessage, OutboxItem};
use crate::ticker::InFlight;

/// Exponent cap for the backoff.
const MAX_BACKOFF_EXPONENT: u32 = 6;

/// A queued side-effect.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", content = "payload", rename_all = "snake_case")]
pub enum OutboxOp {
    /// Persist a message to the log, creating the contact if needed.
    LogMessage(NewMessage),
}

impl OutboxOp {
    pub fn op_type(&self) -> &'static str {
        match self {
            Self::LogMessage(_) => "log_message",
        }
    }
}

/// Executes queued operations.
#[async_trait]
pub trait OutboxHandler: Send + Sync {
    async fn handle(&self, op: &OutboxOp) -> Result<(), Error>;
}

/// Default handler: writes logged messages to the repository.
pub struct MessageLogger {
    db: Arc<dyn Database>,
}

impl MessageLogger {
    pub fn new(db: Arc<dyn Database>) -> Self {
        Self { db }
    }
}

#[async_trait]
impl OutboxHandler for MessageLogger {
    async fn handle(&self, op: &OutboxOp) -> Result<(), Error> {
        match op {
            OutboxOp::LogMessage(msg) => {
                let contact = self
                    .db
                    .find_or_create_contact(&msg.phone, msg.push_name.as_deref())
                    .await?;
                self.db.insert_message(contact.id, msg).await?;
                Ok(())
            }
        }
    }
}

/// Result of one flush pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FlushStats {
    pub completed: usize,
    pub retried: usize,
    pub dropped: usize,
}

pub struct OutboxQueue {
    session_id: String,
    db: Arc<dyn Database>,
    config: OutboxConfig,
    handler: Arc<dyn OutboxHandler>,
    flushing: InFlight,
}

impl OutboxQueue {
    pub fn new(
        session_id: &str,
        db: Arc<dyn Database>,
        config: OutboxConfig,
        handler: Arc<dyn OutboxHandler>,
    ) -> Self {
        Self {
            session_id: session_id.to_string(),
            db,
            config,
            handler,
            flushing: InFlight::new(),
        }
    }

    /// Insert an item. Returns `false` when the key is already queued.
    pub async fn add(&self, idempotency_key: &str, op: &OutboxOp) -> Result<bool, DatabaseError> {
        let payload =
            serde_json::to_string(op).map_err(|e| DatabaseError::Serialization(e.to_string()))?;
        self.db
            .insert_outbox_item(&self.session_id, idempotency_key, op.op_type(), &payload)
            .await
    }

    /// Add an item and, while the queue is shallow, flush right away.
    pub async fn enqueue(
        self: &Arc<Self>,
        idempotency_key: &str,
        op: &OutboxOp,
    ) -> Result<bool, DatabaseError> {
        let added = self.add(idempotency_key, op).await?;
        if added && self.depth().await? <= self.config.immediate_flush_depth {
            let queue = Arc::clone(self);
            tokio::spawn(async move {
                queue.flush().await;
            });
        }
        Ok(added)
    }

    pub async fn get_pending(&self, limit: usize) -> Result<Vec<OutboxItem>, DatabaseError> {
        self.db
            .pending_outbox_items(&self.session_id, Utc::now(), limit)
            .await
    }

    pub async fn complete(&self, id: i64) -> Result<(), DatabaseError> {
        self.db.delete_outbox_item(id).await
    }

    /// Record a failed attempt. `attempts` is the count including this
    /// failure. Returns `true` when the item was dropped for good.
    pub async fn mark_failed(&self, id: i64, attempts: u32) -> Result<bool, DatabaseError> {
        if attempts >= self.config.max_attempts {
            self.db.delete_outbox_item(id).await?;
            return Ok(true);
        }
        let delay = self.backoff(attempts);
        let next =
            Utc::now() + chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::zero());
        self.db.reschedule_outbox_item(id, attempts, next).await?;
        Ok(false)
    }

    pub fn backoff(&self, attempts: u32) -> Duration {
        self.config.base_delay * 2u32.pow(attempts.min(MAX_BACKOFF_EXPONENT))
    }

    pub async fn depth(&self) -> Result<usize, DatabaseError> {
        self.db.count_outbox_items(&self.session_id).await
    }

    /// Process one batch of due items. A concurrent call returns immediately.
    pub async fn flush(&self) -> FlushStats {
        let mut stats = FlushStats::default();
        let Some(_guard) = self.flushing.try_enter() else {
            return stats;
        };

        let items = match self.get_pending(self.config.batch_size).await {
            Ok(items) => items,
            Err(e) => {
                warn!(session = %self.session_id, "Outbox read failed: {e}");
                return stats;
            }
        };

        for item in items {
            let result = match serde_json::from_str::<OutboxOp>(&item.payload) {
                Ok(op) => self.handler.handle(&op).await,
                Err(e) => {
                    error!(
                        session = %self.session_id,
                        key = %item.idempotency_key,
                        op_type = %item.op_type,
                        "Dropping undecodable outbox item: {e}"
                    );
                    if let Err(e) = self.complete(item.id).await {
                        warn!(session = %self.session_id, "Outbox delete failed: {e}");
                    }
                    stats.dropped += 1;
                    continue;
                }
            };

            match result {
                Ok(()) => match self.complete(item.id).await {
                    Ok(()) => stats.completed += 1,
                    Err(e) => warn!(session = %self.session_id, "Outbox delete failed: {e}"),
                },
                Err(e) => {
                    let attempts = item.attempts + 1;
                    match self.mark_failed(item.id, attempts).await {
                        Ok(true) => {
                            error!(
                                session = %self.session_id,
                                key = %item.idempotency_key,
                                attempts,
                                "Outbox item dropped after max attempts: {e}"
                            );
                            stats.dropped += 1;
                        }
                        Ok(false) => {
                            debug!(
                                session = %self.session_id,
                                key = %item.idempotency_key,
                                attempts,
                                "Outbox item failed, will retry: {e}"
                            );
                            stats.retried += 1;
                        }
                        Err(db_err) => {
                            warn!(session = %self.session_id, "Outbox reschedule failed: {db_err}");
                        }
                    }
                }
            }
        }

        if stats != FlushStats::default() {
            debug!(session = %self.session_id, ?stats, "Outbox flushed");
        }
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TransportError;
    use crate::store::{Direction, LibSqlBackend};
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    struct FlakyHandler {
        fail: AtomicBool,
        calls: AtomicUsize,
        delay: Duration,
    }

    impl FlakyHandler {
        fn new(fail: bool) -> Self {
            Self {
                fail: AtomicBool::new(fail),
                calls: AtomicUsize::new(0),
                delay: Duration::ZERO,
            }
        }
    }

    #[async_trait]
    impl OutboxHandler for FlakyHandler {
        async fn handle(&self, _op: &OutboxOp) -> Result<(), Error> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            if self.fail.load(Ordering::SeqCst) {
                Err(TransportError::Http("down".into()).into())
            } else {
                Ok(())
            }
        }
    }

    fn op(text: &str) -> OutboxOp {
        OutboxOp::LogMessage(NewMessage {
            session_id: "s1".into(),
            phone: "5215550001".into(),
            push_name: Some("Ana".into()),
            direction: Direction::Inbound,
            text: text.into(),
            external_id: Some("M1".into()),
            at: Utc::now(),
        })
    }

    fn config() -> OutboxConfig {
        OutboxConfig {
            base_delay: Duration::ZERO,
            max_attempts: 3,
            ..OutboxConfig::default()
        }
    }

    async fn queue_with(
        handler: Arc<dyn OutboxHandler>,
        config: OutboxConfig,
    ) -> (Arc<OutboxQueue>, Arc<dyn Database>) {
        let db: Arc<dyn Database> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let queue = Arc::new(OutboxQueue::new("s1", Arc::clone(&db), config, handler));
        (queue, db)
    }

    #[tokio::test]
    async fn duplicate_key_is_silent_noop() {
        let (queue, _) = queue_with(Arc::new(FlakyHandler::new(false)), config()).await;
        assert!(queue.add("k1", &op("hola")).await.unwrap());
        assert!(!queue.add("k1", &op("hola")).await.unwrap());
        assert_eq!(queue.depth().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn attempts_increase_until_dropped() {
        let handler = Arc::new(FlakyHandler::new(true));
        let (queue, db) = queue_with(handler.clone(), config()).await;
        queue.add("k1", &op("hola")).await.unwrap();

        let s = queue.flush().await;
        assert_eq!(s.retried, 1);
        let soon = Utc::now() + chrono::Duration::seconds(1);
        let items = db.pending_outbox_items("s1", soon, 10).await.unwrap();
        assert_eq!(items[0].attempts, 1);

        queue.flush().await;
        let soon = Utc::now() + chrono::Duration::seconds(1);
        let items = db.pending_outbox_items("s1", soon, 10).await.unwrap();
        assert_eq!(items[0].attempts, 2);

        let s = queue.flush().await;
        assert_eq!(s.dropped, 1);
        assert_eq!(queue.depth().await.unwrap(), 0);
        assert_eq!(handler.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn success_completes_item() {
        let (queue, _) = queue_with(Arc::new(FlakyHandler::new(false)), config()).await;
        queue.add("k1", &op("hola")).await.unwrap();
        let s = queue.flush().await;
        assert_eq!(s.completed, 1);
        assert_eq!(queue.depth().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn failed_item_waits_for_backoff() {
        let cfg = OutboxConfig {
            base_delay: Duration::from_secs(60),
            ..config()
        };
        let (queue, _) = queue_with(Arc::new(FlakyHandler::new(true)), cfg).await;
        queue.add("k1", &op("hola")).await.unwrap();
        queue.flush().await;
        assert!(queue.get_pending(10).await.unwrap().is_empty());
        assert_eq!(queue.depth().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn backoff_doubles_and_caps() {
        let cfg = OutboxConfig {
            base_delay: Duration::from_secs(2),
            ..OutboxConfig::default()
        };
        let (queue, _) = queue_with(Arc::new(FlakyHandler::new(false)), cfg).await;
        assert_eq!(queue.backoff(0), Duration::from_secs(2));
        assert_eq!(queue.backoff(1), Duration::from_secs(4));
        assert_eq!(queue.backoff(6), Duration::from_secs(128));
        assert_eq!(queue.backoff(20), Duration::from_secs(128));
    }

    #[tokio::test]
    async fn concurrent_flush_returns_immediately() {
        let handler = Arc::new(FlakyHandler {
            delay: Duration::from_millis(200),
            ..FlakyHandler::new(false)
        });
        let (queue, _) = queue_with(handler.clone(), config()).await;
        queue.add("k1", &op("hola")).await.unwrap();

        let q = Arc::clone(&queue);
        let first = tokio::spawn(async move { q.flush().await });
        tokio::time::sleep(Duration::from_millis(50)).await;
        let second = queue.flush().await;
        assert_eq!(second, FlushStats::default());

        assert_eq!(first.await.unwrap().completed, 1);
        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn message_logger_persists_contact_and_message() {
        let db: Arc<dyn Database> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let queue = Arc::new(OutboxQueue::new(
            "s1",
            Arc::clone(&db),
            config(),
            Arc::new(MessageLogger::new(Arc::clone(&db))),
        ));
        queue.add("k1", &op("hola")).await.unwrap();
        assert_eq!(queue.flush().await.completed, 1);

        let contact = db.find_contact("5215550001").await.unwrap().unwrap();
        assert_eq!(contact.name.as_deref(), Some("Ana"));
        let msgs = db.recent_messages("s1", "5215550001", 5).await.unwrap();
        assert_eq!(msgs[0].text, "hola");
        assert_eq!(msgs[0].external_id.as_deref(), Some("M1"));
    }
}
