//! Outbound sender shared by the sequence engine, the conversation engine
//! and the agenda loop.
//!
//! Sends to one contact are serialized and spaced by a minimum delay; sends
//! to different contacts run concurrently.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use serde_json::json;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::activity::ActivityTracker;
use crate::config::OutboundConfig;
use crate::connection::MessageCache;
use crate::dedup::DedupStore;
use crate::error::TransportError;
use crate::outbox::{OutboxOp, OutboxQueue};
use crate::store::{Direction, NewMessage};
use crate::transport::Transport;

type ContactLock = Arc<tokio::sync::Mutex<()>>;

pub struct OutboundSender {
    session_id: String,
    transport: Arc<dyn Transport>,
    cache: Arc<MessageCache>,
    activity: Arc<ActivityTracker>,
    outbox: Arc<OutboxQueue>,
    config: OutboundConfig,
    seen: Option<Arc<DedupStore>>,
    locks: Mutex<HashMap<String, ContactLock>>,
}

impl OutboundSender {
    pub fn new(
        session_id: &str,
        transport: Arc<dyn Transport>,
        cache: Arc<MessageCache>,
        activity: Arc<ActivityTracker>,
        outbox: Arc<OutboxQueue>,
        config: OutboundConfig,
    ) -> Self {
        Self {
            session_id: session_id.to_string(),
            transport,
            cache,
            activity,
            outbox,
            config,
            seen: None,
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// Mark delivery ids as seen so the transport's echo of our own sends
    /// is not logged twice.
    pub fn with_dedup(mut self, seen: Arc<DedupStore>) -> Self {
        self.seen = Some(seen);
        self
    }

    fn contact_lock(&self, phone: &str) -> ContactLock {
        let mut locks = self.locks.lock().unwrap_or_else(|p| p.into_inner());
        Arc::clone(locks.entry(phone.to_string()).or_default())
    }

    fn release(&self, phone: &str, lock: ContactLock) {
        let mut locks = self.locks.lock().unwrap_or_else(|p| p.into_inner());
        // The map holds one reference and `lock` the other: nobody is waiting.
        if Arc::strong_count(&lock) == 2 {
            locks.remove(phone);
        }
    }

    /// Send `text` to `phone`. Returns the delivery id reported by the
    /// transport.
    pub async fn send_text(
        &self,
        phone: &str,
        text: &str,
    ) -> Result<Option<String>, TransportError> {
        let lock = self.contact_lock(phone);
        let result = {
            let _turn = lock.lock().await;
            let result = self.deliver(phone, text).await;
            tokio::time::sleep(self.config.min_send_delay).await;
            result
        };
        self.release(phone, lock);
        result
    }

    async fn deliver(&self, phone: &str, text: &str) -> Result<Option<String>, TransportError> {
        let delivery_id = self.transport.send_text(phone, text).await?;
        let now = Utc::now();
        self.activity.record_outbound(phone, now);
        if let (Some(seen), Some(id)) = (&self.seen, &delivery_id) {
            seen.add(id);
        }

        let key = delivery_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        self.cache
            .insert(&key, json!({ "id": key, "to": phone, "text": text }));

        let op = OutboxOp::LogMessage(NewMessage {
            session_id: self.session_id.clone(),
            phone: phone.to_string(),
            push_name: None,
            direction: Direction::Outbound,
            text: text.to_string(),
            external_id: delivery_id.clone(),
            at: now,
        });
        match self.outbox.enqueue(&format!("out:{key}"), &op).await {
            Ok(true) => {}
            Ok(false) => debug!(
                session = %self.session_id,
                id = %key,
                "Outbound log already queued"
            ),
            Err(e) => warn!(
                session = %self.session_id,
                phone = %phone,
                "Failed to queue outbound log: {e}"
            ),
        }

        info!(session = %self.session_id, phone = %phone, chars = text.len(), "Message sent");
        Ok(delivery_id)
    }
}
