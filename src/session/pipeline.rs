//! Inbound message routing for one session.
//!
//! Flow per envelope, in delivery order:
//! 1. Address → canonical phone (groups and broadcasts are dropped)
//! 2. Dedup by message id
//! 3. Log through the outbox
//! 4. Sequence trigger check
//! 5. Conversational engine, unless a sequence owns the contact

use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};
use tracing::{debug, info, warn};

use crate::activity::ActivityTracker;
use crate::conversation::ConversationEngine;
use crate::dedup::DedupStore;
use crate::outbox::{OutboxOp, OutboxQueue};
use crate::sequence::SequenceEngine;
use crate::store::{Database, Direction, NewMessage};
use crate::transport::{DecodeOutcome, RawEnvelope, canonical_phone};

/// What happened to one envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Routed {
    Skipped(&'static str),
    /// Logged only.
    Logged,
    /// A sequence was started for the contact.
    Sequence(String),
    /// A running sequence owns the contact; the conversational engine was
    /// not consulted.
    SequenceRunning,
    Conversation,
}

pub struct InboundPipeline {
    session_id: String,
    db: Arc<dyn Database>,
    dedup: Arc<DedupStore>,
    outbox: Arc<OutboxQueue>,
    activity: Arc<ActivityTracker>,
    sequence: Arc<SequenceEngine>,
    conversation: Arc<ConversationEngine>,
}

fn envelope_time(envelope: &RawEnvelope) -> DateTime<Utc> {
    envelope
        .timestamp
        .and_then(|secs| Utc.timestamp_opt(secs, 0).single())
        .unwrap_or_else(Utc::now)
}

/// When the engine saw the message. Transport timestamps have whole-second
/// resolution while our own sends are stamped to the microsecond, so a
/// reply in the same second must not sort before the message it answers.
fn received_at(envelope: &RawEnvelope) -> DateTime<Utc> {
    envelope_time(envelope).max(Utc::now())
}

impl InboundPipeline {
    pub fn new(
        session_id: &str,
        db: Arc<dyn Database>,
        dedup: Arc<DedupStore>,
        outbox: Arc<OutboxQueue>,
        activity: Arc<ActivityTracker>,
        sequence: Arc<SequenceEngine>,
        conversation: Arc<ConversationEngine>,
    ) -> Self {
        Self {
            session_id: session_id.to_string(),
            db,
            dedup,
            outbox,
            activity,
            sequence,
            conversation,
        }
    }

    pub async fn process(&self, batch: Vec<RawEnvelope>) -> Vec<Routed> {
        let mut routed = Vec::with_capacity(batch.len());
        for envelope in batch {
            let outcome = self.route(envelope).await;
            routed.push(outcome);
        }
        routed
    }

    async fn route(&self, envelope: RawEnvelope) -> Routed {
        let Some(phone) = canonical_phone(&envelope.remote) else {
            return Routed::Skipped("not a direct chat");
        };
        if !self.dedup.add(&envelope.id) {
            debug!(session = %self.session_id, id = %envelope.id, "Duplicate message skipped");
            return Routed::Skipped("duplicate");
        }
        let Some(content) = &envelope.content else {
            return Routed::Skipped("no content");
        };
        let outcome = content.classify();
        let Some(text) = outcome.loggable_text() else {
            return Routed::Skipped("no text");
        };
        let at = envelope_time(&envelope);

        if envelope.from_me {
            self.activity.record_outbound(&phone, at);
            let key = format!("out:{}", envelope.id);
            self.log(&key, &phone, &envelope, Direction::Outbound, text, at).await;
            return Routed::Logged;
        }

        if let Err(e) = self
            .db
            .find_or_create_contact(&phone, envelope.push_name.as_deref())
            .await
        {
            warn!(session = %self.session_id, phone = %phone, "Contact upsert failed: {e}");
        }
        let key = format!("in:{}", envelope.id);
        self.log(&key, &phone, &envelope, Direction::Inbound, text.clone(), at).await;

        let readable = matches!(outcome, DecodeOutcome::Text(_));
        self.activity.record_inbound(
            &phone,
            readable.then_some(text.as_str()),
            received_at(&envelope),
        );

        match self.sequence.handle_inbound(&phone).await {
            Ok(Some(trigger)) => {
                info!(
                    session = %self.session_id,
                    phone = %phone,
                    trigger = %trigger,
                    "Sequence triggered"
                );
                return Routed::Sequence(trigger);
            }
            Ok(None) => {}
            Err(e) => warn!(
                session = %self.session_id,
                phone = %phone,
                "Sequence check failed: {e}"
            ),
        }
        if self.sequence.is_running(&phone) {
            return Routed::SequenceRunning;
        }
        if !readable {
            return Routed::Logged;
        }

        self.conversation
            .handle_inbound(&phone, envelope.push_name.clone(), text);
        Routed::Conversation
    }

    async fn log(
        &self,
        key: &str,
        phone: &str,
        envelope: &RawEnvelope,
        direction: Direction,
        text: String,
        at: DateTime<Utc>,
    ) {
        let op = OutboxOp::LogMessage(NewMessage {
            session_id: self.session_id.clone(),
            phone: phone.to_string(),
            push_name: envelope.push_name.clone(),
            direction,
            text,
            external_id: Some(envelope.id.clone()),
            at,
        });
        if let Err(e) = self.outbox.enqueue(key, &op).await {
            warn!(
                session = %self.session_id,
                id = %envelope.id,
                "Failed to queue message log: {e}"
            );
        }
    }
}
