//! Scheduled one-off messages.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::config::AgendaConfig;
use crate::error::{DatabaseError, SessionError};
use crate::outbound::OutboundSender;
use crate::store::{AgendaItem, Database};
use crate::ticker::InFlight;
use crate::transport::canonical_phone;

/// Outcome of one agenda pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct AgendaStats {
    pub sent: usize,
    pub retried: usize,
    pub failed: usize,
}

pub struct AgendaRunner {
    session_id: String,
    db: Arc<dyn Database>,
    sender: Arc<OutboundSender>,
    config: AgendaConfig,
    running: InFlight,
}

impl AgendaRunner {
    pub fn new(
        session_id: &str,
        db: Arc<dyn Database>,
        sender: Arc<OutboundSender>,
        config: AgendaConfig,
    ) -> Self {
        Self {
            session_id: session_id.to_string(),
            db,
            sender,
            config,
            running: InFlight::new(),
        }
    }

    pub async fn schedule(
        &self,
        phone: &str,
        text: &str,
        send_at: DateTime<Utc>,
    ) -> Result<AgendaItem, SessionError> {
        let phone = canonical_phone(phone).ok_or_else(|| SessionError::InvalidRecipient {
            phone: phone.to_string(),
        })?;
        let item = self
            .db
            .insert_agenda_item(&self.session_id, &phone, text, send_at)
            .await?;
        info!(
            session = %self.session_id,
            phone = %phone,
            id = item.id,
            send_at = %send_at,
            "Message scheduled"
        );
        Ok(item)
    }

    /// Send every due item once.
    pub async fn run_due(&self) -> AgendaStats {
        let Some(_guard) = self.running.try_enter() else {
            debug!(session = %self.session_id, "Agenda pass already running");
            return AgendaStats::default();
        };

        let due = match self
            .db
            .due_agenda_items(&self.session_id, Utc::now(), self.config.batch_size)
            .await
        {
            Ok(items) => items,
            Err(e) => {
                warn!(session = %self.session_id, "Failed to load agenda: {e}");
                return AgendaStats::default();
            }
        };

        let mut stats = AgendaStats::default();
        for item in due {
            match self.sender.send_text(&item.phone, &item.text).await {
                Ok(_) => {
                    if let Err(e) = self.db.mark_agenda_sent(item.id).await {
                        warn!(
                            session = %self.session_id,
                            id = item.id,
                            "Failed to mark agenda item sent: {e}"
                        );
                    }
                    stats.sent += 1;
                }
                Err(e) => match self.record_failure(&item, &e.to_string()).await {
                    Ok(true) => stats.failed += 1,
                    Ok(false) => stats.retried += 1,
                    Err(db_err) => {
                        warn!(
                            session = %self.session_id,
                            id = item.id,
                            "Failed to record agenda failure: {db_err}"
                        );
                    }
                },
            }
        }
        if stats != AgendaStats::default() {
            debug!(session = %self.session_id, ?stats, "Agenda pass complete");
        }
        stats
    }

    /// Returns `true` when the item was given up on.
    async fn record_failure(&self, item: &AgendaItem, error: &str) -> Result<bool, DatabaseError> {
        let attempts = item.attempts + 1;
        let give_up = attempts >= self.config.max_attempts;
        self.db
            .record_agenda_failure(item.id, attempts, error, give_up)
            .await?;
        if give_up {
            warn!(
                session = %self.session_id,
                id = item.id,
                phone = %item.phone,
                attempts,
                "Scheduled message failed permanently: {error}"
            );
        } else {
            debug!(
                session = %self.session_id,
                id = item.id,
                attempts,
                "Scheduled message will be retried: {error}"
            );
        }
        Ok(give_up)
    }
}
