//! `Database` trait: single async interface for all persistence.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::DatabaseError;
use crate::store::model::{
    AgendaItem, Contact, Direction, IgnoredContact, MessageRecord, NewMessage, OutboxItem,
    Sequence, SequenceProgress, SessionRecord, SessionStatus,
};

/// Backend-agnostic database trait covering every table the engine owns.
#[async_trait]
pub trait Database: Send + Sync {
    /// Run all pending schema migrations.
    async fn run_migrations(&self) -> Result<(), DatabaseError>;

    // ── Sessions ────────────────────────────────────────────────────

    /// Return the session row, creating a `disconnected` one if missing.
    async fn upsert_session(&self, id: &str) -> Result<SessionRecord, DatabaseError>;

    async fn get_session(&self, id: &str) -> Result<Option<SessionRecord>, DatabaseError>;

    async fn list_sessions(&self) -> Result<Vec<SessionRecord>, DatabaseError>;

    /// Persist a status change. `connected_at` is stamped when the status is `connected`.
    async fn update_session_status(
        &self,
        id: &str,
        status: SessionStatus,
        qr_code: Option<&str>,
        phone: Option<&str>,
    ) -> Result<(), DatabaseError>;

    /// Delete a session row together with its dedup keys, outbox, progress and agenda.
    async fn delete_session(&self, id: &str) -> Result<bool, DatabaseError>;

    // ── Contacts ────────────────────────────────────────────────────

    async fn find_contact(&self, phone: &str) -> Result<Option<Contact>, DatabaseError>;

    /// Find a contact by phone or create it. A missing name is filled in
    /// from `name` when provided.
    async fn find_or_create_contact(
        &self,
        phone: &str,
        name: Option<&str>,
    ) -> Result<Contact, DatabaseError>;

    async fn update_contact_name(&self, phone: &str, name: &str) -> Result<(), DatabaseError>;

    async fn set_contact_tag(&self, phone: &str, tag: &str) -> Result<(), DatabaseError>;

    /// Merge attributes into the contact. Keys that already hold a
    /// non-null value are left untouched. Returns the keys written.
    async fn merge_contact_attributes(
        &self,
        phone: &str,
        attributes: &serde_json::Map<String, serde_json::Value>,
    ) -> Result<Vec<String>, DatabaseError>;

    // ── Messages ────────────────────────────────────────────────────

    async fn insert_message(
        &self,
        contact_id: i64,
        message: &NewMessage,
    ) -> Result<i64, DatabaseError>;

    /// Most recent messages for a contact, returned oldest first.
    async fn recent_messages(
        &self,
        session_id: &str,
        phone: &str,
        limit: usize,
    ) -> Result<Vec<MessageRecord>, DatabaseError>;

    async fn last_message_at(
        &self,
        session_id: &str,
        phone: &str,
        direction: Direction,
    ) -> Result<Option<DateTime<Utc>>, DatabaseError>;

    /// Texts of the latest inbound messages, newest first.
    async fn recent_inbound_texts(
        &self,
        session_id: &str,
        phone: &str,
        limit: usize,
    ) -> Result<Vec<String>, DatabaseError>;

    /// Phones with inbound messages logged after `since`.
    async fn inbound_phones_since(
        &self,
        session_id: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<String>, DatabaseError>;

    // ── Dedup keys ──────────────────────────────────────────────────

    async fn insert_dedup_key(&self, session_id: &str, key: &str) -> Result<(), DatabaseError>;

    /// The newest `limit` keys, returned oldest first.
    async fn load_dedup_keys(
        &self,
        session_id: &str,
        limit: usize,
    ) -> Result<Vec<String>, DatabaseError>;

    async fn prune_dedup_keys(
        &self,
        session_id: &str,
        older_than: DateTime<Utc>,
    ) -> Result<usize, DatabaseError>;

    // ── Outbox ──────────────────────────────────────────────────────

    /// Insert an item. Returns `false` when the idempotency key already exists.
    async fn insert_outbox_item(
        &self,
        session_id: &str,
        idempotency_key: &str,
        op_type: &str,
        payload: &str,
    ) -> Result<bool, DatabaseError>;

    /// Items whose next attempt time has passed, oldest first.
    async fn pending_outbox_items(
        &self,
        session_id: &str,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<OutboxItem>, DatabaseError>;

    async fn delete_outbox_item(&self, id: i64) -> Result<(), DatabaseError>;

    async fn reschedule_outbox_item(
        &self,
        id: i64,
        attempts: u32,
        next_attempt_at: DateTime<Utc>,
    ) -> Result<(), DatabaseError>;

    async fn count_outbox_items(&self, session_id: &str) -> Result<usize, DatabaseError>;

    // ── Sequences ───────────────────────────────────────────────────

    async fn list_active_sequences(&self) -> Result<Vec<Sequence>, DatabaseError>;

    async fn get_sequence(&self, trigger: &str) -> Result<Option<Sequence>, DatabaseError>;

    /// Create or update a sequence definition, returning its id.
    async fn upsert_sequence(&self, trigger: &str, active: bool) -> Result<i64, DatabaseError>;

    /// Replace all steps of a sequence in a single transaction.
    async fn replace_sequence_steps(
        &self,
        sequence_id: i64,
        steps: &[String],
    ) -> Result<(), DatabaseError>;

    async fn delete_sequence(&self, trigger: &str) -> Result<bool, DatabaseError>;

    // ── Sequence progress ───────────────────────────────────────────

    async fn get_progress(
        &self,
        session_id: &str,
        phone: &str,
    ) -> Result<Option<SequenceProgress>, DatabaseError>;

    async fn save_progress(&self, progress: &SequenceProgress) -> Result<(), DatabaseError>;

    async fn list_active_progress(
        &self,
        session_id: &str,
    ) -> Result<Vec<SequenceProgress>, DatabaseError>;

    // ── Ignore list ─────────────────────────────────────────────────

    async fn ignore_contact(&self, entry: &IgnoredContact) -> Result<(), DatabaseError>;

    /// True when an unexpired entry exists for the phone.
    async fn is_ignored(&self, phone: &str, now: DateTime<Utc>) -> Result<bool, DatabaseError>;

    async fn unignore_contact(&self, phone: &str) -> Result<bool, DatabaseError>;

    async fn purge_expired_ignores(&self, now: DateTime<Utc>) -> Result<usize, DatabaseError>;

    async fn list_ignored(&self, now: DateTime<Utc>) -> Result<Vec<IgnoredContact>, DatabaseError>;

    // ── Prompt settings ─────────────────────────────────────────────

    async fn get_prompt_settings(&self) -> Result<Vec<(String, String)>, DatabaseError>;

    async fn set_prompt_setting(&self, key: &str, value: &str) -> Result<(), DatabaseError>;

    // ── Agenda ──────────────────────────────────────────────────────

    async fn insert_agenda_item(
        &self,
        session_id: &str,
        phone: &str,
        text: &str,
        send_at: DateTime<Utc>,
    ) -> Result<AgendaItem, DatabaseError>;

    /// Pending items whose send time has passed, oldest first.
    async fn due_agenda_items(
        &self,
        session_id: &str,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<AgendaItem>, DatabaseError>;

    async fn mark_agenda_sent(&self, id: i64) -> Result<(), DatabaseError>;

    /// Record a failed attempt; `give_up` moves the item to `failed`.
    async fn record_agenda_failure(
        &self,
        id: i64,
        attempts: u32,
        error: &str,
        give_up: bool,
    ) -> Result<(), DatabaseError>;
}
