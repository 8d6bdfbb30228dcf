//! libSQL backend: async `Database` trait implementation.
//!
//! Supports local file and in-memory databases. All timestamps are written
//! as fixed-width RFC 3339 UTC strings so they compare correctly as text.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use tokio::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, info};

use crate::error::DatabaseError;
use crate::store::migrations;
use crate::store::model::{
    AgendaItem, AgendaStatus, Contact, Direction, IgnoredContact, MessageRecord, NewMessage,
    OutboxItem, ProgressStatus, Sequence, SequenceProgress, SessionRecord, SessionStatus,
};
use crate::store::traits::Database;

/// libSQL database backend.
///
/// Stores a single connection that is reused for all operations. A
/// transaction on that connection is visible to every other statement on
/// it, so each trait method holds `gate` for its whole body: shared for
/// plain statements, exclusive for transactions and read-modify-write
/// sequences. Methods never re-enter the gate.
pub struct LibSqlBackend {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
    gate: RwLock<()>,
}

impl LibSqlBackend {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let backend = Self::from_database(db)?;
        backend.run_migrations().await?;
        info!(path = %path.display(), "Database opened");
        Ok(backend)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;

        let backend = Self::from_database(db)?;
        backend.run_migrations().await?;
        Ok(backend)
    }

    fn from_database(db: LibSqlDatabase) -> Result<Self, DatabaseError> {
        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;
        Ok(Self {
            db: Arc::new(db),
            conn,
            gate: RwLock::new(()),
        })
    }

    fn conn(&self) -> &Connection {
        &self.conn
    }

    async fn shared(&self) -> RwLockReadGuard<'_, ()> {
        self.gate.read().await
    }

    async fn exclusive(&self) -> RwLockWriteGuard<'_, ()> {
        self.gate.write().await
    }

    async fn session_row(&self, id: &str) -> Result<Option<SessionRecord>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {SESSION_COLUMNS} FROM sessions WHERE id = ?1"),
                params![id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_session: {e}")))?;

        match next_row(&mut rows, "get_session").await? {
            Some(row) => Ok(Some(row_to_session(&row).map_err(parse_err("get_session"))?)),
            None => Ok(None),
        }
    }

    async fn contact_row(&self, phone: &str) -> Result<Option<Contact>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {CONTACT_COLUMNS} FROM contacts WHERE phone = ?1"),
                params![phone],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("find_contact: {e}")))?;

        match next_row(&mut rows, "find_contact").await? {
            Some(row) => Ok(Some(row_to_contact(&row).map_err(parse_err("find_contact"))?)),
            None => Ok(None),
        }
    }

    async fn load_steps(&self, sequence_id: i64) -> Result<Vec<String>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT text FROM sequence_steps WHERE sequence_id = ?1 ORDER BY position",
                params![sequence_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("load_steps: {e}")))?;

        let mut steps = Vec::new();
        while let Some(row) = next_row(&mut rows, "load_steps").await? {
            steps.push(
                row.get::<String>(0)
                    .map_err(|e| DatabaseError::Query(format!("load_steps row parse: {e}")))?,
            );
        }
        Ok(steps)
    }

    async fn sequences_where(
        &self,
        clause: &str,
        value: libsql::Value,
    ) -> Result<Vec<Sequence>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT id, trigger, active FROM sequences WHERE {clause} ORDER BY id"),
                params![value],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("sequences_where: {e}")))?;

        let mut heads = Vec::new();
        while let Some(row) = next_row(&mut rows, "sequences_where").await? {
            let id: i64 = row.get(0).map_err(parse_err("sequences_where"))?;
            let trigger: String = row.get(1).map_err(parse_err("sequences_where"))?;
            let active: i64 = row.get(2).map_err(parse_err("sequences_where"))?;
            heads.push((id, trigger, active != 0));
        }

        let mut out = Vec::with_capacity(heads.len());
        for (id, trigger, active) in heads {
            out.push(Sequence {
                id,
                trigger,
                steps: self.load_steps(id).await?,
                active,
            });
        }
        Ok(out)
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Canonical write format for timestamps.
fn ts(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

fn parse_optional_datetime(s: &Option<String>) -> Option<DateTime<Utc>> {
    s.as_ref().map(|s| parse_datetime(s))
}

/// Convert `Option<&str>` to libsql Value.
fn opt_text(s: Option<&str>) -> libsql::Value {
    match s {
        Some(s) => libsql::Value::Text(s.to_string()),
        None => libsql::Value::Null,
    }
}

fn opt_datetime(dt: Option<DateTime<Utc>>) -> libsql::Value {
    match dt {
        Some(dt) => libsql::Value::Text(ts(dt)),
        None => libsql::Value::Null,
    }
}

fn parse_err(ctx: &'static str) -> impl Fn(libsql::Error) -> DatabaseError {
    move |e| DatabaseError::Query(format!("{ctx} row parse: {e}"))
}

async fn next_row(
    rows: &mut libsql::Rows,
    ctx: &str,
) -> Result<Option<libsql::Row>, DatabaseError> {
    rows.next()
        .await
        .map_err(|e| DatabaseError::Query(format!("{ctx}: {e}")))
}

const SESSION_COLUMNS: &str = "id, status, qr_code, phone, connected_at, updated_at";

fn row_to_session(row: &libsql::Row) -> Result<SessionRecord, libsql::Error> {
    let status: String = row.get(1)?;
    let connected_at: Option<String> = row.get(4).ok();
    let updated_at: String = row.get(5)?;
    Ok(SessionRecord {
        id: row.get(0)?,
        status: SessionStatus::parse(&status),
        qr_code: row.get(2).ok(),
        phone: row.get(3).ok(),
        connected_at: parse_optional_datetime(&connected_at),
        updated_at: parse_datetime(&updated_at),
    })
}

const CONTACT_COLUMNS: &str = "id, phone, name, tag, attributes, created_at";

fn row_to_contact(row: &libsql::Row) -> Result<Contact, libsql::Error> {
    let attributes: String = row.get(4)?;
    let created_at: String = row.get(5)?;
    Ok(Contact {
        id: row.get(0)?,
        phone: row.get(1)?,
        name: row.get(2).ok(),
        tag: row.get(3).ok(),
        attributes: serde_json::from_str(&attributes)
            .unwrap_or_else(|_| serde_json::Value::Object(Default::default())),
        created_at: parse_datetime(&created_at),
    })
}

const MESSAGE_COLUMNS: &str =
    "id, contact_id, phone, direction, text, external_id, session_id, created_at";

fn row_to_message(row: &libsql::Row) -> Result<MessageRecord, libsql::Error> {
    let direction: String = row.get(3)?;
    let created_at: String = row.get(7)?;
    Ok(MessageRecord {
        id: row.get(0)?,
        contact_id: row.get(1)?,
        phone: row.get(2)?,
        direction: Direction::parse(&direction),
        text: row.get(4)?,
        external_id: row.get(5).ok(),
        session_id: row.get(6)?,
        created_at: parse_datetime(&created_at),
    })
}

const OUTBOX_COLUMNS: &str =
    "id, session_id, idempotency_key, op_type, payload, attempts, next_attempt_at";

fn row_to_outbox(row: &libsql::Row) -> Result<OutboxItem, libsql::Error> {
    let attempts: i64 = row.get(5)?;
    let next: String = row.get(6)?;
    Ok(OutboxItem {
        id: row.get(0)?,
        session_id: row.get(1)?,
        idempotency_key: row.get(2)?,
        op_type: row.get(3)?,
        payload: row.get(4)?,
        attempts: attempts.max(0) as u32,
        next_attempt_at: parse_datetime(&next),
    })
}

const PROGRESS_COLUMNS: &str = "session_id, phone, status, trigger, current_step, total_steps, last_inbound_at, last_outbound_at";

fn row_to_progress(row: &libsql::Row) -> Result<SequenceProgress, libsql::Error> {
    let status: String = row.get(2)?;
    let current: i64 = row.get(4)?;
    let total: i64 = row.get(5)?;
    let last_in: Option<String> = row.get(6).ok();
    let last_out: Option<String> = row.get(7).ok();
    Ok(SequenceProgress {
        session_id: row.get(0)?,
        phone: row.get(1)?,
        status: ProgressStatus::parse(&status),
        trigger: row.get(3).ok(),
        current_step: current.max(0) as u32,
        total_steps: total.max(0) as u32,
        last_inbound_at: parse_optional_datetime(&last_in),
        last_outbound_at: parse_optional_datetime(&last_out),
    })
}

const IGNORED_COLUMNS: &str = "phone, reason, first_message, ignored_at, expires_at";

fn row_to_ignored(row: &libsql::Row) -> Result<IgnoredContact, libsql::Error> {
    let ignored_at: String = row.get(3)?;
    let expires_at: Option<String> = row.get(4).ok();
    Ok(IgnoredContact {
        phone: row.get(0)?,
        reason: row.get(1)?,
        first_message: row.get(2)?,
        ignored_at: parse_datetime(&ignored_at),
        expires_at: parse_optional_datetime(&expires_at),
    })
}

const AGENDA_COLUMNS: &str = "id, session_id, phone, text, send_at, status, attempts, last_error";

fn row_to_agenda(row: &libsql::Row) -> Result<AgendaItem, libsql::Error> {
    let send_at: String = row.get(4)?;
    let status: String = row.get(5)?;
    let attempts: i64 = row.get(6)?;
    Ok(AgendaItem {
        id: row.get(0)?,
        session_id: row.get(1)?,
        phone: row.get(2)?,
        text: row.get(3)?,
        send_at: parse_datetime(&send_at),
        status: AgendaStatus::parse(&status),
        attempts: attempts.max(0) as u32,
        last_error: row.get(7).ok(),
    })
}

// ── Trait implementation ────────────────────────────────────────────

#[async_trait]
impl Database for LibSqlBackend {
    async fn run_migrations(&self) -> Result<(), DatabaseError> {
        let _guard = self.exclusive().await;
        migrations::run_migrations(self.conn()).await
    }

    // ── Sessions ────────────────────────────────────────────────────

    async fn upsert_session(&self, id: &str) -> Result<SessionRecord, DatabaseError> {
        let _guard = self.shared().await;
        self.conn()
            .execute(
                "INSERT OR IGNORE INTO sessions (id, status, updated_at) VALUES (?1, 'disconnected', ?2)",
                params![id, ts(Utc::now())],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("upsert_session: {e}")))?;

        self.session_row(id).await?.ok_or_else(|| DatabaseError::NotFound {
            entity: "session".into(),
            id: id.to_string(),
        })
    }

    async fn get_session(&self, id: &str) -> Result<Option<SessionRecord>, DatabaseError> {
        let _guard = self.shared().await;
        self.session_row(id).await
    }

    async fn list_sessions(&self) -> Result<Vec<SessionRecord>, DatabaseError> {
        let _guard = self.shared().await;
        let mut rows = self
            .conn()
            .query(&format!("SELECT {SESSION_COLUMNS} FROM sessions ORDER BY id"), ())
            .await
            .map_err(|e| DatabaseError::Query(format!("list_sessions: {e}")))?;

        let mut out = Vec::new();
        while let Some(row) = next_row(&mut rows, "list_sessions").await? {
            out.push(row_to_session(&row).map_err(parse_err("list_sessions"))?);
        }
        Ok(out)
    }

    async fn update_session_status(
        &self,
        id: &str,
        status: SessionStatus,
        qr_code: Option<&str>,
        phone: Option<&str>,
    ) -> Result<(), DatabaseError> {
        let _guard = self.shared().await;
        let now = Utc::now();
        let connected_at = (status == SessionStatus::Connected).then_some(now);
        self.conn()
            .execute(
                "INSERT INTO sessions (id, status, qr_code, phone, connected_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT(id) DO UPDATE SET
                    status = excluded.status,
                    qr_code = excluded.qr_code,
                    phone = COALESCE(excluded.phone, sessions.phone),
                    connected_at = COALESCE(excluded.connected_at, sessions.connected_at),
                    updated_at = excluded.updated_at",
                params![
                    id,
                    status.as_str(),
                    opt_text(qr_code),
                    opt_text(phone),
                    opt_datetime(connected_at),
                    ts(now)
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("update_session_status: {e}")))?;

        debug!(session = %id, status = %status, "Session status persisted");
        Ok(())
    }

    async fn delete_session(&self, id: &str) -> Result<bool, DatabaseError> {
        let _guard = self.exclusive().await;
        let tx = self
            .conn()
            .transaction()
            .await
            .map_err(|e| DatabaseError::Query(format!("delete_session begin: {e}")))?;

        for table in ["dedup_keys", "outbox", "sequence_progress", "agenda"] {
            tx.execute(
                &format!("DELETE FROM {table} WHERE session_id = ?1"),
                params![id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("delete_session {table}: {e}")))?;
        }
        let deleted = tx
            .execute("DELETE FROM sessions WHERE id = ?1", params![id])
            .await
            .map_err(|e| DatabaseError::Query(format!("delete_session: {e}")))?;

        tx.commit()
            .await
            .map_err(|e| DatabaseError::Query(format!("delete_session commit: {e}")))?;
        Ok(deleted > 0)
    }

    // ── Contacts ────────────────────────────────────────────────────

    async fn find_contact(&self, phone: &str) -> Result<Option<Contact>, DatabaseError> {
        let _guard = self.shared().await;
        self.contact_row(phone).await
    }

    async fn find_or_create_contact(
        &self,
        phone: &str,
        name: Option<&str>,
    ) -> Result<Contact, DatabaseError> {
        let _guard = self.shared().await;
        let conn = self.conn();
        conn.execute(
            "INSERT OR IGNORE INTO contacts (phone, name, attributes, created_at) VALUES (?1, ?2, '{}', ?3)",
            params![phone, opt_text(name), ts(Utc::now())],
        )
        .await
        .map_err(|e| DatabaseError::Query(format!("find_or_create_contact: {e}")))?;

        if let Some(name) = name.filter(|n| !n.trim().is_empty()) {
            conn.execute(
                "UPDATE contacts SET name = ?2 WHERE phone = ?1 AND (name IS NULL OR name = '')",
                params![phone, name],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("find_or_create_contact name: {e}")))?;
        }

        self.contact_row(phone).await?.ok_or_else(|| DatabaseError::NotFound {
            entity: "contact".into(),
            id: phone.to_string(),
        })
    }

    async fn update_contact_name(&self, phone: &str, name: &str) -> Result<(), DatabaseError> {
        let _guard = self.shared().await;
        self.conn()
            .execute(
                "UPDATE contacts SET name = ?2 WHERE phone = ?1",
                params![phone, name],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("update_contact_name: {e}")))?;
        Ok(())
    }

    async fn set_contact_tag(&self, phone: &str, tag: &str) -> Result<(), DatabaseError> {
        let _guard = self.shared().await;
        self.conn()
            .execute(
                "UPDATE contacts SET tag = ?2 WHERE phone = ?1",
                params![phone, tag],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("set_contact_tag: {e}")))?;
        Ok(())
    }

    async fn merge_contact_attributes(
        &self,
        phone: &str,
        attributes: &serde_json::Map<String, serde_json::Value>,
    ) -> Result<Vec<String>, DatabaseError> {
        let _guard = self.exclusive().await;
        let contact = self.contact_row(phone).await?.ok_or_else(|| DatabaseError::NotFound {
            entity: "contact".into(),
            id: phone.to_string(),
        })?;

        let mut current = match contact.attributes {
            serde_json::Value::Object(map) => map,
            _ => serde_json::Map::new(),
        };
        let mut written = Vec::new();
        for (key, value) in attributes {
            if value.is_null() {
                continue;
            }
            let filled = current.get(key).is_some_and(|v| !v.is_null());
            if !filled {
                current.insert(key.clone(), value.clone());
                written.push(key.clone());
            }
        }

        if !written.is_empty() {
            let json = serde_json::to_string(&current)
                .map_err(|e| DatabaseError::Serialization(e.to_string()))?;
            self.conn()
                .execute(
                    "UPDATE contacts SET attributes = ?2 WHERE phone = ?1",
                    params![phone, json],
                )
                .await
                .map_err(|e| DatabaseError::Query(format!("merge_contact_attributes: {e}")))?;
        }
        Ok(written)
    }

    // ── Messages ────────────────────────────────────────────────────

    async fn insert_message(
        &self,
        contact_id: i64,
        message: &NewMessage,
    ) -> Result<i64, DatabaseError> {
        let _guard = self.shared().await;
        let mut rows = self
            .conn()
            .query(
                "INSERT INTO messages (contact_id, phone, direction, text, external_id, session_id, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7) RETURNING id",
                params![
                    contact_id,
                    message.phone.as_str(),
                    message.direction.as_str(),
                    message.text.as_str(),
                    opt_text(message.external_id.as_deref()),
                    message.session_id.as_str(),
                    ts(message.at)
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("insert_message: {e}")))?;

        let row = next_row(&mut rows, "insert_message")
            .await?
            .ok_or_else(|| DatabaseError::Query("insert_message: no id returned".into()))?;
        row.get::<i64>(0).map_err(parse_err("insert_message"))
    }

    async fn recent_messages(
        &self,
        session_id: &str,
        phone: &str,
        limit: usize,
    ) -> Result<Vec<MessageRecord>, DatabaseError> {
        let _guard = self.shared().await;
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {MESSAGE_COLUMNS} FROM messages
                     WHERE session_id = ?1 AND phone = ?2
                     ORDER BY created_at DESC, id DESC LIMIT ?3"
                ),
                params![session_id, phone, limit as i64],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("recent_messages: {e}")))?;

        let mut out = Vec::new();
        while let Some(row) = next_row(&mut rows, "recent_messages").await? {
            out.push(row_to_message(&row).map_err(parse_err("recent_messages"))?);
        }
        out.reverse();
        Ok(out)
    }

    async fn last_message_at(
        &self,
        session_id: &str,
        phone: &str,
        direction: Direction,
    ) -> Result<Option<DateTime<Utc>>, DatabaseError> {
        let _guard = self.shared().await;
        let mut rows = self
            .conn()
            .query(
                "SELECT MAX(created_at) FROM messages WHERE session_id = ?1 AND phone = ?2 AND direction = ?3",
                params![session_id, phone, direction.as_str()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("last_message_at: {e}")))?;

        match next_row(&mut rows, "last_message_at").await? {
            Some(row) => Ok(parse_optional_datetime(&row.get::<String>(0).ok())),
            None => Ok(None),
        }
    }

    async fn recent_inbound_texts(
        &self,
        session_id: &str,
        phone: &str,
        limit: usize,
    ) -> Result<Vec<String>, DatabaseError> {
        let _guard = self.shared().await;
        let mut rows = self
            .conn()
            .query(
                "SELECT text FROM messages
                 WHERE session_id = ?1 AND phone = ?2 AND direction = 'inbound'
                 ORDER BY created_at DESC, id DESC LIMIT ?3",
                params![session_id, phone, limit as i64],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("recent_inbound_texts: {e}")))?;

        let mut out = Vec::new();
        while let Some(row) = next_row(&mut rows, "recent_inbound_texts").await? {
            out.push(row.get::<String>(0).map_err(parse_err("recent_inbound_texts"))?);
        }
        Ok(out)
    }

    async fn inbound_phones_since(
        &self,
        session_id: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<String>, DatabaseError> {
        let _guard = self.shared().await;
        let mut rows = self
            .conn()
            .query(
                "SELECT DISTINCT phone FROM messages
                 WHERE session_id = ?1 AND direction = 'inbound' AND created_at > ?2",
                params![session_id, ts(since)],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("inbound_phones_since: {e}")))?;

        let mut out = Vec::new();
        while let Some(row) = next_row(&mut rows, "inbound_phones_since").await? {
            out.push(row.get::<String>(0).map_err(parse_err("inbound_phones_since"))?);
        }
        Ok(out)
    }

    // ── Dedup keys ──────────────────────────────────────────────────

    async fn insert_dedup_key(&self, session_id: &str, key: &str) -> Result<(), DatabaseError> {
        let _guard = self.shared().await;
        self.conn()
            .execute(
                "INSERT OR IGNORE INTO dedup_keys (session_id, key, created_at) VALUES (?1, ?2, ?3)",
                params![session_id, key, ts(Utc::now())],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("insert_dedup_key: {e}")))?;
        Ok(())
    }

    async fn load_dedup_keys(
        &self,
        session_id: &str,
        limit: usize,
    ) -> Result<Vec<String>, DatabaseError> {
        let _guard = self.shared().await;
        let mut rows = self
            .conn()
            .query(
                "SELECT key FROM dedup_keys WHERE session_id = ?1
                 ORDER BY created_at DESC, rowid DESC LIMIT ?2",
                params![session_id, limit as i64],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("load_dedup_keys: {e}")))?;

        let mut out = Vec::new();
        while let Some(row) = next_row(&mut rows, "load_dedup_keys").await? {
            out.push(row.get::<String>(0).map_err(parse_err("load_dedup_keys"))?);
        }
        out.reverse();
        Ok(out)
    }

    async fn prune_dedup_keys(
        &self,
        session_id: &str,
        older_than: DateTime<Utc>,
    ) -> Result<usize, DatabaseError> {
        let _guard = self.shared().await;
        let n = self
            .conn()
            .execute(
                "DELETE FROM dedup_keys WHERE session_id = ?1 AND created_at < ?2",
                params![session_id, ts(older_than)],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("prune_dedup_keys: {e}")))?;
        Ok(n as usize)
    }

    // ── Outbox ──────────────────────────────────────────────────────

    async fn insert_outbox_item(
        &self,
        session_id: &str,
        idempotency_key: &str,
        op_type: &str,
        payload: &str,
    ) -> Result<bool, DatabaseError> {
        let _guard = self.shared().await;
        let now = ts(Utc::now());
        let n = self
            .conn()
            .execute(
                "INSERT OR IGNORE INTO outbox
                    (session_id, idempotency_key, op_type, payload, attempts, next_attempt_at, created_at)
                 VALUES (?1, ?2, ?3, ?4, 0, ?5, ?5)",
                params![session_id, idempotency_key, op_type, payload, now],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("insert_outbox_item: {e}")))?;
        Ok(n > 0)
    }

    async fn pending_outbox_items(
        &self,
        session_id: &str,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<OutboxItem>, DatabaseError> {
        let _guard = self.shared().await;
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {OUTBOX_COLUMNS} FROM outbox
                     WHERE session_id = ?1 AND next_attempt_at <= ?2
                     ORDER BY id LIMIT ?3"
                ),
                params![session_id, ts(now), limit as i64],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("pending_outbox_items: {e}")))?;

        let mut out = Vec::new();
        while let Some(row) = next_row(&mut rows, "pending_outbox_items").await? {
            out.push(row_to_outbox(&row).map_err(parse_err("pending_outbox_items"))?);
        }
        Ok(out)
    }

    async fn delete_outbox_item(&self, id: i64) -> Result<(), DatabaseError> {
        let _guard = self.shared().await;
        self.conn()
            .execute("DELETE FROM outbox WHERE id = ?1", params![id])
            .await
            .map_err(|e| DatabaseError::Query(format!("delete_outbox_item: {e}")))?;
        Ok(())
    }

    async fn reschedule_outbox_item(
        &self,
        id: i64,
        attempts: u32,
        next_attempt_at: DateTime<Utc>,
    ) -> Result<(), DatabaseError> {
        let _guard = self.shared().await;
        self.conn()
            .execute(
                "UPDATE outbox SET attempts = ?2, next_attempt_at = ?3 WHERE id = ?1",
                params![id, attempts as i64, ts(next_attempt_at)],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("reschedule_outbox_item: {e}")))?;
        Ok(())
    }

    async fn count_outbox_items(&self, session_id: &str) -> Result<usize, DatabaseError> {
        let _guard = self.shared().await;
        let mut rows = self
            .conn()
            .query(
                "SELECT COUNT(*) FROM outbox WHERE session_id = ?1",
                params![session_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("count_outbox_items: {e}")))?;

        match next_row(&mut rows, "count_outbox_items").await? {
            Some(row) => Ok(row.get::<i64>(0).unwrap_or(0).max(0) as usize),
            None => Ok(0),
        }
    }

    // ── Sequences ───────────────────────────────────────────────────

    async fn list_active_sequences(&self) -> Result<Vec<Sequence>, DatabaseError> {
        let _guard = self.shared().await;
        self.sequences_where("active = ?1", libsql::Value::Integer(1))
            .await
    }

    async fn get_sequence(&self, trigger: &str) -> Result<Option<Sequence>, DatabaseError> {
        let _guard = self.shared().await;
        Ok(self
            .sequences_where("trigger = ?1", libsql::Value::Text(trigger.to_string()))
            .await?
            .into_iter()
            .next())
    }

    async fn upsert_sequence(&self, trigger: &str, active: bool) -> Result<i64, DatabaseError> {
        let _guard = self.shared().await;
        let mut rows = self
            .conn()
            .query(
                "INSERT INTO sequences (trigger, active) VALUES (?1, ?2)
                 ON CONFLICT(trigger) DO UPDATE SET active = excluded.active
                 RETURNING id",
                params![trigger, active as i64],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("upsert_sequence: {e}")))?;

        let row = next_row(&mut rows, "upsert_sequence")
            .await?
            .ok_or_else(|| DatabaseError::Query("upsert_sequence: no id returned".into()))?;
        row.get::<i64>(0).map_err(parse_err("upsert_sequence"))
    }

    async fn replace_sequence_steps(
        &self,
        sequence_id: i64,
        steps: &[String],
    ) -> Result<(), DatabaseError> {
        let _guard = self.exclusive().await;
        let tx = self
            .conn()
            .transaction()
            .await
            .map_err(|e| DatabaseError::Query(format!("replace_sequence_steps begin: {e}")))?;

        tx.execute(
            "DELETE FROM sequence_steps WHERE sequence_id = ?1",
            params![sequence_id],
        )
        .await
        .map_err(|e| DatabaseError::Query(format!("replace_sequence_steps delete: {e}")))?;

        for (position, text) in steps.iter().enumerate() {
            tx.execute(
                "INSERT INTO sequence_steps (sequence_id, position, text) VALUES (?1, ?2, ?3)",
                params![sequence_id, position as i64, text.as_str()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("replace_sequence_steps insert: {e}")))?;
        }

        tx.commit()
            .await
            .map_err(|e| DatabaseError::Query(format!("replace_sequence_steps commit: {e}")))?;
        debug!(sequence_id, steps = steps.len(), "Sequence steps replaced");
        Ok(())
    }

    async fn delete_sequence(&self, trigger: &str) -> Result<bool, DatabaseError> {
        let _guard = self.exclusive().await;
        let heads = self
            .sequences_where("trigger = ?1", libsql::Value::Text(trigger.to_string()))
            .await?;
        let Some(sequence) = heads.into_iter().next() else {
            return Ok(false);
        };
        let tx = self
            .conn()
            .transaction()
            .await
            .map_err(|e| DatabaseError::Query(format!("delete_sequence begin: {e}")))?;
        tx.execute(
            "DELETE FROM sequence_steps WHERE sequence_id = ?1",
            params![sequence.id],
        )
        .await
        .map_err(|e| DatabaseError::Query(format!("delete_sequence steps: {e}")))?;
        tx.execute("DELETE FROM sequences WHERE id = ?1", params![sequence.id])
            .await
            .map_err(|e| DatabaseError::Query(format!("delete_sequence: {e}")))?;
        tx.commit()
            .await
            .map_err(|e| DatabaseError::Query(format!("delete_sequence commit: {e}")))?;
        Ok(true)
    }

    // ── Sequence progress ───────────────────────────────────────────

    async fn get_progress(
        &self,
        session_id: &str,
        phone: &str,
    ) -> Result<Option<SequenceProgress>, DatabaseError> {
        let _guard = self.shared().await;
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {PROGRESS_COLUMNS} FROM sequence_progress WHERE session_id = ?1 AND phone = ?2"
                ),
                params![session_id, phone],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_progress: {e}")))?;

        match next_row(&mut rows, "get_progress").await? {
            Some(row) => Ok(Some(row_to_progress(&row).map_err(parse_err("get_progress"))?)),
            None => Ok(None),
        }
    }

    async fn save_progress(&self, p: &SequenceProgress) -> Result<(), DatabaseError> {
        let _guard = self.shared().await;
        self.conn()
            .execute(
                "INSERT INTO sequence_progress
                    (session_id, phone, status, trigger, current_step, total_steps,
                     last_inbound_at, last_outbound_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
                 ON CONFLICT(session_id, phone) DO UPDATE SET
                    status = excluded.status,
                    trigger = excluded.trigger,
                    current_step = excluded.current_step,
                    total_steps = excluded.total_steps,
                    last_inbound_at = excluded.last_inbound_at,
                    last_outbound_at = excluded.last_outbound_at,
                    updated_at = excluded.updated_at",
                params![
                    p.session_id.as_str(),
                    p.phone.as_str(),
                    p.status.as_str(),
                    opt_text(p.trigger.as_deref()),
                    p.current_step as i64,
                    p.total_steps as i64,
                    opt_datetime(p.last_inbound_at),
                    opt_datetime(p.last_outbound_at),
                    ts(Utc::now())
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("save_progress: {e}")))?;
        Ok(())
    }

    async fn list_active_progress(
        &self,
        session_id: &str,
    ) -> Result<Vec<SequenceProgress>, DatabaseError> {
        let _guard = self.shared().await;
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {PROGRESS_COLUMNS} FROM sequence_progress
                     WHERE session_id = ?1 AND status = 'active'"
                ),
                params![session_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_active_progress: {e}")))?;

        let mut out = Vec::new();
        while let Some(row) = next_row(&mut rows, "list_active_progress").await? {
            out.push(row_to_progress(&row).map_err(parse_err("list_active_progress"))?);
        }
        Ok(out)
    }

    // ── Ignore list ─────────────────────────────────────────────────

    async fn ignore_contact(&self, entry: &IgnoredContact) -> Result<(), DatabaseError> {
        let _guard = self.shared().await;
        self.conn()
            .execute(
                &format!(
                    "INSERT OR REPLACE INTO ignored_contacts ({IGNORED_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5)"
                ),
                params![
                    entry.phone.as_str(),
                    entry.reason.as_str(),
                    entry.first_message.as_str(),
                    ts(entry.ignored_at),
                    opt_datetime(entry.expires_at)
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("ignore_contact: {e}")))?;
        Ok(())
    }

    async fn is_ignored(&self, phone: &str, now: DateTime<Utc>) -> Result<bool, DatabaseError> {
        let _guard = self.shared().await;
        let mut rows = self
            .conn()
            .query(
                "SELECT COUNT(*) FROM ignored_contacts
                 WHERE phone = ?1 AND (expires_at IS NULL OR expires_at > ?2)",
                params![phone, ts(now)],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("is_ignored: {e}")))?;

        match next_row(&mut rows, "is_ignored").await? {
            Some(row) => Ok(row.get::<i64>(0).unwrap_or(0) > 0),
            None => Ok(false),
        }
    }

    async fn unignore_contact(&self, phone: &str) -> Result<bool, DatabaseError> {
        let _guard = self.shared().await;
        let n = self
            .conn()
            .execute("DELETE FROM ignored_contacts WHERE phone = ?1", params![phone])
            .await
            .map_err(|e| DatabaseError::Query(format!("unignore_contact: {e}")))?;
        Ok(n > 0)
    }

    async fn purge_expired_ignores(&self, now: DateTime<Utc>) -> Result<usize, DatabaseError> {
        let _guard = self.shared().await;
        let n = self
            .conn()
            .execute(
                "DELETE FROM ignored_contacts WHERE expires_at IS NOT NULL AND expires_at <= ?1",
                params![ts(now)],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("purge_expired_ignores: {e}")))?;
        Ok(n as usize)
    }

    async fn list_ignored(&self, now: DateTime<Utc>) -> Result<Vec<IgnoredContact>, DatabaseError> {
        let _guard = self.shared().await;
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {IGNORED_COLUMNS} FROM ignored_contacts
                     WHERE expires_at IS NULL OR expires_at > ?1 ORDER BY ignored_at DESC"
                ),
                params![ts(now)],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_ignored: {e}")))?;

        let mut out = Vec::new();
        while let Some(row) = next_row(&mut rows, "list_ignored").await? {
            out.push(row_to_ignored(&row).map_err(parse_err("list_ignored"))?);
        }
        Ok(out)
    }

    // ── Prompt settings ─────────────────────────────────────────────

    async fn get_prompt_settings(&self) -> Result<Vec<(String, String)>, DatabaseError> {
        let _guard = self.shared().await;
        let mut rows = self
            .conn()
            .query("SELECT key, value FROM prompt_settings ORDER BY key", ())
            .await
            .map_err(|e| DatabaseError::Query(format!("get_prompt_settings: {e}")))?;

        let mut out = Vec::new();
        while let Some(row) = next_row(&mut rows, "get_prompt_settings").await? {
            let key: String = row.get(0).map_err(parse_err("get_prompt_settings"))?;
            let value: String = row.get(1).map_err(parse_err("get_prompt_settings"))?;
            out.push((key, value));
        }
        Ok(out)
    }

    async fn set_prompt_setting(&self, key: &str, value: &str) -> Result<(), DatabaseError> {
        let _guard = self.shared().await;
        self.conn()
            .execute(
                "INSERT INTO prompt_settings (key, value, updated_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
                params![key, value, ts(Utc::now())],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("set_prompt_setting: {e}")))?;
        Ok(())
    }

    // ── Agenda ──────────────────────────────────────────────────────

    async fn insert_agenda_item(
        &self,
        session_id: &str,
        phone: &str,
        text: &str,
        send_at: DateTime<Utc>,
    ) -> Result<AgendaItem, DatabaseError> {
        let _guard = self.shared().await;
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "INSERT INTO agenda (session_id, phone, text, send_at, status, attempts, created_at)
                     VALUES (?1, ?2, ?3, ?4, 'pending', 0, ?5) RETURNING {AGENDA_COLUMNS}"
                ),
                params![session_id, phone, text, ts(send_at), ts(Utc::now())],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("insert_agenda_item: {e}")))?;

        let row = next_row(&mut rows, "insert_agenda_item")
            .await?
            .ok_or_else(|| DatabaseError::Query("insert_agenda_item: no row returned".into()))?;
        row_to_agenda(&row).map_err(parse_err("insert_agenda_item"))
    }

    async fn due_agenda_items(
        &self,
        session_id: &str,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<AgendaItem>, DatabaseError> {
        let _guard = self.shared().await;
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {AGENDA_COLUMNS} FROM agenda
                     WHERE session_id = ?1 AND status = 'pending' AND send_at <= ?2
                     ORDER BY send_at, id LIMIT ?3"
                ),
                params![session_id, ts(now), limit as i64],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("due_agenda_items: {e}")))?;

        let mut out = Vec::new();
        while let Some(row) = next_row(&mut rows, "due_agenda_items").await? {
            out.push(row_to_agenda(&row).map_err(parse_err("due_agenda_items"))?);
        }
        Ok(out)
    }

    async fn mark_agenda_sent(&self, id: i64) -> Result<(), DatabaseError> {
        let _guard = self.shared().await;
        self.conn()
            .execute(
                "UPDATE agenda SET status = 'sent', attempts = attempts + 1, last_error = NULL WHERE id = ?1",
                params![id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("mark_agenda_sent: {e}")))?;
        Ok(())
    }

    async fn record_agenda_failure(
        &self,
        id: i64,
        attempts: u32,
        error: &str,
        give_up: bool,
    ) -> Result<(), DatabaseError> {
        let _guard = self.shared().await;
        let status = if give_up {
            AgendaStatus::Failed
        } else {
            AgendaStatus::Pending
        };
        self.conn()
            .execute(
                "UPDATE agenda SET status = ?2, attempts = ?3, last_error = ?4 WHERE id = ?1",
                params![id, status.as_str(), attempts as i64, error],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("record_agenda_failure: {e}")))?;
        Ok(())
    }
}
