//! Persisted entities.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Connection status of a tenant session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Disconnected,
    Connecting,
    QrPending,
    Connected,
    Error,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::QrPending => "qr_pending",
            Self::Connected => "connected",
            Self::Error => "error",
        }
    }

    /// Parse a DB string. Unknown values read as `Disconnected`.
    pub fn parse(s: &str) -> Self {
        match s {
            "connecting" => Self::Connecting,
            "qr_pending" => Self::QrPending,
            "connected" => Self::Connected,
            "error" => Self::Error,
            _ => Self::Disconnected,
        }
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One row per tenant.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRecord {
    pub id: String,
    pub status: SessionStatus,
    /// Current pairing code while `qr_pending`.
    pub qr_code: Option<String>,
    /// Own phone identity once connected.
    pub phone: Option<String>,
    pub connected_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

/// A person the engine has exchanged messages with.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Contact {
    pub id: i64,
    /// Canonical digits-only phone.
    pub phone: String,
    pub name: Option<String>,
    /// Free-form classification tag.
    pub tag: Option<String>,
    /// Dynamic attributes; always a JSON object.
    pub attributes: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Inbound,
    Outbound,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Inbound => "inbound",
            Self::Outbound => "outbound",
        }
    }

    pub fn parse(s: &str) -> Self {
        if s == "outbound" {
            Self::Outbound
        } else {
            Self::Inbound
        }
    }
}

/// A logged message, append-only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageRecord {
    pub id: i64,
    pub contact_id: i64,
    pub phone: String,
    pub direction: Direction,
    pub text: String,
    pub external_id: Option<String>,
    pub session_id: String,
    pub created_at: DateTime<Utc>,
}

/// A message about to be logged. Travels through the outbox as JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewMessage {
    pub session_id: String,
    pub phone: String,
    /// Display name reported by the transport, used when creating the contact.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub push_name: Option<String>,
    pub direction: Direction,
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_id: Option<String>,
    pub at: DateTime<Utc>,
}

/// A durable side-effect awaiting execution.
#[derive(Debug, Clone)]
pub struct OutboxItem {
    pub id: i64,
    pub session_id: String,
    pub idempotency_key: String,
    pub op_type: String,
    pub payload: String,
    pub attempts: u32,
    pub next_attempt_at: DateTime<Utc>,
}

/// A drip campaign definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sequence {
    pub id: i64,
    pub trigger: String,
    pub steps: Vec<String>,
    pub active: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressStatus {
    Idle,
    Active,
    Completed,
}

impl ProgressStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Active => "active",
            Self::Completed => "completed",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "active" => Self::Active,
            "completed" => Self::Completed,
            _ => Self::Idle,
        }
    }
}

/// Where a contact is in a sequence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SequenceProgress {
    pub session_id: String,
    pub phone: String,
    pub status: ProgressStatus,
    pub trigger: Option<String>,
    pub current_step: u32,
    pub total_steps: u32,
    pub last_inbound_at: Option<DateTime<Utc>>,
    pub last_outbound_at: Option<DateTime<Utc>>,
}

impl SequenceProgress {
    pub fn idle(session_id: &str, phone: &str) -> Self {
        Self {
            session_id: session_id.to_string(),
            phone: phone.to_string(),
            status: ProgressStatus::Idle,
            trigger: None,
            current_step: 0,
            total_steps: 0,
            last_inbound_at: None,
            last_outbound_at: None,
        }
    }
}

/// A contact the conversational engine must not engage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IgnoredContact {
    pub phone: String,
    pub reason: String,
    pub first_message: String,
    pub ignored_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl IgnoredContact {
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_none_or(|exp| exp > now)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgendaStatus {
    Pending,
    Sent,
    Failed,
}

impl AgendaStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Sent => "sent",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "sent" => Self::Sent,
            "failed" => Self::Failed,
            _ => Self::Pending,
        }
    }
}

/// A scheduled one-off outbound message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgendaItem {
    pub id: i64,
    pub session_id: String,
    pub phone: String,
    pub text: String,
    pub send_at: DateTime<Utc>,
    pub status: AgendaStatus,
    pub attempts: u32,
    pub last_error: Option<String>,
}
