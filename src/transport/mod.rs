//! Chat transport abstraction.
//!
//! A `Transport` owns one connection to the external chat network for one
//! session. It emits connection updates, inbound message batches and resend
//! lookups as a stream, and accepts send/resend/serve calls.

pub mod bridge;
pub mod content;

pub use bridge::{BridgeTransport, BridgeTransportFactory};
pub use content::{DecodeOutcome, MessageContent};

use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use futures::Stream;
use serde::{Deserialize, Serialize};

use crate::error::TransportError;

/// Why the transport connection closed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum CloseReason {
    /// Credentials were revoked from the device.
    LoggedOut,
    /// Another client took over the same credentials.
    Replaced,
    /// The pairing code expired before it was scanned.
    QrTimeout,
    /// Network drop or server restart.
    Transient(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionUpdate {
    Open { self_id: String },
    Close { reason: CloseReason },
    Qr { code: String },
}

/// A message as delivered by the transport, before any engine processing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawEnvelope {
    pub id: String,
    /// Transport address of the chat (e.g. `5215550000@s.whatsapp.net`).
    pub remote: String,
    #[serde(default)]
    pub from_me: bool,
    #[serde(default)]
    pub push_name: Option<String>,
    /// Unix seconds.
    #[serde(default)]
    pub timestamp: Option<i64>,
    #[serde(default)]
    pub content: Option<MessageContent>,
    /// Full payload as received, kept for resend lookups.
    #[serde(default)]
    pub raw: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    Connection(ConnectionUpdate),
    Messages(Vec<RawEnvelope>),
    /// The transport asks for the payload of a message it sent earlier.
    ResendLookup { id: String },
}

pub type EventStream = Pin<Box<dyn Stream<Item = TransportEvent> + Send>>;

/// One connection to the chat network.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Open the connection. Events flow until the stream ends.
    async fn connect(&self) -> Result<EventStream, TransportError>;

    /// Send a text message. Returns the network's delivery id when known.
    async fn send_text(&self, recipient: &str, text: &str)
    -> Result<Option<String>, TransportError>;

    /// Ask the sender's device to re-send a message that failed to decode.
    async fn request_resend(&self, envelope: &RawEnvelope) -> Result<(), TransportError>;

    /// Answer a resend lookup. `None` means the payload is not cached.
    async fn serve_message(
        &self,
        id: &str,
        payload: Option<serde_json::Value>,
    ) -> Result<(), TransportError>;

    /// Close the connection, keeping credentials.
    async fn disconnect(&self) -> Result<(), TransportError>;

    /// Delete stored credentials so the next connect starts a fresh pairing.
    async fn wipe_credentials(&self) -> Result<(), TransportError>;
}

/// Builds a transport per session.
pub trait TransportFactory: Send + Sync {
    fn create(&self, session_id: &str) -> Arc<dyn Transport>;
}

/// Canonical digits-only phone for a transport address or user input.
///
/// Group chats, broadcast lists and status updates return `None`. Device
/// suffixes (`:12`) are stripped.
pub fn canonical_phone(address: &str) -> Option<String> {
    let address = address.trim();
    if let Some((_, domain)) = address.split_once('@')
        && matches!(domain, "g.us" | "broadcast" | "newsletter")
    {
        return None;
    }
    let user = address.split('@').next().unwrap_or_default();
    let user = user.split(':').next().unwrap_or_default();
    let digits: String = user.chars().filter(|c| c.is_ascii_digit()).collect();
    if (7..=15).contains(&digits.len()) {
        Some(digits)
    } else {
        None
    }
}
