//! HTTP bridge transport.
//!
//! Talks to a sidecar gateway that owns the chat network protocol. The
//! gateway exposes, per session:
//!
//! - `POST   /sessions/{id}/connect`
//! - `GET    /sessions/{id}/events?cursor=N&timeout=S` (long poll)
//! - `POST   /sessions/{id}/send`        `{"to", "text"}` → `{"id"}`
//! - `POST   /sessions/{id}/resend`      `{"id", "remote"}`
//! - `POST   /sessions/{id}/serve`       `{"id", "message"}`
//! - `POST   /sessions/{id}/disconnect`
//! - `DELETE /sessions/{id}/credentials`

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::UnboundedReceiverStream;

use crate::error::TransportError;
use crate::transport::{
    CloseReason, ConnectionUpdate, EventStream, RawEnvelope, Transport, TransportEvent,
    TransportFactory,
};

const POLL_TIMEOUT_SECS: u64 = 25;
const POLL_RETRY_DELAY: Duration = Duration::from_secs(5);
/// Consecutive poll failures before the stream reports a transient close.
const MAX_POLL_FAILURES: u32 = 3;

/// Event as the gateway serializes it.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum WireEvent {
    Open {
        self_id: String,
    },
    Close {
        reason: String,
        #[serde(default)]
        detail: Option<String>,
    },
    Qr {
        code: String,
    },
    Messages {
        messages: Vec<serde_json::Value>,
    },
    ResendLookup {
        id: String,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct EventsPage {
    cursor: u64,
    #[serde(default)]
    events: Vec<serde_json::Value>,
}

fn close_reason(reason: &str, detail: Option<String>) -> CloseReason {
    match reason {
        "logged_out" => CloseReason::LoggedOut,
        "replaced" | "conflict" => CloseReason::Replaced,
        "qr_timeout" => CloseReason::QrTimeout,
        other => CloseReason::Transient(detail.unwrap_or_else(|| other.to_string())),
    }
}

/// Keep the original JSON on the envelope for resend lookups.
fn parse_envelope(value: serde_json::Value) -> Result<RawEnvelope, serde_json::Error> {
    let mut envelope: RawEnvelope = serde_json::from_value(value.clone())?;
    envelope.raw = value;
    Ok(envelope)
}

/// Convert one wire event. Malformed messages inside a batch are dropped.
fn convert_event(value: serde_json::Value) -> Option<TransportEvent> {
    let event: WireEvent = match serde_json::from_value(value) {
        Ok(e) => e,
        Err(e) => {
            tracing::warn!(error = %e, "Bridge sent an unparseable event");
            return None;
        }
    };
    match event {
        WireEvent::Open { self_id } => {
            Some(TransportEvent::Connection(ConnectionUpdate::Open { self_id }))
        }
        WireEvent::Close { reason, detail } => Some(TransportEvent::Connection(
            ConnectionUpdate::Close {
                reason: close_reason(&reason, detail),
            },
        )),
        WireEvent::Qr { code } => Some(TransportEvent::Connection(ConnectionUpdate::Qr { code })),
        WireEvent::Messages { messages } => {
            let batch: Vec<RawEnvelope> = messages
                .into_iter()
                .filter_map(|m| match parse_envelope(m) {
                    Ok(env) => Some(env),
                    Err(e) => {
                        tracing::warn!(error = %e, "Dropping malformed envelope");
                        None
                    }
                })
                .collect();
            (!batch.is_empty()).then_some(TransportEvent::Messages(batch))
        }
        WireEvent::ResendLookup { id } => Some(TransportEvent::ResendLookup { id }),
        WireEvent::Other => None,
    }
}

/// Transport backed by the HTTP gateway.
pub struct BridgeTransport {
    client: reqwest::Client,
    base_url: String,
    session_id: String,
    poller: Mutex<Option<JoinHandle<()>>>,
}

impl BridgeTransport {
    pub fn new(client: reqwest::Client, base_url: &str, session_id: &str) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            session_id: session_id.to_string(),
            poller: Mutex::new(None),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/sessions/{}/{}", self.base_url, self.session_id, path)
    }

    async fn post(
        &self,
        path: &str,
        body: serde_json::Value,
    ) -> Result<reqwest::Response, TransportError> {
        let resp = self
            .client
            .post(self.url(path))
            .json(&body)
            .send()
            .await
            .map_err(|e| TransportError::Http(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(TransportError::Http(format!(
                "{path} returned HTTP {}",
                resp.status()
            )));
        }
        Ok(resp)
    }

    async fn stop_poller(&self) {
        if let Some(handle) = self.poller.lock().await.take() {
            handle.abort();
        }
    }
}

async fn poll_events(
    client: reqwest::Client,
    url: String,
    session_id: String,
    tx: mpsc::UnboundedSender<TransportEvent>,
) {
    let mut cursor: u64 = 0;
    let mut failures: u32 = 0;

    loop {
        let result = client
            .get(&url)
            .query(&[("cursor", cursor), ("timeout", POLL_TIMEOUT_SECS)])
            .timeout(Duration::from_secs(POLL_TIMEOUT_SECS + 10))
            .send()
            .await;

        let page = match result {
            Ok(resp) if resp.status().is_success() => {
                resp.json::<EventsPage>().await.map_err(|e| e.to_string())
            }
            Ok(resp) => Err(format!("HTTP {}", resp.status())),
            Err(e) => Err(e.to_string()),
        };

        let page = match page {
            Ok(p) => {
                failures = 0;
                p
            }
            Err(e) => {
                failures += 1;
                tracing::warn!(session = %session_id, failures, "Bridge poll error: {e}");
                if failures >= MAX_POLL_FAILURES {
                    let _ = tx.send(TransportEvent::Connection(ConnectionUpdate::Close {
                        reason: CloseReason::Transient(format!("bridge unreachable: {e}")),
                    }));
                    return;
                }
                tokio::time::sleep(POLL_RETRY_DELAY).await;
                continue;
            }
        };

        cursor = page.cursor;
        for value in page.events {
            let Some(event) = convert_event(value) else {
                continue;
            };
            let closing = matches!(
                event,
                TransportEvent::Connection(ConnectionUpdate::Close { .. })
            );
            if tx.send(event).is_err() {
                tracing::debug!(session = %session_id, "Bridge listener dropped");
                return;
            }
            if closing {
                return;
            }
        }
    }
}

#[async_trait]
impl Transport for BridgeTransport {
    async fn connect(&self) -> Result<EventStream, TransportError> {
        self.stop_poller().await;
        self.post("connect", json!({}))
            .await
            .map_err(|e| TransportError::ConnectFailed {
                session: self.session_id.clone(),
                reason: e.to_string(),
            })?;

        let (tx, rx) = mpsc::unbounded_channel();
        let handle = tokio::spawn(poll_events(
            self.client.clone(),
            self.url("events"),
            self.session_id.clone(),
            tx,
        ));
        *self.poller.lock().await = Some(handle);

        tracing::info!(session = %self.session_id, "Bridge transport listening");
        Ok(Box::pin(UnboundedReceiverStream::new(rx)))
    }

    async fn send_text(
        &self,
        recipient: &str,
        text: &str,
    ) -> Result<Option<String>, TransportError> {
        #[derive(Deserialize)]
        struct Sent {
            id: Option<String>,
        }

        let resp = self
            .post("send", json!({ "to": recipient, "text": text }))
            .await
            .map_err(|e| TransportError::SendFailed {
                recipient: recipient.to_string(),
                reason: e.to_string(),
            })?;
        let sent: Sent = resp.json().await.map_err(|e| TransportError::SendFailed {
            recipient: recipient.to_string(),
            reason: format!("bad send response: {e}"),
        })?;
        Ok(sent.id)
    }

    async fn request_resend(&self, envelope: &RawEnvelope) -> Result<(), TransportError> {
        self.post(
            "resend",
            json!({ "id": envelope.id, "remote": envelope.remote }),
        )
        .await?;
        Ok(())
    }

    async fn serve_message(
        &self,
        id: &str,
        payload: Option<serde_json::Value>,
    ) -> Result<(), TransportError> {
        self.post("serve", json!({ "id": id, "message": payload }))
            .await?;
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        self.stop_poller().await;
        self.post("disconnect", json!({})).await?;
        Ok(())
    }

    async fn wipe_credentials(&self) -> Result<(), TransportError> {
        self.stop_poller().await;
        let resp = self
            .client
            .delete(self.url("credentials"))
            .send()
            .await
            .map_err(|e| TransportError::Http(e.to_string()))?;
        if !resp.status().is_success() && resp.status() != reqwest::StatusCode::NOT_FOUND {
            return Err(TransportError::Http(format!(
                "credentials returned HTTP {}",
                resp.status()
            )));
        }
        Ok(())
    }
}

/// Creates one `BridgeTransport` per session, sharing an HTTP client.
pub struct BridgeTransportFactory {
    client: reqwest::Client,
    base_url: String,
}

impl BridgeTransportFactory {
    pub fn new(base_url: &str) -> Self {
        Self {
            client: reqwest::Client::builder()
                .connect_timeout(Duration::from_secs(10))
                .build()
                .unwrap_or_default(),
            base_url: base_url.to_string(),
        }
    }
}

impl TransportFactory for BridgeTransportFactory {
    fn create(&self, session_id: &str) -> Arc<dyn Transport> {
        Arc::new(BridgeTransport::new(
            self.client.clone(),
            &self.base_url,
            session_id,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::extract::{Path, Query};
    use axum::routing::{get, post};
    use axum::{Json, Router};
    use futures::StreamExt;
    use std::collections::HashMap;

    #[test]
    fn close_reasons_map() {
        assert_eq!(close_reason("logged_out", None), CloseReason::LoggedOut);
        assert_eq!(close_reason("conflict", None), CloseReason::Replaced);
        assert_eq!(close_reason("qr_timeout", None), CloseReason::QrTimeout);
        assert_eq!(
            close_reason("connection_lost", Some("reset by peer".into())),
            CloseReason::Transient("reset by peer".into())
        );
    }

    #[test]
    fn message_batch_keeps_raw_and_drops_malformed() {
        let event = convert_event(json!({
            "type": "messages",
            "messages": [
                {"id": "M1", "remote": "5215550001@s.whatsapp.net", "content": {"type": "text", "text": "hola"}},
                {"no_id": true}
            ]
        }))
        .unwrap();
        let TransportEvent::Messages(batch) = event else {
            panic!("expected messages");
        };
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].raw["id"], "M1");
    }

    #[test]
    fn unknown_event_types_are_skipped() {
        assert!(convert_event(json!({"type": "presence", "who": "x"})).is_none());
        assert!(convert_event(json!({"type": "messages", "messages": []})).is_none());
    }

    async fn spawn_gateway() -> String {
        async fn events(
            Path(_id): Path<String>,
            Query(q): Query<HashMap<String, u64>>,
        ) -> Json<serde_json::Value> {
            match q.get("cursor").copied().unwrap_or(0) {
                0 => Json(json!({
                    "cursor": 1,
                    "events": [{"type": "qr", "code": "QR-CODE"}]
                })),
                _ => Json(json!({
                    "cursor": 2,
                    "events": [
                        {"type": "open", "self_id": "5215559999@s.whatsapp.net"},
                        {"type": "close", "reason": "logged_out"}
                    ]
                })),
            }
        }

        let app = Router::new()
            .route("/sessions/{id}/connect", post(|| async { Json(json!({})) }))
            .route("/sessions/{id}/events", get(events))
            .route(
                "/sessions/{id}/send",
                post(|| async { Json(json!({"id": "WAMID-1"})) }),
            );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}")
    }

    #[tokio::test]
    async fn streams_gateway_events_until_close() {
        let base = spawn_gateway().await;
        let transport = BridgeTransport::new(reqwest::Client::new(), &base, "tenant-a");

        let stream = transport.connect().await.unwrap();
        let events: Vec<TransportEvent> = tokio::time::timeout(
            Duration::from_secs(5),
            stream.collect::<Vec<_>>(),
        )
        .await
        .unwrap();

        assert_eq!(
            events,
            vec![
                TransportEvent::Connection(ConnectionUpdate::Qr {
                    code: "QR-CODE".into()
                }),
                TransportEvent::Connection(ConnectionUpdate::Open {
                    self_id: "5215559999@s.whatsapp.net".into()
                }),
                TransportEvent::Connection(ConnectionUpdate::Close {
                    reason: CloseReason::LoggedOut
                }),
            ]
        );

        let id = transport.send_text("5215550001", "hola").await.unwrap();
        assert_eq!(id.as_deref(), Some("WAMID-1"));
    }
}
