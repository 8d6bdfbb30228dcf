//! Integration tests for the management API.
//!
//! Each test spins up an Axum server on a random port over an in-memory
//! database and an in-process transport, then drives the real REST and
//! WebSocket contract.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use rust_decimal::Decimal;
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

use session_engine::api::api_routes;
use session_engine::config::EngineConfig;
use session_engine::error::{LlmError, TransportError};
use session_engine::llm::{CompletionRequest, CompletionResponse, FinishReason, LlmProvider};
use session_engine::session::SessionManager;
use session_engine::store::{Database, LibSqlBackend};
use session_engine::transport::{
    ConnectionUpdate, EventStream, RawEnvelope, Transport, TransportEvent, TransportFactory,
};

/// Maximum time any test is allowed to run before we consider it hung.
const TEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Stub LLM provider (no real API calls). Declines every conversation.
struct StubLlm;

#[async_trait]
impl LlmProvider for StubLlm {
    fn model_name(&self) -> &str {
        "stub"
    }
    fn cost_per_token(&self) -> (Decimal, Decimal) {
        (Decimal::ZERO, Decimal::ZERO)
    }
    async fn complete(&self, _request: CompletionRequest) -> Result<CompletionResponse, LlmError> {
        Ok(CompletionResponse {
            content: r#"{"start": false, "reason": "stub"}"#.to_string(),
            input_tokens: 0,
            output_tokens: 0,
            finish_reason: FinishReason::Stop,
            response_id: None,
        })
    }
}

/// Transport that opens immediately and records sends.
#[derive(Default)]
struct LoopbackTransport {
    tx: Mutex<Option<mpsc::UnboundedSender<TransportEvent>>>,
    sent: Arc<Mutex<Vec<(String, String)>>>,
    next_id: AtomicUsize,
}

#[async_trait]
impl Transport for LoopbackTransport {
    async fn connect(&self) -> Result<EventStream, TransportError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let _ = tx.send(TransportEvent::Connection(ConnectionUpdate::Open {
            self_id: "5215559999@s.whatsapp.net".into(),
        }));
        *self.tx.lock().unwrap() = Some(tx);
        Ok(Box::pin(UnboundedReceiverStream::new(rx)))
    }
    async fn send_text(
        &self,
        recipient: &str,
        text: &str,
    ) -> Result<Option<String>, TransportError> {
        self.sent
            .lock()
            .unwrap()
            .push((recipient.to_string(), text.to_string()));
        Ok(Some(format!("SENT{}", self.next_id.fetch_add(1, Ordering::SeqCst))))
    }
    async fn request_resend(&self, _envelope: &RawEnvelope) -> Result<(), TransportError> {
        Ok(())
    }
    async fn serve_message(
        &self,
        _id: &str,
        _payload: Option<Value>,
    ) -> Result<(), TransportError> {
        Ok(())
    }
    async fn disconnect(&self) -> Result<(), TransportError> {
        self.tx.lock().unwrap().take();
        Ok(())
    }
    async fn wipe_credentials(&self) -> Result<(), TransportError> {
        Ok(())
    }
}

/// Every session shares one send log.
#[derive(Default)]
struct LoopbackFactory {
    sent: Arc<Mutex<Vec<(String, String)>>>,
}

impl TransportFactory for LoopbackFactory {
    fn create(&self, _session_id: &str) -> Arc<dyn Transport> {
        Arc::new(LoopbackTransport {
            sent: Arc::clone(&self.sent),
            ..LoopbackTransport::default()
        })
    }
}

struct Server {
    base: String,
    port: u16,
    db: Arc<dyn Database>,
    sent: Arc<Mutex<Vec<(String, String)>>>,
    client: reqwest::Client,
}

/// Start an Axum server on a random port.
async fn start_server() -> Server {
    let db: Arc<dyn Database> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
    let factory = Arc::new(LoopbackFactory::default());
    let sent = Arc::clone(&factory.sent);

    let mut config = EngineConfig::default();
    config.outbound.min_send_delay = Duration::ZERO;
    config.sequence.startup_delay = Duration::ZERO;
    let sessions = Arc::new(SessionManager::new(
        Arc::clone(&db),
        Arc::new(StubLlm),
        factory,
        config,
    ));
    let app = api_routes(sessions);

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    // Give the server a moment to start accepting connections.
    tokio::time::sleep(Duration::from_millis(50)).await;

    Server {
        base: format!("http://127.0.0.1:{port}"),
        port,
        db,
        sent,
        client: reqwest::Client::new(),
    }
}

impl Server {
    async fn post(&self, path: &str, body: Value) -> (u16, Value) {
        let resp = self
            .client
            .post(format!("{}{path}", self.base))
            .json(&body)
            .send()
            .await
            .unwrap();
        let status = resp.status().as_u16();
        (status, resp.json().await.unwrap_or(Value::Null))
    }

    async fn get(&self, path: &str) -> (u16, Value) {
        let resp = self
            .client
            .get(format!("{}{path}", self.base))
            .send()
            .await
            .unwrap();
        let status = resp.status().as_u16();
        (status, resp.json().await.unwrap_or(Value::Null))
    }

    async fn wait_for_status(&self, id: &str, status: &str) {
        for _ in 0..200 {
            let (_, body) = self.get(&format!("/api/sessions/{id}")).await;
            if body["status"] == status {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("session {id} never reached {status}");
    }
}

#[tokio::test]
async fn health_reports_ok() {
    timeout(TEST_TIMEOUT, async {
        let server = start_server().await;
        let (status, body) = server.get("/health").await;
        assert_eq!(status, 200);
        assert_eq!(body["status"], "ok");
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn session_lifecycle_over_rest() {
    timeout(TEST_TIMEOUT, async {
        let server = start_server().await;

        let (status, body) = server.post("/api/sessions/tenant-1/start", json!({})).await;
        assert_eq!(status, 200);
        assert_eq!(body["id"], "tenant-1");
        server.wait_for_status("tenant-1", "connected").await;

        let (_, body) = server.get("/api/sessions/tenant-1").await;
        assert_eq!(body["phone"], "5215559999");
        assert_eq!(body["loaded"], true);

        let (status, list) = server.get("/api/sessions").await;
        assert_eq!(status, 200);
        assert_eq!(list.as_array().unwrap().len(), 1);

        let (status, body) = server.post("/api/sessions/tenant-1/stop", json!({})).await;
        assert_eq!(status, 200);
        assert_eq!(body["status"], "disconnected");

        let (status, body) = server.post("/api/sessions/tenant-1/logout", json!({})).await;
        assert_eq!(status, 200);
        assert_eq!(body["status"], "disconnected");

        let resp = server
            .client
            .delete(format!("{}/api/sessions/tenant-1", server.base))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status().as_u16(), 200);

        let (status, _) = server.get("/api/sessions/tenant-1").await;
        assert_eq!(status, 404);
        assert!(server.db.get_session("tenant-1").await.unwrap().is_none());
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn bad_ids_and_unknown_sessions_are_rejected() {
    timeout(TEST_TIMEOUT, async {
        let server = start_server().await;

        let (status, body) = server.post("/api/sessions/bad.id/start", json!({})).await;
        assert_eq!(status, 400);
        assert!(body["error"].as_str().unwrap().contains("bad.id"));

        let (status, _) = server.get("/api/sessions/ghost").await;
        assert_eq!(status, 404);
        let (status, _) = server.post("/api/sessions/ghost/stop", json!({})).await;
        assert_eq!(status, 404);
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn manual_sequence_runs_to_completion() {
    timeout(TEST_TIMEOUT, async {
        let server = start_server().await;
        let seq = server.db.upsert_sequence("promo", true).await.unwrap();
        server
            .db
            .replace_sequence_steps(seq, &["Hola, tenemos una oferta".to_string()])
            .await
            .unwrap();

        server.post("/api/sessions/t1/start", json!({})).await;
        server.wait_for_status("t1", "connected").await;

        let (status, body) = server
            .post(
                "/api/sessions/t1/sequences",
                json!({ "phone": "+52 1 555 000 1111", "trigger": "promo", "wait": true }),
            )
            .await;
        assert_eq!(status, 200);
        assert_eq!(body["status"], "completed");
        assert_eq!(
            server.sent.lock().unwrap().clone(),
            vec![("5215550001111".to_string(), "Hola, tenemos una oferta".to_string())]
        );

        let (status, _) = server
            .post(
                "/api/sessions/t1/sequences",
                json!({ "phone": "5215550001111", "trigger": "nope" }),
            )
            .await;
        assert_eq!(status, 404);

        let (status, _) = server
            .post(
                "/api/sessions/t1/sequences",
                json!({ "phone": "12", "trigger": "promo" }),
            )
            .await;
        assert_eq!(status, 400);
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn agenda_and_reload_endpoints() {
    timeout(TEST_TIMEOUT, async {
        let server = start_server().await;
        server.post("/api/sessions/t1/start", json!({})).await;

        let send_at = (chrono::Utc::now() + chrono::Duration::hours(2)).to_rfc3339();
        let (status, item) = server
            .post(
                "/api/sessions/t1/agenda",
                json!({ "phone": "5215550001111", "text": "Recordatorio", "send_at": send_at }),
            )
            .await;
        assert_eq!(status, 201);
        assert_eq!(item["status"], "pending");
        assert_eq!(item["phone"], "5215550001111");

        let (status, _) = server
            .post(
                "/api/sessions/ghost/agenda",
                json!({ "phone": "5215550001111", "text": "x", "send_at": send_at }),
            )
            .await;
        assert_eq!(status, 404);

        let (status, body) = server.post("/api/reload/triggers", json!({})).await;
        assert_eq!(status, 200);
        assert_eq!(body["sessions"], 1);

        let (status, body) = server.post("/api/reload/prompt-config", json!({})).await;
        assert_eq!(status, 200);
        assert_eq!(body["status"], "reloaded");
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn events_socket_syncs_then_streams_status() {
    timeout(TEST_TIMEOUT, async {
        let server = start_server().await;
        let (mut ws, _resp) = connect_async(format!("ws://127.0.0.1:{}/ws/events", server.port))
            .await
            .unwrap();

        let first = ws.next().await.unwrap().unwrap();
        let sync: Value = match first {
            Message::Text(text) => serde_json::from_str(&text).unwrap(),
            other => panic!("expected Text frame, got {other:?}"),
        };
        assert_eq!(sync["type"], "sessions_sync");
        assert!(sync["sessions"].as_array().unwrap().is_empty());

        server.post("/api/sessions/t1/start", json!({})).await;

        loop {
            let Message::Text(text) = ws.next().await.unwrap().unwrap() else {
                continue;
            };
            let event: Value = serde_json::from_str(&text).unwrap();
            assert_eq!(event["type"], "status");
            assert_eq!(event["session_id"], "t1");
            if event["status"] == "connected" {
                break;
            }
        }
    })
    .await
    .expect("test timed out");
}
