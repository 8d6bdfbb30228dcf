//! Test doubles shared by unit tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use rust_decimal::Decimal;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

use crate::error::{LlmError, TransportError};
use crate::llm::{CompletionRequest, CompletionResponse, FinishReason, LlmProvider};
use crate::transport::{
    ConnectionUpdate, EventStream, RawEnvelope, Transport, TransportEvent, TransportFactory,
};

/// Poll `cond` until it holds, failing the test after two seconds.
pub async fn wait_until(mut cond: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(2), async {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not met in time");
}

/// In-process transport. Events are pushed with `emit`.
#[derive(Default)]
pub struct MockTransport {
    tx: Mutex<Option<mpsc::UnboundedSender<TransportEvent>>>,
    auto_open: Option<String>,
    pub connects: AtomicUsize,
    pub disconnects: AtomicUsize,
    pub wipes: AtomicUsize,
    pub fail_send: AtomicBool,
    pub sent: Mutex<Vec<(String, String, Instant)>>,
    pub resends: Mutex<Vec<String>>,
    pub served: Mutex<Vec<(String, Option<serde_json::Value>)>>,
    next_id: AtomicUsize,
}

impl MockTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// A transport that reports the connection open as soon as it connects.
    pub fn auto_open(self_id: &str) -> Arc<Self> {
        Arc::new(Self {
            auto_open: Some(self_id.to_string()),
            ..Self::default()
        })
    }

    pub fn emit(&self, event: TransportEvent) -> bool {
        self.tx
            .lock()
            .unwrap()
            .as_ref()
            .is_some_and(|tx| tx.send(event).is_ok())
    }

    pub fn sent_texts(&self) -> Vec<(String, String)> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .map(|(to, text, _)| (to.clone(), text.clone()))
            .collect()
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn connect(&self) -> Result<EventStream, TransportError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::unbounded_channel();
        if let Some(self_id) = &self.auto_open {
            let _ = tx.send(TransportEvent::Connection(ConnectionUpdate::Open {
                self_id: self_id.clone(),
            }));
        }
        *self.tx.lock().unwrap() = Some(tx);
        Ok(Box::pin(UnboundedReceiverStream::new(rx)))
    }

    async fn send_text(
        &self,
        recipient: &str,
        text: &str,
    ) -> Result<Option<String>, TransportError> {
        if self.fail_send.load(Ordering::SeqCst) {
            return Err(TransportError::SendFailed {
                recipient: recipient.to_string(),
                reason: "mock failure".into(),
            });
        }
        self.sent
            .lock()
            .unwrap()
            .push((recipient.to_string(), text.to_string(), Instant::now()));
        let n = self.next_id.fetch_add(1, Ordering::SeqCst);
        Ok(Some(format!("OUT{n}")))
    }

    async fn request_resend(&self, envelope: &RawEnvelope) -> Result<(), TransportError> {
        self.resends.lock().unwrap().push(envelope.id.clone());
        Ok(())
    }

    async fn serve_message(
        &self,
        id: &str,
        payload: Option<serde_json::Value>,
    ) -> Result<(), TransportError> {
        self.served.lock().unwrap().push((id.to_string(), payload));
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        self.disconnects.fetch_add(1, Ordering::SeqCst);
        self.tx.lock().unwrap().take();
        Ok(())
    }

    async fn wipe_credentials(&self) -> Result<(), TransportError> {
        self.wipes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Hands out auto-opening mock transports and remembers them by session.
#[derive(Default)]
pub struct MockFactory {
    pub transports: Mutex<HashMap<String, Arc<MockTransport>>>,
}

impl MockFactory {
    pub fn get(&self, session_id: &str) -> Option<Arc<MockTransport>> {
        self.transports.lock().unwrap().get(session_id).cloned()
    }
}

impl TransportFactory for MockFactory {
    fn create(&self, session_id: &str) -> Arc<dyn Transport> {
        let transport = MockTransport::auto_open("5215559999@s.whatsapp.net");
        self.transports
            .lock()
            .unwrap()
            .insert(session_id.to_string(), Arc::clone(&transport));
        transport
    }
}

type Responder = Box<dyn Fn(&CompletionRequest) -> Result<String, LlmError> + Send + Sync>;

/// Scripted LLM. The responder sees every request and returns the content.
pub struct StubLlm {
    responder: Responder,
    pub requests: Mutex<Vec<CompletionRequest>>,
}

impl StubLlm {
    pub fn new(
        responder: impl Fn(&CompletionRequest) -> Result<String, LlmError> + Send + Sync + 'static,
    ) -> Arc<Self> {
        Arc::new(Self {
            responder: Box::new(responder),
            requests: Mutex::new(Vec::new()),
        })
    }

    pub fn fixed(content: &str) -> Arc<Self> {
        let content = content.to_string();
        Self::new(move |_| Ok(content.clone()))
    }

    pub fn calls(&self) -> usize {
        self.requests.lock().unwrap().len()
    }
}

#[async_trait]
impl LlmProvider for StubLlm {
    fn model_name(&self) -> &str {
        "stub"
    }

    fn cost_per_token(&self) -> (Decimal, Decimal) {
        (Decimal::ZERO, Decimal::ZERO)
    }

    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LlmError> {
        let result = (self.responder)(&request);
        self.requests.lock().unwrap().push(request);
        result.map(|content| CompletionResponse {
            content,
            input_tokens: 0,
            output_tokens: 0,
            finish_reason: FinishReason::Stop,
            response_id: None,
        })
    }
}
