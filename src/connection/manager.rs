//! Connection lifecycle manager.
//!
//! Owns one transport connection for one session. Feeds connection events
//! through the pure `transition` function and executes the resulting
//! effects: persisting status, scheduling reconnects, wiping credentials,
//! and starting or stopping the session's background loops via the
//! `LinkObserver`.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use futures::StreamExt;
use rand::Rng;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::ReconnectPolicy;
use crate::connection::cache::MessageCache;
use crate::connection::state::{Effect, LinkEvent, LinkState, transition};
use crate::error::TransportError;
use crate::store::{Database, SessionStatus};
use crate::transport::{
    ConnectionUpdate, DecodeOutcome, EventStream, RawEnvelope, Transport, TransportEvent,
};

/// How long a reconnect waits for the previous event loop to wind down.
const LISTENER_EXIT_GRACE: Duration = Duration::from_secs(5);

/// Receives lifecycle notifications and decoded inbound batches.
#[async_trait]
pub trait LinkObserver: Send + Sync {
    /// Status changed. `qr` is set while a pairing code is pending.
    async fn on_status(&self, status: SessionStatus, qr: Option<String>);

    /// Connection is open; start background work.
    async fn on_connected(&self);

    /// Connection lost or stopped; cancel background work.
    async fn on_disconnected(&self);

    /// An inbound batch, in delivery order. Undecodable envelopes are held
    /// back for resend and never appear here.
    async fn on_messages(&self, batch: Vec<RawEnvelope>);
}

pub struct ConnectionManager {
    session_id: String,
    transport: Arc<dyn Transport>,
    db: Arc<dyn Database>,
    policy: ReconnectPolicy,
    cache: Arc<MessageCache>,
    observer: Arc<dyn LinkObserver>,
    state: Mutex<LinkState>,
    init_lock: tokio::sync::Mutex<()>,
    event_loop: Mutex<Option<JoinHandle<()>>>,
    reconnect_timer: Mutex<Option<JoinHandle<()>>>,
    decode_retries: Mutex<HashMap<String, u32>>,
    resend_tasks: Mutex<Vec<JoinHandle<()>>>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|p| p.into_inner())
}

/// Abort `handle` unless it is the task currently running.
fn abort_unless_current(handle: JoinHandle<()>) {
    if tokio::task::try_id() != Some(handle.id()) {
        handle.abort();
    }
}

impl ConnectionManager {
    pub fn new(
        session_id: &str,
        transport: Arc<dyn Transport>,
        db: Arc<dyn Database>,
        policy: ReconnectPolicy,
        cache: Arc<MessageCache>,
        observer: Arc<dyn LinkObserver>,
    ) -> Arc<Self> {
        Arc::new(Self {
            session_id: session_id.to_string(),
            transport,
            db,
            policy,
            cache,
            observer,
            state: Mutex::new(LinkState::default()),
            init_lock: tokio::sync::Mutex::new(()),
            event_loop: Mutex::new(None),
            reconnect_timer: Mutex::new(None),
            decode_retries: Mutex::new(HashMap::new()),
            resend_tasks: Mutex::new(Vec::new()),
        })
    }

    pub fn status(&self) -> SessionStatus {
        lock(&self.state).status
    }

    pub fn self_id(&self) -> Option<String> {
        lock(&self.state).self_id.clone()
    }

    pub fn state(&self) -> LinkState {
        lock(&self.state).clone()
    }

    fn is_listening(&self) -> bool {
        lock(&self.event_loop)
            .as_ref()
            .is_some_and(|h| !h.is_finished())
    }

    /// Start the connection. Concurrent callers wait for the single
    /// in-flight attempt; a call while already listening is a no-op.
    pub async fn initialize(self: &Arc<Self>) -> Result<(), TransportError> {
        self.connect(true).await
    }

    async fn connect(self: &Arc<Self>, manual: bool) -> Result<(), TransportError> {
        let _guard = self.init_lock.lock().await;
        if self.is_listening() {
            return Ok(());
        }
        if !manual && lock(&self.state).halted {
            debug!(session = %self.session_id, "Reconnect skipped, session halted");
            return Ok(());
        }

        let effects = self.apply(LinkEvent::Connecting { manual });
        self.execute(effects).await;

        match self.transport.connect().await {
            Ok(stream) => {
                let this = Arc::clone(self);
                let handle = tokio::spawn(async move { this.run_events(stream).await });
                *lock(&self.event_loop) = Some(handle);
                Ok(())
            }
            Err(e) => {
                warn!(session = %self.session_id, "Transport connect failed: {e}");
                let effects = self.apply(LinkEvent::ConnectFailed(e.to_string()));
                self.execute(effects).await;
                Err(e)
            }
        }
    }

    /// Stop reconnecting and close the connection, keeping credentials.
    pub async fn stop(self: &Arc<Self>) {
        self.shutdown(LinkEvent::Stop, true).await;
    }

    /// Stop and wipe credentials; the next start pairs from scratch.
    pub async fn logout(self: &Arc<Self>) {
        self.shutdown(LinkEvent::Logout, true).await;
    }

    /// Close the connection for process exit. The persisted status is left
    /// as it was so the session can be restored on the next start.
    pub async fn release(self: &Arc<Self>) {
        self.shutdown(LinkEvent::Stop, false).await;
    }

    async fn shutdown(self: &Arc<Self>, event: LinkEvent, persist: bool) {
        let _guard = self.init_lock.lock().await;
        if let Some(timer) = lock(&self.reconnect_timer).take() {
            timer.abort();
        }
        if let Some(listener) = lock(&self.event_loop).take() {
            listener.abort();
        }
        for task in lock(&self.resend_tasks).drain(..) {
            task.abort();
        }
        lock(&self.decode_retries).clear();

        let mut effects = self.apply(event);
        if !persist {
            effects.retain(|e| !matches!(e, Effect::PersistStatus { .. }));
        }
        self.execute(effects).await;

        if let Err(e) = self.transport.disconnect().await {
            debug!(session = %self.session_id, "Transport disconnect: {e}");
        }
        info!(session = %self.session_id, "Connection closed");
    }

    fn apply(&self, event: LinkEvent) -> Vec<Effect> {
        let jitter: f64 = rand::thread_rng().gen_range(-1.0..=1.0);
        let mut state = lock(&self.state);
        let (next, effects) = transition(&state, event, &self.policy, Utc::now(), jitter);
        *state = next;
        effects
    }

    async fn execute(self: &Arc<Self>, effects: Vec<Effect>) {
        for effect in effects {
            match effect {
                Effect::PersistStatus { status, qr, phone } => {
                    if let Err(e) = self
                        .db
                        .update_session_status(
                            &self.session_id,
                            status,
                            qr.as_deref(),
                            phone.as_deref(),
                        )
                        .await
                    {
                        warn!(session = %self.session_id, "Failed to persist status: {e}");
                    }
                    self.observer.on_status(status, qr).await;
                }
                Effect::EmitQr(_) => {
                    info!(session = %self.session_id, "Pairing code issued");
                }
                Effect::StartLoops => {
                    info!(session = %self.session_id, "Connected");
                    self.observer.on_connected().await;
                }
                Effect::StopLoops => self.observer.on_disconnected().await,
                Effect::ScheduleReconnect(delay) => {
                    info!(
                        session = %self.session_id,
                        delay_ms = delay.as_millis() as u64,
                        "Reconnect scheduled"
                    );
                    self.schedule_reconnect(delay);
                }
                Effect::RestartPairing => {
                    info!(session = %self.session_id, "Pairing timed out, restarting");
                    self.schedule_reconnect(Duration::ZERO);
                }
                Effect::WipeAndRelink => {
                    warn!(
                        session = %self.session_id,
                        "Repeated conflicts, wiping credentials and re-pairing"
                    );
                    if let Err(e) = self.transport.wipe_credentials().await {
                        warn!(session = %self.session_id, "Credential wipe failed: {e}");
                    }
                    self.schedule_reconnect(Duration::ZERO);
                }
                Effect::ClearCredentials => {
                    if let Err(e) = self.transport.wipe_credentials().await {
                        warn!(session = %self.session_id, "Credential wipe failed: {e}");
                    }
                }
                Effect::Halt => {
                    if let Some(timer) = lock(&self.reconnect_timer).take() {
                        abort_unless_current(timer);
                    }
                    info!(session = %self.session_id, status = %self.status(), "Reconnects halted");
                }
            }
        }
    }

    fn schedule_reconnect(self: &Arc<Self>, delay: Duration) {
        let this = Arc::clone(self);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            this.wait_for_listener_exit().await;
            if let Err(e) = this.connect(false).await {
                debug!(session = %this.session_id, "Reconnect attempt failed: {e}");
            }
        });
        if let Some(old) = lock(&self.reconnect_timer).replace(handle) {
            abort_unless_current(old);
        }
    }

    async fn wait_for_listener_exit(&self) {
        let handle = lock(&self.event_loop).take();
        if let Some(handle) = handle {
            let abort = handle.abort_handle();
            if tokio::time::timeout(LISTENER_EXIT_GRACE, handle).await.is_err() {
                abort.abort();
            }
        }
    }

    async fn run_events(self: Arc<Self>, mut stream: EventStream) {
        while let Some(event) = stream.next().await {
            if !self.handle_event(event).await {
                return;
            }
        }
        let effects = self.apply(LinkEvent::Closed(crate::transport::CloseReason::Transient(
            "event stream ended".into(),
        )));
        self.execute(effects).await;
    }

    /// Returns `false` once the connection has closed.
    async fn handle_event(self: &Arc<Self>, event: TransportEvent) -> bool {
        match event {
            TransportEvent::Connection(ConnectionUpdate::Qr { code }) => {
                let effects = self.apply(LinkEvent::Qr(code));
                self.execute(effects).await;
                true
            }
            TransportEvent::Connection(ConnectionUpdate::Open { self_id }) => {
                let effects = self.apply(LinkEvent::Open { self_id });
                self.execute(effects).await;
                true
            }
            TransportEvent::Connection(ConnectionUpdate::Close { reason }) => {
                info!(session = %self.session_id, ?reason, "Connection closed by transport");
                let effects = self.apply(LinkEvent::Closed(reason));
                self.execute(effects).await;
                false
            }
            TransportEvent::Messages(batch) => {
                self.process_batch(batch).await;
                true
            }
            TransportEvent::ResendLookup { id } => {
                let payload = self.cache.get(&id);
                debug!(
                    session = %self.session_id,
                    id = %id,
                    hit = payload.is_some(),
                    "Resend lookup"
                );
                if let Err(e) = self.transport.serve_message(&id, payload).await {
                    warn!(session = %self.session_id, "Failed to serve message {id}: {e}");
                }
                true
            }
        }
    }

    async fn process_batch(self: &Arc<Self>, batch: Vec<RawEnvelope>) {
        let mut accepted = Vec::with_capacity(batch.len());
        for envelope in batch {
            if !envelope.raw.is_null() {
                self.cache.insert(&envelope.id, envelope.raw.clone());
            }
            let undecodable = !envelope.from_me
                && envelope
                    .content
                    .as_ref()
                    .is_some_and(|c| c.classify() == DecodeOutcome::Undecodable);
            if undecodable {
                self.retry_decode(envelope);
            } else {
                lock(&self.decode_retries).remove(&envelope.id);
                accepted.push(envelope);
            }
        }
        if !accepted.is_empty() {
            self.observer.on_messages(accepted).await;
        }
    }

    /// Ask the sender to resend, up to the policy limit, with a growing delay.
    fn retry_decode(self: &Arc<Self>, envelope: RawEnvelope) {
        let attempt = {
            let mut retries = lock(&self.decode_retries);
            if retries.len() >= self.policy.message_cache_size {
                retries.clear();
            }
            let n = retries.entry(envelope.id.clone()).or_insert(0);
            *n += 1;
            *n
        };
        if attempt > self.policy.decode_retry_limit {
            debug!(
                session = %self.session_id,
                id = %envelope.id,
                "Giving up on undecodable message"
            );
            return;
        }

        let delay = self.policy.decode_retry_delay.saturating_mul(attempt);
        let transport = Arc::clone(&self.transport);
        let session_id = self.session_id.clone();
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Err(e) = transport.request_resend(&envelope).await {
                debug!(session = %session_id, id = %envelope.id, "Resend request failed: {e}");
            }
        });

        let mut tasks = lock(&self.resend_tasks);
        tasks.retain(|t| !t.is_finished());
        tasks.push(task);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::LibSqlBackend;
    use crate::testing::{MockTransport, wait_until};
    use crate::transport::{CloseReason, MessageContent};
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct Recorder {
        statuses: Mutex<Vec<SessionStatus>>,
        connected: AtomicUsize,
        disconnected: AtomicUsize,
        batches: Mutex<Vec<Vec<String>>>,
    }

    #[async_trait]
    impl LinkObserver for Recorder {
        async fn on_status(&self, status: SessionStatus, _qr: Option<String>) {
            lock(&self.statuses).push(status);
        }
        async fn on_connected(&self) {
            self.connected.fetch_add(1, Ordering::SeqCst);
        }
        async fn on_disconnected(&self) {
            self.disconnected.fetch_add(1, Ordering::SeqCst);
        }
        async fn on_messages(&self, batch: Vec<RawEnvelope>) {
            lock(&self.batches).push(batch.into_iter().map(|e| e.id).collect());
        }
    }

    fn fast_policy() -> ReconnectPolicy {
        ReconnectPolicy {
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(50),
            decode_retry_delay: Duration::from_millis(5),
            ..ReconnectPolicy::default()
        }
    }

    async fn setup() -> (
        Arc<ConnectionManager>,
        Arc<MockTransport>,
        Arc<Recorder>,
        Arc<dyn Database>,
    ) {
        let db: Arc<dyn Database> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let transport = MockTransport::new();
        let recorder = Arc::new(Recorder::default());
        let manager = ConnectionManager::new(
            "s1",
            transport.clone(),
            Arc::clone(&db),
            fast_policy(),
            Arc::new(MessageCache::new(10)),
            recorder.clone(),
        );
        (manager, transport, recorder, db)
    }

    fn envelope(id: &str, content: MessageContent) -> RawEnvelope {
        RawEnvelope {
            id: id.into(),
            remote: "5215550001@s.whatsapp.net".into(),
            from_me: false,
            push_name: None,
            timestamp: None,
            content: Some(content),
            raw: serde_json::json!({ "id": id }),
        }
    }

    #[tokio::test]
    async fn qr_then_open_connects_and_persists() {
        let (manager, transport, recorder, db) = setup().await;
        manager.initialize().await.unwrap();

        transport.emit(TransportEvent::Connection(ConnectionUpdate::Qr { code: "QR".into() }));
        wait_until(|| manager.status() == SessionStatus::QrPending).await;
        let record = db.get_session("s1").await.unwrap().unwrap();
        assert_eq!(record.qr_code.as_deref(), Some("QR"));

        transport.emit(TransportEvent::Connection(ConnectionUpdate::Open {
            self_id: "5215559999@s.whatsapp.net".into(),
        }));
        wait_until(|| recorder.connected.load(Ordering::SeqCst) == 1).await;
        assert_eq!(manager.status(), SessionStatus::Connected);
        let record = db.get_session("s1").await.unwrap().unwrap();
        assert_eq!(record.phone.as_deref(), Some("5215559999"));
    }

    #[tokio::test]
    async fn concurrent_initialize_connects_once() {
        let (manager, transport, _, _) = setup().await;
        let (a, b) = tokio::join!(manager.initialize(), manager.initialize());
        a.unwrap();
        b.unwrap();
        assert_eq!(transport.connects.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn transient_close_reconnects() {
        let (manager, transport, recorder, _) = setup().await;
        manager.initialize().await.unwrap();
        transport.emit(TransportEvent::Connection(ConnectionUpdate::Open {
            self_id: "1234567@s".into(),
        }));
        wait_until(|| manager.status() == SessionStatus::Connected).await;

        transport.emit(TransportEvent::Connection(ConnectionUpdate::Close {
            reason: CloseReason::Transient("reset".into()),
        }));
        wait_until(|| transport.connects.load(Ordering::SeqCst) == 2).await;
        assert_eq!(recorder.disconnected.load(Ordering::SeqCst), 1);
        assert_eq!(manager.state().reconnect_attempts, 1);
    }

    #[tokio::test]
    async fn logged_out_wipes_and_stays_down() {
        let (manager, transport, _, _) = setup().await;
        manager.initialize().await.unwrap();
        transport.emit(TransportEvent::Connection(ConnectionUpdate::Close {
            reason: CloseReason::LoggedOut,
        }));
        wait_until(|| transport.wipes.load(Ordering::SeqCst) == 1).await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(transport.connects.load(Ordering::SeqCst), 1);
        assert!(manager.state().halted);
        assert_eq!(manager.status(), SessionStatus::Disconnected);
    }

    #[tokio::test]
    async fn undecodable_messages_are_retried_then_dropped() {
        let (manager, transport, recorder, _) = setup().await;
        manager.initialize().await.unwrap();

        for _ in 0..5 {
            let bad = envelope("BAD", MessageContent::Unknown);
            transport.emit(TransportEvent::Messages(vec![bad]));
        }
        let ok = envelope("OK", MessageContent::text("hola"));
        transport.emit(TransportEvent::Messages(vec![ok]));

        wait_until(|| !lock(&recorder.batches).is_empty()).await;
        wait_until(|| lock(&transport.resends).len() == 3).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(lock(&transport.resends).len(), 3);
        assert_eq!(*lock(&recorder.batches), vec![vec!["OK".to_string()]]);
    }

    #[tokio::test]
    async fn resend_lookup_is_served_from_cache() {
        let (manager, transport, _, _) = setup().await;
        manager.initialize().await.unwrap();
        let hola = envelope("M1", MessageContent::text("hola"));
        transport.emit(TransportEvent::Messages(vec![hola]));
        transport.emit(TransportEvent::ResendLookup { id: "M1".into() });
        transport.emit(TransportEvent::ResendLookup { id: "missing".into() });

        wait_until(|| lock(&transport.served).len() == 2).await;
        let served = lock(&transport.served).clone();
        assert_eq!(served[0], ("M1".to_string(), Some(serde_json::json!({ "id": "M1" }))));
        assert_eq!(served[1], ("missing".to_string(), None));
    }

    #[tokio::test]
    async fn stop_keeps_credentials_and_halts() {
        let (manager, transport, recorder, db) = setup().await;
        manager.initialize().await.unwrap();
        manager.stop().await;

        assert_eq!(transport.wipes.load(Ordering::SeqCst), 0);
        assert_eq!(transport.disconnects.load(Ordering::SeqCst), 1);
        assert_eq!(recorder.disconnected.load(Ordering::SeqCst), 1);
        let record = db.get_session("s1").await.unwrap().unwrap();
        assert_eq!(record.status, SessionStatus::Disconnected);

        manager.logout().await;
        assert_eq!(transport.wipes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn release_keeps_persisted_status() {
        let (manager, transport, recorder, db) = setup().await;
        manager.initialize().await.unwrap();
        transport.emit(TransportEvent::Connection(ConnectionUpdate::Open {
            self_id: "5215559999@s.whatsapp.net".into(),
        }));
        wait_until(|| recorder.connected.load(Ordering::SeqCst) == 1).await;

        manager.release().await;
        assert_eq!(recorder.disconnected.load(Ordering::SeqCst), 1);
        assert_eq!(transport.disconnects.load(Ordering::SeqCst), 1);
        let record = db.get_session("s1").await.unwrap().unwrap();
        assert_eq!(record.status, SessionStatus::Connected);
    }
}
