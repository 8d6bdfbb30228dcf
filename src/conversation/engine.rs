//! Conversational engine: start gate, slot extraction and replies.
//!
//! Each inbound message becomes a turn on its own task. Turns for one
//! contact are serialized by a processing lock; the actual send goes
//! through the session's `OutboundSender`, which spaces messages.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::Utc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::ConversationConfig;
use crate::conversation::extract::extract;
use crate::conversation::prompt_config::PromptConfigStore;
use crate::conversation::prompts::{fallback_reply, system_prompt};
use crate::conversation::state::ConversationState;
use crate::conversation::trigger::StartGate;
use crate::llm::{ChatMessage, CompletionRequest, LlmProvider};
use crate::outbound::OutboundSender;
use crate::store::Database;
use crate::ticker::InFlight;

/// Conversations held in memory per session.
const MAX_CONVERSATIONS: usize = 1000;

type TurnLock = Arc<tokio::sync::Mutex<()>>;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|p| p.into_inner())
}

pub struct ConversationEngine {
    session_id: String,
    db: Arc<dyn Database>,
    llm: Arc<dyn LlmProvider>,
    sender: Arc<OutboundSender>,
    prompts: Arc<PromptConfigStore>,
    gate: StartGate,
    config: ConversationConfig,
    conversations: Mutex<HashMap<String, ConversationState>>,
    processing: Mutex<HashMap<String, TurnLock>>,
    turns: Mutex<Vec<JoinHandle<()>>>,
    sweeping: InFlight,
}

impl ConversationEngine {
    pub fn new(
        session_id: &str,
        db: Arc<dyn Database>,
        llm: Arc<dyn LlmProvider>,
        sender: Arc<OutboundSender>,
        prompts: Arc<PromptConfigStore>,
        config: ConversationConfig,
    ) -> Self {
        let gate = StartGate::new(Arc::clone(&db), Arc::clone(&llm), config.classify_temperature);
        Self {
            session_id: session_id.to_string(),
            db,
            llm,
            sender,
            prompts,
            gate,
            config,
            conversations: Mutex::new(HashMap::new()),
            processing: Mutex::new(HashMap::new()),
            turns: Mutex::new(Vec::new()),
            sweeping: InFlight::new(),
        }
    }

    /// Whether the contact has a live, not yet cooled-down conversation.
    pub fn is_active(&self, phone: &str) -> bool {
        let now = Utc::now();
        lock(&self.conversations).get(phone).is_some_and(|s| {
            s.active && !s.cooled_down(now, self.config.completion_cooldown)
        })
    }

    pub fn active_count(&self) -> usize {
        lock(&self.conversations).values().filter(|s| s.active).count()
    }

    /// Queue a turn for an inbound message. Returns immediately.
    pub fn handle_inbound(self: &Arc<Self>, phone: &str, push_name: Option<String>, text: String) {
        let this = Arc::clone(self);
        let phone = phone.to_string();
        let task = tokio::spawn(async move {
            this.process(&phone, push_name, text).await;
        });
        let mut turns = lock(&self.turns);
        turns.retain(|t| !t.is_finished());
        turns.push(task);
    }

    fn turn_lock(&self, phone: &str) -> TurnLock {
        Arc::clone(lock(&self.processing).entry(phone.to_string()).or_default())
    }

    fn release_turn_lock(&self, phone: &str, turn: TurnLock) {
        let mut processing = lock(&self.processing);
        if Arc::strong_count(&turn) == 2 {
            processing.remove(phone);
        }
    }

    async fn process(&self, phone: &str, push_name: Option<String>, text: String) {
        let turn = self.turn_lock(phone);
        {
            let _guard = turn.lock().await;
            self.run_turn(phone, push_name, text).await;
        }
        self.release_turn_lock(phone, turn);
    }

    async fn run_turn(&self, phone: &str, push_name: Option<String>, text: String) {
        let config = self.prompts.get().await;
        let now = Utc::now();

        if !self.is_active(phone) {
            let decision = self.gate.decide(&config, phone, &text, now).await;
            if !decision.start {
                debug!(
                    session = %self.session_id,
                    phone = %phone,
                    reason = %decision.reason,
                    "Conversation not started"
                );
                return;
            }
            let mut state = ConversationState::new(&config.mission_fields, push_name, now);
            match self.db.find_contact(phone).await {
                Ok(Some(contact)) => {
                    state.prefill(&contact.attributes);
                    if state.name.is_none() {
                        state.name = contact.name;
                    }
                }
                Ok(None) => {}
                Err(e) => warn!(
                    session = %self.session_id,
                    phone = %phone,
                    "Contact lookup failed: {e}"
                ),
            }
            self.insert_state(phone, state);
            info!(
                session = %self.session_id,
                phone = %phone,
                reason = %decision.reason,
                "Conversation started"
            );
        }

        let Some((history, slots)) = self.with_state(phone, |s| {
            s.push(ChatMessage::user(text.clone()), self.config.history_limit);
            s.last_activity = now;
            (Vec::from(s.history.clone()), s.slots.clone())
        }) else {
            return;
        };

        match extract(
            self.llm.as_ref(),
            &config.mission_fields,
            &slots,
            &history,
            self.config.extract_temperature,
        )
        .await
        {
            Ok(values) if !values.is_empty() => {
                let persisted: serde_json::Map<String, serde_json::Value> =
                    values.iter().map(|(k, v)| (k.clone(), v.to_json())).collect();
                let written = self.with_state(phone, |s| s.merge(values)).unwrap_or_default();
                if !written.is_empty() {
                    debug!(
                        session = %self.session_id,
                        phone = %phone,
                        slots = ?written,
                        "Slots filled"
                    );
                    if let Err(e) = self.db.merge_contact_attributes(phone, &persisted).await {
                        warn!(
                            session = %self.session_id,
                            phone = %phone,
                            "Failed to persist slots: {e}"
                        );
                    }
                }
            }
            Ok(_) => {}
            Err(e) => warn!(session = %self.session_id, phone = %phone, "Extraction failed: {e}"),
        }

        let Some((system, history, fallback)) = self.with_state(phone, |s| {
            let missing = s.missing(&config.mission_fields);
            (
                system_prompt(&config, s),
                Vec::from(s.history.clone()),
                fallback_reply(missing.first().copied(), s.name.as_deref()),
            )
        }) else {
            return;
        };

        let mut messages = Vec::with_capacity(history.len() + 1);
        messages.push(ChatMessage::system(system));
        messages.extend(history);
        let request = CompletionRequest::new(messages)
            .with_temperature(self.config.reply_temperature)
            .with_max_tokens(self.config.reply_max_tokens);
        let reply = match self.llm.complete(request).await {
            Ok(r) if !r.content.trim().is_empty() => r.content.trim().to_string(),
            Ok(_) => {
                warn!(session = %self.session_id, phone = %phone, "Empty reply, using fallback");
                fallback
            }
            Err(e) => {
                warn!(
                    session = %self.session_id,
                    phone = %phone,
                    "Reply generation failed, using fallback: {e}"
                );
                fallback
            }
        };

        if let Err(e) = self.sender.send_text(phone, &reply).await {
            warn!(session = %self.session_id, phone = %phone, "Failed to send reply: {e}");
            return;
        }

        let sent_at = Utc::now();
        let completed = self.with_state(phone, |s| {
            s.push(ChatMessage::assistant(reply), self.config.history_limit);
            s.last_activity = sent_at;
            if s.is_complete() && s.completed_at.is_none() {
                s.completed_at = Some(sent_at);
                true
            } else {
                false
            }
        });
        if completed == Some(true) {
            info!(session = %self.session_id, phone = %phone, "Mission complete");
        }
    }

    fn with_state<R>(&self, phone: &str, f: impl FnOnce(&mut ConversationState) -> R) -> Option<R> {
        lock(&self.conversations).get_mut(phone).map(f)
    }

    fn insert_state(&self, phone: &str, state: ConversationState) {
        let mut conversations = lock(&self.conversations);
        if !conversations.contains_key(phone) && conversations.len() >= MAX_CONVERSATIONS {
            let stalest = conversations
                .iter()
                .min_by_key(|(_, s)| s.last_activity)
                .map(|(p, _)| p.clone());
            if let Some(p) = stalest {
                conversations.remove(&p);
            }
        }
        conversations.insert(phone.to_string(), state);
    }

    /// Drop idle and cooled-down conversations and purge expired ignore
    /// entries.
    pub async fn sweep(&self) {
        let Some(_guard) = self.sweeping.try_enter() else {
            return;
        };
        let now = Utc::now();
        let removed = {
            let mut conversations = lock(&self.conversations);
            let before = conversations.len();
            conversations.retain(|_, s| {
                !s.is_idle(now, self.config.idle_timeout)
                    && !s.cooled_down(now, self.config.completion_cooldown)
            });
            before - conversations.len()
        };
        if removed > 0 {
            info!(session = %self.session_id, removed, "Conversations expired");
        }
        match self.db.purge_expired_ignores(now).await {
            Ok(0) => {}
            Ok(n) => debug!(
                session = %self.session_id,
                purged = n,
                "Expired ignore entries purged"
            ),
            Err(e) => warn!(session = %self.session_id, "Failed to purge ignore list: {e}"),
        }
    }

    /// Abort in-flight turns and forget all conversations.
    pub fn cancel_all(&self) {
        for task in lock(&self.turns).drain(..) {
            task.abort();
        }
        lock(&self.conversations).clear();
    }
}
