//! Timed multi-step sequences, gated on conversational silence.
//!
//! Each running sequence is one task per contact. Step 0 goes out after a
//! short startup delay; every later step waits until the contact has
//! replied and then stayed quiet for `step_wait`. Progress is persisted
//! after every step so the session poll can resume runs lost to a restart.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, LazyLock, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use regex::Regex;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::activity::ActivityTracker;
use crate::config::SequenceConfig;
use crate::error::{DatabaseError, SessionError, TransportError};
use crate::outbound::OutboundSender;
use crate::sequence::eligibility::EligibilityPolicy;
use crate::sequence::matcher::TriggerMatcher;
use crate::store::{Database, Direction, ProgressStatus, Sequence, SequenceProgress};
use crate::ticker::InFlight;

static NUMBERED_ITEM: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^\s*\d+[.)]\s+").expect("numbered item pattern"));

/// How a sequence run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SequenceOutcome {
    Completed,
    /// Replaced by another start or stopped with the session.
    Cancelled,
    Failed(String),
}

/// Completion handle returned by a manual start.
#[derive(Debug)]
pub struct SequenceHandle {
    rx: oneshot::Receiver<SequenceOutcome>,
}

impl SequenceHandle {
    pub async fn wait(self) -> SequenceOutcome {
        self.rx.await.unwrap_or(SequenceOutcome::Cancelled)
    }
}

/// True when the contact spoke after our last message and has been quiet
/// for longer than `wait` since.
pub fn silence_elapsed(
    last_inbound: Option<DateTime<Utc>>,
    last_outbound: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
    wait: Duration,
) -> bool {
    let Some(inbound) = last_inbound else {
        return false;
    };
    if last_outbound.is_some_and(|out| inbound <= out) {
        return false;
    }
    let wait = chrono::Duration::from_std(wait).unwrap_or(chrono::Duration::MAX);
    now.signed_duration_since(inbound) > wait
}

/// Split a numbered-list step into one message per item. Text before the
/// first item goes out as its own part. Steps with fewer than two items are
/// sent whole.
pub fn split_numbered(text: &str) -> Vec<String> {
    let starts: Vec<usize> = NUMBERED_ITEM.find_iter(text).map(|m| m.start()).collect();
    if starts.len() < 2 {
        let whole = text.trim();
        return if whole.is_empty() {
            Vec::new()
        } else {
            vec![whole.to_string()]
        };
    }

    let mut parts = Vec::with_capacity(starts.len() + 1);
    let preamble = text[..starts[0]].trim();
    if !preamble.is_empty() {
        parts.push(preamble.to_string());
    }
    for (i, &start) in starts.iter().enumerate() {
        let end = starts.get(i + 1).copied().unwrap_or(text.len());
        let item = text[start..end].trim();
        if !item.is_empty() {
            parts.push(item.to_string());
        }
    }
    parts
}

struct Run {
    generation: u64,
    trigger: String,
    task: JoinHandle<()>,
}

pub struct SequenceEngine {
    session_id: String,
    db: Arc<dyn Database>,
    sender: Arc<OutboundSender>,
    activity: Arc<ActivityTracker>,
    policy: Arc<dyn EligibilityPolicy>,
    config: SequenceConfig,
    matcher: Mutex<Option<Arc<TriggerMatcher>>>,
    runs: Mutex<HashMap<String, Run>>,
    next_generation: AtomicU64,
    polling: InFlight,
    last_poll: Mutex<DateTime<Utc>>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|p| p.into_inner())
}

impl SequenceEngine {
    pub fn new(
        session_id: &str,
        db: Arc<dyn Database>,
        sender: Arc<OutboundSender>,
        activity: Arc<ActivityTracker>,
        policy: Arc<dyn EligibilityPolicy>,
        config: SequenceConfig,
    ) -> Self {
        Self {
            session_id: session_id.to_string(),
            db,
            sender,
            activity,
            policy,
            config,
            matcher: Mutex::new(None),
            runs: Mutex::new(HashMap::new()),
            next_generation: AtomicU64::new(0),
            polling: InFlight::new(),
            last_poll: Mutex::new(Utc::now()),
        }
    }

    /// Whether a sequence task is live for this contact.
    pub fn is_running(&self, phone: &str) -> bool {
        lock(&self.runs)
            .get(phone)
            .is_some_and(|run| !run.task.is_finished())
    }

    pub fn running_trigger(&self, phone: &str) -> Option<String> {
        lock(&self.runs)
            .get(phone)
            .filter(|run| !run.task.is_finished())
            .map(|run| run.trigger.clone())
    }

    /// Drop the cached trigger set; the next lookup reloads it.
    pub fn reload_triggers(&self) {
        lock(&self.matcher).take();
        debug!(session = %self.session_id, "Trigger cache cleared");
    }

    async fn matcher(&self) -> Result<Arc<TriggerMatcher>, DatabaseError> {
        if let Some(matcher) = lock(&self.matcher).clone() {
            return Ok(matcher);
        }
        let sequences = self.db.list_active_sequences().await?;
        let matcher = Arc::new(TriggerMatcher::new(
            sequences
                .into_iter()
                .filter(|s| !s.steps.is_empty())
                .map(|s| s.trigger),
        ));
        debug!(session = %self.session_id, triggers = matcher.len(), "Triggers loaded");
        *lock(&self.matcher) = Some(Arc::clone(&matcher));
        Ok(matcher)
    }

    /// Trigger found in the contact's last two inbound messages.
    async fn detect(&self, phone: &str) -> Result<Option<String>, DatabaseError> {
        let matcher = self.matcher().await?;
        if matcher.is_empty() {
            return Ok(None);
        }
        let mut texts = self.activity.recent_inbound(phone, 2);
        if texts.is_empty() {
            texts = self
                .db
                .recent_inbound_texts(&self.session_id, phone, 2)
                .await?;
        }
        Ok(texts
            .iter()
            .find_map(|t| matcher.find(t).map(str::to_string)))
    }

    /// Check a contact after an inbound message and auto-start a sequence
    /// when a trigger applies. Returns the started trigger.
    pub async fn handle_inbound(
        self: &Arc<Self>,
        phone: &str,
    ) -> Result<Option<String>, SessionError> {
        let Some(trigger) = self.detect(phone).await? else {
            return Ok(None);
        };
        if self.running_trigger(phone).as_deref() == Some(trigger.as_str()) {
            return Ok(None);
        }

        if let Some(progress) = self.db.get_progress(&self.session_id, phone).await?
            && progress.trigger.as_deref() == Some(trigger.as_str())
            && progress.status != ProgressStatus::Idle
        {
            debug!(
                session = %self.session_id,
                phone = %phone,
                trigger = %trigger,
                "Trigger already used by this contact"
            );
            return Ok(None);
        }

        let Some(contact) = self.db.find_contact(phone).await? else {
            return Ok(None);
        };
        if !self.policy.is_eligible(&contact, Utc::now()) {
            debug!(
                session = %self.session_id,
                phone = %phone,
                trigger = %trigger,
                "Contact not eligible for sequences"
            );
            return Ok(None);
        }

        let Some(sequence) = self
            .db
            .get_sequence(&trigger)
            .await?
            .filter(|s| s.active && !s.steps.is_empty())
        else {
            return Ok(None);
        };
        self.launch(phone, sequence, 0, None);
        Ok(Some(trigger))
    }

    /// Start `trigger` for `phone` now, cancelling any run in progress for
    /// that contact.
    pub async fn start_manual(
        self: &Arc<Self>,
        phone: &str,
        trigger: &str,
    ) -> Result<SequenceHandle, SessionError> {
        let sequence = self
            .db
            .get_sequence(trigger)
            .await?
            .filter(|s| s.active && !s.steps.is_empty())
            .ok_or_else(|| SessionError::UnknownSequence {
                trigger: trigger.to_string(),
            })?;
        self.db.find_or_create_contact(phone, None).await?;

        let (tx, rx) = oneshot::channel();
        self.launch(phone, sequence, 0, Some(tx));
        Ok(SequenceHandle { rx })
    }

    fn launch(
        self: &Arc<Self>,
        phone: &str,
        sequence: Sequence,
        from_step: u32,
        done: Option<oneshot::Sender<SequenceOutcome>>,
    ) {
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let trigger = sequence.trigger.clone();
        let mut runs = lock(&self.runs);
        if let Some(prior) = runs.remove(phone) {
            prior.task.abort();
            info!(
                session = %self.session_id,
                phone = %phone,
                trigger = %prior.trigger,
                "Sequence cancelled"
            );
        }
        let this = Arc::clone(self);
        let owned_phone = phone.to_string();
        let task = tokio::spawn(async move {
            this.run(owned_phone, sequence, from_step, generation, done)
                .await;
        });
        runs.insert(
            phone.to_string(),
            Run {
                generation,
                trigger,
                task,
            },
        );
    }

    async fn run(
        self: Arc<Self>,
        phone: String,
        sequence: Sequence,
        from_step: u32,
        generation: u64,
        done: Option<oneshot::Sender<SequenceOutcome>>,
    ) {
        let total = sequence.steps.len() as u32;
        let trigger = sequence.trigger.as_str();
        self.save(&phone, trigger, ProgressStatus::Active, from_step, total)
            .await;
        info!(
            session = %self.session_id,
            phone = %phone,
            trigger = %trigger,
            from_step,
            total,
            "Sequence started"
        );

        let outcome = match self.drive(&phone, &sequence, from_step).await {
            Ok(()) => {
                self.save(&phone, trigger, ProgressStatus::Completed, total, total)
                    .await;
                info!(
                    session = %self.session_id,
                    phone = %phone,
                    trigger = %trigger,
                    "Sequence completed"
                );
                SequenceOutcome::Completed
            }
            Err(e) => {
                warn!(
                    session = %self.session_id,
                    phone = %phone,
                    trigger = %trigger,
                    "Sequence abandoned: {e}"
                );
                let step = self
                    .db
                    .get_progress(&self.session_id, &phone)
                    .await
                    .ok()
                    .flatten()
                    .map_or(from_step, |p| p.current_step);
                self.save(&phone, trigger, ProgressStatus::Idle, step, total)
                    .await;
                SequenceOutcome::Failed(e.to_string())
            }
        };

        {
            let mut runs = lock(&self.runs);
            if runs.get(&phone).is_some_and(|r| r.generation == generation) {
                runs.remove(&phone);
            }
        }
        if let Some(done) = done {
            let _ = done.send(outcome);
        }
    }

    async fn drive(
        &self,
        phone: &str,
        sequence: &Sequence,
        from_step: u32,
    ) -> Result<(), TransportError> {
        let total = sequence.steps.len() as u32;
        if from_step == 0 {
            tokio::time::sleep(self.config.startup_delay).await;
        }
        for step in from_step..total {
            if step > 0 {
                self.wait_for_silence(phone).await;
            }
            self.send_step(phone, &sequence.steps[step as usize]).await?;
            self.save(phone, &sequence.trigger, ProgressStatus::Active, step + 1, total)
                .await;
            debug!(session = %self.session_id, phone = %phone, step, "Sequence step sent");
        }
        Ok(())
    }

    async fn send_step(&self, phone: &str, text: &str) -> Result<(), TransportError> {
        for (i, part) in split_numbered(text).iter().enumerate() {
            if i > 0 {
                tokio::time::sleep(self.config.part_delay).await;
            }
            self.sender.send_text(phone, part).await?;
        }
        Ok(())
    }

    async fn wait_for_silence(&self, phone: &str) {
        loop {
            let (last_in, last_out) = self.silence_timestamps(phone).await;
            if silence_elapsed(last_in, last_out, Utc::now(), self.config.step_wait) {
                return;
            }
            tokio::time::sleep(self.config.silence_poll).await;
        }
    }

    /// Latest inbound and outbound times, the newer of memory and the log.
    async fn silence_timestamps(
        &self,
        phone: &str,
    ) -> (Option<DateTime<Utc>>, Option<DateTime<Utc>>) {
        let memory = self.activity.get(phone).unwrap_or_default();
        let logged_in = self.last_logged(phone, Direction::Inbound).await;
        let logged_out = self.last_logged(phone, Direction::Outbound).await;
        (
            memory.last_inbound.max(logged_in),
            memory.last_outbound.max(logged_out),
        )
    }

    async fn last_logged(&self, phone: &str, direction: Direction) -> Option<DateTime<Utc>> {
        self.db
            .last_message_at(&self.session_id, phone, direction)
            .await
            .unwrap_or_else(|e| {
                warn!(
                    session = %self.session_id,
                    phone = %phone,
                    "Failed to read message log: {e}"
                );
                None
            })
    }

    async fn save(
        &self,
        phone: &str,
        trigger: &str,
        status: ProgressStatus,
        step: u32,
        total: u32,
    ) {
        let activity = self.activity.get(phone).unwrap_or_default();
        let progress = SequenceProgress {
            session_id: self.session_id.clone(),
            phone: phone.to_string(),
            status,
            trigger: Some(trigger.to_string()),
            current_step: step.min(total),
            total_steps: total,
            last_inbound_at: activity.last_inbound,
            last_outbound_at: activity.last_outbound,
        };
        if let Err(e) = self.db.save_progress(&progress).await {
            warn!(
                session = %self.session_id,
                phone = %phone,
                "Failed to save sequence progress: {e}"
            );
        }
    }

    /// Periodic pass: resume persisted runs with no live task, then
    /// re-check contacts that wrote in since the last pass.
    pub async fn poll(self: &Arc<Self>) {
        let Some(_guard) = self.polling.try_enter() else {
            debug!(session = %self.session_id, "Sequence poll already running");
            return;
        };
        let now = Utc::now();
        let since = std::mem::replace(&mut *lock(&self.last_poll), now);

        if let Err(e) = self.resume_orphans().await {
            warn!(session = %self.session_id, "Sequence recovery failed: {e}");
        }

        match self.db.inbound_phones_since(&self.session_id, since).await {
            Ok(phones) => {
                for phone in phones {
                    if let Err(e) = self.handle_inbound(&phone).await {
                        warn!(
                            session = %self.session_id,
                            phone = %phone,
                            "Trigger check failed: {e}"
                        );
                    }
                }
            }
            Err(e) => warn!(session = %self.session_id, "Failed to list recent contacts: {e}"),
        }
    }

    async fn resume_orphans(self: &Arc<Self>) -> Result<(), DatabaseError> {
        for progress in self.db.list_active_progress(&self.session_id).await? {
            let phone = progress.phone.as_str();
            if self.is_running(phone) {
                continue;
            }
            let Some(trigger) = progress.trigger.as_deref() else {
                self.db
                    .save_progress(&SequenceProgress::idle(&self.session_id, phone))
                    .await?;
                continue;
            };
            if progress.current_step >= progress.total_steps {
                let total = progress.total_steps;
                self.save(phone, trigger, ProgressStatus::Completed, total, total).await;
                continue;
            }
            match self
                .db
                .get_sequence(trigger)
                .await?
                .filter(|s| s.active && !s.steps.is_empty())
            {
                Some(sequence) => {
                    info!(
                        session = %self.session_id,
                        phone = %phone,
                        trigger = %trigger,
                        step = progress.current_step,
                        "Resuming sequence"
                    );
                    self.launch(phone, sequence, progress.current_step, None);
                }
                None => {
                    let (step, total) = (progress.current_step, progress.total_steps);
                    self.save(phone, trigger, ProgressStatus::Idle, step, total).await;
                }
            }
        }
        Ok(())
    }

    /// Abort every live run. Persisted progress stays `active` and is
    /// resumed by the next poll after a restart.
    pub fn cancel_all(&self) {
        let runs: Vec<Run> = lock(&self.runs).drain().map(|(_, run)| run).collect();
        for run in &runs {
            run.task.abort();
        }
        if !runs.is_empty() {
            info!(session = %self.session_id, count = runs.len(), "Sequences cancelled");
        }
    }
}
