//! In-memory state of one contact's conversation.

use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::conversation::prompt_config::MissionField;
use crate::llm::ChatMessage;

/// A validated slot value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SlotValue {
    Number(f64),
    Text(String),
}

impl SlotValue {
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Self::Number(n) => serde_json::json!(n),
            Self::Text(t) => serde_json::Value::String(t.clone()),
        }
    }
}

impl fmt::Display for SlotValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Number(n) if n.fract() == 0.0 => write!(f, "{n:.0}"),
            Self::Number(n) => write!(f, "{n}"),
            Self::Text(t) => f.write_str(t),
        }
    }
}

fn elapsed_beyond(since: DateTime<Utc>, now: DateTime<Utc>, limit: Duration) -> bool {
    let limit = chrono::Duration::from_std(limit).unwrap_or(chrono::Duration::MAX);
    now.signed_duration_since(since) >= limit
}

#[derive(Debug, Clone)]
pub struct ConversationState {
    pub active: bool,
    pub name: Option<String>,
    pub history: VecDeque<ChatMessage>,
    /// One entry per mission field; `None` until filled.
    pub slots: BTreeMap<String, Option<SlotValue>>,
    pub last_activity: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl ConversationState {
    pub fn new(fields: &[MissionField], name: Option<String>, now: DateTime<Utc>) -> Self {
        Self {
            active: true,
            name,
            history: VecDeque::new(),
            slots: fields.iter().map(|f| (f.key.clone(), None)).collect(),
            last_activity: now,
            completed_at: None,
        }
    }

    /// Seed slots from stored contact attributes.
    pub fn prefill(&mut self, attributes: &serde_json::Value) {
        for (key, slot) in self.slots.iter_mut() {
            if slot.is_some() {
                continue;
            }
            *slot = match attributes.get(key) {
                Some(serde_json::Value::Number(n)) => n.as_f64().map(SlotValue::Number),
                Some(serde_json::Value::String(s)) if !s.trim().is_empty() => {
                    Some(SlotValue::Text(s.clone()))
                }
                _ => None,
            };
        }
    }

    pub fn push(&mut self, message: ChatMessage, limit: usize) {
        self.history.push_back(message);
        while self.history.len() > limit {
            self.history.pop_front();
        }
    }

    /// Fill empty slots from `values`. Filled slots and unknown keys are
    /// left alone. Returns the keys written.
    pub fn merge(&mut self, values: BTreeMap<String, SlotValue>) -> Vec<String> {
        let mut written = Vec::new();
        for (key, value) in values {
            if let Some(slot) = self.slots.get_mut(&key)
                && slot.is_none()
            {
                *slot = Some(value);
                written.push(key);
            }
        }
        written
    }

    /// Unfilled fields, in configuration order.
    pub fn missing<'a>(&self, fields: &'a [MissionField]) -> Vec<&'a MissionField> {
        fields
            .iter()
            .filter(|f| self.slots.get(&f.key).is_none_or(Option::is_none))
            .collect()
    }

    pub fn is_complete(&self) -> bool {
        self.slots.values().all(Option::is_some)
    }

    pub fn is_idle(&self, now: DateTime<Utc>, timeout: Duration) -> bool {
        elapsed_beyond(self.last_activity, now, timeout)
    }

    /// Mission done and the cooldown has passed.
    pub fn cooled_down(&self, now: DateTime<Utc>, cooldown: Duration) -> bool {
        self.completed_at
            .is_some_and(|at| elapsed_beyond(at, now, cooldown))
    }
}
