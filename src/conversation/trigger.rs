//! Whether an inbound message should open a conversation.
//!
//! Order: VIP (unless ignored) starts, an unexpired ignore entry blocks,
//! everything else goes to the model. A negative answer puts the contact
//! on the ignore list. Call or parse failures never start and never ignore.

use std::sync::Arc;

use chrono::{DateTime, Datelike, Utc, Weekday};
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::conversation::prompt_config::PromptConfig;
use crate::error::LlmError;
use crate::llm::{ChatMessage, CompletionRequest, LlmProvider, extract_json_object};
use crate::store::{Database, IgnoredContact};

#[derive(Debug, Clone, PartialEq)]
pub struct TriggerDecision {
    pub start: bool,
    pub reason: String,
    pub confidence: f32,
}

impl TriggerDecision {
    fn yes(reason: &str) -> Self {
        Self {
            start: true,
            reason: reason.to_string(),
            confidence: 1.0,
        }
    }

    fn no(reason: impl Into<String>) -> Self {
        Self {
            start: false,
            reason: reason.into(),
            confidence: 0.0,
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawDecision {
    start: bool,
    #[serde(default)]
    reason: String,
    #[serde(default)]
    confidence: f32,
}

/// Dialing prefixes, longest first.
const COUNTRY_PREFIXES: &[(&str, &str)] = &[
    ("502", "Guatemala"),
    ("503", "El Salvador"),
    ("504", "Honduras"),
    ("505", "Nicaragua"),
    ("506", "Costa Rica"),
    ("507", "Panamá"),
    ("591", "Bolivia"),
    ("593", "Ecuador"),
    ("595", "Paraguay"),
    ("598", "Uruguay"),
    ("34", "España"),
    ("44", "Reino Unido"),
    ("51", "Perú"),
    ("52", "México"),
    ("53", "Cuba"),
    ("54", "Argentina"),
    ("55", "Brasil"),
    ("56", "Chile"),
    ("57", "Colombia"),
    ("58", "Venezuela"),
    ("1", "Estados Unidos/Canadá"),
];

pub fn country_for_phone(phone: &str) -> Option<&'static str> {
    COUNTRY_PREFIXES
        .iter()
        .find(|(prefix, _)| phone.starts_with(prefix))
        .map(|(_, country)| *country)
}

fn weekday_es(day: Weekday) -> &'static str {
    match day {
        Weekday::Mon => "lunes",
        Weekday::Tue => "martes",
        Weekday::Wed => "miércoles",
        Weekday::Thu => "jueves",
        Weekday::Fri => "viernes",
        Weekday::Sat => "sábado",
        Weekday::Sun => "domingo",
    }
}

pub fn classification_prompt(
    config: &PromptConfig,
    phone: &str,
    text: &str,
    now: DateTime<Utc>,
) -> String {
    let local = config.local_time(now);
    let hours = if config.in_business_hours(now) {
        "dentro"
    } else {
        "fuera"
    };
    let mut prompt = format!(
        "Decide si debemos iniciar una conversación con este contacto.\n\n\
         Mensaje: \"{text}\"\n\
         Hora local: {} ({}), {hours} de horario de atención ({}:00-{}:00)\n\
         País probable: {}\n\n\
         Criterios: {}\n",
        local.format("%H:%M"),
        weekday_es(local.weekday()),
        config.business_hours.start_hour,
        config.business_hours.end_hour,
        country_for_phone(phone).unwrap_or("desconocido"),
        config.trigger_criteria,
    );
    if !config.positive_examples.is_empty() {
        prompt.push_str("\nEjemplos que SÍ inician:\n");
        for e in &config.positive_examples {
            prompt.push_str(&format!("- {e}\n"));
        }
    }
    if !config.negative_examples.is_empty() {
        prompt.push_str("\nEjemplos que NO inician:\n");
        for e in &config.negative_examples {
            prompt.push_str(&format!("- {e}\n"));
        }
    }
    prompt.push_str(
        "\nResponde solo con JSON: {\"start\": true|false, \"reason\": \"...\", \"confidence\": 0.0-1.0}",
    );
    prompt
}

pub struct StartGate {
    db: Arc<dyn Database>,
    llm: Arc<dyn LlmProvider>,
    temperature: f32,
}

impl StartGate {
    pub fn new(db: Arc<dyn Database>, llm: Arc<dyn LlmProvider>, temperature: f32) -> Self {
        Self {
            db,
            llm,
            temperature,
        }
    }

    pub async fn decide(
        &self,
        config: &PromptConfig,
        phone: &str,
        text: &str,
        now: DateTime<Utc>,
    ) -> TriggerDecision {
        let ignored = match self.db.is_ignored(phone, now).await {
            Ok(ignored) => ignored,
            Err(e) => {
                warn!(phone = %phone, "Ignore list lookup failed: {e}");
                return TriggerDecision::no(e.to_string());
            }
        };
        if ignored {
            debug!(phone = %phone, "Contact is ignored");
            return TriggerDecision::no("ignored");
        }
        if config.is_vip(phone) {
            return TriggerDecision::yes("vip");
        }

        let decision = match self.classify(config, phone, text, now).await {
            Ok(d) => d,
            Err(e) => {
                warn!(phone = %phone, "Start classification failed: {e}");
                return TriggerDecision::no(e.to_string());
            }
        };

        if decision.start {
            info!(
                phone = %phone,
                confidence = decision.confidence,
                reason = %decision.reason,
                "Conversation start approved"
            );
        } else {
            let entry = IgnoredContact {
                phone: phone.to_string(),
                reason: decision.reason.clone(),
                first_message: text.to_string(),
                ignored_at: now,
                expires_at: Some(now + config.ignore_duration()),
            };
            match self.db.ignore_contact(&entry).await {
                Ok(()) => info!(
                    phone = %phone,
                    reason = %decision.reason,
                    days = config.ignore_days,
                    "Contact ignored"
                ),
                Err(e) => warn!(phone = %phone, "Failed to record ignore entry: {e}"),
            }
        }
        decision
    }

    async fn classify(
        &self,
        config: &PromptConfig,
        phone: &str,
        text: &str,
        now: DateTime<Utc>,
    ) -> Result<TriggerDecision, LlmError> {
        let request = CompletionRequest::new(vec![
            ChatMessage::system("Eres un clasificador. Responde únicamente con JSON."),
            ChatMessage::user(classification_prompt(config, phone, text, now)),
        ])
        .with_temperature(self.temperature)
        .with_max_tokens(150);

        let response = self.llm.complete(request).await?;
        let raw: RawDecision = serde_json::from_str(&extract_json_object(&response.content))?;
        Ok(TriggerDecision {
            start: raw.start,
            reason: raw.reason,
            confidence: raw.confidence.clamp(0.0, 1.0),
        })
    }
}
