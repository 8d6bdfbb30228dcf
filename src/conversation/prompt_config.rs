//! Tenant prompt configuration, stored as key/value pairs in
//! `prompt_settings` and cached with a short TTL.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, FixedOffset, Offset, Timelike, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::error::DatabaseError;
use crate::store::Database;
use crate::transport::canonical_phone;

/// Keys in the `prompt_settings` table.
pub mod keys {
    pub const IDENTITY: &str = "identity";
    pub const STRATEGY: &str = "strategy";
    pub const COMPLETION_SCRIPT: &str = "completion_script";
    /// JSON array of mission fields.
    pub const MISSION_FIELDS: &str = "mission_fields";
    /// JSON array of strings.
    pub const QUESTION_EXAMPLES: &str = "question_examples";
    pub const TRIGGER_CRITERIA: &str = "trigger_criteria";
    pub const POSITIVE_EXAMPLES: &str = "trigger_positive_examples";
    pub const NEGATIVE_EXAMPLES: &str = "trigger_negative_examples";
    pub const VIP_PHONES: &str = "vip_phones";
    pub const IGNORE_DAYS: &str = "ignore_days";
    pub const BUSINESS_HOURS: &str = "business_hours";
    pub const UTC_OFFSET_MINUTES: &str = "utc_offset_minutes";
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldKind {
    String,
    Number,
    Enum,
}

/// A value the conversation tries to collect from the contact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MissionField {
    pub key: String,
    pub label: String,
    /// What the extractor should look for.
    pub description: String,
    pub kind: FieldKind,
    /// Allowed values for `FieldKind::Enum`.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub options: Vec<String>,
}

impl MissionField {
    fn new(key: &str, label: &str, description: &str, kind: FieldKind, options: &[&str]) -> Self {
        Self {
            key: key.into(),
            label: label.into(),
            description: description.into(),
            kind,
            options: options.iter().map(|o| o.to_string()).collect(),
        }
    }
}

/// Opening hours in local time, `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BusinessHours {
    pub start_hour: u32,
    pub end_hour: u32,
}

impl Default for BusinessHours {
    fn default() -> Self {
        Self {
            start_hour: 9,
            end_hour: 19,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PromptConfig {
    pub identity: String,
    pub strategy: String,
    pub completion_script: String,
    pub mission_fields: Vec<MissionField>,
    pub question_examples: Vec<String>,
    pub trigger_criteria: String,
    pub positive_examples: Vec<String>,
    pub negative_examples: Vec<String>,
    pub vip_phones: Vec<String>,
    pub ignore_days: u32,
    pub business_hours: BusinessHours,
    pub utc_offset_minutes: i32,
}

impl Default for PromptConfig {
    fn default() -> Self {
        Self {
            identity: "Eres Sofía, asesora inmobiliaria. Hablas en español, con calidez y \
                       frases cortas. Nunca inventas precios ni disponibilidad."
                .into(),
            strategy: "Haz una sola pregunta por mensaje. Reconoce lo que el cliente dijo \
                       antes de preguntar lo siguiente."
                .into(),
            completion_script: "Agradece al cliente, confirma los datos recibidos y avisa que \
                                un asesor lo contactará en breve."
                .into(),
            mission_fields: vec![
                MissionField::new(
                    "budget",
                    "Presupuesto",
                    "Presupuesto máximo del cliente en pesos, como número",
                    FieldKind::Number,
                    &[],
                ),
                MissionField::new(
                    "zone",
                    "Zona",
                    "Colonia, ciudad o zona donde busca",
                    FieldKind::String,
                    &[],
                ),
                MissionField::new(
                    "property_type",
                    "Tipo de propiedad",
                    "Tipo de inmueble que busca",
                    FieldKind::Enum,
                    &["casa", "departamento", "terreno", "local"],
                ),
            ],
            question_examples: vec![
                "¿Qué presupuesto tienes en mente?".into(),
                "¿En qué zona te gustaría vivir?".into(),
            ],
            trigger_criteria: "Inicia solo si la persona muestra interés en comprar o rentar \
                               una propiedad."
                .into(),
            positive_examples: vec![
                "Hola, vi el anuncio de la casa".into(),
                "¿Tienen departamentos en renta?".into(),
            ],
            negative_examples: vec![
                "Te comparto mi catálogo de seguros".into(),
                "Número equivocado".into(),
            ],
            vip_phones: Vec::new(),
            ignore_days: 7,
            business_hours: BusinessHours::default(),
            utc_offset_minutes: -360,
        }
    }
}

fn parse_json<T: serde::de::DeserializeOwned>(key: &str, value: &str) -> Option<T> {
    serde_json::from_str(value)
        .inspect_err(|e| warn!(key = %key, "Ignoring malformed prompt setting: {e}"))
        .ok()
}

fn to_json<T: Serialize>(value: &T) -> String {
    serde_json::to_string(value).unwrap_or_else(|_| "[]".into())
}

impl PromptConfig {
    /// Build from stored pairs. Missing or malformed keys keep the default.
    pub fn from_settings(pairs: &[(String, String)]) -> Self {
        let mut config = Self::default();
        for (key, value) in pairs {
            match key.as_str() {
                keys::IDENTITY => config.identity = value.clone(),
                keys::STRATEGY => config.strategy = value.clone(),
                keys::COMPLETION_SCRIPT => config.completion_script = value.clone(),
                keys::TRIGGER_CRITERIA => config.trigger_criteria = value.clone(),
                keys::MISSION_FIELDS => {
                    if let Some(fields) = parse_json(key, value) {
                        config.mission_fields = fields;
                    }
                }
                keys::QUESTION_EXAMPLES => {
                    if let Some(v) = parse_json(key, value) {
                        config.question_examples = v;
                    }
                }
                keys::POSITIVE_EXAMPLES => {
                    if let Some(v) = parse_json(key, value) {
                        config.positive_examples = v;
                    }
                }
                keys::NEGATIVE_EXAMPLES => {
                    if let Some(v) = parse_json(key, value) {
                        config.negative_examples = v;
                    }
                }
                keys::VIP_PHONES => {
                    if let Some(v) = parse_json(key, value) {
                        config.vip_phones = v;
                    }
                }
                keys::BUSINESS_HOURS => {
                    if let Some(v) = parse_json(key, value) {
                        config.business_hours = v;
                    }
                }
                keys::IGNORE_DAYS => match value.trim().parse() {
                    Ok(days) => config.ignore_days = days,
                    Err(_) => warn!(key = %key, "Ignoring malformed prompt setting"),
                },
                keys::UTC_OFFSET_MINUTES => match value.trim().parse() {
                    Ok(offset) => config.utc_offset_minutes = offset,
                    Err(_) => warn!(key = %key, "Ignoring malformed prompt setting"),
                },
                other => debug!(key = %other, "Unknown prompt setting"),
            }
        }
        config
    }

    pub fn to_settings(&self) -> Vec<(String, String)> {
        vec![
            (keys::IDENTITY.into(), self.identity.clone()),
            (keys::STRATEGY.into(), self.strategy.clone()),
            (keys::COMPLETION_SCRIPT.into(), self.completion_script.clone()),
            (keys::MISSION_FIELDS.into(), to_json(&self.mission_fields)),
            (keys::QUESTION_EXAMPLES.into(), to_json(&self.question_examples)),
            (keys::TRIGGER_CRITERIA.into(), self.trigger_criteria.clone()),
            (keys::POSITIVE_EXAMPLES.into(), to_json(&self.positive_examples)),
            (keys::NEGATIVE_EXAMPLES.into(), to_json(&self.negative_examples)),
            (keys::VIP_PHONES.into(), to_json(&self.vip_phones)),
            (keys::IGNORE_DAYS.into(), self.ignore_days.to_string()),
            (keys::BUSINESS_HOURS.into(), to_json(&self.business_hours)),
            (keys::UTC_OFFSET_MINUTES.into(), self.utc_offset_minutes.to_string()),
        ]
    }

    pub fn is_vip(&self, phone: &str) -> bool {
        let Some(phone) = canonical_phone(phone) else {
            return false;
        };
        self.vip_phones
            .iter()
            .filter_map(|v| canonical_phone(v))
            .any(|v| v == phone)
    }

    pub fn ignore_duration(&self) -> chrono::Duration {
        chrono::Duration::days(i64::from(self.ignore_days))
    }

    pub fn local_time(&self, now: DateTime<Utc>) -> DateTime<FixedOffset> {
        let offset =
            FixedOffset::east_opt(self.utc_offset_minutes * 60).unwrap_or_else(|| Utc.fix());
        now.with_timezone(&offset)
    }

    pub fn in_business_hours(&self, now: DateTime<Utc>) -> bool {
        let hour = self.local_time(now).hour();
        let BusinessHours {
            start_hour,
            end_hour,
        } = self.business_hours;
        if start_hour <= end_hour {
            (start_hour..end_hour).contains(&hour)
        } else {
            hour >= start_hour || hour < end_hour
        }
    }
}

/// Cached view of the stored prompt configuration.
pub struct PromptConfigStore {
    db: Arc<dyn Database>,
    ttl: Duration,
    cached: RwLock<Option<(Instant, Arc<PromptConfig>)>>,
}

impl PromptConfigStore {
    pub fn new(db: Arc<dyn Database>, ttl: Duration) -> Self {
        Self {
            db,
            ttl,
            cached: RwLock::new(None),
        }
    }

    /// The current configuration. A load failure falls back to the last
    /// cached value, or the defaults.
    pub async fn get(&self) -> Arc<PromptConfig> {
        if let Some((loaded, config)) = self.cached.read().await.as_ref()
            && loaded.elapsed() < self.ttl
        {
            return Arc::clone(config);
        }

        let mut cached = self.cached.write().await;
        match self.db.get_prompt_settings().await {
            Ok(pairs) => {
                let config = Arc::new(PromptConfig::from_settings(&pairs));
                *cached = Some((Instant::now(), Arc::clone(&config)));
                config
            }
            Err(e) => {
                warn!("Failed to load prompt config: {e}");
                cached
                    .as_ref()
                    .map(|(_, c)| Arc::clone(c))
                    .unwrap_or_default()
            }
        }
    }

    pub async fn invalidate(&self) {
        self.cached.write().await.take();
    }

    pub async fn save(&self, config: &PromptConfig) -> Result<(), DatabaseError> {
        for (key, value) in config.to_settings() {
            self.db.set_prompt_setting(&key, &value).await?;
        }
        self.invalidate().await;
        Ok(())
    }
}
