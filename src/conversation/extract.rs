//! Slot extraction: ask the model for a JSON object of mission values, then
//! validate each field against its declared kind.

use std::collections::BTreeMap;

use serde_json::Value;

use crate::conversation::prompt_config::{FieldKind, MissionField};
use crate::conversation::state::SlotValue;
use crate::error::LlmError;
use crate::llm::{ChatMessage, CompletionRequest, LlmProvider, Role, extract_json_object};

const EXTRACTION_SYSTEM: &str =
    "Eres un extractor de datos. Responde únicamente con un objeto JSON válido.";

/// Mission slots as the conversation currently holds them.
pub type Slots = BTreeMap<String, Option<SlotValue>>;

fn is_filled(slots: &Slots, key: &str) -> bool {
    slots.get(key).is_some_and(Option::is_some)
}

/// Prompt asking only for the unfilled fields, with the known values
/// listed so the model does not re-ask or contradict them.
pub fn extraction_prompt(fields: &[MissionField], slots: &Slots, transcript: &str) -> String {
    let mut prompt = String::from(
        "Extrae de la conversación los siguientes datos del cliente. Usa null para lo que \
         no haya dicho explícitamente. No inventes valores.\n",
    );

    let known: Vec<String> = fields
        .iter()
        .filter_map(|f| {
            let value = slots.get(&f.key)?.as_ref()?;
            Some(format!("- {} (\"{}\"): {value}", f.label, f.key))
        })
        .collect();
    if !known.is_empty() {
        prompt.push_str("\nDatos ya conocidos:\n");
        prompt.push_str(&known.join("\n"));
        prompt.push('\n');
    }

    prompt.push_str("\nCampos:\n");
    for field in fields.iter().filter(|f| !is_filled(slots, &f.key)) {
        let kind = match field.kind {
            FieldKind::Number => "número".to_string(),
            FieldKind::String => "texto".to_string(),
            FieldKind::Enum => format!("uno de: {}", field.options.join(", ")),
        };
        prompt.push_str(&format!("- \"{}\" ({kind}): {}\n", field.key, field.description));
    }
    prompt.push_str("\nConversación:\n");
    prompt.push_str(transcript);
    prompt.push_str("\n\nResponde con un objeto JSON con exactamente las claves de Campos.");
    prompt
}

/// Render chat history as `Cliente:` / `Asistente:` lines.
pub fn transcript(history: &[ChatMessage]) -> String {
    history
        .iter()
        .filter_map(|m| match m.role {
            Role::User => Some(format!("Cliente: {}", m.content)),
            Role::Assistant => Some(format!("Asistente: {}", m.content)),
            Role::System => None,
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn parse_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => {
            let cleaned: String = s
                .chars()
                .filter(|c| c.is_ascii_digit() || *c == '.')
                .collect();
            cleaned.parse().ok()
        }
        _ => None,
    }
}

/// Validate one field. `None` means the value is discarded.
pub fn validate_field(field: &MissionField, value: &Value) -> Option<SlotValue> {
    match field.kind {
        FieldKind::Number => parse_number(value)
            .filter(|n| n.is_finite() && *n > 0.0)
            .map(SlotValue::Number),
        FieldKind::Enum => {
            let given = value.as_str()?.trim().to_lowercase();
            field
                .options
                .iter()
                .find(|o| o.to_lowercase() == given)
                .map(|o| SlotValue::Text(o.clone()))
        }
        FieldKind::String => value
            .as_str()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(|s| SlotValue::Text(s.to_string())),
    }
}

/// Validate an extraction result. Keys that are not mission fields, nulls
/// and invalid values are dropped.
pub fn validate(fields: &[MissionField], raw: &Value) -> BTreeMap<String, SlotValue> {
    let Some(object) = raw.as_object() else {
        return BTreeMap::new();
    };
    fields
        .iter()
        .filter_map(|field| {
            let value = object.get(&field.key)?;
            validate_field(field, value).map(|v| (field.key.clone(), v))
        })
        .collect()
}

/// Run one extraction call over the conversation so far. Only unfilled
/// slots are requested; with none left no call is made.
pub async fn extract(
    llm: &dyn LlmProvider,
    fields: &[MissionField],
    slots: &Slots,
    history: &[ChatMessage],
    temperature: f32,
) -> Result<BTreeMap<String, SlotValue>, LlmError> {
    let missing: Vec<MissionField> = fields
        .iter()
        .filter(|f| !is_filled(slots, &f.key))
        .cloned()
        .collect();
    if missing.is_empty() {
        return Ok(BTreeMap::new());
    }

    let prompt = extraction_prompt(fields, slots, &transcript(history));
    let request = CompletionRequest::new(vec![
        ChatMessage::system(EXTRACTION_SYSTEM),
        ChatMessage::user(prompt),
    ])
    .with_temperature(temperature)
    .with_max_tokens(300);

    let response = llm.complete(request).await?;
    let raw: Value = serde_json::from_str(&extract_json_object(&response.content))?;
    Ok(validate(&missing, &raw))
}
