//! Reply prompt assembly and the deterministic fallback replies.

use crate::conversation::prompt_config::{FieldKind, MissionField, PromptConfig};
use crate::conversation::state::ConversationState;

/// System prompt for the reply call.
///
/// While slots are missing the prompt lists them with the strategy and the
/// example questions. Once everything is filled it carries the completion
/// script instead.
pub fn system_prompt(config: &PromptConfig, state: &ConversationState) -> String {
    let mut prompt = config.identity.clone();

    if let Some(name) = &state.name {
        prompt.push_str(&format!("\n\nEl cliente se llama {name}."));
    }

    let known: Vec<String> = config
        .mission_fields
        .iter()
        .filter_map(|f| {
            let value = state.slots.get(&f.key)?.as_ref()?;
            Some(format!("- {}: {value}", f.label))
        })
        .collect();
    if !known.is_empty() {
        prompt.push_str("\n\nDatos ya confirmados (no los vuelvas a preguntar):\n");
        prompt.push_str(&known.join("\n"));
    }

    let missing = state.missing(&config.mission_fields);
    if missing.is_empty() {
        prompt.push_str("\n\nYa tienes todos los datos. ");
        prompt.push_str(&config.completion_script);
        return prompt;
    }

    prompt.push_str("\n\nDatos que aún necesitas obtener:\n");
    for field in &missing {
        let hint = match field.kind {
            FieldKind::Enum => format!(" (opciones: {})", field.options.join(", ")),
            _ => String::new(),
        };
        prompt.push_str(&format!("- {}: {}{hint}\n", field.label, field.description));
    }
    prompt.push_str("\nEstrategia: ");
    prompt.push_str(&config.strategy);
    if !config.question_examples.is_empty() {
        prompt.push_str("\n\nEjemplos de preguntas:\n");
        for example in &config.question_examples {
            prompt.push_str(&format!("- {example}\n"));
        }
    }
    prompt
}

/// Reply used when the model call fails, keyed to the first missing slot.
pub fn fallback_reply(first_missing: Option<&MissionField>, name: Option<&str>) -> String {
    let greeting = name.map_or_else(|| "¡Gracias!".to_string(), |n| format!("¡Gracias, {n}!"));
    let Some(field) = first_missing else {
        return format!("{greeting} Ya tengo todo lo necesario, un asesor te contactará muy pronto.");
    };
    let question = match field.key.as_str() {
        "budget" => "¿Qué presupuesto aproximado tienes en mente?".to_string(),
        "zone" => "¿En qué zona o colonia te gustaría buscar?".to_string(),
        "property_type" => "¿Buscas casa, departamento, terreno o local?".to_string(),
        _ => match field.kind {
            FieldKind::Enum if !field.options.is_empty() => {
                format!("¿Cuál prefieres: {}?", field.options.join(", "))
            }
            _ => format!("¿Me compartes tu {}?", field.label.to_lowercase()),
        },
    };
    format!("{greeting} {question}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conversation::state::SlotValue;
    use chrono::Utc;
    use std::collections::BTreeMap;

    #[test]
    fn prompt_lists_known_and_missing_fields() {
        let config = PromptConfig::default();
        let mut state =
            ConversationState::new(&config.mission_fields, Some("Ana".into()), Utc::now());
        state.merge(BTreeMap::from([("budget".to_string(), SlotValue::Number(150000.0))]));

        let prompt = system_prompt(&config, &state);
        assert!(prompt.starts_with(&config.identity));
        assert!(prompt.contains("se llama Ana"));
        assert!(prompt.contains("- Presupuesto: 150000"));
        assert!(prompt.contains("- Zona:"));
        assert!(prompt.contains("opciones: casa, departamento"));
        assert!(!prompt.contains(&config.completion_script));
    }

    #[test]
    fn complete_state_uses_completion_script() {
        let config = PromptConfig::default();
        let mut state = ConversationState::new(&config.mission_fields, None, Utc::now());
        state.merge(BTreeMap::from([
            ("budget".to_string(), SlotValue::Number(1.0)),
            ("zone".to_string(), SlotValue::Text("Centro".into())),
            ("property_type".to_string(), SlotValue::Text("casa".into())),
        ]));
        let prompt = system_prompt(&config, &state);
        assert!(prompt.contains(&config.completion_script));
        assert!(!prompt.contains("aún necesitas"));
    }

    #[test]
    fn fallback_follows_first_missing_slot() {
        let fields = PromptConfig::default().mission_fields;
        assert_eq!(
            fallback_reply(Some(&fields[1]), Some("Ana")),
            "¡Gracias, Ana! ¿En qué zona o colonia te gustaría buscar?"
        );
        assert!(fallback_reply(None, None).contains("un asesor te contactará"));

        let custom = MissionField {
            key: "pets".into(),
            label: "Mascota".into(),
            description: String::new(),
            kind: FieldKind::String,
            options: Vec::new(),
        };
        assert_eq!(fallback_reply(Some(&custom), None), "¡Gracias! ¿Me compartes tu mascota?");
    }
}
