//! LLM-driven conversations: start decision, slot extraction, replies.

pub mod engine;
pub mod extract;
pub mod prompt_config;
pub mod prompts;
pub mod state;
pub mod trigger;

pub use engine::ConversationEngine;
pub use prompt_config::{BusinessHours, FieldKind, MissionField, PromptConfig, PromptConfigStore};
pub use state::{ConversationState, SlotValue};
pub use trigger::{StartGate, TriggerDecision};
