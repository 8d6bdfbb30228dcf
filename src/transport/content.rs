//! Inbound message content model.
//!
//! Transports wrap payloads in envelopes (ephemeral, view-once, edits,
//! captioned documents) that can nest arbitrarily. `MessageContent` mirrors
//! that as a recursive tagged union and `classify()` unwraps it.

use serde::{Deserialize, Serialize};

/// Maximum wrapper depth followed before content is treated as undecodable.
const MAX_WRAPPER_DEPTH: usize = 8;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MessageContent {
    Text {
        text: String,
    },
    Image {
        #[serde(default)]
        caption: Option<String>,
    },
    Video {
        #[serde(default)]
        caption: Option<String>,
    },
    Document {
        #[serde(default)]
        file_name: Option<String>,
        #[serde(default)]
        caption: Option<String>,
    },
    Audio,
    Sticker,
    Location {
        #[serde(default)]
        name: Option<String>,
    },
    ContactCard {
        #[serde(default)]
        display_name: Option<String>,
    },
    /// Quick-reply button or list selection.
    ButtonReply {
        text: String,
    },
    Ephemeral {
        inner: Box<MessageContent>,
    },
    ViewOnce {
        inner: Box<MessageContent>,
    },
    Edited {
        inner: Box<MessageContent>,
    },
    DocumentWithCaption {
        inner: Box<MessageContent>,
    },
    /// Revokes, key distribution, history sync notices and similar.
    Protocol,
    Reaction {
        #[serde(default)]
        emoji: String,
    },
    #[serde(other)]
    Unknown,
}

/// What the engine can make of a piece of content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeOutcome {
    /// Readable text.
    Text(String),
    /// Media without a caption; the label stands in for the text.
    Media(&'static str),
    /// Protocol or reaction traffic. Never logged, never retried.
    Control,
    /// Content is present but no text could be recovered.
    Undecodable,
}

impl DecodeOutcome {
    /// The text to log for this outcome, if any.
    pub fn loggable_text(&self) -> Option<String> {
        match self {
            Self::Text(t) => Some(t.clone()),
            Self::Media(label) => Some((*label).to_string()),
            Self::Control | Self::Undecodable => None,
        }
    }
}

fn non_empty(s: Option<&String>) -> Option<String> {
    s.map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

impl MessageContent {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }

    pub fn classify(&self) -> DecodeOutcome {
        self.classify_at(0)
    }

    fn classify_at(&self, depth: usize) -> DecodeOutcome {
        if depth > MAX_WRAPPER_DEPTH {
            return DecodeOutcome::Undecodable;
        }
        match self {
            Self::Text { text } | Self::ButtonReply { text } => match non_empty(Some(text)) {
                Some(t) => DecodeOutcome::Text(t),
                None => DecodeOutcome::Undecodable,
            },
            Self::Image { caption } => non_empty(caption.as_ref())
                .map_or(DecodeOutcome::Media("[image]"), DecodeOutcome::Text),
            Self::Video { caption } => non_empty(caption.as_ref())
                .map_or(DecodeOutcome::Media("[video]"), DecodeOutcome::Text),
            Self::Document { caption, .. } => non_empty(caption.as_ref())
                .map_or(DecodeOutcome::Media("[document]"), DecodeOutcome::Text),
            Self::Audio => DecodeOutcome::Media("[audio]"),
            Self::Sticker => DecodeOutcome::Media("[sticker]"),
            Self::Location { .. } => DecodeOutcome::Media("[location]"),
            Self::ContactCard { .. } => DecodeOutcome::Media("[contact]"),
            Self::Ephemeral { inner }
            | Self::ViewOnce { inner }
            | Self::Edited { inner }
            | Self::DocumentWithCaption { inner } => inner.classify_at(depth + 1),
            Self::Protocol | Self::Reaction { .. } => DecodeOutcome::Control,
            Self::Unknown => DecodeOutcome::Undecodable,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nested_wrappers_unwrap_to_text() {
        let content = MessageContent::Ephemeral {
            inner: Box::new(MessageContent::ViewOnce {
                inner: Box::new(MessageContent::Image {
                    caption: Some("  mira esta casa ".into()),
                }),
            }),
        };
        assert_eq!(
            content.classify(),
            DecodeOutcome::Text("mira esta casa".into())
        );
    }

    #[test]
    fn captionless_media_gets_placeholder() {
        let c = MessageContent::DocumentWithCaption {
            inner: Box::new(MessageContent::Document {
                file_name: Some("plano.pdf".into()),
                caption: None,
            }),
        };
        assert_eq!(c.classify(), DecodeOutcome::Media("[document]"));
        assert_eq!(c.classify().loggable_text().as_deref(), Some("[document]"));
    }

    #[test]
    fn control_and_unknown() {
        assert_eq!(MessageContent::Protocol.classify(), DecodeOutcome::Control);
        assert_eq!(
            MessageContent::Reaction { emoji: "👍".into() }.classify(),
            DecodeOutcome::Control
        );
        assert_eq!(MessageContent::Unknown.classify(), DecodeOutcome::Undecodable);
        assert_eq!(MessageContent::text("   ").classify(), DecodeOutcome::Undecodable);
    }

    #[test]
    fn deserializes_tagged_json_with_unknown_fallback() {
        let c: MessageContent = serde_json::from_value(serde_json::json!({
            "type": "edited",
            "inner": {"type": "text", "text": "hola"}
        }))
        .unwrap();
        assert_eq!(c.classify(), DecodeOutcome::Text("hola".into()));

        let c: MessageContent =
            serde_json::from_value(serde_json::json!({"type": "poll_creation"})).unwrap();
        assert_eq!(c, MessageContent::Unknown);
    }

    #[test]
    fn runaway_nesting_is_undecodable() {
        let mut c = MessageContent::text("deep");
        for _ in 0..20 {
            c = MessageContent::Ephemeral { inner: Box::new(c) };
        }
        assert_eq!(c.classify(), DecodeOutcome::Undecodable);
    }
}
