//! Trigger keyword matching.
//!
//! Tiers, first hit wins:
//! 1. raw text equals a trigger
//! 2. normalized text equals a normalized trigger
//! 3. normalized trigger is a substring of the normalized text
//! 4. trigger words appear as a contiguous run of whole words
//! 5. fuzzy: at least 70% of the trigger's words (2+ chars) overlap a
//!    message word as substring or superstring
//!
//! Within tiers 3-5 the longest trigger wins.

use std::sync::LazyLock;

use regex::Regex;

/// Minimum share of trigger words that must be present for a fuzzy hit.
const FUZZY_THRESHOLD: f64 = 0.7;

static URL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\b(?:https?://|www\.)\S+").expect("url pattern"));

static SHORTENER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(?:bit\.ly|t\.co|goo\.gl|tinyurl\.com|wa\.me|ow\.ly|is\.gd|buff\.ly|fb\.me|lnkd\.in|cutt\.ly|rb\.gy)(?:/\S*)?")
        .expect("shortener pattern")
});

static DOMAIN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b[a-z0-9-]+(?:\.[a-z0-9-]+)*\.(?:com|net|org|io|co|mx|es|ar|info|biz|app|me|ly|site|store)\b(?:/\S*)?")
        .expect("domain pattern")
});

fn is_emoji(c: char) -> bool {
    matches!(
        c as u32,
        0x1F000..=0x1FAFF | 0x2600..=0x27BF | 0x2B00..=0x2BFF | 0xFE00..=0xFE0F | 0x200D | 0x20E3
    )
}

fn is_decoration(c: char) -> bool {
    matches!(
        c,
        '•' | '◦' | '▪' | '▫' | '●' | '○' | '■' | '□' | '►' | '▶' | '▸' | '→' | '←' | '⇒' | '➔'
            | '➜' | '➡' | '➤' | '"' | '\'' | '“' | '”' | '‘' | '’' | '«' | '»' | '`' | '´' | '*'
            | '_' | '~'
    )
}

/// Lowercased text with links, emoji and decoration removed and whitespace
/// collapsed.
pub fn normalize(text: &str) -> String {
    let text = URL.replace_all(text, " ");
    let text = SHORTENER.replace_all(&text, " ");
    let text = DOMAIN.replace_all(&text, " ");
    let cleaned: String = text
        .chars()
        .map(|c| if is_decoration(c) { ' ' } else { c })
        .filter(|c| !is_emoji(*c))
        .collect();
    cleaned
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// Alphanumeric words of a normalized string.
fn words(normalized: &str) -> Vec<String> {
    normalized
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(str::to_string)
        .collect()
}

#[derive(Debug, Clone)]
struct Trigger {
    raw: String,
    normalized: String,
    words: Vec<String>,
}

impl Trigger {
    fn new(raw: String) -> Self {
        let normalized = normalize(&raw);
        let words = words(&normalized);
        Self {
            raw,
            normalized,
            words,
        }
    }

    fn weight(&self) -> usize {
        self.normalized.chars().count()
    }

    fn whole_words_in(&self, message: &[String]) -> bool {
        !self.words.is_empty()
            && message
                .windows(self.words.len())
                .any(|window| window == self.words.as_slice())
    }

    fn fuzzy_in(&self, message: &[String]) -> bool {
        let long: Vec<&String> = self.words.iter().filter(|w| w.chars().count() >= 2).collect();
        if long.is_empty() {
            return false;
        }
        let candidates: Vec<&String> = message.iter().filter(|w| w.chars().count() >= 2).collect();
        let hits = long
            .iter()
            .filter(|t| {
                candidates
                    .iter()
                    .any(|m| m.contains(t.as_str()) || t.contains(m.as_str()))
            })
            .count();
        hits as f64 / long.len() as f64 >= FUZZY_THRESHOLD
    }
}

/// Matches inbound text against the active trigger set.
#[derive(Debug, Clone, Default)]
pub struct TriggerMatcher {
    /// Longest normalized form first, so `find` yields the longest hit.
    triggers: Vec<Trigger>,
}

impl TriggerMatcher {
    pub fn new<I, S>(triggers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut triggers: Vec<Trigger> = triggers
            .into_iter()
            .map(|t| Trigger::new(t.into()))
            .filter(|t| !t.normalized.is_empty())
            .collect();
        triggers.sort_by(|a, b| b.weight().cmp(&a.weight()).then_with(|| a.raw.cmp(&b.raw)));
        Self { triggers }
    }

    pub fn is_empty(&self) -> bool {
        self.triggers.is_empty()
    }

    pub fn len(&self) -> usize {
        self.triggers.len()
    }

    /// The trigger `text` activates, if any.
    pub fn find(&self, text: &str) -> Option<&str> {
        if let Some(t) = self.triggers.iter().find(|t| t.raw == text) {
            return Some(&t.raw);
        }

        let normalized = normalize(text);
        if normalized.is_empty() {
            return None;
        }
        if let Some(t) = self.triggers.iter().find(|t| t.normalized == normalized) {
            return Some(&t.raw);
        }
        if let Some(t) = self
            .triggers
            .iter()
            .find(|t| normalized.contains(t.normalized.as_str()))
        {
            return Some(&t.raw);
        }

        let message = words(&normalized);
        if let Some(t) = self.triggers.iter().find(|t| t.whole_words_in(&message)) {
            return Some(&t.raw);
        }
        self.triggers
            .iter()
            .find(|t| t.fuzzy_in(&message))
            .map(|t| t.raw.as_str())
    }
}
