//! Configuration types.
//!
//! Every section has a `Default` and a `from_env()` constructor that
//! overrides individual values from `ENGINE_*` environment variables.

use std::path::PathBuf;
use std::time::Duration;

/// Read an env var and parse it, falling back to `default` when unset or invalid.
fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(default)
}

fn env_secs(key: &str, default: Duration) -> Duration {
    Duration::from_secs(env_parse(key, default.as_secs()))
}

fn env_millis(key: &str, default: Duration) -> Duration {
    Duration::from_millis(env_parse(key, default.as_millis() as u64))
}

/// Comma-separated list, trimmed, empties dropped.
fn env_list(key: &str) -> Vec<String> {
    std::env::var(key)
        .unwrap_or_default()
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

/// Dedup cache configuration.
#[derive(Debug, Clone)]
pub struct DedupConfig {
    /// Maximum number of keys held in memory per session.
    pub max_entries: usize,
    /// Persisted keys older than this are pruned on load.
    pub retention: Duration,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            max_entries: 5000,
            retention: Duration::from_secs(3 * 24 * 3600),
        }
    }
}

impl DedupConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            max_entries: env_parse("ENGINE_DEDUP_MAX", d.max_entries),
            retention: env_secs("ENGINE_DEDUP_RETENTION_SECS", d.retention),
        }
    }
}

/// Outbox queue configuration.
#[derive(Debug, Clone)]
pub struct OutboxConfig {
    /// Base delay for exponential backoff.
    pub base_delay: Duration,
    /// Items are dropped once they reach this many failed attempts.
    pub max_attempts: u32,
    /// Timer flush interval.
    pub flush_interval: Duration,
    /// Items processed per flush.
    pub batch_size: usize,
    /// Enqueue triggers an immediate flush while the queue depth is at or below this.
    pub immediate_flush_depth: usize,
}

impl Default for OutboxConfig {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(2),
            max_attempts: 5,
            flush_interval: Duration::from_secs(5),
            batch_size: 50,
            immediate_flush_depth: 10,
        }
    }
}

impl OutboxConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            base_delay: env_millis("ENGINE_OUTBOX_BASE_DELAY_MS", d.base_delay),
            max_attempts: env_parse("ENGINE_OUTBOX_MAX_ATTEMPTS", d.max_attempts),
            flush_interval: env_secs("ENGINE_OUTBOX_FLUSH_SECS", d.flush_interval),
            batch_size: env_parse("ENGINE_OUTBOX_BATCH", d.batch_size),
            immediate_flush_depth: env_parse(
                "ENGINE_OUTBOX_IMMEDIATE_DEPTH",
                d.immediate_flush_depth,
            ),
        }
    }
}

/// Reconnect, conflict and decode-retry policy for a transport connection.
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    /// Delay unit multiplied by the consecutive-failure count.
    pub base_delay: Duration,
    /// Upper bound on any reconnect delay.
    pub max_delay: Duration,
    /// Jitter fraction applied on top of the computed delay (0.3 = ±30%).
    pub jitter: f64,
    /// Sliding window for counting "replaced" conflicts.
    pub conflict_window: Duration,
    /// Conflicts tolerated inside the window before relinking or halting.
    pub conflict_retry_limit: usize,
    /// How many times credentials may be wiped and re-paired automatically.
    pub max_auto_relinks: u32,
    /// Resend requests issued for an undecodable message.
    pub decode_retry_limit: u32,
    /// Delay unit between resend requests.
    pub decode_retry_delay: Duration,
    /// Raw payloads kept for transport resend lookups.
    pub message_cache_size: usize,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(60),
            jitter: 0.3,
            conflict_window: Duration::from_secs(300),
            conflict_retry_limit: 3,
            max_auto_relinks: 1,
            decode_retry_limit: 3,
            decode_retry_delay: Duration::from_secs(2),
            message_cache_size: 500,
        }
    }
}

impl ReconnectPolicy {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            base_delay: env_millis("ENGINE_RECONNECT_BASE_MS", d.base_delay),
            max_delay: env_secs("ENGINE_RECONNECT_MAX_SECS", d.max_delay),
            jitter: env_parse("ENGINE_RECONNECT_JITTER", d.jitter).clamp(0.0, 1.0),
            conflict_window: env_secs("ENGINE_CONFLICT_WINDOW_SECS", d.conflict_window),
            conflict_retry_limit: env_parse("ENGINE_CONFLICT_RETRY_LIMIT", d.conflict_retry_limit),
            max_auto_relinks: env_parse("ENGINE_MAX_AUTO_RELINKS", d.max_auto_relinks),
            decode_retry_limit: env_parse("ENGINE_DECODE_RETRY_LIMIT", d.decode_retry_limit),
            decode_retry_delay: env_millis("ENGINE_DECODE_RETRY_DELAY_MS", d.decode_retry_delay),
            message_cache_size: env_parse("ENGINE_MESSAGE_CACHE_SIZE", d.message_cache_size),
        }
    }
}

/// Drip sequence configuration.
#[derive(Debug, Clone)]
pub struct SequenceConfig {
    /// Silence required after the contact's last inbound message before the next step.
    pub step_wait: Duration,
    /// How often a running sequence re-checks the silence window.
    pub silence_poll: Duration,
    /// Delay before step 0 is sent.
    pub startup_delay: Duration,
    /// Delay between parts of a numbered-list step.
    pub part_delay: Duration,
    /// Session-level poll loop interval.
    pub poll_interval: Duration,
    /// Contact names allowed to auto-start a sequence (empty = any name).
    pub allowed_names: Vec<String>,
    /// Contacts older than this never auto-start a sequence.
    pub max_contact_age: Duration,
}

impl Default for SequenceConfig {
    fn default() -> Self {
        Self {
            step_wait: Duration::from_secs(120),
            silence_poll: Duration::from_secs(5),
            startup_delay: Duration::from_secs(2),
            part_delay: Duration::from_millis(1500),
            poll_interval: Duration::from_secs(30),
            allowed_names: Vec::new(),
            max_contact_age: Duration::from_secs(24 * 3600),
        }
    }
}

impl SequenceConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            step_wait: env_secs("ENGINE_SEQUENCE_WAIT_SECS", d.step_wait),
            silence_poll: env_millis("ENGINE_SEQUENCE_SILENCE_POLL_MS", d.silence_poll),
            startup_delay: env_millis("ENGINE_SEQUENCE_STARTUP_DELAY_MS", d.startup_delay),
            part_delay: env_millis("ENGINE_SEQUENCE_PART_DELAY_MS", d.part_delay),
            poll_interval: env_secs("ENGINE_SEQUENCE_POLL_SECS", d.poll_interval),
            allowed_names: env_list("ENGINE_SEQUENCE_ALLOWED_NAMES"),
            max_contact_age: env_secs("ENGINE_SEQUENCE_MAX_CONTACT_AGE_SECS", d.max_contact_age),
        }
    }
}

/// Conversational engine configuration.
#[derive(Debug, Clone)]
pub struct ConversationConfig {
    /// Conversations without activity for this long are dropped.
    pub idle_timeout: Duration,
    /// Delay between mission completion and deactivation.
    pub completion_cooldown: Duration,
    /// Turns kept in the rolling history.
    pub history_limit: usize,
    /// TTL of the cached prompt configuration.
    pub prompt_cache_ttl: Duration,
    pub classify_temperature: f32,
    pub extract_temperature: f32,
    pub reply_temperature: f32,
    pub reply_max_tokens: u32,
}

impl Default for ConversationConfig {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(30 * 60),
            completion_cooldown: Duration::from_secs(10 * 60),
            history_limit: 20,
            prompt_cache_ttl: Duration::from_secs(60),
            classify_temperature: 0.1,
            extract_temperature: 0.0,
            reply_temperature: 0.7,
            reply_max_tokens: 400,
        }
    }
}

impl ConversationConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            idle_timeout: env_secs("ENGINE_CONVERSATION_IDLE_SECS", d.idle_timeout),
            completion_cooldown: env_secs(
                "ENGINE_CONVERSATION_COOLDOWN_SECS",
                d.completion_cooldown,
            ),
            history_limit: env_parse("ENGINE_CONVERSATION_HISTORY", d.history_limit),
            prompt_cache_ttl: env_secs("ENGINE_PROMPT_CACHE_TTL_SECS", d.prompt_cache_ttl),
            reply_max_tokens: env_parse("ENGINE_REPLY_MAX_TOKENS", d.reply_max_tokens),
            ..d
        }
    }
}

/// Outbound throttle configuration.
#[derive(Debug, Clone)]
pub struct OutboundConfig {
    /// Minimum spacing between two sends to the same contact.
    pub min_send_delay: Duration,
}

impl Default for OutboundConfig {
    fn default() -> Self {
        Self {
            min_send_delay: Duration::from_secs(2),
        }
    }
}

impl OutboundConfig {
    pub fn from_env() -> Self {
        Self {
            min_send_delay: env_millis("ENGINE_MIN_SEND_DELAY_MS", Self::default().min_send_delay),
        }
    }
}

/// Agenda (scheduled messages) configuration.
#[derive(Debug, Clone)]
pub struct AgendaConfig {
    pub poll_interval: Duration,
    pub batch_size: usize,
    pub max_attempts: u32,
}

impl Default for AgendaConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(30),
            batch_size: 20,
            max_attempts: 3,
        }
    }
}

impl AgendaConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            poll_interval: env_secs("ENGINE_AGENDA_POLL_SECS", d.poll_interval),
            batch_size: env_parse("ENGINE_AGENDA_BATCH", d.batch_size),
            max_attempts: env_parse("ENGINE_AGENDA_MAX_ATTEMPTS", d.max_attempts),
        }
    }
}

/// Full per-session engine configuration, shared by every tenant session.
#[derive(Debug, Clone, Default)]
pub struct EngineConfig {
    pub dedup: DedupConfig,
    pub outbox: OutboxConfig,
    pub reconnect: ReconnectPolicy,
    pub sequence: SequenceConfig,
    pub conversation: ConversationConfig,
    pub outbound: OutboundConfig,
    pub agenda: AgendaConfig,
}

impl EngineConfig {
    pub fn from_env() -> Self {
        Self {
            dedup: DedupConfig::from_env(),
            outbox: OutboxConfig::from_env(),
            reconnect: ReconnectPolicy::from_env(),
            sequence: SequenceConfig::from_env(),
            conversation: ConversationConfig::from_env(),
            outbound: OutboundConfig::from_env(),
            agenda: AgendaConfig::from_env(),
        }
    }
}

/// Process-level settings for the binary.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub db_path: PathBuf,
    pub http_port: u16,
    /// Base URL of the transport gateway the bridge transport talks to.
    pub bridge_url: String,
    pub log_dir: Option<PathBuf>,
}

impl ServerConfig {
    pub fn from_env() -> Self {
        Self {
            db_path: std::env::var("ENGINE_DB_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./data/session-engine.db")),
            http_port: env_parse("ENGINE_HTTP_PORT", 8080),
            bridge_url: std::env::var("ENGINE_BRIDGE_URL")
                .unwrap_or_else(|_| "http://127.0.0.1:3100".to_string()),
            log_dir: std::env::var("ENGINE_LOG_DIR").ok().map(PathBuf::from),
        }
    }
}
