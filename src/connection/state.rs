//! Connection state machine.
//!
//! `transition` is pure: it takes the current state, an event, the policy,
//! the current time and a jitter sample in `[-1, 1]`, and returns the next
//! state plus the effects the manager must carry out, in order.

use std::collections::VecDeque;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::config::ReconnectPolicy;
use crate::store::SessionStatus;
use crate::transport::{CloseReason, canonical_phone};

#[derive(Debug, Clone, PartialEq)]
pub struct LinkState {
    pub status: SessionStatus,
    /// Consecutive transient failures since the last successful connect.
    pub reconnect_attempts: u32,
    /// Times of recent "replaced" closes, inside the conflict window.
    pub conflicts: VecDeque<DateTime<Utc>>,
    /// Automatic credential wipes performed so far.
    pub auto_relinks: u32,
    /// No further reconnects until a manual start.
    pub halted: bool,
    pub self_id: Option<String>,
}

impl Default for LinkState {
    fn default() -> Self {
        Self {
            status: SessionStatus::Disconnected,
            reconnect_attempts: 0,
            conflicts: VecDeque::new(),
            auto_relinks: 0,
            halted: false,
            self_id: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum LinkEvent {
    /// A connect attempt is starting.
    Connecting { manual: bool },
    Qr(String),
    Open { self_id: String },
    Closed(CloseReason),
    /// The transport refused to open at all.
    ConnectFailed(String),
    Stop,
    Logout,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    PersistStatus {
        status: SessionStatus,
        qr: Option<String>,
        phone: Option<String>,
    },
    EmitQr(String),
    StartLoops,
    StopLoops,
    ScheduleReconnect(Duration),
    RestartPairing,
    WipeAndRelink,
    ClearCredentials,
    Halt,
}

fn persist(status: SessionStatus) -> Effect {
    Effect::PersistStatus {
        status,
        qr: None,
        phone: None,
    }
}

/// `base * attempt`, capped, then scaled by `1 + jitter_fraction * jitter`
/// and capped again.
pub fn reconnect_delay(policy: &ReconnectPolicy, attempt: u32, jitter: f64) -> Duration {
    let linear = policy.base_delay.saturating_mul(attempt.max(1));
    let capped = linear.min(policy.max_delay);
    let factor = (1.0 + policy.jitter * jitter.clamp(-1.0, 1.0)).max(0.0);
    capped.mul_f64(factor).min(policy.max_delay)
}

pub fn transition(
    state: &LinkState,
    event: LinkEvent,
    policy: &ReconnectPolicy,
    now: DateTime<Utc>,
    jitter: f64,
) -> (LinkState, Vec<Effect>) {
    let mut next = state.clone();
    let mut effects = Vec::new();

    // After a halt only a manual start does anything.
    if state.halted
        && !matches!(
            event,
            LinkEvent::Connecting { manual: true } | LinkEvent::Stop | LinkEvent::Logout
        )
    {
        return (next, effects);
    }

    match event {
        LinkEvent::Connecting { manual } => {
            if manual {
                next.halted = false;
                next.conflicts.clear();
            }
            next.status = SessionStatus::Connecting;
            effects.push(persist(SessionStatus::Connecting));
        }
        LinkEvent::Qr(code) => {
            next.status = SessionStatus::QrPending;
            effects.push(Effect::PersistStatus {
                status: SessionStatus::QrPending,
                qr: Some(code.clone()),
                phone: None,
            });
            effects.push(Effect::EmitQr(code));
        }
        LinkEvent::Open { self_id } => {
            next.status = SessionStatus::Connected;
            next.reconnect_attempts = 0;
            next.self_id = Some(self_id.clone());
            effects.push(Effect::PersistStatus {
                status: SessionStatus::Connected,
                qr: None,
                phone: canonical_phone(&self_id),
            });
            effects.push(Effect::StartLoops);
        }
        LinkEvent::Closed(CloseReason::LoggedOut) => {
            next.status = SessionStatus::Disconnected;
            next.reconnect_attempts = 0;
            next.halted = true;
            next.self_id = None;
            effects.extend([
                Effect::StopLoops,
                persist(SessionStatus::Disconnected),
                Effect::ClearCredentials,
                Effect::Halt,
            ]);
        }
        LinkEvent::Closed(CloseReason::Replaced) => {
            let window = chrono::Duration::from_std(policy.conflict_window)
                .unwrap_or(chrono::Duration::minutes(5));
            next.conflicts.push_back(now);
            while next.conflicts.front().is_some_and(|t| *t < now - window) {
                next.conflicts.pop_front();
            }

            if next.conflicts.len() > policy.conflict_retry_limit {
                next.conflicts.clear();
                if next.auto_relinks < policy.max_auto_relinks {
                    next.auto_relinks += 1;
                    next.reconnect_attempts = 0;
                    next.status = SessionStatus::Connecting;
                    next.self_id = None;
                    effects.extend([
                        Effect::StopLoops,
                        persist(SessionStatus::Connecting),
                        Effect::WipeAndRelink,
                    ]);
                } else {
                    next.status = SessionStatus::Error;
                    next.halted = true;
                    effects.extend([
                        Effect::StopLoops,
                        persist(SessionStatus::Error),
                        Effect::Halt,
                    ]);
                }
            } else {
                schedule_reconnect(&mut next, &mut effects, policy, jitter);
            }
        }
        LinkEvent::Closed(CloseReason::QrTimeout) => {
            next.status = SessionStatus::Connecting;
            effects.extend([persist(SessionStatus::Connecting), Effect::RestartPairing]);
        }
        LinkEvent::Closed(CloseReason::Transient(_)) | LinkEvent::ConnectFailed(_) => {
            schedule_reconnect(&mut next, &mut effects, policy, jitter);
        }
        LinkEvent::Stop | LinkEvent::Logout => {
            let logout = matches!(event, LinkEvent::Logout);
            next.status = SessionStatus::Disconnected;
            next.reconnect_attempts = 0;
            next.halted = true;
            next.conflicts.clear();
            effects.extend([Effect::StopLoops, persist(SessionStatus::Disconnected), Effect::Halt]);
            if logout {
                next.self_id = None;
                next.auto_relinks = 0;
                effects.push(Effect::ClearCredentials);
            }
        }
    }

    (next, effects)
}

fn schedule_reconnect(
    next: &mut LinkState,
    effects: &mut Vec<Effect>,
    policy: &ReconnectPolicy,
    jitter: f64,
) {
    let was_connected = next.status == SessionStatus::Connected;
    next.reconnect_attempts += 1;
    next.status = SessionStatus::Connecting;
    if was_connected {
        effects.push(Effect::StopLoops);
    }
    effects.push(persist(SessionStatus::Connecting));
    effects.push(Effect::ScheduleReconnect(reconnect_delay(
        policy,
        next.reconnect_attempts,
        jitter,
    )));
}
