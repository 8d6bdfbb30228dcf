//! Per-session connection lifecycle: state machine, resend cache, manager.

pub mod cache;
pub mod manager;
pub mod state;

pub use cache::MessageCache;
pub use manager::{ConnectionManager, LinkObserver};
pub use state::{Effect, LinkEvent, LinkState, reconnect_delay, transition};
