//! Tenant sessions: the per-tenant component graph and the registry.

pub mod manager;
pub mod pipeline;
pub mod runtime;

pub use manager::{SessionManager, SessionSnapshot, validate_session_id};
pub use pipeline::{InboundPipeline, Routed};
pub use runtime::{EngineDeps, SessionEvent, SessionRuntime};
