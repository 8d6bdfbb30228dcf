//! Per-tenant chat sessions with drip sequences and a
//! conversational qualifier.

pub mod activity;
pub mod agenda;
pub mod api;
pub mod config;
pub mod connection;
pub mod conversation;
pub mod dedup;
pub mod error;
pub mod llm;
pub mod outbound;
pub mod outbox;
pub mod sequence;
pub mod session;
pub mod store;
pub mod ticker;
pub mod transport;

#[cfg(test)]
pub(crate) mod testing;
