//! Drip campaigns: trigger matching, eligibility and the step runner.

pub mod eligibility;
pub mod engine;
pub mod matcher;

pub use eligibility::{EligibilityPolicy, NameAndRecencyPolicy};
pub use engine::{SequenceEngine, SequenceHandle, SequenceOutcome, silence_elapsed, split_numbered};
pub use matcher::{TriggerMatcher, normalize};
