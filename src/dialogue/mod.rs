//! Reviewer/arbiter dialogue sessions.

pub mod arbiter;
pub mod session;

pub use arbiter::{ArbiterConfig, ArbiterRuling, Resolution, SectionEdit, parse_ruling};
pub use session::{DialogueSession, SessionOutcome};
