//! Shared domain types for the jam: musical context, agent decisions.

pub mod context;
pub mod decision;

pub use context::{preset, preset_ids, GenrePreset, MusicalContext};
pub use decision::{Confidence, Decision};

/// Reserved pattern value meaning "keep the previous pattern".
///
/// The core never interprets pattern text except for this one sentinel.
pub const KEEP_PATTERN: &str = "KEEP_CURRENT";
