//! Bandstand - turn scheduler and session core for an AI jam band
//!
//! Library exposing core modules for testing and reuse.

pub mod admission;
pub mod aggregation;
pub mod agents;
pub mod domain;
pub mod prompts;
pub mod scheduler;
pub mod sessions;
pub mod telemetry;
