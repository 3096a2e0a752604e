//! Session state and the per-client jam registry.

pub mod manager;
pub mod types;

pub use manager::{JamError, JamRegistry, RegistryStats};
pub use types::{
    AgentRuntimeState, AgentStatus, AudioFeedback, DirectiveError, PresetError, RoutingScope,
    Session, SessionSnapshot, TurnKind,
};
