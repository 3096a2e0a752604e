//! Agent subprocess lifecycle: one conversational child process per band
//! member, a line-oriented event protocol, and schema validation of what
//! comes back.

pub mod protocol;
pub mod runner;

pub use protocol::{fallback_reaction, AgentEvent, AgentReply, Validated};
pub use runner::{
    AgentBackend, ConfiguredBackendFactory, ProcessBackend, ProcessBackendFactory, TurnOutcome,
};
