//! Admission control for new jam sessions.
//!
//! A pure decision function, callable before any session resources are
//! allocated. Replacing one's own session never double-counts: the caller's
//! existing agent processes are subtracted before projecting.

use serde::{Deserialize, Serialize};

/// Everything the capacity decision needs, as observed right now.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct AdmissionRequest {
    /// Jams currently running, including the caller's own (if any).
    pub active_jams: u32,
    /// Live agent processes across all jams.
    pub active_agent_processes: u32,
    /// Agent processes owned by this caller's existing session (0 if none).
    pub existing_client_agents: u32,
    /// Agents the new session wants to spawn.
    pub requested_agents: u32,
}

/// Why a request was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdmissionReason {
    JamCapacityExceeded,
    AgentCapacityExceeded,
}

/// The decision, always carrying the full numeric breakdown for diagnostics.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct AdmissionDecision {
    pub allowed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<AdmissionReason>,
    pub projected_jams: u32,
    pub projected_agent_processes: u32,
    pub max_concurrent_jams: u32,
    pub max_total_agent_processes: u32,
}

/// Decide whether a new session fits within global capacity.
///
/// A caller with an existing session is replacing it, so the projected jam
/// count does not grow and its current agents are released before the new
/// ones are counted.
pub fn check(request: AdmissionRequest, limits: &bandconf::LimitsConfig) -> AdmissionDecision {
    let projected_jams = if request.existing_client_agents > 0 {
        request.active_jams
    } else {
        request.active_jams + 1
    };

    let projected_agent_processes = request
        .active_agent_processes
        .saturating_sub(request.existing_client_agents)
        + request.requested_agents;

    let reason = if projected_jams > limits.max_concurrent_jams {
        Some(AdmissionReason::JamCapacityExceeded)
    } else if projected_agent_processes > limits.max_total_agent_processes {
        Some(AdmissionReason::AgentCapacityExceeded)
    } else {
        None
    };

    AdmissionDecision {
        allowed: reason.is_none(),
        reason,
        projected_jams,
        projected_agent_processes,
        max_concurrent_jams: limits.max_concurrent_jams,
        max_total_agent_processes: limits.max_total_agent_processes,
    }
}
