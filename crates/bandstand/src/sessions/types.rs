//! Core session types. The scheduler's worker task is the sole mutator of
//! `Session`; everyone else sees immutable snapshots.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::domain::MusicalContext;

/// What kind of turn is running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnKind {
    JamStart,
    AutoTick,
    Directive,
}

/// Routing policy for a directive turn. Untargeted directives always go to
/// the activated set; the scope decides what a directive may do before any
/// agent has been activated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoutingScope {
    /// Default policy for human-issued directives. Targeted directives may
    /// activate the first agent.
    Broadcast,
    /// Stricter policy for automated directive sources: refuses every
    /// directive, targeted or not, until a human has activated an agent.
    ActivationRequired,
}

/// Per-agent lifecycle state visible in snapshots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Idle,
    Thinking,
    Playing,
    /// Turn settled without a usable reply; the fallback reaction is showing.
    Timeout,
    /// Process died. Sticky for the rest of the session: ticks skip the
    /// agent and directives targeting it are refused.
    Error,
}

/// One agent's runtime state within a session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRuntimeState {
    pub role: String,
    pub status: AgentStatus,
    /// Current musical pattern text. Opaque to the core apart from the
    /// keep-previous sentinel.
    pub pattern: String,
    /// Shown as the pattern when the agent settles unusable before it has
    /// ever played anything.
    pub fallback_pattern: String,
    pub thoughts: String,
    pub reaction: String,
    /// Conversation continuity token echoed back by the agent process.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<String>,
    pub last_updated: DateTime<Utc>,
}

impl AgentRuntimeState {
    pub fn new(role: &str, context: &MusicalContext) -> Self {
        Self {
            role: role.to_string(),
            status: AgentStatus::Idle,
            pattern: String::new(),
            fallback_pattern: format!("hold the root of {}", context.key),
            thoughts: String::new(),
            reaction: String::new(),
            thread_id: None,
            last_updated: Utc::now(),
        }
    }
}

/// Observed audio state reported back by the client, folded into prompts so
/// agents hear what is actually playing rather than what they last asked for.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AudioFeedback {
    #[serde(default)]
    pub playing_patterns: BTreeMap<String, String>,
    #[serde(default)]
    pub measured_bpm: Option<f64>,
    #[serde(default)]
    pub notes: Option<String>,
}

/// The full mutable state of one jam session. Owned by its worker task.
#[derive(Debug)]
pub struct Session {
    pub id: Uuid,
    pub client_id: String,
    /// Completed turns. Increments exactly once per settled turn.
    pub round: u64,
    pub context: MusicalContext,
    pub agents: BTreeMap<String, AgentRuntimeState>,
    /// Roles requested at jam start, in request order.
    pub selected: Vec<String>,
    /// Roles a directive has explicitly addressed at least once.
    pub activated: BTreeSet<String>,
    /// Roles excluded from auto-ticks (directives still reach them).
    pub muted: BTreeSet<String>,
    /// Terminal. Set once, right before the final snapshot.
    pub stopped: bool,
    pub audio_feedback: Option<AudioFeedback>,
    pub started_at: DateTime<Utc>,
}

impl Session {
    pub fn new(client_id: &str, selected: Vec<String>, context: MusicalContext) -> Self {
        let agents = selected
            .iter()
            .map(|role| (role.clone(), AgentRuntimeState::new(role, &context)))
            .collect();
        Self {
            id: Uuid::new_v4(),
            client_id: client_id.to_string(),
            round: 0,
            context,
            agents,
            selected,
            activated: BTreeSet::new(),
            muted: BTreeSet::new(),
            stopped: false,
            audio_feedback: None,
            started_at: Utc::now(),
        }
    }

    /// Immutable snapshot for broadcast to observers.
    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            session_id: self.id,
            round: self.round,
            context: self.context.clone(),
            agents: self.selected.iter().filter_map(|role| self.agents.get(role).cloned()).collect(),
            activated: self.activated.iter().cloned().collect(),
            muted: self.muted.iter().cloned().collect(),
            stopped: self.stopped,
            captured_at: Utc::now(),
        }
    }
}

/// Point-in-time view of a session, safe to hand across tasks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub session_id: Uuid,
    pub round: u64,
    pub context: MusicalContext,
    /// In selection order.
    pub agents: Vec<AgentRuntimeState>,
    pub activated: Vec<String>,
    pub muted: Vec<String>,
    pub stopped: bool,
    pub captured_at: DateTime<Utc>,
}

/// Why a directive was rejected up front. A rejected directive consumes no
/// turn and leaves the round counter alone.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DirectiveError {
    #[error("'{role}' is not in this session")]
    NotInSession { role: String },

    #[error("'{role}' process is unavailable")]
    ProcessUnavailable { role: String },

    #[error("no agents are active yet")]
    NoActiveAgents,

    #[error("the session has stopped")]
    SessionStopped,
}

/// Why a preset change was rejected.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PresetError {
    #[error("unknown preset '{id}', try one of: {known}")]
    Unknown { id: String, known: String },

    #[error("the jam is already under way; presets only seed a fresh session")]
    AlreadyActivated,

    #[error("the session has stopped")]
    SessionStopped,
}
