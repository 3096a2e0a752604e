//! Per-client jam registry with admission control.
//!
//! Admission runs before anything is allocated: no processes spawn and no
//! session exists until the request clears both ceilings. A client starting
//! a new jam while one is live replaces its own session, so its existing
//! agents never count against it.

use std::sync::Arc;

use dashmap::DashMap;
use serde::Serialize;
use thiserror::Error;
use tracing::{info, warn};

use crate::admission::{self, AdmissionDecision};
use crate::agents::ProcessBackendFactory;
use crate::domain::{self, MusicalContext};
use crate::prompts::PromptAssembler;
use crate::scheduler::JamScheduler;

#[derive(Debug, Error)]
pub enum JamError {
    #[error("the stage is full: {decision:?}")]
    Refused { decision: AdmissionDecision },

    #[error("unknown preset '{id}', try one of: {known}")]
    UnknownPreset { id: String, known: String },

    #[error("no agents requested")]
    NoAgents,
}

struct Entry {
    scheduler: JamScheduler,
    agent_count: usize,
}

/// Registry stats, for operator visibility.
#[derive(Debug, Clone, Serialize)]
pub struct RegistryStats {
    pub active_jams: usize,
    pub active_agent_processes: usize,
}

/// Owns every live jam session, keyed by client id.
pub struct JamRegistry {
    jams: DashMap<String, Entry>,
    limits: bandconf::LimitsConfig,
    timing: bandconf::TimingConfig,
    tuning: bandconf::TuningConfig,
    prompts: Arc<PromptAssembler>,
    backends: Arc<dyn ProcessBackendFactory>,
}

impl JamRegistry {
    pub fn new(
        config: &bandconf::BandConfig,
        backends: Arc<dyn ProcessBackendFactory>,
    ) -> Self {
        Self {
            jams: DashMap::new(),
            limits: config.limits.clone(),
            timing: config.timing,
            tuning: config.tuning,
            prompts: Arc::new(PromptAssembler::new(&config.paths)),
            backends,
        }
    }

    pub fn stats(&self) -> RegistryStats {
        RegistryStats {
            active_jams: self.jams.len(),
            active_agent_processes: self.jams.iter().map(|e| e.agent_count).sum(),
        }
    }

    /// Start a jam for a client, replacing that client's previous session
    /// if one is live. Returns the new session's scheduler handle.
    pub async fn start_jam(
        &self,
        client_id: &str,
        roles: Vec<String>,
        preset: Option<&str>,
    ) -> Result<JamScheduler, JamError> {
        if roles.is_empty() {
            return Err(JamError::NoAgents);
        }
        let context = match preset {
            Some(id) => domain::preset(id)
                .map(MusicalContext::from_preset)
                .ok_or_else(|| JamError::UnknownPreset {
                    id: id.to_string(),
                    known: domain::preset_ids().join(", "),
                })?,
            None => MusicalContext::default(),
        };

        let stats = self.stats();
        let existing = self
            .jams
            .get(client_id)
            .map(|entry| entry.agent_count)
            .unwrap_or(0);
        let decision = admission::check(
            admission::AdmissionRequest {
                active_jams: stats.active_jams as u32,
                active_agent_processes: stats.active_agent_processes as u32,
                existing_client_agents: existing as u32,
                requested_agents: roles.len() as u32,
            },
            &self.limits,
        );
        if !decision.allowed {
            warn!(client = client_id, ?decision, "jam refused at the door");
            return Err(JamError::Refused { decision });
        }

        // tear down the client's previous session before the new one spawns
        if let Some((_, old)) = self.jams.remove(client_id) {
            info!(client = client_id, "replacing client's live session");
            old.scheduler.stop().await;
        }

        let agent_count = roles.len();
        let backend = self
            .backends
            .create(&format!("{client_id}/{}", uuid::Uuid::new_v4()));
        let scheduler = JamScheduler::spawn(
            client_id,
            roles,
            context,
            backend,
            self.prompts.clone(),
            &self.timing,
            self.tuning,
        );
        self.jams.insert(
            client_id.to_string(),
            Entry {
                scheduler: scheduler.clone(),
                agent_count,
            },
        );
        Ok(scheduler)
    }

    pub fn jam(&self, client_id: &str) -> Option<JamScheduler> {
        self.jams.get(client_id).map(|entry| entry.scheduler.clone())
    }

    /// Stop and forget one client's session.
    pub async fn stop_jam(&self, client_id: &str) -> bool {
        match self.jams.remove(client_id) {
            Some((_, entry)) => {
                entry.scheduler.stop().await;
                true
            }
            None => false,
        }
    }

    /// Stop everything. Used at process shutdown.
    pub async fn stop_all(&self) {
        let clients: Vec<String> = self.jams.iter().map(|e| e.key().clone()).collect();
        for client in clients {
            self.stop_jam(&client).await;
        }
    }
}
