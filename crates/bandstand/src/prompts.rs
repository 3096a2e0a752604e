//! System prompt assembly for agent roles.
//!
//! Each role's system prompt is persona text, a condensed slice of the
//! shared band policy, and the pattern-language reference, concatenated in
//! that fixed order. Assembly is deterministic and cached per role; the
//! resources are read once and never written.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};

use thiserror::Error;
use tracing::debug;

/// Policy sections kept in the condensed block, in order. Everything else
/// in the policy document is for humans, not prompts.
const POLICY_SECTIONS: [&str; 2] = ["ground rules", "response format"];

#[derive(Debug, Error)]
pub enum PromptError {
    #[error("No persona found for agent '{role}' (looked at {path})")]
    MissingPersona { role: String, path: PathBuf },

    #[error("Failed to read prompt resource {path}: {source}")]
    ResourceRead {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// Builds and caches one system prompt per agent role.
pub struct PromptAssembler {
    personas_dir: PathBuf,
    policy_path: PathBuf,
    reference_path: PathBuf,
    cache: RwLock<HashMap<String, Arc<String>>>,
}

impl PromptAssembler {
    pub fn new(paths: &bandconf::PathsConfig) -> Self {
        Self {
            personas_dir: paths.personas_dir.clone(),
            policy_path: paths.policy_path.clone(),
            reference_path: paths.reference_path.clone(),
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Check that a role's persona resource exists without assembling.
    pub fn persona_exists(&self, role: &str) -> bool {
        self.persona_path(role).is_file()
    }

    /// Assemble (or fetch from cache) the system prompt for a role.
    pub fn assemble(&self, role: &str) -> Result<Arc<String>, PromptError> {
        if let Some(cached) = self.cache.read().unwrap().get(role) {
            return Ok(cached.clone());
        }

        let persona_path = self.persona_path(role);
        if !persona_path.is_file() {
            return Err(PromptError::MissingPersona {
                role: role.to_string(),
                path: persona_path,
            });
        }

        let persona = read_resource(&persona_path)?;
        let policy = read_resource(&self.policy_path)?;
        let reference = read_resource(&self.reference_path)?;

        let prompt = format!(
            "{}\n\n{}\n\n{}",
            persona.trim_end(),
            condense_policy(&policy),
            reference.trim_end(),
        );

        let prompt = Arc::new(prompt);
        self.cache
            .write()
            .unwrap()
            .insert(role.to_string(), prompt.clone());

        debug!(agent.role = role, prompt.bytes = prompt.len(), "assembled system prompt");
        Ok(prompt)
    }

    fn persona_path(&self, role: &str) -> PathBuf {
        self.personas_dir.join(format!("{role}.md"))
    }
}

fn read_resource(path: &PathBuf) -> Result<String, PromptError> {
    std::fs::read_to_string(path).map_err(|e| PromptError::ResourceRead {
        path: path.clone(),
        source: e,
    })
}

/// Condense the shared policy document to its two prompt-relevant sections.
///
/// The policy is markdown split on `## ` headings; sections are emitted in
/// `POLICY_SECTIONS` order regardless of their order in the document, so
/// the assembled prompt is stable under policy reorganization.
fn condense_policy(policy: &str) -> String {
    let mut sections: HashMap<String, String> = HashMap::new();
    let mut current: Option<String> = None;
    let mut body = String::new();

    for line in policy.lines() {
        if let Some(heading) = line.strip_prefix("## ") {
            if let Some(name) = current.take() {
                sections.insert(name, body.trim().to_string());
            }
            body = String::new();
            current = Some(heading.trim().to_ascii_lowercase());
        } else if current.is_some() {
            body.push_str(line);
            body.push('\n');
        }
    }
    if let Some(name) = current {
        sections.insert(name, body.trim().to_string());
    }

    let mut condensed = String::new();
    for name in POLICY_SECTIONS {
        if let Some(text) = sections.get(name) {
            if !condensed.is_empty() {
                condensed.push_str("\n\n");
            }
            condensed.push_str(text);
        }
    }
    condensed
}
