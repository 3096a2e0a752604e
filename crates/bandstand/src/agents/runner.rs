//! Agent subprocess ownership and the turn round-trip.
//!
//! One child process per agent role per session, spawned lazily on the
//! agent's first turn and kept for the session's lifetime. The scheduler
//! talks to agents through the `AgentBackend` trait so tests can substitute
//! a scripted backend.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use super::protocol::{validate_answer, AgentEvent, PromptEnvelope, Validated};
use super::AgentReply;

/// How one agent's turn settled. Every participant settles, one way or
/// another - a turn never waits on an agent that can no longer answer.
#[derive(Debug, Clone)]
pub enum TurnOutcome {
    /// A schema-valid answer, plus the continuity token in effect after
    /// this turn.
    Reply {
        reply: AgentReply,
        thread_id: Option<String>,
    },
    /// The subprocess answered but failed schema validation.
    Invalid { reason: String },
    /// No terminal event within the configured window.
    TimedOut,
    /// The subprocess exited unexpectedly. Terminal for the agent.
    Crashed { reason: String },
}

/// The seam between the scheduler and agent subprocesses.
#[async_trait]
pub trait AgentBackend: Send + Sync {
    /// Run one turn for one agent: prompt in, settled outcome out.
    /// `system_prompt` is used only if this call has to spawn the process.
    async fn run_turn(&self, role: &str, system_prompt: &str, prompt: &str) -> TurnOutcome;

    /// Whether the agent's process is currently running.
    async fn alive(&self, role: &str) -> bool;

    /// Best-effort kill of every live process. Idempotent.
    async fn shutdown(&self);
}

struct AgentChild {
    child: Child,
    stdin: ChildStdin,
    lines: Lines<BufReader<ChildStdout>>,
    thread_id: Option<String>,
}

/// Process-backed agent backend: spawns the configured agent command and
/// speaks the newline-delimited JSON protocol over its stdio.
pub struct ProcessBackend {
    command: PathBuf,
    args: Vec<String>,
    timeout: Duration,
    tuning: bandconf::TuningConfig,
    children: Mutex<HashMap<String, Arc<Mutex<AgentChild>>>>,
}

impl ProcessBackend {
    pub fn new(
        agent: &bandconf::AgentConfig,
        timing: &bandconf::TimingConfig,
        tuning: bandconf::TuningConfig,
    ) -> Self {
        Self {
            command: agent.command.clone(),
            args: agent.args.clone(),
            timeout: Duration::from_secs(timing.agent_timeout_secs),
            tuning,
            children: Mutex::new(HashMap::new()),
        }
    }

    /// Get the agent's child handle, spawning on first use.
    async fn child_for(&self, role: &str) -> std::io::Result<Arc<Mutex<AgentChild>>> {
        let mut children = self.children.lock().await;
        if let Some(existing) = children.get(role) {
            return Ok(existing.clone());
        }

        let mut child = Command::new(&self.command)
            .args(&self.args)
            .arg("--role")
            .arg(role)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::null())
            .kill_on_drop(true)
            .spawn()?;

        let stdin = child.stdin.take().expect("stdin was piped");
        let stdout = child.stdout.take().expect("stdout was piped");

        info!(agent.role = role, command = %self.command.display(), "spawned agent process");

        let handle = Arc::new(Mutex::new(AgentChild {
            child,
            stdin,
            lines: BufReader::new(stdout).lines(),
            thread_id: None,
        }));
        children.insert(role.to_string(), handle.clone());
        Ok(handle)
    }

    async fn remove(&self, role: &str) {
        self.children.lock().await.remove(role);
    }

    /// Drive one prompt/response exchange on an already-spawned child.
    async fn exchange(
        agent: &mut AgentChild,
        system_prompt: Option<&str>,
        prompt: &str,
        tuning: &bandconf::TuningConfig,
    ) -> Result<TurnOutcome, String> {
        let envelope = PromptEnvelope {
            system: system_prompt,
            prompt,
            thread_id: agent.thread_id.as_deref(),
        };
        let mut line = serde_json::to_string(&envelope).map_err(|e| e.to_string())?;
        line.push('\n');
        agent
            .stdin
            .write_all(line.as_bytes())
            .await
            .map_err(|e| format!("stdin write failed: {e}"))?;
        agent
            .stdin
            .flush()
            .await
            .map_err(|e| format!("stdin flush failed: {e}"))?;

        let mut answer: Option<String> = None;
        loop {
            let next = agent
                .lines
                .next_line()
                .await
                .map_err(|e| format!("stdout read failed: {e}"))?;
            let Some(raw) = next else {
                return Err("process closed stdout mid-turn".to_string());
            };

            match AgentEvent::parse(&raw) {
                Some(AgentEvent::ThreadStarted { thread_id }) => {
                    agent.thread_id = Some(thread_id);
                }
                Some(AgentEvent::Answer { text }) => answer = Some(text),
                Some(AgentEvent::TurnComplete) => break,
                Some(AgentEvent::Other) | None => {}
            }
        }

        let Some(text) = answer else {
            return Ok(TurnOutcome::Invalid {
                reason: "turn completed without an answer event".to_string(),
            });
        };

        Ok(match validate_answer(&text, tuning) {
            Validated::Valid(reply) => TurnOutcome::Reply {
                reply,
                thread_id: agent.thread_id.clone(),
            },
            Validated::Invalid(reason) => TurnOutcome::Invalid { reason },
        })
    }
}

#[async_trait]
impl AgentBackend for ProcessBackend {
    async fn run_turn(&self, role: &str, system_prompt: &str, prompt: &str) -> TurnOutcome {
        let handle = match self.child_for(role).await {
            Ok(handle) => handle,
            Err(e) => {
                error!(agent.role = role, error = %e, "failed to spawn agent process");
                return TurnOutcome::Crashed {
                    reason: format!("spawn failed: {e}"),
                };
            }
        };

        let mut agent = handle.lock().await;
        let first_turn = agent.thread_id.is_none();
        let system = first_turn.then_some(system_prompt);

        let exchange = Self::exchange(&mut agent, system, prompt, &self.tuning);
        match tokio::time::timeout(self.timeout, exchange).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(reason)) => {
                // I/O failure means the process is gone
                warn!(agent.role = role, reason = %reason, "agent process lost");
                drop(agent);
                self.remove(role).await;
                TurnOutcome::Crashed { reason }
            }
            Err(_) => {
                // a late answer would desync the line protocol, so the
                // child is discarded and respawned on the next turn
                warn!(agent.role = role, timeout_secs = self.timeout.as_secs(), "agent timed out");
                drop(agent);
                self.remove(role).await;
                TurnOutcome::TimedOut
            }
        }
    }

    async fn alive(&self, role: &str) -> bool {
        let handle = {
            let children = self.children.lock().await;
            match children.get(role) {
                Some(handle) => handle.clone(),
                None => return false,
            }
        };
        let mut agent = handle.lock().await;
        matches!(agent.child.try_wait(), Ok(None))
    }

    async fn shutdown(&self) {
        let mut children = self.children.lock().await;
        for (role, handle) in children.drain() {
            let mut agent = handle.lock().await;
            if let Err(e) = agent.child.start_kill() {
                warn!(agent.role = %role, error = %e, "failed to kill agent process");
            }
            let _ = agent.child.wait().await;
            info!(agent.role = %role, "agent process stopped");
        }
    }
}

/// Creates one backend per session so each jam owns its processes.
pub trait ProcessBackendFactory: Send + Sync {
    fn create(&self, session_id: &str) -> Arc<dyn AgentBackend>;
}

/// Default factory wired from configuration.
pub struct ConfiguredBackendFactory {
    pub agent: bandconf::AgentConfig,
    pub timing: bandconf::TimingConfig,
    pub tuning: bandconf::TuningConfig,
}

impl ProcessBackendFactory for ConfiguredBackendFactory {
    fn create(&self, _session_id: &str) -> Arc<dyn AgentBackend> {
        Arc::new(ProcessBackend::new(&self.agent, &self.timing, self.tuning))
    }
}
