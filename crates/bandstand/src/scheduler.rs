//! Turn scheduler. One worker task per jam session owns the `Session`
//! outright; everything else talks to it over an mpsc command channel.
//!
//! The channel doubles as the turn queue: commands run strictly in arrival
//! order, one at a time, so a directive can never overtake an in-flight
//! tick and the round counter moves exactly once per settled turn. Auto
//! ticks come from a one-shot timer re-armed only at turn completion, with
//! an atomic pending marker so a slow turn coalesces into at most one
//! queued tick.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::future::join_all;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::agents::{fallback_reaction, AgentBackend, TurnOutcome};
use crate::aggregation::{self, Contribution};
use crate::domain::{self, MusicalContext, KEEP_PATTERN};
use crate::prompts::PromptAssembler;
use crate::sessions::types::{
    AgentStatus, AudioFeedback, DirectiveError, PresetError, RoutingScope, Session,
    SessionSnapshot, TurnKind,
};

const COMMAND_QUEUE_DEPTH: usize = 64;
const SNAPSHOT_QUEUE_DEPTH: usize = 32;

enum Command {
    JamStart,
    Directive {
        text: String,
        target: Option<String>,
        scope: RoutingScope,
        reply: oneshot::Sender<Result<(), DirectiveError>>,
    },
    Tick,
    SetPreset {
        id: String,
        reply: oneshot::Sender<Result<(), PresetError>>,
    },
    AudioFeedback(AudioFeedback),
    SetMuted {
        role: String,
        muted: bool,
        reply: oneshot::Sender<Result<(), DirectiveError>>,
    },
    Snapshot(oneshot::Sender<SessionSnapshot>),
    Stop,
}

/// Handle to one session's worker task. Cheap to clone.
#[derive(Clone)]
pub struct JamScheduler {
    tx: mpsc::Sender<Command>,
    stopped: CancellationToken,
    snapshots: broadcast::Sender<SessionSnapshot>,
    backend: Arc<dyn AgentBackend>,
    session_id: Uuid,
}

impl std::fmt::Debug for JamScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JamScheduler")
            .field("session_id", &self.session_id)
            .field("stopped", &self.stopped.is_cancelled())
            .finish_non_exhaustive()
    }
}

impl JamScheduler {
    /// Spawn the worker for a fresh session. The opening turn is already
    /// queued when this returns.
    pub fn spawn(
        client_id: &str,
        roles: Vec<String>,
        context: MusicalContext,
        backend: Arc<dyn AgentBackend>,
        prompts: Arc<PromptAssembler>,
        timing: &bandconf::TimingConfig,
        tuning: bandconf::TuningConfig,
    ) -> Self {
        let (tx, rx) = mpsc::channel(COMMAND_QUEUE_DEPTH);
        let (snapshots, _) = broadcast::channel(SNAPSHOT_QUEUE_DEPTH);
        let stopped = CancellationToken::new();
        let session = Session::new(client_id, roles, context);
        let session_id = session.id;

        // queue the opening turn before the worker can see anything else
        tx.try_send(Command::JamStart)
            .expect("fresh command queue cannot be full");

        let worker = Worker {
            session,
            backend: backend.clone(),
            prompts,
            tuning,
            auto_tick: Duration::from_secs(timing.auto_tick_secs),
            tick_pending: Arc::new(AtomicBool::new(false)),
            timer: None,
            tx: tx.clone(),
            rx,
            snapshots: snapshots.clone(),
            stopped: stopped.clone(),
        };
        tokio::spawn(worker.run());

        Self {
            tx,
            stopped,
            snapshots,
            backend,
            session_id,
        }
    }

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionSnapshot> {
        self.snapshots.subscribe()
    }

    /// Queue a directive turn and wait for it to settle. `Ok` means the
    /// turn completed and its round was assigned; a routing rejection
    /// resolves immediately and consumes no round.
    pub async fn directive(
        &self,
        text: &str,
        target: Option<&str>,
        scope: RoutingScope,
    ) -> Result<(), DirectiveError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Directive {
            text: text.to_string(),
            target: target.map(str::to_string),
            scope,
            reply,
        })
        .await?;
        rx.await.map_err(|_| DirectiveError::SessionStopped)?
    }

    /// Swap the musical seed. Only valid before the first directive.
    pub async fn set_preset(&self, id: &str) -> Result<(), PresetError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::SetPreset {
            id: id.to_string(),
            reply,
        })
        .await
        .map_err(|_| PresetError::SessionStopped)?;
        rx.await.map_err(|_| PresetError::SessionStopped)?
    }

    /// Fold observed audio state into future prompts. Fire and forget.
    pub async fn audio_feedback(&self, feedback: AudioFeedback) {
        let _ = self.send(Command::AudioFeedback(feedback)).await;
    }

    /// Exclude (or re-include) an agent from auto ticks. Directives still
    /// reach muted agents.
    pub async fn set_muted(&self, role: &str, muted: bool) -> Result<(), DirectiveError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::SetMuted {
            role: role.to_string(),
            muted,
            reply,
        })
        .await?;
        rx.await.map_err(|_| DirectiveError::SessionStopped)?
    }

    /// Current state, as of when the worker dequeues the request.
    pub async fn snapshot(&self) -> Result<SessionSnapshot, DirectiveError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Snapshot(reply)).await?;
        rx.await.map_err(|_| DirectiveError::SessionStopped)
    }

    /// Stop the session. Kills agent processes first so an in-flight turn
    /// settles promptly; that turn's results are discarded.
    pub async fn stop(&self) {
        self.stopped.cancel();
        self.backend.shutdown().await;
        let _ = self.tx.send(Command::Stop).await;
    }

    async fn send(&self, command: Command) -> Result<(), DirectiveError> {
        if self.stopped.is_cancelled() {
            return Err(DirectiveError::SessionStopped);
        }
        self.tx
            .send(command)
            .await
            .map_err(|_| DirectiveError::SessionStopped)
    }
}

struct Worker {
    session: Session,
    backend: Arc<dyn AgentBackend>,
    prompts: Arc<PromptAssembler>,
    tuning: bandconf::TuningConfig,
    auto_tick: Duration,
    tick_pending: Arc<AtomicBool>,
    timer: Option<JoinHandle<()>>,
    tx: mpsc::Sender<Command>,
    rx: mpsc::Receiver<Command>,
    snapshots: broadcast::Sender<SessionSnapshot>,
    stopped: CancellationToken,
}

impl Worker {
    async fn run(mut self) {
        info!(
            session.id = %self.session.id,
            client = %self.session.client_id,
            agents = ?self.session.selected,
            "jam session starting"
        );

        while let Some(command) = self.rx.recv().await {
            if self.stopped.is_cancelled() {
                self.reject_stopped(command);
                self.drain_queue();
                break;
            }
            match command {
                Command::JamStart => {
                    let participants = self.session.selected.clone();
                    self.run_turn(TurnKind::JamStart, None, participants).await;
                    self.arm_timer();
                }
                Command::Directive {
                    text,
                    target,
                    scope,
                    reply,
                } => {
                    match self.resolve_directive(target, scope) {
                        Ok(participants) => {
                            for role in &participants {
                                self.session.activated.insert(role.clone());
                            }
                            self.run_turn(TurnKind::Directive, Some(&text), participants)
                                .await;
                            // resolves at completion; a turn discarded by a
                            // stop never completed
                            let result = if self.stopped.is_cancelled() {
                                Err(DirectiveError::SessionStopped)
                            } else {
                                self.arm_timer();
                                Ok(())
                            };
                            let _ = reply.send(result);
                        }
                        Err(e) => {
                            let _ = reply.send(Err(e));
                        }
                    }
                }
                Command::Tick => {
                    self.tick_pending.store(false, Ordering::SeqCst);
                    let participants = self.tick_participants().await;
                    if participants.is_empty() {
                        debug!(session.id = %self.session.id, "tick with no playable agents, skipping");
                    } else {
                        self.run_turn(TurnKind::AutoTick, None, participants).await;
                    }
                    self.arm_timer();
                }
                Command::SetPreset { id, reply } => {
                    let _ = reply.send(self.apply_preset(&id));
                }
                Command::AudioFeedback(feedback) => {
                    self.session.audio_feedback = Some(feedback);
                }
                Command::SetMuted { role, muted, reply } => {
                    let result = if self.session.agents.contains_key(&role) {
                        if muted {
                            self.session.muted.insert(role);
                        } else {
                            self.session.muted.remove(&role);
                        }
                        Ok(())
                    } else {
                        Err(DirectiveError::NotInSession { role })
                    };
                    let _ = reply.send(result);
                }
                Command::Snapshot(reply) => {
                    let _ = reply.send(self.session.snapshot());
                }
                Command::Stop => {
                    self.drain_queue();
                    break;
                }
            }
        }

        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
        self.session.stopped = true;
        self.broadcast();
        info!(session.id = %self.session.id, round = self.session.round, "jam session stopped");
    }

    /// Answer everything still queued with a stopped error.
    fn drain_queue(&mut self) {
        while let Ok(command) = self.rx.try_recv() {
            self.reject_stopped(command);
        }
    }

    fn reject_stopped(&self, command: Command) {
        match command {
            Command::Directive { reply, .. } => {
                let _ = reply.send(Err(DirectiveError::SessionStopped));
            }
            Command::SetPreset { reply, .. } => {
                let _ = reply.send(Err(PresetError::SessionStopped));
            }
            Command::SetMuted { reply, .. } => {
                let _ = reply.send(Err(DirectiveError::SessionStopped));
            }
            Command::Snapshot(reply) => {
                let _ = reply.send(self.session.snapshot());
            }
            Command::JamStart | Command::Tick | Command::AudioFeedback(_) | Command::Stop => {}
        }
    }

    /// Work out who a directive reaches, before anything runs. A rejection
    /// here consumes no turn.
    fn resolve_directive(
        &self,
        target: Option<String>,
        scope: RoutingScope,
    ) -> Result<Vec<String>, DirectiveError> {
        // automated sources may not address anyone, even by name, until a
        // human directive has brought at least one agent in
        if scope == RoutingScope::ActivationRequired && self.session.activated.is_empty() {
            return Err(DirectiveError::NoActiveAgents);
        }

        if let Some(role) = target {
            let Some(agent) = self.session.agents.get(&role) else {
                return Err(DirectiveError::NotInSession { role });
            };
            // a crashed agent stays out for the rest of the session
            if agent.status == AgentStatus::Error || !self.prompts.persona_exists(&role) {
                return Err(DirectiveError::ProcessUnavailable { role });
            }
            return Ok(vec![role]);
        }

        // untargeted directives reach the agents already brought in
        let activated: Vec<String> = self
            .session
            .selected
            .iter()
            .filter(|role| self.session.activated.contains(*role))
            .cloned()
            .collect();
        if activated.is_empty() {
            return Err(DirectiveError::NoActiveAgents);
        }
        Ok(activated)
    }

    /// Auto ticks reach only agents that can actually answer: a live
    /// process, not crashed, not muted.
    async fn tick_participants(&self) -> Vec<String> {
        let mut participants = Vec::new();
        for role in &self.session.selected {
            if self.session.muted.contains(role) {
                continue;
            }
            if self.session.agents[role].status == AgentStatus::Error {
                continue;
            }
            if self.backend.alive(role).await {
                participants.push(role.clone());
            }
        }
        participants
    }

    fn apply_preset(&mut self, id: &str) -> Result<(), PresetError> {
        if !self.session.activated.is_empty() {
            return Err(PresetError::AlreadyActivated);
        }
        let preset = domain::preset(id).ok_or_else(|| PresetError::Unknown {
            id: id.to_string(),
            known: domain::preset_ids().join(", "),
        })?;
        self.session.context = MusicalContext::from_preset(preset);
        info!(session.id = %self.session.id, preset = id, "context re-seeded");
        self.broadcast();
        Ok(())
    }

    /// Run one turn end to end: fan out to every participant concurrently,
    /// fan in, fold the surviving decisions into the context, advance the
    /// round, publish a snapshot. A stop during the fan-out discards the
    /// whole turn.
    async fn run_turn(&mut self, kind: TurnKind, directive: Option<&str>, participants: Vec<String>) {
        let mut runnable = Vec::new();
        for role in participants {
            match self.prompts.assemble(&role) {
                Ok(system) => {
                    let agent = self.session.agents.get_mut(&role).expect("participant exists");
                    agent.status = AgentStatus::Thinking;
                    agent.last_updated = Utc::now();
                    runnable.push((role, system));
                }
                Err(e) => {
                    warn!(agent.role = %role, error = %e, "agent sitting out this turn");
                    self.settle_unusable(&role);
                }
            }
        }
        self.broadcast();

        let turns = runnable.iter().map(|(role, system)| {
            let backend = self.backend.clone();
            let prompt = self.turn_prompt(kind, directive, role);
            async move {
                let outcome = backend.run_turn(role, system, &prompt).await;
                (role.clone(), outcome)
            }
        });
        let outcomes = join_all(turns).await;

        if self.stopped.is_cancelled() {
            debug!(session.id = %self.session.id, "turn discarded, session stopping");
            return;
        }

        let mut contributions = Vec::new();
        for (role, outcome) in outcomes {
            let agent = self.session.agents.get_mut(&role).expect("participant exists");
            agent.last_updated = Utc::now();
            match outcome {
                TurnOutcome::Reply { reply, thread_id } => {
                    if reply.pattern != KEEP_PATTERN {
                        agent.pattern = reply.pattern;
                    }
                    agent.thoughts = reply.thoughts;
                    agent.reaction = reply.reaction;
                    agent.status = AgentStatus::Playing;
                    if thread_id.is_some() {
                        agent.thread_id = thread_id;
                    }
                    if let Some(decision) = reply.decision {
                        contributions.push(Contribution {
                            agent: role,
                            decision,
                        });
                    }
                }
                TurnOutcome::Invalid { reason } => {
                    debug!(agent.role = %role, reason = %reason, "reply failed validation");
                    agent.status = AgentStatus::Timeout;
                    agent.reaction = fallback_reaction(&role);
                    if agent.pattern.is_empty() {
                        agent.pattern = agent.fallback_pattern.clone();
                    }
                }
                TurnOutcome::TimedOut => {
                    agent.status = AgentStatus::Timeout;
                    agent.reaction = fallback_reaction(&role);
                    if agent.pattern.is_empty() {
                        agent.pattern = agent.fallback_pattern.clone();
                    }
                }
                TurnOutcome::Crashed { reason } => {
                    warn!(agent.role = %role, reason = %reason, "agent crashed");
                    agent.status = AgentStatus::Error;
                    agent.reaction = fallback_reaction(&role);
                    if agent.pattern.is_empty() {
                        agent.pattern = agent.fallback_pattern.clone();
                    }
                }
            }
        }

        aggregation::apply_turn(
            kind,
            directive,
            &contributions,
            &mut self.session.context,
            &self.tuning,
        );
        self.session.round += 1;
        info!(
            session.id = %self.session.id,
            round = self.session.round,
            kind = ?kind,
            contributions = contributions.len(),
            bpm = self.session.context.bpm,
            "turn settled"
        );
        self.broadcast();
    }

    /// Mark an agent that cannot take this turn as settled, with the
    /// fallback reaction showing.
    fn settle_unusable(&mut self, role: &str) {
        if let Some(agent) = self.session.agents.get_mut(role) {
            agent.status = AgentStatus::Timeout;
            agent.reaction = fallback_reaction(role);
            if agent.pattern.is_empty() {
                agent.pattern = agent.fallback_pattern.clone();
            }
            agent.last_updated = Utc::now();
        }
    }

    /// Per-agent turn prompt: shared context, what the rest of the band is
    /// playing, observed audio state, then the ask.
    fn turn_prompt(&self, kind: TurnKind, directive: Option<&str>, role: &str) -> String {
        let mut prompt = format!(
            "Round {}. Context: {}\n",
            self.session.round + 1,
            self.session.context.describe()
        );

        let peers: Vec<String> = self
            .session
            .selected
            .iter()
            .filter(|peer| peer.as_str() != role)
            .filter_map(|peer| {
                let state = self.session.agents.get(peer)?;
                (!state.pattern.is_empty())
                    .then(|| format!("  {}: {}", peer, state.pattern))
            })
            .collect();
        if !peers.is_empty() {
            prompt.push_str("The band is playing:\n");
            prompt.push_str(&peers.join("\n"));
            prompt.push('\n');
        }

        if let Some(feedback) = &self.session.audio_feedback {
            if let Some(bpm) = feedback.measured_bpm {
                prompt.push_str(&format!("Measured output tempo: {bpm:.1} BPM\n"));
            }
            if let Some(notes) = &feedback.notes {
                prompt.push_str(&format!("Engineer's note: {notes}\n"));
            }
        }

        match kind {
            TurnKind::JamStart => {
                prompt.push_str("The jam is starting. Lay down your opening pattern.");
            }
            TurnKind::AutoTick => {
                prompt.push_str(
                    "Periodic check-in. Evolve your part if the music calls for it, \
                     or answer KEEP_CURRENT as your pattern to hold steady.",
                );
            }
            TurnKind::Directive => {
                prompt.push_str("The bandleader says: ");
                prompt.push_str(directive.unwrap_or(""));
            }
        }
        prompt
    }

    fn broadcast(&self) {
        let _ = self.snapshots.send(self.session.snapshot());
    }

    /// Re-arm the one-shot tick timer. The pending marker guarantees at
    /// most one tick sits in the queue no matter how slow a turn runs.
    fn arm_timer(&mut self) {
        if self.auto_tick.is_zero() {
            return;
        }
        if let Some(old) = self.timer.take() {
            old.abort();
        }
        let delay = self.auto_tick;
        let tx = self.tx.clone();
        let tick_pending = self.tick_pending.clone();
        let stopped = self.stopped.clone();
        self.timer = Some(tokio::spawn(async move {
            tokio::select! {
                _ = stopped.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }
            if !tick_pending.swap(true, Ordering::SeqCst) {
                let _ = tx.send(Command::Tick).await;
            }
        }));
    }
}
