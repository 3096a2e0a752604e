//! Integration tests for the turn scheduler and jam registry.
//!
//! Agent subprocesses are replaced by a scripted backend so turns settle
//! deterministically and the tests exercise ordering, lifecycle, and
//! aggregation end to end.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;
use tokio::sync::{Mutex, Notify};

use bandstand::agents::{AgentBackend, AgentReply, ProcessBackendFactory, TurnOutcome};
use bandstand::domain::{Confidence, Decision};
use bandstand::prompts::PromptAssembler;
use bandstand::scheduler::JamScheduler;
use bandstand::sessions::{
    AgentStatus, DirectiveError, JamError, JamRegistry, PresetError, RoutingScope, SessionSnapshot,
};

/// Scripted stand-in for agent subprocesses. Outcomes are dequeued per
/// role; once a script runs dry the agent answers with a plain reply.
#[derive(Default)]
struct ScriptedBackend {
    scripts: Mutex<HashMap<String, VecDeque<TurnOutcome>>>,
    calls: Mutex<Vec<(String, String)>>,
    dead: Mutex<HashSet<String>>,
    /// When set, every turn blocks here until `release` is notified.
    gate: Option<Arc<Notify>>,
}

impl ScriptedBackend {
    fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn gated() -> (Arc<Self>, Arc<Notify>) {
        let gate = Arc::new(Notify::new());
        let backend = Arc::new(Self {
            gate: Some(gate.clone()),
            ..Self::default()
        });
        (backend, gate)
    }

    async fn script(&self, role: &str, outcome: TurnOutcome) {
        self.scripts
            .lock()
            .await
            .entry(role.to_string())
            .or_default()
            .push_back(outcome);
    }

    async fn calls_for(&self, role: &str) -> Vec<String> {
        self.calls
            .lock()
            .await
            .iter()
            .filter(|(r, _)| r == role)
            .map(|(_, prompt)| prompt.clone())
            .collect()
    }
}

#[async_trait]
impl AgentBackend for ScriptedBackend {
    async fn run_turn(&self, role: &str, _system_prompt: &str, prompt: &str) -> TurnOutcome {
        self.calls
            .lock()
            .await
            .push((role.to_string(), prompt.to_string()));

        if let Some(gate) = &self.gate {
            gate.notified().await;
        }

        let scripted = self
            .scripts
            .lock()
            .await
            .get_mut(role)
            .and_then(|queue| queue.pop_front());
        match scripted {
            Some(outcome) => {
                if matches!(outcome, TurnOutcome::Crashed { .. }) {
                    self.dead.lock().await.insert(role.to_string());
                } else {
                    self.dead.lock().await.remove(role);
                }
                outcome
            }
            None => reply(&format!("{role}-groove"), None),
        }
    }

    async fn alive(&self, role: &str) -> bool {
        !self.dead.lock().await.contains(role)
    }

    async fn shutdown(&self) {
        let mut dead = self.dead.lock().await;
        for (role, _) in self.calls.lock().await.iter() {
            dead.insert(role.clone());
        }
        if let Some(gate) = &self.gate {
            gate.notify_waiters();
        }
    }
}

fn reply(pattern: &str, decision: Option<Decision>) -> TurnOutcome {
    TurnOutcome::Reply {
        reply: AgentReply {
            pattern: pattern.to_string(),
            thoughts: "thinking out loud".to_string(),
            reaction: "nodding along".to_string(),
            decision,
        },
        thread_id: Some(format!("thread-{pattern}")),
    }
}

fn tempo_decision(delta: f64, confidence: Confidence) -> Decision {
    Decision {
        tempo_delta_pct: Some(delta),
        confidence,
        ..Decision::default()
    }
}

/// Persona, policy, and reference files on disk for the given roles.
fn stage(roles: &[&str]) -> (TempDir, Arc<PromptAssembler>) {
    let dir = TempDir::new().unwrap();
    let personas = dir.path().join("personas");
    std::fs::create_dir(&personas).unwrap();
    for role in roles {
        std::fs::write(
            personas.join(format!("{role}.md")),
            format!("You are the {role} player."),
        )
        .unwrap();
    }
    let policy = dir.path().join("policy.md");
    std::fs::write(
        &policy,
        "# Band Policy\n\n## Ground Rules\nListen first.\n\n## Response Format\nJSON only.\n",
    )
    .unwrap();
    let reference = dir.path().join("reference.md");
    std::fs::write(&reference, "# Pattern Language\nnotes go here\n").unwrap();

    let paths = bandconf::PathsConfig {
        personas_dir: personas,
        policy_path: policy,
        reference_path: reference,
    };
    let assembler = Arc::new(PromptAssembler::new(&paths));
    (dir, assembler)
}

fn timing(auto_tick_secs: u64) -> bandconf::TimingConfig {
    bandconf::TimingConfig {
        auto_tick_secs,
        agent_timeout_secs: 5,
    }
}

fn spawn_jam(
    roles: &[&str],
    backend: Arc<dyn AgentBackend>,
    prompts: Arc<PromptAssembler>,
    auto_tick_secs: u64,
) -> JamScheduler {
    JamScheduler::spawn(
        "test-client",
        roles.iter().map(|r| r.to_string()).collect(),
        bandstand::domain::MusicalContext::default(),
        backend,
        prompts,
        &timing(auto_tick_secs),
        bandconf::TuningConfig::default(),
    )
}

/// Wait on the snapshot stream until a round is reached, checking that the
/// round counter never goes backwards along the way.
async fn await_round(
    rx: &mut tokio::sync::broadcast::Receiver<SessionSnapshot>,
    round: u64,
) -> SessionSnapshot {
    let mut last = 0;
    loop {
        let snapshot = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("snapshot stream stalled")
            .expect("snapshot stream closed");
        assert!(snapshot.round >= last, "round went backwards");
        last = snapshot.round;
        if snapshot.round >= round {
            return snapshot;
        }
    }
}

#[tokio::test]
async fn jam_start_settles_one_round() {
    let (_stage, prompts) = stage(&["drums", "bass"]);
    let backend = ScriptedBackend::new();
    backend.script("drums", reply("four on the floor", None)).await;

    let jam = spawn_jam(&["drums", "bass"], backend.clone(), prompts, 0);
    let mut rx = jam.subscribe();

    let snapshot = await_round(&mut rx, 1).await;
    assert_eq!(snapshot.round, 1);
    let drums = &snapshot.agents[0];
    assert_eq!(drums.role, "drums");
    assert_eq!(drums.status, AgentStatus::Playing);
    assert_eq!(drums.pattern, "four on the floor");
    assert!(drums.thread_id.is_some());
    assert!(snapshot.activated.is_empty(), "jam start must not activate");

    jam.stop().await;
}

#[tokio::test]
async fn directives_settle_in_arrival_order() {
    let (_stage, prompts) = stage(&["drums"]);
    let backend = ScriptedBackend::new();
    let jam = spawn_jam(&["drums"], backend.clone(), prompts, 0);
    let mut rx = jam.subscribe();
    await_round(&mut rx, 1).await;

    jam.directive("first things first", Some("drums"), RoutingScope::Broadcast)
        .await
        .unwrap();
    jam.directive("then the second", Some("drums"), RoutingScope::Broadcast)
        .await
        .unwrap();
    await_round(&mut rx, 3).await;

    let prompts_seen = backend.calls_for("drums").await;
    assert_eq!(prompts_seen.len(), 3);
    assert!(prompts_seen[1].contains("first things first"));
    assert!(prompts_seen[2].contains("then the second"));

    jam.stop().await;
}

#[tokio::test]
async fn concurrent_directives_serialize_into_distinct_rounds() {
    let (_stage, prompts) = stage(&["drums"]);
    let backend = ScriptedBackend::new();
    let jam = spawn_jam(&["drums"], backend.clone(), prompts, 0);
    let mut rx = jam.subscribe();
    await_round(&mut rx, 1).await;

    // both in flight at once; the command queue serializes them
    let (first, second) = tokio::join!(
        jam.directive("push the tempo", Some("drums"), RoutingScope::Broadcast),
        jam.directive("now pull it back", Some("drums"), RoutingScope::Broadcast),
    );
    first.unwrap();
    second.unwrap();

    let snapshot = await_round(&mut rx, 3).await;
    assert_eq!(snapshot.round, 3, "two directives, two rounds");

    let prompts_seen = backend.calls_for("drums").await;
    assert_eq!(prompts_seen.len(), 3);
    assert!(prompts_seen[1].contains("push the tempo"));
    assert!(prompts_seen[2].contains("now pull it back"));

    jam.stop().await;
}

#[tokio::test]
async fn round_advances_even_when_every_reply_is_unusable() {
    let (_stage, prompts) = stage(&["drums", "bass"]);
    let backend = ScriptedBackend::new();
    backend
        .script(
            "drums",
            TurnOutcome::Invalid {
                reason: "missing pattern".into(),
            },
        )
        .await;
    backend.script("bass", TurnOutcome::TimedOut).await;

    let jam = spawn_jam(&["drums", "bass"], backend, prompts, 0);
    let mut rx = jam.subscribe();
    let snapshot = await_round(&mut rx, 1).await;

    assert_eq!(snapshot.round, 1);
    for agent in &snapshot.agents {
        assert_eq!(agent.status, AgentStatus::Timeout);
        assert!(agent.reaction.contains("missed the cue"));
        assert_eq!(agent.pattern, agent.fallback_pattern);
    }
    assert_eq!(snapshot.context.bpm, 120, "no decisions, no drift");

    jam.stop().await;
}

#[tokio::test]
async fn directive_decisions_move_the_tempo() {
    let (_stage, prompts) = stage(&["drums", "bass"]);
    let backend = ScriptedBackend::new();
    let jam = spawn_jam(&["drums", "bass"], backend.clone(), prompts, 0);
    let mut rx = jam.subscribe();
    await_round(&mut rx, 1).await;

    // bring both agents in so the untargeted directive has an audience
    jam.directive("drums, you're in", Some("drums"), RoutingScope::Broadcast)
        .await
        .unwrap();
    jam.directive("bass, you're in", Some("bass"), RoutingScope::Broadcast)
        .await
        .unwrap();

    backend
        .script(
            "drums",
            reply("uptempo break", Some(tempo_decision(20.0, Confidence::High))),
        )
        .await;
    backend
        .script(
            "bass",
            reply("driving eighths", Some(tempo_decision(20.0, Confidence::High))),
        )
        .await;
    jam.directive("take us up", None, RoutingScope::Broadcast)
        .await
        .unwrap();

    let snapshot = await_round(&mut rx, 4).await;
    assert_eq!(snapshot.context.bpm, 144);

    jam.stop().await;
}

#[tokio::test(start_paused = true)]
async fn auto_tick_dampens_the_same_decisions() {
    let (_stage, prompts) = stage(&["drums", "bass"]);
    let backend = ScriptedBackend::new();
    let jam = spawn_jam(&["drums", "bass"], backend.clone(), prompts, 1);
    let mut rx = jam.subscribe();
    await_round(&mut rx, 1).await;

    backend
        .script(
            "drums",
            reply("pushing", Some(tempo_decision(20.0, Confidence::High))),
        )
        .await;
    backend
        .script(
            "bass",
            reply("pushing too", Some(tempo_decision(20.0, Confidence::High))),
        )
        .await;

    // paused clock: the armed one-shot timer fires as soon as we yield
    let snapshot = await_round(&mut rx, 2).await;
    assert_eq!(snapshot.context.bpm, 132, "tick deltas are dampened");

    jam.stop().await;
}

#[tokio::test]
async fn keep_sentinel_preserves_the_pattern() {
    let (_stage, prompts) = stage(&["drums"]);
    let backend = ScriptedBackend::new();
    backend.script("drums", reply("the original groove", None)).await;
    backend.script("drums", reply("KEEP_CURRENT", None)).await;

    let jam = spawn_jam(&["drums"], backend, prompts, 0);
    let mut rx = jam.subscribe();
    await_round(&mut rx, 1).await;

    jam.directive("keep doing that", Some("drums"), RoutingScope::Broadcast)
        .await
        .unwrap();
    let snapshot = await_round(&mut rx, 2).await;
    assert_eq!(snapshot.agents[0].pattern, "the original groove");
    assert_eq!(snapshot.agents[0].status, AgentStatus::Playing);

    jam.stop().await;
}

#[tokio::test(start_paused = true)]
async fn crashed_agent_is_out_for_the_rest_of_the_session() {
    let (_stage, prompts) = stage(&["drums", "bass"]);
    let backend = ScriptedBackend::new();
    backend
        .script(
            "drums",
            TurnOutcome::Crashed {
                reason: "exited".into(),
            },
        )
        .await;

    let jam = spawn_jam(&["drums", "bass"], backend.clone(), prompts, 1);
    let mut rx = jam.subscribe();
    let snapshot = await_round(&mut rx, 1).await;
    assert_eq!(snapshot.agents[0].status, AgentStatus::Error);

    // tick runs with bass only
    let snapshot = await_round(&mut rx, 2).await;
    assert_eq!(snapshot.agents[0].status, AgentStatus::Error);
    assert_eq!(backend.calls_for("drums").await.len(), 1);
    assert_eq!(backend.calls_for("bass").await.len(), 2);

    // the crash is sticky; even a targeted directive is refused
    let err = jam
        .directive("wake up", Some("drums"), RoutingScope::Broadcast)
        .await
        .unwrap_err();
    assert_eq!(
        err,
        DirectiveError::ProcessUnavailable {
            role: "drums".into()
        }
    );

    jam.stop().await;
}

#[tokio::test]
async fn missing_persona_does_not_block_the_session() {
    let (_stage, prompts) = stage(&["bass"]); // no persona for drums
    let backend = ScriptedBackend::new();
    let jam = spawn_jam(&["drums", "bass"], backend.clone(), prompts, 0);
    let mut rx = jam.subscribe();

    let snapshot = await_round(&mut rx, 1).await;
    let drums = &snapshot.agents[0];
    assert_eq!(drums.status, AgentStatus::Timeout);
    assert!(drums.reaction.contains("missed the cue"));
    assert_eq!(drums.pattern, drums.fallback_pattern, "plays the fallback");
    assert_eq!(snapshot.agents[1].status, AgentStatus::Playing);
    assert!(backend.calls_for("drums").await.is_empty());

    // targeting the persona-less agent is refused up front
    let err = jam
        .directive("solo time", Some("drums"), RoutingScope::Broadcast)
        .await
        .unwrap_err();
    assert_eq!(
        err,
        DirectiveError::ProcessUnavailable {
            role: "drums".into()
        }
    );

    jam.stop().await;
}

#[tokio::test]
async fn directive_routing_errors() {
    let (_stage, prompts) = stage(&["drums", "bass"]);
    let backend = ScriptedBackend::new();
    let jam = spawn_jam(&["drums", "bass"], backend.clone(), prompts, 0);
    let mut rx = jam.subscribe();
    await_round(&mut rx, 1).await;

    let err = jam
        .directive("hi", Some("ghost"), RoutingScope::Broadcast)
        .await
        .unwrap_err();
    assert_eq!(err, DirectiveError::NotInSession { role: "ghost".into() });

    // nobody is activated yet, so an untargeted directive has no audience
    let err = jam
        .directive("everybody now", None, RoutingScope::Broadcast)
        .await
        .unwrap_err();
    assert_eq!(err, DirectiveError::NoActiveAgents);

    // the automated-source policy refuses even a targeted directive
    let err = jam
        .directive("hi", Some("bass"), RoutingScope::ActivationRequired)
        .await
        .unwrap_err();
    assert_eq!(err, DirectiveError::NoActiveAgents);

    // a targeted directive activates its target, and only its target
    jam.directive("you first", Some("bass"), RoutingScope::Broadcast)
        .await
        .unwrap();
    await_round(&mut rx, 2).await;
    jam.directive("now the activated set", None, RoutingScope::Broadcast)
        .await
        .unwrap();
    await_round(&mut rx, 3).await;

    let bass_prompts = backend.calls_for("bass").await;
    assert!(bass_prompts.iter().any(|p| p.contains("now the activated set")));
    let drums_prompts = backend.calls_for("drums").await;
    assert!(!drums_prompts.iter().any(|p| p.contains("now the activated set")));

    jam.stop().await;
}

#[tokio::test(start_paused = true)]
async fn muted_agents_skip_ticks_but_hear_directives() {
    let (_stage, prompts) = stage(&["drums", "bass"]);
    let backend = ScriptedBackend::new();
    let jam = spawn_jam(&["drums", "bass"], backend.clone(), prompts, 1);
    let mut rx = jam.subscribe();
    await_round(&mut rx, 1).await;

    jam.set_muted("drums", true).await.unwrap();
    await_round(&mut rx, 2).await; // tick: bass only
    assert_eq!(backend.calls_for("drums").await.len(), 1);
    assert_eq!(backend.calls_for("bass").await.len(), 2);

    // muted agents still hear directives
    jam.directive("drums, stay ready", Some("drums"), RoutingScope::Broadcast)
        .await
        .unwrap();
    assert_eq!(backend.calls_for("drums").await.len(), 2);

    // and an untargeted directive includes the muted agent once activated
    jam.directive("all together", None, RoutingScope::Broadcast)
        .await
        .unwrap();
    assert_eq!(backend.calls_for("drums").await.len(), 3);

    let err = jam.set_muted("ghost", true).await.unwrap_err();
    assert_eq!(err, DirectiveError::NotInSession { role: "ghost".into() });

    jam.stop().await;
}

#[tokio::test]
async fn preset_only_reseeds_a_fresh_session() {
    let (_stage, prompts) = stage(&["drums"]);
    let backend = ScriptedBackend::new();
    let jam = spawn_jam(&["drums"], backend, prompts, 0);
    let mut rx = jam.subscribe();
    await_round(&mut rx, 1).await;

    // the opening turn does not activate anyone, so this still works
    jam.set_preset("jazz").await.unwrap();
    let snapshot = jam.snapshot().await.unwrap();
    assert_eq!(snapshot.context.bpm, 96);
    assert_eq!(snapshot.context.key, "Eb major");

    let err = jam.set_preset("polka").await.unwrap_err();
    assert!(matches!(err, PresetError::Unknown { .. }));

    jam.directive("here we go", Some("drums"), RoutingScope::Broadcast)
        .await
        .unwrap();
    await_round(&mut rx, 2).await;
    let err = jam.set_preset("house").await.unwrap_err();
    assert_eq!(err, PresetError::AlreadyActivated);

    jam.stop().await;
}

#[tokio::test]
async fn stop_mid_turn_discards_the_turn() {
    let (_stage, prompts) = stage(&["drums"]);
    let (backend, _gate) = ScriptedBackend::gated();
    let jam = spawn_jam(&["drums"], backend.clone(), prompts, 0);
    let mut rx = jam.subscribe();

    // wait until the opening turn is in flight
    while backend.calls_for("drums").await.is_empty() {
        tokio::task::yield_now().await;
    }

    // stop releases the gate via backend shutdown
    jam.stop().await;

    assert_eq!(
        jam.directive("anyone there", None, RoutingScope::Broadcast)
            .await,
        Err(DirectiveError::SessionStopped)
    );

    // nothing settles: every snapshot up to the terminal one is round zero
    let mut saw_terminal = false;
    loop {
        match tokio::time::timeout(Duration::from_millis(500), rx.recv()).await {
            Ok(Ok(snapshot)) => {
                assert_eq!(snapshot.round, 0);
                saw_terminal = snapshot.stopped;
            }
            _ => break,
        }
    }
    assert!(saw_terminal, "worker publishes a final stopped snapshot");
}

struct ScriptedFactory;

impl ProcessBackendFactory for ScriptedFactory {
    fn create(&self, _session_id: &str) -> Arc<dyn AgentBackend> {
        ScriptedBackend::new()
    }
}

fn registry_config(stage_dir: &TempDir, roles: &[&str]) -> bandconf::BandConfig {
    let mut config = bandconf::BandConfig::default();
    let personas = stage_dir.path().join("personas");
    std::fs::create_dir_all(&personas).unwrap();
    for role in roles {
        std::fs::write(personas.join(format!("{role}.md")), "persona").unwrap();
    }
    let policy = stage_dir.path().join("policy.md");
    std::fs::write(&policy, "## Ground Rules\nok\n## Response Format\njson\n").unwrap();
    let reference = stage_dir.path().join("reference.md");
    std::fs::write(&reference, "patterns").unwrap();
    config.paths = bandconf::PathsConfig {
        personas_dir: personas,
        policy_path: policy,
        reference_path: reference,
    };
    config.timing.auto_tick_secs = 0;
    config.limits = bandconf::LimitsConfig {
        max_concurrent_jams: 1,
        max_total_agent_processes: 4,
    };
    config
}

#[tokio::test]
async fn registry_enforces_capacity_and_replacement() {
    let dir = TempDir::new().unwrap();
    let config = registry_config(&dir, &["drums", "bass", "keys", "lead"]);
    let registry = JamRegistry::new(&config, Arc::new(ScriptedFactory));

    registry
        .start_jam("alice", vec!["drums".into(), "bass".into()], None)
        .await
        .unwrap();
    let stats = registry.stats();
    assert_eq!(stats.active_jams, 1);
    assert_eq!(stats.active_agent_processes, 2);

    // second client bounces off the jam ceiling
    let err = registry
        .start_jam("bob", vec!["keys".into()], None)
        .await
        .unwrap_err();
    match err {
        JamError::Refused { decision } => {
            assert!(!decision.allowed);
            assert_eq!(decision.projected_jams, 2);
        }
        other => panic!("unexpected: {other}"),
    }

    // the same client replacing its own session does not double count
    registry
        .start_jam(
            "alice",
            vec!["drums".into(), "bass".into(), "keys".into(), "lead".into()],
            None,
        )
        .await
        .unwrap();
    let stats = registry.stats();
    assert_eq!(stats.active_jams, 1);
    assert_eq!(stats.active_agent_processes, 4);

    // but the agent ceiling still binds
    let err = registry
        .start_jam(
            "alice",
            vec![
                "drums".into(),
                "bass".into(),
                "keys".into(),
                "lead".into(),
                "pads".into(),
            ],
            None,
        )
        .await
        .unwrap_err();
    assert!(matches!(err, JamError::Refused { .. }));

    registry.stop_all().await;
    assert_eq!(registry.stats().active_jams, 0);
}

#[tokio::test]
async fn registry_rejects_bad_requests_before_allocating() {
    let dir = TempDir::new().unwrap();
    let config = registry_config(&dir, &["drums"]);
    let registry = JamRegistry::new(&config, Arc::new(ScriptedFactory));

    assert!(matches!(
        registry.start_jam("alice", vec![], None).await,
        Err(JamError::NoAgents)
    ));
    assert!(matches!(
        registry
            .start_jam("alice", vec!["drums".into()], Some("polka"))
            .await,
        Err(JamError::UnknownPreset { .. })
    ));
    assert_eq!(registry.stats().active_jams, 0);
}
