//! Musical context aggregation: merging one turn's settled agent decisions
//! into tempo, energy, key, and chord changes.
//!
//! The boss's explicit words always beat model opinion. Tempo resolution
//! short-circuits: an explicit BPM anchor wins outright, then a half/double
//! time cue, and only then does the confidence-weighted average of agent
//! deltas get a say. The engine never invents a magnitude from directive
//! wording - "slower" with no usable agent delta changes nothing.

use once_cell::sync::Lazy;
use regex::Regex;
use tracing::{debug, info};

use crate::domain::{Decision, MusicalContext};
use crate::sessions::types::TurnKind;

/// One participating agent's surviving decision.
#[derive(Debug, Clone)]
pub struct Contribution {
    pub agent: String,
    pub decision: Decision,
}

/// Explicit tempo instruction found in directive text.
#[derive(Debug, Clone, Copy, PartialEq)]
enum TempoCue {
    Explicit(u32),
    HalfTime,
    DoubleTime,
}

static BPM_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(?:bpm\s*:?\s*(\d{2,3})|(\d{2,3})\s*bpm)\b").unwrap()
});
static HALF_TIME_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)\bhalf[\s-]?time\b").unwrap());
static DOUBLE_TIME_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\bdouble[\s-]?time\b").unwrap());

const TEMPO_UP_CUES: [&str; 4] = ["faster", "speed up", "quicker", "push the tempo"];
const TEMPO_DOWN_CUES: [&str; 4] = ["slower", "slow down", "drag it", "ease off"];
const ENERGY_UP_CUES: [&str; 5] = ["more energy", "hype", "harder", "bigger", "build it up"];
const ENERGY_DOWN_CUES: [&str; 6] = ["less", "calmer", "chill", "softer", "quieter", "mellow"];

fn tempo_cue(text: &str) -> Option<TempoCue> {
    if let Some(caps) = BPM_RE.captures(text) {
        let digits = caps.get(1).or_else(|| caps.get(2))?;
        if let Ok(bpm) = digits.as_str().parse::<u32>() {
            return Some(TempoCue::Explicit(bpm));
        }
    }
    if HALF_TIME_RE.is_match(text) {
        return Some(TempoCue::HalfTime);
    }
    if DOUBLE_TIME_RE.is_match(text) {
        return Some(TempoCue::DoubleTime);
    }
    None
}

/// The directive's evident tempo direction: +1.0, -1.0, or none.
fn tempo_direction(text: &str) -> Option<f64> {
    let lower = text.to_ascii_lowercase();
    if TEMPO_DOWN_CUES.iter().any(|cue| lower.contains(cue)) {
        return Some(-1.0);
    }
    if TEMPO_UP_CUES.iter().any(|cue| lower.contains(cue)) {
        return Some(1.0);
    }
    None
}

fn energy_direction(text: &str) -> Option<f64> {
    let lower = text.to_ascii_lowercase();
    if ENERGY_DOWN_CUES.iter().any(|cue| lower.contains(cue)) {
        return Some(-1.0);
    }
    if ENERGY_UP_CUES.iter().any(|cue| lower.contains(cue)) {
        return Some(1.0);
    }
    None
}

/// Confidence-weighted average of deltas, excluding contributors whose sign
/// disagrees with the directive's evident direction. `None` when no
/// contributor carries any weight.
fn weighted_average(
    deltas: impl Iterator<Item = (f64, f64)>,
    direction: Option<f64>,
) -> Option<f64> {
    let mut weighted_sum = 0.0;
    let mut total_weight = 0.0;

    for (delta, weight) in deltas {
        if let Some(dir) = direction {
            if delta * dir < 0.0 {
                continue; // contradicts the boss; sit this one out
            }
        }
        weighted_sum += delta * weight;
        total_weight += weight;
    }

    if total_weight > 0.0 {
        Some(weighted_sum / total_weight)
    } else {
        None
    }
}

/// Merge one turn's contributions into the context in place.
pub fn apply_turn(
    kind: TurnKind,
    directive: Option<&str>,
    contributions: &[Contribution],
    ctx: &mut MusicalContext,
    tuning: &bandconf::TuningConfig,
) {
    let dampening = if kind == TurnKind::AutoTick {
        tuning.auto_tick_dampening
    } else {
        1.0
    };

    apply_tempo(directive, contributions, ctx, tuning, dampening);
    apply_energy(directive, contributions, ctx, dampening);
    apply_key(contributions, ctx);
    apply_chords(contributions, ctx);
}

fn apply_tempo(
    directive: Option<&str>,
    contributions: &[Contribution],
    ctx: &mut MusicalContext,
    tuning: &bandconf::TuningConfig,
    dampening: f64,
) {
    let clamp_bpm =
        |bpm: f64| -> u32 { (bpm.round() as u32).clamp(tuning.bpm_floor, tuning.bpm_ceiling) };

    match directive.and_then(tempo_cue) {
        Some(TempoCue::Explicit(bpm)) => {
            // Deterministic anchor; model opinions are ignored entirely.
            ctx.bpm = clamp_bpm(bpm as f64);
            info!(bpm = ctx.bpm, "tempo anchored by directive");
        }
        Some(TempoCue::HalfTime) => {
            ctx.bpm = clamp_bpm(ctx.bpm as f64 * 0.5);
            info!(bpm = ctx.bpm, "half time");
        }
        Some(TempoCue::DoubleTime) => {
            ctx.bpm = clamp_bpm(ctx.bpm as f64 * 2.0);
            info!(bpm = ctx.bpm, "double time");
        }
        None => {
            let direction = directive.and_then(tempo_direction);
            let deltas = contributions.iter().filter_map(|c| {
                c.decision
                    .tempo_delta_pct
                    .map(|delta| (delta, c.decision.confidence.weight()))
            });
            if let Some(avg_pct) = weighted_average(deltas, direction) {
                let damped = avg_pct * dampening;
                ctx.bpm = clamp_bpm(ctx.bpm as f64 * (1.0 + damped / 100.0));
                debug!(avg_pct, damped, bpm = ctx.bpm, "tempo merged from decisions");
            }
        }
    }
}

fn apply_energy(
    directive: Option<&str>,
    contributions: &[Contribution],
    ctx: &mut MusicalContext,
    dampening: f64,
) {
    let direction = directive.and_then(energy_direction);
    let deltas = contributions.iter().filter_map(|c| {
        c.decision
            .energy_delta
            .map(|delta| (delta, c.decision.confidence.weight()))
    });
    if let Some(avg) = weighted_average(deltas, direction) {
        let damped = avg * dampening;
        let energy = (ctx.energy as f64 + damped).round();
        ctx.energy = energy.clamp(1.0, 10.0) as u8;
        debug!(avg, damped, energy = ctx.energy, "energy merged from decisions");
    }
}

/// A key changes only on strong agreement: at least two distinct agents
/// proposing the same canonical key, both at high confidence. Medium and
/// low proposals never count, even in aggregate.
fn apply_key(contributions: &[Contribution], ctx: &mut MusicalContext) {
    use crate::domain::Confidence;

    // canonical key -> distinct high-confidence proposers, in first-seen order
    let mut proposals: Vec<(String, Vec<&str>)> = Vec::new();

    for c in contributions {
        if c.decision.confidence != Confidence::High {
            continue;
        }
        let Some(key) = &c.decision.suggested_key else {
            continue;
        };
        match proposals.iter_mut().find(|(k, _)| k == key) {
            Some((_, agents)) => {
                if !agents.contains(&c.agent.as_str()) {
                    agents.push(&c.agent);
                }
            }
            None => proposals.push((key.clone(), vec![&c.agent])),
        }
    }

    // Most proposers wins; first-seen order breaks ties deterministically.
    if let Some((key, agents)) = proposals
        .iter()
        .filter(|(_, agents)| agents.len() >= 2)
        .max_by_key(|(_, agents)| agents.len())
    {
        info!(key = %key, proposers = agents.len(), "key consensus reached");
        ctx.set_key(key);
    }
}

/// Chords are a looser, lower-risk call: one high-confidence suggestion is
/// adopted outright.
fn apply_chords(contributions: &[Contribution], ctx: &mut MusicalContext) {
    use crate::domain::Confidence;

    let adopted = contributions.iter().find_map(|c| {
        (c.decision.confidence == Confidence::High)
            .then(|| c.decision.suggested_chords.as_ref())
            .flatten()
    });
    if let Some(chords) = adopted {
        ctx.chord_progression = chords.clone();
        debug!(chords = ?ctx.chord_progression, "chord progression adopted");
    }
}
