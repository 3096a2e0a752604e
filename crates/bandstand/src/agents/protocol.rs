//! The newline-delimited JSON protocol spoken by agent subprocesses, and
//! the two-layer validation of their answers.
//!
//! Layer one (required): the answer must be a JSON object with non-empty
//! `pattern`, `thoughts`, and `reaction`. Failing this invalidates the
//! whole response - the agent misunderstood the protocol and must fail
//! loudly. Layer two (the optional `decision` block) is creative metadata:
//! each field is validated on its own and bad fields are dropped silently.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::domain::{Confidence, Decision};

/// One line of subprocess output.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentEvent {
    /// First-turn only: the conversation continuity token.
    ThreadStarted { thread_id: String },
    /// The agent's textual answer. The last one before `turn_complete` wins.
    Answer { text: String },
    /// Terminal event for a turn.
    TurnComplete,
    /// Anything else (progress chatter, tool noise) is ignored.
    #[serde(other)]
    Other,
}

impl AgentEvent {
    /// Parse one protocol line. Unparseable lines are treated as chatter.
    pub fn parse(line: &str) -> Option<Self> {
        serde_json::from_str(line.trim()).ok()
    }
}

/// One turn's prompt, framed as a single line to the subprocess.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromptEnvelope<'a> {
    /// Present only on the spawning turn.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system: Option<&'a str>,
    pub prompt: &'a str,
    /// Continuity token from `thread_started`; absent on the first turn.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<&'a str>,
}

/// A fully validated agent answer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentReply {
    pub pattern: String,
    pub thoughts: String,
    pub reaction: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub decision: Option<Decision>,
}

/// Tagged validation result. Never trust the shape implicitly.
#[derive(Debug, Clone, PartialEq)]
pub enum Validated {
    Valid(AgentReply),
    Invalid(String),
}

/// Extract the single JSON object embedded in an agent's answer text.
///
/// Agents are asked for bare JSON but routinely wrap it in prose or code
/// fences; take the outermost brace span and parse that.
pub fn extract_answer_object(text: &str) -> Option<Value> {
    let trimmed = text.trim();
    if let Ok(value) = serde_json::from_str::<Value>(trimmed) {
        if value.is_object() {
            return Some(value);
        }
    }

    let start = trimmed.find('{')?;
    let end = trimmed.rfind('}')?;
    if end <= start {
        return None;
    }
    serde_json::from_str::<Value>(&trimmed[start..=end])
        .ok()
        .filter(Value::is_object)
}

/// Validate an answer against the response schema.
pub fn validate_answer(text: &str, tuning: &bandconf::TuningConfig) -> Validated {
    let Some(value) = extract_answer_object(text) else {
        return Validated::Invalid("answer contains no JSON object".to_string());
    };

    let pattern = match required_string(&value, "pattern") {
        Ok(s) => s,
        Err(reason) => return Validated::Invalid(reason),
    };
    let thoughts = match required_string(&value, "thoughts") {
        Ok(s) => s,
        Err(reason) => return Validated::Invalid(reason),
    };
    let reaction = match required_string(&value, "reaction") {
        Ok(s) => s,
        Err(reason) => return Validated::Invalid(reason),
    };

    let decision = value.get("decision").and_then(|d| parse_decision(d, tuning));

    Validated::Valid(AgentReply {
        pattern,
        thoughts,
        reaction,
        decision,
    })
}

fn required_string(value: &Value, field: &str) -> Result<String, String> {
    match value.get(field).and_then(Value::as_str) {
        Some(s) if !s.trim().is_empty() => Ok(s.to_string()),
        Some(_) => Err(format!("required field '{field}' is empty")),
        None => Err(format!("required field '{field}' is missing")),
    }
}

/// Field-by-field tolerant parse of the optional decision block.
///
/// Individual invalid fields are dropped; a decision with zero surviving
/// opinion fields is treated as absent.
pub fn parse_decision(value: &Value, tuning: &bandconf::TuningConfig) -> Option<Decision> {
    let obj = value.as_object()?;

    let tempo_delta_pct = obj
        .get("tempo_delta_pct")
        .and_then(Value::as_f64)
        .filter(|d| d.is_finite())
        .map(|d| d.clamp(-tuning.tempo_delta_clamp_pct, tuning.tempo_delta_clamp_pct));

    let energy_delta = obj
        .get("energy_delta")
        .and_then(Value::as_f64)
        .filter(|d| d.is_finite())
        .map(|d| d.clamp(-tuning.energy_delta_clamp, tuning.energy_delta_clamp).round());

    let arrangement_intent = obj
        .get("arrangement_intent")
        .and_then(Value::as_str)
        .map(slugify)
        .filter(|s| !s.is_empty());

    let confidence = obj
        .get("confidence")
        .and_then(Value::as_str)
        .and_then(Confidence::parse)
        .unwrap_or(Confidence::Low);

    let suggested_key = obj
        .get("suggested_key")
        .and_then(Value::as_str)
        .and_then(keynote::canonicalize_key);

    let suggested_chords = obj
        .get("suggested_chords")
        .and_then(Value::as_array)
        .map(|chords| {
            chords
                .iter()
                .filter_map(Value::as_str)
                .map(str::trim)
                .filter(|c| !c.is_empty())
                .map(String::from)
                .collect::<Vec<_>>()
        })
        .filter(|chords| !chords.is_empty());

    let decision = Decision {
        tempo_delta_pct,
        energy_delta,
        arrangement_intent,
        confidence,
        suggested_key,
        suggested_chords,
    };

    if decision.is_empty() {
        None
    } else {
        Some(decision)
    }
}

/// Normalize free-form intent to a slug: "Drop the bass!" -> "drop_the_bass".
fn slugify(text: &str) -> String {
    let mut slug = String::with_capacity(text.len());
    let mut last_was_sep = true;
    for c in text.chars() {
        if c.is_ascii_alphanumeric() {
            slug.push(c.to_ascii_lowercase());
            last_was_sep = false;
        } else if !last_was_sep {
            slug.push('_');
            last_was_sep = true;
        }
    }
    slug.trim_matches('_').to_string()
}

/// Reaction shown when an agent's response failed validation.
pub fn fallback_reaction(role: &str) -> String {
    format!("{role} missed the cue but keeps playing")
}
