//! Structured per-agent opinions about where the music should go.

use serde::{Deserialize, Serialize};

/// How strongly an agent holds its decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Confidence {
    Low,
    Medium,
    High,
}

impl Confidence {
    /// Weight used by the aggregation engine. Low opinions are recorded but
    /// carry no vote.
    pub fn weight(&self) -> f64 {
        match self {
            Confidence::Low => 0.0,
            Confidence::Medium => 0.5,
            Confidence::High => 1.0,
        }
    }

    pub fn parse(text: &str) -> Option<Self> {
        match text.to_ascii_lowercase().as_str() {
            "low" => Some(Confidence::Low),
            "medium" => Some(Confidence::Medium),
            "high" => Some(Confidence::High),
            _ => None,
        }
    }
}

impl std::fmt::Display for Confidence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Confidence::Low => write!(f, "low"),
            Confidence::Medium => write!(f, "medium"),
            Confidence::High => write!(f, "high"),
        }
    }
}

/// An agent's optional structured opinion for one turn.
///
/// Every field here survived per-field validation; a decision with no
/// surviving opinion fields is dropped before it ever reaches this type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Decision {
    /// Requested tempo change in percent of current BPM, pre-clamped.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tempo_delta_pct: Option<f64>,

    /// Requested energy change in levels, pre-clamped and rounded.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub energy_delta: Option<f64>,

    /// Free-form intent, normalized to a slug ("drop_the_bass").
    #[serde(skip_serializing_if = "Option::is_none")]
    pub arrangement_intent: Option<String>,

    pub confidence: Confidence,

    /// Canonicalized key suggestion, e.g. "Eb major".
    #[serde(skip_serializing_if = "Option::is_none")]
    pub suggested_key: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub suggested_chords: Option<Vec<String>>,
}

impl Decision {
    /// True when no opinion field survived validation. Confidence alone does
    /// not count - it qualifies opinions, it is not one.
    pub fn is_empty(&self) -> bool {
        self.tempo_delta_pct.is_none()
            && self.energy_delta.is_none()
            && self.arrangement_intent.is_none()
            && self.suggested_key.is_none()
            && self.suggested_chords.is_none()
    }
}

impl Default for Decision {
    fn default() -> Self {
        Self {
            tempo_delta_pct: None,
            energy_delta: None,
            arrangement_intent: None,
            confidence: Confidence::Low,
            suggested_key: None,
            suggested_chords: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn confidence_weights() {
        assert_eq!(Confidence::Low.weight(), 0.0);
        assert_eq!(Confidence::Medium.weight(), 0.5);
        assert_eq!(Confidence::High.weight(), 1.0);
    }

    #[test]
    fn confidence_parses_case_insensitively() {
        assert_eq!(Confidence::parse("HIGH"), Some(Confidence::High));
        assert_eq!(Confidence::parse("medium"), Some(Confidence::Medium));
        assert_eq!(Confidence::parse("certain"), None);
    }

    #[test]
    fn empty_decision_detection() {
        let mut d = Decision::default();
        assert!(d.is_empty());

        d.confidence = Confidence::High;
        assert!(d.is_empty());

        d.energy_delta = Some(1.0);
        assert!(!d.is_empty());
    }
}
