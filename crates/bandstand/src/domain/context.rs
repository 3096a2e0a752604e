//! The shared musical context every agent plays against.

use serde::{Deserialize, Serialize};

/// The authoritative musical state of one jam session.
///
/// Mutated only by the aggregation engine at turn completion. Always fully
/// defined - there is no partially-updated context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MusicalContext {
    pub genre: String,
    /// Canonical key, e.g. "Eb major".
    pub key: String,
    /// Scale tones derived from `key`; recomputed on every key change.
    pub scale: Vec<String>,
    pub chord_progression: Vec<String>,
    pub bpm: u32,
    pub time_signature: String,
    /// 1 (barely there) to 10 (full send).
    pub energy: u8,
}

impl Default for MusicalContext {
    fn default() -> Self {
        let key = "C major".to_string();
        let scale = keynote::scale_for(&key).unwrap_or_default();
        Self {
            genre: "jam".to_string(),
            key,
            scale,
            chord_progression: vec!["C", "Am", "F", "G"]
                .into_iter()
                .map(String::from)
                .collect(),
            bpm: 120,
            time_signature: "4/4".to_string(),
            energy: 5,
        }
    }
}

impl MusicalContext {
    /// Adopt a canonical key, recomputing the scale deterministically.
    pub fn set_key(&mut self, canonical_key: &str) {
        if let Some(scale) = keynote::scale_for(canonical_key) {
            self.key = canonical_key.to_string();
            self.scale = scale;
        }
    }

    /// One-line summary injected into agent prompts.
    pub fn describe(&self) -> String {
        format!(
            "genre={} key={} bpm={} time={} energy={}/10 chords=[{}]",
            self.genre,
            self.key,
            self.bpm,
            self.time_signature,
            self.energy,
            self.chord_progression.join(" "),
        )
    }

    /// Seed the context from a genre preset.
    pub fn from_preset(preset: &GenrePreset) -> Self {
        let mut ctx = Self {
            genre: preset.genre.to_string(),
            bpm: preset.bpm,
            energy: preset.energy,
            time_signature: preset.time_signature.to_string(),
            chord_progression: preset.chords.iter().map(|c| c.to_string()).collect(),
            ..Self::default()
        };
        ctx.set_key(preset.key);
        ctx
    }
}

/// A one-time genre seed for a fresh session.
#[derive(Debug, Clone, Copy)]
pub struct GenrePreset {
    pub id: &'static str,
    pub genre: &'static str,
    pub bpm: u32,
    pub energy: u8,
    pub key: &'static str,
    pub time_signature: &'static str,
    pub chords: &'static [&'static str],
}

const PRESETS: &[GenrePreset] = &[
    GenrePreset {
        id: "house",
        genre: "deep house",
        bpm: 124,
        energy: 6,
        key: "A minor",
        time_signature: "4/4",
        chords: &["Am7", "Dm7", "Fmaj7", "G7"],
    },
    GenrePreset {
        id: "techno",
        genre: "techno",
        bpm: 132,
        energy: 7,
        key: "F minor",
        time_signature: "4/4",
        chords: &["Fm", "Fm", "Ab", "Eb"],
    },
    GenrePreset {
        id: "jazz",
        genre: "jazz fusion",
        bpm: 96,
        energy: 4,
        key: "Eb major",
        time_signature: "4/4",
        chords: &["Ebmaj7", "Cm7", "Fm7", "Bb7"],
    },
    GenrePreset {
        id: "dnb",
        genre: "drum and bass",
        bpm: 174,
        energy: 8,
        key: "E minor",
        time_signature: "4/4",
        chords: &["Em", "C", "G", "D"],
    },
    GenrePreset {
        id: "ambient",
        genre: "ambient",
        bpm: 70,
        energy: 2,
        key: "Db major",
        time_signature: "4/4",
        chords: &["Dbmaj7", "Gbmaj7"],
    },
    GenrePreset {
        id: "breakbeat",
        genre: "breakbeat",
        bpm: 138,
        energy: 7,
        key: "G minor",
        time_signature: "4/4",
        chords: &["Gm", "Bb", "Eb", "F"],
    },
];

/// Look up a genre preset by id.
pub fn preset(id: &str) -> Option<&'static GenrePreset> {
    PRESETS.iter().find(|p| p.id == id)
}

/// All known preset ids, for diagnostics.
pub fn preset_ids() -> Vec<&'static str> {
    PRESETS.iter().map(|p| p.id).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_context_is_fully_defined() {
        let ctx = MusicalContext::default();
        assert_eq!(ctx.key, "C major");
        assert_eq!(ctx.scale, vec!["C", "D", "E", "F", "G", "A", "B"]);
        assert_eq!(ctx.bpm, 120);
        assert!(!ctx.chord_progression.is_empty());
    }

    #[test]
    fn set_key_recomputes_scale() {
        let mut ctx = MusicalContext::default();
        ctx.set_key("Eb major");
        assert_eq!(ctx.key, "Eb major");
        assert_eq!(ctx.scale, vec!["Eb", "F", "G", "Ab", "Bb", "C", "D"]);
    }

    #[test]
    fn set_key_ignores_garbage() {
        let mut ctx = MusicalContext::default();
        ctx.set_key("H sharp wrong");
        assert_eq!(ctx.key, "C major");
    }

    #[test]
    fn presets_seed_context() {
        let p = preset("jazz").unwrap();
        let ctx = MusicalContext::from_preset(p);
        assert_eq!(ctx.genre, "jazz fusion");
        assert_eq!(ctx.bpm, 96);
        assert_eq!(ctx.key, "Eb major");
        assert_eq!(ctx.scale[0], "Eb");

        assert!(preset("polka").is_none());
    }
}
