//! Key parsing, canonicalization, and scale derivation.
//!
//! Agents describe keys as free text ("eb MAJOR", "f# min", "Bb"). Before
//! any two suggestions can be compared for consensus they must collapse to
//! one canonical spelling, and a canonical key must map deterministically
//! to its scale tones.

use serde::{Deserialize, Serialize};

const NOTE_NAMES_SHARP: [&str; 12] = [
    "C", "C#", "D", "D#", "E", "F", "F#", "G", "G#", "A", "A#", "B",
];
const NOTE_NAMES_FLAT: [&str; 12] = [
    "C", "Db", "D", "Eb", "E", "F", "Gb", "G", "Ab", "A", "Bb", "B",
];

/// Pitch classes conventionally spelled with flats.
const FLAT_ROOTS: [u8; 6] = [1, 3, 5, 6, 8, 10]; // Db, Eb, F, Gb, Ab, Bb

/// Semitone offsets of a major scale.
const MAJOR_INTERVALS: [u8; 7] = [0, 2, 4, 5, 7, 9, 11];

/// Semitone offsets of a natural minor scale.
const MINOR_INTERVALS: [u8; 7] = [0, 2, 3, 5, 7, 8, 10];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyMode {
    Major,
    Minor,
}

impl std::fmt::Display for KeyMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            KeyMode::Major => write!(f, "major"),
            KeyMode::Minor => write!(f, "minor"),
        }
    }
}

/// A parsed key: root pitch class plus mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Key {
    /// Pitch class 0–11 (C=0, C#=1, ...)
    pub root_pitch_class: u8,
    pub mode: KeyMode,
}

impl Key {
    /// Root note name in the conventional spelling for this pitch class.
    pub fn root_name(&self) -> &'static str {
        spelled_name(self.root_pitch_class)
    }

    /// The canonical display form, e.g. "Eb major".
    pub fn canonical(&self) -> String {
        format!("{} {}", self.root_name(), self.mode)
    }

    /// Scale tones for this key, spelled with the root's convention.
    pub fn scale(&self) -> Vec<String> {
        let intervals = match self.mode {
            KeyMode::Major => &MAJOR_INTERVALS,
            KeyMode::Minor => &MINOR_INTERVALS,
        };
        let names = if FLAT_ROOTS.contains(&self.root_pitch_class) {
            &NOTE_NAMES_FLAT
        } else {
            &NOTE_NAMES_SHARP
        };

        intervals
            .iter()
            .map(|offset| names[((self.root_pitch_class + offset) % 12) as usize].to_string())
            .collect()
    }
}

impl std::fmt::Display for Key {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.canonical())
    }
}

fn spelled_name(pitch_class: u8) -> &'static str {
    if FLAT_ROOTS.contains(&pitch_class) {
        NOTE_NAMES_FLAT[pitch_class as usize]
    } else {
        NOTE_NAMES_SHARP[pitch_class as usize]
    }
}

/// Parse a free-text key description.
///
/// Accepts a root letter with optional accidental (`#`, `b`, `♯`, `♭`)
/// followed by an optional mode word (major/maj, minor/min/m). A missing
/// mode defaults to major. Returns `None` for anything unrecognizable.
pub fn parse_key(text: &str) -> Option<Key> {
    let trimmed = text.trim();
    let mut chars = trimmed.chars();

    let letter = chars.next()?.to_ascii_uppercase();
    let base_pc: i8 = match letter {
        'C' => 0,
        'D' => 2,
        'E' => 4,
        'F' => 5,
        'G' => 7,
        'A' => 9,
        'B' => 11,
        _ => return None,
    };

    let rest: String = chars.collect();
    let rest = rest.trim_start();

    let (accidental, rest) = match rest.chars().next() {
        Some('#') | Some('♯') => (1i8, &rest[rest.chars().next().unwrap().len_utf8()..]),
        Some('b') | Some('♭') => {
            // Lowercase 'b' is ambiguous: "b minor" vs "Bb". Treat it as an
            // accidental only when what follows is empty or a mode word.
            let after = &rest[rest.chars().next().unwrap().len_utf8()..];
            if after.is_empty() || is_mode_word(after.trim()) {
                (-1i8, after)
            } else {
                (0i8, rest)
            }
        }
        _ => (0i8, rest),
    };

    let mode_text = rest.trim();
    let mode = if mode_text.is_empty() {
        KeyMode::Major
    } else if is_major_word(mode_text) {
        KeyMode::Major
    } else if is_minor_word(mode_text) {
        KeyMode::Minor
    } else {
        return None;
    };

    let pitch_class = ((base_pc + accidental).rem_euclid(12)) as u8;
    Some(Key {
        root_pitch_class: pitch_class,
        mode,
    })
}

fn is_major_word(text: &str) -> bool {
    matches!(text.to_ascii_lowercase().as_str(), "major" | "maj")
}

fn is_minor_word(text: &str) -> bool {
    matches!(text.to_ascii_lowercase().as_str(), "minor" | "min" | "m")
}

fn is_mode_word(text: &str) -> bool {
    is_major_word(text) || is_minor_word(text)
}

/// Canonicalize a free-text key to "Eb major" form, if parseable.
pub fn canonicalize_key(text: &str) -> Option<String> {
    parse_key(text).map(|k| k.canonical())
}

/// Derive the scale for a free-text key, if parseable.
pub fn scale_for(text: &str) -> Option<Vec<String>> {
    parse_key(text).map(|k| k.scale())
}
