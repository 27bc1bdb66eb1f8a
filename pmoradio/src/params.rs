//! Track recipes.
//!
//! A [`TrackRecipe`] is what the parameter backend proposes for the next
//! track. It is validated exactly once, at the backend boundary, from a
//! lenient [`RawRecipe`]. The engine then stamps it into a [`TrackParams`]
//! (identifier, station, timestamp) which is never mutated afterwards.

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use rand::Rng;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

pub const BPM_MIN: u16 = 60;
pub const BPM_MAX: u16 = 180;
pub const DEFAULT_BPM: u16 = 120;
pub const VALID_TIME_SIGNATURES: [u8; 3] = [3, 4, 6];
pub const DEFAULT_TIME_SIGNATURE: u8 = 4;
pub const DEFAULT_KEY: &str = "A Minor";
pub const DEFAULT_TAGS: &str = "atmospheric, experimental";
pub const DEFAULT_RATIONALE: &str = "Evolving the sound";
pub const INSTRUMENTAL_LYRICS: &str = "[inst]";
pub const PLACEHOLDER_LYRICS: &str = "[Verse 1]\nla la la\n\n[Chorus]\nla la la";

const MAX_TAGS: usize = 14;
const MAX_LYRICS_CHARS: usize = 1000;
const MAX_SEED: u32 = 99_999;

/// Tags describing the vocal layer; at most one of them is kept per recipe.
pub const VOCAL_TAGS: &[&str] = &[
    "male vocal",
    "female vocal",
    "male rap",
    "female rap",
    "vocal harmony",
    "vocal chops",
    "spoken word",
    "instrumental",
];

static KEY_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^([A-G][b#]?)\s+(Major|Minor)$").expect("key regex"));

/// Validated generation recipe for one track.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackRecipe {
    pub tags: String,
    pub lyrics: String,
    pub bpm: u16,
    pub key_scale: String,
    pub time_signature: u8,
    pub vocal_language: String,
    pub instrumental: bool,
    pub rationale: String,
    pub seed: u32,
    /// Corrections applied during validation. Broadcast, never persisted.
    #[serde(skip)]
    pub warnings: Vec<String>,
}

impl TrackRecipe {
    pub fn tag_list(&self) -> impl Iterator<Item = &str> {
        self.tags.split(',').map(str::trim).filter(|t| !t.is_empty())
    }

    /// First vocal tag found in the tags, if any.
    pub fn vocal_type(&self) -> Option<&'static str> {
        VOCAL_TAGS
            .iter()
            .copied()
            .find(|v| self.tag_list().any(|t| t == *v))
    }

    /// Lyrics worth showing to a listener (none for instrumentals).
    pub fn display_lyrics(&self) -> &str {
        if self.instrumental || self.lyrics == INSTRUMENTAL_LYRICS {
            ""
        } else {
            &self.lyrics
        }
    }

    /// One-line summary used in backend prompts.
    pub fn summary(&self) -> String {
        format!("{} | {} BPM | {}", self.tags, self.bpm, self.key_scale)
    }
}

/// Recipe as returned by the parameter backend, before validation.
///
/// Every field is optional and loosely typed: models return numbers as
/// strings, forget fields, or invent old ones (`lyric_theme`).
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RawRecipe {
    pub tags: Option<Value>,
    pub lyrics: Option<Value>,
    pub lyric_theme: Option<Value>,
    pub bpm: Option<Value>,
    pub key_scale: Option<Value>,
    pub time_signature: Option<Value>,
    pub vocal_language: Option<Value>,
    pub instrumental: Option<Value>,
    pub rationale: Option<Value>,
    pub seed: Option<Value>,
}

impl RawRecipe {
    /// Clamps and fills every field, recording each correction as a warning.
    pub fn validate(self) -> TrackRecipe {
        let mut warnings = Vec::new();

        let bpm = match self.bpm.as_ref() {
            None => DEFAULT_BPM,
            Some(value) => match as_integer(value) {
                Some(bpm) => {
                    let clamped = bpm.clamp(BPM_MIN as i64, BPM_MAX as i64);
                    if clamped != bpm {
                        warnings.push(format!(
                            "BPM {bpm} -> {clamped} (clamped to {BPM_MIN}-{BPM_MAX})"
                        ));
                    }
                    clamped as u16
                }
                None => {
                    warnings.push(format!("BPM invalid -> defaulted to {DEFAULT_BPM}"));
                    DEFAULT_BPM
                }
            },
        };

        let time_signature = match self.time_signature.as_ref().and_then(as_integer) {
            Some(ts) if VALID_TIME_SIGNATURES.iter().any(|v| *v as i64 == ts) => ts as u8,
            Some(ts) => {
                warnings.push(format!(
                    "Time sig {ts} -> {DEFAULT_TIME_SIGNATURE} (not in {VALID_TIME_SIGNATURES:?})"
                ));
                DEFAULT_TIME_SIGNATURE
            }
            None => DEFAULT_TIME_SIGNATURE,
        };

        let key_scale = match self.key_scale.as_ref() {
            Some(Value::String(raw)) => match KEY_RE.captures(raw.trim()) {
                Some(caps) => format!("{} {}", &caps[1], &caps[2]),
                None => {
                    if !raw.is_empty() {
                        warnings.push(format!("Key '{raw}' -> {DEFAULT_KEY} (invalid format)"));
                    }
                    DEFAULT_KEY.to_string()
                }
            },
            Some(other) => {
                warnings.push(format!("Key '{other}' -> {DEFAULT_KEY} (invalid format)"));
                DEFAULT_KEY.to_string()
            }
            None => DEFAULT_KEY.to_string(),
        };

        let tags = match self.tags.as_ref() {
            Some(Value::String(raw)) if !raw.trim().is_empty() => {
                normalize_tags(raw, &mut warnings)
            }
            _ => {
                warnings.push(format!("No tags -> defaulted to '{DEFAULT_TAGS}'"));
                DEFAULT_TAGS.to_string()
            }
        };

        let instrumental = self.instrumental.as_ref().map(truthy).unwrap_or(true);

        let vocal_language = match self.vocal_language {
            Some(Value::String(lang)) if !lang.trim().is_empty() => lang.trim().to_string(),
            _ => "en".to_string(),
        };

        let rationale = match self.rationale {
            Some(Value::String(text)) => text,
            _ => DEFAULT_RATIONALE.to_string(),
        };

        let seed = self
            .seed
            .as_ref()
            .and_then(as_integer)
            .and_then(|s| u32::try_from(s).ok())
            .unwrap_or_else(random_seed);

        let lyrics = if instrumental {
            INSTRUMENTAL_LYRICS.to_string()
        } else {
            let text = [self.lyrics.as_ref(), self.lyric_theme.as_ref()]
                .into_iter()
                .flatten()
                .find_map(|v| match v {
                    Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
                    _ => None,
                });
            match text {
                Some(text) => text.chars().take(MAX_LYRICS_CHARS).collect(),
                None => {
                    warnings.push("No lyrics -> defaulted to placeholder".to_string());
                    PLACEHOLDER_LYRICS.to_string()
                }
            }
        };

        TrackRecipe {
            tags,
            lyrics,
            bpm,
            key_scale,
            time_signature,
            vocal_language,
            instrumental,
            rationale,
            seed,
            warnings,
        }
    }
}

pub fn random_seed() -> u32 {
    rand::rng().random_range(0..=MAX_SEED)
}

fn as_integer(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::Null => false,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !matches!(
            s.trim().to_ascii_lowercase().as_str(),
            "" | "false" | "no" | "0"
        ),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

/// Lowercases, trims and deduplicates comma-separated tags, capped at 14.
pub fn normalize_tags(raw: &str, warnings: &mut Vec<String>) -> String {
    let mut kept: Vec<String> = Vec::new();
    for tag in raw.split(',') {
        let tag = tag.split_whitespace().collect::<Vec<_>>().join(" ").to_lowercase();
        if tag.is_empty() || kept.contains(&tag) {
            continue;
        }
        if kept.len() >= MAX_TAGS {
            warnings.push(format!("Tag '{tag}' dropped (max {MAX_TAGS} tags)"));
            continue;
        }
        kept.push(tag);
    }
    if kept.is_empty() {
        return DEFAULT_TAGS.to_string();
    }
    kept.join(", ")
}

static VOCAL_PATTERNS: Lazy<Vec<(Regex, &'static str)>> = Lazy::new(|| {
    [
        // "no singing" must win over any vocal match
        (r"\bno\s+(?:singing|vocals?|voice)\b", "instrumental"),
        (r"\bwithout\s+(?:singing|vocals?|voice)\b", "instrumental"),
        (r"\binstrumental\s+only\b", "instrumental"),
        (r"\bwom[ae]n?\s+sing", "female vocal"),
        (r"\bgirl\s+(?:sing|vocal|voice)", "female vocal"),
        (r"\bfemale\s+(?:sing|vocal|voice|singer)", "female vocal"),
        (r"\bguy\s+(?:sing|vocal|voice)", "male vocal"),
        (r"\bmale\s+(?:sing|vocal|voice|singer)", "male vocal"),
        (r"\bman\s+sing", "male vocal"),
        (r"\bfemale\s+rap", "female rap"),
        (r"\bgive\s+me\s+a\s+rapper\b", "male rap"),
        (r"\b(?:male\s+)?rapper\b", "male rap"),
        (r"\bmale\s+rap\b", "male rap"),
        (r"\bspoken\s+word\b", "spoken word"),
    ]
    .into_iter()
    .map(|(pattern, vocal)| {
        let re = Regex::new(&format!("(?i){pattern}")).expect("vocal pattern");
        (re, vocal)
    })
    .collect()
});

/// Detects an explicit vocal request in the listener's message.
pub fn vocal_preference(message: &str) -> Option<&'static str> {
    VOCAL_PATTERNS
        .iter()
        .find(|(re, _)| re.is_match(message))
        .map(|(_, vocal)| *vocal)
}

/// Forces the vocal layer the listener asked for when the backend ignored it.
pub fn inject_vocal_preference(recipe: &mut TrackRecipe, message: &str) {
    let Some(wanted) = vocal_preference(message) else {
        return;
    };
    if recipe.tag_list().any(|t| t == wanted) {
        return;
    }

    let mut tags: Vec<&str> = recipe
        .tag_list()
        .filter(|t| !VOCAL_TAGS.contains(t))
        .collect();
    tags.push(wanted);
    recipe.tags = tags.join(", ");

    recipe.instrumental = wanted == "instrumental";
    if recipe.instrumental {
        recipe.lyrics = INSTRUMENTAL_LYRICS.to_string();
    } else if recipe.lyrics == INSTRUMENTAL_LYRICS {
        recipe.lyrics = PLACEHOLDER_LYRICS.to_string();
    }
}

/// Per-station track number, displayed zero-padded (`007`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TrackId(pub u32);

impl fmt::Display for TrackId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:03}", self.0)
    }
}

/// A recipe stamped by the engine just before rendering starts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackParams {
    pub id: TrackId,
    pub radio: String,
    pub generated_at: DateTime<Utc>,
    /// Listener text that led to this track (or its tags when none).
    pub prompt: String,
    #[serde(flatten)]
    pub recipe: TrackRecipe,
}

impl TrackParams {
    pub fn stamp(recipe: TrackRecipe, id: TrackId, radio: &str, direction: &str) -> Self {
        let prompt = if direction.is_empty() {
            recipe.tags.clone()
        } else {
            direction.chars().take(120).collect()
        };
        Self {
            id,
            radio: radio.to_string(),
            generated_at: Utc::now(),
            prompt,
            recipe,
        }
    }
}

/// Tunable "stuck backend" heuristic.
///
/// The backend is considered stuck when the last `window` tracks all sit
/// within `bpm_delta` BPM of the candidate and share its key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SimilarityRule {
    pub window: usize,
    pub bpm_delta: u16,
}

impl Default for SimilarityRule {
    fn default() -> Self {
        Self {
            window: 3,
            bpm_delta: 20,
        }
    }
}

impl SimilarityRule {
    pub fn is_stuck(&self, candidate: &TrackRecipe, recent: &[TrackParams]) -> bool {
        if self.window == 0 || recent.len() < self.window {
            return false;
        }
        recent[recent.len() - self.window..].iter().all(|prev| {
            candidate.bpm.abs_diff(prev.recipe.bpm) <= self.bpm_delta
                && candidate.key_scale == prev.recipe.key_scale
        })
    }
}
