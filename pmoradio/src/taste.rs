//! Per-station taste profile (`taste.json`).
//!
//! Every mutation is a load, modify, atomic save cycle: the file is written
//! to a sibling `.tmp` and renamed over the original. A missing file means
//! the station never received a first vibe.

use crate::params::{TrackParams, TrackRecipe};
use crate::reaction::Signal;
use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::warn;

pub const MAX_LIKED: usize = 20;
pub const MAX_DISLIKED: usize = 20;
pub const MAX_SKIPPED: usize = 10;

const CONTEXT_LIKED: usize = 5;
const CONTEXT_DISLIKED: usize = 3;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TasteEntry {
    pub tags: String,
    pub bpm: u16,
    pub key_scale: String,
    pub time_signature: u8,
    pub instrumental: bool,
    pub rationale: String,
    pub reacted_at: DateTime<Utc>,
}

impl From<&TrackRecipe> for TasteEntry {
    fn from(recipe: &TrackRecipe) -> Self {
        Self {
            tags: recipe.tags.clone(),
            bpm: recipe.bpm,
            key_scale: recipe.key_scale.clone(),
            time_signature: recipe.time_signature,
            instrumental: recipe.instrumental,
            rationale: recipe.rationale.clone(),
            reacted_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TasteProfile {
    pub liked: Vec<TasteEntry>,
    pub disliked: Vec<TasteEntry>,
    pub skipped: Vec<TasteEntry>,
    pub explicit_notes: Vec<String>,
    pub session_direction: Option<String>,
    pub generation_count: u32,
}

impl TasteProfile {
    fn push(&mut self, signal: Signal, entry: TasteEntry) {
        let (list, cap) = match signal {
            Signal::Liked => (&mut self.liked, MAX_LIKED),
            Signal::Disliked => (&mut self.disliked, MAX_DISLIKED),
            Signal::Skipped => (&mut self.skipped, MAX_SKIPPED),
        };
        list.push(entry);
        if list.len() > cap {
            let excess = list.len() - cap;
            list.drain(..excess);
        }
    }

    /// Plain-text summary handed to the parameter backend.
    pub fn context(&self, radio: &str) -> String {
        let mut lines = vec![format!("Radio: {radio}")];

        if !self.explicit_notes.is_empty() {
            lines.push("User preferences:".to_string());
            lines.extend(self.explicit_notes.iter().map(|n| format!("  - {n}")));
        }

        if !self.liked.is_empty() {
            lines.push(format!("Liked tracks (last {}):", self.liked.len()));
            let skip = self.liked.len().saturating_sub(CONTEXT_LIKED);
            lines.extend(
                self.liked[skip..]
                    .iter()
                    .map(|t| format!("  - {} | {} BPM | {}", t.tags, t.bpm, t.key_scale)),
            );
        }

        if !self.disliked.is_empty() {
            lines.push("Disliked tracks (avoid these patterns):".to_string());
            let skip = self.disliked.len().saturating_sub(CONTEXT_DISLIKED);
            lines.extend(self.disliked[skip..].iter().map(|t| format!("  - {}", t.tags)));
        }

        if let Some(direction) = self.session_direction.as_deref().filter(|d| !d.is_empty()) {
            lines.push(format!("Current direction: {direction}"));
        }

        lines.push(format!("Tracks generated so far: {}", self.generation_count));
        lines.join("\n")
    }
}

#[derive(Debug, Clone)]
pub struct TasteStore {
    path: PathBuf,
}

impl TasteStore {
    pub fn new(station_dir: &Path) -> Self {
        Self {
            path: station_dir.join("taste.json"),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    /// Missing or unreadable files read as an empty profile.
    pub fn load(&self) -> TasteProfile {
        let raw = match fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(_) => return TasteProfile::default(),
        };
        match serde_json::from_str(&raw) {
            Ok(profile) => profile,
            Err(err) => {
                warn!(path = %self.path.display(), "unreadable taste profile, starting empty: {err}");
                TasteProfile::default()
            }
        }
    }

    pub fn save(&self, profile: &TasteProfile) -> anyhow::Result<()> {
        let tmp = self.path.with_extension("tmp");
        let body = serde_json::to_string_pretty(profile)?;
        fs::write(&tmp, body).with_context(|| format!("writing {}", tmp.display()))?;
        fs::rename(&tmp, &self.path).with_context(|| format!("replacing {}", self.path.display()))?;
        Ok(())
    }

    fn update<F: FnOnce(&mut TasteProfile)>(&self, f: F) -> anyhow::Result<TasteProfile> {
        let mut profile = self.load();
        f(&mut profile);
        self.save(&profile)?;
        Ok(profile)
    }

    pub fn record(&self, signal: Signal, params: &TrackParams) -> anyhow::Result<()> {
        let entry = TasteEntry::from(&params.recipe);
        self.update(|p| p.push(signal, entry)).map(|_| ())
    }

    pub fn note(&self, text: &str) -> anyhow::Result<()> {
        let text = text.trim();
        if text.is_empty() {
            return Ok(());
        }
        self.update(|p| {
            if !p.explicit_notes.iter().any(|n| n == text) {
                p.explicit_notes.push(text.to_string());
            }
        })
        .map(|_| ())
    }

    pub fn set_direction(&self, direction: &str) -> anyhow::Result<()> {
        self.update(|p| p.session_direction = Some(direction.to_string()))
            .map(|_| ())
    }

    pub fn increment_count(&self) -> anyhow::Result<u32> {
        self.update(|p| p.generation_count += 1)
            .map(|p| p.generation_count)
    }

    pub fn generation_count(&self) -> u32 {
        self.load().generation_count
    }

    pub fn context(&self, radio: &str) -> String {
        self.load().context(radio)
    }

    /// Forgets everything, including the first vibe.
    pub fn remove(&self) -> anyhow::Result<()> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::{RawRecipe, TrackId};
    use serde_json::json;

    fn params(tags: &str, bpm: u16) -> TrackParams {
        let raw: RawRecipe =
            serde_json::from_value(json!({"tags": tags, "bpm": bpm, "key_scale": "D Minor"}))
                .unwrap();
        TrackParams::stamp(raw.validate(), TrackId(1), "default", "")
    }

    #[test]
    fn test_missing_file_is_first_run() {
        let dir = tempfile::tempdir().unwrap();
        let store = TasteStore::new(dir.path());
        assert!(!store.exists());
        assert_eq!(store.load(), TasteProfile::default());

        store.note("late night jazz").unwrap();
        assert!(store.exists());
        assert!(!dir.path().join("taste.tmp").exists());
    }

    #[test]
    fn test_corrupt_file_reads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = TasteStore::new(dir.path());
        fs::write(store.path(), "{ not json").unwrap();
        assert_eq!(store.load(), TasteProfile::default());
    }

    #[test]
    fn test_history_caps() {
        let dir = tempfile::tempdir().unwrap();
        let store = TasteStore::new(dir.path());
        for i in 0..25 {
            store.record(Signal::Skipped, &params(&format!("t{i}"), 100)).unwrap();
        }
        let profile = store.load();
        assert_eq!(profile.skipped.len(), MAX_SKIPPED);
        assert_eq!(profile.skipped[0].tags, "t15");
    }

    #[test]
    fn test_notes_are_deduplicated() {
        let dir = tempfile::tempdir().unwrap();
        let store = TasteStore::new(dir.path());
        store.note("more bass").unwrap();
        store.note("more bass").unwrap();
        store.note("  ").unwrap();
        assert_eq!(store.load().explicit_notes, vec!["more bass"]);
    }

    #[test]
    fn test_count_and_context() {
        let dir = tempfile::tempdir().unwrap();
        let store = TasteStore::new(dir.path());
        assert_eq!(store.increment_count().unwrap(), 1);
        assert_eq!(store.increment_count().unwrap(), 2);

        store.note("no vocals").unwrap();
        store.set_direction("darker").unwrap();
        for i in 0..7 {
            store.record(Signal::Liked, &params(&format!("liked{i}"), 90)).unwrap();
        }
        store.record(Signal::Disliked, &params("polka", 130)).unwrap();

        let context = store.context("night");
        let lines: Vec<&str> = context.lines().collect();
        assert_eq!(lines[0], "Radio: night");
        assert!(context.contains("User preferences:\n  - no vocals"));
        assert!(context.contains("Liked tracks (last 7):"));
        assert!(!context.contains("liked1 |"));
        assert!(context.contains("  - liked6 | 90 BPM | D Minor"));
        assert!(context.contains("Disliked tracks (avoid these patterns):\n  - polka"));
        assert!(context.contains("Current direction: darker"));
        assert_eq!(*lines.last().unwrap(), "Tracks generated so far: 2");
    }

    #[test]
    fn test_remove() {
        let dir = tempfile::tempdir().unwrap();
        let store = TasteStore::new(dir.path());
        store.remove().unwrap();
        store.set_direction("x").unwrap();
        store.remove().unwrap();
        assert!(!store.exists());
    }
}
