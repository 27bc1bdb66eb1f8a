//! Stations on disk.
//!
//! ```text
//! <radios_dir>/
//!   .current            name of the selected station
//!   metrics.jsonl       one line per committed track
//!   <station>/
//!     taste.json
//!     tracks/NNN-slug.mp3 + NNN-slug.json
//!     favorites/
//! ```

use crate::error::{Error, Result};
use crate::events::RadioSummary;
use crate::params::{TrackId, TrackParams};
use crate::reaction::clean_radio_name;
use crate::taste::TasteStore;
use chrono::{DateTime, Local, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use serde_json::{Map, Value};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tracing::{debug, warn};

pub const DEFAULT_STATION: &str = "default";
const CURRENT_FILE: &str = ".current";
const METRICS_FILE: &str = "metrics.jsonl";
const SLUG_MAX: usize = 40;

static SLUG_DROP: Lazy<Regex> = Lazy::new(|| Regex::new(r"[^\w\s-]").expect("slug regex"));
static SLUG_SEP: Lazy<Regex> = Lazy::new(|| Regex::new(r"[\s,]+").expect("slug regex"));

/// Filename-safe slug of a tag list, at most 40 characters.
pub fn slugify(text: &str) -> String {
    let slug = text.to_lowercase();
    let slug = SLUG_DROP.replace_all(&slug, "");
    let slug = SLUG_SEP.replace_all(&slug, "-");
    let slug: String = slug.trim_matches('-').chars().take(SLUG_MAX).collect();
    slug.trim_end_matches('-').to_string()
}

/// Recipe file written next to a committed artefact.
#[derive(Debug, Clone, Serialize)]
pub struct TrackRecord {
    #[serde(flatten)]
    pub params: TrackParams,
    pub reaction: String,
    pub favorited: bool,
    pub generation_time_s: f64,
    pub audio_duration_s: Option<f64>,
    pub file_size_bytes: Option<u64>,
    pub realtime_ratio: Option<f64>,
}

/// One line of `metrics.jsonl`.
#[derive(Debug, Clone, Serialize)]
pub struct MetricEntry {
    pub track_id: TrackId,
    pub radio: String,
    pub timestamp: DateTime<Utc>,
    pub generation_time_s: f64,
    pub audio_duration_s: Option<f64>,
    pub file_size_bytes: Option<u64>,
    pub realtime_ratio: Option<f64>,
    pub tags: String,
    pub bpm: u16,
    pub instrumental: bool,
}

impl From<&TrackRecord> for MetricEntry {
    fn from(record: &TrackRecord) -> Self {
        Self {
            track_id: record.params.id,
            radio: record.params.radio.clone(),
            timestamp: Utc::now(),
            generation_time_s: record.generation_time_s,
            audio_duration_s: record.audio_duration_s,
            file_size_bytes: record.file_size_bytes,
            realtime_ratio: record.realtime_ratio,
            tags: record.params.recipe.tags.clone(),
            bpm: record.params.recipe.bpm,
            instrumental: record.params.recipe.instrumental,
        }
    }
}

pub fn recipe_path(artifact: &Path) -> PathBuf {
    artifact.with_extension("json")
}

/// Merges `updates` into the recipe file next to `artifact`.
pub fn update_recipe(artifact: &Path, updates: Value) -> Result<()> {
    let path = recipe_path(artifact);
    let mut recipe: Map<String, Value> = serde_json::from_str(&fs::read_to_string(&path)?)?;
    if let Value::Object(updates) = updates {
        recipe.extend(updates);
    }
    fs::write(&path, serde_json::to_string_pretty(&recipe)?)?;
    Ok(())
}

/// Human delay since `then`: "just now", "5m ago", "3h ago", "2d ago", "Mar 04".
pub fn format_last_played(then: SystemTime, now: SystemTime) -> String {
    let delta = now.duration_since(then).map(|d| d.as_secs()).unwrap_or(0);
    match delta {
        d if d < 60 => "just now".to_string(),
        d if d < 3600 => format!("{}m ago", d / 60),
        d if d < 86_400 => format!("{}h ago", d / 3600),
        d if d < 86_400 * 7 => format!("{}d ago", d / 86_400),
        _ => DateTime::<Local>::from(then).format("%b %d").to_string(),
    }
}

#[derive(Debug, Clone)]
pub struct Station {
    name: String,
    root: PathBuf,
    tracks_dir: PathBuf,
    favorites_dir: PathBuf,
    taste: TasteStore,
}

impl Station {
    /// Opens (and creates when needed) the station directory.
    pub fn open(radios_dir: &Path, name: &str) -> Result<Self> {
        let clean = clean_radio_name(name);
        if clean.is_empty() || clean != name {
            return Err(Error::InvalidRadioName(name.to_string()));
        }
        let root = radios_dir.join(name);
        let station = Self {
            name: name.to_string(),
            tracks_dir: root.join("tracks"),
            favorites_dir: root.join("favorites"),
            taste: TasteStore::new(&root),
            root,
        };
        station.ensure_dirs()?;
        Ok(station)
    }

    fn ensure_dirs(&self) -> Result<()> {
        fs::create_dir_all(&self.tracks_dir)?;
        fs::create_dir_all(&self.favorites_dir)?;
        Ok(())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn tracks_dir(&self) -> &Path {
        &self.tracks_dir
    }

    pub fn favorites_dir(&self) -> &Path {
        &self.favorites_dir
    }

    pub fn taste(&self) -> &TasteStore {
        &self.taste
    }

    pub fn is_first_run(&self) -> bool {
        !self.taste.exists()
    }

    pub fn next_track_id(&self) -> TrackId {
        TrackId(self.taste.generation_count() + 1)
    }

    /// `tracks/NNN-slug.mp3`
    pub fn artifact_path(&self, params: &TrackParams) -> PathBuf {
        let mut slug = slugify(&params.recipe.tags);
        if slug.is_empty() {
            slug = "track".to_string();
        }
        self.tracks_dir.join(format!("{}-{}.mp3", params.id, slug))
    }

    pub fn write_record(&self, artifact: &Path, record: &TrackRecord) -> Result<()> {
        fs::write(recipe_path(artifact), serde_json::to_string_pretty(record)?)?;
        Ok(())
    }

    /// Copies the artefact and its recipe into `favorites/`.
    pub fn mark_favorite(&self, artifact: &Path) -> Result<PathBuf> {
        let file_name = artifact
            .file_name()
            .ok_or_else(|| Error::other(format!("not a file: {}", artifact.display())))?;
        let dest = self.favorites_dir.join(file_name);
        fs::copy(artifact, &dest)?;
        let recipe = recipe_path(artifact);
        if recipe.exists() {
            fs::copy(&recipe, recipe_path(&dest))?;
        }
        Ok(dest)
    }

    fn mp3s(dir: &Path) -> Vec<(PathBuf, SystemTime)> {
        let Ok(entries) = fs::read_dir(dir) else {
            return Vec::new();
        };
        entries
            .flatten()
            .map(|e| e.path())
            .filter(|p| p.extension().is_some_and(|e| e == "mp3"))
            .filter_map(|p| {
                let mtime = fs::metadata(&p).and_then(|m| m.modified()).ok()?;
                Some((p, mtime))
            })
            .collect()
    }

    pub fn track_count(&self) -> usize {
        Self::mp3s(&self.tracks_dir).len()
    }

    pub fn favorite_count(&self) -> usize {
        Self::mp3s(&self.favorites_dir).len()
    }

    pub fn last_played(&self) -> String {
        Self::mp3s(&self.tracks_dir)
            .into_iter()
            .map(|(_, mtime)| mtime)
            .max()
            .map(|mtime| format_last_played(mtime, SystemTime::now()))
            .unwrap_or_else(|| "never".to_string())
    }

    /// Most recent tracks first, with their recipe. Unreadable recipes are skipped.
    pub fn history(&self, limit: usize) -> Vec<Value> {
        let mut tracks = Self::mp3s(&self.tracks_dir);
        tracks.sort_by(|a, b| b.1.cmp(&a.1));
        tracks
            .into_iter()
            .filter_map(|(mp3, _)| {
                let raw = fs::read_to_string(recipe_path(&mp3)).ok()?;
                let mut recipe: Map<String, Value> = match serde_json::from_str(&raw) {
                    Ok(recipe) => recipe,
                    Err(err) => {
                        debug!(track = %mp3.display(), "skipping unreadable recipe: {err}");
                        return None;
                    }
                };
                let file = mp3.file_name()?.to_string_lossy().to_string();
                recipe.insert(
                    "audio_url".into(),
                    Value::String(format!("/audio/{}/{}", self.name, file)),
                );
                recipe.insert("file".into(), Value::String(file));
                Some(Value::Object(recipe))
            })
            .take(limit)
            .collect()
    }

    /// Resolves a bare file name in `tracks/` or `favorites/`.
    pub fn audio_file(&self, file: &str) -> Option<PathBuf> {
        if file.is_empty() || file.contains("..") || file.contains('/') || file.contains('\\') {
            return None;
        }
        [&self.tracks_dir, &self.favorites_dir]
            .into_iter()
            .map(|dir| dir.join(file))
            .find(|p| p.is_file())
    }

    pub fn disk_free_mb(&self) -> Option<f64> {
        pmoutils::free_space_mb(&self.tracks_dir)
    }

    /// Wipes taste, tracks and favourites. The station is back to first run.
    pub fn full_reset(&self) -> Result<()> {
        self.taste.remove().map_err(|e| Error::other(e.to_string()))?;
        for dir in [&self.tracks_dir, &self.favorites_dir] {
            if dir.exists() {
                fs::remove_dir_all(dir)?;
            }
        }
        self.ensure_dirs()
    }

    pub fn summary(&self, current: &str) -> RadioSummary {
        RadioSummary {
            name: self.name.clone(),
            track_count: self.track_count(),
            favorite_count: self.favorite_count(),
            generation_count: self.taste.generation_count(),
            last_played: self.last_played(),
            is_current: self.name == current,
        }
    }
}

/// Lists, selects and deletes stations under a radios directory.
#[derive(Debug, Clone)]
pub struct StationManager {
    radios_dir: PathBuf,
}

impl StationManager {
    pub fn new(radios_dir: impl Into<PathBuf>) -> Result<Self> {
        let radios_dir = radios_dir.into();
        fs::create_dir_all(&radios_dir)?;
        Ok(Self { radios_dir })
    }

    pub fn radios_dir(&self) -> &Path {
        &self.radios_dir
    }

    pub fn list(&self) -> Vec<String> {
        let Ok(entries) = fs::read_dir(&self.radios_dir) else {
            return Vec::new();
        };
        let mut names: Vec<String> = entries
            .flatten()
            .filter(|e| e.path().is_dir())
            .map(|e| e.file_name().to_string_lossy().to_string())
            .filter(|n| !n.starts_with('.'))
            .collect();
        names.sort();
        names
    }

    pub fn exists(&self, name: &str) -> bool {
        !name.is_empty() && self.radios_dir.join(name).is_dir()
    }

    fn current_name(&self) -> Option<String> {
        let name = fs::read_to_string(self.radios_dir.join(CURRENT_FILE)).ok()?;
        let name = name.trim().to_string();
        self.exists(&name).then_some(name)
    }

    fn set_current(&self, name: &str) -> Result<()> {
        fs::write(self.radios_dir.join(CURRENT_FILE), name)?;
        Ok(())
    }

    /// Selected station, falling back to (and selecting) `default`.
    pub fn current(&self) -> Result<Station> {
        if let Some(name) = self.current_name() {
            if let Ok(station) = Station::open(&self.radios_dir, &name) {
                return Ok(station);
            }
        }
        self.switch_to(DEFAULT_STATION)
    }

    /// Opens an existing station without selecting it.
    pub fn open(&self, name: &str) -> Result<Station> {
        if !self.exists(name) {
            return Err(Error::InvalidRadioName(name.to_string()));
        }
        Station::open(&self.radios_dir, name)
    }

    /// Selects `name`, creating it when it does not exist yet.
    pub fn switch_to(&self, name: &str) -> Result<Station> {
        let station = Station::open(&self.radios_dir, name)?;
        self.set_current(station.name())?;
        Ok(station)
    }

    /// Removes a station. When it was selected, `default` becomes current.
    pub fn delete(&self, name: &str) -> Result<()> {
        if clean_radio_name(name) != name || name.is_empty() {
            return Err(Error::InvalidRadioName(name.to_string()));
        }
        let path = self.radios_dir.join(name);
        if path.exists() {
            fs::remove_dir_all(&path)?;
        }
        if self.current_name().is_none() {
            self.set_current(DEFAULT_STATION)?;
        }
        Ok(())
    }

    pub fn summaries(&self) -> Vec<RadioSummary> {
        let current = self.current_name().unwrap_or_default();
        self.list()
            .iter()
            .filter_map(|name| Station::open(&self.radios_dir, name).ok())
            .map(|station| station.summary(&current))
            .collect()
    }

    /// Appends one line to `metrics.jsonl`; failures are only logged.
    pub fn append_metric(&self, entry: &MetricEntry) {
        let path = self.radios_dir.join(METRICS_FILE);
        let line = match serde_json::to_string(entry) {
            Ok(line) => line,
            Err(err) => {
                warn!("cannot serialize metric: {err}");
                return;
            }
        };
        let written = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .and_then(|mut f| writeln!(f, "{line}"));
        if let Err(err) = written {
            warn!(path = %path.display(), "cannot append metric: {err}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::RawRecipe;
    use serde_json::json;
    use std::time::Duration;

    fn params(station: &Station, tags: &str) -> TrackParams {
        let raw: RawRecipe = serde_json::from_value(json!({"tags": tags})).unwrap();
        TrackParams::stamp(raw.validate(), station.next_track_id(), station.name(), "")
    }

    #[test]
    fn test_slugify() {
        assert_eq!(slugify("Lo-Fi, Chill Hop, 808!"), "lo-fi-chill-hop-808");
        let long = slugify(&"ambient, ".repeat(20));
        assert!(long.len() <= 40);
        assert!(!long.ends_with('-'));
    }

    #[test]
    fn test_current_defaults_and_switch() {
        let dir = tempfile::tempdir().unwrap();
        let manager = StationManager::new(dir.path()).unwrap();
        assert_eq!(manager.current().unwrap().name(), DEFAULT_STATION);

        let jazz = manager.switch_to("jazz").unwrap();
        assert!(jazz.is_first_run());
        assert!(jazz.tracks_dir().is_dir());
        assert_eq!(manager.current().unwrap().name(), "jazz");
        assert_eq!(manager.list(), vec!["default", "jazz"]);

        manager.delete("jazz").unwrap();
        assert_eq!(manager.current().unwrap().name(), DEFAULT_STATION);
        assert_eq!(manager.list(), vec!["default"]);
    }

    #[test]
    fn test_invalid_names_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let manager = StationManager::new(dir.path()).unwrap();
        assert!(manager.switch_to("../escape").is_err());
        assert!(manager.switch_to("").is_err());
        assert!(manager.delete("..").is_err());
        assert!(manager.open("missing").is_err());
    }

    #[test]
    fn test_artifact_naming_and_favorite() {
        let dir = tempfile::tempdir().unwrap();
        let manager = StationManager::new(dir.path()).unwrap();
        let station = manager.current().unwrap();
        let p = params(&station, "Deep House, Synth Bass");
        let artifact = station.artifact_path(&p);
        assert_eq!(
            artifact.file_name().unwrap().to_str().unwrap(),
            "001-deep-house-synth-bass.mp3"
        );

        fs::write(&artifact, b"mp3").unwrap();
        let record = TrackRecord {
            params: p,
            reaction: "neutral".into(),
            favorited: false,
            generation_time_s: 30.0,
            audio_duration_s: Some(120.0),
            file_size_bytes: Some(3),
            realtime_ratio: Some(4.0),
        };
        station.write_record(&artifact, &record).unwrap();
        update_recipe(&artifact, json!({"reaction": "liked", "favorited": true})).unwrap();

        let fav = station.mark_favorite(&artifact).unwrap();
        assert!(fav.exists());
        let saved: Value =
            serde_json::from_str(&fs::read_to_string(recipe_path(&fav)).unwrap()).unwrap();
        assert_eq!(saved["reaction"], "liked");
        assert_eq!(saved["tags"], "deep house, synth bass");
        assert_eq!(station.favorite_count(), 1);

        let summary = station.summary("default");
        assert!(summary.is_current);
        assert_eq!(summary.track_count, 1);
        assert_eq!(summary.last_played, "just now");
    }

    #[test]
    fn test_history_newest_first_skips_broken() {
        let dir = tempfile::tempdir().unwrap();
        let station = StationManager::new(dir.path()).unwrap().current().unwrap();
        for (name, body) in [("001-a", "{\"id\":1}"), ("002-b", "broken"), ("003-c", "{\"id\":3}")] {
            let mp3 = station.tracks_dir().join(format!("{name}.mp3"));
            fs::write(&mp3, b"x").unwrap();
            fs::write(recipe_path(&mp3), body).unwrap();
            std::thread::sleep(Duration::from_millis(20));
        }

        let history = station.history(10);
        assert_eq!(history.len(), 2);
        assert_eq!(history[0]["id"], 3);
        assert_eq!(history[0]["audio_url"], "/audio/default/003-c.mp3");
        assert_eq!(station.history(1).len(), 1);
    }

    #[test]
    fn test_history_limit_counts_listed_tracks_only() {
        let dir = tempfile::tempdir().unwrap();
        let station = StationManager::new(dir.path()).unwrap().current().unwrap();
        for (name, recipe) in [("001-a", true), ("002-b", true), ("003-c", false), ("004-d", false)] {
            let mp3 = station.tracks_dir().join(format!("{name}.mp3"));
            fs::write(&mp3, b"x").unwrap();
            if recipe {
                fs::write(recipe_path(&mp3), format!("{{\"file_id\":\"{name}\"}}")).unwrap();
            }
            std::thread::sleep(Duration::from_millis(20));
        }

        // the two newest mp3s have no recipe yet
        let history = station.history(2);
        assert_eq!(history.len(), 2);
        assert_eq!(history[0]["file"], "002-b.mp3");
        assert_eq!(history[1]["file"], "001-a.mp3");
    }

    #[test]
    fn test_audio_file_rejects_traversal() {
        let dir = tempfile::tempdir().unwrap();
        let station = StationManager::new(dir.path()).unwrap().current().unwrap();
        fs::write(station.favorites_dir().join("001-x.mp3"), b"x").unwrap();
        assert!(station.audio_file("001-x.mp3").is_some());
        assert!(station.audio_file("../taste.json").is_none());
        assert!(station.audio_file("tracks/001-x.mp3").is_none());
    }

    #[test]
    fn test_full_reset_returns_to_first_run() {
        let dir = tempfile::tempdir().unwrap();
        let station = StationManager::new(dir.path()).unwrap().current().unwrap();
        station.taste().note("jazz").unwrap();
        fs::write(station.tracks_dir().join("001-x.mp3"), b"x").unwrap();

        station.full_reset().unwrap();
        assert!(station.is_first_run());
        assert_eq!(station.track_count(), 0);
        assert!(station.tracks_dir().is_dir());
    }

    #[test]
    fn test_last_played_format() {
        let now = SystemTime::now();
        let ago = |secs| now - Duration::from_secs(secs);
        assert_eq!(format_last_played(ago(5), now), "just now");
        assert_eq!(format_last_played(ago(300), now), "5m ago");
        assert_eq!(format_last_played(ago(7200), now), "2h ago");
        assert_eq!(format_last_played(ago(86_400 * 3), now), "3d ago");
        assert_eq!(format_last_played(ago(86_400 * 30), now).len(), 6);
    }

    #[test]
    fn test_metrics_append() {
        let dir = tempfile::tempdir().unwrap();
        let manager = StationManager::new(dir.path()).unwrap();
        let station = manager.current().unwrap();
        let record = TrackRecord {
            params: params(&station, "x"),
            reaction: "neutral".into(),
            favorited: false,
            generation_time_s: 10.0,
            audio_duration_s: None,
            file_size_bytes: None,
            realtime_ratio: None,
        };
        manager.append_metric(&MetricEntry::from(&record));
        manager.append_metric(&MetricEntry::from(&record));
        let body = fs::read_to_string(dir.path().join(METRICS_FILE)).unwrap();
        assert_eq!(body.lines().count(), 2);
        assert!(body.contains("\"track_id\":1"));
    }
}
