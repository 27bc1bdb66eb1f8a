//! Event fan-out towards presentation layers.
//!
//! The engine pushes [`RadioEvent`]s into an [`EventSink`] and never reads
//! anything back. Subscribers get their own bounded queue; a subscriber that
//! falls behind loses its oldest events (it sees
//! `RecvError::Lagged`) and the engine is never blocked.

use crate::clock::PlaybackSnapshot;
use crate::params::{TrackId, TrackParams};
use crate::reaction::Reaction;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::trace;

/// Per-subscriber queue length.
pub const DEFAULT_EVENT_CAPACITY: usize = 50;

/// Track as shown to listeners.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NowPlaying {
    pub id: TrackId,
    pub tags: String,
    pub bpm: u16,
    pub key_scale: String,
    pub time_signature: u8,
    pub instrumental: bool,
    pub rationale: String,
    pub radio: String,
    pub audio_url: String,
    pub duration: Option<f64>,
    pub lyrics: String,
}

impl NowPlaying {
    pub fn new(params: &TrackParams, file_name: &str, duration: Option<f64>) -> Self {
        let recipe = &params.recipe;
        Self {
            id: params.id,
            tags: recipe.tags.clone(),
            bpm: recipe.bpm,
            key_scale: recipe.key_scale.clone(),
            time_signature: recipe.time_signature,
            instrumental: recipe.instrumental,
            rationale: recipe.rationale.clone(),
            radio: params.radio.clone(),
            audio_url: format!("/audio/{}/{}", params.radio, file_name),
            duration,
            lyrics: recipe.display_lyrics().to_string(),
        }
    }
}

/// Subset of the recipe announced when rendering starts.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GenerationSummary {
    pub id: TrackId,
    pub tags: String,
    pub bpm: u16,
    pub key_scale: String,
    pub time_signature: u8,
    pub instrumental: bool,
    pub rationale: String,
}

impl From<&TrackParams> for GenerationSummary {
    fn from(params: &TrackParams) -> Self {
        let recipe = &params.recipe;
        Self {
            id: params.id,
            tags: recipe.tags.clone(),
            bpm: recipe.bpm,
            key_scale: recipe.key_scale.clone(),
            time_signature: recipe.time_signature,
            instrumental: recipe.instrumental,
            rationale: recipe.rationale.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RadioSummary {
    pub name: String,
    pub track_count: usize,
    pub favorite_count: usize,
    pub generation_count: u32,
    pub last_played: String,
    pub is_current: bool,
}

/// Full engine state, sent to a client when it connects.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EngineSnapshot {
    pub radio_name: String,
    pub now_playing: Option<NowPlaying>,
    pub playback: PlaybackSnapshot,
    pub is_first_run: bool,
    pub generating: bool,
    pub sleep_remaining: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum RadioEvent {
    Sync(EngineSnapshot),
    NowPlaying(NowPlaying),
    TrackInfo(NowPlaying),
    PlaybackState(PlaybackSnapshot),
    Tick {
        elapsed: f64,
        duration: Option<f64>,
    },
    Thinking,
    GenerationStart {
        params: GenerationSummary,
        warnings: Vec<String>,
    },
    GenerationProgress {
        elapsed: f64,
    },
    GenerationDone,
    ReactionFeedback(Reaction),
    Regenerating {
        reason: String,
    },
    Toast {
        message: String,
    },
    Error {
        stage: String,
        message: String,
    },
    Waiting {
        message: String,
    },
    DiskFull {
        free_mb: f64,
    },
    SleepSet {
        minutes: u32,
        remaining: String,
    },
    SleepCancelled,
    SleepStatus {
        active: bool,
        remaining: Option<String>,
    },
    SleepExpired,
    FirstRun {
        radio: String,
    },
    RadioSwitched {
        name: String,
        is_new: bool,
    },
    RadioList {
        radios: Vec<RadioSummary>,
        current: String,
    },
    History {
        radio: String,
        tracks: Vec<serde_json::Value>,
    },
}

impl RadioEvent {
    pub fn toast(message: impl Into<String>) -> Self {
        Self::Toast {
            message: message.into(),
        }
    }

    pub fn error(stage: &str, message: impl Into<String>) -> Self {
        Self::Error {
            stage: stage.to_string(),
            message: message.into(),
        }
    }
}

/// Event stamped with its emission time.
#[derive(Debug, Clone, Serialize)]
pub struct EventEnvelope {
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub event: RadioEvent,
}

impl EventEnvelope {
    pub fn new(event: RadioEvent) -> Self {
        Self {
            timestamp: Utc::now(),
            event,
        }
    }
}

/// Fire-and-forget broadcaster.
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: broadcast::Sender<EventEnvelope>,
}

impl Default for EventSink {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}

impl EventSink {
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn broadcast(&self, event: RadioEvent) {
        let envelope = EventEnvelope::new(event);
        // no subscriber is not an error
        if let Err(err) = self.tx.send(envelope) {
            trace!("event dropped, no subscriber: {:?}", err.0.event);
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EventEnvelope> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::broadcast::error::RecvError;

    #[test]
    fn test_event_wire_format() {
        let envelope = EventEnvelope {
            timestamp: Utc::now(),
            event: RadioEvent::DiskFull { free_mb: 12.5 },
        };
        let value = serde_json::to_value(&envelope).unwrap();
        assert_eq!(value["type"], "disk_full");
        assert_eq!(value["data"]["free_mb"], 12.5);
        assert!(value.get("timestamp").is_some());

        let value = serde_json::to_value(RadioEvent::Thinking).unwrap();
        assert_eq!(value["type"], "thinking");
    }

    #[tokio::test]
    async fn test_broadcast_without_subscribers_is_silent() {
        let sink = EventSink::new(4);
        sink.broadcast(RadioEvent::GenerationDone);
        assert_eq!(sink.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_slow_subscriber_loses_oldest() {
        let sink = EventSink::new(2);
        let mut rx = sink.subscribe();
        for i in 0..4 {
            sink.broadcast(RadioEvent::GenerationProgress { elapsed: i as f64 });
        }

        assert!(matches!(rx.recv().await, Err(RecvError::Lagged(2))));
        let next = rx.recv().await.unwrap();
        assert_eq!(next.event, RadioEvent::GenerationProgress { elapsed: 2.0 });
    }
}
