//! Audio rendering through an ACE-Step 1.5 server (OpenAI-style chat API).
//!
//! The server answers with the whole track inlined as a base64 `data:` URL.
//! Only the HTTP exchange races the cancellation token; the bytes are then
//! written to the partial path and renamed into place by one awaited job.

use super::{BackendStatus, TrackRenderer};
use crate::error::RenderError;
use crate::generation::partial_path;
use crate::params::TrackParams;
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde::Deserialize;
use serde_json::{json, Value};
use std::path::Path;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

pub const DEFAULT_HOST: &str = "http://localhost:8001";
pub const DEFAULT_MODEL: &str = "acemusic/acestep-v15-turbo";
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(600);
pub const DEFAULT_DURATION_S: u32 = 120;

const HEALTH_TIMEOUT: Duration = Duration::from_secs(5);
const BODY_EXCERPT: usize = 200;

#[derive(Debug, Deserialize)]
struct Completion {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: CompletionMessage,
}

#[derive(Debug, Deserialize)]
struct CompletionMessage {
    #[serde(default)]
    audio: Vec<AudioPart>,
}

#[derive(Debug, Deserialize)]
struct AudioPart {
    audio_url: AudioUrl,
}

#[derive(Debug, Deserialize)]
struct AudioUrl {
    url: String,
}

pub struct AceStepRenderer {
    client: reqwest::Client,
    host: String,
    model: String,
    duration_s: u32,
    timeout: Duration,
}

impl AceStepRenderer {
    pub fn new(host: &str, model: &str, duration_s: u32, timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            host: host.trim_end_matches('/').to_string(),
            model: model.to_string(),
            duration_s,
            timeout,
        })
    }

    fn payload(&self, params: &TrackParams) -> Value {
        let recipe = &params.recipe;
        let time_signature = match recipe.time_signature {
            3 => "3/4".to_string(),
            6 => "6/8".to_string(),
            4 => "4/4".to_string(),
            other => format!("{other}/4"),
        };
        let mut audio_config = json!({
            "duration": self.duration_s,
            "instrumental": recipe.instrumental,
            "bpm": recipe.bpm,
            "key_scale": recipe.key_scale,
            "time_signature": time_signature,
        });
        let mut content = format!("<prompt>{}</prompt>", recipe.tags);
        if !recipe.instrumental {
            audio_config["vocal_language"] = json!(recipe.vocal_language);
            content.push_str(&format!("<lyrics>{}</lyrics>", recipe.lyrics));
        }
        json!({
            "model": self.model,
            "messages": [{"role": "user", "content": content}],
            "audio_config": audio_config,
            "seed": recipe.seed,
        })
    }

    fn transport_error(&self, err: reqwest::Error) -> RenderError {
        if err.is_timeout() {
            RenderError::Timeout(self.timeout)
        } else {
            RenderError::Transport(err)
        }
    }

    /// Asks the server for the track and decodes the inlined audio.
    async fn fetch_audio(&self, params: &TrackParams) -> Result<Vec<u8>, RenderError> {
        let payload = self.payload(params);
        debug!(track_id = %params.id, "ACE-Step request");

        let response = self
            .client
            .post(format!("{}/v1/chat/completions", self.host))
            .json(&payload)
            .send()
            .await
            .map_err(|e| self.transport_error(e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(RenderError::Status {
                status: status.as_u16(),
                body: body.chars().take(BODY_EXCERPT).collect(),
            });
        }

        let completion: Completion = response.json().await.map_err(|e| {
            if e.is_timeout() {
                RenderError::Timeout(self.timeout)
            } else {
                RenderError::Malformed(e.to_string())
            }
        })?;
        let url = completion
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.audio.into_iter().next())
            .map(|a| a.audio_url.url)
            .ok_or_else(|| RenderError::Malformed("returned no audio".to_string()))?;
        decode_data_url(&url)
    }
}

/// Decodes `data:<mime>;base64,<payload>`.
pub fn decode_data_url(url: &str) -> Result<Vec<u8>, RenderError> {
    let excerpt: String = url.chars().take(80).collect();
    let rest = url
        .strip_prefix("data:")
        .ok_or_else(|| RenderError::Malformed(format!("unexpected audio format: {excerpt}")))?;
    let (_, payload) = rest
        .split_once(',')
        .ok_or_else(|| RenderError::Malformed(format!("unexpected audio format: {excerpt}")))?;
    STANDARD
        .decode(payload.trim())
        .map_err(|err| RenderError::Malformed(format!("invalid base64 audio: {err}")))
}

/// Writes the partial file and renames it in one blocking job, awaited to
/// the end: once this returns no write to `destination` is pending.
async fn persist(destination: &Path, bytes: Vec<u8>) -> Result<(), RenderError> {
    let destination = destination.to_path_buf();
    tokio::task::spawn_blocking(move || -> std::io::Result<()> {
        if let Some(parent) = destination.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let partial = partial_path(&destination);
        std::fs::write(&partial, &bytes)?;
        std::fs::rename(&partial, &destination)
    })
    .await
    .map_err(|err| RenderError::Io(std::io::Error::other(err)))??;
    Ok(())
}

#[async_trait]
impl TrackRenderer for AceStepRenderer {
    async fn render(
        &self,
        params: &TrackParams,
        destination: &Path,
        cancel: &CancellationToken,
    ) -> Result<(), RenderError> {
        let bytes = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(RenderError::Cancelled),
            bytes = self.fetch_audio(params) => bytes?,
        };
        if cancel.is_cancelled() {
            return Err(RenderError::Cancelled);
        }
        let size = bytes.len();
        persist(destination, bytes).await?;

        info!(
            track_id = %params.id,
            bytes = size,
            "Track rendered to {}",
            destination.display()
        );
        Ok(())
    }

    async fn health(&self) -> BackendStatus {
        match self
            .client
            .get(format!("{}/health", self.host))
            .timeout(HEALTH_TIMEOUT)
            .send()
            .await
        {
            Ok(r) if r.status().is_success() => BackendStatus::up(),
            Ok(r) => BackendStatus::down(format!("HTTP {}", r.status())),
            Err(err) => BackendStatus::down(err.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::{RawRecipe, TrackId};

    fn renderer() -> AceStepRenderer {
        AceStepRenderer::new(DEFAULT_HOST, DEFAULT_MODEL, 90, DEFAULT_TIMEOUT).unwrap()
    }

    fn params(value: Value) -> TrackParams {
        let raw: RawRecipe = serde_json::from_value(value).unwrap();
        TrackParams::stamp(raw.validate(), TrackId(4), "default", "")
    }

    #[test]
    fn test_instrumental_payload() {
        let p = params(json!({"tags": "ambient, synth pad", "bpm": 80, "time_signature": 6, "seed": 7}));
        let payload = renderer().payload(&p);
        assert_eq!(payload["model"], DEFAULT_MODEL);
        assert_eq!(payload["seed"], 7);
        assert_eq!(payload["messages"][0]["content"], "<prompt>ambient, synth pad</prompt>");
        assert_eq!(payload["audio_config"]["duration"], 90);
        assert_eq!(payload["audio_config"]["time_signature"], "6/8");
        assert!(payload["audio_config"].get("vocal_language").is_none());
    }

    #[test]
    fn test_vocal_payload_carries_lyrics() {
        let p = params(json!({"tags": "pop, female vocal", "instrumental": false,
                              "lyrics": "[Verse 1]\nhello", "vocal_language": "fr"}));
        let payload = renderer().payload(&p);
        assert_eq!(
            payload["messages"][0]["content"],
            "<prompt>pop, female vocal</prompt><lyrics>[Verse 1]\nhello</lyrics>"
        );
        assert_eq!(payload["audio_config"]["vocal_language"], "fr");
        assert_eq!(payload["audio_config"]["instrumental"], false);
    }

    #[test]
    fn test_decode_data_url() {
        assert_eq!(decode_data_url("data:audio/mpeg;base64,SUQz").unwrap(), b"ID3");
        assert!(matches!(
            decode_data_url("https://cdn/x.mp3"),
            Err(RenderError::Malformed(_))
        ));
        assert!(decode_data_url("data:audio/mpeg;base64,@@@").is_err());
    }
}
