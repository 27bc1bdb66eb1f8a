//! Recipe generation through a local Ollama server.
//!
//! One `POST /api/chat` per attempt, three attempts, the last two with a
//! stricter instruction. Whatever the model answers goes through
//! [`RawRecipe::validate`]; when no attempt yields a JSON object the
//! [keyword fallback](super::keyword_recipe) takes over, so
//! [`ParamsGenerator::generate`] only fails on programming errors.

use super::{keyword_recipe, BackendStatus, ParamsGenerator, ParamsRequest};
use crate::params::{inject_vocal_preference, RawRecipe, TrackRecipe};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;
use tracing::{debug, info, warn};

pub const DEFAULT_HOST: &str = "http://localhost:11434";
pub const DEFAULT_MODEL: &str = "llama3.2:3b";
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(90);

const ATTEMPTS: usize = 3;
const TEMPERATURE: f64 = 0.8;

const STRICT_SUFFIX: &str = "\n\nCRITICAL: Output ONLY the JSON object. No words before or after. Start with { and end with }.";

const SYSTEM_PROMPT: &str = r#"You are the music director of a personal radio station that never repeats itself.
From the listener's taste profile and latest message, choose the NEXT track and answer with one JSON object, nothing else.

Fields:
{
  "tags": "comma-separated tags, in this order: genre (1-2), mood (1-3), instruments (2-4), vocal type (exactly 1), texture (0-2)",
  "lyrics": "song lyrics with section markers, or \"[inst]\" for an instrumental",
  "bpm": <integer 60-180>,
  "key_scale": "<note> <Major|Minor>, e.g. \"F# Minor\"",
  "time_signature": <3|4|6>,
  "vocal_language": "en",
  "instrumental": <true|false>,
  "rationale": "one sentence on what you are doing and why"
}

Vocal type is one of: male vocal, female vocal, male rap, female rap, vocal harmony, vocal chops, spoken word, instrumental.
Use 7 to 12 tags. Never put tempo or key words in tags.

Lyrics: markers such as [Intro], [Verse 1], [Chorus], [Bridge], [Outro], [Instrumental Break];
two to four short lines per section; performance hints go in the marker ([Chorus - anthemic]).

Rules:
- liked tracks: keep what worked and evolve it a little
- "reset" or "something different": make a bold departure
- modifiers like "more bass" or "slower": apply them literally
- explicit preferences in the profile always apply
- the BPM follows the genre (house ~125, jazz ~90, trap ~140)

Example:
{"tags": "deep house, hypnotic, groovy, synth bass, drums, synth pad, instrumental, warm", "lyrics": "[inst]", "bpm": 124, "key_scale": "G Minor", "time_signature": 4, "vocal_language": "en", "instrumental": true, "rationale": "Hypnotic house groove with a warm analog feel"}
"#;

#[derive(Debug, Deserialize)]
struct ChatResponse {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    content: String,
}

#[derive(Debug, Deserialize)]
struct TagsResponse {
    #[serde(default)]
    models: Vec<ModelEntry>,
}

#[derive(Debug, Deserialize)]
struct ModelEntry {
    name: String,
}

pub struct OllamaParams {
    client: reqwest::Client,
    host: String,
    model: String,
}

impl OllamaParams {
    pub fn new(host: &str, model: &str, timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            host: host.trim_end_matches('/').to_string(),
            model: model.to_string(),
        })
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    async fn chat(&self, content: &str) -> anyhow::Result<String> {
        let body = json!({
            "model": self.model,
            "messages": [
                {"role": "system", "content": SYSTEM_PROMPT},
                {"role": "user", "content": content},
            ],
            "stream": false,
            "options": {"temperature": TEMPERATURE},
        });
        let response: ChatResponse = self
            .client
            .post(format!("{}/api/chat", self.host))
            .json(&body)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(response.message.content.trim().to_string())
    }
}

/// Prompt body: taste profile, last track, recent patterns, listener message.
pub fn build_context(request: &ParamsRequest) -> String {
    let mut parts = vec!["=== TASTE PROFILE ===".to_string(), request.taste_context.clone()];

    if let Some(last) = &request.last {
        parts.push("\n=== LAST TRACK ===".to_string());
        let mut info = json!({
            "tags": last.tags,
            "bpm": last.bpm,
            "key_scale": last.key_scale,
            "instrumental": last.instrumental,
            "rationale": last.rationale,
        });
        if let Some(vocal) = last.vocal_type() {
            info["vocal_type"] = json!(vocal);
        }
        parts.push(serde_json::to_string_pretty(&info).unwrap_or_default());
    }

    if request.recent.len() > 1 {
        parts.push("\n=== RECENT TRACK PATTERNS (avoid repeating) ===".to_string());
        let skip = request.recent.len().saturating_sub(3);
        parts.extend(request.recent[skip..].iter().map(|r| format!("  {}", r.summary())));
    }

    let message = if request.message.trim().is_empty() {
        "(no message, keep evolving the sound)"
    } else {
        request.message.as_str()
    };
    parts.push(format!("\n=== USER MESSAGE ===\n{message}"));
    parts.push("\n=== YOUR RESPONSE (JSON only) ===".to_string());
    parts.join("\n")
}

/// First JSON object in a model answer: the whole text, or the first
/// balanced `{...}` block that parses.
pub fn extract_json_object(raw: &str) -> Option<serde_json::Value> {
    if let Ok(value @ serde_json::Value::Object(_)) = serde_json::from_str::<serde_json::Value>(raw) {
        return Some(value);
    }
    let mut depth = 0usize;
    let mut start = None;
    for (i, ch) in raw.char_indices() {
        match ch {
            '{' => {
                if depth == 0 {
                    start = Some(i);
                }
                depth += 1;
            }
            '}' if depth > 0 => {
                depth -= 1;
                if depth == 0 {
                    if let Some(s) = start.take() {
                        if let Ok(value @ serde_json::Value::Object(_)) =
                            serde_json::from_str::<serde_json::Value>(&raw[s..=i])
                        {
                            return Some(value);
                        }
                    }
                }
            }
            _ => {}
        }
    }
    None
}

#[async_trait]
impl ParamsGenerator for OllamaParams {
    async fn generate(&self, request: &ParamsRequest) -> anyhow::Result<TrackRecipe> {
        let context = build_context(request);

        for attempt in 0..ATTEMPTS {
            let content = if attempt == 0 {
                context.clone()
            } else {
                format!("{context}{STRICT_SUFFIX}")
            };
            let raw = match self.chat(&content).await {
                Ok(raw) => raw,
                Err(err) => {
                    warn!(attempt, model = %self.model, "Ollama call failed: {err}");
                    continue;
                }
            };
            let Some(value) = extract_json_object(&raw) else {
                debug!(attempt, "no JSON object in model answer: {raw:.120}");
                continue;
            };
            match serde_json::from_value::<RawRecipe>(value) {
                Ok(recipe) => {
                    let mut recipe = recipe.validate();
                    inject_vocal_preference(&mut recipe, &request.message);
                    return Ok(recipe);
                }
                Err(err) => debug!(attempt, "unusable recipe object: {err}"),
            }
        }

        info!("model gave no usable recipe, using keyword fallback");
        let mut recipe = keyword_recipe(&request.message, request.last.as_ref());
        inject_vocal_preference(&mut recipe, &request.message);
        Ok(recipe)
    }

    async fn health(&self) -> BackendStatus {
        let response = self
            .client
            .get(format!("{}/api/tags", self.host))
            .timeout(Duration::from_secs(5))
            .send()
            .await;
        let tags: TagsResponse = match response {
            Ok(r) if r.status().is_success() => match r.json().await {
                Ok(tags) => tags,
                Err(err) => return BackendStatus::down(format!("bad /api/tags answer: {err}")),
            },
            Ok(r) => return BackendStatus::down(format!("HTTP {}", r.status())),
            Err(err) => return BackendStatus::down(err.to_string()),
        };
        if tags.models.iter().any(|m| m.name == self.model) {
            BackendStatus::up()
        } else {
            BackendStatus::down(format!("model {} not pulled", self.model))
        }
    }
}
