//! Generation backends.
//!
//! Two seams, both async traits so the engine can be driven by mocks:
//!
//! - [`ParamsGenerator`] turns the listener's words and the taste profile
//!   into a validated [`TrackRecipe`] (a local LLM through Ollama, with a
//!   keyword fallback).
//! - [`TrackRenderer`] turns a stamped [`TrackParams`] into an audio file
//!   (an ACE-Step server).

pub mod acestep;
pub mod fallback;
pub mod ollama;

use crate::error::RenderError;
use crate::params::{TrackParams, TrackRecipe};
use async_trait::async_trait;
use serde::Serialize;
use std::path::Path;
use tokio_util::sync::CancellationToken;

pub use acestep::AceStepRenderer;
pub use fallback::keyword_recipe;
pub use ollama::OllamaParams;

/// Reachability of a backend, as reported on `/health`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BackendStatus {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl BackendStatus {
    pub fn up() -> Self {
        Self {
            ok: true,
            detail: None,
        }
    }

    pub fn down(detail: impl Into<String>) -> Self {
        Self {
            ok: false,
            detail: Some(detail.into()),
        }
    }
}

/// Everything the parameter backend gets to see for one track.
#[derive(Debug, Clone, Default)]
pub struct ParamsRequest {
    /// Listener direction, enriched with modifiers and hints by the engine.
    pub message: String,
    pub taste_context: String,
    pub last: Option<TrackRecipe>,
    /// Oldest first.
    pub recent: Vec<TrackRecipe>,
}

#[async_trait]
pub trait ParamsGenerator: Send + Sync {
    /// Proposes the next recipe. Implementations validate their output:
    /// whatever they return is used as is.
    async fn generate(&self, request: &ParamsRequest) -> anyhow::Result<TrackRecipe>;

    async fn health(&self) -> BackendStatus {
        BackendStatus::up()
    }
}

#[async_trait]
pub trait TrackRenderer: Send + Sync {
    /// Renders `params` into `destination`.
    ///
    /// Network work stops as soon as `cancel` fires (return
    /// [`RenderError::Cancelled`]). Disk writes go to
    /// [`partial_path`](crate::generation::partial_path) and are renamed into
    /// place; they are awaited to the end, never raced against `cancel`, so
    /// when this returns nothing is still writing to `destination`.
    async fn render(
        &self,
        params: &TrackParams,
        destination: &Path,
        cancel: &CancellationToken,
    ) -> Result<(), RenderError>;

    async fn health(&self) -> BackendStatus {
        BackendStatus::up()
    }
}
