//! # pmoradio - Radio générative sans fin
//!
//! Cette crate fournit le moteur de coordination génération/lecture d'une
//! radio personnelle dont chaque morceau est généré à la demande : un modèle
//! de langage propose la recette du morceau suivant, un moteur de rendu
//! produit l'audio en arrière-plan pendant que le morceau courant joue, et
//! les réactions de l'auditeur orientent les générations suivantes.
//!
//! ## Architecture
//!
//! - [`PlaybackClock`] : position de lecture (pause, seek, replay) et signal
//!   de fin, sans décoder l'audio
//! - [`GenerationTask`] / [`GenerationSlot`] : un rendu annulable, au plus
//!   un à la fois
//! - [`RadioEngine`] : la boucle principale, pilotée par [`EngineCommand`]
//!   via un [`RadioHandle`]
//! - [`EventSink`] : diffusion des [`RadioEvent`] vers les interfaces
//! - `backends` : Ollama (recettes) et ACE-Step (audio), derrière les
//!   traits [`ParamsGenerator`] et [`TrackRenderer`]
//! - `station`, `taste` : stations et profils de goût sur disque
//!
//! ## Structure des modules
//!
//! ```text
//! pmoradio/
//! ├── src/
//! │   ├── lib.rs              # Module principal (ce fichier)
//! │   ├── engine/             # Boucle principale, commandes, réactions
//! │   ├── clock.rs            # Horloge de lecture
//! │   ├── generation.rs       # Tâches de rendu annulables
//! │   ├── events.rs           # Événements diffusés
//! │   ├── params.rs           # Recettes validées
//! │   ├── reaction.rs         # Lecture des réactions de l'auditeur
//! │   ├── station.rs          # Stations sur disque
//! │   ├── taste.rs            # Profil de goût
//! │   ├── surface.rs          # Surfaces de lecture
//! │   ├── report.rs           # Journal d'erreurs copiable
//! │   ├── config_ext.rs       # Extension pmoconfig
//! │   ├── backends/           # Ollama, ACE-Step, repli par mots-clés
//! │   └── error.rs            # Gestion des erreurs
//! ```
//!
//! ## Utilisation
//!
//! ```rust,no_run
//! use pmoconfig::Config;
//! use pmoradio::{
//!     AceStepRenderer, EngineSettings, ErrorLog, OllamaParams, RadioConfigExt, RadioEngine,
//!     SilentSurface, StationManager,
//! };
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load_config("")?;
//!     let params = OllamaParams::new(
//!         &config.get_ollama_host(),
//!         &config.get_ollama_model(),
//!         config.get_ollama_timeout(),
//!     )?;
//!     let renderer = AceStepRenderer::new(
//!         &config.get_acestep_host(),
//!         &config.get_acestep_model(),
//!         config.get_track_duration_s(),
//!         config.get_acestep_timeout(),
//!     )?;
//!
//!     let (engine, radio) = RadioEngine::new(
//!         EngineSettings::from_config(&config),
//!         StationManager::new(config.get_radios_dir()?)?,
//!         Arc::new(params),
//!         Arc::new(renderer),
//!         Arc::new(SilentSurface),
//!         ErrorLog::new(&config.get_output_dir()?),
//!     )?;
//!     let task = engine.spawn();
//!
//!     radio.submit_reaction("warm lo-fi with rhodes").await?;
//!     radio.shutdown().await?;
//!     task.await?;
//!     Ok(())
//! }
//! ```

pub mod backends;
pub mod clock;
pub mod config_ext;
pub mod engine;
pub mod error;
pub mod events;
pub mod generation;
pub mod params;
pub mod reaction;
pub mod report;
pub mod station;
pub mod surface;
pub mod taste;

pub use backends::{
    AceStepRenderer, BackendStatus, OllamaParams, ParamsGenerator, ParamsRequest, TrackRenderer,
};
pub use clock::{PlaybackClock, PlaybackSnapshot, PlaybackState};
pub use config_ext::{EngineSettings, RadioConfigExt};
pub use engine::{EngineCommand, RadioEngine, RadioHandle};
pub use error::{Error, RenderError, Result};
pub use events::{EngineSnapshot, EventEnvelope, EventSink, NowPlaying, RadioEvent};
pub use generation::{GenerationOutcome, GenerationSlot, GenerationTask};
pub use params::{SimilarityRule, TrackId, TrackParams, TrackRecipe};
pub use reaction::{Reaction, Signal};
pub use report::ErrorLog;
pub use station::{Station, StationManager, DEFAULT_STATION};
pub use surface::{CommandSurface, PlaybackSurface, SilentSurface};
pub use taste::{TasteProfile, TasteStore};
