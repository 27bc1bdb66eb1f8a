//! Extension pour intégrer la radio générative dans pmoconfig
//!
//! Ce module fournit le trait `RadioConfigExt` qui ajoute à `pmoconfig::Config`
//! les getters de la radio (répertoires des stations, backends de génération,
//! surface de lecture) ainsi que [`EngineSettings`], l'ensemble des réglages
//! lus une fois au démarrage par le moteur.
//!
//! # Exemple
//!
//! ```no_run
//! use pmoconfig::Config;
//! use pmoradio::{EngineSettings, RadioConfigExt};
//!
//! # fn main() -> anyhow::Result<()> {
//! let config = Config::load_config("")?;
//! let radios = config.get_radios_dir()?;
//! let settings = EngineSettings::from_config(&config);
//! println!("{} (disk floor {} MB)", radios.display(), settings.min_free_mb);
//! # Ok(())
//! # }
//! ```

use crate::backends::{acestep, ollama};
use crate::params::SimilarityRule;
use anyhow::Result;
use pmoconfig::Config;
use std::path::PathBuf;
use std::time::Duration;

/// Répertoire par défaut des stations (relatif au config_dir)
const DEFAULT_RADIOS_DIR: &str = "radios";

/// Répertoire par défaut du journal d'erreurs (relatif au config_dir)
const DEFAULT_OUTPUT_DIR: &str = "output";

const DEFAULT_MIN_FREE_MB: u64 = 50;
const DEFAULT_DISK_RECHECK_S: u64 = 30;
const DEFAULT_RECENT_WINDOW: u64 = 5;

/// Trait d'extension pour gérer la configuration de la radio dans pmoconfig
///
/// Les getters retournent la valeur par défaut lorsque la clé est absente
/// ou invalide ; seuls les répertoires gérés sont persistés (via
/// `get_managed_dir`).
pub trait RadioConfigExt {
    /// Récupère le répertoire racine des stations (`radio.radios_dir`)
    ///
    /// Le chemin peut être configuré de manière relative au répertoire de
    /// configuration. Il est créé s'il n'existe pas.
    fn get_radios_dir(&self) -> Result<PathBuf>;

    /// Récupère le répertoire du journal d'erreurs (`radio.output_dir`)
    fn get_output_dir(&self) -> Result<PathBuf>;

    /// Durée demandée au moteur de rendu, en secondes (défaut : 120)
    fn get_track_duration_s(&self) -> u32;

    /// Espace disque minimal, en Mo, sous lequel la génération est suspendue
    fn get_min_free_mb(&self) -> u64;

    /// Règle "trop similaire" : fenêtre et écart de tempo
    ///
    /// # Returns
    ///
    /// Une [`SimilarityRule`] (défaut : 3 pistes, 20 BPM)
    fn get_similarity_rule(&self) -> SimilarityRule;

    /// URL du serveur ACE-Step
    fn get_acestep_host(&self) -> String;

    /// Modèle ACE-Step
    fn get_acestep_model(&self) -> String;

    /// Délai maximal d'un rendu ACE-Step (défaut : 600 s)
    fn get_acestep_timeout(&self) -> Duration;

    /// URL du serveur Ollama
    fn get_ollama_host(&self) -> String;

    /// Modèle Ollama utilisé pour proposer les recettes
    fn get_ollama_model(&self) -> String;

    /// Délai maximal d'un appel Ollama (défaut : 90 s)
    fn get_ollama_timeout(&self) -> Duration;

    /// Commande du lecteur externe (`{path}`, `{offset}`)
    ///
    /// # Returns
    ///
    /// `None` quand la lecture est pilotée par le navigateur
    fn get_player_command(&self) -> Option<String>;
}

impl RadioConfigExt for Config {
    fn get_radios_dir(&self) -> Result<PathBuf> {
        self.get_managed_dir(&["radio", "radios_dir"], DEFAULT_RADIOS_DIR)
    }

    fn get_output_dir(&self) -> Result<PathBuf> {
        self.get_managed_dir(&["radio", "output_dir"], DEFAULT_OUTPUT_DIR)
    }

    fn get_track_duration_s(&self) -> u32 {
        let value = self.get_u64_or(
            &["radio", "default_duration_s"],
            acestep::DEFAULT_DURATION_S as u64,
        );
        u32::try_from(value).unwrap_or(acestep::DEFAULT_DURATION_S)
    }

    fn get_min_free_mb(&self) -> u64 {
        self.get_u64_or(&["radio", "min_free_mb"], DEFAULT_MIN_FREE_MB)
    }

    fn get_similarity_rule(&self) -> SimilarityRule {
        let default = SimilarityRule::default();
        let window = self.get_u64_or(&["radio", "similarity", "window"], default.window as u64);
        let bpm_delta = self.get_u64_or(
            &["radio", "similarity", "bpm_delta"],
            default.bpm_delta as u64,
        );
        SimilarityRule {
            window: window as usize,
            bpm_delta: u16::try_from(bpm_delta).unwrap_or(default.bpm_delta),
        }
    }

    fn get_acestep_host(&self) -> String {
        self.get_string_or(&["backends", "acestep", "host"], acestep::DEFAULT_HOST)
    }

    fn get_acestep_model(&self) -> String {
        self.get_string_or(&["backends", "acestep", "model"], acestep::DEFAULT_MODEL)
    }

    fn get_acestep_timeout(&self) -> Duration {
        Duration::from_secs(self.get_u64_or(
            &["backends", "acestep", "timeout_s"],
            acestep::DEFAULT_TIMEOUT.as_secs(),
        ))
    }

    fn get_ollama_host(&self) -> String {
        self.get_string_or(&["backends", "ollama", "host"], ollama::DEFAULT_HOST)
    }

    fn get_ollama_model(&self) -> String {
        self.get_string_or(&["backends", "ollama", "model"], ollama::DEFAULT_MODEL)
    }

    fn get_ollama_timeout(&self) -> Duration {
        Duration::from_secs(self.get_u64_or(
            &["backends", "ollama", "timeout_s"],
            ollama::DEFAULT_TIMEOUT.as_secs(),
        ))
    }

    fn get_player_command(&self) -> Option<String> {
        let command = self.get_string_or(&["playback", "command"], "");
        let command = command.trim();
        (!command.is_empty()).then(|| command.to_string())
    }
}

/// Engine tunables, read once at startup.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineSettings {
    /// Below this much free space generation is suspended.
    pub min_free_mb: f64,
    pub disk_recheck: Duration,
    /// Length of the recent-params history kept per station.
    pub recent_window: usize,
    pub similarity: SimilarityRule,
    pub params_backoff: Duration,
    pub render_backoff: Duration,
    pub cycle_error_backoff: Duration,
    pub renderer_down_backoff: Duration,
    pub command_buffer: usize,
    pub event_capacity: usize,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            min_free_mb: DEFAULT_MIN_FREE_MB as f64,
            disk_recheck: Duration::from_secs(DEFAULT_DISK_RECHECK_S),
            recent_window: DEFAULT_RECENT_WINDOW as usize,
            similarity: SimilarityRule::default(),
            params_backoff: Duration::from_secs(2),
            render_backoff: Duration::from_secs(15),
            cycle_error_backoff: Duration::from_secs(5),
            renderer_down_backoff: Duration::from_secs(15),
            command_buffer: 64,
            event_capacity: crate::events::DEFAULT_EVENT_CAPACITY,
        }
    }
}

impl EngineSettings {
    pub fn from_config(config: &Config) -> Self {
        let default = Self::default();
        let secs = |key: &str, fallback: Duration| {
            Duration::from_secs(config.get_u64_or(&["radio", "backoff", key], fallback.as_secs()))
        };
        Self {
            min_free_mb: config.get_min_free_mb() as f64,
            disk_recheck: Duration::from_secs(
                config.get_u64_or(&["radio", "disk_recheck_s"], DEFAULT_DISK_RECHECK_S),
            ),
            recent_window: config
                .get_u64_or(&["radio", "recent_window"], DEFAULT_RECENT_WINDOW)
                .max(1) as usize,
            similarity: config.get_similarity_rule(),
            params_backoff: secs("params_s", default.params_backoff),
            render_backoff: secs("render_s", default.render_backoff),
            cycle_error_backoff: secs("cycle_error_s", default.cycle_error_backoff),
            renderer_down_backoff: secs("renderer_down_s", default.renderer_down_backoff),
            ..default
        }
    }
}
