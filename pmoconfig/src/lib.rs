//! # pmoconfig
//!
//! Configuration YAML de PMORadio.
//!
//! Le fichier `<config_dir>/config.yaml` est fusionné sur les valeurs par
//! défaut embarquées (`pmoradio.yaml`), puis les variables
//! `PMORADIO_CONFIG__SECTION__CLE=valeur` sont appliquées par-dessus. Le
//! résultat est réécrit sur disque pour que l'utilisateur voie toutes les
//! clés disponibles.
//!
//! La configuration est chargée explicitement par le processus hôte ; il n'y
//! a pas d'instance globale. Les crates métier ajoutent leurs accesseurs par
//! trait d'extension (voir `pmoradio::RadioConfigExt`).
//!
//! ```no_run
//! use pmoconfig::Config;
//!
//! let config = Config::load_config("")?;
//! let port = config.get_http_port();
//! let radios = config.get_managed_dir(&["radio", "radios_dir"], "radios")?;
//! # Ok::<(), anyhow::Error>(())
//! ```

use anyhow::{anyhow, Result};
use dirs::home_dir;
use serde_yaml::{Mapping, Value};
use std::{
    env, fs,
    path::{Path, PathBuf},
    sync::{Mutex, MutexGuard},
};
use tracing::{info, warn};

const DEFAULT_CONFIG: &str = include_str!("pmoradio.yaml");

const ENV_CONFIG_DIR: &str = "PMORADIO_CONFIG";
const ENV_PREFIX: &str = "PMORADIO_CONFIG__";
const DEFAULT_CONFIG_DIR: &str = ".pmoradio";

const DEFAULT_HTTP_PORT: u16 = 8765;
const DEFAULT_LOG_MIN_LEVEL: &str = "INFO";
const DEFAULT_LOG_ENABLE_CONSOLE: bool = true;

/// Arbre YAML de configuration, adossé à `config.yaml`.
#[derive(Debug)]
pub struct Config {
    config_dir: String,
    path: String,
    data: Mutex<Value>,
}

impl Clone for Config {
    fn clone(&self) -> Self {
        Self {
            config_dir: self.config_dir.clone(),
            path: self.path.clone(),
            data: Mutex::new(self.lock_data().clone()),
        }
    }
}

impl Config {
    /// Choisit le répertoire : argument, `$PMORADIO_CONFIG`, `./.pmoradio`,
    /// `~/.pmoradio`, et sinon `./.pmoradio` qui sera créé.
    fn find_config_dir(directory: &str) -> String {
        if !directory.is_empty() {
            return directory.to_string();
        }
        if let Ok(from_env) = env::var(ENV_CONFIG_DIR) {
            info!(env_var = ENV_CONFIG_DIR, path = %from_env, "Config directory from environment");
            return from_env;
        }
        if Path::new(DEFAULT_CONFIG_DIR).exists() {
            return DEFAULT_CONFIG_DIR.to_string();
        }
        home_dir()
            .map(|home| home.join(DEFAULT_CONFIG_DIR))
            .filter(|candidate| candidate.exists())
            .map(|candidate| candidate.to_string_lossy().to_string())
            .unwrap_or_else(|| DEFAULT_CONFIG_DIR.to_string())
    }

    /// Crée le répertoire au besoin et vérifie qu'on peut y écrire.
    fn prepare_config_dir(path: &Path) -> Result<()> {
        fs::create_dir_all(path)?;
        if !path.is_dir() {
            return Err(anyhow!("{} is not a directory", path.display()));
        }
        let marker = path.join(".write_test");
        fs::write(&marker, b"ok")?;
        fs::remove_file(&marker)?;
        Ok(())
    }

    /// Resolves and prepares the configuration directory.
    pub fn config_dir(directory: &str) -> Result<String> {
        let dir = Self::find_config_dir(directory);
        Self::prepare_config_dir(Path::new(&dir))?;
        Ok(dir)
    }

    /// Charge `config.yaml` depuis `directory` (vide = recherche par défaut),
    /// fusionné sur les valeurs embarquées, variables d'environnement
    /// comprises, et le réécrit.
    pub fn load_config(directory: &str) -> Result<Self> {
        let config_dir = Self::config_dir(directory)?;
        let path = Path::new(&config_dir)
            .join("config.yaml")
            .to_string_lossy()
            .to_string();
        info!(config_dir = %config_dir, "Using config directory");

        let mut value: Value = serde_yaml::from_str(DEFAULT_CONFIG)?;
        match fs::read(&path) {
            Ok(raw) => {
                info!(config_file = %path, "Loaded config file");
                let external: Value = serde_yaml::from_slice(&raw)?;
                merge_yaml(&mut value, &external);
            }
            Err(_) => info!(config_file = %path, "No config file yet, using embedded defaults"),
        }
        let mut value = lower_keys(value);
        apply_env_overrides(&mut value, env::vars());

        let config = Config {
            config_dir,
            path,
            data: Mutex::new(value),
        };
        config.save()?;
        Ok(config)
    }

    fn lock_data(&self) -> MutexGuard<'_, Value> {
        // a poisoned lock still holds a consistent YAML tree
        self.data.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Directory holding `config.yaml`; relative managed paths resolve against it.
    pub fn directory(&self) -> &str {
        &self.config_dir
    }

    pub fn save(&self) -> Result<()> {
        let yaml = serde_yaml::to_string(&*self.lock_data())?;
        fs::write(&self.path, yaml)?;
        Ok(())
    }

    /// Écrit `value` en `path` (les clés sont mises en minuscules) et sauvegarde.
    pub fn set_value(&self, path: &[&str], value: Value) -> Result<()> {
        insert_at(&mut self.lock_data(), path, value)?;
        self.save()
    }

    /// Valeur en `path`, ou une erreur si le chemin n'existe pas.
    pub fn get_value(&self, path: &[&str]) -> Result<Value> {
        lookup(&self.lock_data(), path).cloned()
    }

    /// Reads a string value, falling back to `default` when absent or not a string.
    pub fn get_string_or(&self, path: &[&str], default: &str) -> String {
        match self.get_value(path) {
            Ok(Value::String(s)) => s,
            _ => default.to_string(),
        }
    }

    /// Reads an unsigned integer, accepting numeric strings, falling back to `default`.
    pub fn get_u64_or(&self, path: &[&str], default: u64) -> u64 {
        match self.get_value(path) {
            Ok(Value::Number(n)) => n.as_u64().unwrap_or(default),
            Ok(Value::String(s)) => s.trim().parse().unwrap_or_else(|_| {
                warn!(path = %path.join("."), value = %s, "Invalid number, using default {default}");
                default
            }),
            _ => default,
        }
    }

    /// Répertoire géré : absolu, ou relatif au répertoire de configuration.
    /// Créé s'il n'existe pas ; `default` est enregistré si la clé est vide.
    pub fn get_managed_dir(&self, path: &[&str], default: &str) -> Result<PathBuf> {
        let configured = match self.get_value(path) {
            Ok(Value::String(s)) if !s.is_empty() => s,
            _ => {
                self.set_managed_dir(path, default.to_string())?;
                default.to_string()
            }
        };
        let configured = Path::new(&configured);
        let dir = if configured.is_absolute() {
            configured.to_path_buf()
        } else {
            Path::new(&self.config_dir).join(configured)
        };
        if !dir.exists() {
            fs::create_dir_all(&dir)?;
            info!(directory = %dir.display(), "Created managed directory");
        }
        Ok(dir)
    }

    pub fn set_managed_dir(&self, path: &[&str], directory: String) -> Result<()> {
        self.set_value(path, Value::String(directory))
    }

    /// URL annoncée au démarrage : `host.base_url` si renseignée, sinon
    /// l'adresse locale devinée et le port HTTP.
    pub fn get_base_url(&self) -> String {
        match self.get_value(&["host", "base_url"]) {
            Ok(Value::String(s)) if !s.trim().is_empty() => s.trim().trim_end_matches('/').to_string(),
            _ => pmoutils::listen_url(self.get_http_port()),
        }
    }

    /// `host.http_port`, default 8765 when missing or invalid.
    pub fn get_http_port(&self) -> u16 {
        let port = match self.get_value(&["host", "http_port"]) {
            Ok(Value::Number(n)) => n.as_u64().and_then(|p| u16::try_from(p).ok()),
            Ok(Value::String(s)) => s.trim().parse::<u16>().ok(),
            _ => None,
        };
        port.unwrap_or_else(|| {
            warn!("Invalid or missing HTTP port, using default {DEFAULT_HTTP_PORT}");
            DEFAULT_HTTP_PORT
        })
    }

    pub fn get_log_enable_console(&self) -> bool {
        match self.get_value(&["host", "logger", "enable_console"]) {
            Ok(Value::Bool(b)) => b,
            _ => DEFAULT_LOG_ENABLE_CONSOLE,
        }
    }

    /// Niveau minimum des logs (`host.logger.min_level`).
    pub fn get_log_min_level(&self) -> String {
        self.get_string_or(&["host", "logger", "min_level"], DEFAULT_LOG_MIN_LEVEL)
    }
}

fn insert_at(node: &mut Value, path: &[&str], value: Value) -> Result<()> {
    let Some((first, rest)) = path.split_first() else {
        *node = value;
        return Ok(());
    };
    let Value::Mapping(map) = node else {
        return Err(anyhow!("cannot set {}: parent is not a map", path.join(".")));
    };
    let key = Value::String(first.to_lowercase());
    if rest.is_empty() {
        map.insert(key, value);
        Ok(())
    } else {
        let child = map.entry(key).or_insert(Value::Mapping(Mapping::new()));
        insert_at(child, rest, value)
    }
}

fn lookup<'a>(root: &'a Value, path: &[&str]) -> Result<&'a Value> {
    path.iter().enumerate().try_fold(root, |node, (i, key)| match node {
        Value::Mapping(map) => map
            .get(Value::String(key.to_lowercase()))
            .ok_or_else(|| anyhow!("Path {} does not exist", path[..=i].join("."))),
        _ => Err(anyhow!("Path {} is not a map", path[..i].join("."))),
    })
}

/// `PMORADIO_CONFIG__RADIO__MIN_FREE_MB=10` → `radio.min_free_mb: 10`.
fn apply_env_overrides(config: &mut Value, vars: impl IntoIterator<Item = (String, String)>) {
    for (key, raw) in vars {
        let Some(rest) = key.strip_prefix(ENV_PREFIX) else {
            continue;
        };
        let path: Vec<&str> = rest.split("__").collect();
        if let Err(err) = insert_at(config, &path, env_value(&raw)) {
            warn!(variable = %key, "Ignoring environment override: {err}");
        }
    }
}

/// Interprété comme YAML (nombres, booléens), sinon chaîne brute.
fn env_value(raw: &str) -> Value {
    serde_yaml::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

fn lower_keys(value: Value) -> Value {
    match value {
        Value::Mapping(map) => Value::Mapping(
            map.into_iter()
                .map(|(k, v)| {
                    let k = match k {
                        Value::String(s) => Value::String(s.to_lowercase()),
                        other => other,
                    };
                    (k, lower_keys(v))
                })
                .collect(),
        ),
        Value::Sequence(seq) => Value::Sequence(seq.into_iter().map(lower_keys).collect()),
        other => other,
    }
}

/// Les mappings sont fusionnés clé par clé ; scalaires et séquences
/// externes remplacent la valeur par défaut.
fn merge_yaml(default: &mut Value, external: &Value) {
    match (default, external) {
        (Value::Mapping(dmap), Value::Mapping(emap)) => {
            for (k, v) in emap {
                match dmap.get_mut(k) {
                    Some(dv) => merge_yaml(dv, v),
                    None => {
                        dmap.insert(k.clone(), v.clone());
                    }
                }
            }
        }
        (d, e) => *d = e.clone(),
    }
}
