use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::collections::HashSet;
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::debounce::DEFAULT_DEBOUNCE_INTERVAL;
use crate::rotation::RotationConfig;
use crate::storage::{Field, StorageConfig};

/// Environment variable naming the configuration file.
pub const CONFIG_PATH_ENV: &str = "LOGTAIL_AGENT_CONFIG";
pub const DEFAULT_CONFIG_PATH: &str = "config.toml";

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    #[serde(default)]
    pub agent: AgentConfig,
    pub storage: StorageConfig,
    #[serde(default)]
    pub metrics: Option<MetricsConfig>,
    #[serde(default)]
    pub inputs: Vec<InputConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct AgentConfig {
    /// SQLite file holding per-file read offsets.
    #[serde(default = "default_offsets_path")]
    pub offsets_path: String,
    /// Minimum spacing between tail passes of one file.
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct MetricsConfig {
    pub listen: SocketAddr,
}

/// One stream: a file name pattern, how to parse its lines and where to store them.
#[derive(Debug, Deserialize, Clone)]
pub struct InputConfig {
    /// Stream and table name.
    pub name: String,
    /// Absolute path whose last segment is a file name regex.
    pub path: String,
    /// Line regex; its named groups become record fields.
    pub pattern: String,
    pub fields: Vec<Field>,
    #[serde(default)]
    pub rotation: Option<RotationConfig>,
}

const DEFAULT_OFFSETS_PATH: &str = "~/.logtail-agent/offsets.db";

fn default_offsets_path() -> String {
    DEFAULT_OFFSETS_PATH.to_string()
}

fn default_debounce_ms() -> u64 {
    DEFAULT_DEBOUNCE_INTERVAL.as_millis() as u64
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            offsets_path: default_offsets_path(),
            debounce_ms: default_debounce_ms(),
        }
    }
}

fn expand(path: &str) -> PathBuf {
    PathBuf::from(shellexpand::tilde(path).as_ref())
}

fn validate_name(kind: &str, name: &str) -> Result<()> {
    if name.trim().is_empty() {
        bail!("{kind} name cannot be empty");
    }
    if name.starts_with('_') {
        bail!("{kind} name {name:?} cannot start with '_'");
    }
    Ok(())
}

impl Config {
    /// Load from the file named by `LOGTAIL_AGENT_CONFIG`, or `config.toml`.
    pub fn from_env() -> Result<Self> {
        let path =
            std::env::var(CONFIG_PATH_ENV).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        Self::load(path)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        let config: Config = toml::from_str(&raw)
            .with_context(|| format!("failed to parse config {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.inputs.is_empty() {
            bail!("at least one [[inputs]] entry is required");
        }
        if self.storage.path.trim().is_empty() {
            bail!("storage path cannot be empty");
        }

        let mut names = HashSet::new();
        for input in &self.inputs {
            validate_name("input", &input.name)?;
            if !names.insert(input.name.as_str()) {
                bail!("duplicate input name {:?}", input.name);
            }
            if input.fields.is_empty() {
                bail!("input {:?} must declare at least one field", input.name);
            }
            let mut fields = HashSet::new();
            for field in &input.fields {
                validate_name("field", &field.name)
                    .with_context(|| format!("input {:?}", input.name))?;
                if !fields.insert(field.name.as_str()) {
                    bail!("input {:?} declares field {:?} twice", input.name, field.name);
                }
            }
        }
        Ok(())
    }

    pub fn offsets_path(&self) -> PathBuf {
        expand(&self.agent.offsets_path)
    }

    pub fn debounce_interval(&self) -> Duration {
        Duration::from_millis(self.agent.debounce_ms)
    }

    /// Storage settings with `~` expanded in the database path.
    pub fn storage_config(&self) -> StorageConfig {
        let mut storage = self.storage.clone();
        if !storage.path.starts_with(':') {
            storage.path = expand(&storage.path).to_string_lossy().into_owned();
        }
        storage
    }
}

impl InputConfig {
    pub fn watch_path(&self) -> PathBuf {
        expand(&self.path)
    }
}
