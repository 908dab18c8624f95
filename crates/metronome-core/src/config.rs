use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

pub const DEFAULT_CONFIG_FILE: &str = "metronome.toml";
pub const DEFAULT_MAILBOX_CAPACITY: usize = 64;
pub const DEFAULT_INITIAL_DEMAND: usize = 32;

/// Top-level config (metronome.toml + METRONOME_* env overrides).
///
/// Every field has a default, so a scheduler can be constructed with no
/// config file present at all.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Name of this scheduler instance, used in logs.
    #[serde(default = "default_name")]
    pub name: String,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub channels: ChannelConfig,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            storage: StorageConfig::default(),
            channels: ChannelConfig::default(),
        }
    }
}

/// Which storage backend the pipeline persists to.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(tag = "driver", rename_all = "lowercase")]
pub enum StorageConfig {
    /// Ephemeral: catalog and watermark vanish with the process.
    #[default]
    Memory,
    /// Durable SQLite database at `path`.
    Sqlite { path: String },
}

/// Sizing for the channels wiring the two stages together.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelConfig {
    /// Capacity of each stage's command mailbox and of the execution output.
    #[serde(default = "default_mailbox_capacity")]
    pub mailbox_capacity: usize,
    /// Demand the broadcaster places on the registry when it subscribes.
    #[serde(default = "default_initial_demand")]
    pub initial_demand: usize,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            mailbox_capacity: DEFAULT_MAILBOX_CAPACITY,
            initial_demand: DEFAULT_INITIAL_DEMAND,
        }
    }
}

fn default_name() -> String {
    "metronome".to_string()
}

fn default_mailbox_capacity() -> usize {
    DEFAULT_MAILBOX_CAPACITY
}

fn default_initial_demand() -> usize {
    DEFAULT_INITIAL_DEMAND
}

impl SchedulerConfig {
    /// Load config from a TOML file with METRONOME_* env var overrides.
    ///
    /// Falls back to `metronome.toml` in the working directory when no path
    /// is given; a missing file just means defaults.
    pub fn load(config_path: Option<&str>) -> Result<Self, ConfigError> {
        let path = config_path.unwrap_or(DEFAULT_CONFIG_FILE);
        let figment = Figment::from(Serialized::defaults(Self::default()))
            .merge(Toml::file(path))
            .merge(Env::prefixed("METRONOME_").split("__"));
        Ok(figment.extract()?)
    }
}
