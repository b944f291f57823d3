//! Loading and validating settings.
//!
//! Settings come from a TOML file and can be overridden with environment
//! variables prefixed with `FEDROUND` (e.g. `FEDROUND_COORDINATOR__MIN_PARTICIPANTS`).

use std::path::PathBuf;

use config::{Config, ConfigError, Environment};
use thiserror::Error;

use crate::{logging::LoggingSettings, message::ModuleDescriptor};

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("configuration loading failed: {0}")]
    Loading(#[from] ConfigError),
    #[error("invalid configuration: {0}")]
    Validation(String),
}

/// Server-side settings: coordinator, trainer and injector, plus the client
/// profiles hosted in the same process.
#[derive(Debug, Deserialize)]
pub struct Settings {
    pub logging: LoggingSettings,
    pub coordinator: CoordinatorSettings,
    pub trainer: TrainerSettings,
    pub injector: InjectorSettings,
    #[serde(default)]
    pub clients: Vec<ClientSettings>,
}

impl Settings {
    pub fn new(path: &str) -> Result<Self, SettingsError> {
        let settings: Settings = load(path)?;
        settings.validate()?;
        Ok(settings)
    }

    fn validate(&self) -> Result<(), SettingsError> {
        if self.coordinator.min_participants == 0 {
            return Err(SettingsError::Validation(
                "coordinator.min_participants must be at least 1".into(),
            ));
        }
        if self.coordinator.readiness_interval_secs == 0 {
            return Err(SettingsError::Validation(
                "coordinator.readiness_interval_secs must be non-zero".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.coordinator.dp_threshold) {
            return Err(SettingsError::Validation(
                "coordinator.dp_threshold must be within [0, 1]".into(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CoordinatorSettings {
    /// Readiness quorum: participants required before the round proceeds.
    pub min_participants: usize,
    /// Interval between readiness re-evaluations.
    pub readiness_interval_secs: u64,
    /// Upper bound on the wait for a quorum; past it the round is aborted.
    pub max_wait_secs: u64,
    /// Run the liveness/key-exchange handshake before collecting results.
    pub secure_agg: bool,
    /// Differential-privacy threshold forwarded to clients.
    pub dp_threshold: f64,
    /// Model configuration name forwarded to clients and the trainer.
    pub model_config: String,
    /// Root for intermediate results (`<resources_path>/interRes/<id>.pt`).
    pub resources_path: PathBuf,
    /// Where test outputs (`<id>.txt`) are written.
    pub output_dir: PathBuf,
    /// Number of rounds the supervisor runs before shutting down.
    pub rounds: u32,
}

/// Invocation of the external training driver.
#[derive(Debug, Clone, Deserialize)]
pub struct TrainerSettings {
    /// Interpreter or wrapper the module scripts are run with.
    #[serde(default = "default_runner")]
    pub command: String,
    /// Training driver script.
    pub module: PathBuf,
    /// Secure-aggregation variant of the training driver.
    pub secure_module: PathBuf,
    pub data_path: PathBuf,
    pub epochs: u32,
    /// Where the trained model artifact is written by the driver.
    pub model_path: PathBuf,
    pub target_output_size: u32,
}

fn default_runner() -> String {
    "python3".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct InjectorSettings {
    /// Directory the module files are served from.
    pub module_dir: PathBuf,
    /// Modules on offer.
    #[serde(default)]
    pub modules: Vec<ModuleDescriptor>,
}

/// Client-side settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ClientSettings {
    /// Stable client identifier, unique within a round (e.g. "alice").
    pub id: String,
    pub address: String,
    pub port: u16,
    pub task_id: String,
    /// Directory modules are cached in, along with the module index.
    pub module_dir: PathBuf,
    /// Interpreter or wrapper the fetched module is run with.
    #[serde(default = "default_runner")]
    pub runner: String,
    /// Delay before the module-started acknowledgment is sent back.
    #[serde(default = "default_started_ack_delay")]
    pub started_ack_delay_secs: u64,
    // capability profile
    pub use_cuda: bool,
    pub instance_type: crate::message::InstanceType,
    pub ram_gb: u32,
}

fn default_started_ack_delay() -> u64 {
    60
}

fn load<T: serde::de::DeserializeOwned>(path: &str) -> Result<T, ConfigError> {
    Config::builder()
        .add_source(config::File::with_name(path))
        .add_source(Environment::with_prefix("fedround").separator("__"))
        .build()?
        .try_deserialize()
}
