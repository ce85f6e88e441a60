//! Configuration of the execution engine.
//!
//! See the documentation of [`Config`] for more details.

use std::env;
use std::path::Path;
use std::str::FromStr;

use once_cell::sync::OnceCell;
use serde::Deserialize;

/// Environment variable overriding the microbatch capacity.
pub const MBSIZE_ENV_VAR: &str = "MBSIZE";
/// Environment variable overriding the default operator parallelism.
pub const PARDEG_ENV_VAR: &str = "PARDEG";

/// Default number of item slots in a microbatch.
const DEFAULT_MICROBATCH_SIZE: usize = 512;
/// The capacity of the in-buffer of every edge between stages.
const DEFAULT_CHANNEL_CAPACITY: usize = 16;

/// The process-wide configuration, installed once at executor construction.
static GLOBAL: OnceCell<Config> = OnceCell::new();

/// Tuning parameters of the execution engine.
///
/// The configuration is read once when the executor is built and is
/// read-only afterwards. The microbatch capacity can be overridden with the
/// `MBSIZE` environment variable, the default parallelism with `PARDEG`.
///
/// ## Example
///
/// ```
/// # use ruscello::Config;
/// let mut config = Config::from_env().unwrap();
/// config.parallelism = 4;
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Number of item slots in each microbatch.
    pub microbatch_size: usize,
    /// Capacity of the bounded queues between stages.
    pub channel_capacity: usize,
    /// Parallelism used for operators that do not request their own.
    pub parallelism: usize,
}

impl Default for Config {
    fn default() -> Self {
        let parallelism = std::thread::available_parallelism()
            .map(|q| q.get())
            .unwrap_or(4);
        Self {
            microbatch_size: DEFAULT_MICROBATCH_SIZE,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            parallelism,
        }
    }
}

impl Config {
    /// Build the configuration from the defaults and the environment
    /// variable overrides.
    pub fn from_env() -> Result<Config, ConfigError> {
        let mut config = Config::default();
        if let Some(size) = read_env_usize(MBSIZE_ENV_VAR)? {
            config.microbatch_size = size;
        }
        if let Some(par) = read_env_usize(PARDEG_ENV_VAR)? {
            config.parallelism = par;
        }
        Ok(config)
    }

    /// Parse a TOML configuration string.
    pub fn from_toml_str(config_str: &str) -> Result<Config, ConfigError> {
        let config: Config = toml::from_str(config_str)?;
        config.validate()?;
        Ok(config)
    }

    /// Read a TOML configuration file.
    pub fn from_file(toml_path: impl AsRef<Path>) -> Result<Config, ConfigError> {
        let content = std::fs::read_to_string(toml_path)?;
        Self::from_toml_str(&content)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.microbatch_size == 0 {
            return Err(ConfigError::Invalid(
                "the microbatch size should be positive".into(),
            ));
        }
        if self.channel_capacity == 0 {
            return Err(ConfigError::Invalid(
                "the channel capacity should be positive".into(),
            ));
        }
        if self.parallelism == 0 {
            return Err(ConfigError::Invalid(
                "the parallelism should be positive".into(),
            ));
        }
        Ok(())
    }

    /// Install this configuration as the process-wide one. Only the first
    /// installation wins, later calls are ignored.
    pub(crate) fn install(&self) {
        let _ = GLOBAL.set(self.clone());
    }

    /// The process-wide configuration. Initialised from the environment the
    /// first time it is accessed, unless an executor installed one before.
    pub fn global() -> &'static Config {
        GLOBAL.get_or_init(|| match Config::from_env() {
            Ok(config) => config,
            Err(e) => {
                log::warn!("invalid environment configuration, using defaults: {e}");
                Config::default()
            }
        })
    }
}

fn read_env_usize(var: &str) -> Result<Option<usize>, ConfigError> {
    match env::var(var) {
        Ok(value) => {
            let parsed = usize::from_str(value.trim()).map_err(|_| {
                ConfigError::Invalid(format!("{var} must be a positive integer, got {value:?}"))
            })?;
            if parsed == 0 {
                return Err(ConfigError::Invalid(format!(
                    "{var} must be a positive integer, got 0"
                )));
            }
            Ok(Some(parsed))
        }
        Err(env::VarError::NotPresent) => Ok(None),
        Err(e) => Err(ConfigError::Environment(var.to_string(), e)),
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Serialization error: {0}")]
    Serialization(#[from] toml::de::Error),

    #[error("Input-Output error: {0}")]
    IO(#[from] std::io::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),

    #[error("Missing environment variable {0}: {1}")]
    Environment(String, env::VarError),
}
