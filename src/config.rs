//! Configuration using Figment.
//!
//! Configuration is loaded from:
//! 1. a TOML file (base configuration, optional)
//! 2. environment variables prefixed with `SCRIPT_BRIDGE_`
//!
//! Nested keys use a double underscore:
//!
//! ```text
//! SCRIPT_BRIDGE_SCRIPT_PATH=/scripts/filter.py
//! SCRIPT_BRIDGE_LOG_LEVEL=debug
//! SCRIPT_BRIDGE_RHAI__MAX_OPERATIONS=100000
//! ```
//!
//! # Example
//!
//! ```no_run
//! use script_bridge::config::BridgeConfig;
//!
//! let config = BridgeConfig::load_from("config/script_bridge.toml")?;
//! println!("Processor class: {}", config.processor_class);
//! # Ok::<(), script_bridge::error::ConfigError>(())
//! ```

use crate::error::ConfigError;
use crate::loader::DEFAULT_PROCESSOR_CLASS;
use crate::script::is_identifier;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Environment variable prefix for overrides.
pub const ENV_PREFIX: &str = "SCRIPT_BRIDGE_";

/// Top-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Script loaded at start-up (the `script_path` parameter)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub script_path: Option<PathBuf>,
    /// Class (Python) or constructor function (Rhai) every module must define
    pub processor_class: String,
    /// Logging level (trace, debug, info, warn, error)
    pub log_level: String,
    /// Rhai interpreter limits
    pub rhai: RhaiConfig,
    /// Stream handling
    pub streams: StreamConfig,
}

/// Limits applied to the process-wide Rhai engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RhaiConfig {
    /// Maximum operations a single foreign call may execute
    pub max_operations: u64,
    /// Maximum script function call depth
    pub max_call_levels: usize,
}

/// Stream handling defaults
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    /// Whether newly registered streams are processed
    pub enabled_by_default: bool,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            script_path: None,
            processor_class: DEFAULT_PROCESSOR_CLASS.to_string(),
            log_level: "info".to_string(),
            rhai: RhaiConfig::default(),
            streams: StreamConfig::default(),
        }
    }
}

impl Default for RhaiConfig {
    fn default() -> Self {
        Self {
            max_operations: 5_000_000,
            max_call_levels: 64,
        }
    }
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            enabled_by_default: true,
        }
    }
}

impl BridgeConfig {
    /// Load configuration from defaults and environment variables only.
    pub fn load() -> Result<Self, ConfigError> {
        Self::extract(Self::defaults().merge(Env::prefixed(ENV_PREFIX).split("__")))
    }

    /// Load configuration from a specific file path
    ///
    /// Precedence (highest to lowest): environment variables, the file,
    /// built-in defaults. After loading, configuration is validated.
    ///
    /// # Errors
    ///
    /// Returns a ConfigError if the file cannot be parsed or is invalid.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let figment = Self::defaults()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed(ENV_PREFIX).split("__"));
        Self::extract(figment)
    }

    fn defaults() -> Figment {
        Figment::from(Serialized::defaults(BridgeConfig::default()))
    }

    fn extract(figment: Figment) -> Result<Self, ConfigError> {
        let config: Self = figment
            .extract()
            .map_err(|e| ConfigError::LoadError(Box::new(e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration after loading
    ///
    /// Checks:
    /// - Log level is valid (trace, debug, info, warn, error)
    /// - Processor class is a valid identifier
    /// - Rhai limits are non-zero
    pub fn validate(&self) -> Result<(), ConfigError> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.log_level.as_str()) {
            return Err(ConfigError::ValidationError(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.log_level,
                valid_levels.join(", ")
            )));
        }

        if !is_identifier(&self.processor_class) {
            return Err(ConfigError::ValidationError(format!(
                "Invalid processor_class '{}'. Must be a valid identifier",
                self.processor_class
            )));
        }

        if self.rhai.max_operations == 0 {
            return Err(ConfigError::ValidationError(
                "rhai.max_operations must be greater than 0".to_string(),
            ));
        }

        if self.rhai.max_call_levels == 0 {
            return Err(ConfigError::ValidationError(
                "rhai.max_call_levels must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }

    /// Render the effective configuration as TOML.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::ValidationError(e.to_string()))
    }
}
