//! Error types for the script bridge.
//!
//! Every foreign-side failure is converted into one of the typed errors below at
//! the call site that produced it; no interpreter exception type crosses into
//! host code. The lifecycle controller turns these into a `Faulted` transition
//! plus a diagnostic string, so none of them is ever fatal to the host.
//!
//! ## Error Hierarchy
//!
//! - **`ImportError`**: the script could not be resolved, parsed, executed or
//!   does not expose the processor class.
//! - **`InstantiationError`**: the processor constructor raised or is missing.
//! - **`ReloadError`**: re-executing the module's top-level code failed.
//! - **`CallError`**: any per-invocation failure while processing a block,
//!   forwarding an event, or notifying an acquisition/recording hook.
//! - **`ConfigError`**: configuration could not be loaded or is invalid.
//!
//! `BridgeError` consolidates these for callers that do not care which stage
//! failed (the `script_runner` binary, for instance).

use thiserror::Error;

/// Convenience alias for results using the umbrella error type.
pub type BridgeResult<T> = std::result::Result<T, BridgeError>;

/// Failure to import a module.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ImportError {
    #[error("Invalid script path '{path}': {reason}")]
    PathInvalid { path: String, reason: String },

    #[error("Module '{module}' not found on the search path")]
    NotFound { module: String },

    #[error("Syntax error in module '{module}': {message}")]
    SyntaxError {
        module: String,
        message: String,
        line: Option<usize>,
    },

    #[error("Module '{module}' does not define '{symbol}'")]
    MissingSymbol { module: String, symbol: String },

    #[error("Module '{module}' raised during import: {message}")]
    Raised { module: String, message: String },
}

/// Failure to construct the processing object.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("Failed to instantiate '{class}': {message}")]
pub struct InstantiationError {
    pub class: String,
    pub message: String,
}

/// Failure to re-execute a loaded module.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("Failed to reload module '{module}': {message}")]
pub struct ReloadError {
    pub module: String,
    pub message: String,
}

/// Failure of a single call into a live processing object.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CallError {
    #[error("{method}() raised: {message}")]
    Raised { method: String, message: String },

    #[error("Failed to exchange block data: {0}")]
    Marshal(String),

    #[error("Block shape mismatch: expected {expected:?}, found {found:?}")]
    ShapeMismatch {
        expected: (usize, usize),
        found: (usize, usize),
    },

    #[error("Foreign adapter panicked: {0}")]
    Panicked(String),
}

/// Configuration loading or validation failure.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Configuration load error: {0}")]
    LoadError(#[from] Box<figment::Error>),

    #[error("Configuration validation error: {0}")]
    ValidationError(String),
}

/// Umbrella error for callers spanning several stages.
#[derive(Error, Debug)]
pub enum BridgeError {
    #[error(transparent)]
    Import(#[from] ImportError),

    #[error(transparent)]
    Instantiation(#[from] InstantiationError),

    #[error(transparent)]
    Reload(#[from] ReloadError),

    #[error(transparent)]
    Call(#[from] CallError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[cfg(feature = "hot_reload")]
    #[error("File watch error: {0}")]
    Watch(#[from] notify::Error),

    #[error("Feature '{0}' is not enabled. Please build with --features {0}")]
    FeatureNotEnabled(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = ImportError::MissingSymbol {
            module: "filter".into(),
            symbol: "PyProcessor".into(),
        };
        assert_eq!(err.to_string(), "Module 'filter' does not define 'PyProcessor'");
    }

    #[test]
    fn test_call_error_display() {
        let err = CallError::Raised {
            method: "process".into(),
            message: "ValueError: bad".into(),
        };
        assert_eq!(err.to_string(), "process() raised: ValueError: bad");
    }

    #[test]
    fn test_bridge_error_is_transparent() {
        let err: BridgeError = ReloadError {
            module: "gain".into(),
            message: "boom".into(),
        }
        .into();
        assert_eq!(err.to_string(), "Failed to reload module 'gain': boom");
    }
}
