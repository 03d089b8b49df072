//! Module state and the notifications published to the editor side.

use serde::Serialize;
use std::fmt;
use std::path::Path;
use tracing::{info, warn};

/// Label shown while no module is loaded.
pub const NO_MODULE_LABEL: &str = "No Module Loaded";

/// Lifecycle state of the foreign module.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
pub enum ModuleState {
    /// Nothing imported yet
    #[default]
    Unloaded,
    /// Import or reload in progress
    Loading,
    /// A live processing object accepts calls
    Ready,
    /// The last foreign operation failed; no calls until a successful reload
    Faulted,
}

impl fmt::Display for ModuleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ModuleState::Unloaded => "unloaded",
            ModuleState::Loading => "loading",
            ModuleState::Ready => "ready",
            ModuleState::Faulted => "faulted",
        };
        f.write_str(name)
    }
}

/// Snapshot published on every state transition.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModuleStatus {
    /// New state
    pub state: ModuleState,
    /// Text for the editor's module label
    pub label: String,
    /// Full script path, if one is set
    pub tooltip: Option<String>,
    /// Human-readable reason for the last fault
    pub diagnostic: Option<String>,
}

impl ModuleStatus {
    /// Build the status for `state`, deriving the label from the module id.
    pub fn new(
        state: ModuleState,
        module_id: Option<&str>,
        script_path: Option<&Path>,
        diagnostic: Option<String>,
    ) -> Self {
        let label = match (state, module_id) {
            (ModuleState::Unloaded, _) => NO_MODULE_LABEL.to_string(),
            (ModuleState::Loading, _) => "Importing".to_string(),
            (ModuleState::Ready, Some(id)) => id.to_string(),
            (ModuleState::Ready, None) => String::new(),
            (ModuleState::Faulted, Some(id)) => format!("(ERROR) {id}"),
            (ModuleState::Faulted, None) => "(ERROR)".to_string(),
        };

        Self {
            state,
            label,
            tooltip: script_path.map(|p| p.display().to_string()),
            diagnostic,
        }
    }
}

/// Receives status updates (the editor collaborator).
pub trait StatusListener: Send {
    /// Called after every state transition.
    fn status_changed(&mut self, status: &ModuleStatus);
}

impl<F> StatusListener for F
where
    F: FnMut(&ModuleStatus) + Send,
{
    fn status_changed(&mut self, status: &ModuleStatus) {
        self(status)
    }
}

/// Default listener: logs every transition.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingStatusListener;

impl StatusListener for TracingStatusListener {
    fn status_changed(&mut self, status: &ModuleStatus) {
        match &status.diagnostic {
            Some(diagnostic) if status.state == ModuleState::Faulted => {
                warn!(label = %status.label, "Module faulted: {}", diagnostic)
            }
            _ => info!(label = %status.label, "Module {}", status.state),
        }
    }
}
