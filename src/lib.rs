//! Scripted processing stage for real-time multichannel pipelines.
//!
//! The stage hands each block of samples to a user module written in an
//! embedded scripting language and copies the result back into the host
//! buffer. Modules can be replaced or reloaded while the pipeline runs; any
//! failure on the script side becomes a `Faulted` state with a diagnostic
//! instead of a host crash.
//!
//! # Layout
//!
//! - [`runtime`]: process-wide exclusive-access lock for foreign calls
//! - [`loader`]: module import/instantiate/reload, Rhai and Python backends
//! - [`marshal`]: per-stream block exchange
//! - [`controller`]: the module lifecycle state machine
//! - [`events`]: TTL, spike and lifecycle hook forwarding
//! - [`processor`]: host-facing stage wrapper
//!
//! # Example
//!
//! ```no_run
//! use script_bridge::config::BridgeConfig;
//! use script_bridge::controller::LifecycleController;
//! use script_bridge::loader::RhaiLoader;
//! use script_bridge::processor::{DataStream, ScriptProcessor};
//!
//! let config = BridgeConfig::default();
//! let loader = RhaiLoader::new(&config.rhai, &config.processor_class);
//! let mut stage = ScriptProcessor::new(LifecycleController::new(loader), &config.streams);
//! stage.update_settings([DataStream::new(0, "probe", 4, 30000.0)]);
//! stage.load_script("scripts/gain.rhai");
//! ```

pub mod config;
pub mod controller;
pub mod error;
pub mod events;
pub mod loader;
pub mod marshal;
pub mod mock;
pub mod processor;
pub mod runtime;
pub mod script;
pub mod status;
pub mod template;
#[cfg(feature = "hot_reload")]
pub mod watch;

pub use controller::{CycleOutcome, LifecycleController, ReloadOutcome, SignalConfig};
pub use error::{BridgeError, BridgeResult};
pub use processor::{DataStream, PlanarBuffer, ScriptProcessor};
pub use runtime::ForeignRuntime;
pub use script::{ScriptLanguage, ScriptReference};
pub use status::{ModuleState, ModuleStatus, StatusListener};
