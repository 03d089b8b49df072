//! Module loading and the foreign-object capability interfaces.
//!
//! The processing logic is only known at runtime, so the core never names a
//! concrete foreign type. It talks to three small traits instead:
//!
//! ```text
//! ModuleLoader       load / instantiate / reload          (one per language)
//!   └── ForeignProcessor   allocate_block / process / call_hook / release
//!         └── ForeignArray      shape / copy_in_row / copy_out_row
//! ```
//!
//! Module and processor are separate entities with separate lifetimes: a
//! reload only replaces the module's code, and the lifecycle controller always
//! constructs a fresh processor afterwards.
//!
//! Every method takes an [`ExclusiveScope`], so none of them can run outside
//! the global execution lock.
//!
//! # Backends
//!
//! - [`RhaiLoader`]: embedded Rhai modules (`.rhai`), always available
//! - `PythonLoader`: Python modules (`.py`) via PyO3 and numpy, behind the
//!   `scripting_python` feature

use crate::error::{CallError, ImportError, InstantiationError, ReloadError};
use crate::events::Hook;
use crate::runtime::ExclusiveScope;
use crate::script::{ScriptLanguage, ScriptReference};

#[cfg(feature = "scripting_python")]
pub mod python_loader;
pub mod rhai_loader;

#[cfg(feature = "scripting_python")]
pub use python_loader::{PythonLoader, PythonProcessor};
pub use rhai_loader::{RhaiLoader, RhaiModule, RhaiProcessor};

/// Default name of the processor class a module must define.
pub const DEFAULT_PROCESSOR_CLASS: &str = "PyProcessor";

/// A `[channels, samples]` array owned by the foreign environment for the
/// duration of one `process` call.
pub trait ForeignArray {
    /// Current `(channels, samples)` shape as seen by the foreign side.
    fn shape(&self, scope: &ExclusiveScope<'_>) -> Result<(usize, usize), CallError>;

    /// Copy one channel's samples into row `channel`.
    fn copy_in_row(
        &mut self,
        scope: &ExclusiveScope<'_>,
        channel: usize,
        samples: &[f32],
    ) -> Result<(), CallError>;

    /// Copy row `channel` into `dest`; `dest.len()` must equal the row length.
    fn copy_out_row(
        &self,
        scope: &ExclusiveScope<'_>,
        channel: usize,
        dest: &mut [f32],
    ) -> Result<(), CallError>;
}

/// An instance of the module's processor class.
pub trait ForeignProcessor: Send {
    /// Array type exchanged with `process`.
    type Array: ForeignArray;

    /// Allocate a fresh, zeroed block array of the given shape.
    fn allocate_block(
        &mut self,
        scope: &ExclusiveScope<'_>,
        channels: usize,
        samples: usize,
    ) -> Result<Self::Array, CallError>;

    /// Invoke `process(block)`. A missing method is a no-op.
    fn process(
        &mut self,
        scope: &ExclusiveScope<'_>,
        block: &mut Self::Array,
    ) -> Result<(), CallError>;

    /// Invoke a lifecycle or event hook. A missing method is a no-op.
    fn call_hook(&mut self, scope: &ExclusiveScope<'_>, hook: Hook<'_>) -> Result<(), CallError>;

    /// Release the foreign object while the lock is held.
    fn release(self, scope: &ExclusiveScope<'_>)
    where
        Self: Sized;
}

/// Imports modules of one language and instantiates their processor class.
pub trait ModuleLoader: Send {
    /// Handle to an imported module.
    type Module: Send;
    /// Processor objects produced by [`ModuleLoader::instantiate`].
    type Processor: ForeignProcessor;

    /// Language handled by this loader.
    fn language(&self) -> ScriptLanguage;

    /// Name of the class every module must define.
    fn processor_class(&self) -> &str;

    /// Add the script's directory to the search path, import the module and
    /// verify it defines the processor class.
    fn load(
        &mut self,
        scope: &ExclusiveScope<'_>,
        script: &ScriptReference,
    ) -> Result<Self::Module, ImportError>;

    /// Construct `ProcessorClass(channel_count, sample_rate)`.
    fn instantiate(
        &mut self,
        scope: &ExclusiveScope<'_>,
        module: &Self::Module,
        channel_count: usize,
        sample_rate: f32,
    ) -> Result<Self::Processor, InstantiationError>;

    /// Re-execute the module in place. On failure the module is left as it was.
    fn reload(
        &mut self,
        scope: &ExclusiveScope<'_>,
        module: &mut Self::Module,
    ) -> Result<(), ReloadError>;
}
