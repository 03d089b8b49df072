//! Lifecycle state machine for the foreign processing module.
//!
//! ```text
//!  Unloaded ──import──▶ Loading ──ok──▶ Ready ──any call error──▶ Faulted
//!                          │                ▲                        │
//!                          └──error──▶ Faulted ◀──────────┐          │
//!                                           └──reload/import─────────┘
//! ```
//!
//! The controller exclusively owns the module handle and the processing
//! object. Every foreign interaction runs inside one exclusive-access scope and
//! behind a panic boundary, so a misbehaving script or adapter ends up as a
//! `Faulted` transition with a diagnostic and never reaches the host.

use crate::error::{BridgeError, CallError, ImportError};
use crate::events::{self, Hook, SpikeEvent, TtlEvent};
use crate::loader::{ForeignProcessor, ModuleLoader};
use crate::marshal::{self, StreamBlock};
use crate::runtime::{ExclusiveScope, ForeignRuntime};
use crate::script::ScriptReference;
use crate::status::{ModuleState, ModuleStatus, StatusListener, TracingStatusListener};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::Path;
use tracing::{debug, info, warn};

/// Signal parameters the processing object is constructed with.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct SignalConfig {
    /// Total continuous channels across all streams
    pub channel_count: usize,
    /// Sample rate of the first stream, 0.0 when there is none
    pub sample_rate: f32,
}

/// Result of one `process_block` cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    /// Module not ready; no foreign call was made
    Skipped,
    /// Every enabled stream was exchanged
    Completed {
        /// Number of enabled streams handed to the marshaller
        streams: usize,
    },
    /// The exchange for `stream_id` failed; later streams were not processed
    Faulted {
        /// Stream whose exchange failed
        stream_id: u16,
    },
}

/// Result of a reload request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReloadOutcome {
    /// No module handle exists
    NothingToReload,
    /// Module re-executed and processing object rebuilt
    Reloaded,
}

/// Run one backend call behind a panic boundary.
fn contained<T>(f: impl FnOnce() -> T) -> Result<T, CallError> {
    catch_unwind(AssertUnwindSafe(f)).map_err(|payload| {
        let message = payload
            .downcast_ref::<&str>()
            .map(|s| (*s).to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "unknown panic".to_string());
        CallError::Panicked(message)
    })
}

/// Owns the module, the processing object and the module state.
pub struct LifecycleController<L: ModuleLoader> {
    runtime: &'static ForeignRuntime,
    loader: L,
    script: Option<ScriptReference>,
    path_error: Option<ImportError>,
    state: ModuleState,
    module: Option<L::Module>,
    processor: Option<L::Processor>,
    config: SignalConfig,
    diagnostic: Option<String>,
    listener: Box<dyn StatusListener>,
}

impl<L: ModuleLoader> std::fmt::Debug for LifecycleController<L> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LifecycleController")
            .field("state", &self.state)
            .field("script", &self.script)
            .field("config", &self.config)
            .field("diagnostic", &self.diagnostic)
            .finish()
    }
}

impl<L: ModuleLoader> LifecycleController<L> {
    /// Create an unloaded controller that logs status changes.
    pub fn new(loader: L) -> Self {
        Self {
            runtime: ForeignRuntime::global(),
            loader,
            script: None,
            path_error: None,
            state: ModuleState::Unloaded,
            module: None,
            processor: None,
            config: SignalConfig::default(),
            diagnostic: None,
            listener: Box::new(TracingStatusListener),
        }
    }

    /// Replace the status listener.
    #[must_use]
    pub fn with_listener(mut self, listener: Box<dyn StatusListener>) -> Self {
        self.listener = listener;
        self
    }

    /// Current state.
    pub fn state(&self) -> ModuleState {
        self.state
    }

    /// Diagnostic recorded by the last fault, cleared on success.
    pub fn diagnostic(&self) -> Option<&str> {
        self.diagnostic.as_deref()
    }

    /// Current script reference, if the last path was valid.
    pub fn script(&self) -> Option<&ScriptReference> {
        self.script.as_ref()
    }

    /// Signal parameters of the last configuration.
    pub fn config(&self) -> SignalConfig {
        self.config
    }

    /// The module loader.
    pub fn loader(&self) -> &L {
        &self.loader
    }

    /// Whether a module handle exists (the precondition for `reload`).
    pub fn has_module(&self) -> bool {
        self.module.is_some()
    }

    /// Status as it would be published now.
    pub fn status(&self) -> ModuleStatus {
        ModuleStatus::new(
            self.state,
            self.script.as_ref().map(ScriptReference::module_id),
            self.script.as_ref().map(ScriptReference::path),
            self.diagnostic.clone(),
        )
    }

    /// Record the script path. Nothing is loaded until `import_and_activate`.
    pub fn set_script_path(&mut self, path: impl AsRef<Path>) {
        match ScriptReference::new(path.as_ref()) {
            Ok(script) => {
                debug!(
                    "Script path set: module '{}' in {:?}",
                    script.module_id(),
                    script.search_dir()
                );
                self.script = Some(script);
                self.path_error = None;
            }
            Err(err) => {
                warn!("{}", err);
                self.script = None;
                self.path_error = Some(err);
            }
        }
    }

    /// Import the module at the current path and construct its processor.
    ///
    /// Any previous module and processing object are retired first. Failure
    /// moves to `Faulted`; the error is returned as well as recorded.
    pub fn import_and_activate(&mut self) -> Result<(), BridgeError> {
        let script = match (&self.script, &self.path_error) {
            (Some(script), _) => script.clone(),
            (None, Some(err)) => {
                let err = err.clone();
                self.fault(err.to_string());
                return Err(err.into());
            }
            (None, None) => {
                let err = ImportError::PathInvalid {
                    path: String::new(),
                    reason: "no script path set".to_string(),
                };
                self.fault(err.to_string());
                return Err(err.into());
            }
        };

        info!("Importing module '{}' from {:?}", script.module_id(), script.path());
        self.transition(ModuleState::Loading);

        let runtime = self.runtime;
        let result = runtime.with_exclusive_access(|scope| {
            self.retire(scope);
            self.module = None;

            let module = contained(|| self.loader.load(scope, &script))??;
            // Kept even if construction fails, so `reload` can pick up a fix.
            let module = self.module.insert(module);
            let processor = Self::construct_with(&mut self.loader, scope, module, self.config)?;
            self.processor = Some(processor);
            Ok::<_, BridgeError>(())
        });

        self.settle(result)
    }

    /// Rebuild the processing object for new signal parameters.
    ///
    /// Only acts while `Ready`; otherwise the parameters are just stored for
    /// the next import. Exactly one release and one construction happen.
    pub fn apply_configuration(&mut self, channel_count: usize, sample_rate: f32) {
        self.config = SignalConfig {
            channel_count,
            sample_rate,
        };

        if self.state != ModuleState::Ready {
            debug!(
                "Configuration stored ({} channels @ {} Hz); module is {}",
                channel_count, sample_rate, self.state
            );
            return;
        }

        info!(
            "Reconfiguring processor: {} channels @ {} Hz",
            channel_count, sample_rate
        );
        let runtime = self.runtime;
        let result = runtime.with_exclusive_access(|scope| {
            self.retire(scope);
            let module = self
                .module
                .as_ref()
                .ok_or_else(|| CallError::Marshal("module handle missing".to_string()))?;
            let processor = Self::construct_with(&mut self.loader, scope, module, self.config)?;
            self.processor = Some(processor);
            Ok::<_, BridgeError>(())
        });

        if let Err(err) = result {
            self.fault(err.to_string());
        }
    }

    /// Re-execute the module in place and construct a fresh processor.
    pub fn reload(&mut self) -> Result<ReloadOutcome, BridgeError> {
        if self.module.is_none() {
            info!("Nothing to reload");
            return Ok(ReloadOutcome::NothingToReload);
        }

        info!("Reloading module");
        self.transition(ModuleState::Loading);

        let runtime = self.runtime;
        let result = runtime.with_exclusive_access(|scope| {
            self.retire(scope);
            let Some(module) = self.module.as_mut() else {
                return Ok(());
            };
            contained(|| self.loader.reload(scope, module))??;
            let processor = Self::construct_with(&mut self.loader, scope, module, self.config)?;
            self.processor = Some(processor);
            Ok::<_, BridgeError>(())
        });

        self.settle(result).map(|()| ReloadOutcome::Reloaded)
    }

    /// Exchange every enabled stream block with the processing object.
    ///
    /// Fails fast: the first stream error faults the module and the remaining
    /// streams of this cycle are left untouched.
    pub fn process_block(&mut self, blocks: &mut [StreamBlock<'_>]) -> CycleOutcome {
        if self.state != ModuleState::Ready {
            return CycleOutcome::Skipped;
        }

        let runtime = self.runtime;
        let result = runtime.with_exclusive_access(|scope| {
            let Some(processor) = self.processor.as_mut() else {
                return Ok(None);
            };
            let mut streams = 0;
            for block in blocks.iter_mut().filter(|b| b.enabled) {
                let stream_id = block.stream_id;
                contained(|| marshal::exchange(scope, processor, block))
                    .and_then(|r| r)
                    .map_err(|e| (stream_id, e))?;
                streams += 1;
            }
            Ok::<_, (u16, CallError)>(Some(streams))
        });

        match result {
            Ok(Some(streams)) => CycleOutcome::Completed { streams },
            Ok(None) => CycleOutcome::Skipped,
            Err((stream_id, err)) => {
                self.fault(format!("stream {stream_id}: {err}"));
                CycleOutcome::Faulted { stream_id }
            }
        }
    }

    /// Forward a TTL transition. Returns whether it was delivered.
    pub fn handle_ttl_event(&mut self, event: &TtlEvent) -> bool {
        self.forward(Hook::Ttl(event))
    }

    /// Forward a spike notification (no payload).
    pub fn handle_spike(&mut self, spike: &SpikeEvent) -> bool {
        debug!("Spike on stream {} at {}", spike.stream_id, spike.sample_number);
        self.forward(Hook::Spike)
    }

    /// Notify acquisition start. Returns whether the module was ready.
    pub fn notify_acquisition_start(&mut self) -> bool {
        let ready = self.state == ModuleState::Ready;
        self.forward(Hook::StartAcquisition);
        ready
    }

    /// Notify acquisition stop. Returns whether the module was ready.
    pub fn notify_acquisition_stop(&mut self) -> bool {
        let ready = self.state == ModuleState::Ready;
        self.forward(Hook::StopAcquisition);
        ready
    }

    /// Notify recording start into `directory`.
    pub fn notify_recording_start(&mut self, directory: &Path) -> bool {
        self.forward(Hook::StartRecording(directory))
    }

    /// Notify recording stop.
    pub fn notify_recording_stop(&mut self) -> bool {
        self.forward(Hook::StopRecording)
    }

    fn forward(&mut self, hook: Hook<'_>) -> bool {
        if self.state != ModuleState::Ready {
            return false;
        }
        let runtime = self.runtime;
        let result = runtime.with_exclusive_access(|scope| match self.processor.as_mut() {
            Some(processor) => contained(|| events::forward(scope, processor, hook)).and_then(|r| r),
            None => Ok(()),
        });
        match result {
            Ok(()) => true,
            Err(err) => {
                self.fault(err.to_string());
                false
            }
        }
    }

    fn construct_with(
        loader: &mut L,
        scope: &ExclusiveScope<'_>,
        module: &L::Module,
        config: SignalConfig,
    ) -> Result<L::Processor, BridgeError> {
        let processor = contained(|| {
            loader.instantiate(scope, module, config.channel_count, config.sample_rate)
        })??;
        debug!(
            "Constructed {}({}, {})",
            loader.processor_class(),
            config.channel_count,
            config.sample_rate
        );
        Ok(processor)
    }

    /// Release the live processing object, if any.
    fn retire(&mut self, scope: &ExclusiveScope<'_>) {
        if let Some(processor) = self.processor.take() {
            if let Err(err) = contained(|| processor.release(scope)) {
                warn!("Releasing processing object failed: {}", err);
            }
        }
    }

    fn settle(&mut self, result: Result<(), BridgeError>) -> Result<(), BridgeError> {
        match result {
            Ok(()) => {
                self.diagnostic = None;
                self.transition(ModuleState::Ready);
                Ok(())
            }
            Err(err) => {
                self.fault(err.to_string());
                Err(err)
            }
        }
    }

    fn fault(&mut self, diagnostic: String) {
        warn!("Module faulted: {}", diagnostic);
        self.diagnostic = Some(diagnostic);
        self.transition(ModuleState::Faulted);
    }

    fn transition(&mut self, state: ModuleState) {
        if self.state != state {
            debug!("Module state {} -> {}", self.state, state);
        }
        self.state = state;
        let status = self.status();
        self.listener.status_changed(&status);
    }
}

impl<L: ModuleLoader> Drop for LifecycleController<L> {
    fn drop(&mut self) {
        if self.processor.is_some() {
            let runtime = self.runtime;
            runtime.with_exclusive_access(|scope| self.retire(scope));
        }
    }
}
