//! Mock foreign backend for testing without an interpreter.
//!
//! [`MockLoader`] behaves like a real loader whose "module source" is a
//! [`MockScript`]. A shared [`MockProbe`] counts every foreign interaction
//! (constructions, releases, process calls, copied samples, hooks) and lets a
//! test edit the source between reloads.

use crate::error::{CallError, ImportError, InstantiationError, ReloadError};
use crate::events::Hook;
use crate::loader::{ForeignArray, ForeignProcessor, ModuleLoader, DEFAULT_PROCESSOR_CLASS};
use crate::runtime::ExclusiveScope;
use crate::script::{ScriptLanguage, ScriptReference};
use crate::status::{ModuleStatus, StatusListener};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

/// What `process` does to the block.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub enum Transform {
    /// Leave samples unchanged
    #[default]
    Identity,
    /// Multiply every sample
    Scale(f32),
    /// Add to every sample
    Offset(f32),
    /// Replace the array with one of a different shape
    Reshape {
        /// Channels of the replacement
        channels: usize,
        /// Samples of the replacement
        samples: usize,
    },
}

/// The "source code" of a mock module.
#[derive(Debug, Clone, Default)]
pub struct MockScript {
    /// Importing fails with this error
    pub import_error: Option<ImportError>,
    /// Constructor raises
    pub constructor_raises: bool,
    /// Re-executing the module raises
    pub reload_raises: bool,
    /// Block transform
    pub transform: Transform,
    /// `process` raises from this (1-based) call on, per instance
    pub raise_on_process_call: Option<usize>,
    /// `process` panics instead of raising
    pub panic_on_process: bool,
    /// Hook method that raises
    pub failing_hook: Option<&'static str>,
}

#[derive(Debug, Default)]
struct ProbeState {
    source: Mutex<MockScript>,
    loads: AtomicUsize,
    reloads: AtomicUsize,
    constructed: AtomicUsize,
    released: AtomicUsize,
    leaked: AtomicUsize,
    max_live: AtomicUsize,
    allocations: AtomicUsize,
    process_calls: AtomicUsize,
    copied_in: AtomicUsize,
    copied_out: AtomicUsize,
    hooks: Mutex<Vec<String>>,
}

impl ProbeState {
    fn source(&self) -> MockScript {
        self.source
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn live(&self) -> usize {
        self.constructed.load(Ordering::SeqCst)
            - self.released.load(Ordering::SeqCst)
            - self.leaked.load(Ordering::SeqCst)
    }
}

/// Shared view of a mock backend's instrumentation.
#[derive(Debug, Clone, Default)]
pub struct MockProbe {
    state: Arc<ProbeState>,
}

impl MockProbe {
    /// Replace the module source; picked up by the next import or reload.
    pub fn set_script(&self, script: MockScript) {
        *self
            .state
            .source
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = script;
    }

    /// Successful and failed import attempts.
    pub fn loads(&self) -> usize {
        self.state.loads.load(Ordering::SeqCst)
    }

    /// Reload attempts.
    pub fn reloads(&self) -> usize {
        self.state.reloads.load(Ordering::SeqCst)
    }

    /// Processing objects constructed.
    pub fn constructed(&self) -> usize {
        self.state.constructed.load(Ordering::SeqCst)
    }

    /// Processing objects released through `release`.
    pub fn released(&self) -> usize {
        self.state.released.load(Ordering::SeqCst)
    }

    /// Processing objects dropped without `release`.
    pub fn leaked(&self) -> usize {
        self.state.leaked.load(Ordering::SeqCst)
    }

    /// Processing objects currently alive.
    pub fn live_instances(&self) -> usize {
        self.state.live()
    }

    /// Highest number of simultaneously alive processing objects.
    pub fn max_live_instances(&self) -> usize {
        self.state.max_live.load(Ordering::SeqCst)
    }

    /// Foreign arrays allocated.
    pub fn allocations(&self) -> usize {
        self.state.allocations.load(Ordering::SeqCst)
    }

    /// `process` invocations, including failing ones.
    pub fn process_calls(&self) -> usize {
        self.state.process_calls.load(Ordering::SeqCst)
    }

    /// Samples copied into foreign arrays.
    pub fn samples_copied_in(&self) -> usize {
        self.state.copied_in.load(Ordering::SeqCst)
    }

    /// Samples copied out of foreign arrays.
    pub fn samples_copied_out(&self) -> usize {
        self.state.copied_out.load(Ordering::SeqCst)
    }

    /// Hook method names in call order.
    pub fn hooks(&self) -> Vec<String> {
        self.state
            .hooks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Total foreign calls of any kind.
    pub fn foreign_calls(&self) -> usize {
        self.process_calls() + self.hooks().len()
    }
}

/// An imported mock module.
#[derive(Debug, Clone)]
pub struct MockModule {
    module_id: String,
    script: MockScript,
}

impl MockModule {
    /// Module identifier.
    pub fn module_id(&self) -> &str {
        &self.module_id
    }
}

/// Mock module loader.
#[derive(Debug, Clone)]
pub struct MockLoader {
    probe: MockProbe,
    processor_class: String,
}

impl MockLoader {
    /// Create a loader whose modules have the given source.
    pub fn new(script: MockScript) -> Self {
        let probe = MockProbe::default();
        probe.set_script(script);
        Self {
            probe,
            processor_class: DEFAULT_PROCESSOR_CLASS.to_string(),
        }
    }

    /// Instrumentation handle, valid after the loader is moved.
    pub fn probe(&self) -> MockProbe {
        self.probe.clone()
    }
}

impl ModuleLoader for MockLoader {
    type Module = MockModule;
    type Processor = MockProcessor;

    fn language(&self) -> ScriptLanguage {
        ScriptLanguage::Rhai
    }

    fn processor_class(&self) -> &str {
        &self.processor_class
    }

    fn load(
        &mut self,
        _scope: &ExclusiveScope<'_>,
        script: &ScriptReference,
    ) -> Result<Self::Module, ImportError> {
        let state = &self.probe.state;
        state.loads.fetch_add(1, Ordering::SeqCst);
        let source = state.source();
        if let Some(err) = source.import_error {
            return Err(err);
        }
        Ok(MockModule {
            module_id: script.module_id().to_string(),
            script: source,
        })
    }

    fn instantiate(
        &mut self,
        _scope: &ExclusiveScope<'_>,
        module: &Self::Module,
        channel_count: usize,
        sample_rate: f32,
    ) -> Result<Self::Processor, InstantiationError> {
        if module.script.constructor_raises {
            return Err(InstantiationError {
                class: self.processor_class.clone(),
                message: "constructor raised".to_string(),
            });
        }

        let state = &self.probe.state;
        state.constructed.fetch_add(1, Ordering::SeqCst);
        state.max_live.fetch_max(state.live(), Ordering::SeqCst);

        Ok(MockProcessor {
            probe: self.probe.clone(),
            script: module.script.clone(),
            channel_count,
            sample_rate,
            calls: 0,
            released: false,
        })
    }

    fn reload(
        &mut self,
        _scope: &ExclusiveScope<'_>,
        module: &mut Self::Module,
    ) -> Result<(), ReloadError> {
        let state = &self.probe.state;
        state.reloads.fetch_add(1, Ordering::SeqCst);
        let source = state.source();
        if source.reload_raises {
            return Err(ReloadError {
                module: module.module_id.clone(),
                message: "top-level code raised".to_string(),
            });
        }
        module.script = source;
        Ok(())
    }
}

/// Mock processing object.
#[derive(Debug)]
pub struct MockProcessor {
    probe: MockProbe,
    script: MockScript,
    channel_count: usize,
    sample_rate: f32,
    calls: usize,
    released: bool,
}

impl MockProcessor {
    /// Constructor arguments `(channel_count, sample_rate)`.
    pub fn construction(&self) -> (usize, f32) {
        (self.channel_count, self.sample_rate)
    }
}

impl ForeignProcessor for MockProcessor {
    type Array = MockBlock;

    fn allocate_block(
        &mut self,
        _scope: &ExclusiveScope<'_>,
        channels: usize,
        samples: usize,
    ) -> Result<Self::Array, CallError> {
        self.probe.state.allocations.fetch_add(1, Ordering::SeqCst);
        Ok(MockBlock {
            probe: self.probe.clone(),
            rows: vec![vec![0.0; samples]; channels],
        })
    }

    #[allow(clippy::panic)]
    fn process(
        &mut self,
        _scope: &ExclusiveScope<'_>,
        block: &mut Self::Array,
    ) -> Result<(), CallError> {
        self.probe.state.process_calls.fetch_add(1, Ordering::SeqCst);
        self.calls += 1;

        if matches!(self.script.raise_on_process_call, Some(n) if self.calls >= n) {
            if self.script.panic_on_process {
                panic!("mock process panicked on call {}", self.calls);
            }
            return Err(CallError::Raised {
                method: "process".to_string(),
                message: format!("RuntimeError: mock failure on call {}", self.calls),
            });
        }

        match self.script.transform {
            Transform::Identity => {}
            Transform::Scale(factor) => block
                .rows
                .iter_mut()
                .flatten()
                .for_each(|sample| *sample *= factor),
            Transform::Offset(offset) => block
                .rows
                .iter_mut()
                .flatten()
                .for_each(|sample| *sample += offset),
            Transform::Reshape { channels, samples } => {
                block.rows = vec![vec![0.0; samples]; channels];
            }
        }
        Ok(())
    }

    fn call_hook(&mut self, _scope: &ExclusiveScope<'_>, hook: Hook<'_>) -> Result<(), CallError> {
        let method = hook.method_name();
        self.probe
            .state
            .hooks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(method.to_string());

        if self.script.failing_hook == Some(method) {
            return Err(CallError::Raised {
                method: method.to_string(),
                message: "RuntimeError: mock hook failure".to_string(),
            });
        }
        Ok(())
    }

    fn release(mut self, _scope: &ExclusiveScope<'_>) {
        self.released = true;
        self.probe.state.released.fetch_add(1, Ordering::SeqCst);
    }
}

impl Drop for MockProcessor {
    fn drop(&mut self) {
        if !self.released {
            self.probe.state.leaked.fetch_add(1, Ordering::SeqCst);
        }
    }
}

/// Mock foreign array.
#[derive(Debug)]
pub struct MockBlock {
    probe: MockProbe,
    rows: Vec<Vec<f32>>,
}

impl ForeignArray for MockBlock {
    fn shape(&self, _scope: &ExclusiveScope<'_>) -> Result<(usize, usize), CallError> {
        Ok((self.rows.len(), self.rows.first().map_or(0, Vec::len)))
    }

    fn copy_in_row(
        &mut self,
        _scope: &ExclusiveScope<'_>,
        channel: usize,
        samples: &[f32],
    ) -> Result<(), CallError> {
        let row = self
            .rows
            .get_mut(channel)
            .filter(|row| row.len() == samples.len())
            .ok_or_else(|| CallError::Marshal(format!("bad row {channel}")))?;
        row.copy_from_slice(samples);
        self.probe
            .state
            .copied_in
            .fetch_add(samples.len(), Ordering::SeqCst);
        Ok(())
    }

    fn copy_out_row(
        &self,
        _scope: &ExclusiveScope<'_>,
        channel: usize,
        dest: &mut [f32],
    ) -> Result<(), CallError> {
        let row = self
            .rows
            .get(channel)
            .filter(|row| row.len() == dest.len())
            .ok_or_else(|| CallError::Marshal(format!("bad row {channel}")))?;
        dest.copy_from_slice(row);
        self.probe
            .state
            .copied_out
            .fetch_add(dest.len(), Ordering::SeqCst);
        Ok(())
    }
}

/// Listener that records every published status.
#[derive(Debug, Clone, Default)]
pub struct StatusRecorder {
    statuses: Arc<Mutex<Vec<ModuleStatus>>>,
}

impl StatusRecorder {
    /// Every status published so far.
    pub fn statuses(&self) -> Vec<ModuleStatus> {
        self.statuses
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Labels published so far.
    pub fn labels(&self) -> Vec<String> {
        self.statuses().into_iter().map(|s| s.label).collect()
    }

    /// Most recent status.
    pub fn last(&self) -> Option<ModuleStatus> {
        self.statuses().pop()
    }
}

impl StatusListener for StatusRecorder {
    fn status_changed(&mut self, status: &ModuleStatus) {
        self.statuses
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(status.clone());
    }
}
