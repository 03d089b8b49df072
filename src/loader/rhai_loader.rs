//! Rhai implementation of the module loader.
//!
//! A Rhai processor module is an ordinary `.rhai` file. The processor "class"
//! is a constructor function returning the processor state, and every other
//! method is a function called with `this` bound to that state:
//!
//! ```rhai
//! fn PyProcessor(num_channels, sample_rate) {
//!     #{ num_channels: num_channels, sample_rate: sample_rate, gain: 2.0 }
//! }
//!
//! fn process(data) {
//!     for ch in 0..data.len() {
//!         let row = data[ch];
//!         for i in 0..row.len() { row[i] *= this.gain; }
//!         data[ch] = row;
//!     }
//!     data
//! }
//! ```
//!
//! Rhai passes arguments by value, so unlike the Python contract `process`
//! hands the transformed block back as its return value. Returning `()`
//! leaves the block unchanged.
//!
//! # Interpreter
//!
//! One engine, search path and module registry exist per process, shared by
//! every [`RhaiLoader`]. Limits are taken from the first loader created.
//! Script `print`/`debug` output is routed to `tracing` under the `script`
//! target.

use super::{ForeignArray, ForeignProcessor, ModuleLoader};
use crate::config::RhaiConfig;
use crate::error::{CallError, ImportError, InstantiationError, ReloadError};
use crate::events::Hook;
use crate::runtime::{ExclusiveScope, ForeignRuntime};
use crate::script::{ScriptLanguage, ScriptReference};
use once_cell::sync::OnceCell;
use rhai::{
    Array, CallFnOptions, Dynamic, Engine, EvalAltResult, FuncArgs, Scope, AST, FLOAT, INT,
};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use tracing::{debug, info};

static INTERPRETER: OnceCell<RhaiInterpreter> = OnceCell::new();

/// The process-wide Rhai engine plus its import state.
struct RhaiInterpreter {
    engine: Engine,
    registry: Mutex<Registry>,
}

#[derive(Default)]
struct Registry {
    search_path: Vec<PathBuf>,
    modules: HashMap<String, Arc<RhaiModule>>,
}

impl Registry {
    fn add_search_dir(&mut self, dir: &Path) {
        if !self.search_path.iter().any(|known| known == dir) {
            debug!("Adding {:?} to Rhai module search path", dir);
            self.search_path.push(dir.to_path_buf());
        }
    }

    fn resolve(&self, module_id: &str) -> Option<PathBuf> {
        let file_name = format!("{module_id}.{}", ScriptLanguage::Rhai.extension());
        self.search_path
            .iter()
            .map(|dir| dir.join(&file_name))
            .find(|candidate| candidate.is_file())
    }
}

impl RhaiInterpreter {
    fn new(config: &RhaiConfig) -> Self {
        let mut engine = Engine::new();

        // Bound every single foreign call; a runaway script faults instead of
        // stalling the processing thread forever.
        let max_operations = config.max_operations;
        engine.on_progress(move |count| {
            if count > max_operations {
                Some(format!("Safety limit exceeded: maximum {max_operations} operations").into())
            } else {
                None
            }
        });
        engine.set_max_call_levels(config.max_call_levels);

        engine.on_print(|text| info!(target: "script", "{}", text));
        engine.on_debug(|text, source, pos| {
            debug!(target: "script", "[{}:{}] {}", source.unwrap_or("script"), pos, text)
        });

        info!(
            "Rhai interpreter initialized (max_operations={}, max_call_levels={})",
            config.max_operations, config.max_call_levels
        );

        Self {
            engine,
            registry: Mutex::new(Registry::default()),
        }
    }

    fn registry(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Compile a module file and run its top-level statements.
    fn execute(&self, module_id: &str, path: &Path) -> Result<AST, ImportError> {
        let source = std::fs::read_to_string(path).map_err(|e| {
            debug!("Cannot read {:?}: {}", path, e);
            ImportError::NotFound {
                module: module_id.to_string(),
            }
        })?;

        let mut ast = self
            .engine
            .compile(&source)
            .map_err(|e| ImportError::SyntaxError {
                module: module_id.to_string(),
                message: e.0.to_string(),
                line: e.1.line(),
            })?;
        ast.set_source(module_id);

        self.engine
            .run_ast_with_scope(&mut Scope::new(), &ast)
            .map_err(|e| ImportError::Raised {
                module: module_id.to_string(),
                message: e.to_string(),
            })?;

        Ok(ast)
    }
}

fn has_function(ast: &AST, name: &str, arity: usize) -> bool {
    ast.iter_functions()
        .any(|f| f.name == name && f.params.len() == arity)
}

fn raised(method: &str, error: Box<EvalAltResult>) -> CallError {
    CallError::Raised {
        method: method.to_string(),
        message: error.to_string(),
    }
}

/// A loaded Rhai module. Reloading swaps its code in place, so every holder
/// of the handle sees the new definition.
#[derive(Debug)]
pub struct RhaiModule {
    module_id: String,
    path: PathBuf,
    ast: RwLock<Arc<AST>>,
}

impl RhaiModule {
    /// Module identifier.
    pub fn module_id(&self) -> &str {
        &self.module_id
    }

    /// File the module was loaded from.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn current(&self) -> Arc<AST> {
        self.ast
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn replace(&self, ast: AST) {
        *self.ast.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(ast);
    }
}

/// Loads `.rhai` processor modules.
pub struct RhaiLoader {
    interpreter: &'static RhaiInterpreter,
    processor_class: String,
}

impl std::fmt::Debug for RhaiLoader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RhaiLoader")
            .field("processor_class", &self.processor_class)
            .finish()
    }
}

impl RhaiLoader {
    /// Create a loader, initialising the process-wide interpreter on first use.
    pub fn new(config: &RhaiConfig, processor_class: impl Into<String>) -> Self {
        let interpreter = ForeignRuntime::global()
            .ensure_initialized(&INTERPRETER, |_| {
                Ok::<_, std::convert::Infallible>(RhaiInterpreter::new(config))
            })
            .unwrap_or_else(|never| match never {});

        Self {
            interpreter,
            processor_class: processor_class.into(),
        }
    }

    /// Directories currently on the shared module search path.
    pub fn search_path(&self, _scope: &ExclusiveScope<'_>) -> Vec<PathBuf> {
        self.interpreter.registry().search_path.clone()
    }
}

impl ModuleLoader for RhaiLoader {
    type Module = Arc<RhaiModule>;
    type Processor = RhaiProcessor;

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
        let module_id = script.module_id();
        let mut registry = self.interpreter.registry();
        registry.add_search_dir(script.search_dir());

        let module = match registry.modules.get(module_id) {
            Some(existing) => {
                debug!("Module '{}' already imported", module_id);
                existing.clone()
            }
            None => {
                let path = registry
                    .resolve(module_id)
                    .ok_or_else(|| ImportError::NotFound {
                        module: module_id.to_string(),
                    })?;
                let ast = self.interpreter.execute(module_id, &path)?;
                Arc::new(RhaiModule {
                    module_id: module_id.to_string(),
                    path,
                    ast: RwLock::new(Arc::new(ast)),
                })
            }
        };

        // Only modules exposing the processor class are registered, so a fixed
        // file is picked up by the next import.
        if !has_function(&module.current(), &self.processor_class, 2) {
            registry.modules.remove(module_id);
            return Err(ImportError::MissingSymbol {
                module: module_id.to_string(),
                symbol: self.processor_class.clone(),
            });
        }

        registry
            .modules
            .insert(module_id.to_string(), module.clone());
        Ok(module)
    }

    fn instantiate(
        &mut self,
        _scope: &ExclusiveScope<'_>,
        module: &Self::Module,
        channel_count: usize,
        sample_rate: f32,
    ) -> Result<Self::Processor, InstantiationError> {
        let ast = module.current();
        let class = self.processor_class.as_str();
        let error = |message: String| InstantiationError {
            class: class.to_string(),
            message,
        };

        if !has_function(&ast, class, 2) {
            return Err(error(format!("'{}' is not defined", class)));
        }

        let options = CallFnOptions::new().eval_ast(false).rewind_scope(true);
        let state: Dynamic = self
            .interpreter
            .engine
            .call_fn_with_options(
                options,
                &mut Scope::new(),
                &ast,
                class,
                (channel_count as INT, sample_rate as FLOAT),
            )
            .map_err(|e| error(e.to_string()))?;

        Ok(RhaiProcessor {
            interpreter: self.interpreter,
            module_id: module.module_id.clone(),
            ast,
            state,
        })
    }

    fn reload(
        &mut self,
        _scope: &ExclusiveScope<'_>,
        module: &mut Self::Module,
    ) -> Result<(), ReloadError> {
        let ast = self
            .interpreter
            .execute(&module.module_id, &module.path)
            .map_err(|e| ReloadError {
                module: module.module_id.clone(),
                message: e.to_string(),
            })?;
        module.replace(ast);
        Ok(())
    }
}

/// A live Rhai processor: the state returned by the constructor plus the code
/// it was constructed from.
pub struct RhaiProcessor {
    interpreter: &'static RhaiInterpreter,
    module_id: String,
    ast: Arc<AST>,
    state: Dynamic,
}

impl std::fmt::Debug for RhaiProcessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RhaiProcessor")
            .field("module_id", &self.module_id)
            .field("state", &self.state)
            .finish()
    }
}

impl RhaiProcessor {
    /// The processor state, as the constructor and hooks left it.
    pub fn state(&self) -> &Dynamic {
        &self.state
    }

    fn call_method(
        &mut self,
        name: &str,
        args: impl FuncArgs,
    ) -> Result<Dynamic, Box<EvalAltResult>> {
        let options = CallFnOptions::new()
            .eval_ast(false)
            .rewind_scope(true)
            .bind_this_ptr(&mut self.state);
        self.interpreter.engine.call_fn_with_options(
            options,
            &mut Scope::new(),
            &self.ast,
            name,
            args,
        )
    }
}

impl ForeignProcessor for RhaiProcessor {
    type Array = RhaiBlock;

    fn allocate_block(
        &mut self,
        _scope: &ExclusiveScope<'_>,
        channels: usize,
        samples: usize,
    ) -> Result<Self::Array, CallError> {
        let zeros: Array = vec![Dynamic::from_float(0.0); samples];
        Ok(RhaiBlock {
            rows: vec![Dynamic::from_array(zeros); channels],
        })
    }

    fn process(
        &mut self,
        _scope: &ExclusiveScope<'_>,
        block: &mut Self::Array,
    ) -> Result<(), CallError> {
        if !has_function(&self.ast, "process", 1) {
            return Ok(());
        }

        let result = self
            .call_method("process", (block.rows.clone(),))
            .map_err(|e| raised("process", e))?;

        if result.is_unit() {
            return Ok(());
        }
        let type_name = result.type_name();
        let rows = result.into_array().map_err(|_| {
            CallError::Marshal(format!(
                "process() returned {type_name}, expected an array or ()"
            ))
        })?;
        block.rows = rows;
        Ok(())
    }

    fn call_hook(&mut self, _scope: &ExclusiveScope<'_>, hook: Hook<'_>) -> Result<(), CallError> {
        let method = hook.method_name();
        if !has_function(&self.ast, method, hook.arity()) {
            return Ok(());
        }

        let result = match hook {
            Hook::Ttl(event) => self.call_method(
                method,
                (
                    event.state,
                    event.sample_number as INT,
                    event.channel as INT,
                    event.line as INT,
                    event.stream_id as INT,
                ),
            ),
            Hook::StartRecording(dir) => {
                self.call_method(method, (dir.to_string_lossy().into_owned(),))
            }
            Hook::Spike | Hook::StartAcquisition | Hook::StopAcquisition | Hook::StopRecording => {
                self.call_method(method, ())
            }
        };
        result.map(|_| ()).map_err(|e| raised(method, e))
    }

    fn release(self, _scope: &ExclusiveScope<'_>) {
        debug!("Releasing Rhai processor for '{}'", self.module_id);
    }
}

/// Block array handed to a Rhai `process` call: one Rhai array per channel.
#[derive(Debug, Clone)]
pub struct RhaiBlock {
    rows: Array,
}

fn sample_to_f32(value: &Dynamic) -> Option<f32> {
    value
        .as_float()
        .map(|v| v as f32)
        .or_else(|_| value.as_int().map(|v| v as f32))
        .ok()
}

impl ForeignArray for RhaiBlock {
    fn shape(&self, _scope: &ExclusiveScope<'_>) -> Result<(usize, usize), CallError> {
        let channels = self.rows.len();
        let mut samples = None;
        for (channel, row) in self.rows.iter().enumerate() {
            let len = row
                .read_lock::<Array>()
                .map(|row| row.len())
                .ok_or_else(|| CallError::Marshal(format!("row {channel} is not an array")))?;
            match samples {
                None => samples = Some(len),
                Some(expected) if expected != len => {
                    return Err(CallError::Marshal(format!(
                        "ragged block: row {channel} has {len} samples, expected {expected}"
                    )))
                }
                Some(_) => {}
            }
        }
        Ok((channels, samples.unwrap_or(0)))
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
            .ok_or_else(|| CallError::Marshal(format!("channel {channel} out of range")))?;
        let values: Array = samples
            .iter()
            .map(|&s| Dynamic::from_float(s as FLOAT))
            .collect();
        *row = Dynamic::from_array(values);
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
            .ok_or_else(|| CallError::Marshal(format!("channel {channel} out of range")))?;
        let row = row
            .read_lock::<Array>()
            .ok_or_else(|| CallError::Marshal(format!("row {channel} is not an array")))?;
        if row.len() != dest.len() {
            return Err(CallError::Marshal(format!(
                "row {channel} has {} samples, expected {}",
                row.len(),
                dest.len()
            )));
        }
        for (i, (out, value)) in dest.iter_mut().zip(row.iter()).enumerate() {
            *out = sample_to_f32(value).ok_or_else(|| {
                CallError::Marshal(format!(
                    "sample [{channel}][{i}] is {}, expected a number",
                    value.type_name()
                ))
            })?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rhai::Map;
    use std::fs;
    use tempfile::TempDir;

    // The registry is process-wide, so every test uses its own module ids.

    fn write_module(dir: &TempDir, module_id: &str, source: &str) -> ScriptReference {
        let path = dir.path().join(format!("{module_id}.rhai"));
        fs::write(&path, source).unwrap();
        ScriptReference::new(&path).unwrap()
    }

    fn loader() -> RhaiLoader {
        RhaiLoader::new(&RhaiConfig::default(), "PyProcessor")
    }

    fn state_field(processor: &RhaiProcessor, key: &str) -> Dynamic {
        let map = processor.state().clone().cast::<Map>();
        map.get(key).cloned().unwrap_or(Dynamic::UNIT)
    }

    const DOUBLER: &str = r#"
        fn PyProcessor(num_channels, sample_rate) {
            #{ channels: num_channels, rate: sample_rate, started: false, last_ttl: () }
        }

        fn process(data) {
            for ch in 0..data.len() {
                let row = data[ch];
                for i in 0..row.len() { row[i] *= 2.0; }
                data[ch] = row;
            }
            data
        }

        fn start_acquisition() { this.started = true; }

        fn handle_ttl_event(state, sample_number, channel, line, stream_id) {
            this.last_ttl = [state, sample_number, channel, line, stream_id];
        }
    "#;

    #[test]
    fn test_load_and_instantiate() {
        let dir = TempDir::new().unwrap();
        let script = write_module(&dir, "rl_doubler_ctor", DOUBLER);
        let mut loader = loader();

        ForeignRuntime::global().with_exclusive_access(|scope| {
            let module = loader.load(scope, &script).unwrap();
            assert_eq!(module.module_id(), "rl_doubler_ctor");
            assert!(loader
                .search_path(scope)
                .iter()
                .any(|d| d == dir.path()));

            let processor = loader.instantiate(scope, &module, 2, 30000.0).unwrap();
            assert_eq!(state_field(&processor, "channels").as_int().unwrap(), 2);
            assert_eq!(state_field(&processor, "rate").as_float().unwrap(), 30000.0);
        });
    }

    #[test]
    fn test_process_transforms_block() {
        let dir = TempDir::new().unwrap();
        let script = write_module(&dir, "rl_doubler_process", DOUBLER);
        let mut loader = loader();

        ForeignRuntime::global().with_exclusive_access(|scope| {
            let module = loader.load(scope, &script).unwrap();
            let mut processor = loader.instantiate(scope, &module, 2, 1000.0).unwrap();

            let mut block = processor.allocate_block(scope, 2, 3).unwrap();
            block.copy_in_row(scope, 0, &[1.0, 2.0, 3.0]).unwrap();
            block.copy_in_row(scope, 1, &[-1.0, 0.5, 0.0]).unwrap();
            processor.process(scope, &mut block).unwrap();

            assert_eq!(block.shape(scope).unwrap(), (2, 3));
            let mut out = [0.0f32; 3];
            block.copy_out_row(scope, 0, &mut out).unwrap();
            assert_eq!(out, [2.0, 4.0, 6.0]);
            block.copy_out_row(scope, 1, &mut out).unwrap();
            assert_eq!(out, [-2.0, 1.0, 0.0]);
        });
    }

    #[test]
    fn test_unit_return_and_missing_methods_are_no_ops() {
        let dir = TempDir::new().unwrap();
        let script = write_module(
            &dir,
            "rl_minimal",
            r#"
            fn PyProcessor(num_channels, sample_rate) { #{} }
            fn process(data) { }
            "#,
        );
        let mut loader = loader();

        ForeignRuntime::global().with_exclusive_access(|scope| {
            let module = loader.load(scope, &script).unwrap();
            let mut processor = loader.instantiate(scope, &module, 1, 10.0).unwrap();

            let mut block = processor.allocate_block(scope, 1, 2).unwrap();
            block.copy_in_row(scope, 0, &[0.25, 0.75]).unwrap();
            processor.process(scope, &mut block).unwrap();
            let mut out = [0.0f32; 2];
            block.copy_out_row(scope, 0, &mut out).unwrap();
            assert_eq!(out, [0.25, 0.75]);

            assert!(processor.call_hook(scope, Hook::StopRecording).is_ok());
            assert!(processor.call_hook(scope, Hook::Spike).is_ok());
        });
    }

    #[test]
    fn test_hooks_bind_processor_state() {
        let dir = TempDir::new().unwrap();
        let script = write_module(&dir, "rl_doubler_hooks", DOUBLER);
        let mut loader = loader();
        let ttl = crate::events::TtlEvent {
            state: true,
            sample_number: 1234,
            channel: 1,
            line: 3,
            stream_id: 101,
        };

        ForeignRuntime::global().with_exclusive_access(|scope| {
            let module = loader.load(scope, &script).unwrap();
            let mut processor = loader.instantiate(scope, &module, 2, 1000.0).unwrap();

            processor.call_hook(scope, Hook::StartAcquisition).unwrap();
            assert!(state_field(&processor, "started").as_bool().unwrap());

            processor.call_hook(scope, Hook::Ttl(&ttl)).unwrap();
            let last = state_field(&processor, "last_ttl").into_array().unwrap();
            assert_eq!(last.len(), 5);
            assert!(last[0].as_bool().unwrap());
            assert_eq!(last[1].as_int().unwrap(), 1234);
            assert_eq!(last[3].as_int().unwrap(), 3);
            assert_eq!(last[4].as_int().unwrap(), 101);
        });
    }

    #[test]
    fn test_import_errors_are_distinguished() {
        let dir = TempDir::new().unwrap();
        let missing = ScriptReference::new(dir.path().join("rl_absent.rhai")).unwrap();
        let broken = write_module(&dir, "rl_broken", "fn PyProcessor(a, b) { let x = ; }");
        let classless = write_module(&dir, "rl_classless", "fn process(data) { data }");
        let throws = write_module(
            &dir,
            "rl_throws",
            "fn PyProcessor(a, b) { #{} }\nthrow \"refusing to load\";",
        );
        let mut loader = loader();

        ForeignRuntime::global().with_exclusive_access(|scope| {
            assert!(matches!(
                loader.load(scope, &missing),
                Err(ImportError::NotFound { .. })
            ));
            assert!(matches!(
                loader.load(scope, &broken),
                Err(ImportError::SyntaxError { line: Some(1), .. })
            ));
            assert!(matches!(
                loader.load(scope, &classless),
                Err(ImportError::MissingSymbol { ref symbol, .. }) if symbol == "PyProcessor"
            ));
            assert!(matches!(
                loader.load(scope, &throws),
                Err(ImportError::Raised { .. })
            ));
        });
    }

    #[test]
    fn test_fixed_module_is_picked_up_after_missing_symbol() {
        let dir = TempDir::new().unwrap();
        let script = write_module(&dir, "rl_fixed_later", "fn process(data) { data }");
        let mut loader = loader();

        ForeignRuntime::global().with_exclusive_access(|scope| {
            assert!(loader.load(scope, &script).is_err());
            write_module(&dir, "rl_fixed_later", DOUBLER);
            assert!(loader.load(scope, &script).is_ok());
        });
    }

    #[test]
    fn test_reimport_returns_registered_module() {
        let dir = TempDir::new().unwrap();
        let script = write_module(&dir, "rl_cached", DOUBLER);
        let mut loader = loader();

        ForeignRuntime::global().with_exclusive_access(|scope| {
            let first = loader.load(scope, &script).unwrap();
            let second = loader.load(scope, &script).unwrap();
            assert!(Arc::ptr_eq(&first, &second));
        });
    }

    #[test]
    fn test_reload_swaps_code_in_place() {
        let dir = TempDir::new().unwrap();
        let script = write_module(&dir, "rl_reloaded", DOUBLER);
        let mut loader = loader();

        ForeignRuntime::global().with_exclusive_access(|scope| {
            let mut module = loader.load(scope, &script).unwrap();

            write_module(
                &dir,
                "rl_reloaded",
                r#"
                fn PyProcessor(num_channels, sample_rate) { #{} }
                fn process(data) { [[7.0]] }
                "#,
            );
            loader.reload(scope, &mut module).unwrap();

            // Handles obtained earlier see the new code too.
            let cached = loader.load(scope, &script).unwrap();
            assert!(Arc::ptr_eq(&cached, &module));

            let mut processor = loader.instantiate(scope, &module, 1, 1.0).unwrap();
            let mut block = processor.allocate_block(scope, 1, 1).unwrap();
            processor.process(scope, &mut block).unwrap();
            let mut out = [0.0f32; 1];
            block.copy_out_row(scope, 0, &mut out).unwrap();
            assert_eq!(out, [7.0]);
        });
    }

    #[test]
    fn test_failed_reload_keeps_previous_code() {
        let dir = TempDir::new().unwrap();
        let script = write_module(&dir, "rl_bad_reload", DOUBLER);
        let mut loader = loader();

        ForeignRuntime::global().with_exclusive_access(|scope| {
            let mut module = loader.load(scope, &script).unwrap();
            write_module(&dir, "rl_bad_reload", "fn PyProcessor(a, b) {");

            let err = loader.reload(scope, &mut module).unwrap_err();
            assert_eq!(err.module, "rl_bad_reload");
            assert!(loader.instantiate(scope, &module, 2, 100.0).is_ok());
        });
    }

    #[test]
    fn test_process_failures_become_call_errors() {
        let dir = TempDir::new().unwrap();
        let script = write_module(
            &dir,
            "rl_failing",
            r#"
            fn PyProcessor(num_channels, sample_rate) { #{ mode: "throw" } }
            fn process(data) {
                if this.mode == "throw" { throw "bad block"; }
                if this.mode == "scalar" { return 42; }
                [[1.0, 2.0]]
            }
            fn set_mode(mode) { this.mode = mode; }
            "#,
        );
        let mut loader = loader();

        ForeignRuntime::global().with_exclusive_access(|scope| {
            let module = loader.load(scope, &script).unwrap();
            let mut processor = loader.instantiate(scope, &module, 2, 1.0).unwrap();
            let mut block = processor.allocate_block(scope, 2, 3).unwrap();

            let err = processor.process(scope, &mut block).unwrap_err();
            assert!(matches!(err, CallError::Raised { ref method, .. } if method == "process"));

            processor.call_method("set_mode", ("scalar".to_string(),)).unwrap();
            assert!(matches!(
                processor.process(scope, &mut block),
                Err(CallError::Marshal(_))
            ));

            // A reshaped return is accepted here; the marshaller rejects it.
            processor.call_method("set_mode", ("reshape".to_string(),)).unwrap();
            processor.process(scope, &mut block).unwrap();
            assert_eq!(block.shape(scope).unwrap(), (1, 2));
        });
    }

    #[test]
    fn test_ragged_block_is_rejected() {
        ForeignRuntime::global().with_exclusive_access(|scope| {
            let block = RhaiBlock {
                rows: vec![
                    Dynamic::from_array(vec![Dynamic::from_float(1.0)]),
                    Dynamic::from_array(Array::new()),
                ],
            };
            assert!(matches!(block.shape(scope), Err(CallError::Marshal(_))));
        });
    }

    #[test]
    fn test_operation_limit_stops_runaway_process() {
        let dir = TempDir::new().unwrap();
        let script = write_module(
            &dir,
            "rl_runaway",
            r#"
            fn PyProcessor(num_channels, sample_rate) { #{} }
            fn process(data) { loop { } }
            "#,
        );
        let mut loader = loader();

        ForeignRuntime::global().with_exclusive_access(|scope| {
            let module = loader.load(scope, &script).unwrap();
            let mut processor = loader.instantiate(scope, &module, 1, 1.0).unwrap();
            let mut block = processor.allocate_block(scope, 1, 1).unwrap();
            assert!(matches!(
                processor.process(scope, &mut block),
                Err(CallError::Raised { .. })
            ));
        });
    }
}
