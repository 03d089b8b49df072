//! PyO3 implementation of the module loader.
//!
//! Python modules follow a simple template: a class (default
//! `PyProcessor`) constructed with `(num_channels, sample_rate)` whose
//! `process(data)` mutates a `float32` numpy array of shape
//! `(channels, samples)` in place. Whatever `process` returns is ignored.
//!
//! The interpreter is prepared once per process. The GIL is acquired for each
//! call inside the bridge's own exclusive scope, always in that order.

use super::{ForeignArray, ForeignProcessor, ModuleLoader};
use crate::error::{CallError, ImportError, InstantiationError, ReloadError};
use crate::events::Hook;
use crate::runtime::{ExclusiveScope, ForeignRuntime};
use crate::script::{ScriptLanguage, ScriptReference};
use numpy::{PyArray2, PyArrayMethods, PyUntypedArrayMethods};
use once_cell::sync::OnceCell;
use pyo3::exceptions::{PyModuleNotFoundError, PySyntaxError};
use pyo3::prelude::*;
use pyo3::types::{PyDict, PyList};
use tracing::{debug, info, warn};

static INTERPRETER: OnceCell<()> = OnceCell::new();

/// Render an exception with its traceback, if any.
fn describe(py: Python<'_>, err: &PyErr) -> String {
    let message = err.to_string();
    match err.traceback(py).and_then(|tb| tb.format().ok()) {
        Some(traceback) => format!("{traceback}{message}"),
        None => message,
    }
}

fn raised(py: Python<'_>, method: &str, err: &PyErr) -> CallError {
    CallError::Raised {
        method: method.to_string(),
        message: describe(py, err),
    }
}

fn classify_import_error(py: Python<'_>, module_id: &str, err: &PyErr) -> ImportError {
    if err.is_instance_of::<PySyntaxError>(py) {
        let line = err
            .value(py)
            .getattr("lineno")
            .and_then(|lineno| lineno.extract::<usize>())
            .ok();
        return ImportError::SyntaxError {
            module: module_id.to_string(),
            message: err.to_string(),
            line,
        };
    }

    // A missing dependency of the module is an error raised by the module,
    // not a missing module.
    if err.is_instance_of::<PyModuleNotFoundError>(py) {
        let missing = err
            .value(py)
            .getattr("name")
            .and_then(|name| name.extract::<String>())
            .ok();
        if missing.as_deref() == Some(module_id) {
            return ImportError::NotFound {
                module: module_id.to_string(),
            };
        }
    }

    ImportError::Raised {
        module: module_id.to_string(),
        message: describe(py, err),
    }
}

/// Loads `.py` processor modules through the embedded CPython interpreter.
#[derive(Debug)]
pub struct PythonLoader {
    processor_class: String,
}

impl PythonLoader {
    /// Create a loader, preparing the interpreter on first use.
    pub fn new(processor_class: impl Into<String>) -> Self {
        ForeignRuntime::global()
            .ensure_initialized(&INTERPRETER, |_| {
                pyo3::prepare_freethreaded_python();
                Python::with_gil(|py| {
                    info!("Python interpreter initialized ({})", py.version());
                    if py.import("numpy").is_err() {
                        warn!("numpy is not importable; block processing will fault");
                    }
                });
                Ok::<_, std::convert::Infallible>(())
            })
            .unwrap_or_else(|never| match never {});

        Self {
            processor_class: processor_class.into(),
        }
    }

    fn forget_module(py: Python<'_>, module_id: &str) -> PyResult<()> {
        let modules = py
            .import("sys")?
            .getattr("modules")?
            .downcast_into::<PyDict>()?;
        if modules.contains(module_id)? {
            modules.del_item(module_id)?;
        }
        Ok(())
    }
}

impl ModuleLoader for PythonLoader {
    type Module = Py<PyModule>;
    type Processor = PythonProcessor;

    fn language(&self) -> ScriptLanguage {
        ScriptLanguage::Python
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
        let search_dir = script.search_dir().to_string_lossy().into_owned();

        Python::with_gil(|py| {
            let sys_path = py
                .import("sys")
                .and_then(|sys| sys.getattr("path"))
                .and_then(|path| path.downcast_into::<PyList>().map_err(PyErr::from))
                .map_err(|e| classify_import_error(py, module_id, &e))?;
            let known = sys_path
                .contains(&search_dir)
                .map_err(|e| classify_import_error(py, module_id, &e))?;
            if !known {
                debug!("Adding {} to sys.path", search_dir);
                sys_path
                    .append(&search_dir)
                    .map_err(|e| classify_import_error(py, module_id, &e))?;
            }

            // The path finders cache directory listings; a file created since
            // the last import would otherwise be missed.
            py.import("importlib")
                .and_then(|importlib| importlib.call_method0("invalidate_caches"))
                .map_err(|e| classify_import_error(py, module_id, &e))?;

            let module = py
                .import(module_id)
                .map_err(|e| classify_import_error(py, module_id, &e))?;

            let has_class = module
                .hasattr(self.processor_class.as_str())
                .map_err(|e| classify_import_error(py, module_id, &e))?;
            if !has_class {
                // Drop it from sys.modules so a corrected file is re-read by
                // the next import.
                if let Err(e) = Self::forget_module(py, module_id) {
                    warn!("Failed to remove '{}' from sys.modules: {}", module_id, e);
                }
                return Err(ImportError::MissingSymbol {
                    module: module_id.to_string(),
                    symbol: self.processor_class.clone(),
                });
            }

            Ok(module.unbind())
        })
    }

    fn instantiate(
        &mut self,
        _scope: &ExclusiveScope<'_>,
        module: &Self::Module,
        channel_count: usize,
        sample_rate: f32,
    ) -> Result<Self::Processor, InstantiationError> {
        Python::with_gil(|py| {
            let object = module
                .bind(py)
                .getattr(self.processor_class.as_str())
                .and_then(|class| class.call1((channel_count, sample_rate)))
                .map_err(|e| InstantiationError {
                    class: self.processor_class.clone(),
                    message: describe(py, &e),
                })?;
            Ok(PythonProcessor {
                object: object.unbind(),
            })
        })
    }

    fn reload(
        &mut self,
        _scope: &ExclusiveScope<'_>,
        module: &mut Self::Module,
    ) -> Result<(), ReloadError> {
        Python::with_gil(|py| {
            let bound = module.bind(py);
            let name = bound
                .name()
                .map(|n| n.to_string())
                .unwrap_or_else(|_| "<unknown>".to_string());
            py.import("importlib")
                .and_then(|importlib| importlib.call_method1("reload", (bound,)))
                .map(|_| ())
                .map_err(|e| ReloadError {
                    module: name,
                    message: describe(py, &e),
                })
        })
    }
}

/// A live instance of the module's processor class.
#[derive(Debug)]
pub struct PythonProcessor {
    object: Py<PyAny>,
}

impl PythonProcessor {
    fn call_if_defined<'py>(
        &self,
        py: Python<'py>,
        method: &str,
        args: impl IntoPyObject<'py, Target = pyo3::types::PyTuple>,
    ) -> Result<(), CallError> {
        let object = self.object.bind(py);
        let defined = object.hasattr(method).map_err(|e| raised(py, method, &e))?;
        if !defined {
            return Ok(());
        }
        object
            .call_method1(method, args)
            .map(|_| ())
            .map_err(|e| raised(py, method, &e))
    }
}

impl ForeignProcessor for PythonProcessor {
    type Array = NumpyBlock;

    fn allocate_block(
        &mut self,
        _scope: &ExclusiveScope<'_>,
        channels: usize,
        samples: usize,
    ) -> Result<Self::Array, CallError> {
        Python::with_gil(|py| {
            let array = PyArray2::<f32>::zeros(py, [channels, samples], false);
            Ok(NumpyBlock {
                array: array.unbind(),
            })
        })
    }

    fn process(
        &mut self,
        _scope: &ExclusiveScope<'_>,
        block: &mut Self::Array,
    ) -> Result<(), CallError> {
        Python::with_gil(|py| self.call_if_defined(py, "process", (block.array.bind(py),)))
    }

    fn call_hook(&mut self, _scope: &ExclusiveScope<'_>, hook: Hook<'_>) -> Result<(), CallError> {
        let method = hook.method_name();
        Python::with_gil(|py| match hook {
            Hook::Ttl(event) => self.call_if_defined(
                py,
                method,
                (
                    event.state,
                    event.sample_number,
                    event.channel,
                    event.line,
                    event.stream_id,
                ),
            ),
            Hook::StartRecording(dir) => {
                self.call_if_defined(py, method, (dir.to_string_lossy().into_owned(),))
            }
            Hook::Spike | Hook::StartAcquisition | Hook::StopAcquisition | Hook::StopRecording => {
                self.call_if_defined(py, method, ())
            }
        })
    }

    fn release(self, _scope: &ExclusiveScope<'_>) {
        // Dropping with the GIL held decrements the refcount immediately.
        Python::with_gil(|_py| drop(self.object));
    }
}

/// A `float32` numpy array of shape `(channels, samples)`.
#[derive(Debug)]
pub struct NumpyBlock {
    array: Py<PyArray2<f32>>,
}

impl ForeignArray for NumpyBlock {
    fn shape(&self, _scope: &ExclusiveScope<'_>) -> Result<(usize, usize), CallError> {
        Python::with_gil(|py| match self.array.bind(py).shape() {
            [channels, samples] => Ok((*channels, *samples)),
            other => Err(CallError::Marshal(format!(
                "array has {} dimensions, expected 2",
                other.len()
            ))),
        })
    }

    fn copy_in_row(
        &mut self,
        _scope: &ExclusiveScope<'_>,
        channel: usize,
        samples: &[f32],
    ) -> Result<(), CallError> {
        Python::with_gil(|py| {
            let bound = self.array.bind(py);
            let mut view = bound
                .try_readwrite()
                .map_err(|e| CallError::Marshal(e.to_string()))?;
            let data = view
                .as_slice_mut()
                .map_err(|e| CallError::Marshal(e.to_string()))?;
            let start = channel * samples.len();
            let row = data
                .get_mut(start..start + samples.len())
                .ok_or_else(|| CallError::Marshal(format!("channel {channel} out of range")))?;
            row.copy_from_slice(samples);
            Ok(())
        })
    }

    fn copy_out_row(
        &self,
        _scope: &ExclusiveScope<'_>,
        channel: usize,
        dest: &mut [f32],
    ) -> Result<(), CallError> {
        Python::with_gil(|py| {
            let bound = self.array.bind(py);
            let view = bound
                .try_readonly()
                .map_err(|e| CallError::Marshal(e.to_string()))?;
            let data = view
                .as_slice()
                .map_err(|e| CallError::Marshal(e.to_string()))?;
            let start = channel * dest.len();
            let row = data
                .get(start..start + dest.len())
                .ok_or_else(|| CallError::Marshal(format!("channel {channel} out of range")))?;
            dest.copy_from_slice(row);
            Ok(())
        })
    }
}
