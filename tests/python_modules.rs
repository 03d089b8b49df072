//! Python backend tests. Require `--features scripting_python` and an
//! interpreter with numpy; skipped when numpy cannot be imported.

#![cfg(feature = "scripting_python")]

mod common;

use common::*;
use pyo3::prelude::*;
use script_bridge::controller::{CycleOutcome, LifecycleController, ReloadOutcome};
use script_bridge::error::{BridgeError, ImportError};
use script_bridge::loader::PythonLoader;
use script_bridge::marshal::StreamBlock;
use script_bridge::mock::StatusRecorder;
use script_bridge::status::ModuleState;
use serial_test::serial;
use tempfile::TempDir;

fn numpy_available() -> bool {
    pyo3::prepare_freethreaded_python();
    let available = Python::with_gil(|py| py.import("numpy").is_ok());
    if !available {
        eprintln!("numpy not importable, skipping");
    }
    available
}

fn controller() -> (LifecycleController<PythonLoader>, StatusRecorder) {
    let recorder = StatusRecorder::default();
    let controller = LifecycleController::new(PythonLoader::new("PyProcessor"))
        .with_listener(Box::new(recorder.clone()));
    (controller, recorder)
}

fn cycle(controller: &mut LifecycleController<PythonLoader>, data: &mut [Vec<f32>]) -> CycleOutcome {
    let samples = data.first().map_or(0, Vec::len);
    let mut blocks = vec![StreamBlock::new(
        7,
        data.iter_mut().map(|c| c.as_mut_slice()).collect(),
        samples,
    )];
    controller.process_block(&mut blocks)
}

const PASSTHROUGH_PY: &str = r#"
import numpy as np

class PyProcessor:
    def __init__(self, num_channels, sample_rate):
        self.num_channels = num_channels
        self.sample_rate = sample_rate

    def process(self, data):
        pass
"#;

const IN_PLACE_PY: &str = r#"
import numpy as np

class PyProcessor:
    def __init__(self, num_channels, sample_rate):
        self.calls = 0
        assert num_channels == 2
        assert sample_rate == 30000.0

    def process(self, data):
        self.calls += 1
        if self.calls >= 3:
            raise ValueError("third call")
        assert data.dtype == np.float32
        assert data.shape[0] == 2
        data *= 2.0
        # Returned arrays are ignored.
        return np.zeros((5, 5))

    def handle_ttl_event(self, state, sample_number, channel, line, stream_id):
        self.last_ttl = (state, sample_number, channel, line, stream_id)
"#;

#[test]
#[serial]
fn test_passthrough_module_is_bit_exact() {
    if !numpy_available() {
        return;
    }
    let dir = TempDir::new().unwrap();
    let id = unique_id("py_passthrough");
    let path = write_module(&dir, &id, "py", PASSTHROUGH_PY);
    let (mut controller, recorder) = controller();

    controller.apply_configuration(2, 30000.0);
    controller.set_script_path(&path);
    controller.import_and_activate().unwrap();
    assert_eq!(recorder.last().unwrap().label, id);

    let original = known_block(2, 10);
    let mut data = original.clone();
    assert_eq!(
        cycle(&mut controller, &mut data),
        CycleOutcome::Completed { streams: 1 }
    );
    assert_eq!(data, original);
    assert_eq!(controller.state(), ModuleState::Ready);
}

#[test]
#[serial]
fn test_in_place_mutation_is_copied_back_until_raise() {
    if !numpy_available() {
        return;
    }
    let dir = TempDir::new().unwrap();
    let path = write_module(&dir, &unique_id("py_in_place"), "py", IN_PLACE_PY);
    let (mut controller, _) = controller();

    controller.apply_configuration(2, 30000.0);
    controller.set_script_path(&path);
    controller.import_and_activate().unwrap();

    assert!(controller.handle_ttl_event(&script_bridge::events::TtlEvent {
        state: false,
        sample_number: 99,
        channel: 1,
        line: 2,
        stream_id: 7,
    }));

    for _ in 0..2 {
        let mut data = vec![vec![1.0, -2.0, 0.5], vec![4.0, 0.0, -8.0]];
        cycle(&mut controller, &mut data);
        assert_eq!(data, vec![vec![2.0, -4.0, 1.0], vec![8.0, 0.0, -16.0]]);
    }

    let original = known_block(2, 3);
    let mut data = original.clone();
    assert_eq!(
        cycle(&mut controller, &mut data),
        CycleOutcome::Faulted { stream_id: 7 }
    );
    assert_eq!(data, original);
    assert!(controller.diagnostic().unwrap().contains("third call"));
}

#[test]
#[serial]
fn test_import_errors_are_classified() {
    if !numpy_available() {
        return;
    }
    let dir = TempDir::new().unwrap();
    let cases = [
        ("py_missing_class", "class Other:\n    pass\n"),
        ("py_bad_syntax", "class PyProcessor(:\n    pass\n"),
        ("py_missing_dep", "import module_that_does_not_exist_42\n"),
    ];
    let (mut controller, _) = controller();

    let mut errors = Vec::new();
    for (prefix, source) in cases {
        let path = write_module(&dir, &unique_id(prefix), "py", source);
        controller.set_script_path(&path);
        errors.push(controller.import_and_activate().unwrap_err());
        assert_eq!(controller.state(), ModuleState::Faulted);
    }

    assert!(matches!(
        errors[0],
        BridgeError::Import(ImportError::MissingSymbol { .. })
    ));
    assert!(matches!(
        errors[1],
        BridgeError::Import(ImportError::SyntaxError { line: Some(1), .. })
    ));
    assert!(matches!(
        errors[2],
        BridgeError::Import(ImportError::Raised { .. })
    ));

    controller.set_script_path(dir.path().join("py_not_there.py"));
    assert!(matches!(
        controller.import_and_activate(),
        Err(BridgeError::Import(ImportError::NotFound { .. }))
    ));
}

#[test]
#[serial]
fn test_reload_picks_up_edits() {
    if !numpy_available() {
        return;
    }
    let dir = TempDir::new().unwrap();
    let id = unique_id("py_reload");
    let path = write_module(&dir, &id, "py", PASSTHROUGH_PY);
    let (mut controller, _) = controller();

    controller.apply_configuration(1, 1000.0);
    controller.set_script_path(&path);
    controller.import_and_activate().unwrap();

    write_module(
        &dir,
        &id,
        "py",
        "class PyProcessor:\n    def __init__(self, n, rate):\n        pass\n    def process(self, data):\n        data += 1.0\n",
    );
    // Reload compares source mtimes; make sure the edit is visible.
    let _ = std::fs::remove_dir_all(dir.path().join("__pycache__"));
    assert_eq!(controller.reload().unwrap(), ReloadOutcome::Reloaded);

    let mut data = vec![vec![1.0, 2.0]];
    cycle(&mut controller, &mut data);
    assert_eq!(data, vec![vec![2.0, 3.0]]);
}

#[test]
#[serial]
fn test_reload_recovers_from_constructor_failure() {
    if !numpy_available() {
        return;
    }
    let dir = TempDir::new().unwrap();
    let id = unique_id("py_ctor");
    let path = write_module(
        &dir,
        &id,
        "py",
        "class PyProcessor:\n    def __init__(self, n, rate):\n        raise RuntimeError('bug in constructor')\n",
    );
    let (mut controller, _) = controller();

    controller.apply_configuration(1, 1000.0);
    controller.set_script_path(&path);
    assert!(matches!(
        controller.import_and_activate(),
        Err(BridgeError::Instantiation(_))
    ));
    assert!(controller.has_module());

    write_module(&dir, &id, "py", PASSTHROUGH_PY);
    let _ = std::fs::remove_dir_all(dir.path().join("__pycache__"));
    assert_eq!(controller.reload().unwrap(), ReloadOutcome::Reloaded);
    assert_eq!(controller.state(), ModuleState::Ready);
}
