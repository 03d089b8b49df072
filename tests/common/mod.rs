//! Common test utilities for script-bridge integration tests
//!
//! - Writing processor modules into temporary directories
//! - Unique module identifiers (the Rhai module registry is process-wide)
//! - Known-value sample buffers

#![allow(dead_code)] // Not every test file uses every helper

use script_bridge::config::RhaiConfig;
use script_bridge::controller::LifecycleController;
use script_bridge::loader::RhaiLoader;
use script_bridge::mock::StatusRecorder;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use tempfile::TempDir;

static NEXT_ID: AtomicUsize = AtomicUsize::new(0);

/// Identity processor: `process` hands the block back unchanged.
pub const PASSTHROUGH: &str = r#"
fn PyProcessor(num_channels, sample_rate) {
    #{ num_channels: num_channels, sample_rate: sample_rate }
}

fn process(data) {
    data
}
"#;

/// Doubles every sample and raises from the third `process` call on.
pub const RAISES_ON_THIRD_CALL: &str = r#"
fn PyProcessor(num_channels, sample_rate) {
    #{ calls: 0 }
}

fn process(data) {
    this.calls += 1;
    if this.calls >= 3 {
        throw "ValueError: third call";
    }
    for ch in 0..data.len() {
        let row = data[ch];
        for i in 0..row.len() { row[i] *= 2.0; }
        data[ch] = row;
    }
    data
}
"#;

/// A module identifier no other test uses.
pub fn unique_id(prefix: &str) -> String {
    format!("{prefix}_{}", NEXT_ID.fetch_add(1, Ordering::SeqCst))
}

/// Write `source` as `<module_id>.<ext>` in `dir`.
pub fn write_module(dir: &TempDir, module_id: &str, ext: &str, source: &str) -> PathBuf {
    let path = dir.path().join(format!("{module_id}.{ext}"));
    std::fs::write(&path, source).expect("write module");
    path
}

/// Controller over a Rhai loader with a status recorder attached.
pub fn rhai_controller() -> (LifecycleController<RhaiLoader>, StatusRecorder) {
    let recorder = StatusRecorder::default();
    let loader = RhaiLoader::new(&RhaiConfig::default(), "PyProcessor");
    let controller = LifecycleController::new(loader).with_listener(Box::new(recorder.clone()));
    (controller, recorder)
}

/// `channels` x `samples` block of distinct known values.
pub fn known_block(channels: usize, samples: usize) -> Vec<Vec<f32>> {
    (0..channels)
        .map(|c| {
            (0..samples)
                .map(|s| (c * 1000 + s) as f32 * 0.125 - 3.0)
                .collect()
        })
        .collect()
}
