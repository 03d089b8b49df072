//! Starter processor modules.
//!
//! A template defines the processor class and stubs every hook, so a new
//! script loads and passes data through unchanged before any edits.

use crate::error::{BridgeError, BridgeResult, ImportError};
use crate::script::{is_identifier, ScriptLanguage};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;
use tracing::info;

const PYTHON_TEMPLATE: &str = r#"import numpy as np


class {class}:

    # A new processor is constructed whenever the stream settings change
    def __init__(self, num_channels, sample_rate):
        self.num_channels = num_channels
        self.sample_rate = sample_rate

    # Process each data block in place. data has shape (channels, samples).
    def process(self, data):
        pass

    # Called at start of acquisition
    def start_acquisition(self):
        pass

    # Called when acquisition is stopped
    def stop_acquisition(self):
        pass

    # Respond to TTL events
    def handle_ttl_event(self, state, sample_number, channel, line, stream_id):
        pass

    # Respond to spike events
    def handle_spike_event(self):
        pass

    # Called when recording starts
    def start_recording(self, recording_dir):
        pass

    # Called when recording stops
    def stop_recording(self):
        pass
"#;

const RHAI_TEMPLATE: &str = r#"// A new processor is constructed whenever the stream settings change.
// The returned map is available as `this` in every other function.
fn {class}(num_channels, sample_rate) {
    #{ num_channels: num_channels, sample_rate: sample_rate }
}

// Process each data block. data is an array of channel rows; return the
// transformed block with the same shape, or () to leave it unchanged.
fn process(data) {
    data
}

// Called at start of acquisition
fn start_acquisition() { }

// Called when acquisition is stopped
fn stop_acquisition() { }

// Respond to TTL events
fn handle_ttl_event(state, sample_number, channel, line, stream_id) { }

// Respond to spike events
fn handle_spike_event() { }

// Called when recording starts
fn start_recording(recording_dir) { }

// Called when recording stops
fn stop_recording() { }
"#;

/// A starter module for one language.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessorTemplate {
    language: ScriptLanguage,
    class_name: String,
}

impl ProcessorTemplate {
    /// Template for `language` defining `class_name`.
    pub fn new(language: ScriptLanguage, class_name: impl Into<String>) -> Self {
        Self {
            language,
            class_name: class_name.into(),
        }
    }

    /// Template whose language matches the extension of `path`.
    pub fn for_path(path: &Path, class_name: impl Into<String>) -> Result<Self, ImportError> {
        let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");
        let language =
            ScriptLanguage::from_extension(ext).ok_or_else(|| ImportError::PathInvalid {
                path: path.display().to_string(),
                reason: format!("unsupported script extension '{ext}'"),
            })?;
        Ok(Self::new(language, class_name))
    }

    /// Language of the rendered module.
    pub fn language(&self) -> ScriptLanguage {
        self.language
    }

    /// Module source text.
    pub fn render(&self) -> String {
        let source = match self.language {
            ScriptLanguage::Python => PYTHON_TEMPLATE,
            ScriptLanguage::Rhai => RHAI_TEMPLATE,
        };
        source.replace("{class}", &self.class_name)
    }

    /// Write the module to `path`. Never overwrites an existing file.
    pub fn write_to(&self, path: &Path) -> BridgeResult<()> {
        if !is_identifier(&self.class_name) {
            return Err(ImportError::PathInvalid {
                path: path.display().to_string(),
                reason: format!("'{}' is not a valid class name", self.class_name),
            }
            .into());
        }

        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)
            .map_err(BridgeError::Io)?;
        file.write_all(self.render().as_bytes())?;
        info!("Wrote {} processor template to {:?}", self.language, path);
        Ok(())
    }
}
