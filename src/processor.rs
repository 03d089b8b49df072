//! Host-facing processing stage.
//!
//! [`ScriptProcessor`] is what a host pipeline plugs in. It keeps the stream
//! layout the host reports, slices the host's planar buffer into per-stream
//! blocks and routes everything else (parameter changes, events, acquisition
//! and recording notifications) to the [`LifecycleController`].

use crate::config::StreamConfig;
use crate::controller::{CycleOutcome, LifecycleController, ReloadOutcome};
use crate::error::BridgeError;
use crate::events::{SpikeEvent, TtlEvent};
use crate::loader::ModuleLoader;
use crate::marshal::StreamBlock;
use crate::status::ModuleState;
use std::collections::HashMap;
use std::path::Path;
use tracing::{debug, trace, warn};

/// Name of the string parameter holding the script path.
pub const SCRIPT_PATH_PARAMETER: &str = "script_path";

/// A continuous data stream as reported by the host.
#[derive(Debug, Clone, PartialEq)]
pub struct DataStream {
    /// Host stream identifier
    pub id: u16,
    /// Display name
    pub name: String,
    /// Continuous channels in the stream
    pub channel_count: usize,
    /// Samples per second
    pub sample_rate: f32,
    /// Whether blocks of this stream are handed to the module
    pub enabled: bool,
}

impl DataStream {
    /// An enabled stream.
    pub fn new(id: u16, name: impl Into<String>, channel_count: usize, sample_rate: f32) -> Self {
        Self {
            id,
            name: name.into(),
            channel_count,
            sample_rate,
            enabled: true,
        }
    }
}

/// Planar sample buffer: one contiguous vector per global channel.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PlanarBuffer {
    channels: Vec<Vec<f32>>,
}

impl PlanarBuffer {
    /// `num_channels` channels of `num_samples` zeros.
    pub fn new(num_channels: usize, num_samples: usize) -> Self {
        Self {
            channels: vec![vec![0.0; num_samples]; num_channels],
        }
    }

    /// Wrap existing channel data.
    pub fn from_channels(channels: Vec<Vec<f32>>) -> Self {
        Self { channels }
    }

    /// Number of channels.
    pub fn num_channels(&self) -> usize {
        self.channels.len()
    }

    /// Samples in the shortest channel.
    pub fn num_samples(&self) -> usize {
        self.channels.iter().map(Vec::len).min().unwrap_or(0)
    }

    /// Read one channel.
    pub fn channel(&self, index: usize) -> Option<&[f32]> {
        self.channels.get(index).map(Vec::as_slice)
    }

    /// Write one channel.
    pub fn channel_mut(&mut self, index: usize) -> Option<&mut [f32]> {
        self.channels.get_mut(index).map(Vec::as_mut_slice)
    }

    /// All channels.
    pub fn channels(&self) -> &[Vec<f32>] {
        &self.channels
    }
}

/// The scripted processing stage.
#[derive(Debug)]
pub struct ScriptProcessor<L: ModuleLoader> {
    controller: LifecycleController<L>,
    streams: Vec<DataStream>,
    enabled_by_default: bool,
}

impl<L: ModuleLoader> ScriptProcessor<L> {
    /// Wrap a controller.
    pub fn new(controller: LifecycleController<L>, config: &StreamConfig) -> Self {
        Self {
            controller,
            streams: Vec::new(),
            enabled_by_default: config.enabled_by_default,
        }
    }

    /// The lifecycle controller.
    pub fn controller(&self) -> &LifecycleController<L> {
        &self.controller
    }

    /// Mutable access to the lifecycle controller.
    pub fn controller_mut(&mut self) -> &mut LifecycleController<L> {
        &mut self.controller
    }

    /// Current module state.
    pub fn state(&self) -> ModuleState {
        self.controller.state()
    }

    /// Streams from the last settings update.
    pub fn streams(&self) -> &[DataStream] {
        &self.streams
    }

    /// Total continuous channels across all streams.
    pub fn total_channels(&self) -> usize {
        self.streams.iter().map(|s| s.channel_count).sum()
    }

    /// Take a new stream layout and rebuild the processing object for it.
    ///
    /// Streams seen before keep their enable flag; new ones start with the
    /// configured default.
    pub fn update_settings(&mut self, streams: impl IntoIterator<Item = DataStream>) {
        let previous: HashMap<u16, bool> =
            self.streams.iter().map(|s| (s.id, s.enabled)).collect();
        self.streams = streams
            .into_iter()
            .map(|mut stream| {
                stream.enabled = previous
                    .get(&stream.id)
                    .copied()
                    .unwrap_or(self.enabled_by_default && stream.enabled);
                stream
            })
            .collect();

        let channel_count = self.total_channels();
        let sample_rate = self.streams.first().map_or(0.0, |s| s.sample_rate);
        debug!(
            "Settings updated: {} streams, {} channels @ {} Hz",
            self.streams.len(),
            channel_count,
            sample_rate
        );
        self.controller
            .apply_configuration(channel_count, sample_rate);
    }

    /// Enable or disable one stream. Returns false for an unknown id.
    pub fn set_stream_enabled(&mut self, stream_id: u16, enabled: bool) -> bool {
        match self.streams.iter_mut().find(|s| s.id == stream_id) {
            Some(stream) => {
                stream.enabled = enabled;
                true
            }
            None => false,
        }
    }

    /// Handle a parameter change. Returns false for unknown parameters.
    ///
    /// A new `script_path` is imported immediately and the processing object
    /// is built for the current stream layout.
    pub fn parameter_value_changed(&mut self, name: &str, value: &str) -> bool {
        if name != SCRIPT_PATH_PARAMETER {
            trace!("Ignoring parameter '{}'", name);
            return false;
        }
        self.load_script(value);
        true
    }

    /// Set the script path and import it. Failures are recorded as a fault.
    pub fn load_script(&mut self, path: impl AsRef<Path>) -> ModuleState {
        self.controller.set_script_path(path);
        if let Err(err) = self.controller.import_and_activate() {
            debug!("Import failed: {}", err);
        }
        self.controller.state()
    }

    /// Reload the current module.
    pub fn reload(&mut self) -> Result<ReloadOutcome, BridgeError> {
        self.controller.reload()
    }

    /// Process one host buffer.
    ///
    /// Streams occupy consecutive global channel ranges in layout order.
    /// `samples_in_block` maps stream id to its valid sample count; a missing
    /// entry means no samples. A stream whose channels are missing or shorter
    /// than its sample count is skipped.
    pub fn process(
        &mut self,
        buffer: &mut PlanarBuffer,
        samples_in_block: &HashMap<u16, usize>,
    ) -> CycleOutcome {
        if self.controller.state() != ModuleState::Ready {
            return CycleOutcome::Skipped;
        }

        let mut blocks = Vec::with_capacity(self.streams.len());
        let mut rest: &mut [Vec<f32>] = &mut buffer.channels;

        for stream in &self.streams {
            if rest.len() < stream.channel_count {
                warn!(
                    "Stream {} needs {} channels, buffer has {} left; skipping",
                    stream.id,
                    stream.channel_count,
                    rest.len()
                );
                break;
            }
            let (channels, tail) = std::mem::take(&mut rest).split_at_mut(stream.channel_count);
            rest = tail;

            let sample_count = samples_in_block.get(&stream.id).copied().unwrap_or(0);
            if channels.iter().any(|c| c.len() < sample_count) {
                warn!(
                    "Stream {} reports {} samples but a channel is shorter; skipping",
                    stream.id, sample_count
                );
                continue;
            }

            blocks.push(
                StreamBlock::new(
                    stream.id,
                    channels.iter_mut().map(Vec::as_mut_slice).collect(),
                    sample_count,
                )
                .with_enabled(stream.enabled),
            );
        }

        self.controller.process_block(&mut blocks)
    }

    /// Forward a TTL event.
    pub fn handle_ttl_event(&mut self, event: &TtlEvent) {
        self.controller.handle_ttl_event(event);
    }

    /// Forward a spike.
    pub fn handle_spike(&mut self, spike: &SpikeEvent) {
        self.controller.handle_spike(spike);
    }

    /// Broadcast messages are not forwarded.
    pub fn handle_broadcast_message(&mut self, message: &str) {
        trace!("Ignoring broadcast message ({} bytes)", message.len());
    }

    /// Acquisition is starting. Returns whether the module was ready.
    pub fn start_acquisition(&mut self) -> bool {
        self.controller.notify_acquisition_start()
    }

    /// Acquisition stopped. Returns whether the module was ready.
    pub fn stop_acquisition(&mut self) -> bool {
        self.controller.notify_acquisition_stop()
    }

    /// Recording into `directory` is starting.
    pub fn start_recording(&mut self, directory: &Path) {
        self.controller.notify_recording_start(directory);
    }

    /// Recording stopped.
    pub fn stop_recording(&mut self) {
        self.controller.notify_recording_stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockLoader, MockProbe, MockScript, Transform};

    fn stage(script: MockScript) -> (ScriptProcessor<MockLoader>, MockProbe) {
        let loader = MockLoader::new(script);
        let probe = loader.probe();
        let stage = ScriptProcessor::new(LifecycleController::new(loader), &StreamConfig::default());
        (stage, probe)
    }

    fn two_streams() -> Vec<DataStream> {
        vec![
            DataStream::new(100, "probe A", 2, 30000.0),
            DataStream::new(101, "probe B", 1, 2500.0),
        ]
    }

    #[test]
    fn test_settings_drive_construction() {
        let (mut stage, probe) = stage(MockScript::default());
        stage.update_settings(two_streams());
        assert!(stage.parameter_value_changed("script_path", "/scripts/gain.rhai"));

        assert_eq!(stage.state(), ModuleState::Ready);
        assert_eq!(stage.total_channels(), 3);
        let config = stage.controller().config();
        assert_eq!(config.channel_count, 3);
        assert_eq!(config.sample_rate, 30000.0);
        assert_eq!(probe.constructed(), 1);
    }

    #[test]
    fn test_unknown_parameter_is_ignored() {
        let (mut stage, probe) = stage(MockScript::default());
        assert!(!stage.parameter_value_changed("gain", "2.0"));
        assert_eq!(probe.loads(), 0);
        assert_eq!(stage.state(), ModuleState::Unloaded);
    }

    #[test]
    fn test_streams_map_to_consecutive_channels() {
        let (mut stage, _) = stage(MockScript {
            transform: Transform::Offset(10.0),
            ..MockScript::default()
        });
        stage.update_settings(two_streams());
        stage.load_script("/scripts/offset.rhai");
        stage.set_stream_enabled(100, false);

        let mut buffer = PlanarBuffer::from_channels(vec![vec![1.0; 4], vec![2.0; 4], vec![3.0; 4]]);
        let counts = HashMap::from([(100, 4), (101, 3)]);
        let outcome = stage.process(&mut buffer, &counts);

        assert_eq!(outcome, CycleOutcome::Completed { streams: 1 });
        assert_eq!(buffer.channel(0), Some(&[1.0; 4][..]));
        assert_eq!(buffer.channel(1), Some(&[2.0; 4][..]));
        assert_eq!(buffer.channel(2), Some(&[13.0, 13.0, 13.0, 3.0][..]));
    }

    #[test]
    fn test_missing_counts_mean_no_samples() {
        let (mut stage, probe) = stage(MockScript::default());
        stage.update_settings(two_streams());
        stage.load_script("/scripts/passthrough.rhai");

        let mut buffer = PlanarBuffer::new(3, 8);
        stage.process(&mut buffer, &HashMap::new());
        assert_eq!(probe.process_calls(), 0);
    }

    #[test]
    fn test_short_buffer_never_overruns() {
        let (mut stage, probe) = stage(MockScript::default());
        stage.update_settings(two_streams());
        stage.load_script("/scripts/passthrough.rhai");

        // Only two channels: stream 101 has no room.
        let mut buffer = PlanarBuffer::new(2, 4);
        let counts = HashMap::from([(100, 16), (101, 4)]);
        let outcome = stage.process(&mut buffer, &counts);

        assert_eq!(outcome, CycleOutcome::Completed { streams: 0 });
        assert_eq!(probe.process_calls(), 0);
        assert_eq!(stage.state(), ModuleState::Ready);
    }

    #[test]
    fn test_enable_flags_survive_settings_update() {
        let (mut stage, _) = stage(MockScript::default());
        stage.update_settings(two_streams());
        assert!(stage.set_stream_enabled(101, false));
        assert!(!stage.set_stream_enabled(999, false));

        stage.update_settings(two_streams());
        assert!(stage.streams()[0].enabled);
        assert!(!stage.streams()[1].enabled);
    }

    #[test]
    fn test_streams_disabled_by_default() {
        let loader = MockLoader::new(MockScript::default());
        let mut stage = ScriptProcessor::new(
            LifecycleController::new(loader),
            &StreamConfig {
                enabled_by_default: false,
            },
        );
        stage.update_settings(two_streams());
        assert!(stage.streams().iter().all(|s| !s.enabled));
    }

    #[test]
    fn test_acquisition_hooks_report_readiness() {
        let (mut stage, probe) = stage(MockScript::default());
        assert!(!stage.start_acquisition());

        stage.load_script("/scripts/passthrough.rhai");
        assert!(stage.start_acquisition());
        stage.handle_broadcast_message("{\"cmd\":\"ignored\"}");
        stage.start_recording(Path::new("/data"));
        stage.stop_recording();
        assert!(stage.stop_acquisition());

        assert_eq!(
            probe.hooks(),
            vec![
                "start_acquisition",
                "start_recording",
                "stop_recording",
                "stop_acquisition"
            ]
        );
    }
}
