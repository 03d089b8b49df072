//! Per-block exchange of sample data with the foreign processing object.
//!
//! One [`exchange`] call handles one stream:
//!
//! 1. allocate a fresh `[channels, samples]` foreign array
//! 2. copy each channel in as one row
//! 3. call `process(array)`
//! 4. check the array still has the host-reported shape
//! 5. copy each row back into the same channel memory
//!
//! Shapes come from the host-reported counts only. Nothing is written back
//! unless the call returned and the shape check passed, so a failed exchange
//! leaves the host buffer untouched. The foreign array is dropped before
//! `exchange` returns.

use crate::error::CallError;
use crate::loader::{ForeignArray, ForeignProcessor};
use crate::runtime::ExclusiveScope;
use tracing::trace;

/// One stream's samples for one processing cycle.
///
/// `channels` are distinct regions of the host buffer; only the first
/// `sample_count` samples of each are exchanged.
#[derive(Debug)]
pub struct StreamBlock<'a> {
    /// Host stream identifier
    pub stream_id: u16,
    /// Per-channel sample regions, in channel order
    pub channels: Vec<&'a mut [f32]>,
    /// Valid samples per channel in this block
    pub sample_count: usize,
    /// Disabled blocks are passed through untouched
    pub enabled: bool,
}

impl<'a> StreamBlock<'a> {
    /// An enabled block over `channels`.
    pub fn new(stream_id: u16, channels: Vec<&'a mut [f32]>, sample_count: usize) -> Self {
        Self {
            stream_id,
            channels,
            sample_count,
            enabled: true,
        }
    }

    /// Set the enabled flag.
    #[must_use]
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Number of channels in the block.
    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    /// Samples exchanged per channel.
    pub fn sample_count(&self) -> usize {
        self.sample_count
    }
}

/// Exchange one stream block with `processor`.
///
/// A block with zero samples (or zero channels) is skipped without any
/// foreign call.
pub fn exchange<P: ForeignProcessor>(
    scope: &ExclusiveScope<'_>,
    processor: &mut P,
    block: &mut StreamBlock<'_>,
) -> Result<(), CallError> {
    let channels = block.channel_count();
    let samples = block.sample_count;
    if samples == 0 || channels == 0 {
        trace!("Stream {}: empty block, skipping", block.stream_id);
        return Ok(());
    }

    if let Some((channel, region)) = block
        .channels
        .iter()
        .enumerate()
        .find(|(_, region)| region.len() < samples)
    {
        return Err(CallError::Marshal(format!(
            "stream {} channel {channel} holds {} samples, block has {samples}",
            block.stream_id,
            region.len()
        )));
    }

    let mut array = processor.allocate_block(scope, channels, samples)?;
    for (channel, region) in block.channels.iter().enumerate() {
        array.copy_in_row(scope, channel, &region[..samples])?;
    }

    processor.process(scope, &mut array)?;

    let found = array.shape(scope)?;
    if found != (channels, samples) {
        return Err(CallError::ShapeMismatch {
            expected: (channels, samples),
            found,
        });
    }

    for (channel, region) in block.channels.iter_mut().enumerate() {
        array.copy_out_row(scope, channel, &mut region[..samples])?;
    }

    trace!(
        "Stream {}: exchanged {}x{} block",
        block.stream_id,
        channels,
        samples
    );
    Ok(())
}
