//! Event forwarding into the processing object.
//!
//! TTL and spike notifications, and the acquisition/recording lifecycle hooks,
//! are all plain method calls on the foreign object with scalar arguments. They
//! share one vocabulary, [`Hook`], so each backend maps a hook to its method
//! name and argument tuple in one place. Ready-gating and the fault transition
//! are applied by the lifecycle controller, identically to block processing.
//!
//! Broadcast messages are deliberately not forwarded.

use crate::error::CallError;
use crate::loader::ForeignProcessor;
use crate::runtime::ExclusiveScope;
use std::path::Path;
use tracing::trace;

/// A TTL line transition delivered by the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TtlEvent {
    /// Logical state of the line after the transition
    pub state: bool,
    /// Absolute sample index of the transition
    pub sample_number: i64,
    /// Event channel index
    pub channel: usize,
    /// Physical TTL line number
    pub line: u8,
    /// Stream the event belongs to
    pub stream_id: u16,
}

/// A detected spike. Only its occurrence is forwarded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpikeEvent {
    /// Stream the spike was detected on
    pub stream_id: u16,
    /// Absolute sample index of the spike peak
    pub sample_number: i64,
}

/// A call on the processing object other than `process`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Hook<'a> {
    /// `handle_ttl_event(state, sample_number, channel, line, stream_id)`
    Ttl(&'a TtlEvent),
    /// `handle_spike_event()`
    Spike,
    /// `start_acquisition()`
    StartAcquisition,
    /// `stop_acquisition()`
    StopAcquisition,
    /// `start_recording(recording_dir)`
    StartRecording(&'a Path),
    /// `stop_recording()`
    StopRecording,
}

impl Hook<'_> {
    /// Name of the foreign method this hook invokes.
    pub fn method_name(&self) -> &'static str {
        match self {
            Hook::Ttl(_) => "handle_ttl_event",
            Hook::Spike => "handle_spike_event",
            Hook::StartAcquisition => "start_acquisition",
            Hook::StopAcquisition => "stop_acquisition",
            Hook::StartRecording(_) => "start_recording",
            Hook::StopRecording => "stop_recording",
        }
    }

    /// Number of arguments the foreign method receives (excluding the object).
    pub fn arity(&self) -> usize {
        match self {
            Hook::Ttl(_) => 5,
            Hook::StartRecording(_) => 1,
            _ => 0,
        }
    }
}

/// Forward one hook to a live processing object.
pub fn forward<P: ForeignProcessor>(
    scope: &ExclusiveScope<'_>,
    processor: &mut P,
    hook: Hook<'_>,
) -> Result<(), CallError> {
    trace!("Forwarding {}()", hook.method_name());
    processor.call_hook(scope, hook)
}
