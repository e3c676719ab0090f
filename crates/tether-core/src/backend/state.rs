//! Engine state shared between the control side and the process thread

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::port_engine::{Cycle, CycleResult};
use crate::types::{DataType, Frames, SampleFormat};

/// Host process callback, run once per cycle on the realtime thread
pub type ProcessCallback = Box<dyn FnMut(&mut Cycle) -> CycleResult + Send>;

/// Lifecycle of the audio engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum EngineState {
    Stopped = 0,
    Starting = 1,
    Running = 2,
    Freewheeling = 3,
    Paused = 4,
}

impl EngineState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => EngineState::Starting,
            2 => EngineState::Running,
            3 => EngineState::Freewheeling,
            4 => EngineState::Paused,
            _ => EngineState::Stopped,
        }
    }

    /// Cycles reach the host callback in these states
    pub fn is_processing(&self) -> bool {
        matches!(self, EngineState::Running | EngineState::Freewheeling)
    }
}

impl std::fmt::Display for EngineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            EngineState::Stopped => "stopped",
            EngineState::Starting => "starting",
            EngineState::Running => "running",
            EngineState::Freewheeling => "freewheeling",
            EngineState::Paused => "paused",
        };
        f.write_str(name)
    }
}

/// MIDI messages the host may emit, silenced while freewheeling
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MidiSendKind {
    /// MIDI Machine Control
    Mmc,
    /// MIDI Time Code
    Mtc,
    /// MIDI beat clock
    Clock,
}

impl MidiSendKind {
    pub const ALL: [MidiSendKind; 3] = [MidiSendKind::Mmc, MidiSendKind::Mtc, MidiSendKind::Clock];

    pub(crate) fn index(&self) -> usize {
        match self {
            MidiSendKind::Mmc => 0,
            MidiSendKind::Mtc => 1,
            MidiSendKind::Clock => 2,
        }
    }
}

/// Snapshot of the engine's audio parameters
///
/// Live values while the engine runs, configured targets otherwise.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioParameters {
    pub driver: String,
    pub device: String,
    pub sample_rate: u32,
    pub buffer_size: Frames,
    pub periods: u32,
    pub input_channels: u32,
    pub output_channels: u32,
    pub systemic_input_latency: Frames,
    pub systemic_output_latency: Frames,
    pub sample_format: SampleFormat,
    pub interleaved: bool,
    pub midi_option: String,
    /// True when the values came from the running server
    pub live: bool,
}

/// Atomics read by the process thread and the getters
///
/// `buffer_size` is the single synchronisation word for size changes: the
/// buffer-size handler stores it last, the process thread loads it once per
/// cycle.
pub(crate) struct EngineShared {
    state: AtomicU8,
    pub sample_rate: AtomicU32,
    pub buffer_size: AtomicU32,
    raw_audio_bytes: AtomicUsize,
    raw_midi_bytes: AtomicUsize,
    /// Set by the process thread when the host returned `Fatal`
    pub stop_requested: AtomicBool,
    pub xruns: AtomicU64,
    midi_send: [AtomicBool; 3],
    /// Host callback; the process thread only ever `try_lock`s it
    pub host: Mutex<Option<ProcessCallback>>,
}

impl EngineShared {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: AtomicU8::new(EngineState::Stopped as u8),
            sample_rate: AtomicU32::new(0),
            buffer_size: AtomicU32::new(0),
            raw_audio_bytes: AtomicUsize::new(0),
            raw_midi_bytes: AtomicUsize::new(0),
            stop_requested: AtomicBool::new(false),
            xruns: AtomicU64::new(0),
            midi_send: [
                AtomicBool::new(true),
                AtomicBool::new(true),
                AtomicBool::new(true),
            ],
            host: Mutex::new(None),
        })
    }

    pub fn state(&self) -> EngineState {
        EngineState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn set_state(&self, state: EngineState) -> EngineState {
        EngineState::from_u8(self.state.swap(state as u8, Ordering::AcqRel))
    }

    /// Move `from` → `to`; false if the state was something else
    pub fn transition(&self, from: EngineState, to: EngineState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn raw_buffer_size(&self, data_type: DataType) -> usize {
        match data_type {
            DataType::Audio => self.raw_audio_bytes.load(Ordering::Acquire),
            DataType::Midi => self.raw_midi_bytes.load(Ordering::Acquire),
        }
    }

    pub fn set_raw_buffer_sizes(&self, audio: usize, midi: usize) {
        self.raw_audio_bytes.store(audio, Ordering::Release);
        self.raw_midi_bytes.store(midi, Ordering::Release);
    }

    /// Forget every live value; the engine no longer talks to a server
    pub fn zero(&self) {
        self.sample_rate.store(0, Ordering::Release);
        self.set_raw_buffer_sizes(0, 0);
        self.buffer_size.store(0, Ordering::Release);
    }

    pub fn midi_send_enabled(&self, kind: MidiSendKind) -> bool {
        self.midi_send[kind.index()].load(Ordering::Acquire)
    }

    pub fn set_midi_send_enabled(&self, kind: MidiSendKind, enabled: bool) {
        self.midi_send[kind.index()].store(enabled, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transition_only_from_expected_state() {
        let shared = EngineShared::new();
        assert!(!shared.transition(EngineState::Running, EngineState::Paused));
        assert!(shared.transition(EngineState::Stopped, EngineState::Starting));
        assert_eq!(shared.state(), EngineState::Starting);
        assert_eq!(shared.set_state(EngineState::Running), EngineState::Starting);
        assert!(shared.state().is_processing());
    }

    #[test]
    fn test_zero_clears_live_values() {
        let shared = EngineShared::new();
        shared.sample_rate.store(48000, Ordering::Release);
        shared.buffer_size.store(256, Ordering::Release);
        shared.set_raw_buffer_sizes(1024, 896);
        shared.zero();
        assert_eq!(shared.sample_rate.load(Ordering::Acquire), 0);
        assert_eq!(shared.buffer_size.load(Ordering::Acquire), 0);
        assert_eq!(shared.raw_buffer_size(DataType::Audio), 0);
        assert_eq!(shared.raw_buffer_size(DataType::Midi), 0);
    }

    #[test]
    fn test_midi_send_defaults_on() {
        let shared = EngineShared::new();
        for kind in MidiSendKind::ALL {
            assert!(shared.midi_send_enabled(kind));
        }
        shared.set_midi_send_enabled(MidiSendKind::Mtc, false);
        assert!(!shared.midi_send_enabled(MidiSendKind::Mtc));
        assert!(shared.midi_send_enabled(MidiSendKind::Clock));
    }
}
