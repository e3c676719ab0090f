//! Per-cycle view handed to the host's process callback

use std::sync::Arc;

use basedrop::Shared;

use super::table::{LiveTable, PortTable};
use super::PortHandle;
use crate::midi::MidiBuffer;
use crate::types::{DataType, Frames, Sample};

/// A port's buffer for the current cycle
#[derive(Debug)]
pub enum PortBuffer<'c> {
    Audio(&'c mut [Sample]),
    Midi(MidiBuffer<'c>),
}

impl<'c> PortBuffer<'c> {
    pub fn data_type(&self) -> DataType {
        match self {
            PortBuffer::Audio(_) => DataType::Audio,
            PortBuffer::Midi(_) => DataType::Midi,
        }
    }

    pub fn into_audio(self) -> Option<&'c mut [Sample]> {
        match self {
            PortBuffer::Audio(samples) => Some(samples),
            PortBuffer::Midi(_) => None,
        }
    }

    pub fn into_midi(self) -> Option<MidiBuffer<'c>> {
        match self {
            PortBuffer::Midi(midi) => Some(midi),
            PortBuffer::Audio(_) => None,
        }
    }
}

/// One process cycle
///
/// Holds the port snapshot that was live when the cycle began, so ports
/// unregistered mid-cycle stay valid until the cycle ends. Buffers borrow the
/// cycle and cannot escape it. Unregistering waits for an in-flight cycle to
/// be dropped before the server port goes away.
pub struct Cycle {
    number: u64,
    nframes: Frames,
    table: Shared<PortTable>,
    live: Arc<LiveTable>,
}

impl Cycle {
    pub(crate) fn begin(live: &Arc<LiveTable>, nframes: Frames) -> Self {
        let (number, table) = live.enter();
        Self {
            number,
            nframes,
            table,
            live: live.clone(),
        }
    }

    /// Frames to process this cycle
    pub fn nframes(&self) -> Frames {
        self.nframes
    }

    /// Monotonic cycle counter
    pub fn number(&self) -> u64 {
        self.number
    }

    /// Buffer of `handle` for this cycle
    ///
    /// `None` for unknown or stale handles, for ports without a server side,
    /// and when the buffer was already taken this cycle. Allocation-free.
    pub fn buffer(&self, handle: PortHandle) -> Option<PortBuffer<'_>> {
        let entry = self.table.get(handle)?;
        let port = entry.server_port.as_ref()?;
        let raw = port.buffer(self.nframes)?;
        if !entry.claim(self.number) {
            return None;
        }
        // SAFETY: the server keeps the region valid for the whole cycle and
        // the claim above guarantees this is the only live borrow of it.
        match entry.data_type {
            DataType::Audio => {
                let frames = (raw.len / std::mem::size_of::<Sample>()).min(self.nframes as usize);
                let samples = unsafe {
                    std::slice::from_raw_parts_mut(raw.ptr.as_ptr() as *mut Sample, frames)
                };
                Some(PortBuffer::Audio(samples))
            }
            DataType::Midi => {
                let bytes = unsafe { std::slice::from_raw_parts_mut(raw.ptr.as_ptr(), raw.len) };
                Some(PortBuffer::Midi(MidiBuffer::new(
                    bytes,
                    port.midi_codec(),
                    self.nframes,
                )))
            }
        }
    }

    /// Zero every output port of ours that has not been handed out yet
    pub(crate) fn silence_outputs(&self) {
        for (handle, entry) in self.table.iter() {
            if !entry.flags.is_output() {
                continue;
            }
            match self.buffer(handle) {
                Some(PortBuffer::Audio(samples)) => samples.fill(0.0),
                Some(PortBuffer::Midi(mut midi)) => midi.clear(),
                None => {}
            }
        }
    }

    /// Audio buffer of `handle`, if it is an audio port
    pub fn audio(&self, handle: PortHandle) -> Option<&mut [Sample]> {
        match self.table.get(handle)?.data_type {
            DataType::Audio => self.buffer(handle)?.into_audio(),
            DataType::Midi => None,
        }
    }

    /// MIDI buffer of `handle`, if it is a MIDI port
    pub fn midi(&self, handle: PortHandle) -> Option<MidiBuffer<'_>> {
        match self.table.get(handle)?.data_type {
            DataType::Midi => self.buffer(handle)?.into_midi(),
            DataType::Audio => None,
        }
    }
}

impl Drop for Cycle {
    fn drop(&mut self) {
        self.live.leave(self.number);
    }
}
