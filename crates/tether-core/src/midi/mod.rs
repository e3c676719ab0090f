//! Per-cycle MIDI buffer access
//!
//! MIDI port buffers are opaque byte regions owned by the server for one cycle.
//! Each server supplies a [`MidiCodec`] that knows its layout; [`MidiBuffer`]
//! pairs a region with its codec and is what the realtime callback works with.
//!
//! All operations here are allocation-free and lock-free. Events are kept in
//! time order: a `put` with a timestamp earlier than the last written event is
//! refused, and a `put` into a full buffer drops the event and reports
//! [`MidiError::Overflow`] without touching what was written before.

mod packed;

pub use packed::{PackedMidiCodec, PACKED_HEADER_SIZE, PACKED_ENTRY_SIZE};

use crate::error::MidiError;
use crate::types::Frames;

/// One timestamped MIDI message inside a cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MidiEvent<'a> {
    /// Frame offset within the cycle
    pub time: Frames,
    /// Raw MIDI bytes
    pub data: &'a [u8],
}

/// Server-specific MIDI buffer layout
pub trait MidiCodec: Send + Sync {
    /// Number of events currently in the buffer
    fn event_count(&self, buf: &[u8]) -> u32;

    /// Event at `index`, in time order
    fn event<'b>(&self, buf: &'b [u8], index: u32) -> Option<MidiEvent<'b>>;

    /// Append an event; must not disturb previously written events on failure
    ///
    /// A codec that cannot tell the cycle length may report `InvalidTime`
    /// with `nframes` 0; [`MidiBuffer::put`] fills it in.
    fn put(&self, buf: &mut [u8], time: Frames, data: &[u8]) -> Result<(), MidiError>;

    /// Reset to an empty buffer for a cycle of `nframes`
    fn clear(&self, buf: &mut [u8], nframes: Frames);
}

/// A port's MIDI buffer for the current cycle
pub struct MidiBuffer<'c> {
    bytes: &'c mut [u8],
    codec: &'static dyn MidiCodec,
    nframes: Frames,
}

impl<'c> MidiBuffer<'c> {
    pub fn new(bytes: &'c mut [u8], codec: &'static dyn MidiCodec, nframes: Frames) -> Self {
        Self {
            bytes,
            codec,
            nframes,
        }
    }

    pub fn event_count(&self) -> u32 {
        self.codec.event_count(self.bytes)
    }

    pub fn event(&self, index: u32) -> Option<MidiEvent<'_>> {
        self.codec.event(self.bytes, index)
    }

    /// Append an event at `time` frames into the cycle
    pub fn put(&mut self, time: Frames, data: &[u8]) -> Result<(), MidiError> {
        if data.is_empty() {
            return Err(MidiError::Empty);
        }
        if time >= self.nframes {
            return Err(MidiError::InvalidTime {
                time,
                nframes: self.nframes,
            });
        }
        self.codec
            .put(self.bytes, time, data)
            .map_err(|e| match e {
                MidiError::InvalidTime { time, .. } => MidiError::InvalidTime {
                    time,
                    nframes: self.nframes,
                },
                other => other,
            })
    }

    pub fn clear(&mut self) {
        self.codec.clear(self.bytes, self.nframes);
    }

    /// Capacity of the underlying region in bytes
    pub fn capacity(&self) -> usize {
        self.bytes.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = MidiEvent<'_>> {
        (0..self.event_count()).filter_map(move |i| self.event(i))
    }
}

impl std::fmt::Debug for MidiBuffer<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MidiBuffer")
            .field("events", &self.event_count())
            .field("capacity", &self.bytes.len())
            .field("nframes", &self.nframes)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Layout that refuses everything the way libjack reports a late event
    struct LateOnly;

    impl MidiCodec for LateOnly {
        fn event_count(&self, _buf: &[u8]) -> u32 {
            0
        }

        fn event<'b>(&self, _buf: &'b [u8], _index: u32) -> Option<MidiEvent<'b>> {
            None
        }

        fn put(&self, _buf: &mut [u8], time: Frames, _data: &[u8]) -> Result<(), MidiError> {
            Err(MidiError::InvalidTime { time, nframes: 0 })
        }

        fn clear(&self, _buf: &mut [u8], _nframes: Frames) {}
    }

    static LATE: LateOnly = LateOnly;

    #[test]
    fn test_invalid_time_reports_cycle_length() {
        let mut bytes = vec![0u8; 64];
        let mut buf = MidiBuffer::new(&mut bytes, &LATE, 256);
        assert_eq!(
            buf.put(10, &[0x90, 60, 100]),
            Err(MidiError::InvalidTime {
                time: 10,
                nframes: 256
            })
        );
    }
}
