//! Core value types shared by the connection, port engine and backend

use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::{BitAnd, BitOr, BitOrAssign};

/// Audio sample type exchanged with the server (32-bit float, mono per port)
pub type Sample = f32;

/// Frame count / frame position type used for cycle sizes
pub type Frames = u32;

/// Largest cycle size any server configuration may negotiate
pub const MAX_BUFFER_SIZE: Frames = 8192;

/// Default sample rate when nothing is configured
pub const DEFAULT_SAMPLE_RATE: u32 = 48000;

/// Default cycle size when nothing is configured
pub const DEFAULT_BUFFER_SIZE: Frames = 1024;

/// Data carried by a port
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DataType {
    Audio,
    Midi,
}

impl DataType {
    /// Type string the JACK server uses for this data type
    pub fn jack_type_name(&self) -> &'static str {
        match self {
            DataType::Audio => "32 bit float mono audio",
            DataType::Midi => "8 bit raw midi",
        }
    }

    /// Map a server type string back onto a data type
    pub fn from_jack_type_name(name: &str) -> Option<Self> {
        match name {
            "32 bit float mono audio" => Some(DataType::Audio),
            "8 bit raw midi" => Some(DataType::Midi),
            _ => None,
        }
    }

    pub const ALL: [DataType; 2] = [DataType::Audio, DataType::Midi];
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DataType::Audio => write!(f, "audio"),
            DataType::Midi => write!(f, "midi"),
        }
    }
}

/// Port property bits, mirroring the server's port flags
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct PortFlags(u32);

impl PortFlags {
    pub const NONE: PortFlags = PortFlags(0);
    pub const IS_INPUT: PortFlags = PortFlags(0x1);
    pub const IS_OUTPUT: PortFlags = PortFlags(0x2);
    pub const IS_PHYSICAL: PortFlags = PortFlags(0x4);
    pub const CAN_MONITOR: PortFlags = PortFlags(0x8);
    pub const IS_TERMINAL: PortFlags = PortFlags(0x10);

    pub const fn bits(&self) -> u32 {
        self.0
    }

    pub const fn from_bits_truncate(bits: u32) -> Self {
        PortFlags(bits & 0x1f)
    }

    /// True if every bit of `other` is set in `self`
    pub const fn contains(&self, other: PortFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub fn is_input(&self) -> bool {
        self.contains(PortFlags::IS_INPUT)
    }

    pub fn is_output(&self) -> bool {
        self.contains(PortFlags::IS_OUTPUT)
    }

    pub fn is_physical(&self) -> bool {
        self.contains(PortFlags::IS_PHYSICAL)
    }
}

impl BitOr for PortFlags {
    type Output = PortFlags;

    fn bitor(self, rhs: PortFlags) -> PortFlags {
        PortFlags(self.0 | rhs.0)
    }
}

impl BitOrAssign for PortFlags {
    fn bitor_assign(&mut self, rhs: PortFlags) {
        self.0 |= rhs.0;
    }
}

impl BitAnd for PortFlags {
    type Output = PortFlags;

    fn bitand(self, rhs: PortFlags) -> PortFlags {
        PortFlags(self.0 & rhs.0)
    }
}

/// Direction a latency range refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LatencyMode {
    /// Signal travelling from hardware into the graph
    Capture,
    /// Signal travelling from the graph out to hardware
    Playback,
}

/// Minimum and maximum latency in frames
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LatencyRange {
    pub min: Frames,
    pub max: Frames,
}

impl LatencyRange {
    pub const fn new(min: Frames, max: Frames) -> Self {
        Self { min, max }
    }

    /// Range shifted by a fixed number of frames
    pub fn offset(&self, frames: Frames) -> Self {
        Self {
            min: self.min.saturating_add(frames),
            max: self.max.saturating_add(frames),
        }
    }
}

/// Per data type channel counts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ChanCount {
    pub audio: u32,
    pub midi: u32,
}

impl ChanCount {
    pub fn get(&self, data_type: DataType) -> u32 {
        match data_type {
            DataType::Audio => self.audio,
            DataType::Midi => self.midi,
        }
    }

    pub fn set(&mut self, data_type: DataType, count: u32) {
        match data_type {
            DataType::Audio => self.audio = count,
            DataType::Midi => self.midi = count,
        }
    }

    pub fn increment(&mut self, data_type: DataType) {
        self.set(data_type, self.get(data_type) + 1);
    }
}

/// Sample format of the device stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum SampleFormat {
    #[default]
    Float32,
    Int24,
    Int16,
}

/// Shared transport state as reported by the server
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum TransportState {
    #[default]
    Stopped,
    Rolling,
    Looping,
    Starting,
}

/// Transport state plus position in frames
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TransportPosition {
    pub state: TransportState,
    pub frame: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_port_flags_compose() {
        let flags = PortFlags::IS_OUTPUT | PortFlags::IS_PHYSICAL;
        assert!(flags.is_output());
        assert!(flags.is_physical());
        assert!(!flags.is_input());
        assert!(flags.contains(PortFlags::IS_OUTPUT | PortFlags::IS_PHYSICAL));
        assert!(!flags.contains(PortFlags::IS_TERMINAL));
        assert_eq!(PortFlags::from_bits_truncate(0xff).bits(), 0x1f);
    }

    #[test]
    fn test_data_type_names() {
        for t in DataType::ALL {
            assert_eq!(DataType::from_jack_type_name(t.jack_type_name()), Some(t));
        }
        assert_eq!(DataType::from_jack_type_name("video"), None);
    }

    #[test]
    fn test_chan_count() {
        let mut c = ChanCount::default();
        c.increment(DataType::Audio);
        c.increment(DataType::Audio);
        c.increment(DataType::Midi);
        assert_eq!(c.get(DataType::Audio), 2);
        assert_eq!(c.get(DataType::Midi), 1);
    }
}
