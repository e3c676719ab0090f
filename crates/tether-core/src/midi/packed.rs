//! Packed MIDI buffer layout used by the in-process server
//!
//! ```text
//! ┌──────────────┬──────────────────────────┬──────────┬──────────────────┐
//! │ header (16B) │ entries (12B each) ───►  │   free   │  ◄─── event data │
//! └──────────────┴──────────────────────────┴──────────┴──────────────────┘
//! header: event_count | data_start | nframes | last_time
//! entry:  time | size | offset
//! ```
//!
//! Entries grow upward from the header and data grows downward from the end,
//! so lookup by index is O(1) and a full buffer is detected before anything is
//! written.

use super::{MidiCodec, MidiEvent};
use crate::error::MidiError;
use crate::types::Frames;

pub const PACKED_HEADER_SIZE: usize = 16;
pub const PACKED_ENTRY_SIZE: usize = 12;

const COUNT: usize = 0;
const DATA_START: usize = 4;
const NFRAMES: usize = 8;
const LAST_TIME: usize = 12;

fn read_u32(buf: &[u8], at: usize) -> Option<u32> {
    buf.get(at..at + 4)
        .and_then(|b| b.try_into().ok())
        .map(u32::from_ne_bytes)
}

fn write_u32(buf: &mut [u8], at: usize, value: u32) {
    if let Some(dst) = buf.get_mut(at..at + 4) {
        dst.copy_from_slice(&value.to_ne_bytes());
    }
}

/// Codec for the packed layout
#[derive(Debug, Default, Clone, Copy)]
pub struct PackedMidiCodec;

impl PackedMidiCodec {
    pub const INSTANCE: PackedMidiCodec = PackedMidiCodec;

    fn entry_at(index: u32) -> usize {
        PACKED_HEADER_SIZE + PACKED_ENTRY_SIZE * index as usize
    }
}

impl MidiCodec for PackedMidiCodec {
    fn event_count(&self, buf: &[u8]) -> u32 {
        read_u32(buf, COUNT).unwrap_or(0)
    }

    fn event<'b>(&self, buf: &'b [u8], index: u32) -> Option<MidiEvent<'b>> {
        if index >= self.event_count(buf) {
            return None;
        }
        let at = Self::entry_at(index);
        let time = read_u32(buf, at)?;
        let size = read_u32(buf, at + 4)? as usize;
        let offset = read_u32(buf, at + 8)? as usize;
        let data = buf.get(offset..offset.checked_add(size)?)?;
        Some(MidiEvent { time, data })
    }

    fn put(&self, buf: &mut [u8], time: Frames, data: &[u8]) -> Result<(), MidiError> {
        if buf.len() < PACKED_HEADER_SIZE {
            return Err(MidiError::Overflow);
        }
        let count = self.event_count(buf);
        let nframes = read_u32(buf, NFRAMES).unwrap_or(0);
        if nframes > 0 && time >= nframes {
            return Err(MidiError::InvalidTime { time, nframes });
        }
        let last = read_u32(buf, LAST_TIME).unwrap_or(0);
        if count > 0 && time < last {
            return Err(MidiError::OutOfOrder { time, last });
        }

        // An all-zero region is an empty buffer whose data area is the whole tail
        let data_start = match read_u32(buf, DATA_START).unwrap_or(0) as usize {
            0 => buf.len(),
            n => n.min(buf.len()),
        };
        let entries_end = Self::entry_at(count);
        let free = data_start.saturating_sub(entries_end);
        if PACKED_ENTRY_SIZE + data.len() > free {
            return Err(MidiError::Overflow);
        }

        let offset = data_start - data.len();
        buf[offset..data_start].copy_from_slice(data);
        write_u32(buf, entries_end, time);
        write_u32(buf, entries_end + 4, data.len() as u32);
        write_u32(buf, entries_end + 8, offset as u32);
        write_u32(buf, DATA_START, offset as u32);
        write_u32(buf, LAST_TIME, time);
        write_u32(buf, COUNT, count + 1);
        Ok(())
    }

    fn clear(&self, buf: &mut [u8], nframes: Frames) {
        let len = buf.len() as u32;
        write_u32(buf, COUNT, 0);
        write_u32(buf, DATA_START, len);
        write_u32(buf, NFRAMES, nframes);
        write_u32(buf, LAST_TIME, 0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::midi::MidiBuffer;

    static CODEC: PackedMidiCodec = PackedMidiCodec::INSTANCE;

    #[test]
    fn test_events_keep_time_order() {
        let mut bytes = vec![0u8; 256];
        let mut buf = MidiBuffer::new(&mut bytes, &CODEC, 64);
        buf.clear();
        buf.put(0, &[0x90, 60, 100]).unwrap();
        buf.put(10, &[0x80, 60, 0]).unwrap();
        buf.put(10, &[0xf8]).unwrap();

        assert_eq!(buf.event_count(), 3);
        let times: Vec<u32> = buf.iter().map(|e| e.time).collect();
        assert_eq!(times, vec![0, 10, 10]);
        assert_eq!(buf.event(2).unwrap().data, &[0xf8]);
    }

    #[test]
    fn test_out_of_order_rejected() {
        let mut bytes = vec![0u8; 256];
        let mut buf = MidiBuffer::new(&mut bytes, &CODEC, 64);
        buf.clear();
        buf.put(20, &[0x90, 60, 100]).unwrap();
        assert_eq!(
            buf.put(5, &[0x80, 60, 0]),
            Err(MidiError::OutOfOrder { time: 5, last: 20 })
        );
        assert_eq!(buf.event_count(), 1);
    }

    #[test]
    fn test_time_outside_cycle_rejected() {
        let mut bytes = vec![0u8; 256];
        let mut buf = MidiBuffer::new(&mut bytes, &CODEC, 64);
        buf.clear();
        assert!(matches!(
            buf.put(64, &[0x90, 60, 100]),
            Err(MidiError::InvalidTime { .. })
        ));
        assert_eq!(buf.put(0, &[]), Err(MidiError::Empty));
    }

    #[test]
    fn test_overflow_preserves_earlier_events() {
        // Room for the header and exactly three 3-byte events
        let mut bytes = vec![0u8; PACKED_HEADER_SIZE + 3 * (PACKED_ENTRY_SIZE + 3)];
        let mut buf = MidiBuffer::new(&mut bytes, &CODEC, 128);
        buf.clear();
        for t in 0..3u8 {
            buf.put(t as u32, &[0x90, t, 100]).unwrap();
        }
        for t in 3..20u32 {
            assert_eq!(buf.put(t, &[0x90, 1, 1]), Err(MidiError::Overflow));
        }
        assert_eq!(buf.event_count(), 3);
        for (i, event) in buf.iter().enumerate() {
            assert_eq!(event.time, i as u32);
            assert_eq!(event.data, &[0x90, i as u8, 100]);
        }
    }

    #[test]
    fn test_clear_empties_buffer() {
        let mut bytes = vec![0u8; 128];
        let mut buf = MidiBuffer::new(&mut bytes, &CODEC, 32);
        buf.clear();
        buf.put(1, &[0xb0, 7, 64]).unwrap();
        buf.clear();
        assert_eq!(buf.event_count(), 0);
        assert!(buf.event(0).is_none());
        buf.put(0, &[0xb0, 7, 0]).unwrap();
        assert_eq!(buf.event_count(), 1);
    }

    #[test]
    fn test_tiny_region_always_overflows() {
        let mut bytes = vec![0u8; 8];
        assert_eq!(CODEC.put(&mut bytes, 0, &[0xf8]), Err(MidiError::Overflow));
        assert_eq!(CODEC.event_count(&bytes), 0);
    }
}
