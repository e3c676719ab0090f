//! Port arena and its realtime snapshot
//!
//! Ports live in a slot map. A [`PortHandle`] is a slot index plus the
//! generation the slot had when the port was registered, so a handle to an
//! unregistered port can never alias a newer port in the same slot.
//!
//! The control side edits a private [`PortTable`] and publishes a clone into a
//! `basedrop::SharedCell`. The process thread loads one snapshot per cycle.
//! Retired snapshots are freed on the collector thread.
//!
//! Server ports outlive the snapshot swap: a cycle that loaded the old table
//! may still ask the server for a removed port's buffer, so the control side
//! waits in [`LiveTable::retire`] until that cycle has ended before the server
//! port is released.

use std::collections::BTreeSet;
use std::sync::atomic::{fence, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use basedrop::{Shared, SharedCell};

use crate::gc::gc_handle;
use crate::server::ServerPort;
use crate::sync::lock;
use crate::types::{DataType, Frames, LatencyMode, LatencyRange, PortFlags};

/// Opaque reference to a registered port
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PortHandle {
    index: u32,
    generation: u32,
}

impl PortHandle {
    pub fn index(&self) -> u32 {
        self.index
    }
}

/// Control-side bookkeeping for one port
#[derive(Debug, Clone, Default)]
pub(crate) struct PortState {
    /// Remote port names, mirrored so connections survive a reconnect
    pub connections: BTreeSet<String>,
    /// Ranges set by the host, per [`LatencyMode`]
    pub latency: [Option<LatencyRange>; 2],
    /// Fixed hardware/driver latency added in the port's own direction
    pub systemic: Frames,
}

pub(crate) fn mode_slot(mode: LatencyMode) -> usize {
    match mode {
        LatencyMode::Capture => 0,
        LatencyMode::Playback => 1,
    }
}

pub(crate) struct PortEntry {
    pub short_name: String,
    pub name: String,
    pub data_type: DataType,
    pub flags: PortFlags,
    /// None once the server side is gone (connection closed)
    pub server_port: Option<Arc<dyn ServerPort>>,
    /// Number of the last cycle that handed out this port's buffer
    pub claimed: AtomicU64,
    pub state: Mutex<PortState>,
}

impl PortEntry {
    pub fn new(
        short_name: String,
        data_type: DataType,
        flags: PortFlags,
        server_port: Arc<dyn ServerPort>,
    ) -> Self {
        Self {
            name: server_port.name(),
            short_name,
            data_type,
            flags,
            server_port: Some(server_port),
            claimed: AtomicU64::new(0),
            state: Mutex::new(PortState::default()),
        }
    }

    /// Same port, bound to a different (or no) server-side port
    pub fn rebind(&self, server_port: Option<Arc<dyn ServerPort>>) -> Self {
        Self {
            name: server_port
                .as_ref()
                .map(|p| p.name())
                .unwrap_or_else(|| self.name.clone()),
            short_name: self.short_name.clone(),
            data_type: self.data_type,
            flags: self.flags,
            server_port,
            claimed: AtomicU64::new(0),
            state: Mutex::new(lock(&self.state).clone()),
        }
    }

    /// Claim the buffer for `cycle`; false if it was already claimed
    pub fn claim(&self, cycle: u64) -> bool {
        self.claimed.swap(cycle, Ordering::AcqRel) != cycle
    }
}

#[derive(Clone, Default)]
struct Slot {
    generation: u32,
    entry: Option<Arc<PortEntry>>,
}

/// Slot map of registered ports
#[derive(Clone, Default)]
pub(crate) struct PortTable {
    slots: Vec<Slot>,
    free: Vec<u32>,
}

impl PortTable {
    pub fn insert(&mut self, entry: PortEntry) -> PortHandle {
        let entry = Some(Arc::new(entry));
        match self.free.pop() {
            Some(index) => {
                let slot = &mut self.slots[index as usize];
                slot.entry = entry;
                PortHandle {
                    index,
                    generation: slot.generation,
                }
            }
            None => {
                self.slots.push(Slot {
                    generation: 0,
                    entry,
                });
                PortHandle {
                    index: (self.slots.len() - 1) as u32,
                    generation: 0,
                }
            }
        }
    }

    pub fn get(&self, handle: PortHandle) -> Option<&Arc<PortEntry>> {
        self.slots
            .get(handle.index as usize)
            .filter(|slot| slot.generation == handle.generation)
            .and_then(|slot| slot.entry.as_ref())
    }

    pub fn remove(&mut self, handle: PortHandle) -> Option<Arc<PortEntry>> {
        let slot = self.slots.get_mut(handle.index as usize)?;
        if slot.generation != handle.generation {
            return None;
        }
        let entry = slot.entry.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(handle.index);
        Some(entry)
    }

    /// Swap the entry behind a live handle
    pub fn replace(&mut self, handle: PortHandle, entry: PortEntry) {
        if let Some(slot) = self.slots.get_mut(handle.index as usize) {
            if slot.generation == handle.generation && slot.entry.is_some() {
                slot.entry = Some(Arc::new(entry));
            }
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (PortHandle, &Arc<PortEntry>)> + '_ {
        self.slots.iter().enumerate().filter_map(|(index, slot)| {
            slot.entry.as_ref().map(|entry| {
                (
                    PortHandle {
                        index: index as u32,
                        generation: slot.generation,
                    },
                    entry,
                )
            })
        })
    }

    pub fn handles(&self) -> Vec<PortHandle> {
        self.iter().map(|(handle, _)| handle).collect()
    }

    pub fn find(&self, name: &str) -> Option<PortHandle> {
        self.iter()
            .find(|(_, entry)| entry.name == name || entry.short_name == name)
            .map(|(handle, _)| handle)
    }

    pub fn len(&self) -> usize {
        self.slots.iter().filter(|slot| slot.entry.is_some()).count()
    }

    /// Drop every entry, invalidating all handles
    pub fn clear(&mut self) {
        let handles = self.handles();
        for handle in handles {
            self.remove(handle);
        }
    }
}

const RETIRE_POLL: Duration = Duration::from_micros(250);

/// Published snapshot plus the cycle counter, shared with the process thread
pub(crate) struct LiveTable {
    cell: SharedCell<PortTable>,
    cycles: AtomicU64,
    /// Number of the cycle currently holding a snapshot, 0 when idle
    in_flight: AtomicU64,
}

impl LiveTable {
    pub fn new() -> Self {
        Self {
            cell: SharedCell::new(Shared::new(&gc_handle(), PortTable::default())),
            cycles: AtomicU64::new(0),
            in_flight: AtomicU64::new(0),
        }
    }

    pub fn publish(&self, table: &PortTable) {
        self.cell.set(Shared::new(&gc_handle(), table.clone()));
    }

    /// Current snapshot. Lock-free.
    pub fn load(&self) -> Shared<PortTable> {
        self.cell.get()
    }

    /// Next cycle number, never 0
    fn next_cycle(&self) -> u64 {
        self.cycles.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Start a cycle: mark it in flight, then load the snapshot. Lock-free.
    pub fn enter(&self) -> (u64, Shared<PortTable>) {
        let number = self.next_cycle();
        self.in_flight.store(number, Ordering::SeqCst);
        // Pairs with the fence in `retire`: either this load sees the newer
        // table or `retire` sees this cycle in flight
        fence(Ordering::SeqCst);
        (number, self.load())
    }

    /// End cycle `number`
    pub fn leave(&self, number: u64) {
        let _ = self
            .in_flight
            .compare_exchange(number, 0, Ordering::SeqCst, Ordering::Relaxed);
    }

    /// Wait until no cycle can still hold a snapshot published before this
    /// call. False if the cycle in flight did not end within `timeout`.
    pub fn retire(&self, timeout: Duration) -> bool {
        fence(Ordering::SeqCst);
        let busy = self.in_flight.load(Ordering::SeqCst);
        if busy == 0 {
            return true;
        }
        let deadline = Instant::now() + timeout;
        while self.in_flight.load(Ordering::SeqCst) == busy {
            if Instant::now() >= deadline {
                return false;
            }
            thread::sleep(RETIRE_POLL);
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::dummy::DummyServer;
    use crate::server::AudioServer;

    fn entry(short: &str) -> PortEntry {
        let server = DummyServer::default();
        let client = server.open("t", None, Arc::new(|_: &str| {})).unwrap();
        let port = client
            .register_port(short, DataType::Audio, PortFlags::IS_INPUT)
            .unwrap();
        PortEntry::new(short.to_string(), DataType::Audio, PortFlags::IS_INPUT, port)
    }

    #[test]
    fn test_stale_handle_never_aliases() {
        let mut table = PortTable::default();
        let a = table.insert(entry("a"));
        assert!(table.remove(a).is_some());
        let b = table.insert(entry("b"));
        assert_eq!(a.index(), b.index());
        assert!(table.get(a).is_none());
        assert_eq!(table.get(b).unwrap().short_name, "b");
        assert!(table.remove(a).is_none());
    }

    #[test]
    fn test_find_by_short_or_full_name() {
        let mut table = PortTable::default();
        let h = table.insert(entry("in1"));
        assert_eq!(table.find("in1"), Some(h));
        assert_eq!(table.find("t:in1"), Some(h));
        assert_eq!(table.find("nope"), None);
    }

    #[test]
    fn test_claim_once_per_cycle() {
        let e = entry("x");
        assert!(e.claim(1));
        assert!(!e.claim(1));
        assert!(e.claim(2));
    }

    #[test]
    fn test_snapshot_isolated_from_later_edits() {
        let live = LiveTable::new();
        let mut table = PortTable::default();
        let h = table.insert(entry("a"));
        live.publish(&table);
        let snapshot = live.load();
        table.remove(h);
        live.publish(&table);
        assert!(snapshot.get(h).is_some());
        assert!(live.load().get(h).is_none());
    }

    #[test]
    fn test_retire_waits_for_cycle_in_flight() {
        let live = Arc::new(LiveTable::new());
        assert!(live.retire(Duration::ZERO));

        let (number, _snapshot) = live.enter();
        assert!(!live.retire(Duration::from_millis(5)));

        let ending = live.clone();
        let ender = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            ending.leave(number);
        });
        assert!(live.retire(Duration::from_secs(2)));
        ender.join().unwrap();
    }

    #[test]
    fn test_stale_leave_keeps_newer_cycle_in_flight() {
        let live = LiveTable::new();
        let (first, _) = live.enter();
        let (_second, _) = live.enter();
        live.leave(first);
        assert!(!live.retire(Duration::from_millis(5)));
    }
}
