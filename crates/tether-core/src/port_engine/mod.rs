//! Port engine: logical ports mapped onto the server namespace
//!
//! The engine owns every port the host registers. Control-side operations
//! (register, connect, latency) run under a mutex over a private
//! [`PortTable`](table::PortTable); each mutation publishes a fresh snapshot
//! that the process thread picks up at the start of its next cycle.
//!
//! ```text
//! register/connect ──► PortTable (Mutex) ──publish──► LiveTable (SharedCell)
//!                                                          │ load per cycle
//!                                                          ▼
//!                                                  Cycle::buffer(handle)
//! ```
//!
//! Server calls are never made while the table lock is held: the server may
//! deliver a notification that needs the table (buffer size → latency
//! refresh) before the call returns.

mod cycle;
mod table;

pub use cycle::{Cycle, PortBuffer};
pub use table::PortHandle;

pub(crate) use table::LiveTable;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::connection::Connection;
use crate::error::{PortError, PortResult};
use crate::server::{PortInfo, ServerClient, ServerPort};
use crate::rt;
use crate::sync::lock;
use crate::types::{ChanCount, DataType, Frames, LatencyMode, LatencyRange, PortFlags};

use table::{mode_slot, PortEntry, PortTable};

/// Ports with this in their name are software loopbacks, never hardware
const MIDI_THROUGH: &str = "Midi-Through";

/// Longest wait for a running cycle before a port is unregistered
const RETIRE_TIMEOUT: Duration = Duration::from_secs(2);

/// What the host callback asks of the engine after a cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleResult {
    Continue,
    /// Processing failed irrecoverably; the engine stops on its control side
    Fatal,
}

pub struct PortEngine {
    connection: Arc<Connection>,
    table: Mutex<PortTable>,
    live: Arc<LiveTable>,
}

impl PortEngine {
    pub fn new(connection: Arc<Connection>) -> Self {
        Self {
            connection,
            table: Mutex::new(PortTable::default()),
            live: Arc::new(LiveTable::new()),
        }
    }

    pub fn connection(&self) -> &Arc<Connection> {
        &self.connection
    }

    pub(crate) fn live(&self) -> Arc<LiveTable> {
        self.live.clone()
    }

    fn client(&self) -> PortResult<Arc<dyn ServerClient>> {
        self.connection.client().ok_or(PortError::NotConnected)
    }

    fn entry(&self, handle: PortHandle) -> PortResult<Arc<PortEntry>> {
        lock(&self.table)
            .get(handle)
            .cloned()
            .ok_or(PortError::InvalidHandle)
    }

    fn entries(&self) -> Vec<(PortHandle, Arc<PortEntry>)> {
        lock(&self.table)
            .iter()
            .map(|(handle, entry)| (handle, entry.clone()))
            .collect()
    }

    /// Full server name for one of our short names, else `name` unchanged
    fn resolve(&self, name: &str) -> String {
        let table = lock(&self.table);
        table
            .find(name)
            .and_then(|handle| table.get(handle))
            .map(|entry| entry.name.clone())
            .unwrap_or_else(|| name.to_string())
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Registration
    // ─────────────────────────────────────────────────────────────────────────

    /// Create a port on the server and make it visible to the next cycle
    pub fn register_port(
        &self,
        short_name: &str,
        data_type: DataType,
        flags: PortFlags,
    ) -> PortResult<PortHandle> {
        if short_name.is_empty() {
            return Err(PortError::InvalidName(short_name.to_string()));
        }
        let client = self.client()?;
        if lock(&self.table).find(short_name).is_some() {
            return Err(PortError::Rejected(format!("duplicate port name {}", short_name)));
        }

        let server_port = client.register_port(short_name, data_type, flags)?;
        let entry = PortEntry::new(short_name.to_string(), data_type, flags, server_port);
        let name = entry.name.clone();

        let handle = {
            let mut table = lock(&self.table);
            let handle = table.insert(entry);
            self.live.publish(&table);
            handle
        };
        log::debug!("[PORTS] registered {} ({})", name, data_type);
        Ok(handle)
    }

    /// Drop a port, disconnecting it first. Stale handles are ignored.
    ///
    /// The server port is released only once no running cycle can still
    /// reach it. Refused on the process thread, which would wait on itself.
    pub fn unregister_port(&self, handle: PortHandle) {
        if rt::is_process_thread() {
            log::error!("[PORTS] unregister_port called from the process thread, ignored");
            return;
        }
        let entry = {
            let mut table = lock(&self.table);
            let Some(entry) = table.remove(handle) else {
                return;
            };
            self.live.publish(&table);
            entry
        };

        let (Some(port), Some(client)) = (entry.server_port.as_ref(), self.connection.client())
        else {
            return;
        };
        for remote in client.connections(&entry.name) {
            if let Err(e) = disconnect_edge(client.as_ref(), &entry, &remote) {
                log::warn!("[PORTS] {}", e);
            }
        }
        if !self.live.retire(RETIRE_TIMEOUT) {
            // Stays registered until the client closes
            log::error!(
                "[PORTS] cycle still running after {:?}, keeping {} registered",
                RETIRE_TIMEOUT,
                entry.name
            );
            return;
        }
        match client.unregister_port(port.as_ref()) {
            Ok(()) => log::debug!("[PORTS] unregistered {}", entry.name),
            Err(e) => log::warn!("[PORTS] cannot unregister {}: {}", entry.name, e),
        }
    }

    /// Unregister every port and forget them
    pub fn drop_all(&self) {
        let handles = lock(&self.table).handles();
        for handle in handles {
            self.unregister_port(handle);
        }
    }

    pub fn port_count(&self) -> usize {
        lock(&self.table).len()
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Graph
    // ─────────────────────────────────────────────────────────────────────────

    /// Connect our port to `remote`, in whichever direction the flags allow
    pub fn connect(&self, handle: PortHandle, remote: &str) -> PortResult<()> {
        let entry = self.entry(handle)?;
        let client = self.client()?;
        let remote = self.resolve(remote);
        let info = client
            .port_by_name(&remote)
            .ok_or_else(|| PortError::NoSuchPort(remote.clone()))?;
        let (src, dst) = edge(&entry, &info)?;

        if !client.connections(&entry.name).contains(&remote) {
            client
                .connect(&src, &dst)
                .map_err(|e| PortError::ConnectFailed(src.clone(), dst.clone(), e.to_string()))?;
        }
        lock(&entry.state).connections.insert(remote);
        log::debug!("[PORTS] connected {} -> {}", src, dst);
        Ok(())
    }

    pub fn disconnect(&self, handle: PortHandle, remote: &str) -> PortResult<()> {
        let entry = self.entry(handle)?;
        let client = self.client()?;
        let remote = self.resolve(remote);
        disconnect_edge(client.as_ref(), &entry, &remote)?;
        lock(&entry.state).connections.remove(&remote);
        Ok(())
    }

    /// Remove every edge of our port
    pub fn disconnect_all(&self, handle: PortHandle) -> PortResult<()> {
        let entry = self.entry(handle)?;
        let client = self.client()?;
        let mut failed = None;
        for remote in client.connections(&entry.name) {
            if let Err(e) = disconnect_edge(client.as_ref(), &entry, &remote) {
                log::warn!("[PORTS] {}", e);
                failed.get_or_insert(e);
            }
        }
        lock(&entry.state).connections.clear();
        failed.map_or(Ok(()), Err)
    }

    /// Connect two arbitrary server ports; our own may be given by short name
    pub fn connect_by_name(&self, source: &str, destination: &str) -> PortResult<()> {
        let client = self.client()?;
        let (src, dst) = (self.resolve(source), self.resolve(destination));
        self.check_pair(client.as_ref(), &src, &dst)?;
        client
            .connect(&src, &dst)
            .map_err(|e| PortError::ConnectFailed(src.clone(), dst.clone(), e.to_string()))?;
        self.mirror(&src, &dst, true);
        Ok(())
    }

    pub fn disconnect_by_name(&self, source: &str, destination: &str) -> PortResult<()> {
        let client = self.client()?;
        let (src, dst) = (self.resolve(source), self.resolve(destination));
        client
            .disconnect(&src, &dst)
            .map_err(|e| PortError::ConnectFailed(src.clone(), dst.clone(), e.to_string()))?;
        self.mirror(&src, &dst, false);
        Ok(())
    }

    fn check_pair(&self, client: &dyn ServerClient, src: &str, dst: &str) -> PortResult<()> {
        let a = client
            .port_by_name(src)
            .ok_or_else(|| PortError::NoSuchPort(src.to_string()))?;
        let b = client
            .port_by_name(dst)
            .ok_or_else(|| PortError::NoSuchPort(dst.to_string()))?;
        if a.data_type != b.data_type {
            return Err(PortError::TypeMismatch {
                ours: a.data_type,
                theirs: b.data_type,
            });
        }
        if !a.flags.is_output() || !b.flags.is_input() {
            return Err(PortError::IncompatibleDirection(src.to_string(), dst.to_string()));
        }
        Ok(())
    }

    /// Track an edge made by name if either end is ours
    fn mirror(&self, src: &str, dst: &str, connected: bool) {
        let table = lock(&self.table);
        for (ours, other) in [(src, dst), (dst, src)] {
            let Some(entry) = table.iter().find(|(_, e)| e.name == ours).map(|(_, e)| e) else {
                continue;
            };
            let mut state = lock(&entry.state);
            if connected {
                state.connections.insert(other.to_string());
            } else {
                state.connections.remove(other);
            }
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Queries
    // ─────────────────────────────────────────────────────────────────────────

    /// Live connections of our port, asked of the server each time
    pub fn get_connections(&self, handle: PortHandle) -> PortResult<Vec<String>> {
        let entry = self.entry(handle)?;
        let client = self.client()?;
        Ok(client.connections(&entry.name))
    }

    /// Live connections of any server port
    pub fn get_connections_by_name(&self, name: &str) -> PortResult<Vec<String>> {
        let client = self.client()?;
        let name = self.resolve(name);
        if client.port_by_name(&name).is_none() {
            return Err(PortError::NoSuchPort(name));
        }
        Ok(client.connections(&name))
    }

    /// True if the port has at least one edge
    pub fn connected(&self, handle: PortHandle) -> bool {
        self.get_connections(handle)
            .map(|c| !c.is_empty())
            .unwrap_or(false)
    }

    pub fn connected_to(&self, handle: PortHandle, name: &str) -> bool {
        let name = self.resolve(name);
        self.get_connections(handle)
            .map(|c| c.contains(&name))
            .unwrap_or(false)
    }

    /// True if any edge leads to a hardware port
    pub fn physically_connected(&self, handle: PortHandle) -> bool {
        let (Ok(connections), Some(client)) =
            (self.get_connections(handle), self.connection.client())
        else {
            return false;
        };
        connections.iter().any(|name| {
            client
                .port_by_name(name)
                .is_some_and(|info| info.flags.is_physical())
        })
    }

    pub fn port_name(&self, handle: PortHandle) -> Option<String> {
        lock(&self.table).get(handle).map(|e| e.name.clone())
    }

    pub fn port_data_type(&self, handle: PortHandle) -> Option<DataType> {
        lock(&self.table).get(handle).map(|e| e.data_type)
    }

    pub fn port_flags(&self, handle: PortHandle) -> Option<PortFlags> {
        lock(&self.table).get(handle).map(|e| e.flags)
    }

    /// One of our ports, by short or full name
    pub fn get_port_by_name(&self, name: &str) -> Option<PortHandle> {
        lock(&self.table).find(name)
    }

    /// Live description of any server port
    pub fn port_info(&self, name: &str) -> Option<PortInfo> {
        self.connection.client()?.port_by_name(&self.resolve(name))
    }

    /// Server port names matching an optional regex, type and required flags
    pub fn get_ports(
        &self,
        pattern: Option<&str>,
        data_type: Option<DataType>,
        flags: PortFlags,
    ) -> Vec<String> {
        match self.connection.client() {
            Some(client) => client.ports(pattern, data_type, flags),
            None => Vec::new(),
        }
    }

    /// True if `name` belongs to our client
    pub fn port_is_mine(&self, name: &str) -> bool {
        name.strip_prefix(&self.connection.client_name())
            .is_some_and(|rest| rest.starts_with(':'))
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Realtime access
    // ─────────────────────────────────────────────────────────────────────────

    /// Start a cycle against the current snapshot. Process thread only.
    pub(crate) fn begin_cycle(&self, nframes: Frames) -> Cycle {
        Cycle::begin(&self.live, nframes)
    }

    /// Buffer of `handle` for `cycle`; see [`Cycle::buffer`]
    pub fn get_buffer<'c>(&self, cycle: &'c Cycle, handle: PortHandle) -> Option<PortBuffer<'c>> {
        cycle.buffer(handle)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Latency
    // ─────────────────────────────────────────────────────────────────────────

    /// Store `range` for the port and push it (plus systemic latency) to the
    /// server
    pub fn set_latency_range(
        &self,
        handle: PortHandle,
        mode: LatencyMode,
        range: LatencyRange,
    ) -> PortResult<()> {
        let entry = self.entry(handle)?;
        let systemic = {
            let mut state = lock(&entry.state);
            state.latency[mode_slot(mode)] = Some(range);
            state.systemic
        };
        if let Some(port) = entry.server_port.as_ref() {
            port.set_latency_range(mode, with_systemic(&entry, mode, range, systemic));
        }
        Ok(())
    }

    /// Range as the server currently reports it
    pub fn get_latency_range(&self, handle: PortHandle, mode: LatencyMode) -> PortResult<LatencyRange> {
        let entry = self.entry(handle)?;
        let port = entry.server_port.as_ref().ok_or(PortError::NotConnected)?;
        Ok(port.latency_range(mode))
    }

    /// Fixed latency added in the port's own direction
    pub fn set_port_systemic_latency(&self, handle: PortHandle, frames: Frames) -> PortResult<()> {
        let entry = self.entry(handle)?;
        {
            let mut state = lock(&entry.state);
            if state.systemic == frames {
                return Ok(());
            }
            state.systemic = frames;
        }
        self.refresh_latencies();
        Ok(())
    }

    /// Re-push every stored range and have the server recompute totals
    pub fn refresh_latencies(&self) {
        let Some(client) = self.connection.client() else {
            return;
        };
        for (_, entry) in self.entries() {
            let Some(port) = entry.server_port.as_ref() else {
                continue;
            };
            let (ranges, systemic) = {
                let state = lock(&entry.state);
                (state.latency, state.systemic)
            };
            for mode in [LatencyMode::Capture, LatencyMode::Playback] {
                if let Some(range) = ranges[mode_slot(mode)] {
                    port.set_latency_range(mode, with_systemic(&entry, mode, range, systemic));
                }
            }
        }
        client.recompute_latencies();
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Physical ports
    // ─────────────────────────────────────────────────────────────────────────

    fn physical(&self, data_type: Option<DataType>, direction: PortFlags) -> Vec<(String, DataType)> {
        let Some(client) = self.connection.client() else {
            return Vec::new();
        };
        client
            .ports(None, data_type, PortFlags::IS_PHYSICAL | direction)
            .into_iter()
            .filter(|name| !name.contains(MIDI_THROUGH))
            .filter_map(|name| {
                let info = client.port_by_name(&name)?;
                Some((name, info.data_type))
            })
            .collect()
    }

    /// Hardware capture ports (outputs in server terms)
    pub fn get_physical_outputs(&self, data_type: DataType) -> Vec<String> {
        self.physical(Some(data_type), PortFlags::IS_OUTPUT)
            .into_iter()
            .map(|(name, _)| name)
            .collect()
    }

    /// Hardware playback ports (inputs in server terms)
    pub fn get_physical_inputs(&self, data_type: DataType) -> Vec<String> {
        self.physical(Some(data_type), PortFlags::IS_INPUT)
            .into_iter()
            .map(|(name, _)| name)
            .collect()
    }

    pub fn n_physical_outputs(&self) -> ChanCount {
        count(self.physical(None, PortFlags::IS_OUTPUT))
    }

    pub fn n_physical_inputs(&self) -> ChanCount {
        count(self.physical(None, PortFlags::IS_INPUT))
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Reconnect support
    // ─────────────────────────────────────────────────────────────────────────

    /// Register every known port again on a freshly opened client
    ///
    /// All or nothing: if any port fails, the ones already re-registered are
    /// removed again and the engine forgets every port.
    pub fn reestablish(&self) -> PortResult<()> {
        let client = self.client()?;
        let entries = self.entries();
        let mut fresh: Vec<(PortHandle, Arc<dyn ServerPort>)> = Vec::with_capacity(entries.len());

        for (handle, entry) in &entries {
            match client.register_port(&entry.short_name, entry.data_type, entry.flags) {
                Ok(port) => fresh.push((*handle, port)),
                Err(e) => {
                    log::error!("[PORTS] cannot re-establish {}: {}", entry.short_name, e);
                    for (_, port) in &fresh {
                        if let Err(e) = client.unregister_port(port.as_ref()) {
                            log::warn!("[PORTS] rollback of {} failed: {}", port.name(), e);
                        }
                    }
                    let mut table = lock(&self.table);
                    table.clear();
                    self.live.publish(&table);
                    return Err(PortError::ReestablishFailed(entry.short_name.clone()));
                }
            }
        }

        let mut table = lock(&self.table);
        for ((handle, entry), (_, port)) in entries.iter().zip(fresh) {
            table.replace(*handle, entry.rebind(Some(port)));
        }
        self.live.publish(&table);
        if !entries.is_empty() {
            log::info!("[PORTS] re-established {} ports", entries.len());
        }
        Ok(())
    }

    /// Restore mirrored connections; failures are logged and skipped
    pub fn reconnect_ports(&self) {
        let Some(client) = self.connection.client() else {
            return;
        };
        for (_, entry) in self.entries() {
            let remotes: Vec<String> = lock(&entry.state).connections.iter().cloned().collect();
            for remote in remotes {
                let result = client
                    .port_by_name(&remote)
                    .ok_or_else(|| PortError::NoSuchPort(remote.clone()))
                    .and_then(|info| edge(&entry, &info))
                    .and_then(|(src, dst)| {
                        if client.connections(&entry.name).contains(&remote) {
                            return Ok(());
                        }
                        client
                            .connect(&src, &dst)
                            .map_err(|e| PortError::ConnectFailed(src, dst, e.to_string()))
                    });
                if let Err(e) = result {
                    log::warn!("[PORTS] cannot restore connection of {}: {}", entry.name, e);
                }
            }
        }
    }

    /// Forget the server side of every port after the client went away
    ///
    /// Handles, names and mirrored connections survive for `reestablish`.
    pub fn detach(&self) {
        let mut table = lock(&self.table);
        for (handle, entry) in table
            .iter()
            .map(|(h, e)| (h, e.clone()))
            .collect::<Vec<_>>()
        {
            table.replace(handle, entry.rebind(None));
        }
        self.live.publish(&table);
    }
}

/// (source, destination) for an edge between our port and `remote`
fn edge(entry: &PortEntry, remote: &PortInfo) -> PortResult<(String, String)> {
    if entry.data_type != remote.data_type {
        return Err(PortError::TypeMismatch {
            ours: entry.data_type,
            theirs: remote.data_type,
        });
    }
    if entry.flags.is_output() && remote.flags.is_input() {
        Ok((entry.name.clone(), remote.name.clone()))
    } else if entry.flags.is_input() && remote.flags.is_output() {
        Ok((remote.name.clone(), entry.name.clone()))
    } else {
        Err(PortError::IncompatibleDirection(
            entry.name.clone(),
            remote.name.clone(),
        ))
    }
}

fn disconnect_edge(client: &dyn ServerClient, entry: &PortEntry, remote: &str) -> PortResult<()> {
    let info = client
        .port_by_name(remote)
        .ok_or_else(|| PortError::NoSuchPort(remote.to_string()))?;
    let (src, dst) = edge(entry, &info)?;
    client
        .disconnect(&src, &dst)
        .map_err(|e| PortError::ConnectFailed(src, dst, e.to_string()))
}

/// Systemic latency applies only in the port's own direction
fn with_systemic(entry: &PortEntry, mode: LatencyMode, range: LatencyRange, systemic: Frames) -> LatencyRange {
    let own = match mode {
        LatencyMode::Capture => entry.flags.is_input(),
        LatencyMode::Playback => entry.flags.is_output(),
    };
    if own {
        range.offset(systemic)
    } else {
        range
    }
}

fn count(ports: Vec<(String, DataType)>) -> ChanCount {
    let mut counts = ChanCount::default();
    for (_, data_type) in ports {
        counts.increment(data_type);
    }
    counts
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Instant;

    use crate::error::MidiError;
    use crate::server::dummy::{DummyConfig, DummyServer};

    fn engine(server: &DummyServer) -> PortEngine {
        let connection = Arc::new(Connection::new(Arc::new(server.clone()), "tether", None));
        connection.open().unwrap();
        PortEngine::new(connection)
    }

    #[test]
    fn test_register_requires_connection() {
        let server = DummyServer::default();
        let connection = Arc::new(Connection::new(Arc::new(server), "tether", None));
        let ports = PortEngine::new(connection);
        assert_eq!(
            ports.register_port("in1", DataType::Audio, PortFlags::IS_INPUT),
            Err(PortError::NotConnected)
        );
    }

    #[test]
    fn test_port_lifecycle() {
        let server = DummyServer::default();
        let ports = engine(&server);
        let h = ports
            .register_port("in1", DataType::Audio, PortFlags::IS_INPUT)
            .unwrap();
        assert!(!ports.connected(h));
        assert!(server.has_port("tether:in1"));
        assert_eq!(ports.port_name(h).as_deref(), Some("tether:in1"));
        assert_eq!(ports.get_port_by_name("in1"), Some(h));

        ports.unregister_port(h);
        assert!(!server.has_port("tether:in1"));
        assert_eq!(ports.get_connections(h), Err(PortError::InvalidHandle));
        assert_eq!(
            ports.connect(h, "system:capture_1"),
            Err(PortError::InvalidHandle)
        );
        // Second unregister is a no-op
        ports.unregister_port(h);
        assert_eq!(ports.port_count(), 0);
    }

    #[test]
    fn test_duplicate_and_empty_names_rejected() {
        let server = DummyServer::default();
        let ports = engine(&server);
        ports
            .register_port("out", DataType::Audio, PortFlags::IS_OUTPUT)
            .unwrap();
        assert!(matches!(
            ports.register_port("out", DataType::Midi, PortFlags::IS_OUTPUT),
            Err(PortError::Rejected(_))
        ));
        assert!(matches!(
            ports.register_port("", DataType::Audio, PortFlags::IS_OUTPUT),
            Err(PortError::InvalidName(_))
        ));
    }

    #[test]
    fn test_connect_to_capture_lists_exactly_that_port() {
        let server = DummyServer::default();
        let ports = engine(&server);
        let h = ports
            .register_port("in1", DataType::Audio, PortFlags::IS_INPUT)
            .unwrap();
        ports.connect(h, "system:capture_1").unwrap();
        assert_eq!(ports.get_connections(h).unwrap(), vec!["system:capture_1"]);
    }

    #[test]
    fn test_connection_symmetry_and_disconnect_all() {
        let server = DummyServer::default();
        let ports = engine(&server);
        let out = ports
            .register_port("out", DataType::Audio, PortFlags::IS_OUTPUT)
            .unwrap();
        ports.connect(out, "system:playback_1").unwrap();
        ports.connect(out, "system:playback_2").unwrap();

        assert!(ports.connected_to(out, "system:playback_1"));
        assert_eq!(
            ports.get_connections_by_name("system:playback_1").unwrap(),
            vec!["tether:out"]
        );
        assert!(ports.physically_connected(out));

        ports.disconnect_all(out).unwrap();
        assert!(ports.get_connections(out).unwrap().is_empty());
        assert!(!ports.connected(out));
    }

    #[test]
    fn test_connect_validates_type_and_direction() {
        let server = DummyServer::default();
        let ports = engine(&server);
        let midi_in = ports
            .register_port("midi_in", DataType::Midi, PortFlags::IS_INPUT)
            .unwrap();
        let audio_in = ports
            .register_port("in", DataType::Audio, PortFlags::IS_INPUT)
            .unwrap();

        assert_eq!(
            ports.connect(midi_in, "system:capture_1"),
            Err(PortError::TypeMismatch {
                ours: DataType::Midi,
                theirs: DataType::Audio
            })
        );
        assert!(matches!(
            ports.connect(audio_in, "system:playback_1"),
            Err(PortError::IncompatibleDirection(_, _))
        ));
        assert_eq!(
            ports.connect(audio_in, "nobody:nothing"),
            Err(PortError::NoSuchPort("nobody:nothing".to_string()))
        );
    }

    #[test]
    fn test_connect_by_short_name() {
        let server = DummyServer::default();
        let ports = engine(&server);
        let h = ports
            .register_port("out", DataType::Audio, PortFlags::IS_OUTPUT)
            .unwrap();
        ports.connect_by_name("out", "system:playback_1").unwrap();
        assert!(ports.connected_to(h, "system:playback_1"));
        assert!(ports.port_is_mine("tether:out"));
        assert!(!ports.port_is_mine("tether-01:out"));

        ports.disconnect_by_name("out", "system:playback_1").unwrap();
        assert!(!ports.connected(h));
    }

    #[test]
    fn test_physical_enumeration_skips_midi_through() {
        let server = DummyServer::new(DummyConfig::default().with_audio_channels(4, 2));
        let ports = engine(&server);
        assert_eq!(ports.get_physical_outputs(DataType::Audio).len(), 4);
        assert_eq!(
            ports.get_physical_outputs(DataType::Midi),
            vec!["system:midi_capture_1"]
        );
        assert_eq!(
            ports.n_physical_outputs(),
            ChanCount { audio: 4, midi: 1 }
        );
        assert_eq!(ports.n_physical_inputs(), ChanCount { audio: 2, midi: 1 });
    }

    #[test]
    fn test_latency_includes_systemic_in_own_direction() {
        let server = DummyServer::default();
        let ports = engine(&server);
        let h = ports
            .register_port("in", DataType::Audio, PortFlags::IS_INPUT)
            .unwrap();
        let range = LatencyRange::new(64, 128);
        ports
            .set_latency_range(h, LatencyMode::Capture, range)
            .unwrap();
        ports
            .set_latency_range(h, LatencyMode::Playback, range)
            .unwrap();
        assert_eq!(ports.get_latency_range(h, LatencyMode::Capture).unwrap(), range);

        ports.set_port_systemic_latency(h, 32).unwrap();
        assert_eq!(
            ports.get_latency_range(h, LatencyMode::Capture).unwrap(),
            LatencyRange::new(96, 160)
        );
        assert_eq!(ports.get_latency_range(h, LatencyMode::Playback).unwrap(), range);
    }

    #[test]
    fn test_reestablish_is_all_or_nothing() {
        let server = DummyServer::default();
        let ports = engine(&server);
        for name in ["a", "b", "c"] {
            ports
                .register_port(name, DataType::Audio, PortFlags::IS_OUTPUT)
                .unwrap();
        }
        ports.connection().close().unwrap();
        ports.detach();
        assert_eq!(ports.port_count(), 3);

        server.reject_port("b");
        ports.connection().open().unwrap();
        assert_eq!(
            ports.reestablish(),
            Err(PortError::ReestablishFailed("b".to_string()))
        );
        assert_eq!(ports.port_count(), 0);
        assert!(!server.has_port("tether:a"));
        assert!(!server.has_port("tether:c"));
    }

    #[test]
    fn test_reestablish_restores_ports_and_connections() {
        let server = DummyServer::default();
        let ports = engine(&server);
        let h = ports
            .register_port("out", DataType::Audio, PortFlags::IS_OUTPUT)
            .unwrap();
        ports.connect(h, "system:playback_1").unwrap();
        ports.connection().close().unwrap();
        ports.detach();
        assert!(!server.has_port("tether:out"));

        ports.connection().open().unwrap();
        ports.reestablish().unwrap();
        ports.reconnect_ports();
        assert!(server.has_port("tether:out"));
        assert_eq!(ports.get_connections(h).unwrap(), vec!["system:playback_1"]);
    }

    #[test]
    fn test_buffer_handed_out_once_per_cycle() {
        let server = DummyServer::new(DummyConfig::default().with_buffer_size(256));
        let ports = engine(&server);
        let h = ports
            .register_port("out", DataType::Audio, PortFlags::IS_OUTPUT)
            .unwrap();

        let cycle = ports.begin_cycle(256);
        let first = ports.get_buffer(&cycle, h).and_then(PortBuffer::into_audio);
        assert_eq!(first.map(|b| b.len()), Some(256));
        assert!(ports.get_buffer(&cycle, h).is_none());

        let next = ports.begin_cycle(128);
        assert_eq!(next.audio(h).map(|b| b.len()), Some(128));
        assert!(next.midi(h).is_none());
    }

    #[test]
    fn test_unregister_waits_for_running_cycle() {
        let server = DummyServer::default();
        let ports = Arc::new(engine(&server));
        let h = ports
            .register_port("out", DataType::Audio, PortFlags::IS_OUTPUT)
            .unwrap();
        let cycle = ports.begin_cycle(64);

        let unregistering = ports.clone();
        let worker = thread::spawn(move || unregistering.unregister_port(h));
        let deadline = Instant::now() + Duration::from_secs(2);
        while ports.port_count() > 0 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(1));
        }
        assert_eq!(ports.port_count(), 0);

        // The running cycle still owns the server port
        thread::sleep(Duration::from_millis(50));
        assert!(!worker.is_finished());
        assert!(server.has_port("tether:out"));
        assert_eq!(cycle.audio(h).map(|b| b.len()), Some(64));

        drop(cycle);
        worker.join().unwrap();
        assert!(!server.has_port("tether:out"));
        assert!(ports.begin_cycle(64).audio(h).is_none());
    }

    #[test]
    fn test_unregister_refused_on_process_thread() {
        let server = DummyServer::default();
        let ports = Arc::new(engine(&server));
        let h = ports
            .register_port("out", DataType::Audio, PortFlags::IS_OUTPUT)
            .unwrap();
        let inner = ports.clone();
        thread::spawn(move || {
            rt::mark_process_thread();
            inner.unregister_port(h);
        })
        .join()
        .unwrap();
        assert_eq!(ports.port_count(), 1);
        assert!(server.has_port("tether:out"));
    }

    #[test]
    fn test_midi_overflow_keeps_earlier_events() {
        let server = DummyServer::new(DummyConfig::default().with_midi_buffer_bytes(64));
        let ports = engine(&server);
        let h = ports
            .register_port("midi_out", DataType::Midi, PortFlags::IS_OUTPUT)
            .unwrap();
        let cycle = ports.begin_cycle(128);
        let mut midi = cycle.midi(h).unwrap();
        midi.clear();

        // 16 byte header + 15 bytes per 3-byte event: three fit
        for t in 0..3 {
            midi.put(t * 10, &[0x90, 60 + t as u8, 100]).unwrap();
        }
        for _ in 0..5 {
            assert_eq!(midi.put(50, &[0x80, 60, 0]), Err(MidiError::Overflow));
        }
        let events: Vec<_> = midi.iter().map(|e| (e.time, e.data[1])).collect();
        assert_eq!(events, vec![(0, 60), (10, 61), (20, 62)]);
    }
}
