//! In-process audio server with a simulated sound card
//!
//! `DummyServer` implements the server boundary entirely inside the process.
//! It keeps a port namespace and a connection graph, and hands out real port
//! buffers. It runs process cycles either on demand ([`DummyClock::Manual`],
//! which makes tests deterministic) or on a timed thread
//! ([`DummyClock::Realtime`]).
//!
//! The simulated device shows up as the `system` client:
//!
//! ```text
//! system:capture_1..N        audio out, physical   (hardware inputs)
//! system:playback_1..N       audio in,  physical   (hardware outputs)
//! system:midi_capture_1..N   midi out,  physical
//! system:midi_playback_1..N  midi in,   physical
//! Midi-Through:Port-0        midi out,  physical   (ignored by channel counts)
//! ```
//!
//! Fault injection (`shutdown`, `inject_xrun`, `change_buffer_size`,
//! `reject_port`, ...) drives the same callback paths a real server would.

use std::cell::UnsafeCell;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use regex::Regex;

use super::{
    AudioServer, CallbackKind, PortInfo, ProcessHandler, ProcessStatus, RawBuffer,
    RealtimeTask, ServerCapabilities, ServerClient, ServerEvents, ServerPort, ShutdownHook,
};
use crate::error::{ServerError, ServerResult};
use crate::midi::{MidiCodec, PackedMidiCodec};
use crate::rt;
use crate::sync::lock;
use crate::types::{
    DataType, Frames, LatencyMode, LatencyRange, PortFlags, Sample, TransportPosition,
    TransportState, DEFAULT_BUFFER_SIZE, DEFAULT_SAMPLE_RATE, MAX_BUFFER_SIZE,
};

const SYSTEM_CLIENT: &str = "system";
const MIDI_THROUGH_CLIENT: &str = "Midi-Through";
const MIDI_INJECT_CAPACITY: usize = 1024;

static PACKED: PackedMidiCodec = PackedMidiCodec::INSTANCE;

/// How process cycles are driven
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DummyClock {
    /// Cycles only run when `run_cycles` is called
    Manual,
    /// A timed thread runs one cycle per period (as fast as possible while
    /// freewheeling)
    Realtime,
}

/// Simulated device and server behaviour
#[derive(Debug, Clone)]
pub struct DummyConfig {
    pub sample_rate: u32,
    pub buffer_size: Frames,
    pub capture_channels: u32,
    pub playback_channels: u32,
    pub midi_capture_channels: u32,
    pub midi_playback_channels: u32,
    /// Bytes per MIDI port buffer
    pub midi_buffer_bytes: usize,
    pub clock: DummyClock,
    pub capabilities: ServerCapabilities,
    pub realtime_priority: Option<i32>,
}

impl Default for DummyConfig {
    fn default() -> Self {
        Self {
            sample_rate: DEFAULT_SAMPLE_RATE,
            buffer_size: DEFAULT_BUFFER_SIZE,
            capture_channels: 2,
            playback_channels: 2,
            midi_capture_channels: 1,
            midi_playback_channels: 1,
            midi_buffer_bytes: 32 * 1024,
            clock: DummyClock::Manual,
            capabilities: ServerCapabilities {
                reliable_buffer_size_callback: true,
                port_type_buffer_size: true,
                live_sample_rate_change: false,
                live_buffer_size_change: true,
                latency_callback: true,
                session_callback: false,
            },
            realtime_priority: None,
        }
    }
}

impl DummyConfig {
    pub fn with_sample_rate(mut self, rate: u32) -> Self {
        self.sample_rate = rate;
        self
    }

    pub fn with_buffer_size(mut self, nframes: Frames) -> Self {
        self.buffer_size = nframes;
        self
    }

    pub fn with_audio_channels(mut self, capture: u32, playback: u32) -> Self {
        self.capture_channels = capture;
        self.playback_channels = playback;
        self
    }

    pub fn with_midi_channels(mut self, capture: u32, playback: u32) -> Self {
        self.midi_capture_channels = capture;
        self.midi_playback_channels = playback;
        self
    }

    pub fn with_midi_buffer_bytes(mut self, bytes: usize) -> Self {
        self.midi_buffer_bytes = bytes;
        self
    }

    pub fn with_clock(mut self, clock: DummyClock) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_capabilities(mut self, capabilities: ServerCapabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    pub fn with_realtime_priority(mut self, priority: Option<i32>) -> Self {
        self.realtime_priority = priority;
        self
    }
}

/// Operations recorded by the server, for ordering assertions in tests
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerOp {
    Open {
        requested: String,
        assigned: String,
        session_id: Option<String>,
    },
    Close(String),
    RegisterPort(String),
    UnregisterPort(String),
    Connect(String, String),
    Disconnect(String, String),
    EnableCallback(CallbackKind),
    Activate(String),
    Deactivate(String),
    SetBufferSize(Frames),
    SetSampleRate(u32),
    SetFreewheel(bool),
    SetLatency {
        port: String,
        mode: LatencyMode,
        range: LatencyRange,
    },
    RecomputeLatencies,
    TransportStart,
    TransportStop,
    TransportLocate(u64),
    SetTimebase(bool),
}

#[derive(Debug, Clone, Copy)]
struct InjectedMidi {
    channel: u32,
    time: Frames,
    len: u8,
    bytes: [u8; 4],
}

// ═══════════════════════════════════════════════════════════════════════════════
// Ports
// ═══════════════════════════════════════════════════════════════════════════════

enum PortStorage {
    Audio(UnsafeCell<Box<[Sample]>>),
    Midi(UnsafeCell<Box<[u8]>>),
}

/// A port in the simulated graph
pub struct DummyPort {
    name: String,
    owner: String,
    data_type: DataType,
    flags: PortFlags,
    storage: PortStorage,
    latency: Mutex<[LatencyRange; 2]>,
    /// Constant signal written into hardware capture ports (f32 bits)
    level: AtomicU32,
    server: Weak<ServerCore>,
}

// SAFETY: buffer contents are only read or written by the thread holding the
// server's cycle lock (the cycle runner and the process callbacks it invokes).
// Every other field is immutable or synchronised.
unsafe impl Sync for DummyPort {}

impl DummyPort {
    fn new(
        name: String,
        owner: &str,
        data_type: DataType,
        flags: PortFlags,
        midi_bytes: usize,
        server: Weak<ServerCore>,
    ) -> Self {
        let storage = match data_type {
            DataType::Audio => PortStorage::Audio(UnsafeCell::new(
                vec![0.0; MAX_BUFFER_SIZE as usize].into_boxed_slice(),
            )),
            DataType::Midi => {
                let mut bytes = vec![0u8; midi_bytes].into_boxed_slice();
                PACKED.clear(&mut bytes, 0);
                PortStorage::Midi(UnsafeCell::new(bytes))
            }
        };
        Self {
            name,
            owner: owner.to_string(),
            data_type,
            flags,
            storage,
            latency: Mutex::new([LatencyRange::default(); 2]),
            level: AtomicU32::new(0.0f32.to_bits()),
            server,
        }
    }

    fn info(&self) -> PortInfo {
        PortInfo {
            name: self.name.clone(),
            data_type: self.data_type,
            flags: self.flags,
        }
    }

    fn is_hardware(&self) -> bool {
        self.flags.is_physical()
    }

    /// # Safety
    /// Caller holds the cycle lock and no other reference to this buffer is live.
    #[allow(clippy::mut_from_ref)]
    unsafe fn audio_mut(&self) -> Option<&mut [Sample]> {
        match &self.storage {
            PortStorage::Audio(cell) => Some(&mut **cell.get()),
            PortStorage::Midi(_) => None,
        }
    }

    /// # Safety
    /// Caller holds the cycle lock and no mutable reference to this buffer is live.
    unsafe fn audio(&self) -> Option<&[Sample]> {
        match &self.storage {
            PortStorage::Audio(cell) => Some(&**cell.get()),
            PortStorage::Midi(_) => None,
        }
    }

    /// # Safety
    /// Same contract as [`DummyPort::audio_mut`].
    #[allow(clippy::mut_from_ref)]
    unsafe fn midi_mut(&self) -> Option<&mut [u8]> {
        match &self.storage {
            PortStorage::Midi(cell) => Some(&mut **cell.get()),
            PortStorage::Audio(_) => None,
        }
    }

    /// # Safety
    /// Same contract as [`DummyPort::audio`].
    unsafe fn midi(&self) -> Option<&[u8]> {
        match &self.storage {
            PortStorage::Midi(cell) => Some(&**cell.get()),
            PortStorage::Audio(_) => None,
        }
    }
}

fn latency_slot(mode: LatencyMode) -> usize {
    match mode {
        LatencyMode::Capture => 0,
        LatencyMode::Playback => 1,
    }
}

impl ServerPort for DummyPort {
    fn name(&self) -> String {
        self.name.clone()
    }

    fn data_type(&self) -> DataType {
        self.data_type
    }

    fn flags(&self) -> PortFlags {
        self.flags
    }

    fn buffer(&self, nframes: Frames) -> Option<RawBuffer> {
        // Only pointers are formed here; no reference to the contents escapes
        match &self.storage {
            PortStorage::Audio(cell) => {
                let slice: *mut [Sample] = unsafe { &mut **cell.get() };
                let frames = (nframes as usize).min(slice.len());
                NonNull::new(slice as *mut Sample as *mut u8).map(|ptr| RawBuffer {
                    ptr,
                    len: frames * std::mem::size_of::<Sample>(),
                })
            }
            PortStorage::Midi(cell) => {
                let slice: *mut [u8] = unsafe { &mut **cell.get() };
                NonNull::new(slice as *mut u8).map(|ptr| RawBuffer {
                    ptr,
                    len: slice.len(),
                })
            }
        }
    }

    fn midi_codec(&self) -> &'static dyn MidiCodec {
        &PACKED
    }

    fn set_latency_range(&self, mode: LatencyMode, range: LatencyRange) {
        lock(&self.latency)[latency_slot(mode)] = range;
        if let Some(server) = self.server.upgrade() {
            server.record(ServerOp::SetLatency {
                port: self.name.clone(),
                mode,
                range,
            });
        }
    }

    fn latency_range(&self, mode: LatencyMode) -> LatencyRange {
        lock(&self.latency)[latency_slot(mode)]
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Server core
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Default)]
struct Graph {
    ports: BTreeMap<String, Arc<DummyPort>>,
    /// (source output, destination input)
    edges: BTreeSet<(String, String)>,
}

impl Graph {
    fn sources_of<'a>(&'a self, port: &'a str) -> impl Iterator<Item = &'a Arc<DummyPort>> + 'a {
        self.edges
            .iter()
            .filter(move |(_, dst)| dst == port)
            .filter_map(move |(src, _)| self.ports.get(src))
    }

    /// Fill an input port from everything connected to it
    ///
    /// Caller holds the cycle lock.
    fn gather(&self, port: &DummyPort, nframes: Frames) {
        let n = nframes as usize;
        match port.data_type {
            DataType::Audio => {
                let Some(dst) = (unsafe { port.audio_mut() }) else {
                    return;
                };
                let len = n.min(dst.len());
                let dst = &mut dst[..len];
                dst.fill(0.0);
                for src in self.sources_of(&port.name) {
                    if let Some(src) = unsafe { src.audio() } {
                        for (d, s) in dst.iter_mut().zip(src.iter()) {
                            *d += *s;
                        }
                    }
                }
            }
            DataType::Midi => {
                let Some(dst) = (unsafe { port.midi_mut() }) else {
                    return;
                };
                PACKED.clear(dst, nframes);
                for src in self.sources_of(&port.name) {
                    if let Some(src) = unsafe { src.midi() } {
                        for i in 0..PACKED.event_count(src) {
                            if let Some(event) = PACKED.event(src, i) {
                                let _ = PACKED.put(dst, event.time, event.data);
                            }
                        }
                    }
                }
            }
        }
    }
}

struct ClientCore {
    name: String,
    shutdown: ShutdownHook,
    events: Mutex<Option<Arc<dyn ServerEvents>>>,
    enabled: Mutex<HashSet<CallbackKind>>,
    process: Mutex<Option<Box<dyn ProcessHandler>>>,
    active: AtomicBool,
    closed: AtomicBool,
}

impl ClientCore {
    fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire) && !self.closed.load(Ordering::Acquire)
    }
}

struct CycleState {
    midi_rx: rtrb::Consumer<InjectedMidi>,
}

struct ServerCore {
    config: DummyConfig,
    me: Weak<ServerCore>,
    epoch: Instant,
    reachable: AtomicBool,
    sample_rate: AtomicU32,
    buffer_size: AtomicU32,
    freewheel: AtomicBool,
    graph: Mutex<Graph>,
    clients: Mutex<Vec<Arc<ClientCore>>>,
    /// Held for the whole of a cycle and while delivering buffer-size changes
    cycle: Mutex<CycleState>,
    midi_tx: Mutex<rtrb::Producer<InjectedMidi>>,
    midi_capture_names: Vec<String>,
    ops: Mutex<Vec<ServerOp>>,
    rejected_ports: Mutex<HashSet<String>>,
    transport: Mutex<TransportPosition>,
    timebase_master: AtomicBool,
    frame_time: AtomicU64,
    last_frame_time: AtomicU64,
    cycle_start_nanos: AtomicU64,
    cycles: AtomicU64,
    cpu_load: AtomicU32,
    clock_running: AtomicBool,
}

impl ServerCore {
    fn new(config: DummyConfig) -> Arc<Self> {
        let (midi_tx, midi_rx) = rtrb::RingBuffer::new(MIDI_INJECT_CAPACITY);
        let midi_capture_names = (1..=config.midi_capture_channels)
            .map(|i| format!("{}:midi_capture_{}", SYSTEM_CLIENT, i))
            .collect();

        Arc::new_cyclic(|me: &Weak<ServerCore>| {
            let mut graph = Graph::default();
            let hw = PortFlags::IS_PHYSICAL | PortFlags::IS_TERMINAL;
            let mut add = |name: String, owner: &str, data_type, flags| {
                let port = DummyPort::new(
                    name.clone(),
                    owner,
                    data_type,
                    flags,
                    config.midi_buffer_bytes,
                    me.clone(),
                );
                graph.ports.insert(name, Arc::new(port));
            };
            for i in 1..=config.capture_channels {
                let name = format!("{}:capture_{}", SYSTEM_CLIENT, i);
                add(name, SYSTEM_CLIENT, DataType::Audio, PortFlags::IS_OUTPUT | hw);
            }
            for i in 1..=config.playback_channels {
                let name = format!("{}:playback_{}", SYSTEM_CLIENT, i);
                add(name, SYSTEM_CLIENT, DataType::Audio, PortFlags::IS_INPUT | hw);
            }
            for i in 1..=config.midi_capture_channels {
                let name = format!("{}:midi_capture_{}", SYSTEM_CLIENT, i);
                add(name, SYSTEM_CLIENT, DataType::Midi, PortFlags::IS_OUTPUT | hw);
            }
            for i in 1..=config.midi_playback_channels {
                let name = format!("{}:midi_playback_{}", SYSTEM_CLIENT, i);
                add(name, SYSTEM_CLIENT, DataType::Midi, PortFlags::IS_INPUT | hw);
            }
            if config.midi_capture_channels > 0 {
                let name = format!("{}:Port-0", MIDI_THROUGH_CLIENT);
                add(
                    name,
                    MIDI_THROUGH_CLIENT,
                    DataType::Midi,
                    PortFlags::IS_OUTPUT | PortFlags::IS_PHYSICAL,
                );
            }

            ServerCore {
                sample_rate: AtomicU32::new(config.sample_rate),
                buffer_size: AtomicU32::new(config.buffer_size),
                config,
                me: me.clone(),
                epoch: Instant::now(),
                reachable: AtomicBool::new(true),
                freewheel: AtomicBool::new(false),
                graph: Mutex::new(graph),
                clients: Mutex::new(Vec::new()),
                cycle: Mutex::new(CycleState { midi_rx }),
                midi_tx: Mutex::new(midi_tx),
                midi_capture_names,
                ops: Mutex::new(Vec::new()),
                rejected_ports: Mutex::new(HashSet::new()),
                transport: Mutex::new(TransportPosition::default()),
                timebase_master: AtomicBool::new(false),
                frame_time: AtomicU64::new(0),
                last_frame_time: AtomicU64::new(0),
                cycle_start_nanos: AtomicU64::new(0),
                cycles: AtomicU64::new(0),
                cpu_load: AtomicU32::new(0.0f32.to_bits()),
                clock_running: AtomicBool::new(false),
            }
        })
    }

    fn record(&self, op: ServerOp) {
        lock(&self.ops).push(op);
    }

    /// Event handlers of active clients that asked for `kind`
    fn handlers(&self, kind: CallbackKind) -> Vec<Arc<dyn ServerEvents>> {
        lock(&self.clients)
            .iter()
            .filter(|c| c.is_active() && lock(&c.enabled).contains(&kind))
            .filter_map(|c| lock(&c.events).clone())
            .collect()
    }

    /// Deliver a notification with no server locks held
    fn notify(&self, kind: CallbackKind, deliver: impl Fn(&dyn ServerEvents)) {
        for handler in self.handlers(kind) {
            deliver(handler.as_ref());
        }
    }

    fn unique_client_name(&self, requested: &str) -> String {
        let clients = lock(&self.clients);
        let taken = |name: &str| {
            name == SYSTEM_CLIENT || clients.iter().any(|c| c.name == name)
        };
        if !taken(requested) {
            return requested.to_string();
        }
        (1..100)
            .map(|i| format!("{}-{:02}", requested, i))
            .find(|candidate| !taken(candidate))
            .unwrap_or_else(|| format!("{}-{}", requested, self.cycles.load(Ordering::Relaxed)))
    }

    fn change_buffer_size(&self, nframes: Frames) -> ServerResult<()> {
        if nframes == 0 || nframes > MAX_BUFFER_SIZE {
            return Err(ServerError::Rejected {
                op: "set buffer size",
                reason: format!("{} frames out of range", nframes),
            });
        }
        // No cycle may run while clients resize
        let _cycle = lock(&self.cycle);
        self.buffer_size.store(nframes, Ordering::Release);
        log::debug!("[DUMMY] buffer size now {}", nframes);
        self.notify(CallbackKind::BufferSize, |h| h.buffer_size_changed(nframes));
        Ok(())
    }

    fn change_sample_rate(&self, rate: u32) {
        let _cycle = lock(&self.cycle);
        self.sample_rate.store(rate, Ordering::Release);
        self.notify(CallbackKind::SampleRate, |h| h.sample_rate_changed(rate));
    }

    fn set_freewheel(&self, enabled: bool) {
        if self.freewheel.swap(enabled, Ordering::AcqRel) != enabled {
            self.notify(CallbackKind::Freewheel, |h| h.freewheel(enabled));
        }
    }

    fn poll_sync(&self) {
        let position = *lock(&self.transport);
        if position.state != TransportState::Starting {
            return;
        }
        let handlers = self.handlers(CallbackKind::Sync);
        let ready = handlers.iter().all(|h| h.sync(position));
        if ready {
            let mut transport = lock(&self.transport);
            if transport.state == TransportState::Starting {
                transport.state = TransportState::Rolling;
            }
        }
    }

    fn run_cycle(&self) -> bool {
        let mut cycle = lock(&self.cycle);
        let started = Instant::now();
        self.cycle_start_nanos
            .store(started.duration_since(self.epoch).as_nanos() as u64, Ordering::Relaxed);

        let clients: Vec<Arc<ClientCore>> = lock(&self.clients)
            .iter()
            .filter(|c| c.is_active())
            .cloned()
            .collect();
        if clients.is_empty() {
            return false;
        }

        let nframes = self.buffer_size.load(Ordering::Acquire);
        let graph = lock(&self.graph);

        // Hardware capture
        for port in graph
            .ports
            .values()
            .filter(|p| p.is_hardware() && p.flags.is_output())
        {
            match port.data_type {
                DataType::Audio => {
                    let level = f32::from_bits(port.level.load(Ordering::Relaxed));
                    if let Some(buf) = unsafe { port.audio_mut() } {
                        let n = (nframes as usize).min(buf.len());
                        buf[..n].fill(level);
                    }
                }
                DataType::Midi => {
                    if let Some(buf) = unsafe { port.midi_mut() } {
                        PACKED.clear(buf, nframes);
                    }
                }
            }
        }
        while let Ok(event) = cycle.midi_rx.pop() {
            let port = self
                .midi_capture_names
                .get(event.channel as usize)
                .and_then(|name| graph.ports.get(name));
            if let Some(buf) = port.and_then(|p| unsafe { p.midi_mut() }) {
                let time = event.time.min(nframes.saturating_sub(1));
                let _ = PACKED.put(buf, time, &event.bytes[..event.len as usize]);
            }
        }

        // Clients, in activation order
        for client in &clients {
            for port in graph.ports.values().filter(|p| p.owner == client.name) {
                if port.flags.is_input() {
                    graph.gather(port, nframes);
                } else if let Some(buf) = unsafe { port.midi_mut() } {
                    PACKED.clear(buf, nframes);
                }
            }
            let mut process = lock(&client.process);
            let status = match process.as_mut() {
                Some(handler) => handler.process(nframes),
                None => ProcessStatus::Continue,
            };
            if status == ProcessStatus::Quit {
                log::debug!("[DUMMY] client '{}' asked to quit", client.name);
                client.active.store(false, Ordering::Release);
                process.take();
            }
        }

        // Hardware playback
        for port in graph
            .ports
            .values()
            .filter(|p| p.is_hardware() && p.flags.is_input())
        {
            graph.gather(port, nframes);
        }
        drop(graph);

        {
            let mut transport = lock(&self.transport);
            if matches!(
                transport.state,
                TransportState::Rolling | TransportState::Looping
            ) {
                transport.frame += nframes as u64;
            }
        }

        let now = self.frame_time.fetch_add(nframes as u64, Ordering::AcqRel);
        self.last_frame_time.store(now, Ordering::Release);
        self.cycles.fetch_add(1, Ordering::AcqRel);

        let rate = self.sample_rate.load(Ordering::Relaxed).max(1);
        let period = nframes as f32 / rate as f32;
        let load = started.elapsed().as_secs_f32() / period * 100.0;
        self.cpu_load.store(load.min(100.0).to_bits(), Ordering::Relaxed);
        true
    }

    fn start_clock(&self) {
        if self.config.clock != DummyClock::Realtime
            || self.clock_running.swap(true, Ordering::AcqRel)
        {
            return;
        }
        let weak = self.me.clone();
        let spawned = rt::spawn(
            "dummy-clock",
            0,
            self.config.realtime_priority,
            Box::new(move || clock_loop(weak)),
        );
        if let Err(e) = spawned {
            log::error!("[DUMMY] cannot start clock thread: {}", e);
            self.clock_running.store(false, Ordering::Release);
        }
    }

    fn shutdown(&self, reason: &str) {
        self.reachable.store(false, Ordering::Release);
        let clients: Vec<Arc<ClientCore>> = {
            let _cycle = lock(&self.cycle);
            let clients: Vec<_> = lock(&self.clients).drain(..).collect();
            for client in &clients {
                client.closed.store(true, Ordering::Release);
                client.active.store(false, Ordering::Release);
                lock(&client.process).take();
            }
            clients
        };
        {
            let mut graph = lock(&self.graph);
            let owned: HashSet<&str> = clients.iter().map(|c| c.name.as_str()).collect();
            graph.ports.retain(|_, p| !owned.contains(p.owner.as_str()));
            let ports = graph.ports.keys().cloned().collect::<HashSet<_>>();
            graph
                .edges
                .retain(|(a, b)| ports.contains(a) && ports.contains(b));
        }
        log::info!("[DUMMY] server shutting down: {}", reason);
        for client in clients {
            (client.shutdown)(reason);
        }
    }
}

fn clock_loop(server: Weak<ServerCore>) {
    log::debug!("[DUMMY] clock thread started");
    if let Some(core) = server.upgrade() {
        core.notify(CallbackKind::ThreadInit, |h| h.thread_init());
    }
    loop {
        let Some(core) = server.upgrade() else {
            break;
        };
        let ran = core.run_cycle();
        let rate = core.sample_rate.load(Ordering::Relaxed).max(1);
        let nframes = core.buffer_size.load(Ordering::Relaxed);
        let period = if ran && core.freewheel.load(Ordering::Acquire) {
            Duration::ZERO
        } else {
            Duration::from_secs_f64(nframes as f64 / rate as f64)
        };
        if ran {
            core.poll_sync();
        }
        drop(core);
        if !period.is_zero() {
            thread::sleep(period);
        }
    }
    log::debug!("[DUMMY] clock thread exiting");
}

// ═══════════════════════════════════════════════════════════════════════════════
// Public server handle
// ═══════════════════════════════════════════════════════════════════════════════

/// In-process server; clones share the same server
#[derive(Clone)]
pub struct DummyServer {
    core: Arc<ServerCore>,
}

impl Default for DummyServer {
    fn default() -> Self {
        Self::new(DummyConfig::default())
    }
}

impl DummyServer {
    pub fn new(config: DummyConfig) -> Self {
        Self {
            core: ServerCore::new(config),
        }
    }

    pub fn config(&self) -> &DummyConfig {
        &self.core.config
    }

    /// Make the server (un)reachable for subsequent `open` calls
    pub fn set_reachable(&self, reachable: bool) {
        self.core.reachable.store(reachable, Ordering::Release);
    }

    /// Run `count` cycles on the calling thread; returns how many processed
    /// at least one client
    pub fn run_cycles(&self, count: usize) -> usize {
        let mut ran = 0;
        for _ in 0..count {
            if self.core.run_cycle() {
                ran += 1;
            }
            self.core.poll_sync();
        }
        ran
    }

    pub fn cycle_count(&self) -> u64 {
        self.core.cycles.load(Ordering::Acquire)
    }

    pub fn inject_xrun(&self) {
        self.core.notify(CallbackKind::Xrun, |h| h.xrun());
    }

    /// Drop every client as if the device vanished
    pub fn shutdown(&self, reason: &str) {
        self.core.shutdown(reason);
    }

    /// Server-initiated buffer size change
    pub fn change_buffer_size(&self, nframes: Frames) -> ServerResult<()> {
        self.core.change_buffer_size(nframes)
    }

    /// Resize without telling any client, as if the notice were still on its
    /// way
    pub fn change_buffer_size_unannounced(&self, nframes: Frames) {
        let _cycle = lock(&self.core.cycle);
        self.core
            .buffer_size
            .store(nframes.clamp(1, MAX_BUFFER_SIZE), Ordering::Release);
    }

    /// Server-initiated sample rate change
    pub fn change_sample_rate(&self, rate: u32) {
        self.core.change_sample_rate(rate);
    }

    pub fn graph_reordered(&self) {
        self.core.notify(CallbackKind::GraphOrder, |h| h.graph_reordered());
    }

    /// Make registration of `name` (full or short) fail
    pub fn reject_port(&self, name: &str) {
        lock(&self.core.rejected_ports).insert(name.to_string());
    }

    pub fn allow_port(&self, name: &str) {
        lock(&self.core.rejected_ports).remove(name);
    }

    /// Constant value fed into hardware capture channel `channel` (0-based)
    pub fn set_capture_level(&self, channel: usize, level: Sample) -> bool {
        let name = format!("{}:capture_{}", SYSTEM_CLIENT, channel + 1);
        match lock(&self.core.graph).ports.get(&name) {
            Some(port) => {
                port.level.store(level.to_bits(), Ordering::Relaxed);
                true
            }
            None => false,
        }
    }

    /// Contents of hardware playback channel `channel` after the last cycle
    pub fn playback_buffer(&self, channel: usize) -> Option<Vec<Sample>> {
        let name = format!("{}:playback_{}", SYSTEM_CLIENT, channel + 1);
        let _cycle = lock(&self.core.cycle);
        let nframes = self.core.buffer_size.load(Ordering::Acquire) as usize;
        let graph = lock(&self.core.graph);
        let port = graph.ports.get(&name)?;
        unsafe { port.audio() }.map(|buf| buf[..nframes.min(buf.len())].to_vec())
    }

    /// Queue a MIDI message on hardware capture channel `channel` (0-based)
    /// for the next cycle
    pub fn send_midi(&self, channel: u32, time: Frames, data: &[u8]) -> bool {
        if data.is_empty() || data.len() > 4 {
            return false;
        }
        let mut bytes = [0u8; 4];
        bytes[..data.len()].copy_from_slice(data);
        let event = InjectedMidi {
            channel,
            time,
            len: data.len() as u8,
            bytes,
        };
        lock(&self.core.midi_tx).push(event).is_ok()
    }

    /// Events that reached hardware MIDI playback channel `channel` last cycle
    pub fn midi_playback_events(&self, channel: usize) -> Vec<(Frames, Vec<u8>)> {
        let name = format!("{}:midi_playback_{}", SYSTEM_CLIENT, channel + 1);
        let _cycle = lock(&self.core.cycle);
        let graph = lock(&self.core.graph);
        let Some(buf) = graph.ports.get(&name).and_then(|p| unsafe { p.midi() }) else {
            return Vec::new();
        };
        (0..PACKED.event_count(buf))
            .filter_map(|i| PACKED.event(buf, i))
            .map(|e| (e.time, e.data.to_vec()))
            .collect()
    }

    pub fn ops(&self) -> Vec<ServerOp> {
        lock(&self.core.ops).clone()
    }

    pub fn clear_ops(&self) {
        lock(&self.core.ops).clear();
    }

    pub fn client_names(&self) -> Vec<String> {
        lock(&self.core.clients)
            .iter()
            .map(|c| c.name.clone())
            .collect()
    }

    pub fn has_port(&self, name: &str) -> bool {
        lock(&self.core.graph).ports.contains_key(name)
    }

    pub fn port_names(&self) -> Vec<String> {
        lock(&self.core.graph).ports.keys().cloned().collect()
    }

    pub fn transport(&self) -> TransportPosition {
        *lock(&self.core.transport)
    }

    pub fn is_freewheeling(&self) -> bool {
        self.core.freewheel.load(Ordering::Acquire)
    }

    pub fn buffer_size(&self) -> Frames {
        self.core.buffer_size.load(Ordering::Acquire)
    }
}

impl AudioServer for DummyServer {
    fn name(&self) -> &str {
        "Dummy"
    }

    fn is_running(&self) -> bool {
        self.core.reachable.load(Ordering::Acquire)
    }

    fn open(
        &self,
        client_name: &str,
        session_id: Option<&str>,
        on_shutdown: ShutdownHook,
    ) -> ServerResult<Arc<dyn ServerClient>> {
        if !self.is_running() {
            return Err(ServerError::Unavailable("no server running".to_string()));
        }
        if client_name.is_empty() || client_name.contains(':') {
            return Err(ServerError::Rejected {
                op: "open client",
                reason: format!("invalid client name {:?}", client_name),
            });
        }

        let name = self.core.unique_client_name(client_name);
        let client = Arc::new(ClientCore {
            name: name.clone(),
            shutdown: on_shutdown,
            events: Mutex::new(None),
            enabled: Mutex::new(HashSet::new()),
            process: Mutex::new(None),
            active: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        });
        lock(&self.core.clients).push(client.clone());
        self.core.record(ServerOp::Open {
            requested: client_name.to_string(),
            assigned: name.clone(),
            session_id: session_id.map(str::to_string),
        });
        log::debug!("[DUMMY] client '{}' opened", name);

        Ok(Arc::new(DummyClient {
            core: client,
            server: self.core.clone(),
        }))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Client
// ═══════════════════════════════════════════════════════════════════════════════

struct DummyClient {
    core: Arc<ClientCore>,
    server: Arc<ServerCore>,
}

impl DummyClient {
    fn check_open(&self) -> ServerResult<()> {
        if self.core.closed.load(Ordering::Acquire) {
            Err(ServerError::ClientGone)
        } else {
            Ok(())
        }
    }

    fn rejected(op: &'static str, reason: impl Into<String>) -> ServerError {
        ServerError::Rejected {
            op,
            reason: reason.into(),
        }
    }

    /// Remove every edge touching `port`; returns the removed edges
    fn drop_edges(graph: &mut Graph, port: &str) -> Vec<(String, String)> {
        let removed: Vec<_> = graph
            .edges
            .iter()
            .filter(|(a, b)| a == port || b == port)
            .cloned()
            .collect();
        for edge in &removed {
            graph.edges.remove(edge);
        }
        removed
    }

    fn notify_disconnects(&self, removed: &[(String, String)]) {
        for (a, b) in removed {
            self.server
                .notify(CallbackKind::PortConnect, |h| h.ports_connected(a, b, false));
        }
        if !removed.is_empty() {
            self.server
                .notify(CallbackKind::GraphOrder, |h| h.graph_reordered());
        }
    }
}

impl ServerClient for DummyClient {
    fn name(&self) -> String {
        self.core.name.clone()
    }

    fn sample_rate(&self) -> u32 {
        self.server.sample_rate.load(Ordering::Acquire)
    }

    fn buffer_size(&self) -> Frames {
        self.server.buffer_size.load(Ordering::Acquire)
    }

    fn capabilities(&self) -> ServerCapabilities {
        self.server.config.capabilities
    }

    fn set_buffer_size(&self, nframes: Frames) -> ServerResult<()> {
        self.check_open()?;
        if !self.server.config.capabilities.live_buffer_size_change {
            return Err(ServerError::Unsupported("live buffer size change"));
        }
        self.server.record(ServerOp::SetBufferSize(nframes));
        self.server.change_buffer_size(nframes)
    }

    fn set_sample_rate(&self, rate: u32) -> ServerResult<()> {
        self.check_open()?;
        if !self.server.config.capabilities.live_sample_rate_change {
            return Err(ServerError::Unsupported("live sample rate change"));
        }
        self.server.record(ServerOp::SetSampleRate(rate));
        self.server.change_sample_rate(rate);
        Ok(())
    }

    fn port_type_buffer_size(&self, data_type: DataType) -> Option<usize> {
        if !self.server.config.capabilities.port_type_buffer_size {
            return None;
        }
        Some(match data_type {
            DataType::Audio => self.buffer_size() as usize * std::mem::size_of::<Sample>(),
            DataType::Midi => self.server.config.midi_buffer_bytes,
        })
    }

    fn is_realtime(&self) -> bool {
        self.server.config.clock == DummyClock::Realtime
            && self.server.config.realtime_priority.is_some()
    }

    fn realtime_priority(&self) -> Option<i32> {
        self.server.config.realtime_priority
    }

    fn register_port(
        &self,
        short_name: &str,
        data_type: DataType,
        flags: PortFlags,
    ) -> ServerResult<Arc<dyn ServerPort>> {
        self.check_open()?;
        if short_name.is_empty() {
            return Err(Self::rejected("register port", "empty port name"));
        }
        if flags.is_input() == flags.is_output() {
            return Err(Self::rejected(
                "register port",
                "port must be exactly one of input or output",
            ));
        }
        let full = format!("{}:{}", self.core.name, short_name);
        {
            let rejected = lock(&self.server.rejected_ports);
            if rejected.contains(&full) || rejected.contains(short_name) {
                return Err(Self::rejected("register port", format!("{} refused", full)));
            }
        }

        let port = {
            let mut graph = lock(&self.server.graph);
            if graph.ports.contains_key(&full) {
                return Err(Self::rejected("register port", format!("duplicate port {}", full)));
            }
            let port = Arc::new(DummyPort::new(
                full.clone(),
                &self.core.name,
                data_type,
                flags,
                self.server.config.midi_buffer_bytes,
                self.server.me.clone(),
            ));
            graph.ports.insert(full.clone(), port.clone());
            port
        };
        self.server.record(ServerOp::RegisterPort(full.clone()));
        self.server
            .notify(CallbackKind::PortRegistration, |h| h.port_registration(&full, true));
        Ok(port)
    }

    fn unregister_port(&self, port: &dyn ServerPort) -> ServerResult<()> {
        self.check_open()?;
        let name = port.name();
        let removed = {
            let mut graph = lock(&self.server.graph);
            match graph.ports.get(&name) {
                Some(p) if p.owner == self.core.name => {}
                Some(_) => {
                    return Err(Self::rejected("unregister port", format!("{} is not ours", name)))
                }
                None => {
                    return Err(Self::rejected("unregister port", format!("no port {}", name)))
                }
            }
            let removed = Self::drop_edges(&mut graph, &name);
            graph.ports.remove(&name);
            removed
        };
        self.server.record(ServerOp::UnregisterPort(name.clone()));
        self.notify_disconnects(&removed);
        self.server
            .notify(CallbackKind::PortRegistration, |h| h.port_registration(&name, false));
        Ok(())
    }

    fn port_by_name(&self, name: &str) -> Option<PortInfo> {
        lock(&self.server.graph).ports.get(name).map(|p| p.info())
    }

    fn ports(
        &self,
        pattern: Option<&str>,
        data_type: Option<DataType>,
        flags: PortFlags,
    ) -> Vec<String> {
        let regex = match pattern.map(Regex::new).transpose() {
            Ok(regex) => regex,
            Err(e) => {
                log::warn!("[DUMMY] invalid port pattern: {}", e);
                return Vec::new();
            }
        };
        lock(&self.server.graph)
            .ports
            .values()
            .filter(|p| regex.as_ref().map_or(true, |r| r.is_match(&p.name)))
            .filter(|p| data_type.map_or(true, |t| p.data_type == t))
            .filter(|p| p.flags.contains(flags))
            .map(|p| p.name.clone())
            .collect()
    }

    fn connect(&self, source: &str, destination: &str) -> ServerResult<()> {
        self.check_open()?;
        {
            let mut graph = lock(&self.server.graph);
            let (Some(src), Some(dst)) = (graph.ports.get(source), graph.ports.get(destination))
            else {
                return Err(Self::rejected(
                    "connect",
                    format!("no such port in {} -> {}", source, destination),
                ));
            };
            if src.data_type != dst.data_type {
                return Err(Self::rejected("connect", "port types differ"));
            }
            if !src.flags.is_output() || !dst.flags.is_input() {
                return Err(Self::rejected("connect", "source must be an output, destination an input"));
            }
            let edge = (source.to_string(), destination.to_string());
            if !graph.edges.insert(edge) {
                return Err(Self::rejected("connect", "already connected"));
            }
        }
        self.server
            .record(ServerOp::Connect(source.to_string(), destination.to_string()));
        self.server
            .notify(CallbackKind::PortConnect, |h| h.ports_connected(source, destination, true));
        self.server
            .notify(CallbackKind::GraphOrder, |h| h.graph_reordered());
        Ok(())
    }

    fn disconnect(&self, source: &str, destination: &str) -> ServerResult<()> {
        self.check_open()?;
        let removed = lock(&self.server.graph)
            .edges
            .remove(&(source.to_string(), destination.to_string()));
        if !removed {
            return Err(Self::rejected(
                "disconnect",
                format!("{} is not connected to {}", source, destination),
            ));
        }
        self.server
            .record(ServerOp::Disconnect(source.to_string(), destination.to_string()));
        self.notify_disconnects(&[(source.to_string(), destination.to_string())]);
        Ok(())
    }

    fn connections(&self, port_name: &str) -> Vec<String> {
        lock(&self.server.graph)
            .edges
            .iter()
            .filter_map(|(a, b)| {
                if a == port_name {
                    Some(b.clone())
                } else if b == port_name {
                    Some(a.clone())
                } else {
                    None
                }
            })
            .collect()
    }

    fn recompute_latencies(&self) {
        self.server.record(ServerOp::RecomputeLatencies);
        if self.server.config.capabilities.latency_callback {
            self.server
                .notify(CallbackKind::Latency, |h| h.latency(LatencyMode::Capture));
            self.server
                .notify(CallbackKind::Latency, |h| h.latency(LatencyMode::Playback));
        }
    }

    fn enable_callback(&self, kind: CallbackKind) -> ServerResult<()> {
        self.check_open()?;
        let caps = self.server.config.capabilities;
        let supported = match kind {
            CallbackKind::Latency => caps.latency_callback,
            CallbackKind::Session => caps.session_callback,
            _ => true,
        };
        if !supported {
            return Err(ServerError::Unsupported(match kind {
                CallbackKind::Latency => "latency callback",
                _ => "session callback",
            }));
        }
        lock(&self.core.enabled).insert(kind);
        self.server.record(ServerOp::EnableCallback(kind));
        Ok(())
    }

    fn set_event_handler(&self, events: Arc<dyn ServerEvents>) {
        *lock(&self.core.events) = Some(events);
    }

    fn activate(&self, process: Box<dyn ProcessHandler>) -> ServerResult<()> {
        self.check_open()?;
        if self.core.active.load(Ordering::Acquire) {
            return Err(Self::rejected("activate", "client already active"));
        }
        {
            let _cycle = lock(&self.server.cycle);
            *lock(&self.core.process) = Some(process);
            self.core.active.store(true, Ordering::Release);
        }
        self.server.record(ServerOp::Activate(self.core.name.clone()));
        log::debug!("[DUMMY] client '{}' activated", self.core.name);

        if self.server.config.capabilities.reliable_buffer_size_callback
            && lock(&self.core.enabled).contains(&CallbackKind::BufferSize)
        {
            let nframes = self.buffer_size();
            let handler = lock(&self.core.events).clone();
            if let Some(handler) = handler {
                let _cycle = lock(&self.server.cycle);
                handler.buffer_size_changed(nframes);
            }
        }
        self.server.start_clock();
        Ok(())
    }

    fn deactivate(&self) -> ServerResult<()> {
        self.check_open()?;
        {
            let _cycle = lock(&self.server.cycle);
            self.core.active.store(false, Ordering::Release);
            lock(&self.core.process).take();
        }
        self.server.record(ServerOp::Deactivate(self.core.name.clone()));
        Ok(())
    }

    fn set_freewheel(&self, enabled: bool) -> ServerResult<()> {
        self.check_open()?;
        self.server.record(ServerOp::SetFreewheel(enabled));
        self.server.set_freewheel(enabled);
        Ok(())
    }

    fn transport_start(&self) {
        self.server.record(ServerOp::TransportStart);
        {
            let mut transport = lock(&self.server.transport);
            if transport.state == TransportState::Stopped {
                transport.state = TransportState::Starting;
            }
        }
        self.server.poll_sync();
    }

    fn transport_stop(&self) {
        self.server.record(ServerOp::TransportStop);
        lock(&self.server.transport).state = TransportState::Stopped;
    }

    fn transport_locate(&self, frame: u64) {
        self.server.record(ServerOp::TransportLocate(frame));
        let position = {
            let mut transport = lock(&self.server.transport);
            transport.frame = frame;
            *transport
        };
        if position.state != TransportState::Stopped {
            lock(&self.server.transport).state = TransportState::Starting;
            self.server.poll_sync();
        }
    }

    fn transport_query(&self) -> TransportPosition {
        *lock(&self.server.transport)
    }

    fn set_timebase_master(&self, enabled: bool) -> ServerResult<()> {
        self.check_open()?;
        self.server.record(ServerOp::SetTimebase(enabled));
        self.server.timebase_master.store(enabled, Ordering::Release);
        Ok(())
    }

    fn cpu_load(&self) -> f32 {
        f32::from_bits(self.server.cpu_load.load(Ordering::Relaxed))
    }

    fn frame_time(&self) -> u64 {
        self.server.frame_time.load(Ordering::Acquire)
    }

    fn last_frame_time(&self) -> u64 {
        self.server.last_frame_time.load(Ordering::Acquire)
    }

    fn frames_since_cycle_start(&self) -> Frames {
        let start = Duration::from_nanos(self.server.cycle_start_nanos.load(Ordering::Relaxed));
        let elapsed = self
            .server
            .epoch
            .elapsed()
            .saturating_sub(start)
            .as_secs_f64();
        let frames = (elapsed * self.sample_rate() as f64) as u64;
        frames.min(self.buffer_size() as u64) as Frames
    }

    fn spawn_realtime(
        &self,
        name: &str,
        stack_size: usize,
        task: RealtimeTask,
    ) -> ServerResult<JoinHandle<()>> {
        rt::spawn(name, stack_size, self.server.config.realtime_priority, task)
    }

    fn close(&self) {
        if self.core.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        {
            let _cycle = lock(&self.server.cycle);
            self.core.active.store(false, Ordering::Release);
            lock(&self.core.process).take();
        }

        let mut removed = Vec::new();
        let mut dropped_ports = Vec::new();
        {
            let mut graph = lock(&self.server.graph);
            let owned: Vec<String> = graph
                .ports
                .values()
                .filter(|p| p.owner == self.core.name)
                .map(|p| p.name.clone())
                .collect();
            for name in owned {
                removed.extend(Self::drop_edges(&mut graph, &name));
                graph.ports.remove(&name);
                dropped_ports.push(name);
            }
        }
        lock(&self.server.clients).retain(|c| !Arc::ptr_eq(c, &self.core));
        self.server.record(ServerOp::Close(self.core.name.clone()));
        self.notify_disconnects(&removed);
        for name in &dropped_ports {
            self.server
                .notify(CallbackKind::PortRegistration, |h| h.port_registration(name, false));
        }
        log::debug!("[DUMMY] client '{}' closed", self.core.name);
    }
}

impl Drop for DummyClient {
    fn drop(&mut self) {
        self.close();
    }
}
