//! JACK server binding for Linux
//!
//! Client lifetime and callback registration go through the `jack` crate.
//! Per-cycle buffer access, MIDI buffers, latency ranges and transport control
//! go straight to `jack-sys`, since the realtime side works on raw port
//! buffers rather than typed `Port<T>` handles.
//!
//! # Threads
//!
//! ```text
//! ┌──────────────────┐                     ┌─────────────────────┐
//! │  Control Thread  │──register/connect──►│   JackClient        │
//! └──────────────────┘                     │  (Mutex<ClientSlot>)│
//!                                          └──────────┬──────────┘
//!                                                     │ activate_async
//!                         ┌───────────────────────────┴───────────┐
//!                         ▼                                       ▼
//!              ┌─────────────────────┐                 ┌─────────────────────┐
//!              │ JackNotifications   │                 │  JackProcess        │
//!              │ (notification thr.) │                 │  (JACK RT thread)   │
//!              └─────────────────────┘                 └─────────────────────┘
//! ```

use std::collections::HashSet;
use std::ffi::{CStr, CString};
use std::os::raw::{c_char, c_int, c_void};
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use jack::{Client, ClientOptions, ClientStatus, Control, ProcessScope};
use jack_sys as j;

use super::{
    AudioServer, CallbackKind, PortInfo, ProcessHandler, ProcessStatus, RawBuffer,
    RealtimeTask, ServerCapabilities, ServerClient, ServerEvents, ServerPort, ShutdownHook,
};
use crate::error::{MidiError, ServerError, ServerResult};
use crate::midi::{MidiCodec, MidiEvent};
use crate::rt;
use crate::sync::lock;
use crate::types::{
    DataType, Frames, LatencyMode, LatencyRange, PortFlags, Sample, TransportPosition,
    TransportState,
};

/// Client name used for the reachability probe
const PROBE_CLIENT: &str = "tether_probe";

static JACK_MIDI: JackMidiCodec = JackMidiCodec;

/// Capabilities of the JACK binding
const JACK_CAPABILITIES: ServerCapabilities = ServerCapabilities {
    reliable_buffer_size_callback: true,
    port_type_buffer_size: false,
    live_sample_rate_change: false,
    live_buffer_size_change: true,
    latency_callback: false,
    session_callback: false,
};

/// Opens clients on the JACK server (or PipeWire's JACK layer)
#[derive(Debug, Default, Clone, Copy)]
pub struct JackServer;

impl JackServer {
    pub fn new() -> Self {
        Self
    }
}

impl AudioServer for JackServer {
    fn name(&self) -> &str {
        "JACK"
    }

    fn is_running(&self) -> bool {
        match Client::new(PROBE_CLIENT, ClientOptions::NO_START_SERVER) {
            Ok(_) => true,
            Err(e) => {
                log::debug!("[JACK] no server reachable: {}", e);
                false
            }
        }
    }

    fn open(
        &self,
        client_name: &str,
        session_id: Option<&str>,
        on_shutdown: ShutdownHook,
    ) -> ServerResult<Arc<dyn ServerClient>> {
        if let Some(id) = session_id {
            log::debug!("[JACK] session id {} not forwarded by this binding", id);
        }
        // libjack autostarts a server from ~/.jackdrc if none is running
        let (client, status) = Client::new(client_name, ClientOptions::empty())
            .map_err(|e| ServerError::Unavailable(e.to_string()))?;
        if status.contains(ClientStatus::NAME_NOT_UNIQUE) {
            log::info!(
                "[JACK] requested name '{}' taken, server assigned '{}'",
                client_name,
                client.name()
            );
        }

        let raw = RawClient(client.raw());
        let sink = Arc::new(EventSink {
            events: Mutex::new(None),
            enabled: Mutex::new(HashSet::new()),
            shutdown: on_shutdown,
            closed: AtomicBool::new(false),
        });
        log::info!(
            "[JACK] client '{}' opened (rate {} Hz, {} frames)",
            client.name(),
            client.sample_rate(),
            client.buffer_size()
        );

        Ok(Arc::new(JackClient {
            name: client.name().to_string(),
            raw,
            slot: Mutex::new(ClientSlot::Inactive(client)),
            sink,
        }))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Client
// ═══════════════════════════════════════════════════════════════════════════════

/// Raw client pointer, valid until the owning `ClientSlot` is dropped
#[derive(Clone, Copy)]
struct RawClient(*mut j::jack_client_t);

// SAFETY: libjack client calls are thread-safe; the pointer outlives every use
// because `JackClient` checks `closed` before touching it.
unsafe impl Send for RawClient {}
unsafe impl Sync for RawClient {}

enum ClientSlot {
    Inactive(Client),
    Active(jack::AsyncClient<JackNotifications, JackProcess>),
    Closed,
}

impl ClientSlot {
    fn client(&self) -> Option<&Client> {
        match self {
            ClientSlot::Inactive(client) => Some(client),
            ClientSlot::Active(client) => Some(client.as_client()),
            ClientSlot::Closed => None,
        }
    }
}

/// State shared between the client handle and the JACK callback threads
struct EventSink {
    events: Mutex<Option<Arc<dyn ServerEvents>>>,
    enabled: Mutex<HashSet<CallbackKind>>,
    shutdown: ShutdownHook,
    closed: AtomicBool,
}

impl EventSink {
    fn handler(&self, kind: CallbackKind) -> Option<Arc<dyn ServerEvents>> {
        if !lock(&self.enabled).contains(&kind) {
            return None;
        }
        lock(&self.events).clone()
    }

    fn thread_init(&self) {
        if let Some(handler) = self.handler(CallbackKind::ThreadInit) {
            handler.thread_init();
        }
    }

    /// True when the client is ready to roll; clients without a sync handler
    /// never hold the transport back
    fn sync(&self, position: TransportPosition) -> bool {
        self.handler(CallbackKind::Sync)
            .map_or(true, |handler| handler.sync(position))
    }
}

struct JackClient {
    name: String,
    raw: RawClient,
    slot: Mutex<ClientSlot>,
    sink: Arc<EventSink>,
}

impl JackClient {
    fn raw(&self) -> ServerResult<*mut j::jack_client_t> {
        if self.sink.closed.load(Ordering::Acquire) {
            Err(ServerError::ClientGone)
        } else {
            Ok(self.raw.0)
        }
    }

    fn with_client<T>(&self, f: impl FnOnce(&Client) -> T) -> ServerResult<T> {
        let slot = lock(&self.slot);
        slot.client().map(f).ok_or(ServerError::ClientGone)
    }

    fn rejected(op: &'static str, reason: impl Into<String>) -> ServerError {
        ServerError::Rejected {
            op,
            reason: reason.into(),
        }
    }
}

fn c_string(op: &'static str, s: &str) -> ServerResult<CString> {
    CString::new(s).map_err(|_| JackClient::rejected(op, format!("{:?} contains NUL", s)))
}

/// Collect and free a NULL-terminated array of names returned by libjack
///
/// # Safety
/// `names` is null or a list allocated by libjack that nothing else frees.
unsafe fn take_name_list(names: *mut *const c_char) -> Vec<String> {
    let mut out = Vec::new();
    if names.is_null() {
        return out;
    }
    let mut i = 0;
    loop {
        let entry = *names.add(i);
        if entry.is_null() {
            break;
        }
        out.push(CStr::from_ptr(entry).to_string_lossy().into_owned());
        i += 1;
    }
    j::jack_free(names as *mut c_void);
    out
}

impl ServerClient for JackClient {
    fn name(&self) -> String {
        self.name.clone()
    }

    fn sample_rate(&self) -> u32 {
        self.with_client(|c| c.sample_rate() as u32).unwrap_or(0)
    }

    fn buffer_size(&self) -> Frames {
        self.with_client(|c| c.buffer_size()).unwrap_or(0)
    }

    fn capabilities(&self) -> ServerCapabilities {
        JACK_CAPABILITIES
    }

    fn set_buffer_size(&self, nframes: Frames) -> ServerResult<()> {
        // Blocks until the server has resized; the slot stays unlocked so
        // callbacks and other control calls get through meanwhile
        let raw = self.raw()?;
        let rc = unsafe { j::jack_set_buffer_size(raw, nframes) };
        if rc != 0 {
            return Err(Self::rejected("set buffer size", format!("error code {}", rc)));
        }
        Ok(())
    }

    fn set_sample_rate(&self, _rate: u32) -> ServerResult<()> {
        Err(ServerError::Unsupported("live sample rate change"))
    }

    fn port_type_buffer_size(&self, _data_type: DataType) -> Option<usize> {
        None
    }

    fn is_realtime(&self) -> bool {
        match self.raw() {
            Ok(raw) => unsafe { j::jack_is_realtime(raw) != 0 },
            Err(_) => false,
        }
    }

    fn realtime_priority(&self) -> Option<i32> {
        let raw = self.raw().ok()?;
        let priority = unsafe { j::jack_client_real_time_priority(raw) };
        (priority >= 0).then_some(priority)
    }

    fn register_port(
        &self,
        short_name: &str,
        data_type: DataType,
        flags: PortFlags,
    ) -> ServerResult<Arc<dyn ServerPort>> {
        let raw = self.raw()?;
        let name = c_string("register port", short_name)?;
        let port_type = c_string("register port", data_type.jack_type_name())?;
        let port = unsafe {
            j::jack_port_register(
                raw,
                name.as_ptr(),
                port_type.as_ptr(),
                flags.bits() as _,
                0,
            )
        };
        let port = NonNull::new(port).ok_or_else(|| {
            Self::rejected("register port", format!("{}:{} refused", self.name, short_name))
        })?;
        Ok(Arc::new(JackPort {
            raw: port,
            data_type,
            flags,
        }))
    }

    fn unregister_port(&self, port: &dyn ServerPort) -> ServerResult<()> {
        let raw = self.raw()?;
        let name = c_string("unregister port", &port.name())?;
        let handle = unsafe { j::jack_port_by_name(raw, name.as_ptr()) };
        if handle.is_null() {
            return Err(Self::rejected("unregister port", port.name()));
        }
        let rc = unsafe { j::jack_port_unregister(raw, handle) };
        if rc != 0 {
            return Err(Self::rejected("unregister port", format!("error code {}", rc)));
        }
        Ok(())
    }

    fn port_by_name(&self, name: &str) -> Option<PortInfo> {
        self.with_client(|c| {
            let port = c.port_by_name(name)?;
            let data_type = DataType::from_jack_type_name(&port.port_type().ok()?)?;
            Some(PortInfo {
                name: name.to_string(),
                data_type,
                flags: PortFlags::from_bits_truncate(port.flags().bits() as u32),
            })
        })
        .ok()
        .flatten()
    }

    fn ports(
        &self,
        pattern: Option<&str>,
        data_type: Option<DataType>,
        flags: PortFlags,
    ) -> Vec<String> {
        let flags = jack::PortFlags::from_bits_truncate(flags.bits() as _);
        self.with_client(|c| c.ports(pattern, data_type.map(|t| t.jack_type_name()), flags))
            .unwrap_or_default()
    }

    fn connect(&self, source: &str, destination: &str) -> ServerResult<()> {
        self.with_client(|c| c.connect_ports_by_name(source, destination))?
            .map_err(|e| Self::rejected("connect", e.to_string()))
    }

    fn disconnect(&self, source: &str, destination: &str) -> ServerResult<()> {
        self.with_client(|c| c.disconnect_ports_by_name(source, destination))?
            .map_err(|e| Self::rejected("disconnect", e.to_string()))
    }

    fn connections(&self, port_name: &str) -> Vec<String> {
        let (Ok(raw), Ok(name)) = (self.raw(), CString::new(port_name)) else {
            return Vec::new();
        };
        unsafe {
            let port = j::jack_port_by_name(raw, name.as_ptr());
            if port.is_null() {
                return Vec::new();
            }
            take_name_list(j::jack_port_get_all_connections(raw, port))
        }
    }

    fn recompute_latencies(&self) {
        if let Ok(raw) = self.raw() {
            unsafe {
                j::jack_recompute_total_latencies(raw);
            }
        }
    }

    fn enable_callback(&self, kind: CallbackKind) -> ServerResult<()> {
        // Everything but sync is installed by activate_async; this records
        // which callbacks get forwarded
        match kind {
            CallbackKind::Latency => return Err(ServerError::Unsupported("latency callback")),
            CallbackKind::Session => return Err(ServerError::Unsupported("session callback")),
            CallbackKind::Sync => {
                let raw = self.raw()?;
                // SAFETY: the sink outlives the libjack client, which is
                // closed before `JackClient` drops its reference
                let rc = unsafe {
                    j::jack_set_sync_callback(
                        raw,
                        Some(sync_callback),
                        Arc::as_ptr(&self.sink) as *mut c_void,
                    )
                };
                if rc != 0 {
                    return Err(Self::rejected("sync callback", format!("error code {}", rc)));
                }
            }
            _ => {}
        }
        lock(&self.sink.enabled).insert(kind);
        Ok(())
    }

    fn set_event_handler(&self, events: Arc<dyn ServerEvents>) {
        *lock(&self.sink.events) = Some(events);
    }

    fn activate(&self, process: Box<dyn ProcessHandler>) -> ServerResult<()> {
        let mut slot = lock(&self.slot);
        let client = match std::mem::replace(&mut *slot, ClientSlot::Closed) {
            ClientSlot::Inactive(client) => client,
            other => {
                *slot = other;
                return Err(Self::rejected("activate", "client not inactive"));
            }
        };
        let notifications = JackNotifications {
            sink: self.sink.clone(),
        };
        let processor = JackProcess {
            inner: process,
            sink: self.sink.clone(),
        };
        match client.activate_async(notifications, processor) {
            Ok(active) => {
                *slot = ClientSlot::Active(active);
                log::info!("[JACK] client '{}' activated", self.name);
                Ok(())
            }
            Err(e) => {
                // activate_async consumed the client; the session is gone
                self.sink.closed.store(true, Ordering::Release);
                Err(Self::rejected("activate", e.to_string()))
            }
        }
    }

    fn deactivate(&self) -> ServerResult<()> {
        let mut slot = lock(&self.slot);
        match std::mem::replace(&mut *slot, ClientSlot::Closed) {
            ClientSlot::Active(active) => match active.deactivate() {
                Ok((client, _, _)) => {
                    *slot = ClientSlot::Inactive(client);
                    Ok(())
                }
                Err(e) => {
                    self.sink.closed.store(true, Ordering::Release);
                    Err(Self::rejected("deactivate", e.to_string()))
                }
            },
            other => {
                *slot = other;
                Ok(())
            }
        }
    }

    fn set_freewheel(&self, enabled: bool) -> ServerResult<()> {
        let raw = self.raw()?;
        let rc = unsafe { j::jack_set_freewheel(raw, enabled as c_int) };
        if rc != 0 {
            return Err(Self::rejected("set freewheel", format!("error code {}", rc)));
        }
        Ok(())
    }

    fn transport_start(&self) {
        if let Ok(raw) = self.raw() {
            unsafe { j::jack_transport_start(raw) }
        }
    }

    fn transport_stop(&self) {
        if let Ok(raw) = self.raw() {
            unsafe { j::jack_transport_stop(raw) }
        }
    }

    fn transport_locate(&self, frame: u64) {
        if let Ok(raw) = self.raw() {
            unsafe {
                j::jack_transport_locate(raw, frame.min(u32::MAX as u64) as j::jack_nframes_t);
            }
        }
    }

    fn transport_query(&self) -> TransportPosition {
        let Ok(raw) = self.raw() else {
            return TransportPosition::default();
        };
        let (state, frame) = unsafe {
            (
                j::jack_transport_query(raw, ptr::null_mut()),
                j::jack_get_current_transport_frame(raw),
            )
        };
        TransportPosition {
            state: transport_state(state),
            frame: frame as u64,
        }
    }

    fn set_timebase_master(&self, enabled: bool) -> ServerResult<()> {
        let raw = self.raw()?;
        let rc = unsafe {
            if enabled {
                j::jack_set_timebase_callback(raw, 0, Some(timebase), ptr::null_mut())
            } else {
                j::jack_release_timebase(raw)
            }
        };
        if rc != 0 {
            return Err(Self::rejected("timebase", format!("error code {}", rc)));
        }
        Ok(())
    }

    fn cpu_load(&self) -> f32 {
        self.with_client(|c| c.cpu_load()).unwrap_or(0.0)
    }

    fn frame_time(&self) -> u64 {
        self.with_client(|c| c.frame_time() as u64).unwrap_or(0)
    }

    fn last_frame_time(&self) -> u64 {
        self.with_client(|c| c.last_frame_time() as u64).unwrap_or(0)
    }

    fn frames_since_cycle_start(&self) -> Frames {
        self.with_client(|c| c.frames_since_cycle_start()).unwrap_or(0)
    }

    fn spawn_realtime(
        &self,
        name: &str,
        stack_size: usize,
        task: RealtimeTask,
    ) -> ServerResult<JoinHandle<()>> {
        rt::spawn(name, stack_size, self.realtime_priority(), task)
    }

    fn close(&self) {
        let previous = {
            let mut slot = lock(&self.slot);
            self.sink.closed.store(true, Ordering::Release);
            std::mem::replace(&mut *slot, ClientSlot::Closed)
        };
        match previous {
            ClientSlot::Active(active) => {
                if let Err(e) = active.deactivate() {
                    log::warn!("[JACK] deactivate on close failed: {}", e);
                }
            }
            ClientSlot::Inactive(client) => drop(client),
            ClientSlot::Closed => return,
        }
        log::info!("[JACK] client '{}' closed", self.name);
    }
}

impl Drop for JackClient {
    fn drop(&mut self) {
        self.close();
    }
}

fn transport_state(state: j::jack_transport_state_t) -> TransportState {
    match state {
        j::JackTransportRolling => TransportState::Rolling,
        j::JackTransportLooping => TransportState::Looping,
        j::JackTransportStarting => TransportState::Starting,
        _ => TransportState::Stopped,
    }
}

/// Slow-sync callback; `arg` is the client's `EventSink`
unsafe extern "C" fn sync_callback(
    state: j::jack_transport_state_t,
    pos: *mut j::jack_position_t,
    arg: *mut c_void,
) -> c_int {
    let Some(sink) = (arg as *const EventSink).as_ref() else {
        return 1;
    };
    let frame = pos.as_ref().map_or(0, |pos| pos.frame as u64);
    let position = TransportPosition {
        state: transport_state(state),
        frame,
    };
    sink.sync(position) as c_int
}

/// Timebase callback that leaves the position untouched
unsafe extern "C" fn timebase(
    _state: j::jack_transport_state_t,
    _nframes: j::jack_nframes_t,
    _pos: *mut j::jack_position_t,
    _new_pos: c_int,
    _arg: *mut c_void,
) {
}

// ═══════════════════════════════════════════════════════════════════════════════
// Ports
// ═══════════════════════════════════════════════════════════════════════════════

struct JackPort {
    raw: NonNull<j::jack_port_t>,
    data_type: DataType,
    flags: PortFlags,
}

// SAFETY: jack_port_t handles are process-wide and libjack port calls are
// thread-safe; buffers are only dereferenced on the process thread.
unsafe impl Send for JackPort {}
unsafe impl Sync for JackPort {}

fn latency_mode(mode: LatencyMode) -> j::jack_latency_callback_mode_t {
    match mode {
        LatencyMode::Capture => j::JackCaptureLatency,
        LatencyMode::Playback => j::JackPlaybackLatency,
    }
}

impl ServerPort for JackPort {
    fn name(&self) -> String {
        unsafe {
            let name = j::jack_port_name(self.raw.as_ptr());
            if name.is_null() {
                return String::new();
            }
            CStr::from_ptr(name).to_string_lossy().into_owned()
        }
    }

    fn data_type(&self) -> DataType {
        self.data_type
    }

    fn flags(&self) -> PortFlags {
        self.flags
    }

    fn buffer(&self, nframes: Frames) -> Option<RawBuffer> {
        let ptr = unsafe { j::jack_port_get_buffer(self.raw.as_ptr(), nframes) };
        // MIDI port buffers are at least as large as audio ones; the codec
        // never reads past what libjack reports anyway
        NonNull::new(ptr as *mut u8).map(|ptr| RawBuffer {
            ptr,
            len: nframes as usize * std::mem::size_of::<Sample>(),
        })
    }

    fn midi_codec(&self) -> &'static dyn MidiCodec {
        &JACK_MIDI
    }

    fn set_latency_range(&self, mode: LatencyMode, range: LatencyRange) {
        let mut raw = j::jack_latency_range_t {
            min: range.min,
            max: range.max,
        };
        unsafe { j::jack_port_set_latency_range(self.raw.as_ptr(), latency_mode(mode), &mut raw) }
    }

    fn latency_range(&self, mode: LatencyMode) -> LatencyRange {
        let mut raw = j::jack_latency_range_t { min: 0, max: 0 };
        unsafe { j::jack_port_get_latency_range(self.raw.as_ptr(), latency_mode(mode), &mut raw) }
        LatencyRange::new(raw.min, raw.max)
    }
}

/// JACK's native MIDI buffer layout, through libjack's accessors
#[derive(Debug, Default, Clone, Copy)]
pub struct JackMidiCodec;

impl MidiCodec for JackMidiCodec {
    fn event_count(&self, buf: &[u8]) -> u32 {
        unsafe { j::jack_midi_get_event_count(buf.as_ptr() as *mut c_void) }
    }

    fn event<'b>(&self, buf: &'b [u8], index: u32) -> Option<MidiEvent<'b>> {
        let mut event = j::jack_midi_event_t {
            time: 0,
            size: 0,
            buffer: ptr::null_mut(),
        };
        let rc = unsafe { j::jack_midi_event_get(&mut event, buf.as_ptr() as *mut c_void, index) };
        if rc != 0 || event.buffer.is_null() {
            return None;
        }
        // SAFETY: event data lives inside the port buffer borrowed as `buf`
        let data = unsafe { std::slice::from_raw_parts(event.buffer as *const u8, event.size) };
        Some(MidiEvent {
            time: event.time,
            data,
        })
    }

    fn put(&self, buf: &mut [u8], time: Frames, data: &[u8]) -> Result<(), MidiError> {
        let count = self.event_count(buf);
        if let Some(last) = count.checked_sub(1).and_then(|i| self.event(buf, i)) {
            if time < last.time {
                return Err(MidiError::OutOfOrder {
                    time,
                    last: last.time,
                });
            }
        }
        let rc = unsafe {
            j::jack_midi_event_write(buf.as_mut_ptr() as *mut c_void, time, data.as_ptr(), data.len())
        };
        match rc {
            0 => Ok(()),
            // Order was checked above, so libjack found the time past the
            // cycle; the caller knows the cycle length
            rc if rc == -(libc::EINVAL) || rc == libc::EINVAL => {
                Err(MidiError::InvalidTime { time, nframes: 0 })
            }
            _ => Err(MidiError::Overflow),
        }
    }

    fn clear(&self, buf: &mut [u8], _nframes: Frames) {
        unsafe { j::jack_midi_clear_buffer(buf.as_mut_ptr() as *mut c_void) }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Callbacks
// ═══════════════════════════════════════════════════════════════════════════════

struct JackProcess {
    inner: Box<dyn ProcessHandler>,
    sink: Arc<EventSink>,
}

impl jack::ProcessHandler for JackProcess {
    fn process(&mut self, _client: &Client, ps: &ProcessScope) -> Control {
        match self.inner.process(ps.n_frames()) {
            ProcessStatus::Continue => Control::Continue,
            ProcessStatus::Quit => Control::Quit,
        }
    }

    fn buffer_size(&mut self, _client: &Client, size: jack::Frames) -> Control {
        if let Some(handler) = self.sink.handler(CallbackKind::BufferSize) {
            handler.buffer_size_changed(size);
        }
        Control::Continue
    }
}

struct JackNotifications {
    sink: Arc<EventSink>,
}

fn port_name_by_id(client: &Client, id: jack::PortId) -> Option<String> {
    client.port_by_id(id).and_then(|p| p.name().ok())
}

impl jack::NotificationHandler for JackNotifications {
    fn thread_init(&self, _client: &Client) {
        self.sink.thread_init();
    }

    unsafe fn shutdown(&mut self, _status: ClientStatus, reason: &str) {
        self.sink.closed.store(true, Ordering::Release);
        (self.sink.shutdown)(reason);
    }

    fn freewheel(&mut self, _client: &Client, is_enabled: bool) {
        if let Some(handler) = self.sink.handler(CallbackKind::Freewheel) {
            handler.freewheel(is_enabled);
        }
    }

    fn sample_rate(&mut self, _client: &Client, srate: jack::Frames) -> Control {
        if let Some(handler) = self.sink.handler(CallbackKind::SampleRate) {
            handler.sample_rate_changed(srate);
        }
        Control::Continue
    }

    fn port_registration(&mut self, client: &Client, port_id: jack::PortId, is_registered: bool) {
        let Some(handler) = self.sink.handler(CallbackKind::PortRegistration) else {
            return;
        };
        match port_name_by_id(client, port_id) {
            Some(name) => handler.port_registration(&name, is_registered),
            None => log::debug!("[JACK] registration event for vanished port {}", port_id),
        }
    }

    fn ports_connected(
        &mut self,
        client: &Client,
        port_id_a: jack::PortId,
        port_id_b: jack::PortId,
        are_connected: bool,
    ) {
        let Some(handler) = self.sink.handler(CallbackKind::PortConnect) else {
            return;
        };
        if let (Some(a), Some(b)) = (
            port_name_by_id(client, port_id_a),
            port_name_by_id(client, port_id_b),
        ) {
            handler.ports_connected(&a, &b, are_connected);
        }
    }

    fn graph_reorder(&mut self, _client: &Client) -> Control {
        if let Some(handler) = self.sink.handler(CallbackKind::GraphOrder) {
            handler.graph_reordered();
        }
        Control::Continue
    }

    fn xrun(&mut self, _client: &Client) -> Control {
        if let Some(handler) = self.sink.handler(CallbackKind::Xrun) {
            handler.xrun();
        }
        Control::Continue
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Recorder {
        synced: Mutex<Vec<TransportPosition>>,
        thread_inits: Mutex<usize>,
        ready: bool,
    }

    impl ServerEvents for Recorder {
        fn thread_init(&self) {
            *lock(&self.thread_inits) += 1;
        }
        fn sample_rate_changed(&self, _rate: u32) {}
        fn buffer_size_changed(&self, _nframes: Frames) {}
        fn graph_reordered(&self) {}
        fn port_registration(&self, _name: &str, _registered: bool) {}
        fn ports_connected(&self, _a: &str, _b: &str, _connected: bool) {}
        fn xrun(&self) {}
        fn sync(&self, position: TransportPosition) -> bool {
            lock(&self.synced).push(position);
            self.ready
        }
        fn freewheel(&self, _enabled: bool) {}
        fn latency(&self, _mode: LatencyMode) {}
    }

    fn sink(recorder: &Arc<Recorder>, enabled: &[CallbackKind]) -> Arc<EventSink> {
        let events: Arc<dyn ServerEvents> = recorder.clone();
        Arc::new(EventSink {
            events: Mutex::new(Some(events)),
            enabled: Mutex::new(enabled.iter().copied().collect()),
            shutdown: Arc::new(|_: &str| {}),
            closed: AtomicBool::new(false),
        })
    }

    fn run_sync(sink: &Arc<EventSink>, state: j::jack_transport_state_t, frame: u32) -> c_int {
        let mut pos: j::jack_position_t = unsafe { std::mem::zeroed() };
        pos.frame = frame;
        unsafe { sync_callback(state, &mut pos, Arc::as_ptr(sink) as *mut c_void) }
    }

    #[test]
    fn test_sync_callback_reaches_enabled_handler() {
        let recorder = Arc::new(Recorder::default());
        let sink = sink(&recorder, &[CallbackKind::Sync]);

        assert_eq!(run_sync(&sink, j::JackTransportStarting, 4096), 0);
        assert_eq!(
            lock(&recorder.synced).as_slice(),
            &[TransportPosition {
                state: TransportState::Starting,
                frame: 4096,
            }]
        );
    }

    #[test]
    fn test_sync_callback_without_handler_is_ready() {
        let recorder = Arc::new(Recorder::default());
        let sink = sink(&recorder, &[]);

        assert_eq!(run_sync(&sink, j::JackTransportStarting, 0), 1);
        assert!(lock(&recorder.synced).is_empty());
        let orphan = unsafe {
            sync_callback(j::JackTransportStarting, ptr::null_mut(), ptr::null_mut())
        };
        assert_eq!(orphan, 1);
    }

    #[test]
    fn test_set_buffer_size_leaves_slot_unlocked() {
        let recorder = Arc::new(Recorder::default());
        let client = JackClient {
            name: "tether".to_string(),
            raw: RawClient(ptr::null_mut()),
            slot: Mutex::new(ClientSlot::Closed),
            sink: sink(&recorder, &[]),
        };
        client.sink.closed.store(true, Ordering::Release);

        // A callback thread holding the slot must not stall the resize call
        let _slot = lock(&client.slot);
        assert!(matches!(
            client.set_buffer_size(512),
            Err(ServerError::ClientGone)
        ));
    }

    #[test]
    fn test_thread_init_forwarded_only_when_enabled() {
        let recorder = Arc::new(Recorder::default());
        sink(&recorder, &[]).thread_init();
        assert_eq!(*lock(&recorder.thread_inits), 0);

        sink(&recorder, &[CallbackKind::ThreadInit]).thread_init();
        assert_eq!(*lock(&recorder.thread_inits), 1);
    }
}
