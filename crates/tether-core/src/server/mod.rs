//! Boundary with the external realtime audio server
//!
//! Everything server-specific sits behind the traits in this module. The rest
//! of the crate only ever talks to a [`ServerClient`] and the [`ServerPort`]s
//! it hands out.
//!
//! # Threads
//!
//! ```text
//! ┌──────────────────┐  register/connect   ┌─────────────────────┐
//! │  Control Thread  │────────────────────►│    ServerClient     │
//! └──────────────────┘                     └──────────┬──────────┘
//!                                                     │
//!                      ┌──────────────────────────────┼────────────────┐
//!                      ▼                              ▼                │
//!           ┌─────────────────────┐        ┌─────────────────────┐     │
//!           │ Notification Thread │        │  Realtime Thread    │     │
//!           │  (ServerEvents)     │        │  (ProcessHandler)   │     │
//!           └─────────────────────┘        └─────────────────────┘     │
//!                                                     ▲                │
//!                                    spawn_realtime() └────────────────┘
//! ```
//!
//! Implementations:
//! - [`dummy::DummyServer`]: an in-process server with a simulated device
//! - `jack::JackServer`: the JACK binding (`jack-backend` feature, Linux only)

pub mod dummy;
#[cfg(all(target_os = "linux", feature = "jack-backend"))]
pub mod jack;

use std::ptr::NonNull;
use std::sync::Arc;
use std::thread::JoinHandle;

use crate::error::ServerResult;
use crate::midi::MidiCodec;
use crate::types::{DataType, Frames, LatencyMode, LatencyRange, PortFlags, TransportPosition};

/// Called with a human-readable reason when the server drops the client
pub type ShutdownHook = Arc<dyn Fn(&str) + Send + Sync>;

/// Work to run on a spawned realtime thread
pub type RealtimeTask = Box<dyn FnOnce() + Send + 'static>;

/// Opens client sessions on a particular server
pub trait AudioServer: Send + Sync {
    /// Short server name ("JACK", "Dummy")
    fn name(&self) -> &str;

    /// True if a server is currently reachable without starting one
    fn is_running(&self) -> bool;

    /// Open a client. `on_shutdown` must be wired before this returns so a
    /// shutdown can never be missed.
    fn open(
        &self,
        client_name: &str,
        session_id: Option<&str>,
        on_shutdown: ShutdownHook,
    ) -> ServerResult<Arc<dyn ServerClient>>;
}

/// Optional server primitives
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServerCapabilities {
    /// Buffer-size callback fires reliably on activation
    pub reliable_buffer_size_callback: bool,
    /// `port_type_buffer_size` is answered
    pub port_type_buffer_size: bool,
    /// Sample rate may be changed without restarting the client
    pub live_sample_rate_change: bool,
    /// Buffer size may be changed without restarting the client
    pub live_buffer_size_change: bool,
    pub latency_callback: bool,
    pub session_callback: bool,
}

/// Notification classes a client can register for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallbackKind {
    ThreadInit,
    SampleRate,
    BufferSize,
    GraphOrder,
    PortRegistration,
    PortConnect,
    Xrun,
    Sync,
    Freewheel,
    Latency,
    Session,
}

impl CallbackKind {
    /// Registration order used by the backend before activation
    pub const ALL: [CallbackKind; 11] = [
        CallbackKind::ThreadInit,
        CallbackKind::SampleRate,
        CallbackKind::BufferSize,
        CallbackKind::GraphOrder,
        CallbackKind::PortRegistration,
        CallbackKind::PortConnect,
        CallbackKind::Xrun,
        CallbackKind::Sync,
        CallbackKind::Freewheel,
        CallbackKind::Latency,
        CallbackKind::Session,
    ];

    /// Whether a server lacking this callback is still usable
    pub fn is_optional(&self) -> bool {
        matches!(self, CallbackKind::Latency | CallbackKind::Session)
    }
}

/// Live description of a port anywhere in the server graph
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortInfo {
    pub name: String,
    pub data_type: DataType,
    pub flags: PortFlags,
}

/// Outcome of one process cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessStatus {
    Continue,
    /// Stop calling this client; the backend tears down on its control side
    Quit,
}

/// Raw per-cycle port buffer handed out by the server
///
/// Valid only inside the process callback of the cycle it was obtained in.
#[derive(Debug, Clone, Copy)]
pub struct RawBuffer {
    pub ptr: NonNull<u8>,
    pub len: usize,
}

/// Realtime-side handle to a registered port
pub trait ServerPort: Send + Sync {
    /// Full server name (`client:port`)
    fn name(&self) -> String;

    fn data_type(&self) -> DataType;

    fn flags(&self) -> PortFlags;

    /// Buffer for the current cycle. RT-safe: no allocation, no blocking.
    fn buffer(&self, nframes: Frames) -> Option<RawBuffer>;

    /// Layout of this server's MIDI buffers
    fn midi_codec(&self) -> &'static dyn MidiCodec;

    fn set_latency_range(&self, mode: LatencyMode, range: LatencyRange);

    fn latency_range(&self, mode: LatencyMode) -> LatencyRange;
}

/// Notifications delivered on the server's non-realtime threads
pub trait ServerEvents: Send + Sync {
    fn thread_init(&self) {}
    fn sample_rate_changed(&self, rate: u32);
    fn buffer_size_changed(&self, nframes: Frames);
    fn graph_reordered(&self);
    fn port_registration(&self, name: &str, registered: bool);
    fn ports_connected(&self, a: &str, b: &str, connected: bool);
    fn xrun(&self);
    /// Returns true when ready to roll
    fn sync(&self, position: TransportPosition) -> bool;
    fn freewheel(&self, enabled: bool);
    fn latency(&self, mode: LatencyMode);
}

/// Per-cycle callback run on the server's realtime thread
pub trait ProcessHandler: Send {
    fn process(&mut self, nframes: Frames) -> ProcessStatus;
}

/// An open client session
pub trait ServerClient: Send + Sync {
    /// Name assigned by the server (may differ from the requested name)
    fn name(&self) -> String;

    fn sample_rate(&self) -> u32;

    fn buffer_size(&self) -> Frames;

    fn capabilities(&self) -> ServerCapabilities;

    fn set_buffer_size(&self, nframes: Frames) -> ServerResult<()>;

    fn set_sample_rate(&self, rate: u32) -> ServerResult<()>;

    /// Bytes per port buffer for `data_type`, if the server reports it
    fn port_type_buffer_size(&self, data_type: DataType) -> Option<usize>;

    fn is_realtime(&self) -> bool;

    fn realtime_priority(&self) -> Option<i32>;

    fn register_port(
        &self,
        short_name: &str,
        data_type: DataType,
        flags: PortFlags,
    ) -> ServerResult<Arc<dyn ServerPort>>;

    fn unregister_port(&self, port: &dyn ServerPort) -> ServerResult<()>;

    fn port_by_name(&self, name: &str) -> Option<PortInfo>;

    /// Port names matching an optional regex, data type and required flags
    fn ports(&self, pattern: Option<&str>, data_type: Option<DataType>, flags: PortFlags)
        -> Vec<String>;

    fn connect(&self, source: &str, destination: &str) -> ServerResult<()>;

    fn disconnect(&self, source: &str, destination: &str) -> ServerResult<()>;

    fn connections(&self, port_name: &str) -> Vec<String>;

    fn recompute_latencies(&self);

    /// Register interest in one notification class. Must be called before
    /// `activate`.
    fn enable_callback(&self, kind: CallbackKind) -> ServerResult<()>;

    fn set_event_handler(&self, events: Arc<dyn ServerEvents>);

    fn activate(&self, process: Box<dyn ProcessHandler>) -> ServerResult<()>;

    fn deactivate(&self) -> ServerResult<()>;

    fn set_freewheel(&self, enabled: bool) -> ServerResult<()>;

    fn transport_start(&self);

    fn transport_stop(&self);

    fn transport_locate(&self, frame: u64);

    fn transport_query(&self) -> TransportPosition;

    fn set_timebase_master(&self, enabled: bool) -> ServerResult<()>;

    fn cpu_load(&self) -> f32;

    fn frame_time(&self) -> u64;

    fn last_frame_time(&self) -> u64;

    fn frames_since_cycle_start(&self) -> Frames;

    /// Spawn a thread with the same scheduling class as the process thread
    fn spawn_realtime(
        &self,
        name: &str,
        stack_size: usize,
        task: RealtimeTask,
    ) -> ServerResult<JoinHandle<()>>;

    /// Release the client. Implies deactivation.
    fn close(&self);
}
