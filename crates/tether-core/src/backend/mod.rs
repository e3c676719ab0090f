//! Audio backend: the engine state machine
//!
//! [`AudioBackend`] owns the [`Connection`] and the [`PortEngine`], negotiates
//! parameters, drives the start/stop lifecycle and runs the host's process
//! callback on the server's realtime thread.
//!
//! ```text
//!   Stopped ──start──► Starting ──► Running ◄──freewheel──► Freewheeling
//!      ▲                  │            │ ▲
//!      │   failure        │      pause │ │ start
//!      ├──────────────────┘            ▼ │
//!      └──────stop / shutdown ──── Paused
//! ```
//!
//! Control operations are serialised by one mutex and are refused on the
//! process thread. The process thread itself only touches atomics, the live
//! port snapshot and a `try_lock` on the host callback.

mod events;
mod process;
mod state;

#[cfg(test)]
mod tests;

pub use events::EngineEvent;
pub use state::{AudioParameters, EngineState, MidiSendKind, ProcessCallback};

use std::process::Command;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use anyhow::{Context, Result};
use crossbeam::channel::Sender;

use crate::config::BackendConfig;
use crate::connection::{Connection, ListenerId};
use crate::error::{BackendError, BackendResult, ConfigError, ConnectionError, ServerError};
use crate::jackd::{self, DriverKind, MidiOption};
use crate::port_engine::{Cycle, CycleResult, PortEngine};
use crate::rt;
use crate::server::{AudioServer, CallbackKind, ServerClient};
use crate::sync::lock;
use crate::types::{DataType, Frames, SampleFormat, TransportState, MAX_BUFFER_SIZE};

use events::{EventBridge, EventHub, ServerEvent};
use process::RtProcess;
use state::EngineShared;

/// Overrides the device control application
pub const CONTROL_APP_ENV: &str = "TETHER_DEVICE_CONTROL_APP";

const SAMPLE_RATES: [u32; 10] = [
    8000, 16000, 24000, 32000, 44100, 48000, 88200, 96000, 192000, 384000,
];

const BUFFER_SIZES: [Frames; 11] = [8, 16, 32, 64, 128, 256, 512, 1024, 2048, 4096, 8192];

const MAX_CHANNELS: u32 = 128;

/// Reason reported when the host callback returns [`CycleResult::Fatal`]
const PROCESS_FAILED: &str = "process callback failed";

pub struct AudioBackend {
    connection: Arc<Connection>,
    ports: Arc<PortEngine>,
    shared: Arc<EngineShared>,
    config: Mutex<BackendConfig>,
    /// Serialises start/stop/pause/freewheel/reconnect and teardown
    control: Mutex<()>,
    events: Sender<ServerEvent>,
    hub: EventHub,
    last_error: Mutex<Option<BackendError>>,
    process_threads: Mutex<Vec<JoinHandle<()>>>,
    /// MIDI send flags saved on entering freewheel
    saved_midi_send: Mutex<Option<[bool; 3]>>,
    disconnect_listener: ListenerId,
}

impl AudioBackend {
    /// Create a stopped backend for `server`
    ///
    /// Spawns the `tether-events` dispatcher; nothing talks to the server
    /// until [`start`](Self::start).
    pub fn new(server: Arc<dyn AudioServer>, config: BackendConfig) -> BackendResult<Arc<Self>> {
        let connection = Arc::new(Connection::new(
            server,
            config.client_name.clone(),
            config.session_id.clone(),
        ));
        let ports = Arc::new(PortEngine::new(connection.clone()));
        let shared = EngineShared::new();
        let (tx, rx) = crossbeam::channel::unbounded();

        // Runs on the server's shutdown thread: atomics and a send, no locks
        let disconnect_listener = {
            let shared = shared.clone();
            let tx = tx.clone();
            connection.on_disconnect(Box::new(move |reason: &str| {
                let previous = shared.set_state(EngineState::Stopped);
                shared.zero();
                let _ = tx.send(ServerEvent::Shutdown {
                    reason: reason.to_string(),
                    was_running: matches!(
                        previous,
                        EngineState::Running | EngineState::Freewheeling | EngineState::Paused
                    ),
                });
            }))
        };

        let backend = Arc::new(Self {
            connection,
            ports,
            shared,
            config: Mutex::new(config),
            control: Mutex::new(()),
            events: tx,
            hub: EventHub::default(),
            last_error: Mutex::new(None),
            process_threads: Mutex::new(Vec::new()),
            saved_midi_send: Mutex::new(None),
            disconnect_listener,
        });

        let weak = Arc::downgrade(&backend);
        thread::Builder::new()
            .name("tether-events".to_string())
            .spawn(move || events::dispatch_loop(weak, rx))
            .map_err(|e| BackendError::Thread(format!("cannot spawn event dispatcher: {}", e)))?;

        log::info!(
            "[ENGINE] backend '{}' created for {} server",
            backend.connection.requested_name(),
            backend.connection.server().name()
        );
        Ok(backend)
    }

    pub fn connection(&self) -> &Arc<Connection> {
        &self.connection
    }

    pub fn port_engine(&self) -> &Arc<PortEngine> {
        &self.ports
    }

    /// Receive engine notifications from now on
    pub fn subscribe(&self) -> flume::Receiver<EngineEvent> {
        self.hub.subscribe()
    }

    fn notify(&self, event: EngineEvent) {
        let _ = self.events.send(ServerEvent::Notify(event));
    }

    fn client(&self) -> BackendResult<Arc<dyn ServerClient>> {
        self.connection
            .client()
            .ok_or(BackendError::Connection(ConnectionError::NotConnected))
    }

    fn refuse_on_process_thread() -> BackendResult<()> {
        if rt::is_process_thread() {
            return Err(ConnectionError::RealtimeThread.into());
        }
        Ok(())
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Process callback
    // ─────────────────────────────────────────────────────────────────────────

    /// Install the host's per-cycle callback
    ///
    /// Blocks while a cycle is running the previous callback.
    pub fn set_process_callback<F>(&self, callback: F)
    where
        F: FnMut(&mut Cycle) -> CycleResult + Send + 'static,
    {
        *lock(&self.shared.host) = Some(Box::new(callback));
    }

    pub fn clear_process_callback(&self) {
        lock(&self.shared.host).take();
    }

    // ─────────────────────────────────────────────────────────────────────────
    // State machine
    // ─────────────────────────────────────────────────────────────────────────

    pub fn state(&self) -> EngineState {
        self.shared.state()
    }

    pub fn connected(&self) -> bool {
        self.connection.connected()
    }

    /// Error of the last failed `start` or `reconnect`
    pub fn last_error(&self) -> Option<BackendError> {
        lock(&self.last_error).clone()
    }

    /// Connect, register callbacks, activate. Resumes a paused engine.
    pub fn start(&self) -> BackendResult<()> {
        Self::refuse_on_process_thread()?;
        let _control = lock(&self.control);
        match self.shared.state() {
            EngineState::Running | EngineState::Freewheeling | EngineState::Starting => {
                return Ok(())
            }
            EngineState::Paused => return self.record(self.resume()),
            EngineState::Stopped => {}
        }

        self.shared.set_state(EngineState::Starting);
        let result = self.start_sequence();
        if let Err(e) = &result {
            log::error!("[ENGINE] start failed: {}", e);
            self.teardown();
        }
        self.record(result)
    }

    fn record(&self, result: BackendResult<()>) -> BackendResult<()> {
        *lock(&self.last_error) = result.as_ref().err().cloned();
        result
    }

    fn start_sequence(&self) -> BackendResult<()> {
        let config = self.config();
        if config.start_server && !self.connection.server_running() {
            write_server_command(&config);
        }
        self.connection.open()?;
        let client = self.client()?;

        // Rate first: latencies and raw sizes are computed against it
        let rate = client.sample_rate();
        self.shared.sample_rate.store(rate, Ordering::Release);
        self.notify(EngineEvent::SampleRateChanged(rate));
        if !client.capabilities().reliable_buffer_size_callback {
            events::apply_buffer_size(&self.shared, &self.ports, &self.events, client.buffer_size());
        }

        self.ports.reestablish()?;

        for kind in CallbackKind::ALL {
            match client.enable_callback(kind) {
                Ok(()) => {}
                Err(ServerError::Unsupported(what)) if kind.is_optional() => {
                    log::debug!("[ENGINE] server lacks {}, skipping", what);
                }
                Err(e) => return Err(e.into()),
            }
        }
        client.set_event_handler(Arc::new(EventBridge::new(
            self.shared.clone(),
            Arc::downgrade(&self.ports),
            self.events.clone(),
        )));

        self.shared.stop_requested.store(false, Ordering::Release);
        client
            .activate(Box::new(RtProcess::new(self.shared.clone(), self.ports.live())))
            .map_err(|e| BackendError::ActivationFailed(e.to_string()))?;
        if self.shared.buffer_size.load(Ordering::Acquire) == 0 {
            events::apply_buffer_size(&self.shared, &self.ports, &self.events, client.buffer_size());
        }

        if !self
            .shared
            .transition(EngineState::Starting, EngineState::Running)
        {
            return Err(ConnectionError::ServerUnreachable(
                "server shut down during start".to_string(),
            )
            .into());
        }
        self.ports.reconnect_ports();

        log::info!(
            "[ENGINE] running as '{}': {} Hz, {} frames",
            self.connection.client_name(),
            self.frame_rate(),
            self.frames_per_cycle()
        );
        self.notify(EngineEvent::Running);
        Ok(())
    }

    fn resume(&self) -> BackendResult<()> {
        let client = self.client()?;
        self.shared.stop_requested.store(false, Ordering::Release);
        client
            .activate(Box::new(RtProcess::new(self.shared.clone(), self.ports.live())))
            .map_err(|e| BackendError::ActivationFailed(e.to_string()))?;
        if !self.shared.transition(EngineState::Paused, EngineState::Running) {
            return Err(BackendError::NotRunning);
        }
        log::info!("[ENGINE] resumed");
        self.notify(EngineEvent::Running);
        Ok(())
    }

    /// Close the connection and forget every live value. Control lock held.
    fn teardown(&self) -> EngineState {
        let previous = self.shared.set_state(EngineState::Stopped);
        if let Err(e) = self.connection.close() {
            log::warn!("[ENGINE] close failed: {}", e);
        }
        self.ports.detach();
        self.shared.zero();
        if let Some(saved) = lock(&self.saved_midi_send).take() {
            self.restore_midi_send(saved);
        }
        previous
    }

    /// Stop processing and disconnect from the server
    ///
    /// Idempotent, and safe after a partial start. Never reports `Halted`.
    pub fn stop(&self) -> BackendResult<()> {
        Self::refuse_on_process_thread()?;
        let _control = lock(&self.control);
        let previous = self.teardown();
        self.shared.stop_requested.store(false, Ordering::Release);
        if previous != EngineState::Stopped {
            log::info!("[ENGINE] stopped");
            self.notify(EngineEvent::Stopped);
        }
        Ok(())
    }

    /// Deactivate without closing; `start` resumes
    pub fn pause(&self) -> BackendResult<()> {
        Self::refuse_on_process_thread()?;
        let _control = lock(&self.control);
        let previous = self.shared.state();
        match previous {
            EngineState::Running | EngineState::Freewheeling => {}
            EngineState::Paused => return Ok(()),
            _ => return Err(BackendError::NotRunning),
        }
        let client = self.client()?;
        self.shared.set_state(EngineState::Paused);
        if let Err(e) = client.deactivate() {
            self.shared.set_state(previous);
            return Err(e.into());
        }
        log::info!("[ENGINE] paused");
        Ok(())
    }

    /// Run cycles as fast as possible (offline export)
    ///
    /// MIDI sync output is silenced while freewheeling and restored after.
    pub fn freewheel(&self, onoff: bool) -> BackendResult<()> {
        Self::refuse_on_process_thread()?;
        let _control = lock(&self.control);
        let state = self.shared.state();
        if onoff == (state == EngineState::Freewheeling) {
            return Ok(());
        }
        if !state.is_processing() {
            return Err(BackendError::NotRunning);
        }
        let client = self.client()?;

        if onoff {
            let saved = MidiSendKind::ALL.map(|kind| self.shared.midi_send_enabled(kind));
            *lock(&self.saved_midi_send) = Some(saved);
            for kind in MidiSendKind::ALL {
                self.shared.set_midi_send_enabled(kind, false);
            }
        }
        if let Err(e) = client.set_freewheel(onoff) {
            if onoff {
                if let Some(saved) = lock(&self.saved_midi_send).take() {
                    self.restore_midi_send(saved);
                }
            }
            return Err(e.into());
        }
        if !onoff {
            if let Some(saved) = lock(&self.saved_midi_send).take() {
                self.restore_midi_send(saved);
            }
        }
        self.shared.set_state(if onoff {
            EngineState::Freewheeling
        } else {
            EngineState::Running
        });
        log::info!("[ENGINE] freewheel {}", if onoff { "on" } else { "off" });
        Ok(())
    }

    fn restore_midi_send(&self, saved: [bool; 3]) {
        for (kind, enabled) in MidiSendKind::ALL.into_iter().zip(saved) {
            self.shared.set_midi_send_enabled(kind, enabled);
        }
    }

    /// Drop the client and connect again, restoring every port
    ///
    /// If any port cannot be re-registered, no port survives.
    pub fn reconnect(&self) -> BackendResult<()> {
        Self::refuse_on_process_thread()?;
        let _control = lock(&self.control);
        let previous = self.teardown();
        log::info!("[ENGINE] reconnecting");

        self.shared.set_state(EngineState::Starting);
        let result = self.start_sequence();
        if let Err(e) = &result {
            log::error!("[ENGINE] reconnect failed: {}", e);
            self.teardown();
            self.ports.drop_all();
            if previous != EngineState::Stopped {
                self.notify(EngineEvent::Stopped);
            }
        }
        self.record(result)
    }

    /// Work the dispatcher does for queued server events
    fn handle_server_event(&self, event: ServerEvent) {
        match event {
            ServerEvent::Notify(event) => self.hub.emit(event),
            ServerEvent::PortConnect { a, b, connected } => {
                let ours = |name: &str| {
                    if self.ports.port_is_mine(name) {
                        self.ports.get_port_by_name(name)
                    } else {
                        None
                    }
                };
                self.hub.emit(EngineEvent::PortConnection {
                    port_a: ours(&a),
                    name_a: a,
                    port_b: ours(&b),
                    name_b: b,
                    connected,
                });
            }
            ServerEvent::Shutdown {
                reason,
                was_running,
            } => {
                let _control = lock(&self.control);
                // A start after the shutdown may already have a new client
                if !self.connection.connected() {
                    if let Err(e) = self.connection.close() {
                        log::warn!("[ENGINE] close after shutdown failed: {}", e);
                    }
                    self.ports.detach();
                }
                if was_running {
                    log::error!("[ENGINE] halted: {}", reason);
                    self.hub.emit(EngineEvent::Halted(reason));
                }
            }
            ServerEvent::Terminate => {}
        }
    }

    /// Carry out a stop the process thread asked for
    fn run_deferred_stop(&self) {
        if !self.shared.stop_requested.load(Ordering::Acquire) {
            return;
        }
        let _control = lock(&self.control);
        if !self.shared.stop_requested.swap(false, Ordering::AcqRel) {
            return;
        }
        if self.teardown() == EngineState::Stopped {
            return;
        }
        log::error!("[ENGINE] halted: {}", PROCESS_FAILED);
        self.hub.emit(EngineEvent::Halted(PROCESS_FAILED.to_string()));
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Parameters
    // ─────────────────────────────────────────────────────────────────────────

    /// Target parameters
    pub fn config(&self) -> BackendConfig {
        lock(&self.config).clone()
    }

    fn update_config(&self, apply: impl FnOnce(&mut BackendConfig)) {
        apply(&mut lock(&self.config));
    }

    pub fn set_device_name(&self, device: &str) -> BackendResult<()> {
        if self.connected() && self.config().device != device {
            return Err(ConfigError::RestartRequired("device").into());
        }
        self.update_config(|c| c.device = device.to_string());
        Ok(())
    }

    pub fn set_driver(&self, driver: DriverKind) -> BackendResult<()> {
        if !DriverKind::available().contains(&driver) {
            return Err(ConfigError::Unsupported {
                what: "driver",
                value: driver.to_string(),
            }
            .into());
        }
        if self.connected() && self.config().driver != driver {
            return Err(ConfigError::RestartRequired("driver").into());
        }
        self.update_config(|c| c.driver = driver);
        Ok(())
    }

    /// Accepted live only if it matches the server or the server can switch
    pub fn set_sample_rate(&self, rate: u32) -> BackendResult<()> {
        if rate == 0 {
            return Err(ConfigError::Unsupported {
                what: "sample rate",
                value: rate.to_string(),
            }
            .into());
        }
        if let Some(client) = self.connection.client() {
            if client.sample_rate() != rate {
                if !client.capabilities().live_sample_rate_change {
                    return Err(ConfigError::RestartRequired("sample rate").into());
                }
                client.set_sample_rate(rate)?;
            }
        }
        self.update_config(|c| c.sample_rate = rate);
        Ok(())
    }

    /// Forwarded to the server while connected; it renegotiates
    pub fn set_buffer_size(&self, nframes: Frames) -> BackendResult<()> {
        if nframes == 0 || nframes > MAX_BUFFER_SIZE {
            return Err(ConfigError::Unsupported {
                what: "buffer size",
                value: nframes.to_string(),
            }
            .into());
        }
        if let Some(client) = self.connection.client() {
            if client.buffer_size() != nframes {
                client.set_buffer_size(nframes).map_err(|e| match e {
                    ServerError::Unsupported(_) => {
                        BackendError::from(ConfigError::RestartRequired("buffer size"))
                    }
                    other => BackendError::from(other),
                })?;
            }
        }
        self.update_config(|c| c.buffer_size = nframes);
        Ok(())
    }

    /// Number of periods per buffer
    pub fn set_period_size(&self, periods: u32) -> BackendResult<()> {
        if self.connected() && self.config().periods != periods {
            return Err(ConfigError::RestartRequired("period count").into());
        }
        self.update_config(|c| c.periods = periods);
        Ok(())
    }

    /// Only 32-bit float is supported
    pub fn set_sample_format(&self, format: SampleFormat) -> BackendResult<()> {
        if format != SampleFormat::Float32 {
            return Err(ConfigError::Unsupported {
                what: "sample format",
                value: format!("{:?}", format),
            }
            .into());
        }
        Ok(())
    }

    /// Server ports are always non-interleaved
    pub fn set_interleaved(&self, interleaved: bool) -> BackendResult<()> {
        if interleaved {
            return Err(ConfigError::Unsupported {
                what: "interleaved",
                value: "true".to_string(),
            }
            .into());
        }
        Ok(())
    }

    pub fn set_input_channels(&self, count: u32) -> BackendResult<()> {
        if self.connected() && count != 0 {
            return Err(ConfigError::RestartRequired("input channels").into());
        }
        self.update_config(|c| c.input_channels = count);
        Ok(())
    }

    pub fn set_output_channels(&self, count: u32) -> BackendResult<()> {
        if self.connected() && count != 0 {
            return Err(ConfigError::RestartRequired("output channels").into());
        }
        self.update_config(|c| c.output_channels = count);
        Ok(())
    }

    pub fn set_systemic_input_latency(&self, frames: Frames) -> BackendResult<()> {
        if self.connected() {
            return Err(ConfigError::RestartRequired("systemic input latency").into());
        }
        self.update_config(|c| c.systemic_input_latency = frames);
        Ok(())
    }

    pub fn set_systemic_output_latency(&self, frames: Frames) -> BackendResult<()> {
        if self.connected() {
            return Err(ConfigError::RestartRequired("systemic output latency").into());
        }
        self.update_config(|c| c.systemic_output_latency = frames);
        Ok(())
    }

    /// Pretty name from [`enumerate_midi_options`](Self::enumerate_midi_options)
    pub fn set_midi_option(&self, option: &str) -> BackendResult<()> {
        MidiOption::driver_for(option)?;
        if self.connected() && self.config().midi_option != option {
            return Err(ConfigError::RestartRequired("MIDI option").into());
        }
        self.update_config(|c| c.midi_option = option.to_string());
        Ok(())
    }

    pub fn sample_format(&self) -> SampleFormat {
        SampleFormat::Float32
    }

    pub fn interleaved(&self) -> bool {
        false
    }

    /// Live values while the engine runs, targets otherwise
    pub fn parameters(&self) -> AudioParameters {
        let config = self.config();
        let live = self.connected() && self.state() != EngineState::Stopped;
        let (sample_rate, buffer_size, input_channels, output_channels) = if live {
            (
                self.frame_rate(),
                self.frames_per_cycle(),
                self.ports.n_physical_outputs().audio,
                self.ports.n_physical_inputs().audio,
            )
        } else {
            (
                config.sample_rate,
                config.buffer_size,
                config.input_channels,
                config.output_channels,
            )
        };
        AudioParameters {
            driver: config.driver.pretty_name().to_string(),
            device: config.device,
            sample_rate,
            buffer_size,
            periods: config.periods,
            input_channels,
            output_channels,
            systemic_input_latency: config.systemic_input_latency,
            systemic_output_latency: config.systemic_output_latency,
            sample_format: SampleFormat::Float32,
            interleaved: false,
            midi_option: config.midi_option,
            live,
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Live values
    // ─────────────────────────────────────────────────────────────────────────

    /// Current sample rate; 0 when stopped
    pub fn frame_rate(&self) -> u32 {
        self.shared.sample_rate.load(Ordering::Acquire)
    }

    /// Current cycle size; 0 when stopped
    pub fn frames_per_cycle(&self) -> Frames {
        self.shared.buffer_size.load(Ordering::Acquire)
    }

    pub fn buffer_size(&self) -> Frames {
        self.frames_per_cycle()
    }

    /// Bytes per port buffer of `data_type`; 0 when stopped
    pub fn raw_buffer_size(&self, data_type: DataType) -> usize {
        self.shared.raw_buffer_size(data_type)
    }

    pub fn is_realtime(&self) -> bool {
        self.connection
            .client()
            .map_or(false, |c| c.is_realtime())
    }

    /// Server DSP load in percent
    pub fn dsp_load(&self) -> f32 {
        self.connection.client().map_or(0.0, |c| c.cpu_load())
    }

    /// Server frame clock
    pub fn sample_time(&self) -> u64 {
        self.connection.client().map_or(0, |c| c.frame_time())
    }

    pub fn sample_time_at_cycle_start(&self) -> u64 {
        self.connection.client().map_or(0, |c| c.last_frame_time())
    }

    pub fn samples_since_cycle_start(&self) -> Frames {
        self.connection
            .client()
            .map_or(0, |c| c.frames_since_cycle_start())
    }

    pub fn xrun_count(&self) -> u64 {
        self.shared.xruns.load(Ordering::Acquire)
    }

    pub fn midi_send_enabled(&self, kind: MidiSendKind) -> bool {
        self.shared.midi_send_enabled(kind)
    }

    /// While freewheeling the change applies once freewheel ends
    pub fn set_midi_send_enabled(&self, kind: MidiSendKind, enabled: bool) {
        let mut saved = lock(&self.saved_midi_send);
        match saved.as_mut() {
            Some(flags) => flags[kind.index()] = enabled,
            None => self.shared.set_midi_send_enabled(kind, enabled),
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Transport
    // ─────────────────────────────────────────────────────────────────────────

    pub fn transport_start(&self) {
        if let Some(client) = self.connection.client() {
            client.transport_start();
        }
    }

    pub fn transport_stop(&self) {
        if let Some(client) = self.connection.client() {
            client.transport_stop();
        }
    }

    pub fn transport_locate(&self, frame: u64) {
        if let Some(client) = self.connection.client() {
            client.transport_locate(frame);
        }
    }

    pub fn transport_state(&self) -> TransportState {
        self.connection
            .client()
            .map_or(TransportState::Stopped, |c| c.transport_query().state)
    }

    pub fn transport_frame(&self) -> u64 {
        self.connection
            .client()
            .map_or(0, |c| c.transport_query().frame)
    }

    /// Become (or stop being) the transport's timebase master
    pub fn set_time_master(&self, enabled: bool) -> BackendResult<()> {
        self.client()?.set_timebase_master(enabled)?;
        Ok(())
    }

    /// (speed, frame, starting)
    pub fn speed_and_position(&self) -> (f64, u64, bool) {
        let Some(client) = self.connection.client() else {
            return (0.0, 0, false);
        };
        let position = client.transport_query();
        let speed = match position.state {
            TransportState::Rolling | TransportState::Looping => 1.0,
            _ => 0.0,
        };
        (
            speed,
            position.frame,
            position.state == TransportState::Starting,
        )
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Process threads
    // ─────────────────────────────────────────────────────────────────────────

    /// Spawn an extra thread scheduled like the process thread
    pub fn create_process_thread<F>(&self, f: F) -> BackendResult<()>
    where
        F: FnOnce() + Send + 'static,
    {
        let stack_size = self.config().process_thread_stack_size;
        let index = lock(&self.process_threads).len();
        let handle = self.connection.spawn_realtime(
            &format!("tether-process-{}", index),
            stack_size,
            move || {
                rt::mark_process_thread();
                f()
            },
        )?;
        lock(&self.process_threads).push(handle);
        Ok(())
    }

    /// Wait for every thread from `create_process_thread`
    pub fn join_process_threads(&self) -> BackendResult<()> {
        let handles: Vec<_> = lock(&self.process_threads).drain(..).collect();
        let failed = handles
            .into_iter()
            .map(JoinHandle::join)
            .filter(Result::is_err)
            .count();
        if failed > 0 {
            log::error!("[ENGINE] {} process threads panicked", failed);
            return Err(BackendError::Thread(format!(
                "{} process threads panicked",
                failed
            )));
        }
        Ok(())
    }

    /// True on the server's process thread and on our process threads
    pub fn in_process_thread(&self) -> bool {
        rt::is_process_thread()
    }

    pub fn process_thread_count(&self) -> usize {
        lock(&self.process_threads).len()
    }

    pub fn client_real_time_priority(&self) -> Option<i32> {
        self.connection.client()?.realtime_priority()
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Enumeration
    // ─────────────────────────────────────────────────────────────────────────

    pub fn enumerate_drivers(&self) -> Vec<DriverKind> {
        DriverKind::available()
    }

    /// Display names of the devices the configured driver can open
    pub fn enumerate_devices(&self) -> Vec<String> {
        self.config()
            .driver
            .devices()
            .into_iter()
            .map(|(name, _)| name)
            .collect()
    }

    /// Only the live rate while running on `device`
    pub fn available_sample_rates(&self, device: &str) -> Vec<u32> {
        if self.connected() && self.config().device == device && self.frame_rate() != 0 {
            return vec![self.frame_rate()];
        }
        SAMPLE_RATES.to_vec()
    }

    /// Only the live size while running on `device`
    pub fn available_buffer_sizes(&self, device: &str) -> Vec<Frames> {
        if self.connected() && self.config().device == device && self.frames_per_cycle() != 0 {
            return vec![self.frames_per_cycle()];
        }
        BUFFER_SIZES.to_vec()
    }

    pub fn available_period_sizes(&self, driver: DriverKind) -> Vec<u32> {
        if driver.supports_setting_period_count() {
            vec![2, 3]
        } else {
            Vec::new()
        }
    }

    pub fn available_input_channel_count(&self, _device: &str) -> u32 {
        MAX_CHANNELS
    }

    pub fn available_output_channel_count(&self, _device: &str) -> u32 {
        MAX_CHANNELS
    }

    pub fn enumerate_midi_options(&self) -> Vec<&'static str> {
        MidiOption::names()
    }

    pub fn can_change_sample_rate_when_running(&self) -> bool {
        self.connection
            .client()
            .map_or(false, |c| c.capabilities().live_sample_rate_change)
    }

    pub fn can_change_buffer_size_when_running(&self) -> bool {
        self.connection
            .client()
            .map_or(false, |c| c.capabilities().live_buffer_size_change)
    }

    /// Vendor mixer application for the configured device, if any
    pub fn control_app_name(&self) -> Option<String> {
        if let Ok(app) = std::env::var(CONTROL_APP_ENV) {
            if !app.is_empty() {
                return Some(app);
            }
        }
        let config = self.config();
        control_app_for(config.driver, &config.device).map(str::to_string)
    }

    /// Start the device control application detached
    pub fn launch_control_app(&self) -> Result<()> {
        let app = self
            .control_app_name()
            .context("No control application for this device")?;
        Command::new(&app)
            .spawn()
            .with_context(|| format!("Cannot launch {}", app))?;
        log::info!("[ENGINE] launched control app {}", app);
        Ok(())
    }
}

impl Drop for AudioBackend {
    fn drop(&mut self) {
        self.connection
            .remove_disconnect_listener(self.disconnect_listener);
        if let Err(e) = self.stop() {
            log::error!("[ENGINE] stop on drop failed: {}", e);
        }
        let _ = self.events.send(ServerEvent::Terminate);
    }
}

fn control_app_for(driver: DriverKind, device: &str) -> Option<&'static str> {
    if driver != DriverKind::Alsa {
        return None;
    }
    if device.contains("Hammerfall DSP") {
        Some("hdspconf")
    } else if device.contains("M Audio Delta 1010") || device.contains("M2496") {
        Some("mudita24")
    } else {
        None
    }
}

/// Leave a jackd command line for libjack's autostart
fn write_server_command(config: &BackendConfig) {
    let Some(path) = jackd::jackdrc_path() else {
        log::warn!("[ENGINE] no home directory, cannot write server command line");
        return;
    };
    match config.command_line_options().to_command_line() {
        Ok(command_line) => {
            if let Err(e) = jackd::write_jackdrc(&path, &command_line) {
                log::warn!("[ENGINE] {:#}", e);
            }
        }
        Err(e) => log::warn!("[ENGINE] {}", e),
    }
}
