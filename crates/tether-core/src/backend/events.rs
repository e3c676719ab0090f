//! Server notifications and the engine event stream
//!
//! Server callbacks arrive on whatever thread the server likes. The bridge
//! does the minimum there (atomics, buffer-size bookkeeping) and posts a
//! [`ServerEvent`] on a crossbeam channel. The `tether-events` thread drains
//! it, runs anything that needs the control lock (deferred stop, shutdown
//! teardown) and fans [`EngineEvent`]s out to subscribers.

use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use crossbeam::channel::{Receiver, RecvTimeoutError, Sender};

use super::state::{EngineShared, EngineState};
use super::AudioBackend;
use crate::port_engine::{PortEngine, PortHandle};
use crate::server::ServerEvents;
use crate::sync::lock;
use crate::types::{DataType, Frames, LatencyMode, Sample, TransportPosition, TransportState};

/// How often the dispatcher looks for a deferred stop when idle
const POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Notifications delivered to subscribers
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEvent {
    Running,
    Stopped,
    /// The engine stopped without being asked to
    Halted(String),
    Xrun,
    BufferSizeChange(Frames),
    SampleRateChanged(u32),
    GraphReordered,
    PortRegistration {
        name: String,
        registered: bool,
    },
    PortConnection {
        /// Our handle for `name_a`, if the port is ours
        port_a: Option<PortHandle>,
        name_a: String,
        port_b: Option<PortHandle>,
        name_b: String,
        connected: bool,
    },
    Freewheel(bool),
    LatencyUpdate {
        playback: bool,
    },
    TransportSync {
        state: TransportState,
        frame: u64,
    },
}

/// Work queued for the dispatcher
#[derive(Debug)]
pub(crate) enum ServerEvent {
    /// Forward as-is
    Notify(EngineEvent),
    PortConnect {
        a: String,
        b: String,
        connected: bool,
    },
    /// Server dropped the client
    Shutdown { reason: String, was_running: bool },
    /// Backend is gone
    Terminate,
}

/// Subscriber list
#[derive(Default)]
pub(crate) struct EventHub {
    subscribers: Mutex<Vec<flume::Sender<EngineEvent>>>,
}

impl EventHub {
    pub fn subscribe(&self) -> flume::Receiver<EngineEvent> {
        let (tx, rx) = flume::unbounded();
        lock(&self.subscribers).push(tx);
        rx
    }

    /// Deliver to every live subscriber, dropping closed ones
    pub fn emit(&self, event: EngineEvent) {
        lock(&self.subscribers).retain(|tx| tx.send(event.clone()).is_ok());
    }
}

/// Server-facing event handler
pub(crate) struct EventBridge {
    shared: Arc<EngineShared>,
    ports: Weak<PortEngine>,
    tx: Sender<ServerEvent>,
}

impl EventBridge {
    pub fn new(shared: Arc<EngineShared>, ports: Weak<PortEngine>, tx: Sender<ServerEvent>) -> Self {
        Self { shared, ports, tx }
    }

    fn post(&self, event: ServerEvent) {
        // Only fails once the dispatcher is gone, and then nobody listens
        let _ = self.tx.send(event);
    }
}

impl ServerEvents for EventBridge {
    fn thread_init(&self) {
        log::debug!("[ENGINE] server thread started");
    }

    fn sample_rate_changed(&self, rate: u32) {
        self.shared.sample_rate.store(rate, Ordering::Release);
        self.post(ServerEvent::Notify(EngineEvent::SampleRateChanged(rate)));
    }

    fn buffer_size_changed(&self, nframes: Frames) {
        if let Some(ports) = self.ports.upgrade() {
            apply_buffer_size(&self.shared, &ports, &self.tx, nframes);
        }
    }

    fn graph_reordered(&self) {
        self.post(ServerEvent::Notify(EngineEvent::GraphReordered));
    }

    fn port_registration(&self, name: &str, registered: bool) {
        self.post(ServerEvent::Notify(EngineEvent::PortRegistration {
            name: name.to_string(),
            registered,
        }));
    }

    fn ports_connected(&self, a: &str, b: &str, connected: bool) {
        self.post(ServerEvent::PortConnect {
            a: a.to_string(),
            b: b.to_string(),
            connected,
        });
    }

    fn xrun(&self) {
        self.shared.xruns.fetch_add(1, Ordering::AcqRel);
        self.post(ServerEvent::Notify(EngineEvent::Xrun));
    }

    fn sync(&self, position: TransportPosition) -> bool {
        self.post(ServerEvent::Notify(EngineEvent::TransportSync {
            state: position.state,
            frame: position.frame,
        }));
        true
    }

    fn freewheel(&self, enabled: bool) {
        if enabled {
            self.shared
                .transition(EngineState::Running, EngineState::Freewheeling);
        } else {
            self.shared
                .transition(EngineState::Freewheeling, EngineState::Running);
        }
        self.post(ServerEvent::Notify(EngineEvent::Freewheel(enabled)));
    }

    fn latency(&self, mode: LatencyMode) {
        self.post(ServerEvent::Notify(EngineEvent::LatencyUpdate {
            playback: mode == LatencyMode::Playback,
        }));
    }
}

/// Adopt a new cycle size
///
/// Raw sizes and latencies are updated before the size word itself, so the
/// process thread never sees the new size with stale buffers behind it.
pub(crate) fn apply_buffer_size(
    shared: &EngineShared,
    ports: &PortEngine,
    tx: &Sender<ServerEvent>,
    nframes: Frames,
) {
    if shared.buffer_size.load(Ordering::Acquire) == nframes {
        return;
    }
    let sample = std::mem::size_of::<Sample>();
    let fallback_audio = nframes as usize * sample;
    let fallback_midi = fallback_audio - nframes as usize / 2;
    let (audio, midi) = match ports.connection().client() {
        Some(client) => (
            client
                .port_type_buffer_size(DataType::Audio)
                .unwrap_or(fallback_audio),
            client
                .port_type_buffer_size(DataType::Midi)
                .unwrap_or(fallback_midi),
        ),
        None => (fallback_audio, fallback_midi),
    };
    shared.set_raw_buffer_sizes(audio, midi);
    ports.refresh_latencies();
    shared.buffer_size.store(nframes, Ordering::Release);
    log::info!("[ENGINE] buffer size now {} frames", nframes);
    let _ = tx.send(ServerEvent::Notify(EngineEvent::BufferSizeChange(nframes)));
}

/// Body of the `tether-events` thread
pub(crate) fn dispatch_loop(backend: Weak<AudioBackend>, rx: Receiver<ServerEvent>) {
    log::debug!("[ENGINE] event dispatcher started");
    loop {
        let event = match rx.recv_timeout(POLL_INTERVAL) {
            Ok(ServerEvent::Terminate) | Err(RecvTimeoutError::Disconnected) => break,
            Ok(event) => Some(event),
            Err(RecvTimeoutError::Timeout) => None,
        };
        let Some(backend) = backend.upgrade() else {
            break;
        };
        if let Some(event) = event {
            backend.handle_server_event(event);
        }
        backend.run_deferred_stop();
    }
    log::debug!("[ENGINE] event dispatcher exiting");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hub_drops_closed_subscribers() {
        let hub = EventHub::default();
        let kept = hub.subscribe();
        let dropped = hub.subscribe();
        drop(dropped);
        hub.emit(EngineEvent::Xrun);
        assert_eq!(kept.try_recv(), Ok(EngineEvent::Xrun));
        assert_eq!(lock(&hub.subscribers).len(), 1);
    }
}
