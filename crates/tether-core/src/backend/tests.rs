//! Engine scenarios against the in-process server

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use super::*;
use crate::error::PortError;
use crate::server::dummy::{DummyConfig, DummyServer, ServerOp};
use crate::server::ServerCapabilities;
use crate::types::{PortFlags, Sample};

const TIMEOUT: Duration = Duration::from_secs(2);

fn backend(server: &DummyServer) -> Arc<AudioBackend> {
    AudioBackend::new(Arc::new(server.clone()), BackendConfig::default()).unwrap()
}

fn running(server: &DummyServer) -> Arc<AudioBackend> {
    let backend = backend(server);
    backend.start().unwrap();
    backend
}

/// Run cycles on a throwaway thread; cycle threads get marked as process
/// threads and the test thread must stay a control thread
fn cycles(server: &DummyServer, count: usize) -> usize {
    let server = server.clone();
    thread::spawn(move || server.run_cycles(count)).join().unwrap()
}

fn wait_for(
    rx: &flume::Receiver<EngineEvent>,
    pred: impl Fn(&EngineEvent) -> bool,
) -> Option<EngineEvent> {
    let deadline = Instant::now() + TIMEOUT;
    loop {
        let left = deadline.saturating_duration_since(Instant::now());
        match rx.recv_timeout(left) {
            Ok(event) if pred(&event) => return Some(event),
            Ok(_) => continue,
            Err(_) => return None,
        }
    }
}

/// Everything that arrives within `window`
fn collect(rx: &flume::Receiver<EngineEvent>, window: Duration) -> Vec<EngineEvent> {
    let deadline = Instant::now() + window;
    let mut events = Vec::new();
    while let Ok(event) = rx.recv_timeout(deadline.saturating_duration_since(Instant::now())) {
        events.push(event);
    }
    events
}

fn caps() -> ServerCapabilities {
    DummyConfig::default().capabilities
}

// ─────────────────────────────────────────────────────────────────────────────
// Lifecycle
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn test_start_adopts_server_parameters() {
    let server = DummyServer::default();
    let backend = backend(&server);
    let rx = backend.subscribe();
    backend.start().unwrap();

    assert_eq!(backend.state(), EngineState::Running);
    assert!(backend.connected());
    assert_eq!(backend.frame_rate(), 48000);
    assert_eq!(backend.frames_per_cycle(), 1024);
    assert_eq!(backend.raw_buffer_size(DataType::Audio), 1024 * 4);
    assert_eq!(backend.raw_buffer_size(DataType::Midi), 32 * 1024);
    assert!(wait_for(&rx, |e| *e == EngineEvent::Running).is_some());
}

#[test]
fn test_start_registers_callbacks_before_activating() {
    let server = DummyServer::default();
    let _backend = running(&server);

    let ops = server.ops();
    let activate = ops
        .iter()
        .position(|op| matches!(op, ServerOp::Activate(_)))
        .unwrap();
    let enabled: Vec<CallbackKind> = ops[..activate]
        .iter()
        .filter_map(|op| match op {
            ServerOp::EnableCallback(kind) => Some(*kind),
            _ => None,
        })
        .collect();
    assert!(enabled.contains(&CallbackKind::BufferSize));
    assert!(enabled.contains(&CallbackKind::Latency));
    // Session is optional and this server lacks it
    assert!(!enabled.contains(&CallbackKind::Session));
}

#[test]
fn test_stop_clears_live_values_every_time() {
    let server = DummyServer::default();
    let backend = backend(&server);
    for _ in 0..3 {
        backend.start().unwrap();
        backend.stop().unwrap();
        assert!(!backend.connected());
        assert_eq!(backend.frame_rate(), 0);
        assert_eq!(backend.buffer_size(), 0);
        assert_eq!(backend.raw_buffer_size(DataType::Audio), 0);
    }
    backend.stop().unwrap();
    assert!(!backend.connected());
    assert_eq!(backend.frame_rate(), 0);
}

#[test]
fn test_stop_when_stopped_is_silent() {
    let server = DummyServer::default();
    let backend = backend(&server);
    let rx = backend.subscribe();
    backend.stop().unwrap();
    backend.stop().unwrap();
    assert_eq!(backend.state(), EngineState::Stopped);
    assert!(collect(&rx, Duration::from_millis(100)).is_empty());
}

#[test]
fn test_stop_reports_stopped_not_halted() {
    let server = DummyServer::default();
    let backend = running(&server);
    let rx = backend.subscribe();
    backend.stop().unwrap();
    let events = collect(&rx, Duration::from_millis(100));
    assert!(events.contains(&EngineEvent::Stopped));
    assert!(!events.iter().any(|e| matches!(e, EngineEvent::Halted(_))));
}

#[test]
fn test_start_fails_when_server_unreachable() {
    let server = DummyServer::default();
    server.set_reachable(false);
    let backend = backend(&server);

    let err = backend.start().unwrap_err();
    assert!(matches!(
        err,
        BackendError::Connection(ConnectionError::ServerUnreachable(_))
    ));
    assert_eq!(backend.state(), EngineState::Stopped);
    assert_eq!(backend.last_error(), Some(err));
    assert_eq!(backend.frame_rate(), 0);

    server.set_reachable(true);
    backend.start().unwrap();
    assert_eq!(backend.last_error(), None);
}

#[test]
fn test_unreliable_buffer_size_callback_is_applied_by_hand() {
    let server = DummyServer::new(DummyConfig::default().with_capabilities(ServerCapabilities {
        reliable_buffer_size_callback: false,
        ..caps()
    }));
    let backend = backend(&server);
    let rx = backend.subscribe();
    backend.start().unwrap();
    assert_eq!(backend.frames_per_cycle(), 1024);

    let events = collect(&rx, Duration::from_millis(150));
    let sizes = events
        .iter()
        .filter(|e| matches!(e, EngineEvent::BufferSizeChange(_)))
        .count();
    assert_eq!(sizes, 1);
}

#[test]
fn test_raw_sizes_fall_back_without_server_answer() {
    let server = DummyServer::new(
        DummyConfig::default()
            .with_buffer_size(256)
            .with_capabilities(ServerCapabilities {
                port_type_buffer_size: false,
                ..caps()
            }),
    );
    let backend = running(&server);
    assert_eq!(backend.raw_buffer_size(DataType::Audio), 256 * 4);
    assert_eq!(backend.raw_buffer_size(DataType::Midi), 256 * 4 - 128);
}

#[test]
fn test_pause_and_resume() {
    let server = DummyServer::default();
    let backend = running(&server);
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    backend.set_process_callback(move |_cycle| {
        counter.fetch_add(1, Ordering::Relaxed);
        CycleResult::Continue
    });

    assert_eq!(cycles(&server, 2), 2);
    backend.pause().unwrap();
    assert_eq!(backend.state(), EngineState::Paused);
    assert!(backend.connected());
    assert_eq!(cycles(&server, 2), 0);
    assert_eq!(calls.load(Ordering::Relaxed), 2);

    backend.start().unwrap();
    assert_eq!(backend.state(), EngineState::Running);
    assert_eq!(cycles(&server, 1), 1);
    assert_eq!(calls.load(Ordering::Relaxed), 3);
}

#[test]
fn test_pause_needs_running_engine() {
    let server = DummyServer::default();
    let backend = backend(&server);
    assert_eq!(backend.pause(), Err(BackendError::NotRunning));
    assert_eq!(backend.freewheel(true), Err(BackendError::NotRunning));
}

#[test]
fn test_freewheel_silences_midi_sync_output() {
    let server = DummyServer::default();
    let backend = running(&server);
    backend.set_midi_send_enabled(MidiSendKind::Clock, false);

    backend.freewheel(true).unwrap();
    assert_eq!(backend.state(), EngineState::Freewheeling);
    assert!(server.is_freewheeling());
    for kind in MidiSendKind::ALL {
        assert!(!backend.midi_send_enabled(kind));
    }
    // Unchanged request is a no-op
    backend.freewheel(true).unwrap();

    // Applies once freewheel ends
    backend.set_midi_send_enabled(MidiSendKind::Mtc, false);
    assert!(!backend.midi_send_enabled(MidiSendKind::Mtc));

    backend.freewheel(false).unwrap();
    assert_eq!(backend.state(), EngineState::Running);
    assert!(!server.is_freewheeling());
    assert!(backend.midi_send_enabled(MidiSendKind::Mmc));
    assert!(!backend.midi_send_enabled(MidiSendKind::Mtc));
    assert!(!backend.midi_send_enabled(MidiSendKind::Clock));
}

#[test]
fn test_stop_while_freewheeling_restores_midi_send() {
    let server = DummyServer::default();
    let backend = running(&server);
    backend.freewheel(true).unwrap();
    backend.stop().unwrap();
    for kind in MidiSendKind::ALL {
        assert!(backend.midi_send_enabled(kind));
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Realtime dispatch
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn test_passthrough_reaches_playback() {
    let server = DummyServer::default();
    let backend = running(&server);
    let ports = backend.port_engine();
    let input = ports
        .register_port("in1", DataType::Audio, PortFlags::IS_INPUT)
        .unwrap();
    let output = ports
        .register_port("out1", DataType::Audio, PortFlags::IS_OUTPUT)
        .unwrap();
    ports.connect(input, "system:capture_1").unwrap();
    ports.connect(output, "system:playback_1").unwrap();

    backend.set_process_callback(move |cycle| {
        if let (Some(src), Some(dst)) = (cycle.audio(input), cycle.audio(output)) {
            dst.copy_from_slice(src);
        }
        CycleResult::Continue
    });
    server.set_capture_level(0, 0.5);
    assert_eq!(cycles(&server, 1), 1);

    let played = server.playback_buffer(0).unwrap();
    assert_eq!(played.len(), 1024);
    assert!(played.iter().all(|&s| s == 0.5));
    // Nothing routed to the second channel
    assert!(server.playback_buffer(1).unwrap().iter().all(|&s| s == 0.0));
}

#[test]
fn test_cycle_larger_than_announced_goes_out_silent() {
    let server = DummyServer::default();
    let backend = running(&server);
    let output = backend
        .port_engine()
        .register_port("out1", DataType::Audio, PortFlags::IS_OUTPUT)
        .unwrap();
    backend
        .port_engine()
        .connect(output, "system:playback_1")
        .unwrap();
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    backend.set_process_callback(move |cycle| {
        counter.fetch_add(1, Ordering::SeqCst);
        if let Some(out) = cycle.audio(output) {
            out.fill(1.0);
        }
        CycleResult::Continue
    });
    assert_eq!(cycles(&server, 1), 1);
    assert!(server.playback_buffer(0).unwrap().iter().all(|&s| s == 1.0));

    server.change_buffer_size_unannounced(2048);
    assert_eq!(cycles(&server, 1), 1);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    let played = server.playback_buffer(0).unwrap();
    assert_eq!(played.len(), 2048);
    assert!(played.iter().all(|&s| s == 0.0));
    assert_eq!(backend.frames_per_cycle(), 1024);
}

#[test]
fn test_buffers_follow_fuzzed_size_changes() {
    let server = DummyServer::default();
    let backend = running(&server);
    let output = backend
        .port_engine()
        .register_port("out", DataType::Audio, PortFlags::IS_OUTPUT)
        .unwrap();
    let seen: Arc<Mutex<Vec<(Frames, usize)>>> = Arc::new(Mutex::new(Vec::new()));
    let record = seen.clone();
    backend.set_process_callback(move |cycle| {
        let len = cycle.audio(output).map_or(0, |buf: &mut [Sample]| {
            buf.fill(0.25);
            buf.len()
        });
        record.lock().unwrap().push((cycle.nframes(), len));
        CycleResult::Continue
    });

    for nframes in [256, 64, 8192, 8, 1000, 33, 4096, 128] {
        backend.set_buffer_size(nframes).unwrap();
        assert_eq!(backend.frames_per_cycle(), nframes);
        assert!(backend.raw_buffer_size(DataType::Audio) >= nframes as usize * 4);
        assert_eq!(cycles(&server, 1), 1);
        assert_eq!(seen.lock().unwrap().last(), Some(&(nframes, nframes as usize)));
    }
}

#[test]
fn test_fatal_result_halts_engine() {
    let server = DummyServer::default();
    let backend = running(&server);
    let rx = backend.subscribe();
    backend.set_process_callback(|_cycle| CycleResult::Fatal);

    assert_eq!(cycles(&server, 1), 1);
    let halted = wait_for(&rx, |e| matches!(e, EngineEvent::Halted(_)));
    assert_eq!(
        halted,
        Some(EngineEvent::Halted("process callback failed".to_string()))
    );
    assert_eq!(backend.state(), EngineState::Stopped);
    assert!(!backend.connected());
    assert_eq!(backend.frame_rate(), 0);

    // A fresh start clears the request
    backend.clear_process_callback();
    backend.start().unwrap();
    assert_eq!(cycles(&server, 1), 1);
    assert_eq!(backend.state(), EngineState::Running);
}

#[test]
fn test_host_not_called_before_start() {
    let server = DummyServer::default();
    let backend = backend(&server);
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    backend.set_process_callback(move |_cycle| {
        counter.fetch_add(1, Ordering::Relaxed);
        CycleResult::Continue
    });
    assert_eq!(cycles(&server, 3), 0);
    assert_eq!(calls.load(Ordering::Relaxed), 0);
}

// ─────────────────────────────────────────────────────────────────────────────
// Server notifications
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn test_server_buffer_size_change_notifies_once() {
    let server = DummyServer::default();
    let backend = running(&server);
    let rx = backend.subscribe();

    server.change_buffer_size(512).unwrap();
    assert_eq!(backend.frames_per_cycle(), 512);
    assert_eq!(backend.raw_buffer_size(DataType::Audio), 512 * 4);

    let events = collect(&rx, Duration::from_millis(150));
    let count = events
        .iter()
        .filter(|e| **e == EngineEvent::BufferSizeChange(512))
        .count();
    assert_eq!(count, 1);
}

#[test]
fn test_shutdown_halts_and_stops_processing() {
    let server = DummyServer::default();
    let backend = running(&server);
    let rx = backend.subscribe();
    let output = backend
        .port_engine()
        .register_port("out", DataType::Audio, PortFlags::IS_OUTPUT)
        .unwrap();
    let buffers = Arc::new(AtomicUsize::new(0));
    let counter = buffers.clone();
    backend.set_process_callback(move |cycle| {
        if cycle.audio(output).is_some() {
            counter.fetch_add(1, Ordering::Relaxed);
        }
        CycleResult::Continue
    });
    assert_eq!(cycles(&server, 2), 2);

    server.shutdown("device removed");
    let halted = wait_for(&rx, |e| matches!(e, EngineEvent::Halted(_)));
    assert_eq!(halted, Some(EngineEvent::Halted("device removed".to_string())));
    assert!(!backend.connected());
    assert_eq!(backend.state(), EngineState::Stopped);
    assert_eq!(backend.frame_rate(), 0);

    assert_eq!(cycles(&server, 3), 0);
    assert_eq!(buffers.load(Ordering::Relaxed), 2);
}

#[test]
fn test_shutdown_while_stopped_is_not_halted() {
    let server = DummyServer::default();
    let backend = backend(&server);
    let rx = backend.subscribe();
    server.shutdown("device removed");
    assert!(collect(&rx, Duration::from_millis(100)).is_empty());
}

#[test]
fn test_xrun_is_counted_and_harmless() {
    let server = DummyServer::default();
    let backend = running(&server);
    let rx = backend.subscribe();
    backend.transport_start();
    let transport = backend.transport_state();

    server.inject_xrun();
    assert!(wait_for(&rx, |e| *e == EngineEvent::Xrun).is_some());
    assert_eq!(backend.xrun_count(), 1);
    assert!(backend.connected());
    assert_eq!(backend.state(), EngineState::Running);
    assert_eq!(backend.transport_state(), transport);
}

#[test]
fn test_port_connection_event_carries_our_handle() {
    let server = DummyServer::default();
    let backend = running(&server);
    let rx = backend.subscribe();
    let ports = backend.port_engine();
    let input = ports
        .register_port("in1", DataType::Audio, PortFlags::IS_INPUT)
        .unwrap();
    ports.connect(input, "system:capture_1").unwrap();

    let event = wait_for(&rx, |e| matches!(e, EngineEvent::PortConnection { .. }));
    assert_eq!(
        event,
        Some(EngineEvent::PortConnection {
            port_a: None,
            name_a: "system:capture_1".to_string(),
            port_b: Some(input),
            name_b: "tether:in1".to_string(),
            connected: true,
        })
    );
}

// ─────────────────────────────────────────────────────────────────────────────
// Reconnect
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn test_reconnect_restores_ports_and_connections() {
    let server = DummyServer::default();
    let backend = running(&server);
    let ports = backend.port_engine();
    let input = ports
        .register_port("in1", DataType::Audio, PortFlags::IS_INPUT)
        .unwrap();
    ports.connect(input, "system:capture_1").unwrap();

    backend.reconnect().unwrap();
    assert_eq!(backend.state(), EngineState::Running);
    assert!(server.has_port("tether:in1"));
    assert_eq!(
        ports.get_connections(input).unwrap(),
        vec!["system:capture_1".to_string()]
    );
    assert_eq!(backend.frames_per_cycle(), 1024);
}

#[test]
fn test_reconnect_drops_every_port_when_one_fails() {
    let server = DummyServer::default();
    let backend = running(&server);
    let ports = backend.port_engine();
    for name in ["a", "b", "c"] {
        ports
            .register_port(name, DataType::Audio, PortFlags::IS_OUTPUT)
            .unwrap();
    }
    server.reject_port("b");

    let err = backend.reconnect().unwrap_err();
    assert_eq!(err, BackendError::Port(PortError::ReestablishFailed("b".to_string())));
    assert_eq!(ports.port_count(), 0);
    for name in ["tether:a", "tether:b", "tether:c"] {
        assert!(!server.has_port(name));
    }
    assert_eq!(backend.state(), EngineState::Stopped);
    assert_eq!(backend.last_error(), Some(err));
}

// ─────────────────────────────────────────────────────────────────────────────
// Parameters
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn test_sample_format_is_fixed() {
    let server = DummyServer::default();
    let backend = backend(&server);
    for format in [SampleFormat::Int16, SampleFormat::Int24] {
        assert!(matches!(
            backend.set_sample_format(format),
            Err(BackendError::Config(ConfigError::Unsupported { .. }))
        ));
        assert_eq!(backend.sample_format(), SampleFormat::Float32);
    }
    backend.set_sample_format(SampleFormat::Float32).unwrap();
    assert!(backend.set_interleaved(true).is_err());
    assert!(!backend.interleaved());

    backend.start().unwrap();
    assert!(backend.set_sample_format(SampleFormat::Int24).is_err());
    assert_eq!(backend.parameters().sample_format, SampleFormat::Float32);
}

#[test]
fn test_setters_while_stopped_update_targets() {
    let server = DummyServer::default();
    let backend = backend(&server);
    backend.set_sample_rate(44100).unwrap();
    backend.set_buffer_size(256).unwrap();
    backend.set_period_size(3).unwrap();
    backend.set_input_channels(4).unwrap();
    backend.set_output_channels(6).unwrap();
    backend.set_systemic_input_latency(32).unwrap();
    backend.set_systemic_output_latency(64).unwrap();
    backend.set_device_name("hw:1").unwrap();

    let params = backend.parameters();
    assert!(!params.live);
    assert_eq!(params.sample_rate, 44100);
    assert_eq!(params.buffer_size, 256);
    assert_eq!(params.periods, 3);
    assert_eq!(params.input_channels, 4);
    assert_eq!(params.output_channels, 6);
    assert_eq!(params.systemic_input_latency, 32);
    assert_eq!(params.systemic_output_latency, 64);
    assert_eq!(params.device, "hw:1");
    // Live values stay empty until started
    assert_eq!(backend.frame_rate(), 0);

    assert!(backend.set_buffer_size(0).is_err());
    assert!(backend.set_buffer_size(MAX_BUFFER_SIZE + 1).is_err());
    assert!(backend.set_midi_option("no such driver").is_err());
}

#[test]
fn test_setters_while_running() {
    let server = DummyServer::default();
    let backend = running(&server);
    let restart = |r: BackendResult<()>| {
        matches!(r, Err(BackendError::Config(ConfigError::RestartRequired(_))))
    };

    backend.set_sample_rate(48000).unwrap();
    assert!(restart(backend.set_sample_rate(44100)));
    assert!(!backend.can_change_sample_rate_when_running());

    let device = backend.config().device;
    backend.set_device_name(&device).unwrap();
    assert!(restart(backend.set_device_name("hw:9")));

    assert!(restart(backend.set_period_size(3)));
    assert!(restart(backend.set_input_channels(2)));
    backend.set_output_channels(0).unwrap();
    assert!(restart(backend.set_systemic_input_latency(10)));
    assert!(restart(backend.set_systemic_output_latency(10)));

    assert!(backend.can_change_buffer_size_when_running());
    backend.set_buffer_size(256).unwrap();
    assert_eq!(backend.frames_per_cycle(), 256);
    assert!(server.ops().contains(&ServerOp::SetBufferSize(256)));

    let params = backend.parameters();
    assert!(params.live);
    assert_eq!(params.sample_rate, 48000);
    assert_eq!(params.buffer_size, 256);
    assert_eq!(params.input_channels, 2);
    assert_eq!(params.output_channels, 2);
}

#[test]
fn test_buffer_size_needs_restart_without_live_change() {
    let server = DummyServer::new(DummyConfig::default().with_capabilities(ServerCapabilities {
        live_buffer_size_change: false,
        ..caps()
    }));
    let backend = running(&server);
    assert!(matches!(
        backend.set_buffer_size(256),
        Err(BackendError::Config(ConfigError::RestartRequired(_)))
    ));
    assert_eq!(backend.frames_per_cycle(), 1024);
}

#[test]
fn test_available_values_narrow_while_running() {
    let server = DummyServer::default();
    let backend = backend(&server);
    let device = backend.config().device;
    assert_eq!(backend.available_sample_rates(&device).len(), 10);
    assert_eq!(backend.available_buffer_sizes(&device).first(), Some(&8));
    assert_eq!(backend.available_buffer_sizes(&device).last(), Some(&8192));

    backend.start().unwrap();
    assert_eq!(backend.available_sample_rates(&device), vec![48000]);
    assert_eq!(backend.available_buffer_sizes(&device), vec![1024]);
    assert_eq!(backend.available_sample_rates("elsewhere").len(), 10);

    assert_eq!(backend.available_period_sizes(DriverKind::Alsa), vec![2, 3]);
    assert!(backend.available_period_sizes(DriverKind::Dummy).is_empty());
    assert_eq!(backend.available_input_channel_count(&device), 128);
    assert_eq!(backend.enumerate_midi_options().last(), Some(&"None"));
}

#[test]
fn test_control_app_lookup() {
    assert_eq!(
        control_app_for(DriverKind::Alsa, "RME Hammerfall DSP"),
        Some("hdspconf")
    );
    assert_eq!(
        control_app_for(DriverKind::Alsa, "M Audio Delta 1010"),
        Some("mudita24")
    );
    assert_eq!(control_app_for(DriverKind::Oss, "RME Hammerfall DSP"), None);
    assert_eq!(control_app_for(DriverKind::Alsa, "HDA Intel PCH"), None);
}

// ─────────────────────────────────────────────────────────────────────────────
// Transport and threads
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn test_transport_rolls_with_cycles() {
    let server = DummyServer::default();
    let backend = running(&server);
    assert_eq!(backend.transport_state(), TransportState::Stopped);

    backend.transport_start();
    assert_eq!(backend.transport_state(), TransportState::Rolling);
    cycles(&server, 2);
    assert_eq!(backend.transport_frame(), 2048);
    assert_eq!(backend.speed_and_position(), (1.0, 2048, false));

    backend.transport_stop();
    backend.transport_locate(100);
    assert_eq!(backend.speed_and_position(), (0.0, 100, false));
    backend.set_time_master(true).unwrap();
    assert!(server.ops().contains(&ServerOp::SetTimebase(true)));
}

#[test]
fn test_transport_without_connection() {
    let server = DummyServer::default();
    let backend = backend(&server);
    backend.transport_start();
    assert_eq!(backend.transport_state(), TransportState::Stopped);
    assert_eq!(backend.speed_and_position(), (0.0, 0, false));
    assert!(backend.set_time_master(true).is_err());
}

#[test]
fn test_process_threads_are_marked() {
    let server = DummyServer::default();
    let backend = running(&server);
    assert!(!backend.in_process_thread());

    let (tx, rx) = crossbeam::channel::unbounded();
    backend
        .create_process_thread(move || {
            let _ = tx.send(rt::is_process_thread());
        })
        .unwrap();
    assert_eq!(backend.process_thread_count(), 1);
    assert_eq!(rx.recv_timeout(TIMEOUT), Ok(true));
    backend.join_process_threads().unwrap();
    assert_eq!(backend.process_thread_count(), 0);
}

#[test]
fn test_control_refused_on_process_thread() {
    let server = DummyServer::default();
    let backend = running(&server);
    let worker = backend.clone();
    let result = thread::spawn(move || {
        rt::mark_process_thread();
        worker.stop()
    })
    .join()
    .unwrap();
    assert_eq!(
        result,
        Err(BackendError::Connection(ConnectionError::RealtimeThread))
    );
    assert_eq!(backend.state(), EngineState::Running);
}
