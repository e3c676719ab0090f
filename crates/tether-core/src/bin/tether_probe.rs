//! tether-probe - inspect the audio server the backend would talk to
//!
//! Starts a backend with the saved configuration, prints what the server
//! negotiated and the ports it exposes, then stops again.
//!
//! ## Command line flags
//!
//! - `--dummy`: probe the in-process server instead of JACK
//! - `--command-line`: print the jackd command line for the saved targets
//! - `--save-defaults`: write a default config if none exists

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};

use tether_core::config::{default_config_path, load_config, save_config, BackendConfig};
use tether_core::server::dummy::{DummyClock, DummyConfig, DummyServer};
use tether_core::server::AudioServer;
use tether_core::{AudioBackend, CycleResult, DataType, PortFlags};

const CLIENT_NAME: &str = "tether-probe";

fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().collect();
    let flag = |name: &str| args.iter().any(|arg| arg == name);

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .init();

    let config_path = default_config_path();
    if flag("--save-defaults") && !config_path.exists() {
        save_config(&BackendConfig::default(), &config_path)?;
    }
    let config: BackendConfig = load_config(&config_path);

    if flag("--command-line") {
        let command_line = config
            .command_line_options()
            .to_command_line()
            .context("Cannot build jackd command line")?;
        println!("{}", command_line);
        return Ok(());
    }

    let server = select_server(flag("--dummy"));
    probe(server, config.with_client_name(CLIENT_NAME), &config_path)
}

#[cfg(all(target_os = "linux", feature = "jack-backend"))]
fn select_server(dummy: bool) -> Arc<dyn AudioServer> {
    if dummy {
        return dummy_server();
    }
    Arc::new(tether_core::server::jack::JackServer::new())
}

#[cfg(not(all(target_os = "linux", feature = "jack-backend")))]
fn select_server(_dummy: bool) -> Arc<dyn AudioServer> {
    dummy_server()
}

fn dummy_server() -> Arc<dyn AudioServer> {
    Arc::new(DummyServer::new(
        DummyConfig::default().with_clock(DummyClock::Realtime),
    ))
}

fn probe(server: Arc<dyn AudioServer>, config: BackendConfig, config_path: &Path) -> Result<()> {
    println!("Server:  {} ({})", server.name(), if server.is_running() { "running" } else { "not running" });
    println!("Config:  {}", config_path.display());

    let backend = AudioBackend::new(server, config)?;
    let events = backend.subscribe();
    backend.start().context("Cannot start audio backend")?;

    let params = backend.parameters();
    println!("Client:  {}", backend.connection().client_name());
    println!("Rate:    {} Hz", params.sample_rate);
    println!("Buffer:  {} frames", params.buffer_size);
    println!("Inputs:  {}   Outputs: {}", params.input_channels, params.output_channels);
    println!("Realtime: {}", backend.is_realtime());

    let ports = backend.port_engine();
    for data_type in DataType::ALL {
        println!("Physical {} outputs: {:?}", data_type, ports.get_physical_outputs(data_type));
        println!("Physical {} inputs:  {:?}", data_type, ports.get_physical_inputs(data_type));
    }
    println!("All ports:");
    for name in ports.get_ports(None, None, PortFlags::NONE) {
        println!("  {}", name);
    }

    // Count a few cycles to show the process callback is live
    let probe_port = ports.register_port("probe_in", DataType::Audio, PortFlags::IS_INPUT)?;
    backend.set_process_callback(move |cycle| {
        let _ = cycle.audio(probe_port);
        CycleResult::Continue
    });
    std::thread::sleep(Duration::from_millis(500));
    println!(
        "DSP load: {:.1}%   xruns: {}   frame time: {}",
        backend.dsp_load(),
        backend.xrun_count(),
        backend.sample_time()
    );

    backend.stop()?;
    for event in events.try_iter() {
        log::debug!("event: {:?}", event);
    }
    Ok(())
}
