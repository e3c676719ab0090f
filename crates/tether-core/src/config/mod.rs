//! Backend configuration
//!
//! [`BackendConfig`] holds the *target* parameters: what the engine asks the
//! server for on the next start. Live values come from the server once the
//! engine runs and never write back into the config.
//!
//! ```ignore
//! use tether_core::config::{default_config_path, load_config, BackendConfig};
//!
//! let config: BackendConfig = load_config(&default_config_path());
//! let backend = AudioBackend::new(server, config.with_buffer_size(256));
//! ```

mod io;
mod paths;

pub use io::{load_config, save_config};
pub use paths::{config_dir, default_config_path};

use serde::{Deserialize, Serialize};

use crate::jackd::{DriverKind, JackCommandLineOptions, DEFAULT_DEVICE, MIDI_NONE};
use crate::types::{Frames, DEFAULT_BUFFER_SIZE, DEFAULT_SAMPLE_RATE};

/// Default client name registered with the server
pub const DEFAULT_CLIENT_NAME: &str = "tether";

/// Default stack for threads from `create_process_thread`
pub const DEFAULT_PROCESS_THREAD_STACK: usize = 512 * 1024;

/// Target parameters for the audio backend
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    /// Requested client name; the server may assign a different one
    pub client_name: String,

    /// Session id to resume, if the server supports it
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,

    pub driver: DriverKind,

    /// Device display name (see `DriverKind::devices`)
    pub device: String,

    pub sample_rate: u32,

    pub buffer_size: Frames,

    /// Number of periods per buffer
    pub periods: u32,

    /// 0 means all available
    pub input_channels: u32,

    /// 0 means all available
    pub output_channels: u32,

    pub systemic_input_latency: Frames,

    pub systemic_output_latency: Frames,

    /// Pretty name from `MidiOption::names`
    pub midi_option: String,

    /// We own server startup: write `~/.jackdrc` before connecting if no
    /// server is running yet
    pub start_server: bool,

    /// Overrides the server's realtime priority for the jackd command line
    #[serde(skip_serializing_if = "Option::is_none")]
    pub realtime_priority: Option<i32>,

    /// Stack size for threads from `create_process_thread`
    pub process_thread_stack_size: usize,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            client_name: DEFAULT_CLIENT_NAME.to_string(),
            session_id: None,
            driver: DriverKind::default(),
            device: DEFAULT_DEVICE.to_string(),
            sample_rate: DEFAULT_SAMPLE_RATE,
            buffer_size: DEFAULT_BUFFER_SIZE,
            periods: 2,
            input_channels: 0,
            output_channels: 0,
            systemic_input_latency: 0,
            systemic_output_latency: 0,
            midi_option: MIDI_NONE.to_string(),
            start_server: false,
            realtime_priority: None,
            process_thread_stack_size: DEFAULT_PROCESS_THREAD_STACK,
        }
    }
}

impl BackendConfig {
    pub fn with_client_name(mut self, name: impl Into<String>) -> Self {
        self.client_name = name.into();
        self
    }

    pub fn with_session_id(mut self, id: impl Into<String>) -> Self {
        self.session_id = Some(id.into());
        self
    }

    pub fn with_driver(mut self, driver: DriverKind) -> Self {
        self.driver = driver;
        self
    }

    pub fn with_device(mut self, device: impl Into<String>) -> Self {
        self.device = device.into();
        self
    }

    pub fn with_sample_rate(mut self, rate: u32) -> Self {
        self.sample_rate = rate;
        self
    }

    pub fn with_buffer_size(mut self, nframes: Frames) -> Self {
        self.buffer_size = nframes;
        self
    }

    pub fn with_periods(mut self, periods: u32) -> Self {
        self.periods = periods;
        self
    }

    pub fn with_channels(mut self, inputs: u32, outputs: u32) -> Self {
        self.input_channels = inputs;
        self.output_channels = outputs;
        self
    }

    pub fn with_systemic_latency(mut self, input: Frames, output: Frames) -> Self {
        self.systemic_input_latency = input;
        self.systemic_output_latency = output;
        self
    }

    pub fn with_midi_option(mut self, option: impl Into<String>) -> Self {
        self.midi_option = option.into();
        self
    }

    /// Write `~/.jackdrc` on start when no server is running
    pub fn with_server_startup(mut self, start_server: bool) -> Self {
        self.start_server = start_server;
        self
    }

    pub fn with_realtime_priority(mut self, priority: i32) -> Self {
        self.realtime_priority = Some(priority);
        self
    }

    /// jackd options for these targets
    pub fn command_line_options(&self) -> JackCommandLineOptions {
        let midi_driver = crate::jackd::MidiOption::driver_for(&self.midi_option)
            .ok()
            .flatten()
            .map(str::to_string);
        JackCommandLineOptions {
            driver: self.driver,
            input_device: self.device.clone(),
            output_device: self.device.clone(),
            num_periods: self.periods,
            period_size: self.buffer_size,
            sample_rate: self.sample_rate,
            input_channels: self.input_channels,
            output_channels: self.output_channels,
            input_latency: self.systemic_input_latency,
            output_latency: self.systemic_output_latency,
            priority: self.realtime_priority.unwrap_or(0),
            midi_driver,
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_server_defaults() {
        let config = BackendConfig::default();
        assert_eq!(config.sample_rate, 48000);
        assert_eq!(config.buffer_size, 1024);
        assert_eq!(config.periods, 2);
        assert!(!config.start_server);
    }

    #[test]
    fn test_command_line_options_follow_targets() {
        let options = BackendConfig::default()
            .with_driver(DriverKind::Dummy)
            .with_sample_rate(44100)
            .with_buffer_size(256)
            .with_channels(4, 2)
            .command_line_options();
        assert_eq!(options.sample_rate, 44100);
        assert_eq!(options.period_size, 256);
        assert_eq!(options.input_channels, 4);
        assert_eq!(options.midi_driver, None);
        assert!(options.to_command_line().is_ok());
    }
}
