//! jackd command line construction and `~/.jackdrc` handling
//!
//! When we are the ones expected to bring the server up, the target
//! parameters are turned into a jackd command line and written to the file
//! libjack consults when it autostarts a server.

use std::fmt;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Device name used by drivers without device selection
pub const DEFAULT_DEVICE: &str = "Default";

/// Pretty name of the "no MIDI driver" option
pub const MIDI_NONE: &str = "None";

const JACKDRC: &str = ".jackdrc";
const ASOUND_CARDS: &str = "/proc/asound/cards";

// ═══════════════════════════════════════════════════════════════════════════════
// Drivers
// ═══════════════════════════════════════════════════════════════════════════════

/// Audio drivers jackd can run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DriverKind {
    Portaudio,
    CoreAudio,
    Alsa,
    Oss,
    Sun,
    FreeBob,
    Ffado,
    NetJack,
    Dummy,
}

impl DriverKind {
    const EVERY: [DriverKind; 9] = [
        DriverKind::Portaudio,
        DriverKind::CoreAudio,
        DriverKind::Alsa,
        DriverKind::Oss,
        DriverKind::Sun,
        DriverKind::FreeBob,
        DriverKind::Ffado,
        DriverKind::NetJack,
        DriverKind::Dummy,
    ];

    /// Name shown to users
    pub fn pretty_name(&self) -> &'static str {
        match self {
            DriverKind::Portaudio => "Portaudio",
            DriverKind::CoreAudio => "CoreAudio",
            DriverKind::Alsa => "ALSA",
            DriverKind::Oss => "OSS",
            DriverKind::Sun => "Sun",
            DriverKind::FreeBob => "FreeBoB",
            DriverKind::Ffado => "FFADO",
            DriverKind::NetJack => "NetJACK",
            DriverKind::Dummy => "Dummy",
        }
    }

    /// Name passed to `jackd -d`
    pub fn command_line_name(&self) -> &'static str {
        match self {
            DriverKind::Portaudio => "portaudio",
            DriverKind::CoreAudio => "coreaudio",
            DriverKind::Alsa => "alsa",
            DriverKind::Oss => "oss",
            DriverKind::Sun => "sun",
            DriverKind::FreeBob => "freebob",
            DriverKind::Ffado => "firewire",
            DriverKind::NetJack => "netjack",
            DriverKind::Dummy => "dummy",
        }
    }

    pub fn from_pretty_name(name: &str) -> Option<Self> {
        Self::EVERY.into_iter().find(|d| d.pretty_name() == name)
    }

    /// Drivers offered on this platform, preferred first
    pub fn available() -> Vec<DriverKind> {
        if cfg!(windows) {
            vec![DriverKind::Portaudio, DriverKind::NetJack, DriverKind::Dummy]
        } else if cfg!(target_os = "macos") {
            vec![DriverKind::CoreAudio, DriverKind::NetJack, DriverKind::Dummy]
        } else {
            let mut drivers = Vec::new();
            if cfg!(target_os = "linux") {
                drivers.push(DriverKind::Alsa);
            }
            drivers.push(DriverKind::Oss);
            if cfg!(target_os = "netbsd") || cfg!(target_os = "solaris") {
                drivers.push(DriverKind::Sun);
            }
            drivers.extend([
                DriverKind::FreeBob,
                DriverKind::Ffado,
                DriverKind::NetJack,
                DriverKind::Dummy,
            ]);
            drivers
        }
    }

    /// Platform default driver
    pub fn default_for_platform() -> Self {
        Self::available()
            .first()
            .copied()
            .unwrap_or(DriverKind::Dummy)
    }

    pub fn supports_two_devices(&self) -> bool {
        matches!(self, DriverKind::Alsa | DriverKind::Oss | DriverKind::Sun)
    }

    pub fn supports_latency_adjustment(&self) -> bool {
        matches!(
            self,
            DriverKind::Alsa | DriverKind::CoreAudio | DriverKind::Ffado | DriverKind::Portaudio
        )
    }

    pub fn supports_setting_period_count(&self) -> bool {
        !matches!(
            self,
            DriverKind::Dummy | DriverKind::CoreAudio | DriverKind::Portaudio
        )
    }

    /// Devices this driver can open, as (display name, command line name)
    pub fn devices(&self) -> Vec<(String, String)> {
        match self {
            DriverKind::Alsa => std::fs::read_to_string(ASOUND_CARDS)
                .map(|cards| parse_asound_cards(&cards))
                .unwrap_or_else(|e| {
                    log::debug!("[JACKD] cannot read {}: {}", ASOUND_CARDS, e);
                    Vec::new()
                }),
            _ => vec![(DEFAULT_DEVICE.to_string(), DEFAULT_DEVICE.to_string())],
        }
    }

    /// Command line name for a device display name
    ///
    /// Names that are not in the enumerated list pass through unchanged so
    /// that raw ALSA ids (`hw:1,0`) can be configured directly.
    pub fn device_command_line_name(&self, device: &str) -> String {
        self.devices()
            .into_iter()
            .find(|(name, _)| name == device)
            .map(|(_, id)| id)
            .unwrap_or_else(|| device.to_string())
    }
}

impl Default for DriverKind {
    fn default() -> Self {
        Self::default_for_platform()
    }
}

impl fmt::Display for DriverKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.pretty_name())
    }
}

/// Parse `/proc/asound/cards` into (card name, `hw:N`)
pub fn parse_asound_cards(contents: &str) -> Vec<(String, String)> {
    contents
        .lines()
        .filter_map(|line| {
            let line = line.trim_start();
            let (index, rest) = line.split_once(' ')?;
            let index: u32 = index.parse().ok()?;
            if !rest.trim_start().starts_with('[') {
                return None;
            }
            let (_, description) = rest.split_once("]: ")?;
            let name = description
                .split_once(" - ")
                .map(|(_, long)| long)
                .unwrap_or(description)
                .trim();
            Some((name.to_string(), format!("hw:{}", index)))
        })
        .collect()
}

// ═══════════════════════════════════════════════════════════════════════════════
// MIDI and dither options
// ═══════════════════════════════════════════════════════════════════════════════

/// A MIDI subsystem jackd can load
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MidiOption {
    pub pretty_name: &'static str,
    pub driver: &'static str,
}

#[cfg(target_os = "linux")]
const MIDI_OPTIONS: &[MidiOption] = &[
    MidiOption {
        pretty_name: "(legacy) ALSA raw devices",
        driver: "raw",
    },
    MidiOption {
        pretty_name: "(legacy) ALSA sequencer",
        driver: "seq",
    },
    MidiOption {
        pretty_name: "ALSA (JACK1, 0.124 and later)",
        driver: "alsa",
    },
    MidiOption {
        pretty_name: "ALSA (JACK2, 1.9.8 and later)",
        driver: "alsarawmidi",
    },
];

#[cfg(target_os = "macos")]
const MIDI_OPTIONS: &[MidiOption] = &[MidiOption {
    pretty_name: "CoreMIDI",
    driver: "coremidi",
}];

#[cfg(windows)]
const MIDI_OPTIONS: &[MidiOption] = &[MidiOption {
    pretty_name: "System MIDI (MME)",
    driver: "winmme",
}];

#[cfg(not(any(target_os = "linux", target_os = "macos", windows)))]
const MIDI_OPTIONS: &[MidiOption] = &[];

impl MidiOption {
    pub fn all() -> &'static [MidiOption] {
        MIDI_OPTIONS
    }

    /// Pretty names, ending with [`MIDI_NONE`]
    pub fn names() -> Vec<&'static str> {
        MIDI_OPTIONS
            .iter()
            .map(|o| o.pretty_name)
            .chain(std::iter::once(MIDI_NONE))
            .collect()
    }

    /// Driver value for a pretty name; `None` disables MIDI
    pub fn driver_for(pretty_name: &str) -> Result<Option<&'static str>, ConfigError> {
        if pretty_name.is_empty() || pretty_name == MIDI_NONE {
            return Ok(None);
        }
        MIDI_OPTIONS
            .iter()
            .find(|o| o.pretty_name == pretty_name)
            .map(|o| Some(o.driver))
            .ok_or_else(|| ConfigError::Unsupported {
                what: "MIDI option",
                value: pretty_name.to_string(),
            })
    }
}

/// ALSA dither modes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DitherMode {
    Triangular,
    Rectangular,
    Shaped,
}

impl DitherMode {
    pub fn command_line_name(&self) -> &'static str {
        match self {
            DitherMode::Triangular => "triangular",
            DitherMode::Rectangular => "rectangular",
            DitherMode::Shaped => "shaped",
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Command line
// ═══════════════════════════════════════════════════════════════════════════════

/// Everything that goes into a jackd invocation
#[derive(Debug, Clone, PartialEq)]
pub struct JackCommandLineOptions {
    pub server_path: String,
    /// Client timeout in ms; 0 means the 200 ms default
    pub timeout: u32,
    pub no_mlock: bool,
    pub ports_max: u32,
    pub realtime: bool,
    /// Realtime priority; 0 keeps jackd's default
    pub priority: i32,
    pub unlock_gui_libs: bool,
    pub verbose: bool,
    pub temporary: bool,
    pub driver: DriverKind,
    pub input_device: String,
    pub output_device: String,
    pub num_periods: u32,
    pub period_size: u32,
    pub sample_rate: u32,
    pub input_channels: u32,
    pub output_channels: u32,
    pub input_latency: u32,
    pub output_latency: u32,
    pub hardware_metering: bool,
    pub hardware_monitoring: bool,
    pub dither_mode: Option<DitherMode>,
    pub force16_bit: bool,
    pub soft_mode: bool,
    /// Driver value from [`MidiOption::driver_for`]
    pub midi_driver: Option<String>,
}

impl Default for JackCommandLineOptions {
    fn default() -> Self {
        Self {
            server_path: default_server_path(),
            timeout: 0,
            no_mlock: false,
            ports_max: 128,
            realtime: true,
            priority: 0,
            unlock_gui_libs: false,
            verbose: false,
            temporary: true,
            driver: DriverKind::default(),
            input_device: String::new(),
            output_device: String::new(),
            num_periods: 2,
            period_size: 1024,
            sample_rate: 48000,
            input_channels: 0,
            output_channels: 0,
            input_latency: 0,
            output_latency: 0,
            hardware_metering: false,
            hardware_monitoring: false,
            dither_mode: None,
            force16_bit: false,
            soft_mode: false,
            midi_driver: None,
        }
    }
}

impl JackCommandLineOptions {
    /// Build the jackd command line
    ///
    /// Arguments containing spaces are double-quoted.
    pub fn to_command_line(&self) -> Result<String, ConfigError> {
        let mut args: Vec<String> = vec![self.server_path.clone()];
        let midi_driver = self.midi_driver.as_deref().filter(|m| !m.is_empty());

        if cfg!(windows) {
            args.push("-S".into());
        }
        // jack2 wants the MIDI system ahead of the audio driver on these platforms
        if cfg!(any(windows, target_os = "macos")) {
            if let Some(midi) = midi_driver {
                args.extend(["-X".to_string(), midi.to_string()]);
            }
        }

        let timeout = if self.timeout == 0 { 200 } else { self.timeout };
        args.extend(["-t".to_string(), timeout.to_string()]);
        if self.no_mlock {
            args.push("-m".into());
        }
        args.extend(["-p".to_string(), self.ports_max.to_string()]);
        if self.realtime {
            args.push("-R".into());
            if self.priority != 0 {
                args.extend(["-P".to_string(), self.priority.to_string()]);
            }
        } else {
            args.push("-r".into());
        }
        if self.unlock_gui_libs {
            args.push("-u".into());
        }
        if self.verbose {
            args.push("-v".into());
        }
        if self.temporary {
            args.push("-T".into());
        }

        let alsa = self.driver == DriverKind::Alsa;
        if alsa {
            match midi_driver {
                Some("alsa") => args.extend(["-X".to_string(), "alsa_midi".to_string()]),
                Some("alsarawmidi") => args.extend(["-X".to_string(), "alsarawmidi".to_string()]),
                _ => {}
            }
        }

        args.extend(["-d".to_string(), self.driver.command_line_name().to_string()]);

        let input = self.device_arg(&self.input_device);
        let output = self.device_arg(&self.output_device);

        if self.driver != DriverKind::Dummy {
            match (&input, &output) {
                (None, None) => {
                    return Err(ConfigError::CommandLine(format!(
                        "{} driver needs an input or output device",
                        self.driver
                    )))
                }
                (None, Some(_)) => args.push("-P".into()),
                (Some(_), None) => args.push("-C".into()),
                (Some(i), Some(o)) if self.input_device != self.output_device => {
                    if !self.driver.supports_two_devices() {
                        return Err(ConfigError::CommandLine(format!(
                            "{} driver cannot use separate capture and playback devices",
                            self.driver
                        )));
                    }
                    args.extend(["-C".to_string(), i.clone(), "-P".to_string(), o.clone()]);
                }
                _ => {}
            }
            if self.input_channels > 0 {
                args.extend(["-i".to_string(), self.input_channels.to_string()]);
            }
            if self.output_channels > 0 {
                args.extend(["-o".to_string(), self.output_channels.to_string()]);
            }
            if self.driver.supports_setting_period_count() {
                args.extend(["-n".to_string(), self.num_periods.to_string()]);
            }
        } else {
            if self.input_channels > 0 {
                args.extend(["-C".to_string(), self.input_channels.to_string()]);
            }
            if self.output_channels > 0 {
                args.extend(["-P".to_string(), self.output_channels.to_string()]);
            }
        }

        args.extend(["-r".to_string(), self.sample_rate.to_string()]);
        args.extend(["-p".to_string(), self.period_size.to_string()]);

        if self.driver.supports_latency_adjustment() {
            if self.input_latency > 0 {
                args.extend(["-I".to_string(), self.input_latency.to_string()]);
            }
            if self.output_latency > 0 {
                args.extend(["-O".to_string(), self.output_latency.to_string()]);
            }
        }

        if self.driver != DriverKind::Dummy
            && self.input_device == self.output_device
            && self.input_device != DEFAULT_DEVICE
        {
            if let Some(device) = input {
                args.extend(["-d".to_string(), device]);
            }
        }

        if alsa {
            if self.hardware_metering {
                args.push("-M".into());
            }
            if self.hardware_monitoring {
                args.push("-H".into());
            }
            if let Some(dither) = self.dither_mode {
                args.extend(["-z".to_string(), dither.command_line_name().to_string()]);
            }
            if self.force16_bit {
                args.push("-S".into());
            }
            if self.soft_mode {
                args.push("-s".into());
            }
            if let Some(midi) = midi_driver.filter(|m| *m != "alsa") {
                args.extend(["-X".to_string(), midi.to_string()]);
            }
        }

        Ok(args
            .iter()
            .map(|arg| {
                if arg.contains(' ') {
                    format!("\"{}\"", arg)
                } else {
                    arg.clone()
                }
            })
            .collect::<Vec<_>>()
            .join(" "))
    }

    fn device_arg(&self, device: &str) -> Option<String> {
        (!device.is_empty()).then(|| self.driver.device_command_line_name(device))
    }
}

/// Expected latency for a period configuration, e.g. `"42.7msec"`
pub fn latency_string(sample_rate: u32, periods: f32, period_size: u32) -> String {
    let ms = (periods * period_size as f32) / (sample_rate as f32 / 1000.0);
    format!("{:.1}msec", ms)
}

// ═══════════════════════════════════════════════════════════════════════════════
// Server binaries and ~/.jackdrc
// ═══════════════════════════════════════════════════════════════════════════════

fn server_names() -> &'static [&'static str] {
    if cfg!(windows) {
        &["jackd.exe"]
    } else {
        &["jackd", "jackdmp"]
    }
}

/// jackd binaries found on `PATH`
pub fn server_paths() -> Vec<PathBuf> {
    let Some(path) = std::env::var_os("PATH") else {
        return Vec::new();
    };
    std::env::split_paths(&path)
        .flat_map(|dir| server_names().iter().map(move |name| dir.join(name)))
        .filter(|candidate| candidate.is_file())
        .collect()
}

/// First jackd on `PATH`, or the bare binary name
pub fn default_server_path() -> String {
    server_paths()
        .first()
        .map(|p| p.to_string_lossy().into_owned())
        .unwrap_or_else(|| server_names()[0].to_string())
}

/// `~/.jackdrc`
pub fn jackdrc_path() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(JACKDRC))
}

/// Store a command line where libjack looks when autostarting a server
pub fn write_jackdrc(path: &Path, command_line: &str) -> Result<()> {
    std::fs::write(path, command_line)
        .with_context(|| format!("Cannot open JACK rc file {:?} to store parameters", path))?;
    log::info!("[JACKD] wrote server command line to {:?}", path);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dummy_options() -> JackCommandLineOptions {
        JackCommandLineOptions {
            server_path: "/usr/bin/jackd".to_string(),
            driver: DriverKind::Dummy,
            ..Default::default()
        }
    }

    #[test]
    fn test_dummy_command_line() {
        let cmd = dummy_options().to_command_line().unwrap();
        assert_eq!(
            cmd,
            "/usr/bin/jackd -t 200 -p 128 -R -T -d dummy -r 48000 -p 1024"
        );
    }

    #[test]
    fn test_dummy_channels_use_capture_playback_flags() {
        let options = JackCommandLineOptions {
            input_channels: 4,
            output_channels: 2,
            ..dummy_options()
        };
        let cmd = options.to_command_line().unwrap();
        assert!(cmd.contains("-d dummy -C 4 -P 2 -r 48000"));
    }

    #[test]
    fn test_alsa_same_device_and_midi() {
        let options = JackCommandLineOptions {
            server_path: "jackd".to_string(),
            driver: DriverKind::Alsa,
            input_device: "hw:1".to_string(),
            output_device: "hw:1".to_string(),
            midi_driver: Some("seq".to_string()),
            realtime: false,
            temporary: false,
            ..Default::default()
        };
        let cmd = options.to_command_line().unwrap();
        assert_eq!(
            cmd,
            "jackd -t 200 -p 128 -r -d alsa -n 2 -r 48000 -p 1024 -d hw:1 -X seq"
        );
    }

    #[test]
    fn test_alsa_seq_midi_goes_before_driver() {
        let options = JackCommandLineOptions {
            server_path: "jackd".to_string(),
            driver: DriverKind::Alsa,
            input_device: "hw:0".to_string(),
            output_device: "hw:0".to_string(),
            midi_driver: Some("alsa".to_string()),
            ..Default::default()
        };
        let cmd = options.to_command_line().unwrap();
        assert!(cmd.contains("-T -X alsa_midi -d alsa"));
        assert!(!cmd.ends_with("-X alsa"));
    }

    #[test]
    fn test_missing_device_rejected() {
        let options = JackCommandLineOptions {
            driver: DriverKind::Alsa,
            ..Default::default()
        };
        assert!(matches!(
            options.to_command_line(),
            Err(ConfigError::CommandLine(_))
        ));
    }

    #[test]
    fn test_split_devices_need_driver_support() {
        let options = JackCommandLineOptions {
            server_path: "jackd".to_string(),
            driver: DriverKind::Ffado,
            input_device: "a".to_string(),
            output_device: "b".to_string(),
            ..Default::default()
        };
        assert!(options.to_command_line().is_err());

        let options = JackCommandLineOptions {
            driver: DriverKind::Oss,
            ..options
        };
        assert!(options
            .to_command_line()
            .unwrap()
            .contains("-d oss -C a -P b"));
    }

    #[test]
    fn test_arguments_with_spaces_are_quoted() {
        let options = JackCommandLineOptions {
            server_path: "/opt/my jack/jackd".to_string(),
            ..dummy_options()
        };
        assert!(options
            .to_command_line()
            .unwrap()
            .starts_with("\"/opt/my jack/jackd\" -t 200"));
    }

    #[test]
    fn test_latency_string() {
        assert_eq!(latency_string(48000, 2.0, 1024), "42.7msec");
        assert_eq!(latency_string(44100, 3.0, 256), "17.4msec");
    }

    #[test]
    fn test_parse_asound_cards() {
        let cards = " 0 [PCH            ]: HDA-Intel - HDA Intel PCH\n\
                     \x20                     HDA Intel PCH at 0xf7f10000 irq 32\n\
                     \x201 [USB            ]: USB-Audio - Scarlett 2i2 USB\n";
        assert_eq!(
            parse_asound_cards(cards),
            vec![
                ("HDA Intel PCH".to_string(), "hw:0".to_string()),
                ("Scarlett 2i2 USB".to_string(), "hw:1".to_string()),
            ]
        );
    }

    #[test]
    fn test_midi_option_lookup() {
        assert_eq!(MidiOption::driver_for(MIDI_NONE), Ok(None));
        assert_eq!(MidiOption::driver_for(""), Ok(None));
        assert!(MidiOption::driver_for("Carrier pigeon").is_err());
        assert_eq!(MidiOption::names().last(), Some(&MIDI_NONE));
    }

    #[test]
    fn test_driver_names_round_trip() {
        for driver in DriverKind::available() {
            assert_eq!(DriverKind::from_pretty_name(driver.pretty_name()), Some(driver));
        }
        assert!(!DriverKind::Dummy.supports_setting_period_count());
        assert!(DriverKind::Alsa.supports_two_devices());
    }

    #[test]
    fn test_write_jackdrc() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".jackdrc");
        write_jackdrc(&path, "jackd -d dummy").unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "jackd -d dummy");
    }
}
