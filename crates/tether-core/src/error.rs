//! Error types for the server connection, port engine and backend

use thiserror::Error;

use crate::types::DataType;

/// Failures talking to the audio server itself
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ServerError {
    /// The server could not be reached or refused the client
    #[error("Audio server unavailable: {0}")]
    Unavailable(String),

    /// The installed server lacks this primitive
    #[error("Not supported by this server: {0}")]
    Unsupported(&'static str),

    /// The server rejected an operation
    #[error("Server rejected {op}: {reason}")]
    Rejected { op: &'static str, reason: String },

    /// The client handle is gone (closed or shut down by the server)
    #[error("Server client is no longer valid")]
    ClientGone,
}

/// Connection lifecycle errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConnectionError {
    #[error("Audio server unreachable: {0}")]
    ServerUnreachable(String),

    #[error("Client name rejected by server: {0}")]
    NameRejected(String),

    #[error("Another open attempt is already in progress")]
    OpenInProgress,

    #[error("Not connected to the audio server")]
    NotConnected,

    #[error("Operation not allowed from the realtime thread")]
    RealtimeThread,

    #[error("Failed to spawn realtime thread: {0}")]
    ThreadSpawn(String),
}

/// Parameter negotiation errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// The value can only be applied by stopping and restarting the engine
    #[error("{0} cannot be changed while running; stop and restart the engine")]
    RestartRequired(&'static str),

    /// The server can never provide this value
    #[error("Unsupported {what}: {value}")]
    Unsupported { what: &'static str, value: String },

    /// Server command line could not be built from the options
    #[error("Invalid server command line: {0}")]
    CommandLine(String),
}

/// Port registration and graph errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PortError {
    #[error("Not connected to the audio server")]
    NotConnected,

    #[error("Port name rejected by server: {0}")]
    Rejected(String),

    #[error("Invalid port name: {0:?}")]
    InvalidName(String),

    #[error("Unknown or unregistered port handle")]
    InvalidHandle,

    #[error("No such port: {0}")]
    NoSuchPort(String),

    #[error("Cannot connect {ours} port to {theirs} port")]
    TypeMismatch { ours: DataType, theirs: DataType },

    #[error("Ports {0} and {1} have the same direction")]
    IncompatibleDirection(String, String),

    #[error("Connection {0} -> {1} failed: {2}")]
    ConnectFailed(String, String, String),

    #[error("Failed to re-establish port {0}")]
    ReestablishFailed(String),
}

/// Realtime MIDI buffer errors (never fatal)
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum MidiError {
    #[error("MIDI buffer full, event dropped")]
    Overflow,

    #[error("MIDI event time {time} precedes previous event at {last}")]
    OutOfOrder { time: u32, last: u32 },

    #[error("MIDI event time {time} outside cycle of {nframes} frames")]
    InvalidTime { time: u32, nframes: u32 },

    #[error("Empty MIDI event")]
    Empty,
}

/// Errors from backend operations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BackendError {
    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Port(#[from] PortError),

    #[error(transparent)]
    Server(#[from] ServerError),

    /// Server refused to activate the realtime callback
    #[error("Cannot activate client: {0}")]
    ActivationFailed(String),

    /// Operation needs a running engine
    #[error("Engine is not running")]
    NotRunning,

    #[error("Thread error: {0}")]
    Thread(String),
}

/// Result type for backend operations
pub type BackendResult<T> = Result<T, BackendError>;

/// Result type for port engine operations
pub type PortResult<T> = Result<T, PortError>;

/// Result type for server boundary operations
pub type ServerResult<T> = Result<T, ServerError>;

impl From<ServerError> for PortError {
    fn from(e: ServerError) -> Self {
        match e {
            ServerError::ClientGone => PortError::NotConnected,
            ServerError::Rejected { reason, .. } => PortError::Rejected(reason),
            other => PortError::Rejected(other.to_string()),
        }
    }
}
