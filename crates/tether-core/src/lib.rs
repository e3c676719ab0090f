//! Tether Core - realtime audio server backend and port engine

pub mod backend;
pub mod config;
pub mod connection;
pub mod error;
pub mod gc;
pub mod jackd;
pub mod midi;
pub mod port_engine;
pub mod registry;
pub mod rt;
pub mod server;
mod sync;
pub mod types;

pub use backend::{AudioBackend, AudioParameters, EngineEvent, EngineState, MidiSendKind};
pub use connection::Connection;
pub use error::{BackendError, BackendResult};
pub use port_engine::{Cycle, CycleResult, PortBuffer, PortEngine, PortHandle};
pub use registry::{AudioBackendInfo, BackendDescriptor};
pub use types::*;
