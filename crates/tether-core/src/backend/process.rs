//! Realtime wrapper around the host callback

use std::sync::atomic::Ordering;
use std::sync::Arc;

use super::state::EngineShared;
use crate::port_engine::{Cycle, CycleResult, LiveTable};
use crate::rt;
use crate::server::{ProcessHandler, ProcessStatus};
use crate::types::Frames;

/// Installed with the server on activation
///
/// Holds only the shared atomics and the live port table, never the backend,
/// so the server's reference cannot keep the backend alive.
pub(crate) struct RtProcess {
    shared: Arc<EngineShared>,
    live: Arc<LiveTable>,
}

impl RtProcess {
    pub fn new(shared: Arc<EngineShared>, live: Arc<LiveTable>) -> Self {
        Self { shared, live }
    }
}

impl ProcessHandler for RtProcess {
    fn process(&mut self, nframes: Frames) -> ProcessStatus {
        // Servers may run cycles on more than one thread
        rt::mark_process_thread();
        if !self.shared.state().is_processing() || self.shared.stop_requested.load(Ordering::Acquire) {
            return ProcessStatus::Continue;
        }

        // One read of the size per cycle; the server's count wins if it is
        // smaller (a resize still in flight)
        let current = self.shared.buffer_size.load(Ordering::Acquire);
        if current != 0 && nframes > current {
            // Grown before the resize notice arrived: the host cannot fill
            // this cycle, so it goes out silent
            Cycle::begin(&self.live, nframes).silence_outputs();
            return ProcessStatus::Continue;
        }
        let nframes = if current == 0 { nframes } else { nframes.min(current) };
        if nframes == 0 {
            return ProcessStatus::Continue;
        }

        let Ok(mut host) = self.shared.host.try_lock() else {
            return ProcessStatus::Continue;
        };
        let Some(callback) = host.as_mut() else {
            return ProcessStatus::Continue;
        };

        let mut cycle = Cycle::begin(&self.live, nframes);
        match callback(&mut cycle) {
            CycleResult::Continue => ProcessStatus::Continue,
            CycleResult::Fatal => {
                self.shared.stop_requested.store(true, Ordering::Release);
                ProcessStatus::Quit
            }
        }
    }
}
