//! RT-safe reclamation for data shared with the realtime thread
//!
//! The live port table is published as a `basedrop::Shared` snapshot. When the
//! control thread swaps in a new table, the realtime thread may still hold the
//! old one for the rest of its cycle. Dropping that last reference on the
//! realtime thread only enqueues a pointer; the actual free happens on the
//! collector thread started here.
//!
//! ```ignore
//! use basedrop::Shared;
//! use crate::gc::gc_handle;
//!
//! let table = Shared::new(&gc_handle(), PortTable::default());
//! ```

use basedrop::{Collector, Handle};
use std::sync::mpsc;
use std::sync::OnceLock;
use std::thread;
use std::time::Duration;

/// Interval between collection passes
const COLLECT_INTERVAL: Duration = Duration::from_millis(100);

static GC_HANDLE: OnceLock<Handle> = OnceLock::new();

fn init_gc() -> Handle {
    let (tx, rx) = mpsc::channel();

    // The collector is !Sync, so it lives and dies on its own thread
    let spawned = thread::Builder::new()
        .name("tether-gc".to_string())
        .spawn(move || {
            let mut collector = Collector::new();
            if tx.send(collector.handle()).is_err() {
                return;
            }
            log::debug!("[GC] collector thread started");
            loop {
                collector.collect();
                thread::sleep(COLLECT_INTERVAL);
            }
        });

    match spawned.ok().and_then(|_| rx.recv().ok()) {
        Some(handle) => handle,
        None => {
            log::error!("[GC] collector thread unavailable, retired snapshots will leak");
            let collector: &'static Collector = Box::leak(Box::new(Collector::new()));
            collector.handle()
        }
    }
}

/// Handle for creating `Shared<T>` allocations
pub fn gc_handle() -> Handle {
    GC_HANDLE.get_or_init(init_gc).clone()
}

#[cfg(test)]
mod tests {
    use super::*;
    use basedrop::Shared;

    #[test]
    fn test_shared_outlives_original_owner() {
        let value = Shared::new(&gc_handle(), vec![0.0f32; 1024]);
        let clone = value.clone();
        drop(value);
        assert_eq!(clone.len(), 1024);
    }
}
