//! Realtime thread helpers
//!
//! Scheduling promotion for threads the in-process server spawns, and the
//! thread-local marker that lets `in_process_thread()` answer without locks.

use std::cell::Cell;
use std::thread::{self, JoinHandle};

use crate::error::{ServerError, ServerResult};
use crate::server::RealtimeTask;

thread_local! {
    static PROCESS_THREAD: Cell<bool> = const { Cell::new(false) };
}

/// Mark the calling thread as one that runs process callbacks
pub fn mark_process_thread() {
    PROCESS_THREAD.with(|flag| flag.set(true));
}

/// True on the server's process thread and on threads spawned via
/// `create_process_thread`
pub fn is_process_thread() -> bool {
    PROCESS_THREAD.with(|flag| flag.get())
}

/// Move the calling thread to SCHED_FIFO at `priority`
///
/// Returns false if the system refused (no rtprio limit, containers). The
/// thread keeps running at normal priority in that case.
#[cfg(target_os = "linux")]
pub fn promote_current_thread(priority: i32) -> bool {
    let param = libc::sched_param {
        sched_priority: priority,
    };
    // SAFETY: pid 0 targets the calling thread; param is a valid sched_param
    let rc = unsafe { libc::sched_setscheduler(0, libc::SCHED_FIFO, &param) };
    if rc != 0 {
        log::debug!(
            "[RT] SCHED_FIFO priority {} refused: {}",
            priority,
            std::io::Error::last_os_error()
        );
        return false;
    }
    true
}

#[cfg(not(target_os = "linux"))]
pub fn promote_current_thread(_priority: i32) -> bool {
    false
}

/// Spawn a named thread, promoted to `priority` before `task` runs
///
/// A `stack_size` of 0 keeps the platform default.
pub fn spawn(
    name: &str,
    stack_size: usize,
    priority: Option<i32>,
    task: RealtimeTask,
) -> ServerResult<JoinHandle<()>> {
    let mut builder = thread::Builder::new().name(name.to_string());
    if stack_size > 0 {
        builder = builder.stack_size(stack_size);
    }
    builder
        .spawn(move || {
            if let Some(priority) = priority {
                promote_current_thread(priority);
            }
            task()
        })
        .map_err(|e| ServerError::Rejected {
            op: "spawn realtime thread",
            reason: e.to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_process_thread_marker_is_per_thread() {
        assert!(!is_process_thread());
        let marked = std::thread::spawn(|| {
            mark_process_thread();
            is_process_thread()
        })
        .join()
        .unwrap();
        assert!(marked);
        assert!(!is_process_thread());
    }

    #[test]
    fn test_spawn_runs_task_with_name() {
        let handle = spawn(
            "rt-test",
            256 * 1024,
            None,
            Box::new(|| {
                assert_eq!(std::thread::current().name(), Some("rt-test"));
            }),
        )
        .unwrap();
        handle.join().unwrap();
    }
}
