// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Work-stealing async task runtime with signal-assisted preemption.
//!
//! A multi-producer scheduler: one `LocalQueue` per worker thread, a
//! shared `GlobalQueue` for overflow and fairness, work-stealing between
//! peers, a `PreemptTimer` that flags long-running tasks and interrupts
//! them with a signal, and an epoll-backed `Poller` that parks tasks on
//! file descriptor readiness. Tasks run on their own stack (switched to
//! directly, not polled from the top), so ordinary blocking-looking code
//! can suspend deep inside a call stack via [`future::await_future`].
//!
//! Components:
//! - [`task`]          — the Task struct, state machine, stack ownership
//! - [`queue`]         — `LockFreeDeque<N>` + `LocalQueue`
//! - [`global_queue`]  — the mutex-guarded overflow `GlobalQueue`
//! - [`worker`]        — per-thread fetch-dispatch scheduler loop
//! - [`poller`]        — epoll-based I/O readiness
//! - [`io`]            — async_read/async_write/async_connect facade
//! - [`preempt`]       — the signal-assisted quantum supervisor
//! - [`waker`]         — the `Future`/`Waker` integration, injection list
//! - [`runtime`]       — `Runtime`: spawn/block_on/shutdown
//! - [`config`]        — `RuntimeConfig`, environment variable overrides
//! - [`channel`], [`mutex`], [`shared`], [`select`], [`timeout`] — higher-
//!   level primitives built only on `Future`/`Waker`

pub mod arch;
pub mod cancel;
pub mod channel;
pub mod config;
pub mod error;
pub mod future;
pub mod global_queue;
pub mod handle;
pub mod io;
pub mod mutex;
pub mod poller;
pub mod preempt;
pub mod queue;
pub mod runtime;
pub mod select;
pub mod shared;
pub mod stack;
pub mod task;
pub mod timeout;
pub mod waker;
pub mod worker;

pub use config::RuntimeConfig;
pub use error::{Error, Result};
pub use future::await_future;
pub use handle::JoinHandle;
pub use runtime::Runtime;
pub use task::{TaskId, TaskState};

use std::ffi::c_void;

/// Spawns `f` on the process-wide default [`Runtime`], lazily constructing
/// it from the environment on first use.
pub fn spawn<F, T>(f: F) -> JoinHandle<T>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    Runtime::default_runtime().spawn(f)
}

/// Relinquishes the current worker, re-enqueuing the calling Task at the
/// tail of its `LocalQueue`.
///
/// # Panics
/// Panics if called from a thread that is not currently executing a Task.
pub fn yield_now() {
    runtime::Runtime::yield_now_inner();
}

/// Runs `future` to completion on the calling thread, which need not be
/// one of the runtime's worker threads.
pub fn block_on<F: std::future::Future>(future: F) -> F::Output {
    future::block_on_current_thread(future)
}

/// Raw entry-fn/context spawn: the low-level path higher layers (an
/// interpreter, a C ABI shim) use instead of the typed `spawn<F, T>` when
/// they already have a function pointer and an opaque context rather than
/// a Rust closure.
///
/// # Safety
/// `context` must remain valid until `invocation_drop` is called, and
/// `entry` must not unwind across the FFI boundary.
pub unsafe fn spawn_raw(
    entry: task::EntryFn,
    context: *mut c_void,
    stack_size: Option<usize>,
    invocation_drop: unsafe fn(*mut c_void),
) -> std::io::Result<task::TaskRef> {
    Runtime::default_runtime().spawn_raw(entry, context, stack_size, invocation_drop)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn default_runtime_spawns_and_runs() {
        let sum = Arc::new(AtomicUsize::new(0));
        let mut handles = Vec::new();
        for i in 0..100 {
            let sum = Arc::clone(&sum);
            handles.push(spawn(move || {
                sum.fetch_add(i, Ordering::Relaxed);
            }));
        }
        for h in handles {
            let _ = block_on(h);
        }
        assert_eq!(sum.load(Ordering::Relaxed), (0..100).sum::<usize>());
    }
}
