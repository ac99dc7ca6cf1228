// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! `PreemptTimer`: the signal-assisted cooperative preemption supervisor.
//!
//! Runs on its own thread, sampling each worker's currently-executing task
//! once per quantum. It never touches task state or stacks directly — it
//! only sets the atomic preempt flag and, where the platform supports it,
//! raises a signal at the worker thread so a blocking syscall the worker
//! is stuck in returns early and the worker reaches its next safe point.

use crate::task::TaskRef;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

/// Signal used to interrupt a worker thread blocked in a syscall.
/// `SIGUSR1` is reserved by this crate for that sole purpose; a host
/// process must not install its own handler for it on worker threads.
pub const PREEMPT_SIGNAL: libc::c_int = libc::SIGUSR1;

/// A snapshot source the timer polls once per quantum: one entry per
/// worker, holding whatever task that worker is currently running (if
/// any), its OS thread id for signalling, and when it started running.
pub trait PreemptSource: Send + Sync {
    fn worker_count(&self) -> usize;
    /// Returns the task currently `Running` on worker `idx`, if any.
    fn current_task(&self, idx: usize) -> Option<TaskRef>;
    /// Returns the pthread id of worker `idx`, for signalling.
    fn thread_id(&self, idx: usize) -> Option<libc::pthread_t>;
}

pub struct PreemptTimer {
    handle: Mutex<Option<JoinHandle<()>>>,
    shutdown: Arc<AtomicBool>,
}

extern "C" fn preempt_signal_handler(_sig: libc::c_int) {
    // Deliberately does nothing. Its only job is to interrupt whatever
    // blocking syscall the worker thread is in (EINTR) so the worker
    // returns to its main loop and observes the preempt flag there.
}

/// Installs the no-op handler for [`PREEMPT_SIGNAL`] on the calling
/// thread's process-wide disposition. Idempotent; safe to call from every
/// worker at startup.
pub fn install_signal_handler() {
    unsafe {
        let mut action: libc::sigaction = std::mem::zeroed();
        action.sa_sigaction = preempt_signal_handler as usize;
        libc::sigemptyset(&mut action.sa_mask);
        action.sa_flags = 0;
        libc::sigaction(PREEMPT_SIGNAL, &action, std::ptr::null_mut());
    }
}

impl PreemptTimer {
    pub fn spawn(quantum: Duration, source: Arc<dyn PreemptSource>) -> Self {
        let shutdown = Arc::new(AtomicBool::new(false));
        let shutdown2 = Arc::clone(&shutdown);
        let handle = std::thread::Builder::new()
            .name("taskloom-preempt".into())
            .spawn(move || run(quantum, source, shutdown2))
            .expect("failed to spawn preempt timer thread");
        Self {
            handle: Mutex::new(Some(handle)),
            shutdown,
        }
    }

    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
        if let Some(handle) = self.handle.lock().unwrap().take() {
            let _ = handle.join();
        }
    }
}

impl Drop for PreemptTimer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run(quantum: Duration, source: Arc<dyn PreemptSource>, shutdown: Arc<AtomicBool>) {
    while !shutdown.load(Ordering::Acquire) {
        std::thread::sleep(quantum);
        for idx in 0..source.worker_count() {
            let Some(task) = source.current_task(idx) else {
                continue;
            };
            let now = crate::task::Task::now_ns();
            let started = task.start_ns();
            if started != 0 && now.saturating_sub(started) > quantum.as_nanos() as u64 {
                task.request_preempt();
                tracing::debug!(task = task.id().as_u64(), worker = idx, "preempt flag set");
                if let Some(tid) = source.thread_id(idx) {
                    unsafe {
                        libc::pthread_kill(tid, PREEMPT_SIGNAL);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    struct FakeSource {
        tasks: StdMutex<Vec<Option<TaskRef>>>,
    }

    impl PreemptSource for FakeSource {
        fn worker_count(&self) -> usize {
            self.tasks.lock().unwrap().len()
        }
        fn current_task(&self, idx: usize) -> Option<TaskRef> {
            self.tasks.lock().unwrap()[idx].clone()
        }
        fn thread_id(&self, _idx: usize) -> Option<libc::pthread_t> {
            None
        }
    }

    unsafe extern "C" fn noop(_ctx: *mut std::ffi::c_void) {}
    unsafe fn noop_drop(_ptr: *mut std::ffi::c_void) {}

    #[test]
    fn sets_preempt_flag_after_overrun() {
        let task = unsafe {
            crate::task::Task::new(noop, std::ptr::null_mut(), 16 * 1024, 0, noop_drop).unwrap()
        };
        task.mark_running();
        let source = Arc::new(FakeSource {
            tasks: StdMutex::new(vec![Some(task.clone())]),
        });
        let timer = PreemptTimer::spawn(Duration::from_millis(5), source);
        std::thread::sleep(Duration::from_millis(60));
        timer.shutdown();
        assert!(task.take_preempt());
    }
}
