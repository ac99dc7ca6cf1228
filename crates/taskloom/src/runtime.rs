// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! `Runtime`: constructs workers, the `Poller`, the `PreemptTimer`,
//! and the `GlobalQueue`, and exposes `spawn`/`block_on`/`shutdown`.

use crate::config::RuntimeConfig;
use crate::error::{Error, Result};
use crate::global_queue::GlobalQueue;
use crate::handle::{JoinHandle, ResultSlot};
use crate::poller::Poller;
use crate::preempt::{PreemptSource, PreemptTimer};
use crate::queue::LocalQueue;
use crate::task::{Task, TaskRef, TaskState};
use crate::waker::InjectionList;
use crate::worker::{Shared, Worker};
use std::any::Any;
use std::ffi::c_void;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, OnceLock};
use std::thread::JoinHandle as ThreadJoinHandle;
use std::time::Duration;

struct WorkerTable(Vec<Arc<Worker>>);

impl PreemptSource for WorkerTable {
    fn worker_count(&self) -> usize {
        self.0.len()
    }

    fn current_task(&self, idx: usize) -> Option<TaskRef> {
        crate::worker::running_task(&self.0[idx])
    }

    fn thread_id(&self, idx: usize) -> Option<libc::pthread_t> {
        Some(crate::worker::pthread_of(&self.0[idx]))
    }
}

pub struct Runtime {
    shared: Arc<Shared>,
    workers: Mutex<Vec<Arc<Worker>>>,
    threads: Mutex<Vec<ThreadJoinHandle<()>>>,
    preempt: PreemptTimer,
    next_home: AtomicUsize,
    stack_size: usize,
}

static DEFAULT_RUNTIME: OnceLock<Arc<Runtime>> = OnceLock::new();

impl Runtime {
    /// Constructs a runtime with `config.workers` worker threads. Rejects
    /// a zero-worker configuration.
    pub fn new(config: RuntimeConfig) -> Result<Arc<Self>> {
        if config.workers == 0 {
            return Err(Error::ZeroWorkers);
        }

        let n = config.workers;
        let mut local_queues = Vec::with_capacity(n);
        let mut injectors = Vec::with_capacity(n);
        for _ in 0..n {
            local_queues.push(Arc::new(LocalQueue::new()));
            injectors.push(Arc::new(InjectionList::new()));
        }

        let shared = Arc::new(Shared {
            local_queues,
            injectors,
            global: Arc::new(GlobalQueue::new()),
            poller: Arc::new(Poller::new()?),
            active_tasks: AtomicUsize::new(0),
            shutdown: std::sync::atomic::AtomicBool::new(false),
            wake_condvar: Condvar::new(),
            wake_mutex: Mutex::new(()),
        });

        let workers: Vec<Arc<Worker>> = (0..n)
            .map(|i| Worker::new(i, Arc::clone(&shared), config.stack_size))
            .collect();

        let mut threads = Vec::with_capacity(n);
        for w in &workers {
            let w = Arc::clone(w);
            threads.push(
                std::thread::Builder::new()
                    .name(format!("taskloom-worker-{}", w.index))
                    .spawn(move || w.run())
                    .expect("failed to spawn worker thread"),
            );
        }

        let source = Arc::new(WorkerTable(workers.clone()));
        let preempt = PreemptTimer::spawn(config.quantum, source);

        tracing::info!(workers = n, quantum_ms = config.quantum.as_millis(), "runtime constructed");

        Ok(Arc::new(Self {
            shared,
            workers: Mutex::new(workers),
            threads: Mutex::new(threads),
            preempt,
            next_home: AtomicUsize::new(0),
            stack_size: config.stack_size,
        }))
    }

    pub fn from_env() -> Result<Arc<Self>> {
        Self::new(RuntimeConfig::from_env())
    }

    /// The process-wide default runtime, lazily constructed on first use.
    /// Panics only if construction itself fails (e.g. the poller's
    /// epoll_create1 fails).
    pub fn default_runtime() -> Arc<Self> {
        Arc::clone(DEFAULT_RUNTIME.get_or_init(|| {
            Self::from_env().expect("failed to construct the default taskloom runtime")
        }))
    }

    /// A spawn homes onto the spawning worker's own LocalQueue when called
    /// from within a running task; a spawn from an ordinary application
    /// thread has no such affinity, so it round-robins across workers.
    fn pick_home(&self) -> usize {
        if let Some(idx) = crate::worker::current_worker_index() {
            return idx;
        }
        let n = self.shared.local_queues.len();
        self.next_home.fetch_add(1, Ordering::Relaxed) % n
    }

    /// Low-level spawn: the opaque entry-fn/context contract.
    ///
    /// # Safety
    /// `context` must remain valid until `invocation_drop` is called;
    /// `entry` must not unwind across the FFI boundary.
    pub unsafe fn spawn_raw(
        &self,
        entry: crate::task::EntryFn,
        context: *mut c_void,
        stack_size: Option<usize>,
        invocation_drop: unsafe fn(*mut c_void),
    ) -> std::io::Result<TaskRef> {
        let home = self.pick_home();
        let task = Task::new(
            entry,
            context,
            stack_size.unwrap_or(self.stack_size),
            home,
            invocation_drop,
        )?;
        self.shared.active_tasks.fetch_add(1, Ordering::AcqRel);
        Worker::enqueue_home(&self.shared, home, Arc::clone(&task));
        Ok(task)
    }

    /// Typed spawn: runs `f` to completion on a fresh task and makes its
    /// result available through the returned [`JoinHandle`].
    pub fn spawn<F, T>(&self, f: F) -> JoinHandle<T>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        struct Invocation<F, T> {
            f: Option<F>,
            slot: Arc<ResultSlot<T>>,
        }

        unsafe extern "C" fn invoke_shim<F, T>(ctx: *mut c_void)
        where
            F: FnOnce() -> T + Send + 'static,
            T: Send + 'static,
        {
            let inv = &mut *(ctx as *mut Invocation<F, T>);
            let f = inv.f.take().expect("entry invoked twice");
            let result: std::result::Result<T, Box<dyn Any + Send>> =
                catch_unwind(AssertUnwindSafe(f));
            inv.slot.set(result);
        }

        unsafe fn drop_shim<F, T>(ctx: *mut c_void) {
            drop(Box::from_raw(ctx as *mut Invocation<F, T>));
        }

        let slot = Arc::new(ResultSlot::new());
        let invocation = Box::new(Invocation {
            f: Some(f),
            slot: Arc::clone(&slot),
        });
        let ctx = Box::into_raw(invocation) as *mut c_void;

        // SAFETY: `ctx` is a live `Box<Invocation<F, T>>` pointer;
        // `drop_shim::<F, T>` matches its exact layout and is the only
        // thing ever used to free it.
        let task = unsafe {
            self.spawn_raw(invoke_shim::<F, T>, ctx, None, drop_shim::<F, T>)
                .expect("failed to allocate task stack")
        };

        JoinHandle::new(task, slot, Arc::clone(&self.shared))
    }

    /// Relinquishes the worker; re-enqueues the current task at the tail
    /// of its LocalQueue.
    pub fn yield_now_inner() {
        // SAFETY: only valid while running on a task's own stack, which
        // is the only caller `yield_now` (the public free function) has.
        unsafe { crate::worker::suspend_current(TaskState::Runnable) };
    }

    /// Runs `future` to completion on the calling thread, which does not
    /// need to be one of the runtime's worker threads. Uses a
    /// thread-parking waker rather than making the calling thread join
    /// the steal loop, since the calling thread may be an ordinary
    /// application thread with its own stack and unrelated responsibilities.
    pub fn block_on<F: std::future::Future>(&self, future: F) -> F::Output {
        crate::future::block_on_current_thread(future)
    }

    /// Signals all workers to drain and stop, waiting up to `deadline`
    /// for queues to empty before forcing an exit.
    pub fn shutdown(&self, deadline: Duration) {
        tracing::info!("runtime shutdown requested");
        let start = std::time::Instant::now();
        while self.shared.active_tasks.load(Ordering::Acquire) > 0 && start.elapsed() < deadline {
            std::thread::sleep(Duration::from_millis(1));
        }
        self.shared.shutdown.store(true, Ordering::Release);
        self.shared.poller.request_shutdown();
        {
            let _guard = self.shared.wake_mutex.lock().unwrap();
            self.shared.wake_condvar.notify_all();
        }
        for t in self.threads.lock().unwrap().drain(..) {
            let _ = t.join();
        }
        self.preempt.shutdown();
        self.workers.lock().unwrap().clear();
    }

    pub fn active_tasks(&self) -> usize {
        self.shared.active_tasks.load(Ordering::Relaxed)
    }

    pub fn worker_count(&self) -> usize {
        self.shared.local_queues.len()
    }

    /// `(pushed, popped, stolen)` lifetime counters for worker `idx`'s
    /// LocalQueue, exposed for fairness/overflow tests and diagnostics.
    pub fn local_queue_stats(&self, idx: usize) -> (usize, usize, usize) {
        let stats = self.shared.local_queues[idx].stats();
        (
            stats.pushed.load(Ordering::Relaxed),
            stats.popped.load(Ordering::Relaxed),
            stats.stolen.load(Ordering::Relaxed),
        )
    }

    /// Current advisory length of the overflow GlobalQueue.
    pub fn global_queue_len(&self) -> usize {
        self.shared.global.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;

    #[test]
    fn zero_workers_is_rejected() {
        let cfg = RuntimeConfig {
            workers: 0,
            ..RuntimeConfig::default()
        };
        assert!(matches!(Runtime::new(cfg), Err(Error::ZeroWorkers)));
    }

    #[test]
    fn spawn_runs_and_shutdown_drains() {
        let rt = Runtime::new(RuntimeConfig {
            workers: 2,
            ..RuntimeConfig::default()
        })
        .unwrap();
        let ran = Arc::new(AtomicBool::new(false));
        let ran2 = Arc::clone(&ran);
        let _handle = rt.spawn(move || {
            ran2.store(true, Ordering::SeqCst);
            42
        });
        rt.shutdown(Duration::from_secs(2));
        assert!(ran.load(Ordering::SeqCst));
    }
}
