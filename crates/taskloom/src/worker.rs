// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Worker (Processor): one worker thread per OS thread, running the
//! fetch-dispatch main loop.
//!
//! A worker is the only thing that ever resumes a task (switches onto its
//! stack) and the only thing a task's own suspend/finish calls can safely
//! assume is listening on the other end of the stack switch. That
//! assumption is tracked with two thread-locals: which `Worker` owns this
//! OS thread, and a pointer to the `Context` the worker's own execution is
//! parked in while a task runs.

use crate::arch::{self, Context};
use crate::config::RuntimeConfig;
use crate::global_queue::{GlobalQueue, GLOBAL_POLL_INTERVAL};
use crate::poller::{Poller, WakeFn};
use crate::queue::LocalQueue;
use crate::task::{Task, TaskRef, TaskState};
use crate::waker::InjectionList;
use std::cell::{Cell, RefCell};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

thread_local! {
    static CURRENT_WORKER: Cell<*const Worker> = const { Cell::new(std::ptr::null()) };
    static WORKER_RETURN_CTX: Cell<*mut Context> = const { Cell::new(std::ptr::null_mut()) };
    /// An owned clone of the task currently executing on this OS thread,
    /// if any. Holding a real `Arc` (rather than a raw pointer) lets the
    /// suspend/await helpers build a `Weak<Task>`-backed `Waker` safely.
    static CURRENT_TASK: RefCell<Option<TaskRef>> = const { RefCell::new(None) };
}

/// Shared scheduler state visible to every worker (the peer queues, the
/// overflow queue, the poller, and shutdown bookkeeping).
pub struct Shared {
    pub local_queues: Vec<Arc<LocalQueue>>,
    pub injectors: Vec<Arc<InjectionList>>,
    pub global: Arc<GlobalQueue>,
    pub poller: Arc<Poller>,
    pub active_tasks: AtomicUsize,
    pub shutdown: AtomicBool,
    pub wake_condvar: Condvar,
    pub wake_mutex: Mutex<()>,
}

/// What a worker is doing right now, sampled by the `PreemptTimer`
/// without synchronizing with the worker itself beyond these atomics.
struct RunningSlot {
    task: Mutex<Option<TaskRef>>,
    pthread: AtomicUsize,
}

pub struct Worker {
    pub index: usize,
    pub shared: Arc<Shared>,
    running: RunningSlot,
    tick: AtomicUsize,
    stack_size: usize,
}

impl Worker {
    pub fn new(index: usize, shared: Arc<Shared>, stack_size: usize) -> Arc<Self> {
        Arc::new(Self {
            index,
            shared,
            running: RunningSlot {
                task: Mutex::new(None),
                pthread: AtomicUsize::new(0),
            },
            tick: AtomicUsize::new(0),
            stack_size,
        })
    }

    fn local(&self) -> &LocalQueue {
        &self.shared.local_queues[self.index]
    }

    fn injector(&self) -> &InjectionList {
        &self.shared.injectors[self.index]
    }

    /// Schedule a task onto this worker's home queue, falling back to the
    /// GlobalQueue if the local queue is full.
    pub fn enqueue_home(shared: &Shared, home: usize, task: TaskRef) {
        task.set_state(TaskState::Runnable);
        let home = home.min(shared.local_queues.len() - 1);
        if let Err(task) = shared.local_queues[home].push(task) {
            shared.global.push(task);
        }
        let _guard = shared.wake_mutex.lock().unwrap();
        shared.wake_condvar.notify_all();
    }

    fn drain_injections(&self) {
        for task in self.injector().drain() {
            if let Err(task) = self.local().push(task) {
                self.shared.global.push(task);
            }
        }
    }

    /// Runs the worker's main loop until shutdown is requested and all
    /// work has drained.
    pub fn run(self: &Arc<Self>) {
        crate::preempt::install_signal_handler();
        self.running
            .pthread
            .store(unsafe { libc::pthread_self() } as usize, Ordering::Relaxed);
        CURRENT_WORKER.with(|c| c.set(Arc::as_ptr(self)));
        tracing::info!(worker = self.index, "worker started");

        let wake_fn: WakeFn = {
            let shared = Arc::clone(&self.shared);
            Box::new(move |task: TaskRef| {
                let home = task.home_worker();
                Worker::enqueue_home(&shared, home, task);
            })
        };

        loop {
            self.drain_injections();

            // Step 1: safe-point exit if this worker's own task asked to
            // preempt itself; handled inline inside `run_task` instead,
            // since only the task itself can observe its flag at a
            // checkpoint. Here we just check whether shutdown is done.
            if self.shared.shutdown.load(Ordering::Acquire) {
                self.drain_remaining_and_exit();
                return;
            }

            // Step 2: periodic global-queue drain for fairness.
            if self.tick.fetch_add(1, Ordering::Relaxed) % GLOBAL_POLL_INTERVAL == 0 {
                let batch = self.shared.global.pop_batch(self.local().size().max(1));
                for t in batch {
                    if let Err(t) = self.local().push(t) {
                        self.shared.global.push(t);
                        break;
                    }
                }
            }

            // Step 3: local pop.
            if let Some(task) = self.local().pop() {
                self.run_task(task);
                continue;
            }

            // Step 4: steal from a random peer.
            if let Some(task) = self.try_steal() {
                self.run_task(task);
                continue;
            }

            // Step 5: block on the poller.
            self.poll_or_park(&wake_fn);
        }
    }

    fn try_steal(&self) -> Option<TaskRef> {
        let n = self.shared.local_queues.len();
        if n <= 1 {
            return None;
        }
        let mut rng = xorshift_seed(self.index as u64 + 1);
        for _ in 0..(n - 1) {
            let victim = (xorshift_next(&mut rng) as usize) % n;
            if victim == self.index {
                continue;
            }
            let stolen = self.local().steal_half_from(&self.shared.local_queues[victim]);
            if !stolen.is_empty() {
                let mut iter = stolen.into_iter();
                let first = iter.next();
                for t in iter {
                    let _ = self.local().push(t);
                }
                tracing::trace!(worker = self.index, victim, "steal succeeded");
                return first;
            }
        }
        None
    }

    fn poll_or_park(&self, wake_fn: &WakeFn) {
        if let Ok(n) = self.shared.poller.wait(Some(Duration::from_millis(5)), wake_fn) {
            if n > 0 {
                return;
            }
        }
        if !self.local().is_empty() || !self.shared.global.is_empty() {
            return;
        }
        let guard = self.shared.wake_mutex.lock().unwrap();
        let _ = self
            .shared
            .wake_condvar
            .wait_timeout(guard, Duration::from_millis(5))
            .unwrap();
    }

    fn drain_remaining_and_exit(&self) {
        for task in self.local().drain_all() {
            task.cancel();
            self.shared.active_tasks.fetch_sub(1, Ordering::AcqRel);
        }
        tracing::info!(worker = self.index, "worker stopped");
    }

    /// Execute one task on this worker thread: set it Running, record the
    /// start timestamp, switch onto its stack, and resume the worker's
    /// own execution once the task yields, blocks, or completes.
    fn run_task(&self, task: TaskRef) {
        if task.is_cancelled() {
            task.set_state(TaskState::Cancelled);
            task.release_stack();
            task.wake_joiners();
            self.shared.active_tasks.fetch_sub(1, Ordering::AcqRel);
            return;
        }

        task.mark_running();
        *self.running.task.lock().unwrap() = Some(Arc::clone(&task));

        let mut worker_ctx = Context::default();
        WORKER_RETURN_CTX.with(|c| c.set(&mut worker_ctx as *mut Context));
        CURRENT_TASK.with(|c| *c.borrow_mut() = Some(Arc::clone(&task)));

        let task_ctx_ptr = task.ctx_ptr();
        // SAFETY: `task_ctx_ptr` was produced by `arch::init_stack` (fresh
        // task) or a previous `switch` (resumed task); `worker_ctx` is a
        // valid, currently-unused `Context` on this thread's own stack
        // that nothing else touches until `switch` returns here.
        unsafe {
            arch::switch(&mut worker_ctx as *mut Context, task_ctx_ptr);
        }

        CURRENT_TASK.with(|c| *c.borrow_mut() = None);
        *self.running.task.lock().unwrap() = None;

        // The task switched back to us; find out why by inspecting the
        // state it left itself in.
        match task.state() {
            TaskState::Runnable => {
                // Explicit yield or a preempt safe-point exit: requeue at
                // the tail of this worker's LocalQueue.
                if let Err(task) = self.local().push(task) {
                    self.shared.global.push(task);
                }
            }
            TaskState::Waiting => {
                // The task parked itself on a Future/Poller; ownership now
                // belongs to whatever Waker or Poller registration it
                // arranged before switching back. Nothing to enqueue.
            }
            TaskState::Completed | TaskState::Cancelled => {
                task.release_stack();
                task.wake_joiners();
                self.shared.active_tasks.fetch_sub(1, Ordering::AcqRel);
            }
            TaskState::Running => {
                unreachable!("a task cannot switch back to its worker while still Running");
            }
        }
    }
}

/// Forces a task parked in the Poller back to Runnable: a task Waiting on
/// a registered fd has no other way to observe a cancellation, since
/// nothing will wake it unless the kernel reports readiness. A task
/// Waiting on an externally-held `Waker` needs no equivalent push here —
/// it will observe the flag at its next ordinary wake.
pub(crate) fn cancel_parked_io(shared: &Shared, task: &TaskRef) {
    if let Some(io_wait) = task.io_wait() {
        if let Ok(t) = shared.poller.deregister(io_wait.fd) {
            Worker::enqueue_home(shared, t.home_worker(), t);
        }
    }
}

pub(crate) fn running_task(worker: &Worker) -> Option<TaskRef> {
    worker.running.task.lock().unwrap().clone()
}

pub(crate) fn pthread_of(worker: &Worker) -> libc::pthread_t {
    worker.running.pthread.load(Ordering::Relaxed) as libc::pthread_t
}

/// The index of whichever worker owns this OS thread, if the calling
/// thread is currently running a worker's main loop. Used by `spawn` to
/// home a newly spawned task onto its spawning worker's `LocalQueue`,
/// falling back to round-robin when spawn is called from an ordinary
/// application thread instead.
pub(crate) fn current_worker_index() -> Option<usize> {
    CURRENT_WORKER.with(|c| {
        let ptr = c.get();
        if ptr.is_null() {
            None
        } else {
            // SAFETY: see `current_shared`.
            Some(unsafe { &*ptr }.index)
        }
    })
}

/// The `Shared` scheduler state for whichever worker owns this OS thread,
/// if the calling thread is currently running a worker's main loop.
pub(crate) fn current_shared() -> Option<Arc<Shared>> {
    CURRENT_WORKER.with(|c| {
        let ptr = c.get();
        if ptr.is_null() {
            None
        } else {
            // SAFETY: the `Arc<Worker>` that produced this pointer is kept
            // alive by the thread closure's own local for the entire
            // lifetime of `Worker::run`, which is the only thing that
            // sets `CURRENT_WORKER` on this thread.
            Some(Arc::clone(&unsafe { &*ptr }.shared))
        }
    })
}

fn xorshift_seed(seed: u64) -> u64 {
    seed.wrapping_mul(0x9E3779B97F4A7C15).max(1)
}

fn xorshift_next(state: &mut u64) -> u64 {
    let mut x = *state;
    x ^= x << 13;
    x ^= x >> 7;
    x ^= x << 17;
    *state = x;
    x
}

/// Called by the trampoline immediately after the first switch onto a
/// fresh task's stack, before running the user entry function.
///
/// # Safety
/// Must only be called from within the trampoline, on the task's own
/// stack, with `task` pointing at the `Task` currently being entered.
pub(crate) unsafe fn enter_task(_task: *const Task) {
    // Nothing to do today beyond what `Worker::run_task` already set up
    // before the switch; kept as an explicit hook so future entry-time
    // bookkeeping (e.g. per-task TLS resets) has a home without touching
    // the arch layer.
}

/// Suspends the currently-running task, recording `state` before
/// switching back to the worker. Called by the higher-level `await`
/// helpers in [`crate::future`] on `Pending`, and by [`crate::yield_now`].
///
/// # Safety
/// Must only be called from code running on a task's own stack (i.e.
/// from within that task's entry function or something it calls).
pub(crate) unsafe fn suspend_current(state: TaskState) {
    let task = current_task().expect("suspend called outside a task");
    task.set_state(state);

    let worker_ctx_ptr = WORKER_RETURN_CTX.with(|c| c.get());
    arch::switch(task.ctx_ptr(), worker_ctx_ptr);
    // Resumed: whichever worker performed the resuming switch already set
    // this thread's CURRENT_TASK/WORKER_RETURN_CTX before switching in.
}

/// Returns an owned reference to the task currently executing on this OS
/// thread, if any.
pub fn current_task() -> Option<TaskRef> {
    CURRENT_TASK.with(|c| c.borrow().clone())
}

/// Called by the trampoline once the user entry function returns: marks
/// the task Completed and switches back to the worker for the last time.
pub(crate) unsafe fn finish_current() -> ! {
    let task = current_task().expect("finish called outside a task");
    task.set_state(TaskState::Completed);

    let worker_ctx_ptr = WORKER_RETURN_CTX.with(|c| c.get());
    // Scratch context: this stack is about to be torn down by the worker
    // (`release_stack` runs right after the switch below observes
    // Completed), so there is nowhere meaningful to save "old" into. A
    // throwaway on-stack `Context` is fine since it is never read again.
    let mut discard = Context::default();
    arch::switch(&mut discard as *mut Context, worker_ctx_ptr);
    unreachable!("a completed task's stack must never be resumed");
}
