// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Task: the unit of scheduled work.
//!
//! A Task owns a real OS stack and is resumed by switching the CPU's stack
//! pointer and callee-saved registers onto it ([`crate::arch`]), not by
//! polling a `Future` directly. The entry function the task runs is the
//! opaque `extern "C" fn(*mut c_void)` contract; suspension inside that
//! entry happens by calling back into the scheduler (see
//! [`crate::worker::suspend_current`]), which itself polls a `Future` and,
//! on `Pending`, performs the stack switch back to the worker thread. This
//! is the concrete shape of "Futures plus Task-owned stacks" — no
//! language-level coroutine construct.

use crate::arch::{self, Context};
use crate::cancel::CancelToken;
use crate::poller::Interest;
use crate::stack::TaskStack;
use std::cell::UnsafeCell;
use std::ffi::c_void;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::task::Waker;
use std::time::Instant;

/// 64-bit monotonically increasing task identity, unique within a runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(u64);

impl TaskId {
    fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        TaskId(NEXT.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

/// `Task` state machine. Transitions only along the edges
/// Runnable -> Running -> {Runnable, Waiting, Completed, Cancelled};
/// Waiting -> Runnable; Runnable/Waiting -> Cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TaskState {
    Runnable = 0,
    Running = 1,
    Waiting = 2,
    Completed = 3,
    Cancelled = 4,
}

impl TaskState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => TaskState::Runnable,
            1 => TaskState::Running,
            2 => TaskState::Waiting,
            3 => TaskState::Completed,
            4 => TaskState::Cancelled,
            _ => unreachable!("invalid TaskState byte {v}"),
        }
    }
}

/// A task's pending I/O registration: exactly one Poller owns it while set.
#[derive(Debug, Clone, Copy)]
pub struct IoWait {
    pub fd: RawFd,
    pub interest: Interest,
}

fn epoch() -> Instant {
    static EPOCH: OnceLock<Instant> = OnceLock::new();
    *EPOCH.get_or_init(Instant::now)
}

/// Entry contract: a raw function pointer plus an opaque context the
/// runtime never interprets.
pub type EntryFn = unsafe extern "C" fn(*mut c_void);

/// Unit of scheduled work. Always handled behind an `Arc` (`TaskRef`) so
/// ownership can move between a queue slot, an executing worker, a
/// Poller registration, or an externally-held `Waker` without copying.
pub struct Task {
    id: TaskId,
    state: AtomicU8,
    /// Saved register context when not `Running`. Exclusive-ownership is
    /// the scheduler's invariant: at most one site reads or writes this at
    /// a time, so plain interior mutability suffices and no lock is needed
    /// on the hot resume path.
    ctx: UnsafeCell<Context>,
    stack: Mutex<Option<TaskStack>>,
    io_wait: Mutex<Option<IoWait>>,
    preempt_flag: AtomicBool,
    start_ns: AtomicU64,
    /// Index into the runtime's worker table this task prefers to land on
    /// when woken (its "home" worker).
    home_worker: AtomicUsize,
    cancel: CancelToken,
    join_wakers: Mutex<Vec<Waker>>,
    /// Heap allocation backing the entry closure, reclaimed once the
    /// trampoline has handed control to the user entry function. Boxed as
    /// `c_void` so `Task` itself stays generic-free.
    invocation: Mutex<Option<*mut c_void>>,
    invocation_drop: unsafe fn(*mut c_void),
}

// SAFETY: `ctx` is only ever touched by whichever single site currently
// owns the task (worker thread running it, or the thread performing a
// resume), matching the exclusive-ownership invariant documented on
// `Task` above.
unsafe impl Sync for Task {}
unsafe impl Send for Task {}

/// Shared handle to a task. Always behind `Arc` per the "never shared by
/// copy" ownership rule — clones just add a reference, never a second
/// logical owner.
pub type TaskRef = Arc<Task>;

impl Task {
    /// Construct a new task with a freshly allocated stack primed to run
    /// `entry(context)` on its first resume, and record it as homed on
    /// `home_worker`.
    ///
    /// # Safety
    /// `context` must be a valid pointer for as long as `entry` needs it;
    /// `invocation_drop` must correctly free whatever `context` points to
    /// (called once, after the entry function returns or the task is
    /// dropped unrun).
    pub unsafe fn new(
        entry: EntryFn,
        context: *mut c_void,
        stack_size: usize,
        home_worker: usize,
        invocation_drop: unsafe fn(*mut c_void),
    ) -> std::io::Result<TaskRef> {
        let stack = TaskStack::new(stack_size)?;
        let boot = Box::into_raw(Box::new(TaskBoot {
            entry,
            context,
            task: std::ptr::null(),
        })) as *mut c_void;

        let ctx = arch::init_stack(stack.top(), boot, trampoline_entry);

        let task = Arc::new(Task {
            id: TaskId::next(),
            state: AtomicU8::new(TaskState::Runnable as u8),
            ctx: UnsafeCell::new(ctx),
            stack: Mutex::new(Some(stack)),
            io_wait: Mutex::new(None),
            preempt_flag: AtomicBool::new(false),
            start_ns: AtomicU64::new(0),
            home_worker: AtomicUsize::new(home_worker),
            cancel: CancelToken::new(),
            join_wakers: Mutex::new(Vec::new()),
            invocation: Mutex::new(Some(context)),
            invocation_drop,
        });

        // Patch the boot record with the Task's own address so the
        // trampoline can find it again after the first switch.
        let boot_ptr = boot as *mut TaskBoot;
        (*boot_ptr).task = Arc::as_ptr(&task);

        Ok(task)
    }

    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn state(&self) -> TaskState {
        TaskState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn set_state(&self, state: TaskState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// Attempt `from -> to`; returns whether it happened.
    pub(crate) fn compare_exchange_state(&self, from: TaskState, to: TaskState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub(crate) fn ctx_ptr(&self) -> *mut Context {
        self.ctx.get()
    }

    pub fn home_worker(&self) -> usize {
        self.home_worker.load(Ordering::Relaxed)
    }

    pub(crate) fn set_home_worker(&self, idx: usize) {
        self.home_worker.store(idx, Ordering::Relaxed);
    }

    pub(crate) fn mark_running(&self) {
        self.set_state(TaskState::Running);
        self.start_ns
            .store(epoch().elapsed().as_nanos() as u64, Ordering::Relaxed);
    }

    /// Nanoseconds since this task last began running; read by the
    /// `PreemptTimer`.
    pub(crate) fn start_ns(&self) -> u64 {
        self.start_ns.load(Ordering::Relaxed)
    }

    pub(crate) fn now_ns() -> u64 {
        epoch().elapsed().as_nanos() as u64
    }

    pub fn request_preempt(&self) {
        self.preempt_flag.store(true, Ordering::Release);
    }

    /// Observed by the task's own cooperative checkpoints; clears the flag
    /// once observed.
    pub fn take_preempt(&self) -> bool {
        self.preempt_flag.swap(false, Ordering::AcqRel)
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub(crate) fn set_io_wait(&self, wait: Option<IoWait>) {
        *self.io_wait.lock().unwrap() = wait;
    }

    pub(crate) fn io_wait(&self) -> Option<IoWait> {
        *self.io_wait.lock().unwrap()
    }

    /// Release the stack once the task is Completed or Cancelled and no
    /// waiter references it. Idempotent.
    pub(crate) fn release_stack(&self) {
        self.stack.lock().unwrap().take();
    }

    pub(crate) fn register_join_waker(&self, waker: Waker) {
        self.join_wakers.lock().unwrap().push(waker);
    }

    pub(crate) fn wake_joiners(&self) {
        for waker in self.join_wakers.lock().unwrap().drain(..) {
            waker.wake();
        }
    }

    fn take_invocation(&self) -> Option<*mut c_void> {
        self.invocation.lock().unwrap().take()
    }
}

impl Drop for Task {
    fn drop(&mut self) {
        if let Some(ptr) = self.take_invocation() {
            // SAFETY: `invocation_drop` was supplied by the typed spawn
            // wrapper that allocated this context and knows its layout.
            unsafe { (self.invocation_drop)(ptr) };
        }
    }
}

/// Payload written onto a fresh stack by [`Task::new`] and read back by
/// [`trampoline_entry`] on the first switch into the task.
struct TaskBoot {
    entry: EntryFn,
    context: *mut c_void,
    task: *const Task,
}

/// The non-naked half of the trampoline: called with the raw `TaskBoot`
/// pointer restored from the arch layer's callee-saved register, runs the
/// user entry function to completion, then hands control to
/// [`crate::worker::finish_current`].
///
/// # Safety
/// Must only be reached via the arch layer's naked shim immediately after
/// a stack switch onto a stack primed by [`Task::new`].
pub(crate) unsafe extern "C" fn trampoline_entry(boot_ptr: *mut c_void) -> ! {
    let boot = Box::from_raw(boot_ptr as *mut TaskBoot);
    let TaskBoot {
        entry,
        context,
        task,
    } = *boot;

    crate::worker::enter_task(task);
    entry(context);
    crate::worker::finish_current();
}
