// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Waker integration.
//!
//! `wake()` must be safe to call from any thread, including a signal
//! handler, and must not acquire the `GlobalQueue` mutex inline. A woken
//! task is therefore never pushed straight into a queue from `wake()`
//! itself; instead it's pushed onto a lock-free injection stack that the
//! task's home worker drains at its next tick.

use crate::task::{TaskRef, TaskState};
use std::sync::atomic::{AtomicPtr, Ordering};
use std::sync::{Arc, Weak};
use std::task::{RawWaker, RawWakerVTable, Waker};

/// Lock-free, multi-producer, single-consumer Treiber stack of woken
/// tasks. Pushed to by `wake()` (any thread, signal-handler safe); popped
/// entirely by the home worker at its next safe point.
pub struct InjectionList {
    head: AtomicPtr<Node>,
}

struct Node {
    task: TaskRef,
    next: *mut Node,
}

impl Default for InjectionList {
    fn default() -> Self {
        Self::new()
    }
}

impl InjectionList {
    pub fn new() -> Self {
        Self {
            head: AtomicPtr::new(std::ptr::null_mut()),
        }
    }

    /// Lock-free; allocates one node via the system allocator (the
    /// allocator itself is not signal-handler-safe in general, but this
    /// crate's injection path is only ever driven from `wake()` calls
    /// made by ordinary Waker holders, not from inside the preempt
    /// signal handler itself, which performs no work at all).
    pub fn push(&self, task: TaskRef) {
        let node = Box::into_raw(Box::new(Node {
            task,
            next: std::ptr::null_mut(),
        }));
        let mut head = self.head.load(Ordering::Acquire);
        loop {
            unsafe {
                (*node).next = head;
            }
            match self
                .head
                .compare_exchange_weak(head, node, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return,
                Err(actual) => head = actual,
            }
        }
    }

    /// Drains the entire list, returning tasks in push order (oldest
    /// first) since it's drained as a whole batch rather than one at a
    /// time.
    pub fn drain(&self) -> Vec<TaskRef> {
        let mut head = self.head.swap(std::ptr::null_mut(), Ordering::AcqRel);
        let mut out = Vec::new();
        while !head.is_null() {
            let node = unsafe { Box::from_raw(head) };
            head = node.next;
            out.push(node.task);
        }
        out.reverse();
        out
    }
}

/// The concrete `Wake` implementation bound to one task. Cloned into a
/// `std::task::Waker` and handed to futures via `Context`.
pub struct TaskWaker {
    task: Weak<crate::task::Task>,
    injector: Weak<InjectionList>,
}

impl TaskWaker {
    pub fn new(task: &TaskRef, injector: &Arc<InjectionList>) -> Arc<Self> {
        Arc::new(Self {
            task: Arc::downgrade(task),
            injector: Arc::downgrade(injector),
        })
    }

    pub fn into_std_waker(self: Arc<Self>) -> Waker {
        // `std::task::Wake` would double the refcount through an extra
        // `Arc<dyn Wake>`; building the `RawWaker` by hand keeps a single
        // refcounted allocation and lets `wake_by_ref` avoid cloning.
        let ptr = Arc::into_raw(self) as *const ();
        unsafe { Waker::from_raw(RawWaker::new(ptr, &VTABLE)) }
    }

    fn wake_impl(&self) {
        let Some(task) = self.task.upgrade() else {
            return;
        };
        // Idempotent: waking an already-Runnable (or Running/Completed)
        // task is a no-op. Only a genuine Waiting->Runnable transition
        // proceeds to requeue it.
        if !task.compare_exchange_state(TaskState::Waiting, TaskState::Runnable) {
            return;
        }
        if let Some(injector) = self.injector.upgrade() {
            injector.push(task);
        }
    }
}

unsafe fn clone_raw(ptr: *const ()) -> RawWaker {
    let arc = unsafe { Arc::from_raw(ptr as *const TaskWaker) };
    std::mem::forget(Arc::clone(&arc));
    std::mem::forget(arc);
    RawWaker::new(ptr, &VTABLE)
}

unsafe fn wake_raw(ptr: *const ()) {
    let arc = unsafe { Arc::from_raw(ptr as *const TaskWaker) };
    arc.wake_impl();
}

unsafe fn wake_by_ref_raw(ptr: *const ()) {
    let arc = unsafe { Arc::from_raw(ptr as *const TaskWaker) };
    arc.wake_impl();
    std::mem::forget(arc);
}

unsafe fn drop_raw(ptr: *const ()) {
    drop(unsafe { Arc::from_raw(ptr as *const TaskWaker) });
}

static VTABLE: RawWakerVTable = RawWakerVTable::new(clone_raw, wake_raw, wake_by_ref_raw, drop_raw);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::Task;

    unsafe extern "C" fn noop(_ctx: *mut std::ffi::c_void) {}
    unsafe fn noop_drop(_ptr: *mut std::ffi::c_void) {}

    fn make_task() -> TaskRef {
        unsafe { Task::new(noop, std::ptr::null_mut(), 16 * 1024, 0, noop_drop).unwrap() }
    }

    #[test]
    fn wake_moves_waiting_task_into_injection_list() {
        let task = make_task();
        task.set_state(TaskState::Waiting);
        let injector = Arc::new(InjectionList::new());
        let waker = TaskWaker::new(&task, &injector).into_std_waker();
        waker.wake();
        assert_eq!(task.state(), TaskState::Runnable);
        let drained = injector.drain();
        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0].id(), task.id());
    }

    #[test]
    fn waking_already_runnable_task_is_noop() {
        let task = make_task(); // starts Runnable
        let injector = Arc::new(InjectionList::new());
        let waker = TaskWaker::new(&task, &injector).into_std_waker();
        waker.wake_by_ref();
        assert!(injector.drain().is_empty());
    }
}
