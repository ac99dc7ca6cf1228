// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! The suspension bridge between a Task's stack and the `Future`/`Waker`
//! protocol.
//!
//! `await_future` is what a task's entry function (or anything it calls)
//! uses to wait on a `Future`: poll it once, and if it is not ready,
//! record the task as `Waiting`, hand the future's waker a handle back to
//! this task, and switch back to the worker. The task resumes exactly
//! where it left off once the waker fires and a worker picks it back up.

use crate::task::TaskState;
use crate::waker::TaskWaker;
use std::future::Future;
use std::pin::pin;
use std::task::{Context, Poll, Wake, Waker};

/// Polls `future` to completion from inside a running task, suspending the
/// task (via a real stack switch) on every `Pending`.
///
/// # Panics
/// Panics if called from a thread that is not currently executing a task
/// (i.e. outside `Runtime::spawn`'d work).
pub fn await_future<F: Future>(future: F) -> F::Output {
    let task = crate::worker::current_task().expect("await_future called outside a task");
    let shared = crate::worker::current_shared().expect("await_future called outside a worker");
    let injector = shared.injectors[task.home_worker()].clone();
    let waker = TaskWaker::new(&task, &injector).into_std_waker();
    let mut cx = Context::from_waker(&waker);

    let mut future = pin!(future);
    loop {
        match future.as_mut().poll(&mut cx) {
            Poll::Ready(v) => return v,
            Poll::Pending => {
                // SAFETY: called from within a task's own execution, on
                // its own stack, which is exactly `suspend_current`'s
                // contract.
                unsafe { crate::worker::suspend_current(TaskState::Waiting) };
                // Cancellation is observed at this resume point;
                // `await_future` itself keeps polling regardless; callers
                // that need a typed Cancelled result check
                // `task.is_cancelled()` via the JoinHandle path rather
                // than through this free function.
            }
        }
    }
}

/// Runs `future` to completion on the calling thread without requiring it
/// to be one of the runtime's worker threads. Parks the OS thread between
/// polls rather than busy-spinning, using `std::thread::park` driven by a
/// `Waker` that unparks it — the same pattern small single-threaded
/// executors commonly use for a thread-local `block_on`.
pub fn block_on_current_thread<F: Future>(future: F) -> F::Output {
    struct ThreadWaker(std::thread::Thread);

    impl Wake for ThreadWaker {
        fn wake(self: std::sync::Arc<Self>) {
            self.0.unpark();
        }
        fn wake_by_ref(self: &std::sync::Arc<Self>) {
            self.0.unpark();
        }
    }

    let waker: Waker = std::sync::Arc::new(ThreadWaker(std::thread::current())).into();
    let mut cx = Context::from_waker(&waker);
    let mut future = pin!(future);
    loop {
        match future.as_mut().poll(&mut cx) {
            Poll::Ready(v) => return v,
            Poll::Pending => std::thread::park(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::future::Future;
    use std::pin::Pin;
    use std::task::Poll;

    struct ReadyAfter(u32);

    impl Future for ReadyAfter {
        type Output = u32;
        fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<u32> {
            if self.0 == 0 {
                Poll::Ready(42)
            } else {
                self.0 -= 1;
                cx.waker().wake_by_ref();
                Poll::Pending
            }
        }
    }

    #[test]
    fn block_on_drives_future_to_completion() {
        let v = block_on_current_thread(ReadyAfter(3));
        assert_eq!(v, 42);
    }
}
