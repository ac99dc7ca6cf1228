// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! `JoinHandle<T>`: an affine handle to a spawned task's eventual result,
//! exposed as a Future-based await instead of a blocking thread join.

use crate::error::Error;
use crate::task::{TaskRef, TaskState};
use crate::worker::Shared;
use std::any::Any;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

/// Where a spawned closure's result (or panic payload) lands once the
/// task's entry function returns.
pub struct ResultSlot<T> {
    value: Mutex<Option<std::result::Result<T, Box<dyn Any + Send>>>>,
}

impl<T> Default for ResultSlot<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> ResultSlot<T> {
    pub fn new() -> Self {
        Self {
            value: Mutex::new(None),
        }
    }

    pub fn set(&self, result: std::result::Result<T, Box<dyn Any + Send>>) {
        *self.value.lock().unwrap() = Some(result);
    }

    fn take(&self) -> Option<std::result::Result<T, Box<dyn Any + Send>>> {
        self.value.lock().unwrap().take()
    }
}

/// A handle to a spawned task's eventual result. Affine: dropping an
/// unconsumed handle detaches the task (it keeps running, its result is
/// simply discarded) rather than panicking, since a detached stackful
/// task costs nothing to leave running on its worker.
pub struct JoinHandle<T> {
    task: TaskRef,
    slot: Arc<ResultSlot<T>>,
    shared: Arc<Shared>,
    consumed: AtomicBool,
}

impl<T> JoinHandle<T> {
    pub(crate) fn new(task: TaskRef, slot: Arc<ResultSlot<T>>, shared: Arc<Shared>) -> Self {
        Self {
            task,
            slot,
            shared,
            consumed: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> u64 {
        self.task.id().as_u64()
    }

    /// Requests cancellation. A task parked on a registered fd is forced
    /// back to Runnable immediately; a task Waiting on an externally
    /// held `Waker` observes the flag the next time that Waker fires it
    /// normally.
    pub fn cancel(&self) {
        self.task.cancel();
        crate::worker::cancel_parked_io(&self.shared, &self.task);
    }

    pub fn is_finished(&self) -> bool {
        matches!(
            self.task.state(),
            TaskState::Completed | TaskState::Cancelled
        )
    }
}

impl<T: Unpin> Future for JoinHandle<T> {
    type Output = Result<T, Error>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        match this.task.state() {
            TaskState::Completed => {
                this.consumed.store(true, Ordering::Relaxed);
                match this.slot.take() {
                    Some(Ok(v)) => Poll::Ready(Ok(v)),
                    Some(Err(payload)) => {
                        let msg = panic_message(&payload);
                        Poll::Ready(Err(Error::Fatal(format!("task panicked: {msg}"))))
                    }
                    None => Poll::Ready(Err(Error::Fatal(
                        "task completed without producing a result".into(),
                    ))),
                }
            }
            TaskState::Cancelled => {
                this.consumed.store(true, Ordering::Relaxed);
                Poll::Ready(Err(Error::Cancelled))
            }
            _ => {
                this.task.register_join_waker(cx.waker().clone());
                // Re-check: the task may have completed between the state
                // read above and registering the waker.
                if this.task.state() == TaskState::Completed
                    || this.task.state() == TaskState::Cancelled
                {
                    cx.waker().wake_by_ref();
                }
                Poll::Pending
            }
        }
    }
}

fn panic_message(payload: &Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
