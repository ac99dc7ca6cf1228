// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! `TaskMutex<T>`: closure-based exclusive access where a contended lock
//! parks the calling Task instead of blocking an OS thread. No guard type
//! exists to escape the closure, keeping the locked region textually
//! obvious at the call site.

use std::future::Future;
use std::pin::Pin;
use std::sync::Mutex;
use std::task::{Context, Poll, Waker};

struct State<T> {
    locked: bool,
    value: T,
    waiters: Vec<Waker>,
}

pub struct TaskMutex<T> {
    state: Mutex<State<T>>,
}

impl<T> TaskMutex<T> {
    pub fn new(value: T) -> Self {
        Self {
            state: Mutex::new(State {
                locked: false,
                value,
                waiters: Vec::new(),
            }),
        }
    }

    /// Runs `f` with exclusive access once the lock is acquired. Parks
    /// (suspends the Task) rather than spinning while contended.
    pub fn lock<F, R>(&self, f: F) -> LockFuture<'_, T, F>
    where
        F: FnOnce(&mut T) -> R,
    {
        LockFuture {
            mutex: self,
            f: Some(f),
        }
    }

    /// Non-blocking variant: runs `f` immediately if uncontended, else
    /// returns `None` without parking.
    pub fn try_lock<F, R>(&self, f: F) -> Option<R>
    where
        F: FnOnce(&mut T) -> R,
    {
        let mut state = self.state.lock().unwrap();
        if state.locked {
            return None;
        }
        state.locked = true;
        let r = f(&mut state.value);
        state.locked = false;
        let waiter = state.waiters.pop();
        drop(state);
        if let Some(w) = waiter {
            w.wake();
        }
        Some(r)
    }
}

pub struct LockFuture<'a, T, F> {
    mutex: &'a TaskMutex<T>,
    f: Option<F>,
}

impl<T, F, R> Future for LockFuture<'_, T, F>
where
    F: FnOnce(&mut T) -> R,
{
    type Output = R;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<R> {
        let this = self.get_mut();
        let mut state = this.mutex.state.lock().unwrap();
        if state.locked {
            state.waiters.push(cx.waker().clone());
            return Poll::Pending;
        }
        state.locked = true;
        let f = this.f.take().expect("LockFuture polled after Ready");
        let r = f(&mut state.value);
        state.locked = false;
        let waiter = state.waiters.pop();
        drop(state);
        if let Some(w) = waiter {
            w.wake();
        }
        Poll::Ready(r)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::future::block_on_current_thread;
    use std::sync::Arc;

    #[test]
    fn exclusive_access_mutates_in_place() {
        let m = Arc::new(TaskMutex::new(0));
        block_on_current_thread(m.lock(|v| *v += 1));
        block_on_current_thread(m.lock(|v| *v += 1));
        let seen = block_on_current_thread(m.lock(|v| *v));
        assert_eq!(seen, 2);
    }

    #[test]
    fn try_lock_fails_while_contended() {
        let m = TaskMutex::new(0);
        let _ = m.try_lock(|v| *v += 1);
        assert_eq!(m.try_lock(|v| *v), Some(1));
    }
}
