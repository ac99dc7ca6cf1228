// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! `TaskShared<T>`: closure-based shared/exclusive access, an
//! `RwLock`-shaped wrapper where a contended reader or writer parks the
//! calling Task instead of blocking an OS thread, the same way
//! `TaskMutex` parks on exclusive contention.

use std::future::Future;
use std::pin::Pin;
use std::sync::Mutex;
use std::task::{Context, Poll, Waker};

struct State<T> {
    readers: usize,
    writer: bool,
    value: T,
    waiters: Vec<Waker>,
}

pub struct TaskShared<T> {
    state: Mutex<State<T>>,
}

impl<T> TaskShared<T> {
    pub fn new(value: T) -> Self {
        Self {
            state: Mutex::new(State {
                readers: 0,
                writer: false,
                value,
                waiters: Vec::new(),
            }),
        }
    }

    pub fn read<F, R>(&self, f: F) -> ReadFuture<'_, T, F>
    where
        F: FnOnce(&T) -> R,
    {
        ReadFuture {
            shared: self,
            f: Some(f),
        }
    }

    pub fn write<F, R>(&self, f: F) -> WriteFuture<'_, T, F>
    where
        F: FnOnce(&mut T) -> R,
    {
        WriteFuture {
            shared: self,
            f: Some(f),
        }
    }

    fn wake_all_waiters(state: &mut State<T>) {
        for w in state.waiters.drain(..) {
            w.wake();
        }
    }
}

pub struct ReadFuture<'a, T, F> {
    shared: &'a TaskShared<T>,
    f: Option<F>,
}

impl<T, F, R> Future for ReadFuture<'_, T, F>
where
    F: FnOnce(&T) -> R,
{
    type Output = R;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<R> {
        let this = self.get_mut();
        let mut state = this.shared.state.lock().unwrap();
        if state.writer {
            state.waiters.push(cx.waker().clone());
            return Poll::Pending;
        }
        state.readers += 1;
        let f = this.f.take().expect("ReadFuture polled after Ready");
        let r = f(&state.value);
        state.readers -= 1;
        if state.readers == 0 {
            TaskShared::wake_all_waiters(&mut state);
        }
        Poll::Ready(r)
    }
}

pub struct WriteFuture<'a, T, F> {
    shared: &'a TaskShared<T>,
    f: Option<F>,
}

impl<T, F, R> Future for WriteFuture<'_, T, F>
where
    F: FnOnce(&mut T) -> R,
{
    type Output = R;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<R> {
        let this = self.get_mut();
        let mut state = this.shared.state.lock().unwrap();
        if state.writer || state.readers > 0 {
            state.waiters.push(cx.waker().clone());
            return Poll::Pending;
        }
        state.writer = true;
        let f = this.f.take().expect("WriteFuture polled after Ready");
        let r = f(&mut state.value);
        state.writer = false;
        TaskShared::wake_all_waiters(&mut state);
        Poll::Ready(r)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::future::block_on_current_thread;

    #[test]
    fn write_then_read_sees_update() {
        let s = TaskShared::new(vec![1, 2, 3]);
        block_on_current_thread(s.write(|v| v.push(4)));
        let len = block_on_current_thread(s.read(|v| v.len()));
        assert_eq!(len, 4);
    }

    #[test]
    fn concurrent_readers_do_not_block_each_other() {
        let s = TaskShared::new(10);
        let a = block_on_current_thread(s.read(|v| *v));
        let b = block_on_current_thread(s.read(|v| *v));
        assert_eq!((a, b), (10, 10));
    }
}
