// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Bounded MPMC channel, built atop the Future/Waker protocol rather than
//! an OS-thread-blocking channel: a `Mutex<VecDeque<T>>` plus two waker
//! lists (blocked senders, blocked receivers) so a full send or an empty
//! recv parks the calling Task instead of blocking its OS thread.

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll, Waker};

struct Inner<T> {
    queue: VecDeque<T>,
    capacity: usize,
    senders_live: usize,
    receivers_live: usize,
    send_wakers: Vec<Waker>,
    recv_wakers: Vec<Waker>,
}

struct Channel<T> {
    inner: Mutex<Inner<T>>,
}

/// Construct a bounded channel. `capacity` must be at least 1.
pub fn bounded<T>(capacity: usize) -> (Sender<T>, Receiver<T>) {
    assert!(capacity >= 1, "channel capacity must be at least 1");
    let chan = Arc::new(Channel {
        inner: Mutex::new(Inner {
            queue: VecDeque::with_capacity(capacity),
            capacity,
            senders_live: 1,
            receivers_live: 1,
            send_wakers: Vec::new(),
            recv_wakers: Vec::new(),
        }),
    });
    (
        Sender {
            chan: Arc::clone(&chan),
        },
        Receiver { chan },
    )
}

/// Error returned when every receiver (for `send`) or every sender (for
/// `recv`) has been dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Closed;

pub struct Sender<T> {
    chan: Arc<Channel<T>>,
}

impl<T> Clone for Sender<T> {
    fn clone(&self) -> Self {
        self.chan.inner.lock().unwrap().senders_live += 1;
        Self {
            chan: Arc::clone(&self.chan),
        }
    }
}

impl<T> Drop for Sender<T> {
    fn drop(&mut self) {
        let mut inner = self.chan.inner.lock().unwrap();
        inner.senders_live -= 1;
        if inner.senders_live == 0 {
            for w in inner.recv_wakers.drain(..) {
                w.wake();
            }
        }
    }
}

impl<T> Sender<T> {
    pub fn send(&self, value: T) -> SendFuture<'_, T> {
        SendFuture {
            chan: &self.chan,
            value: Some(value),
        }
    }
}

pub struct Receiver<T> {
    chan: Arc<Channel<T>>,
}

impl<T> Clone for Receiver<T> {
    fn clone(&self) -> Self {
        self.chan.inner.lock().unwrap().receivers_live += 1;
        Self {
            chan: Arc::clone(&self.chan),
        }
    }
}

impl<T> Drop for Receiver<T> {
    fn drop(&mut self) {
        let mut inner = self.chan.inner.lock().unwrap();
        inner.receivers_live -= 1;
        if inner.receivers_live == 0 {
            for w in inner.send_wakers.drain(..) {
                w.wake();
            }
        }
    }
}

impl<T> Receiver<T> {
    pub fn recv(&self) -> RecvFuture<'_, T> {
        RecvFuture { chan: &self.chan }
    }
}

pub struct SendFuture<'a, T> {
    chan: &'a Channel<T>,
    value: Option<T>,
}

impl<T: Unpin> Future for SendFuture<'_, T> {
    type Output = Result<(), Closed>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let mut inner = this.chan.inner.lock().unwrap();
        if inner.receivers_live == 0 {
            return Poll::Ready(Err(Closed));
        }
        if inner.queue.len() < inner.capacity {
            inner.queue.push_back(this.value.take().expect("SendFuture polled after Ready"));
            if let Some(w) = inner.recv_wakers.pop() {
                w.wake();
            }
            return Poll::Ready(Ok(()));
        }
        inner.send_wakers.push(cx.waker().clone());
        Poll::Pending
    }
}

pub struct RecvFuture<'a, T> {
    chan: &'a Channel<T>,
}

impl<T> Future for RecvFuture<'_, T> {
    type Output = Result<T, Closed>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut inner = self.chan.inner.lock().unwrap();
        if let Some(v) = inner.queue.pop_front() {
            if let Some(w) = inner.send_wakers.pop() {
                w.wake();
            }
            return Poll::Ready(Ok(v));
        }
        if inner.senders_live == 0 {
            return Poll::Ready(Err(Closed));
        }
        inner.recv_wakers.push(cx.waker().clone());
        Poll::Pending
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::future::block_on_current_thread;

    #[test]
    fn send_then_recv_round_trips() {
        let (tx, rx) = bounded::<u32>(1);
        block_on_current_thread(tx.send(7)).unwrap();
        let v = block_on_current_thread(rx.recv()).unwrap();
        assert_eq!(v, 7);
    }

    #[test]
    fn recv_on_closed_empty_channel_errs() {
        let (tx, rx) = bounded::<u32>(1);
        drop(tx);
        let err = block_on_current_thread(rx.recv());
        assert_eq!(err, Err(Closed));
    }

    #[test]
    fn send_past_capacity_blocks_until_drained() {
        let (tx, rx) = bounded::<u32>(1);
        block_on_current_thread(tx.send(1)).unwrap();
        let tx2 = tx.clone();
        let handle = std::thread::spawn(move || {
            block_on_current_thread(tx2.send(2)).unwrap();
        });
        std::thread::sleep(std::time::Duration::from_millis(20));
        assert_eq!(block_on_current_thread(rx.recv()).unwrap(), 1);
        handle.join().unwrap();
        assert_eq!(block_on_current_thread(rx.recv()).unwrap(), 2);
    }
}
