// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! `sleep` / `timeout`, backed by a single shared timer-wheel thread
//! rather than one OS thread per timer — a necessity once timers are
//! expected to be cheap enough for ordinary Task code to use freely.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, OnceLock};
use std::task::{Context, Poll, Waker};
use std::time::{Duration, Instant};

struct Entry {
    deadline: Instant,
    id: u64,
    fired: Arc<AtomicBool>,
    waker: Mutex<Option<Waker>>,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.id == other.id
    }
}
impl Eq for Entry {}
impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for Entry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.deadline.cmp(&other.deadline).then(self.id.cmp(&other.id))
    }
}

struct Wheel {
    heap: Mutex<BinaryHeap<Reverse<Arc<Entry>>>>,
    condvar: Condvar,
}

fn wheel() -> &'static Wheel {
    static WHEEL: OnceLock<Wheel> = OnceLock::new();
    WHEEL.get_or_init(|| {
        let wheel = Wheel {
            heap: Mutex::new(BinaryHeap::new()),
            condvar: Condvar::new(),
        };
        std::thread::Builder::new()
            .name("taskloom-timer".into())
            .spawn(timer_thread_main)
            .expect("failed to spawn timer wheel thread");
        wheel
    })
}

// The wheel itself is constructed lazily but the background thread needs
// a `&'static Wheel` too; route it through the same OnceLock by having
// the thread call `wheel()` once it starts, after the initializer above
// has returned and published the value.
fn timer_thread_main() {
    loop {
        let w = wheel();
        let mut heap = w.heap.lock().unwrap();
        loop {
            match heap.peek() {
                None => {
                    let (guard, _) = w
                        .condvar
                        .wait_timeout(heap, Duration::from_millis(100))
                        .unwrap();
                    heap = guard;
                }
                Some(Reverse(entry)) => {
                    let now = Instant::now();
                    if entry.deadline <= now {
                        let entry = heap.pop().unwrap().0;
                        drop(heap);
                        entry.fired.store(true, Ordering::Release);
                        if let Some(w) = entry.waker.lock().unwrap().take() {
                            w.wake();
                        }
                        heap = w.heap.lock().unwrap();
                    } else {
                        let wait = entry.deadline - now;
                        let (guard, _) = w.condvar.wait_timeout(heap, wait).unwrap();
                        heap = guard;
                    }
                }
            }
        }
    }
}

fn next_id() -> u64 {
    static NEXT: AtomicU64 = AtomicU64::new(1);
    NEXT.fetch_add(1, Ordering::Relaxed)
}

/// A future that resolves once `duration` has elapsed.
pub struct Sleep {
    entry: Arc<Entry>,
    registered: bool,
    duration: Duration,
}

pub fn sleep(duration: Duration) -> Sleep {
    Sleep {
        entry: Arc::new(Entry {
            deadline: Instant::now() + duration,
            id: next_id(),
            fired: Arc::new(AtomicBool::new(false)),
            waker: Mutex::new(None),
        }),
        registered: false,
        duration,
    }
}

impl Future for Sleep {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        let this = self.get_mut();
        if this.entry.fired.load(Ordering::Acquire) {
            return Poll::Ready(());
        }
        *this.entry.waker.lock().unwrap() = Some(cx.waker().clone());
        if !this.registered {
            this.registered = true;
            let w = wheel();
            w.heap.lock().unwrap().push(Reverse(Arc::clone(&this.entry)));
            w.condvar.notify_one();
        }
        let _ = this.duration;
        Poll::Pending
    }
}

/// Races `future` against a `duration` timer; the first to complete wins
/// and the other is simply dropped.
pub async fn timeout<F: Future>(duration: Duration, future: F) -> Result<F::Output, Elapsed> {
    futures_race(future, sleep(duration)).await
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Elapsed;

async fn futures_race<F: Future>(future: F, timer: Sleep) -> Result<F::Output, Elapsed> {
    use std::pin::pin;
    let mut future = pin!(future);
    let mut timer = pin!(timer);
    std::future::poll_fn(move |cx| {
        if let Poll::Ready(v) = future.as_mut().poll(cx) {
            return Poll::Ready(Ok(v));
        }
        if let Poll::Ready(()) = timer.as_mut().poll(cx) {
            return Poll::Ready(Err(Elapsed));
        }
        Poll::Pending
    })
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::future::block_on_current_thread;

    #[test]
    fn sleep_resolves_after_duration() {
        let start = Instant::now();
        block_on_current_thread(sleep(Duration::from_millis(20)));
        assert!(start.elapsed() >= Duration::from_millis(15));
    }

    #[test]
    fn timeout_wins_when_future_never_resolves() {
        let never = std::future::pending::<()>();
        let result = block_on_current_thread(timeout(Duration::from_millis(10), never));
        assert_eq!(result, Err(Elapsed));
    }
}
