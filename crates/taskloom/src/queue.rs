// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! `LockFreeDeque<N>` and its `LocalQueue` wrapper.
//!
//! Single-producer/multi-consumer ring buffer: only the owning worker may
//! `push`/`pop` (both operate on the queue's own ends, tail and head
//! respectively), while any thread may `steal` from the head. Grounded on
//! the head/tail-with-bitmask shape tokio's local run queue uses, simplified
//! to plain (non-packed) atomic counters since this queue is not shared
//! across a steal-in-progress/real-half split.

use crate::task::TaskRef;
use std::cell::UnsafeCell;
use std::mem::MaybeUninit;

#[cfg(not(loom))]
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
#[cfg(loom)]
use loom::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

/// Fixed-capacity, power-of-two-sized lock-free deque of `TaskRef` slots.
pub struct LockFreeDeque<const N: usize> {
    head: AtomicU64,
    tail: AtomicU64,
    slots: Box<[UnsafeCell<MaybeUninit<Option<TaskRef>>>]>,
}

// SAFETY: slot access is guarded by the head/tail protocol documented on
// each method; concurrent accessors never touch the same slot index.
unsafe impl<const N: usize> Sync for LockFreeDeque<N> {}

const fn check_pow2(n: usize) {
    assert!(n > 0 && n & (n - 1) == 0, "LockFreeDeque capacity must be a power of two");
}

impl<const N: usize> LockFreeDeque<N> {
    pub fn new() -> Self {
        check_pow2(N);
        let mut slots = Vec::with_capacity(N);
        for _ in 0..N {
            slots.push(UnsafeCell::new(MaybeUninit::new(None)));
        }
        Self {
            head: AtomicU64::new(0),
            tail: AtomicU64::new(0),
            slots: slots.into_boxed_slice(),
        }
    }

    const fn mask() -> u64 {
        (N - 1) as u64
    }

    /// May only be called by the owning worker.
    pub fn push(&self, t: TaskRef) -> Result<(), TaskRef> {
        let tail = self.tail.load(Ordering::Acquire);
        let next = tail.wrapping_add(1);
        let head = self.head.load(Ordering::Acquire);
        if next.wrapping_sub(head) > N as u64 {
            return Err(t);
        }
        let idx = (tail & Self::mask()) as usize;
        // SAFETY: only the owning worker writes this slot; the previous
        // occupant (if any) was already cleared by the matching pop/steal.
        unsafe {
            (*self.slots[idx].get()).write(Some(t));
        }
        self.tail.store(next, Ordering::Release);
        Ok(())
    }

    /// May only be called by the owning worker.
    pub fn pop(&self) -> Option<TaskRef> {
        let head = self.head.load(Ordering::Acquire);
        let tail = self.tail.load(Ordering::Acquire);
        if head == tail {
            return None;
        }
        let idx = (head & Self::mask()) as usize;
        // SAFETY: `head` is exclusively advanced by the owner (this
        // method); the slot at `head` was written by a prior `push` and
        // not yet consumed, since `head != tail`.
        let value = unsafe { (*self.slots[idx].get()).assume_init_mut().take() };
        self.head.store(head.wrapping_add(1), Ordering::Release);
        value
    }

    /// May be called by any thread.
    pub fn steal(&self) -> Option<TaskRef> {
        let old_head = self.head.fetch_add(1, Ordering::AcqRel);
        let tail = self.tail.load(Ordering::Acquire);
        if old_head >= tail {
            // Revert. Safe without a CAS loop: only thieves fetch_add head,
            // and a thief only reverts when its own increment raced past
            // tail, which means no other successful steal could have
            // claimed this slot in between (that would have required tail
            // to move first, which it doesn't on pop of an empty queue).
            self.head.fetch_sub(1, Ordering::Release);
            return None;
        }
        let idx = (old_head & Self::mask()) as usize;
        // SAFETY: this thief uniquely owns index `old_head` — fetch_add
        // monotonically advances head, so no other thief or the owner's
        // pop can observe the same pre-increment value.
        unsafe { (*self.slots[idx].get()).assume_init_mut().take() }
    }

    pub fn len(&self) -> usize {
        let tail = self.tail.load(Ordering::Acquire);
        let head = self.head.load(Ordering::Acquire);
        tail.wrapping_sub(head) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_full(&self) -> bool {
        self.len() >= N
    }

    pub fn capacity(&self) -> usize {
        N
    }
}

/// Default local queue capacity: a power of two comfortably larger than
/// one preemption quantum's worth of fan-out in the end-to-end scenarios.
pub const LOCAL_QUEUE_CAPACITY: usize = 256;

/// Per-worker counters alongside the raw deque.
#[derive(Debug, Default)]
pub struct QueueStats {
    pub pushed: AtomicUsize,
    pub popped: AtomicUsize,
    pub stolen: AtomicUsize,
}

/// Thin wrapper owned by exactly one [`crate::worker::Worker`]; the owner
/// has exclusive push/pop rights, any worker may steal.
pub struct LocalQueue {
    deque: LockFreeDeque<LOCAL_QUEUE_CAPACITY>,
    stats: QueueStats,
}

impl Default for LocalQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalQueue {
    pub fn new() -> Self {
        Self {
            deque: LockFreeDeque::new(),
            stats: QueueStats::default(),
        }
    }

    pub fn push(&self, t: TaskRef) -> Result<(), TaskRef> {
        let r = self.deque.push(t);
        if r.is_ok() {
            self.stats.pushed.fetch_add(1, Ordering::Relaxed);
        }
        r
    }

    pub fn pop(&self) -> Option<TaskRef> {
        let r = self.deque.pop();
        if r.is_some() {
            self.stats.popped.fetch_add(1, Ordering::Relaxed);
        }
        r
    }

    /// Steal up to half of the victim's queue (at least one if any are
    /// present). Grounded on the same halving heuristic tokio's local
    /// queue uses to reduce re-steal contention.
    pub fn steal_half_from(&self, victim: &LocalQueue) -> Vec<TaskRef> {
        let available = victim.deque.len();
        if available == 0 {
            return Vec::new();
        }
        let want = std::cmp::max(1, available / 2);
        let mut stolen = Vec::with_capacity(want);
        for _ in 0..want {
            match victim.deque.steal() {
                Some(t) => stolen.push(t),
                None => break,
            }
        }
        if !stolen.is_empty() {
            self.stats.stolen.fetch_add(stolen.len(), Ordering::Relaxed);
        }
        stolen
    }

    pub fn steal_one_from(&self, victim: &LocalQueue) -> Option<TaskRef> {
        let t = victim.deque.steal();
        if t.is_some() {
            self.stats.stolen.fetch_add(1, Ordering::Relaxed);
        }
        t
    }

    pub fn size(&self) -> usize {
        self.deque.len()
    }

    pub fn is_empty(&self) -> bool {
        self.deque.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.deque.is_full()
    }

    pub fn stats(&self) -> &QueueStats {
        &self.stats
    }

    pub fn drain_all(&self) -> Vec<TaskRef> {
        let mut out = Vec::new();
        while let Some(t) = self.pop() {
            out.push(t);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::Task;
    use std::sync::atomic::AtomicUsize as StdAtomicUsize;
    use std::sync::Arc;

    unsafe extern "C" fn noop(_ctx: *mut std::ffi::c_void) {}
    unsafe fn noop_drop(_ptr: *mut std::ffi::c_void) {}

    fn make_task() -> TaskRef {
        unsafe { Task::new(noop, std::ptr::null_mut(), 16 * 1024, 0, noop_drop).unwrap() }
    }

    #[test]
    fn push_pop_is_fifo() {
        let q: LockFreeDeque<8> = LockFreeDeque::new();
        let a = make_task();
        let b = make_task();
        let (ida, idb) = (a.id(), b.id());
        q.push(a).unwrap();
        q.push(b).unwrap();
        assert_eq!(q.pop().unwrap().id(), ida);
        assert_eq!(q.pop().unwrap().id(), idb);
        assert!(q.pop().is_none());
    }

    #[test]
    fn push_rejects_when_full() {
        let q: LockFreeDeque<2> = LockFreeDeque::new();
        q.push(make_task()).unwrap();
        q.push(make_task()).unwrap();
        assert!(q.push(make_task()).is_err());
    }

    #[test]
    fn steal_takes_from_head() {
        let q: LockFreeDeque<8> = LockFreeDeque::new();
        let a = make_task();
        let ida = a.id();
        q.push(a).unwrap();
        q.push(make_task()).unwrap();
        let stolen = q.steal().unwrap();
        assert_eq!(stolen.id(), ida);
    }

    #[test]
    fn concurrent_push_pop_and_steal_preserve_count() {
        let local = Arc::new(LocalQueue::new());
        let n = 100usize;
        for _ in 0..n {
            local.push(make_task()).unwrap();
        }
        let seen = Arc::new(StdAtomicUsize::new(0));
        let mut handles = Vec::new();
        for _ in 0..4 {
            let local = Arc::clone(&local);
            let seen = Arc::clone(&seen);
            handles.push(std::thread::spawn(move || loop {
                match local.deque.steal() {
                    Some(_) => {
                        seen.fetch_add(1, Ordering::Relaxed);
                    }
                    None => {
                        if local.is_empty() {
                            break;
                        }
                        std::thread::yield_now();
                    }
                }
            }));
        }
        while let Some(_) = local.pop() {
            seen.fetch_add(1, Ordering::Relaxed);
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(seen.load(Ordering::Relaxed), n);
    }
}
