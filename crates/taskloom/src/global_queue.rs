// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! `GlobalQueue`: the shared mutex-guarded overflow FIFO.
//!
//! Workers touch this only on local-queue overflow, on an empty local
//! queue with failed steals, and periodically (every `K`th local pop) to
//! avoid starving tasks that landed here. Batch operations exist
//! specifically to keep lock hold time short when a worker moves many
//! tasks at once.

use crate::task::TaskRef;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

/// Global-poll interval: every Kth local pop, a worker drains a batch from
/// the `GlobalQueue` even if its local queue is non-empty. Chosen
/// coprime with common queue capacities (256, 1024) so the drain doesn't
/// always land on the same phase of the local ring.
pub const GLOBAL_POLL_INTERVAL: usize = 61;

#[derive(Default)]
struct Inner {
    list: VecDeque<TaskRef>,
}

/// FIFO list of tasks guarded by a single mutex, with an advisory atomic
/// size counter readable without the lock.
pub struct GlobalQueue {
    inner: Mutex<Inner>,
    size: AtomicUsize,
}

impl Default for GlobalQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl GlobalQueue {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            size: AtomicUsize::new(0),
        }
    }

    pub fn push(&self, t: TaskRef) {
        let mut inner = self.inner.lock().unwrap();
        inner.list.push_back(t);
        self.size.fetch_add(1, Ordering::Relaxed);
    }

    /// Splice a pre-formed batch onto the tail in one lock acquisition.
    pub fn push_batch(&self, batch: Vec<TaskRef>) {
        if batch.is_empty() {
            return;
        }
        let n = batch.len();
        let mut inner = self.inner.lock().unwrap();
        inner.list.extend(batch);
        self.size.fetch_add(n, Ordering::Relaxed);
    }

    pub fn pop(&self) -> Option<TaskRef> {
        let mut inner = self.inner.lock().unwrap();
        let t = inner.list.pop_front();
        if t.is_some() {
            self.size.fetch_sub(1, Ordering::Relaxed);
        }
        t
    }

    /// Detach up to `max` tasks from the head in one lock acquisition.
    pub fn pop_batch(&self, max: usize) -> Vec<TaskRef> {
        if max == 0 {
            return Vec::new();
        }
        let mut inner = self.inner.lock().unwrap();
        let n = std::cmp::min(max, inner.list.len());
        let batch: Vec<TaskRef> = inner.list.drain(..n).collect();
        if !batch.is_empty() {
            self.size.fetch_sub(batch.len(), Ordering::Relaxed);
        }
        batch
    }

    /// Advisory length; may momentarily lag the true list length between
    /// lock acquisitions but never across one.
    pub fn len(&self) -> usize {
        self.size.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

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
    fn push_pop_fifo_and_size_tracks() {
        let q = GlobalQueue::new();
        let a = make_task();
        let ida = a.id();
        q.push(a);
        q.push(make_task());
        assert_eq!(q.len(), 2);
        assert_eq!(q.pop().unwrap().id(), ida);
        assert_eq!(q.len(), 1);
    }

    #[test]
    fn batch_push_and_pop() {
        let q = GlobalQueue::new();
        let batch: Vec<TaskRef> = (0..10).map(|_| make_task()).collect();
        q.push_batch(batch);
        assert_eq!(q.len(), 10);
        let popped = q.pop_batch(4);
        assert_eq!(popped.len(), 4);
        assert_eq!(q.len(), 6);
        let rest = q.pop_batch(100);
        assert_eq!(rest.len(), 6);
        assert!(q.is_empty());
    }
}
