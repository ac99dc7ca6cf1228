// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! `select` over N receivers. Each call tries the receivers in a freshly
//! shuffled order rather than always favoring index 0, so no channel in a
//! `select` starves its peers under sustained traffic on an earlier one.

use crate::channel::{Closed, Receiver};
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::{SystemTime, UNIX_EPOCH};

fn xorshift_next(state: &mut u64) -> u64 {
    let mut x = *state;
    x ^= x << 13;
    x ^= x >> 7;
    x ^= x << 17;
    *state = x;
    x
}

fn seed_from_entropy<T>(receivers: &[Receiver<T>]) -> u64 {
    let addr = receivers.as_ptr() as u64;
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.subsec_nanos() as u64)
        .unwrap_or(0);
    (addr ^ nanos.wrapping_mul(0x9E3779B97F4A7C15)).max(1)
}

fn random_permutation(n: usize, seed: u64) -> Vec<usize> {
    let mut order: Vec<usize> = (0..n).collect();
    let mut state = seed;
    for i in (1..n).rev() {
        let j = (xorshift_next(&mut state) as usize) % (i + 1);
        order.swap(i, j);
    }
    order
}

/// Poll `receivers` in a random order each time, returning the first
/// ready value found as `(index, value)`. Resolves to `Err(Closed)` only
/// once every receiver's channel has no senders left and is empty.
pub fn select<T>(receivers: &[Receiver<T>]) -> SelectFuture<'_, T> {
    let seed = seed_from_entropy(receivers);
    SelectFuture {
        receivers,
        order: random_permutation(receivers.len(), seed),
    }
}

pub struct SelectFuture<'a, T> {
    receivers: &'a [Receiver<T>],
    order: Vec<usize>,
}

impl<T> Future for SelectFuture<'_, T> {
    type Output = Result<(usize, T), Closed>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let mut any_open = false;
        for &idx in &this.order {
            let mut recv = this.receivers[idx].recv();
            match Pin::new(&mut recv).poll(cx) {
                Poll::Ready(Ok(v)) => return Poll::Ready(Ok((idx, v))),
                Poll::Ready(Err(Closed)) => continue,
                Poll::Pending => any_open = true,
            }
        }
        if any_open {
            Poll::Pending
        } else {
            Poll::Ready(Err(Closed))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::bounded;
    use crate::future::block_on_current_thread;

    #[test]
    fn select_returns_whichever_channel_is_ready() {
        let (tx_a, rx_a) = bounded::<u32>(1);
        let (_tx_b, rx_b) = bounded::<u32>(1);
        block_on_current_thread(tx_a.send(5)).unwrap();
        let (idx, v) = block_on_current_thread(select(&[rx_a, rx_b])).unwrap();
        assert_eq!(idx, 0);
        assert_eq!(v, 5);
    }

    #[test]
    fn select_on_all_closed_errs() {
        let (tx_a, rx_a) = bounded::<u32>(1);
        let (tx_b, rx_b) = bounded::<u32>(1);
        drop(tx_a);
        drop(tx_b);
        let err = block_on_current_thread(select(&[rx_a, rx_b]));
        assert_eq!(err, Err(Closed));
    }
}
