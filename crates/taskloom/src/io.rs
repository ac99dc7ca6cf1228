// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! `async_read`/`async_write`/`async_connect` facade.
//!
//! Rather than handing the Poller a `Waker`, each future registers the
//! *currently executing Task* directly, relying on
//! [`crate::future::await_future`] to perform the actual suspend once
//! `poll` returns `Pending`. The facade owns fd-non-blocking-mode setup:
//! callers never need to touch `fcntl` themselves.

use crate::poller::Interest;
use crate::task::TaskRef;
use crate::worker::Shared;
use std::future::Future;
use std::io;
use std::os::unix::io::RawFd;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

/// Places `fd` in non-blocking mode. Must be called before a fd's first
/// `register` with the Poller.
pub fn set_nonblocking(fd: RawFd) -> io::Result<()> {
    // SAFETY: `fcntl` with F_GETFL/F_SETFL on a valid fd performs no
    // pointer dereference beyond the fd table lookup.
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFL);
        if flags < 0 {
            return Err(io::Error::last_os_error());
        }
        let ret = libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK);
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

fn current_task_and_shared() -> (TaskRef, Arc<Shared>) {
    let task = crate::worker::current_task()
        .expect("taskloom I/O facade called outside a task");
    let shared = crate::worker::current_shared()
        .expect("taskloom I/O facade called outside a worker");
    (task, shared)
}

/// Reads into `buf`, suspending the calling Task until `fd` is readable
/// whenever the kernel isn't ready yet. Returns once a read succeeds
/// (including a `0`-byte EOF read) or fails for a reason other than
/// `WouldBlock`; `EINTR` is retried transparently.
///
/// Suspension here is the direct Task-stack-switch kind
/// ([`crate::future::await_future`]), not an `async fn` — this crate's
/// Tasks suspend by switching stacks, not by returning a `Future` for an
/// outer executor to poll.
pub fn async_read(fd: RawFd, buf: &mut [u8]) -> io::Result<usize> {
    crate::future::await_future(AsyncReadFuture { fd, buf })
}

/// Writes `buf`, suspending the calling Task until `fd` is writable
/// whenever the kernel isn't ready yet.
pub fn async_write(fd: RawFd, buf: &[u8]) -> io::Result<usize> {
    crate::future::await_future(AsyncWriteFuture { fd, buf })
}

/// Initiates a non-blocking `connect(2)` on `fd` and suspends the calling
/// Task until it completes (successfully or with an error), per the usual
/// `EINPROGRESS` -> wait-for-writable -> check `SO_ERROR` protocol.
pub fn async_connect(fd: RawFd, addr: &std::net::SocketAddr) -> io::Result<()> {
    crate::future::await_future(AsyncConnectFuture {
        fd,
        addr: *addr,
        started: false,
    })
}

struct AsyncReadFuture<'a> {
    fd: RawFd,
    buf: &'a mut [u8],
}

impl Future for AsyncReadFuture<'_> {
    type Output = io::Result<usize>;

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        loop {
            // SAFETY: `this.buf` is a valid, exclusively-borrowed slice for
            // the duration of this call.
            let n = unsafe {
                libc::read(
                    this.fd,
                    this.buf.as_mut_ptr() as *mut libc::c_void,
                    this.buf.len(),
                )
            };
            if n >= 0 {
                return Poll::Ready(Ok(n as usize));
            }
            let err = io::Error::last_os_error();
            match err.raw_os_error() {
                Some(libc::EINTR) => continue,
                Some(libc::EAGAIN) => {
                    let (task, shared) = current_task_and_shared();
                    if let Err(e) = shared.poller.register(this.fd, Interest::Readable, task) {
                        return Poll::Ready(Err(io::Error::new(io::ErrorKind::Other, e)));
                    }
                    return Poll::Pending;
                }
                _ => return Poll::Ready(Err(err)),
            }
        }
    }
}

struct AsyncWriteFuture<'a> {
    fd: RawFd,
    buf: &'a [u8],
}

impl Future for AsyncWriteFuture<'_> {
    type Output = io::Result<usize>;

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        loop {
            // SAFETY: `this.buf` is a valid, exclusively-borrowed slice for
            // the duration of this call.
            let n = unsafe {
                libc::write(
                    this.fd,
                    this.buf.as_ptr() as *const libc::c_void,
                    this.buf.len(),
                )
            };
            if n >= 0 {
                return Poll::Ready(Ok(n as usize));
            }
            let err = io::Error::last_os_error();
            match err.raw_os_error() {
                Some(libc::EINTR) => continue,
                Some(libc::EAGAIN) => {
                    let (task, shared) = current_task_and_shared();
                    if let Err(e) = shared.poller.register(this.fd, Interest::Writable, task) {
                        return Poll::Ready(Err(io::Error::new(io::ErrorKind::Other, e)));
                    }
                    return Poll::Pending;
                }
                _ => return Poll::Ready(Err(err)),
            }
        }
    }
}

struct AsyncConnectFuture {
    fd: RawFd,
    addr: std::net::SocketAddr,
    started: bool,
}

impl Future for AsyncConnectFuture {
    type Output = io::Result<()>;

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();

        if !this.started {
            this.started = true;
            let (storage, len) = sockaddr_from_std(&this.addr);
            // SAFETY: `storage`/`len` describe a valid sockaddr for the
            // lifetime of this call.
            let ret = unsafe { libc::connect(this.fd, &storage as *const _ as *const libc::sockaddr, len) };
            if ret == 0 {
                return Poll::Ready(Ok(()));
            }
            let err = io::Error::last_os_error();
            match err.raw_os_error() {
                Some(libc::EINPROGRESS) => {
                    let (task, shared) = current_task_and_shared();
                    if let Err(e) = shared.poller.register(this.fd, Interest::Writable, task) {
                        return Poll::Ready(Err(io::Error::new(io::ErrorKind::Other, e)));
                    }
                    return Poll::Pending;
                }
                _ => return Poll::Ready(Err(err)),
            }
        }

        // Resumed after the fd became writable: the connect either
        // succeeded or failed; SO_ERROR tells us which.
        let mut errno: libc::c_int = 0;
        let mut errno_len = std::mem::size_of::<libc::c_int>() as libc::socklen_t;
        // SAFETY: `errno`/`errno_len` are valid out-parameters of the
        // documented size for `SO_ERROR`.
        let ret = unsafe {
            libc::getsockopt(
                this.fd,
                libc::SOL_SOCKET,
                libc::SO_ERROR,
                &mut errno as *mut _ as *mut libc::c_void,
                &mut errno_len,
            )
        };
        if ret != 0 {
            return Poll::Ready(Err(io::Error::last_os_error()));
        }
        if errno == 0 {
            Poll::Ready(Ok(()))
        } else {
            Poll::Ready(Err(io::Error::from_raw_os_error(errno)))
        }
    }
}

fn sockaddr_from_std(addr: &std::net::SocketAddr) -> (libc::sockaddr_storage, libc::socklen_t) {
    // SAFETY: zeroed `sockaddr_storage` is a valid representation; only
    // the fields written below are read by `connect(2)`.
    let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
    match addr {
        std::net::SocketAddr::V4(v4) => {
            let sin = libc::sockaddr_in {
                sin_family: libc::AF_INET as libc::sa_family_t,
                sin_port: v4.port().to_be(),
                sin_addr: libc::in_addr {
                    s_addr: u32::from_ne_bytes(v4.ip().octets()),
                },
                sin_zero: [0; 8],
            };
            unsafe {
                std::ptr::write(&mut storage as *mut _ as *mut libc::sockaddr_in, sin);
            }
            (storage, std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t)
        }
        std::net::SocketAddr::V6(v6) => {
            let sin6 = libc::sockaddr_in6 {
                sin6_family: libc::AF_INET6 as libc::sa_family_t,
                sin6_port: v6.port().to_be(),
                sin6_flowinfo: v6.flowinfo(),
                sin6_addr: libc::in6_addr {
                    s6_addr: v6.ip().octets(),
                },
                sin6_scope_id: v6.scope_id(),
            };
            unsafe {
                std::ptr::write(&mut storage as *mut _ as *mut libc::sockaddr_in6, sin6);
            }
            (storage, std::mem::size_of::<libc::sockaddr_in6>() as libc::socklen_t)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RuntimeConfig;
    use crate::runtime::Runtime;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn async_read_wakes_once_peer_writes() {
        let rt = Runtime::new(RuntimeConfig {
            workers: 2,
            ..RuntimeConfig::default()
        })
        .unwrap();

        let mut fds = [0i32; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        let (read_fd, write_fd) = (fds[0], fds[1]);
        set_nonblocking(read_fd).unwrap();
        set_nonblocking(write_fd).unwrap();

        let got = Arc::new(AtomicUsize::new(0));
        let got2 = Arc::clone(&got);
        let handle = rt.spawn(move || {
            let mut buf = [0u8; 1];
            let n = async_read(read_fd, &mut buf);
            got2.store(n.unwrap(), Ordering::SeqCst);
        });

        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(10));
            unsafe {
                libc::write(write_fd, b"x".as_ptr() as *const libc::c_void, 1);
            }
        });

        let start = std::time::Instant::now();
        while !handle.is_finished() && start.elapsed() < Duration::from_millis(500) {
            std::thread::sleep(Duration::from_millis(1));
        }
        assert_eq!(got.load(Ordering::SeqCst), 1);
        unsafe {
            libc::close(read_fd);
            libc::close(write_fd);
        }
        rt.shutdown(Duration::from_secs(1));
    }
}
