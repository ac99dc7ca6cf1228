// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! `Poller`: the epoll-backed I/O readiness layer.
//!
//! Built around an epoll_fd plus an eventfd wake pipe and an fd ->
//! registration map, generalized from waking a `Waker` to transferring
//! the associated `Task` back onto a LocalQueue (or the GlobalQueue on
//! overflow).

use crate::error::{Error, Result};
use crate::task::TaskRef;
use std::collections::HashMap;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

/// Readiness interest a registration cares about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interest {
    Readable,
    Writable,
    ReadWrite,
}

impl Interest {
    fn to_epoll_bits(self) -> u32 {
        match self {
            Interest::Readable => (libc::EPOLLIN | libc::EPOLLONESHOT) as u32,
            Interest::Writable => (libc::EPOLLOUT | libc::EPOLLONESHOT) as u32,
            Interest::ReadWrite => (libc::EPOLLIN | libc::EPOLLOUT | libc::EPOLLONESHOT) as u32,
        }
    }
}

struct Registration {
    interest: Interest,
    task: TaskRef,
}

/// A readiness event returned by [`Poller::wait`]: the fd that became
/// ready and the task that was (or was not) resumed for it.
pub struct ReadyEvent {
    pub fd: RawFd,
    pub task: TaskRef,
}

/// A callback the owning [`crate::runtime::Runtime`] supplies so the
/// poller can hand a woken task back to the scheduler without knowing
/// about workers or the global queue itself.
pub type WakeFn = Box<dyn Fn(TaskRef) + Send + Sync>;

pub struct Poller {
    epoll_fd: RawFd,
    wake_fd: RawFd,
    registrations: Mutex<HashMap<RawFd, Registration>>,
    shutdown: AtomicBool,
}

impl Poller {
    pub fn new() -> Result<Self> {
        let epoll_fd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epoll_fd < 0 {
            return Err(Error::Io(std::io::Error::last_os_error()));
        }
        let wake_fd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
        if wake_fd < 0 {
            let err = std::io::Error::last_os_error();
            unsafe { libc::close(epoll_fd) };
            return Err(Error::Io(err));
        }
        let mut ev = libc::epoll_event {
            events: libc::EPOLLIN as u32,
            u64: wake_fd as u64,
        };
        let ret = unsafe {
            libc::epoll_ctl(epoll_fd, libc::EPOLL_CTL_ADD, wake_fd, &mut ev as *mut _)
        };
        if ret != 0 {
            let err = std::io::Error::last_os_error();
            unsafe {
                libc::close(epoll_fd);
                libc::close(wake_fd);
            }
            return Err(Error::Io(err));
        }
        Ok(Self {
            epoll_fd,
            wake_fd,
            registrations: Mutex::new(HashMap::new()),
            shutdown: AtomicBool::new(false),
        })
    }

    /// `fd` must already be non-blocking; the caller (the async I/O
    /// facade) is responsible for that. Registration transfers ownership
    /// of `task` to the poller until it fires or is deregistered.
    pub fn register(&self, fd: RawFd, interest: Interest, task: TaskRef) -> Result<()> {
        let mut regs = self.registrations.lock().unwrap();
        if regs.contains_key(&fd) {
            return Err(Error::AlreadyRegistered(fd));
        }
        let mut ev = libc::epoll_event {
            events: interest.to_epoll_bits(),
            u64: fd as u64,
        };
        let ret = unsafe { libc::epoll_ctl(self.epoll_fd, libc::EPOLL_CTL_ADD, fd, &mut ev as *mut _) };
        if ret != 0 {
            return Err(Error::Io(std::io::Error::last_os_error()));
        }
        task.set_io_wait(Some(crate::task::IoWait { fd, interest }));
        regs.insert(fd, Registration { interest, task });
        Ok(())
    }

    pub fn modify(&self, fd: RawFd, interest: Interest) -> Result<()> {
        let mut regs = self.registrations.lock().unwrap();
        let reg = regs.get_mut(&fd).ok_or(Error::NotRegistered(fd))?;
        let mut ev = libc::epoll_event {
            events: interest.to_epoll_bits(),
            u64: fd as u64,
        };
        let ret = unsafe { libc::epoll_ctl(self.epoll_fd, libc::EPOLL_CTL_MOD, fd, &mut ev as *mut _) };
        if ret != 0 {
            return Err(Error::Io(std::io::Error::last_os_error()));
        }
        reg.interest = interest;
        reg.task
            .set_io_wait(Some(crate::task::IoWait { fd, interest }));
        Ok(())
    }

    /// Removes the association. ENOENT from the kernel side is ignored
    /// since it only means the fd was already closed out from under us.
    pub fn deregister(&self, fd: RawFd) -> Result<TaskRef> {
        let mut regs = self.registrations.lock().unwrap();
        let reg = regs.remove(&fd).ok_or(Error::NotRegistered(fd))?;
        let ret = unsafe {
            libc::epoll_ctl(self.epoll_fd, libc::EPOLL_CTL_DEL, fd, std::ptr::null_mut())
        };
        if ret != 0 {
            let err = std::io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::ENOENT) {
                return Err(Error::Io(err));
            }
        }
        reg.task.set_io_wait(None);
        Ok(reg.task)
    }

    pub fn wake(&self) {
        let one: u64 = 1;
        unsafe {
            libc::write(
                self.wake_fd,
                &one as *const u64 as *const libc::c_void,
                std::mem::size_of::<u64>(),
            );
        }
    }

    pub fn request_shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
        self.wake();
    }

    pub fn should_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    /// Blocks at most `timeout`, then calls `wake_fn` once per task whose
    /// fd became ready, moving it to Runnable. EINTR is retried
    /// transparently; any other epoll_wait error is fatal to the runtime.
    pub fn wait(&self, timeout: Option<Duration>, wake_fn: &WakeFn) -> Result<usize> {
        const MAX_EVENTS: usize = 256;
        let mut events: [libc::epoll_event; MAX_EVENTS] = unsafe { std::mem::zeroed() };
        let timeout_ms = match timeout {
            Some(d) => d.as_millis().min(i32::MAX as u128) as i32,
            None => -1,
        };

        let n = loop {
            let ret = unsafe {
                libc::epoll_wait(self.epoll_fd, events.as_mut_ptr(), MAX_EVENTS as i32, timeout_ms)
            };
            if ret >= 0 {
                break ret as usize;
            }
            let err = std::io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EINTR) {
                continue;
            }
            return Err(Error::Io(err));
        };

        let mut woken = 0;
        for ev in &events[..n] {
            let fd = ev.u64 as RawFd;
            if fd == self.wake_fd {
                let mut buf = [0u8; 8];
                unsafe {
                    libc::read(self.wake_fd, buf.as_mut_ptr() as *mut libc::c_void, 8);
                }
                continue;
            }
            // One-shot interest: the registration is consumed by firing.
            // The facade re-registers (via `modify`) if it still wants
            // more events after draining to EAGAIN.
            let task = {
                let mut regs = self.registrations.lock().unwrap();
                regs.remove(&fd).map(|r| r.task)
            };
            if let Some(task) = task {
                task.set_io_wait(None);
                wake_fn(task);
                woken += 1;
            }
        }
        Ok(woken)
    }
}

impl Drop for Poller {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.epoll_fd);
            libc::close(self.wake_fd);
        }
    }
}

// SAFETY: all mutable state lives behind the `Mutex`/atomics above.
unsafe impl Send for Poller {}
unsafe impl Sync for Poller {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::Task;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    unsafe extern "C" fn noop(_ctx: *mut std::ffi::c_void) {}
    unsafe fn noop_drop(_ptr: *mut std::ffi::c_void) {}

    fn make_task() -> TaskRef {
        unsafe { Task::new(noop, std::ptr::null_mut(), 16 * 1024, 0, noop_drop).unwrap() }
    }

    #[test]
    fn register_duplicate_fd_errors() {
        let poller = Poller::new().unwrap();
        let mut fds = [0i32; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        set_nonblocking(fds[0]);
        poller.register(fds[0], Interest::Readable, make_task()).unwrap();
        let err = poller.register(fds[0], Interest::Readable, make_task());
        assert!(matches!(err, Err(Error::AlreadyRegistered(_))));
        unsafe {
            libc::close(fds[0]);
            libc::close(fds[1]);
        }
    }

    fn set_nonblocking(fd: RawFd) {
        unsafe {
            let flags = libc::fcntl(fd, libc::F_GETFL);
            libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK);
        }
    }

    #[test]
    fn pipe_write_wakes_registered_reader() {
        let poller = Arc::new(Poller::new().unwrap());
        let mut fds = [0i32; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        let (read_fd, write_fd) = (fds[0], fds[1]);
        set_nonblocking(read_fd);

        let task = make_task();
        poller
            .register(read_fd, Interest::Readable, task)
            .unwrap();

        unsafe {
            libc::write(write_fd, b"x".as_ptr() as *const libc::c_void, 1);
        }

        let woken = Arc::new(AtomicUsize::new(0));
        let woken2 = Arc::clone(&woken);
        let wake_fn: WakeFn = Box::new(move |_t| {
            woken2.fetch_add(1, Ordering::Relaxed);
        });
        let n = poller
            .wait(Some(Duration::from_millis(500)), &wake_fn)
            .unwrap();
        assert_eq!(n, 1);
        assert_eq!(woken.load(Ordering::Relaxed), 1);

        unsafe {
            libc::close(read_fd);
            libc::close(write_fd);
        }
    }
}
