// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Typed errors surfaced to callers.
//!
//! Fast-path conditions (`WouldBlock`, `Interrupted`) never reach this type —
//! they are handled at the syscall site. `QueueFull`/`QueueEmpty` are not
//! errors at all (callers re-route or poll again); they are plain enums
//! returned by the queue APIs, not part of this taxonomy.

use std::os::unix::io::RawFd;

/// Errors surfaced across the runtime's public API.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// `Poller::register` was called on an fd that already has a
    /// registration. Programmer error in the I/O facade above the runtime.
    #[error("fd {0} is already registered with the poller")]
    AlreadyRegistered(RawFd),

    /// `Poller::modify`/`deregister` was called on an fd with no
    /// registration.
    #[error("fd {0} is not registered with the poller")]
    NotRegistered(RawFd),

    /// The task was cancelled before or during execution.
    #[error("task was cancelled")]
    Cancelled,

    /// The runtime was constructed with zero workers.
    #[error("runtime requires at least one worker")]
    ZeroWorkers,

    /// An unrecoverable condition: stack allocation failure, a fatal
    /// syscall error from the poller, or a detected queue-invariant
    /// violation. The runtime aborts after a best-effort drain rather than
    /// risk silently losing a task.
    #[error("fatal runtime error: {0}")]
    Fatal(String),

    /// Wraps an OS-level I/O error from the poller or stack allocator.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
