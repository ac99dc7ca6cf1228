// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Architecture-specific stack switching.
//!
//! Each arch module provides:
//!
//! - `Context`: the callee-saved register set plus stack pointer.
//! - `init_stack`: primes a freshly allocated stack so the first
//!   `switch()` into it starts at `trampoline(task_ptr)`.
//! - `switch(old, new)`: saves the caller's registers into `*old`,
//!   restores `*new`, and resumes there.
//!
//! The trampoline trick (teach a naked shim to move the task pointer from
//! whichever callee-saved register carries it into the first
//! argument-passing register, then tail-jump into a normal `extern "C"`
//! function) is the same one classic green-thread implementations use.

#[cfg(target_arch = "x86_64")]
mod x86_64;
#[cfg(target_arch = "x86_64")]
pub use self::x86_64::{init_stack, switch, Context};

#[cfg(target_arch = "aarch64")]
mod aarch64;
#[cfg(target_arch = "aarch64")]
pub use self::aarch64::{init_stack, switch, Context};

#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
compile_error!(
    "taskloom's stack switch is only implemented for x86_64 and aarch64; \
    a silently-stubbed switch routine would produce undefined behavior \
    rather than a clear build failure."
);
