// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Runtime configuration.
//!
//! Three optional environment variables layer over sensible defaults.
//! Unparsable or out-of-range values are logged and ignored rather than
//! treated as fatal — a misconfigured environment variable should not be
//! able to prevent a process from starting.

use std::time::Duration;

/// Minimum task stack size (8 KiB).
pub const MIN_STACK_SIZE: usize = 8 * 1024;
/// Maximum task stack size (8 MiB).
pub const MAX_STACK_SIZE: usize = 8 * 1024 * 1024;
/// Default task stack size (64 KiB).
pub const DEFAULT_STACK_SIZE: usize = 64 * 1024;
/// Default preemption quantum.
pub const DEFAULT_QUANTUM: Duration = Duration::from_millis(10);

/// Construction-time configuration for a [`crate::Runtime`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RuntimeConfig {
    /// Number of worker threads. Must be >= 1.
    pub workers: usize,
    /// Preemption quantum sampled by the `PreemptTimer`.
    pub quantum: Duration,
    /// Default stack size for tasks spawned without an explicit override.
    pub stack_size: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            workers: std::thread::available_parallelism()
                .map(|p| p.get())
                .unwrap_or(1),
            quantum: DEFAULT_QUANTUM,
            stack_size: DEFAULT_STACK_SIZE,
        }
    }
}

impl RuntimeConfig {
    /// Build a config from defaults, then apply any of `RUNTIME_WORKERS`,
    /// `RUNTIME_PREEMPT_MS`, `RUNTIME_STACK_KIB` found in the environment.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();

        if let Some(v) = read_env_usize("RUNTIME_WORKERS") {
            if v >= 1 {
                cfg.workers = v;
            } else {
                tracing::warn!(value = v, "RUNTIME_WORKERS must be >= 1, ignoring");
            }
        }

        if let Some(v) = read_env_usize("RUNTIME_PREEMPT_MS") {
            if v >= 1 {
                cfg.quantum = Duration::from_millis(v as u64);
            } else {
                tracing::warn!(value = v, "RUNTIME_PREEMPT_MS must be >= 1, ignoring");
            }
        }

        if let Some(v) = read_env_usize("RUNTIME_STACK_KIB") {
            let bytes = v.saturating_mul(1024);
            if v >= 8 {
                cfg.stack_size = bytes.clamp(MIN_STACK_SIZE, MAX_STACK_SIZE);
            } else {
                tracing::warn!(value = v, "RUNTIME_STACK_KIB must be >= 8, ignoring");
            }
        }

        cfg
    }

    /// Clamp an arbitrary requested stack size into the supported range,
    /// rounding up to a whole number of pages (done by the allocator).
    pub fn clamp_stack_size(size: usize) -> usize {
        size.clamp(MIN_STACK_SIZE, MAX_STACK_SIZE)
    }
}

fn read_env_usize(key: &str) -> Option<usize> {
    match std::env::var(key) {
        Ok(raw) => match raw.parse::<usize>() {
            Ok(v) => Some(v),
            Err(_) => {
                tracing::warn!(key, raw, "could not parse environment variable, ignoring");
                None
            }
        },
        Err(_) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let cfg = RuntimeConfig::default();
        assert!(cfg.workers >= 1);
        assert_eq!(cfg.quantum, DEFAULT_QUANTUM);
        assert_eq!(cfg.stack_size, DEFAULT_STACK_SIZE);
    }

    #[test]
    fn clamp_stack_size_bounds() {
        assert_eq!(RuntimeConfig::clamp_stack_size(1), MIN_STACK_SIZE);
        assert_eq!(RuntimeConfig::clamp_stack_size(usize::MAX), MAX_STACK_SIZE);
        assert_eq!(RuntimeConfig::clamp_stack_size(100_000), 100_000);
    }
}
