//! # Runtime Configuration Module
//!
//! Tuning for the `may` coroutine runtime that every worker, the dispatch loop
//! and each accepted connection run on.
//!
//! ## Environment Variables
//!
//! ### `WEBQ_STACK_SIZE`
//!
//! Stack size for worker and dispatcher coroutines. Accepts decimal (`65536`)
//! or hexadecimal (`0x10000`). Default: `0x10000` (64 KB).
//!
//! ### `WEBQ_MAX_PROCS`
//!
//! Number of scheduler threads backing the runtime:
//! - `-1`: one per available CPU
//! - `0` or unset: leave the runtime default
//! - `n`: exactly `n`
//!
//! Both values can also come from [`ServerConfig`](crate::config::ServerConfig),
//! which takes precedence over the environment.

use crate::error::PoolError;
use may::coroutine::JoinHandle;
use std::env;
use tracing::info;

/// Default coroutine stack size (64 KB)
pub const DEFAULT_STACK_SIZE: usize = 0x10000;

/// Parse a byte size given as decimal or `0x`-prefixed hexadecimal.
pub fn parse_size(s: &str) -> Result<usize, String> {
    let s = s.trim();
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => usize::from_str_radix(hex, 16),
        None => s.parse(),
    };
    parsed.map_err(|e| format!("invalid size '{s}': {e}"))
}

/// Runtime settings applied to `may` once at process start.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RuntimeConfig {
    /// Coroutine stack size in bytes
    pub stack_size: usize,
    /// Scheduler thread count, `None` to keep the runtime default
    pub scheduler_threads: Option<usize>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            stack_size: DEFAULT_STACK_SIZE,
            scheduler_threads: None,
        }
    }
}

impl RuntimeConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Self {
        let stack_size = env::var("WEBQ_STACK_SIZE")
            .ok()
            .and_then(|v| parse_size(&v).ok())
            .filter(|s| *s > 0)
            .unwrap_or(DEFAULT_STACK_SIZE);
        let max_procs = env::var("WEBQ_MAX_PROCS")
            .ok()
            .and_then(|v| v.trim().parse::<i32>().ok());
        Self {
            stack_size,
            scheduler_threads: resolve_max_procs(max_procs),
        }
    }

    /// Push the settings into the global `may` configuration.
    ///
    /// Must run before the first coroutine is spawned to affect the
    /// scheduler thread count.
    pub fn apply(&self) {
        let cfg = may::config();
        cfg.set_stack_size(self.stack_size);
        if let Some(threads) = self.scheduler_threads {
            cfg.set_workers(threads);
        }
        info!(
            stack_size = self.stack_size,
            scheduler_threads = ?self.scheduler_threads,
            "may runtime configured"
        );
    }
}

/// Translate a `max_procs` setting into a scheduler thread count.
pub fn resolve_max_procs(max_procs: Option<i32>) -> Option<usize> {
    match max_procs {
        Some(n) if n < 0 => Some(
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
        ),
        Some(0) | None => None,
        Some(n) => usize::try_from(n).ok(),
    }
}

/// Spawn a named coroutine.
///
/// A `stack_size` of zero uses the runtime's configured default.
///
/// # Errors
///
/// [`PoolError::Spawn`] if the runtime refuses the coroutine.
pub(crate) fn spawn_coroutine<F>(
    name: String,
    stack_size: usize,
    f: F,
) -> Result<JoinHandle<()>, PoolError>
where
    F: FnOnce() + Send + 'static,
{
    let mut builder = may::coroutine::Builder::new().name(name);
    if stack_size > 0 {
        builder = builder.stack_size(stack_size);
    }
    // SAFETY: may::coroutine::Builder::spawn() is marked unsafe by the may runtime.
    // The closure is Send + 'static and owns everything it touches, and it never
    // relies on thread-local storage across yield points.
    #[allow(unsafe_code)]
    let spawned = unsafe { builder.spawn(f) };
    spawned.map_err(|e| PoolError::Spawn(e.to_string()))
}
