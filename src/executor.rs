//! Executors for reactive evaluation.
//!
//! The container invokes servlet tasks on its own pool; application code is
//! evaluated on an [`Executor`] chosen by the servlet, which defaults to the
//! shared coroutine pool returned by [`shared`]. Servlets doing heavy or
//! blocking work should configure a dedicated executor instead.

use may::coroutine;
use once_cell::sync::Lazy;
use std::sync::Arc;
use tracing::error;

/// Something that can run a job, eventually, on some other thread of control.
///
/// Implementations must not run the job synchronously inside `execute`; the
/// adapter schedules work while holding per-task locks and relies on jobs
/// starting only after `execute` returns.
pub trait Executor: Send + Sync {
    fn execute(&self, job: Box<dyn FnOnce() + Send>);
}

/// Executor that spawns one `may` coroutine per job.
///
/// Stack size is configurable via the `RESERVLET_STACK_SIZE` environment
/// variable (decimal or `0x`-prefixed hex). The 64KB default leaves room for
/// non-trivial service functions without wasting address space on the common
/// short-lived evaluation.
pub struct CoroutineExecutor {
    stack_size: usize,
}

impl CoroutineExecutor {
    pub fn new() -> Self {
        Self {
            stack_size: stack_size_from_env(),
        }
    }

    pub fn with_stack_size(stack_size: usize) -> Self {
        Self { stack_size }
    }
}

impl Default for CoroutineExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl Executor for CoroutineExecutor {
    fn execute(&self, job: Box<dyn FnOnce() + Send>) {
        // Safety: required by the `may` runtime for coroutine spawns; the job
        // owns its captures and never borrows the spawning stack.
        let spawned = unsafe {
            coroutine::Builder::new()
                .stack_size(self.stack_size)
                .spawn(job)
        };
        if let Err(err) = spawned {
            error!(error = %err, "failed to spawn evaluation coroutine");
        }
    }
}

fn stack_size_from_env() -> usize {
    std::env::var("RESERVLET_STACK_SIZE")
        .ok()
        .and_then(|s| {
            if let Some(hex) = s.strip_prefix("0x") {
                usize::from_str_radix(hex, 16).ok()
            } else {
                s.parse().ok()
            }
        })
        .unwrap_or(0x10000)
}

static SHARED: Lazy<Arc<dyn Executor>> = Lazy::new(|| Arc::new(CoroutineExecutor::new()));

/// Process-wide default executor for reactive evaluation.
pub fn shared() -> Arc<dyn Executor> {
    Arc::clone(&SHARED)
}
