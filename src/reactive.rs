//! Adaptor over the reactive runtime that evaluates service functions.
//!
//! The task hands an [`Evaluator`] a re-runnable thunk and an executor and
//! gets back a cancellable [`EvalHandle`]. A full reactive runtime re-runs
//! the thunk whenever its reactive dependencies change and completes with
//! the first non-draft response; the bundled [`PoolEvaluator`] runs the
//! thunk once, which is the correct degenerate behavior for service
//! functions that never reactively block.

use crate::executor::Executor;
use crate::servlet::ReactiveResponse;
use once_cell::sync::Lazy;
use std::any::Any;
use std::error::Error;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Re-runnable computation producing a response.
pub type ResponseThunk = Arc<dyn Fn() -> ReactiveResponse + Send + Sync>;

/// One-shot completion notification.
///
/// Must be invoked exactly once, synchronously on the executor that ran the
/// evaluation, so the caller can take its own lock before hopping back onto
/// the container's pool.
pub type CompletionFn = Box<dyn FnOnce(Result<ReactiveResponse, EvalError>) + Send>;

/// Failure outcome of a reactive evaluation.
#[derive(Debug)]
pub enum EvalError {
    /// The evaluation was cancelled through [`EvalHandle::cancel`].
    Cancelled,
    /// The service function panicked.
    Panicked(String),
}

impl EvalError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, EvalError::Cancelled)
    }
}

impl fmt::Display for EvalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EvalError::Cancelled => write!(f, "reactive evaluation was cancelled"),
            EvalError::Panicked(message) => {
                write!(f, "service function panicked: {message}")
            }
        }
    }
}

impl Error for EvalError {}

/// Handle to a pending reactive evaluation.
///
/// Cancellation is a flag, not a preemption: the evaluation observes it at
/// its next opportunity and completes with [`EvalError::Cancelled`] from its
/// own thread. The cancelling thread never runs the completion callback,
/// which keeps it safe to cancel while holding locks the callback needs.
/// Cancelling an evaluation that already completed has no effect.
#[derive(Clone, Default)]
pub struct EvalHandle {
    cancelled: Arc<AtomicBool>,
}

impl EvalHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

/// Strategy for evaluating a service thunk on an executor.
///
/// Reactive runtimes implement this to plug draft detection and re-runs into
/// the adapter; the task depends only on the completion notification and on
/// [`EvalHandle::cancel`].
pub trait Evaluator: Send + Sync {
    fn evaluate(
        &self,
        thunk: ResponseThunk,
        executor: &Arc<dyn Executor>,
        complete: CompletionFn,
    ) -> EvalHandle;
}

/// Evaluator that runs the thunk once on the supplied executor.
///
/// Panics are captured and reported as [`EvalError::Panicked`] so that one
/// failing service function cannot take the executor down. A cancellation
/// that arrives before the evaluation finishes wins over its result.
pub struct PoolEvaluator;

impl Evaluator for PoolEvaluator {
    fn evaluate(
        &self,
        thunk: ResponseThunk,
        executor: &Arc<dyn Executor>,
        complete: CompletionFn,
    ) -> EvalHandle {
        let handle = EvalHandle::new();
        let cancelled = handle.clone();
        executor.execute(Box::new(move || {
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| thunk()));
            let result = if cancelled.is_cancelled() {
                Err(EvalError::Cancelled)
            } else {
                outcome.map_err(|panic| EvalError::Panicked(panic_message(&*panic)))
            };
            complete(result);
        }));
        handle
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "opaque panic payload".to_string()
    }
}

static SHARED: Lazy<Arc<dyn Evaluator>> = Lazy::new(|| Arc::new(PoolEvaluator));

/// Process-wide default evaluator.
pub fn shared() -> Arc<dyn Evaluator> {
    Arc::clone(&SHARED)
}
