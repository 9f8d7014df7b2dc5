//! # Task Module
//!
//! Per-request state machine driving one HTTP exchange from async activation
//! to completion.
//!
//! The container's async API is an event maze: lifecycle callbacks, read
//! readiness, write readiness, and the reactive evaluation all fire on their
//! own schedule. [`ServletTask`] tames it with hard rules:
//!
//! - Every externally visible callback locks the task for its whole body, so
//!   the task runs as a single-writer state machine.
//! - Application failures become clean 500 responses; any other failure just
//!   kills the async transaction and lets the container clean up. Once the
//!   transaction is completed, for whatever reason, all activity ceases.
//! - Container timeouts become 504 responses and are the last line of
//!   defense against requests that would otherwise live forever.
//! - The `responded` flag is set and checked under the lock before any
//!   status or header reaches the container, so at most one response-writing
//!   path ever runs.
//!
//! Callbacks registered with the container are assumed not to fire during
//! the registering method's own execution; defending against that recursion
//! would complicate the code beyond recognition.
//!
//! Container callbacks run on the container's pool. Reactive evaluation runs
//! on the servlet's executor, and its completion handler only re-schedules
//! onto the container pool through the transaction, so in the common case a
//! request costs exactly two pool hops.

use crate::container::{
    AsyncTransaction, RawRequest, RawResponse, ReadListener, RequestStream, ResponseStream,
    TransactionListener, WriteListener,
};
use crate::metrics::ServletMetrics;
use crate::reactive::{self, CompletionFn, EvalError, EvalHandle, Evaluator, ResponseThunk};
use crate::servlet::{BodyBuf, ReactiveRequest, ReactiveResponse, ReactiveServlet};
use std::io;
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tracing::{debug, error, trace, warn};

/// Request bodies are usually short form posts; a small chunk keeps the
/// common case cheap.
const READ_CHUNK: usize = 128;
/// 4KB fills three packets and is efficient enough for fast I/O.
const WRITE_CHUNK: usize = 4096;

/// Container entry point: run one request through `servlet`.
///
/// Uses the process-wide evaluator and metrics registry. Returns
/// immediately; the exchange continues on container callbacks.
pub fn serve(
    servlet: Arc<dyn ReactiveServlet>,
    request: Box<dyn RawRequest>,
    response: Box<dyn RawResponse>,
) {
    serve_with(
        servlet,
        reactive::shared(),
        ServletMetrics::global(),
        request,
        response,
    );
}

/// [`serve`] with an explicit evaluator and metrics registry.
///
/// Reactive runtimes supply their own [`Evaluator`] here; tests supply a
/// private metrics registry so counters can be asserted in isolation.
pub fn serve_with(
    servlet: Arc<dyn ReactiveServlet>,
    evaluator: Arc<dyn Evaluator>,
    metrics: Arc<ServletMetrics>,
    request: Box<dyn RawRequest>,
    response: Box<dyn RawResponse>,
) {
    ServletTask::spawn(servlet, evaluator, metrics, request, response);
}

/// State machine for a single async HTTP exchange.
///
/// Created per request, retained by the callback registrations it makes, and
/// released once the transaction completes and the container drops those
/// registrations.
pub struct ServletTask {
    servlet: Arc<dyn ReactiveServlet>,
    evaluator: Arc<dyn Evaluator>,
    metrics: Arc<ServletMetrics>,
    state: Mutex<TaskState>,
}

struct TaskState {
    transaction: Option<Arc<dyn AsyncTransaction>>,
    response: Option<Box<dyn RawResponse>>,
    request: Option<Arc<ReactiveRequest>>,
    future: Option<EvalHandle>,
    /// Terminal flag; once set nothing else runs.
    completed: bool,
    /// A response has been started; guards against double responses.
    responded: bool,
    /// Evaluation has started; read events arriving after this are spurious.
    executed: bool,
    stream_in: Option<Box<dyn RequestStream>>,
    data_in: Vec<u8>,
    buffer_in: Option<Vec<u8>>,
    stream_out: Option<Box<dyn ResponseStream>>,
    data_out: Option<BodyBuf>,
    started: Instant,
}

impl ServletTask {
    /// Create the task and run its synchronous startup phase.
    ///
    /// For requests without a body the whole read phase completes before
    /// this returns.
    pub fn spawn(
        servlet: Arc<dyn ReactiveServlet>,
        evaluator: Arc<dyn Evaluator>,
        metrics: Arc<ServletMetrics>,
        request: Box<dyn RawRequest>,
        response: Box<dyn RawResponse>,
    ) -> Arc<ServletTask> {
        let task = Arc::new(ServletTask {
            servlet,
            evaluator,
            metrics,
            state: Mutex::new(TaskState {
                transaction: None,
                response: Some(response),
                request: None,
                future: None,
                completed: false,
                responded: false,
                executed: false,
                stream_in: None,
                data_in: Vec::new(),
                buffer_in: None,
                stream_out: None,
                data_out: None,
                started: Instant::now(),
            }),
        });
        task.start(request);
        task
    }

    /// Startup: async activation, then parse, then the read phase. Runs
    /// synchronously in the container's handler invocation.
    fn start(self: &Arc<Self>, raw: Box<dyn RawRequest>) {
        let mut st = self.state.lock().unwrap();
        trace!("starting servlet task");
        self.metrics.active_tasks.increment();
        st.started = Instant::now();

        // Nearly all code below assumes the transaction exists, so it is
        // initialized before anything else.
        let transaction = match raw.start_async() {
            Ok(transaction) => transaction,
            Err(err) => {
                debug!(error = %err, "failed to switch the container request to async mode");
                self.metrics.exceptions_container.increment();
                self.complete_locked(&mut st);
                return;
            }
        };
        transaction.set_listener(Box::new(TaskTransactionListener {
            task: Arc::clone(self),
        }));
        st.transaction = Some(transaction);

        self.parse(&mut st, &*raw);
        self.begin_reading(&mut st, &*raw);
    }

    fn parse(self: &Arc<Self>, st: &mut TaskState, raw: &dyn RawRequest) {
        if st.completed {
            return;
        }
        self.guarded(st, "failed to parse the container request", |task, st| {
            let request = ReactiveRequest::from_raw(raw)?;
            trace!(remote = %request.remote(), local = %request.local(), "connection");
            trace!(
                method = %request.method(),
                url = request.url().unwrap_or(""),
                "requested"
            );
            task.metrics.record_method(request.method());
            st.request = Some(Arc::new(request));
            Ok(())
        });
    }

    /// Set up async body reading. The body is always read, even for GET and
    /// HEAD, where it simply yields a zero-length result.
    fn begin_reading(self: &Arc<Self>, st: &mut TaskState, raw: &dyn RawRequest) {
        if st.completed {
            return;
        }
        self.guarded(st, "failed to set up request body reading", |task, st| {
            let mut stream = raw.input_stream()?;
            stream.set_listener(Box::new(TaskReadListener {
                task: Arc::clone(task),
            }));
            st.stream_in = Some(stream);
            Ok(())
        });
        // The first continuation runs synchronously: the container may
        // already hold the whole body, and it will not invoke the listener
        // until is_ready() has returned false.
        self.continue_reading_locked(&mut *st);
    }

    fn continue_reading(self: &Arc<Self>) {
        let mut st = self.state.lock().unwrap();
        self.continue_reading_locked(&mut st);
    }

    /// Read as much of the body as is available, returning to the caller
    /// when the stream reports not-ready. Spurious events after evaluation
    /// has started are ignored.
    fn continue_reading_locked(self: &Arc<Self>, st: &mut TaskState) {
        trace!("read callback");
        if st.completed || st.executed {
            return;
        }
        self.guarded(st, "failed to read the request body", |task, st| {
            let mut finished = false;
            {
                let Some(stream) = st.stream_in.as_mut() else {
                    return Ok(());
                };
                // One-and-a-half loop: the end-of-body probe always runs
                // before the readiness test.
                loop {
                    if stream.is_finished() {
                        trace!("input stream finished");
                        finished = true;
                        break;
                    }
                    if !stream.is_ready() {
                        trace!("input stream not ready");
                        task.metrics.request_waits.increment();
                        break;
                    }
                    let buffer = st.buffer_in.get_or_insert_with(|| vec![0u8; READ_CHUNK]);
                    match stream.read(buffer)? {
                        Some(count) if count > 0 => {
                            st.data_in.extend_from_slice(&buffer[..count]);
                            task.metrics.request_reads.increment();
                            task.metrics.request_bytes.add(count as u64);
                            trace!(count, "input stream returned data");
                        }
                        // End-of-stream marker; the is_finished() probe above
                        // terminates the loop.
                        other => trace!(count = ?other, "input stream returned no data"),
                    }
                }
            }
            if finished {
                task.end_reading(st)?;
            }
            Ok(())
        });
    }

    /// Close the input, install the body, and hand over to evaluation.
    fn end_reading(self: &Arc<Self>, st: &mut TaskState) -> io::Result<()> {
        if let Some(mut stream) = st.stream_in.take() {
            stream.close()?;
        }
        let body = std::mem::take(&mut st.data_in);
        st.buffer_in = None;
        trace!(bytes = body.len(), "request body complete");
        // The request is not shared with the evaluation thunk yet, so the
        // exclusive borrow always succeeds here.
        if let Some(request) = st.request.as_mut().and_then(Arc::get_mut) {
            request.set_data(body);
        }
        self.execute(st);
        Ok(())
    }

    /// Hand the request to the reactive evaluator on the servlet's executor.
    ///
    /// From here on the task sits idle until the completion callback fires
    /// on the evaluator's thread and re-schedules onto the container pool.
    fn execute(self: &Arc<Self>, st: &mut TaskState) {
        trace!("starting reactive evaluation");
        st.executed = true;
        let Some(request) = st.request.as_ref().map(Arc::clone) else {
            return;
        };
        let servlet = Arc::clone(&self.servlet);
        let thunk: ResponseThunk = Arc::new(move || servlet.service(&request));
        let task = Arc::clone(self);
        let complete: CompletionFn = Box::new(move |result| task.evaluated(result));
        let executor = self.servlet.executor();
        st.future = Some(self.evaluator.evaluate(thunk, &executor, complete));
    }

    /// Completion handler, running on the evaluator's thread. Hops back onto
    /// the container pool through the transaction; scheduling fails if the
    /// container completed the transaction behind our back, and the guard
    /// turns that into a clean death.
    fn evaluated(self: &Arc<Self>, result: Result<ReactiveResponse, EvalError>) {
        let mut st = self.state.lock().unwrap();
        trace!("reactive evaluation completed");
        if st.completed {
            return;
        }
        let task = Arc::clone(self);
        self.guarded(
            &mut st,
            "failed to schedule the response continuation",
            move |_, st| {
                let Some(transaction) = st.transaction.as_ref() else {
                    return Ok(());
                };
                transaction.spawn(Box::new(move || match result {
                    Ok(response) => task.serve_response(response),
                    Err(error) => task.fail(error),
                }))
            },
        );
    }

    /// Evaluation failed. Produce a blank 500 unless some other path already
    /// responded.
    ///
    /// There is no pleasing everyone with an error page, so the response
    /// carries nothing but the status code; applications wanting richer
    /// error pages should catch their own failures and build responses of
    /// their choosing. The failure is logged loudly instead.
    fn fail(self: &Arc<Self>, error: EvalError) {
        let mut st = self.state.lock().unwrap();
        trace!("service failure callback");
        if error.is_cancelled() {
            // The timeout or death path that cancelled us already produced
            // whatever response was due.
            return;
        }
        if !st.responded && !st.completed {
            error!(error = %error, "reactive service failed");
            self.respond(&mut st, |response| {
                response.set_status(500);
                // Never let clients cache errors caused by application
                // failures.
                response.set_header("Cache-Control", "no-cache, no-store");
            });
            self.complete_locked(&mut st);
            // Counted inside the condition so that cancellations arriving
            // after a timeout response don't inflate the failure count.
            self.metrics.exceptions_service.increment();
        }
    }

    /// Evaluation succeeded: emit status, headers, and cookies, then stream
    /// the body. Runs on the container pool.
    fn serve_response(self: &Arc<Self>, response: ReactiveResponse) {
        let mut st = self.state.lock().unwrap();
        trace!("service completion callback");
        if st.responded || st.completed {
            return;
        }
        let metrics = &self.metrics;
        self.respond(&mut st, |raw| {
            let status = response.status();
            raw.set_status(status);
            metrics.record_status(status);
            trace!(status, "status code");
            // Deriving headers like Content-Length from the body here is
            // tempting but would break HEAD responses, which legitimately
            // pair a zero-length body with a non-zero length.
            for (name, value) in response.headers().iter() {
                trace!(header = name, value, "sending header");
                raw.set_header(name, value);
            }
            for cookie in response.cookies() {
                trace!(cookie = cookie.name(), "sending cookie");
                raw.add_cookie(cookie);
            }
        });
        self.begin_writing(&mut st, response.body().duplicate());
    }

    /// Common response bookkeeping: flips `responded` and applies the
    /// response instructions under guard. Callers hold the lock.
    fn respond(self: &Arc<Self>, st: &mut TaskState, instructions: impl FnOnce(&mut dyn RawResponse)) {
        trace!("sending response");
        st.responded = true;
        self.guarded(st, "failed to send the response", |_, st| {
            if let Some(response) = st.response.as_mut() {
                instructions(response.as_mut());
            }
            Ok(())
        });
    }

    /// Set up async body writing from a duplicated body window, so the
    /// application's buffer position is never disturbed and buffers can be
    /// shared across requests.
    fn begin_writing(self: &Arc<Self>, st: &mut TaskState, data: BodyBuf) {
        if st.completed {
            return;
        }
        self.guarded(st, "failed to set up response body writing", |task, st| {
            trace!(bytes = data.remaining(), "preparing response body");
            st.data_out = Some(data);
            let Some(response) = st.response.as_mut() else {
                return Ok(());
            };
            let mut stream = response.output_stream()?;
            stream.set_listener(Box::new(TaskWriteListener {
                task: Arc::clone(task),
            }));
            st.stream_out = Some(stream);
            Ok(())
        });
        // As with reading, the first continuation runs synchronously; the
        // container often accepts the whole body right away, in which case
        // the request finishes without a single write callback.
        self.continue_writing_locked(st);
    }

    fn continue_writing(self: &Arc<Self>) {
        let mut st = self.state.lock().unwrap();
        self.continue_writing_locked(&mut st);
    }

    /// Write as much of the body as the container will accept, returning to
    /// the caller when the stream reports not-ready.
    fn continue_writing_locked(self: &Arc<Self>, st: &mut TaskState) {
        trace!("write callback");
        if st.completed {
            return;
        }
        self.guarded(st, "failed to write the response body", |task, st| {
            let mut finished = false;
            {
                let Some(data) = st.data_out.as_mut() else {
                    return Ok(());
                };
                let Some(stream) = st.stream_out.as_mut() else {
                    return Ok(());
                };
                // Same one-and-a-half loop as reading: exhaustion is probed
                // before readiness.
                loop {
                    if data.remaining() == 0 {
                        trace!("response body fully written");
                        finished = true;
                        break;
                    }
                    if !stream.is_ready() {
                        trace!("output stream not ready");
                        task.metrics.response_waits.increment();
                        break;
                    }
                    let chunk = data.take(WRITE_CHUNK);
                    let count = chunk.len();
                    stream.write(chunk)?;
                    task.metrics.response_writes.increment();
                    task.metrics.response_bytes.add(count as u64);
                    trace!(count, "output stream accepted data");
                }
            }
            if finished {
                task.complete_locked(st);
            }
            Ok(())
        });
    }

    /// Container timeout. Cancel the evaluation and send a blank 504 unless
    /// a response is already underway; if the container won't take it, the
    /// guard completes the transaction and the container deals with it.
    ///
    /// No body is attempted: async writes under timeout conditions would
    /// likely fail, and blocking on writes is not an option.
    fn timeout(self: &Arc<Self>) {
        let mut st = self.state.lock().unwrap();
        trace!("timeout callback");
        // The evaluation is unaware of container events and must be
        // cancelled explicitly.
        self.cancel_locked(&st);
        if !st.responded && !st.completed {
            self.respond(&mut st, |response| {
                response.set_status(504);
                // HTTP permits caching error responses; Cache-Control makes
                // the client retry instead.
                response.set_header("Cache-Control", "no-cache, no-store");
            });
            match st.request.as_ref().and_then(|request| request.url()) {
                Some(url) => warn!(url, "timeout while processing request"),
                None => warn!("timeout while processing request"),
            }
            self.complete_locked(&mut st);
        }
        self.metrics.exceptions_timeout.increment();
    }

    /// Asynchronous container failure: instant death of the request. Never
    /// attempts to write anything.
    fn die(self: &Arc<Self>, error: io::Error) {
        let mut st = self.state.lock().unwrap();
        debug!(error = %error, "asynchronous container failure");
        self.cancel_locked(&st);
        self.complete_locked(&mut st);
        self.metrics.exceptions_async.increment();
    }

    fn cancel_locked(&self, st: &TaskState) {
        if let Some(future) = st.future.as_ref() {
            trace!("cancelling reactive evaluation");
            future.cancel();
        }
    }

    /// Terminal transition. Idempotent; completes the container transaction,
    /// settles the timers, and releases every per-request resource so the
    /// container response can no longer be touched.
    fn complete_locked(&self, st: &mut TaskState) {
        if st.completed {
            return;
        }
        trace!("completing async transaction");
        st.completed = true;
        if let Some(transaction) = st.transaction.as_ref() {
            if let Err(err) = transaction.complete() {
                warn!(error = %err, "async transaction refused completion");
            }
        }
        self.metrics.active_tasks.decrement();
        self.metrics.task_duration.record(st.started.elapsed());
        st.transaction = None;
        st.response = None;
        st.future = None;
        st.stream_in = None;
        st.stream_out = None;
        st.data_out = None;
        st.buffer_in = None;
        st.data_in = Vec::new();
    }

    /// Run container-facing code under exception watch: any failure logs at
    /// debug level, terminates the request, and bumps the container failure
    /// counter. Failures never propagate to the container.
    fn guarded<T>(
        self: &Arc<Self>,
        st: &mut TaskState,
        context: &'static str,
        run: impl FnOnce(&Arc<Self>, &mut TaskState) -> io::Result<T>,
    ) -> Option<T> {
        match run(self, st) {
            Ok(value) => Some(value),
            Err(error) => {
                debug!(error = %error, "{}", context);
                self.complete_locked(st);
                self.metrics.exceptions_container.increment();
                None
            }
        }
    }
}

/// Lifecycle events from the async transaction.
///
/// Completion events are either caused by our own `complete()` call or
/// accompany the error and timeout events handled below, so `on_complete`
/// stays empty.
struct TaskTransactionListener {
    task: Arc<ServletTask>,
}

impl TransactionListener for TaskTransactionListener {
    fn on_error(&self, error: io::Error) {
        trace!("async transaction signals error");
        self.task.die(error);
    }

    fn on_timeout(&self) {
        trace!("async transaction signals timeout");
        self.task.timeout();
    }
}

struct TaskReadListener {
    task: Arc<ServletTask>,
}

impl ReadListener for TaskReadListener {
    fn on_data_available(&self) {
        trace!("async reader signals data available");
        self.task.continue_reading();
    }

    fn on_all_data_read(&self) {
        // Available data and EOF are handled identically; the continuation
        // probes is_finished() itself.
        trace!("async reader signals all data read");
        self.task.continue_reading();
    }

    fn on_error(&self, error: io::Error) {
        trace!("async reader signals error");
        self.task.die(error);
    }
}

struct TaskWriteListener {
    task: Arc<ServletTask>,
}

impl WriteListener for TaskWriteListener {
    fn on_write_possible(&self) {
        trace!("async writer signals writability");
        self.task.continue_writing();
    }

    fn on_error(&self, error: io::Error) {
        trace!("async writer signals error");
        self.task.die(error);
    }
}
