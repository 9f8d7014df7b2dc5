//! Shared test harness: a scripted mock container and a deferred executor.
//!
//! The mocks record every observable container interaction so tests can
//! assert on exactly what a client-facing container would have seen. All
//! asynchrony is made deterministic: evaluation jobs and container-pool jobs
//! go into queues that the test pumps explicitly, and input/output readiness
//! follows a script instead of a socket.

#![allow(dead_code)]

use reservlet::container::{
    AsyncTransaction, RawRequest, RawResponse, ReadListener, RequestStream, ResponseStream,
    TransactionListener, WriteListener,
};
use reservlet::executor::Executor;
use reservlet::metrics::ServletMetrics;
use reservlet::reactive;
use reservlet::servlet::{Cookie, ReactiveRequest, ReactiveResponse, ReactiveServlet};
use std::collections::VecDeque;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

type Job = Box<dyn FnOnce() + Send>;

/// Install a test subscriber once per process; `RUST_LOG=reservlet=trace`
/// makes the state machine narrate itself during a failing test.
pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Executor that queues jobs until the test pumps them.
#[derive(Default)]
pub struct DeferredExecutor {
    jobs: Mutex<VecDeque<Job>>,
}

impl DeferredExecutor {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Run queued jobs until the queue drains; returns how many ran.
    pub fn run_pending(&self) -> usize {
        let mut count = 0;
        loop {
            let job = self.jobs.lock().unwrap().pop_front();
            match job {
                Some(job) => {
                    job();
                    count += 1;
                }
                None => break,
            }
        }
        count
    }
}

impl Executor for DeferredExecutor {
    fn execute(&self, job: Job) {
        self.jobs.lock().unwrap().push_back(job);
    }
}

/// Mock async transaction with an explicit container-pool queue.
///
/// Scheduling after completion fails, which is what real containers do and
/// what the scheduling guard has to cope with.
#[derive(Default)]
pub struct MockTransaction {
    listener: Mutex<Option<Box<dyn TransactionListener>>>,
    jobs: Mutex<VecDeque<Job>>,
    completed: AtomicBool,
    refuse_completion: AtomicBool,
}

impl MockTransaction {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn is_completed(&self) -> bool {
        self.completed.load(Ordering::SeqCst)
    }

    /// Make `complete()` fail, simulating a container that already tore the
    /// exchange down on its own.
    pub fn refuse_completion(&self) {
        self.refuse_completion.store(true, Ordering::SeqCst);
    }

    /// Run queued container-pool jobs; returns how many ran.
    pub fn run_pending(&self) -> usize {
        let mut count = 0;
        loop {
            let job = self.jobs.lock().unwrap().pop_front();
            match job {
                Some(job) => {
                    job();
                    count += 1;
                }
                None => break,
            }
        }
        count
    }

    pub fn fire_timeout(&self) {
        let listener = self.listener.lock().unwrap();
        if let Some(listener) = listener.as_ref() {
            listener.on_timeout();
        }
    }

    pub fn fire_error(&self, message: &str) {
        let listener = self.listener.lock().unwrap();
        if let Some(listener) = listener.as_ref() {
            listener.on_error(io::Error::new(io::ErrorKind::Other, message.to_string()));
        }
    }
}

impl AsyncTransaction for MockTransaction {
    fn set_listener(&self, listener: Box<dyn TransactionListener>) {
        *self.listener.lock().unwrap() = Some(listener);
    }

    fn spawn(&self, job: Job) -> io::Result<()> {
        if self.is_completed() {
            return Err(io::Error::new(
                io::ErrorKind::Other,
                "transaction already completed",
            ));
        }
        self.jobs.lock().unwrap().push_back(job);
        Ok(())
    }

    fn complete(&self) -> io::Result<()> {
        if self.refuse_completion.load(Ordering::SeqCst) {
            return Err(io::Error::new(io::ErrorKind::Other, "completion refused"));
        }
        self.completed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// One step of the scripted request body.
pub enum InputStep {
    /// Bytes available for reading without blocking.
    Data(Vec<u8>),
    /// Readiness gap; cleared by [`InputScript::resume`].
    Pause,
}

/// Scripted request-body source shared between the test and the stream
/// handed to the task.
#[derive(Default)]
pub struct InputScript {
    steps: Mutex<VecDeque<InputStep>>,
    listener: Mutex<Option<Box<dyn ReadListener>>>,
    closed: AtomicBool,
}

impl InputScript {
    pub fn new(steps: Vec<InputStep>) -> Arc<Self> {
        Arc::new(Self {
            steps: Mutex::new(steps.into()),
            ..Self::default()
        })
    }

    /// Already-finished body: reading completes synchronously.
    pub fn finished() -> Arc<Self> {
        Self::new(Vec::new())
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Clear a leading pause and wake the registered reader.
    pub fn resume(&self) {
        let drained = {
            let mut steps = self.steps.lock().unwrap();
            if matches!(steps.front(), Some(InputStep::Pause)) {
                steps.pop_front();
            }
            steps.is_empty()
        };
        let listener = self.listener.lock().unwrap();
        if let Some(listener) = listener.as_ref() {
            if drained {
                listener.on_all_data_read();
            } else {
                listener.on_data_available();
            }
        }
    }

    pub fn fire_error(&self, message: &str) {
        let listener = self.listener.lock().unwrap();
        if let Some(listener) = listener.as_ref() {
            listener.on_error(io::Error::new(io::ErrorKind::Other, message.to_string()));
        }
    }
}

pub struct MockInputStream {
    script: Arc<InputScript>,
}

impl RequestStream for MockInputStream {
    fn is_finished(&self) -> bool {
        self.script.steps.lock().unwrap().is_empty()
    }

    fn is_ready(&self) -> bool {
        matches!(
            self.script.steps.lock().unwrap().front(),
            Some(InputStep::Data(_))
        )
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<Option<usize>> {
        let mut steps = self.script.steps.lock().unwrap();
        match steps.front_mut() {
            Some(InputStep::Data(data)) => {
                let count = buf.len().min(data.len());
                buf[..count].copy_from_slice(&data[..count]);
                data.drain(..count);
                if data.is_empty() {
                    steps.pop_front();
                }
                Ok(Some(count))
            }
            _ => Ok(None),
        }
    }

    fn close(&mut self) -> io::Result<()> {
        self.script.closed.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn set_listener(&mut self, listener: Box<dyn ReadListener>) {
        *self.script.listener.lock().unwrap() = Some(listener);
    }
}

/// Scripted response-body sink. Each accepted write consumes one unit of
/// allowance; at zero allowance the stream reports not-ready until the test
/// calls [`OutputScript::resume`].
pub struct OutputScript {
    written: Mutex<Vec<u8>>,
    allowance: Mutex<usize>,
    listener: Mutex<Option<Box<dyn WriteListener>>>,
}

impl OutputScript {
    /// Always-writable sink.
    pub fn open() -> Arc<Self> {
        Self::with_allowance(usize::MAX)
    }

    /// Sink that accepts `allowance` writes before reporting not-ready.
    pub fn with_allowance(allowance: usize) -> Arc<Self> {
        Arc::new(Self {
            written: Mutex::new(Vec::new()),
            allowance: Mutex::new(allowance),
            listener: Mutex::new(None),
        })
    }

    pub fn written(&self) -> Vec<u8> {
        self.written.lock().unwrap().clone()
    }

    /// Grant more write allowance and wake the registered writer.
    pub fn resume(&self, allowance: usize) {
        *self.allowance.lock().unwrap() = allowance;
        let listener = self.listener.lock().unwrap();
        if let Some(listener) = listener.as_ref() {
            listener.on_write_possible();
        }
    }

    pub fn fire_error(&self, message: &str) {
        let listener = self.listener.lock().unwrap();
        if let Some(listener) = listener.as_ref() {
            listener.on_error(io::Error::new(io::ErrorKind::Other, message.to_string()));
        }
    }
}

pub struct MockOutputStream {
    script: Arc<OutputScript>,
}

impl ResponseStream for MockOutputStream {
    fn is_ready(&self) -> bool {
        *self.script.allowance.lock().unwrap() > 0
    }

    fn write(&mut self, chunk: &[u8]) -> io::Result<()> {
        let mut allowance = self.script.allowance.lock().unwrap();
        if *allowance == 0 {
            return Err(io::Error::new(io::ErrorKind::WouldBlock, "not ready"));
        }
        if *allowance != usize::MAX {
            *allowance -= 1;
        }
        self.script.written.lock().unwrap().extend_from_slice(chunk);
        Ok(())
    }

    fn set_listener(&mut self, listener: Box<dyn WriteListener>) {
        *self.script.listener.lock().unwrap() = Some(listener);
    }
}

/// Scripted container request.
pub struct MockRawRequest {
    pub method: String,
    pub url: String,
    pub query: Option<String>,
    pub local: (Option<String>, u16),
    pub remote: (Option<String>, u16),
    pub headers: Vec<(String, String)>,
    pub cookies: Vec<Cookie>,
    pub transaction: Arc<MockTransaction>,
    pub input: Arc<InputScript>,
    /// Makes `input_stream()` fail, for guard-path tests.
    pub fail_input: bool,
}

impl MockRawRequest {
    pub fn get(url: &str, transaction: Arc<MockTransaction>, input: Arc<InputScript>) -> Self {
        Self {
            method: "GET".to_string(),
            url: url.to_string(),
            query: None,
            local: (Some("127.0.0.1".to_string()), 80),
            remote: (Some("127.0.0.1".to_string()), 49152),
            headers: Vec::new(),
            cookies: Vec::new(),
            transaction,
            input,
            fail_input: false,
        }
    }
}

impl RawRequest for MockRawRequest {
    fn local_addr(&self) -> (Option<String>, u16) {
        self.local.clone()
    }

    fn remote_addr(&self) -> (Option<String>, u16) {
        self.remote.clone()
    }

    fn method(&self) -> String {
        self.method.clone()
    }

    fn request_url(&self) -> String {
        self.url.clone()
    }

    fn query_string(&self) -> Option<String> {
        self.query.clone()
    }

    fn header_names(&self) -> Vec<String> {
        let mut names: Vec<String> = Vec::new();
        for (name, _) in &self.headers {
            if !names.iter().any(|seen| seen.eq_ignore_ascii_case(name)) {
                names.push(name.clone());
            }
        }
        names
    }

    fn header_values(&self, name: &str) -> Vec<String> {
        self.headers
            .iter()
            .filter(|(candidate, _)| candidate.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.clone())
            .collect()
    }

    fn cookies(&self) -> Vec<Cookie> {
        self.cookies.clone()
    }

    fn start_async(&self) -> io::Result<Arc<dyn AsyncTransaction>> {
        Ok(Arc::clone(&self.transaction) as Arc<dyn AsyncTransaction>)
    }

    fn input_stream(&self) -> io::Result<Box<dyn RequestStream>> {
        if self.fail_input {
            return Err(io::Error::new(io::ErrorKind::Other, "no input stream"));
        }
        Ok(Box::new(MockInputStream {
            script: Arc::clone(&self.input),
        }))
    }
}

/// Everything the container would have sent to the client.
#[derive(Default)]
pub struct ResponseRecord {
    /// Every `set_status` call in order; at-most-once response means at most
    /// one entry.
    pub statuses: Mutex<Vec<u16>>,
    pub headers: Mutex<Vec<(String, String)>>,
    pub cookies: Mutex<Vec<Cookie>>,
}

impl ResponseRecord {
    pub fn status(&self) -> Option<u16> {
        self.statuses.lock().unwrap().first().copied()
    }

    pub fn status_count(&self) -> usize {
        self.statuses.lock().unwrap().len()
    }

    pub fn header(&self, name: &str) -> Option<String> {
        self.headers
            .lock()
            .unwrap()
            .iter()
            .find(|(candidate, _)| candidate.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.clone())
    }

    pub fn header_count(&self) -> usize {
        self.headers.lock().unwrap().len()
    }

    pub fn cookie_names(&self) -> Vec<String> {
        self.cookies
            .lock()
            .unwrap()
            .iter()
            .map(|cookie| cookie.name().to_string())
            .collect()
    }
}

pub struct MockRawResponse {
    pub record: Arc<ResponseRecord>,
    pub output: Arc<OutputScript>,
}

impl RawResponse for MockRawResponse {
    fn set_status(&mut self, status: u16) {
        self.record.statuses.lock().unwrap().push(status);
    }

    fn set_header(&mut self, name: &str, value: &str) {
        self.record
            .headers
            .lock()
            .unwrap()
            .push((name.to_string(), value.to_string()));
    }

    fn add_cookie(&mut self, cookie: &Cookie) {
        self.record.cookies.lock().unwrap().push(cookie.clone());
    }

    fn output_stream(&mut self) -> io::Result<Box<dyn ResponseStream>> {
        Ok(Box::new(MockOutputStream {
            script: Arc::clone(&self.output),
        }))
    }
}

/// Servlet built from a closure, pinned to the test executor.
pub struct FnServlet {
    service: Box<dyn Fn(&ReactiveRequest) -> ReactiveResponse + Send + Sync>,
    executor: Arc<dyn Executor>,
}

impl FnServlet {
    pub fn new(
        executor: Arc<DeferredExecutor>,
        service: impl Fn(&ReactiveRequest) -> ReactiveResponse + Send + Sync + 'static,
    ) -> Arc<Self> {
        Arc::new(Self {
            service: Box::new(service),
            executor,
        })
    }
}

impl ReactiveServlet for FnServlet {
    fn service(&self, request: &ReactiveRequest) -> ReactiveResponse {
        (self.service)(request)
    }

    fn executor(&self) -> Arc<dyn Executor> {
        Arc::clone(&self.executor)
    }
}

/// One scripted exchange plus all of its observation points.
pub struct Exchange {
    pub transaction: Arc<MockTransaction>,
    pub input: Arc<InputScript>,
    pub output: Arc<OutputScript>,
    pub record: Arc<ResponseRecord>,
    pub executor: Arc<DeferredExecutor>,
    pub metrics: Arc<ServletMetrics>,
}

impl Exchange {
    pub fn new(input: Arc<InputScript>, output: Arc<OutputScript>) -> Self {
        init_tracing();
        Self {
            transaction: MockTransaction::new(),
            input,
            output,
            record: Arc::new(ResponseRecord::default()),
            executor: DeferredExecutor::new(),
            metrics: Arc::new(ServletMetrics::new()),
        }
    }

    pub fn request(&self, method: &str, url: &str) -> MockRawRequest {
        let mut request = MockRawRequest::get(
            url,
            Arc::clone(&self.transaction),
            Arc::clone(&self.input),
        );
        request.method = method.to_string();
        request
    }

    pub fn response(&self) -> MockRawResponse {
        MockRawResponse {
            record: Arc::clone(&self.record),
            output: Arc::clone(&self.output),
        }
    }

    /// Start the exchange through the public entry point.
    pub fn serve(&self, servlet: Arc<dyn ReactiveServlet>, request: MockRawRequest) {
        reservlet::serve_with(
            servlet,
            reactive::shared(),
            Arc::clone(&self.metrics),
            Box::new(request),
            Box::new(self.response()),
        );
    }

    /// Pump the evaluation queue and the container pool until quiescent.
    pub fn pump(&self) {
        loop {
            let ran = self.executor.run_pending() + self.transaction.run_pending();
            if ran == 0 {
                break;
            }
        }
    }
}
