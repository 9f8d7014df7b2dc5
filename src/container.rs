//! Contract between the adapter and the embedding HTTP container.
//!
//! The container owns sockets, HTTP framing, and its thread pool; the
//! adapter sees it only through the trait objects below. Every I/O method is
//! non-blocking: instead of waiting, streams report readiness and invoke a
//! registered listener once progress is possible again.
//!
//! Listener registration follows the container convention that callbacks
//! registered from within a method do not fire during that method's own
//! execution. The adapter relies on this to run the first read and write
//! continuations synchronously without risking recursion.

use crate::servlet::Cookie;
use std::io;
use std::sync::Arc;

/// Lifecycle events of an [`AsyncTransaction`].
pub trait TransactionListener: Send + Sync {
    fn on_start(&self) {}
    fn on_complete(&self) {}
    fn on_error(&self, error: io::Error);
    fn on_timeout(&self);
}

/// A single HTTP request detached from the container's synchronous handler.
///
/// Produced by [`RawRequest::start_async`]. The transaction stays open until
/// [`complete`](AsyncTransaction::complete) is called; the container enforces
/// an upper bound on its lifetime and reports expiry through
/// [`TransactionListener::on_timeout`] (30s is the conventional default).
pub trait AsyncTransaction: Send + Sync {
    fn set_listener(&self, listener: Box<dyn TransactionListener>);

    /// Schedule a job on the container's thread pool.
    ///
    /// Fails once the transaction has been completed; containers are free to
    /// refuse scheduling at that point.
    fn spawn(&self, job: Box<dyn FnOnce() + Send>) -> io::Result<()>;

    /// Finish the transaction and release the underlying exchange.
    fn complete(&self) -> io::Result<()>;
}

/// Readiness events of a [`RequestStream`].
pub trait ReadListener: Send + Sync {
    /// More body data arrived after `is_ready` returned false.
    fn on_data_available(&self);
    /// The request body has been fully received.
    fn on_all_data_read(&self);
    fn on_error(&self, error: io::Error);
}

/// Non-blocking source of request body bytes.
pub trait RequestStream: Send {
    /// True once the whole body has been consumed.
    fn is_finished(&self) -> bool;
    /// True when at least one byte can be read without blocking.
    fn is_ready(&self) -> bool;

    /// Read available bytes into `buf`.
    ///
    /// Returns `Ok(None)` as an end-of-stream marker; callers are expected
    /// to rely on [`is_finished`](RequestStream::is_finished) rather than on
    /// the marker to terminate reading.
    fn read(&mut self, buf: &mut [u8]) -> io::Result<Option<usize>>;

    fn close(&mut self) -> io::Result<()>;
    fn set_listener(&mut self, listener: Box<dyn ReadListener>);
}

/// Readiness events of a [`ResponseStream`].
pub trait WriteListener: Send + Sync {
    /// Buffer space opened up after `is_ready` returned false.
    fn on_write_possible(&self);
    fn on_error(&self, error: io::Error);
}

/// Non-blocking sink for response body bytes.
pub trait ResponseStream: Send {
    /// True when a write can be accepted without blocking.
    fn is_ready(&self) -> bool;
    fn write(&mut self, chunk: &[u8]) -> io::Result<()>;
    fn set_listener(&mut self, listener: Box<dyn WriteListener>);
}

/// Container view of an inbound request, consumed during conversion.
pub trait RawRequest: Send {
    /// Server-side endpoint as a numeric IP string (if known) and port.
    fn local_addr(&self) -> (Option<String>, u16);
    /// Client-side endpoint as a numeric IP string (if known) and port.
    fn remote_addr(&self) -> (Option<String>, u16);
    fn method(&self) -> String;
    /// Absolute request URL without the query string.
    fn request_url(&self) -> String;
    fn query_string(&self) -> Option<String>;
    fn header_names(&self) -> Vec<String>;
    /// All values received for a header name, in wire order.
    fn header_values(&self, name: &str) -> Vec<String>;
    fn cookies(&self) -> Vec<Cookie>;

    /// Detach this request from the container's synchronous handler.
    fn start_async(&self) -> io::Result<Arc<dyn AsyncTransaction>>;
    fn input_stream(&self) -> io::Result<Box<dyn RequestStream>>;
}

/// Container view of the outbound response.
///
/// Status, headers, and cookies must be set before the first body write.
pub trait RawResponse: Send {
    fn set_status(&mut self, status: u16);
    fn set_header(&mut self, name: &str, value: &str);
    fn add_cookie(&mut self, cookie: &Cookie);
    fn output_stream(&mut self) -> io::Result<Box<dyn ResponseStream>>;
}
