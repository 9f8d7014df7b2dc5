use crate::servlet::{Cookie, HeaderMap};
use std::sync::Arc;

/// Read-only window over shared response bytes.
///
/// The body lies between `position` and `limit`. Cloning (or
/// [`duplicate`](BodyBuf::duplicate)) copies only the window, never the
/// bytes, so a servlet can hand out the same buffer for every request and a
/// range response can expose a sub-window of a larger buffer. Consuming a
/// duplicate advances the duplicate's position only; the originating value
/// is never disturbed.
#[derive(Debug, Clone)]
pub struct BodyBuf {
    bytes: Arc<[u8]>,
    position: usize,
    limit: usize,
}

impl BodyBuf {
    pub fn empty() -> Self {
        let bytes: Arc<[u8]> = Arc::new([]);
        Self {
            bytes,
            position: 0,
            limit: 0,
        }
    }

    /// Window over a sub-range of shared bytes.
    ///
    /// Panics when `position > limit` or `limit` exceeds the buffer length,
    /// mirroring slice indexing.
    pub fn window(bytes: Arc<[u8]>, position: usize, limit: usize) -> Self {
        assert!(
            position <= limit && limit <= bytes.len(),
            "window {position}..{limit} out of bounds for buffer of {}",
            bytes.len()
        );
        Self {
            bytes,
            position,
            limit,
        }
    }

    /// Value copy of the window; the shared bytes are not copied.
    pub fn duplicate(&self) -> Self {
        self.clone()
    }

    pub fn position(&self) -> usize {
        self.position
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn remaining(&self) -> usize {
        self.limit - self.position
    }

    /// Bytes still in the window.
    pub fn as_slice(&self) -> &[u8] {
        &self.bytes[self.position..self.limit]
    }

    /// Consume and return up to `max` bytes, advancing the position.
    pub fn take(&mut self, max: usize) -> &[u8] {
        let count = max.min(self.remaining());
        let start = self.position;
        self.position += count;
        &self.bytes[start..start + count]
    }
}

impl Default for BodyBuf {
    fn default() -> Self {
        Self::empty()
    }
}

impl From<Vec<u8>> for BodyBuf {
    fn from(bytes: Vec<u8>) -> Self {
        let limit = bytes.len();
        Self {
            bytes: Arc::from(bytes),
            position: 0,
            limit,
        }
    }
}

impl From<&[u8]> for BodyBuf {
    fn from(bytes: &[u8]) -> Self {
        bytes.to_vec().into()
    }
}

impl From<&str> for BodyBuf {
    fn from(text: &str) -> Self {
        text.as_bytes().into()
    }
}

impl From<String> for BodyBuf {
    fn from(text: String) -> Self {
        text.into_bytes().into()
    }
}

/// Complete HTTP response as pure data.
///
/// A reactive service function may produce its response several times, as
/// drafts and then once as the final result, so the response must be fully
/// detached from the container: status, headers, cookies, and the whole body
/// in a buffer. Streaming is deliberately unsupported.
///
/// The default value is a valid empty 200 response, which keeps application
/// code and tests short.
#[derive(Debug, Clone)]
pub struct ReactiveResponse {
    status: u16,
    headers: HeaderMap,
    cookies: Vec<Cookie>,
    body: BodyBuf,
}

impl Default for ReactiveResponse {
    fn default() -> Self {
        Self {
            status: 200,
            headers: HeaderMap::new(),
            cookies: Vec::new(),
            body: BodyBuf::empty(),
        }
    }
}

impl ReactiveResponse {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn status(&self) -> u16 {
        self.status
    }

    pub fn set_status(&mut self, status: u16) -> &mut Self {
        self.status = status;
        self
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    pub fn set_headers(&mut self, headers: HeaderMap) -> &mut Self {
        self.headers = headers;
        self
    }

    pub fn cookies(&self) -> &[Cookie] {
        &self.cookies
    }

    pub fn cookies_mut(&mut self) -> &mut Vec<Cookie> {
        &mut self.cookies
    }

    pub fn set_cookies(&mut self, cookies: Vec<Cookie>) -> &mut Self {
        self.cookies = cookies;
        self
    }

    pub fn body(&self) -> &BodyBuf {
        &self.body
    }

    pub fn set_body(&mut self, body: impl Into<BodyBuf>) -> &mut Self {
        self.body = body.into();
        self
    }
}
