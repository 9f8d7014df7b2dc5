use crate::container::RawRequest;
use crate::servlet::{Cookie, HeaderMap};
use std::error::Error;
use std::fmt;
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use url::Url;

/// Failure while converting a container request into a [`ReactiveRequest`].
///
/// Address strings never fail conversion (they fall back to the unspecified
/// address); only the URL can be unusable.
#[derive(Debug)]
pub enum RequestConvertError {
    /// The reconstructed request URL cannot be parsed.
    Url {
        url: String,
        source: url::ParseError,
    },
}

impl fmt::Display for RequestConvertError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestConvertError::Url { url, source } => {
                write!(f, "request URL '{url}' cannot be parsed: {source}")
            }
        }
    }
}

impl Error for RequestConvertError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            RequestConvertError::Url { source, .. } => Some(source),
        }
    }
}

impl From<RequestConvertError> for io::Error {
    fn from(err: RequestConvertError) -> Self {
        io::Error::new(io::ErrorKind::InvalidData, err)
    }
}

/// Complete HTTP request as pure data.
///
/// Application code must be able to treat the request as immutable: the
/// service function may be re-invoked with the same request any number of
/// times, and the application may keep a reference long after the request
/// was serviced. Everything, including the body, is therefore captured by
/// value; there is no live connection behind this type.
///
/// Setters exist to support unit tests and hand-built requests. Every field
/// has a usable default except the URL, which has no sensible one and stays
/// unset until assigned.
#[derive(Debug, Clone)]
pub struct ReactiveRequest {
    local: SocketAddr,
    remote: SocketAddr,
    method: String,
    url: Option<String>,
    headers: HeaderMap,
    cookies: Vec<Cookie>,
    data: Vec<u8>,
}

impl Default for ReactiveRequest {
    fn default() -> Self {
        let unspecified = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0);
        Self {
            local: unspecified,
            remote: unspecified,
            method: "GET".to_string(),
            url: None,
            headers: HeaderMap::new(),
            cookies: Vec::new(),
            data: Vec::new(),
        }
    }
}

impl ReactiveRequest {
    pub fn new() -> Self {
        Self::default()
    }

    /// Convert a container request, except for the body.
    ///
    /// The body arrives asynchronously and is installed later via
    /// [`set_data`](ReactiveRequest::set_data). Duplicate header values are
    /// joined with `", "`, which HTTP defines as equivalent to repeating the
    /// header. The URL is reassembled from the container's URL and query
    /// string, then parsed and normalized so that downstream code never sees
    /// a denormalized URL that sneaked past the front-end server.
    pub fn from_raw(raw: &dyn RawRequest) -> Result<Self, RequestConvertError> {
        let (local_ip, local_port) = raw.local_addr();
        let (remote_ip, remote_port) = raw.remote_addr();

        // The method stays an unvalidated token: whatever the container
        // delivers must reach dispatch, where unknown tokens earn a 405.
        let method = raw.method().to_ascii_uppercase();

        let mut url = raw.request_url();
        if let Some(query) = raw.query_string() {
            url.push('?');
            url.push_str(&query);
        }
        let url = match Url::parse(&url) {
            Ok(parsed) => parsed.to_string(),
            Err(source) => return Err(RequestConvertError::Url { url, source }),
        };

        let mut headers = HeaderMap::new();
        for name in raw.header_names() {
            let joined = raw.header_values(&name).join(", ");
            headers.insert(name, joined);
        }

        Ok(Self {
            local: parse_endpoint(local_ip.as_deref(), local_port),
            remote: parse_endpoint(remote_ip.as_deref(), remote_port),
            method,
            url: Some(url),
            headers,
            cookies: raw.cookies(),
            data: Vec::new(),
        })
    }

    pub fn local(&self) -> SocketAddr {
        self.local
    }

    pub fn set_local(&mut self, local: SocketAddr) -> &mut Self {
        self.local = local;
        self
    }

    pub fn remote(&self) -> SocketAddr {
        self.remote
    }

    pub fn set_remote(&mut self, remote: SocketAddr) -> &mut Self {
        self.remote = remote;
        self
    }

    /// Uppercase HTTP method token, `"GET"` by default.
    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn set_method(&mut self, method: impl Into<String>) -> &mut Self {
        self.method = method.into();
        self
    }

    pub fn url(&self) -> Option<&str> {
        self.url.as_deref()
    }

    pub fn set_url(&mut self, url: impl Into<String>) -> &mut Self {
        self.url = Some(url.into());
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

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn set_data(&mut self, data: Vec<u8>) -> &mut Self {
        self.data = data;
        self
    }
}

/// Parse a numeric IP string, falling back to the unspecified address with
/// the known port when the container reports something unparseable.
fn parse_endpoint(ip: Option<&str>, port: u16) -> SocketAddr {
    match ip.and_then(|s| s.parse::<IpAddr>().ok()) {
        Some(addr) => SocketAddr::new(addr, port),
        None => SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port),
    }
}
