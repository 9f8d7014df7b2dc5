use crate::executor::{self, Executor};
use crate::servlet::{BodyBuf, ReactiveRequest, ReactiveResponse};
use http::Method;
use once_cell::sync::Lazy;
use std::collections::BTreeSet;
use std::sync::Arc;

/// Prebuilt 405 shared by all default method handlers. Plain `HttpServlet`
/// sends its errors with caching enabled; the Cache-Control header makes
/// sure clients retry instead.
static DISALLOWED: Lazy<ReactiveResponse> = Lazy::new(|| {
    let mut response = ReactiveResponse::new();
    response.set_status(405);
    response
        .headers_mut()
        .insert("Cache-Control", "no-cache, no-store");
    response
});

/// The 405 Method Not Allowed response default handlers return.
pub fn method_not_allowed() -> ReactiveResponse {
    DISALLOWED.clone()
}

/// Application-facing servlet surface.
///
/// A servlet supplies a single function from an immutable request to a
/// response value, either by overriding one or more per-method handlers or
/// by overriding [`service`](ReactiveServlet::service) outright. The
/// function may reactively block: when its inputs are not yet available it
/// returns a draft, and the reactive evaluator re-invokes it until the first
/// non-draft response, which the adapter then streams to the client. The
/// handler must therefore not observe mutation performed by its own previous
/// invocations.
///
/// Handlers default to 405 Method Not Allowed except `HEAD`, which defers to
/// `GET` and strips the body, and `OPTIONS`, which reports the methods named
/// by [`implemented`](ReactiveServlet::implemented). `TRACE` is deliberately
/// not implemented by default for security reasons; servlets that want it
/// must override `do_trace`.
pub trait ReactiveServlet: Send + Sync + 'static {
    /// Methods this servlet declares handlers for.
    ///
    /// Drives the default `OPTIONS` response. Overriding a `do_*` handler
    /// without listing its method here leaves the handler reachable but
    /// unadvertised.
    fn implemented(&self) -> Vec<Method> {
        Vec::new()
    }

    fn do_get(&self, _request: &ReactiveRequest) -> ReactiveResponse {
        method_not_allowed()
    }

    fn do_post(&self, _request: &ReactiveRequest) -> ReactiveResponse {
        method_not_allowed()
    }

    fn do_put(&self, _request: &ReactiveRequest) -> ReactiveResponse {
        method_not_allowed()
    }

    fn do_delete(&self, _request: &ReactiveRequest) -> ReactiveResponse {
        method_not_allowed()
    }

    fn do_trace(&self, _request: &ReactiveRequest) -> ReactiveResponse {
        method_not_allowed()
    }

    /// `HEAD` defaults to `GET` without the body.
    fn do_head(&self, request: &ReactiveRequest) -> ReactiveResponse {
        let mut response = self.do_get(request);
        response.set_body(BodyBuf::empty());
        response
    }

    /// `OPTIONS` reports the supported methods in a sorted `Allow` header.
    ///
    /// `OPTIONS` itself is always included, and `HEAD` is included whenever
    /// `GET` is implemented because the default `HEAD` handler works off
    /// `GET`. Servlets wanting extra headers can override this, call the
    /// default through a helper of their own, or rebuild the response.
    fn do_options(&self, _request: &ReactiveRequest) -> ReactiveResponse {
        let implemented = self.implemented();
        let mut methods: BTreeSet<&str> = BTreeSet::new();
        methods.insert("OPTIONS");
        for method in &implemented {
            methods.insert(method.as_str());
            if *method == Method::GET {
                methods.insert("HEAD");
            }
        }
        let allow = methods.into_iter().collect::<Vec<_>>().join(", ");

        let mut response = ReactiveResponse::new();
        response.headers_mut().insert("Allow", allow);
        response
            .headers_mut()
            .insert("Cache-Control", "no-cache, no-store");
        response
    }

    /// Dispatch on the request method.
    ///
    /// Unknown methods get 405 Method Not Allowed rather than 501: the
    /// problem is the method, and the client should learn that. Note that
    /// `PATCH` has no dedicated handler and also lands here.
    fn service(&self, request: &ReactiveRequest) -> ReactiveResponse {
        match request.method() {
            "GET" => self.do_get(request),
            "HEAD" => self.do_head(request),
            "POST" => self.do_post(request),
            "PUT" => self.do_put(request),
            "DELETE" => self.do_delete(request),
            "OPTIONS" => self.do_options(request),
            "TRACE" => self.do_trace(request),
            _ => method_not_allowed(),
        }
    }

    /// Executor the reactive evaluator runs this servlet's `service` on.
    ///
    /// Defaults to the shared coroutine pool. Servlets doing heavy
    /// processing or blocking calls should supply their own executor so they
    /// don't starve the shared one; container I/O stays on the container's
    /// pool either way.
    fn executor(&self) -> Arc<dyn Executor> {
        executor::shared()
    }
}
