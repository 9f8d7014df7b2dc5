//! # Servlet Module
//!
//! Application-facing surface of the adapter: the [`ReactiveServlet`] trait
//! plus the pure-data request and response values it works with.
//!
//! ## Overview
//!
//! An application implements [`ReactiveServlet`] by overriding any subset of
//! the per-method handlers (or `service` itself). The adapter hands it an
//! immutable [`ReactiveRequest`] with a fully buffered body and receives a
//! [`ReactiveResponse`] carrying status, headers, cookies, and the complete
//! body as a [`BodyBuf`] window. Because the response is pure data, the
//! reactive evaluator is free to call `service` as many times as it needs
//! until the application yields its first non-draft result.
//!
//! ## Request flow
//!
//! ```text
//! container request → ReactiveRequest::from_raw → async body read
//!     → service(&request) on the servlet's executor → ReactiveResponse
//!     → async body write → transaction complete
//! ```
//!
//! Everything between the container edges is driven by the per-request task
//! in [`crate::task`]; servlets never see the container or the task.

mod cookie;
mod core;
mod headers;
mod request;
mod response;

pub use cookie::Cookie;
pub use core::{method_not_allowed, ReactiveServlet};
pub use headers::HeaderMap;
pub use request::{ReactiveRequest, RequestConvertError};
pub use response::{BodyBuf, ReactiveResponse};
