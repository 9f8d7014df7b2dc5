pub mod container;
pub mod executor;
pub mod metrics;
pub mod reactive;
pub mod servlet;
pub mod task;

pub use metrics::ServletMetrics;
pub use servlet::{
    method_not_allowed, BodyBuf, Cookie, HeaderMap, ReactiveRequest, ReactiveResponse,
    ReactiveServlet, RequestConvertError,
};
pub use task::{serve, serve_with, ServletTask};
