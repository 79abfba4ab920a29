//! Application server core: a staged request-handler pipeline sitting in front of a
//! weighted-balancing outbound HTTP client, wired together with actix-web.
pub mod context;
pub mod error;
pub mod integration;
pub mod limiter;
pub mod logging;
pub mod pages;
pub mod pipeline;
pub mod renderer;
pub mod server;
pub mod slow_task;

pub use error::{ApiError, ApiErrorKind, ApiResult};
