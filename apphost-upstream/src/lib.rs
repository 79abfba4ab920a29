//! Weighted upstream server pools: the load-balancing core behind the HTTP client, grounded on
//! frontik's `http_client.Server`/`Upstream` classes and re-expressed for a multi-threaded async
//! runtime instead of a single-threaded event loop.
mod pool;
mod registry;
mod server;

pub use pool::{ReturnOutcome, ServerPool};
pub use registry::{UpstreamError, UpstreamRegistry};
pub use server::Server;
