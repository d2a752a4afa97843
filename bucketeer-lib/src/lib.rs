//! `bucketeer` is a client-side request scheduler for rate limited HTTP APIs.
//!
//! Every request is assigned a route key. Requests sharing a key run one at a
//! time, in order, within the quota the server reports in its rate limit
//! headers. Rate limited and transient failures are retried before the
//! caller ever sees them.
//!
//! ```no_run
//! use bucketeer_lib::{DispatcherBuilder, RequestOptions, Result};
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!   let dispatcher = DispatcherBuilder::builder()
//!       .token(secrecy::SecretString::from("Bot <token>"))
//!       .build()
//!       .dispatcher()?;
//!   let gateway = dispatcher
//!       .auth_request(RequestOptions::builder().method("GET").path("/gateway/bot").build())
//!       .await?;
//!   println!("{gateway}");
//!   Ok(())
//! }
//! ```
//!
//! Everything the dispatcher observes along the way is written to the `log`
//! facade and can also be received as [`Event`]s through
//! [`RequestDispatcher::subscribe`].
#![warn(missing_docs)]

mod dispatcher;
mod events;
mod ratelimit;
mod retry;
mod route;
mod transport;
mod types;

#[cfg(test)]
pub(crate) mod test_utils;

pub use dispatcher::{
    DEFAULT_BASE_URL, DEFAULT_TIMEOUT, DEFAULT_USER_AGENT, DispatcherBuilder, RequestDispatcher,
};
pub use events::{Event, RawRequest};
pub use ratelimit::{BucketSnapshot, DEFAULT_MAX_BAD_GATEWAY_RETRIES, RateLimitConfig};
pub use route::{RouteKey, SNOWFLAKE_EPOCH_MS, snowflake_created_at};
pub use transport::{RequestBody, ReqwestTransport, Transport, TransportRequest, TransportResponse};
pub use types::*;
