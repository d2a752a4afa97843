//! Per-route and global rate limiting.
//!
//! The remote API communicates its quotas in response headers, so nothing is
//! known about a route before its first response. Every route key therefore
//! starts out fully serial and is corrected as headers arrive.
//!
//! # Architecture
//!
//! - `RouteBucket`: quota state and admission queue for one route key
//! - `GlobalLock`: the cross-route lockout set by a global rate limit
//! - `LatencyRef`: rolling latency and clock offset estimates
//! - [`RateLimitConfig`]: knobs shared by all of the above

mod bucket;
mod config;
mod global;
pub(crate) mod headers;
mod latency;
mod window;

use std::time::SystemTime;

pub use bucket::BucketSnapshot;
pub(crate) use bucket::RouteBucket;
pub use config::{DEFAULT_MAX_BAD_GATEWAY_RETRIES, RateLimitConfig};
pub(crate) use global::{Admission, GlobalLock};
pub(crate) use headers::RateLimitHeaders;
pub(crate) use latency::LatencyRef;

/// Wall clock time in epoch milliseconds
pub(crate) fn now_millis() -> i64 {
    headers::system_time_millis(SystemTime::now())
}
