//! Handle the rate limiting headers sent by the remote API.
//!
//! Quota headers follow the vendor's `X-RateLimit-*` family. Durations are
//! given in (possibly fractional) seconds, the reset instant in fractional
//! seconds since the Unix epoch.

use http::{HeaderMap, HeaderValue};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use thiserror::Error;

pub(crate) const LIMIT: &str = "x-ratelimit-limit";
pub(crate) const REMAINING: &str = "x-ratelimit-remaining";
pub(crate) const RESET: &str = "x-ratelimit-reset";
pub(crate) const RESET_AFTER: &str = "x-ratelimit-reset-after";
pub(crate) const GLOBAL: &str = "x-ratelimit-global";
pub(crate) const SCOPE: &str = "x-ratelimit-scope";
pub(crate) const RETRY_AFTER: &str = "retry-after";

/// Scope value marking a limit shared across clients rather than owned by
/// this bucket.
pub(crate) const SHARED_SCOPE: &str = "shared";

#[derive(Debug, Error, PartialEq, Eq)]
pub(crate) enum RetryAfterParseError {
    #[error("Unable to parse value '{0}'")]
    ValueError(String),

    #[error("Header value contains invalid chars")]
    HeaderValueError,
}

/// Parse a delay header: either delay-seconds (fractions allowed, as the
/// vendor sends them) or an HTTP-date as per
/// [RFC 7231 section 7.1.3](https://www.rfc-editor.org/rfc/rfc7231#section-7.1.3)
pub(crate) fn parse_delay(value: &HeaderValue) -> Result<Duration, RetryAfterParseError> {
    let value = value
        .to_str()
        .map_err(|_| RetryAfterParseError::HeaderValueError)?;

    match value.trim().parse::<f64>() {
        Ok(secs) => Duration::try_from_secs_f64(secs)
            .map_err(|_| RetryAfterParseError::ValueError(value.into())),
        Err(_) => httpdate::parse_http_date(value)
            .map(|s| {
                s.duration_since(SystemTime::now())
                    // if date is in the past, we can use ZERO
                    .unwrap_or(Duration::ZERO)
            })
            .map_err(|_| RetryAfterParseError::ValueError(value.into())),
    }
}

/// Everything the dispatcher reads from a response's headers to update
/// bucket, global and clock state.
#[derive(Debug, Clone, Default, PartialEq)]
pub(crate) struct RateLimitHeaders {
    /// Window size, if the server sent a parsable one
    pub(crate) limit: Option<u32>,
    /// Requests left in the window. A present but unparsable header reads
    /// as zero
    pub(crate) remaining: Option<u32>,
    /// Whether both quota headers were present at all
    pub(crate) has_quota: bool,
    /// Relative reset, from `x-ratelimit-reset-after` or `retry-after`
    pub(crate) reset_after: Option<Duration>,
    /// Absolute reset in epoch milliseconds
    pub(crate) reset_at: Option<i64>,
    /// The response signals a global (cross-route) limit
    pub(crate) global: bool,
    /// Value of `x-ratelimit-scope`
    pub(crate) scope: Option<String>,
    /// The server's `Date`
    pub(crate) date: Option<SystemTime>,
}

impl RateLimitHeaders {
    pub(crate) fn from_headers(headers: &HeaderMap) -> Self {
        let limit = parse_header_value::<u32>(headers, LIMIT);
        let remaining = headers
            .get(REMAINING)
            .map(|_| parse_header_value::<u32>(headers, REMAINING).unwrap_or(0));

        let reset_after = [RESET_AFTER, RETRY_AFTER]
            .iter()
            .find_map(|name| headers.get(*name).and_then(|v| parse_delay(v).ok()));

        #[allow(clippy::cast_possible_truncation)]
        let reset_at = parse_header_value::<f64>(headers, RESET)
            .filter(|secs| secs.is_finite() && *secs >= 0.0)
            .map(|secs| (secs * 1000.0).round() as i64);

        let date = headers
            .get(http::header::DATE)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| httpdate::parse_http_date(v).ok());

        Self {
            limit,
            remaining,
            has_quota: headers.contains_key(LIMIT) && headers.contains_key(REMAINING),
            reset_after,
            reset_at,
            global: headers.contains_key(GLOBAL),
            scope: headers
                .get(SCOPE)
                .and_then(|v| v.to_str().ok())
                .map(str::to_owned),
            date,
        }
    }

    /// The limit is shared across clients and its delay lives in the body
    pub(crate) fn is_shared_scope(&self) -> bool {
        self.scope.as_deref() == Some(SHARED_SCOPE)
    }

    /// The server's `Date` in epoch milliseconds
    pub(crate) fn date_millis(&self) -> Option<i64> {
        self.date.map(system_time_millis)
    }
}

/// Convert a [`SystemTime`] to signed epoch milliseconds
pub(crate) fn system_time_millis(time: SystemTime) -> i64 {
    match time.duration_since(UNIX_EPOCH) {
        Ok(d) => i64::try_from(d.as_millis()).unwrap_or(i64::MAX),
        Err(e) => -i64::try_from(e.duration().as_millis()).unwrap_or(i64::MAX),
    }
}

/// Helper method to parse a single numeric header value
fn parse_header_value<T: std::str::FromStr>(headers: &HeaderMap, header_name: &str) -> Option<T> {
    headers
        .get(header_name)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.trim().parse::<T>().ok())
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use http::{HeaderMap, HeaderValue};
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    use super::*;

    #[test]
    fn test_retry_after() {
        assert_eq!(parse_delay(&value("1")), Ok(Duration::from_secs(1)));
        assert_eq!(parse_delay(&value("0.25")), Ok(Duration::from_millis(250)));
        assert_eq!(
            parse_delay(&value("-1")),
            Err(RetryAfterParseError::ValueError("-1".into()))
        );

        assert_eq!(
            parse_delay(&value("Fri, 15 May 2015 15:34:21 GMT")),
            Ok(Duration::ZERO)
        );

        let result = parse_delay(&value("Fri, 15 May 4099 15:34:21 GMT"));
        let is_in_future = matches!(result, Ok(d) if d.as_secs() > 0);
        assert!(is_in_future);
    }

    #[rstest]
    #[case(&[], None, false)]
    #[case(&[(REMAINING, "4")], Some(4), false)]
    #[case(&[(REMAINING, "lots")], Some(0), false)]
    #[case(&[(LIMIT, "5"), (REMAINING, "0")], Some(0), true)]
    fn test_remaining(
        #[case] pairs: &[(&str, &str)],
        #[case] remaining: Option<u32>,
        #[case] has_quota: bool,
    ) {
        let parsed = RateLimitHeaders::from_headers(&headers(pairs));
        assert_eq!(parsed.remaining, remaining);
        assert_eq!(parsed.has_quota, has_quota);
    }

    #[test]
    fn test_reset_after_prefers_ratelimit_header() {
        let parsed = RateLimitHeaders::from_headers(&headers(&[
            (RESET_AFTER, "1.5"),
            (RETRY_AFTER, "30"),
        ]));
        assert_eq!(parsed.reset_after, Some(Duration::from_millis(1500)));

        let parsed = RateLimitHeaders::from_headers(&headers(&[(RETRY_AFTER, "30")]));
        assert_eq!(parsed.reset_after, Some(Duration::from_secs(30)));
    }

    #[test]
    fn test_full_set() {
        let parsed = RateLimitHeaders::from_headers(&headers(&[
            (LIMIT, "5"),
            (REMAINING, "3"),
            (RESET, "1470173023.123"),
            (GLOBAL, "true"),
            (SCOPE, "shared"),
            ("date", "Wed, 03 Aug 2016 21:23:42 GMT"),
        ]));

        assert_eq!(parsed.limit, Some(5));
        assert_eq!(parsed.remaining, Some(3));
        assert_eq!(parsed.reset_at, Some(1_470_173_023_123));
        assert!(parsed.global);
        assert!(parsed.is_shared_scope());
        assert_eq!(parsed.date_millis(), Some(1_470_259_422_000));
    }

    fn headers(pairs: &[(&str, &str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, v) in pairs {
            map.insert(
                http::HeaderName::from_bytes(name.as_bytes()).unwrap(),
                value(v),
            );
        }
        map
    }

    fn value(v: &str) -> HeaderValue {
        HeaderValue::from_str(v).unwrap()
    }
}
