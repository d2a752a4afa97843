use std::time::Duration;

use http::StatusCode;
use rand::Rng;

/// Bounds of the random backoff before a 502 is retried, in milliseconds
const BAD_GATEWAY_BACKOFF_MS: std::ops::Range<u64> = 100..2_000;

/// What the dispatch loop does with a response
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Disposition {
    /// Hand the body to the caller
    Resolve,
    /// Rate limited: wait as long as the server says, then try again
    RateLimited,
    /// Transient upstream failure, retried a bounded number of times
    BadGateway,
    /// Terminal failure
    Reject,
}

/// An extension trait to decide how a response status is handled.
pub(crate) trait RetryExt {
    fn disposition(&self) -> Disposition;
}

impl RetryExt for StatusCode {
    fn disposition(&self) -> Disposition {
        match *self {
            StatusCode::TOO_MANY_REQUESTS => Disposition::RateLimited,
            StatusCode::BAD_GATEWAY => Disposition::BadGateway,
            // 3xx other than 300 itself counts as a failure; the API never
            // redirects on purpose
            status if status.as_u16() > 300 => Disposition::Reject,
            _ => Disposition::Resolve,
        }
    }
}

/// How many 502s a single request may still retry.
#[derive(Debug, Clone, Copy)]
pub(crate) struct BadGatewayBudget {
    remaining: usize,
    attempts: usize,
}

impl BadGatewayBudget {
    pub(crate) const fn new(max_retries: usize) -> Self {
        Self {
            remaining: max_retries,
            attempts: 0,
        }
    }

    /// Record a 502 and decide whether it may be retried
    pub(crate) fn try_retry(&mut self) -> bool {
        self.attempts += 1;
        if self.remaining == 0 {
            return false;
        }
        self.remaining -= 1;
        true
    }

    /// Number of 502s seen so far
    pub(crate) const fn attempts(&self) -> usize {
        self.attempts
    }
}

/// Random delay before retrying a 502
pub(crate) fn bad_gateway_backoff() -> Duration {
    Duration::from_millis(rand::thread_rng().gen_range(BAD_GATEWAY_BACKOFF_MS))
}

/// Find the first error of type `T` in the source chain of `err`, including
/// `err` itself.
pub(crate) fn find_source<'a, T: std::error::Error + 'static>(
    err: &'a (dyn std::error::Error + 'static),
) -> Option<&'a T> {
    let mut source = Some(err);

    while let Some(err) = source {
        if let Some(found) = err.downcast_ref::<T>() {
            return Some(found);
        }
        source = err.source();
    }
    None
}

#[cfg(test)]
mod tests {
    use http::StatusCode;
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case(StatusCode::OK, Disposition::Resolve)]
    #[case(StatusCode::NO_CONTENT, Disposition::Resolve)]
    #[case(StatusCode::MULTIPLE_CHOICES, Disposition::Resolve)]
    #[case(StatusCode::NOT_MODIFIED, Disposition::Reject)]
    #[case(StatusCode::TOO_MANY_REQUESTS, Disposition::RateLimited)]
    #[case(StatusCode::BAD_GATEWAY, Disposition::BadGateway)]
    #[case(StatusCode::FORBIDDEN, Disposition::Reject)]
    #[case(StatusCode::INTERNAL_SERVER_ERROR, Disposition::Reject)]
    fn test_disposition(#[case] status: StatusCode, #[case] expected: Disposition) {
        assert_eq!(status.disposition(), expected);
    }

    #[test]
    fn test_bad_gateway_budget() {
        let mut budget = BadGatewayBudget::new(4);
        for _ in 0..4 {
            assert!(budget.try_retry());
        }
        // The fifth 502 is terminal
        assert!(!budget.try_retry());
        assert_eq!(budget.attempts(), 5);
    }

    #[test]
    fn test_backoff_bounds() {
        for _ in 0..100 {
            let backoff = bad_gateway_backoff();
            assert!(backoff >= Duration::from_millis(100));
            assert!(backoff < Duration::from_millis(2_000));
        }
    }

    #[test]
    fn test_find_source() {
        let io = std::io::Error::new(std::io::ErrorKind::TimedOut, "slow");
        let boxed: Box<dyn std::error::Error + Send + Sync> = Box::new(io);
        let found = find_source::<std::io::Error>(boxed.as_ref());
        assert_eq!(found.map(std::io::Error::kind), Some(std::io::ErrorKind::TimedOut));
        assert!(find_source::<std::fmt::Error>(boxed.as_ref()).is_none());
    }
}
