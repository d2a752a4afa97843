use std::sync::Mutex;
use std::time::Duration;

use super::{RateLimitConfig, window::Window};

/// Number of samples both rolling estimates are spread over
const SAMPLE_WINDOW: usize = 10;

/// Server `Date` headers are sampled at most this often
const OFFSET_CHECK_INTERVAL_MS: i64 = 5_000;

/// `Date` has one-second resolution; assume the midpoint of that second
const DATE_RESOLUTION_MIDPOINT_MS: i64 = 500;

/// Round trip latency and clock offset estimates against the remote server.
///
/// Both estimates are the mean of the last [`SAMPLE_WINDOW`] samples,
/// maintained incrementally: a new sample contributes a tenth of its value
/// and the evicted oldest sample gives its tenth back. One update can
/// therefore never move an estimate by more than one sample's share.
#[derive(Debug)]
pub(crate) struct LatencyRef {
    state: Mutex<LatencyState>,
    compensate: bool,
    threshold_ms: i64,
}

#[derive(Debug)]
struct LatencyState {
    latency: i64,
    raw: Window<i64>,
    time_offset: i64,
    time_offsets: Window<i64>,
    last_time_offset_check: Option<i64>,
}

impl LatencyRef {
    pub(crate) fn new(config: &RateLimitConfig) -> Self {
        let seed = duration_millis(config.ratelimiter_offset);
        Self {
            state: Mutex::new(LatencyState {
                latency: seed,
                raw: Window::filled(SAMPLE_WINDOW, seed),
                time_offset: 0,
                time_offsets: Window::filled(SAMPLE_WINDOW, 0),
                last_time_offset_check: None,
            }),
            compensate: !config.disable_latency_compensation,
            threshold_ms: duration_millis(config.latency_threshold),
        }
    }

    /// Current latency estimate in milliseconds
    pub(crate) fn latency(&self) -> i64 {
        self.lock().latency
    }

    /// Current clock offset estimate in milliseconds (positive when the
    /// local clock is behind the server)
    #[cfg(test)]
    pub(crate) fn time_offset(&self) -> i64 {
        self.lock().time_offset
    }

    /// Feed one round trip measurement into the latency estimate and return
    /// the updated estimate
    pub(crate) fn record_round_trip(&self, round_trip: Duration) -> i64 {
        let mut state = self.lock();
        if self.compensate {
            let sample = duration_millis(round_trip);
            let oldest = state.raw.push(sample).unwrap_or(0);
            state.latency = state.latency - oldest / 10 + sample / 10;
        }
        state.latency
    }

    /// Feed the server's `Date` into the clock offset estimate.
    ///
    /// Returns a warning message when both the accumulated and the fresh
    /// offset exceed the measured latency by the configured threshold.
    /// Calls within [`OFFSET_CHECK_INTERVAL_MS`] of the previous sample are
    /// ignored.
    pub(crate) fn record_server_date(&self, server_now: i64, local_now: i64) -> Option<String> {
        let mut state = self.lock();
        if state
            .last_time_offset_check
            .is_some_and(|last| last >= local_now - OFFSET_CHECK_INTERVAL_MS)
        {
            return None;
        }
        state.last_time_offset_check = Some(local_now);

        let sample = server_now + DATE_RESOLUTION_MIDPOINT_MS - local_now;
        let warning = (state.time_offset - state.latency >= self.threshold_ms
            && sample - state.latency >= self.threshold_ms)
            .then(|| {
                format!(
                    "Your clock is {}ms behind the server's clock. Please check your connection and system time.",
                    state.time_offset
                )
            });

        let oldest = state.time_offsets.push(sample).unwrap_or(0);
        state.time_offset = state.time_offset - oldest / 10 + sample / 10;
        warning
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, LatencyState> {
        // The state holds plain integers, a panic mid-update cannot leave it
        // inconsistent enough to matter
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

fn duration_millis(duration: Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracker(config: RateLimitConfig) -> LatencyRef {
        LatencyRef::new(&config)
    }

    #[test]
    fn test_seeded_from_offset() {
        let latency = tracker(RateLimitConfig {
            ratelimiter_offset: Duration::from_millis(50),
            ..RateLimitConfig::default()
        });
        assert_eq!(latency.latency(), 50);

        // A sample equal to the seed keeps the estimate where it is
        assert_eq!(latency.record_round_trip(Duration::from_millis(50)), 50);
    }

    #[test]
    fn test_moves_toward_samples_one_share_at_a_time() {
        let latency = tracker(RateLimitConfig::default());
        let mut previous = latency.latency();

        for _ in 0..25 {
            let current = latency.record_round_trip(Duration::from_millis(100));
            assert!(current >= previous, "estimate moved away from samples");
            assert!(current - previous <= 10, "jumped by more than one share");
            previous = current;
        }
        assert_eq!(previous, 100);

        // And back down again
        for _ in 0..25 {
            let current = latency.record_round_trip(Duration::from_millis(20));
            assert!(current <= previous);
            assert!(previous - current <= 10);
            previous = current;
        }
        assert_eq!(previous, 20);
    }

    #[test]
    fn test_disabled_compensation_keeps_seed() {
        let latency = tracker(RateLimitConfig {
            ratelimiter_offset: Duration::from_millis(30),
            disable_latency_compensation: true,
            ..RateLimitConfig::default()
        });
        assert_eq!(latency.record_round_trip(Duration::from_secs(2)), 30);
        assert_eq!(latency.latency(), 30);
    }

    #[test]
    fn test_clock_offset_is_throttled() {
        let latency = tracker(RateLimitConfig::default());
        let local = 1_000_000;

        assert_eq!(latency.record_server_date(local + 9_500, local), None);
        assert_eq!(latency.time_offset(), 1_000);

        // Inside the throttle window nothing changes
        assert_eq!(latency.record_server_date(local + 99_500, local + 1_000), None);
        assert_eq!(latency.time_offset(), 1_000);

        // Past it, the next sample is taken
        latency.record_server_date(local + 5_001 + 9_500, local + 5_001);
        assert_eq!(latency.time_offset(), 2_000);
    }

    #[test]
    fn test_clock_drift_warning() {
        let latency = tracker(RateLimitConfig {
            latency_threshold: Duration::from_millis(100),
            ..RateLimitConfig::default()
        });
        let mut local = 0;
        let mut warnings = Vec::new();

        // Server clock runs 5s ahead; the accumulated offset needs a couple of
        // samples before it crosses the threshold
        for _ in 0..3 {
            local += OFFSET_CHECK_INTERVAL_MS + 1;
            warnings.push(latency.record_server_date(local + 4_500, local));
        }

        assert_eq!(warnings[0], None);
        let warning = warnings[1].as_deref().unwrap();
        assert!(warning.contains("500ms behind"), "{warning}");
        assert!(warnings[2].is_some());
    }
}
