use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default clock drift (beyond measured latency) tolerated before warning
const DEFAULT_LATENCY_THRESHOLD: Duration = Duration::from_secs(30);

/// Default number of times a 502 is retried before it is surfaced
pub const DEFAULT_MAX_BAD_GATEWAY_RETRIES: usize = 4;

/// Rate limiting behavior shared by every route bucket of a dispatcher
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RateLimitConfig {
    /// Accumulated clock offset, beyond measured latency, at which the
    /// dispatcher warns that the local clock cannot be trusted
    #[serde(default = "default_latency_threshold", with = "humantime_serde")]
    pub latency_threshold: Duration,

    /// Initial latency estimate. It biases computed reset times and the
    /// message age used for route keys until real samples replace it
    #[serde(default, with = "humantime_serde")]
    pub ratelimiter_offset: Duration,

    /// Stop feeding round trip samples into the latency estimate
    #[serde(default)]
    pub disable_latency_compensation: bool,

    /// Snap reaction route resets that land exactly one second after the
    /// server's `Date` to a 250ms window. The server has been observed to
    /// report such resets for reactions; revalidate against the live API
    #[serde(default = "default_reaction_reset_quirk")]
    pub reaction_reset_quirk: bool,

    /// How many times a 502 response is retried before it is surfaced
    #[serde(default = "default_max_bad_gateway_retries")]
    pub max_bad_gateway_retries: usize,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            latency_threshold: default_latency_threshold(),
            ratelimiter_offset: Duration::ZERO,
            disable_latency_compensation: false,
            reaction_reset_quirk: default_reaction_reset_quirk(),
            max_bad_gateway_retries: default_max_bad_gateway_retries(),
        }
    }
}

const fn default_latency_threshold() -> Duration {
    DEFAULT_LATENCY_THRESHOLD
}

const fn default_reaction_reset_quirk() -> bool {
    true
}

const fn default_max_bad_gateway_retries() -> usize {
    DEFAULT_MAX_BAD_GATEWAY_RETRIES
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_rate_limit_config() {
        let config = RateLimitConfig::default();
        assert_eq!(config.latency_threshold, Duration::from_secs(30));
        assert_eq!(config.ratelimiter_offset, Duration::ZERO);
        assert!(!config.disable_latency_compensation);
        assert!(config.reaction_reset_quirk);
        assert_eq!(config.max_bad_gateway_retries, 4);
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config: RateLimitConfig = toml::from_str(
            r#"
            latency_threshold = "5s"
            ratelimiter_offset = "80ms"
            "#,
        )
        .unwrap();

        assert_eq!(config.latency_threshold, Duration::from_secs(5));
        assert_eq!(config.ratelimiter_offset, Duration::from_millis(80));
        assert!(config.reaction_reset_quirk);
        assert_eq!(config.max_bad_gateway_retries, 4);
    }

    #[test]
    fn test_unknown_field_is_rejected() {
        let result = toml::from_str::<RateLimitConfig>("concurrency = 10");
        assert!(result.is_err());
    }
}
