//! Per-IP request throttling in front of every route.
//!
//! Complements the per-account OTP limiter: this one caps raw request
//! volume before any handler runs. Uses actix-governor with the built-in
//! `PeerIpKeyExtractor`.

use actix_governor::{Governor, GovernorConfigBuilder, PeerIpKeyExtractor};

use crate::error::{GuardianError, GuardianResult};

/// Per-IP request budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitConfig {
    /// Sustained rate, one request per this many milliseconds.
    pub millis_per_request: u64,
    /// Requests allowed in a burst.
    pub burst: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            millis_per_request: 100,
            burst: 50,
        }
    }
}

impl RateLimitConfig {
    /// Load overrides from `RATE_LIMIT_MILLIS_PER_REQUEST` and `RATE_LIMIT_BURST`.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            millis_per_request: std::env::var("RATE_LIMIT_MILLIS_PER_REQUEST")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.millis_per_request),
            burst: std::env::var("RATE_LIMIT_BURST")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.burst),
        }
    }
}

/// Type alias for the Governor middleware with default settings.
pub type RateLimiter = Governor<PeerIpKeyExtractor, governor::middleware::NoOpMiddleware>;

/// Build the limiter wrapping the whole app.
pub fn general_limiter(config: &RateLimitConfig) -> GuardianResult<RateLimiter> {
    let governor_config = GovernorConfigBuilder::default()
        .milliseconds_per_request(config.millis_per_request.max(1))
        .burst_size(config.burst.max(1))
        .finish()
        .ok_or_else(|| GuardianError::InvalidValue("invalid HTTP rate limit".to_string()))?;

    Ok(Governor::new(&governor_config))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = RateLimitConfig::default();
        assert_eq!(config.millis_per_request, 100);
        assert_eq!(config.burst, 50);
    }

    #[test]
    fn test_limiter_creation() {
        assert!(general_limiter(&RateLimitConfig::default()).is_ok());

        // zero values are clamped rather than rejected
        let config = RateLimitConfig {
            millis_per_request: 0,
            burst: 0,
        };
        assert!(general_limiter(&config).is_ok());
    }
}
