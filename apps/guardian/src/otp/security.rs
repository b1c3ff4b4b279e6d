//! Verification throttling on top of the window rate limiter.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::rate_limiter::{RateLimiter, RateMode};
use crate::error::{AttemptError, GuardianError, GuardianResult};

/// Reported reset time for a pinned security window.
pub const NO_EXPIRY_VALUE: i64 = -1;

/// Remaining attempts for both counters, returned with every code check.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OtpCodeVerifyData {
    pub remaining_trials: i64,
    pub reset_after: i64,
    pub security_mode_remaining_trials: i64,
    pub security_mode_reset_after: i64,
}

/// Answers whether a code may be checked and manages security mode.
///
/// The normal counter is keyed by `account:ip`, the security counter by
/// the account alone.
pub struct OtpSecurityEngine {
    limiter: Arc<dyn RateLimiter>,
}

impl OtpSecurityEngine {
    pub fn new(limiter: Arc<dyn RateLimiter>) -> Self {
        Self { limiter }
    }

    /// Count an attempt on both counters.
    ///
    /// Fails with `TooManyFailedAttempts` only when the normal counter is
    /// exhausted; the error still carries the verify data.
    pub async fn is_verification_allowed_and_increase_trials(
        &self,
        account: &str,
        ip: &str,
    ) -> Result<OtpCodeVerifyData, AttemptError> {
        let normal = self
            .limiter
            .check_allowed_and_increase_trials(&verification_key(account, ip), RateMode::Normal)
            .await?;
        let security = self
            .limiter
            .check_allowed_and_increase_trials(account, RateMode::Security)
            .await?;

        let data = OtpCodeVerifyData {
            remaining_trials: i64::from(normal.remaining),
            reset_after: seconds_or_no_expiry(normal.reset_after),
            security_mode_remaining_trials: i64::from(security.remaining),
            security_mode_reset_after: seconds_or_no_expiry(security.reset_after),
        };

        if !security.allowed {
            tracing::debug!(account, "Account is in security mode");
        }

        if !normal.allowed {
            tracing::debug!(account, ip, "Account is now frozen");
            return Err(AttemptError::new(
                GuardianError::TooManyFailedAttempts,
                Some(data),
            ));
        }

        Ok(data)
    }

    /// Clear the normal counter after a successful verification.
    pub async fn reset(&self, account: &str, ip: &str) {
        let key = verification_key(account, ip);
        if let Err(e) = self.limiter.reset(&key).await {
            tracing::error!(key, error = %e, "Failed to reset limiter");
        }
    }

    pub async fn set_security_mode_no_expire(&self, account: &str) -> GuardianResult<()> {
        self.limiter.set_security_mode_no_expire(account).await?;
        tracing::info!(account, "Security mode pinned");
        Ok(())
    }

    pub async fn unset_security_mode_no_expire(&self, account: &str) -> GuardianResult<()> {
        self.limiter.unset_security_mode_no_expire(account).await?;
        tracing::info!(account, "Security mode released");
        Ok(())
    }

    pub async fn decrement_security_mode_failed_trials(&self, account: &str) -> GuardianResult<()> {
        self.limiter.decrement_security_failed_trials(account).await
    }

    pub async fn extend_security_mode(&self, account: &str) -> GuardianResult<()> {
        self.limiter.extend_security_mode(account).await
    }

    /// Normal-counter limit.
    pub fn max_failures(&self) -> u32 {
        self.limiter.rate(RateMode::Normal)
    }

    /// Normal-counter window, in seconds.
    pub fn backoff_time(&self) -> u64 {
        self.limiter.period(RateMode::Normal).as_secs()
    }

    pub fn security_mode_max_failures(&self) -> u32 {
        self.limiter.rate(RateMode::Security)
    }

    /// Security-counter window, in seconds.
    pub fn security_mode_backoff_time(&self) -> u64 {
        self.limiter.period(RateMode::Security).as_secs()
    }
}

fn verification_key(account: &str, ip: &str) -> String {
    format!("{account}:{ip}")
}

fn seconds_or_no_expiry(reset_after: Option<Duration>) -> i64 {
    match reset_after {
        Some(d) => i64::try_from(d.as_millis().div_ceil(1000)).unwrap_or(i64::MAX),
        None => NO_EXPIRY_VALUE,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::otp::rate_limiter::{LimitConfig, RedbRateLimiter};
    use crate::storage::Storage;

    fn engine(max_failures: u32, security_max_failures: u32) -> OtpSecurityEngine {
        let limiter = RedbRateLimiter::new(
            Arc::new(Storage::open_memory().unwrap()),
            LimitConfig::new(max_failures, Duration::from_secs(300)).unwrap(),
            LimitConfig::new(security_max_failures, Duration::from_secs(86_400)).unwrap(),
        );
        OtpSecurityEngine::new(Arc::new(limiter))
    }

    #[tokio::test]
    async fn test_counts_both_counters() {
        let engine = engine(3, 10);
        let data = engine
            .is_verification_allowed_and_increase_trials("alice", "10.0.0.1")
            .await
            .unwrap();

        assert_eq!(data.remaining_trials, 2);
        assert_eq!(data.security_mode_remaining_trials, 9);
        assert!(data.reset_after > 0 && data.reset_after <= 300);
        assert!(data.security_mode_reset_after > 300);

        // another IP has its own normal counter but shares the security one
        let data = engine
            .is_verification_allowed_and_increase_trials("alice", "10.0.0.2")
            .await
            .unwrap();
        assert_eq!(data.remaining_trials, 2);
        assert_eq!(data.security_mode_remaining_trials, 8);
    }

    #[tokio::test]
    async fn test_exhausted_normal_counter_returns_data() {
        let engine = engine(2, 10);
        for _ in 0..2 {
            engine
                .is_verification_allowed_and_increase_trials("bob", "ip")
                .await
                .unwrap();
        }

        let err = engine
            .is_verification_allowed_and_increase_trials("bob", "ip")
            .await
            .unwrap_err();
        assert_eq!(err.error, GuardianError::TooManyFailedAttempts);
        let data = err.verify_data.unwrap();
        assert_eq!(data.remaining_trials, 0);
        assert_eq!(data.security_mode_remaining_trials, 7);

        engine.reset("bob", "ip").await;
        let data = engine
            .is_verification_allowed_and_increase_trials("bob", "ip")
            .await
            .unwrap();
        assert_eq!(data.remaining_trials, 1);
    }

    #[tokio::test]
    async fn test_exhausted_security_counter_is_not_an_error() {
        let engine = engine(10, 1);
        engine
            .is_verification_allowed_and_increase_trials("carol", "a")
            .await
            .unwrap();

        let data = engine
            .is_verification_allowed_and_increase_trials("carol", "b")
            .await
            .unwrap();
        assert_eq!(data.security_mode_remaining_trials, 0);
    }

    #[tokio::test]
    async fn test_pinned_security_mode_reports_no_expiry() {
        let engine = engine(3, 10);
        engine.set_security_mode_no_expire("dave").await.unwrap();

        let data = engine
            .is_verification_allowed_and_increase_trials("dave", "ip")
            .await
            .unwrap();
        assert_eq!(data.security_mode_remaining_trials, 0);
        assert_eq!(data.security_mode_reset_after, NO_EXPIRY_VALUE);

        engine.unset_security_mode_no_expire("dave").await.unwrap();
        let data = engine
            .is_verification_allowed_and_increase_trials("dave", "ip")
            .await
            .unwrap();
        assert_eq!(data.security_mode_remaining_trials, 9);
    }

    #[tokio::test]
    async fn test_config_accessors() {
        let engine = engine(3, 100);
        assert_eq!(engine.max_failures(), 3);
        assert_eq!(engine.backoff_time(), 300);
        assert_eq!(engine.security_mode_max_failures(), 100);
        assert_eq!(engine.security_mode_backoff_time(), 86_400);
    }

    #[test]
    fn test_verify_data_json() {
        let json = serde_json::to_value(OtpCodeVerifyData {
            remaining_trials: 1,
            reset_after: 2,
            security_mode_remaining_trials: 3,
            security_mode_reset_after: NO_EXPIRY_VALUE,
        })
        .unwrap();
        assert_eq!(json["remainingTrials"], 1);
        assert_eq!(json["securityModeResetAfter"], -1);
    }
}
