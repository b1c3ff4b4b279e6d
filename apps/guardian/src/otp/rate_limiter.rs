//! Fixed-window attempt counters.
//!
//! Each `(mode, key)` pair owns one window `{count, expires_at}`. The
//! first attempt opens a window of `period`; later attempts inside it
//! bump the count. A security window can be pinned at its limit with no
//! expiry until explicitly unset.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{GuardianError, GuardianResult};
use crate::storage::Storage;

/// Which counter an operation targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RateMode {
    /// Per `account:ip` brute-force throttle.
    Normal,
    /// Per-account lockdown counter.
    Security,
}

impl fmt::Display for RateMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Normal => write!(f, "normal"),
            Self::Security => write!(f, "security"),
        }
    }
}

/// Outcome of one counted attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimiterResult {
    pub allowed: bool,
    pub remaining: u32,
    /// `None` while the window is pinned with no expiry.
    pub reset_after: Option<Duration>,
}

/// Limit for one mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LimitConfig {
    pub max_failures: u32,
    pub period: Duration,
}

impl LimitConfig {
    pub fn new(max_failures: u32, period: Duration) -> GuardianResult<Self> {
        if max_failures == 0 {
            return Err(GuardianError::InvalidValue(
                "max failures must be positive".to_string(),
            ));
        }
        if period.as_secs() == 0 {
            return Err(GuardianError::InvalidValue(
                "limit period must be at least one second".to_string(),
            ));
        }
        Ok(Self {
            max_failures,
            period,
        })
    }
}

/// Window-counter store backing the security engine.
#[async_trait]
pub trait RateLimiter: Send + Sync {
    /// Count one attempt and report whether it is within the limit.
    async fn check_allowed_and_increase_trials(
        &self,
        key: &str,
        mode: RateMode,
    ) -> GuardianResult<RateLimiterResult>;

    /// Drop the normal window for `key`.
    async fn reset(&self, key: &str) -> GuardianResult<()>;

    fn period(&self, mode: RateMode) -> Duration;

    fn rate(&self, mode: RateMode) -> u32;

    /// Pin the security window at its limit with no expiry.
    async fn set_security_mode_no_expire(&self, key: &str) -> GuardianResult<()>;

    /// Remove the security window, pinned or not.
    async fn unset_security_mode_no_expire(&self, key: &str) -> GuardianResult<()>;

    /// Give back one security attempt. No-op on pinned windows.
    async fn decrement_security_failed_trials(&self, key: &str) -> GuardianResult<()>;

    /// Restart a live security window's expiry. No-op on pinned windows.
    async fn extend_security_mode(&self, key: &str) -> GuardianResult<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
struct Window {
    count: u32,
    expires_at_ms: i64,
    no_expire: bool,
}

impl Window {
    fn is_live(&self, now_ms: i64) -> bool {
        self.no_expire || self.expires_at_ms > now_ms
    }
}

/// Rate limiter persisting windows in redb.
pub struct RedbRateLimiter {
    storage: Arc<Storage>,
    normal: LimitConfig,
    security: LimitConfig,
}

impl RedbRateLimiter {
    pub fn new(storage: Arc<Storage>, normal: LimitConfig, security: LimitConfig) -> Self {
        Self {
            storage,
            normal,
            security,
        }
    }

    fn limit(&self, mode: RateMode) -> LimitConfig {
        match mode {
            RateMode::Normal => self.normal,
            RateMode::Security => self.security,
        }
    }

    fn window_key(mode: RateMode, key: &str) -> String {
        format!("{mode}:{key}")
    }

    fn period_ms(&self, mode: RateMode) -> i64 {
        i64::try_from(self.limit(mode).period.as_millis()).unwrap_or(i64::MAX)
    }

    /// Apply `f` to a live, non-pinned security window.
    fn adjust_security_window(&self, key: &str, f: impl FnOnce(&mut Window, i64)) -> GuardianResult<()> {
        let now = now_ms();
        self.storage.update_rate_limit::<Window, (), _>(
            &Self::window_key(RateMode::Security, key),
            |current| match current {
                Some(mut window) if !window.no_expire && window.is_live(now) => {
                    f(&mut window, now);
                    (Some(window), ())
                }
                other => (other, ()),
            },
        )
    }
}

#[async_trait]
impl RateLimiter for RedbRateLimiter {
    async fn check_allowed_and_increase_trials(
        &self,
        key: &str,
        mode: RateMode,
    ) -> GuardianResult<RateLimiterResult> {
        let rate = self.rate(mode);
        let period_ms = self.period_ms(mode);
        let now = now_ms();

        let window = self.storage.update_rate_limit::<Window, Window, _>(
            &Self::window_key(mode, key),
            |current| {
                let next = match current {
                    Some(window) if window.no_expire => return (Some(window), window),
                    Some(mut window) if window.is_live(now) => {
                        window.count = window.count.saturating_add(1);
                        window
                    }
                    _ => Window {
                        count: 1,
                        expires_at_ms: now.saturating_add(period_ms),
                        no_expire: false,
                    },
                };
                (Some(next), next)
            },
        )?;

        if window.no_expire {
            return Ok(RateLimiterResult {
                allowed: false,
                remaining: 0,
                reset_after: None,
            });
        }

        let reset_ms = u64::try_from(window.expires_at_ms.saturating_sub(now)).unwrap_or(0);
        Ok(RateLimiterResult {
            allowed: window.count <= rate,
            remaining: rate.saturating_sub(window.count),
            reset_after: Some(Duration::from_millis(reset_ms)),
        })
    }

    async fn reset(&self, key: &str) -> GuardianResult<()> {
        self.storage
            .delete_rate_limit(&Self::window_key(RateMode::Normal, key))?;
        Ok(())
    }

    fn period(&self, mode: RateMode) -> Duration {
        self.limit(mode).period
    }

    fn rate(&self, mode: RateMode) -> u32 {
        self.limit(mode).max_failures
    }

    async fn set_security_mode_no_expire(&self, key: &str) -> GuardianResult<()> {
        let pinned = Window {
            count: self.rate(RateMode::Security),
            expires_at_ms: 0,
            no_expire: true,
        };
        self.storage.update_rate_limit::<Window, (), _>(
            &Self::window_key(RateMode::Security, key),
            |_| (Some(pinned), ()),
        )
    }

    async fn unset_security_mode_no_expire(&self, key: &str) -> GuardianResult<()> {
        self.storage
            .delete_rate_limit(&Self::window_key(RateMode::Security, key))?;
        Ok(())
    }

    async fn decrement_security_failed_trials(&self, key: &str) -> GuardianResult<()> {
        self.adjust_security_window(key, |window, _| {
            window.count = window.count.saturating_sub(1);
        })
    }

    async fn extend_security_mode(&self, key: &str) -> GuardianResult<()> {
        let period_ms = self.period_ms(RateMode::Security);
        self.adjust_security_window(key, |window, now| {
            window.expires_at_ms = now.saturating_add(period_ms);
        })
    }
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
