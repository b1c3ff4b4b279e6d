//! One-time passwords and verification throttling.

pub mod rate_limiter;
pub mod security;
pub mod totp;

pub use rate_limiter::{LimitConfig, RateLimiter, RateLimiterResult, RateMode, RedbRateLimiter};
pub use security::{NO_EXPIRY_VALUE, OtpCodeVerifyData, OtpSecurityEngine};
pub use totp::{OtpEnrollment, OtpProvider, Totp, TotpProvider};
