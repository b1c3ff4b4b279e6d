//! Middleware for the guardian service.

pub mod rate_limit;

pub use rate_limit::{RateLimitConfig, RateLimiter, general_limiter};
