//! HTTP routes for the guardian service.
//!
//! - `health`: Health check and build info
//! - `guardian`: Registration, verification, and co-signing under `/guardian`

pub mod guardian;
pub mod health;

pub use health::{build_info, health};
