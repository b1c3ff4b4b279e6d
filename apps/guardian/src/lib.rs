// Crate-level lint configuration
// Allow noisy pedantic/cargo lints that aren't worth fixing individually
#![allow(clippy::multiple_crate_versions)] // Transitive deps, can't easily fix
#![allow(clippy::missing_errors_doc)] // Would require extensive doc changes
#![allow(clippy::missing_panics_doc)] // Would require extensive doc changes
#![allow(clippy::must_use_candidate)] // Too many false positives for internal APIs
#![allow(clippy::module_name_repetitions)] // Acceptable for clarity (e.g., GuardianError in error mod)
#![allow(clippy::doc_markdown)] // Too strict about backticks in docs
#![allow(clippy::missing_const_for_fn)] // Often debatable, runtime doesn't benefit

//! Guardian Service
//!
//! A two-factor co-signing service. Each user is assigned guardian keys
//! derived from a service mnemonic; the service adds a guardian signature
//! to the user's transactions only after a valid TOTP code.
//!
//! ## Architecture
//!
//! - **Storage**: one redb database, split into `bucket_<id>` tables. Users are
//!   routed to a bucket by a hash of their address, and each bucket keeps its
//!   own persisted index counter.
//! - **Registry**: issues guardians, verifies codes, and signs. Every
//!   read-then-write of a user record runs under that user's lock.
//! - **Throttling**: a per `(account, ip)` normal counter plus a per-account
//!   security counter that can demand a second code.
//!
//! ## Security Model
//!
//! - Guardian private keys and OTP secrets are sealed with HPKE before storage
//! - Key derivation is deterministic, so the mnemonic alone restores every key
//! - A guardian signs only after it has been confirmed with a valid code

pub mod chain;
pub mod config;
pub mod crypto;
pub mod error;
pub mod locking;
pub mod middleware;
pub mod otp;
pub mod registry;
pub mod routes;
pub mod sharding;
pub mod storage;

/// Filter used when `RUST_LOG` is unset.
pub const DEFAULT_LOG_FILTER: &str = "guardian_service=info,actix_web=info";

#[cfg(feature = "otel")]
pub mod telemetry;

#[cfg(not(feature = "otel"))]
pub mod telemetry {
    //! Stub telemetry module when OpenTelemetry is disabled.

    use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

    use super::DEFAULT_LOG_FILTER;

    /// Initialize tracing with console output only.
    pub fn init_tracing() {
        let env_filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| DEFAULT_LOG_FILTER.into());
        let fmt_layer = tracing_subscriber::fmt::layer();

        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt_layer)
            .init();
    }

    /// No-op shutdown when OpenTelemetry is disabled.
    pub fn shutdown_tracing() {}
}

// Re-export commonly used types
pub use config::Settings;
pub use error::{AttemptError, GuardianError, GuardianResult};
pub use registry::GuardianRegistry;
