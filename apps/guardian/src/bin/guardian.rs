//! Guardian Service
//!
//! Co-signs user transactions after TOTP verification.
//!
//! ## Responsibilities
//!
//! - Issue guardian keys and OTP secrets to registered users
//! - Verify codes with per-IP and per-account throttling
//! - Add guardian signatures to transactions and messages
//!
//! ## Security
//!
//! - Stored secrets are sealed with the managed HPKE key
//! - Rate limits all endpoints per peer IP

use std::sync::Arc;

use actix_web::{App, HttpServer, middleware, web};
use anyhow::Context;
use guardian_service::{
    chain::HttpChainClient,
    config::Settings,
    crypto::{GuardianKeyGenerator, KeyEncryptor},
    locking::KeyedLock,
    middleware::{RateLimitConfig, general_limiter},
    otp::{OtpSecurityEngine, RedbRateLimiter, TotpProvider},
    registry::{GuardianRegistry, RegistryDeps},
    routes,
    sharding::open_sharded_store,
    storage::Storage,
    telemetry,
};
use tracing_actix_web::TracingLogger;

/// Wire the registry from validated settings.
fn build_registry(settings: &Settings, storage: &Arc<Storage>) -> anyhow::Result<GuardianRegistry> {
    let store = open_sharded_store(storage, settings.num_buckets())
        .context("Failed to open sharded user store")?;

    let encryptor = KeyEncryptor::from_secret_key_base64(settings.managed_key().unwrap_or_default())
        .context("Failed to load managed key")?;
    let keys = GuardianKeyGenerator::new(settings.mnemonic().unwrap_or_default())
        .context("Failed to load mnemonic")?;

    let otp_provider = TotpProvider::new(
        settings.otp_issuer(),
        settings.otp_digits(),
        settings.otp_period_secs(),
    )
    .context("Invalid OTP parameters")?;

    let limiter = RedbRateLimiter::new(
        Arc::clone(storage),
        settings.normal_limit().context("Invalid normal limiter")?,
        settings
            .security_mode_limit()
            .context("Invalid security mode limiter")?,
    );

    let chain = HttpChainClient::new(
        settings.proxy_url().unwrap_or_default(),
        settings.request_timeout(),
    )
    .context("Failed to create chain client")?;

    let deps = RegistryDeps {
        store,
        encryptor,
        keys,
        otp_provider: Arc::new(otp_provider),
        security: OtpSecurityEngine::new(Arc::new(limiter)),
        chain: Arc::new(chain),
        locks: KeyedLock::new(settings.lock_backend()),
    };

    GuardianRegistry::new(deps, settings.registry_config()).context("Invalid registry config")
}

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    // Initialize tracing first
    telemetry::init_tracing();

    // Load and validate settings
    let settings = Settings::from_env();
    if let Err(message) = settings.validate() {
        tracing::error!("{message}");
        std::process::exit(1);
    }

    // Initialize storage
    let storage = match Storage::open(settings.db_path()) {
        Ok(s) => Arc::new(s),
        Err(e) => {
            tracing::error!(error = %e, "Failed to open storage database");
            std::process::exit(1);
        }
    };

    let registry = match build_registry(&settings, &storage) {
        Ok(r) => web::Data::new(r),
        Err(e) => {
            tracing::error!(error = %format!("{e:#}"), "Failed to create guardian registry");
            std::process::exit(1);
        }
    };

    let rate_config = RateLimitConfig::from_env();
    let limiter = match general_limiter(&rate_config) {
        Ok(l) => l,
        Err(e) => {
            tracing::error!(error = %e, "Failed to build HTTP rate limiter");
            std::process::exit(1);
        }
    };
    tracing::info!(
        millis_per_request = rate_config.millis_per_request,
        burst = rate_config.burst,
        "Rate limiting enabled"
    );

    let addr = settings.socket_addr();
    tracing::info!(
        addr = %addr,
        num_buckets = settings.num_buckets(),
        locking = %settings.locking(),
        registered_users = registry.registered_users().unwrap_or_default(),
        "Starting Guardian"
    );

    let body_limit = settings.body_limit_bytes();
    let settings_data = web::Data::new(settings);
    let server_registry = registry.clone();

    HttpServer::new(move || {
        App::new()
            // Rate limiting (applied first)
            .wrap(limiter.clone())
            // Request tracing
            .wrap(TracingLogger::default())
            // Default headers
            .wrap(middleware::DefaultHeaders::new().add(("X-Service", "guardian")))
            // Shared state
            .app_data(settings_data.clone())
            .app_data(server_registry.clone())
            .app_data(routes::guardian::json_config(body_limit))
            // Routes
            .configure(routes::health::configure)
            .configure(routes::guardian::configure)
    })
    .bind(addr)?
    .run()
    .await?;

    if let Err(e) = registry.close() {
        tracing::error!(error = %e, "Failed to close user store");
    }

    // Shutdown tracing
    telemetry::shutdown_tracing();

    Ok(())
}
