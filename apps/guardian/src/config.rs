//! Service configuration derived from environment variables.
//!
//! Configuration is loaded once at startup and validated before the service starts.
//!
//! ## Environment Variables
//!
//! ### Server
//! - `GUARDIAN_PORT`: HTTP port (default: 8080)
//! - `GUARDIAN_HOST`: Bind address (default: :: for dual-stack IPv4/IPv6)
//! - `GUARDIAN_DB_PATH`: Path to ReDB database file
//! - `GUARDIAN_REQUEST_TIMEOUT_MS`: Chain proxy timeout
//! - `GUARDIAN_BODY_LIMIT_MB`: JSON body limit
//! - `RUST_LOG`: Log level filter
//!
//! ### Keys and chain
//! - `GUARDIAN_MNEMONIC`: Seed for guardian key derivation (required)
//! - `GUARDIAN_MANAGED_KEY`: Base64 X25519 secret sealing stored secrets (required)
//! - `GUARDIAN_PROXY_URL`: Chain proxy base URL (required)
//!
//! ### Storage and locking
//! - `GUARDIAN_NUM_BUCKETS`: Shard count
//! - `GUARDIAN_LOCKING`: "local" or "distributed"
//! - `GUARDIAN_LOCK_TIMEOUT_MS`, `GUARDIAN_LOCK_EXPIRY_MS`: Distributed lock bounds
//!
//! ### OTP
//! - `GUARDIAN_OTP_ISSUER`, `GUARDIAN_OTP_DIGITS`, `GUARDIAN_OTP_PERIOD_SECS`
//! - `GUARDIAN_MAX_FAILURES`, `GUARDIAN_LIMIT_PERIOD_SECS`: Normal counter
//! - `GUARDIAN_SECURITY_MODE_MAX_FAILURES`, `GUARDIAN_SECURITY_MODE_LIMIT_PERIOD_SECS`: Security counter
//! - `GUARDIAN_OTP_WRITE_DELAY_SECS`: Minimum gap between OTP rewrites
//!
//! ### Signing
//! - `GUARDIAN_MAX_TXS`: Batch cap
//! - `GUARDIAN_SKIP_TX_USER_SIG_VERIFY`: Skip user signature checks (development only)

use std::env;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::crypto::KeyEncryptor;
use crate::locking::{LockBackend, MemoryLeaseStore};
use crate::otp::LimitConfig;
use crate::registry::RegistryConfig;

const DEFAULT_PORT: u16 = 8080;
const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 10_000;
const DEFAULT_BODY_LIMIT_MB: usize = 1;
const DEFAULT_NUM_BUCKETS: u32 = 4;
const DEFAULT_LOCK_TIMEOUT_MS: u64 = 5_000;
const DEFAULT_LOCK_EXPIRY_MS: u64 = 8_000;
const DEFAULT_OTP_ISSUER: &str = "Guardian";
const DEFAULT_OTP_DIGITS: u32 = 6;
const DEFAULT_OTP_PERIOD_SECS: u64 = 30;
const DEFAULT_MAX_FAILURES: u32 = 3;
const DEFAULT_LIMIT_PERIOD_SECS: u64 = 300;
const DEFAULT_SECURITY_MODE_MAX_FAILURES: u32 = 100;
const DEFAULT_SECURITY_MODE_LIMIT_PERIOD_SECS: u64 = 86_400;
const DEFAULT_OTP_WRITE_DELAY_SECS: u64 = 60;
const DEFAULT_MAX_TXS: usize = 100;

/// Helper to get trimmed env var or empty string.
fn env_trim(name: &str) -> String {
    env::var(name).unwrap_or_default().trim().to_string()
}

/// Helper to get lowercase env var.
fn env_lower(name: &str) -> String {
    env_trim(name).to_lowercase()
}

/// Helper to get a non-empty env var.
fn env_opt(name: &str) -> Option<String> {
    let value = env_trim(name);
    (!value.is_empty()).then_some(value)
}

/// Parse an env var, falling back to `default` when unset or malformed.
fn env_parse<T>(name: &str, default: T) -> T
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    parse_or_default(name, &env_trim(name), default)
}

fn parse_or_default<T>(name: &str, raw: &str, default: T) -> T
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    if raw.is_empty() {
        return default;
    }
    match raw.parse::<T>() {
        Ok(value) => value,
        Err(e) => {
            tracing::warn!(variable = name, value = raw, error = %e, "Ignoring malformed setting, using default");
            default
        }
    }
}

/// Check if a string value is truthy.
fn is_truthy(value: &str) -> bool {
    matches!(value.trim(), "1" | "true" | "yes")
}

/// Backend for per-user locks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LockingMode {
    /// In-process readers-writer locks.
    #[default]
    Local,
    /// Lease-based locks shared between instances.
    Distributed,
}

impl FromStr for LockingMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "local" => Ok(Self::Local),
            "distributed" => Ok(Self::Distributed),
            other => Err(format!(
                "Invalid locking mode '{other}'. Must be 'local' or 'distributed'."
            )),
        }
    }
}

impl std::fmt::Display for LockingMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Local => write!(f, "local"),
            Self::Distributed => write!(f, "distributed"),
        }
    }
}

/// Service configuration.
#[derive(Clone)]
pub struct Settings {
    // Server
    port: u16,
    host: IpAddr,
    db_path: PathBuf,
    request_timeout_ms: u64,
    body_limit_bytes: usize,

    // Keys and chain
    mnemonic: Option<String>,
    managed_key: Option<String>,
    proxy_url: Option<String>,

    // Storage and locking
    num_buckets: u32,
    locking: Result<LockingMode, String>,
    lock_timeout_ms: u64,
    lock_expiry_ms: u64,

    // OTP
    otp_issuer: String,
    otp_digits: u32,
    otp_period_secs: u64,
    max_failures: u32,
    limit_period_secs: u64,
    security_mode_max_failures: u32,
    security_mode_limit_period_secs: u64,
    otp_write_delay_secs: u64,

    // Signing
    max_txs: usize,
    skip_tx_user_sig_verify: bool,
}

impl std::fmt::Debug for Settings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Settings")
            .field("socket_addr", &self.socket_addr())
            .field("db_path", &self.db_path)
            .field("proxy_url", &self.proxy_url)
            .field("num_buckets", &self.num_buckets)
            .field("locking", &self.locking)
            .field("otp_issuer", &self.otp_issuer)
            .field("max_failures", &self.max_failures)
            .field("security_mode_max_failures", &self.security_mode_max_failures)
            .field("max_txs", &self.max_txs)
            .finish_non_exhaustive()
    }
}

impl Settings {
    /// Load settings from environment variables.
    ///
    /// Never fails; call [`Settings::validate`] before use.
    pub fn from_env() -> Self {
        // Default to IPv6 unspecified (::) for dual-stack support.
        let host = env_trim("GUARDIAN_HOST")
            .parse::<IpAddr>()
            .unwrap_or(IpAddr::V6(Ipv6Addr::UNSPECIFIED));

        let db_path = env_opt("GUARDIAN_DB_PATH")
            .map_or_else(|| PathBuf::from("./.data/guardian.redb"), PathBuf::from);

        let body_limit_mb = env_parse("GUARDIAN_BODY_LIMIT_MB", DEFAULT_BODY_LIMIT_MB);

        let locking = match env_lower("GUARDIAN_LOCKING").as_str() {
            "" => Ok(LockingMode::default()),
            value => value.parse::<LockingMode>(),
        };

        Self {
            port: env_parse("GUARDIAN_PORT", DEFAULT_PORT),
            host,
            db_path,
            request_timeout_ms: env_parse("GUARDIAN_REQUEST_TIMEOUT_MS", DEFAULT_REQUEST_TIMEOUT_MS),
            body_limit_bytes: body_limit_mb.saturating_mul(1024 * 1024),
            mnemonic: env_opt("GUARDIAN_MNEMONIC"),
            managed_key: env_opt("GUARDIAN_MANAGED_KEY"),
            proxy_url: env_opt("GUARDIAN_PROXY_URL"),
            num_buckets: env_parse("GUARDIAN_NUM_BUCKETS", DEFAULT_NUM_BUCKETS),
            locking,
            lock_timeout_ms: env_parse("GUARDIAN_LOCK_TIMEOUT_MS", DEFAULT_LOCK_TIMEOUT_MS),
            lock_expiry_ms: env_parse("GUARDIAN_LOCK_EXPIRY_MS", DEFAULT_LOCK_EXPIRY_MS),
            otp_issuer: env_opt("GUARDIAN_OTP_ISSUER")
                .unwrap_or_else(|| DEFAULT_OTP_ISSUER.to_string()),
            otp_digits: env_parse("GUARDIAN_OTP_DIGITS", DEFAULT_OTP_DIGITS),
            otp_period_secs: env_parse("GUARDIAN_OTP_PERIOD_SECS", DEFAULT_OTP_PERIOD_SECS),
            max_failures: env_parse("GUARDIAN_MAX_FAILURES", DEFAULT_MAX_FAILURES),
            limit_period_secs: env_parse("GUARDIAN_LIMIT_PERIOD_SECS", DEFAULT_LIMIT_PERIOD_SECS),
            security_mode_max_failures: env_parse(
                "GUARDIAN_SECURITY_MODE_MAX_FAILURES",
                DEFAULT_SECURITY_MODE_MAX_FAILURES,
            ),
            security_mode_limit_period_secs: env_parse(
                "GUARDIAN_SECURITY_MODE_LIMIT_PERIOD_SECS",
                DEFAULT_SECURITY_MODE_LIMIT_PERIOD_SECS,
            ),
            otp_write_delay_secs: env_parse(
                "GUARDIAN_OTP_WRITE_DELAY_SECS",
                DEFAULT_OTP_WRITE_DELAY_SECS,
            ),
            max_txs: env_parse("GUARDIAN_MAX_TXS", DEFAULT_MAX_TXS),
            skip_tx_user_sig_verify: is_truthy(&env_lower("GUARDIAN_SKIP_TX_USER_SIG_VERIFY")),
        }
    }

    /// Create settings for tests. Generates a fresh managed key.
    pub fn for_tests() -> Self {
        Self {
            port: DEFAULT_PORT,
            host: IpAddr::V4(Ipv4Addr::LOCALHOST),
            db_path: PathBuf::from("./.data/test-guardian.redb"),
            request_timeout_ms: 1_000,
            body_limit_bytes: DEFAULT_BODY_LIMIT_MB * 1024 * 1024,
            mnemonic: Some("test test test test test test test test test test test junk".to_string()),
            managed_key: Some(KeyEncryptor::generate().secret_key_base64()),
            proxy_url: Some("http://localhost:8079".to_string()),
            num_buckets: DEFAULT_NUM_BUCKETS,
            locking: Ok(LockingMode::Local),
            lock_timeout_ms: DEFAULT_LOCK_TIMEOUT_MS,
            lock_expiry_ms: DEFAULT_LOCK_EXPIRY_MS,
            otp_issuer: DEFAULT_OTP_ISSUER.to_string(),
            otp_digits: DEFAULT_OTP_DIGITS,
            otp_period_secs: DEFAULT_OTP_PERIOD_SECS,
            max_failures: DEFAULT_MAX_FAILURES,
            limit_period_secs: DEFAULT_LIMIT_PERIOD_SECS,
            security_mode_max_failures: DEFAULT_SECURITY_MODE_MAX_FAILURES,
            security_mode_limit_period_secs: DEFAULT_SECURITY_MODE_LIMIT_PERIOD_SECS,
            otp_write_delay_secs: DEFAULT_OTP_WRITE_DELAY_SECS,
            max_txs: DEFAULT_MAX_TXS,
            skip_tx_user_sig_verify: false,
        }
    }

    /// Validate settings.
    ///
    /// Returns an error message if validation fails.
    pub fn validate(&self) -> Result<(), String> {
        if self.mnemonic.is_none() {
            return Err("GUARDIAN_MNEMONIC is required.".to_string());
        }

        match &self.managed_key {
            None => return Err("GUARDIAN_MANAGED_KEY is required.".to_string()),
            Some(key) => {
                KeyEncryptor::from_secret_key_base64(key)
                    .map_err(|e| format!("GUARDIAN_MANAGED_KEY is malformed: {e}"))?;
            }
        }

        match &self.proxy_url {
            None => return Err("GUARDIAN_PROXY_URL is required.".to_string()),
            Some(url) => {
                url::Url::parse(url).map_err(|e| format!("GUARDIAN_PROXY_URL is invalid: {e}"))?;
            }
        }

        if self.num_buckets == 0 {
            return Err("GUARDIAN_NUM_BUCKETS must be greater than zero.".to_string());
        }

        let locking = self.locking.clone()?;
        if locking == LockingMode::Distributed
            && (self.lock_timeout_ms == 0 || self.lock_expiry_ms == 0)
        {
            return Err(
                "GUARDIAN_LOCK_TIMEOUT_MS and GUARDIAN_LOCK_EXPIRY_MS must be positive."
                    .to_string(),
            );
        }

        if self.request_timeout_ms == 0 {
            return Err("GUARDIAN_REQUEST_TIMEOUT_MS must be positive.".to_string());
        }

        self.normal_limit().map_err(|e| format!("Normal limiter: {e}"))?;
        self.security_mode_limit()
            .map_err(|e| format!("Security mode limiter: {e}"))?;
        self.registry_config()
            .validate()
            .map_err(|e| e.to_string())?;

        if locking == LockingMode::Distributed {
            tracing::warn!("Distributed locking uses an in-process lease store; run a single instance");
        }

        if self.skip_tx_user_sig_verify {
            tracing::warn!("User signature verification is disabled");
        }

        Ok(())
    }

    // Getters

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.port)
    }

    pub fn db_path(&self) -> &PathBuf {
        &self.db_path
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn body_limit_bytes(&self) -> usize {
        self.body_limit_bytes
    }

    pub fn mnemonic(&self) -> Option<&str> {
        self.mnemonic.as_deref()
    }

    pub fn managed_key(&self) -> Option<&str> {
        self.managed_key.as_deref()
    }

    pub fn proxy_url(&self) -> Option<&str> {
        self.proxy_url.as_deref()
    }

    pub fn num_buckets(&self) -> u32 {
        self.num_buckets
    }

    /// Falls back to local when the configured value is invalid.
    pub fn locking(&self) -> LockingMode {
        self.locking.clone().unwrap_or_default()
    }

    /// Lock backend for the configured mode.
    ///
    /// Distributed mode leases from an in-process store, so it only
    /// coordinates holders inside this node.
    pub fn lock_backend(&self) -> LockBackend {
        match self.locking() {
            LockingMode::Local => LockBackend::Local,
            LockingMode::Distributed => LockBackend::Distributed {
                store: Arc::new(MemoryLeaseStore::new()),
                expiry: self.lock_expiry(),
                timeout: self.lock_timeout(),
            },
        }
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    pub fn lock_expiry(&self) -> Duration {
        Duration::from_millis(self.lock_expiry_ms)
    }

    pub fn otp_issuer(&self) -> &str {
        &self.otp_issuer
    }

    pub fn otp_digits(&self) -> u32 {
        self.otp_digits
    }

    pub fn otp_period_secs(&self) -> u64 {
        self.otp_period_secs
    }

    pub fn normal_limit(&self) -> crate::error::GuardianResult<LimitConfig> {
        LimitConfig::new(
            self.max_failures,
            Duration::from_secs(self.limit_period_secs),
        )
    }

    pub fn security_mode_limit(&self) -> crate::error::GuardianResult<LimitConfig> {
        LimitConfig::new(
            self.security_mode_max_failures,
            Duration::from_secs(self.security_mode_limit_period_secs),
        )
    }

    pub fn otp_write_delay_secs(&self) -> u64 {
        self.otp_write_delay_secs
    }

    pub fn max_txs(&self) -> usize {
        self.max_txs
    }

    pub fn skip_tx_user_sig_verify(&self) -> bool {
        self.skip_tx_user_sig_verify
    }

    pub fn registry_config(&self) -> RegistryConfig {
        RegistryConfig {
            request_timeout: self.request_timeout(),
            otp_write_delay_secs: self.otp_write_delay_secs,
            max_transactions: self.max_txs,
            skip_tx_user_sig_verify: self.skip_tx_user_sig_verify,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_locking_mode_parsing() {
        assert_eq!("local".parse::<LockingMode>().unwrap(), LockingMode::Local);
        assert_eq!(
            "DISTRIBUTED".parse::<LockingMode>().unwrap(),
            LockingMode::Distributed
        );
        assert!("redis".parse::<LockingMode>().is_err());
    }

    #[test]
    fn test_settings_validation() {
        assert!(Settings::for_tests().validate().is_ok());
    }

    #[test]
    fn test_missing_required_values() {
        let mut settings = Settings::for_tests();
        settings.mnemonic = None;
        assert!(settings.validate().unwrap_err().contains("GUARDIAN_MNEMONIC"));

        let mut settings = Settings::for_tests();
        settings.managed_key = Some("not base64!".to_string());
        assert!(settings.validate().unwrap_err().contains("GUARDIAN_MANAGED_KEY"));

        let mut settings = Settings::for_tests();
        settings.proxy_url = Some("no scheme".to_string());
        assert!(settings.validate().unwrap_err().contains("GUARDIAN_PROXY_URL"));
    }

    #[test]
    fn test_invalid_numeric_values() {
        let mut settings = Settings::for_tests();
        settings.num_buckets = 0;
        assert!(settings.validate().is_err());

        let mut settings = Settings::for_tests();
        settings.max_failures = 0;
        assert!(settings.validate().unwrap_err().starts_with("Normal limiter"));

        let mut settings = Settings::for_tests();
        settings.security_mode_limit_period_secs = 0;
        assert!(settings.validate().is_err());

        let mut settings = Settings::for_tests();
        settings.otp_write_delay_secs = 0;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_invalid_locking_mode_rejected() {
        let mut settings = Settings::for_tests();
        settings.locking = "zookeeper".parse::<LockingMode>();
        assert!(settings.validate().unwrap_err().contains("zookeeper"));
        assert_eq!(settings.locking(), LockingMode::Local);
    }

    #[test]
    fn test_malformed_numbers_fall_back_to_default() {
        assert_eq!(parse_or_default("GUARDIAN_NUM_BUCKETS", "", 4u32), 4);
        assert_eq!(parse_or_default("GUARDIAN_NUM_BUCKETS", "16", 4u32), 16);
        assert_eq!(parse_or_default("GUARDIAN_NUM_BUCKETS", "sixteen", 4u32), 4);
        assert_eq!(parse_or_default("GUARDIAN_MAX_FAILURES", "-1", 3u32), 3);
    }

    #[test]
    fn test_lock_backend_follows_mode() {
        let mut settings = Settings::for_tests();
        assert!(matches!(settings.lock_backend(), LockBackend::Local));

        settings.locking = Ok(LockingMode::Distributed);
        settings.lock_timeout_ms = 250;
        settings.lock_expiry_ms = 900;
        assert!(settings.validate().is_ok());
        match settings.lock_backend() {
            LockBackend::Distributed {
                expiry, timeout, ..
            } => {
                assert_eq!(expiry, Duration::from_millis(900));
                assert_eq!(timeout, Duration::from_millis(250));
            }
            LockBackend::Local => panic!("expected distributed backend"),
        }

        settings.lock_expiry_ms = 0;
        assert!(settings.validate().unwrap_err().contains("GUARDIAN_LOCK_EXPIRY_MS"));
    }

    #[test]
    fn test_registry_config_mirrors_settings() {
        let settings = Settings::for_tests();
        let config = settings.registry_config();
        assert_eq!(config.max_transactions, 100);
        assert_eq!(config.otp_write_delay_secs, 60);
        assert_eq!(config.request_timeout, Duration::from_secs(1));
    }
}
