//! RFC 6238 time-based one-time passwords.

use std::time::{SystemTime, UNIX_EPOCH};

use data_encoding::BASE32_NOPAD;
use hmac::{Hmac, Mac};
use hpke::rand_core::{OsRng, RngCore};
use serde::{Deserialize, Serialize};
use sha1::Sha1;
use url::Url;
use zeroize::Zeroize;

use crate::error::{GuardianError, GuardianResult};

type HmacSha1 = Hmac<Sha1>;

const SECRET_LEN: usize = 20;
const ALGORITHM: &str = "SHA1";
/// Steps accepted on either side of the current one.
const SKEW_STEPS: i64 = 1;

/// One user's TOTP secret plus its display parameters.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Totp {
    #[serde(with = "base32_serde")]
    secret: Vec<u8>,
    issuer: String,
    account: String,
    digits: u32,
    period: u64,
}

impl std::fmt::Debug for Totp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Totp")
            .field("issuer", &self.issuer)
            .field("account", &self.account)
            .field("digits", &self.digits)
            .field("period", &self.period)
            .finish_non_exhaustive()
    }
}

impl Totp {
    pub fn new(
        secret: Vec<u8>,
        issuer: &str,
        account: &str,
        digits: u32,
        period: u64,
    ) -> GuardianResult<Self> {
        if secret.is_empty() {
            return Err(GuardianError::InvalidValue("empty TOTP secret".to_string()));
        }
        if !(6..=8).contains(&digits) {
            return Err(GuardianError::InvalidValue(format!(
                "TOTP digits must be 6..=8, got {digits}"
            )));
        }
        if period == 0 {
            return Err(GuardianError::InvalidValue(
                "TOTP period must be positive".to_string(),
            ));
        }

        Ok(Self {
            secret,
            issuer: issuer.to_string(),
            account: account.to_string(),
            digits,
            period,
        })
    }

    pub fn issuer(&self) -> &str {
        &self.issuer
    }

    pub fn account(&self) -> &str {
        &self.account
    }

    pub fn digits(&self) -> u32 {
        self.digits
    }

    pub fn period(&self) -> u64 {
        self.period
    }

    /// Unpadded base32 secret, as authenticator apps expect it.
    pub fn secret_base32(&self) -> String {
        base32_encode(&self.secret)
    }

    /// Code for the step containing `unix_secs`.
    pub fn code_at(&self, unix_secs: u64) -> GuardianResult<String> {
        self.code_for_step(unix_secs / self.period)
    }

    /// Check `code` against the current time.
    pub fn validate(&self, code: &str) -> GuardianResult<()> {
        self.validate_at(code, unix_now()?)
    }

    pub fn validate_at(&self, code: &str, unix_secs: u64) -> GuardianResult<()> {
        if code.len() != self.digits as usize || !code.bytes().all(|b| b.is_ascii_digit()) {
            return Err(GuardianError::InvalidCode);
        }

        let step = i64::try_from(unix_secs / self.period)
            .map_err(|_| GuardianError::Internal("clock out of range".to_string()))?;

        for offset in -SKEW_STEPS..=SKEW_STEPS {
            let Ok(candidate) = u64::try_from(step + offset) else {
                continue;
            };
            if constant_time_eq(self.code_for_step(candidate)?.as_bytes(), code.as_bytes()) {
                return Ok(());
            }
        }

        Err(GuardianError::InvalidCode)
    }

    /// `otpauth://totp/<issuer>:<account>?secret=..&issuer=..&algorithm=SHA1&digits=..&period=..`
    pub fn url(&self) -> GuardianResult<String> {
        let mut url = Url::parse("otpauth://totp/")
            .map_err(|e| GuardianError::Internal(format!("otpauth base url: {e}")))?;
        url.set_path(&format!("{}:{}", self.issuer, self.account));
        url.query_pairs_mut()
            .append_pair("secret", &self.secret_base32())
            .append_pair("issuer", &self.issuer)
            .append_pair("algorithm", ALGORITHM)
            .append_pair("digits", &self.digits.to_string())
            .append_pair("period", &self.period.to_string());
        Ok(url.into())
    }

    /// Enrollment data shown to the user once.
    pub fn enrollment(&self, time_since_generation: i64) -> OtpEnrollment {
        OtpEnrollment {
            scheme: "otpauth".to_string(),
            host: "totp".to_string(),
            issuer: self.issuer.clone(),
            account: self.account.clone(),
            algorithm: ALGORITHM.to_string(),
            digits: self.digits,
            period: self.period,
            secret: self.secret_base32(),
            time_since_generation,
        }
    }

    pub fn to_bytes(&self) -> GuardianResult<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| GuardianError::Serialization(e.to_string()))
    }

    pub fn from_bytes(bytes: &[u8]) -> GuardianResult<Self> {
        let totp: Self = serde_json::from_slice(bytes)
            .map_err(|e| GuardianError::Deserialization(format!("TOTP record: {e}")))?;
        Self::new(
            totp.secret.clone(),
            &totp.issuer,
            &totp.account,
            totp.digits,
            totp.period,
        )
    }

    fn code_for_step(&self, step: u64) -> GuardianResult<String> {
        let mut mac = HmacSha1::new_from_slice(&self.secret)
            .map_err(|e| GuardianError::Internal(format!("HMAC key: {e}")))?;
        mac.update(&step.to_be_bytes());
        let digest = mac.finalize().into_bytes();

        let offset = (digest[digest.len() - 1] & 0x0f) as usize;
        let binary = u32::from_be_bytes([
            digest[offset] & 0x7f,
            digest[offset + 1],
            digest[offset + 2],
            digest[offset + 3],
        ]);
        let code = binary % 10u32.pow(self.digits);

        Ok(format!("{code:0width$}", width = self.digits as usize))
    }
}

impl Drop for Totp {
    fn drop(&mut self) {
        self.secret.zeroize();
    }
}

/// Parsed enrollment record returned on registration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OtpEnrollment {
    pub scheme: String,
    pub host: String,
    pub issuer: String,
    pub account: String,
    pub algorithm: String,
    pub digits: u32,
    pub period: u64,
    pub secret: String,
    pub time_since_generation: i64,
}

/// Creates and restores OTP handlers.
pub trait OtpProvider: Send + Sync {
    /// Fresh secret labelled with `account`.
    fn generate(&self, account: &str) -> GuardianResult<Totp>;

    /// Restore a handler persisted with `Totp::to_bytes`.
    fn from_bytes(&self, bytes: &[u8]) -> GuardianResult<Totp> {
        Totp::from_bytes(bytes)
    }
}

/// Provider issuing random SHA1 TOTP secrets.
#[derive(Debug, Clone)]
pub struct TotpProvider {
    issuer: String,
    digits: u32,
    period: u64,
}

impl TotpProvider {
    pub fn new(issuer: &str, digits: u32, period: u64) -> GuardianResult<Self> {
        if issuer.trim().is_empty() {
            return Err(GuardianError::InvalidValue(
                "OTP issuer must not be empty".to_string(),
            ));
        }
        // Surface bad parameters at construction
        Totp::new(vec![0u8; SECRET_LEN], issuer, "probe", digits, period)?;

        Ok(Self {
            issuer: issuer.to_string(),
            digits,
            period,
        })
    }
}

impl OtpProvider for TotpProvider {
    fn generate(&self, account: &str) -> GuardianResult<Totp> {
        let mut secret = vec![0u8; SECRET_LEN];
        OsRng.fill_bytes(&mut secret);
        Totp::new(secret, &self.issuer, account, self.digits, self.period)
    }
}

pub(crate) fn unix_now() -> GuardianResult<u64> {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .map_err(|e| GuardianError::Internal(format!("system clock before epoch: {e}")))
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    a.len() == b.len() && a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

fn base32_encode(data: &[u8]) -> String {
    BASE32_NOPAD.encode(data)
}

/// Accepts lowercase and `=` padding, as some authenticator exports carry them.
fn base32_decode(encoded: &str) -> Option<Vec<u8>> {
    let normalized = encoded.trim_end_matches('=').to_ascii_uppercase();
    BASE32_NOPAD.decode(normalized.as_bytes()).ok()
}

mod base32_serde {
    use serde::{Deserialize, Deserializer, Serializer, de::Error};

    pub fn serialize<S: Serializer>(secret: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&super::base32_encode(secret))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        super::base32_decode(&encoded).ok_or_else(|| D::Error::custom("invalid base32 secret"))
    }
}
