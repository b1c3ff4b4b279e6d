//! Error types for the guardian service.
//!
//! All errors implement `ResponseError` for Actix-web integration,
//! converting domain errors into appropriate HTTP status codes.

use actix_web::{HttpResponse, ResponseError, http::StatusCode};
use serde::Serialize;
use thiserror::Error;

use crate::otp::OtpCodeVerifyData;

/// Service error type with structured error responses.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GuardianError {
    // Sharding errors
    #[error("Invalid number of buckets")]
    InvalidNumberOfBuckets,

    #[error("Invalid bucket id: {0}")]
    InvalidBucketId(u32),

    #[error("Index overflow: {0}")]
    IndexOverflow(String),

    // Storage errors
    #[error("Key not found")]
    KeyNotFound,

    #[error("Storage closed")]
    StorageClosed,

    #[error("Storage error: {0}")]
    Storage(String),

    // Locking errors
    #[error("Lock acquisition timed out for key {0}")]
    LockTimeout(String),

    #[error("Lock not held for key {0}")]
    LockNotHeld(String),

    // Configuration errors
    #[error("Invalid value: {0}")]
    InvalidValue(String),

    // Validation errors
    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("Invalid guardian: {0}")]
    InvalidGuardian(String),

    #[error("Invalid guardian state: guardian {0} is already usable")]
    InvalidGuardianState(String),

    #[error("Guardian not usable: {0}")]
    GuardianNotUsable(String),

    #[error("Guardian mismatch between transactions")]
    GuardianMismatch,

    #[error("Invalid sender: expected {expected}, got {actual}")]
    InvalidSender { expected: String, actual: String },

    #[error("Invalid user signature: {0}")]
    InvalidUserSignature(String),

    #[error("No transaction to sign")]
    NoTransactionToSign,

    #[error("Too many transactions to sign: got {got}, max allowed {max}")]
    TooManyTransactionsToSign { got: usize, max: usize },

    #[error("No balance for account {0}")]
    NoBalance(String),

    #[error("Account has no active guardian")]
    AccountHasNoActiveGuardian,

    // Code verification errors
    #[error("Invalid code")]
    InvalidCode,

    #[error("Second code invalid in security mode: {0}")]
    SecondCodeInvalidInSecurityMode(String),

    #[error("Too many failed attempts")]
    TooManyFailedAttempts,

    #[error("Registration failed: last update was {otp_age_secs} seconds ago, retry in {retry_after_secs} seconds")]
    RegistrationFailed {
        otp_age_secs: i64,
        retry_after_secs: i64,
    },

    // Crypto errors
    #[error("Encryption failed: {0}")]
    Encryption(String),

    #[error("Decryption failed: {0}")]
    Decryption(String),

    // Chain errors
    #[error("Chain request failed: {0}")]
    Chain(String),

    #[error("Chain request timed out")]
    ChainTimeout,

    // Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),

    // Internal errors
    #[error("Internal error: {0}")]
    Internal(String),
}

/// JSON error response body.
#[derive(Serialize)]
struct ErrorResponse<'a> {
    error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<&'a OtpCodeVerifyData>,
}

impl GuardianError {
    /// Get the error code for structured error responses.
    pub fn error_code(&self) -> Option<&'static str> {
        match self {
            Self::InvalidNumberOfBuckets => Some("INVALID_NUMBER_OF_BUCKETS"),
            Self::InvalidBucketId(_) => Some("INVALID_BUCKET_ID"),
            Self::IndexOverflow(_) => Some("INDEX_OVERFLOW"),
            Self::KeyNotFound => Some("KEY_NOT_FOUND"),
            Self::StorageClosed => Some("STORAGE_CLOSED"),
            Self::Storage(_) => Some("STORAGE_ERROR"),
            Self::LockTimeout(_) => Some("LOCK_TIMEOUT"),
            Self::LockNotHeld(_) => Some("LOCK_NOT_HELD"),
            Self::InvalidValue(_) => Some("INVALID_VALUE"),
            Self::InvalidAddress(_) => Some("INVALID_ADDRESS"),
            Self::InvalidGuardian(_) => Some("INVALID_GUARDIAN"),
            Self::InvalidGuardianState(_) => Some("INVALID_GUARDIAN_STATE"),
            Self::GuardianNotUsable(_) => Some("GUARDIAN_NOT_USABLE"),
            Self::GuardianMismatch => Some("GUARDIAN_MISMATCH"),
            Self::InvalidSender { .. } => Some("INVALID_SENDER"),
            Self::InvalidUserSignature(_) => Some("INVALID_USER_SIGNATURE"),
            Self::NoTransactionToSign => Some("NO_TRANSACTION_TO_SIGN"),
            Self::TooManyTransactionsToSign { .. } => Some("TOO_MANY_TRANSACTIONS_TO_SIGN"),
            Self::NoBalance(_) => Some("NO_BALANCE"),
            Self::AccountHasNoActiveGuardian => Some("ACCOUNT_HAS_NO_ACTIVE_GUARDIAN"),
            Self::InvalidCode => Some("INVALID_CODE"),
            Self::SecondCodeInvalidInSecurityMode(_) => Some("SECOND_CODE_INVALID"),
            Self::TooManyFailedAttempts => Some("TOO_MANY_FAILED_ATTEMPTS"),
            Self::RegistrationFailed { .. } => Some("REGISTRATION_FAILED"),
            Self::Encryption(_) => Some("ENCRYPTION_FAILED"),
            Self::Decryption(_) => Some("DECRYPTION_FAILED"),
            Self::Chain(_) => Some("CHAIN_ERROR"),
            Self::ChainTimeout => Some("CHAIN_TIMEOUT"),
            Self::Serialization(_) => Some("SERIALIZATION_ERROR"),
            Self::Deserialization(_) => Some("DESERIALIZATION_ERROR"),
            Self::Internal(_) => None, // Don't expose internal error codes
        }
    }

    fn response_with_data(&self, data: Option<&OtpCodeVerifyData>) -> HttpResponse {
        let body = ErrorResponse {
            error: self.to_string(),
            code: self.error_code().map(String::from),
            data,
        };

        HttpResponse::build(self.status_code()).json(body)
    }
}

impl ResponseError for GuardianError {
    fn status_code(&self) -> StatusCode {
        match self {
            // 400 Bad Request - Client errors
            Self::InvalidAddress(_)
            | Self::InvalidGuardian(_)
            | Self::GuardianMismatch
            | Self::InvalidSender { .. }
            | Self::InvalidUserSignature(_)
            | Self::NoTransactionToSign
            | Self::TooManyTransactionsToSign { .. }
            | Self::NoBalance(_)
            | Self::AccountHasNoActiveGuardian
            | Self::Deserialization(_) => StatusCode::BAD_REQUEST,

            // 401 Unauthorized - Wrong second factor
            Self::InvalidCode | Self::SecondCodeInvalidInSecurityMode(_) => {
                StatusCode::UNAUTHORIZED
            }

            // 404 Not Found
            Self::KeyNotFound => StatusCode::NOT_FOUND,

            // 409 Conflict - State conflicts
            Self::InvalidGuardianState(_) | Self::GuardianNotUsable(_) => StatusCode::CONFLICT,

            // 429 Too Many Requests
            Self::TooManyFailedAttempts | Self::RegistrationFailed { .. } => {
                StatusCode::TOO_MANY_REQUESTS
            }

            // 502 Bad Gateway / 504 Gateway Timeout - Downstream errors
            Self::Chain(_) => StatusCode::BAD_GATEWAY,
            Self::ChainTimeout => StatusCode::GATEWAY_TIMEOUT,

            // 503 Service Unavailable - Lock contention or shutdown
            Self::LockTimeout(_) | Self::StorageClosed => StatusCode::SERVICE_UNAVAILABLE,

            // 500 Internal Server Error - Everything else
            Self::InvalidNumberOfBuckets
            | Self::InvalidBucketId(_)
            | Self::IndexOverflow(_)
            | Self::Storage(_)
            | Self::LockNotHeld(_)
            | Self::InvalidValue(_)
            | Self::Encryption(_)
            | Self::Decryption(_)
            | Self::Serialization(_)
            | Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_response(&self) -> HttpResponse {
        self.response_with_data(None)
    }
}

/// Failure of an operation that consumed a verification attempt.
///
/// Carries the remaining-trials snapshot so callers can render
/// "try again in N seconds" alongside the error.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{error}")]
pub struct AttemptError {
    pub error: GuardianError,
    pub verify_data: Option<OtpCodeVerifyData>,
}

impl AttemptError {
    pub fn new(error: GuardianError, verify_data: Option<OtpCodeVerifyData>) -> Self {
        Self { error, verify_data }
    }
}

impl From<GuardianError> for AttemptError {
    fn from(error: GuardianError) -> Self {
        Self {
            error,
            verify_data: None,
        }
    }
}

impl ResponseError for AttemptError {
    fn status_code(&self) -> StatusCode {
        self.error.status_code()
    }

    fn error_response(&self) -> HttpResponse {
        self.error.response_with_data(self.verify_data.as_ref())
    }
}

// Conversion from common error types

impl From<std::io::Error> for GuardianError {
    fn from(err: std::io::Error) -> Self {
        Self::Storage(err.to_string())
    }
}

impl From<serde_json::Error> for GuardianError {
    fn from(err: serde_json::Error) -> Self {
        if err.is_data() || err.is_syntax() || err.is_eof() {
            Self::Deserialization(err.to_string())
        } else {
            Self::Serialization(err.to_string())
        }
    }
}

impl From<redb::Error> for GuardianError {
    fn from(err: redb::Error) -> Self {
        Self::Storage(err.to_string())
    }
}

impl From<redb::DatabaseError> for GuardianError {
    fn from(err: redb::DatabaseError) -> Self {
        Self::Storage(err.to_string())
    }
}

impl From<redb::TableError> for GuardianError {
    fn from(err: redb::TableError) -> Self {
        Self::Storage(err.to_string())
    }
}

impl From<redb::TransactionError> for GuardianError {
    fn from(err: redb::TransactionError) -> Self {
        Self::Storage(err.to_string())
    }
}

impl From<redb::CommitError> for GuardianError {
    fn from(err: redb::CommitError) -> Self {
        Self::Storage(err.to_string())
    }
}

impl From<redb::StorageError> for GuardianError {
    fn from(err: redb::StorageError) -> Self {
        Self::Storage(err.to_string())
    }
}

impl From<reqwest::Error> for GuardianError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::ChainTimeout
        } else if err.is_decode() {
            Self::Deserialization(err.to_string())
        } else {
            Self::Chain(err.to_string())
        }
    }
}

/// Result type alias for guardian operations.
pub type GuardianResult<T> = Result<T, GuardianError>;

/// Result type alias for operations that report verification attempts.
pub type AttemptResult<T> = Result<(T, OtpCodeVerifyData), AttemptError>;
