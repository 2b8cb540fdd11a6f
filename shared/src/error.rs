//! # Error Types for the Offline Verification Kiosk
//!
//! This module defines all error types used throughout the system,
//! providing detailed error information for debugging and logging.

use thiserror::Error;

use crate::types::VerificationErrorCode;

/// Main error type for the entire system
#[derive(Error, Debug)]
pub enum IdentityError {
    // =========================================================================
    // INPUT ERRORS
    // =========================================================================

    /// Malformed or missing input; never retried
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Referenced cache entry is absent
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    // =========================================================================
    // CREDENTIAL ERRORS
    // =========================================================================

    /// Credential has been revoked
    #[error("Credential '{credential_id}' has been revoked")]
    Revoked { credential_id: String },

    /// Credential is past its offline horizon and cannot be refreshed
    #[error("Credential '{credential_id}' is past its offline validity horizon")]
    Stale { credential_id: String },

    /// Credential is past its expiry
    #[error("Credential '{credential_id}' expired at {expired_at}")]
    Expired { credential_id: String, expired_at: String },

    /// Credential signature is invalid
    #[error("Invalid credential signature: {0}")]
    InvalidSignature(String),

    // =========================================================================
    // BIOMETRIC ERRORS
    // =========================================================================

    /// Nothing eligible to compare against
    #[error("No eligible template: {0}")]
    NoTemplate(String),

    /// Compared and no candidate passed the thresholds
    #[error("No match above threshold")]
    NoMatch,

    /// External matcher failed or returned garbage
    #[error("Matcher unavailable: {0}")]
    MatcherUnavailable(String),

    /// External matcher exceeded its deadline
    #[error("Matcher timed out after {timeout_ms} ms")]
    MatcherTimeout { timeout_ms: u64 },

    // =========================================================================
    // CRYPTOGRAPHY ERRORS
    // =========================================================================

    /// Failed to encrypt/decrypt data
    #[error("Encryption error: {0}")]
    EncryptionError(String),

    /// Template references a key the key ring does not hold
    #[error("Unknown encryption key: {0}")]
    UnknownKey(String),

    /// Stored hash does not match the stored bytes
    #[error("Integrity check failed for {0}")]
    IntegrityError(String),

    /// Invalid key encoding
    #[error("Invalid key material: {0}")]
    InvalidKey(String),

    // =========================================================================
    // SYNC ERRORS
    // =========================================================================

    /// Remote ledger or identity service unreachable or refused the request
    #[error("Sync failure: {0}")]
    SyncFailure(String),

    /// Pending item state machine violation
    #[error("Invalid pending item transition from {from} to {to}")]
    InvalidTransition { from: String, to: String },

    // =========================================================================
    // STORAGE ERRORS
    // =========================================================================

    /// Failed to read/write file
    #[error("Storage I/O error: {0}")]
    StorageIOError(String),

    // =========================================================================
    // CONFIGURATION ERRORS
    // =========================================================================

    /// Invalid configuration
    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    /// Missing required environment variable
    #[error("Missing environment variable: {0}")]
    MissingEnvVar(String),

    // =========================================================================
    // GENERIC ERRORS
    // =========================================================================

    /// Internal error
    #[error("Internal error: {0}")]
    InternalError(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    SerializationError(String),
}

/// Result type alias using IdentityError
pub type IdentityResult<T> = Result<T, IdentityError>;

impl IdentityError {
    /// Shorthand for a missing entry of the given kind
    pub fn not_found(kind: &'static str, id: impl ToString) -> Self {
        IdentityError::NotFound {
            kind,
            id: id.to_string(),
        }
    }
}

// =============================================================================
// ERROR CONVERSIONS
// =============================================================================

impl From<serde_json::Error> for IdentityError {
    fn from(err: serde_json::Error) -> Self {
        IdentityError::SerializationError(err.to_string())
    }
}

impl From<std::io::Error> for IdentityError {
    fn from(err: std::io::Error) -> Self {
        IdentityError::StorageIOError(err.to_string())
    }
}

impl From<hex::FromHexError> for IdentityError {
    fn from(err: hex::FromHexError) -> Self {
        IdentityError::InvalidKey(err.to_string())
    }
}

impl From<base64::DecodeError> for IdentityError {
    fn from(err: base64::DecodeError) -> Self {
        IdentityError::SerializationError(err.to_string())
    }
}

impl From<ed25519_dalek::SignatureError> for IdentityError {
    fn from(err: ed25519_dalek::SignatureError) -> Self {
        IdentityError::InvalidSignature(err.to_string())
    }
}

// =============================================================================
// ERROR CATEGORIES (for metrics and logging)
// =============================================================================

impl IdentityError {
    /// Get the error category for metrics/logging
    pub fn category(&self) -> &'static str {
        match self {
            IdentityError::InvalidArgument(_) | IdentityError::NotFound { .. } => "input",

            IdentityError::Revoked { .. }
            | IdentityError::Stale { .. }
            | IdentityError::Expired { .. }
            | IdentityError::InvalidSignature(_) => "credential",

            IdentityError::NoTemplate(_)
            | IdentityError::NoMatch
            | IdentityError::MatcherUnavailable(_)
            | IdentityError::MatcherTimeout { .. } => "biometric",

            IdentityError::EncryptionError(_)
            | IdentityError::UnknownKey(_)
            | IdentityError::IntegrityError(_)
            | IdentityError::InvalidKey(_) => "crypto",

            IdentityError::SyncFailure(_) | IdentityError::InvalidTransition { .. } => "sync",

            IdentityError::StorageIOError(_) => "storage",

            IdentityError::ConfigurationError(_) | IdentityError::MissingEnvVar(_) => "config",

            IdentityError::InternalError(_) | IdentityError::SerializationError(_) => "internal",
        }
    }

    /// Check if the error is retryable
    ///
    /// Matcher failures are retryable by the caller; sync failures are
    /// retried by the sync coordinator.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            IdentityError::MatcherUnavailable(_)
                | IdentityError::MatcherTimeout { .. }
                | IdentityError::SyncFailure(_)
                | IdentityError::StorageIOError(_)
        )
    }

    /// Result code reported on a verification result for this error
    pub fn verification_code(&self) -> VerificationErrorCode {
        match self {
            IdentityError::InvalidArgument(_) => VerificationErrorCode::InvalidArgument,
            IdentityError::NotFound { .. } => VerificationErrorCode::NotFound,
            IdentityError::Revoked { .. } => VerificationErrorCode::Revoked,
            IdentityError::Stale { .. } => VerificationErrorCode::Stale,
            IdentityError::Expired { .. } => VerificationErrorCode::Expired,
            IdentityError::InvalidSignature(_) => VerificationErrorCode::InvalidSignature,
            IdentityError::NoTemplate(_) => VerificationErrorCode::NoTemplate,
            IdentityError::NoMatch => VerificationErrorCode::NoMatch,
            IdentityError::MatcherUnavailable(_) | IdentityError::MatcherTimeout { .. } => {
                VerificationErrorCode::MatcherUnavailable
            }
            _ => VerificationErrorCode::InternalError,
        }
    }
}
