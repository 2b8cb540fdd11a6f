//! # Shared Data Types for the Offline Verification Kiosk
//!
//! This module defines the cache rows, the verification result model and
//! the ledger wire types shared by the device client and its tooling.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::digest::{matches_sha256, sha256_hex};
use crate::error::{IdentityError, IdentityResult};

// =============================================================================
// ALGORITHMS AND MODALITIES
// =============================================================================

/// Biometric modality of a capture or template
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum BiometricModality {
    Fingerprint,
    Face,
    Iris,
    Voice,
    Palm,
    Vein,
    /// Capture pipeline could not classify the sample; never matched
    Unknown,
}

impl BiometricModality {
    /// Every modality a matcher can compare
    pub const MATCHABLE: [BiometricModality; 6] = [
        BiometricModality::Fingerprint,
        BiometricModality::Face,
        BiometricModality::Iris,
        BiometricModality::Voice,
        BiometricModality::Palm,
        BiometricModality::Vein,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            BiometricModality::Fingerprint => "fingerprint",
            BiometricModality::Face => "face",
            BiometricModality::Iris => "iris",
            BiometricModality::Voice => "voice",
            BiometricModality::Palm => "palm",
            BiometricModality::Vein => "vein",
            BiometricModality::Unknown => "unknown",
        }
    }

    /// Whether samples of this modality may be handed to a matcher
    pub fn is_matchable(&self) -> bool {
        !matches!(self, BiometricModality::Unknown)
    }
}

impl fmt::Display for BiometricModality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BiometricModality {
    type Err = IdentityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "fingerprint" | "finger" => Ok(BiometricModality::Fingerprint),
            "face" | "facial" => Ok(BiometricModality::Face),
            "iris" => Ok(BiometricModality::Iris),
            "voice" => Ok(BiometricModality::Voice),
            "palm" => Ok(BiometricModality::Palm),
            "vein" => Ok(BiometricModality::Vein),
            "unknown" => Ok(BiometricModality::Unknown),
            other => Err(IdentityError::InvalidArgument(format!(
                "unknown biometric modality '{}'",
                other
            ))),
        }
    }
}

/// Encoding of the plaintext template handed to the matcher
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TemplateFormat {
    /// ISO/IEC 19794-2 finger minutiae
    IsoFingerMinutiae,
    /// ISO/IEC 19794-5 face image
    IsoFaceImage,
    /// ISO/IEC 19794-6 iris image
    IsoIrisImage,
    /// Fixed-length feature vector produced by the capture pipeline
    FeatureVector,
}

/// Signature scheme of a cached credential payload
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum SignatureAlgorithm {
    #[serde(rename = "EdDSA")]
    Ed25519,
}

impl SignatureAlgorithm {
    /// JOSE `alg` header value
    pub fn jws_alg(&self) -> &'static str {
        match self {
            SignatureAlgorithm::Ed25519 => "EdDSA",
        }
    }
}

// =============================================================================
// CACHED CREDENTIAL
// =============================================================================

/// A locally stored, signed assertion about an identity
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CachedCredential {
    /// Cache entry id
    pub id: Uuid,

    /// Identity the credential is about
    pub identity_id: Uuid,

    /// Decentralized identifier of the subject, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub did: Option<String>,

    /// Signed credential token (compact JWS)
    pub payload: String,

    /// Credential type, e.g. "ResidentCard"
    pub credential_type: String,

    /// Issuer identifier
    pub issuer: String,

    /// Signature scheme of the payload
    pub algorithm: SignatureAlgorithm,

    pub cached_at: DateTime<Utc>,
    pub issued_at: DateTime<Utc>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,

    /// Latest instant the entry may be trusted without a live check
    pub offline_valid_until: DateTime<Utc>,

    /// SHA-256 hex digest of `payload`
    pub payload_hash: String,

    pub online_verified: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_online_check: Option<DateTime<Utc>>,

    pub is_revoked: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revocation_check_at: Option<DateTime<Utc>>,

    /// Higher is re-checked sooner
    pub sync_priority: i32,

    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl CachedCredential {
    /// Create a new cache entry for a freshly fetched credential
    pub fn new(
        identity_id: Uuid,
        credential_type: impl Into<String>,
        issuer: impl Into<String>,
        payload: impl Into<String>,
        issued_at: DateTime<Utc>,
        expires_at: Option<DateTime<Utc>>,
        offline_valid_until: DateTime<Utc>,
    ) -> Self {
        let payload = payload.into();
        Self {
            id: Uuid::new_v4(),
            identity_id,
            did: None,
            payload_hash: sha256_hex(&payload),
            payload,
            credential_type: credential_type.into(),
            issuer: issuer.into(),
            algorithm: SignatureAlgorithm::Ed25519,
            cached_at: Utc::now(),
            issued_at,
            expires_at,
            offline_valid_until,
            online_verified: false,
            last_online_check: None,
            is_revoked: false,
            revocation_check_at: None,
            sync_priority: crate::constants::DEFAULT_SYNC_PRIORITY,
            metadata: BTreeMap::new(),
        }
    }

    /// Mark the entry as verified online at `at` (fetch time)
    pub fn verified_online_at(mut self, at: DateTime<Utc>) -> Self {
        self.online_verified = true;
        self.last_online_check = Some(at);
        self.revocation_check_at = Some(at);
        self
    }

    pub fn with_did(mut self, did: impl Into<String>) -> Self {
        self.did = Some(did.into());
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.sync_priority = priority;
        self
    }

    /// Past `expires_at`; invalid online and offline
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map_or(false, |expires_at| now > expires_at)
    }

    /// Whether the entry may be trusted without a live check
    pub fn is_valid_offline(&self, now: DateTime<Utc>) -> bool {
        if self.is_revoked {
            return false;
        }
        if now > self.offline_valid_until {
            return false;
        }
        !self.is_expired(now)
    }

    /// Whether the last online check is missing or older than `max_offline_age`
    pub fn needs_online_verification(&self, now: DateTime<Utc>, max_offline_age: Duration) -> bool {
        match self.last_online_check {
            None => true,
            Some(checked_at) => now - checked_at > max_offline_age,
        }
    }

    /// Write-time checks: required fields, horizon ordering and payload integrity
    pub fn validate(&self) -> IdentityResult<()> {
        if self.payload.trim().is_empty() {
            return Err(IdentityError::InvalidArgument(format!(
                "credential {} has an empty payload",
                self.id
            )));
        }
        if self.credential_type.trim().is_empty() {
            return Err(IdentityError::InvalidArgument(format!(
                "credential {} has no credential type",
                self.id
            )));
        }
        if let Some(expires_at) = self.expires_at {
            if self.offline_valid_until > expires_at {
                return Err(IdentityError::InvalidArgument(format!(
                    "credential {} offline horizon {} is after its expiry {}",
                    self.id, self.offline_valid_until, expires_at
                )));
            }
        }
        if !matches_sha256(&self.payload, &self.payload_hash) {
            return Err(IdentityError::IntegrityError(format!("credential {}", self.id)));
        }
        Ok(())
    }
}

// =============================================================================
// CACHED BIOMETRIC TEMPLATE
// =============================================================================

/// Why a template stopped being eligible for matching
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DeactivationReason {
    /// A newer enrollment of the same modality replaced it
    Superseded,
    /// Revoked by an operator or the identity service
    Revoked,
    /// The owning identity was removed from the device
    IdentityDeleted,
}

impl DeactivationReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeactivationReason::Superseded => "superseded",
            DeactivationReason::Revoked => "revoked",
            DeactivationReason::IdentityDeleted => "identity_deleted",
        }
    }
}

/// An encrypted biometric enrollment record
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CachedBiometricTemplate {
    pub id: Uuid,
    pub identity_id: Uuid,
    pub modality: BiometricModality,

    /// Ciphertext of the template, never plaintext
    #[serde(with = "base64_bytes")]
    pub encrypted_template: Vec<u8>,

    pub format: TemplateFormat,

    /// Capture quality at enrollment, 0.0 to 1.0
    pub quality_score: f64,

    pub cached_at: DateTime<Utc>,
    pub enrolled_at: DateTime<Utc>,

    /// SHA-256 hex digest of `encrypted_template`
    pub template_hash: String,

    /// Key ring entry that sealed `encrypted_template`
    pub encryption_key_id: String,

    #[serde(with = "base64_bytes")]
    pub encryption_iv: Vec<u8>,

    pub is_active: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deactivated_at: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deactivation_reason: Option<DeactivationReason>,
}

impl CachedBiometricTemplate {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map_or(false, |expires_at| now >= expires_at)
    }

    /// Active and unexpired; anything else must never reach a matcher
    pub fn is_valid_for_matching(&self, now: DateTime<Utc>) -> bool {
        self.is_active && !self.is_expired(now)
    }

    /// Soft delete; the row stays for the enrollment history
    pub fn mark_deactivated(&mut self, reason: DeactivationReason, at: DateTime<Utc>) {
        self.is_active = false;
        self.deactivated_at = Some(at);
        self.deactivation_reason = Some(reason);
    }

    /// Whether `template_hash` still matches the stored ciphertext
    pub fn verify_integrity(&self) -> bool {
        matches_sha256(&self.encrypted_template, &self.template_hash)
    }
}

// =============================================================================
// VERIFICATION RESULT
// =============================================================================

/// What a verification attempt checked
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum VerificationKind {
    Biometric,
    Credential,
}

/// Machine-readable reason carried by an unsuccessful result
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VerificationErrorCode {
    InvalidArgument,
    NotFound,
    NoTemplate,
    NoMatch,
    Revoked,
    Stale,
    Expired,
    InvalidSignature,
    MatcherUnavailable,
    InternalError,
}

impl VerificationErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            VerificationErrorCode::InvalidArgument => "INVALID_ARGUMENT",
            VerificationErrorCode::NotFound => "NOT_FOUND",
            VerificationErrorCode::NoTemplate => "NO_TEMPLATE",
            VerificationErrorCode::NoMatch => "NO_MATCH",
            VerificationErrorCode::Revoked => "REVOKED",
            VerificationErrorCode::Stale => "STALE",
            VerificationErrorCode::Expired => "EXPIRED",
            VerificationErrorCode::InvalidSignature => "INVALID_SIGNATURE",
            VerificationErrorCode::MatcherUnavailable => "MATCHER_UNAVAILABLE",
            VerificationErrorCode::InternalError => "INTERNAL_ERROR",
        }
    }

    /// True when the check itself could not be carried out
    pub fn is_not_attempted(&self) -> bool {
        matches!(
            self,
            VerificationErrorCode::InvalidArgument
                | VerificationErrorCode::NotFound
                | VerificationErrorCode::NoTemplate
                | VerificationErrorCode::MatcherUnavailable
                | VerificationErrorCode::InternalError
        )
    }
}

impl fmt::Display for VerificationErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Coarse outcome of a verification attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerificationOutcome {
    Success,
    NoMatch,
    Failure(VerificationErrorCode),
}

/// The outcome of one verification attempt.
///
/// Immutable once built: reconciliation produces a [`SyncRecord`] keyed by
/// the transaction id instead of touching the result.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OfflineVerificationResult {
    transaction_id: Uuid,
    kind: VerificationKind,
    success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    identity_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    credential_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    modality: Option<BiometricModality>,
    match_score: f64,
    quality_score: f64,
    was_offline: bool,
    sync_pending: bool,
    timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    error_code: Option<VerificationErrorCode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    error_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    device_id: Option<String>,
}

impl OfflineVerificationResult {
    fn base(kind: VerificationKind, success: bool) -> Self {
        Self {
            transaction_id: Uuid::new_v4(),
            kind,
            success,
            identity_id: None,
            credential_id: None,
            modality: None,
            match_score: 0.0,
            quality_score: 0.0,
            was_offline: false,
            sync_pending: false,
            timestamp: Utc::now(),
            error_code: None,
            error_message: None,
            device_id: None,
        }
    }

    /// A biometric match above both thresholds
    pub fn success(
        identity_id: Uuid,
        modality: BiometricModality,
        match_score: f64,
        quality_score: f64,
        was_offline: bool,
    ) -> Self {
        let mut result = Self::base(VerificationKind::Biometric, true);
        result.identity_id = Some(identity_id);
        result.modality = Some(modality);
        result.match_score = match_score;
        result.quality_score = quality_score;
        result.with_connectivity(was_offline)
    }

    /// A credential that passed the offline policy and its signature check
    pub fn credential_success(identity_id: Uuid, credential_id: Uuid, was_offline: bool) -> Self {
        let mut result = Self::base(VerificationKind::Credential, true);
        result.identity_id = Some(identity_id);
        result.credential_id = Some(credential_id);
        result.match_score = 1.0;
        result.quality_score = 1.0;
        result.with_connectivity(was_offline)
    }

    /// Compared against eligible templates and nothing passed the thresholds
    pub fn no_match(modality: BiometricModality, match_score: f64, quality_score: f64) -> Self {
        let mut result = Self::base(VerificationKind::Biometric, false);
        result.modality = Some(modality);
        result.match_score = match_score;
        result.quality_score = quality_score;
        result.error_code = Some(VerificationErrorCode::NoMatch);
        result.error_message = Some("no candidate above the configured thresholds".into());
        result
    }

    /// The attempt failed or could not be carried out
    pub fn failure(
        kind: VerificationKind,
        code: VerificationErrorCode,
        message: impl Into<String>,
    ) -> Self {
        let mut result = Self::base(kind, false);
        result.error_code = Some(code);
        result.error_message = Some(message.into());
        result
    }

    /// Record connectivity; only successes become sync-pending
    pub fn with_connectivity(mut self, was_offline: bool) -> Self {
        self.was_offline = was_offline;
        self.sync_pending = self.success && was_offline;
        self
    }

    pub fn with_modality(mut self, modality: BiometricModality) -> Self {
        self.modality = Some(modality);
        self
    }

    pub fn with_quality(mut self, quality_score: f64) -> Self {
        self.quality_score = quality_score;
        self
    }

    pub fn with_credential(mut self, credential_id: Uuid) -> Self {
        self.credential_id = Some(credential_id);
        self
    }

    pub fn with_device_id(mut self, device_id: impl Into<String>) -> Self {
        self.device_id = Some(device_id.into());
        self
    }

    pub fn transaction_id(&self) -> Uuid {
        self.transaction_id
    }

    pub fn kind(&self) -> VerificationKind {
        self.kind
    }

    pub fn is_success(&self) -> bool {
        self.success
    }

    pub fn identity_id(&self) -> Option<Uuid> {
        self.identity_id
    }

    pub fn credential_id(&self) -> Option<Uuid> {
        self.credential_id
    }

    pub fn modality(&self) -> Option<BiometricModality> {
        self.modality
    }

    pub fn match_score(&self) -> f64 {
        self.match_score
    }

    pub fn quality_score(&self) -> f64 {
        self.quality_score
    }

    pub fn was_offline(&self) -> bool {
        self.was_offline
    }

    /// Produced offline and awaiting reconciliation
    pub fn sync_pending(&self) -> bool {
        self.sync_pending
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn error_code(&self) -> Option<VerificationErrorCode> {
        self.error_code
    }

    pub fn error_message(&self) -> Option<&str> {
        self.error_message.as_deref()
    }

    pub fn device_id(&self) -> Option<&str> {
        self.device_id.as_deref()
    }

    pub fn outcome(&self) -> VerificationOutcome {
        match (self.success, self.error_code) {
            (true, _) => VerificationOutcome::Success,
            (false, Some(VerificationErrorCode::NoMatch)) => VerificationOutcome::NoMatch,
            (false, Some(code)) => VerificationOutcome::Failure(code),
            (false, None) => VerificationOutcome::Failure(VerificationErrorCode::InternalError),
        }
    }
}

/// Reconciliation of an offline result with the ledger
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SyncRecord {
    /// Transaction id of the reconciled result
    pub transaction_id: Uuid,
    pub reconciled_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ledger_log_id: Option<String>,
    /// Cached credentials refreshed as part of the reconciliation
    pub credentials_refreshed: usize,
}

// =============================================================================
// LEDGER WIRE TYPES
// =============================================================================

/// Transaction log submission
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TransactionLogRequest {
    pub transaction_type: String,
    pub entity_type: String,
    pub entity_id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub metadata: BTreeMap<String, String>,
    pub timestamp: DateTime<Utc>,
    pub correlation_id: String,
}

/// Ledger answer to a transaction log submission
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TransactionLogResponse {
    pub success: bool,
    #[serde(default)]
    pub log_id: Option<String>,
}

/// Identity service answer to a credential status check
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CredentialStatusResponse {
    pub credential_id: Uuid,
    pub revoked: bool,
    pub checked_at: DateTime<Utc>,
}

// =============================================================================
// SERDE HELPERS
// =============================================================================

mod base64_bytes {
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&base64::engine::general_purpose::STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        base64::engine::general_purpose::STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}
