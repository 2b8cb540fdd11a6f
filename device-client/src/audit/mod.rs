//! # Privacy-Preserving Audit Trail
//!
//! Builds ledger-bound audit entries for identity lifecycle and
//! verification events. Every metadata key whose normalized form contains a
//! sensitive fragment (see [`SENSITIVE_KEY_FRAGMENTS`]) is replaced by
//! `"<key>Hash"` holding the SHA-256 hex digest of the value.
//!
//! Hashing is unsalted, so the same attribute value always produces the
//! same digest and repeated events about it stay linkable in the ledger.
//!
//! Building an entry never touches the network; submission goes through the
//! sync coordinator.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::future::Future;
use uuid::Uuid;

use shared::{
    config::AuditConfig,
    constants::{
        ENTITY_TYPE_CREDENTIAL, ENTITY_TYPE_IDENTITY, ENTITY_TYPE_TEMPLATE, REDACTED_KEY_SUFFIX,
        SENSITIVE_KEY_FRAGMENTS,
    },
    digest::sha256_hex,
    types::{
        CachedBiometricTemplate, CachedCredential, OfflineVerificationResult,
        TransactionLogRequest, VerificationKind,
    },
};

tokio::task_local! {
    static CORRELATION_ID: String;
}

/// Run `future` with `correlation_id` as the ambient correlation id
pub async fn with_correlation_id<F: Future>(
    correlation_id: impl Into<String>,
    future: F,
) -> F::Output {
    CORRELATION_ID.scope(correlation_id.into(), future).await
}

/// Correlation id of the enclosing [`with_correlation_id`] scope
pub fn current_correlation_id() -> Option<String> {
    CORRELATION_ID.try_with(|id| id.clone()).ok()
}

/// Ledger transaction type
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum AuditEventType {
    BiometricVerified,
    BiometricVerificationFailed,
    CredentialVerified,
    CredentialVerificationFailed,
    BiometricEnrolled,
    BiometricUpdated,
    BiometricDeactivated,
    CredentialCached,
    IdentityRemoved,
}

impl AuditEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditEventType::BiometricVerified => "BiometricVerified",
            AuditEventType::BiometricVerificationFailed => "BiometricVerificationFailed",
            AuditEventType::CredentialVerified => "CredentialVerified",
            AuditEventType::CredentialVerificationFailed => "CredentialVerificationFailed",
            AuditEventType::BiometricEnrolled => "BiometricEnrolled",
            AuditEventType::BiometricUpdated => "BiometricUpdated",
            AuditEventType::BiometricDeactivated => "BiometricDeactivated",
            AuditEventType::CredentialCached => "CredentialCached",
            AuditEventType::IdentityRemoved => "IdentityRemoved",
        }
    }
}

/// A redacted, write-once audit record
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AuditTrailEntry {
    id: Uuid,
    event_type: AuditEventType,
    entity_type: String,
    entity_id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    description: Option<String>,
    metadata: BTreeMap<String, String>,
    timestamp: DateTime<Utc>,
    correlation_id: String,
}

impl AuditTrailEntry {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn event_type(&self) -> AuditEventType {
        self.event_type
    }

    pub fn entity_type(&self) -> &str {
        &self.entity_type
    }

    pub fn entity_id(&self) -> Uuid {
        self.entity_id
    }

    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    pub fn metadata(&self) -> &BTreeMap<String, String> {
        &self.metadata
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn correlation_id(&self) -> &str {
        &self.correlation_id
    }

    /// Wire form for the ledger
    pub fn to_log_request(&self) -> TransactionLogRequest {
        TransactionLogRequest {
            transaction_type: self.event_type.as_str().to_string(),
            entity_type: self.entity_type.clone(),
            entity_id: self.entity_id,
            description: self.description.clone(),
            metadata: self.metadata.clone(),
            timestamp: self.timestamp,
            correlation_id: self.correlation_id.clone(),
        }
    }
}

/// Whether a metadata key names personally identifying data
pub fn is_sensitive_key(key: &str) -> bool {
    let normalized: String = key
        .chars()
        .filter(|c| !matches!(c, '-' | '_' | ' ' | '.'))
        .flat_map(char::to_lowercase)
        .collect();
    SENSITIVE_KEY_FRAGMENTS
        .iter()
        .any(|fragment| normalized.contains(fragment))
}

/// Replace sensitive entries with `<key>Hash` digests; copy the rest
pub fn redact_metadata<I, K, V>(raw: I) -> BTreeMap<String, String>
where
    I: IntoIterator<Item = (K, V)>,
    K: Into<String>,
    V: AsRef<str>,
{
    raw.into_iter()
        .map(|(key, value)| {
            let key = key.into();
            if is_sensitive_key(&key) {
                (format!("{}{}", key, REDACTED_KEY_SUFFIX), sha256_hex(value.as_ref()))
            } else {
                (key, value.as_ref().to_string())
            }
        })
        .collect()
}

/// Builds redacted audit entries stamped with the device and source service
#[derive(Debug, Clone)]
pub struct AuditLogger {
    source_service: String,
    device_id: String,
}

impl AuditLogger {
    pub fn new(config: &AuditConfig, device_id: impl Into<String>) -> Self {
        Self {
            source_service: config.source_service.clone(),
            device_id: device_id.into(),
        }
    }

    /// Build a redacted entry.
    ///
    /// `correlation_id` falls back to the ambient id from
    /// [`with_correlation_id`], then to a fresh UUID.
    pub fn build_entry<I, K, V>(
        &self,
        event_type: AuditEventType,
        entity_type: &str,
        entity_id: Uuid,
        description: Option<&str>,
        raw_metadata: I,
        correlation_id: Option<&str>,
    ) -> AuditTrailEntry
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: AsRef<str>,
    {
        let mut metadata = redact_metadata(raw_metadata);
        metadata
            .entry("sourceService".into())
            .or_insert_with(|| self.source_service.clone());
        metadata
            .entry("deviceId".into())
            .or_insert_with(|| self.device_id.clone());

        let correlation_id = correlation_id
            .map(str::to_string)
            .or_else(current_correlation_id)
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        AuditTrailEntry {
            id: Uuid::new_v4(),
            event_type,
            entity_type: entity_type.to_string(),
            entity_id,
            description: description.map(str::to_string),
            metadata,
            timestamp: Utc::now(),
            correlation_id,
        }
    }

    /// Entry for a verification attempt; `claimed_identity` is used when nothing matched
    pub fn verification_entry(
        &self,
        result: &OfflineVerificationResult,
        claimed_identity: Option<Uuid>,
    ) -> AuditTrailEntry {
        let event_type = match (result.kind(), result.is_success()) {
            (VerificationKind::Biometric, true) => AuditEventType::BiometricVerified,
            (VerificationKind::Biometric, false) => AuditEventType::BiometricVerificationFailed,
            (VerificationKind::Credential, true) => AuditEventType::CredentialVerified,
            (VerificationKind::Credential, false) => AuditEventType::CredentialVerificationFailed,
        };

        let mut metadata = vec![
            ("transactionId".to_string(), result.transaction_id().to_string()),
            ("matchScore".to_string(), format!("{:.4}", result.match_score())),
            ("qualityScore".to_string(), format!("{:.4}", result.quality_score())),
            ("wasOffline".to_string(), result.was_offline().to_string()),
            ("syncPending".to_string(), result.sync_pending().to_string()),
        ];
        if let Some(modality) = result.modality() {
            metadata.push(("modality".into(), modality.to_string()));
        }
        if let Some(code) = result.error_code() {
            metadata.push(("errorCode".into(), code.to_string()));
        }
        if let Some(credential_id) = result.credential_id() {
            metadata.push(("credentialId".into(), credential_id.to_string()));
        }

        let description = if result.is_success() {
            "Offline verification succeeded"
        } else {
            "Offline verification did not succeed"
        };

        self.build_entry(
            event_type,
            ENTITY_TYPE_IDENTITY,
            result.identity_id().or(claimed_identity).unwrap_or_else(Uuid::nil),
            Some(description),
            metadata,
            None,
        )
    }

    /// Entry for a template lifecycle change
    pub fn template_entry(
        &self,
        event_type: AuditEventType,
        template: &CachedBiometricTemplate,
    ) -> AuditTrailEntry {
        let mut metadata = vec![
            ("identityId".to_string(), template.identity_id.to_string()),
            ("modality".to_string(), template.modality.to_string()),
            ("keyId".to_string(), template.encryption_key_id.clone()),
            ("qualityScore".to_string(), format!("{:.4}", template.quality_score)),
        ];
        if let Some(reason) = template.deactivation_reason {
            metadata.push(("reason".into(), reason.as_str().to_string()));
        }
        self.build_entry(event_type, ENTITY_TYPE_TEMPLATE, template.id, None, metadata, None)
    }

    /// Entry for a credential entering the cache
    pub fn credential_entry(&self, credential: &CachedCredential) -> AuditTrailEntry {
        let metadata = vec![
            ("identityId".to_string(), credential.identity_id.to_string()),
            ("credentialType".to_string(), credential.credential_type.clone()),
            ("issuer".to_string(), credential.issuer.clone()),
            ("offlineValidUntil".to_string(), credential.offline_valid_until.to_rfc3339()),
        ];
        self.build_entry(
            AuditEventType::CredentialCached,
            ENTITY_TYPE_CREDENTIAL,
            credential.id,
            None,
            metadata,
            None,
        )
    }

    /// Entry for an identity removed from the device
    pub fn identity_removed_entry(
        &self,
        identity_id: Uuid,
        templates_deactivated: usize,
        credentials_removed: usize,
    ) -> AuditTrailEntry {
        self.build_entry(
            AuditEventType::IdentityRemoved,
            ENTITY_TYPE_IDENTITY,
            identity_id,
            Some("Identity removed from device"),
            [
                ("templatesDeactivated", templates_deactivated.to_string()),
                ("credentialsRemoved", credentials_removed.to_string()),
            ],
            None,
        )
    }
}
