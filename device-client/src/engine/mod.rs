//! # Offline Verification Engine
//!
//! Answers "is this person who they claim to be" from local state alone:
//! - **Biometric**: 1:1 against a claimed identity or 1:N against everyone
//!   enrolled, using cached encrypted templates and an injected matcher.
//! - **Credential**: offline trust policy plus a local signature check,
//!   with an online status lookup only once the offline horizon has passed.
//!
//! Every call returns an [`OfflineVerificationResult`]; problems are encoded
//! as error codes on the result rather than returned as errors. Each result
//! is audited, and successful offline results are queued for reconciliation.
//! The engine never writes to the caches.

pub mod matcher;

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;
use zeroize::Zeroizing;

use shared::{
    config::{OfflineVerifierConfig, VerificationConfig},
    error::{IdentityError, IdentityResult},
    types::{
        BiometricModality, CachedCredential, OfflineVerificationResult, VerificationErrorCode,
        VerificationKind,
    },
};

use crate::audit::AuditLogger;
use crate::cache::{CredentialCache, TemplateCache, TemplateScope};
use crate::ledger::{ConnectivityProbe, CredentialStatusClient};
use crate::signature::CredentialSignatureVerifier;
use crate::sync::SyncCoordinator;

pub use matcher::{BiometricMatcher, FeatureVectorMatcher};

/// A live biometric capture
pub struct BiometricCapture {
    pub modality: BiometricModality,
    pub sample: Zeroizing<Vec<u8>>,
    pub quality_score: f64,
}

impl BiometricCapture {
    pub fn new(modality: BiometricModality, sample: Vec<u8>, quality_score: f64) -> Self {
        Self {
            modality,
            sample: Zeroizing::new(sample),
            quality_score,
        }
    }

    fn validate(&self) -> IdentityResult<()> {
        if !self.modality.is_matchable() {
            return Err(IdentityError::InvalidArgument(format!(
                "modality {} cannot be matched",
                self.modality
            )));
        }
        if self.sample.is_empty() {
            return Err(IdentityError::InvalidArgument("capture sample is empty".into()));
        }
        if !(0.0..=1.0).contains(&self.quality_score) {
            return Err(IdentityError::InvalidArgument(format!(
                "quality score {} outside [0, 1]",
                self.quality_score
            )));
        }
        Ok(())
    }
}

/// Who the capture is compared against
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BiometricClaim {
    /// 1:1 against a claimed identity
    Verify { identity_id: Uuid },
    /// 1:N against every enrolled identity
    Identify,
}

impl BiometricClaim {
    fn scope(&self) -> TemplateScope {
        match self {
            BiometricClaim::Verify { identity_id } => TemplateScope::Identity(*identity_id),
            BiometricClaim::Identify => TemplateScope::All,
        }
    }

    fn claimed_identity(&self) -> Option<Uuid> {
        match self {
            BiometricClaim::Verify { identity_id } => Some(*identity_id),
            BiometricClaim::Identify => None,
        }
    }
}

/// Collaborators the engine reads from and reports to
pub struct EngineServices {
    pub credentials: Arc<CredentialCache>,
    pub templates: Arc<TemplateCache>,
    pub matcher: Arc<dyn BiometricMatcher>,
    pub signatures: Arc<dyn CredentialSignatureVerifier>,
    pub status_client: Arc<dyn CredentialStatusClient>,
    pub probe: Arc<dyn ConnectivityProbe>,
    pub sync: Arc<SyncCoordinator>,
    pub audit: Arc<AuditLogger>,
}

/// Engine counters
#[derive(Debug, Clone, Default, Serialize)]
pub struct EngineStats {
    pub attempts: u64,
    pub successes: u64,
    pub no_matches: u64,
    pub failures: u64,
}

pub struct VerificationEngine {
    config: VerificationConfig,
    device_id: String,
    services: EngineServices,
    attempts: AtomicU64,
    successes: AtomicU64,
    no_matches: AtomicU64,
    failures: AtomicU64,
}

impl VerificationEngine {
    pub fn new(config: &OfflineVerifierConfig, services: EngineServices) -> Self {
        Self {
            config: config.verification.clone(),
            device_id: config.device_id.clone(),
            services,
            attempts: AtomicU64::new(0),
            successes: AtomicU64::new(0),
            no_matches: AtomicU64::new(0),
            failures: AtomicU64::new(0),
        }
    }

    /// Whether a capture of `modality` has anything to be compared against
    pub fn is_available(&self, modality: BiometricModality, now: DateTime<Utc>) -> bool {
        modality.is_matchable() && self.services.templates.has_eligible(modality, now)
    }

    pub fn stats(&self) -> EngineStats {
        EngineStats {
            attempts: self.attempts.load(Ordering::Relaxed),
            successes: self.successes.load(Ordering::Relaxed),
            no_matches: self.no_matches.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
        }
    }

    // =========================================================================
    // BIOMETRIC
    // =========================================================================

    pub async fn verify_biometric(
        &self,
        capture: &BiometricCapture,
        claim: BiometricClaim,
    ) -> OfflineVerificationResult {
        let now = Utc::now();
        let was_offline = !self.services.probe.is_online();

        let result = match self.match_capture(capture, claim, now, was_offline).await {
            Ok(result) => result,
            Err(e) => OfflineVerificationResult::failure(
                VerificationKind::Biometric,
                e.verification_code(),
                e.to_string(),
            )
            .with_modality(capture.modality)
            .with_quality(capture.quality_score),
        }
        .with_connectivity(was_offline)
        .with_device_id(self.device_id.as_str());

        self.record(&result, claim.claimed_identity()).await;
        result
    }

    async fn match_capture(
        &self,
        capture: &BiometricCapture,
        claim: BiometricClaim,
        now: DateTime<Utc>,
        was_offline: bool,
    ) -> IdentityResult<OfflineVerificationResult> {
        capture.validate()?;

        let credentials = &self.services.credentials;
        if self.config.require_valid_credential {
            if let BiometricClaim::Verify { identity_id } = claim {
                if !credentials.has_valid_offline(identity_id, now) {
                    return Err(IdentityError::not_found("offline-valid credential", identity_id));
                }
            }
        }

        let eligible = self
            .services
            .templates
            .list_eligible(claim.scope(), capture.modality, now);
        if eligible.is_empty() {
            return Err(IdentityError::NoTemplate(format!(
                "no eligible {} template",
                capture.modality
            )));
        }

        // One deadline for the whole attempt, however many templates are compared
        let deadline = Instant::now() + self.config.matcher_timeout();
        let mut best: Option<(f64, Uuid)> = None;
        let mut compared = 0usize;

        for template in eligible.iter().take(self.config.max_templates) {
            if self.config.require_valid_credential
                && claim == BiometricClaim::Identify
                && !credentials.has_valid_offline(template.identity_id, now)
            {
                continue;
            }

            let plaintext = match self.services.templates.decrypt_for_matching(template, now) {
                Ok(plaintext) => plaintext,
                Err(e) => {
                    warn!(template_id = %template.id, error = %e, "Skipping unreadable template");
                    continue;
                }
            };
            compared += 1;

            let score = self
                .score(&capture.sample, &plaintext, capture.modality, deadline)
                .await?;
            // Strict comparison keeps the most recently enrolled template on ties
            if best.map_or(true, |(best_score, _)| score > best_score) {
                best = Some((score, template.identity_id));
            }
        }

        let (score, identity_id) = best.ok_or_else(|| {
            IdentityError::NoTemplate(format!("no readable {} template", capture.modality))
        })?;

        debug!(
            compared,
            best_score = score,
            quality = capture.quality_score,
            "Biometric comparison finished"
        );

        if score >= self.config.min_match_score
            && capture.quality_score >= self.config.min_quality_score
        {
            Ok(OfflineVerificationResult::success(
                identity_id,
                capture.modality,
                score,
                capture.quality_score,
                was_offline,
            ))
        } else {
            Ok(OfflineVerificationResult::no_match(
                capture.modality,
                score,
                capture.quality_score,
            ))
        }
    }

    async fn score(
        &self,
        sample: &[u8],
        template: &[u8],
        modality: BiometricModality,
        deadline: Instant,
    ) -> IdentityResult<f64> {
        let matched = tokio::time::timeout_at(
            deadline,
            self.services.matcher.match_template(sample, template, modality),
        )
        .await
        .map_err(|_| IdentityError::MatcherTimeout {
            timeout_ms: self.config.matcher_timeout_ms,
        })?
        .map_err(|e| IdentityError::MatcherUnavailable(e.to_string()))?;

        if !(0.0..=1.0).contains(&matched) {
            return Err(IdentityError::MatcherUnavailable(format!(
                "matcher returned score {} outside [0, 1]",
                matched
            )));
        }
        Ok(matched)
    }

    // =========================================================================
    // CREDENTIAL
    // =========================================================================

    /// Check the cached credential of `credential_type` held by `identity_id`
    pub async fn verify_credential(
        &self,
        identity_id: Uuid,
        credential_type: &str,
    ) -> OfflineVerificationResult {
        let now = Utc::now();
        let was_offline = !self.services.probe.is_online();
        let credential = self.services.credentials.find(identity_id, credential_type);

        let checked = self
            .check_credential(identity_id, credential_type, credential.as_deref(), now, was_offline)
            .await;
        let result = match checked {
            Ok(result) => result,
            Err(e) => {
                let failure = OfflineVerificationResult::failure(
                    VerificationKind::Credential,
                    e.verification_code(),
                    e.to_string(),
                );
                match credential.as_ref() {
                    Some(credential) => failure.with_credential(credential.id),
                    None => failure,
                }
            }
        }
        .with_connectivity(was_offline)
        .with_device_id(self.device_id.as_str());

        self.record(&result, Some(identity_id)).await;
        result
    }

    async fn check_credential(
        &self,
        identity_id: Uuid,
        credential_type: &str,
        credential: Option<&CachedCredential>,
        now: DateTime<Utc>,
        was_offline: bool,
    ) -> IdentityResult<OfflineVerificationResult> {
        let credential = credential.ok_or_else(|| {
            IdentityError::not_found("credential", format!("{}/{}", identity_id, credential_type))
        })?;
        let credential_id = credential.id.to_string();

        if credential.is_expired(now) {
            return Err(IdentityError::Expired {
                credential_id,
                expired_at: credential
                    .expires_at
                    .map(|at| at.to_rfc3339())
                    .unwrap_or_default(),
            });
        }
        if credential.is_revoked {
            return Err(IdentityError::Revoked { credential_id });
        }

        if credential.is_valid_offline(now) {
            self.check_signature(credential)?;
            return Ok(OfflineVerificationResult::credential_success(
                identity_id,
                credential.id,
                was_offline,
            ));
        }

        // Past the offline horizon: the cache is refreshed by the sync coordinator only
        if let Err(e) = self
            .services
            .sync
            .enqueue_credential_refresh(credential.id, credential.sync_priority)
            .await
        {
            warn!(credential_id = %credential.id, error = %e, "Failed to queue credential refresh");
        }

        if was_offline {
            return Err(IdentityError::Stale { credential_id });
        }

        match self.services.status_client.credential_status(credential.id).await {
            Ok(status) if status.revoked => Err(IdentityError::Revoked { credential_id }),
            Ok(_) => {
                self.check_signature(credential)?;
                Ok(OfflineVerificationResult::credential_success(identity_id, credential.id, false))
            }
            Err(e) => {
                debug!(credential_id = %credential.id, error = %e, "Online status check failed");
                Err(IdentityError::Stale { credential_id })
            }
        }
    }

    fn check_signature(&self, credential: &CachedCredential) -> IdentityResult<()> {
        self.services
            .signatures
            .verify(credential)
            .map_err(|e| IdentityError::InvalidSignature(e.to_string()))
    }

    // =========================================================================
    // REPORTING
    // =========================================================================

    async fn record(&self, result: &OfflineVerificationResult, claimed_identity: Option<Uuid>) {
        self.attempts.fetch_add(1, Ordering::Relaxed);
        match (result.is_success(), result.error_code()) {
            (true, _) => self.successes.fetch_add(1, Ordering::Relaxed),
            (false, Some(VerificationErrorCode::NoMatch)) => {
                self.no_matches.fetch_add(1, Ordering::Relaxed)
            }
            (false, _) => self.failures.fetch_add(1, Ordering::Relaxed),
        };

        info!(
            transaction_id = %result.transaction_id(),
            kind = ?result.kind(),
            success = result.is_success(),
            error_code = ?result.error_code(),
            was_offline = result.was_offline(),
            "Verification finished"
        );

        let sync = &self.services.sync;
        if result.sync_pending() {
            if let Err(e) = sync.enqueue_pending_result(result).await {
                warn!(
                    transaction_id = %result.transaction_id(),
                    error = %e,
                    "Failed to queue result for sync"
                );
            }
        }

        let entry = self.services.audit.verification_entry(result, claimed_identity);
        if let Err(e) = sync.enqueue_audit_entry(entry).await {
            warn!(
                transaction_id = %result.transaction_id(),
                error = %e,
                "Failed to queue audit entry"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::TemplateEnrollment;
    use crate::storage::{put_json, Collection};
    use crate::sync::PendingKind;
    use crate::test_support::{signed_credential, TestKiosk};
    use chrono::Duration as ChronoDuration;
    use ed25519_dalek::SigningKey;
    use rand::rngs::OsRng;
    use shared::types::TemplateFormat;

    const TYPE: &str = "ResidentCard";

    fn capture(sample: &[u8], quality: f64) -> BiometricCapture {
        BiometricCapture::new(BiometricModality::Fingerprint, sample.to_vec(), quality)
    }

    fn queued_kinds(kiosk: &TestKiosk) -> Vec<&'static str> {
        kiosk
            .runtime
            .sync
            .queue()
            .snapshot()
            .iter()
            .map(|item| item.kind.label())
            .collect()
    }

    #[tokio::test]
    async fn test_offline_verify_success_is_queued() {
        let kiosk = TestKiosk::new().await;
        let identity = Uuid::new_v4();
        kiosk.store_template(identity, BiometricModality::Fingerprint, b"alice").await;

        let result = kiosk
            .runtime
            .engine
            .verify_biometric(
                &capture(b"alice", 0.9),
                BiometricClaim::Verify { identity_id: identity },
            )
            .await;

        assert!(result.is_success());
        assert_eq!(result.identity_id(), Some(identity));
        assert!(result.was_offline());
        assert!(result.sync_pending());
        assert_eq!(result.device_id(), Some("kiosk-test"));
        assert!(kiosk.runtime.sync.is_sync_pending(result.transaction_id()));
        assert_eq!(queued_kinds(&kiosk), vec!["audit_entry", "verification_result"]);
    }

    #[tokio::test]
    async fn test_online_success_is_not_pending() {
        let kiosk = TestKiosk::new().await;
        kiosk.probe.set_online(true);
        let identity = Uuid::new_v4();
        kiosk.store_template(identity, BiometricModality::Fingerprint, b"alice").await;

        let result = kiosk
            .runtime
            .engine
            .verify_biometric(
                &capture(b"alice", 0.9),
                BiometricClaim::Verify { identity_id: identity },
            )
            .await;
        assert!(result.is_success());
        assert!(!result.sync_pending());
        assert_eq!(queued_kinds(&kiosk), vec!["audit_entry"]);
    }

    #[tokio::test]
    async fn test_no_match_and_low_quality() {
        let kiosk = TestKiosk::new().await;
        let identity = Uuid::new_v4();
        kiosk.store_template(identity, BiometricModality::Fingerprint, b"alice").await;
        let engine = &kiosk.runtime.engine;
        let claim = BiometricClaim::Verify { identity_id: identity };

        let wrong = engine.verify_biometric(&capture(b"mallory", 0.9), claim).await;
        assert_eq!(wrong.error_code(), Some(VerificationErrorCode::NoMatch));
        assert!(!wrong.sync_pending());

        // Perfect score but the capture is below the quality floor
        let blurry = engine.verify_biometric(&capture(b"alice", 0.5), claim).await;
        assert_eq!(blurry.error_code(), Some(VerificationErrorCode::NoMatch));
        assert_eq!(blurry.match_score(), 1.0);

        assert_eq!(engine.stats().no_matches, 2);
    }

    #[tokio::test]
    async fn test_invalid_captures() {
        let kiosk = TestKiosk::new().await;
        let engine = &kiosk.runtime.engine;
        let claim = BiometricClaim::Identify;

        for bad in [
            capture(b"", 0.9),
            capture(b"alice", 1.5),
            capture(b"alice", f64::NAN),
            BiometricCapture::new(BiometricModality::Unknown, b"alice".to_vec(), 0.9),
        ] {
            let result = engine.verify_biometric(&bad, claim).await;
            assert_eq!(result.error_code(), Some(VerificationErrorCode::InvalidArgument));
        }
        assert_eq!(kiosk.matcher.calls(), 0);
    }

    #[tokio::test]
    async fn test_no_template() {
        let kiosk = TestKiosk::new().await;
        let identity = Uuid::new_v4();
        let template =
            kiosk.store_template(identity, BiometricModality::Fingerprint, b"alice").await;
        kiosk
            .runtime
            .templates
            .deactivate(template.id, shared::types::DeactivationReason::Revoked)
            .await
            .unwrap();

        let result = kiosk
            .runtime
            .engine
            .verify_biometric(
                &capture(b"alice", 0.9),
                BiometricClaim::Verify { identity_id: identity },
            )
            .await;
        assert_eq!(result.error_code(), Some(VerificationErrorCode::NoTemplate));
        assert!(!kiosk.runtime.engine.is_available(BiometricModality::Fingerprint, Utc::now()));
    }

    #[tokio::test]
    async fn test_identify_finds_enrolled_identity() {
        let kiosk = TestKiosk::new().await;
        let (alice, bob) = (Uuid::new_v4(), Uuid::new_v4());
        kiosk.store_template(alice, BiometricModality::Fingerprint, b"alice").await;
        kiosk.store_template(bob, BiometricModality::Fingerprint, b"bob").await;
        kiosk.store_template(bob, BiometricModality::Face, b"alice").await;

        assert!(kiosk.runtime.engine.is_available(BiometricModality::Fingerprint, Utc::now()));

        let result = kiosk
            .runtime
            .engine
            .verify_biometric(&capture(b"bob", 0.9), BiometricClaim::Identify)
            .await;
        assert_eq!(result.identity_id(), Some(bob));
        assert_eq!(kiosk.matcher.calls(), 2);
    }

    #[tokio::test]
    async fn test_tie_goes_to_most_recent_enrollment() {
        let kiosk = TestKiosk::new().await;
        let (older, newer) = (Uuid::new_v4(), Uuid::new_v4());
        let now = Utc::now();
        for (identity, bytes, enrolled) in [
            (older, b"t-old", now - ChronoDuration::days(2)),
            (newer, b"t-new", now - ChronoDuration::days(1)),
        ] {
            kiosk
                .runtime
                .templates
                .store(
                    TemplateEnrollment::new(
                        identity,
                        BiometricModality::Fingerprint,
                        TemplateFormat::IsoFingerMinutiae,
                        0.9,
                        bytes.to_vec(),
                    )
                    .enrolled_at(enrolled),
                )
                .await
                .unwrap();
            kiosk.matcher.set_score(bytes, 0.9);
        }

        let result = kiosk
            .runtime
            .engine
            .verify_biometric(&capture(b"probe", 0.9), BiometricClaim::Identify)
            .await;
        assert_eq!(result.identity_id(), Some(newer));
    }

    #[tokio::test]
    async fn test_max_templates_caps_comparisons() {
        let kiosk = TestKiosk::with_config(|config| config.verification.max_templates = 1).await;
        let (match_identity, other) = (Uuid::new_v4(), Uuid::new_v4());
        let now = Utc::now();
        for (identity, bytes, enrolled) in [
            (match_identity, b"alice".to_vec(), now - ChronoDuration::days(2)),
            (other, b"other".to_vec(), now - ChronoDuration::days(1)),
        ] {
            kiosk
                .runtime
                .templates
                .store(
                    TemplateEnrollment::new(
                        identity,
                        BiometricModality::Fingerprint,
                        TemplateFormat::IsoFingerMinutiae,
                        0.9,
                        bytes,
                    )
                    .enrolled_at(enrolled),
                )
                .await
                .unwrap();
        }

        let result = kiosk
            .runtime
            .engine
            .verify_biometric(&capture(b"alice", 0.9), BiometricClaim::Identify)
            .await;
        assert_eq!(result.error_code(), Some(VerificationErrorCode::NoMatch));
        assert_eq!(kiosk.matcher.calls(), 1);
    }

    #[tokio::test]
    async fn test_matcher_problems_are_unavailable() {
        let kiosk =
            TestKiosk::with_config(|config| config.verification.matcher_timeout_ms = 50).await;
        let identity = Uuid::new_v4();
        kiosk.store_template(identity, BiometricModality::Fingerprint, b"alice").await;
        let engine = &kiosk.runtime.engine;
        let claim = BiometricClaim::Verify { identity_id: identity };

        kiosk.matcher.set_delay(Some(std::time::Duration::from_millis(500)));
        let slow = engine.verify_biometric(&capture(b"alice", 0.9), claim).await;
        assert_eq!(slow.error_code(), Some(VerificationErrorCode::MatcherUnavailable));
        kiosk.matcher.set_delay(None);

        kiosk.matcher.set_failing(true);
        let failing = engine.verify_biometric(&capture(b"alice", 0.9), claim).await;
        assert_eq!(failing.error_code(), Some(VerificationErrorCode::MatcherUnavailable));
        kiosk.matcher.set_failing(false);

        for garbage in [1.5, f64::NAN, -0.1] {
            kiosk.matcher.set_score(b"alice", garbage);
            let result = engine.verify_biometric(&capture(b"alice", 0.9), claim).await;
            assert_eq!(result.error_code(), Some(VerificationErrorCode::MatcherUnavailable));
        }
    }

    #[tokio::test]
    async fn test_identify_deadline_covers_whole_attempt() {
        let kiosk =
            TestKiosk::with_config(|config| config.verification.matcher_timeout_ms = 100).await;
        for i in 0..10u8 {
            kiosk
                .store_template(Uuid::new_v4(), BiometricModality::Fingerprint, &[i; 4])
                .await;
        }
        // Each comparison fits the deadline on its own; ten of them do not
        kiosk.matcher.set_delay(Some(std::time::Duration::from_millis(40)));

        let started = Instant::now();
        let result = kiosk
            .runtime
            .engine
            .verify_biometric(&capture(b"nobody", 0.9), BiometricClaim::Identify)
            .await;

        assert_eq!(result.error_code(), Some(VerificationErrorCode::MatcherUnavailable));
        assert!(started.elapsed() < std::time::Duration::from_millis(300));
        assert!(kiosk.matcher.calls() < 10);
    }

    #[tokio::test]
    async fn test_tampered_template_is_skipped() {
        let kiosk = TestKiosk::new().await;
        let identity = Uuid::new_v4();
        let template =
            kiosk.store_template(identity, BiometricModality::Fingerprint, b"alice").await;

        let mut tampered = (*template).clone();
        tampered.encrypted_template[0] ^= 0xff;
        put_json(kiosk.store.as_ref(), Collection::Templates, &tampered.id.to_string(), &tampered)
            .await
            .unwrap();

        let kiosk = kiosk.reopen().await;
        let result = kiosk
            .runtime
            .engine
            .verify_biometric(
                &capture(b"alice", 0.9),
                BiometricClaim::Verify { identity_id: identity },
            )
            .await;
        assert_eq!(result.error_code(), Some(VerificationErrorCode::NoTemplate));
        assert_eq!(kiosk.matcher.calls(), 0);
    }

    #[tokio::test]
    async fn test_require_valid_credential() {
        let kiosk =
            TestKiosk::with_config(|config| config.verification.require_valid_credential = true)
                .await;
        let identity = Uuid::new_v4();
        kiosk.store_template(identity, BiometricModality::Fingerprint, b"alice").await;
        let engine = &kiosk.runtime.engine;
        let claim = BiometricClaim::Verify { identity_id: identity };

        let without = engine.verify_biometric(&capture(b"alice", 0.9), claim).await;
        assert_eq!(without.error_code(), Some(VerificationErrorCode::NotFound));

        let identified = engine
            .verify_biometric(&capture(b"alice", 0.9), BiometricClaim::Identify)
            .await;
        assert!(!identified.is_success());

        kiosk
            .runtime
            .credentials
            .upsert(signed_credential(&kiosk.issuer_key, identity, TYPE, ChronoDuration::hours(12)))
            .await
            .unwrap();
        assert!(engine.verify_biometric(&capture(b"alice", 0.9), claim).await.is_success());
        assert!(engine
            .verify_biometric(&capture(b"alice", 0.9), BiometricClaim::Identify)
            .await
            .is_success());
    }

    #[tokio::test]
    async fn test_failed_attempts_are_audited_with_claimed_identity() {
        let kiosk = TestKiosk::new().await;
        let claimed = Uuid::new_v4();
        kiosk
            .runtime
            .engine
            .verify_biometric(
                &capture(b"alice", 0.9),
                BiometricClaim::Verify { identity_id: claimed },
            )
            .await;

        let items = kiosk.runtime.sync.queue().snapshot();
        assert_eq!(items.len(), 1);
        match &items[0].kind {
            PendingKind::AuditEntry { entry } => assert_eq!(entry.entity_id(), claimed),
            other => panic!("unexpected item {:?}", other),
        }
    }

    // ---------------------------------------------------------------------
    // Credentials
    // ---------------------------------------------------------------------

    #[tokio::test]
    async fn test_credential_valid_offline() {
        let kiosk = TestKiosk::new().await;
        let identity = Uuid::new_v4();
        let credential = signed_credential(
            &kiosk.issuer_key,
            identity,
            TYPE,
            ChronoDuration::hours(12),
        );
        let credential_id = credential.id;
        kiosk.runtime.credentials.upsert(credential).await.unwrap();

        let result = kiosk.runtime.engine.verify_credential(identity, TYPE).await;
        assert!(result.is_success());
        assert_eq!(result.credential_id(), Some(credential_id));
        assert_eq!(result.match_score(), 1.0);
        assert!(result.sync_pending());
    }

    #[tokio::test]
    async fn test_credential_not_found() {
        let kiosk = TestKiosk::new().await;
        let result = kiosk.runtime.engine.verify_credential(Uuid::new_v4(), TYPE).await;
        assert_eq!(result.error_code(), Some(VerificationErrorCode::NotFound));
    }

    #[tokio::test]
    async fn test_credential_bad_signature() {
        let kiosk = TestKiosk::new().await;
        let identity = Uuid::new_v4();
        let forger = SigningKey::generate(&mut OsRng);
        let credential = signed_credential(&forger, identity, TYPE, ChronoDuration::hours(12));
        kiosk.runtime.credentials.upsert(credential).await.unwrap();

        let result = kiosk.runtime.engine.verify_credential(identity, TYPE).await;
        assert_eq!(result.error_code(), Some(VerificationErrorCode::InvalidSignature));
        assert!(result.credential_id().is_some());
    }

    #[tokio::test]
    async fn test_credential_expired_before_revoked() {
        let kiosk = TestKiosk::new().await;
        let identity = Uuid::new_v4();
        let now = Utc::now();
        let mut credential = signed_credential(
            &kiosk.issuer_key,
            identity,
            TYPE,
            ChronoDuration::hours(12),
        );
        credential.expires_at = Some(now - ChronoDuration::hours(1));
        credential.offline_valid_until = now - ChronoDuration::hours(2);
        credential.is_revoked = true;
        kiosk.runtime.credentials.upsert(credential).await.unwrap();

        let result = kiosk.runtime.engine.verify_credential(identity, TYPE).await;
        assert_eq!(result.error_code(), Some(VerificationErrorCode::Expired));
    }

    #[tokio::test]
    async fn test_credential_revoked() {
        let kiosk = TestKiosk::new().await;
        let identity = Uuid::new_v4();
        let mut credential = signed_credential(
            &kiosk.issuer_key,
            identity,
            TYPE,
            ChronoDuration::hours(12),
        );
        credential.is_revoked = true;
        kiosk.runtime.credentials.upsert(credential).await.unwrap();

        let result = kiosk.runtime.engine.verify_credential(identity, TYPE).await;
        assert_eq!(result.error_code(), Some(VerificationErrorCode::Revoked));
    }

    #[tokio::test]
    async fn test_stale_credential_offline() {
        let kiosk = TestKiosk::new().await;
        let identity = Uuid::new_v4();
        let credential = signed_credential(
            &kiosk.issuer_key,
            identity,
            TYPE,
            ChronoDuration::hours(-1),
        );
        let credential_id = credential.id;
        kiosk.runtime.credentials.upsert(credential).await.unwrap();

        let result = kiosk.runtime.engine.verify_credential(identity, TYPE).await;
        assert_eq!(result.error_code(), Some(VerificationErrorCode::Stale));
        assert!(kiosk.runtime.sync.queue().has_outstanding_refresh(credential_id));
        assert_eq!(kiosk.status.calls(), 0);
    }

    #[tokio::test]
    async fn test_stale_credential_online() {
        let kiosk = TestKiosk::new().await;
        kiosk.probe.set_online(true);
        let identity = Uuid::new_v4();
        let credential = signed_credential(
            &kiosk.issuer_key,
            identity,
            TYPE,
            ChronoDuration::hours(-1),
        );
        let credential_id = credential.id;
        kiosk.runtime.credentials.upsert(credential).await.unwrap();
        let engine = &kiosk.runtime.engine;

        let result = engine.verify_credential(identity, TYPE).await;
        assert!(result.is_success());
        assert!(!result.was_offline());
        assert!(!result.sync_pending());
        // The engine never writes to the cache
        assert!(kiosk.runtime.credentials.get(credential_id).unwrap().last_online_check.is_none());
        assert!(kiosk.runtime.sync.queue().has_outstanding_refresh(credential_id));

        kiosk.status.revoke(credential_id);
        let revoked = engine.verify_credential(identity, TYPE).await;
        assert_eq!(revoked.error_code(), Some(VerificationErrorCode::Revoked));
        assert!(!kiosk.runtime.credentials.get(credential_id).unwrap().is_revoked);

        kiosk.status.set_failing(true);
        let unreachable = engine.verify_credential(identity, TYPE).await;
        assert_eq!(unreachable.error_code(), Some(VerificationErrorCode::Stale));
    }
}
