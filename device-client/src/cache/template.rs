//! # Biometric Template Cache
//!
//! Encrypted enrollment records and their matching-eligibility policy.
//!
//! Plaintext template bytes only exist inside [`Zeroizing`] buffers: the
//! enrollment handed to [`TemplateCache::store`] and the output of
//! [`TemplateCache::decrypt_for_matching`]. Rows are never hard-deleted;
//! deactivation keeps the enrollment history.
//!
//! Key rotation is lazy. A row sealed under a key that is no longer current
//! is re-encrypted the next time it is written, or in bulk through
//! [`TemplateCache::reencrypt_stale`].

use chrono::{DateTime, Duration, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;
use zeroize::Zeroizing;

use shared::{
    digest::sha256_hex,
    error::{IdentityError, IdentityResult},
    types::{BiometricModality, CachedBiometricTemplate, DeactivationReason, TemplateFormat},
};

use super::locks::IdentityLocks;
use crate::keyring::TemplateCipher;
use crate::storage::{load_all, put_json, Collection, RecordStore};

/// A plaintext template about to be sealed
pub struct TemplateEnrollment {
    pub identity_id: Uuid,
    pub modality: BiometricModality,
    pub format: TemplateFormat,
    pub quality_score: f64,
    pub template: Zeroizing<Vec<u8>>,
    pub enrolled_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl TemplateEnrollment {
    pub fn new(
        identity_id: Uuid,
        modality: BiometricModality,
        format: TemplateFormat,
        quality_score: f64,
        template: Vec<u8>,
    ) -> Self {
        Self {
            identity_id,
            modality,
            format,
            quality_score,
            template: Zeroizing::new(template),
            enrolled_at: None,
            expires_at: None,
        }
    }

    pub fn enrolled_at(mut self, at: DateTime<Utc>) -> Self {
        self.enrolled_at = Some(at);
        self
    }

    pub fn expires_at(mut self, at: DateTime<Utc>) -> Self {
        self.expires_at = Some(at);
        self
    }

    fn validate(&self) -> IdentityResult<()> {
        if !self.modality.is_matchable() {
            return Err(IdentityError::InvalidArgument(
                "cannot enroll a template of unknown modality".into(),
            ));
        }
        if self.template.is_empty() {
            return Err(IdentityError::InvalidArgument("template bytes are empty".into()));
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

/// Which identities a lookup covers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TemplateScope {
    /// 1:1 verification against a claimed identity
    Identity(Uuid),
    /// 1:N identification against everyone enrolled
    All,
}

impl TemplateScope {
    fn includes(&self, identity_id: Uuid) -> bool {
        match self {
            TemplateScope::Identity(id) => *id == identity_id,
            TemplateScope::All => true,
        }
    }
}

/// Point-in-time snapshot of candidate templates, most recently enrolled first.
///
/// [`iter`](Self::iter) filters lazily through the matching policy and may be
/// called any number of times.
pub struct EligibleTemplates {
    snapshot: Vec<Arc<CachedBiometricTemplate>>,
    now: DateTime<Utc>,
}

impl EligibleTemplates {
    pub fn iter(&self) -> impl Iterator<Item = &Arc<CachedBiometricTemplate>> + '_ {
        self.snapshot
            .iter()
            .filter(move |template| template.is_valid_for_matching(self.now))
    }

    pub fn is_empty(&self) -> bool {
        self.iter().next().is_none()
    }

    pub fn count(&self) -> usize {
        self.iter().count()
    }
}

/// Cache statistics
#[derive(Debug, Clone, Serialize)]
pub struct TemplateCacheStats {
    pub total: usize,
    pub active: usize,
    pub eligible: usize,
    pub stale_key: usize,
    pub stored: u64,
    pub deactivated: u64,
    pub reencrypted: u64,
}

/// Persisted, encrypted template cache
pub struct TemplateCache {
    store: Arc<dyn RecordStore>,
    cipher: Arc<dyn TemplateCipher>,
    locks: Arc<IdentityLocks>,
    templates: RwLock<HashMap<Uuid, Arc<CachedBiometricTemplate>>>,
    default_validity: Option<Duration>,
    stored: AtomicU64,
    deactivated: AtomicU64,
    reencrypted: AtomicU64,
}

impl TemplateCache {
    /// Load every persisted template.
    ///
    /// `default_validity` sets `expires_at` on enrollments that do not carry one.
    pub async fn open(
        store: Arc<dyn RecordStore>,
        cipher: Arc<dyn TemplateCipher>,
        locks: Arc<IdentityLocks>,
        default_validity: Option<Duration>,
    ) -> IdentityResult<Self> {
        let rows: Vec<CachedBiometricTemplate> =
            load_all(store.as_ref(), Collection::Templates).await?;
        let templates: HashMap<_, _> =
            rows.into_iter().map(|row| (row.id, Arc::new(row))).collect();

        let current_key = cipher.current_key_id();
        let unreadable = templates
            .values()
            .filter(|t| !cipher.has_key(&t.encryption_key_id))
            .count();
        if unreadable > 0 {
            warn!(unreadable, "Templates reference keys missing from the key ring");
        }

        info!(templates = templates.len(), current_key = %current_key, "Template cache loaded");

        Ok(Self {
            store,
            cipher,
            locks,
            templates: RwLock::new(templates),
            default_validity,
            stored: AtomicU64::new(0),
            deactivated: AtomicU64::new(0),
            reencrypted: AtomicU64::new(0),
        })
    }

    // =========================================================================
    // READS
    // =========================================================================

    pub fn get(&self, template_id: Uuid) -> IdentityResult<Arc<CachedBiometricTemplate>> {
        self.templates
            .read()
            .get(&template_id)
            .cloned()
            .ok_or_else(|| IdentityError::not_found("template", template_id))
    }

    /// Candidates for `modality` within `scope` as of `now`
    pub fn list_eligible(
        &self,
        scope: TemplateScope,
        modality: BiometricModality,
        now: DateTime<Utc>,
    ) -> EligibleTemplates {
        let mut snapshot: Vec<_> = self
            .templates
            .read()
            .values()
            .filter(|t| t.modality == modality && scope.includes(t.identity_id))
            .cloned()
            .collect();
        snapshot.sort_by(|a, b| b.enrolled_at.cmp(&a.enrolled_at).then_with(|| a.id.cmp(&b.id)));
        EligibleTemplates { snapshot, now }
    }

    /// Whether anything could be matched for `modality`
    pub fn has_eligible(&self, modality: BiometricModality, now: DateTime<Utc>) -> bool {
        self.templates
            .read()
            .values()
            .any(|t| t.modality == modality && t.is_valid_for_matching(now))
    }

    /// Every row for an identity, including deactivated ones, newest first
    pub fn history(&self, identity_id: Uuid) -> Vec<Arc<CachedBiometricTemplate>> {
        let mut rows: Vec<_> = self
            .templates
            .read()
            .values()
            .filter(|t| t.identity_id == identity_id)
            .cloned()
            .collect();
        rows.sort_by(|a, b| b.enrolled_at.cmp(&a.enrolled_at));
        rows
    }

    /// Decrypt an eligible template for the matcher
    pub fn decrypt_for_matching(
        &self,
        template: &CachedBiometricTemplate,
        now: DateTime<Utc>,
    ) -> IdentityResult<Zeroizing<Vec<u8>>> {
        if !template.is_valid_for_matching(now) {
            return Err(IdentityError::InvalidArgument(format!(
                "template {} is not eligible for matching",
                template.id
            )));
        }
        if !template.verify_integrity() {
            return Err(IdentityError::IntegrityError(format!("template {}", template.id)));
        }
        self.cipher.decrypt(
            &template.encrypted_template,
            &template.encryption_iv,
            &template.encryption_key_id,
        )
    }

    /// Rows sealed under a key other than the current one
    pub fn stale_key_count(&self) -> usize {
        let current = self.cipher.current_key_id();
        self.templates
            .read()
            .values()
            .filter(|t| t.encryption_key_id != current)
            .count()
    }

    pub fn len(&self) -> usize {
        self.templates.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self, now: DateTime<Utc>) -> TemplateCacheStats {
        let current = self.cipher.current_key_id();
        let templates = self.templates.read();
        TemplateCacheStats {
            total: templates.len(),
            active: templates.values().filter(|t| t.is_active).count(),
            eligible: templates.values().filter(|t| t.is_valid_for_matching(now)).count(),
            stale_key: templates.values().filter(|t| t.encryption_key_id != current).count(),
            stored: self.stored.load(Ordering::Relaxed),
            deactivated: self.deactivated.load(Ordering::Relaxed),
            reencrypted: self.reencrypted.load(Ordering::Relaxed),
        }
    }

    // =========================================================================
    // WRITES
    // =========================================================================

    /// Seal and persist a new enrollment under the current key
    pub async fn store(
        &self,
        enrollment: TemplateEnrollment,
    ) -> IdentityResult<Arc<CachedBiometricTemplate>> {
        enrollment.validate()?;
        let _guard = self.locks.lock(enrollment.identity_id).await;
        self.store_locked(enrollment).await
    }

    /// Store a new enrollment and supersede the identity's active rows of the same modality
    pub async fn re_enroll(
        &self,
        enrollment: TemplateEnrollment,
    ) -> IdentityResult<(Arc<CachedBiometricTemplate>, Vec<Uuid>)> {
        enrollment.validate()?;
        let identity_id = enrollment.identity_id;
        let modality = enrollment.modality;
        let _guard = self.locks.lock(identity_id).await;

        let previous: Vec<Uuid> = self
            .templates
            .read()
            .values()
            .filter(|t| t.identity_id == identity_id && t.modality == modality && t.is_active)
            .map(|t| t.id)
            .collect();

        let stored = self.store_locked(enrollment).await?;
        let now = Utc::now();
        for template_id in &previous {
            self.deactivate_locked(*template_id, DeactivationReason::Superseded, now)
                .await?;
        }

        Ok((stored, previous))
    }

    /// Soft-delete one template; deactivating twice is a no-op
    pub async fn deactivate(
        &self,
        template_id: Uuid,
        reason: DeactivationReason,
    ) -> IdentityResult<Arc<CachedBiometricTemplate>> {
        let identity_id = self.get(template_id)?.identity_id;
        let _guard = self.locks.lock(identity_id).await;
        self.deactivate_locked(template_id, reason, Utc::now()).await
    }

    /// Soft-delete every active template of an identity
    pub async fn deactivate_identity(
        &self,
        identity_id: Uuid,
        reason: DeactivationReason,
    ) -> IdentityResult<Vec<Uuid>> {
        let _guard = self.locks.lock(identity_id).await;
        let active: Vec<Uuid> = self
            .templates
            .read()
            .values()
            .filter(|t| t.identity_id == identity_id && t.is_active)
            .map(|t| t.id)
            .collect();

        let now = Utc::now();
        for template_id in &active {
            self.deactivate_locked(*template_id, reason, now).await?;
        }
        Ok(active)
    }

    /// Re-encrypt up to `limit` rows sealed under older keys still held by the ring
    pub async fn reencrypt_stale(&self, limit: usize) -> IdentityResult<usize> {
        let current = self.cipher.current_key_id();
        let stale: Vec<(Uuid, Uuid)> = self
            .templates
            .read()
            .values()
            .filter(|t| t.encryption_key_id != current && self.cipher.has_key(&t.encryption_key_id))
            .take(limit)
            .map(|t| (t.id, t.identity_id))
            .collect();

        let mut resealed = 0;
        for (template_id, identity_id) in stale {
            let _guard = self.locks.lock(identity_id).await;
            let mut row = (*self.get(template_id)?).clone();
            match self.reseal_if_stale(&mut row) {
                Ok(true) => {
                    self.persist(row).await?;
                    resealed += 1;
                }
                Ok(false) => {}
                Err(e) => {
                    warn!(template_id = %template_id, error = %e, "Template re-encryption failed")
                }
            }
        }

        if resealed > 0 {
            info!(resealed, current_key = %current, "Templates re-encrypted under current key");
        }
        Ok(resealed)
    }

    async fn store_locked(
        &self,
        enrollment: TemplateEnrollment,
    ) -> IdentityResult<Arc<CachedBiometricTemplate>> {
        let key_id = self.cipher.current_key_id();
        let (ciphertext, iv) = self.cipher.encrypt(&enrollment.template, &key_id)?;

        let now = Utc::now();
        let enrolled_at = enrollment.enrolled_at.unwrap_or(now);
        let expires_at = enrollment
            .expires_at
            .or_else(|| self.default_validity.map(|validity| enrolled_at + validity));

        let row = CachedBiometricTemplate {
            id: Uuid::new_v4(),
            identity_id: enrollment.identity_id,
            modality: enrollment.modality,
            template_hash: sha256_hex(&ciphertext),
            encrypted_template: ciphertext,
            format: enrollment.format,
            quality_score: enrollment.quality_score,
            cached_at: now,
            enrolled_at,
            encryption_key_id: key_id,
            encryption_iv: iv,
            is_active: true,
            expires_at,
            deactivated_at: None,
            deactivation_reason: None,
        };

        let row = self.persist(row).await?;
        self.stored.fetch_add(1, Ordering::Relaxed);

        info!(
            template_id = %row.id,
            identity_id = %row.identity_id,
            modality = %row.modality,
            key_id = %row.encryption_key_id,
            "Biometric template stored"
        );
        Ok(row)
    }

    async fn deactivate_locked(
        &self,
        template_id: Uuid,
        reason: DeactivationReason,
        at: DateTime<Utc>,
    ) -> IdentityResult<Arc<CachedBiometricTemplate>> {
        let current = self.get(template_id)?;
        if !current.is_active {
            return Ok(current);
        }

        let mut row = (*current).clone();
        row.mark_deactivated(reason, at);
        if let Err(e) = self.reseal_if_stale(&mut row) {
            warn!(
                template_id = %template_id,
                error = %e,
                "Keeping stale key on deactivated template"
            );
        }

        let row = self.persist(row).await?;
        self.deactivated.fetch_add(1, Ordering::Relaxed);
        info!(
            template_id = %template_id,
            identity_id = %row.identity_id,
            reason = reason.as_str(),
            "Biometric template deactivated"
        );
        Ok(row)
    }

    /// Move a row to the current key; returns whether anything changed
    fn reseal_if_stale(&self, row: &mut CachedBiometricTemplate) -> IdentityResult<bool> {
        let current = self.cipher.current_key_id();
        if row.encryption_key_id == current {
            return Ok(false);
        }
        if !row.verify_integrity() {
            return Err(IdentityError::IntegrityError(format!("template {}", row.id)));
        }

        let plaintext = self
            .cipher
            .decrypt(&row.encrypted_template, &row.encryption_iv, &row.encryption_key_id)?;
        let (ciphertext, iv) = self.cipher.encrypt(&plaintext, &current)?;

        debug!(
            template_id = %row.id,
            from = %row.encryption_key_id,
            to = %current,
            "Template re-encrypted"
        );
        row.template_hash = sha256_hex(&ciphertext);
        row.encrypted_template = ciphertext;
        row.encryption_iv = iv;
        row.encryption_key_id = current;
        self.reencrypted.fetch_add(1, Ordering::Relaxed);
        Ok(true)
    }

    async fn persist(
        &self,
        row: CachedBiometricTemplate,
    ) -> IdentityResult<Arc<CachedBiometricTemplate>> {
        put_json(self.store.as_ref(), Collection::Templates, &row.id.to_string(), &row).await?;
        let row = Arc::new(row);
        self.templates.write().insert(row.id, row.clone());
        Ok(row)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keyring::{random_key, KeyRing};
    use crate::storage::MemoryStore;

    struct Fixture {
        cache: TemplateCache,
        ring: Arc<KeyRing>,
        store: Arc<MemoryStore>,
    }

    async fn create_cache(default_validity: Option<Duration>) -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let ring = Arc::new(KeyRing::generate("k1"));
        let cache = TemplateCache::open(
            store.clone(),
            ring.clone(),
            Arc::new(IdentityLocks::new()),
            default_validity,
        )
        .await
        .unwrap();
        Fixture { cache, ring, store }
    }

    fn enrollment(
        identity_id: Uuid,
        modality: BiometricModality,
        bytes: &[u8],
    ) -> TemplateEnrollment {
        TemplateEnrollment::new(
            identity_id,
            modality,
            TemplateFormat::FeatureVector,
            0.9,
            bytes.to_vec(),
        )
    }

    #[tokio::test]
    async fn test_store_encrypts_and_tags_key() {
        let f = create_cache(None).await;
        let row = f
            .cache
            .store(enrollment(Uuid::new_v4(), BiometricModality::Face, b"face-features"))
            .await
            .unwrap();

        assert_eq!(row.encryption_key_id, "k1");
        assert_eq!(row.encryption_iv.len(), crate::keyring::IV_LEN);
        assert!(!row
            .encrypted_template
            .windows(b"face-features".len())
            .any(|w| w == b"face-features"));
        assert!(row.verify_integrity());
        assert_eq!(f.store.len(Collection::Templates), 1);

        let plaintext = f.cache.decrypt_for_matching(&row, Utc::now()).unwrap();
        assert_eq!(plaintext.as_slice(), b"face-features");
    }

    #[tokio::test]
    async fn test_store_rejects_invalid_enrollments() {
        let f = create_cache(None).await;
        let identity = Uuid::new_v4();

        assert!(f
            .cache
            .store(enrollment(identity, BiometricModality::Unknown, b"x"))
            .await
            .is_err());
        assert!(f.cache.store(enrollment(identity, BiometricModality::Face, b"")).await.is_err());

        let mut bad_quality = enrollment(identity, BiometricModality::Face, b"x");
        bad_quality.quality_score = 1.5;
        assert!(f.cache.store(bad_quality).await.is_err());
        assert!(f.cache.is_empty());
    }

    #[tokio::test]
    async fn test_default_validity_sets_expiry() {
        let f = create_cache(Some(Duration::days(30))).await;
        let enrolled_at = Utc::now();
        let row = f
            .cache
            .store(
                enrollment(Uuid::new_v4(), BiometricModality::Iris, b"iris")
                    .enrolled_at(enrolled_at),
            )
            .await
            .unwrap();
        assert_eq!(row.expires_at, Some(enrolled_at + Duration::days(30)));
    }

    #[tokio::test]
    async fn test_list_eligible_filters_and_orders() {
        let f = create_cache(None).await;
        let alice = Uuid::new_v4();
        let bob = Uuid::new_v4();
        let now = Utc::now();

        let older = f
            .cache
            .store(
                enrollment(alice, BiometricModality::Face, b"a1")
                    .enrolled_at(now - Duration::days(2)),
            )
            .await
            .unwrap();
        let newer = f
            .cache
            .store(
                enrollment(alice, BiometricModality::Face, b"a2")
                    .enrolled_at(now - Duration::days(1)),
            )
            .await
            .unwrap();
        f.cache
            .store(enrollment(alice, BiometricModality::Fingerprint, b"a3"))
            .await
            .unwrap();
        let expired = f
            .cache
            .store(
                enrollment(bob, BiometricModality::Face, b"b1")
                    .expires_at(now - Duration::seconds(1)),
            )
            .await
            .unwrap();
        f.cache.store(enrollment(bob, BiometricModality::Face, b"b2")).await.unwrap();

        let alice_faces = f
            .cache
            .list_eligible(TemplateScope::Identity(alice), BiometricModality::Face, now);
        let ids: Vec<Uuid> = alice_faces.iter().map(|t| t.id).collect();
        assert_eq!(ids, vec![newer.id, older.id]);
        // Restartable
        assert_eq!(alice_faces.iter().count(), 2);

        let everyone = f.cache.list_eligible(TemplateScope::All, BiometricModality::Face, now);
        assert_eq!(everyone.count(), 3);
        assert!(everyone.iter().all(|t| t.id != expired.id));
    }

    #[tokio::test]
    async fn test_snapshot_rechecks_eligibility_lazily() {
        let f = create_cache(None).await;
        let identity = Uuid::new_v4();
        let now = Utc::now();
        f.cache
            .store(
                enrollment(identity, BiometricModality::Palm, b"p")
                    .expires_at(now + Duration::minutes(5)),
            )
            .await
            .unwrap();

        let before = f
            .cache
            .list_eligible(TemplateScope::Identity(identity), BiometricModality::Palm, now);
        assert_eq!(before.count(), 1);

        let later = f.cache.list_eligible(
            TemplateScope::Identity(identity),
            BiometricModality::Palm,
            now + Duration::minutes(5),
        );
        assert!(later.is_empty());
    }

    #[tokio::test]
    async fn test_deactivate_is_soft_and_idempotent() {
        let f = create_cache(None).await;
        let identity = Uuid::new_v4();
        let row = f.cache.store(enrollment(identity, BiometricModality::Vein, b"v")).await.unwrap();

        let deactivated = f.cache.deactivate(row.id, DeactivationReason::Revoked).await.unwrap();
        assert!(!deactivated.is_active);
        assert_eq!(deactivated.deactivation_reason, Some(DeactivationReason::Revoked));

        let again = f.cache.deactivate(row.id, DeactivationReason::Superseded).await.unwrap();
        assert_eq!(again.deactivation_reason, Some(DeactivationReason::Revoked));

        assert_eq!(f.cache.history(identity).len(), 1);
        assert!(f
            .cache
            .list_eligible(TemplateScope::Identity(identity), BiometricModality::Vein, Utc::now())
            .is_empty());
        assert!(f.cache.decrypt_for_matching(&deactivated, Utc::now()).is_err());
        assert!(matches!(
            f.cache.deactivate(Uuid::new_v4(), DeactivationReason::Revoked).await,
            Err(IdentityError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_re_enroll_supersedes_same_modality() {
        let f = create_cache(None).await;
        let identity = Uuid::new_v4();
        let face =
            f.cache.store(enrollment(identity, BiometricModality::Face, b"f1")).await.unwrap();
        let finger = f
            .cache
            .store(enrollment(identity, BiometricModality::Fingerprint, b"x1"))
            .await
            .unwrap();

        let (replacement, superseded) = f
            .cache
            .re_enroll(enrollment(identity, BiometricModality::Face, b"f2"))
            .await
            .unwrap();

        assert_eq!(superseded, vec![face.id]);
        assert!(replacement.is_active);
        assert_eq!(
            f.cache.get(face.id).unwrap().deactivation_reason,
            Some(DeactivationReason::Superseded)
        );
        assert!(f.cache.get(finger.id).unwrap().is_active);
        assert_eq!(f.cache.history(identity).len(), 3);
    }

    #[tokio::test]
    async fn test_deactivate_identity() {
        let f = create_cache(None).await;
        let identity = Uuid::new_v4();
        f.cache.store(enrollment(identity, BiometricModality::Face, b"f")).await.unwrap();
        f.cache.store(enrollment(identity, BiometricModality::Iris, b"i")).await.unwrap();

        let removed = f
            .cache
            .deactivate_identity(identity, DeactivationReason::IdentityDeleted)
            .await
            .unwrap();
        assert_eq!(removed.len(), 2);
        assert!(!f.cache.has_eligible(BiometricModality::Face, Utc::now()));
        assert_eq!(f.cache.stats(Utc::now()).deactivated, 2);
    }

    #[tokio::test]
    async fn test_rotation_reencrypts_lazily() {
        let f = create_cache(None).await;
        let identity = Uuid::new_v4();
        let a = f.cache.store(enrollment(identity, BiometricModality::Face, b"aaa")).await.unwrap();
        let b = f
            .cache
            .store(enrollment(Uuid::new_v4(), BiometricModality::Face, b"bbb"))
            .await
            .unwrap();

        f.ring.rotate("k2", random_key()).unwrap();
        assert_eq!(f.cache.stale_key_count(), 2);

        // Old rows stay readable until resealed
        let plaintext = f.cache.decrypt_for_matching(&a, Utc::now()).unwrap();
        assert_eq!(plaintext.as_slice(), b"aaa");

        // A write moves the row to the current key
        let deactivated = f.cache.deactivate(a.id, DeactivationReason::Revoked).await.unwrap();
        assert_eq!(deactivated.encryption_key_id, "k2");
        assert_eq!(f.cache.stale_key_count(), 1);

        assert_eq!(f.cache.reencrypt_stale(10).await.unwrap(), 1);
        let resealed = f.cache.get(b.id).unwrap();
        assert_eq!(resealed.encryption_key_id, "k2");
        assert!(resealed.verify_integrity());
        assert_eq!(
            f.cache.decrypt_for_matching(&resealed, Utc::now()).unwrap().as_slice(),
            b"bbb"
        );
        assert_eq!(f.cache.stale_key_count(), 0);
    }

    #[tokio::test]
    async fn test_reencrypt_skips_rows_under_missing_keys() {
        let f = create_cache(None).await;
        for bytes in [b"lost-1", b"lost-2"] {
            let row = f
                .cache
                .store(enrollment(Uuid::new_v4(), BiometricModality::Face, bytes))
                .await
                .unwrap();
            let mut orphaned = (*row).clone();
            orphaned.encryption_key_id = "retired".into();
            put_json(f.store.as_ref(), Collection::Templates, &orphaned.id.to_string(), &orphaned)
                .await
                .unwrap();
        }
        let readable = f
            .cache
            .store(enrollment(Uuid::new_v4(), BiometricModality::Face, b"kept"))
            .await
            .unwrap();
        f.ring.rotate("k2", random_key()).unwrap();

        let reopened = TemplateCache::open(
            f.store.clone(),
            f.ring.clone(),
            Arc::new(IdentityLocks::new()),
            None,
        )
        .await
        .unwrap();
        assert_eq!(reopened.stale_key_count(), 3);

        // A batch of one always reaches the row that can be resealed
        assert_eq!(reopened.reencrypt_stale(1).await.unwrap(), 1);
        assert_eq!(reopened.get(readable.id).unwrap().encryption_key_id, "k2");
        assert_eq!(reopened.stale_key_count(), 2);
        assert_eq!(reopened.reencrypt_stale(10).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_tampered_row_fails_integrity() {
        let f = create_cache(None).await;
        let row = f
            .cache
            .store(enrollment(Uuid::new_v4(), BiometricModality::Voice, b"voice"))
            .await
            .unwrap();
        let mut tampered = (*row).clone();
        tampered.encrypted_template[0] ^= 0xff;

        assert!(matches!(
            f.cache.decrypt_for_matching(&tampered, Utc::now()),
            Err(IdentityError::IntegrityError(_))
        ));
    }

    #[tokio::test]
    async fn test_reload_from_store() {
        let f = create_cache(None).await;
        let identity = Uuid::new_v4();
        let row = f
            .cache
            .store(enrollment(identity, BiometricModality::Face, b"persisted"))
            .await
            .unwrap();

        let reopened = TemplateCache::open(
            f.store.clone(),
            f.ring.clone(),
            Arc::new(IdentityLocks::new()),
            None,
        )
        .await
        .unwrap();
        let loaded = reopened.get(row.id).unwrap();
        assert_eq!(
            reopened.decrypt_for_matching(&loaded, Utc::now()).unwrap().as_slice(),
            b"persisted"
        );
    }
}
