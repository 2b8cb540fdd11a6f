//! Test doubles and a fully wired in-memory kiosk.

use async_trait::async_trait;
use chrono::{Duration, Utc};
use ed25519_dalek::SigningKey;
use parking_lot::Mutex;
use rand::rngs::OsRng;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use uuid::Uuid;

use shared::{
    config::OfflineVerifierConfig,
    error::{IdentityError, IdentityResult},
    types::{
        BiometricModality, CachedBiometricTemplate, CachedCredential, CredentialStatusResponse,
        TemplateFormat, TransactionLogRequest, TransactionLogResponse,
    },
};

use crate::cache::TemplateEnrollment;
use crate::engine::BiometricMatcher;
use crate::keyring::KeyRing;
use crate::ledger::{ConnectivityFlag, CredentialStatusClient, LedgerClient};
use crate::signature::{sign_compact_jws, Ed25519JwsVerifier};
use crate::storage::MemoryStore;
use crate::{KioskRuntime, RuntimeServices};

pub(crate) const TEST_ISSUER: &str = "did:example:issuer";

/// A credential signed by `issuer_key` whose offline horizon is `offline_for` from now
pub(crate) fn signed_credential(
    issuer_key: &SigningKey,
    identity_id: Uuid,
    credential_type: &str,
    offline_for: Duration,
) -> CachedCredential {
    let token = sign_compact_jws(
        issuer_key,
        None,
        &serde_json::json!({
            "iss": TEST_ISSUER,
            "sub": identity_id.to_string(),
            "typ": credential_type
        }),
    )
    .unwrap();
    let now = Utc::now();
    CachedCredential::new(
        identity_id,
        credential_type,
        TEST_ISSUER,
        token,
        now - Duration::days(1),
        Some(now + Duration::days(365)),
        now + offline_for,
    )
}

// =============================================================================
// MATCHER
// =============================================================================

/// Scores 1.0 for identical bytes and 0.0 otherwise, unless a score is scripted for the template
#[derive(Default)]
pub(crate) struct ScriptedMatcher {
    scores: Mutex<HashMap<Vec<u8>, f64>>,
    failing: AtomicBool,
    delay: Mutex<Option<std::time::Duration>>,
    calls: AtomicUsize,
}

impl ScriptedMatcher {
    pub fn set_score(&self, template: &[u8], score: f64) {
        self.scores.lock().insert(template.to_vec(), score);
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn set_delay(&self, delay: Option<std::time::Duration>) {
        *self.delay.lock() = delay;
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BiometricMatcher for ScriptedMatcher {
    async fn match_template(
        &self,
        sample: &[u8],
        template: &[u8],
        _modality: BiometricModality,
    ) -> IdentityResult<f64> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let delay = *self.delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.failing.load(Ordering::SeqCst) {
            return Err(IdentityError::MatcherUnavailable("scripted failure".into()));
        }
        if let Some(score) = self.scores.lock().get(template) {
            return Ok(*score);
        }
        Ok(if sample == template { 1.0 } else { 0.0 })
    }
}

// =============================================================================
// REMOTE SERVICES
// =============================================================================

#[derive(Default)]
pub(crate) struct FakeLedger {
    logged: Mutex<Vec<TransactionLogRequest>>,
    failing: AtomicBool,
    delay: Mutex<Option<std::time::Duration>>,
}

impl FakeLedger {
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn set_delay(&self, delay: std::time::Duration) {
        *self.delay.lock() = Some(delay);
    }

    pub fn logged(&self) -> Vec<TransactionLogRequest> {
        self.logged.lock().clone()
    }
}

#[async_trait]
impl LedgerClient for FakeLedger {
    async fn log_transaction(
        &self,
        request: &TransactionLogRequest,
    ) -> IdentityResult<TransactionLogResponse> {
        let delay = *self.delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.failing.load(Ordering::SeqCst) {
            return Err(IdentityError::SyncFailure("ledger unreachable".into()));
        }
        let mut logged = self.logged.lock();
        logged.push(request.clone());
        Ok(TransactionLogResponse {
            success: true,
            log_id: Some(format!("log-{}", logged.len())),
        })
    }
}

#[derive(Default)]
pub(crate) struct FakeStatusClient {
    revoked: Mutex<HashSet<Uuid>>,
    failing: AtomicBool,
    calls: AtomicUsize,
}

impl FakeStatusClient {
    pub fn revoke(&self, credential_id: Uuid) {
        self.revoked.lock().insert(credential_id);
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CredentialStatusClient for FakeStatusClient {
    async fn credential_status(
        &self,
        credential_id: Uuid,
    ) -> IdentityResult<CredentialStatusResponse> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            return Err(IdentityError::SyncFailure("status service unreachable".into()));
        }
        Ok(CredentialStatusResponse {
            credential_id,
            revoked: self.revoked.lock().contains(&credential_id),
            checked_at: Utc::now(),
        })
    }
}

// =============================================================================
// WIRED KIOSK
// =============================================================================

/// An in-memory kiosk that starts offline
pub(crate) struct TestKiosk {
    pub runtime: KioskRuntime,
    pub store: Arc<MemoryStore>,
    pub keyring: Arc<KeyRing>,
    pub matcher: Arc<ScriptedMatcher>,
    pub ledger: Arc<FakeLedger>,
    pub status: Arc<FakeStatusClient>,
    pub probe: Arc<ConnectivityFlag>,
    pub issuer_key: SigningKey,
}

impl TestKiosk {
    pub async fn new() -> Self {
        Self::with_config(|_| {}).await
    }

    pub async fn with_config(configure: impl FnOnce(&mut OfflineVerifierConfig)) -> Self {
        Self::try_with_config(configure).await.unwrap()
    }

    pub async fn try_with_config(
        configure: impl FnOnce(&mut OfflineVerifierConfig),
    ) -> IdentityResult<Self> {
        let mut config = OfflineVerifierConfig {
            device_id: "kiosk-test".into(),
            ..Default::default()
        };
        configure(&mut config);

        Self::build(
            config,
            Arc::new(MemoryStore::new()),
            Arc::new(KeyRing::generate("test-key-1")),
            Arc::new(ScriptedMatcher::default()),
            Arc::new(FakeLedger::default()),
            Arc::new(FakeStatusClient::default()),
            Arc::new(ConnectivityFlag::new(false)),
            SigningKey::generate(&mut OsRng),
        )
        .await
    }

    /// A fresh runtime over the same store, keys and doubles, as after a restart
    pub async fn reopen(&self) -> Self {
        Self::build(
            self.runtime.config.clone(),
            self.store.clone(),
            self.keyring.clone(),
            self.matcher.clone(),
            self.ledger.clone(),
            self.status.clone(),
            self.probe.clone(),
            self.issuer_key.clone(),
        )
        .await
        .unwrap()
    }

    #[allow(clippy::too_many_arguments)]
    async fn build(
        config: OfflineVerifierConfig,
        store: Arc<MemoryStore>,
        keyring: Arc<KeyRing>,
        matcher: Arc<ScriptedMatcher>,
        ledger: Arc<FakeLedger>,
        status: Arc<FakeStatusClient>,
        probe: Arc<ConnectivityFlag>,
        issuer_key: SigningKey,
    ) -> IdentityResult<Self> {
        let verifier = Ed25519JwsVerifier::new();
        verifier.trust(TEST_ISSUER, issuer_key.verifying_key());

        let runtime = KioskRuntime::assemble(
            config,
            RuntimeServices {
                store: store.clone(),
                cipher: keyring.clone(),
                matcher: matcher.clone(),
                signatures: Arc::new(verifier),
                ledger: ledger.clone(),
                status_client: status.clone(),
                probe: probe.clone(),
            },
        )
        .await?;

        Ok(Self {
            runtime,
            store,
            keyring,
            matcher,
            ledger,
            status,
            probe,
            issuer_key,
        })
    }

    /// Seal a template straight into the cache, bypassing enrollment auditing
    pub async fn store_template(
        &self,
        identity_id: Uuid,
        modality: BiometricModality,
        template: &[u8],
    ) -> Arc<CachedBiometricTemplate> {
        self.runtime
            .templates
            .store(TemplateEnrollment::new(
                identity_id,
                modality,
                TemplateFormat::FeatureVector,
                0.9,
                template.to_vec(),
            ))
            .await
            .unwrap()
    }
}
