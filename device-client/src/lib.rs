//! # Offline Verification Kiosk
//!
//! Device-side identity verification that keeps working without network
//! access:
//! - Credential cache with an offline trust horizon
//! - Encrypted biometric template cache with key rotation
//! - Verification engine for 1:1 / 1:N biometric and credential checks
//! - Sync coordinator reconciling offline work with the ledger
//! - Privacy-preserving audit trail
//!
//! ## Wiring
//!
//! [`KioskRuntime::assemble`] builds every component over one
//! [`RecordStore`](storage::RecordStore). The matcher, ledger, status service
//! and connectivity probe are injected through [`RuntimeServices`].

pub mod audit;
pub mod cache;
pub mod engine;
pub mod enrollment;
pub mod keyring;
pub mod ledger;
pub mod signature;
pub mod storage;
pub mod sync;

#[cfg(test)]
pub(crate) mod test_support;

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use tracing::info;

use shared::{config::OfflineVerifierConfig, error::IdentityResult};

// Re-export commonly used types
pub use audit::{AuditEventType, AuditLogger, AuditTrailEntry};
pub use cache::{CredentialCache, IdentityLocks, TemplateCache, TemplateEnrollment, TemplateScope};
pub use engine::{
    BiometricCapture, BiometricClaim, BiometricMatcher, EngineServices, EngineStats,
    VerificationEngine,
};
pub use enrollment::{EnrollmentManager, IdentityRemoval};
pub use keyring::{KeyRing, TemplateCipher};
pub use ledger::{
    ConnectivityFlag, ConnectivityProbe, CredentialStatusClient, HttpLedgerClient, LedgerClient,
};
pub use signature::{CredentialSignatureVerifier, Ed25519JwsVerifier};
pub use storage::{Collection, FileStore, MemoryStore, RecordStore};
pub use sync::{DrainReport, MaintenanceReport, SyncCoordinator, SyncStatus};

/// External collaborators of a kiosk
pub struct RuntimeServices {
    pub store: Arc<dyn RecordStore>,
    pub cipher: Arc<dyn TemplateCipher>,
    pub matcher: Arc<dyn BiometricMatcher>,
    pub signatures: Arc<dyn CredentialSignatureVerifier>,
    pub ledger: Arc<dyn LedgerClient>,
    pub status_client: Arc<dyn CredentialStatusClient>,
    pub probe: Arc<dyn ConnectivityProbe>,
}

/// Counters and sizes reported by `kiosk status`
#[derive(Debug, Clone, Serialize)]
pub struct KioskSnapshot {
    pub device_id: String,
    pub taken_at: DateTime<Utc>,
    pub credentials: cache::CredentialCacheStats,
    pub templates: cache::TemplateCacheStats,
    pub sync: SyncStatus,
    pub engine: EngineStats,
}

/// Every kiosk component, wired together
pub struct KioskRuntime {
    pub config: OfflineVerifierConfig,
    pub credentials: Arc<CredentialCache>,
    pub templates: Arc<TemplateCache>,
    pub sync: Arc<SyncCoordinator>,
    pub engine: Arc<VerificationEngine>,
    pub enrollment: EnrollmentManager,
    pub audit: Arc<AuditLogger>,
}

impl KioskRuntime {
    pub async fn assemble(
        config: OfflineVerifierConfig,
        services: RuntimeServices,
    ) -> IdentityResult<Self> {
        config.validate()?;

        let locks = Arc::new(IdentityLocks::new());
        let credentials =
            Arc::new(CredentialCache::open(services.store.clone(), locks.clone()).await?);
        let templates = Arc::new(
            TemplateCache::open(
                services.store.clone(),
                services.cipher.clone(),
                locks.clone(),
                Some(config.cache.template_validity()),
            )
            .await?,
        );

        let sync = Arc::new(
            SyncCoordinator::open(
                &config.sync,
                &config.cache,
                services.store.clone(),
                credentials.clone(),
                templates.clone(),
                locks,
                services.ledger.clone(),
                services.status_client.clone(),
                services.probe.clone(),
            )
            .await?,
        );

        let audit = Arc::new(AuditLogger::new(&config.audit, config.device_id.clone()));

        let engine = Arc::new(VerificationEngine::new(
            &config,
            EngineServices {
                credentials: credentials.clone(),
                templates: templates.clone(),
                matcher: services.matcher,
                signatures: services.signatures,
                status_client: services.status_client,
                probe: services.probe,
                sync: sync.clone(),
                audit: audit.clone(),
            },
        ));

        let enrollment = EnrollmentManager::new(
            templates.clone(),
            credentials.clone(),
            sync.clone(),
            audit.clone(),
        );

        info!(
            device_id = %config.device_id,
            credentials = credentials.len(),
            templates = templates.len(),
            pending = sync.queue().len(),
            "Kiosk runtime ready"
        );

        Ok(Self {
            config,
            credentials,
            templates,
            sync,
            engine,
            enrollment,
            audit,
        })
    }

    pub fn snapshot(&self, now: DateTime<Utc>) -> KioskSnapshot {
        KioskSnapshot {
            device_id: self.config.device_id.clone(),
            taken_at: now,
            credentials: self.credentials.stats(now),
            templates: self.templates.stats(now),
            sync: self.sync.status(),
            engine: self.engine.stats(),
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::test_support::TestKiosk;
    use chrono::Utc;
    use shared::types::BiometricModality;
    use uuid::Uuid;

    #[tokio::test]
    async fn test_snapshot_reflects_state() {
        let kiosk = TestKiosk::new().await;
        kiosk
            .store_template(Uuid::new_v4(), BiometricModality::Iris, b"iris")
            .await;

        let snapshot = kiosk.runtime.snapshot(Utc::now());
        assert_eq!(snapshot.device_id, "kiosk-test");
        assert_eq!(snapshot.templates.total, 1);
        assert_eq!(snapshot.credentials.entries, 0);
        assert!(!snapshot.sync.is_connected);
        assert!(serde_json::to_string(&snapshot).is_ok());
    }

    #[tokio::test]
    async fn test_assemble_rejects_invalid_config() {
        let result =
            TestKiosk::try_with_config(|config| config.verification.min_match_score = 1.5).await;
        assert!(result.is_err());
    }
}
