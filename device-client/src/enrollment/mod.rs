//! # Enrollment and Identity Lifecycle
//!
//! Write-side entry points for kiosk operators and provisioning:
//! 1. Seal and cache biometric templates (first enrollment or re-enrollment)
//! 2. Cache signed credentials
//! 3. Deactivate templates and remove identities from the device
//!
//! Each change is audited through the sync coordinator's queue.

use serde::Serialize;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use shared::{
    error::IdentityResult,
    types::{CachedBiometricTemplate, CachedCredential, DeactivationReason},
};

use crate::audit::{AuditEventType, AuditLogger, AuditTrailEntry};
use crate::cache::{CredentialCache, TemplateCache, TemplateEnrollment};
use crate::sync::SyncCoordinator;

/// What [`EnrollmentManager::remove_identity`] took off the device
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct IdentityRemoval {
    pub identity_id: Uuid,
    pub templates_deactivated: Vec<Uuid>,
    pub credentials_removed: usize,
}

pub struct EnrollmentManager {
    templates: Arc<TemplateCache>,
    credentials: Arc<CredentialCache>,
    sync: Arc<SyncCoordinator>,
    audit: Arc<AuditLogger>,
}

impl EnrollmentManager {
    pub fn new(
        templates: Arc<TemplateCache>,
        credentials: Arc<CredentialCache>,
        sync: Arc<SyncCoordinator>,
        audit: Arc<AuditLogger>,
    ) -> Self {
        Self {
            templates,
            credentials,
            sync,
            audit,
        }
    }

    /// Enroll a new template alongside any existing ones
    pub async fn enroll(
        &self,
        enrollment: TemplateEnrollment,
    ) -> IdentityResult<Arc<CachedBiometricTemplate>> {
        let template = self.templates.store(enrollment).await?;
        info!(
            template_id = %template.id,
            identity_id = %template.identity_id,
            modality = %template.modality,
            "Biometric template enrolled"
        );
        self.submit(self.audit.template_entry(AuditEventType::BiometricEnrolled, &template))
            .await;
        Ok(template)
    }

    /// Replace the identity's active templates of the same modality.
    ///
    /// Returns the new template and the ids it superseded.
    pub async fn re_enroll(
        &self,
        enrollment: TemplateEnrollment,
    ) -> IdentityResult<(Arc<CachedBiometricTemplate>, Vec<Uuid>)> {
        let (template, superseded) = self.templates.re_enroll(enrollment).await?;
        info!(
            template_id = %template.id,
            identity_id = %template.identity_id,
            superseded = superseded.len(),
            "Biometric template re-enrolled"
        );

        self.submit(self.audit.template_entry(AuditEventType::BiometricUpdated, &template))
            .await;
        for template_id in &superseded {
            if let Ok(previous) = self.templates.get(*template_id) {
                let entry =
                    self.audit.template_entry(AuditEventType::BiometricDeactivated, &previous);
                self.submit(entry).await;
            }
        }
        Ok((template, superseded))
    }

    /// Soft-delete one template. Deactivating an inactive template changes nothing
    /// and is not audited.
    pub async fn deactivate_template(
        &self,
        template_id: Uuid,
        reason: DeactivationReason,
    ) -> IdentityResult<Arc<CachedBiometricTemplate>> {
        let was_active = self.templates.get(template_id)?.is_active;
        let template = self.templates.deactivate(template_id, reason).await?;
        if was_active {
            info!(
                template_id = %template_id,
                reason = reason.as_str(),
                "Biometric template deactivated"
            );
            self.submit(self.audit.template_entry(AuditEventType::BiometricDeactivated, &template))
                .await;
        }
        Ok(template)
    }

    /// Cache a credential, replacing the one of the same type. Returns the replaced entry.
    pub async fn cache_credential(
        &self,
        credential: CachedCredential,
    ) -> IdentityResult<Option<Arc<CachedCredential>>> {
        let entry = self.audit.credential_entry(&credential);
        let previous = self.credentials.upsert(credential).await?;
        self.submit(entry).await;
        Ok(previous)
    }

    /// Deactivate every template and drop every credential of an identity
    pub async fn remove_identity(&self, identity_id: Uuid) -> IdentityResult<IdentityRemoval> {
        let templates_deactivated = self
            .templates
            .deactivate_identity(identity_id, DeactivationReason::IdentityDeleted)
            .await?;
        let credentials_removed = self.credentials.remove_identity(identity_id).await?;

        info!(
            identity_id = %identity_id,
            templates = templates_deactivated.len(),
            credentials = credentials_removed,
            "Identity removed from device"
        );
        self.submit(self.audit.identity_removed_entry(
            identity_id,
            templates_deactivated.len(),
            credentials_removed,
        ))
        .await;

        Ok(IdentityRemoval {
            identity_id,
            templates_deactivated,
            credentials_removed,
        })
    }

    async fn submit(&self, entry: AuditTrailEntry) {
        let entry_id = entry.id();
        if let Err(e) = self.sync.enqueue_audit_entry(entry).await {
            warn!(entry_id = %entry_id, error = %e, "Failed to queue audit entry");
        }
    }
}
