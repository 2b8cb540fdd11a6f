//! # Sync Coordinator
//!
//! Reconciles offline work with the ledger once connectivity returns:
//! - sync-pending verification results are logged and the identity's
//!   cached credentials re-checked
//! - queued audit entries are submitted
//! - credential refreshes update the cache's online-check fields
//!
//! Only one drain runs at a time. Items are marked `InFlight` before any
//! remote call and no cache or queue lock is held while a call is out.

pub mod queue;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use shared::{
    config::{CacheConfig, SyncConfig},
    constants::{AUDIT_ENTRY_PRIORITY, ENTITY_TYPE_IDENTITY, VERIFICATION_RESULT_PRIORITY},
    error::{IdentityError, IdentityResult},
    types::{OfflineVerificationResult, SyncRecord, TransactionLogRequest, VerificationKind},
};

use crate::audit::AuditTrailEntry;
use crate::cache::{CredentialCache, IdentityLocks, TemplateCache};
use crate::ledger::{ConnectivityProbe, CredentialStatusClient, LedgerClient};
use crate::storage::{get_json, put_json, Collection, RecordStore};

pub use queue::{PendingItem, PendingKind, PendingQueue, PendingState, QueueCounts};

/// Outcome of one drain
#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct DrainReport {
    pub attempted: usize,
    pub reconciled: usize,
    pub failed: usize,
    pub exhausted: usize,
}

/// Outcome of one maintenance pass
#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct MaintenanceReport {
    pub expired_credentials: usize,
    pub reencrypted_templates: usize,
    pub refreshes_scheduled: usize,
    pub purged: usize,
    pub locks_pruned: usize,
}

/// Point-in-time sync state
#[derive(Debug, Clone, Serialize)]
pub struct SyncStatus {
    pub is_syncing: bool,
    pub is_connected: bool,
    pub last_sync_at: Option<DateTime<Utc>>,
    pub last_successful_sync_at: Option<DateTime<Utc>>,
    pub pending: usize,
    pub in_flight: usize,
    pub reconciled: usize,
    pub exhausted: usize,
    pub drains: u64,
    pub reconciled_total: u64,
    pub failed_total: u64,
}

struct DrainGuard<'a>(&'a AtomicBool);

impl Drop for DrainGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Drains the pending queue against the ledger and identity service
pub struct SyncCoordinator {
    config: SyncConfig,
    max_offline_age: chrono::Duration,
    store: Arc<dyn RecordStore>,
    queue: PendingQueue,
    credentials: Arc<CredentialCache>,
    templates: Arc<TemplateCache>,
    locks: Arc<IdentityLocks>,
    ledger: Arc<dyn LedgerClient>,
    status_client: Arc<dyn CredentialStatusClient>,
    probe: Arc<dyn ConnectivityProbe>,
    draining: AtomicBool,
    last_sync_at: RwLock<Option<DateTime<Utc>>>,
    last_successful_sync_at: RwLock<Option<DateTime<Utc>>>,
    drains: AtomicU64,
    reconciled_total: AtomicU64,
    failed_total: AtomicU64,
}

impl SyncCoordinator {
    #[allow(clippy::too_many_arguments)]
    pub async fn open(
        config: &SyncConfig,
        cache_config: &CacheConfig,
        store: Arc<dyn RecordStore>,
        credentials: Arc<CredentialCache>,
        templates: Arc<TemplateCache>,
        locks: Arc<IdentityLocks>,
        ledger: Arc<dyn LedgerClient>,
        status_client: Arc<dyn CredentialStatusClient>,
        probe: Arc<dyn ConnectivityProbe>,
    ) -> IdentityResult<Self> {
        let queue = PendingQueue::open(store.clone(), config.max_pending).await?;
        Ok(Self {
            config: config.clone(),
            max_offline_age: cache_config.max_offline_age(),
            store,
            queue,
            credentials,
            templates,
            locks,
            ledger,
            status_client,
            probe,
            draining: AtomicBool::new(false),
            last_sync_at: RwLock::new(None),
            last_successful_sync_at: RwLock::new(None),
            drains: AtomicU64::new(0),
            reconciled_total: AtomicU64::new(0),
            failed_total: AtomicU64::new(0),
        })
    }

    pub fn queue(&self) -> &PendingQueue {
        &self.queue
    }

    // =========================================================================
    // ENQUEUE
    // =========================================================================

    /// Queue a successful offline result for reconciliation
    pub async fn enqueue_pending_result(
        &self,
        result: &OfflineVerificationResult,
    ) -> IdentityResult<()> {
        if !result.sync_pending() {
            return Err(IdentityError::InvalidArgument(format!(
                "result {} is not sync-pending",
                result.transaction_id()
            )));
        }
        let item = PendingItem::new(
            result.transaction_id(),
            PendingKind::VerificationResult { result: result.clone() },
            VERIFICATION_RESULT_PRIORITY,
        );
        self.queue.enqueue(item).await?;
        Ok(())
    }

    pub async fn enqueue_audit_entry(&self, entry: AuditTrailEntry) -> IdentityResult<()> {
        let item = PendingItem::new(
            entry.id(),
            PendingKind::AuditEntry { entry },
            AUDIT_ENTRY_PRIORITY,
        );
        self.queue.enqueue(item).await?;
        Ok(())
    }

    /// Queue an online re-check of one credential. Returns `false` when one is already outstanding.
    pub async fn enqueue_credential_refresh(
        &self,
        credential_id: Uuid,
        priority: i32,
    ) -> IdentityResult<bool> {
        if self.queue.has_outstanding_refresh(credential_id) {
            return Ok(false);
        }
        let item = PendingItem::new(
            Uuid::new_v4(),
            PendingKind::CredentialRefresh { credential_id },
            priority,
        );
        self.queue.enqueue(item).await
    }

    /// Queue refreshes for every cached credential overdue for an online check
    pub async fn schedule_stale_credentials(&self, now: DateTime<Utc>) -> IdentityResult<usize> {
        let mut scheduled = 0;
        for credential in self.credentials.due_for_online_check(now, self.max_offline_age) {
            if self
                .enqueue_credential_refresh(credential.id, credential.sync_priority)
                .await?
            {
                scheduled += 1;
            }
        }
        if scheduled > 0 {
            debug!(scheduled, "Scheduled credential refreshes");
        }
        Ok(scheduled)
    }

    // =========================================================================
    // DRAIN
    // =========================================================================

    /// Process up to `max_batch` due items in priority order.
    ///
    /// Fails with `SyncFailure` when another drain is already running.
    pub async fn drain_pending(
        &self,
        max_batch: usize,
        now: DateTime<Utc>,
    ) -> IdentityResult<DrainReport> {
        if self.draining.swap(true, Ordering::SeqCst) {
            return Err(IdentityError::SyncFailure("sync already in progress".into()));
        }
        let _guard = DrainGuard(&self.draining);
        *self.last_sync_at.write() = Some(now);
        self.drains.fetch_add(1, Ordering::Relaxed);

        let mut claimed = Vec::new();
        for item in self.queue.due(now, max_batch) {
            claimed.push(self.queue.mark_in_flight(item.id).await?);
        }

        let mut report = DrainReport {
            attempted: claimed.len(),
            ..Default::default()
        };

        for item in claimed {
            match self.reconcile(&item, now).await {
                Ok(()) => {
                    self.queue.mark_reconciled(item.id, now).await?;
                    report.reconciled += 1;
                }
                Err(e) => {
                    let exhausted = item.attempts >= self.config.max_retries;
                    let next_attempt_at = now + self.config.backoff_for(item.attempts);
                    warn!(
                        item_id = %item.id,
                        kind = item.kind.label(),
                        attempts = item.attempts,
                        exhausted,
                        error = %e,
                        "Sync attempt failed"
                    );
                    self.queue
                        .mark_failed(item.id, &e.to_string(), next_attempt_at, exhausted)
                        .await?;
                    report.failed += 1;
                    if exhausted {
                        report.exhausted += 1;
                    }
                }
            }
        }

        self.reconciled_total
            .fetch_add(report.reconciled as u64, Ordering::Relaxed);
        self.failed_total.fetch_add(report.failed as u64, Ordering::Relaxed);
        if report.failed == 0 {
            *self.last_successful_sync_at.write() = Some(now);
        }

        if report.attempted > 0 {
            info!(
                attempted = report.attempted,
                reconciled = report.reconciled,
                failed = report.failed,
                "Sync drain finished"
            );
        }
        Ok(report)
    }

    async fn reconcile(&self, item: &PendingItem, now: DateTime<Utc>) -> IdentityResult<()> {
        match &item.kind {
            PendingKind::VerificationResult { result } => {
                let logged = self
                    .ledger
                    .log_transaction(&verification_log_request(result))
                    .await?;

                // The ledger accepted the log; a failed re-check must not
                // fail the item, or the retry would post it a second time.
                let mut refreshed = 0;
                if let Some(identity_id) = result.identity_id() {
                    for credential in self.credentials.for_identity(identity_id) {
                        match self.refresh_credential(credential.id, now).await {
                            Ok(true) => refreshed += 1,
                            Ok(false) => {}
                            Err(e) => {
                                warn!(
                                    credential_id = %credential.id,
                                    error = %e,
                                    "Credential re-check failed, queueing a refresh"
                                );
                                let priority = credential.sync_priority;
                                let queued =
                                    self.enqueue_credential_refresh(credential.id, priority).await;
                                if let Err(e) = queued {
                                    warn!(
                                        credential_id = %credential.id,
                                        error = %e,
                                        "Could not queue refresh"
                                    );
                                }
                            }
                        }
                    }
                }

                let record = SyncRecord {
                    transaction_id: result.transaction_id(),
                    reconciled_at: now,
                    ledger_log_id: logged.log_id,
                    credentials_refreshed: refreshed,
                };
                put_json(
                    self.store.as_ref(),
                    Collection::SyncRecords,
                    &record.transaction_id.to_string(),
                    &record,
                )
                .await?;
                debug!(
                    transaction_id = %record.transaction_id,
                    refreshed,
                    "Verification result reconciled"
                );
                Ok(())
            }
            PendingKind::AuditEntry { entry } => {
                self.ledger.log_transaction(&entry.to_log_request()).await?;
                Ok(())
            }
            PendingKind::CredentialRefresh { credential_id } => {
                self.refresh_credential(*credential_id, now).await?;
                Ok(())
            }
        }
    }

    /// Returns `false` when the credential left the cache in the meantime
    async fn refresh_credential(
        &self,
        credential_id: Uuid,
        now: DateTime<Utc>,
    ) -> IdentityResult<bool> {
        if self.credentials.get(credential_id).is_err() {
            debug!(credential_id = %credential_id, "Credential no longer cached, skipping refresh");
            return Ok(false);
        }
        let status = self.status_client.credential_status(credential_id).await?;
        match self
            .credentials
            .record_online_check(credential_id, status.revoked, now)
            .await
        {
            Ok(_) => Ok(true),
            Err(IdentityError::NotFound { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }

    // =========================================================================
    // QUERIES AND HOUSEKEEPING
    // =========================================================================

    /// Whether a result is still waiting for reconciliation
    pub fn is_sync_pending(&self, transaction_id: Uuid) -> bool {
        self.queue
            .get(transaction_id)
            .map_or(false, |item| item.state != PendingState::Reconciled)
    }

    pub async fn sync_record(&self, transaction_id: Uuid) -> IdentityResult<Option<SyncRecord>> {
        get_json(self.store.as_ref(), Collection::SyncRecords, &transaction_id.to_string()).await
    }

    pub async fn reset_exhausted(&self) -> IdentityResult<usize> {
        let reset = self.queue.reset_exhausted().await?;
        if reset > 0 {
            info!(reset, "Exhausted sync items re-armed");
        }
        Ok(reset)
    }

    pub async fn purge_reconciled(&self, older_than: DateTime<Utc>) -> IdentityResult<usize> {
        self.queue.purge_reconciled(older_than).await
    }

    pub fn status(&self) -> SyncStatus {
        let counts = self.queue.counts();
        SyncStatus {
            is_syncing: self.draining.load(Ordering::SeqCst),
            is_connected: self.probe.is_online(),
            last_sync_at: *self.last_sync_at.read(),
            last_successful_sync_at: *self.last_successful_sync_at.read(),
            pending: counts.pending,
            in_flight: counts.in_flight,
            reconciled: counts.reconciled,
            exhausted: counts.exhausted,
            drains: self.drains.load(Ordering::Relaxed),
            reconciled_total: self.reconciled_total.load(Ordering::Relaxed),
            failed_total: self.failed_total.load(Ordering::Relaxed),
        }
    }

    /// Evict expired credentials, re-seal stale templates, schedule refreshes, purge old
    /// items and drop idle identity locks
    pub async fn run_maintenance(&self, now: DateTime<Utc>) -> IdentityResult<MaintenanceReport> {
        let report = MaintenanceReport {
            expired_credentials: self.credentials.evict_expired(now).await?,
            reencrypted_templates: self.templates.reencrypt_stale(self.config.batch_size).await?,
            refreshes_scheduled: self.schedule_stale_credentials(now).await?,
            purged: self
                .purge_reconciled(now - self.config.reconciled_retention())
                .await?,
            locks_pruned: self.locks.prune(),
        };
        debug!(?report, "Maintenance pass finished");
        Ok(report)
    }

    /// Run maintenance and, while online, a drain on every interval tick until `shutdown` flips
    pub fn spawn(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.config.interval());
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            info!(interval_secs = self.config.interval_secs, "Sync loop started");

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let now = Utc::now();
                        if let Err(e) = self.run_maintenance(now).await {
                            warn!(error = %e, "Maintenance failed");
                        }
                        if !self.probe.is_online() {
                            debug!("Offline, skipping drain");
                            continue;
                        }
                        if let Err(e) = self.drain_pending(self.config.batch_size, now).await {
                            warn!(error = %e, "Drain failed");
                        }
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
            info!("Sync loop stopped");
        })
    }
}

/// Ledger form of a reconciled offline result; carries no personal attributes
fn verification_log_request(result: &OfflineVerificationResult) -> TransactionLogRequest {
    let mut metadata = BTreeMap::new();
    metadata.insert("transactionId".to_string(), result.transaction_id().to_string());
    let kind = match result.kind() {
        VerificationKind::Biometric => "biometric",
        VerificationKind::Credential => "credential",
    };
    metadata.insert("kind".to_string(), kind.to_string());
    metadata.insert("matchScore".to_string(), format!("{:.4}", result.match_score()));
    metadata.insert("qualityScore".to_string(), format!("{:.4}", result.quality_score()));
    metadata.insert("wasOffline".to_string(), result.was_offline().to_string());
    if let Some(modality) = result.modality() {
        metadata.insert("modality".to_string(), modality.to_string());
    }
    if let Some(credential_id) = result.credential_id() {
        metadata.insert("credentialId".to_string(), credential_id.to_string());
    }
    if let Some(device_id) = result.device_id() {
        metadata.insert("deviceId".to_string(), device_id.to_string());
    }

    TransactionLogRequest {
        transaction_type: "OfflineVerificationReconciled".into(),
        entity_type: ENTITY_TYPE_IDENTITY.into(),
        entity_id: result.identity_id().unwrap_or_else(Uuid::nil),
        description: Some("Offline verification reconciled".into()),
        metadata,
        timestamp: result.timestamp(),
        correlation_id: result.transaction_id().to_string(),
    }
}
