//! # Credential Cache
//!
//! Persisted store of signed credentials, at most one per
//! `(identity, credential type)`, and the offline-trust policy applied to
//! them.
//!
//! Readers take the index read lock just long enough to clone an `Arc`.
//! Writers serialize per identity through [`IdentityLocks`]. The online-check
//! fields are only ever written by [`CredentialCache::record_online_check`],
//! which the sync coordinator calls after a successful remote check.

use chrono::{DateTime, Duration, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use shared::{
    error::{IdentityError, IdentityResult},
    types::CachedCredential,
};

use super::locks::IdentityLocks;
use crate::storage::{load_all, put_json, Collection, RecordStore};

#[derive(Default)]
struct CredentialIndex {
    entries: HashMap<Uuid, Arc<CachedCredential>>,
    by_type: HashMap<(Uuid, String), Uuid>,
}

impl CredentialIndex {
    fn insert(&mut self, entry: Arc<CachedCredential>) -> Option<Arc<CachedCredential>> {
        let key = (entry.identity_id, entry.credential_type.clone());
        let replaced = self
            .by_type
            .insert(key, entry.id)
            .filter(|previous_id| *previous_id != entry.id)
            .and_then(|previous_id| self.entries.remove(&previous_id));
        self.entries.insert(entry.id, entry);
        replaced
    }

    fn remove(&mut self, credential_id: Uuid) -> Option<Arc<CachedCredential>> {
        let entry = self.entries.remove(&credential_id)?;
        let key = (entry.identity_id, entry.credential_type.clone());
        if self.by_type.get(&key) == Some(&credential_id) {
            self.by_type.remove(&key);
        }
        Some(entry)
    }
}

/// Cache statistics
#[derive(Debug, Clone, Serialize)]
pub struct CredentialCacheStats {
    pub entries: usize,
    pub offline_valid: usize,
    pub revoked: usize,
    pub expired: usize,
    pub upserts: u64,
    pub evictions: u64,
}

/// Persisted credential cache
pub struct CredentialCache {
    store: Arc<dyn RecordStore>,
    locks: Arc<IdentityLocks>,
    index: RwLock<CredentialIndex>,
    upserts: AtomicU64,
    evictions: AtomicU64,
}

impl CredentialCache {
    /// Load every persisted credential
    ///
    /// When an interrupted upsert left two rows for the same identity and
    /// type, the most recently cached row wins and the other is removed.
    pub async fn open(
        store: Arc<dyn RecordStore>,
        locks: Arc<IdentityLocks>,
    ) -> IdentityResult<Self> {
        let mut rows: Vec<CachedCredential> =
            load_all(store.as_ref(), Collection::Credentials).await?;
        rows.sort_by_key(|row| row.cached_at);

        let mut index = CredentialIndex::default();
        let mut superseded = Vec::new();
        for row in rows {
            if let Some(previous) = index.insert(Arc::new(row)) {
                superseded.push(previous.id);
            }
        }
        for credential_id in superseded {
            warn!(
                credential_id = %credential_id,
                "Removing superseded credential left by an interrupted write"
            );
            store
                .remove(Collection::Credentials, &credential_id.to_string())
                .await?;
        }

        info!(entries = index.entries.len(), "Credential cache loaded");

        Ok(Self {
            store,
            locks,
            index: RwLock::new(index),
            upserts: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        })
    }

    // =========================================================================
    // READS
    // =========================================================================

    pub fn get(&self, credential_id: Uuid) -> IdentityResult<Arc<CachedCredential>> {
        self.index
            .read()
            .entries
            .get(&credential_id)
            .cloned()
            .ok_or_else(|| IdentityError::not_found("credential", credential_id))
    }

    /// The current entry for an identity and credential type
    pub fn find(&self, identity_id: Uuid, credential_type: &str) -> Option<Arc<CachedCredential>> {
        let index = self.index.read();
        index
            .by_type
            .get(&(identity_id, credential_type.to_string()))
            .and_then(|id| index.entries.get(id))
            .cloned()
    }

    /// Like [`find`](Self::find), reporting a missing entry as `NotFound`
    pub fn load(
        &self,
        identity_id: Uuid,
        credential_type: &str,
    ) -> IdentityResult<Arc<CachedCredential>> {
        self.find(identity_id, credential_type).ok_or_else(|| {
            IdentityError::not_found("credential", format!("{}/{}", identity_id, credential_type))
        })
    }

    pub fn for_identity(&self, identity_id: Uuid) -> Vec<Arc<CachedCredential>> {
        self.index
            .read()
            .entries
            .values()
            .filter(|entry| entry.identity_id == identity_id)
            .cloned()
            .collect()
    }

    pub fn is_valid_offline_by_id(
        &self,
        credential_id: Uuid,
        now: DateTime<Utc>,
    ) -> IdentityResult<bool> {
        Ok(self.get(credential_id)?.is_valid_offline(now))
    }

    pub fn needs_online_verification_by_id(
        &self,
        credential_id: Uuid,
        now: DateTime<Utc>,
        max_offline_age: Duration,
    ) -> IdentityResult<bool> {
        Ok(self
            .get(credential_id)?
            .needs_online_verification(now, max_offline_age))
    }

    /// Whether the identity holds at least one offline-valid credential
    pub fn has_valid_offline(&self, identity_id: Uuid, now: DateTime<Utc>) -> bool {
        self.index
            .read()
            .entries
            .values()
            .any(|entry| entry.identity_id == identity_id && entry.is_valid_offline(now))
    }

    /// Unexpired entries needing a re-check, most urgent first:
    /// higher `sync_priority`, then never checked, then oldest check
    pub fn due_for_online_check(
        &self,
        now: DateTime<Utc>,
        max_offline_age: Duration,
    ) -> Vec<Arc<CachedCredential>> {
        let mut due: Vec<_> = self
            .index
            .read()
            .entries
            .values()
            .filter(|entry| {
                !entry.is_expired(now) && entry.needs_online_verification(now, max_offline_age)
            })
            .cloned()
            .collect();
        due.sort_by(|a, b| {
            b.sync_priority
                .cmp(&a.sync_priority)
                .then_with(|| a.last_online_check.cmp(&b.last_online_check))
                .then_with(|| a.cached_at.cmp(&b.cached_at))
        });
        due
    }

    pub fn len(&self) -> usize {
        self.index.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self, now: DateTime<Utc>) -> CredentialCacheStats {
        let index = self.index.read();
        CredentialCacheStats {
            entries: index.entries.len(),
            offline_valid: index.entries.values().filter(|e| e.is_valid_offline(now)).count(),
            revoked: index.entries.values().filter(|e| e.is_revoked).count(),
            expired: index.entries.values().filter(|e| e.is_expired(now)).count(),
            upserts: self.upserts.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
        }
    }

    // =========================================================================
    // WRITES
    // =========================================================================

    /// Insert or fully replace the entry for the same identity and type.
    ///
    /// Fields are never merged with the previous entry. Returns the replaced
    /// entry, if any.
    pub async fn upsert(
        &self,
        entry: CachedCredential,
    ) -> IdentityResult<Option<Arc<CachedCredential>>> {
        entry.validate()?;

        let _guard = self.locks.lock(entry.identity_id).await;
        let previous = self.find(entry.identity_id, &entry.credential_type);

        put_json(self.store.as_ref(), Collection::Credentials, &entry.id.to_string(), &entry)
            .await?;
        if let Some(previous) = previous.as_ref().filter(|p| p.id != entry.id) {
            self.store
                .remove(Collection::Credentials, &previous.id.to_string())
                .await?;
        }

        let entry = Arc::new(entry);
        let replaced = self.index.write().insert(entry.clone());
        self.upserts.fetch_add(1, Ordering::Relaxed);

        info!(
            credential_id = %entry.id,
            identity_id = %entry.identity_id,
            credential_type = %entry.credential_type,
            offline_valid_until = %entry.offline_valid_until,
            replaced = replaced.is_some(),
            "Credential cached"
        );

        Ok(previous)
    }

    /// Record the outcome of a successful remote status check.
    ///
    /// Revocation is sticky: a later "not revoked" answer never clears it.
    pub(crate) async fn record_online_check(
        &self,
        credential_id: Uuid,
        revoked: bool,
        checked_at: DateTime<Utc>,
    ) -> IdentityResult<Arc<CachedCredential>> {
        let identity_id = self.get(credential_id)?.identity_id;
        let _guard = self.locks.lock(identity_id).await;

        // Re-read under the identity lock; an upsert may have replaced it
        let mut updated = (*self.get(credential_id)?).clone();
        updated.is_revoked = updated.is_revoked || revoked;
        updated.online_verified = !updated.is_revoked;
        updated.last_online_check = Some(checked_at);
        updated.revocation_check_at = Some(checked_at);

        put_json(
            self.store.as_ref(),
            Collection::Credentials,
            &credential_id.to_string(),
            &updated,
        )
        .await?;

        let updated = Arc::new(updated);
        self.index.write().insert(updated.clone());

        if updated.is_revoked {
            warn!(
                credential_id = %credential_id,
                identity_id = %identity_id,
                "Credential revoked upstream"
            );
        } else {
            debug!(
                credential_id = %credential_id,
                checked_at = %checked_at,
                "Credential re-verified online"
            );
        }

        Ok(updated)
    }

    /// Remove one entry
    pub async fn remove(&self, credential_id: Uuid) -> IdentityResult<Arc<CachedCredential>> {
        let identity_id = self.get(credential_id)?.identity_id;
        let _guard = self.locks.lock(identity_id).await;

        self.store
            .remove(Collection::Credentials, &credential_id.to_string())
            .await?;
        self.index
            .write()
            .remove(credential_id)
            .ok_or_else(|| IdentityError::not_found("credential", credential_id))
    }

    /// Remove every entry past `expires_at`
    pub async fn evict_expired(&self, now: DateTime<Utc>) -> IdentityResult<usize> {
        let expired: Vec<Uuid> = self
            .index
            .read()
            .entries
            .values()
            .filter(|entry| entry.is_expired(now))
            .map(|entry| entry.id)
            .collect();

        let mut evicted = 0;
        for credential_id in expired {
            match self.remove(credential_id).await {
                Ok(_) => evicted += 1,
                // Replaced concurrently
                Err(IdentityError::NotFound { .. }) => continue,
                Err(e) => return Err(e),
            }
        }

        if evicted > 0 {
            self.evictions.fetch_add(evicted as u64, Ordering::Relaxed);
            info!(evicted, "Expired credentials evicted");
        }
        Ok(evicted)
    }

    /// Remove every entry belonging to an identity
    pub async fn remove_identity(&self, identity_id: Uuid) -> IdentityResult<usize> {
        let ids: Vec<Uuid> = self.for_identity(identity_id).iter().map(|e| e.id).collect();
        let mut removed = 0;
        for credential_id in ids {
            match self.remove(credential_id).await {
                Ok(_) => removed += 1,
                Err(IdentityError::NotFound { .. }) => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(removed)
    }
}
