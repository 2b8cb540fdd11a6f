//! # Pending Sync Queue
//!
//! Durable queue of work waiting for connectivity. Each item moves through
//! `Pending -> InFlight -> Reconciled`, or back to `Pending` on failure.
//! Items found `InFlight` at open time were interrupted mid-drain and are
//! returned to `Pending`.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};
use uuid::Uuid;

use shared::{
    error::{IdentityError, IdentityResult},
    types::OfflineVerificationResult,
};

use crate::audit::AuditTrailEntry;
use crate::storage::{load_all, put_json, Collection, RecordStore};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PendingState {
    Pending,
    InFlight,
    Reconciled,
}

impl PendingState {
    pub fn as_str(&self) -> &'static str {
        match self {
            PendingState::Pending => "pending",
            PendingState::InFlight => "in_flight",
            PendingState::Reconciled => "reconciled",
        }
    }

    pub fn can_transition_to(&self, next: PendingState) -> bool {
        matches!(
            (self, next),
            (PendingState::Pending, PendingState::InFlight)
                | (PendingState::InFlight, PendingState::Pending)
                | (PendingState::InFlight, PendingState::Reconciled)
        )
    }
}

/// What an item asks the coordinator to do once online
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PendingKind {
    VerificationResult { result: OfflineVerificationResult },
    AuditEntry { entry: AuditTrailEntry },
    CredentialRefresh { credential_id: Uuid },
}

impl PendingKind {
    pub fn label(&self) -> &'static str {
        match self {
            PendingKind::VerificationResult { .. } => "verification_result",
            PendingKind::AuditEntry { .. } => "audit_entry",
            PendingKind::CredentialRefresh { .. } => "credential_refresh",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PendingItem {
    pub id: Uuid,
    pub kind: PendingKind,
    pub priority: i32,
    pub enqueued_at: DateTime<Utc>,
    pub state: PendingState,
    pub attempts: u32,
    pub next_attempt_at: DateTime<Utc>,
    #[serde(default)]
    pub last_error: Option<String>,
    #[serde(default)]
    pub exhausted: bool,
    #[serde(default)]
    pub reconciled_at: Option<DateTime<Utc>>,
}

impl PendingItem {
    pub fn new(id: Uuid, kind: PendingKind, priority: i32) -> Self {
        let now = Utc::now();
        Self {
            id,
            kind,
            priority,
            enqueued_at: now,
            state: PendingState::Pending,
            attempts: 0,
            next_attempt_at: now,
            last_error: None,
            exhausted: false,
            reconciled_at: None,
        }
    }

    fn transition(&mut self, next: PendingState) -> IdentityResult<()> {
        if !self.state.can_transition_to(next) {
            return Err(IdentityError::InvalidTransition {
                from: self.state.as_str().into(),
                to: next.as_str().into(),
            });
        }
        self.state = next;
        Ok(())
    }

    /// Ready to be picked up by a drain at `now`
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.state == PendingState::Pending && !self.exhausted && self.next_attempt_at <= now
    }
}

/// Item counts by state
#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq, Eq)]
pub struct QueueCounts {
    pub pending: usize,
    pub in_flight: usize,
    pub reconciled: usize,
    pub exhausted: usize,
}

/// Persisted pending queue
pub struct PendingQueue {
    store: Arc<dyn RecordStore>,
    items: RwLock<HashMap<Uuid, PendingItem>>,
    max_pending: usize,
    writes: Mutex<()>,
}

impl PendingQueue {
    pub async fn open(store: Arc<dyn RecordStore>, max_pending: usize) -> IdentityResult<Self> {
        let rows: Vec<PendingItem> = load_all(store.as_ref(), Collection::PendingSync).await?;

        let mut items = HashMap::with_capacity(rows.len());
        let mut recovered = 0;
        for mut row in rows {
            if row.state == PendingState::InFlight {
                row.transition(PendingState::Pending)?;
                put_json(store.as_ref(), Collection::PendingSync, &row.id.to_string(), &row).await?;
                recovered += 1;
            }
            items.insert(row.id, row);
        }

        info!(items = items.len(), recovered, "Pending sync queue loaded");

        Ok(Self {
            store,
            items: RwLock::new(items),
            max_pending,
            writes: Mutex::new(()),
        })
    }

    /// Add an item. Returns `false` when an item with the same id is already queued.
    pub async fn enqueue(&self, item: PendingItem) -> IdentityResult<bool> {
        let _writes = self.writes.lock().await;
        {
            let items = self.items.read();
            if items.contains_key(&item.id) {
                return Ok(false);
            }
            let outstanding = items
                .values()
                .filter(|i| i.state != PendingState::Reconciled)
                .count();
            if outstanding >= self.max_pending {
                return Err(IdentityError::SyncFailure(format!(
                    "pending queue is full ({} items)",
                    self.max_pending
                )));
            }
        }

        put_json(self.store.as_ref(), Collection::PendingSync, &item.id.to_string(), &item).await?;
        debug!(
            item_id = %item.id,
            kind = item.kind.label(),
            priority = item.priority,
            "Queued for sync"
        );
        self.items.write().insert(item.id, item);
        Ok(true)
    }

    pub fn get(&self, id: Uuid) -> Option<PendingItem> {
        self.items.read().get(&id).cloned()
    }

    /// Outstanding refresh for a credential, if one is queued
    pub fn has_outstanding_refresh(&self, credential_id: Uuid) -> bool {
        self.items.read().values().any(|item| {
            item.state != PendingState::Reconciled
                && matches!(
                    item.kind,
                    PendingKind::CredentialRefresh { credential_id: id } if id == credential_id
                )
        })
    }

    /// Every item, highest priority first, then oldest first
    pub fn snapshot(&self) -> Vec<PendingItem> {
        let mut items: Vec<_> = self.items.read().values().cloned().collect();
        Self::sort(&mut items);
        items
    }

    /// Up to `limit` items ready at `now`, in drain order
    pub fn due(&self, now: DateTime<Utc>, limit: usize) -> Vec<PendingItem> {
        let mut due: Vec<_> = self
            .items
            .read()
            .values()
            .filter(|item| item.is_due(now))
            .cloned()
            .collect();
        Self::sort(&mut due);
        due.truncate(limit);
        due
    }

    pub fn counts(&self) -> QueueCounts {
        let items = self.items.read();
        let mut counts = QueueCounts::default();
        for item in items.values() {
            match item.state {
                PendingState::Pending => counts.pending += 1,
                PendingState::InFlight => counts.in_flight += 1,
                PendingState::Reconciled => counts.reconciled += 1,
            }
            if item.exhausted {
                counts.exhausted += 1;
            }
        }
        counts
    }

    pub fn len(&self) -> usize {
        self.items.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub async fn mark_in_flight(&self, id: Uuid) -> IdentityResult<PendingItem> {
        self.update(id, |item| {
            item.transition(PendingState::InFlight)?;
            item.attempts += 1;
            Ok(())
        })
        .await
    }

    pub async fn mark_reconciled(
        &self,
        id: Uuid,
        at: DateTime<Utc>,
    ) -> IdentityResult<PendingItem> {
        self.update(id, |item| {
            item.transition(PendingState::Reconciled)?;
            item.reconciled_at = Some(at);
            item.last_error = None;
            Ok(())
        })
        .await
    }

    /// Return an in-flight item to `Pending` after a failed attempt
    pub async fn mark_failed(
        &self,
        id: Uuid,
        error: &str,
        next_attempt_at: DateTime<Utc>,
        exhausted: bool,
    ) -> IdentityResult<PendingItem> {
        self.update(id, |item| {
            item.transition(PendingState::Pending)?;
            item.last_error = Some(error.to_string());
            item.next_attempt_at = next_attempt_at;
            item.exhausted = exhausted;
            Ok(())
        })
        .await
    }

    /// Make exhausted items eligible again with a fresh attempt budget
    pub async fn reset_exhausted(&self) -> IdentityResult<usize> {
        let ids: Vec<Uuid> = self
            .items
            .read()
            .values()
            .filter(|item| item.exhausted)
            .map(|item| item.id)
            .collect();

        let now = Utc::now();
        for id in &ids {
            self.update(*id, |item| {
                item.exhausted = false;
                item.attempts = 0;
                item.next_attempt_at = now;
                Ok(())
            })
            .await?;
        }
        Ok(ids.len())
    }

    /// Drop reconciled items reconciled before `older_than`
    pub async fn purge_reconciled(&self, older_than: DateTime<Utc>) -> IdentityResult<usize> {
        let _writes = self.writes.lock().await;
        let ids: Vec<Uuid> = self
            .items
            .read()
            .values()
            .filter(|item| {
                item.state == PendingState::Reconciled
                    && item.reconciled_at.map_or(false, |at| at < older_than)
            })
            .map(|item| item.id)
            .collect();

        for id in &ids {
            self.store.remove(Collection::PendingSync, &id.to_string()).await?;
            self.items.write().remove(id);
        }
        Ok(ids.len())
    }

    async fn update<F>(&self, id: Uuid, apply: F) -> IdentityResult<PendingItem>
    where
        F: FnOnce(&mut PendingItem) -> IdentityResult<()>,
    {
        let _writes = self.writes.lock().await;
        let mut item = self
            .get(id)
            .ok_or_else(|| IdentityError::not_found("pending item", id))?;
        apply(&mut item)?;

        put_json(self.store.as_ref(), Collection::PendingSync, &id.to_string(), &item).await?;
        self.items.write().insert(id, item.clone());
        Ok(item)
    }

    fn sort(items: &mut [PendingItem]) {
        items.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then_with(|| a.enqueued_at.cmp(&b.enqueued_at))
                .then_with(|| a.id.cmp(&b.id))
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;
    use chrono::Duration;

    fn refresh(priority: i32) -> PendingItem {
        PendingItem::new(
            Uuid::new_v4(),
            PendingKind::CredentialRefresh {
                credential_id: Uuid::new_v4(),
            },
            priority,
        )
    }

    async fn create_queue(max_pending: usize) -> (PendingQueue, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let queue = PendingQueue::open(store.clone(), max_pending).await.unwrap();
        (queue, store)
    }

    #[test]
    fn test_state_machine() {
        use PendingState::*;
        assert!(Pending.can_transition_to(InFlight));
        assert!(InFlight.can_transition_to(Pending));
        assert!(InFlight.can_transition_to(Reconciled));

        assert!(!Pending.can_transition_to(Reconciled));
        assert!(!Reconciled.can_transition_to(Pending));
        assert!(!Reconciled.can_transition_to(InFlight));
        assert!(!Pending.can_transition_to(Pending));
    }

    #[tokio::test]
    async fn test_enqueue_is_idempotent() {
        let (queue, store) = create_queue(10).await;
        let item = refresh(0);
        assert!(queue.enqueue(item.clone()).await.unwrap());
        assert!(!queue.enqueue(item).await.unwrap());
        assert_eq!(queue.len(), 1);
        assert_eq!(store.len(Collection::PendingSync), 1);
    }

    #[tokio::test]
    async fn test_queue_bound() {
        let (queue, _) = create_queue(2).await;
        queue.enqueue(refresh(0)).await.unwrap();
        queue.enqueue(refresh(0)).await.unwrap();
        assert!(matches!(
            queue.enqueue(refresh(0)).await,
            Err(IdentityError::SyncFailure(_))
        ));
    }

    #[tokio::test]
    async fn test_reconciled_items_do_not_count_against_bound() {
        let (queue, _) = create_queue(1).await;
        let item = refresh(0);
        let id = item.id;
        queue.enqueue(item).await.unwrap();
        queue.mark_in_flight(id).await.unwrap();
        queue.mark_reconciled(id, Utc::now()).await.unwrap();

        assert!(queue.enqueue(refresh(0)).await.unwrap());
    }

    #[tokio::test]
    async fn test_due_order_and_backoff() {
        let (queue, _) = create_queue(10).await;
        let low = refresh(0);
        let high = refresh(10);
        let waiting = refresh(20);
        let (low_id, high_id, waiting_id) = (low.id, high.id, waiting.id);
        for item in [low, high, waiting] {
            queue.enqueue(item).await.unwrap();
        }

        let now = Utc::now();
        queue.mark_in_flight(waiting_id).await.unwrap();
        queue
            .mark_failed(waiting_id, "timeout", now + Duration::minutes(5), false)
            .await
            .unwrap();

        let due: Vec<Uuid> = queue.due(now, 10).iter().map(|i| i.id).collect();
        assert_eq!(due, vec![high_id, low_id]);
        assert_eq!(queue.due(now + Duration::minutes(6), 1)[0].id, waiting_id);
    }

    #[tokio::test]
    async fn test_invalid_transition_rejected() {
        let (queue, store) = create_queue(10).await;
        let item = refresh(0);
        let id = item.id;
        queue.enqueue(item).await.unwrap();

        let err = queue.mark_reconciled(id, Utc::now()).await.unwrap_err();
        assert!(matches!(err, IdentityError::InvalidTransition { .. }));
        assert_eq!(queue.get(id).unwrap().state, PendingState::Pending);

        let persisted: PendingItem =
            crate::storage::get_json(store.as_ref(), Collection::PendingSync, &id.to_string())
                .await
                .unwrap()
                .unwrap();
        assert_eq!(persisted.state, PendingState::Pending);
    }

    #[tokio::test]
    async fn test_exhausted_items_are_parked_and_reset() {
        let (queue, _) = create_queue(10).await;
        let item = refresh(0);
        let id = item.id;
        queue.enqueue(item).await.unwrap();
        queue.mark_in_flight(id).await.unwrap();
        queue.mark_failed(id, "gone", Utc::now(), true).await.unwrap();

        assert!(queue.due(Utc::now() + Duration::days(1), 10).is_empty());
        assert_eq!(queue.counts().exhausted, 1);

        assert_eq!(queue.reset_exhausted().await.unwrap(), 1);
        let reset = queue.get(id).unwrap();
        assert_eq!(reset.attempts, 0);
        assert!(!reset.exhausted);
        assert_eq!(queue.due(Utc::now(), 10).len(), 1);
    }

    #[tokio::test]
    async fn test_open_recovers_in_flight() {
        let store = Arc::new(MemoryStore::new());
        let id = {
            let queue = PendingQueue::open(store.clone(), 10).await.unwrap();
            let item = refresh(0);
            let id = item.id;
            queue.enqueue(item).await.unwrap();
            queue.mark_in_flight(id).await.unwrap();
            id
        };

        let queue = PendingQueue::open(store, 10).await.unwrap();
        let item = queue.get(id).unwrap();
        assert_eq!(item.state, PendingState::Pending);
        assert_eq!(item.attempts, 1);
        assert_eq!(queue.counts().in_flight, 0);
    }

    #[tokio::test]
    async fn test_purge_reconciled() {
        let (queue, store) = create_queue(10).await;
        let item = refresh(0);
        let id = item.id;
        queue.enqueue(item).await.unwrap();
        queue.enqueue(refresh(0)).await.unwrap();

        let reconciled_at = Utc::now() - Duration::days(8);
        queue.mark_in_flight(id).await.unwrap();
        queue.mark_reconciled(id, reconciled_at).await.unwrap();

        let purged = queue
            .purge_reconciled(Utc::now() - Duration::days(7))
            .await
            .unwrap();
        assert_eq!(purged, 1);
        assert!(queue.get(id).is_none());
        assert_eq!(store.len(Collection::PendingSync), 1);
    }

    #[tokio::test]
    async fn test_outstanding_refresh_lookup() {
        let (queue, _) = create_queue(10).await;
        let credential_id = Uuid::new_v4();
        queue
            .enqueue(PendingItem::new(
                Uuid::new_v4(),
                PendingKind::CredentialRefresh { credential_id },
                0,
            ))
            .await
            .unwrap();
        assert!(queue.has_outstanding_refresh(credential_id));
        assert!(!queue.has_outstanding_refresh(Uuid::new_v4()));
    }
}
