//! Optimistic-concurrency conflict detection and the conflict record
//! lifecycle.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::clock::Clock;
use crate::error::{Result, SyncError};
use crate::events::{EventBus, SyncEvent};
use crate::models::{ConflictRecord, ConflictType, EntityType, ResolutionStrategy, SyncRecord};

/// Durable home for conflict records.
pub trait ConflictStore: Send + Sync {
    fn insert_conflict(&self, record: &ConflictRecord) -> Result<()>;
    fn find_open_conflict(
        &self,
        entity_type: EntityType,
        entity_id: &str,
        local_version: i64,
        remote_version: i64,
    ) -> Result<Option<ConflictRecord>>;
    fn get_conflict(&self, id: &str) -> Result<Option<ConflictRecord>>;
    fn list_open_conflicts(&self) -> Result<Vec<ConflictRecord>>;
    /// Returns false when the record was already resolved.
    fn mark_resolved(&self, id: &str, strategy: ResolutionStrategy, at: DateTime<Utc>)
        -> Result<bool>;
}

/// A remote revision conflicts with the local copy when the local copy
/// carries unacknowledged edits and the remote version did not fall behind
/// it. Stale remotes (`remote < local`) are filtered before this check.
pub fn detect_conflict(local_version: i64, remote_version: i64, local_has_pending: bool) -> bool {
    local_has_pending && remote_version >= local_version
}

pub struct ConflictLedger {
    store: Arc<dyn ConflictStore>,
    events: EventBus,
    clock: Arc<dyn Clock>,
}

impl ConflictLedger {
    pub fn new(store: Arc<dyn ConflictStore>, events: EventBus, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            events,
            clock,
        }
    }

    pub fn detect<T: SyncRecord>(&self, local: &T, remote: &T) -> bool {
        detect_conflict(local.version(), remote.version(), local.has_pending_changes())
    }

    /// Persist a conflict between `local` and `remote` and notify observers.
    ///
    /// An open record for the same entity and version pair is reused, so a
    /// redelivered event neither duplicates the record nor fires the
    /// notification again. Persistence failures are logged; the id is still
    /// returned and the caller must still refuse the merge.
    pub fn create_conflict_record<T: SyncRecord>(&self, local: &T, remote: &T) -> String {
        let entity_type = T::ENTITY;
        match self.store.find_open_conflict(
            entity_type,
            local.id(),
            local.version(),
            remote.version(),
        ) {
            Ok(Some(existing)) => {
                debug!(
                    conflict_id = %existing.id,
                    entity_id = %local.id(),
                    "conflict already recorded"
                );
                return existing.id;
            }
            Ok(None) => {}
            Err(e) => warn!(entity_id = %local.id(), error = %e, "conflict lookup failed"),
        }

        let record = ConflictRecord {
            id: Uuid::new_v4().to_string(),
            entity_id: local.id().to_string(),
            entity_type,
            local_version: local.version(),
            remote_version: remote.version(),
            local_snapshot: local.snapshot(),
            remote_snapshot: remote.snapshot(),
            conflict_type: ConflictType::VersionMismatch,
            created_at: self.clock.now(),
            resolved_at: None,
            resolution_strategy: None,
        };

        if let Err(e) = self.store.insert_conflict(&record) {
            error!(
                conflict_id = %record.id,
                entity_type = %entity_type,
                entity_id = %record.entity_id,
                error = %e,
                "failed to persist conflict record"
            );
        }

        warn!(
            conflict_id = %record.id,
            entity_type = %entity_type,
            entity_id = %record.entity_id,
            local_version = record.local_version,
            remote_version = record.remote_version,
            "sync conflict detected"
        );
        let id = record.id.clone();
        self.events.emit(SyncEvent::Conflict(record));
        id
    }

    pub fn get(&self, id: &str) -> Result<ConflictRecord> {
        self.store
            .get_conflict(id)?
            .ok_or_else(|| SyncError::NotFound {
                entity: "conflict",
                id: id.to_string(),
            })
    }

    pub fn list_open(&self) -> Result<Vec<ConflictRecord>> {
        self.store.list_open_conflicts()
    }

    /// Record how a conflict was settled and emit `ConflictResolved`.
    pub fn record_resolution(
        &self,
        id: &str,
        strategy: ResolutionStrategy,
    ) -> Result<ConflictRecord> {
        let now = self.clock.now();
        if !self.store.mark_resolved(id, strategy, now)? {
            return self.get(id);
        }
        let record = self.get(id)?;
        debug!(
            conflict_id = %id,
            strategy = strategy.as_str(),
            "conflict resolved"
        );
        self.events.emit(SyncEvent::ConflictResolved(record.clone()));
        Ok(record)
    }
}
