//! Local merge engine.
//!
//! Applies normalized change-feed events to the local store. For every
//! incoming revision the engine resolves identity, applies the
//! closed-period cutoff, suppresses echoes of this terminal's own writes,
//! runs the optimistic-concurrency check and only then writes. Each write
//! touches exactly one record, and the read-decide-write section runs under
//! one lock with no await inside it.

use serde::Serialize;
use serde_json::{json, Map, Value};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::config::{ConflictPolicies, ConflictPolicy, SyncConfig};
use crate::conflict::ConflictLedger;
use crate::error::{Result, SyncError};
use crate::events::{EventBus, SyncEvent};
use crate::forward_sync::{self, ForwardSyncQueue, OutboundOperation};
use crate::items::OrderItemResolver;
use crate::models::{
    ChangeKind, ConflictRecord, Customer, CustomerAddress, EntityChange, EntityType, Order,
    OrderChange, OrderItemChange, OrderKey, OrderStatus, RawChange, RecordChange,
    ResolutionStrategy, SyncRecord, SyncStatus,
};
use crate::normalize::normalize_change;
use crate::store::LocalStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DiscardReason {
    /// Order belongs to a settled accounting period.
    ClosedPeriod,
    /// Echo of a write this terminal authored.
    SameOrigin,
    /// Remote version is older than the local one.
    Stale,
    /// Same version, local copy not older.
    NoOp,
    NotFound,
    /// Local record is a tombstone.
    Tombstoned,
    /// Local unacknowledged edits cover the changed data.
    LocalPending,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum MergeOutcome {
    Inserted,
    Updated,
    Tombstoned,
    Removed,
    Conflict { conflict_id: String },
    Discarded { reason: DiscardReason },
}

impl MergeOutcome {
    fn discarded(reason: DiscardReason) -> Self {
        MergeOutcome::Discarded { reason }
    }

    /// Whether the local store was written.
    pub fn changed_state(&self) -> bool {
        matches!(
            self,
            MergeOutcome::Inserted
                | MergeOutcome::Updated
                | MergeOutcome::Tombstoned
                | MergeOutcome::Removed
        )
    }
}

/// Fields a local edit may not touch directly.
const SYNC_MANAGED_FIELDS: &[&str] = &[
    "id",
    "remoteId",
    "version",
    "syncStatus",
    "pendingChanges",
    "lastSyncedAt",
    "isClosed",
    "closedReportId",
    "createdAt",
    "originTerminalId",
    "deletedAt",
];

/// Per-type store access so one merge path serves every record kind.
pub(crate) trait StoredRecord: SyncRecord {
    fn load(store: &dyn LocalStore, id: &str) -> Result<Option<Self>>;
    fn save(&self, store: &dyn LocalStore) -> Result<()>;
    fn tombstone(store: &dyn LocalStore, id: &str, at: chrono::DateTime<chrono::Utc>)
        -> Result<()>;
    fn purge(store: &dyn LocalStore, id: &str) -> Result<()>;
}

impl StoredRecord for Order {
    fn load(store: &dyn LocalStore, id: &str) -> Result<Option<Self>> {
        store.get_order(id)
    }
    fn save(&self, store: &dyn LocalStore) -> Result<()> {
        store.upsert_order(self)
    }
    fn tombstone(
        store: &dyn LocalStore,
        id: &str,
        at: chrono::DateTime<chrono::Utc>,
    ) -> Result<()> {
        store.soft_delete_order(id, at)
    }
    fn purge(store: &dyn LocalStore, id: &str) -> Result<()> {
        store.remove_order(id)
    }
}

impl StoredRecord for Customer {
    fn load(store: &dyn LocalStore, id: &str) -> Result<Option<Self>> {
        store.get_customer(id)
    }
    fn save(&self, store: &dyn LocalStore) -> Result<()> {
        store.upsert_customer(self)
    }
    fn tombstone(
        store: &dyn LocalStore,
        id: &str,
        at: chrono::DateTime<chrono::Utc>,
    ) -> Result<()> {
        store.soft_delete_customer(id, at)
    }
    fn purge(store: &dyn LocalStore, id: &str) -> Result<()> {
        store.remove_customer(id)
    }
}

impl StoredRecord for CustomerAddress {
    fn load(store: &dyn LocalStore, id: &str) -> Result<Option<Self>> {
        store.get_address(id)
    }
    fn save(&self, store: &dyn LocalStore) -> Result<()> {
        store.upsert_address(self)
    }
    fn tombstone(
        store: &dyn LocalStore,
        id: &str,
        at: chrono::DateTime<chrono::Utc>,
    ) -> Result<()> {
        store.soft_delete_address(id, at)
    }
    fn purge(store: &dyn LocalStore, id: &str) -> Result<()> {
        store.remove_address(id)
    }
}

enum Decision {
    Stale,
    NoOp,
    Conflict,
    Accept,
}

fn decide<T: SyncRecord>(ledger: &ConflictLedger, local: &T, remote: &T) -> Decision {
    if remote.version() < local.version() {
        Decision::Stale
    } else if remote.version() == local.version() && local.updated_at() >= remote.updated_at() {
        Decision::NoOp
    } else if ledger.detect(local, remote) {
        Decision::Conflict
    } else {
        Decision::Accept
    }
}

/// `record` with `fields` written over it, flagged as carrying those
/// fields unacknowledged.
fn with_pending<T: SyncRecord>(record: &T, fields: &Map<String, Value>) -> Result<T> {
    let mut value = serde_json::to_value(record)?;
    if let Value::Object(ref mut map) = value {
        for (key, field) in fields {
            map.insert(key.clone(), field.clone());
        }
        map.insert("syncStatus".into(), json!("pending"));
        map.insert("pendingChanges".into(), Value::Object(fields.clone()));
    }
    Ok(serde_json::from_value(value)?)
}

fn preserve_pending<T: SyncRecord>(record: T, pending: &Map<String, Value>) -> Result<T> {
    if pending.is_empty() {
        Ok(record)
    } else {
        with_pending(&record, pending)
    }
}

fn in_closed_period(order: &Order, settlement: Option<chrono::DateTime<chrono::Utc>>) -> bool {
    order.is_closed || settlement.is_some_and(|cutoff| order.created_at <= cutoff)
}

pub struct LocalMergeEngine {
    terminal_id: String,
    store: Arc<dyn LocalStore>,
    ledger: Arc<ConflictLedger>,
    resolver: Arc<OrderItemResolver>,
    forward: Option<Arc<ForwardSyncQueue>>,
    events: EventBus,
    clock: Arc<dyn Clock>,
    policies: ConflictPolicies,
    write_lock: Mutex<()>,
}

impl LocalMergeEngine {
    pub fn new(
        config: &SyncConfig,
        store: Arc<dyn LocalStore>,
        ledger: Arc<ConflictLedger>,
        resolver: Arc<OrderItemResolver>,
        events: EventBus,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            terminal_id: config.terminal_id.clone(),
            store,
            ledger,
            resolver,
            forward: None,
            events,
            clock,
            policies: config.conflict_policy.clone(),
            write_lock: Mutex::new(()),
        }
    }

    /// Queue used for local mutations and `local_wins` resolutions.
    pub fn with_forward_queue(mut self, queue: Arc<ForwardSyncQueue>) -> Self {
        self.forward = Some(queue);
        self
    }

    pub fn ledger(&self) -> &Arc<ConflictLedger> {
        &self.ledger
    }

    fn write_guard(&self) -> Result<MutexGuard<'_, ()>> {
        self.write_lock.lock().map_err(|_| SyncError::lock_poisoned())
    }

    fn forward(&self) -> Result<&Arc<ForwardSyncQueue>> {
        self.forward
            .as_ref()
            .ok_or(SyncError::MissingDependency("forward sync queue"))
    }

    fn is_own_echo(&self, origin: Option<&str>) -> bool {
        origin.is_some_and(|o| o == self.terminal_id)
    }

    // -----------------------------------------------------------------------
    // Remote changes
    // -----------------------------------------------------------------------

    /// Normalize and apply one raw change-feed event.
    pub async fn apply_raw(&self, raw: &RawChange) -> Result<MergeOutcome> {
        let change = normalize_change(raw)?;
        self.apply_change(change).await
    }

    /// Apply a batch; a failure only affects its own record.
    pub async fn apply_batch(&self, changes: &[RawChange]) -> Vec<Result<MergeOutcome>> {
        let mut outcomes = Vec::with_capacity(changes.len());
        for raw in changes {
            let outcome = self.apply_raw(raw).await;
            if let Err(e) = &outcome {
                warn!(table = %raw.table, error = %e, "change could not be merged");
            }
            outcomes.push(outcome);
        }
        outcomes
    }

    pub async fn apply_change(&self, change: EntityChange) -> Result<MergeOutcome> {
        let entity = change.entity_type();
        let outcome = match change {
            EntityChange::Order(change) => self.apply_order(change).await?,
            EntityChange::OrderItem(change) => self.merge_order_item(change)?,
            EntityChange::Customer(change) => self.merge_record(change)?,
            EntityChange::CustomerAddress(change) => self.merge_record(change)?,
        };
        if let MergeOutcome::Discarded { reason } = &outcome {
            debug!(entity = %entity, reason = ?reason, "remote change discarded");
        }
        Ok(outcome)
    }

    async fn apply_order(&self, change: OrderChange) -> Result<MergeOutcome> {
        if change.kind == ChangeKind::Delete {
            return self.delete_order(&change.key);
        }
        let mut remote = change
            .order
            .ok_or_else(|| SyncError::InvalidPayload("order change without a row".into()))?;

        // Resolve lines before taking the write lock; this may hit the network.
        if change.items_missing {
            let lookup = remote.remote_id.clone().unwrap_or_else(|| remote.id.clone());
            match self.resolver.resolve_items(&lookup).await {
                Ok(items) => remote.items = items,
                Err(e) => warn!(order_id = %lookup, error = %e, "order items unavailable"),
            }
        } else {
            self.resolver.complete_names(&mut remote.items);
        }
        let keep_local_items = remote.items.is_empty();

        self.merge_order(&change.key, remote, keep_local_items, change.status_override)
    }

    fn merge_order(
        &self,
        key: &OrderKey,
        mut remote: Order,
        keep_local_items: bool,
        status_override: bool,
    ) -> Result<MergeOutcome> {
        let _guard = self.write_guard()?;
        let now = self.clock.now();
        let settlement = self.store.last_settlement_at()?;

        let Some(local) = self.store.find_order(key)? else {
            if in_closed_period(&remote, settlement) {
                return Ok(MergeOutcome::discarded(DiscardReason::ClosedPeriod));
            }
            remote.last_synced_at = Some(now);
            self.store.upsert_order(&remote)?;
            info!(
                order_id = %remote.id,
                order_number = ?remote.order_number,
                status = %remote.status,
                "remote order ingested"
            );
            self.events.emit(SyncEvent::OrderCreated {
                order_id: remote.id.clone(),
            });
            return Ok(MergeOutcome::Inserted);
        };

        if local.is_deleted() {
            return Ok(MergeOutcome::discarded(DiscardReason::Tombstoned));
        }
        if in_closed_period(&local, settlement) {
            return Ok(MergeOutcome::discarded(DiscardReason::ClosedPeriod));
        }
        if self.is_own_echo(remote.origin()) {
            return Ok(MergeOutcome::discarded(DiscardReason::SameOrigin));
        }

        // Compare under the local identity.
        remote.id = local.id.clone();
        remote.remote_id = remote.remote_id.or_else(|| local.remote_id.clone());
        if remote.order_number.is_none() {
            remote.order_number = local.order_number.clone();
        }
        if keep_local_items {
            remote.items = local.items.clone();
        }

        match decide(&self.ledger, &local, &remote) {
            Decision::Stale => return Ok(MergeOutcome::discarded(DiscardReason::Stale)),
            Decision::NoOp => return Ok(MergeOutcome::discarded(DiscardReason::NoOp)),
            Decision::Conflict => {
                let conflict_id = self.ledger.create_conflict_record(&local, &remote);
                self.auto_resolve(EntityType::Order, &conflict_id);
                return Ok(MergeOutcome::Conflict { conflict_id });
            }
            Decision::Accept => {}
        }

        let mut merged = remote;
        if local.status.is_terminal() && !merged.status.is_terminal() && !status_override {
            debug!(
                order_id = %local.id,
                kept = %local.status,
                incoming = %merged.status,
                "terminal status kept"
            );
            merged.status = local.status;
        }
        merged.is_closed |= local.is_closed;
        if merged.closed_report_id.is_none() {
            merged.closed_report_id = local.closed_report_id.clone();
        }
        merged.version = merged.version.max(local.version);
        merged.last_synced_at = Some(now);
        let merged = preserve_pending(merged, &local.pending_changes)?;

        self.store.upsert_order(&merged)?;
        if merged.status != local.status {
            info!(
                order_id = %merged.id,
                from = %local.status,
                to = %merged.status,
                "order status updated from remote"
            );
            self.events.emit(SyncEvent::OrderStatusUpdated {
                order_id: merged.id.clone(),
                from: local.status,
                to: merged.status,
            });
        } else {
            self.events.emit(SyncEvent::RecordUpdated {
                entity_type: EntityType::Order,
                entity_id: merged.id.clone(),
            });
        }
        Ok(MergeOutcome::Updated)
    }

    fn delete_order(&self, key: &OrderKey) -> Result<MergeOutcome> {
        let _guard = self.write_guard()?;
        let Some(local) = self.store.find_order(key)? else {
            return Ok(MergeOutcome::discarded(DiscardReason::NotFound));
        };
        // Settled orders are never removed, not even as tombstones.
        if in_closed_period(&local, self.store.last_settlement_at()?) {
            return Ok(MergeOutcome::discarded(DiscardReason::ClosedPeriod));
        }
        let outcome = self.delete_local(&local)?;
        self.events.emit(SyncEvent::OrderDeleted {
            order_id: local.id.clone(),
        });
        Ok(outcome)
    }

    fn delete_local<T: StoredRecord>(&self, local: &T) -> Result<MergeOutcome> {
        if local.is_deleted() {
            return Ok(MergeOutcome::discarded(DiscardReason::NoOp));
        }
        if local.has_been_synced() {
            T::tombstone(self.store.as_ref(), local.id(), self.clock.now())?;
            info!(entity = %T::ENTITY, id = %local.id(), "record tombstoned");
            Ok(MergeOutcome::Tombstoned)
        } else {
            T::purge(self.store.as_ref(), local.id())?;
            info!(entity = %T::ENTITY, id = %local.id(), "local-only record removed");
            Ok(MergeOutcome::Removed)
        }
    }

    fn merge_order_item(&self, change: OrderItemChange) -> Result<MergeOutcome> {
        let _guard = self.write_guard()?;
        let key = OrderKey {
            id: Some(change.order_id.clone()),
            remote_id: Some(change.order_id.clone()),
            order_number: None,
        };
        let Some(mut parent) = self.store.find_order(&key)? else {
            return Ok(MergeOutcome::discarded(DiscardReason::NotFound));
        };
        if parent.is_deleted() {
            return Ok(MergeOutcome::discarded(DiscardReason::Tombstoned));
        }
        if in_closed_period(&parent, self.store.last_settlement_at()?) {
            return Ok(MergeOutcome::discarded(DiscardReason::ClosedPeriod));
        }
        if parent.pending_changes.contains_key("items") {
            return Ok(MergeOutcome::discarded(DiscardReason::LocalPending));
        }

        let position = change.item.id.as_deref().and_then(|id| {
            parent
                .items
                .iter()
                .position(|existing| existing.id.as_deref() == Some(id))
        });
        match change.kind {
            ChangeKind::Delete => match position {
                Some(index) => {
                    parent.items.remove(index);
                }
                None => return Ok(MergeOutcome::discarded(DiscardReason::NoOp)),
            },
            ChangeKind::Insert | ChangeKind::Update => {
                let mut item = change.item;
                let index = position.unwrap_or(parent.items.len());
                if item.name.trim().is_empty() {
                    item.name = self.resolver.display_name(index, &item, None);
                }
                match position {
                    Some(index) if parent.items[index] == item => {
                        return Ok(MergeOutcome::discarded(DiscardReason::NoOp));
                    }
                    Some(index) => parent.items[index] = item,
                    None => parent.items.push(item),
                }
            }
        }

        self.store.upsert_order(&parent)?;
        debug!(order_id = %parent.id, items = parent.items.len(), "order items patched");
        self.events.emit(SyncEvent::RecordUpdated {
            entity_type: EntityType::Order,
            entity_id: parent.id.clone(),
        });
        Ok(MergeOutcome::Updated)
    }

    fn merge_record<T: StoredRecord>(&self, change: RecordChange<T>) -> Result<MergeOutcome> {
        let _guard = self.write_guard()?;
        let now = self.clock.now();
        let local = T::load(self.store.as_ref(), &change.id)?;

        if change.kind == ChangeKind::Delete {
            return match local {
                Some(local) => self.delete_local(&local),
                None => Ok(MergeOutcome::discarded(DiscardReason::NotFound)),
            };
        }

        let mut remote = change.record.ok_or_else(|| {
            SyncError::InvalidPayload(format!("{} change without a row", T::ENTITY))
        })?;

        let Some(local) = local else {
            remote.mark_synced(now);
            remote.save(self.store.as_ref())?;
            self.events.emit(SyncEvent::RecordUpdated {
                entity_type: T::ENTITY,
                entity_id: remote.id().to_string(),
            });
            return Ok(MergeOutcome::Inserted);
        };

        if local.is_deleted() {
            return Ok(MergeOutcome::discarded(DiscardReason::Tombstoned));
        }
        if self.is_own_echo(remote.origin()) {
            return Ok(MergeOutcome::discarded(DiscardReason::SameOrigin));
        }
        match decide(&self.ledger, &local, &remote) {
            Decision::Stale => return Ok(MergeOutcome::discarded(DiscardReason::Stale)),
            Decision::NoOp => return Ok(MergeOutcome::discarded(DiscardReason::NoOp)),
            Decision::Conflict => {
                let conflict_id = self.ledger.create_conflict_record(&local, &remote);
                self.auto_resolve(T::ENTITY, &conflict_id);
                return Ok(MergeOutcome::Conflict { conflict_id });
            }
            Decision::Accept => {}
        }

        remote.set_version(remote.version().max(local.version()));
        remote.mark_synced(now);
        let merged = preserve_pending(remote, local.pending_changes())?;
        merged.save(self.store.as_ref())?;
        self.events.emit(SyncEvent::RecordUpdated {
            entity_type: T::ENTITY,
            entity_id: merged.id().to_string(),
        });
        Ok(MergeOutcome::Updated)
    }

    // -----------------------------------------------------------------------
    // Conflict resolution
    // -----------------------------------------------------------------------

    fn auto_resolve(&self, entity: EntityType, conflict_id: &str) {
        let strategy = match self.policies.for_entity(entity) {
            ConflictPolicy::Manual => return,
            ConflictPolicy::RemoteWins => ResolutionStrategy::RemoteWins,
            ConflictPolicy::LocalWins => ResolutionStrategy::LocalWins,
        };
        match self.resolve_locked(conflict_id, strategy) {
            Ok(_) => info!(
                conflict_id = %conflict_id,
                strategy = strategy.as_str(),
                "conflict auto-resolved"
            ),
            Err(SyncError::NotFound { .. }) => warn!(
                conflict_id = %conflict_id,
                entity_type = entity.as_str(),
                "conflict record was never persisted, cannot auto-resolve"
            ),
            Err(e) => warn!(
                conflict_id = %conflict_id,
                error = %e,
                "automatic conflict resolution failed, left open"
            ),
        }
    }

    /// Settle an open conflict. Resolving an already resolved conflict
    /// returns it unchanged.
    pub fn resolve_conflict(
        &self,
        conflict_id: &str,
        strategy: ResolutionStrategy,
    ) -> Result<ConflictRecord> {
        let _guard = self.write_guard()?;
        self.resolve_locked(conflict_id, strategy)
    }

    fn resolve_locked(
        &self,
        conflict_id: &str,
        strategy: ResolutionStrategy,
    ) -> Result<ConflictRecord> {
        let record = self.ledger.get(conflict_id)?;
        if record.is_resolved() {
            return Ok(record);
        }
        match record.entity_type {
            EntityType::Order | EntityType::OrderItem => {
                self.apply_resolution::<Order>(&record, strategy)?
            }
            EntityType::Customer => self.apply_resolution::<Customer>(&record, strategy)?,
            EntityType::CustomerAddress => {
                self.apply_resolution::<CustomerAddress>(&record, strategy)?
            }
        }
        self.ledger.record_resolution(conflict_id, strategy)
    }

    fn apply_resolution<T: StoredRecord>(
        &self,
        record: &ConflictRecord,
        strategy: ResolutionStrategy,
    ) -> Result<()> {
        let now = self.clock.now();
        let remote: T = serde_json::from_value(record.remote_snapshot.clone())?;
        let local: T = match T::load(self.store.as_ref(), &record.entity_id)? {
            Some(current) => current,
            None => serde_json::from_value(record.local_snapshot.clone())?,
        };
        let local_version = local.version();
        let top = local_version.max(remote.version());
        let pending = local.pending_changes().clone();

        let resolved = match strategy {
            ResolutionStrategy::RemoteWins => {
                let mut resolved = remote;
                resolved.set_version(top);
                resolved.mark_synced(now);
                resolved
            }
            ResolutionStrategy::LocalWins => {
                let mut resolved = with_pending(&local, &pending)?;
                resolved.set_version(top + 1);
                resolved
            }
            ResolutionStrategy::Merge if pending.is_empty() => {
                let mut resolved = remote;
                resolved.set_version(top);
                resolved.mark_synced(now);
                resolved
            }
            ResolutionStrategy::Merge => {
                let mut resolved = with_pending(&remote, &pending)?;
                resolved.set_version(top + 1);
                resolved
            }
        };

        // Writes queued at or below the local version lost the conflict or
        // are folded into the resolved record; none of them may go out.
        if let Some(forward) = &self.forward {
            forward.discard_superseded(T::ENTITY, &record.entity_id, local_version)?;
        }
        if resolved.has_pending_changes() {
            let forward = self.forward()?;
            resolved.save(self.store.as_ref())?;
            forward.enqueue(OutboundOperation::for_record("update", &resolved))?;
        } else {
            resolved.save(self.store.as_ref())?;
        }
        self.events.emit(SyncEvent::RecordUpdated {
            entity_type: T::ENTITY,
            entity_id: resolved.id().to_string(),
        });
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Local mutations
    // -----------------------------------------------------------------------

    /// Store a new order authored on this terminal and queue it for the
    /// remote store.
    pub fn create_local_order(&self, mut order: Order) -> Result<Order> {
        let forward = self.forward()?;
        let _guard = self.write_guard()?;
        if self.store.get_order(&order.id)?.is_some() {
            return Err(SyncError::InvalidPayload(format!(
                "order {} already exists",
                order.id
            )));
        }
        let now = self.clock.now();
        if order.origin_terminal_id.is_none() {
            order.origin_terminal_id = Some(self.terminal_id.clone());
        }
        order.updated_by = Some(self.terminal_id.clone());
        order.version = order.version.max(1);
        order.sync_status = SyncStatus::Pending;
        order.updated_at = now;
        self.resolver.complete_names(&mut order.items);

        self.store.upsert_order(&order)?;
        forward.enqueue(OutboundOperation::for_record("insert", &order))?;
        info!(order_id = %order.id, "local order created");
        self.events.emit(SyncEvent::OrderCreated {
            order_id: order.id.clone(),
        });
        Ok(order)
    }

    /// Apply an operator edit (camelCase field map) to a local order: bumps
    /// the version, records the fields as pending and queues delivery.
    pub fn record_local_order_change(
        &self,
        order_id: &str,
        changes: Map<String, Value>,
    ) -> Result<Order> {
        let forward = self.forward()?;
        let _guard = self.write_guard()?;
        let order = self
            .store
            .get_order(order_id)?
            .filter(|o| !o.is_deleted())
            .ok_or_else(|| SyncError::NotFound {
                entity: "order",
                id: order_id.to_string(),
            })?;
        if in_closed_period(&order, self.store.last_settlement_at()?) {
            return Err(SyncError::InvalidPayload(format!(
                "order {order_id} belongs to a closed period"
            )));
        }
        if let Some(field) = changes
            .keys()
            .find(|k| SYNC_MANAGED_FIELDS.contains(&k.as_str()))
        {
            return Err(SyncError::InvalidPayload(format!(
                "field {field} is managed by sync"
            )));
        }
        if changes.is_empty() {
            return Ok(order);
        }
        if let Some(raw) = changes.get("status") {
            let next: OrderStatus = serde_json::from_value(raw.clone())
                .map_err(|_| SyncError::InvalidPayload(format!("unknown status {raw}")))?;
            if !order.status.can_transition_to(next) {
                return Err(SyncError::InvalidPayload(format!(
                    "invalid status transition {} -> {}",
                    order.status, next
                )));
            }
        }

        let now = self.clock.now();
        let mut pending = order.pending_changes.clone();
        pending.extend(changes.iter().map(|(k, v)| (k.clone(), v.clone())));
        let mut updated = with_pending(&order, &pending)?;
        updated.version = order.version + 1;
        updated.updated_at = now;
        updated.updated_by = Some(self.terminal_id.clone());

        self.store.upsert_order(&updated)?;
        let operation = if changes.len() == 1 && changes.contains_key("status") {
            "status_update"
        } else {
            "update"
        };
        forward.enqueue(OutboundOperation::for_record(operation, &updated))?;

        if updated.status != order.status {
            info!(
                order_id = %order_id,
                from = %order.status,
                to = %updated.status,
                "local order status changed"
            );
            self.events.emit(SyncEvent::OrderStatusUpdated {
                order_id: order_id.to_string(),
                from: order.status,
                to: updated.status,
            });
        }
        Ok(updated)
    }

    /// Remote acknowledgement of a local order write at `version`.
    pub fn acknowledge_order(
        &self,
        order_id: &str,
        remote_id: Option<String>,
        version: i64,
    ) -> Result<()> {
        let _guard = self.write_guard()?;
        forward_sync::acknowledge_order(
            self.store.as_ref(),
            order_id,
            remote_id,
            version,
            self.clock.now(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::db;
    use crate::forward_sync::{DeliveryEndpoint, FlushReport, QueueEntry};
    use crate::items::ItemSource;
    use crate::store::SqliteStore;
    use async_trait::async_trait;
    use chrono::{Duration, TimeZone, Utc};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct NoItems;

    #[async_trait]
    impl ItemSource for NoItems {
        async fn fetch_items(&self, _order_id: &str) -> Result<Vec<Value>> {
            Ok(vec![json!({"id": "line-1", "menu_item_id": "X", "unit_price": 4.5})])
        }
    }

    /// Acknowledges everything and keeps what it was sent.
    #[derive(Default)]
    struct Accepting {
        sent: Mutex<Vec<(String, Value)>>,
    }

    impl Accepting {
        fn keys(&self) -> Vec<String> {
            self.sent.lock().unwrap().iter().map(|(k, _)| k.clone()).collect()
        }
    }

    #[async_trait]
    impl DeliveryEndpoint for Accepting {
        async fn deliver(&self, entry: &QueueEntry) -> Result<Value> {
            self.sent
                .lock()
                .unwrap()
                .push((entry.idempotency_key.clone(), entry.payload.clone()));
            Ok(json!({"success": true}))
        }
    }

    struct Harness {
        engine: LocalMergeEngine,
        store: Arc<SqliteStore>,
        queue: Arc<ForwardSyncQueue>,
        endpoint: Arc<Accepting>,
        clock: Arc<ManualClock>,
        events: EventBus,
    }

    fn harness_with(config: SyncConfig) -> Harness {
        let db = Arc::new(db::open_in_memory().unwrap());
        let store = Arc::new(SqliteStore::new(Arc::clone(&db)));
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2026, 3, 2, 12, 0, 0).unwrap(),
        ));
        let events = EventBus::new();
        let ledger = Arc::new(ConflictLedger::new(
            store.clone(),
            events.clone(),
            clock.clone(),
        ));
        let resolver = Arc::new(OrderItemResolver::new(Arc::new(NoItems), None, "€"));
        let endpoint = Arc::new(Accepting::default());
        let queue = Arc::new(ForwardSyncQueue::new(
            db,
            store.clone(),
            endpoint.clone(),
            events.clone(),
            clock.clone(),
            &config,
        ));
        let engine = LocalMergeEngine::new(
            &config,
            store.clone(),
            ledger,
            resolver,
            events.clone(),
            clock.clone(),
        )
        .with_forward_queue(queue.clone());
        Harness {
            engine,
            store,
            queue,
            endpoint,
            clock,
            events,
        }
    }

    fn harness() -> Harness {
        harness_with(SyncConfig {
            terminal_id: "term-1".into(),
            ..SyncConfig::default()
        })
    }

    fn order_row(version: i64, status: &str, updated_at: &str) -> Value {
        json!({
            "id": "remote-a",
            "client_order_id": "A",
            "order_number": "ORD-0001",
            "status": status,
            "order_type": "pickup",
            "items": [{"id": "line-1", "name": "Espresso", "quantity": 1, "unit_price": 2.5}],
            "total_amount": 2.5,
            "version": version,
            "terminal_id": "term-2",
            "created_at": "2026-03-02T09:00:00Z",
            "updated_at": updated_at,
        })
    }

    fn change(table: &str, kind: ChangeKind, row: Value) -> RawChange {
        let (new, old) = match kind {
            ChangeKind::Delete => (Value::Null, row),
            _ => (row, Value::Null),
        };
        RawChange {
            table: table.into(),
            event_type: kind,
            new,
            old,
        }
    }

    fn upsert(v: i64, status: &str, at: &str) -> RawChange {
        change("orders", ChangeKind::Update, order_row(v, status, at))
    }

    fn count_events(events: &EventBus, pick: fn(&SyncEvent) -> bool) -> (Arc<AtomicUsize>, crate::events::Subscription) {
        let count = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&count);
        let sub = events.on(move |e| {
            if pick(e) {
                seen.fetch_add(1, Ordering::SeqCst);
            }
        });
        (count, sub)
    }

    #[tokio::test]
    async fn remote_insert_is_ingested_once() {
        let h = harness();
        let (created, _sub) = count_events(&h.events, |e| matches!(e, SyncEvent::OrderCreated { .. }));
        let insert = change(
            "orders",
            ChangeKind::Insert,
            order_row(1, "pending", "2026-03-02T09:00:00Z"),
        );
        assert_eq!(h.engine.apply_raw(&insert).await.unwrap(), MergeOutcome::Inserted);
        let first = h.store.get_order("A").unwrap().unwrap();

        assert_eq!(
            h.engine.apply_raw(&insert).await.unwrap(),
            MergeOutcome::Discarded {
                reason: DiscardReason::NoOp
            }
        );
        assert_eq!(h.store.get_order("A").unwrap().unwrap(), first);
        assert_eq!(created.load(Ordering::SeqCst), 1);
        assert_eq!(first.remote_id.as_deref(), Some("remote-a"));
    }

    #[tokio::test]
    async fn same_update_twice_matches_once() {
        let h = harness();
        h.engine
            .apply_raw(&upsert(1, "pending", "2026-03-02T09:00:00Z"))
            .await
            .unwrap();
        let update = upsert(2, "confirmed", "2026-03-02T09:05:00Z");
        assert_eq!(h.engine.apply_raw(&update).await.unwrap(), MergeOutcome::Updated);
        let once = h.store.get_order("A").unwrap().unwrap();
        h.engine.apply_raw(&update).await.unwrap();
        assert_eq!(h.store.get_order("A").unwrap().unwrap(), once);
        assert_eq!(once.version, 2);
    }

    #[tokio::test]
    async fn stale_revisions_never_lower_the_version() {
        let h = harness();
        h.engine
            .apply_raw(&upsert(5, "preparing", "2026-03-02T09:30:00Z"))
            .await
            .unwrap();
        let outcome = h
            .engine
            .apply_raw(&upsert(3, "pending", "2026-03-02T09:45:00Z"))
            .await
            .unwrap();
        assert_eq!(
            outcome,
            MergeOutcome::Discarded {
                reason: DiscardReason::Stale
            }
        );
        let stored = h.store.get_order("A").unwrap().unwrap();
        assert_eq!(stored.version, 5);
        assert_eq!(stored.status, OrderStatus::Preparing);
    }

    #[tokio::test]
    async fn terminal_status_is_sticky_against_non_terminal_updates() {
        let h = harness();
        h.engine
            .apply_raw(&upsert(1, "completed", "2026-03-02T09:00:00Z"))
            .await
            .unwrap();

        h.engine
            .apply_raw(&upsert(2, "preparing", "2026-03-02T10:00:00Z"))
            .await
            .unwrap();
        let stored = h.store.get_order("A").unwrap().unwrap();
        assert_eq!(stored.status, OrderStatus::Completed);
        assert_eq!(stored.version, 2);

        h.engine
            .apply_raw(&upsert(3, "cancelled", "2026-03-02T10:05:00Z"))
            .await
            .unwrap();
        let stored = h.store.get_order("A").unwrap().unwrap();
        assert_eq!(stored.status, OrderStatus::Cancelled);
    }

    #[tokio::test]
    async fn explicit_override_reopens_terminal_status() {
        let h = harness();
        h.engine
            .apply_raw(&upsert(1, "cancelled", "2026-03-02T09:00:00Z"))
            .await
            .unwrap();
        let mut row = order_row(2, "pending", "2026-03-02T09:10:00Z");
        row["status_override"] = json!(true);
        h.engine
            .apply_raw(&change("orders", ChangeKind::Update, row))
            .await
            .unwrap();
        let stored = h.store.get_order("A").unwrap().unwrap();
        assert_eq!(stored.status, OrderStatus::Pending);
    }

    #[tokio::test]
    async fn settled_orders_are_immutable() {
        let h = harness();
        h.engine
            .apply_raw(&upsert(1, "ready", "2026-03-02T09:00:00Z"))
            .await
            .unwrap();
        let before = h.store.get_order("A").unwrap().unwrap();
        h.store
            .set_last_settlement_at(Utc.with_ymd_and_hms(2026, 3, 2, 9, 0, 0).unwrap())
            .unwrap();

        for raw in [
            upsert(2, "completed", "2026-03-02T11:00:00Z"),
            change(
                "orders",
                ChangeKind::Delete,
                json!({"id": "remote-a", "client_order_id": "A"}),
            ),
            change(
                "order_items",
                ChangeKind::Insert,
                json!({"id": "line-2", "order_id": "remote-a", "unit_price": 1}),
            ),
        ] {
            assert_eq!(
                h.engine.apply_raw(&raw).await.unwrap(),
                MergeOutcome::Discarded {
                    reason: DiscardReason::ClosedPeriod
                }
            );
        }
        assert_eq!(h.store.get_order("A").unwrap().unwrap(), before);
    }

    #[tokio::test]
    async fn own_echo_is_suppressed() {
        let h = harness();
        h.engine
            .apply_raw(&upsert(1, "pending", "2026-03-02T09:00:00Z"))
            .await
            .unwrap();
        let mut row = order_row(2, "confirmed", "2026-03-02T09:10:00Z");
        row["terminal_id"] = json!("term-1");
        assert_eq!(
            h.engine
                .apply_raw(&change("orders", ChangeKind::Update, row))
                .await
                .unwrap(),
            MergeOutcome::Discarded {
                reason: DiscardReason::SameOrigin
            }
        );
    }

    #[tokio::test]
    async fn concurrent_edit_records_conflict_and_leaves_local_untouched() {
        let h = harness();
        let (conflicts, _sub) = count_events(&h.events, |e| matches!(e, SyncEvent::Conflict(_)));
        h.engine
            .apply_raw(&upsert(2, "confirmed", "2026-03-02T09:00:00Z"))
            .await
            .unwrap();
        let mut edit = Map::new();
        edit.insert("totalAmount".into(), json!(9.0));
        let local = h.engine.record_local_order_change("A", edit).unwrap();
        assert_eq!(local.version, 3);

        let mut row = order_row(4, "confirmed", "2026-03-02T09:20:00Z");
        row["total_amount"] = json!(12.0);
        let remote = change("orders", ChangeKind::Update, row);
        let outcome = h.engine.apply_raw(&remote).await.unwrap();
        let MergeOutcome::Conflict { conflict_id } = outcome else {
            panic!("expected conflict, got {outcome:?}");
        };
        // Redelivery neither duplicates the record nor re-notifies.
        h.engine.apply_raw(&remote).await.unwrap();

        assert_eq!(h.store.get_order("A").unwrap().unwrap(), local);
        assert_eq!(conflicts.load(Ordering::SeqCst), 1);
        let open = h.engine.ledger().list_open().unwrap();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].id, conflict_id);
        assert_eq!((open[0].local_version, open[0].remote_version), (3, 4));
    }

    #[tokio::test]
    async fn local_wins_bumps_above_remote_and_requeues() {
        let h = harness();
        h.engine
            .apply_raw(&upsert(1, "pending", "2026-03-02T09:00:00Z"))
            .await
            .unwrap();
        let mut edit = Map::new();
        edit.insert("specialInstructions".into(), json!("no sugar"));
        h.engine.record_local_order_change("A", edit).unwrap();
        let outcome = h
            .engine
            .apply_raw(&upsert(3, "confirmed", "2026-03-02T09:30:00Z"))
            .await
            .unwrap();
        let MergeOutcome::Conflict { conflict_id } = outcome else {
            panic!("expected conflict");
        };

        let resolved = h
            .engine
            .resolve_conflict(&conflict_id, ResolutionStrategy::LocalWins)
            .unwrap();
        assert_eq!(resolved.resolution_strategy, Some(ResolutionStrategy::LocalWins));
        let stored = h.store.get_order("A").unwrap().unwrap();
        assert_eq!(stored.version, 4);
        assert_eq!(stored.special_instructions.as_deref(), Some("no sugar"));
        assert_eq!(stored.sync_status, SyncStatus::Pending);
        assert!(h
            .queue
            .entries()
            .unwrap()
            .iter()
            .any(|e| e.idempotency_key == "order:A:update:v4"));

        // The v2 edit is carried by the v4 update and never sent on its own.
        assert_eq!(h.queue.flush().await.unwrap().delivered, 1);
        assert_eq!(h.endpoint.keys(), vec!["order:A:update:v4"]);
        let stored = h.store.get_order("A").unwrap().unwrap();
        assert_eq!(stored.sync_status, SyncStatus::Synced);
    }

    #[tokio::test]
    async fn remote_wins_policy_drops_the_losing_local_edit_from_the_queue() {
        let mut config = SyncConfig {
            terminal_id: "term-1".into(),
            ..SyncConfig::default()
        };
        config.conflict_policy.orders = ConflictPolicy::RemoteWins;
        let h = harness_with(config);

        let mut row = order_row(1, "pending", "2026-03-02T09:00:00Z");
        row["total_amount"] = json!(5.0);
        h.engine
            .apply_raw(&change("orders", ChangeKind::Insert, row))
            .await
            .unwrap();
        let mut edit = Map::new();
        edit.insert("totalAmount".into(), json!(9.0));
        let local = h.engine.record_local_order_change("A", edit).unwrap();
        assert_eq!(local.version, 2);
        assert_eq!(h.queue.entries().unwrap().len(), 1);

        let mut row = order_row(4, "pending", "2026-03-02T09:20:00Z");
        row["total_amount"] = json!(12.0);
        let outcome = h
            .engine
            .apply_raw(&change("orders", ChangeKind::Update, row))
            .await
            .unwrap();
        assert!(matches!(outcome, MergeOutcome::Conflict { .. }));
        assert!(h.engine.ledger().list_open().unwrap().is_empty());

        let stored = h.store.get_order("A").unwrap().unwrap();
        assert_eq!(stored.total_amount, 12.0);
        assert_eq!(stored.version, 4);
        assert_eq!(stored.sync_status, SyncStatus::Synced);
        assert!(h.queue.entries().unwrap().is_empty());

        assert_eq!(h.queue.flush().await.unwrap(), FlushReport::default());
        assert!(h.endpoint.sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn auto_resolve_of_an_unpersisted_conflict_changes_nothing() {
        let mut config = SyncConfig {
            terminal_id: "term-1".into(),
            ..SyncConfig::default()
        };
        config.conflict_policy.orders = ConflictPolicy::RemoteWins;
        let h = harness_with(config);
        h.engine
            .apply_raw(&upsert(1, "pending", "2026-03-02T09:00:00Z"))
            .await
            .unwrap();
        let mut edit = Map::new();
        edit.insert("specialInstructions".into(), json!("no sugar"));
        let local = h.engine.record_local_order_change("A", edit).unwrap();

        h.engine.auto_resolve(EntityType::Order, "never-written");
        assert!(matches!(
            h.engine.resolve_conflict("never-written", ResolutionStrategy::RemoteWins),
            Err(SyncError::NotFound { .. })
        ));
        let stored = h.store.get_order("A").unwrap().unwrap();
        assert_eq!(stored.version, local.version);
        assert_eq!(stored.special_instructions.as_deref(), Some("no sugar"));
        assert_eq!(stored.sync_status, SyncStatus::Pending);
        assert_eq!(h.queue.entries().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn manual_remote_wins_resolution_discards_the_queued_edit() {
        let h = harness();
        h.engine
            .apply_raw(&upsert(1, "pending", "2026-03-02T09:00:00Z"))
            .await
            .unwrap();
        let mut edit = Map::new();
        edit.insert("specialInstructions".into(), json!("no sugar"));
        h.engine.record_local_order_change("A", edit).unwrap();
        let MergeOutcome::Conflict { conflict_id } = h
            .engine
            .apply_raw(&upsert(3, "confirmed", "2026-03-02T09:30:00Z"))
            .await
            .unwrap()
        else {
            panic!("expected conflict");
        };
        // Still queued while the conflict is open.
        assert_eq!(h.queue.entries().unwrap().len(), 1);

        h.engine
            .resolve_conflict(&conflict_id, ResolutionStrategy::RemoteWins)
            .unwrap();
        assert!(h.queue.entries().unwrap().is_empty());
        let stored = h.store.get_order("A").unwrap().unwrap();
        assert_eq!(stored.special_instructions, None);
        assert_eq!(stored.sync_status, SyncStatus::Synced);
    }

    #[tokio::test]
    async fn merge_resolution_overlays_local_fields_on_remote() {
        let h = harness();
        h.engine
            .apply_raw(&upsert(1, "pending", "2026-03-02T09:00:00Z"))
            .await
            .unwrap();
        let mut edit = Map::new();
        edit.insert("specialInstructions".into(), json!("extra hot"));
        h.engine.record_local_order_change("A", edit).unwrap();
        let MergeOutcome::Conflict { conflict_id } = h
            .engine
            .apply_raw(&upsert(4, "confirmed", "2026-03-02T09:30:00Z"))
            .await
            .unwrap()
        else {
            panic!("expected conflict");
        };
        h.engine
            .resolve_conflict(&conflict_id, ResolutionStrategy::Merge)
            .unwrap();
        let stored = h.store.get_order("A").unwrap().unwrap();
        assert_eq!(stored.status, OrderStatus::Confirmed);
        assert_eq!(stored.special_instructions.as_deref(), Some("extra hot"));
        assert_eq!(stored.version, 5);
    }

    #[tokio::test]
    async fn customer_conflicts_follow_configured_policy() {
        let mut config = SyncConfig {
            terminal_id: "term-1".into(),
            ..SyncConfig::default()
        };
        config.conflict_policy.customers = ConflictPolicy::RemoteWins;
        let h = harness_with(config);
        let (resolved, _sub) =
            count_events(&h.events, |e| matches!(e, SyncEvent::ConflictResolved(_)));

        let now = h.clock.now();
        let mut local = Customer {
            id: "c-1".into(),
            name: Some("Local Name".into()),
            phone: None,
            email: None,
            notes: None,
            is_banned: false,
            version: 2,
            updated_by: Some("term-1".into()),
            sync_status: SyncStatus::Pending,
            pending_changes: Map::new(),
            created_at: now,
            updated_at: now,
            last_synced_at: None,
            deleted_at: None,
        };
        local.pending_changes.insert("name".into(), json!("Local Name"));
        h.store.upsert_customer(&local).unwrap();

        let remote = change(
            "customers",
            ChangeKind::Update,
            json!({"id": "c-1", "name": "Remote Name", "version": 3, "updated_by": "admin",
                   "updated_at": "2026-03-02T13:00:00Z"}),
        );
        let outcome = h.engine.apply_raw(&remote).await.unwrap();
        assert!(matches!(outcome, MergeOutcome::Conflict { .. }));
        assert_eq!(resolved.load(Ordering::SeqCst), 1);

        let stored = h.store.get_customer("c-1").unwrap().unwrap();
        assert_eq!(stored.name.as_deref(), Some("Remote Name"));
        assert_eq!(stored.version, 3);
        assert_eq!(stored.sync_status, SyncStatus::Synced);
        assert!(h.engine.ledger().list_open().unwrap().is_empty());
    }

    #[tokio::test]
    async fn deletes_tombstone_synced_and_remove_local_only_records() {
        let h = harness();
        h.engine
            .apply_raw(&upsert(1, "pending", "2026-03-02T09:00:00Z"))
            .await
            .unwrap();
        let del = change(
            "orders",
            ChangeKind::Delete,
            json!({"id": "remote-a", "client_order_id": "A"}),
        );
        assert_eq!(h.engine.apply_raw(&del).await.unwrap(), MergeOutcome::Tombstoned);
        assert!(h.store.get_order("A").unwrap().unwrap().deleted_at.is_some());

        let local = Order::new_local("L-1", "term-1", h.clock.now());
        h.store.upsert_order(&local).unwrap();
        let del = change("orders", ChangeKind::Delete, json!({"id": "L-1"}));
        assert_eq!(h.engine.apply_raw(&del).await.unwrap(), MergeOutcome::Removed);
        assert!(h.store.get_order("L-1").unwrap().is_none());
    }

    #[tokio::test]
    async fn order_without_items_is_resolved() {
        let h = harness();
        let mut row = order_row(1, "pending", "2026-03-02T09:00:00Z");
        row["items"] = json!([]);
        h.engine
            .apply_raw(&change("orders", ChangeKind::Insert, row))
            .await
            .unwrap();
        let stored = h.store.get_order("A").unwrap().unwrap();
        assert_eq!(stored.items.len(), 1);
        assert_eq!(stored.items[0].name, "Item 1 (€4.50)");
    }

    #[tokio::test]
    async fn order_item_events_patch_the_parent() {
        let h = harness();
        h.engine
            .apply_raw(&upsert(1, "pending", "2026-03-02T09:00:00Z"))
            .await
            .unwrap();
        let add = change(
            "order_items",
            ChangeKind::Insert,
            json!({"id": "line-2", "order_id": "remote-a", "unit_price": "3.00", "quantity": 2}),
        );
        assert_eq!(h.engine.apply_raw(&add).await.unwrap(), MergeOutcome::Updated);
        assert_eq!(
            h.engine.apply_raw(&add).await.unwrap(),
            MergeOutcome::Discarded {
                reason: DiscardReason::NoOp
            }
        );
        let stored = h.store.get_order("A").unwrap().unwrap();
        assert_eq!(stored.items.len(), 2);
        assert_eq!(stored.items[1].name, "Item 2 (€3.00)");
        assert_eq!(stored.items[1].total_price, 6.0);

        let remove = change(
            "order_items",
            ChangeKind::Delete,
            json!({"id": "line-1", "order_id": "remote-a"}),
        );
        h.engine.apply_raw(&remove).await.unwrap();
        let stored = h.store.get_order("A").unwrap().unwrap();
        assert_eq!(stored.items.len(), 1);
        assert_eq!(stored.items[0].id.as_deref(), Some("line-2"));
    }

    #[tokio::test]
    async fn batch_failures_are_isolated() {
        let h = harness();
        let batch = vec![
            change("orders", ChangeKind::Insert, json!({"status": "pending"})),
            upsert(1, "pending", "2026-03-02T09:00:00Z"),
        ];
        let outcomes = h.engine.apply_batch(&batch).await;
        assert!(outcomes[0].is_err());
        assert_eq!(outcomes[1].as_ref().unwrap(), &MergeOutcome::Inserted);
    }

    #[test]
    fn local_changes_validate_transitions_and_managed_fields() {
        let h = harness();
        let order = Order::new_local("L-1", "term-1", h.clock.now());
        h.engine.create_local_order(order).unwrap();

        let mut bad = Map::new();
        bad.insert("status".into(), json!("ready"));
        assert!(h.engine.record_local_order_change("L-1", bad).is_err());

        let mut managed = Map::new();
        managed.insert("version".into(), json!(99));
        assert!(h.engine.record_local_order_change("L-1", managed).is_err());

        h.clock.advance(Duration::minutes(1));
        let mut ok = Map::new();
        ok.insert("status".into(), json!("confirmed"));
        let updated = h.engine.record_local_order_change("L-1", ok).unwrap();
        assert_eq!(updated.status, OrderStatus::Confirmed);
        assert_eq!(updated.version, 2);
        assert_eq!(updated.pending_changes.get("status"), Some(&json!("confirmed")));

        let keys: Vec<String> = h
            .queue
            .entries()
            .unwrap()
            .into_iter()
            .map(|e| e.idempotency_key)
            .collect();
        assert_eq!(keys, vec!["order:L-1:insert:v1", "order:L-1:status_update:v2"]);

        // Only the latest version clears the pending marker.
        h.engine.acknowledge_order("L-1", Some("r-1".into()), 1).unwrap();
        let stored = h.store.get_order("L-1").unwrap().unwrap();
        assert_eq!(stored.sync_status, SyncStatus::Pending);
        assert_eq!(stored.remote_id.as_deref(), Some("r-1"));
        h.engine.acknowledge_order("L-1", None, 2).unwrap();
        let stored = h.store.get_order("L-1").unwrap().unwrap();
        assert_eq!(stored.sync_status, SyncStatus::Synced);
        assert!(stored.pending_changes.is_empty());
    }
}
