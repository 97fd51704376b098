//! Durable local→remote delivery queue.
//!
//! Every outbound write is persisted to `sync_queue` before any network
//! attempt. `flush()` claims due entries one at a time (`pending` →
//! `in_flight` in a single UPDATE, so two flushers never submit the same
//! entry), delivers them, and either deletes the row on acknowledgement or
//! reschedules it with exponential backoff. An entry that exhausts its
//! attempts is quarantined and reported, never dropped.
//!
//! Writes for one record leave in enqueue order: an entry is only due
//! once every older entry for the same record is gone, so a later status
//! change can never overtake (and acknowledge) a failed insert.

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rusqlite::{params, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::clock::Clock;
use crate::config::SyncConfig;
use crate::db::DbState;
use crate::error::{Result, SyncError};
use crate::events::{EventBus, SyncEvent};
use crate::models::{EntityType, SyncRecord};
use crate::normalize::{parse_timestamp, str_any};
use crate::store::{format_ts, LocalStore};

const MIN_RETRY_DELAY_MS: i64 = 1_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryStatus {
    Pending,
    InFlight,
    Quarantined,
}

impl EntryStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            EntryStatus::Pending => "pending",
            EntryStatus::InFlight => "in_flight",
            EntryStatus::Quarantined => "quarantined",
        }
    }

    fn parse(raw: &str) -> Self {
        match raw {
            "in_flight" => EntryStatus::InFlight,
            "quarantined" => EntryStatus::Quarantined,
            _ => EntryStatus::Pending,
        }
    }
}

/// Local state change held back until the remote side acknowledges.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DeferredUpdate {
    /// Mark the record synced if it is still at `version`.
    Acknowledge {
        entity_type: EntityType,
        entity_id: String,
        version: i64,
    },
}

/// An outbound write as handed to [`ForwardSyncQueue::enqueue`].
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundOperation {
    pub entity_type: EntityType,
    pub entity_id: String,
    /// `insert`, `update`, `status_update`, `payment_update`, ...
    pub operation: String,
    pub payload: Value,
    /// Stable per logical operation; retries reuse it.
    pub idempotency_key: String,
    pub deferred_update: Option<DeferredUpdate>,
}

impl OutboundOperation {
    /// Operation carrying a full record snapshot that acknowledges the
    /// record at its current version.
    pub fn for_record<T: SyncRecord>(operation: &str, record: &T) -> Self {
        Self {
            entity_type: T::ENTITY,
            entity_id: record.id().to_string(),
            operation: operation.to_string(),
            payload: record.snapshot(),
            idempotency_key: format!(
                "{}:{}:{}:v{}",
                T::ENTITY.as_str(),
                record.id(),
                operation,
                record.version()
            ),
            deferred_update: Some(DeferredUpdate::Acknowledge {
                entity_type: T::ENTITY,
                entity_id: record.id().to_string(),
                version: record.version(),
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct QueueEntry {
    pub id: i64,
    pub entity_type: EntityType,
    pub entity_id: String,
    pub operation: String,
    pub payload: Value,
    pub idempotency_key: String,
    pub deferred_update: Option<DeferredUpdate>,
    pub status: EntryStatus,
    pub attempts: u32,
    pub max_attempts: u32,
    pub retry_delay_ms: i64,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
}

/// Remote write acceptance. Implementations must be idempotent by
/// `entry.idempotency_key`; the queue may redeliver after a crash.
#[async_trait]
pub trait DeliveryEndpoint: Send + Sync {
    /// Returns the remote acknowledgement body.
    async fn deliver(&self, entry: &QueueEntry) -> Result<Value>;
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FlushReport {
    pub delivered: usize,
    pub retried: usize,
    pub quarantined: usize,
    /// Due entries another flusher had already claimed.
    pub skipped: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueStats {
    pub pending: i64,
    pub in_flight: i64,
    pub quarantined: i64,
    pub oldest_error: Option<String>,
    pub next_retry_at: Option<String>,
}

fn deterministic_jitter_ms(seed: i64) -> i64 {
    let positive = if seed < 0 { -seed } else { seed };
    (positive % 700) + 50
}

const ENTRY_COLUMNS: &str = "id, entity_type, entity_id, operation, payload, idempotency_key,
    deferred_update, status, attempts, max_attempts, retry_delay_ms, next_retry_at,
    last_error, created_at";

fn row_to_entry(row: &Row<'_>) -> rusqlite::Result<QueueEntry> {
    let entity_type: String = row.get(1)?;
    let payload: String = row.get(4)?;
    let deferred: Option<String> = row.get(6)?;
    let status: String = row.get(7)?;
    let next_retry_at: Option<String> = row.get(11)?;
    let created_at: Option<String> = row.get(13)?;
    Ok(QueueEntry {
        id: row.get(0)?,
        entity_type: EntityType::parse(&entity_type).unwrap_or(EntityType::Order),
        entity_id: row.get(2)?,
        operation: row.get(3)?,
        payload: serde_json::from_str(&payload).unwrap_or(Value::Null),
        idempotency_key: row.get(5)?,
        deferred_update: deferred.and_then(|raw| serde_json::from_str(&raw).ok()),
        status: EntryStatus::parse(&status),
        attempts: row.get(8)?,
        max_attempts: row.get(9)?,
        retry_delay_ms: row.get(10)?,
        next_retry_at: next_retry_at.as_deref().and_then(parse_timestamp),
        last_error: row.get(12)?,
        created_at: created_at.as_deref().and_then(parse_timestamp),
    })
}

/// Apply a deferred update once the remote side has accepted the write.
pub fn apply_deferred_update(
    store: &dyn LocalStore,
    update: &DeferredUpdate,
    ack: &Value,
    at: DateTime<Utc>,
) -> Result<()> {
    let DeferredUpdate::Acknowledge {
        entity_type,
        entity_id,
        version,
    } = update;
    match entity_type {
        EntityType::Order | EntityType::OrderItem => {
            let remote_id = acknowledged_remote_id(ack);
            acknowledge_order(store, entity_id, remote_id, *version, at)
        }
        EntityType::Customer => {
            if let Some(mut customer) = store.get_customer(entity_id)? {
                if customer.version == *version {
                    customer.mark_synced(at);
                    store.upsert_customer(&customer)?;
                }
            }
            Ok(())
        }
        EntityType::CustomerAddress => {
            if let Some(mut address) = store.get_address(entity_id)? {
                if address.version == *version {
                    address.mark_synced(at);
                    store.upsert_address(&address)?;
                }
            }
            Ok(())
        }
    }
}

/// Record the remote identity of a local order and, if no newer local
/// edit happened since `version` was sent, clear its pending fields.
pub fn acknowledge_order(
    store: &dyn LocalStore,
    order_id: &str,
    remote_id: Option<String>,
    version: i64,
    at: DateTime<Utc>,
) -> Result<()> {
    let Some(mut order) = store.get_order(order_id)? else {
        debug!(order_id = %order_id, "acknowledged order no longer exists locally");
        return Ok(());
    };
    if order.remote_id.is_none() {
        order.remote_id = remote_id;
    }
    if order.version == version {
        order.mark_synced(at);
    } else {
        debug!(
            order_id = %order_id,
            acked_version = version,
            local_version = order.version,
            "newer local edit pending, keeping order unsynced"
        );
    }
    store.upsert_order(&order)
}

/// Record version an entry was sent at, from its deferred acknowledgement.
fn sent_version(deferred: &str) -> Option<i64> {
    match serde_json::from_str::<DeferredUpdate>(deferred).ok()? {
        DeferredUpdate::Acknowledge { version, .. } => Some(version),
    }
}

fn acknowledged_remote_id(ack: &Value) -> Option<String> {
    const KEYS: &[&str] = &["remote_id", "remoteId", "order_id", "orderId", "id"];
    str_any(ack, KEYS)
        .or_else(|| ack.get("order").and_then(|o| str_any(o, KEYS)))
        .or_else(|| ack.get("data").and_then(|d| str_any(d, KEYS)))
}

pub struct ForwardSyncQueue {
    db: Arc<DbState>,
    store: Arc<dyn LocalStore>,
    endpoint: Arc<dyn DeliveryEndpoint>,
    events: EventBus,
    clock: Arc<dyn Clock>,
    max_attempts: u32,
    base_delay_ms: i64,
    max_delay_ms: i64,
}

impl ForwardSyncQueue {
    pub fn new(
        db: Arc<DbState>,
        store: Arc<dyn LocalStore>,
        endpoint: Arc<dyn DeliveryEndpoint>,
        events: EventBus,
        clock: Arc<dyn Clock>,
        config: &SyncConfig,
    ) -> Self {
        Self {
            db,
            store,
            endpoint,
            events,
            clock,
            max_attempts: config.forward_max_attempts,
            base_delay_ms: config.forward_base_delay_ms.max(MIN_RETRY_DELAY_MS),
            max_delay_ms: config.forward_max_delay_ms.max(MIN_RETRY_DELAY_MS),
        }
    }

    /// Persist an outbound write. Re-enqueueing an idempotency key that is
    /// already queued returns the existing entry.
    pub fn enqueue(&self, op: OutboundOperation) -> Result<i64> {
        let conn = self.db.lock()?;
        let now = format_ts(&self.clock.now());
        let deferred = op
            .deferred_update
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        conn.execute(
            "INSERT INTO sync_queue (
                entity_type, entity_id, operation, payload, idempotency_key,
                deferred_update, status, attempts, max_attempts, retry_delay_ms,
                created_at, updated_at
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'pending', 0, ?7, ?8, ?9, ?9)
             ON CONFLICT(idempotency_key) DO NOTHING",
            params![
                op.entity_type.as_str(),
                op.entity_id,
                op.operation,
                op.payload.to_string(),
                op.idempotency_key,
                deferred,
                self.max_attempts,
                self.base_delay_ms,
                now,
            ],
        )?;
        let id: i64 = conn.query_row(
            "SELECT id FROM sync_queue WHERE idempotency_key = ?1",
            params![op.idempotency_key],
            |row| row.get(0),
        )?;
        info!(
            entry_id = id,
            entity_type = %op.entity_type,
            entity_id = %op.entity_id,
            operation = %op.operation,
            "forward sync entry queued"
        );
        Ok(id)
    }

    /// Put entries a crashed process left `in_flight` back in line.
    pub fn recover(&self) -> Result<usize> {
        let conn = self.db.lock()?;
        let reset = conn.execute(
            "UPDATE sync_queue SET status = 'pending' WHERE status = 'in_flight'",
            [],
        )?;
        if reset > 0 {
            warn!(count = reset, "recovered in-flight forward sync entries");
        }
        Ok(reset)
    }

    pub fn get_entry(&self, id: i64) -> Result<Option<QueueEntry>> {
        let conn = self.db.lock()?;
        Ok(conn
            .query_row(
                &format!("SELECT {ENTRY_COLUMNS} FROM sync_queue WHERE id = ?1"),
                params![id],
                row_to_entry,
            )
            .optional()?)
    }

    pub fn entries(&self) -> Result<Vec<QueueEntry>> {
        let conn = self.db.lock()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {ENTRY_COLUMNS} FROM sync_queue ORDER BY id ASC"
        ))?;
        let entries = stmt
            .query_map([], row_to_entry)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(entries)
    }

    fn due_ids(&self, now: DateTime<Utc>) -> Result<Vec<i64>> {
        let conn = self.db.lock()?;
        let mut stmt = conn.prepare(
            "SELECT q.id FROM sync_queue q
             WHERE q.status = 'pending'
               AND (q.next_retry_at IS NULL OR q.next_retry_at <= ?1)
               AND NOT EXISTS (
                   SELECT 1 FROM sync_queue earlier
                   WHERE earlier.entity_type = q.entity_type
                     AND earlier.entity_id = q.entity_id
                     AND earlier.id < q.id
               )
             ORDER BY q.id ASC",
        )?;
        let ids = stmt
            .query_map(params![format_ts(&now)], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<i64>>>()?;
        Ok(ids)
    }

    /// Atomically move one entry from `pending` to `in_flight`.
    fn claim(&self, id: i64) -> Result<Option<QueueEntry>> {
        let conn = self.db.lock()?;
        let claimed = conn.execute(
            "UPDATE sync_queue SET status = 'in_flight', updated_at = ?1
             WHERE id = ?2 AND status = 'pending'",
            params![format_ts(&self.clock.now()), id],
        )?;
        if claimed == 0 {
            return Ok(None);
        }
        Ok(conn
            .query_row(
                &format!("SELECT {ENTRY_COLUMNS} FROM sync_queue WHERE id = ?1"),
                params![id],
                row_to_entry,
            )
            .optional()?)
    }

    /// Attempt delivery of every due entry. Entries unblocked by a delivery
    /// in this pass are picked up before returning.
    pub async fn flush(&self) -> Result<FlushReport> {
        let mut report = FlushReport::default();
        let mut attempted = HashSet::new();
        loop {
            let due: Vec<i64> = self
                .due_ids(self.clock.now())?
                .into_iter()
                .filter(|id| attempted.insert(*id))
                .collect();
            if due.is_empty() {
                break;
            }
            for id in due {
                let Some(entry) = self.claim(id)? else {
                    report.skipped += 1;
                    continue;
                };
                match self.endpoint.deliver(&entry).await {
                    Ok(ack) => {
                        self.complete(&entry, &ack)?;
                        report.delivered += 1;
                    }
                    Err(e) => {
                        if self.fail(&entry, &e)? {
                            report.quarantined += 1;
                        } else {
                            report.retried += 1;
                        }
                    }
                }
            }
        }
        if report != FlushReport::default() {
            debug!(
                delivered = report.delivered,
                retried = report.retried,
                quarantined = report.quarantined,
                skipped = report.skipped,
                "forward sync flush finished"
            );
        }
        Ok(report)
    }

    fn complete(&self, entry: &QueueEntry, ack: &Value) -> Result<()> {
        if let Some(update) = &entry.deferred_update {
            if let Err(e) =
                apply_deferred_update(self.store.as_ref(), update, ack, self.clock.now())
            {
                error!(
                    entry_id = entry.id,
                    entity_id = %entry.entity_id,
                    error = %e,
                    "failed to apply deferred update after delivery"
                );
            }
        }
        let conn = self.db.lock()?;
        conn.execute("DELETE FROM sync_queue WHERE id = ?1", params![entry.id])?;
        info!(
            entry_id = entry.id,
            entity_type = %entry.entity_type,
            entity_id = %entry.entity_id,
            "forward sync entry delivered"
        );
        Ok(())
    }

    /// Record a failed attempt. Returns true when the entry got quarantined.
    fn fail(&self, entry: &QueueEntry, err: &SyncError) -> Result<bool> {
        let attempts = entry.attempts + 1;
        let message = err.to_string();
        let now = self.clock.now();

        if attempts >= entry.max_attempts {
            {
                let conn = self.db.lock()?;
                conn.execute(
                    "UPDATE sync_queue
                     SET status = 'quarantined', attempts = ?1, next_retry_at = NULL,
                         last_error = ?2, updated_at = ?3
                     WHERE id = ?4",
                    params![attempts, message, format_ts(&now), entry.id],
                )?;
            }
            warn!(
                entry_id = entry.id,
                entity_type = %entry.entity_type,
                entity_id = %entry.entity_id,
                attempts,
                error = %message,
                "forward sync entry quarantined"
            );
            self.events.emit(SyncEvent::PermanentFailure {
                entry_id: entry.id,
                entity_id: entry.entity_id.clone(),
                attempts,
                last_error: message,
            });
            return Ok(true);
        }

        let delay = entry.retry_delay_ms.clamp(MIN_RETRY_DELAY_MS, self.max_delay_ms);
        let next_retry_at =
            now + ChronoDuration::milliseconds(delay + deterministic_jitter_ms(entry.id));
        let next_delay = (delay * 2).min(self.max_delay_ms);
        {
            let conn = self.db.lock()?;
            conn.execute(
                "UPDATE sync_queue
                 SET status = 'pending', attempts = ?1, next_retry_at = ?2,
                     retry_delay_ms = ?3, last_error = ?4, updated_at = ?5
                 WHERE id = ?6",
                params![
                    attempts,
                    format_ts(&next_retry_at),
                    next_delay,
                    message,
                    format_ts(&now),
                    entry.id
                ],
            )?;
        }
        if err.is_transient() {
            debug!(entry_id = entry.id, attempts, error = %message, "forward sync retry scheduled");
        } else {
            warn!(entry_id = entry.id, attempts, error = %message, "forward sync rejected, will retry");
        }
        self.events.emit(SyncEvent::RetryScheduled {
            entry_id: entry.id,
            entity_id: entry.entity_id.clone(),
            attempts,
            next_retry_at,
        });
        Ok(false)
    }

    /// Operator retry of a quarantined entry with a fresh attempt budget.
    pub fn retry_quarantined(&self, id: i64) -> Result<()> {
        let conn = self.db.lock()?;
        let changed = conn.execute(
            "UPDATE sync_queue
             SET status = 'pending', attempts = 0, retry_delay_ms = ?1,
                 next_retry_at = NULL, updated_at = ?2
             WHERE id = ?3 AND status = 'quarantined'",
            params![self.base_delay_ms, format_ts(&self.clock.now()), id],
        )?;
        if changed == 0 {
            return Err(SyncError::NotFound {
                entity: "quarantined sync entry",
                id: id.to_string(),
            });
        }
        info!(entry_id = id, "quarantined forward sync entry requeued");
        Ok(())
    }

    /// Drop queued writes for one record that a conflict resolution made
    /// obsolete: pending or quarantined entries sent at `up_to_version` or
    /// older. An entry already in flight cannot be recalled.
    pub fn discard_superseded(
        &self,
        entity_type: EntityType,
        entity_id: &str,
        up_to_version: i64,
    ) -> Result<usize> {
        let conn = self.db.lock()?;
        let candidates = {
            let mut stmt = conn.prepare(
                "SELECT id, deferred_update FROM sync_queue
                 WHERE entity_type = ?1 AND entity_id = ?2
                   AND status IN ('pending', 'quarantined')",
            )?;
            let rows = stmt.query_map(params![entity_type.as_str(), entity_id], |row| {
                Ok((row.get::<_, i64>(0)?, row.get::<_, Option<String>>(1)?))
            })?;
            rows.collect::<rusqlite::Result<Vec<_>>>()?
        };

        let mut removed = 0;
        for (id, deferred) in candidates {
            let superseded = deferred
                .as_deref()
                .and_then(sent_version)
                .is_some_and(|version| version <= up_to_version);
            if superseded {
                removed += conn.execute("DELETE FROM sync_queue WHERE id = ?1", params![id])?;
            }
        }
        if removed > 0 {
            info!(
                entity_type = %entity_type,
                entity_id = %entity_id,
                up_to_version,
                removed,
                "superseded forward sync entries discarded"
            );
        }
        Ok(removed)
    }

    /// Drop every queued entry. Returns how many were removed.
    pub fn clear(&self) -> Result<usize> {
        let conn = self.db.lock()?;
        let removed = conn.execute("DELETE FROM sync_queue", [])?;
        warn!(removed, "forward sync queue cleared");
        Ok(removed)
    }

    pub fn stats(&self) -> Result<QueueStats> {
        let conn = self.db.lock()?;
        let count = |status: &str| -> rusqlite::Result<i64> {
            conn.query_row(
                "SELECT COUNT(*) FROM sync_queue WHERE status = ?1",
                params![status],
                |row| row.get(0),
            )
        };
        Ok(QueueStats {
            pending: count(EntryStatus::Pending.as_str())?,
            in_flight: count(EntryStatus::InFlight.as_str())?,
            quarantined: count(EntryStatus::Quarantined.as_str())?,
            oldest_error: conn
                .query_row(
                    "SELECT last_error FROM sync_queue
                     WHERE last_error IS NOT NULL ORDER BY id ASC LIMIT 1",
                    [],
                    |row| row.get(0),
                )
                .optional()?,
            next_retry_at: conn
                .query_row(
                    "SELECT MIN(next_retry_at) FROM sync_queue WHERE status = 'pending'",
                    [],
                    |row| row.get::<_, Option<String>>(0),
                )
                .optional()?
                .flatten(),
        })
    }
}
