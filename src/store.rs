//! Local record store.
//!
//! `LocalStore` is the seam the merge engine writes through. Every method is
//! a single SQL statement, so a failure leaves at most the one record it
//! touched unchanged and never a half-written row.

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, OptionalExtension, Row};
use serde_json::{Map, Value};
use std::sync::Arc;

use crate::conflict::ConflictStore;
use crate::db::{self, DbState};
use crate::error::Result;
use crate::models::{
    ConflictRecord, ConflictType, Customer, CustomerAddress, EntityType, Order, OrderItem,
    OrderKey, ResolutionStrategy, SyncStatus,
};
use crate::normalize::{normalize_order_status, normalize_order_type, parse_timestamp};

pub trait LocalStore: Send + Sync {
    /// First local order matching `key.id`, then `key.remote_id`, then
    /// `key.order_number`. Tombstoned rows match too.
    fn find_order(&self, key: &OrderKey) -> Result<Option<Order>>;
    fn get_order(&self, id: &str) -> Result<Option<Order>>;
    fn upsert_order(&self, order: &Order) -> Result<()>;
    fn soft_delete_order(&self, id: &str, at: DateTime<Utc>) -> Result<()>;
    fn remove_order(&self, id: &str) -> Result<()>;
    /// Live (non-tombstoned) orders, oldest first.
    fn list_orders(&self) -> Result<Vec<Order>>;

    fn get_customer(&self, id: &str) -> Result<Option<Customer>>;
    fn upsert_customer(&self, customer: &Customer) -> Result<()>;
    fn soft_delete_customer(&self, id: &str, at: DateTime<Utc>) -> Result<()>;
    fn remove_customer(&self, id: &str) -> Result<()>;

    fn get_address(&self, id: &str) -> Result<Option<CustomerAddress>>;
    fn upsert_address(&self, address: &CustomerAddress) -> Result<()>;
    fn soft_delete_address(&self, id: &str, at: DateTime<Utc>) -> Result<()>;
    fn remove_address(&self, id: &str) -> Result<()>;

    /// End of the last closed accounting period, if any.
    fn last_settlement_at(&self) -> Result<Option<DateTime<Utc>>>;
}

pub(crate) fn format_ts(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn parse_ts(raw: Option<String>) -> Option<DateTime<Utc>> {
    raw.as_deref().and_then(parse_timestamp)
}

fn json_map(raw: &str) -> Map<String, Value> {
    serde_json::from_str(raw).unwrap_or_default()
}

fn map_text(map: &Map<String, Value>) -> String {
    Value::Object(map.clone()).to_string()
}

/// SQLite-backed store sharing the engine's connection.
#[derive(Clone)]
pub struct SqliteStore {
    db: Arc<DbState>,
}

impl SqliteStore {
    pub fn new(db: Arc<DbState>) -> Self {
        Self { db }
    }

    pub fn db(&self) -> &Arc<DbState> {
        &self.db
    }

    /// Record the end-of-day settlement time (owned by the z-report flow).
    pub fn set_last_settlement_at(&self, at: DateTime<Utc>) -> Result<()> {
        let conn = self.db.lock()?;
        db::set_setting(&conn, db::SETTLEMENT_CATEGORY, db::SETTLEMENT_KEY, &format_ts(&at))
    }
}

// ---------------------------------------------------------------------------
// Orders
// ---------------------------------------------------------------------------

const ORDER_COLUMNS: &str = "id, remote_id, order_number, status, order_type, items,
    subtotal, tax_amount, total_amount, customer_id, customer_name, customer_phone,
    delivery_address, special_instructions, payment_status, payment_method, version,
    origin_terminal_id, platform, external_platform_order_id, is_closed, closed_report_id,
    sync_status, pending_changes, updated_by, created_at, updated_at, last_synced_at,
    deleted_at";

fn row_to_order(row: &Row<'_>) -> rusqlite::Result<Order> {
    let items_raw: String = row.get(5)?;
    let status: String = row.get(3)?;
    let order_type: String = row.get(4)?;
    let sync_status: String = row.get(22)?;
    let pending_raw: String = row.get(23)?;
    Ok(Order {
        id: row.get(0)?,
        remote_id: row.get(1)?,
        order_number: row.get(2)?,
        status: normalize_order_status(&status),
        order_type: normalize_order_type(Some(&order_type)),
        items: serde_json::from_str::<Vec<OrderItem>>(&items_raw).unwrap_or_default(),
        subtotal: row.get(6)?,
        tax_amount: row.get(7)?,
        total_amount: row.get(8)?,
        customer_id: row.get(9)?,
        customer_name: row.get(10)?,
        customer_phone: row.get(11)?,
        delivery_address: row.get(12)?,
        special_instructions: row.get(13)?,
        payment_status: row.get(14)?,
        payment_method: row.get(15)?,
        version: row.get(16)?,
        origin_terminal_id: row.get(17)?,
        platform: row.get(18)?,
        external_platform_order_id: row.get(19)?,
        is_closed: row.get::<_, i64>(20)? != 0,
        closed_report_id: row.get(21)?,
        sync_status: SyncStatus::parse(&sync_status),
        pending_changes: json_map(&pending_raw),
        updated_by: row.get(24)?,
        created_at: parse_ts(row.get(25)?).unwrap_or_default(),
        updated_at: parse_ts(row.get(26)?).unwrap_or_default(),
        last_synced_at: parse_ts(row.get(27)?),
        deleted_at: parse_ts(row.get(28)?),
    })
}

impl SqliteStore {
    fn order_where(&self, clause: &str, value: &str) -> Result<Option<Order>> {
        let conn = self.db.lock()?;
        let sql = format!(
            "SELECT {ORDER_COLUMNS} FROM orders WHERE {clause} = ?1
             ORDER BY created_at ASC, id ASC LIMIT 1"
        );
        Ok(conn
            .query_row(&sql, params![value], row_to_order)
            .optional()?)
    }
}

impl LocalStore for SqliteStore {
    fn find_order(&self, key: &OrderKey) -> Result<Option<Order>> {
        if let Some(id) = &key.id {
            if let Some(order) = self.order_where("id", id)? {
                return Ok(Some(order));
            }
            // The incoming id may be the remote identity of a local row.
            if let Some(order) = self.order_where("remote_id", id)? {
                return Ok(Some(order));
            }
        }
        if let Some(remote_id) = &key.remote_id {
            if let Some(order) = self.order_where("remote_id", remote_id)? {
                return Ok(Some(order));
            }
            if let Some(order) = self.order_where("id", remote_id)? {
                return Ok(Some(order));
            }
        }
        if let Some(order_number) = &key.order_number {
            if let Some(order) = self.order_where("order_number", order_number)? {
                return Ok(Some(order));
            }
        }
        Ok(None)
    }

    fn get_order(&self, id: &str) -> Result<Option<Order>> {
        self.order_where("id", id)
    }

    fn upsert_order(&self, order: &Order) -> Result<()> {
        let conn = self.db.lock()?;
        let items = serde_json::to_string(&order.items)?;
        conn.execute(
            &format!(
                "INSERT INTO orders ({ORDER_COLUMNS}) VALUES (
                    ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10,
                    ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20,
                    ?21, ?22, ?23, ?24, ?25, ?26, ?27, ?28, ?29
                )
                ON CONFLICT(id) DO UPDATE SET
                    remote_id = excluded.remote_id,
                    order_number = excluded.order_number,
                    status = excluded.status,
                    order_type = excluded.order_type,
                    items = excluded.items,
                    subtotal = excluded.subtotal,
                    tax_amount = excluded.tax_amount,
                    total_amount = excluded.total_amount,
                    customer_id = excluded.customer_id,
                    customer_name = excluded.customer_name,
                    customer_phone = excluded.customer_phone,
                    delivery_address = excluded.delivery_address,
                    special_instructions = excluded.special_instructions,
                    payment_status = excluded.payment_status,
                    payment_method = excluded.payment_method,
                    version = excluded.version,
                    origin_terminal_id = excluded.origin_terminal_id,
                    platform = excluded.platform,
                    external_platform_order_id = excluded.external_platform_order_id,
                    is_closed = MAX(orders.is_closed, excluded.is_closed),
                    closed_report_id = COALESCE(orders.closed_report_id, excluded.closed_report_id),
                    sync_status = excluded.sync_status,
                    pending_changes = excluded.pending_changes,
                    updated_by = excluded.updated_by,
                    created_at = excluded.created_at,
                    updated_at = excluded.updated_at,
                    last_synced_at = excluded.last_synced_at,
                    deleted_at = excluded.deleted_at"
            ),
            params![
                order.id,
                order.remote_id,
                order.order_number,
                order.status.as_str(),
                order.order_type.as_str(),
                items,
                order.subtotal,
                order.tax_amount,
                order.total_amount,
                order.customer_id,
                order.customer_name,
                order.customer_phone,
                order.delivery_address,
                order.special_instructions,
                order.payment_status,
                order.payment_method,
                order.version,
                order.origin_terminal_id,
                order.platform,
                order.external_platform_order_id,
                order.is_closed as i64,
                order.closed_report_id,
                order.sync_status.as_str(),
                map_text(&order.pending_changes),
                order.updated_by,
                format_ts(&order.created_at),
                format_ts(&order.updated_at),
                order.last_synced_at.as_ref().map(format_ts),
                order.deleted_at.as_ref().map(format_ts),
            ],
        )?;
        Ok(())
    }

    fn soft_delete_order(&self, id: &str, at: DateTime<Utc>) -> Result<()> {
        let conn = self.db.lock()?;
        conn.execute(
            "UPDATE orders SET deleted_at = ?1, updated_at = ?1 WHERE id = ?2",
            params![format_ts(&at), id],
        )?;
        Ok(())
    }

    fn remove_order(&self, id: &str) -> Result<()> {
        let conn = self.db.lock()?;
        conn.execute("DELETE FROM orders WHERE id = ?1", params![id])?;
        Ok(())
    }

    fn list_orders(&self) -> Result<Vec<Order>> {
        let conn = self.db.lock()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {ORDER_COLUMNS} FROM orders WHERE deleted_at IS NULL
             ORDER BY created_at ASC, id ASC"
        ))?;
        let orders = stmt
            .query_map([], row_to_order)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(orders)
    }

    // -----------------------------------------------------------------------
    // Customers
    // -----------------------------------------------------------------------

    fn get_customer(&self, id: &str) -> Result<Option<Customer>> {
        let conn = self.db.lock()?;
        Ok(conn
            .query_row(
                "SELECT id, name, phone, email, notes, is_banned, version, updated_by,
                        sync_status, pending_changes, created_at, updated_at,
                        last_synced_at, deleted_at
                 FROM customers WHERE id = ?1",
                params![id],
                |row| {
                    let sync_status: String = row.get(8)?;
                    let pending_raw: String = row.get(9)?;
                    Ok(Customer {
                        id: row.get(0)?,
                        name: row.get(1)?,
                        phone: row.get(2)?,
                        email: row.get(3)?,
                        notes: row.get(4)?,
                        is_banned: row.get::<_, i64>(5)? != 0,
                        version: row.get(6)?,
                        updated_by: row.get(7)?,
                        sync_status: SyncStatus::parse(&sync_status),
                        pending_changes: json_map(&pending_raw),
                        created_at: parse_ts(row.get(10)?).unwrap_or_default(),
                        updated_at: parse_ts(row.get(11)?).unwrap_or_default(),
                        last_synced_at: parse_ts(row.get(12)?),
                        deleted_at: parse_ts(row.get(13)?),
                    })
                },
            )
            .optional()?)
    }

    fn upsert_customer(&self, c: &Customer) -> Result<()> {
        let conn = self.db.lock()?;
        conn.execute(
            "INSERT INTO customers (
                id, name, phone, email, notes, is_banned, version, updated_by,
                sync_status, pending_changes, created_at, updated_at, last_synced_at, deleted_at
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)
             ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                phone = excluded.phone,
                email = excluded.email,
                notes = excluded.notes,
                is_banned = excluded.is_banned,
                version = excluded.version,
                updated_by = excluded.updated_by,
                sync_status = excluded.sync_status,
                pending_changes = excluded.pending_changes,
                created_at = excluded.created_at,
                updated_at = excluded.updated_at,
                last_synced_at = excluded.last_synced_at,
                deleted_at = excluded.deleted_at",
            params![
                c.id,
                c.name,
                c.phone,
                c.email,
                c.notes,
                c.is_banned as i64,
                c.version,
                c.updated_by,
                c.sync_status.as_str(),
                map_text(&c.pending_changes),
                format_ts(&c.created_at),
                format_ts(&c.updated_at),
                c.last_synced_at.as_ref().map(format_ts),
                c.deleted_at.as_ref().map(format_ts),
            ],
        )?;
        Ok(())
    }

    fn soft_delete_customer(&self, id: &str, at: DateTime<Utc>) -> Result<()> {
        let conn = self.db.lock()?;
        conn.execute(
            "UPDATE customers SET deleted_at = ?1, updated_at = ?1 WHERE id = ?2",
            params![format_ts(&at), id],
        )?;
        Ok(())
    }

    fn remove_customer(&self, id: &str) -> Result<()> {
        let conn = self.db.lock()?;
        conn.execute("DELETE FROM customers WHERE id = ?1", params![id])?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Addresses
    // -----------------------------------------------------------------------

    fn get_address(&self, id: &str) -> Result<Option<CustomerAddress>> {
        let conn = self.db.lock()?;
        Ok(conn
            .query_row(
                "SELECT id, customer_id, street_address, city, postal_code, floor_number,
                        notes, is_default, version, updated_by, sync_status, pending_changes,
                        created_at, updated_at, last_synced_at, deleted_at
                 FROM customer_addresses WHERE id = ?1",
                params![id],
                |row| {
                    let sync_status: String = row.get(10)?;
                    let pending_raw: String = row.get(11)?;
                    Ok(CustomerAddress {
                        id: row.get(0)?,
                        customer_id: row.get(1)?,
                        street_address: row.get(2)?,
                        city: row.get(3)?,
                        postal_code: row.get(4)?,
                        floor_number: row.get(5)?,
                        notes: row.get(6)?,
                        is_default: row.get::<_, i64>(7)? != 0,
                        version: row.get(8)?,
                        updated_by: row.get(9)?,
                        sync_status: SyncStatus::parse(&sync_status),
                        pending_changes: json_map(&pending_raw),
                        created_at: parse_ts(row.get(12)?).unwrap_or_default(),
                        updated_at: parse_ts(row.get(13)?).unwrap_or_default(),
                        last_synced_at: parse_ts(row.get(14)?),
                        deleted_at: parse_ts(row.get(15)?),
                    })
                },
            )
            .optional()?)
    }

    fn upsert_address(&self, a: &CustomerAddress) -> Result<()> {
        let conn = self.db.lock()?;
        conn.execute(
            "INSERT INTO customer_addresses (
                id, customer_id, street_address, city, postal_code, floor_number, notes,
                is_default, version, updated_by, sync_status, pending_changes,
                created_at, updated_at, last_synced_at, deleted_at
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)
             ON CONFLICT(id) DO UPDATE SET
                customer_id = excluded.customer_id,
                street_address = excluded.street_address,
                city = excluded.city,
                postal_code = excluded.postal_code,
                floor_number = excluded.floor_number,
                notes = excluded.notes,
                is_default = excluded.is_default,
                version = excluded.version,
                updated_by = excluded.updated_by,
                sync_status = excluded.sync_status,
                pending_changes = excluded.pending_changes,
                created_at = excluded.created_at,
                updated_at = excluded.updated_at,
                last_synced_at = excluded.last_synced_at,
                deleted_at = excluded.deleted_at",
            params![
                a.id,
                a.customer_id,
                a.street_address,
                a.city,
                a.postal_code,
                a.floor_number,
                a.notes,
                a.is_default as i64,
                a.version,
                a.updated_by,
                a.sync_status.as_str(),
                map_text(&a.pending_changes),
                format_ts(&a.created_at),
                format_ts(&a.updated_at),
                a.last_synced_at.as_ref().map(format_ts),
                a.deleted_at.as_ref().map(format_ts),
            ],
        )?;
        Ok(())
    }

    fn soft_delete_address(&self, id: &str, at: DateTime<Utc>) -> Result<()> {
        let conn = self.db.lock()?;
        conn.execute(
            "UPDATE customer_addresses SET deleted_at = ?1, updated_at = ?1 WHERE id = ?2",
            params![format_ts(&at), id],
        )?;
        Ok(())
    }

    fn remove_address(&self, id: &str) -> Result<()> {
        let conn = self.db.lock()?;
        conn.execute("DELETE FROM customer_addresses WHERE id = ?1", params![id])?;
        Ok(())
    }

    fn last_settlement_at(&self) -> Result<Option<DateTime<Utc>>> {
        let conn = self.db.lock()?;
        Ok(db::get_setting(&conn, db::SETTLEMENT_CATEGORY, db::SETTLEMENT_KEY)
            .as_deref()
            .and_then(parse_timestamp))
    }
}

// ---------------------------------------------------------------------------
// Conflict persistence
// ---------------------------------------------------------------------------

fn row_to_conflict(row: &Row<'_>) -> rusqlite::Result<ConflictRecord> {
    let entity_type: String = row.get(2)?;
    let local_snapshot: String = row.get(5)?;
    let remote_snapshot: String = row.get(6)?;
    let strategy: Option<String> = row.get(10)?;
    Ok(ConflictRecord {
        id: row.get(0)?,
        entity_id: row.get(1)?,
        entity_type: EntityType::parse(&entity_type).unwrap_or(EntityType::Order),
        local_version: row.get(3)?,
        remote_version: row.get(4)?,
        local_snapshot: serde_json::from_str(&local_snapshot).unwrap_or(Value::Null),
        remote_snapshot: serde_json::from_str(&remote_snapshot).unwrap_or(Value::Null),
        conflict_type: ConflictType::VersionMismatch,
        created_at: parse_ts(row.get(8)?).unwrap_or_default(),
        resolved_at: parse_ts(row.get(9)?),
        resolution_strategy: strategy.as_deref().and_then(ResolutionStrategy::parse),
    })
}

const CONFLICT_COLUMNS: &str = "id, entity_id, entity_type, local_version, remote_version,
    local_snapshot, remote_snapshot, conflict_type, created_at, resolved_at, resolution_strategy";

impl ConflictStore for SqliteStore {
    fn insert_conflict(&self, record: &ConflictRecord) -> Result<()> {
        let conn = self.db.lock()?;
        conn.execute(
            &format!(
                "INSERT INTO sync_conflicts ({CONFLICT_COLUMNS})
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)"
            ),
            params![
                record.id,
                record.entity_id,
                record.entity_type.as_str(),
                record.local_version,
                record.remote_version,
                record.local_snapshot.to_string(),
                record.remote_snapshot.to_string(),
                record.conflict_type.as_str(),
                format_ts(&record.created_at),
                record.resolved_at.as_ref().map(format_ts),
                record.resolution_strategy.map(ResolutionStrategy::as_str),
            ],
        )?;
        Ok(())
    }

    fn find_open_conflict(
        &self,
        entity_type: EntityType,
        entity_id: &str,
        local_version: i64,
        remote_version: i64,
    ) -> Result<Option<ConflictRecord>> {
        let conn = self.db.lock()?;
        Ok(conn
            .query_row(
                &format!(
                    "SELECT {CONFLICT_COLUMNS} FROM sync_conflicts
                     WHERE entity_type = ?1 AND entity_id = ?2
                       AND local_version = ?3 AND remote_version = ?4
                       AND resolved_at IS NULL
                     ORDER BY created_at ASC LIMIT 1"
                ),
                params![entity_type.as_str(), entity_id, local_version, remote_version],
                row_to_conflict,
            )
            .optional()?)
    }

    fn get_conflict(&self, id: &str) -> Result<Option<ConflictRecord>> {
        let conn = self.db.lock()?;
        Ok(conn
            .query_row(
                &format!("SELECT {CONFLICT_COLUMNS} FROM sync_conflicts WHERE id = ?1"),
                params![id],
                row_to_conflict,
            )
            .optional()?)
    }

    fn list_open_conflicts(&self) -> Result<Vec<ConflictRecord>> {
        let conn = self.db.lock()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {CONFLICT_COLUMNS} FROM sync_conflicts
             WHERE resolved_at IS NULL ORDER BY created_at ASC"
        ))?;
        let rows = stmt
            .query_map([], row_to_conflict)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    fn mark_resolved(
        &self,
        id: &str,
        strategy: ResolutionStrategy,
        at: DateTime<Utc>,
    ) -> Result<bool> {
        let conn = self.db.lock()?;
        let changed = conn.execute(
            "UPDATE sync_conflicts SET resolved_at = ?1, resolution_strategy = ?2
             WHERE id = ?3 AND resolved_at IS NULL",
            params![format_ts(&at), strategy.as_str(), id],
        )?;
        Ok(changed > 0)
    }
}
