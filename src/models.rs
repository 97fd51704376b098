//! Canonical in-memory records.
//!
//! Wire payloads are normalized into these types exactly once, in
//! [`crate::normalize`]. Nothing past that boundary looks at field aliases.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

// ---------------------------------------------------------------------------
// Entity kinds
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    Order,
    OrderItem,
    Customer,
    CustomerAddress,
}

impl EntityType {
    pub fn as_str(self) -> &'static str {
        match self {
            EntityType::Order => "order",
            EntityType::OrderItem => "order_item",
            EntityType::Customer => "customer",
            EntityType::CustomerAddress => "customer_address",
        }
    }

    /// Remote table carrying this entity.
    pub fn table(self) -> &'static str {
        match self {
            EntityType::Order => "orders",
            EntityType::OrderItem => "order_items",
            EntityType::Customer => "customers",
            EntityType::CustomerAddress => "customer_addresses",
        }
    }

    pub fn from_table(table: &str) -> Option<Self> {
        match table.trim() {
            "orders" => Some(EntityType::Order),
            "order_items" => Some(EntityType::OrderItem),
            "customers" => Some(EntityType::Customer),
            "customer_addresses" => Some(EntityType::CustomerAddress),
            _ => None,
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim() {
            "order" => Some(EntityType::Order),
            "order_item" => Some(EntityType::OrderItem),
            "customer" => Some(EntityType::Customer),
            "customer_address" => Some(EntityType::CustomerAddress),
            _ => None,
        }
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Order status state machine
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    Pending,
    Confirmed,
    Preparing,
    Ready,
    OutForDelivery,
    Delivered,
    Completed,
    Cancelled,
    Refunded,
}

impl OrderStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            OrderStatus::Pending => "pending",
            OrderStatus::Confirmed => "confirmed",
            OrderStatus::Preparing => "preparing",
            OrderStatus::Ready => "ready",
            OrderStatus::OutForDelivery => "out_for_delivery",
            OrderStatus::Delivered => "delivered",
            OrderStatus::Completed => "completed",
            OrderStatus::Cancelled => "cancelled",
            OrderStatus::Refunded => "refunded",
        }
    }

    /// Statuses a remote merge may never move an order out of.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            OrderStatus::Completed
                | OrderStatus::Cancelled
                | OrderStatus::Delivered
                | OrderStatus::Refunded
        )
    }

    /// Transitions allowed for an explicit operator action.
    pub fn can_transition_to(self, next: OrderStatus) -> bool {
        use OrderStatus::*;
        if self == next {
            return true;
        }
        matches!(
            (self, next),
            (Pending, Confirmed)
                | (Pending, Cancelled)
                | (Confirmed, Preparing)
                | (Confirmed, Cancelled)
                | (Preparing, Ready)
                | (Ready, Completed)
                | (Ready, OutForDelivery)
                | (OutForDelivery, Delivered)
                | (Delivered, Completed)
                | (Completed, Refunded)
                | (Cancelled, Pending)
        )
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OrderType {
    #[serde(rename = "pickup")]
    Pickup,
    #[serde(rename = "delivery")]
    Delivery,
    #[serde(rename = "dine-in")]
    DineIn,
}

impl OrderType {
    pub fn as_str(self) -> &'static str {
        match self {
            OrderType::Pickup => "pickup",
            OrderType::Delivery => "delivery",
            OrderType::DineIn => "dine-in",
        }
    }
}

/// Whether the remote store has acknowledged the local copy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    #[default]
    Synced,
    Pending,
    Failed,
}

impl SyncStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            SyncStatus::Synced => "synced",
            SyncStatus::Pending => "pending",
            SyncStatus::Failed => "failed",
        }
    }

    pub fn parse(raw: &str) -> Self {
        match raw.trim() {
            "pending" => SyncStatus::Pending,
            "failed" => SyncStatus::Failed,
            _ => SyncStatus::Synced,
        }
    }
}

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderItem {
    pub id: Option<String>,
    pub menu_item_id: Option<String>,
    pub name: String,
    pub quantity: i64,
    pub unit_price: f64,
    pub total_price: f64,
    #[serde(default)]
    pub customizations: Value,
    pub notes: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Order {
    pub id: String,
    pub remote_id: Option<String>,
    pub order_number: Option<String>,
    pub status: OrderStatus,
    pub order_type: OrderType,
    pub items: Vec<OrderItem>,
    pub subtotal: f64,
    pub tax_amount: f64,
    pub total_amount: f64,
    pub customer_id: Option<String>,
    pub customer_name: Option<String>,
    pub customer_phone: Option<String>,
    pub delivery_address: Option<String>,
    pub special_instructions: Option<String>,
    pub payment_status: String,
    pub payment_method: Option<String>,
    pub version: i64,
    pub origin_terminal_id: Option<String>,
    pub platform: Option<String>,
    pub external_platform_order_id: Option<String>,
    pub is_closed: bool,
    pub closed_report_id: Option<String>,
    pub sync_status: SyncStatus,
    /// Locally changed fields (camelCase keys) not yet acknowledged remotely.
    #[serde(default)]
    pub pending_changes: Map<String, Value>,
    pub updated_by: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_synced_at: Option<DateTime<Utc>>,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Order {
    /// A fresh, never-synced order authored on this terminal.
    pub fn new_local(id: impl Into<String>, terminal_id: &str, now: DateTime<Utc>) -> Self {
        Self {
            id: id.into(),
            remote_id: None,
            order_number: None,
            status: OrderStatus::Pending,
            order_type: OrderType::Pickup,
            items: Vec::new(),
            subtotal: 0.0,
            tax_amount: 0.0,
            total_amount: 0.0,
            customer_id: None,
            customer_name: None,
            customer_phone: None,
            delivery_address: None,
            special_instructions: None,
            payment_status: "pending".to_string(),
            payment_method: None,
            version: 1,
            origin_terminal_id: Some(terminal_id.to_string()),
            platform: None,
            external_platform_order_id: None,
            is_closed: false,
            closed_report_id: None,
            sync_status: SyncStatus::Pending,
            pending_changes: Map::new(),
            updated_by: Some(terminal_id.to_string()),
            created_at: now,
            updated_at: now,
            last_synced_at: None,
            deleted_at: None,
        }
    }

    /// `(platform, external id)` alternate identity, when both are present.
    pub fn external_identity(&self) -> Option<(String, String)> {
        match (&self.platform, &self.external_platform_order_id) {
            (Some(platform), Some(external_id))
                if !platform.trim().is_empty() && !external_id.trim().is_empty() =>
            {
                Some((platform.trim().to_lowercase(), external_id.trim().to_string()))
            }
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Customer {
    pub id: String,
    pub name: Option<String>,
    pub phone: Option<String>,
    pub email: Option<String>,
    pub notes: Option<String>,
    pub is_banned: bool,
    pub version: i64,
    pub updated_by: Option<String>,
    pub sync_status: SyncStatus,
    #[serde(default)]
    pub pending_changes: Map<String, Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_synced_at: Option<DateTime<Utc>>,
    pub deleted_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CustomerAddress {
    pub id: String,
    pub customer_id: String,
    pub street_address: Option<String>,
    pub city: Option<String>,
    pub postal_code: Option<String>,
    pub floor_number: Option<String>,
    pub notes: Option<String>,
    pub is_default: bool,
    pub version: i64,
    pub updated_by: Option<String>,
    pub sync_status: SyncStatus,
    #[serde(default)]
    pub pending_changes: Map<String, Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_synced_at: Option<DateTime<Utc>>,
    pub deleted_at: Option<DateTime<Utc>>,
}

// ---------------------------------------------------------------------------
// Shared optimistic-concurrency surface
// ---------------------------------------------------------------------------

/// What the merge engine needs to know about any versioned record.
pub trait SyncRecord: Clone + Serialize + DeserializeOwned {
    const ENTITY: EntityType;

    fn id(&self) -> &str;
    fn version(&self) -> i64;
    fn set_version(&mut self, version: i64);
    fn updated_at(&self) -> DateTime<Utc>;
    /// Terminal (or actor) that authored this revision.
    fn origin(&self) -> Option<&str>;
    fn sync_status(&self) -> SyncStatus;
    fn pending_changes(&self) -> &Map<String, Value>;
    fn mark_synced(&mut self, at: DateTime<Utc>);
    /// Has this record ever left local scope.
    fn has_been_synced(&self) -> bool;
    fn is_deleted(&self) -> bool;

    fn has_pending_changes(&self) -> bool {
        self.sync_status() == SyncStatus::Pending
    }

    fn snapshot(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

macro_rules! sync_record_common {
    () => {
        fn id(&self) -> &str {
            &self.id
        }
        fn version(&self) -> i64 {
            self.version
        }
        fn set_version(&mut self, version: i64) {
            self.version = version;
        }
        fn updated_at(&self) -> DateTime<Utc> {
            self.updated_at
        }
        fn sync_status(&self) -> SyncStatus {
            self.sync_status
        }
        fn pending_changes(&self) -> &Map<String, Value> {
            &self.pending_changes
        }
        fn mark_synced(&mut self, at: DateTime<Utc>) {
            self.sync_status = SyncStatus::Synced;
            self.pending_changes.clear();
            self.last_synced_at = Some(at);
        }
        fn is_deleted(&self) -> bool {
            self.deleted_at.is_some()
        }
    };
}

impl SyncRecord for Order {
    const ENTITY: EntityType = EntityType::Order;
    sync_record_common!();

    fn origin(&self) -> Option<&str> {
        self.origin_terminal_id.as_deref()
    }

    fn has_been_synced(&self) -> bool {
        self.remote_id.is_some() || self.last_synced_at.is_some()
    }
}

impl SyncRecord for Customer {
    const ENTITY: EntityType = EntityType::Customer;
    sync_record_common!();

    fn origin(&self) -> Option<&str> {
        self.updated_by.as_deref()
    }

    fn has_been_synced(&self) -> bool {
        self.last_synced_at.is_some()
    }
}

impl SyncRecord for CustomerAddress {
    const ENTITY: EntityType = EntityType::CustomerAddress;
    sync_record_common!();

    fn origin(&self) -> Option<&str> {
        self.updated_by.as_deref()
    }

    fn has_been_synced(&self) -> bool {
        self.last_synced_at.is_some()
    }
}

// ---------------------------------------------------------------------------
// Conflicts
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictType {
    VersionMismatch,
}

impl ConflictType {
    pub fn as_str(self) -> &'static str {
        match self {
            ConflictType::VersionMismatch => "version_mismatch",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionStrategy {
    RemoteWins,
    LocalWins,
    Merge,
}

impl ResolutionStrategy {
    pub fn as_str(self) -> &'static str {
        match self {
            ResolutionStrategy::RemoteWins => "remote_wins",
            ResolutionStrategy::LocalWins => "local_wins",
            ResolutionStrategy::Merge => "merge",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim() {
            "remote_wins" | "server_wins" => Some(ResolutionStrategy::RemoteWins),
            "local_wins" | "client_wins" => Some(ResolutionStrategy::LocalWins),
            "merge" => Some(ResolutionStrategy::Merge),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictRecord {
    pub id: String,
    pub entity_id: String,
    pub entity_type: EntityType,
    pub local_version: i64,
    pub remote_version: i64,
    pub local_snapshot: Value,
    pub remote_snapshot: Value,
    pub conflict_type: ConflictType,
    pub created_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub resolution_strategy: Option<ResolutionStrategy>,
}

impl ConflictRecord {
    pub fn is_resolved(&self) -> bool {
        self.resolved_at.is_some()
    }
}

// ---------------------------------------------------------------------------
// Change events
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

impl ChangeKind {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "insert" => Some(ChangeKind::Insert),
            "update" => Some(ChangeKind::Update),
            "delete" => Some(ChangeKind::Delete),
            _ => None,
        }
    }
}

/// A row-level change as delivered by the change feed, before normalization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawChange {
    pub table: String,
    pub event_type: ChangeKind,
    #[serde(default)]
    pub new: Value,
    #[serde(default)]
    pub old: Value,
}

/// Identity hints for matching an incoming order against local rows.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OrderKey {
    pub id: Option<String>,
    pub remote_id: Option<String>,
    pub order_number: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OrderChange {
    pub kind: ChangeKind,
    pub key: OrderKey,
    /// Absent for deletes that only carry the old row's identity.
    pub order: Option<Order>,
    /// The wire payload carried no usable line items.
    pub items_missing: bool,
    /// Explicit operator override of the sticky-terminal rule.
    pub status_override: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OrderItemChange {
    pub kind: ChangeKind,
    /// Remote id of the parent order.
    pub order_id: String,
    pub item: OrderItem,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RecordChange<T> {
    pub kind: ChangeKind,
    pub id: String,
    pub record: Option<T>,
}

/// A normalized change ready for the merge engine.
#[derive(Debug, Clone, PartialEq)]
pub enum EntityChange {
    Order(OrderChange),
    OrderItem(OrderItemChange),
    Customer(RecordChange<Customer>),
    CustomerAddress(RecordChange<CustomerAddress>),
}

impl EntityChange {
    pub fn entity_type(&self) -> EntityType {
        match self {
            EntityChange::Order(_) => EntityType::Order,
            EntityChange::OrderItem(_) => EntityType::OrderItem,
            EntityChange::Customer(_) => EntityType::Customer,
            EntityChange::CustomerAddress(_) => EntityType::CustomerAddress,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_statuses() {
        assert!(OrderStatus::Completed.is_terminal());
        assert!(OrderStatus::Cancelled.is_terminal());
        assert!(OrderStatus::Delivered.is_terminal());
        assert!(!OrderStatus::Preparing.is_terminal());
        assert!(!OrderStatus::Pending.is_terminal());
    }

    #[test]
    fn status_transitions_follow_state_machine() {
        assert!(OrderStatus::Pending.can_transition_to(OrderStatus::Confirmed));
        assert!(OrderStatus::Confirmed.can_transition_to(OrderStatus::Cancelled));
        assert!(OrderStatus::Cancelled.can_transition_to(OrderStatus::Pending));
        assert!(!OrderStatus::Completed.can_transition_to(OrderStatus::Preparing));
        assert!(!OrderStatus::Pending.can_transition_to(OrderStatus::Ready));
    }

    #[test]
    fn external_identity_requires_both_parts() {
        let now = Utc::now();
        let mut order = Order::new_local("o-1", "term-1", now);
        assert_eq!(order.external_identity(), None);
        order.platform = Some("Wolt".into());
        assert_eq!(order.external_identity(), None);
        order.external_platform_order_id = Some("W-42".into());
        assert_eq!(
            order.external_identity(),
            Some(("wolt".to_string(), "W-42".to_string()))
        );
    }
}
