//! Boundary normalization of wire payloads.
//!
//! Remote rows arrive with either snake_case or camelCase keys, numbers
//! encoded as strings, and a handful of legacy status spellings. Every
//! alias is resolved here, once, into the canonical types in
//! [`crate::models`].

use chrono::{DateTime, NaiveDateTime, Utc};
use serde_json::{Map, Value};
use tracing::warn;

use crate::error::{Result, SyncError};
use crate::models::{
    ChangeKind, Customer, CustomerAddress, EntityChange, EntityType, Order, OrderChange,
    OrderItem, OrderItemChange, OrderKey, OrderStatus, OrderType, RawChange, RecordChange,
    SyncStatus,
};

// ---------------------------------------------------------------------------
// Field accessors
// ---------------------------------------------------------------------------

pub(crate) fn str_any(v: &Value, keys: &[&str]) -> Option<String> {
    for key in keys {
        match v.get(*key) {
            Some(Value::String(s)) => {
                let trimmed = s.trim();
                if !trimmed.is_empty() {
                    return Some(trimmed.to_string());
                }
            }
            Some(Value::Number(n)) => return Some(n.to_string()),
            _ => {}
        }
    }
    None
}

/// Numeric field that may be encoded as a JSON number or a numeric string.
pub(crate) fn num_any(v: &Value, keys: &[&str]) -> Option<f64> {
    for key in keys {
        if let Some(n) = v.get(*key).and_then(parse_number) {
            return Some(n);
        }
    }
    None
}

pub(crate) fn i64_any(v: &Value, keys: &[&str]) -> Option<i64> {
    for key in keys {
        match v.get(*key) {
            Some(Value::Number(n)) => {
                if let Some(i) = n.as_i64() {
                    return Some(i);
                }
                if let Some(f) = n.as_f64() {
                    return Some(f.round() as i64);
                }
            }
            Some(Value::String(s)) => {
                if let Ok(i) = s.trim().parse::<i64>() {
                    return Some(i);
                }
            }
            _ => {}
        }
    }
    None
}

pub(crate) fn bool_any(v: &Value, keys: &[&str]) -> Option<bool> {
    for key in keys {
        let value = match v.get(*key) {
            Some(value) => value,
            None => continue,
        };

        if let Some(flag) = value.as_bool() {
            return Some(flag);
        }
        if let Some(flag) = value.as_i64() {
            return Some(flag == 1);
        }
        if let Some(flag) = value.as_str() {
            let normalized = flag.trim().to_ascii_lowercase();
            if matches!(normalized.as_str(), "true" | "1" | "yes" | "on") {
                return Some(true);
            }
            if matches!(normalized.as_str(), "false" | "0" | "no" | "off") {
                return Some(false);
            }
        }
    }
    None
}

pub(crate) fn time_any(v: &Value, keys: &[&str]) -> Option<DateTime<Utc>> {
    for key in keys {
        if let Some(ts) = v.get(*key).and_then(Value::as_str).and_then(parse_timestamp) {
            return Some(ts);
        }
    }
    None
}

/// Parse a wire number; strings are accepted, anything unparseable is `None`.
pub fn parse_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok().filter(|f| f.is_finite()),
        _ => None,
    }
}

/// Accepts RFC 3339 as well as the timezone-less forms SQLite and Postgres
/// emit (treated as UTC).
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(trimmed) {
        return Some(dt.with_timezone(&Utc));
    }
    for fmt in ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(trimmed, fmt) {
            return Some(naive.and_utc());
        }
    }
    // Postgres short offsets ("+00") are not RFC 3339.
    if let Some(stripped) = trimmed.strip_suffix("+00") {
        return parse_timestamp(stripped);
    }
    None
}

// ---------------------------------------------------------------------------
// Enumerations
// ---------------------------------------------------------------------------

pub fn normalize_order_status(raw: &str) -> OrderStatus {
    match raw.trim().to_lowercase().as_str() {
        "approved" | "confirmed" | "accepted" => OrderStatus::Confirmed,
        "declined" | "rejected" | "canceled" | "cancelled" => OrderStatus::Cancelled,
        "preparing" | "in_progress" => OrderStatus::Preparing,
        "ready" => OrderStatus::Ready,
        "out_for_delivery" | "out-for-delivery" | "dispatched" => OrderStatus::OutForDelivery,
        "delivered" => OrderStatus::Delivered,
        "completed" | "complete" => OrderStatus::Completed,
        "refunded" => OrderStatus::Refunded,
        "pending" => OrderStatus::Pending,
        other => {
            warn!(status = %other, "unknown order status, treating as pending");
            OrderStatus::Pending
        }
    }
}

pub fn normalize_order_type(raw: Option<&str>) -> OrderType {
    match raw
        .map(|s| s.trim().to_lowercase())
        .unwrap_or_default()
        .as_str()
    {
        "dine_in" | "dinein" | "dine-in" => OrderType::DineIn,
        "delivery" => OrderType::Delivery,
        _ => OrderType::Pickup,
    }
}

fn normalize_payment_status(raw: Option<&str>) -> String {
    match raw
        .map(|s| s.trim().to_lowercase())
        .unwrap_or_else(|| "pending".to_string())
        .as_str()
    {
        "completed" | "paid" => "paid".to_string(),
        "partially_paid" => "partially_paid".to_string(),
        "refunded" => "refunded".to_string(),
        "failed" => "failed".to_string(),
        _ => "pending".to_string(),
    }
}

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

const ORDER_REMOTE_ID_KEYS: &[&str] = &["id", "remote_id", "remoteId", "supabase_id"];
const ORDER_CLIENT_ID_KEYS: &[&str] = &["client_order_id", "clientOrderId", "local_id"];
const ORDER_NUMBER_KEYS: &[&str] = &["order_number", "orderNumber"];

/// Line item; a missing or unparseable price becomes zero and a missing
/// name stays empty for the item resolver to fill.
pub fn normalize_item(v: &Value) -> OrderItem {
    let quantity = num_any(v, &["quantity", "qty"])
        .unwrap_or(1.0)
        .max(1.0)
        .round() as i64;
    let raw_total = num_any(v, &["total_price", "totalPrice"]).unwrap_or(0.0);
    let unit_price = num_any(v, &["unit_price", "unitPrice", "price"])
        .or_else(|| {
            if raw_total > 0.0 {
                Some(raw_total / quantity as f64)
            } else {
                None
            }
        })
        .unwrap_or(0.0)
        .max(0.0);
    let total_price = if raw_total > 0.0 {
        raw_total
    } else {
        unit_price * quantity as f64
    };

    let customizations = match v.get("customizations") {
        Some(Value::String(raw)) => serde_json::from_str(raw).unwrap_or(Value::Null),
        Some(value) => value.clone(),
        None => Value::Null,
    };

    OrderItem {
        id: str_any(v, &["id", "item_id", "itemId"]),
        menu_item_id: str_any(v, &["menu_item_id", "menuItemId"]),
        name: str_any(v, &["menu_item_name", "menuItemName", "name", "item_name"])
            .unwrap_or_default(),
        quantity,
        unit_price,
        total_price,
        customizations,
        notes: str_any(v, &["notes", "special_instructions"]),
    }
}

/// Items may arrive as an array or as a JSON-encoded string.
fn items_from(v: &Value) -> Vec<OrderItem> {
    let parsed;
    let array = match v.get("items") {
        Some(Value::Array(items)) => items,
        Some(Value::String(raw)) => {
            parsed = serde_json::from_str::<Value>(raw).unwrap_or(Value::Null);
            match parsed.as_array() {
                Some(items) => items,
                None => return Vec::new(),
            }
        }
        _ => return Vec::new(),
    };
    array.iter().map(normalize_item).collect()
}

pub fn order_key(v: &Value) -> OrderKey {
    let remote_id = str_any(v, ORDER_REMOTE_ID_KEYS);
    let client_id = str_any(v, ORDER_CLIENT_ID_KEYS);
    OrderKey {
        id: client_id.or_else(|| remote_id.clone()),
        remote_id,
        order_number: str_any(v, ORDER_NUMBER_KEYS),
    }
}

/// Normalize a remote order row. Remote rows are synced by definition.
pub fn normalize_order(v: &Value) -> Result<Order> {
    let key = order_key(v);
    let id = key
        .id
        .clone()
        .ok_or_else(|| SyncError::InvalidPayload("order without id".into()))?;

    let created_at = time_any(v, &["created_at", "createdAt"])
        .or_else(|| time_any(v, &["updated_at", "updatedAt"]))
        .unwrap_or_else(Utc::now);
    let updated_at = time_any(v, &["updated_at", "updatedAt"]).unwrap_or(created_at);
    let total_amount = num_any(v, &["total_amount", "totalAmount", "total"]).unwrap_or(0.0);
    let closed_report_id = str_any(v, &["closed_report_id", "closedReportId", "z_report_id"]);

    Ok(Order {
        id,
        remote_id: key.remote_id,
        order_number: key.order_number,
        status: normalize_order_status(
            v.get("status").and_then(Value::as_str).unwrap_or("pending"),
        ),
        order_type: normalize_order_type(str_any(v, &["order_type", "orderType"]).as_deref()),
        items: items_from(v),
        subtotal: num_any(v, &["subtotal"]).unwrap_or(total_amount),
        tax_amount: num_any(v, &["tax_amount", "taxAmount"]).unwrap_or(0.0),
        total_amount,
        customer_id: str_any(v, &["customer_id", "customerId"]),
        customer_name: str_any(v, &["customer_name", "customerName"]),
        customer_phone: str_any(v, &["customer_phone", "customerPhone"]),
        delivery_address: str_any(v, &["delivery_address", "deliveryAddress"]),
        special_instructions: str_any(
            v,
            &["special_instructions", "specialInstructions", "notes"],
        ),
        payment_status: normalize_payment_status(
            str_any(v, &["payment_status", "paymentStatus"]).as_deref(),
        ),
        payment_method: str_any(v, &["payment_method", "paymentMethod"]),
        version: i64_any(v, &["version"]).unwrap_or(1).max(1),
        origin_terminal_id: str_any(
            v,
            &[
                "origin_terminal_id",
                "originTerminalId",
                "terminal_id",
                "terminalId",
            ],
        ),
        platform: str_any(v, &["platform", "plugin", "order_platform"])
            .map(|p| p.to_lowercase()),
        external_platform_order_id: str_any(
            v,
            &[
                "external_platform_order_id",
                "externalPlatformOrderId",
                "external_plugin_order_id",
                "externalPluginOrderId",
                "external_order_id",
            ],
        ),
        is_closed: bool_any(v, &["is_closed", "isClosed"]).unwrap_or(false)
            || closed_report_id.is_some(),
        closed_report_id,
        sync_status: SyncStatus::Synced,
        pending_changes: Map::new(),
        updated_by: str_any(v, &["updated_by", "updatedBy"]),
        created_at,
        updated_at,
        last_synced_at: None,
        deleted_at: None,
    })
}

pub fn normalize_customer(v: &Value) -> Result<Customer> {
    let id = str_any(v, &["id", "customer_id", "customerId"])
        .ok_or_else(|| SyncError::InvalidPayload("customer without id".into()))?;
    let created_at = time_any(v, &["created_at", "createdAt"]).unwrap_or_else(Utc::now);
    Ok(Customer {
        id,
        name: str_any(v, &["name", "full_name", "fullName", "customer_name"]),
        phone: str_any(v, &["phone", "phone_number", "phoneNumber", "mobile"]),
        email: str_any(v, &["email"]),
        notes: str_any(v, &["notes"]),
        is_banned: bool_any(v, &["is_banned", "isBanned"]).unwrap_or(false),
        version: i64_any(v, &["version"]).unwrap_or(1).max(1),
        updated_by: str_any(v, &["updated_by", "updatedBy", "last_updated_by"]),
        sync_status: SyncStatus::Synced,
        pending_changes: Map::new(),
        created_at,
        updated_at: time_any(v, &["updated_at", "updatedAt"]).unwrap_or(created_at),
        last_synced_at: None,
        deleted_at: None,
    })
}

pub fn normalize_address(v: &Value) -> Result<CustomerAddress> {
    let id = str_any(v, &["id", "address_id", "addressId"])
        .ok_or_else(|| SyncError::InvalidPayload("address without id".into()))?;
    let customer_id = str_any(v, &["customer_id", "customerId"])
        .ok_or_else(|| SyncError::InvalidPayload(format!("address {id} without customer")))?;
    let created_at = time_any(v, &["created_at", "createdAt"]).unwrap_or_else(Utc::now);
    Ok(CustomerAddress {
        id,
        customer_id,
        street_address: str_any(v, &["street_address", "streetAddress", "street", "address"]),
        city: str_any(v, &["city"]),
        postal_code: str_any(v, &["postal_code", "postalCode", "zip_code", "zip"]),
        floor_number: str_any(v, &["floor_number", "floorNumber", "floor"]),
        notes: str_any(v, &["notes", "delivery_notes", "deliveryNotes"]),
        is_default: bool_any(v, &["is_default", "isDefault"]).unwrap_or(false),
        version: i64_any(v, &["version"]).unwrap_or(1).max(1),
        updated_by: str_any(v, &["updated_by", "updatedBy", "last_updated_by"]),
        sync_status: SyncStatus::Synced,
        pending_changes: Map::new(),
        created_at,
        updated_at: time_any(v, &["updated_at", "updatedAt"]).unwrap_or(created_at),
        last_synced_at: None,
        deleted_at: None,
    })
}

fn has_fields(v: &Value) -> bool {
    v.as_object().map(|m| !m.is_empty()).unwrap_or(false)
}

/// Turn one raw change-feed event into its canonical form.
pub fn normalize_change(raw: &RawChange) -> Result<EntityChange> {
    let entity = EntityType::from_table(&raw.table)
        .ok_or_else(|| SyncError::InvalidPayload(format!("unwatched table {}", raw.table)))?;
    // Deletes only carry the old row; everything else carries the new one.
    let row = match raw.event_type {
        ChangeKind::Delete if has_fields(&raw.old) => &raw.old,
        ChangeKind::Delete => &raw.new,
        _ if has_fields(&raw.new) => &raw.new,
        _ => {
            return Err(SyncError::InvalidPayload(format!(
                "{} {:?} without a new row",
                raw.table, raw.event_type
            )))
        }
    };

    match entity {
        EntityType::Order => {
            let key = order_key(row);
            if key.id.is_none() && key.order_number.is_none() {
                return Err(SyncError::InvalidPayload("order change without identity".into()));
            }
            let order = match raw.event_type {
                ChangeKind::Delete => None,
                _ => Some(normalize_order(row)?),
            };
            let items_missing = order.as_ref().map(|o| o.items.is_empty()).unwrap_or(false);
            Ok(EntityChange::Order(OrderChange {
                kind: raw.event_type,
                key,
                order,
                items_missing,
                status_override: bool_any(row, &["status_override", "statusOverride"])
                    .unwrap_or(false),
            }))
        }
        EntityType::OrderItem => {
            let order_id = str_any(row, &["order_id", "orderId"]).ok_or_else(|| {
                SyncError::InvalidPayload("order item change without order_id".into())
            })?;
            Ok(EntityChange::OrderItem(OrderItemChange {
                kind: raw.event_type,
                order_id,
                item: normalize_item(row),
            }))
        }
        EntityType::Customer => {
            let id = str_any(row, &["id", "customer_id", "customerId"])
                .ok_or_else(|| SyncError::InvalidPayload("customer change without id".into()))?;
            let record = match raw.event_type {
                ChangeKind::Delete => None,
                _ => Some(normalize_customer(row)?),
            };
            Ok(EntityChange::Customer(RecordChange {
                kind: raw.event_type,
                id,
                record,
            }))
        }
        EntityType::CustomerAddress => {
            let id = str_any(row, &["id", "address_id", "addressId"])
                .ok_or_else(|| SyncError::InvalidPayload("address change without id".into()))?;
            let record = match raw.event_type {
                ChangeKind::Delete => None,
                _ => Some(normalize_address(row)?),
            };
            Ok(EntityChange::CustomerAddress(RecordChange {
                kind: raw.event_type,
                id,
                record,
            }))
        }
    }
}
