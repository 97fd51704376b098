//! Order item resolution.
//!
//! Change payloads often carry an order without its lines. The resolver
//! fetches the raw item rows and guarantees every line a display name:
//! catalog name, then a name embedded in the customizations, then a
//! synthesized `Item N (<currency><price>)` label.

use async_trait::async_trait;
use rusqlite::params;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, error, warn};

use crate::db::DbState;
use crate::error::Result;
use crate::models::OrderItem;
use crate::normalize::{normalize_item, str_any};

/// Where raw item rows for an order come from.
#[async_trait]
pub trait ItemSource: Send + Sync {
    async fn fetch_items(&self, order_id: &str) -> Result<Vec<Value>>;
}

/// Menu cache sections that hold sellable items.
const CATALOG_SECTIONS: &[&str] = &["menu_items", "subcategories"];
const CATALOG_NAME_KEYS: &[&str] = &["name", "name_en", "display_name", "title"];
const EMBEDDED_NAME_KEYS: &[&str] = &["name", "itemName", "item_name", "menuItemName"];

/// Read-only view of the cached menu catalog.
#[derive(Clone)]
pub struct MenuCatalog {
    db: Arc<DbState>,
}

impl MenuCatalog {
    pub fn new(db: Arc<DbState>) -> Self {
        Self { db }
    }

    fn read_section(&self, cache_key: &str) -> Vec<Value> {
        let conn = match self.db.lock() {
            Ok(c) => c,
            Err(e) => {
                error!("menu catalog lock failed: {e}");
                return Vec::new();
            }
        };
        let raw: Option<String> = conn
            .query_row(
                "SELECT data FROM menu_cache WHERE cache_key = ?1",
                params![cache_key],
                |row| row.get(0),
            )
            .ok();
        match raw.map(|s| serde_json::from_str::<Value>(&s)) {
            Some(Ok(Value::Array(items))) => items,
            Some(Ok(_)) => {
                warn!("menu_cache[{cache_key}] is not an array");
                Vec::new()
            }
            Some(Err(e)) => {
                error!("menu_cache[{cache_key}] JSON parse error: {e}");
                Vec::new()
            }
            None => Vec::new(),
        }
    }

    pub fn item_name(&self, menu_item_id: &str) -> Option<String> {
        CATALOG_SECTIONS.iter().find_map(|section| {
            self.read_section(section)
                .iter()
                .find(|entry| str_any(entry, &["id"]).as_deref() == Some(menu_item_id))
                .and_then(|entry| str_any(entry, CATALOG_NAME_KEYS))
        })
    }
}

fn joined_catalog_name(row: &Value) -> Option<String> {
    ["menu_items", "menu_item", "subcategories"]
        .iter()
        .filter_map(|key| row.get(*key))
        .find_map(|joined| str_any(joined, CATALOG_NAME_KEYS))
}

fn embedded_name(customizations: &Value) -> Option<String> {
    match customizations {
        Value::Object(_) => str_any(customizations, EMBEDDED_NAME_KEYS),
        _ => None,
    }
}

pub struct OrderItemResolver {
    source: Arc<dyn ItemSource>,
    catalog: Option<MenuCatalog>,
    currency_symbol: String,
}

impl OrderItemResolver {
    pub fn new(
        source: Arc<dyn ItemSource>,
        catalog: Option<MenuCatalog>,
        currency_symbol: impl Into<String>,
    ) -> Self {
        Self {
            source,
            catalog,
            currency_symbol: currency_symbol.into(),
        }
    }

    /// Fetch and enrich the lines of `order_id`.
    pub async fn resolve_items(&self, order_id: &str) -> Result<Vec<OrderItem>> {
        let rows = self.source.fetch_items(order_id).await?;
        let items: Vec<OrderItem> = rows
            .iter()
            .enumerate()
            .map(|(index, row)| {
                let mut item = normalize_item(row);
                let joined = joined_catalog_name(row).or_else(|| {
                    Some(item.name.clone()).filter(|name| !name.is_empty())
                });
                item.name = self.display_name(index, &item, joined);
                item
            })
            .collect();
        debug!(order_id = %order_id, count = items.len(), "order items resolved");
        Ok(items)
    }

    /// Fill in any empty names in place, using each line's position.
    pub fn complete_names(&self, items: &mut [OrderItem]) {
        for (index, item) in items.iter_mut().enumerate() {
            if item.name.trim().is_empty() {
                item.name = self.display_name(index, item, None);
            }
        }
    }

    pub fn display_name(&self, index: usize, item: &OrderItem, joined: Option<String>) -> String {
        joined
            .or_else(|| {
                let id = item.menu_item_id.as_deref()?;
                self.catalog.as_ref()?.item_name(id)
            })
            .or_else(|| embedded_name(&item.customizations))
            .unwrap_or_else(|| self.fallback_name(index, item.unit_price))
    }

    pub fn fallback_name(&self, index: usize, unit_price: f64) -> String {
        format!("Item {} ({}{:.2})", index + 1, self.currency_symbol, unit_price)
    }
}
