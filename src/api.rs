//! Admin dashboard API client.
//!
//! Authenticated HTTP access to the admin dashboard: forward-sync delivery,
//! order item lookups and a lightweight connectivity check.

use async_trait::async_trait;
use reqwest::{Client, Method, StatusCode};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info};

use crate::config::SyncConfig;
use crate::error::{Result, SyncError};
use crate::forward_sync::{DeliveryEndpoint, QueueEntry};
use crate::items::ItemSource;
use crate::models::EntityType;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Connectivity probes should fail fast.
const CONNECTIVITY_TIMEOUT: Duration = Duration::from_secs(10);

const IDEMPOTENCY_HEADER: &str = "Idempotency-Key";

// ---------------------------------------------------------------------------
// URL normalisation
// ---------------------------------------------------------------------------

/// Canonical base URL: scheme added when missing (plain http only for
/// loopback hosts), trailing slashes and one trailing `/api` removed.
pub fn normalize_admin_url(url: &str) -> String {
    let mut url = url.trim().to_string();
    if url.is_empty() {
        return url;
    }

    if !url.starts_with("http://") && !url.starts_with("https://") {
        if url.starts_with("localhost") || url.starts_with("127.0.0.1") {
            url = format!("http://{url}");
        } else {
            url = format!("https://{url}");
        }
    }

    while url.ends_with('/') {
        url.pop();
    }
    if url.ends_with("/api") {
        url.truncate(url.len() - 4);
    }
    while url.ends_with('/') {
        url.pop();
    }

    url
}

// ---------------------------------------------------------------------------
// Error mapping
// ---------------------------------------------------------------------------

fn friendly_error(url: &str, err: &reqwest::Error) -> SyncError {
    if err.is_connect() {
        return SyncError::Network(format!("Cannot reach admin dashboard at {url}"));
    }
    if err.is_timeout() {
        return SyncError::Network(format!("Connection to {url} timed out"));
    }
    if err.is_builder() {
        return SyncError::Config(format!("Invalid admin dashboard URL: {url}"));
    }
    SyncError::Network(format!("Network error communicating with {url}: {err}"))
}

fn status_message(status: StatusCode) -> String {
    match status.as_u16() {
        401 => "API key is invalid or expired".to_string(),
        403 => "Terminal not authorized".to_string(),
        404 => "Admin dashboard endpoint not found".to_string(),
        409 => "Conflicting write rejected by admin dashboard".to_string(),
        s if s >= 500 => format!("Admin dashboard server error (HTTP {s})"),
        s => format!("Unexpected response from admin dashboard (HTTP {s})"),
    }
}

/// Build the error for a non-2xx response, keeping validation details the
/// server sent back.
fn status_error(status: StatusCode, body_text: &str) -> SyncError {
    let body = body_text.trim();
    let message = match serde_json::from_str::<Value>(body) {
        Ok(json) => {
            let message = json
                .get("error")
                .or_else(|| json.get("message"))
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| status_message(status));
            match json.get("details").or_else(|| json.get("errors")) {
                Some(details) => format!("{message}: {details}"),
                None => message,
            }
        }
        Err(_) if !body.is_empty() => format!("{}: {body}", status_message(status)),
        Err(_) => status_message(status),
    };
    SyncError::Http {
        status: status.as_u16(),
        message,
    }
}

/// Remote path that accepts forward-sync writes for `entity`.
pub fn sync_path(entity: EntityType) -> &'static str {
    match entity {
        EntityType::Order | EntityType::OrderItem => "/api/pos/orders/sync",
        EntityType::Customer => "/api/pos/customers/sync",
        EntityType::CustomerAddress => "/api/pos/customer_addresses/sync",
    }
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

/// Outcome of [`AdminClient::test_connectivity`].
#[derive(Debug, serde::Serialize)]
pub struct ConnectivityResult {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone)]
pub struct AdminClient {
    base: String,
    api_key: String,
    terminal_id: String,
    http: Client,
}

impl AdminClient {
    pub fn new(config: &SyncConfig) -> Result<Self> {
        let base = normalize_admin_url(&config.admin_url);
        if base.is_empty() {
            return Err(SyncError::Config("admin_url is not configured".into()));
        }
        let http = Client::builder()
            .timeout(DEFAULT_TIMEOUT)
            .build()
            .map_err(|e| SyncError::Config(format!("Failed to create HTTP client: {e}")))?;
        Ok(Self {
            base,
            api_key: config.api_key.clone(),
            terminal_id: config.terminal_id.clone(),
            http,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base
    }

    /// Perform an authenticated request. `path` includes the leading slash,
    /// e.g. `/api/pos/orders/sync`. Empty bodies come back as `Null`.
    pub async fn request(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
        headers: &[(&str, &str)],
    ) -> Result<Value> {
        let url = format!("{}{path}", self.base);
        let mut req = self
            .http
            .request(method.clone(), &url)
            .header("X-POS-API-Key", &self.api_key)
            .header("x-terminal-id", &self.terminal_id);
        for (name, value) in headers {
            req = req.header(*name, *value);
        }
        if let Some(body) = body {
            req = req.json(body);
        }

        let resp = req.send().await.map_err(|e| friendly_error(&self.base, &e))?;
        let status = resp.status();
        let body_text = resp.text().await.unwrap_or_default();
        debug!(method = %method, path = %path, status = status.as_u16(), "admin request");

        if !status.is_success() {
            return Err(status_error(status, &body_text));
        }
        if body_text.trim().is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(&body_text).map_err(|e| {
            SyncError::InvalidPayload(format!("Invalid JSON from admin dashboard: {e}"))
        })
    }

    /// Lightweight health check against `/api/health`.
    pub async fn test_connectivity(&self) -> ConnectivityResult {
        let start = Instant::now();
        let resp = self
            .http
            .get(format!("{}/api/health", self.base))
            .timeout(CONNECTIVITY_TIMEOUT)
            .header("X-POS-API-Key", &self.api_key)
            .send()
            .await;
        let latency = u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX);

        match resp {
            Ok(resp) if resp.status().is_success() => {
                info!(latency_ms = latency, "connectivity test passed");
                ConnectivityResult {
                    success: true,
                    latency_ms: Some(latency),
                    error: None,
                }
            }
            Ok(resp) => ConnectivityResult {
                success: false,
                latency_ms: Some(latency),
                error: Some(status_message(resp.status())),
            },
            Err(e) => ConnectivityResult {
                success: false,
                latency_ms: None,
                error: Some(friendly_error(&self.base, &e).to_string()),
            },
        }
    }
}

// ---------------------------------------------------------------------------
// Forward sync delivery
// ---------------------------------------------------------------------------

pub fn delivery_body(entry: &QueueEntry) -> Value {
    json!({
        "operation": entry.operation,
        "entity_type": entry.entity_type.as_str(),
        "entity_id": entry.entity_id,
        "idempotency_key": entry.idempotency_key,
        "payload": entry.payload,
    })
}

/// Delivers queue entries to the admin dashboard. The idempotency key goes
/// out both as a header and in the body so retries are deduplicated.
pub struct HttpDeliveryEndpoint {
    client: Arc<AdminClient>,
}

impl HttpDeliveryEndpoint {
    pub fn new(client: Arc<AdminClient>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl DeliveryEndpoint for HttpDeliveryEndpoint {
    async fn deliver(&self, entry: &QueueEntry) -> Result<Value> {
        self.client
            .request(
                Method::POST,
                sync_path(entry.entity_type),
                Some(&delivery_body(entry)),
                &[(IDEMPOTENCY_HEADER, entry.idempotency_key.as_str())],
            )
            .await
    }
}

// ---------------------------------------------------------------------------
// Order items
// ---------------------------------------------------------------------------

/// Item rows from a response that is either a bare array or wrapped in
/// `items` / `data`.
pub fn item_rows(body: Value) -> Vec<Value> {
    match body {
        Value::Array(rows) => rows,
        Value::Object(mut map) => match map.remove("items").or_else(|| map.remove("data")) {
            Some(Value::Array(rows)) => rows,
            _ => Vec::new(),
        },
        _ => Vec::new(),
    }
}

pub struct RemoteItemSource {
    client: Arc<AdminClient>,
}

impl RemoteItemSource {
    pub fn new(client: Arc<AdminClient>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ItemSource for RemoteItemSource {
    async fn fetch_items(&self, order_id: &str) -> Result<Vec<Value>> {
        let path = format!("/api/pos/orders/{order_id}/items");
        let body = self.client.request(Method::GET, &path, None, &[]).await?;
        Ok(item_rows(body))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::forward_sync::EntryStatus;

    #[test]
    fn admin_url_is_normalized() {
        assert_eq!(
            normalize_admin_url("admin.example.com/api/"),
            "https://admin.example.com"
        );
        assert_eq!(
            normalize_admin_url(" localhost:3001/ "),
            "http://localhost:3001"
        );
        assert_eq!(normalize_admin_url("https://a.b//"), "https://a.b");
        assert_eq!(normalize_admin_url(""), "");
    }

    #[test]
    fn client_requires_an_admin_url() {
        assert!(matches!(
            AdminClient::new(&SyncConfig::default()),
            Err(SyncError::Config(_))
        ));
        let config = SyncConfig {
            admin_url: "admin.example.com".into(),
            ..SyncConfig::default()
        };
        assert_eq!(
            AdminClient::new(&config).unwrap().base_url(),
            "https://admin.example.com"
        );
    }

    #[test]
    fn error_body_details_are_kept_and_classified() {
        let err = status_error(
            StatusCode::UNPROCESSABLE_ENTITY,
            r#"{"error":"Validation failed","details":{"total":"required"}}"#,
        );
        match &err {
            SyncError::Http { status, message } => {
                assert_eq!(*status, 422);
                assert!(message.starts_with("Validation failed"));
                assert!(message.contains("total"));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(!err.is_transient());

        let err = status_error(StatusCode::BAD_GATEWAY, "");
        assert!(err.is_transient());
        assert!(err.to_string().contains("server error"));
    }

    #[test]
    fn sync_paths_by_entity() {
        assert_eq!(sync_path(EntityType::Order), "/api/pos/orders/sync");
        assert_eq!(sync_path(EntityType::OrderItem), "/api/pos/orders/sync");
        assert_eq!(sync_path(EntityType::Customer), "/api/pos/customers/sync");
    }

    #[test]
    fn delivery_body_carries_the_idempotency_key() {
        let entry = QueueEntry {
            id: 1,
            entity_type: EntityType::Order,
            entity_id: "o-1".into(),
            operation: "status_update".into(),
            payload: json!({"status": "ready"}),
            idempotency_key: "order:o-1:status_update:v3".into(),
            deferred_update: None,
            status: EntryStatus::InFlight,
            attempts: 0,
            max_attempts: 5,
            retry_delay_ms: 1000,
            next_retry_at: None,
            last_error: None,
            created_at: None,
        };
        let body = delivery_body(&entry);
        assert_eq!(body["idempotency_key"], "order:o-1:status_update:v3");
        assert_eq!(body["entity_type"], "order");
        assert_eq!(body["payload"]["status"], "ready");
    }

    #[test]
    fn item_rows_accepts_bare_and_wrapped_arrays() {
        assert_eq!(item_rows(json!([{"id": 1}])).len(), 1);
        assert_eq!(item_rows(json!({"items": [{"id": 1}, {"id": 2}]})).len(), 2);
        assert_eq!(item_rows(json!({"data": []})).len(), 0);
        assert!(item_rows(json!({"success": false})).is_empty());
    }
}
