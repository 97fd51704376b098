//! Sync engine configuration.
//!
//! Values come from three layers, later layers winning: compiled defaults,
//! the `sync` category of the `local_settings` table, and `POS_SYNC_*`
//! environment variables.

use chrono::NaiveTime;
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::error::{Result, SyncError};
use crate::models::EntityType;

pub const SETTINGS_CATEGORY: &str = "sync";
const ENV_PREFIX: &str = "POS_SYNC_";

/// Tables the change feed watches by default.
pub const DEFAULT_WATCHED_TABLES: &[&str] =
    &["orders", "order_items", "customers", "customer_addresses"];

/// How a detected conflict gets resolved once it has been recorded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictPolicy {
    /// Leave the conflict open for an operator.
    #[default]
    Manual,
    RemoteWins,
    LocalWins,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ConflictPolicies {
    pub orders: ConflictPolicy,
    pub customers: ConflictPolicy,
    pub customer_addresses: ConflictPolicy,
}

impl ConflictPolicies {
    pub fn for_entity(&self, entity: EntityType) -> ConflictPolicy {
        match entity {
            EntityType::Order | EntityType::OrderItem => self.orders,
            EntityType::Customer => self.customers,
            EntityType::CustomerAddress => self.customer_addresses,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SyncConfig {
    pub terminal_id: String,
    pub branch_id: Option<String>,
    pub admin_url: String,
    pub api_key: String,
    pub realtime_url: String,
    pub realtime_api_key: String,
    pub watched_tables: Vec<String>,

    pub reconnect_base_ms: u64,
    pub reconnect_max_ms: u64,

    pub forward_max_attempts: u32,
    pub forward_base_delay_ms: i64,
    pub forward_max_delay_ms: i64,
    pub flush_interval_secs: u64,

    pub max_failed_logins: u32,
    pub lockout_minutes: i64,
    pub session_max_hours: i64,
    pub session_inactivity_minutes: i64,
    /// `HH:MM` wall-clock time after which every session is forced out.
    pub session_daily_cutoff: Option<String>,
    /// Offset applied to UTC to get the terminal's wall clock.
    pub timezone_offset_minutes: i32,
    pub session_check_interval_secs: u64,

    pub currency_symbol: String,
    pub conflict_policy: ConflictPolicies,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            terminal_id: String::new(),
            branch_id: None,
            admin_url: String::new(),
            api_key: String::new(),
            realtime_url: String::new(),
            realtime_api_key: String::new(),
            watched_tables: DEFAULT_WATCHED_TABLES
                .iter()
                .map(|t| t.to_string())
                .collect(),
            reconnect_base_ms: 1_000,
            reconnect_max_ms: 10_000,
            forward_max_attempts: 5,
            forward_base_delay_ms: 5_000,
            forward_max_delay_ms: 300_000,
            flush_interval_secs: 10,
            max_failed_logins: 5,
            lockout_minutes: 15,
            session_max_hours: 2,
            session_inactivity_minutes: 30,
            session_daily_cutoff: None,
            timezone_offset_minutes: 0,
            session_check_interval_secs: 15,
            currency_symbol: "€".to_string(),
            conflict_policy: ConflictPolicies::default(),
        }
    }
}

impl SyncConfig {
    /// Load defaults, overlay the `sync` settings category, then the
    /// process environment.
    pub fn load(conn: &Connection) -> Result<Self> {
        let config = Self::from_settings(conn)?;
        let config = config.with_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Defaults overlaid with whatever the settings table holds.
    pub fn from_settings(conn: &Connection) -> Result<Self> {
        let mut stmt = conn.prepare(
            "SELECT setting_key, setting_value FROM local_settings WHERE setting_category = ?1",
        )?;
        let rows = stmt.query_map(params![SETTINGS_CATEGORY], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;

        let mut merged = serde_json::to_value(Self::default())?;
        if let Value::Object(ref mut map) = merged {
            for (key, raw) in rows.flatten() {
                // Settings are stored as text; structured values are JSON.
                let textual = matches!(map.get(&key), Some(Value::String(_) | Value::Null));
                let value = if textual {
                    Value::String(raw)
                } else {
                    serde_json::from_str::<Value>(&raw).unwrap_or(Value::String(raw))
                };
                debug!(key = %key, "sync setting loaded");
                map.insert(key, value);
            }
        }

        serde_json::from_value(merged)
            .map_err(|e| SyncError::Config(format!("invalid sync settings: {e}")))
    }

    /// Apply `POS_SYNC_*` overrides using the provided lookup.
    pub fn with_overrides<F>(mut self, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| {
            lookup(&format!("{ENV_PREFIX}{name}"))
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        if let Some(v) = var("TERMINAL_ID") {
            self.terminal_id = v;
        }
        if let Some(v) = var("BRANCH_ID") {
            self.branch_id = Some(v);
        }
        if let Some(v) = var("ADMIN_URL") {
            self.admin_url = v;
        }
        if let Some(v) = var("API_KEY") {
            self.api_key = v;
        }
        if let Some(v) = var("REALTIME_URL") {
            self.realtime_url = v;
        }
        if let Some(v) = var("REALTIME_API_KEY") {
            self.realtime_api_key = v;
        }
        if let Some(v) = var("CURRENCY_SYMBOL") {
            self.currency_symbol = v;
        }
        if let Some(v) = var("FLUSH_INTERVAL_SECS") {
            match v.parse() {
                Ok(secs) => self.flush_interval_secs = secs,
                Err(_) => warn!(value = %v, "ignoring invalid POS_SYNC_FLUSH_INTERVAL_SECS"),
            }
        }
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.terminal_id.trim().is_empty() {
            return Err(SyncError::Config("terminal_id is required".into()));
        }
        if self.reconnect_base_ms == 0 || self.reconnect_max_ms < self.reconnect_base_ms {
            return Err(SyncError::Config(
                "reconnect backoff must satisfy 0 < base <= max".into(),
            ));
        }
        if self.forward_max_attempts == 0 {
            return Err(SyncError::Config(
                "forward_max_attempts must be at least 1".into(),
            ));
        }
        if let Some(raw) = &self.session_daily_cutoff {
            if parse_cutoff(raw).is_none() {
                return Err(SyncError::Config(format!(
                    "session_daily_cutoff must be HH:MM, got {raw:?}"
                )));
            }
        }
        Ok(())
    }

    pub fn daily_cutoff(&self) -> Option<NaiveTime> {
        self.session_daily_cutoff.as_deref().and_then(parse_cutoff)
    }
}

fn parse_cutoff(raw: &str) -> Option<NaiveTime> {
    NaiveTime::parse_from_str(raw.trim(), "%H:%M").ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;

    fn test_conn() -> Connection {
        let conn = Connection::open_in_memory().expect("open in-memory db");
        db::run_migrations_for_test(&conn);
        conn
    }

    #[test]
    fn defaults_match_documented_backoff() {
        let config = SyncConfig::default();
        assert_eq!(config.reconnect_base_ms, 1_000);
        assert_eq!(config.reconnect_max_ms, 10_000);
        assert_eq!(config.forward_max_attempts, 5);
        assert_eq!(config.lockout_minutes, 15);
        assert_eq!(config.watched_tables.len(), 4);
    }

    #[test]
    fn settings_table_overrides_defaults() {
        let conn = test_conn();
        db::set_setting(&conn, SETTINGS_CATEGORY, "terminalId", "term-7").unwrap();
        db::set_setting(&conn, SETTINGS_CATEGORY, "reconnectMaxMs", "20000").unwrap();
        db::set_setting(
            &conn,
            SETTINGS_CATEGORY,
            "conflictPolicy",
            r#"{"customers":"remote_wins"}"#,
        )
        .unwrap();

        let config = SyncConfig::from_settings(&conn).unwrap();
        assert_eq!(config.terminal_id, "term-7");
        assert_eq!(config.reconnect_max_ms, 20_000);
        assert_eq!(
            config.conflict_policy.for_entity(EntityType::Customer),
            ConflictPolicy::RemoteWins
        );
        assert_eq!(
            config.conflict_policy.for_entity(EntityType::Order),
            ConflictPolicy::Manual
        );
    }

    #[test]
    fn env_overrides_win_over_settings() {
        let conn = test_conn();
        db::set_setting(&conn, SETTINGS_CATEGORY, "terminalId", "term-7").unwrap();
        let config = SyncConfig::from_settings(&conn)
            .unwrap()
            .with_overrides(|key| match key {
                "POS_SYNC_TERMINAL_ID" => Some("term-env".to_string()),
                "POS_SYNC_FLUSH_INTERVAL_SECS" => Some("not-a-number".to_string()),
                _ => None,
            });
        assert_eq!(config.terminal_id, "term-env");
        assert_eq!(config.flush_interval_secs, 10);
    }

    #[test]
    fn validate_rejects_missing_terminal_and_bad_cutoff() {
        let config = SyncConfig::default();
        assert!(config.validate().is_err());

        let config = SyncConfig {
            terminal_id: "term-1".into(),
            session_daily_cutoff: Some("25:99".into()),
            ..SyncConfig::default()
        };
        assert!(config.validate().is_err());

        let config = SyncConfig {
            terminal_id: "term-1".into(),
            session_daily_cutoff: Some("04:30".into()),
            ..SyncConfig::default()
        };
        config.validate().unwrap();
        assert_eq!(
            config.daily_cutoff(),
            NaiveTime::from_hms_opt(4, 30, 0)
        );
    }
}
