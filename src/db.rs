//! Local SQLite database layer for the sync engine.
//!
//! Uses rusqlite with WAL mode. Provides schema migrations, settings
//! helpers, and the shared connection handle every component writes
//! through. One statement (or one transaction) per record keeps merge
//! writes atomic.

use rusqlite::{params, Connection};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, error, info, warn};

use crate::error::{Result, SyncError};

/// Shared database handle.
pub struct DbState {
    pub conn: Mutex<Connection>,
    pub db_path: PathBuf,
}

impl DbState {
    pub fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| SyncError::lock_poisoned())
    }
}

/// Highest migration shipped with this build.
const CURRENT_SCHEMA_VERSION: i32 = 3;

/// Settings category/key holding the last end-of-day settlement time.
pub const SETTLEMENT_CATEGORY: &str = "system";
pub const SETTLEMENT_KEY: &str = "last_z_report_timestamp";

/// Initialize the database at `{data_dir}/pos-sync.db`.
///
/// A file that cannot be opened (corrupt, or a half-written WAL pair) is
/// removed and recreated once; the remote store is the source of truth for
/// anything but unsent local writes.
pub fn init(data_dir: &Path) -> Result<DbState> {
    fs::create_dir_all(data_dir)
        .map_err(|e| SyncError::Database(format!("Failed to create data dir: {e}")))?;

    let db_path = data_dir.join("pos-sync.db");
    info!(path = %db_path.display(), "opening sync database");

    let conn = match open_and_configure(&db_path) {
        Ok(c) => c,
        Err(first_err) => {
            warn!(error = %first_err, "sync database unreadable, recreating");
            if db_path.exists() {
                let _ = fs::remove_file(&db_path);
                let _ = fs::remove_file(db_path.with_extension("db-wal"));
                let _ = fs::remove_file(db_path.with_extension("db-shm"));
            }
            open_and_configure(&db_path).map_err(|e| {
                SyncError::Database(format!("Database open failed after retry: {e}"))
            })?
        }
    };

    run_migrations(&conn)?;

    info!(schema = CURRENT_SCHEMA_VERSION, "sync database ready");

    Ok(DbState {
        conn: Mutex::new(conn),
        db_path,
    })
}

/// Fully migrated in-memory database.
pub fn open_in_memory() -> Result<DbState> {
    let conn = Connection::open_in_memory()?;
    conn.execute_batch(
        "PRAGMA foreign_keys = ON;
         PRAGMA busy_timeout = 5000;",
    )?;
    run_migrations(&conn)?;
    Ok(DbState {
        conn: Mutex::new(conn),
        db_path: PathBuf::from(":memory:"),
    })
}

fn open_and_configure(path: &Path) -> Result<Connection> {
    let conn = Connection::open(path)?;

    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA foreign_keys = ON;
         PRAGMA busy_timeout = 5000;
         PRAGMA synchronous = NORMAL;",
    )?;

    Ok(conn)
}

fn run_migrations(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT DEFAULT (datetime('now'))
        );",
    )?;

    let current: i32 = conn
        .query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_version",
            [],
            |row| row.get(0),
        )
        .unwrap_or(0);

    if current >= CURRENT_SCHEMA_VERSION {
        debug!(schema = current, "no migrations pending");
        return Ok(());
    }

    info!(from = current, to = CURRENT_SCHEMA_VERSION, "migrating sync database");

    if current < 1 {
        migrate_v1(conn)?;
    }
    if current < 2 {
        migrate_v2(conn)?;
    }
    if current < 3 {
        migrate_v3(conn)?;
    }

    Ok(())
}

fn apply(conn: &Connection, version: i32, sql: &str) -> Result<()> {
    conn.execute_batch(sql).map_err(|e| {
        error!("Migration v{version} failed: {e}");
        SyncError::Database(format!("migration v{version}: {e}"))
    })?;
    info!("Applied migration v{version}");
    Ok(())
}

/// Migration v1: settings, orders, outbound queue, menu cache.
fn migrate_v1(conn: &Connection) -> Result<()> {
    apply(
        conn,
        1,
        "
        CREATE TABLE IF NOT EXISTS local_settings (
            id TEXT PRIMARY KEY DEFAULT (lower(hex(randomblob(16)))),
            setting_category TEXT NOT NULL,
            setting_key TEXT NOT NULL,
            setting_value TEXT NOT NULL,
            created_at TEXT DEFAULT (datetime('now')),
            updated_at TEXT DEFAULT (datetime('now')),
            UNIQUE(setting_category, setting_key)
        );

        CREATE TABLE IF NOT EXISTS orders (
            id TEXT PRIMARY KEY,
            remote_id TEXT,
            order_number TEXT,
            status TEXT NOT NULL DEFAULT 'pending',
            order_type TEXT NOT NULL DEFAULT 'pickup',
            items TEXT NOT NULL DEFAULT '[]',
            subtotal REAL NOT NULL DEFAULT 0,
            tax_amount REAL NOT NULL DEFAULT 0,
            total_amount REAL NOT NULL DEFAULT 0,
            customer_id TEXT,
            customer_name TEXT,
            customer_phone TEXT,
            delivery_address TEXT,
            special_instructions TEXT,
            payment_status TEXT NOT NULL DEFAULT 'pending',
            payment_method TEXT,
            version INTEGER NOT NULL DEFAULT 1,
            origin_terminal_id TEXT,
            platform TEXT,
            external_platform_order_id TEXT,
            is_closed INTEGER NOT NULL DEFAULT 0,
            closed_report_id TEXT,
            sync_status TEXT NOT NULL DEFAULT 'pending',
            pending_changes TEXT NOT NULL DEFAULT '{}',
            updated_by TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            last_synced_at TEXT,
            deleted_at TEXT
        );

        -- Durable outbound queue; rows leave only on acknowledgement.
        CREATE TABLE IF NOT EXISTS sync_queue (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            entity_type TEXT NOT NULL,
            entity_id TEXT NOT NULL,
            operation TEXT NOT NULL,
            payload TEXT NOT NULL,
            idempotency_key TEXT UNIQUE NOT NULL,
            deferred_update TEXT,
            status TEXT NOT NULL DEFAULT 'pending',
            attempts INTEGER NOT NULL DEFAULT 0,
            max_attempts INTEGER NOT NULL DEFAULT 5,
            retry_delay_ms INTEGER NOT NULL DEFAULT 5000,
            next_retry_at TEXT,
            last_error TEXT,
            created_at TEXT DEFAULT (datetime('now')),
            updated_at TEXT DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS menu_cache (
            id TEXT PRIMARY KEY DEFAULT (lower(hex(randomblob(16)))),
            cache_key TEXT UNIQUE NOT NULL,
            data TEXT NOT NULL,
            version TEXT,
            updated_at TEXT DEFAULT (datetime('now'))
        );

        CREATE INDEX IF NOT EXISTS idx_orders_remote_id ON orders(remote_id);
        CREATE INDEX IF NOT EXISTS idx_orders_order_number ON orders(order_number);
        CREATE INDEX IF NOT EXISTS idx_orders_sync_status ON orders(sync_status);
        CREATE INDEX IF NOT EXISTS idx_orders_created_at ON orders(created_at);
        CREATE INDEX IF NOT EXISTS idx_sync_queue_status ON sync_queue(status);
        CREATE INDEX IF NOT EXISTS idx_sync_queue_record ON sync_queue(entity_type, entity_id, id);
        CREATE INDEX IF NOT EXISTS idx_local_settings_cat_key ON local_settings(setting_category, setting_key);

        INSERT INTO schema_version (version) VALUES (1);
        ",
    )
}

/// Migration v2: customer mirror tables.
fn migrate_v2(conn: &Connection) -> Result<()> {
    apply(
        conn,
        2,
        "
        CREATE TABLE IF NOT EXISTS customers (
            id TEXT PRIMARY KEY,
            name TEXT,
            phone TEXT,
            email TEXT,
            notes TEXT,
            is_banned INTEGER NOT NULL DEFAULT 0,
            version INTEGER NOT NULL DEFAULT 1,
            updated_by TEXT,
            sync_status TEXT NOT NULL DEFAULT 'synced',
            pending_changes TEXT NOT NULL DEFAULT '{}',
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            last_synced_at TEXT,
            deleted_at TEXT
        );

        CREATE TABLE IF NOT EXISTS customer_addresses (
            id TEXT PRIMARY KEY,
            customer_id TEXT NOT NULL,
            street_address TEXT,
            city TEXT,
            postal_code TEXT,
            floor_number TEXT,
            notes TEXT,
            is_default INTEGER NOT NULL DEFAULT 0,
            version INTEGER NOT NULL DEFAULT 1,
            updated_by TEXT,
            sync_status TEXT NOT NULL DEFAULT 'synced',
            pending_changes TEXT NOT NULL DEFAULT '{}',
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            last_synced_at TEXT,
            deleted_at TEXT
        );

        CREATE INDEX IF NOT EXISTS idx_customers_phone ON customers(phone);
        CREATE INDEX IF NOT EXISTS idx_customer_addresses_customer ON customer_addresses(customer_id);

        INSERT INTO schema_version (version) VALUES (2);
        ",
    )
}

/// Migration v3: durable conflict records.
fn migrate_v3(conn: &Connection) -> Result<()> {
    apply(
        conn,
        3,
        "
        CREATE TABLE IF NOT EXISTS sync_conflicts (
            id TEXT PRIMARY KEY,
            entity_id TEXT NOT NULL,
            entity_type TEXT NOT NULL,
            local_version INTEGER NOT NULL,
            remote_version INTEGER NOT NULL,
            local_snapshot TEXT NOT NULL,
            remote_snapshot TEXT NOT NULL,
            conflict_type TEXT NOT NULL DEFAULT 'version_mismatch',
            created_at TEXT NOT NULL,
            resolved_at TEXT,
            resolution_strategy TEXT
        );

        CREATE INDEX IF NOT EXISTS idx_sync_conflicts_entity
            ON sync_conflicts(entity_type, entity_id);
        CREATE INDEX IF NOT EXISTS idx_sync_conflicts_open
            ON sync_conflicts(resolved_at);

        INSERT INTO schema_version (version) VALUES (3);
        ",
    )
}

// ---------------------------------------------------------------------------
// Settings helpers
// ---------------------------------------------------------------------------

/// `None` when the key is absent.
pub fn get_setting(conn: &Connection, category: &str, key: &str) -> Option<String> {
    conn.query_row(
        "SELECT setting_value FROM local_settings WHERE setting_category = ?1 AND setting_key = ?2",
        params![category, key],
        |row| row.get(0),
    )
    .ok()
}

pub fn set_setting(conn: &Connection, category: &str, key: &str, value: &str) -> Result<()> {
    conn.execute(
        "INSERT INTO local_settings (setting_category, setting_key, setting_value, updated_at)
         VALUES (?1, ?2, ?3, datetime('now'))
         ON CONFLICT(setting_category, setting_key) DO UPDATE SET
            setting_value = excluded.setting_value,
            updated_at = excluded.updated_at",
        params![category, key, value],
    )?;
    Ok(())
}

/// Run all migrations on the given connection (test helper, not public API).
#[cfg(test)]
pub fn run_migrations_for_test(conn: &Connection) {
    run_migrations(conn).expect("run_migrations should succeed in test");
}
