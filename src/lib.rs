//! The Small POS - terminal sync engine
//!
//! Keeps a terminal's local SQLite store consistent with the shared remote
//! store. Remote row changes arrive over a realtime change feed and are
//! merged with optimistic concurrency; local writes leave through a durable
//! forward queue with backoff. The rest of the application reads a
//! deduplicated order view.
//!
//! Start with [`SyncEngine::builder`].

pub mod api;
pub mod change_feed;
pub mod clock;
pub mod config;
pub mod conflict;
pub mod db;
pub mod dedup;
pub mod engine;
pub mod error;
pub mod events;
pub mod forward_sync;
pub mod items;
pub mod logging;
pub mod merge;
pub mod models;
pub mod normalize;
pub mod realtime;
pub mod session;
pub mod store;

pub use change_feed::{ChangeFeedClient, RealtimeTransport};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{ConflictPolicy, SyncConfig};
pub use conflict::ConflictLedger;
pub use db::DbState;
pub use dedup::{DedupAndQueueSplitter, DedupView};
pub use engine::{SyncEngine, SyncEngineBuilder};
pub use error::{Result, SyncError};
pub use events::{Disposer, EventBus, Subscription, SyncEvent, TimeoutReason};
pub use forward_sync::{DeliveryEndpoint, ForwardSyncQueue};
pub use items::{ItemSource, OrderItemResolver};
pub use logging::init_logging;
pub use merge::{LocalMergeEngine, MergeOutcome};
pub use models::{ConflictRecord, Customer, CustomerAddress, Order, OrderItem, OrderStatus};
pub use session::{CredentialVerifier, SessionActivityGovernor};
pub use store::{LocalStore, SqliteStore};
