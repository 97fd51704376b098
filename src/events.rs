//! In-process notifications.
//!
//! Observers register with [`EventBus::on`] and get back a [`Subscription`]
//! that unregisters on drop. Long-lived owners collect their handles in a
//! [`Disposer`] and release everything with one `dispose()` call.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use tracing::warn;

use crate::models::{ConflictRecord, EntityType, OrderStatus};

/// Why a session was forced out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum TimeoutReason {
    Inactivity,
    DurationLimit,
    TimeLimit,
}

impl TimeoutReason {
    pub fn as_str(self) -> &'static str {
        match self {
            TimeoutReason::Inactivity => "inactivity",
            TimeoutReason::DurationLimit => "duration-limit",
            TimeoutReason::TimeLimit => "time-limit",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SyncEvent {
    Conflict(ConflictRecord),
    ConflictResolved(ConflictRecord),
    OrderCreated {
        order_id: String,
    },
    OrderStatusUpdated {
        order_id: String,
        from: OrderStatus,
        to: OrderStatus,
    },
    OrderDeleted {
        order_id: String,
    },
    RecordUpdated {
        entity_type: EntityType,
        entity_id: String,
    },
    RetryScheduled {
        entry_id: i64,
        entity_id: String,
        attempts: u32,
        next_retry_at: DateTime<Utc>,
    },
    PermanentFailure {
        entry_id: i64,
        entity_id: String,
        attempts: u32,
        last_error: String,
    },
    SessionTimeout {
        staff_id: String,
        reason: TimeoutReason,
    },
}

type Handler = Arc<dyn Fn(&SyncEvent) + Send + Sync>;

#[derive(Default)]
struct Registry {
    next_id: AtomicU64,
    handlers: Mutex<Vec<(u64, Handler)>>,
}

/// Fire-and-forget, in-process dispatch. Cheap to clone.
#[derive(Clone, Default)]
pub struct EventBus {
    inner: Arc<Registry>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler. It stays registered until the returned handle
    /// is dropped or unsubscribed.
    #[must_use = "dropping the subscription unregisters the handler"]
    pub fn on<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&SyncEvent) + Send + Sync + 'static,
    {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        match self.inner.handlers.lock() {
            Ok(mut handlers) => handlers.push((id, Arc::new(handler))),
            Err(_) => warn!("event bus lock poisoned, handler not registered"),
        }
        Subscription {
            id,
            registry: Arc::downgrade(&self.inner),
        }
    }

    pub fn emit(&self, event: SyncEvent) {
        // Snapshot so handlers may subscribe or unsubscribe re-entrantly.
        let handlers: Vec<Handler> = match self.inner.handlers.lock() {
            Ok(handlers) => handlers.iter().map(|(_, h)| Arc::clone(h)).collect(),
            Err(_) => {
                warn!("event bus lock poisoned, event dropped");
                return;
            }
        };
        for handler in handlers {
            handler(&event);
        }
    }

    pub fn handler_count(&self) -> usize {
        self.inner.handlers.lock().map(|h| h.len()).unwrap_or(0)
    }
}

/// Registration handle; unregisters on drop.
pub struct Subscription {
    id: u64,
    registry: Weak<Registry>,
}

impl Subscription {
    pub fn unsubscribe(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            if let Ok(mut handlers) = registry.handlers.lock() {
                handlers.retain(|(id, _)| *id != self.id);
            }
        }
    }
}

/// Owns resources whose release is their `Drop`: subscriptions,
/// cancellation guards, and similar handles. Released newest first.
#[derive(Default)]
pub struct Disposer {
    held: Vec<Box<dyn Send>>,
}

impl Disposer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add<T: Send + 'static>(&mut self, resource: T) {
        self.held.push(Box::new(resource));
    }

    pub fn len(&self) -> usize {
        self.held.len()
    }

    pub fn is_empty(&self) -> bool {
        self.held.is_empty()
    }

    pub fn dispose(&mut self) {
        while let Some(resource) = self.held.pop() {
            drop(resource);
        }
    }
}

impl Drop for Disposer {
    fn drop(&mut self) {
        self.dispose();
    }
}
