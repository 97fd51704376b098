//! End-to-end flows through the public engine API with in-memory SQLite
//! and scripted collaborators.

use async_trait::async_trait;
use chrono::{Duration, TimeZone, Utc};
use serde_json::{json, Map, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

use the_small_pos_sync::change_feed::{ChannelMessage, ChannelSpec, ChannelStatus};
use the_small_pos_sync::forward_sync::QueueEntry;
use the_small_pos_sync::models::{ChangeKind, RawChange, ResolutionStrategy};
use the_small_pos_sync::{
    db, Clock, CredentialVerifier, DeliveryEndpoint, ItemSource, ManualClock, MergeOutcome,
    OrderStatus, RealtimeTransport, Result, SyncConfig, SyncEngine, SyncError, SyncEvent,
};

struct QuietFeed;

#[async_trait]
impl RealtimeTransport for QuietFeed {
    async fn open(&self, _spec: &ChannelSpec) -> Result<mpsc::UnboundedReceiver<ChannelMessage>> {
        let (tx, rx) = mpsc::unbounded_channel();
        let _ = tx.send(ChannelMessage::Status(ChannelStatus::Subscribed));
        Ok(rx)
    }

    async fn close(&self, _channel_name: &str) -> Result<()> {
        Ok(())
    }
}

#[derive(Default)]
struct Endpoint {
    fail: bool,
    calls: AtomicUsize,
}

#[async_trait]
impl DeliveryEndpoint for Endpoint {
    async fn deliver(&self, _entry: &QueueEntry) -> Result<Value> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(SyncError::Network("connection refused".into()));
        }
        Ok(json!({"success": true}))
    }
}

struct NoItems;

#[async_trait]
impl ItemSource for NoItems {
    async fn fetch_items(&self, _order_id: &str) -> Result<Vec<Value>> {
        Ok(Vec::new())
    }
}

struct Pin1234;

impl CredentialVerifier for Pin1234 {
    fn verify(&self, _identity: &str, secret: &str) -> Result<bool> {
        Ok(secret == "1234")
    }
}

fn engine(endpoint: Arc<Endpoint>) -> (SyncEngine, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::new(
        Utc.with_ymd_and_hms(2026, 3, 2, 12, 0, 0).unwrap(),
    ));
    let engine = SyncEngine::builder()
        .config(SyncConfig {
            terminal_id: "term-1".into(),
            ..SyncConfig::default()
        })
        .database(Arc::new(db::open_in_memory().unwrap()))
        .transport(Arc::new(QuietFeed))
        .delivery_endpoint(endpoint)
        .item_source(Arc::new(NoItems))
        .credential_verifier(Arc::new(Pin1234))
        .clock(clock.clone())
        .build()
        .unwrap();
    (engine, clock)
}

fn remote_order(id: &str, version: i64, status: &str, updated_at: &str) -> Value {
    json!({
        "id": id,
        "order_number": format!("ORD-{id}"),
        "status": status,
        "order_type": "delivery",
        "total_amount": 12.5,
        "version": version,
        "terminal_id": "term-2",
        "items": [{"id": "l-1", "name": "Club sandwich", "quantity": 1, "unit_price": 12.5}],
        "created_at": "2026-03-02T09:00:00Z",
        "updated_at": updated_at,
    })
}

fn upsert(kind: ChangeKind, row: Value) -> RawChange {
    RawChange {
        table: "orders".into(),
        event_type: kind,
        new: row,
        old: Value::Null,
    }
}

#[tokio::test]
async fn external_duplicates_collapse_and_wait_for_acceptance() {
    let (engine, _clock) = engine(Arc::default());

    let mut first = remote_order("wolt-a", 1, "pending", "2026-03-02T09:00:00Z");
    first["platform"] = json!("wolt");
    first["external_platform_order_id"] = json!("W-77");
    let mut second = remote_order("wolt-b", 1, "pending", "2026-03-02T09:01:00Z");
    second["platform"] = json!("Wolt");
    second["external_platform_order_id"] = json!("W-77");
    let own = remote_order("counter-1", 1, "confirmed", "2026-03-02T09:02:00Z");

    for row in [first, second, own] {
        let outcome = engine.apply_change(&upsert(ChangeKind::Insert, row)).await.unwrap();
        assert_eq!(outcome, MergeOutcome::Inserted);
    }

    let view = engine.orders_view().unwrap();
    assert_eq!(view.orders.len(), 2);
    assert_eq!(view.pending_external.len(), 1);
    assert_eq!(view.pending_external[0].id, "wolt-b");
    let visible: Vec<&str> = view.visible().iter().map(|o| o.id.as_str()).collect();
    assert_eq!(visible, vec!["counter-1"]);
}

#[tokio::test]
async fn concurrent_edit_is_recorded_and_settled_explicitly() {
    let (engine, _clock) = engine(Arc::default());
    let conflicts = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&conflicts);
    let _sub = engine.events().on(move |event| match event {
        SyncEvent::Conflict(record) => sink.lock().unwrap().push(record.id.clone()),
        SyncEvent::ConflictResolved(_) => sink.lock().unwrap().push("resolved".into()),
        _ => {}
    });

    engine
        .apply_change(&upsert(
            ChangeKind::Insert,
            remote_order("r-1", 1, "confirmed", "2026-03-02T09:00:00Z"),
        ))
        .await
        .unwrap();

    let mut edit = Map::new();
    edit.insert("status".into(), json!("preparing"));
    let local = engine.update_order("r-1", edit).unwrap();
    assert_eq!(local.version, 2);

    let outcome = engine
        .apply_change(&upsert(
            ChangeKind::Update,
            remote_order("r-1", 3, "ready", "2026-03-02T12:10:00Z"),
        ))
        .await
        .unwrap();
    let MergeOutcome::Conflict { conflict_id } = outcome else {
        panic!("expected a conflict, got {outcome:?}");
    };

    // Local state is untouched until someone decides.
    let view = engine.orders_view().unwrap();
    assert_eq!(view.orders[0].status, OrderStatus::Preparing);
    assert_eq!(engine.open_conflicts().unwrap().len(), 1);

    let record = engine
        .resolve_conflict(&conflict_id, ResolutionStrategy::RemoteWins)
        .unwrap();
    assert!(record.is_resolved());
    assert!(engine.open_conflicts().unwrap().is_empty());

    let view = engine.orders_view().unwrap();
    assert_eq!(view.orders[0].status, OrderStatus::Ready);
    assert_eq!(view.orders[0].version, 3);
    assert_eq!(
        *conflicts.lock().unwrap(),
        vec![conflict_id, "resolved".to_string()]
    );
}

#[tokio::test]
async fn undeliverable_write_is_quarantined_after_five_attempts() {
    let endpoint = Arc::new(Endpoint {
        fail: true,
        ..Endpoint::default()
    });
    let (engine, clock) = engine(endpoint.clone());
    let failures = Arc::new(AtomicUsize::new(0));
    let seen = Arc::clone(&failures);
    let _sub = engine.events().on(move |event| {
        if matches!(event, SyncEvent::PermanentFailure { .. }) {
            seen.fetch_add(1, Ordering::SeqCst);
        }
    });

    engine
        .create_order(the_small_pos_sync::Order::new_local("local-9", "term-1", clock.now()))
        .unwrap();

    for _ in 0..6 {
        engine.flush_now().await.unwrap();
        clock.advance(Duration::minutes(10));
    }

    assert_eq!(endpoint.calls.load(Ordering::SeqCst), 5);
    assert_eq!(failures.load(Ordering::SeqCst), 1);
    let stats = engine.forward_queue().stats().unwrap();
    assert_eq!(stats.quarantined, 1);
    assert_eq!(stats.pending, 0);
    assert!(stats.oldest_error.is_some());
}

#[tokio::test]
async fn lockout_and_session_share_the_engine_clock() {
    let (engine, clock) = engine(Arc::default());
    let sessions = engine.sessions();
    for _ in 0..5 {
        assert!(sessions.login("0000", Some("staff-1")).is_err());
    }
    assert!(matches!(
        sessions.login("1234", Some("staff-1")),
        Err(SyncError::Locked { .. })
    ));

    clock.advance(Duration::minutes(15));
    sessions.login("1234", Some("staff-1")).unwrap();
    clock.advance(Duration::minutes(31));
    assert!(sessions.current_session().unwrap().is_none());
}
