//! Wiring and lifecycle.
//!
//! [`SyncEngineBuilder`] assembles every component from explicitly supplied
//! collaborators and refuses to build when one is missing. A built
//! [`SyncEngine`] does nothing until `start()`, which recovers the forward
//! queue, opens the change feed and spawns three loops: the change pump,
//! the forward flush timer and the session watchdog. `stop()` tears all of
//! it down through one [`Disposer`].

use serde_json::{Map, Value};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::api::{AdminClient, HttpDeliveryEndpoint, RemoteItemSource};
use crate::change_feed::{ChangeFeedClient, RealtimeTransport};
use crate::clock::{Clock, SystemClock};
use crate::config::SyncConfig;
use crate::conflict::ConflictLedger;
use crate::db::DbState;
use crate::dedup::{DedupAndQueueSplitter, DedupView};
use crate::error::{Result, SyncError};
use crate::events::{Disposer, EventBus, SyncEvent};
use crate::forward_sync::{DeliveryEndpoint, FlushReport, ForwardSyncQueue};
use crate::items::{ItemSource, MenuCatalog, OrderItemResolver};
use crate::merge::{LocalMergeEngine, MergeOutcome};
use crate::models::{ConflictRecord, Order, RawChange, ResolutionStrategy};
use crate::realtime::PhoenixTransport;
use crate::session::{BcryptVerifier, CredentialVerifier, SessionActivityGovernor};
use crate::store::{LocalStore, SqliteStore};

/// Last computed order view; `None` means it must be rebuilt.
type ViewCache = Arc<Mutex<Option<Arc<DedupView>>>>;

fn invalidate(cache: &ViewCache) {
    if let Ok(mut view) = cache.lock() {
        *view = None;
    }
}

#[derive(Default)]
pub struct SyncEngineBuilder {
    config: Option<SyncConfig>,
    db: Option<Arc<DbState>>,
    transport: Option<Arc<dyn RealtimeTransport>>,
    endpoint: Option<Arc<dyn DeliveryEndpoint>>,
    item_source: Option<Arc<dyn ItemSource>>,
    verifier: Option<Arc<dyn CredentialVerifier>>,
    clock: Option<Arc<dyn Clock>>,
    events: Option<EventBus>,
    splitter: Option<DedupAndQueueSplitter>,
}

impl SyncEngineBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn config(mut self, config: SyncConfig) -> Self {
        self.config = Some(config);
        self
    }

    pub fn database(mut self, db: Arc<DbState>) -> Self {
        self.db = Some(db);
        self
    }

    pub fn transport(mut self, transport: Arc<dyn RealtimeTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn delivery_endpoint(mut self, endpoint: Arc<dyn DeliveryEndpoint>) -> Self {
        self.endpoint = Some(endpoint);
        self
    }

    pub fn item_source(mut self, source: Arc<dyn ItemSource>) -> Self {
        self.item_source = Some(source);
        self
    }

    pub fn credential_verifier(mut self, verifier: Arc<dyn CredentialVerifier>) -> Self {
        self.verifier = Some(verifier);
        self
    }

    /// Defaults to the system clock.
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Share an existing bus instead of creating one.
    pub fn events(mut self, events: EventBus) -> Self {
        self.events = Some(events);
        self
    }

    pub fn splitter(mut self, splitter: DedupAndQueueSplitter) -> Self {
        self.splitter = Some(splitter);
        self
    }

    /// Production collaborators: admin HTTP API, Phoenix websocket and
    /// bcrypt PINs.
    pub fn with_network_defaults(self) -> Result<Self> {
        let config = self.config.as_ref().ok_or(SyncError::MissingDependency("config"))?;
        let db = self.db.clone().ok_or(SyncError::MissingDependency("database"))?;
        let client = Arc::new(AdminClient::new(config)?);
        let transport = Arc::new(PhoenixTransport::new(config));
        Ok(self
            .transport(transport)
            .delivery_endpoint(Arc::new(HttpDeliveryEndpoint::new(Arc::clone(&client))))
            .item_source(Arc::new(RemoteItemSource::new(client)))
            .credential_verifier(Arc::new(BcryptVerifier::new(db))))
    }

    pub fn build(self) -> Result<SyncEngine> {
        let config = self.config.ok_or(SyncError::MissingDependency("config"))?;
        config.validate()?;
        let db = self.db.ok_or(SyncError::MissingDependency("database"))?;
        let transport = self
            .transport
            .ok_or(SyncError::MissingDependency("realtime transport"))?;
        let endpoint = self
            .endpoint
            .ok_or(SyncError::MissingDependency("delivery endpoint"))?;
        let item_source = self
            .item_source
            .ok_or(SyncError::MissingDependency("item source"))?;
        let verifier = self
            .verifier
            .ok_or(SyncError::MissingDependency("credential verifier"))?;
        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let events = self.events.unwrap_or_default();

        let store = Arc::new(SqliteStore::new(Arc::clone(&db)));
        let ledger = Arc::new(ConflictLedger::new(
            store.clone(),
            events.clone(),
            Arc::clone(&clock),
        ));
        let resolver = Arc::new(OrderItemResolver::new(
            item_source,
            Some(MenuCatalog::new(Arc::clone(&db))),
            config.currency_symbol.clone(),
        ));
        let forward = Arc::new(ForwardSyncQueue::new(
            Arc::clone(&db),
            store.clone(),
            endpoint,
            events.clone(),
            Arc::clone(&clock),
            &config,
        ));
        let merge = Arc::new(
            LocalMergeEngine::new(
                &config,
                store.clone(),
                ledger,
                resolver,
                events.clone(),
                Arc::clone(&clock),
            )
            .with_forward_queue(Arc::clone(&forward)),
        );
        let governor = Arc::new(SessionActivityGovernor::new(
            &config,
            Arc::clone(&db),
            verifier,
            events.clone(),
            clock,
        ));
        let mut feed = ChangeFeedClient::new(transport, &config);
        if let Some(branch) = config.branch_id.as_deref().filter(|b| !b.is_empty()) {
            feed = feed.with_filter(format!("branch_id=eq.{branch}"));
        }

        info!(terminal_id = %config.terminal_id, "sync engine assembled");
        Ok(SyncEngine {
            config,
            store,
            events,
            feed: Arc::new(feed),
            merge,
            forward,
            governor,
            splitter: self.splitter.unwrap_or_default(),
            view: Arc::new(Mutex::new(None)),
            running: tokio::sync::Mutex::new(None),
        })
    }
}

struct Running {
    disposer: Disposer,
    tasks: Vec<JoinHandle<()>>,
}

pub struct SyncEngine {
    config: SyncConfig,
    store: Arc<SqliteStore>,
    events: EventBus,
    feed: Arc<ChangeFeedClient>,
    merge: Arc<LocalMergeEngine>,
    forward: Arc<ForwardSyncQueue>,
    governor: Arc<SessionActivityGovernor>,
    splitter: DedupAndQueueSplitter,
    view: ViewCache,
    running: tokio::sync::Mutex<Option<Running>>,
}

impl SyncEngine {
    pub fn builder() -> SyncEngineBuilder {
        SyncEngineBuilder::new()
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn merge(&self) -> &Arc<LocalMergeEngine> {
        &self.merge
    }

    pub fn forward_queue(&self) -> &Arc<ForwardSyncQueue> {
        &self.forward
    }

    pub fn sessions(&self) -> &Arc<SessionActivityGovernor> {
        &self.governor
    }

    pub fn change_feed(&self) -> &Arc<ChangeFeedClient> {
        &self.feed
    }

    pub async fn is_running(&self) -> bool {
        self.running.lock().await.is_some()
    }

    /// Begin syncing. Calling it on a running engine is a no-op.
    pub async fn start(&self) -> Result<()> {
        let mut running = self.running.lock().await;
        if running.is_some() {
            debug!("sync engine already running");
            return Ok(());
        }

        let recovered = self.forward.recover()?;
        if recovered > 0 {
            info!(recovered, "in-flight forward entries returned to pending");
        }
        let changes = self.feed.initialize().await?;

        let cancel = CancellationToken::new();
        let mut disposer = Disposer::new();
        disposer.add(cancel.clone().drop_guard());

        let cache = Arc::clone(&self.view);
        disposer.add(self.events.on(move |event| match event {
            SyncEvent::OrderCreated { .. }
            | SyncEvent::OrderStatusUpdated { .. }
            | SyncEvent::OrderDeleted { .. }
            | SyncEvent::RecordUpdated { .. }
            | SyncEvent::ConflictResolved(_) => invalidate(&cache),
            _ => {}
        }));

        let tasks = vec![
            tokio::spawn(pump_changes(
                Arc::clone(&self.merge),
                changes,
                Arc::clone(&self.view),
                cancel.clone(),
            )),
            tokio::spawn(flush_loop(
                Arc::clone(&self.forward),
                Duration::from_secs(self.config.flush_interval_secs.max(1)),
                Arc::clone(&self.view),
                cancel.clone(),
            )),
            tokio::spawn(session_loop(
                Arc::clone(&self.governor),
                Duration::from_secs(self.config.session_check_interval_secs.max(1)),
                cancel,
            )),
        ];

        *running = Some(Running { disposer, tasks });
        info!(terminal_id = %self.config.terminal_id, "sync engine started");
        Ok(())
    }

    /// Stop every loop and close the change feed. Safe to call repeatedly.
    pub async fn stop(&self) {
        let Some(mut state) = self.running.lock().await.take() else {
            return;
        };
        state.disposer.dispose();
        for task in state.tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "sync task ended abnormally");
            }
        }
        self.feed.cleanup().await;
        info!("sync engine stopped");
    }

    /// Deduplicated order list, rebuilt from the store when stale.
    pub fn orders_view(&self) -> Result<Arc<DedupView>> {
        let mut cache = self.view.lock().map_err(|_| SyncError::lock_poisoned())?;
        if let Some(view) = cache.as_ref() {
            return Ok(Arc::clone(view));
        }
        let view = Arc::new(self.splitter.split(self.store.list_orders()?));
        *cache = Some(Arc::clone(&view));
        Ok(view)
    }

    pub fn invalidate_view(&self) {
        invalidate(&self.view);
    }

    /// Apply one change outside the feed, e.g. from a reconciliation poll.
    pub async fn apply_change(&self, raw: &RawChange) -> Result<MergeOutcome> {
        let outcome = self.merge.apply_raw(raw).await?;
        if outcome.changed_state() {
            self.invalidate_view();
        }
        Ok(outcome)
    }

    pub fn create_order(&self, order: Order) -> Result<Order> {
        let order = self.merge.create_local_order(order)?;
        self.invalidate_view();
        Ok(order)
    }

    pub fn update_order(&self, order_id: &str, changes: Map<String, Value>) -> Result<Order> {
        let order = self.merge.record_local_order_change(order_id, changes)?;
        self.invalidate_view();
        Ok(order)
    }

    pub fn resolve_conflict(
        &self,
        conflict_id: &str,
        strategy: ResolutionStrategy,
    ) -> Result<ConflictRecord> {
        let record = self.merge.resolve_conflict(conflict_id, strategy)?;
        self.invalidate_view();
        Ok(record)
    }

    pub fn open_conflicts(&self) -> Result<Vec<ConflictRecord>> {
        self.merge.ledger().list_open()
    }

    /// Deliver due forward entries now instead of waiting for the timer.
    pub async fn flush_now(&self) -> Result<FlushReport> {
        let report = self.forward.flush().await?;
        if report.delivered > 0 {
            self.invalidate_view();
        }
        Ok(report)
    }
}

async fn pump_changes(
    merge: Arc<LocalMergeEngine>,
    mut changes: mpsc::UnboundedReceiver<RawChange>,
    view: ViewCache,
    cancel: CancellationToken,
) {
    loop {
        let raw = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            raw = changes.recv() => match raw {
                Some(raw) => raw,
                None => {
                    debug!("change stream closed");
                    break;
                }
            },
        };
        match merge.apply_raw(&raw).await {
            Ok(outcome) => {
                debug!(table = %raw.table, outcome = ?outcome, "change merged");
                if outcome.changed_state() {
                    invalidate(&view);
                }
            }
            Err(e) => warn!(table = %raw.table, error = %e, "change could not be merged"),
        }
    }
}

async fn flush_loop(
    forward: Arc<ForwardSyncQueue>,
    every: Duration,
    view: ViewCache,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(every);
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }
        match forward.flush().await {
            Ok(report) if report.delivered > 0 => invalidate(&view),
            Ok(_) => {}
            Err(e) => warn!(error = %e, "forward flush failed"),
        }
    }
}

async fn session_loop(
    governor: Arc<SessionActivityGovernor>,
    every: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(every);
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }
        if let Err(e) = governor.check_timeouts() {
            warn!(error = %e, "session check failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::change_feed::{ChannelMessage, ChannelSpec, ChannelStatus};
    use crate::db;
    use crate::forward_sync::QueueEntry;
    use crate::models::ChangeKind;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Opens every channel successfully; the orders channel carries one
    /// remote insert.
    #[derive(Default)]
    struct OneOrderFeed {
        held: Mutex<Vec<mpsc::UnboundedSender<ChannelMessage>>>,
        closed: AtomicUsize,
    }

    #[async_trait]
    impl RealtimeTransport for OneOrderFeed {
        async fn open(
            &self,
            spec: &ChannelSpec,
        ) -> Result<mpsc::UnboundedReceiver<ChannelMessage>> {
            let (tx, rx) = mpsc::unbounded_channel();
            let _ = tx.send(ChannelMessage::Status(ChannelStatus::Subscribed));
            if spec.table == "orders" {
                let _ = tx.send(ChannelMessage::Change(RawChange {
                    table: "orders".into(),
                    event_type: ChangeKind::Insert,
                    new: json!({
                        "id": "remote-1",
                        "order_number": "ORD-0100",
                        "status": "confirmed",
                        "order_type": "pickup",
                        "total_amount": 7.0,
                        "version": 1,
                        "terminal_id": "term-2",
                        "items": [{"id": "l-1", "name": "Toast", "quantity": 1, "unit_price": 7.0}],
                        "created_at": "2026-03-02T09:00:00Z",
                        "updated_at": "2026-03-02T09:00:00Z"
                    }),
                    old: Value::Null,
                }));
            }
            self.held.lock().unwrap().push(tx);
            Ok(rx)
        }

        async fn close(&self, _channel_name: &str) -> Result<()> {
            self.closed.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[derive(Default)]
    struct CountingEndpoint {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl DeliveryEndpoint for CountingEndpoint {
        async fn deliver(&self, entry: &QueueEntry) -> Result<Value> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(json!({"id": format!("srv-{}", entry.entity_id)}))
        }
    }

    struct NoItems;

    #[async_trait]
    impl ItemSource for NoItems {
        async fn fetch_items(&self, _order_id: &str) -> Result<Vec<Value>> {
            Ok(Vec::new())
        }
    }

    struct NobodyLogsIn;

    impl CredentialVerifier for NobodyLogsIn {
        fn verify(&self, _identity: &str, _secret: &str) -> Result<bool> {
            Ok(false)
        }
    }

    fn config() -> SyncConfig {
        SyncConfig {
            terminal_id: "term-1".into(),
            ..SyncConfig::default()
        }
    }

    fn complete_builder(
        transport: Arc<OneOrderFeed>,
        endpoint: Arc<CountingEndpoint>,
    ) -> SyncEngineBuilder {
        SyncEngine::builder()
            .config(config())
            .database(Arc::new(db::open_in_memory().unwrap()))
            .transport(transport)
            .delivery_endpoint(endpoint)
            .item_source(Arc::new(NoItems))
            .credential_verifier(Arc::new(NobodyLogsIn))
    }

    #[test]
    fn missing_collaborators_fail_at_build_time() {
        let err = SyncEngine::builder()
            .config(config())
            .database(Arc::new(db::open_in_memory().unwrap()))
            .item_source(Arc::new(NoItems))
            .build()
            .err()
            .unwrap();
        assert!(matches!(err, SyncError::MissingDependency("realtime transport")));

        let err = SyncEngine::builder().build().err().unwrap();
        assert!(matches!(err, SyncError::MissingDependency("config")));

        let err = complete_builder(Default::default(), Default::default())
            .config(SyncConfig::default())
            .build()
            .err()
            .unwrap();
        assert!(matches!(err, SyncError::Config(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn remote_insert_reaches_the_view_and_stop_releases_everything() {
        let transport = Arc::new(OneOrderFeed::default());
        let engine = complete_builder(transport.clone(), Default::default())
            .build()
            .unwrap();
        let baseline_handlers = engine.events().handler_count();

        assert!(engine.orders_view().unwrap().orders.is_empty());
        engine.start().await.unwrap();
        engine.start().await.unwrap();
        assert!(engine.is_running().await);
        assert_eq!(engine.events().handler_count(), baseline_handlers + 1);

        tokio::time::sleep(Duration::from_millis(50)).await;
        let view = engine.orders_view().unwrap();
        assert_eq!(view.orders.len(), 1);
        assert_eq!(view.orders[0].order_number.as_deref(), Some("ORD-0100"));

        engine.stop().await;
        engine.stop().await;
        assert!(!engine.is_running().await);
        assert_eq!(engine.events().handler_count(), baseline_handlers);
        assert_eq!(transport.closed.load(Ordering::SeqCst), 4);
        assert!(engine.change_feed().active_channels().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn local_order_is_delivered_by_the_flush_loop() {
        let endpoint = Arc::new(CountingEndpoint::default());
        let engine = complete_builder(Default::default(), endpoint.clone())
            .build()
            .unwrap();
        let now = chrono::Utc::now();
        engine
            .create_order(Order::new_local("local-1", "term-1", now))
            .unwrap();
        assert_eq!(engine.orders_view().unwrap().orders.len(), 1);

        engine.start().await.unwrap();
        tokio::time::sleep(Duration::from_secs(11)).await;
        assert_eq!(endpoint.calls.load(Ordering::SeqCst), 1);
        assert_eq!(engine.forward_queue().stats().unwrap().pending, 0);

        let order = &engine.orders_view().unwrap().orders[0];
        assert_eq!(order.remote_id.as_deref(), Some("srv-local-1"));
        engine.stop().await;
    }
}
