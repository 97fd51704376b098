//! Subscription to the remote change stream.
//!
//! One logical channel per watched table. Each channel is supervised by its
//! own task: when the transport reports `error`, `timeout` or `closed`, the
//! channel is torn down and reopened under a fresh name after an
//! exponential backoff. Nothing is delivered to consumers during the gap.

use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::SyncConfig;
use crate::error::{Result, SyncError};
use crate::models::RawChange;

/// What the transport needs to open one channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelSpec {
    pub name: String,
    pub table: String,
    /// Row filter in the transport's syntax, e.g. `branch_id=eq.<id>`.
    pub filter: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelStatus {
    Subscribed,
    Error(String),
    TimedOut,
    Closed,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ChannelMessage {
    Status(ChannelStatus),
    Change(RawChange),
}

/// The wire side of the change feed. The receiver returned by `open`
/// yields status updates and changes for that channel until it ends.
#[async_trait]
pub trait RealtimeTransport: Send + Sync {
    async fn open(&self, spec: &ChannelSpec) -> Result<mpsc::UnboundedReceiver<ChannelMessage>>;
    async fn close(&self, channel_name: &str) -> Result<()>;
}

/// `min(max, base * 2^attempt)` milliseconds.
pub fn reconnect_delay_ms(attempt: u32, base_ms: u64, max_ms: u64) -> u64 {
    let factor = 1u64.checked_shl(attempt).unwrap_or(u64::MAX);
    base_ms.saturating_mul(factor).min(max_ms)
}

enum ChannelEnd {
    Cancelled,
    SinkClosed,
    Failed(String),
}

struct FeedShared {
    transport: Arc<dyn RealtimeTransport>,
    base_ms: u64,
    max_ms: u64,
    attempts: Mutex<HashMap<String, u32>>,
    /// open channel name -> its table; one table may carry several channels
    open_channels: Mutex<HashMap<String, String>>,
    last_stamp: AtomicI64,
}

impl FeedShared {
    /// `<table>-changes-<epoch ms>`, strictly increasing per client so two
    /// reconnects in the same millisecond still get distinct names.
    fn channel_name(&self, table: &str) -> String {
        let now = Utc::now().timestamp_millis();
        let prev = self
            .last_stamp
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |last| {
                Some(now.max(last + 1))
            })
            .unwrap_or(now);
        format!("{table}-changes-{}", now.max(prev + 1))
    }

    fn next_attempt(&self, table: &str) -> u32 {
        let Ok(mut attempts) = self.attempts.lock() else {
            return 0;
        };
        let counter = attempts.entry(table.to_string()).or_insert(0);
        let current = *counter;
        *counter = counter.saturating_add(1);
        current
    }

    fn reset_attempts(&self, table: &str) {
        if let Ok(mut attempts) = self.attempts.lock() {
            attempts.insert(table.to_string(), 0);
        }
    }

    fn attempts(&self, table: &str) -> u32 {
        self.attempts
            .lock()
            .ok()
            .and_then(|a| a.get(table).copied())
            .unwrap_or(0)
    }

    fn track(&self, spec: &ChannelSpec) {
        if let Ok(mut open) = self.open_channels.lock() {
            open.insert(spec.name.clone(), spec.table.clone());
        }
    }

    fn untrack(&self, name: &str) {
        if let Ok(mut open) = self.open_channels.lock() {
            open.remove(name);
        }
    }

    async fn pump(
        &self,
        spec: &ChannelSpec,
        mut rx: mpsc::UnboundedReceiver<ChannelMessage>,
        sink: &mpsc::UnboundedSender<RawChange>,
        cancel: &CancellationToken,
    ) -> ChannelEnd {
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return ChannelEnd::Cancelled,
                msg = rx.recv() => match msg {
                    Some(ChannelMessage::Status(ChannelStatus::Subscribed)) => {
                        self.reset_attempts(&spec.table);
                        info!(channel = %spec.name, table = %spec.table, "change channel subscribed");
                    }
                    Some(ChannelMessage::Change(change)) => {
                        if sink.send(change).is_err() {
                            return ChannelEnd::SinkClosed;
                        }
                    }
                    Some(ChannelMessage::Status(ChannelStatus::Error(reason))) => {
                        return ChannelEnd::Failed(reason);
                    }
                    Some(ChannelMessage::Status(ChannelStatus::TimedOut)) => {
                        return ChannelEnd::Failed("timed out".into());
                    }
                    Some(ChannelMessage::Status(ChannelStatus::Closed)) => {
                        return ChannelEnd::Failed("closed".into());
                    }
                    None => return ChannelEnd::Failed("channel stream ended".into()),
                }
            }
        }
    }

    async fn supervise(
        self: Arc<Self>,
        table: String,
        filter: Option<String>,
        sink: mpsc::UnboundedSender<RawChange>,
        cancel: CancellationToken,
    ) {
        while !cancel.is_cancelled() {
            let spec = ChannelSpec {
                name: self.channel_name(&table),
                table: table.clone(),
                filter: filter.clone(),
            };
            debug!(channel = %spec.name, "opening change channel");

            let end = match self.transport.open(&spec).await {
                Ok(rx) => {
                    self.track(&spec);
                    self.pump(&spec, rx, &sink, &cancel).await
                }
                Err(e) => ChannelEnd::Failed(e.to_string()),
            };

            let reason = match end {
                ChannelEnd::Cancelled => break,
                ChannelEnd::SinkClosed => {
                    debug!(channel = %spec.name, "consumer gone, stopping channel");
                    self.untrack(&spec.name);
                    if let Err(e) = self.transport.close(&spec.name).await {
                        debug!(channel = %spec.name, error = %e, "close failed");
                    }
                    break;
                }
                ChannelEnd::Failed(reason) => reason,
            };

            self.untrack(&spec.name);
            if let Err(e) = self.transport.close(&spec.name).await {
                debug!(channel = %spec.name, error = %e, "close after failure failed");
            }

            let attempt = self.next_attempt(&table);
            let delay = reconnect_delay_ms(attempt, self.base_ms, self.max_ms);
            warn!(
                channel = %spec.name,
                table = %table,
                reason = %reason,
                attempt = attempt + 1,
                delay_ms = delay,
                "change channel failed, resubscribing"
            );
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(Duration::from_millis(delay)) => {}
            }
        }
    }
}

pub struct ChangeFeedClient {
    shared: Arc<FeedShared>,
    tables: Vec<String>,
    filter: Option<String>,
    cancel: Mutex<CancellationToken>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ChangeFeedClient {
    pub fn new(transport: Arc<dyn RealtimeTransport>, config: &SyncConfig) -> Self {
        Self {
            shared: Arc::new(FeedShared {
                transport,
                base_ms: config.reconnect_base_ms,
                max_ms: config.reconnect_max_ms,
                attempts: Mutex::new(HashMap::new()),
                open_channels: Mutex::new(HashMap::new()),
                last_stamp: AtomicI64::new(0),
            }),
            tables: config.watched_tables.clone(),
            filter: None,
            cancel: Mutex::new(CancellationToken::new()),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Apply `filter` to every channel opened by [`initialize`](Self::initialize).
    pub fn with_filter(mut self, filter: impl Into<String>) -> Self {
        self.filter = Some(filter.into());
        self
    }

    fn live_token(&self) -> Result<CancellationToken> {
        let mut token = self.cancel.lock().map_err(|_| SyncError::lock_poisoned())?;
        if token.is_cancelled() {
            *token = CancellationToken::new();
        }
        Ok(token.clone())
    }

    fn spawn_channel(
        &self,
        table: &str,
        filter: Option<String>,
        sink: mpsc::UnboundedSender<RawChange>,
    ) -> Result<()> {
        let cancel = self.live_token()?;
        let handle = tokio::spawn(Arc::clone(&self.shared).supervise(
            table.to_string(),
            filter,
            sink,
            cancel,
        ));
        self.tasks
            .lock()
            .map_err(|_| SyncError::lock_poisoned())?
            .push(handle);
        Ok(())
    }

    /// Open a channel for every watched table and merge their changes into
    /// one stream.
    pub async fn initialize(&self) -> Result<mpsc::UnboundedReceiver<RawChange>> {
        let running = self
            .tasks
            .lock()
            .map_err(|_| SyncError::lock_poisoned())?
            .iter()
            .any(|t| !t.is_finished());
        if running {
            return Err(SyncError::Transport("change feed already initialized".into()));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        for table in &self.tables {
            self.spawn_channel(table, self.filter.clone(), tx.clone())?;
        }
        info!(tables = ?self.tables, "change feed initialized");
        Ok(rx)
    }

    /// Open a single channel for `table`.
    pub async fn subscribe(
        &self,
        table: &str,
        filter: Option<&str>,
    ) -> Result<mpsc::UnboundedReceiver<RawChange>> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.spawn_channel(table, filter.map(str::to_string), tx)?;
        Ok(rx)
    }

    /// Tear down every channel and cancel pending resubscribe timers.
    /// Safe to call any number of times.
    pub async fn cleanup(&self) {
        if let Ok(token) = self.cancel.lock() {
            token.cancel();
        }
        let tasks: Vec<JoinHandle<()>> = match self.tasks.lock() {
            Ok(mut tasks) => tasks.drain(..).collect(),
            Err(_) => Vec::new(),
        };
        for task in &tasks {
            task.abort();
        }

        let channels: Vec<String> = match self.shared.open_channels.lock() {
            Ok(mut open) => open.drain().map(|(name, _)| name).collect(),
            Err(_) => Vec::new(),
        };
        for name in &channels {
            if let Err(e) = self.shared.transport.close(name).await {
                debug!(channel = %name, error = %e, "close during cleanup failed");
            }
        }
        if let Ok(mut attempts) = self.shared.attempts.lock() {
            attempts.clear();
        }
        if !tasks.is_empty() {
            info!(channels = channels.len(), "change feed cleaned up");
        }
    }

    /// Consecutive failures since `table` was last subscribed.
    pub fn attempts(&self, table: &str) -> u32 {
        self.shared.attempts(table)
    }

    pub fn active_channels(&self) -> Vec<String> {
        self.shared
            .open_channels
            .lock()
            .map(|open| open.keys().cloned().collect())
            .unwrap_or_default()
    }
}

impl Drop for ChangeFeedClient {
    fn drop(&mut self) {
        if let Ok(token) = self.cancel.lock() {
            token.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ChangeKind;
    use serde_json::json;
    use std::collections::{HashSet, VecDeque};
    use tokio::time::Instant;

    #[derive(Clone, Copy)]
    enum Step {
        Fail,
        /// Subscribe, then drop the channel.
        Flap,
        /// Subscribe, emit one change, stay open.
        Hold,
    }

    #[derive(Default)]
    struct ScriptedTransport {
        script: Mutex<VecDeque<Step>>,
        opens: Mutex<Vec<(String, Instant)>>,
        closes: Mutex<Vec<String>>,
        held: Mutex<Vec<mpsc::UnboundedSender<ChannelMessage>>>,
    }

    impl ScriptedTransport {
        fn with(steps: &[Step]) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(steps.iter().copied().collect()),
                ..Self::default()
            })
        }

        fn gaps_ms(&self) -> Vec<u128> {
            let opens = self.opens.lock().unwrap();
            opens
                .windows(2)
                .map(|w| (w[1].1 - w[0].1).as_millis())
                .collect()
        }

        fn open_count(&self) -> usize {
            self.opens.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl RealtimeTransport for ScriptedTransport {
        async fn open(
            &self,
            spec: &ChannelSpec,
        ) -> Result<mpsc::UnboundedReceiver<ChannelMessage>> {
            self.opens
                .lock()
                .unwrap()
                .push((spec.name.clone(), Instant::now()));
            let step = self.script.lock().unwrap().pop_front().unwrap_or(Step::Hold);
            let (tx, rx) = mpsc::unbounded_channel();
            match step {
                Step::Fail => {
                    let _ = tx.send(ChannelMessage::Status(ChannelStatus::Error("boom".into())));
                }
                Step::Flap => {
                    let _ = tx.send(ChannelMessage::Status(ChannelStatus::Subscribed));
                }
                Step::Hold => {
                    let _ = tx.send(ChannelMessage::Status(ChannelStatus::Subscribed));
                    let _ = tx.send(ChannelMessage::Change(RawChange {
                        table: spec.table.clone(),
                        event_type: ChangeKind::Insert,
                        new: json!({"id": spec.name}),
                        old: serde_json::Value::Null,
                    }));
                    self.held.lock().unwrap().push(tx);
                }
            }
            Ok(rx)
        }

        async fn close(&self, channel_name: &str) -> Result<()> {
            self.closes.lock().unwrap().push(channel_name.to_string());
            Ok(())
        }
    }

    fn client(transport: Arc<ScriptedTransport>) -> ChangeFeedClient {
        ChangeFeedClient::new(transport, &SyncConfig::default())
    }

    #[test]
    fn delay_doubles_and_caps() {
        let delays: Vec<u64> = (0..7).map(|a| reconnect_delay_ms(a, 1000, 10_000)).collect();
        assert_eq!(delays, vec![1000, 2000, 4000, 8000, 10_000, 10_000, 10_000]);
        assert_eq!(reconnect_delay_ms(80, 1000, 10_000), 10_000);
    }

    #[tokio::test(start_paused = true)]
    async fn consecutive_failures_back_off_until_subscribed() {
        let transport = ScriptedTransport::with(&[Step::Fail; 6]);
        let feed = client(transport.clone());
        let mut rx = feed.subscribe("orders", None).await.unwrap();

        let change = rx.recv().await.unwrap();
        assert_eq!(change.table, "orders");
        assert_eq!(
            transport.gaps_ms(),
            vec![1000, 2000, 4000, 8000, 10_000, 10_000]
        );
        assert_eq!(feed.attempts("orders"), 0);
        feed.cleanup().await;
    }

    #[tokio::test(start_paused = true)]
    async fn successful_subscription_resets_the_attempt_counter() {
        let transport =
            ScriptedTransport::with(&[Step::Fail, Step::Fail, Step::Flap, Step::Fail]);
        let feed = client(transport.clone());
        let mut rx = feed.subscribe("customers", None).await.unwrap();

        rx.recv().await.unwrap();
        assert_eq!(transport.gaps_ms(), vec![1000, 2000, 1000, 2000]);
        feed.cleanup().await;
    }

    #[tokio::test(start_paused = true)]
    async fn initialize_opens_one_uniquely_named_channel_per_table() {
        let transport = ScriptedTransport::with(&[]);
        let feed = client(transport.clone());
        let mut rx = feed.initialize().await.unwrap();

        let mut tables = HashSet::new();
        for _ in 0..4 {
            tables.insert(rx.recv().await.unwrap().table);
        }
        let expected: HashSet<String> = ["orders", "order_items", "customers", "customer_addresses"]
            .iter()
            .map(|t| t.to_string())
            .collect();
        assert_eq!(tables, expected);

        let names: Vec<String> = transport
            .opens
            .lock()
            .unwrap()
            .iter()
            .map(|(n, _)| n.clone())
            .collect();
        let unique: HashSet<&String> = names.iter().collect();
        assert_eq!(unique.len(), 4);
        assert!(names.iter().all(|n| n.contains("-changes-")));
        assert_eq!(feed.active_channels().len(), 4);

        assert!(feed.initialize().await.is_err());
        feed.cleanup().await;
        assert!(feed.active_channels().is_empty());
        assert_eq!(transport.closes.lock().unwrap().len(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn second_channel_on_the_same_table_is_closed_too() {
        let transport = ScriptedTransport::with(&[]);
        let feed = client(transport.clone());
        let mut all = feed.initialize().await.unwrap();
        for _ in 0..4 {
            all.recv().await.unwrap();
        }
        let mut branch = feed
            .subscribe("orders", Some("branch_id=eq.b-1"))
            .await
            .unwrap();
        assert_eq!(branch.recv().await.unwrap().table, "orders");
        assert_eq!(feed.active_channels().len(), 5);

        feed.cleanup().await;

        let opened: HashSet<String> = transport
            .opens
            .lock()
            .unwrap()
            .iter()
            .map(|(n, _)| n.clone())
            .collect();
        let closed: HashSet<String> = transport.closes.lock().unwrap().iter().cloned().collect();
        assert_eq!(opened.len(), 5);
        assert_eq!(closed, opened);
        assert!(feed.active_channels().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn cleanup_cancels_pending_backoff_and_is_idempotent() {
        let transport = ScriptedTransport::with(&[Step::Fail]);
        let feed = client(transport.clone());
        let mut rx = feed.subscribe("orders", None).await.unwrap();

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(transport.open_count(), 1);
        assert_eq!(feed.attempts("orders"), 1);

        feed.cleanup().await;
        feed.cleanup().await;
        tokio::time::sleep(Duration::from_secs(30)).await;

        assert_eq!(transport.open_count(), 1);
        assert!(rx.recv().await.is_none());
    }

    #[test]
    fn channel_names_never_repeat() {
        let feed = client(ScriptedTransport::with(&[]));
        let a = feed.shared.channel_name("orders");
        let b = feed.shared.channel_name("orders");
        assert_ne!(a, b);
        assert!(a.starts_with("orders-changes-"));
    }
}
