//! Phoenix-channel websocket transport for the change feed.
//!
//! A single socket carries every channel. Channels join with `phx_join`
//! and receive `postgres_changes` frames; the socket keeps itself alive
//! with `heartbeat` frames on the `phoenix` topic. When the socket drops,
//! every channel is told so and the change feed reopens them with backoff.

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::change_feed::{ChannelMessage, ChannelSpec, ChannelStatus, RealtimeTransport};
use crate::config::SyncConfig;
use crate::error::{Result, SyncError};
use crate::models::{ChangeKind, RawChange};

const PHOENIX_TOPIC: &str = "phoenix";
const HEARTBEAT_SECS: u64 = 25;
const JOIN_TIMEOUT_SECS: u64 = 10;

/// One frame of the Phoenix v1 JSON protocol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhoenixFrame {
    pub topic: String,
    pub event: String,
    #[serde(default)]
    pub payload: Value,
    #[serde(rename = "ref", default)]
    pub msg_ref: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub join_ref: Option<String>,
}

impl PhoenixFrame {
    fn new(topic: &str, event: &str, payload: Value, msg_ref: String) -> Self {
        Self {
            topic: topic.to_string(),
            event: event.to_string(),
            payload,
            msg_ref: Some(msg_ref),
            join_ref: None,
        }
    }

    fn to_message(&self) -> Result<Message> {
        Ok(Message::Text(serde_json::to_string(self)?))
    }
}

pub fn topic_for(channel_name: &str) -> String {
    format!("realtime:{channel_name}")
}

/// `phx_join` for a postgres_changes subscription on one table.
pub fn join_frame(spec: &ChannelSpec, join_ref: &str, access_token: Option<&str>) -> PhoenixFrame {
    let mut change = json!({
        "event": "*",
        "schema": "public",
        "table": spec.table,
    });
    if let Some(filter) = &spec.filter {
        change["filter"] = json!(filter);
    }
    let mut payload = json!({
        "config": {
            "broadcast": {"self": false},
            "presence": {"key": ""},
            "postgres_changes": [change],
        }
    });
    if let Some(token) = access_token.filter(|t| !t.is_empty()) {
        payload["access_token"] = json!(token);
    }
    let mut frame = PhoenixFrame::new(&topic_for(&spec.name), "phx_join", payload, join_ref.to_string());
    frame.join_ref = Some(join_ref.to_string());
    frame
}

/// Row change carried by a `postgres_changes` payload.
pub fn change_from_payload(payload: &Value) -> Option<RawChange> {
    let data = payload.get("data").unwrap_or(payload);
    let table = data.get("table")?.as_str()?.to_string();
    let event_type = data
        .get("type")
        .or_else(|| data.get("eventType"))
        .and_then(Value::as_str)
        .and_then(ChangeKind::parse)?;
    let new = data
        .get("record")
        .or_else(|| data.get("new"))
        .cloned()
        .unwrap_or(Value::Null);
    let old = data
        .get("old_record")
        .or_else(|| data.get("old"))
        .cloned()
        .unwrap_or(Value::Null);
    Some(RawChange {
        table,
        event_type,
        new,
        old,
    })
}

fn reply_reason(payload: &Value) -> String {
    payload
        .pointer("/response/reason")
        .or_else(|| payload.pointer("/response/message"))
        .and_then(Value::as_str)
        .unwrap_or("join rejected")
        .to_string()
}

struct ChannelSlot {
    join_ref: String,
    joined: bool,
    tx: mpsc::UnboundedSender<ChannelMessage>,
}

type Slots = Arc<Mutex<HashMap<String, ChannelSlot>>>;

/// Route one inbound frame to its channel. Terminal statuses unregister
/// the channel.
fn dispatch(slots: &Slots, frame: PhoenixFrame) {
    let Ok(mut slots) = slots.lock() else {
        return;
    };
    let Some(slot) = slots.get_mut(&frame.topic) else {
        debug!(topic = %frame.topic, event = %frame.event, "frame for unknown topic");
        return;
    };

    let message = match frame.event.as_str() {
        "phx_reply" if frame.msg_ref.as_deref() == Some(slot.join_ref.as_str()) => {
            match frame.payload.get("status").and_then(Value::as_str) {
                Some("ok") => {
                    slot.joined = true;
                    Some(ChannelMessage::Status(ChannelStatus::Subscribed))
                }
                _ => Some(ChannelMessage::Status(ChannelStatus::Error(reply_reason(
                    &frame.payload,
                )))),
            }
        }
        "postgres_changes" => {
            let change = change_from_payload(&frame.payload);
            if change.is_none() {
                warn!(topic = %frame.topic, "unreadable postgres_changes payload");
            }
            change.map(ChannelMessage::Change)
        }
        "phx_error" => Some(ChannelMessage::Status(ChannelStatus::Error(
            "channel error".into(),
        ))),
        "phx_close" => Some(ChannelMessage::Status(ChannelStatus::Closed)),
        "system" if frame.payload.get("status").and_then(Value::as_str) == Some("error") => {
            let reason = frame
                .payload
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("system error")
                .to_string();
            Some(ChannelMessage::Status(ChannelStatus::Error(reason)))
        }
        _ => None,
    };

    if let Some(message) = message {
        let terminal = matches!(
            message,
            ChannelMessage::Status(ChannelStatus::Error(_) | ChannelStatus::Closed)
        );
        if slot.tx.send(message).is_err() || terminal {
            slots.remove(&frame.topic);
        }
    }
}

#[derive(Clone)]
struct SocketHandle {
    outgoing: mpsc::UnboundedSender<Message>,
    slots: Slots,
    cancel: CancellationToken,
}

pub struct PhoenixTransport {
    url: String,
    api_key: String,
    heartbeat: Duration,
    join_timeout: Duration,
    next_ref: Arc<AtomicU64>,
    socket: tokio::sync::Mutex<Option<SocketHandle>>,
}

impl PhoenixTransport {
    pub fn new(config: &SyncConfig) -> Self {
        Self {
            url: config.realtime_url.clone(),
            api_key: config.realtime_api_key.clone(),
            heartbeat: Duration::from_secs(HEARTBEAT_SECS),
            join_timeout: Duration::from_secs(JOIN_TIMEOUT_SECS),
            next_ref: Arc::new(AtomicU64::new(1)),
            socket: tokio::sync::Mutex::new(None),
        }
    }

    fn socket_url(&self) -> String {
        let sep = if self.url.contains('?') { '&' } else { '?' };
        format!("{}{sep}apikey={}&vsn=1.0.0", self.url, self.api_key)
    }

    fn next_ref(&self) -> String {
        self.next_ref.fetch_add(1, Ordering::Relaxed).to_string()
    }

    async fn connected(&self) -> Result<SocketHandle> {
        let mut guard = self.socket.lock().await;
        if let Some(handle) = guard.as_ref() {
            if !handle.cancel.is_cancelled() {
                return Ok(handle.clone());
            }
        }
        if self.url.is_empty() {
            return Err(SyncError::Config("realtime_url is not configured".into()));
        }

        debug!(url = %self.url, "connecting realtime socket");
        let (ws, _) = connect_async(self.socket_url().as_str())
            .await
            .map_err(|e| SyncError::Transport(e.to_string()))?;
        info!(url = %self.url, "realtime socket connected");

        let (outgoing, outgoing_rx) = mpsc::unbounded_channel();
        let handle = SocketHandle {
            outgoing,
            slots: Arc::new(Mutex::new(HashMap::new())),
            cancel: CancellationToken::new(),
        };
        tokio::spawn(run_socket(
            ws,
            outgoing_rx,
            Arc::clone(&handle.slots),
            self.heartbeat,
            Arc::clone(&self.next_ref),
            handle.cancel.clone(),
        ));
        *guard = Some(handle.clone());
        Ok(handle)
    }

    /// Drop the socket. Open channels are reported closed.
    pub async fn shutdown(&self) {
        if let Some(handle) = self.socket.lock().await.take() {
            handle.cancel.cancel();
        }
    }
}

impl Drop for PhoenixTransport {
    fn drop(&mut self) {
        if let Ok(mut guard) = self.socket.try_lock() {
            if let Some(handle) = guard.take() {
                handle.cancel.cancel();
            }
        }
    }
}

#[async_trait]
impl RealtimeTransport for PhoenixTransport {
    async fn open(&self, spec: &ChannelSpec) -> Result<mpsc::UnboundedReceiver<ChannelMessage>> {
        let socket = self.connected().await?;
        let topic = topic_for(&spec.name);
        let join_ref = self.next_ref();
        let (tx, rx) = mpsc::unbounded_channel();
        socket
            .slots
            .lock()
            .map_err(|_| SyncError::lock_poisoned())?
            .insert(
                topic.clone(),
                ChannelSlot {
                    join_ref: join_ref.clone(),
                    joined: false,
                    tx,
                },
            );

        let frame = join_frame(spec, &join_ref, Some(&self.api_key));
        socket
            .outgoing
            .send(frame.to_message()?)
            .map_err(|_| SyncError::Transport("realtime socket is closed".into()))?;
        debug!(topic = %topic, join_ref = %join_ref, "phx_join sent");

        let slots = Arc::clone(&socket.slots);
        let timeout = self.join_timeout;
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let Ok(mut slots) = slots.lock() else {
                return;
            };
            let stalled = slots
                .get(&topic)
                .is_some_and(|slot| slot.join_ref == join_ref && !slot.joined);
            if stalled {
                if let Some(slot) = slots.remove(&topic) {
                    warn!(topic = %topic, "phx_join timed out");
                    let _ = slot.tx.send(ChannelMessage::Status(ChannelStatus::TimedOut));
                }
            }
        });
        Ok(rx)
    }

    async fn close(&self, channel_name: &str) -> Result<()> {
        let guard = self.socket.lock().await;
        let Some(socket) = guard.as_ref() else {
            return Ok(());
        };
        let topic = topic_for(channel_name);
        socket
            .slots
            .lock()
            .map_err(|_| SyncError::lock_poisoned())?
            .remove(&topic);
        if socket.cancel.is_cancelled() {
            return Ok(());
        }
        let leave = PhoenixFrame::new(&topic, "phx_leave", json!({}), self.next_ref());
        socket
            .outgoing
            .send(leave.to_message()?)
            .map_err(|_| SyncError::Transport("realtime socket is closed".into()))
    }
}

async fn run_socket(
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
    mut outgoing: mpsc::UnboundedReceiver<Message>,
    slots: Slots,
    heartbeat: Duration,
    next_ref: Arc<AtomicU64>,
    cancel: CancellationToken,
) {
    let (mut write, mut read) = ws.split();
    let mut ticker = tokio::time::interval(heartbeat);
    ticker.tick().await;
    let mut pending_heartbeat: Option<String> = None;

    let reason = loop {
        tokio::select! {
            _ = cancel.cancelled() => break "socket shut down".to_string(),
            _ = ticker.tick() => {
                if pending_heartbeat.is_some() {
                    break "heartbeat timed out".to_string();
                }
                let msg_ref = next_ref.fetch_add(1, Ordering::Relaxed).to_string();
                let frame = PhoenixFrame::new(PHOENIX_TOPIC, "heartbeat", json!({}), msg_ref.clone());
                match frame.to_message() {
                    Ok(message) => {
                        if let Err(e) = write.send(message).await {
                            break e.to_string();
                        }
                        pending_heartbeat = Some(msg_ref);
                    }
                    Err(e) => error!(error = %e, "failed to encode heartbeat"),
                }
            }
            out = outgoing.recv() => match out {
                Some(message) => {
                    if let Err(e) = write.send(message).await {
                        break e.to_string();
                    }
                }
                None => break "outgoing queue closed".to_string(),
            },
            incoming = read.next() => match incoming {
                Some(Ok(Message::Text(text))) => match serde_json::from_str::<PhoenixFrame>(&text) {
                    Ok(frame) if frame.topic == PHOENIX_TOPIC => {
                        if frame.event == "phx_reply" && frame.msg_ref == pending_heartbeat {
                            pending_heartbeat = None;
                        }
                    }
                    Ok(frame) => dispatch(&slots, frame),
                    Err(e) => warn!(error = %e, "unreadable realtime frame"),
                },
                Some(Ok(Message::Ping(data))) => {
                    let _ = write.send(Message::Pong(data)).await;
                }
                Some(Ok(Message::Close(_))) | None => break "socket closed".to_string(),
                Some(Ok(_)) => {}
                Some(Err(e)) => break e.to_string(),
            }
        }
    };

    cancel.cancel();
    warn!(reason = %reason, "realtime socket ended");
    let orphaned: Vec<ChannelSlot> = match slots.lock() {
        Ok(mut slots) => slots.drain().map(|(_, slot)| slot).collect(),
        Err(_) => Vec::new(),
    };
    for slot in orphaned {
        let _ = slot
            .tx
            .send(ChannelMessage::Status(ChannelStatus::Error(reason.clone())));
    }
    let _ = write.close().await;
}
