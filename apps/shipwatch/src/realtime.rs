//! Change feed backed by a Supabase Realtime (Phoenix channels) websocket.
//!
//! One socket per subscription: `subscribe` connects, sends `phx_join` for
//! `realtime:<channel>` with the channel's `postgres_changes` bindings and
//! hands a socket task the rest. The task heartbeats, enforces the join
//! timeout and translates frames into [`FeedMessage`]s. A heartbeat still
//! unanswered when the next one is due fails the channel.

use std::fmt::Display;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use change_sync::{
    ChangeEvent, ChangeFeed, ChannelSpec, FeedError, FeedGuard, FeedMessage, FeedSubscription,
};
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tokio::time::{interval_at, sleep, Instant, MissedTickBehavior};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tracing::{debug, trace, warn};
use url::Url;

pub const DEFAULT_JOIN_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_HEARTBEAT: Duration = Duration::from_secs(25);
const PROTOCOL_VERSION: &str = "1.0.0";
const MESSAGE_BUFFER: usize = 256;

#[derive(Debug, Clone)]
pub struct RealtimeConfig {
    pub endpoint: Url,
    pub api_key: String,
    pub access_token: Option<String>,
    pub join_timeout: Duration,
    pub heartbeat_interval: Duration,
}

impl RealtimeConfig {
    pub fn new(endpoint: Url, api_key: impl Into<String>) -> Self {
        Self {
            endpoint,
            api_key: api_key.into(),
            access_token: None,
            join_timeout: DEFAULT_JOIN_TIMEOUT,
            heartbeat_interval: DEFAULT_HEARTBEAT,
        }
    }

    pub fn with_access_token(mut self, token: Option<String>) -> Self {
        self.access_token = token;
        self
    }

    /// `<endpoint>/websocket?apikey=..&vsn=1.0.0`, with http(s) mapped to
    /// ws(s).
    pub fn socket_url(&self) -> Result<Url, FeedError> {
        let mut url = self.endpoint.clone();
        let scheme = match url.scheme() {
            "http" | "ws" => "ws",
            "https" | "wss" => "wss",
            other => {
                return Err(FeedError::Connect(format!(
                    "unsupported realtime scheme `{other}`"
                )))
            }
        };
        url.set_scheme(scheme)
            .map_err(|_| FeedError::Connect(format!("cannot use scheme `{scheme}`")))?;
        if !url.path().ends_with("/websocket") {
            let path = format!("{}/websocket", url.path().trim_end_matches('/'));
            url.set_path(&path);
        }
        url.query_pairs_mut()
            .clear()
            .append_pair("apikey", &self.api_key)
            .append_pair("vsn", PROTOCOL_VERSION);
        Ok(url)
    }
}

/// Phoenix v1 JSON frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhoenixFrame {
    pub topic: String,
    pub event: String,
    #[serde(default)]
    pub payload: Value,
    #[serde(rename = "ref", default)]
    pub reference: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub join_ref: Option<String>,
}

impl PhoenixFrame {
    fn new(topic: &str, event: &str, payload: Value, reference: String) -> Self {
        Self {
            topic: topic.to_string(),
            event: event.to_string(),
            payload,
            reference: Some(reference),
            join_ref: None,
        }
    }

    fn into_message(self) -> Message {
        match serde_json::to_string(&self) {
            Ok(text) => Message::Text(text),
            Err(err) => {
                warn!(target = "shipwatch.realtime", error = %err, "failed to encode frame");
                Message::Text(String::new())
            }
        }
    }
}

pub fn channel_topic(channel: &ChannelSpec) -> String {
    format!("realtime:{}", channel.name)
}

pub fn join_payload(channel: &ChannelSpec, access_token: Option<&str>) -> Value {
    let changes: Vec<Value> = channel
        .bindings
        .iter()
        .map(|binding| {
            let mut entry = json!({
                "event": binding.event.as_wire(),
                "schema": binding.namespace,
                "table": binding.table,
            });
            if let Some(filter) = &binding.filter {
                entry["filter"] = Value::String(filter.clone());
            }
            entry
        })
        .collect();
    let mut payload = json!({
        "config": {
            "broadcast": {"ack": false, "self": false},
            "presence": {"key": ""},
            "postgres_changes": changes,
            "private": false,
        }
    });
    if let Some(token) = access_token {
        payload["access_token"] = Value::String(token.to_string());
    }
    payload
}

/// Translates one inbound text frame. `Ok(None)` means the frame is not
/// relevant to the channel (heartbeat replies, presence, other topics).
pub fn decode_frame(
    topic: &str,
    join_ref: &str,
    text: &str,
) -> Result<Option<FeedMessage>, FeedError> {
    let frame: PhoenixFrame =
        serde_json::from_str(text).map_err(|err| FeedError::Protocol(err.to_string()))?;
    if frame.topic != topic {
        return Ok(None);
    }
    let message = match frame.event.as_str() {
        "phx_reply" if frame.reference.as_deref() == Some(join_ref) => {
            match frame.payload.get("status").and_then(Value::as_str) {
                Some("ok") => Some(FeedMessage::Subscribed),
                _ => Some(FeedMessage::ChannelError(reason(&frame.payload, "join rejected"))),
            }
        }
        "postgres_changes" => {
            let data = frame
                .payload
                .get("data")
                .cloned()
                .ok_or_else(|| FeedError::Protocol("postgres_changes without data".into()))?;
            Some(FeedMessage::Change(decode_change(data)?))
        }
        "INSERT" | "UPDATE" | "DELETE" => {
            let mut change = frame.payload;
            if let Value::Object(map) = &mut change {
                if !map.contains_key("type") && !map.contains_key("eventType") {
                    map.insert("type".into(), Value::String(frame.event.clone()));
                }
            }
            Some(FeedMessage::Change(decode_change(change)?))
        }
        "system" if frame.payload.get("status").and_then(Value::as_str) == Some("error") => Some(
            FeedMessage::ChannelError(reason(&frame.payload, "realtime system error")),
        ),
        "phx_error" => Some(FeedMessage::ChannelError(reason(
            &frame.payload,
            "channel crashed",
        ))),
        "phx_close" => Some(FeedMessage::Closed),
        _ => None,
    };
    Ok(message)
}

fn decode_change(data: Value) -> Result<ChangeEvent, FeedError> {
    serde_json::from_value(data).map_err(|err| FeedError::Protocol(err.to_string()))
}

fn reason(payload: &Value, fallback: &str) -> String {
    payload
        .pointer("/response/reason")
        .or_else(|| payload.get("message"))
        .or_else(|| payload.get("reason"))
        .and_then(Value::as_str)
        .unwrap_or(fallback)
        .to_string()
}

/// Per-socket parameters for [`run_socket`].
#[derive(Debug, Clone)]
pub struct SocketSession {
    pub topic: String,
    pub join_ref: String,
    pub join_timeout: Duration,
    pub heartbeat_interval: Duration,
    pub refs: Arc<AtomicU64>,
}

impl SocketSession {
    fn next_ref(&self) -> String {
        self.refs.fetch_add(1, Ordering::Relaxed).to_string()
    }
}

/// Drives one socket until it closes, fails, times out the join, or every
/// consumer goes away.
pub async fn run_socket<S, St>(
    session: SocketSession,
    mut sink: S,
    mut stream: St,
    mut outbound: mpsc::UnboundedReceiver<Message>,
    messages: mpsc::Sender<FeedMessage>,
) where
    S: Sink<Message> + Unpin,
    S::Error: Display,
    St: Stream<Item = Result<Message, WsError>> + Unpin,
{
    let mut heartbeat = interval_at(
        Instant::now() + session.heartbeat_interval,
        session.heartbeat_interval,
    );
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let join_deadline = sleep(session.join_timeout);
    tokio::pin!(join_deadline);
    let mut joined = false;
    let mut pending_heartbeat: Option<String> = None;

    loop {
        tokio::select! {
            outgoing = outbound.recv() => match outgoing {
                Some(frame) => {
                    let closing = matches!(frame, Message::Close(_));
                    if let Err(err) = sink.send(frame).await {
                        debug!(target = "shipwatch.realtime", error = %err, "socket write failed");
                        let _ = messages.send(FeedMessage::ChannelError(err.to_string())).await;
                        break;
                    }
                    if closing {
                        break;
                    }
                }
                None => {
                    let _ = sink.close().await;
                    break;
                }
            },
            _ = heartbeat.tick() => {
                if let Some(reference) = pending_heartbeat.take() {
                    warn!(
                        target = "shipwatch.realtime",
                        topic = %session.topic,
                        reference = %reference,
                        "heartbeat unanswered"
                    );
                    let _ = messages
                        .send(FeedMessage::ChannelError("heartbeat timeout".into()))
                        .await;
                    break;
                }
                let reference = session.next_ref();
                let frame = PhoenixFrame::new("phoenix", "heartbeat", json!({}), reference.clone());
                trace!(target = "shipwatch.realtime", reference = %reference, "heartbeat");
                if let Err(err) = sink.send(frame.into_message()).await {
                    let _ = messages.send(FeedMessage::ChannelError(err.to_string())).await;
                    break;
                }
                pending_heartbeat = Some(reference);
            }
            _ = &mut join_deadline, if !joined => {
                debug!(target = "shipwatch.realtime", topic = %session.topic, "join timed out");
                let _ = messages.send(FeedMessage::TimedOut).await;
                break;
            }
            incoming = stream.next() => match incoming {
                Some(Ok(Message::Text(text))) => {
                    if pending_heartbeat.is_some()
                        && heartbeat_reply(&text).as_deref() == pending_heartbeat.as_deref()
                    {
                        pending_heartbeat = None;
                        continue;
                    }
                    match decode_frame(&session.topic, &session.join_ref, &text) {
                        Ok(Some(message)) => {
                            joined |= matches!(message, FeedMessage::Subscribed);
                            let terminal = matches!(
                                message,
                                FeedMessage::ChannelError(_) | FeedMessage::Closed
                            );
                            if messages.send(message).await.is_err() || terminal {
                                break;
                            }
                        }
                        Ok(None) => {}
                        Err(err) => {
                            warn!(target = "shipwatch.realtime", error = %err, "dropping undecodable frame");
                        }
                    }
                }
                Some(Ok(Message::Close(_))) | None => {
                    let _ = messages.send(FeedMessage::Closed).await;
                    break;
                }
                Some(Err(err)) => {
                    let _ = messages.send(FeedMessage::ChannelError(err.to_string())).await;
                    break;
                }
                Some(Ok(_)) => {}
            }
        }
    }
    debug!(target = "shipwatch.realtime", topic = %session.topic, "socket task finished");
}

/// Reference of a `phx_reply` on the `phoenix` topic, if `text` is one.
fn heartbeat_reply(text: &str) -> Option<String> {
    let frame: PhoenixFrame = serde_json::from_str(text).ok()?;
    (frame.topic == "phoenix" && frame.event == "phx_reply")
        .then_some(frame.reference)
        .flatten()
}

pub struct RealtimeFeed {
    config: RealtimeConfig,
}

impl RealtimeFeed {
    pub fn new(config: RealtimeConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl ChangeFeed for RealtimeFeed {
    async fn subscribe(&self, channel: &ChannelSpec) -> Result<FeedSubscription, FeedError> {
        let url = self.config.socket_url()?;
        let (socket, _) = connect_async(url.as_str())
            .await
            .map_err(|err| FeedError::Connect(err.to_string()))?;
        let (sink, stream) = socket.split();

        let refs = Arc::new(AtomicU64::new(1));
        let session = SocketSession {
            topic: channel_topic(channel),
            join_ref: refs.fetch_add(1, Ordering::Relaxed).to_string(),
            join_timeout: self.config.join_timeout,
            heartbeat_interval: self.config.heartbeat_interval,
            refs: refs.clone(),
        };

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let mut join = PhoenixFrame::new(
            &session.topic,
            "phx_join",
            join_payload(channel, self.config.access_token.as_deref()),
            session.join_ref.clone(),
        );
        join.join_ref = Some(session.join_ref.clone());
        outbound_tx
            .send(join.into_message())
            .map_err(|_| FeedError::Closed)?;

        let (messages_tx, messages_rx) = mpsc::channel(MESSAGE_BUFFER);
        let topic = session.topic.clone();
        debug!(
            target = "shipwatch.realtime",
            topic = %topic,
            bindings = channel.bindings.len(),
            "joining channel"
        );
        let task = tokio::spawn(run_socket(session, sink, stream, outbound_rx, messages_tx));
        Ok(FeedSubscription {
            messages: messages_rx,
            guard: Box::new(RealtimeGuard {
                topic,
                refs,
                outbound: outbound_tx,
                task: task.abort_handle(),
            }),
        })
    }
}

/// Leaves the channel and closes the socket.
pub struct RealtimeGuard {
    topic: String,
    refs: Arc<AtomicU64>,
    outbound: mpsc::UnboundedSender<Message>,
    task: AbortHandle,
}

impl FeedGuard for RealtimeGuard {
    fn release(self: Box<Self>) -> Result<(), FeedError> {
        if self.task.is_finished() {
            return Ok(());
        }
        let reference = self.refs.fetch_add(1, Ordering::Relaxed).to_string();
        let leave = PhoenixFrame::new(&self.topic, "phx_leave", json!({}), reference);
        self.outbound
            .send(leave.into_message())
            .and_then(|_| self.outbound.send(Message::Close(None)))
            .map_err(|_| FeedError::Release(format!("socket for {} already closed", self.topic)))
    }
}
