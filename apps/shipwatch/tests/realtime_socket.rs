use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        Query, State, WebSocketUpgrade,
    },
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use change_sync::{
    Binding, ChangeFeed, ChangeKind, ChannelSpec, ConnectionStatus, FeedMessage, SnapshotSource,
    SyncConfig,
};
use serde_json::{json, Value};
use shipwatch::{
    engine_with, AppConfig, HttpSnapshotSource, RealtimeConfig, RealtimeFeed, WorklistModel,
    WorklistRow,
};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::time::timeout;
use url::Url;

const WAIT: Duration = Duration::from_secs(5);

type Seen = mpsc::UnboundedSender<Value>;

async fn serve(app: Router) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

fn fake_server(seen: Seen) -> Router {
    Router::new()
        .route("/realtime/v1/websocket", get(upgrade))
        .route(
            "/api/worklist",
            get(|| async {
                Json(json!({
                    "rows": [{"id": "s1", "kind": "SHIPMENT", "title": "SCT-1", "gate": "GREEN", "score": 100.0}]
                }))
            }),
        )
        .with_state(seen)
}

async fn upgrade(
    ws: WebSocketUpgrade,
    Query(params): Query<HashMap<String, String>>,
    State(seen): State<Seen>,
) -> impl IntoResponse {
    let _ = seen.send(json!({"event": "connect", "query": params}));
    ws.on_upgrade(move |socket| fake_realtime(socket, seen))
}

/// Accepts the join, pushes one insert, and acknowledges a leave.
async fn fake_realtime(mut socket: WebSocket, seen: Seen) {
    while let Some(Ok(message)) = socket.recv().await {
        let Message::Text(text) = message else {
            continue;
        };
        let Ok(frame) = serde_json::from_str::<Value>(&text) else {
            continue;
        };
        let _ = seen.send(frame.clone());
        let topic = frame["topic"].clone();
        match frame["event"].as_str() {
            Some("phx_join") => {
                let reply = json!({
                    "topic": topic,
                    "event": "phx_reply",
                    "ref": frame["ref"],
                    "payload": {"status": "ok", "response": {"postgres_changes": []}}
                });
                let change = json!({
                    "topic": topic,
                    "event": "postgres_changes",
                    "ref": null,
                    "payload": {"data": {
                        "type": "INSERT",
                        "schema": "public",
                        "table": "shipments",
                        "commit_timestamp": "2025-03-10T10:00:00Z",
                        "record": {"id": "s2", "sct_ship_no": "SCT-2", "eta": "2025-03-01"}
                    }}
                });
                for frame in [reply, change] {
                    if socket.send(Message::Text(frame.to_string())).await.is_err() {
                        return;
                    }
                }
            }
            Some("phx_leave") => {
                let _ = socket.send(Message::Close(None)).await;
                return;
            }
            _ => {}
        }
    }
}

fn channel() -> ChannelSpec {
    ChannelSpec::new("kpi:shipments", vec![Binding::new("public", "shipments")])
}

fn realtime_config(addr: SocketAddr) -> RealtimeConfig {
    let endpoint = Url::parse(&format!("http://{addr}/realtime/v1")).unwrap();
    RealtimeConfig::new(endpoint, "anon-key").with_access_token(Some("user-jwt".into()))
}

async fn next_seen(seen: &mut mpsc::UnboundedReceiver<Value>, event: &str) -> Value {
    loop {
        let frame = timeout(WAIT, seen.recv()).await.unwrap().unwrap();
        if frame["event"] == event {
            return frame;
        }
    }
}

#[tokio::test]
async fn feed_joins_streams_and_leaves() {
    let (seen_tx, mut seen) = mpsc::unbounded_channel();
    let addr = serve(fake_server(seen_tx)).await;
    let feed = RealtimeFeed::new(realtime_config(addr));

    let mut subscription = timeout(WAIT, feed.subscribe(&channel()))
        .await
        .unwrap()
        .unwrap();

    let connect = next_seen(&mut seen, "connect").await;
    assert_eq!(connect["query"]["apikey"], "anon-key");
    assert_eq!(connect["query"]["vsn"], "1.0.0");
    let join = next_seen(&mut seen, "phx_join").await;
    assert_eq!(join["topic"], "realtime:kpi:shipments");
    assert_eq!(join["payload"]["access_token"], "user-jwt");
    assert_eq!(
        join["payload"]["config"]["postgres_changes"][0]["table"],
        "shipments"
    );

    let messages = &mut subscription.messages;
    assert_eq!(
        timeout(WAIT, messages.recv()).await.unwrap(),
        Some(FeedMessage::Subscribed)
    );
    match timeout(WAIT, messages.recv()).await.unwrap() {
        Some(FeedMessage::Change(event)) => {
            assert_eq!(event.kind, ChangeKind::Insert);
            assert_eq!(event.new_record.unwrap()["id"], "s2");
        }
        other => panic!("expected change, got {other:?}"),
    }

    subscription.guard.release().unwrap();
    let leave = next_seen(&mut seen, "phx_leave").await;
    assert_eq!(leave["topic"], "realtime:kpi:shipments");
    // The socket task may observe the server's close before its own.
    while let Some(message) = timeout(WAIT, subscription.messages.recv()).await.unwrap() {
        assert_eq!(message, FeedMessage::Closed);
    }
}

#[tokio::test]
async fn engine_merges_snapshot_and_live_insert() {
    let (seen_tx, _seen) = mpsc::unbounded_channel();
    let addr = serve(fake_server(seen_tx)).await;

    let config = AppConfig {
        sync: SyncConfig {
            debounce: Duration::from_millis(50),
            ..SyncConfig::default()
        },
        realtime: realtime_config(addr),
        snapshot_url: Url::parse(&format!("http://{addr}/api/worklist")).unwrap(),
        api_key: "anon-key".into(),
        channel: channel(),
        log_filter: "info".into(),
    };
    let snapshots: Arc<dyn SnapshotSource<WorklistRow>> = Arc::new(
        HttpSnapshotSource::new(config.snapshot_url.as_str(), Some(config.api_key.clone()))
            .unwrap(),
    );
    let feed: Arc<dyn ChangeFeed> = Arc::new(RealtimeFeed::new(config.realtime.clone()));
    let model = WorklistModel::new().with_today(chrono::NaiveDate::from_ymd_opt(2025, 3, 10).unwrap());
    let engine = engine_with(&config, model, feed, snapshots);

    engine.start().await.unwrap();
    let mut status = engine.status();
    timeout(WAIT, status.wait_for(|status| *status == ConnectionStatus::Live))
        .await
        .unwrap()
        .unwrap();

    let mut views = engine.view();
    let view = timeout(WAIT, views.wait_for(|view| view.rows.len() == 2))
        .await
        .unwrap()
        .unwrap()
        .clone();
    let ids: Vec<&str> = view.rows.iter().map(|row| row.id.as_str()).collect();
    assert_eq!(ids, vec!["s1", "s2"]);
    // s2 arrived past its ETA with no DO or customs dates.
    assert_eq!(view.summary.red_count, 1);
    assert!(!engine.is_polling());

    engine.shutdown().await;
    assert_eq!(engine.current_status(), ConnectionStatus::Offline);
}
