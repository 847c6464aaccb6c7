use std::net::SocketAddr;

use axum::{http::StatusCode, routing::get, Json, Router};
use change_sync::{SnapshotError, SnapshotSource};
use serde_json::json;
use shipwatch::{Gate, HttpSnapshotSource};
use tokio::net::TcpListener;

async fn serve(app: Router) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

#[tokio::test]
async fn fetches_dashboard_rows() {
    let app = Router::new().route(
        "/api/worklist",
        get(|| async {
            Json(json!({
                "lastRefreshAt": "2025-03-10 08:00",
                "kpis": {"driAvg": 0, "wsiAvg": 0, "redCount": 1, "overdueCount": 0, "recoverableAED": 0, "zeroStops": 0},
                "rows": [
                    {"id": "s1", "kind": "SHIPMENT", "title": "SCT-1", "gate": "RED", "score": 40.0, "triggers": ["DO_MISSING"]},
                    {"id": "s2", "kind": "SHIPMENT", "title": "SCT-2", "gate": "GREEN", "score": 100.0}
                ]
            }))
        }),
    );
    let addr = serve(app).await;

    let source = HttpSnapshotSource::new(format!("http://{addr}/api/worklist"), None).unwrap();
    let snapshot = source.fetch().await.unwrap();
    assert_eq!(snapshot.rows.len(), 2);
    assert_eq!(snapshot.rows[0].gate, Gate::Red);
    assert_eq!(
        snapshot.refreshed_at.map(|at| at.to_rfc3339()),
        Some("2025-03-10T04:00:00+00:00".to_string())
    );
}

#[tokio::test]
async fn non_success_status_is_reported() {
    let app = Router::new().route(
        "/api/worklist",
        get(|| async { (StatusCode::SERVICE_UNAVAILABLE, "busy") }),
    );
    let addr = serve(app).await;

    let source = HttpSnapshotSource::new(format!("http://{addr}/api/worklist"), None).unwrap();
    assert!(matches!(source.fetch().await, Err(SnapshotError::Status(503))));
}

#[tokio::test]
async fn unreachable_endpoint_is_an_http_error() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let source = HttpSnapshotSource::new(format!("http://{addr}/api/worklist"), None).unwrap();
    assert!(matches!(source.fetch().await, Err(SnapshotError::Http(_))));
}
