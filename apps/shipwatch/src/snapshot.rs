use std::time::Duration;

use async_trait::async_trait;
use change_sync::{Snapshot, SnapshotError, SnapshotSource};
use chrono::{DateTime, FixedOffset, NaiveDateTime, TimeZone, Utc};
use serde::Deserialize;
use tracing::debug;

use crate::worklist::{Kpis, WorklistRow};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

/// Dashboard payload served by the worklist endpoint. The server-side KPIs
/// are accepted but recomputed locally from the rows.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DashboardPayload {
    #[serde(default)]
    last_refresh_at: Option<String>,
    #[serde(default)]
    #[allow(dead_code)]
    kpis: Option<Kpis>,
    rows: Vec<WorklistRow>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum SnapshotBody {
    Dashboard(DashboardPayload),
    Rows(Vec<WorklistRow>),
}

/// Decodes either the dashboard envelope or a bare row array.
pub fn decode_snapshot(body: &[u8]) -> Result<Snapshot<WorklistRow>, SnapshotError> {
    let body: SnapshotBody =
        serde_json::from_slice(body).map_err(|err| SnapshotError::Decode(err.to_string()))?;
    Ok(match body {
        SnapshotBody::Dashboard(payload) => Snapshot {
            refreshed_at: payload.last_refresh_at.as_deref().and_then(parse_refreshed_at),
            rows: payload.rows,
        },
        SnapshotBody::Rows(rows) => Snapshot::new(rows),
    })
}

/// RFC 3339, or the dashboard's `YYYY-MM-DD HH:MM` in Dubai local time.
pub fn parse_refreshed_at(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(at) = DateTime::parse_from_rfc3339(raw) {
        return Some(at.with_timezone(&Utc));
    }
    let naive = NaiveDateTime::parse_from_str(raw.trim(), "%Y-%m-%d %H:%M").ok()?;
    let dubai = FixedOffset::east_opt(4 * 3600)?;
    dubai
        .from_local_datetime(&naive)
        .single()
        .map(|at| at.with_timezone(&Utc))
}

pub struct HttpSnapshotSource {
    client: reqwest::Client,
    url: String,
    api_key: Option<String>,
}

impl HttpSnapshotSource {
    pub fn new(url: impl Into<String>, api_key: Option<String>) -> Result<Self, SnapshotError> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|err| SnapshotError::Http(err.to_string()))?;
        Ok(Self {
            client,
            url: url.into(),
            api_key,
        })
    }
}

#[async_trait]
impl SnapshotSource<WorklistRow> for HttpSnapshotSource {
    async fn fetch(&self) -> Result<Snapshot<WorklistRow>, SnapshotError> {
        let mut request = self.client.get(&self.url).header("cache-control", "no-store");
        if let Some(key) = &self.api_key {
            request = request.header("apikey", key);
        }
        let response = request
            .send()
            .await
            .map_err(|err| SnapshotError::Http(err.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            return Err(SnapshotError::Status(status.as_u16()));
        }
        let body = response
            .bytes()
            .await
            .map_err(|err| SnapshotError::Http(err.to_string()))?;
        let snapshot = decode_snapshot(&body)?;
        debug!(
            target = "shipwatch.snapshot",
            url = %self.url,
            rows = snapshot.rows.len(),
            "snapshot fetched"
        );
        Ok(snapshot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_dashboard_envelope() {
        let body = br#"{
            "lastRefreshAt": "2025-03-10 14:05",
            "kpis": {"driAvg": 1, "wsiAvg": 0, "redCount": 0, "overdueCount": 0, "recoverableAED": 0, "zeroStops": 0},
            "rows": [{"id": "r1", "kind": "SHIPMENT", "title": "SCT-1", "gate": "GREEN", "triggers": []}]
        }"#;
        let snapshot = decode_snapshot(body).unwrap();
        assert_eq!(snapshot.rows.len(), 1);
        assert_eq!(
            snapshot.refreshed_at.map(|at| at.to_rfc3339()),
            Some("2025-03-10T10:05:00+00:00".to_string())
        );
    }

    #[test]
    fn decodes_bare_rows() {
        let body = br#"[{"id": "r1", "kind": "SHIPMENT", "title": "SCT-1", "gate": "RED"}]"#;
        let snapshot = decode_snapshot(body).unwrap();
        assert_eq!(snapshot.rows[0].id, "r1");
        assert!(snapshot.refreshed_at.is_none());
    }

    #[test]
    fn rejects_garbage() {
        assert!(matches!(
            decode_snapshot(b"{\"rows\": 3}"),
            Err(SnapshotError::Decode(_))
        ));
    }
}
