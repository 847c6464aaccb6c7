#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use change_sync::{
    ChangeFeed, ChannelSpec, FeedError, FeedGuard, FeedMessage, FeedSubscription, KeySpec,
    KeyedRow, RowCollection, Snapshot, SnapshotError, SnapshotSource, TransformError, ViewModel,
};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::mpsc;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    pub id: String,
    pub shipment_id: Option<String>,
    pub qty: i64,
}

impl Row {
    pub fn new(id: &str, qty: i64) -> Self {
        Self {
            id: id.to_string(),
            shipment_id: None,
            qty,
        }
    }
}

impl KeyedRow for Row {
    fn primary_key(&self) -> &str {
        &self.id
    }

    fn secondary_key(&self) -> Option<&str> {
        self.shipment_id.as_deref()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Totals {
    pub rows: usize,
    pub qty: i64,
}

pub struct Model {
    keys: KeySpec,
    pub summaries: Arc<AtomicUsize>,
}

impl Model {
    pub fn new() -> Self {
        Self {
            keys: KeySpec::new("id").with_secondary("shipment_id"),
            summaries: Arc::new(AtomicUsize::new(0)),
        }
    }
}

impl ViewModel for Model {
    type Row = Row;
    type Summary = Totals;

    fn key_spec(&self) -> &KeySpec {
        &self.keys
    }

    fn transform(&self, record: &Value) -> Result<Row, TransformError> {
        let id = record
            .get("id")
            .and_then(Value::as_str)
            .ok_or_else(|| TransformError::MissingField("id".into()))?;
        Ok(Row {
            id: id.to_string(),
            shipment_id: record
                .get("shipment_id")
                .and_then(Value::as_str)
                .map(str::to_string),
            qty: record.get("qty").and_then(Value::as_i64).unwrap_or_default(),
        })
    }

    fn summarize(&self, rows: &RowCollection<Row>) -> Totals {
        self.summaries.fetch_add(1, Ordering::SeqCst);
        Totals {
            rows: rows.len(),
            qty: rows.iter().map(|row| row.qty).sum(),
        }
    }
}

pub fn ids(rows: &RowCollection<Row>) -> Vec<String> {
    rows.iter().map(|row| row.id.clone()).collect()
}

struct Guard {
    released: Arc<AtomicUsize>,
    refuse: Arc<AtomicBool>,
}

impl FeedGuard for Guard {
    fn release(self: Box<Self>) -> Result<(), FeedError> {
        self.released.fetch_add(1, Ordering::SeqCst);
        if self.refuse.load(Ordering::SeqCst) {
            return Err(FeedError::Release("server refused leave".into()));
        }
        Ok(())
    }
}

/// Feed whose channels are driven by the test. `fail_next` makes upcoming
/// subscribe calls fail outright; `refuse_releases` makes every guard report
/// a release error.
pub struct ScriptedFeed {
    pub calls: AtomicUsize,
    pub released: Arc<AtomicUsize>,
    refuse_release: Arc<AtomicBool>,
    fail_next: AtomicUsize,
    opened_tx: mpsc::UnboundedSender<mpsc::Sender<FeedMessage>>,
    opened_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<mpsc::Sender<FeedMessage>>>,
}

impl ScriptedFeed {
    pub fn new() -> Arc<Self> {
        let (opened_tx, opened_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            released: Arc::new(AtomicUsize::new(0)),
            refuse_release: Arc::new(AtomicBool::new(false)),
            fail_next: AtomicUsize::new(0),
            opened_tx,
            opened_rx: tokio::sync::Mutex::new(opened_rx),
        })
    }

    pub fn fail_next(&self, count: usize) {
        self.fail_next.store(count, Ordering::SeqCst);
    }

    pub fn refuse_releases(&self) {
        self.refuse_release.store(true, Ordering::SeqCst);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Waits for the next successfully opened channel.
    pub async fn next_channel(&self) -> mpsc::Sender<FeedMessage> {
        self.opened_rx
            .lock()
            .await
            .recv()
            .await
            .expect("feed dropped")
    }
}

#[async_trait]
impl ChangeFeed for ScriptedFeed {
    async fn subscribe(&self, _channel: &ChannelSpec) -> Result<FeedSubscription, FeedError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let pending = self.fail_next.load(Ordering::SeqCst);
        if pending > 0 {
            self.fail_next.store(pending - 1, Ordering::SeqCst);
            return Err(FeedError::Connect("connection refused".into()));
        }
        let (tx, rx) = mpsc::channel(64);
        let _ = self.opened_tx.send(tx);
        Ok(FeedSubscription {
            messages: rx,
            guard: Box::new(Guard {
                released: self.released.clone(),
                refuse: self.refuse_release.clone(),
            }),
        })
    }
}

/// Serves queued results first, then keeps returning the last good rows.
pub struct ScriptedSnapshots {
    pub fetches: AtomicUsize,
    queued: Mutex<VecDeque<Result<Vec<Row>, SnapshotError>>>,
    steady: Mutex<Vec<Row>>,
}

impl ScriptedSnapshots {
    pub fn new(steady: Vec<Row>) -> Arc<Self> {
        Arc::new(Self {
            fetches: AtomicUsize::new(0),
            queued: Mutex::new(VecDeque::new()),
            steady: Mutex::new(steady),
        })
    }

    pub fn push(&self, result: Result<Vec<Row>, SnapshotError>) {
        self.queued.lock().push_back(result);
    }

    pub fn set_steady(&self, rows: Vec<Row>) {
        *self.steady.lock() = rows;
    }

    pub fn fail_always(&self) {
        self.set_steady(Vec::new());
        for _ in 0..64 {
            self.push(Err(SnapshotError::Status(503)));
        }
    }

    pub fn fetches(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SnapshotSource<Row> for ScriptedSnapshots {
    async fn fetch(&self) -> Result<Snapshot<Row>, SnapshotError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        if let Some(result) = self.queued.lock().pop_front() {
            return result.map(Snapshot::new);
        }
        Ok(Snapshot::new(self.steady.lock().clone()))
    }
}
