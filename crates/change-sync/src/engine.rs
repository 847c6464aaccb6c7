//! Composition root. Wires the subscription manager, batch collector,
//! fallback poller and visibility gate around a single worker task that owns
//! the view.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::backoff::Backoff;
use crate::batch::BatchCollector;
use crate::config::SyncConfig;
use crate::error::{EngineError, SnapshotError};
use crate::event::{ChangeEvent, ChannelSpec, ConnectionStatus};
use crate::metrics;
use crate::poller::{FallbackPoller, PollTask};
use crate::reconcile::{apply_batch, replace_with_snapshot, ApplyReport, ModelView, ViewModel};
use crate::snapshot::{Snapshot, SnapshotSource};
use crate::subscription::{ChangeFeed, StatusListener, SubscriptionManager};
use crate::visibility::{Visibility, VisibilityChange, VisibilityGate};

enum ViewCommand<R> {
    ApplyBatch(Vec<ChangeEvent>),
    ReplaceSnapshot(Snapshot<R>),
    Shutdown(oneshot::Sender<()>),
}

enum Lifecycle<M: ViewModel> {
    Idle {
        view: ModelView<M>,
        receiver: mpsc::UnboundedReceiver<ViewCommand<M::Row>>,
    },
    Starting,
    Running(JoinHandle<()>),
    Stopped,
}

pub struct SyncEngine<M: ViewModel> {
    config: SyncConfig,
    model: Arc<M>,
    snapshots: Arc<dyn SnapshotSource<M::Row>>,
    gate: Arc<VisibilityGate>,
    collector: BatchCollector<ChangeEvent>,
    manager: SubscriptionManager,
    poller: FallbackPoller,
    listener: Arc<EngineListener>,
    commands: mpsc::UnboundedSender<ViewCommand<M::Row>>,
    view_tx: Arc<watch::Sender<Arc<ModelView<M>>>>,
    status_tx: Arc<watch::Sender<ConnectionStatus>>,
    lifecycle: Mutex<Lifecycle<M>>,
}

impl<M: ViewModel> SyncEngine<M> {
    pub fn new(
        config: SyncConfig,
        model: M,
        store: ModelView<M>,
        channel: ChannelSpec,
        feed: Arc<dyn ChangeFeed>,
        snapshots: Arc<dyn SnapshotSource<M::Row>>,
    ) -> Self {
        let config = config.normalized();
        let model = Arc::new(model);
        let gate = Arc::new(VisibilityGate::new());
        let (commands, receiver) = mpsc::unbounded_channel();
        let view_tx = Arc::new(watch::channel(Arc::new(store.clone())).0);
        let status_tx = Arc::new(watch::channel(ConnectionStatus::Offline).0);

        let batches = commands.clone();
        let collector = BatchCollector::new(config.debounce, move |batch: Vec<ChangeEvent>| {
            if batches.send(ViewCommand::ApplyBatch(batch)).is_err() {
                debug!(target = "sync.engine", "view worker closed; dropping batch");
            }
        });

        let poller = FallbackPoller::new(
            config.poll_interval,
            Arc::new(SnapshotPoll {
                snapshots: snapshots.clone(),
                commands: commands.clone(),
            }),
            gate.clone(),
        );

        let listener = Arc::new(EngineListener {
            status: status_tx.clone(),
            poller: poller.clone(),
            downstream: Mutex::new(None),
            closing: AtomicBool::new(false),
        });

        let manager = SubscriptionManager::new(
            channel,
            feed,
            Arc::new(collector.clone()),
            gate.clone(),
            listener.clone(),
            Backoff::new(config.initial_retry_delay, config.max_retry_delay),
        );

        Self {
            config,
            model,
            snapshots,
            gate,
            collector,
            manager,
            poller,
            listener,
            commands,
            view_tx,
            status_tx,
            lifecycle: Mutex::new(Lifecycle::Idle {
                view: store,
                receiver,
            }),
        }
    }

    /// Registers the single external status listener. Replaces any earlier one.
    ///
    /// The listener runs synchronously under the subscription lock. It may
    /// read `current_status`, `has_channel`, `is_polling` and `view`, but must
    /// not call `start`, `set_visibility` or `shutdown`, which would deadlock.
    pub fn with_status_listener(self, listener: Arc<dyn StatusListener>) -> Self {
        *self.listener.downstream.lock() = Some(listener);
        self
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn view(&self) -> watch::Receiver<Arc<ModelView<M>>> {
        self.view_tx.subscribe()
    }

    pub fn status(&self) -> watch::Receiver<ConnectionStatus> {
        self.status_tx.subscribe()
    }

    pub fn current_status(&self) -> ConnectionStatus {
        *self.status_tx.borrow()
    }

    pub fn visibility(&self) -> Visibility {
        self.gate.visibility()
    }

    pub fn is_polling(&self) -> bool {
        self.poller.is_active()
    }

    pub fn has_channel(&self) -> bool {
        self.manager.has_channel()
    }

    fn is_running(&self) -> bool {
        matches!(*self.lifecycle.lock(), Lifecycle::Running(_))
    }

    /// Loads the initial snapshot, spawns the view worker and opens the
    /// subscription. A failed snapshot leaves the supplied store in place.
    pub async fn start(&self) -> Result<(), EngineError> {
        let (mut view, receiver) = {
            let mut lifecycle = self.lifecycle.lock();
            match std::mem::replace(&mut *lifecycle, Lifecycle::Starting) {
                Lifecycle::Idle { view, receiver } => (view, receiver),
                Lifecycle::Stopped => {
                    *lifecycle = Lifecycle::Stopped;
                    return Err(EngineError::NotRunning);
                }
                other => {
                    *lifecycle = other;
                    return Err(EngineError::AlreadyStarted);
                }
            }
        };

        match self.snapshots.fetch().await {
            Ok(snapshot) => {
                let rows = snapshot.rows.len();
                replace_with_snapshot(&*self.model, &mut view, snapshot.rows, snapshot.refreshed_at);
                info!(target = "sync.engine", rows, "initial snapshot loaded");
            }
            Err(err) => {
                view.summary = self.model.summarize(&view.rows);
                warn!(
                    target = "sync.engine",
                    error = %err,
                    rows = view.rows.len(),
                    "initial snapshot failed; starting from stored view"
                );
            }
        }

        let view = Arc::new(view);
        self.view_tx.send_replace(view.clone());

        let mut lifecycle = self.lifecycle.lock();
        if !matches!(*lifecycle, Lifecycle::Starting) {
            return Err(EngineError::NotRunning);
        }
        let worker = tokio::spawn(run_worker(
            self.model.clone(),
            view,
            receiver,
            self.view_tx.clone(),
            self.config.latency_warn_threshold,
        ));
        *lifecycle = Lifecycle::Running(worker);
        drop(lifecycle);

        self.manager.start();
        info!(
            target = "sync.engine",
            channel = %self.manager.channel().name,
            bindings = self.manager.channel().bindings.len(),
            "sync engine started"
        );
        Ok(())
    }

    pub fn set_visibility(&self, visibility: Visibility) -> VisibilityChange {
        let change = self.gate.set(visibility);
        if !self.is_running() {
            return change;
        }
        match change {
            VisibilityChange::Hidden if self.config.release_channel_when_hidden => {
                info!(target = "sync.visibility", "releasing channel while hidden");
                self.manager.stop();
            }
            VisibilityChange::Resumed if self.manager.is_stopped() => {
                info!(target = "sync.visibility", "reopening channel on resume");
                self.manager.start();
            }
            _ => {}
        }
        change
    }

    /// Fetches a snapshot now and queues it behind any pending batches.
    pub async fn refresh_now(&self) -> Result<(), SnapshotError> {
        if !self.is_running() {
            return Err(SnapshotError::Discarded);
        }
        let snapshot = self.snapshots.fetch().await?;
        self.commands
            .send(ViewCommand::ReplaceSnapshot(snapshot))
            .map_err(|_| SnapshotError::Discarded)
    }

    /// Stops the channel and the poller, flushes buffered events through the
    /// worker and waits for it to drain. `offline` is announced only after the
    /// drain. Safe to call more than once.
    pub async fn shutdown(&self) {
        let worker = {
            let mut lifecycle = self.lifecycle.lock();
            match std::mem::replace(&mut *lifecycle, Lifecycle::Stopped) {
                Lifecycle::Running(worker) => Some(worker),
                _ => None,
            }
        };

        self.poller.close();
        self.listener.closing.store(true, Ordering::Release);
        self.manager.stop();
        let flushed = self.collector.flush_now();

        if let Some(worker) = worker {
            let (done_tx, done_rx) = oneshot::channel();
            if self.commands.send(ViewCommand::Shutdown(done_tx)).is_ok() {
                let _ = done_rx.await;
            }
            if let Err(err) = worker.await {
                warn!(target = "sync.engine", error = %err, "view worker ended abnormally");
            }
        }
        if self.current_status() != ConnectionStatus::Offline {
            self.listener.announce(ConnectionStatus::Offline);
        }
        info!(target = "sync.engine", flushed, "sync engine stopped");
    }
}

/// Fans status transitions out to the poller, the status watch and the
/// optional external listener, in that order. Once `closing` is set the
/// manager's transitions are swallowed; shutdown announces the final status.
struct EngineListener {
    status: Arc<watch::Sender<ConnectionStatus>>,
    poller: FallbackPoller,
    downstream: Mutex<Option<Arc<dyn StatusListener>>>,
    closing: AtomicBool,
}

impl EngineListener {
    fn announce(&self, status: ConnectionStatus) {
        self.status.send_replace(status);
        let downstream = self.downstream.lock().clone();
        if let Some(listener) = downstream {
            listener.on_status(status);
        }
    }
}

impl StatusListener for EngineListener {
    fn on_status(&self, status: ConnectionStatus) {
        if self.closing.load(Ordering::Acquire) {
            return;
        }
        self.poller.on_status(status);
        self.announce(status);
    }
}

struct SnapshotPoll<R> {
    snapshots: Arc<dyn SnapshotSource<R>>,
    commands: mpsc::UnboundedSender<ViewCommand<R>>,
}

#[async_trait]
impl<R: Send + Sync + 'static> PollTask for SnapshotPoll<R> {
    async fn poll(&self) -> Result<(), SnapshotError> {
        let snapshot = self.snapshots.fetch().await?;
        self.commands
            .send(ViewCommand::ReplaceSnapshot(snapshot))
            .map_err(|_| SnapshotError::Discarded)
    }
}

async fn run_worker<M: ViewModel>(
    model: Arc<M>,
    mut view: Arc<ModelView<M>>,
    mut receiver: mpsc::UnboundedReceiver<ViewCommand<M::Row>>,
    publish: Arc<watch::Sender<Arc<ModelView<M>>>>,
    latency_warn: Duration,
) {
    while let Some(command) = receiver.recv().await {
        match command {
            ViewCommand::ApplyBatch(batch) => {
                let report = apply_batch(&*model, Arc::make_mut(&mut view), &batch);
                record_batch(&report, batch.len(), latency_warn);
            }
            ViewCommand::ReplaceSnapshot(snapshot) => {
                let rows = snapshot.rows.len();
                replace_with_snapshot(
                    &*model,
                    Arc::make_mut(&mut view),
                    snapshot.rows,
                    snapshot.refreshed_at,
                );
                debug!(target = "sync.engine", rows, "snapshot applied");
            }
            ViewCommand::Shutdown(done) => {
                let _ = done.send(());
                break;
            }
        }
        publish.send_replace(view.clone());
    }
    debug!(target = "sync.engine", "view worker stopped");
}

fn record_batch(report: &ApplyReport, size: usize, latency_warn: Duration) {
    metrics::BATCHES_APPLIED.inc();
    for (kind, count) in [
        ("insert", report.inserted),
        ("update", report.updated),
        ("upsert", report.upserted),
        ("delete", report.deleted),
    ] {
        if count > 0 {
            metrics::EVENTS_APPLIED
                .with_label_values(&[kind])
                .inc_by(count as u64);
        }
    }
    for (reason, count) in [
        ("malformed", report.skipped),
        ("missing_row", report.missing_deletes),
    ] {
        if count > 0 {
            metrics::EVENTS_SKIPPED
                .with_label_values(&[reason])
                .inc_by(count as u64);
        }
    }

    let lag = report
        .earliest_commit
        .and_then(|at| (Utc::now() - at).to_std().ok());
    match lag {
        Some(lag) if lag > latency_warn => warn!(
            target = "sync.engine",
            events = size,
            lag_ms = lag.as_millis() as u64,
            "batch applied behind commit time"
        ),
        _ => debug!(
            target = "sync.engine",
            events = size,
            applied = report.applied(),
            skipped = report.skipped,
            lag_ms = ?lag.map(|lag| lag.as_millis() as u64),
            "batch applied"
        ),
    }
}
