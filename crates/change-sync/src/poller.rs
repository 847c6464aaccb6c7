//! Snapshot polling while the push channel is not live.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::error::SnapshotError;
use crate::event::ConnectionStatus;
use crate::metrics;
use crate::timer::{self, TimerSlot};
use crate::visibility::VisibilityGate;

/// One poll: fetch a snapshot and hand it to whoever owns the view.
#[async_trait]
pub trait PollTask: Send + Sync + 'static {
    async fn poll(&self) -> Result<(), SnapshotError>;
}

#[derive(Clone)]
pub struct FallbackPoller {
    inner: Arc<Inner>,
}

struct Inner {
    interval: Duration,
    task: Arc<dyn PollTask>,
    gate: Arc<VisibilityGate>,
    state: Mutex<State>,
}

#[derive(Default)]
struct State {
    timer: TimerSlot,
    closed: bool,
}

impl FallbackPoller {
    pub fn new(interval: Duration, task: Arc<dyn PollTask>, gate: Arc<VisibilityGate>) -> Self {
        Self {
            inner: Arc::new(Inner {
                interval,
                task,
                gate,
                state: Mutex::new(State::default()),
            }),
        }
    }

    pub fn interval(&self) -> Duration {
        self.inner.interval
    }

    pub fn is_active(&self) -> bool {
        self.inner.state.lock().timer.is_set()
    }

    /// Polling runs exactly while the status is anything but `live`.
    pub fn on_status(&self, status: ConnectionStatus) {
        if status.is_live() {
            self.deactivate();
        } else {
            self.activate();
        }
    }

    /// Starts polling with an immediate fetch. A poller that is already
    /// active keeps its schedule. Returns whether polling was started.
    pub fn activate(&self) -> bool {
        let mut state = self.inner.state.lock();
        if state.closed || state.timer.is_set() {
            return false;
        }
        let inner = self.inner.clone();
        state.timer.replace(timer::schedule_interval(self.inner.interval, move || {
            let inner = inner.clone();
            async move { inner.tick().await }
        }));
        info!(
            target = "sync.poller",
            interval_ms = self.inner.interval.as_millis() as u64,
            "fallback polling started"
        );
        true
    }

    pub fn deactivate(&self) -> bool {
        let stopped = self.inner.state.lock().timer.clear();
        if stopped {
            info!(target = "sync.poller", "fallback polling stopped");
        }
        stopped
    }

    /// Stops polling for good; later activations are ignored.
    pub fn close(&self) {
        let mut state = self.inner.state.lock();
        state.closed = true;
        state.timer.clear();
    }
}

impl Inner {
    async fn tick(&self) {
        if !self.gate.permits_delivery() {
            metrics::POLLS.with_label_values(&["hidden"]).inc();
            debug!(target = "sync.poller", "skipping poll while hidden");
            return;
        }
        match self.task.poll().await {
            Ok(()) => {
                metrics::POLLS.with_label_values(&["ok"]).inc();
                debug!(target = "sync.poller", "fallback poll applied");
            }
            Err(err) => {
                metrics::POLLS.with_label_values(&["error"]).inc();
                warn!(target = "sync.poller", error = %err, "fallback poll failed");
            }
        }
    }
}
