//! Cancellable one-shot and repeating timers backed by Tokio tasks.
//!
//! Every delayed callback in the crate goes through here so that teardown
//! paths have a single thing to cancel.

use std::future::Future;
use std::time::Duration;

use tokio::task::AbortHandle;
use tokio::time::{self, MissedTickBehavior};

/// Handle to a scheduled task. Dropping it does not cancel the task.
#[derive(Debug)]
pub struct TimerHandle {
    abort: AbortHandle,
}

impl TimerHandle {
    pub fn cancel(&self) {
        self.abort.abort();
    }

    pub fn is_finished(&self) -> bool {
        self.abort.is_finished()
    }
}

/// Runs `task` once after `delay`.
pub fn schedule<F>(delay: Duration, task: F) -> TimerHandle
where
    F: Future<Output = ()> + Send + 'static,
{
    let handle = tokio::spawn(async move {
        time::sleep(delay).await;
        task.await;
    });
    TimerHandle {
        abort: handle.abort_handle(),
    }
}

/// Runs `tick` immediately and then every `period`. A tick that overruns the
/// period pushes the next one back; ticks never overlap.
pub fn schedule_interval<F, Fut>(period: Duration, mut tick: F) -> TimerHandle
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let period = period.max(Duration::from_millis(1));
    let handle = tokio::spawn(async move {
        let mut ticker = time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            tick().await;
        }
    });
    TimerHandle {
        abort: handle.abort_handle(),
    }
}

/// Holds at most one live timer. Replacing or clearing the slot cancels the
/// previous occupant.
#[derive(Debug, Default)]
pub struct TimerSlot {
    current: Option<TimerHandle>,
}

impl TimerSlot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn replace(&mut self, handle: TimerHandle) {
        if let Some(previous) = self.current.replace(handle) {
            previous.cancel();
        }
    }

    /// Cancels the held timer. Returns whether one was held.
    pub fn clear(&mut self) -> bool {
        match self.current.take() {
            Some(handle) => {
                handle.cancel();
                true
            }
            None => false,
        }
    }

    /// Forgets the held timer without cancelling it. Used by a timer's own
    /// task once it has fired, since aborting itself mid-run would be wrong.
    pub fn release(&mut self) -> Option<TimerHandle> {
        self.current.take()
    }

    pub fn is_set(&self) -> bool {
        self.current.is_some()
    }
}
