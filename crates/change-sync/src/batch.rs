//! Debounced batch collection.
//!
//! Events are buffered until `debounce` has elapsed since the first event of
//! the current window, then handed to the sink as one batch. The window is
//! fixed from its first event: later events join it but do not push the
//! deadline back.

use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::event::ChangeEvent;
use crate::subscription::EventSink;
use crate::timer::{self, TimerSlot};

/// Receives flushed batches. Called outside the buffer lock, so a sink may
/// enqueue into the same collector; those events start a new window.
/// Deliveries are serialized: a sink must not call
/// [`BatchCollector::flush_now`] on its own collector.
pub trait BatchSink<E>: Send + Sync {
    fn deliver(&self, batch: Vec<E>);
}

impl<E, F> BatchSink<E> for F
where
    F: Fn(Vec<E>) + Send + Sync,
{
    fn deliver(&self, batch: Vec<E>) {
        (self)(batch)
    }
}

pub struct BatchCollector<E> {
    inner: Arc<Inner<E>>,
}

impl<E> Clone for BatchCollector<E> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

struct Inner<E> {
    debounce: Duration,
    sink: Arc<dyn BatchSink<E>>,
    /// Held from taking a window until the sink returns, so batches reach the
    /// sink in window order and `flush_now` never overtakes a timer flush.
    delivery: Mutex<()>,
    state: Mutex<WindowState<E>>,
}

struct WindowState<E> {
    buffer: Vec<E>,
    timer: TimerSlot,
    window: u64,
}

impl<E: Send + 'static> BatchCollector<E> {
    pub fn new<S>(debounce: Duration, sink: S) -> Self
    where
        S: BatchSink<E> + 'static,
    {
        Self {
            inner: Arc::new(Inner {
                debounce,
                sink: Arc::new(sink),
                delivery: Mutex::new(()),
                state: Mutex::new(WindowState {
                    buffer: Vec::new(),
                    timer: TimerSlot::new(),
                    window: 0,
                }),
            }),
        }
    }

    pub fn debounce(&self) -> Duration {
        self.inner.debounce
    }

    pub fn pending(&self) -> usize {
        self.inner.state.lock().buffer.len()
    }

    pub fn enqueue(&self, event: E) {
        let mut state = self.inner.state.lock();
        state.buffer.push(event);
        if state.timer.is_set() {
            return;
        }
        let window = state.window;
        let inner: Weak<Inner<E>> = Arc::downgrade(&self.inner);
        state.timer.replace(timer::schedule(self.inner.debounce, async move {
            if let Some(inner) = inner.upgrade() {
                inner.flush_window(window);
            }
        }));
        trace!(
            target = "sync.batch",
            window,
            debounce_ms = self.inner.debounce.as_millis() as u64,
            "opened batch window"
        );
    }

    /// Cancels the pending timer and delivers whatever is buffered right
    /// away. A delivery already in progress completes first. Returns the
    /// number of events delivered.
    pub fn flush_now(&self) -> usize {
        let _delivery = self.inner.delivery.lock();
        let batch = {
            let mut state = self.inner.state.lock();
            state.timer.clear();
            take_window(&mut state)
        };
        self.inner.deliver(batch)
    }
}

impl<E> Inner<E> {
    fn flush_window(&self, window: u64) -> usize {
        let _delivery = self.delivery.lock();
        let batch = {
            let mut state = self.state.lock();
            if state.window != window {
                return 0;
            }
            state.timer.release();
            take_window(&mut state)
        };
        self.deliver(batch)
    }

    fn deliver(&self, batch: Vec<E>) -> usize {
        if batch.is_empty() {
            return 0;
        }
        let size = batch.len();
        debug!(target = "sync.batch", events = size, "flushing batch");
        self.sink.deliver(batch);
        size
    }
}

fn take_window<E>(state: &mut WindowState<E>) -> Vec<E> {
    state.window = state.window.wrapping_add(1);
    std::mem::take(&mut state.buffer)
}

impl EventSink for BatchCollector<ChangeEvent> {
    fn push(&self, event: ChangeEvent) {
        self.enqueue(event);
    }
}
