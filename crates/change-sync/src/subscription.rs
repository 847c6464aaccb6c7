//! Subscription lifecycle: connect, pump feed messages, degrade, back off,
//! reconnect.
//!
//! Status moves `offline -> connecting -> live`, falling to `degraded` on any
//! channel failure and back to `connecting` when the retry timer fires.
//! `stop()` is the only way back to `offline`. Each `start()`/`stop()` bumps
//! an epoch; work spawned under an older epoch notices and exits quietly.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tracing::{debug, info, trace, warn};

use crate::backoff::Backoff;
use crate::error::FeedError;
use crate::event::{ChangeEvent, ChannelSpec, ConnectionStatus};
use crate::metrics;
use crate::timer::{self, TimerSlot};
use crate::visibility::VisibilityGate;

/// What a feed reports on an open channel.
#[derive(Debug, Clone, PartialEq)]
pub enum FeedMessage {
    Subscribed,
    Change(ChangeEvent),
    ChannelError(String),
    TimedOut,
    Closed,
}

/// Releases the server-side channel. Called exactly once per opened channel.
pub trait FeedGuard: Send {
    fn release(self: Box<Self>) -> Result<(), FeedError>;
}

pub struct FeedSubscription {
    pub messages: mpsc::Receiver<FeedMessage>,
    pub guard: Box<dyn FeedGuard>,
}

#[async_trait]
pub trait ChangeFeed: Send + Sync + 'static {
    async fn subscribe(&self, channel: &ChannelSpec) -> Result<FeedSubscription, FeedError>;
}

pub trait EventSink: Send + Sync {
    fn push(&self, event: ChangeEvent);
}

impl<F> EventSink for F
where
    F: Fn(ChangeEvent) + Send + Sync,
{
    fn push(&self, event: ChangeEvent) {
        (self)(event)
    }
}

/// Observes status transitions. Invoked synchronously, in order, while the
/// manager's state lock is held. A listener may read [`SubscriptionManager::status`]
/// and [`SubscriptionManager::has_channel`] but must not call `start`, `stop`
/// or `retry_attempt`; those take the same lock and would deadlock.
pub trait StatusListener: Send + Sync {
    fn on_status(&self, status: ConnectionStatus);
}

impl<F> StatusListener for F
where
    F: Fn(ConnectionStatus) + Send + Sync,
{
    fn on_status(&self, status: ConnectionStatus) {
        (self)(status)
    }
}

pub struct SubscriptionManager {
    inner: Arc<Inner>,
}

struct Inner {
    channel: ChannelSpec,
    feed: Arc<dyn ChangeFeed>,
    sink: Arc<dyn EventSink>,
    gate: Arc<VisibilityGate>,
    listener: Arc<dyn StatusListener>,
    /// Mirrors of `State::status` and `State::guard.is_some()`, readable
    /// without the state lock.
    published: Mutex<ConnectionStatus>,
    holding: AtomicBool,
    state: Mutex<State>,
}

struct State {
    epoch: u64,
    status: ConnectionStatus,
    backoff: Backoff,
    guard: Option<Box<dyn FeedGuard>>,
    attempt: Option<AbortHandle>,
    retry: TimerSlot,
}

impl SubscriptionManager {
    pub fn new(
        channel: ChannelSpec,
        feed: Arc<dyn ChangeFeed>,
        sink: Arc<dyn EventSink>,
        gate: Arc<VisibilityGate>,
        listener: Arc<dyn StatusListener>,
        backoff: Backoff,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                channel,
                feed,
                sink,
                gate,
                listener,
                published: Mutex::new(ConnectionStatus::Offline),
                holding: AtomicBool::new(false),
                state: Mutex::new(State {
                    epoch: 0,
                    status: ConnectionStatus::Offline,
                    backoff,
                    guard: None,
                    attempt: None,
                    retry: TimerSlot::new(),
                }),
            }),
        }
    }

    pub fn channel(&self) -> &ChannelSpec {
        &self.inner.channel
    }

    pub fn status(&self) -> ConnectionStatus {
        *self.inner.published.lock()
    }

    pub fn is_stopped(&self) -> bool {
        self.status() == ConnectionStatus::Offline
    }

    /// Whether a server-side channel is currently held.
    pub fn has_channel(&self) -> bool {
        self.inner.holding.load(Ordering::Acquire)
    }

    pub fn retry_attempt(&self) -> u32 {
        self.inner.state.lock().backoff.attempt()
    }

    /// Tears down whatever is in flight and connects afresh. Status becomes
    /// `connecting` before this returns.
    pub fn start(&self) {
        let (epoch, stale) = {
            let mut state = self.inner.state.lock();
            state.epoch += 1;
            let stale = state.halt();
            state.backoff.reset();
            (state.epoch, stale)
        };
        if let Some(guard) = stale {
            self.inner.release(guard);
        }
        info!(
            target = "sync.subscription",
            channel = %self.inner.channel.name,
            epoch,
            "starting subscription"
        );
        self.inner.connect(epoch);
    }

    /// Cancels any pending retry, releases the channel and goes `offline`.
    pub fn stop(&self) {
        let guard = {
            let mut state = self.inner.state.lock();
            state.epoch += 1;
            let guard = state.halt();
            self.inner.set_status(&mut state, ConnectionStatus::Offline);
            guard
        };
        if let Some(guard) = guard {
            self.inner.release(guard);
        }
        info!(
            target = "sync.subscription",
            channel = %self.inner.channel.name,
            "subscription stopped"
        );
    }
}

impl Drop for SubscriptionManager {
    fn drop(&mut self) {
        let guard = {
            let mut state = self.inner.state.lock();
            state.epoch += 1;
            state.halt()
        };
        if let Some(guard) = guard {
            self.inner.release(guard);
        }
    }
}

impl State {
    fn halt(&mut self) -> Option<Box<dyn FeedGuard>> {
        self.retry.clear();
        if let Some(attempt) = self.attempt.take() {
            attempt.abort();
        }
        self.guard.take()
    }
}

impl Inner {
    fn set_status(&self, state: &mut State, status: ConnectionStatus) {
        if state.status == status {
            return;
        }
        let previous = std::mem::replace(&mut state.status, status);
        *self.published.lock() = status;
        metrics::STATUS_TRANSITIONS
            .with_label_values(&[status.as_str()])
            .inc();
        debug!(
            target = "sync.subscription",
            from = %previous,
            to = %status,
            "connection status changed"
        );
        self.listener.on_status(status);
    }

    fn connect(self: &Arc<Self>, epoch: u64) {
        let mut state = self.state.lock();
        if state.epoch != epoch {
            return;
        }
        self.set_status(&mut state, ConnectionStatus::Connecting);
        let inner = self.clone();
        let task = tokio::spawn(async move { inner.run_attempt(epoch).await });
        if let Some(previous) = state.attempt.replace(task.abort_handle()) {
            previous.abort();
        }
    }

    async fn run_attempt(self: Arc<Self>, epoch: u64) {
        let failure = match self.feed.subscribe(&self.channel).await {
            Ok(FeedSubscription {
                mut messages,
                guard,
            }) => {
                if !self.install_guard(epoch, guard) {
                    return;
                }
                self.pump(epoch, &mut messages).await
            }
            Err(err) => Some(format!("subscribe failed: {err}")),
        };
        if let Some(reason) = failure {
            self.fail(epoch, reason);
        }
    }

    fn install_guard(&self, epoch: u64, guard: Box<dyn FeedGuard>) -> bool {
        let mut state = self.state.lock();
        if state.epoch == epoch {
            state.guard = Some(guard);
            self.holding.store(true, Ordering::Release);
            return true;
        }
        drop(state);
        debug!(
            target = "sync.subscription",
            epoch,
            "discarding channel opened for a superseded subscription"
        );
        self.release(guard);
        false
    }

    /// Returns the failure reason, or `None` when the epoch went stale.
    async fn pump(&self, epoch: u64, messages: &mut mpsc::Receiver<FeedMessage>) -> Option<String> {
        while let Some(message) = messages.recv().await {
            match message {
                FeedMessage::Subscribed => {
                    if !self.mark_live(epoch) {
                        return None;
                    }
                }
                FeedMessage::Change(event) => {
                    if !self.is_current(epoch) {
                        return None;
                    }
                    self.forward(event);
                }
                FeedMessage::ChannelError(reason) => return Some(format!("channel error: {reason}")),
                FeedMessage::TimedOut => return Some("subscription timed out".to_string()),
                FeedMessage::Closed => return Some("channel closed".to_string()),
            }
        }
        Some("feed ended without closing".to_string())
    }

    fn is_current(&self, epoch: u64) -> bool {
        self.state.lock().epoch == epoch
    }

    fn mark_live(&self, epoch: u64) -> bool {
        let mut state = self.state.lock();
        if state.epoch != epoch {
            return false;
        }
        state.backoff.reset();
        self.set_status(&mut state, ConnectionStatus::Live);
        info!(
            target = "sync.subscription",
            channel = %self.channel.name,
            "subscription live"
        );
        true
    }

    fn forward(&self, event: ChangeEvent) {
        if !self.gate.permits_delivery() {
            metrics::EVENTS_DROPPED_HIDDEN.inc();
            trace!(target = "sync.subscription", kind = %event.kind, "dropping event while hidden");
            return;
        }
        if !self.channel.accepts(event.kind) {
            trace!(target = "sync.subscription", kind = %event.kind, "event outside bindings");
            return;
        }
        self.sink.push(event);
    }

    fn fail(self: &Arc<Self>, epoch: u64, reason: String) {
        let (guard, delay, attempt) = {
            let mut state = self.state.lock();
            if state.epoch != epoch {
                return;
            }
            state.attempt = None;
            let guard = state.guard.take();
            self.holding.store(false, Ordering::Release);
            let delay = state.backoff.next_delay();
            let attempt = state.backoff.attempt();
            self.set_status(&mut state, ConnectionStatus::Degraded);
            let weak: Weak<Inner> = Arc::downgrade(self);
            state.retry.replace(timer::schedule(delay, async move {
                if let Some(inner) = weak.upgrade() {
                    inner.retry(epoch);
                }
            }));
            (guard, delay, attempt)
        };
        metrics::RETRIES_SCHEDULED.inc();
        warn!(
            target = "sync.subscription",
            channel = %self.channel.name,
            reason = %reason,
            attempt,
            retry_in_ms = delay.as_millis() as u64,
            "subscription degraded; retry scheduled"
        );
        if let Some(guard) = guard {
            self.release(guard);
        }
    }

    fn retry(self: &Arc<Self>, epoch: u64) {
        {
            let mut state = self.state.lock();
            if state.epoch != epoch {
                return;
            }
            state.retry.release();
        }
        debug!(target = "sync.subscription", epoch, "retry timer fired");
        self.connect(epoch);
    }

    fn release(&self, guard: Box<dyn FeedGuard>) {
        if let Err(err) = guard.release() {
            warn!(
                target = "sync.subscription",
                channel = %self.channel.name,
                error = %err,
                "failed to release channel"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::time::{self, Instant};

    struct CountingGuard(Arc<AtomicUsize>);

    impl FeedGuard for CountingGuard {
        fn release(self: Box<Self>) -> Result<(), FeedError> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    /// Hands each opened channel's sender to the test; fails the first
    /// `failures` subscribe calls.
    struct FakeFeed {
        failures: AtomicUsize,
        calls: AtomicUsize,
        released: Arc<AtomicUsize>,
        opened: mpsc::UnboundedSender<(Instant, mpsc::Sender<FeedMessage>)>,
    }

    #[async_trait]
    impl ChangeFeed for FakeFeed {
        async fn subscribe(&self, _channel: &ChannelSpec) -> Result<FeedSubscription, FeedError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let remaining = self.failures.load(Ordering::SeqCst);
            if remaining > 0 {
                self.failures.store(remaining - 1, Ordering::SeqCst);
                let _ = self.opened.send((Instant::now(), mpsc::channel(1).0));
                return Err(FeedError::Connect("refused".into()));
            }
            let (tx, rx) = mpsc::channel(16);
            let _ = self.opened.send((Instant::now(), tx));
            Ok(FeedSubscription {
                messages: rx,
                guard: Box::new(CountingGuard(self.released.clone())),
            })
        }
    }

    struct Harness {
        manager: SubscriptionManager,
        feed: Arc<FakeFeed>,
        gate: Arc<VisibilityGate>,
        opened: mpsc::UnboundedReceiver<(Instant, mpsc::Sender<FeedMessage>)>,
        statuses: Arc<Mutex<Vec<ConnectionStatus>>>,
        events: Arc<Mutex<Vec<ChangeEvent>>>,
    }

    fn harness(failures: usize) -> Harness {
        let (opened_tx, opened) = mpsc::unbounded_channel();
        let feed = Arc::new(FakeFeed {
            failures: AtomicUsize::new(failures),
            calls: AtomicUsize::new(0),
            released: Arc::new(AtomicUsize::new(0)),
            opened: opened_tx,
        });
        let statuses = Arc::new(Mutex::new(Vec::new()));
        let events = Arc::new(Mutex::new(Vec::new()));
        let gate = Arc::new(VisibilityGate::new());
        let seen = statuses.clone();
        let received = events.clone();
        let manager = SubscriptionManager::new(
            ChannelSpec::new("kpi", Vec::new()),
            feed.clone(),
            Arc::new(move |event: ChangeEvent| received.lock().push(event)) as Arc<dyn EventSink>,
            gate.clone(),
            Arc::new(move |status: ConnectionStatus| seen.lock().push(status)),
            Backoff::new(Duration::from_millis(500), Duration::from_millis(30_000)),
        );
        Harness {
            manager,
            feed,
            gate,
            opened,
            statuses,
            events,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn start_connects_and_goes_live() {
        let mut h = harness(0);
        h.manager.start();
        assert_eq!(h.manager.status(), ConnectionStatus::Connecting);

        let (_, channel) = h.opened.recv().await.unwrap();
        channel.send(FeedMessage::Subscribed).await.unwrap();
        channel
            .send(FeedMessage::Change(ChangeEvent::insert(serde_json::json!({"id": "a"}))))
            .await
            .unwrap();
        time::sleep(Duration::from_millis(1)).await;

        assert_eq!(h.manager.status(), ConnectionStatus::Live);
        assert!(h.manager.has_channel());
        assert_eq!(h.events.lock().len(), 1);
        assert_eq!(
            *h.statuses.lock(),
            vec![ConnectionStatus::Connecting, ConnectionStatus::Live]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn failures_back_off_exponentially() {
        let mut h = harness(3);
        h.manager.start();

        let (first, _) = h.opened.recv().await.unwrap();
        let (second, _) = h.opened.recv().await.unwrap();
        let (third, _) = h.opened.recv().await.unwrap();
        let (fourth, channel) = h.opened.recv().await.unwrap();

        assert_eq!(second - first, Duration::from_millis(500));
        assert_eq!(third - second, Duration::from_millis(1_000));
        assert_eq!(fourth - third, Duration::from_millis(2_000));
        assert_eq!(h.manager.retry_attempt(), 3);

        channel.send(FeedMessage::Subscribed).await.unwrap();
        time::sleep(Duration::from_millis(1)).await;
        assert_eq!(h.manager.status(), ConnectionStatus::Live);
        assert_eq!(h.manager.retry_attempt(), 0);
        assert_eq!(h.feed.calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn channel_error_releases_and_retries() {
        let mut h = harness(0);
        h.manager.start();
        let (_, channel) = h.opened.recv().await.unwrap();
        channel.send(FeedMessage::Subscribed).await.unwrap();
        channel
            .send(FeedMessage::ChannelError("boom".into()))
            .await
            .unwrap();
        time::sleep(Duration::from_millis(1)).await;

        assert_eq!(h.manager.status(), ConnectionStatus::Degraded);
        assert!(!h.manager.has_channel());
        assert_eq!(h.feed.released.load(Ordering::SeqCst), 1);

        let (_, retried) = h.opened.recv().await.unwrap();
        retried.send(FeedMessage::Subscribed).await.unwrap();
        time::sleep(Duration::from_millis(1)).await;
        assert_eq!(
            *h.statuses.lock(),
            vec![
                ConnectionStatus::Connecting,
                ConnectionStatus::Live,
                ConnectionStatus::Degraded,
                ConnectionStatus::Connecting,
                ConnectionStatus::Live,
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn stop_cancels_pending_retry() {
        let mut h = harness(1);
        h.manager.start();
        h.opened.recv().await.unwrap();
        time::sleep(Duration::from_millis(1)).await;
        assert_eq!(h.manager.status(), ConnectionStatus::Degraded);

        h.manager.stop();
        assert_eq!(h.manager.status(), ConnectionStatus::Offline);
        time::sleep(Duration::from_secs(120)).await;
        assert!(h.opened.try_recv().is_err());
        assert_eq!(h.feed.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn stale_channel_messages_are_ignored_after_restart() {
        let mut h = harness(0);
        h.manager.start();
        let (_, old) = h.opened.recv().await.unwrap();
        old.send(FeedMessage::Subscribed).await.unwrap();
        time::sleep(Duration::from_millis(1)).await;

        h.manager.start();
        let (_, fresh) = h.opened.recv().await.unwrap();
        assert_eq!(h.feed.released.load(Ordering::SeqCst), 1);
        assert!(old
            .send(FeedMessage::ChannelError("late".into()))
            .await
            .is_err());

        fresh.send(FeedMessage::Subscribed).await.unwrap();
        time::sleep(Duration::from_millis(1)).await;
        assert_eq!(h.manager.status(), ConnectionStatus::Live);
        assert_eq!(h.manager.retry_attempt(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn hidden_gate_drops_events() {
        let mut h = harness(0);
        h.manager.start();
        let (_, channel) = h.opened.recv().await.unwrap();
        channel.send(FeedMessage::Subscribed).await.unwrap();
        h.gate.set(crate::visibility::Visibility::Hidden);
        channel
            .send(FeedMessage::Change(ChangeEvent::insert(serde_json::json!({"id": "a"}))))
            .await
            .unwrap();
        time::sleep(Duration::from_millis(1)).await;
        assert!(h.events.lock().is_empty());
        assert_eq!(h.manager.status(), ConnectionStatus::Live);
    }
}
