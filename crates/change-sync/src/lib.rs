//! Real-time change synchronization: keeps a derived in-memory view in step
//! with a remote table by applying debounced change batches from a push
//! channel, polling snapshots whenever that channel is not live.

pub mod backoff;
pub mod batch;
pub mod config;
pub mod engine;
pub mod error;
pub mod event;
pub mod metrics;
pub mod poller;
pub mod reconcile;
pub mod snapshot;
pub mod subscription;
pub mod timer;
pub mod visibility;

pub use backoff::Backoff;
pub use batch::{BatchCollector, BatchSink};
pub use config::SyncConfig;
pub use engine::SyncEngine;
pub use error::{BindingParseError, EngineError, FeedError, SnapshotError, TransformError};
pub use event::{Binding, ChangeEvent, ChangeKind, ChannelSpec, ConnectionStatus, EventFilter};
pub use poller::{FallbackPoller, PollTask};
pub use reconcile::{
    apply_batch, replace_with_snapshot, ApplyReport, DerivedView, KeySpec, KeyedRow, ModelView,
    RowCollection, RowLookup, ViewModel,
};
pub use snapshot::{Snapshot, SnapshotSource};
pub use subscription::{
    ChangeFeed, EventSink, FeedGuard, FeedMessage, FeedSubscription, StatusListener,
    SubscriptionManager,
};
pub use timer::{TimerHandle, TimerSlot};
pub use visibility::{Visibility, VisibilityChange, VisibilityGate};
