use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::SnapshotError;

/// Authoritative full state of the view's rows.
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot<R> {
    pub rows: Vec<R>,
    pub refreshed_at: Option<DateTime<Utc>>,
}

impl<R> Snapshot<R> {
    pub fn new(rows: Vec<R>) -> Self {
        Self {
            rows,
            refreshed_at: None,
        }
    }

    pub fn empty() -> Self {
        Self::new(Vec::new())
    }
}

#[async_trait]
pub trait SnapshotSource<R>: Send + Sync + 'static {
    async fn fetch(&self) -> Result<Snapshot<R>, SnapshotError>;
}
