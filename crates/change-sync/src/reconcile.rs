//! Applies change batches to a keyed row collection and recomputes the
//! derived summary once per batch.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::{debug, warn};

use crate::error::TransformError;
use crate::event::{ChangeEvent, ChangeKind};

pub trait KeyedRow {
    fn primary_key(&self) -> &str;

    fn secondary_key(&self) -> Option<&str> {
        None
    }
}

/// Which raw-record fields identify a row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeySpec {
    pub primary_field: String,
    pub secondary_field: Option<String>,
}

impl KeySpec {
    pub fn new(primary_field: impl Into<String>) -> Self {
        Self {
            primary_field: primary_field.into(),
            secondary_field: None,
        }
    }

    pub fn with_secondary(mut self, field: impl Into<String>) -> Self {
        self.secondary_field = Some(field.into());
        self
    }

    pub fn locate(&self, record: &Value) -> Option<RowLookup> {
        if let Some(id) = field_as_key(record, &self.primary_field) {
            return Some(RowLookup::Primary(id));
        }
        self.secondary_field
            .as_deref()
            .and_then(|field| field_as_key(record, field))
            .map(RowLookup::Secondary)
    }
}

fn field_as_key(record: &Value, field: &str) -> Option<String> {
    match record.get(field)? {
        Value::String(value) if !value.is_empty() => Some(value.clone()),
        Value::Number(value) => Some(value.to_string()),
        _ => None,
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RowLookup {
    Primary(String),
    Secondary(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Upsert {
    Inserted,
    Replaced,
}

/// Ordered rows with unique primary keys and an optional secondary index.
/// Several rows may share a secondary key; lookups resolve to the earliest
/// registered row still present.
#[derive(Debug, Clone)]
pub struct RowCollection<R> {
    rows: Vec<R>,
    primary: HashMap<String, usize>,
    secondary: HashMap<String, Vec<String>>,
}

impl<R> Default for RowCollection<R> {
    fn default() -> Self {
        Self {
            rows: Vec::new(),
            primary: HashMap::new(),
            secondary: HashMap::new(),
        }
    }
}

impl<R: KeyedRow> RowCollection<R> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a collection; a later duplicate replaces the earlier row in place.
    pub fn from_rows(rows: impl IntoIterator<Item = R>) -> Self {
        let mut collection = Self::new();
        for row in rows {
            collection.upsert(row);
        }
        collection
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, R> {
        self.rows.iter()
    }

    pub fn as_slice(&self) -> &[R] {
        &self.rows
    }

    pub fn get(&self, id: &str) -> Option<&R> {
        self.primary.get(id).map(|&index| &self.rows[index])
    }

    pub fn contains(&self, id: &str) -> bool {
        self.primary.contains_key(id)
    }

    /// A primary lookup also matches a row whose secondary key equals it.
    pub fn position(&self, lookup: &RowLookup) -> Option<usize> {
        match lookup {
            RowLookup::Primary(id) => self
                .primary
                .get(id)
                .copied()
                .or_else(|| self.by_secondary(id)),
            RowLookup::Secondary(key) => self.by_secondary(key),
        }
    }

    fn by_secondary(&self, key: &str) -> Option<usize> {
        self.secondary
            .get(key)?
            .iter()
            .find_map(|id| self.primary.get(id))
            .copied()
    }

    pub fn upsert(&mut self, row: R) -> Upsert {
        match self.primary.get(row.primary_key()).copied() {
            Some(index) => {
                self.replace_at(index, row);
                Upsert::Replaced
            }
            None => {
                self.rows.push(row);
                self.remember(self.rows.len() - 1);
                Upsert::Inserted
            }
        }
    }

    /// Replaces the row at `index`. If the new row's primary key already
    /// belongs to another position, that other row is dropped so keys stay
    /// unique. Returns the final index of the replaced row.
    pub fn replace_at(&mut self, mut index: usize, row: R) -> usize {
        if let Some(other) = self.primary.get(row.primary_key()).copied() {
            if other != index {
                self.remove_at(other);
                if other < index {
                    index -= 1;
                }
            }
        }
        let old = std::mem::replace(&mut self.rows[index], row);
        self.forget(&old);
        self.remember(index);
        index
    }

    pub fn remove_at(&mut self, index: usize) -> R {
        let row = self.rows.remove(index);
        self.forget(&row);
        for position in self.primary.values_mut() {
            if *position > index {
                *position -= 1;
            }
        }
        row
    }

    fn remember(&mut self, index: usize) {
        let row = &self.rows[index];
        let id = row.primary_key().to_string();
        if let Some(secondary) = row.secondary_key() {
            let ids = self.secondary.entry(secondary.to_string()).or_default();
            if !ids.contains(&id) {
                ids.push(id.clone());
            }
        }
        self.primary.insert(id, index);
    }

    fn forget(&mut self, row: &R) {
        let id = row.primary_key();
        self.primary.remove(id);
        if let Some(secondary) = row.secondary_key() {
            if let Some(ids) = self.secondary.get_mut(secondary) {
                ids.retain(|other| other != id);
                if ids.is_empty() {
                    self.secondary.remove(secondary);
                }
            }
        }
    }
}

impl<'a, R> IntoIterator for &'a RowCollection<R> {
    type Item = &'a R;
    type IntoIter = std::slice::Iter<'a, R>;

    fn into_iter(self) -> Self::IntoIter {
        self.rows.iter()
    }
}

/// Domain plug-in: how raw records become rows and rows become a summary.
pub trait ViewModel: Send + Sync + 'static {
    type Row: KeyedRow + Clone + Send + Sync + 'static;
    type Summary: Clone + Send + Sync + 'static;

    fn key_spec(&self) -> &KeySpec;

    fn transform(&self, record: &Value) -> Result<Self::Row, TransformError>;

    fn summarize(&self, rows: &RowCollection<Self::Row>) -> Self::Summary;
}

#[derive(Debug, Clone)]
pub struct DerivedView<R, S> {
    pub rows: RowCollection<R>,
    pub summary: S,
    pub refreshed_at: Option<DateTime<Utc>>,
}

pub type ModelView<M> = DerivedView<<M as ViewModel>::Row, <M as ViewModel>::Summary>;

impl<R: KeyedRow, S> DerivedView<R, S> {
    /// Empty rows with the summary the model computes for them.
    pub fn empty<M>(model: &M) -> Self
    where
        M: ViewModel<Row = R, Summary = S>,
    {
        let rows = RowCollection::new();
        let summary = model.summarize(&rows);
        Self {
            rows,
            summary,
            refreshed_at: None,
        }
    }
}

/// Outcome of applying one batch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ApplyReport {
    pub inserted: usize,
    pub updated: usize,
    /// Updates for rows not yet present, appended instead.
    pub upserted: usize,
    pub deleted: usize,
    pub missing_deletes: usize,
    pub skipped: usize,
    pub earliest_commit: Option<DateTime<Utc>>,
}

impl ApplyReport {
    pub fn applied(&self) -> usize {
        self.inserted + self.updated + self.upserted + self.deleted
    }

    fn note_commit(&mut self, event: &ChangeEvent) {
        if let Some(at) = event.commit_time() {
            self.earliest_commit = Some(match self.earliest_commit {
                Some(current) => current.min(at),
                None => at,
            });
        }
    }
}

/// Applies `batch` in order, then recomputes the summary exactly once.
pub fn apply_batch<M: ViewModel>(
    model: &M,
    view: &mut ModelView<M>,
    batch: &[ChangeEvent],
) -> ApplyReport {
    let mut report = ApplyReport::default();
    for event in batch {
        report.note_commit(event);
        let outcome = match event.kind {
            ChangeKind::Insert => apply_insert(model, &mut view.rows, event, &mut report),
            ChangeKind::Update => apply_update(model, &mut view.rows, event, &mut report),
            ChangeKind::Delete => apply_delete(model, &mut view.rows, event, &mut report),
        };
        if let Err(err) = outcome {
            report.skipped += 1;
            warn!(
                target = "sync.reconcile",
                kind = %event.kind,
                error = %err,
                "skipping change event"
            );
        }
    }
    view.summary = model.summarize(&view.rows);
    view.refreshed_at = Some(Utc::now());
    report
}

fn apply_insert<M: ViewModel>(
    model: &M,
    rows: &mut RowCollection<M::Row>,
    event: &ChangeEvent,
    report: &mut ApplyReport,
) -> Result<(), TransformError> {
    let record = event
        .new_record
        .as_ref()
        .ok_or_else(|| TransformError::Malformed("insert without new record".into()))?;
    let row = model.transform(record)?;
    match rows.upsert(row) {
        Upsert::Inserted => report.inserted += 1,
        Upsert::Replaced => report.updated += 1,
    }
    Ok(())
}

fn apply_update<M: ViewModel>(
    model: &M,
    rows: &mut RowCollection<M::Row>,
    event: &ChangeEvent,
    report: &mut ApplyReport,
) -> Result<(), TransformError> {
    let record = event
        .new_record
        .as_ref()
        .ok_or_else(|| TransformError::Malformed("update without new record".into()))?;
    let row = model.transform(record)?;
    let position = model
        .key_spec()
        .locate(record)
        .and_then(|lookup| rows.position(&lookup))
        .or_else(|| rows.position(&RowLookup::Primary(row.primary_key().to_string())));
    match position {
        Some(index) => {
            rows.replace_at(index, row);
            report.updated += 1;
        }
        None => {
            debug!(
                target = "sync.reconcile",
                id = row.primary_key(),
                "update for unknown row; appending"
            );
            rows.upsert(row);
            report.upserted += 1;
        }
    }
    Ok(())
}

fn apply_delete<M: ViewModel>(
    model: &M,
    rows: &mut RowCollection<M::Row>,
    event: &ChangeEvent,
    report: &mut ApplyReport,
) -> Result<(), TransformError> {
    let record = event
        .delete_record()
        .ok_or_else(|| TransformError::Malformed("delete without old record".into()))?;
    let key_spec = model.key_spec();
    let lookup = key_spec
        .locate(record)
        .ok_or_else(|| TransformError::MissingField(key_spec.primary_field.clone()))?;
    match rows.position(&lookup) {
        Some(index) => {
            rows.remove_at(index);
            report.deleted += 1;
        }
        None => {
            debug!(target = "sync.reconcile", lookup = ?lookup, "delete for unknown row");
            report.missing_deletes += 1;
        }
    }
    Ok(())
}

/// Wholesale replacement from an authoritative snapshot.
pub fn replace_with_snapshot<M: ViewModel>(
    model: &M,
    view: &mut ModelView<M>,
    rows: Vec<M::Row>,
    refreshed_at: Option<DateTime<Utc>>,
) {
    view.rows = RowCollection::from_rows(rows);
    view.summary = model.summarize(&view.rows);
    view.refreshed_at = Some(refreshed_at.unwrap_or_else(Utc::now));
}
