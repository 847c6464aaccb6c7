use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::BindingParseError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChangeKind {
    #[serde(rename = "insert", alias = "INSERT")]
    Insert,
    #[serde(rename = "update", alias = "UPDATE")]
    Update,
    #[serde(rename = "delete", alias = "DELETE")]
    Delete,
}

impl ChangeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeKind::Insert => "insert",
            ChangeKind::Update => "update",
            ChangeKind::Delete => "delete",
        }
    }
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single row-level change as delivered by the feed.
///
/// Serializes as `{eventKind, newRecord, oldRecord, commitTimestamp}`.
/// Also accepts the `type`/`record`/`old_record` naming used by Postgres
/// change streams and the `eventType`/`new`/`old` naming of client payloads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    #[serde(rename = "eventKind", alias = "eventType", alias = "type", alias = "kind")]
    pub kind: ChangeKind,
    #[serde(
        rename = "newRecord",
        alias = "record",
        alias = "new",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub new_record: Option<Value>,
    #[serde(
        rename = "oldRecord",
        alias = "old_record",
        alias = "old",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub old_record: Option<Value>,
    #[serde(
        rename = "commitTimestamp",
        alias = "commit_timestamp",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub commit_timestamp: Option<String>,
}

impl ChangeEvent {
    pub fn insert(record: Value) -> Self {
        Self {
            kind: ChangeKind::Insert,
            new_record: Some(record),
            old_record: None,
            commit_timestamp: None,
        }
    }

    pub fn update(record: Value) -> Self {
        Self {
            kind: ChangeKind::Update,
            new_record: Some(record),
            old_record: None,
            commit_timestamp: None,
        }
    }

    pub fn delete(old: Value) -> Self {
        Self {
            kind: ChangeKind::Delete,
            new_record: None,
            old_record: Some(old),
            commit_timestamp: None,
        }
    }

    pub fn with_commit_timestamp(mut self, timestamp: impl Into<String>) -> Self {
        self.commit_timestamp = Some(timestamp.into());
        self
    }

    /// Parsed commit time, when the feed supplied a well-formed one.
    pub fn commit_time(&self) -> Option<DateTime<Utc>> {
        let raw = self.commit_timestamp.as_deref()?;
        DateTime::parse_from_rfc3339(raw)
            .ok()
            .map(|ts| ts.with_timezone(&Utc))
    }

    /// Record that identifies the row for a delete. Falls back to the new
    /// image when the feed omits the old one.
    pub fn delete_record(&self) -> Option<&Value> {
        non_empty(self.old_record.as_ref()).or_else(|| non_empty(self.new_record.as_ref()))
    }
}

fn non_empty(record: Option<&Value>) -> Option<&Value> {
    record.filter(|value| match value {
        Value::Object(map) => !map.is_empty(),
        Value::Null => false,
        _ => true,
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum EventFilter {
    #[default]
    All,
    Insert,
    Update,
    Delete,
}

impl EventFilter {
    pub fn matches(&self, kind: ChangeKind) -> bool {
        match self {
            EventFilter::All => true,
            EventFilter::Insert => kind == ChangeKind::Insert,
            EventFilter::Update => kind == ChangeKind::Update,
            EventFilter::Delete => kind == ChangeKind::Delete,
        }
    }

    /// Wire spelling used in Postgres change subscriptions.
    pub fn as_wire(&self) -> &'static str {
        match self {
            EventFilter::All => "*",
            EventFilter::Insert => "INSERT",
            EventFilter::Update => "UPDATE",
            EventFilter::Delete => "DELETE",
        }
    }
}

impl FromStr for EventFilter {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "*" | "all" => Ok(EventFilter::All),
            "insert" => Ok(EventFilter::Insert),
            "update" => Ok(EventFilter::Update),
            "delete" => Ok(EventFilter::Delete),
            other => Err(format!("unknown event `{other}`")),
        }
    }
}

/// A (namespace, table, event, row filter) selector for the change feed.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Binding {
    pub namespace: String,
    pub table: String,
    pub event: EventFilter,
    pub filter: Option<String>,
}

impl Binding {
    pub fn new(namespace: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            table: table.into(),
            event: EventFilter::All,
            filter: None,
        }
    }

    pub fn with_event(mut self, event: EventFilter) -> Self {
        self.event = event;
        self
    }

    pub fn with_filter(mut self, filter: impl Into<String>) -> Self {
        self.filter = Some(filter.into());
        self
    }
}

impl fmt::Display for Binding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}:{}", self.namespace, self.table, self.event.as_wire())?;
        if let Some(filter) = &self.filter {
            write!(f, ":{filter}")?;
        }
        Ok(())
    }
}

/// Parses `namespace.table[:event[:filter]]`. The filter may itself contain
/// colons.
impl FromStr for Binding {
    type Err = BindingParseError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let fail = |reason: &str| BindingParseError {
            input: input.to_string(),
            reason: reason.to_string(),
        };
        let mut parts = input.splitn(3, ':');
        let target = parts.next().unwrap_or_default();
        let (namespace, table) = target
            .split_once('.')
            .ok_or_else(|| fail("expected `namespace.table`"))?;
        if namespace.is_empty() || table.is_empty() {
            return Err(fail("namespace and table must be non-empty"));
        }
        let event = match parts.next() {
            Some(raw) if !raw.is_empty() => raw.parse().map_err(|err: String| fail(&err))?,
            _ => EventFilter::All,
        };
        let filter = parts
            .next()
            .filter(|raw| !raw.is_empty())
            .map(str::to_string);
        Ok(Binding {
            namespace: namespace.to_string(),
            table: table.to_string(),
            event,
            filter,
        })
    }
}

/// Everything needed to open one logical channel. Fixed for the lifetime of
/// a subscription manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelSpec {
    pub name: String,
    pub bindings: Vec<Binding>,
}

impl ChannelSpec {
    pub fn new(name: impl Into<String>, bindings: Vec<Binding>) -> Self {
        Self {
            name: name.into(),
            bindings,
        }
    }

    pub fn accepts(&self, kind: ChangeKind) -> bool {
        self.bindings.is_empty() || self.bindings.iter().any(|b| b.event.matches(kind))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    Connecting,
    Live,
    Degraded,
    Offline,
}

impl ConnectionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionStatus::Connecting => "connecting",
            ConnectionStatus::Live => "live",
            ConnectionStatus::Degraded => "degraded",
            ConnectionStatus::Offline => "offline",
        }
    }

    pub fn is_live(&self) -> bool {
        matches!(self, ConnectionStatus::Live)
    }
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn decodes_both_field_spellings() {
        let app: ChangeEvent = serde_json::from_value(json!({
            "eventKind": "update",
            "new": {"id": "a"},
            "old": {"id": "a"},
        }))
        .unwrap();
        assert_eq!(app.kind, ChangeKind::Update);
        assert_eq!(app.new_record, Some(json!({"id": "a"})));

        let wire: ChangeEvent = serde_json::from_value(json!({
            "type": "DELETE",
            "record": null,
            "old_record": {"id": "b"},
            "commit_timestamp": "2025-01-02T03:04:05Z",
        }))
        .unwrap();
        assert_eq!(wire.kind, ChangeKind::Delete);
        assert_eq!(wire.new_record, None);
        assert_eq!(wire.delete_record(), Some(&json!({"id": "b"})));
        assert!(wire.commit_time().is_some());
    }

    #[test]
    fn serializes_camel_case_wire_shape() {
        let event = ChangeEvent::update(json!({"id": "a"}))
            .with_commit_timestamp("2025-01-02T03:04:05Z");
        assert_eq!(
            serde_json::to_value(&event).unwrap(),
            json!({
                "eventKind": "update",
                "newRecord": {"id": "a"},
                "commitTimestamp": "2025-01-02T03:04:05Z",
            })
        );

        let delete = ChangeEvent::delete(json!({"id": "b"}));
        let value = serde_json::to_value(&delete).unwrap();
        assert_eq!(value, json!({"eventKind": "delete", "oldRecord": {"id": "b"}}));
        let back: ChangeEvent = serde_json::from_value(value).unwrap();
        assert_eq!(back, delete);
    }

    #[test]
    fn delete_record_falls_back_to_new_image() {
        let mut event = ChangeEvent::delete(json!({}));
        event.new_record = Some(json!({"id": "c"}));
        assert_eq!(event.delete_record(), Some(&json!({"id": "c"})));
    }

    #[test]
    fn bad_commit_timestamp_is_ignored() {
        let event = ChangeEvent::insert(json!({"id": "a"})).with_commit_timestamp("yesterday");
        assert_eq!(event.commit_time(), None);
    }

    #[test]
    fn parses_bindings() {
        let plain: Binding = "public.shipments".parse().unwrap();
        assert_eq!(plain, Binding::new("public", "shipments"));

        let full: Binding = "public.shipments:update:status=eq.open".parse().unwrap();
        assert_eq!(full.event, EventFilter::Update);
        assert_eq!(full.filter.as_deref(), Some("status=eq.open"));
        assert_eq!(full.to_string(), "public.shipments:UPDATE:status=eq.open");

        let odd: Binding = "public.events:*:a=eq.1:2".parse().unwrap();
        assert_eq!(odd.filter.as_deref(), Some("a=eq.1:2"));

        assert!("shipments".parse::<Binding>().is_err());
        assert!("public.shipments:upsert".parse::<Binding>().is_err());
    }

    #[test]
    fn channel_accepts_bound_kinds() {
        let spec = ChannelSpec::new(
            "kpi",
            vec![Binding::new("public", "shipments").with_event(EventFilter::Insert)],
        );
        assert!(spec.accepts(ChangeKind::Insert));
        assert!(!spec.accepts(ChangeKind::Delete));
        assert!(ChannelSpec::new("any", Vec::new()).accepts(ChangeKind::Delete));
    }
}
