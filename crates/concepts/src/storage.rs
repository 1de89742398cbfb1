use crate::{
    ChangeId, ChangeRecord, Document, DocumentPath, EventId, HandlerName, StrVariant,
    time::TimeWindow,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, sync::Arc};
use tokio::sync::mpsc;

/// Ledger entries older than this are eligible for the retention sweep.
pub const DEFAULT_LEDGER_RETENTION: std::time::Duration =
    std::time::Duration::from_secs(7 * 24 * 60 * 60);

#[derive(thiserror::Error, Clone, Debug, PartialEq, Eq)]
pub enum DbErrorGeneric {
    #[error("database error: {0}")]
    Uncategorized(StrVariant),
    #[error("database is closing")]
    Close,
}

#[derive(thiserror::Error, Clone, Debug, PartialEq, Eq)]
pub enum DbErrorRead {
    #[error("not found")]
    NotFound,
    #[error(transparent)]
    Generic(#[from] DbErrorGeneric),
}

#[derive(thiserror::Error, Clone, Debug, PartialEq, Eq)]
pub enum DbErrorWrite {
    #[error("not found")]
    NotFound,
    #[error("already exists")]
    AlreadyExists,
    #[error("validation failed: {0}")]
    ValidationFailed(StrVariant),
    #[error(transparent)]
    Generic(#[from] DbErrorGeneric),
}

/// Result of claiming an event in the ledger.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[must_use]
pub enum LedgerClaim {
    /// The event was not seen before, the caller owns it now.
    Claimed,
    AlreadyClaimed,
}

impl LedgerClaim {
    #[must_use]
    pub fn is_new(self) -> bool {
        self == LedgerClaim::Claimed
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub event_id: EventId,
    pub handler_name: HandlerName,
    pub recorded_at: DateTime<Utc>,
}

/// Deduplicates deliveries. Entries are never mutated, only purged once expired.
#[async_trait]
pub trait EventLedger: Send + Sync {
    /// Atomic create-if-absent keyed by `event_id`.
    /// Concurrent callers racing on the same id observe exactly one [`LedgerClaim::Claimed`].
    async fn record_if_new(
        &self,
        event_id: &EventId,
        handler_name: &HandlerName,
        recorded_at: DateTime<Utc>,
    ) -> Result<LedgerClaim, DbErrorWrite>;

    /// Number of entries per handler recorded inside the window.
    /// Handlers without entries are omitted.
    async fn count_by_handler(
        &self,
        window: TimeWindow,
    ) -> Result<Vec<(HandlerName, u64)>, DbErrorGeneric>;

    /// Delete at most `batch_size` entries recorded before `cutoff`, returning how many were deleted.
    async fn purge_older_than(
        &self,
        cutoff: DateTime<Utc>,
        batch_size: u32,
    ) -> Result<u64, DbErrorGeneric>;

    async fn get_entry(&self, event_id: &EventId) -> Result<LedgerEntry, DbErrorRead>;
}

/// Merge payload applied to a stored document.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct DocumentUpdate {
    /// Top-level fields replacing the stored values.
    #[serde(default)]
    pub set: Document,
    /// Integer deltas. Missing or non-integer fields start from zero.
    #[serde(default)]
    pub increments: BTreeMap<String, i64>,
}

impl DocumentUpdate {
    #[must_use]
    pub fn set(mut self, field: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.set.insert(field.into(), value.into());
        self
    }

    #[must_use]
    pub fn increment(mut self, field: impl Into<String>, delta: i64) -> Self {
        *self.increments.entry(field.into()).or_default() += delta;
        self
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.set.is_empty() && self.increments.is_empty()
    }

    /// Apply the update in place. Stores call this while holding their write lock,
    /// so increments are atomic.
    pub fn apply_to(&self, document: &mut Document) {
        for (field, value) in &self.set {
            document.insert(field.clone(), value.clone());
        }
        for (field, delta) in &self.increments {
            let current = document
                .get(field)
                .and_then(serde_json::Value::as_i64)
                .unwrap_or_default();
            document.insert(field.clone(), current.saturating_add(*delta).into());
        }
    }
}

/// Document storage with a change feed.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn get(&self, path: &DocumentPath) -> Result<Document, DbErrorRead>;

    /// Create-if-absent. Fails with [`DbErrorWrite::AlreadyExists`].
    async fn create(
        &self,
        path: &DocumentPath,
        document: Document,
        created_at: DateTime<Utc>,
    ) -> Result<ChangeId, DbErrorWrite>;

    /// Merge the update into the document, creating it when missing.
    async fn update(
        &self,
        path: &DocumentPath,
        update: DocumentUpdate,
        updated_at: DateTime<Utc>,
    ) -> Result<ChangeId, DbErrorWrite>;

    /// Fails with [`DbErrorWrite::NotFound`] when there is nothing to delete.
    async fn delete(
        &self,
        path: &DocumentPath,
        deleted_at: DateTime<Utc>,
    ) -> Result<ChangeId, DbErrorWrite>;

    /// Every change committed after this call is sent to the returned receiver,
    /// in commit order.
    fn subscribe(&self) -> mpsc::UnboundedReceiver<ChangeRecord>;
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureRecord {
    pub handler_name: HandlerName,
    pub event_id: EventId,
    pub document_path: DocumentPath,
    pub error: String,
    pub occurred_at: DateTime<Utc>,
}

/// Durable destination for swallowed handler failures.
#[async_trait]
pub trait ErrorSink: Send + Sync {
    async fn append_failure(&self, failure: FailureRecord) -> Result<(), DbErrorWrite>;

    async fn list_failures(
        &self,
        handler_name: Option<&HandlerName>,
        window: TimeWindow,
    ) -> Result<Vec<FailureRecord>, DbErrorGeneric>;
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvocationCountSample {
    pub handler_name: HandlerName,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    pub count: u64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlertRecord {
    pub created_at: DateTime<Utc>,
    pub handler_name: HandlerName,
    pub count: u64,
    pub threshold: u64,
}

/// Persistence of the invocation monitor's samples and alerts.
#[async_trait]
pub trait MonitorStore: Send + Sync {
    async fn append_samples(&self, samples: Vec<InvocationCountSample>)
    -> Result<(), DbErrorWrite>;

    async fn list_samples(
        &self,
        handler_name: Option<&HandlerName>,
        window: TimeWindow,
    ) -> Result<Vec<InvocationCountSample>, DbErrorGeneric>;

    async fn append_alerts(&self, alerts: Vec<AlertRecord>) -> Result<(), DbErrorWrite>;

    /// Alerts created inside the window, oldest first.
    async fn list_alerts(&self, window: TimeWindow) -> Result<Vec<AlertRecord>, DbErrorGeneric>;
}

pub trait DbPool: Send + Sync {
    fn event_ledger(&self) -> Arc<dyn EventLedger>;

    fn document_store(&self) -> Arc<dyn DocumentStore>;

    fn error_sink(&self) -> Arc<dyn ErrorSink>;

    fn monitor_store(&self) -> Arc<dyn MonitorStore>;
}

#[async_trait]
pub trait DbPoolCloseable: Send + Sync {
    async fn close(&self);
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn update_merges_and_increments() {
        let mut document = Document::new();
        document.insert("a".to_string(), json!(1));
        document.insert("count".to_string(), json!(5));
        document.insert("text".to_string(), json!("x"));
        DocumentUpdate::default()
            .set("a", 2)
            .set("b", "new")
            .increment("count", 1)
            .increment("missing", -1)
            .increment("text", 3)
            .apply_to(&mut document);
        assert_eq!(
            json!({"a": 2, "b": "new", "count": 6, "missing": -1, "text": 3}),
            serde_json::Value::Object(document)
        );
    }

    #[test]
    fn increment_accumulates_on_same_field() {
        let update = DocumentUpdate::default()
            .increment("memberCount", 1)
            .increment("memberCount", 1);
        assert_eq!(Some(&2), update.increments.get("memberCount"));
    }
}
