//! In-memory implementation of every store used by the guard layer.
//! Intended for tests and local experiments, nothing is persisted.
//!
//! All state lives in a single [`DbHolder`] behind a mutex, so each operation,
//! including the ledger's create-if-absent and the counter increments, is atomic.
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use concepts::storage::{
    AlertRecord, DbErrorGeneric, DbErrorRead, DbErrorWrite, DbPool, DbPoolCloseable,
    DocumentStore, DocumentUpdate, ErrorSink, EventLedger, FailureRecord, InvocationCountSample,
    LedgerClaim, LedgerEntry, MonitorStore,
};
use concepts::time::TimeWindow;
use concepts::{ChangeId, ChangeRecord, Document, DocumentPath, EventId, HandlerName};
use hashbrown::HashMap;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::mpsc;
use tracing::{debug, instrument};

// std mutex because none of the functions block.
#[derive(Clone)]
pub struct InMemoryDbConnection(Arc<std::sync::Mutex<DbHolder>>, Arc<AtomicBool>);

impl InMemoryDbConnection {
    fn holder(&self) -> Result<std::sync::MutexGuard<'_, DbHolder>, DbErrorGeneric> {
        if self.1.load(Ordering::Acquire) {
            return Err(DbErrorGeneric::Close);
        }
        Ok(self.0.lock().unwrap())
    }
}

#[async_trait]
impl EventLedger for InMemoryDbConnection {
    #[instrument(skip_all, fields(%event_id, %handler_name))]
    async fn record_if_new(
        &self,
        event_id: &EventId,
        handler_name: &HandlerName,
        recorded_at: DateTime<Utc>,
    ) -> Result<LedgerClaim, DbErrorWrite> {
        Ok(self
            .holder()?
            .record_if_new(event_id, handler_name, recorded_at))
    }

    async fn count_by_handler(
        &self,
        window: TimeWindow,
    ) -> Result<Vec<(HandlerName, u64)>, DbErrorGeneric> {
        Ok(self.holder()?.count_by_handler(window))
    }

    #[instrument(skip_all, fields(%cutoff, batch_size))]
    async fn purge_older_than(
        &self,
        cutoff: DateTime<Utc>,
        batch_size: u32,
    ) -> Result<u64, DbErrorGeneric> {
        Ok(self.holder()?.purge_older_than(cutoff, batch_size))
    }

    async fn get_entry(&self, event_id: &EventId) -> Result<LedgerEntry, DbErrorRead> {
        self.holder()?
            .ledger
            .get(event_id)
            .cloned()
            .ok_or(DbErrorRead::NotFound)
    }
}

#[async_trait]
impl DocumentStore for InMemoryDbConnection {
    async fn get(&self, path: &DocumentPath) -> Result<Document, DbErrorRead> {
        self.holder()?
            .documents
            .get(path)
            .map(|document| Document::clone(document))
            .ok_or(DbErrorRead::NotFound)
    }

    #[instrument(skip_all, fields(%path))]
    async fn create(
        &self,
        path: &DocumentPath,
        document: Document,
        created_at: DateTime<Utc>,
    ) -> Result<ChangeId, DbErrorWrite> {
        let mut holder = self.holder()?;
        if holder.documents.contains_key(path) {
            return Err(DbErrorWrite::AlreadyExists);
        }
        Ok(holder.commit(path, Some(document), created_at))
    }

    #[instrument(skip_all, fields(%path))]
    async fn update(
        &self,
        path: &DocumentPath,
        update: DocumentUpdate,
        updated_at: DateTime<Utc>,
    ) -> Result<ChangeId, DbErrorWrite> {
        let mut holder = self.holder()?;
        let mut document = holder
            .documents
            .get(path)
            .map(|document| Document::clone(document))
            .unwrap_or_default();
        update.apply_to(&mut document);
        Ok(holder.commit(path, Some(document), updated_at))
    }

    #[instrument(skip_all, fields(%path))]
    async fn delete(
        &self,
        path: &DocumentPath,
        deleted_at: DateTime<Utc>,
    ) -> Result<ChangeId, DbErrorWrite> {
        let mut holder = self.holder()?;
        if !holder.documents.contains_key(path) {
            return Err(DbErrorWrite::NotFound);
        }
        Ok(holder.commit(path, None, deleted_at))
    }

    fn subscribe(&self) -> mpsc::UnboundedReceiver<ChangeRecord> {
        let (sender, receiver) = mpsc::unbounded_channel();
        self.0.lock().unwrap().change_subscribers.push(sender);
        receiver
    }
}

#[async_trait]
impl ErrorSink for InMemoryDbConnection {
    async fn append_failure(&self, failure: FailureRecord) -> Result<(), DbErrorWrite> {
        self.holder()?.failures.push(failure);
        Ok(())
    }

    async fn list_failures(
        &self,
        handler_name: Option<&HandlerName>,
        window: TimeWindow,
    ) -> Result<Vec<FailureRecord>, DbErrorGeneric> {
        Ok(self
            .holder()?
            .failures
            .iter()
            .filter(|failure| window.contains(failure.occurred_at))
            .filter(|failure| handler_name.is_none_or(|name| *name == failure.handler_name))
            .cloned()
            .collect())
    }
}

#[async_trait]
impl MonitorStore for InMemoryDbConnection {
    async fn append_samples(
        &self,
        samples: Vec<InvocationCountSample>,
    ) -> Result<(), DbErrorWrite> {
        self.holder()?.samples.extend(samples);
        Ok(())
    }

    async fn list_samples(
        &self,
        handler_name: Option<&HandlerName>,
        window: TimeWindow,
    ) -> Result<Vec<InvocationCountSample>, DbErrorGeneric> {
        Ok(self
            .holder()?
            .samples
            .iter()
            .filter(|sample| window.contains(sample.window_end))
            .filter(|sample| handler_name.is_none_or(|name| *name == sample.handler_name))
            .cloned()
            .collect())
    }

    async fn append_alerts(&self, alerts: Vec<AlertRecord>) -> Result<(), DbErrorWrite> {
        self.holder()?.alerts.extend(alerts);
        Ok(())
    }

    async fn list_alerts(&self, window: TimeWindow) -> Result<Vec<AlertRecord>, DbErrorGeneric> {
        Ok(self
            .holder()?
            .alerts
            .iter()
            .filter(|alert| window.contains(alert.created_at))
            .cloned()
            .collect())
    }
}

#[derive(Clone)]
pub struct InMemoryPool(InMemoryDbConnection);

impl InMemoryPool {
    #[must_use]
    pub fn new() -> Self {
        Self(InMemoryDbConnection(
            Arc::new(std::sync::Mutex::new(DbHolder::default())),
            Arc::new(AtomicBool::default()),
        ))
    }
}

impl Default for InMemoryPool {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DbPoolCloseable for InMemoryPool {
    async fn close(&self) {
        let res = self
            .0
            .1
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst);
        if res.is_err() {
            debug!("Already closed");
            return;
        }
        // Dropping the senders ends every change feed.
        self.0.0.lock().unwrap().change_subscribers.clear();
    }
}

impl DbPool for InMemoryPool {
    fn event_ledger(&self) -> Arc<dyn EventLedger> {
        Arc::new(self.0.clone())
    }

    fn document_store(&self) -> Arc<dyn DocumentStore> {
        Arc::new(self.0.clone())
    }

    fn error_sink(&self) -> Arc<dyn ErrorSink> {
        Arc::new(self.0.clone())
    }

    fn monitor_store(&self) -> Arc<dyn MonitorStore> {
        Arc::new(self.0.clone())
    }
}

#[derive(Debug, Default)]
struct DbHolder {
    ledger: HashMap<EventId, LedgerEntry>,
    documents: BTreeMap<DocumentPath, Arc<Document>>,
    failures: Vec<FailureRecord>,
    samples: Vec<InvocationCountSample>,
    alerts: Vec<AlertRecord>,
    change_subscribers: Vec<mpsc::UnboundedSender<ChangeRecord>>,
}

impl DbHolder {
    fn record_if_new(
        &mut self,
        event_id: &EventId,
        handler_name: &HandlerName,
        recorded_at: DateTime<Utc>,
    ) -> LedgerClaim {
        match self.ledger.entry(event_id.clone()) {
            hashbrown::hash_map::Entry::Occupied(_) => LedgerClaim::AlreadyClaimed,
            hashbrown::hash_map::Entry::Vacant(vacant) => {
                vacant.insert(LedgerEntry {
                    event_id: event_id.clone(),
                    handler_name: handler_name.clone(),
                    recorded_at,
                });
                LedgerClaim::Claimed
            }
        }
    }

    fn count_by_handler(&self, window: TimeWindow) -> Vec<(HandlerName, u64)> {
        let mut counts: BTreeMap<HandlerName, u64> = BTreeMap::new();
        for entry in self.ledger.values() {
            if window.contains(entry.recorded_at) {
                *counts.entry(entry.handler_name.clone()).or_default() += 1;
            }
        }
        counts.into_iter().collect()
    }

    fn purge_older_than(&mut self, cutoff: DateTime<Utc>, batch_size: u32) -> u64 {
        let expired: Vec<EventId> = self
            .ledger
            .values()
            .filter(|entry| entry.recorded_at < cutoff)
            .take(batch_size as usize)
            .map(|entry| entry.event_id.clone())
            .collect();
        for event_id in &expired {
            self.ledger.remove(event_id);
        }
        expired.len() as u64
    }

    fn commit(
        &mut self,
        path: &DocumentPath,
        after: Option<Document>,
        committed_at: DateTime<Utc>,
    ) -> ChangeId {
        let after = after.map(Arc::new);
        let before = match &after {
            Some(after) => self.documents.insert(path.clone(), after.clone()),
            None => self.documents.remove(path),
        };
        let change = ChangeRecord {
            change_id: ChangeId::generate(),
            document_path: path.clone(),
            before,
            after,
            committed_at,
        };
        let change_id = change.change_id;
        self.change_subscribers
            .retain(|sender| sender.send(change.clone()).is_ok());
        change_id
    }
}
