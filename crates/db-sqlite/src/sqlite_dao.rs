use crate::histograms::Histograms;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use concepts::{
    ChangeId, ChangeRecord, Document, DocumentPath, EventId, HandlerName,
    storage::{
        AlertRecord, DbErrorGeneric, DbErrorRead, DbErrorWrite, DbPool, DbPoolCloseable,
        DocumentStore, DocumentUpdate, ErrorSink, EventLedger, FailureRecord,
        InvocationCountSample, LedgerClaim, LedgerEntry, MonitorStore,
    },
    time::TimeWindow,
};
use conversions::{JsonWrapper, prepare_err_generic, result_err_generic, result_err_read};
use hashbrown::HashMap;
use rusqlite::{Connection, OpenFlags, OptionalExtension, Params, Transaction, named_params};
use std::{
    path::Path,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};
use tokio::{
    sync::{mpsc, oneshot},
    time::Instant,
};
use tracing::{Level, Span, debug, debug_span, error, info, instrument, trace, warn};

#[derive(Debug, thiserror::Error)]
#[error("initialization error")]
pub struct InitializationError;

/*
mmap_size = 128MB - Set the global memory map so all processes can share some data
https://www.sqlite.org/pragma.html#pragma_mmap_size

journal_size_limit = 64 MB - limit on the WAL file to prevent unlimited growth
https://www.sqlite.org/pragma.html#pragma_journal_size_limit
*/
const PRAGMA: [[&str; 2]; 9] = [
    ["journal_mode", "wal"],
    ["synchronous", "FULL"],
    ["busy_timeout", "1000"],
    ["cache_size", "10000"], // number of pages
    ["temp_store", "MEMORY"],
    ["page_size", "8192"], // 8 KB
    ["mmap_size", "134217728"],
    ["journal_size_limit", "67108864"],
    ["integrity_check", ""],
];

// Append only
const CREATE_TABLE_T_METADATA: &str = r"
CREATE TABLE IF NOT EXISTS t_metadata (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    schema_version INTEGER NOT NULL,
    created_at TEXT NOT NULL
) STRICT
";
const T_METADATA_EXPECTED_SCHEMA_VERSION: u32 = 1;

/// Event ledger. A row is inserted once per (change, handler) delivery and only removed by the retention sweep.
const CREATE_TABLE_T_PROCESSED_EVENT: &str = r"
CREATE TABLE IF NOT EXISTS t_processed_event (
    event_id TEXT PRIMARY KEY,
    handler_name TEXT NOT NULL,
    recorded_at TEXT NOT NULL
) STRICT
";
// Used by `count_by_handler` and `purge_older_than`
const IDX_T_PROCESSED_EVENT_RECORDED_AT: &str = r"
CREATE INDEX IF NOT EXISTS idx_t_processed_event_recorded_at ON t_processed_event (recorded_at, handler_name);
";

const CREATE_TABLE_T_DOCUMENT: &str = r"
CREATE TABLE IF NOT EXISTS t_document (
    path TEXT PRIMARY KEY,
    json_value TEXT NOT NULL,
    updated_at TEXT NOT NULL
) STRICT
";

/// Swallowed handler failures. Append only.
const CREATE_TABLE_T_FAILURE: &str = r"
CREATE TABLE IF NOT EXISTS t_failure (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    handler_name TEXT NOT NULL,
    event_id TEXT NOT NULL,
    document_path TEXT NOT NULL,
    error TEXT NOT NULL,
    occurred_at TEXT NOT NULL
) STRICT
";
const IDX_T_FAILURE_OCCURRED_AT: &str = r"
CREATE INDEX IF NOT EXISTS idx_t_failure_occurred_at ON t_failure (occurred_at);
";

const CREATE_TABLE_T_INVOCATION_SAMPLE: &str = r"
CREATE TABLE IF NOT EXISTS t_invocation_sample (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    handler_name TEXT NOT NULL,
    window_start TEXT NOT NULL,
    window_end TEXT NOT NULL,
    count INTEGER NOT NULL
) STRICT
";
const IDX_T_INVOCATION_SAMPLE_WINDOW_END: &str = r"
CREATE INDEX IF NOT EXISTS idx_t_invocation_sample_window_end ON t_invocation_sample (window_end);
";

const CREATE_TABLE_T_ALERT: &str = r"
CREATE TABLE IF NOT EXISTS t_alert (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    created_at TEXT NOT NULL,
    handler_name TEXT NOT NULL,
    count INTEGER NOT NULL,
    threshold INTEGER NOT NULL
) STRICT
";
const IDX_T_ALERT_CREATED_AT: &str = r"
CREATE INDEX IF NOT EXISTS idx_t_alert_created_at ON t_alert (created_at);
";

mod conversions {
    use concepts::storage::{DbErrorGeneric, DbErrorRead};
    use rusqlite::types::{FromSql, FromSqlError};
    use std::fmt::Debug;
    use tracing::error;

    #[expect(clippy::needless_pass_by_value)]
    pub(crate) fn prepare_err_generic(err: rusqlite::Error) -> DbErrorGeneric {
        error!(backtrace = %std::backtrace::Backtrace::capture(), "Sqlite error {err:?}");
        DbErrorGeneric::Uncategorized(err.to_string().into())
    }
    #[expect(clippy::needless_pass_by_value)]
    pub(crate) fn result_err_generic(err: rusqlite::Error) -> DbErrorGeneric {
        error!(backtrace = %std::backtrace::Backtrace::capture(), "Sqlite error {err:?}");
        DbErrorGeneric::Uncategorized(err.to_string().into())
    }
    pub(crate) fn result_err_read(err: rusqlite::Error) -> DbErrorRead {
        if matches!(err, rusqlite::Error::QueryReturnedNoRows) {
            DbErrorRead::NotFound
        } else {
            result_err_generic(err).into()
        }
    }

    pub(crate) struct JsonWrapper<T>(pub(crate) T);
    impl<T: serde::de::DeserializeOwned + 'static + Debug> FromSql for JsonWrapper<T> {
        fn column_result(
            value: rusqlite::types::ValueRef<'_>,
        ) -> rusqlite::types::FromSqlResult<Self> {
            let value = match value {
                rusqlite::types::ValueRef::Text(value) | rusqlite::types::ValueRef::Blob(value) => {
                    Ok(value)
                }
                other => {
                    error!(
                        backtrace = %std::backtrace::Backtrace::capture(),
                        "Unexpected type when conveting to JSON - expected Text or Blob, got type `{other:?}`",
                    );
                    Err(FromSqlError::InvalidType)
                }
            }?;
            let value = serde_json::from_slice::<T>(value).map_err(|err| {
                error!(
                    backtrace = %std::backtrace::Backtrace::capture(),
                    "Cannot convert JSON value `{value:?}` to type:`{type}` - {err:?}",
                    r#type = std::any::type_name::<T>()
                );
                FromSqlError::InvalidType
            })?;
            Ok(Self(value))
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CommandPriority {
    // Write, Shutdown
    High,
    // Read
    Medium,
    // Monitor and retention scans
    Low,
}

#[derive(derive_more::Debug)]
enum ThreadCommand {
    Func {
        #[debug(skip)]
        func: Box<dyn FnOnce(&mut Connection) + Send>,
        priority: CommandPriority,
        sent_at: Instant,
        name: &'static str,
    },
    Shutdown,
    Dummy,
}

type ChangeSubscribers = Arc<Mutex<Vec<mpsc::UnboundedSender<ChangeRecord>>>>;

#[derive(Clone)]
pub struct SqlitePool(SqlitePoolInner);

#[derive(Clone)]
struct SqlitePoolInner {
    shutdown_requested: Arc<AtomicBool>,
    shutdown_finished: Arc<AtomicBool>,
    command_tx: tokio::sync::mpsc::Sender<ThreadCommand>,
    change_subscribers: ChangeSubscribers,
    join_handle: Option<Arc<std::thread::JoinHandle<()>>>, // always Some, Optional for swapping in drop.
}

#[async_trait]
impl DbPoolCloseable for SqlitePool {
    async fn close(&self) {
        self.0.shutdown_requested.store(true, Ordering::Release);
        // Unblock the thread's blocking_recv. If the capacity is reached, the next processed message will trigger shutdown.
        let _ = self.0.command_tx.try_send(ThreadCommand::Shutdown);
        while !self.0.shutdown_finished.load(Ordering::Acquire) {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        self.0.change_subscribers.lock().unwrap().clear();
    }
}

impl DbPool for SqlitePool {
    fn event_ledger(&self) -> Arc<dyn EventLedger> {
        Arc::new(self.clone())
    }

    fn document_store(&self) -> Arc<dyn DocumentStore> {
        Arc::new(self.clone())
    }

    fn error_sink(&self) -> Arc<dyn ErrorSink> {
        Arc::new(self.clone())
    }

    fn monitor_store(&self) -> Arc<dyn MonitorStore> {
        Arc::new(self.clone())
    }
}

impl Drop for SqlitePool {
    fn drop(&mut self) {
        let Some(arc) = self.0.join_handle.take() else {
            return;
        };
        if let Ok(join_handle) = Arc::try_unwrap(arc) {
            // Last holder
            if !join_handle.is_finished() && !self.0.shutdown_finished.load(Ordering::Acquire) {
                // Best effort to shut down the sqlite thread.
                let backtrace = std::backtrace::Backtrace::capture();
                warn!("SqlitePool was not closed properly - {backtrace}");
                self.0.shutdown_requested.store(true, Ordering::Release);
                let _ = self.0.command_tx.try_send(ThreadCommand::Shutdown);
                // Not joining the thread, drop might be called from async context.
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct SqliteConfig {
    pub queue_capacity: usize,
    pub low_prio_threshold: usize,
    pub pragma_override: Option<HashMap<String, String>>,
    pub metrics_threshold: Option<Duration>,
}
impl Default for SqliteConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 100,
            low_prio_threshold: 100,
            pragma_override: None,
            metrics_threshold: None,
        }
    }
}

type OnCommit<T> = Box<dyn FnOnce(&T) + Send>;

impl SqlitePool {
    fn init_thread(
        path: &Path,
        mut pragma_override: HashMap<String, String>,
    ) -> Result<Connection, InitializationError> {
        fn execute<P: Params>(
            conn: &Connection,
            sql: &str,
            params: P,
        ) -> Result<(), InitializationError> {
            conn.execute(sql, params).map(|_| ()).map_err(|err| {
                error!("Cannot run `{sql}` - {err:?}");
                InitializationError
            })
        }
        fn pragma_update(
            conn: &Connection,
            name: &str,
            value: &str,
        ) -> Result<(), InitializationError> {
            if value.is_empty() {
                debug!("Querying PRAGMA {name}");
                conn.pragma_query(None, name, |row| {
                    debug!("{row:?}");
                    Ok(())
                })
                .map_err(|err| {
                    error!("cannot query pragma `{name}` - {err:?}");
                    InitializationError
                })
            } else {
                debug!("Setting PRAGMA {name}={value}");
                conn.pragma_update(None, name, value).map_err(|err| {
                    error!("cannot update pragma `{name}`=`{value}` - {err:?}");
                    InitializationError
                })
            }
        }

        let conn = Connection::open_with_flags(path, OpenFlags::default()).map_err(|err| {
            error!("cannot open the connection - {err:?}");
            InitializationError
        })?;

        for [pragma_name, default_value] in PRAGMA {
            let pragma_value = pragma_override
                .remove(pragma_name)
                .unwrap_or_else(|| default_value.to_string());
            pragma_update(&conn, pragma_name, &pragma_value)?;
        }
        // drain the rest overrides
        for (pragma_name, pragma_value) in pragma_override.drain() {
            pragma_update(&conn, &pragma_name, &pragma_value)?;
        }

        // t_metadata
        execute(&conn, CREATE_TABLE_T_METADATA, [])?;
        // Insert the first row, keep it afterwards.
        execute(
            &conn,
            &format!(
                "INSERT INTO t_metadata (schema_version, created_at)
                SELECT {T_METADATA_EXPECTED_SCHEMA_VERSION}, ? WHERE NOT EXISTS (SELECT 1 FROM t_metadata)"
            ),
            [Utc::now()],
        )?;
        // Fail on unexpected `schema_version`.
        let actual_version = conn
            .prepare("SELECT schema_version FROM t_metadata ORDER BY id DESC LIMIT 1")
            .map_err(|err| {
                error!("cannot select schema version - {err:?}");
                InitializationError
            })?
            .query_row([], |row| row.get::<_, u32>("schema_version"))
            .map_err(|err| {
                error!("Cannot read the schema version - {err:?}");
                InitializationError
            })?;
        if actual_version != T_METADATA_EXPECTED_SCHEMA_VERSION {
            error!(
                "wrong schema version, expected {T_METADATA_EXPECTED_SCHEMA_VERSION}, got {actual_version}"
            );
            return Err(InitializationError);
        }

        // t_processed_event
        execute(&conn, CREATE_TABLE_T_PROCESSED_EVENT, [])?;
        execute(&conn, IDX_T_PROCESSED_EVENT_RECORDED_AT, [])?;
        // t_document
        execute(&conn, CREATE_TABLE_T_DOCUMENT, [])?;
        // t_failure
        execute(&conn, CREATE_TABLE_T_FAILURE, [])?;
        execute(&conn, IDX_T_FAILURE_OCCURRED_AT, [])?;
        // t_invocation_sample
        execute(&conn, CREATE_TABLE_T_INVOCATION_SAMPLE, [])?;
        execute(&conn, IDX_T_INVOCATION_SAMPLE_WINDOW_END, [])?;
        // t_alert
        execute(&conn, CREATE_TABLE_T_ALERT, [])?;
        execute(&conn, IDX_T_ALERT_CREATED_AT, [])?;
        Ok(conn)
    }

    fn connection_rpc(
        mut conn: Connection,
        shutdown_requested: &AtomicBool,
        shutdown_finished: &AtomicBool,
        mut command_rx: mpsc::Receiver<ThreadCommand>,
        queue_capacity: usize,
        low_prio_threshold: usize,
        metrics_threshold: Option<Duration>,
    ) {
        let mut vec: Vec<ThreadCommand> = Vec::with_capacity(queue_capacity);
        let mut histograms = Histograms::new(metrics_threshold);
        let mut metrics_instant = std::time::Instant::now();
        loop {
            vec.clear();
            if let Some(item) = command_rx.blocking_recv() {
                vec.push(item);
            } else {
                debug!("command_rx was closed");
                break;
            }
            while let Ok(more) = command_rx.try_recv() {
                vec.push(more);
            }
            // Did we receive Shutdown in the batch?
            let shutdown_found = vec
                .iter()
                .any(|item| matches!(item, ThreadCommand::Shutdown));
            if shutdown_found || shutdown_requested.load(Ordering::Acquire) {
                debug!("Received shutdown before processing the batch");
                break;
            }

            let mut execute = |expected: CommandPriority| {
                let mut processed = 0;
                for item in &mut vec {
                    if matches!(item, ThreadCommand::Func { priority, .. } if *priority == expected)
                    {
                        // get owned item
                        let ThreadCommand::Func {
                            func,
                            sent_at,
                            name,
                            ..
                        } = std::mem::replace(item, ThreadCommand::Dummy)
                        else {
                            unreachable!("checked above")
                        };
                        let sent_latency = sent_at.elapsed();
                        let started_at = Instant::now();
                        func(&mut conn);
                        histograms.record(sent_latency, name, started_at.elapsed());
                        processed += 1;
                    }
                    if shutdown_requested.load(Ordering::Acquire) {
                        // recheck after every function
                        debug!("Received shutdown during processing of the batch");
                        break;
                    }
                }
                processed
            };
            let processed = execute(CommandPriority::High) + execute(CommandPriority::Medium);
            if processed < low_prio_threshold {
                execute(CommandPriority::Low);
            }
            histograms.log_if_elapsed(&mut metrics_instant);
        } // Loop until shutdown is set to true.
        debug!("Closing command thread");
        shutdown_finished.store(true, Ordering::Release);
    }

    #[instrument(level = Level::DEBUG, skip_all, name = "sqlite_new")]
    pub async fn new<P: AsRef<Path>>(
        path: P,
        config: SqliteConfig,
    ) -> Result<Self, InitializationError> {
        let path = path.as_ref().to_owned();

        let shutdown_requested = Arc::new(AtomicBool::new(false));
        let shutdown_finished = Arc::new(AtomicBool::new(false));

        let (command_tx, command_rx) = tokio::sync::mpsc::channel(config.queue_capacity);
        info!("Sqlite database location: {path:?}");
        let join_handle = {
            // Initialize the `Connection`.
            let init_task = tokio::task::spawn_blocking(move || {
                Self::init_thread(&path, config.pragma_override.unwrap_or_default())
            })
            .await;
            let conn = match init_task {
                Ok(res) => res?,
                Err(join_err) => {
                    error!("Initialization panic - {join_err:?}");
                    return Err(InitializationError);
                }
            };
            let shutdown_requested = shutdown_requested.clone();
            let shutdown_finished = shutdown_finished.clone();
            // Start the RPC thread.
            std::thread::spawn(move || {
                Self::connection_rpc(
                    conn,
                    &shutdown_requested,
                    &shutdown_finished,
                    command_rx,
                    config.queue_capacity,
                    config.low_prio_threshold,
                    config.metrics_threshold,
                );
            })
        };
        Ok(SqlitePool(SqlitePoolInner {
            shutdown_requested,
            shutdown_finished,
            command_tx,
            change_subscribers: Arc::default(),
            join_handle: Some(Arc::new(join_handle)),
        }))
    }

    #[instrument(level = Level::TRACE, skip_all, fields(name))]
    pub async fn transaction_write<F, T, E>(
        &self,
        func: F,
        name: &'static str,
    ) -> Result<Result<T, E>, DbErrorGeneric /* only close variant */>
    where
        F: FnOnce(&mut rusqlite::Transaction) -> Result<T, E> + Send + 'static,
        T: Send + 'static,
        E: From<DbErrorGeneric> + Send + 'static,
    {
        self.transaction(func, true, name, None).await
    }

    #[instrument(level = Level::TRACE, skip_all, fields(name))]
    pub async fn transaction_read<F, T, E>(
        &self,
        func: F,
        name: &'static str,
    ) -> Result<Result<T, E>, DbErrorGeneric /* only close variant */>
    where
        F: FnOnce(&mut rusqlite::Transaction) -> Result<T, E> + Send + 'static,
        T: Send + 'static,
        E: From<DbErrorGeneric> + Send + 'static,
    {
        self.transaction(func, false, name, None).await
    }

    /// Write transaction producing a [`ChangeRecord`]. Subscribers are notified on the
    /// command thread right after the commit, so the feed follows the commit order.
    #[instrument(level = Level::TRACE, skip_all, fields(name))]
    async fn transaction_write_change<F>(
        &self,
        func: F,
        name: &'static str,
    ) -> Result<ChangeId, DbErrorWrite>
    where
        F: FnOnce(&mut rusqlite::Transaction) -> Result<ChangeRecord, DbErrorWrite>
            + Send
            + 'static,
    {
        let subscribers = self.0.change_subscribers.clone();
        let notify: OnCommit<ChangeRecord> = Box::new(move |change: &ChangeRecord| {
            subscribers
                .lock()
                .unwrap()
                .retain(|sender| sender.send(change.clone()).is_ok());
        });
        let change = self.transaction(func, true, name, Some(notify)).await??;
        Ok(change.change_id)
    }

    /// Invokes the provided function wrapping a new [`rusqlite::Transaction`] that is committed automatically.
    async fn transaction<F, T, E>(
        &self,
        func: F,
        write: bool,
        name: &'static str,
        on_commit: Option<OnCommit<T>>,
    ) -> Result<Result<T, E>, DbErrorGeneric /* only close variant */>
    where
        F: FnOnce(&mut rusqlite::Transaction) -> Result<T, E> + Send + 'static,
        T: Send + 'static,
        E: From<DbErrorGeneric> + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let parent_span = Span::current();

        self.0
            .command_tx
            .send(ThreadCommand::Func {
                priority: if write {
                    CommandPriority::High
                } else {
                    CommandPriority::Medium
                },
                func: Box::new(move |conn| {
                    let tx_begin =
                        debug_span!(parent: &parent_span, "tx_begin", name).in_scope(|| {
                            conn.transaction_with_behavior(if write {
                                rusqlite::TransactionBehavior::Immediate
                            } else {
                                rusqlite::TransactionBehavior::Deferred
                            })
                            .map_err(result_err_generic)
                            .map_err(E::from)
                        });
                    let tx_apply = tx_begin.and_then(|mut transaction| {
                        parent_span.in_scope(|| func(&mut transaction).map(|ok| (ok, transaction)))
                    });
                    let tx_commit = tx_apply.and_then(|(ok, transaction)| {
                        debug_span!(parent: &parent_span, "tx_commit", name).in_scope(|| {
                            transaction
                                .commit()
                                .map(|()| ok)
                                .map_err(result_err_generic)
                                .map_err(E::from)
                        })
                    });
                    if let (Ok(ok), Some(on_commit)) = (&tx_commit, on_commit) {
                        on_commit(ok);
                    }
                    // The receiver is gone only if the caller was cancelled.
                    let _ = tx.send(tx_commit);
                }),
                sent_at: Instant::now(),
                name,
            })
            .await
            .map_err(|_send_err| DbErrorGeneric::Close)?;
        rx.await.map_err(|_recv_err| DbErrorGeneric::Close)
    }

    #[instrument(level = Level::TRACE, skip_all, fields(name))]
    pub async fn conn_low_prio<F, T>(
        &self,
        func: F,
        name: &'static str,
    ) -> Result<T, DbErrorGeneric>
    where
        F: FnOnce(&Connection) -> Result<T, DbErrorGeneric> + Send + 'static,
        T: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let span = tracing::trace_span!("tx_function");
        self.0
            .command_tx
            .send(ThreadCommand::Func {
                priority: CommandPriority::Low,
                func: Box::new(move |conn| {
                    let _ = tx.send(span.in_scope(|| func(conn)));
                }),
                sent_at: Instant::now(),
                name,
            })
            .await
            .map_err(|_send_err| DbErrorGeneric::Close)?;
        match rx.await {
            Ok(res) => res,
            // Dropped by the command thread in favor of higher priorities.
            Err(_recv_err) => Err(DbErrorGeneric::Uncategorized(
                format!("`{name}` was skipped, the database is busy").into(),
            )),
        }
    }

    fn fetch_document(
        tx: &Transaction,
        path: &DocumentPath,
    ) -> Result<Option<Document>, DbErrorGeneric> {
        tx.prepare_cached("SELECT json_value FROM t_document WHERE path = :path")
            .map_err(prepare_err_generic)?
            .query_row(named_params! {":path": path}, |row| {
                row.get::<_, JsonWrapper<Document>>("json_value")
            })
            .optional()
            .map(|opt| opt.map(|wrapper| wrapper.0))
            .map_err(result_err_generic)
    }

    /// Persist the new state of the document and build the change record.
    fn write_document(
        tx: &Transaction,
        path: DocumentPath,
        before: Option<Document>,
        after: Option<Document>,
        committed_at: DateTime<Utc>,
    ) -> Result<ChangeRecord, DbErrorWrite> {
        if let Some(after) = &after {
            let json_value = serde_json::to_string(after).map_err(DbErrorGeneric::from)?;
            tx.prepare_cached(
                r"
                INSERT INTO t_document (path, json_value, updated_at)
                VALUES (:path, :json_value, :updated_at)
                ON CONFLICT(path) DO UPDATE SET
                    json_value = excluded.json_value,
                    updated_at = excluded.updated_at
                ",
            )
            .map_err(prepare_err_generic)?
            .execute(named_params! {
                ":path": path,
                ":json_value": json_value,
                ":updated_at": committed_at,
            })
            .map_err(result_err_generic)?;
        } else {
            tx.prepare_cached("DELETE FROM t_document WHERE path = :path")
                .map_err(prepare_err_generic)?
                .execute(named_params! {":path": path})
                .map_err(result_err_generic)?;
        }
        let change = ChangeRecord {
            change_id: ChangeId::generate(),
            document_path: path,
            before: before.map(Arc::new),
            after: after.map(Arc::new),
            committed_at,
        };
        trace!(change_id = %change.change_id, "Document written");
        Ok(change)
    }
}

#[async_trait]
impl EventLedger for SqlitePool {
    #[instrument(level = Level::DEBUG, skip_all, fields(%event_id, %handler_name))]
    async fn record_if_new(
        &self,
        event_id: &EventId,
        handler_name: &HandlerName,
        recorded_at: DateTime<Utc>,
    ) -> Result<LedgerClaim, DbErrorWrite> {
        let event_id = event_id.clone();
        let handler_name = handler_name.clone();
        self.transaction_write(
            move |tx| {
                let inserted = tx
                    .prepare_cached(
                        r"
                        INSERT INTO t_processed_event (event_id, handler_name, recorded_at)
                        VALUES (:event_id, :handler_name, :recorded_at)
                        ON CONFLICT(event_id) DO NOTHING
                        ",
                    )
                    .map_err(prepare_err_generic)?
                    .execute(named_params! {
                        ":event_id": event_id,
                        ":handler_name": handler_name,
                        ":recorded_at": recorded_at,
                    })
                    .map_err(result_err_generic)?;
                Ok::<_, DbErrorWrite>(if inserted == 1 {
                    LedgerClaim::Claimed
                } else {
                    LedgerClaim::AlreadyClaimed
                })
            },
            "record_if_new",
        )
        .await?
    }

    #[instrument(level = Level::DEBUG, skip_all, fields(start = %window.start, end = %window.end))]
    async fn count_by_handler(
        &self,
        window: TimeWindow,
    ) -> Result<Vec<(HandlerName, u64)>, DbErrorGeneric> {
        self.transaction_read(
            move |tx| {
                tx.prepare_cached(
                    r"
                    SELECT handler_name, COUNT(*) AS count FROM t_processed_event
                    WHERE recorded_at >= :start AND recorded_at < :end
                    GROUP BY handler_name ORDER BY handler_name
                    ",
                )
                .map_err(prepare_err_generic)?
                .query_map(
                    named_params! {":start": window.start, ":end": window.end},
                    |row| {
                        Ok((
                            row.get::<_, HandlerName>("handler_name")?,
                            row.get::<_, u64>("count")?,
                        ))
                    },
                )
                .map_err(result_err_generic)?
                .collect::<Result<Vec<_>, _>>()
                .map_err(result_err_generic)
            },
            "count_by_handler",
        )
        .await?
    }

    #[instrument(level = Level::DEBUG, skip_all, fields(%cutoff, batch_size))]
    async fn purge_older_than(
        &self,
        cutoff: DateTime<Utc>,
        batch_size: u32,
    ) -> Result<u64, DbErrorGeneric> {
        self.conn_low_prio(
            move |conn| {
                let deleted = conn
                    .prepare_cached(
                        r"
                        DELETE FROM t_processed_event WHERE rowid IN (
                            SELECT rowid FROM t_processed_event WHERE recorded_at < :cutoff LIMIT :batch_size
                        )
                        ",
                    )
                    .map_err(prepare_err_generic)?
                    .execute(named_params! {":cutoff": cutoff, ":batch_size": batch_size})
                    .map_err(result_err_generic)?;
                Ok(deleted as u64)
            },
            "purge_older_than",
        )
        .await
    }

    async fn get_entry(&self, event_id: &EventId) -> Result<LedgerEntry, DbErrorRead> {
        let event_id = event_id.clone();
        self.transaction_read(
            move |tx| {
                tx.prepare_cached(
                    "SELECT handler_name, recorded_at FROM t_processed_event WHERE event_id = :event_id",
                )
                .map_err(prepare_err_generic)?
                .query_row(named_params! {":event_id": event_id}, |row| {
                    Ok(LedgerEntry {
                        event_id: event_id.clone(),
                        handler_name: row.get("handler_name")?,
                        recorded_at: row.get("recorded_at")?,
                    })
                })
                .map_err(result_err_read)
            },
            "get_entry",
        )
        .await?
    }
}

#[async_trait]
impl DocumentStore for SqlitePool {
    async fn get(&self, path: &DocumentPath) -> Result<Document, DbErrorRead> {
        let path = path.clone();
        self.transaction_read(
            move |tx| Self::fetch_document(tx, &path)?.ok_or(DbErrorRead::NotFound),
            "get_document",
        )
        .await?
    }

    #[instrument(level = Level::DEBUG, skip_all, fields(%path))]
    async fn create(
        &self,
        path: &DocumentPath,
        document: Document,
        created_at: DateTime<Utc>,
    ) -> Result<ChangeId, DbErrorWrite> {
        let path = path.clone();
        self.transaction_write_change(
            move |tx| {
                if Self::fetch_document(tx, &path)?.is_some() {
                    return Err(DbErrorWrite::AlreadyExists);
                }
                Self::write_document(tx, path, None, Some(document), created_at)
            },
            "create_document",
        )
        .await
    }

    #[instrument(level = Level::DEBUG, skip_all, fields(%path))]
    async fn update(
        &self,
        path: &DocumentPath,
        update: DocumentUpdate,
        updated_at: DateTime<Utc>,
    ) -> Result<ChangeId, DbErrorWrite> {
        let path = path.clone();
        self.transaction_write_change(
            move |tx| {
                let before = Self::fetch_document(tx, &path)?;
                let mut after = before.clone().unwrap_or_default();
                update.apply_to(&mut after);
                Self::write_document(tx, path, before, Some(after), updated_at)
            },
            "update_document",
        )
        .await
    }

    #[instrument(level = Level::DEBUG, skip_all, fields(%path))]
    async fn delete(
        &self,
        path: &DocumentPath,
        deleted_at: DateTime<Utc>,
    ) -> Result<ChangeId, DbErrorWrite> {
        let path = path.clone();
        self.transaction_write_change(
            move |tx| {
                let Some(before) = Self::fetch_document(tx, &path)? else {
                    return Err(DbErrorWrite::NotFound);
                };
                Self::write_document(tx, path, Some(before), None, deleted_at)
            },
            "delete_document",
        )
        .await
    }

    fn subscribe(&self) -> mpsc::UnboundedReceiver<ChangeRecord> {
        let (sender, receiver) = mpsc::unbounded_channel();
        self.0.change_subscribers.lock().unwrap().push(sender);
        receiver
    }
}

#[async_trait]
impl ErrorSink for SqlitePool {
    #[instrument(level = Level::DEBUG, skip_all, fields(handler_name = %failure.handler_name, event_id = %failure.event_id))]
    async fn append_failure(&self, failure: FailureRecord) -> Result<(), DbErrorWrite> {
        self.transaction_write(
            move |tx| {
                tx.prepare_cached(
                    r"
                    INSERT INTO t_failure (handler_name, event_id, document_path, error, occurred_at)
                    VALUES (:handler_name, :event_id, :document_path, :error, :occurred_at)
                    ",
                )
                .map_err(prepare_err_generic)?
                .execute(named_params! {
                    ":handler_name": failure.handler_name,
                    ":event_id": failure.event_id,
                    ":document_path": failure.document_path,
                    ":error": failure.error,
                    ":occurred_at": failure.occurred_at,
                })
                .map_err(result_err_generic)?;
                Ok::<_, DbErrorWrite>(())
            },
            "append_failure",
        )
        .await?
    }

    async fn list_failures(
        &self,
        handler_name: Option<&HandlerName>,
        window: TimeWindow,
    ) -> Result<Vec<FailureRecord>, DbErrorGeneric> {
        let handler_name = handler_name.cloned();
        self.transaction_read(
            move |tx| {
                tx.prepare_cached(
                    r"
                    SELECT handler_name, event_id, document_path, error, occurred_at FROM t_failure
                    WHERE occurred_at >= :start AND occurred_at < :end
                    AND (:handler_name IS NULL OR handler_name = :handler_name)
                    ORDER BY id
                    ",
                )
                .map_err(prepare_err_generic)?
                .query_map(
                    named_params! {
                        ":start": window.start,
                        ":end": window.end,
                        ":handler_name": handler_name,
                    },
                    |row| {
                        Ok(FailureRecord {
                            handler_name: row.get("handler_name")?,
                            event_id: row.get("event_id")?,
                            document_path: row.get("document_path")?,
                            error: row.get("error")?,
                            occurred_at: row.get("occurred_at")?,
                        })
                    },
                )
                .map_err(result_err_generic)?
                .collect::<Result<Vec<_>, _>>()
                .map_err(result_err_generic)
            },
            "list_failures",
        )
        .await?
    }
}

#[async_trait]
impl MonitorStore for SqlitePool {
    #[instrument(level = Level::DEBUG, skip_all, fields(len = samples.len()))]
    async fn append_samples(
        &self,
        samples: Vec<InvocationCountSample>,
    ) -> Result<(), DbErrorWrite> {
        self.transaction_write(
            move |tx| {
                let mut stmt = tx
                    .prepare_cached(
                        r"
                        INSERT INTO t_invocation_sample (handler_name, window_start, window_end, count)
                        VALUES (:handler_name, :window_start, :window_end, :count)
                        ",
                    )
                    .map_err(prepare_err_generic)?;
                for sample in samples {
                    stmt.execute(named_params! {
                        ":handler_name": sample.handler_name,
                        ":window_start": sample.window_start,
                        ":window_end": sample.window_end,
                        ":count": sample.count,
                    })
                    .map_err(result_err_generic)?;
                }
                Ok::<_, DbErrorWrite>(())
            },
            "append_samples",
        )
        .await?
    }

    async fn list_samples(
        &self,
        handler_name: Option<&HandlerName>,
        window: TimeWindow,
    ) -> Result<Vec<InvocationCountSample>, DbErrorGeneric> {
        let handler_name = handler_name.cloned();
        self.transaction_read(
            move |tx| {
                tx.prepare_cached(
                    r"
                    SELECT handler_name, window_start, window_end, count FROM t_invocation_sample
                    WHERE window_end >= :start AND window_end < :end
                    AND (:handler_name IS NULL OR handler_name = :handler_name)
                    ORDER BY id
                    ",
                )
                .map_err(prepare_err_generic)?
                .query_map(
                    named_params! {
                        ":start": window.start,
                        ":end": window.end,
                        ":handler_name": handler_name,
                    },
                    |row| {
                        Ok(InvocationCountSample {
                            handler_name: row.get("handler_name")?,
                            window_start: row.get("window_start")?,
                            window_end: row.get("window_end")?,
                            count: row.get("count")?,
                        })
                    },
                )
                .map_err(result_err_generic)?
                .collect::<Result<Vec<_>, _>>()
                .map_err(result_err_generic)
            },
            "list_samples",
        )
        .await?
    }

    #[instrument(level = Level::DEBUG, skip_all, fields(len = alerts.len()))]
    async fn append_alerts(&self, alerts: Vec<AlertRecord>) -> Result<(), DbErrorWrite> {
        self.transaction_write(
            move |tx| {
                let mut stmt = tx
                    .prepare_cached(
                        r"
                        INSERT INTO t_alert (created_at, handler_name, count, threshold)
                        VALUES (:created_at, :handler_name, :count, :threshold)
                        ",
                    )
                    .map_err(prepare_err_generic)?;
                for alert in alerts {
                    stmt.execute(named_params! {
                        ":created_at": alert.created_at,
                        ":handler_name": alert.handler_name,
                        ":count": alert.count,
                        ":threshold": alert.threshold,
                    })
                    .map_err(result_err_generic)?;
                }
                Ok::<_, DbErrorWrite>(())
            },
            "append_alerts",
        )
        .await?
    }

    async fn list_alerts(&self, window: TimeWindow) -> Result<Vec<AlertRecord>, DbErrorGeneric> {
        self.transaction_read(
            move |tx| {
                tx.prepare_cached(
                    r"
                    SELECT created_at, handler_name, count, threshold FROM t_alert
                    WHERE created_at >= :start AND created_at < :end
                    ORDER BY id
                    ",
                )
                .map_err(prepare_err_generic)?
                .query_map(
                    named_params! {":start": window.start, ":end": window.end},
                    |row| {
                        Ok(AlertRecord {
                            created_at: row.get("created_at")?,
                            handler_name: row.get("handler_name")?,
                            count: row.get("count")?,
                            threshold: row.get("threshold")?,
                        })
                    },
                )
                .map_err(result_err_generic)?
                .collect::<Result<Vec<_>, _>>()
                .map_err(result_err_generic)
            },
            "list_alerts",
        )
        .await?
    }
}

#[cfg(any(test, feature = "tempfile"))]
pub mod tempfile {
    use super::{SqliteConfig, SqlitePool};
    use tempfile::NamedTempFile;

    pub async fn sqlite_pool() -> (SqlitePool, Option<NamedTempFile>) {
        if let Ok(path) = std::env::var("SQLITE_FILE") {
            (
                SqlitePool::new(path, SqliteConfig::default())
                    .await
                    .unwrap(),
                None,
            )
        } else {
            let file = NamedTempFile::new().unwrap();
            let path = file.path();
            (
                SqlitePool::new(path, SqliteConfig::default())
                    .await
                    .unwrap(),
                Some(file),
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[tokio::test]
    async fn reopening_keeps_the_ledger() {
        let file = ::tempfile::NamedTempFile::new().unwrap();
        let event_id = EventId::new("chg_1.h");
        let handler_name = HandlerName::from("h");
        {
            let pool = SqlitePool::new(file.path(), SqliteConfig::default())
                .await
                .unwrap();
            let claim = pool
                .record_if_new(&event_id, &handler_name, Utc::now())
                .await
                .unwrap();
            assert_eq!(LedgerClaim::Claimed, claim);
            pool.close().await;
        }
        let pool = SqlitePool::new(file.path(), SqliteConfig::default())
            .await
            .unwrap();
        let claim = pool
            .record_if_new(&event_id, &handler_name, Utc::now())
            .await
            .unwrap();
        assert_eq!(LedgerClaim::AlreadyClaimed, claim);
        pool.close().await;
    }

    #[tokio::test]
    async fn monitor_counts_are_not_starved_by_writes() {
        let file = ::tempfile::NamedTempFile::new().unwrap();
        // Low priority commands are never executed.
        let pool = SqlitePool::new(
            file.path(),
            SqliteConfig {
                low_prio_threshold: 0,
                ..SqliteConfig::default()
            },
        )
        .await
        .unwrap();
        let handler_name = HandlerName::from("h");
        let recorded_at = Utc::now();
        for idx in 0..3 {
            pool.record_if_new(&EventId::new(format!("chg_{idx}.h")), &handler_name, recorded_at)
                .await
                .unwrap();
        }
        let window = TimeWindow {
            start: DateTime::UNIX_EPOCH,
            end: recorded_at + chrono::TimeDelta::seconds(1),
        };
        assert_eq!(
            vec![(handler_name, 3)],
            pool.count_by_handler(window).await.unwrap()
        );

        let res = pool.purge_older_than(window.end, 10).await;
        assert_matches!(res, Err(DbErrorGeneric::Uncategorized(_)));
        pool.close().await;
    }

    #[tokio::test]
    async fn closed_pool_returns_close_error() {
        let (pool, _guard) = tempfile::sqlite_pool().await;
        pool.close().await;
        let res = pool.get(&"users/u1".parse().unwrap()).await;
        assert_matches!(res, Err(DbErrorRead::Generic(DbErrorGeneric::Close)));
    }
}
