use async_trait::async_trait;
use concepts::storage::{
    DbPool, DbPoolCloseable, DocumentStore, ErrorSink, EventLedger, MonitorStore,
};
use db_mem::inmemory_dao::InMemoryPool;
use db_sqlite::sqlite_dao::SqlitePool;
use std::sync::Arc;
use tempfile::NamedTempFile;

#[derive(Clone, Copy, Debug)]
pub enum Database {
    Memory,
    Sqlite,
}

pub enum DbGuard {
    Memory,
    Sqlite(Option<NamedTempFile>),
}

impl Database {
    pub async fn set_up(self) -> (DbGuard, DbPoolEnum) {
        match self {
            Database::Memory => (DbGuard::Memory, DbPoolEnum::Memory(InMemoryPool::new())),
            Database::Sqlite => {
                use db_sqlite::sqlite_dao::tempfile::sqlite_pool;
                let (db_pool, guard) = sqlite_pool().await;
                (DbGuard::Sqlite(guard), DbPoolEnum::Sqlite(db_pool))
            }
        }
    }
}

#[derive(Clone)]
pub enum DbPoolEnum {
    Memory(InMemoryPool),
    Sqlite(SqlitePool),
}

impl DbPool for DbPoolEnum {
    fn event_ledger(&self) -> Arc<dyn EventLedger> {
        match self {
            DbPoolEnum::Memory(pool) => pool.event_ledger(),
            DbPoolEnum::Sqlite(pool) => pool.event_ledger(),
        }
    }

    fn document_store(&self) -> Arc<dyn DocumentStore> {
        match self {
            DbPoolEnum::Memory(pool) => pool.document_store(),
            DbPoolEnum::Sqlite(pool) => pool.document_store(),
        }
    }

    fn error_sink(&self) -> Arc<dyn ErrorSink> {
        match self {
            DbPoolEnum::Memory(pool) => pool.error_sink(),
            DbPoolEnum::Sqlite(pool) => pool.error_sink(),
        }
    }

    fn monitor_store(&self) -> Arc<dyn MonitorStore> {
        match self {
            DbPoolEnum::Memory(pool) => pool.monitor_store(),
            DbPoolEnum::Sqlite(pool) => pool.monitor_store(),
        }
    }
}

#[async_trait]
impl DbPoolCloseable for DbPoolEnum {
    async fn close(&self) {
        match self {
            DbPoolEnum::Memory(pool) => pool.close().await,
            DbPoolEnum::Sqlite(pool) => pool.close().await,
        }
    }
}
