use super::load_config_and_init;
use super::server::open_database;
use anyhow::Context as _;
use concepts::storage::{DbPool as _, DbPoolCloseable};
use concepts::time::{ClockFn as _, Now};
use directories::{BaseDirs, ProjectDirs};
use guard::ledger_retention;
use std::path::PathBuf;

/// Delete the expired ledger entries once, regardless of `retention.enabled`.
pub(crate) async fn purge(
    project_dirs: Option<ProjectDirs>,
    base_dirs: Option<BaseDirs>,
    config: Option<PathBuf>,
) -> Result<(), anyhow::Error> {
    let (config, config_holder, _guard) =
        load_config_and_init(project_dirs, base_dirs, config).await?;
    let retention = config.retention.as_config(Now);
    let cutoff = retention.cutoff(Now.now());
    let db_pool = open_database(&config.sqlite, &config_holder.path_prefixes).await?;
    let res = ledger_retention::purge(
        db_pool.event_ledger().as_ref(),
        cutoff,
        retention.batch_size,
    )
    .await;
    db_pool.close().await;
    let deleted = res.context("ledger purge failed")?;
    println!("Deleted {deleted} ledger entries recorded before {cutoff}");
    Ok(())
}
