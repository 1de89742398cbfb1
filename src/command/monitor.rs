use super::load_config_and_init;
use super::server::{handler_names, open_database, registered_handlers};
use anyhow::Context as _;
use concepts::storage::DbPoolCloseable;
use concepts::time::{ClockFn as _, Now};
use directories::{BaseDirs, ProjectDirs};
use guard::invocation_monitor::InvocationMonitor;
use std::path::PathBuf;

/// Run one sweep against the configured database and print the alerts to stdout.
pub(crate) async fn sweep(
    project_dirs: Option<ProjectDirs>,
    base_dirs: Option<BaseDirs>,
    config: Option<PathBuf>,
) -> Result<(), anyhow::Error> {
    let (config, config_holder, _guard) =
        load_config_and_init(project_dirs, base_dirs, config).await?;
    let names = handler_names(&registered_handlers(&config.handlers)?);
    let db_pool = open_database(&config.sqlite, &config_holder.path_prefixes).await?;
    let monitor =
        InvocationMonitor::new(&db_pool, config.monitor.as_config(&names, Now), Vec::new());
    let res = monitor.sweep(Now.now()).await;
    db_pool.close().await;
    let alerts = res.context("invocation count sweep failed")?;
    println!("{}", serde_json::to_string_pretty(&alerts)?);
    Ok(())
}
