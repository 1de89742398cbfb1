use super::load_config_and_init;
use crate::config::config_holder::{ConfigHolder, PathPrefixes};
use crate::config::toml::{ConfigToml, HandlersConfigToml, SqliteConfigToml};
use crate::server::web_api_server::{WebApiState, app_router};
use anyhow::{Context as _, bail};
use concepts::HandlerName;
use concepts::storage::{DbPool, DbPoolCloseable};
use concepts::time::Now;
use db_sqlite::sqlite_dao::{SqliteConfig, SqlitePool};
use directories::{BaseDirs, ProjectDirs};
use guard::TaskHandle;
use guard::dispatcher::{Dispatcher, DispatcherConfig};
use guard::handler::{Handler, HandlerDecl};
use guard::invocation_monitor::InvocationMonitor;
use guard::ledger_retention;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{Span, debug, info, info_span, instrument, warn};

pub(crate) async fn run(
    project_dirs: Option<ProjectDirs>,
    base_dirs: Option<BaseDirs>,
    config: Option<PathBuf>,
    clean_sqlite_file: bool,
) -> anyhow::Result<()> {
    let (config, config_holder, _guard) =
        load_config_and_init(project_dirs, base_dirs, config).await?;
    Box::pin(run_internal(config, &config_holder, clean_sqlite_file)).await
}

pub(crate) async fn verify(
    project_dirs: Option<ProjectDirs>,
    base_dirs: Option<BaseDirs>,
    config: Option<PathBuf>,
) -> Result<(), anyhow::Error> {
    let (config, config_holder, _guard) =
        load_config_and_init(project_dirs, base_dirs, config).await?;
    let verified = verify_internal(&config, &config_holder.path_prefixes, false).await?;
    for handler in &verified.handlers {
        let decl = handler.decl();
        info!(
            handler_name = %decl.name,
            pattern = %decl.pattern,
            watched_fields = ?decl.watched_fields,
            change_kinds = ?decl.change_kinds,
            "Handler registered"
        );
    }
    Ok(())
}

/// Instantiate the shipped handlers, minus the ones disabled in the configuration.
pub(crate) fn registered_handlers(
    config: &HandlersConfigToml,
) -> Result<Vec<Arc<dyn Handler>>, anyhow::Error> {
    let all = handlers::all().context("invalid handler declaration")?;
    let mut seen = hashbrown::HashSet::new();
    for handler in &all {
        let name = &handler.decl().name;
        if !seen.insert(name.clone()) {
            bail!("handler `{name}` is registered twice");
        }
    }
    for disabled in &config.disabled {
        if !seen.contains(disabled.as_str()) {
            bail!("cannot disable unknown handler `{disabled}`");
        }
    }
    Ok(all
        .into_iter()
        .filter(|handler| {
            let enabled = !config
                .disabled
                .iter()
                .any(|disabled| *handler.decl().name == **disabled);
            if !enabled {
                warn!("Handler `{}` is disabled", handler.decl().name);
            }
            enabled
        })
        .collect())
}

pub(crate) fn handler_names(handlers: &[Arc<dyn Handler>]) -> Vec<HandlerName> {
    handlers
        .iter()
        .map(|handler| handler.decl().name.clone())
        .collect()
}

pub(crate) async fn open_database(
    sqlite: &SqliteConfigToml,
    path_prefixes: &PathPrefixes,
) -> Result<SqlitePool, anyhow::Error> {
    let db_file = sqlite.get_sqlite_file(path_prefixes).await?;
    SqlitePool::new(&db_file, sqlite.as_config())
        .await
        .with_context(|| format!("cannot open sqlite file {db_file:?}"))
}

async fn remove_sqlite_files(db_file: &Path) -> Result<(), anyhow::Error> {
    let ignore_not_found = |err: std::io::Error| {
        if err.kind() == std::io::ErrorKind::NotFound {
            Ok(())
        } else {
            Err(err)
        }
    };
    let Some(db_file_name) = db_file.file_name() else {
        bail!("sqlite path {db_file:?} must point to a file");
    };
    let with_suffix = |suffix: &str| {
        let mut file_name = db_file_name.to_owned();
        file_name.push(suffix);
        db_file.with_file_name(file_name)
    };
    for file in [db_file.to_path_buf(), with_suffix("-wal"), with_suffix("-shm")] {
        tokio::fs::remove_file(&file)
            .await
            .or_else(ignore_not_found)
            .with_context(|| format!("cannot delete database file {file:?}"))?;
    }
    Ok(())
}

struct ServerVerified {
    handlers: Vec<Arc<dyn Handler>>,
    db_file: PathBuf,
    sqlite_config: SqliteConfig,
}

#[instrument(skip_all, name = "verify")]
async fn verify_internal(
    config: &ConfigToml,
    path_prefixes: &PathPrefixes,
    clean_sqlite_file: bool,
) -> Result<ServerVerified, anyhow::Error> {
    debug!("Using toml config: {config:#?}");
    let handlers = registered_handlers(&config.handlers)?;
    if handlers.is_empty() {
        warn!("All handlers are disabled");
    }
    let db_file = config.sqlite.get_sqlite_file(path_prefixes).await?;
    if clean_sqlite_file {
        remove_sqlite_files(&db_file).await?;
    }
    info!("Server configuration was verified");
    Ok(ServerVerified {
        handlers,
        db_file,
        sqlite_config: config.sqlite.as_config(),
    })
}

async fn run_internal(
    config: ConfigToml,
    config_holder: &ConfigHolder,
    clean_sqlite_file: bool,
) -> anyhow::Result<()> {
    let verified =
        verify_internal(&config, &config_holder.path_prefixes, clean_sqlite_file).await?;
    let init = ServerInit::spawn(verified, &config).await?;

    let res = if config.api.enabled {
        let api_listening_addr = config.api.listening_addr;
        let listener = tokio::net::TcpListener::bind(api_listening_addr)
            .await
            .with_context(|| format!("cannot bind to {api_listening_addr}"))?;
        let app = app_router(init.web_api_state()).layer(
            tower::ServiceBuilder::new()
                .layer(tower_http::trace::TraceLayer::new_for_http().make_span_with(make_span)),
        );
        info!("Serving HTTP requests at {api_listening_addr}");
        axum::serve(listener, app)
            .with_graceful_shutdown(wait_for_sigint())
            .await
            .with_context(|| format!("http server error listening on {api_listening_addr}"))
    } else {
        wait_for_sigint().await;
        Ok(())
    };
    init.close().await;
    res
}

async fn wait_for_sigint() {
    tokio::signal::ctrl_c()
        .await
        .expect("failed to listen for SIGINT event");
    warn!("Received SIGINT, shutting down");
}

fn make_span<B>(request: &axum::http::Request<B>) -> Span {
    info_span!("incoming HTTP request", method = %request.method(), uri = %request.uri())
}

struct ServerInit {
    db_pool: SqlitePool,
    handler_decls: Arc<[HandlerDecl]>,
    dispatcher: TaskHandle,
    monitor: Option<TaskHandle>,
    retention: Option<TaskHandle>,
}

impl ServerInit {
    async fn spawn(verified: ServerVerified, config: &ConfigToml) -> Result<Self, anyhow::Error> {
        let db_pool = SqlitePool::new(&verified.db_file, verified.sqlite_config)
            .await
            .with_context(|| format!("cannot open sqlite file {:?}", verified.db_file))?;
        let names = handler_names(&verified.handlers);
        let handler_decls = verified
            .handlers
            .iter()
            .map(|handler| handler.decl().clone())
            .collect();

        let dispatcher = Arc::new(Dispatcher::new(verified.handlers, &db_pool, Now)).spawn_new(
            DispatcherConfig {
                task_limiter: (&config.dispatcher.max_inflight).into(),
            },
        );
        let monitor = config.monitor.enabled.then(|| {
            InvocationMonitor::new(&db_pool, config.monitor.as_config(&names, Now), Vec::new())
                .spawn_new()
        });
        let retention = config.retention.enabled.then(|| {
            ledger_retention::spawn_new(db_pool.event_ledger(), config.retention.as_config(Now))
        });
        Ok(Self {
            db_pool,
            handler_decls,
            dispatcher,
            monitor,
            retention,
        })
    }

    fn web_api_state(&self) -> WebApiState {
        WebApiState {
            db_pool: Arc::new(self.db_pool.clone()),
            handler_decls: self.handler_decls.clone(),
        }
    }

    async fn close(self) {
        info!("Server is shutting down");
        self.dispatcher.close().await;
        for handle in [self.monitor, self.retention].into_iter().flatten() {
            handle.close().await;
        }
        self.db_pool.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn all_handlers_are_registered_by_default() {
        let handlers = registered_handlers(&HandlersConfigToml::default()).unwrap();
        assert_eq!(4, handlers.len());
    }

    #[test]
    fn disabled_handler_is_filtered_out() {
        let handlers = registered_handlers(&HandlersConfigToml {
            disabled: vec![handlers::activity_logger::NAME.to_string()],
        })
        .unwrap();
        let names = handler_names(&handlers);
        assert_eq!(3, names.len());
        assert!(
            !names
                .iter()
                .any(|name| &**name == handlers::activity_logger::NAME)
        );
    }

    #[test]
    fn disabling_unknown_handler_fails() {
        let err = registered_handlers(&HandlersConfigToml {
            disabled: vec!["noSuchHandler".to_string()],
        })
        .err()
        .unwrap();
        assert!(err.to_string().contains("noSuchHandler"), "{err}");
    }

    #[tokio::test]
    async fn clean_removes_database_and_journal_files() {
        let tmp = tempfile::tempdir().unwrap();
        let db_file = tmp.path().join("tripwire.sqlite");
        for name in ["tripwire.sqlite", "tripwire.sqlite-wal"] {
            tokio::fs::write(tmp.path().join(name), b"x").await.unwrap();
        }
        remove_sqlite_files(&db_file).await.unwrap();
        assert!(!db_file.exists());
        assert!(!tmp.path().join("tripwire.sqlite-wal").exists());
        // Missing files are not an error.
        remove_sqlite_files(&db_file).await.unwrap();
    }
}
