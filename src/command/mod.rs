pub(crate) mod ledger;
pub(crate) mod monitor;
pub(crate) mod server;

use crate::config::config_holder::ConfigHolder;
use crate::config::toml::ConfigToml;
use crate::init;
use directories::{BaseDirs, ProjectDirs};
use std::path::PathBuf;

/// Load the configuration and install the tracing subscriber.
/// The returned guard must be kept alive until the command finishes.
pub(crate) async fn load_config_and_init(
    project_dirs: Option<ProjectDirs>,
    base_dirs: Option<BaseDirs>,
    config: Option<PathBuf>,
) -> Result<(ConfigToml, ConfigHolder, init::Guard), anyhow::Error> {
    let config_holder = ConfigHolder::new(project_dirs, base_dirs, config, true)?;
    let mut config = config_holder.load_config().await?;
    let log_directory = match &config.log.file {
        Some(file) => Some(
            config_holder
                .path_prefixes
                .replace_path_prefix_mkdir(&file.directory)
                .await?,
        ),
        None => None,
    };
    let guard = init::init(&mut config, log_directory.as_deref())?;
    Ok((config, config_holder, guard))
}
