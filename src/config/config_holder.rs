use super::toml::ConfigToml;
use anyhow::{Context as _, bail};
use config::{ConfigBuilder, Environment, File, FileFormat, builder::AsyncState};
use directories::{BaseDirs, ProjectDirs};
use std::path::{Path, PathBuf};
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt as _;
use tracing::{info, warn};

const TRIPWIRE_HELP_TOML: &str = include_str!("../../tripwire-help.toml");
const TRIPWIRE_GEN_TOML: &str = include_str!("../../tripwire-generate.toml");
pub(crate) const DEFAULT_CONFIG_FILE: &str = "tripwire.toml";
const ENV_PREFIX: &str = "tripwire";

// Path prefixes
const HOME_DIR_PREFIX: &str = "~/";
pub(crate) const DATA_DIR_PREFIX: &str = "${DATA_DIR}/";
const CONFIG_DIR_PREFIX: &str = "${CONFIG_DIR}/";
const TRIPWIRE_TOML_DIR_PREFIX: &str = "${TRIPWIRE_TOML_DIR}/";
const TEMP_DIR_PREFIX: &str = "${TEMP_DIR}/";

pub(crate) struct PathPrefixes {
    pub(crate) tripwire_toml_dir: PathBuf,
    pub(crate) project_dirs: Option<ProjectDirs>,
    pub(crate) base_dirs: Option<BaseDirs>,
}

impl PathPrefixes {
    fn expand(&self, input_path: &str) -> PathBuf {
        if let Some(suffix) = input_path.strip_prefix(TRIPWIRE_TOML_DIR_PREFIX) {
            return self.tripwire_toml_dir.join(suffix);
        }
        if let Some(suffix) = input_path.strip_prefix(TEMP_DIR_PREFIX) {
            return std::env::temp_dir().join(suffix);
        }
        if let (Some(project_dirs), Some(base_dirs)) = (&self.project_dirs, &self.base_dirs) {
            if let Some(suffix) = input_path.strip_prefix(HOME_DIR_PREFIX) {
                base_dirs.home_dir().join(suffix)
            } else if let Some(suffix) = input_path.strip_prefix(DATA_DIR_PREFIX) {
                project_dirs.data_dir().join(suffix)
            } else if let Some(suffix) = input_path.strip_prefix(CONFIG_DIR_PREFIX) {
                project_dirs.config_dir().join(suffix)
            } else {
                PathBuf::from(input_path)
            }
        } else {
            if input_path.starts_with(HOME_DIR_PREFIX)
                || input_path.starts_with(DATA_DIR_PREFIX)
                || input_path.starts_with(CONFIG_DIR_PREFIX)
            {
                warn!("Not expanding prefix of `{input_path}`");
            }
            PathBuf::from(input_path)
        }
    }

    /// Expand the prefix of a file path and create its parent directory.
    pub(crate) async fn replace_file_prefix_mkdir_parent(
        &self,
        input_path: &str,
    ) -> Result<PathBuf, anyhow::Error> {
        let path = self.expand(input_path);
        if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("cannot create directory {parent:?}"))?;
        }
        Ok(path)
    }

    pub(crate) async fn replace_path_prefix_mkdir(
        &self,
        dir: &str,
    ) -> Result<PathBuf, anyhow::Error> {
        let path = self.expand(dir);
        tokio::fs::create_dir_all(&path)
            .await
            .with_context(|| format!("cannot create directory {path:?}"))?;
        Ok(path)
    }
}

pub(crate) struct ConfigHolder {
    tripwire_toml: Option<PathBuf>,
    pub(crate) path_prefixes: PathPrefixes,
}

impl ConfigHolder {
    pub(crate) async fn generate_default_config(
        dst: Option<PathBuf>,
        overwrite: bool,
    ) -> Result<(), anyhow::Error> {
        let contents = format!("{TRIPWIRE_HELP_TOML}\n{TRIPWIRE_GEN_TOML}");
        let dst = dst.unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE));

        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .create_new(!overwrite) // `create` is ignored when set
            .open(&dst)
            .await
            .with_context(|| {
                format!(
                    "cannot open {dst:?} for writing{}",
                    if !overwrite {
                        ", try using `--overwrite`"
                    } else {
                        ""
                    }
                )
            })?;
        file.write_all(contents.as_bytes())
            .await
            .with_context(|| format!("cannot write to {dst:?}"))?;
        println!("Generated {dst:?}");
        Ok(())
    }

    pub(crate) fn new(
        project_dirs: Option<ProjectDirs>,
        base_dirs: Option<BaseDirs>,
        config: Option<PathBuf>,
        allow_missing: bool,
    ) -> Result<Self, anyhow::Error> {
        let tripwire_toml = if let Some(config) = config {
            Some(config)
        } else {
            let local = PathBuf::from(DEFAULT_CONFIG_FILE);
            let exists = local.try_exists().unwrap_or_default();
            if !allow_missing && !exists {
                bail!("cannot find `{DEFAULT_CONFIG_FILE}` in current directory");
            }
            if exists {
                info!("Using configuration file {local:?}");
                Some(local)
            } else {
                None
            }
        };

        Ok(Self {
            path_prefixes: PathPrefixes {
                tripwire_toml_dir: match &tripwire_toml {
                    None => std::env::current_dir().context("failed to get CWD")?,
                    Some(tripwire_toml) => parent_dir(tripwire_toml)?,
                },
                project_dirs,
                base_dirs,
            },
            tripwire_toml,
        })
    }

    /// Merge the TOML file with `TRIPWIRE__`-prefixed environment variables,
    /// e.g. `TRIPWIRE__API__LISTENING_ADDR`.
    pub(crate) async fn load_config(&self) -> Result<ConfigToml, anyhow::Error> {
        let mut builder = ConfigBuilder::<AsyncState>::default();
        if let Some(tripwire_toml) = self.tripwire_toml.as_deref() {
            builder = builder.add_source(
                File::from(tripwire_toml)
                    .required(true)
                    .format(FileFormat::Toml),
            );
        }
        let settings = builder
            .add_source(Environment::with_prefix(ENV_PREFIX).separator("__"))
            .build()
            .await?;
        Ok(settings.try_deserialize()?)
    }
}

fn parent_dir(file: &Path) -> Result<PathBuf, anyhow::Error> {
    Ok(file
        .canonicalize()
        .with_context(|| format!("error while calling canonicalize on {file:?}"))?
        .parent()
        .with_context(|| format!("error getting parent path of {file:?}"))?
        .to_path_buf())
}
